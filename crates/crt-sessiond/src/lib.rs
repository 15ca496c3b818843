//! crt-sessiond - CRT Plus session daemon library
//!
//! A per-user pseudo-terminal session daemon. The daemon owns a collection
//! of shell sessions, each backed by a PTY master, a child shell, and a
//! scrollback ring, and exposes them to same-user clients over a
//! length-prefixed binary protocol on a Unix-domain socket. Clients come
//! and go; sessions persist and replay their scrollback on reattach.
//!
//! # Modules
//!
//! - [`protocol`]: frame codec and peer-credential authentication
//! - [`server`]: socket directory, listener, and PID file bring-up
//! - [`session`]: PTY lifecycle, shell spawning, environment scrubbing
//! - [`state`]: shared session/client tables, attachment, flow control,
//!   timers
//! - [`dispatch`]: per-message-kind protocol handlers
//! - [`pump`]: per-session PTY output pump
//! - [`daemon`]: runtime composition and teardown ordering

pub mod daemon;
pub mod dispatch;
pub(crate) mod fdutil;
pub mod protocol;
pub mod pump;
pub mod server;
pub mod session;
pub mod state;
