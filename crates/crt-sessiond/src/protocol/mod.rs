//! Socket-facing protocol plumbing.
//!
//! The protocol stack, bottom up:
//!
//! ```text
//! +------------------------------------------+
//! |          Typed payloads (crt-core)       |
//! +------------------------------------------+
//! |   Framing: kind byte + LE length prefix  |
//! +------------------------------------------+
//! |     Unix-domain stream, same-user only   |
//! +------------------------------------------+
//! ```
//!
//! - [`framing`]: the [`FrameCodec`] used with `tokio_util::codec`
//! - [`credentials`]: `SO_PEERCRED` peer authentication

pub mod credentials;
pub mod framing;

pub use credentials::PeerCredentials;
pub use framing::{Frame, FrameCodec, ProtocolError};
