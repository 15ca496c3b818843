//! Wire protocol for the session daemon.
//!
//! Every message on the socket is a 5-byte header (1-byte kind plus a
//! 4-byte little-endian payload length) followed by the payload. All
//! multi-byte integers are little-endian; strings are a 2-byte length
//! prefix followed by UTF-8 bytes.
//!
//! This module defines the message kinds, error codes, capability bits,
//! protocol constants, and the bounded payload reader/writer. Typed
//! payloads live in [`message`].

pub mod message;

use bytes::{BufMut, Bytes, BytesMut};

use crate::session_id::{SessionId, SESSION_ID_LEN};

/// Protocol version spoken by this daemon.
pub const PROTOCOL_VERSION: u8 = 1;

/// Header: 1 byte kind + 4 bytes little-endian payload length.
pub const HEADER_LEN: usize = 5;

/// Maximum payload size; anything larger is a fatal protocol error.
pub const MAX_PAYLOAD_SIZE: usize = 2 * 1024 * 1024;

/// Replay chunk size: each REPLAY_DATA frame carries at most this much.
pub const REPLAY_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum number of live sessions.
pub const MAX_SESSIONS: usize = 256;

/// Default scrollback ring capacity.
pub const DEFAULT_RING_CAPACITY: usize = 1024 * 1024;

/// Upper bound on the configurable ring capacity.
pub const MAX_RING_CAPACITY: usize = 64 * 1024 * 1024;

/// Message kinds, one byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum MessageKind {
    Create = 0x01,
    CreateOk = 0x02,
    Attach = 0x03,
    AttachOk = 0x04,
    ReplayData = 0x05,
    ReplayEnd = 0x06,
    Detach = 0x07,
    DetachOk = 0x08,
    Destroy = 0x09,
    DestroyOk = 0x0A,
    Resize = 0x0B,
    Input = 0x0C,
    Output = 0x0D,
    List = 0x0E,
    ListOk = 0x0F,
    Error = 0x10,
    SessionExited = 0x11,
    Hello = 0x12,
    HelloOk = 0x13,
    FgProcessQuery = 0x14,
    FgProcessInfo = 0x15,
    SendSignal = 0x16,
    SignalOk = 0x17,
    SetTermios = 0x18,
    FgProcessUpdate = 0x19,
    Ping = 0x1A,
    Pong = 0x1B,
}

impl MessageKind {
    /// Decodes a wire kind byte.
    #[must_use]
    pub const fn from_wire(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => Self::Create,
            0x02 => Self::CreateOk,
            0x03 => Self::Attach,
            0x04 => Self::AttachOk,
            0x05 => Self::ReplayData,
            0x06 => Self::ReplayEnd,
            0x07 => Self::Detach,
            0x08 => Self::DetachOk,
            0x09 => Self::Destroy,
            0x0A => Self::DestroyOk,
            0x0B => Self::Resize,
            0x0C => Self::Input,
            0x0D => Self::Output,
            0x0E => Self::List,
            0x0F => Self::ListOk,
            0x10 => Self::Error,
            0x11 => Self::SessionExited,
            0x12 => Self::Hello,
            0x13 => Self::HelloOk,
            0x14 => Self::FgProcessQuery,
            0x15 => Self::FgProcessInfo,
            0x16 => Self::SendSignal,
            0x17 => Self::SignalOk,
            0x18 => Self::SetTermios,
            0x19 => Self::FgProcessUpdate,
            0x1A => Self::Ping,
            0x1B => Self::Pong,
            _ => return None,
        })
    }
}

/// Error codes carried in the first byte of an ERROR payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ErrorCode {
    SessionNotFound = 0x01,
    SessionBusy = 0x02,
    OutOfMemory = 0x03,
    TooManySessions = 0x04,
    ProtocolError = 0x05,
    InvalidSessionId = 0x06,
    PermissionDenied = 0x07,
    ShellNotFound = 0x08,
    InternalError = 0x09,
}

impl ErrorCode {
    /// Decodes a wire error-code byte.
    #[must_use]
    pub const fn from_wire(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => Self::SessionNotFound,
            0x02 => Self::SessionBusy,
            0x03 => Self::OutOfMemory,
            0x04 => Self::TooManySessions,
            0x05 => Self::ProtocolError,
            0x06 => Self::InvalidSessionId,
            0x07 => Self::PermissionDenied,
            0x08 => Self::ShellNotFound,
            0x09 => Self::InternalError,
            _ => return None,
        })
    }
}

bitflags::bitflags! {
    /// Capability bits negotiated in the HELLO exchange.
    ///
    /// The daemon advertises [`Capabilities::all`] and the negotiated set
    /// is the intersection with the client's advertised bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// Termios state survives detach and is restored on attach.
        const PERSISTENT_TERMIOS = 1 << 0;
        /// Unsolicited foreground process-group change notifications.
        const FG_PROCESS_UPDATES = 1 << 1;
        /// SEND_SIGNAL forwarding to the shell process.
        const SIGNAL_FORWARDING = 1 << 2;
        /// Replay is delivered in bounded REPLAY_DATA chunks.
        const CHUNKED_REPLAY = 1 << 3;
    }
}

/// Malformed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Payload ended before the field being read.
    #[error("payload truncated")]
    Truncated,
    /// A length-prefixed string was not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    /// The leading 36 bytes were not a well-formed session id.
    #[error("malformed session id field")]
    BadSessionId,
}

/// Bounded cursor over a payload.
///
/// Every accessor checks the remaining length first, so malformed or
/// truncated payloads surface as [`WireError`] instead of a panic.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    /// Wraps a payload slice.
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() < n {
            return Err(WireError::Truncated);
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    /// Reads one byte.
    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    /// Reads a little-endian `u16`.
    pub fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Reads a little-endian `u32`.
    pub fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a little-endian `u64`.
    pub fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String, WireError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(ToOwned::to_owned)
            .map_err(|_| WireError::InvalidUtf8)
    }

    /// Reads a 36-byte session identifier.
    pub fn session_id(&mut self) -> Result<SessionId, WireError> {
        let raw = self.take(SESSION_ID_LEN)?;
        SessionId::from_wire(raw).map_err(|_| WireError::BadSessionId)
    }

    /// Consumes and returns all remaining bytes.
    #[must_use]
    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}

/// Payload builder over [`BytesMut`].
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    /// Creates an empty payload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a payload with a capacity hint.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Appends one byte.
    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    /// Appends a little-endian `u16`.
    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16_le(v);
        self
    }

    /// Appends a little-endian `u32`.
    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    /// Appends a little-endian `u64`.
    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    /// Appends a length-prefixed string.
    ///
    /// Strings longer than `u16::MAX` bytes are truncated at that bound;
    /// payload-level limits keep real fields far below it.
    pub fn string(&mut self, s: &str) -> &mut Self {
        let len = u16::try_from(s.len()).unwrap_or(u16::MAX);
        self.buf.put_u16_le(len);
        self.buf.put_slice(&s.as_bytes()[..len as usize]);
        self
    }

    /// Appends a session identifier (36 bytes, no length prefix).
    pub fn session_id(&mut self, id: &SessionId) -> &mut Self {
        self.buf.put_slice(id.as_bytes());
        self
    }

    /// Appends raw bytes.
    pub fn bytes(&mut self, raw: &[u8]) -> &mut Self {
        self.buf.put_slice(raw);
        self
    }

    /// Finishes the payload.
    #[must_use]
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}
