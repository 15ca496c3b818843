//! Typed message payloads.
//!
//! One struct per payload shape, each with an `encode` producing the raw
//! payload bytes and a `decode` that validates length and field contents.
//! Both directions are provided so the daemon and protocol clients (and
//! the test harness) share one definition of the wire layout.

use bytes::Bytes;

use super::{Capabilities, ErrorCode, PayloadReader, PayloadWriter, WireError};
use crate::session_id::SessionId;

/// HELLO: `version:u8, caps:u32, client_pid:u32`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Protocol version the client speaks.
    pub version: u8,
    /// Capability bits the client advertises (unknown bits preserved).
    pub caps: u32,
    /// PID the client claims; cross-checked against peer credentials.
    pub client_pid: u32,
}

impl Hello {
    /// Decodes a HELLO payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on a short payload.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            version: r.u8()?,
            caps: r.u32()?,
            client_pid: r.u32()?,
        })
    }

    /// Encodes the payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut w = PayloadWriter::with_capacity(9);
        w.u8(self.version).u32(self.caps).u32(self.client_pid);
        w.finish()
    }
}

/// HELLO_OK: `version:u8, caps:u32, daemon_pid:u32`.
///
/// `caps` carries the negotiated set, not the daemon's full set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloOk {
    /// Protocol version the daemon speaks.
    pub version: u8,
    /// Negotiated capability bits.
    pub caps: Capabilities,
    /// Daemon PID.
    pub daemon_pid: u32,
}

impl HelloOk {
    /// Decodes a HELLO_OK payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on a short payload.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            version: r.u8()?,
            caps: Capabilities::from_bits_truncate(r.u32()?),
            daemon_pid: r.u32()?,
        })
    }

    /// Encodes the payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut w = PayloadWriter::with_capacity(9);
        w.u8(self.version).u32(self.caps.bits()).u32(self.daemon_pid);
        w.finish()
    }
}

/// CREATE: shell, argv, environment, working directory, and geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Create {
    /// Shell program path.
    pub shell: String,
    /// Argument vector; empty means a default login-shell argv.
    pub args: Vec<String>,
    /// `KEY=VALUE` environment entries, sanitized by the daemon.
    pub env: Vec<String>,
    /// Initial working directory.
    pub cwd: String,
    /// Initial rows.
    pub rows: u16,
    /// Initial columns.
    pub cols: u16,
}

impl Create {
    /// Decodes a CREATE payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on truncation or a non-UTF-8 string field.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = PayloadReader::new(payload);
        let shell = r.string()?;

        let argc = r.u16()?;
        let mut args = Vec::with_capacity(usize::from(argc).min(64));
        for _ in 0..argc {
            args.push(r.string()?);
        }

        let envc = r.u16()?;
        let mut env = Vec::with_capacity(usize::from(envc).min(256));
        for _ in 0..envc {
            env.push(r.string()?);
        }

        let cwd = r.string()?;
        let rows = r.u16()?;
        let cols = r.u16()?;

        Ok(Self {
            shell,
            args,
            env,
            cwd,
            rows,
            cols,
        })
    }

    /// Encodes the payload.
    ///
    /// # Panics
    ///
    /// Panics if `args` or `env` hold more than `u16::MAX` entries.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut w = PayloadWriter::new();
        w.string(&self.shell);
        w.u16(u16::try_from(self.args.len()).expect("argc fits in u16"));
        for a in &self.args {
            w.string(a);
        }
        w.u16(u16::try_from(self.env.len()).expect("envc fits in u16"));
        for e in &self.env {
            w.string(e);
        }
        w.string(&self.cwd).u16(self.rows).u16(self.cols);
        w.finish()
    }
}

/// ATTACH_OK: `uuid[36], rows:u16, cols:u16, replay_size:u32`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOk {
    /// Attached session.
    pub id: SessionId,
    /// Current rows.
    pub rows: u16,
    /// Current columns.
    pub cols: u16,
    /// Bytes of scrollback about to be replayed (untrimmed ring size).
    pub replay_size: u32,
}

impl AttachOk {
    /// Decodes an ATTACH_OK payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on truncation or a malformed id.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            id: r.session_id()?,
            rows: r.u16()?,
            cols: r.u16()?,
            replay_size: r.u32()?,
        })
    }

    /// Encodes the payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut w = PayloadWriter::with_capacity(44);
        w.session_id(&self.id)
            .u16(self.rows)
            .u16(self.cols)
            .u32(self.replay_size);
        w.finish()
    }
}

/// RESIZE: `uuid[36], rows:u16, cols:u16`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resize {
    /// Target session.
    pub id: SessionId,
    /// New rows.
    pub rows: u16,
    /// New columns.
    pub cols: u16,
}

impl Resize {
    /// Decodes a RESIZE payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on truncation or a malformed id.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            id: r.session_id()?,
            rows: r.u16()?,
            cols: r.u16()?,
        })
    }

    /// Encodes the payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut w = PayloadWriter::with_capacity(40);
        w.session_id(&self.id).u16(self.rows).u16(self.cols);
        w.finish()
    }
}

/// SEND_SIGNAL: `uuid[36], signum:u32`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendSignal {
    /// Target session.
    pub id: SessionId,
    /// Signal number; validated against the platform signal range.
    pub signum: u32,
}

impl SendSignal {
    /// Decodes a SEND_SIGNAL payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on truncation or a malformed id.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            id: r.session_id()?,
            signum: r.u32()?,
        })
    }

    /// Encodes the payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut w = PayloadWriter::with_capacity(40);
        w.session_id(&self.id).u32(self.signum);
        w.finish()
    }
}

/// SET_TERMIOS: four flag words plus erase char, flow control, UTF-8 mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetTermios {
    /// Target session.
    pub id: SessionId,
    /// Input flags word.
    pub iflag: u32,
    /// Output flags word.
    pub oflag: u32,
    /// Control flags word.
    pub cflag: u32,
    /// Local flags word.
    pub lflag: u32,
    /// Erase character (VERASE).
    pub verase: u8,
    /// Enables `IXON|IXOFF` when non-zero.
    pub flow_control: u8,
    /// Enables `IUTF8` (where available) when non-zero.
    pub utf8: u8,
}

impl SetTermios {
    /// Decodes a SET_TERMIOS payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on truncation or a malformed id.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            id: r.session_id()?,
            iflag: r.u32()?,
            oflag: r.u32()?,
            cflag: r.u32()?,
            lflag: r.u32()?,
            verase: r.u8()?,
            flow_control: r.u8()?,
            utf8: r.u8()?,
        })
    }

    /// Encodes the payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut w = PayloadWriter::with_capacity(55);
        w.session_id(&self.id)
            .u32(self.iflag)
            .u32(self.oflag)
            .u32(self.cflag)
            .u32(self.lflag)
            .u8(self.verase)
            .u8(self.flow_control)
            .u8(self.utf8);
        w.finish()
    }
}

/// SESSION_EXITED: `uuid[36], exit_code:u32`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExited {
    /// Session whose shell exited.
    pub id: SessionId,
    /// `WEXITSTATUS` on normal exit, `128 + signal` on signal death.
    pub exit_code: u32,
}

impl SessionExited {
    /// Decodes a SESSION_EXITED payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on truncation or a malformed id.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            id: r.session_id()?,
            exit_code: r.u32()?,
        })
    }

    /// Encodes the payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut w = PayloadWriter::with_capacity(40);
        w.session_id(&self.id).u32(self.exit_code);
        w.finish()
    }
}

/// One entry in a LIST_OK payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    /// Session identifier.
    pub id: SessionId,
    /// Shell still running.
    pub alive: bool,
    /// Current rows.
    pub rows: u16,
    /// Current columns.
    pub cols: u16,
    /// Shell program path.
    pub shell: String,
    /// Initial working directory.
    pub cwd: String,
    /// Creation time, seconds since the epoch.
    pub created_at: u64,
    /// Last detach time, zero while attached.
    pub detached_at: u64,
    /// A client is currently attached.
    pub has_client: bool,
}

impl ListEntry {
    fn decode_from(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            id: r.session_id()?,
            alive: r.u8()? != 0,
            rows: r.u16()?,
            cols: r.u16()?,
            shell: r.string()?,
            cwd: r.string()?,
            created_at: r.u64()?,
            detached_at: r.u64()?,
            has_client: r.u8()? != 0,
        })
    }

    fn encode_into(&self, w: &mut PayloadWriter) {
        w.session_id(&self.id)
            .u8(u8::from(self.alive))
            .u16(self.rows)
            .u16(self.cols)
            .string(&self.shell)
            .string(&self.cwd)
            .u64(self.created_at)
            .u64(self.detached_at)
            .u8(u8::from(self.has_client));
    }
}

/// LIST_OK: `count:u16, entries[count]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOk {
    /// One entry per session, dead-but-retained sessions included.
    pub entries: Vec<ListEntry>,
}

impl ListOk {
    /// Decodes a LIST_OK payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on truncation or malformed entries.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = PayloadReader::new(payload);
        let count = r.u16()?;
        let mut entries = Vec::with_capacity(usize::from(count).min(super::MAX_SESSIONS));
        for _ in 0..count {
            entries.push(ListEntry::decode_from(&mut r)?);
        }
        Ok(Self { entries })
    }

    /// Encodes the payload.
    ///
    /// # Panics
    ///
    /// Panics if there are more than `u16::MAX` entries; the session cap
    /// keeps real counts far below that.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut w = PayloadWriter::new();
        w.u16(u16::try_from(self.entries.len()).expect("session count fits in u16"));
        for entry in &self.entries {
            entry.encode_into(&mut w);
        }
        w.finish()
    }
}

/// ERROR: `code:u8, message:str`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorMessage {
    /// Builds an error message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Decodes an ERROR payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on truncation or an unknown code byte.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = PayloadReader::new(payload);
        let code = ErrorCode::from_wire(r.u8()?).ok_or(WireError::Truncated)?;
        Ok(Self {
            code,
            message: r.string()?,
        })
    }

    /// Encodes the payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut w = PayloadWriter::with_capacity(3 + self.message.len());
        w.u8(self.code as u8).string(&self.message);
        w.finish()
    }
}

/// FG_PROCESS_INFO / FG_PROCESS_UPDATE: `uuid[36], pid:u32, name:str,
/// cwd:str`.
///
/// The daemon reports only the foreground process-group id; `name` and
/// `cwd` are sent empty and resolution is the client's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FgProcess {
    /// Session the foreground group belongs to.
    pub id: SessionId,
    /// Foreground process-group id, zero when unknown.
    pub pid: u32,
    /// Process name; empty from the daemon.
    pub name: String,
    /// Process working directory; empty from the daemon.
    pub cwd: String,
}

impl FgProcess {
    /// Builds a daemon-side report carrying only the group id.
    #[must_use]
    pub fn pid_only(id: SessionId, pid: u32) -> Self {
        Self {
            id,
            pid,
            name: String::new(),
            cwd: String::new(),
        }
    }

    /// Decodes the payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on truncation or a malformed id.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            id: r.session_id()?,
            pid: r.u32()?,
            name: r.string()?,
            cwd: r.string()?,
        })
    }

    /// Encodes the payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut w = PayloadWriter::with_capacity(44 + self.name.len() + self.cwd.len());
        w.session_id(&self.id)
            .u32(self.pid)
            .string(&self.name)
            .string(&self.cwd);
        w.finish()
    }
}
