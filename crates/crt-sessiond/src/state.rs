//! Shared daemon state.
//!
//! One [`StateHandle`] owns the session and client tables for the
//! daemon's lifetime. Connection tasks, output pumps, child watchers,
//! and the timer tick all mutate state through it; critical sections are
//! short and never await, which is what preserves the protocol's
//! ordering guarantees:
//!
//! - a session's output pump appends to the ring and queues the OUTPUT
//!   frame under one lock acquisition, and
//! - ATTACH queues ATTACH_OK, the whole replay, and any SESSION_EXITED
//!   under one lock acquisition,
//!
//! so replay always precedes newly produced output on the wire.
//!
//! Backpressure is binary per session: when queueing an OUTPUT frame
//! pushes a client's outbound queue past the high-water mark, the client
//! is marked congested and the session flow-paused. The pump stops
//! reading the master until the writer drains the queue to empty, which
//! clears both flags; kernel TTY buffering then throttles the shell.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use crt_core::wire::message::{AttachOk, ErrorMessage, FgProcess, ListEntry, SessionExited};
use crt_core::wire::{Capabilities, ErrorCode, MessageKind, REPLAY_CHUNK_SIZE};
use crt_core::SessionId;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{Frame, PeerCredentials};
use crate::session::Session;

/// Detached sessions older than this are reaped as orphans.
pub const ORPHAN_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Dead, detached sessions are kept this long for a final replay.
pub const DEAD_SESSION_KEEP_SECS: u64 = 60;

/// Authenticated clients silent for longer than this are dropped.
pub const CLIENT_HEARTBEAT_TIMEOUT_SECS: u64 = 90;

/// The daemon exits after this long with no sessions and no clients.
pub const IDLE_TIMEOUT_SECS: u64 = 30 * 60;

/// Minimum spacing between foreground process-group polls.
pub const FG_POLL_INTERVAL_SECS: u64 = 2;

/// Outbound queue depth at which a client counts as congested.
pub const SEND_HIGH_WATER: usize = 256 * 1024;

/// Seconds since the epoch.
#[must_use]
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Client identifier, unique for the daemon's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// A client's outbound frame queue.
///
/// Frames are queued fully encoded; a writer task drains them to the
/// socket in order. `congested` tracks the high-water condition used for
/// per-session flow control.
#[derive(Debug)]
pub struct Outbound {
    inner: Mutex<OutboundInner>,
    writer_wake: Notify,
}

#[derive(Debug, Default)]
struct OutboundInner {
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
    congested: bool,
}

impl Outbound {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(OutboundInner::default()),
            writer_wake: Notify::new(),
        })
    }

    /// Queues an encoded frame; returns `true` when the queue is now
    /// congested.
    pub fn push(&self, frame: Bytes) -> bool {
        let congested = {
            let mut inner = self.inner.lock().expect("outbound lock poisoned");
            inner.queued_bytes += frame.len();
            inner.queue.push_back(frame);
            if inner.queued_bytes > SEND_HIGH_WATER {
                inner.congested = true;
            }
            inner.congested
        };
        self.writer_wake.notify_one();
        congested
    }

    /// Takes the next frame, or `None` when the queue is empty.
    #[must_use]
    pub fn pop(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock().expect("outbound lock poisoned");
        let frame = inner.queue.pop_front()?;
        inner.queued_bytes -= frame.len();
        Some(frame)
    }

    /// Waits until [`push`](Self::push) signals new frames.
    pub async fn wait_for_frames(&self) {
        self.writer_wake.notified().await;
    }

    /// Called by the writer once a frame hit the socket; clears the
    /// congested flag when the queue fully drained and reports whether
    /// it did.
    #[must_use]
    pub fn settle_after_write(&self) -> bool {
        let mut inner = self.inner.lock().expect("outbound lock poisoned");
        if inner.queue.is_empty() && inner.congested {
            inner.congested = false;
            return true;
        }
        false
    }

    /// Current congestion state.
    #[must_use]
    pub fn is_congested(&self) -> bool {
        self.inner.lock().expect("outbound lock poisoned").congested
    }
}

/// One connected client.
#[derive(Debug)]
pub struct Client {
    /// Client identifier.
    pub id: ClientId,
    /// HELLO completed; flips to true exactly once.
    pub authenticated: bool,
    /// Negotiated capability set.
    pub caps: Capabilities,
    /// Kernel-reported peer credentials captured at accept.
    pub peer: PeerCredentials,
    /// Sessions this client is attached to.
    pub attached: Vec<SessionId>,
    /// Last inbound message time, seconds since the epoch.
    pub last_message_at: u64,
    /// Outbound frame queue, shared with the writer task.
    pub outbound: Arc<Outbound>,
    /// Tears the connection tasks down on eviction.
    pub cancel: CancellationToken,
}

impl Client {
    /// Queues a frame; returns `true` when the queue is now congested.
    pub fn send(&self, kind: MessageKind, payload: Bytes) -> bool {
        self.outbound.push(Frame::new(kind as u8, payload).to_bytes())
    }

    /// Queues an ERROR frame.
    pub fn send_error(&self, code: ErrorCode, message: &str) {
        let _ = self.send(
            MessageKind::Error,
            ErrorMessage::new(code, message).encode(),
        );
    }
}

/// Sessions and clients removed by a timer pass; the caller finishes
/// their teardown outside the state lock.
#[derive(Debug, Default)]
pub struct TimerOutcome {
    /// Sessions removed from the table; shells may still need killing.
    pub expired_sessions: Vec<Session>,
    /// Clients whose connections should be torn down.
    pub evicted_clients: Vec<CancellationToken>,
}

/// Mutable daemon state: the session and client tables.
#[derive(Debug, Default)]
pub struct DaemonState {
    /// Live and dead-but-retained sessions, keyed by identifier.
    pub sessions: HashMap<SessionId, Session>,
    /// Connected clients.
    pub clients: HashMap<ClientId, Client>,
    last_activity: u64,
    last_fg_poll: u64,
    next_client_id: u64,
}

impl DaemonState {
    /// Stamps protocol activity for the idle-shutdown clock.
    pub fn touch_activity(&mut self, now: u64) {
        self.last_activity = now;
    }

    /// Looks a session up by identifier.
    pub fn session_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    /// Detaches `id` from `client_id` if they are currently attached.
    ///
    /// Saves the terminal mode, stamps the detach time, clears flow
    /// control, and wakes the pump. A session not attached to this
    /// client is left untouched.
    pub fn detach_session(&mut self, id: &SessionId, client_id: ClientId, now: u64) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        if session.attached != Some(client_id) {
            return;
        }

        session.saved_termios = session.master.save_termios();
        session.attached = None;
        session.detached_at = now;
        session.flow_paused = false;
        session.resume.notify_one();

        if let Some(client) = self.clients.get_mut(&client_id) {
            client.attached.retain(|sid| sid != id);
        }
        info!(session = %id, client = %client_id, "session detached");
    }

    /// Detaches every session a client holds.
    pub fn detach_all_for_client(&mut self, client_id: ClientId, now: u64) {
        let held: Vec<SessionId> = self
            .clients
            .get(&client_id)
            .map(|c| c.attached.clone())
            .unwrap_or_default();
        for id in held {
            self.detach_session(&id, client_id, now);
        }
    }

    /// Attaches a session to a client and queues the attach reply plus
    /// the full replay (and SESSION_EXITED when the shell is gone).
    ///
    /// # Errors
    ///
    /// Returns the wire error code for an unknown or busy session.
    pub fn attach_session(
        &mut self,
        client_id: ClientId,
        id: &SessionId,
        now: u64,
    ) -> Result<(), (ErrorCode, &'static str)> {
        let Some(session) = self.sessions.get_mut(id) else {
            return Err((ErrorCode::SessionNotFound, "session not found"));
        };
        if session.attached.is_some() {
            return Err((ErrorCode::SessionBusy, "session already attached"));
        }

        if let Some(saved) = session.saved_termios.take() {
            session.master.restore_termios(&saved);
        }

        session.attached = Some(client_id);
        session.detached_at = 0;

        #[allow(clippy::cast_possible_truncation)] // ring capped at 64 MiB
        let replay_size = session.ring.used() as u32;
        let reply = AttachOk {
            id: id.clone(),
            rows: session.rows,
            cols: session.cols,
            replay_size,
        };

        let mut frames = vec![Frame::new(MessageKind::AttachOk as u8, reply.encode()).to_bytes()];
        frames.extend(replay_frames(session));
        if !session.alive {
            let exited = SessionExited {
                id: id.clone(),
                exit_code: session.exit_code,
            };
            frames.push(Frame::new(MessageKind::SessionExited as u8, exited.encode()).to_bytes());
        }

        let Some(client) = self.clients.get_mut(&client_id) else {
            // The connection vanished mid-dispatch; roll the attach back.
            if let Some(session) = self.sessions.get_mut(id) {
                session.attached = None;
                session.detached_at = now;
            }
            return Err((ErrorCode::InternalError, "client gone"));
        };
        client.attached.push(id.clone());
        for frame in frames {
            let _ = client.outbound.push(frame);
        }

        self.last_activity = now;
        info!(session = %id, client = %client_id, "session attached");
        Ok(())
    }

    /// Inserts a freshly spawned session and auto-attaches its creator.
    pub fn install_session(&mut self, mut session: Session, client_id: ClientId, now: u64) {
        let id = session.id.clone();
        session.attached = Some(client_id);
        session.detached_at = 0;
        self.sessions.insert(id.clone(), session);

        if let Some(client) = self.clients.get_mut(&client_id) {
            client.attached.push(id.clone());
            let _ = client.send(
                MessageKind::CreateOk,
                Bytes::copy_from_slice(id.as_bytes()),
            );
        }
        self.last_activity = now;
        info!(session = %id, client = %client_id, "session created");
    }

    /// Records shell output: always into the ring, and as an OUTPUT
    /// frame when a client is attached.
    ///
    /// Returns `None` when the session no longer exists, `Some(true)`
    /// when the session was flow-paused by this write.
    pub fn on_pty_output(&mut self, id: &SessionId, data: &[u8]) -> Option<bool> {
        let session = self.sessions.get_mut(id)?;
        session.ring.write(data);

        let Some(client_id) = session.attached else {
            return Some(false);
        };
        let Some(client) = self.clients.get(&client_id) else {
            return Some(false);
        };

        let mut payload = Vec::with_capacity(id.as_bytes().len() + data.len());
        payload.extend_from_slice(id.as_bytes());
        payload.extend_from_slice(data);
        let congested = client.send(MessageKind::Output, Bytes::from(payload));

        if congested {
            session.flow_paused = true;
            debug!(session = %id, client = %client_id, "flow paused");
        }
        Some(congested)
    }

    /// Clears flow control on every session attached to a client whose
    /// outbound queue fully drained.
    pub fn on_client_drained(&mut self, client_id: ClientId) {
        let held: Vec<SessionId> = self
            .clients
            .get(&client_id)
            .map(|c| c.attached.clone())
            .unwrap_or_default();
        for id in held {
            if let Some(session) = self.sessions.get_mut(&id) {
                if session.flow_paused {
                    session.flow_paused = false;
                    session.resume.notify_one();
                    debug!(session = %id, "flow resumed");
                }
            }
        }
    }

    /// Marks a session's shell as exited and notifies any attached
    /// client.
    pub fn on_child_exit(&mut self, id: &SessionId, status: ExitStatus) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        session.alive = false;
        session.exit_code = exit_code_from_status(status);
        info!(session = %id, exit_code = session.exit_code, "shell exited");

        if let Some(client_id) = session.attached {
            let exited = SessionExited {
                id: id.clone(),
                exit_code: session.exit_code,
            };
            if let Some(client) = self.clients.get(&client_id) {
                let _ = client.send(MessageKind::SessionExited, exited.encode());
            }
        }
    }

    /// Builds the LIST_OK entries, dead-but-retained sessions included.
    #[must_use]
    pub fn list_entries(&self) -> Vec<ListEntry> {
        self.sessions
            .values()
            .map(|s| ListEntry {
                id: s.id.clone(),
                alive: s.alive,
                rows: s.rows,
                cols: s.cols,
                shell: s.shell.clone(),
                cwd: s.cwd.clone(),
                created_at: s.created_at,
                detached_at: s.detached_at,
                has_client: s.attached.is_some(),
            })
            .collect()
    }

    /// Runs the periodic scans: orphans, dead-keep expiry, client
    /// heartbeats, and the rate-limited foreground poll.
    pub fn run_timers(&mut self, now: u64) -> TimerOutcome {
        let mut outcome = TimerOutcome::default();

        let expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| {
                if s.attached.is_some() || s.detached_at == 0 {
                    return false;
                }
                let detached_for = now.saturating_sub(s.detached_at);
                if detached_for > ORPHAN_TIMEOUT_SECS {
                    info!(session = %s.id, detached_for, "reaping orphaned session");
                    return true;
                }
                if !s.alive && detached_for > DEAD_SESSION_KEEP_SECS {
                    info!(session = %s.id, "cleaning up dead session");
                    return true;
                }
                false
            })
            .map(|s| s.id.clone())
            .collect();
        for id in expired {
            if let Some(session) = self.sessions.remove(&id) {
                outcome.expired_sessions.push(session);
            }
        }

        for client in self.clients.values() {
            if client.authenticated
                && now.saturating_sub(client.last_message_at) > CLIENT_HEARTBEAT_TIMEOUT_SECS
            {
                warn!(client = %client.id, "heartbeat timeout, dropping client");
                outcome.evicted_clients.push(client.cancel.clone());
            }
        }

        self.poll_foreground(now);

        outcome
    }

    /// Polls each attached session's foreground process group and queues
    /// an update when it changed. Rate-limited internally.
    fn poll_foreground(&mut self, now: u64) {
        if now.saturating_sub(self.last_fg_poll) < FG_POLL_INTERVAL_SECS {
            return;
        }
        self.last_fg_poll = now;

        let mut updates: Vec<(ClientId, Bytes)> = Vec::new();
        for session in self.sessions.values_mut() {
            let Some(client_id) = session.attached else {
                continue;
            };
            if !session.alive {
                continue;
            }
            let Some(fg) = session.master.foreground_pgid() else {
                continue;
            };
            if fg == session.cached_fg_pid {
                continue;
            }
            session.cached_fg_pid = fg;

            #[allow(clippy::cast_sign_loss)] // positive, filtered above
            let report = FgProcess::pid_only(session.id.clone(), fg as u32);
            updates.push((client_id, report.encode()));
        }

        for (client_id, payload) in updates {
            if let Some(client) = self.clients.get(&client_id) {
                let _ = client.send(MessageKind::FgProcessUpdate, payload);
            }
        }
    }

    /// `true` once the daemon has been idle long enough to exit.
    #[must_use]
    pub fn idle_expired(&self, now: u64) -> bool {
        self.sessions.is_empty()
            && self.clients.is_empty()
            && self.last_activity > 0
            && now.saturating_sub(self.last_activity) > IDLE_TIMEOUT_SECS
    }
}

/// Builds the replay frame sequence for a session: REPLAY_DATA chunks
/// trimmed to a UTF-8 boundary at the front, closed by REPLAY_END. An
/// empty ring yields only REPLAY_END.
fn replay_frames(session: &Session) -> Vec<Bytes> {
    let id_bytes = session.id.as_bytes();
    let mut frames = Vec::new();

    if !session.ring.is_empty() {
        let (first, second) = session.ring.segments();
        let skip = session.ring.utf8_boundary(0);

        let mut data = Vec::with_capacity(session.ring.used().saturating_sub(skip));
        if skip < first.len() {
            data.extend_from_slice(&first[skip..]);
            data.extend_from_slice(second);
        } else if skip - first.len() < second.len() {
            data.extend_from_slice(&second[skip - first.len()..]);
        }

        for chunk in data.chunks(REPLAY_CHUNK_SIZE) {
            let mut payload = Vec::with_capacity(id_bytes.len() + chunk.len());
            payload.extend_from_slice(id_bytes);
            payload.extend_from_slice(chunk);
            frames.push(
                Frame::new(MessageKind::ReplayData as u8, Bytes::from(payload)).to_bytes(),
            );
        }
        debug!(
            session = %session.id,
            bytes = data.len(),
            chunks = frames.len(),
            "replay queued"
        );
    }

    frames.push(
        Frame::new(
            MessageKind::ReplayEnd as u8,
            Bytes::copy_from_slice(id_bytes),
        )
        .to_bytes(),
    );
    frames
}

/// Maps an exit status to the wire exit code: the exit status on normal
/// exit, `128 + signal` on signal death.
#[allow(clippy::cast_sign_loss)] // exit codes and signal numbers are non-negative
fn exit_code_from_status(status: ExitStatus) -> u32 {
    if let Some(code) = status.code() {
        return code as u32;
    }
    status.signal().map_or(0, |sig| 128 + sig as u32)
}

/// Handle to daemon state with interior mutability.
#[derive(Debug)]
pub struct StateHandle {
    inner: Mutex<DaemonState>,
    shutdown: CancellationToken,
    ring_capacity: usize,
}

/// Shared daemon state.
pub type SharedState = Arc<StateHandle>;

impl StateHandle {
    /// Creates the process-wide state.
    #[must_use]
    pub fn new(ring_capacity: usize) -> SharedState {
        Arc::new(Self {
            inner: Mutex::new(DaemonState {
                last_activity: now_secs(),
                ..DaemonState::default()
            }),
            shutdown: CancellationToken::new(),
            ring_capacity,
        })
    }

    /// Configured scrollback capacity for new sessions.
    #[must_use]
    pub const fn ring_capacity(&self) -> usize {
        self.ring_capacity
    }

    /// Runs `f` with the state locked.
    ///
    /// The closure must not block or await; every caller holds the lock
    /// only for table manipulation and frame queueing.
    pub fn with<R>(&self, f: impl FnOnce(&mut DaemonState) -> R) -> R {
        let mut guard = self.inner.lock().expect("state lock poisoned");
        f(&mut guard)
    }

    /// Token observed by every long-lived task.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Requests daemon shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Registers a newly accepted, authenticated-by-uid client.
    pub fn register_client(&self, peer: PeerCredentials) -> (ClientId, Arc<Outbound>, CancellationToken) {
        self.with(|state| {
            state.next_client_id += 1;
            let id = ClientId(state.next_client_id);
            let outbound = Outbound::new();
            let cancel = CancellationToken::new();
            let client = Client {
                id,
                authenticated: false,
                caps: Capabilities::empty(),
                peer,
                attached: Vec::new(),
                last_message_at: now_secs(),
                outbound: Arc::clone(&outbound),
                cancel: cancel.clone(),
            };
            state.clients.insert(id, client);
            state.touch_activity(now_secs());
            (id, outbound, cancel)
        })
    }

    /// Removes a client, detaching every session it held.
    pub fn remove_client(&self, client_id: ClientId) {
        self.with(|state| {
            state.detach_all_for_client(client_id, now_secs());
            if state.clients.remove(&client_id).is_some() {
                info!(client = %client_id, "client removed");
            }
            state.touch_activity(now_secs());
        });
    }
}
