//! Protocol dispatcher: one handler per message kind.
//!
//! Dispatch is a flat match on the kind byte. Handlers validate the
//! payload, mutate session and client state, and queue responses; no
//! handler lets an error escape the dispatch path. Malformed payloads,
//! unknown identifiers, and unknown kinds all answer with an ERROR frame
//! and leave the connection up; only an oversized frame (rejected by the
//! codec before dispatch) is connection-fatal.
//!
//! Until a client completes HELLO, every other kind is rejected with a
//! protocol error.

use bytes::Bytes;
use crt_core::wire::message::{
    Create, FgProcess, Hello, HelloOk, ListOk, Resize, SendSignal, SetTermios,
};
use crt_core::wire::{Capabilities, ErrorCode, MessageKind, MAX_SESSIONS, PROTOCOL_VERSION};
use crt_core::{ScrollbackRing, SessionId};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::protocol::Frame;
use crate::session::{
    sanitize_environment, spawn_shell, terminate_shell, validate_shell_path, Session, SpawnError,
};
use crate::state::{now_secs, ClientId, SharedState};

/// Handles one complete inbound frame from an authenticated-by-uid
/// client.
pub async fn handle_frame(state: &SharedState, client_id: ClientId, frame: Frame) {
    let now = now_secs();

    // Stamp the heartbeat and check the HELLO gate in one lock scope.
    let Some(authenticated) = state.with(|s| {
        let client = s.clients.get_mut(&client_id)?;
        client.last_message_at = now;
        let authenticated = client.authenticated;
        s.touch_activity(now);
        Some(authenticated)
    }) else {
        // Client vanished between read and dispatch.
        return;
    };

    let Some(kind) = MessageKind::from_wire(frame.kind) else {
        warn!(client = %client_id, kind = frame.kind, "unknown message type");
        reply_error(state, client_id, ErrorCode::ProtocolError, "unknown message type");
        return;
    };

    if !authenticated && kind != MessageKind::Hello {
        reply_error(
            state,
            client_id,
            ErrorCode::ProtocolError,
            "must send HELLO first",
        );
        return;
    }

    let payload = frame.payload;
    match kind {
        MessageKind::Hello => handle_hello(state, client_id, &payload),
        MessageKind::Create => handle_create(state, client_id, &payload).await,
        MessageKind::Attach => handle_attach(state, client_id, &payload),
        MessageKind::Detach => handle_detach(state, client_id, &payload),
        MessageKind::Destroy => handle_destroy(state, client_id, &payload).await,
        MessageKind::Resize => handle_resize(state, client_id, &payload),
        MessageKind::Input => handle_input(state, client_id, &payload),
        MessageKind::List => handle_list(state, client_id),
        MessageKind::SendSignal => handle_send_signal(state, client_id, &payload),
        MessageKind::SetTermios => handle_set_termios(state, client_id, &payload),
        MessageKind::Ping => handle_ping(state, client_id, &payload),
        MessageKind::FgProcessQuery => handle_fg_query(state, client_id, &payload),
        _ => {
            // Daemon-to-client kinds are never valid as requests.
            reply_error(state, client_id, ErrorCode::ProtocolError, "unknown message type");
        },
    }
}

/// Queues an ERROR frame to a client, if it still exists.
fn reply_error(state: &SharedState, client_id: ClientId, code: ErrorCode, message: &str) {
    state.with(|s| {
        if let Some(client) = s.clients.get(&client_id) {
            client.send_error(code, message);
        }
    });
}

/// Queues a response frame to a client, if it still exists.
fn reply(state: &SharedState, client_id: ClientId, kind: MessageKind, payload: Bytes) {
    state.with(|s| {
        if let Some(client) = s.clients.get(&client_id) {
            let _ = client.send(kind, payload);
        }
    });
}

fn handle_hello(state: &SharedState, client_id: ClientId, payload: &Bytes) {
    let Ok(hello) = Hello::decode(payload) else {
        reply_error(
            state,
            client_id,
            ErrorCode::ProtocolError,
            "HELLO payload too short",
        );
        return;
    };

    if hello.version != PROTOCOL_VERSION {
        reply_error(
            state,
            client_id,
            ErrorCode::ProtocolError,
            "unsupported protocol version",
        );
        return;
    }

    state.with(|s| {
        let Some(client) = s.clients.get_mut(&client_id) else {
            return;
        };

        if !client.peer.pid_matches(hello.client_pid) {
            warn!(
                client = %client_id,
                claimed = hello.client_pid,
                reported = ?client.peer.pid,
                "HELLO PID does not match peer credentials"
            );
            client.send_error(ErrorCode::PermissionDenied, "PID mismatch");
            return;
        }

        let negotiated = Capabilities::from_bits_truncate(hello.caps) & Capabilities::all();
        client.caps = negotiated;
        client.authenticated = true;

        let reply = HelloOk {
            version: PROTOCOL_VERSION,
            caps: negotiated,
            daemon_pid: std::process::id(),
        };
        let _ = client.send(MessageKind::HelloOk, reply.encode());
        debug!(client = %client_id, caps = negotiated.bits(), "client authenticated");
    });
}

async fn handle_create(state: &SharedState, client_id: ClientId, payload: &Bytes) {
    let Ok(req) = Create::decode(payload) else {
        reply_error(
            state,
            client_id,
            ErrorCode::ProtocolError,
            "invalid CREATE payload",
        );
        return;
    };

    let at_capacity = state.with(|s| s.sessions.len() >= MAX_SESSIONS);
    if at_capacity {
        reply_error(
            state,
            client_id,
            ErrorCode::TooManySessions,
            "max sessions reached",
        );
        return;
    }

    if let Err(err) = validate_shell_path(&req.shell) {
        warn!(client = %client_id, error = %err, "CREATE rejected");
        reply_error(state, client_id, ErrorCode::ShellNotFound, "failed to create session");
        return;
    }

    let ring = match ScrollbackRing::new(state.ring_capacity()) {
        Ok(ring) => ring,
        Err(err) => {
            warn!(error = %err, "CREATE failed");
            reply_error(state, client_id, ErrorCode::OutOfMemory, "cannot allocate scrollback");
            return;
        },
    };

    let env = sanitize_environment(&req.env);
    let spawned = match spawn_shell(&req.shell, &req.args, &env, &req.cwd, req.rows, req.cols) {
        Ok(spawned) => spawned,
        Err(err) => {
            warn!(client = %client_id, error = %err, "CREATE failed");
            let code = match err {
                SpawnError::RingAlloc(_) => ErrorCode::OutOfMemory,
                SpawnError::ShellNotFound { .. } | SpawnError::Io(_) => ErrorCode::ShellNotFound,
            };
            reply_error(state, client_id, code, "failed to create session");
            return;
        },
    };

    let session = Session {
        id: SessionId::generate(),
        master: std::sync::Arc::new(spawned.master),
        shell_pid: spawned.pid,
        rows: req.rows,
        cols: req.cols,
        ring,
        attached: None,
        created_at: now_secs(),
        detached_at: 0,
        cwd: req.cwd.clone(),
        shell: req.shell.clone(),
        alive: true,
        exit_code: 0,
        saved_termios: None,
        flow_paused: false,
        cached_fg_pid: 0,
        resume: std::sync::Arc::new(tokio::sync::Notify::new()),
        cancel: tokio_util::sync::CancellationToken::new(),
    };
    let id = session.id.clone();
    let master = std::sync::Arc::clone(&session.master);
    let cancel = session.cancel.clone();
    let resume = std::sync::Arc::clone(&session.resume);

    // The table may have filled while the shell was spawning.
    let installed = state.with(|s| {
        if s.sessions.len() >= MAX_SESSIONS {
            return false;
        }
        s.install_session(session, client_id, now_secs());
        true
    });
    if !installed {
        let mut child = spawned.child;
        let _ = child.start_kill();
        reply_error(
            state,
            client_id,
            ErrorCode::TooManySessions,
            "max sessions reached",
        );
        return;
    }

    crate::pump::spawn_output_pump(state.clone(), id.clone(), master, cancel.clone(), resume);
    crate::pump::spawn_child_watcher(state.clone(), id, spawned.child, cancel);
}

/// Parses the 36-byte identifier prefix shared by session-scoped
/// requests; answers the appropriate error on failure.
fn session_id_from_payload(
    state: &SharedState,
    client_id: ClientId,
    payload: &Bytes,
    what: &str,
) -> Option<SessionId> {
    if payload.len() < crt_core::session_id::SESSION_ID_LEN {
        reply_error(
            state,
            client_id,
            ErrorCode::ProtocolError,
            &format!("{what} payload too short"),
        );
        return None;
    }
    match SessionId::from_wire(&payload[..crt_core::session_id::SESSION_ID_LEN]) {
        Ok(id) => Some(id),
        Err(_) => {
            reply_error(
                state,
                client_id,
                ErrorCode::InvalidSessionId,
                "invalid session ID format",
            );
            None
        },
    }
}

fn handle_attach(state: &SharedState, client_id: ClientId, payload: &Bytes) {
    let Some(id) = session_id_from_payload(state, client_id, payload, "ATTACH") else {
        return;
    };

    let result = state.with(|s| s.attach_session(client_id, &id, now_secs()));
    if let Err((code, message)) = result {
        reply_error(state, client_id, code, message);
    }
}

fn handle_detach(state: &SharedState, client_id: ClientId, payload: &Bytes) {
    let Some(id) = session_id_from_payload(state, client_id, payload, "DETACH") else {
        return;
    };

    let found = state.with(|s| {
        if s.session_mut(&id).is_none() {
            return false;
        }
        s.detach_session(&id, client_id, now_secs());
        true
    });

    if found {
        reply(state, client_id, MessageKind::DetachOk, Bytes::new());
    } else {
        reply_error(state, client_id, ErrorCode::SessionNotFound, "session not found");
    }
}

async fn handle_destroy(state: &SharedState, client_id: ClientId, payload: &Bytes) {
    let Some(id) = session_id_from_payload(state, client_id, payload, "DESTROY") else {
        return;
    };

    let removed = state.with(|s| {
        // Detach from whichever client actually holds it, which may not
        // be the requester.
        let holder = s.session_mut(&id).and_then(|session| session.attached);
        if let Some(holder) = holder {
            s.detach_session(&id, holder, now_secs());
        }
        let session = s.sessions.remove(&id);
        s.touch_activity(now_secs());
        session
    });

    let Some(mut session) = removed else {
        reply_error(state, client_id, ErrorCode::SessionNotFound, "session not found");
        return;
    };

    if session.alive {
        terminate_shell(session.shell_pid).await;
    }
    session.wipe();
    debug!(session = %id, "session destroyed");

    reply(state, client_id, MessageKind::DestroyOk, Bytes::new());
}

fn handle_resize(state: &SharedState, client_id: ClientId, payload: &Bytes) {
    let Ok(req) = Resize::decode(payload) else {
        // Distinguish a bad id from a short payload the way the id
        // parser does.
        if session_id_from_payload(state, client_id, payload, "RESIZE").is_some() {
            reply_error(
                state,
                client_id,
                ErrorCode::ProtocolError,
                "RESIZE payload too short",
            );
        }
        return;
    };

    let target = state.with(|s| {
        let session = s.session_mut(&req.id)?;
        session.rows = req.rows;
        session.cols = req.cols;
        Some((
            std::sync::Arc::clone(&session.master),
            session.shell_pid,
            session.alive,
        ))
    });

    let Some((master, pid, alive)) = target else {
        reply_error(state, client_id, ErrorCode::SessionNotFound, "session not found");
        return;
    };

    if let Err(err) = master.set_winsize(req.rows, req.cols) {
        debug!(session = %req.id, error = %err, "winsize ioctl failed");
    }
    if alive {
        crate::session::notify_resize(pid);
    }
    debug!(session = %req.id, rows = req.rows, cols = req.cols, "session resized");
}

fn handle_input(state: &SharedState, client_id: ClientId, payload: &Bytes) {
    let Some(id) = session_id_from_payload(state, client_id, payload, "INPUT") else {
        return;
    };

    let target = state.with(|s| {
        let session = s.session_mut(&id)?;
        if !session.alive {
            return None;
        }
        Some(std::sync::Arc::clone(&session.master))
    });

    // Input to an unknown or dead session is dropped silently; the
    // SESSION_EXITED notification already told the client.
    let Some(master) = target else {
        if state.with(|s| s.sessions.contains_key(&id)) {
            return;
        }
        reply_error(state, client_id, ErrorCode::SessionNotFound, "session not found");
        return;
    };

    let data = &payload[crt_core::session_id::SESSION_ID_LEN..];
    if let Err(err) = master.write_all_nonblocking(data) {
        warn!(session = %id, error = %err, "write to PTY master failed");
    }
}

fn handle_list(state: &SharedState, client_id: ClientId) {
    let entries = state.with(|s| s.list_entries());
    reply(
        state,
        client_id,
        MessageKind::ListOk,
        ListOk { entries }.encode(),
    );
}

fn handle_send_signal(state: &SharedState, client_id: ClientId, payload: &Bytes) {
    let Ok(req) = SendSignal::decode(payload) else {
        if session_id_from_payload(state, client_id, payload, "SEND_SIGNAL").is_some() {
            reply_error(
                state,
                client_id,
                ErrorCode::ProtocolError,
                "SEND_SIGNAL payload too short",
            );
        }
        return;
    };

    let Some(signal) = i32::try_from(req.signum)
        .ok()
        .and_then(|raw| Signal::try_from(raw).ok())
    else {
        reply_error(state, client_id, ErrorCode::ProtocolError, "invalid signal number");
        return;
    };

    let target = state.with(|s| {
        let session = s.session_mut(&req.id)?;
        Some((session.shell_pid, session.alive))
    });

    let Some((pid, alive)) = target else {
        reply_error(state, client_id, ErrorCode::SessionNotFound, "session not found");
        return;
    };

    if alive && pid > 0 {
        let _ = kill(Pid::from_raw(pid), signal);
        debug!(session = %req.id, signal = %signal, "signal forwarded");
    }

    reply(
        state,
        client_id,
        MessageKind::SignalOk,
        Bytes::copy_from_slice(req.id.as_bytes()),
    );
}

fn handle_set_termios(state: &SharedState, client_id: ClientId, payload: &Bytes) {
    let Ok(req) = SetTermios::decode(payload) else {
        if session_id_from_payload(state, client_id, payload, "SET_TERMIOS").is_some() {
            reply_error(
                state,
                client_id,
                ErrorCode::ProtocolError,
                "SET_TERMIOS payload too short",
            );
        }
        return;
    };

    let master = state.with(|s| {
        s.session_mut(&req.id)
            .map(|session| std::sync::Arc::clone(&session.master))
    });

    let Some(master) = master else {
        reply_error(state, client_id, ErrorCode::SessionNotFound, "session not found");
        return;
    };

    if let Err(err) = master.apply_termios(&req) {
        debug!(session = %req.id, error = %err, "tcsetattr failed");
    } else {
        debug!(session = %req.id, "termios applied");
    }
}

fn handle_ping(state: &SharedState, client_id: ClientId, payload: &Bytes) {
    if payload.len() < 8 {
        reply_error(
            state,
            client_id,
            ErrorCode::ProtocolError,
            "PING payload too short",
        );
        return;
    }
    reply(
        state,
        client_id,
        MessageKind::Pong,
        payload.slice(0..8),
    );
}

fn handle_fg_query(state: &SharedState, client_id: ClientId, payload: &Bytes) {
    let Some(id) = session_id_from_payload(state, client_id, payload, "FG_PROCESS_QUERY") else {
        return;
    };

    let master = state.with(|s| {
        s.session_mut(&id)
            .map(|session| std::sync::Arc::clone(&session.master))
    });

    let Some(master) = master else {
        reply_error(state, client_id, ErrorCode::SessionNotFound, "session not found");
        return;
    };

    #[allow(clippy::cast_sign_loss)] // foreground_pgid filters to positive
    let pid = master.foreground_pgid().unwrap_or(0) as u32;
    let report = FgProcess::pid_only(id, pid);
    reply(state, client_id, MessageKind::FgProcessInfo, report.encode());
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use crt_core::wire::message::{ErrorMessage, SessionExited};
    use tokio_util::codec::Decoder;

    use super::*;
    use crate::protocol::{FrameCodec, PeerCredentials};
    use crate::state::StateHandle;

    fn fake_peer() -> PeerCredentials {
        PeerCredentials {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            pid: None,
        }
    }

    fn drain(outbound: &crate::state::Outbound) -> Vec<Frame> {
        let mut raw = BytesMut::new();
        while let Some(chunk) = outbound.pop() {
            raw.extend_from_slice(&chunk);
        }
        let mut codec = FrameCodec::new();
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut raw).unwrap() {
            frames.push(frame);
        }
        frames
    }

    async fn hello(state: &SharedState, client_id: ClientId) {
        let hello = Hello {
            version: PROTOCOL_VERSION,
            caps: Capabilities::all().bits(),
            client_pid: std::process::id(),
        };
        handle_frame(
            state,
            client_id,
            Frame::new(MessageKind::Hello as u8, hello.encode()),
        )
        .await;
    }

    #[tokio::test]
    async fn hello_negotiates_capability_intersection() {
        let state = StateHandle::new(1024);
        let (client_id, outbound, _cancel) = state.register_client(fake_peer());

        let request = Hello {
            version: PROTOCOL_VERSION,
            // One known bit plus unknown high bits.
            caps: Capabilities::SIGNAL_FORWARDING.bits() | 0xFF00,
            client_pid: std::process::id(),
        };
        handle_frame(
            &state,
            client_id,
            Frame::new(MessageKind::Hello as u8, request.encode()),
        )
        .await;

        let frames = drain(&outbound);
        assert_eq!(frames[0].kind, MessageKind::HelloOk as u8);
        let ok = HelloOk::decode(&frames[0].payload).unwrap();
        assert_eq!(ok.version, PROTOCOL_VERSION);
        assert_eq!(ok.caps, Capabilities::SIGNAL_FORWARDING);
        assert_eq!(ok.daemon_pid, std::process::id());

        assert!(state.with(|s| s.clients[&client_id].authenticated));
    }

    #[tokio::test]
    async fn hello_rejects_version_mismatch() {
        let state = StateHandle::new(1024);
        let (client_id, outbound, _cancel) = state.register_client(fake_peer());

        let request = Hello {
            version: PROTOCOL_VERSION + 1,
            caps: 0,
            client_pid: std::process::id(),
        };
        handle_frame(
            &state,
            client_id,
            Frame::new(MessageKind::Hello as u8, request.encode()),
        )
        .await;

        let frames = drain(&outbound);
        let err = ErrorMessage::decode(&frames[0].payload).unwrap();
        assert_eq!(err.code, ErrorCode::ProtocolError);
        assert!(state.with(|s| !s.clients[&client_id].authenticated));
    }

    #[tokio::test]
    async fn hello_rejects_pid_mismatch() {
        let state = StateHandle::new(1024);
        let peer = PeerCredentials {
            pid: Some(12345),
            ..fake_peer()
        };
        let (client_id, outbound, _cancel) = state.register_client(peer);

        let request = Hello {
            version: PROTOCOL_VERSION,
            caps: 0,
            client_pid: 54321,
        };
        handle_frame(
            &state,
            client_id,
            Frame::new(MessageKind::Hello as u8, request.encode()),
        )
        .await;

        let frames = drain(&outbound);
        let err = ErrorMessage::decode(&frames[0].payload).unwrap();
        assert_eq!(err.code, ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn requests_before_hello_are_rejected() {
        let state = StateHandle::new(1024);
        let (client_id, outbound, _cancel) = state.register_client(fake_peer());

        handle_frame(
            &state,
            client_id,
            Frame::new(MessageKind::List as u8, Bytes::new()),
        )
        .await;

        let frames = drain(&outbound);
        let err = ErrorMessage::decode(&frames[0].payload).unwrap();
        assert_eq!(err.code, ErrorCode::ProtocolError);
        assert_eq!(err.message, "must send HELLO first");
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected_not_fatal() {
        let state = StateHandle::new(1024);
        let (client_id, outbound, _cancel) = state.register_client(fake_peer());
        hello(&state, client_id).await;
        drop(drain(&outbound));

        handle_frame(&state, client_id, Frame::new(0x7Fu8, Bytes::new())).await;

        let frames = drain(&outbound);
        let err = ErrorMessage::decode(&frames[0].payload).unwrap();
        assert_eq!(err.code, ErrorCode::ProtocolError);
        // Client is still registered.
        assert!(state.with(|s| s.clients.contains_key(&client_id)));
    }

    #[tokio::test]
    async fn ping_echoes_eight_bytes() {
        let state = StateHandle::new(1024);
        let (client_id, outbound, _cancel) = state.register_client(fake_peer());
        hello(&state, client_id).await;
        drop(drain(&outbound));

        handle_frame(
            &state,
            client_id,
            Frame::new(MessageKind::Ping as u8, Bytes::from_static(b"\x01\x02\x03\x04\x05\x06\x07\x08")),
        )
        .await;

        let frames = drain(&outbound);
        assert_eq!(frames[0].kind, MessageKind::Pong as u8);
        assert_eq!(&frames[0].payload[..], b"\x01\x02\x03\x04\x05\x06\x07\x08");
    }

    #[tokio::test]
    async fn attach_with_malformed_id_reports_invalid_session_id() {
        let state = StateHandle::new(1024);
        let (client_id, outbound, _cancel) = state.register_client(fake_peer());
        hello(&state, client_id).await;
        drop(drain(&outbound));

        handle_frame(
            &state,
            client_id,
            Frame::new(
                MessageKind::Attach as u8,
                Bytes::from(vec![b'z'; crt_core::session_id::SESSION_ID_LEN]),
            ),
        )
        .await;

        let frames = drain(&outbound);
        let err = ErrorMessage::decode(&frames[0].payload).unwrap();
        assert_eq!(err.code, ErrorCode::InvalidSessionId);
    }

    #[tokio::test]
    async fn attach_unknown_session_reports_not_found() {
        let state = StateHandle::new(1024);
        let (client_id, outbound, _cancel) = state.register_client(fake_peer());
        hello(&state, client_id).await;
        drop(drain(&outbound));

        handle_frame(
            &state,
            client_id,
            Frame::new(
                MessageKind::Attach as u8,
                Bytes::copy_from_slice(SessionId::generate().as_bytes()),
            ),
        )
        .await;

        let frames = drain(&outbound);
        let err = ErrorMessage::decode(&frames[0].payload).unwrap();
        assert_eq!(err.code, ErrorCode::SessionNotFound);
    }

    #[tokio::test]
    async fn send_signal_validates_signal_range() {
        let state = StateHandle::new(1024);
        let (client_id, outbound, _cancel) = state.register_client(fake_peer());
        hello(&state, client_id).await;
        drop(drain(&outbound));

        let request = SendSignal {
            id: SessionId::generate(),
            signum: 4096,
        };
        handle_frame(
            &state,
            client_id,
            Frame::new(MessageKind::SendSignal as u8, request.encode()),
        )
        .await;

        let frames = drain(&outbound);
        let err = ErrorMessage::decode(&frames[0].payload).unwrap();
        assert_eq!(err.code, ErrorCode::ProtocolError);
        assert_eq!(err.message, "invalid signal number");
    }

    #[tokio::test]
    async fn create_with_bogus_shell_reports_shell_not_found() {
        let state = StateHandle::new(1024);
        let (client_id, outbound, _cancel) = state.register_client(fake_peer());
        hello(&state, client_id).await;
        drop(drain(&outbound));

        let request = Create {
            shell: "/no/such/shell".into(),
            args: vec![],
            env: vec![],
            cwd: "/".into(),
            rows: 24,
            cols: 80,
        };
        handle_frame(
            &state,
            client_id,
            Frame::new(MessageKind::Create as u8, request.encode()),
        )
        .await;

        let frames = drain(&outbound);
        let err = ErrorMessage::decode(&frames[0].payload).unwrap();
        assert_eq!(err.code, ErrorCode::ShellNotFound);
    }

    #[tokio::test]
    async fn create_then_destroy_then_destroy_again() {
        let state = StateHandle::new(4096);
        let (client_id, outbound, _cancel) = state.register_client(fake_peer());
        hello(&state, client_id).await;
        drop(drain(&outbound));

        let request = Create {
            shell: "/bin/sh".into(),
            args: vec![],
            env: vec!["PATH=/usr/bin:/bin".into(), "TERM=xterm".into()],
            cwd: "/tmp".into(),
            rows: 24,
            cols: 80,
        };
        handle_frame(
            &state,
            client_id,
            Frame::new(MessageKind::Create as u8, request.encode()),
        )
        .await;

        let frames = drain(&outbound);
        assert_eq!(frames[0].kind, MessageKind::CreateOk as u8);
        let id = SessionId::from_wire(&frames[0].payload).unwrap();

        // Creator is auto-attached.
        state.with(|s| {
            assert_eq!(s.sessions[&id].attached, Some(client_id));
        });

        handle_frame(
            &state,
            client_id,
            Frame::new(
                MessageKind::Destroy as u8,
                Bytes::copy_from_slice(id.as_bytes()),
            ),
        )
        .await;
        let frames = drain(&outbound);
        assert!(frames.iter().any(|f| f.kind == MessageKind::DestroyOk as u8));

        handle_frame(
            &state,
            client_id,
            Frame::new(
                MessageKind::Destroy as u8,
                Bytes::copy_from_slice(id.as_bytes()),
            ),
        )
        .await;
        let frames = drain(&outbound);
        let err = ErrorMessage::decode(&frames[0].payload).unwrap();
        assert_eq!(err.code, ErrorCode::SessionNotFound);
    }

    #[tokio::test]
    async fn session_exited_payload_shape() {
        // Guards the 40-byte layout the exit notification relies on.
        let msg = SessionExited {
            id: SessionId::generate(),
            exit_code: 130,
        };
        assert_eq!(msg.encode().len(), 40);
    }
}
