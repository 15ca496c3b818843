//! Per-session PTY output pump and child watcher.
//!
//! Every session runs one pump task: wait until the master is readable,
//! read up to 8 KiB, then append to the ring and queue an OUTPUT frame
//! (when a client is attached) under a single state-lock acquisition.
//! When the attached client congests, the pump parks on the session's
//! resume signal instead of reading, so the kernel TTY buffer fills and
//! eventually blocks the shell; that is the whole backpressure story.
//!
//! `EAGAIN` just rearms readiness. `EIO` means the shell closed its side
//! of the PTY; the child watcher observes the exit and finalizes the
//! session, so the pump simply stops.

use std::sync::Arc;

use crt_core::SessionId;
use tokio::process::Child;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::MasterPty;
use crate::state::SharedState;

/// Read size per wakeup, matching the socket read size.
const READ_CHUNK: usize = 8192;

/// Spawns the output pump for a session.
pub fn spawn_output_pump(
    state: SharedState,
    id: SessionId,
    master: Arc<MasterPty>,
    cancel: CancellationToken,
    resume: Arc<Notify>,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let Some(paused) = state.with(|s| s.sessions.get(&id).map(|sess| sess.flow_paused))
            else {
                // Session destroyed out from under us.
                break;
            };
            if paused {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = resume.notified() => {},
                }
                continue;
            }

            let mut guard = tokio::select! {
                () = cancel.cancelled() => break,
                readable = master.readable() => match readable {
                    Ok(guard) => guard,
                    Err(_) => break,
                },
            };

            match master.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if state.with(|s| s.on_pty_output(&id, &buf[..n])).is_none() {
                        break;
                    }
                },
                Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => {
                    guard.clear_ready();
                },
                Err(err) if err.raw_os_error() == Some(libc::EIO) => {
                    // Shell closed its side; the child watcher finishes
                    // the bookkeeping.
                    break;
                },
                Err(err) => {
                    warn!(session = %id, error = %err, "PTY master read failed");
                    break;
                },
            }
        }
        debug!(session = %id, "output pump stopped");
    });
}

/// Spawns the watcher that reaps the session's shell.
///
/// On cancellation the child handle is dropped; the runtime's orphan
/// reaper collects the process after the destroy path has killed it.
pub fn spawn_child_watcher(
    state: SharedState,
    id: SessionId,
    mut child: Child,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => {},
            status = child.wait() => match status {
                Ok(status) => state.with(|s| s.on_child_exit(&id, status)),
                Err(err) => warn!(session = %id, error = %err, "wait on shell failed"),
            },
        }
    });
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;
    use std::time::Duration;

    use nix::pty::openpty;
    use tokio::sync::Notify;

    use super::*;
    use crate::session::Session;
    use crate::state::{now_secs, StateHandle};

    #[tokio::test]
    async fn pump_moves_slave_output_into_the_ring() {
        let state = StateHandle::new(4096);
        let pty = openpty(None, None).unwrap();
        let master = Arc::new(MasterPty::new(pty.master).unwrap());
        let mut slave = File::from(pty.slave);

        let id = crt_core::SessionId::generate();
        let resume = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let session = Session {
            id: id.clone(),
            master: Arc::clone(&master),
            shell_pid: 0,
            rows: 24,
            cols: 80,
            ring: crt_core::ScrollbackRing::new(4096).unwrap(),
            attached: None,
            created_at: now_secs(),
            detached_at: now_secs(),
            cwd: "/".into(),
            shell: "/bin/sh".into(),
            alive: true,
            exit_code: 0,
            saved_termios: None,
            flow_paused: false,
            cached_fg_pid: 0,
            resume: Arc::clone(&resume),
            cancel: cancel.clone(),
        };
        state.with(|s| {
            s.sessions.insert(id.clone(), session);
        });

        spawn_output_pump(
            Arc::clone(&state),
            id.clone(),
            master,
            cancel.clone(),
            resume,
        );

        slave.write_all(b"pumped\n").unwrap();
        slave.flush().unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let used = state.with(|s| s.sessions[&id].ring.used());
            if used >= 7 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "pump never filled the ring"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        state.with(|s| {
            let (first, second) = s.sessions[&id].ring.segments();
            let mut data = first.to_vec();
            data.extend_from_slice(second);
            // The slave line discipline may add carriage returns.
            assert!(data.windows(6).any(|w| w == b"pumped"), "{data:?}");
        });

        cancel.cancel();
    }
}
