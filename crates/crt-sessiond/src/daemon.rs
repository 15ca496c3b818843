//! Runtime composition: accept loop, connection tasks, timers, teardown.
//!
//! [`run`] owns the daemon's lifetime. It accepts connections, rejects
//! peers that fail the credential check before reading a single byte,
//! and gives each accepted client a reader task (frame decode plus
//! dispatch) and a writer task (outbound queue drain). A timer task
//! ticks the periodic scans. Everything observes the shared shutdown
//! token; on exit, clients are dropped first, then every session is
//! destroyed, reaping its shell and wiping its ring.

use anyhow::Result;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch;
use crate::protocol::{FrameCodec, PeerCredentials};
use crate::session::terminate_shell;
use crate::state::{now_secs, ClientId, Outbound, SharedState};

/// Spacing of the periodic timer pass; fine enough for the 2-second
/// foreground poll, and every other timeout is far coarser.
const TIMER_TICK: std::time::Duration = std::time::Duration::from_secs(2);

/// Runs the daemon until shutdown is requested or the idle timeout
/// fires, then tears everything down in order.
///
/// # Errors
///
/// Returns an error only when the listener itself fails fatally.
pub async fn run(state: SharedState, listener: UnixListener) -> Result<()> {
    let shutdown = state.shutdown_token();

    let timer_state = state.clone();
    let timer = tokio::spawn(timer_loop(timer_state));

    info!("accepting connections");
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => accept_connection(&state, stream),
                Err(err) => warn!(error = %err, "accept failed"),
            },
        }
    }

    info!("shutting down");
    teardown(&state).await;
    timer.abort();
    Ok(())
}

/// Authenticates a fresh connection by peer credentials and wires its
/// reader and writer tasks.
fn accept_connection(state: &SharedState, stream: UnixStream) {
    let peer = match PeerCredentials::from_stream(&stream) {
        Ok(peer) => peer,
        Err(err) => {
            warn!(error = %err, "cannot read peer credentials, dropping connection");
            return;
        },
    };
    if !peer.same_user() {
        warn!(uid = peer.uid, "rejected connection from foreign uid");
        return;
    }

    let (client_id, outbound, cancel) = state.register_client(peer.clone());
    info!(client = %client_id, pid = ?peer.pid, "client connected");

    let (read_half, write_half) = stream.into_split();

    tokio::spawn(writer_loop(
        state.clone(),
        client_id,
        outbound,
        write_half,
        cancel.clone(),
    ));
    tokio::spawn(reader_loop(state.clone(), client_id, read_half, cancel));
}

/// Reads frames and dispatches them until EOF, a protocol error, or
/// eviction; then removes the client, detaching its sessions.
async fn reader_loop(
    state: SharedState,
    client_id: ClientId,
    read_half: tokio::net::unix::OwnedReadHalf,
    cancel: CancellationToken,
) {
    let mut framed = FramedRead::new(read_half, FrameCodec::new());

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = framed.next() => frame,
        };
        match frame {
            Some(Ok(frame)) => dispatch::handle_frame(&state, client_id, frame).await,
            Some(Err(err)) => {
                warn!(client = %client_id, error = %err, "protocol error, dropping client");
                break;
            },
            None => {
                debug!(client = %client_id, "client closed connection");
                break;
            },
        }
    }

    cancel.cancel();
    state.remove_client(client_id);
}

/// Drains the outbound queue to the socket, clearing flow control when
/// the queue empties.
async fn writer_loop(
    state: SharedState,
    client_id: ClientId,
    outbound: std::sync::Arc<Outbound>,
    mut write_half: OwnedWriteHalf,
    cancel: CancellationToken,
) {
    loop {
        let Some(frame) = outbound.pop() else {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = outbound.wait_for_frames() => {},
            }
            continue;
        };

        let written = tokio::select! {
            () = cancel.cancelled() => break,
            written = write_half.write_all(&frame) => written,
        };
        if let Err(err) = written {
            debug!(client = %client_id, error = %err, "write to client failed");
            cancel.cancel();
            break;
        }

        if outbound.settle_after_write() {
            state.with(|s| s.on_client_drained(client_id));
        }
    }
}

/// Periodic pass: orphan and dead-session reaping, heartbeat eviction,
/// foreground polling, and the idle-daemon clock.
async fn timer_loop(state: SharedState) {
    let shutdown = state.shutdown_token();
    let mut tick = tokio::time::interval(TIMER_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = tick.tick() => {},
        }

        let now = now_secs();
        let outcome = state.with(|s| s.run_timers(now));

        for token in outcome.evicted_clients {
            token.cancel();
        }
        for mut session in outcome.expired_sessions {
            if session.alive {
                terminate_shell(session.shell_pid).await;
            }
            session.wipe();
        }

        if state.with(|s| s.idle_expired(now)) {
            info!("idle timeout reached, shutting down");
            state.request_shutdown();
            break;
        }
    }
}

/// Drops every client, then destroys every session.
async fn teardown(state: &SharedState) {
    let client_tokens: Vec<CancellationToken> =
        state.with(|s| s.clients.values().map(|c| c.cancel.clone()).collect());
    for token in client_tokens {
        token.cancel();
    }

    let sessions: Vec<crate::session::Session> =
        state.with(|s| s.sessions.drain().map(|(_, session)| session).collect());
    for mut session in sessions {
        if session.alive {
            terminate_shell(session.shell_pid).await;
        }
        session.wipe();
    }
}
