//! Shared harness for daemon integration tests.
//!
//! Starts a real daemon on a listener bound inside a fresh temp
//! directory and exposes a tiny protocol client for driving it over the
//! socket.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use crt_core::wire::message::{Create, Hello, HelloOk};
use crt_core::wire::{Capabilities, MessageKind, PROTOCOL_VERSION};
use crt_sessiond::daemon;
use crt_sessiond::protocol::Frame;
use crt_sessiond::server::{bind_listener, prepare_socket_dir, SocketDirs};
use crt_sessiond::state::{SharedState, StateHandle};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

/// How long any single protocol exchange may take before the test fails.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// A daemon running inside the test process.
pub struct TestDaemon {
    pub dirs: SocketDirs,
    pub state: SharedState,
    task: JoinHandle<anyhow::Result<()>>,
    _tmp: TempDir,
}

impl TestDaemon {
    /// Brings a daemon up on a fresh socket directory.
    pub async fn start() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dirs = SocketDirs::in_dir(tmp.path().join("crt-plus"));
        prepare_socket_dir(&dirs.dir).expect("socket dir");
        let listener = bind_listener(&dirs.socket).expect("bind");
        let state = StateHandle::new(1024 * 1024);

        let task = tokio::spawn(daemon::run(state.clone(), listener));

        Self {
            dirs,
            state,
            task,
            _tmp: tmp,
        }
    }

    /// Connects a new client to the daemon socket.
    pub async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.dirs.socket)
            .await
            .expect("connect");
        TestClient {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// Requests shutdown and waits for the daemon to finish.
    pub async fn stop(self) {
        self.state.request_shutdown();
        let _ = tokio::time::timeout(EXCHANGE_TIMEOUT, self.task).await;
    }
}

/// A raw protocol client.
pub struct TestClient {
    stream: UnixStream,
    buf: BytesMut,
}

impl TestClient {
    /// Sends one frame.
    pub async fn send(&mut self, kind: MessageKind, payload: &[u8]) {
        self.send_raw(kind as u8, payload).await;
    }

    /// Sends one frame with an arbitrary kind byte.
    pub async fn send_raw(&mut self, kind: u8, payload: &[u8]) {
        let mut header = [0u8; 5];
        header[0] = kind;
        header[1..5].copy_from_slice(&u32::try_from(payload.len()).expect("len").to_le_bytes());
        self.stream.write_all(&header).await.expect("write header");
        self.stream.write_all(payload).await.expect("write payload");
    }

    /// Writes raw bytes to the socket, bypassing the frame writer.
    pub async fn send_raw_bytes(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write raw");
    }

    /// Receives the next frame, failing the test on timeout or EOF.
    pub async fn recv(&mut self) -> Frame {
        tokio::time::timeout(EXCHANGE_TIMEOUT, self.recv_inner())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed while waiting for frame")
    }

    /// Receives the next frame, or `None` once the daemon closed the
    /// connection.
    pub async fn try_recv(&mut self) -> Option<Frame> {
        tokio::time::timeout(EXCHANGE_TIMEOUT, self.recv_inner())
            .await
            .expect("timed out waiting for frame or close")
    }

    async fn recv_inner(&mut self) -> Option<Frame> {
        loop {
            if self.buf.len() >= 5 {
                let len = u32::from_le_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]])
                    as usize;
                if self.buf.len() >= 5 + len {
                    let kind = self.buf[0];
                    self.buf.advance(5);
                    let payload = self.buf.split_to(len).freeze();
                    return Some(Frame { kind, payload });
                }
            }
            let n = self.stream.read_buf(&mut self.buf).await.expect("read");
            if n == 0 {
                return None;
            }
        }
    }

    /// Receives frames until one of the wanted kind arrives, returning
    /// it plus everything skipped on the way.
    pub async fn recv_until(&mut self, kind: MessageKind) -> (Frame, Vec<Frame>) {
        let mut skipped = Vec::new();
        loop {
            let frame = self.recv().await;
            if frame.kind == kind as u8 {
                return (frame, skipped);
            }
            skipped.push(frame);
        }
    }

    /// Performs the HELLO exchange and returns the negotiated reply.
    pub async fn hello(&mut self) -> HelloOk {
        let request = Hello {
            version: PROTOCOL_VERSION,
            caps: Capabilities::all().bits(),
            client_pid: std::process::id(),
        };
        self.send(MessageKind::Hello, &request.encode()).await;
        let frame = self.recv().await;
        assert_eq!(frame.kind, MessageKind::HelloOk as u8, "{frame:?}");
        HelloOk::decode(&frame.payload).expect("HELLO_OK payload")
    }

    /// Creates a session and returns its identifier bytes.
    pub async fn create(&mut self, request: &Create) -> Bytes {
        self.send(MessageKind::Create, &request.encode()).await;
        let frame = self.recv().await;
        assert_eq!(frame.kind, MessageKind::CreateOk as u8, "{frame:?}");
        assert_eq!(frame.payload.len(), 36);
        frame.payload
    }
}

/// A CREATE request for a plain `/bin/sh` login session.
pub fn sh_create() -> Create {
    Create {
        shell: "/bin/sh".into(),
        args: vec![],
        env: vec!["PATH=/usr/bin:/bin".into(), "TERM=xterm".into()],
        cwd: "/tmp".into(),
        rows: 24,
        cols: 80,
    }
}

/// True when `haystack` contains `needle`.
pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
