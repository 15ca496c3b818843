//! Peer credential authentication for accepted connections.
//!
//! Security on the local socket derives from filesystem permissions plus a
//! kernel-reported peer credential check: a connecting process must run as
//! the same user as the daemon. The peer PID, where the platform reports
//! one, is kept for cross-checking the PID a client later claims in HELLO.
//!
//! The check runs immediately after accept, before any byte is read from
//! the peer.

use std::io;

use nix::unistd::Uid;
use tokio::net::UnixStream;

/// Peer credentials extracted from the Unix socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCredentials {
    /// User ID of the peer process.
    pub uid: u32,
    /// Group ID of the peer process.
    pub gid: u32,
    /// Process ID of the peer process, where the platform reports it.
    pub pid: Option<i32>,
}

impl PeerCredentials {
    /// Extracts credentials from a connected stream.
    ///
    /// # Errors
    ///
    /// Returns the underlying `getsockopt` error.
    pub fn from_stream(stream: &UnixStream) -> io::Result<Self> {
        let creds = stream.peer_cred()?;
        Ok(Self {
            uid: creds.uid(),
            gid: creds.gid(),
            pid: creds.pid(),
        })
    }

    /// `true` when the peer runs as the same user as this process.
    #[must_use]
    pub fn same_user(&self) -> bool {
        Uid::from_raw(self.uid) == Uid::current()
    }

    /// Cross-checks a PID the peer claims against the kernel-reported one.
    ///
    /// Platforms that do not report a peer PID accept any claim.
    #[must_use]
    pub fn pid_matches(&self, claimed: u32) -> bool {
        match self.pid {
            Some(reported) if reported > 0 => {
                u32::try_from(reported).is_ok_and(|reported| reported == claimed)
            },
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream as StdUnixStream;

    use nix::unistd::{getgid, getuid};
    use tokio::net::UnixStream as TokioUnixStream;

    use super::*;

    #[tokio::test]
    async fn socketpair_peer_is_current_user() {
        let (a, b) = StdUnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        let stream = TokioUnixStream::from_std(a).unwrap();
        let _other = TokioUnixStream::from_std(b).unwrap();

        let creds = PeerCredentials::from_stream(&stream).expect("peer_cred");

        assert_eq!(creds.uid, getuid().as_raw());
        assert_eq!(creds.gid, getgid().as_raw());
        assert!(creds.same_user());
    }

    #[tokio::test]
    async fn pid_matches_own_process() {
        let (a, b) = StdUnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        let stream = TokioUnixStream::from_std(a).unwrap();
        let _other = TokioUnixStream::from_std(b).unwrap();

        let creds = PeerCredentials::from_stream(&stream).expect("peer_cred");
        assert!(creds.pid_matches(std::process::id()));
        if creds.pid.is_some() {
            assert!(!creds.pid_matches(std::process::id().wrapping_add(1)));
        }
    }
}
