//! Session lifecycle: PTY creation, shell spawning, environment
//! sanitization, and shell process management.
//!
//! Each session owns a PTY master, the shell child attached to the slave
//! side, and a scrollback ring. The shell is spawned through
//! `tokio::process::Command` with a pre-exec hook that creates a new
//! session, acquires the slave as controlling terminal, resets signal
//! dispositions, and changes directory. Every descriptor the daemon holds
//! is close-on-exec, so nothing leaks across the exec boundary.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::sync::Arc;
use std::time::Duration;

use crt_core::ring::{RingAllocError, ScrollbackRing};
use crt_core::wire::message::SetTermios;
use crt_core::SessionId;
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::termios::{
    tcgetattr, tcsetattr, InputFlags, SetArg, SpecialCharacterIndices, Termios,
};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fdutil;
use crate::state::ClientId;

/// Environment variable names stripped from every child environment.
const DENIED_ENV_VARS: &[&str] = &["LD_PRELOAD", "LD_LIBRARY_PATH", "BASH_ENV", "ENV", "CDPATH"];

/// Largest accepted single environment entry.
const MAX_ENV_ENTRY: usize = 4096;

/// Soft cap on the total environment size; exceeding it only warns.
const MAX_ENV_TOTAL: usize = 32 * 1024;

/// TERM value injected when the client supplies none.
const DEFAULT_TERM: &str = "TERM=xterm-256color";

/// Grace period between hang-up and kill when tearing a shell down.
const SHELL_KILL_GRACE: Duration = Duration::from_millis(100);

/// Session creation failures.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The shell path does not exist, is a directory, or is not
    /// executable.
    #[error("shell not usable: {reason}")]
    ShellNotFound {
        /// What was wrong with the path.
        reason: String,
    },

    /// The scrollback ring could not be allocated.
    #[error(transparent)]
    RingAlloc(#[from] RingAllocError),

    /// PTY setup or process spawning failed.
    #[error("failed to start shell: {0}")]
    Io(#[from] io::Error),
}

/// Validates a shell path: must exist, not be a directory, be executable.
///
/// # Errors
///
/// Returns [`SpawnError::ShellNotFound`] with the failing check.
pub fn validate_shell_path(path: &str) -> Result<(), SpawnError> {
    if path.is_empty() {
        return Err(SpawnError::ShellNotFound {
            reason: "empty path".into(),
        });
    }
    let meta = std::fs::metadata(path).map_err(|err| SpawnError::ShellNotFound {
        reason: format!("{path}: {err}"),
    })?;
    if meta.is_dir() {
        return Err(SpawnError::ShellNotFound {
            reason: format!("{path} is a directory"),
        });
    }
    nix::unistd::access(path, nix::unistd::AccessFlags::X_OK).map_err(|_| {
        SpawnError::ShellNotFound {
            reason: format!("{path} is not executable"),
        }
    })?;
    Ok(())
}

/// Sanitizes a `KEY=VALUE` environment list.
///
/// Drops denylisted names and any `DYLD_`-prefixed name, drops entries
/// without `=` or larger than 4 KiB, rewrites `PATH` to keep only
/// absolute components, and guarantees a `TERM` entry. A total size
/// beyond 32 KiB is kept but logged.
#[must_use]
pub fn sanitize_environment(env: &[String]) -> Vec<String> {
    let mut result = Vec::with_capacity(env.len() + 1);
    let mut has_term = false;

    for entry in env {
        if entry.len() > MAX_ENV_ENTRY {
            warn!(bytes = entry.len(), "dropping oversized env entry");
            continue;
        }
        let Some((name, value)) = entry.split_once('=') else {
            continue;
        };
        if DENIED_ENV_VARS.contains(&name) || name.starts_with("DYLD_") {
            debug!(name, "stripping dangerous env entry");
            continue;
        }

        if name == "PATH" {
            let clean: Vec<&str> = value
                .split(':')
                .filter(|c| !c.is_empty() && c.starts_with('/'))
                .collect();
            result.push(format!("PATH={}", clean.join(":")));
        } else {
            result.push(entry.clone());
        }

        if name == "TERM" {
            has_term = true;
        }
    }

    if !has_term {
        result.push(DEFAULT_TERM.to_owned());
    }

    let total: usize = result.iter().map(|e| e.len() + 1).sum();
    if total > MAX_ENV_TOTAL {
        warn!(bytes = total, "child environment exceeds 32 KiB, keeping");
    }

    result
}

/// Default argv[0] for a login shell: the basename with a leading dash.
fn login_argv0(shell: &str) -> String {
    let base = shell.rsplit('/').next().unwrap_or(shell);
    format!("-{base}")
}

/// The daemon-side end of a session PTY.
///
/// Wraps the master descriptor for readiness-driven non-blocking I/O and
/// carries the handful of terminal ioctls the protocol exposes.
#[derive(Debug)]
pub struct MasterPty {
    inner: AsyncFd<OwnedFd>,
}

impl MasterPty {
    pub(crate) fn new(fd: OwnedFd) -> io::Result<Self> {
        fdutil::set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            inner: AsyncFd::new(fd)?,
        })
    }

    fn raw(&self) -> RawFd {
        self.inner.get_ref().as_raw_fd()
    }

    /// Waits until the master is readable.
    ///
    /// # Errors
    ///
    /// Returns the reactor error, which only happens at shutdown.
    pub async fn readable(&self) -> io::Result<tokio::io::unix::AsyncFdReadyGuard<'_, OwnedFd>> {
        self.inner.readable().await
    }

    /// Non-blocking read from the master.
    ///
    /// # Errors
    ///
    /// `EAGAIN` when no output is pending and `EIO` once the slave side
    /// is gone are the expected non-fatal cases.
    #[allow(unsafe_code, clippy::cast_sign_loss)]
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is a valid writable region of its stated length and
        // the fd is owned by self.
        let n = unsafe { libc::read(self.raw(), buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Writes as much of `data` as the kernel accepts.
    ///
    /// Retries short writes and `EINTR`; stops without error on
    /// would-block, dropping the remainder the way a raw terminal does.
    ///
    /// # Errors
    ///
    /// Returns any other I/O error.
    #[allow(unsafe_code, clippy::cast_sign_loss)]
    pub fn write_all_nonblocking(&self, data: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < data.len() {
            let rest = &data[written..];
            // SAFETY: rest is a valid readable region of its stated
            // length and the fd is owned by self.
            let n = unsafe { libc::write(self.raw(), rest.as_ptr().cast(), rest.len()) };
            if n >= 0 {
                written += n as usize;
                continue;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => {},
                Some(libc::EAGAIN) => break,
                _ => return Err(err),
            }
        }
        Ok(written)
    }

    /// Applies a new window size and returns whether the ioctl succeeded.
    #[allow(unsafe_code)]
    pub fn set_winsize(&self, rows: u16, cols: u16) -> io::Result<()> {
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCSWINSZ reads a winsize struct; ws lives across the
        // call and the fd is owned by self.
        let rc = unsafe { libc::ioctl(self.raw(), libc::TIOCSWINSZ, &ws) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Captures the current terminal attributes.
    #[must_use]
    pub fn save_termios(&self) -> Option<Termios> {
        tcgetattr(self.inner.get_ref().as_fd()).ok()
    }

    /// Restores previously captured terminal attributes.
    pub fn restore_termios(&self, saved: &Termios) {
        if let Err(err) = tcsetattr(self.inner.get_ref().as_fd(), SetArg::TCSANOW, saved) {
            debug!(error = %err, "failed to restore termios");
        }
    }

    /// Applies the flag words and control characters from a SET_TERMIOS
    /// request on top of the current attributes.
    ///
    /// # Errors
    ///
    /// Returns the underlying `tcgetattr`/`tcsetattr` error.
    pub fn apply_termios(&self, req: &SetTermios) -> io::Result<()> {
        let fd = self.inner.get_ref().as_fd();
        let mut tio = tcgetattr(fd).map_err(io::Error::from)?;

        tio.input_flags = InputFlags::from_bits_retain(libc::tcflag_t::from(req.iflag));
        tio.output_flags =
            nix::sys::termios::OutputFlags::from_bits_retain(libc::tcflag_t::from(req.oflag));
        tio.control_flags =
            nix::sys::termios::ControlFlags::from_bits_retain(libc::tcflag_t::from(req.cflag));
        tio.local_flags =
            nix::sys::termios::LocalFlags::from_bits_retain(libc::tcflag_t::from(req.lflag));

        tio.control_chars[SpecialCharacterIndices::VERASE as usize] = req.verase;

        if req.flow_control != 0 {
            tio.input_flags |= InputFlags::IXON | InputFlags::IXOFF;
        } else {
            tio.input_flags &= !(InputFlags::IXON | InputFlags::IXOFF);
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if req.utf8 != 0 {
            tio.input_flags |= InputFlags::IUTF8;
        } else {
            tio.input_flags &= !InputFlags::IUTF8;
        }

        tcsetattr(fd, SetArg::TCSANOW, &tio).map_err(io::Error::from)
    }

    /// Foreground process-group id of the terminal, if one exists.
    #[must_use]
    #[allow(unsafe_code)]
    pub fn foreground_pgid(&self) -> Option<i32> {
        // SAFETY: plain tcgetpgrp(3) on an owned descriptor.
        let pgid = unsafe { libc::tcgetpgrp(self.raw()) };
        (pgid > 0).then_some(pgid)
    }
}

/// A freshly spawned shell with its PTY master.
#[derive(Debug)]
pub struct SpawnedShell {
    /// Master side of the PTY pair.
    pub master: MasterPty,
    /// Shell child handle; waited on by a watcher task.
    pub child: Child,
    /// Shell PID.
    pub pid: i32,
}

/// Opens a PTY and spawns the shell on its slave side.
///
/// The caller is responsible for validating the shell path and
/// sanitizing `env` first; this function wires the descriptors and the
/// child-side terminal setup.
///
/// # Errors
///
/// Returns [`SpawnError::Io`] if PTY setup or the spawn itself fails
/// (including exec failure, which the OS reports back to the parent).
#[allow(unsafe_code)]
pub fn spawn_shell(
    shell: &str,
    args: &[String],
    env: &[String],
    cwd: &str,
    rows: u16,
    cols: u16,
) -> Result<SpawnedShell, SpawnError> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let pty = openpty(Some(&winsize), None).map_err(io::Error::from)?;

    fdutil::set_cloexec(pty.master.as_raw_fd())?;
    fdutil::set_cloexec(pty.slave.as_raw_fd())?;

    // The slave node must never be visible to other users.
    //
    // SAFETY: plain fchmod(2) on an owned descriptor.
    unsafe {
        libc::fchmod(pty.slave.as_raw_fd(), 0o600);
    }

    let mut cmd = std::process::Command::new(shell);
    if args.is_empty() {
        cmd.arg0(login_argv0(shell));
    } else {
        cmd.arg0(&args[0]);
        cmd.args(&args[1..]);
    }

    cmd.env_clear();
    for entry in env {
        if let Some((name, value)) = entry.split_once('=') {
            cmd.env(name, value);
        }
    }

    cmd.stdin(std::process::Stdio::from(pty.slave.try_clone()?));
    cmd.stdout(std::process::Stdio::from(pty.slave.try_clone()?));
    cmd.stderr(std::process::Stdio::from(pty.slave));

    let cwd_c = std::ffi::CString::new(cwd.as_bytes()).unwrap_or_default();
    let home_c = std::env::var_os("HOME")
        .and_then(|h| std::ffi::CString::new(h.as_os_str().as_bytes()).ok());

    // SAFETY: the hook runs between fork and exec and calls only
    // async-signal-safe functions on pre-built C strings.
    unsafe {
        cmd.pre_exec(move || {
            // New session, then adopt the slave (already dup'ed onto the
            // standard descriptors) as controlling terminal.
            libc::setsid();
            libc::ioctl(0, libc::TIOCSCTTY, 0);
            libc::tcsetpgrp(0, libc::getpid());

            // Exec keeps ignored dispositions, so put everything back to
            // default and unblock the full mask.
            for sig in 1..32 {
                libc::signal(sig, libc::SIG_DFL);
            }
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());

            if cwd_c.as_bytes().is_empty() || libc::chdir(cwd_c.as_ptr()) != 0 {
                if let Some(home) = &home_c {
                    libc::chdir(home.as_ptr());
                }
            }
            Ok(())
        });
    }

    let mut child = Command::from(cmd).spawn()?;
    let pid = child
        .id()
        .and_then(|id| i32::try_from(id).ok())
        .ok_or_else(|| io::Error::other("spawned shell has no PID"))?;

    let master = match MasterPty::new(pty.master) {
        Ok(master) => master,
        Err(err) => {
            // Roll back: the shell just started, take it down hard.
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            let _ = child.start_kill();
            return Err(err.into());
        },
    };

    info!(pid, shell, cols, rows, "shell spawned");
    Ok(SpawnedShell { master, child, pid })
}

/// Hangs the shell up, escalating to SIGKILL after a short grace window.
///
/// Reaping happens in the session's child watcher task.
pub async fn terminate_shell(pid: i32) {
    let pid = Pid::from_raw(pid);
    if kill(pid, Signal::SIGHUP).is_err() {
        return;
    }
    tokio::time::sleep(SHELL_KILL_GRACE).await;
    if kill(pid, None).is_ok() {
        let _ = kill(pid, Signal::SIGKILL);
    }
}

/// Sends SIGWINCH to the shell's process group after a resize.
pub fn notify_resize(shell_pid: i32) {
    let _ = killpg(Pid::from_raw(shell_pid), Signal::SIGWINCH);
}

/// One live (or dead-but-retained) session.
///
/// States: alive-attached, alive-detached, dead-detached. `attached`
/// distinguishes the first two; `alive` the last. A dead session keeps
/// its ring so a late client can still replay the final output.
#[derive(Debug)]
pub struct Session {
    /// Session identifier, unique across live sessions.
    pub id: SessionId,
    /// PTY master, shared with the output pump.
    pub master: Arc<MasterPty>,
    /// Shell PID.
    pub shell_pid: i32,
    /// Current rows.
    pub rows: u16,
    /// Current columns.
    pub cols: u16,
    /// Scrollback ring.
    pub ring: ScrollbackRing,
    /// Currently attached client.
    pub attached: Option<ClientId>,
    /// Creation time, seconds since the epoch.
    pub created_at: u64,
    /// Last detach time; zero while attached.
    pub detached_at: u64,
    /// Initial working directory.
    pub cwd: String,
    /// Shell program path.
    pub shell: String,
    /// Shell still running.
    pub alive: bool,
    /// Final exit code; meaningful only once `alive` is false.
    pub exit_code: u32,
    /// Terminal attributes captured at detach, restored on attach.
    pub saved_termios: Option<Termios>,
    /// Output pump paused because the attached client is congested.
    pub flow_paused: bool,
    /// Last observed foreground process-group id.
    pub cached_fg_pid: i32,
    /// Wakes the output pump when flow resumes.
    pub resume: Arc<Notify>,
    /// Stops the pump and watcher on destroy.
    pub cancel: CancellationToken,
}

impl Session {
    /// Stops the session's tasks and wipes sensitive state.
    ///
    /// The ring and identifier also wipe on drop; clearing here makes
    /// the teardown point explicit.
    pub fn wipe(&mut self) {
        self.cancel.cancel();
        self.ring.clear();
        self.saved_termios = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_denylisted_and_prefixed_vars() {
        let env = vec![
            "LD_PRELOAD=/tmp/x.so".to_owned(),
            "PATH=/usr/bin:.:".to_owned(),
            "DYLD_FOO=1".to_owned(),
            "FOO=bar".to_owned(),
            "TERM=xterm".to_owned(),
        ];
        let clean = sanitize_environment(&env);

        assert!(clean.contains(&"FOO=bar".to_owned()));
        assert!(clean.contains(&"PATH=/usr/bin".to_owned()));
        assert!(clean.contains(&"TERM=xterm".to_owned()));
        assert!(!clean.iter().any(|e| e.starts_with("LD_")));
        assert!(!clean.iter().any(|e| e.starts_with("DYLD_")));
    }

    #[test]
    fn sanitize_injects_term_when_missing() {
        let clean = sanitize_environment(&["FOO=bar".to_owned()]);
        assert!(clean.contains(&DEFAULT_TERM.to_owned()));
    }

    #[test]
    fn sanitize_keeps_client_term() {
        let clean = sanitize_environment(&["TERM=vt100".to_owned()]);
        assert!(clean.contains(&"TERM=vt100".to_owned()));
        assert!(!clean.contains(&DEFAULT_TERM.to_owned()));
    }

    #[test]
    fn sanitize_path_drops_relative_and_empty_components() {
        let clean = sanitize_environment(&["PATH=:/usr/bin:rel/a:.:/bin:".to_owned()]);
        assert!(clean.contains(&"PATH=/usr/bin:/bin".to_owned()));
    }

    #[test]
    fn sanitize_drops_oversized_entries_and_malformed_entries() {
        let big = format!("BIG={}", "x".repeat(MAX_ENV_ENTRY + 1));
        let clean = sanitize_environment(&[big, "NOEQUALS".to_owned()]);
        assert_eq!(clean, vec![DEFAULT_TERM.to_owned()]);
    }

    #[test]
    fn validate_accepts_system_shell() {
        validate_shell_path("/bin/sh").unwrap();
    }

    #[test]
    fn validate_rejects_missing_directory_and_plain_files() {
        assert!(validate_shell_path("").is_err());
        assert!(validate_shell_path("/no/such/shell").is_err());
        assert!(validate_shell_path("/tmp").is_err());
        // A regular file without the execute bit.
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        assert!(validate_shell_path(path).is_err());
    }

    #[test]
    fn login_argv0_uses_dashed_basename() {
        assert_eq!(login_argv0("/bin/zsh"), "-zsh");
        assert_eq!(login_argv0("sh"), "-sh");
    }

    #[tokio::test]
    async fn spawn_shell_runs_a_command_on_the_pty() {
        let args = vec!["sh".to_owned(), "-c".to_owned(), "echo spawned-ok".to_owned()];
        let env = sanitize_environment(&["PATH=/usr/bin:/bin".to_owned()]);
        let mut spawned = spawn_shell("/bin/sh", &args, &env, "/", 24, 80).unwrap();
        assert!(spawned.pid > 0);

        let deadline = tokio::time::Duration::from_secs(10);
        let mut collected = Vec::new();
        let read_until = async {
            loop {
                let mut guard = spawned.master.readable().await.unwrap();
                let mut buf = [0u8; 4096];
                match spawned.master.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        collected.extend_from_slice(&buf[..n]);
                        if collected.windows(10).any(|w| w == b"spawned-ok") {
                            break;
                        }
                    },
                    Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => {
                        guard.clear_ready();
                    },
                    // EIO once the child is gone.
                    Err(_) => break,
                }
            }
        };
        tokio::time::timeout(deadline, read_until).await.unwrap();
        assert!(
            collected.windows(10).any(|w| w == b"spawned-ok"),
            "output: {collected:?}"
        );

        let status = spawned.child.wait().await.unwrap();
        assert_eq!(status.code(), Some(0));
    }

    #[tokio::test]
    async fn spawn_shell_reports_exec_failure() {
        // Passes path validation shape but fails at exec time.
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_owned();
        let result = spawn_shell(&path, &[], &[], "/", 24, 80);
        assert!(result.is_err());
    }
}
