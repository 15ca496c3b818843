//! Server bring-up: socket directory, listening socket, and PID file.
//!
//! The runtime directory lives under the user's runtime prefix
//! (`$XDG_RUNTIME_DIR/crt-plus`, falling back to `/tmp/crt-plus-<uid>`;
//! on macOS `$TMPDIR/crt-plus-<uid>`). Creation is TOCTOU-safe: the
//! parent is opened first, `mkdirat` is issued relative to it, and the
//! child is re-opened with `O_NOFOLLOW | O_DIRECTORY` before ownership
//! and mode are verified on the handle. A symlink planted at the path, a
//! foreign owner, or an unrepairable mode aborts startup.
//!
//! The PID file is created with `O_CREAT | O_EXCL` at mode 0600; a stale
//! file whose recorded process no longer answers signal 0 is removed and
//! the create retried once. The listener is bound under umask 0077 with
//! backlog 5.

use std::fs;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::sys::stat::{umask, Mode};
use nix::unistd::{getuid, Pid};
use tracing::{info, warn};

/// Name of the listening socket inside the runtime directory.
const SOCKET_NAME: &str = "sessiond.sock";

/// Name of the PID file inside the runtime directory.
const PID_FILE_NAME: &str = "sessiond.pid";

/// Largest PID value accepted from a PID file.
const MAX_RECORDED_PID: i64 = 99_999_999;

/// Bring-up failures; all of these abort startup.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The runtime directory path has no usable parent component.
    #[error("invalid runtime directory path: {}", path.display())]
    InvalidPath {
        /// Offending path.
        path: PathBuf,
    },

    /// The parent of the runtime directory could not be opened.
    #[error("cannot open parent of runtime directory {}: {source}", path.display())]
    ParentOpen {
        /// Runtime directory path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The runtime directory is a symlink or otherwise not openable as a
    /// plain directory.
    #[error("refusing runtime directory {} (symlink or not a directory): {source}", path.display())]
    DirRefused {
        /// Runtime directory path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The runtime directory belongs to another user.
    #[error("runtime directory {} owned by uid {found}, expected {expected}", path.display())]
    WrongOwner {
        /// Runtime directory path.
        path: PathBuf,
        /// Owner reported by the kernel.
        found: u32,
        /// This process's uid.
        expected: u32,
    },

    /// The runtime directory mode was weaker than 0700 and could not be
    /// repaired.
    #[error("cannot restrict mode of runtime directory {}: {source}", path.display())]
    ModeRepair {
        /// Runtime directory path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Another daemon instance is alive and owns the PID file.
    #[error("daemon already running (pid {pid})")]
    AlreadyRunning {
        /// PID recorded by the running instance.
        pid: i32,
    },

    /// The PID file could not be created or written.
    #[error("cannot write PID file {}: {source}", path.display())]
    PidFile {
        /// PID file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The socket path does not fit in `sockaddr_un`.
    #[error("socket path too long: {}", path.display())]
    PathTooLong {
        /// Offending path.
        path: PathBuf,
    },

    /// Creating, binding, or listening on the socket failed.
    #[error("cannot listen on {}: {source}", path.display())]
    Bind {
        /// Socket path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Resolved filesystem locations for one daemon instance.
#[derive(Debug, Clone)]
pub struct SocketDirs {
    /// Runtime directory, mode 0700.
    pub dir: PathBuf,
    /// Listening socket path.
    pub socket: PathBuf,
    /// PID file path.
    pub pid_file: PathBuf,
}

impl SocketDirs {
    /// Resolves the per-user runtime directory from the environment.
    #[must_use]
    pub fn resolve() -> Self {
        Self::in_dir(default_runtime_dir())
    }

    /// Uses an explicit runtime directory (tests and overrides).
    #[must_use]
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let socket = dir.join(SOCKET_NAME);
        let pid_file = dir.join(PID_FILE_NAME);
        Self {
            dir,
            socket,
            pid_file,
        }
    }
}

#[cfg(target_os = "macos")]
fn default_runtime_dir() -> PathBuf {
    let tmp = std::env::var_os("TMPDIR")
        .filter(|v| !v.is_empty())
        .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
    tmp.join(format!("crt-plus-{}", getuid().as_raw()))
}

#[cfg(not(target_os = "macos"))]
fn default_runtime_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_RUNTIME_DIR").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join("crt-plus");
    }
    PathBuf::from(format!("/tmp/crt-plus-{}", getuid().as_raw()))
}

/// Opens a path with raw `open(2)` flags, returning an owned descriptor.
#[allow(unsafe_code)]
fn open_raw(path: &Path, flags: libc::c_int) -> io::Result<OwnedFd> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;

    // SAFETY: c_path is a valid NUL-terminated string and the flags are
    // plain open(2) flags. The returned fd is checked before wrapping.
    let fd = unsafe { libc::open(c_path.as_ptr(), flags) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a freshly opened, valid descriptor; ownership moves
    // into the OwnedFd.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Creates and verifies the runtime directory.
///
/// # Errors
///
/// Returns [`ServerError`] on a symlinked path, foreign ownership, or an
/// unrepairable mode; all are startup-fatal.
#[allow(unsafe_code)]
pub fn prepare_socket_dir(dir: &Path) -> Result<(), ServerError> {
    let parent = dir.parent().filter(|p| !p.as_os_str().is_empty());
    let (Some(parent), Some(base)) = (parent, dir.file_name()) else {
        return Err(ServerError::InvalidPath {
            path: dir.to_path_buf(),
        });
    };

    let parent_fd = open_raw(parent, libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC)
        .map_err(|source| ServerError::ParentOpen {
            path: dir.to_path_buf(),
            source,
        })?;

    let c_base = std::ffi::CString::new(base.as_bytes()).map_err(|_| ServerError::InvalidPath {
        path: dir.to_path_buf(),
    })?;

    // SAFETY: parent_fd is a valid directory descriptor and c_base a valid
    // NUL-terminated name. EEXIST is expected on restart and tolerated.
    let rc = unsafe { libc::mkdirat(parent_fd.as_raw_fd(), c_base.as_ptr(), 0o700) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(ServerError::ParentOpen {
                path: dir.to_path_buf(),
                source: err,
            });
        }
    }

    // Re-open the child without following symlinks; ELOOP or ENOTDIR here
    // means someone planted something at our path.
    //
    // SAFETY: same argument validity as above; the fd is checked before
    // wrapping.
    let dir_fd = unsafe {
        libc::openat(
            parent_fd.as_raw_fd(),
            c_base.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
        )
    };
    if dir_fd < 0 {
        return Err(ServerError::DirRefused {
            path: dir.to_path_buf(),
            source: io::Error::last_os_error(),
        });
    }
    // SAFETY: dir_fd is a valid descriptor owned from here on.
    let dir_fd = unsafe { OwnedFd::from_raw_fd(dir_fd) };

    // Verify owner and mode on the handle, not the path.
    //
    // SAFETY: dir_fd is valid and st is a plain zeroed out-parameter.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstat(dir_fd.as_raw_fd(), &mut st) };
    if rc != 0 {
        return Err(ServerError::DirRefused {
            path: dir.to_path_buf(),
            source: io::Error::last_os_error(),
        });
    }

    let my_uid = getuid().as_raw();
    if st.st_uid != my_uid {
        return Err(ServerError::WrongOwner {
            path: dir.to_path_buf(),
            found: st.st_uid,
            expected: my_uid,
        });
    }

    let mode = st.st_mode & 0o777;
    if mode != 0o700 {
        // SAFETY: dir_fd is a valid directory descriptor.
        let rc = unsafe { libc::fchmod(dir_fd.as_raw_fd(), 0o700) };
        if rc != 0 {
            return Err(ServerError::ModeRepair {
                path: dir.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }
        warn!(
            path = %dir.display(),
            mode = format_args!("{mode:o}"),
            "restricted runtime directory mode to 0700"
        );
    }

    Ok(())
}

/// Reads the PID recorded in a PID file.
///
/// Garbage content or an out-of-range value reads as absent.
#[must_use]
pub fn read_recorded_pid(path: &Path) -> Option<i32> {
    let text = fs::read_to_string(path).ok()?;
    let pid: i64 = text.trim().parse().ok()?;
    if pid <= 0 || pid > MAX_RECORDED_PID {
        return None;
    }
    i32::try_from(pid).ok()
}

/// `true` when the process still answers signal 0.
#[must_use]
pub fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// An exclusively-created PID file.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Records this process's PID, resolving one stale collision.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AlreadyRunning`] when the recorded process
    /// is alive, or [`ServerError::PidFile`] on I/O failure.
    pub fn create(path: &Path) -> Result<Self, ServerError> {
        for attempt in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)
            {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id()).map_err(|source| {
                        let _ = fs::remove_file(path);
                        ServerError::PidFile {
                            path: path.to_path_buf(),
                            source,
                        }
                    })?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                },
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists && attempt == 0 => {
                    if let Some(pid) = read_recorded_pid(path) {
                        if process_alive(pid) {
                            return Err(ServerError::AlreadyRunning { pid });
                        }
                    }
                    info!(path = %path.display(), "removing stale PID file");
                    let _ = fs::remove_file(path);
                },
                Err(source) => {
                    return Err(ServerError::PidFile {
                        path: path.to_path_buf(),
                        source,
                    });
                },
            }
        }
        unreachable!("second create attempt either succeeds or errors");
    }

    /// Removes the file; failures are logged, not fatal.
    pub fn remove(&self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove PID file");
            }
        }
    }
}

/// Binds the listening socket with backlog 5 under umask 0077.
///
/// A leftover socket file from a dead instance is removed first; the PID
/// file check has already established no live instance owns it.
///
/// # Errors
///
/// Returns [`ServerError`] when the path does not fit `sockaddr_un` or
/// any socket call fails.
#[allow(unsafe_code, clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn bind_listener(path: &Path) -> Result<tokio::net::UnixListener, ServerError> {
    let bytes = path.as_os_str().as_bytes();

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    if bytes.len() >= addr.sun_path.len() {
        return Err(ServerError::PathTooLong {
            path: path.to_path_buf(),
        });
    }

    match fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "removed stale socket"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {},
        Err(source) => {
            return Err(ServerError::Bind {
                path: path.to_path_buf(),
                source,
            });
        },
    }

    let map_err = |source: io::Error| ServerError::Bind {
        path: path.to_path_buf(),
        source,
    };

    // SAFETY: plain socket(2) call; the fd is checked before wrapping.
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(map_err(io::Error::last_os_error()));
    }
    // SAFETY: fd is a freshly created, valid socket descriptor.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    crate::fdutil::set_cloexec(fd.as_raw_fd()).map_err(map_err)?;

    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let addr_len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;

    // Bind under a restrictive umask so the socket node is never visible
    // with group or world bits set.
    let previous = umask(Mode::from_bits_truncate(0o077));
    // SAFETY: fd is a valid socket and addr a fully initialized
    // sockaddr_un of the correct length.
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
            addr_len,
        )
    };
    let bind_err = (rc != 0).then(io::Error::last_os_error);
    umask(previous);
    if let Some(source) = bind_err {
        return Err(map_err(source));
    }

    // SAFETY: fd is a bound socket descriptor.
    let rc = unsafe { libc::listen(fd.as_raw_fd(), 5) };
    if rc != 0 {
        let source = io::Error::last_os_error();
        let _ = fs::remove_file(path);
        return Err(map_err(source));
    }

    let std_listener = std::os::unix::net::UnixListener::from(fd);
    std_listener.set_nonblocking(true).map_err(map_err)?;
    let listener = tokio::net::UnixListener::from_std(std_listener).map_err(map_err)?;

    info!(path = %path.display(), "listening");
    Ok(listener)
}

/// Removes the socket and PID files at shutdown.
pub fn remove_runtime_files(dirs: &SocketDirs) {
    for path in [&dirs.socket, &dirs.pid_file] {
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::{symlink, PermissionsExt};

    use super::*;

    #[test]
    fn prepare_creates_directory_with_0700() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("crt-plus-test");

        prepare_socket_dir(&dir).unwrap();

        let mode = fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[test]
    fn prepare_is_idempotent() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("crt-plus-test");

        prepare_socket_dir(&dir).unwrap();
        prepare_socket_dir(&dir).unwrap();
    }

    #[test]
    fn prepare_repairs_weak_mode() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("crt-plus-test");
        fs::create_dir(&dir).unwrap();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).unwrap();

        prepare_socket_dir(&dir).unwrap();

        let mode = fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[test]
    fn prepare_refuses_symlinked_directory() {
        let base = tempfile::tempdir().unwrap();
        let target = base.path().join("elsewhere");
        fs::create_dir(&target).unwrap();
        let dir = base.path().join("crt-plus-test");
        symlink(&target, &dir).unwrap();

        let err = prepare_socket_dir(&dir).unwrap_err();
        assert!(matches!(err, ServerError::DirRefused { .. }), "{err}");
    }

    #[test]
    fn pid_file_round_trip() {
        let base = tempfile::tempdir().unwrap();
        let path = base.path().join("sessiond.pid");

        let pid_file = PidFile::create(&path).unwrap();
        let recorded = read_recorded_pid(&path).unwrap();
        assert_eq!(recorded, i32::try_from(std::process::id()).unwrap());

        // Content is the decimal PID followed by a newline.
        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw, format!("{}\n", std::process::id()));

        pid_file.remove();
        assert!(!path.exists());
    }

    #[test]
    fn stale_pid_file_is_replaced() {
        let base = tempfile::tempdir().unwrap();
        let path = base.path().join("sessiond.pid");
        // A PID at the acceptance bound; no real process has it.
        fs::write(&path, "99999999\n").unwrap();

        let _pid_file = PidFile::create(&path).unwrap();
        assert_eq!(
            read_recorded_pid(&path).unwrap(),
            i32::try_from(std::process::id()).unwrap()
        );
    }

    #[test]
    fn live_pid_file_blocks_startup() {
        let base = tempfile::tempdir().unwrap();
        let path = base.path().join("sessiond.pid");
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        let err = PidFile::create(&path).unwrap_err();
        assert!(matches!(err, ServerError::AlreadyRunning { .. }), "{err}");
    }

    #[test]
    fn garbage_pid_file_reads_as_absent() {
        let base = tempfile::tempdir().unwrap();
        let path = base.path().join("sessiond.pid");

        for garbage in ["", "nonsense", "-4\n", "0", "100000000000"] {
            fs::write(&path, garbage).unwrap();
            assert_eq!(read_recorded_pid(&path), None, "{garbage:?}");
        }
    }

    #[tokio::test]
    async fn bind_listener_accepts_connections() {
        let base = tempfile::tempdir().unwrap();
        let path = base.path().join(SOCKET_NAME);

        let listener = bind_listener(&path).unwrap();
        let client = tokio::net::UnixStream::connect(&path).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        drop(client);
        drop(server_side);
    }

    #[tokio::test]
    async fn bind_listener_replaces_stale_socket() {
        let base = tempfile::tempdir().unwrap();
        let path = base.path().join(SOCKET_NAME);

        drop(bind_listener(&path).unwrap());
        // Socket node still on disk; a second bind must succeed.
        let _listener = bind_listener(&path).unwrap();
    }

    #[test]
    fn bind_listener_rejects_overlong_path() {
        let base = tempfile::tempdir().unwrap();
        let long = "x".repeat(200);
        let path = base.path().join(long).join(SOCKET_NAME);

        let err = bind_listener(&path).unwrap_err();
        assert!(matches!(err, ServerError::PathTooLong { .. }), "{err}");
    }
}
