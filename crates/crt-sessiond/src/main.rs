//! crt-sessiond - CRT Plus session daemon binary
//!
//! Bootstrap order matters here:
//!
//! 1. Argument handling and the already-running check happen first, while
//!    stderr still reaches the invoking terminal.
//! 2. Daemonization (double fork, setsid, stdio to the null device,
//!    umask 0077) MUST happen before the Tokio runtime starts. `fork()`
//!    in a process with running worker threads is undefined behavior:
//!    only the calling thread survives into the child, and any lock held
//!    elsewhere stays locked forever. A synchronous `main` forks in a
//!    truly single-threaded context, then builds the runtime manually.
//! 3. The runtime is current-thread; all daemon tasks are fused through
//!    one cooperative event loop, which preserves the protocol's
//!    per-session ordering guarantees.

use std::os::fd::AsRawFd;

use anyhow::{Context, Result};
use clap::Parser;
use crt_core::wire::{DEFAULT_RING_CAPACITY, MAX_RING_CAPACITY, PROTOCOL_VERSION};
use crt_sessiond::server::{
    bind_listener, prepare_socket_dir, process_alive, read_recorded_pid, remove_runtime_files,
    PidFile, SocketDirs,
};
use crt_sessiond::state::StateHandle;
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::{umask, Mode};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// CRT Plus session daemon.
#[derive(Parser, Debug)]
#[command(name = "crt-sessiond", disable_version_flag = true)]
struct Args {
    /// Print version and exit.
    #[arg(long, short = 'v')]
    version: bool,

    /// Send SIGTERM to the running daemon and exit.
    #[arg(long)]
    shutdown: bool,

    /// Run in the foreground with verbose logging.
    #[arg(long)]
    debug: bool,

    /// Run in the foreground (don't daemonize).
    #[arg(long, short = 'f')]
    foreground: bool,

    /// Scrollback ring capacity in bytes per session.
    #[arg(
        long,
        value_name = "BYTES",
        default_value_t = DEFAULT_RING_CAPACITY as u64,
        value_parser = clap::value_parser!(u64).range(1..=MAX_RING_CAPACITY as u64)
    )]
    buffer_size: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        println!(
            "crt-sessiond {} (protocol {})",
            env!("CARGO_PKG_VERSION"),
            PROTOCOL_VERSION
        );
        return Ok(());
    }

    let dirs = SocketDirs::resolve();

    if args.shutdown {
        return shutdown_running_daemon(&dirs);
    }

    // Fail loudly on a second instance while stderr is still visible.
    prepare_socket_dir(&dirs.dir).context("failed to create socket directory")?;
    if let Some(pid) = read_recorded_pid(&dirs.pid_file) {
        if process_alive(pid) {
            anyhow::bail!("daemon already running (pid {pid})");
        }
    }

    let foreground = args.foreground || args.debug;
    if !foreground {
        daemonize().context("daemonization failed")?;
    }

    // Only now is it safe to start the (single-threaded) runtime.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args, dirs))
}

/// Sends SIGTERM to the PID recorded by a running instance.
fn shutdown_running_daemon(dirs: &SocketDirs) -> Result<()> {
    let Some(pid) = read_recorded_pid(&dirs.pid_file) else {
        anyhow::bail!("no running daemon found");
    };
    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .with_context(|| format!("failed to send SIGTERM to pid {pid}"))?;
    println!("sent SIGTERM to daemon (pid {pid})");
    Ok(())
}

/// Double-fork daemonization.
///
/// The parent and the intermediate child both exit; the grandchild loses
/// its controlling terminal, points stdio at the null device, and
/// restricts its file creation mask.
#[allow(unsafe_code)]
fn daemonize() -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    // SAFETY: no runtime exists yet, so the process is single-threaded
    // and fork() duplicates the only thread there is.
    match unsafe { fork() }.context("first fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {},
    }

    setsid().context("setsid failed")?;

    // SAFETY: still the sole thread; the second fork prevents the
    // session leader from reacquiring a controlling terminal.
    match unsafe { fork() }.context("second fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {},
    }

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("cannot open /dev/null")?;
    let null_fd = devnull.as_raw_fd();
    // SAFETY: dup2 onto the three standard descriptors with a valid
    // source fd; devnull stays open past the calls.
    unsafe {
        libc::dup2(null_fd, libc::STDIN_FILENO);
        libc::dup2(null_fd, libc::STDOUT_FILENO);
        libc::dup2(null_fd, libc::STDERR_FILENO);
    }

    umask(Mode::from_bits_truncate(0o077));
    Ok(())
}

/// Installs the SIG_IGN disposition for SIGPIPE; write failures surface
/// as error returns instead.
#[allow(unsafe_code)]
fn ignore_sigpipe() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet};
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // SAFETY: replacing the SIGPIPE disposition with SIG_IGN is safe at
    // any point and affects only this process.
    let _ = unsafe { sigaction(Signal::SIGPIPE, &action) };
}

async fn async_main(args: Args, dirs: SocketDirs) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.debug { "debug" } else { "info" }));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    ignore_sigpipe();

    let pid_file = PidFile::create(&dirs.pid_file).context("failed to write PID file")?;
    let listener = match bind_listener(&dirs.socket) {
        Ok(listener) => listener,
        Err(err) => {
            pid_file.remove();
            return Err(err).context("failed to create listen socket");
        },
    };

    #[allow(clippy::cast_possible_truncation)] // bounded at 64 MiB by clap
    let state = StateHandle::new(args.buffer_size as usize);

    let signal_state = state.clone();
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        signal_state.request_shutdown();
    });

    info!(
        pid = std::process::id(),
        socket = %dirs.socket.display(),
        protocol = PROTOCOL_VERSION,
        "crt-sessiond {} started",
        env!("CARGO_PKG_VERSION")
    );

    let result = crt_sessiond::daemon::run(state, listener).await;

    remove_runtime_files(&dirs);
    info!("crt-sessiond shut down cleanly");
    result
}
