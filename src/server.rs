//! `prewarm serve`: run a shell with a warm pool behind it.
//!
//! The server binds a fresh socket, forks the dispatcher, and runs the
//! user's shell with [`SERVER_ENV`] pointing at the socket. Every
//! `prewarm run` started from that shell is served by the pool. When the
//! shell exits, everything the server started is killed and the socket file
//! is removed.

use std::os::unix::io::AsFd;
use std::os::unix::net::UnixListener;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::error::{PrewarmError, Result};
use crate::paths::{SERVER_ENV, new_socket_path};
use crate::pool::{Dispatcher, ForkSpawner, Proc, SignalLatch, SlotConfig, fork_process};
use crate::proctree;

/// Shell used when `$SHELL` is unset.
pub const FALLBACK_SHELL: &str = "/bin/sh";

/// Configuration for a pool server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Per-slot settings (preloader, grace period).
    pub slot: SlotConfig,
    /// Number of warm slots.
    pub workers: usize,
    /// Shell to run; `$SHELL` or [`FALLBACK_SHELL`] when unset.
    pub shell: Option<PathBuf>,
}

impl ServerConfig {
    pub fn new(slot: SlotConfig, workers: usize) -> Self {
        Self {
            slot,
            workers,
            shell: None,
        }
    }

    fn shell(&self) -> PathBuf {
        self.shell
            .clone()
            .or_else(|| std::env::var_os("SHELL").filter(|s| !s.is_empty()).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(FALLBACK_SHELL))
    }
}

/// Removes the socket file when dropped.
struct SocketFile(PathBuf);

impl Drop for SocketFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => debug!(socket = %self.0.display(), "Removed socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(socket = %self.0.display(), error = %e, "Failed to remove socket"),
        }
    }
}

/// Status a shell would report for a child that ended with `status`.
fn shell_status(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

/// Run the pool and the shell. Returns the shell's exit status.
pub fn run_server<E: Engine>(config: ServerConfig, engine: E) -> Result<i32> {
    if config.workers == 0 {
        return Err(PrewarmError::Worker(
            "Pool size must be at least 1".to_string(),
        ));
    }
    // Interrupts typed into the shell must not take the pool down.
    let _latch = SignalLatch::install()?;

    let terminal = std::io::stdin().as_fd().try_clone_to_owned()?;
    let socket_path = new_socket_path();
    let listener = UnixListener::bind(&socket_path)?;
    let _socket = SocketFile(socket_path.clone());
    info!(
        socket = %socket_path.display(),
        workers = config.workers,
        preloader = %config.slot.preloader.display(),
        "Starting pool"
    );

    let workers = config.workers;
    let slot_config = config.slot.clone();
    let dispatcher = fork_process("dispatcher", move || {
        run_dispatcher(listener, ForkSpawner::new(slot_config, engine, terminal), workers)
    })?;
    let mut dispatcher = Proc::new(dispatcher);

    let status = run_shell(&config.shell(), &socket_path);

    let killed = proctree::kill_descendants(nix::unistd::getpid())?;
    debug!(killed, "Pool torn down");
    dispatcher.wait()?;

    status
}

fn run_shell(shell: &Path, socket: &Path) -> Result<i32> {
    debug!(shell = %shell.display(), "Starting shell");
    let status = Command::new(shell)
        .env(SERVER_ENV, socket)
        .status()
        .map_err(|e| PrewarmError::spawn("shell", format!("{}: {}", shell.display(), e)))?;
    Ok(shell_status(status))
}

/// Body of the forked dispatcher process.
fn run_dispatcher<E: Engine>(listener: UnixListener, spawner: ForkSpawner<E>, workers: usize) -> i32 {
    let latch = match SignalLatch::install() {
        Ok(latch) => latch,
        Err(e) => {
            error!(error = %e, "Dispatcher could not install interrupt handler");
            return 1;
        }
    };
    match Dispatcher::new(listener, spawner, workers) {
        Ok(mut dispatcher) => dispatcher.run(&latch),
        Err(e) => {
            error!(error = %e, "Failed to start pool");
            1
        }
    }
}
