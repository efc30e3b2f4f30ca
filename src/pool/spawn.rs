//! Forking pool processes.
//!
//! Dispatcher, supervisors and workers are created with a plain `fork()`.
//! Forked children run a closure and leave through [`exit_now`] (or `exec`);
//! they never return into the parent's stack.

use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use nix::unistd::{ForkResult, Pid, fork};
use tracing::debug;

use super::dispatcher::{Slot, SlotSpawner};
use super::proc::Proc;
use super::supervisor;
use crate::engine::Engine;
use crate::error::{PrewarmError, Result};

/// Default time a worker gets to exit after an interrupt.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// Exit status of a forked child whose body panicked.
const PANIC_EXIT: i32 = 101;

/// Fork, run `child` in the new process and exit with its return value.
///
/// Returns the child's pid in the parent. Values moved into `child` are
/// dropped unused in the parent, which closes the parent's copy of any
/// descriptor meant only for the child.
pub fn fork_process<F>(what: &'static str, child: F) -> Result<Pid>
where
    F: FnOnce() -> i32,
{
    // Safety: pool processes are single-threaded when they fork, and the
    // child leaves through `exit_now` without returning into our frames.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child: pid }) => Ok(pid),
        Ok(ForkResult::Child) => {
            let code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(child))
                .unwrap_or(PANIC_EXIT);
            exit_now(code)
        }
        Err(e) => Err(PrewarmError::spawn(what, format!("fork: {}", e))),
    }
}

/// Flush standard streams and exit without unwinding.
pub fn exit_now(code: i32) -> ! {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    std::process::exit(code)
}

/// Close descriptors a forked child inherited but must not keep.
///
/// The values owning them in the copied address space are never used or
/// dropped again in the child.
pub fn close_inherited(fds: &[RawFd]) {
    for &fd in fds {
        if let Err(e) = nix::unistd::close(fd) {
            debug!(fd, error = %e, "Close of inherited descriptor failed");
        }
    }
}

/// Make `target` refer to the same open file as `src`.
pub fn redirect_fd(src: BorrowedFd<'_>, target: RawFd) -> io::Result<()> {
    loop {
        // Safety: dup2 only manipulates the descriptor table.
        if unsafe { libc::dup2(src.as_raw_fd(), target) } >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Point `target` at `/dev/null`.
pub fn redirect_to_null(target: RawFd) -> io::Result<()> {
    let null = File::options().read(true).write(true).open("/dev/null")?;
    redirect_fd(null.as_fd(), target)
}

/// What every slot of a pool runs with.
#[derive(Debug, Clone)]
pub struct SlotConfig {
    /// Program each worker preloads.
    pub preloader: PathBuf,
    /// Time a worker gets to exit after an interrupt.
    pub grace: Duration,
}

impl SlotConfig {
    pub fn new(preloader: impl Into<PathBuf>) -> Self {
        Self {
            preloader: preloader.into(),
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

/// Spawns real slots: one forked supervisor per slot, which in turn forks
/// its worker child and starts it preloading.
pub struct ForkSpawner<E: Engine> {
    config: SlotConfig,
    engine: E,
    /// Duplicate of the server's terminal stdin, handed down to workers.
    terminal: OwnedFd,
    next_id: usize,
    /// Supervisors whose slot was handed off, waiting to be reaped.
    retired: Vec<Proc>,
}

impl<E: Engine> ForkSpawner<E> {
    pub fn new(config: SlotConfig, engine: E, terminal: OwnedFd) -> Self {
        Self {
            config,
            engine,
            terminal,
            next_id: 0,
            retired: Vec::new(),
        }
    }
}

impl<E: Engine> SlotSpawner for ForkSpawner<E> {
    fn spawn(&mut self, close_in_child: &[RawFd]) -> Result<Slot> {
        let id = self.next_id;
        self.next_id += 1;

        let (dispatcher_end, supervisor_end) = UnixStream::pair()?;
        let mut inherited = close_in_child.to_vec();
        inherited.push(dispatcher_end.as_raw_fd());

        let engine = &self.engine;
        let terminal = self.terminal.as_fd();
        let config = &self.config;
        let pid = fork_process("supervisor", move || {
            close_inherited(&inherited);
            supervisor::run_slot(id, supervisor_end, terminal, config, engine)
        })?;

        debug!(slot = id, supervisor = pid.as_raw(), "Slot spawned");
        Ok(Slot {
            id,
            supervisor: pid,
            channel: dispatcher_end,
        })
    }

    fn retire(&mut self, slot: Slot) {
        self.retired.push(Proc::new(slot.supervisor));
    }

    fn discard(&mut self, slot: Slot) {
        debug!(slot = slot.id, supervisor = slot.supervisor.as_raw(), "Discarding slot");
        let mut supervisor = Proc::new(slot.supervisor);
        if let Err(e) = supervisor.kill_tree() {
            debug!(slot = slot.id, error = %e, "Could not tear down slot");
        }
    }

    fn reap(&mut self) {
        self.retired.retain_mut(|supervisor| supervisor.is_running());
    }
}
