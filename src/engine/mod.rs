//! The program runtime hosted by pool workers.
//!
//! A worker is one interpreter process for its whole life. It is started
//! once with a bootstrap that runs the preloader in-process, so modules the
//! preloader imported and any state it left behind are still there when the
//! job runs in the same interpreter.
//!
//! The bootstrap speaks the internal channel protocol of
//! [`crate::pool::worker`]: it reads a group-join frame and acks it, then
//! reads one [`crate::pool::WorkerJob`] frame and runs it.

use std::convert::Infallible;
use std::os::unix::io::{AsRawFd, BorrowedFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::errno::Errno;
use tracing::debug;

use crate::error::{PrewarmError, Result};

/// Default interpreter for [`PythonEngine`].
pub const DEFAULT_INTERPRETER: &str = "python3";

/// Worker side of the internal channel protocol, run inside the interpreter.
const BOOTSTRAP: &str = include_str!("bootstrap.py");

/// Descriptors and files a worker runtime starts from.
#[derive(Debug, Clone, Copy)]
pub struct WorkerLaunch<'a> {
    /// Program run before the worker is considered warm.
    pub preloader: &'a Path,
    /// Worker end of the internal channel to the supervisor.
    pub channel: BorrowedFd<'a>,
    /// The server's terminal stdin, bound to fd 0 once a job arrives.
    pub terminal: BorrowedFd<'a>,
}

/// A program runtime that can become a warm pool worker.
pub trait Engine {
    /// Replace the current, freshly forked process with a worker runtime.
    /// Only returns if the runtime could not be started.
    fn exec_worker(&self, launch: &WorkerLaunch<'_>) -> Result<Infallible>;

    /// Run a job in this process without a pool. Only returns on failure.
    fn exec_direct(&self, argv: &[String]) -> Result<Infallible>;
}

/// Hosts a Python interpreter.
///
/// Workers run the embedded bootstrap with `-c`; the channel and terminal
/// descriptors are passed by number and survive the `exec`.
#[derive(Debug, Clone)]
pub struct PythonEngine {
    interpreter: PathBuf,
}

impl PythonEngine {
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }

    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    /// Command line of a worker for `launch`.
    fn worker_command(&self, launch: &WorkerLaunch<'_>) -> Command {
        let mut cmd = Command::new(&self.interpreter);
        cmd.arg("-c")
            .arg(BOOTSTRAP)
            .arg(launch.channel.as_raw_fd().to_string())
            .arg(launch.terminal.as_raw_fd().to_string())
            .arg(launch.preloader);
        cmd
    }

    fn exec_failed(&self, err: std::io::Error) -> PrewarmError {
        PrewarmError::spawn(
            "interpreter",
            format!("{}: {}", self.interpreter.display(), err),
        )
    }
}

impl Default for PythonEngine {
    fn default() -> Self {
        Self::new(DEFAULT_INTERPRETER)
    }
}

impl Engine for PythonEngine {
    fn exec_worker(&self, launch: &WorkerLaunch<'_>) -> Result<Infallible> {
        keep_across_exec(launch.channel)?;
        keep_across_exec(launch.terminal)?;
        debug!(interpreter = %self.interpreter.display(), "Starting worker runtime");
        let err = self.worker_command(launch).exec();
        Err(self.exec_failed(err))
    }

    fn exec_direct(&self, argv: &[String]) -> Result<Infallible> {
        // The interpreter gets the program exactly as the caller named it.
        let err = Command::new(&self.interpreter).args(argv).exec();
        Err(self.exec_failed(err))
    }
}

/// Clear close-on-exec so `fd` is inherited by the exec'd runtime.
fn keep_across_exec(fd: BorrowedFd<'_>) -> Result<()> {
    // Safety: F_SETFD only changes the descriptor's flags.
    Errno::result(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, 0) })?;
    Ok(())
}
