//! Handle to a child process owned by a pool process.

use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::debug;

use super::latch::SignalLatch;
use crate::error::{PrewarmError, Result};

/// How often armed waits poll the child and the latch.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of a wait inside an armed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The process is gone and has been reaped.
    Exited(WaitStatus),
    /// An interrupt arrived first.
    Interrupted,
    /// The timeout elapsed first.
    TimedOut,
}

/// A direct child of this process.
///
/// Dropping a handle whose process was never reaped kills its whole tree.
#[derive(Debug)]
pub struct Proc {
    pid: Pid,
    /// Set once the process has been reaped.
    status: Option<WaitStatus>,
}

impl Proc {
    pub fn new(pid: Pid) -> Self {
        Self { pid, status: None }
    }

    /// Get the process ID.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Wait status, once reaped.
    pub fn status(&self) -> Option<WaitStatus> {
        self.status
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Try to wait for the process (non-blocking).
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.status = Some(status);
                Ok(Some(status))
            }
            Err(Errno::EINTR) => Ok(None),
            Err(e) => Err(PrewarmError::Worker(format!(
                "waitpid({}) failed: {}",
                self.pid, e
            ))),
        }
    }

    /// Wait for the process to exit (blocking, not interruptible).
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    self.status = Some(status);
                    return Ok(status);
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(PrewarmError::Worker(format!(
                        "waitpid({}) failed: {}",
                        self.pid, e
                    )));
                }
            }
        }
    }

    /// Wait inside an armed region.
    ///
    /// Arms `latch`, then polls until the process exits, an interrupt is
    /// raised, or `timeout` (if any) runs out. The latch is deferred again
    /// on every path out.
    pub fn wait_armed(
        &mut self,
        latch: &SignalLatch,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome> {
        if latch.arm_once().is_err() {
            return Ok(WaitOutcome::Interrupted);
        }
        let outcome = self.poll_armed(latch, timeout);
        latch.defer();
        outcome
    }

    fn poll_armed(&mut self, latch: &SignalLatch, timeout: Option<Duration>) -> Result<WaitOutcome> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(WaitOutcome::Exited(status));
            }
            if latch.check().is_err() {
                return Ok(WaitOutcome::Interrupted);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(WaitOutcome::TimedOut);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// SIGKILL the process and all of its descendants, then reap it.
    pub fn kill_tree(&mut self) -> Result<WaitStatus> {
        if let Some(status) = self.status {
            // Reaped already, but it may have left children behind.
            crate::proctree::kill_descendants(self.pid)?;
            return Ok(status);
        }
        crate::proctree::kill_tree(self.pid)?;
        self.wait()
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.status.is_none() {
            debug!(pid = self.pid.as_raw(), "Killing unreaped child on drop");
            let _ = self.kill_tree();
        }
    }
}
