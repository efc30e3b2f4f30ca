//! How a job ended, and how that travels back to the client.
//!
//! On the wire a job's fate is a single integer: the exit status for a
//! normal exit, or minus the signal number for a signal death. A worker the
//! supervisor had to kill reports `-SIGKILL`.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Reason a worker child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by a signal it did not handle.
    Signaled(Signal),
    /// Outlived its interrupt grace period and was killed by the supervisor.
    ForceKilled,
}

impl Termination {
    /// Interpret a reaped wait status. `None` for statuses that do not mean
    /// the process is gone (still alive, stopped, continued).
    pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Self::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(Self::Signaled(signal)),
            _ => None,
        }
    }

    /// Wire encoding used in [`super::protocol::JobResult`].
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(signal) => -(*signal as i32),
            Self::ForceKilled => -(Signal::SIGKILL as i32),
        }
    }

    /// Decode a wire exit code.
    ///
    /// A negative code that names no known signal is folded into an exit
    /// status the way a shell would report it.
    pub fn from_exit_code(code: i32) -> Self {
        if code >= 0 {
            return Self::Exited(code);
        }
        match Signal::try_from(code.saturating_neg()) {
            Ok(signal) => Self::Signaled(signal),
            Err(_) => Self::Exited(128i32.saturating_sub(code).min(255)),
        }
    }

    /// The status a shell would show (`$?`).
    pub fn shell_status(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(signal) => 128 + *signal as i32,
            Self::ForceKilled => 128 + Signal::SIGKILL as i32,
        }
    }

    /// Signal to reproduce on the client, if any.
    pub fn signal(&self) -> Option<Signal> {
        match self {
            Self::Exited(_) => None,
            Self::Signaled(signal) => Some(*signal),
            Self::ForceKilled => Some(Signal::SIGKILL),
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(signal) => format!("killed by {}", signal),
            Self::ForceKilled => "killed after ignoring an interrupt".to_string(),
        }
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
