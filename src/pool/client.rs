//! Client side of the data plane.

use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::sys::signal;
use tracing::debug;

use super::frame;
use super::latch::{SignalLatch, restore_default_disposition};
use super::protocol::{Job, JobResult};
use super::spawn::exit_now;
use super::status::Termination;
use crate::error::{PrewarmError, Result};

/// Exit status of a client that lost contact with its slot.
pub const COMM_ERROR_EXIT: i32 = 255;

/// Connect to the pool at `server` and take ownership of one warm slot.
pub fn claim_slot(server: &Path) -> Result<UnixStream> {
    let control = UnixStream::connect(server).map_err(|e| {
        PrewarmError::Handoff(format!("cannot connect to {}: {}", server.display(), e))
    })?;
    let slot = frame::recv_fd(&control)?;
    Ok(UnixStream::from(slot))
}

/// Run `job` over a claimed slot and wait for its result.
pub fn run_job(slot: &mut UnixStream, job: &Job) -> Result<JobResult> {
    frame::write_json(slot, job)?;
    frame::read_ack(slot)
        .map_err(|e| PrewarmError::Handshake(format!("no group acknowledgement: {}", e)))?;
    frame::write_ack(slot)?;
    debug!("Handshake complete; waiting for result");
    frame::read_json(slot)
}

/// Claim a slot, run `job` on it and decode how it ended.
pub fn execute(server: &Path, job: &Job) -> Result<Termination> {
    let mut slot = claim_slot(server)?;
    let result = run_job(&mut slot, job)?;
    Ok(Termination::from_exit_code(result.exit_code))
}

/// Terminate this process the way the job's process terminated.
///
/// A signal death is reproduced by releasing the latch and raising the same
/// signal with its default disposition; if that does not end the process,
/// the shell-style status `128 + signal` is used instead.
pub fn exit_like(termination: Termination, latch: SignalLatch) -> ! {
    if let Some(sig) = termination.signal() {
        debug!(signal = %sig, "Reproducing signal death");
        let released = latch
            .release()
            .and_then(|()| restore_default_disposition(sig));
        if released.is_ok() {
            let _ = signal::raise(sig);
        }
    }
    exit_now(termination.shell_status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::os::unix::io::AsFd;
    use std::os::unix::net::UnixListener;
    use std::path::PathBuf;

    fn job() -> Job {
        Job {
            args: vec!["a.py".into()],
            cwd: PathBuf::from("/"),
            environ: BTreeMap::new(),
            pgid: 1,
        }
    }

    /// Plays the pool: hands a fresh socket pair end to the first client and
    /// runs `supervisor` on the other end.
    fn fake_pool<F>(supervisor: F) -> (tempfile::TempDir, PathBuf, std::thread::JoinHandle<()>)
    where
        F: FnOnce(UnixStream) + Send + 'static,
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let handle = std::thread::spawn(move || {
            let (control, _) = listener.accept().unwrap();
            let (slot, supervisor_end) = UnixStream::pair().unwrap();
            frame::send_fd(&control, slot.as_fd()).unwrap();
            drop(slot);
            supervisor(supervisor_end);
        });
        (dir, path, handle)
    }

    #[test]
    fn test_execute_follows_protocol() {
        let (_dir, path, pool) = fake_pool(|mut conn| {
            let received: Job = frame::read_json(&mut conn).unwrap();
            assert_eq!(received, job());
            frame::write_ack(&mut conn).unwrap();
            frame::read_ack(&mut conn).unwrap();
            frame::write_json(&mut conn, &JobResult { exit_code: -15 }).unwrap();
        });

        let termination = execute(&path, &job()).unwrap();
        pool.join().unwrap();
        assert_eq!(
            termination,
            Termination::Signaled(nix::sys::signal::Signal::SIGTERM)
        );
    }

    #[test]
    fn test_connection_lost_before_result() {
        let (_dir, path, pool) = fake_pool(|mut conn| {
            let _: Job = frame::read_json(&mut conn).unwrap();
            frame::write_ack(&mut conn).unwrap();
            frame::read_ack(&mut conn).unwrap();
        });

        let err = execute(&path, &job()).unwrap_err();
        pool.join().unwrap();
        assert!(matches!(err, PrewarmError::ShortRead { .. }));
    }

    #[test]
    fn test_no_listener() {
        let dir = tempfile::tempdir().unwrap();
        let err = claim_slot(&dir.path().join("missing.sock")).unwrap_err();
        assert!(err.to_string().contains("missing.sock"));
    }
}
