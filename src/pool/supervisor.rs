//! Slot supervisor: the client's peer on the data plane.
//!
//! A supervisor is forked by the dispatcher, forks its own worker child and
//! then blocks until a client claims the slot. It owns exactly one job:
//!
//! 1. read the job frame from the client
//! 2. join the client's process group and have the worker join it too
//! 3. ack, and wait for the client's ack
//! 4. forward the job to the worker
//! 5. wait for the worker, armed for interrupts if the job runs a program
//! 6. send the result frame
//!
//! Any failure before step 4 tears down the worker's whole process tree, as
//! does a slot that is closed before any client claimed it.

use std::os::unix::io::{AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use nix::unistd::{Pid, setpgid};
use tracing::{debug, info_span, warn};

use super::frame;
use super::latch::SignalLatch;
use super::proc::{Proc, WaitOutcome};
use super::protocol::{Job, JobResult};
use super::spawn::{SlotConfig, close_inherited, fork_process};
use super::status::Termination;
use super::worker::{WorkerChannel, WorkerChild};
use crate::engine::Engine;
use crate::error::{PrewarmError, Result};

/// Entry point of a forked supervisor process. Returns its exit status.
pub fn run_slot<E: Engine>(
    slot_id: usize,
    conn: UnixStream,
    terminal: BorrowedFd<'_>,
    config: &SlotConfig,
    engine: &E,
) -> i32 {
    let span = info_span!("supervisor", slot = slot_id);
    let _enter = span.enter();

    let result = SignalLatch::install().and_then(|latch| {
        let supervisor = Supervisor::start(
            conn,
            terminal,
            &config.preloader,
            engine,
            latch,
            config.grace,
        )?;
        supervisor.run()
    });
    match result {
        Ok(Some(termination)) => {
            debug!(%termination, "Job finished");
            0
        }
        Ok(None) => {
            debug!("Slot closed before it was claimed");
            0
        }
        Err(e) => {
            warn!(error = %e, "Slot failed");
            1
        }
    }
}

/// Wait for a worker the way a job requires.
///
/// Interactive sessions are waited for with interrupts deferred. Program
/// runs are waited for armed: the first interrupt allows one more armed
/// wait bounded by `grace`; if the worker is still alive after that, its
/// process tree is killed.
pub fn wait_for_worker(
    worker: &mut Proc,
    latch: &SignalLatch,
    armed: bool,
    grace: Duration,
) -> Result<Termination> {
    if !armed {
        return termination_of(worker.wait()?);
    }

    match worker.wait_armed(latch, None)? {
        WaitOutcome::Exited(status) => return termination_of(status),
        WaitOutcome::Interrupted | WaitOutcome::TimedOut => {
            debug!(pid = worker.pid().as_raw(), "Interrupted while waiting for worker");
        }
    }

    match worker.wait_armed(latch, Some(grace))? {
        WaitOutcome::Exited(status) => return termination_of(status),
        WaitOutcome::Interrupted | WaitOutcome::TimedOut => {}
    }

    warn!(pid = worker.pid().as_raw(), "Worker outlived its interrupt; killing process tree");
    worker.kill_tree()?;
    Ok(Termination::ForceKilled)
}

fn termination_of(status: nix::sys::wait::WaitStatus) -> Result<Termination> {
    Termination::from_wait_status(status).ok_or_else(|| {
        PrewarmError::Worker(format!("unexpected wait status {:?}", status))
    })
}

/// One slot's supervisor state.
pub struct Supervisor {
    /// Data-plane socket; the client holds the other end once claimed.
    conn: UnixStream,
    worker: Proc,
    /// Internal channel to the worker; consumed when the job is forwarded.
    channel: Option<WorkerChannel>,
    latch: SignalLatch,
    grace: Duration,
}

impl Supervisor {
    /// Fork the worker child, which starts preloading right away.
    pub fn start<E: Engine>(
        conn: UnixStream,
        terminal: BorrowedFd<'_>,
        preloader: &Path,
        engine: &E,
        latch: SignalLatch,
        grace: Duration,
    ) -> Result<Self> {
        let (channel, worker_end) = UnixStream::pair()?;
        let inherited = [conn.as_raw_fd(), channel.as_raw_fd()];
        let pid = fork_process("worker", move || {
            close_inherited(&inherited);
            WorkerChild::new(engine, preloader, terminal, worker_end).run()
        })?;
        debug!(worker = pid.as_raw(), "Worker forked");
        Ok(Self::from_parts(conn, Proc::new(pid), channel, latch, grace))
    }

    /// Assemble a supervisor around an existing worker process.
    pub fn from_parts(
        conn: UnixStream,
        worker: Proc,
        channel: UnixStream,
        latch: SignalLatch,
        grace: Duration,
    ) -> Self {
        Self {
            conn,
            worker,
            channel: Some(WorkerChannel::new(channel)),
            latch,
            grace,
        }
    }

    /// Serve one job from handshake to result. `None` if the slot was
    /// closed before a client claimed it.
    pub fn run(mut self) -> Result<Option<Termination>> {
        self.latch.defer();
        let job = match self.handshake() {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.worker.kill_tree()?;
                return Ok(None);
            }
            Err(e) => {
                warn!(error = %e, "Handshake failed; tearing down worker");
                self.worker.kill_tree()?;
                return Err(e);
            }
        };

        self.forward(&job);
        let termination = wait_for_worker(
            &mut self.worker,
            &self.latch,
            !job.is_interactive(),
            self.grace,
        )?;
        self.report(termination)?;
        Ok(Some(termination))
    }

    /// Steps 1 to 3: job, group alignment, ack exchange. EOF before the
    /// first byte of a job means the dispatcher dropped the slot.
    fn handshake(&mut self) -> Result<Option<Job>> {
        let Some(job) = frame::read_json_opt::<Job, _>(&mut self.conn)? else {
            return Ok(None);
        };
        if job.pgid <= 0 {
            return Err(PrewarmError::Protocol(format!(
                "invalid process group {}",
                job.pgid
            )));
        }
        debug!(pgid = job.pgid, argc = job.args.len(), "Job received");

        self.join_group(job.pgid)?;

        frame::write_ack(&mut self.conn)?;
        frame::read_ack(&mut self.conn)?;
        Ok(Some(job))
    }

    /// Move ourselves into `pgid`, then the worker. The worker has exec'd
    /// its runtime, so it is asked to move itself. A worker that is already
    /// gone has nothing left to move.
    fn join_group(&mut self, pgid: i32) -> Result<()> {
        setpgid(Pid::from_raw(0), Pid::from_raw(pgid)).map_err(|e| {
            PrewarmError::Handshake(format!("could not join process group {}: {}", pgid, e))
        })?;
        if let Some(channel) = self.channel.as_mut()
            && !channel.join_group(pgid)?
        {
            debug!(worker = self.worker.pid().as_raw(), "Worker exited before the job");
        }
        Ok(())
    }

    /// Step 4. A worker that died during preload cannot take the job; its
    /// exit status is what the client gets.
    fn forward(&mut self, job: &Job) {
        if let Some(channel) = self.channel.take()
            && let Err(e) = channel.send_job(&job.to_worker())
        {
            debug!(error = %e, "Could not forward job to worker");
        }
    }

    fn report(&mut self, termination: Termination) -> Result<()> {
        let result = JobResult {
            exit_code: termination.exit_code(),
        };
        frame::write_json(&mut self.conn, &result)
    }
}
