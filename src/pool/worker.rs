//! Worker child and the internal channel that drives it.
//!
//! A worker is forked by its supervisor, prepared here, and then replaced
//! by the engine's runtime (see [`crate::engine`]). The runtime preloads
//! with its output discarded, then follows this exchange on the channel:
//!
//! 1. the supervisor sends a [`JoinGroup`]; the worker moves itself into
//!    that process group and answers with an ack byte
//! 2. the supervisor sends the [`WorkerJob`]; the worker binds the terminal
//!    to stdin, takes the job's environment and working directory, runs the
//!    job and exits
//!
//! A parent cannot change the process group of a child that has exec'd
//! (`EACCES`), so the worker joins by itself. EOF at either step means the
//! supervisor is gone and the worker exits quietly.

use std::convert::Infallible;
use std::os::unix::io::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use tracing::debug;

use super::frame;
use super::latch;
use super::protocol::{JoinGroup, WorkerJob};
use super::spawn::redirect_to_null;
use crate::engine::{Engine, WorkerLaunch};
use crate::error::{PrewarmError, Result};

/// Exit status of a worker whose runtime could not be started.
pub const START_FAILED_EXIT: i32 = 127;

/// The worker process between `fork` and the runtime's `exec`.
pub struct WorkerChild<'a, E: Engine> {
    engine: &'a E,
    preloader: &'a Path,
    terminal: BorrowedFd<'a>,
    channel: UnixStream,
}

impl<'a, E: Engine> WorkerChild<'a, E> {
    pub fn new(
        engine: &'a E,
        preloader: &'a Path,
        terminal: BorrowedFd<'a>,
        channel: UnixStream,
    ) -> Self {
        Self {
            engine,
            preloader,
            terminal,
            channel,
        }
    }

    /// Start the runtime. Returns an exit status only if that failed.
    pub fn run(self) -> i32 {
        match self.start() {
            Ok(never) => match never {},
            Err(e) => {
                eprintln!("prewarm: {}", e);
                START_FAILED_EXIT
            }
        }
    }

    fn start(&self) -> Result<Infallible> {
        // Interrupts reach the job with their default effect.
        latch::restore_default_disposition(latch::LATCHED_SIGNAL)?;
        // Keep the preloader off the terminal until a job owns it.
        redirect_to_null(libc::STDIN_FILENO)?;

        self.engine.exec_worker(&WorkerLaunch {
            preloader: self.preloader,
            channel: self.channel.as_fd(),
            terminal: self.terminal,
        })
    }
}

/// Supervisor end of the internal channel.
pub struct WorkerChannel {
    stream: UnixStream,
}

impl WorkerChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Have the worker join process group `pgid` and wait until it has.
    ///
    /// Returns `false` if the worker is gone, which happens when it died
    /// while preloading. Its exit status is what the job reports then.
    pub fn join_group(&mut self, pgid: i32) -> Result<bool> {
        if let Err(e) = frame::write_json(&mut self.stream, &JoinGroup { pgid }) {
            debug!(error = %e, "Worker gone before joining the group");
            return Ok(false);
        }
        match frame::read_ack(&mut self.stream) {
            Ok(()) => Ok(true),
            Err(PrewarmError::ShortRead { .. } | PrewarmError::Io(_)) => {
                debug!("Worker gone before acknowledging the group");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Hand the job over. The channel is closed afterwards.
    pub fn send_job(mut self, job: &WorkerJob) -> Result<()> {
        frame::write_json(&mut self.stream, job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PythonEngine;
    use crate::pool::proc::Proc;
    use crate::pool::spawn::fork_process;
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{Pid, getpgrp, setpgid};
    use serial_test::serial;
    use std::collections::BTreeMap;
    use std::io::{self, Write};
    use std::os::unix::io::OwnedFd;
    use std::path::PathBuf;
    use std::process::Command;
    use std::time::Duration;

    fn python_available() -> bool {
        Command::new("python3")
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Preloader that prints (which must be discarded) and leaves state behind.
    const PRELOADER: &str = "import os, sys\nprint('preload noise')\nsys.warm_pid = os.getpid()\n";

    fn fork_worker(dir: &Path, terminal: OwnedFd) -> (Pid, WorkerChannel) {
        let preloader = dir.join("warm.py");
        std::fs::write(&preloader, PRELOADER).unwrap();
        let engine = PythonEngine::new("python3");
        let (supervisor_end, worker_end) = UnixStream::pair().unwrap();

        let pid = fork_process("worker", move || {
            WorkerChild::new(&engine, &preloader, terminal.as_fd(), worker_end).run()
        })
        .unwrap();
        (pid, WorkerChannel::new(supervisor_end))
    }

    fn stdin_dup() -> OwnedFd {
        io::stdin().as_fd().try_clone_to_owned().unwrap()
    }

    #[test]
    #[serial]
    fn test_worker_runs_job_in_preloaded_interpreter() {
        if !python_available() {
            eprintln!("Skipping: python3 not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let report_file = dir.path().join("report.json");
        let job_file = dir.path().join("lib").join("tool.py");
        std::fs::create_dir(dir.path().join("lib")).unwrap();
        std::fs::write(
            &job_file,
            "import json, os, sys\n\
             json.dump({'argv': sys.argv, 'warm': getattr(sys, 'warm_pid', None) == os.getpid(),\n\
             'cwd': os.getcwd(), 'env': dict(os.environ), 'path0': sys.path[0],\n\
             'pgid': os.getpgrp()}, open(os.environ['REPORT'], 'w'))\n\
             sys.exit(23)\n",
        )
        .unwrap();

        // A group of our own session for the worker to join.
        let leader = fork_process("group leader", || {
            std::thread::sleep(Duration::from_secs(30));
            0
        })
        .unwrap();
        setpgid(leader, leader).unwrap();
        let mut leader = Proc::new(leader);

        let (pid, mut channel) = fork_worker(dir.path(), stdin_dup());
        assert!(channel.join_group(leader.pid().as_raw()).unwrap());
        channel
            .send_job(&WorkerJob {
                args: vec![job_file.display().to_string(), "a".into(), "b c".into()],
                cwd: dir.path().to_path_buf(),
                environ: BTreeMap::from([(
                    "REPORT".to_string(),
                    report_file.display().to_string(),
                )]),
            })
            .unwrap();

        assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 23));
        leader.kill_tree().unwrap();

        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&report_file).unwrap()).unwrap();
        assert_eq!(
            report["argv"],
            serde_json::json!([job_file.display().to_string(), "a", "b c"])
        );
        // The job ran in the very process that preloaded.
        assert_eq!(report["warm"], true);
        assert_eq!(
            report["env"],
            serde_json::json!({"REPORT": report_file.display().to_string()})
        );
        assert_eq!(
            PathBuf::from(report["cwd"].as_str().unwrap()),
            dir.path().canonicalize().unwrap()
        );
        assert_eq!(
            PathBuf::from(report["path0"].as_str().unwrap()),
            dir.path().join("lib").canonicalize().unwrap()
        );
        assert_eq!(report["pgid"], leader.pid().as_raw());
    }

    #[test]
    #[serial]
    fn test_worker_empty_args_reads_session_from_terminal() {
        if !python_available() {
            eprintln!("Skipping: python3 not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("session.txt");
        let (terminal, mut typed) = UnixStream::pair().unwrap();
        writeln!(
            typed,
            "import os, sys\nopen({:?}, 'w').write(str(sys.warm_pid == os.getpid()))\nraise SystemExit(4)",
            report.display().to_string()
        )
        .unwrap();
        drop(typed);

        let (pid, mut channel) = fork_worker(dir.path(), OwnedFd::from(terminal));
        assert!(channel.join_group(getpgrp().as_raw()).unwrap());
        channel
            .send_job(&WorkerJob {
                args: vec![],
                cwd: dir.path().to_path_buf(),
                environ: BTreeMap::new(),
            })
            .unwrap();

        assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 4));
        assert_eq!(std::fs::read_to_string(&report).unwrap(), "True");
    }

    #[test]
    #[serial]
    fn test_worker_exits_quietly_when_supervisor_leaves() {
        if !python_available() {
            eprintln!("Skipping: python3 not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (pid, channel) = fork_worker(dir.path(), stdin_dup());
        drop(channel);
        assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 0));
    }

    #[test]
    #[serial]
    fn test_missing_runtime_fails_to_start() {
        let engine = PythonEngine::new("/nonexistent/python");
        let (supervisor_end, worker_end) = UnixStream::pair().unwrap();
        let terminal = stdin_dup();
        let pid = fork_process("worker", move || {
            WorkerChild::new(&engine, Path::new("/srv/warm.py"), terminal.as_fd(), worker_end).run()
        })
        .unwrap();

        assert_eq!(
            waitpid(pid, None).unwrap(),
            WaitStatus::Exited(pid, START_FAILED_EXIT)
        );
        // A dead worker is reported as gone, not as an error.
        let mut channel = WorkerChannel::new(supervisor_end);
        assert!(!channel.join_group(getpgrp().as_raw()).unwrap());
    }
}
