//! Messages exchanged on the data plane and the internal channel.
//!
//! All of them are JSON documents carried in length-prefixed frames (see
//! [`super::frame`]).

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

/// One invocation, captured by the client from its own process context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Full argument vector; empty means "start an interactive session".
    pub args: Vec<String>,
    /// Working directory of the invocation.
    pub cwd: PathBuf,
    /// Complete environment of the invocation.
    pub environ: BTreeMap<String, String>,
    /// Process group of the client.
    pub pgid: i32,
}

/// The part of a [`Job`] the worker child needs, forwarded by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerJob {
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub environ: BTreeMap<String, String>,
}

/// Asks a worker to move itself into the client's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinGroup {
    pub pgid: i32,
}

/// Final status of a job, sent by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Exit status, or minus the signal number if the worker was killed.
    pub exit_code: i32,
}

impl Job {
    /// Snapshot the calling process: cwd, environment and process group.
    pub fn capture(args: Vec<String>) -> Result<Self> {
        Ok(Self {
            args,
            cwd: std::env::current_dir()?,
            environ: capture_environment(),
            pgid: nix::unistd::getpgrp().as_raw(),
        })
    }

    pub fn is_interactive(&self) -> bool {
        self.args.is_empty()
    }

    /// Strip the client-only fields for the worker child.
    pub fn to_worker(&self) -> WorkerJob {
        WorkerJob {
            args: self.args.clone(),
            cwd: self.cwd.clone(),
            environ: self.environ.clone(),
        }
    }
}

/// Current environment as UTF-8 pairs. Entries that are not valid UTF-8
/// cannot travel as JSON and are left out.
fn capture_environment() -> BTreeMap<String, String> {
    let mut environ = BTreeMap::new();
    for (key, value) in std::env::vars_os() {
        match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => {
                environ.insert(key, value);
            }
            (Ok(key), Err(_)) => warn!(%key, "Skipping environment variable with non-UTF-8 value"),
            (Err(key), _) => warn!(key = ?key, "Skipping environment variable with non-UTF-8 name"),
        }
    }
    environ
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_job() -> Job {
        Job {
            args: vec!["/srv/tool.py".into(), "--fast".into()],
            cwd: PathBuf::from("/srv"),
            environ: BTreeMap::from([("HOME".to_string(), "/home/op".to_string())]),
            pgid: 4242,
        }
    }

    #[test]
    fn test_job_wire_fields() {
        let value = serde_json::to_value(sample_job()).unwrap();
        assert_eq!(
            value,
            json!({
                "args": ["/srv/tool.py", "--fast"],
                "cwd": "/srv",
                "environ": {"HOME": "/home/op"},
                "pgid": 4242
            })
        );
    }

    #[test]
    fn test_worker_job_drops_pgid() {
        let value = serde_json::to_value(sample_job().to_worker()).unwrap();
        assert!(value.get("pgid").is_none());
        assert_eq!(value["args"][0], "/srv/tool.py");
    }

    #[test]
    fn test_join_group_wire_field() {
        let text = serde_json::to_string(&JoinGroup { pgid: 4242 }).unwrap();
        assert_eq!(text, r#"{"pgid":4242}"#);
    }

    #[test]
    fn test_job_result_wire_field() {
        let text = serde_json::to_string(&JobResult { exit_code: -9 }).unwrap();
        assert_eq!(text, r#"{"exit_code":-9}"#);
    }

    #[test]
    fn test_capture_sees_own_context() {
        let job = Job::capture(vec![]).unwrap();
        assert!(job.is_interactive());
        assert_eq!(job.cwd, std::env::current_dir().unwrap());
        assert_eq!(job.pgid, nix::unistd::getpgrp().as_raw());
        if let Ok(path) = std::env::var("PATH") {
            assert_eq!(job.environ.get("PATH"), Some(&path));
        }
    }
}
