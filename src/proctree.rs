//! Process tree enumeration and teardown.
//!
//! Used wherever a subtree has to go away completely: a supervisor killing a
//! worker that ignored an interrupt, the dispatcher discarding a slot, and
//! the server cleaning up after the shell exits.

use std::collections::{HashMap, VecDeque};
use std::io;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, trace};

/// `(pid, ppid)` for every visible process.
#[cfg(target_os = "linux")]
fn process_table() -> io::Result<Vec<(i32, i32)>> {
    let mut table = Vec::new();
    for entry in std::fs::read_dir("/proc")? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        // Processes may exit while we scan.
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(ppid) = parse_stat_ppid(&stat) {
            table.push((pid, ppid));
        }
    }
    Ok(table)
}

#[cfg(not(target_os = "linux"))]
fn process_table() -> io::Result<Vec<(i32, i32)>> {
    let output = std::process::Command::new("ps")
        .args(["-A", "-o", "pid=", "-o", "ppid="])
        .output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!("ps failed: {}", output.status)));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let ppid = fields.next()?.parse().ok()?;
            Some((pid, ppid))
        })
        .collect())
}

/// Parent pid from the contents of `/proc/<pid>/stat`.
///
/// The command name is parenthesized and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_stat_ppid(stat: &str) -> Option<i32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

/// All descendants of `root`, parents before children. `root` itself is
/// not included.
pub fn descendants(root: Pid) -> io::Result<Vec<Pid>> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for (pid, ppid) in process_table()? {
        children.entry(ppid).or_default().push(pid);
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root.as_raw()]);
    while let Some(parent) = queue.pop_front() {
        for &child in children.get(&parent).into_iter().flatten() {
            found.push(Pid::from_raw(child));
            queue.push_back(child);
        }
    }
    Ok(found)
}

/// Send SIGKILL to every descendant of `root`. Processes that are already
/// gone are skipped. Returns how many were signalled.
///
/// The caller is still responsible for reaping its own direct children.
pub fn kill_descendants(root: Pid) -> io::Result<usize> {
    let victims = descendants(root)?;
    let mut killed = 0;
    for pid in &victims {
        match kill(*pid, Signal::SIGKILL) {
            Ok(()) => killed += 1,
            Err(Errno::ESRCH) => trace!(pid = pid.as_raw(), "Already gone"),
            Err(e) => debug!(pid = pid.as_raw(), error = %e, "Could not kill descendant"),
        }
    }
    debug!(root = root.as_raw(), killed, "Killed process subtree");
    Ok(killed)
}

/// Kill `root` and everything below it. Descendants are collected before
/// `root` dies so none of them is lost to reparenting.
pub fn kill_tree(root: Pid) -> io::Result<()> {
    kill_descendants(root)?;
    match kill(root, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{WaitStatus, waitpid};
    use std::process::Command;
    use std::time::{Duration, Instant};

    #[test]
    fn test_parse_stat_ppid() {
        assert_eq!(parse_stat_ppid("1234 (sleep) S 99 1234 1234 0"), Some(99));
        assert_eq!(
            parse_stat_ppid("77 (odd) name (x)) R 5 77 77 0"),
            Some(5)
        );
        assert_eq!(parse_stat_ppid("garbage"), None);
    }

    fn wait_for<F: FnMut() -> bool>(mut cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_finds_and_kills_grandchildren() {
        let child = Command::new("sh")
            .args(["-c", "sleep 30 & sleep 30 & wait"])
            .spawn()
            .unwrap();
        let root = Pid::from_raw(child.id() as i32);

        assert!(wait_for(|| descendants(root).map(|d| d.len() >= 2).unwrap_or(false)));
        let below = descendants(root).unwrap();

        kill_tree(root).unwrap();
        assert!(matches!(
            waitpid(root, None).unwrap(),
            WaitStatus::Signaled(_, Signal::SIGKILL, _)
        ));

        // The grandchildren are reaped by init; they must stop existing.
        for pid in below {
            assert!(wait_for(|| !is_live(pid)), "pid {} survived", pid);
        }
    }

    #[test]
    fn test_no_descendants() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let root = Pid::from_raw(child.id() as i32);
        assert!(descendants(root).unwrap().is_empty());
        kill_tree(root).unwrap();
        child.wait().unwrap();
    }

    /// Alive and not a zombie.
    fn is_live(pid: Pid) -> bool {
        #[cfg(target_os = "linux")]
        {
            match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
                Ok(stat) => {
                    let state = stat
                        .rfind(')')
                        .and_then(|i| stat[i + 1..].split_whitespace().next());
                    state != Some("Z")
                }
                Err(_) => false,
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            kill(pid, None).is_ok()
        }
    }
}
