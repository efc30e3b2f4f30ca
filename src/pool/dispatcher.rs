//! Dispatcher: owns the listening socket and the queue of warm slots.
//!
//! The dispatcher is a single-threaded accept loop. Each accepted
//! connection claims the oldest slot: the slot's socket is handed to the
//! client over `SCM_RIGHTS`, the dispatcher's copy is closed, and a fresh
//! slot joins the back of the queue. After the handoff the dispatcher has
//! no part in the job.

use std::collections::VecDeque;
use std::os::unix::io::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::Duration;

use nix::unistd::Pid;
use tracing::{debug, error, info, trace, warn};

use super::frame;
use super::latch::SignalLatch;
use crate::error::{PrewarmError, Result};

/// Default number of warm slots.
pub const DEFAULT_WORKERS: usize = 4;

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A warm slot waiting in the queue.
#[derive(Debug)]
pub struct Slot {
    /// Sequence number, for logs.
    pub id: usize,
    /// The slot's supervisor process.
    pub supervisor: Pid,
    /// Dispatcher end of the slot's data-plane socket.
    pub channel: UnixStream,
}

/// Creates and disposes of slots on behalf of the dispatcher.
pub trait SlotSpawner {
    /// Create one warm slot. `close_in_child` lists descriptors any forked
    /// process must close right away.
    fn spawn(&mut self, close_in_child: &[RawFd]) -> Result<Slot>;

    /// A slot was handed to a client. Its channel is no longer needed here.
    fn retire(&mut self, slot: Slot);

    /// A claim failed; the slot must not be reused or left running.
    fn discard(&mut self, slot: Slot);

    /// Collect finished slot processes.
    fn reap(&mut self) {}
}

/// What happened to one claim.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The client now holds the slot.
    HandedOff { slot: usize, supervisor: Pid },
    /// The slot was discarded and the client got nothing.
    Failed {
        slot: Option<usize>,
        error: PrewarmError,
    },
}

impl ClaimOutcome {
    pub fn is_handed_off(&self) -> bool {
        matches!(self, Self::HandedOff { .. })
    }
}

/// FIFO of warm slots behind a listening socket.
pub struct Dispatcher<S: SlotSpawner> {
    listener: UnixListener,
    spawner: S,
    slots: VecDeque<Slot>,
    size: usize,
    claims: u64,
}

impl<S: SlotSpawner> Dispatcher<S> {
    /// Create the dispatcher and fill all `size` slots.
    pub fn new(listener: UnixListener, spawner: S, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(PrewarmError::Worker(
                "Pool size must be at least 1".to_string(),
            ));
        }
        let mut dispatcher = Self {
            listener,
            spawner,
            slots: VecDeque::with_capacity(size),
            size,
            claims: 0,
        };
        dispatcher.refill()?;
        Ok(dispatcher)
    }

    /// Number of warm slots queued.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot ids in claim order.
    pub fn queued_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().map(|slot| slot.id)
    }

    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    /// Descriptors a newly forked slot must not keep.
    fn inherited_fds(&self) -> Vec<RawFd> {
        std::iter::once(self.listener.as_raw_fd())
            .chain(self.slots.iter().map(|slot| slot.channel.as_raw_fd()))
            .collect()
    }

    fn push_new_slot(&mut self) -> Result<()> {
        let slot = self.spawner.spawn(&self.inherited_fds())?;
        trace!(slot = slot.id, "Slot queued");
        self.slots.push_back(slot);
        Ok(())
    }

    /// Spawn slots until the queue is back at full size.
    pub fn refill(&mut self) -> Result<()> {
        while self.slots.len() < self.size {
            self.push_new_slot()?;
        }
        Ok(())
    }

    /// Hand the oldest slot to `conn` and queue a replacement.
    pub fn claim(&mut self, conn: UnixStream) -> ClaimOutcome {
        if self.is_empty()
            && let Err(e) = self.refill()
        {
            return ClaimOutcome::Failed {
                slot: None,
                error: e,
            };
        }
        let Some(slot) = self.slots.pop_front() else {
            return ClaimOutcome::Failed {
                slot: None,
                error: PrewarmError::Worker("No warm slot available".to_string()),
            };
        };
        self.claims += 1;

        let id = slot.id;
        let outcome = match frame::send_fd(&conn, slot.channel.as_fd()) {
            Ok(()) => {
                let supervisor = slot.supervisor;
                self.spawner.retire(slot);
                ClaimOutcome::HandedOff {
                    slot: id,
                    supervisor,
                }
            }
            Err(error) => {
                self.spawner.discard(slot);
                ClaimOutcome::Failed {
                    slot: Some(id),
                    error,
                }
            }
        };
        drop(conn);

        if let Err(e) = self.push_new_slot() {
            error!(error = %e, "Failed to spawn replacement slot; retrying on next accept");
        }
        outcome
    }

    /// Accept one connection and serve its claim.
    pub fn serve_one(&mut self) -> Result<ClaimOutcome> {
        let (conn, _) = self.listener.accept()?;
        Ok(self.claim(conn))
    }

    /// Accept loop. Runs until the process is killed.
    pub fn run(&mut self, latch: &SignalLatch) -> ! {
        latch.defer();
        info!(workers = self.size, "Dispatcher ready");
        loop {
            self.spawner.reap();
            if self.len() < self.size
                && let Err(e) = self.refill()
            {
                error!(error = %e, queued = self.len(), "Failed to refill pool");
            }

            match self.serve_one() {
                Ok(ClaimOutcome::HandedOff { slot, supervisor }) => {
                    debug!(
                        slot,
                        supervisor = supervisor.as_raw(),
                        claims = self.claims,
                        "Slot handed off"
                    );
                }
                Ok(ClaimOutcome::Failed { slot, error }) => {
                    warn!(slot, error = %error, "Claim failed; slot discarded");
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    std::thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::path::PathBuf;

    /// Keeps the far end of every slot so tests can see who got which slot.
    #[derive(Default)]
    struct FakeSpawner {
        next_id: usize,
        peers: Vec<(usize, UnixStream)>,
        retired: Vec<usize>,
        discarded: Vec<usize>,
        fail_next: bool,
    }

    impl SlotSpawner for FakeSpawner {
        fn spawn(&mut self, _close_in_child: &[RawFd]) -> Result<Slot> {
            if std::mem::take(&mut self.fail_next) {
                return Err(PrewarmError::spawn("supervisor", "fork: EAGAIN"));
            }
            let (near, far) = UnixStream::pair()?;
            let id = self.next_id;
            self.next_id += 1;
            self.peers.push((id, far));
            Ok(Slot {
                id,
                supervisor: Pid::from_raw(100_000 + id as i32),
                channel: near,
            })
        }

        fn retire(&mut self, slot: Slot) {
            self.retired.push(slot.id);
        }

        fn discard(&mut self, slot: Slot) {
            self.discarded.push(slot.id);
        }
    }

    impl FakeSpawner {
        fn peer(&mut self, id: usize) -> &mut UnixStream {
            &mut self
                .peers
                .iter_mut()
                .find(|(peer_id, _)| *peer_id == id)
                .unwrap()
                .1
        }
    }

    fn dispatcher(size: usize) -> (tempfile::TempDir, PathBuf, Dispatcher<FakeSpawner>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let dispatcher = Dispatcher::new(listener, FakeSpawner::default(), size).unwrap();
        (dir, path, dispatcher)
    }

    #[test]
    fn test_zero_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join("pool.sock")).unwrap();
        assert!(Dispatcher::new(listener, FakeSpawner::default(), 0).is_err());
    }

    #[test]
    fn test_pool_stays_full_and_claims_in_fifo_order() {
        for size in 1..=3 {
            let (_dir, path, mut dispatcher) = dispatcher(size);
            assert_eq!(dispatcher.len(), size);

            for expected in 0..2 * size {
                let client = UnixStream::connect(&path).unwrap();
                let outcome = dispatcher.serve_one().unwrap();
                assert!(
                    matches!(outcome, ClaimOutcome::HandedOff { slot, .. } if slot == expected)
                );
                assert_eq!(dispatcher.len(), size);

                // The client really holds the claimed slot's socket.
                let mut claimed = UnixStream::from(frame::recv_fd(&client).unwrap());
                claimed.write_all(&[expected as u8]).unwrap();
                let mut byte = [0u8; 1];
                dispatcher.spawner.peer(expected).read_exact(&mut byte).unwrap();
                assert_eq!(byte[0], expected as u8);
            }

            let retired = &dispatcher.spawner().retired;
            assert_eq!(*retired, (0..2 * size).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_queue_rotates() {
        let (_dir, path, mut dispatcher) = dispatcher(3);
        assert_eq!(dispatcher.queued_ids().collect::<Vec<_>>(), [0, 1, 2]);

        let _client = UnixStream::connect(&path).unwrap();
        dispatcher.serve_one().unwrap();
        assert_eq!(dispatcher.queued_ids().collect::<Vec<_>>(), [1, 2, 3]);
    }

    #[test]
    fn test_failed_handoff_discards_slot() {
        let (_dir, path, mut dispatcher) = dispatcher(2);

        let client = UnixStream::connect(&path).unwrap();
        drop(client);
        let outcome = dispatcher.serve_one().unwrap();

        assert!(matches!(outcome, ClaimOutcome::Failed { slot: Some(0), .. }));
        assert_eq!(dispatcher.spawner().discarded, [0]);
        assert!(dispatcher.spawner().retired.is_empty());
        assert_eq!(dispatcher.len(), 2);
        assert_eq!(dispatcher.queued_ids().collect::<Vec<_>>(), [1, 2]);
    }

    #[test]
    fn test_failed_replacement_is_retried() {
        let (_dir, path, mut dispatcher) = dispatcher(2);

        dispatcher.spawner.fail_next = true;
        let client = UnixStream::connect(&path).unwrap();
        assert!(dispatcher.serve_one().unwrap().is_handed_off());
        drop(client);
        assert_eq!(dispatcher.len(), 1);

        dispatcher.refill().unwrap();
        assert_eq!(dispatcher.len(), 2);
    }
}
