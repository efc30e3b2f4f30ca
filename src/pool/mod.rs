//! Warm process pool.
//!
//! A pool keeps N slots ready. Each slot is a supervisor process with a
//! preloaded worker child. A client claims a slot through the dispatcher,
//! then talks to the slot's supervisor directly; the dispatcher is off the
//! hot path once the slot's socket has been handed over.
//!
//! # Architecture
//!
//! ```text
//!   ┌────────┐ connect  ┌────────────┐
//!   │ Client ├─────────►│ Dispatcher │  accept loop, FIFO of slots
//!   └───┬────┘◄─────────┴─────┬──────┘
//!       │    SCM_RIGHTS       │ fork
//!       │                ┌────▼───────┐ fork ┌────────────┐
//!       └───────────────►│ Supervisor ├─────►│  Worker    │
//!        job / ack / ack │  (slot k)  │ join │ (preloaded │
//!          ◄── result ───┴────────────┘ job  │ runtime)   │
//!                                            └────────────┘
//! ```
//!
//! # Features
//!
//! - **In-process warmth**: each worker is one interpreter that runs the
//!   preloader and then the job, so whatever the preloader loaded is still
//!   in memory when the job starts
//! - **Direct data plane**: job, acks and result go straight between client
//!   and supervisor
//! - **Interrupt routing**: supervisor and worker join the client's process
//!   group, so a terminal interrupt reaches the job and never idle slots
//! - **Self-healing queue**: every claim, successful or not, queues a fresh
//!   slot

pub mod client;
pub mod dispatcher;
pub mod frame;
pub mod latch;
mod proc;
pub mod protocol;
mod spawn;
mod status;
pub mod supervisor;
pub mod worker;

pub use client::COMM_ERROR_EXIT;
pub use dispatcher::{ClaimOutcome, DEFAULT_WORKERS, Dispatcher, Slot, SlotSpawner};
pub use latch::{Interrupted, LatchState, SignalLatch};
pub use proc::{Proc, WaitOutcome};
pub use protocol::{Job, JobResult, JoinGroup, WorkerJob};
pub use spawn::{DEFAULT_GRACE, ForkSpawner, SlotConfig, fork_process};
pub use status::Termination;
