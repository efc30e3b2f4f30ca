//! Interrupt deferral for pool processes.
//!
//! Every pool process (server, dispatcher, supervisor, client) routes SIGINT
//! through a [`SignalLatch`]. While the latch is *deferred*, an interrupt is
//! only recorded. Code that is willing to be interrupted calls
//! [`SignalLatch::arm_once`] and then polls [`SignalLatch::check`] from its
//! blocking loop; the first interrupt in that window surfaces as
//! [`Interrupted`] and drops the latch back to deferred mode.
//!
//! The signal handler touches nothing but the atomics in [`LatchState`].

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};

/// The signal every latch in this crate handles.
pub const LATCHED_SIGNAL: Signal = Signal::SIGINT;

/// An interrupt was delivered inside an armed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("interrupted by {LATCHED_SIGNAL}")]
pub struct Interrupted;

/// Shared state written by the signal handler.
///
/// `pending` holds an interrupt that arrived while deferred; `raised` holds one
/// that arrived while armed and has not been observed by [`SignalLatch::check`]
/// yet.
#[derive(Debug)]
pub struct LatchState {
    pending: AtomicBool,
    armed: AtomicBool,
    raised: AtomicBool,
}

impl LatchState {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            raised: AtomicBool::new(false),
        }
    }

    /// Record one interrupt. Async-signal-safe.
    ///
    /// In armed mode this also switches back to deferred, so a second
    /// interrupt before the region notices the first one becomes pending.
    pub fn record(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.raised.store(true, Ordering::SeqCst);
        } else {
            self.pending.store(true, Ordering::SeqCst);
        }
    }

    fn reset(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.pending.store(false, Ordering::SeqCst);
        self.raised.store(false, Ordering::SeqCst);
    }
}

impl Default for LatchState {
    fn default() -> Self {
        Self::new()
    }
}

/// The latch state of this process. A forked child gets a copy, which
/// [`SignalLatch::install`] clears.
static PROCESS_STATE: LatchState = LatchState::new();

extern "C" fn on_interrupt(_signum: libc::c_int) {
    PROCESS_STATE.record();
}

/// Two-mode interrupt latch (deferred / armed).
#[derive(Debug, Clone, Copy)]
pub struct SignalLatch {
    state: &'static LatchState,
}

impl SignalLatch {
    /// Install the recording handler for this process and return its latch,
    /// in deferred mode with nothing pending.
    ///
    /// Call once at the start of every process, including right after a fork:
    /// the parent's pending interrupt belongs to the parent.
    pub fn install() -> crate::error::Result<Self> {
        PROCESS_STATE.reset();
        let action = SigAction::new(
            SigHandler::Handler(on_interrupt),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // Safety: the handler only stores to atomics.
        unsafe { signal::sigaction(LATCHED_SIGNAL, &action) }?;
        Ok(Self {
            state: &PROCESS_STATE,
        })
    }

    /// A latch over caller-provided state, with no handler installed.
    /// Interrupts are fed in through [`LatchState::record`].
    pub fn with_state(state: &'static LatchState) -> Self {
        Self { state }
    }

    /// Enter deferred mode. An interrupt that was raised but never observed
    /// is kept as pending for the next armed region.
    pub fn defer(&self) {
        self.state.armed.store(false, Ordering::SeqCst);
        if self.state.raised.swap(false, Ordering::SeqCst) {
            self.state.pending.store(true, Ordering::SeqCst);
        }
    }

    /// Enter armed mode.
    ///
    /// If an interrupt is already pending it is raised right here: the latch
    /// returns to deferred mode and `Err(Interrupted)` comes back.
    pub fn arm_once(&self) -> Result<(), Interrupted> {
        self.state.armed.store(true, Ordering::SeqCst);
        let pending = self.state.pending.swap(false, Ordering::SeqCst);
        let raised = self.state.raised.swap(false, Ordering::SeqCst);
        if pending || raised {
            self.state.armed.store(false, Ordering::SeqCst);
            return Err(Interrupted);
        }
        Ok(())
    }

    /// Poll point inside an armed region.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.state.raised.swap(false, Ordering::SeqCst) {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    /// Hand the signal back to its default disposition, dropping anything
    /// recorded so far.
    pub fn release(self) -> crate::error::Result<()> {
        self.state.reset();
        restore_default_disposition(LATCHED_SIGNAL)
    }
}

/// Reset `signal` to `SIG_DFL`.
pub fn restore_default_disposition(signal: Signal) -> crate::error::Result<()> {
    // Safety: installing the default disposition runs no Rust code.
    unsafe { signal::signal(signal, SigHandler::SigDfl) }?;
    Ok(())
}
