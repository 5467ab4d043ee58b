//! # Generation Futures
//!
//! Blocking handles for in-flight generations.
//!
//! ## Architecture
//!
//! ```text
//!   handle A ──┐
//!   handle B ──┼──> [OutcomeSlot] <── worker completes once
//!   handle C ──┘     (outcome + condvar + callbacks)
//! ```
//!
//! Every caller that joins the same fingerprint gets its own handle onto the
//! same slot, so all of them observe the same `Arc<GenerationResult>` (or
//! the same error). Handles track their own cancellation and deadline; the
//! slot tracks how many handles are still interested.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lotgen_core::{GenerationError, GenerationResult};
use parking_lot::{Condvar, Mutex};

/// What a generation resolves to.
pub type Outcome = Result<Arc<GenerationResult>, GenerationError>;

type Callback = Box<dyn FnOnce(&Outcome) + Send>;

/// Shared completion state of one computation.
pub(crate) struct OutcomeSlot {
    done: AtomicBool,
    state: Mutex<SlotState>,
    condvar: Condvar,
    /// Handles that have not cancelled.
    interested: AtomicUsize,
}

#[derive(Default)]
struct SlotState {
    outcome: Option<Outcome>,
    callbacks: Vec<Callback>,
}

impl OutcomeSlot {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            done: AtomicBool::new(false),
            state: Mutex::new(SlotState::default()),
            condvar: Condvar::new(),
            interested: AtomicUsize::new(0),
        })
    }

    /// Stores the outcome and wakes every waiter. Later calls are ignored.
    ///
    /// Returns true if this call delivered the outcome.
    pub(crate) fn complete(&self, outcome: Outcome) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            self.done.store(true, Ordering::Release);
            std::mem::take(&mut state.callbacks)
        };
        self.condvar.notify_all();
        for callback in callbacks {
            callback(&outcome);
        }
        true
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Number of handles that still want the outcome.
    pub(crate) fn interested(&self) -> usize {
        self.interested.load(Ordering::Acquire)
    }

    /// Creates a new interested handle.
    pub(crate) fn subscribe(self: &Arc<Self>, deadline: Option<Duration>) -> GenerationFuture {
        self.interested.fetch_add(1, Ordering::AcqRel);
        GenerationFuture {
            slot: Arc::clone(self),
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: deadline.map(|d| (d, Instant::now() + d)),
        }
    }

    fn outcome(&self) -> Option<Outcome> {
        self.state.lock().outcome.clone()
    }

    fn wait_until(&self, until: Option<Instant>) -> Option<Outcome> {
        if self.is_done() {
            return self.outcome();
        }
        let mut state = self.state.lock();
        while state.outcome.is_none() {
            match until {
                Some(at) => {
                    if self.condvar.wait_until(&mut state, at).timed_out() {
                        return state.outcome.clone();
                    }
                }
                None => self.condvar.wait(&mut state),
            }
        }
        state.outcome.clone()
    }
}

/// Handle to the outcome of a generation.
///
/// Dropping a handle does not cancel anything; the generation still runs
/// and populates the cache. Use [`GenerationFuture::cancel`] to give up.
pub struct GenerationFuture {
    slot: Arc<OutcomeSlot>,
    cancelled: Arc<AtomicBool>,
    /// Relative deadline and the instant it expires.
    deadline: Option<(Duration, Instant)>,
}

impl GenerationFuture {
    /// A future that is already resolved.
    #[must_use]
    pub fn resolved(outcome: Outcome) -> Self {
        let slot = OutcomeSlot::new();
        slot.complete(outcome);
        slot.subscribe(None)
    }

    /// A future already resolved with an error.
    #[must_use]
    pub fn failed(error: GenerationError) -> Self {
        Self::resolved(Err(error))
    }

    /// Blocks until the outcome is available, the deadline passes or the
    /// handle is cancelled.
    ///
    /// # Errors
    ///
    /// The generation error, `Timeout` after the deadline, or `Cancelled`.
    pub fn wait(&self) -> Outcome {
        if self.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        match self.slot.wait_until(self.deadline.map(|(_, at)| at)) {
            Some(outcome) => self.filter(outcome),
            None => Err(self.timeout_error()),
        }
    }

    /// Blocks for at most `timeout`. `None` if still pending.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        if self.is_cancelled() {
            return Some(Err(GenerationError::Cancelled));
        }
        let mut until = Instant::now() + timeout;
        let mut deadline_first = false;
        if let Some((_, at)) = self.deadline {
            if at <= until {
                until = at;
                deadline_first = true;
            }
        }
        match self.slot.wait_until(Some(until)) {
            Some(outcome) => Some(self.filter(outcome)),
            None if deadline_first => Some(Err(self.timeout_error())),
            None => None,
        }
    }

    /// The outcome if already available. Never blocks.
    #[must_use]
    pub fn try_result(&self) -> Option<Outcome> {
        if self.is_cancelled() {
            return Some(Err(GenerationError::Cancelled));
        }
        match self.slot.outcome() {
            Some(outcome) => Some(self.filter(outcome)),
            None if self.deadline_passed() => Some(Err(self.timeout_error())),
            None => None,
        }
    }

    /// Returns true if the underlying computation has finished.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.slot.is_done()
    }

    /// Gives up on the outcome.
    ///
    /// If no other handle still wants it and the job has not started yet,
    /// the job is dropped without calling the engine. A running job
    /// completes normally and is still cached.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.slot.interested.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Returns true if [`cancel`](Self::cancel) was called on this handle.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Runs `callback` with the outcome as seen by this handle.
    ///
    /// Runs immediately on the calling thread if the outcome is already
    /// available, otherwise on the thread that completes the generation.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        let cancelled = Arc::clone(&self.cancelled);
        let deadline = self.deadline;
        let deliver = move |outcome: &Outcome| {
            let seen = if cancelled.load(Ordering::Acquire) {
                Err(GenerationError::Cancelled)
            } else if deadline.is_some_and(|(_, at)| Instant::now() > at) {
                Err(GenerationError::Timeout {
                    after: deadline.map_or(Duration::ZERO, |(d, _)| d),
                })
            } else {
                outcome.clone()
            };
            callback(seen);
        };

        let mut state = self.slot.state.lock();
        match state.outcome.clone() {
            Some(outcome) => {
                drop(state);
                deliver(&outcome);
            }
            None => state.callbacks.push(Box::new(deliver)),
        }
    }

    /// Returns true if both handles observe the same computation.
    #[must_use]
    pub fn shares_computation_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    fn filter(&self, outcome: Outcome) -> Outcome {
        if self.is_cancelled() {
            Err(GenerationError::Cancelled)
        } else {
            outcome
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|(_, at)| Instant::now() >= at)
    }

    fn timeout_error(&self) -> GenerationError {
        GenerationError::Timeout {
            after: self.deadline.map_or(Duration::ZERO, |(d, _)| d),
        }
    }
}

impl Clone for GenerationFuture {
    /// The clone is a separate interested handle with the same deadline.
    fn clone(&self) -> Self {
        let cancelled = self.is_cancelled();
        if !cancelled {
            self.slot.interested.fetch_add(1, Ordering::AcqRel);
        }
        Self {
            slot: Arc::clone(&self.slot),
            cancelled: Arc::new(AtomicBool::new(cancelled)),
            deadline: self.deadline,
        }
    }
}

impl std::fmt::Debug for GenerationFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationFuture")
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline.map(|(d, _)| d))
            .finish()
    }
}
