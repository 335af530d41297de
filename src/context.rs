//! Caller context forwarded to the flush handler.
//!
//! Operations that may run the handler synchronously (`add`, `flush` and `close`) take a `Context`
//! from the caller and pass it on to the handler unchanged. Flushes run by the background
//! scheduling thread have no caller waiting on them and use `Context::background()`.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cancellation token shared between clones.
///
/// The buffer never cancels on its own; it is up to the handler to check `is_cancelled`.
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Cancellation {
        Cancellation::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Marks token and all its clones as cancelled.
    ///
    /// Returns `true` if this call was the one to cancel it.
    pub fn cancel(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Optional point in time by which the caller expects the operation to complete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub const fn none() -> Deadline {
        Deadline(None)
    }

    pub fn at(instant: Instant) -> Deadline {
        Deadline(Some(instant))
    }

    /// Deadline `timeout` from now; saturates to no deadline if it cannot be represented.
    pub fn after(timeout: Duration) -> Deadline {
        Deadline(Instant::now().checked_add(timeout))
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// Time left until deadline; `Some(Duration::ZERO)` once expired and `None` if there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        match self.0 {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}

/// Deadline and cancellation supplied by the caller of a flush triggering operation.
#[derive(Clone, Debug, Default)]
pub struct Context {
    deadline: Deadline,
    cancellation: Cancellation,
}

impl Context {
    /// Context with no deadline that is never cancelled by the buffer.
    pub fn background() -> Context {
        Context::default()
    }

    /// Context expiring `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Context {
        Context::background().with_deadline(Deadline::after(timeout))
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Context {
        self.deadline = deadline;
        self
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Context {
        self.cancellation = cancellation;
        self
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// Checks if context was cancelled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        self.cancellation.is_cancelled() || self.deadline.is_expired()
    }
}
