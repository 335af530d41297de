//! Flush executor that hands detached batches over to the `Handler`.
//!
//! Batches are executed on the thread of the operation that detached them, after the buffer state
//! lock was released, so a slow handler never holds up producers appending the next batch.
use crate::context::Context;
use log::{debug, error};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Consumer of flushed batches.
///
/// Invoked at most once per detached batch; the buffer never retries a failed batch.
/// Implemented for closures `Fn(Vec<I>, &Context) -> Result<(), E>`.
pub trait Handler<I>: Send + Sync + 'static {
    type Error: fmt::Debug + Send + 'static;

    fn handle(&self, batch: Vec<I>, ctx: &Context) -> Result<(), Self::Error>;
}

impl<I, E, F> Handler<I> for F
where
    F: Fn(Vec<I>, &Context) -> Result<(), E> + Send + Sync + 'static,
    E: fmt::Debug + Send + 'static,
{
    type Error = E;

    fn handle(&self, batch: Vec<I>, ctx: &Context) -> Result<(), E> {
        self(batch, ctx)
    }
}

/// Callback receiving handler errors that no caller is waiting for.
pub type ErrorHook<E> = Box<dyn Fn(FlushReason, &E) + Send + Sync>;

/// What caused batch to be detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushReason {
    /// Batch reached its capacity on `add`.
    Size,
    /// Interval has elapsed since the oldest item of the batch.
    Timeout,
    /// `flush` was called.
    Manual,
    /// `request_flush` was called; flushed on the scheduling thread.
    Requested,
    /// Buffer was closed.
    Close,
}

impl FlushReason {
    /// Batches flushed for these reasons run on the scheduling thread with no caller to report to.
    pub fn is_background(&self) -> bool {
        matches!(self, FlushReason::Timeout | FlushReason::Requested)
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let reason = match self {
            FlushReason::Size => "size",
            FlushReason::Timeout => "timeout",
            FlushReason::Manual => "manual",
            FlushReason::Requested => "requested",
            FlushReason::Close => "close",
        };
        f.write_str(reason)
    }
}

/// Usage statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Batches flushed on reaching capacity.
    pub size_flushes: u64,
    /// Batches flushed by the timer.
    pub timeout_flushes: u64,
    /// Batches flushed by `flush`.
    pub manual_flushes: u64,
    /// Batches flushed by `request_flush`.
    pub requested_flushes: u64,
    /// Batches flushed on close.
    pub close_flushes: u64,
    /// Total number of items handed to the handler.
    pub items_flushed: u64,
    /// Number of batches the handler failed on.
    pub handler_failures: u64,
    /// Number of failed batches that had no caller to return the error to.
    pub background_failures: u64,
}

impl Stats {
    /// Total number of batches handed to the handler.
    pub fn flushes(&self) -> u64 {
        self.size_flushes
            + self.timeout_flushes
            + self.manual_flushes
            + self.requested_flushes
            + self.close_flushes
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    size_flushes: AtomicU64,
    timeout_flushes: AtomicU64,
    manual_flushes: AtomicU64,
    requested_flushes: AtomicU64,
    close_flushes: AtomicU64,
    items_flushed: AtomicU64,
    handler_failures: AtomicU64,
    background_failures: AtomicU64,
}

impl Counters {
    fn record(&self, reason: FlushReason, items: usize, ok: bool) {
        let flushes = match reason {
            FlushReason::Size => &self.size_flushes,
            FlushReason::Timeout => &self.timeout_flushes,
            FlushReason::Manual => &self.manual_flushes,
            FlushReason::Requested => &self.requested_flushes,
            FlushReason::Close => &self.close_flushes,
        };
        flushes.fetch_add(1, Ordering::Relaxed);
        self.items_flushed.fetch_add(items as u64, Ordering::Relaxed);
        if !ok {
            self.handler_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> Stats {
        Stats {
            size_flushes: self.size_flushes.load(Ordering::Relaxed),
            timeout_flushes: self.timeout_flushes.load(Ordering::Relaxed),
            manual_flushes: self.manual_flushes.load(Ordering::Relaxed),
            requested_flushes: self.requested_flushes.load(Ordering::Relaxed),
            close_flushes: self.close_flushes.load(Ordering::Relaxed),
            items_flushed: self.items_flushed.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            background_failures: self.background_failures.load(Ordering::Relaxed),
        }
    }
}

/// Runs `handler` on detached `batch`. Empty batch is not handed over.
///
/// Must not be called with buffer state lock held.
pub(crate) fn execute<I, H: Handler<I>>(
    name: &str,
    handler: &H,
    counters: &Counters,
    reason: FlushReason,
    batch: Vec<I>,
    ctx: &Context,
) -> Result<(), H::Error> {
    if batch.is_empty() {
        return Ok(());
    }

    let items = batch.len();
    debug!("[{}] flushing {} items ({})", name, items, reason);

    let result = handler.handle(batch, ctx);
    counters.record(reason, items, result.is_ok());
    result
}

/// Surfaces handler failure that has no caller to be returned to.
pub(crate) fn report_background<E: fmt::Debug>(
    name: &str,
    counters: &Counters,
    hook: Option<&ErrorHook<E>>,
    reason: FlushReason,
    err: &E,
) {
    counters.background_failures.fetch_add(1, Ordering::Relaxed);
    error!("[{}] {} flush failed; batch dropped: {:?}", name, reason, err);

    if let Some(hook) = hook {
        hook(reason, err);
    }
}
