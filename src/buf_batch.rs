//! This module provides `BufBatch` that holds items pending flush along with the `Instant` at which
//! the oldest of them was appended.
//!
//! `BufBatch` does no locking and no waiting on its own; `FlushBuffer` keeps it behind its state lock
//! and the trigger controller uses `poll()` to find out if the batch has reached one of its limits.
use std::fmt::Debug;
use std::time::{Duration, Instant};

// Upper bound on items buffer allocated up front for each new batch
const PREALLOC_LIMIT: usize = 1024;

/// Represents result from `poll` function where batch is `Ready` to be detached or `NotReady` yet.
#[derive(Debug, PartialEq, Eq)]
pub enum PollResult {
    /// Batch has reached `max_size` or `max_duration` since its oldest item.
    Ready,
    /// Batch is not ready yet.
    /// Provides `Duration` after which `max_duration` limit will be reached if batch has any items
    /// and time limit is enabled.
    NotReady(Option<Duration>),
}

/// Represents result from `append` function.
#[derive(Debug)]
pub enum Append<I> {
    /// Item started a new batch; provides the `Instant` at which `max_duration` limit will be reached
    /// or `None` if time limit is disabled.
    First(Option<Instant>),
    /// Item was appended to outstanding batch.
    Pending,
    /// Item made the batch reach `max_size`; batch was detached and a new empty one started.
    Full(Vec<I>),
}

/// Outstanding batch of items with the `Instant` its oldest item was appended at.
#[derive(Debug)]
pub struct BufBatch<I: Debug> {
    items: Vec<I>,
    first_item: Option<Instant>,
    max_size: usize,
    max_duration: Duration,
}

impl<I: Debug> BufBatch<I> {
    /// Creates batch given maximum batch size in number of items (`max_size`)
    /// and maximum duration a batch can last (`max_duration`) since first item appended to it.
    ///
    /// Zero `max_duration` disables the time limit.
    ///
    /// Panics if `max_size == 0`.
    pub fn new(max_size: usize, max_duration: Duration) -> BufBatch<I> {
        assert!(max_size > 0, "BufBatch::new bad max_size");

        BufBatch {
            items: Self::fresh_items(max_size),
            first_item: None,
            max_size,
            max_duration,
        }
    }

    fn fresh_items(max_size: usize) -> Vec<I> {
        Vec::with_capacity(max_size.min(PREALLOC_LIMIT))
    }

    /// Number of items in outstanding batch.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// `Instant` at which oldest outstanding item was appended.
    pub fn first_item(&self) -> Option<Instant> {
        self.first_item
    }

    /// Returns slice of internal item buffer.
    pub fn as_slice(&self) -> &[I] {
        self.items.as_slice()
    }

    /// Checks if batch has reached one of its limits.
    ///
    /// Returns:
    /// * `PollResult::Ready` if batch has reached one of its limit and is ready to be detached.
    /// * `PollResult::NotReady(Some(duration))` if it is not ready yet but it will be ready after duration due to duration limit.
    /// * `PollResult::NotReady(None)` if it is not ready yet and has no items or time limit is disabled.
    pub fn poll(&self) -> PollResult {
        debug_assert!(self.items.is_empty() ^ self.first_item.is_some());

        if self.items.len() >= self.max_size {
            return PollResult::Ready;
        }

        match self.first_item {
            Some(first_item) if self.max_duration > Duration::ZERO => {
                let since_start = Instant::now().saturating_duration_since(first_item);

                if since_start >= self.max_duration {
                    return PollResult::Ready;
                }

                PollResult::NotReady(Some(self.max_duration - since_start))
            }
            _ => PollResult::NotReady(None),
        }
    }

    /// Appends item to the batch.
    ///
    /// When the item makes the batch reach `max_size` the whole batch is detached and returned
    /// with `Append::Full`, so the batch is never found full by the next `append` call.
    pub fn append(&mut self, item: I) -> Append<I> {
        debug_assert!(self.items.is_empty() ^ self.first_item.is_some());
        debug_assert!(self.items.len() < self.max_size);

        let first = self.first_item.is_none();
        // Count `max_duration` from first item appended
        let first_item = *self.first_item.get_or_insert_with(Instant::now);

        self.items.push(item);

        if self.items.len() >= self.max_size {
            // Checked above
            return Append::Full(self.detach().unwrap_or_default());
        }

        if first {
            let deadline = if self.max_duration > Duration::ZERO {
                first_item.checked_add(self.max_duration)
            } else {
                None
            };
            return Append::First(deadline);
        }

        Append::Pending
    }

    /// Detaches all outstanding items by swapping items buffer with a newly allocated one.
    ///
    /// Returns `None` if batch is empty.
    pub fn detach(&mut self) -> Option<Vec<I>> {
        if self.items.is_empty() {
            return None;
        }

        self.first_item = None;
        Some(std::mem::replace(&mut self.items, Self::fresh_items(self.max_size)))
    }
}
