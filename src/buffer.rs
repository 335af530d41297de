/*!
This module provides `FlushBuffer` that accepts items from any number of producer threads and hands
them over to a `Handler` in batches of up to `capacity` items, or once `interval` has elapsed since
the oldest buffered item was added, whichever comes first.

# Example

```rust
use flush_batch::{Config, Context, Error, FlushBuffer};
use std::time::Duration;
use assert_matches::assert_matches;

let (sender, batches) = crossbeam_channel::unbounded();

// Flush batches of up to 3 items or 100 ms after the first item of the batch was added
let buffer = FlushBuffer::new(
    Config {
        name: "events".to_string(),
        capacity: 3,
        interval: Duration::from_millis(100),
    },
    move |batch: Vec<u32>, _ctx: &Context| sender.send(batch).map_err(|err| err.to_string()),
).unwrap();

let ctx = Context::background();

// Batch flushed due to capacity by the `add` call that filled it up
for item in 1..=4 {
    buffer.add(item, &ctx).unwrap();
}
assert_eq!(batches.recv().unwrap(), [1, 2, 3]);

// Batch flushed by the timer
assert_eq!(batches.recv_timeout(Duration::from_secs(5)).unwrap(), [4]);

// Batch flushed by calling `flush`
buffer.add(5, &ctx).unwrap();
buffer.flush(&ctx).unwrap();
assert_eq!(batches.recv().unwrap(), [5]);

// Last batch flushed on close
buffer.add(6, &ctx).unwrap();
buffer.close(&ctx).unwrap();
assert_eq!(batches.recv().unwrap(), [6]);

assert_matches!(buffer.add(7, &ctx), Err(Error::Closed));
```
!*/

use crate::buf_batch::{Append, BufBatch, PollResult};
use crate::context::Context;
use crate::flush::{self, Counters, ErrorHook, FlushReason, Handler, Stats};
use crate::trigger::{self, Target, Timer};
use crate::{ConfigError, Error};
use log::{debug, warn};
use parking_lot::Mutex;

use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Buffer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Name used in log messages and for the timer thread.
    pub name: String,
    /// Maximum number of items in a batch.
    pub capacity: usize,
    /// Maximum time items can stay buffered counting from the oldest one.
    /// Zero disables time based flushing.
    pub interval: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            name: "batch".to_string(),
            capacity: 100,
            interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if Instant::now().checked_add(self.interval).is_none() {
            return Err(ConfigError::IntervalTooLarge(self.interval));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Closed,
}

#[derive(Debug)]
struct State<I: Debug> {
    batch: BufBatch<I>,
    lifecycle: Lifecycle,
    timer: Timer,
}

impl<I: Debug> State<I> {
    /// Detaches outstanding items and disarms the timer.
    fn detach(&mut self) -> Option<Vec<I>> {
        let batch = self.batch.detach();
        self.timer.disarm();
        batch
    }
}

struct Shared<I: Debug, H: Handler<I>> {
    name: String,
    state: Mutex<State<I>>,
    handler: H,
    counters: Counters,
    on_background_error: Option<ErrorHook<H::Error>>,
}

impl<I, H> Shared<I, H>
where
    I: Debug + Send + 'static,
    H: Handler<I>,
{
    fn execute(&self, reason: FlushReason, batch: Vec<I>, ctx: &Context) -> Result<(), H::Error> {
        flush::execute(&self.name, &self.handler, &self.counters, reason, batch, ctx)
    }

    fn execute_background(&self, reason: FlushReason, batch: Vec<I>) {
        if let Err(err) = self.execute(reason, batch, &Context::background()) {
            self.report_background(reason, &err);
        }
    }

    fn report_background(&self, reason: FlushReason, err: &H::Error) {
        flush::report_background(
            &self.name,
            &self.counters,
            self.on_background_error.as_ref(),
            reason,
            err,
        );
    }
}

impl<I, H> Target for Shared<I, H>
where
    I: Debug + Send + 'static,
    H: Handler<I>,
{
    fn expired(&self, generation: u64) -> Option<Instant> {
        let batch = {
            let mut state = self.state.lock();

            // Batch was already detached by other trigger
            if !state.timer.is_current(generation) {
                return None;
            }

            match state.batch.poll() {
                PollResult::Ready => {
                    state.timer.fired(generation);
                    state.batch.detach()
                }
                PollResult::NotReady(Some(remaining)) => return Instant::now().checked_add(remaining),
                PollResult::NotReady(None) => {
                    state.timer.fired(generation);
                    None
                }
            }
        };

        if let Some(batch) = batch {
            self.execute_background(FlushReason::Timeout, batch);
        }
        None
    }

    fn requested(&self) {
        let batch = {
            let mut state = self.state.lock();
            if state.lifecycle == Lifecycle::Closed {
                return;
            }
            state.detach()
        };

        if let Some(batch) = batch {
            self.execute_background(FlushReason::Requested, batch);
        }
    }
}

/// Batches items added from any thread and flushes them to the `Handler` on reaching `capacity`,
/// after `interval` since the oldest buffered item, on `flush` or on `close`.
///
/// Each buffer runs its own timer thread which is stopped by `close`. Dropping the buffer closes it.
///
/// Timeout and `request_flush` batches are handed to the handler on the timer thread itself. While
/// such a flush is running the next batch's timeout cannot fire, so a handler slower than `interval`
/// delays time based flushes of later batches by up to its own run time.
pub struct FlushBuffer<I, H>
where
    I: Debug + Send + 'static,
    H: Handler<I>,
{
    shared: Arc<Shared<I, H>>,
    config: Config,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<I, H> FlushBuffer<I, H>
where
    I: Debug + Send + 'static,
    H: Handler<I>,
{
    /// Creates buffer with given configuration flushing batches to `handler` and starts its timer thread.
    pub fn new(config: Config, handler: H) -> Result<FlushBuffer<I, H>, ConfigError> {
        FlushBuffer::with_error_hook(config, handler, None)
    }

    /// Returns `Builder` for configuring new buffer.
    pub fn builder() -> Builder<I, H> {
        Builder::default()
    }

    fn with_error_hook(
        config: Config,
        handler: H,
        on_background_error: Option<ErrorHook<H::Error>>,
    ) -> Result<FlushBuffer<I, H>, ConfigError> {
        config.validate()?;

        let (control_tx, control_rx) = crossbeam_channel::unbounded();

        let shared = Arc::new(Shared {
            name: config.name.clone(),
            state: Mutex::new(State {
                batch: BufBatch::new(config.capacity, config.interval),
                lifecycle: Lifecycle::Open,
                timer: Timer::new(control_tx),
            }),
            handler,
            counters: Counters::default(),
            on_background_error,
        });

        let timer_thread =
            trigger::spawn(&config.name, shared.clone(), control_rx).map_err(ConfigError::Spawn)?;

        debug!(
            "[{}] started with capacity {} and interval {:?}",
            config.name, config.capacity, config.interval
        );

        Ok(FlushBuffer {
            shared,
            config,
            timer_thread: Mutex::new(Some(timer_thread)),
        })
    }

    /// Appends item to outstanding batch.
    ///
    /// If the item fills the batch up to `capacity` the batch is flushed on this thread using `ctx`
    /// and handler error is returned as `Error::Handler`.
    ///
    /// Returns `Error::Closed` after buffer was closed.
    pub fn add(&self, item: I, ctx: &Context) -> Result<(), Error<H::Error>> {
        let full = {
            let mut state = self.shared.state.lock();

            if state.lifecycle == Lifecycle::Closed {
                return Err(Error::Closed);
            }

            match state.batch.append(item) {
                Append::Full(batch) => {
                    state.timer.disarm();
                    Some(batch)
                }
                // Timer counts from the oldest item; later items don't restart it
                Append::First(Some(deadline)) => {
                    state.timer.arm(deadline);
                    None
                }
                Append::First(None) | Append::Pending => None,
            }
        };

        match full {
            Some(batch) => self
                .shared
                .execute(FlushReason::Size, batch, ctx)
                .map_err(Error::Handler),
            None => Ok(()),
        }
    }

    /// Flushes outstanding items on this thread using `ctx`.
    ///
    /// Does nothing if there are no outstanding items.
    pub fn flush(&self, ctx: &Context) -> Result<(), Error<H::Error>> {
        let batch = self.shared.state.lock().detach();

        match batch {
            Some(batch) => self
                .shared
                .execute(FlushReason::Manual, batch, ctx)
                .map_err(Error::Handler),
            None => Ok(()),
        }
    }

    /// Asks the timer thread to flush outstanding items without waiting for it.
    ///
    /// Handler failure is reported like failure of a timeout flush.
    pub fn request_flush(&self) -> Result<(), Error<H::Error>> {
        let mut state = self.shared.state.lock();

        if state.lifecycle == Lifecycle::Closed {
            return Err(Error::Closed);
        }

        state.timer.request_flush();
        Ok(())
    }

    /// Closes the buffer flushing outstanding items on this thread using `ctx` and stops the timer thread.
    ///
    /// Items added before `close` are all flushed by the time it returns. Calling it again does nothing.
    pub fn close(&self, ctx: &Context) -> Result<(), Error<H::Error>> {
        let batch = {
            let mut state = self.shared.state.lock();

            if state.lifecycle == Lifecycle::Closed {
                return Ok(());
            }

            state.lifecycle = Lifecycle::Closed;
            let batch = state.batch.detach();
            state.timer.shutdown();
            batch
        };

        debug!("[{}] closing", self.config.name);

        let result = match batch {
            Some(batch) => self
                .shared
                .execute(FlushReason::Close, batch, ctx)
                .map_err(Error::Handler),
            None => Ok(()),
        };

        self.join_timer();
        result
    }

    // Waits for flush in progress on the timer thread
    fn join_timer(&self) {
        if let Some(handle) = self.timer_thread.lock().take() {
            // Closed by handler running on the timer thread; the loop exits once it returns
            if handle.thread().id() == thread::current().id() {
                return;
            }

            if handle.join().is_err() {
                warn!("[{}] timer thread panicked", self.config.name);
            }
        }
    }

    /// Number of outstanding items.
    pub fn len(&self) -> usize {
        self.shared.state.lock().batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().lifecycle == Lifecycle::Closed
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> Stats {
        self.shared.counters.snapshot()
    }
}

impl<I, H> Drop for FlushBuffer<I, H>
where
    I: Debug + Send + 'static,
    H: Handler<I>,
{
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }

        let outstanding = self.len();
        if outstanding > 0 {
            warn!(
                "[{}] dropped without close; flushing {} outstanding items",
                self.config.name, outstanding
            );
        }

        if let Err(Error::Handler(err)) = self.close(&Context::background()) {
            self.shared.report_background(FlushReason::Close, &err);
        }
    }
}

impl<I, H> fmt::Debug for FlushBuffer<I, H>
where
    I: Debug + Send + 'static,
    H: Handler<I>,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FlushBuffer")
            .field("config", &self.config)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Builds `FlushBuffer` from individually set options.
pub struct Builder<I, H: Handler<I>> {
    config: Config,
    handler: Option<H>,
    on_background_error: Option<ErrorHook<H::Error>>,
    _item: PhantomData<fn(I)>,
}

impl<I, H: Handler<I>> Default for Builder<I, H> {
    fn default() -> Builder<I, H> {
        Builder {
            config: Config::default(),
            handler: None,
            on_background_error: None,
            _item: PhantomData,
        }
    }
}

impl<I, H> Builder<I, H>
where
    I: Debug + Send + 'static,
    H: Handler<I>,
{
    pub fn new() -> Builder<I, H> {
        Builder::default()
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// Zero disables time based flushing.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Sets callback called with handler errors of flushes that have no caller waiting on them
    /// (timeout, requested or drop flushes). These errors are logged either way.
    pub fn on_background_error(
        mut self,
        hook: impl Fn(FlushReason, &H::Error) + Send + Sync + 'static,
    ) -> Self {
        self.on_background_error = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Result<FlushBuffer<I, H>, ConfigError> {
        let handler = self.handler.ok_or(ConfigError::MissingHandler)?;
        FlushBuffer::with_error_hook(self.config, handler, self.on_background_error)
    }
}

#[cfg(test)]
mod tests {
    pub use super::*;
    use assert_matches::assert_matches;
    use crate::context::Deadline;
    use crossbeam_channel::Receiver;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn channel_handler() -> (
        impl Handler<u32, Error = String>,
        Receiver<Vec<u32>>,
    ) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let handler =
            move |batch: Vec<u32>, _ctx: &Context| sender.send(batch).map_err(|err| err.to_string());
        (handler, receiver)
    }

    fn failing_handler(batch: Vec<u32>, _ctx: &Context) -> Result<(), String> {
        Err(format!("rejected {} items", batch.len()))
    }

    fn config(capacity: usize, interval: Duration) -> Config {
        Config {
            name: "test".to_string(),
            capacity,
            interval,
        }
    }

    #[test]
    fn test_size_trigger() {
        let (handler, batches) = channel_handler();
        let buffer = FlushBuffer::new(config(3, Duration::from_secs(60)), handler).unwrap();
        let ctx = Context::background();

        buffer.add(1, &ctx).unwrap();
        buffer.add(2, &ctx).unwrap();
        assert!(batches.try_recv().is_err());
        buffer.add(3, &ctx).unwrap();

        // Flushed synchronously by the `add` call that filled the batch
        assert_eq!(batches.try_recv(), Ok(vec![1, 2, 3]));
        assert!(batches.try_recv().is_err());
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().size_flushes, 1);
    }

    #[test]
    fn test_timeout_trigger() {
        let (handler, batches) = channel_handler();
        let buffer = FlushBuffer::new(config(10, Duration::from_millis(100)), handler).unwrap();
        let ctx = Context::background();

        let start = Instant::now();
        buffer.add(1, &ctx).unwrap();
        buffer.add(2, &ctx).unwrap();

        assert_eq!(batches.recv_timeout(Duration::from_secs(5)), Ok(vec![1, 2]));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "flushed too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "flushed too late: {:?}", elapsed);

        // Timer is not armed again until next item
        assert!(batches.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(buffer.stats().timeout_flushes, 1);
    }

    #[test]
    fn test_no_items_no_timeout_flush() {
        let (handler, batches) = channel_handler();
        let buffer = FlushBuffer::new(config(10, Duration::from_millis(20)), handler).unwrap();

        std::thread::sleep(Duration::from_millis(100));

        assert!(batches.try_recv().is_err());
        assert_eq!(buffer.stats().flushes(), 0);
    }

    #[test]
    fn test_timer_counts_from_oldest_item() {
        let (handler, batches) = channel_handler();
        let buffer = Arc::new(FlushBuffer::new(config(100, Duration::from_millis(150)), handler).unwrap());

        // Steady stream of items below capacity must not keep postponing the flush
        let producer = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                let ctx = Context::background();
                for item in 0..15 {
                    buffer.add(item, &ctx).unwrap();
                    std::thread::sleep(Duration::from_millis(30));
                }
            })
        };

        let first = batches.recv_timeout(Duration::from_millis(400)).unwrap();
        assert!(!first.is_empty());
        assert!(first.len() < 15);
        assert_eq!(first[0], 0);

        producer.join().unwrap();
        buffer.close(&Context::background()).unwrap();

        let mut items = first;
        items.extend(batches.try_iter().flatten());
        assert_eq!(items, (0..15).collect::<Vec<_>>());
    }

    #[test]
    fn test_size_only_buffer() {
        let (handler, batches) = channel_handler();
        let buffer = FlushBuffer::new(config(10, Duration::ZERO), handler).unwrap();
        let ctx = Context::background();

        buffer.add(1, &ctx).unwrap();
        assert!(batches.recv_timeout(Duration::from_millis(100)).is_err());

        buffer.close(&ctx).unwrap();
        assert_eq!(batches.try_recv(), Ok(vec![1]));
    }

    #[test]
    fn test_concurrent_producers_no_loss() {
        let (handler, batches) = channel_handler();
        let buffer = Arc::new(FlushBuffer::new(config(7, Duration::from_millis(1)), handler).unwrap());

        let producers = (0..8u32)
            .map(|producer| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    let ctx = Context::background();
                    for item in 0..1000 {
                        buffer.add(producer * 1000 + item, &ctx).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        // Explicit flushes racing with capacity and timer flushes
        let flusher = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                let ctx = Context::background();
                for _ in 0..200 {
                    buffer.flush(&ctx).unwrap();
                    buffer.request_flush().unwrap();
                }
            })
        };

        for producer in producers {
            producer.join().unwrap();
        }
        flusher.join().unwrap();
        buffer.close(&Context::background()).unwrap();

        let mut items = Vec::new();
        for batch in batches.try_iter() {
            assert!(!batch.is_empty());
            assert!(batch.len() <= 7);
            items.extend(batch);
        }

        assert_eq!(items.iter().collect::<HashSet<_>>().len(), items.len());
        items.sort_unstable();
        assert_eq!(items, (0..8000).collect::<Vec<_>>());
        assert_eq!(buffer.stats().items_flushed, 8000);
    }

    #[test]
    fn test_items_of_single_producer_in_order() {
        let (handler, batches) = channel_handler();
        let buffer = FlushBuffer::new(config(4, Duration::ZERO), handler).unwrap();
        let ctx = Context::background();

        for item in 0..10 {
            buffer.add(item, &ctx).unwrap();
        }
        buffer.close(&ctx).unwrap();

        let batches = batches.try_iter().collect::<Vec<_>>();
        assert_eq!(batches, [vec![0u32, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);
    }

    #[test]
    fn test_close_drains_once() {
        let (handler, batches) = channel_handler();
        let buffer = FlushBuffer::new(config(10, Duration::from_secs(60)), handler).unwrap();
        let ctx = Context::background();

        buffer.add(1, &ctx).unwrap();
        buffer.add(2, &ctx).unwrap();

        assert_matches!(buffer.close(&ctx), Ok(()));
        assert_eq!(batches.try_recv(), Ok(vec![1, 2]));
        assert!(buffer.is_closed());

        assert_matches!(buffer.close(&ctx), Ok(()));
        assert!(batches.try_recv().is_err());
        assert_eq!(buffer.stats().close_flushes, 1);
    }

    #[test]
    fn test_add_after_close() {
        let (handler, batches) = channel_handler();
        let buffer = FlushBuffer::new(config(1, Duration::from_secs(60)), handler).unwrap();
        let ctx = Context::background();

        buffer.close(&ctx).unwrap();

        assert_matches!(buffer.add(1, &ctx), Err(Error::Closed));
        assert_matches!(buffer.request_flush(), Err(Error::Closed));
        assert_matches!(buffer.flush(&ctx), Ok(()));
        assert!(batches.try_recv().is_err());
        assert_eq!(buffer.stats().flushes(), 0);
    }

    #[test]
    fn test_empty_flush() {
        let (handler, batches) = channel_handler();
        let buffer = FlushBuffer::new(config(10, Duration::from_secs(60)), handler).unwrap();

        assert_matches!(buffer.flush(&Context::background()), Ok(()));
        assert!(batches.try_recv().is_err());
        assert_eq!(buffer.stats().flushes(), 0);
    }

    #[test]
    fn test_manual_flush() {
        let (handler, batches) = channel_handler();
        let buffer = FlushBuffer::new(config(10, Duration::from_secs(60)), handler).unwrap();
        let ctx = Context::background();

        buffer.add(1, &ctx).unwrap();
        buffer.flush(&ctx).unwrap();
        buffer.add(2, &ctx).unwrap();

        assert_eq!(batches.try_recv(), Ok(vec![1]));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.stats().manual_flushes, 1);
    }

    #[test]
    fn test_handler_error_returned_to_caller() {
        let buffer = FlushBuffer::<u32, _>::new(config(2, Duration::from_secs(60)), failing_handler).unwrap();
        let ctx = Context::background();

        buffer.add(1, &ctx).unwrap();
        assert_matches!(buffer.flush(&ctx), Err(Error::Handler(err)) => assert_eq!(err, "rejected 1 items"));
        // Failed batch is not put back
        assert!(buffer.is_empty());

        buffer.add(2, &ctx).unwrap();
        assert_matches!(buffer.add(3, &ctx), Err(Error::Handler(err)) => assert_eq!(err, "rejected 2 items"));

        buffer.add(4, &ctx).unwrap();
        assert_matches!(buffer.close(&ctx), Err(Error::Handler(_)));

        let stats = buffer.stats();
        assert_eq!(stats.handler_failures, 3);
        assert_eq!(stats.background_failures, 0);
    }

    #[test]
    fn test_timeout_failure_reported() {
        let (errors_tx, errors) = crossbeam_channel::unbounded();
        let buffer = FlushBuffer::builder()
            .name("failing")
            .capacity(10)
            .interval(Duration::from_millis(20))
            .handler(failing_handler as fn(Vec<u32>, &Context) -> Result<(), String>)
            .on_background_error(move |reason, err: &String| {
                errors_tx.send((reason, err.clone())).unwrap();
            })
            .build()
            .unwrap();

        buffer.add(1, &Context::background()).unwrap();

        assert_eq!(
            errors.recv_timeout(Duration::from_secs(5)),
            Ok((FlushReason::Timeout, "rejected 1 items".to_string()))
        );
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().background_failures, 1);
    }

    #[test]
    fn test_request_flush() {
        let (handler, batches) = channel_handler();
        let buffer = FlushBuffer::new(config(10, Duration::ZERO), handler).unwrap();
        let ctx = Context::background();

        buffer.add(1, &ctx).unwrap();
        buffer.add(2, &ctx).unwrap();
        buffer.request_flush().unwrap();

        assert_eq!(batches.recv_timeout(Duration::from_secs(5)), Ok(vec![1, 2]));
        assert_eq!(buffer.stats().requested_flushes, 1);
    }

    #[test]
    fn test_flush_does_not_block_add() {
        let (started_tx, started) = crossbeam_channel::unbounded();
        let (release, release_rx) = crossbeam_channel::unbounded::<()>();
        let (flushed_tx, flushed) = crossbeam_channel::unbounded();

        let handler = move |batch: Vec<u32>, _ctx: &Context| -> Result<(), String> {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            flushed_tx.send(batch).unwrap();
            Ok(())
        };
        let buffer = Arc::new(FlushBuffer::new(config(10, Duration::from_secs(60)), handler).unwrap());
        let ctx = Context::background();

        buffer.add(1, &ctx).unwrap();

        let flusher = {
            let buffer = buffer.clone();
            std::thread::spawn(move || buffer.flush(&Context::background()))
        };
        started.recv_timeout(Duration::from_secs(5)).unwrap();

        // Handler is blocked; producers keep filling the next batch
        buffer.add(2, &ctx).unwrap();
        buffer.add(3, &ctx).unwrap();
        assert_eq!(buffer.len(), 2);

        release.send(()).unwrap();
        assert_matches!(flusher.join().unwrap(), Ok(()));
        assert_eq!(flushed.try_recv(), Ok(vec![1]));

        release.send(()).unwrap();
        buffer.close(&ctx).unwrap();
        assert_eq!(flushed.try_recv(), Ok(vec![2, 3]));
    }

    #[test]
    fn test_context_forwarded_to_handler() {
        let (sender, deadlines) = crossbeam_channel::unbounded();
        let handler = move |_batch: Vec<u32>, ctx: &Context| -> Result<(), String> {
            sender.send(ctx.deadline()).unwrap();
            Ok(())
        };
        let buffer = FlushBuffer::new(config(10, Duration::from_millis(200)), handler).unwrap();

        let ctx = Context::with_timeout(Duration::from_secs(60));
        buffer.add(1, &ctx).unwrap();
        buffer.flush(&ctx).unwrap();
        assert_eq!(deadlines.try_recv(), Ok(ctx.deadline()));

        // Timer has no caller to take the context from
        buffer.add(2, &ctx).unwrap();
        assert_eq!(deadlines.recv_timeout(Duration::from_secs(5)), Ok(Deadline::none()));
    }

    #[test]
    fn test_drop_flushes_outstanding() {
        let (handler, batches) = channel_handler();
        let buffer = FlushBuffer::new(config(10, Duration::from_secs(60)), handler).unwrap();

        buffer.add(1, &Context::background()).unwrap();
        drop(buffer);

        assert_eq!(batches.try_recv(), Ok(vec![1]));
    }

    #[test]
    fn test_config_errors() {
        assert_matches!(
            FlushBuffer::<u32, _>::new(config(0, Duration::from_secs(1)), failing_handler),
            Err(ConfigError::ZeroCapacity)
        );
        assert_matches!(
            FlushBuffer::<u32, _>::new(config(1, Duration::MAX), failing_handler),
            Err(ConfigError::IntervalTooLarge(_))
        );
        assert_matches!(
            Builder::<u32, fn(Vec<u32>, &Context) -> Result<(), String>>::new().build(),
            Err(ConfigError::MissingHandler)
        );
    }

    #[test]
    fn test_debug_format() {
        let (handler, _batches) = channel_handler();
        let buffer = FlushBuffer::new(config(10, Duration::from_secs(60)), handler).unwrap();
        buffer.add(1, &Context::background()).unwrap();

        let debug = format!("{:?}", buffer);
        assert!(debug.starts_with("FlushBuffer { config: Config { name: \"test\""), "{}", debug);
        assert!(debug.ends_with("len: 1, closed: false }"), "{}", debug);
    }

    #[test]
    fn test_close_racing_adds_strands_nothing() {
        for _ in 0..20 {
            let (handler, batches) = channel_handler();
            let buffer = Arc::new(FlushBuffer::new(config(5, Duration::from_millis(1)), handler).unwrap());

            let producers = (0..4u32)
                .map(|producer| {
                    let buffer = buffer.clone();
                    std::thread::spawn(move || {
                        let ctx = Context::background();
                        let mut added = Vec::new();
                        for item in 0..1_000_000 {
                            let item = producer * 1_000_000 + item;
                            match buffer.add(item, &ctx) {
                                Ok(()) => added.push(item),
                                Err(Error::Closed) => break,
                                Err(Error::Handler(err)) => panic!("handler failed: {}", err),
                            }
                        }
                        added
                    })
                })
                .collect::<Vec<_>>();

            std::thread::sleep(Duration::from_millis(5));
            buffer.close(&Context::background()).unwrap();

            // Size flushes detached before close may still be running on producer threads
            let mut added = producers
                .into_iter()
                .flat_map(|producer| producer.join().unwrap())
                .collect::<Vec<_>>();
            let mut flushed = batches.try_iter().flatten().collect::<Vec<_>>();

            assert_eq!(flushed.iter().collect::<HashSet<_>>().len(), flushed.len());
            added.sort_unstable();
            flushed.sort_unstable();
            assert_eq!(flushed, added);
        }
    }

    #[test]
    fn test_timer_survives_handler_panic() {
        let (sender, batches) = crossbeam_channel::unbounded();
        let calls = AtomicUsize::new(0);
        let handler = move |batch: Vec<u32>, _ctx: &Context| -> Result<(), String> {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first batch rejected");
            }
            sender.send(batch).map_err(|err| err.to_string())
        };
        let buffer = FlushBuffer::new(config(10, Duration::from_millis(20)), handler).unwrap();
        let ctx = Context::background();

        buffer.add(1, &ctx).unwrap();

        // Wait for the timer to detach the first batch
        let start = Instant::now();
        while !buffer.is_empty() {
            assert!(start.elapsed() < Duration::from_secs(5), "first batch not flushed");
            std::thread::sleep(Duration::from_millis(5));
        }

        buffer.add(2, &ctx).unwrap();
        assert_eq!(batches.recv_timeout(Duration::from_secs(5)), Ok(vec![2]));
        assert_eq!(buffer.stats().timeout_flushes, 1);

        assert_matches!(buffer.close(&ctx), Ok(()));
        assert!(batches.try_recv().is_err());
    }

    #[test]
    fn test_builder() {
        let (handler, batches) = channel_handler();
        let buffer = FlushBuffer::builder()
            .config(config(10, Duration::from_secs(60)))
            .name("built")
            .capacity(2)
            .handler(handler)
            .build()
            .unwrap();

        assert_eq!(buffer.config().name, "built");
        assert_eq!(buffer.config().capacity, 2);

        let ctx = Context::background();
        buffer.add(1, &ctx).unwrap();
        buffer.add(2, &ctx).unwrap();
        assert_eq!(batches.try_recv(), Ok(vec![1, 2]));
    }
}
