/*!
This crate provides `FlushBuffer`, a batching buffer that can be shared between many producer threads.

Added items are collected into a batch that is handed over to a caller supplied `Handler` when:
* the batch reaches its `capacity` - flushed by the `add` call that filled it up,
* `interval` has elapsed since the oldest item of the batch was added - flushed by the buffer's timer thread,
* `flush` is called - flushed by the calling thread,
* `request_flush` is called - flushed by the timer thread,
* `close` is called or the buffer is dropped.

Each batch is detached from the buffer under its lock and handed to the handler exactly once after the
lock is released, so producers can keep adding items while the handler is running.

See `buffer` module for an example.
!*/
pub mod buf_batch;
pub mod buffer;
pub mod context;
pub mod flush;
mod trigger;

pub use buffer::{Builder, Config, FlushBuffer};
pub use context::{Cancellation, Context, Deadline};
pub use flush::{ErrorHook, FlushReason, Handler, Stats};

use std::fmt;
use std::io;
use std::time::Duration;

/// The error that is returned when buffer cannot be created with given configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Batch capacity has to be at least one item.
    ZeroCapacity,
    /// No handler was provided to `Builder`.
    MissingHandler,
    /// Flush interval is too large to compute a deadline with.
    IntervalTooLarge(Duration),
    /// Timer thread could not be started.
    Spawn(io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::ZeroCapacity => write!(f, "batch capacity must be greater than zero"),
            ConfigError::MissingHandler => write!(f, "a flush handler must be provided"),
            ConfigError::IntervalTooLarge(interval) => {
                write!(f, "flush interval of {:?} is too large", interval)
            }
            ConfigError::Spawn(_) => write!(f, "failed to start timer thread"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Spawn(err) => Some(err),
            _ => None,
        }
    }
}

/// The error that is returned by `FlushBuffer` operations.
#[derive(Debug)]
pub enum Error<E> {
    /// Buffer was closed; no more items are accepted.
    Closed,
    /// Handler failed on a batch flushed by this call. The batch is not retried.
    Handler(E),
}

impl<E: fmt::Debug> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Closed => write!(f, "buffer is closed"),
            Error::Handler(err) => write!(f, "flush handler failed: {:?}", err),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for Error<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Closed => None,
            Error::Handler(err) => Some(err),
        }
    }
}
