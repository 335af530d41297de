//! Background scheduling loop that owns the flush timer.
//!
//! The loop is the only consumer of `Control` messages. All messages are sent by `Timer` methods
//! while the caller holds the buffer state lock, so the loop sees arm and disarm requests in the
//! same order the state lock was acquired in.
//!
//! Each arming gets a new generation number. When the armed deadline passes the loop asks its
//! `Target` to flush that generation; the target compares it with the generation currently armed
//! under its state lock so an expiry racing with any other flush trigger is a no-op.
use crossbeam_channel::{select, Receiver, Sender};
use log::{debug, error};

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Messages consumed by the scheduling loop.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Control {
    /// Fire at `deadline` for batch started under `generation`.
    Arm { generation: u64, deadline: Instant },
    /// Batch was detached by other trigger.
    Disarm,
    /// Flush outstanding items on the scheduling thread.
    Flush,
    /// Exit the loop.
    Shutdown,
}

/// Flush side of the scheduling loop, implemented by the buffer.
pub(crate) trait Target: Send + Sync + 'static {
    /// Armed deadline of `generation` has passed.
    ///
    /// Returns new deadline if the batch is not ready yet and the timer should stay armed.
    fn expired(&self, generation: u64) -> Option<Instant>;

    /// `Control::Flush` was received.
    fn requested(&self);
}

/// Timer arm/disarm bookkeeping; lives inside buffer state and is only used under its lock.
#[derive(Debug)]
pub(crate) struct Timer {
    control: Sender<Control>,
    generation: u64,
    armed: Option<u64>,
    shutdown: bool,
}

impl Timer {
    pub fn new(control: Sender<Control>) -> Timer {
        Timer {
            control,
            generation: 0,
            armed: None,
            shutdown: false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Arms the timer to fire at `deadline` unless it is already armed or was shut down.
    pub fn arm(&mut self, deadline: Instant) {
        if self.is_armed() || self.shutdown {
            return;
        }

        self.generation = self.generation.wrapping_add(1);
        self.armed = Some(self.generation);
        debug!("arming flush timer generation {}", self.generation);
        self.send(Control::Arm {
            generation: self.generation,
            deadline,
        });
    }

    pub fn disarm(&mut self) {
        if self.armed.take().is_some() {
            self.send(Control::Disarm);
        }
    }

    /// Checks if expiry of `generation` is still current and marks the timer as not armed if so.
    ///
    /// The loop has already dropped the deadline so there is nothing to send.
    pub fn fired(&mut self, generation: u64) -> bool {
        if self.armed == Some(generation) {
            self.armed = None;
            return true;
        }
        false
    }

    /// Checks if `generation` is the one currently armed.
    pub fn is_current(&self, generation: u64) -> bool {
        self.armed == Some(generation)
    }

    pub fn request_flush(&mut self) {
        self.send(Control::Flush);
    }

    /// Disarms the timer and stops the loop. No further arming is possible.
    pub fn shutdown(&mut self) {
        if self.shutdown {
            return;
        }
        self.armed = None;
        self.shutdown = true;
        self.send(Control::Shutdown);
    }

    fn send(&self, control: Control) {
        // Loop only exits on shutdown; nothing to deliver to afterwards
        let _ = self.control.send(control);
    }
}

/// Starts the scheduling loop in a new named thread.
pub(crate) fn spawn<T: Target>(
    name: &str,
    target: Arc<T>,
    control: Receiver<Control>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("flush-batch timer {}", name))
        .spawn(move || run(target, control))
}

fn run<T: Target>(target: Arc<T>, control: Receiver<Control>) {
    // Generation and deadline of currently armed timer
    let mut armed: Option<(u64, Instant)> = None;

    loop {
        let timeout = match armed {
            Some((_, deadline)) => crossbeam_channel::at(deadline),
            None => crossbeam_channel::never(),
        };

        select! {
            recv(control) -> msg => match msg {
                Ok(Control::Arm { generation, deadline }) => armed = Some((generation, deadline)),
                Ok(Control::Disarm) => armed = None,
                Ok(Control::Flush) => guard(|| target.requested()),
                Ok(Control::Shutdown) | Err(_) => break,
            },
            recv(timeout) -> _ => {
                if let Some((generation, _)) = armed.take() {
                    if let Some(deadline) = guard(|| target.expired(generation)) {
                        armed = Some((generation, deadline));
                    }
                }
            }
        }
    }

    debug!("flush timer loop finished");
}

// Handler panic must not take the timer down with it
fn guard<R: Default>(f: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(_) => {
            error!("flush handler panicked on timer thread");
            R::default()
        }
    }
}
