//! Count of in-flight dirty files, used for backpressure and for waiting until data is stored.
//!
//! This is a separate lock from the write queue's. The queue lock may not be held while acquiring
//! this one.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::{Error, Result};

#[derive(Debug, Default)]
struct DrainState {
    dirty_files: usize,
    interrupted: bool,
}

#[derive(Debug, Default)]
pub(crate) struct DrainCounter {
    state: Mutex<DrainState>,
    changed: Condvar,
}

impl DrainCounter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn count(&self) -> usize {
        self.state.lock().dirty_files
    }

    pub(crate) fn increment(&self) {
        let mut state = self.state.lock();
        state.dirty_files += 1;
        self.changed.notify_all();
    }

    /// # Panics
    /// If the count would become negative, i.e. a file was resolved more often than admitted.
    pub(crate) fn decrement(&self) {
        let mut state = self.state.lock();
        state.dirty_files = state
            .dirty_files
            .checked_sub(1)
            .expect("dirty file count should never become negative");
        self.changed.notify_all();
    }

    /// Blocks until no file is in flight. `None` waits without a deadline.
    ///
    /// Returns `false` when the deadline passed first.
    pub(crate) fn wait_until_drained(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.dirty_files == 0 {
                return Ok(true);
            }
            if state.interrupted {
                return Err(Error::Interrupted);
            }
            match deadline {
                None => self.changed.wait(&mut state),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    self.changed.wait_until(&mut state, deadline);
                }
            }
        }
    }

    /// Blocks while `keep_waiting` returns true for the current dirty count, re-checking on every
    /// change and at least once per `poll_interval`.
    pub(crate) fn wait_while(
        &self,
        poll_interval: Duration,
        mut keep_waiting: impl FnMut(usize) -> bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if !keep_waiting(state.dirty_files) {
                return Ok(());
            }
            if state.interrupted {
                return Err(Error::Interrupted);
            }
            self.changed.wait_for(&mut state, poll_interval);
        }
    }

    /// Fails current and future waits with [`Error::Interrupted`] until [`Self::resume`].
    pub(crate) fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.changed.notify_all();
    }

    pub(crate) fn resume(&self) {
        self.state.lock().interrupted = false;
    }
}
