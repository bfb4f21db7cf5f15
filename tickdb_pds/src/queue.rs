//! The write queue holding dirty files until a writer claims them.
//!
//! Files live in one of two FIFO lanes. The normal lane receives new files and, outside of shutdown,
//! retries. While a shutdown is in progress retries go to the retry lane, which writers only serve
//! when the normal lane is empty. The per-path failure counters share the queue's lock so that a
//! failure is counted and the file re-queued as one step.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use crate::{Error, PendingFile, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    Normal,
    Retry,
}

/// What the queue did with a file after a failed write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureDecision {
    Requeued { failures: u32, lane: Lane },
    Discard { failures: u32 },
}

#[derive(Debug, Default)]
struct Lanes {
    normal: VecDeque<Arc<PendingFile>>,
    retry: VecDeque<Arc<PendingFile>>,
    /// Keyed by path so that no reference to a superseded file is retained
    failures_per_path: HashMap<Arc<str>, u32>,
}

impl Lanes {
    fn contains(&self, file: &Arc<PendingFile>) -> bool {
        self.normal
            .iter()
            .chain(self.retry.iter())
            .any(|queued| Arc::ptr_eq(queued, file))
    }

    fn lane_mut(&mut self, lane: Lane) -> &mut VecDeque<Arc<PendingFile>> {
        match lane {
            Lane::Normal => &mut self.normal,
            Lane::Retry => &mut self.retry,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    lanes: Mutex<Lanes>,
    available: Condvar,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a newly admitted file to the normal lane and wakes one writer.
    ///
    /// # Panics
    /// If the file is already queued.
    pub(crate) fn push(&self, file: &Arc<PendingFile>) {
        let mut lanes = self.lanes.lock();
        assert!(!lanes.contains(file), "{file} is already queued");
        file.set_queued(true);
        lanes.normal.push_back(Arc::clone(file));
        self.available.notify_one();
    }

    /// Claims the next file, preferring the normal lane. Blocks while both lanes are empty.
    ///
    /// Interruption is only observed when the call would block, so an interrupted writer still
    /// drains what is already queued.
    pub(crate) fn next(&self, interrupted: &AtomicBool) -> Result<Arc<PendingFile>> {
        let mut lanes = self.lanes.lock();
        loop {
            if let Some(file) = lanes.normal.pop_front() {
                return Ok(file);
            }
            if let Some(file) = lanes.retry.pop_front() {
                return Ok(file);
            }
            if interrupted.load(Ordering::SeqCst) {
                return Err(Error::Interrupted);
            }
            self.available.wait(&mut lanes);
        }
    }

    /// Removes a file from the normal lane if no writer has claimed it yet.
    pub(crate) fn remove(&self, file: &Arc<PendingFile>) -> bool {
        let mut lanes = self.lanes.lock();
        let Some(position) = lanes.normal.iter().position(|f| Arc::ptr_eq(f, file)) else {
            return false;
        };
        lanes.normal.remove(position);
        file.set_queued(false);
        true
    }

    pub(crate) fn clear_queued(&self, file: &PendingFile) {
        let _lanes = self.lanes.lock();
        file.set_queued(false);
    }

    /// Counts a failed write of `file` and re-queues it while it is below `attempts_per_file`.
    ///
    /// A discarded file keeps its queued flag so that its owner does not admit it again.
    pub(crate) fn record_failure(
        &self,
        file: &Arc<PendingFile>,
        attempts_per_file: u32,
        shutdown_in_progress: bool,
    ) -> FailureDecision {
        let mut lanes = self.lanes.lock();
        let failures = lanes
            .failures_per_path
            .entry(file.path_key())
            .and_modify(|n| *n += 1)
            .or_insert(1);
        let failures = *failures;

        if failures >= attempts_per_file {
            return FailureDecision::Discard { failures };
        }

        let lane = if shutdown_in_progress {
            Lane::Retry
        } else {
            Lane::Normal
        };
        debug_assert!(!lanes.contains(file), "{file} is already queued");
        lanes.lane_mut(lane).push_back(Arc::clone(file));
        self.available.notify_one();
        FailureDecision::Requeued { failures, lane }
    }

    pub(crate) fn failures_for_path(&self, path: &str) -> u32 {
        self.lanes
            .lock()
            .failures_per_path
            .get(path)
            .copied()
            .unwrap_or_default()
    }

    /// Newest still-active queued version of `path`.
    pub(crate) fn find_latest(&self, path: &str) -> Option<Arc<PendingFile>> {
        let lanes = self.lanes.lock();
        lanes
            .normal
            .iter()
            .rev()
            .chain(lanes.retry.iter().rev())
            .find(|f| f.path() == path && f.is_active())
            .map(Arc::clone)
    }

    pub(crate) fn len(&self) -> usize {
        let lanes = self.lanes.lock();
        lanes.normal.len() + lanes.retry.len()
    }

    /// Wakes every blocked writer so it can observe its interrupt flag.
    pub(crate) fn wake_all(&self) {
        let _lanes = self.lanes.lock();
        self.available.notify_all();
    }
}
