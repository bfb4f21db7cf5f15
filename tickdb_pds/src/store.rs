//! The persistent data store controller: lifecycle, write admission, backpressure, outcome
//! handling with retries, and escalation to an emergency shutdown.
//!
//! Lock order: `state` may be held while taking the queue or drain lock. The queue and drain locks
//! are never held together.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tickdb_shutdown::{EmergencyShutdownControl, ProcessTerminator};
use tracing::{debug, error, info, warn};

use crate::{
    DataReader, DataWriter, Error, FileStore, FileStoreError, MemoryGauge, PendingFile, Result,
    StoreConfig, StoreRoot, SysinfoMemoryGauge,
    drain::DrainCounter,
    queue::{FailureDecision, WriteQueue},
    writer_pool::{WriterHandle, WriterId, wait_for_exit},
};

/// Lifecycle of a [`PersistentDataStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    NotStarted,
    Started,
    ShuttingDown,
    Stopped,
}

#[derive(Debug)]
struct Lifecycle {
    started: bool,
    stopped: bool,
    shutdown_in_progress: bool,
    read_only: bool,
    num_writers: usize,
    next_writer_id: WriterId,
    /// Live writers; a writer that dies is removed
    writers: Vec<WriterHandle>,
}

#[derive(Debug)]
pub struct PersistentDataStore {
    config: StoreConfig,
    file_store: Arc<dyn FileStore>,
    memory_gauge: Arc<dyn MemoryGauge>,
    state: Mutex<Lifecycle>,
    queue: WriteQueue,
    drain: DrainCounter,
    max_observed_file_size: AtomicU64,
    failed_write_attempts: AtomicU32,
    shutdown_control: RwLock<Option<Arc<dyn EmergencyShutdownControl>>>,
    terminator: ProcessTerminator,
    shutdown_in_progress: AtomicBool,
}

impl PersistentDataStore {
    /// Creates a store measuring free memory with a [`SysinfoMemoryGauge`].
    pub fn new(config: StoreConfig, file_store: Arc<dyn FileStore>) -> Arc<Self> {
        let memory_gauge = Arc::new(SysinfoMemoryGauge::new(config.memory_limit_bytes));
        Self::new_with_memory_gauge(config, file_store, memory_gauge)
    }

    pub fn new_with_memory_gauge(
        config: StoreConfig,
        file_store: Arc<dyn FileStore>,
        memory_gauge: Arc<dyn MemoryGauge>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            file_store,
            memory_gauge,
            state: Mutex::new(Lifecycle {
                started: false,
                stopped: false,
                shutdown_in_progress: false,
                read_only: false,
                num_writers: config.num_writer_threads,
                next_writer_id: 0,
                writers: vec![],
            }),
            queue: WriteQueue::new(),
            drain: DrainCounter::new(),
            max_observed_file_size: AtomicU64::new(0),
            failed_write_attempts: AtomicU32::new(0),
            shutdown_control: RwLock::new(None),
            terminator: ProcessTerminator::new(),
            shutdown_in_progress: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn file_store(&self) -> &Arc<dyn FileStore> {
        &self.file_store
    }

    pub fn state(&self) -> StoreState {
        let state = self.state.lock();
        match (state.started, state.shutdown_in_progress, state.stopped) {
            (true, true, _) => StoreState::ShuttingDown,
            (true, false, _) => StoreState::Started,
            (false, _, true) => StoreState::Stopped,
            (false, _, false) => StoreState::NotStarted,
        }
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn is_read_only(&self) -> bool {
        self.state.lock().read_only
    }

    pub fn is_shutdown_in_progress(&self) -> bool {
        self.shutdown_in_progress.load(Ordering::SeqCst)
    }

    /// Only valid before [`start`](Self::start). A read-only store rejects every write.
    pub fn set_read_only(&self, read_only: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.started {
            return Err(Error::AlreadyStarted);
        }
        state.read_only = read_only;
        Ok(())
    }

    /// Only valid before [`start`](Self::start); overrides the configured writer count.
    pub fn set_num_writer_threads(&self, n: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.started {
            return Err(Error::AlreadyStarted);
        }
        state.num_writers = n;
        Ok(())
    }

    pub fn set_emergency_shutdown_control(&self, control: Arc<dyn EmergencyShutdownControl>) {
        *self.shutdown_control.write() = Some(control);
    }

    /// Spawns the writer threads.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        if state.started {
            return Err(Error::AlreadyStarted);
        }
        self.drain.resume();
        // writers of a previous run that were never joined are detached
        let before = state.writers.len();
        state.writers.retain(|w| !w.is_interrupted());
        let detached = before - state.writers.len();
        if detached > 0 {
            warn!(
                detached,
                "restarting without waiting for the previous writers to stop"
            );
        }

        for _ in 0..state.num_writers {
            let id = state.next_writer_id;
            state.next_writer_id += 1;
            match WriterHandle::spawn(id, Arc::clone(self)) {
                Ok(writer) => state.writers.push(writer),
                Err(e) => {
                    error!(%e, writer = id, "unable to spawn writer thread");
                    for writer in &state.writers {
                        writer.interrupt();
                    }
                    self.queue.wake_all();
                    return Err(Error::SpawnWriter(e));
                }
            }
        }

        state.started = true;
        state.stopped = false;
        info!(
            writers = state.writers.len(),
            read_only = state.read_only,
            "persistent data store started"
        );
        Ok(())
    }

    /// Enters the shutting-down state: new roots, writers and readers are refused, and failed
    /// writes are retried with lower priority than files admitted from now on.
    pub fn start_shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown_in_progress = true;
        self.shutdown_in_progress.store(true, Ordering::SeqCst);
        info!(
            dirty_files = self.drain.count(),
            "persistent data store shutdown started"
        );
    }

    /// Stops the store and interrupts the writers and anyone blocked waiting on the drain.
    ///
    /// Writers finish the files already queued before they exit; use
    /// [`wait_for_shutdown`](Self::wait_for_shutdown) to join them.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.started = false;
        state.stopped = true;
        for writer in &state.writers {
            writer.interrupt();
        }
        state.shutdown_in_progress = false;
        self.shutdown_in_progress.store(false, Ordering::SeqCst);
        self.queue.wake_all();
        self.drain.interrupt();
        info!(writers = state.writers.len(), "persistent data store shut down");
    }

    /// Waits until every admitted file has been stored, dropped or discarded. `None` waits without
    /// a deadline.
    ///
    /// Returns `false` if the timeout elapsed first and [`Error::Interrupted`] if the store was
    /// shut down while files remained in flight.
    pub fn wait_until_data_stored(&self, timeout: Option<Duration>) -> Result<bool> {
        self.drain.wait_until_drained(timeout)
    }

    /// Joins the writer threads. `None` waits without a deadline.
    ///
    /// Returns `false` on the first writer that does not exit in time.
    pub fn wait_for_shutdown(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let exits: Vec<_> = self
            .state
            .lock()
            .writers
            .iter()
            .map(|w| (w.id(), w.exit_signal()))
            .collect();

        for (id, exited) in &exits {
            if !wait_for_exit(exited, deadline) {
                debug!(writer = id, "timed out waiting for writer to stop");
                return false;
            }
        }

        let stopped: Vec<_> = {
            let mut state = self.state.lock();
            let (stopped, running) = std::mem::take(&mut state.writers)
                .into_iter()
                .partition(|w| exits.iter().any(|(id, _)| *id == w.id()));
            state.writers = running;
            stopped
        };
        for writer in stopped {
            writer.join();
        }

        info!(
            dirty_files = self.drain.count(),
            "writers successfully stopped"
        );
        true
    }

    /// Throttles a producer while buffered dirty data threatens to exhaust memory.
    ///
    /// Returns once free memory exceeds the backpressure multiple of the largest file seen so far,
    /// or once nothing is in flight.
    pub fn check_write_queue_limit(&self) -> Result<()> {
        let mut logged = false;
        self.drain
            .wait_while(self.config.backpressure_poll_interval, |dirty_files| {
                if dirty_files == 0 {
                    return false;
                }
                let threshold = self
                    .max_observed_file_size()
                    .saturating_mul(self.config.backpressure_multiplier);
                if self.memory_gauge.free_memory() > threshold {
                    return false;
                }
                if !logged {
                    warn!(dirty_files, "write queue is overloaded, waiting");
                    logged = true;
                }
                true
            })
    }

    /// Admits a dirty file for writing.
    ///
    /// Files are still accepted while a shutdown is in progress so that the shutdown can drain
    /// everything produced up to the end.
    ///
    /// # Panics
    /// If the file is already queued.
    pub fn add_to_write_queue(&self, file: &Arc<PendingFile>) -> Result<()> {
        let shutdown_in_progress = {
            let state = self.state.lock();
            if !state.started {
                return Err(Error::NotStarted);
            }
            if state.writers.is_empty() {
                return Err(Error::NoActiveWriters);
            }
            if let Some(writer) = state
                .writers
                .iter()
                .find(|w| w.is_interrupted() || w.is_finished())
            {
                return Err(Error::WriterInterrupted { id: writer.id() });
            }
            if state.read_only {
                return Err(Error::ReadOnly);
            }
            state.shutdown_in_progress
        };

        self.max_observed_file_size
            .fetch_max(file.uncompressed_size(), Ordering::SeqCst);
        self.drain.increment();
        self.queue.push(file);

        if shutdown_in_progress {
            info!(path = %file.path(), "added file to be saved during shutdown");
        }
        Ok(())
    }

    /// Cancels a file no writer has claimed yet. Returns whether it was removed.
    pub fn remove_from_write_queue(&self, file: &Arc<PendingFile>) -> bool {
        let removed = self.queue.remove(file);
        if removed {
            self.drain.decrement();
        }
        removed
    }

    pub(crate) fn next_file(&self, interrupted: &AtomicBool) -> Result<Arc<PendingFile>> {
        self.queue.next(interrupted)
    }

    /// The file is durable: its bytes go back to its lease before the file counts as resolved.
    pub fn file_was_stored(&self, file: &PendingFile) {
        file.release();
        self.file_processed(file);
    }

    /// The file's content was discarded for a reason unrelated to the write, e.g. superseded.
    pub fn file_was_dropped(&self, file: &PendingFile) {
        self.file_processed(file);
    }

    /// Retries the file or gives up on it, and escalates to an emergency shutdown when
    /// persistence is no longer reliable.
    pub fn file_has_failed(&self, file: &Arc<PendingFile>, cause: &FileStoreError) {
        if !file.is_active() {
            error!(path = %file.path(), %cause, "error storing superseded file");
            self.file_processed(file);
            return;
        }

        error!(%file, %cause, "error storing file");
        let decision = self.queue.record_failure(
            file,
            self.config.attempts_per_file,
            self.is_shutdown_in_progress(),
        );

        let discarded = match decision {
            FailureDecision::Requeued { failures, lane } => {
                debug!(%file, failures, ?lane, "file queued for another attempt");
                false
            }
            FailureDecision::Discard { failures } => {
                file.mark_discarded();
                self.drain.decrement();
                error!(
                    path = %file.path(),
                    attempts = failures,
                    %cause,
                    "failed to store file, discarding it"
                );
                true
            }
        };

        // The counter hands out every value once, so exactly one reporter sees the threshold.
        let failed_attempts = self.failed_write_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if failed_attempts == self.config.failures_to_trigger_shutdown || discarded {
            error!(
                failed_attempts,
                discarded, "persistence is unreliable, triggering emergency shutdown"
            );
            self.trigger_emergency_shutdown();
        }
    }

    /// Removes a dead writer. Losing the last writer triggers an emergency shutdown.
    pub fn writer_failed(&self, id: WriterId) {
        let depleted = {
            let mut state = self.state.lock();
            let Some(position) = state.writers.iter().position(|w| w.id() == id) else {
                return;
            };
            let writer = state.writers.swap_remove(position);
            writer.interrupt();
            self.queue.wake_all();
            state.writers.is_empty()
        };

        if depleted {
            error!("CRITICAL: no writer threads left, triggering emergency shutdown");
            self.trigger_emergency_shutdown();
        }
    }

    fn file_processed(&self, file: &PendingFile) {
        self.queue.clear_queued(file);
        self.drain.decrement();
    }

    fn trigger_emergency_shutdown(&self) {
        let control = self.shutdown_control.read().as_ref().map(Arc::clone);
        match control {
            Some(control) => control.trigger_emergency_shutdown(),
            None => self.terminator.trigger_emergency_shutdown(),
        }
    }

    fn check_active(&self) -> Result<()> {
        let state = self.state.lock();
        if !state.started {
            return Err(Error::NotStarted);
        }
        if state.shutdown_in_progress {
            return Err(Error::ShutdownInProgress);
        }
        Ok(())
    }

    /// Creates a root folder at `path`, optionally scoped to a storage `space`.
    pub fn create_root(self: &Arc<Self>, space: Option<&str>, path: &str) -> Result<StoreRoot> {
        self.check_active()?;
        Ok(StoreRoot::new(Arc::clone(self), space, path))
    }

    pub fn create_writer(self: &Arc<Self>) -> Result<DataWriter> {
        self.check_active()?;
        Ok(DataWriter::new(Arc::clone(self)))
    }

    /// A live reader also sees content that is still waiting in the write queue.
    pub fn create_reader(self: &Arc<Self>, live: bool) -> Result<DataReader> {
        self.check_active()?;
        Ok(DataReader::new(Arc::clone(self), live))
    }

    /// Content of the newest queued version of `path`, if any.
    pub(crate) fn queued_content(&self, path: &str) -> Option<Bytes> {
        self.queue.find_latest(path).and_then(|f| f.data())
    }

    /// Files admitted and not yet stored, dropped or discarded
    pub fn num_dirty_files(&self) -> usize {
        self.drain.count()
    }

    /// Files waiting in either lane of the write queue
    pub fn write_queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn max_observed_file_size(&self) -> u64 {
        self.max_observed_file_size.load(Ordering::SeqCst)
    }

    /// Failed writes across all files since the store was created
    pub fn failed_write_attempts(&self) -> u32 {
        self.failed_write_attempts.load(Ordering::SeqCst)
    }

    /// Failed writes of `path`; the counter is never reset
    pub fn failures_for_path(&self, path: &str) -> u32 {
        self.queue.failures_for_path(path)
    }

    pub fn num_live_writers(&self) -> usize {
        self.state.lock().writers.len()
    }

    pub fn writer_ids(&self) -> Vec<WriterId> {
        self.state.lock().writers.iter().map(|w| w.id()).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::{
        MockMemoryGauge,
        test_util::{CountingShutdownControl, ScriptedFileStore},
    };

    const WAIT: Duration = Duration::from_secs(10);

    fn config() -> StoreConfig {
        StoreConfig {
            backpressure_poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn store_with(
        config: StoreConfig,
        file_store: &Arc<ScriptedFileStore>,
    ) -> (Arc<PersistentDataStore>, Arc<CountingShutdownControl>) {
        let store = PersistentDataStore::new_with_memory_gauge(
            config,
            Arc::clone(file_store) as _,
            Arc::new(MockMemoryGauge::new(u64::MAX)),
        );
        let control = Arc::new(CountingShutdownControl::new());
        store.set_emergency_shutdown_control(Arc::clone(&control) as _);
        (store, control)
    }

    fn file(path: &str, size: usize) -> Arc<PendingFile> {
        PendingFile::new(path, Bytes::from(vec![b't'; size]))
    }

    fn eventually(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn stop(store: &PersistentDataStore) {
        store.shutdown();
        assert!(store.wait_for_shutdown(Some(WAIT)));
    }

    #[test]
    fn lifecycle_rejects_calls_in_the_wrong_state() {
        let file_store = Arc::new(ScriptedFileStore::new());
        let (store, _control) = store_with(config(), &file_store);
        assert_eq!(store.state(), StoreState::NotStarted);
        assert!(matches!(
            store.add_to_write_queue(&file("ticks/0001", 1)),
            Err(Error::NotStarted)
        ));
        assert!(matches!(store.create_writer(), Err(Error::NotStarted)));
        assert_eq!(store.num_dirty_files(), 0);

        store.start().unwrap();
        assert_eq!(store.state(), StoreState::Started);
        assert!(matches!(store.start(), Err(Error::AlreadyStarted)));
        assert!(matches!(
            store.set_read_only(true),
            Err(Error::AlreadyStarted)
        ));
        assert!(matches!(
            store.set_num_writer_threads(4),
            Err(Error::AlreadyStarted)
        ));

        store.start_shutdown();
        assert_eq!(store.state(), StoreState::ShuttingDown);
        assert!(store.is_shutdown_in_progress());
        let err = store.create_root(None, "ticks").unwrap_err();
        assert!(matches!(err, Error::ShutdownInProgress));
        assert!(err.is_invalid_state());
        assert!(matches!(
            store.create_reader(true),
            Err(Error::ShutdownInProgress)
        ));

        // files produced until the end are still accepted
        store.add_to_write_queue(&file("ticks/0001", 1)).unwrap();
        assert!(store.wait_until_data_stored(Some(WAIT)).unwrap());
        assert_eq!(file_store.stored_paths(), vec!["ticks/0001"]);

        stop(&store);
        assert_eq!(store.state(), StoreState::Stopped);
        assert!(!store.is_shutdown_in_progress());
    }

    #[test]
    fn read_only_store_rejects_writes() {
        let file_store = Arc::new(ScriptedFileStore::new());
        let (store, _control) = store_with(config(), &file_store);
        store.set_read_only(true).unwrap();
        store.start().unwrap();
        assert!(store.is_read_only());

        let f = file("ticks/0001", 1);
        assert!(matches!(store.add_to_write_queue(&f), Err(Error::ReadOnly)));
        assert!(!f.is_queued());
        assert_eq!(store.num_dirty_files(), 0);
        stop(&store);
    }

    #[test]
    fn store_without_writers_rejects_writes() {
        let file_store = Arc::new(ScriptedFileStore::new());
        let (store, _control) = store_with(config(), &file_store);
        store.set_num_writer_threads(0).unwrap();
        store.start().unwrap();
        assert!(matches!(
            store.add_to_write_queue(&file("ticks/0001", 1)),
            Err(Error::NoActiveWriters)
        ));
        stop(&store);
    }

    #[test]
    #[should_panic(expected = "is already queued")]
    fn queuing_a_file_twice_panics() {
        let file_store = Arc::new(ScriptedFileStore::gated());
        let (store, _control) = store_with(config(), &file_store);
        store.start().unwrap();
        store.add_to_write_queue(&file("blocker", 1)).unwrap();
        assert!(file_store.wait_entered(WAIT));

        let f = file("ticks/0001", 1);
        store.add_to_write_queue(&f).unwrap();
        let _ = store.add_to_write_queue(&f);
    }

    #[test_log::test]
    fn files_are_stored_and_max_size_is_tracked() {
        let file_store = Arc::new(ScriptedFileStore::new());
        let (store, control) = store_with(
            StoreConfig {
                num_writer_threads: 3,
                ..config()
            },
            &file_store,
        );
        store.start().unwrap();
        assert_eq!(store.num_live_writers(), 3);
        assert_eq!(store.writer_ids(), vec![0, 1, 2]);

        let files: Vec<_> = [10, 30, 20]
            .iter()
            .enumerate()
            .map(|(i, size)| file(&format!("ticks/{i:04}"), *size))
            .collect();
        for f in &files {
            store.add_to_write_queue(f).unwrap();
        }
        assert_eq!(store.max_observed_file_size(), 30);
        assert!(store.wait_until_data_stored(Some(WAIT)).unwrap());

        assert_eq!(store.num_dirty_files(), 0);
        assert_eq!(store.write_queue_len(), 0);
        assert!(files.iter().all(|f| !f.is_queued() && f.data().is_none()));
        assert_eq!(file_store.stored_paths().len(), 3);
        assert_eq!(control.count(), 0);
        stop(&store);
    }

    #[test]
    fn wait_until_data_stored_times_out_while_writes_are_pending() {
        let file_store = Arc::new(ScriptedFileStore::gated());
        let (store, _control) = store_with(config(), &file_store);
        store.start().unwrap();
        store.add_to_write_queue(&file("ticks/0001", 1)).unwrap();
        assert!(file_store.wait_entered(WAIT));

        assert!(
            !store
                .wait_until_data_stored(Some(Duration::from_millis(20)))
                .unwrap()
        );
        file_store.allow(1);
        assert!(store.wait_until_data_stored(None).unwrap());
        stop(&store);
    }

    #[test]
    fn backpressure_blocks_until_memory_is_available() {
        let file_store = Arc::new(ScriptedFileStore::gated());
        let gauge = Arc::new(MockMemoryGauge::new(400));
        let store = PersistentDataStore::new_with_memory_gauge(
            config(),
            Arc::clone(&file_store) as _,
            Arc::clone(&gauge) as _,
        );
        store.start().unwrap();

        // nothing in flight: never blocks, however low memory is
        store.check_write_queue_limit().unwrap();

        store.add_to_write_queue(&file("ticks/0001", 100)).unwrap();
        let producer = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.check_write_queue_limit())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        gauge.set_free(501);
        producer.join().unwrap().unwrap();

        file_store.allow(1);
        stop(&store);
    }

    #[test]
    fn shutdown_interrupts_blocked_producers_and_waiters() {
        let file_store = Arc::new(ScriptedFileStore::gated());
        let store = PersistentDataStore::new_with_memory_gauge(
            config(),
            Arc::clone(&file_store) as _,
            Arc::new(MockMemoryGauge::new(0)),
        );
        store.start().unwrap();
        store.add_to_write_queue(&file("ticks/0001", 100)).unwrap();

        let producer = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.check_write_queue_limit())
        };
        let waiter = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.wait_until_data_stored(None))
        };
        thread::sleep(Duration::from_millis(20));

        store.shutdown();
        assert!(matches!(producer.join().unwrap(), Err(Error::Interrupted)));
        assert!(matches!(waiter.join().unwrap(), Err(Error::Interrupted)));

        // the writer still finishes the file it holds before it exits
        file_store.allow(1);
        assert!(store.wait_for_shutdown(Some(WAIT)));
        assert_eq!(store.num_dirty_files(), 0);
    }

    #[test]
    fn wait_for_shutdown_times_out_on_busy_writer() {
        let file_store = Arc::new(ScriptedFileStore::gated());
        let (store, _control) = store_with(config(), &file_store);
        store.start().unwrap();
        store.add_to_write_queue(&file("ticks/0001", 1)).unwrap();
        assert!(file_store.wait_entered(WAIT));

        store.shutdown();
        assert!(!store.wait_for_shutdown(Some(Duration::from_millis(20))));
        assert_eq!(store.num_live_writers(), 1);

        file_store.allow(1);
        assert!(store.wait_for_shutdown(Some(WAIT)));
        assert_eq!(store.num_live_writers(), 0);
    }

    #[test_log::test]
    fn transient_failure_is_retried() {
        let file_store = Arc::new(ScriptedFileStore::new());
        let (store, control) = store_with(config(), &file_store);
        file_store.fail_times("ticks/0001", 1);
        store.start().unwrap();

        let f = file("ticks/0001", 8);
        store.add_to_write_queue(&f).unwrap();
        assert!(store.wait_until_data_stored(Some(WAIT)).unwrap());

        assert_eq!(file_store.attempts("ticks/0001"), 2);
        assert_eq!(store.failures_for_path("ticks/0001"), 1);
        assert_eq!(store.failed_write_attempts(), 1);
        assert!(!f.is_discarded());
        assert!(!f.is_queued());
        assert_eq!(control.count(), 0);
        stop(&store);
    }

    #[test_log::test]
    fn file_is_discarded_after_its_last_attempt() {
        let file_store = Arc::new(ScriptedFileStore::new());
        let (store, control) = store_with(config(), &file_store);
        file_store.set_always_fail(true);
        store.start().unwrap();

        let f = file("ticks/0001", 8);
        store.add_to_write_queue(&f).unwrap();
        assert!(store.wait_until_data_stored(Some(WAIT)).unwrap());

        assert_eq!(file_store.attempts("ticks/0001"), 2);
        assert_eq!(store.failures_for_path("ticks/0001"), 2);
        assert!(f.is_discarded());
        // still flagged so the owner does not queue it again
        assert!(f.is_queued());
        assert_eq!(store.num_dirty_files(), 0);
        assert_eq!(store.write_queue_len(), 0);
        assert!(file_store.stored_paths().is_empty());
        assert_eq!(control.count(), 1);
        stop(&store);
    }

    #[test]
    fn retry_keeps_the_file_dirty() {
        let file_store = Arc::new(ScriptedFileStore::gated());
        let (store, _control) = store_with(config(), &file_store);
        file_store.fail_times("ticks/0001", 1);
        store.start().unwrap();
        store.add_to_write_queue(&file("ticks/0001", 8)).unwrap();

        assert!(file_store.wait_entered(WAIT));
        assert_eq!(store.num_dirty_files(), 1);
        file_store.allow(1);

        // second attempt reached the file store: the failure did not resolve the file
        assert!(file_store.wait_entered(WAIT));
        assert_eq!(store.failures_for_path("ticks/0001"), 1);
        assert_eq!(store.num_dirty_files(), 1);
        file_store.allow(1);

        assert!(store.wait_until_data_stored(Some(WAIT)).unwrap());
        stop(&store);
    }

    #[test]
    fn retries_during_shutdown_yield_to_new_files() {
        let file_store = Arc::new(ScriptedFileStore::gated());
        let (store, _control) = store_with(config(), &file_store);
        file_store.fail_times("ticks/retried", 1);
        store.start().unwrap();

        store.add_to_write_queue(&file("ticks/retried", 8)).unwrap();
        assert_eq!(
            file_store.wait_entered_path(WAIT).as_deref(),
            Some("ticks/retried")
        );
        store.start_shutdown();
        store.add_to_write_queue(&file("ticks/fresh", 8)).unwrap();
        file_store.allow(1);

        assert_eq!(
            file_store.wait_entered_path(WAIT).as_deref(),
            Some("ticks/fresh")
        );
        file_store.allow(1);
        assert_eq!(
            file_store.wait_entered_path(WAIT).as_deref(),
            Some("ticks/retried")
        );
        file_store.allow(1);

        assert!(store.wait_until_data_stored(Some(WAIT)).unwrap());
        stop(&store);
    }

    #[test]
    fn failure_of_superseded_file_is_not_retried() {
        let file_store = Arc::new(ScriptedFileStore::new());
        let (store, control) = store_with(config(), &file_store);
        store.start().unwrap();
        let f = file("ticks/0001", 8);
        store.add_to_write_queue(&f).unwrap();
        assert!(store.wait_until_data_stored(Some(WAIT)).unwrap());

        // reported directly, as a writer racing with the owner would
        let stale = file("ticks/0002", 8);
        store.drain.increment();
        stale.deactivate();
        store.file_has_failed(&stale, &FileStoreError::Unavailable("down".to_string()));

        assert_eq!(store.num_dirty_files(), 0);
        assert_eq!(store.failed_write_attempts(), 0);
        assert_eq!(store.failures_for_path("ticks/0002"), 0);
        assert_eq!(control.count(), 0);
        stop(&store);
    }

    #[test]
    fn failure_threshold_triggers_exactly_once() {
        let file_store = Arc::new(ScriptedFileStore::new());
        let (store, control) = store_with(
            StoreConfig {
                attempts_per_file: u32::MAX,
                failures_to_trigger_shutdown: 5,
                ..config()
            },
            &file_store,
        );
        let barrier = Arc::new(Barrier::new(8));
        let reporters: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..2 {
                        let f = file(&format!("ticks/{t}/{i}"), 1);
                        store.file_has_failed(&f, &FileStoreError::Unavailable("down".into()));
                    }
                })
            })
            .collect();
        for reporter in reporters {
            reporter.join().unwrap();
        }

        assert_eq!(store.failed_write_attempts(), 16);
        assert_eq!(control.count(), 1);
    }

    #[test]
    fn losing_the_last_writer_triggers_exactly_once() {
        let file_store = Arc::new(ScriptedFileStore::new());
        let (store, control) = store_with(
            StoreConfig {
                num_writer_threads: 4,
                ..config()
            },
            &file_store,
        );
        store.start().unwrap();
        let ids = store.writer_ids();

        let barrier = Arc::new(Barrier::new(ids.len() * 2));
        let reporters: Vec<_> = ids
            .iter()
            .chain(ids.iter())
            .map(|id| {
                let (store, barrier, id) = (Arc::clone(&store), Arc::clone(&barrier), *id);
                thread::spawn(move || {
                    barrier.wait();
                    store.writer_failed(id);
                })
            })
            .collect();
        for reporter in reporters {
            reporter.join().unwrap();
        }

        assert_eq!(store.num_live_writers(), 0);
        assert_eq!(control.count(), 1);
        assert!(matches!(
            store.add_to_write_queue(&file("ticks/0001", 1)),
            Err(Error::NoActiveWriters)
        ));
        stop(&store);
    }

    #[test_log::test]
    fn panicking_file_store_kills_writers() {
        let file_store = Arc::new(ScriptedFileStore::new());
        let (store, control) = store_with(
            StoreConfig {
                num_writer_threads: 2,
                attempts_per_file: 10,
                ..config()
            },
            &file_store,
        );
        file_store.panic_on("ticks/poison");
        store.start().unwrap();

        store.add_to_write_queue(&file("ticks/poison", 8)).unwrap();
        assert!(eventually(|| store.num_live_writers() == 0));

        assert_eq!(file_store.attempts("ticks/poison"), 2);
        assert_eq!(store.failures_for_path("ticks/poison"), 2);
        assert_eq!(control.count(), 1);
        // the file waits for writers that will never come
        assert_eq!(store.num_dirty_files(), 1);
        assert_eq!(store.write_queue_len(), 1);
        stop(&store);
    }

    #[test]
    fn interrupted_writer_rejects_new_files() {
        let file_store = Arc::new(ScriptedFileStore::gated());
        let (store, _control) = store_with(config(), &file_store);
        store.start().unwrap();
        store.add_to_write_queue(&file("ticks/0001", 1)).unwrap();
        assert!(file_store.wait_entered(WAIT));

        store.state.lock().writers[0].interrupt();
        assert!(matches!(
            store.add_to_write_queue(&file("ticks/0002", 1)),
            Err(Error::WriterInterrupted { id: 0 })
        ));

        file_store.allow(1);
        stop(&store);
    }

    #[test_log::test]
    fn writer_drops_file_superseded_after_it_was_claimable() {
        let file_store = Arc::new(ScriptedFileStore::gated());
        let (store, control) = store_with(config(), &file_store);
        file_store.fail_times("ticks/stale", 1);
        store.start().unwrap();
        let writer = store.create_writer().unwrap();

        let stale = file("ticks/stale", 8);
        store.add_to_write_queue(&stale).unwrap();
        assert_eq!(
            file_store.wait_entered_path(WAIT).as_deref(),
            Some("ticks/stale")
        );
        store.add_to_write_queue(&file("ticks/blocker", 8)).unwrap();
        store.start_shutdown();

        // the failure parks the stale file in the retry lane while the writer holds the blocker
        file_store.allow(1);
        assert_eq!(
            file_store.wait_entered_path(WAIT).as_deref(),
            Some("ticks/blocker")
        );
        assert_eq!(store.failures_for_path("ticks/stale"), 1);
        assert!(!writer.supersede(&stale));
        assert!(stale.is_queued());
        assert_eq!(store.num_dirty_files(), 2);

        file_store.allow(1);
        assert!(store.wait_until_data_stored(Some(WAIT)).unwrap());

        // no attempt was made after the file was superseded
        assert_eq!(file_store.attempts("ticks/stale"), 1);
        assert_eq!(file_store.stored_paths(), vec!["ticks/blocker"]);
        assert!(!stale.is_queued());
        assert!(!stale.is_discarded());
        assert_eq!(store.num_dirty_files(), 0);
        assert_eq!(store.failed_write_attempts(), 1);
        assert_eq!(control.count(), 0);
        stop(&store);
    }

    #[test]
    fn restart_without_join_replaces_stopped_writers() {
        let file_store = Arc::new(ScriptedFileStore::new());
        let (store, _control) = store_with(
            StoreConfig {
                num_writer_threads: 2,
                ..config()
            },
            &file_store,
        );
        store.start().unwrap();
        store.shutdown();

        store.start().unwrap();
        assert_eq!(store.writer_ids(), vec![2, 3]);
        store.add_to_write_queue(&file("ticks/0001", 1)).unwrap();
        assert!(store.wait_until_data_stored(Some(WAIT)).unwrap());
        assert_eq!(file_store.stored_paths(), vec!["ticks/0001"]);
        stop(&store);
    }

    #[derive(Debug, Clone, Copy)]
    enum Script {
        Succeed,
        Fail(u32),
        Supersede,
    }

    fn script() -> impl Strategy<Value = Script> {
        prop_oneof![
            Just(Script::Succeed),
            (1..3u32).prop_map(Script::Fail),
            Just(Script::Supersede),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn every_admitted_file_is_resolved_exactly_once(
            batches in prop::collection::vec(prop::collection::vec(script(), 1..8), 1..4)
        ) {
            let file_store = Arc::new(ScriptedFileStore::new());
            let (store, control) = store_with(
                StoreConfig {
                    num_writer_threads: 2,
                    attempts_per_file: 3,
                    failures_to_trigger_shutdown: u32::MAX,
                    ..config()
                },
                &file_store,
            );
            store.start().unwrap();
            let writer = store.create_writer().unwrap();

            let mut admitted = vec![];
            let mut failures = 0;
            for (b, batch) in batches.iter().enumerate() {
                for (i, step) in batch.iter().enumerate() {
                    let path = format!("ticks/{b}/{i}");
                    if let Script::Fail(n) = step {
                        file_store.fail_times(&path, *n);
                        failures += n;
                    }
                    let f = file(&path, 16 * (i + 1));
                    store.add_to_write_queue(&f).unwrap();
                    if let Script::Supersede = step {
                        writer.supersede(&f);
                    }
                    admitted.push((f, *step));
                }
                prop_assert!(store.wait_until_data_stored(Some(WAIT)).unwrap());
                prop_assert_eq!(store.num_dirty_files(), 0);
                prop_assert_eq!(store.write_queue_len(), 0);
            }

            // an unmatched resolution would have panicked a writer
            prop_assert_eq!(store.num_live_writers(), 2);
            prop_assert!(admitted.iter().all(|(f, _)| !f.is_queued() && !f.is_discarded()));
            let stored = file_store.stored_paths();
            for (f, step) in &admitted {
                if !matches!(step, Script::Supersede) {
                    prop_assert!(stored.iter().any(|p| p == f.path()));
                }
            }
            prop_assert!(store.failed_write_attempts() <= failures);
            prop_assert_eq!(control.count(), 0);
            stop(&store);
        }
    }
}
