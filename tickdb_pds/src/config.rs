use std::time::Duration;

/// Total attempts to store a file: a failed file is retried while its failure count is below this
/// and discarded once it is reached. With 2, a file is written at most twice.
pub const DEFAULT_ATTEMPTS_PER_FILE: u32 = 2;

/// Failed writes, across all files, after which an emergency shutdown is triggered.
pub const DEFAULT_FAILURES_TO_TRIGGER_SHUTDOWN: u32 = 5;

pub const DEFAULT_NUM_WRITER_THREADS: usize = 1;

/// Producers are throttled once free memory drops to this multiple of the largest file seen.
pub const DEFAULT_BACKPRESSURE_MULTIPLIER: u64 = 5;

pub const DEFAULT_BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration of a [`PersistentDataStore`](crate::PersistentDataStore), read once when the store
/// is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    pub attempts_per_file: u32,
    pub failures_to_trigger_shutdown: u32,
    pub num_writer_threads: usize,
    pub backpressure_multiplier: u64,
    pub backpressure_poll_interval: Duration,
    /// Memory budget for backpressure; the total system memory when not set
    pub memory_limit_bytes: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            attempts_per_file: DEFAULT_ATTEMPTS_PER_FILE,
            failures_to_trigger_shutdown: DEFAULT_FAILURES_TO_TRIGGER_SHUTDOWN,
            num_writer_threads: DEFAULT_NUM_WRITER_THREADS,
            backpressure_multiplier: DEFAULT_BACKPRESSURE_MULTIPLIER,
            backpressure_poll_interval: DEFAULT_BACKPRESSURE_POLL_INTERVAL,
            memory_limit_bytes: None,
        }
    }
}
