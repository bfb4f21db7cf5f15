//! CLI config for the persistent data store.

use std::{path::PathBuf, time::Duration};

use tickdb_pds::{
    Algorithm, LocalFileStore, StoreConfig,
    config::{
        DEFAULT_ATTEMPTS_PER_FILE, DEFAULT_BACKPRESSURE_MULTIPLIER,
        DEFAULT_FAILURES_TO_TRIGGER_SHUTDOWN, DEFAULT_NUM_WRITER_THREADS,
    },
};

/// Compression applied to files written to local storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum StorageCompression {
    /// Store blocks as they are.
    #[default]
    None,

    /// zlib, smaller files at a higher CPU cost.
    Zlib,

    /// Snappy, fast with moderate compression.
    Snappy,
}

impl From<StorageCompression> for Algorithm {
    fn from(value: StorageCompression) -> Self {
        match value {
            StorageCompression::None => Self::None,
            StorageCompression::Zlib => Self::Zlib,
            StorageCompression::Snappy => Self::Snappy,
        }
    }
}

/// CLI config for the persistent data store
#[derive(Debug, Clone, clap::Parser)]
pub struct StorageConfig {
    /// Directory below which dirty files are persisted.
    #[clap(
        long = "storage-data-dir",
        env = "TICKDB_STORAGE_DATA_DIR",
        default_value = ".tickdb",
        action
    )]
    pub data_dir: PathBuf,

    /// Compression of persisted files.
    #[clap(
        long = "storage-compression",
        env = "TICKDB_STORAGE_COMPRESSION",
        default_value_t = StorageCompression::default(),
        value_enum,
        action
    )]
    pub compression: StorageCompression,

    /// Number of failed writes of one file after which the file is discarded and the process is
    /// shut down.
    #[clap(
        long = "storage-attempts-per-file",
        env = "TICKDB_STORAGE_ATTEMPTS_PER_FILE",
        default_value_t = DEFAULT_ATTEMPTS_PER_FILE,
        action
    )]
    pub attempts_per_file: u32,

    /// Number of failed writes, across all files, after which the process is shut down.
    #[clap(
        long = "storage-failures-to-trigger-shutdown",
        env = "TICKDB_STORAGE_FAILURES_TO_TRIGGER_SHUTDOWN",
        default_value_t = DEFAULT_FAILURES_TO_TRIGGER_SHUTDOWN,
        action
    )]
    pub failures_to_trigger_shutdown: u32,

    /// Number of writer threads persisting dirty files.
    #[clap(
        long = "storage-num-writer-threads",
        env = "TICKDB_STORAGE_NUM_WRITER_THREADS",
        default_value_t = DEFAULT_NUM_WRITER_THREADS,
        action
    )]
    pub num_writer_threads: usize,

    /// Producers are throttled while free memory is at most this multiple of the largest file
    /// seen so far.
    #[clap(
        long = "storage-backpressure-multiplier",
        env = "TICKDB_STORAGE_BACKPRESSURE_MULTIPLIER",
        default_value_t = DEFAULT_BACKPRESSURE_MULTIPLIER,
        action
    )]
    pub backpressure_multiplier: u64,

    /// How often a throttled producer re-checks free memory.
    #[clap(
        long = "storage-backpressure-poll-interval",
        env = "TICKDB_STORAGE_BACKPRESSURE_POLL_INTERVAL",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    pub backpressure_poll_interval: Duration,

    /// Memory budget in bytes for backpressure.
    ///
    /// Defaults to the total memory of the host.
    #[clap(
        long = "storage-memory-limit-bytes",
        env = "TICKDB_STORAGE_MEMORY_LIMIT_BYTES",
        action
    )]
    pub memory_limit_bytes: Option<u64>,

    /// Open the store read-only, rejecting every write.
    #[clap(
        long = "storage-read-only",
        env = "TICKDB_STORAGE_READ_ONLY",
        action
    )]
    pub read_only: bool,

    /// How long a shutdown waits for dirty files to be stored, and again for writers to stop.
    #[clap(
        long = "storage-shutdown-timeout",
        env = "TICKDB_STORAGE_SHUTDOWN_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub shutdown_timeout: Duration,
}

impl StorageConfig {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            attempts_per_file: self.attempts_per_file,
            failures_to_trigger_shutdown: self.failures_to_trigger_shutdown,
            num_writer_threads: self.num_writer_threads,
            backpressure_multiplier: self.backpressure_multiplier,
            backpressure_poll_interval: self.backpressure_poll_interval,
            memory_limit_bytes: self.memory_limit_bytes,
        }
    }

    pub fn local_file_store(&self) -> LocalFileStore {
        LocalFileStore::with_compression(self.data_dir.clone(), self.compression.into())
    }
}
