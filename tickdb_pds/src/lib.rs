//! The persistent data store (PDS) is the write-behind layer of the tick storage engine. Ingestion
//! fills in-memory data blocks and hands each full block over as a [`PendingFile`]. The store queues
//! dirty files and a fixed pool of writer threads persists them through a [`FileStore`].
//!
//! Transient write failures are retried per file up to a configured ceiling. Once a file exhausts
//! its attempts, or the total number of failed writes across all files reaches a configured
//! threshold, or every writer thread has died, the store escalates to an emergency shutdown of the
//! process through an [`EmergencyShutdownControl`].
//!
//! Producers are throttled by [`PersistentDataStore::check_write_queue_limit`] when free memory
//! runs low compared to the largest file seen so far, and can wait for all admitted data to become
//! durable with [`PersistentDataStore::wait_until_data_stored`].

pub mod buffer_pool;
pub mod client;
pub mod codecs;
pub mod config;
pub mod file_store;
pub mod memory;
pub mod pending_file;
pub mod root;
pub mod shutdown;
pub mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

mod drain;
mod queue;
mod writer_pool;

pub use buffer_pool::BufferPool;
pub use client::{DataReader, DataWriter};
pub use codecs::{Algorithm, BlockCompressor, BlockDecompressor, CodecError};
pub use config::StoreConfig;
pub use file_store::{FileStore, FileStoreError, LocalFileStore};
pub use memory::{MemoryGauge, MockMemoryGauge, SysinfoMemoryGauge};
pub use pending_file::{FileId, Lease, PendingFile};
pub use root::StoreRoot;
pub use shutdown::drain_on_shutdown;
pub use store::{PersistentDataStore, StoreState};
pub use tickdb_shutdown::EmergencyShutdownControl;
pub use writer_pool::WriterId;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("persistent data store is not started")]
    NotStarted,

    #[error("persistent data store is already started")]
    AlreadyStarted,

    #[error("persistent data store shutdown in progress")]
    ShutdownInProgress,

    #[error("persistent data store is running in read-only mode")]
    ReadOnly,

    #[error("no active writers available")]
    NoActiveWriters,

    #[error("writer thread {id} is interrupted")]
    WriterInterrupted { id: WriterId },

    #[error("interrupted while waiting")]
    Interrupted,

    #[error("unable to spawn writer thread: {0}")]
    SpawnWriter(#[source] std::io::Error),

    #[error("file store error: {0}")]
    FileStore(#[from] FileStoreError),
}

impl Error {
    /// Errors returned synchronously for a call made while the store's lifecycle does not allow
    /// it. Such calls have no side effects.
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            Self::NotStarted
                | Self::AlreadyStarted
                | Self::ShutdownInProgress
                | Self::ReadOnly
                | Self::NoActiveWriters
                | Self::WriterInterrupted { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
