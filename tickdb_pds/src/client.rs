//! Producer and consumer handles created by the store.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::{BufferPool, PendingFile, PersistentDataStore, Result, StoreRoot};

/// Hands dirty blocks to the store, waiting for backpressure before each one.
#[derive(Debug, Clone)]
pub struct DataWriter {
    store: Arc<PersistentDataStore>,
    pool: Option<Arc<BufferPool>>,
}

impl DataWriter {
    pub(crate) fn new(store: Arc<PersistentDataStore>) -> Self {
        Self { store, pool: None }
    }

    /// Blocks written through this writer return their buffers to `pool` once stored.
    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn allocate(&self, capacity: usize) -> BytesMut {
        match &self.pool {
            Some(pool) => pool.allocate(capacity),
            None => BytesMut::with_capacity(capacity),
        }
    }

    /// Queues `data` as the new content of `name` below `root`.
    ///
    /// Blocks while the store applies backpressure.
    pub fn write_file(
        &self,
        root: &StoreRoot,
        name: &str,
        data: Bytes,
    ) -> Result<Arc<PendingFile>> {
        self.store.check_write_queue_limit()?;
        let file = match &self.pool {
            Some(pool) => root.leased_file(name, data, Arc::clone(pool) as _),
            None => root.pending_file(name, data),
        };
        self.store.add_to_write_queue(&file)?;
        debug!(%file, size = file.uncompressed_size(), "queued file");
        Ok(file)
    }

    /// Marks `file` as superseded by newer content. Returns whether the file was taken out of the
    /// queue before any writer claimed it.
    pub fn supersede(&self, file: &Arc<PendingFile>) -> bool {
        file.deactivate();
        self.store.remove_from_write_queue(file)
    }
}

/// Reads files back from the store.
#[derive(Debug, Clone)]
pub struct DataReader {
    store: Arc<PersistentDataStore>,
    live: bool,
}

impl DataReader {
    pub(crate) fn new(store: Arc<PersistentDataStore>, live: bool) -> Self {
        Self { store, live }
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Content of `name` below `root`. A live reader prefers content still waiting to be written.
    pub fn read(&self, root: &StoreRoot, name: &str) -> Result<Bytes> {
        let path = root.file_path(name);
        if self.live {
            if let Some(data) = self.store.queued_content(&path) {
                return Ok(data);
            }
        }
        Ok(self.store.file_store().load(&path)?)
    }
}
