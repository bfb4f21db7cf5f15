//! Reusable buffers for data blocks.
//!
//! Ingestion fills blocks allocated from the pool. When a block's pending file is stored, the
//! store releases the file's bytes through its [`Lease`] and the buffer returns to the pool.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::Lease;

#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    max_pooled: usize,
    reused: AtomicU64,
    allocated: AtomicU64,
}

impl BufferPool {
    /// Creates a pool keeping at most `max_pooled` idle buffers.
    pub fn new(max_pooled: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
            reused: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
        }
    }

    /// An empty buffer with room for at least `capacity` bytes.
    pub fn allocate(&self, capacity: usize) -> BytesMut {
        let pooled = {
            let mut free = self.free.lock();
            free.iter()
                .position(|b| b.capacity() >= capacity)
                .map(|i| free.swap_remove(i))
        };
        match pooled {
            Some(buf) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(capacity)
            }
        }
    }

    pub fn give_back(&self, mut buf: BytesMut) {
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }

    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl Lease for BufferPool {
    fn release(&self, data: Bytes) {
        // buffers still shared, e.g. by a live reader, are left to the allocator
        if let Ok(buf) = data.try_into_mut() {
            self.give_back(buf);
        }
    }
}
