//! A [`PendingFile`] is one buffered data block that is not durable yet.

use std::{
    fmt::{Debug, Display},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::Mutex;

/// Identity of a [`PendingFile`] instance. Two files with the same path have different ids.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Hash)]
pub struct FileId(u64);

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(0);

impl FileId {
    pub fn new() -> Self {
        Self(
            NEXT_FILE_ID
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
                .expect("Overflowed with file IDs"),
        )
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upstream ownership of the memory backing a pending file
///
/// Once a file is durably stored the store hands its bytes back through the lease before it counts
/// the file as resolved, e.g. to return the buffer to a [`BufferPool`](crate::BufferPool).
pub trait Lease: Debug + Send + Sync + 'static {
    fn release(&self, data: Bytes);
}

#[derive(Debug)]
pub struct PendingFile {
    id: FileId,
    path: Arc<str>,
    uncompressed_size: AtomicU64,
    data: Mutex<Option<Bytes>>,
    /// Set while the file is a member of the write queue, or was discarded from it
    queued: AtomicBool,
    /// Cleared when the owner supersedes the content before it was written
    active: AtomicBool,
    discarded: AtomicBool,
    lease: Option<Arc<dyn Lease>>,
}

impl PendingFile {
    pub fn new(path: impl Into<Arc<str>>, data: Bytes) -> Arc<Self> {
        Arc::new(Self::build(path.into(), data, None))
    }

    pub fn with_lease(path: impl Into<Arc<str>>, data: Bytes, lease: Arc<dyn Lease>) -> Arc<Self> {
        Arc::new(Self::build(path.into(), data, Some(lease)))
    }

    fn build(path: Arc<str>, data: Bytes, lease: Option<Arc<dyn Lease>>) -> Self {
        Self {
            id: FileId::new(),
            path,
            uncompressed_size: AtomicU64::new(data.len() as u64),
            data: Mutex::new(Some(data)),
            queued: AtomicBool::new(false),
            active: AtomicBool::new(true),
            discarded: AtomicBool::new(false),
            lease,
        }
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    /// Stable path of the file, shared by every version of its content
    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn path_key(&self) -> Arc<str> {
        Arc::clone(&self.path)
    }

    /// Best known uncompressed size in bytes
    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size.load(Ordering::Acquire)
    }

    pub fn set_uncompressed_size(&self, size: u64) {
        self.uncompressed_size.store(size, Ordering::Release);
    }

    /// Content to persist, `None` once it was released after a successful store
    pub fn data(&self) -> Option<Bytes> {
        self.data.lock().clone()
    }

    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    pub(crate) fn set_queued(&self, queued: bool) {
        self.queued.store(queued, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Marks the content as superseded. A write that fails afterwards is not counted against the
    /// store's reliability, and a writer that picks the file up drops it without writing.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Whether the store gave up on the file after exhausting its write attempts
    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    pub(crate) fn mark_discarded(&self) {
        self.discarded.store(true, Ordering::Release);
    }

    /// Gives the file's bytes back to its lease holder. Without a lease the bytes are dropped.
    pub fn release(&self) {
        let data = self.data.lock().take();
        if let (Some(lease), Some(data)) = (&self.lease, data) {
            lease.release(data);
        }
    }
}

impl Display for PendingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (#{})", self.path, self.id)
    }
}
