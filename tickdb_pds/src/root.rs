//! Root folders of the store.

use std::sync::Arc;

use bytes::Bytes;

use crate::{Lease, PendingFile, PersistentDataStore};

/// A folder in the file store below which a component keeps its files, optionally scoped to a
/// storage space.
#[derive(Debug, Clone)]
pub struct StoreRoot {
    store: Arc<PersistentDataStore>,
    space: Option<Arc<str>>,
    path: Arc<str>,
}

impl StoreRoot {
    pub(crate) fn new(store: Arc<PersistentDataStore>, space: Option<&str>, path: &str) -> Self {
        Self {
            store,
            space: space.map(|s| Arc::from(s.trim_matches('/'))),
            path: Arc::from(path.trim_matches('/')),
        }
    }

    pub fn store(&self) -> &Arc<PersistentDataStore> {
        &self.store
    }

    pub fn space(&self) -> Option<&str> {
        self.space.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Store path of the file `name` below this root
    pub fn file_path(&self, name: &str) -> String {
        let name = name.trim_start_matches('/');
        match &self.space {
            Some(space) => format!("{space}/{}/{name}", self.path),
            None => format!("{}/{name}", self.path),
        }
    }

    pub fn pending_file(&self, name: &str, data: Bytes) -> Arc<PendingFile> {
        PendingFile::new(self.file_path(name), data)
    }

    pub fn leased_file(&self, name: &str, data: Bytes, lease: Arc<dyn Lease>) -> Arc<PendingFile> {
        PendingFile::with_lease(self.file_path(name), data, lease)
    }
}
