//! The durable side of the store: a [`FileStore`] persists one [`PendingFile`] at a time.
//!
//! Writers never share a file, so implementations only have to be safe for concurrent writes of
//! different paths.

use std::{
    fmt::Debug,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::{
    PendingFile,
    codecs::{Algorithm, CodecError},
};

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("file {0} has no content to store")]
    NoContent(String),

    #[error("file {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("file store unavailable: {0}")]
    Unavailable(String),

    #[error("file store panicked: {0}")]
    Panicked(String),
}

pub type Result<T, E = FileStoreError> = std::result::Result<T, E>;

pub trait FileStore: Debug + Send + Sync + 'static {
    /// Durably writes the content of `file` under its path.
    fn store(&self, file: &PendingFile) -> Result<()>;

    /// Reads back the uncompressed content stored under `path`.
    fn load(&self, path: &str) -> Result<Bytes>;
}

/// Size of the frame header: algorithm code and uncompressed length
const HEADER_LEN: usize = 1 + 8;

/// Stores files below a root directory on the local file system.
///
/// Each file is framed as a one byte [`Algorithm`] code, the little-endian `u64` uncompressed
/// length and the (possibly compressed) payload. Content is written to a temporary sibling, synced
/// and renamed into place, so a failed write leaves the previous version intact.
#[derive(Debug)]
pub struct LocalFileStore {
    root: PathBuf,
    algorithm: Algorithm,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_compression(root, Algorithm::None)
    }

    pub fn with_compression(root: impl Into<PathBuf>, algorithm: Algorithm) -> Self {
        Self {
            root: root.into(),
            algorithm,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path of a store path, which always resolves below the root
    pub fn local_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut framed = Vec::with_capacity(HEADER_LEN + data.len());
        framed
            .write_u8(self.algorithm.code())
            .and_then(|_| framed.write_u64::<LittleEndian>(data.len() as u64))
            .map_err(CodecError::from)?;
        self.algorithm.compressor().deflate(data, &mut framed)?;
        Ok(framed)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> FileStoreError + '_ {
    move |source| FileStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl FileStore for LocalFileStore {
    fn store(&self, file: &PendingFile) -> Result<()> {
        let data = file
            .data()
            .ok_or_else(|| FileStoreError::NoContent(file.path().to_string()))?;
        let framed = self.encode(&data)?;

        let target = self.local_path(file.path());
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        // versions of one path may be written concurrently, each through its own temporary file
        let mut tmp_name = target.clone().into_os_string();
        tmp_name.push(format!(".{}.tmp", file.id()));
        let tmp = PathBuf::from(tmp_name);

        let written = fs::File::create(&tmp)
            .and_then(|mut f| {
                f.write_all(&framed)?;
                f.sync_all()
            })
            .and_then(|_| fs::rename(&tmp, &target));
        if let Err(source) = written {
            let _ = fs::remove_file(&tmp);
            return Err(io_error(&target)(source));
        }

        debug!(
            path = %file.path(),
            uncompressed = data.len(),
            stored = framed.len(),
            algorithm = ?self.algorithm,
            "stored file"
        );
        Ok(())
    }

    fn load(&self, path: &str) -> Result<Bytes> {
        let local = self.local_path(path);
        let framed = fs::read(&local).map_err(io_error(&local))?;
        let corrupt = |reason: &str| FileStoreError::Corrupt {
            path: path.to_string(),
            reason: reason.to_string(),
        };
        if framed.len() < HEADER_LEN {
            return Err(corrupt("truncated header"));
        }

        let mut header = &framed[..HEADER_LEN];
        let algorithm = Algorithm::from_code(header.read_u8().map_err(CodecError::from)?)?;
        let len = header
            .read_u64::<LittleEndian>()
            .map_err(CodecError::from)?;
        let len = usize::try_from(len).map_err(|_| corrupt("length exceeds address space"))?;
        let payload = &framed[HEADER_LEN..];
        if len > algorithm.max_inflated_len(payload)? {
            return Err(corrupt("recorded length exceeds what the payload inflates to"));
        }

        let mut data = vec![0; len];
        algorithm.decompressor().inflate(payload, &mut data)?;
        Ok(Bytes::from(data))
    }
}
