//! Blob stores holding packed outputs, keyed by cache key

use crate::fingerprint::CacheKey;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const BLOB_EXTENSION: &str = "tar.zst";

/// A stored or to-be-stored archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blob {
    /// Held in memory
    Bytes(Arc<[u8]>),
    /// Held in a file on disk
    File(PathBuf),
}

impl Blob {
    /// Open a streaming reader over the blob's bytes.
    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        match self {
            Self::Bytes(bytes) => Ok(Box::new(io::Cursor::new(Arc::clone(bytes)))),
            Self::File(path) => {
                let file = fs::File::open(path).map_err(|e| Error::io(e, path, "open"))?;
                Ok(Box::new(io::BufReader::new(file)))
            }
        }
    }

    /// Read the whole blob into memory.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        match self {
            Self::Bytes(bytes) => Ok(bytes.to_vec()),
            Self::File(path) => fs::read(path).map_err(|e| Error::io(e, path, "read")),
        }
    }
}

/// Key/blob storage for packed outputs.
///
/// `get` and `put` must each be atomic: a reader never observes a partially
/// written blob, and repeated puts for one key leave the last blob in place.
pub trait CacheStore: Send + Sync {
    /// Human readable location, used in logs
    fn description(&self) -> String;

    /// Look up the blob stored under `key`.
    fn get(&self, key: &CacheKey) -> Result<Option<Blob>>;

    /// Store `blob` under `key`, replacing any previous blob.
    fn put(&self, key: &CacheKey, blob: &Blob) -> Result<()>;
}

/// Stores blobs as `{root}/{key[0:2]}/{key}.tar.zst`.
#[derive(Debug, Clone)]
pub struct LocalDirectoryStore {
    root: PathBuf,
}

impl LocalDirectoryStore {
    /// Store rooted at `root`; directories are created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the blob for `key` lives
    #[must_use]
    pub fn blob_path(&self, key: &CacheKey) -> PathBuf {
        let hex = key.to_hex();
        self.root
            .join(&hex[..2])
            .join(format!("{hex}.{BLOB_EXTENSION}"))
    }
}

impl CacheStore for LocalDirectoryStore {
    fn description(&self) -> String {
        format!("local directory {}", self.root.display())
    }

    fn get(&self, key: &CacheKey) -> Result<Option<Blob>> {
        let path = self.blob_path(key);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {
                tracing::debug!(key = %key, path = %path.display(), "Found cached blob");
                Ok(Some(Blob::File(path)))
            }
            Ok(_) => Err(Error::store(format!(
                "{} exists but is not a file",
                path.display()
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(e, &path, "stat")),
        }
    }

    fn put(&self, key: &CacheKey, blob: &Blob) -> Result<()> {
        let path = self.blob_path(key);
        let shard = path
            .parent()
            .ok_or_else(|| Error::store(format!("no shard directory for {}", path.display())))?;
        fs::create_dir_all(shard).map_err(|e| Error::io(e, shard, "create_dir_all"))?;

        let mut staged =
            tempfile::NamedTempFile::new_in(shard).map_err(|e| Error::io(e, shard, "create temp"))?;
        let mut reader = blob.open()?;
        let bytes = io::copy(&mut reader, &mut staged)
            .map_err(|e| Error::io(e, staged.path(), "write"))?;
        staged
            .as_file_mut()
            .flush()
            .map_err(|e| Error::io(e, staged.path(), "flush"))?;
        staged
            .persist(&path)
            .map_err(|e| Error::io(e.error, &path, "persist"))?;
        tracing::debug!(key = %key, path = %path.display(), bytes, "Stored cache blob");
        Ok(())
    }
}

/// Keeps blobs in memory; useful for embedding and tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    blobs: RwLock<HashMap<CacheKey, Arc<[u8]>>>,
}

impl InMemoryStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl CacheStore for InMemoryStore {
    fn description(&self) -> String {
        "in-memory store".to_string()
    }

    fn get(&self, key: &CacheKey) -> Result<Option<Blob>> {
        Ok(self.blobs.read().get(key).map(|b| Blob::Bytes(Arc::clone(b))))
    }

    fn put(&self, key: &CacheKey, blob: &Blob) -> Result<()> {
        let bytes: Arc<[u8]> = match blob {
            Blob::Bytes(bytes) => Arc::clone(bytes),
            Blob::File(_) => blob.to_vec()?.into(),
        };
        self.blobs.write().insert(*key, bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{FORMAT_VERSION, FingerprintBuilder};
    use tempfile::TempDir;

    fn key(seed: &str) -> CacheKey {
        let mut builder = FingerprintBuilder::new("/", FORMAT_VERSION);
        builder.absorb_str(seed);
        builder.finish()
    }

    #[test]
    fn blob_path_is_sharded() {
        let store = LocalDirectoryStore::new("/cache");
        let k = key("a");
        let hex = k.to_hex();
        assert_eq!(
            store.blob_path(&k),
            PathBuf::from(format!("/cache/{}/{hex}.tar.zst", &hex[..2]))
        );
    }

    #[test]
    fn local_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirectoryStore::new(dir.path());
        let k = key("entry");
        assert!(store.get(&k).unwrap().is_none());

        store
            .put(&k, &Blob::Bytes(Arc::from(&b"archive bytes"[..])))
            .unwrap();
        let blob = store.get(&k).unwrap().unwrap();
        assert_eq!(blob.to_vec().unwrap(), b"archive bytes");
    }

    #[test]
    fn repeated_put_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirectoryStore::new(dir.path());
        let k = key("same");
        let blob = Blob::Bytes(Arc::from(&b"payload"[..]));
        store.put(&k, &blob).unwrap();
        store.put(&k, &blob).unwrap();
        assert_eq!(store.get(&k).unwrap().unwrap().to_vec().unwrap(), b"payload");

        let shard = store.blob_path(&k).parent().unwrap().to_path_buf();
        let files = std::fs::read_dir(shard).unwrap().count();
        assert_eq!(files, 1, "no staged files may be left behind");
    }

    #[test]
    fn put_from_file_blob() {
        let dir = TempDir::new().unwrap();
        let staged = dir.path().join("staged.tar.zst");
        std::fs::write(&staged, "from disk").unwrap();

        let store = LocalDirectoryStore::new(dir.path().join("store"));
        let k = key("file");
        store.put(&k, &Blob::File(staged)).unwrap();
        let mut content = String::new();
        store
            .get(&k)
            .unwrap()
            .unwrap()
            .open()
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "from disk");
    }

    #[test]
    fn in_memory_store_last_writer_wins() {
        let store = InMemoryStore::new();
        let k = key("k");
        store.put(&k, &Blob::Bytes(Arc::from(&b"one"[..]))).unwrap();
        store.put(&k, &Blob::Bytes(Arc::from(&b"two"[..]))).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&k).unwrap().unwrap().to_vec().unwrap(), b"two");
    }
}
