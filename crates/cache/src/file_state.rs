//! Snapshots of individual filesystem paths
//!
//! A [`FileState`] records what one path looked like when a task's state was
//! captured: the SHA-256 of a regular file together with its modification
//! time, a directory marker, or a missing marker. The
//! [`CachingFileStateProvider`] memoises these snapshots per path and is the
//! one structure shared between concurrently running tasks.

use crate::fingerprint::FingerprintBuilder;
use crate::paths;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::UNIX_EPOCH;

const DIRECTORY_CODE: &str = "DIRECTORY";
const MISSING_CODE: &str = "MISSING_FILE";

/// SHA-256 of a file's contents.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash an in-memory buffer.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    /// Raw digest bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({self})")
    }
}

impl TryFrom<String> for ContentHash {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        let bytes = hex::decode(&value)
            .map_err(|e| Error::serialization(format!("Invalid content hash '{value}': {e}")))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            Error::serialization(format!("Invalid content hash '{value}': expected 32 bytes"))
        })?;
        Ok(Self(bytes))
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_string()
    }
}

/// What a single path looked like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileState {
    /// A readable file
    Hashed {
        /// Content digest
        hash: ContentHash,
        /// Modification time in milliseconds since the Unix epoch
        timestamp: i64,
    },
    /// A directory
    Directory,
    /// Nothing at the path
    Missing,
}

impl FileState {
    /// Equal kind and, for files, equal content. Timestamps are ignored.
    #[must_use]
    pub fn content_equal(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Hashed { hash: a, .. }, Self::Hashed { hash: b, .. }) => a == b,
            (Self::Directory, Self::Directory) | (Self::Missing, Self::Missing) => true,
            _ => false,
        }
    }

    /// Content equality plus equal timestamps.
    #[must_use]
    pub fn content_and_metadata_equal(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Hashed {
                    hash: a,
                    timestamp: ta,
                },
                Self::Hashed {
                    hash: b,
                    timestamp: tb,
                },
            ) => a == b && ta == tb,
            _ => self.content_equal(other),
        }
    }

    /// Same variant, whatever the content.
    #[must_use]
    pub fn kind_equal(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Short label used in difference messages
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hashed { .. } => "file",
            Self::Directory => "directory",
            Self::Missing => "missing",
        }
    }

    /// Absorb the content identity of this state (never the timestamp).
    pub fn append_to_fingerprint(&self, builder: &mut FingerprintBuilder) {
        match self {
            Self::Hashed { hash, .. } => builder.absorb_bytes(hash.as_bytes()),
            Self::Directory => builder.absorb_str(DIRECTORY_CODE),
            Self::Missing => builder.absorb_str(MISSING_CODE),
        }
    }

    /// Absorb only the kind of this state, for collections that ignore contents.
    pub fn append_kind_to_fingerprint(&self, builder: &mut FingerprintBuilder) {
        match self {
            Self::Hashed { .. } => builder.absorb_str("FILE"),
            Self::Directory => builder.absorb_str(DIRECTORY_CODE),
            Self::Missing => builder.absorb_str(MISSING_CODE),
        }
    }
}

/// Computes [`FileState`]s for paths.
pub trait FileStateProvider: Send + Sync {
    /// Snapshot `path`, which must be absolute.
    fn state(&self, path: &Path) -> Result<FileState>;

    /// Forget memoised states so the next request reads the disk again.
    fn invalidate_all(&self) {}
}

/// Read `path` from disk without any memoisation.
pub fn snapshot(path: &Path) -> Result<FileState> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FileState::Missing),
        Err(e) => return Err(Error::io(e, path, "stat")),
    };
    if meta.is_dir() {
        return Ok(FileState::Directory);
    }
    let timestamp = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .and_then(|d| i64::try_from(d.as_millis()).ok())
        .unwrap_or_default();
    let hash = hash_file(path)?;
    Ok(FileState::Hashed { hash, timestamp })
}

/// Stream a file through SHA-256.
pub fn hash_file(path: &Path) -> Result<ContentHash> {
    let _span = tracing::trace_span!("hash_file", path = %path.display()).entered();
    let mut file = fs::File::open(path).map_err(|e| Error::io(e, path, "open"))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 64];
    let mut total: u64 = 0;
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::io(e, path, "read")),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    let digest = hasher.finalize();
    tracing::trace!(path = %path.display(), size = total, "Hashed file");
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(ContentHash(out))
}

type Slot = Arc<Mutex<Option<FileState>>>;

/// Per-path memoising provider.
///
/// Concurrent callers asking for the same path wait on that path's slot, so
/// each path is hashed at most once. Failed computations are not cached and
/// are retried by the next caller.
#[derive(Default)]
pub struct CachingFileStateProvider {
    slots: Mutex<HashMap<PathBuf, Slot>>,
    computed: AtomicUsize,
}

impl CachingFileStateProvider {
    /// Create an empty provider
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the state of one path.
    pub fn invalidate(&self, path: &Path) {
        self.slots.lock().remove(&paths::normalize(path));
    }

    /// Number of paths with a slot
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether nothing has been requested yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Snapshots taken from disk so far, failed attempts included
    #[must_use]
    pub fn computations(&self) -> usize {
        self.computed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for CachingFileStateProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingFileStateProvider")
            .field("paths", &self.len())
            .field("computations", &self.computations())
            .finish()
    }
}

impl FileStateProvider for CachingFileStateProvider {
    fn state(&self, path: &Path) -> Result<FileState> {
        let key = paths::normalize(path);
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        let mut guard = slot.lock();
        if let Some(state) = guard.as_ref() {
            return Ok(state.clone());
        }
        self.computed.fetch_add(1, Ordering::Relaxed);
        let state = snapshot(&key)?;
        *guard = Some(state.clone());
        Ok(state)
    }

    fn invalidate_all(&self) {
        self.slots.lock().clear();
    }
}
