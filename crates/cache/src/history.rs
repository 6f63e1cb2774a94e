//! Persisted task states from previous executions
//!
//! One JSON document per task, named after a digest of the task path so that
//! arbitrary task names map to safe file names.

use crate::fingerprint::CacheKey;
use crate::task_state::{TaskState, TaskStateRecord};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// A recorded task state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Task path the state belongs to
    pub task: String,
    /// When the state was recorded
    pub recorded_at: DateTime<Utc>,
    /// Cache key the state produced, if it was cacheable
    pub cache_key: Option<CacheKey>,
    /// The state itself
    pub state: TaskStateRecord,
}

impl HistoryEntry {
    /// Rebuild the recorded [`TaskState`].
    #[must_use]
    pub fn into_state(self) -> TaskState {
        TaskState::from_record(self.state)
    }
}

/// Directory of recorded task states.
#[derive(Debug, Clone)]
pub struct TaskHistory {
    dir: PathBuf,
}

impl TaskHistory {
    /// History stored under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the history files
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, task: &str) -> PathBuf {
        let digest = Sha256::digest(task.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(&digest[..16])))
    }

    /// The last recorded entry for `task`, if any.
    pub fn previous(&self, task: &str) -> Result<Option<HistoryEntry>> {
        let path = self.entry_path(task);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(e, &path, "read")),
        };
        let entry: HistoryEntry = serde_json::from_slice(&content).map_err(|e| {
            Error::serialization(format!("Failed to parse history {}: {e}", path.display()))
        })?;
        if entry.task != task {
            tracing::debug!(task, recorded = %entry.task, "Ignoring history recorded for another task");
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Record `state` as the latest state of `task`.
    pub fn record(&self, task: &str, state: &TaskState, cache_key: Option<CacheKey>) -> Result<()> {
        let entry = HistoryEntry {
            task: task.to_string(),
            recorded_at: Utc::now(),
            cache_key,
            state: state.to_record()?,
        };
        let json = serde_json::to_vec_pretty(&entry)
            .map_err(|e| Error::serialization(format!("Failed to serialize history: {e}")))?;

        fs::create_dir_all(&self.dir).map_err(|e| Error::io(e, &self.dir, "create_dir_all"))?;
        let path = self.entry_path(task);
        let mut staged = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| Error::io(e, &self.dir, "create temp"))?;
        staged
            .write_all(&json)
            .map_err(|e| Error::io(e, staged.path(), "write"))?;
        staged
            .persist(&path)
            .map_err(|e| Error::io(e.error, &path, "persist"))?;
        tracing::debug!(task, path = %path.display(), "Recorded task history");
        Ok(())
    }
}
