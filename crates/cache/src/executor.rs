//! Running tasks through the cache
//!
//! [`SkipCachedExecutor::execute`] computes a task's cache key once, probes
//! the store, restores outputs on a hit and otherwise runs the task body and
//! stores its outputs. No error from the cache layer changes whether the task
//! itself succeeded: infrastructure problems are logged and the executor falls
//! back to running the task.

use crate::config::CacheConfig;
use crate::declaration::TaskDeclaration;
use crate::file_state::CachingFileStateProvider;
use crate::fingerprint::CacheKey;
use crate::history::TaskHistory;
use crate::packer::{OutputPacker, OutputProperty, TarZstOutputPacker, packable_outputs};
use crate::resolver::ProjectFileResolver;
use crate::state::BoundedReporter;
use crate::store::{Blob, CacheStore, LocalDirectoryStore};
use crate::task_state::{TaskState, TaskStateProvider};
use crate::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Failure reported by a task body.
pub type TaskFailure = Box<dyn std::error::Error + Send + Sync>;

/// Shared flag set when the surrounding build is cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    /// A flag that is not cancelled
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How the cache took part in one task execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Every skip-when-empty input was empty; nothing ran
    SkippedEmptySources,
    /// The task ran without cache interaction
    NotCacheable {
        /// Why the task could not be cached
        reason: String,
    },
    /// Outputs were restored from the store; the body did not run
    Hit,
    /// The body ran and failed, so nothing was stored
    Executed,
    /// The body ran and its outputs were stored
    Stored,
    /// The body ran but packing or storing its outputs failed
    StoreFailed {
        /// What went wrong
        reason: String,
    },
    /// The body ran but the build was cancelled before outputs were stored
    StoreAbandoned,
}

/// Result of [`SkipCachedExecutor::execute`].
pub struct TaskExecution {
    /// What the cache did
    pub outcome: CacheOutcome,
    /// Failure of the task body, if it ran and failed
    pub failure: Option<TaskFailure>,
    /// Cache key, when one could be computed
    pub cache_key: Option<CacheKey>,
    /// Why the task was not up to date according to its history
    pub differences: Vec<String>,
}

impl TaskExecution {
    fn new(outcome: CacheOutcome) -> Self {
        Self {
            outcome,
            failure: None,
            cache_key: None,
            differences: Vec::new(),
        }
    }

    /// Whether the task counts as successful
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Whether the task body was invoked
    #[must_use]
    pub fn body_executed(&self) -> bool {
        !matches!(
            self.outcome,
            CacheOutcome::SkippedEmptySources | CacheOutcome::Hit
        )
    }
}

impl fmt::Debug for TaskExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecution")
            .field("outcome", &self.outcome)
            .field("failure", &self.failure.as_ref().map(ToString::to_string))
            .field("cache_key", &self.cache_key)
            .field("differences", &self.differences)
            .finish()
    }
}

/// A cacheable task with everything computed before the body runs.
struct Prepared {
    state: TaskState,
    key: CacheKey,
    outputs: Vec<OutputProperty>,
}

/// Skips tasks whose outputs are already in the cache.
pub struct SkipCachedExecutor {
    states: TaskStateProvider,
    store: Arc<dyn CacheStore>,
    packer: Arc<dyn OutputPacker>,
    history: Option<TaskHistory>,
    cancellation: CancellationFlag,
    caching_enabled: bool,
    max_reported_differences: usize,
}

impl fmt::Debug for SkipCachedExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkipCachedExecutor")
            .field("root", &self.states.root())
            .field("store", &self.store.description())
            .field("history", &self.history)
            .field("caching_enabled", &self.caching_enabled)
            .finish_non_exhaustive()
    }
}

impl SkipCachedExecutor {
    /// Executor using the given collaborators, with caching on and no history.
    pub fn new(
        states: TaskStateProvider,
        store: Arc<dyn CacheStore>,
        packer: Arc<dyn OutputPacker>,
    ) -> Self {
        tracing::info!(store = %store.description(), "Using task output cache");
        Self {
            states,
            store,
            packer,
            history: None,
            cancellation: CancellationFlag::new(),
            caching_enabled: true,
            max_reported_differences: CacheConfig::default().max_reported_differences,
        }
    }

    /// Executor for tasks under `project_dir` set up from `config`: a local
    /// directory store, tar+zstd archives and on-disk history.
    pub fn from_config(config: &CacheConfig, project_dir: &Path) -> Result<Self> {
        config.validate()?;
        let store_dir = config.resolve_store_dir()?;
        let history_dir = config.resolve_history_dir(&store_dir);
        let states = TaskStateProvider::new(
            project_dir,
            config.format_version.clone(),
            Arc::new(ProjectFileResolver::new(project_dir)),
            Arc::new(CachingFileStateProvider::new()),
        );
        let packer = TarZstOutputPacker::new(project_dir, config.compression_level);
        Ok(Self::new(
            states,
            Arc::new(LocalDirectoryStore::new(store_dir)),
            Arc::new(packer),
        )
        .with_history(TaskHistory::new(history_dir))
        .with_caching_enabled(config.enabled)
        .with_max_reported_differences(config.max_reported_differences))
    }

    /// Record and compare task states using `history`.
    #[must_use]
    pub fn with_history(mut self, history: TaskHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// Abandon storing outputs once `flag` is set.
    #[must_use]
    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancellation = flag;
        self
    }

    /// Turn all cache interaction on or off.
    #[must_use]
    pub fn with_caching_enabled(mut self, enabled: bool) -> Self {
        self.caching_enabled = enabled;
        self
    }

    /// Cap the differences collected from history.
    #[must_use]
    pub fn with_max_reported_differences(mut self, max: usize) -> Self {
        self.max_reported_differences = max;
        self
    }

    /// The state provider used for keys
    #[must_use]
    pub fn states(&self) -> &TaskStateProvider {
        &self.states
    }

    /// Compute the cache key of `task` without running anything.
    pub fn cache_key(&self, task: &TaskDeclaration) -> Result<CacheKey> {
        self.states.capture(task)?.cache_key()
    }

    /// Differences between the current state of `task` and its last
    /// recorded state. `None` when nothing has been recorded.
    pub fn explain(&self, task: &TaskDeclaration) -> Result<Option<Vec<String>>> {
        let Some(history) = &self.history else {
            return Ok(None);
        };
        let Some(previous) = history.previous(&task.path)? else {
            return Ok(None);
        };
        let state = self.states.capture(task)?;
        let mut reporter = BoundedReporter::new(self.max_reported_differences);
        state.diff(&previous.into_state(), &mut reporter)?;
        Ok(Some(reporter.into_differences()))
    }

    /// Run `task`, restoring its outputs from the cache when possible.
    pub fn execute<F>(&self, task: &TaskDeclaration, body: F) -> TaskExecution
    where
        F: FnOnce() -> std::result::Result<(), TaskFailure>,
    {
        let _span = tracing::info_span!("task.execute", task = %task.path).entered();
        let started = Instant::now();

        match task.should_skip_because_empty(self.states.resolver().as_ref()) {
            Ok(true) => {
                tracing::info!(task = %task.path, "Skipping task as it has no source files");
                return TaskExecution::new(CacheOutcome::SkippedEmptySources);
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(task = %task.path, error = %e, "Could not check for empty sources");
            }
        }

        let prepared = match self.prepare(task) {
            Ok(prepared) => prepared,
            Err(reason) => {
                tracing::debug!(task = %task.path, %reason, "Not caching task");
                let mut execution = TaskExecution::new(CacheOutcome::NotCacheable { reason });
                execution.failure = body().err();
                self.states.file_states().invalidate_all();
                return execution;
            }
        };
        tracing::debug!(task = %task.path, key = %prepared.key, "Computed cache key");
        let differences = self.differences_from_history(task, &prepared.state);

        if self.try_restore(task, &prepared) {
            self.states.file_states().invalidate_all();
            tracing::info!(
                task = %task.path,
                key = %prepared.key,
                elapsed_ms = started.elapsed().as_millis(),
                "Unpacked outputs from cache"
            );
            self.record_history(task, prepared.state, prepared.key);
            return TaskExecution {
                outcome: CacheOutcome::Hit,
                failure: None,
                cache_key: Some(prepared.key),
                differences,
            };
        }

        let mut execution = TaskExecution {
            outcome: CacheOutcome::Executed,
            failure: None,
            cache_key: Some(prepared.key),
            differences,
        };
        let result = body();
        // the body may have rewritten any file we memoised
        self.states.file_states().invalidate_all();
        if let Err(failure) = result {
            tracing::debug!(task = %task.path, error = %failure, "Task failed, not storing outputs");
            execution.failure = Some(failure);
            return execution;
        }

        execution.outcome = self.store_outputs(task, &prepared);
        self.record_history(task, prepared.state, prepared.key);
        execution
    }

    fn prepare(&self, task: &TaskDeclaration) -> std::result::Result<Prepared, String> {
        if !self.caching_enabled {
            return Err("caching is disabled".to_string());
        }
        if task.outputs.is_empty() {
            return Err("task declares no outputs".to_string());
        }
        if !task.cache_enabled {
            return Err("caching is disabled for this task".to_string());
        }
        let computed = self.states.capture(task).and_then(|state| {
            let key = state.cache_key()?;
            let outputs = packable_outputs(task, self.states.resolver().as_ref())?;
            Ok(Prepared {
                state,
                key,
                outputs,
            })
        });
        computed.map_err(|e| {
            if e.is_configuration() {
                tracing::warn!(task = %task.path, error = %e, "Could not build cache key");
            } else {
                tracing::info!(task = %task.path, error = %e, "Could not build cache key");
            }
            format!("could not build cache key: {e}")
        })
    }

    fn differences_from_history(&self, task: &TaskDeclaration, state: &TaskState) -> Vec<String> {
        let Some(history) = &self.history else {
            return Vec::new();
        };
        let previous = match history.previous(&task.path) {
            Ok(Some(entry)) => entry.into_state(),
            Ok(None) => {
                tracing::info!(task = %task.path, "No history is available for task");
                return Vec::new();
            }
            Err(e) => {
                tracing::info!(task = %task.path, error = %e, "Could not read task history");
                return Vec::new();
            }
        };
        let mut reporter = BoundedReporter::new(self.max_reported_differences);
        if let Err(e) = state.diff(&previous, &mut reporter) {
            tracing::info!(task = %task.path, error = %e, "Could not compare task state with history");
        }
        let differences = reporter.into_differences();
        for difference in &differences {
            tracing::info!(task = %task.path, "Task is not up to date: {difference}");
        }
        differences
    }

    fn try_restore(&self, task: &TaskDeclaration, prepared: &Prepared) -> bool {
        let blob = match self.store.get(&prepared.key) {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                tracing::debug!(task = %task.path, key = %prepared.key, "Cache miss");
                return false;
            }
            Err(e) => {
                tracing::info!(task = %task.path, key = %prepared.key, error = %e, "Could not load cached outputs");
                return false;
            }
        };
        let restored = blob
            .open()
            .and_then(|mut reader| self.packer.unpack(&prepared.outputs, &mut reader));
        match restored {
            Ok(summary) => {
                tracing::debug!(
                    task = %task.path,
                    key = %prepared.key,
                    files = summary.files,
                    "Cache hit"
                );
                true
            }
            Err(e) => {
                tracing::info!(task = %task.path, key = %prepared.key, error = %e, "Could not unpack cached outputs");
                false
            }
        }
    }

    fn store_outputs(&self, task: &TaskDeclaration, prepared: &Prepared) -> CacheOutcome {
        if self.cancellation.is_cancelled() {
            tracing::info!(task = %task.path, "Build cancelled, not storing outputs");
            return CacheOutcome::StoreAbandoned;
        }
        let staged = match self.pack_to_temp(prepared) {
            Ok(staged) => staged,
            Err(e) => {
                tracing::info!(task = %task.path, key = %prepared.key, error = %e, "Could not pack outputs");
                return CacheOutcome::StoreFailed {
                    reason: e.to_string(),
                };
            }
        };
        if self.cancellation.is_cancelled() {
            tracing::info!(task = %task.path, "Build cancelled, not storing outputs");
            return CacheOutcome::StoreAbandoned;
        }
        let blob = Blob::File(staged.path().to_path_buf());
        match self.store.put(&prepared.key, &blob) {
            Ok(()) => {
                tracing::info!(task = %task.path, key = %prepared.key, "Stored outputs in cache");
                CacheOutcome::Stored
            }
            Err(e) => {
                tracing::info!(task = %task.path, key = %prepared.key, error = %e, "Could not store outputs");
                CacheOutcome::StoreFailed {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn pack_to_temp(&self, prepared: &Prepared) -> Result<tempfile::NamedTempFile> {
        let mut staged =
            tempfile::NamedTempFile::new().map_err(|e| Error::io_no_path(e, "create temp"))?;
        self.packer.pack(&prepared.outputs, staged.as_file_mut())?;
        Ok(staged)
    }

    fn record_history(&self, task: &TaskDeclaration, state: TaskState, key: CacheKey) {
        let Some(history) = &self.history else {
            return;
        };
        let outputs = self
            .states
            .capture_outputs(task, Arc::new(CachingFileStateProvider::new()));
        let state = state.with_outputs(outputs);
        if let Err(e) = history.record(&task.path, &state, Some(key)) {
            tracing::info!(task = %task.path, error = %e, "Could not record task history");
        }
    }

    /// Where the history lives, if any
    #[must_use]
    pub fn history_dir(&self) -> Option<PathBuf> {
        self.history.as_ref().map(|h| h.dir().to_path_buf())
    }
}
