//! Task output caching for buildstash
//!
//! This crate decides whether a task can skip execution because an identical
//! run already produced its outputs:
//! - Deterministic cache keys from a task's implementation, properties,
//!   input files and declared outputs
//! - Task states that explain, in words, why a task is out of date
//! - Output archives that restore declared files and directories exactly
//! - Local and in-memory blob stores
//!
//! # Overview
//!
//! A [`TaskDeclaration`] names the task's inputs and outputs. The
//! [`TaskStateProvider`] snapshots it into a [`TaskState`], whose
//! [`TaskState::cache_key`] addresses a packed archive in a [`CacheStore`].
//! [`SkipCachedExecutor`] ties these together around a task body.
//!
//! # Cache Key Computation
//!
//! Cache keys are SHA-256 digests over, in order:
//! - The format version
//! - The hash of the task implementation
//! - Each input property's value
//! - Each input file collection, according to its order, path and contents modes
//! - The kinds and root-relative paths of declared outputs

// TODO(cache-docs): Add # Errors documentation to all fallible public functions
#![expect(
    clippy::missing_errors_doc,
    reason = "Error documentation to be added incrementally"
)]

pub mod config;
pub mod declaration;
mod error;
pub mod executor;
pub mod file_state;
pub mod fingerprint;
pub mod history;
pub mod packer;
pub mod paths;
pub mod resolver;
pub mod state;
pub mod store;
pub mod task_state;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use config::CacheConfig;
pub use declaration::{InputModes, OutputKind, TaskDeclaration, TaskInputs, TaskOutputs};
pub use executor::{CacheOutcome, CancellationFlag, SkipCachedExecutor, TaskExecution, TaskFailure};
pub use file_state::{CachingFileStateProvider, ContentHash, FileState, FileStateProvider};
pub use fingerprint::{CacheKey, FORMAT_VERSION, FingerprintBuilder, Value};
pub use history::{HistoryEntry, TaskHistory};
pub use packer::{OutputPacker, TarZstOutputPacker};
pub use resolver::{FileResolver, ProjectFileResolver};
pub use state::{BoundedReporter, ContentsMode, DifferenceReporter, OrderMode, PathMode};
pub use store::{Blob, CacheStore, InMemoryStore, LocalDirectoryStore};
pub use task_state::{TaskState, TaskStateProvider};
