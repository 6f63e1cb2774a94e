//! Error display using miette for contextual error reporting

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::{Diagnostic, SourceSpan};
use std::path::PathBuf;
use thiserror::Error;

/// Successful exit code
pub const EXIT_OK: i32 = 0;
/// The task itself failed
pub const EXIT_TASK: i32 = 1;
/// CLI, task file or configuration error exit code
pub const EXIT_CLI: i32 = 2;
/// Cache infrastructure error exit code
pub const EXIT_CACHE: i32 = 3;

/// CLI-specific error types with diagnostics
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    #[error("Task file parsing failed")]
    #[diagnostic(code(buildstash::cli::task_file_parse_error))]
    TaskFileParse {
        task_file: String,
        #[source_code]
        src: String,
        #[label("{message}")]
        error_span: Option<SourceSpan>,
        message: String,
    },

    #[error("Task '{task}' is not defined in {task_file}")]
    #[diagnostic(code(buildstash::cli::unknown_task), help("Defined tasks: {available}"))]
    UnknownTask {
        task: String,
        task_file: String,
        available: String,
    },

    #[error("Task '{task}' is declared incorrectly: {message}")]
    #[diagnostic(code(buildstash::cli::invalid_task))]
    InvalidTask { task: String, message: String },

    #[error("File operation failed: {operation} {}", path.display())]
    #[diagnostic(
        code(buildstash::cli::file_error),
        help("Check file permissions and ensure the path exists")
    )]
    FileError {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Cache(#[from] buildstash_cache::Error),

    #[error("Task '{task}' failed")]
    #[diagnostic(code(buildstash::cli::task_failed))]
    TaskFailed {
        task: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl CliError {
    pub fn task_file_parse(
        task_file: impl Into<String>,
        src: impl Into<String>,
        error_span: Option<SourceSpan>,
        message: impl Into<String>,
    ) -> Self {
        Self::TaskFileParse {
            task_file: task_file.into(),
            src: src.into(),
            error_span,
            message: message.into(),
        }
    }

    pub fn invalid_task(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidTask {
            task: task.into(),
            message: message.into(),
        }
    }

    pub fn file_error(
        operation: impl Into<String>,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::FileError {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }
}

/// Map an error to the process exit code
pub fn exit_code_for(err: &CliError) -> i32 {
    match err {
        CliError::TaskFailed { .. } => EXIT_TASK,
        CliError::Cache(inner) if !inner.is_configuration() => EXIT_CACHE,
        _ => EXIT_CLI,
    }
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;
