//! Error types for the cache crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(buildstash::cache::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "create")
        operation: String,
    },

    /// Configuration or validation error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(buildstash::cache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// The same property name was declared twice in one namespace
    #[error("{namespace} property '{property}' is declared more than once")]
    #[diagnostic(
        code(buildstash::cache::duplicate_property),
        help("Property names must be unique within the inputs and within the outputs of a task")
    )]
    DuplicateProperty {
        /// Namespace of the clash ("input", "output", "input file")
        namespace: &'static str,
        /// The clashing property name
        property: String,
    },

    /// An input declaration combines modes that cannot be honoured together
    #[error("Input file property '{property}' {reason}")]
    #[diagnostic(code(buildstash::cache::invalid_modes))]
    InvalidModes {
        /// The offending property
        property: String,
        /// Which combination was requested
        reason: &'static str,
    },

    /// A path that must live under the cache root does not
    #[error("Path {} is outside cache root {}", path.display(), root.display())]
    #[diagnostic(
        code(buildstash::cache::path_outside_root),
        help("Cache keys and archives only record paths relative to the project directory")
    )]
    PathOutsideRoot {
        /// The offending path
        path: PathBuf,
        /// The configured root
        root: PathBuf,
    },

    /// A lazily computed value referred back to itself while being fingerprinted
    #[error("Value refers to itself while being fingerprinted")]
    #[diagnostic(code(buildstash::cache::cyclic_value))]
    CyclicValue,

    /// Nested collections went deeper than the fingerprint builder allows
    #[error("Value nesting exceeds {limit} levels")]
    #[diagnostic(code(buildstash::cache::nesting_too_deep))]
    NestingTooDeep {
        /// The depth limit that was hit
        limit: usize,
    },

    /// A task property could not be evaluated
    #[error("Could not read value of property '{property}': {message}")]
    #[diagnostic(code(buildstash::cache::property_value))]
    PropertyValue {
        /// Property name
        property: String,
        /// Why evaluation failed
        message: String,
    },

    /// An output archive is malformed
    #[error("Corrupt output archive: {message}")]
    #[diagnostic(
        code(buildstash::cache::archive),
        help("The cache entry will be ignored and the task executed instead")
    )]
    Archive {
        /// What was wrong with the archive
        message: String,
    },

    /// A cache store backend failed
    #[error("Cache store error: {message}")]
    #[diagnostic(code(buildstash::cache::store))]
    Store {
        /// Error message from the backend
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(buildstash::cache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a path-outside-root error
    #[must_use]
    pub fn path_outside_root(path: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self::PathOutsideRoot {
            path: path.into(),
            root: root.into(),
        }
    }

    /// Create an archive error
    #[must_use]
    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive {
            message: msg.into(),
        }
    }

    /// Create a store error
    #[must_use]
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Whether this error stems from how the task was declared rather than
    /// from the cache infrastructure.
    ///
    /// Configuration errors are surfaced to the caller; everything else is
    /// logged and degrades to a cache miss.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::DuplicateProperty { .. }
                | Self::InvalidModes { .. }
                | Self::PathOutsideRoot { .. }
        )
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
