//! Snapshots of the individual concerns of a task
//!
//! Each snapshot can feed itself into a [`FingerprintBuilder`] and describe
//! how it differs from an earlier snapshot of the same concern.

mod classpath;
mod files;
mod properties;
mod reporter;

pub use classpath::ClasspathState;
pub use files::{
    CollectionModes, ContentsMode, FileCollectionKind, FileCollectionRecord,
    FileCollectionState, FileCollectionStates, FileEntry, OrderMode, PathMode,
};
pub use properties::PropertiesState;
pub use reporter::{BoundedReporter, DifferenceReporter, PrefixingReporter};

use crate::Result;
use crate::fingerprint::FingerprintBuilder;

/// One fingerprintable, diffable concern of a task.
pub trait StateComponent {
    /// Absorb this snapshot into `builder`.
    fn append_to_fingerprint(&self, builder: &mut FingerprintBuilder) -> Result<()>;

    /// Report how `self` differs from `previous`.
    ///
    /// Returns `Ok(false)` once the reporter asked to stop.
    fn diff(&self, previous: &Self, reporter: &mut dyn DifferenceReporter) -> Result<bool>;
}
