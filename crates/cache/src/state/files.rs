//! File collection snapshots and how they are compared
//!
//! A collection is either path-based (each file keyed by its absolute or
//! hierarchy-relative path) or content-only (files identified purely by their
//! position in traversal order). Entries are computed on first use and never
//! change afterwards.

use super::{DifferenceReporter, PrefixingReporter, StateComponent};
use crate::Result;
use crate::file_state::{FileState, FileStateProvider};
use crate::fingerprint::FingerprintBuilder;
use crate::resolver::FileTree;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Whether the order of files in a collection matters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderMode {
    /// Traversal order is part of the state
    Ordered,
    /// Files are treated as a set
    #[default]
    Unordered,
}

/// How the location of a file is recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathMode {
    /// Full path, fingerprinted relative to the cache root
    #[default]
    Absolute,
    /// Path relative to the declared root the file was found under
    HierarchyRelative,
    /// Location is ignored; only contents count
    IgnorePath,
}

/// Whether file contents are part of the state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentsMode {
    /// Compare and fingerprint content hashes
    #[default]
    UseContents,
    /// Only the kind of each entry matters
    IgnoreContents,
}

/// The three modes of a file collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionModes {
    /// Order mode
    pub order: OrderMode,
    /// Path mode
    pub path: PathMode,
    /// Contents mode
    pub contents: ContentsMode,
}

/// Which representation a collection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum FileCollectionKind {
    /// Files keyed by path
    PathBased {
        /// Order mode
        order: OrderMode,
        /// Either [`PathMode::Absolute`] or [`PathMode::HierarchyRelative`]
        path: PathMode,
        /// Contents mode
        contents: ContentsMode,
    },
    /// Files identified by position only
    ContentOnly,
}

impl FileCollectionKind {
    /// Representation implied by a set of modes.
    #[must_use]
    pub fn for_modes(modes: CollectionModes) -> Self {
        match modes.path {
            PathMode::IgnorePath => Self::ContentOnly,
            path => Self::PathBased {
                order: modes.order,
                path,
                contents: modes.contents,
            },
        }
    }
}

/// One file of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Absolute path or hierarchy path, depending on the path mode
    pub key: String,
    /// Snapshot of the file
    pub state: FileState,
}

/// A collection's entries in serialisable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCollectionRecord {
    /// Representation
    pub kind: FileCollectionKind,
    /// Entries in traversal order
    pub entries: Vec<FileEntry>,
}

struct Source {
    tree: FileTree,
    provider: Arc<dyn FileStateProvider>,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("tree", &self.tree)
            .finish_non_exhaustive()
    }
}

/// Snapshot of one file collection.
#[derive(Debug)]
pub struct FileCollectionState {
    kind: FileCollectionKind,
    entries: OnceLock<Vec<FileEntry>>,
    source: Option<Source>,
}

impl FileCollectionState {
    /// Collection over `tree` whose entries are computed on first use.
    pub fn capture(
        tree: FileTree,
        provider: Arc<dyn FileStateProvider>,
        modes: CollectionModes,
    ) -> Self {
        Self {
            kind: FileCollectionKind::for_modes(modes),
            entries: OnceLock::new(),
            source: Some(Source { tree, provider }),
        }
    }

    /// Collection with precomputed entries.
    #[must_use]
    pub fn from_entries(kind: FileCollectionKind, entries: Vec<FileEntry>) -> Self {
        Self {
            kind,
            entries: OnceLock::from(entries),
            source: None,
        }
    }

    /// Restore a recorded collection.
    #[must_use]
    pub fn from_record(record: FileCollectionRecord) -> Self {
        Self::from_entries(record.kind, record.entries)
    }

    /// Force the entries and copy them into a record.
    pub fn to_record(&self) -> Result<FileCollectionRecord> {
        Ok(FileCollectionRecord {
            kind: self.kind,
            entries: self.entries()?.to_vec(),
        })
    }

    /// Representation of this collection
    #[must_use]
    pub fn kind(&self) -> FileCollectionKind {
        self.kind
    }

    /// Entries in traversal order, computing them on first call.
    pub fn entries(&self) -> Result<&[FileEntry]> {
        if let Some(entries) = self.entries.get() {
            return Ok(entries);
        }
        let computed = self.compute()?;
        Ok(self.entries.get_or_init(|| computed))
    }

    fn compute(&self) -> Result<Vec<FileEntry>> {
        let Some(source) = &self.source else {
            return Ok(Vec::new());
        };
        let _span = tracing::debug_span!("file_collection.compute", roots = source.tree.roots().len())
            .entered();
        let absolute_keys = matches!(
            self.kind,
            FileCollectionKind::PathBased {
                path: PathMode::Absolute,
                ..
            }
        );
        let visited = source.tree.visit()?;
        let mut entries = Vec::with_capacity(visited.len());
        for entry in visited {
            let state = source.provider.state(&entry.path)?;
            let key = if absolute_keys {
                entry.path.to_string_lossy().into_owned()
            } else {
                entry.hierarchy_path
            };
            entries.push(FileEntry { key, state });
        }
        tracing::debug!(files = entries.len(), "Captured file collection");
        Ok(entries)
    }

    fn diff_path_based(
        &self,
        previous: &Self,
        order: OrderMode,
        contents: ContentsMode,
        reporter: &mut dyn DifferenceReporter,
    ) -> Result<bool> {
        let current = self.entries()?;
        let before = previous.entries()?;
        let same = |a: &FileState, b: &FileState| match contents {
            ContentsMode::UseContents => a.content_equal(b),
            ContentsMode::IgnoreContents => a.kind_equal(b),
        };
        Ok(match order {
            OrderMode::Ordered => diff_ordered(current, before, same, reporter),
            OrderMode::Unordered => diff_unordered(current, before, same, reporter),
        })
    }

    fn diff_content_only(
        &self,
        previous: &Self,
        reporter: &mut dyn DifferenceReporter,
    ) -> Result<bool> {
        let current = self.entries()?;
        let before = previous.entries()?;
        // pairwise contents first, then the count; both may be reported
        for (index, (now, then)) in current.iter().zip(before).enumerate() {
            if !now.state.content_equal(&then.state)
                && !reporter.report(format!("contents of file #{} have changed", index + 1))
            {
                return Ok(false);
            }
        }
        if current.len() > before.len() {
            return Ok(reporter.report("there are more files in the collection".to_string()));
        }
        if current.len() < before.len() {
            return Ok(reporter.report("there are fewer files in the collection".to_string()));
        }
        Ok(true)
    }
}

fn diff_ordered(
    current: &[FileEntry],
    before: &[FileEntry],
    same: impl Fn(&FileState, &FileState) -> bool,
    reporter: &mut dyn DifferenceReporter,
) -> bool {
    let len = current.len().max(before.len());
    for index in 0..len {
        match (current.get(index), before.get(index)) {
            (Some(now), Some(then)) if now.key != then.key => {
                reporter.report(format!(
                    "file at position {} has changed from '{}' to '{}'",
                    index + 1,
                    then.key,
                    now.key
                ));
                return false;
            }
            (Some(now), Some(then)) => {
                if !same(&now.state, &then.state)
                    && !reporter.report(format!(
                        "contents of file '{}' at position {} has changed",
                        now.key,
                        index + 1
                    ))
                {
                    return false;
                }
            }
            (Some(now), None) => {
                reporter.report(format!("file '{}' has been added", now.key));
                return false;
            }
            (None, Some(then)) => {
                reporter.report(format!("file '{}' has been removed", then.key));
                return false;
            }
            (None, None) => break,
        }
    }
    true
}

fn diff_unordered(
    current: &[FileEntry],
    before: &[FileEntry],
    same: impl Fn(&FileState, &FileState) -> bool,
    reporter: &mut dyn DifferenceReporter,
) -> bool {
    let before_ids = occurrences(before);
    let current_ids = occurrences(current);
    let previous: HashMap<(&str, usize), &FileState> = before_ids
        .iter()
        .copied()
        .zip(before.iter().map(|e| &e.state))
        .collect();
    let now_keys: HashSet<(&str, usize)> = current_ids.iter().copied().collect();
    let mut changed = false;

    for (entry, id) in current.iter().zip(&current_ids) {
        if !previous.contains_key(id) {
            changed = true;
            if !reporter.report(format!("file '{}' has been added", entry.key)) {
                return false;
            }
        }
    }
    for (entry, id) in before.iter().zip(&before_ids) {
        if !now_keys.contains(id) {
            changed = true;
            if !reporter.report(format!("file '{}' has been removed", entry.key)) {
                return false;
            }
        }
    }
    for (entry, id) in current.iter().zip(&current_ids) {
        if let Some(&then) = previous.get(id)
            && !same(&entry.state, then)
        {
            changed = true;
            if !reporter.report(format!("contents of file '{}' has changed", entry.key)) {
                return false;
            }
        }
    }
    if changed {
        return true;
    }
    let moved = current
        .iter()
        .zip(before)
        .find(|(now, then)| now.key != then.key);
    match moved {
        Some((now, _)) => reporter.report(format!("position of file '{}' has changed", now.key)),
        None => true,
    }
}

/// Each key paired with the number of earlier entries sharing it.
///
/// Hierarchy-relative keys repeat when two roots hold the same relative path;
/// the n-th occurrence is matched against the n-th occurrence.
fn occurrences(entries: &[FileEntry]) -> Vec<(&str, usize)> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    entries
        .iter()
        .map(|entry| {
            let count = seen.entry(entry.key.as_str()).or_default();
            let id = (entry.key.as_str(), *count);
            *count += 1;
            id
        })
        .collect()
}

impl StateComponent for FileCollectionState {
    fn append_to_fingerprint(&self, builder: &mut FingerprintBuilder) -> Result<()> {
        let entries = self.entries()?;
        match self.kind {
            FileCollectionKind::ContentOnly => {
                builder.absorb_str("CONTENT_ONLY");
                builder.begin_collection(entries.len());
                for entry in entries {
                    entry.state.append_to_fingerprint(builder);
                }
            }
            FileCollectionKind::PathBased {
                order,
                path,
                contents,
            } => {
                builder.absorb_str("PATH_BASED");
                let mut ordered: Vec<&FileEntry> = entries.iter().collect();
                if order == OrderMode::Unordered {
                    ordered.sort_by(|a, b| a.key.cmp(&b.key));
                }
                builder.absorb_str(match order {
                    OrderMode::Ordered => "ORDERED",
                    OrderMode::Unordered => "UNORDERED",
                });
                builder.absorb_str(match contents {
                    ContentsMode::UseContents => "USE_CONTENTS",
                    ContentsMode::IgnoreContents => "IGNORE_CONTENTS",
                });
                builder.begin_collection(ordered.len());
                for entry in ordered {
                    if path == PathMode::Absolute {
                        builder.absorb_relative_path(Path::new(&entry.key))?;
                    } else {
                        builder.absorb_str(&entry.key);
                    }
                    match contents {
                        ContentsMode::UseContents => entry.state.append_to_fingerprint(builder),
                        ContentsMode::IgnoreContents => {
                            entry.state.append_kind_to_fingerprint(builder);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn diff(&self, previous: &Self, reporter: &mut dyn DifferenceReporter) -> Result<bool> {
        match (self.kind, previous.kind) {
            (FileCollectionKind::ContentOnly, FileCollectionKind::ContentOnly) => {
                self.diff_content_only(previous, reporter)
            }
            (FileCollectionKind::ContentOnly, FileCollectionKind::PathBased { .. }) => {
                Ok(reporter.report("wasn't content-only".to_string()))
            }
            (FileCollectionKind::PathBased { .. }, FileCollectionKind::ContentOnly) => {
                Ok(reporter.report("wasn't using paths".to_string()))
            }
            (
                FileCollectionKind::PathBased {
                    order,
                    path,
                    contents,
                },
                FileCollectionKind::PathBased {
                    order: before_order,
                    path: before_path,
                    contents: before_contents,
                },
            ) => {
                if order != before_order {
                    return Ok(reporter.report("order mode has changed".to_string()));
                }
                if path != before_path {
                    return Ok(reporter.report("path mode has changed".to_string()));
                }
                if contents != before_contents {
                    return Ok(reporter.report("contents mode has changed".to_string()));
                }
                self.diff_path_based(previous, order, contents, reporter)
            }
        }
    }
}

/// Named file collections, kept sorted by name.
#[derive(Debug, Default)]
pub struct FileCollectionStates {
    states: BTreeMap<String, FileCollectionState>,
}

impl FileCollectionStates {
    /// Empty set of collections
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a named collection.
    pub fn insert(&mut self, name: impl Into<String>, state: FileCollectionState) {
        self.states.insert(name.into(), state);
    }

    /// Look up a collection by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FileCollectionState> {
        self.states.get(name)
    }

    /// Collections sorted by name
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileCollectionState)> {
        self.states.iter()
    }

    /// Number of collections
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether there are no collections
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Force every collection and copy it into records.
    pub fn to_records(&self) -> Result<BTreeMap<String, FileCollectionRecord>> {
        self.states
            .iter()
            .map(|(name, state)| Ok((name.clone(), state.to_record()?)))
            .collect()
    }

    /// Restore recorded collections.
    #[must_use]
    pub fn from_records(records: BTreeMap<String, FileCollectionRecord>) -> Self {
        Self {
            states: records
                .into_iter()
                .map(|(name, record)| (name, FileCollectionState::from_record(record)))
                .collect(),
        }
    }
}

impl FromIterator<(String, FileCollectionState)> for FileCollectionStates {
    fn from_iter<T: IntoIterator<Item = (String, FileCollectionState)>>(iter: T) -> Self {
        Self {
            states: iter.into_iter().collect(),
        }
    }
}

impl StateComponent for FileCollectionStates {
    fn append_to_fingerprint(&self, builder: &mut FingerprintBuilder) -> Result<()> {
        builder.begin_map(self.states.len());
        for (name, state) in &self.states {
            builder.absorb_str(name);
            state.append_to_fingerprint(builder)?;
        }
        Ok(())
    }

    fn diff(&self, previous: &Self, reporter: &mut dyn DifferenceReporter) -> Result<bool> {
        for name in self.states.keys() {
            if !previous.states.contains_key(name)
                && !reporter.report(format!("property '{name}' has been added"))
            {
                return Ok(false);
            }
        }
        for name in previous.states.keys() {
            if !self.states.contains_key(name)
                && !reporter.report(format!("property '{name}' has been removed"))
            {
                return Ok(false);
            }
        }
        for (name, state) in &self.states {
            let Some(before) = previous.states.get(name) else {
                continue;
            };
            let mut prefixed = PrefixingReporter::new(format!("property '{name}' "), reporter);
            if !state.diff(before, &mut prefixed)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
