//! Everything the cache knows about a task at one point in time

use crate::declaration::{OutputKind, TaskDeclaration};
use crate::file_state::FileStateProvider;
use crate::fingerprint::{CacheKey, FingerprintBuilder};
use crate::paths;
use crate::resolver::FileResolver;
use crate::state::{
    ClasspathState, CollectionModes, DifferenceReporter, FileCollectionRecord,
    FileCollectionState, FileCollectionStates, PrefixingReporter, PropertiesState,
    StateComponent,
};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An output declaration with its paths made relative to the cache root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredOutput {
    /// Shape of the property
    pub kind: OutputKind,
    /// Root-relative `/`-separated paths
    pub paths: Vec<String>,
}

/// Snapshot of a task: implementation, properties, input and output files.
///
/// Output file contents are tracked for change reporting only. The cache key
/// covers the output declarations, never what the outputs currently contain.
#[derive(Debug)]
pub struct TaskState {
    root: PathBuf,
    format_version: String,
    classpath: ClasspathState,
    properties: PropertiesState,
    inputs: FileCollectionStates,
    outputs: FileCollectionStates,
    declared_outputs: BTreeMap<String, DeclaredOutput>,
}

/// Serialisable form of a [`TaskState`] with every collection computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStateRecord {
    /// Cache root the state was captured against
    pub root: PathBuf,
    /// Format version used for the cache key
    pub format_version: String,
    /// Implementation state
    pub classpath: ClasspathState,
    /// Scalar property digests
    pub properties: PropertiesState,
    /// Input file collections
    pub inputs: BTreeMap<String, FileCollectionRecord>,
    /// Output file collections
    pub outputs: BTreeMap<String, FileCollectionRecord>,
    /// Output declarations
    pub declared_outputs: BTreeMap<String, DeclaredOutput>,
}

impl TaskState {
    /// Compute the cache key.
    ///
    /// Absorbs, in order: the format version, the implementation, the
    /// properties, the input collections and the output declarations, each
    /// sorted by property name.
    pub fn cache_key(&self) -> Result<CacheKey> {
        let _span = tracing::debug_span!("task_state.cache_key").entered();
        let mut builder = FingerprintBuilder::new(&self.root, &self.format_version);
        self.classpath.append_to_fingerprint(&mut builder)?;
        self.properties.append_to_fingerprint(&mut builder)?;
        self.inputs.append_to_fingerprint(&mut builder)?;
        builder.begin_map(self.declared_outputs.len());
        for (name, output) in &self.declared_outputs {
            builder.absorb_str(name);
            builder.absorb_str(match output.kind {
                OutputKind::File => "file",
                OutputKind::Directory => "dir",
                OutputKind::Files => "files",
            });
            builder.begin_collection(output.paths.len());
            for path in &output.paths {
                builder.absorb_str(path);
            }
        }
        Ok(builder.finish())
    }

    /// Report differences against an earlier state.
    ///
    /// Categories are compared in the order classpath, properties, inputs,
    /// outputs; later categories are skipped once one reports anything.
    pub fn diff(&self, previous: &Self, reporter: &mut dyn DifferenceReporter) -> Result<()> {
        {
            let mut classpath = PrefixingReporter::new("classpath ", &mut *reporter);
            self.classpath.diff(&previous.classpath, &mut classpath)?;
            if classpath.reported() > 0 {
                return Ok(());
            }
        }
        {
            let mut properties = PrefixingReporter::new("", &mut *reporter);
            self.properties.diff(&previous.properties, &mut properties)?;
            if properties.reported() > 0 {
                return Ok(());
            }
        }
        {
            let mut inputs = PrefixingReporter::new("input ", &mut *reporter);
            self.inputs.diff(&previous.inputs, &mut inputs)?;
            if inputs.reported() > 0 {
                return Ok(());
            }
        }
        let mut outputs = PrefixingReporter::new("output ", reporter);
        self.outputs.diff(&previous.outputs, &mut outputs)?;
        Ok(())
    }

    /// Replace the output collections, e.g. with a snapshot taken after the
    /// task ran.
    #[must_use]
    pub fn with_outputs(mut self, outputs: FileCollectionStates) -> Self {
        self.outputs = outputs;
        self
    }

    /// Cache root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Input file collections
    #[must_use]
    pub fn inputs(&self) -> &FileCollectionStates {
        &self.inputs
    }

    /// Output file collections
    #[must_use]
    pub fn outputs(&self) -> &FileCollectionStates {
        &self.outputs
    }

    /// Output declarations relative to the root
    #[must_use]
    pub fn declared_outputs(&self) -> &BTreeMap<String, DeclaredOutput> {
        &self.declared_outputs
    }

    /// Compute every collection and copy the state into a record.
    pub fn to_record(&self) -> Result<TaskStateRecord> {
        Ok(TaskStateRecord {
            root: self.root.clone(),
            format_version: self.format_version.clone(),
            classpath: self.classpath,
            properties: self.properties.clone(),
            inputs: self.inputs.to_records()?,
            outputs: self.outputs.to_records()?,
            declared_outputs: self.declared_outputs.clone(),
        })
    }

    /// Rebuild a state from a record.
    #[must_use]
    pub fn from_record(record: TaskStateRecord) -> Self {
        Self {
            root: record.root,
            format_version: record.format_version,
            classpath: record.classpath,
            properties: record.properties,
            inputs: FileCollectionStates::from_records(record.inputs),
            outputs: FileCollectionStates::from_records(record.outputs),
            declared_outputs: record.declared_outputs,
        }
    }
}

/// Captures [`TaskState`]s for declared tasks.
pub struct TaskStateProvider {
    root: PathBuf,
    format_version: String,
    resolver: Arc<dyn FileResolver>,
    file_states: Arc<dyn FileStateProvider>,
}

impl std::fmt::Debug for TaskStateProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStateProvider")
            .field("root", &self.root)
            .field("format_version", &self.format_version)
            .finish_non_exhaustive()
    }
}

impl TaskStateProvider {
    /// Provider for tasks under `root`.
    pub fn new(
        root: impl Into<PathBuf>,
        format_version: impl Into<String>,
        resolver: Arc<dyn FileResolver>,
        file_states: Arc<dyn FileStateProvider>,
    ) -> Self {
        Self {
            root: paths::normalize(&root.into()),
            format_version: format_version.into(),
            resolver,
            file_states,
        }
    }

    /// Cache root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The resolver used for declared paths
    #[must_use]
    pub fn resolver(&self) -> &Arc<dyn FileResolver> {
        &self.resolver
    }

    /// The provider used for input and output file states
    #[must_use]
    pub fn file_states(&self) -> &Arc<dyn FileStateProvider> {
        &self.file_states
    }

    /// Capture the current state of `task`.
    ///
    /// Properties are evaluated and output paths checked against the root
    /// immediately; file collections are computed on first use.
    pub fn capture(&self, task: &TaskDeclaration) -> Result<TaskState> {
        let _span = tracing::debug_span!("task_state.capture", task = %task.path).entered();
        let properties = PropertiesState::capture(task.properties(), &self.root)?;

        let mut inputs = FileCollectionStates::new();
        for (name, files) in task.inputs.file_properties() {
            inputs.insert(
                name.clone(),
                FileCollectionState::capture(
                    self.resolver.tree(&files.paths),
                    Arc::clone(&self.file_states),
                    files.modes.collection_modes(),
                ),
            );
        }

        let mut declared_outputs = BTreeMap::new();
        for (name, output) in task.outputs.entries() {
            let paths = output
                .paths
                .iter()
                .map(|p| paths::relative_to_root(&self.resolver.resolve(p), &self.root))
                .collect::<Result<Vec<_>>>()?;
            declared_outputs.insert(
                name.clone(),
                DeclaredOutput {
                    kind: output.kind,
                    paths,
                },
            );
        }

        Ok(TaskState {
            root: self.root.clone(),
            format_version: self.format_version.clone(),
            classpath: ClasspathState::new(task.implementation_hash),
            properties,
            inputs,
            outputs: self.capture_outputs(task, Arc::clone(&self.file_states)),
            declared_outputs,
        })
    }

    /// Snapshot the outputs of `task` through `file_states`.
    ///
    /// Pass a fresh provider after the task has run so that states memoised
    /// before execution are not reused.
    pub fn capture_outputs(
        &self,
        task: &TaskDeclaration,
        file_states: Arc<dyn FileStateProvider>,
    ) -> FileCollectionStates {
        task.outputs
            .entries()
            .iter()
            .map(|(name, output)| {
                (
                    name.clone(),
                    FileCollectionState::capture(
                        self.resolver.tree(&output.paths),
                        Arc::clone(&file_states),
                        CollectionModes::default(),
                    ),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::InputModes;
    use crate::file_state::{CachingFileStateProvider, ContentHash};
    use crate::fingerprint::{FORMAT_VERSION, Value};
    use crate::resolver::ProjectFileResolver;
    use crate::state::BoundedReporter;
    use crate::Error;
    use tempfile::TempDir;

    fn provider(root: &Path) -> TaskStateProvider {
        TaskStateProvider::new(
            root,
            FORMAT_VERSION,
            Arc::new(ProjectFileResolver::new(root)),
            Arc::new(CachingFileStateProvider::new()),
        )
    }

    fn task(implementation: &str) -> TaskDeclaration {
        let mut task = TaskDeclaration::new(":compile", ContentHash::of_bytes(implementation.as_bytes()));
        task.inputs.property("opt", "O2").unwrap();
        task.inputs
            .files("sources", ["src"], InputModes::default())
            .unwrap();
        task.outputs.dir("classes", "build/classes").unwrap();
        task
    }

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.c"), "a").unwrap();
        dir
    }

    #[test]
    fn key_is_stable_and_ignores_output_contents() {
        let dir = project();
        let first = provider(dir.path()).capture(&task("v1")).unwrap().cache_key().unwrap();

        std::fs::create_dir_all(dir.path().join("build/classes")).unwrap();
        std::fs::write(dir.path().join("build/classes/a.o"), "obj").unwrap();
        let second = provider(dir.path()).capture(&task("v1")).unwrap().cache_key().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn key_tracks_inputs_and_implementation() {
        let dir = project();
        let base = provider(dir.path()).capture(&task("v1")).unwrap().cache_key().unwrap();

        let other_impl = provider(dir.path()).capture(&task("v2")).unwrap().cache_key().unwrap();
        assert_ne!(base, other_impl);

        std::fs::write(dir.path().join("src/a.c"), "changed").unwrap();
        let edited = provider(dir.path()).capture(&task("v1")).unwrap().cache_key().unwrap();
        assert_ne!(base, edited);
    }

    #[test]
    fn declaration_order_does_not_matter() {
        let dir = project();
        let hash = ContentHash::of_bytes(b"impl");
        let mut a = TaskDeclaration::new(":t", hash);
        a.inputs.property("x", 1).unwrap().property("y", 2).unwrap();
        a.outputs.file("one", "out/1").unwrap().file("two", "out/2").unwrap();
        let mut b = TaskDeclaration::new(":t", hash);
        b.inputs.property("y", 2).unwrap().property("x", 1).unwrap();
        b.outputs.file("two", "out/2").unwrap().file("one", "out/1").unwrap();

        let p = provider(dir.path());
        assert_eq!(
            p.capture(&a).unwrap().cache_key().unwrap(),
            p.capture(&b).unwrap().cache_key().unwrap()
        );
    }

    #[test]
    fn output_outside_root_fails_capture() {
        let dir = project();
        let mut t = task("v1");
        t.outputs.file("escape", "../elsewhere/out.txt").unwrap();
        let err = provider(dir.path()).capture(&t).unwrap_err();
        assert!(matches!(err, Error::PathOutsideRoot { .. }));
    }

    #[test]
    fn classpath_difference_hides_later_categories() {
        let dir = project();
        let p = provider(dir.path());
        let previous = p.capture(&task("v1")).unwrap();

        let mut current_task = task("v2");
        current_task.inputs.property("extra", Value::Bool(true)).unwrap();
        let current = p.capture(&current_task).unwrap();

        let mut reporter = BoundedReporter::unbounded();
        current.diff(&previous, &mut reporter).unwrap();
        assert_eq!(reporter.differences(), ["classpath has changed"]);
    }

    #[test]
    fn input_differences_are_prefixed() {
        let dir = project();
        let previous = provider(dir.path()).capture(&task("v1")).unwrap();
        std::fs::write(dir.path().join("src/b.c"), "b").unwrap();
        let current = provider(dir.path()).capture(&task("v1")).unwrap();

        let mut reporter = BoundedReporter::unbounded();
        current.diff(&previous, &mut reporter).unwrap();
        let added = dir.path().join("src/b.c");
        assert_eq!(
            reporter.differences(),
            [format!(
                "input property 'sources' file '{}' has been added",
                added.display()
            )]
        );
    }

    #[test]
    fn record_round_trip_preserves_key_and_diff() {
        let dir = project();
        let state = provider(dir.path()).capture(&task("v1")).unwrap();
        let record = state.to_record().unwrap();
        let json = serde_json::to_string(&record).unwrap();
        let restored = TaskState::from_record(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.cache_key().unwrap(), state.cache_key().unwrap());
        let mut reporter = BoundedReporter::unbounded();
        state.diff(&restored, &mut reporter).unwrap();
        assert!(reporter.is_empty());
    }
}
