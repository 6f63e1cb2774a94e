//! What a task declares about its inputs and outputs
//!
//! Declarations are validated as they are made: clashing property names and
//! contradictory input modes are configuration errors reported to the caller
//! straight away rather than when the cache key is computed.

use crate::file_state::ContentHash;
use crate::fingerprint::Value;
use crate::resolver::FileResolver;
use crate::state::{CollectionModes, ContentsMode, OrderMode, PathMode};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Modes of one input file property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputModes {
    /// Whether traversal order matters
    pub order: OrderMode,
    /// How file locations are recorded
    pub path: PathMode,
    /// Whether contents are recorded
    pub contents: ContentsMode,
    /// Skip the task when every input flagged like this is empty
    pub skip_when_empty: bool,
}

impl InputModes {
    /// Modes used for the file collection snapshot
    #[must_use]
    pub fn collection_modes(&self) -> CollectionModes {
        CollectionModes {
            order: self.order,
            path: self.path,
            contents: self.contents,
        }
    }

    fn validate(&self, property: &str) -> Result<()> {
        if self.path == PathMode::IgnorePath {
            if self.order == OrderMode::Ordered {
                return Err(Error::InvalidModes {
                    property: property.to_string(),
                    reason: "cannot ignore file paths and be ordered at the same time",
                });
            }
            if self.contents == ContentsMode::IgnoreContents {
                return Err(Error::InvalidModes {
                    property: property.to_string(),
                    reason: "cannot ignore both file paths and contents at the same time",
                });
            }
        }
        Ok(())
    }
}

/// A named set of input paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFiles {
    /// Declared paths, relative to the project or absolute
    pub paths: Vec<PathBuf>,
    /// How the files are snapshotted
    pub modes: InputModes,
}

/// Inputs of a task: scalar properties and file properties.
#[derive(Debug, Clone, Default)]
pub struct TaskInputs {
    properties: BTreeMap<String, Value>,
    files: BTreeMap<String, InputFiles>,
    unnamed: usize,
}

impl TaskInputs {
    /// Empty inputs
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a scalar property.
    pub fn property(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Result<&mut Self> {
        let name = checked_name(name.into())?;
        if self.properties.contains_key(&name) {
            return Err(Error::DuplicateProperty {
                namespace: "input",
                property: name,
            });
        }
        self.properties.insert(name, value.into());
        Ok(self)
    }

    /// Declare a named file property.
    pub fn files<I, P>(&mut self, name: impl Into<String>, paths: I, modes: InputModes) -> Result<&mut Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let name = checked_name(name.into())?;
        if self.files.contains_key(&name) {
            return Err(Error::DuplicateProperty {
                namespace: "input file",
                property: name,
            });
        }
        modes.validate(&name)?;
        self.files.insert(
            name,
            InputFiles {
                paths: paths.into_iter().map(Into::into).collect(),
                modes,
            },
        );
        Ok(self)
    }

    /// Declare a file property named `$1`, `$2`, ... in declaration order.
    ///
    /// Returns the generated name.
    pub fn unnamed_files<I, P>(&mut self, paths: I, modes: InputModes) -> Result<String>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let name = format!("${}", self.unnamed + 1);
        self.files(name.clone(), paths, modes)?;
        self.unnamed += 1;
        Ok(name)
    }

    /// Scalar properties, sorted by name
    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    /// File properties, sorted by name
    #[must_use]
    pub fn file_properties(&self) -> &BTreeMap<String, InputFiles> {
        &self.files
    }
}

/// Shape of an output property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Exactly one file
    File,
    /// Exactly one directory tree
    Directory,
    /// Any number of paths; cannot be archived
    Files,
}

/// One declared output property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDeclaration {
    /// Shape of the property
    pub kind: OutputKind,
    /// Declared paths; exactly one unless the kind is [`OutputKind::Files`]
    pub paths: Vec<PathBuf>,
}

impl OutputDeclaration {
    /// The single declared path, if this property has one
    #[must_use]
    pub fn single_path(&self) -> Option<&PathBuf> {
        match self.kind {
            OutputKind::File | OutputKind::Directory => self.paths.first(),
            OutputKind::Files => None,
        }
    }
}

/// Outputs of a task.
#[derive(Debug, Clone, Default)]
pub struct TaskOutputs {
    entries: BTreeMap<String, OutputDeclaration>,
}

impl TaskOutputs {
    /// No outputs
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an output file.
    pub fn file(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Result<&mut Self> {
        self.single(name.into(), OutputKind::File, path.into())
    }

    /// Declare an output directory.
    pub fn dir(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Result<&mut Self> {
        self.single(name.into(), OutputKind::Directory, path.into())
    }

    /// Declare (or extend) a multi-path output property.
    pub fn files<I, P>(&mut self, name: impl Into<String>, paths: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let name = checked_name(name.into())?;
        let paths = paths.into_iter().map(Into::into);
        match self.entries.get_mut(&name) {
            Some(existing) if existing.kind == OutputKind::Files => existing.paths.extend(paths),
            Some(_) => {
                return Err(Error::DuplicateProperty {
                    namespace: "output",
                    property: name,
                });
            }
            None => {
                self.entries.insert(
                    name,
                    OutputDeclaration {
                        kind: OutputKind::Files,
                        paths: paths.collect(),
                    },
                );
            }
        }
        Ok(self)
    }

    fn single(&mut self, name: String, kind: OutputKind, path: PathBuf) -> Result<&mut Self> {
        let name = checked_name(name)?;
        if self.entries.contains_key(&name) {
            return Err(Error::DuplicateProperty {
                namespace: "output",
                property: name,
            });
        }
        self.entries.insert(
            name,
            OutputDeclaration {
                kind,
                paths: vec![path],
            },
        );
        Ok(self)
    }

    /// Declared outputs, sorted by name
    #[must_use]
    pub fn entries(&self) -> &BTreeMap<String, OutputDeclaration> {
        &self.entries
    }

    /// Whether nothing was declared
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Name of the first multi-path property, which prevents archiving.
    #[must_use]
    pub fn first_multi_path(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, decl)| decl.kind == OutputKind::Files)
            .map(|(name, _)| name.as_str())
    }
}

/// Everything the cache needs to know about one task.
#[derive(Debug, Clone)]
pub struct TaskDeclaration {
    /// Unique path of the task, e.g. `:app:compile`
    pub path: String,
    /// Hash identifying the task's implementation
    pub implementation_hash: ContentHash,
    /// Declared inputs
    pub inputs: TaskInputs,
    /// Declared outputs
    pub outputs: TaskOutputs,
    /// Whether the task allows its outputs to be cached
    pub cache_enabled: bool,
}

impl TaskDeclaration {
    /// A cacheable task with no inputs or outputs yet
    pub fn new(path: impl Into<String>, implementation_hash: ContentHash) -> Self {
        Self {
            path: path.into(),
            implementation_hash,
            inputs: TaskInputs::new(),
            outputs: TaskOutputs::new(),
            cache_enabled: true,
        }
    }

    /// Scalar input properties
    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, Value> {
        self.inputs.properties()
    }

    /// True when some input is flagged skip-when-empty and every such input
    /// resolves to no files.
    pub fn should_skip_because_empty(&self, resolver: &dyn FileResolver) -> Result<bool> {
        let mut flagged = false;
        for files in self.inputs.files.values() {
            if !files.modes.skip_when_empty {
                continue;
            }
            flagged = true;
            if resolver.tree(&files.paths).has_files()? {
                return Ok(false);
            }
        }
        Ok(flagged)
    }
}

fn checked_name(name: String) -> Result<String> {
    if name.is_empty() {
        return Err(Error::configuration("property names must not be empty"));
    }
    if name.contains('/') {
        return Err(Error::configuration(format!(
            "property name '{name}' must not contain '/'"
        )));
    }
    Ok(name)
}
