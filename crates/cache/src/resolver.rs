//! Turning declared paths into concrete file trees

use crate::paths;
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// What a visited tree entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file (or anything that is not a directory)
    File,
    /// Directory
    Directory,
    /// Declared root that does not exist
    Missing,
}

/// One entry produced by [`FileTree::visit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Absolute location on disk
    pub path: PathBuf,
    /// Path relative to the declared root it was found under, `/`-separated
    pub hierarchy_path: String,
    /// Kind observed while walking
    pub kind: EntryKind,
}

/// An ordered set of declared roots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTree {
    roots: Vec<PathBuf>,
}

impl FileTree {
    /// Tree over absolute roots, visited in the given order.
    #[must_use]
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Declared roots
    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Walk every root in declaration order.
    ///
    /// A missing root yields one [`EntryKind::Missing`] entry and a file root
    /// yields itself under its file name. A directory root yields each of its
    /// descendants, sorted by name, relative to the root.
    pub fn visit(&self) -> Result<Vec<TreeEntry>> {
        let _span = tracing::trace_span!("file_tree.visit", roots = self.roots.len()).entered();
        let mut entries = Vec::new();
        for root in &self.roots {
            let name = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let meta = match std::fs::metadata(root) {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    entries.push(TreeEntry {
                        path: root.clone(),
                        hierarchy_path: name,
                        kind: EntryKind::Missing,
                    });
                    continue;
                }
                Err(e) => return Err(Error::io(e, root, "stat")),
            };
            if !meta.is_dir() {
                entries.push(TreeEntry {
                    path: root.clone(),
                    hierarchy_path: name,
                    kind: EntryKind::File,
                });
                continue;
            }
            for entry in WalkDir::new(root)
                .min_depth(1)
                .follow_links(true)
                .sort_by_file_name()
            {
                let entry = entry.map_err(|e| {
                    let path = e.path().map_or_else(|| root.clone(), Path::to_path_buf);
                    Error::io(std::io::Error::from(e), path, "walk")
                })?;
                let rel = entry.path().strip_prefix(root).map_err(|_| {
                    Error::configuration(format!(
                        "path {} is not under {}",
                        entry.path().display(),
                        root.display()
                    ))
                })?;
                entries.push(TreeEntry {
                    path: entry.path().to_path_buf(),
                    hierarchy_path: paths::to_slash(rel),
                    kind: if entry.file_type().is_dir() {
                        EntryKind::Directory
                    } else {
                        EntryKind::File
                    },
                });
            }
        }
        Ok(entries)
    }

    /// Whether the tree contains at least one regular file.
    pub fn has_files(&self) -> Result<bool> {
        Ok(self
            .visit()?
            .iter()
            .any(|entry| entry.kind == EntryKind::File))
    }
}

/// Resolves declared paths for a task.
pub trait FileResolver: Send + Sync {
    /// Resolve one declared path to an absolute location.
    fn resolve(&self, path: &Path) -> PathBuf;

    /// Build the tree for a set of declared paths.
    fn tree(&self, paths: &[PathBuf]) -> FileTree {
        FileTree::new(paths.iter().map(|p| self.resolve(p)).collect())
    }
}

/// Resolves relative paths against a project directory.
#[derive(Debug, Clone)]
pub struct ProjectFileResolver {
    project_dir: PathBuf,
}

impl ProjectFileResolver {
    /// Resolver rooted at `project_dir`
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: paths::normalize(&project_dir.into()),
        }
    }

    /// The project directory
    #[must_use]
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }
}

impl FileResolver for ProjectFileResolver {
    fn resolve(&self, path: &Path) -> PathBuf {
        paths::absolutize(path, &self.project_dir)
    }
}
