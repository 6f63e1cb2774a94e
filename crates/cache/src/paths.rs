//! Lexical path helpers shared by fingerprinting and archiving.
//!
//! Nothing here touches the filesystem: roots and paths are compared after
//! normalising `.` and `..` components so that a cache key never depends on
//! symlink layout or the current working directory.

use crate::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Normalise `.` and `..` components without consulting the filesystem.
///
/// Leading `..` components of a relative path are kept, and `..` never
/// climbs above a root or prefix component.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `path` against `root` when it is relative.
#[must_use]
pub fn absolutize(path: &Path, root: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&root.join(path))
    }
}

/// Express `path` relative to `root` as a `/`-separated string.
///
/// The root itself maps to the empty string. Fails with
/// [`Error::PathOutsideRoot`] when the normalised path does not live under
/// the normalised root.
pub fn relative_to_root(path: &Path, root: &Path) -> Result<String> {
    let root = normalize(root);
    let absolute = absolutize(path, &root);
    let rel = absolute
        .strip_prefix(&root)
        .map_err(|_| Error::path_outside_root(&absolute, &root))?;
    Ok(to_slash(rel))
}

/// Join the normal components of a relative path with `/`.
#[must_use]
pub fn to_slash(rel: &Path) -> String {
    let mut out = String::new();
    for comp in rel.components() {
        if let Component::Normal(part) = comp {
            if !out.is_empty() {
                out.push('/');
            }
            out.push_str(&part.to_string_lossy());
        }
    }
    out
}

/// Check that a `/`-separated relative path read from an archive cannot
/// escape the directory it is unpacked into.
pub fn validate_relative(rel: &str) -> Result<&str> {
    if rel.starts_with('/') || rel.contains('\\') {
        return Err(Error::archive(format!("entry path '{rel}' is not relative")));
    }
    if rel
        .split('/')
        .any(|segment| segment == ".." || segment == ".")
    {
        return Err(Error::archive(format!(
            "entry path '{rel}' contains a relative segment"
        )));
    }
    Ok(rel)
}
