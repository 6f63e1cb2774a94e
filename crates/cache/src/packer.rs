//! Archiving task outputs
//!
//! Outputs are written as a zstd-compressed tar stream. A property that
//! exists gets a directory entry `<property>/` first, followed by its
//! contents:
//!
//! - a directory property contributes `<property>/<rel>/` for each
//!   subdirectory and `<property>/<rel>` for each file, sorted by name;
//! - a file property contributes a single `<property>/file` entry.
//!
//! A property that does not exist gets an empty regular entry `<property>`
//! and nothing else.
//!
//! When unpacking, either root entry clears whatever is currently at the
//! declared location. Only the directory entry recreates a directory
//! property, so a missing output stays missing after a restore.

use crate::declaration::{OutputKind, TaskDeclaration};
use crate::paths;
use crate::resolver::FileResolver;
use crate::{Error, Result};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tar::{EntryType, Header};
use walkdir::WalkDir;

/// Entry name used for the content of a single-file property.
pub const SINGLE_FILE_SEGMENT: &str = "file";

/// Default zstd level for output archives.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// One output property that can be archived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputProperty {
    /// Property name; never contains `/`
    pub name: String,
    /// Either [`OutputKind::File`] or [`OutputKind::Directory`]
    pub kind: OutputKind,
    /// Absolute declared location
    pub path: PathBuf,
}

/// Resolve the outputs of `task` into archivable properties.
///
/// Fails with a configuration error when an output declares multiple paths.
pub fn packable_outputs(
    task: &TaskDeclaration,
    resolver: &dyn FileResolver,
) -> Result<Vec<OutputProperty>> {
    task.outputs
        .entries()
        .iter()
        .map(|(name, decl)| {
            let path = decl.single_path().ok_or_else(|| {
                Error::configuration(format!(
                    "output property '{name}' declares multiple paths and cannot be cached"
                ))
            })?;
            Ok(OutputProperty {
                name: name.clone(),
                kind: decl.kind,
                path: resolver.resolve(path),
            })
        })
        .collect()
}

/// Counts reported after packing or unpacking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Directory entries, root markers included
    pub directories: usize,
    /// File entries
    pub files: usize,
    /// Uncompressed file bytes
    pub bytes: u64,
}

/// Serialises output properties into an archive and back.
pub trait OutputPacker: Send + Sync {
    /// Write every property into `sink`.
    fn pack(&self, outputs: &[OutputProperty], sink: &mut dyn Write) -> Result<ArchiveSummary>;

    /// Restore properties from `source` into their declared locations.
    fn unpack(&self, outputs: &[OutputProperty], source: &mut dyn Read) -> Result<ArchiveSummary>;
}

/// Tar + zstd packer rooted at the cache root.
#[derive(Debug, Clone)]
pub struct TarZstOutputPacker {
    root: PathBuf,
    compression_level: i32,
}

impl TarZstOutputPacker {
    /// Packer that only accepts outputs under `root`.
    pub fn new(root: impl Into<PathBuf>, compression_level: i32) -> Self {
        Self {
            root: paths::normalize(&root.into()),
            compression_level,
        }
    }

    fn check_roots(&self, outputs: &[OutputProperty]) -> Result<()> {
        for output in outputs {
            paths::relative_to_root(&output.path, &self.root)?;
            if output.kind == OutputKind::Files {
                return Err(Error::configuration(format!(
                    "output property '{}' declares multiple paths and cannot be cached",
                    output.name
                )));
            }
        }
        Ok(())
    }
}

impl OutputPacker for TarZstOutputPacker {
    fn pack(&self, outputs: &[OutputProperty], sink: &mut dyn Write) -> Result<ArchiveSummary> {
        self.check_roots(outputs)?;
        let _span = tracing::debug_span!("outputs.pack", properties = outputs.len()).entered();

        let mut sorted: Vec<&OutputProperty> = outputs.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        let encoder = zstd::Encoder::new(sink, self.compression_level)
            .map_err(|e| Error::io_no_path(e, "create zstd encoder"))?;
        let mut builder = tar::Builder::new(encoder);
        let mut summary = ArchiveSummary::default();

        for output in sorted {
            if !output_exists(output)? {
                append_missing(&mut builder, &output.name)?;
                continue;
            }
            append_dir(&mut builder, &format!("{}/", output.name))?;
            summary.directories += 1;
            match output.kind {
                OutputKind::File => append_file(
                    &mut builder,
                    &format!("{}/{SINGLE_FILE_SEGMENT}", output.name),
                    &output.path,
                    &mut summary,
                )?,
                OutputKind::Directory => pack_dir(&mut builder, output, &mut summary)?,
                OutputKind::Files => {}
            }
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| Error::io_no_path(e, "finish tar archive"))?;
        encoder
            .finish()
            .map_err(|e| Error::io_no_path(e, "finish zstd stream"))?;
        tracing::debug!(
            files = summary.files,
            directories = summary.directories,
            bytes = summary.bytes,
            "Packed task outputs"
        );
        Ok(summary)
    }

    fn unpack(&self, outputs: &[OutputProperty], source: &mut dyn Read) -> Result<ArchiveSummary> {
        self.check_roots(outputs)?;
        let _span = tracing::debug_span!("outputs.unpack", properties = outputs.len()).entered();

        let decoder = zstd::Decoder::new(source)
            .map_err(|e| Error::archive(format!("cannot start zstd stream: {e}")))?;
        let mut archive = tar::Archive::new(decoder);
        let mut summary = ArchiveSummary::default();

        let entries = archive
            .entries()
            .map_err(|e| Error::archive(format!("cannot read entries: {e}")))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| Error::archive(format!("cannot read entry: {e}")))?;
            let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let name = raw.trim_end_matches('/');
            let (property, rel) = match name.split_once('/') {
                Some((property, rel)) => (property, rel),
                None => (name, ""),
            };
            if property.is_empty() {
                return Err(Error::archive(format!("entry '{raw}' has no property name")));
            }
            let rel = paths::validate_relative(rel)?;
            let Some(output) = outputs.iter().find(|o| o.name == property) else {
                tracing::debug!(property, entry = %raw, "Skipping entry for undeclared output property");
                continue;
            };

            let entry_type = entry.header().entry_type();
            match (entry_type, output.kind, rel.is_empty()) {
                (EntryType::Directory, _, true) => {
                    reset_property(output, true)?;
                    summary.directories += 1;
                }
                (EntryType::Regular | EntryType::Continuous, _, true) => {
                    reset_property(output, false)?;
                }
                (EntryType::Directory, OutputKind::Directory, false) => {
                    let dir = output.path.join(rel);
                    fs::create_dir_all(&dir).map_err(|e| Error::io(e, &dir, "create_dir_all"))?;
                    summary.directories += 1;
                }
                (EntryType::Regular | EntryType::Continuous, OutputKind::Directory, false) => {
                    let target = output.path.join(rel);
                    summary.bytes += write_entry(&mut entry, &target)?;
                    summary.files += 1;
                }
                (EntryType::Regular | EntryType::Continuous, OutputKind::File, false)
                    if rel == SINGLE_FILE_SEGMENT =>
                {
                    summary.bytes += write_entry(&mut entry, &output.path)?;
                    summary.files += 1;
                }
                _ => {
                    return Err(Error::archive(format!(
                        "unexpected {entry_type:?} entry '{raw}' for output property '{}'",
                        output.name
                    )));
                }
            }
        }
        tracing::debug!(
            files = summary.files,
            directories = summary.directories,
            bytes = summary.bytes,
            "Unpacked task outputs"
        );
        Ok(summary)
    }
}

fn new_header(entry_type: EntryType, size: u64, mode: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(0);
    header
}

fn append_dir<W: Write>(builder: &mut tar::Builder<W>, name: &str) -> Result<()> {
    let mut header = new_header(EntryType::Directory, 0, 0o755);
    builder
        .append_data(&mut header, name, io::empty())
        .map_err(|e| Error::io_no_path(e, format!("append directory entry {name}")))
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    path: &Path,
    summary: &mut ArchiveSummary,
) -> Result<()> {
    let file = fs::File::open(path).map_err(|e| Error::io(e, path, "open"))?;
    let meta = file.metadata().map_err(|e| Error::io(e, path, "stat"))?;
    let mut header = new_header(EntryType::Regular, meta.len(), file_mode(&meta));
    builder
        .append_data(&mut header, name, file)
        .map_err(|e| Error::io(e, path, "append to archive"))?;
    summary.files += 1;
    summary.bytes += meta.len();
    Ok(())
}

/// Empty regular entry recording that a property had nothing on disk.
fn append_missing<W: Write>(builder: &mut tar::Builder<W>, name: &str) -> Result<()> {
    let mut header = new_header(EntryType::Regular, 0, 0o644);
    builder
        .append_data(&mut header, name, io::empty())
        .map_err(|e| Error::io_no_path(e, format!("append missing entry {name}")))
}

/// Whether the declared location exists with the kind the property declares.
fn output_exists(output: &OutputProperty) -> Result<bool> {
    let meta = match fs::metadata(&output.path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::io(e, &output.path, "stat")),
    };
    match (output.kind, meta.is_dir()) {
        (OutputKind::File, true) => Err(Error::configuration(format!(
            "output file property '{}' points at directory {}",
            output.name,
            output.path.display()
        ))),
        (OutputKind::Directory, false) => Err(Error::configuration(format!(
            "output directory property '{}' points at file {}",
            output.name,
            output.path.display()
        ))),
        _ => Ok(true),
    }
}

fn pack_dir<W: Write>(
    builder: &mut tar::Builder<W>,
    output: &OutputProperty,
    summary: &mut ArchiveSummary,
) -> Result<()> {
    for entry in WalkDir::new(&output.path)
        .min_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .map_or_else(|| output.path.clone(), Path::to_path_buf);
            Error::io(io::Error::from(e), path, "walk")
        })?;
        let rel = entry.path().strip_prefix(&output.path).map_err(|_| {
            Error::configuration(format!(
                "path {} is not under {}",
                entry.path().display(),
                output.path.display()
            ))
        })?;
        let rel = paths::to_slash(rel);
        if entry.file_type().is_dir() {
            append_dir(builder, &format!("{}/{rel}/", output.name))?;
            summary.directories += 1;
        } else {
            append_file(
                builder,
                &format!("{}/{rel}", output.name),
                entry.path(),
                summary,
            )?;
        }
    }
    Ok(())
}

/// Clear the declared location of a property before its entries are written.
///
/// A directory property is recreated only when `existed` is set.
fn reset_property(output: &OutputProperty, existed: bool) -> Result<()> {
    let path = &output.path;
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(path).map_err(|e| Error::io(e, path, "remove_dir_all"))?;
        }
        Ok(_) => fs::remove_file(path).map_err(|e| Error::io(e, path, "remove_file"))?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::io(e, path, "stat")),
    }
    if existed && output.kind == OutputKind::Directory {
        fs::create_dir_all(path).map_err(|e| Error::io(e, path, "create_dir_all"))?;
    }
    Ok(())
}

/// Stream one entry into a temp file next to `target`, then move it into place.
fn write_entry<R: Read>(entry: &mut tar::Entry<'_, R>, target: &Path) -> Result<u64> {
    let parent = target
        .parent()
        .ok_or_else(|| Error::archive(format!("no parent directory for {}", target.display())))?;
    fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
    let mut staged =
        tempfile::NamedTempFile::new_in(parent).map_err(|e| Error::io(e, parent, "create temp"))?;
    let written = io::copy(entry, &mut staged)
        .map_err(|e| Error::archive(format!("truncated entry for {}: {e}", target.display())))?;
    let mode = entry
        .header()
        .mode()
        .map_err(|e| Error::archive(format!("bad mode for {}: {e}", target.display())))?;
    set_mode(staged.as_file(), mode, target)?;
    staged
        .persist(target)
        .map_err(|e| Error::io(e.error, target, "persist"))?;
    Ok(written)
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn set_mode(file: &fs::File, mode: u32, target: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| Error::io(e, target, "set permissions"))
}

#[cfg(not(unix))]
fn set_mode(_file: &fs::File, _mode: u32, _target: &Path) -> Result<()> {
    Ok(())
}
