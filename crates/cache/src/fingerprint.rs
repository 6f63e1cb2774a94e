//! Canonical fingerprinting of task inputs
//!
//! A [`FingerprintBuilder`] absorbs a typed stream of values into a SHA-256
//! digest. Every primitive is written with a one-byte tag and a fixed-width or
//! length-prefixed payload, so two different value sequences cannot produce
//! the same byte stream. Text is encoded as UTF-16 big-endian code units,
//! making digests identical across platforms.
//!
//! The builder is consumed by [`FingerprintBuilder::finish`], so it cannot be
//! reused once a [`CacheKey`] has been produced.

use crate::paths;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Version token absorbed first by every builder.
///
/// Bump it whenever the byte encoding below or the archive layout changes so
/// that entries written by older builds are never read back.
pub const FORMAT_VERSION: &str = "buildstash-cache/1";

/// Maximum nesting of collections, maps and lazy values.
pub const MAX_DEPTH: usize = 256;

const NULL_MARKER: u64 = 3_260_143_849_197_285_584;
const COLLECTION_MARKER: u64 = 8_625_366_162_395_921_885;
const MAP_MARKER: u64 = 4_507_968_025_271_448_341;

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_I8: u8 = 0x02;
const TAG_I16: u8 = 0x03;
const TAG_I32: u8 = 0x04;
const TAG_I64: u8 = 0x05;
const TAG_F32: u8 = 0x06;
const TAG_F64: u8 = 0x07;
const TAG_BYTES: u8 = 0x08;
const TAG_STRING: u8 = 0x09;
const TAG_COLLECTION: u8 = 0x0a;
const TAG_MAP: u8 = 0x0b;
const TAG_FILE: u8 = 0x0c;
const TAG_STREAM: u8 = 0x0d;

const STREAM_CHUNK: usize = 64 * 1024;

/// A finished fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Raw digest bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; 32]> for CacheKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}

impl FromStr for CacheKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| Error::serialization(format!("Invalid cache key '{s}': {e}")))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            Error::serialization(format!("Invalid cache key '{s}': expected 32 bytes"))
        })?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for CacheKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_hex()
    }
}

type Opener = dyn Fn() -> io::Result<Box<dyn Read + Send>> + Send + Sync;

/// A byte source that is read incrementally when absorbed.
#[derive(Clone)]
pub struct ByteSource {
    description: String,
    open: Arc<Opener>,
}

impl ByteSource {
    /// Wrap an arbitrary opener. `description` shows up in errors and logs.
    pub fn new<F>(description: impl Into<String>, open: F) -> Self
    where
        F: Fn() -> io::Result<Box<dyn Read + Send>> + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            open: Arc::new(open),
        }
    }

    /// Stream the contents of a file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let description = path.display().to_string();
        Self::new(description, move || {
            let file = std::fs::File::open(&path)?;
            Ok(Box::new(file) as Box<dyn Read + Send>)
        })
    }

    /// Stream an in-memory buffer.
    pub fn bytes(data: impl Into<Arc<[u8]>>) -> Self {
        let data: Arc<[u8]> = data.into();
        Self::new("in-memory bytes", move || {
            Ok(Box::new(io::Cursor::new(Arc::clone(&data))) as Box<dyn Read + Send>)
        })
    }

    /// What this source reads from
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ByteSource").field(&self.description).finish()
    }
}

type Producer = dyn Fn() -> Result<Value> + Send + Sync;

/// A value computed only when it is absorbed.
///
/// Clones share identity: absorbing a lazy value from inside its own
/// evaluation fails with [`Error::CyclicValue`].
#[derive(Clone)]
pub struct LazyValue(Arc<Producer>);

impl LazyValue {
    /// Wrap a producer closure.
    pub fn new<F>(produce: F) -> Self
    where
        F: Fn() -> Result<Value> + Send + Sync + 'static,
    {
        Self(Arc::new(produce))
    }

    /// Run the producer.
    pub fn evaluate(&self) -> Result<Value> {
        (self.0)()
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>().addr()
    }
}

impl fmt::Debug for LazyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LazyValue({:#x})", self.identity())
    }
}

/// Every kind of value a fingerprint can absorb.
#[derive(Debug, Clone)]
pub enum Value {
    /// Absent value
    Null,
    /// Boolean
    Bool(bool),
    /// 8-bit integer
    I8(i8),
    /// 16-bit integer
    I16(i16),
    /// 32-bit integer
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// Single precision float, absorbed by bit pattern
    F32(f32),
    /// Double precision float, absorbed by bit pattern
    F64(f64),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Text
    Str(String),
    /// Ordered sequence, absorbed in the given order
    List(Vec<Value>),
    /// Key/value pairs, absorbed in the given order
    Map(Vec<(Value, Value)>),
    /// Reference to a path under the builder's root
    File(PathBuf),
    /// Bytes read incrementally
    Stream(ByteSource),
    /// Value produced on demand
    Lazy(LazyValue),
}

impl Value {
    /// Build a map from pairs sorted by key.
    pub fn sorted_map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut pairs: Vec<(String, Value)> =
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        Self::Map(pairs.into_iter().map(|(k, v)| (Self::Str(k), v)).collect())
    }

    /// Build a list of strings sorted lexicographically, for set-like inputs.
    pub fn sorted_strings<S, I>(items: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let mut items: Vec<String> = items.into_iter().map(Into::into).collect();
        items.sort();
        Self::List(items.into_iter().map(Self::Str).collect())
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::I8(_) | Self::I16(_) | Self::I32(_) | Self::I64(_) => "integer",
            Self::F32(_) | Self::F64(_) => "float",
            Self::Bytes(_) => "bytes",
            Self::Str(_) => "string",
            Self::List(_) => "collection",
            Self::Map(_) => "map",
            Self::File(_) => "file",
            Self::Stream(_) => "stream",
            Self::Lazy(_) => "lazy",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

/// Kind tag written before a file reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Nothing at the path
    Missing,
    /// A directory
    Directory,
    /// Anything else that can be read
    File,
}

impl FileKind {
    /// Inspect the filesystem, following symlinks.
    pub fn of(path: &Path) -> Result<Self> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_dir() => Ok(Self::Directory),
            Ok(_) => Ok(Self::File),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::Missing),
            Err(e) => Err(Error::io(e, path, "stat")),
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Missing => 0,
            Self::Directory => 1,
            Self::File => 2,
        }
    }
}

/// Accumulates values into a [`CacheKey`].
pub struct FingerprintBuilder {
    hasher: Sha256,
    root: PathBuf,
    evaluating: Vec<usize>,
}

impl fmt::Debug for FingerprintBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintBuilder")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl FingerprintBuilder {
    /// Start a fingerprint whose file references are relative to `root`.
    ///
    /// The format version is the first value absorbed.
    pub fn new(root: impl Into<PathBuf>, format_version: &str) -> Self {
        let mut builder = Self {
            hasher: Sha256::new(),
            root: paths::normalize(&root.into()),
            evaluating: Vec::new(),
        };
        builder.absorb_str(format_version);
        builder
    }

    /// Root that file references are made relative to
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absorb one value, recursing into collections, maps and lazy values.
    pub fn absorb(&mut self, value: &Value) -> Result<()> {
        self.absorb_at(value, 0)
    }

    /// Absorb the null marker.
    pub fn absorb_null(&mut self) {
        self.write_marker(TAG_NULL, NULL_MARKER);
    }

    /// Absorb a boolean.
    pub fn absorb_bool(&mut self, v: bool) {
        self.write(&[TAG_BOOL, u8::from(v)]);
    }

    /// Absorb a 64-bit integer.
    pub fn absorb_i64(&mut self, v: i64) {
        self.write(&[TAG_I64]);
        self.write(&v.to_be_bytes());
    }

    /// Absorb a length-prefixed byte block.
    pub fn absorb_bytes(&mut self, bytes: &[u8]) {
        self.write(&[TAG_BYTES]);
        self.write_len(bytes.len());
        self.write(bytes);
    }

    /// Absorb text as length-prefixed UTF-16 big-endian code units.
    pub fn absorb_str(&mut self, s: &str) {
        self.write(&[TAG_STRING]);
        self.write_len(s.encode_utf16().count());
        let mut buf = Vec::with_capacity(s.len() * 2);
        for unit in s.encode_utf16() {
            buf.extend_from_slice(&unit.to_be_bytes());
        }
        self.write(&buf);
    }

    /// Announce a collection of `len` elements; the caller absorbs them next.
    pub fn begin_collection(&mut self, len: usize) {
        self.write_marker(TAG_COLLECTION, COLLECTION_MARKER);
        self.write_len(len);
    }

    /// Announce a map of `len` entries; the caller absorbs each key then value.
    pub fn begin_map(&mut self, len: usize) {
        self.write_marker(TAG_MAP, MAP_MARKER);
        self.write_len(len);
    }

    /// Absorb a path as text relative to the root.
    ///
    /// Fails with [`Error::PathOutsideRoot`] for paths that leave the root.
    pub fn absorb_relative_path(&mut self, path: &Path) -> Result<()> {
        let rel = paths::relative_to_root(path, &self.root)?;
        self.absorb_str(&rel);
        Ok(())
    }

    /// Absorb a file reference: its kind followed by its root-relative path.
    pub fn absorb_file(&mut self, path: &Path) -> Result<()> {
        let absolute = paths::absolutize(path, &self.root);
        let rel = paths::relative_to_root(&absolute, &self.root)?;
        let kind = FileKind::of(&absolute)?;
        self.write(&[TAG_FILE, kind.tag()]);
        self.absorb_str(&rel);
        Ok(())
    }

    /// Absorb a byte source as its total length followed by its digest.
    ///
    /// The source is hashed separately so it is never buffered, and both
    /// fields are fixed width so the bytes cannot bleed into what follows.
    pub fn absorb_stream(&mut self, source: &ByteSource) -> Result<()> {
        let mut reader = (source.open)().map_err(|e| {
            Error::io_no_path(e, format!("open of stream {}", source.description))
        })?;
        let mut inner = Sha256::new();
        let mut buf = vec![0u8; STREAM_CHUNK];
        let mut total: u64 = 0;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(Error::io_no_path(
                        e,
                        format!("read of stream {}", source.description),
                    ));
                }
            };
            inner.update(&buf[..n]);
            total += n as u64;
        }
        let digest = inner.finalize();
        self.write(&[TAG_STREAM]);
        self.write(&total.to_be_bytes());
        self.write(&digest);
        Ok(())
    }

    /// Consume the builder and produce the key.
    #[must_use]
    pub fn finish(self) -> CacheKey {
        let digest = self.hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        CacheKey(out)
    }

    fn absorb_at(&mut self, value: &Value, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(Error::NestingTooDeep { limit: MAX_DEPTH });
        }
        tracing::trace!(kind = value.kind(), depth, "Absorbing value");
        match value {
            Value::Null => self.absorb_null(),
            Value::Bool(v) => self.absorb_bool(*v),
            Value::I8(v) => {
                self.write(&[TAG_I8]);
                self.write(&v.to_be_bytes());
            }
            Value::I16(v) => {
                self.write(&[TAG_I16]);
                self.write(&v.to_be_bytes());
            }
            Value::I32(v) => {
                self.write(&[TAG_I32]);
                self.write(&v.to_be_bytes());
            }
            Value::I64(v) => self.absorb_i64(*v),
            Value::F32(v) => {
                self.write(&[TAG_F32]);
                self.write(&v.to_bits().to_be_bytes());
            }
            Value::F64(v) => {
                self.write(&[TAG_F64]);
                self.write(&v.to_bits().to_be_bytes());
            }
            Value::Bytes(bytes) => self.absorb_bytes(bytes),
            Value::Str(s) => self.absorb_str(s),
            Value::List(items) => {
                self.begin_collection(items.len());
                for item in items {
                    self.absorb_at(item, depth + 1)?;
                }
            }
            Value::Map(entries) => {
                self.begin_map(entries.len());
                for (key, value) in entries {
                    self.absorb_at(key, depth + 1)?;
                    self.absorb_at(value, depth + 1)?;
                }
            }
            Value::File(path) => self.absorb_file(path)?,
            Value::Stream(source) => self.absorb_stream(source)?,
            Value::Lazy(lazy) => {
                let id = lazy.identity();
                if self.evaluating.contains(&id) {
                    return Err(Error::CyclicValue);
                }
                self.evaluating.push(id);
                let result = lazy
                    .evaluate()
                    .and_then(|produced| self.absorb_at(&produced, depth + 1));
                self.evaluating.pop();
                result?;
            }
        }
        Ok(())
    }

    fn write_marker(&mut self, tag: u8, marker: u64) {
        self.write(&[tag]);
        self.write(&marker.to_be_bytes());
    }

    fn write_len(&mut self, len: usize) {
        self.write(&(len as u64).to_be_bytes());
    }

    fn write(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;
    use tempfile::TempDir;

    fn key_of(root: &Path, values: &[Value]) -> Result<CacheKey> {
        let mut builder = FingerprintBuilder::new(root, FORMAT_VERSION);
        for value in values {
            builder.absorb(value)?;
        }
        Ok(builder.finish())
    }

    #[test]
    fn same_values_same_key() {
        let values = vec![
            Value::from("hello"),
            Value::I64(42),
            Value::sorted_map([("b", Value::Bool(true)), ("a", Value::Null)]),
        ];
        let a = key_of(Path::new("/root"), &values).unwrap();
        let b = key_of(Path::new("/root"), &values).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn format_version_changes_key() {
        let a = FingerprintBuilder::new("/root", "v1").finish();
        let b = FingerprintBuilder::new("/root", "v2").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn integer_widths_are_distinct() {
        let a = key_of(Path::new("/"), &[Value::I32(1)]).unwrap();
        let b = key_of(Path::new("/"), &[Value::I64(1)]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn adjacent_strings_do_not_collide() {
        let a = key_of(Path::new("/"), &[Value::from("ab"), Value::from("c")]).unwrap();
        let b = key_of(Path::new("/"), &[Value::from("a"), Value::from("bc")]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn nested_lists_are_framed() {
        let a = key_of(
            Path::new("/"),
            &[Value::List(vec![Value::List(vec![]), Value::I64(1)])],
        )
        .unwrap();
        let b = key_of(
            Path::new("/"),
            &[Value::List(vec![Value::List(vec![Value::I64(1)])])],
        )
        .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn sorted_map_ignores_insertion_order() {
        let a = Value::sorted_map([("x", Value::I64(1)), ("y", Value::I64(2))]);
        let b = Value::sorted_map([("y", Value::I64(2)), ("x", Value::I64(1))]);
        assert_eq!(
            key_of(Path::new("/"), &[a]).unwrap(),
            key_of(Path::new("/"), &[b]).unwrap()
        );
    }

    #[test]
    fn file_reference_is_relative_to_root() {
        let one = TempDir::new().unwrap();
        let two = TempDir::new().unwrap();
        for dir in [&one, &two] {
            std::fs::create_dir_all(dir.path().join("src")).unwrap();
            std::fs::write(dir.path().join("src/lib.rs"), "fn main() {}").unwrap();
        }
        let a = key_of(one.path(), &[Value::File(one.path().join("src/lib.rs"))]).unwrap();
        let b = key_of(two.path(), &[Value::File(PathBuf::from("src/lib.rs"))]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn file_kind_is_part_of_reference() {
        let dir = TempDir::new().unwrap();
        let missing = key_of(dir.path(), &[Value::File(PathBuf::from("x"))]).unwrap();
        std::fs::create_dir(dir.path().join("x")).unwrap();
        let directory = key_of(dir.path(), &[Value::File(PathBuf::from("x"))]).unwrap();
        assert_ne!(missing, directory);
    }

    #[test]
    fn file_outside_root_fails() {
        let err = key_of(Path::new("/project"), &[Value::File("/etc/hosts".into())]).unwrap_err();
        assert!(matches!(err, Error::PathOutsideRoot { .. }));
    }

    #[test]
    fn stream_matches_its_bytes() {
        let a = key_of(
            Path::new("/"),
            &[Value::Stream(ByteSource::bytes(b"payload".to_vec()))],
        )
        .unwrap();
        let b = key_of(
            Path::new("/"),
            &[Value::Stream(ByteSource::bytes(b"payload".to_vec()))],
        )
        .unwrap();
        let c = key_of(
            Path::new("/"),
            &[Value::Stream(ByteSource::bytes(b"payloaD".to_vec()))],
        )
        .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn stream_cannot_imitate_following_values() {
        let mut forged = b"abc".to_vec();
        forged.extend_from_slice(&3u64.to_be_bytes());
        forged.push(TAG_I64);
        let separate = key_of(
            Path::new("/"),
            &[Value::Stream(ByteSource::bytes(b"abc".to_vec())), Value::I64(12)],
        )
        .unwrap();
        let merged = key_of(Path::new("/"), &[Value::Stream(ByteSource::bytes(forged))]).unwrap();
        assert_ne!(separate, merged);
    }

    #[test]
    fn stream_open_failure_is_reported() {
        let source = ByteSource::file("/definitely/not/here");
        let err = key_of(Path::new("/"), &[Value::Stream(source)]).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn lazy_value_is_absorbed_like_its_result() {
        let lazy = Value::Lazy(LazyValue::new(|| Ok(Value::from("computed"))));
        let a = key_of(Path::new("/"), &[lazy]).unwrap();
        let b = key_of(Path::new("/"), &[Value::from("computed")]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn self_referential_lazy_value_fails_fast() {
        let cell: Arc<OnceLock<LazyValue>> = Arc::new(OnceLock::new());
        let inner = Arc::clone(&cell);
        let lazy = LazyValue::new(move || {
            let me = inner.get().cloned().map_or(Value::Null, Value::Lazy);
            Ok(Value::List(vec![me]))
        });
        cell.set(lazy.clone()).unwrap();

        let err = key_of(Path::new("/"), &[Value::Lazy(lazy)]).unwrap_err();
        assert!(matches!(err, Error::CyclicValue));
    }

    #[test]
    fn same_lazy_value_twice_is_not_a_cycle() {
        let lazy = LazyValue::new(|| Ok(Value::I64(7)));
        let value = Value::List(vec![Value::Lazy(lazy.clone()), Value::Lazy(lazy)]);
        assert!(key_of(Path::new("/"), &[value]).is_ok());
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let mut value = Value::Null;
        for _ in 0..=MAX_DEPTH + 1 {
            value = Value::List(vec![value]);
        }
        let err = key_of(Path::new("/"), &[value]).unwrap_err();
        assert!(matches!(err, Error::NestingTooDeep { .. }));
    }

    #[test]
    fn cache_key_hex_round_trip() {
        let key = key_of(Path::new("/"), &[Value::from("x")]).unwrap();
        let parsed: CacheKey = key.to_hex().parse().unwrap();
        assert_eq!(key, parsed);
        assert!("zz".parse::<CacheKey>().is_err());
        assert!("abcd".parse::<CacheKey>().is_err());
    }
}
