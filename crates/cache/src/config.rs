//! Cache configuration and store location
//!
//! Read from a `buildstash.toml` file; every key is optional.
//!
//! ```toml
//! enabled = true
//! store_dir = "/var/cache/buildstash"
//! compression_level = 3
//! max_reported_differences = 10
//! ```

use crate::fingerprint::FORMAT_VERSION;
use crate::packer::DEFAULT_COMPRESSION_LEVEL;
use crate::{Error, Result};
use dirs::{cache_dir, home_dir};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding the store directory.
pub const CACHE_DIR_ENV: &str = "BUILDSTASH_CACHE_DIR";

/// Settings for the task cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Master switch; when off every task runs without cache interaction
    pub enabled: bool,
    /// Where archives are stored; resolved from the environment when unset
    pub store_dir: Option<PathBuf>,
    /// Where task history is stored; `<store_dir>/history` when unset
    pub history_dir: Option<PathBuf>,
    /// zstd level used when packing outputs
    pub compression_level: i32,
    /// Cap on differences collected when explaining why a task runs
    pub max_reported_differences: usize,
    /// Token absorbed first into every cache key
    pub format_version: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store_dir: None,
            history_dir: None,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            max_reported_differences: 10,
            format_version: FORMAT_VERSION.to_string(),
        }
    }
}

impl CacheConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No cache config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::io(e, path, "read")),
        };
        let mut config = Self::parse(&content).map_err(|e| match e {
            Error::Configuration { message } => {
                Error::configuration(format!("{}: {message}", path.display()))
            }
            other => other,
        })?;
        // relative directories are taken from the config file's location
        if let Some(base) = path.parent() {
            for dir in [&mut config.store_dir, &mut config.history_dir] {
                if let Some(d) = dir.as_mut()
                    && d.is_relative()
                {
                    *d = base.join(&*d);
                }
            }
        }
        Ok(config)
    }

    /// Parse TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::configuration(format!("invalid cache config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if !(1..=22).contains(&self.compression_level) {
            return Err(Error::configuration(format!(
                "compression_level must be between 1 and 22, got {}",
                self.compression_level
            )));
        }
        if self.format_version.trim().is_empty() {
            return Err(Error::configuration("format_version must not be empty"));
        }
        Ok(())
    }

    /// Directory for archives: the configured one, or the first writable
    /// candidate from the environment.
    pub fn resolve_store_dir(&self) -> Result<PathBuf> {
        match &self.store_dir {
            Some(dir) => Ok(dir.clone()),
            None => cache_root(),
        }
    }

    /// Directory for task history.
    pub fn resolve_history_dir(&self, store_dir: &Path) -> PathBuf {
        self.history_dir
            .clone()
            .unwrap_or_else(|| store_dir.join("history"))
    }
}

/// Inputs for determining the cache root directory
#[derive(Debug, Clone)]
struct CacheInputs {
    override_dir: Option<PathBuf>,
    xdg_cache_home: Option<PathBuf>,
    os_cache_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

fn cache_root_from_inputs(inputs: CacheInputs) -> Result<PathBuf> {
    // Resolution order (first writable wins):
    // 1) BUILDSTASH_CACHE_DIR
    // 2) XDG_CACHE_HOME/buildstash
    // 3) OS cache dir/buildstash
    // 4) ~/.buildstash/cache
    // 5) TMPDIR/buildstash/cache
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(dir) = inputs.override_dir.filter(|p| !p.as_os_str().is_empty()) {
        candidates.push(dir);
    }
    if let Some(xdg) = inputs.xdg_cache_home {
        candidates.push(xdg.join("buildstash"));
    }
    if let Some(os_cache) = inputs.os_cache_dir {
        candidates.push(os_cache.join("buildstash"));
    }
    if let Some(home) = inputs.home_dir {
        candidates.push(home.join(".buildstash/cache"));
    }
    candidates.push(inputs.temp_dir.join("buildstash/cache"));

    for path in candidates {
        // Nix sandboxes point HOME here and it is never writable
        if path.starts_with("/homeless-shelter") {
            continue;
        }
        if path.exists() {
            let probe = path.join(".write_probe");
            match std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&probe)
            {
                Ok(_) => {
                    let _ = std::fs::remove_file(&probe);
                    return Ok(path);
                }
                Err(_) => continue,
            }
        }
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
    }
    Err(Error::configuration(
        "Failed to determine a writable cache directory",
    ))
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
}

fn cache_root() -> Result<PathBuf> {
    cache_root_from_inputs(CacheInputs {
        override_dir: env_path(CACHE_DIR_ENV),
        xdg_cache_home: env_path("XDG_CACHE_HOME"),
        os_cache_dir: cache_dir(),
        home_dir: home_dir(),
        temp_dir: std::env::temp_dir(),
    })
}
