//! Tunables for the cache, overflow allocator and coordination services.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration or catalog files.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for the expected shape.
    #[error("failed to parse {}: {source}", display_path(.path))]
    Parse {
        /// File path, when parsing from a file.
        path: Option<PathBuf>,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// The contents parsed but are inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Attaches a file path to a parse error.
    pub fn with_path(self, file: &Path) -> Self {
        match self {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: Some(file.to_path_buf()),
                source,
            },
            other => other,
        }
    }
}

fn display_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<inline>".to_string())
}

/// Graph layer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Child slots embedded in the parent's adjacency row before spilling.
    pub embedded_threshold: usize,
    /// Maximum overflow rows per adjacency row; also bounds retry loops.
    pub max_overflow: usize,
    /// Create another overflow row while at most this many pointers are available.
    pub grow_by_threshold: usize,
    /// Child slots per overflow batch.
    pub overflow_batch_limit: usize,
    /// Node cache capacity in entries.
    pub cache_capacity: usize,
    /// Lock acquisition timeout in milliseconds; `None` waits forever.
    pub lock_timeout_ms: Option<u64>,
    /// Concurrently executing scheduled attaches.
    pub attach_ceiling: usize,
    /// Ceiling for throttle classes that are not registered explicitly.
    pub throttle_default_ceiling: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            embedded_threshold: 20,
            max_overflow: 5,
            grow_by_threshold: 0,
            overflow_batch_limit: 200,
            cache_capacity: 10_000,
            lock_timeout_ms: None,
            attach_ceiling: 8,
            throttle_default_ceiling: 4,
        }
    }
}

impl GraphConfig {
    /// Clamps values that would stall the allocator or the throttle.
    pub fn normalize(mut self) -> Self {
        self.embedded_threshold = self.embedded_threshold.max(1);
        self.max_overflow = self.max_overflow.max(1);
        self.overflow_batch_limit = self.overflow_batch_limit.max(1);
        self.cache_capacity = self.cache_capacity.max(1);
        self.attach_ceiling = self.attach_ceiling.max(1);
        self.throttle_default_ceiling = self.throttle_default_ceiling.max(1);
        self
    }

    /// Lock timeout as a duration.
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    /// Sets the embedded threshold.
    pub fn embedded_threshold(mut self, slots: usize) -> Self {
        self.embedded_threshold = slots;
        self
    }

    /// Sets the overflow row ceiling.
    pub fn max_overflow(mut self, rows: usize) -> Self {
        self.max_overflow = rows;
        self
    }

    /// Sets the grow-by threshold.
    pub fn grow_by_threshold(mut self, pointers: usize) -> Self {
        self.grow_by_threshold = pointers;
        self
    }

    /// Sets the per-batch slot bound.
    pub fn overflow_batch_limit(mut self, slots: usize) -> Self {
        self.overflow_batch_limit = slots;
        self
    }

    /// Sets the cache capacity.
    pub fn cache_capacity(mut self, entries: usize) -> Self {
        self.cache_capacity = entries;
        self
    }

    /// Sets the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Sets the scheduled attach ceiling.
    pub fn attach_ceiling(mut self, tasks: usize) -> Self {
        self.attach_ceiling = tasks;
        self
    }

    /// Parses TOML; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: GraphConfig =
            toml::from_str(text).map_err(|source| ConfigError::Parse { path: None, source })?;
        Ok(cfg.normalize())
    }

    /// Reads `path`, or the default location when `None`. A missing default
    /// file yields the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|err| err.with_path(&path))
    }
}

/// `$CONFIG_DIR/rowgraph/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("rowgraph").join("config.toml"))
}
