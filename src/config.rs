//! Cache configuration
//!
//! Plain-data options for the cache. Collaborators (resolver, describer) are
//! not data and are attached to the cache itself, see `ArtifactCache::with_resolver`.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Default number of entries kept in the memory tier
pub const DEFAULT_MEMORY_LIMIT: usize = 100;

const ENV_MEMORY_LIMIT: &str = "ARTIFACT_CACHE_MEMORY_LIMIT";
const ENV_STORAGE_DIR: &str = "ARTIFACT_CACHE_DIR";
const ENV_AUTO_HYDRATE: &str = "ARTIFACT_CACHE_AUTO_HYDRATE";

/// Options recognised by `ArtifactCache`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Maximum number of entries held in the memory tier
    pub memory_limit: usize,
    /// Root directory for persistent records and the index file
    pub storage_directory: PathBuf,
    /// Whether `get` hydrates entries on every hit
    pub auto_hydrate: bool,
}

impl CacheConfig {
    /// Create a configuration with an explicit storage directory
    pub fn new(storage_directory: impl Into<PathBuf>) -> Self {
        Self {
            storage_directory: storage_directory.into(),
            ..Self::default()
        }
    }

    pub fn with_memory_limit(mut self, memory_limit: usize) -> Self {
        self.memory_limit = memory_limit;
        self
    }

    pub fn with_auto_hydrate(mut self, auto_hydrate: bool) -> Self {
        self.auto_hydrate = auto_hydrate;
        self
    }

    /// Build a configuration from defaults overlaid with environment variables
    ///
    /// Recognises `ARTIFACT_CACHE_MEMORY_LIMIT`, `ARTIFACT_CACHE_DIR` and
    /// `ARTIFACT_CACHE_AUTO_HYDRATE`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_MEMORY_LIMIT) {
            config.memory_limit = raw.trim().parse().map_err(|_| {
                CacheError::InvalidConfig(format!("{ENV_MEMORY_LIMIT} is not a number: {raw}"))
            })?;
        }
        if let Some(raw) = lookup(ENV_STORAGE_DIR) {
            config.storage_directory = PathBuf::from(raw);
        }
        if let Some(raw) = lookup(ENV_AUTO_HYDRATE) {
            config.auto_hydrate = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(CacheError::InvalidConfig(format!(
                        "{ENV_AUTO_HYDRATE} is not a boolean: {raw}"
                    )))
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Check option ranges
    pub fn validate(&self) -> Result<()> {
        if self.memory_limit == 0 {
            return Err(CacheError::InvalidConfig(
                "memoryLimit must be at least 1".to_string(),
            ));
        }
        if self.storage_directory.as_os_str().is_empty() {
            return Err(CacheError::InvalidConfig(
                "storageDirectory must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        let storage_directory = dirs::cache_dir()
            .unwrap_or_else(env::temp_dir)
            .join("artifact-cache");

        Self {
            memory_limit: DEFAULT_MEMORY_LIMIT,
            storage_directory,
            auto_hydrate: true,
        }
    }
}
