//! Artifact Cache - tiered artifact-resolution cache
//!
//! Maps a logical key to a set of reference paths and the artifacts they
//! resolve to. Entries live in three tiers:
//!
//! - Tier 1: bounded in-memory LRU
//! - Tier 2: on-disk spillover with a self-healing index
//! - Tier 3: reconstruction through an injected `ArtifactResolver`
//!
//! ```no_run
//! use std::sync::Arc;
//! use artifact_cache::{ArtifactCache, ArtifactHandle, CacheConfig, Params};
//!
//! # fn main() -> artifact_cache::Result<()> {
//! let resolver = Arc::new(|path: &str| -> anyhow::Result<Option<ArtifactHandle>> {
//!     Ok(Some(ArtifactHandle::new(path.to_uppercase())))
//! });
//! let cache = ArtifactCache::new(CacheConfig::new("/tmp/artifacts").with_memory_limit(64))?
//!     .with_resolver(resolver);
//!
//! cache.put("card", vec!["ui.Button".to_string()], Params::new())?;
//! let entry = cache.get("card", None)?.expect("just stored");
//! assert!(entry.artifact("ui.Button").is_some());
//! # Ok(())
//! # }
//! ```

mod cache;
mod config;
mod entry;
mod error;
mod resolver;
pub mod tier;

pub use cache::{ArtifactCache, CacheStats, ClearSummary};
pub use config::{CacheConfig, DEFAULT_MEMORY_LIMIT};
pub use entry::{ArtifactHandle, ArtifactMap, CacheEntry, EntryTags, Params};
pub use error::{CacheError, Result};
pub use resolver::{ArtifactResolver, Describer};
