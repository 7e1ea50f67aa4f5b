//! Tiered artifact cache
//!
//! Composes the memory tier, the persistent tier and resolver-driven
//! reconstruction behind a single get/put/remove/clear API.
//!
//! Lookup order:
//! 1. Memory tier hit, hydrated on demand when `auto_hydrate` is set
//! 2. Persistent tier hit, promoted back into memory (the disk copy stays)
//! 3. Reconstruction from the caller's reference paths through the resolver
//!
//! Internal failures never reach the caller; they degrade to misses.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use moka::sync::Cache;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::config::CacheConfig;
use crate::entry::{CacheEntry, Params};
use crate::error::{validate_key, CacheError, Result};
use crate::resolver::{ArtifactResolver, Describer};
use crate::tier::{MemoryTier, PersistentTier};

/// Point-in-time counters and tier sizes
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub tier1_hits: u64,
    pub tier2_hits: u64,
    pub tier3_reconstructions: u64,
    pub misses: u64,
    pub tier1_size: usize,
    pub tier2_size: usize,
    /// `(tier1_hits + tier2_hits) / total_requests`, 0 before any request
    pub hit_rate: f64,
}

impl CacheStats {
    /// Number of `get` calls accounted for
    pub fn total_requests(&self) -> u64 {
        self.tier1_hits + self.tier2_hits + self.tier3_reconstructions + self.misses
    }
}

/// Entries dropped by `clear`, per tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearSummary {
    pub tier1_count: usize,
    pub tier2_count: usize,
}

#[derive(Default)]
struct Counters {
    tier1_hits: AtomicU64,
    tier2_hits: AtomicU64,
    tier3_reconstructions: AtomicU64,
    misses: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        for counter in [
            &self.tier1_hits,
            &self.tier2_hits,
            &self.tier3_reconstructions,
            &self.misses,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Three-tier artifact cache
pub struct ArtifactCache {
    /// Tier 1: bounded LRU, spills into `persistent` on eviction
    memory: MemoryTier,
    /// Tier 2: on-disk records plus index
    persistent: Arc<PersistentTier>,
    /// Tier 3 and hydration backend
    resolver: Option<Arc<dyn ArtifactResolver>>,
    /// Optional notation source for `put`
    describer: Option<Arc<dyn Describer>>,
    auto_hydrate: bool,
    counters: Counters,
    /// Reconstructions in progress, so concurrent misses share one resolver pass
    in_flight: Cache<String, CacheEntry>,
}

impl ArtifactCache {
    /// Create a cache from configuration
    ///
    /// Opens (and if necessary repairs) the persistent tier. No resolver is
    /// attached; use `with_resolver` to enable hydration and reconstruction.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let persistent = Arc::new(PersistentTier::open(&config.storage_directory)?);
        let spill_target = Arc::clone(&persistent);
        let memory = MemoryTier::with_spillover(
            config.memory_limit,
            Box::new(move |key: &str, entry: &CacheEntry| spill_target.spill(key, entry)),
        );

        let in_flight = Cache::builder().name("artifact_reconstructions").build();

        debug!(
            memory_limit = config.memory_limit,
            auto_hydrate = config.auto_hydrate,
            persisted = persistent.len(),
            "Artifact cache ready"
        );

        Ok(Self {
            memory,
            persistent,
            resolver: None,
            describer: None,
            auto_hydrate: config.auto_hydrate,
            counters: Counters::default(),
            in_flight,
        })
    }

    /// Attach the resolver used for hydration and reconstruction
    pub fn with_resolver(mut self, resolver: Arc<dyn ArtifactResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Attach a describer that fills in missing notation tags on `put`
    pub fn with_describer(mut self, describer: Arc<dyn Describer>) -> Self {
        self.describer = Some(describer);
        self
    }

    /// Look up an entry
    ///
    /// # Arguments
    /// * `key` - Entry key, must be non-empty
    /// * `reference_paths` - Enables reconstruction when both tiers miss
    ///
    /// # Returns
    /// The entry, or None on a miss. Only an empty key is an error.
    pub fn get(&self, key: &str, reference_paths: Option<&[String]>) -> Result<Option<CacheEntry>> {
        self.lookup(key, reference_paths, None)
    }

    /// Like `get`, but stops calling the resolver once `deadline` passes
    ///
    /// An entry whose hydration was cut short before anything resolved is
    /// returned unhydrated, so a later lookup tries again.
    pub fn get_with_deadline(
        &self,
        key: &str,
        reference_paths: Option<&[String]>,
        deadline: Instant,
    ) -> Result<Option<CacheEntry>> {
        self.lookup(key, reference_paths, Some(deadline))
    }

    fn lookup(
        &self,
        key: &str,
        reference_paths: Option<&[String]>,
        deadline: Option<Instant>,
    ) -> Result<Option<CacheEntry>> {
        validate_key(key)?;

        if let Some(mut entry) = self.memory.get(key) {
            Counters::bump(&self.counters.tier1_hits);
            if self.auto_hydrate && !entry.is_hydrated() {
                self.hydrate_until(&mut entry, deadline);
                self.memory.store_hydration(key, &entry);
            }
            return Ok(Some(entry));
        }

        if let Some(mut entry) = self.persistent.load(key) {
            Counters::bump(&self.counters.tier2_hits);
            entry.touch();
            if self.auto_hydrate {
                self.hydrate_until(&mut entry, deadline);
            }
            let entry = self.memory.put_if_absent(key, entry);
            debug!(key = key, "Promoted entry from persistent tier");
            return Ok(Some(entry));
        }

        if let Some(paths) = reference_paths {
            return Ok(self.reconstruct(key, paths, deadline));
        }

        Counters::bump(&self.counters.misses);
        trace!(key = key, "Cache MISS");
        Ok(None)
    }

    /// Build a fresh entry from reference paths and seed the memory tier
    ///
    /// Failed resolutions are not remembered: once the entry leaves both tiers,
    /// the next miss resolves again.
    fn reconstruct(
        &self,
        key: &str,
        reference_paths: &[String],
        deadline: Option<Instant>,
    ) -> Option<CacheEntry> {
        if self.resolver.is_none() {
            warn!(key = key, error = %CacheError::ResolverUnavailable, "Cannot reconstruct entry");
            Counters::bump(&self.counters.misses);
            return None;
        }

        let entry = self.in_flight.get_with(key.to_string(), || {
            if let Some(existing) = self.memory.get(key) {
                return existing;
            }
            let mut entry = CacheEntry::new(key, reference_paths.to_vec());
            let found = self.hydrate_until(&mut entry, deadline);
            entry.touch();
            debug!(
                key = key,
                paths = reference_paths.len(),
                resolved = found,
                "Reconstructed entry"
            );
            self.memory.put_if_absent(key, entry)
        });
        self.in_flight.invalidate(key);

        Counters::bump(&self.counters.tier3_reconstructions);
        Some(entry)
    }

    /// Resolve an entry's reference paths into artifacts
    ///
    /// No-op for an entry that is already hydrated with artifacts. Otherwise
    /// every path is offered to the resolver and the entry is marked hydrated,
    /// whether or not anything resolved.
    ///
    /// # Returns
    /// True if the entry holds at least one artifact afterwards
    pub fn hydrate(&self, entry: &mut CacheEntry) -> bool {
        self.hydrate_until(entry, None)
    }

    fn hydrate_until(&self, entry: &mut CacheEntry, deadline: Option<Instant>) -> bool {
        if entry.is_hydrated() && !entry.resolved_artifacts().is_empty() {
            return true;
        }

        let Some(resolver) = &self.resolver else {
            debug!(key = entry.key(), error = %CacheError::ResolverUnavailable, "Cannot hydrate entry");
            return false;
        };

        let mut completed = true;
        for path in entry.reference_paths().to_vec() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(key = entry.key(), path = %path, "Hydration deadline passed");
                completed = false;
                break;
            }
            match resolver.resolve(&path) {
                Ok(Some(handle)) => entry.insert_artifact(path, handle),
                Ok(None) => trace!(key = entry.key(), path = %path, "No artifact for path"),
                Err(e) => warn!(key = entry.key(), path = %path, error = %e, "Resolver failed"),
            }
        }
        entry.finish_hydration(completed);

        let resolved = entry.resolved_artifacts().len();
        trace!(key = entry.key(), resolved = resolved, "Hydrated entry");
        resolved > 0
    }

    /// Store an entry built from its parts
    pub fn put(&self, key: &str, reference_paths: Vec<String>, params: Params) -> Result<CacheEntry> {
        self.put_entry(CacheEntry::new(key, reference_paths).with_params(params))
    }

    /// Store a fully built entry in the memory tier
    ///
    /// May evict (and spill) the least recently used entry. Fills in the
    /// notation tag from the describer when one is configured and missing.
    pub fn put_entry(&self, mut entry: CacheEntry) -> Result<CacheEntry> {
        validate_key(entry.key())?;

        let has_notation = entry.tags().is_some_and(|t| t.notation.is_some());
        if let Some(describer) = self.describer.as_ref().filter(|_| !has_notation) {
            match describer.describe(entry.reference_paths()) {
                Ok(notation) => entry.set_notation_if_absent(notation),
                Err(e) => {
                    debug!(key = entry.key(), error = %e, "Describer failed, storing without notation")
                }
            }
        }

        let key = entry.key().to_string();
        self.memory.put(&key, entry.clone());
        Ok(entry)
    }

    /// Remove a key from both tiers
    ///
    /// # Returns
    /// True if either tier held the key
    pub fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let in_memory = self.memory.remove(key).is_some();
        let on_disk = self.persistent.remove(key);
        debug!(key = key, in_memory = in_memory, on_disk = on_disk, "Removed entry");
        Ok(in_memory || on_disk)
    }

    /// Drop entries from the memory tier, and from disk unless `tier1_only`
    pub fn clear(&self, tier1_only: bool) -> ClearSummary {
        let tier1_count = self.memory.clear();
        let tier2_count = if tier1_only {
            0
        } else {
            self.persistent.clear()
        };
        debug!(
            tier1 = tier1_count,
            tier2 = tier2_count,
            "Cleared artifact cache"
        );
        ClearSummary {
            tier1_count,
            tier2_count,
        }
    }

    /// Whether the memory tier holds the key (does not touch recency)
    pub fn contains(&self, key: &str) -> bool {
        self.memory.contains(key)
    }

    /// Whether the persistent tier indexes the key
    pub fn is_persisted(&self, key: &str) -> bool {
        self.persistent.contains(key)
    }

    /// Memory tier keys, least recently used first
    pub fn keys(&self) -> Vec<String> {
        self.memory.keys()
    }

    /// Rebuild the persistent index from the record files
    pub fn rebuild_index(&self) -> usize {
        self.persistent.rebuild_index()
    }

    /// Get the persistent tier's root directory
    pub fn storage_directory(&self) -> &Path {
        self.persistent.storage_directory()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let tier1_hits = self.counters.tier1_hits.load(Ordering::Relaxed);
        let tier2_hits = self.counters.tier2_hits.load(Ordering::Relaxed);
        let tier3_reconstructions = self.counters.tier3_reconstructions.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);

        let total = tier1_hits + tier2_hits + tier3_reconstructions + misses;
        let hit_rate = if total > 0 {
            (tier1_hits + tier2_hits) as f64 / total as f64
        } else {
            0.0
        };

        CacheStats {
            tier1_hits,
            tier2_hits,
            tier3_reconstructions,
            misses,
            tier1_size: self.memory.len(),
            tier2_size: self.persistent.len(),
            hit_rate,
        }
    }

    /// Zero the hit/miss counters
    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    /// Log current cache metrics
    pub fn log_metrics(&self) {
        let stats = self.stats();
        debug!(
            tier1_hits = stats.tier1_hits,
            tier2_hits = stats.tier2_hits,
            tier3_reconstructions = stats.tier3_reconstructions,
            misses = stats.misses,
            hit_rate = format!("{:.1}%", stats.hit_rate * 100.0),
            tier1_entries = stats.tier1_size,
            tier2_entries = stats.tier2_size,
            "Cache metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{ArtifactHandle, ArtifactMap, EntryTags};
    use crate::resolver::testing::{init_tracing, CountingResolver, FailingResolver};
    use std::fs;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|p| p.to_string()).collect()
    }

    fn params(size: i64) -> Params {
        let mut params = Params::new();
        params.insert("size".to_string(), serde_json::json!(size));
        params.insert("label".to_string(), serde_json::json!("primary"));
        params
    }

    fn cache_in(dir: &TempDir, memory_limit: usize) -> ArtifactCache {
        init_tracing();
        ArtifactCache::new(CacheConfig::new(dir.path()).with_memory_limit(memory_limit)).unwrap()
    }

    #[test]
    fn test_put_then_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 4);

        cache.put("card", paths(&["ui.Button", "ui.Label"]), params(3)).unwrap();
        let entry = cache.get("card", None).unwrap().unwrap();

        assert_eq!(entry.reference_paths(), paths(&["ui.Button", "ui.Label"]).as_slice());
        assert_eq!(entry.params(), &params(3));
        assert_eq!(entry.access_count(), 1);
    }

    #[test]
    fn test_two_entry_scenario() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 2);

        cache.put("a", paths(&["lib.A"]), params(1)).unwrap();
        cache.put("b", paths(&["lib.B"]), params(2)).unwrap();
        cache.put("c", paths(&["lib.C"]), params(3)).unwrap();

        assert!(!cache.contains("a"));
        assert_eq!(cache.stats().tier2_size, 1);
        assert!(cache.is_persisted("a"));

        let a = cache.get("a", None).unwrap().unwrap();
        assert_eq!(a.params(), &params(1));
        assert!(cache.contains("a"));
        assert!(cache.is_persisted("a"));

        // Promoting "a" evicted "b", which joins "a" on disk
        assert!(!cache.contains("b"));
        assert!(cache.is_persisted("b"));
        assert_eq!(cache.stats().tier2_size, 2);
        assert_eq!(cache.stats().tier2_hits, 1);
    }

    #[test]
    fn test_evicted_entry_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let cache = cache_in(&dir, 1);
            cache.put("first", paths(&["lib.A", "lib.B"]), params(1)).unwrap();
            cache.put("second", paths(&["lib.C"]), params(2)).unwrap();
            cache.put("third", paths(&["lib.D"]), params(3)).unwrap();
        }

        let resolver = Arc::new(CountingResolver::knowing(&["lib.A"]));
        let cache = ArtifactCache::new(
            CacheConfig::new(dir.path())
                .with_memory_limit(4)
                .with_auto_hydrate(false),
        )
        .unwrap()
        .with_resolver(resolver.clone());

        let first = cache.get("first", None).unwrap().unwrap();
        let second = cache.get("second", None).unwrap().unwrap();

        assert_eq!(first.reference_paths(), paths(&["lib.A", "lib.B"]).as_slice());
        assert_eq!(second.reference_paths(), paths(&["lib.C"]).as_slice());
        assert_eq!(resolver.calls(), 0);
        assert_eq!(cache.stats().tier2_hits, 2);
        assert_eq!(cache.stats().tier3_reconstructions, 0);
    }

    #[test]
    fn test_stats_accounting() {
        let dir = TempDir::new().unwrap();
        let resolver = Arc::new(CountingResolver::knowing(&["lib.X"]));
        let cache = cache_in(&dir, 1).with_resolver(resolver);

        assert_eq!(cache.stats().hit_rate, 0.0);

        cache.put("a", paths(&["lib.A"]), Params::new()).unwrap();
        cache.put("b", paths(&["lib.B"]), Params::new()).unwrap();

        cache.get("b", None).unwrap(); // tier 1
        cache.get("a", None).unwrap(); // tier 2
        cache.get("x", Some(paths(&["lib.X"]).as_slice())).unwrap(); // tier 3
        cache.get("nope", None).unwrap(); // miss

        let stats = cache.stats();
        assert_eq!(stats.tier1_hits, 1);
        assert_eq!(stats.tier2_hits, 1);
        assert_eq!(stats.tier3_reconstructions, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_requests(), 4);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);

        cache.reset_stats();
        assert_eq!(cache.stats().total_requests(), 0);
    }

    #[test]
    fn test_hydration_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let resolver = Arc::new(CountingResolver::knowing(&["lib.A", "lib.B"]));
        let cache = cache_in(&dir, 4).with_resolver(resolver.clone());

        let mut entry = CacheEntry::new("k", paths(&["lib.A", "lib.B", "lib.Unknown"]));
        assert!(cache.hydrate(&mut entry));
        assert_eq!(resolver.calls(), 3);
        let first = entry.artifact("lib.A").unwrap().clone();

        assert!(cache.hydrate(&mut entry));
        assert!(cache.hydrate(&mut entry));
        assert_eq!(resolver.calls(), 3);
        assert_eq!(entry.resolved_artifacts().len(), 2);
        assert!(entry.artifact("lib.A").unwrap().ptr_eq(&first));
    }

    #[test]
    fn test_hydration_with_nothing_found() {
        let dir = TempDir::new().unwrap();
        let resolver = Arc::new(CountingResolver::knowing(&[]));
        let cache = cache_in(&dir, 4).with_resolver(resolver);

        let mut entry = CacheEntry::new("k", paths(&["lib.Gone"]));
        assert!(!entry.is_hydrated());
        assert!(!cache.hydrate(&mut entry));
        assert!(entry.is_hydrated());
        assert!(entry.resolved_artifacts().is_empty());
    }

    #[test]
    fn test_reconstruction_gating() {
        let dir = TempDir::new().unwrap();
        let resolver = Arc::new(CountingResolver::knowing(&["lib.A"]));
        let cache = cache_in(&dir, 4).with_resolver(resolver.clone());

        assert!(cache.get("k", None).unwrap().is_none());
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(resolver.calls(), 0);

        let built = cache.get("k", Some(paths(&["lib.A"]).as_slice())).unwrap().unwrap();
        assert_eq!(resolver.calls(), 1);
        assert!(built.is_hydrated());
        assert!(built.params().is_empty());
        assert!(built.tags().is_none());
        let handle = built.artifact("lib.A").unwrap();
        assert_eq!(handle.downcast_ref::<String>().map(String::as_str), Some("lib.A"));

        let again = cache.get("k", None).unwrap().unwrap();
        assert_eq!(resolver.calls(), 1);
        assert_eq!(again.resolved_artifacts().len(), 1);
        assert_eq!(cache.stats().tier1_hits, 1);
        assert_eq!(cache.stats().tier3_reconstructions, 1);
    }

    #[test]
    fn test_failed_reconstruction_is_not_remembered() {
        let dir = TempDir::new().unwrap();
        let resolver = Arc::new(FailingResolver::default());
        let cache = cache_in(&dir, 4).with_resolver(resolver.clone());

        let entry = cache.get("k", Some(paths(&["lib.A"]).as_slice())).unwrap().unwrap();
        assert!(entry.is_hydrated());
        assert!(entry.resolved_artifacts().is_empty());
        assert!(cache.contains("k"));
        assert_eq!(resolver.calls(), 1);

        // A resident entry that already tried is not retried on hits
        cache.get("k", Some(paths(&["lib.A"]).as_slice())).unwrap().unwrap();
        assert_eq!(resolver.calls(), 1);

        // Once gone from both tiers, the next miss asks the resolver again
        assert!(cache.remove("k").unwrap());
        cache.get("k", Some(paths(&["lib.A"]).as_slice())).unwrap().unwrap();
        assert_eq!(resolver.calls(), 2);
    }

    #[test]
    fn test_hydrated_empty_entry_is_not_rehydrated_on_hits() {
        let dir = TempDir::new().unwrap();
        let resolver = Arc::new(CountingResolver::knowing(&[]));
        let cache = cache_in(&dir, 4).with_resolver(resolver.clone());

        let built = cache.get("k", Some(paths(&["lib.A"]).as_slice())).unwrap().unwrap();
        assert_eq!(resolver.calls(), 1);
        assert!(built.is_hydrated());
        assert!(built.resolved_artifacts().is_empty());

        for _ in 0..3 {
            let hit = cache.get("k", None).unwrap().unwrap();
            assert!(hit.is_hydrated());
            assert!(hit.resolved_artifacts().is_empty());
        }
        assert_eq!(resolver.calls(), 1);
        assert_eq!(cache.stats().tier1_hits, 3);
        assert_eq!(cache.stats().tier3_reconstructions, 1);
    }

    #[test]
    fn test_put_during_hydration_is_not_overwritten() {
        let dir = TempDir::new().unwrap();
        let resolver = Arc::new(
            CountingResolver::knowing(&["lib.Old"]).with_delay(Duration::from_millis(300)),
        );
        let cache = Arc::new(cache_in(&dir, 4).with_resolver(resolver.clone()));
        cache.put("k", paths(&["lib.Old"]), params(1)).unwrap();

        let reader = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get("k", None).unwrap().unwrap())
        };
        thread::sleep(Duration::from_millis(100));
        cache.put("k", paths(&["lib.New"]), params(2)).unwrap();

        let stale = reader.join().unwrap();
        assert_eq!(stale.reference_paths(), paths(&["lib.Old"]).as_slice());

        let current = cache.get("k", None).unwrap().unwrap();
        assert_eq!(current.reference_paths(), paths(&["lib.New"]).as_slice());
        assert_eq!(current.params(), &params(2));
        assert!(current.artifact("lib.Old").is_none());
    }

    #[test]
    fn test_promotion_keeps_newer_resident_entry() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 1);
        cache.put("a", paths(&["lib.Old"]), Params::new()).unwrap();
        cache.put("b", paths(&["lib.B"]), Params::new()).unwrap();
        assert!(cache.is_persisted("a"));

        // Simulate a write racing a promotion: the resident copy must win
        let loaded = cache.persistent.load("a").unwrap();
        cache.put("a", paths(&["lib.New"]), Params::new()).unwrap();
        let promoted = cache.memory.put_if_absent("a", loaded);

        assert_eq!(promoted.reference_paths(), paths(&["lib.New"]).as_slice());
        let current = cache.get("a", None).unwrap().unwrap();
        assert_eq!(current.reference_paths(), paths(&["lib.New"]).as_slice());
    }

    #[test]
    fn test_accepts_shared_trait_objects() {
        let dir = TempDir::new().unwrap();
        let shared: Arc<dyn ArtifactResolver> = Arc::new(CountingResolver::knowing(&["lib.A"]));
        let describer: Arc<dyn Describer> =
            Arc::new(|_: &[String]| -> anyhow::Result<String> { Ok("[A]".to_string()) });

        let first = cache_in(&dir, 4)
            .with_resolver(Arc::clone(&shared))
            .with_describer(describer);
        let entry = first.put("k", paths(&["lib.A"]), Params::new()).unwrap();
        assert_eq!(entry.tags().and_then(|t| t.notation.as_deref()), Some("[A]"));
        assert!(first.get("k", None).unwrap().unwrap().artifact("lib.A").is_some());
        assert_eq!(Arc::strong_count(&shared), 2);
    }

    #[test]
    fn test_reconstruction_without_resolver_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 4);

        assert!(cache.get("k", Some(paths(&["lib.A"]).as_slice())).unwrap().is_none());
        assert!(!cache.contains("k"));
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_auto_hydrate_on_memory_hit() {
        let dir = TempDir::new().unwrap();
        let resolver = Arc::new(CountingResolver::knowing(&["lib.A"]));
        let cache = cache_in(&dir, 4).with_resolver(resolver.clone());

        cache.put("k", paths(&["lib.A"]), Params::new()).unwrap();
        let entry = cache.get("k", None).unwrap().unwrap();
        assert!(entry.is_hydrated());
        assert_eq!(resolver.calls(), 1);

        // Hydrated state was written back into the memory tier
        cache.get("k", None).unwrap().unwrap();
        assert_eq!(resolver.calls(), 1);
    }

    #[test]
    fn test_auto_hydrate_disabled() {
        let dir = TempDir::new().unwrap();
        let resolver = Arc::new(CountingResolver::knowing(&["lib.A"]));
        let cache = ArtifactCache::new(CacheConfig::new(dir.path()).with_auto_hydrate(false))
            .unwrap()
            .with_resolver(resolver.clone());

        cache.put("k", paths(&["lib.A"]), Params::new()).unwrap();
        let entry = cache.get("k", None).unwrap().unwrap();
        assert!(!entry.is_hydrated());
        assert_eq!(resolver.calls(), 0);
    }

    #[test]
    fn test_put_with_caller_artifacts() {
        let dir = TempDir::new().unwrap();
        let resolver = Arc::new(CountingResolver::knowing(&["lib.A"]));
        let cache = cache_in(&dir, 4).with_resolver(resolver.clone());

        let mut artifacts = ArtifactMap::new();
        artifacts.insert("lib.A".to_string(), ArtifactHandle::new(42u64));
        let stored = cache
            .put_entry(CacheEntry::new("k", paths(&["lib.A"])).with_artifacts(artifacts))
            .unwrap();
        assert!(stored.is_hydrated());

        let entry = cache.get("k", None).unwrap().unwrap();
        assert_eq!(entry.artifact("lib.A").unwrap().downcast_ref::<u64>(), Some(&42));
        assert_eq!(resolver.calls(), 0);
    }

    #[test]
    fn test_describer_fills_notation() {
        let dir = TempDir::new().unwrap();
        let describer = Arc::new(|paths: &[String]| -> anyhow::Result<String> {
            Ok(format!("[{}]", paths.join(" ")))
        });
        let cache = cache_in(&dir, 4).with_describer(describer);

        let entry = cache.put("k", paths(&["A", "B"]), Params::new()).unwrap();
        assert_eq!(entry.tags().and_then(|t| t.notation.as_deref()), Some("[A B]"));

        let tagged = CacheEntry::new("t", paths(&["A"])).with_tags(EntryTags {
            notation: Some("given".to_string()),
            description: Some("kept".to_string()),
        });
        let entry = cache.put_entry(tagged).unwrap();
        assert_eq!(entry.tags().and_then(|t| t.notation.as_deref()), Some("given"));
    }

    #[test]
    fn test_failing_describer_is_ignored() {
        let dir = TempDir::new().unwrap();
        let describer = Arc::new(|_: &[String]| -> anyhow::Result<String> {
            Err(anyhow::anyhow!("notation parser unavailable"))
        });
        let cache = cache_in(&dir, 4).with_describer(describer);

        let entry = cache.put("k", paths(&["A"]), Params::new()).unwrap();
        assert!(entry.tags().is_none());
        assert!(cache.contains("k"));
    }

    #[test]
    fn test_empty_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 4);

        assert!(matches!(cache.get("", None), Err(CacheError::InvalidKey)));
        assert!(matches!(
            cache.put("", vec![], Params::new()),
            Err(CacheError::InvalidKey)
        ));
        assert!(matches!(cache.remove(""), Err(CacheError::InvalidKey)));
        assert_eq!(cache.stats().total_requests(), 0);
    }

    #[test]
    fn test_remove_from_both_tiers() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 1);

        cache.put("a", paths(&["lib.A"]), Params::new()).unwrap();
        cache.put("b", paths(&["lib.B"]), Params::new()).unwrap();
        assert!(cache.is_persisted("a"));

        assert!(cache.remove("a").unwrap());
        assert!(cache.remove("b").unwrap());
        assert!(!cache.remove("a").unwrap());
        assert!(cache.get("a", None).unwrap().is_none());
        assert!(!cache.is_persisted("a"));
    }

    #[test]
    fn test_clear_semantics() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 2);
        for key in ["a", "b", "c", "d"] {
            cache.put(key, paths(&["lib.X"]), Params::new()).unwrap();
        }
        assert_eq!(cache.stats().tier2_size, 2);

        let summary = cache.clear(true);
        assert_eq!(summary, ClearSummary { tier1_count: 2, tier2_count: 0 });
        assert_eq!(cache.stats().tier1_size, 0);
        assert_eq!(cache.stats().tier2_size, 2);

        cache.put("e", paths(&["lib.X"]), Params::new()).unwrap();
        let summary = cache.clear(false);
        assert_eq!(summary, ClearSummary { tier1_count: 1, tier2_count: 2 });
        assert_eq!(cache.stats().tier1_size, 0);
        assert_eq!(cache.stats().tier2_size, 0);
    }

    #[test]
    fn test_spill_failure_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 1);

        // Replace the records directory with a plain file so writes fail
        let records = dir.path().join("records");
        fs::remove_dir_all(&records).unwrap();
        fs::write(&records, b"not a directory").unwrap();

        cache.put("a", paths(&["lib.A"]), Params::new()).unwrap();
        cache.put("b", paths(&["lib.B"]), Params::new()).unwrap();

        assert!(cache.contains("b"));
        assert!(!cache.is_persisted("a"));
        assert!(cache.get("a", None).unwrap().is_none());
    }

    #[test]
    fn test_expired_deadline_skips_resolver() {
        let dir = TempDir::new().unwrap();
        let resolver = Arc::new(CountingResolver::knowing(&["lib.A"]));
        let cache = cache_in(&dir, 4).with_resolver(resolver.clone());

        let entry = cache
            .get_with_deadline("k", Some(paths(&["lib.A"]).as_slice()), Instant::now())
            .unwrap()
            .unwrap();
        assert_eq!(resolver.calls(), 0);
        assert!(!entry.is_hydrated());
        assert!(cache.contains("k"));

        // The unfinished hydration is completed by the next lookup
        let entry = cache.get("k", None).unwrap().unwrap();
        assert_eq!(resolver.calls(), 1);
        assert!(entry.is_hydrated());
    }

    #[test]
    fn test_concurrent_misses_share_one_reconstruction() {
        const THREADS: usize = 8;

        let dir = TempDir::new().unwrap();
        let resolver =
            Arc::new(CountingResolver::knowing(&["lib.A"]).with_delay(Duration::from_millis(100)));
        let cache = Arc::new(cache_in(&dir, 4).with_resolver(resolver.clone()));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get("shared", Some(paths(&["lib.A"]).as_slice())).unwrap()
                })
            })
            .collect();

        for handle in handles {
            let entry = handle.join().unwrap().unwrap();
            assert_eq!(entry.resolved_artifacts().len(), 1);
        }

        assert_eq!(resolver.calls(), 1);
        let stats = cache.stats();
        assert_eq!(stats.tier1_hits + stats.tier3_reconstructions, THREADS as u64);
        assert_eq!(stats.tier1_size, 1);
    }

    #[test]
    fn test_manual_index_rebuild() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 1);
        cache.put("a", paths(&["lib.A"]), Params::new()).unwrap();
        cache.put("b", paths(&["lib.B"]), Params::new()).unwrap();

        fs::write(dir.path().join("index.json"), b"{}").unwrap();
        assert_eq!(cache.rebuild_index(), 1);
        assert!(cache.is_persisted("a"));
        assert_eq!(cache.storage_directory(), dir.path());
    }

    #[test]
    fn test_stats_serialize_camel_case() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 1);
        cache.log_metrics();

        let json = serde_json::to_value(cache.stats()).unwrap();
        assert_eq!(json["tier3Reconstructions"], 0);
        assert_eq!(json["hitRate"], 0.0);
    }
}
