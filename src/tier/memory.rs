//! Memory Tier
//!
//! Capacity-bounded, recency-ordered entry store.
//! Entries live in an insertion-ordered map: the front is the least recently
//! touched entry, the back the most recent. Evicted entries are handed to the
//! spillover callback before the triggering insert completes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::entry::CacheEntry;

/// Callback invoked with every entry evicted under capacity pressure
pub type SpilloverFn = Box<dyn Fn(&str, &CacheEntry) + Send + Sync>;

/// In-process LRU tier
pub struct MemoryTier {
    /// Maximum number of entries
    capacity: usize,
    /// Entries in recency order (front = oldest)
    entries: Mutex<IndexMap<String, CacheEntry>>,
    /// Source of slot revisions; every write gets a fresh one
    revisions: AtomicU64,
    /// Receives evicted entries
    on_evict: SpilloverFn,
}

impl MemoryTier {
    /// Create a tier that drops evicted entries
    pub fn new(capacity: usize) -> Self {
        Self::with_spillover(capacity, Box::new(|_: &str, _: &CacheEntry| {}))
    }

    /// Create a tier with a spillover callback
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of entries held
    /// * `on_evict` - Called with `(key, entry)` for each LRU eviction
    pub fn with_spillover(capacity: usize, on_evict: SpilloverFn) -> Self {
        Self {
            capacity,
            entries: Mutex::new(IndexMap::with_capacity(capacity)),
            revisions: AtomicU64::new(1),
            on_evict,
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stamp(&self, entry: &mut CacheEntry) {
        entry.set_revision(self.revisions.fetch_add(1, Ordering::Relaxed));
    }

    /// Get an entry, marking it most recently used
    ///
    /// Increments the entry's access count and refreshes its access time.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut entries = self.lock();
        let index = entries.get_index_of(key)?;
        let last = entries.len() - 1;
        entries.move_index(index, last);
        let (_, entry) = entries.get_index_mut(last)?;
        entry.touch();
        trace!(key = key, "Memory tier HIT");
        Some(entry.clone())
    }

    /// Insert or replace an entry
    ///
    /// Replacing an existing key never evicts. Inserting a new key evicts the
    /// least recently used entries until there is room, spilling each one.
    pub fn put(&self, key: &str, mut entry: CacheEntry) {
        self.stamp(&mut entry);
        let mut entries = self.lock();

        if let Some(index) = entries.get_index_of(key) {
            let last = entries.len() - 1;
            entries.move_index(index, last);
            if let Some((_, slot)) = entries.get_index_mut(last) {
                *slot = entry;
            }
            trace!(key = key, "Replaced entry in memory tier");
            return;
        }

        self.insert_new(&mut entries, key, entry);
    }

    /// Insert an entry only if the key is not resident
    ///
    /// # Returns
    /// The resident entry (touched) if one was already there, otherwise the
    /// newly inserted entry
    pub fn put_if_absent(&self, key: &str, mut entry: CacheEntry) -> CacheEntry {
        self.stamp(&mut entry);
        let mut entries = self.lock();

        if let Some(index) = entries.get_index_of(key) {
            let last = entries.len() - 1;
            entries.move_index(index, last);
            if let Some((_, resident)) = entries.get_index_mut(last) {
                resident.touch();
                trace!(key = key, "Kept resident entry in memory tier");
                return resident.clone();
            }
        }

        self.insert_new(&mut entries, key, entry.clone());
        entry
    }

    fn insert_new(&self, entries: &mut IndexMap<String, CacheEntry>, key: &str, entry: CacheEntry) {
        while entries.len() >= self.capacity {
            let Some((evicted_key, evicted)) = entries.shift_remove_index(0) else {
                break;
            };
            debug!(key = %evicted_key, "Evicting LRU entry from memory tier");
            (self.on_evict)(&evicted_key, &evicted);
        }

        entries.insert(key.to_string(), entry);
        trace!(key = key, size = entries.len(), "Inserted entry into memory tier");
    }

    /// Record hydration results for a copy previously read from this tier
    ///
    /// Only applies if the slot still holds the revision `hydrated` was read
    /// from; a slot rewritten in the meantime is left alone. Recency and access
    /// counters are not changed.
    pub fn store_hydration(&self, key: &str, hydrated: &CacheEntry) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(slot) if slot.revision() == hydrated.revision() => {
                slot.adopt_hydration(hydrated);
                true
            }
            Some(_) => {
                debug!(key = key, "Entry rewritten during hydration, keeping newer copy");
                false
            }
            None => false,
        }
    }

    /// Remove an entry without spilling it
    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.lock().shift_remove(key)
    }

    /// Check membership without touching recency
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Drop every entry, returning how many were held
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        debug!(count = count, "Cleared memory tier");
        count
    }

    /// Snapshot of keys, least recently used first
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
