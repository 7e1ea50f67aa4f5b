//! Persistent Tier
//!
//! Disk-backed spillover store. Each entry is written to its own record file
//! named by the SHA-1 of its key; `index.json` maps keys to record names and is
//! rewritten wholesale on every mutation. The index can always be rebuilt from
//! the records, since every record embeds its key.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use sha1::{Digest, Sha1};
use tracing::{debug, info, trace, warn};

use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};

/// Subdirectory holding one record per key
const RECORDS_DIR: &str = "records";

/// Index file name (relative to the storage root)
const INDEX_FILE: &str = "index.json";

const RECORD_EXTENSION: &str = "json";
const TEMP_SUFFIX: &str = ".tmp";

/// Key to record file name
type Index = HashMap<String, String>;

/// On-disk tier with a self-healing index
pub struct PersistentTier {
    /// Storage root
    root: PathBuf,
    /// Directory holding record files
    records_dir: PathBuf,
    /// In-memory copy of the index file
    index: Mutex<Index>,
}

impl PersistentTier {
    /// Open (or create) a persistent tier rooted at `root`
    ///
    /// Removes stale temp files, then loads the index. A missing or unreadable
    /// index is rebuilt by scanning the record files.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let records_dir = root.join(RECORDS_DIR);
        fs::create_dir_all(&records_dir)?;

        let tier = Self {
            root,
            records_dir,
            index: Mutex::new(Index::new()),
        };

        tier.cleanup();

        match tier.read_index() {
            Ok(index) => {
                *tier.lock() = index;
            }
            Err(e) => {
                match &e {
                    CacheError::Io(io) if io.kind() == ErrorKind::NotFound => {
                        debug!("No index file found, rebuilding from records");
                    }
                    _ => warn!(error = %e, "Index unreadable, rebuilding from records"),
                }
                tier.rebuild_index();
            }
        }

        info!(
            storage_dir = %tier.root.display(),
            entries = tier.len(),
            "Persistent tier initialized"
        );

        Ok(tier)
    }

    fn lock(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record file name for a key: 40 hex chars plus extension
    pub fn record_name(key: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(key.as_bytes());
        format!("{:x}.{}", hasher.finalize(), RECORD_EXTENSION)
    }

    /// Persist an evicted entry
    ///
    /// Writes the record before touching the index, so an interrupted spill
    /// leaves at worst an orphan record. Failures are logged and swallowed.
    pub fn spill(&self, key: &str, entry: &CacheEntry) {
        let name = Self::record_name(key);

        if let Err(e) = self.write_record(&name, entry) {
            warn!(key = key, record = %name, error = %e, "Failed to spill entry to disk");
            return;
        }

        let mut index = self.lock();
        index.insert(key.to_string(), name);
        if let Err(e) = self.write_index(&index) {
            warn!(key = key, error = %e, "Failed to persist index after spill");
        }
        debug!(key = key, entries = index.len(), "Spilled entry to persistent tier");
    }

    /// Load an entry by key
    ///
    /// Stale index entries (missing record) and corrupt records are purged
    /// from the index and reported as misses. Loaded entries are never hydrated.
    pub fn load(&self, key: &str) -> Option<CacheEntry> {
        let name = self.lock().get(key).cloned()?;
        let path = self.records_dir.join(&name);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(key = key, record = %name, "Record missing, dropping stale index entry");
                self.forget(key);
                return None;
            }
            Err(e) => {
                warn!(key = key, record = %name, error = %e, "Failed to read record");
                return None;
            }
        };

        match Self::decode_record(key, &bytes) {
            Ok(entry) => {
                trace!(key = key, "Persistent tier HIT");
                Some(entry)
            }
            Err(e) => {
                warn!(key = key, record = %name, error = %e, "Purging corrupt record");
                let _ = fs::remove_file(&path);
                self.forget(key);
                None
            }
        }
    }

    fn decode_record(key: &str, bytes: &[u8]) -> Result<CacheEntry> {
        let entry: CacheEntry =
            serde_json::from_slice(bytes).map_err(|e| CacheError::RecordCorrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        if entry.key() != key {
            return Err(CacheError::RecordCorrupt {
                key: key.to_string(),
                reason: format!("record belongs to '{}'", entry.key()),
            });
        }
        Ok(entry)
    }

    /// Delete a key's record and index entry
    ///
    /// Returns true if the key was indexed or its record existed.
    pub fn remove(&self, key: &str) -> bool {
        let mut index = self.lock();
        let indexed = index.remove(key);
        let was_indexed = indexed.is_some();
        let name = indexed.unwrap_or_else(|| Self::record_name(key));

        let removed_file = match fs::remove_file(self.records_dir.join(&name)) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                warn!(key = key, record = %name, error = %e, "Failed to delete record");
                false
            }
        };

        if was_indexed {
            if let Err(e) = self.write_index(&index) {
                warn!(key = key, error = %e, "Failed to persist index after removal");
            }
        }

        debug!(key = key, "Removed entry from persistent tier");
        was_indexed || removed_file
    }

    /// Delete every indexed record and empty the index
    pub fn clear(&self) -> usize {
        let mut index = self.lock();
        let count = index.len();

        for name in index.values() {
            let path = self.records_dir.join(name);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(record = %name, error = %e, "Failed to delete record");
                }
            }
        }

        index.clear();
        if let Err(e) = self.write_index(&index) {
            warn!(error = %e, "Failed to persist index after clear");
        }

        debug!(count = count, "Cleared persistent tier");
        count
    }

    /// Rebuild the index by reading every record's embedded key
    ///
    /// Unreadable records are skipped. Returns the number of keys recovered.
    pub fn rebuild_index(&self) -> usize {
        let mut rebuilt = Index::new();

        match fs::read_dir(&self.records_dir) {
            Ok(read_dir) => {
                for dir_entry in read_dir.flatten() {
                    let path = dir_entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                        continue;
                    }
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    match Self::read_embedded_key(&path) {
                        Ok(key) => {
                            rebuilt.insert(key, name.to_string());
                        }
                        Err(e) => {
                            warn!(record = %name, error = %e, "Skipping unreadable record");
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to scan records directory"),
        }

        let count = rebuilt.len();
        let mut index = self.lock();
        *index = rebuilt;
        if let Err(e) = self.write_index(&index) {
            warn!(error = %e, "Failed to persist rebuilt index");
        }

        info!(entries = count, "Rebuilt persistent index");
        count
    }

    fn read_embedded_key(path: &Path) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct KeyOnly {
            key: String,
        }

        let bytes = fs::read(path)?;
        let record: KeyOnly = serde_json::from_slice(&bytes)?;
        Ok(record.key)
    }

    /// Whether the index knows this key
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Snapshot of indexed keys
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Get the storage root
    pub fn storage_directory(&self) -> &Path {
        &self.root
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn read_index(&self) -> Result<Index> {
        let bytes = fs::read(self.index_path())?;
        serde_json::from_slice(&bytes).map_err(|e| CacheError::IndexCorrupt(e.to_string()))
    }

    fn write_index(&self, index: &Index) -> Result<()> {
        let json = serde_json::to_vec_pretty(index)?;
        write_atomic(&self.root, &self.index_path(), &json)
    }

    fn write_record(&self, name: &str, entry: &CacheEntry) -> Result<()> {
        let json = serde_json::to_vec(entry)?;
        write_atomic(&self.records_dir, &self.records_dir.join(name), &json)
    }

    /// Drop a key from the index and persist the change
    fn forget(&self, key: &str) {
        let mut index = self.lock();
        if index.remove(key).is_some() {
            if let Err(e) = self.write_index(&index) {
                warn!(key = key, error = %e, "Failed to persist index after repair");
            }
        }
    }

    /// Remove temp files left behind by interrupted writes
    fn cleanup(&self) {
        for dir in [&self.root, &self.records_dir] {
            let Ok(read_dir) = fs::read_dir(dir) else {
                continue;
            };
            for entry in read_dir.flatten() {
                let path = entry.path();
                let is_temp = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(TEMP_SUFFIX));
                if is_temp {
                    debug!(path = %path.display(), "Removing stale temp file");
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }
}

/// Write `data` to `target` via a temp file in `dir` and an atomic rename
fn write_atomic(dir: &Path, target: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = tempfile::Builder::new()
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)
        .map_err(|e| CacheError::StorageWrite(format!("temp file in {}: {e}", dir.display())))?;

    tmp.write_all(data)
        .map_err(|e| CacheError::StorageWrite(format!("write {}: {e}", target.display())))?;

    tmp.persist(target)
        .map_err(|e| CacheError::StorageWrite(format!("persist {}: {e}", target.display())))?;

    Ok(())
}
