//! Cache entry model
//!
//! A `CacheEntry` is the unit stored by every tier. Only its persisted subset
//! crosses the disk boundary; resolved artifacts are process-local handles and
//! always come back empty after a load.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Opaque parameters attached to an entry
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Resolved artifacts keyed by reference path
pub type ArtifactMap = HashMap<String, ArtifactHandle>;

/// Opaque, process-local handle to a resolved artifact
#[derive(Clone)]
pub struct ArtifactHandle(Arc<dyn Any + Send + Sync>);

impl ArtifactHandle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Borrow the artifact as a concrete type
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Whether both handles point at the same artifact
    pub fn ptr_eq(&self, other: &ArtifactHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ArtifactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ArtifactHandle(..)")
    }
}

/// Best-effort descriptive metadata, never needed for correctness
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryTags {
    /// Structural notation describing the referenced artifacts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notation: Option<String>,
    /// Free-text description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A cached set of reference paths plus their (transient) resolved artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    key: String,
    reference_paths: Vec<String>,
    #[serde(default)]
    params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tags: Option<EntryTags>,
    created_at: SystemTime,
    last_accessed_at: SystemTime,
    #[serde(default)]
    access_count: u64,
    #[serde(skip)]
    resolved_artifacts: ArtifactMap,
    #[serde(skip)]
    hydrated: bool,
    /// Stamp of the memory tier slot this copy was read from
    #[serde(skip)]
    revision: u64,
}

impl CacheEntry {
    /// Create an unhydrated entry with empty params and no tags
    pub fn new(key: impl Into<String>, reference_paths: Vec<String>) -> Self {
        let now = SystemTime::now();
        Self {
            key: key.into(),
            reference_paths,
            params: Params::new(),
            tags: None,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            resolved_artifacts: ArtifactMap::new(),
            hydrated: false,
            revision: 0,
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_tags(mut self, tags: EntryTags) -> Self {
        self.tags = Some(tags);
        self
    }

    /// Attach artifacts resolved by the caller; marks the entry hydrated
    pub fn with_artifacts(mut self, artifacts: ArtifactMap) -> Self {
        self.resolved_artifacts = artifacts;
        self.hydrated = true;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn reference_paths(&self) -> &[String] {
        &self.reference_paths
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn tags(&self) -> Option<&EntryTags> {
        self.tags.as_ref()
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn last_accessed_at(&self) -> SystemTime {
        self.last_accessed_at
    }

    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    pub fn resolved_artifacts(&self) -> &ArtifactMap {
        &self.resolved_artifacts
    }

    /// Look up one resolved artifact by its reference path
    pub fn artifact(&self, path: &str) -> Option<&ArtifactHandle> {
        self.resolved_artifacts.get(path)
    }

    /// True once a hydration attempt has completed, even if it found nothing
    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    /// Record a successful read
    pub(crate) fn touch(&mut self) {
        self.last_accessed_at = SystemTime::now();
        self.access_count += 1;
    }

    /// Fill in the notation tag unless one is already present
    pub(crate) fn set_notation_if_absent(&mut self, notation: String) {
        let tags = self.tags.get_or_insert_with(EntryTags::default);
        if tags.notation.is_none() {
            tags.notation = Some(notation);
        }
    }

    pub(crate) fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    /// Take over another copy's hydration state, keeping everything else
    pub(crate) fn adopt_hydration(&mut self, from: &CacheEntry) {
        self.resolved_artifacts = from.resolved_artifacts.clone();
        self.hydrated = from.hydrated;
    }

    pub(crate) fn insert_artifact(&mut self, path: String, handle: ArtifactHandle) {
        self.resolved_artifacts.insert(path, handle);
    }

    /// Close a hydration attempt
    ///
    /// An attempt cut short before any artifact resolved leaves the entry
    /// unhydrated; any resolved artifact always marks it hydrated.
    pub(crate) fn finish_hydration(&mut self, completed: bool) {
        if completed || !self.resolved_artifacts.is_empty() {
            self.hydrated = true;
        }
    }
}
