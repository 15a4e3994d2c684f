//! Routing & Mapping (§4.1): resource type → collection → FTS index, the
//! single source of truth every other component resolves through.
//!
//! The mapping file itself is an external collaborator (§1); this
//! module defines the trait callers implement to expose it, plus an
//! in-memory reference implementation loaded once at startup and handed out
//! as an `Arc`, the way `octofhir-search::registry::SearchParameterRegistry`
//! is loaded once and shared read-only thereafter.

use std::collections::HashMap;

use crate::error::CoreError;

/// Two collections every bucket reserves regardless of the mapping file.
pub const VERSIONS_COLLECTION: &str = "Versions";
pub const TOMBSTONES_COLLECTION: &str = "Tombstones";

/// Type → collection → FTS index routing, read-only after startup.
pub trait ResourceMapping: Send + Sync {
    /// The physical collection a resource type's live documents live in.
    fn target_collection(&self, resource_type: &str) -> Result<&str, CoreError>;

    /// The FTS index serving reads against that collection, if any is configured.
    fn fts_index(&self, resource_type: &str) -> Option<&str>;

    /// The FTS index backing a physical collection directly, for callers
    /// (`$everything`'s collection fan-out, §4.8) that iterate collections
    /// rather than resource types. Any resource type mapped onto the
    /// collection resolves the same index.
    fn fts_index_for_collection(&self, collection: &str) -> Option<&str>;

    /// Whether this resource type is mapped at all.
    fn is_supported(&self, resource_type: &str) -> bool;

    /// Every mapped resource type, for `$everything`'s collection fan-out (§4.8).
    fn mapped_types(&self) -> Vec<&str>;

    /// Every distinct target collection except `Versions`/`Tombstones`, for
    /// `$everything`'s default collection set.
    fn mapped_collections(&self) -> Vec<&str>;
}

/// `"{bucket}.Resources.{index}"` (§4.1).
pub fn fully_qualify(index: &str, bucket: &str) -> String {
    format!("{bucket}.Resources.{index}")
}

/// A single entry in the mapping file: one resource type's routing.
#[derive(Debug, Clone)]
pub struct MappingEntry {
    pub collection: String,
    pub fts_index: Option<String>,
}

/// An in-memory mapping loaded once from the external mapping file and
/// shared read-only (via `Arc`) across requests.
#[derive(Debug, Clone, Default)]
pub struct StaticResourceMapping {
    entries: HashMap<String, MappingEntry>,
}

impl StaticResourceMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        resource_type: impl Into<String>,
        collection: impl Into<String>,
        fts_index: Option<String>,
    ) -> &mut Self {
        self.entries.insert(
            resource_type.into(),
            MappingEntry {
                collection: collection.into(),
                fts_index,
            },
        );
        self
    }

    pub fn with(
        mut self,
        resource_type: impl Into<String>,
        collection: impl Into<String>,
        fts_index: Option<String>,
    ) -> Self {
        self.insert(resource_type, collection, fts_index);
        self
    }
}

impl ResourceMapping for StaticResourceMapping {
    fn target_collection(&self, resource_type: &str) -> Result<&str, CoreError> {
        self.entries
            .get(resource_type)
            .map(|entry| entry.collection.as_str())
            .ok_or_else(|| CoreError::validation(format!("unsupported resource type: {resource_type}")))
    }

    fn fts_index(&self, resource_type: &str) -> Option<&str> {
        self.entries.get(resource_type)?.fts_index.as_deref()
    }

    fn fts_index_for_collection(&self, collection: &str) -> Option<&str> {
        self.entries
            .values()
            .find(|entry| entry.collection == collection)?
            .fts_index
            .as_deref()
    }

    fn is_supported(&self, resource_type: &str) -> bool {
        self.entries.contains_key(resource_type)
    }

    fn mapped_types(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    fn mapped_collections(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        self.entries
            .values()
            .map(|entry| entry.collection.as_str())
            .filter(|collection| seen.insert(*collection))
            .collect()
    }
}
