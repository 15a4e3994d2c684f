//! Per-bucket configuration (§6): the `fhir-config` document at
//! `bucket.Admin.config`, cached read-mostly and invalidated per-bucket
//! (§5) — the same "immutable snapshot behind an `Arc`, swapped on
//! invalidation" shape `octofhir-search`'s reloadable registries use.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::gateway::ClusterGateway;

/// The scope `fhir-config` is read from (`bucket.Admin.config`, §6).
pub const CONFIG_SCOPE: &str = "Admin";
pub const CONFIG_COLLECTION: &str = "config";
pub const CONFIG_KEY: &str = "fhir-config";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    Strict,
    Lenient,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationConfig {
    pub mode: ValidationMode,
    #[serde(default)]
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationBy {
    Size,
    Days,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsConfig {
    #[serde(default)]
    pub enable_system: bool,
    #[serde(default, rename = "enableCRUDAudit")]
    pub enable_crud_audit: bool,
    #[serde(default)]
    pub enable_search_audit: bool,
    pub rotation_by: RotationBy,
    pub number: u32,
    #[serde(default)]
    pub s3_endpoint: Option<String>,
}

/// The per-bucket FHIR configuration document (§6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FhirConfig {
    pub fhir_release: String,
    pub validation: ValidationConfig,
    pub logs: LogsConfig,
}

/// Loads and caches [`FhirConfig`] per bucket. Absence of the document means
/// the bucket is "not FHIR-enabled" — a terminal error for any data-path
/// operation against it (§6).
pub struct ConfigCache {
    entries: dashmap::DashMap<String, Arc<FhirConfig>>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self {
            entries: dashmap::DashMap::new(),
        }
    }

    /// Return the cached config for `bucket`, loading it from the gateway on
    /// a cache miss.
    pub async fn get(&self, gateway: &dyn ClusterGateway, bucket: &str) -> Result<Arc<FhirConfig>, CoreError> {
        if let Some(cached) = self.entries.get(bucket) {
            return Ok(Arc::clone(&cached));
        }

        let loaded = Arc::new(load(gateway, bucket).await?);
        self.entries.insert(bucket.to_string(), Arc::clone(&loaded));
        Ok(loaded)
    }

    /// Drop `bucket`'s cached config, forcing the next `get` to reload it
    /// (§5: "mutations invalidate entries by bucket").
    pub fn invalidate(&self, bucket: &str) {
        self.entries.remove(bucket);
    }
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self::new()
    }
}

async fn load(gateway: &dyn ClusterGateway, bucket: &str) -> Result<FhirConfig, CoreError> {
    let bytes = gateway
        .kv_get(bucket, CONFIG_SCOPE, CONFIG_COLLECTION, CONFIG_KEY)
        .await?
        .ok_or_else(|| CoreError::validation(format!("bucket {bucket} is not FHIR-enabled: no {CONFIG_KEY} document")))?;

    serde_json::from_slice(&bytes).map_err(|e| CoreError::internal(format!("malformed fhir-config for {bucket}: {e}")))
}

/// A single-slot variant of [`ConfigCache`] for callers that only ever serve
/// one bucket (e.g. a dedicated tenant process) and want lock-free reads
/// between invalidations, matching `arc_swap`'s intended use for
/// hot-reloadable config.
pub struct SingleBucketConfig {
    slot: ArcSwapOption<FhirConfig>,
}

impl SingleBucketConfig {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
        }
    }

    pub fn current(&self) -> Option<Arc<FhirConfig>> {
        self.slot.load_full()
    }

    pub fn replace(&self, config: FhirConfig) {
        self.slot.store(Some(Arc::new(config)));
    }
}

impl Default for SingleBucketConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryGateway;

    fn sample_config() -> FhirConfig {
        FhirConfig {
            fhir_release: "R4".to_string(),
            validation: ValidationConfig {
                mode: ValidationMode::Strict,
                profile: None,
            },
            logs: LogsConfig {
                enable_system: true,
                enable_crud_audit: true,
                enable_search_audit: false,
                rotation_by: RotationBy::Days,
                number: 7,
                s3_endpoint: None,
            },
        }
    }

    #[tokio::test]
    async fn missing_config_document_is_a_validation_error() {
        let gateway = InMemoryGateway::new();
        let cache = ConfigCache::new();
        let err = cache.get(&gateway, "acme").await.unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[tokio::test]
    async fn loaded_config_is_cached_across_calls() {
        let gateway = InMemoryGateway::new();
        let bytes = bytes::Bytes::from(serde_json::to_vec(&sample_config()).unwrap());
        gateway.seed_document("acme", CONFIG_SCOPE, CONFIG_COLLECTION, CONFIG_KEY, bytes);

        let cache = ConfigCache::new();
        let first = cache.get(&gateway, "acme").await.unwrap();
        assert_eq!(first.fhir_release, "R4");

        // Remove the backing document; the cached value should still serve.
        gateway
            .kv_remove("acme", CONFIG_SCOPE, CONFIG_COLLECTION, CONFIG_KEY)
            .await
            .unwrap();
        let second = cache.get(&gateway, "acme").await.unwrap();
        assert_eq!(second.fhir_release, "R4");

        cache.invalidate("acme");
        assert!(cache.get(&gateway, "acme").await.is_err());
    }

    #[test]
    fn single_bucket_config_starts_empty() {
        let config = SingleBucketConfig::new();
        assert!(config.current().is_none());
        config.replace(sample_config());
        assert!(config.current().is_some());
    }
}
