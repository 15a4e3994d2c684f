//! The six-phase search pipeline (§4.6): compile, execute FTS, paginate,
//! batch KV, include expansion, emit. Grounded in the shape of
//! `octofhir-search::engine`'s `SearchEngine::execute` — a thin, mostly
//! static orchestrator over a `SearchConfig` the caller builds once and
//! shares across requests — generalized from its single Postgres-storage
//! call to this crate's gateway + FTS + KV split.

use std::sync::Arc;

use crate::batch::{fan_out, group_by_resource_type, reorder_by_keys, DEFAULT_CONCURRENCY};
use crate::error::CoreError;
use crate::gateway::{ClusterGateway, FtsOptions, FtsQuery, MatchKind, SortDirection, SortSpec, RESOURCES_SCOPE};
use crate::include::{self, IncludeDirective, IncludeExpansion};
use crate::model::{DocumentKey, StoredDocument};
use crate::pagination::{PaginationState, PaginationStore};
use crate::routing::{fully_qualify, ResourceMapping};

use super::params::{compile_criterion, ParsedCriterion, SearchParamRegistry};

/// `_summary` (§4.6): purely serializer-visible, carried through unused by
/// this crate's own logic beyond validating the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryMode {
    True,
    False,
    Text,
    Data,
    Count,
}

impl SummaryMode {
    pub fn parse(raw: &str) -> Result<SummaryMode, CoreError> {
        match raw {
            "true" => Ok(SummaryMode::True),
            "false" => Ok(SummaryMode::False),
            "text" => Ok(SummaryMode::Text),
            "data" => Ok(SummaryMode::Data),
            "count" => Ok(SummaryMode::Count),
            other => Err(CoreError::validation(format!("unsupported _summary value: {other:?}"))),
        }
    }
}

/// `_total` (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotalMode {
    None,
    Estimate,
    Accurate,
}

impl TotalMode {
    pub fn parse(raw: &str) -> Result<TotalMode, CoreError> {
        match raw {
            "none" => Ok(TotalMode::None),
            "estimate" => Ok(TotalMode::Estimate),
            "accurate" => Ok(TotalMode::Accurate),
            other => Err(CoreError::validation(format!("unsupported _total value: {other:?}"))),
        }
    }
}

/// Search-wide tuning, loaded once and shared read-only across requests
/// (mirrors `octofhir-search`'s `SearchConfig`).
#[derive(Clone)]
pub struct SearchConfig {
    pub registry: Arc<SearchParamRegistry>,
    pub default_count: usize,
    pub max_count: usize,
    /// Upper cap on how many ordered keys a single FTS execution requests,
    /// for pagination continuity (§4.6 step 2).
    pub fts_key_cap: usize,
}

impl SearchConfig {
    pub fn new(registry: Arc<SearchParamRegistry>) -> Self {
        Self {
            registry,
            default_count: 20,
            max_count: 100,
            fts_key_cap: 1000,
        }
    }
}

/// A fully parsed search request, independent of how the REST surface
/// extracted its query string.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub resource_type: String,
    pub criteria: Vec<ParsedCriterion>,
    pub includes: Vec<IncludeDirective>,
    pub sort: Vec<String>,
    pub count: Option<usize>,
    pub summary: Option<SummaryMode>,
    pub elements: Option<Vec<String>>,
    pub total: TotalModeOrDefault,
}

/// `_total` defaults to `None` per the FHIR base spec; modeled as its own
/// type so `SearchRequest::default()` doesn't need a `TotalMode` default impl.
pub type TotalModeOrDefault = Option<TotalMode>;

/// The result of running the pipeline: enough for a caller to build a
/// searchset Bundle (via [`crate::fast_bundle`]) without re-querying anything.
#[derive(Debug, Default)]
pub struct SearchOutcome {
    pub primary: Vec<StoredDocument>,
    pub included: Vec<StoredDocument>,
    pub total: Option<u64>,
    pub pagination_token: Option<String>,
    pub has_more: bool,
    pub include_truncated: bool,
}

pub struct SearchEngine;

impl SearchEngine {
    /// Run all six phases of §4.6 against one resource type.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        gateway: &dyn ClusterGateway,
        mapping: &dyn ResourceMapping,
        pagination: &dyn PaginationStore,
        bucket: &str,
        request: SearchRequest,
        config: &SearchConfig,
    ) -> Result<SearchOutcome, CoreError> {
        if !mapping.is_supported(&request.resource_type) {
            return Err(CoreError::validation(format!(
                "unsupported resource type: {}",
                request.resource_type
            )));
        }

        let page_size = match request.count {
            Some(0) => 0,
            Some(n) => n.min(config.max_count),
            None => config.default_count,
        };
        let total_mode = request.total.unwrap_or(TotalMode::None);

        // Phase 1: compile.
        let query = Self::compile(&config.registry, mapping, &request)?;

        // Phase 2: execute FTS.
        let index = mapping.fts_index(&request.resource_type).ok_or_else(|| {
            CoreError::validation(format!("no FTS index configured for {}", request.resource_type))
        })?;
        let fq_index = fully_qualify(index, bucket);
        let sort = Self::compile_sort(&request.sort)?;
        let options = FtsOptions {
            limit: config.fts_key_cap,
            skip: 0,
            sort,
            disable_scoring: true,
            include_locations: false,
            ..FtsOptions::default()
        };
        let fts_result = gateway.search_query(&fq_index, query, options).await?;
        let total = match total_mode {
            TotalMode::None => None,
            TotalMode::Estimate | TotalMode::Accurate => {
                fts_result.total_rows.or(Some(fts_result.row_ids.len() as u64))
            }
        };

        if page_size == 0 {
            return Ok(SearchOutcome {
                primary: Vec::new(),
                included: Vec::new(),
                total,
                pagination_token: None,
                has_more: false,
                include_truncated: false,
            });
        }

        // Phase 3: paginate.
        let all_keys = fts_result.row_ids;
        let (page_keys, pagination_token, has_more) = if all_keys.len() > page_size {
            let state: PaginationState = pagination.register(bucket, all_keys, page_size);
            let page = state.page(0).to_vec();
            let has_more = state.has_more(0);
            (page, Some(state.token.clone()), has_more)
        } else {
            (all_keys, None, false)
        };

        // Phase 4: batch KV, grouped by resource type (normally a single
        // group for a non-shared collection, but shared collections like
        // `General` can mix types within one page).
        let primary = Self::batch_fetch(gateway, mapping, bucket, &page_keys).await?;

        // Phase 5: include expansion.
        let IncludeExpansion { documents: included, truncated } = if request.includes.is_empty() {
            IncludeExpansion::default()
        } else {
            include::expand(gateway, mapping, &config.registry, bucket, &primary, &request.includes).await?
        };

        Ok(SearchOutcome {
            primary,
            included,
            total,
            pagination_token,
            has_more,
            include_truncated: truncated,
        })
    }

    /// Phase 1: compile criteria into a conjunction, adding a `resourceType`
    /// discriminator when this type shares its target collection with
    /// another mapped type (§4.6).
    fn compile(
        registry: &SearchParamRegistry,
        mapping: &dyn ResourceMapping,
        request: &SearchRequest,
    ) -> Result<FtsQuery, CoreError> {
        let mut clauses: Vec<FtsQuery> = request
            .criteria
            .iter()
            .map(|criterion| compile_criterion(registry, &request.resource_type, criterion))
            .collect::<Result<_, _>>()?;

        if Self::shares_collection(mapping, &request.resource_type)? {
            clauses.push(FtsQuery::term("resourceType", request.resource_type.clone(), MatchKind::Exact));
        }

        Ok(FtsQuery::and(clauses))
    }

    fn shares_collection(mapping: &dyn ResourceMapping, resource_type: &str) -> Result<bool, CoreError> {
        let collection = mapping.target_collection(resource_type)?;
        let sharers = mapping
            .mapped_types()
            .into_iter()
            .filter(|other| mapping.target_collection(other).map(|c| c == collection).unwrap_or(false))
            .count();
        Ok(sharers > 1)
    }

    fn compile_sort(raw: &[String]) -> Result<Vec<SortSpec>, CoreError> {
        raw.iter()
            .map(|term| {
                let (direction, field) = match term.strip_prefix('-') {
                    Some(rest) => (SortDirection::Descending, rest),
                    None => (SortDirection::Ascending, term.as_str()),
                };
                let path = match field {
                    "_lastUpdated" => "meta.lastUpdated",
                    "_id" => "id",
                    other => other,
                };
                Ok(SortSpec {
                    path: path.to_string(),
                    direction,
                })
            })
            .collect()
    }

    /// Phase 4: batch KV fetch of `keys`, grouped by resource type so a
    /// shared-collection page still issues one gateway call per collection.
    async fn batch_fetch(
        gateway: &dyn ClusterGateway,
        mapping: &dyn ResourceMapping,
        bucket: &str,
        keys: &[String],
    ) -> Result<Vec<StoredDocument>, CoreError> {
        let groups = group_by_resource_type(keys.to_vec());
        let fetched = fan_out(groups, DEFAULT_CONCURRENCY, |(resource_type, group_keys)| {
            let bucket = bucket.to_string();
            async move {
                let collection = match mapping.target_collection(&resource_type) {
                    Ok(c) => c.to_string(),
                    Err(err) => return Err(err),
                };
                let rows = gateway
                    .kv_get_many(&bucket, RESOURCES_SCOPE, &collection, &group_keys)
                    .await?;
                let docs = rows
                    .into_iter()
                    .filter_map(|(key, bytes)| {
                        let bytes = bytes?;
                        let parsed: DocumentKey = key.parse().ok()?;
                        StoredDocument::from_bytes(parsed, bytes).ok()
                    })
                    .collect::<Vec<_>>();
                Ok::<_, CoreError>(docs)
            }
        })
        .await;

        let mut flattened = Vec::new();
        for result in fetched {
            flattened.extend(result?);
        }
        Ok(reorder_by_keys(keys, flattened))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::FtsResult;
    use crate::routing::StaticResourceMapping;
    use crate::search::{SearchParamDef, SearchParamKind};
    use crate::testing::InMemoryGateway;
    use crate::pagination::InMemoryPaginationStore;

    fn registry() -> Arc<SearchParamRegistry> {
        Arc::new(SearchParamRegistry::new().with(
            "Patient",
            SearchParamDef {
                name: "name".into(),
                kind: SearchParamKind::String,
                path: "name.family".into(),
            },
        ))
    }

    fn mapping() -> StaticResourceMapping {
        StaticResourceMapping::new().with("Patient", "Patient", Some("patientIndex".into()))
    }

    #[tokio::test]
    async fn unsupported_type_is_rejected() {
        let gateway = InMemoryGateway::new();
        let pagination = InMemoryPaginationStore::default();
        let config = SearchConfig::new(registry());
        let request = SearchRequest {
            resource_type: "Frobnitz".into(),
            ..Default::default()
        };
        let err = SearchEngine::execute(&gateway, &mapping(), &pagination, "acme", request, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[tokio::test]
    async fn count_zero_with_accurate_total_returns_count_only() {
        let gateway = InMemoryGateway::new();
        gateway.seed_fts_result(
            "acme.Resources.patientIndex",
            FtsResult {
                row_ids: vec!["Patient/1".into(), "Patient/2".into()],
                total_rows: Some(2),
                server_took_ms: 1,
                errors: vec![],
            },
        );
        let pagination = InMemoryPaginationStore::default();
        let config = SearchConfig::new(registry());
        let request = SearchRequest {
            resource_type: "Patient".into(),
            count: Some(0),
            total: Some(TotalMode::Accurate),
            ..Default::default()
        };
        let outcome = SearchEngine::execute(&gateway, &mapping(), &pagination, "acme", request, &config)
            .await
            .unwrap();
        assert_eq!(outcome.total, Some(2));
        assert!(outcome.primary.is_empty());
    }

    #[tokio::test]
    async fn page_under_size_needs_no_pagination_token() {
        let gateway = InMemoryGateway::new();
        gateway.seed_document(
            "acme",
            RESOURCES_SCOPE,
            "Patient",
            "Patient/1",
            bytes::Bytes::from_static(br#"{"resourceType":"Patient","id":"1"}"#),
        );
        gateway.seed_fts_result(
            "acme.Resources.patientIndex",
            FtsResult {
                row_ids: vec!["Patient/1".into()],
                total_rows: Some(1),
                server_took_ms: 1,
                errors: vec![],
            },
        );
        let pagination = InMemoryPaginationStore::default();
        let config = SearchConfig::new(registry());
        let request = SearchRequest {
            resource_type: "Patient".into(),
            count: Some(20),
            ..Default::default()
        };
        let outcome = SearchEngine::execute(&gateway, &mapping(), &pagination, "acme", request, &config)
            .await
            .unwrap();
        assert_eq!(outcome.primary.len(), 1);
        assert!(outcome.pagination_token.is_none());
        assert!(!outcome.has_more);
    }

    #[tokio::test]
    async fn oversized_result_registers_pagination_state() {
        let gateway = InMemoryGateway::new();
        let row_ids: Vec<String> = (0..5).map(|i| format!("Patient/{i}")).collect();
        for id in &row_ids {
            gateway.seed_document(
                "acme",
                RESOURCES_SCOPE,
                "Patient",
                id,
                bytes::Bytes::from(format!(r#"{{"resourceType":"Patient","id":"{id}"}}"#)),
            );
        }
        gateway.seed_fts_result(
            "acme.Resources.patientIndex",
            FtsResult {
                row_ids,
                total_rows: Some(5),
                server_took_ms: 1,
                errors: vec![],
            },
        );
        let pagination = InMemoryPaginationStore::default();
        let config = SearchConfig::new(registry());
        let request = SearchRequest {
            resource_type: "Patient".into(),
            count: Some(2),
            ..Default::default()
        };
        let outcome = SearchEngine::execute(&gateway, &mapping(), &pagination, "acme", request, &config)
            .await
            .unwrap();
        assert_eq!(outcome.primary.len(), 2);
        assert!(outcome.pagination_token.is_some());
        assert!(outcome.has_more);
    }
}
