//! `$everything` (§4.8): Patient-anchored cross-collection fan-out. A narrow
//! specialization of the search pipeline — one FTS query per non-excluded
//! collection instead of one query against a single type's index — so it is
//! grounded in the same gateway/pagination primitives as [`crate::search`]
//! rather than reusing `SearchEngine` itself (the per-collection query shape
//! doesn't fit the single-index compile step).

use crate::batch::{fan_out, group_by_resource_type, reorder_by_keys, DEFAULT_CONCURRENCY};
use crate::error::{CoreError, GoneReason};
use crate::gateway::{ClusterGateway, FtsOptions, FtsQuery, MatchKind, SortDirection, SortSpec, RESOURCES_SCOPE};
use crate::model::{DocumentKey, StoredDocument};
use crate::pagination::{PaginationState, PaginationStore};
use crate::routing::{fully_qualify, ResourceMapping, VERSIONS_COLLECTION, TOMBSTONES_COLLECTION};

/// Clinical-date fields `$everything` ranges over when `start`/`end` are given (§4.8).
pub const CLINICAL_DATE_FIELDS: &[&str] = &[
    "effectiveDateTime",
    "issued",
    "recordedDate",
    "performedDateTime",
    "occurrenceDateTime",
    "authoredOn",
];

/// `$everything` request parameters beyond the anchoring Patient id.
#[derive(Debug, Clone, Default)]
pub struct EverythingRequest {
    pub patient_id: String,
    /// Restrict the collection fan-out to these resource types; `None` means every mapped type.
    pub type_filter: Option<Vec<String>>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub since: Option<String>,
    pub count: Option<usize>,
}

#[derive(Debug, Default)]
pub struct EverythingOutcome {
    pub patient: StoredDocument,
    pub related: Vec<StoredDocument>,
    pub pagination_token: Option<String>,
    pub has_more: bool,
}

/// Run the four-step `$everything` protocol (§4.8).
pub async fn everything(
    gateway: &dyn ClusterGateway,
    mapping: &dyn ResourceMapping,
    pagination: &dyn PaginationStore,
    bucket: &str,
    request: EverythingRequest,
) -> Result<EverythingOutcome, CoreError> {
    // Step 1: read the anchoring Patient.
    let patient_key = DocumentKey::live("Patient", &request.patient_id);
    let patient_collection = mapping.target_collection("Patient")?.to_string();
    let patient_bytes = gateway
        .kv_get(bucket, RESOURCES_SCOPE, &patient_collection, &patient_key.to_string())
        .await?;
    let patient_bytes = match patient_bytes {
        Some(bytes) => bytes,
        None => {
            if tombstone_exists(gateway, bucket, &patient_key).await? {
                return Err(CoreError::gone("Patient", &request.patient_id, GoneReason::Tombstoned));
            }
            return Err(CoreError::not_found("Patient", &request.patient_id));
        }
    };
    let patient = StoredDocument::from_bytes(patient_key.clone(), patient_bytes)?;

    // Step 2: collections to query.
    let collections = collections_to_query(mapping, request.type_filter.as_deref());

    // Step 3: one FTS query per collection, fanned out with bounded concurrency.
    let reference = format!("Patient/{}", request.patient_id);
    let date_filter = build_date_filter(request.start.as_deref(), request.end.as_deref());
    let since_filter = request.since.clone();

    let per_collection_keys = fan_out(collections, DEFAULT_CONCURRENCY, |collection| {
        let reference = reference.clone();
        let date_filter = date_filter.clone();
        let since_filter = since_filter.clone();
        async move {
            match query_collection(gateway, mapping, bucket, &collection, &reference, date_filter, since_filter).await {
                Ok(keys) => keys,
                Err(err) => {
                    tracing::warn!(collection, error = %err, "$everything collection query failed, skipping");
                    Vec::new()
                }
            }
        }
    })
    .await;

    // Step 4: concatenate in stable collection order (`fan_out` re-sorts
    // back to input order after running the per-collection queries concurrently).
    let mut all_keys: Vec<String> = per_collection_keys.into_iter().flatten().collect();
    all_keys.retain(|key| key != &patient_key.to_string());

    // Step 5: first page plus pagination continuity.
    let page_size = request.count.unwrap_or(50).clamp(1, 200);
    let (page_keys, pagination_token, has_more) = if all_keys.len() > page_size {
        let state: PaginationState = pagination.register(bucket, all_keys, page_size);
        (state.page(0).to_vec(), Some(state.token.clone()), state.has_more(0))
    } else {
        (all_keys, None, false)
    };

    let related = batch_fetch(gateway, mapping, bucket, &page_keys).await?;

    Ok(EverythingOutcome {
        patient,
        related,
        pagination_token,
        has_more,
    })
}

fn collections_to_query(mapping: &dyn ResourceMapping, type_filter: Option<&[String]>) -> Vec<String> {
    let mut collections: Vec<String> = mapping
        .mapped_collections()
        .into_iter()
        .filter(|c| *c != VERSIONS_COLLECTION && *c != TOMBSTONES_COLLECTION)
        .map(str::to_string)
        .collect();

    if let Some(types) = type_filter {
        let allowed: std::collections::HashSet<String> = types
            .iter()
            .filter_map(|t| mapping.target_collection(t).ok().map(str::to_string))
            .collect();
        collections.retain(|c| allowed.contains(c));
    }
    collections
}

fn build_date_filter(start: Option<&str>, end: Option<&str>) -> Option<(String, String)> {
    match (start, end) {
        (None, None) => None,
        (start, end) => Some((start.unwrap_or_default().to_string(), end.unwrap_or_default().to_string())),
    }
}

async fn query_collection(
    gateway: &dyn ClusterGateway,
    mapping: &dyn ResourceMapping,
    bucket: &str,
    collection: &str,
    patient_reference: &str,
    date_filter: Option<(String, String)>,
    since: Option<String>,
) -> Result<Vec<String>, CoreError> {
    let index = match mapping.fts_index_for_collection(collection) {
        Some(index) => index,
        None => return Ok(Vec::new()),
    };
    let fq_index = fully_qualify(index, bucket);

    let mut clauses = vec![FtsQuery::or(vec![
        FtsQuery::term("patient.reference", patient_reference, MatchKind::Exact),
        FtsQuery::term("subject.reference", patient_reference, MatchKind::Exact),
    ])];

    if let Some((start, end)) = date_filter {
        let date_clauses: Vec<FtsQuery> = CLINICAL_DATE_FIELDS
            .iter()
            .map(|field| FtsQuery::DateRange {
                path: (*field).to_string(),
                start: if start.is_empty() { None } else { Some(start.clone()) },
                start_inclusive: true,
                end: if end.is_empty() { None } else { Some(end.clone()) },
                end_inclusive: true,
            })
            .collect();
        clauses.push(FtsQuery::or(date_clauses));
    }

    if let Some(since) = since {
        clauses.push(FtsQuery::DateRange {
            path: "meta.lastUpdated".to_string(),
            start: Some(since),
            start_inclusive: true,
            end: None,
            end_inclusive: false,
        });
    }

    let options = FtsOptions {
        sort: vec![SortSpec {
            path: "meta.lastUpdated".to_string(),
            direction: SortDirection::Descending,
        }],
        ..FtsOptions::default()
    };

    let result = gateway
        .search_query(&fq_index, FtsQuery::and(clauses), options)
        .await?;
    Ok(result.row_ids)
}

async fn tombstone_exists(
    gateway: &dyn ClusterGateway,
    bucket: &str,
    live_key: &DocumentKey,
) -> Result<bool, CoreError> {
    let bytes = gateway
        .kv_get(bucket, RESOURCES_SCOPE, TOMBSTONES_COLLECTION, &live_key.to_string())
        .await?;
    Ok(bytes.is_some())
}

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
