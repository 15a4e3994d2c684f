//! History (§4.9): `vread` and `history`, a narrow specialization of search
//! over the `Versions` collection/index rather than a mapped type's own.

use crate::batch::{fan_out, group_by_resource_type, reorder_by_keys, DEFAULT_CONCURRENCY};
use crate::error::CoreError;
use crate::gateway::{ClusterGateway, FtsOptions, FtsQuery, MatchKind, SortDirection, SortSpec, RESOURCES_SCOPE};
use crate::model::{DocumentKey, StoredDocument};
use crate::routing::{fully_qualify, ResourceMapping, VERSIONS_COLLECTION};

/// `GET Type/id/_history/vid`: a direct KV read in `Versions`.
pub async fn vread(
    gateway: &dyn ClusterGateway,
    bucket: &str,
    resource_type: &str,
    id: &str,
    version_id: &str,
) -> Result<StoredDocument, CoreError> {
    let key = DocumentKey::versioned(resource_type, id, version_id);
    let bytes = gateway
        .kv_get(bucket, RESOURCES_SCOPE, VERSIONS_COLLECTION, &key.to_string())
        .await?
        .ok_or_else(|| CoreError::not_found(resource_type, format!("{id}/_history/{version_id}")))?;
    StoredDocument::from_bytes(key, bytes)
}

/// `GET Type/id/_history`: current live revision (if any) plus every
/// archived version, newest first.
pub async fn history(
    gateway: &dyn ClusterGateway,
    mapping: &dyn ResourceMapping,
    bucket: &str,
    resource_type: &str,
    id: &str,
    since: Option<&str>,
) -> Result<Vec<StoredDocument>, CoreError> {
    // (a) current live, if any.
    let collection = mapping.target_collection(resource_type)?.to_string();
    let live_key = DocumentKey::live(resource_type, id);
    let live = gateway
        .kv_get(bucket, RESOURCES_SCOPE, &collection, &live_key.to_string())
        .await?
        .map(|bytes| StoredDocument::from_bytes(live_key.clone(), bytes))
        .transpose()?;

    // (b) FTS on the Versions index.
    let versions_index = mapping.fts_index_for_collection(VERSIONS_COLLECTION);
    let archived_keys = if let Some(index) = versions_index {
        let fq_index = fully_qualify(index, bucket);
        let mut clauses = vec![
            FtsQuery::term("resourceType", resource_type, MatchKind::Exact),
            FtsQuery::term("id", id, MatchKind::Exact),
        ];
        if let Some(since) = since {
            clauses.push(FtsQuery::DateRange {
                path: "meta.lastUpdated".to_string(),
                start: Some(since.to_string()),
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
        gateway
            .search_query(&fq_index, FtsQuery::and(clauses), options)
            .await?
            .row_ids
    } else {
        Vec::new()
    };

    // (c) batch KV of returned keys.
    let archived = batch_fetch(gateway, bucket, &archived_keys).await?;

    // (d) return as a list: live revision first (if present), then archived, newest first.
    let mut all = Vec::with_capacity(archived.len() + 1);
    all.extend(live);
    all.extend(archived);
    Ok(all)
}

async fn batch_fetch(
    gateway: &dyn ClusterGateway,
    bucket: &str,
    keys: &[String],
) -> Result<Vec<StoredDocument>, CoreError> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    // Versions documents all live under the single `Versions` collection
    // regardless of resource type, so this fan-out step exists only to keep
    // the concurrency shape consistent with search/`$everything`'s batch fetch.
    let groups = group_by_resource_type(keys.to_vec());
    let fetched = fan_out(groups, DEFAULT_CONCURRENCY, |(_resource_type, group_keys)| {
        let bucket = bucket.to_string();
        async move {
            let rows = gateway
                .kv_get_many(&bucket, RESOURCES_SCOPE, VERSIONS_COLLECTION, &group_keys)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::FtsResult;
    use crate::routing::StaticResourceMapping;
    use crate::testing::InMemoryGateway;

    fn mapping() -> StaticResourceMapping {
        StaticResourceMapping::new().with("Patient", "Patient", Some("patientIndex".into()))
    }

    #[tokio::test]
    async fn vread_reads_versions_collection_directly() {
        let gateway = InMemoryGateway::new();
        gateway.seed_document(
            "acme",
            RESOURCES_SCOPE,
            VERSIONS_COLLECTION,
            "Patient/1/2",
            bytes::Bytes::from_static(br#"{"resourceType":"Patient","id":"1"}"#),
        );
        let doc = vread(&gateway, "acme", "Patient", "1", "2").await.unwrap();
        assert_eq!(doc.key.to_string(), "Patient/1/2");
    }

    #[tokio::test]
    async fn vread_missing_version_is_not_found() {
        let gateway = InMemoryGateway::new();
        let err = vread(&gateway, "acme", "Patient", "1", "9").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn history_combines_live_and_archived() {
        let gateway = InMemoryGateway::new();
        gateway.seed_document(
            "acme",
            RESOURCES_SCOPE,
            "Patient",
            "Patient/1",
            bytes::Bytes::from_static(br#"{"resourceType":"Patient","id":"1","meta":{"versionId":"2"}}"#),
        );
        gateway.seed_document(
            "acme",
            RESOURCES_SCOPE,
            VERSIONS_COLLECTION,
            "Patient/1/1",
            bytes::Bytes::from_static(br#"{"resourceType":"Patient","id":"1","meta":{"versionId":"1"}}"#),
        );
        let mapping = mapping(); // no Versions FTS index configured -> archived list stays empty
        let result = history(&gateway, &mapping, "acme", "Patient", "1", None).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].version_id, "2");

        let mapping_with_versions_index = StaticResourceMapping::new()
            .with("Patient", "Patient", Some("patientIndex".into()))
            .with("_Versions", VERSIONS_COLLECTION, Some("versionsIndex".into()));
        gateway.seed_fts_result(
            "acme.Resources.versionsIndex",
            FtsResult {
                row_ids: vec!["Patient/1/1".into()],
                total_rows: Some(1),
                server_took_ms: 1,
                errors: vec![],
            },
        );
        let result = history(&gateway, &mapping_with_versions_index, "acme", "Patient", "1", None)
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].version_id, "2");
        assert_eq!(result[1].version_id, "1");
    }
}
