use bytes::Bytes;
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreError;
use crate::gateway::{queries, ClusterGateway, QueryParams, TxScope, RESOURCES_SCOPE};
use crate::meta::{apply_meta, MetaOp, MetaRequest, Principal};
use crate::model::DocumentKey;
use crate::routing::ResourceMapping;

use super::WriteOutcome;

/// Bound on how many times `post` will re-roll a server-generated id after
/// finding a prior tombstone at the candidate key.
const MAX_ID_GENERATION_ATTEMPTS: u32 = 5;

/// Whether a tombstone already exists at `Type/id`, via the
/// [`queries::TOMBSTONE_EXISTS`] template. Backs the invariant that a
/// server-chosen id never reuses one a prior DELETE already tombstoned (§8).
async fn tombstone_exists(gateway: &dyn ClusterGateway, bucket: &str, key: &str) -> Result<bool, CoreError> {
    let sql = queries::render(queries::TOMBSTONE_EXISTS, bucket, "", key, "");
    let rows = gateway.query(bucket, &sql, QueryParams::new()).await?;
    Ok(rows
        .first()
        .and_then(|row| row.get("count"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
        > 0)
}

/// POST (server-generated id, §4.4). Outside a bundle this is a single
/// idempotent UPSERT; inside a bundle it joins the bundle's transaction and
/// uses `insert` since the generated id is (negligibly) collision-free.
pub async fn post(
    gateway: &dyn ClusterGateway,
    mapping: &dyn ResourceMapping,
    bucket: &str,
    resource_type: &str,
    mut resource: Value,
    principal: &Principal,
    tx: TxScope<'_>,
) -> Result<(WriteOutcome, Bytes), CoreError> {
    let collection = mapping.target_collection(resource_type)?.to_string();

    let mut id = Uuid::new_v4().to_string();
    for attempt in 0..MAX_ID_GENERATION_ATTEMPTS {
        if !tombstone_exists(gateway, bucket, &format!("{resource_type}/{id}")).await? {
            break;
        }
        tracing::warn!(bucket, resource_type, attempt, "generated id collides with a tombstone, retrying");
        id = Uuid::new_v4().to_string();
    }

    resource["resourceType"] = Value::String(resource_type.to_string());
    resource["id"] = Value::String(id.clone());

    apply_meta(
        &mut resource,
        MetaOp::Create,
        MetaRequest::default(),
        None,
        principal,
    )?;

    let bytes = Bytes::from(serde_json::to_vec(&resource).map_err(|e| CoreError::internal(e.to_string()))?);
    let key = DocumentKey::live(resource_type, &id);

    match tx {
        TxScope::Ambient(txc) => {
            txc.insert(RESOURCES_SCOPE, &collection, &key.to_string(), bytes.clone())
                .await?;
        }
        TxScope::Fresh => {
            gateway
                .kv_upsert(bucket, RESOURCES_SCOPE, &collection, &key.to_string(), bytes.clone())
                .await?;
        }
    }

    tracing::info!(bucket, resource_type, key = %key, "resource created");

    Ok((
        WriteOutcome {
            key,
            version_id: "1".to_string(),
            created: true,
        },
        bytes,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::RESOURCES_SCOPE;
    use crate::routing::StaticResourceMapping;
    use crate::testing::InMemoryGateway;
    use serde_json::json;

    fn mapping() -> StaticResourceMapping {
        StaticResourceMapping::new().with("Patient", "Patient", Some("patientIndex".into()))
    }

    /// §8: a server-generated id with a prior tombstone at its `Type/id`
    /// key is rejected and re-rolled.
    #[tokio::test]
    async fn tombstone_exists_reports_a_seeded_tombstone_and_nothing_else() {
        let gateway = InMemoryGateway::new();
        gateway.seed_document(
            "acme",
            RESOURCES_SCOPE,
            "Tombstones",
            "Patient/already-deleted",
            bytes::Bytes::from_static(b"{}"),
        );

        assert!(tombstone_exists(&gateway, "acme", "Patient/already-deleted").await.unwrap());
        assert!(!tombstone_exists(&gateway, "acme", "Patient/never-deleted").await.unwrap());
    }

    /// §8: "∀ POST: the resulting versionId = "1" and server-chosen id
    /// has no prior tombstone" and scenario 1 (create then read).
    #[tokio::test]
    async fn post_assigns_id_and_version_one() {
        let gateway = InMemoryGateway::new();
        let (outcome, bytes) = post(
            &gateway,
            &mapping(),
            "acme",
            "Patient",
            json!({"resourceType": "Patient", "name": [{"family": "X"}]}),
            &Principal::Anonymous,
            TxScope::Fresh,
        )
        .await
        .unwrap();

        assert!(outcome.created);
        assert_eq!(outcome.version_id, "1");
        assert_eq!(outcome.key.resource_type, "Patient");

        let stored: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(stored["id"], outcome.key.id);
        assert_eq!(stored["meta"]["versionId"], "1");
        assert_eq!(stored["name"][0]["family"], "X");

        let fetched = gateway
            .kv_get(
                "acme",
                RESOURCES_SCOPE,
                "Patient",
                &outcome.key.to_string(),
            )
            .await
            .unwrap();
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn post_inside_ambient_transaction_joins_it() {
        let gateway = InMemoryGateway::new();
        let mut handle = gateway.begin_transaction("acme").await.unwrap();
        let (outcome, _) = post(
            &gateway,
            &mapping(),
            "acme",
            "Patient",
            json!({"resourceType": "Patient"}),
            &Principal::Anonymous,
            TxScope::Ambient(&mut *handle),
        )
        .await
        .unwrap();

        // Not yet visible outside the transaction.
        assert_eq!(gateway.document_count("acme", RESOURCES_SCOPE, "Patient"), 0);
        handle.commit().await.unwrap();
        assert_eq!(gateway.document_count("acme", RESOURCES_SCOPE, "Patient"), 1);
        assert_eq!(outcome.version_id, "1");
    }

    #[tokio::test]
    async fn unsupported_resource_type_is_rejected() {
        let gateway = InMemoryGateway::new();
        let err = post(
            &gateway,
            &mapping(),
            "acme",
            "Observation",
            json!({"resourceType": "Observation"}),
            &Principal::Anonymous,
            TxScope::Fresh,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }
}
