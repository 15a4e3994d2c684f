use bytes::Bytes;
use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::error::CoreError;
use crate::gateway::{ClusterGateway, Found, TxContext, TxScope, RESOURCES_SCOPE};
use crate::meta::{resolve_delete_version, Principal};
use crate::model::DocumentKey;
use crate::routing::{ResourceMapping, TOMBSTONES_COLLECTION, VERSIONS_COLLECTION};

use super::WriteOutcome;

/// DELETE (soft-delete, idempotent, §4.4). Always transactional; a second
/// delete of an already-tombstoned id is a no-op that still returns success.
pub async fn delete(
    gateway: &dyn ClusterGateway,
    mapping: &dyn ResourceMapping,
    bucket: &str,
    resource_type: &str,
    id: &str,
    bump_version_if_missing: bool,
    principal: &Principal,
    tx: TxScope<'_>,
) -> Result<WriteOutcome, CoreError> {
    match tx {
        TxScope::Ambient(txc) => {
            delete_steps(
                txc,
                bucket,
                mapping,
                resource_type,
                id,
                bump_version_if_missing,
                principal,
            )
            .await
        }
        TxScope::Fresh => {
            let mut handle = gateway.begin_transaction(bucket).await?;
            match delete_steps(
                &mut *handle,
                bucket,
                mapping,
                resource_type,
                id,
                bump_version_if_missing,
                principal,
            )
            .await
            {
                Ok(result) => {
                    handle.commit().await?;
                    Ok(result)
                }
                Err(err) => {
                    if let Err(rollback_err) = handle.rollback().await {
                        tracing::warn!(error = %rollback_err, "rollback after failed DELETE also failed");
                    }
                    Err(err)
                }
            }
        }
    }
}

async fn delete_steps(
    txc: &mut dyn TxContext,
    bucket: &str,
    mapping: &dyn ResourceMapping,
    resource_type: &str,
    id: &str,
    bump_version_if_missing: bool,
    principal: &Principal,
) -> Result<WriteOutcome, CoreError> {
    let collection = mapping.target_collection(resource_type)?.to_string();
    let live_key = DocumentKey::live(resource_type, id);

    let current = txc
        .get(RESOURCES_SCOPE, &collection, &live_key.to_string())
        .await?;

    let archived_version = match current {
        Found::Document(bytes) => {
            let current_value: Value = serde_json::from_slice(&bytes)
                .map_err(|e| CoreError::internal(format!("stored document is not valid JSON: {e}")))?;
            let current_version = current_value
                .get("meta")
                .and_then(|m| m.get("versionId"))
                .and_then(Value::as_str)
                .unwrap_or("1")
                .to_string();
            let version_key = DocumentKey::versioned(resource_type, id, &current_version);
            txc.insert(
                RESOURCES_SCOPE,
                VERSIONS_COLLECTION,
                &version_key.to_string(),
                bytes,
            )
            .await?;
            Some(current_version)
        }
        Found::Missing => None,
    };

    let last_version_id = match &archived_version {
        Some(v) => Some(resolve_delete_version(bump_version_if_missing, Some(v))?),
        None => None,
    };

    if let Some(last_version_id) = &last_version_id {
        let tombstone = json!({
            "resourceType": resource_type,
            "id": id,
            "deletedAt": OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .map_err(|e| CoreError::internal(e.to_string()))?,
            "lastVersionId": last_version_id,
            "deletedBy": principal.normalized(),
            "restorable": true,
        });
        let tombstone_bytes = bytes::Bytes::from(
            serde_json::to_vec(&tombstone).map_err(|e| CoreError::internal(e.to_string()))?,
        );

        let existing_tombstone = txc
            .get(RESOURCES_SCOPE, TOMBSTONES_COLLECTION, &live_key.to_string())
            .await?;
        match existing_tombstone {
            Found::Document(_) => {
                txc.replace(
                    RESOURCES_SCOPE,
                    TOMBSTONES_COLLECTION,
                    &live_key.to_string(),
                    tombstone_bytes,
                )
                .await?;
            }
            Found::Missing => {
                txc.insert(
                    RESOURCES_SCOPE,
                    TOMBSTONES_COLLECTION,
                    &live_key.to_string(),
                    tombstone_bytes,
                )
                .await?;
            }
        }

        txc.remove(RESOURCES_SCOPE, &collection, &live_key.to_string())
            .await?;
    }

    tracing::info!(bucket, resource_type, key = %live_key, archived = archived_version.is_some(), "resource deleted");

    Ok(WriteOutcome {
        key: live_key,
        version_id: last_version_id.unwrap_or_else(|| "1".to_string()),
        created: false,
    })
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

    fn seed_live(gateway: &InMemoryGateway) {
        gateway.seed_document(
            "acme",
            RESOURCES_SCOPE,
            "Patient",
            "Patient/U",
            Bytes::from(
                serde_json::to_vec(&json!({
                    "resourceType": "Patient",
                    "id": "U",
                    "meta": {"versionId": "2"}
                }))
                .unwrap(),
            ),
        );
    }

    /// §8: "∀ successful DELETE on existing Type/id: (a) a tombstone
    /// exists at Type/id, (b) the live key is absent, (c) the archived
    /// version's key is present."
    #[tokio::test]
    async fn delete_on_existing_archives_tombstones_and_removes_live() {
        let gateway = InMemoryGateway::new();
        seed_live(&gateway);

        let outcome = delete(
            &gateway,
            &mapping(),
            "acme",
            "Patient",
            "U",
            false,
            &Principal::Anonymous,
            TxScope::Fresh,
        )
        .await
        .unwrap();

        assert_eq!(outcome.version_id, "2");
        assert!(gateway
            .kv_get("acme", RESOURCES_SCOPE, "Patient", "Patient/U")
            .await
            .unwrap()
            .is_none());
        assert!(gateway
            .kv_get("acme", RESOURCES_SCOPE, TOMBSTONES_COLLECTION, "Patient/U")
            .await
            .unwrap()
            .is_some());
        assert!(gateway
            .kv_get("acme", RESOURCES_SCOPE, VERSIONS_COLLECTION, "Patient/U/2")
            .await
            .unwrap()
            .is_some());
    }

    /// §8: "DELETE on absent Type/id: no tombstone is created; response
    /// is still terminal success" — idempotency (scenario 3).
    #[tokio::test]
    async fn delete_on_absent_id_is_a_no_op_success() {
        let gateway = InMemoryGateway::new();
        let outcome = delete(
            &gateway,
            &mapping(),
            "acme",
            "Patient",
            "never-existed",
            false,
            &Principal::Anonymous,
            TxScope::Fresh,
        )
        .await
        .unwrap();

        assert_eq!(outcome.version_id, "1");
        assert_eq!(
            gateway.document_count("acme", RESOURCES_SCOPE, TOMBSTONES_COLLECTION),
            0
        );
    }

    /// Scenario 3: deleting an already-tombstoned id twice is idempotent —
    /// the tombstone exists exactly once and the second call still succeeds.
    #[tokio::test]
    async fn delete_is_idempotent_across_repeated_calls() {
        let gateway = InMemoryGateway::new();
        seed_live(&gateway);

        delete(
            &gateway,
            &mapping(),
            "acme",
            "Patient",
            "U",
            false,
            &Principal::Anonymous,
            TxScope::Fresh,
        )
        .await
        .unwrap();

        let second = delete(
            &gateway,
            &mapping(),
            "acme",
            "Patient",
            "U",
            false,
            &Principal::Anonymous,
            TxScope::Fresh,
        )
        .await
        .unwrap();

        assert_eq!(second.version_id, "1");
        assert_eq!(
            gateway.document_count("acme", RESOURCES_SCOPE, TOMBSTONES_COLLECTION),
            1
        );
    }

    #[tokio::test]
    async fn bump_version_if_missing_increments_archived_version() {
        let gateway = InMemoryGateway::new();
        seed_live(&gateway);

        let outcome = delete(
            &gateway,
            &mapping(),
            "acme",
            "Patient",
            "U",
            true,
            &Principal::Anonymous,
            TxScope::Fresh,
        )
        .await
        .unwrap();

        assert_eq!(outcome.version_id, "3");
    }
}
