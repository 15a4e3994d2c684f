use bytes::Bytes;
use serde_json::Value;

use crate::error::CoreError;
use crate::gateway::{ClusterGateway, Found, TxContext, TxScope, RESOURCES_SCOPE};
use crate::meta::{apply_meta, MetaOp, MetaRequest, Principal};
use crate::model::{validate_resource_id, DocumentKey};
use crate::routing::{ResourceMapping, VERSIONS_COLLECTION};

use super::WriteOutcome;

/// PUT (client-specified id, create-or-update, §4.4). Always transactional:
/// archive-if-present, apply meta, mutate-or-create the live document, all
/// inside one transaction whether it is this call's own (`Fresh`) or a
/// bundle's (`Ambient`).
pub async fn put(
    gateway: &dyn ClusterGateway,
    mapping: &dyn ResourceMapping,
    bucket: &str,
    resource_type: &str,
    id: &str,
    resource: Value,
    if_match: Option<&str>,
    principal: &Principal,
    tx: TxScope<'_>,
) -> Result<(WriteOutcome, Bytes), CoreError> {
    match tx {
        TxScope::Ambient(txc) => {
            put_steps(txc, bucket, mapping, resource_type, id, resource, if_match, principal).await
        }
        TxScope::Fresh => {
            let mut handle = gateway.begin_transaction(bucket).await?;
            match put_steps(&mut *handle, bucket, mapping, resource_type, id, resource, if_match, principal).await {
                Ok(result) => {
                    handle.commit().await?;
                    Ok(result)
                }
                Err(err) => {
                    if let Err(rollback_err) = handle.rollback().await {
                        tracing::warn!(error = %rollback_err, "rollback after failed PUT also failed");
                    }
                    Err(err)
                }
            }
        }
    }
}

/// Steps 1-3 of §4.4's PUT algorithm, run against whichever `TxContext` the
/// caller is holding.
async fn put_steps(
    txc: &mut dyn TxContext,
    bucket: &str,
    mapping: &dyn ResourceMapping,
    resource_type: &str,
    id: &str,
    mut resource: Value,
    if_match: Option<&str>,
    principal: &Principal,
) -> Result<(WriteOutcome, Bytes), CoreError> {
    validate_resource_id(id)?;
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

            if let Some(expected) = if_match {
                if expected != current_version {
                    return Err(CoreError::precondition_failed(
                        resource_type,
                        format!("If-Match: {expected}"),
                    ));
                }
            }

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
        Found::Missing => {
            if if_match.is_some() {
                return Err(CoreError::not_found(resource_type, id));
            }
            None
        }
    };

    resource["resourceType"] = Value::String(resource_type.to_string());
    resource["id"] = Value::String(id.to_string());

    apply_meta(
        &mut resource,
        MetaOp::Update,
        MetaRequest::default(),
        archived_version.as_deref(),
        principal,
    )?;

    let new_version = resource["meta"]["versionId"]
        .as_str()
        .unwrap_or("1")
        .to_string();
    let bytes = Bytes::from(serde_json::to_vec(&resource).map_err(|e| CoreError::internal(e.to_string()))?);

    if archived_version.is_some() {
        txc.replace(RESOURCES_SCOPE, &collection, &live_key.to_string(), bytes.clone())
            .await?;
    } else {
        txc.insert(RESOURCES_SCOPE, &collection, &live_key.to_string(), bytes.clone())
            .await?;
    }

    tracing::info!(bucket, resource_type, key = %live_key, new_version, "resource put");

    Ok((
        WriteOutcome {
            key: live_key,
            version_id: new_version,
            created: archived_version.is_none(),
        },
        bytes,
    ))
}
