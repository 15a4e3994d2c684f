//! Conditional Resolver (§4.5): ZERO/ONE/MANY resolution backing
//! conditional create/update.

use bytes::Bytes;
use serde_json::Value;

use crate::error::CoreError;
use crate::gateway::{ClusterGateway, FtsOptions, FtsQuery, TxScope};
use crate::meta::Principal;
use crate::model::DocumentKey;
use crate::routing::{fully_qualify, ResourceMapping};
use crate::write::{post, put, WriteOutcome};

/// Outcome of resolving a conditional operation's search criteria.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionalResolution {
    /// No match: caller should create a new resource.
    Zero,
    /// Exactly one match: caller should update it.
    One(String),
    /// More than one match: caller must surface a precondition failure.
    Many,
}

/// Compile `criteria` into an FTS query, execute with `LIMIT 2`, and project
/// only the matching id. Never inspects more than two rows — the ambiguity
/// check is branch-free once the gateway has returned.
pub async fn resolve(
    gateway: &dyn ClusterGateway,
    mapping: &dyn ResourceMapping,
    bucket: &str,
    resource_type: &str,
    criteria: FtsQuery,
) -> Result<ConditionalResolution, CoreError> {
    let index = mapping.fts_index(resource_type).ok_or_else(|| {
        CoreError::validation(format!("no FTS index configured for {resource_type}"))
    })?;
    let fq_index = fully_qualify(index, bucket);

    let options = FtsOptions {
        limit: 2,
        ..FtsOptions::default()
    };
    let result = gateway.search_query(&fq_index, criteria, options).await?;

    match result.row_ids.as_slice() {
        [] => Ok(ConditionalResolution::Zero),
        [only] => Ok(ConditionalResolution::One(extract_id(only, resource_type)?)),
        _ => Ok(ConditionalResolution::Many),
    }
}

fn extract_id(key: &str, resource_type: &str) -> Result<String, CoreError> {
    let parsed: DocumentKey = key
        .parse()
        .map_err(|_| CoreError::internal(format!("FTS returned malformed key: {key}")))?;
    if parsed.resource_type != resource_type {
        return Err(CoreError::internal(format!(
            "FTS row key {key} does not match resource type {resource_type}"
        )));
    }
    Ok(parsed.id)
}

/// The `resolveOne -> POST|PUT` composition backing conditional PUT
/// (§8 "Conditional PUT" property): `Zero` creates with a server-assigned
/// id exactly like POST, `One(id)` updates that exact resource, `Many`
/// fails without touching the store.
pub async fn conditional_put(
    gateway: &dyn ClusterGateway,
    mapping: &dyn ResourceMapping,
    bucket: &str,
    resource_type: &str,
    criteria: FtsQuery,
    criteria_description: &str,
    resource: Value,
    principal: &Principal,
    tx: TxScope<'_>,
) -> Result<(WriteOutcome, Bytes), CoreError> {
    match resolve(gateway, mapping, bucket, resource_type, criteria).await? {
        ConditionalResolution::Zero => {
            post(gateway, mapping, bucket, resource_type, resource, principal, tx).await
        }
        ConditionalResolution::One(id) => {
            put(
                gateway,
                mapping,
                bucket,
                resource_type,
                &id,
                resource,
                None,
                principal,
                tx,
            )
            .await
        }
        ConditionalResolution::Many => Err(CoreError::precondition_failed(
            resource_type,
            criteria_description,
        )),
    }
}
