//! Bundle Processor (§4.10): UUID pre-pass, reference rewrite, apply, respond.

use serde_json::Value;

use crate::error::CoreError;
use crate::gateway::{ClusterGateway, TxScope};
use crate::meta::Principal;
use crate::model::DocumentKey;
use crate::routing::ResourceMapping;
use crate::write::{delete, post, put, WriteOutcome};

/// `transaction` bundles abort entirely on any entry failure; `batch`
/// bundles are best-effort and report per-entry success/failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleType {
    Transaction,
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleMethod {
    Post,
    Put,
    Delete,
}

/// One entry of the incoming Bundle, already split into its request parts
/// (the REST surface's job is parsing the wire Bundle into this shape).
#[derive(Debug, Clone)]
pub struct BundleEntry {
    pub full_url: Option<String>,
    pub method: BundleMethod,
    pub resource_type: String,
    /// Present for PUT/DELETE (from the entry's request URL); POST computes its own.
    pub id: Option<String>,
    /// Present for POST/PUT.
    pub resource: Option<Value>,
    pub if_match: Option<String>,
    pub bump_version_if_missing: bool,
}

/// Per-entry outcome of applying a bundle (§4.10 step 4).
#[derive(Debug, Clone)]
pub enum BundleEntryResult {
    Success { status: u16, location: String },
    Failure { message: String },
}

/// Process a full bundle: UUID resolution, reference rewrite, apply, respond.
pub async fn process_bundle(
    gateway: &dyn ClusterGateway,
    mapping: &dyn ResourceMapping,
    bucket: &str,
    principal: &Principal,
    bundle_type: BundleType,
    mut entries: Vec<BundleEntry>,
) -> Result<Vec<BundleEntryResult>, CoreError> {
    // Step 1: UUID pre-pass.
    let uuid_map = assign_ids_and_build_uuid_map(&mut entries);

    // Step 2: reference rewrite.
    let rewrite_errors = rewrite_references(&mut entries, &uuid_map);

    // Step 3: apply.
    match bundle_type {
        BundleType::Transaction => apply_transactional(gateway, mapping, bucket, principal, entries, &rewrite_errors).await,
        BundleType::Batch => apply_best_effort(gateway, mapping, bucket, principal, entries, &rewrite_errors).await,
    }
}

/// Scan every entry for a `urn:uuid:` `fullUrl`, assign the entry's resource
/// an id, and record `urn:uuid:X -> Type/id` (§4.10 step 1).
fn assign_ids_and_build_uuid_map(entries: &mut [BundleEntry]) -> std::collections::HashMap<String, String> {
    let mut map = std::collections::HashMap::new();
    for entry in entries.iter_mut() {
        let Some(full_url) = entry.full_url.as_deref() else { continue };
        let Some(uuid_suffix) = full_url.strip_prefix("urn:uuid:") else { continue };

        let id = uuid_suffix.to_string();

        entry.id = Some(id.clone());
        if let Some(resource) = entry.resource.as_mut() {
            resource["id"] = Value::String(id.clone());
            resource["resourceType"] = Value::String(entry.resource_type.clone());
        }
        map.insert(uuid_suffix.to_string(), format!("{}/{}", entry.resource_type, id));
    }
    map
}

/// Walk every resource body, substituting `urn:uuid:X` references with their
/// resolved `Type/id`. Returns `(entry_index, message)` for every entry that
/// referenced an unresolved UUID (§4.10 step 2).
fn rewrite_references(entries: &mut [BundleEntry], uuid_map: &std::collections::HashMap<String, String>) -> Vec<(usize, String)> {
    let mut errors = Vec::new();
    for (index, entry) in entries.iter_mut().enumerate() {
        let Some(resource) = entry.resource.as_mut() else { continue };
        let mut unresolved = Vec::new();
        rewrite_value(resource, uuid_map, &mut unresolved);
        for uuid in unresolved {
            errors.push((index, format!("unresolved urn:uuid reference: urn:uuid:{uuid}")));
        }
    }
    errors
}

fn rewrite_value(value: &mut Value, uuid_map: &std::collections::HashMap<String, String>, unresolved: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if let Some(rewritten) = rewrite_reference_string(s, uuid_map, unresolved) {
                *s = rewritten;
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_value(item, uuid_map, unresolved);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                rewrite_value(v, uuid_map, unresolved);
            }
        }
        _ => {}
    }
}

fn rewrite_reference_string(
    s: &str,
    uuid_map: &std::collections::HashMap<String, String>,
    unresolved: &mut Vec<String>,
) -> Option<String> {
    let idx = s.find("urn:uuid:")?;
    let uuid_start = idx + "urn:uuid:".len();
    let uuid = &s[uuid_start..];
    match uuid_map.get(uuid) {
        Some(resolved) => {
            let mut rewritten = String::with_capacity(s.len());
            rewritten.push_str(&s[..idx]);
            rewritten.push_str(resolved);
            Some(rewritten)
        }
        None => {
            unresolved.push(uuid.to_string());
            None
        }
    }
}

/// Transaction mode: a single transaction shared by every entry; any
/// failure (including an unresolved UUID) aborts the whole bundle.
async fn apply_transactional(
    gateway: &dyn ClusterGateway,
    mapping: &dyn ResourceMapping,
    bucket: &str,
    principal: &Principal,
    entries: Vec<BundleEntry>,
    rewrite_errors: &[(usize, String)],
) -> Result<Vec<BundleEntryResult>, CoreError> {
    if let Some((_, message)) = rewrite_errors.first() {
        return Err(CoreError::validation(message.clone()));
    }

    let mut handle = gateway.begin_transaction(bucket).await?;
    let mut results = Vec::with_capacity(entries.len());

    for entry in entries {
        match dispatch(gateway, mapping, bucket, principal, &entry, TxScope::Ambient(&mut *handle)).await {
            Ok(result) => results.push(result),
            Err(err) => {
                if let Err(rollback_err) = handle.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback after failed bundle entry also failed");
                }
                return Err(err);
            }
        }
    }

    handle.commit().await?;
    Ok(results)
}

/// Batch mode: each entry gets its own transaction (via `TxScope::Fresh`
/// inside the write functions) and failures are reported per-entry.
async fn apply_best_effort(
    gateway: &dyn ClusterGateway,
    mapping: &dyn ResourceMapping,
    bucket: &str,
    principal: &Principal,
    entries: Vec<BundleEntry>,
    rewrite_errors: &[(usize, String)],
) -> Result<Vec<BundleEntryResult>, CoreError> {
    let failed_indices: std::collections::HashMap<usize, String> = rewrite_errors.iter().cloned().collect();
    let mut results = Vec::with_capacity(entries.len());

    for (index, entry) in entries.into_iter().enumerate() {
        if let Some(message) = failed_indices.get(&index) {
            results.push(BundleEntryResult::Failure { message: message.clone() });
            continue;
        }
        match dispatch(gateway, mapping, bucket, principal, &entry, TxScope::Fresh).await {
            Ok(result) => results.push(result),
            Err(err) => results.push(BundleEntryResult::Failure { message: err.to_string() }),
        }
    }

    Ok(results)
}

async fn dispatch(
    gateway: &dyn ClusterGateway,
    mapping: &dyn ResourceMapping,
    bucket: &str,
    principal: &Principal,
    entry: &BundleEntry,
    tx: TxScope<'_>,
) -> Result<BundleEntryResult, CoreError> {
    match entry.method {
        BundleMethod::Post => {
            let resource = entry
                .resource
                .clone()
                .ok_or_else(|| CoreError::validation("POST bundle entry missing resource body"))?;
            // A `urn:uuid:` `fullUrl` means the UUID pre-pass (§4.10 step 1)
            // already assigned this entry its id; honor it via `put` (whose
            // create-on-missing path is exactly a POST at a chosen id)
            // instead of letting a fresh `post` hand out an unrelated one.
            let (outcome, _) = match entry.id.as_deref() {
                Some(id) => put(gateway, mapping, bucket, &entry.resource_type, id, resource, None, principal, tx).await?,
                None => post(gateway, mapping, bucket, &entry.resource_type, resource, principal, tx).await?,
            };
            Ok(success_result(&outcome, outcome.created))
        }
        BundleMethod::Put => {
            let resource = entry
                .resource
                .clone()
                .ok_or_else(|| CoreError::validation("PUT bundle entry missing resource body"))?;
            let id = entry
                .id
                .as_deref()
                .ok_or_else(|| CoreError::validation("PUT bundle entry missing id"))?;
            let (outcome, _) = put(
                gateway,
                mapping,
                bucket,
                &entry.resource_type,
                id,
                resource,
                entry.if_match.as_deref(),
                principal,
                tx,
            )
            .await?;
            Ok(success_result(&outcome, outcome.created))
        }
        BundleMethod::Delete => {
            let id = entry
                .id
                .as_deref()
                .ok_or_else(|| CoreError::validation("DELETE bundle entry missing id"))?;
            let outcome = delete(
                gateway,
                mapping,
                bucket,
                &entry.resource_type,
                id,
                entry.bump_version_if_missing,
                principal,
                tx,
            )
            .await?;
            Ok(BundleEntryResult::Success {
                status: 204,
                location: outcome.key.to_string(),
            })
        }
    }
}

fn success_result(outcome: &WriteOutcome, created: bool) -> BundleEntryResult {
    BundleEntryResult::Success {
        status: if created { 201 } else { 200 },
        location: location_for(&outcome.key),
    }
}

fn location_for(key: &DocumentKey) -> String {
    format!("{}/{}", key.resource_type, key.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::StaticResourceMapping;
    use crate::testing::InMemoryGateway;
    use serde_json::json;

    fn mapping() -> StaticResourceMapping {
        StaticResourceMapping::new()
            .with("Patient", "Patient", Some("patientIndex".into()))
            .with("Observation", "Observation", Some("observationIndex".into()))
    }

    #[tokio::test]
    async fn uuid_reference_resolves_across_entries() {
        let gateway = InMemoryGateway::new();
        let entries = vec![
            BundleEntry {
                full_url: Some("urn:uuid:patient-1".into()),
                method: BundleMethod::Post,
                resource_type: "Patient".into(),
                id: None,
                resource: Some(json!({"resourceType": "Patient"})),
                if_match: None,
                bump_version_if_missing: false,
            },
            BundleEntry {
                full_url: None,
                method: BundleMethod::Post,
                resource_type: "Observation".into(),
                id: None,
                resource: Some(json!({"resourceType": "Observation", "subject": {"reference": "urn:uuid:patient-1"}})),
                if_match: None,
                bump_version_if_missing: false,
            },
        ];

        let results = process_bundle(&gateway, &mapping(), "acme", &Principal::Anonymous, BundleType::Transaction, entries)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        let observation_location = match (&results[0], &results[1]) {
            (BundleEntryResult::Success { status: 201, location: patient_location }, BundleEntryResult::Success { status: 201, location: observation_location }) => {
                assert_eq!(patient_location, "Patient/patient-1");
                observation_location.clone()
            }
            other => panic!("expected both entries to succeed, got {other:?}"),
        };

        let observation_key = observation_location.rsplit('/').next().unwrap();
        let observation_bytes = gateway
            .kv_get("acme", crate::gateway::RESOURCES_SCOPE, "Observation", &format!("Observation/{observation_key}"))
            .await
            .unwrap()
            .expect("observation was committed under its assigned id");
        let observation: Value = serde_json::from_slice(&observation_bytes).unwrap();
        assert_eq!(observation["subject"]["reference"], "Patient/patient-1");
    }

    #[tokio::test]
    async fn unresolved_uuid_aborts_transaction_bundle() {
        let gateway = InMemoryGateway::new();
        let entries = vec![BundleEntry {
            full_url: None,
            method: BundleMethod::Post,
            resource_type: "Observation".into(),
            id: None,
            resource: Some(json!({"resourceType": "Observation", "subject": {"reference": "urn:uuid:nonexistent"}})),
            if_match: None,
            bump_version_if_missing: false,
        }];

        let err = process_bundle(&gateway, &mapping(), "acme", &Principal::Anonymous, BundleType::Transaction, entries)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
        assert_eq!(gateway.document_count("acme", crate::gateway::RESOURCES_SCOPE, "Observation"), 0);
    }

    #[tokio::test]
    async fn batch_bundle_reports_failures_per_entry_without_aborting() {
        let gateway = InMemoryGateway::new();
        let entries = vec![
            BundleEntry {
                full_url: None,
                method: BundleMethod::Post,
                resource_type: "Observation".into(),
                id: None,
                resource: Some(json!({"resourceType": "Observation", "subject": {"reference": "urn:uuid:nonexistent"}})),
                if_match: None,
                bump_version_if_missing: false,
            },
            BundleEntry {
                full_url: None,
                method: BundleMethod::Post,
                resource_type: "Patient".into(),
                id: None,
                resource: Some(json!({"resourceType": "Patient"})),
                if_match: None,
                bump_version_if_missing: false,
            },
        ];

        let results = process_bundle(&gateway, &mapping(), "acme", &Principal::Anonymous, BundleType::Batch, entries)
            .await
            .unwrap();
        assert!(matches!(results[0], BundleEntryResult::Failure { .. }));
        assert!(matches!(results[1], BundleEntryResult::Success { status: 201, .. }));
    }
}
