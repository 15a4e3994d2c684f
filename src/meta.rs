//! Meta & Audit (§4.2): uniform `meta` handling across CREATE/UPDATE/DELETE.

use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::error::CoreError;

/// The canonical audit-tag system. §9 resolves the Open Question of two
/// competing systems seen in the source in favor of this one, since the
/// other path is marked deprecated there.
pub const AUDIT_TAG_SYSTEM: &str = "couchbase.fhir.com/custom-tags";

/// The security principal performing a write, resolved from an ambient
/// security context that is itself an external collaborator (§1).
#[derive(Debug, Clone)]
pub enum Principal {
    User(String),
    System(String),
    Anonymous,
}

impl Principal {
    /// `"user:<id>"` / `"system:<id>"` / `"user:anonymous"` fallback (§4.2).
    pub fn normalized(&self) -> String {
        match self {
            Principal::User(id) => format!("user:{id}"),
            Principal::System(id) => format!("system:{id}"),
            Principal::Anonymous => "user:anonymous".to_string(),
        }
    }
}

/// The operation `apply_meta` is being asked to stamp.
#[derive(Debug, Clone)]
pub enum MetaOp {
    Create,
    Update,
    Delete { bump_version_if_missing: bool },
}

impl MetaOp {
    fn audit_code(&self) -> &'static str {
        match self {
            MetaOp::Create => "created-by",
            MetaOp::Update => "updated-by",
            MetaOp::Delete { .. } => "deleted-by",
        }
    }
}

/// Inputs to a single `apply_meta` call.
#[derive(Debug, Clone, Default)]
pub struct MetaRequest {
    /// Caller-supplied `lastUpdated`; defaults to now.
    pub now: Option<OffsetDateTime>,
    /// Caller-chosen version seed/target, if any (§4.2 version-id rules).
    pub requested_version: Option<String>,
    /// Additional profile canonical URLs to union into `meta.profile`.
    pub profiles: Vec<String>,
}

/// Apply `meta` updates to `resource` in place, returning the resolved
/// `versionId`. `current_version` is the resource's current `meta.versionId`
/// before this call, if a live document already existed.
pub fn apply_meta(
    resource: &mut Value,
    op: MetaOp,
    request: MetaRequest,
    current_version: Option<&str>,
    principal: &Principal,
) -> Result<String, CoreError> {
    let now = request.now.unwrap_or_else(OffsetDateTime::now_utc);
    let now_str = now
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|e| CoreError::internal(format!("failed to format lastUpdated: {e}")))?;

    let version_id = resolve_version_id(&op, &request, current_version)?;

    let meta = resource
        .as_object_mut()
        .ok_or_else(|| CoreError::validation("resource is not a JSON object"))?
        .entry("meta")
        .or_insert_with(|| json!({}));
    let meta = meta
        .as_object_mut()
        .ok_or_else(|| CoreError::validation("resource.meta is not a JSON object"))?;

    meta.insert("versionId".to_string(), json!(version_id));
    meta.insert("lastUpdated".to_string(), json!(now_str));

    if !request.profiles.is_empty() {
        let mut profiles: Vec<String> = meta
            .get("profile")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        for profile in request.profiles {
            if !profiles.contains(&profile) {
                profiles.push(profile);
            }
        }
        meta.insert("profile".to_string(), json!(profiles));
    }

    append_audit_tag(meta, op.audit_code(), &principal.normalized());

    Ok(version_id)
}

fn resolve_version_id(
    op: &MetaOp,
    request: &MetaRequest,
    current_version: Option<&str>,
) -> Result<String, CoreError> {
    if let Some(requested) = &request.requested_version {
        validate_numeric_version(requested)?;
        return Ok(requested.clone());
    }

    match op {
        MetaOp::Create => Ok("1".to_string()),
        MetaOp::Update => match current_version {
            Some(v) => Ok(increment_version(v)?),
            None => Ok("1".to_string()),
        },
        MetaOp::Delete {
            bump_version_if_missing,
        } => match current_version {
            Some(v) if *bump_version_if_missing => Ok(increment_version(v)?),
            Some(v) => Ok(v.to_string()),
            None => Ok("1".to_string()),
        },
    }
}

/// The version-id `DELETE` should record on its tombstone (§4.2's DELETE rule),
/// exposed separately since a tombstone has no `meta` substructure of its own.
pub fn resolve_delete_version(
    bump_version_if_missing: bool,
    current_version: Option<&str>,
) -> Result<String, CoreError> {
    match current_version {
        Some(v) if bump_version_if_missing => increment_version(v),
        Some(v) => Ok(v.to_string()),
        None => Ok("1".to_string()),
    }
}

fn validate_numeric_version(version: &str) -> Result<(), CoreError> {
    version
        .parse::<u64>()
        .map(|_| ())
        .map_err(|_| CoreError::validation(format!("versionId must be numeric, got {version:?}")))
}

fn increment_version(version: &str) -> Result<String, CoreError> {
    let parsed: u64 = version
        .parse()
        .map_err(|_| CoreError::internal(format!("stored versionId is not numeric: {version:?}")))?;
    Ok((parsed + 1).to_string())
}

fn append_audit_tag(meta: &mut serde_json::Map<String, Value>, code: &str, display: &str) {
    let mut tags: Vec<Value> = meta
        .get("tag")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    tags.retain(|tag| {
        tag.get("system").and_then(Value::as_str) != Some(AUDIT_TAG_SYSTEM)
    });
    tags.push(json!({
        "system": AUDIT_TAG_SYSTEM,
        "code": code,
        "display": display,
    }));
    meta.insert("tag".to_string(), json!(tags));
}
