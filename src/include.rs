//! Include Expansion (§4.7): forward `_include` and reverse `_revinclude`
//! reference harvesting for a search result page.
//!
//! Grounded in `octofhir-search::include`'s `Type:searchParam[:TargetType]`
//! directive shape and its forward/reverse split, adapted to this crate's
//! FTS-gateway boundary instead of a SQL join.

use std::collections::HashSet;

use crate::batch::{fan_out, group_by_resource_type, reorder_by_keys, DEFAULT_CONCURRENCY};
use crate::error::CoreError;
use crate::gateway::{ClusterGateway, FtsOptions, FtsQuery, MatchKind, RESOURCES_SCOPE};
use crate::model::{DocumentKey, StoredDocument};
use crate::routing::{fully_qualify, ResourceMapping};
use crate::search::{SearchParamKind, SearchParamRegistry};

/// The ceiling on how many included resources a single page may pull in,
/// regardless of how many directives or references are present.
pub const MAX_INCLUDE_COUNT: usize = 500;

/// One `_include`/`_revinclude` directive, already split from its raw
/// `Type:searchParam` (or `Type:searchParam:TargetType`) string form.
#[derive(Debug, Clone)]
pub struct IncludeDirective {
    /// The resource type that declares the reference search parameter.
    pub source_type: String,
    pub search_param: String,
    pub target_type: Option<String>,
    /// `_revinclude`: pull resources of `source_type` that reference the
    /// primaries, rather than resources the primaries themselves reference.
    pub reverse: bool,
}

/// Parse `Type:searchParam` or `Type:searchParam:TargetType`.
pub fn parse_directive(raw: &str, reverse: bool) -> Result<IncludeDirective, CoreError> {
    let mut parts = raw.split(':');
    let source_type = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CoreError::validation(format!("malformed include directive: {raw:?}")))?;
    let search_param = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CoreError::validation(format!("include directive missing search parameter: {raw:?}")))?;
    let target_type = parts.next().map(str::to_string);
    Ok(IncludeDirective {
        source_type: source_type.to_string(),
        search_param: search_param.to_string(),
        target_type,
        reverse,
    })
}

/// The outcome of expanding one page's includes: fetched documents plus
/// which keys were dropped by the cap, for callers that want to log it.
#[derive(Debug, Default)]
pub struct IncludeExpansion {
    pub documents: Vec<StoredDocument>,
    pub truncated: bool,
}

/// Expand every directive against `primaries`, deduplicating referenced
/// keys globally across all directives before the cap is applied (§4.7).
pub async fn expand(
    gateway: &dyn ClusterGateway,
    mapping: &dyn ResourceMapping,
    registry: &SearchParamRegistry,
    bucket: &str,
    primaries: &[StoredDocument],
    directives: &[IncludeDirective],
) -> Result<IncludeExpansion, CoreError> {
    if directives.is_empty() || primaries.is_empty() {
        return Ok(IncludeExpansion::default());
    }

    let mut keys: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for directive in directives {
        let harvested = if directive.reverse {
            harvest_reverse(gateway, mapping, registry, bucket, primaries, directive).await?
        } else {
            harvest_forward(registry, primaries, directive)?
        };
        for key in harvested {
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }
    }

    let truncated = keys.len() > MAX_INCLUDE_COUNT;
    keys.truncate(MAX_INCLUDE_COUNT);

    let groups = group_by_resource_type(keys.clone());
    let fetched = fan_out(groups, DEFAULT_CONCURRENCY, |(resource_type, group_keys)| {
        let bucket = bucket.to_string();
        async move {
            let collection = match mapping.target_collection(&resource_type) {
                Ok(c) => c.to_string(),
                Err(_) => return Vec::new(),
            };
            match gateway
                .kv_get_many(&bucket, RESOURCES_SCOPE, &collection, &group_keys)
                .await
            {
                Ok(rows) => rows
                    .into_iter()
                    .filter_map(|(key, bytes)| {
                        let bytes = bytes?;
                        let parsed: DocumentKey = key.parse().ok()?;
                        StoredDocument::from_bytes(parsed, bytes).ok()
                    })
                    .collect(),
                Err(err) => {
                    tracing::warn!(resource_type, error = %err, "include fetch failed, dropping this type's includes");
                    Vec::new()
                }
            }
        }
    })
    .await;

    let flattened: Vec<StoredDocument> = fetched.into_iter().flatten().collect();
    let documents = reorder_by_keys(&keys, flattened);

    Ok(IncludeExpansion { documents, truncated })
}

/// Forward include: extract reference strings from the primaries' own
/// bodies at the search parameter's indexed path.
fn harvest_forward(
    registry: &SearchParamRegistry,
    primaries: &[StoredDocument],
    directive: &IncludeDirective,
) -> Result<Vec<String>, CoreError> {
    let def = registry.get(&directive.source_type, &directive.search_param).ok_or_else(|| {
        CoreError::validation(format!(
            "unknown search parameter {} on {}",
            directive.search_param, directive.source_type
        ))
    })?;
    if def.kind != SearchParamKind::Reference {
        return Err(CoreError::validation(format!(
            "include parameter {} is not a reference parameter",
            directive.search_param
        )));
    }

    let mut refs = Vec::new();
    for doc in primaries {
        if doc.resource_type != directive.source_type {
            continue;
        }
        let body: serde_json::Value = match serde_json::from_slice(&doc.bytes) {
            Ok(v) => v,
            Err(_) => continue,
        };
        collect_reference_strings(&body, &def.path, &mut refs);
    }

    if let Some(target_type) = &directive.target_type {
        refs.retain(|r| r.starts_with(&format!("{target_type}/")));
    }
    Ok(refs)
}

/// Walk a dotted field path (e.g. `subject.reference` or
/// `participant.individual.reference`) through JSON objects and arrays,
/// collecting every string value found at the path's end.
fn collect_reference_strings(value: &serde_json::Value, path: &str, out: &mut Vec<String>) {
    match path.split_once('.') {
        None => match value.get(path) {
            Some(serde_json::Value::String(s)) => out.push(s.clone()),
            Some(serde_json::Value::Array(items)) => {
                for item in items {
                    if let Some(s) = item.as_str() {
                        out.push(s.to_string());
                    }
                }
            }
            _ => {}
        },
        Some((head, rest)) => match value.get(head) {
            Some(serde_json::Value::Array(items)) => {
                for item in items {
                    collect_reference_strings(item, rest, out);
                }
            }
            Some(inner) => collect_reference_strings(inner, rest, out),
            None => {}
        },
    }
}

/// Reverse include: search `directive.source_type`'s index for documents
/// whose reference path matches any of the primaries' own `Type/id` keys.
async fn harvest_reverse(
    gateway: &dyn ClusterGateway,
    mapping: &dyn ResourceMapping,
    registry: &SearchParamRegistry,
    bucket: &str,
    primaries: &[StoredDocument],
    directive: &IncludeDirective,
) -> Result<Vec<String>, CoreError> {
    let def = registry.get(&directive.source_type, &directive.search_param).ok_or_else(|| {
        CoreError::validation(format!(
            "unknown search parameter {} on {}",
            directive.search_param, directive.source_type
        ))
    })?;

    let index = mapping.fts_index(&directive.source_type).ok_or_else(|| {
        CoreError::validation(format!("no FTS index configured for {}", directive.source_type))
    })?;
    let fq_index = fully_qualify(index, bucket);

    let primary_refs: Vec<FtsQuery> = primaries
        .iter()
        .map(|doc| FtsQuery::term(def.path.clone(), doc.key.to_string(), MatchKind::Exact))
        .collect();
    if primary_refs.is_empty() {
        return Ok(Vec::new());
    }

    let query = FtsQuery::and(vec![
        FtsQuery::term("resourceType", directive.source_type.clone(), MatchKind::Exact),
        FtsQuery::or(primary_refs),
    ]);

    let result = gateway
        .search_query(
            &fq_index,
            query,
            FtsOptions {
                limit: MAX_INCLUDE_COUNT,
                ..FtsOptions::default()
            },
        )
        .await?;
    Ok(result.row_ids)
}
