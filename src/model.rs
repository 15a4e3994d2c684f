//! Document keys and the small set of opaque-JSON resource shapes the core
//! reasons about (§3). Resources themselves stay `serde_json::Value` — this
//! crate only ever looks at `resourceType`, `id`, `meta`, and reference
//! paths, never a typed FHIR model.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use bytes::Bytes;
use regex::Regex;
use time::OffsetDateTime;

use crate::error::CoreError;

/// FHIR `id` grammar: printable ASCII, no `/` (§6). `64` is FHIR R4's own cap.
fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9\-\.]{1,64}$").expect("static pattern is valid"))
}

/// Reject a client-supplied `id` that is not opaque printable ASCII without
/// `/` (used by PUT and conditional-PUT, where the id comes from the URL
/// rather than being server-generated).
pub fn validate_resource_id(id: &str) -> Result<(), CoreError> {
    if id_pattern().is_match(id) {
        Ok(())
    } else {
        Err(CoreError::validation(format!("invalid resource id: {id:?}")))
    }
}

/// A parsed `Type/id` or `Type/id/vid` document key (§3, §6).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    pub resource_type: String,
    pub id: String,
    pub version: Option<String>,
}

impl DocumentKey {
    pub fn live(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version: None,
        }
    }

    pub fn versioned(resource_type: impl Into<String>, id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version: Some(version.into()),
        }
    }

    /// The live-resource form of this key (`Type/id`), dropping any version.
    pub fn as_live(&self) -> DocumentKey {
        DocumentKey::live(self.resource_type.clone(), self.id.clone())
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}/{}/{}", self.resource_type, self.id, v),
            None => write!(f, "{}/{}", self.resource_type, self.id),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed document key: {0}")]
pub struct KeyParseError(pub String);

impl FromStr for DocumentKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        let resource_type = parts.next().filter(|s| !s.is_empty());
        let id = parts.next().filter(|s| !s.is_empty());
        let version = parts.next().map(str::to_string);
        match (resource_type, id) {
            (Some(resource_type), Some(id)) => Ok(DocumentKey {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                version,
            }),
            _ => Err(KeyParseError(s.to_string())),
        }
    }
}

/// A live or historical document as stored: raw bytes plus the small amount
/// of metadata the core needs without decoding them (§3, §4.11).
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub key: DocumentKey,
    pub bytes: Bytes,
    pub resource_type: String,
    pub version_id: String,
    pub last_updated: OffsetDateTime,
}

impl StoredDocument {
    /// Build a [`StoredDocument`] from raw KV bytes, peeking only
    /// `resourceType`/`meta.versionId`/`meta.lastUpdated` — the body itself
    /// is never re-serialized, so later stages (the Fast Bundle Writer) can
    /// still emit it byte-for-byte (§4.11).
    pub fn from_bytes(key: DocumentKey, bytes: Bytes) -> Result<StoredDocument, CoreError> {
        let peek: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| CoreError::internal(format!("malformed stored document {key}: {e}")))?;

        let resource_type = peek
            .get("resourceType")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(&key.resource_type)
            .to_string();

        let version_id = peek
            .pointer("/meta/versionId")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("1")
            .to_string();

        let last_updated = peek
            .pointer("/meta/lastUpdated")
            .and_then(serde_json::Value::as_str)
            .and_then(|raw| time::OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339).ok())
            .unwrap_or_else(OffsetDateTime::now_utc);

        Ok(StoredDocument {
            key,
            bytes,
            resource_type,
            version_id,
            last_updated,
        })
    }
}

/// A soft-delete marker (§3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Tombstone {
    pub resource_type: String,
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub deleted_at: OffsetDateTime,
    pub last_version_id: Option<String>,
    pub deleted_by: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub restorable: bool,
}

/// A reference string as it appears inside a resource body: either
/// `Type/id` or `urn:uuid:X` (resolved during bundle processing, §4.10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRef {
    TypeAndId { resource_type: String, id: String },
    UrnUuid(String),
}

impl ResourceRef {
    /// Parse a reference string. Accepts bare `Type/id`, a trailing
    /// `.../Type/id` (e.g. with a base URL prefix), and `urn:uuid:X`
    /// (optionally embedded after a `/`, as bundle reference rewriting can
    /// produce `"Patient/urn:uuid:X"`-shaped intermediate values).
    pub fn parse(reference: &str) -> Option<ResourceRef> {
        if let Some(rest) = reference.strip_prefix("urn:uuid:") {
            return Some(ResourceRef::UrnUuid(rest.to_string()));
        }
        if let Some(idx) = reference.find("urn:uuid:") {
            return Some(ResourceRef::UrnUuid(reference[idx + "urn:uuid:".len()..].to_string()));
        }
        let mut segments = reference.rsplitn(3, '/');
        let id = segments.next()?;
        let resource_type = segments.next()?;
        if id.is_empty() || resource_type.is_empty() || resource_type.chars().next()?.is_ascii_lowercase() {
            return None;
        }
        Some(ResourceRef::TypeAndId {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
        })
    }
}
