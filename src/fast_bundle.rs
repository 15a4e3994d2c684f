//! Fast Bundle Writer (§4.11): emit a `searchset` Bundle as UTF-8 bytes
//! without ever decoding the stored resource bytes. The only JSON values
//! built here are the envelope fields (`id`, `meta`, `link`); every resource
//! is written verbatim from its stored `Bytes`.

use bytes::{BufMut, Bytes, BytesMut};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::StoredDocument;

/// Whether an entry matched the search directly or was pulled in by
/// `_include`/`_revinclude` (§4.7, §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Match,
    Include,
}

impl SearchMode {
    fn as_str(self) -> &'static str {
        match self {
            SearchMode::Match => "match",
            SearchMode::Include => "include",
        }
    }
}

/// The three possible link relations a searchset page carries.
#[derive(Debug, Clone, Default)]
pub struct BundleLinks {
    pub this_self: String,
    pub next: Option<String>,
    pub previous: Option<String>,
}

/// Stream a `searchset` Bundle into `out`. `base` is the URL prefix
/// `fullUrl`s are built from (`{base}/{key}`); `total` is the Bundle's
/// `total` field, independent of how many entries are actually attached.
pub fn write_searchset(
    out: &mut BytesMut,
    base: &str,
    total: u64,
    links: &BundleLinks,
    primary: &[StoredDocument],
    included: &[StoredDocument],
) -> Result<(), CoreError> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|e| CoreError::internal(format!("failed to format Bundle.meta.lastUpdated: {e}")))?;
    let bundle_id = Uuid::new_v4().to_string();

    out.put_slice(br#"{"resourceType":"Bundle","id":"#);
    write_json_string(out, &bundle_id);
    out.put_slice(br#","meta":{"lastUpdated":"#);
    write_json_string(out, &now);
    out.put_slice(br#"},"type":"searchset","total":"#);
    out.put_slice(total.to_string().as_bytes());
    out.put_slice(br#","link":["#);

    write_link(out, "self", &links.this_self);
    if let Some(next) = &links.next {
        out.put_u8(b',');
        write_link(out, "next", next);
    }
    if let Some(previous) = &links.previous {
        out.put_u8(b',');
        write_link(out, "previous", previous);
    }
    out.put_slice(br#"],"entry":["#);

    let mut first = true;
    for doc in primary {
        write_entry(out, base, doc, SearchMode::Match, &mut first);
    }
    for doc in included {
        write_entry(out, base, doc, SearchMode::Include, &mut first);
    }

    out.put_slice(b"]}");
    Ok(())
}

/// An empty searchset: `total:0`, no entries, only a self link.
pub fn write_empty_searchset(out: &mut BytesMut, base: &str, self_link: &str) -> Result<(), CoreError> {
    write_searchset(out, base, 0, &BundleLinks { this_self: self_link.to_string(), next: None, previous: None }, &[], &[])
}

fn write_link(out: &mut BytesMut, relation: &str, url: &str) {
    out.put_slice(br#"{"relation":"#);
    write_json_string(out, relation);
    out.put_slice(br#","url":"#);
    write_json_string(out, url);
    out.put_u8(b'}');
}

fn write_entry(out: &mut BytesMut, base: &str, doc: &StoredDocument, mode: SearchMode, first: &mut bool) {
    if !*first {
        out.put_u8(b',');
    }
    *first = false;

    out.put_slice(br#"{"fullUrl":"#);
    write_json_string(out, &format!("{base}/{}", doc.key));
    out.put_slice(br#","resource":"#);
    out.put_slice(resource_bytes(&doc.bytes));
    out.put_slice(br#","search":{"mode":"#);
    write_json_string(out, mode.as_str());
    out.put_slice(br#"}}"#);
}

/// The stored bytes are already valid JSON for a single resource object;
/// emitted byte-for-byte (§4.11's "resource bytes are concatenated verbatim").
fn resource_bytes(bytes: &Bytes) -> &[u8] {
    bytes.as_ref()
}

fn write_json_string(out: &mut BytesMut, value: &str) {
    out.put_u8(b'"');
    for ch in value.chars() {
        match ch {
            '"' => out.put_slice(b"\\\""),
            '\\' => out.put_slice(b"\\\\"),
            '\n' => out.put_slice(b"\\n"),
            '\r' => out.put_slice(b"\\r"),
            '\t' => out.put_slice(b"\\t"),
            c if (c as u32) < 0x20 => {
                out.put_slice(format!("\\u{:04x}", c as u32).as_bytes());
            }
            c => {
                let mut buf = [0u8; 4];
                out.put_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.put_u8(b'"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DocumentKey;
    use time::OffsetDateTime;

    fn doc(resource_type: &str, id: &str, body: &'static [u8]) -> StoredDocument {
        StoredDocument {
            key: DocumentKey::live(resource_type, id),
            bytes: Bytes::from_static(body),
            resource_type: resource_type.to_string(),
            version_id: "1".to_string(),
            last_updated: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn empty_searchset_has_zero_total_and_only_self_link() {
        let mut out = BytesMut::new();
        write_empty_searchset(&mut out, "https://fhir.example.com", "https://fhir.example.com/Patient?_count=20").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["total"], 0);
        assert_eq!(value["entry"].as_array().unwrap().len(), 0);
        assert_eq!(value["link"].as_array().unwrap().len(), 1);
        assert_eq!(value["link"][0]["relation"], "self");
    }

    #[test]
    fn resource_bytes_are_embedded_verbatim() {
        let mut out = BytesMut::new();
        let primary = vec![doc("Patient", "1", br#"{"resourceType":"Patient","id":"1"}"#)];
        write_searchset(
            &mut out,
            "https://fhir.example.com",
            1,
            &BundleLinks {
                this_self: "https://fhir.example.com/Patient?_count=20".to_string(),
                next: None,
                previous: None,
            },
            &primary,
            &[],
        )
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["entry"][0]["search"]["mode"], "match");
        assert_eq!(value["entry"][0]["resource"]["id"], "1");
        assert_eq!(value["entry"][0]["fullUrl"], "https://fhir.example.com/Patient/1");
    }

    #[test]
    fn included_entries_are_tagged_include() {
        let mut out = BytesMut::new();
        let primary = vec![doc("Observation", "1", br#"{"resourceType":"Observation","id":"1"}"#)];
        let included = vec![doc("Patient", "1", br#"{"resourceType":"Patient","id":"1"}"#)];
        write_searchset(
            &mut out,
            "https://fhir.example.com",
            2,
            &BundleLinks {
                this_self: "https://fhir.example.com/Observation?_count=20".to_string(),
                next: Some("https://fhir.example.com/Observation?_getpages=abc&_getpagesoffset=20".to_string()),
                previous: None,
            },
            &primary,
            &included,
        )
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["entry"].as_array().unwrap().len(), 2);
        assert_eq!(value["entry"][1]["search"]["mode"], "include");
        assert_eq!(value["link"].as_array().unwrap().len(), 2);
    }
}
