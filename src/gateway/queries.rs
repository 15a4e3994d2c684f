//! Parameterized query templates (§6). Kept as plain format strings, the
//! way `octofhir-db-postgres::queries::crud` inlines its SQL rather than
//! reaching for a query builder — the set is small and fixed, unlike the
//! FTS query shapes in [`crate::search::compile`], which genuinely vary per
//! search parameter and so get a small builder of their own.

/// Archive the current live document into `Versions`, returning the
/// archived `versionId`. Bind `{bucket}` and the `Type/id` key at call site.
pub const ARCHIVE_CURRENT_TO_VERSIONS: &str = r#"
INSERT INTO {bucket}.Resources.Versions (KEY k, VALUE v)
SELECT CONCAT(META(r).id, '/', IFNULL(r.meta.versionId,'1')) AS k, r AS v
FROM {bucket}.Resources.{target_collection} r USE KEYS '{key}'
RETURNING RAW Versions.meta.versionId
"#;

/// Idempotent upsert of the live document.
pub const UPSERT_LIVE: &str = r#"
UPSERT INTO {bucket}.Resources.{target_collection} (KEY, VALUE)
VALUES ('{key}', {document})
"#;

/// Idempotent delete of the live document by key.
pub const DELETE_LIVE: &str = r#"
DELETE FROM {bucket}.Resources.{target_collection} USE KEYS '{key}'
"#;

/// Existence check for a tombstone at `Type/id`.
pub const TOMBSTONE_EXISTS: &str = r#"
SELECT COUNT(*) AS count FROM {bucket}.Resources.Tombstones
USE KEYS '{key}'
"#;

/// Fill in `{bucket}`, `{target_collection}`, `{key}`, and `{document}`
/// placeholders in one of the templates above. `document` is pre-serialized
/// JSON and is only needed for [`UPSERT_LIVE`].
pub fn render(template: &str, bucket: &str, target_collection: &str, key: &str, document: &str) -> String {
    template
        .replace("{bucket}", bucket)
        .replace("{target_collection}", target_collection)
        .replace("{key}", key)
        .replace("{document}", document)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_archive_current_to_versions_fills_bucket_collection_and_key() {
        let sql = render(ARCHIVE_CURRENT_TO_VERSIONS, "acme", "Patient", "Patient/p1", "");
        assert!(sql.contains("acme.Resources.Versions"));
        assert!(sql.contains("acme.Resources.Patient"));
        assert!(sql.contains("USE KEYS 'Patient/p1'"));
        assert!(!sql.contains('{'));
    }

    #[test]
    fn render_upsert_live_fills_bucket_collection_key_and_document() {
        let sql = render(UPSERT_LIVE, "acme", "Patient", "Patient/p1", r#"{"resourceType":"Patient"}"#);
        assert!(sql.contains("acme.Resources.Patient"));
        assert!(sql.contains("'Patient/p1'"));
        assert!(sql.contains(r#"{"resourceType":"Patient"}"#));
    }

    #[test]
    fn render_delete_live_fills_bucket_collection_and_key() {
        let sql = render(DELETE_LIVE, "acme", "Patient", "Patient/p1", "");
        assert!(sql.contains("acme.Resources.Patient"));
        assert!(sql.contains("USE KEYS 'Patient/p1'"));
    }

    #[test]
    fn render_tombstone_exists_fills_bucket_and_key_only() {
        let sql = render(TOMBSTONE_EXISTS, "acme", "", "Patient/p1", "");
        assert!(sql.contains("acme.Resources.Tombstones"));
        assert!(sql.contains("USE KEYS 'Patient/p1'"));
        assert!(!sql.contains('{'));
    }
}
