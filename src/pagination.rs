//! Pagination State (§3, §4.12): an opaque-token-addressed record of a
//! result's full key list, served page by page without re-running the
//! underlying query.

use std::time::Duration;

use dashmap::DashMap;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{CoreError, GoneReason};

/// A single registered search/`$everything` result, immutable after creation.
#[derive(Debug, Clone)]
pub struct PaginationState {
    pub token: String,
    pub bucket: String,
    pub all_document_keys: Vec<String>,
    pub page_size: usize,
    pub created_at: OffsetDateTime,
}

impl PaginationState {
    /// The slice of keys for `offset..offset+page_size`, clamped to the list's length.
    pub fn page(&self, offset: usize) -> &[String] {
        if offset >= self.all_document_keys.len() {
            return &[];
        }
        let end = (offset + self.page_size).min(self.all_document_keys.len());
        &self.all_document_keys[offset..end]
    }

    pub fn has_more(&self, offset: usize) -> bool {
        offset + self.page_size < self.all_document_keys.len()
    }
}

/// Server-side store for [`PaginationState`]. Entries are immutable once
/// inserted; the store itself must be concurrency-safe (§5).
pub trait PaginationStore: Send + Sync {
    fn register(&self, bucket: &str, keys: Vec<String>, page_size: usize) -> PaginationState;
    fn lookup(&self, token: &str) -> Result<PaginationState, CoreError>;
}

/// A `DashMap`-backed store with TTL-based expiry, matching the concurrent,
/// read-mostly-with-explicit-invalidation shape `octofhir-search::query_cache`
/// and `octofhir-search::reloadable` use for their own caches.
pub struct InMemoryPaginationStore {
    states: DashMap<String, PaginationState>,
    ttl: Duration,
}

impl InMemoryPaginationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            states: DashMap::new(),
            ttl,
        }
    }

    /// Drop every entry whose TTL has elapsed. Callers may run this
    /// periodically; `lookup` also treats an expired-but-present entry as
    /// `Gone` without needing a sweep to have run first.
    pub fn sweep_expired(&self) {
        let now = OffsetDateTime::now_utc();
        self.states
            .retain(|_, state| now - state.created_at < self.ttl);
    }
}

impl Default for InMemoryPaginationStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(10 * 60))
    }
}

impl PaginationStore for InMemoryPaginationStore {
    fn register(&self, bucket: &str, keys: Vec<String>, page_size: usize) -> PaginationState {
        let state = PaginationState {
            token: Uuid::new_v4().to_string(),
            bucket: bucket.to_string(),
            all_document_keys: keys,
            page_size,
            created_at: OffsetDateTime::now_utc(),
        };
        self.states.insert(state.token.clone(), state.clone());
        state
    }

    fn lookup(&self, token: &str) -> Result<PaginationState, CoreError> {
        let state = self
            .states
            .get(token)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::gone("PaginationState", token, GoneReason::PaginationExpired))?;

        if OffsetDateTime::now_utc() - state.created_at >= self.ttl {
            self.states.remove(token);
            return Err(CoreError::gone(
                "PaginationState",
                token,
                GoneReason::PaginationExpired,
            ));
        }

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_concatenate_to_the_full_key_list() {
        let store = InMemoryPaginationStore::default();
        let keys: Vec<String> = (0..25).map(|i| format!("Patient/{i}")).collect();
        let state = store.register("acme", keys.clone(), 10);

        let mut collected = Vec::new();
        let mut offset = 0;
        loop {
            let page = state.page(offset);
            if page.is_empty() {
                break;
            }
            collected.extend_from_slice(page);
            offset += 10;
        }
        assert_eq!(collected, keys);
    }

    #[test]
    fn offset_past_the_end_returns_empty_without_error() {
        let store = InMemoryPaginationStore::default();
        let state = store.register("acme", vec!["Patient/1".into()], 10);
        assert!(state.page(100).is_empty());
    }

    #[test]
    fn expired_token_is_gone() {
        let store = InMemoryPaginationStore::new(Duration::from_secs(0));
        let state = store.register("acme", vec!["Patient/1".into()], 10);
        std::thread::sleep(Duration::from_millis(5));
        let err = store.lookup(&state.token).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Gone {
                reason: GoneReason::PaginationExpired,
                ..
            }
        ));
    }

    #[test]
    fn unknown_token_is_gone() {
        let store = InMemoryPaginationStore::default();
        assert!(store.lookup("nonexistent").is_err());
    }
}
