//! Bounded-concurrency fan-out (§5: "the batch KV step issues many in-flight
//! reads against the gateway with bounded parallelism"). Used wherever a
//! component must issue more than one independent gateway call and join the
//! results — grouped-by-collection KV fetches, `$everything`'s per-collection
//! FTS fan-out.

use futures_util::stream::{self, StreamExt};

use crate::model::StoredDocument;

/// The default in-flight cap for fan-out gateway calls (§5).
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Run `f` over every item in `items` with at most `concurrency` futures in
/// flight at once. Completion order is unordered (`buffer_unordered`); the
/// results are re-sorted back to input order before returning, so callers
/// that rely on positional/collection order (`$everything`'s stable
/// collection concatenation, §4.8) don't have to re-sort themselves.
pub async fn fan_out<T, F, Fut, O>(items: Vec<T>, concurrency: usize, f: F) -> Vec<O>
where
    F: Fn(T) -> Fut,
    Fut: std::future::Future<Output = O>,
{
    let mut indexed: Vec<(usize, O)> = stream::iter(items.into_iter().enumerate())
        .map(|(i, item)| {
            let fut = f(item);
            async move { (i, fut.await) }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;
    indexed.sort_unstable_by_key(|(i, _)| *i);
    indexed.into_iter().map(|(_, v)| v).collect()
}

/// Group document keys by their resource type, preserving first-seen order
/// of both the groups and the keys within each group. Used ahead of a batch
/// KV fetch that must hit one collection per resource type.
pub fn group_by_resource_type(keys: Vec<String>) -> Vec<(String, Vec<String>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: std::collections::HashMap<String, Vec<String>> = std::collections::HashMap::new();
    for key in keys {
        let resource_type = key.split('/').next().unwrap_or_default().to_string();
        if !groups.contains_key(&resource_type) {
            order.push(resource_type.clone());
        }
        groups.entry(resource_type).or_default().push(key);
    }
    order
        .into_iter()
        .map(|resource_type| {
            let keys = groups.remove(&resource_type).unwrap_or_default();
            (resource_type, keys)
        })
        .collect()
}

/// Re-order fetched documents to match the original key order, dropping any
/// key that resolved to `None` (already deleted, or a stale FTS row).
pub fn reorder_by_keys(keys: &[String], mut fetched: Vec<StoredDocument>) -> Vec<StoredDocument> {
    let mut by_key: std::collections::HashMap<String, StoredDocument> = fetched
        .drain(..)
        .map(|doc| (doc.key.to_string(), doc))
        .collect();
    keys.iter().filter_map(|key| by_key.remove(key)).collect()
}
