//! An in-memory [`ClusterGateway`] used by this crate's own test suite and
//! reusable by a caller's integration tests. It is not a production backend
//! — the real KV+FTS+transaction driver talking to Couchbase lives outside
//! this crate — so it is grounded in `octofhir-storage::legacy`'s own
//! in-memory scaffolding rather than in a real database driver crate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::gateway::{
    ClusterGateway, Found, FtsOptions, FtsQuery, FtsResult, GatewayError, QueryParams, TxContext,
};

type DocKey = (String, String, String, String); // (bucket, scope, collection, key)
type DocStore = Arc<Mutex<HashMap<DocKey, Bytes>>>;

/// Pulls the single-quoted literal out of a rendered `USE KEYS '...'`
/// clause, the only part of a query template this mock needs to read.
fn extract_use_keys_literal(sql: &str) -> Option<String> {
    let after = sql.split_once("USE KEYS '")?.1;
    let key = after.split_once('\'')?.0;
    Some(key.to_string())
}

/// A simple atomicity-preserving in-memory store: committed documents plus
/// canned FTS results a test seeds ahead of time.
pub struct InMemoryGateway {
    documents: DocStore,
    fts_results: Mutex<HashMap<String, FtsResult>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self {
            documents: Arc::new(Mutex::new(HashMap::new())),
            fts_results: Mutex::new(HashMap::new()),
        }
    }

    /// Directly seed a document, bypassing the write pipeline (useful for
    /// setting up fixtures before exercising a read or search path).
    pub fn seed_document(&self, bucket: &str, scope: &str, collection: &str, key: &str, bytes: Bytes) {
        self.documents.lock().unwrap().insert(
            (bucket.to_string(), scope.to_string(), collection.to_string(), key.to_string()),
            bytes,
        );
    }

    /// Register the next `search_query` result for a given fully-qualified
    /// index name. Tests are expected to know their own query shapes; this
    /// mock does not interpret `FtsQuery` at all.
    pub fn seed_fts_result(&self, index: &str, result: FtsResult) {
        self.fts_results.lock().unwrap().insert(index.to_string(), result);
    }

    pub fn document_count(&self, bucket: &str, scope: &str, collection: &str) -> usize {
        self.documents
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, s, c, _)| b == bucket && s == scope && c == collection)
            .count()
    }
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterGateway for InMemoryGateway {
    async fn kv_get(
        &self,
        bucket: &str,
        scope: &str,
        collection: &str,
        key: &str,
    ) -> Result<Option<Bytes>, GatewayError> {
        Ok(self
            .documents
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), scope.to_string(), collection.to_string(), key.to_string()))
            .cloned())
    }

    async fn kv_get_many(
        &self,
        bucket: &str,
        scope: &str,
        collection: &str,
        keys: &[String],
    ) -> Result<Vec<(String, Option<Bytes>)>, GatewayError> {
        let store = self.documents.lock().unwrap();
        Ok(keys
            .iter()
            .map(|key| {
                let value = store
                    .get(&(bucket.to_string(), scope.to_string(), collection.to_string(), key.clone()))
                    .cloned();
                (key.clone(), value)
            })
            .collect())
    }

    async fn kv_upsert(
        &self,
        bucket: &str,
        scope: &str,
        collection: &str,
        key: &str,
        value: Bytes,
    ) -> Result<(), GatewayError> {
        self.documents.lock().unwrap().insert(
            (bucket.to_string(), scope.to_string(), collection.to_string(), key.to_string()),
            value,
        );
        Ok(())
    }

    async fn kv_remove(
        &self,
        bucket: &str,
        scope: &str,
        collection: &str,
        key: &str,
    ) -> Result<(), GatewayError> {
        self.documents
            .lock()
            .unwrap()
            .remove(&(bucket.to_string(), scope.to_string(), collection.to_string(), key.to_string()));
        Ok(())
    }

    /// Interprets the one query shape this crate actually issues —
    /// [`crate::gateway::queries::TOMBSTONE_EXISTS`] — by reading the
    /// `USE KEYS '...'` literal back out of the rendered SQL; every other
    /// shape returns no rows.
    async fn query(&self, bucket: &str, sql: &str, _params: QueryParams) -> Result<Vec<Value>, GatewayError> {
        if sql.contains("Tombstones") {
            if let Some(key) = extract_use_keys_literal(sql) {
                let exists = self.documents.lock().unwrap().contains_key(&(
                    bucket.to_string(),
                    crate::gateway::RESOURCES_SCOPE.to_string(),
                    "Tombstones".to_string(),
                    key,
                ));
                return Ok(vec![serde_json::json!({"count": if exists { 1 } else { 0 }})]);
            }
        }
        Ok(Vec::new())
    }

    async fn search_query(
        &self,
        index: &str,
        _query: FtsQuery,
        _options: FtsOptions,
    ) -> Result<FtsResult, GatewayError> {
        Ok(self
            .fts_results
            .lock()
            .unwrap()
            .get(index)
            .cloned()
            .unwrap_or_default())
    }

    async fn begin_transaction(&self, bucket: &str) -> Result<Box<dyn TxContext>, GatewayError> {
        Ok(Box::new(InMemoryTx {
            bucket: bucket.to_string(),
            base: Arc::clone(&self.documents),
            staged: HashMap::new(),
        }))
    }
}

/// A transaction handle staging writes locally until `commit`, with reads
/// falling through to the committed store for keys it hasn't touched yet.
struct InMemoryTx {
    bucket: String,
    base: DocStore,
    staged: HashMap<DocKey, Option<Bytes>>, // None = staged remove
}

impl InMemoryTx {
    fn doc_key(&self, scope: &str, collection: &str, key: &str) -> DocKey {
        (self.bucket.clone(), scope.to_string(), collection.to_string(), key.to_string())
    }
}

#[async_trait]
impl TxContext for InMemoryTx {
    async fn get(&mut self, scope: &str, collection: &str, key: &str) -> Result<Found, GatewayError> {
        let doc_key = self.doc_key(scope, collection, key);
        if let Some(staged) = self.staged.get(&doc_key) {
            return Ok(match staged {
                Some(bytes) => Found::Document(bytes.clone()),
                None => Found::Missing,
            });
        }
        match self.base.lock().unwrap().get(&doc_key).cloned() {
            Some(bytes) => Ok(Found::Document(bytes)),
            None => Ok(Found::Missing),
        }
    }

    async fn insert(
        &mut self,
        scope: &str,
        collection: &str,
        key: &str,
        value: Bytes,
    ) -> Result<(), GatewayError> {
        let doc_key = self.doc_key(scope, collection, key);
        let exists = match self.staged.get(&doc_key) {
            Some(Some(_)) => true,
            Some(None) => false,
            None => self.base.lock().unwrap().contains_key(&doc_key),
        };
        if exists {
            return Err(GatewayError::Transient(format!("key already exists: {key}")));
        }
        self.staged.insert(doc_key, Some(value));
        Ok(())
    }

    async fn replace(
        &mut self,
        scope: &str,
        collection: &str,
        key: &str,
        value: Bytes,
    ) -> Result<(), GatewayError> {
        let doc_key = self.doc_key(scope, collection, key);
        let exists = match self.staged.get(&doc_key) {
            Some(Some(_)) => true,
            Some(None) => false,
            None => self.base.lock().unwrap().contains_key(&doc_key),
        };
        if !exists {
            return Err(GatewayError::NotFound);
        }
        self.staged.insert(doc_key, Some(value));
        Ok(())
    }

    async fn remove(&mut self, scope: &str, collection: &str, key: &str) -> Result<(), GatewayError> {
        let doc_key = self.doc_key(scope, collection, key);
        self.staged.insert(doc_key, None);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), GatewayError> {
        let mut base = self.base.lock().unwrap();
        for (key, value) in self.staged {
            match value {
                Some(bytes) => {
                    base.insert(key, bytes);
                }
                None => {
                    base.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), GatewayError> {
        Ok(())
    }
}
