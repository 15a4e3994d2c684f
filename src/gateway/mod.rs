//! The storage gateway: the only subsystem that speaks to the database.
//!
//! `ClusterGateway` and `TxContext` are the core's contract with its
//! external collaborator — the connection pool, retry policy, and
//! circuit-breaker described in §4.3 live behind this trait, outside
//! this crate. Everything else in the crate is written against these two
//! traits, never against a concrete driver.

pub mod queries;
pub mod types;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

pub use types::{
    Found, FtsOptions, FtsQuery, FtsResult, GatewayError, MatchKind, QueryParams, SortDirection,
    SortSpec,
};

/// The canonical scope name every bucket's FHIR data lives under (§6).
pub const RESOURCES_SCOPE: &str = "Resources";

/// Gateway entry points: KV, query, FTS, and transaction start. Concurrency,
/// pooling, timeouts, and retries on transient faults are this trait's
/// implementor's responsibility; the core only calls through it.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Single KV GET. `None` means the key is absent, not an error.
    async fn kv_get(
        &self,
        bucket: &str,
        scope: &str,
        collection: &str,
        key: &str,
    ) -> Result<Option<Bytes>, GatewayError>;

    /// Batch KV GET. The result preserves input order; missing keys map to `None`.
    /// Implementations run the underlying fetches with bounded, in-flight
    /// concurrency (§5) — callers must not assume any particular
    /// completion order beyond the returned vector's order.
    async fn kv_get_many(
        &self,
        bucket: &str,
        scope: &str,
        collection: &str,
        keys: &[String],
    ) -> Result<Vec<(String, Option<Bytes>)>, GatewayError>;

    /// Idempotent upsert outside a transaction (used by standalone POST).
    async fn kv_upsert(
        &self,
        bucket: &str,
        scope: &str,
        collection: &str,
        key: &str,
        value: Bytes,
    ) -> Result<(), GatewayError>;

    /// Remove a key outside a transaction. Absence is not an error.
    async fn kv_remove(
        &self,
        bucket: &str,
        scope: &str,
        collection: &str,
        key: &str,
    ) -> Result<(), GatewayError>;

    /// Run one of the parameterized query templates in [`queries`].
    async fn query(
        &self,
        bucket: &str,
        sql: &str,
        params: QueryParams,
    ) -> Result<Vec<Value>, GatewayError>;

    /// Execute an FTS query against a fully-qualified index name.
    async fn search_query(
        &self,
        index: &str,
        query: FtsQuery,
        options: FtsOptions,
    ) -> Result<FtsResult, GatewayError>;

    /// Start a multi-document ACID transaction scoped to `bucket`. The
    /// returned handle must be consumed by exactly one of `commit`/`rollback`;
    /// dropping it without either is treated by implementations as a rollback.
    async fn begin_transaction(&self, bucket: &str) -> Result<Box<dyn TxContext>, GatewayError>;
}

/// A handle to an in-flight transaction. Supported operations inside a
/// transaction are deliberately narrower than the non-transactional gateway
/// surface (no idempotent upsert — callers choose `insert` vs `replace`
/// explicitly, matching Couchbase transaction semantics).
#[async_trait]
pub trait TxContext: Send {
    /// Read within the transaction; sees this transaction's own uncommitted writes.
    async fn get(&mut self, scope: &str, collection: &str, key: &str) -> Result<Found, GatewayError>;

    /// Insert a new key. Fails if the key already exists.
    async fn insert(
        &mut self,
        scope: &str,
        collection: &str,
        key: &str,
        value: Bytes,
    ) -> Result<(), GatewayError>;

    /// Replace an existing key's value. Fails if the key does not exist.
    async fn replace(
        &mut self,
        scope: &str,
        collection: &str,
        key: &str,
        value: Bytes,
    ) -> Result<(), GatewayError>;

    /// Remove a key. Absence is tolerated (idempotent DELETE relies on this).
    async fn remove(&mut self, scope: &str, collection: &str, key: &str) -> Result<(), GatewayError>;

    /// Commit all operations performed through this handle.
    async fn commit(self: Box<Self>) -> Result<(), GatewayError>;

    /// Discard all operations performed through this handle.
    async fn rollback(self: Box<Self>) -> Result<(), GatewayError>;
}

/// Which transaction a write component should use: one it owns end-to-end
/// (`Fresh`), or one a bundle is already driving across several entries
/// (`Ambient`). See §9's `TxContext` redesign note.
pub enum TxScope<'a> {
    /// Start and commit/rollback a transaction around this single call.
    Fresh,
    /// Join the caller's already-open transaction; the caller commits.
    Ambient(&'a mut dyn TxContext),
}
