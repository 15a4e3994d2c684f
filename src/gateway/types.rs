//! Types exchanged with the [`ClusterGateway`](crate::gateway::ClusterGateway)
//! external collaborator: KV payloads, FTS query shapes, and query parameters.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

/// Errors raised by the gateway boundary (connection pool, timeouts,
/// circuit breaker, transient database contention). The gateway itself is an
/// external collaborator; this crate only needs to know how to fold its
/// failures into [`crate::error::CoreError`].
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("circuit breaker open: {0}")]
    CircuitOpen(String),
    #[error("transient contention: {0}")]
    Transient(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("query error: {0}")]
    Query(String),
    #[error("document not found")]
    NotFound,
}

/// The outcome of a `get` performed inside a transaction. §9 calls out
/// that `DocumentNotFound`-as-exception becomes a tagged result here.
#[derive(Debug, Clone)]
pub enum Found {
    Document(Bytes),
    Missing,
}

impl Found {
    pub fn into_option(self) -> Option<Bytes> {
        match self {
            Found::Document(bytes) => Some(bytes),
            Found::Missing => None,
        }
    }
}

/// Parameters bound into a parameterized query template (§6).
#[derive(Debug, Clone, Default)]
pub struct QueryParams(pub HashMap<String, Value>);

impl QueryParams {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }
}

/// How a [`FtsQuery::Term`] should match its value against the indexed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Exact, case-sensitive match (string `:exact`, token system/code match).
    Exact,
    /// Case-insensitive "starts with" (string default modifier).
    Prefix,
    /// Full-text substring match (string `:contains`).
    Contains,
}

/// One clause of a compiled FTS query. A [`FtsQuery::Conjunction`] ANDs its
/// children; the search engine and `$everything` both assemble one of these
/// per request.
#[derive(Debug, Clone)]
pub enum FtsQuery {
    /// Term match on a single indexed path.
    Term {
        path: String,
        value: String,
        kind: MatchKind,
    },
    /// Any of the given terms matches the path (used for OR'd reference/date clauses).
    Disjunction(Vec<FtsQuery>),
    /// All clauses must match.
    Conjunction(Vec<FtsQuery>),
    /// Inclusive/exclusive range on a date-typed path.
    DateRange {
        path: String,
        start: Option<String>,
        start_inclusive: bool,
        end: Option<String>,
        end_inclusive: bool,
    },
    /// Matches every document in the index (used for unfiltered history/search).
    MatchAll,
}

impl FtsQuery {
    pub fn term(path: impl Into<String>, value: impl Into<String>, kind: MatchKind) -> FtsQuery {
        FtsQuery::Term {
            path: path.into(),
            value: value.into(),
            kind,
        }
    }

    pub fn or(clauses: Vec<FtsQuery>) -> FtsQuery {
        match clauses.len() {
            0 => FtsQuery::MatchAll,
            1 => clauses.into_iter().next().expect("len checked"),
            _ => FtsQuery::Disjunction(clauses),
        }
    }

    pub fn and(clauses: Vec<FtsQuery>) -> FtsQuery {
        match clauses.len() {
            0 => FtsQuery::MatchAll,
            1 => clauses.into_iter().next().expect("len checked"),
            _ => FtsQuery::Conjunction(clauses),
        }
    }
}

/// Sort direction for a single [`SortSpec`] field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone)]
pub struct SortSpec {
    pub path: String,
    pub direction: SortDirection,
}

/// Options accompanying an FTS query (§6: limit, skip, disableScoring, includeLocations, timeout).
#[derive(Debug, Clone)]
pub struct FtsOptions {
    pub limit: usize,
    pub skip: usize,
    pub sort: Vec<SortSpec>,
    pub disable_scoring: bool,
    pub include_locations: bool,
    pub timeout: Duration,
}

impl Default for FtsOptions {
    fn default() -> Self {
        Self {
            limit: 1000,
            skip: 0,
            sort: Vec::new(),
            disable_scoring: true,
            include_locations: false,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Result of an FTS query: ordered document keys plus execution diagnostics.
#[derive(Debug, Clone, Default)]
pub struct FtsResult {
    pub row_ids: Vec<String>,
    pub total_rows: Option<u64>,
    pub server_took_ms: u64,
    pub errors: Vec<String>,
}
