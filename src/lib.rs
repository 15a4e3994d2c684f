//! FHIR R4 resource orchestration engine over a KV + full-text-search +
//! transactional document store.
//!
//! This crate implements the resource orchestration core: Routing &
//! Mapping, Meta & Audit, the Storage Gateway contract, the Write Pipeline
//! (POST/PUT/DELETE), the Conditional Resolver, the Search Engine, Include
//! Expansion, `$everything`, History, the Bundle Processor, the Fast Bundle
//! Writer, and Pagination State. The REST surface, the mapping file's
//! contents, the security context, and the actual KV/FTS/transaction driver
//! are all external collaborators — this crate is written entirely against
//! the [`gateway::ClusterGateway`] and [`routing::ResourceMapping`] traits.

pub mod batch;
pub mod bundle;
pub mod conditional;
pub mod config;
pub mod error;
pub mod everything;
pub mod fast_bundle;
pub mod gateway;
pub mod history;
pub mod include;
pub mod meta;
pub mod model;
pub mod pagination;
pub mod routing;
pub mod search;
pub mod write;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{CoreError, GoneReason};
pub use gateway::{ClusterGateway, TxContext, TxScope};
pub use model::{DocumentKey, ResourceRef, StoredDocument, Tombstone};
pub use routing::ResourceMapping;
