//! Write Pipeline (§4.4): POST, PUT, and DELETE share a common skeleton —
//! apply meta, serialize, mutate the live document, archive/tombstone as
//! needed — all under one transaction for PUT/DELETE.

mod delete;
mod post;
mod put;

pub use delete::delete;
pub use post::post;
pub use put::put;

use crate::model::DocumentKey;

/// The result of any of the three write operations.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub key: DocumentKey,
    pub version_id: String,
    /// True if this call created a live document where none existed before.
    pub created: bool,
}
