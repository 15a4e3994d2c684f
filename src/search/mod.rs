//! Search Engine (§4.6): parameter-type dispatch, FTS compilation, and the
//! six-phase execution pipeline.

pub mod engine;
pub mod params;

pub use engine::{SearchConfig, SearchEngine, SearchOutcome, SearchRequest, SummaryMode, TotalMode};
pub use params::{ParsedCriterion, SearchParamDef, SearchParamKind, SearchParamRegistry};
