//! Normalize/materialize pipeline (spec §4.6): the bridge between GraphQL
//! response payloads and the record graph.

pub mod fingerprint;
pub mod materialize;
pub mod normalize;

pub use fingerprint::HotCache;
pub use materialize::{materialize, materialize_at, MaterializeResult, MaterializedEdge, MaterializedValue};
pub use normalize::{normalize, normalize_at, NormalizeReport};
