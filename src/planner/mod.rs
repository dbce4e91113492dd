//! The query planner (spec §4.2): compile a GraphQL document into a reusable
//! [`plan::Plan`].

pub mod cache;
pub mod parse;
pub mod plan;

pub use cache::Planner;
pub use plan::{ArgValue, ConnectionSpec, FieldSpec, OperationKind, Plan, Variables};
