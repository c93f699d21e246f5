//! Structured query plans, the builders that populate them from metadata,
//! and the per-action renderers that serialise them to SQL.

pub mod build;
pub mod plan;
pub mod render;

pub use build::{Criteria, Options};
pub use plan::{Action, ColumnRef, Join, JoinKind, QueryPlan};
