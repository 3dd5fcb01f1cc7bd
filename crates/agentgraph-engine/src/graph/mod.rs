//! Graph preprocessing: validation, subgraph cycle detection, flattening
//! and dependency levels.
//!
//! Everything here is a pure transform over [`GraphDefinition`]s; catalogs
//! of models and graphs are consulted read-only.
//!
//! [`GraphDefinition`]: agentgraph_core::graph::GraphDefinition

mod flatten;
mod levels;
pub mod processor;

pub use levels::calculate_levels;
pub use processor::{GraphProcessor, MAX_SUBGRAPH_DEPTH};
