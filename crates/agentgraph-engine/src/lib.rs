//! The agentgraph execution engine.
//!
//! A graph definition is prepared by [`GraphProcessor`] (validate, flatten
//! subgraphs, compute levels), then driven by the [`Scheduler`], which asks
//! [`checkpoint::resume_point`] what to run next and hands single nodes to
//! the [`NodeRunner`]. All run state lives in a [`SharedSession`] that is
//! persisted after every node.

pub mod checkpoint;
pub mod graph;
pub mod placeholder;
pub mod registry;
pub mod run_log;
pub mod runner;
pub mod scheduler;
pub mod state;

pub use checkpoint::{rebuild_from_rounds, resume_point, rewind, ResumeDecision};
pub use graph::{calculate_levels, GraphProcessor};
pub use placeholder::{referenced_nodes, resolve, OutputSnapshot};
pub use registry::{GraphLibrary, ModelRegistry, PromptSet};
pub use run_log::RunLogger;
pub use runner::NodeRunner;
pub use scheduler::{RunOutcome, Scheduler};
pub use state::{MemorySessionStore, SessionManager, SharedSession};
