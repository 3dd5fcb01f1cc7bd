//! Mocks and fixtures shared by the agentgraph test suites.

pub mod fixtures;
pub mod model;
pub mod tools;

pub use fixtures::*;
pub use model::{RecordedCall, ScriptedModel, ScriptedTurn};
pub use tools::{tool_context, EchoTool, FailingTool, SlowTool};
