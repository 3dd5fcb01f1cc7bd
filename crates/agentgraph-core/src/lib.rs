pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod session;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{AgentGraphError, Result};
pub use event::EventBus;
pub use graph::{GraphDefinition, Node, NodeKind, NodeOrigin};
pub use session::{ExecutionSession, HandoffStatus, NodeResult, NodeRun, Round, RunStatus};
pub use types::*;
