use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentGraphError {
    // Definition errors
    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("Invalid node '{node}' field '{field}': {message}")]
    InvalidField {
        node: String,
        field: String,
        message: String,
    },

    #[error("Node '{node}' references unknown node '{reference}' in {field}")]
    DanglingReference {
        node: String,
        field: String,
        reference: String,
    },

    #[error("Node '{node}' uses unknown model '{model}'")]
    UnknownModel { node: String, model: String },

    #[error("Node '{node}' embeds unknown graph '{graph}'")]
    UnknownGraph { node: String, graph: String },

    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    #[error("Invalid graph definition: {0}")]
    InvalidGraph(String),

    // Structural errors
    #[error("Subgraph reference cycle: {}", .0.join(" -> "))]
    SubgraphCycle(Vec<String>),

    #[error("Subgraph nesting deeper than {0} levels")]
    SubgraphDepthExceeded(usize),

    #[error("Node dependency cycle involving: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("Model not registered: {0}")]
    ModelNotFound(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    // Session errors
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} is already running")]
    SessionBusy(String),

    #[error("Could not allocate a free session id after {0} attempts")]
    SessionIdExhausted(usize),

    #[error("Run exceeded {0} node executions")]
    RunawayExecution(usize),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Artifact store error: {0}")]
    Artifact(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentGraphError {
    /// Definition and structural errors are reported before any node runs.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateNode(_)
                | Self::InvalidField { .. }
                | Self::DanglingReference { .. }
                | Self::UnknownModel { .. }
                | Self::UnknownGraph { .. }
                | Self::GraphNotFound(_)
                | Self::InvalidGraph(_)
                | Self::SubgraphCycle(_)
                | Self::SubgraphDepthExceeded(_)
                | Self::DependencyCycle(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AgentGraphError>;
