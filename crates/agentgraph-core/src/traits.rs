use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::graph::GraphDefinition;
use crate::session::ExecutionSession;
use crate::types::*;

/// Streaming chat client with tool calling.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// An external capability a node can bind by name.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in LLM tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Persistence backend for execution sessions.
pub trait SessionStore: Send + Sync + 'static {
    /// Insert or replace the persisted document for a session.
    fn save(&self, session: &ExecutionSession) -> BoxFuture<'_, Result<()>>;

    /// Load a session document, if present.
    fn load(&self, id: &str) -> BoxFuture<'_, Result<Option<ExecutionSession>>>;

    /// Whether a session id is already taken.
    fn exists(&self, id: &str) -> BoxFuture<'_, Result<bool>>;

    /// Delete a session document. Returns whether anything was removed.
    fn delete(&self, id: &str) -> BoxFuture<'_, Result<bool>>;

    /// List stored session ids, most recently updated first.
    fn list(&self) -> BoxFuture<'_, Result<Vec<String>>>;
}

/// Receives the outputs of nodes with `save` set.
pub trait ArtifactStore: Send + Sync + 'static {
    /// Write `content` for `node` in `session_id` using `extension` as file type.
    /// Returns a locator for the written artifact.
    fn write(
        &self,
        session_id: &str,
        node: &str,
        extension: &str,
        content: &str,
    ) -> BoxFuture<'_, Result<String>>;
}

/// Registered prompt templates referenced as `{{@name}}`.
pub trait PromptLibrary: Send + Sync + 'static {
    fn prompt(&self, name: &str) -> Option<String>;
}

/// Models that `model_name` may reference.
pub trait ModelCatalog: Send + Sync + 'static {
    fn has_model(&self, name: &str) -> bool;
}

/// Graphs that `subgraph_name` may reference.
pub trait GraphCatalog: Send + Sync + 'static {
    fn graph(&self, name: &str) -> Option<GraphDefinition>;
}
