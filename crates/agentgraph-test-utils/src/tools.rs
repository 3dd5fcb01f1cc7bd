use std::path::PathBuf;

use futures::future::BoxFuture;

use agentgraph_core::error::{AgentGraphError, Result};
use agentgraph_core::traits::Tool;
use agentgraph_core::types::{ToolContext, ToolResult};

pub fn tool_context(working_dir: impl Into<PathBuf>) -> ToolContext {
    ToolContext {
        session_id: "test-session".to_string(),
        node_name: "test-node".to_string(),
        working_dir: working_dir.into(),
    }
}

/// Returns `input.text`, or the raw input JSON when there is no `text`.
pub struct EchoTool {
    name: String,
}

impl EchoTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Tool for EchoTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Echo the input back"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } }
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let content = input
                .get("text")
                .and_then(|t| t.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| input.to_string());
            Ok(ToolResult::success(content))
        })
    }
}

/// Always fails with a tool execution error.
pub struct FailingTool {
    name: String,
}

impl FailingTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    fn execute(
        &self,
        _input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            Err(AgentGraphError::ToolExecution {
                tool: self.name.clone(),
                message: "simulated failure".to_string(),
            })
        })
    }
}

/// Sleeps far past its own timeout.
pub struct SlowTool {
    name: String,
    timeout_secs: u64,
}

impl SlowTool {
    pub fn new(name: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            timeout_secs,
        }
    }
}

impl Tool for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Never finishes in time"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    fn execute(
        &self,
        _input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        let wait = std::time::Duration::from_secs(self.timeout_secs * 10);
        Box::pin(async move {
            tokio::time::sleep(wait).await;
            Ok(ToolResult::success("too late"))
        })
    }
}
