use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use agentgraph_core::error::{AgentGraphError, Result};
use agentgraph_core::traits::Tool;
use agentgraph_core::types::{ToolContext, ToolResult};

use super::resolve_path;

/// Reads a text file, optionally a window of its lines.
pub struct ReadFileTool;

#[derive(Deserialize)]
struct ReadInput {
    file_path: String,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file. Supports a 1-indexed line offset and a line limit for large files."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute path, or path relative to the working directory"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-indexed)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read (default: 2000)"
                }
            },
            "required": ["file_path"]
        })
    }

    fn timeout_secs(&self) -> u64 {
        10
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: ReadInput = serde_json::from_value(input)
                .map_err(|e| AgentGraphError::ToolValidation(e.to_string()))?;

            let path = resolve_path(&params.file_path, &ctx.working_dir);
            debug!(node = %ctx.node_name, path = %path.display(), "Reading file");

            let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
                AgentGraphError::ToolExecution {
                    tool: "read_file".to_string(),
                    message: format!("{}: {}", path.display(), e),
                }
            })?;

            let lines: Vec<&str> = content.lines().collect();
            let offset = params.offset.unwrap_or(1).max(1) - 1;
            let limit = params.limit.unwrap_or(2000);
            let start = offset.min(lines.len());
            let end = (offset + limit).min(lines.len());

            let output = lines[start..end].join("\n");
            if output.is_empty() {
                return Ok(ToolResult::success("(empty file)"));
            }
            Ok(ToolResult::success(output))
        })
    }
}
