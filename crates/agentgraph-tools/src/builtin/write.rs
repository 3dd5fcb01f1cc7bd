use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use agentgraph_core::error::{AgentGraphError, Result};
use agentgraph_core::traits::Tool;
use agentgraph_core::types::{ToolContext, ToolResult};

use super::resolve_path;

/// Writes (or appends to) a text file, creating parent directories.
pub struct WriteFileTool;

#[derive(Deserialize)]
struct WriteInput {
    file_path: String,
    content: String,
    #[serde(default)]
    append: bool,
}

impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates parent directories. Overwrites unless append is true."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute path, or path relative to the working directory"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write"
                },
                "append": {
                    "type": "boolean",
                    "description": "Append instead of overwriting (default: false)"
                }
            },
            "required": ["file_path", "content"]
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
            let params: WriteInput = serde_json::from_value(input)
                .map_err(|e| AgentGraphError::ToolValidation(e.to_string()))?;

            let path = resolve_path(&params.file_path, &ctx.working_dir);
            debug!(node = %ctx.node_name, path = %path.display(), append = params.append, "Writing file");

            let io_err = |e: std::io::Error| AgentGraphError::ToolExecution {
                tool: "write_file".to_string(),
                message: format!("{}: {}", path.display(), e),
            };

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }

            if params.append {
                use tokio::io::AsyncWriteExt;
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                    .map_err(io_err)?;
                file.write_all(params.content.as_bytes())
                    .await
                    .map_err(io_err)?;
            } else {
                tokio::fs::write(&path, &params.content)
                    .await
                    .map_err(io_err)?;
            }

            Ok(ToolResult::success(format!(
                "Wrote {} bytes to {}",
                params.content.len(),
                path.display()
            )))
        })
    }
}
