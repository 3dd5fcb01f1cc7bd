use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use agentgraph_core::error::{AgentGraphError, Result};
use agentgraph_core::traits::Tool;
use agentgraph_core::types::{ToolContext, ToolDefinition, ToolResult};

/// Name-keyed registry of tools that graph nodes bind through `tools`.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: impl Tool) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Definitions for every registered tool.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| definition(t.as_ref())).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Definitions for the tools a node binds, in binding order.
    ///
    /// Returns the definitions found and the names that are not registered.
    pub fn definitions_for(&self, names: &[String]) -> (Vec<ToolDefinition>, Vec<String>) {
        let mut found = Vec::with_capacity(names.len());
        let mut missing = Vec::new();
        for name in names {
            match self.tools.get(name) {
                Some(tool) => found.push(definition(tool.as_ref())),
                None => missing.push(name.clone()),
            }
        }
        (found, missing)
    }

    /// Execute a tool by name under its timeout.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| AgentGraphError::ToolNotFound(name.to_string()))?;

        let timeout_secs = tool.timeout_secs();
        debug!(tool = name, node = %ctx.node_name, timeout_secs, "Executing tool");

        match tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            tool.execute(input, ctx),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AgentGraphError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs,
            }),
        }
    }

    /// A registry with the built-in file tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::read::ReadFileTool);
        registry.register(crate::builtin::write::WriteFileTool);
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn definition(tool: &dyn Tool) -> ToolDefinition {
    ToolDefinition {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        input_schema: tool.input_schema(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentgraph_test_utils::{tool_context, EchoTool, FailingTool, SlowTool};

    #[test]
    fn test_builtins_registered() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(registry.list(), vec!["read_file", "write_file"]);
        assert_eq!(registry.definitions().len(), 2);
    }

    #[test]
    fn test_definitions_for_reports_missing() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool::new("echo"));

        let (defs, missing) =
            registry.definitions_for(&["echo".to_string(), "nope".to_string()]);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
        assert_eq!(missing, vec!["nope".to_string()]);
    }

    #[tokio::test]
    async fn test_execute_known_and_unknown() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool::new("echo"));
        let ctx = tool_context(std::env::temp_dir());

        let result = registry
            .execute("echo", serde_json::json!({"text": "hi"}), ctx.clone())
            .await
            .unwrap();
        assert_eq!(result.content, "hi");

        let err = registry
            .execute("nope", serde_json::json!({}), ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentGraphError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_execute_propagates_failure() {
        let mut registry = ToolRegistry::new();
        registry.register(FailingTool::new("flaky"));
        let err = registry
            .execute("flaky", serde_json::json!({}), tool_context(std::env::temp_dir()))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentGraphError::ToolExecution { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_times_out() {
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool::new("slow", 1));
        let err = registry
            .execute("slow", serde_json::json!({}), tool_context(std::env::temp_dir()))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentGraphError::ToolTimeout { timeout_secs: 1, .. }));
    }
}
