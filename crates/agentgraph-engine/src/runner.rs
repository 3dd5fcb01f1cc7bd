//! Executes a single node: prompt resolution, the tool-call loop and handoffs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use agentgraph_core::error::{AgentGraphError, Result};
use agentgraph_core::event::EventBus;
use agentgraph_core::graph::{Node, HANDOFF_TOOL_PREFIX};
use agentgraph_core::session::{NodeResult, NodeRun};
use agentgraph_core::traits::{ArtifactStore, PromptLibrary};
use agentgraph_core::types::*;
use agentgraph_tools::ToolRegistry;

use crate::placeholder::{referenced_nodes, resolve, OutputSnapshot};
use crate::registry::ModelRegistry;
use crate::state::SharedSession;

/// Accumulator for streaming tool call deltas.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    input_json: String,
}

/// What one node execution produced, kept even when it fails midway.
#[derive(Debug, Default)]
struct Transcript {
    messages: Vec<ChatMessage>,
    final_text: String,
    tool_outputs: Vec<String>,
    handoff_target: Option<String>,
}

/// Name of the handoff tool offered for `target`.
pub fn handoff_tool_name(target: &str) -> String {
    let sanitized: String = target
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    format!("{}{}", HANDOFF_TOOL_PREFIX, sanitized)
}

fn handoff_definition(tool_name: &str, target: &str) -> ToolDefinition {
    ToolDefinition {
        name: tool_name.to_string(),
        description: format!("Transfer control to the '{}' node.", target),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "reason": {
                    "type": "string",
                    "description": "Why control is being transferred"
                }
            }
        }),
    }
}

fn truncate_output(content: String, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content;
    }
    let kept: String = content.chars().take(max_chars).collect();
    format!("{}\n[truncated]", kept)
}

/// Runs one node at a time against a shared session.
pub struct NodeRunner {
    models: Arc<ModelRegistry>,
    tools: Arc<ToolRegistry>,
    prompts: Arc<dyn PromptLibrary>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    event_bus: Arc<EventBus>,
    max_iterations: usize,
    max_tool_output_chars: usize,
    working_dir: PathBuf,
}

impl NodeRunner {
    pub fn new(
        models: Arc<ModelRegistry>,
        tools: Arc<ToolRegistry>,
        prompts: Arc<dyn PromptLibrary>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            models,
            tools,
            prompts,
            artifacts: None,
            event_bus,
            max_iterations: 10,
            max_tool_output_chars: 16_000,
            working_dir: PathBuf::from("."),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_max_tool_output_chars(mut self, max_chars: usize) -> Self {
        self.max_tool_output_chars = max_chars;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn prompts(&self) -> &Arc<dyn PromptLibrary> {
        &self.prompts
    }

    /// Execute `node` once and record the result in `session`.
    ///
    /// Model and tool-argument failures end up in the result's `error`; only
    /// persistence failures are returned as `Err`.
    pub async fn run(
        &self,
        session: &SharedSession,
        node: &Node,
        handoff_source: Option<String>,
    ) -> Result<NodeResult> {
        let started = Instant::now();
        let session_id = session.id().to_string();
        info!(session = %session_id, node = %node.name, level = node.level, "Running node");
        self.event_bus.publish(GraphEvent::NodeStarted {
            session_id: session_id.clone(),
            node: node.name.clone(),
            level: node.level,
        });

        let mut transcript = Transcript::default();
        let error = match self.converse(session, node, &mut transcript).await {
            Ok(()) => None,
            Err(e) => {
                error!(session = %session_id, node = %node.name, error = %e, "Node failed");
                Some(e.to_string())
            }
        };

        let output = match (&error, node.output_enabled) {
            (Some(_), _) => String::new(),
            (None, true) => transcript.final_text,
            (None, false) => transcript.tool_outputs.join("\n\n"),
        };
        let handoff_target = if error.is_none() {
            transcript.handoff_target
        } else {
            None
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = session
            .record_node_run(NodeRun {
                node_name: node.name.clone(),
                level: node.level,
                messages: transcript.messages,
                model: node.model_name().unwrap_or_default().to_string(),
                output,
                error,
                handoff_target,
                handoff_source,
                elapsed_ms,
            })
            .await?;

        if let Some(target) = &result.handoff_target {
            info!(session = %session_id, from = %node.name, to = %target, "Handoff selected");
            self.event_bus.publish(GraphEvent::Handoff {
                session_id: session_id.clone(),
                from: node.name.clone(),
                to: target.clone(),
            });
        }
        self.event_bus.publish(GraphEvent::NodeCompleted {
            session_id: session_id.clone(),
            node: node.name.clone(),
            error: result.error.clone(),
            elapsed_ms,
        });

        if result.succeeded() {
            self.save_artifact(&session_id, node, &result.output).await;
        }

        Ok(result)
    }

    async fn save_artifact(&self, session_id: &str, node: &Node, output: &str) {
        let (Some(extension), Some(artifacts)) = (&node.save, &self.artifacts) else {
            return;
        };
        match artifacts.write(session_id, &node.name, extension, output).await {
            Ok(location) => debug!(node = %node.name, %location, "Saved node output"),
            Err(e) => warn!(node = %node.name, error = %e, "Failed to save node output"),
        }
    }

    async fn build_prompts(&self, session: &SharedSession, node: &Node) -> (String, String) {
        let snapshot = OutputSnapshot::from_session(&*session.lock().await);

        let prompts = self.prompts.as_ref();
        let system = resolve(&node.system_prompt, &snapshot, prompts);
        let mut user = resolve(&node.user_prompt, &snapshot, prompts);

        let mut referenced = referenced_nodes(&node.system_prompt);
        referenced.extend(referenced_nodes(&node.user_prompt));
        for input in &node.input_nodes {
            if referenced.iter().any(|r| r == input) {
                continue;
            }
            let value = snapshot.latest(input).unwrap_or_default();
            if value.is_empty() {
                continue;
            }
            if !user.is_empty() {
                user.push_str("\n\n");
            }
            user.push_str(value);
        }
        (system, user)
    }

    /// Handoff tools offered to `node`, keyed by tool name.
    async fn handoff_tools(&self, session: &SharedSession, node: &Node) -> HashMap<String, String> {
        let quota_left = session
            .lock()
            .await
            .handoff_status(&node.name)
            .is_some_and(|s| s.has_remaining());
        if node.handoffs.is_none() || !quota_left {
            return HashMap::new();
        }

        let mut tools = HashMap::new();
        for target in node.handoff_targets() {
            let name = handoff_tool_name(target);
            if let Some(existing) = tools.get(&name) {
                warn!(node = %node.name, tool = %name, %existing, skipped = target, "Handoff tool name collision");
                continue;
            }
            tools.insert(name, target.to_string());
        }
        tools
    }

    async fn converse(
        &self,
        session: &SharedSession,
        node: &Node,
        transcript: &mut Transcript,
    ) -> Result<()> {
        let model_name = node
            .model_name()
            .ok_or_else(|| AgentGraphError::InvalidGraph(format!("{} is not an agent node", node.name)))?;
        let model = self
            .models
            .get(model_name)
            .ok_or_else(|| AgentGraphError::ModelNotFound(model_name.to_string()))?;

        let (system, user) = self.build_prompts(session, node).await;
        if !system.is_empty() {
            transcript.messages.push(ChatMessage::system(system));
        }
        transcript.messages.push(ChatMessage::user(user));

        let (mut tool_defs, missing) = self.tools.definitions_for(&node.tools);
        if !missing.is_empty() {
            warn!(node = %node.name, ?missing, "Skipping unknown tools");
        }
        let handoffs = self.handoff_tools(session, node).await;
        let mut handoff_names: Vec<&String> = handoffs.keys().collect();
        handoff_names.sort();
        for name in handoff_names {
            tool_defs.push(handoff_definition(name, &handoffs[name]));
        }

        let tool_ctx = ToolContext {
            session_id: session.id().to_string(),
            node_name: node.name.clone(),
            working_dir: self.working_dir.clone(),
        };

        for iteration in 0..self.max_iterations {
            debug!(node = %node.name, iteration, "Calling model");

            let mut stream = model
                .client
                .chat_stream(&model.config, transcript.messages.clone(), &tool_defs)
                .await?;

            let mut text_content = String::new();
            let mut tool_calls: Vec<ToolCallAccumulator> = Vec::new();

            while let Some(delta) = stream.next().await {
                match delta? {
                    StreamDelta::TextDelta(text) => {
                        self.event_bus.publish(GraphEvent::TextDelta {
                            node: node.name.clone(),
                            text: text.clone(),
                        });
                        text_content.push_str(&text);
                    }
                    StreamDelta::ToolUseStart { index, id, name } => {
                        while tool_calls.len() <= index {
                            tool_calls.push(ToolCallAccumulator::default());
                        }
                        tool_calls[index].id = id;
                        tool_calls[index].name = name;
                    }
                    StreamDelta::ToolInputDelta { index, delta } => {
                        if let Some(tc) = tool_calls.get_mut(index) {
                            tc.input_json.push_str(&delta);
                        }
                    }
                    StreamDelta::Usage {
                        input_tokens,
                        output_tokens,
                    } => {
                        self.event_bus.publish(GraphEvent::Usage {
                            node: node.name.clone(),
                            input_tokens,
                            output_tokens,
                        });
                    }
                    StreamDelta::Stop(_) => {}
                }
            }
            drop(stream);
            tool_calls.retain(|tc| !tc.name.is_empty());

            let mut parsed = Vec::with_capacity(tool_calls.len());
            for tc in &tool_calls {
                match parse_arguments(tc) {
                    Ok(input) => parsed.push(input),
                    Err(e) => {
                        if !text_content.is_empty() {
                            transcript.messages.push(ChatMessage::assistant_text(&text_content));
                        }
                        return Err(e);
                    }
                }
            }

            let mut content = Vec::new();
            if !text_content.is_empty() {
                content.push(ContentBlock::Text {
                    text: text_content.clone(),
                });
            }
            for (tc, input) in tool_calls.iter().zip(&parsed) {
                content.push(ContentBlock::ToolUse {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    input: input.clone(),
                });
            }
            transcript.messages.push(ChatMessage {
                role: Role::Assistant,
                content,
                timestamp: Some(chrono::Utc::now()),
            });
            transcript.final_text = text_content;

            if tool_calls.is_empty() {
                return Ok(());
            }

            if let Some((tc, input)) = tool_calls
                .iter()
                .zip(&parsed)
                .find(|(tc, _)| handoffs.contains_key(&tc.name))
            {
                let target = handoffs[&tc.name].clone();
                if let Some(reason) = input.get("reason").and_then(|r| r.as_str()) {
                    debug!(node = %node.name, %target, reason, "Handoff reason");
                    if transcript.final_text.is_empty() {
                        transcript.final_text = reason.to_string();
                    }
                }
                transcript.messages.push(ChatMessage::tool_result(
                    &tc.id,
                    format!("Transferred to {}", target),
                    false,
                ));
                transcript.handoff_target = Some(target);
                return Ok(());
            }

            let mut results = Vec::with_capacity(tool_calls.len());
            for (tc, input) in tool_calls.iter().zip(parsed) {
                self.event_bus.publish(GraphEvent::ToolStart {
                    node: node.name.clone(),
                    name: tc.name.clone(),
                    input: input.clone(),
                });

                let result = match self.tools.execute(&tc.name, input, tool_ctx.clone()).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(node = %node.name, tool = %tc.name, error = %e, "Tool call failed");
                        ToolResult::error(e.to_string())
                    }
                };
                let result = ToolResult {
                    content: truncate_output(result.content, self.max_tool_output_chars),
                    is_error: result.is_error,
                };

                self.event_bus.publish(GraphEvent::ToolEnd {
                    node: node.name.clone(),
                    name: tc.name.clone(),
                    result: result.clone(),
                });
                transcript.tool_outputs.push(result.content.clone());
                results.push(ContentBlock::ToolResult {
                    tool_use_id: tc.id.clone(),
                    content: result.content,
                    is_error: result.is_error,
                });
            }
            transcript.messages.push(ChatMessage {
                role: Role::User,
                content: results,
                timestamp: Some(chrono::Utc::now()),
            });
        }

        warn!(
            node = %node.name,
            max_iterations = self.max_iterations,
            "Iteration limit reached, keeping last answer"
        );
        Ok(())
    }
}

fn parse_arguments(tc: &ToolCallAccumulator) -> Result<serde_json::Value> {
    if tc.input_json.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(&tc.input_json).map_err(|e| {
        AgentGraphError::ToolValidation(format!("malformed arguments for {}: {}", tc.name, e))
    })
}
