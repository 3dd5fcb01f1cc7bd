use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use agentgraph_core::config::ModelConfig;
use agentgraph_core::error::{AgentGraphError, Result};
use agentgraph_core::traits::LlmClient;
use agentgraph_core::types::*;

/// One scripted model response.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Plain answer, streamed in small chunks.
    Text(String),
    /// Tool calls as `(name, raw JSON arguments)`, optionally with leading text.
    ToolCalls {
        text: String,
        calls: Vec<(String, String)>,
    },
    /// The request itself fails.
    RequestError(String),
    /// The stream yields some text and then fails.
    StreamError(String),
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn tool_call(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self::ToolCalls {
            text: String::new(),
            calls: vec![(name.into(), args.to_string())],
        }
    }

    /// A tool call whose arguments are not valid JSON.
    pub fn malformed_call(name: impl Into<String>) -> Self {
        Self::ToolCalls {
            text: String::new(),
            calls: vec![(name.into(), "{\"unterminated".to_string())],
        }
    }
}

/// What the model saw on one call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
    pub tool_names: Vec<String>,
}

impl RecordedCall {
    pub fn system_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(ChatMessage::text)
            .collect()
    }

    /// Text of the first user message (the resolved user prompt).
    pub fn user_text(&self) -> String {
        self.messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(ChatMessage::text)
            .unwrap_or_default()
    }
}

/// A model client replaying scripted turns per `model_id`.
///
/// When a model's script is exhausted it answers `"<model_id>: <user prompt>"`,
/// which keeps data flow through a graph easy to assert on.
#[derive(Default)]
pub struct ScriptedModel {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedTurn>>>,
    calls: Mutex<Vec<RecordedCall>>,
    latency: Option<Duration>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response by `latency` before the first delta.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue a response for `model_id`.
    pub fn push(&self, model_id: &str, turn: ScriptedTurn) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(model_id.to_string())
            .or_default()
            .push_back(turn);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, model_id: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.model_id == model_id)
            .collect()
    }

    fn next_turn(&self, model_id: &str, messages: &[ChatMessage]) -> ScriptedTurn {
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(model_id)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| {
            let prompt = messages
                .iter()
                .find(|m| m.role == Role::User)
                .map(ChatMessage::text)
                .unwrap_or_default();
            ScriptedTurn::Text(format!("{}: {}", model_id, prompt))
        })
    }
}

fn text_chunks(text: &str) -> Vec<Result<StreamDelta>> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(8)
        .map(|c| Ok(StreamDelta::TextDelta(c.iter().collect())))
        .collect()
}

impl LlmClient for ScriptedModel {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let model_id = config.model_id.clone();
        let turn = self.next_turn(&model_id, &messages);
        self.calls.lock().unwrap().push(RecordedCall {
            model_id,
            messages,
            tool_names: tools.iter().map(|t| t.name.clone()).collect(),
        });

        let latency = self.latency;
        Box::pin(async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            let deltas = match turn {
                ScriptedTurn::Text(text) => {
                    let mut deltas = text_chunks(&text);
                    deltas.push(Ok(StreamDelta::Usage {
                        input_tokens: 10,
                        output_tokens: text.len() as u64,
                    }));
                    deltas.push(Ok(StreamDelta::Stop(StopReason::EndTurn)));
                    deltas
                }
                ScriptedTurn::ToolCalls { text, calls } => {
                    let mut deltas = text_chunks(&text);
                    for (index, (name, args)) in calls.into_iter().enumerate() {
                        deltas.push(Ok(StreamDelta::ToolUseStart {
                            index,
                            id: format!("call_{}", index),
                            name,
                        }));
                        deltas.push(Ok(StreamDelta::ToolInputDelta { index, delta: args }));
                    }
                    deltas.push(Ok(StreamDelta::Stop(StopReason::ToolUse)));
                    deltas
                }
                ScriptedTurn::RequestError(message) => {
                    return Err(AgentGraphError::LlmRequest(message));
                }
                ScriptedTurn::StreamError(message) => {
                    let mut deltas = text_chunks("partial");
                    deltas.push(Err(AgentGraphError::LlmStream(message)));
                    deltas
                }
            };
            Ok(Box::pin(futures::stream::iter(deltas)) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_fallback_echoes_user_prompt() {
        let model = ScriptedModel::new();
        let config = ModelConfig::new("m");
        let stream = model
            .chat_stream(&config, vec![ChatMessage::user("hi")], &[])
            .await
            .unwrap();
        let text: String = stream
            .filter_map(|d| async move {
                match d {
                    Ok(StreamDelta::TextDelta(t)) => Some(t),
                    _ => None,
                }
            })
            .collect()
            .await;
        assert_eq!(text, "m: hi");
        assert_eq!(model.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_scripts_are_per_model() {
        let model = ScriptedModel::new();
        model.push("a", ScriptedTurn::RequestError("down".into()));

        let ok = model
            .chat_stream(&ModelConfig::new("b"), vec![ChatMessage::user("x")], &[])
            .await;
        assert!(ok.is_ok());
        let err = model
            .chat_stream(&ModelConfig::new("a"), vec![ChatMessage::user("x")], &[])
            .await;
        assert!(err.is_err());
    }
}
