use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use agentgraph_core::event::EventBus;
use agentgraph_core::types::GraphEvent;

/// JSONL run logger.
///
/// Writes the engine's event stream for one run as JSONL (one JSON object
/// per line), flushing after every entry so a crashed run still leaves a
/// readable log. The file is opened when the run announces its session id:
/// `{log_dir}/{session_id}/{timestamp}.jsonl`.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    session_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

struct LogFile {
    session_id: String,
    path: PathBuf,
    writer: BufWriter<tokio::fs::File>,
}

impl RunLogger {
    /// `level` controls verbosity: 1=run lifecycle, 2=nodes and handoffs, 3=tools.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and log on a background task until the run ends or
    /// `cancel` fires.
    pub fn start(self, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    async fn run(self, mut rx: broadcast::Receiver<GraphEvent>, cancel: CancellationToken) {
        let mut file: Option<LogFile> = None;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "RunLogger lagged, skipped events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("EventBus closed, RunLogger stopping");
                        break;
                    }
                },
            };

            if let GraphEvent::RunStarted { session_id, .. } = &event {
                if file.is_none() {
                    match open_log(&self.log_dir, session_id).await {
                        Ok(opened) => {
                            info!(path = %opened.path.display(), "RunLogger started");
                            file = Some(opened);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to open run log");
                            return;
                        }
                    }
                }
            }
            let Some(log) = file.as_mut() else {
                continue;
            };

            if let Some(entry) = self.event_to_entry(&log.session_id, &event) {
                if let Ok(json) = serde_json::to_string(&entry) {
                    let line = format!("{}\n", json);
                    if let Err(e) = log.writer.write_all(line.as_bytes()).await {
                        error!(error = %e, "Failed to write log entry");
                        break;
                    }
                    if let Err(e) = log.writer.flush().await {
                        error!(error = %e, "Failed to flush log");
                    }
                }
            }

            if matches!(event, GraphEvent::RunComplete { .. } | GraphEvent::RunFailed { .. }) {
                break;
            }
        }

        if let Some(mut log) = file {
            log.writer.flush().await.ok();
            debug!(path = %log.path.display(), "RunLogger finished");
        }
    }

    /// Map an event to a log entry, or `None` when the level filters it out.
    fn event_to_entry(&self, session_id: &str, event: &GraphEvent) -> Option<LogEntry> {
        let entry = |event_type: &str, node: Option<&str>, detail: Option<serde_json::Value>| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            session_id: session_id.to_string(),
            event_type: event_type.to_string(),
            node: node.map(str::to_string),
            detail,
        };

        match event {
            // L1: run lifecycle
            GraphEvent::RunStarted { graph, .. } => Some(entry(
                "run_started",
                None,
                Some(serde_json::json!({ "graph": graph })),
            )),
            GraphEvent::RunComplete { node_runs, .. } => Some(entry(
                "run_complete",
                None,
                Some(serde_json::json!({ "node_runs": node_runs })),
            )),
            GraphEvent::RunFailed { error, .. } => Some(entry(
                "run_failed",
                None,
                Some(serde_json::json!({ "error": error })),
            )),

            // L2: nodes and handoffs
            GraphEvent::NodeStarted { node, level, .. } if self.level >= 2 => Some(entry(
                "node_started",
                Some(node),
                Some(serde_json::json!({ "level": level })),
            )),
            GraphEvent::NodeCompleted {
                node,
                error,
                elapsed_ms,
                ..
            } if self.level >= 2 => Some(entry(
                "node_completed",
                Some(node),
                Some(serde_json::json!({ "error": error, "elapsed_ms": elapsed_ms })),
            )),
            GraphEvent::Handoff { from, to, .. } if self.level >= 2 => Some(entry(
                "handoff",
                Some(from),
                Some(serde_json::json!({ "to": to })),
            )),
            GraphEvent::Usage {
                node,
                input_tokens,
                output_tokens,
            } if self.level >= 2 => Some(entry(
                "usage",
                Some(node),
                Some(serde_json::json!({
                    "input_tokens": input_tokens,
                    "output_tokens": output_tokens,
                })),
            )),

            // L3: tool calls
            GraphEvent::ToolStart { node, name, input } if self.level >= 3 => Some(entry(
                "tool_start",
                Some(node),
                Some(serde_json::json!({
                    "tool": name,
                    "input": truncate_json(input, 500),
                })),
            )),
            GraphEvent::ToolEnd { node, name, result } if self.level >= 3 => Some(entry(
                "tool_end",
                Some(node),
                Some(serde_json::json!({
                    "tool": name,
                    "is_error": result.is_error,
                    "content_preview": truncate_str(&result.content, 200),
                })),
            )),

            // Text deltas are never logged.
            _ => None,
        }
    }
}

async fn open_log(log_dir: &Path, session_id: &str) -> std::io::Result<LogFile> {
    let session_dir = log_dir.join(session_id);
    tokio::fs::create_dir_all(&session_dir).await?;

    let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let path = session_dir.join(format!("{}.jsonl", timestamp));
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    Ok(LogFile {
        session_id: session_id.to_string(),
        path,
        writer: BufWriter::new(file),
    })
}

/// Truncate a JSON value for logging.
fn truncate_json(value: &serde_json::Value, max_chars: usize) -> String {
    let s = value.to_string();
    if s.chars().count() <= max_chars {
        s
    } else {
        format!("{}...", truncate_str(&s, max_chars))
    }
}

/// Truncate a string for logging, on a char boundary.
fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentgraph_core::types::ToolResult;

    fn tool_start() -> GraphEvent {
        GraphEvent::ToolStart {
            node: "A".into(),
            name: "read_file".into(),
            input: serde_json::Value::Null,
        }
    }

    fn node_started() -> GraphEvent {
        GraphEvent::NodeStarted {
            session_id: "s1".into(),
            node: "A".into(),
            level: 0,
        }
    }

    #[test]
    fn test_jsonl_entry_format() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        let entry = logger
            .event_to_entry(
                "s1",
                &GraphEvent::RunStarted {
                    session_id: "s1".into(),
                    graph: "g".into(),
                },
            )
            .unwrap();

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event_type\":\"run_started\""));
        assert!(json.contains("\"session_id\":\"s1\""));
        assert!(!json.contains("\"node\""));
    }

    #[test]
    fn test_event_level_filtering() {
        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry("s1", &node_started()).is_none());
        assert!(l1.event_to_entry("s1", &tool_start()).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        let entry = l2.event_to_entry("s1", &node_started()).unwrap();
        assert_eq!(entry.node.as_deref(), Some("A"));
        assert!(l2.event_to_entry("s1", &tool_start()).is_none());

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(l3.event_to_entry("s1", &tool_start()).is_some());
        assert!(l3
            .event_to_entry(
                "s1",
                &GraphEvent::TextDelta {
                    node: "A".into(),
                    text: "hi".into()
                }
            )
            .is_none());
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        assert_eq!(truncate_str("héllo", 2), "hé");
        assert_eq!(truncate_str("hi", 10), "hi");

        let value = serde_json::json!({"key": "a very long string that should be truncated"});
        let result = truncate_json(&value, 20);
        assert_eq!(result.chars().count(), 23);
        assert!(result.ends_with("..."));
    }

    #[tokio::test]
    async fn test_writes_one_file_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(64);
        let handle = RunLogger::new(dir.path().to_path_buf(), 3).start(&bus, CancellationToken::new());

        bus.publish(GraphEvent::RunStarted {
            session_id: "abc".into(),
            graph: "g".into(),
        });
        bus.publish(node_started());
        bus.publish(GraphEvent::ToolEnd {
            node: "A".into(),
            name: "read_file".into(),
            result: ToolResult::success("contents"),
        });
        bus.publish(GraphEvent::RunComplete {
            session_id: "abc".into(),
            node_runs: 1,
        });
        handle.await.unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path().join("abc"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);

        let content = std::fs::read_to_string(&files[0]).unwrap();
        let types: Vec<String> = content
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["event_type"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(types, vec!["run_started", "node_started", "tool_end", "run_complete"]);
    }

    #[tokio::test]
    async fn test_cancel_before_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(8);
        let cancel = CancellationToken::new();
        let handle = RunLogger::new(dir.path().to_path_buf(), 1).start(&bus, cancel.clone());

        bus.publish(node_started());
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
