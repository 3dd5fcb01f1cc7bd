//! The persisted execution document of one graph session.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::{GraphDefinition, START};
use crate::types::ChatMessage;

/// Everything a finished node execution contributes to the session.
#[derive(Debug, Clone, Default)]
pub struct NodeRun {
    pub node_name: String,
    pub level: usize,
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub output: String,
    pub error: Option<String>,
    pub handoff_target: Option<String>,
    pub handoff_source: Option<String>,
    pub elapsed_ms: u64,
}

/// Lifecycle of a session's current run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    NotStarted,
    Running {
        level: usize,
    },
    HandoffPending {
        target: String,
    },
    Complete,
    Failed {
        error: String,
    },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed { .. })
    }

    /// Short name matching the serialized `state` tag.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running { .. } => "running",
            Self::HandoffPending { .. } => "handoff_pending",
            Self::Complete => "complete",
            Self::Failed { .. } => "failed",
        }
    }
}

/// One entry of the append-only execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub index: usize,
    pub node_name: String,
    pub level: usize,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: String,
    /// Exactly what this round appended to the global output ledger.
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_target: Option<String>,
    /// Set when this round ran because `handoff_source` handed control to it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_source: Option<String>,
    #[serde(default)]
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl Round {
    /// Whether this round records caller input rather than a node run.
    pub fn is_start(&self) -> bool {
        self.node_name == START
    }
}

/// Latest result of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_name: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub has_handoff: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_target: Option<String>,
    /// Index of the round that produced this result.
    pub round_index: usize,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl NodeResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Handoff quota bookkeeping for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffStatus {
    pub limit: u32,
    pub used: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_selection: Option<String>,
}

impl HandoffStatus {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            used: 0,
            last_selection: None,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }

    pub fn has_remaining(&self) -> bool {
        self.used < self.limit
    }
}

/// Per-run mutable state of a graph session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSession {
    pub id: String,
    pub graph_name: String,
    /// The flattened, leveled graph this session executes.
    pub graph: GraphDefinition,
    #[serde(default)]
    pub rounds: Vec<Round>,
    #[serde(default)]
    pub node_states: BTreeMap<String, NodeResult>,
    #[serde(default, rename = "pending_nodes")]
    pub pending: BTreeSet<String>,
    #[serde(default, rename = "completed_nodes")]
    pub completed: BTreeSet<String>,
    #[serde(default)]
    pub global_outputs: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub handoffs_status: BTreeMap<String, HandoffStatus>,
    #[serde(default)]
    pub execution_chain: Vec<String>,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<String>,
    /// Number of caller inputs received.
    #[serde(default)]
    pub turn: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionSession {
    /// A fresh session with no caller input yet.
    pub fn new(id: impl Into<String>, graph_name: impl Into<String>, graph: GraphDefinition) -> Self {
        let now = Utc::now();
        let pending = graph.nodes.iter().map(|n| n.name.clone()).collect();
        let handoffs_status = graph
            .nodes
            .iter()
            .filter_map(|n| n.handoffs.map(|limit| (n.name.clone(), HandoffStatus::new(limit))))
            .collect();
        Self {
            id: id.into(),
            graph_name: graph_name.into(),
            graph,
            rounds: vec![],
            node_states: BTreeMap::new(),
            pending,
            completed: BTreeSet::new(),
            global_outputs: BTreeMap::new(),
            handoffs_status,
            execution_chain: vec![],
            status: RunStatus::NotStarted,
            final_output: None,
            turn: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Latest output of `node`; for `start` the most recent caller input.
    pub fn latest_output(&self, node: &str) -> Option<&str> {
        if node == START {
            return self
                .global_outputs
                .get(START)
                .and_then(|h| h.last())
                .map(String::as_str);
        }
        self.node_states.get(node).map(|r| r.output.as_str())
    }

    /// Full ledger history of `node`, oldest first.
    pub fn history(&self, node: &str) -> &[String] {
        self.global_outputs
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Index of the most recent start-input round, if any.
    pub fn current_turn_start(&self) -> Option<usize> {
        self.rounds.iter().rposition(Round::is_start)
    }

    /// Index of the most recent round of `node`, if it ever ran.
    pub fn last_round_of(&self, node: &str) -> Option<usize> {
        self.rounds.iter().rposition(|r| r.node_name == node)
    }

    /// The most recent node (non-start) round.
    pub fn last_node_round(&self) -> Option<&Round> {
        self.rounds.iter().rev().find(|r| !r.is_start())
    }

    pub fn handoff_status(&self, node: &str) -> Option<&HandoffStatus> {
        self.handoffs_status.get(node)
    }

    /// Number of node executions recorded in the current turn.
    pub fn node_runs_this_turn(&self) -> usize {
        let from = self.current_turn_start().map(|i| i + 1).unwrap_or(0);
        self.rounds[from..].iter().filter(|r| !r.is_start()).count()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Append a round to the log, assigning its index. History is never rewritten.
    pub fn record_round_result(&mut self, mut round: Round) -> usize {
        round.index = self.rounds.len();
        self.rounds.push(round);
        self.touch();
        self.rounds.len() - 1
    }

    pub fn mark_completed(&mut self, node: &str) {
        self.pending.remove(node);
        self.completed.insert(node.to_string());
        self.execution_chain.push(node.to_string());
    }

    pub fn append_global_output(&mut self, node: &str, output: impl Into<String>) {
        self.global_outputs
            .entry(node.to_string())
            .or_default()
            .push(output.into());
    }

    /// Count one handoff by `node` towards `target` against its quota.
    pub fn update_handoff_usage(&mut self, node: &str, target: &str) {
        if let Some(status) = self.handoffs_status.get_mut(node) {
            status.used += 1;
            status.last_selection = Some(target.to_string());
        }
    }

    /// Start a new caller turn: every node becomes pending again and
    /// handoff quotas are restored. Rounds and the ledger are kept.
    pub fn reset_turn(&mut self) {
        self.completed.clear();
        self.execution_chain.clear();
        self.pending = self.graph.nodes.iter().map(|n| n.name.clone()).collect();
        for status in self.handoffs_status.values_mut() {
            status.used = 0;
            status.last_selection = None;
        }
    }

    /// Apply the derived-state effects of an already logged round.
    pub fn apply_round(&mut self, round: &Round) {
        if round.is_start() {
            self.reset_turn();
            self.turn += 1;
            self.append_global_output(START, round.output.clone());
            return;
        }

        self.node_states.insert(
            round.node_name.clone(),
            NodeResult {
                node_name: round.node_name.clone(),
                output: round.output.clone(),
                error: round.error.clone(),
                has_handoff: round.handoff_target.is_some(),
                handoff_target: round.handoff_target.clone(),
                round_index: round.index,
                elapsed_ms: round.elapsed_ms,
            },
        );
        self.append_global_output(&round.node_name, round.output.clone());
        self.mark_completed(&round.node_name);
        if let Some(target) = &round.handoff_target {
            self.update_handoff_usage(&round.node_name, target);
        }
    }

    /// Record caller input as a start round and open a new turn.
    pub fn begin_turn(&mut self, input: impl Into<String>) {
        let input = input.into();
        let round = Round {
            index: 0,
            node_name: START.to_string(),
            level: 0,
            messages: vec![ChatMessage::user(input.clone())],
            model: String::new(),
            output: input,
            error: None,
            handoff_target: None,
            handoff_source: None,
            elapsed_ms: 0,
            timestamp: Utc::now(),
        };
        let index = self.record_round_result(round);
        let round = self.rounds[index].clone();
        self.apply_round(&round);
        self.final_output = None;
    }

    /// Record a node execution: round, latest result, ledger entry,
    /// completion and handoff usage, all in one step.
    pub fn record_node_run(&mut self, run: NodeRun) -> NodeResult {
        let round = Round {
            index: 0,
            node_name: run.node_name.clone(),
            level: run.level,
            messages: run.messages,
            model: run.model,
            output: run.output,
            error: run.error,
            handoff_target: run.handoff_target,
            handoff_source: run.handoff_source,
            elapsed_ms: run.elapsed_ms,
            timestamp: Utc::now(),
        };
        let index = self.record_round_result(round);
        let round = self.rounds[index].clone();
        self.apply_round(&round);
        self.node_states[&run.node_name].clone()
    }
}
