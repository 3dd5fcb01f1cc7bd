//! Drives a session from its resume point to the end of the current turn.

use std::sync::Arc;

use futures::future::join_all;
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use agentgraph_core::config::{EngineConfig, ExecutionMode};
use agentgraph_core::error::{AgentGraphError, Result};
use agentgraph_core::event::EventBus;
use agentgraph_core::graph::{GraphDefinition, Node, START};
use agentgraph_core::session::{ExecutionSession, NodeResult, RunStatus};
use agentgraph_core::traits::PromptLibrary;
use agentgraph_core::types::GraphEvent;

use crate::checkpoint::{handoff_selector, rebuild_from_rounds, resume_point, runnable_nodes, ResumeDecision};
use crate::graph::GraphProcessor;
use crate::placeholder::{resolve, OutputSnapshot};
use crate::runner::NodeRunner;
use crate::state::{RunGuard, SessionManager, SharedSession};

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub session_id: String,
    pub status: RunStatus,
    pub final_output: Option<String>,
    /// Node executions performed by this run.
    pub node_runs: usize,
}

/// One step of a run.
enum Step {
    Single { node: Node, handoff_source: Option<String>, status: RunStatus },
    Batch { nodes: Vec<Node>, level: usize },
}

/// The run state machine.
///
/// ```text
/// NotStarted -> Running(k) -> Running(k+1) | HandoffPending -> Complete | Failed
/// ```
#[derive(Clone)]
pub struct Scheduler {
    processor: Arc<GraphProcessor>,
    sessions: Arc<SessionManager>,
    runner: Arc<NodeRunner>,
    config: EngineConfig,
    event_bus: Arc<EventBus>,
}

impl Scheduler {
    pub fn new(
        processor: Arc<GraphProcessor>,
        sessions: Arc<SessionManager>,
        runner: Arc<NodeRunner>,
        config: EngineConfig,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            processor,
            sessions,
            runner,
            config,
            event_bus,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Validate, flatten and level a graph without running it.
    pub fn prepare(&self, graph: &GraphDefinition) -> Result<GraphDefinition> {
        self.processor.prepare(graph)
    }

    /// Create a session for `graph` and record `input` as its first turn.
    /// Definition errors surface here, before any session exists.
    pub async fn start_session(&self, graph: &GraphDefinition, input: &str) -> Result<SharedSession> {
        let prepared = self.prepare(graph)?;
        let session = self.sessions.create_session(&graph.name, prepared).await?;
        session.update(|s| s.begin_turn(input)).await?;
        Ok(session)
    }

    /// Run a graph to the end of its first turn.
    pub async fn run(&self, graph: &GraphDefinition, input: &str, mode: ExecutionMode) -> Result<RunOutcome> {
        let session = self.start_session(graph, input).await?;
        let _guard = session.try_begin_run()?;
        self.drive(&session, mode).await
    }

    /// Start a run on a detached task and return its session id at once.
    pub async fn run_background(
        &self,
        graph: &GraphDefinition,
        input: &str,
        mode: ExecutionMode,
    ) -> Result<String> {
        let session = self.start_session(graph, input).await?;
        let guard = session.try_begin_run()?;
        let id = session.id().to_string();
        self.spawn_detached(session, guard, mode);
        Ok(id)
    }

    /// Continue an existing session.
    ///
    /// With `from_checkpoint` the state is rebuilt from the round log and the
    /// interrupted turn resumes. Otherwise a new turn starts with `new_input`,
    /// or with the previous caller input when none is given.
    pub async fn continue_session(
        &self,
        id: &str,
        new_input: Option<String>,
        from_checkpoint: bool,
        mode: ExecutionMode,
    ) -> Result<RunOutcome> {
        let session = self.sessions.get_session(id).await?;
        let _guard = session.try_begin_run()?;
        self.reopen(&session, new_input, from_checkpoint).await?;
        self.drive(&session, mode).await
    }

    /// Detached form of [`Scheduler::continue_session`].
    pub async fn continue_background(
        &self,
        id: &str,
        new_input: Option<String>,
        from_checkpoint: bool,
        mode: ExecutionMode,
    ) -> Result<()> {
        let session = self.sessions.get_session(id).await?;
        let guard = session.try_begin_run()?;
        self.reopen(&session, new_input, from_checkpoint).await?;
        self.spawn_detached(session, guard, mode);
        Ok(())
    }

    async fn reopen(
        &self,
        session: &SharedSession,
        new_input: Option<String>,
        from_checkpoint: bool,
    ) -> Result<()> {
        session
            .update(|s| {
                if from_checkpoint {
                    rebuild_from_rounds(s);
                    s.final_output = None;
                    info!(session = %s.id, rounds = s.rounds.len(), "Resuming from checkpoint");
                } else {
                    let input = new_input
                        .or_else(|| s.latest_output(START).map(str::to_string))
                        .unwrap_or_default();
                    s.begin_turn(input);
                    info!(session = %s.id, turn = s.turn, "Starting new turn");
                }
            })
            .await
    }

    /// The run keeps going after the caller is gone and always leaves a
    /// terminal status behind, even if the run task panics.
    fn spawn_detached(&self, session: SharedSession, guard: RunGuard, mode: ExecutionMode) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let inner = {
                let scheduler = scheduler.clone();
                let session = session.clone();
                tokio::spawn(async move { scheduler.drive(&session, mode).await })
            };
            match inner.await {
                Ok(Ok(outcome)) => {
                    info!(session = %outcome.session_id, node_runs = outcome.node_runs, "Background run finished")
                }
                Ok(Err(e)) => warn!(session = %session.id(), error = %e, "Background run failed"),
                Err(join_error) => {
                    error!(session = %session.id(), error = %join_error, "Background run aborted");
                    scheduler
                        .fail(&session, format!("run aborted: {}", join_error))
                        .await;
                }
            }
        });
    }

    /// Run steps until the current turn is finished.
    async fn drive(&self, session: &SharedSession, mode: ExecutionMode) -> Result<RunOutcome> {
        let graph_name = session.lock().await.graph_name.clone();
        info!(session = %session.id(), graph = %graph_name, ?mode, "Run started");
        self.event_bus.publish(GraphEvent::RunStarted {
            session_id: session.id().to_string(),
            graph: graph_name,
        });

        match self.drive_steps(session, mode).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(session = %session.id(), error = %e, "Run failed");
                self.fail(session, e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn drive_steps(&self, session: &SharedSession, mode: ExecutionMode) -> Result<RunOutcome> {
        let mut node_runs = 0;

        loop {
            let step = {
                let doc = session.lock().await;
                let decision = resume_point(&doc);
                debug!(session = %doc.id, %decision, "Resume point");
                let Some(mut step) = plan_step(&doc, decision, mode)? else {
                    break;
                };
                let budget = self.config.max_node_runs.saturating_sub(doc.node_runs_this_turn());
                if budget == 0 {
                    return Err(AgentGraphError::RunawayExecution(self.config.max_node_runs));
                }
                if let Step::Batch { nodes, .. } = &mut step {
                    nodes.truncate(budget);
                }
                step
            };

            match step {
                Step::Single {
                    node,
                    handoff_source,
                    status,
                } => {
                    session.update(|s| s.status = status).await?;
                    self.runner.run(session, &node, handoff_source).await?;
                    node_runs += 1;
                }
                Step::Batch { nodes, level } => {
                    session.update(|s| s.status = RunStatus::Running { level }).await?;
                    debug!(session = %session.id(), level, nodes = nodes.len(), "Running level batch");
                    for result in self.run_batch(session, &nodes).await {
                        result?;
                        node_runs += 1;
                    }
                }
            }
        }

        self.finish(session, node_runs).await
    }

    async fn run_batch(&self, session: &SharedSession, nodes: &[Node]) -> Vec<Result<NodeResult>> {
        let runs: Vec<_> = nodes
            .iter()
            .map(|node| self.runner.run(session, node, None))
            .collect();
        match self.config.max_parallel_nodes {
            Some(limit) if limit > 0 => futures::stream::iter(runs).buffer_unordered(limit).collect().await,
            _ => join_all(runs).await,
        }
    }

    async fn finish(&self, session: &SharedSession, node_runs: usize) -> Result<RunOutcome> {
        let prompts = self.runner.prompts().as_ref();
        let final_output = session
            .update(|s| {
                let output = render_final_output(s, prompts);
                s.final_output = Some(output.clone());
                s.status = RunStatus::Complete;
                output
            })
            .await?;

        info!(session = %session.id(), node_runs, "Run complete");
        self.event_bus.publish(GraphEvent::RunComplete {
            session_id: session.id().to_string(),
            node_runs,
        });
        Ok(RunOutcome {
            session_id: session.id().to_string(),
            status: RunStatus::Complete,
            final_output: Some(final_output),
            node_runs,
        })
    }

    async fn fail(&self, session: &SharedSession, error: String) {
        let status = RunStatus::Failed { error: error.clone() };
        if let Err(e) = session.update(|s| s.status = status).await {
            warn!(session = %session.id(), error = %e, "Could not persist failed status");
        }
        self.event_bus.publish(GraphEvent::RunFailed {
            session_id: session.id().to_string(),
            error,
        });
    }
}

fn find_node(session: &ExecutionSession, name: &str) -> Result<Node> {
    session
        .graph
        .node(name)
        .cloned()
        .ok_or_else(|| AgentGraphError::InvalidGraph(format!("session graph has no node '{}'", name)))
}

fn plan_step(
    session: &ExecutionSession,
    decision: ResumeDecision,
    mode: ExecutionMode,
) -> Result<Option<Step>> {
    let step = match decision {
        ResumeDecision::Start => return Ok(None),
        ResumeDecision::ContinueHandoff(target) => Step::Single {
            node: find_node(session, &target)?,
            handoff_source: handoff_selector(session, &target),
            status: RunStatus::HandoffPending { target },
        },
        ResumeDecision::WaitForHandoff(node) => Step::Single {
            node: find_node(session, &node)?,
            handoff_source: None,
            status: RunStatus::HandoffPending { target: node },
        },
        ResumeDecision::ContinueAtLevel(level) => {
            let mut nodes = runnable_nodes(session, level);
            if mode == ExecutionMode::Sequential {
                nodes.truncate(1);
            }
            Step::Batch { nodes, level }
        }
    };
    Ok(Some(step))
}

/// The run's answer: `end_template` when set, otherwise the outputs of the
/// nodes wired to `end`, in definition order.
pub fn render_final_output(session: &ExecutionSession, prompts: &dyn PromptLibrary) -> String {
    if let Some(template) = &session.graph.end_template {
        return resolve(template, &OutputSnapshot::from_session(session), prompts);
    }
    session
        .graph
        .end_nodes()
        .iter()
        .filter_map(|n| session.latest_output(&n.name))
        .filter(|out| !out.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::BoxFuture;
    use futures::stream::BoxStream;

    use super::*;
    use agentgraph_core::config::ModelConfig;
    use agentgraph_core::traits::LlmClient;
    use agentgraph_core::types::{ChatMessage, StreamDelta, ToolDefinition};
    use agentgraph_test_utils::{
        diamond_graph, handoff_graph, inner_graph, linear_graph, model_names, parent_graph,
        sibling_handoff_graph, ScriptedModel, ScriptedTurn,
    };
    use agentgraph_tools::ToolRegistry;

    use crate::checkpoint::rewind;
    use crate::registry::{GraphLibrary, ModelRegistry, PromptSet};
    use crate::state::MemorySessionStore;

    fn all_graphs() -> Vec<GraphDefinition> {
        vec![
            linear_graph(),
            diamond_graph(),
            handoff_graph(),
            sibling_handoff_graph(),
            inner_graph(),
            parent_graph(),
        ]
    }

    fn scheduler_with(models: ModelRegistry, config: EngineConfig) -> Scheduler {
        let models = Arc::new(models);
        let library = GraphLibrary::from_graphs(all_graphs());
        let processor = Arc::new(GraphProcessor::new(models.clone(), Arc::new(library)));
        let bus = Arc::new(EventBus::new(1024));
        let runner = NodeRunner::new(
            models,
            Arc::new(ToolRegistry::new()),
            Arc::new(PromptSet::new()),
            bus.clone(),
        )
        .with_max_iterations(config.max_iterations);
        let sessions = Arc::new(SessionManager::new(Arc::new(MemorySessionStore::new())));
        Scheduler::new(processor, sessions, Arc::new(runner), config, bus)
    }

    fn scheduler(model: Arc<ScriptedModel>) -> Scheduler {
        let models = ModelRegistry::with_client(model, model_names(&all_graphs()));
        scheduler_with(models, EngineConfig::default())
    }

    async fn document(scheduler: &Scheduler, id: &str) -> ExecutionSession {
        scheduler.sessions().store().load(id).await.unwrap().unwrap()
    }

    fn round_names(session: &ExecutionSession) -> Vec<&str> {
        session.rounds.iter().map(|r| r.node_name.as_str()).collect()
    }

    /// Panics inside the model call.
    struct PanickingModel;

    impl LlmClient for PanickingModel {
        fn chat_stream(
            &self,
            _config: &ModelConfig,
            messages: Vec<ChatMessage>,
            _tools: &[ToolDefinition],
        ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
            Box::pin(async move {
                if !messages.is_empty() {
                    panic!("model crashed");
                }
                Err(AgentGraphError::LlmRequest("no messages".into()))
            })
        }
    }

    #[tokio::test]
    async fn test_linear_sequential_run() {
        let scheduler = scheduler(Arc::new(ScriptedModel::new()));
        let outcome = scheduler
            .run(&linear_graph(), "hello", ExecutionMode::Sequential)
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Complete);
        assert_eq!(outcome.node_runs, 2);
        assert_eq!(outcome.final_output.as_deref(), Some("b: a: hello"));

        let doc = document(&scheduler, &outcome.session_id).await;
        assert_eq!(round_names(&doc), vec!["start", "A", "B"]);
        assert_eq!(doc.graph.node("A").unwrap().level, 0);
        assert_eq!(doc.graph.node("B").unwrap().level, 1);
        assert_eq!(doc.status, RunStatus::Complete);
        assert!(doc.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_levels_run_concurrently() {
        let latency = Duration::from_millis(100);

        let parallel = scheduler(Arc::new(ScriptedModel::new().with_latency(latency)));
        let started = tokio::time::Instant::now();
        let outcome = parallel
            .run(&diamond_graph(), "q", ExecutionMode::Parallel)
            .await
            .unwrap();
        let parallel_elapsed = started.elapsed();

        let doc = document(&parallel, &outcome.session_id).await;
        let names = round_names(&doc);
        assert_eq!(names.len(), 4);
        assert!(names[1..3].contains(&"A") && names[1..3].contains(&"B"));
        assert_eq!(names[3], "C");
        assert_eq!(outcome.final_output.as_deref(), Some("c: a: left q + b: right q"));

        let sequential = scheduler(Arc::new(ScriptedModel::new().with_latency(latency)));
        let started = tokio::time::Instant::now();
        sequential
            .run(&diamond_graph(), "q", ExecutionMode::Sequential)
            .await
            .unwrap();
        let sequential_elapsed = started.elapsed();

        assert!(parallel_elapsed < latency * 3, "parallel took {:?}", parallel_elapsed);
        assert!(sequential_elapsed >= latency * 3, "sequential took {:?}", sequential_elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_cap() {
        let model = Arc::new(ScriptedModel::new().with_latency(Duration::from_millis(100)));
        let models = ModelRegistry::with_client(model, model_names(&all_graphs()));
        let config = EngineConfig {
            max_parallel_nodes: Some(1),
            ..EngineConfig::default()
        };
        let scheduler = scheduler_with(models, config);

        let started = tokio::time::Instant::now();
        scheduler
            .run(&diamond_graph(), "q", ExecutionMode::Parallel)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_handoff_quota_exhaustion() {
        let model = Arc::new(ScriptedModel::new());
        model
            .push("x", ScriptedTurn::tool_call("transfer_to_Y", serde_json::json!({"reason": "draft"})))
            .push("x", ScriptedTurn::tool_call("transfer_to_Y", serde_json::json!({"reason": "again"})))
            .push("x", ScriptedTurn::text("settled"));
        let scheduler = scheduler(model.clone());

        let outcome = scheduler
            .run(&handoff_graph(), "task", ExecutionMode::Sequential)
            .await
            .unwrap();
        let doc = document(&scheduler, &outcome.session_id).await;

        assert_eq!(round_names(&doc), vec!["start", "X", "Y", "X", "Y", "X", "Z"]);
        assert_eq!(doc.rounds[2].handoff_source.as_deref(), Some("X"));
        assert_eq!(doc.rounds[3].handoff_source, None);
        assert_eq!(doc.handoff_status("X").unwrap().used, 2);

        let offered: Vec<usize> = model.calls_for("x").iter().map(|c| c.tool_names.len()).collect();
        assert_eq!(offered, vec![2, 2, 0]);
        assert_eq!(doc.latest_output("X"), Some("settled"));
        assert_eq!(doc.history("Y").len(), 2);
        assert_eq!(doc.history("Y")[1], "y: work on again");
    }

    #[tokio::test]
    async fn test_sibling_handoffs_in_one_batch_are_all_served() {
        let model = Arc::new(ScriptedModel::new());
        model
            .push("p", ScriptedTurn::tool_call("transfer_to_T1", serde_json::json!({"reason": "expand"})))
            .push("q", ScriptedTurn::tool_call("transfer_to_T2", serde_json::json!({"reason": "verify"})));
        let scheduler = scheduler(model.clone());

        let outcome = scheduler
            .run(&sibling_handoff_graph(), "job", ExecutionMode::Parallel)
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Complete);
        assert_eq!(outcome.node_runs, 5);

        let doc = document(&scheduler, &outcome.session_id).await;
        let runs_of = |node: &str| doc.rounds.iter().filter(|r| r.node_name == node).collect::<Vec<_>>();

        let t1 = runs_of("T1");
        assert_eq!(t1.len(), 1);
        assert_eq!(t1[0].handoff_source.as_deref(), Some("P"));
        let t2 = runs_of("T2");
        assert_eq!(t2.len(), 1);
        assert_eq!(t2[0].handoff_source.as_deref(), Some("Q"));

        // T1 lists P as an output, so P gets control back; T2 does not return to Q.
        let p = runs_of("P");
        assert_eq!(p.len(), 2);
        assert!(p[1].index > t1[0].index);
        assert_eq!(p[1].handoff_source, None);
        assert_eq!(runs_of("Q").len(), 1);

        assert_eq!(doc.handoff_status("P").unwrap().used, 1);
        assert_eq!(doc.handoff_status("Q").unwrap().used, 1);
        assert_eq!(model.calls_for("p")[1].tool_names.len(), 0);
    }

    #[tokio::test]
    async fn test_subgraph_nodes_run_flattened() {
        let scheduler = scheduler(Arc::new(ScriptedModel::new()));
        let outcome = scheduler
            .run(&parent_graph(), "inner question", ExecutionMode::Parallel)
            .await
            .unwrap();
        let doc = document(&scheduler, &outcome.session_id).await;

        assert_eq!(round_names(&doc), vec!["start", "S.P"]);
        let node = doc.graph.node("S.P").unwrap();
        assert_eq!(node.input_nodes, vec!["start"]);
        assert_eq!(node.output_nodes, vec!["end"]);
        assert_eq!(outcome.final_output.as_deref(), Some("p: inner question"));
    }

    #[tokio::test]
    async fn test_failed_node_does_not_block_dependents() {
        let model = Arc::new(ScriptedModel::new());
        model.push("a", ScriptedTurn::RequestError("rate limited".into()));
        let scheduler = scheduler(model.clone());

        let outcome = scheduler
            .run(&linear_graph(), "hello", ExecutionMode::Sequential)
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Complete);

        let doc = document(&scheduler, &outcome.session_id).await;
        assert!(doc.completed.contains("A"));
        assert!(doc.node_states["A"].error.as_deref().unwrap().contains("rate limited"));
        assert_eq!(model.calls_for("b")[0].user_text(), "");
        assert_eq!(doc.latest_output("B"), Some("b: "));
    }

    #[tokio::test]
    async fn test_definition_error_creates_no_session() {
        let scheduler = scheduler(Arc::new(ScriptedModel::new()));
        let graph = GraphDefinition::new("bad").with_node(Node::agent("A", "nope").with_inputs(["start"]));

        let err = scheduler.run(&graph, "x", ExecutionMode::Parallel).await.unwrap_err();
        assert!(err.is_definition_error());
        assert!(scheduler.sessions().list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_runaway_run_fails() {
        let models = ModelRegistry::with_client(Arc::new(ScriptedModel::new()), model_names(&all_graphs()));
        let config = EngineConfig {
            max_node_runs: 1,
            ..EngineConfig::default()
        };
        let scheduler = scheduler_with(models, config);
        let mut events = scheduler.event_bus().subscribe();

        let err = scheduler
            .run(&linear_graph(), "x", ExecutionMode::Sequential)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentGraphError::RunawayExecution(1)));

        let id = scheduler.sessions().list_sessions().await.unwrap().remove(0);
        let doc = document(&scheduler, &id).await;
        assert!(matches!(doc.status, RunStatus::Failed { .. }));

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            saw_failure |= matches!(event, GraphEvent::RunFailed { .. });
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_wide_level_is_cut_to_remaining_budget() {
        let models = ModelRegistry::with_client(Arc::new(ScriptedModel::new()), model_names(&all_graphs()));
        let config = EngineConfig {
            max_node_runs: 1,
            ..EngineConfig::default()
        };
        let scheduler = scheduler_with(models, config);

        let err = scheduler
            .run(&diamond_graph(), "q", ExecutionMode::Parallel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentGraphError::RunawayExecution(1)));

        let id = scheduler.sessions().list_sessions().await.unwrap().remove(0);
        let doc = document(&scheduler, &id).await;
        assert_eq!(round_names(&doc), vec!["start", "A"]);
        assert!(doc.pending.contains("B"));
    }

    #[tokio::test]
    async fn test_continue_with_new_input() {
        let model = Arc::new(ScriptedModel::new());
        let scheduler = scheduler(model.clone());
        let first = scheduler
            .run(&linear_graph(), "one", ExecutionMode::Sequential)
            .await
            .unwrap();

        let second = scheduler
            .continue_session(&first.session_id, Some("two".into()), false, ExecutionMode::Sequential)
            .await
            .unwrap();
        assert_eq!(second.final_output.as_deref(), Some("b: a: two"));
        assert_eq!(second.node_runs, 2);

        let doc = document(&scheduler, &first.session_id).await;
        assert_eq!(doc.turn, 2);
        assert_eq!(round_names(&doc), vec!["start", "A", "B", "start", "A", "B"]);
        assert_eq!(doc.history("A"), &["a: one".to_string(), "a: two".to_string()]);

        let third = scheduler
            .continue_session(&first.session_id, None, false, ExecutionMode::Sequential)
            .await
            .unwrap();
        assert_eq!(third.final_output.as_deref(), Some("b: a: two"));
        assert_eq!(document(&scheduler, &first.session_id).await.history("start").len(), 3);
    }

    #[tokio::test]
    async fn test_continue_unknown_session() {
        let scheduler = scheduler(Arc::new(ScriptedModel::new()));
        let err = scheduler
            .continue_session("missing", None, true, ExecutionMode::Parallel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentGraphError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_resume_after_rewind_is_exact() {
        let scheduler = scheduler(Arc::new(ScriptedModel::new()));
        let outcome = scheduler
            .run(&diamond_graph(), "q", ExecutionMode::Sequential)
            .await
            .unwrap();
        let id = outcome.session_id;
        let full = document(&scheduler, &id).await;

        for n in 1..=3 {
            let session = scheduler.sessions().get_session(&id).await.unwrap();
            let removed = session.update(|s| rewind(s, n)).await.unwrap();
            assert_eq!(removed, n);

            let resumed = scheduler
                .continue_session(&id, None, true, ExecutionMode::Sequential)
                .await
                .unwrap();
            assert_eq!(resumed.node_runs, n);
            assert_eq!(resumed.final_output, full.final_output);

            let doc = document(&scheduler, &id).await;
            assert_eq!(round_names(&doc), round_names(&full));
            let outputs = |s: &ExecutionSession| s.rounds.iter().map(|r| r.output.clone()).collect::<Vec<_>>();
            assert_eq!(outputs(&doc), outputs(&full));
            assert_eq!(doc.global_outputs, full.global_outputs);
        }
    }

    #[tokio::test]
    async fn test_background_run_reaches_terminal_status() {
        let scheduler = scheduler(Arc::new(ScriptedModel::new().with_latency(Duration::from_millis(5))));
        let mut events = scheduler.event_bus().subscribe();

        let id = scheduler
            .run_background(&linear_graph(), "later", ExecutionMode::Parallel)
            .await
            .unwrap();

        // The session exists before the run finishes.
        assert!(scheduler.sessions().get_session(&id).await.is_ok());

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(GraphEvent::RunComplete { session_id, .. }) = events.recv().await {
                    if session_id == id {
                        break;
                    }
                }
            }
        })
        .await
        .unwrap();

        let doc = document(&scheduler, &id).await;
        assert_eq!(doc.status, RunStatus::Complete);
        assert_eq!(doc.final_output.as_deref(), Some("b: a: later"));
    }

    #[tokio::test]
    async fn test_background_panic_is_recorded_as_failure() {
        let models = ModelRegistry::with_client(Arc::new(PanickingModel), model_names(&all_graphs()));
        let scheduler = scheduler_with(models, EngineConfig::default());
        let mut events = scheduler.event_bus().subscribe();

        let id = scheduler
            .run_background(&linear_graph(), "boom", ExecutionMode::Parallel)
            .await
            .unwrap();

        let error = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(GraphEvent::RunFailed { error, .. }) = events.recv().await {
                    return error;
                }
            }
        })
        .await
        .unwrap();
        assert!(error.contains("run aborted"));

        let doc = document(&scheduler, &id).await;
        assert!(matches!(doc.status, RunStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn test_second_run_on_busy_session_is_rejected() {
        let scheduler = scheduler(Arc::new(ScriptedModel::new().with_latency(Duration::from_millis(200))));
        let id = scheduler
            .run_background(&linear_graph(), "slow", ExecutionMode::Parallel)
            .await
            .unwrap();

        let err = scheduler
            .continue_session(&id, Some("again".into()), false, ExecutionMode::Parallel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentGraphError::SessionBusy(_)));

        let err = scheduler.sessions().delete_session(&id).await.unwrap_err();
        assert!(matches!(err, AgentGraphError::SessionBusy(_)));
    }

    #[tokio::test]
    async fn test_end_template() {
        let graph = linear_graph().with_end_template("Answer: {{B}} (from {{A:all}})");
        let scheduler = scheduler(Arc::new(ScriptedModel::new()));
        let outcome = scheduler.run(&graph, "hi", ExecutionMode::Parallel).await.unwrap();
        assert_eq!(outcome.final_output.as_deref(), Some("Answer: b: a: hi (from a: hi)"));
    }

    #[test]
    fn test_final_output_joins_end_nodes() {
        let graph = crate::graph::calculate_levels(&diamond_graph()).unwrap();
        let mut session = ExecutionSession::new("s", "diamond", graph);
        session.begin_turn("q");
        assert_eq!(render_final_output(&session, &PromptSet::new()), "");

        session.record_node_run(agentgraph_core::session::NodeRun {
            node_name: "C".into(),
            output: "merged".into(),
            ..Default::default()
        });
        assert_eq!(render_final_output(&session, &PromptSet::new()), "merged");
    }
}
