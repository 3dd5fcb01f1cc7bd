use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agentgraph_core::config::{AppConfig, ExecutionMode};
use agentgraph_core::event::EventBus;
use agentgraph_core::graph::GraphDefinition;
use agentgraph_core::session::{ExecutionSession, RunStatus};
use agentgraph_core::types::GraphEvent;

use agentgraph_engine::{
    resume_point, rewind, GraphLibrary, GraphProcessor, ModelRegistry, NodeRunner, PromptSet, RunLogger,
    RunOutcome, Scheduler, SessionManager,
};
use agentgraph_store::{FileArtifactStore, SqliteStore};
use agentgraph_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "agentgraph", version, about = "Run graphs of cooperating LLM agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "agentgraph.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a graph definition without running it
    Validate {
        /// Graph definition JSON file
        graph: PathBuf,
    },
    /// Print the flattened graph grouped by level
    Plan {
        /// Graph definition JSON file
        graph: PathBuf,
    },
    /// Start a new session and run a graph to completion
    Run {
        /// Graph definition JSON file
        graph: PathBuf,
        /// Caller input, available to nodes as {{start}}
        #[arg(short, long)]
        input: String,
        /// Run one node at a time instead of whole levels
        #[arg(long)]
        sequential: bool,
        /// Print the session id immediately and run detached
        #[arg(long)]
        background: bool,
    },
    /// Continue an existing session
    Continue {
        /// Session ID
        id: String,
        /// New caller input (defaults to the previous input)
        #[arg(short, long)]
        input: Option<String>,
        /// Resume from the recorded rounds instead of starting a new turn
        #[arg(long, conflicts_with = "input")]
        from_checkpoint: bool,
        /// Run one node at a time instead of whole levels
        #[arg(long)]
        sequential: bool,
    },
    /// Show a session's status and resume point
    Status {
        /// Session ID
        id: String,
    },
    /// Drop the last N node rounds of a session
    Rewind {
        /// Session ID
        id: String,
        /// Number of rounds to drop
        n: usize,
    },
    /// Delete a session
    Delete {
        /// Session ID
        id: String,
    },
    /// List stored sessions, most recent first
    Sessions,
}

/// Everything a command needs, wired from config.
struct App {
    config: AppConfig,
    scheduler: Scheduler,
    store: Arc<SqliteStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agentgraph=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let app = build_app(config)?;

    match cli.command {
        Commands::Validate { graph } => {
            let graph = read_graph(&graph)?;
            let prepared = app.scheduler.prepare(&graph)?;
            println!(
                "Graph '{}' is valid: {} nodes across {} levels",
                prepared.name,
                prepared.nodes.len(),
                prepared.max_level() + 1
            );
        }
        Commands::Plan { graph } => {
            let graph = read_graph(&graph)?;
            print_plan(&app.scheduler.prepare(&graph)?);
        }
        Commands::Run {
            graph,
            input,
            sequential,
            background,
        } => {
            let graph = read_graph(&graph)?;
            let mode = execution_mode(&app.config, sequential);
            let printer = spawn_progress_printer(app.scheduler.event_bus());
            let logger = start_run_logger(&app.config, app.scheduler.event_bus());

            if background {
                let mut rx = app.scheduler.event_bus().subscribe();
                let id = app.scheduler.run_background(&graph, &input, mode).await?;
                println!("{}", id);
                wait_for_terminal_event(&mut rx, &id).await;
                let session = app.scheduler.sessions().get_session(&id).await?.snapshot().await;
                print_result(&session.status, session.final_output.as_deref());
            } else {
                let outcome = app.scheduler.run(&graph, &input, mode).await?;
                print_outcome(&outcome);
            }
            finish(printer, logger).await;
        }
        Commands::Continue {
            id,
            input,
            from_checkpoint,
            sequential,
        } => {
            let mode = execution_mode(&app.config, sequential);
            let printer = spawn_progress_printer(app.scheduler.event_bus());
            let logger = start_run_logger(&app.config, app.scheduler.event_bus());
            let outcome = app
                .scheduler
                .continue_session(&id, input, from_checkpoint, mode)
                .await?;
            print_outcome(&outcome);
            finish(printer, logger).await;
        }
        Commands::Status { id } => {
            let session = app.scheduler.sessions().get_session(&id).await?.snapshot().await;
            print_status(&session);
        }
        Commands::Rewind { id, n } => {
            let session = app.scheduler.sessions().get_session(&id).await?;
            let _guard = session.try_begin_run()?;
            let removed = session.update(|s| rewind(s, n)).await?;
            let snapshot = session.snapshot().await;
            println!(
                "Removed {} round(s); next: {}",
                removed,
                resume_point(&snapshot)
            );
        }
        Commands::Delete { id } => {
            app.scheduler.sessions().delete_session(&id).await?;
            println!("Deleted session {}", id);
        }
        Commands::Sessions => {
            let sessions = app.store.summaries()?;
            if sessions.is_empty() {
                println!("No sessions.");
            }
            for (id, graph, status) in sessions {
                println!("{:<14} {:<16} {}", id, status, graph);
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        return Ok(AppConfig::load(path)?);
    }
    warn!(path = %path.display(), "Config file not found, using defaults (no models registered)");
    Ok(AppConfig::default())
}

fn build_app(config: AppConfig) -> anyhow::Result<App> {
    let models = Arc::new(ModelRegistry::from_config(&config, agentgraph_llm::create_client)?);
    let graphs = Arc::new(GraphLibrary::load_dir(&config.graphs_dir())?);
    let prompts = Arc::new(PromptSet::load_dir(&config.prompts_dir())?);
    let store = Arc::new(
        SqliteStore::open(&config.database_path())
            .with_context(|| format!("opening {}", config.database_path().display()))?,
    );
    let artifacts = Arc::new(FileArtifactStore::new(config.artifacts_dir()));
    let event_bus = Arc::new(EventBus::default());

    let working_dir = std::env::current_dir().context("resolving working directory")?;
    let runner = NodeRunner::new(
        models.clone(),
        Arc::new(ToolRegistry::with_builtins()),
        prompts,
        event_bus.clone(),
    )
    .with_artifacts(artifacts)
    .with_max_iterations(config.engine.max_iterations)
    .with_max_tool_output_chars(config.engine.max_tool_output_chars)
    .with_working_dir(working_dir);

    let scheduler = Scheduler::new(
        Arc::new(GraphProcessor::new(models, graphs)),
        Arc::new(SessionManager::new(store.clone())),
        Arc::new(runner),
        config.engine.clone(),
        event_bus,
    );

    Ok(App {
        config,
        scheduler,
        store,
    })
}

fn read_graph(path: &Path) -> anyhow::Result<GraphDefinition> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    GraphDefinition::from_json(&content).with_context(|| format!("parsing {}", path.display()))
}

fn execution_mode(config: &AppConfig, sequential: bool) -> ExecutionMode {
    if sequential {
        ExecutionMode::Sequential
    } else {
        config.engine.mode
    }
}

fn start_run_logger(config: &AppConfig, event_bus: &EventBus) -> Option<JoinHandle<()>> {
    let log = config.log.as_ref()?;
    let dir = config.log_dir()?;
    Some(RunLogger::new(dir, log.level).start(event_bus, CancellationToken::new()))
}

/// Report node progress on stderr until the run ends.
fn spawn_progress_printer(event_bus: &EventBus) -> JoinHandle<()> {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                GraphEvent::NodeStarted { node, level, .. } => {
                    eprintln!("[{}] started (level {})", node, level);
                }
                GraphEvent::ToolStart { node, name, .. } => {
                    eprintln!("[{}] tool: {}", node, name);
                }
                GraphEvent::ToolEnd { node, name, result } if result.is_error => {
                    eprintln!("[{}] {} failed: {}", node, name, truncate(&result.content, 200));
                }
                GraphEvent::Handoff { from, to, .. } => {
                    eprintln!("[{}] handoff -> {}", from, to);
                }
                GraphEvent::NodeCompleted {
                    node,
                    error,
                    elapsed_ms,
                    ..
                } => match error {
                    Some(error) => eprintln!("[{}] failed after {}ms: {}", node, elapsed_ms, error),
                    None => eprintln!("[{}] done in {}ms", node, elapsed_ms),
                },
                GraphEvent::RunComplete { .. } | GraphEvent::RunFailed { .. } => break,
                _ => {}
            }
        }
    })
}

async fn wait_for_terminal_event(
    rx: &mut tokio::sync::broadcast::Receiver<GraphEvent>,
    id: &str,
) {
    loop {
        match rx.recv().await {
            Ok(GraphEvent::RunComplete { session_id, .. } | GraphEvent::RunFailed { session_id, .. })
                if session_id == id =>
            {
                break
            }
            Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn finish(printer: JoinHandle<()>, logger: Option<JoinHandle<()>>) {
    printer.await.ok();
    if let Some(logger) = logger {
        logger.await.ok();
    }
}

fn print_outcome(outcome: &RunOutcome) {
    eprintln!(
        "Session {}: {} node run(s)",
        outcome.session_id, outcome.node_runs
    );
    print_result(&outcome.status, outcome.final_output.as_deref());
}

fn print_result(status: &RunStatus, final_output: Option<&str>) {
    match status {
        RunStatus::Failed { error } => eprintln!("Run failed: {}", error),
        _ => {
            if let Some(output) = final_output {
                println!("{}", output);
            }
        }
    }
}

fn print_plan(graph: &GraphDefinition) {
    println!("Graph '{}'", graph.name);
    for level in 0..=graph.max_level() {
        println!("Level {}:", level);
        for node in graph.nodes.iter().filter(|n| n.level == level) {
            let model = node.model_name().unwrap_or("-");
            print!("  {} ({}) <- {}", node.name, model, node.input_nodes.join(", "));
            if let Some(limit) = node.handoffs {
                print!(" [handoffs: {} to {}]", limit, node.handoff_targets().collect::<Vec<_>>().join(", "));
            }
            println!();
        }
    }
}

fn print_status(session: &ExecutionSession) {
    let join = |set: &std::collections::BTreeSet<String>| {
        if set.is_empty() {
            "-".to_string()
        } else {
            set.iter().cloned().collect::<Vec<_>>().join(", ")
        }
    };

    println!("Session:   {}", session.id);
    println!("Graph:     {}", session.graph_name);
    println!("Status:    {}", session.status.label());
    if let RunStatus::Failed { error } = &session.status {
        println!("Error:     {}", error);
    }
    println!("Turn:      {}", session.turn);
    println!("Rounds:    {}", session.rounds.len());
    println!("Next:      {}", resume_point(session));
    println!("Pending:   {}", join(&session.pending));
    println!("Completed: {}", join(&session.completed));
    for (node, status) in &session.handoffs_status {
        println!("Handoffs:  {} used {}/{}", node, status.used, status.limit);
    }
    if let Some(output) = &session.final_output {
        println!("\n{}", output);
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
