//! Catalogs the engine resolves names against: models, graphs and prompts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use agentgraph_core::config::{AppConfig, ModelConfig};
use agentgraph_core::error::{AgentGraphError, Result};
use agentgraph_core::graph::GraphDefinition;
use agentgraph_core::traits::{GraphCatalog, LlmClient, ModelCatalog, PromptLibrary};

/// A model a node can name in `model_name`.
#[derive(Clone)]
pub struct RegisteredModel {
    pub client: Arc<dyn LlmClient>,
    pub config: ModelConfig,
}

/// Name-keyed model registry.
#[derive(Default, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, RegisteredModel>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, client: Arc<dyn LlmClient>, config: ModelConfig) {
        self.models
            .insert(name.into(), RegisteredModel { client, config });
    }

    /// Register every name against one client, each with `model_id` equal to its name.
    pub fn with_client<S: Into<String>>(
        client: Arc<dyn LlmClient>,
        names: impl IntoIterator<Item = S>,
    ) -> Self {
        let mut registry = Self::new();
        for name in names {
            let name = name.into();
            let config = ModelConfig::new(name.clone());
            registry.register(name, Arc::clone(&client), config);
        }
        registry
    }

    /// Build the registry from the `[models]` table, creating one client per entry.
    pub fn from_config<F>(config: &AppConfig, create_client: F) -> Result<Self>
    where
        F: Fn(&ModelConfig) -> Result<Box<dyn LlmClient>>,
    {
        let mut registry = Self::new();
        for (name, model) in &config.models {
            let client: Arc<dyn LlmClient> = Arc::from(create_client(model)?);
            debug!(model = %name, provider = %model.provider, model_id = %model.model_id, "Registered model");
            registry.register(name.clone(), client, model.clone());
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredModel> {
        self.models.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl ModelCatalog for ModelRegistry {
    fn has_model(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }
}

/// Graphs that subgraph nodes can embed, keyed by graph name.
#[derive(Debug, Default, Clone)]
pub struct GraphLibrary {
    graphs: HashMap<String, GraphDefinition>,
}

impl GraphLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_graphs(graphs: impl IntoIterator<Item = GraphDefinition>) -> Self {
        let mut library = Self::new();
        for graph in graphs {
            library.insert(graph);
        }
        library
    }

    /// Load every `*.json` graph in `dir`. A missing directory yields an empty library.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut library = Self::new();
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "Graph directory not found, no subgraphs available");
            return Ok(library);
        }

        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            let content = std::fs::read_to_string(&path)?;
            let graph = GraphDefinition::from_json(&content).map_err(|e| {
                AgentGraphError::InvalidGraph(format!("{}: {}", path.display(), e))
            })?;
            if library.graphs.contains_key(&graph.name) {
                warn!(graph = %graph.name, path = %path.display(), "Duplicate graph name, later file wins");
            }
            library.insert(graph);
        }
        debug!(dir = %dir.display(), graphs = library.graphs.len(), "Loaded graph library");
        Ok(library)
    }

    pub fn insert(&mut self, graph: GraphDefinition) {
        self.graphs.insert(graph.name.clone(), graph);
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.graphs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl GraphCatalog for GraphLibrary {
    fn graph(&self, name: &str) -> Option<GraphDefinition> {
        self.graphs.get(name).cloned()
    }
}

/// Prompt templates referenced as `{{@name}}`.
#[derive(Debug, Default, Clone)]
pub struct PromptSet {
    prompts: HashMap<String, String>,
}

impl PromptSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompt(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.prompts.insert(name.into(), content.into());
        self
    }

    /// Load every file in `dir`; the file stem is the prompt name.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut set = Self::new();
        if !dir.is_dir() {
            return Ok(set);
        }
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content = std::fs::read_to_string(&path)?;
            set.prompts.insert(stem.to_string(), content);
        }
        debug!(dir = %dir.display(), prompts = set.prompts.len(), "Loaded prompts");
        Ok(set)
    }
}

impl PromptLibrary for PromptSet {
    fn prompt(&self, name: &str) -> Option<String> {
        self.prompts.get(name).cloned()
    }
}
