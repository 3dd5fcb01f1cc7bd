use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use agentgraph_core::error::{AgentGraphError, Result};
use agentgraph_core::graph::{GraphDefinition, Node, NodeKind, END, HANDOFF_TOOL_PREFIX, START};
use agentgraph_core::traits::{GraphCatalog, ModelCatalog};

use super::levels::calculate_levels;

/// Maximum nesting of subgraphs inside subgraphs.
pub const MAX_SUBGRAPH_DEPTH: usize = 16;

/// Characters reserved by flattened paths and the placeholder syntax.
const RESERVED_NAME_CHARS: &[char] = &['.', '|', ':', '@', '{', '}'];

/// Stateless graph transforms, checked against the model and graph catalogs.
#[derive(Clone)]
pub struct GraphProcessor {
    pub(super) models: Arc<dyn ModelCatalog>,
    pub(super) graphs: Arc<dyn GraphCatalog>,
}

impl GraphProcessor {
    pub fn new(models: Arc<dyn ModelCatalog>, graphs: Arc<dyn GraphCatalog>) -> Self {
        Self { models, graphs }
    }

    /// Check an authored graph, failing on the first problem found.
    pub fn validate(&self, graph: &GraphDefinition) -> Result<()> {
        if graph.nodes.is_empty() {
            return Err(AgentGraphError::InvalidGraph(format!(
                "graph '{}' has no nodes",
                graph.name
            )));
        }

        let mut seen = HashSet::with_capacity(graph.nodes.len());
        for node in &graph.nodes {
            check_name(&node.name)?;
            if !seen.insert(node.name.as_str()) {
                return Err(AgentGraphError::DuplicateNode(node.name.clone()));
            }
        }

        for node in &graph.nodes {
            self.validate_node(graph, node)?;
        }
        Ok(())
    }

    fn validate_node(&self, graph: &GraphDefinition, node: &Node) -> Result<()> {
        let invalid = |field: &str, message: String| AgentGraphError::InvalidField {
            node: node.name.clone(),
            field: field.to_string(),
            message,
        };
        let dangling = |field: &str, reference: &str| AgentGraphError::DanglingReference {
            node: node.name.clone(),
            field: field.to_string(),
            reference: reference.to_string(),
        };

        if node.input_nodes.is_empty() {
            return Err(invalid("input_nodes", "at least one input is required".into()));
        }
        for input in &node.input_nodes {
            if input == END {
                return Err(invalid("input_nodes", "`end` cannot be an input".into()));
            }
            if input != START && !graph.contains(input) {
                return Err(dangling("input_nodes", input));
            }
        }
        for output in &node.output_nodes {
            if output == START {
                return Err(invalid("output_nodes", "`start` cannot be an output".into()));
            }
            if output != END && !graph.contains(output) {
                return Err(dangling("output_nodes", output));
            }
        }

        match &node.kind {
            NodeKind::Agent { model_name } => {
                if !self.models.has_model(model_name) {
                    return Err(AgentGraphError::UnknownModel {
                        node: node.name.clone(),
                        model: model_name.clone(),
                    });
                }
            }
            NodeKind::Subgraph { subgraph_name } => {
                if self.graphs.graph(subgraph_name).is_none() {
                    return Err(AgentGraphError::UnknownGraph {
                        node: node.name.clone(),
                        graph: subgraph_name.clone(),
                    });
                }
            }
        }

        if let Some(tool) = node.tools.iter().find(|t| t.starts_with(HANDOFF_TOOL_PREFIX)) {
            return Err(invalid(
                "tools",
                format!("'{}' uses the reserved prefix '{}'", tool, HANDOFF_TOOL_PREFIX),
            ));
        }
        if node.handoffs.is_some() && node.handoff_targets().next().is_none() {
            return Err(invalid(
                "handoffs",
                "handoffs are set but output_nodes has no node to hand off to".into(),
            ));
        }
        if let Some(ext) = &node.save {
            if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(invalid("save", format!("'{}' is not a file extension", ext)));
            }
        }
        Ok(())
    }

    /// Look for a subgraph reference cycle starting at the catalog graph `name`.
    pub fn detect_cycles(&self, name: &str) -> Option<Vec<String>> {
        let root = self.graphs.graph(name)?;
        self.detect_cycles_from(&root)
    }

    /// Look for a subgraph reference cycle starting at `root`, which need not
    /// be in the catalog. Returns the reference chain, e.g. `["A", "B", "A"]`.
    pub fn detect_cycles_from(&self, root: &GraphDefinition) -> Option<Vec<String>> {
        let mut path = Vec::new();
        let mut done = HashSet::new();
        self.visit(root, &mut path, &mut done)
    }

    fn visit(
        &self,
        graph: &GraphDefinition,
        path: &mut Vec<String>,
        done: &mut HashSet<String>,
    ) -> Option<Vec<String>> {
        path.push(graph.name.clone());

        for child in graph.nodes.iter().filter_map(Node::subgraph_name) {
            if let Some(pos) = path.iter().position(|g| g == child) {
                let mut chain = path[pos..].to_vec();
                chain.push(child.to_string());
                return Some(chain);
            }
            if done.contains(child) {
                continue;
            }
            // Missing graphs are reported by validation.
            if let Some(inner) = self.graphs.graph(child) {
                if let Some(chain) = self.visit(&inner, path, done) {
                    return Some(chain);
                }
            }
        }

        path.pop();
        done.insert(graph.name.clone());
        None
    }

    /// Validate, check subgraph cycles, flatten and level a graph so it is
    /// ready to execute.
    pub fn prepare(&self, graph: &GraphDefinition) -> Result<GraphDefinition> {
        self.validate(graph)?;
        if let Some(chain) = self.detect_cycles_from(graph) {
            return Err(AgentGraphError::SubgraphCycle(chain));
        }

        let flat = self.flatten_subgraphs(graph)?;
        let mut seen = HashSet::with_capacity(flat.nodes.len());
        for node in &flat.nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(AgentGraphError::DuplicateNode(node.name.clone()));
            }
        }

        let leveled = calculate_levels(&flat)?;
        debug!(
            graph = %leveled.name,
            nodes = leveled.nodes.len(),
            levels = leveled.max_level() + 1,
            "Graph prepared"
        );
        Ok(leveled)
    }
}

fn check_name(name: &str) -> Result<()> {
    let message = if name.trim().is_empty() {
        Some("name must not be empty".to_string())
    } else if name == START || name == END {
        Some(format!("'{}' is reserved", name))
    } else if let Some(c) = name.chars().find(|c| RESERVED_NAME_CHARS.contains(c)) {
        Some(format!("'{}' may not appear in node names", c))
    } else {
        None
    };

    match message {
        Some(message) => Err(AgentGraphError::InvalidField {
            node: name.to_string(),
            field: "name".to_string(),
            message,
        }),
        None => Ok(()),
    }
}
