//! Subgraph expansion.
//!
//! Each subgraph node `S` is replaced by the nodes of the graph it embeds,
//! renamed `S.<inner>`. Inside, `start` becomes whatever feeds `S` and `end`
//! becomes whatever `S` feeds. Siblings that read from `S` read from its exit
//! nodes instead; siblings that hand off to `S` hand off to its entry nodes.

use std::collections::HashMap;

use agentgraph_core::error::{AgentGraphError, Result};
use agentgraph_core::graph::{GraphDefinition, Node, NodeKind, NodeOrigin, END, START};

use super::processor::{GraphProcessor, MAX_SUBGRAPH_DEPTH};

/// Where `start` and `end` point inside one expansion scope.
struct Scope {
    prefix: String,
    start: Option<Vec<String>>,
    end: Option<Vec<String>>,
}

impl Scope {
    fn root() -> Self {
        Self {
            prefix: String::new(),
            start: None,
            end: None,
        }
    }

    fn qualify(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

/// Flattened names of the nodes through which data enters and leaves an embedded graph.
#[derive(Debug, Default)]
struct Boundary {
    entries: Vec<String>,
    exits: Vec<String>,
}

impl GraphProcessor {
    /// Replace every subgraph node by the nodes it embeds, recursively.
    /// A graph without subgraph nodes comes back unchanged.
    pub fn flatten_subgraphs(&self, graph: &GraphDefinition) -> Result<GraphDefinition> {
        if !graph.has_subgraphs() {
            return Ok(graph.clone());
        }
        if let Some(chain) = self.detect_cycles_from(graph) {
            return Err(AgentGraphError::SubgraphCycle(chain));
        }

        let nodes = self.expand(graph, &Scope::root(), 0)?;
        Ok(GraphDefinition {
            nodes,
            ..graph.clone()
        })
    }

    fn expand(&self, graph: &GraphDefinition, scope: &Scope, depth: usize) -> Result<Vec<Node>> {
        if depth > MAX_SUBGRAPH_DEPTH {
            return Err(AgentGraphError::SubgraphDepthExceeded(MAX_SUBGRAPH_DEPTH));
        }

        let mut embedded: HashMap<&str, (GraphDefinition, Boundary)> = HashMap::new();
        for node in graph.nodes.iter().filter(|n| n.is_subgraph()) {
            let inner = self.embedded_graph(node)?;
            let prefix = format!("{}.", scope.qualify(&node.name));
            let boundary = self.boundary(&inner, &prefix, depth + 1)?;
            embedded.insert(node.name.as_str(), (inner, boundary));
        }

        let rewrite_inputs = |refs: &[String]| {
            rewrite(refs, |r| {
                if r == START {
                    scope.start.clone().unwrap_or_else(|| vec![START.to_string()])
                } else if let Some((_, boundary)) = embedded.get(r) {
                    boundary.exits.clone()
                } else {
                    vec![scope.qualify(r)]
                }
            })
        };
        let rewrite_outputs = |refs: &[String]| {
            rewrite(refs, |r| {
                if r == END {
                    scope.end.clone().unwrap_or_else(|| vec![END.to_string()])
                } else if let Some((_, boundary)) = embedded.get(r) {
                    boundary.entries.clone()
                } else {
                    vec![scope.qualify(r)]
                }
            })
        };

        let mut nodes = Vec::with_capacity(graph.nodes.len());
        for node in &graph.nodes {
            let inputs = rewrite_inputs(&node.input_nodes);
            let outputs = rewrite_outputs(&node.output_nodes);

            match &node.kind {
                NodeKind::Agent { .. } => {
                    let mut flat = node.clone();
                    flat.name = scope.qualify(&node.name);
                    flat.input_nodes = inputs;
                    flat.output_nodes = outputs;
                    if !scope.prefix.is_empty() {
                        flat.origin = Some(NodeOrigin {
                            graph: graph.name.clone(),
                            node: node.name.clone(),
                        });
                    }
                    nodes.push(flat);
                }
                NodeKind::Subgraph { .. } => {
                    let Some((inner, _)) = embedded.get(node.name.as_str()) else {
                        continue;
                    };
                    let child = Scope {
                        prefix: format!("{}.", scope.qualify(&node.name)),
                        start: Some(inputs),
                        end: Some(outputs),
                    };
                    nodes.extend(self.expand(inner, &child, depth + 1)?);
                }
            }
        }
        Ok(nodes)
    }

    /// Entry and exit nodes of `graph` once flattened under `prefix`.
    fn boundary(&self, graph: &GraphDefinition, prefix: &str, depth: usize) -> Result<Boundary> {
        if depth > MAX_SUBGRAPH_DEPTH {
            return Err(AgentGraphError::SubgraphDepthExceeded(MAX_SUBGRAPH_DEPTH));
        }

        let mut boundary = Boundary::default();
        for node in &graph.nodes {
            let is_entry = node.is_start_node();
            let is_exit = node.output_nodes.iter().any(|o| o == END);
            if !is_entry && !is_exit {
                continue;
            }

            let name = format!("{}{}", prefix, node.name);
            if node.is_subgraph() {
                let inner = self.embedded_graph(node)?;
                let nested = self.boundary(&inner, &format!("{}.", name), depth + 1)?;
                if is_entry {
                    boundary.entries.extend(nested.entries);
                }
                if is_exit {
                    boundary.exits.extend(nested.exits);
                }
            } else {
                if is_entry {
                    boundary.entries.push(name.clone());
                }
                if is_exit {
                    boundary.exits.push(name);
                }
            }
        }

        if boundary.entries.is_empty() || boundary.exits.is_empty() {
            return Err(AgentGraphError::InvalidGraph(format!(
                "embedded graph '{}' needs at least one node reading from start and one writing to end",
                graph.name
            )));
        }
        Ok(boundary)
    }

    /// Fetch and validate the graph a subgraph node embeds.
    fn embedded_graph(&self, node: &Node) -> Result<GraphDefinition> {
        let name = node.subgraph_name().unwrap_or_default();
        let inner = self
            .graphs
            .graph(name)
            .ok_or_else(|| AgentGraphError::UnknownGraph {
                node: node.name.clone(),
                graph: name.to_string(),
            })?;
        self.validate(&inner)?;
        Ok(inner)
    }
}

/// Map every reference through `f`, dropping duplicates but keeping order.
fn rewrite(refs: &[String], f: impl Fn(&str) -> Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(refs.len());
    for r in refs {
        for mapped in f(r) {
            if !out.contains(&mapped) {
                out.push(mapped);
            }
        }
    }
    out
}
