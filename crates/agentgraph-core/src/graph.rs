//! Graph definitions as authored by users and as produced by flattening.
//!
//! A graph is an ordered list of nodes. Edges are implicit: a node lists the
//! nodes it reads from in `input_nodes` and the nodes it may hand control to
//! in `output_nodes`. The sentinels `start` and `end` stand for the caller's
//! input and the run's designated outputs.

use serde::{Deserialize, Serialize};

use crate::error::AgentGraphError;

/// Virtual input node carrying the caller's input.
pub const START: &str = "start";
/// Virtual output node marking the run's designated outputs.
pub const END: &str = "end";
/// Prefix of the synthetic tools offered to nodes with a handoff quota.
pub const HANDOFF_TOOL_PREFIX: &str = "transfer_to_";

/// Whether `name` is one of the `start` / `end` sentinels.
pub fn is_sentinel(name: &str) -> bool {
    name == START || name == END
}

/// A complete graph definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_template: Option<String>,
}

impl GraphDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            nodes: vec![],
            end_template: None,
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_end_template(mut self, template: impl Into<String>) -> Self {
        self.end_template = Some(template.into());
        self
    }

    /// Parse a graph from its JSON document.
    pub fn from_json(json: &str) -> Result<Self, AgentGraphError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.node(name).is_some()
    }

    pub fn has_subgraphs(&self) -> bool {
        self.nodes.iter().any(|n| n.is_subgraph())
    }

    /// Nodes reading directly from the caller's input.
    pub fn start_nodes(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.is_start_node()).collect()
    }

    /// Nodes whose output is part of the run's result.
    pub fn end_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.output_nodes.iter().any(|o| o == END))
            .collect()
    }

    pub fn max_level(&self) -> usize {
        self.nodes.iter().map(|n| n.level).max().unwrap_or(0)
    }
}

/// What a node executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// An LLM-backed agent.
    Agent { model_name: String },
    /// An embedded graph, expanded away by flattening.
    Subgraph { subgraph_name: String },
}

/// Where a flattened node came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOrigin {
    /// Name of the graph that defines the node.
    pub graph: String,
    /// The node's name inside that graph.
    pub node: String,
}

/// A node in a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "NodeDocument", into = "NodeDocument")]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub system_prompt: String,
    pub user_prompt: String,
    pub input_nodes: Vec<String>,
    pub output_nodes: Vec<String>,
    pub handoffs: Option<u32>,
    pub output_enabled: bool,
    pub tools: Vec<String>,
    pub level: usize,
    pub save: Option<String>,
    pub origin: Option<NodeOrigin>,
}

impl Node {
    /// Create an agent node backed by `model_name`.
    pub fn agent(name: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self::with_kind(
            name.into(),
            NodeKind::Agent {
                model_name: model_name.into(),
            },
        )
    }

    /// Create a node embedding the graph `subgraph_name`.
    pub fn subgraph(name: impl Into<String>, subgraph_name: impl Into<String>) -> Self {
        Self::with_kind(
            name.into(),
            NodeKind::Subgraph {
                subgraph_name: subgraph_name.into(),
            },
        )
    }

    fn with_kind(name: String, kind: NodeKind) -> Self {
        Self {
            name,
            kind,
            system_prompt: String::new(),
            user_prompt: String::new(),
            input_nodes: vec![],
            output_nodes: vec![],
            handoffs: None,
            output_enabled: true,
            tools: vec![],
            level: 0,
            save: None,
            origin: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_user_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.user_prompt = prompt.into();
        self
    }

    pub fn with_inputs<S: Into<String>>(mut self, inputs: impl IntoIterator<Item = S>) -> Self {
        self.input_nodes = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs<S: Into<String>>(mut self, outputs: impl IntoIterator<Item = S>) -> Self {
        self.output_nodes = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_handoffs(mut self, limit: u32) -> Self {
        self.handoffs = Some(limit);
        self
    }

    pub fn with_tools<S: Into<String>>(mut self, tools: impl IntoIterator<Item = S>) -> Self {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output_enabled(mut self, enabled: bool) -> Self {
        self.output_enabled = enabled;
        self
    }

    pub fn with_save(mut self, extension: impl Into<String>) -> Self {
        self.save = Some(extension.into());
        self
    }

    pub fn is_subgraph(&self) -> bool {
        matches!(self.kind, NodeKind::Subgraph { .. })
    }

    pub fn model_name(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Agent { model_name } => Some(model_name),
            NodeKind::Subgraph { .. } => None,
        }
    }

    pub fn subgraph_name(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Subgraph { subgraph_name } => Some(subgraph_name),
            NodeKind::Agent { .. } => None,
        }
    }

    pub fn is_start_node(&self) -> bool {
        self.input_nodes.iter().any(|i| i == START)
    }

    /// Upstream nodes that must complete before this node can run.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.input_nodes
            .iter()
            .map(String::as_str)
            .filter(|i| *i != START)
    }

    /// Handoff candidates (output nodes other than `end`).
    pub fn handoff_targets(&self) -> impl Iterator<Item = &str> {
        self.output_nodes
            .iter()
            .map(String::as_str)
            .filter(|o| *o != END)
    }
}

/// Wire shape of a node: `model_name` and `subgraph_name` are separate
/// optional fields, exactly one of which must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeDocument {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subgraph_name: Option<String>,
    #[serde(default)]
    system_prompt: String,
    #[serde(default)]
    user_prompt: String,
    #[serde(default)]
    input_nodes: Vec<String>,
    #[serde(default)]
    output_nodes: Vec<String>,
    #[serde(default)]
    handoffs: Option<u32>,
    #[serde(default = "default_output_enabled")]
    output_enabled: bool,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    level: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    save: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<NodeOrigin>,
}

fn default_output_enabled() -> bool {
    true
}

impl TryFrom<NodeDocument> for Node {
    type Error = AgentGraphError;

    fn try_from(doc: NodeDocument) -> Result<Self, Self::Error> {
        let kind = match (doc.model_name, doc.subgraph_name) {
            (Some(model_name), None) => NodeKind::Agent { model_name },
            (None, Some(subgraph_name)) => NodeKind::Subgraph { subgraph_name },
            (Some(_), Some(_)) => {
                return Err(AgentGraphError::InvalidField {
                    node: doc.name,
                    field: "model_name".into(),
                    message: "model_name and subgraph_name are mutually exclusive".into(),
                })
            }
            (None, None) => {
                return Err(AgentGraphError::InvalidField {
                    node: doc.name,
                    field: "model_name".into(),
                    message: "one of model_name or subgraph_name is required".into(),
                })
            }
        };

        Ok(Self {
            name: doc.name,
            kind,
            system_prompt: doc.system_prompt,
            user_prompt: doc.user_prompt,
            input_nodes: doc.input_nodes,
            output_nodes: doc.output_nodes,
            handoffs: doc.handoffs,
            output_enabled: doc.output_enabled,
            tools: doc.tools,
            level: doc.level,
            save: doc.save,
            origin: doc.origin,
        })
    }
}

impl From<Node> for NodeDocument {
    fn from(node: Node) -> Self {
        let (model_name, subgraph_name) = match node.kind {
            NodeKind::Agent { model_name } => (Some(model_name), None),
            NodeKind::Subgraph { subgraph_name } => (None, Some(subgraph_name)),
        };
        Self {
            name: node.name,
            model_name,
            subgraph_name,
            system_prompt: node.system_prompt,
            user_prompt: node.user_prompt,
            input_nodes: node.input_nodes,
            output_nodes: node.output_nodes,
            handoffs: node.handoffs,
            output_enabled: node.output_enabled,
            tools: node.tools,
            level: node.level,
            save: node.save,
            origin: node.origin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_graph_document() {
        let json = r#"{
            "name": "research",
            "description": "two step",
            "nodes": [
                {"name": "planner", "model_name": "fast", "user_prompt": "{{start}}",
                 "input_nodes": ["start"], "output_nodes": ["writer"], "handoffs": 2},
                {"name": "writer", "subgraph_name": "drafting",
                 "input_nodes": ["planner"], "output_nodes": ["end"],
                 "output_enabled": false, "save": "md"}
            ],
            "end_template": "{{writer}}"
        }"#;

        let graph = GraphDefinition::from_json(json).unwrap();
        assert_eq!(graph.nodes.len(), 2);

        let planner = graph.node("planner").unwrap();
        assert_eq!(planner.model_name(), Some("fast"));
        assert_eq!(planner.handoffs, Some(2));
        assert!(planner.output_enabled);
        assert!(planner.is_start_node());

        let writer = graph.node("writer").unwrap();
        assert_eq!(writer.subgraph_name(), Some("drafting"));
        assert!(!writer.output_enabled);
        assert_eq!(writer.save.as_deref(), Some("md"));
        assert_eq!(graph.end_nodes().len(), 1);
        assert_eq!(graph.end_template.as_deref(), Some("{{writer}}"));
    }

    #[test]
    fn test_node_kind_is_exclusive() {
        let both = r#"{"name": "x", "model_name": "m", "subgraph_name": "g", "input_nodes": ["start"]}"#;
        let err = serde_json::from_str::<Node>(both).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));

        let neither = r#"{"name": "x", "input_nodes": ["start"]}"#;
        let err = serde_json::from_str::<Node>(neither).unwrap_err();
        assert!(err.to_string().contains("required"));
    }

    #[test]
    fn test_node_serializes_back_to_wire_shape() {
        let node = Node::agent("a", "m").with_inputs(["start"]).with_outputs(["end"]);
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["model_name"], "m");
        assert!(json.get("subgraph_name").is_none());
        assert!(json.get("kind").is_none());

        let back: Node = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_dependencies_skip_start() {
        let node = Node::agent("c", "m").with_inputs(["start", "a", "b"]);
        let deps: Vec<&str> = node.dependencies().collect();
        assert_eq!(deps, vec!["a", "b"]);

        let node = Node::agent("r", "m").with_outputs(["x", "end", "y"]);
        let targets: Vec<&str> = node.handoff_targets().collect();
        assert_eq!(targets, vec!["x", "y"]);
    }
}
