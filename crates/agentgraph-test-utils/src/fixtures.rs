//! Graph fixtures. Every agent node uses a model named after itself, so a
//! [`ScriptedModel`](crate::ScriptedModel) can script nodes independently.

use agentgraph_core::graph::{GraphDefinition, Node};

fn agent(name: &str) -> Node {
    Node::agent(name, name.to_lowercase())
}

/// `start -> A -> B -> end`
pub fn linear_graph() -> GraphDefinition {
    GraphDefinition::new("linear")
        .with_node(agent("A").with_user_prompt("{{start}}").with_inputs(["start"]).with_outputs(["B"]))
        .with_node(agent("B").with_user_prompt("{{A}}").with_inputs(["A"]).with_outputs(["end"]))
}

/// `start -> A`, `start -> B`, `A, B -> C -> end`
pub fn diamond_graph() -> GraphDefinition {
    GraphDefinition::new("diamond")
        .with_node(agent("A").with_user_prompt("left {{start}}").with_inputs(["start"]).with_outputs(["C"]))
        .with_node(agent("B").with_user_prompt("right {{start}}").with_inputs(["start"]).with_outputs(["C"]))
        .with_node(
            agent("C")
                .with_user_prompt("{{A}} + {{B}}")
                .with_inputs(["A", "B"])
                .with_outputs(["end"]),
        )
}

/// `X` may hand off twice to `Y` or `Z`; `Y` returns control to `X`.
pub fn handoff_graph() -> GraphDefinition {
    GraphDefinition::new("handoff")
        .with_node(
            agent("X")
                .with_user_prompt("route {{start}}")
                .with_inputs(["start"])
                .with_outputs(["Y", "Z"])
                .with_handoffs(2),
        )
        .with_node(agent("Y").with_user_prompt("work on {{X}}").with_inputs(["X"]).with_outputs(["X", "end"]))
        .with_node(agent("Z").with_user_prompt("review {{X}}").with_inputs(["X"]).with_outputs(["end"]))
}

/// `P` and `Q` run side by side and may each hand off once, `P` to `T1`
/// and `Q` to `T2`. Only `T1` returns control to its selector.
pub fn sibling_handoff_graph() -> GraphDefinition {
    GraphDefinition::new("siblings")
        .with_node(
            agent("P")
                .with_user_prompt("plan {{start}}")
                .with_inputs(["start"])
                .with_outputs(["T1"])
                .with_handoffs(1),
        )
        .with_node(
            agent("Q")
                .with_user_prompt("check {{start}}")
                .with_inputs(["start"])
                .with_outputs(["T2"])
                .with_handoffs(1),
        )
        .with_node(agent("T1").with_user_prompt("expand {{P}}").with_inputs(["P"]).with_outputs(["P", "end"]))
        .with_node(agent("T2").with_user_prompt("verify {{Q}}").with_inputs(["Q"]).with_outputs(["end"]))
}

/// Inner graph `G = start -> P -> end`.
pub fn inner_graph() -> GraphDefinition {
    GraphDefinition::new("G")
        .with_node(agent("P").with_user_prompt("{{start}}").with_inputs(["start"]).with_outputs(["end"]))
}

/// Parent graph `start -> S -> end` where `S` embeds `G`.
pub fn parent_graph() -> GraphDefinition {
    GraphDefinition::new("parent")
        .with_node(Node::subgraph("S", "G").with_inputs(["start"]).with_outputs(["end"]))
}

/// Subgraph references `A -> B -> A`.
pub fn cyclic_graphs() -> Vec<GraphDefinition> {
    vec![
        GraphDefinition::new("A").with_node(Node::subgraph("toB", "B").with_inputs(["start"]).with_outputs(["end"])),
        GraphDefinition::new("B").with_node(Node::subgraph("toA", "A").with_inputs(["start"]).with_outputs(["end"])),
    ]
}

/// Model names used by the agent nodes of `graphs`.
pub fn model_names<'a>(graphs: impl IntoIterator<Item = &'a GraphDefinition>) -> Vec<String> {
    let mut names: Vec<String> = graphs
        .into_iter()
        .flat_map(|g| g.nodes.iter())
        .filter_map(|n| n.model_name().map(str::to_string))
        .collect();
    names.sort();
    names.dedup();
    names
}
