use std::collections::HashMap;

use agentgraph_core::error::{AgentGraphError, Result};
use agentgraph_core::graph::GraphDefinition;

/// Assign every node its dependency level.
///
/// A node reading from `start` is level 0; any other node sits one level
/// above its deepest input. Resolved as a fixpoint over at most
/// `nodes + 1` passes; nodes still unresolved after that form (or hang off)
/// a dependency cycle.
pub fn calculate_levels(graph: &GraphDefinition) -> Result<GraphDefinition> {
    let mut levels: HashMap<&str, usize> = HashMap::with_capacity(graph.nodes.len());

    for _ in 0..=graph.nodes.len() {
        let mut changed = false;
        for node in &graph.nodes {
            if levels.contains_key(node.name.as_str()) {
                continue;
            }
            let level = if node.is_start_node() {
                Some(0)
            } else {
                node.dependencies()
                    .map(|dep| levels.get(dep).copied())
                    .collect::<Option<Vec<usize>>>()
                    .map(|deps| deps.into_iter().max().map_or(0, |max| max + 1))
            };
            if let Some(level) = level {
                levels.insert(node.name.as_str(), level);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let unresolved: Vec<String> = graph
        .nodes
        .iter()
        .filter(|n| !levels.contains_key(n.name.as_str()))
        .map(|n| n.name.clone())
        .collect();
    if !unresolved.is_empty() {
        return Err(AgentGraphError::DependencyCycle(unresolved));
    }

    let mut leveled = graph.clone();
    for node in &mut leveled.nodes {
        node.level = levels[node.name.as_str()];
    }
    Ok(leveled)
}
