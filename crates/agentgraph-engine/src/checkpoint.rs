//! Resume points derived from a session's round log.
//!
//! Everything here is a pure function of the session document. The log is
//! the source of truth: [`rebuild_from_rounds`] recomputes all derived state
//! by replaying it, so a session whose tail was cut off with [`rewind`]
//! resumes exactly where the shorter log left off.

use std::fmt;

use tracing::{debug, warn};

use agentgraph_core::graph::Node;
use agentgraph_core::session::{ExecutionSession, HandoffStatus, Round};

/// What the scheduler should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeDecision {
    /// The current turn is finished; the next step needs caller input.
    Start,
    /// Run the runnable nodes of this level.
    ContinueAtLevel(usize),
    /// Control returns to this node so it can make its next selection.
    WaitForHandoff(String),
    /// A node selected this target and it has not run on that node's behalf yet.
    ContinueHandoff(String),
}

impl fmt::Display for ResumeDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start (waiting for input)"),
            Self::ContinueAtLevel(level) => write!(f, "continue at level {}", level),
            Self::WaitForHandoff(node) => write!(f, "return control to {}", node),
            Self::ContinueHandoff(target) => write!(f, "hand off to {}", target),
        }
    }
}

/// Decide the next step of the current turn.
pub fn resume_point(session: &ExecutionSession) -> ResumeDecision {
    let Some(turn_start) = session.current_turn_start() else {
        return ResumeDecision::Start;
    };

    if let Some(obligation) = open_obligations(session, turn_start).into_iter().next() {
        return match obligation {
            Obligation::Handoff { target, .. } => ResumeDecision::ContinueHandoff(target),
            Obligation::Return { node, .. } => ResumeDecision::WaitForHandoff(node),
        };
    }

    if session.pending.is_empty() {
        return ResumeDecision::Start;
    }

    match lowest_runnable_level(session) {
        Some(level) => ResumeDecision::ContinueAtLevel(level),
        None => {
            let stuck: Vec<&str> = session.pending.iter().map(String::as_str).collect();
            warn!(session = %session.id, ?stuck, "Pending nodes can never run, ending turn");
            ResumeDecision::Start
        }
    }
}

/// Handoff work of the current turn that has not been carried out yet.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Obligation {
    /// `source` selected `target` and `target` has not run on its behalf since.
    Handoff { source: String, target: String },
    /// A handed-off node finished and control goes back to `node`, which has
    /// not run since.
    Return { node: String },
}

/// Every open obligation of the turn starting at `turn_start`, oldest first.
///
/// Several nodes of one parallel batch can hand off at the same time, so
/// each handoff round is tracked on its own. A handoff is served only by a
/// run of the target that names the selector as its source; a run of the
/// target in normal level order does not count.
fn open_obligations(session: &ExecutionSession, turn_start: usize) -> Vec<Obligation> {
    let turn = &session.rounds[turn_start + 1..];
    let ran_after = |index: usize, served: &dyn Fn(&Round) -> bool| {
        turn.iter().any(|r| r.index > index && served(r))
    };

    turn.iter()
        .filter_map(|round| {
            if let Some(target) = &round.handoff_target {
                let source = &round.node_name;
                let served = ran_after(round.index, &|r| {
                    &r.node_name == target && r.handoff_source.as_ref() == Some(source)
                });
                return (!served).then(|| Obligation::Handoff {
                    source: source.clone(),
                    target: target.clone(),
                });
            }

            let source = round.handoff_source.as_deref()?;
            let node = session.graph.node(&round.node_name)?;
            if !node.output_nodes.iter().any(|o| o == source) {
                return None;
            }
            let returned = ran_after(round.index, &|r| r.node_name == source);
            (!returned).then(|| Obligation::Return {
                node: source.to_string(),
            })
        })
        .collect()
}

/// The node whose oldest unserved handoff of this turn selected `target`.
pub fn handoff_selector(session: &ExecutionSession, target: &str) -> Option<String> {
    let turn_start = session.current_turn_start()?;
    open_obligations(session, turn_start)
        .into_iter()
        .find_map(|obligation| match obligation {
            Obligation::Handoff { source, target: t, .. } if t == target => Some(source),
            _ => None,
        })
}

fn is_runnable(session: &ExecutionSession, node: &Node) -> bool {
    session.pending.contains(&node.name)
        && node.dependencies().all(|d| session.completed.contains(d))
}

fn lowest_runnable_level(session: &ExecutionSession) -> Option<usize> {
    session
        .graph
        .nodes
        .iter()
        .filter(|n| is_runnable(session, n))
        .map(|n| n.level)
        .min()
}

/// Runnable nodes at `level`, in definition order.
pub fn runnable_nodes(session: &ExecutionSession, level: usize) -> Vec<Node> {
    session
        .graph
        .nodes
        .iter()
        .filter(|n| n.level == level && is_runnable(session, n))
        .cloned()
        .collect()
}

/// Recompute every derived field purely from `rounds`.
pub fn rebuild_from_rounds(session: &mut ExecutionSession) {
    session.node_states.clear();
    session.global_outputs.clear();
    session.completed.clear();
    session.execution_chain.clear();
    session.pending = session.graph.nodes.iter().map(|n| n.name.clone()).collect();
    session.handoffs_status = session
        .graph
        .nodes
        .iter()
        .filter_map(|n| n.handoffs.map(|limit| (n.name.clone(), HandoffStatus::new(limit))))
        .collect();
    session.turn = 0;

    let rounds = std::mem::take(&mut session.rounds);
    for round in &rounds {
        session.apply_round(round);
    }
    session.rounds = rounds;
    session.touch();

    debug!(
        session = %session.id,
        rounds = session.rounds.len(),
        pending = session.pending.len(),
        "Rebuilt session state from rounds"
    );
}

/// Drop the last `n` node rounds (and any caller input recorded after the
/// earliest of them), then rebuild. Returns the number of rounds removed.
pub fn rewind(session: &mut ExecutionSession, n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let node_rounds: Vec<usize> = session
        .rounds
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.is_start())
        .map(|(i, _)| i)
        .collect();
    let Some(&cut) = node_rounds.iter().rev().take(n).last() else {
        return 0;
    };

    let removed = session.rounds.len() - cut;
    session.rounds.truncate(cut);
    session.final_output = None;
    rebuild_from_rounds(session);
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentgraph_core::session::NodeRun;
    use agentgraph_test_utils::{diamond_graph, handoff_graph, linear_graph, sibling_handoff_graph};

    use crate::graph::calculate_levels;

    fn session_for(graph: agentgraph_core::GraphDefinition) -> ExecutionSession {
        let graph = calculate_levels(&graph).unwrap();
        let mut session = ExecutionSession::new("s1", graph.name.clone(), graph);
        session.begin_turn("go");
        session
    }

    fn run(session: &mut ExecutionSession, node: &str, output: &str) {
        session.record_node_run(NodeRun {
            node_name: node.into(),
            output: output.into(),
            ..Default::default()
        });
    }

    fn handoff(session: &mut ExecutionSession, from: &str, to: &str) {
        session.record_node_run(NodeRun {
            node_name: from.into(),
            handoff_target: Some(to.into()),
            ..Default::default()
        });
    }

    fn handed(session: &mut ExecutionSession, node: &str, source: &str) {
        session.record_node_run(NodeRun {
            node_name: node.into(),
            output: format!("{} done", node),
            handoff_source: Some(source.into()),
            ..Default::default()
        });
    }

    #[test]
    fn test_fresh_session_waits_for_input() {
        let graph = calculate_levels(&linear_graph()).unwrap();
        let session = ExecutionSession::new("s1", "linear", graph);
        assert_eq!(resume_point(&session), ResumeDecision::Start);
    }

    #[test]
    fn test_levels_advance() {
        let mut session = session_for(linear_graph());
        assert_eq!(resume_point(&session), ResumeDecision::ContinueAtLevel(0));
        run(&mut session, "A", "a");
        assert_eq!(resume_point(&session), ResumeDecision::ContinueAtLevel(1));
        run(&mut session, "B", "b");
        assert_eq!(resume_point(&session), ResumeDecision::Start);
    }

    #[test]
    fn test_runnable_nodes_need_all_dependencies() {
        let mut session = session_for(diamond_graph());
        let names = |nodes: Vec<Node>| nodes.into_iter().map(|n| n.name).collect::<Vec<_>>();
        assert_eq!(names(runnable_nodes(&session, 0)), vec!["A", "B"]);

        run(&mut session, "A", "a");
        assert_eq!(names(runnable_nodes(&session, 0)), vec!["B"]);
        assert!(runnable_nodes(&session, 1).is_empty());

        run(&mut session, "B", "b");
        assert_eq!(resume_point(&session), ResumeDecision::ContinueAtLevel(1));
        assert_eq!(names(runnable_nodes(&session, 1)), vec!["C"]);
    }

    #[test]
    fn test_failed_node_still_unblocks_dependents() {
        let mut session = session_for(linear_graph());
        session.record_node_run(NodeRun {
            node_name: "A".into(),
            error: Some("model exploded".into()),
            ..Default::default()
        });
        assert!(session.completed.contains("A"));
        assert_eq!(resume_point(&session), ResumeDecision::ContinueAtLevel(1));
    }

    #[test]
    fn test_handoff_cycle() {
        let mut session = session_for(handoff_graph());
        handoff(&mut session, "X", "Y");
        assert_eq!(resume_point(&session), ResumeDecision::ContinueHandoff("Y".into()));

        handed(&mut session, "Y", "X");
        assert_eq!(resume_point(&session), ResumeDecision::WaitForHandoff("X".into()));

        handoff(&mut session, "X", "Y");
        assert_eq!(resume_point(&session), ResumeDecision::ContinueHandoff("Y".into()));
        handed(&mut session, "Y", "X");

        // Quota spent, control still returns so X can give a final answer.
        assert_eq!(session.handoff_status("X").unwrap().remaining(), 0);
        assert_eq!(resume_point(&session), ResumeDecision::WaitForHandoff("X".into()));

        run(&mut session, "X", "final");
        assert_eq!(resume_point(&session), ResumeDecision::ContinueAtLevel(1));
        run(&mut session, "Z", "z");
        assert_eq!(resume_point(&session), ResumeDecision::Start);
    }

    #[test]
    fn test_sibling_handoffs_are_served_oldest_first() {
        let mut session = session_for(sibling_handoff_graph());
        handoff(&mut session, "P", "T1");
        handoff(&mut session, "Q", "T2");
        assert_eq!(resume_point(&session), ResumeDecision::ContinueHandoff("T1".into()));
        assert_eq!(handoff_selector(&session, "T1").as_deref(), Some("P"));
        assert_eq!(handoff_selector(&session, "T2").as_deref(), Some("Q"));

        handed(&mut session, "T1", "P");
        // Q's handoff is older than T1's return to P.
        assert_eq!(resume_point(&session), ResumeDecision::ContinueHandoff("T2".into()));
        assert_eq!(handoff_selector(&session, "T1"), None);

        handed(&mut session, "T2", "Q");
        assert_eq!(resume_point(&session), ResumeDecision::WaitForHandoff("P".into()));

        run(&mut session, "P", "final");
        assert_eq!(resume_point(&session), ResumeDecision::Start);
    }

    #[test]
    fn test_level_order_run_does_not_serve_a_handoff() {
        let mut session = session_for(sibling_handoff_graph());
        handoff(&mut session, "P", "T1");
        run(&mut session, "T1", "unprompted");
        assert_eq!(resume_point(&session), ResumeDecision::ContinueHandoff("T1".into()));
        assert_eq!(handoff_selector(&session, "T1").as_deref(), Some("P"));
    }

    #[test]
    fn test_handoff_to_node_without_return_edge() {
        let mut session = session_for(handoff_graph());
        handoff(&mut session, "X", "Z");
        handed(&mut session, "Z", "X");
        // Z does not list X as an output, so normal level order resumes.
        assert_eq!(resume_point(&session), ResumeDecision::ContinueAtLevel(1));
    }

    #[test]
    fn test_handoffs_from_previous_turn_are_ignored() {
        let mut session = session_for(handoff_graph());
        handoff(&mut session, "X", "Y");
        session.begin_turn("again");
        assert_eq!(resume_point(&session), ResumeDecision::ContinueAtLevel(0));
        assert_eq!(session.handoff_status("X").unwrap().used, 0);
    }

    #[test]
    fn test_rebuild_matches_live_state() {
        let mut session = session_for(handoff_graph());
        handoff(&mut session, "X", "Y");
        handed(&mut session, "Y", "X");
        run(&mut session, "X", "final");
        session.begin_turn("second");
        run(&mut session, "X", "x2");

        let mut rebuilt = session.clone();
        rebuild_from_rounds(&mut rebuilt);

        assert_eq!(rebuilt.node_states, session.node_states);
        assert_eq!(rebuilt.global_outputs, session.global_outputs);
        assert_eq!(rebuilt.pending, session.pending);
        assert_eq!(rebuilt.completed, session.completed);
        assert_eq!(rebuilt.handoffs_status, session.handoffs_status);
        assert_eq!(rebuilt.execution_chain, session.execution_chain);
        assert_eq!(rebuilt.turn, 2);
    }

    #[test]
    fn test_rewind_restores_earlier_decision() {
        let mut session = session_for(diamond_graph());
        run(&mut session, "A", "a");
        run(&mut session, "B", "b");
        run(&mut session, "C", "c");
        assert_eq!(resume_point(&session), ResumeDecision::Start);

        assert_eq!(rewind(&mut session, 2), 2);
        assert_eq!(session.rounds.len(), 2);
        assert_eq!(resume_point(&session), ResumeDecision::ContinueAtLevel(0));
        assert_eq!(session.history("B"), &[] as &[String]);
        assert!(session.pending.contains("B") && session.pending.contains("C"));
    }

    #[test]
    fn test_rewind_across_turns_drops_later_input() {
        let mut session = session_for(linear_graph());
        run(&mut session, "A", "a");
        run(&mut session, "B", "b");
        session.begin_turn("next");

        assert_eq!(rewind(&mut session, 1), 2);
        assert_eq!(session.turn, 1);
        assert_eq!(session.history("start"), &["go".to_string()]);
        assert_eq!(resume_point(&session), ResumeDecision::ContinueAtLevel(1));

        assert_eq!(rewind(&mut session, 10), 1);
        assert_eq!(rewind(&mut session, 1), 0);
    }
}
