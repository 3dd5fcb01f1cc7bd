//! `{{...}}` placeholder resolution.
//!
//! | form | resolves to |
//! |---|---|
//! | `{{node}}` | latest output of `node` (`{{start}}` is the latest caller input) |
//! | `{{node:N}}` | the N most recent ledger entries of `node` |
//! | `{{node:all}}` | every ledger entry of `node` |
//! | `{{@name}}` | the registered prompt `name`, inserted literally |
//! | `{{a:N\|b:M}}` | recent entries of `a` and `b`, interleaved |
//!
//! Multi-entry forms join entries with [`ENTRY_SEPARATOR`], oldest first.
//! Joint references align the selected histories at their most recent
//! entry and then alternate position by position, so `a=[a1,a2]` with
//! `b=[b1,b2,b3]` yields `b1, a1, b2, a2, b3`. A bare name inside a joint
//! reference selects one entry.
//!
//! Unknown nodes and prompts resolve to the empty string. A placeholder with
//! an unparseable selector is left in the text untouched.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use agentgraph_core::graph::START;
use agentgraph_core::session::ExecutionSession;
use agentgraph_core::traits::PromptLibrary;

pub const ENTRY_SEPARATOR: &str = "\n\n---\n\n";

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("placeholder regex is valid"))
}

/// How many entries of a node's history a reference selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selector {
    Latest,
    Last(usize),
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Placeholder {
    Prompt(String),
    Node(String, Selector),
    Joint(Vec<(String, usize)>),
}

fn parse_ref(part: &str) -> Option<(String, Selector)> {
    let (name, selector) = match part.split_once(':') {
        None => (part.trim(), Selector::Latest),
        Some((name, sel)) => {
            let sel = sel.trim();
            let selector = if sel == "all" {
                Selector::All
            } else {
                match sel.parse::<usize>() {
                    Ok(n) if n > 0 => Selector::Last(n),
                    _ => return None,
                }
            };
            (name.trim(), selector)
        }
    };
    if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c == '@') {
        return None;
    }
    Some((name.to_string(), selector))
}

fn parse(inner: &str) -> Option<Placeholder> {
    if let Some(name) = inner.strip_prefix('@') {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        return Some(Placeholder::Prompt(name.to_string()));
    }

    if inner.contains('|') {
        let mut parts = Vec::new();
        for part in inner.split('|') {
            let (name, selector) = parse_ref(part)?;
            let count = match selector {
                Selector::Latest => 1,
                Selector::Last(n) => n,
                Selector::All => usize::MAX,
            };
            parts.push((name, count));
        }
        return Some(Placeholder::Joint(parts));
    }

    let (name, selector) = parse_ref(inner)?;
    Some(Placeholder::Node(name, selector))
}

/// Node outputs visible to a resolution: latest results plus the ledger.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputSnapshot {
    latest: HashMap<String, String>,
    history: HashMap<String, Vec<String>>,
}

impl OutputSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_session(session: &ExecutionSession) -> Self {
        let mut latest: HashMap<String, String> = session
            .node_states
            .iter()
            .map(|(name, result)| (name.clone(), result.output.clone()))
            .collect();
        if let Some(input) = session.latest_output(START) {
            latest.insert(START.to_string(), input.to_string());
        }
        let history = session
            .global_outputs
            .iter()
            .map(|(name, entries)| (name.clone(), entries.clone()))
            .collect();
        Self { latest, history }
    }

    /// Record an output as both the latest value and a new ledger entry.
    pub fn with_output(mut self, node: &str, output: impl Into<String>) -> Self {
        let output = output.into();
        self.latest.insert(node.to_string(), output.clone());
        self.history.entry(node.to_string()).or_default().push(output);
        self
    }

    pub fn latest(&self, node: &str) -> Option<&str> {
        self.latest.get(node).map(String::as_str)
    }

    pub fn history(&self, node: &str) -> &[String] {
        self.history.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    fn recent(&self, node: &str, count: usize) -> &[String] {
        let history = self.history(node);
        &history[history.len().saturating_sub(count)..]
    }
}

/// Substitute every placeholder in `text`.
pub fn resolve(text: &str, outputs: &OutputSnapshot, prompts: &dyn PromptLibrary) -> String {
    placeholder_re()
        .replace_all(text, |caps: &Captures| {
            let Some(placeholder) = parse(&caps[1]) else {
                return caps[0].to_string();
            };
            match placeholder {
                Placeholder::Prompt(name) => prompts.prompt(&name).unwrap_or_default(),
                Placeholder::Node(name, Selector::Latest) => {
                    outputs.latest(&name).unwrap_or_default().to_string()
                }
                Placeholder::Node(name, Selector::Last(n)) => {
                    outputs.recent(&name, n).join(ENTRY_SEPARATOR)
                }
                Placeholder::Node(name, Selector::All) => {
                    outputs.history(&name).join(ENTRY_SEPARATOR)
                }
                Placeholder::Joint(parts) => interleave(outputs, &parts).join(ENTRY_SEPARATOR),
            }
        })
        .into_owned()
}

fn interleave<'a>(outputs: &'a OutputSnapshot, parts: &[(String, usize)]) -> Vec<&'a str> {
    let selected: Vec<&[String]> = parts
        .iter()
        .map(|(name, count)| outputs.recent(name, *count))
        .collect();
    let width = selected.iter().map(|s| s.len()).max().unwrap_or(0);

    let mut merged = Vec::with_capacity(selected.iter().map(|s| s.len()).sum());
    for position in 0..width {
        for entries in &selected {
            let offset = width - entries.len();
            if position >= offset {
                merged.push(entries[position - offset].as_str());
            }
        }
    }
    merged
}

/// Node names referenced by well-formed placeholders in `text`, in order of
/// first appearance. Prompt references are not included.
pub fn referenced_nodes(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut push = |name: String| {
        if !names.contains(&name) {
            names.push(name);
        }
    };
    for caps in placeholder_re().captures_iter(text) {
        match parse(&caps[1]) {
            Some(Placeholder::Node(name, _)) => push(name),
            Some(Placeholder::Joint(parts)) => parts.into_iter().for_each(|(name, _)| push(name)),
            Some(Placeholder::Prompt(_)) | None => {}
        }
    }
    names
}
