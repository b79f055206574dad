//! Turns free-form model output into a [`DiagramSpec`].
//!
//! Models are asked for JSON but routinely answer with prose, numbered steps or
//! Mermaid. The parser tries the structured shape first and falls back to a set
//! of loose text rules. Every rule that fires is recorded in a [`ParseTrace`]
//! so the outcome can be inspected after the fact.
//!
//! Node identity: an endpoint's id is its cleaned label, lowercased with
//! whitespace runs collapsed (`"Load  Data"` and `"load data"` are the same
//! node). The first spelling seen is kept as the display label.

mod structured;

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::diagram::{AnimationCue, DiagramSpec, Edge, EdgeStyle, Node, NodeKind};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("no diagram structure found in the model response")]
    NoStructureFound,
    #[error("malformed node reference '{reference}': {reason}")]
    MalformedNodeRef { reference: String, reason: String },
    #[error("ambiguous edge endpoint '{endpoint}'")]
    AmbiguousEdge { endpoint: String },
}

/// One normalization decision taken while parsing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ParseStep {
    StrippedReasoning,
    StrippedCodeFence,
    StructuredJson { nodes: usize, edges: usize },
    ArrowChain { clause: String },
    RelationSynonym { phrase: String, style: EdgeStyle },
    NumberedStep { number: u32, node: String },
    SequenceConnective { connective: String },
    MermaidNode { alias: String, node: String },
    Canonicalized { spelling: String, id: String },
    KindInferred { node: String, kind: NodeKind },
    SelfLoopDropped { node: String },
    DuplicateEdgeMerged { source: String, target: String },
    FragmentDropped { fragment: String, reason: String },
    AnimationCues { count: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ParseTrace {
    steps: Vec<ParseStep>,
}

impl ParseTrace {
    pub fn push(&mut self, step: ParseStep) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[ParseStep] {
        &self.steps
    }

    /// Fragments that were discarded.
    pub fn dropped(&self) -> impl Iterator<Item = &ParseStep> {
        self.steps.iter().filter(|step| {
            matches!(
                step,
                ParseStep::FragmentDropped { .. } | ParseStep::SelfLoopDropped { .. }
            )
        })
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub spec: DiagramSpec,
    pub trace: ParseTrace,
}

#[derive(Debug, Clone)]
pub struct ParserOptions {
    /// Endpoints longer than this are treated as prose, not node names.
    pub max_endpoint_words: usize,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            max_endpoint_words: 8,
        }
    }
}

lazy_static! {
    static ref THINK_BLOCK: Regex = Regex::new(r"(?is)<think>.*?(</think>|$)").unwrap();
    static ref CODE_FENCE: Regex = Regex::new(r"(?m)^\s*```[\w-]*\s*$").unwrap();
    static ref BULLET: Regex = Regex::new(r"^\s*(?:[-*•]\s+)").unwrap();
    static ref NUMBERED_LINE: Regex =
        Regex::new(r"(?i)^\s*(?:step\s*)?(\d+)\s*[.):\-]\s+(.+)$").unwrap();
    static ref STEP_CLAUSE: Regex = Regex::new(r"(?i)^step\s*(\d+)\s*[.):\-]?\s*(.+)$").unwrap();
    static ref CLAUSE_SPLIT: Regex = Regex::new(r"[;,]|\.(?:\s+|$)").unwrap();
    static ref CONNECTIVE: Regex = Regex::new(
        r"(?i)^(and then|after that|afterwards|then|next|finally|and|first|otherwise)\b[\s,:]*"
    )
    .unwrap();
    static ref LABELED_ARROW: Regex = Regex::new(r"--\s+([^\s|>\-][^|>]*?)\s+-->").unwrap();
    static ref ARROW: Regex =
        Regex::new(r"\s*(-\.->|-->|---|==>|->|=>|→)\s*(?:\|([^|]*)\|)?\s*").unwrap();
    static ref MERMAID_NODE: Regex =
        Regex::new(r#"^([A-Za-z0-9_]+)([\[({>/\\]+)\s*"?(.*?)"?\s*[\])}/\\]+$"#).unwrap();
    // Mermaid keywords are lowercase; prose such as "Graph builder" must survive.
    static ref MERMAID_DIRECTIVE: Regex = Regex::new(
        r"^\s*(?:(?:flowchart|graph)\s+(?:TD|TB|BT|RL|LR)\b|(?:flowchart|graph)\s*$|(?:style|classDef|class|linkStyle|subgraph)\s|%%|end\s*$)"
    )
    .unwrap();
    static ref TRAILING_CONDITION: Regex =
        Regex::new(r"(?i)^(.+?)\s+((?:if|when|unless)\s+.+)$").unwrap();
    static ref RELATION: Regex = {
        let phrases = RELATION_SYNONYMS
            .iter()
            .map(|(phrase, _)| regex::escape(phrase).replace(' ', r"\s+"))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!(r"(?i)\s+({})\s+", phrases)).unwrap()
    };
    // A relation phrase at either end of a clause has lost one endpoint.
    static ref DANGLING_RELATION: Regex = {
        let phrases = RELATION_SYNONYMS
            .iter()
            .map(|(phrase, _)| regex::escape(phrase).replace(' ', r"\s+"))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!(r"(?i)^(?:{0})(?:\s|$)|\s(?:{0})$", phrases)).unwrap()
    };
    static ref ALTERNATIVE: Regex = Regex::new(r"(?i)\s(or)\s").unwrap();
}

/// Relation phrases and the edge style they imply. Longer phrases come first
/// so that `goes back to` wins over `goes to`.
const RELATION_SYNONYMS: &[(&str, EdgeStyle)] = &[
    ("loops back to", EdgeStyle::Feedback),
    ("goes back to", EdgeStyle::Feedback),
    ("jumps back to", EdgeStyle::Feedback),
    ("returns to", EdgeStyle::Feedback),
    ("loops to", EdgeStyle::Feedback),
    ("retries", EdgeStyle::Feedback),
    ("otherwise goes to", EdgeStyle::Conditional),
    ("optionally goes to", EdgeStyle::Conditional),
    ("may go to", EdgeStyle::Conditional),
    ("can go to", EdgeStyle::Conditional),
    ("branches to", EdgeStyle::Conditional),
    ("leads to", EdgeStyle::Normal),
    ("goes to", EdgeStyle::Normal),
    ("connects to", EdgeStyle::Normal),
    ("flows into", EdgeStyle::Normal),
    ("flows to", EdgeStyle::Normal),
    ("proceeds to", EdgeStyle::Normal),
    ("moves to", EdgeStyle::Normal),
    ("transitions to", EdgeStyle::Normal),
    ("continues to", EdgeStyle::Normal),
    ("points to", EdgeStyle::Normal),
    ("feeds into", EdgeStyle::Normal),
    ("passes to", EdgeStyle::Normal),
    ("sends to", EdgeStyle::Normal),
    ("results in", EdgeStyle::Normal),
    ("followed by", EdgeStyle::Normal),
    ("triggers", EdgeStyle::Normal),
    ("calls", EdgeStyle::Normal),
    ("then", EdgeStyle::Normal),
];

const CONDITION_LABELS: &[&str] = &[
    "yes", "no", "y", "n", "true", "false", "ok", "valid", "invalid", "success", "failure", "fail",
    "pass",
];

/// Parser for model responses. Stateless apart from its options.
#[derive(Debug, Clone, Default)]
pub struct DiagramParser {
    options: ParserOptions,
}

impl DiagramParser {
    pub fn new(options: ParserOptions) -> Self {
        Self { options }
    }

    /// Parses a response. Succeeds only with at least one node.
    #[instrument(skip_all, fields(chars = text.len()))]
    pub fn parse(&self, text: &str) -> Result<ParseOutcome, ParseError> {
        let mut trace = ParseTrace::default();
        let cleaned = preprocess(text, &mut trace);

        if let Some(outcome) = structured::parse(&cleaned, self, trace.clone())? {
            return Ok(outcome);
        }

        let mut acc = Accumulator::new(self.options.clone(), trace);
        let mut steps: Vec<(u32, String)> = Vec::new();

        for line in cleaned.lines() {
            let line = BULLET.replace(line, "");
            let line = line.trim();
            if !line.chars().any(char::is_alphanumeric) || MERMAID_DIRECTIVE.is_match(line) {
                continue;
            }

            let (line_step, body) = match NUMBERED_LINE.captures(line) {
                Some(caps) => (caps[1].parse::<u32>().ok(), caps[2].to_string()),
                None => (None, line.to_string()),
            };

            for (i, clause) in split_clauses(&body).into_iter().enumerate() {
                let step = if i == 0 { line_step } else { None };
                acc.clause(&clause, step, &mut steps)?;
            }
        }

        acc.chain_steps(steps);
        let outcome = acc.finish(None);
        if outcome.spec.is_empty() {
            debug!("No nodes recovered from model response");
            return Err(ParseError::NoStructureFound);
        }
        Ok(outcome)
    }

    fn options(&self) -> &ParserOptions {
        &self.options
    }
}

fn preprocess(text: &str, trace: &mut ParseTrace) -> String {
    let mut out = text.to_string();
    if THINK_BLOCK.is_match(&out) {
        out = THINK_BLOCK.replace_all(&out, "").into_owned();
        trace.push(ParseStep::StrippedReasoning);
    }
    if CODE_FENCE.is_match(&out) {
        out = CODE_FENCE.replace_all(&out, "").into_owned();
        trace.push(ParseStep::StrippedCodeFence);
    }
    out
}

fn split_clauses(line: &str) -> Vec<String> {
    // Mermaid edge labels may contain commas; keep arrow lines whole.
    if ARROW.is_match(line) {
        return vec![line.trim().trim_end_matches(['.', ';']).to_string()];
    }
    CLAUSE_SPLIT
        .split(line)
        .map(|clause| clause.trim().to_string())
        .filter(|clause| !clause.is_empty())
        .collect()
}

/// Canonical node id: lowercase with whitespace runs collapsed.
pub fn canonical_id(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Strips decoration around an endpoint phrase. Returns `None` when nothing is left.
fn clean_endpoint(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches(|c: char| {
        matches!(c, '"' | '\'' | '`' | '*' | '[' | ']' | '(' | ')' | '{' | '}' | ':' | '.' | ',' | '!')
    });
    let mut words: Vec<&str> = trimmed.split_whitespace().collect();
    if words.len() > 1 {
        let first = words[0].to_ascii_lowercase();
        if first == "the" || first == "a" || first == "an" {
            words.remove(0);
        }
    }
    let cleaned = words.join(" ");
    let cleaned = cleaned.trim_matches(|c: char| matches!(c, '"' | '\'' | '`'));
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Guesses a node kind from its label.
pub fn infer_kind(label: &str) -> NodeKind {
    let lower = label.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let Some(first) = words.first().copied() else {
        return NodeKind::Process;
    };

    if words.len() <= 2 && matches!(first, "start" | "begin") {
        NodeKind::Start
    } else if words.len() <= 2 && matches!(first, "end" | "finish" | "stop" | "done" | "exit") {
        NodeKind::End
    } else if lower.trim_end().ends_with('?')
        || matches!(first, "if" | "whether" | "is" | "are" | "does" | "decision")
    {
        NodeKind::Decision
    } else if words.iter().any(|w| {
        matches!(
            *w,
            "input" | "output" | "read" | "write" | "print" | "display" | "upload" | "download"
        )
    }) {
        NodeKind::Io
    } else {
        NodeKind::Process
    }
}

fn style_for_label(label: &str) -> EdgeStyle {
    let lower = label.trim().to_lowercase();
    if CONDITION_LABELS.contains(&lower.as_str())
        || lower.starts_with("if ")
        || lower.starts_with("when ")
        || lower.starts_with("unless ")
    {
        EdgeStyle::Conditional
    } else {
        EdgeStyle::Normal
    }
}

/// Collects nodes and edges while applying the identity, self-loop and
/// duplicate-edge policies.
struct Accumulator {
    options: ParserOptions,
    trace: ParseTrace,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    aliases: HashMap<String, String>,
    edges: Vec<Edge>,
    animations: Vec<AnimationCue>,
    last_node: Option<String>,
}

enum Endpoint {
    Node(String),
    Dropped,
}

impl Accumulator {
    fn new(options: ParserOptions, trace: ParseTrace) -> Self {
        Self {
            options,
            trace,
            nodes: Vec::new(),
            index: HashMap::new(),
            aliases: HashMap::new(),
            edges: Vec::new(),
            animations: Vec::new(),
            last_node: None,
        }
    }

    fn drop_fragment(&mut self, fragment: &str, reason: &str) {
        warn!("Dropping unresolvable fragment '{}': {}", fragment, reason);
        self.trace.push(ParseStep::FragmentDropped {
            fragment: fragment.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Adds (or finds) a node with an explicit id and label.
    fn add_node(&mut self, id: String, label: String, kind: Option<NodeKind>) -> String {
        if let Some(&idx) = self.index.get(&id) {
            let existing = &self.nodes[idx];
            if existing.label != label {
                self.trace.push(ParseStep::Canonicalized {
                    spelling: label,
                    id: id.clone(),
                });
            }
            return id;
        }
        let kind = match kind {
            Some(kind) => kind,
            None => {
                let kind = infer_kind(&label);
                if kind != NodeKind::Process {
                    self.trace.push(ParseStep::KindInferred {
                        node: id.clone(),
                        kind,
                    });
                }
                kind
            }
        };
        self.index.insert(id.clone(), self.nodes.len());
        self.nodes.push(Node::new(id.clone(), label, kind));
        id
    }

    /// Resolves a free-text endpoint to a node id, creating the node if needed.
    fn endpoint(&mut self, raw: &str) -> Result<Endpoint, ParseError> {
        if let Some(caps) = MERMAID_NODE.captures(raw.trim()) {
            let alias = caps[1].to_string();
            let opener = caps[2].to_string();
            let label = caps[3].trim();
            if !label.is_empty() {
                let kind = if opener.starts_with('{') {
                    Some(NodeKind::Decision)
                } else if opener.starts_with("[/") || opener.starts_with("[\\") {
                    Some(NodeKind::Io)
                } else {
                    None
                };
                let id = self.add_node(canonical_id(label), label.to_string(), kind);
                let alias_key = canonical_id(&alias);
                if alias_key != id && !self.aliases.contains_key(&alias_key) {
                    self.trace.push(ParseStep::MermaidNode {
                        alias: alias.clone(),
                        node: id.clone(),
                    });
                    self.aliases.insert(alias_key, id.clone());
                }
                return Ok(Endpoint::Node(id));
            }
        }

        let Some(label) = clean_endpoint(raw) else {
            self.drop_fragment(raw, "empty endpoint");
            return Ok(Endpoint::Dropped);
        };
        if label.split_whitespace().count() > self.options.max_endpoint_words {
            self.drop_fragment(raw, "endpoint too long to be a node name");
            return Ok(Endpoint::Dropped);
        }
        if ALTERNATIVE.is_match(&format!(" {} ", label)) && !label.ends_with('?') {
            return Err(ParseError::AmbiguousEdge { endpoint: label });
        }

        let key = canonical_id(&label);
        if let Some(target) = self.aliases.get(&key) {
            return Ok(Endpoint::Node(target.clone()));
        }
        Ok(Endpoint::Node(self.add_node(key, label, None)))
    }

    fn connect(&mut self, source: &str, target: &str, label: Option<String>, style: EdgeStyle) {
        if source == target {
            warn!("Dropping self-loop on '{}'", source);
            self.trace.push(ParseStep::SelfLoopDropped {
                node: source.to_string(),
            });
            return;
        }
        if self
            .edges
            .iter()
            .any(|edge| edge.source == source && edge.target == target)
        {
            self.trace.push(ParseStep::DuplicateEdgeMerged {
                source: source.to_string(),
                target: target.to_string(),
            });
            return;
        }
        let label = label.map(|l| l.trim().to_string()).filter(|l| !l.is_empty());
        self.edges.push(Edge {
            source: source.to_string(),
            target: target.to_string(),
            label,
            style,
        });
    }

    fn clause(
        &mut self,
        clause: &str,
        line_step: Option<u32>,
        steps: &mut Vec<(u32, String)>,
    ) -> Result<(), ParseError> {
        let mut rest = clause.trim();
        let mut connective = None;
        if let Some(m) = CONNECTIVE.find(rest) {
            let word = rest[..m.end()]
                .trim()
                .trim_end_matches([',', ':'])
                .to_lowercase();
            connective = Some(word.clone());
            rest = rest[m.end()..].trim();
            self.trace.push(ParseStep::SequenceConnective { connective: word });
        }
        if rest.is_empty() {
            return Ok(());
        }

        let mut step = line_step;
        let owned;
        if let Some(caps) = STEP_CLAUSE.captures(rest) {
            step = caps[1].parse::<u32>().ok();
            owned = caps[2].to_string();
            rest = owned.trim();
        }

        if ARROW.is_match(rest) {
            return self.arrow_chain(rest);
        }
        if RELATION.is_match(rest) {
            let conditional = connective.as_deref() == Some("otherwise");
            return self.relation_chain(rest, conditional);
        }
        if step.is_none() && connective.is_none() && DANGLING_RELATION.is_match(rest) {
            self.drop_fragment(rest, "relation is missing an endpoint");
            return Ok(());
        }
        if let Some(number) = step {
            if let Endpoint::Node(id) = self.endpoint(rest.trim_end_matches('.'))? {
                self.trace.push(ParseStep::NumberedStep {
                    number,
                    node: id.clone(),
                });
                steps.push((number, id.clone()));
                self.last_node = Some(id);
            }
            return Ok(());
        }
        if MERMAID_NODE.is_match(rest) {
            if let Endpoint::Node(id) = self.endpoint(rest)? {
                self.last_node = Some(id);
            }
            return Ok(());
        }
        if let Some(connective) = connective {
            if let Endpoint::Node(id) = self.endpoint(rest)? {
                if connective != "first" {
                    if let Some(previous) = self.last_node.clone() {
                        let style = if connective == "otherwise" {
                            EdgeStyle::Conditional
                        } else {
                            EdgeStyle::Normal
                        };
                        let label = (connective == "otherwise").then(|| connective.clone());
                        self.connect(&previous, &id, label, style);
                    }
                }
                self.last_node = Some(id);
            }
            return Ok(());
        }

        debug!("Ignoring prose clause '{}'", rest);
        Ok(())
    }

    fn arrow_chain(&mut self, clause: &str) -> Result<(), ParseError> {
        self.trace.push(ParseStep::ArrowChain {
            clause: clause.to_string(),
        });
        let normalized = LABELED_ARROW.replace_all(clause, "-->|$1|");

        let mut segments = Vec::new();
        let mut arrows = Vec::new();
        let mut cursor = 0;
        for caps in ARROW.captures_iter(&normalized) {
            let Some(whole) = caps.get(0) else { continue };
            segments.push(normalized[cursor..whole.start()].to_string());
            let op = caps.get(1).map(|m| m.as_str()).unwrap_or("-->");
            let label = caps.get(2).map(|m| m.as_str().trim().trim_matches('"').to_string());
            arrows.push((op.to_string(), label));
            cursor = whole.end();
        }
        segments.push(normalized[cursor..].to_string());

        let mut previous: Option<String> = None;
        for (i, segment) in segments.iter().enumerate() {
            let current = match self.endpoint(segment)? {
                Endpoint::Node(id) => Some(id),
                Endpoint::Dropped => None,
            };
            if i > 0 {
                if let (Some(source), Some(target)) = (previous.as_deref(), current.as_deref()) {
                    let (op, label) = &arrows[i - 1];
                    let style = if op == "-.->" {
                        EdgeStyle::Feedback
                    } else {
                        label.as_deref().map(style_for_label).unwrap_or_default()
                    };
                    self.connect(source, target, label.clone(), style);
                }
            }
            if current.is_some() {
                self.last_node = current.clone();
            }
            previous = current;
        }
        Ok(())
    }

    fn relation_chain(&mut self, clause: &str, conditional: bool) -> Result<(), ParseError> {
        let mut segments = Vec::new();
        let mut phrases = Vec::new();
        let mut cursor = 0;
        for caps in RELATION.captures_iter(clause) {
            let Some(whole) = caps.get(0) else { continue };
            segments.push(&clause[cursor..whole.start()]);
            phrases.push(canonical_id(&caps[1]));
            cursor = whole.end();
        }
        segments.push(&clause[cursor..]);

        let mut previous = match self.endpoint(segments[0])? {
            Endpoint::Node(id) => Some(id),
            Endpoint::Dropped => None,
        };
        for (phrase, segment) in phrases.into_iter().zip(segments.into_iter().skip(1)) {
            let mut style = RELATION_SYNONYMS
                .iter()
                .find(|(p, _)| *p == phrase)
                .map(|(_, style)| *style)
                .unwrap_or_default();
            if conditional && style == EdgeStyle::Normal {
                style = EdgeStyle::Conditional;
            }
            self.trace.push(ParseStep::RelationSynonym { phrase, style });

            let (target, label) = match TRAILING_CONDITION.captures(segment) {
                Some(cond) => {
                    style = EdgeStyle::Conditional;
                    (cond[1].to_string(), Some(cond[2].to_string()))
                }
                None => (segment.to_string(), conditional.then(|| "otherwise".to_string())),
            };

            let current = match self.endpoint(&target)? {
                Endpoint::Node(id) => Some(id),
                Endpoint::Dropped => None,
            };
            if let (Some(source), Some(target)) = (previous.as_deref(), current.as_deref()) {
                self.connect(source, target, label, style);
            }
            if current.is_some() {
                self.last_node = current.clone();
            }
            previous = current;
        }
        Ok(())
    }

    fn chain_steps(&mut self, mut steps: Vec<(u32, String)>) {
        // Stable: equal numbers keep their order of appearance.
        steps.sort_by_key(|(number, _)| *number);
        for pair in steps.windows(2) {
            let (from, to) = (pair[0].1.clone(), pair[1].1.clone());
            self.connect(&from, &to, None, EdgeStyle::Normal);
        }
    }

    fn finish(self, title: Option<String>) -> ParseOutcome {
        ParseOutcome {
            spec: DiagramSpec {
                title,
                nodes: self.nodes,
                edges: self.edges,
                animations: self.animations,
            },
            trace: self.trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> ParseOutcome {
        DiagramParser::default().parse(text).unwrap()
    }

    fn edge_pairs(spec: &DiagramSpec) -> Vec<(&str, &str)> {
        spec.edges
            .iter()
            .map(|e| (e.source.as_str(), e.target.as_str()))
            .collect()
    }

    fn labels(spec: &DiagramSpec) -> Vec<&str> {
        spec.nodes.iter().map(|n| n.label.as_str()).collect()
    }

    #[test]
    fn test_leads_to_scenario() {
        let outcome = parse("Start leads to Validate, Validate leads to End");
        assert_eq!(labels(&outcome.spec), vec!["Start", "Validate", "End"]);
        assert_eq!(
            edge_pairs(&outcome.spec),
            vec![("start", "validate"), ("validate", "end")]
        );
        assert_eq!(outcome.spec.nodes[0].kind, NodeKind::Start);
        assert_eq!(outcome.spec.nodes[2].kind, NodeKind::End);
    }

    #[test]
    fn test_case_collapse_and_self_loop_policy() {
        let outcome = parse("A connects to a, then A connects to B");
        assert_eq!(labels(&outcome.spec), vec!["A", "B"]);
        assert_eq!(edge_pairs(&outcome.spec), vec![("a", "b")]);
        assert!(outcome
            .trace
            .steps()
            .contains(&ParseStep::SelfLoopDropped { node: "a".into() }));
        assert!(outcome.trace.steps().contains(&ParseStep::Canonicalized {
            spelling: "a".into(),
            id: "a".into()
        }));
    }

    #[test]
    fn test_whitespace_and_case_collapse_to_one_node() {
        let outcome = parse("Load   Data leads to Check\nload data goes to Save");
        assert_eq!(labels(&outcome.spec), vec!["Load Data", "Check", "Save"]);
        assert_eq!(
            edge_pairs(&outcome.spec),
            vec![("load data", "check"), ("load data", "save")]
        );
    }

    #[test]
    fn test_numbered_steps_inline() {
        let outcome = parse("Step 1: load, Step 2: validate, Step 3: store");
        assert_eq!(labels(&outcome.spec), vec!["load", "validate", "store"]);
        assert_eq!(
            edge_pairs(&outcome.spec),
            vec![("load", "validate"), ("validate", "store")]
        );
    }

    #[test]
    fn test_numbered_steps_listed_out_of_order() {
        let outcome = parse("Here is the flow:\n2. Process order\n1. Receive order\n3. Ship order\n");
        assert_eq!(
            edge_pairs(&outcome.spec),
            vec![
                ("receive order", "process order"),
                ("process order", "ship order")
            ]
        );
    }

    #[test]
    fn test_sequence_connectives_chain_bare_clauses() {
        let outcome = parse("First load the file, then parse it, finally write output.");
        assert_eq!(
            edge_pairs(&outcome.spec),
            vec![("load the file", "parse it"), ("parse it", "write output")]
        );
        assert_eq!(outcome.spec.nodes[2].kind, NodeKind::Io);
    }

    #[test]
    fn test_arrow_chain_with_labels() {
        let outcome = parse("```mermaid\nflowchart TD\nA[Start] --> B{Valid?}\nB -->|yes| C[Save]\nB -- no --> A\n```");
        assert_eq!(labels(&outcome.spec), vec!["Start", "Valid?", "Save"]);
        assert_eq!(
            edge_pairs(&outcome.spec),
            vec![("start", "valid?"), ("valid?", "save"), ("valid?", "start")]
        );
        assert_eq!(outcome.spec.nodes[1].kind, NodeKind::Decision);
        assert_eq!(outcome.spec.edges[1].label.as_deref(), Some("yes"));
        assert_eq!(outcome.spec.edges[1].style, EdgeStyle::Conditional);
        assert!(outcome.trace.steps().contains(&ParseStep::StrippedCodeFence));
    }

    #[test]
    fn test_plain_arrows() {
        let outcome = parse("Login -> Dashboard -> Logout");
        assert_eq!(
            edge_pairs(&outcome.spec),
            vec![("login", "dashboard"), ("dashboard", "logout")]
        );
    }

    #[test]
    fn test_relation_chain_in_one_clause() {
        let outcome = parse("Request leads to Auth leads to Response");
        assert_eq!(
            edge_pairs(&outcome.spec),
            vec![("request", "auth"), ("auth", "response")]
        );
    }

    #[test]
    fn test_feedback_and_conditional_synonyms() {
        let outcome = parse("Upload goes to Verify; Verify loops back to Upload; Verify goes to Done if checksum matches");
        let styles: Vec<EdgeStyle> = outcome.spec.edges.iter().map(|e| e.style).collect();
        assert_eq!(
            styles,
            vec![EdgeStyle::Normal, EdgeStyle::Feedback, EdgeStyle::Conditional]
        );
        assert_eq!(
            outcome.spec.edges[2].label.as_deref(),
            Some("if checksum matches")
        );
    }

    #[test]
    fn test_duplicate_edges_merge() {
        let outcome = parse("A leads to B. A goes to B.");
        assert_eq!(outcome.spec.edges.len(), 1);
        assert!(outcome.trace.steps().contains(&ParseStep::DuplicateEdgeMerged {
            source: "a".into(),
            target: "b".into()
        }));
    }

    #[test]
    fn test_unresolvable_fragment_is_dropped_not_fatal() {
        let outcome = parse("Start leads to End. leads to nowhere");
        assert_eq!(edge_pairs(&outcome.spec), vec![("start", "end")]);
        assert!(matches!(
            outcome.trace.dropped().collect::<Vec<_>>()[..],
            [ParseStep::FragmentDropped { fragment, .. }] if fragment == "leads to nowhere"
        ));

        let outcome = parse("Start leads to End. Review goes to");
        assert_eq!(outcome.spec.nodes.len(), 2);
        assert_eq!(outcome.trace.dropped().count(), 1);

        let outcome = parse(
            "Start leads to End. Ingest leads to a very long winded explanation of what happens at this point in the process",
        );
        assert_eq!(edge_pairs(&outcome.spec), vec![("start", "end")]);
        assert_eq!(outcome.trace.dropped().count(), 1);
    }

    #[test]
    fn test_prose_only_is_no_structure() {
        let err = DiagramParser::default()
            .parse("I'm sorry, I cannot help with that request.")
            .unwrap_err();
        assert_eq!(err, ParseError::NoStructureFound);
        assert_eq!(
            DiagramParser::default().parse("   ").unwrap_err(),
            ParseError::NoStructureFound
        );
    }

    #[test]
    fn test_alternative_endpoint_is_ambiguous() {
        let err = DiagramParser::default()
            .parse("Cache or Database leads to Response")
            .unwrap_err();
        assert_eq!(
            err,
            ParseError::AmbiguousEdge {
                endpoint: "Cache or Database".into()
            }
        );
    }

    #[test]
    fn test_question_with_or_is_a_decision_not_ambiguous() {
        let outcome = parse("Input goes to Approve or reject?");
        assert_eq!(outcome.spec.nodes[1].kind, NodeKind::Decision);
    }

    #[test]
    fn test_reasoning_block_is_ignored() {
        let outcome = parse("<think>maybe X leads to Y</think>\nBuild leads to Test");
        assert_eq!(edge_pairs(&outcome.spec), vec![("build", "test")]);
        assert!(outcome.trace.steps().contains(&ParseStep::StrippedReasoning));
    }

    #[test]
    fn test_parse_is_deterministic() {
        let text = "Start leads to Validate, Validate loops back to Start, Validate leads to End";
        let a = parse(text);
        let b = parse(text);
        assert_eq!(a.spec, b.spec);
        assert_eq!(a.trace, b.trace);
    }

    #[test]
    fn test_infer_kind() {
        assert_eq!(infer_kind("Start"), NodeKind::Start);
        assert_eq!(infer_kind("end"), NodeKind::End);
        assert_eq!(infer_kind("Is user logged in?"), NodeKind::Decision);
        assert_eq!(infer_kind("Read config"), NodeKind::Io);
        assert_eq!(infer_kind("Start the engine now"), NodeKind::Process);
        assert_eq!(infer_kind("Compute totals"), NodeKind::Process);
    }

    #[test]
    fn test_clean_endpoint() {
        assert_eq!(clean_endpoint("  the Database. "), Some("Database".into()));
        assert_eq!(clean_endpoint("a"), Some("a".into()));
        assert_eq!(clean_endpoint("an API call"), Some("API call".into()));
        assert_eq!(clean_endpoint("\"Quoted\""), Some("Quoted".into()));
        assert_eq!(clean_endpoint(" .. "), None);
    }
}
