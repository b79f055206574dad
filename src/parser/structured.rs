//! JSON answers: `{"title": .., "nodes": [..], "edges": [..], "animations": [..]}`.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{canonical_id, Accumulator, DiagramParser, ParseError, ParseOutcome, ParseStep, ParseTrace};
use crate::diagram::{AnimationCue, CueEffect, CueTarget, EdgeStyle, NodeKind};

#[derive(Deserialize, Debug)]
struct RawDiagram {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    edges: Vec<RawEdge>,
    #[serde(default)]
    animations: Vec<RawCue>,
}

#[derive(Deserialize, Debug)]
struct RawNode {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, alias = "text", alias = "name")]
    label: Option<String>,
    #[serde(default, rename = "type", alias = "kind")]
    kind: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawEdge {
    #[serde(default, alias = "source")]
    from: Option<Value>,
    #[serde(default, alias = "target")]
    to: Option<Value>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default, rename = "type", alias = "style")]
    kind: Option<String>,
}

/// `element` is a node id or label, or `edge_<from>_<to>`. Edges may also be
/// given with explicit `from`/`to`.
#[derive(Deserialize, Debug)]
struct RawCue {
    #[serde(default, alias = "node", alias = "id")]
    element: Option<Value>,
    #[serde(default, alias = "source")]
    from: Option<Value>,
    #[serde(default, alias = "target")]
    to: Option<Value>,
    #[serde(default, alias = "type", alias = "animation")]
    effect: Option<String>,
    #[serde(default, alias = "step")]
    order: Option<Value>,
}

/// Ids may be numbers in model output.
fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Finds the outermost `{ .. }` span and tries to read it as a diagram.
fn extract(text: &str) -> Option<RawDiagram> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<RawDiagram>(&text[start..=end]) {
        Ok(raw) if !raw.nodes.is_empty() => Some(raw),
        Ok(_) => None,
        Err(e) => {
            debug!("Braced span is not a diagram document: {}", e);
            None
        }
    }
}

/// Returns `Ok(None)` when the text has no usable JSON so the caller can fall
/// back to the text rules.
pub(super) fn parse(
    text: &str,
    parser: &DiagramParser,
    mut trace: ParseTrace,
) -> Result<Option<ParseOutcome>, ParseError> {
    let Some(raw) = extract(text) else {
        return Ok(None);
    };
    trace.push(ParseStep::StructuredJson {
        nodes: raw.nodes.len(),
        edges: raw.edges.len(),
    });

    let mut acc = Accumulator::new(parser.options().clone(), trace);
    // (declared id, canonical id, canonical label)
    let mut declared: Vec<(Option<String>, String, String)> = Vec::new();

    for (position, node) in raw.nodes.iter().enumerate() {
        let id = node.id.as_ref().and_then(value_text);
        let label = node
            .label
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string);
        let (id_key, label) = match (id.as_ref(), label) {
            (Some(id), Some(label)) => (canonical_id(id), label),
            (Some(id), None) => (canonical_id(id), id.clone()),
            (None, Some(label)) => (canonical_id(&label), label),
            (None, None) => {
                return Err(ParseError::MalformedNodeRef {
                    reference: format!("nodes[{}]", position),
                    reason: "node has neither an id nor a label".to_string(),
                })
            }
        };
        let kind = node.kind.as_deref().and_then(NodeKind::from_type_name);
        let canonical = acc.add_node(id_key, label.clone(), kind);
        declared.push((id, canonical, canonical_id(&label)));
    }

    for edge in &raw.edges {
        let source = edge.from.as_ref().and_then(value_text);
        let target = edge.to.as_ref().and_then(value_text);
        let (Some(source), Some(target)) = (source, target) else {
            acc.drop_fragment(&format!("{:?} -> {:?}", edge.from, edge.to), "edge missing an endpoint");
            continue;
        };
        let source = resolve(&declared, &source)?;
        let target = resolve(&declared, &target)?;
        let style = edge
            .kind
            .as_deref()
            .and_then(EdgeStyle::from_type_name)
            .unwrap_or_default();
        acc.connect(&source, &target, edge.label.clone(), style);
    }

    let mut cues = Vec::new();
    for (position, cue) in raw.animations.iter().enumerate() {
        let Some(effect) = cue.effect.as_deref().and_then(CueEffect::from_type_name) else {
            acc.drop_fragment(
                &format!("animations[{}]", position),
                "unknown animation effect",
            );
            continue;
        };
        let Some(target) = cue_target(&declared, &acc, cue) else {
            acc.drop_fragment(
                &format!("animations[{}]", position),
                "animation names no known element",
            );
            continue;
        };
        let order = cue
            .order
            .as_ref()
            .and_then(|v| v.as_f64())
            .filter(|o| o.is_finite() && *o >= 0.0)
            .map(|o| o.round() as u32)
            .unwrap_or(position as u32 + 1);
        cues.push(AnimationCue {
            target,
            effect,
            order,
        });
    }
    if !cues.is_empty() {
        acc.trace.push(ParseStep::AnimationCues { count: cues.len() });
        acc.animations = cues;
    }

    let title = raw
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    Ok(Some(acc.finish(title)))
}

/// Edge cues are resolved against the edges actually kept; a reversed pair
/// names the existing edge.
fn cue_target(
    declared: &[(Option<String>, String, String)],
    acc: &Accumulator,
    cue: &RawCue,
) -> Option<CueTarget> {
    let edge = |from: &str, to: &str| -> Option<CueTarget> {
        let from = resolve(declared, from).ok()?;
        let to = resolve(declared, to).ok()?;
        acc.edges.iter().find_map(|e| {
            let forward = e.source == from && e.target == to;
            let reverse = e.source == to && e.target == from;
            (forward || reverse).then(|| CueTarget::Edge {
                source: e.source.clone(),
                target: e.target.clone(),
            })
        })
    };

    if let (Some(from), Some(to)) = (
        cue.from.as_ref().and_then(value_text),
        cue.to.as_ref().and_then(value_text),
    ) {
        return edge(&from, &to);
    }

    let element = cue.element.as_ref().and_then(value_text)?;
    if let Ok(node) = resolve(declared, &element) {
        return Some(CueTarget::Node(node));
    }
    // Ids may themselves contain underscores, so try every split.
    let rest = element.strip_prefix("edge_")?;
    rest.match_indices('_')
        .find_map(|(at, _)| edge(&rest[..at], &rest[at + 1..]))
}

/// Matches an edge endpoint against declared ids first, then labels.
fn resolve(
    declared: &[(Option<String>, String, String)],
    reference: &str,
) -> Result<String, ParseError> {
    let key = canonical_id(reference);
    let by_id = declared
        .iter()
        .find(|(id, _, _)| id.as_deref().map(canonical_id).as_deref() == Some(key.as_str()))
        .map(|(_, canonical, _)| canonical.clone());
    let by_label = declared
        .iter()
        .find(|(_, _, label)| *label == key)
        .map(|(_, canonical, _)| canonical.clone());

    match (by_id, by_label) {
        (Some(a), Some(b)) if a != b => Err(ParseError::AmbiguousEdge {
            endpoint: reference.to_string(),
        }),
        (Some(found), _) | (None, Some(found)) => Ok(found),
        (None, None) => Err(ParseError::MalformedNodeRef {
            reference: reference.to_string(),
            reason: "edge references an undeclared node".to_string(),
        }),
    }
}
