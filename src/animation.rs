//! Frame synthesis: a deterministic sequence of partial renders going from an
//! empty canvas to the fully drawn diagram.

use serde::{Deserialize, Serialize};

use crate::diagram::{AnimationCue, CueEffect, CueTarget, DiagramSpec};
use crate::graph::topological_order;
use crate::layout::LayoutGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AnimationEffect {
    /// Everything fades in together.
    FadeIn,
    /// Nodes fade in during the first half, then edges are drawn.
    GrowEdges,
    /// Elements appear one after another in flow order.
    SequentialReveal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnimationConfig {
    pub enabled: bool,
    /// Greater than zero. Higher is faster, i.e. fewer frames.
    pub speed: f64,
    pub effect: AnimationEffect,
    /// Never fewer than two frames are produced, whatever this says.
    pub max_frames: usize,
    /// Frames spent per node or edge at speed 1.0.
    pub frames_per_element: f64,
    /// Playback rate of exported animations.
    pub fps: u32,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            speed: 1.0,
            effect: AnimationEffect::SequentialReveal,
            max_frames: 120,
            frames_per_element: 4.0,
            fps: 12,
        }
    }
}

impl AnimationConfig {
    pub fn frame_delay_ms(&self) -> u32 {
        1000 / self.fps.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub id: String,
    pub opacity: f32,
    pub scale: f32,
    pub highlighted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeState {
    pub source: String,
    pub target: String,
    pub opacity: f32,
    /// Drawn fraction of the edge path.
    pub reveal: f32,
    pub highlighted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationFrame {
    pub index: usize,
    pub progress: f32,
    pub nodes: Vec<NodeState>,
    pub edges: Vec<EdgeState>,
}

impl AnimationFrame {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&NodeState> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn edge(&self, source: &str, target: &str) -> Option<&EdgeState> {
        self.edges
            .iter()
            .find(|e| e.source == source && e.target == target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Element {
    Node(usize),
    Edge(usize),
}

/// An element placed in the reveal sequence. `emphasis` is the step from
/// which it is highlighted, and how.
#[derive(Debug, Clone, Copy)]
struct Slot {
    element: Element,
    step: usize,
    emphasis: Option<(usize, CueEffect)>,
}

/// `clamp(ceil(elements * frames_per_element / speed) + 1, 2, max_frames)`,
/// or 2 when animation is off.
pub fn frame_count(elements: usize, config: &AnimationConfig) -> usize {
    let max = config.max_frames.max(2);
    if !config.enabled || !(config.speed.is_finite() && config.speed > 0.0) {
        return 2;
    }
    let raw = (elements as f64 * config.frames_per_element / config.speed).ceil();
    if !raw.is_finite() || raw >= max as f64 {
        return max;
    }
    (raw as usize + 1).clamp(2, max)
}

/// Nodes in flow order, each followed by the edges it completes.
fn flow_order(spec: &DiagramSpec) -> Vec<Element> {
    let mut shown = vec![false; spec.nodes.len()];
    let mut drawn = vec![false; spec.edges.len()];

    let mut order = Vec::with_capacity(spec.nodes.len() + spec.edges.len());
    for node in topological_order(spec) {
        shown[node] = true;
        order.push(Element::Node(node));
        for (e, edge) in spec.edges.iter().enumerate() {
            if drawn[e] {
                continue;
            }
            let ready = match (spec.node_index(&edge.source), spec.node_index(&edge.target)) {
                (Some(s), Some(t)) => shown[s] && shown[t],
                _ => false,
            };
            if ready {
                drawn[e] = true;
                order.push(Element::Edge(e));
            }
        }
    }
    order
}

fn cue_element(spec: &DiagramSpec, target: &CueTarget) -> Option<Element> {
    match target {
        CueTarget::Node(id) => spec.node_index(id).map(Element::Node),
        CueTarget::Edge { source, target } => spec
            .edges
            .iter()
            .position(|e| &e.source == source && &e.target == target)
            .map(Element::Edge),
    }
}

/// Returns the slots and the number of steps. Without cues every element is
/// its own step in flow order. Cues sharing an order form one step; elements
/// no cue mentions follow in flow order.
fn reveal_plan(spec: &DiagramSpec) -> (Vec<Slot>, usize) {
    let mut slots: Vec<Slot> = Vec::new();
    let mut steps = 0;

    let mut cues: Vec<&AnimationCue> = spec.animations.iter().collect();
    cues.sort_by_key(|cue| cue.order);
    let mut current_order = None;
    for cue in cues {
        let Some(element) = cue_element(spec, &cue.target) else {
            continue;
        };
        // A group that only re-emphasizes revealed elements still takes a step.
        if current_order != Some(cue.order) {
            current_order = Some(cue.order);
            steps += 1;
        }
        let step = steps - 1;
        let emphasis = cue.effect.emphasizes().then_some((step, cue.effect));
        match slots.iter_mut().find(|slot| slot.element == element) {
            Some(slot) => {
                if slot.emphasis.is_none() {
                    slot.emphasis = emphasis;
                }
            }
            None => slots.push(Slot {
                element,
                step,
                emphasis,
            }),
        }
    }
    for element in flow_order(spec) {
        if slots.iter().any(|slot| slot.element == element) {
            continue;
        }
        slots.push(Slot {
            element,
            step: steps,
            emphasis: None,
        });
        steps += 1;
    }
    (slots, steps)
}

/// Builds the frame sequence. Pure: equal inputs give equal outputs.
///
/// Emphasis from `highlight` and `pulse` cues lasts until the final frame,
/// which always shows the plain, fully drawn diagram.
pub fn synthesize(layout: &LayoutGraph, config: &AnimationConfig) -> Vec<AnimationFrame> {
    let (plan, steps) = reveal_plan(&layout.spec);
    let count = frame_count(steps, config);
    let total = steps.max(1) as f32;

    (0..count)
        .map(|index| {
            let progress = index as f32 / (count - 1) as f32;
            let last = index == count - 1;
            let clock = progress * total;
            let mut frame = AnimationFrame {
                index,
                progress,
                nodes: Vec::new(),
                edges: Vec::new(),
            };
            for slot in &plan {
                let t = match config.effect {
                    AnimationEffect::FadeIn => progress,
                    AnimationEffect::GrowEdges => match slot.element {
                        Element::Node(_) => (progress * 2.0).min(1.0),
                        Element::Edge(_) => (progress * 2.0 - 1.0).clamp(0.0, 1.0),
                    },
                    AnimationEffect::SequentialReveal => {
                        (clock - slot.step as f32).clamp(0.0, 1.0)
                    }
                };
                if t <= 0.0 {
                    continue;
                }
                let emphasis = slot
                    .emphasis
                    .filter(|(step, _)| !last && clock >= *step as f32)
                    .map(|(_, effect)| effect);
                match slot.element {
                    Element::Node(i) => {
                        let reveal_scale = match config.effect {
                            AnimationEffect::SequentialReveal => 1.0 - 0.4 * (1.0 - t),
                            _ => 1.0,
                        };
                        let pulse = match emphasis {
                            Some(CueEffect::Pulse) => {
                                1.0 + 0.12 * (clock * std::f32::consts::PI).sin().abs()
                            }
                            _ => 1.0,
                        };
                        frame.nodes.push(NodeState {
                            id: layout.spec.nodes[i].id.clone(),
                            opacity: t,
                            scale: reveal_scale * pulse,
                            highlighted: emphasis.is_some(),
                        });
                    }
                    Element::Edge(e) => {
                        let edge = &layout.spec.edges[e];
                        let (opacity, reveal) = match config.effect {
                            AnimationEffect::FadeIn => (t, 1.0),
                            _ => (1.0, t),
                        };
                        frame.edges.push(EdgeState {
                            source: edge.source.clone(),
                            target: edge.target.clone(),
                            opacity,
                            reveal,
                            highlighted: emphasis.is_some(),
                        });
                    }
                }
            }
            frame
        })
        .collect()
}
