//! Node placement.
//!
//! `rust-sugiyama` decides *layers* and the order of nodes within a layer; if
//! it fails, a plain longest-path layering stands in. Geometry (sizes,
//! coordinates, edge routes) is computed by [`place`] either way: top-to-bottom
//! flow, forward edges as orthogonal elbows, back edges routed through lanes on
//! the right-hand side.

use std::collections::{BTreeMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use petgraph::visit::{depth_first_search, DfsEvent};
use rust_sugiyama::configure::Config;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::diagram::{DiagramSpec, Node, NodeKind};
use crate::graph::FlowGraph;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LayoutError {
    #[error("diagram has {components} disconnected parts and the layout requires one")]
    DisconnectedGraphUnsupported { components: usize },
    #[error("layout algorithm failed: {0}")]
    AlgorithmFailure(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn lerp(self, other: Point, t: f32) -> Point {
        Point::new(
            self.x + (other.x - self.x) * t,
            self.y + (other.y - self.y) * t,
        )
    }

    pub fn distance(self, other: Point) -> f32 {
        ((other.x - self.x).powi(2) + (other.y - self.y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionedNode {
    pub id: String,
    pub center: Point,
    pub size: Size,
    pub layer: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgePath {
    pub source: String,
    pub target: String,
    pub points: Vec<Point>,
}

impl EdgePath {
    pub fn length(&self) -> f32 {
        self.points.windows(2).map(|w| w[0].distance(w[1])).sum()
    }

    /// The first `fraction` of the path, by length.
    pub fn prefix(&self, fraction: f32) -> Vec<Point> {
        let fraction = fraction.clamp(0.0, 1.0);
        let Some(&first) = self.points.first() else {
            return Vec::new();
        };
        let mut remaining = self.length() * fraction;
        let mut out = vec![first];
        for pair in self.points.windows(2) {
            let segment = pair[0].distance(pair[1]);
            if remaining >= segment {
                out.push(pair[1]);
                remaining -= segment;
            } else {
                if segment > 0.0 && remaining > 0.0 {
                    out.push(pair[0].lerp(pair[1], remaining / segment));
                }
                break;
            }
        }
        out
    }
}

/// A diagram together with its computed geometry. Node and edge vectors are
/// parallel to `spec.nodes` and `spec.edges`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutGraph {
    pub spec: DiagramSpec,
    pub nodes: Vec<PositionedNode>,
    pub edges: Vec<EdgePath>,
    pub width: f32,
    pub height: f32,
}

impl LayoutGraph {
    pub fn node(&self, id: &str) -> Option<&PositionedNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Nodes plus edges.
    pub fn element_count(&self) -> usize {
        self.nodes.len() + self.edges.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutOptions {
    /// Lay out every weakly connected part side by side instead of failing.
    pub allow_disconnected: bool,
    pub node_width: f32,
    pub node_height: f32,
    pub char_width: f32,
    pub layer_gap: f32,
    pub node_gap: f32,
    pub lane_gap: f32,
    pub margin: f32,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            allow_disconnected: true,
            node_width: 140.0,
            node_height: 56.0,
            char_width: 8.0,
            layer_gap: 72.0,
            node_gap: 40.0,
            lane_gap: 16.0,
            margin: 32.0,
        }
    }
}

pub trait LayoutProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn layout(&self, spec: &DiagramSpec, options: &LayoutOptions) -> Result<LayoutGraph, LayoutError>;
}

fn check_shape(flow: &FlowGraph, options: &LayoutOptions) -> Result<(), LayoutError> {
    if flow.graph.node_count() == 0 {
        return Err(LayoutError::AlgorithmFailure("diagram has no nodes".to_string()));
    }
    let components = flow.component_count();
    if components > 1 && !options.allow_disconnected {
        return Err(LayoutError::DisconnectedGraphUnsupported { components });
    }
    Ok(())
}

/// Longest-path layering over the graph with DFS back edges left out,
/// followed by a few barycenter sweeps to reduce crossings. Used when
/// `rust-sugiyama` cannot lay a diagram out.
fn fallback_layers(flow: &FlowGraph) -> Result<Vec<Vec<usize>>, LayoutError> {
    let mut back_edges = HashSet::new();
    depth_first_search(&flow.graph, flow.graph.node_indices(), |event| {
        if let DfsEvent::BackEdge(u, v) = event {
            back_edges.insert((u, v));
        }
    });

    let mut dag: DiGraph<(), ()> = DiGraph::with_capacity(flow.graph.node_count(), 0);
    for _ in flow.graph.node_indices() {
        dag.add_node(());
    }
    let node_count = flow.graph.node_count();
    let mut preds: Vec<Vec<usize>> = vec![Vec::new(); node_count];
    for edge in flow.graph.raw_edges() {
        let (s, t) = (edge.source(), edge.target());
        if s == t || back_edges.contains(&(s, t)) {
            continue;
        }
        dag.add_edge(s, t, ());
        preds[t.index()].push(s.index());
    }

    let order = toposort(&dag, None).map_err(|cycle| {
        LayoutError::AlgorithmFailure(format!(
            "cycle through '{}' survived back-edge removal",
            flow.id(cycle.node_id())
        ))
    })?;

    let mut rank = vec![0usize; node_count];
    for idx in order {
        let i = idx.index();
        rank[i] = preds[i].iter().map(|&p| rank[p] + 1).max().unwrap_or(0);
    }

    let depth = rank.iter().copied().max().unwrap_or(0) + 1;
    let mut layers: Vec<Vec<usize>> = vec![Vec::new(); depth];
    for (i, &r) in rank.iter().enumerate() {
        layers[r].push(i);
    }

    for _ in 0..2 {
        barycenter_sweep(&mut layers, &preds);
    }
    debug!(layers = layers.len(), back_edges = back_edges.len(), "Computed fallback layering");
    Ok(layers)
}

fn barycenter_sweep(layers: &mut [Vec<usize>], preds: &[Vec<usize>]) {
    for l in 1..layers.len() {
        let (upper, lower) = layers.split_at_mut(l);
        let above = &upper[l - 1];
        let current = &mut lower[0];
        let position_above = |node: usize| above.iter().position(|&n| n == node);
        let keys: BTreeMap<usize, f32> = current
            .iter()
            .enumerate()
            .map(|(slot, &node)| {
                let positions: Vec<f32> = preds[node]
                    .iter()
                    .filter_map(|&p| position_above(p))
                    .map(|p| p as f32)
                    .collect();
                let key = if positions.is_empty() {
                    slot as f32
                } else {
                    positions.iter().sum::<f32>() / positions.len() as f32
                };
                (node, key)
            })
            .collect();
        current.sort_by(|a, b| keys[a].total_cmp(&keys[b]));
    }
}

/// Layering and ordering from the `rust-sugiyama` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SugiyamaLayout;

impl LayoutProvider for SugiyamaLayout {
    fn name(&self) -> &'static str {
        "sugiyama"
    }

    #[instrument(skip_all, fields(nodes = spec.nodes.len()))]
    fn layout(&self, spec: &DiagramSpec, options: &LayoutOptions) -> Result<LayoutGraph, LayoutError> {
        let flow = FlowGraph::from_spec(spec);
        check_shape(&flow, options)?;

        let layers = match sugiyama_layers(&flow) {
            Ok(layers) => layers,
            Err(err) => {
                warn!("{}; falling back to longest-path layering", err);
                fallback_layers(&flow)?
            }
        };
        Ok(place(spec, &layers, options))
    }
}

fn sugiyama_layers(flow: &FlowGraph) -> Result<Vec<Vec<usize>>, LayoutError> {
    let node_count = flow.graph.node_count();
    let mut edges: Vec<(u32, u32)> = Vec::new();
    let mut connected = vec![false; node_count];
    for edge in flow.graph.raw_edges() {
        let (s, t) = (edge.source().index(), edge.target().index());
        // rust-sugiyama does not handle self-loops
        if s != t {
            edges.push((s as u32, t as u32));
            connected[s] = true;
            connected[t] = true;
        }
    }

    let mut layers: Vec<Vec<usize>> = Vec::new();
    if !edges.is_empty() {
        let edge_list = edges.clone();
        let results = std::panic::catch_unwind(move || {
            let config = Config {
                minimum_length: 1,
                vertex_spacing: 3.0,
                ..Default::default()
            };
            rust_sugiyama::from_edges(&edge_list, &config)
        })
        .map_err(|err| {
            let message = err
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| err.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "unknown panic".to_string());
            LayoutError::AlgorithmFailure(format!("rust-sugiyama panicked: {}", message))
        })?;
        if results.is_empty() {
            return Err(LayoutError::AlgorithmFailure(
                "rust-sugiyama returned no layouts".to_string(),
            ));
        }

        let mut placed = vec![false; node_count];
        for (coords, _, _) in &results {
            let mut points: Vec<(usize, f32, f32)> = Vec::new();
            for &(id, (x, y)) in coords {
                if id < node_count {
                    points.push((id, x as f32, y as f32));
                    placed[id] = true;
                } else {
                    warn!("Ignoring out-of-range node id {} from rust-sugiyama", id);
                }
            }
            merge_component(&mut layers, component_layers(points, &edges));
        }
        if let Some(missing) = (0..node_count).find(|&i| connected[i] && !placed[i]) {
            return Err(LayoutError::AlgorithmFailure(format!(
                "rust-sugiyama returned no position for '{}'",
                flow.id(petgraph::graph::NodeIndex::new(missing))
            )));
        }
    }

    let isolated: Vec<usize> = (0..node_count).filter(|&i| !connected[i]).collect();
    if !isolated.is_empty() {
        if layers.is_empty() {
            layers.push(Vec::new());
        }
        layers[0].extend(isolated);
    }
    Ok(layers)
}

/// Groups one component's coordinates into layers, top to bottom.
fn component_layers(mut points: Vec<(usize, f32, f32)>, edges: &[(u32, u32)]) -> Vec<Vec<usize>> {
    // Make edges point downwards whichever y direction the engine uses.
    let y_of = |id: usize| points.iter().find(|p| p.0 == id).map(|p| p.2);
    let downward = edges
        .iter()
        .filter_map(|&(s, t)| Some(y_of(t as usize)? - y_of(s as usize)?))
        .map(|dy| dy.signum() as i32)
        .sum::<i32>();
    if downward < 0 {
        for point in &mut points {
            point.2 = -point.2;
        }
    }

    points.sort_by(|a, b| a.2.total_cmp(&b.2).then(a.1.total_cmp(&b.1)).then(a.0.cmp(&b.0)));
    let mut layers: Vec<Vec<usize>> = Vec::new();
    let mut last_y: Option<f32> = None;
    for (id, _, y) in points {
        match last_y {
            Some(prev) if (y - prev).abs() < 1e-3 => {
                if let Some(layer) = layers.last_mut() {
                    layer.push(id);
                }
            }
            _ => layers.push(vec![id]),
        }
        last_y = Some(y);
    }
    layers
}

fn merge_component(layers: &mut Vec<Vec<usize>>, component: Vec<Vec<usize>>) {
    for (i, layer) in component.into_iter().enumerate() {
        if i == layers.len() {
            layers.push(Vec::new());
        }
        layers[i].extend(layer);
    }
}

fn node_size(node: &Node, options: &LayoutOptions) -> Size {
    let text = node.label.chars().count() as f32 * options.char_width + 24.0;
    let mut size = Size {
        width: options.node_width.max(text),
        height: options.node_height,
    };
    if node.kind == NodeKind::Decision {
        // Diamonds need more room for the same label.
        size.width *= 1.3;
        size.height *= 1.3;
    }
    size
}

/// Turns layers of node positions into coordinates and edge routes.
fn place(spec: &DiagramSpec, layers: &[Vec<usize>], options: &LayoutOptions) -> LayoutGraph {
    let sizes: Vec<Size> = spec.nodes.iter().map(|n| node_size(n, options)).collect();

    let layer_widths: Vec<f32> = layers
        .iter()
        .map(|layer| {
            let widths: f32 = layer.iter().map(|&i| sizes[i].width).sum();
            widths + options.node_gap * layer.len().saturating_sub(1) as f32
        })
        .collect();
    let content_width = layer_widths.iter().copied().fold(0.0f32, f32::max);

    let mut centers = vec![Point::default(); spec.nodes.len()];
    let mut layer_of = vec![0usize; spec.nodes.len()];
    let mut y = options.margin;
    for (l, layer) in layers.iter().enumerate() {
        let height = layer.iter().map(|&i| sizes[i].height).fold(0.0f32, f32::max);
        let mut x = options.margin + (content_width - layer_widths[l]) / 2.0;
        for &i in layer {
            centers[i] = Point::new(x + sizes[i].width / 2.0, y + height / 2.0);
            layer_of[i] = l;
            x += sizes[i].width + options.node_gap;
        }
        y += height + options.layer_gap;
    }
    let content_bottom = y - options.layer_gap;

    let index_of = |id: &str| spec.nodes.iter().position(|n| n.id == id);
    let right_edge = options.margin + content_width;
    let mut lanes = 0usize;
    let mut edges = Vec::with_capacity(spec.edges.len());
    for edge in &spec.edges {
        let (Some(s), Some(t)) = (index_of(&edge.source), index_of(&edge.target)) else {
            continue;
        };
        let (sc, tc) = (centers[s], centers[t]);
        let points = if layer_of[t] > layer_of[s] {
            let start = Point::new(sc.x, sc.y + sizes[s].height / 2.0);
            let end = Point::new(tc.x, tc.y - sizes[t].height / 2.0);
            let mid_y = start.y + options.layer_gap / 2.0;
            vec![start, Point::new(start.x, mid_y), Point::new(end.x, mid_y), end]
        } else {
            lanes += 1;
            let lane_x = right_edge + options.lane_gap * lanes as f32;
            let start = Point::new(sc.x + sizes[s].width / 2.0, sc.y);
            let end = Point::new(tc.x + sizes[t].width / 2.0, tc.y);
            vec![start, Point::new(lane_x, start.y), Point::new(lane_x, end.y), end]
        };
        edges.push(EdgePath {
            source: edge.source.clone(),
            target: edge.target.clone(),
            points,
        });
    }

    let nodes = spec
        .nodes
        .iter()
        .enumerate()
        .map(|(i, node)| PositionedNode {
            id: node.id.clone(),
            center: centers[i],
            size: sizes[i],
            layer: layer_of[i],
        })
        .collect();

    LayoutGraph {
        spec: spec.clone(),
        nodes,
        edges,
        width: right_edge + options.lane_gap * lanes as f32 + options.margin,
        height: content_bottom + options.margin,
    }
}
