//! Validation of parsed diagrams and the petgraph view used by layout and
//! animation.

use std::collections::{HashMap, HashSet};

use petgraph::algo::{connected_components, is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::diagram::{CueTarget, DiagramSpec, Edge};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    #[error("duplicate node id '{0}'")]
    DuplicateNodeId(String),
    #[error("edge {from} -> {target} references missing node '{missing}'")]
    DanglingEdge {
        from: String,
        target: String,
        missing: String,
    },
    #[error("diagram contains a cycle through '{0}' and cycles are disabled")]
    CycleDisallowed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuilderOptions {
    pub allow_cycles: bool,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self { allow_cycles: true }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    options: BuilderOptions,
}

impl GraphBuilder {
    pub fn new(options: BuilderOptions) -> Self {
        Self { options }
    }

    /// Returns a validated copy of `spec`. Duplicate edges are merged (first
    /// label wins); everything else that violates an invariant is an error.
    #[instrument(skip_all, fields(nodes = spec.nodes.len(), edges = spec.edges.len()))]
    pub fn build(&self, spec: &DiagramSpec) -> Result<DiagramSpec, GraphError> {
        let mut seen = HashSet::new();
        for node in &spec.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(GraphError::DuplicateNodeId(node.id.clone()));
            }
        }

        let mut edges: Vec<Edge> = Vec::with_capacity(spec.edges.len());
        for edge in &spec.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(GraphError::DanglingEdge {
                        from: edge.source.clone(),
                        target: edge.target.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
            if edges
                .iter()
                .any(|e| e.source == edge.source && e.target == edge.target)
            {
                debug!("Merging duplicate edge {} -> {}", edge.source, edge.target);
                continue;
            }
            edges.push(edge.clone());
        }

        let animations = spec
            .animations
            .iter()
            .filter(|cue| {
                let known = match &cue.target {
                    CueTarget::Node(id) => seen.contains(id.as_str()),
                    CueTarget::Edge { source, target } => edges
                        .iter()
                        .any(|e| &e.source == source && &e.target == target),
                };
                if !known {
                    debug!("Ignoring animation cue for unknown element {:?}", cue.target);
                }
                known
            })
            .cloned()
            .collect();

        let validated = DiagramSpec {
            title: spec.title.clone(),
            nodes: spec.nodes.clone(),
            edges,
            animations,
        };

        if !self.options.allow_cycles {
            if let Some(edge) = validated.edges.iter().find(|e| e.is_self_loop()) {
                return Err(GraphError::CycleDisallowed(edge.source.clone()));
            }
            let flow = FlowGraph::from_spec(&validated);
            if is_cyclic_directed(&flow.graph) {
                let culprit = toposort(&flow.graph, None)
                    .err()
                    .map(|cycle| flow.id(cycle.node_id()).to_string())
                    .unwrap_or_default();
                return Err(GraphError::CycleDisallowed(culprit));
            }
        }

        Ok(validated)
    }
}

/// Directed graph over a validated spec. Node weights are indices into
/// `spec.nodes`, edge weights indices into `spec.edges`.
#[derive(Debug)]
pub struct FlowGraph {
    pub graph: DiGraph<usize, usize>,
    ids: Vec<String>,
    index: HashMap<String, NodeIndex>,
}

impl FlowGraph {
    /// Edges with unknown endpoints are skipped; run the builder first.
    pub fn from_spec(spec: &DiagramSpec) -> Self {
        let mut graph = DiGraph::with_capacity(spec.nodes.len(), spec.edges.len());
        let mut index = HashMap::new();
        let mut ids = Vec::with_capacity(spec.nodes.len());
        for (i, node) in spec.nodes.iter().enumerate() {
            let idx = graph.add_node(i);
            index.insert(node.id.clone(), idx);
            ids.push(node.id.clone());
        }
        for (i, edge) in spec.edges.iter().enumerate() {
            if let (Some(&s), Some(&t)) = (index.get(&edge.source), index.get(&edge.target)) {
                graph.add_edge(s, t, i);
            }
        }
        Self { graph, ids, index }
    }

    pub fn id(&self, idx: NodeIndex) -> &str {
        &self.ids[self.graph[idx]]
    }

    pub fn index_of(&self, id: &str) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    /// Number of weakly connected components.
    pub fn component_count(&self) -> usize {
        connected_components(&self.graph)
    }
}

/// Node positions (indices into `spec.nodes`) in topological order, or in
/// insertion order when the graph has a cycle.
pub fn topological_order(spec: &DiagramSpec) -> Vec<usize> {
    let flow = FlowGraph::from_spec(spec);
    match toposort(&flow.graph, None) {
        Ok(order) => order.into_iter().map(|idx| flow.graph[idx]).collect(),
        Err(_) => (0..spec.nodes.len()).collect(),
    }
}
