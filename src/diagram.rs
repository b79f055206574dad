use serde::{Deserialize, Serialize};

/// Shape family of a node. Mirrors the node types the model is asked to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    #[default]
    Process,
    Decision,
    Io,
}

impl NodeKind {
    /// Maps the `type` strings used in structured model output.
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "start" | "begin" => Some(Self::Start),
            "end" | "stop" | "finish" => Some(Self::End),
            "process" | "task" | "action" | "step" => Some(Self::Process),
            "decision" | "condition" | "choice" => Some(Self::Decision),
            "io" | "input" | "output" | "data" => Some(Self::Io),
            _ => None,
        }
    }

    pub fn fill_color(self) -> &'static str {
        match self {
            Self::Process => "#4285F4",
            Self::Decision => "#FBBC05",
            Self::Start => "#34A853",
            Self::End => "#EA4335",
            Self::Io => "#9C27B0",
        }
    }

    pub fn text_color(self) -> &'static str {
        match self {
            Self::Decision => "black",
            _ => "white",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EdgeStyle {
    #[default]
    Normal,
    Conditional,
    Feedback,
}

impl EdgeStyle {
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "normal" | "default" | "solid" => Some(Self::Normal),
            "conditional" | "condition" | "dashed" => Some(Self::Conditional),
            "feedback" | "loop" | "dotted" => Some(Self::Feedback),
            _ => None,
        }
    }

    pub fn stroke_color(self) -> &'static str {
        match self {
            Self::Normal => "#333333",
            Self::Conditional => "#FF9800",
            Self::Feedback => "#9C27B0",
        }
    }

    /// `stroke-dasharray` value, if the style is not solid.
    pub fn dash_array(self) -> Option<&'static str> {
        match self {
            Self::Normal => None,
            Self::Conditional => Some("6 4"),
            Self::Feedback => Some("2 3"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub label: String,
    pub kind: NodeKind,
}

impl Node {
    pub fn new(id: impl Into<String>, label: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub label: Option<String>,
    pub style: EdgeStyle,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: None,
            style: EdgeStyle::Normal,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_style(mut self, style: EdgeStyle) -> Self {
        self.style = style;
        self
    }

    pub fn is_self_loop(&self) -> bool {
        self.source == self.target
    }
}

/// What a model-supplied animation step does to its element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CueEffect {
    FadeIn,
    Draw,
    Highlight,
    Pulse,
}

impl CueEffect {
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace(['_', '-', ' '], "").as_str() {
            "fadein" | "appear" | "show" => Some(Self::FadeIn),
            "draw" | "grow" => Some(Self::Draw),
            "highlight" | "emphasize" | "emphasise" => Some(Self::Highlight),
            "pulse" => Some(Self::Pulse),
            _ => None,
        }
    }

    /// Pulse only makes sense on nodes; edges treat it as a highlight.
    pub fn emphasizes(self) -> bool {
        matches!(self, Self::Highlight | Self::Pulse)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CueTarget {
    Node(String),
    Edge { source: String, target: String },
}

/// One step of a model-supplied reveal sequence. Cues sharing an `order` play
/// together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimationCue {
    pub target: CueTarget,
    pub effect: CueEffect,
    pub order: u32,
}

impl AnimationCue {
    pub fn node(id: impl Into<String>, effect: CueEffect, order: u32) -> Self {
        Self {
            target: CueTarget::Node(id.into()),
            effect,
            order,
        }
    }

    pub fn edge(
        source: impl Into<String>,
        target: impl Into<String>,
        effect: CueEffect,
        order: u32,
    ) -> Self {
        Self {
            target: CueTarget::Edge {
                source: source.into(),
                target: target.into(),
            },
            effect,
            order,
        }
    }
}

/// Structured form of a flow diagram: ordered nodes and edges.
///
/// Node ids are unique and every edge endpoint names a node once a diagram has
/// been through [`crate::graph::GraphBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DiagramSpec {
    pub title: Option<String>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    /// Empty unless the model asked for a specific reveal sequence.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub animations: Vec<AnimationCue>,
}

impl DiagramSpec {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn node_index(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.id == id)
    }

    pub fn has_edge(&self, source: &str, target: &str) -> bool {
        self.edges
            .iter()
            .any(|edge| edge.source == source && edge.target == target)
    }

    pub fn title_or_default(&self) -> &str {
        self.title.as_deref().unwrap_or("Flow Diagram")
    }
}
