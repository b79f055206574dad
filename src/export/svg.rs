use std::collections::HashMap;

use svg::node::element::{self as svg_element, Definitions, Marker, Path, Polygon, Rectangle};
use svg::Document;

use super::{ArtifactFormat, ExportError, ExportProvider};
use crate::animation::AnimationFrame;
use crate::diagram::{EdgeStyle, NodeKind};
use crate::layout::{LayoutGraph, Point, PositionedNode};

const FONT_FAMILY: &str = "Arial, Helvetica, sans-serif";
const FONT_SIZE: f32 = 14.0;
const STROKE: &str = "#333333";
const HIGHLIGHT: &str = "#FF5722";

/// Vector output of the final frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct SvgExporter;

impl ExportProvider for SvgExporter {
    fn supports(&self, format: ArtifactFormat) -> bool {
        format == ArtifactFormat::Svg
    }

    fn encode(
        &self,
        layout: &LayoutGraph,
        frames: &[AnimationFrame],
        format: ArtifactFormat,
    ) -> Result<Vec<u8>, ExportError> {
        if !self.supports(format) {
            return Err(ExportError::UnsupportedFormat(format));
        }
        Ok(render_svg(layout, frames.last()).into_bytes())
    }
}

/// Per-element state of one frame: opacity, then scale or reveal, then
/// whether it is highlighted.
struct Visibility {
    nodes: HashMap<String, (f32, f32, bool)>,
    edges: HashMap<(String, String), (f32, f32, bool)>,
}

impl Visibility {
    fn of(frame: &AnimationFrame) -> Self {
        Self {
            nodes: frame
                .nodes
                .iter()
                .map(|n| (n.id.clone(), (n.opacity, n.scale, n.highlighted)))
                .collect(),
            edges: frame
                .edges
                .iter()
                .map(|e| {
                    (
                        (e.source.clone(), e.target.clone()),
                        (e.opacity, e.reveal, e.highlighted),
                    )
                })
                .collect(),
        }
    }
}

fn arrow_id(style: EdgeStyle) -> String {
    format!("arrow-{:?}", style).to_lowercase()
}

fn markers() -> Definitions {
    let mut defs = Definitions::new();
    for style in [EdgeStyle::Normal, EdgeStyle::Conditional, EdgeStyle::Feedback] {
        let marker = Marker::new()
            .set("id", arrow_id(style))
            .set("viewBox", "0 0 10 10")
            .set("refX", 9)
            .set("refY", 5)
            .set("markerWidth", 6)
            .set("markerHeight", 6)
            .set("orient", "auto")
            .add(
                Path::new()
                    .set("d", "M 0 0 L 10 5 L 0 10 z")
                    .set("fill", style.stroke_color()),
            );
        defs = defs.add(marker);
    }
    defs
}

fn path_data(points: &[Point]) -> String {
    points
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{} {} {}", if i == 0 { "M" } else { "L" }, p.x, p.y))
        .collect::<Vec<_>>()
        .join(" ")
}

fn node_shape(node: &PositionedNode, kind: NodeKind, highlighted: bool) -> svg_element::Group {
    let (stroke, stroke_width) = if highlighted { (HIGHLIGHT, 4) } else { (STROKE, 2) };
    let (cx, cy) = (node.center.x, node.center.y);
    let (w, h) = (node.size.width, node.size.height);
    let (left, top) = (cx - w / 2.0, cy - h / 2.0);
    let group = svg_element::Group::new();
    match kind {
        NodeKind::Decision => group.add(
            Polygon::new()
                .set(
                    "points",
                    format!(
                        "{},{} {},{} {},{} {},{}",
                        cx,
                        top,
                        left + w,
                        cy,
                        cx,
                        top + h,
                        left,
                        cy
                    ),
                )
                .set("fill", kind.fill_color())
                .set("stroke", stroke)
                .set("stroke-width", stroke_width),
        ),
        NodeKind::Io => {
            let slant = h * 0.25;
            group.add(
                Polygon::new()
                    .set(
                        "points",
                        format!(
                            "{},{} {},{} {},{} {},{}",
                            left + slant,
                            top,
                            left + w,
                            top,
                            left + w - slant,
                            top + h,
                            left,
                            top + h
                        ),
                    )
                    .set("fill", kind.fill_color())
                    .set("stroke", stroke)
                    .set("stroke-width", stroke_width),
            )
        }
        NodeKind::Start | NodeKind::End | NodeKind::Process => {
            let radius = if kind == NodeKind::Process { 6.0 } else { h / 2.0 };
            group.add(
                Rectangle::new()
                    .set("x", left)
                    .set("y", top)
                    .set("width", w)
                    .set("height", h)
                    .set("rx", radius)
                    .set("fill", kind.fill_color())
                    .set("stroke", stroke)
                    .set("stroke-width", stroke_width),
            )
        }
    }
}

fn text(x: f32, y: f32, content: &str, color: &str) -> svg_element::Text {
    svg_element::Text::new("")
        .set("x", x)
        .set("y", y)
        .set("text-anchor", "middle")
        .set("dominant-baseline", "central")
        .set("font-family", FONT_FAMILY)
        .set("font-size", FONT_SIZE)
        .set("fill", color)
        .add(svg::node::Text::new(content))
}

/// Renders one frame (`None` = fully drawn) to an SVG document.
pub fn render_svg(layout: &LayoutGraph, frame: Option<&AnimationFrame>) -> String {
    let visibility = frame.map(Visibility::of);
    let spec = &layout.spec;

    let mut doc = Document::new()
        .set("viewBox", format!("0 0 {} {}", layout.width, layout.height))
        .set("width", layout.width)
        .set("height", layout.height)
        .add(markers())
        .add(
            Rectangle::new()
                .set("width", "100%")
                .set("height", "100%")
                .set("fill", "white"),
        );

    for (edge, path) in spec.edges.iter().zip(&layout.edges) {
        let (opacity, reveal, highlighted) = match &visibility {
            Some(v) => match v.edges.get(&(edge.source.clone(), edge.target.clone())) {
                Some(&state) => state,
                None => continue,
            },
            None => (1.0, 1.0, false),
        };
        let points = if reveal >= 1.0 {
            path.points.clone()
        } else {
            path.prefix(reveal)
        };
        if points.len() < 2 {
            continue;
        }

        let mut line = Path::new()
            .set("d", path_data(&points))
            .set("fill", "none")
            .set(
                "stroke",
                if highlighted {
                    HIGHLIGHT
                } else {
                    edge.style.stroke_color()
                },
            )
            .set("stroke-width", if highlighted { 3 } else { 2 })
            .set("opacity", opacity);
        if let Some(dash) = edge.style.dash_array() {
            line = line.set("stroke-dasharray", dash);
        }
        if reveal >= 1.0 {
            line = line.set("marker-end", format!("url(#{})", arrow_id(edge.style)));
        }
        let mut group = svg_element::Group::new().add(line);

        if let (Some(label), true) = (edge.label.as_deref(), reveal >= 1.0) {
            // Middle of the middle segment.
            let mid = path.points.len() / 2;
            let anchor = path.points[mid.saturating_sub(1)].lerp(path.points[mid], 0.5);
            group = group.add(
                text(anchor.x + 6.0, anchor.y, label, "#555555")
                    .set("text-anchor", "start")
                    .set("opacity", opacity),
            );
        }
        doc = doc.add(group);
    }

    for (node, positioned) in spec.nodes.iter().zip(&layout.nodes) {
        let (opacity, scale, highlighted) = match &visibility {
            Some(v) => match v.nodes.get(&node.id) {
                Some(&state) => state,
                None => continue,
            },
            None => (1.0, 1.0, false),
        };
        let (cx, cy) = (positioned.center.x, positioned.center.y);
        let mut group = node_shape(positioned, node.kind, highlighted)
            .add(text(cx, cy, &node.label, node.kind.text_color()))
            .set("opacity", opacity);
        if scale != 1.0 {
            group = group.set(
                "transform",
                format!(
                    "translate({} {}) scale({}) translate({} {})",
                    cx, cy, scale, -cx, -cy
                ),
            );
        }
        doc = doc.add(group);
    }

    doc.to_string()
}
