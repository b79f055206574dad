use std::fmt::Write;

use super::{ArtifactFormat, ExportError, ExportProvider};
use crate::animation::AnimationFrame;
use crate::diagram::{EdgeStyle, NodeKind};
use crate::layout::LayoutGraph;

/// Mermaid `flowchart TD` source with the same palette as the drawings.
#[derive(Debug, Clone, Copy, Default)]
pub struct MermaidExporter;

fn escape(label: &str) -> String {
    label.replace('"', "#quot;")
}

impl MermaidExporter {
    pub fn source(layout: &LayoutGraph) -> String {
        let spec = &layout.spec;
        let mut out = String::from("flowchart TD\n");
        let _ = writeln!(out, "    %% {}", spec.title_or_default());

        let alias = |id: &str| {
            spec.node_index(id)
                .map(|i| format!("n{}", i))
                .unwrap_or_else(|| id.to_string())
        };

        for (i, node) in spec.nodes.iter().enumerate() {
            let label = escape(&node.label);
            let shape = match node.kind {
                NodeKind::Start | NodeKind::End => format!("([\"{}\"])", label),
                NodeKind::Decision => format!("{{\"{}\"}}", label),
                NodeKind::Io => format!("[/\"{}\"/]", label),
                NodeKind::Process => format!("[\"{}\"]", label),
            };
            let _ = writeln!(out, "    n{}{}", i, shape);
            let _ = writeln!(
                out,
                "    style n{} fill:{},stroke:#333,color:{}",
                i,
                node.kind.fill_color(),
                node.kind.text_color()
            );
        }

        for (i, edge) in spec.edges.iter().enumerate() {
            let arrow = match edge.style {
                EdgeStyle::Feedback => "-.->",
                EdgeStyle::Normal | EdgeStyle::Conditional => "-->",
            };
            let label = edge
                .label
                .as_deref()
                .map(|l| format!("|\"{}\"|", escape(l)))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "    {} {}{} {}",
                alias(&edge.source),
                arrow,
                label,
                alias(&edge.target)
            );
            if edge.style != EdgeStyle::Normal {
                let dash = edge
                    .style
                    .dash_array()
                    .map(|d| format!(",stroke-dasharray:{}", d))
                    .unwrap_or_default();
                let _ = writeln!(
                    out,
                    "    linkStyle {} stroke:{},stroke-width:2px{}",
                    i,
                    edge.style.stroke_color(),
                    dash
                );
            }
        }
        out
    }
}

impl ExportProvider for MermaidExporter {
    fn supports(&self, format: ArtifactFormat) -> bool {
        format == ArtifactFormat::Mermaid
    }

    fn encode(
        &self,
        layout: &LayoutGraph,
        _frames: &[AnimationFrame],
        format: ArtifactFormat,
    ) -> Result<Vec<u8>, ExportError> {
        if !self.supports(format) {
            return Err(ExportError::UnsupportedFormat(format));
        }
        Ok(Self::source(layout).into_bytes())
    }
}
