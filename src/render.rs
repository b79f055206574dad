//! Layout, frame synthesis and export glued together.

use thiserror::Error;
use tracing::{info, instrument};

use crate::animation::{synthesize, AnimationConfig, AnimationFrame};
use crate::diagram::DiagramSpec;
use crate::export::{ExportError, ExportOptions, Exporters, StagedArtifacts};
use crate::layout::{LayoutError, LayoutGraph, LayoutOptions, LayoutProvider, SugiyamaLayout};
use crate::prompt::Fingerprint;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("layout failed: {0}")]
    Layout(#[from] LayoutError),
    #[error("export failed: {0}")]
    Export(#[from] ExportError),
}

#[derive(Debug)]
pub struct RenderResult {
    pub layout: LayoutGraph,
    pub frames: Vec<AnimationFrame>,
    /// Not yet at their final paths; dropping the result discards them.
    pub staged: StagedArtifacts,
}

pub struct RenderPipeline {
    layout: Box<dyn LayoutProvider>,
    layout_options: LayoutOptions,
    exporters: Exporters,
    export_options: ExportOptions,
}

impl RenderPipeline {
    pub fn new(
        layout: Box<dyn LayoutProvider>,
        layout_options: LayoutOptions,
        exporters: Exporters,
        export_options: ExportOptions,
    ) -> Self {
        Self {
            layout,
            layout_options,
            exporters,
            export_options,
        }
    }

    /// `rust-sugiyama` layout and the standard exporters.
    pub fn standard(layout_options: LayoutOptions, export_options: ExportOptions, animation: &AnimationConfig) -> Self {
        let exporters = Exporters::standard(export_options.raster_scale, animation.frame_delay_ms());
        Self::new(
            Box::new(SugiyamaLayout),
            layout_options,
            exporters,
            export_options,
        )
    }

    pub fn export_options(&self) -> &ExportOptions {
        &self.export_options
    }

    pub fn layout(&self, spec: &DiagramSpec) -> Result<LayoutGraph, LayoutError> {
        self.layout.layout(spec, &self.layout_options)
    }

    /// Lays out `spec`, synthesizes its frames and stages every configured
    /// artifact for `<fingerprint>.<ext>`.
    #[instrument(skip_all, fields(fingerprint = %fingerprint.short(), engine = self.layout.name()))]
    pub fn render(
        &self,
        spec: &DiagramSpec,
        animation: &AnimationConfig,
        fingerprint: &Fingerprint,
    ) -> Result<RenderResult, RenderError> {
        let layout = self.layout(spec)?;
        let frames = synthesize(&layout, animation);
        let staged = self
            .exporters
            .stage_all(fingerprint, &layout, &frames, &self.export_options)?;
        info!(
            "Rendered {} nodes, {} frames, {} artifacts",
            layout.nodes.len(),
            frames.len(),
            staged.artifacts().len()
        );
        Ok(RenderResult {
            layout,
            frames,
            staged,
        })
    }
}
