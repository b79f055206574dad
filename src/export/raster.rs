use std::sync::Arc;

use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, Frame, RgbaImage};
use tracing::debug;

use super::svg::render_svg;
use super::{ArtifactFormat, ExportError, ExportProvider};
use crate::animation::AnimationFrame;
use crate::layout::LayoutGraph;

/// PNG of the final frame and GIF of the whole animation, rasterized from
/// the SVG rendering with resvg.
pub struct RasterExporter {
    scale: f32,
    frame_delay_ms: u32,
    fontdb: Arc<usvg::fontdb::Database>,
}

impl RasterExporter {
    /// Loads system fonts once; exporters are meant to be long-lived.
    pub fn new(scale: f32, frame_delay_ms: u32) -> Self {
        let mut fontdb = usvg::fontdb::Database::new();
        fontdb.load_system_fonts();
        debug!(faces = fontdb.len(), "Loaded system fonts for rasterization");
        Self {
            scale: if scale.is_finite() && scale > 0.0 { scale } else { 1.0 },
            frame_delay_ms: frame_delay_ms.max(1),
            fontdb: Arc::new(fontdb),
        }
    }

    fn rasterize(&self, svg: &str, format: ArtifactFormat) -> Result<tiny_skia::Pixmap, ExportError> {
        let encode_err = |reason: String| ExportError::Encode { format, reason };

        let mut opt = usvg::Options::default();
        opt.fontdb = Arc::clone(&self.fontdb);
        opt.font_family = "Arial".to_string();

        let tree = usvg::Tree::from_str(svg, &opt).map_err(|e| encode_err(e.to_string()))?;
        let size = tree.size();
        let width = (size.width() * self.scale).ceil().max(1.0) as u32;
        let height = (size.height() * self.scale).ceil().max(1.0) as u32;

        let mut pixmap = tiny_skia::Pixmap::new(width, height)
            .ok_or_else(|| encode_err(format!("cannot allocate a {}x{} pixmap", width, height)))?;
        pixmap.fill(tiny_skia::Color::WHITE);
        resvg::render(
            &tree,
            tiny_skia::Transform::from_scale(self.scale, self.scale),
            &mut pixmap.as_mut(),
        );
        Ok(pixmap)
    }

    fn encode_png(&self, layout: &LayoutGraph, frame: Option<&AnimationFrame>) -> Result<Vec<u8>, ExportError> {
        let pixmap = self.rasterize(&render_svg(layout, frame), ArtifactFormat::Png)?;
        pixmap.encode_png().map_err(|e| ExportError::Encode {
            format: ArtifactFormat::Png,
            reason: e.to_string(),
        })
    }

    fn encode_gif(&self, layout: &LayoutGraph, frames: &[AnimationFrame]) -> Result<Vec<u8>, ExportError> {
        let encode_err = |reason: String| ExportError::Encode {
            format: ArtifactFormat::Gif,
            reason,
        };

        let mut images = Vec::with_capacity(frames.len());
        for frame in frames {
            let pixmap = self.rasterize(&render_svg(layout, Some(frame)), ArtifactFormat::Gif)?;
            // tiny-skia stores premultiplied RGBA; the background is opaque so
            // the bytes are plain RGBA as well.
            let (width, height) = (pixmap.width(), pixmap.height());
            let buffer = RgbaImage::from_raw(width, height, pixmap.take())
                .ok_or_else(|| encode_err("pixmap size does not match its buffer".to_string()))?;
            images.push(Frame::from_parts(
                buffer,
                0,
                0,
                Delay::from_numer_denom_ms(self.frame_delay_ms, 1),
            ));
        }

        let mut out = Vec::new();
        {
            let mut encoder = GifEncoder::new_with_speed(&mut out, 10);
            encoder
                .set_repeat(Repeat::Infinite)
                .map_err(|e| encode_err(e.to_string()))?;
            encoder
                .encode_frames(images)
                .map_err(|e| encode_err(e.to_string()))?;
        }
        Ok(out)
    }
}

impl ExportProvider for RasterExporter {
    fn supports(&self, format: ArtifactFormat) -> bool {
        matches!(format, ArtifactFormat::Png | ArtifactFormat::Gif)
    }

    fn encode(
        &self,
        layout: &LayoutGraph,
        frames: &[AnimationFrame],
        format: ArtifactFormat,
    ) -> Result<Vec<u8>, ExportError> {
        match format {
            ArtifactFormat::Png => self.encode_png(layout, frames.last()),
            ArtifactFormat::Gif => self.encode_gif(layout, frames),
            other => Err(ExportError::UnsupportedFormat(other)),
        }
    }
}
