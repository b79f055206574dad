//! Artifact encoding and content-addressed file output.

mod mermaid;
mod raster;
mod svg;

pub use self::mermaid::MermaidExporter;
pub use self::raster::RasterExporter;
pub use self::svg::{render_svg, SvgExporter};

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::animation::AnimationFrame;
use crate::layout::LayoutGraph;
use crate::prompt::Fingerprint;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no exporter supports {0:?}")]
    UnsupportedFormat(ArtifactFormat),
    #[error("failed to encode {format:?}: {reason}")]
    Encode {
        format: ArtifactFormat,
        reason: String,
    },
    #[error("failed to write {path}: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    /// Final frame as SVG.
    Svg,
    /// Final frame as PNG.
    Png,
    /// Every frame as an animated GIF.
    Gif,
    /// Mermaid flowchart source.
    Mermaid,
}

impl ArtifactFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Svg => "svg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Mermaid => "mmd",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Svg => "image/svg+xml",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Mermaid => "text/plain",
        }
    }
}

/// A file written for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub format: ArtifactFormat,
    pub path: PathBuf,
    pub bytes: u64,
}

impl Artifact {
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportOptions {
    pub output_dir: PathBuf,
    pub formats: Vec<ArtifactFormat>,
    /// Raster pixels per layout unit.
    pub raster_scale: f32,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./cache/artifacts"),
            formats: vec![ArtifactFormat::Svg, ArtifactFormat::Png],
            raster_scale: 1.0,
        }
    }
}

/// Something that can turn a laid-out diagram into bytes of some format.
pub trait ExportProvider: Send + Sync {
    fn supports(&self, format: ArtifactFormat) -> bool;

    /// `frames` is never empty; still formats use the last one.
    fn encode(
        &self,
        layout: &LayoutGraph,
        frames: &[AnimationFrame],
        format: ArtifactFormat,
    ) -> Result<Vec<u8>, ExportError>;
}

/// Ordered set of providers; the first that supports a format handles it.
pub struct Exporters {
    providers: Vec<Box<dyn ExportProvider>>,
}

impl Exporters {
    pub fn new(providers: Vec<Box<dyn ExportProvider>>) -> Self {
        Self { providers }
    }

    /// SVG, raster (PNG and GIF) and Mermaid.
    pub fn standard(raster_scale: f32, frame_delay_ms: u32) -> Self {
        Self::new(vec![
            Box::new(SvgExporter),
            Box::new(RasterExporter::new(raster_scale, frame_delay_ms)),
            Box::new(MermaidExporter),
        ])
    }

    pub fn encode(
        &self,
        layout: &LayoutGraph,
        frames: &[AnimationFrame],
        format: ArtifactFormat,
    ) -> Result<Vec<u8>, ExportError> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.supports(format))
            .ok_or(ExportError::UnsupportedFormat(format))?;
        provider.encode(layout, frames, format)
    }

    /// Encodes every requested format and stages each one in a temp file
    /// next to its final `<fingerprint>.<ext>` name. Nothing is staged unless
    /// every format encodes; nothing reaches its final name until
    /// [`StagedArtifacts::commit`].
    #[instrument(skip_all, fields(fingerprint = %fingerprint.short()))]
    pub fn stage_all(
        &self,
        fingerprint: &Fingerprint,
        layout: &LayoutGraph,
        frames: &[AnimationFrame],
        options: &ExportOptions,
    ) -> Result<StagedArtifacts, ExportError> {
        let mut encoded = Vec::with_capacity(options.formats.len());
        for &format in &options.formats {
            if encoded.iter().any(|(f, _)| *f == format) {
                continue;
            }
            let bytes = self.encode(layout, frames, format)?;
            debug!(?format, bytes = bytes.len(), "Encoded artifact");
            encoded.push((format, bytes));
        }

        let dir = &options.output_dir;
        std::fs::create_dir_all(dir).map_err(write_failure(dir))?;
        let mut staged = StagedArtifacts::default();
        for (format, bytes) in encoded {
            let file_name = format!("{}.{}", fingerprint, format.extension());
            let mut tmp = tempfile::Builder::new()
                .prefix(&format!("{}.", file_name))
                .suffix(".partial")
                .tempfile_in(dir)
                .map_err(write_failure(dir))?;
            tmp.write_all(&bytes).map_err(write_failure(tmp.path()))?;
            tmp.as_file().sync_all().map_err(write_failure(tmp.path()))?;
            staged.files.push(StagedFile {
                artifact: Artifact {
                    format,
                    path: dir.join(file_name),
                    bytes: bytes.len() as u64,
                },
                tmp,
            });
        }
        Ok(staged)
    }

    /// [`Exporters::stage_all`] followed by an immediate commit.
    pub fn export_all(
        &self,
        fingerprint: &Fingerprint,
        layout: &LayoutGraph,
        frames: &[AnimationFrame],
        options: &ExportOptions,
    ) -> Result<Vec<Artifact>, ExportError> {
        self.stage_all(fingerprint, layout, frames, options)?.commit()
    }
}

#[derive(Debug)]
struct StagedFile {
    artifact: Artifact,
    tmp: NamedTempFile,
}

/// Encoded artifacts waiting in temp files beside their final paths.
/// Dropping the set deletes every file that was not committed.
#[derive(Debug, Default)]
pub struct StagedArtifacts {
    files: Vec<StagedFile>,
}

impl StagedArtifacts {
    /// Where the files will live once committed.
    pub fn artifacts(&self) -> Vec<Artifact> {
        self.files.iter().map(|f| f.artifact.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Temp paths holding the staged bytes.
    pub fn staging_paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.tmp.path().to_path_buf()).collect()
    }

    /// Renames every staged file onto its final path.
    pub fn commit(self) -> Result<Vec<Artifact>, ExportError> {
        let mut artifacts = Vec::with_capacity(self.files.len());
        for StagedFile { artifact, tmp } in self.files {
            tmp.persist(&artifact.path)
                .map_err(|e| ExportError::WriteFailure {
                    path: artifact.path.clone(),
                    source: e.error,
                })?;
            info!("Wrote {}", artifact.path.display());
            artifacts.push(artifact);
        }
        Ok(artifacts)
    }
}

fn write_failure(path: &Path) -> impl FnOnce(std::io::Error) -> ExportError {
    let path = path.to_path_buf();
    move |source| ExportError::WriteFailure { path, source }
}

/// Writes through a temp file in the same directory and renames it into
/// place, so readers see either the old file or the complete new one.
pub fn write_atomic(dir: &Path, file_name: &str, bytes: &[u8]) -> Result<PathBuf, ExportError> {
    std::fs::create_dir_all(dir).map_err(write_failure(dir))?;
    let target = dir.join(file_name);
    let mut tmp = NamedTempFile::new_in(dir).map_err(write_failure(dir))?;
    tmp.write_all(bytes).map_err(write_failure(tmp.path()))?;
    tmp.as_file().sync_all().map_err(write_failure(tmp.path()))?;
    tmp.persist(&target)
        .map_err(|e| ExportError::WriteFailure {
            path: target.clone(),
            source: e.error,
        })?;
    Ok(target)
}
