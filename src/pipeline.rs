//! Orchestration of one prompt: cache lookup, model call, parse, validation,
//! rendering and caching of the result.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::animation::{synthesize, AnimationConfig, AnimationFrame};
use crate::cache::{CacheEntry, CacheError, PutOutcome, ResponseCache};
use crate::config::Settings;
use crate::diagram::DiagramSpec;
use crate::export::Artifact;
use crate::gateway::{GatewayError, ModelGateway, OllamaGateway};
use crate::graph::{GraphBuilder, GraphError};
use crate::layout::LayoutGraph;
use crate::parser::{DiagramParser, ParseError, ParseTrace};
use crate::prompt::{Fingerprint, Prompt};
use crate::render::{RenderError, RenderPipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Gateway,
    Parse,
    Build,
    Render,
    Cache,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gateway => "gateway",
            Self::Parse => "parse",
            Self::Build => "build",
            Self::Render => "render",
            Self::Cache => "cache",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Build(#[from] GraphError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("render task did not finish: {0}")]
    RenderTask(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl StageError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Gateway(_) => Stage::Gateway,
            Self::Parse(_) => Stage::Parse,
            Self::Build(_) => Stage::Build,
            Self::Render(_) | Self::RenderTask(_) => Stage::Render,
            Self::Cache(_) => Stage::Cache,
        }
    }
}

#[derive(Debug, Error)]
#[error("{stage} stage failed for prompt {fp}: {source}", fp = .fingerprint.short())]
pub struct PipelineError {
    pub stage: Stage,
    pub fingerprint: Fingerprint,
    #[source]
    pub source: StageError,
}

impl PipelineError {
    fn new(fingerprint: &Fingerprint, source: impl Into<StageError>) -> Self {
        let source = source.into();
        Self {
            stage: source.stage(),
            fingerprint: fingerprint.clone(),
            source,
        }
    }

    /// Text suitable for showing in a chat window.
    pub fn user_message(&self) -> String {
        match &self.source {
            StageError::Gateway(GatewayError::Unreachable { url, .. }) => format!(
                "Could not reach the model server at {}. Is Ollama running?",
                url
            ),
            StageError::Gateway(GatewayError::Timeout { timeout, .. }) => format!(
                "The model did not answer within {} seconds. Try again or raise the request timeout.",
                timeout.as_secs()
            ),
            StageError::Gateway(GatewayError::NonSuccessStatus { status, .. }) => {
                format!("The model server returned an error (HTTP {}).", status)
            }
            StageError::Parse(ParseError::NoStructureFound) => {
                "The model's answer did not describe a diagram. Try rephrasing your request."
                    .to_string()
            }
            StageError::Parse(e) => format!("The model's answer could not be turned into a diagram: {}", e),
            StageError::Build(e) => format!("The described diagram is inconsistent: {}", e),
            StageError::Render(_) | StageError::RenderTask(_) => {
                format!("The diagram could not be drawn: {}", self.source)
            }
            StageError::Cache(e) => format!("The diagram was drawn but could not be saved: {}", e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub fingerprint: Fingerprint,
    pub spec: DiagramSpec,
    pub layout: LayoutGraph,
    pub frames: Vec<AnimationFrame>,
    pub artifacts: Vec<Artifact>,
    /// Empty on a cache hit.
    pub trace: ParseTrace,
    pub cache_hit: bool,
}

pub struct Pipeline {
    gateway: Arc<dyn ModelGateway>,
    parser: DiagramParser,
    builder: GraphBuilder,
    renderer: Arc<RenderPipeline>,
    animation: AnimationConfig,
    cache: Arc<ResponseCache>,
    settings_digest: String,
}

impl Pipeline {
    /// Wires the components derived from `settings` around the given gateway
    /// and cache.
    pub fn new(settings: &Settings, gateway: Arc<dyn ModelGateway>, cache: Arc<ResponseCache>) -> Self {
        let animation = settings.animation_config();
        let renderer = RenderPipeline::standard(settings.layout_options(), settings.export_options(), &animation);
        Self {
            gateway,
            parser: DiagramParser::default(),
            builder: GraphBuilder::new(settings.builder_options()),
            renderer: Arc::new(renderer),
            animation,
            cache,
            settings_digest: settings.render_digest(),
        }
    }

    /// Ollama gateway plus the on-disk cache under `settings.cache_dir`.
    pub fn from_settings(settings: &Settings) -> Result<Self, CacheError> {
        let cache = ResponseCache::open(&settings.cache_dir, settings.cache_limits())?;
        let gateway = OllamaGateway::new(settings.gateway_config());
        Ok(Self::new(settings, Arc::new(gateway), Arc::new(cache)))
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    fn from_entry(&self, fingerprint: Fingerprint, entry: &CacheEntry) -> PipelineOutput {
        PipelineOutput {
            fingerprint,
            spec: entry.spec.clone(),
            frames: synthesize(&entry.layout, &self.animation),
            layout: entry.layout.clone(),
            artifacts: entry.artifacts.clone(),
            trace: ParseTrace::default(),
            cache_hit: true,
        }
    }

    #[instrument(skip_all, fields(fingerprint = %prompt.fingerprint().short()))]
    pub async fn run(&self, prompt: &Prompt) -> Result<PipelineOutput, PipelineError> {
        let fingerprint = prompt.fingerprint();
        let fail = |source: StageError| {
            let err = PipelineError::new(&fingerprint, source);
            warn!(stage = %err.stage, "Pipeline failed: {}", err.source);
            err
        };

        if prompt.is_blank() {
            return Err(fail(ParseError::NoStructureFound.into()));
        }

        if let Some(entry) = self.cache.get(&fingerprint).await {
            if entry.settings_digest == self.settings_digest {
                info!("Cache hit");
                return Ok(self.from_entry(fingerprint, &entry));
            }
            debug!("Cached entry was rendered under other settings");
        }

        let raw = self
            .gateway
            .generate(prompt)
            .await
            .map_err(|e| fail(e.into()))?;
        debug!(model = %raw.model, chars = raw.text.len(), "Model answered");

        let outcome = self.parser.parse(&raw.text).map_err(|e| fail(e.into()))?;
        for step in outcome.trace.dropped() {
            debug!(?step, "Parser dropped a fragment");
        }
        let spec = self.builder.build(&outcome.spec).map_err(|e| fail(e.into()))?;

        let renderer = Arc::clone(&self.renderer);
        let animation = self.animation.clone();
        let render_spec = spec.clone();
        let render_fp = fingerprint.clone();
        let rendered = tokio::task::spawn_blocking(move || renderer.render(&render_spec, &animation, &render_fp))
            .await
            .map_err(|e| fail(StageError::RenderTask(e.to_string())))?
            .map_err(|e| fail(e.into()))?;

        // Artifacts only reach their final paths inside the cache's write
        // lock; a cancelled or failed run drops its staged files.
        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            prompt: prompt.normalized(),
            settings_digest: self.settings_digest.clone(),
            spec: spec.clone(),
            layout: rendered.layout.clone(),
            artifacts: rendered.staged.artifacts(),
            created_at: Utc::now(),
        };
        let (stored, entry) = self
            .cache
            .put_staged(entry, rendered.staged)
            .await
            .map_err(|e| fail(e.into()))?;
        if stored == PutOutcome::Discarded {
            info!("A concurrent run cached this prompt first, returning its result");
            return Ok(self.from_entry(fingerprint, &entry));
        }
        debug!(outcome = ?stored, "Stored result");

        info!(
            "Generated diagram '{}' with {} nodes and {} edges",
            spec.title_or_default(),
            spec.nodes.len(),
            spec.edges.len()
        );
        Ok(PipelineOutput {
            fingerprint,
            spec,
            layout: rendered.layout,
            frames: rendered.frames,
            artifacts: entry.artifacts.clone(),
            trace: outcome.trace,
            cache_hit: false,
        })
    }
}
