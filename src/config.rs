//! Runtime configuration.
//!
//! Everything the pipeline needs is read once into [`Settings`] (flags, with
//! environment variables and `.env` as fallbacks) and handed to components as
//! plain values. Nothing below this module looks at the environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::animation::{AnimationConfig, AnimationEffect};
use crate::cache::CacheLimits;
use crate::export::{ArtifactFormat, ExportOptions};
use crate::gateway::{GatewayConfig, RetryPolicy};
use crate::graph::BuilderOptions;
use crate::layout::LayoutOptions;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama2";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("animation speed must be a finite number greater than zero (got {0})")]
    InvalidSpeed(f64),
    #[error("max frames must be at least 2 (got {0})")]
    TooFewFrames(usize),
    #[error("max retries must be at least 1")]
    NoAttempts,
    #[error("at least one export format is required")]
    NoFormats,
    #[error("the cache must hold at least one entry")]
    EmptyCache,
    #[error("invalid API base URL '{0}'")]
    InvalidBaseUrl(String),
}

#[derive(Debug, Clone, clap::Args)]
pub struct Settings {
    /// Base URL of the Ollama API.
    #[arg(long, env = "OLLAMA_API_BASE_URL", default_value = DEFAULT_API_BASE_URL, global = true)]
    pub api_base_url: String,

    /// Model used to describe diagrams.
    #[arg(long, env = "OLLAMA_MODEL_NAME", default_value = DEFAULT_MODEL, global = true)]
    pub model: String,

    /// Verbose logging.
    #[arg(
        long,
        env = "APP_DEBUG",
        default_value_t = false,
        action = clap::ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub debug: bool,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Directory holding the response cache index.
    #[arg(long, env = "CACHE_DIR", default_value = "./cache", global = true)]
    pub cache_dir: PathBuf,

    /// Directory artifacts are written to (defaults to <cache-dir>/artifacts).
    #[arg(long, env = "OUTPUT_DIR", global = true)]
    pub output_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "ANIMATION_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub animation_enabled: bool,

    /// Higher is faster: fewer, larger-step frames.
    #[arg(long, env = "ANIMATION_SPEED", default_value_t = 1.0, global = true)]
    pub animation_speed: f64,

    #[arg(long, env = "ANIMATION_EFFECT", value_enum, default_value_t = AnimationEffect::SequentialReveal, global = true)]
    pub animation_effect: AnimationEffect,

    /// Upper bound on synthesized frames.
    #[arg(long, env = "MAX_FRAMES", default_value_t = 120, global = true)]
    pub max_frames: usize,

    /// Total attempts for transient gateway failures.
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3, global = true)]
    pub max_retries: u32,

    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 120, global = true)]
    pub request_timeout_secs: u64,

    #[arg(long, env = "CACHE_MAX_ENTRIES", default_value_t = 100, global = true)]
    pub cache_max_entries: usize,

    #[arg(long, env = "CACHE_MAX_BYTES", default_value_t = 256 * 1024 * 1024, global = true)]
    pub cache_max_bytes: u64,

    #[arg(long, env = "CACHE_MAX_AGE_SECS", default_value_t = 7 * 24 * 60 * 60, global = true)]
    pub cache_max_age_secs: u64,

    /// Accept cyclic diagrams (retry loops and the like).
    #[arg(
        long,
        env = "ALLOW_CYCLES",
        default_value_t = true,
        action = clap::ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub allow_cycles: bool,

    /// Lay out disconnected parts side by side instead of failing.
    #[arg(
        long,
        env = "ALLOW_DISCONNECTED",
        default_value_t = true,
        action = clap::ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub allow_disconnected: bool,

    /// Comma separated artifact formats.
    #[arg(long, env = "EXPORT_FORMATS", value_enum, value_delimiter = ',', default_values_t = [ArtifactFormat::Svg, ArtifactFormat::Png], global = true)]
    pub formats: Vec<ArtifactFormat>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            debug: false,
            log_level: "info".to_string(),
            cache_dir: PathBuf::from("./cache"),
            output_dir: None,
            animation_enabled: true,
            animation_speed: 1.0,
            animation_effect: AnimationEffect::SequentialReveal,
            max_frames: 120,
            max_retries: 3,
            request_timeout_secs: 120,
            cache_max_entries: 100,
            cache_max_bytes: 256 * 1024 * 1024,
            cache_max_age_secs: 7 * 24 * 60 * 60,
            allow_cycles: true,
            allow_disconnected: true,
            formats: vec![ArtifactFormat::Svg, ArtifactFormat::Png],
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.animation_speed.is_finite() || self.animation_speed <= 0.0 {
            return Err(ConfigError::InvalidSpeed(self.animation_speed));
        }
        if self.max_frames < 2 {
            return Err(ConfigError::TooFewFrames(self.max_frames));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if self.formats.is_empty() {
            return Err(ConfigError::NoFormats);
        }
        if self.cache_max_entries == 0 {
            return Err(ConfigError::EmptyCache);
        }
        if reqwest::Url::parse(&self.api_base_url).is_err() {
            return Err(ConfigError::InvalidBaseUrl(self.api_base_url.clone()));
        }
        Ok(())
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| self.cache_dir.join("artifacts"))
    }

    /// Filter directive for the tracing subscriber.
    pub fn log_directive(&self) -> String {
        if self.debug {
            "debug".to_string()
        } else {
            self.log_level.to_ascii_lowercase()
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            base_url: self.api_base_url.trim_end_matches('/').to_string(),
            model: self.model.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.max_retries,
                ..RetryPolicy::default()
            },
            system_prompt: Some(crate::gateway::FLOW_SYSTEM_PROMPT.to_string()),
        }
    }

    pub fn animation_config(&self) -> AnimationConfig {
        AnimationConfig {
            enabled: self.animation_enabled,
            speed: self.animation_speed,
            effect: self.animation_effect,
            max_frames: self.max_frames,
            ..AnimationConfig::default()
        }
    }

    pub fn builder_options(&self) -> BuilderOptions {
        BuilderOptions {
            allow_cycles: self.allow_cycles,
        }
    }

    pub fn layout_options(&self) -> LayoutOptions {
        LayoutOptions {
            allow_disconnected: self.allow_disconnected,
            ..LayoutOptions::default()
        }
    }

    pub fn export_options(&self) -> ExportOptions {
        ExportOptions {
            output_dir: self.output_dir(),
            formats: self.formats.clone(),
            ..ExportOptions::default()
        }
    }

    pub fn cache_limits(&self) -> CacheLimits {
        CacheLimits {
            max_entries: self.cache_max_entries,
            max_bytes: self.cache_max_bytes,
            max_age: Duration::from_secs(self.cache_max_age_secs),
        }
    }

    /// Hash of every setting that changes what a prompt renders to. Cached
    /// entries produced under a different digest are treated as stale.
    pub fn render_digest(&self) -> String {
        let mut formats: Vec<&str> = self.formats.iter().map(|f| f.extension()).collect();
        formats.sort_unstable();
        formats.dedup();
        let material = format!(
            "model={};anim={};speed={};effect={:?};max_frames={};cycles={};disconnected={};formats={}",
            self.model,
            self.animation_enabled,
            self.animation_speed,
            self.animation_effect,
            self.max_frames,
            self.allow_cycles,
            self.allow_disconnected,
            formats.join(","),
        );
        hex::encode(Sha256::digest(material.as_bytes()))
    }
}
