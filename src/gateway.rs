use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, instrument, warn};

use crate::prompt::{Prompt, RawModelResponse};

/// Instructions sent as the `system` field. The parser copes with answers that
/// ignore it, so it only nudges the model towards the structured shape.
pub const FLOW_SYSTEM_PROMPT: &str = r#"You are a specialized flow diagram creation assistant. Your task is to convert
user descriptions into structured JSON that represents flow diagrams.

Output a valid JSON object with the following structure:
{
    "nodes": [
        {"id": "node1", "label": "Node Label", "type": "process|decision|start|end|io"}
    ],
    "edges": [
        {"from": "node1", "to": "node2", "label": "Connection Label", "type": "normal|conditional|feedback"}
    ],
    "title": "Diagram Title",
    "animations": [
        {"element": "node1", "effect": "fadeIn|highlight|pulse", "order": 1},
        {"element": "edge_node1_node2", "effect": "draw|highlight", "order": 2}
    ]
}

Ensure all IDs are unique and all references are valid. The animations list is
optional; use it to show the order in which the flow should be revealed."#;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    #[error("model endpoint {url} is unreachable: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("model endpoint returned HTTP {status}: {body}")]
    NonSuccessStatus { status: u16, body: String },
}

impl GatewayError {
    /// Only transport-level failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Timeout { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): `initial * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL without a trailing slash, e.g. `http://localhost:11434`.
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub system_prompt: Option<String>,
}

/// Anything that can turn a prompt into model text.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn generate(&self, prompt: &Prompt) -> Result<RawModelResponse, GatewayError>;
}

// Structures matching Ollama's /api/generate endpoint
#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct OllamaResponse {
    response: String,
}

#[derive(Deserialize, Debug)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Deserialize, Debug)]
struct OllamaModel {
    name: String,
}

/// Gateway backed by a (usually local) Ollama server.
///
/// The model actually used is resolved against the installed ones on the
/// first request (see [`OllamaGateway::resolve_model`]).
pub struct OllamaGateway {
    client: Client,
    config: GatewayConfig,
    active_model: OnceCell<String>,
}

impl OllamaGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            client: Client::new(),
            config,
            active_model: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Same gateway, different model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self.active_model = OnceCell::new();
        self
    }

    /// Model name sent with generate requests. Resolved once; if the server
    /// cannot list its models the configured name is used as is.
    pub async fn active_model(&self) -> &str {
        self.active_model
            .get_or_init(|| async {
                match self.resolve_model().await {
                    Ok(model) => {
                        if model != self.config.model {
                            info!("Using model '{}' instead of '{}'", model, self.config.model);
                        }
                        model
                    }
                    Err(e) => {
                        warn!("Could not check installed models ({}), using '{}'", e, self.config.model);
                        self.config.model.clone()
                    }
                }
            })
            .await
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn user_prompt(description: &str) -> String {
        format!(
            "Create a detailed flow diagram from the following description:\n\n{}\n\n\
             Respond only with the JSON structure defined in the system prompt.",
            description
        )
    }

    async fn attempt(&self, model: &str, prompt: &Prompt) -> Result<String, GatewayError> {
        let url = self.endpoint("/api/generate");
        let payload = OllamaRequest {
            model,
            prompt: Self::user_prompt(prompt.text()),
            system: self.config.system_prompt.as_deref(),
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .timeout(self.config.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| classify(e, &url, self.config.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| classify(e, &url, self.config.timeout))?;

        if !status.is_success() {
            error!(%status, %body, "Ollama API request failed");
            return Err(GatewayError::NonSuccessStatus {
                status: status.as_u16(),
                body,
            });
        }

        // Ollama wraps the text in JSON; anything else is taken as the text itself.
        match serde_json::from_str::<OllamaResponse>(&body) {
            Ok(parsed) => Ok(parsed.response),
            Err(e) => {
                debug!("Response body is not Ollama JSON ({}), using it verbatim", e);
                Ok(body)
            }
        }
    }

    /// Names of the models installed on the server.
    pub async fn list_models(&self) -> Result<Vec<String>, GatewayError> {
        let url = self.endpoint("/api/tags");
        let response = self
            .client
            .get(&url)
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| classify(e, &url, self.config.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| classify(e, &url, self.config.timeout))?;
        if !status.is_success() {
            return Err(GatewayError::NonSuccessStatus {
                status: status.as_u16(),
                body,
            });
        }

        match serde_json::from_str::<OllamaTags>(&body) {
            Ok(tags) => Ok(tags.models.into_iter().map(|m| m.name).collect()),
            Err(e) => {
                warn!("Unexpected /api/tags body ({}), treating it as no installed models", e);
                Ok(Vec::new())
            }
        }
    }

    /// Picks the model to use: the configured one if installed, else
    /// `<model>:latest`, else the first installed model, else the configured
    /// name unchanged.
    pub async fn resolve_model(&self) -> Result<String, GatewayError> {
        let installed = self.list_models().await?;
        let wanted = &self.config.model;
        if installed.iter().any(|name| name.contains(wanted.as_str())) {
            return Ok(wanted.clone());
        }
        warn!("Model '{}' not found in installed models {:?}", wanted, installed);
        let latest = format!("{}:latest", wanted);
        if installed.contains(&latest) {
            return Ok(latest);
        }
        Ok(installed
            .first()
            .map(|name| name.split(':').next().unwrap_or(name).to_string())
            .unwrap_or_else(|| wanted.clone()))
    }
}

#[async_trait]
impl ModelGateway for OllamaGateway {
    #[instrument(skip(self, prompt), fields(fingerprint = %prompt.fingerprint().short(), model = %self.config.model))]
    async fn generate(&self, prompt: &Prompt) -> Result<RawModelResponse, GatewayError> {
        let policy = &self.config.retry;
        let attempts = policy.max_attempts.max(1);
        let model = self.active_model().await;
        let mut attempt = 1;
        loop {
            info!("Sending request to Ollama (attempt {}/{})", attempt, attempts);
            match self.attempt(model, prompt).await {
                Ok(text) => {
                    debug!(chars = text.len(), "Received Ollama response");
                    return Ok(RawModelResponse {
                        fingerprint: prompt.fingerprint(),
                        model: model.to_string(),
                        text,
                    });
                }
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = policy.backoff(attempt);
                    warn!("Transient gateway failure: {}; retrying in {:?}", err, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn classify(err: reqwest::Error, url: &str, timeout: Duration) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout {
            url: url.to_string(),
            timeout,
        }
    } else {
        GatewayError::Unreachable {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}
