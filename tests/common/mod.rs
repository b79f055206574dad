#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::sync::Arc;

use async_trait::async_trait;
use flowcast::export::ArtifactFormat;
use flowcast::gateway::{GatewayError, ModelGateway};
use flowcast::prompt::RawModelResponse;
use flowcast::{Prompt, Settings};

/// Gateway that replays canned answers and counts calls.
pub struct ScriptedGateway {
    answers: Mutex<VecDeque<Result<String, GatewayError>>>,
    calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new(answers: Vec<Result<&str, GatewayError>>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into_iter().map(|a| a.map(str::to_string)).collect()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn generate(&self, prompt: &Prompt) -> Result<RawModelResponse, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = self
            .answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GatewayError::NonSuccessStatus {
                status: 599,
                body: "script exhausted".to_string(),
            }))?;
        Ok(RawModelResponse {
            fingerprint: prompt.fingerprint(),
            model: "scripted".to_string(),
            text: answer,
        })
    }
}

pub fn settings(dir: &Path) -> Settings {
    Settings {
        cache_dir: dir.join("cache"),
        output_dir: Some(dir.join("out")),
        formats: vec![ArtifactFormat::Svg, ArtifactFormat::Mermaid],
        ..Settings::default()
    }
}

