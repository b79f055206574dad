//! Chat sessions: the boundary between a conversational front end and the
//! pipeline. A newer submission always supersedes the one in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::pipeline::{Pipeline, PipelineError, PipelineOutput};
use crate::prompt::Prompt;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("request was superseded by a newer one")]
    Superseded,
    #[error("pipeline task failed: {0}")]
    TaskFailed(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            role,
            content: content.into(),
        }
    }
}

pub struct ChatSession {
    id: String,
    pipeline: Arc<Pipeline>,
    generation: AtomicU64,
    in_flight: Mutex<Option<(u64, AbortHandle)>>,
    history: Mutex<Vec<ChatMessage>>,
}

impl ChatSession {
    /// A session under a fresh random id.
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pipeline,
            generation: AtomicU64::new(0),
            in_flight: Mutex::new(None),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn history(&self) -> Vec<ChatMessage> {
        self.history.lock().await.clone()
    }

    async fn record(&self, role: Role, content: impl Into<String>) {
        self.history.lock().await.push(ChatMessage::new(role, content));
    }

    /// Runs the pipeline for `text`, aborting whatever this session was still
    /// working on. A run that is overtaken before it finishes returns
    /// [`SessionError::Superseded`]; only the prompt is kept in the history.
    #[instrument(skip(self, text), fields(session = %self.id))]
    pub async fn submit(&self, text: &str) -> Result<PipelineOutput, SessionError> {
        let prompt = Prompt::new(text);
        if prompt.is_blank() {
            return Err(SessionError::EmptyPrompt);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(Role::User, prompt.text()).await;

        let pipeline = Arc::clone(&self.pipeline);
        let handle = tokio::spawn(async move { pipeline.run(&prompt).await });
        {
            let mut slot = self.in_flight.lock().await;
            // A newer submission may have registered first; this one is then already stale.
            let overtaken = matches!(slot.as_ref(), Some((current, _)) if *current > generation);
            if overtaken {
                handle.abort();
            } else if let Some((previous, abort)) = slot.replace((generation, handle.abort_handle())) {
                debug!("Aborting request {}", previous);
                abort.abort();
            }
        }

        let joined = handle.await;
        if self.generation.load(Ordering::SeqCst) != generation {
            info!("Discarding result of superseded request {}", generation);
            return Err(SessionError::Superseded);
        }

        match joined {
            Ok(Ok(output)) => {
                let summary = format!(
                    "{} ({} nodes, {} edges{})",
                    output.spec.title_or_default(),
                    output.spec.nodes.len(),
                    output.spec.edges.len(),
                    if output.cache_hit { ", cached" } else { "" }
                );
                self.record(Role::Assistant, summary).await;
                Ok(output)
            }
            Ok(Err(err)) => {
                self.record(Role::Error, err.user_message()).await;
                Err(err.into())
            }
            Err(e) if e.is_cancelled() => Err(SessionError::Superseded),
            Err(e) => {
                self.record(Role::Error, "Something went wrong while drawing the diagram.").await;
                Err(SessionError::TaskFailed(e.to_string()))
            }
        }
    }
}
