use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    serve, Json, Router,
};
use minijinja::Environment;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::diagram::DiagramSpec;
use crate::export::ArtifactFormat;
use crate::parser::ParseTrace;
use crate::pipeline::{Pipeline, PipelineOutput, Stage};
use crate::session::{ChatSession, SessionError};

const INDEX_TEMPLATE: &str = include_str!("../templates/index.html");

#[derive(Debug, Clone, PartialEq)]
pub struct SessionLimits {
    pub max_sessions: usize,
    /// Sessions idle for longer than this are forgotten.
    pub idle_ttl: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sessions: 256,
            idle_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Sessions the server has issued, with the time each was last used.
struct SessionRegistry {
    limits: SessionLimits,
    sessions: HashMap<String, (Arc<ChatSession>, Instant)>,
}

impl SessionRegistry {
    fn new(limits: SessionLimits) -> Self {
        Self {
            limits,
            sessions: HashMap::new(),
        }
    }

    fn get(&mut self, id: &str, now: Instant) -> Option<Arc<ChatSession>> {
        self.prune(now);
        let (session, last_active) = self.sessions.get_mut(id)?;
        *last_active = now;
        Some(Arc::clone(session))
    }

    fn insert(&mut self, session: Arc<ChatSession>, now: Instant) {
        self.prune(now);
        while !self.sessions.is_empty() && self.sessions.len() >= self.limits.max_sessions {
            let Some(oldest) = self
                .sessions
                .iter()
                .min_by(|(a_id, (_, a)), (b_id, (_, b))| a.cmp(b).then_with(|| a_id.cmp(b_id)))
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            debug!(session = %oldest, "Dropping least recently used session");
            self.sessions.remove(&oldest);
        }
        self.sessions.insert(session.id().to_string(), (session, now));
    }

    fn prune(&mut self, now: Instant) {
        let ttl = self.limits.idle_ttl;
        self.sessions
            .retain(|_, (_, last_active)| now.saturating_duration_since(*last_active) <= ttl);
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}

// Shared application state
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
    templates: Arc<Environment<'static>>,
    sessions: Arc<Mutex<SessionRegistry>>,
    model: String,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, settings: &Settings) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("index.html", INDEX_TEMPLATE)
            .context("Failed to compile the index template")?;
        Ok(Self {
            pipeline,
            templates: Arc::new(env),
            sessions: Arc::new(Mutex::new(SessionRegistry::new(SessionLimits::default()))),
            model: settings.model.clone(),
        })
    }

    pub fn with_session_limits(self, limits: SessionLimits) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(SessionRegistry::new(limits))),
            ..self
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// The live session issued under `id`, otherwise a new one with a fresh
    /// id. Ids the server never issued are not adopted.
    async fn session(&self, id: Option<&str>) -> Arc<ChatSession> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        if let Some(id) = id {
            if let Some(session) = sessions.get(id, now) {
                return session;
            }
            debug!(session = %id, "Unknown or expired session, issuing a new one");
        }
        let session = Arc::new(ChatSession::new(Arc::clone(&self.pipeline)));
        sessions.insert(Arc::clone(&session), now);
        session
    }
}

#[derive(Debug, Deserialize)]
pub struct DiagramRequest {
    pub prompt: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ArtifactLink {
    pub format: ArtifactFormat,
    pub url: String,
    pub mime_type: &'static str,
    pub bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct DiagramResponse {
    pub session_id: String,
    pub fingerprint: String,
    pub title: String,
    pub cache_hit: bool,
    pub frames: usize,
    pub spec: DiagramSpec,
    pub artifacts: Vec<ArtifactLink>,
    pub trace: ParseTrace,
}

impl DiagramResponse {
    fn new(session_id: &str, output: PipelineOutput) -> Self {
        let artifacts = output
            .artifacts
            .iter()
            .filter_map(|artifact| {
                let name = artifact.file_name()?;
                Some(ArtifactLink {
                    format: artifact.format,
                    url: format!("/artifacts/{}", name),
                    mime_type: artifact.format.mime_type(),
                    bytes: artifact.bytes,
                })
            })
            .collect();
        Self {
            session_id: session_id.to_string(),
            fingerprint: output.fingerprint.to_string(),
            title: output.spec.title_or_default().to_string(),
            cache_hit: output.cache_hit,
            frames: output.frames.len(),
            spec: output.spec,
            artifacts,
            trace: output.trace,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<Stage>,
}

pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let (status, stage, message) = match &err {
            SessionError::EmptyPrompt => (StatusCode::BAD_REQUEST, None, err.to_string()),
            SessionError::Superseded => (StatusCode::CONFLICT, None, err.to_string()),
            SessionError::TaskFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, None, err.to_string()),
            SessionError::Pipeline(e) => {
                let status = match e.stage {
                    Stage::Gateway => StatusCode::BAD_GATEWAY,
                    Stage::Parse | Stage::Build => StatusCode::UNPROCESSABLE_ENTITY,
                    Stage::Render | Stage::Cache => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, Some(e.stage), e.user_message())
            }
        };
        Self {
            status,
            body: ErrorBody {
                error: message,
                stage,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

async fn index_handler(State(state): State<AppState>) -> Result<Html<String>, (StatusCode, Html<String>)> {
    state
        .templates
        .get_template("index.html")
        .and_then(|tmpl| {
            tmpl.render(minijinja::context! {
                title => "flowcast",
                model => state.model.as_str(),
            })
        })
        .map(Html)
        .map_err(|e| {
            error!("Failed to render template: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(format!("Internal Server Error: {}", e)),
            )
        })
}

async fn diagram_handler(
    State(state): State<AppState>,
    Json(request): Json<DiagramRequest>,
) -> Result<Json<DiagramResponse>, ApiError> {
    let session = state.session(request.session_id.as_deref()).await;
    match session.submit(&request.prompt).await {
        Ok(output) => Ok(Json(DiagramResponse::new(session.id(), output))),
        Err(err) => {
            warn!(session = %session.id(), "Diagram request failed: {}", err);
            Err(err.into())
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.pipeline.cache().stats().await;
    Json(serde_json::json!({
        "status": "ok",
        "model": state.model,
        "cache": stats,
    }))
}

pub fn router(state: AppState, settings: &Settings) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/diagram", post(diagram_handler))
        .route("/api/health", get(health_handler))
        .nest_service("/artifacts", ServeDir::new(settings.output_dir()))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn start_web_server(port: u16, pipeline: Arc<Pipeline>, settings: &Settings) -> Result<()> {
    let state = AppState::new(pipeline, settings)?;
    let app = router(state, settings);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Web server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind to address {}", addr))?;

    serve(listener, app.into_make_service())
        .await
        .context("Web server failed")?;

    Ok(())
}
