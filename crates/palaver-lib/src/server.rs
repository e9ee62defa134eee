//! HTTP API for the palaver relay.
//!
//! CORS-permissive so an embedded widget on any origin can call it. Voice
//! payloads arrive base64-encoded inside JSON, hence the large body limit.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

use palaver_core::types::{
    ErrorResponse, HealthResponse, SpeechRequest, SpeechResponse, TextTurnRequest,
    TextTurnResponse, ThreadResponse, VoiceTurnRequest, VoiceTurnResponse, WidgetConfig,
};
use palaver_core::validate::{self, ValidationError};

use crate::error::TurnError;
use crate::orchestrator::TurnOrchestrator;

pub const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<TurnOrchestrator>,
    widget: Arc<WidgetConfig>,
    started: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<TurnOrchestrator>, widget: WidgetConfig) -> Self {
        Self {
            orchestrator,
            widget: Arc::new(widget),
            started: Instant::now(),
        }
    }
}

/// Build the axum router over a shared [`TurnOrchestrator`].
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/turn/text", post(text_turn))
        .route("/turn/voice", post(voice_turn))
        .route("/speech", post(speech))
        .route("/thread", post(create_thread))
        .route("/config", get(config))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Errors ───────────────────────────────────────────────────────────────

/// An error response. Remote failure details stay in the log; callers only
/// see a generic message.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.into(),
                details: Vec::new(),
            },
        }
    }

    fn bad_request(detail: String) -> Self {
        let mut err = Self::new(StatusCode::BAD_REQUEST, "Validation error");
        err.body.details.push(detail);
        err
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let mut err = Self::bad_request(rejection.body_text());
        err.status = rejection.status();
        err
    }
}

impl From<TurnError> for ApiError {
    fn from(err: TurnError) -> Self {
        match err {
            TurnError::Validation(e) => e.into(),
            TurnError::RunTimeout { .. } => {
                warn!("turn timed out: {err}");
                Self::new(
                    StatusCode::GATEWAY_TIMEOUT,
                    "Assistant did not respond in time",
                )
            }
            TurnError::Cancelled => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down")
            }
            TurnError::Transcription(_) => {
                error!("turn failed: {err}");
                Self::new(StatusCode::BAD_GATEWAY, "Failed to transcribe audio")
            }
            TurnError::Synthesis(_) => {
                error!("speech failed: {err}");
                Self::new(StatusCode::BAD_GATEWAY, "Failed to synthesize speech")
            }
            _ => {
                error!("turn failed: {err}");
                Self::new(StatusCode::BAD_GATEWAY, "Failed to process message")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ─── Handlers ─────────────────────────────────────────────────────────────

async fn text_turn(
    State(state): State<AppState>,
    payload: Result<Json<TextTurnRequest>, JsonRejection>,
) -> ApiResult<TextTurnResponse> {
    let Json(req) = payload?;
    let message = validate::message(&req.message)?;
    let thread = validate::thread_id(req.thread_id.as_deref())?;

    let turn = state.orchestrator.process_text_turn(&message, thread).await?;
    Ok(Json(TextTurnResponse {
        message: turn.reply,
        thread_id: turn.thread_id,
    }))
}

async fn voice_turn(
    State(state): State<AppState>,
    payload: Result<Json<VoiceTurnRequest>, JsonRejection>,
) -> ApiResult<VoiceTurnResponse> {
    let Json(req) = payload?;
    let audio = validate::audio_base64(&req.audio_base64)?;
    let thread = validate::thread_id(req.thread_id.as_deref())?;

    let turn = state.orchestrator.process_voice_turn(audio, thread).await?;
    Ok(Json(VoiceTurnResponse {
        transcription: turn.transcript,
        message: turn.reply,
        thread_id: turn.thread_id,
        audio_response: turn.reply_audio.map(|a| BASE64.encode(a)),
    }))
}

async fn speech(
    State(state): State<AppState>,
    payload: Result<Json<SpeechRequest>, JsonRejection>,
) -> ApiResult<SpeechResponse> {
    let Json(req) = payload?;
    let text = validate::speech_text(&req.text)?;

    let audio = state.orchestrator.synthesize_speech(text).await?;
    Ok(Json(SpeechResponse {
        audio: BASE64.encode(audio),
    }))
}

async fn create_thread(State(state): State<AppState>) -> ApiResult<ThreadResponse> {
    let thread_id = state.orchestrator.create_thread().await?;
    Ok(Json(ThreadResponse { thread_id }))
}

async fn config(State(state): State<AppState>) -> Json<WidgetConfig> {
    Json(state.widget.as_ref().clone())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        uptime_secs: state.started.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").into(),
    })
}
