//! HTTP surface: axum router over [`SynthesisService`].
//!
//! | Route                   | Handler            |
//! |-------------------------|--------------------|
//! | `GET /health`           | [`health`]         |
//! | `GET /voices`           | [`list_voices`]    |
//! | `POST /tts`             | [`generate_speech`]|
//! | `POST /clone`           | [`clone_voice`]    |
//! | `DELETE /voices/{name}` | [`delete_voice`]   |
//!
//! Every failure is a JSON body `{"error": <kind>, "detail": <message>}`
//! with the matching status code.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::VoiceError;
use crate::service::{SynthesisRequest, SynthesisService};

/// Size of the body chunks synthesized audio is streamed in.
const STREAM_CHUNK: usize = 64 * 1024;

type SharedService = Arc<SynthesisService>;

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router(service: SharedService, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/voices", get(list_voices))
        .route("/voices/{name}", delete(delete_voice))
        .route("/tts", post(generate_speech))
        .route("/clone", post(clone_voice))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // Browser front-ends call the API from any origin.
                .layer(CorsLayer::permissive()),
        )
        .with_state(service)
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError(VoiceError);

impl From<VoiceError> for ApiError {
    fn from(e: VoiceError) -> Self {
        Self(e)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    available: Option<Vec<String>>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            VoiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            VoiceError::NotFound { .. } => StatusCode::NOT_FOUND,
            VoiceError::SynthesisFailed(_)
            | VoiceError::Io { .. }
            | VoiceError::StartupFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let available = match &self.0 {
            VoiceError::NotFound { available, .. } => Some(available.clone()),
            _ => None,
        };
        let body = ErrorBody { error: self.0.kind(), detail: self.0.to_string(), available };
        (status, Json(body)).into_response()
    }
}

fn bad_request(detail: impl Into<String>) -> ApiError {
    ApiError(VoiceError::InvalidInput(detail.into()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Response bodies
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VoicesResponse {
    pub voices: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloneResponse {
    pub message: String,
    pub path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CloneParams {
    pub name: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

pub async fn health(State(service): State<SharedService>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        model: service.engine().model_id().to_string(),
    })
}

pub async fn list_voices(
    State(service): State<SharedService>,
) -> Result<Json<VoicesResponse>, ApiError> {
    let voices = service.with_registry(|r| r.list()).await?;
    Ok(Json(VoicesResponse { voices }))
}

/// `Content-Disposition` value; header values must stay visible ASCII.
fn attachment_header(filename: &str) -> String {
    let safe: String = filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("attachment; filename=\"{}\"", safe)
}

pub async fn generate_speech(
    State(service): State<SharedService>,
    request: Result<Json<SynthesisRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = request.map_err(|e| bad_request(e.body_text()))?;
    let result = service.synthesize(&request).await?;

    let len = result.audio.len();
    let audio = Bytes::from(result.audio);
    let chunks = (0..len)
        .step_by(STREAM_CHUNK)
        .map(move |start| Ok::<_, Infallible>(audio.slice(start..(start + STREAM_CHUNK).min(len))));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, result.content_type.to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
            (header::CONTENT_DISPOSITION, attachment_header(&result.filename)),
        ],
        Body::from_stream(tokio_stream::iter(chunks)),
    )
        .into_response())
}

pub async fn clone_voice(
    State(service): State<SharedService>,
    params: Result<Query<CloneParams>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<CloneResponse>, ApiError> {
    let Query(params) = params.map_err(|e| bad_request(e.body_text()))?;
    let mut multipart = multipart.map_err(|e| bad_request(e.body_text()))?;
    let mut name = params.name;
    let mut audio: Option<(String, Bytes)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "name" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| bad_request(format!("name read error: {e}")))?;
                if name.is_none() {
                    name = Some(value);
                }
            }
            "audio" => {
                let filename = field.file_name().unwrap_or("").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("audio read error: {e}")))?;
                audio = Some((filename, bytes));
            }
            _ => {}
        }
    }

    let name = name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| bad_request("voice name is required"))?;
    let (filename, bytes) = audio.ok_or_else(|| bad_request("audio file is required"))?;

    let voice = name.clone();
    let stored = service
        .with_registry(move |r| r.register(&voice, &filename, &bytes))
        .await?
        .map_err(|e| {
            error!(voice = %name, "error cloning voice: {e}");
            ApiError(e)
        })?;

    info!(voice = %name, bytes = stored.size_bytes, "voice cloned");
    Ok(Json(CloneResponse {
        message: format!("Voice '{}' cloned successfully!", name),
        path: stored.path.display().to_string(),
        size_bytes: stored.size_bytes,
    }))
}

pub async fn delete_voice(
    State(service): State<SharedService>,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let voice = name.clone();
    service.with_registry(move |r| r.unregister(&voice)).await??;
    info!(voice = %name, "voice deleted");
    Ok(Json(MessageResponse { message: format!("Voice '{}' deleted successfully", name) }))
}
