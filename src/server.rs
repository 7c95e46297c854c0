//! HTTP upload surface.
//!
//! `GET /` describes the service and sweeps stale uploads, `GET /health`
//! reports liveness, and `POST /upload` accepts a multipart `file` field and
//! answers with the classification outcome as JSON.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{error, info, warn};
use serde::Serialize;

use crate::config::ServerConfig;
use crate::inference::{ClassificationOutcome, InferenceService};
use crate::uploads::{allowed_file, is_probably_audio, UploadStore, ALLOWED_EXTENSIONS};

/// Shared handler state; cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<InferenceService>,
    pub uploads: UploadStore,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(service: InferenceService, config: ServerConfig) -> std::io::Result<Self> {
        let uploads = UploadStore::new(config.upload_dir.clone())?;
        Ok(Self {
            service: Arc::new(service),
            uploads,
            config: Arc::new(config),
        })
    }

    fn max_upload_bytes(&self) -> usize {
        self.config.max_upload_mb * 1024 * 1024
    }
}

/// Plain-text error response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(e: impl std::fmt::Display) -> Self {
        error!("Upload handling failed: {}", e);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Internal server error".to_string(),
        }
    }

    fn from_multipart(e: MultipartError, max_mb: usize) -> Self {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self {
                status: StatusCode::PAYLOAD_TOO_LARGE,
                message: format!("File too large. Max {}MB", max_mb),
            }
        } else {
            Self {
                status: e.status(),
                message: e.body_text(),
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub model_loaded: bool,
    pub upload_field: &'static str,
    pub allowed_extensions: Vec<&'static str>,
    pub max_upload_mb: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub model_loaded: bool,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub filename: String,
    pub outcome: ClassificationOutcome,
}

/// GET /
async fn index(State(state): State<AppState>) -> Json<ServiceInfo> {
    let uploads = state.uploads.clone();
    let age = Duration::from_secs(state.config.cleanup_after_hours * 3600);
    match tokio::task::spawn_blocking(move || uploads.cleanup_older_than(age)).await {
        Ok(0) => {}
        Ok(removed) => info!("Removed {} stale uploads", removed),
        Err(e) => warn!("Upload cleanup did not finish: {}", e),
    }

    Json(ServiceInfo {
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        model_loaded: state.service.has_model(),
        upload_field: "file",
        allowed_extensions: ALLOWED_EXTENSIONS.to_vec(),
        max_upload_mb: state.config.max_upload_mb,
    })
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        model_loaded: state.service.has_model(),
    })
}

/// POST /upload
async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let max_mb = state.config.max_upload_mb;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::from_multipart(e, max_mb))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::from_multipart(e, max_mb))?;
        upload = Some((filename, data));
        break;
    }

    let Some((filename, data)) = upload else {
        return Err(ApiError::bad_request("No file part"));
    };
    if filename.trim().is_empty() {
        return Err(ApiError::bad_request("No selected file"));
    }
    if !allowed_file(&filename) {
        return Err(ApiError::bad_request(format!(
            "Only {} are allowed",
            ALLOWED_EXTENSIONS.join(", ")
        )));
    }

    let path = state
        .uploads
        .unique_save_path(&filename)
        .map_err(ApiError::internal)?;
    tokio::fs::write(&path, &data)
        .await
        .map_err(ApiError::internal)?;

    if !is_probably_audio(&path).unwrap_or(false) {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("Could not remove rejected upload {}: {}", path.display(), e);
        }
        return Err(ApiError::bad_request("Invalid audio file"));
    }

    info!("Stored upload {} ({} bytes)", path.display(), data.len());

    let service = Arc::clone(&state.service);
    let target = path.clone();
    let outcome = tokio::task::spawn_blocking(move || service.classify(&target))
        .await
        .unwrap_or_else(|e| ClassificationOutcome::Failed {
            message: format!("classification task failed: {}", e),
        });

    Ok(Json(UploadResponse {
        filename: stored_name(&path),
        outcome,
    }))
}

fn stored_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn build_router(state: AppState) -> Router {
    let limit = state.max_upload_bytes();
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/upload", post(upload))
        .layer(DefaultBodyLimit::max(limit))
        .with_state(state)
}

/// Binds `bind_addr` and serves until the process is stopped.
pub async fn serve(state: AppState, bind_addr: &str) -> std::io::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await
}
