//! Upload server routing, validation and response shapes.

mod common;

use std::path::Path;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;
use voice_tamper_detector::config::ServerConfig;
use voice_tamper_detector::server::{build_router, AppState};
use voice_tamper_detector::{FeatureConfig, FeatureExtractor, InferenceService};

use common::{tone, wav_bytes};

const BOUNDARY: &str = "X-VOICE-TAMPER-BOUNDARY";

fn test_app(upload_dir: &Path, max_upload_mb: usize) -> Router {
    let service = InferenceService::new(FeatureExtractor::new(FeatureConfig::default()).unwrap(), None).unwrap();
    let config = ServerConfig {
        upload_dir: upload_dir.to_path_buf(),
        max_upload_mb,
        ..Default::default()
    };
    build_router(AppState::new(service, config).unwrap())
}

fn multipart_body(field: &str, filename: &str, data: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn upload_request(body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/upload")
        .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_text(response: axum::response::Response) -> String {
    String::from_utf8(body_bytes(response).await).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn health_reports_missing_model() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path(), 10);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["model_loaded"], false);
}

#[tokio::test]
async fn index_describes_the_service() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path(), 10);

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["service"], "voice_tamper_detector");
    assert_eq!(json["upload_field"], "file");
    assert_eq!(json["max_upload_mb"], 10);
    assert_eq!(json["allowed_extensions"], serde_json::json!(["m4a", "mp3", "wav"]));
}

#[tokio::test]
async fn upload_without_file_part_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path(), 10);

    let response = app
        .oneshot(upload_request(multipart_body("other", "clip.wav", b"data")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "No file part");
}

#[tokio::test]
async fn upload_with_empty_filename_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path(), 10);

    let response = app
        .oneshot(upload_request(multipart_body("file", "", b"data")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "No selected file");
}

#[tokio::test]
async fn upload_with_bad_extension_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path(), 10);

    let response = app
        .oneshot(upload_request(multipart_body("file", "clip.flac", b"data")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "Only m4a, mp3, wav are allowed");
}

#[tokio::test]
async fn upload_that_is_not_audio_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path(), 10);
    let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    let response = app
        .oneshot(upload_request(multipart_body("file", "picture.wav", &png)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "Invalid audio file");

    let leftovers = walkdir::WalkDir::new(dir.path())
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn oversized_upload_gets_413() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path(), 1);

    let response = app
        .oneshot(upload_request(multipart_body("file", "big.wav", &vec![0u8; 2 * 1024 * 1024])))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body_text(response).await, "File too large. Max 1MB");
}

#[tokio::test]
async fn valid_upload_without_model_reports_no_model() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path(), 10);
    let wav = wav_bytes(&tone(440.0, 1.0));

    let response = app
        .oneshot(upload_request(multipart_body("file", "my clip.wav", &wav)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    let filename = json["filename"].as_str().unwrap();
    assert!(filename.ends_with("__my_clip.wav"), "{filename}");
    assert_eq!(json["outcome"]["status"], "no_model");
    assert_eq!(json["outcome"]["message"], "No model found. Please run training first");
}

#[tokio::test]
async fn undecodable_upload_reports_failure_not_crash() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path(), 10);

    let response = app
        .oneshot(upload_request(multipart_body("file", "noise.mp3", b"plain text, not audio")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["outcome"]["status"], "failed");
}
