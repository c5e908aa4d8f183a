//! Axum server for the Claims Processing API.

use super::{ClaimProcessRequest, ClaimProcessResponse, HealthResponse};
use crate::config::ServerConfig;
use crate::workflow::ClaimWorkflow;
use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Multipart, State,
        multipart::{MultipartError, MultipartRejection},
        rejection::JsonRejection,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

/// Shared state for request handlers.
#[derive(Clone)]
pub struct AppState {
    workflow: Arc<ClaimWorkflow>,
}

impl AppState {
    pub fn new(workflow: Arc<ClaimWorkflow>) -> Self {
        Self { workflow }
    }
}

/// An error answered as `{"detail": "..."}`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn internal(err: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: err.to_string(),
        }
    }

    fn unprocessable(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            detail: detail.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            detail: rejection.body_text(),
        }
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        Self {
            status: rejection.status(),
            detail: rejection.body_text(),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self {
            status: err.status(),
            detail: err.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "detail": self.detail })),
        )
            .into_response()
    }
}

/// Build the API router.
pub fn router(state: AppState, config: &ServerConfig) -> Router {
    let app = Router::new()
        .route("/", get(health_handler))
        .route("/health", get(health_handler))
        .route("/process-claim/upload", post(upload_handler))
        .route("/process-claim/base64", post(base64_handler))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    if config.allow_cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}

async fn upload_handler(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ClaimProcessResponse>, ApiError> {
    let mut multipart = multipart?;
    let mut upload: Option<(String, Bytes)> = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or("upload").to_string();
            let data = field.bytes().await?;
            upload = Some((filename, data));
            break;
        }
    }
    let Some((filename, data)) = upload else {
        return Err(ApiError::unprocessable("Field 'file' is required"));
    };

    info!(filename = %filename, bytes = data.len(), "Received claim image upload");
    process_bytes(&state, &filename, &data).await.map(Json)
}

async fn base64_handler(
    State(state): State<AppState>,
    request: Result<Json<ClaimProcessRequest>, JsonRejection>,
) -> Result<Json<ClaimProcessResponse>, ApiError> {
    let Json(request) = request?;
    info!(filename = %request.filename, "Received base64 claim image");
    let data = BASE64
        .decode(request.image_base64.trim())
        .map_err(|e| ApiError::internal(format!("Invalid base64 image data: {e}")))?;
    process_bytes(&state, &request.filename, &data).await.map(Json)
}

/// Stage the image in a temp file that keeps its extension, then run the workflow.
async fn process_bytes(
    state: &AppState,
    filename: &str,
    data: &[u8],
) -> Result<ClaimProcessResponse, ApiError> {
    let request_id = Uuid::new_v4();
    let suffix = Path::new(filename)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let staged = tempfile::Builder::new()
        .prefix("claim-")
        .suffix(&suffix)
        .tempfile()
        .map_err(ApiError::internal)?;
    tokio::fs::write(staged.path(), data)
        .await
        .map_err(ApiError::internal)?;
    info!(%request_id, path = %staged.path().display(), "Saved to temporary file");

    let result = state.workflow.process(staged.path()).await.map_err(|e| {
        error!(%request_id, error = %e, "Error processing claim");
        ApiError::internal(e)
    })?;
    drop(staged);

    let response = ClaimProcessResponse::from_result(result);
    match &response.error {
        Some(err) => error!(%request_id, error = %err, "Workflow error"),
        None => info!(%request_id, "Successfully processed claim"),
    }
    Ok(response)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

/// Serve the API on `config.host:config.port` until Ctrl-C or SIGTERM.
pub async fn run(config: &ServerConfig, workflow: Arc<ClaimWorkflow>) -> std::io::Result<()> {
    let app = router(AppState::new(workflow), config);
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    info!(addr = %listener.local_addr()?, "Starting Claims Processing API");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::MockOcrEngine;
    use crate::providers::MockLlmProvider;
    use crate::structuring::JsonStructurer;
    use axum::body::Body;
    use tower::ServiceExt;

    fn test_router(ocr_text: &str, llm_reply: &str) -> Router {
        let workflow = ClaimWorkflow::new(
            Arc::new(MockOcrEngine::with_text(ocr_text)),
            JsonStructurer::new(Arc::new(MockLlmProvider::with_response(llm_reply))),
        );
        router(
            AppState::new(Arc::new(workflow)),
            &ServerConfig::default(),
        )
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 1_000_000)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_root_and_health() {
        for uri in ["/", "/health"] {
            let app = test_router("", "{}");
            let req = axum::http::Request::builder()
                .uri(uri)
                .body(Body::empty())
                .unwrap();
            let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
            let json = body_json(resp).await;
            assert_eq!(json["status"], "healthy");
            assert_eq!(json["service"], "Claims Processing API");
            assert_eq!(json["version"], "1.0.0");
        }
    }

    #[tokio::test]
    async fn test_base64_route_processes_claim() {
        let app = test_router(
            "Honda Civic rear bumper",
            r#"{"vehicle_info":{"make":"Honda","model":"Civic"}}"#,
        );
        let body = serde_json::json!({"image_base64": BASE64.encode(b"fake-jpeg")});
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/process-claim/base64")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let json = body_json(resp).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["vehicle_info"]["make"], "Honda");
        assert_eq!(json["data"]["metadata"]["ocr_characters"], 23);
        let source = json["data"]["metadata"]["source_image"].as_str().unwrap();
        assert!(source.ends_with(".jpg"));
        assert!(!Path::new(source).exists());
    }

    #[tokio::test]
    async fn test_base64_route_missing_field_is_json_422() {
        let app = test_router("", "{}");
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/process-claim/base64")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"filename":"a.jpg"}"#))
            .unwrap();
        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
            .await
            .unwrap();
        assert_eq!(resp.status(), 422);
        assert_eq!(
            resp.headers()["content-type"].to_str().unwrap(),
            "application/json"
        );
        let json = body_json(resp).await;
        assert!(json["detail"].as_str().unwrap().contains("image_base64"));
    }

    #[tokio::test]
    async fn test_base64_route_malformed_json_is_detail() {
        let app = test_router("", "{}");
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/process-claim/base64")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let json = body_json(resp).await;
        assert!(json["detail"].is_string());
    }

    #[tokio::test]
    async fn test_upload_without_multipart_content_type_is_detail() {
        let app = test_router("", "{}");
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/process-claim/upload")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
        let json = body_json(resp).await;
        assert!(json["detail"].is_string());
    }

    #[tokio::test]
    async fn test_base64_route_rejects_bad_encoding() {
        let app = test_router("", "{}");
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/process-claim/base64")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"image_base64":"***not base64***"}"#))
            .unwrap();
        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        let json = body_json(resp).await;
        assert!(
            json["detail"]
                .as_str()
                .unwrap()
                .starts_with("Invalid base64 image data")
        );
    }
}
