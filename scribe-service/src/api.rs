//! HTTP API for the Scribe service.
//!
//! - `GET /` service description
//! - `GET /api/health` capability status
//! - `POST /api/process` multipart batch upload answered with an NDJSON event stream
//! - `GET /metrics` Prometheus exposition

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::pipeline::DocumentJob;
use crate::service::ScribeService;

const NDJSON: &str = "application/x-ndjson; charset=utf-8";
const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Multipart field carrying the documents
const FILES_FIELD: &str = "files";

/// Application state
pub struct AppState {
    pub service: Arc<ScribeService>,
    pub metrics: Option<PrometheusHandle>,
}

/// Build the API router
pub fn router(service: Arc<ScribeService>, metrics: Option<PrometheusHandle>) -> Router {
    let cors = cors_layer(&service.settings.server);
    let max_body_size = service.settings.limits.max_batch_bytes as usize;

    let state = Arc::new(AppState { service, metrics });

    let api_routes = Router::new()
        .route("/health", get(health_handler))
        .route(
            "/process",
            post(process_handler).layer(DefaultBodyLimit::max(max_body_size)),
        );

    Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .nest("/api", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(server: &ServerConfig) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if server.cors_origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = server
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    info!(origins = ?server.cors_origins, "CORS enabled");
    layer.allow_origin(AllowOrigin::list(origins))
}

// === Root & Health ===

#[derive(Serialize)]
struct RootResponse {
    name: &'static str,
    version: &'static str,
    description: &'static str,
    endpoints: Endpoints,
}

#[derive(Serialize)]
struct Endpoints {
    health: &'static str,
    process: &'static str,
    metrics: &'static str,
}

async fn root_handler() -> Json<RootResponse> {
    Json(RootResponse {
        name: "Scribe Document Processing API",
        version: env!("CARGO_PKG_VERSION"),
        description: env!("CARGO_PKG_DESCRIPTION"),
        endpoints: Endpoints {
            health: "/api/health",
            process: "/api/process (POST)",
            metrics: "/metrics",
        },
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    timestamp: String,
    ocr_available: bool,
    ai_available: bool,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let availability = state.service.availability().await;

    Json(HealthResponse {
        status: if availability.is_healthy() {
            "healthy"
        } else {
            "degraded"
        },
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
        ocr_available: availability.ocr,
        ai_available: availability.ai,
    })
}

// === Processing ===

async fn process_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> ServiceResult<Response> {
    let jobs = read_jobs(multipart).await?;
    if jobs.is_empty() {
        return Err(ServiceError::InvalidRequest {
            message: "No files provided".to_string(),
        });
    }
    info!(files = jobs.len(), "Batch received");

    let events = state.service.process_batch(jobs);
    let lines = ReceiverStream::new(events).map(|event| event.to_line());

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(NDJSON)),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-cache, no-transform"),
            ),
            (X_ACCEL_BUFFERING, HeaderValue::from_static("no")),
        ],
        Body::from_stream(lines),
    )
        .into_response())
}

/// Collect every `files` part in upload order
async fn read_jobs(mut multipart: Multipart) -> ServiceResult<Vec<DocumentJob>> {
    let mut jobs = Vec::new();

    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| ServiceError::InvalidRequest {
                message: e.body_text(),
            })?;
        let Some(field) = field else {
            break;
        };
        if field.name() != Some(FILES_FIELD) {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ServiceError::InvalidRequest {
                message: e.body_text(),
            })?;
        jobs.push(DocumentJob::new(jobs.len(), filename, bytes));
    }

    Ok(jobs)
}

// === Metrics ===

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LlmConfig, Settings};
    use crate::fields::FieldExtractor;
    use crate::llm::testing::FakeModel;
    use crate::ocr::TextExtractor;
    use crate::ocr::testing::ScriptedProvider;
    use crate::pipeline::StreamEvent;
    use crate::rasterize::testing::HeaderOnlyRasterizer;
    use crate::store::CsvStore;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_service(dir: &tempfile::TempDir) -> Arc<ScribeService> {
        let extractor = TextExtractor::new(Arc::new(ScriptedProvider::always_text(
            "vision",
            "Name: Ivan Sanchez\nCDCR# BK8702",
        )));
        let fields = FieldExtractor::new(Arc::new(FakeModel::cooperative()), LlmConfig::default());
        Arc::new(ScribeService::from_parts(
            Settings::default(),
            Arc::new(HeaderOnlyRasterizer),
            Arc::new(extractor),
            Arc::new(fields),
            CsvStore::new(dir.path().join("extracted.csv")),
        ))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_service(&dir), None);

        let response = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["ocr_available"], true);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_root_lists_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_service(&dir), None);

        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["endpoints"]["process"], "/api/process (POST)");
    }

    #[tokio::test]
    async fn test_process_without_files_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_service(&dir), None);

        let boundary = "scribe-boundary";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n--{boundary}--\r\n"
        );
        let request = Request::post("/api/process")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["code"], "invalid_request");
    }

    #[tokio::test]
    async fn test_process_streams_events_to_client() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_service(&dir), None);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let base_url = format!("http://{}", addr);
        let response = reqwest::Client::new()
            .post(format!("{}/api/process", base_url))
            .multipart(reqwest::multipart::Form::new().part(
                "files",
                reqwest::multipart::Part::bytes(b"%PDF-1.7".to_vec()).file_name("a.pdf"),
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], NDJSON);
        assert_eq!(response.headers()["x-accel-buffering"], "no");
        drop(response);

        let mut kinds = Vec::new();
        let summary = crate::client::submit(
            &base_url,
            vec![
                ("good.pdf".to_string(), b"%PDF-1.7 letter".to_vec()),
                ("broken.pdf".to_string(), Vec::new()),
            ],
            |event, _| {
                kinds.push(match event {
                    StreamEvent::Progress { .. } => "progress",
                    StreamEvent::Result { .. } => "result",
                    StreamEvent::Complete { .. } => "complete",
                })
            },
        )
        .await
        .unwrap();

        assert_eq!(
            kinds,
            ["progress", "result", "progress", "result", "complete"]
        );
        assert_eq!((summary.total_files, summary.processed, summary.failed), (2, 1, 1));
        assert_eq!(summary.results[0].filename, "good.pdf");
        assert!(summary.results[0].data.is_some());
    }
}
