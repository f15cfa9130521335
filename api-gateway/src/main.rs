// ==============================================================================
// main.rs - Ingest API Gateway Entry Point
// ==============================================================================
// Description: Axum web server for chunked uploads and processing tasks
// Author: Matt Barham
// Created: 2026-10-17
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, Method},
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod handlers;
mod middleware;
mod models;
mod state;

use state::AppState;

/// Multipart framing and text fields on top of the chunk itself
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting Ingest API Gateway v{}", env!("CARGO_PKG_VERSION"));

    let server_port: u16 = match std::env::var("PORT") {
        Ok(port) => port.parse().context("PORT must be a valid port number")?,
        Err(_) => 8099,
    };

    // Initialize application state
    let state = AppState::new()
        .await
        .context("Failed to initialize application state")?;

    let eviction = spawn_session_eviction(state.clone());

    // Build router with all endpoints
    let app = build_router(state);

    // Bind server
    let addr = SocketAddr::from(([0, 0, 0, 0], server_port));
    info!("API Gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    // Run server
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    eviction.abort();
    info!("API Gateway stopped");
    Ok(())
}

fn build_router(state: AppState) -> Router {
    let body_limit = state.config().upload.max_chunk_bytes + MULTIPART_OVERHEAD;

    // API routes
    let api_routes = Router::new()
        // Chunked uploads
        .route("/uploads/chunk", post(handlers::upload_chunk))
        .route("/uploads/content", post(handlers::upload_content))
        .route("/uploads/abandon", post(handlers::abandon_upload))
        // Processing tasks
        .route("/tasks", post(handlers::create_task))
        .route("/tasks/{id}", get(handlers::get_task))
        .route("/tasks/{id}/cancel", put(handlers::cancel_task));

    // Origins are configured via CORS_ALLOWED_ORIGINS env var (comma-separated)
    let cors_origins = std::env::var("CORS_ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000".to_string());
    let allowed_origins: Vec<_> = cors_origins
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_credentials(false)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static("x-user-id"),
        ])
        .expose_headers([header::CONTENT_TYPE]);

    // Combine all routes
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .nest("/api", api_routes)
        .layer(
            ServiceBuilder::new()
                // Request tracing
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                // One chunk per request
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .with_state(state)
}

/// Drop upload sessions idle longer than the configured timeout
async fn evict_idle_sessions(state: &AppState, max_idle: Duration) -> usize {
    state.sessions().evict_idle(max_idle).await
}

fn spawn_session_eviction(state: AppState) -> JoinHandle<()> {
    let interval = state.config().upload.eviction_interval;
    let max_idle = state.config().upload.session_idle_timeout;
    info!(
        "Evicting upload sessions idle for {:?} every {:?}",
        max_idle, interval
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            evict_idle_sessions(&state, max_idle).await;
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use ingest_core::hasher::digest_hex;
    use ingest_core::memory::MemoryRepository;
    use ingest_core::models::{NewMergedFile, SessionKey};
    use ingest_core::repository::FileRepository;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "ingest-test-boundary";

    fn multipart(fields: &[(&str, String)], file: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, name, value
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"blob\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n",
                BOUNDARY
            )
            .as_bytes(),
        );
        body.extend_from_slice(file);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri("/api/uploads/chunk")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn chunk_request(file_name: &str, index: i64, total: i64, data: &[u8]) -> Request<Body> {
        multipart(
            &[
                ("projectId", "3".to_string()),
                ("userId", "8".to_string()),
                ("fileName", file_name.to_string()),
                ("index", index.to_string()),
                ("totalChunks", total.to_string()),
            ],
            data,
        )
    }

    fn json_request(method: &str, uri: &str, user: Option<i64>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(user) = user {
            builder = builder.header("X-User-Id", user.to_string());
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_request(uri: &str, user: i64) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("X-User-Id", user.to_string())
            .body(Body::empty())
            .unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn setup() -> (TempDir, AppState, Arc<MemoryRepository>, Router) {
        let dir = TempDir::new().unwrap();
        let (state, repo) = AppState::in_memory(dir.path());
        let app = build_router(state.clone());
        (dir, state, repo, app)
    }

    async fn stored_file(repo: &MemoryRepository, project_id: i64, size: u64) -> i64 {
        repo.insert_file(NewMergedFile {
            project_id: Some(project_id),
            user_id: Some(8),
            file_name: format!("input_{}.h5ad", size),
            file_path: format!("/data/{}/{}.h5ad", project_id, size),
            file_size: size,
            digest: digest_hex(&size.to_le_bytes()),
        })
        .await
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_merge() {
        let (_dir, state, repo, app) = setup();
        let chunks = [vec![1u8; 1000], vec![2u8; 1000], vec![3u8; 500]];

        let (status, body) = send(&app, chunk_request("cells.h5ad", 1, 3, &chunks[1])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "accepted");

        let (_, body) = send(&app, chunk_request("cells.h5ad", 0, 3, &chunks[0])).await;
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["receivedChunks"], 2);

        let (status, body) = send(&app, chunk_request("cells.h5ad", 2, 3, &chunks[2])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["file"]["file_size"], 2500);
        assert_eq!(body["file"]["digest"], digest_hex(&chunks.concat()));
        assert_eq!(body["file"]["project_id"], 3);

        assert_eq!(state.sessions().session_count(), 0);
        assert_eq!(repo.files().len(), 1);
    }

    #[tokio::test]
    async fn test_negative_index_rejected_without_session() {
        let (_dir, state, _repo, app) = setup();

        let (status, body) = send(&app, chunk_request("cells.h5ad", -1, 3, b"data")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("invalid chunk metadata"));

        let (status, _) = send(&app, chunk_request("cells.h5ad", 3, 3, b"data")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert_eq!(state.sessions().session_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_and_conflicting_chunks() {
        let (_dir, _state, _repo, app) = setup();

        send(&app, chunk_request("reads.fastq.gz", 0, 2, b"first")).await;

        let (status, body) = send(&app, chunk_request("reads.fastq.gz", 0, 2, b"first")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "duplicate");

        let (status, _) = send(&app, chunk_request("reads.fastq.gz", 0, 2, b"other")).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_missing_fields_are_bad_requests() {
        let (_dir, _state, _repo, app) = setup();

        let request = multipart(
            &[("projectId", "3".to_string()), ("userId", "8".to_string())],
            b"data",
        );
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing index");
    }

    #[tokio::test]
    async fn test_content_route_names_file_by_digest() {
        let (_dir, _state, repo, app) = setup();
        let data = b"content addressed payload".to_vec();

        let mut request = multipart(
            &[
                ("md5", "9E107D9D372BB6826BD81D3542A419D6".to_string()),
                ("index", "0".to_string()),
                ("totalChunks", "1".to_string()),
                ("fileExtension", "csv.gz".to_string()),
            ],
            &data,
        );
        *request.uri_mut() = "/api/uploads/content".parse().unwrap();

        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");

        let path = body["file"]["file_path"].as_str().unwrap();
        assert!(path.ends_with(&format!("{}.csv.gz", digest_hex(&data))));
        assert!(body["file"]["project_id"].is_null());
        assert_eq!(repo.files().len(), 1);
    }

    #[tokio::test]
    async fn test_abandon_upload() {
        let (_dir, state, _repo, app) = setup();
        send(&app, chunk_request("cells.h5ad", 0, 2, b"half")).await;
        assert_eq!(state.sessions().session_count(), 1);

        let abandon = json!({"projectId": 3, "userId": 8, "fileName": "cells.h5ad"});
        let (status, body) = send(&app, json_request("POST", "/api/uploads/abandon", None, abandon.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["abandoned"], true);
        assert_eq!(state.sessions().session_count(), 0);

        let (_, body) = send(&app, json_request("POST", "/api/uploads/abandon", None, abandon)).await;
        assert_eq!(body["abandoned"], false);
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let (_dir, _state, repo, app) = setup();
        let first = stored_file(&repo, 3, 1024).await;
        let second = stored_file(&repo, 3, 2048).await;

        let create = json!({
            "projectId": 3,
            "fileIds": [first, second, first],
            "taskType": "cluster",
            "name": "nightly",
            "dataFormat": 2,
            "priority": 1
        });
        let (status, task) = send(&app, json_request("POST", "/api/tasks", Some(8), create)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(task["status"], "pending");
        assert_eq!(task["totalSize"], 3072);
        assert_eq!(task["fileIds"].as_array().unwrap().len(), 2);

        let id = task["id"].as_i64().unwrap();
        let (status, fetched) = send(&app, get_request(&format!("/api/tasks/{}", id), 8)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["progress"], 0);

        let (status, _) = send(&app, get_request(&format!("/api/tasks/{}", id), 9)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let cancel = format!("/api/tasks/{}/cancel", id);
        let (status, _) = send(&app, json_request("PUT", &cancel, Some(9), Value::Null)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, cancelled) = send(&app, json_request("PUT", &cancel, Some(8), Value::Null)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["status"], "cancelled");

        let (status, _) = send(&app, json_request("PUT", &cancel, Some(8), Value::Null)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_task_creation_rejections() {
        let (_dir, _state, repo, app) = setup();
        let file = stored_file(&repo, 3, 512).await;
        let other_project = stored_file(&repo, 4, 256).await;

        let body = |file_ids: Vec<i64>, data_format: i32| {
            json!({
                "projectId": 3,
                "fileIds": file_ids,
                "taskType": "cluster",
                "name": "run",
                "dataFormat": data_format
            })
        };

        let (status, _) = send(&app, json_request("POST", "/api/tasks", None, body(vec![file], 0))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&app, json_request("POST", "/api/tasks", Some(8), body(vec![file], 7))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, err) = send(
            &app,
            json_request("POST", "/api/tasks", Some(8), body(vec![file, other_project], 0)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(err["error"].as_str().unwrap().contains(&other_project.to_string()));

        let (status, _) = send(&app, get_request("/api/tasks/999", 8)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let (_dir, _state, _repo, app) = setup();

        let (status, body) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&app, Request::get("/ready").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
    }

    #[tokio::test]
    async fn test_idle_sessions_are_evicted() {
        let (dir, state, _repo, app) = setup();
        send(&app, chunk_request("cells.h5ad", 0, 2, b"half")).await;

        assert_eq!(evict_idle_sessions(&state, Duration::from_secs(3600)).await, 0);
        assert_eq!(evict_idle_sessions(&state, Duration::ZERO).await, 1);
        assert_eq!(state.sessions().session_count(), 0);
        let key = SessionKey::project(3, 8, "cells.h5ad").unwrap();
        assert!(!state.sessions().store().staging_dir(&key).exists());
        assert!(dir.path().join("chunks").read_dir().unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_unicode_file_names_upload_separately() {
        let (_dir, _state, repo, app) = setup();

        let (_, first) = send(&app, chunk_request("样本A.h5ad", 0, 1, b"first sample")).await;
        let (status, second) = send(&app, chunk_request("数据A.h5ad", 0, 1, b"second sample")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["status"], "completed");
        assert_eq!(second["status"], "completed");
        assert_eq!(first["file"]["file_name"], "样本A.h5ad");
        assert!(first["file"]["file_path"].as_str().unwrap().ends_with(".h5ad"));
        assert_eq!(repo.files().len(), 2);
    }

    #[tokio::test]
    async fn test_hidden_file_name_is_rejected() {
        let (_dir, state, _repo, app) = setup();

        let (status, _) = send(&app, chunk_request(".env", 0, 1, b"secret")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(state.sessions().session_count(), 0);
    }
}
