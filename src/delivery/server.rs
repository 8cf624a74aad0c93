//! Local preview server polled by the consumer.
//!
//! Serves whatever [`ModelStore`] holds and accepts pushed models on
//! `/upload-model`, so an exporter on another machine can deliver here.

use super::upload::METADATA_HEADER;
use super::{minimal_metadata, ModelStore};
use crate::error::Result;
use crate::host::SharedState;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Largest accepted upload.
pub const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// State shared by every handler.
#[derive(Clone)]
pub struct ServerState {
    pub store: Arc<ModelStore>,
    pub shared: Arc<SharedState>,
}

impl ServerState {
    pub fn new(store: Arc<ModelStore>, shared: Arc<SharedState>) -> Self {
        Self { store, shared }
    }
}

/// Build the router.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/latest-model", get(latest_model))
        .route("/latest-model-info", get(latest_model_info))
        .route("/upload-model", post(upload_model))
        .route("/user-info", get(user_info))
        .route("/connect-user", post(connect_user))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `addr` and serve until the process exits.
pub async fn serve(addr: SocketAddr, state: ServerState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Preview server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn ping() -> &'static str {
    "pong"
}

async fn latest_model(State(state): State<ServerState>) -> Response {
    match state.store.latest() {
        Some(model) => (
            [(header::CONTENT_TYPE, "model/gltf-binary")],
            model.payload.as_ref().clone(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "No model available").into_response(),
    }
}

async fn latest_model_info(State(state): State<ServerState>) -> Response {
    match state.store.latest_metadata() {
        Some(metadata) => Json(metadata).into_response(),
        None => (StatusCode::NOT_FOUND, "No model metadata available").into_response(),
    }
}

fn parse_metadata_header(headers: &HeaderMap) -> std::result::Result<Option<Value>, String> {
    let Some(value) = headers.get(METADATA_HEADER) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(value.as_bytes()).map_err(|e| format!("metadata is not UTF-8: {}", e))?;
    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| format!("metadata is not valid JSON: {}", e))
}

async fn upload_model(State(state): State<ServerState>, headers: HeaderMap, body: Bytes) -> Response {
    let metadata = match parse_metadata_header(&headers) {
        Ok(Some(metadata)) => metadata,
        Ok(None) => minimal_metadata(body.len()),
        Err(e) => {
            warn!(error = %e, "Rejected upload");
            return (StatusCode::BAD_REQUEST, e).into_response();
        }
    };
    info!(size = body.len(), "Received model upload");
    state.store.store(body.to_vec(), metadata);
    Json(json!({ "success": true })).into_response()
}

async fn user_info(State(state): State<ServerState>) -> Response {
    match state.shared.snapshot().user {
        Some(user) => Json(user).into_response(),
        None => (StatusCode::NOT_FOUND, "No user connected").into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ConnectUser {
    name: String,
    #[serde(default)]
    email: String,
}

async fn connect_user(State(state): State<ServerState>, Json(request): Json<ConnectUser>) -> Response {
    let user = state.shared.connect_user(request.name, request.email);
    info!(user = %user.name, "User connected");
    Json(json!({ "success": true })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<ModelStore>, Arc<SharedState>) {
        let store = ModelStore::new();
        let shared = SharedState::new();
        let router = router(ServerState::new(Arc::clone(&store), Arc::clone(&shared)));
        (router, store, shared)
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    #[tokio::test]
    async fn test_ping() {
        let (app, _, _) = app();
        let response = app
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"pong");
    }

    #[tokio::test]
    async fn test_latest_model_empty_is_404() {
        let (app, _, _) = app();
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/latest-model").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = app
            .oneshot(Request::builder().uri("/latest-model-info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upload_then_poll() {
        let (app, store, _) = app();
        let metadata = r#"{"filename":"crate.glb","summary":["Decimated 1 objects • 90%"]}"#;
        let request = Request::builder()
            .method("POST")
            .uri("/upload-model")
            .header(METADATA_HEADER, axum::http::HeaderValue::from_bytes(metadata.as_bytes()).unwrap())
            .body(Body::from(vec![1u8, 2, 3]))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.latest_metadata().unwrap()["filename"], "crate.glb");

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/latest-model").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "model/gltf-binary");
        assert_eq!(body_bytes(response).await, vec![1, 2, 3]);

        let response = app
            .oneshot(Request::builder().uri("/latest-model-info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let info: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(info["summary"][0], "Decimated 1 objects • 90%");
    }

    #[tokio::test]
    async fn test_upload_without_metadata_synthesizes_it() {
        let (app, store, _) = app();
        let request = Request::builder()
            .method("POST")
            .uri("/upload-model")
            .body(Body::from(vec![0u8; 10]))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let metadata = store.latest_metadata().unwrap();
        assert_eq!(metadata["filename"], "model.glb");
        assert_eq!(metadata["size"], 10);
        assert!(metadata["timestamp"].is_null());
    }

    #[tokio::test]
    async fn test_upload_with_bad_metadata_is_rejected() {
        let (app, store, _) = app();
        let request = Request::builder()
            .method("POST")
            .uri("/upload-model")
            .header(METADATA_HEADER, "{not json")
            .body(Body::from(vec![0u8; 4]))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_connect_user() {
        let (app, _, shared) = app();
        let request = Request::builder()
            .method("POST")
            .uri("/connect-user")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"name":"Ada","email":"ada@example.com"}"#))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(shared.snapshot().user.unwrap().email, "ada@example.com");

        let response = app
            .oneshot(Request::builder().uri("/user-info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let user: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(user["name"], "Ada");
        assert!(user["connected_at"].is_string());
    }
}
