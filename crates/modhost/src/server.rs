//! HTTP transport: the gateway listener and the admin API
//!
//! The gateway converts every axum request into an SDK [`Request`] and hands
//! it to the module runtime. The admin API reports runtime status and
//! triggers reloads.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header::HeaderName, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::runtime::{ModuleRuntime, RuntimeError};

/// Shared application state
pub struct AppState {
    pub config: AppConfig,
    pub runtime: ModuleRuntime,
}

/// Create the gateway router that sends every request through the modules
pub fn create_gateway_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", any(handle_gateway_request))
        .route("/{*path}", any(handle_gateway_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Create the admin router
pub fn create_admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(runtime_status))
        .route("/reload", post(trigger_reload))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn runtime_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.runtime.status().await)
}

async fn trigger_reload(State(state): State<Arc<AppState>>) -> Response {
    match state.runtime.reload() {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "status": "reloading" }))).into_response(),
        Err(RuntimeError::ReloadInProgress) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "a reload is already in progress" })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Reload request failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

/// Build the SDK request from an axum request.
async fn into_sdk_request(request: Request<Body>, max_body_bytes: usize) -> Result<modhost_sdk::Request, Response> {
    let request_id = Uuid::new_v4().to_string();

    let query: HashMap<String, String> = request
        .uri()
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let headers: HashMap<String, String> = request
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();

    let client_ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty());

    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let body_bytes = match axum::body::to_bytes(request.into_body(), max_body_bytes).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(request_id = %request_id, "Failed to read body: {}", e);
            return Err((StatusCode::PAYLOAD_TOO_LARGE, "Failed to read body").into_response());
        }
    };

    let body = if body_bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&body_bytes).to_string())
    };

    let mut sdk_request = modhost_sdk::Request {
        method,
        path,
        query,
        headers,
        body,
        params: HashMap::new(),
        client_ip,
        request_id,
        site_host: None,
    };
    sdk_request.apply_method_override();
    Ok(sdk_request)
}

/// Convert an SDK response back into an axum response.
fn into_axum_response(response: modhost_sdk::Response) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);

    if let Some(headers) = builder.headers_mut() {
        for (key, value) in &response.headers {
            match (HeaderName::try_from(key.as_str()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!(header = %key, "Dropping invalid response header"),
            }
        }
    }

    match builder.body(Body::from(response.body.unwrap_or_default())) {
        Ok(response) => response,
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Failed to build response").into_response(),
    }
}

/// Handle an incoming gateway request
async fn handle_gateway_request(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let sdk_request = match into_sdk_request(request, state.config.max_body_bytes).await {
        Ok(r) => r,
        Err(response) => return response,
    };

    tracing::debug!(
        request_id = %sdk_request.request_id,
        host = ?sdk_request.host(),
        method = %sdk_request.method,
        path = %sdk_request.path,
        "Incoming request"
    );

    into_axum_response(state.runtime.serve(sdk_request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    use axum::body::to_bytes;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::modules::builtin_catalog;
    use crate::runtime::resolver::DESCRIPTOR_FILE;
    use crate::runtime::{EscalationDecision, FixedEscalation};

    fn module_dir(root: &Path, name: &str, descriptor: &str) {
        fs::create_dir_all(root.join(name)).unwrap();
        fs::write(root.join(name).join(DESCRIPTOR_FILE), descriptor).unwrap();
    }

    async fn state() -> (TempDir, Arc<AppState>) {
        let tmp = TempDir::new().unwrap();
        module_dir(tmp.path(), "special_handler", "{}");
        module_dir(tmp.path(), "health", r#"{"dependencies": ["special_handler"]}"#);

        let mut config = AppConfig::from_env();
        config.modules_dir = tmp.path().to_path_buf();
        config.domains = vec!["localhost".into()];
        config.api_prefix = "/api".into();
        config.error_template = None;
        config.dev = true;

        let runtime = ModuleRuntime::builder(&config.modules_dir)
            .config(config.runtime_config())
            .catalog(builtin_catalog())
            .escalation(Arc::new(FixedEscalation(EscalationDecision::Continue)))
            .build();
        runtime.load().await.unwrap();
        (tmp, Arc::new(AppState { config, runtime }))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_gateway_serves_module_routes() {
        let (_tmp, state) = state().await;
        let app = create_gateway_router(state.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/health?verbose=1")
                    .header("host", "localhost:8080")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        let body = body_json(response).await;
        assert_eq!(body["state"], "ready");
        assert_eq!(body["modules"], json!(["special_handler", "health"]));
        state.runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_gateway_preflight_and_override() {
        let (_tmp, state) = state().await;
        let app = create_gateway_router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/anything/here")
                    .header("host", "localhost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()["access-control-allow-methods"], "*");

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/health")
                    .header("host", "localhost")
                    .header(modhost_sdk::request::METHOD_OVERRIDE_HEADER, "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        state.runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_admin_status_and_reload() {
        let (_tmp, state) = state().await;
        let app = create_admin_router(state.clone());

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["state"], "ready");
        assert_eq!(body["routing_authority"], "VirtualHostAuthority");

        let response = app
            .oneshot(Request::builder().method("POST").uri("/reload").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        for _ in 0..200 {
            if !state.runtime.is_reloading() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!state.runtime.is_reloading());
        assert_eq!(state.runtime.state(), crate::runtime::LifecycleState::Ready);
        state.runtime.shutdown().await.unwrap();
    }

    #[test]
    fn test_invalid_headers_are_dropped() {
        let response = into_axum_response(
            modhost_sdk::Response::text(200, "ok").with_header("Bad Header", "x"),
        );
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("content-type").is_some());
        assert_eq!(response.headers().len(), 1);
    }
}
