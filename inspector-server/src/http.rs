//! Inspector HTTP REST API
//!
//! Axum-based HTTP server for starting introspection and polling its status.
//! Each endpoint is a thin axum handler delegating to an inner function that
//! tests can call without the dispatch machinery.
//!
//! Endpoints:
//! - GET  /health                  - health check with DB status
//! - GET  /version                 - server version info
//! - POST /v1/introspection/:id    - start introspection for a node
//! - GET  /v1/introspection/:id    - introspection status of a node

use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use inspector_core::config::HttpConfig;
use inspector_core::models::IpmiCredentials;
use inspector_core::{InspectorError, SessionStore};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::subsystems::introspect::Introspector;

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub introspector: Introspector,
}

impl HttpState {
    fn store(&self) -> &SessionStore {
        self.introspector.store()
    }

    fn pool(&self) -> &SqlitePool {
        self.store().pool()
    }
}

pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route(
            "/v1/introspection/:node_id",
            get(status_handler).post(start_handler),
        )
        .with_state(state)
}

/// Serve until the broadcast shutdown signal fires.
pub async fn start_http_server(
    introspector: Introspector,
    config: HttpConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(HttpState { introspector });

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Inspector HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct StartIntrospectionRequest {
    pub new_ipmi_username: Option<String>,
    pub new_ipmi_password: Option<String>,
}

impl StartIntrospectionRequest {
    /// Credentials are only requested when a password is given.
    pub fn credentials(self) -> Option<IpmiCredentials> {
        match self.new_ipmi_password {
            Some(password) if !password.is_empty() => Some(IpmiCredentials {
                username: self.new_ipmi_username.unwrap_or_default(),
                password,
            }),
            _ => None,
        }
    }
}

/// Standard HTTP error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            status: "error".to_string(),
        }
    }

    fn into_body(self) -> serde_json::Value {
        serde_json::to_value(&self).unwrap_or_else(|_| serde_json::json!({ "status": "error" }))
    }
}

pub fn error_status(error: &InspectorError) -> StatusCode {
    match error {
        InspectorError::NotFound(_) => StatusCode::NOT_FOUND,
        InspectorError::Validation(_) | InspectorError::InvalidState(_) => StatusCode::BAD_REQUEST,
        InspectorError::DuplicateAttribute { .. }
        | InspectorError::AmbiguousMatch { .. }
        | InspectorError::AlreadyFinished { .. }
        | InspectorError::Superseded { .. } => StatusCode::CONFLICT,
        InspectorError::Remote(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_reply(error: &InspectorError) -> (StatusCode, serde_json::Value) {
    (
        error_status(error),
        ErrorResponse::new(error.to_string()).into_body(),
    )
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

pub async fn health_inner(pool: &SqlitePool) -> (StatusCode, serde_json::Value) {
    match inspector_core::db::health_check(pool).await {
        Ok(version) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "sqlite": version,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "error": e.to_string(),
            }),
        ),
    }
}

pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "inspector/1",
    })
}

/// Runs the precheck; the rest of the introspection continues in the background.
pub async fn start_introspection_inner(
    introspector: &Introspector,
    node_id: &str,
    req: StartIntrospectionRequest,
) -> (StatusCode, serde_json::Value) {
    match introspector.introspect(node_id, req.credentials()).await {
        Ok(_task) => (
            StatusCode::ACCEPTED,
            serde_json::json!({ "node": node_id, "status": "accepted" }),
        ),
        Err(e) => {
            tracing::warn!(node = %node_id, error = %e, "Introspection request rejected");
            error_reply(&e)
        }
    }
}

pub async fn introspection_status_inner(
    store: &SessionStore,
    node_id: &str,
) -> (StatusCode, serde_json::Value) {
    match store.get_by_id(node_id).await {
        Ok(session) => (
            StatusCode::OK,
            serde_json::json!({
                "finished": session.is_finished(),
                "error": session.error,
                "started_at": session.started_at,
                "finished_at": session.finished_at,
            }),
        ),
        Err(e) => error_reply(&e),
    }
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(state.pool()).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn start_handler(
    State(state): State<Arc<HttpState>>,
    Path(node_id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    // an empty body means no new credentials
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        StartIntrospectionRequest::default()
    } else {
        match serde_json::from_slice::<StartIntrospectionRequest>(&body) {
            Ok(req) => req,
            Err(e) => {
                let body = ErrorResponse::new(format!("Invalid request body: {}", e)).into_body();
                return (StatusCode::BAD_REQUEST, Json(body));
            }
        }
    };

    let (status, body) = start_introspection_inner(&state.introspector, &node_id, req).await;
    (status, Json(body))
}

pub async fn status_handler(
    State(state): State<Arc<HttpState>>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = introspection_status_inner(state.store(), &node_id).await;
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use inspector_core::IronicError;

    #[test]
    fn test_version_inner_pure() {
        let v = version_inner();
        assert!(v["version"].is_string());
        assert_eq!(v["protocol"], "inspector/1");
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_status(&InspectorError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&InspectorError::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&InspectorError::InvalidState("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&InspectorError::Remote(IronicError::Api {
                code: 500,
                message: "x".into()
            })),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            error_status(&InspectorError::DuplicateAttribute {
                name: "bmc_address".into(),
                values: vec!["10.0.0.1".into()],
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&InspectorError::AmbiguousMatch {
                criteria: "x".into(),
                candidates: vec!["a".into(), "b".into()],
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&InspectorError::AlreadyFinished {
                id: "n1".into(),
                finished_at: chrono::Utc::now(),
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&InspectorError::Superseded { id: "n1".into() }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&InspectorError::Other("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_body_matches_error_response_fields() {
        let mut body = ErrorResponse::new("Node n1 not found").into_body();
        assert_eq!(body["error"], "Node n1 not found");
        assert_eq!(body["status"], "error");

        let object = body.as_object_mut().unwrap();
        object.remove("error");
        object.remove("status");
        assert!(object.is_empty());
    }

    #[test]
    fn test_credentials_need_a_password() {
        let req = StartIntrospectionRequest {
            new_ipmi_username: Some("admin".into()),
            new_ipmi_password: None,
        };
        assert!(req.credentials().is_none());

        let req = StartIntrospectionRequest {
            new_ipmi_username: None,
            new_ipmi_password: Some("abc123".into()),
        };
        let creds = req.credentials().unwrap();
        assert_eq!(creds.username, "");
        assert_eq!(creds.password, "abc123");
    }
}
