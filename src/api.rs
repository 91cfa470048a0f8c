//! HTTP API router for the enclave gateway
//!
//! ## Endpoint Map
//!
//! | Route             | Description                                  |
//! |-------------------|----------------------------------------------|
//! | `GET /health`     | Enclave liveness probe (503 when unhealthy)  |
//! | `GET /attestation`| Enclave attestation document                 |
//! | `POST /redact`    | PII detection and redaction inside enclave   |
//! | `GET /kms-key`    | Configured KMS key ARN                       |

use crate::enclave::TunnelHealth;
use crate::error::Error;
use crate::gateway::Gateway;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

/// Build the HTTP application with tracing and CORS layers.
pub fn build_app(gateway: Arc<Gateway>, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/attestation", get(attestation))
        .route("/redact", post(redact))
        .route("/kms-key", get(kms_key))
        .with_state(AppState { gateway })
        .layer(TraceLayer::new_for_http())
        .layer(build_cors(cors_origins))
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    enclave_running: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    enclave_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tunnel: Option<TunnelHealth>,
}

async fn health_check(State(state): State<AppState>) -> Response {
    let running = state.gateway.lifecycle().is_healthy().await;
    let body = HealthResponse {
        status: if running { "ok" } else { "unhealthy" },
        enclave_running: running,
        enclave_id: state.gateway.lifecycle().instance_id().await,
        tunnel: state.gateway.tunnel_health().await,
    };

    let status = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

#[derive(Serialize)]
struct AttestationResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    attestation_document: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn attestation(State(state): State<AppState>) -> Response {
    let body = match state.gateway.orchestrator().attestation().await {
        Ok(document) => AttestationResponse {
            status: "ok",
            attestation_document: Some(document),
            error: None,
        },
        Err(Error::Enclave(message)) => AttestationResponse {
            status: "error",
            attestation_document: None,
            error: Some(message),
        },
        Err(e) => {
            tracing::error!(error = %e, "Attestation request failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };
    (StatusCode::OK, Json(body)).into_response()
}

#[derive(Deserialize)]
struct RedactRequest {
    #[serde(default)]
    text: String,
}

async fn redact(
    State(state): State<AppState>,
    payload: Result<Json<RedactRequest>, JsonRejection>,
) -> Response {
    let orchestrator = state.gateway.orchestrator();
    if orchestrator.key_id().is_none() {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            Error::NotConfigured("KMS_KEY_ARN".to_string()).to_string(),
        );
    }

    let Ok(Json(request)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid request body");
    };
    // Wiped once the request is dropped.
    let text = zeroize::Zeroizing::new(request.text);
    if text.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "text field is required");
    }

    match orchestrator.detect(&text).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Redaction failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn kms_key(State(state): State<AppState>) -> Response {
    match state.gateway.orchestrator().key_id() {
        Some(key) => (StatusCode::OK, Json(serde_json::json!({ "key_arn": key }))).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            Error::NotConfigured("KMS_KEY_ARN".to_string()).to_string(),
        ),
    }
}

// =============================================================================
// CORS
// =============================================================================

fn build_cors(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let parsed: Vec<_> = origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors.allow_origin(parsed)
    }
}
