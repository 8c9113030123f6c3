//! Axum-based HTTP gateway for the messaging bridge.
//!
//! - `GET /health`: component health plus whether a deploy is running
//! - `POST /messages`: signed inbound messages from the bridge, queued for
//!   the dispatcher
//!
//! Request bodies are capped at 64KB and requests time out after 30s.

use crate::channels::bridge::{verify_bridge_signature, SIGNATURE_HEADER};
use crate::channels::{BridgeChannel, ChannelMessage};
use crate::deploy::DeployGate;
use crate::util::truncate_with_ellipsis;
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct AppState {
    /// Shared bridge secret; inbound bodies are HMAC-signed with it.
    pub secret: Arc<str>,
    pub inbound: mpsc::Sender<ChannelMessage>,
    pub gate: DeployGate,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/messages", post(handle_messages))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

fn is_loopback_host(host: &str) -> bool {
    matches!(host, "127.0.0.1" | "::1" | "localhost")
}

pub async fn run_gateway(host: &str, port: u16, state: AppState) -> Result<()> {
    if !is_loopback_host(host) {
        tracing::warn!(
            "Gateway binding to {host}; inbound messages are only protected by the bridge signature"
        );
    }

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Gateway listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// GET /health
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "deploy_running": state.gate.is_running(),
        "runtime": crate::health::snapshot_json(),
    }))
}

/// POST /messages
async fn handle_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !verify_bridge_signature(&state.secret, &body, signature) {
        tracing::warn!(
            "Bridge webhook signature verification failed (signature: {})",
            if signature.is_empty() {
                "missing"
            } else {
                "invalid"
            }
        );
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Invalid signature"})),
        );
    }

    let msg = match BridgeChannel::parse_inbound(&body) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!("Rejected bridge payload: {e}");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Invalid message payload"})),
            );
        }
    };

    tracing::debug!(
        "Bridge {} message from {}: {}",
        msg.kind,
        msg.sender,
        truncate_with_ellipsis(&msg.content, 50)
    );

    if state.inbound.send(msg).await.is_err() {
        tracing::error!("Dispatcher queue closed; dropping bridge message");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "Agent is shutting down"})),
        );
    }

    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}
