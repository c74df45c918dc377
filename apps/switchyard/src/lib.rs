//! Switchyard: a WebRTC signaling relay.
//!
//! Authenticated peers attach over `GET /ws`; the relay forwards their SDP
//! offer/answer/ICE-candidate exchanges, acknowledges every inbound message,
//! and periodically tells each peer which of its counterparts are reachable.
//! Signaling works only between peers attached to this process; nothing is
//! persisted.

pub mod auth;
pub mod cli;
pub mod config;
pub mod ws;

use axum::extract::State;
use axum::routing::get;
use axum::{Extension, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use switchyard_relay::ConnectionRegistry;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::ws::SharedDirectory;

/// Assembles the HTTP surface: the websocket attachment endpoint (trailing
/// slash accepted) and the health probe.
pub fn build_router(registry: ConnectionRegistry, directory: SharedDirectory) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws::ws_handler))
        .route("/ws/", get(ws::ws_handler))
        .layer(Extension(registry))
        .layer(Extension(directory))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}
