//! The attachment loop: binds an authenticated, upgraded websocket to the
//! connection registry and runs it until the transport ends.

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocket, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    Extension,
};
use metrics::{counter, gauge};
use serde_json::Value;
use switchyard_relay::protocol::{self, Incoming, ParseError};
use switchyard_relay::{transport, ConnectionRegistry, RelayConn};
use tokio::time::{interval_at, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::auth::{self, AccountDirectory, ApiError, AuthError};

/// Cadence of the `onlinePeers` presence broadcast.
const PRESENCE_PERIOD: Duration = Duration::from_secs(15);
/// Cadence of transport-level PINGs that keep intermediaries from reaping
/// idle connections.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

pub type SharedDirectory = Arc<dyn AccountDirectory>;

/// `GET /ws`: authenticates the Basic credentials, then hands the upgraded
/// socket to the attachment loop. Origin checks are deliberately permissive.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Extension(registry): Extension<ConnectionRegistry>,
    Extension(directory): Extension<SharedDirectory>,
) -> Response {
    let account_id = match auth::authenticate(&headers, directory.as_ref()) {
        Ok(id) => id,
        Err(cause @ AuthError::Directory(_)) => {
            error!(%cause, "account directory failure during upgrade");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiError::internal()))
                .into_response();
        }
        Err(cause) => {
            debug!(%cause, "rejecting websocket upgrade");
            return (
                StatusCode::UNAUTHORIZED,
                Json(ApiError::invalid_credentials()),
            )
                .into_response();
        }
    };
    ws.on_upgrade(move |socket| attach(socket, account_id, registry))
}

/// Runs one attached connection end to end: publish in the registry
/// (closing any displaced predecessor), start the periodic announcer, drain
/// the inbound loop, then tear everything down.
async fn attach(socket: WebSocket, account_id: u64, registry: ConnectionRegistry) {
    let (sink, source) = transport::split_socket(socket);
    let conn = Arc::new(RelayConn::new(account_id, sink, source));

    if let Some(displaced) = registry.insert(conn.clone()) {
        warn!(account = account_id, "new attachment replaces a live connection");
        displaced.close().await;
    }
    gauge!("switchyard_attached_connections", registry.len() as f64);
    info!(account = account_id, "peer attached");

    let announcer = tokio::spawn(announce_loop(conn.clone(), registry.clone()));

    read_loop(&conn, &registry).await;

    announcer.abort();
    registry.remove(account_id, &conn);
    gauge!("switchyard_attached_connections", registry.len() as f64);
    conn.close().await;
    info!(account = account_id, "peer detached");
}

/// Periodic per-connection task: presence broadcasts and keepalive pings.
/// Ticks start one full period after attach.
async fn announce_loop(conn: Arc<RelayConn>, registry: ConnectionRegistry) {
    let mut presence = interval_at(Instant::now() + PRESENCE_PERIOD, PRESENCE_PERIOD);
    let mut keepalive = interval_at(Instant::now() + KEEPALIVE_PERIOD, KEEPALIVE_PERIOD);
    loop {
        tokio::select! {
            _ = presence.tick() => {
                let online = online_peers(&conn, &registry);
                conn.send_online_peers(online).await;
            }
            _ = keepalive.tick() => conn.ping().await,
        }
    }
}

/// The subset of the connection's known peers that is currently attached
/// and online.
fn online_peers(conn: &RelayConn, registry: &ConnectionRegistry) -> Vec<u64> {
    conn.peers()
        .into_iter()
        .filter(|id| registry.lookup(*id).is_some_and(|peer| peer.is_online()))
        .collect()
}

async fn read_loop(conn: &Arc<RelayConn>, registry: &ConnectionRegistry) {
    loop {
        let text = match conn.read().await {
            Ok(Some(text)) => text,
            Ok(None) => continue,
            Err(error) => {
                debug!(account = conn.id(), %error, "read loop ended");
                break;
            }
        };

        match protocol::parse_incoming(&text) {
            Ok(Incoming::Ack { nonce }) => conn.mark_acked(nonce),
            Ok(Incoming::Offer {
                nonce,
                to_account_id,
                offer,
            }) => {
                handle_offer(conn, registry, to_account_id, &offer).await;
                conn.send_ack(nonce).await;
            }
            Ok(Incoming::Answer {
                nonce,
                to_account_id,
                answer,
            }) => {
                handle_answer(conn, registry, to_account_id, &answer).await;
                conn.send_ack(nonce).await;
            }
            Ok(Incoming::Info {
                nonce,
                to_account_id,
                info,
            }) => {
                handle_info(conn, registry, to_account_id, &info).await;
                conn.send_ack(nonce).await;
            }
            Ok(Incoming::Candidate {
                nonce,
                to_account_id,
                candidate,
            }) => {
                handle_candidate(conn, registry, to_account_id, &candidate).await;
                conn.send_ack(nonce).await;
            }
            Err(error) => {
                counter!("switchyard_dropped_frames_total", 1, "reason" => drop_reason(&error));
                warn!(account = conn.id(), %error, "dropping inbound frame");
            }
        }
    }
}

fn drop_reason(error: &ParseError) -> &'static str {
    match error {
        ParseError::Envelope(_) => "envelope",
        ParseError::Payload { .. } => "payload",
        ParseError::UnknownKind(_) => "unknown_kind",
    }
}

/// Records the offer and forwards it only when the target already holds an
/// offer for the sender. A target that attaches later never receives it
/// retroactively.
async fn handle_offer(conn: &Arc<RelayConn>, registry: &ConnectionRegistry, to: u64, offer: &Value) {
    if to == conn.id() {
        debug!(account = conn.id(), "dropping self-addressed offer");
        return;
    }
    conn.store_offer(to);
    let Some(peer) = registry.lookup(to) else {
        return;
    };
    if peer.is_expecting_offer_from(conn.id()) {
        conn.relay_offer(&peer, offer).await;
        counter!("switchyard_relayed_messages_total", 1, "kind" => protocol::OFFER);
    }
}

/// Forwards the answer only to a peer that is expecting one from the sender.
async fn handle_answer(
    conn: &Arc<RelayConn>,
    registry: &ConnectionRegistry,
    to: u64,
    answer: &Value,
) {
    if to == conn.id() {
        debug!(account = conn.id(), "dropping self-addressed answer");
        return;
    }
    let Some(peer) = registry.lookup(to) else {
        return;
    };
    if peer.is_expecting_answer_from(conn.id()) {
        conn.relay_answer(&peer, answer).await;
        counter!("switchyard_relayed_messages_total", 1, "kind" => protocol::ANSWER);
    }
}

/// Candidates are forwarded whenever the target is attached, regardless of
/// handshake state.
async fn handle_candidate(
    conn: &Arc<RelayConn>,
    registry: &ConnectionRegistry,
    to: u64,
    candidate: &Value,
) {
    if to == conn.id() {
        debug!(account = conn.id(), "dropping self-addressed candidate");
        return;
    }
    let Some(peer) = registry.lookup(to) else {
        return;
    };
    conn.relay_candidate(&peer, candidate).await;
    counter!("switchyard_relayed_messages_total", 1, "kind" => protocol::CANDIDATE);
}

/// Info messages only flow between established peers.
async fn handle_info(conn: &Arc<RelayConn>, registry: &ConnectionRegistry, to: u64, info: &Value) {
    if to == conn.id() {
        debug!(account = conn.id(), "dropping self-addressed info");
        return;
    }
    let Some(peer) = registry.lookup(to) else {
        return;
    };
    if peer.is_established_with(conn.id()) {
        conn.relay_info(&peer, info).await;
        counter!("switchyard_relayed_messages_total", 1, "kind" => protocol::INFO);
    }
}
