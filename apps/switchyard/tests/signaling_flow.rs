//! End-to-end signaling scenarios over real websockets: a server on an
//! ephemeral port, clients driven with tokio-tungstenite.

use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use switchyard::auth::{AccountDirectory, DirectoryError, StaticDirectory};
use switchyard::build_router;
use switchyard::ws::SharedDirectory;
use switchyard_relay::ConnectionRegistry;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> SocketAddr {
    let directory: SharedDirectory =
        Arc::new(StaticDirectory::parse("101:alpha,202:bravo,303:charlie").unwrap());
    start_server_with(directory).await
}

async fn start_server_with(directory: SharedDirectory) -> SocketAddr {
    let registry = ConnectionRegistry::new();
    let app = build_router(registry, directory);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, account: u64, token: &str) -> Ws {
    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    let credentials = BASE64_STANDARD.encode(format!("{account}:{token}"));
    request.headers_mut().insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Basic {credentials}")).unwrap(),
    );
    let (ws, _) = connect_async(request).await.expect("websocket handshake");
    ws
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string()))
        .await
        .expect("send frame");
}

async fn recv_json(ws: &mut Ws) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).expect("json frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

async fn assert_silent(ws: &mut Ws) {
    let outcome = timeout(Duration::from_millis(200), ws.next()).await;
    assert!(outcome.is_err(), "expected silence, got {outcome:?}");
}

async fn assert_closed(ws: &mut Ws) {
    loop {
        match timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for close")
        {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => return,
            Some(Ok(_)) => continue,
        }
    }
}

#[tokio::test]
async fn offer_answer_candidate_info_happy_path() {
    let addr = start_server().await;
    let mut a = connect(addr, 101, "alpha").await;
    let mut b = connect(addr, 202, "bravo").await;

    // A offers first; B has no pending offer for A, so nothing is forwarded.
    send_json(
        &mut a,
        json!({"type": "offer", "nonce": 5, "payload": {"toAccountId": 202, "offer": {"sdp": "a-sdp"}}}),
    )
    .await;
    assert_eq!(recv_json(&mut a).await, json!({"type": "ack", "nonce": 5}));
    assert_silent(&mut b).await;

    // B offers back; both sides now hold offers, so B's offer reaches A.
    send_json(
        &mut b,
        json!({"type": "offer", "nonce": 7, "payload": {"toAccountId": 101, "offer": {"sdp": "b-sdp"}}}),
    )
    .await;
    assert_eq!(
        recv_json(&mut a).await,
        json!({
            "type": "offer",
            "nonce": 1,
            "payload": {"fromAccountId": 202, "offer": {"sdp": "b-sdp"}},
        })
    );
    assert_eq!(recv_json(&mut b).await, json!({"type": "ack", "nonce": 7}));
    send_json(&mut a, json!({"type": "ack", "nonce": 1})).await;

    // A answers; establishment completes in both directions.
    send_json(
        &mut a,
        json!({"type": "answer", "nonce": 3, "payload": {"toAccountId": 202, "answer": {"sdp": "ans"}}}),
    )
    .await;
    assert_eq!(
        recv_json(&mut b).await,
        json!({
            "type": "answer",
            "nonce": 1,
            "payload": {"fromAccountId": 101, "answer": {"sdp": "ans"}},
        })
    );
    assert_eq!(recv_json(&mut a).await, json!({"type": "ack", "nonce": 3}));
    send_json(&mut b, json!({"type": "ack", "nonce": 1})).await;

    // Established peers may exchange info.
    send_json(
        &mut a,
        json!({"type": "info", "nonce": 4, "payload": {"toAccountId": 202, "info": {"msg": "hello"}}}),
    )
    .await;
    assert_eq!(
        recv_json(&mut b).await,
        json!({
            "type": "info",
            "nonce": 2,
            "payload": {"fromAccountId": 101, "info": {"msg": "hello"}},
        })
    );
    assert_eq!(recv_json(&mut a).await, json!({"type": "ack", "nonce": 4}));

    // Candidates flow as soon as the target is attached.
    send_json(
        &mut b,
        json!({"type": "candidate", "nonce": 8, "payload": {"toAccountId": 101, "candidate": {"c": 1}}}),
    )
    .await;
    assert_eq!(
        recv_json(&mut a).await,
        json!({
            "type": "candidate",
            "nonce": 2,
            "payload": {"fromAccountId": 202, "candidate": {"c": 1}},
        })
    );
    assert_eq!(recv_json(&mut b).await, json!({"type": "ack", "nonce": 8}));
}

#[tokio::test]
async fn offer_to_offline_peer_is_stored_not_forwarded() {
    let addr = start_server().await;
    let mut a = connect(addr, 101, "alpha").await;

    send_json(
        &mut a,
        json!({"type": "offer", "nonce": 1, "payload": {"toAccountId": 202, "offer": {"sdp": "x"}}}),
    )
    .await;
    assert_eq!(recv_json(&mut a).await, json!({"type": "ack", "nonce": 1}));

    // B attaches later. The stored offer is not forwarded retroactively,
    // and A is not expecting an answer (its offer never went out).
    let mut b = connect(addr, 202, "bravo").await;
    assert_silent(&mut b).await;

    send_json(
        &mut b,
        json!({"type": "answer", "nonce": 2, "payload": {"toAccountId": 101, "answer": {"sdp": "y"}}}),
    )
    .await;
    assert_eq!(recv_json(&mut b).await, json!({"type": "ack", "nonce": 2}));
    assert_silent(&mut a).await;

    // The stored fact still matters: B's own offer is forwarded to A.
    send_json(
        &mut b,
        json!({"type": "offer", "nonce": 3, "payload": {"toAccountId": 101, "offer": {"sdp": "z"}}}),
    )
    .await;
    let forwarded = recv_json(&mut a).await;
    assert_eq!(forwarded["type"], "offer");
    assert_eq!(forwarded["payload"]["fromAccountId"], 202);
}

#[tokio::test]
async fn answer_without_prior_offer_is_dropped() {
    let addr = start_server().await;
    let mut a = connect(addr, 101, "alpha").await;
    let mut b = connect(addr, 202, "bravo").await;

    send_json(
        &mut b,
        json!({"type": "answer", "nonce": 1, "payload": {"toAccountId": 101, "answer": {"sdp": "x"}}}),
    )
    .await;
    assert_eq!(recv_json(&mut b).await, json!({"type": "ack", "nonce": 1}));
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn info_before_establishment_is_dropped() {
    let addr = start_server().await;
    let mut a = connect(addr, 101, "alpha").await;
    let mut b = connect(addr, 202, "bravo").await;

    send_json(
        &mut a,
        json!({"type": "info", "nonce": 1, "payload": {"toAccountId": 202, "info": {"msg": "early"}}}),
    )
    .await;
    assert_eq!(recv_json(&mut a).await, json!({"type": "ack", "nonce": 1}));
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn unknown_and_malformed_frames_are_ignored() {
    let addr = start_server().await;
    let mut a = connect(addr, 101, "alpha").await;

    send_json(&mut a, json!({"type": "hangup", "nonce": 1, "payload": {}})).await;
    send_json(&mut a, json!({"type": "offer", "nonce": 2, "payload": {"toAccountId": "oops"}})).await;
    a.send(Message::Text("not json".into())).await.unwrap();

    // The connection survives and keeps serving acks.
    send_json(
        &mut a,
        json!({"type": "offer", "nonce": 3, "payload": {"toAccountId": 202, "offer": {}}}),
    )
    .await;
    assert_eq!(recv_json(&mut a).await, json!({"type": "ack", "nonce": 3}));
}

#[tokio::test]
async fn second_attachment_displaces_the_first() {
    let addr = start_server().await;
    let mut first = connect(addr, 101, "alpha").await;

    // Make sure the first attachment is fully published before the second
    // one races it.
    send_json(
        &mut first,
        json!({"type": "offer", "nonce": 1, "payload": {"toAccountId": 303, "offer": {}}}),
    )
    .await;
    assert_eq!(recv_json(&mut first).await, json!({"type": "ack", "nonce": 1}));

    let mut second = connect(addr, 101, "alpha").await;

    assert_closed(&mut first).await;

    // The replacement is the live connection for the account.
    send_json(
        &mut second,
        json!({"type": "offer", "nonce": 1, "payload": {"toAccountId": 202, "offer": {}}}),
    )
    .await;
    assert_eq!(recv_json(&mut second).await, json!({"type": "ack", "nonce": 1}));
}

#[tokio::test]
async fn bad_credentials_are_rejected_before_upgrade() {
    let addr = start_server().await;

    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    let credentials = BASE64_STANDARD.encode("101:wrong-token");
    request.headers_mut().insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Basic {credentials}")).unwrap(),
    );
    match connect_async(request).await {
        Err(Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected http rejection, got {other:?}"),
    }

    // Missing credentials entirely.
    match connect_async(format!("ws://{addr}/ws")).await {
        Err(Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected http rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn directory_failure_is_an_internal_error_not_a_rejection() {
    struct BrokenDirectory;

    impl AccountDirectory for BrokenDirectory {
        fn authenticate(&self, _account_id: u64, _token: &str) -> Result<bool, DirectoryError> {
            Err(DirectoryError::Unavailable("store offline".to_string()))
        }
    }

    let addr = start_server_with(Arc::new(BrokenDirectory)).await;

    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    let credentials = BASE64_STANDARD.encode("101:alpha");
    request.headers_mut().insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Basic {credentials}")).unwrap(),
    );
    match connect_async(request).await {
        Err(Error::Http(response)) => assert_eq!(response.status(), 500),
        other => panic!("expected http rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn trailing_slash_attachment_is_accepted() {
    let addr = start_server().await;

    let mut request = format!("ws://{addr}/ws/").into_client_request().unwrap();
    let credentials = BASE64_STANDARD.encode("303:charlie");
    request.headers_mut().insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Basic {credentials}")).unwrap(),
    );
    let (mut ws, _) = connect_async(request).await.expect("websocket handshake");

    send_json(
        &mut ws,
        json!({"type": "offer", "nonce": 1, "payload": {"toAccountId": 101, "offer": {}}}),
    )
    .await;
    assert_eq!(recv_json(&mut ws).await, json!({"type": "ack", "nonce": 1}));
}
