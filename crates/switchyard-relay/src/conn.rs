//! Per-attachment relay connection.
//!
//! One `RelayConn` exists per upgraded websocket. It owns the two transport
//! halves and the signaling state shared with every peer-initiated relay:
//! the outbound nonce counter, the table of unacknowledged nonces, the three
//! relationship sets, and the last-seen instant. Peers reach a connection
//! through the registry and write to it concurrently with its own read loop,
//! so all state lives behind locks:
//!
//! - an async mutex over the read half (serializes `read` callers),
//! - an async mutex over the write half (one frame per acquisition),
//! - a sync reader/writer lock over the state block, never held across an
//!   await.
//!
//! No two connections' state locks are ever held at the same time.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol;
use crate::transport::{Frame, FrameSink, FrameSource, TransportError};

/// How long an outbound message may go unacknowledged before the expiry
/// notice is logged.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(60);
/// A connection counts as online while its last inbound text frame or PONG
/// is younger than this.
pub const ONLINE_WINDOW: Duration = Duration::from_secs(20);
/// Upper bound on writing the graceful CLOSE frame during teardown.
pub const CLOSE_DEADLINE: Duration = Duration::from_secs(1);

struct ConnState {
    last_outgoing_nonce: u64,
    unacked_nonces: HashMap<u64, JoinHandle<()>>,
    /// Peers this connection's client has an offer pending for.
    offers_for: HashSet<u64>,
    /// Peers whose answer is awaited after our offer was forwarded to them.
    expecting_answers_from: HashSet<u64>,
    /// Peers with whom the offer/answer exchange has completed.
    established_with: HashSet<u64>,
    most_recent_message: Option<Instant>,
}

pub struct RelayConn {
    id: u64,
    reader: Mutex<Box<dyn FrameSource>>,
    writer: Mutex<Box<dyn FrameSink>>,
    state: RwLock<ConnState>,
    shutdown: CancellationToken,
}

impl RelayConn {
    pub fn new(id: u64, sink: Box<dyn FrameSink>, source: Box<dyn FrameSource>) -> Self {
        Self {
            id,
            reader: Mutex::new(source),
            writer: Mutex::new(sink),
            state: RwLock::new(ConnState {
                last_outgoing_nonce: 0,
                unacked_nonces: HashMap::new(),
                offers_for: HashSet::new(),
                expecting_answers_from: HashSet::new(),
                established_with: HashSet::new(),
                most_recent_message: None,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the next inbound text frame, `None` for frames the signaling
    /// layer ignores (binary, control, empty text), or an error once the
    /// transport has ended. Non-empty text frames and PONGs refresh the
    /// last-seen instant.
    pub async fn read(&self) -> Result<Option<String>, TransportError> {
        let mut reader = self.reader.lock().await;
        let frame = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(TransportError::Closed),
            frame = reader.next() => frame,
        };
        match frame {
            None => Err(TransportError::Closed),
            Some(Err(error)) => Err(error),
            Some(Ok(Frame::Text(text))) => {
                if text.is_empty() {
                    return Ok(None);
                }
                self.touch();
                Ok(Some(text))
            }
            Some(Ok(Frame::Pong)) => {
                self.touch();
                Ok(None)
            }
            Some(Ok(_)) => Ok(None),
        }
    }

    fn touch(&self) {
        self.state.write().most_recent_message = Some(Instant::now());
    }

    pub fn is_online(&self) -> bool {
        match self.state.read().most_recent_message {
            Some(at) => at.elapsed() < ONLINE_WINDOW,
            None => false,
        }
    }

    /// Stops and forgets the ack timer for `nonce`. A nonce that is not
    /// outstanding (already acked, or expired and later acked) is a no-op.
    pub fn mark_acked(&self, nonce: u64) {
        if let Some(timer) = self.state.write().unacked_nonces.remove(&nonce) {
            timer.abort();
        }
    }

    /// Records that this connection's client has an offer pending for
    /// `peer_id`. Only the fact is kept; the offer body is not retained.
    pub fn store_offer(&self, peer_id: u64) {
        self.state.write().offers_for.insert(peer_id);
    }

    pub fn is_expecting_offer_from(&self, peer_id: u64) -> bool {
        self.state.read().offers_for.contains(&peer_id)
    }

    pub fn is_expecting_answer_from(&self, peer_id: u64) -> bool {
        self.state.read().expecting_answers_from.contains(&peer_id)
    }

    pub fn is_established_with(&self, peer_id: u64) -> bool {
        self.state.read().established_with.contains(&peer_id)
    }

    /// Distinct union of every peer this connection has a signaling
    /// relationship with, in no particular order.
    pub fn peers(&self) -> Vec<u64> {
        let state = self.state.read();
        let mut unique = HashSet::new();
        unique.extend(state.offers_for.iter().copied());
        unique.extend(state.expecting_answers_from.iter().copied());
        unique.extend(state.established_with.iter().copied());
        unique.into_iter().collect()
    }

    /// Forwards an SDP offer from this connection's client to `peer`. On a
    /// delivered write the sender starts expecting the peer's answer; a
    /// failed write changes nothing.
    pub async fn relay_offer(&self, peer: &RelayConn, offer: &Value) {
        let from = self.id;
        if peer
            .send_acked(protocol::OFFER, |nonce| {
                protocol::encode_offer(nonce, from, offer)
            })
            .await
        {
            self.state.write().expecting_answers_from.insert(peer.id);
        }
    }

    /// Forwards an SDP answer to `peer`, completing establishment: both
    /// sides record each other and the peer stops expecting our answer.
    pub async fn relay_answer(&self, peer: &RelayConn, answer: &Value) {
        let from = self.id;
        if peer
            .send_acked(protocol::ANSWER, |nonce| {
                protocol::encode_answer(nonce, from, answer)
            })
            .await
        {
            self.state.write().established_with.insert(peer.id);
            let mut peer_state = peer.state.write();
            peer_state.established_with.insert(self.id);
            peer_state.expecting_answers_from.remove(&self.id);
        }
    }

    /// Forwards an ICE candidate to `peer`. No relationship state changes.
    pub async fn relay_candidate(&self, peer: &RelayConn, candidate: &Value) {
        let from = self.id;
        peer.send_acked(protocol::CANDIDATE, |nonce| {
            protocol::encode_candidate(nonce, from, candidate)
        })
        .await;
    }

    /// Forwards a post-establishment message to `peer`. No relationship
    /// state changes.
    pub async fn relay_info(&self, peer: &RelayConn, info: &Value) {
        let from = self.id;
        peer.send_acked(protocol::INFO, |nonce| {
            protocol::encode_info(nonce, from, info)
        })
        .await;
    }

    /// Sends a PING control frame. Errors are logged, not propagated.
    pub async fn ping(&self) {
        if let Err(error) = self.write_frame(Frame::Ping).await {
            warn!(account = self.id, %error, "ping write failed");
        }
    }

    /// Acknowledges an inbound nonce back to this connection's own client.
    /// Acks are not themselves acknowledged, so no nonce is drawn and no
    /// timer armed.
    pub async fn send_ack(&self, nonce: u64) {
        let json = match protocol::encode_ack(nonce) {
            Ok(json) => json,
            Err(error) => {
                warn!(account = self.id, nonce, %error, "failed to encode ack");
                return;
            }
        };
        if let Err(error) = self.write_frame(Frame::Text(json)).await {
            warn!(account = self.id, nonce, %error, "ack write failed");
        }
    }

    /// Announces which of the client's known peers are currently reachable.
    /// An empty list goes out as `[]`.
    pub async fn send_online_peers(&self, online_peers: Vec<u64>) {
        self.send_acked(protocol::ONLINE_PEERS, |nonce| {
            protocol::encode_online_peers(nonce, &online_peers)
        })
        .await;
    }

    /// Stops every ack timer, writes a best-effort CLOSE frame bounded by
    /// [`CLOSE_DEADLINE`], and unparks any blocked `read` caller. Safe to
    /// call more than once.
    pub async fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let timers: Vec<JoinHandle<()>> = {
            let mut state = self.state.write();
            state.unacked_nonces.drain().map(|(_, timer)| timer).collect()
        };
        for timer in timers {
            timer.abort();
        }

        {
            let mut writer = self.writer.lock().await;
            match timeout(CLOSE_DEADLINE, writer.send(Frame::Close)).await {
                Err(_) => debug!(account = self.id, "close frame timed out"),
                Ok(Err(error)) => debug!(account = self.id, %error, "close frame write failed"),
                Ok(Ok(())) => {}
            }
        }

        self.shutdown.cancel();
    }

    /// Writes one acknowledged envelope to this connection's own transport:
    /// draws the next nonce from our counter, writes the frame, and arms the
    /// one-minute ack timer on a delivered write. Returns whether the write
    /// was delivered; a failed write burns the nonce but arms nothing and
    /// owes nothing.
    async fn send_acked(
        &self,
        kind: &'static str,
        encode: impl FnOnce(u64) -> serde_json::Result<String>,
    ) -> bool {
        let nonce = self.allocate_nonce();
        let json = match encode(nonce) {
            Ok(json) => json,
            Err(error) => {
                warn!(account = self.id, kind, %error, "failed to encode envelope");
                return false;
            }
        };
        if let Err(error) = self.write_frame(Frame::Text(json)).await {
            warn!(account = self.id, kind, nonce, %error, "dropping message: transport write failed");
            return false;
        }
        self.arm_ack_timer(nonce, kind);
        true
    }

    fn allocate_nonce(&self) -> u64 {
        let mut state = self.state.write();
        state.last_outgoing_nonce += 1;
        state.last_outgoing_nonce
    }

    fn arm_ack_timer(&self, nonce: u64, kind: &'static str) {
        let account = self.id;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ACK_TIMEOUT).await;
            warn!(account, nonce, kind, "never received ack");
        });
        self.state.write().unacked_nonces.insert(nonce, timer);
    }

    async fn write_frame(&self, frame: Frame) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.send(frame).await
    }
}
