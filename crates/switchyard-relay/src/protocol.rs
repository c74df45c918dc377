//! Wire envelopes for the signaling channel.
//!
//! Every message is a JSON document `{ "type": <kind>, "nonce": <int>,
//! "payload": <object> }`; `ack` carries no payload. The SDP/ICE bodies
//! inside `offer`/`answer`/`candidate`/`info` payloads are never inspected;
//! they travel as raw [`serde_json::Value`]s.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const ACK: &str = "ack";
pub const OFFER: &str = "offer";
pub const ANSWER: &str = "answer";
pub const CANDIDATE: &str = "candidate";
pub const INFO: &str = "info";
pub const ONLINE_PEERS: &str = "onlinePeers";

/// A decoded client-to-relay message.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Ack {
        nonce: u64,
    },
    Offer {
        nonce: u64,
        to_account_id: u64,
        offer: Value,
    },
    Answer {
        nonce: u64,
        to_account_id: u64,
        answer: Value,
    },
    Candidate {
        nonce: u64,
        to_account_id: u64,
        candidate: Value,
    },
    Info {
        nonce: u64,
        to_account_id: u64,
        info: Value,
    },
}

#[derive(Debug, Error)]
pub enum ParseError {
    /// The frame is not a `{type, nonce, payload}` envelope at all.
    #[error("not a signaling envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    /// The envelope named a known kind but the payload shape did not match.
    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown message kind {0:?}")]
    UnknownKind(String),
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    nonce: u64,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingOfferPayload {
    to_account_id: u64,
    offer: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingAnswerPayload {
    to_account_id: u64,
    answer: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingCandidatePayload {
    to_account_id: u64,
    candidate: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingInfoPayload {
    to_account_id: u64,
    info: Value,
}

/// Decodes one inbound text frame.
///
/// The `type` string is matched case-insensitively; the payload is then held
/// to the matched kind's shape. A payload of the wrong shape, an unknown
/// kind, and a frame that is not an envelope are each distinct errors so the
/// caller can log the drop reason; none of them is fatal to the connection.
pub fn parse_incoming(text: &str) -> Result<Incoming, ParseError> {
    let raw: RawEnvelope = serde_json::from_str(text).map_err(ParseError::Envelope)?;
    let nonce = raw.nonce;
    match raw.kind.to_ascii_lowercase().as_str() {
        ACK => Ok(Incoming::Ack { nonce }),
        OFFER => {
            let p: IncomingOfferPayload = payload(OFFER, raw.payload)?;
            Ok(Incoming::Offer {
                nonce,
                to_account_id: p.to_account_id,
                offer: p.offer,
            })
        }
        ANSWER => {
            let p: IncomingAnswerPayload = payload(ANSWER, raw.payload)?;
            Ok(Incoming::Answer {
                nonce,
                to_account_id: p.to_account_id,
                answer: p.answer,
            })
        }
        CANDIDATE => {
            let p: IncomingCandidatePayload = payload(CANDIDATE, raw.payload)?;
            Ok(Incoming::Candidate {
                nonce,
                to_account_id: p.to_account_id,
                candidate: p.candidate,
            })
        }
        INFO => {
            let p: IncomingInfoPayload = payload(INFO, raw.payload)?;
            Ok(Incoming::Info {
                nonce,
                to_account_id: p.to_account_id,
                info: p.info,
            })
        }
        _ => Err(ParseError::UnknownKind(raw.kind)),
    }
}

fn payload<T: DeserializeOwned>(kind: &'static str, payload: Value) -> Result<T, ParseError> {
    serde_json::from_value(payload).map_err(|source| ParseError::Payload { kind, source })
}

#[derive(Debug, Serialize)]
struct OutgoingEnvelope<P: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    nonce: u64,
    payload: P,
}

// Ack is the one envelope without a payload key.
#[derive(Debug, Serialize)]
struct AckEnvelope {
    #[serde(rename = "type")]
    kind: &'static str,
    nonce: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingOfferPayload<'a> {
    from_account_id: u64,
    offer: &'a Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingAnswerPayload<'a> {
    from_account_id: u64,
    answer: &'a Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingCandidatePayload<'a> {
    from_account_id: u64,
    candidate: &'a Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingInfoPayload<'a> {
    from_account_id: u64,
    info: &'a Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingOnlinePeersPayload<'a> {
    online_peers: &'a [u64],
}

pub fn encode_ack(nonce: u64) -> serde_json::Result<String> {
    serde_json::to_string(&AckEnvelope { kind: ACK, nonce })
}

pub fn encode_offer(nonce: u64, from_account_id: u64, offer: &Value) -> serde_json::Result<String> {
    serde_json::to_string(&OutgoingEnvelope {
        kind: OFFER,
        nonce,
        payload: OutgoingOfferPayload {
            from_account_id,
            offer,
        },
    })
}

pub fn encode_answer(
    nonce: u64,
    from_account_id: u64,
    answer: &Value,
) -> serde_json::Result<String> {
    serde_json::to_string(&OutgoingEnvelope {
        kind: ANSWER,
        nonce,
        payload: OutgoingAnswerPayload {
            from_account_id,
            answer,
        },
    })
}

pub fn encode_candidate(
    nonce: u64,
    from_account_id: u64,
    candidate: &Value,
) -> serde_json::Result<String> {
    serde_json::to_string(&OutgoingEnvelope {
        kind: CANDIDATE,
        nonce,
        payload: OutgoingCandidatePayload {
            from_account_id,
            candidate,
        },
    })
}

pub fn encode_info(nonce: u64, from_account_id: u64, info: &Value) -> serde_json::Result<String> {
    serde_json::to_string(&OutgoingEnvelope {
        kind: INFO,
        nonce,
        payload: OutgoingInfoPayload {
            from_account_id,
            info,
        },
    })
}

/// An empty peer list encodes as `[]`, never `null`.
pub fn encode_online_peers(nonce: u64, online_peers: &[u64]) -> serde_json::Result<String> {
    serde_json::to_string(&OutgoingEnvelope {
        kind: ONLINE_PEERS,
        nonce,
        payload: OutgoingOnlinePeersPayload { online_peers },
    })
}
