/// Broker message schema - wire envelope and queued message types
///
/// Every frame on the wire is one JSON object:
/// - `{"type":"id","origin_id":"","id":"ws:7"}` announces the connection id once
/// - `{"type":"p","origin_id":"ws:7","p":{...}}` carries a topic's state body
///
/// `OutboundMessage` and `InboundMessage` are the owned values that move
/// through the shared queues; a `Frame` is what a single connection sends.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use super::hub::ConnectionId;
use crate::errors::BrokerError;

// ============================================================================
// ORIGIN
// ============================================================================

/// Prefix of the identifier a client is known by in `origin_id`
pub const CLIENT_ID_PREFIX: &str = "ws:";

/// Origin used for server-originated changes
pub const SERVER_ORIGIN: &str = "";

/// Identifier a connection is announced with and tagged by as an origin
pub fn client_origin(id: ConnectionId) -> String {
    format!("{}{}", CLIENT_ID_PREFIX, id)
}

// ============================================================================
// WIRE ENVELOPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// Connection identity announcement
    Id,
    /// Topic state payload
    P,
}

/// Wire envelope shared by identity and payload frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,

    /// Who caused this frame ("" = server)
    pub origin_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<Map<String, Value>>,
}

impl WsEnvelope {
    pub fn identity(id: ConnectionId) -> Self {
        Self {
            kind: EnvelopeKind::Id,
            origin_id: SERVER_ORIGIN.to_string(),
            id: Some(client_origin(id)),
            p: None,
        }
    }

    pub fn payload(origin: impl Into<String>, body: Map<String, Value>) -> Self {
        Self {
            kind: EnvelopeKind::P,
            origin_id: origin.into(),
            id: None,
            p: Some(body),
        }
    }

    /// Serialize to JSON text
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Extract the state body from an inbound client frame
///
/// Accepts a payload envelope (`{"type":"p","p":{...}}`) or a bare JSON
/// object, which is taken as the body itself. Anything else is malformed.
pub fn parse_update_body(payload: &[u8]) -> Result<Map<String, Value>, BrokerError> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| BrokerError::MalformedPayload(e.to_string()))?;

    let Value::Object(mut root) = value else {
        return Err(BrokerError::MalformedPayload(
            "expected a JSON object".to_string(),
        ));
    };

    match root.remove("p") {
        Some(Value::Object(body)) => Ok(body),
        Some(_) => Err(BrokerError::MalformedPayload(
            "\"p\" must be an object".to_string(),
        )),
        None if root.contains_key("type") => Err(BrokerError::MalformedPayload(
            "envelope without \"p\" body".to_string(),
        )),
        None => Ok(root),
    }
}

// ============================================================================
// FRAMES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    Text,
    Binary,
}

/// One discrete unit sent to a single connection
///
/// The payload is shared so a broadcast fans out without copying bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub mode: FrameMode,
    pub payload: Arc<[u8]>,
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            mode: FrameMode::Text,
            payload: Arc::from(text.into().into_bytes()),
        }
    }

    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            mode: FrameMode::Binary,
            payload: Arc::from(bytes.into()),
        }
    }

    /// Payload as text, for text frames holding valid UTF-8
    pub fn as_text(&self) -> Option<&str> {
        match self.mode {
            FrameMode::Text => std::str::from_utf8(&self.payload).ok(),
            FrameMode::Binary => None,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

// ============================================================================
// QUEUED MESSAGES
// ============================================================================

/// Pending outbound message, owned by whichever queue holds it
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: String,
    /// None = broadcast to every subscriber of the topic
    pub target: Option<ConnectionId>,
    pub origin: String,
    pub payload: Vec<u8>,
    pub mode: FrameMode,
}

impl OutboundMessage {
    /// State frame for a topic, serialized once at construction
    pub fn state(
        topic: impl Into<String>,
        origin: impl Into<String>,
        body: Map<String, Value>,
    ) -> Result<Self, serde_json::Error> {
        let origin = origin.into();
        let json = WsEnvelope::payload(origin.clone(), body).to_json()?;
        Ok(Self {
            topic: topic.into(),
            target: None,
            origin,
            payload: json.into_bytes(),
            mode: FrameMode::Text,
        })
    }

    /// Pre-built frame, passed through untouched
    pub fn raw(topic: impl Into<String>, payload: impl Into<Vec<u8>>, mode: FrameMode) -> Self {
        Self {
            topic: topic.into(),
            target: None,
            origin: SERVER_ORIGIN.to_string(),
            payload: payload.into(),
            mode,
        }
    }

    pub fn with_target(mut self, target: ConnectionId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.target.is_none()
    }

    pub fn into_frame(self) -> Frame {
        Frame {
            mode: self.mode,
            payload: Arc::from(self.payload),
        }
    }
}

/// Raw client frame awaiting parse and dispatch
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub source: ConnectionId,
    pub payload: Vec<u8>,
    pub mode: FrameMode,
}

impl InboundMessage {
    pub fn text(topic: impl Into<String>, source: ConnectionId, text: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            source,
            payload: text.into().into_bytes(),
            mode: FrameMode::Text,
        }
    }
}
