//! Signaling protocol between a participant and the relay.
//!
//! Wire format (MessagePack map, named fields):
//! ```text
//! ┌─────────────┬──────────────────────────────┬────────┬────────┬──────────┐
//! │ t           │ op                           │ p      │ c      │ pl       │
//! │ control|data│ channel_join|peer_online|... │ sender │ channel│ bin      │
//! │ required    │ control only                 │ opt.   │ req.   │ opt.     │
//! └─────────────┴──────────────────────────────┴────────┴────────┴──────────┘
//! ```
//!
//! `pl` carries a MessagePack-encoded [`State`] for `channel_join` and
//! `peer_state`, or a MessagePack-encoded [`DataEnvelope`] for data frames.
//! In Rust the flat wire struct is only an encoding detail: callers work
//! with [`Signal`], where each variant holds exactly the fields it needs.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::serializer::Serialized;

/// Participant metadata keyed by string. Must carry an `id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(Map<String, Value>);

impl State {
    /// Create a state holding only `id`.
    pub fn new(id: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("id".to_string(), Value::String(id.into()));
        Self(map)
    }

    /// Wrap an arbitrary JSON object.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Build from a JSON value; `None` unless it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// The participant id, coerced to a string.
    ///
    /// Ids that went through a decoder may come back as numbers or bools;
    /// comparisons always happen on the string form.
    pub fn id(&self) -> Option<String> {
        self.0.get("id").and_then(id_string)
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.0.insert("id".to_string(), Value::String(id.into()));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Insert a field, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Builder-style [`State::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Shallow merge: every field of `patch` overwrites the same field here.
    pub fn merge(&mut self, patch: &State) {
        for (key, value) in &patch.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode as a binary payload (`pl`).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec_named(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode a binary payload (`pl`).
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

impl From<Map<String, Value>> for State {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// String form of an id value. Objects, arrays and null have none.
pub(crate) fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// The sender of an inbound data event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub id: String,
}

/// Control operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlOp {
    /// Join handshake; echoed back by the relay when accepted
    ChannelJoin,
    /// A participant came online in the channel
    PeerOnline,
    /// Full state of a participant
    PeerState,
    /// A participant left the channel
    PeerOffline,
}

impl ControlOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChannelJoin => "channel_join",
            Self::PeerOnline => "peer_online",
            Self::PeerState => "peer_state",
            Self::PeerOffline => "peer_offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "channel_join" => Some(Self::ChannelJoin),
            "peer_online" => Some(Self::PeerOnline),
            "peer_state" => Some(Self::PeerState),
            "peer_offline" => Some(Self::PeerOffline),
            _ => None,
        }
    }
}

const KIND_CONTROL: &str = "control";
const KIND_DATA: &str = "data";

/// Flat on-the-wire representation.
#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    t: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    op: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    p: Option<String>,
    c: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pl: Option<Bytes>,
}

/// One signaling frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Control {
        op: ControlOp,
        channel: String,
        peer: Option<String>,
        payload: Option<Bytes>,
    },
    Data {
        channel: String,
        peer: Option<String>,
        payload: Bytes,
    },
}

impl Signal {
    /// Join handshake carrying the joiner's state.
    pub fn join(channel: impl Into<String>, state: &State) -> Result<Self, ProtocolError> {
        Ok(Self::Control {
            op: ControlOp::ChannelJoin,
            channel: channel.into(),
            peer: state.id(),
            payload: Some(Bytes::from(state.encode()?)),
        })
    }

    pub fn online(channel: impl Into<String>, peer: impl Into<String>) -> Self {
        Self::Control {
            op: ControlOp::PeerOnline,
            channel: channel.into(),
            peer: Some(peer.into()),
            payload: None,
        }
    }

    /// Full-state sync of `state`'s owner.
    pub fn state(channel: impl Into<String>, state: &State) -> Result<Self, ProtocolError> {
        Ok(Self::Control {
            op: ControlOp::PeerState,
            channel: channel.into(),
            peer: state.id(),
            payload: Some(Bytes::from(state.encode()?)),
        })
    }

    pub fn offline(channel: impl Into<String>, peer: impl Into<String>) -> Self {
        Self::Control {
            op: ControlOp::PeerOffline,
            channel: channel.into(),
            peer: Some(peer.into()),
            payload: None,
        }
    }

    /// Application event.
    pub fn data(
        channel: impl Into<String>,
        peer: Option<String>,
        envelope: &DataEnvelope,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::Data {
            channel: channel.into(),
            peer,
            payload: Bytes::from(envelope.encode()?),
        })
    }

    pub fn channel(&self) -> &str {
        match self {
            Self::Control { channel, .. } | Self::Data { channel, .. } => channel,
        }
    }

    pub fn peer(&self) -> Option<&str> {
        match self {
            Self::Control { peer, .. } | Self::Data { peer, .. } => peer.as_deref(),
        }
    }

    pub fn op(&self) -> Option<ControlOp> {
        match self {
            Self::Control { op, .. } => Some(*op),
            Self::Data { .. } => None,
        }
    }

    /// Same frame with the sender id replaced.
    pub fn with_peer(self, id: impl Into<String>) -> Self {
        let id = Some(id.into());
        match self {
            Self::Control { op, channel, payload, .. } => Self::Control {
                op,
                channel,
                peer: id,
                payload,
            },
            Self::Data { channel, payload, .. } => Self::Data {
                channel,
                peer: id,
                payload,
            },
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let wire = match self {
            Self::Control { op, channel, peer, payload } => WireFrame {
                t: KIND_CONTROL.to_string(),
                op: Some(op.as_str().to_string()),
                p: peer.clone(),
                c: channel.clone(),
                pl: payload.clone(),
            },
            Self::Data { channel, peer, payload } => WireFrame {
                t: KIND_DATA.to_string(),
                op: None,
                p: peer.clone(),
                c: channel.clone(),
                pl: Some(payload.clone()),
            },
        };
        rmp_serde::to_vec_named(&wire).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let wire: WireFrame =
            rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        match wire.t.as_str() {
            KIND_CONTROL => {
                let op = wire.op.ok_or(ProtocolError::MissingOp)?;
                let op = ControlOp::parse(&op).ok_or(ProtocolError::UnknownKind(op))?;
                Ok(Self::Control {
                    op,
                    channel: wire.c,
                    peer: wire.p,
                    payload: wire.pl,
                })
            }
            KIND_DATA => Ok(Self::Data {
                channel: wire.c,
                peer: wire.p,
                payload: wire.pl.unwrap_or_default(),
            }),
            _ => Err(ProtocolError::UnknownKind(wire.t)),
        }
    }
}

/// Payload of a data frame: the event name plus the serialized event data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEnvelope {
    pub event: String,
    pub data: Serialized,
}

impl DataEnvelope {
    pub fn new(event: impl Into<String>, data: Serialized) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec_named(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("control frame without op")]
    MissingOp,
    #[error("unknown frame kind: {0}")]
    UnknownKind(String),
}
