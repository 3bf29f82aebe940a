use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::{PeerId, PeerIdentity};

/// The message types understood by a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// Admission failed, the payload is a [RoomErrorCode]
    #[serde(rename = "ROOM/ERROR")]
    Error,
    /// Sent to a peer once it is admitted, listing the peers already present
    #[serde(rename = "ROOM/JOIN")]
    Join,
    /// Another peer was admitted
    #[serde(rename = "ROOM/PEER_JOIN")]
    PeerJoin,
    /// Another peer disconnected or was removed
    #[serde(rename = "ROOM/PEER_LEAVE")]
    PeerLeave,
    /// Negotiation payload addressed to a single peer
    #[serde(rename = "ROOM/PEER_SIGNAL")]
    PeerSignal,
    /// Cursor position
    #[serde(rename = "ROOM/PEER_POINTER")]
    PeerPointer,
    /// Media stream metadata
    #[serde(rename = "ROOM/PEER_STREAM")]
    PeerStream,
    #[serde(rename = "ROOM/ADD_PHOTO")]
    AddPhoto,
    #[serde(rename = "ROOM/MOVE_PHOTO")]
    MovePhoto,
    #[serde(rename = "ROOM/REMOVE_PHOTO")]
    RemovePhoto,
}

/// How an inbound envelope of a given kind is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Only the server may produce this kind
    ServerOnly,
    /// Delivered to the peer named in the payload
    PointToPoint,
    /// Delivered to every other peer in the session
    FanOut,
}

impl EnvelopeKind {
    pub fn routing(&self) -> Routing {
        match self {
            Self::Error | Self::Join | Self::PeerJoin | Self::PeerLeave => Routing::ServerOnly,
            Self::PeerSignal => Routing::PointToPoint,
            Self::PeerPointer
            | Self::PeerStream
            | Self::AddPhoto
            | Self::MovePhoto
            | Self::RemovePhoto => Routing::FanOut,
        }
    }
}

/// The reason a join attempt was refused, sent as the payload of `ROOM/ERROR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomErrorCode {
    NotFound,
    Unauthorized,
    FullRoom,
}

/// A relay message, `{ "type": ..., "payload": ... }` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, payload: Value) -> Self {
        Self { kind, payload }
    }

    pub fn error(code: RoomErrorCode) -> Self {
        Self::new(EnvelopeKind::Error, json!(code))
    }

    /// Welcomes an admitted peer with the peers that were already there
    pub fn join(peer: PeerId, peers: &[(PeerId, PeerIdentity)]) -> Self {
        let peers: Vec<_> = peers
            .iter()
            .map(|(id, user)| json!({ "peer": id, "user": user }))
            .collect();

        Self::new(EnvelopeKind::Join, json!({ "peer": peer, "peers": peers }))
    }

    pub fn peer_join(peer: PeerId, user: &PeerIdentity) -> Self {
        Self::new(EnvelopeKind::PeerJoin, json!({ "peer": peer, "user": user }))
    }

    pub fn peer_leave(peer: PeerId) -> Self {
        Self::new(EnvelopeKind::PeerLeave, json!({ "peer": peer }))
    }

    /// Parses a text frame
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).expect("envelope serializes")
    }

    /// The peer named in the payload, if any
    pub fn target(&self) -> Option<PeerId> {
        self.payload
            .get("peer")
            .and_then(Value::as_u64)
            .map(PeerId::from_value)
    }

    /// Returns a copy of the envelope with the sender written into the payload.
    ///
    /// Object payloads get their `peer` field replaced, anything else is wrapped
    /// as `{ "peer": sender, "data": payload }`.
    pub fn stamped(&self, sender: PeerId) -> Self {
        let payload = match &self.payload {
            Value::Object(fields) => {
                let mut fields: Map<String, Value> = fields.clone();
                fields.insert("peer".to_string(), json!(sender));
                Value::Object(fields)
            }
            other => json!({ "peer": sender, "data": other }),
        };

        Self::new(self.kind, payload)
    }
}
