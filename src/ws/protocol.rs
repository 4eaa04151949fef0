//! WebSocket protocol message definitions
//! These are the wire types between browser peers and the dedicated server

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::{PeerId, PeerInfo, Target};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Controller state, sent at the input cadence whether or not it changed
    Input {
        /// Monotonic per-sender counter; a repeat value is not a refresh
        seq: u64,
        button_a: bool,
        button_b: bool,
        #[serde(default)]
        dash_requested: bool,
        /// Client capture timestamp
        captured_at_ms: u64,
    },

    /// One-shot reliable event (start/restart requests, cues)
    Call {
        event: String,
        #[serde(default)]
        payload: Value,
        target: Target,
    },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },

    /// Leave the room
    Leave,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        peer_id: PeerId,
        room_code: String,
        authority: PeerId,
        server_time: u64,
    },

    /// Reliable event relayed from a peer or emitted by the authority
    Event {
        from: PeerId,
        event: String,
        payload: Value,
    },

    /// Latest value of a replicated slot (snapshot, roster)
    State { key: String, value: Value },

    /// Peer joined the room
    PeerJoined { peer: PeerInfo },

    /// Peer left the room
    PeerLeft { peer_id: PeerId },

    /// Error message
    Error { code: String, message: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

impl ServerMsg {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}
