//! Session/messaging boundary between the core and the network.
//!
//! The core only ever talks to [`Transport`]. Two adapters exist: an
//! in-process peer relay ([`relay`]) and the dedicated-server adapter
//! ([`server`]) that fronts WebSocket peers.

pub mod relay;
pub mod server;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use relay::{RelayHub, RelayTransport};
pub use server::{Outbound, PeerMessage, ServerTransport};

/// Stable peer identity assigned by the transport
pub type PeerId = String;

/// Recipients of a reliable call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// Every peer, the sender included
    All,
    /// Every peer except the sender
    Others,
    /// Only the current authority
    Authority,
}

/// Identity of a connected peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub display_name: String,
}

/// Notifications drained by the tick function
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    PeerJoined(PeerInfo),
    PeerLeft(PeerId),
    AuthorityChanged { authority: Option<PeerId> },
    Reliable {
        from: PeerId,
        event: String,
        payload: Value,
    },
}

/// Non-blocking session transport. Every call returns immediately; inbound
/// traffic is queued and handed out by [`Transport::poll_events`].
pub trait Transport: Send {
    /// Open a new session with this peer in it, returning its join code
    fn create_session(&mut self) -> Result<String, TransportError>;

    /// Join an existing session by code
    fn join_session(&mut self, code: &str) -> Result<(), TransportError>;

    /// Leave the current session (no-op when not in one)
    fn leave_session(&mut self);

    /// Code of the joined session
    fn session_code(&self) -> Option<&str>;

    /// This peer's identity
    fn local_peer(&self) -> &PeerInfo;

    /// Current authority, if any peer holds it
    fn authority(&self) -> Option<PeerId>;

    fn is_authority(&self) -> bool {
        self.authority().as_deref() == Some(self.local_peer().id.as_str())
    }

    /// Peers currently in the session, in join order
    fn peers(&self) -> Vec<PeerInfo>;

    /// At-least-once, per-sender ordered one-shot event
    fn call_reliable(
        &mut self,
        event: &str,
        payload: Value,
        target: Target,
    ) -> Result<(), TransportError>;

    /// Best-effort, latest-value-wins replicated slot
    fn replicate_unreliable(&mut self, key: &str, value: Value);

    /// Latest value of a replicated slot
    fn read_replicated(&self, key: &str) -> Option<Value>;

    /// Drain queued notifications
    fn poll_events(&mut self) -> Vec<TransportEvent>;
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session is full")]
    SessionFull,

    #[error("Not connected to a session")]
    NotConnected,

    #[error("Payload encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Replicated slot carrying a peer's input
pub fn input_key(peer: &str) -> String {
    format!("input:{}", peer)
}

/// Replicated slot carrying the latest state snapshot
pub const SNAPSHOT_KEY: &str = "snapshot";

/// Replicated slot carrying the authoritative player roster
pub const ROSTER_KEY: &str = "roster";

const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const CODE_LEN: usize = 4;

/// Random four-letter room code (no I or O)
pub fn generate_room_code(rng: &mut impl Rng) -> String {
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}
