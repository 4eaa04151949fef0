//! Peer-relay transport: rooms live in a shared in-process hub that relays
//! reliable events and replicated slots between peers.

use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{generate_room_code, input_key, PeerId, PeerInfo, Target, Transport, TransportError, TransportEvent};

struct RelayRoom {
    /// Join order; the first entry is elected authority on handoff
    peers: Vec<PeerInfo>,
    authority: Option<PeerId>,
    slots: HashMap<String, Value>,
    inboxes: HashMap<PeerId, VecDeque<TransportEvent>>,
}

impl RelayRoom {
    fn new() -> Self {
        Self {
            peers: Vec::new(),
            authority: None,
            slots: HashMap::new(),
            inboxes: HashMap::new(),
        }
    }

    fn push_to(&mut self, peer: &str, event: TransportEvent) {
        if let Some(inbox) = self.inboxes.get_mut(peer) {
            inbox.push_back(event);
        }
    }

    fn push_except(&mut self, except: Option<&str>, event: &TransportEvent) {
        for (id, inbox) in self.inboxes.iter_mut() {
            if Some(id.as_str()) != except {
                inbox.push_back(event.clone());
            }
        }
    }
}

struct HubState {
    rooms: HashMap<String, RelayRoom>,
    rng: ChaCha8Rng,
    capacity: usize,
}

/// Shared relay all [`RelayTransport`]s of one process connect through
#[derive(Clone)]
pub struct RelayHub {
    inner: Arc<Mutex<HubState>>,
}

impl RelayHub {
    pub fn new(capacity: usize) -> Self {
        Self::with_seed(capacity, rand::random())
    }

    /// Deterministic room codes
    pub fn with_seed(capacity: usize, seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubState {
                rooms: HashMap::new(),
                rng: ChaCha8Rng::seed_from_u64(seed),
                capacity,
            })),
        }
    }

    /// Connect a new peer to the hub (not yet in any room)
    pub fn connect(&self, display_name: &str) -> RelayTransport {
        RelayTransport {
            hub: self.clone(),
            peer: PeerInfo {
                id: Uuid::new_v4().to_string(),
                display_name: display_name.to_string(),
            },
            room: None,
        }
    }

    pub fn room_count(&self) -> usize {
        self.inner.lock().rooms.len()
    }

    pub fn peer_count(&self, code: &str) -> usize {
        self.inner
            .lock()
            .rooms
            .get(code)
            .map(|r| r.peers.len())
            .unwrap_or(0)
    }

    fn remove_peer(&self, code: &str, peer: &str) {
        let mut state = self.inner.lock();
        let Some(room) = state.rooms.get_mut(code) else {
            return;
        };
        let Some(pos) = room.peers.iter().position(|p| p.id == peer) else {
            return;
        };
        room.peers.remove(pos);
        room.inboxes.remove(peer);
        room.slots.remove(&input_key(peer));
        room.push_except(None, &TransportEvent::PeerLeft(peer.to_string()));

        if room.authority.as_deref() == Some(peer) {
            room.authority = room.peers.first().map(|p| p.id.clone());
            info!(room = %code, authority = ?room.authority, "Relay authority re-elected");
            let event = TransportEvent::AuthorityChanged {
                authority: room.authority.clone(),
            };
            room.push_except(None, &event);
        }

        if room.peers.is_empty() {
            state.rooms.remove(code);
            debug!(room = %code, "Relay room closed");
        }
    }
}

/// One peer's connection to a [`RelayHub`]
pub struct RelayTransport {
    hub: RelayHub,
    peer: PeerInfo,
    room: Option<String>,
}

impl RelayTransport {
    fn with_room<R>(&self, f: impl FnOnce(&mut RelayRoom) -> R) -> Result<R, TransportError> {
        let code = self.room.as_deref().ok_or(TransportError::NotConnected)?;
        let mut state = self.hub.inner.lock();
        let room = state
            .rooms
            .get_mut(code)
            .ok_or_else(|| TransportError::SessionNotFound(code.to_string()))?;
        Ok(f(room))
    }
}

impl Transport for RelayTransport {
    fn create_session(&mut self) -> Result<String, TransportError> {
        self.leave_session();

        let mut state = self.hub.inner.lock();
        let code = loop {
            let code = generate_room_code(&mut state.rng);
            if !state.rooms.contains_key(&code) {
                break code;
            }
        };

        let mut room = RelayRoom::new();
        room.peers.push(self.peer.clone());
        room.authority = Some(self.peer.id.clone());
        room.inboxes.insert(
            self.peer.id.clone(),
            VecDeque::from([
                TransportEvent::PeerJoined(self.peer.clone()),
                TransportEvent::AuthorityChanged {
                    authority: Some(self.peer.id.clone()),
                },
            ]),
        );
        state.rooms.insert(code.clone(), room);
        drop(state);

        info!(room = %code, peer_id = %self.peer.id, "Relay session created");
        self.room = Some(code.clone());
        Ok(code)
    }

    fn join_session(&mut self, code: &str) -> Result<(), TransportError> {
        if self.room.as_deref() == Some(code) {
            return Ok(());
        }
        self.leave_session();

        let mut state = self.hub.inner.lock();
        let capacity = state.capacity;
        let room = state
            .rooms
            .get_mut(code)
            .ok_or_else(|| TransportError::SessionNotFound(code.to_string()))?;
        if room.peers.len() >= capacity {
            return Err(TransportError::SessionFull);
        }

        room.push_except(None, &TransportEvent::PeerJoined(self.peer.clone()));
        room.peers.push(self.peer.clone());

        let mut inbox: VecDeque<TransportEvent> = room
            .peers
            .iter()
            .cloned()
            .map(TransportEvent::PeerJoined)
            .collect();
        inbox.push_back(TransportEvent::AuthorityChanged {
            authority: room.authority.clone(),
        });
        room.inboxes.insert(self.peer.id.clone(), inbox);
        drop(state);

        info!(room = %code, peer_id = %self.peer.id, "Joined relay session");
        self.room = Some(code.to_string());
        Ok(())
    }

    fn leave_session(&mut self) {
        if let Some(code) = self.room.take() {
            self.hub.remove_peer(&code, &self.peer.id);
            info!(room = %code, peer_id = %self.peer.id, "Left relay session");
        }
    }

    fn session_code(&self) -> Option<&str> {
        self.room.as_deref()
    }

    fn local_peer(&self) -> &PeerInfo {
        &self.peer
    }

    fn authority(&self) -> Option<PeerId> {
        self.with_room(|room| room.authority.clone()).ok().flatten()
    }

    fn peers(&self) -> Vec<PeerInfo> {
        self.with_room(|room| room.peers.clone()).unwrap_or_default()
    }

    fn call_reliable(
        &mut self,
        event: &str,
        payload: Value,
        target: Target,
    ) -> Result<(), TransportError> {
        let me = self.peer.id.clone();
        self.with_room(|room| {
            let msg = TransportEvent::Reliable {
                from: me.clone(),
                event: event.to_string(),
                payload,
            };
            match target {
                Target::All => room.push_except(None, &msg),
                Target::Others => room.push_except(Some(me.as_str()), &msg),
                Target::Authority => {
                    if let Some(authority) = room.authority.clone() {
                        room.push_to(&authority, msg);
                    }
                }
            }
        })
    }

    fn replicate_unreliable(&mut self, key: &str, value: Value) {
        let _ = self.with_room(|room| {
            room.slots.insert(key.to_string(), value);
        });
    }

    fn read_replicated(&self, key: &str) -> Option<Value> {
        self.with_room(|room| room.slots.get(key).cloned())
            .ok()
            .flatten()
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        let me = self.peer.id.clone();
        self.with_room(|room| {
            room.inboxes
                .get_mut(&me)
                .map(|inbox| inbox.drain(..).collect())
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.leave_session();
    }
}
