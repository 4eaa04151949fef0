//! Dedicated-server transport: the server process is the permanent
//! authority of its room. WebSocket sessions feed it through an mpsc inbox
//! and receive everything it publishes through a filtered broadcast.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::ws::protocol::ServerMsg;

use super::{input_key, PeerId, PeerInfo, Target, Transport, TransportError, TransportEvent};

/// Peer id the server uses for itself
pub const SERVER_PEER_ID: &str = "server";

/// Traffic from WebSocket sessions into the room
#[derive(Debug, Clone)]
pub enum PeerMessage {
    Joined(PeerInfo),
    Left(PeerId),
    Input {
        peer: PeerId,
        value: Value,
    },
    Call {
        from: PeerId,
        event: String,
        payload: Value,
        target: Target,
    },
}

/// Who an outbound message is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    All,
    AllExcept(PeerId),
    Only(PeerId),
}

/// A message published by the room, filtered by each session's writer
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: Recipients,
    pub msg: ServerMsg,
}

impl Outbound {
    pub fn is_for(&self, peer: &str) -> bool {
        match &self.to {
            Recipients::All => true,
            Recipients::AllExcept(except) => except != peer,
            Recipients::Only(only) => only == peer,
        }
    }
}

pub struct ServerTransport {
    peer: PeerInfo,
    code: String,
    open: bool,
    capacity: usize,
    inbound: mpsc::UnboundedReceiver<PeerMessage>,
    outbound: broadcast::Sender<Outbound>,
    peers: Vec<PeerInfo>,
    slots: HashMap<String, Value>,
    pending: VecDeque<TransportEvent>,
}

impl ServerTransport {
    pub fn new(
        code: String,
        capacity: usize,
        inbound: mpsc::UnboundedReceiver<PeerMessage>,
        outbound: broadcast::Sender<Outbound>,
    ) -> Self {
        let peer = PeerInfo {
            id: SERVER_PEER_ID.to_string(),
            display_name: "Server".to_string(),
        };
        let pending = VecDeque::from([
            TransportEvent::PeerJoined(peer.clone()),
            TransportEvent::AuthorityChanged {
                authority: Some(peer.id.clone()),
            },
        ]);
        Self {
            peer,
            code,
            open: true,
            capacity,
            inbound,
            outbound,
            peers: Vec::new(),
            slots: HashMap::new(),
            pending,
        }
    }

    /// Connected WebSocket peers (the server itself excluded)
    pub fn remote_peer_count(&self) -> usize {
        self.peers.len()
    }

    fn publish(&self, to: Recipients, msg: ServerMsg) {
        // No receivers just means nobody is connected yet
        let _ = self.outbound.send(Outbound { to, msg });
    }

    fn handle(&mut self, message: PeerMessage) {
        match message {
            PeerMessage::Joined(info) => {
                if self.peers.iter().any(|p| p.id == info.id) {
                    debug!(room = %self.code, peer_id = %info.id, "Duplicate join ignored");
                    return;
                }
                if self.peers.len() >= self.capacity {
                    warn!(room = %self.code, peer_id = %info.id, "Room full, rejecting peer");
                    self.publish(
                        Recipients::Only(info.id.clone()),
                        ServerMsg::error("room_full", "Room is full"),
                    );
                    return;
                }
                self.peers.push(info.clone());
                self.publish(
                    Recipients::AllExcept(info.id.clone()),
                    ServerMsg::PeerJoined { peer: info.clone() },
                );
                // Late joiners need the current replicated slots
                for (key, value) in &self.slots {
                    if key.starts_with("input:") {
                        continue;
                    }
                    self.publish(
                        Recipients::Only(info.id.clone()),
                        ServerMsg::State {
                            key: key.clone(),
                            value: value.clone(),
                        },
                    );
                }
                self.pending.push_back(TransportEvent::PeerJoined(info));
            }
            PeerMessage::Left(peer_id) => {
                let before = self.peers.len();
                self.peers.retain(|p| p.id != peer_id);
                if self.peers.len() == before {
                    return;
                }
                self.slots.remove(&input_key(&peer_id));
                self.publish(
                    Recipients::All,
                    ServerMsg::PeerLeft {
                        peer_id: peer_id.clone(),
                    },
                );
                self.pending.push_back(TransportEvent::PeerLeft(peer_id));
            }
            PeerMessage::Input { peer, value } => {
                if self.peers.iter().any(|p| p.id == peer) {
                    self.slots.insert(input_key(&peer), value);
                }
            }
            PeerMessage::Call {
                from,
                event,
                payload,
                target,
            } => {
                let relayed = ServerMsg::Event {
                    from: from.clone(),
                    event: event.clone(),
                    payload: payload.clone(),
                };
                match target {
                    Target::All => self.publish(Recipients::All, relayed),
                    Target::Others => self.publish(Recipients::AllExcept(from.clone()), relayed),
                    Target::Authority => {}
                }
                self.pending.push_back(TransportEvent::Reliable {
                    from,
                    event,
                    payload,
                });
            }
        }
    }
}

impl Transport for ServerTransport {
    fn create_session(&mut self) -> Result<String, TransportError> {
        self.open = true;
        Ok(self.code.clone())
    }

    fn join_session(&mut self, code: &str) -> Result<(), TransportError> {
        if code == self.code {
            self.open = true;
            Ok(())
        } else {
            Err(TransportError::SessionNotFound(code.to_string()))
        }
    }

    fn leave_session(&mut self) {
        if self.open {
            self.open = false;
            self.publish(
                Recipients::All,
                ServerMsg::error("room_closed", "Room closed by server"),
            );
        }
    }

    fn session_code(&self) -> Option<&str> {
        self.open.then_some(self.code.as_str())
    }

    fn local_peer(&self) -> &PeerInfo {
        &self.peer
    }

    fn authority(&self) -> Option<PeerId> {
        Some(self.peer.id.clone())
    }

    fn peers(&self) -> Vec<PeerInfo> {
        std::iter::once(self.peer.clone())
            .chain(self.peers.iter().cloned())
            .collect()
    }

    fn call_reliable(
        &mut self,
        event: &str,
        payload: Value,
        target: Target,
    ) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotConnected);
        }
        let msg = ServerMsg::Event {
            from: self.peer.id.clone(),
            event: event.to_string(),
            payload: payload.clone(),
        };
        match target {
            Target::All => {
                self.publish(Recipients::All, msg);
                self.pending.push_back(TransportEvent::Reliable {
                    from: self.peer.id.clone(),
                    event: event.to_string(),
                    payload,
                });
            }
            Target::Others => self.publish(Recipients::All, msg),
            Target::Authority => self.pending.push_back(TransportEvent::Reliable {
                from: self.peer.id.clone(),
                event: event.to_string(),
                payload,
            }),
        }
        Ok(())
    }

    fn replicate_unreliable(&mut self, key: &str, value: Value) {
        self.publish(
            Recipients::All,
            ServerMsg::State {
                key: key.to_string(),
                value: value.clone(),
            },
        );
        self.slots.insert(key.to_string(), value);
    }

    fn read_replicated(&self, key: &str) -> Option<Value> {
        self.slots.get(key).cloned()
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        loop {
            match self.inbound.try_recv() {
                Ok(message) => self.handle(message),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    debug!(room = %self.code, "Inbound channel closed");
                    break;
                }
            }
        }
        self.pending.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn peer(id: &str) -> PeerInfo {
        PeerInfo {
            id: id.to_string(),
            display_name: id.to_uppercase(),
        }
    }

    fn transport(capacity: usize) -> (
        ServerTransport,
        mpsc::UnboundedSender<PeerMessage>,
        broadcast::Receiver<Outbound>,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = broadcast::channel(64);
        (ServerTransport::new("ABCD".into(), capacity, in_rx, out_tx), in_tx, out_rx)
    }

    #[test]
    fn server_is_permanent_authority() {
        let (t, _, _) = transport(4);
        assert!(t.is_authority());
        assert_eq!(t.authority().as_deref(), Some(SERVER_PEER_ID));
    }

    #[test]
    fn join_wrong_code_fails() {
        let (mut t, _, _) = transport(4);
        assert!(t.join_session("ABCD").is_ok());
        assert!(matches!(
            t.join_session("WXYZ"),
            Err(TransportError::SessionNotFound(_))
        ));
    }

    #[test]
    fn inbound_messages_become_events_and_slots() {
        let (mut t, tx, _rx) = transport(4);
        t.poll_events();

        tx.send(PeerMessage::Joined(peer("p1"))).unwrap();
        tx.send(PeerMessage::Input {
            peer: "p1".into(),
            value: json!({"seq": 1}),
        })
        .unwrap();
        tx.send(PeerMessage::Call {
            from: "p1".into(),
            event: "requestStart".into(),
            payload: Value::Null,
            target: Target::Authority,
        })
        .unwrap();

        let events = t.poll_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], TransportEvent::PeerJoined(peer("p1")));
        assert_eq!(t.read_replicated("input:p1"), Some(json!({"seq": 1})));
        assert_eq!(t.peers().len(), 2);
    }

    #[test]
    fn capacity_is_enforced() {
        let (mut t, tx, mut rx) = transport(1);
        t.poll_events();
        tx.send(PeerMessage::Joined(peer("p1"))).unwrap();
        tx.send(PeerMessage::Joined(peer("p2"))).unwrap();
        let events = t.poll_events();
        assert_eq!(events.len(), 1);
        assert_eq!(t.remote_peer_count(), 1);

        let mut rejected = false;
        while let Ok(out) = rx.try_recv() {
            if out.is_for("p2") && matches!(out.msg, ServerMsg::Error { .. }) {
                rejected = true;
            }
        }
        assert!(rejected);
    }

    #[test]
    fn others_target_skips_loopback() {
        let (mut t, _tx, mut rx) = transport(4);
        t.poll_events();
        t.call_reliable("phase", json!(2), Target::Others).unwrap();
        assert!(t.poll_events().is_empty());
        assert!(matches!(rx.try_recv().unwrap().msg, ServerMsg::Event { .. }));
    }

    #[test]
    fn recipients_filter() {
        let out = Outbound {
            to: Recipients::AllExcept("a".into()),
            msg: ServerMsg::Pong { t: 1 },
        };
        assert!(!out.is_for("a"));
        assert!(out.is_for("b"));
    }
}
