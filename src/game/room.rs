//! Rooms hosted by the dedicated server. Each room is a tokio task running
//! a headless [`GameSession`] at the simulation rate.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::SimulationConfig;
use crate::transport::{generate_room_code, Outbound, PeerMessage, ServerTransport};
use crate::util::time::{unix_millis, Timer};

use super::arena::ArenaSimulation;
use super::session::{GameSession, SessionError, SessionEvent};

/// A room nobody has joined within this window is closed
const IDLE_ROOM_TIMEOUT_MS: u64 = 60_000;

/// Outbound queue depth per room; slow sockets skip ahead past it
const OUTBOUND_CAPACITY: usize = 256;

/// Handle to a running room, cloned into every WebSocket session
#[derive(Clone)]
pub struct RoomHandle {
    pub code: String,
    pub inbox: mpsc::UnboundedSender<PeerMessage>,
    pub outbound: broadcast::Sender<Outbound>,
    pub player_count: Arc<AtomicUsize>,
    pub capacity: usize,
}

impl RoomHandle {
    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::Relaxed)
    }

    pub fn is_full(&self) -> bool {
        self.player_count() >= self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.outbound.subscribe()
    }

    /// Hand a message to the room task. False once the room has closed.
    pub fn send(&self, message: PeerMessage) -> bool {
        self.inbox.send(message).is_ok()
    }
}

/// Registry of running rooms
pub struct RoomRegistry {
    rooms: DashMap<String, RoomHandle>,
    config: SimulationConfig,
}

impl RoomRegistry {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            rooms: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Open a room and spawn its tick task. Must run inside a tokio runtime.
    pub fn create(self: &Arc<Self>) -> Result<RoomHandle, SessionError> {
        let mut rng = rand::thread_rng();
        let code = loop {
            let code = generate_room_code(&mut rng);
            if !self.rooms.contains_key(&code) {
                break code;
            }
        };

        let mut config = self.config.clone();
        config.seed = rand::random();
        let (room, handle) = GameRoom::new(code, config)?;
        self.rooms.insert(handle.code.clone(), handle.clone());

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let code = room.code.clone();
            room.run().await;
            registry.remove(&code);
        });
        Ok(handle)
    }

    pub fn get(&self, code: &str) -> Option<RoomHandle> {
        self.rooms
            .get(&code.to_ascii_uppercase())
            .map(|r| r.value().clone())
    }

    pub fn remove(&self, code: &str) -> Option<RoomHandle> {
        self.rooms.remove(code).map(|(_, h)| h)
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.len()
    }

    pub fn total_players(&self) -> usize {
        self.rooms.iter().map(|r| r.value().player_count()).sum()
    }
}

/// The server-side half of a room
struct GameRoom {
    code: String,
    session: GameSession<ServerTransport, ArenaSimulation>,
    player_count: Arc<AtomicUsize>,
    tick_ms: u64,
}

impl GameRoom {
    fn new(code: String, config: SimulationConfig) -> Result<(Self, RoomHandle), SessionError> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (outbound_tx, _) = broadcast::channel(OUTBOUND_CAPACITY);
        let player_count = Arc::new(AtomicUsize::new(0));

        let transport = ServerTransport::new(
            code.clone(),
            config.max_players,
            inbox_rx,
            outbound_tx.clone(),
        );
        let sim = ArenaSimulation::new(&config);
        let capacity = config.max_players;
        let tick_ms = config.tick_ms();
        let mut session = GameSession::dedicated(transport, sim, config)?;
        session.create_room()?;

        let handle = RoomHandle {
            code: code.clone(),
            inbox: inbox_tx,
            outbound: outbound_tx,
            player_count: player_count.clone(),
            capacity,
        };
        Ok((
            Self {
                code,
                session,
                player_count,
                tick_ms,
            },
            handle,
        ))
    }

    async fn run(mut self) {
        info!(room = %self.code, "Room opened");

        let mut tick_interval = interval(Duration::from_millis(self.tick_ms));
        tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let opened_at = unix_millis();
        let mut had_peers = false;

        loop {
            tick_interval.tick().await;
            let timer = Timer::new();
            let now = unix_millis();

            if let Err(e) = self.session.tick(now) {
                error!(room = %self.code, error = %e, "Room tick failed");
            }
            self.log_events();

            let peers = self.session.transport().remote_peer_count();
            self.player_count.store(peers, Ordering::Relaxed);
            had_peers |= peers > 0;

            let elapsed = timer.elapsed_ms();
            if elapsed > self.tick_ms {
                warn!(room = %self.code, elapsed_ms = elapsed, budget_ms = self.tick_ms, "Slow room tick");
            }

            if had_peers && peers == 0 {
                info!(room = %self.code, "All peers left, closing room");
                break;
            }
            if !had_peers && now.saturating_sub(opened_at) > IDLE_ROOM_TIMEOUT_MS {
                info!(room = %self.code, "Nobody joined, closing room");
                break;
            }
        }

        self.session.leave();
    }

    fn log_events(&mut self) {
        for event in self.session.drain_events() {
            match event {
                SessionEvent::PhaseChanged(state) => {
                    info!(room = %self.code, phase = ?state.phase, round = state.current_round, "Phase changed");
                }
                SessionEvent::GameOver(over) => {
                    info!(room = %self.code, winner = ?over.winner_id, "Game over");
                }
                SessionEvent::RoundResult(result) => {
                    info!(room = %self.code, winner = ?result.winner_id, tie = result.is_tie, "Round over");
                }
                SessionEvent::PeerJoined(peer) => {
                    debug!(room = %self.code, peer_id = %peer.id, "Peer entered room");
                }
                SessionEvent::PeerLeft(peer) => {
                    debug!(room = %self.code, peer_id = %peer, "Peer left room");
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PeerInfo;
    use crate::ws::protocol::ServerMsg;
    use tokio::time::timeout;

    fn peer(id: &str) -> PeerInfo {
        PeerInfo {
            id: id.to_string(),
            display_name: id.to_uppercase(),
        }
    }

    #[tokio::test]
    async fn room_publishes_roster_to_joined_peer() {
        let registry = Arc::new(RoomRegistry::new(SimulationConfig::default()));
        let handle = tokio_test::assert_ok!(registry.create());
        assert_eq!(registry.active_rooms(), 1);
        assert!(registry.get(&handle.code.to_lowercase()).is_some());

        let mut rx = handle.subscribe();
        assert!(handle.send(PeerMessage::Joined(peer("p1"))));

        let roster = timeout(Duration::from_secs(2), async {
            loop {
                let out = rx.recv().await.unwrap();
                if !out.is_for("p1") {
                    continue;
                }
                if let ServerMsg::State { key, value } = out.msg {
                    // An empty roster may go out before the join is processed
                    if key == "roster" && value.as_array().is_some_and(|r| !r.is_empty()) {
                        return value;
                    }
                }
            }
        })
        .await;
        let roster = tokio_test::assert_ok!(roster);
        assert_eq!(roster.as_array().map(Vec::len), Some(1));
        assert_eq!(roster[0]["display_name"], "P1");

        // The count is stored after the tick that published the roster
        let counted = timeout(Duration::from_secs(2), async {
            while handle.player_count() != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        tokio_test::assert_ok!(counted);
    }

    #[tokio::test]
    async fn room_closes_when_last_peer_leaves() {
        let registry = Arc::new(RoomRegistry::new(SimulationConfig::default()));
        let handle = tokio_test::assert_ok!(registry.create());
        handle.send(PeerMessage::Joined(peer("p1")));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(handle.player_count(), 1);

        handle.send(PeerMessage::Left("p1".into()));
        let closed = timeout(Duration::from_secs(2), async {
            while registry.active_rooms() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        tokio_test::assert_ok!(closed);
        assert!(registry.get(&handle.code).is_none());
    }
}
