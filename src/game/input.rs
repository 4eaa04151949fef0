//! Per-tick input resolution for every simulated player, whoever controls it

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::SimulationConfig;

use super::bot::{BotBrain, WorldView};
use super::registry::{ControlKind, PlayerRegistry};
use super::PlayerId;

/// Input the simulation consumes for one player on one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInput {
    /// Primary button: turn and thrust
    pub button_a: bool,
    /// Secondary button: fire
    pub button_b: bool,
    /// One-shot dash, set by a double tap of the primary button
    pub dash_requested: bool,
    pub captured_at_ms: u64,
}

impl PlayerInput {
    /// No buttons, no dash
    pub fn neutral(now_ms: u64) -> Self {
        Self {
            captured_at_ms: now_ms,
            ..Default::default()
        }
    }

    pub fn is_neutral(&self) -> bool {
        !self.button_a && !self.button_b && !self.dash_requested
    }
}

/// Input as mirrored from a peer to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireInput {
    /// Bumped on every send; an unchanged value is not a refresh
    pub seq: u64,
    pub input: PlayerInput,
}

/// Raw state of one physical controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerState {
    pub button_a: bool,
    pub button_b: bool,
}

/// Detects a double tap of the primary button.
///
/// A rising edge within `window_ms` of the previous rising edge raises one
/// pending dash. The pair is consumed, so a third quick tap starts a new pair.
#[derive(Debug, Clone)]
pub struct DashDetector {
    window_ms: u64,
    last_rise_ms: Option<u64>,
    was_down: bool,
    pending: bool,
}

impl DashDetector {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            last_rise_ms: None,
            was_down: false,
            pending: false,
        }
    }

    pub fn sample(&mut self, down: bool, now_ms: u64) {
        if down && !self.was_down {
            match self.last_rise_ms {
                Some(prev) if now_ms.saturating_sub(prev) <= self.window_ms => {
                    self.pending = true;
                    self.last_rise_ms = None;
                }
                _ => self.last_rise_ms = Some(now_ms),
            }
        }
        self.was_down = down;
    }

    /// Returns the pending dash and clears it
    pub fn take(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }
}

#[derive(Debug, Clone)]
struct LocalSlot {
    latest: PlayerInput,
    dash: DashDetector,
}

struct CachedInput {
    input: PlayerInput,
    received_at_ms: u64,
}

/// How a single player's input is produced. Chosen when the registry
/// changes, not re-derived every tick.
pub enum Controller {
    /// The human on this device, controller slot 0
    Local { slot: u8 },
    /// A human on another peer, fed by replicated input
    Remote,
    /// Scripted opponent run by the authority
    AiBot(BotBrain),
    /// Additional controller multiplexed on this device
    LocalBot { slot: u8 },
}

impl Controller {
    pub fn kind(&self) -> ControlKind {
        match self {
            Controller::Local { .. } => ControlKind::Local,
            Controller::Remote => ControlKind::Remote,
            Controller::AiBot(_) => ControlKind::AiBot,
            Controller::LocalBot { .. } => ControlKind::LocalBot,
        }
    }
}

pub struct InputResolver {
    stale_after_ms: u64,
    send_interval_ms: u64,
    dash_window_ms: u64,
    seed: u64,
    controllers: HashMap<PlayerId, Controller>,
    local: HashMap<u8, LocalSlot>,
    remote: HashMap<PlayerId, CachedInput>,
    /// Highest seq seen per remote player, kept across eviction
    last_seq: HashMap<PlayerId, u64>,
    outgoing_seq: u64,
    last_sent_ms: Option<u64>,
}

impl InputResolver {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            stale_after_ms: config.stale_input_ms,
            send_interval_ms: config.input_send_interval_ms,
            dash_window_ms: config.dash_window_ms,
            seed: config.seed,
            controllers: HashMap::new(),
            local: HashMap::new(),
            remote: HashMap::new(),
            last_seq: HashMap::new(),
            outgoing_seq: 0,
            last_sent_ms: None,
        }
    }

    pub fn bind(&mut self, player: &str, controller: Controller) {
        self.controllers.insert(player.to_string(), controller);
    }

    pub fn unbind(&mut self, player: &str) {
        self.controllers.remove(player);
        self.remote.remove(player);
        self.last_seq.remove(player);
    }

    pub fn kind(&self, player: &str) -> Option<ControlKind> {
        self.controllers.get(player).map(Controller::kind)
    }

    /// Re-derive controllers from the registry as seen by `local_peer`.
    /// Bots whose kind is unchanged keep their brain.
    pub fn rebind(&mut self, registry: &PlayerRegistry, local_peer: &str) {
        let mut next = HashMap::new();
        for record in registry.iter() {
            let kind = record.control_kind(local_peer);
            let controller = match self.controllers.remove(&record.id) {
                Some(existing) if existing.kind() == kind => existing,
                _ => match kind {
                    ControlKind::Local => Controller::Local { slot: 0 },
                    ControlKind::Remote => Controller::Remote,
                    ControlKind::AiBot => Controller::AiBot(BotBrain::new(self.seed, &record.id)),
                    ControlKind::LocalBot => Controller::LocalBot {
                        slot: record.control.slot(),
                    },
                },
            };
            next.insert(record.id.clone(), controller);
        }
        self.remote.retain(|id, _| next.contains_key(id));
        self.last_seq.retain(|id, _| next.contains_key(id));
        self.controllers = next;
    }

    /// Record the state of a physical controller on this device
    pub fn capture(&mut self, slot: u8, state: ControllerState, now_ms: u64) {
        let window = self.dash_window_ms;
        let entry = self.local.entry(slot).or_insert_with(|| LocalSlot {
            latest: PlayerInput::default(),
            dash: DashDetector::new(window),
        });
        entry.dash.sample(state.button_a, now_ms);
        entry.latest = PlayerInput {
            button_a: state.button_a,
            button_b: state.button_b,
            dash_requested: false,
            captured_at_ms: now_ms,
        };
    }

    fn take_local(&mut self, slot: u8, now_ms: u64) -> PlayerInput {
        match self.local.get_mut(&slot) {
            Some(entry) => PlayerInput {
                dash_requested: entry.dash.take(),
                ..entry.latest
            },
            None => PlayerInput::neutral(now_ms),
        }
    }

    /// Store a remote player's input if it is newer than what we have.
    /// Returns whether the cache was refreshed.
    pub fn ingest_remote(&mut self, player: &str, wire: WireInput, now_ms: u64) -> bool {
        if let Some(&seen) = self.last_seq.get(player) {
            if wire.seq <= seen {
                return false;
            }
        }
        self.last_seq.insert(player.to_string(), wire.seq);
        self.remote.insert(
            player.to_string(),
            CachedInput {
                input: wire.input,
                received_at_ms: now_ms,
            },
        );
        true
    }

    /// Local input to mirror to the authority, at most once per send interval.
    /// A pending dash leaves with it.
    pub fn outgoing(&mut self, now_ms: u64) -> Option<WireInput> {
        if let Some(last) = self.last_sent_ms {
            if now_ms.saturating_sub(last) < self.send_interval_ms {
                return None;
            }
        }
        self.last_sent_ms = Some(now_ms);
        self.outgoing_seq += 1;
        Some(WireInput {
            seq: self.outgoing_seq,
            input: self.take_local(0, now_ms),
        })
    }

    /// Input for `player` at `now_ms`
    pub fn resolve(&mut self, player: &str, now_ms: u64, world: &dyn WorldView) -> PlayerInput {
        let Some(controller) = self.controllers.get_mut(player) else {
            return PlayerInput::neutral(now_ms);
        };

        match controller {
            Controller::Local { slot } | Controller::LocalBot { slot } => {
                let slot = *slot;
                self.take_local(slot, now_ms)
            }
            Controller::AiBot(brain) => brain.decide(&world.visibility(player), now_ms),
            Controller::Remote => {
                let stale = match self.remote.get(player) {
                    None => return PlayerInput::neutral(now_ms),
                    Some(cached) => now_ms.saturating_sub(cached.received_at_ms) > self.stale_after_ms,
                };
                if stale {
                    self.remote.remove(player);
                    warn!(player_id = %player, "Remote input went stale, resolving neutral");
                    return PlayerInput::neutral(now_ms);
                }
                match self.remote.get_mut(player) {
                    Some(cached) => {
                        let input = cached.input;
                        // The dash rides on exactly one resolution
                        if cached.input.dash_requested {
                            debug!(player_id = %player, "Remote dash consumed");
                            cached.input.dash_requested = false;
                        }
                        input
                    }
                    None => PlayerInput::neutral(now_ms),
                }
            }
        }
    }

    pub fn has_cached_remote(&self, player: &str) -> bool {
        self.remote.contains_key(player)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::bot::Visibility;

    struct EmptyWorld;

    impl WorldView for EmptyWorld {
        fn visibility(&self, _player: &str) -> Visibility {
            Visibility::default()
        }
    }

    fn wire(seq: u64, a: bool, b: bool) -> WireInput {
        WireInput {
            seq,
            input: PlayerInput {
                button_a: a,
                button_b: b,
                dash_requested: false,
                captured_at_ms: 0,
            },
        }
    }

    #[test]
    fn presses_outside_window_never_dash() {
        let mut d = DashDetector::new(300);
        d.sample(true, 0);
        d.sample(false, 50);
        d.sample(true, 400);
        assert!(!d.take());
    }

    #[test]
    fn presses_inside_window_dash_once() {
        let mut d = DashDetector::new(300);
        d.sample(true, 0);
        d.sample(false, 60);
        d.sample(true, 200);
        assert!(d.take());
        assert!(!d.take());
        // Holding the button is not another edge
        d.sample(true, 230);
        assert!(!d.take());
    }

    #[test]
    fn third_tap_starts_new_pair() {
        let mut d = DashDetector::new(300);
        for (down, t) in [(true, 0), (false, 50), (true, 100), (false, 150), (true, 200)] {
            d.sample(down, t);
        }
        assert!(d.take());
        assert!(!d.take());
    }

    #[test]
    fn local_dash_consumed_by_single_resolve() {
        let mut r = InputResolver::new(&SimulationConfig::default());
        r.bind("me", Controller::Local { slot: 0 });
        r.capture(0, ControllerState { button_a: true, button_b: false }, 0);
        r.capture(0, ControllerState::default(), 50);
        r.capture(0, ControllerState { button_a: true, button_b: false }, 100);

        assert!(r.resolve("me", 110, &EmptyWorld).dash_requested);
        let again = r.resolve("me", 140, &EmptyWorld);
        assert!(!again.dash_requested);
        assert!(again.button_a);
    }

    #[test]
    fn stale_remote_input_resolves_neutral_and_evicts() {
        let mut r = InputResolver::new(&SimulationConfig::default());
        r.bind("peer", Controller::Remote);
        assert!(r.ingest_remote("peer", wire(1, true, true), 1_000));

        let fresh = r.resolve("peer", 1_900, &EmptyWorld);
        assert!(fresh.button_a && fresh.button_b);

        let stale = r.resolve("peer", 2_001, &EmptyWorld);
        assert!(stale.is_neutral());
        assert!(!r.has_cached_remote("peer"));
    }

    #[test]
    fn repeated_seq_is_not_a_refresh() {
        let mut r = InputResolver::new(&SimulationConfig::default());
        r.bind("peer", Controller::Remote);
        assert!(r.ingest_remote("peer", wire(3, true, false), 0));
        assert!(!r.ingest_remote("peer", wire(3, true, false), 900));
        assert!(r.resolve("peer", 1_100, &EmptyWorld).is_neutral());
        // Same stale value read again after eviction stays evicted
        assert!(!r.ingest_remote("peer", wire(3, true, false), 1_200));
        assert!(!r.has_cached_remote("peer"));
    }

    #[test]
    fn remote_dash_applies_once_per_seq() {
        let mut r = InputResolver::new(&SimulationConfig::default());
        r.bind("peer", Controller::Remote);
        let mut w = wire(1, false, false);
        w.input.dash_requested = true;
        r.ingest_remote("peer", w, 0);
        assert!(r.resolve("peer", 10, &EmptyWorld).dash_requested);
        assert!(!r.resolve("peer", 20, &EmptyWorld).dash_requested);
    }

    #[test]
    fn outgoing_respects_send_cadence() {
        let mut r = InputResolver::new(&SimulationConfig::default());
        r.capture(0, ControllerState { button_a: true, button_b: false }, 0);
        let first = r.outgoing(0).unwrap();
        assert_eq!(first.seq, 1);
        assert!(first.input.button_a);
        assert!(r.outgoing(30).is_none());
        assert_eq!(r.outgoing(50).unwrap().seq, 2);
    }

    #[test]
    fn unknown_player_resolves_neutral() {
        let mut r = InputResolver::new(&SimulationConfig::default());
        assert!(r.resolve("ghost", 5, &EmptyWorld).is_neutral());
    }
}
