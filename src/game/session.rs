//! One peer's view of a match: ties the transport, registry, input
//! resolution, match flow, simulation and state sync together behind a
//! single tick function.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, SimulationConfig};
use crate::transport::{
    input_key, PeerId, PeerInfo, Target, Transport, TransportError, TransportEvent, ROSTER_KEY,
    SNAPSHOT_KEY,
};

use super::flow::{
    CountdownTick, FlowError, FlowEvent, GameOver, KillFeed, MatchFlow, MatchPhase, MatchState,
    RoundResult,
};
use super::input::{ControllerState, InputResolver, PlayerInput, WireInput};
use super::registry::{Control, ControlKind, PlayerRecord, PlayerRegistry, RegistryError};
use super::sim::{Cue, SimulationStep};
use super::smoother::DisplaySmoother;
use super::snapshot::StateSnapshot;
use super::sync::{SnapshotPublisher, SnapshotReceiver, VanishedEntity};
use super::PlayerId;

/// Requests peers send to the authority
pub const REQUEST_START: &str = "requestStart";
pub const REQUEST_RESTART: &str = "requestRestart";
pub const ADD_BOT: &str = "addBot";
/// One-shot sound/visual cue from the authority
pub const CUE: &str = "cue";

/// Longest simulation step after a stall
const MAX_STEP_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddBotRequest {
    pub control: Control,
}

impl Default for AddBotRequest {
    fn default() -> Self {
        Self {
            control: Control::AiBot,
        }
    }
}

/// What the application (renderer, HUD, audio) is told about
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PhaseChanged(MatchState),
    Countdown(CountdownTick),
    RoundResult(RoundResult),
    GameOver(GameOver),
    Kill(KillFeed),
    Cue(Cue),
    Vanished(VanishedEntity),
    AuthorityChanged {
        authority: Option<PeerId>,
        is_local: bool,
    },
    PeerJoined(PeerInfo),
    PeerLeft(PeerId),
    RosterChanged,
    /// Reliable event the core does not interpret
    Message {
        from: PeerId,
        event: String,
        payload: Value,
    },
}

impl From<FlowEvent> for SessionEvent {
    fn from(event: FlowEvent) -> Self {
        match event {
            FlowEvent::Phase(state) => SessionEvent::PhaseChanged(state),
            FlowEvent::Countdown(tick) => SessionEvent::Countdown(tick),
            FlowEvent::RoundResult(result) => SessionEvent::RoundResult(result),
            FlowEvent::GameOver(over) => SessionEvent::GameOver(over),
            FlowEvent::Kill(kill) => SessionEvent::Kill(kill),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error("Encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("{0:?} players can only be added on the authority")]
    BotNotAllowed(Control),
}

pub struct GameSession<T: Transport, S: SimulationStep> {
    config: SimulationConfig,
    transport: T,
    sim: S,
    /// False for a dedicated server, whose own peer is not a player
    plays_locally: bool,
    authoritative: bool,
    registry: PlayerRegistry,
    resolver: InputResolver,
    flow: MatchFlow,
    publisher: SnapshotPublisher,
    receiver: SnapshotReceiver,
    smoother: DisplaySmoother,
    last_roster: Option<Value>,
    last_tick_ms: Option<u64>,
    events: Vec<SessionEvent>,
}

impl<T: Transport, S: SimulationStep> GameSession<T, S> {
    /// Session for a peer that is also a player
    pub fn new(transport: T, sim: S, config: SimulationConfig) -> Result<Self, SessionError> {
        Self::build(transport, sim, config, true)
    }

    /// Session for a headless authority that only referees
    pub fn dedicated(transport: T, sim: S, config: SimulationConfig) -> Result<Self, SessionError> {
        Self::build(transport, sim, config, false)
    }

    fn build(
        transport: T,
        sim: S,
        config: SimulationConfig,
        plays_locally: bool,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            registry: PlayerRegistry::mirror(config.max_players),
            resolver: InputResolver::new(&config),
            flow: MatchFlow::new(&config, false),
            publisher: SnapshotPublisher::new(&config),
            receiver: SnapshotReceiver::new(&config),
            smoother: DisplaySmoother::new(&config),
            config,
            transport,
            sim,
            plays_locally,
            authoritative: false,
            last_roster: None,
            last_tick_ms: None,
            events: Vec::new(),
        })
    }

    pub fn create_room(&mut self) -> Result<String, SessionError> {
        Ok(self.transport.create_session()?)
    }

    pub fn join_room(&mut self, code: &str) -> Result<(), SessionError> {
        Ok(self.transport.join_session(code)?)
    }

    /// Leave the room and cancel everything pending
    pub fn leave(&mut self) {
        self.flow.demote();
        self.transport.leave_session();
        self.authoritative = false;
        self.sim.clear();
        self.smoother.clear();
    }

    fn local_id(&self) -> PeerId {
        self.transport.local_peer().id.clone()
    }

    fn is_player_peer(&self, peer: &str) -> bool {
        self.plays_locally || peer != self.transport.local_peer().id
    }

    /// Record this device's controller state for `slot`
    pub fn capture_input(&mut self, slot: u8, state: ControllerState, now_ms: u64) {
        self.resolver.capture(slot, state, now_ms);
    }

    /// Advance the session. Call at the simulation rate.
    ///
    /// Every drained transport event is handled even if an earlier one
    /// fails; the first such error is returned after the tick completes.
    pub fn tick(&mut self, now_ms: u64) -> Result<(), SessionError> {
        let dt_ms = match self.last_tick_ms {
            Some(last) => now_ms.saturating_sub(last).min(MAX_STEP_MS),
            None => self.config.tick_ms(),
        };
        self.last_tick_ms = Some(now_ms);

        let mut first_error = None;
        for event in self.transport.poll_events() {
            if let Err(err) = self.handle_transport_event(event, now_ms) {
                warn!(%err, "Transport event failed");
                first_error.get_or_insert(err);
            }
        }

        if self.authoritative {
            self.authority_tick(now_ms, dt_ms)?;
        } else {
            self.mirror_tick(now_ms)?;
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Advance display smoothing. Call once per rendered frame.
    pub fn frame(&mut self, dt_ms: u64) {
        if !self.authoritative {
            self.smoother.update(dt_ms);
        }
    }

    fn authority_tick(&mut self, now_ms: u64, dt_ms: u64) -> Result<(), SessionError> {
        let fired = self.flow.poll(&mut self.registry, now_ms)?;
        self.publish_flow(fired)?;

        let me = self.local_id();
        self.resolver.rebind(&self.registry, &me);

        if self.flow.phase() == MatchPhase::Playing {
            self.ingest_remote_inputs(now_ms);

            let mut inputs: HashMap<PlayerId, PlayerInput> = HashMap::new();
            for id in self.registry.active_ids() {
                let input = self.resolver.resolve(&id, now_ms, &self.sim);
                inputs.insert(id, input);
            }

            let outcome = self.sim.step(&inputs, dt_ms);
            for cue in outcome.cues {
                self.transport
                    .call_reliable(CUE, serde_json::to_value(&cue)?, Target::Others)?;
                self.events.push(SessionEvent::Cue(cue));
            }

            let settled = self
                .flow
                .on_eliminations(&mut self.registry, &outcome.eliminations, now_ms)?;
            self.publish_flow(settled)?;
        }

        if self.registry.take_dirty() {
            let roster = serde_json::to_value(self.registry.snapshot())?;
            self.transport.replicate_unreliable(ROSTER_KEY, roster);
            self.events.push(SessionEvent::RosterChanged);
        }

        if let Some(snapshot) = self.publisher.poll(now_ms, self.flow.state(), &self.sim) {
            let value = serde_json::to_value(&snapshot)?;
            let bytes = value.to_string().len();
            self.transport.replicate_unreliable(SNAPSHOT_KEY, value);
            self.publisher.record(&snapshot, bytes);
        }
        Ok(())
    }

    fn ingest_remote_inputs(&mut self, now_ms: u64) {
        let remote: Vec<PlayerId> = self
            .registry
            .iter()
            .filter(|p| self.resolver.kind(&p.id) == Some(ControlKind::Remote))
            .map(|p| p.id.clone())
            .collect();

        for id in remote {
            let Some(value) = self.transport.read_replicated(&input_key(&id)) else {
                continue;
            };
            match serde_json::from_value::<WireInput>(value) {
                Ok(wire) => {
                    self.resolver.ingest_remote(&id, wire, now_ms);
                }
                Err(err) => debug!(player_id = %id, %err, "Unreadable input slot"),
            }
        }
    }

    fn mirror_tick(&mut self, now_ms: u64) -> Result<(), SessionError> {
        if self.transport.session_code().is_none() {
            return Ok(());
        }

        let me = self.local_id();
        if let Some(wire) = self.resolver.outgoing(now_ms) {
            self.transport
                .replicate_unreliable(&input_key(&me), serde_json::to_value(wire)?);
        }

        if let Some(roster) = self.transport.read_replicated(ROSTER_KEY) {
            if self.last_roster.as_ref() != Some(&roster) {
                match serde_json::from_value::<Vec<PlayerRecord>>(roster.clone()) {
                    Ok(records) => {
                        self.registry.mirror_from(records)?;
                        self.resolver.rebind(&self.registry, &me);
                        self.last_roster = Some(roster);
                        self.events.push(SessionEvent::RosterChanged);
                    }
                    Err(err) => warn!(%err, "Unreadable roster"),
                }
            }
        }

        if let Some(value) = self.transport.read_replicated(SNAPSHOT_KEY) {
            let seq = value.get("seq").and_then(Value::as_u64);
            let fresh = match (seq, self.receiver.last_seq()) {
                (Some(seq), Some(last)) => seq > last,
                _ => true,
            };
            if fresh {
                match serde_json::from_value::<StateSnapshot>(value) {
                    Ok(snapshot) => {
                        if let Some(report) = self.receiver.receive(snapshot, now_ms, &mut self.smoother) {
                            self.events
                                .extend(report.vanished.into_iter().map(SessionEvent::Vanished));
                        }
                    }
                    Err(err) => warn!(%err, "Unreadable snapshot"),
                }
            }
        }
        Ok(())
    }

    fn handle_transport_event(&mut self, event: TransportEvent, now_ms: u64) -> Result<(), SessionError> {
        match event {
            TransportEvent::PeerJoined(info) => {
                if self.authoritative {
                    self.admit(&info, now_ms)?;
                }
                self.events.push(SessionEvent::PeerJoined(info));
            }
            TransportEvent::PeerLeft(peer) => {
                if self.authoritative {
                    self.dismiss(&peer, now_ms)?;
                }
                self.events.push(SessionEvent::PeerLeft(peer));
            }
            TransportEvent::AuthorityChanged { authority } => {
                let is_local = authority.as_deref() == Some(self.transport.local_peer().id.as_str());
                self.events.push(SessionEvent::AuthorityChanged {
                    authority: authority.clone(),
                    is_local,
                });
                if is_local && !self.authoritative {
                    self.assume_authority(now_ms)?;
                } else if !is_local && self.authoritative {
                    self.step_down();
                }
            }
            TransportEvent::Reliable { from, event, payload } => {
                self.handle_reliable(from, event, payload, now_ms)?;
            }
        }
        Ok(())
    }

    /// Register a newly joined peer as a player
    fn admit(&mut self, info: &PeerInfo, now_ms: u64) -> Result<(), SessionError> {
        if !self.is_player_peer(&info.id) {
            return Ok(());
        }
        if self.registry.contains(&info.id) {
            debug!(peer_id = %info.id, "Duplicate join ignored");
            return Ok(());
        }

        let state = self.flow.join_state();
        match self.registry.add_human(info, state) {
            Ok(_) => {}
            Err(RegistryError::Full) => {
                warn!(peer_id = %info.id, "No free player slot, peer stays a spectator");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        info!(peer_id = %info.id, name = %info.display_name, state = ?state, "Player joined");

        let restarted = self.flow.on_player_joined(now_ms)?;
        if restarted.is_empty() {
            // The newcomer needs the current phase
            self.broadcast_flow(&FlowEvent::Phase(self.flow.state().clone()))?;
        } else {
            self.publish_flow(restarted)?;
        }
        let me = self.local_id();
        self.resolver.rebind(&self.registry, &me);
        self.publisher.force_next();
        Ok(())
    }

    /// Drop a departed peer's players; its AI bots stay with the authority
    fn dismiss(&mut self, peer: &str, now_ms: u64) -> Result<(), SessionError> {
        let me = self.local_id();
        let removed = self.registry.reconcile_departed(peer, &me)?;
        for record in &removed {
            self.sim.remove_player(&record.id);
            self.resolver.unbind(&record.id);
            info!(player_id = %record.id, "Player left");
        }
        if !removed.is_empty() {
            let settled = self.flow.on_player_left(&mut self.registry, now_ms)?;
            self.publish_flow(settled)?;
        }
        self.resolver.rebind(&self.registry, &me);
        Ok(())
    }

    fn handle_reliable(
        &mut self,
        from: PeerId,
        event: String,
        payload: Value,
        now_ms: u64,
    ) -> Result<(), SessionError> {
        match FlowEvent::from_wire(&event, payload.clone()) {
            Ok(Some(flow_event)) => {
                if self.authoritative {
                    debug!(from = %from, event = %event, "Authority ignores flow event");
                } else if self.transport.authority().as_deref() != Some(from.as_str()) {
                    warn!(from = %from, event = %event, "Flow event from a non-authority dropped");
                } else {
                    self.flow.apply_remote(&flow_event);
                    let to_lobby = matches!(&flow_event, FlowEvent::Phase(s) if s.phase == MatchPhase::Lobby);
                    if to_lobby && self.flow.phase() == MatchPhase::Lobby {
                        // The world was cleared on purpose; empty snapshots
                        // that follow are not packet loss
                        self.smoother.clear();
                        self.receiver.forget_entities();
                    }
                    self.events.push(flow_event.into());
                }
                return Ok(());
            }
            Ok(None) => {}
            Err(err) => {
                warn!(from = %from, event = %event, %err, "Malformed flow event");
                return Ok(());
            }
        }

        match event.as_str() {
            REQUEST_START | REQUEST_RESTART | ADD_BOT if !self.authoritative => {
                debug!(from = %from, event = %event, "Request for the authority ignored");
            }
            REQUEST_START => {
                if let Err(err) = self.request_start(now_ms) {
                    warn!(from = %from, %err, "Start request refused");
                }
            }
            REQUEST_RESTART => {
                if let Err(err) = self.request_restart() {
                    warn!(from = %from, %err, "Restart request refused");
                }
            }
            ADD_BOT => {
                let request: AddBotRequest = serde_json::from_value(payload).unwrap_or_default();
                // Only AI bots run on the authority for someone else; a
                // remote peer's extra controller has no input slot of its own
                let result = match request.control {
                    Control::AiBot => {
                        let owner = self.local_id();
                        self.spawn_bot(&owner, Control::AiBot, now_ms).map(drop)
                    }
                    other => Err(SessionError::BotNotAllowed(other)),
                };
                if let Err(err) = result {
                    warn!(from = %from, %err, "Bot request refused");
                }
            }
            CUE => {
                if !self.authoritative {
                    match serde_json::from_value::<Cue>(payload) {
                        Ok(cue) => self.events.push(SessionEvent::Cue(cue)),
                        Err(err) => debug!(%err, "Malformed cue"),
                    }
                }
            }
            _ => self.events.push(SessionEvent::Message { from, event, payload }),
        }
        Ok(())
    }

    /// Start the match, or ask the authority to
    pub fn request_start(&mut self, now_ms: u64) -> Result<(), SessionError> {
        if !self.authoritative {
            self.transport
                .call_reliable(REQUEST_START, Value::Null, Target::Authority)?;
            return Ok(());
        }
        let events = self.flow.start_match(&mut self.registry, now_ms)?;
        self.publish_flow(events)
    }

    /// Reset scores and return to the lobby, or ask the authority to
    pub fn request_restart(&mut self) -> Result<(), SessionError> {
        if !self.authoritative {
            self.transport
                .call_reliable(REQUEST_RESTART, Value::Null, Target::Authority)?;
            return Ok(());
        }
        let events = self.flow.restart(&mut self.registry)?;
        self.publish_flow(events)
    }

    /// Add a bot. On the authority returns its id; elsewhere an AI bot
    /// request is forwarded and `None` returned. Local bots share the
    /// authority's device, so a guest cannot add one.
    pub fn add_bot(&mut self, control: Control, now_ms: u64) -> Result<Option<PlayerId>, SessionError> {
        if !self.authoritative {
            if control != Control::AiBot {
                return Err(SessionError::BotNotAllowed(control));
            }
            let payload = serde_json::to_value(AddBotRequest { control })?;
            self.transport.call_reliable(ADD_BOT, payload, Target::Authority)?;
            return Ok(None);
        }
        let owner = self.local_id();
        self.spawn_bot(&owner, control, now_ms).map(Some)
    }

    fn spawn_bot(&mut self, owner: &str, control: Control, now_ms: u64) -> Result<PlayerId, SessionError> {
        let state = self.flow.join_state();
        let id = self.registry.add_bot(owner, control, state)?;
        info!(player_id = %id, owner = %owner, control = ?control, "Bot added");
        let restarted = self.flow.on_player_joined(now_ms)?;
        self.publish_flow(restarted)?;
        let me = self.local_id();
        self.resolver.rebind(&self.registry, &me);
        Ok(id)
    }

    /// Send flow events to every other peer, apply their side effects here
    /// and surface them locally
    fn publish_flow(&mut self, events: Vec<FlowEvent>) -> Result<(), SessionError> {
        for event in events {
            self.broadcast_flow(&event)?;
            if let FlowEvent::Phase(state) = &event {
                match state.phase {
                    MatchPhase::Countdown => {
                        self.sim
                            .begin_round(&self.registry.active_ids(), state.current_round);
                    }
                    MatchPhase::Lobby => self.sim.clear(),
                    _ => {}
                }
                self.publisher.force_next();
            }
            self.events.push(event.into());
        }
        Ok(())
    }

    fn broadcast_flow(&mut self, event: &FlowEvent) -> Result<(), SessionError> {
        self.transport
            .call_reliable(event.event_name(), event.to_payload()?, Target::Others)?;
        Ok(())
    }

    /// Take over as authority, continuing from the replicated state
    fn assume_authority(&mut self, now_ms: u64) -> Result<(), SessionError> {
        let me = self.local_id();
        info!(peer_id = %me, phase = ?self.flow.phase(), "Assuming authority");
        self.authoritative = true;

        let roster = self
            .transport
            .read_replicated(ROSTER_KEY)
            .and_then(|v| serde_json::from_value::<Vec<PlayerRecord>>(v).ok())
            .unwrap_or_else(|| self.registry.snapshot());
        self.registry = PlayerRegistry::rebuild_authoritative(self.config.max_players, roster);

        if let Some(snapshot) = self.receiver.restorable() {
            if matches!(self.flow.phase(), MatchPhase::Playing | MatchPhase::RoundEnd) {
                self.sim.restore(&snapshot);
            }
            self.publisher = SnapshotPublisher::resume_after(&self.config, snapshot.seq);
        }

        let present: Vec<PeerId> = self.transport.peers().into_iter().map(|p| p.id).collect();
        let departed: BTreeSet<PeerId> = self
            .registry
            .iter()
            .map(|p| p.owner.clone())
            .filter(|owner| !present.contains(owner))
            .collect();
        for owner in departed {
            for record in self.registry.reconcile_departed(&owner, &me)? {
                info!(player_id = %record.id, "Dropped player of departed peer");
                self.sim.remove_player(&record.id);
                self.resolver.unbind(&record.id);
            }
        }

        for peer in self.transport.peers() {
            if self.is_player_peer(&peer.id) && !self.registry.contains(&peer.id) {
                let state = self.flow.join_state();
                if let Err(err) = self.registry.add_human(&peer, state) {
                    warn!(peer_id = %peer.id, %err, "Could not register peer");
                }
            }
        }

        let resumed = self.flow.assume_authority(now_ms);
        self.publish_flow(resumed)?;
        let settled = self.flow.settle(&mut self.registry, now_ms)?;
        self.publish_flow(settled)?;

        self.resolver.rebind(&self.registry, &me);
        self.receiver = SnapshotReceiver::new(&self.config);
        self.smoother.clear();
        self.publisher.force_next();
        Ok(())
    }

    fn step_down(&mut self) {
        info!(peer_id = %self.transport.local_peer().id, "Authority moved away");
        self.authoritative = false;
        self.flow.demote();
        let roster = self.registry.snapshot();
        self.registry = PlayerRegistry::mirror(self.config.max_players);
        if let Err(err) = self.registry.mirror_from(roster) {
            warn!(%err, "Could not keep roster after stepping down");
        }
        self.receiver = SnapshotReceiver::new(&self.config);
        self.last_roster = None;
        self.sim.clear();
    }

    /// Events since the last call
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn is_authority(&self) -> bool {
        self.authoritative
    }

    pub fn local_peer(&self) -> &PeerInfo {
        self.transport.local_peer()
    }

    pub fn room_code(&self) -> Option<&str> {
        self.transport.session_code()
    }

    pub fn match_state(&self) -> &MatchState {
        self.flow.state()
    }

    pub fn registry(&self) -> &PlayerRegistry {
        &self.registry
    }

    pub fn smoother(&self) -> &DisplaySmoother {
        &self.smoother
    }

    pub fn receiver(&self) -> &SnapshotReceiver {
        &self.receiver
    }

    pub fn simulation(&self) -> &S {
        &self.sim
    }

    /// Direct access to the world, e.g. for scripted hazards
    pub fn simulation_mut(&mut self) -> &mut S {
        &mut self.sim
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn pending_timers(&self) -> usize {
        self.flow.pending_timers()
    }
}
