//! Match phase and round progression.
//!
//! The authority drives every transition and owns the timers behind them;
//! other peers hold a mirror that only changes when a [`FlowEvent`] from the
//! authority is applied.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::config::SimulationConfig;

use super::registry::{ConnectionState, PlayerRegistry, RegistryError};
use super::scheduler::{Scheduler, TimerHandle};
use super::sim::{Elimination, KillCredit};
use super::PlayerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchPhase {
    Start,
    Lobby,
    Countdown,
    Playing,
    RoundEnd,
    GameEnd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchState {
    pub phase: MatchPhase,
    pub countdown: u32,
    pub current_round: u32,
    pub round_winner_id: Option<PlayerId>,
    pub is_tie: bool,
}

impl Default for MatchState {
    fn default() -> Self {
        Self {
            phase: MatchPhase::Start,
            countdown: 0,
            current_round: 0,
            round_winner_id: None,
            is_tie: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundResult {
    pub round_number: u32,
    pub winner_id: Option<PlayerId>,
    pub winner_name: Option<String>,
    pub is_tie: bool,
    pub round_wins_by_id: BTreeMap<PlayerId, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameOver {
    pub winner_id: Option<PlayerId>,
    pub winner_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillFeed {
    pub victim_id: PlayerId,
    /// A player id, or the environment sentinel
    pub killer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountdownTick {
    pub value: u32,
    pub round: u32,
}

/// Replicated one-shot flow events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    Phase(MatchState),
    Countdown(CountdownTick),
    RoundResult(RoundResult),
    GameOver(GameOver),
    Kill(KillFeed),
}

impl FlowEvent {
    pub const PHASE: &'static str = "phase";
    pub const COUNTDOWN: &'static str = "countdown";
    pub const ROUND_RESULT: &'static str = "roundResult";
    pub const GAME_OVER: &'static str = "gameOver";
    pub const KILL: &'static str = "kill";

    pub fn event_name(&self) -> &'static str {
        match self {
            FlowEvent::Phase(_) => Self::PHASE,
            FlowEvent::Countdown(_) => Self::COUNTDOWN,
            FlowEvent::RoundResult(_) => Self::ROUND_RESULT,
            FlowEvent::GameOver(_) => Self::GAME_OVER,
            FlowEvent::Kill(_) => Self::KILL,
        }
    }

    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            FlowEvent::Phase(v) => serde_json::to_value(v),
            FlowEvent::Countdown(v) => serde_json::to_value(v),
            FlowEvent::RoundResult(v) => serde_json::to_value(v),
            FlowEvent::GameOver(v) => serde_json::to_value(v),
            FlowEvent::Kill(v) => serde_json::to_value(v),
        }
    }

    /// Decode a reliable event; `Ok(None)` when the name is not a flow event
    pub fn from_wire(event: &str, payload: Value) -> Result<Option<Self>, serde_json::Error> {
        let decoded = match event {
            Self::PHASE => FlowEvent::Phase(serde_json::from_value(payload)?),
            Self::COUNTDOWN => FlowEvent::Countdown(serde_json::from_value(payload)?),
            Self::ROUND_RESULT => FlowEvent::RoundResult(serde_json::from_value(payload)?),
            Self::GAME_OVER => FlowEvent::GameOver(serde_json::from_value(payload)?),
            Self::KILL => FlowEvent::Kill(serde_json::from_value(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(decoded))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("Only the authority drives the match flow")]
    NotAuthority,

    #[error("Expected phase {expected:?}, match is in {actual:?}")]
    WrongPhase {
        expected: MatchPhase,
        actual: MatchPhase,
    },

    #[error("Need {required} players to start, have {present}")]
    NotEnoughPlayers { required: usize, present: usize },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowTimer {
    CountdownStep,
    RoundEndDelay,
}

pub struct MatchFlow {
    authoritative: bool,
    countdown_secs: u32,
    countdown_step_ms: u64,
    round_end_delay_ms: u64,
    rounds_to_win: u32,
    min_players: usize,
    state: MatchState,
    scheduler: Scheduler<FlowTimer>,
    countdown_timer: Option<TimerHandle>,
    round_end_timer: Option<TimerHandle>,
}

impl MatchFlow {
    pub fn new(config: &SimulationConfig, authoritative: bool) -> Self {
        Self {
            authoritative,
            countdown_secs: config.countdown_secs,
            countdown_step_ms: config.countdown_step_ms,
            round_end_delay_ms: config.round_end_delay_ms,
            rounds_to_win: config.rounds_to_win,
            min_players: config.min_players,
            state: MatchState::default(),
            scheduler: Scheduler::new(),
            countdown_timer: None,
            round_end_timer: None,
        }
    }

    pub fn state(&self) -> &MatchState {
        &self.state
    }

    pub fn phase(&self) -> MatchPhase {
        self.state.phase
    }

    pub fn is_authoritative(&self) -> bool {
        self.authoritative
    }

    pub fn pending_timers(&self) -> usize {
        self.scheduler.pending()
    }

    fn ensure_authoritative(&self) -> Result<(), FlowError> {
        if self.authoritative {
            Ok(())
        } else {
            Err(FlowError::NotAuthority)
        }
    }

    fn phase_event(&self) -> FlowEvent {
        FlowEvent::Phase(self.state.clone())
    }

    /// State a newly joined player enters with
    pub fn join_state(&self) -> ConnectionState {
        match self.state.phase {
            MatchPhase::Playing | MatchPhase::RoundEnd => ConnectionState::Spectating,
            _ => ConnectionState::Active,
        }
    }

    /// START -> LOBBY once the room exists
    pub fn open_lobby(&mut self) -> Result<Vec<FlowEvent>, FlowError> {
        self.ensure_authoritative()?;
        if self.state.phase != MatchPhase::Start {
            return Ok(Vec::new());
        }
        self.state.phase = MatchPhase::Lobby;
        info!("Lobby open");
        Ok(vec![self.phase_event()])
    }

    /// LOBBY -> COUNTDOWN for round 1
    pub fn start_match(
        &mut self,
        registry: &mut PlayerRegistry,
        now_ms: u64,
    ) -> Result<Vec<FlowEvent>, FlowError> {
        self.ensure_authoritative()?;
        if self.state.phase != MatchPhase::Lobby {
            return Err(FlowError::WrongPhase {
                expected: MatchPhase::Lobby,
                actual: self.state.phase,
            });
        }
        if registry.len() < self.min_players {
            return Err(FlowError::NotEnoughPlayers {
                required: self.min_players,
                present: registry.len(),
            });
        }
        registry.activate_all()?;
        self.state.current_round = 1;
        self.state.round_winner_id = None;
        self.state.is_tie = false;
        info!(players = registry.len(), "Match starting");
        Ok(self.begin_countdown(now_ms))
    }

    /// (Re)start the countdown, cancelling any countdown already running
    fn begin_countdown(&mut self, now_ms: u64) -> Vec<FlowEvent> {
        if let Some(previous) = self.countdown_timer.take() {
            self.scheduler.cancel(previous);
        }
        self.state.phase = MatchPhase::Countdown;
        self.state.countdown = self.countdown_secs;
        self.state.round_winner_id = None;
        self.state.is_tie = false;
        self.countdown_timer = Some(self.scheduler.repeating(
            FlowTimer::CountdownStep,
            now_ms + self.countdown_step_ms,
            self.countdown_step_ms,
        ));
        debug!(round = self.state.current_round, "Countdown started");
        vec![
            self.phase_event(),
            FlowEvent::Countdown(CountdownTick {
                value: self.state.countdown,
                round: self.state.current_round,
            }),
        ]
    }

    /// A player joined. During a countdown the countdown restarts so the
    /// newcomer gets a full one; only a single countdown ever runs.
    pub fn on_player_joined(&mut self, now_ms: u64) -> Result<Vec<FlowEvent>, FlowError> {
        self.ensure_authoritative()?;
        if self.state.phase == MatchPhase::Countdown {
            info!("Player joined during countdown, restarting it");
            return Ok(self.begin_countdown(now_ms));
        }
        Ok(Vec::new())
    }

    /// A player left. A round in play is re-evaluated against whoever is
    /// still registered, so a lone survivor takes it.
    pub fn on_player_left(
        &mut self,
        registry: &mut PlayerRegistry,
        now_ms: u64,
    ) -> Result<Vec<FlowEvent>, FlowError> {
        self.ensure_authoritative()?;
        match self.state.phase {
            MatchPhase::Playing if registry.participant_count() == 0 => {
                self.return_to_lobby("everyone left")
            }
            MatchPhase::Playing => self.resolve_round(registry, now_ms),
            MatchPhase::Countdown | MatchPhase::RoundEnd if registry.is_empty() => {
                self.return_to_lobby("everyone left")
            }
            _ => Ok(Vec::new()),
        }
    }

    fn return_to_lobby(&mut self, reason: &str) -> Result<Vec<FlowEvent>, FlowError> {
        self.cancel_timers();
        self.state.phase = MatchPhase::Lobby;
        self.state.countdown = 0;
        info!(reason, "Returned to lobby");
        Ok(vec![self.phase_event()])
    }

    /// Fire due timers
    pub fn poll(
        &mut self,
        registry: &mut PlayerRegistry,
        now_ms: u64,
    ) -> Result<Vec<FlowEvent>, FlowError> {
        if !self.authoritative {
            return Ok(Vec::new());
        }
        let mut events = Vec::new();
        for (handle, timer) in self.scheduler.poll(now_ms) {
            match timer {
                FlowTimer::CountdownStep if self.countdown_timer == Some(handle) => {
                    self.state.countdown = self.state.countdown.saturating_sub(1);
                    events.push(FlowEvent::Countdown(CountdownTick {
                        value: self.state.countdown,
                        round: self.state.current_round,
                    }));
                    if self.state.countdown == 0 {
                        self.scheduler.cancel(handle);
                        self.countdown_timer = None;
                        self.state.phase = MatchPhase::Playing;
                        info!(round = self.state.current_round, "Round live");
                        events.push(self.phase_event());
                    }
                }
                FlowTimer::RoundEndDelay if self.round_end_timer == Some(handle) => {
                    self.round_end_timer = None;
                    registry.activate_all()?;
                    self.state.current_round += 1;
                    events.extend(self.begin_countdown(now_ms));
                }
                other => debug!(timer = ?other, "Dropped firing of a replaced timer"),
            }
        }
        Ok(events)
    }

    /// Apply the eliminations of one simulation step, then settle the round
    pub fn on_eliminations(
        &mut self,
        registry: &mut PlayerRegistry,
        eliminations: &[Elimination],
        now_ms: u64,
    ) -> Result<Vec<FlowEvent>, FlowError> {
        self.ensure_authoritative()?;
        if self.state.phase != MatchPhase::Playing || eliminations.is_empty() {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        for elimination in eliminations {
            if !registry.contains(&elimination.victim) {
                continue;
            }
            registry.set_state(&elimination.victim, ConnectionState::Ejected)?;
            if let KillCredit::Player(killer) = &elimination.killer {
                if killer != &elimination.victim && registry.contains(killer) {
                    registry.credit_kill(killer)?;
                }
            }
            events.push(FlowEvent::Kill(KillFeed {
                victim_id: elimination.victim.clone(),
                killer_id: elimination.killer.as_id().to_string(),
            }));
        }

        events.extend(self.resolve_round(registry, now_ms)?);
        Ok(events)
    }

    /// End the round if at most one participant is still active
    fn resolve_round(
        &mut self,
        registry: &mut PlayerRegistry,
        now_ms: u64,
    ) -> Result<Vec<FlowEvent>, FlowError> {
        if self.state.phase != MatchPhase::Playing {
            return Ok(Vec::new());
        }
        let active = registry.active_ids();
        if active.len() > 1 {
            return Ok(Vec::new());
        }

        // Alone in the match: losing the only life ends the game
        if active.is_empty() && registry.participant_count() == 1 {
            info!(round = self.state.current_round, "Sole participant eliminated");
            return Ok(self.end_game(None, None));
        }

        let round_number = self.state.current_round;
        let (winner_id, winner_name, wins) = match active.first() {
            Some(id) => {
                let wins = registry.award_round(id)?;
                let name = registry.get(id).map(|p| p.display_name.clone());
                (Some(id.clone()), name, wins)
            }
            None => (None, None, 0),
        };
        let is_tie = winner_id.is_none();

        self.state.round_winner_id = winner_id.clone();
        self.state.is_tie = is_tie;
        let result = FlowEvent::RoundResult(RoundResult {
            round_number,
            winner_id: winner_id.clone(),
            winner_name: winner_name.clone(),
            is_tie,
            round_wins_by_id: registry.round_wins_by_id(),
        });
        info!(round = round_number, winner = ?winner_id, is_tie, "Round over");

        if winner_id.is_some() && wins >= self.rounds_to_win {
            let mut events = vec![result];
            events.extend(self.end_game(winner_id, winner_name));
            return Ok(events);
        }

        self.state.phase = MatchPhase::RoundEnd;
        if let Some(previous) = self.round_end_timer.take() {
            self.scheduler.cancel(previous);
        }
        self.round_end_timer = Some(
            self.scheduler
                .once(FlowTimer::RoundEndDelay, now_ms + self.round_end_delay_ms),
        );
        Ok(vec![result, self.phase_event()])
    }

    fn end_game(&mut self, winner_id: Option<PlayerId>, winner_name: Option<String>) -> Vec<FlowEvent> {
        self.cancel_timers();
        self.state.phase = MatchPhase::GameEnd;
        self.state.round_winner_id = winner_id.clone();
        info!(winner = ?winner_id, "Game over");
        vec![
            FlowEvent::GameOver(GameOver {
                winner_id,
                winner_name,
            }),
            self.phase_event(),
        ]
    }

    /// Clear scores and go back to the lobby. The only way the round
    /// counter ever goes down.
    pub fn restart(&mut self, registry: &mut PlayerRegistry) -> Result<Vec<FlowEvent>, FlowError> {
        self.ensure_authoritative()?;
        if self.state.phase == MatchPhase::Start {
            return Err(FlowError::WrongPhase {
                expected: MatchPhase::GameEnd,
                actual: MatchPhase::Start,
            });
        }
        self.cancel_timers();
        registry.reset_scores()?;
        registry.activate_all()?;
        self.state = MatchState {
            phase: MatchPhase::Lobby,
            ..MatchState::default()
        };
        info!("Match restarted");
        Ok(vec![self.phase_event()])
    }

    fn cancel_timers(&mut self) {
        self.scheduler.cancel_all();
        self.countdown_timer = None;
        self.round_end_timer = None;
    }

    /// Cancel everything outstanding; the flow stays where it is
    pub fn teardown(&mut self) {
        let cancelled = self.scheduler.pending();
        self.cancel_timers();
        debug!(cancelled, "Match flow torn down");
    }

    /// Become the authority, continuing from the last mirrored state.
    /// Pending transitions are re-created with fresh timers.
    pub fn assume_authority(&mut self, now_ms: u64) -> Vec<FlowEvent> {
        self.authoritative = true;
        self.cancel_timers();
        match self.state.phase {
            MatchPhase::Start => {
                self.state.phase = MatchPhase::Lobby;
                vec![self.phase_event()]
            }
            MatchPhase::Countdown => self.begin_countdown(now_ms),
            MatchPhase::RoundEnd => {
                self.round_end_timer = Some(
                    self.scheduler
                        .once(FlowTimer::RoundEndDelay, now_ms + self.round_end_delay_ms),
                );
                vec![self.phase_event()]
            }
            _ => vec![self.phase_event()],
        }
    }

    /// Re-evaluate the round after the roster changed under a new authority
    pub fn settle(
        &mut self,
        registry: &mut PlayerRegistry,
        now_ms: u64,
    ) -> Result<Vec<FlowEvent>, FlowError> {
        self.on_player_left(registry, now_ms)
    }

    /// Stop being the authority
    pub fn demote(&mut self) {
        self.teardown();
        self.authoritative = false;
    }

    /// Mirror an event published by the authority
    pub fn apply_remote(&mut self, event: &FlowEvent) {
        match event {
            FlowEvent::Phase(state) => {
                if state.current_round < self.state.current_round && state.phase != MatchPhase::Lobby {
                    warn!(
                        incoming = state.current_round,
                        current = self.state.current_round,
                        "Ignoring out-of-date phase event"
                    );
                    return;
                }
                self.state = state.clone();
            }
            FlowEvent::Countdown(tick) => {
                if tick.round >= self.state.current_round {
                    self.state.countdown = tick.value;
                }
            }
            FlowEvent::RoundResult(result) => {
                self.state.round_winner_id = result.winner_id.clone();
                self.state.is_tie = result.is_tie;
            }
            FlowEvent::GameOver(over) => {
                self.state.phase = MatchPhase::GameEnd;
                self.state.round_winner_id = over.winner_id.clone();
            }
            FlowEvent::Kill(_) => {}
        }
    }
}
