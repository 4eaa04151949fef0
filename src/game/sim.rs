//! Boundary between the core and the simulation engine

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::bot::WorldView;
use super::input::PlayerInput;
use super::snapshot::{ShipStatus, StateSnapshot, WorldState};
use super::PlayerId;

/// Killer id used when a hazard, not a player, caused an elimination
pub const ENVIRONMENT_ID: &str = "environment";

/// Who gets credit for an elimination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillCredit {
    Player(PlayerId),
    /// Hazards earn nobody a kill
    Environment,
}

impl KillCredit {
    pub fn as_id(&self) -> &str {
        match self {
            KillCredit::Player(id) => id,
            KillCredit::Environment => ENVIRONMENT_ID,
        }
    }
}

/// A player lost their last live entity this step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elimination {
    pub victim: PlayerId,
    pub killer: KillCredit,
}

/// One-shot sound/visual cue for every peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cue {
    pub name: String,
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    pub eliminations: Vec<Elimination>,
    pub cues: Vec<Cue>,
}

/// The simulation engine. Invoked only on the authority, once per tick,
/// after every input for that tick has been resolved.
pub trait SimulationStep: WorldView + Send {
    /// Spawn the participants of a fresh round
    fn begin_round(&mut self, participants: &[PlayerId], round: u32);

    /// Advance the world by `dt_ms`
    fn step(&mut self, inputs: &HashMap<PlayerId, PlayerInput>, dt_ms: u64) -> StepOutcome;

    /// Current state of every live entity
    fn capture(&self) -> WorldState;

    /// Secondary per-ship data
    fn ship_status(&self) -> Vec<ShipStatus>;

    /// Rebuild the world from the last snapshot seen, after taking over
    /// authority mid-round
    fn restore(&mut self, snapshot: &StateSnapshot);

    /// Drop a player's entities without crediting anyone
    fn remove_player(&mut self, player: &str);

    /// Remove every transient entity
    fn clear(&mut self);
}
