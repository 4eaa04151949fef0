//! Snapshot building for network transmission

use serde::{Deserialize, Serialize};

use super::flow::{MatchPhase, MatchState};

/// Kinds of simulated entity carried in a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Ship,
    Pilot,
    Projectile,
    Asteroid,
}

impl EntityKind {
    /// Whether silently disappearing between snapshots deserves a terminal
    /// effect on the receiving side
    pub fn announces_removal(self) -> bool {
        !matches!(self, EntityKind::Projectile)
    }
}

/// Kinematic state of one entity. `id` is stable across ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: String,
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub vx: f32,
    pub vy: f32,
    pub alive: bool,
}

/// Slow-changing per-ship data, sent at a lower cadence than kinematics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipStatus {
    pub owner_id: String,
    pub ammo: u8,
    pub dash_ready: bool,
}

/// Match fields a renderer or HUD needs alongside the entities
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchView {
    pub phase: MatchPhase,
    pub countdown: u32,
    pub current_round: u32,
}

impl From<&MatchState> for MatchView {
    fn from(state: &MatchState) -> Self {
        Self {
            phase: state.phase,
            countdown: state.countdown,
            current_round: state.current_round,
        }
    }
}

/// Entity state grouped by kind, as captured from the simulation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    #[serde(default)]
    pub ships: Vec<EntitySnapshot>,
    #[serde(default)]
    pub pilots: Vec<EntitySnapshot>,
    #[serde(default)]
    pub projectiles: Vec<EntitySnapshot>,
    #[serde(default)]
    pub asteroids: Vec<EntitySnapshot>,
}

impl WorldState {
    pub fn entities(&self) -> impl Iterator<Item = &EntitySnapshot> {
        self.ships
            .iter()
            .chain(&self.pilots)
            .chain(&self.projectiles)
            .chain(&self.asteroids)
    }

    pub fn entity_count(&self) -> usize {
        self.ships.len() + self.pilots.len() + self.projectiles.len() + self.asteroids.len()
    }
}

/// One published snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Publisher's sequence, increases per snapshot
    pub seq: u64,
    /// Publisher clock at capture
    pub server_time_ms: u64,
    pub match_view: MatchView,
    #[serde(flatten)]
    pub world: WorldState,
    /// Present only on snapshots that carry secondary data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ship_status: Option<Vec<ShipStatus>>,
}

impl StateSnapshot {
    pub fn is_empty(&self) -> bool {
        self.world.entity_count() == 0
    }
}

/// Decides when to publish and assembles snapshots
pub struct SnapshotBuilder {
    interval_ms: u64,
    secondary_every: u32,
    last_sent_ms: Option<u64>,
    seq: u64,
}

impl SnapshotBuilder {
    pub fn new(interval_ms: u64, secondary_every: u32) -> Self {
        Self {
            interval_ms,
            secondary_every: secondary_every.max(1),
            last_sent_ms: None,
            seq: 0,
        }
    }

    /// Check if it's time to send a snapshot
    pub fn should_send(&self, now_ms: u64) -> bool {
        match self.last_sent_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.interval_ms,
        }
    }

    /// Force snapshot on next check (used for important events)
    pub fn force_next(&mut self) {
        self.last_sent_ms = None;
    }

    /// Build a snapshot message
    pub fn build(
        &mut self,
        now_ms: u64,
        state: &MatchState,
        world: WorldState,
        status: Vec<ShipStatus>,
    ) -> StateSnapshot {
        self.last_sent_ms = Some(now_ms);
        self.seq += 1;

        let every = self.secondary_every as u64;
        let ship_status = (self.seq % every == 1 % every).then_some(status);

        StateSnapshot {
            seq: self.seq,
            server_time_ms: now_ms,
            match_view: MatchView::from(state),
            world,
            ship_status,
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.seq
    }

    /// Continue numbering after `seq`, e.g. when a new authority takes over
    pub fn skip_to(&mut self, seq: u64) {
        self.seq = self.seq.max(seq);
    }
}

/// Snapshot size stats for debugging
#[derive(Debug, Default)]
pub struct SnapshotStats {
    pub total_snapshots: u64,
    pub total_bytes: u64,
    pub avg_entities_per_snapshot: f32,
}

impl SnapshotStats {
    pub fn record(&mut self, entity_count: usize, bytes: usize) {
        self.total_snapshots += 1;
        self.total_bytes += bytes as u64;

        // Running average
        let n = self.total_snapshots as f32;
        self.avg_entities_per_snapshot =
            self.avg_entities_per_snapshot * ((n - 1.0) / n) + (entity_count as f32 / n);
    }
}
