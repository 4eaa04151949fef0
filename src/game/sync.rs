//! State sync: publishing snapshots on the authority, receiving them
//! everywhere else

use std::collections::HashMap;
use tracing::{debug, trace};

use crate::config::SimulationConfig;

use super::flow::MatchState;
use super::sim::SimulationStep;
use super::smoother::DisplaySmoother;
use super::snapshot::{EntityKind, ShipStatus, SnapshotBuilder, SnapshotStats, StateSnapshot};

/// Authority side: builds a snapshot every interval
pub struct SnapshotPublisher {
    builder: SnapshotBuilder,
    stats: SnapshotStats,
}

impl SnapshotPublisher {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            builder: SnapshotBuilder::new(config.snapshot_interval_ms, config.secondary_every),
            stats: SnapshotStats::default(),
        }
    }

    /// Continue numbering after a snapshot received before taking over
    pub fn resume_after(config: &SimulationConfig, last_seq: u64) -> Self {
        let mut publisher = Self::new(config);
        publisher.builder.skip_to(last_seq);
        publisher
    }

    /// Capture the world if a snapshot is due
    pub fn poll<S: SimulationStep + ?Sized>(
        &mut self,
        now_ms: u64,
        state: &MatchState,
        sim: &S,
    ) -> Option<StateSnapshot> {
        if !self.builder.should_send(now_ms) {
            return None;
        }
        Some(self.builder.build(now_ms, state, sim.capture(), sim.ship_status()))
    }

    /// Publish at the next poll regardless of the interval
    pub fn force_next(&mut self) {
        self.builder.force_next();
    }

    pub fn record(&mut self, snapshot: &StateSnapshot, bytes: usize) {
        self.stats.record(snapshot.world.entity_count(), bytes);
        if self.stats.total_snapshots % 200 == 0 {
            debug!(
                snapshots = self.stats.total_snapshots,
                total_bytes = self.stats.total_bytes,
                avg_entities = self.stats.avg_entities_per_snapshot,
                "Snapshot stats"
            );
        }
    }

    pub fn stats(&self) -> &SnapshotStats {
        &self.stats
    }

    pub fn last_seq(&self) -> u64 {
        self.builder.last_seq()
    }
}

/// An entity that disappeared between two snapshots without an explicit
/// event, e.g. a ship destroyed in between
#[derive(Debug, Clone, PartialEq)]
pub struct VanishedEntity {
    pub id: String,
    pub kind: EntityKind,
    pub owner_id: Option<String>,
    pub x: f32,
    pub y: f32,
}

/// What one accepted snapshot changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiveReport {
    pub seq: u64,
    /// Extra delay relative to the fastest snapshot seen so far
    pub age_ms: u64,
    pub vanished: Vec<VanishedEntity>,
    pub appeared: Vec<String>,
}

/// Non-authority side: accepts snapshots in order and keeps telemetry
pub struct SnapshotReceiver {
    expected_interval_ms: u64,
    jitter_alpha: f32,
    last_seq: Option<u64>,
    last_arrival_ms: Option<u64>,
    jitter_ms: f32,
    /// Smallest `arrival - server_time` observed; absorbs clock skew
    min_offset_ms: Option<i64>,
    known: HashMap<String, VanishedEntity>,
    latest: Option<StateSnapshot>,
    /// Secondary data from the last snapshot that carried it
    ship_status: Option<Vec<ShipStatus>>,
    dropped: u64,
}

impl SnapshotReceiver {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            expected_interval_ms: config.snapshot_interval_ms,
            jitter_alpha: config.jitter_alpha,
            last_seq: None,
            last_arrival_ms: None,
            jitter_ms: 0.0,
            min_offset_ms: None,
            known: HashMap::new(),
            latest: None,
            ship_status: None,
            dropped: 0,
        }
    }

    /// Accept a snapshot if it is newer than the last one, diff it against
    /// what was known and forward it to the smoother
    pub fn receive(
        &mut self,
        snapshot: StateSnapshot,
        now_ms: u64,
        smoother: &mut DisplaySmoother,
    ) -> Option<ReceiveReport> {
        if let Some(last) = self.last_seq {
            if snapshot.seq <= last {
                trace!(seq = snapshot.seq, last, "Ignoring old snapshot");
                self.dropped += 1;
                return None;
            }
        }
        self.last_seq = Some(snapshot.seq);

        if let Some(prev) = self.last_arrival_ms {
            let interval = now_ms.saturating_sub(prev) as f32;
            let deviation = (interval - self.expected_interval_ms as f32).abs();
            self.jitter_ms += self.jitter_alpha * (deviation - self.jitter_ms);
        }
        self.last_arrival_ms = Some(now_ms);

        let offset = now_ms as i64 - snapshot.server_time_ms as i64;
        let min_offset = self.min_offset_ms.map_or(offset, |m| m.min(offset));
        self.min_offset_ms = Some(min_offset);

        let mut report = ReceiveReport {
            seq: snapshot.seq,
            age_ms: (offset - min_offset) as u64,
            ..Default::default()
        };

        if snapshot.is_empty() {
            debug!(seq = snapshot.seq, "Empty snapshot, keeping known entities");
        } else {
            let current: HashMap<String, VanishedEntity> = snapshot
                .world
                .entities()
                .filter(|e| e.alive)
                .map(|e| {
                    (
                        e.id.clone(),
                        VanishedEntity {
                            id: e.id.clone(),
                            kind: e.kind,
                            owner_id: e.owner_id.clone(),
                            x: e.x,
                            y: e.y,
                        },
                    )
                })
                .collect();

            for (id, last_seen) in self.known.drain() {
                if !current.contains_key(&id) && last_seen.kind.announces_removal() {
                    report.vanished.push(last_seen);
                }
            }
            report.vanished.sort_by(|a, b| a.id.cmp(&b.id));
            self.known = current;
        }

        report.appeared = smoother.apply_world(&snapshot.world);
        if let Some(status) = &snapshot.ship_status {
            self.ship_status = Some(status.clone());
        }
        self.latest = Some(snapshot);
        Some(report)
    }

    /// Drop the tracked entity set after the authority cleared its world
    pub fn forget_entities(&mut self) {
        self.known.clear();
    }

    pub fn jitter_ms(&self) -> f32 {
        self.jitter_ms
    }

    pub fn latest(&self) -> Option<&StateSnapshot> {
        self.latest.as_ref()
    }

    /// Latest snapshot completed with the most recent secondary data, for
    /// rebuilding the world on a new authority
    pub fn restorable(&self) -> Option<StateSnapshot> {
        let mut snapshot = self.latest.clone()?;
        if snapshot.ship_status.is_none() {
            snapshot.ship_status = self.ship_status.clone();
        }
        Some(snapshot)
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::snapshot::{EntitySnapshot, MatchView, WorldState};

    fn entity(id: &str, kind: EntityKind) -> EntitySnapshot {
        EntitySnapshot {
            id: id.to_string(),
            kind,
            owner_id: None,
            x: 10.0,
            y: 10.0,
            angle: 0.0,
            vx: 0.0,
            vy: 0.0,
            alive: true,
        }
    }

    fn snapshot(seq: u64, server_time_ms: u64, world: WorldState) -> StateSnapshot {
        StateSnapshot {
            seq,
            server_time_ms,
            match_view: MatchView::from(&MatchState::default()),
            world,
            ship_status: None,
        }
    }

    fn parts() -> (SnapshotReceiver, DisplaySmoother) {
        let config = SimulationConfig::default();
        (SnapshotReceiver::new(&config), DisplaySmoother::new(&config))
    }

    #[test]
    fn old_and_duplicate_snapshots_are_ignored() {
        let (mut rx, mut sm) = parts();
        assert!(rx.receive(snapshot(2, 0, WorldState::default()), 0, &mut sm).is_some());
        assert!(rx.receive(snapshot(2, 0, WorldState::default()), 5, &mut sm).is_none());
        assert!(rx.receive(snapshot(1, 0, WorldState::default()), 6, &mut sm).is_none());
        assert_eq!(rx.dropped(), 2);
    }

    #[test]
    fn jitter_tracks_interval_deviation() {
        let (mut rx, mut sm) = parts();
        rx.receive(snapshot(1, 0, WorldState::default()), 0, &mut sm);
        rx.receive(snapshot(2, 50, WorldState::default()), 50, &mut sm);
        assert_eq!(rx.jitter_ms(), 0.0);
        rx.receive(snapshot(3, 100, WorldState::default()), 130, &mut sm);
        // |80 - 50| * 0.1
        assert!((rx.jitter_ms() - 3.0).abs() < 1e-4);
    }

    #[test]
    fn age_is_relative_to_fastest_delivery() {
        let (mut rx, mut sm) = parts();
        // Peer clock is far ahead of the publisher; only the delay change matters
        let first = rx.receive(snapshot(1, 1_000, WorldState::default()), 90_020, &mut sm).unwrap();
        assert_eq!(first.age_ms, 0);
        let late = rx.receive(snapshot(2, 1_050, WorldState::default()), 90_110, &mut sm).unwrap();
        assert_eq!(late.age_ms, 40);
    }

    #[test]
    fn vanished_entities_reported_once() {
        let (mut rx, mut sm) = parts();
        let full = WorldState {
            ships: vec![entity("ship-a", EntityKind::Ship)],
            projectiles: vec![entity("shot-1", EntityKind::Projectile)],
            asteroids: vec![entity("rock-1", EntityKind::Asteroid)],
            ..Default::default()
        };
        rx.receive(snapshot(1, 0, full), 0, &mut sm);

        let remaining = WorldState {
            asteroids: vec![entity("rock-1", EntityKind::Asteroid)],
            ..Default::default()
        };
        let report = rx.receive(snapshot(2, 50, remaining.clone()), 50, &mut sm).unwrap();
        // Expired projectiles are not worth an effect
        assert_eq!(report.vanished.len(), 1);
        assert_eq!(report.vanished[0].id, "ship-a");

        let again = rx.receive(snapshot(3, 100, remaining), 100, &mut sm).unwrap();
        assert!(again.vanished.is_empty());
    }

    #[test]
    fn restorable_keeps_last_ship_status() {
        let (mut rx, mut sm) = parts();
        let world = WorldState {
            ships: vec![entity("ship-a", EntityKind::Ship)],
            ..Default::default()
        };
        let status = vec![ShipStatus {
            owner_id: "a".into(),
            ammo: 1,
            dash_ready: false,
        }];
        let mut with_status = snapshot(1, 0, world.clone());
        with_status.ship_status = Some(status.clone());
        rx.receive(with_status, 0, &mut sm);
        rx.receive(snapshot(2, 50, world), 50, &mut sm);

        let restored = rx.restorable().unwrap();
        assert_eq!(restored.seq, 2);
        assert_eq!(restored.ship_status, Some(status));
    }

    #[test]
    fn forgotten_entities_do_not_vanish_later() {
        let (mut rx, mut sm) = parts();
        let world = WorldState {
            ships: vec![entity("ship-a", EntityKind::Ship)],
            ..Default::default()
        };
        rx.receive(snapshot(1, 0, world), 0, &mut sm);
        rx.forget_entities();

        let next = WorldState {
            ships: vec![entity("ship-b", EntityKind::Ship)],
            ..Default::default()
        };
        let report = rx.receive(snapshot(2, 50, next), 50, &mut sm).unwrap();
        assert!(report.vanished.is_empty());
    }

    #[test]
    fn empty_snapshot_vanishes_nothing() {
        let (mut rx, mut sm) = parts();
        let world = WorldState {
            ships: vec![entity("ship-a", EntityKind::Ship)],
            ..Default::default()
        };
        rx.receive(snapshot(1, 0, world.clone()), 0, &mut sm);
        let report = rx.receive(snapshot(2, 50, WorldState::default()), 50, &mut sm).unwrap();
        assert!(report.vanished.is_empty());
        assert!(sm.contains("ship-a"));

        let report = rx.receive(snapshot(3, 100, world), 100, &mut sm).unwrap();
        assert!(report.vanished.is_empty());
        assert!(report.appeared.is_empty());
    }
}
