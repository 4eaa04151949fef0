//! Display smoothing for entities simulated elsewhere.
//!
//! Snapshots arrive every ~50 ms; frames render far more often. Between
//! snapshots each entity is extrapolated along its last known velocity and
//! the displayed pose is blended toward that extrapolated target every frame.
//! Only non-authoritative peers use this; the authority renders its own
//! simulation directly.

use std::collections::{HashMap, HashSet};
use std::f32::consts::{PI, TAU};
use tracing::debug;

use crate::config::SimulationConfig;

use super::snapshot::{EntityKind, EntitySnapshot, WorldState};

/// Per-frame blend toward the extrapolated target, by entity class.
/// Small fast objects catch up quickly, large slow ones ease in.
fn blend_factor(kind: EntityKind) -> f32 {
    match kind {
        EntityKind::Projectile => 0.5,
        EntityKind::Ship | EntityKind::Pilot => 0.3,
        EntityKind::Asteroid => 0.15,
    }
}

/// Signed shortest rotation from `from` to `to`, in `(-PI, PI]`
fn shortest_arc(from: f32, to: f32) -> f32 {
    let delta = (to - from).rem_euclid(TAU);
    if delta > PI {
        delta - TAU
    } else {
        delta
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmoothedEntity {
    pub kind: EntityKind,
    pub display_x: f32,
    pub display_y: f32,
    pub display_angle: f32,
    pub target_x: f32,
    pub target_y: f32,
    pub target_angle: f32,
    pub vx: f32,
    pub vy: f32,
    /// Time since the last snapshot touched this entity
    pub age_ms: u64,
}

impl SmoothedEntity {
    fn snapped(e: &EntitySnapshot) -> Self {
        Self {
            kind: e.kind,
            display_x: e.x,
            display_y: e.y,
            display_angle: e.angle,
            target_x: e.x,
            target_y: e.y,
            target_angle: e.angle,
            vx: e.vx,
            vy: e.vy,
            age_ms: 0,
        }
    }

    fn snap_to_target(&mut self) {
        self.display_x = self.target_x;
        self.display_y = self.target_y;
        self.display_angle = self.target_angle;
    }

    pub fn display(&self) -> (f32, f32, f32) {
        (self.display_x, self.display_y, self.display_angle)
    }
}

pub struct DisplaySmoother {
    hard_snap_px: f32,
    extrapolation_cap_ms: u64,
    entities: HashMap<String, SmoothedEntity>,
    hard_snaps: u64,
}

impl DisplaySmoother {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            hard_snap_px: config.hard_snap_px,
            extrapolation_cap_ms: config.extrapolation_cap_ms,
            entities: HashMap::new(),
            hard_snaps: 0,
        }
    }

    /// Feed one entity from a snapshot. Returns true the first time an id
    /// is seen.
    pub fn apply(&mut self, e: &EntitySnapshot) -> bool {
        let Some(tracked) = self.entities.get_mut(&e.id) else {
            self.entities.insert(e.id.clone(), SmoothedEntity::snapped(e));
            return true;
        };

        tracked.kind = e.kind;
        tracked.target_x = e.x;
        tracked.target_y = e.y;
        tracked.target_angle = e.angle;
        tracked.vx = e.vx;
        tracked.vy = e.vy;
        tracked.age_ms = 0;

        let (dx, dy) = (e.x - tracked.display_x, e.y - tracked.display_y);
        if (dx * dx + dy * dy).sqrt() > self.hard_snap_px {
            // Respawn or wrap-around, not a correction
            tracked.snap_to_target();
            self.hard_snaps += 1;
            debug!(entity = %e.id, distance = (dx * dx + dy * dy).sqrt(), "Hard snap");
        }
        false
    }

    /// Feed a whole snapshot and return the ids tracked for the first time.
    /// Untracked ids are dropped only when the snapshot has entities; an
    /// empty one is treated as a glitch.
    pub fn apply_world(&mut self, world: &WorldState) -> Vec<String> {
        let mut fresh = Vec::new();
        for e in world.entities().filter(|e| e.alive) {
            if self.apply(e) {
                fresh.push(e.id.clone());
            }
        }

        if world.entity_count() == 0 {
            debug!(tracked = self.entities.len(), "Empty snapshot, keeping tracked entities");
            return fresh;
        }

        let present: HashSet<&str> = world
            .entities()
            .filter(|e| e.alive)
            .map(|e| e.id.as_str())
            .collect();
        self.entities.retain(|id, _| present.contains(id.as_str()));
        fresh
    }

    /// Advance every entity by one render frame
    pub fn update(&mut self, dt_ms: u64) {
        let cap = self.extrapolation_cap_ms;
        for e in self.entities.values_mut() {
            e.age_ms = e.age_ms.saturating_add(dt_ms);
            let lead = e.age_ms.min(cap) as f32 / 1000.0;
            let goal_x = e.target_x + e.vx * lead;
            let goal_y = e.target_y + e.vy * lead;

            let blend = blend_factor(e.kind);
            e.display_x += (goal_x - e.display_x) * blend;
            e.display_y += (goal_y - e.display_y) * blend;
            e.display_angle = (e.display_angle + shortest_arc(e.display_angle, e.target_angle) * blend)
                .rem_euclid(TAU);
        }
    }

    pub fn get(&self, id: &str) -> Option<&SmoothedEntity> {
        self.entities.get(id)
    }

    pub fn display_position(&self, id: &str) -> Option<(f32, f32)> {
        self.entities.get(id).map(|e| (e.display_x, e.display_y))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SmoothedEntity)> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn hard_snaps(&self) -> u64 {
        self.hard_snaps
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str, kind: EntityKind, x: f32, y: f32, vx: f32) -> EntitySnapshot {
        EntitySnapshot {
            id: id.to_string(),
            kind,
            owner_id: None,
            x,
            y,
            angle: 0.0,
            vx,
            vy: 0.0,
            alive: true,
        }
    }

    fn smoother() -> DisplaySmoother {
        DisplaySmoother::new(&SimulationConfig::default())
    }

    #[test]
    fn first_sighting_snaps() {
        let mut s = smoother();
        assert!(s.apply(&entity("a", EntityKind::Ship, 10.0, 20.0, 5.0)));
        assert_eq!(s.display_position("a"), Some((10.0, 20.0)));
        assert!(!s.apply(&entity("a", EntityKind::Ship, 12.0, 20.0, 5.0)));
    }

    #[test]
    fn constant_velocity_converges() {
        let mut s = smoother();
        let v = 60.0;
        let truth = |t: u64| 100.0 + v * t as f32 / 1000.0;
        s.apply(&entity("a", EntityKind::Ship, truth(0), 50.0, v));

        let mut worst_late = 0.0f32;
        for frame in 1..=300u64 {
            let t = frame * 16;
            s.update(16);
            if t % 48 == 0 {
                s.apply(&entity("a", EntityKind::Ship, truth(t), 50.0, v));
            }
            let (x, _) = s.display_position("a").unwrap();
            let error = (x - truth(t)).abs();
            assert!(error < 100.0, "exceeded hard snap distance at frame {}", frame);
            if frame > 60 {
                worst_late = worst_late.max(error);
            }
        }
        assert!(worst_late < 3.0, "steady-state error {}", worst_late);
        assert_eq!(s.hard_snaps(), 0);
    }

    #[test]
    fn large_jump_hard_snaps_exactly() {
        let mut s = smoother();
        s.apply(&entity("a", EntityKind::Ship, 0.0, 0.0, 0.0));
        s.update(16);
        s.apply(&entity("a", EntityKind::Ship, 500.0, 300.0, 0.0));
        assert_eq!(s.display_position("a"), Some((500.0, 300.0)));
        s.update(16);
        assert_eq!(s.display_position("a"), Some((500.0, 300.0)));
        assert_eq!(s.hard_snaps(), 1);
    }

    #[test]
    fn small_correction_blends() {
        let mut s = smoother();
        s.apply(&entity("a", EntityKind::Ship, 0.0, 0.0, 0.0));
        s.apply(&entity("a", EntityKind::Ship, 10.0, 0.0, 0.0));
        s.update(16);
        let (x, _) = s.display_position("a").unwrap();
        assert!(x > 0.0 && x < 10.0);
    }

    #[test]
    fn empty_snapshot_keeps_entities() {
        let mut s = smoother();
        let world = WorldState {
            ships: vec![entity("a", EntityKind::Ship, 0.0, 0.0, 0.0)],
            asteroids: vec![entity("r", EntityKind::Asteroid, 5.0, 5.0, 0.0)],
            ..Default::default()
        };
        s.apply_world(&world);
        s.apply_world(&WorldState::default());
        assert!(s.contains("a") && s.contains("r"));
    }

    #[test]
    fn absent_entities_dropped_from_non_empty_snapshot() {
        let mut s = smoother();
        s.apply_world(&WorldState {
            ships: vec![
                entity("a", EntityKind::Ship, 0.0, 0.0, 0.0),
                entity("b", EntityKind::Ship, 9.0, 0.0, 0.0),
            ],
            ..Default::default()
        });
        let fresh = s.apply_world(&WorldState {
            ships: vec![entity("a", EntityKind::Ship, 1.0, 0.0, 0.0)],
            projectiles: vec![entity("p", EntityKind::Projectile, 3.0, 0.0, 0.0)],
            ..Default::default()
        });
        assert_eq!(fresh, vec!["p".to_string()]);
        assert!(!s.contains("b"));
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn extrapolation_is_capped() {
        let mut s = smoother();
        s.apply(&entity("a", EntityKind::Projectile, 0.0, 0.0, 100.0));
        // No snapshots for two seconds
        for _ in 0..125 {
            s.update(16);
        }
        let (x, _) = s.display_position("a").unwrap();
        assert!((x - 20.0).abs() < 0.01, "x = {}", x);
    }

    #[test]
    fn angles_blend_along_shortest_arc() {
        let mut s = smoother();
        let mut e = entity("a", EntityKind::Ship, 0.0, 0.0, 0.0);
        e.angle = TAU - 0.1;
        s.apply(&e);
        e.angle = 0.1;
        s.apply(&e);
        s.update(16);
        let angle = s.get("a").unwrap().display_angle;
        // Crossing zero, not sweeping back through PI
        assert!(angle > TAU - 0.1 || angle < 0.1, "angle = {}", angle);
    }

    #[test]
    fn shortest_arc_picks_direction() {
        assert!((shortest_arc(0.1, TAU - 0.1) + 0.2).abs() < 1e-5);
        assert!((shortest_arc(TAU - 0.1, 0.1) - 0.2).abs() < 1e-5);
    }
}
