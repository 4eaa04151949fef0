//! Reference simulation: ships, ejected pilots, projectiles and drifting
//! asteroids on a wrap-around arena

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::f32::consts::TAU;
use tracing::debug;

use crate::config::SimulationConfig;

use super::bot::{Visibility, WorldView};
use super::combat::{DashCharge, Magazine, Projectile, WeaponStats};
use super::input::PlayerInput;
use super::physics::{Arena, Body, BodyStats, PhysicsSystem};
use super::sim::{Cue, Elimination, KillCredit, SimulationStep, StepOutcome};
use super::snapshot::{EntityKind, EntitySnapshot, ShipStatus, StateSnapshot, WorldState};
use super::PlayerId;

const ASTEROID_RADIUS: f32 = 28.0;
const ASTEROID_SPEED: f32 = 40.0;
const ASTEROID_CLEARANCE: f32 = 160.0;
const DEFAULT_ASTEROIDS: usize = 4;
/// Speed kept by a pilot thrown clear of its ship
const EJECT_CARRY: f32 = 0.5;

#[derive(Debug, Clone)]
struct Ship {
    owner: PlayerId,
    body: Body,
    magazine: Magazine,
    dash: DashCharge,
}

#[derive(Debug, Clone)]
struct Pilot {
    owner: PlayerId,
    body: Body,
}

#[derive(Debug, Clone)]
struct Asteroid {
    id: String,
    body: Body,
}

pub struct ArenaSimulation {
    arena: Arena,
    weapons: WeaponStats,
    rng: ChaCha8Rng,
    asteroid_count: usize,
    ships: Vec<Ship>,
    pilots: Vec<Pilot>,
    projectiles: Vec<Projectile>,
    asteroids: Vec<Asteroid>,
    next_entity: u64,
}

fn ship_id(owner: &str) -> String {
    format!("ship-{}", owner)
}

fn pilot_id(owner: &str) -> String {
    format!("pilot-{}", owner)
}

fn snapshot_of(id: String, kind: EntityKind, owner: Option<&str>, body: &Body) -> EntitySnapshot {
    EntitySnapshot {
        id,
        kind,
        owner_id: owner.map(str::to_string),
        x: body.x,
        y: body.y,
        angle: body.angle,
        vx: body.vx,
        vy: body.vy,
        alive: true,
    }
}

fn body_of(entity: &EntitySnapshot) -> Body {
    Body {
        x: entity.x,
        y: entity.y,
        angle: entity.angle,
        vx: entity.vx,
        vy: entity.vy,
    }
}

impl ArenaSimulation {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            arena: Arena {
                width: config.arena_width,
                height: config.arena_height,
            },
            weapons: WeaponStats::default(),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            asteroid_count: DEFAULT_ASTEROIDS,
            ships: Vec::new(),
            pilots: Vec::new(),
            projectiles: Vec::new(),
            asteroids: Vec::new(),
            next_entity: 0,
        }
    }

    /// Number of asteroids spawned at the start of each round
    pub fn with_asteroids(mut self, count: usize) -> Self {
        self.asteroid_count = count;
        self
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_entity += 1;
        format!("{}-{}", prefix, self.next_entity)
    }

    /// Place an asteroid, returning its id
    pub fn spawn_asteroid(&mut self, x: f32, y: f32, vx: f32, vy: f32) -> String {
        let id = self.next_id("rock");
        self.asteroids.push(Asteroid {
            id: id.clone(),
            body: Body {
                x,
                y,
                angle: 0.0,
                vx,
                vy,
            },
        });
        id
    }

    /// Place a ship for `owner`, replacing any it already has
    pub fn spawn_ship(&mut self, owner: &str, x: f32, y: f32, angle: f32) {
        self.ships.retain(|s| s.owner != owner);
        self.pilots.retain(|p| p.owner != owner);
        self.ships.push(Ship {
            owner: owner.to_string(),
            body: Body::at(x, y, angle),
            magazine: Magazine::full(&self.weapons),
            dash: DashCharge::default(),
        });
    }

    pub fn has_ship(&self, owner: &str) -> bool {
        self.ships.iter().any(|s| s.owner == owner)
    }

    pub fn has_pilot(&self, owner: &str) -> bool {
        self.pilots.iter().any(|p| p.owner == owner)
    }

    /// Whether `owner` still has a ship or pilot in play
    pub fn has_live_entity(&self, owner: &str) -> bool {
        self.has_ship(owner) || self.has_pilot(owner)
    }

    pub fn projectile_count(&self) -> usize {
        self.projectiles.len()
    }

    fn random_clear_spot(&mut self) -> (f32, f32) {
        let mut spot = (0.0, 0.0);
        for _ in 0..16 {
            spot = (
                self.rng.gen_range(0.0..self.arena.width),
                self.rng.gen_range(0.0..self.arena.height),
            );
            let clear = self.ships.iter().all(|s| {
                let (dx, dy) = (s.body.x - spot.0, s.body.y - spot.1);
                (dx * dx + dy * dy).sqrt() > ASTEROID_CLEARANCE
            });
            if clear {
                break;
            }
        }
        spot
    }

    fn control_ships(&mut self, inputs: &HashMap<PlayerId, PlayerInput>, dt_ms: u64, cues: &mut Vec<Cue>) {
        let dt = dt_ms as f32 / 1000.0;
        let mut fired = Vec::new();

        for ship in &mut self.ships {
            let input = inputs.get(&ship.owner).copied().unwrap_or_default();
            ship.magazine.update(dt_ms, &self.weapons);
            ship.dash.update(dt_ms);

            if input.dash_requested && ship.dash.try_use(&self.weapons) {
                ship.body.impulse(self.weapons.dash_impulse);
                cues.push(Cue {
                    name: "dash".into(),
                    x: ship.body.x,
                    y: ship.body.y,
                });
            }

            PhysicsSystem::steer(&mut ship.body, input.button_a, &BodyStats::SHIP, dt);
            self.arena.wrap(&mut ship.body);

            if input.button_b && ship.magazine.try_fire(&self.weapons) {
                fired.push((ship.owner.clone(), ship.body));
            }
        }

        for (owner, body) in fired {
            let id = self.next_id("shot");
            cues.push(Cue {
                name: "fire".into(),
                x: body.x,
                y: body.y,
            });
            self.projectiles.push(Projectile::fire(
                id,
                owner,
                &body,
                BodyStats::SHIP.hitbox_radius + 2.0,
                &self.weapons,
            ));
        }

        // Ship-to-ship contact only pushes apart
        for i in 0..self.ships.len() {
            for j in (i + 1)..self.ships.len() {
                let (left, right) = self.ships.split_at_mut(j);
                PhysicsSystem::separate(&mut left[i].body, &mut right[0].body, BodyStats::SHIP.hitbox_radius);
            }
        }
    }

    fn control_pilots(&mut self, inputs: &HashMap<PlayerId, PlayerInput>, dt_ms: u64) {
        let dt = dt_ms as f32 / 1000.0;
        for pilot in &mut self.pilots {
            let thrusting = inputs.get(&pilot.owner).is_some_and(|i| i.button_a);
            PhysicsSystem::steer(&mut pilot.body, thrusting, &BodyStats::PILOT, dt);
            self.arena.wrap(&mut pilot.body);
        }
    }

    fn destroy_ship(&mut self, index: usize, cues: &mut Vec<Cue>) {
        let ship = self.ships.remove(index);
        debug!(player_id = %ship.owner, "Ship destroyed, pilot ejected");
        cues.push(Cue {
            name: "ship_destroyed".into(),
            x: ship.body.x,
            y: ship.body.y,
        });
        let mut body = ship.body;
        body.vx *= EJECT_CARRY;
        body.vy *= EJECT_CARRY;
        self.pilots.push(Pilot {
            owner: ship.owner,
            body,
        });
    }

    fn kill_pilot(&mut self, index: usize, killer: KillCredit, outcome: &mut StepOutcome) {
        let pilot = self.pilots.remove(index);
        debug!(player_id = %pilot.owner, killer = killer.as_id(), "Pilot eliminated");
        outcome.cues.push(Cue {
            name: "pilot_killed".into(),
            x: pilot.body.x,
            y: pilot.body.y,
        });
        outcome.eliminations.push(Elimination {
            victim: pilot.owner,
            killer,
        });
    }

    fn resolve_projectile_hits(&mut self, outcome: &mut StepOutcome) {
        let mut spent = Vec::new();

        for (p_idx, projectile) in self.projectiles.clone().iter().enumerate() {
            if let Some(a_idx) = self
                .asteroids
                .iter()
                .position(|a| projectile.check_hit(&a.body, ASTEROID_RADIUS))
            {
                let rock = self.asteroids.remove(a_idx);
                outcome.cues.push(Cue {
                    name: "asteroid_destroyed".into(),
                    x: rock.body.x,
                    y: rock.body.y,
                });
                spent.push(p_idx);
                continue;
            }

            if let Some(s_idx) = self.ships.iter().position(|s| {
                projectile.can_hit_owner(&s.owner, &self.weapons)
                    && projectile.check_hit(&s.body, BodyStats::SHIP.hitbox_radius)
            }) {
                self.destroy_ship(s_idx, &mut outcome.cues);
                spent.push(p_idx);
                continue;
            }

            if let Some(k_idx) = self.pilots.iter().position(|p| {
                projectile.can_hit_owner(&p.owner, &self.weapons)
                    && projectile.check_hit(&p.body, BodyStats::PILOT.hitbox_radius)
            }) {
                let credit = KillCredit::Player(projectile.owner_id.clone());
                self.kill_pilot(k_idx, credit, outcome);
                spent.push(p_idx);
            }
        }

        let mut index = 0;
        self.projectiles.retain(|_| {
            let keep = !spent.contains(&index);
            index += 1;
            keep
        });
    }

    fn resolve_asteroid_hits(&mut self, outcome: &mut StepOutcome) {
        let rocks: Vec<Body> = self.asteroids.iter().map(|a| a.body).collect();
        let touches = |body: &Body, radius: f32| {
            rocks
                .iter()
                .any(|r| PhysicsSystem::overlaps(r.x, r.y, ASTEROID_RADIUS, body.x, body.y, radius))
        };

        // A pilot ejected onto a rock this tick survives until the next one
        let veterans: Vec<PlayerId> = self.pilots.iter().map(|p| p.owner.clone()).collect();

        while let Some(idx) = self
            .ships
            .iter()
            .position(|s| touches(&s.body, BodyStats::SHIP.hitbox_radius))
        {
            self.destroy_ship(idx, &mut outcome.cues);
        }

        while let Some(idx) = self.pilots.iter().position(|p| {
            veterans.contains(&p.owner) && touches(&p.body, BodyStats::PILOT.hitbox_radius)
        }) {
            self.kill_pilot(idx, KillCredit::Environment, outcome);
        }
    }
}

impl WorldView for ArenaSimulation {
    fn visibility(&self, player: &str) -> Visibility {
        let own = self
            .ships
            .iter()
            .find(|s| s.owner == player)
            .map(|s| snapshot_of(ship_id(&s.owner), EntityKind::Ship, Some(&s.owner), &s.body))
            .or_else(|| {
                self.pilots
                    .iter()
                    .find(|p| p.owner == player)
                    .map(|p| snapshot_of(pilot_id(&p.owner), EntityKind::Pilot, Some(&p.owner), &p.body))
            });

        let enemies = self
            .ships
            .iter()
            .filter(|s| s.owner != player)
            .map(|s| snapshot_of(ship_id(&s.owner), EntityKind::Ship, Some(&s.owner), &s.body))
            .chain(
                self.pilots
                    .iter()
                    .filter(|p| p.owner != player)
                    .map(|p| snapshot_of(pilot_id(&p.owner), EntityKind::Pilot, Some(&p.owner), &p.body)),
            )
            .collect();

        let hazards = self
            .asteroids
            .iter()
            .map(|a| snapshot_of(a.id.clone(), EntityKind::Asteroid, None, &a.body))
            .chain(
                self.projectiles
                    .iter()
                    .filter(|p| p.owner_id != player)
                    .map(|p| snapshot_of(p.id.clone(), EntityKind::Projectile, Some(&p.owner_id), &p.body)),
            )
            .collect();

        Visibility { own, enemies, hazards }
    }
}

impl SimulationStep for ArenaSimulation {
    fn begin_round(&mut self, participants: &[PlayerId], round: u32) {
        self.clear();

        let (cx, cy) = (self.arena.width / 2.0, self.arena.height / 2.0);
        let radius = self.arena.height.min(self.arena.width) * 0.35;
        let count = participants.len().max(1) as f32;
        for (i, owner) in participants.iter().enumerate() {
            let theta = TAU * i as f32 / count;
            // Face the centre
            let angle = (theta + std::f32::consts::PI).rem_euclid(TAU);
            self.spawn_ship(owner, cx + theta.cos() * radius, cy + theta.sin() * radius, angle);
        }

        for _ in 0..self.asteroid_count {
            let (x, y) = self.random_clear_spot();
            let heading = self.rng.gen_range(0.0..TAU);
            self.spawn_asteroid(x, y, heading.cos() * ASTEROID_SPEED, heading.sin() * ASTEROID_SPEED);
        }

        debug!(round, ships = self.ships.len(), asteroids = self.asteroids.len(), "Round spawned");
    }

    fn step(&mut self, inputs: &HashMap<PlayerId, PlayerInput>, dt_ms: u64) -> StepOutcome {
        let mut outcome = StepOutcome::default();
        let dt = dt_ms as f32 / 1000.0;

        self.control_ships(inputs, dt_ms, &mut outcome.cues);
        self.control_pilots(inputs, dt_ms);

        for rock in &mut self.asteroids {
            PhysicsSystem::drift(&mut rock.body, dt);
            self.arena.wrap(&mut rock.body);
        }

        let arena = self.arena;
        self.projectiles.retain_mut(|p| {
            let alive = p.update(dt_ms);
            arena.wrap(&mut p.body);
            alive
        });

        self.resolve_projectile_hits(&mut outcome);
        self.resolve_asteroid_hits(&mut outcome);
        outcome
    }

    fn capture(&self) -> WorldState {
        WorldState {
            ships: self
                .ships
                .iter()
                .map(|s| snapshot_of(ship_id(&s.owner), EntityKind::Ship, Some(&s.owner), &s.body))
                .collect(),
            pilots: self
                .pilots
                .iter()
                .map(|p| snapshot_of(pilot_id(&p.owner), EntityKind::Pilot, Some(&p.owner), &p.body))
                .collect(),
            projectiles: self
                .projectiles
                .iter()
                .map(|p| snapshot_of(p.id.clone(), EntityKind::Projectile, Some(&p.owner_id), &p.body))
                .collect(),
            asteroids: self
                .asteroids
                .iter()
                .map(|a| snapshot_of(a.id.clone(), EntityKind::Asteroid, None, &a.body))
                .collect(),
        }
    }

    fn ship_status(&self) -> Vec<ShipStatus> {
        self.ships
            .iter()
            .map(|s| ShipStatus {
                owner_id: s.owner.clone(),
                ammo: s.magazine.ammo,
                dash_ready: s.dash.is_ready(),
            })
            .collect()
    }

    fn restore(&mut self, snapshot: &StateSnapshot) {
        self.clear();
        let world = &snapshot.world;
        let ammo: HashMap<&str, u8> = snapshot
            .ship_status
            .iter()
            .flatten()
            .map(|s| (s.owner_id.as_str(), s.ammo))
            .collect();

        for entity in world.ships.iter().filter(|e| e.alive) {
            let Some(owner) = entity.owner_id.clone() else {
                continue;
            };
            let magazine = match ammo.get(owner.as_str()) {
                Some(&rounds) => Magazine::with_ammo(rounds),
                None => Magazine::full(&self.weapons),
            };
            self.ships.push(Ship {
                owner,
                body: body_of(entity),
                magazine,
                dash: DashCharge::default(),
            });
        }
        for entity in world.pilots.iter().filter(|e| e.alive) {
            if let Some(owner) = entity.owner_id.clone() {
                self.pilots.push(Pilot {
                    owner,
                    body: body_of(entity),
                });
            }
        }
        for entity in world.projectiles.iter().filter(|e| e.alive) {
            let Some(owner_id) = entity.owner_id.clone() else {
                continue;
            };
            self.projectiles.push(Projectile {
                id: entity.id.clone(),
                owner_id,
                body: body_of(entity),
                radius: self.weapons.projectile_radius,
                // Past the grace period; remaining life is unknown
                age_ms: self.weapons.owner_grace_ms,
                lifetime_ms: self.weapons.projectile_lifetime_ms,
            });
        }
        for entity in world.asteroids.iter().filter(|e| e.alive) {
            self.asteroids.push(Asteroid {
                id: entity.id.clone(),
                body: body_of(entity),
            });
        }

        // New ids must not collide with restored ones
        self.next_entity = world
            .entities()
            .filter_map(|e| e.id.rsplit('-').next()?.parse::<u64>().ok())
            .max()
            .unwrap_or(0);

        debug!(
            seq = snapshot.seq,
            entities = world.entity_count(),
            "World restored from snapshot"
        );
    }

    fn remove_player(&mut self, player: &str) {
        self.ships.retain(|s| s.owner != player);
        self.pilots.retain(|p| p.owner != player);
        self.projectiles.retain(|p| p.owner_id != player);
    }

    fn clear(&mut self) {
        self.ships.clear();
        self.pilots.clear();
        self.projectiles.clear();
        self.asteroids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::snapshot::{MatchView, SnapshotBuilder};
    use crate::game::flow::MatchState;
    use crate::game::smoother::DisplaySmoother;
    use crate::game::sync::SnapshotReceiver;

    fn sim() -> ArenaSimulation {
        ArenaSimulation::new(&SimulationConfig::default()).with_asteroids(0)
    }

    fn press(pairs: &[(&str, PlayerInput)]) -> HashMap<PlayerId, PlayerInput> {
        pairs.iter().map(|(id, i)| (id.to_string(), *i)).collect()
    }

    fn fire() -> PlayerInput {
        PlayerInput {
            button_b: true,
            ..Default::default()
        }
    }

    /// Run until `done` holds or the budget runs out
    fn run_until(
        sim: &mut ArenaSimulation,
        inputs: &HashMap<PlayerId, PlayerInput>,
        mut done: impl FnMut(&ArenaSimulation, &StepOutcome) -> bool,
    ) -> Vec<Elimination> {
        let mut eliminations = Vec::new();
        for _ in 0..120 {
            let outcome = sim.step(inputs, 33);
            eliminations.extend(outcome.eliminations.clone());
            if done(sim, &outcome) {
                break;
            }
        }
        eliminations
    }

    #[test]
    fn begin_round_spawns_one_ship_each() {
        let mut sim = ArenaSimulation::new(&SimulationConfig::default());
        sim.begin_round(&["a".into(), "b".into(), "c".into()], 1);
        let world = sim.capture();
        assert_eq!(world.ships.len(), 3);
        assert_eq!(world.asteroids.len(), DEFAULT_ASTEROIDS);
        assert!(world.pilots.is_empty());
    }

    #[test]
    fn shot_ship_ejects_pilot_without_elimination() {
        let mut sim = sim();
        sim.spawn_ship("a", 100.0, 300.0, 0.0);
        sim.spawn_ship("b", 220.0, 300.0, 0.0);

        let inputs = press(&[("a", fire())]);
        let elims = run_until(&mut sim, &inputs, |s, _| !s.has_ship("b"));
        assert!(elims.is_empty());
        assert!(sim.has_pilot("b"));
    }

    #[test]
    fn shot_pilot_is_eliminated_with_credit() {
        let mut sim = sim();
        sim.spawn_ship("a", 100.0, 300.0, 0.0);
        sim.spawn_ship("b", 220.0, 300.0, 0.0);

        let inputs = press(&[("a", fire())]);
        let elims = run_until(&mut sim, &inputs, |_, o| !o.eliminations.is_empty());
        assert_eq!(
            elims,
            vec![Elimination {
                victim: "b".into(),
                killer: KillCredit::Player("a".into()),
            }]
        );
        assert!(!sim.has_live_entity("b"));
    }

    #[test]
    fn asteroid_kills_credit_environment() {
        let mut sim = sim();
        sim.spawn_ship("a", 300.0, 300.0, 0.0);
        sim.spawn_asteroid(300.0, 300.0, 0.0, 0.0);

        let none = HashMap::new();
        sim.step(&none, 33);
        assert!(!sim.has_ship("a"));
        assert!(sim.has_pilot("a"));

        let elims = run_until(&mut sim, &none, |_, o| !o.eliminations.is_empty());
        assert_eq!(elims[0].killer, KillCredit::Environment);
    }

    #[test]
    fn firing_spends_ammo() {
        let mut sim = sim();
        sim.spawn_ship("a", 100.0, 100.0, 0.0);
        sim.step(&press(&[("a", fire())]), 33);
        assert_eq!(sim.projectile_count(), 1);
        assert_eq!(sim.ship_status()[0].ammo, 2);
    }

    #[test]
    fn dash_needs_cooldown() {
        let mut sim = sim();
        sim.spawn_ship("a", 100.0, 100.0, 0.0);
        let dash = PlayerInput {
            dash_requested: true,
            ..Default::default()
        };
        let outcome = sim.step(&press(&[("a", dash)]), 33);
        assert!(outcome.cues.iter().any(|c| c.name == "dash"));
        assert!(!sim.ship_status()[0].dash_ready);
        let outcome = sim.step(&press(&[("a", dash)]), 33);
        assert!(!outcome.cues.iter().any(|c| c.name == "dash"));
    }

    #[test]
    fn restore_rebuilds_captured_world() {
        let mut original = sim();
        original.spawn_ship("a", 100.0, 100.0, 1.0);
        original.spawn_asteroid(600.0, 400.0, 10.0, 0.0);
        original.step(&press(&[("a", fire())]), 33);

        let mut builder = SnapshotBuilder::new(50, 1);
        let snap = builder.build(0, &MatchState::default(), original.capture(), original.ship_status());
        assert_eq!(snap.match_view, MatchView::from(&MatchState::default()));

        let mut restored = sim();
        restored.restore(&snap);
        assert_eq!(restored.capture(), original.capture());
        assert_eq!(restored.ship_status(), original.ship_status());

        // Fresh ids continue past restored ones
        let id = restored.spawn_asteroid(0.0, 0.0, 0.0, 0.0);
        assert!(!original.capture().entities().any(|e| e.id == id));
    }

    #[test]
    fn restore_between_secondary_snapshots_keeps_ammo() {
        let config = SimulationConfig::default();
        let mut original = sim();
        original.spawn_ship("a", 100.0, 100.0, 1.0);
        original.step(&press(&[("a", fire())]), 33);
        let spent = original.ship_status();

        // Only the first of every two snapshots carries ship status
        let mut builder = SnapshotBuilder::new(50, 2);
        let mut receiver = SnapshotReceiver::new(&config);
        let mut smoother = DisplaySmoother::new(&config);
        for now in [0, 50] {
            let snap = builder.build(now, &MatchState::default(), original.capture(), original.ship_status());
            receiver.receive(snap, now, &mut smoother);
        }
        assert!(receiver.latest().unwrap().ship_status.is_none());

        let mut restored = sim();
        restored.restore(&receiver.restorable().unwrap());
        assert_eq!(restored.ship_status(), spent);
    }

    #[test]
    fn visibility_separates_self_from_enemies() {
        let mut sim = sim();
        sim.spawn_ship("a", 100.0, 100.0, 0.0);
        sim.spawn_ship("b", 400.0, 100.0, 0.0);
        sim.spawn_asteroid(700.0, 500.0, 0.0, 0.0);
        let view = sim.visibility("a");
        assert_eq!(view.own.unwrap().id, "ship-a");
        assert_eq!(view.enemies.len(), 1);
        assert_eq!(view.hazards.len(), 1);
    }

    #[test]
    fn removed_player_leaves_no_entities() {
        let mut sim = sim();
        sim.spawn_ship("a", 100.0, 100.0, 0.0);
        sim.step(&press(&[("a", fire())]), 33);
        sim.remove_player("a");
        assert!(!sim.has_live_entity("a"));
        assert_eq!(sim.projectile_count(), 0);
    }
}
