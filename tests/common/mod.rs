#![allow(dead_code)]

use arena_netcore::config::SimulationConfig;
use arena_netcore::game::sim::SimulationStep;
use arena_netcore::game::{ArenaSimulation, GameSession, MatchPhase, SessionEvent};
use arena_netcore::transport::{RelayHub, RelayTransport};

pub type Session = GameSession<RelayTransport, ArenaSimulation>;

pub const STEP_MS: u64 = 33;

pub fn session(hub: &RelayHub, name: &str, config: &SimulationConfig) -> Session {
    let sim = ArenaSimulation::new(config).with_asteroids(0);
    GameSession::new(hub.connect(name), sim, config.clone()).unwrap()
}

/// Several sessions sharing one relay room and one clock
pub struct Table {
    pub hub: RelayHub,
    pub config: SimulationConfig,
    pub seats: Vec<Session>,
    pub events: Vec<Vec<SessionEvent>>,
    pub now: u64,
}

impl Table {
    pub fn open(config: SimulationConfig, names: &[&str], seed: u64) -> Self {
        let hub = RelayHub::with_seed(config.max_players, seed);
        let mut table = Table {
            hub,
            config,
            seats: Vec::new(),
            events: Vec::new(),
            now: 0,
        };

        let mut host = session(&table.hub, names[0], &table.config);
        let code = host.create_room().unwrap();
        table.seats.push(host);
        table.events.push(Vec::new());
        table.advance(STEP_MS);

        for name in &names[1..] {
            table.join(&code, name);
        }
        table
    }

    pub fn join(&mut self, code: &str, name: &str) -> usize {
        let mut seat = session(&self.hub, name, &self.config);
        seat.join_room(code).unwrap();
        self.seats.push(seat);
        self.events.push(Vec::new());
        self.advance(STEP_MS * 2);
        self.seats.len() - 1
    }

    pub fn code(&self) -> String {
        self.seats[0].room_code().unwrap().to_string()
    }

    pub fn id(&self, seat: usize) -> String {
        self.seats[seat].local_peer().id.clone()
    }

    /// Tick every seat in join order, then render one frame
    pub fn advance(&mut self, ms: u64) {
        let target = self.now + ms;
        while self.now < target {
            self.now = (self.now + STEP_MS).min(target);
            for (seat, events) in self.seats.iter_mut().zip(self.events.iter_mut()) {
                seat.tick(self.now).unwrap();
                seat.frame(STEP_MS);
                events.extend(seat.drain_events());
            }
        }
    }

    /// Advance until the host reaches `phase`, failing after `limit_ms`
    pub fn run_until(&mut self, seat: usize, phase: MatchPhase, limit_ms: u64) {
        let deadline = self.now + limit_ms;
        while self.seats[seat].match_state().phase != phase {
            assert!(self.now < deadline, "never reached {:?}", phase);
            self.advance(STEP_MS);
        }
    }

    /// Drop an asteroid onto `victim`'s ship on the authority's world
    pub fn crush(&mut self, authority: usize, victim: &str) {
        let sim = self.seats[authority].simulation_mut();
        let ship = sim
            .capture()
            .ships
            .into_iter()
            .find(|s| s.owner_id.as_deref() == Some(victim))
            .expect("victim has a ship");
        sim.spawn_asteroid(ship.x, ship.y, 0.0, 0.0);
    }

    pub fn take_events(&mut self, seat: usize) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events[seat])
    }
}
