//! Scripted opponents. A bot sees the same read-only picture of the world a
//! player would and answers with an ordinary [`PlayerInput`].

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::f32::consts::TAU;

use super::input::PlayerInput;
use super::snapshot::EntitySnapshot;

/// Distance under which a hazard ahead triggers evasion
const HAZARD_RANGE: f32 = 120.0;
/// Half-width of the cone considered "ahead"
const HAZARD_CONE: f32 = 0.5;
/// Heading error tolerated when lining up a shot
const AIM_TOLERANCE: f32 = 0.2;
const FIRE_RANGE: f32 = 450.0;
const DASH_RANGE: f32 = 160.0;
/// Chance per decision to hesitate for a tick
const HESITATION: f64 = 0.08;

/// What a bot is allowed to see
#[derive(Debug, Clone, Default)]
pub struct Visibility {
    /// The bot's own ship, or its pilot once ejected
    pub own: Option<EntitySnapshot>,
    pub enemies: Vec<EntitySnapshot>,
    pub hazards: Vec<EntitySnapshot>,
}

/// Read access the input layer needs from the world
pub trait WorldView {
    fn visibility(&self, player: &str) -> Visibility;
}

/// Clockwise heading error in `[0, TAU)` from `from` to `to`
fn heading_error(from: f32, to: f32) -> f32 {
    (to - from).rem_euclid(TAU)
}

fn is_aligned(error: f32, tolerance: f32) -> bool {
    error < tolerance || error > TAU - tolerance
}

pub struct BotBrain {
    rng: ChaCha8Rng,
}

impl BotBrain {
    pub fn new(seed: u64, player: &str) -> Self {
        let salt = player
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100_0000_01b3));
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed ^ salt),
        }
    }

    pub fn decide(&mut self, view: &Visibility, now_ms: u64) -> PlayerInput {
        let mut input = PlayerInput::neutral(now_ms);
        let Some(own) = view.own.as_ref().filter(|e| e.alive) else {
            return input;
        };

        if self.rng.gen_bool(HESITATION) {
            return input;
        }

        let threatened = view.hazards.iter().filter(|h| h.alive).any(|h| {
            let (dx, dy) = (h.x - own.x, h.y - own.y);
            let dist = (dx * dx + dy * dy).sqrt();
            dist < HAZARD_RANGE && is_aligned(heading_error(own.angle, dy.atan2(dx)), HAZARD_CONE)
        });
        if threatened {
            // Turning is the only way to leave the line of a hazard
            input.button_a = true;
            return input;
        }

        let target = view
            .enemies
            .iter()
            .filter(|e| e.alive)
            .map(|e| {
                let (dx, dy) = (e.x - own.x, e.y - own.y);
                (e, dx, dy, (dx * dx + dy * dy).sqrt())
            })
            .min_by(|a, b| a.3.total_cmp(&b.3));

        let Some((_, dx, dy, dist)) = target else {
            return input;
        };

        let error = heading_error(own.angle, dy.atan2(dx));
        if is_aligned(error, AIM_TOLERANCE) && dist < FIRE_RANGE {
            input.button_b = true;
            input.dash_requested = dist < DASH_RANGE && self.rng.gen_bool(0.05);
        } else {
            // Out of line or out of reach: swing around and close in
            input.button_a = true;
        }
        input
    }
}
