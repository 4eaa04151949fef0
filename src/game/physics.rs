//! Ship and pilot movement on a wrap-around arena

/// Movement constants for one kind of body
#[derive(Debug, Clone, Copy)]
pub struct BodyStats {
    /// Maximum speed in px/s
    pub max_speed: f32,
    /// Thrust while the primary button is held, px/s²
    pub acceleration: f32,
    /// Velocity kept per second with no thrust
    pub drag: f32,
    /// Turn rate in radians per second
    pub turn_rate: f32,
    pub hitbox_radius: f32,
}

impl BodyStats {
    pub const SHIP: Self = Self {
        max_speed: 320.0,
        acceleration: 260.0,
        drag: 0.6,
        turn_rate: 3.6,
        hitbox_radius: 16.0,
    };

    pub const PILOT: Self = Self {
        max_speed: 140.0,
        acceleration: 180.0,
        drag: 0.3,
        turn_rate: 5.0,
        hitbox_radius: 7.0,
    };
}

/// Position, heading and velocity of a moving body
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Body {
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub vx: f32,
    pub vy: f32,
}

impl Body {
    pub fn at(x: f32, y: f32, angle: f32) -> Self {
        Self {
            x,
            y,
            angle,
            vx: 0.0,
            vy: 0.0,
        }
    }

    pub fn speed(&self) -> f32 {
        (self.vx * self.vx + self.vy * self.vy).sqrt()
    }

    /// Add an instantaneous push along the current heading
    pub fn impulse(&mut self, magnitude: f32) {
        self.vx += self.angle.cos() * magnitude;
        self.vy += self.angle.sin() * magnitude;
    }
}

/// Size of the play field; bodies leaving one edge re-enter on the other
#[derive(Debug, Clone, Copy)]
pub struct Arena {
    pub width: f32,
    pub height: f32,
}

impl Arena {
    pub fn wrap(&self, body: &mut Body) {
        body.x = body.x.rem_euclid(self.width);
        body.y = body.y.rem_euclid(self.height);
    }
}

pub struct PhysicsSystem;

impl PhysicsSystem {
    /// Advance a controlled body by `dt` seconds. Holding the primary
    /// button turns clockwise and thrusts at the same time.
    pub fn steer(body: &mut Body, thrusting: bool, stats: &BodyStats, dt: f32) {
        if thrusting {
            body.angle = (body.angle + stats.turn_rate * dt).rem_euclid(std::f32::consts::TAU);
            body.vx += body.angle.cos() * stats.acceleration * dt;
            body.vy += body.angle.sin() * stats.acceleration * dt;
        }

        let keep = stats.drag.powf(dt);
        body.vx *= keep;
        body.vy *= keep;

        // Dashes may exceed max speed for a moment; drag brings it back
        let speed = body.speed();
        let limit = stats.max_speed * 2.0;
        if speed > limit {
            let scale = limit / speed;
            body.vx *= scale;
            body.vy *= scale;
        }

        Self::drift(body, dt);
    }

    /// Move by velocity with no control input
    pub fn drift(body: &mut Body, dt: f32) {
        body.x += body.vx * dt;
        body.y += body.vy * dt;
    }

    /// Overlap test between two circles, ignoring wrap-around
    pub fn overlaps(x1: f32, y1: f32, radius1: f32, x2: f32, y2: f32, radius2: f32) -> bool {
        let dx = x2 - x1;
        let dy = y2 - y1;
        let combined = radius1 + radius2;
        dx * dx + dy * dy <= combined * combined
    }

    /// Push two overlapping ships apart along the line between them
    pub fn separate(a: &mut Body, b: &mut Body, radius: f32) {
        let dx = b.x - a.x;
        let dy = b.y - a.y;
        let dist = (dx * dx + dy * dy).sqrt();

        if dist < 0.001 {
            a.x -= radius;
            b.x += radius;
            return;
        }

        let overlap = radius * 2.0 - dist;
        if overlap <= 0.0 {
            return;
        }

        let nx = dx / dist;
        let ny = dy / dist;
        let push = overlap / 2.0 + 0.1;
        a.x -= nx * push;
        a.y -= ny * push;
        b.x += nx * push;
        b.y += ny * push;
    }
}
