//! Combat system - ammo, dashes, projectiles, hit detection

use super::physics::{Body, PhysicsSystem};
use super::PlayerId;

/// Weapon and ability tuning shared by every ship
#[derive(Debug, Clone, Copy)]
pub struct WeaponStats {
    pub max_ammo: u8,
    /// Time to regain one round
    pub reload_ms: u64,
    /// Minimum gap between shots
    pub fire_cooldown_ms: u64,
    pub projectile_speed: f32,
    pub projectile_lifetime_ms: u64,
    pub projectile_radius: f32,
    /// Before this age a projectile can't hit its own shooter
    pub owner_grace_ms: u64,
    pub dash_impulse: f32,
    pub dash_cooldown_ms: u64,
}

impl Default for WeaponStats {
    fn default() -> Self {
        Self {
            max_ammo: 3,
            reload_ms: 900,
            fire_cooldown_ms: 200,
            projectile_speed: 520.0,
            projectile_lifetime_ms: 1400,
            projectile_radius: 4.0,
            owner_grace_ms: 300,
            dash_impulse: 260.0,
            dash_cooldown_ms: 1500,
        }
    }
}

/// Ammo that refills one round at a time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Magazine {
    pub ammo: u8,
    reload_elapsed_ms: u64,
    cooldown_ms: u64,
}

impl Magazine {
    pub fn full(stats: &WeaponStats) -> Self {
        Self::with_ammo(stats.max_ammo)
    }

    pub fn with_ammo(ammo: u8) -> Self {
        Self {
            ammo,
            reload_elapsed_ms: 0,
            cooldown_ms: 0,
        }
    }

    pub fn update(&mut self, dt_ms: u64, stats: &WeaponStats) {
        self.cooldown_ms = self.cooldown_ms.saturating_sub(dt_ms);
        if self.ammo >= stats.max_ammo {
            self.reload_elapsed_ms = 0;
            return;
        }
        self.reload_elapsed_ms += dt_ms;
        while self.reload_elapsed_ms >= stats.reload_ms && self.ammo < stats.max_ammo {
            self.reload_elapsed_ms -= stats.reload_ms;
            self.ammo += 1;
        }
    }

    /// Spend a round if one is available and the cooldown has elapsed
    pub fn try_fire(&mut self, stats: &WeaponStats) -> bool {
        if self.ammo == 0 || self.cooldown_ms > 0 {
            return false;
        }
        self.ammo -= 1;
        self.cooldown_ms = stats.fire_cooldown_ms;
        true
    }
}

/// Cooldown gate for the dash impulse
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DashCharge {
    cooldown_ms: u64,
}

impl DashCharge {
    pub fn is_ready(&self) -> bool {
        self.cooldown_ms == 0
    }

    pub fn update(&mut self, dt_ms: u64) {
        self.cooldown_ms = self.cooldown_ms.saturating_sub(dt_ms);
    }

    pub fn try_use(&mut self, stats: &WeaponStats) -> bool {
        if !self.is_ready() {
            return false;
        }
        self.cooldown_ms = stats.dash_cooldown_ms;
        true
    }
}

/// Active projectile in the arena
#[derive(Debug, Clone)]
pub struct Projectile {
    pub id: String,
    pub owner_id: PlayerId,
    pub body: Body,
    pub radius: f32,
    pub age_ms: u64,
    pub lifetime_ms: u64,
}

impl Projectile {
    /// Spawn at the nose of `shooter`, inheriting its velocity
    pub fn fire(id: String, owner_id: PlayerId, shooter: &Body, muzzle: f32, stats: &WeaponStats) -> Self {
        let (cos, sin) = (shooter.angle.cos(), shooter.angle.sin());
        Self {
            id,
            owner_id,
            body: Body {
                x: shooter.x + cos * muzzle,
                y: shooter.y + sin * muzzle,
                angle: shooter.angle,
                vx: shooter.vx + cos * stats.projectile_speed,
                vy: shooter.vy + sin * stats.projectile_speed,
            },
            radius: stats.projectile_radius,
            age_ms: 0,
            lifetime_ms: stats.projectile_lifetime_ms,
        }
    }

    /// Move the projectile, returns false once expired
    pub fn update(&mut self, dt_ms: u64) -> bool {
        PhysicsSystem::drift(&mut self.body, dt_ms as f32 / 1000.0);
        self.age_ms += dt_ms;
        self.age_ms < self.lifetime_ms
    }

    pub fn check_hit(&self, target: &Body, target_radius: f32) -> bool {
        PhysicsSystem::overlaps(
            self.body.x,
            self.body.y,
            self.radius,
            target.x,
            target.y,
            target_radius,
        )
    }

    /// Whether this projectile may hit something owned by `player`
    pub fn can_hit_owner(&self, player: &str, stats: &WeaponStats) -> bool {
        self.owner_id != player || self.age_ms >= stats.owner_grace_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magazine_empties_and_refills() {
        let stats = WeaponStats::default();
        let mut mag = Magazine::full(&stats);
        for _ in 0..3 {
            assert!(mag.try_fire(&stats));
            mag.update(stats.fire_cooldown_ms, &stats);
        }
        assert!(!mag.try_fire(&stats));
        mag.update(stats.reload_ms, &stats);
        assert!(mag.ammo >= 1);
        assert!(mag.try_fire(&stats));
    }

    #[test]
    fn fire_cooldown_blocks_rapid_shots() {
        let stats = WeaponStats::default();
        let mut mag = Magazine::full(&stats);
        assert!(mag.try_fire(&stats));
        assert!(!mag.try_fire(&stats));
    }

    #[test]
    fn dash_has_cooldown() {
        let stats = WeaponStats::default();
        let mut dash = DashCharge::default();
        assert!(dash.try_use(&stats));
        assert!(!dash.try_use(&stats));
        dash.update(stats.dash_cooldown_ms);
        assert!(dash.is_ready());
    }

    #[test]
    fn projectile_expires() {
        let stats = WeaponStats::default();
        let mut p = Projectile::fire("p1".into(), "a".into(), &Body::at(0.0, 0.0, 0.0), 10.0, &stats);
        assert!(p.update(stats.projectile_lifetime_ms - 1));
        assert!(!p.update(1));
    }

    #[test]
    fn own_projectile_is_harmless_at_first() {
        let stats = WeaponStats::default();
        let mut p = Projectile::fire("p1".into(), "a".into(), &Body::at(0.0, 0.0, 0.0), 10.0, &stats);
        assert!(!p.can_hit_owner("a", &stats));
        assert!(p.can_hit_owner("b", &stats));
        p.update(stats.owner_grace_ms);
        assert!(p.can_hit_owner("a", &stats));
    }
}
