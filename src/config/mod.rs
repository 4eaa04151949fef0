//! Configuration module - environment variable parsing and per-match settings

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS (comma-separated, `*` for any)
    pub client_origin: String,
    /// Settings every room on this server is created with
    pub simulation: SimulationConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let mut simulation = SimulationConfig::default();
        if let Some(v) = parse_var("TICK_RATE_HZ")? {
            simulation.tick_rate_hz = v;
        }
        if let Some(v) = parse_var("ROUNDS_TO_WIN")? {
            simulation.rounds_to_win = v;
        }
        if let Some(v) = parse_var("STALE_INPUT_MS")? {
            simulation.stale_input_ms = v;
        }
        if let Some(v) = parse_var("ROUND_END_DELAY_MS")? {
            simulation.round_end_delay_ms = v;
        }
        simulation.validate()?;

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_else(|_| "*".to_string()),
            simulation,
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(None),
    }
}

/// Settings for a single match. Built once and handed to every component
/// that needs it; nothing reads match settings from global state.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationConfig {
    /// Host simulation ticks per second
    pub tick_rate_hz: u32,
    /// Interval between published state snapshots
    pub snapshot_interval_ms: u64,
    /// Secondary (slow-changing) data rides along every Nth snapshot
    pub secondary_every: u32,
    /// Cadence at which a non-host mirrors its local input to the host
    pub input_send_interval_ms: u64,
    /// Remote input older than this resolves to neutral
    pub stale_input_ms: u64,
    /// Max gap between two rising edges of the primary button for a dash
    pub dash_window_ms: u64,
    /// Countdown start value
    pub countdown_secs: u32,
    /// Time between countdown decrements
    pub countdown_step_ms: u64,
    /// Round-end display window before the next countdown
    pub round_end_delay_ms: u64,
    /// Round wins needed to take the match
    pub rounds_to_win: u32,
    /// Participants needed before the host may start
    pub min_players: usize,
    /// Palette size and room capacity
    pub max_players: usize,
    /// Display correction beyond this distance is treated as a teleport
    pub hard_snap_px: f32,
    /// Ceiling on the age used for extrapolation
    pub extrapolation_cap_ms: u64,
    /// Smoothing factor of the snapshot jitter moving average
    pub jitter_alpha: f32,
    pub arena_width: f32,
    pub arena_height: f32,
    /// Seed for hazards and bot reaction jitter
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 30,
            snapshot_interval_ms: 50,
            secondary_every: 5,
            input_send_interval_ms: 50,
            stale_input_ms: 1000,
            dash_window_ms: 300,
            countdown_secs: 3,
            countdown_step_ms: 1000,
            round_end_delay_ms: 3000,
            rounds_to_win: 3,
            min_players: 2,
            max_players: 8,
            hard_snap_px: 100.0,
            extrapolation_cap_ms: 200,
            jitter_alpha: 0.1,
            arena_width: 1280.0,
            arena_height: 720.0,
            seed: 0x5eed_a7e9a,
        }
    }
}

impl SimulationConfig {
    /// Simulation step length in milliseconds
    pub fn tick_ms(&self) -> u64 {
        (1000 / self.tick_rate_hz.max(1) as u64).max(1)
    }

    /// Reject settings the core cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate_hz == 0 {
            return Err(ConfigError::Invalid("tick_rate_hz"));
        }
        if self.snapshot_interval_ms == 0 {
            return Err(ConfigError::Invalid("snapshot_interval_ms"));
        }
        if self.input_send_interval_ms == 0 {
            return Err(ConfigError::Invalid("input_send_interval_ms"));
        }
        if self.countdown_step_ms == 0 {
            return Err(ConfigError::Invalid("countdown_step_ms"));
        }
        if self.rounds_to_win == 0 {
            return Err(ConfigError::Invalid("rounds_to_win"));
        }
        if self.max_players == 0 || self.min_players > self.max_players {
            return Err(ConfigError::Invalid("max_players"));
        }
        if !(self.jitter_alpha > 0.0 && self.jitter_alpha <= 1.0) {
            return Err(ConfigError::Invalid("jitter_alpha"));
        }
        if self.hard_snap_px <= 0.0 {
            return Err(ConfigError::Invalid("hard_snap_px"));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for setting: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
