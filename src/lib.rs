//! Arena netcore: host-authoritative simulation, match flow and snapshot
//! sync for a small multiplayer arena game, plus the dedicated server that
//! hosts rooms over WebSocket.

pub mod app;
pub mod config;
pub mod game;
pub mod http;
pub mod transport;
pub mod util;
pub mod ws;
