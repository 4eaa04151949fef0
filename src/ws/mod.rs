//! WebSocket endpoint and wire protocol

pub mod handler;
pub mod protocol;
