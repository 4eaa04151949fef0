//! HTTP surface of the dedicated server

pub mod routes;

pub use routes::{build_router, AppError};
