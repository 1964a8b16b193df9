//! Admin API
//!
//! Read-only health and pool status endpoints served next to the relay.

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;

pub use server::{ApiServer, AppState};
