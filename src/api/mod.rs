//! HTTP API
//!
//! Serves the verified proxy list, the store query endpoint and service status.

pub mod handlers;
pub mod routes;
pub mod server;

pub use server::{ApiServer, AppState};
