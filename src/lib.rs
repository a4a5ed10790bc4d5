//! Proxylist - self-checking pool of public proxies
//!
//! Collects candidate proxy endpoints, re-checks them on a fixed period and
//! serves the subset that currently works.
//!
//! ## Features
//!
//! - Tiered selection of which proxies to re-check each cycle
//! - HTTP, SOCKS4 and SOCKS5 probing with ping and geo detection
//! - Optional WebSocket tunnel detection through the proxy
//! - Global limit on concurrent probes
//! - Durable reputation counters in PostgreSQL, or an in-memory store
//! - Candidate discovery from public listing pages
//! - HTTP API serving the verified list

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod proxy;
pub mod repository;
pub mod services;
pub mod shutdown;

pub use config::Config;
pub use database::Database;
pub use error::{PoolError, Result};
