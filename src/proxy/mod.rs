//! Proxy verification
//!
//! This module provides the checking pipeline:
//! - Selection of records to re-check each cycle
//! - HTTP and SOCKS transports through the proxy under test
//! - Request probing and the WebSocket tunnel probe
//! - Per-proxy checks under a global concurrency gate
//! - Writing outcomes back to the store

pub mod aggregator;
pub mod checker;
pub mod gate;
pub mod geo;
pub mod probe;
pub mod selection;
pub mod transport;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testutil;

pub use aggregator::ResultAggregator;
pub use checker::ProxyChecker;
pub use gate::CheckGate;
pub use probe::{HttpProber, ProbeTarget, Prober};
pub use selection::{Selection, SelectionLimits, SelectionPolicy};
pub use transport::ProxyTransport;
pub use tunnel::TunnelProbe;
