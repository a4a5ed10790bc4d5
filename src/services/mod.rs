//! Background services

pub mod check_cycle;
pub mod discovery;

pub use check_cycle::CheckScheduler;
pub use discovery::{CandidateExtractor, DiscoveryService};
