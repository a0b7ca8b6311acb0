//! Schema module - configuration types for swarm and distributed runs.

mod config;

pub use config::*;
