//! Configuration for the Tether sync engine.
//!
//! Provides the tunable constants of the synchronization protocol (chunk size,
//! check intervals, heartbeat timing, drift budget) as a RON-persisted struct
//! with sensible defaults and hot-reload detection.

mod config;
mod error;

pub use config::{Config, DebugConfig, SyncConfig};
pub use error::ConfigError;
