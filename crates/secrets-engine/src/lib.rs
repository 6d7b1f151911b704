//! Engine Host wiring: listener, Launch Plan, Supervisor and
//! Resolver Service assembled into one running process.

pub mod config;
pub mod host;
pub mod http;
pub mod plan;

pub use config::EngineConfig;
pub use host::{EngineHost, HostError, HostState};
pub use plan::{BuiltinSpec, LaunchParams};
