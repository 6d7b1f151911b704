//! Transport-layer building blocks shared by the engine and every plugin
//! runtime variant: a frame multiplexer ([`mux`]), the HTTP hijack
//! handshake that upgrades an externally-launched plugin's connection
//! into one ([`hijack`]), and the connection-pair primitive an
//! engine-launched plugin inherits instead ([`connpair`]).

pub mod connpair;
pub mod hijack;
pub mod mux;

pub use connpair::{ConnPairError, EnginePairHalf, LaunchConfig, LAUNCH_CONFIG_ENV_VAR};
pub use hijack::{HijackError, HIJACK_PATH};
pub use mux::{Mux, MuxError, MuxStream, Side};
