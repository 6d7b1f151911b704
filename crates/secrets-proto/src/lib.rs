//! Generated wire messages and ttrpc service stubs for the two protocols
//! that cross a plugin's multiplexed channel — `Registration` (plugin
//! calls engine, once) and `Plugin` (engine calls plugin, repeatedly) —
//! plus the small amount of hand-written glue between them and this
//! workspace's own domain types.

#![allow(clippy::all, clippy::derive_partial_eq_without_eq)]

include!(concat!(env!("OUT_DIR"), "/common.rs"));
include!(concat!(env!("OUT_DIR"), "/registration.rs"));
include!(concat!(env!("OUT_DIR"), "/registration_ttrpc.rs"));
include!(concat!(env!("OUT_DIR"), "/plugin.rs"));
include!(concat!(env!("OUT_DIR"), "/plugin_ttrpc.rs"));

use thiserror::Error;

/// The error taxonomy the resolver and runtime layers deal in, wire-
/// compatible with `ttrpc::Code` so it survives a round trip across a
/// plugin's socket without the caller having to know whether the error
/// originated locally or came back over the multiplexed channel.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("canceled")]
    Canceled,
    #[error("plugin unavailable: {0}")]
    Unavailable(String),
    #[error("{0} already registered")]
    AlreadyExists(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn code(&self) -> ttrpc::Code {
        match self {
            EngineError::NotFound(_) => ttrpc::Code::NOT_FOUND,
            EngineError::InvalidArgument(_) => ttrpc::Code::INVALID_ARGUMENT,
            EngineError::DeadlineExceeded => ttrpc::Code::DEADLINE_EXCEEDED,
            EngineError::Canceled => ttrpc::Code::CANCELLED,
            EngineError::Unavailable(_) => ttrpc::Code::UNAVAILABLE,
            EngineError::AlreadyExists(_) => ttrpc::Code::ALREADY_EXISTS,
            EngineError::Internal(_) => ttrpc::Code::INTERNAL,
        }
    }
}

impl From<EngineError> for ttrpc::Error {
    fn from(e: EngineError) -> Self {
        get_status(e.code(), e.to_string())
    }
}

/// Recover an [`EngineError`] from whatever ttrpc handed back across the
/// wire — a `get_status`-shaped `ttrpc::Error::RpcStatus`, or otherwise a
/// transport-level failure collapsed to `Unavailable`.
impl From<ttrpc::Error> for EngineError {
    fn from(e: ttrpc::Error) -> Self {
        match e {
            ttrpc::Error::RpcStatus(status) => {
                let message = status.message().to_string();
                match status.code() {
                    ttrpc::Code::NOT_FOUND => EngineError::NotFound(message),
                    ttrpc::Code::INVALID_ARGUMENT => EngineError::InvalidArgument(message),
                    ttrpc::Code::DEADLINE_EXCEEDED => EngineError::DeadlineExceeded,
                    ttrpc::Code::CANCELLED => EngineError::Canceled,
                    ttrpc::Code::ALREADY_EXISTS => EngineError::AlreadyExists(message),
                    ttrpc::Code::UNAVAILABLE => EngineError::Unavailable(message),
                    _ => EngineError::Internal(message),
                }
            }
            other => EngineError::Unavailable(other.to_string()),
        }
    }
}

impl From<secrets_id::ParseError> for EngineError {
    fn from(e: secrets_id::ParseError) -> Self {
        EngineError::InvalidArgument(e.to_string())
    }
}

impl Secret {
    /// Build a populated `Secret`. Named apart from the generated bare
    /// `Secret::new()` constructor so it doesn't collide with it.
    pub fn from_parts(name: impl Into<String>, value: Vec<u8>, provider: impl Into<String>) -> Self {
        let mut s = Secret::default();
        s.set_name(name.into());
        s.set_value(value);
        s.set_provider(provider.into());
        s
    }
}

impl PluginMetadata {
    pub fn build(name: impl Into<String>, version: impl Into<String>, pattern: impl Into<String>) -> Self {
        let mut m = PluginMetadata::default();
        m.set_name(name.into());
        m.set_version(version.into());
        m.set_pattern(pattern.into());
        m
    }
}
