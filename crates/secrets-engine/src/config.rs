//! Engine-wide configuration: the thin slice of "what would normally be
//! a config file" that the core itself needs to start and run. Layered
//! file/env configuration is the excluded daemon entry point's job —
//! this is just the bounded set of knobs the core's own constructor
//! takes.

use std::path::PathBuf;
use std::time::Duration;

/// Default locations and deadlines.
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_HIJACK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the local stream socket the engine listens on.
    pub socket_path: PathBuf,
    /// Directory scanned for engine-launched plugin executables. `None`
    /// disables directory-launched plugins entirely.
    pub plugin_dir: Option<PathBuf>,
    /// Whether the `/hijack` path accepts externally-launched plugins.
    pub allow_external_plugins: bool,
    pub registration_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub request_timeout: Duration,
    pub hijack_timeout: Duration,
    pub engine_name: String,
    pub engine_version: String,
}

impl EngineConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        EngineConfig {
            socket_path: socket_path.into(),
            plugin_dir: None,
            allow_external_plugins: false,
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            hijack_timeout: DEFAULT_HIJACK_TIMEOUT,
            engine_name: "secrets-engine".to_string(),
            engine_version: format!("v{}", env!("CARGO_PKG_VERSION")),
        }
    }
}
