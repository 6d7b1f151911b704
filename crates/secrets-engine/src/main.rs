use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info};
use secrets_engine::host::EngineHost;
use secrets_engine::{plan::BuiltinSpec, EngineConfig};
use tokio::signal::unix::{signal, SignalKind};

fn parse_duration(raw: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(raw)
}

/// Local secrets resolver engine.
#[derive(Debug, Parser)]
struct Command {
    /// Path of the local stream socket to listen on.
    #[arg(short, long, default_value = "/run/secrets-engine/engine.sock")]
    socket: PathBuf,

    /// Directory scanned for engine-launched plugin executables.
    #[arg(long)]
    plugin_dir: Option<PathBuf>,

    /// Accept externally-launched plugins over the `/hijack` path.
    #[arg(long)]
    allow_external_plugins: bool,

    /// Deadline for a plugin to complete registration after launch.
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    registration_timeout: Duration,

    /// Deadline for the RPC server to drain in-flight requests on shutdown.
    #[arg(long, default_value = "2s", value_parser = parse_duration)]
    shutdown_timeout: Duration,

    /// Deadline applied to each forwarded plugin RPC.
    #[arg(long, default_value = "2s", value_parser = parse_duration)]
    request_timeout: Duration,

    /// Deadline for an externally-launched plugin's hijack handshake.
    #[arg(long, default_value = "2s", value_parser = parse_duration)]
    hijack_timeout: Duration,
}

fn builtin_plugins() -> Vec<BuiltinSpec> {
    // No providers are compiled in by default; operators wire builtins in
    // by constructing `BuiltinSpec` values here, or rely entirely on
    // engine-launched / externally-launched plugins.
    Vec::new()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Command::parse();
    debug!("starting secrets-engine with options: {:?}", opts);

    let mut config = EngineConfig::new(opts.socket.clone());
    config.plugin_dir = opts.plugin_dir.clone();
    config.allow_external_plugins = opts.allow_external_plugins;
    config.registration_timeout = opts.registration_timeout;
    config.shutdown_timeout = opts.shutdown_timeout;
    config.request_timeout = opts.request_timeout;
    config.hijack_timeout = opts.hijack_timeout;

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

    let host = runtime
        .block_on(EngineHost::start(config, builtin_plugins()))
        .context("failed to start secrets engine")?;
    let host = Arc::new(host);

    info!("listening on {}", host.socket_path().display());

    runtime.block_on(async {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => debug!("received SIGTERM"),
            _ = sigint.recv() => debug!("received SIGINT"),
        }

        debug!("shutting down...");
        if let Err(e) = host.close().await {
            error!("shutdown did not complete cleanly: {e}");
        }
        Ok::<(), std::io::Error>(())
    })?;

    info!("shutdown complete");
    Ok(())
}
