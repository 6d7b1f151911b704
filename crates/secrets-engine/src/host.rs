//! Engine Host: owns the listener, the Launch Plan, the
//! Supervisor, and the Resolver Service, and coordinates the
//! four-state lifecycle: Starting -> Serving -> Draining -> Closed.

use std::path::Path;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use secrets_registry::Registry;
use secrets_resolver::ResolverService;
use secrets_supervisor::{LaunchPlanItem, RetryPolicy, Supervisor};
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::http::{handle, HostCtx};
use crate::plan;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to bind listener at {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to prepare socket directory {path}: {source}")]
    SocketDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("RPC server did not drain within the shutdown deadline")]
    DrainTimeout,
    #[error("shutdown encountered errors: {0}")]
    Shutdown(String),
}

/// Lifecycle state a running [`EngineHost`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Starting,
    Serving,
    Draining,
    Closed,
}

struct Running {
    accept_cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    supervisor: Supervisor,
}

/// The listening, serving secrets engine. Construct with [`EngineHost::start`];
/// always call [`EngineHost::close`] once on the way down.
pub struct EngineHost {
    config: Arc<EngineConfig>,
    registry: Registry,
    resolver: ResolverService,
    state: std::sync::Mutex<HostState>,
    running: tokio::sync::Mutex<Option<Running>>,
    closed: OnceCell<Result<(), String>>,
}

impl EngineHost {
    /// Bind the listener, build the Launch Plan from `builtins` plus any
    /// configured plugin directory, start the Supervisor and wait for its
    /// startup gate, then begin serving connections. Returns once every
    /// initial plugin has had at least one launch attempt.
    pub async fn start(config: EngineConfig, builtins: Vec<plan::BuiltinSpec>) -> Result<Self, HostError> {
        let config = Arc::new(config);
        prepare_socket_path(&config.socket_path)?;

        let listener = UnixListener::bind(&config.socket_path).map_err(|e| HostError::Bind {
            path: config.socket_path.display().to_string(),
            source: e,
        })?;

        let registry = Registry::new();
        let resolver = ResolverService::new(registry.clone());

        let launch_params = plan::LaunchParams {
            registration_timeout: config.registration_timeout,
            shutdown_timeout: config.shutdown_timeout,
            engine_name: config.engine_name.clone(),
            engine_version: config.engine_version.clone(),
            request_timeout: config.request_timeout,
        };

        let mut launch_plan: Vec<LaunchPlanItem> = builtins.into_iter().map(plan::builtin_plan_item).collect();
        if let Some(dir) = &config.plugin_dir {
            launch_plan.extend(plan::scan_plugin_directory(dir, &launch_params));
        }

        let supervisor = Supervisor::start(registry.clone(), launch_plan, RetryPolicy::default()).await;

        let accept_cancel = CancellationToken::new();
        let ctx = HostCtx {
            resolver: resolver.clone(),
            registry: registry.clone(),
            config: config.clone(),
        };
        let accept_task = tokio::spawn(accept_loop(listener, ctx, accept_cancel.clone()));

        Ok(EngineHost {
            config,
            registry,
            resolver,
            state: std::sync::Mutex::new(HostState::Serving),
            running: tokio::sync::Mutex::new(Some(Running {
                accept_cancel,
                accept_task,
                supervisor,
            })),
            closed: OnceCell::new(),
        })
    }

    pub fn state(&self) -> HostState {
        *self.state.lock().unwrap()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn resolver(&self) -> &ResolverService {
        &self.resolver
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Idempotent, three-phase shutdown: cancel the Supervisor and join
    /// every plugin-close error it reports, stop accepting new
    /// connections and wait out the in-flight ones under
    /// `shutdown_timeout`, then remove the socket file. Concurrent
    /// callers all observe the same outcome; only the first one drives
    /// it.
    pub async fn close(&self) -> Result<(), HostError> {
        let result = self
            .closed
            .get_or_init(|| async {
                *self.state.lock().unwrap() = HostState::Draining;
                let mut errors = Vec::new();

                let running = self.running.lock().await.take();
                if let Some(running) = running {
                    errors.extend(running.supervisor.stop().await);

                    running.accept_cancel.cancel();
                    let deadline = self.config.shutdown_timeout;
                    match tokio::time::timeout(deadline, running.accept_task).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => errors.push(format!("accept loop panicked: {e}")),
                        Err(_) => errors.push("RPC server did not drain within the shutdown deadline".to_string()),
                    }
                }

                if let Err(e) = std::fs::remove_file(&self.config.socket_path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        errors.push(format!("removing socket file: {e}"));
                    }
                }

                *self.state.lock().unwrap() = HostState::Closed;
                if errors.is_empty() {
                    Ok(())
                } else {
                    Err(errors.join("; "))
                }
            })
            .await;
        result.clone().map_err(HostError::Shutdown)
    }
}

async fn accept_loop(listener: UnixListener, ctx: HostCtx, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("accept failed: {e}");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| handle(req, ctx.clone()));
                    let conn = http1::Builder::new().serve_connection(io, service).with_upgrades();
                    if let Err(e) = conn.await {
                        log::debug!("connection ended: {e}");
                    }
                });
            }
        }
    }
}

fn prepare_socket_path(socket_path: &Path) -> Result<(), HostError> {
    if let Some(parent) = socket_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| HostError::SocketDir {
                path: parent.display().to_string(),
                source: e,
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
            }
        }
    }
    match std::fs::remove_file(socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(HostError::SocketDir {
                path: socket_path.display().to_string(),
                source: e,
            })
        }
    }
    Ok(())
}
