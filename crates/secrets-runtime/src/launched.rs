//! The two [`PluginRuntime`] variants that talk to a plugin over a
//! [`secrets_transport::Mux`]: engine-launched (the engine owns the
//! child process and its connection pair) and externally-launched (the
//! plugin dialed in and was hijacked onto a multiplexed stream). Both
//! share the same wiring once the `Mux` is up — the plugin always opens
//! one stream to drive its single `Registration` call and accepts one
//! stream carrying the engine's calls against its `Plugin` service — so
//! that wiring lives once, in [`LaunchedRuntime::connect`].

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use secrets_id::{Identifier, Pattern};
use secrets_proto::{EngineError, PluginClient, PluginMetadata, RegisterRequest, RegisterResponse, Secret};
use secrets_transport::{connpair, Mux, Side};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use ttrpc::context::Context;
use ttrpc::r#async::{transport::Socket, Client};

use crate::closed::ClosedSignal;
use crate::watcher::Watcher;
use crate::PluginRuntime;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    ConnPair(#[from] secrets_transport::ConnPairError),
    #[error(transparent)]
    Mux(#[from] secrets_transport::MuxError),
    #[error("plugin did not register within the deadline")]
    RegistrationTimeout,
    #[error("registration rejected: {0}")]
    Validation(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Parameters the engine hands a freshly registering plugin, and — for
/// engine-launched plugins — the name it already assigned at launch time
/// that the plugin's proposed name must echo back exactly.
#[derive(Clone)]
pub struct EngineParams {
    pub engine_name: String,
    pub engine_version: String,
    pub request_timeout: Duration,
    pub expected_name: Option<String>,
}

fn validate_registration(metadata: &PluginMetadata, expected_name: Option<&str>) -> Result<(), String> {
    if metadata.name().is_empty() {
        return Err("proposed plugin name must not be empty".to_string());
    }
    if let Some(expected) = expected_name {
        if metadata.name() != expected {
            return Err(format!(
                "engine-launched plugin proposed name {:?} does not match assigned name {:?}",
                metadata.name(),
                expected
            ));
        }
    }
    if !metadata.version().starts_with('v') {
        return Err(format!(
            "version {:?} must be a semantic version with a leading 'v'",
            metadata.version()
        ));
    }
    Pattern::new(metadata.pattern()).map_err(|e| e.to_string())?;
    Ok(())
}

/// The shared, process-agnostic half: a live `Mux` plus the two ttrpc
/// legs built on top of it, and the `closed` signal every variant's
/// `PluginRuntime` impl exposes.
pub struct LaunchedRuntime {
    metadata: PluginMetadata,
    plugin_client: PluginClient,
    mux: Mux,
    closed: ClosedSignal,
    watchdog: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Set before any teardown begins so the watchdog can tell "the child
    /// exited because we asked it to" apart from "the child crashed".
    closing: Arc<AtomicBool>,
    close_once: tokio::sync::Mutex<Option<Result<(), EngineError>>>,
}

impl LaunchedRuntime {
    /// Drive the handshake described above to completion: accept the
    /// plugin's registration call over one stream, open the engine's own
    /// stream for calling back into the plugin's `Plugin` service. On
    /// success, spawns the background task that raises `closed` once the
    /// mux session ends (and, for engine-launched plugins, once the
    /// child exits too — see [`EngineLaunchedRuntime::spawn`]).
    pub async fn connect<S>(
        stream: S,
        side: Side,
        registration_deadline: Duration,
        params: EngineParams,
    ) -> Result<Self, LaunchError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let mut mux = Mux::new(stream, side);

        let registration = timeout(
            registration_deadline,
            Self::accept_registration(&mut mux, params),
        )
        .await
        .map_err(|_| LaunchError::RegistrationTimeout)??;

        let call_stream = mux.open().await?;
        let socket = Socket::new(call_stream);
        let client = Client::new(socket);
        let plugin_client = PluginClient::new(client);

        let closed = ClosedSignal::new();
        Ok(LaunchedRuntime {
            metadata: registration,
            plugin_client,
            mux,
            closed,
            watchdog: tokio::sync::Mutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
            close_once: tokio::sync::Mutex::new(None),
        })
    }

    async fn accept_registration(
        mux: &mut Mux,
        params: EngineParams,
    ) -> Result<PluginMetadata, LaunchError> {
        let stream = mux.accept().await?;
        let socket = Socket::new(stream);

        let (tx, rx) = tokio::sync::oneshot::channel();
        let sink = Arc::new(RegistrationSink {
            already_called: AtomicBool::new(false),
            reply: StdMutex::new(Some(tx)),
            params,
        });
        let server = ttrpc::r#async::Server::new()
            .register_service(secrets_proto::create_registration(sink));
        tokio::spawn(async move {
            let _ = server.start_connection(socket).await;
        });
        match rx.await {
            Ok(Ok(metadata)) => Ok(metadata),
            Ok(Err(message)) => Err(LaunchError::Validation(message)),
            Err(_) => Err(LaunchError::RegistrationTimeout),
        }
    }

    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    /// Starts the background watchdog that raises `closed` once `trigger`
    /// resolves. Called once, right after construction, by each concrete
    /// variant so it can pick its own trigger (mux alone, or mux-or-child).
    async fn arm_watchdog<F>(&self, trigger: F)
    where
        F: std::future::Future<Output = Option<String>> + Send + 'static,
    {
        let closed = self.closed.clone();
        let handle = tokio::spawn(async move {
            let error = trigger.await;
            closed.close(error);
        });
        *self.watchdog.lock().await = Some(handle);
    }

    /// Idempotent, at-most-once teardown. `extra` runs concurrently with
    /// the shared mux/RPC teardown (for [`EngineLaunchedRuntime`] this is
    /// the watcher's graceful-stop-then-kill); its error, if any, is
    /// joined with the mux's. The computed result is cached so every
    /// caller — concurrent or sequential — observes the same value,
    /// satisfying the runtime close contract: an at-most-once operation
    /// with a latched error.
    async fn close_with<F>(&self, extra: F) -> Result<(), EngineError>
    where
        F: std::future::Future<Output = Result<(), EngineError>>,
    {
        let mut guard = self.close_once.lock().await;
        if let Some(cached) = &*guard {
            return cached.clone();
        }
        self.closing.store(true, Ordering::SeqCst);

        let shutdown_result = self
            .plugin_client
            .shutdown(Context::default(), &secrets_proto::ShutdownRequest::default())
            .await;
        if let Err(e) = &shutdown_result {
            log::debug!("shutdown RPC to {} did not complete cleanly: {e}", self.metadata.name());
        }

        let (mux_result, extra_result) = tokio::join!(self.mux.close(), extra);
        let mux_result = match mux_result {
            Ok(()) => Ok(()),
            Err(e) if e.is_benign_during_shutdown() => Ok(()),
            Err(e) => Err(EngineError::Unavailable(e.to_string())),
        };

        let result = match (mux_result, extra_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(a), Err(b)) => Err(EngineError::Internal(format!("{a}; {b}"))),
        };

        self.closed.close(result.as_ref().err().map(|e| e.to_string()));
        self.closed.wait().await;
        *guard = Some(result.clone());
        result
    }
}

/// Receives exactly one `Register` call and hands its validated metadata
/// (or rejection) back through a oneshot; any further call fails with
/// `cannot rerun registration` without disturbing the latched result.
struct RegistrationSink {
    already_called: AtomicBool,
    reply: StdMutex<Option<tokio::sync::oneshot::Sender<Result<PluginMetadata, String>>>>,
    params: EngineParams,
}

#[async_trait]
impl secrets_proto::Registration for RegistrationSink {
    async fn register(
        &self,
        _ctx: &ttrpc::r#async::TtrpcContext,
        req: RegisterRequest,
    ) -> ttrpc::Result<RegisterResponse> {
        if self.already_called.swap(true, Ordering::SeqCst) {
            return Err(ttrpc::get_status(
                ttrpc::Code::FAILED_PRECONDITION,
                "cannot rerun registration".to_string(),
            ));
        }
        let metadata = req.metadata().clone();
        let outcome = validate_registration(&metadata, self.params.expected_name.as_deref());
        let sender = self.reply.lock().unwrap().take();
        match outcome {
            Ok(()) => {
                if let Some(tx) = sender {
                    let _ = tx.send(Ok(metadata));
                }
                let mut resp = RegisterResponse::default();
                resp.set_engine_name(self.params.engine_name.clone());
                resp.set_engine_version(self.params.engine_version.clone());
                resp.set_request_timeout_ms(self.params.request_timeout.as_millis() as i64);
                Ok(resp)
            }
            Err(message) => {
                if let Some(tx) = sender {
                    let _ = tx.send(Err(message.clone()));
                }
                Err(ttrpc::get_status(ttrpc::Code::INVALID_ARGUMENT, message))
            }
        }
    }
}

macro_rules! forward_runtime {
    ($ty:ty, |$self_:ident| $close_extra:expr) => {
        #[async_trait]
        impl PluginRuntime for $ty {
            fn metadata(&self) -> &PluginMetadata {
                self.inner.metadata()
            }

            async fn get_secrets(&self, ids: &[Identifier]) -> Result<Vec<Secret>, EngineError> {
                if self.inner.closed.is_closed() {
                    return Err(EngineError::Unavailable(format!(
                        "plugin {} has been shutdown",
                        self.inner.metadata.name()
                    )));
                }
                let mut req = secrets_proto::GetSecretsRequest::default();
                req.set_ids(ids.iter().map(|id| id.as_str().to_string()).collect());
                let resp = self
                    .inner
                    .plugin_client
                    .get_secrets(Context::default(), &req)
                    .await
                    .map_err(EngineError::from)?;
                Ok(resp.secrets().to_vec())
            }

            async fn health(&self) -> Result<(), EngineError> {
                self.inner
                    .plugin_client
                    .health(Context::default(), &secrets_proto::HealthRequest::default())
                    .await
                    .map_err(EngineError::from)?;
                Ok(())
            }

            async fn close(&self) -> Result<(), EngineError> {
                let $self_ = self;
                self.inner.close_with($close_extra).await
            }

            async fn closed(&self) {
                self.inner.closed.wait().await
            }
        }
    };
}

/// A plugin the engine spawned itself, over an inherited connection
/// pair. Owns the child process via a [`Watcher`].
pub struct EngineLaunchedRuntime {
    inner: LaunchedRuntime,
    watcher: Watcher,
    shutdown_timeout: Duration,
}

impl EngineLaunchedRuntime {
    pub async fn spawn(
        program: &str,
        args: &[String],
        assigned_name: &str,
        registration_deadline: Duration,
        shutdown_timeout: Duration,
        params: EngineParams,
    ) -> Result<Self, LaunchError> {
        let pair = connpair::new_pair(assigned_name, registration_deadline)?;
        let env_value = pair.launch.to_env_value()?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env(connpair::LAUNCH_CONFIG_ENV_VAR, env_value)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // CTRL_BREAK_EVENT targets a process group, so the child must be
        // its own; POSIX's SIGINT needs no such setup.
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }
        let child = command.spawn()?;
        // The child has now inherited its copy of the fd/handles; drop
        // the engine's own copy so ownership of the child's end is
        // unambiguous.
        drop(pair.child_guard);

        let watcher = Watcher::spawn(child);
        let mut params = params;
        params.expected_name = Some(assigned_name.to_string());
        let inner = LaunchedRuntime::connect(pair.stream, Side::Host, registration_deadline, params).await?;

        let watcher_exited = watcher.exited_owned();
        let mux_closed = inner.mux.closed_signal();
        let closing = inner.closing.clone();
        inner
            .arm_watchdog(async move {
                tokio::select! {
                    exit = watcher_exited => {
                        // An exit requested through our own `close()` (sigint
                        // or, failing that, kill) is a clean shutdown even
                        // when the OS reports no exit code for it — the
                        // signal exit status is recognized and discarded
                        // not reported as a crash.
                        if !closing.load(Ordering::SeqCst) && exit.code != Some(0) {
                            Some(format!("plugin crashed: exited with {:?}", exit.code))
                        } else {
                            None
                        }
                    }
                    _ = mux_closed => None,
                }
            })
            .await;

        Ok(EngineLaunchedRuntime { inner, watcher, shutdown_timeout })
    }

    pub fn pid(&self) -> Option<u32> {
        self.watcher.pid()
    }
}

forward_runtime!(EngineLaunchedRuntime, |this| async {
    this.watcher
        .shutdown(this.shutdown_timeout)
        .await
        .map_err(|_| EngineError::DeadlineExceeded)
});

/// A plugin that dialed the engine's listener and was hijacked onto a
/// multiplexed stream. The engine never owns its process.
pub struct ExternallyLaunchedRuntime {
    inner: LaunchedRuntime,
}

impl ExternallyLaunchedRuntime {
    pub async fn from_hijacked<S>(
        stream: S,
        registration_deadline: Duration,
        params: EngineParams,
    ) -> Result<Self, LaunchError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let inner = LaunchedRuntime::connect(stream, Side::Host, registration_deadline, params).await?;
        let mux_closed = inner.mux.closed_signal();
        inner.arm_watchdog(async move {
            mux_closed.await;
            None
        }).await;
        Ok(ExternallyLaunchedRuntime { inner })
    }
}

forward_runtime!(ExternallyLaunchedRuntime, |_this| async { Ok(()) });
