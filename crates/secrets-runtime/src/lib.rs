//! Plugin runtime variants and the process watcher that backs the
//! two variants that own a child process.
//!
//! A [`PluginRuntime`] is the registry's and resolver's only view onto a
//! plugin, whichever of the three ways it came to be connected: compiled
//! straight into the engine ([`BuiltinRuntime`]), launched by the engine
//! over an inherited connection pair, or dialed in externally and
//! hijacked onto a multiplexed stream. The latter two share their wiring
//! in [`launched`].

pub mod closed;
pub mod launched;
pub mod watcher;

pub use closed::ClosedSignal;
pub use launched::{EngineLaunchedRuntime, ExternallyLaunchedRuntime, LaunchError};
pub use watcher::{Exit, Watcher, WatcherError};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use secrets_id::Identifier;
use secrets_proto::{EngineError, PluginMetadata, Secret};
use tokio_util::sync::CancellationToken;

/// Everything the registry and resolver need from a connected plugin,
/// regardless of how it is actually wired up underneath.
#[async_trait]
pub trait PluginRuntime: Send + Sync {
    fn metadata(&self) -> &PluginMetadata;

    async fn get_secrets(&self, ids: &[Identifier]) -> Result<Vec<Secret>, EngineError>;

    async fn health(&self) -> Result<(), EngineError>;

    /// Idempotent. Returns the same terminal error to every caller,
    /// computed once by whichever call actually performs the teardown.
    async fn close(&self) -> Result<(), EngineError>;

    /// Resolves once this runtime has transitioned to `Closed`, however
    /// that happened (explicit `close()`, a crashed child, a peer that
    /// hung up first).
    async fn closed(&self);
}

/// The business-logic half of a builtin plugin: a long-running `run`
/// loop (the "goroutine-equivalent task") plus a
/// synchronous resolve call the engine invokes per identifier. Kept
/// deliberately minimal — concrete credential-store logic is an external
/// collaborator this crate never implements.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Runs until `cancel` fires. Returning `Ok(())` before `cancel` is
    /// observed is reported to the engine as "stopped unexpectedly".
    async fn run(&self, cancel: CancellationToken) -> Result<(), String>;

    async fn get_secret(&self, id: &Identifier) -> Result<Vec<u8>, EngineError>;
}

/// A provider compiled directly into the engine binary: no process, no
/// transport. A background task drives [`Plugin::run`]; `get_secrets`
/// calls straight into [`Plugin::get_secret`], trapping panics from
/// either path the same way a crashed subprocess would be.
pub struct BuiltinRuntime {
    metadata: PluginMetadata,
    plugin: Arc<dyn Plugin>,
    cancel: CancellationToken,
    shutdown_timeout: Duration,
    closed: ClosedSignal,
    run_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BuiltinRuntime {
    pub fn new(metadata: PluginMetadata, plugin: Arc<dyn Plugin>, shutdown_timeout: Duration) -> Self {
        let cancel = CancellationToken::new();
        let closed = ClosedSignal::new();

        let task_plugin = plugin.clone();
        let task_cancel = cancel.clone();
        let task_closed = closed.clone();
        let name = metadata.name().to_string();
        let run_task = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(task_plugin.run(task_cancel.clone()))
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => {
                    if task_cancel.is_cancelled() {
                        None
                    } else {
                        Some(format!("plugin {name} stopped unexpectedly"))
                    }
                }
                Ok(Err(e)) => Some(format!("plugin {name} failed: {e}")),
                Err(panic) => Some(format!("plugin {name} panicked: {}", panic_message(&panic))),
            };
            task_closed.close(error);
        });

        BuiltinRuntime {
            metadata,
            plugin,
            cancel,
            shutdown_timeout,
            closed,
            run_task: tokio::sync::Mutex::new(Some(run_task)),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[async_trait]
impl PluginRuntime for BuiltinRuntime {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    async fn get_secrets(&self, ids: &[Identifier]) -> Result<Vec<Secret>, EngineError> {
        if self.closed.is_closed() {
            return Err(match self.closed.terminal_error() {
                Some(e) => EngineError::Unavailable(e),
                None => EngineError::Unavailable(format!(
                    "plugin {} has been shutdown",
                    self.metadata.name()
                )),
            });
        }
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let result = AssertUnwindSafe(self.plugin.get_secret(id)).catch_unwind().await;
            match result {
                Ok(Ok(value)) => {
                    out.push(Secret::from_parts(id.as_str(), value, self.metadata.name()))
                }
                Ok(Err(e)) => return Err(e),
                Err(panic) => {
                    return Err(EngineError::Internal(format!(
                        "plugin {} panicked resolving {}: {}",
                        self.metadata.name(),
                        id,
                        panic_message(&panic)
                    )))
                }
            }
        }
        Ok(out)
    }

    async fn health(&self) -> Result<(), EngineError> {
        if self.closed.is_closed() {
            return Err(EngineError::Unavailable(format!(
                "plugin {} has been shutdown",
                self.metadata.name()
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        let mut guard = self.run_task.lock().await;
        if let Some(task) = guard.take() {
            self.cancel.cancel();
            match tokio::time::timeout(self.shutdown_timeout, task).await {
                Ok(_) => {}
                Err(_) => {
                    self.closed
                        .close(Some(format!("plugin {} shutdown timed out", self.metadata.name())));
                }
            }
        }
        self.closed.wait().await;
        match self.closed.terminal_error() {
            Some(e) => Err(EngineError::Internal(e)),
            None => Ok(()),
        }
    }

    async fn closed(&self) {
        self.closed.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticPlugin {
        secrets: std::collections::HashMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl Plugin for StaticPlugin {
        async fn run(&self, cancel: CancellationToken) -> Result<(), String> {
            cancel.cancelled().await;
            Ok(())
        }

        async fn get_secret(&self, id: &Identifier) -> Result<Vec<u8>, EngineError> {
            self.secrets
                .get(id.as_str())
                .cloned()
                .ok_or_else(|| EngineError::NotFound(id.as_str().to_string()))
        }
    }

    fn metadata(name: &str, pattern: &str) -> PluginMetadata {
        PluginMetadata::build(name, "v1", pattern)
    }

    #[tokio::test]
    async fn builtin_runtime_resolves_known_identifiers() {
        let mut secrets = std::collections::HashMap::new();
        secrets.insert("env/HOME".to_string(), b"/root".to_vec());
        let plugin = Arc::new(StaticPlugin { secrets });
        let rt = BuiltinRuntime::new(metadata("env", "env/**"), plugin, Duration::from_secs(1));

        let id = Identifier::new("env/HOME").unwrap();
        let secrets = rt.get_secrets(std::slice::from_ref(&id)).await.unwrap();
        assert_eq!(secrets[0].value(), b"/root");
        assert_eq!(secrets[0].provider(), "env");
    }

    #[tokio::test]
    async fn builtin_runtime_reports_not_found() {
        let plugin = Arc::new(StaticPlugin {
            secrets: Default::default(),
        });
        let rt = BuiltinRuntime::new(metadata("env", "env/**"), plugin, Duration::from_secs(1));
        let id = Identifier::new("env/MISSING").unwrap();
        let err = rt.get_secrets(std::slice::from_ref(&id)).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_raises_closed() {
        let plugin = Arc::new(StaticPlugin {
            secrets: Default::default(),
        });
        let rt = BuiltinRuntime::new(metadata("env", "env/**"), plugin, Duration::from_secs(1));
        rt.close().await.unwrap();
        rt.close().await.unwrap();
        tokio::time::timeout(Duration::from_millis(100), rt.closed())
            .await
            .expect("closed() must resolve after close()");
    }

    #[tokio::test]
    async fn get_secrets_after_close_reports_shutdown() {
        let plugin = Arc::new(StaticPlugin {
            secrets: Default::default(),
        });
        let rt = BuiltinRuntime::new(metadata("env", "env/**"), plugin, Duration::from_secs(1));
        rt.close().await.unwrap();
        let id = Identifier::new("env/HOME").unwrap();
        let err = rt.get_secrets(std::slice::from_ref(&id)).await.unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }

    struct PanickyPlugin;

    #[async_trait]
    impl Plugin for PanickyPlugin {
        async fn run(&self, cancel: CancellationToken) -> Result<(), String> {
            cancel.cancelled().await;
            Ok(())
        }

        async fn get_secret(&self, _id: &Identifier) -> Result<Vec<u8>, EngineError> {
            panic!("plugin bug");
        }
    }

    #[tokio::test]
    async fn panics_in_get_secret_are_converted_to_internal_errors() {
        let rt = BuiltinRuntime::new(metadata("flaky", "**"), Arc::new(PanickyPlugin), Duration::from_secs(1));
        let id = Identifier::new("a").unwrap();
        let err = rt.get_secrets(std::slice::from_ref(&id)).await.unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }
}
