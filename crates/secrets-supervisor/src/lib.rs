//! Supervisor: given a launch plan, runs one retry loop per plugin
//! factory — register, watch until `closed`, back off, try again — and
//! gates the caller's access to a single `stop` handle behind "every
//! factory has been attempted at least once".

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use secrets_registry::Registry;
use secrets_runtime::PluginRuntime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Produces a fresh, connected runtime for one plugin instance. Invoked
/// repeatedly by the retry loop: once per launch attempt.
pub type Factory =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = Result<Arc<dyn PluginRuntime>, String>> + Send>> + Send + Sync>;

pub struct LaunchPlanItem {
    pub name: String,
    pub factory: Factory,
}

impl LaunchPlanItem {
    pub fn new<F, Fut>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn PluginRuntime>, String>> + Send + 'static,
    {
        LaunchPlanItem {
            name: name.into(),
            factory: Box::new(move || Box::pin(factory())),
        }
    }
}

/// Exponential backoff parameters for the retry loop. `max_tries == 0`
/// means unlimited retries (bounded only by `max_elapsed_time`).
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_tries: u32,
    pub max_elapsed_time: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
            max_tries: 0,
            max_elapsed_time: Duration::from_secs(120),
        }
    }
}

/// Owns one retry-loop task per launch-plan entry. Dropping a
/// `Supervisor` without calling [`Supervisor::stop`] leaves the retry
/// loops running detached — always call `stop` on the shutdown path.
pub struct Supervisor {
    cancel: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<Option<String>>>>,
}

impl Supervisor {
    /// Launches every factory in `plan` in parallel and does not return
    /// until each one has been attempted at least once (the startup gate) —
    /// this gives the caller a well-defined point at
    /// which every initial plugin has had its first chance to come up.
    pub async fn start(registry: Registry, plan: Vec<LaunchPlanItem>, policy: RetryPolicy) -> Supervisor {
        let cancel = CancellationToken::new();
        let mut handles = Vec::with_capacity(plan.len());
        let mut first_attempts = Vec::with_capacity(plan.len());

        for item in plan {
            let (tx, rx) = oneshot::channel();
            first_attempts.push(rx);
            let registry = registry.clone();
            let child_cancel = cancel.child_token();
            let handle = tokio::spawn(retry_loop(item, registry, child_cancel, policy, tx));
            handles.push(handle);
        }

        for rx in first_attempts {
            let _ = rx.await;
        }

        Supervisor {
            cancel,
            tasks: tokio::sync::Mutex::new(handles),
        }
    }

    /// Cancels every retry loop and waits for them all to return. Each
    /// loop's own teardown (closing its currently-registered runtime, if
    /// any) happens inside the loop itself, in parallel across plugins —
    /// this is "T(1) not T(N)" shutdown: tearing every plugin down at once
    /// rather than one after another. Any
    /// error from one of those closes is collected and returned so the
    /// caller can join it with its own shutdown errors.
    pub async fn stop(&self) -> Vec<String> {
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        let mut errors = Vec::new();
        for handle in tasks.drain(..) {
            if let Ok(Some(e)) = handle.await {
                errors.push(e);
            }
        }
        errors
    }
}

async fn retry_loop(
    item: LaunchPlanItem,
    registry: Registry,
    cancel: CancellationToken,
    policy: RetryPolicy,
    first_attempt: oneshot::Sender<()>,
) -> Option<String> {
    let mut first_attempt = Some(first_attempt);
    let mut backoff = policy.initial_interval;
    let mut tries: u32 = 0;
    let started_at = tokio::time::Instant::now();
    let mut shutdown_error = None;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        if policy.max_tries != 0 && tries >= policy.max_tries {
            log::warn!("{}: giving up after {tries} attempts", item.name);
            break;
        }
        if started_at.elapsed() >= policy.max_elapsed_time {
            log::warn!("{}: giving up after {:?}", item.name, started_at.elapsed());
            break;
        }
        tries += 1;

        let attempt = (item.factory)().await;
        let mut succeeded = false;
        match attempt {
            Ok(runtime) => match registry.register(runtime.clone()) {
                Ok(remove_handle) => {
                    succeeded = true;
                    backoff = policy.initial_interval;
                    notify_first_attempt(&mut first_attempt);

                    tokio::select! {
                        _ = runtime.closed() => {
                            if let Some(err) = runtime_terminal_error(&runtime).await {
                                log::warn!("{}: runtime closed: {err}", item.name);
                            }
                        }
                        _ = cancel.cancelled() => {
                            if let Err(e) = runtime.close().await {
                                shutdown_error = Some(format!("{}: {e}", item.name));
                            }
                        }
                    }
                    remove_handle.remove();
                }
                Err(e) => {
                    log::warn!("{}: registration rejected: {e}", item.name);
                }
            },
            Err(e) => {
                log::warn!("{}: launch failed: {e}", item.name);
            }
        }
        notify_first_attempt(&mut first_attempt);

        if cancel.is_cancelled() {
            break;
        }
        if succeeded {
            // the plugin ran for a while before closing; restart straight away.
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = cancel.cancelled() => break,
        }
        backoff = std::cmp::min(backoff * 2, policy.max_interval);
    }
    shutdown_error
}

async fn runtime_terminal_error(runtime: &Arc<dyn PluginRuntime>) -> Option<String> {
    // `close` on an already-closed runtime is a no-op that just returns
    // the latched terminal error, if any.
    runtime.close().await.err().map(|e| e.to_string())
}

fn notify_first_attempt(slot: &mut Option<oneshot::Sender<()>>) {
    if let Some(tx) = slot.take() {
        let _ = tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use secrets_id::Identifier;
    use secrets_proto::{EngineError, PluginMetadata, Secret};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingRuntime {
        metadata: PluginMetadata,
        closed: secrets_runtime::ClosedSignal,
    }

    #[async_trait]
    impl PluginRuntime for CountingRuntime {
        fn metadata(&self) -> &PluginMetadata {
            &self.metadata
        }
        async fn get_secrets(&self, _ids: &[Identifier]) -> Result<Vec<Secret>, EngineError> {
            Ok(vec![])
        }
        async fn health(&self) -> Result<(), EngineError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), EngineError> {
            self.closed.close(None);
            Ok(())
        }
        async fn closed(&self) {
            self.closed.wait().await
        }
    }

    #[tokio::test]
    async fn startup_gate_waits_for_every_factory_at_least_once() {
        let registry = Registry::new();
        let attempts = Arc::new(AtomicU32::new(0));

        let plan = vec![
            LaunchPlanItem::new("ok", {
                let attempts = attempts.clone();
                move || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    let closed = secrets_runtime::ClosedSignal::new();
                    let runtime: Arc<dyn PluginRuntime> = Arc::new(CountingRuntime {
                        metadata: PluginMetadata::build("ok", "v1", "**"),
                        closed,
                    });
                    async move { Ok(runtime) }
                }
            }),
            LaunchPlanItem::new("fails", {
                let attempts = attempts.clone();
                move || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async move { Err("boom".to_string()) }
                }
            }),
        ];

        let supervisor = Supervisor::start(registry.clone(), plan, RetryPolicy::default()).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(registry.names(), vec!["ok".to_string()]);
        supervisor.stop().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn stop_cancels_loops_and_closes_registered_runtimes() {
        let registry = Registry::new();
        let closed_signal = secrets_runtime::ClosedSignal::new();
        let closed_signal_for_runtime = closed_signal.clone();

        let plan = vec![LaunchPlanItem::new("long-lived", move || {
            let closed = closed_signal_for_runtime.clone();
            async move {
                let runtime: Arc<dyn PluginRuntime> = Arc::new(CountingRuntime {
                    metadata: PluginMetadata::build("long-lived", "v1", "**"),
                    closed,
                });
                Ok(runtime)
            }
        })];

        let supervisor = Supervisor::start(registry.clone(), plan, RetryPolicy::default()).await;
        assert_eq!(registry.len(), 1);
        supervisor.stop().await;
        assert!(registry.is_empty());
        assert!(closed_signal.is_closed());
    }

    struct SlowCloseRuntime {
        metadata: PluginMetadata,
        closed: secrets_runtime::ClosedSignal,
        close_delay: Duration,
    }

    #[async_trait]
    impl PluginRuntime for SlowCloseRuntime {
        fn metadata(&self) -> &PluginMetadata {
            &self.metadata
        }
        async fn get_secrets(&self, _ids: &[Identifier]) -> Result<Vec<Secret>, EngineError> {
            Ok(vec![])
        }
        async fn health(&self) -> Result<(), EngineError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), EngineError> {
            tokio::time::sleep(self.close_delay).await;
            self.closed.close(None);
            Ok(())
        }
        async fn closed(&self) {
            self.closed.wait().await
        }
    }

    /// Thousands of plugins, each
    /// slow to close, must still come down in about as long as the
    /// slowest one takes, not the sum of all of them — `stop` tears every
    /// plugin's retry loop down concurrently, `await`ing the task handles
    /// in sequence only to collect results.
    #[tokio::test]
    async fn stop_tears_down_many_slow_plugins_concurrently() {
        const COUNT: usize = 10_000;
        let registry = Registry::new();

        let plan: Vec<LaunchPlanItem> = (0..COUNT)
            .map(|i| {
                let name = format!("plugin-{i}");
                LaunchPlanItem::new(name.clone(), move || {
                    let name = name.clone();
                    async move {
                        let runtime: Arc<dyn PluginRuntime> = Arc::new(SlowCloseRuntime {
                            metadata: PluginMetadata::build(name, "v1", "**"),
                            closed: secrets_runtime::ClosedSignal::new(),
                            close_delay: Duration::from_millis(10),
                        });
                        Ok(runtime)
                    }
                })
            })
            .collect();

        let supervisor = Supervisor::start(registry.clone(), plan, RetryPolicy::default()).await;
        assert_eq!(registry.len(), COUNT);

        let started = tokio::time::Instant::now();
        let errors = supervisor.stop().await;
        let elapsed = started.elapsed();

        assert!(errors.is_empty(), "unexpected shutdown errors: {errors:?}");
        assert!(registry.is_empty());
        assert!(elapsed < Duration::from_secs(1), "shutdown took {elapsed:?}, expected well under 1s");
    }
}
