//! A single-shot "this runtime is gone" signal, shared by all three
//! [`crate::PluginRuntime`] variants. Deliberately independent of how the
//! underlying transport or process actually ends — a [`Watcher`] exit, a
//! [`secrets_transport::Mux`] going down, or an explicit `close()` call
//! all just call [`ClosedSignal::close`], and whichever gets there first
//! wins; the rest are no-ops.
//!
//! [`Watcher`]: crate::watcher::Watcher

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use tokio::sync::watch;

/// Raised at most once. Cloning is cheap and every clone observes the
/// same terminal state.
#[derive(Clone)]
pub struct ClosedSignal {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
    error: std::sync::Arc<StdMutex<Option<String>>>,
    // Separate from `tx`'s own boolean: a `watch` channel's "has this
    // value been set" is not something `borrow()` can check-and-set
    // atomically, so two concurrent `close()` calls racing on
    // `tx.borrow()` could otherwise both believe they won and latch two
    // different errors. This flag is the single point of arbitration.
    won: std::sync::Arc<AtomicBool>,
}

impl ClosedSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        ClosedSignal {
            tx,
            rx,
            error: std::sync::Arc::new(StdMutex::new(None)),
            won: std::sync::Arc::new(AtomicBool::new(false)),
        }
    }

    /// Raise the signal with the given terminal error, if this is the
    /// first call. Returns `true` iff this call is the one that raised
    /// it (subsequent calls are no-ops and return `false`).
    pub fn close(&self, error: Option<String>) -> bool {
        if self.won.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return false;
        }
        *self.error.lock().unwrap() = error;
        // `send` only errors if every receiver was dropped, which is
        // harmless here: nobody is left to observe the flip anyway.
        let _ = self.tx.send(true);
        true
    }

    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn terminal_error(&self) -> Option<String> {
        self.error.lock().unwrap().clone()
    }

    /// Resolves once [`close`](Self::close) has been called by anyone.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for ClosedSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_resolves_immediately_if_already_closed() {
        let signal = ClosedSignal::new();
        signal.close(Some("boom".to_string()));
        tokio::time::timeout(std::time::Duration::from_millis(100), signal.wait())
            .await
            .expect("already-closed signal must not block waiters");
        assert_eq!(signal.terminal_error(), Some("boom".to_string()));
    }

    #[tokio::test]
    async fn second_close_is_a_no_op() {
        let signal = ClosedSignal::new();
        assert!(signal.close(Some("first".to_string())));
        assert!(!signal.close(Some("second".to_string())));
        assert_eq!(signal.terminal_error(), Some("first".to_string()));
    }

    #[tokio::test]
    async fn many_waiters_all_observe_the_close() {
        let signal = ClosedSignal::new();
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let s = signal.clone();
                tokio::spawn(async move { s.wait().await })
            })
            .collect();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        signal.close(None);
        for w in waiters {
            w.await.unwrap();
        }
    }
}
