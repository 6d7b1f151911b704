//! Process watcher: wraps a spawned child, exposes a "the child is
//! gone" signal independent of anyone polling its exit status directly,
//! and knows how to ask it to leave gracefully before resorting to a
//! hard kill.

use std::time::Duration;

use thiserror::Error;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("process did not exit within the grace period")]
    GraceTimeout,
}

/// Fired exactly once, when the child process has been reaped.
#[derive(Debug, Clone)]
pub struct Exit {
    pub code: Option<i32>,
}

/// Supervises one child process: reaps it on a background task and
/// republishes its exit through a [`watch`] channel so any number of
/// observers (the supervisor's restart loop, the runtime's own shutdown
/// path) can watch for it without racing over `Child::wait`.
pub struct Watcher {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<Exit>>,
    join: tokio::task::JoinHandle<()>,
}

impl Watcher {
    pub fn spawn(mut child: Child) -> Self {
        let pid = child.id();
        let (tx, rx) = watch::channel(None);
        let join = tokio::spawn(async move {
            let status = child.wait().await;
            let exit = match status {
                Ok(status) => Exit { code: status.code() },
                Err(e) => {
                    log::warn!("watcher: error waiting on child: {e}");
                    Exit { code: None }
                }
            };
            let _ = tx.send(Some(exit));
        });
        Watcher {
            pid,
            exit_rx: rx,
            join,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Resolves once the child has exited; clones cheaply so multiple
    /// callers can each await their own copy.
    pub async fn exited(&self) -> Exit {
        self.exited_owned().await
    }

    /// Same as [`Watcher::exited`] but returned as an owned, `'static`
    /// future so a caller can hand it to a spawned task (e.g. a
    /// `tokio::select!` watchdog) without keeping this `Watcher` borrowed.
    pub fn exited_owned(&self) -> impl std::future::Future<Output = Exit> + Send + 'static {
        let mut rx = self.exit_rx.clone();
        async move {
            loop {
                if let Some(exit) = rx.borrow().clone() {
                    return exit;
                }
                if rx.changed().await.is_err() {
                    return Exit { code: None };
                }
            }
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Ask the process to leave gracefully (`SIGINT` on Unix,
    /// `CTRL_BREAK_EVENT` on Windows), then escalate to a hard kill if it
    /// hasn't exited within `grace`.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), WatcherError> {
        if self.has_exited() {
            return Ok(());
        }
        if let Some(pid) = self.pid {
            interrupt(pid);
        }
        match timeout(grace, self.exited()).await {
            Ok(_) => Ok(()),
            Err(_) => {
                if let Some(pid) = self.pid {
                    force_kill(pid);
                }
                match timeout(grace, self.exited()).await {
                    Ok(_) => Ok(()),
                    Err(_) => Err(WatcherError::GraceTimeout),
                }
            }
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.join.abort();
    }
}

#[cfg(unix)]
fn interrupt(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        log::debug!("watcher: SIGINT to pid {pid} failed: {e}");
    }
}

#[cfg(unix)]
fn force_kill(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        log::debug!("watcher: SIGKILL to pid {pid} failed: {e}");
    }
}

#[cfg(windows)]
fn interrupt(pid: u32) {
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
    if unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) } == 0 {
        log::debug!(
            "watcher: CTRL_BREAK_EVENT to pid {pid} failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(windows)]
fn force_kill(pid: u32) {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if !handle.is_null() {
            TerminateProcess(handle, 1);
            CloseHandle(handle);
        }
    }
}
