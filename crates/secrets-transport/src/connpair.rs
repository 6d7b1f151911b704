//! Cross-platform connection-pair primitive: create a duplex byte-stream
//! that the engine keeps one end of and an engine-launched plugin process
//! inherits the other end of across `exec`.
//!
//! On POSIX this is a `socketpair(2)`; on Windows, since anonymous pipes
//! are one-directional, it is two of them wired back to back. Either way
//! the child's end is described to the plugin process purely through the
//! environment — [`LaunchConfig`] is what gets JSON-encoded into
//! [`LAUNCH_CONFIG_ENV_VAR`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Environment variable an engine-launched plugin reads its connection
/// pair and registration deadline out of.
pub const LAUNCH_CONFIG_ENV_VAR: &str = "DOCKER_SECRETS_ENGINE_PLUGIN_LAUNCH_CFG";

#[derive(Debug, Error)]
pub enum ConnPairError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("launch config env var {0:?} was not set")]
    MissingEnvVar(&'static str),
    #[error("launch config env var was not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("launch config descriptor {0} is zero or a reserved descriptor (<=2)")]
    ReservedHandle(i32),
}

/// The platform-native half of [`LaunchConfig`]: a file descriptor on
/// POSIX, a pair of pipe `HANDLE` values (read, write) on Windows.
#[cfg(unix)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomHandles {
    pub fd: i32,
}

#[cfg(windows)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomHandles {
    pub r: u64,
    pub w: u64,
}

/// What an engine-launched plugin needs to recover its end of the
/// connection pair, know its own assigned name, and know how long it
/// has to register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub name: String,
    /// Registration deadline, in nanoseconds.
    pub timeout: u64,
    pub custom: CustomHandles,
}

impl LaunchConfig {
    pub fn registration_deadline(&self) -> Duration {
        Duration::from_nanos(self.timeout)
    }

    /// Read and parse this process's own launch config, as set by the
    /// engine on the child it spawned.
    pub fn from_env() -> Result<Self, ConnPairError> {
        let raw = std::env::var(LAUNCH_CONFIG_ENV_VAR)
            .map_err(|_| ConnPairError::MissingEnvVar(LAUNCH_CONFIG_ENV_VAR))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn to_env_value(&self) -> Result<String, ConnPairError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One half of a freshly created connection pair, kept on the engine
/// side. The other half has already been prepared for inheritance by the
/// about-to-be-spawned child and is described by `launch`. `child_guard`
/// keeps the child's end of the pair open only until the child process
/// has actually been spawned (which is when the OS duplicates the fd
/// table across `fork`/`exec`) — the caller must drop it right after
/// `Command::spawn()` returns, so the engine closes its own copy of the
/// child's handle and ownership stays unambiguous.
pub struct EnginePairHalf {
    pub stream: PairStream,
    pub launch: LaunchConfig,
    pub child_guard: ChildGuard,
}

#[cfg(unix)]
pub type PairStream = tokio::net::UnixStream;

#[cfg(windows)]
pub type PairStream = windows::PipePairStream;

#[cfg(unix)]
pub type ChildGuard = std::os::fd::OwnedFd;

#[cfg(windows)]
pub type ChildGuard = windows::ChildHandles;

/// Create a new connection pair. `name` is the name the engine has
/// assigned this plugin and `registration_deadline` is carried through
/// in [`LaunchConfig`] purely for the plugin's own use (the engine
/// enforces its own copy of the same deadline independently).
pub fn new_pair(name: &str, registration_deadline: Duration) -> Result<EnginePairHalf, ConnPairError> {
    #[cfg(unix)]
    {
        unix::new_pair(name, registration_deadline)
    }
    #[cfg(windows)]
    {
        windows::new_pair(name, registration_deadline)
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    pub fn new_pair(name: &str, registration_deadline: Duration) -> Result<EnginePairHalf, ConnPairError> {
        let (engine_fd, child_fd) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(|e| ConnPairError::Io(std::io::Error::from_raw_os_error(e as i32)))?;

        set_cloexec(&engine_fd)?;
        // child_fd deliberately keeps CLOEXEC unset so it survives exec();
        // ownership is handed back to the caller as `child_guard`, which
        // must be dropped (closing this copy) right after the child has
        // been spawned.
        let child_raw: RawFd = child_fd.as_raw_fd();

        let std_stream = {
            let fd = engine_fd.as_raw_fd();
            std::mem::forget(engine_fd);
            unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) }
        };
        std_stream.set_nonblocking(true)?;
        let stream = tokio::net::UnixStream::from_std(std_stream)?;

        Ok(EnginePairHalf {
            stream,
            launch: LaunchConfig {
                name: name.to_string(),
                timeout: registration_deadline.as_nanos() as u64,
                custom: CustomHandles { fd: child_raw },
            },
            child_guard: child_fd,
        })
    }

    fn set_cloexec(fd: &OwnedFd) -> Result<(), ConnPairError> {
        use nix::fcntl::{fcntl, FcntlArg, FdFlag};
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|e| ConnPairError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
        Ok(())
    }

    /// Plugin side: recover the inherited fd described by [`LaunchConfig`]
    /// and wrap it as an async stream. Rejects fd 0 and the reserved
    /// standard-stream descriptors (stdin/stdout/stderr, <=2): a plugin
    /// binary that inherited those would otherwise silently multiplex
    /// its own stdio.
    pub fn from_launch_config(cfg: &LaunchConfig) -> Result<tokio::net::UnixStream, ConnPairError> {
        if cfg.custom.fd <= 2 {
            return Err(ConnPairError::ReservedHandle(cfg.custom.fd));
        }
        let fd = cfg.custom.fd as RawFd;
        let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
        std_stream.set_nonblocking(true)?;
        Ok(tokio::net::UnixStream::from_std(std_stream)?)
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use std::io;
    use std::os::windows::io::{FromRawHandle, RawHandle};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use windows_sys::Win32::Foundation::{BOOL, HANDLE, TRUE};
    use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
    use windows_sys::Win32::System::Pipes::CreatePipe;

    /// A duplex stream built from two anonymous, unidirectional pipes.
    /// Windows has no single-handle duplex anonymous pipe, so the pair
    /// is modeled as "read from pipe A, write to pipe B".
    pub struct PipePairStream {
        read: tokio::fs::File,
        write: tokio::fs::File,
    }

    impl AsyncRead for PipePairStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.read).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for PipePairStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.write).poll_write(cx, buf)
        }
        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.write).poll_flush(cx)
        }
        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.write).poll_shutdown(cx)
        }
    }

    /// Owns the engine's copy of the two handles the child inherited.
    /// Dropping it closes both — the caller must drop this right after
    /// `Command::spawn()` returns so the engine does not keep a
    /// duplicate of a handle the child now owns.
    pub struct ChildHandles(HANDLE, HANDLE);

    impl Drop for ChildHandles {
        fn drop(&mut self) {
            use windows_sys::Win32::Foundation::CloseHandle;
            unsafe {
                CloseHandle(self.0);
                CloseHandle(self.1);
            }
        }
    }

    struct RawPipe(HANDLE, HANDLE); // (read_handle, write_handle)

    fn create_anonymous_pipe(inherit: bool) -> io::Result<RawPipe> {
        let mut read_handle: HANDLE = std::ptr::null_mut();
        let mut write_handle: HANDLE = std::ptr::null_mut();
        let mut sa = SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: std::ptr::null_mut(),
            bInheritHandle: if inherit { TRUE } else { 0 as BOOL },
        };
        let ok = unsafe { CreatePipe(&mut read_handle, &mut write_handle, &mut sa, 0) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(RawPipe(read_handle, write_handle))
    }

    /// Engine side: two inheritable anonymous pipes (one per direction),
    /// each duplicated so the engine's own end is non-inheritable while
    /// the child's end stays inheritable.
    pub fn new_pair(name: &str, registration_deadline: Duration) -> Result<EnginePairHalf, ConnPairError> {
        // engine writes -> child reads
        let to_child = create_anonymous_pipe(true)?;
        // child writes -> engine reads
        let to_engine = create_anonymous_pipe(true)?;

        let engine_read = to_engine.0;
        let engine_write = to_child.1;
        let child_read = to_child.0;
        let child_write = to_engine.1;

        clear_inherit(engine_read)?;
        clear_inherit(engine_write)?;

        let stream = PipePairStream {
            read: unsafe { tokio::fs::File::from_raw_handle(engine_read as RawHandle) },
            write: unsafe { tokio::fs::File::from_raw_handle(engine_write as RawHandle) },
        };

        Ok(EnginePairHalf {
            stream,
            launch: LaunchConfig {
                name: name.to_string(),
                timeout: registration_deadline.as_nanos() as u64,
                custom: CustomHandles {
                    r: child_read as u64,
                    w: child_write as u64,
                },
            },
            child_guard: ChildHandles(child_read, child_write),
        })
    }

    fn clear_inherit(handle: HANDLE) -> Result<(), ConnPairError> {
        use windows_sys::Win32::Foundation::{SetHandleInformation, HANDLE_FLAG_INHERIT};
        let ok = unsafe { SetHandleInformation(handle, HANDLE_FLAG_INHERIT, 0) };
        if ok == 0 {
            return Err(ConnPairError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Plugin side: unpack the two inherited handles and rebuild the
    /// duplex stream.
    pub fn from_launch_config(cfg: &LaunchConfig) -> Result<PipePairStream, ConnPairError> {
        let read_handle = cfg.custom.r as HANDLE;
        let write_handle = cfg.custom.w as HANDLE;
        Ok(PipePairStream {
            read: unsafe { tokio::fs::File::from_raw_handle(read_handle as RawHandle) },
            write: unsafe { tokio::fs::File::from_raw_handle(write_handle as RawHandle) },
        })
    }
}

/// Plugin-side entry point: read [`LaunchConfig`] from the environment
/// and rebuild the inherited stream.
pub fn from_env() -> Result<(PairStream, LaunchConfig), ConnPairError> {
    let cfg = LaunchConfig::from_env()?;
    #[cfg(unix)]
    let stream = unix::from_launch_config(&cfg)?;
    #[cfg(windows)]
    let stream = windows::from_launch_config(&cfg)?;
    Ok((stream, cfg))
}
