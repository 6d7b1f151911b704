//! A general-purpose stream multiplexer: one physical, bidirectional
//! byte-stream carries many independent, framed, flow-controlled logical
//! streams. Both endpoints run a server *and* a client over the same
//! [`Mux`], which is why it exposes both [`Mux::open`] (dial a new
//! logical stream) and [`Mux::accept`] (receive one the peer opened) —
//! unlike a multiplexer built around a fixed number of long-lived
//! sub-streams, this one hands out a fresh stream per logical call, the
//! shape the RPC layer above it needs.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use log::{debug, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

const HEADER_LEN: usize = 9;
const MAX_FRAME_LEN: u32 = 32 * 1024 * 1024;
const STREAM_CHANNEL_CAPACITY: usize = 64;
const ACCEPT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("mux session already shut down")]
    SessionClosed,
    #[error("remote already went away")]
    RemoteGone,
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(u32),
    #[error("unrecognized frame type {0}")]
    UnknownFrameType(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MuxError {
    /// True for conditions that are expected during teardown and must be
    /// coerced to success rather than reported as noise.
    pub fn is_benign_during_shutdown(&self) -> bool {
        matches!(self, MuxError::SessionClosed | MuxError::RemoteGone)
            || matches!(self, MuxError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof
                || e.kind() == std::io::ErrorKind::BrokenPipe
                || e.kind() == std::io::ErrorKind::ConnectionReset)
    }
}

/// Which side of the connection this [`Mux`] represents. Stream ids are
/// partitioned by side so that simultaneous `open()` calls from both
/// ends never collide, independent of which side physically dialed the
/// OS-level connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Host,
    Plugin,
}

impl Side {
    fn first_id(self) -> u32 {
        match self {
            Side::Host => 1,
            Side::Plugin => 2,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameType {
    Open = 1,
    Data = 2,
    Close = 3,
    GoAway = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;
    fn try_from(v: u8) -> Result<Self, MuxError> {
        match v {
            1 => Ok(FrameType::Open),
            2 => Ok(FrameType::Data),
            3 => Ok(FrameType::Close),
            4 => Ok(FrameType::GoAway),
            other => Err(MuxError::UnknownFrameType(other)),
        }
    }
}

struct Frame {
    kind: FrameType,
    stream_id: u32,
    payload: Bytes,
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Frame>, MuxError> {
    let mut header = [0u8; HEADER_LEN];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let kind = FrameType::try_from(header[0])?;
    let stream_id = u32::from_be_bytes(header[1..5].try_into().unwrap());
    let len = u32::from_be_bytes(header[5..9].try_into().unwrap());
    if len > MAX_FRAME_LEN {
        return Err(MuxError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    if len > 0 {
        r.read_exact(&mut payload).await?;
    }
    Ok(Some(Frame {
        kind,
        stream_id,
        payload: Bytes::from(payload),
    }))
}

async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    kind: FrameType,
    stream_id: u32,
    payload: &[u8],
) -> Result<(), MuxError> {
    let mut header = [0u8; HEADER_LEN];
    header[0] = kind as u8;
    header[1..5].copy_from_slice(&stream_id.to_be_bytes());
    header[5..9].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    w.write_all(&header).await?;
    if !payload.is_empty() {
        w.write_all(payload).await?;
    }
    w.flush().await?;
    Ok(())
}

struct Shared {
    writer: AsyncMutex<Pin<Box<dyn AsyncWrite + Send>>>,
    streams: StdMutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    next_id: AtomicU32,
    id_step: u32,
    peer_goaway: AtomicBool,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl Shared {
    fn alloc_id(&self) -> u32 {
        self.next_id.fetch_add(self.id_step, Ordering::SeqCst)
    }

    async fn send_frame(
        &self,
        kind: FrameType,
        stream_id: u32,
        payload: &[u8],
    ) -> Result<(), MuxError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MuxError::SessionClosed);
        }
        let mut w = self.writer.lock().await;
        write_frame(&mut *w, kind, stream_id, payload).await
    }

    fn remove_stream(&self, id: u32) {
        self.streams.lock().unwrap().remove(&id);
    }
}

/// One logical, ordered, reliable byte-stream multiplexed over the
/// physical connection. Implements [`AsyncRead`]/[`AsyncWrite`] so it
/// can be handed directly to an RPC layer such as `ttrpc`'s transport
/// socket, exactly as a plain `UnixStream` would be.
pub struct MuxStream {
    id: u32,
    shared: Arc<Shared>,
    rx: mpsc::Receiver<Bytes>,
    read_buf: Bytes,
    read_eof: bool,
    write_fut: Option<Pin<Box<dyn std::future::Future<Output = std::io::Result<usize>> + Send>>>,
    close_sent: bool,
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.shared.remove_stream(self.id);
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = std::cmp::min(buf.remaining(), this.read_buf.len());
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.read_eof {
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(data)) => {
                    this.read_buf = data;
                    continue;
                }
                Poll::Ready(None) => {
                    this.read_eof = true;
                    continue;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        loop {
            if this.write_fut.is_none() {
                let shared = this.shared.clone();
                let id = this.id;
                let payload = buf.to_vec();
                let len = payload.len();
                this.write_fut = Some(Box::pin(async move {
                    shared
                        .send_frame(FrameType::Data, id, &payload)
                        .await
                        .map(|_| len)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
                }));
            }
            let fut = this.write_fut.as_mut().unwrap();
            match fut.as_mut().poll(cx) {
                Poll::Ready(res) => {
                    this.write_fut = None;
                    return Poll::Ready(res);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.close_sent {
            return Poll::Ready(Ok(()));
        }
        if this.write_fut.is_none() {
            let shared = this.shared.clone();
            let id = this.id;
            this.write_fut = Some(Box::pin(async move {
                shared
                    .send_frame(FrameType::Close, id, &[])
                    .await
                    .map(|_| 0)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            }));
        }
        let fut = this.write_fut.as_mut().unwrap();
        match fut.as_mut().poll(cx) {
            Poll::Ready(res) => {
                this.write_fut = None;
                this.close_sent = true;
                Poll::Ready(res.map(|_| ()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The multiplexer itself: owns the physical connection's write half and
/// the dispatch table that routes inbound frames to the right
/// [`MuxStream`].
pub struct Mux {
    shared: Arc<Shared>,
    accept_rx: mpsc::Receiver<MuxStream>,
    read_task: JoinHandle<Result<(), MuxError>>,
}

impl Mux {
    /// Take ownership of `stream` and start multiplexing it. `side`
    /// determines this endpoint's stream-id partition.
    pub fn new<S>(stream: S, side: Side) -> Mux
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            writer: AsyncMutex::new(Box::pin(write_half)),
            streams: StdMutex::new(HashMap::new()),
            next_id: AtomicU32::new(side.first_id()),
            id_step: 2,
            peer_goaway: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        });

        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_CHANNEL_CAPACITY);
        let loop_shared = shared.clone();
        let read_task = tokio::spawn(async move {
            let result = run_read_loop(&mut read_half, loop_shared.clone(), accept_tx).await;
            loop_shared.closed.store(true, Ordering::SeqCst);
            // Drop every live per-stream sender so outstanding readers observe EOF.
            loop_shared.streams.lock().unwrap().clear();
            loop_shared.closed_notify.notify_waiters();
            result
        });

        Mux {
            shared,
            accept_rx,
            read_task,
        }
    }

    /// Open a new logical stream to the peer. One call corresponds to
    /// one outbound RPC call in the layer above.
    pub async fn open(&self) -> Result<MuxStream, MuxError> {
        if self.shared.peer_goaway.load(Ordering::SeqCst) {
            return Err(MuxError::RemoteGone);
        }
        let id = self.shared.alloc_id();
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        self.shared.streams.lock().unwrap().insert(id, tx);
        if let Err(e) = self.shared.send_frame(FrameType::Open, id, &[]).await {
            self.shared.remove_stream(id);
            return Err(e);
        }
        Ok(MuxStream {
            id,
            shared: self.shared.clone(),
            rx,
            read_buf: Bytes::new(),
            read_eof: false,
            write_fut: None,
            close_sent: false,
        })
    }

    /// Receive the next stream the peer opened.
    pub async fn accept(&mut self) -> Result<MuxStream, MuxError> {
        self.accept_rx.recv().await.ok_or(MuxError::SessionClosed)
    }

    /// Tell the peer to stop sending new `Open` frames while this side
    /// drains. Existing streams are unaffected.
    pub async fn go_away(&self) -> Result<(), MuxError> {
        self.shared.send_frame(FrameType::GoAway, 0, &[]).await
    }

    /// Idempotent: shuts the physical connection down, which surfaces as
    /// a clean end-of-stream (not an error) to the peer's read loop.
    pub async fn close(&self) -> Result<(), MuxError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.read_task.abort();
        let mut w = self.shared.writer.lock().await;
        let _ = w.as_mut().shutdown().await;
        self.shared.streams.lock().unwrap().clear();
        self.shared.closed_notify.notify_waiters();
        Ok(())
    }

    /// A future that resolves when the background read loop exits
    /// (cleanly or with an error) — used to detect "the session is
    /// gone" in a `tokio::select!` alongside other shutdown triggers.
    pub fn monitor_handle(&mut self) -> &mut JoinHandle<Result<(), MuxError>> {
        &mut self.read_task
    }

    /// Resolves once the session has shut down, from either side. Safe
    /// to call from any number of concurrent observers without racing
    /// `close()` or the read loop's own exit: the `Notify` handle is
    /// armed before the closed flag is rechecked, so a close that lands
    /// between the check and the wait is never missed.
    pub async fn closed(&self) {
        self.closed_signal().await
    }

    /// Same as [`Mux::closed`] but returned as an owned, `'static` future
    /// so a caller can hand it to a spawned task without keeping this
    /// `Mux` borrowed for the task's lifetime.
    pub fn closed_signal(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let shared = self.shared.clone();
        async move {
            loop {
                let notified = shared.closed_notify.notified();
                if shared.closed.load(Ordering::SeqCst) {
                    return;
                }
                notified.await;
            }
        }
    }
}

async fn run_read_loop<R: AsyncRead + Unpin>(
    reader: &mut R,
    shared: Arc<Shared>,
    accept_tx: mpsc::Sender<MuxStream>,
) -> Result<(), MuxError> {
    loop {
        let frame = match read_frame(reader).await {
            Ok(Some(f)) => f,
            Ok(None) => return Ok(()),
            Err(e) => return Err(e),
        };
        match frame.kind {
            FrameType::Open => {
                let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
                shared.streams.lock().unwrap().insert(frame.stream_id, tx);
                let stream = MuxStream {
                    id: frame.stream_id,
                    shared: shared.clone(),
                    rx,
                    read_buf: Bytes::new(),
                    read_eof: false,
                    write_fut: None,
                    close_sent: false,
                };
                if accept_tx.send(stream).await.is_err() {
                    debug!("mux: no acceptor for inbound stream {}", frame.stream_id);
                    shared.remove_stream(frame.stream_id);
                }
            }
            FrameType::Data => {
                let sender = shared.streams.lock().unwrap().get(&frame.stream_id).cloned();
                if let Some(tx) = sender {
                    if tx.send(frame.payload).await.is_err() {
                        warn!("mux: stream {} reader gone, dropping data", frame.stream_id);
                    }
                }
            }
            FrameType::Close => {
                shared.remove_stream(frame.stream_id);
            }
            FrameType::GoAway => {
                shared.peer_goaway.store(true, Ordering::SeqCst);
            }
        }
    }
}
