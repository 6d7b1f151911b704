//! HTTP hijack handshake: upgrade one request/response exchange on the
//! engine's listener into a raw duplex stream, which the caller then
//! hands to [`crate::mux::Mux::new`].
//!
//! Everything else the listener serves (health, resolver calls) is
//! answered as an ordinary HTTP response and the connection is dropped
//! back into hyper's keep-alive pool; only a request to [`HIJACK_PATH`]
//! carrying `Connection: Upgrade` / `Upgrade: tcp` ever leaves HTTP
//! behind.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Empty;
use hyper::header::{CONNECTION, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

/// Reserved path on the engine's listener that requests an upgrade.
pub const HIJACK_PATH: &str = "/hijack";
const UPGRADE_PROTOCOL: &str = "tcp";

#[derive(Debug, Error)]
pub enum HijackError {
    #[error("hijack handshake did not complete within the deadline")]
    Timeout,
    #[error("peer response to a hijack request was not a 101 Switching Protocols")]
    NotSwitchingProtocols(StatusCode),
    #[error(transparent)]
    Hyper(#[from] hyper::Error),
    #[error(transparent)]
    Http(#[from] hyper::http::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Does `req` ask to be hijacked?
pub fn is_hijack_request<B>(req: &Request<B>) -> bool {
    fn header_is<B>(req: &Request<B>, name: hyper::header::HeaderName, want: &str) -> bool {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case(want))
            .unwrap_or(false)
    }
    req.uri().path() == HIJACK_PATH
        && header_is(req, CONNECTION, "upgrade")
        && header_is(req, UPGRADE, UPGRADE_PROTOCOL)
}

/// The `101 Switching Protocols` response the server sends for an
/// accepted hijack request. Hyper only detaches the connection's raw
/// I/O object (delivered through [`hyper::upgrade::on`]) once this
/// response has actually been flushed to the peer, so the caller must
/// return it from the request handler before awaiting [`serve_upgrade`].
pub fn switching_protocols_response() -> Result<Response<Empty<Bytes>>, HijackError> {
    Ok(Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, UPGRADE_PROTOCOL)
        .body(Empty::new())?)
}

/// Server side: given the in-flight request that was already answered
/// with [`switching_protocols_response`], waits for hyper to hand back
/// the raw stream and runs `use_stream` with it. The handler that calls
/// this must keep its own future alive for as long as `use_stream`'s
/// future runs — that is what keeps the connection's I/O object from
/// being dropped out from under the upgrade.
pub async fn serve_upgrade<B, F, Fut>(
    mut req: Request<B>,
    deadline: Duration,
    use_stream: F,
) -> Result<(), HijackError>
where
    F: FnOnce(TokioIo<Upgraded>) -> Fut,
    Fut: Future<Output = ()>,
{
    let upgraded = timeout(deadline, hyper::upgrade::on(&mut req))
        .await
        .map_err(|_| HijackError::Timeout)??;
    use_stream(TokioIo::new(upgraded)).await;
    Ok(())
}

/// Client side: perform an HTTP/1.1 handshake on `io`, ask for
/// `HIJACK_PATH`, and return the raw stream once the peer answers with
/// `101 Switching Protocols`. `io` must already be a fresh connection to
/// the engine's listener — nothing else may have been written to it.
pub async fn dial_upgrade<IO>(
    io: IO,
    deadline: Duration,
) -> Result<TokioIo<Upgraded>, HijackError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    timeout(deadline, dial_upgrade_inner(io)).await.map_err(|_| HijackError::Timeout)?
}

async fn dial_upgrade_inner<IO>(io: IO) -> Result<TokioIo<Upgraded>, HijackError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            log::debug!("hijack client connection ended: {e}");
        }
    });

    let req = Request::builder()
        .method("GET")
        .uri(HIJACK_PATH)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, UPGRADE_PROTOCOL)
        .body(Empty::<Bytes>::new())?;

    let mut res = sender.send_request(req).await?;
    if res.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(HijackError::NotSwitchingProtocols(res.status()));
    }
    let upgraded = hyper::upgrade::on(&mut res).await?;
    Ok(TokioIo::new(upgraded))
}
