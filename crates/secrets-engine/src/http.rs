//! The engine's local RPC surface: `/health`, the Resolver
//! Service, and — when enabled — the `/hijack` acceptor for
//! externally-launched plugins. Everything but `/hijack` is answered as
//! an ordinary HTTP/1.1 request/response; `/hijack` detaches onto
//! [`secrets_transport::hijack`].

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use secrets_id::Identifier;
use secrets_proto::{EngineError, Secret};
use secrets_registry::Registry;
use secrets_resolver::{self as resolver, ResolverService};
use secrets_runtime::launched::EngineParams;
use secrets_runtime::{ExternallyLaunchedRuntime, PluginRuntime};
use secrets_transport::hijack;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;

pub const SECRETS_PATH: &str = "/v1/secrets";
pub const HEALTH_PATH: &str = "/health";

/// Everything a request handler needs, shared cheaply across connections.
#[derive(Clone)]
pub struct HostCtx {
    pub resolver: ResolverService,
    pub registry: Registry,
    pub config: Arc<EngineConfig>,
}

type RespBody = BoxBody<Bytes, Infallible>;

fn boxed<B>(body: B) -> RespBody
where
    B: http_body_util::BodyExt<Data = Bytes, Error = Infallible> + Send + Sync + 'static,
{
    body.boxed()
}

fn plain(status: StatusCode, body: impl Into<Bytes>) -> Response<RespBody> {
    Response::builder()
        .status(status)
        .body(boxed(Full::new(body.into())))
        .expect("fixed response is always well-formed")
}

fn json(status: StatusCode, value: &impl Serialize) -> Response<RespBody> {
    match serde_json::to_vec(value) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(boxed(Full::new(Bytes::from(bytes))))
            .expect("fixed response is always well-formed"),
        Err(e) => plain(StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")),
    }
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        EngineError::AlreadyExists(_) => StatusCode::CONFLICT,
        EngineError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        EngineError::Canceled => StatusCode::REQUEST_TIMEOUT,
        EngineError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Deserialize)]
struct GetSecretBody {
    id: String,
    #[serde(default)]
    provider: Option<String>,
}

#[derive(Debug, Serialize)]
struct SecretDto {
    name: String,
    value: Vec<u8>,
    provider: String,
    version: String,
    created_at_unix_ms: i64,
    resolved_at_unix_ms: i64,
    expires_at_unix_ms: i64,
}

impl From<&Secret> for SecretDto {
    fn from(s: &Secret) -> Self {
        SecretDto {
            name: s.name().to_string(),
            value: s.value().to_vec(),
            provider: s.provider().to_string(),
            version: s.version().to_string(),
            created_at_unix_ms: s.created_at_unix_ms(),
            resolved_at_unix_ms: s.resolved_at_unix_ms(),
            expires_at_unix_ms: s.expires_at_unix_ms(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorDto {
    error: String,
}

async fn handle_secrets(req: Request<Incoming>, ctx: &HostCtx) -> Response<RespBody> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return plain(StatusCode::BAD_REQUEST, format!("could not read request body: {e}")),
    };
    let parsed: GetSecretBody = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => return json(StatusCode::BAD_REQUEST, &ErrorDto { error: format!("malformed request body: {e}") }),
    };
    let id = match Identifier::new(parsed.id) {
        Ok(id) => id,
        Err(e) => {
            let err = EngineError::from(e);
            return json(status_for(&err), &ErrorDto { error: err.to_string() });
        }
    };
    let request = match parsed.provider {
        Some(provider) => resolver::Request::for_provider(id, provider),
        None => resolver::Request::new(id),
    };
    match ctx.resolver.get_secret(request).await {
        Ok(secret) => json(StatusCode::OK, &SecretDto::from(&secret)),
        Err(e) => json(status_for(&e), &ErrorDto { error: e.to_string() }),
    }
}

async fn accept_external_plugin(io: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static, ctx: HostCtx) {
    let params = EngineParams {
        engine_name: ctx.config.engine_name.clone(),
        engine_version: ctx.config.engine_version.clone(),
        request_timeout: ctx.config.request_timeout,
        expected_name: None,
    };
    let runtime = match ExternallyLaunchedRuntime::from_hijacked(io, ctx.config.registration_timeout, params).await {
        Ok(runtime) => runtime,
        Err(e) => {
            log::warn!("externally-launched plugin failed to register: {e}");
            return;
        }
    };
    let name = runtime.metadata().name().to_string();
    let runtime: Arc<dyn PluginRuntime> = Arc::new(runtime);
    match ctx.registry.register(runtime.clone()) {
        Ok(handle) => {
            log::info!("externally-launched plugin {name} registered");
            // No supervisor retry loop watches this runtime (there is no
            // process to relaunch): just drop it from the registry once
            // it closes, same as the supervisor does for its own plugins.
            tokio::spawn(async move {
                runtime.closed().await;
                handle.remove();
                log::info!("externally-launched plugin {name} removed after close");
            });
        }
        Err(e) => {
            log::warn!("externally-launched plugin {name} rejected: {e}");
            let _ = runtime.close().await;
        }
    }
}

pub async fn handle(req: Request<Incoming>, ctx: HostCtx) -> Result<Response<RespBody>, Infallible> {
    if hijack::is_hijack_request(&req) {
        if !ctx.config.allow_external_plugins {
            return Ok(plain(StatusCode::NOT_FOUND, "external plugin rejected"));
        }
        let switching = match hijack::switching_protocols_response() {
            Ok(resp) => resp,
            Err(e) => return Ok(plain(StatusCode::INTERNAL_SERVER_ERROR, format!("hijack setup failed: {e}"))),
        };
        let deadline = ctx.config.hijack_timeout;
        tokio::spawn(async move {
            let result = hijack::serve_upgrade(req, deadline, |io| accept_external_plugin(io, ctx)).await;
            if let Err(e) = result {
                log::warn!("hijack handshake failed: {e}");
            }
        });
        return Ok(switching.map(boxed));
    }

    if req.uri().path() == HEALTH_PATH {
        return Ok(plain(StatusCode::OK, "ok"));
    }
    if req.uri().path() == SECRETS_PATH {
        return Ok(handle_secrets(req, &ctx).await);
    }
    Ok(plain(StatusCode::NOT_FOUND, "not found"))
}
