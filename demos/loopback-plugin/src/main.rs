//! Minimal engine-launched plugin fixture. Registers under the name the
//! engine assigned it at launch (carried in the inherited launch
//! config) and serves exactly one secret, named after itself, with the
//! value `<name>-value`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use secrets_id::Identifier;
use secrets_proto::{
    GetSecretsRequest, GetSecretsResponse, HealthRequest, HealthResponse, PluginMetadata, RegisterRequest,
    RegistrationClient, Secret, ShutdownRequest, ShutdownResponse,
};
use secrets_transport::{connpair, Mux, Side};
use ttrpc::context::Context as TtrpcContext;
use ttrpc::r#async::{transport::Socket, Client, TtrpcContext as ServerContext};

struct LoopbackPlugin {
    name: String,
    value: Vec<u8>,
    shutdown: StdMutex<Option<tokio::sync::oneshot::Sender<()>>>,
    shutdown_requested: AtomicBool,
}

#[async_trait]
impl secrets_proto::Plugin for LoopbackPlugin {
    async fn get_secrets(&self, _ctx: &ServerContext, req: GetSecretsRequest) -> ttrpc::Result<GetSecretsResponse> {
        let mut resp = GetSecretsResponse::default();
        let mut secrets = Vec::new();
        for id in req.ids() {
            if Identifier::new(id.as_str()).is_err() {
                return Err(ttrpc::get_status(ttrpc::Code::INVALID_ARGUMENT, format!("bad id: {id}")));
            }
            secrets.push(Secret::from_parts(id.clone(), self.value.clone(), self.name.clone()));
        }
        resp.set_secrets(secrets);
        Ok(resp)
    }

    async fn shutdown(&self, _ctx: &ServerContext, _req: ShutdownRequest) -> ttrpc::Result<ShutdownResponse> {
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            if let Some(tx) = self.shutdown.lock().unwrap().take() {
                let _ = tx.send(());
            }
        }
        Ok(ShutdownResponse::default())
    }

    async fn health(&self, _ctx: &ServerContext, _req: HealthRequest) -> ttrpc::Result<HealthResponse> {
        let mut resp = HealthResponse::default();
        resp.set_healthy(true);
        Ok(resp)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (stream, cfg) = connpair::from_env().context("reading inherited connection pair")?;
    let name = cfg.name.clone();
    log::info!("{name}: starting up");
    let mut mux = Mux::new(stream, Side::Plugin);

    let registration_stream = mux.open().await.context("opening registration stream")?;
    let registration_client = RegistrationClient::new(Client::new(Socket::new(registration_stream)));

    let mut req = RegisterRequest::default();
    req.set_metadata(PluginMetadata::build(name.clone(), "v1", name.clone()));

    let deadline = cfg.registration_deadline();
    let response = tokio::time::timeout(deadline, registration_client.register(TtrpcContext::default(), &req))
        .await
        .map_err(|_| anyhow!("registration did not complete within the deadline"))?
        .context("registration rejected by engine")?;
    log::info!(
        "{name}: registered with engine {} {}, request timeout {}ms",
        response.engine_name(),
        response.engine_version(),
        response.request_timeout_ms(),
    );

    let call_stream = mux.accept().await.context("accepting engine call stream")?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let service = Arc::new(LoopbackPlugin {
        name: name.clone(),
        value: format!("{name}-value").into_bytes(),
        shutdown: StdMutex::new(Some(shutdown_tx)),
        shutdown_requested: AtomicBool::new(false),
    });
    let server = ttrpc::r#async::Server::new().register_service(secrets_proto::create_plugin(service));
    tokio::spawn(async move {
        if let Err(e) = server.start_connection(Socket::new(call_stream)).await {
            log::warn!("{name}: call connection ended: {e}");
        }
    });

    tokio::select! {
        _ = shutdown_rx => log::info!("shut down on request"),
        _ = mux.closed_signal() => log::info!("shut down: connection closed"),
    }

    let _ = mux.close().await;
    Ok(())
}
