//! Engine-launched plugin fixture, built only for `secrets-engine`'s own
//! integration tests (see `tests/scenarios.rs`). Registers under the
//! name the engine assigned it at launch (carried in the inherited
//! launch config) and serves one secret named after itself, with value
//! `<name>-value`. A plugin assigned a name starting with `crash-` exits
//! with a non-zero status shortly after answering its first
//! `GetSecrets` call, to drive the supervisor's crash-recovery path
//! without an external `kill` in the test.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
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

fn crash_after(name: &str) -> Option<u32> {
    if name.starts_with("crash-") {
        Some(1)
    } else {
        None
    }
}

struct FixturePlugin {
    name: String,
    value: Vec<u8>,
    shutdown: StdMutex<Option<tokio::sync::oneshot::Sender<()>>>,
    shutdown_requested: AtomicBool,
    served: AtomicU32,
    crash_after: Option<u32>,
}

#[async_trait]
impl secrets_proto::Plugin for FixturePlugin {
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

        let served = self.served.fetch_add(1, Ordering::SeqCst) + 1;
        if self.crash_after == Some(served) {
            // Give the response a moment to actually flush before we pull
            // the rug out from under the connection.
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                std::process::exit(1);
            });
        }
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
    let (stream, cfg) = connpair::from_env().context("reading inherited connection pair")?;
    let name = cfg.name.clone();
    let mut mux = Mux::new(stream, Side::Plugin);

    let registration_stream = mux.open().await.context("opening registration stream")?;
    let registration_client = RegistrationClient::new(Client::new(Socket::new(registration_stream)));

    let mut req = RegisterRequest::default();
    req.set_metadata(PluginMetadata::build(name.clone(), "v1", name.clone()));

    let deadline = cfg.registration_deadline();
    let _response = tokio::time::timeout(deadline, registration_client.register(TtrpcContext::default(), &req))
        .await
        .map_err(|_| anyhow!("registration did not complete within the deadline"))?
        .context("registration rejected by engine")?;

    let call_stream = mux.accept().await.context("accepting engine call stream")?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let service = Arc::new(FixturePlugin {
        name: name.clone(),
        value: format!("{name}-value").into_bytes(),
        shutdown: StdMutex::new(Some(shutdown_tx)),
        shutdown_requested: AtomicBool::new(false),
        served: AtomicU32::new(0),
        crash_after: crash_after(&name),
    });
    let server = ttrpc::r#async::Server::new().register_service(secrets_proto::create_plugin(service));
    tokio::spawn(async move {
        let _ = server.start_connection(Socket::new(call_stream)).await;
    });

    tokio::select! {
        _ = shutdown_rx => {}
        _ = mux.closed_signal() => {}
    }

    let _ = mux.close().await;
    Ok(())
}
