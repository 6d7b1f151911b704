//! End-to-end coverage for the engine's external contract: a client
//! talking HTTP/1.1 over the listener's unix socket, against each of the
//! three plugin flavors the host can serve.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use secrets_engine::host::EngineHost;
use secrets_engine::plan::BuiltinSpec;
use secrets_engine::{http as engine_http, EngineConfig};
use secrets_id::Identifier;
use secrets_proto::{EngineError, PluginMetadata};
use secrets_runtime::Plugin;
use secrets_transport::hijack;
use serde_json::{json, Value};
use tokio::net::UnixStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn init_test_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init();
}

fn test_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::new(dir.join("engine.sock"));
    config.registration_timeout = Duration::from_secs(2);
    config.shutdown_timeout = Duration::from_secs(2);
    config.hijack_timeout = Duration::from_secs(2);
    config
}

async fn send(socket: &Path, req: Request<Full<Bytes>>) -> (StatusCode, Value) {
    let stream = UnixStream::connect(socket).await.expect("connect to engine socket");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .expect("http handshake");
    tokio::spawn(async move {
        let _ = conn.await;
    });
    let resp = sender.send_request(req).await.expect("send request");
    let status = resp.status();
    let body = resp.into_body().collect().await.expect("collect body").to_bytes();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn health(socket: &Path) -> StatusCode {
    let req = Request::builder()
        .method("GET")
        .uri(engine_http::HEALTH_PATH)
        .body(Full::new(Bytes::new()))
        .unwrap();
    send(socket, req).await.0
}

async fn get_secret(socket: &Path, id: &str, provider: Option<&str>) -> (StatusCode, Value) {
    let mut body = json!({ "id": id });
    if let Some(p) = provider {
        body["provider"] = json!(p);
    }
    let req = Request::builder()
        .method("POST")
        .uri(engine_http::SECRETS_PATH)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(serde_json::to_vec(&body).unwrap())))
        .unwrap();
    send(socket, req).await
}

async fn wait_for_registry_names(host: &EngineHost, expected: Vec<&str>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let names = host.registry().names();
        if names == expected {
            return;
        }
        if Instant::now() >= deadline {
            panic!("registry never reached {expected:?}, last saw {names:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn fixture_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_fixture-plugin"))
}

/// Place an executable copy of the fixture plugin binary at
/// `dir/<name>` so directory scanning (and the plugin's own
/// `current_exe`-derived name) picks up `name`.
fn install_fixture(dir: &Path, name: &str) {
    let dest = dir.join(name);
    std::fs::copy(fixture_binary_path(), &dest).expect("copy fixture plugin binary");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

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

fn builtin(name: &str, pattern: &str, known_id: &str, value: &[u8]) -> BuiltinSpec {
    let mut secrets = std::collections::HashMap::new();
    secrets.insert(known_id.to_string(), value.to_vec());
    BuiltinSpec {
        metadata: PluginMetadata::build(name, "v1", pattern),
        plugin: Arc::new(StaticPlugin { secrets }),
        shutdown_timeout: Duration::from_secs(1),
    }
}

#[tokio::test]
async fn scenario_1_builtin_resolve() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let host = EngineHost::start(config, vec![builtin("my-builtin", "*", "my-secret", b"some-value")])
        .await
        .unwrap();

    assert_eq!(health(host.socket_path()).await, StatusCode::OK);

    let (status, body) = get_secret(host.socket_path(), "my-secret", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], json!(b"some-value".to_vec()));
    assert_eq!(body["provider"], "my-builtin");

    let (status, _) = get_secret(host.socket_path(), "nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    host.close().await.unwrap();
}

#[tokio::test]
async fn scenario_2_engine_launched_discovery() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let plugin_dir = dir.path().join("plugins");
    std::fs::create_dir_all(&plugin_dir).unwrap();
    install_fixture(&plugin_dir, "plugin-foo");
    install_fixture(&plugin_dir, "plugin-bar");

    let mut config = test_config(dir.path());
    config.plugin_dir = Some(plugin_dir);
    let host = EngineHost::start(config, Vec::new()).await.unwrap();

    wait_for_registry_names(&host, vec!["plugin-bar", "plugin-foo"], Duration::from_secs(2)).await;

    let (status, body) = get_secret(host.socket_path(), "plugin-foo", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provider"], "plugin-foo");
    assert_eq!(body["value"], json!(b"plugin-foo-value".to_vec()));

    host.close().await.unwrap();
}

#[tokio::test]
async fn scenario_3_externally_launched_attach_disabled_by_default() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let host = EngineHost::start(config, Vec::new()).await.unwrap();

    let req = Request::builder()
        .method("GET")
        .uri(hijack::HIJACK_PATH)
        .header(hyper::header::CONNECTION, "Upgrade")
        .header(hyper::header::UPGRADE, "tcp")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _) = send(host.socket_path(), req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(host.registry().is_empty());

    host.close().await.unwrap();
}

#[tokio::test]
async fn scenario_3_externally_launched_attach_enabled() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.allow_external_plugins = true;
    let host = EngineHost::start(config, Vec::new()).await.unwrap();

    let stream = UnixStream::connect(host.socket_path()).await.unwrap();
    let upgraded = hijack::dial_upgrade(stream, Duration::from_secs(2)).await.unwrap();

    tokio::spawn(async move {
        use secrets_proto::{RegisterRequest, RegistrationClient};
        use secrets_transport::{Mux, Side};
        use ttrpc::context::Context;
        use ttrpc::r#async::{transport::Socket, Client};

        let mut mux = Mux::new(upgraded, Side::Plugin);
        let registration_stream = mux.open().await.unwrap();
        let client = RegistrationClient::new(Client::new(Socket::new(registration_stream)));
        let mut req = RegisterRequest::default();
        req.set_metadata(PluginMetadata::build("outside-plugin", "v1", "outside/*"));
        client.register(Context::default(), &req).await.unwrap();

        // Keep the mux alive for the rest of the test.
        let call_stream = mux.accept().await.unwrap();
        std::mem::forget(call_stream);
        std::future::pending::<()>().await;
    });

    wait_for_registry_names(&host, vec!["outside-plugin"], Duration::from_secs(2)).await;

    host.close().await.unwrap();
}

#[tokio::test]
async fn scenario_4_provider_disambiguation() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let host = EngineHost::start(
        config,
        vec![
            builtin("plugin-foo", "*", "mockSecretID", b"mockSecretValue"),
            builtin("plugin-bar", "*", "mockSecretID", b"mockSecretValue"),
        ],
    )
    .await
    .unwrap();

    let (status, body) = get_secret(host.socket_path(), "mockSecretID", Some("plugin-bar")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provider"], "plugin-bar");

    let (status, _) = get_secret(host.socket_path(), "foo", Some("plugin-bar")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    host.close().await.unwrap();
}

#[tokio::test]
async fn scenario_5_crash_recovery() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let plugin_dir = dir.path().join("plugins");
    std::fs::create_dir_all(&plugin_dir).unwrap();
    install_fixture(&plugin_dir, "crash-bar");

    let mut config = test_config(dir.path());
    config.plugin_dir = Some(plugin_dir);
    let host = EngineHost::start(config, Vec::new()).await.unwrap();

    wait_for_registry_names(&host, vec!["crash-bar"], Duration::from_secs(2)).await;

    let (status, body) = get_secret(host.socket_path(), "crash-bar", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], json!(b"crash-bar-value".to_vec()));

    // The plugin we just called exits shortly afterward; the supervisor
    // notices and relaunches a fresh instance, which serves the same
    // secret again once it has re-registered. The gap in between may
    // answer `NotFound` (no "crash-bar" runtime registered yet).
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let (status, body) = get_secret(host.socket_path(), "crash-bar", None).await;
        if status == StatusCode::OK {
            assert_eq!(body["value"], json!(b"crash-bar-value".to_vec()));
            break;
        }
        if Instant::now() >= deadline {
            panic!("crash-bar never came back after its crash");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    host.close().await.unwrap();
}
