//! Integration tests for proxyfleet
//!
//! Runs real listeners against real backends:
//! - HTTP and HTTPS forwarding through created proxies
//! - restart reconciliation from the config file and the asset database
//! - bind failures on externally held ports
//! - the management API over the wire

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use proxyfleet::{
    AssetDirectory, AssetRecord, CertificateManager, ConfigStore, DisabledDirectory, FleetSettings,
    HttpAssetDirectory, ManagementServer, ProxyEntry, ProxyOrchestrator, ReconciliationSource,
    Transport,
};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::time::sleep;
use wiremock::matchers::{body_string_contains, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

// Counter for unique port blocks
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19000);

/// Base of `len` consecutive ports that are currently bindable.
fn get_port_block(len: u16) -> u16 {
    loop {
        let base = PORT_COUNTER.fetch_add(len, Ordering::SeqCst);
        if (0..len).all(|i| std::net::TcpListener::bind(("127.0.0.1", base + i)).is_ok()) {
            return base;
        }
    }
}

/// Simple backend server for testing
async fn run_backend_server(port: u16, response_body: &'static str) -> tokio::task::JoinHandle<()> {
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);
            let body = response_body;

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| async move {
                    let path_and_query = req
                        .uri()
                        .path_and_query()
                        .map(|pq| pq.as_str().to_string())
                        .unwrap_or_default();
                    let response_text = format!("{}|{}|{}", body, req.method(), path_and_query);

                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(200)
                            .header("x-backend", body)
                            .body(Full::new(Bytes::from(response_text)))
                            .unwrap(),
                    )
                });

                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    })
}

fn settings(management_port: u16) -> FleetSettings {
    FleetSettings {
        management_port,
        usable_port_start: management_port,
        listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        ..FleetSettings::default()
    }
}

fn setup_orchestrator(
    management_port: u16,
    config_path: &Path,
    directory: Arc<dyn AssetDirectory>,
    transport: Arc<Transport>,
) -> Arc<ProxyOrchestrator> {
    let store = ConfigStore::new(config_path, management_port);
    let orchestrator =
        ProxyOrchestrator::new(settings(management_port), store, directory, transport).unwrap();
    Arc::new(orchestrator)
}

fn http_transport() -> Arc<Transport> {
    Arc::new(Transport::new(None).unwrap())
}

fn record(url: &str, code: u16) -> AssetRecord {
    AssetRecord::from_value(&json!({
        "url": url,
        "deviceName": format!("device-{}", code),
        "deviceCode": code,
    }))
}

#[tokio::test]
async fn test_proxy_forwards_to_backend() {
    let dir = tempdir().unwrap();
    let base = get_port_block(4);
    let backend_port = base + 3;
    let _backend = run_backend_server(backend_port, "backend-a").await;

    let orch = setup_orchestrator(
        base,
        &dir.path().join("proxy_config.json"),
        Arc::new(DisabledDirectory),
        http_transport(),
    );

    let created = orch
        .create_one(&record(&format!("http://127.0.0.1:{}", backend_port), 1))
        .await
        .unwrap();
    assert!(created.value.result, "{}", created.value.message);

    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/login/index.html?lang=en", base + 1))
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert_eq!(response.headers()["x-backend"], "backend-a");
    assert_eq!(response.text().await.unwrap(), "backend-a|GET|/login/index.html?lang=en");

    orch.shutdown().await;
}

#[tokio::test]
async fn test_proxy_terminates_tls() {
    let dir = tempdir().unwrap();
    let base = get_port_block(4);
    let backend_port = base + 3;
    let _backend = run_backend_server(backend_port, "backend-tls").await;

    let cert_manager = CertificateManager::new(dir.path().join("certs")).unwrap();
    let transport = Arc::new(Transport::new(Some(cert_manager.acceptor().unwrap())).unwrap());
    let orch = setup_orchestrator(
        base,
        &dir.path().join("proxy_config.json"),
        Arc::new(DisabledDirectory),
        transport,
    );

    let created = orch
        .create_one(&record(&format!("http://127.0.0.1:{}", backend_port), 2))
        .await
        .unwrap();
    assert!(created.value.result, "{}", created.value.message);

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();
    let response = client
        .post(format!("https://127.0.0.1:{}/api", base + 2))
        .body("payload")
        .send()
        .await
        .unwrap();

    assert_eq!(response.text().await.unwrap(), "backend-tls|POST|/api");
    orch.shutdown().await;
}

#[tokio::test]
async fn test_restart_replays_config_file() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("proxy_config.json");
    let base = get_port_block(6);
    let backend_port = base + 5;
    let _backend = run_backend_server(backend_port, "backend-r").await;
    let backend_url = format!("http://127.0.0.1:{}", backend_port);

    {
        let first =
            setup_orchestrator(base, &config_path, Arc::new(DisabledDirectory), http_transport());
        first.create_one(&record(&backend_url, 1)).await.unwrap();
        first.create_one(&record(&backend_url, 2)).await.unwrap();
        first.close(base + 2).await.unwrap();
        assert_eq!(first.shutdown().await, 1);
    }

    let second =
        setup_orchestrator(base, &config_path, Arc::new(DisabledDirectory), http_transport());
    let report = second.startup_reconcile().await.unwrap();

    assert_eq!(report.source, ReconciliationSource::ConfigFile);
    assert_eq!(report.results.len(), 2);

    // listeners match the persisted entries that are in use
    let entries = second.list_all().await.unwrap();
    let enabled: Vec<u16> = entries.iter().filter(|e| e.use_flag).map(|e| e.proxy_port).collect();
    assert_eq!(second.live_ports().await, enabled);
    assert_eq!(enabled, vec![base + 1]);

    let body = reqwest::get(format!("http://127.0.0.1:{}/x", base + 1))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "backend-r|GET|/x");

    second.shutdown().await;
}

#[tokio::test]
async fn test_reconcile_from_http_asset_database() {
    let dir = tempdir().unwrap();
    let base = get_port_block(4);

    let db = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("action=select"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "datas": [
                {
                    "NPROXY_CODE": "1", "SIP": "10.0.0.1", "NMANAGE_PORT": "443",
                    "NPROXY_PORT": (base + 1).to_string(),
                    "SNAME": "a", "NUSE_FLAG": "1", "SDESC": ""
                },
                {
                    "NPROXY_CODE": "2", "SIP": "10.0.0.2", "NMANAGE_PORT": "443",
                    "NPROXY_PORT": (base + 2).to_string(),
                    "SNAME": "b", "NUSE_FLAG": "0", "SDESC": ""
                },
                {"NPROXY_CODE": "3", "SIP": "10.0.0.3", "NMANAGE_PORT": "443"}
            ]
        })))
        .mount(&db)
        .await;
    // reconciliation never writes back to the database
    Mock::given(method("POST"))
        .and(body_string_contains("action=execute"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&db)
        .await;

    let directory =
        Arc::new(HttpAssetDirectory::new(format!("{}/sql", db.uri()), "tmsplus").unwrap());
    let config_path = dir.path().join("proxy_config.json");
    ConfigStore::new(&config_path, base)
        .replace(vec![ProxyEntry::new("https://stale:443", base + 3)])
        .unwrap();

    let orch = setup_orchestrator(base, &config_path, directory, http_transport());
    let report = orch.startup_reconcile().await.unwrap();

    assert_eq!(report.source, ReconciliationSource::Database);
    assert!(report.results[0].result);
    assert!(report.results[1].result);
    // row without a device name
    assert!(!report.results[2].result);

    let entries = orch.list_all().await.unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.url != "https://stale:443"));
    assert_eq!(orch.live_ports().await, vec![base + 1]);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_externally_held_port_fails_item() {
    let dir = tempdir().unwrap();
    let base = get_port_block(3);
    let _blocker = std::net::TcpListener::bind(("127.0.0.1", base + 1)).unwrap();

    let orch = setup_orchestrator(
        base,
        &dir.path().join("proxy_config.json"),
        Arc::new(DisabledDirectory),
        http_transport(),
    );

    let result = orch.create_one(&record("http://127.0.0.1:9", 1)).await.unwrap().value;
    assert!(!result.result);
    assert!(result.message.contains(&(base + 1).to_string()));
    assert!(orch.live_ports().await.is_empty());
    assert!(orch.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_management_api_over_http() {
    let dir = tempdir().unwrap();
    let base = get_port_block(4);

    let orch = setup_orchestrator(
        base,
        &dir.path().join("proxy_config.json"),
        Arc::new(DisabledDirectory),
        http_transport(),
    );
    let server = Arc::new(ManagementServer::new(orch.clone(), None));
    let listener = TcpListener::bind(("127.0.0.1", base)).await.unwrap();
    tokio::spawn(server.serve(listener));

    // Wait for server to start
    sleep(Duration::from_millis(100)).await;

    let client = reqwest::Client::new();
    let api = format!("http://127.0.0.1:{}", base);

    let health = client.get(format!("{}/health", api)).send().await.unwrap();
    assert_eq!(health.text().await.unwrap(), "OK");

    let created: Value = client
        .get(format!("{}/create?ip=127.0.0.1&port=9&deviceName=gate&deviceCode=1", api))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["status"], json!("success"));
    assert_eq!(created["data"]["value"]["port"], json!(base + 1));
    assert_eq!(created["data"]["value"]["url"], json!("https://127.0.0.1:9"));

    let closed: Value = client
        .post(format!("{}/close", api))
        .json(&json!({"proxy_data": [{"proxy_port": base + 1}]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(closed["data"][0]["result"], json!(true));
    assert!(orch.live_ports().await.is_empty());

    let all: Value = client.get(format!("{}/all", api)).send().await.unwrap().json().await.unwrap();
    assert_eq!(all["data"][0]["NUSE_FLAG"], json!(0));

    let missing = client.get(format!("{}/nowhere", api)).send().await.unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_closed_proxy_drops_keep_alive_connections() {
    let dir = tempdir().unwrap();
    let base = get_port_block(4);
    let backend_port = base + 3;
    let _backend = run_backend_server(backend_port, "backend-k").await;

    let orch = setup_orchestrator(
        base,
        &dir.path().join("proxy_config.json"),
        Arc::new(DisabledDirectory),
        http_transport(),
    );
    orch.create_one(&record(&format!("http://127.0.0.1:{}", backend_port), 1))
        .await
        .unwrap();

    // one client, so the second request would reuse the pooled connection
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/k", base + 1);
    let first = client.get(&url).send().await.unwrap();
    assert_eq!(first.text().await.unwrap(), "backend-k|GET|/k");

    orch.close(base + 1).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    assert!(client.get(&url).send().await.is_err());
    assert!(orch.live_ports().await.is_empty());
}
