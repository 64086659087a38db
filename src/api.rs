//! Management HTTP server
//! Thin command surface over the orchestrator. Every reply is an envelope.

use crate::directory::AssetRecord;
use crate::error::{FleetError, FleetResult};
use crate::orchestrator::{BatchMode, ProxyOrchestrator};
use crate::outcome::Envelope;
use crate::transport::{accept_io, error_response, json_response, text_response, ProxyBody};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

pub struct ManagementServer {
    orchestrator: Arc<ProxyOrchestrator>,
    tls: Option<TlsAcceptor>,
}

impl ManagementServer {
    pub fn new(orchestrator: Arc<ProxyOrchestrator>, tls: Option<TlsAcceptor>) -> Self {
        Self { orchestrator, tls }
    }

    /// Bind `addr` and serve until the task is dropped.
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            "Management server listening on {} ({})",
            addr,
            if self.tls.is_some() { "https" } else { "http" }
        );
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("Management connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> Result<()> {
        let io = accept_io(stream, self.tls.as_ref()).await?;

        http1::Builder::new()
            .serve_connection(
                TokioIo::new(io),
                service_fn(move |req| {
                    let server = self.clone();
                    async move { server.handle_request(req, remote_addr).await }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, Infallible> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);

        debug!("{} {} from {}", method, path, remote_addr);

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                error!("Failed to read request body from {}: {}", remote_addr, e);
                return Ok(error_response(StatusCode::BAD_REQUEST, "Unreadable body"));
            }
        };

        Ok(self.dispatch(&method, &path, query.as_deref(), body).await)
    }

    /// Route one fully read request.
    pub async fn dispatch(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        body: Bytes,
    ) -> Response<ProxyBody> {
        let params = parse_query(query);
        let orch = &self.orchestrator;

        match (method, path) {
            (&Method::GET, "/health") => text_response(StatusCode::OK, "OK"),

            (&Method::GET, "/create") => {
                envelope(orch.create_one(&AssetRecord::from_params(&params)).await)
            }
            (&Method::POST, "/create") => match proxy_data(&body) {
                Ok(records) => envelope(orch.create_many(&records, BatchMode::Normal).await),
                Err(response) => response,
            },
            (&Method::POST, "/delete") => match proxy_data(&body) {
                Ok(records) => envelope(orch.delete_many(&records).await),
                Err(response) => response,
            },
            (&Method::POST, "/close") => match proxy_data(&body) {
                Ok(records) => envelope(orch.close_many(&records).await),
                Err(response) => response,
            },
            (&Method::POST, "/create-proxy-all") => envelope(orch.create_all_from_assets().await),
            (&Method::POST, "/health-check") => match serde_json::from_slice::<Value>(&body) {
                Ok(value) => match value.get("url").and_then(crate::lenient::as_string) {
                    Some(url) => envelope(Ok(orch.health_check(&url).await)),
                    None => envelope::<bool>(Err(FleetError::Validation("url".to_string()))),
                },
                Err(e) => bad_request(&format!("Invalid JSON: {}", e)),
            },

            (&Method::GET, "/all") => envelope(orch.list_all().await),
            (&Method::GET, "/config") => envelope(orch.config_document().await),
            (&Method::GET, "/create-config") => envelope(orch.create_from_config().await),
            (&Method::GET, "/config/add") => match config_params(&params) {
                Ok((url, port, device_type)) => {
                    envelope(orch.config_add(&url, port, &device_type).await)
                }
                Err(e) => envelope::<()>(Err(e)),
            },
            (&Method::GET, "/config/delete") => match config_params(&params) {
                Ok((url, port, device_type)) => {
                    envelope(orch.config_delete(&url, port, &device_type).await)
                }
                Err(e) => envelope::<()>(Err(e)),
            },
            (&Method::GET, "/config/clear") => envelope(orch.config_clear().await),

            _ => json(
                StatusCode::NOT_FOUND,
                &Envelope::<()>::fail(format!("No route for {} {}", method, path)),
            ),
        }
    }
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

/// Records from a `{"proxy_data": [...]}` body.
fn proxy_data(body: &[u8]) -> Result<Vec<AssetRecord>, Response<ProxyBody>> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| bad_request(&format!("Invalid JSON: {}", e)))?;

    match value.get("proxy_data") {
        Some(Value::Array(items)) => Ok(items.iter().map(AssetRecord::from_value).collect()),
        _ => Err(bad_request("proxy_data must be a list")),
    }
}

fn config_params(params: &HashMap<String, String>) -> FleetResult<(String, u16, String)> {
    let url = params
        .get("url")
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| FleetError::Validation("url".to_string()))?;
    let port = params
        .get("port")
        .and_then(|p| p.trim().parse().ok())
        .ok_or_else(|| FleetError::Validation("port".to_string()))?;
    let device_type = params
        .get("devicetype")
        .or_else(|| params.get("deviceType"))
        .cloned()
        .unwrap_or_else(|| "default".to_string());

    Ok((url.clone(), port, device_type))
}

/// Config persistence failures are server errors; everything else is a
/// regular fail envelope.
fn envelope<T: Serialize>(result: FleetResult<T>) -> Response<ProxyBody> {
    let status = match &result {
        Err(e) if e.is_store_failure() => {
            error!("{}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::OK,
    };
    json(status, &Envelope::from(result))
}

fn bad_request(message: &str) -> Response<ProxyBody> {
    json(StatusCode::BAD_REQUEST, &Envelope::<()>::fail(message))
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(value) {
        Ok(body) => json_response(status, body),
        Err(e) => {
            error!("Failed to encode response: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetSettings;
    use crate::config_store::ConfigStore;
    use crate::directory::DisabledDirectory;
    use crate::transport::Transport;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::{tempdir, TempDir};

    fn server(dir: &TempDir, management_port: u16) -> ManagementServer {
        let settings = FleetSettings {
            management_port,
            usable_port_start: management_port,
            listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..FleetSettings::default()
        };
        let store = ConfigStore::new(dir.path().join("proxy_config.json"), management_port);
        let transport = Arc::new(Transport::new(None).unwrap());
        let directory = Arc::new(DisabledDirectory);
        let orchestrator = ProxyOrchestrator::new(settings, store, directory, transport).unwrap();
        ManagementServer::new(Arc::new(orchestrator), None)
    }

    async fn call(
        server: &ManagementServer,
        method: Method,
        path: &str,
        query: Option<&str>,
        body: &str,
    ) -> (StatusCode, Value) {
        let response = server
            .dispatch(&method, path, query, Bytes::from(body.to_string()))
            .await;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_unknown_route_and_bad_json() {
        let dir = tempdir().unwrap();
        let server = server(&dir, 42000);

        let (status, body) = call(&server, Method::GET, "/nope", None, "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], json!("fail"));

        let (status, body) = call(&server, Method::POST, "/create", None, "{oops").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], json!("fail"));

        let (status, _) =
            call(&server, Method::POST, "/delete", None, r#"{"proxy_data": 5}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_config_routes() {
        let dir = tempdir().unwrap();
        let server = server(&dir, 42000);

        let (_, body) = call(
            &server,
            Method::GET,
            "/config/add",
            Some("url=https%3A%2F%2F10.0.0.1%3A8443&port=42001&devicetype=default"),
            "",
        )
        .await;
        assert_eq!(body["status"], json!("success"));
        assert_eq!(body["data"]["NPROXY_PORT"], json!(42001));

        let query = Some("url=https://x&port=42000");
        let (_, body) = call(&server, Method::GET, "/config/add", query, "").await;
        assert_eq!(body["status"], json!("fail"));

        let (_, body) = call(&server, Method::GET, "/all", None, "").await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (_, body) = call(&server, Method::GET, "/config", None, "").await;
        assert_eq!(body["data"]["SERVER"]["PORT"], json!(42000));

        let (_, body) = call(&server, Method::GET, "/config/clear", None, "").await;
        assert_eq!(body["status"], json!("success"));
        let (_, body) = call(&server, Method::GET, "/all", None, "").await;
        assert_eq!(body["data"], json!([]));
    }

    #[tokio::test]
    async fn test_batch_routes_report_per_item() {
        let dir = tempdir().unwrap();
        let server = server(&dir, 42000);

        let (status, body) = call(
            &server,
            Method::POST,
            "/delete",
            None,
            r#"{"proxy_data": [{"proxy_port": 42009}]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["result"], json!(true));

        let unknown = r#"{"proxy_data": [{"proxy_port": "42009"}]}"#;
        let (_, body) = call(&server, Method::POST, "/close", None, unknown).await;
        assert_eq!(body["data"][0]["result"], json!(false));

        let (_, body) = call(&server, Method::POST, "/create-proxy-all", None, "").await;
        assert_eq!(body["status"], json!("fail"));

        let nameless = r#"{"proxy_data": [{"SIP": "10.0.0.1"}]}"#;
        let (_, body) = call(&server, Method::POST, "/create", None, nameless).await;
        assert_eq!(body["status"], json!("success"));
        assert_eq!(body["data"]["value"][0]["result"], json!(false));
    }

    #[tokio::test]
    async fn test_health_routes() {
        let dir = tempdir().unwrap();
        let server = server(&dir, 42000);

        let response = server.dispatch(&Method::GET, "/health", None, Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let unreachable = r#"{"url": "http://127.0.0.1:1"}"#;
        let (_, body) = call(&server, Method::POST, "/health-check", None, unreachable).await;
        assert_eq!(body, json!({"status": "success", "data": false}));

        let (_, body) = call(&server, Method::POST, "/health-check", None, "{}").await;
        assert_eq!(body["status"], json!("fail"));
    }
}
