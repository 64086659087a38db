//! Forwarding transport for proxy listeners
//! Accepts HTTP(S) connections on a bound socket and relays every request to
//! the listener's target URL.

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};
use url::Url;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Connection-level headers that must not be relayed.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "content-length",
];

/// A byte stream that may or may not be wrapped in TLS.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Terminate TLS on `stream` when an acceptor is configured.
pub async fn accept_io(stream: TcpStream, tls: Option<&TlsAcceptor>) -> Result<Box<dyn Io>> {
    match tls {
        Some(acceptor) => {
            let tls_stream = acceptor.accept(stream).await.context("TLS handshake failed")?;
            Ok(Box::new(tls_stream))
        }
        None => Ok(Box::new(stream)),
    }
}

/// Shared forwarding machinery for every listener in the fleet
pub struct Transport {
    client: reqwest::Client,
    tls: Option<TlsAcceptor>,
}

impl Transport {
    /// `tls` enables HTTPS termination on every listener.
    pub fn new(tls: Option<TlsAcceptor>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to build forwarding client")?;

        Ok(Self { client, tls })
    }

    /// Accept loop for one listener; returns once `shutdown` flips to true,
    /// releasing the socket.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        target: Url,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
        let target = Arc::new(target);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let transport = self.clone();
                            let target = target.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                let served = transport
                                    .handle_connection(stream, remote_addr, target, shutdown)
                                    .await;
                                if let Err(e) = served {
                                    debug!("Proxy connection error from {}: {}", remote_addr, e);
                                }
                            });
                        }
                        Err(e) => debug!("Accept error on port {}: {}", port, e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Proxy listener on port {} closed", port);
                        break;
                    }
                }
            }
        }
    }

    /// Serve one connection until the client hangs up or the listener is
    /// stopped. In-flight requests finish before the socket closes.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        target: Arc<Url>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let io = accept_io(stream, self.tls.as_ref()).await?;
        let client = self.client.clone();

        let conn = http1::Builder::new().preserve_header_case(true).serve_connection(
            TokioIo::new(io),
            service_fn(move |req| {
                let client = client.clone();
                let target = target.clone();
                async move { Self::handle_request(req, remote_addr, &client, &target).await }
            }),
        );
        tokio::pin!(conn);

        let mut closing = *shutdown.borrow();
        if closing {
            conn.as_mut().graceful_shutdown();
        }

        loop {
            tokio::select! {
                served = conn.as_mut() => {
                    return served.map_err(|e| anyhow!("HTTP service error: {}", e));
                }
                changed = shutdown.changed(), if !closing => {
                    if changed.is_err() || *shutdown.borrow() {
                        closing = true;
                        conn.as_mut().graceful_shutdown();
                    }
                }
            }
        }
    }

    async fn handle_request(
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        client: &reqwest::Client,
        target: &Url,
    ) -> Result<Response<ProxyBody>, Infallible> {
        match Self::forward(req, client, target).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!("Forwarding {} -> {} failed: {:#}", remote_addr, target, e);
                Ok(error_response(StatusCode::BAD_GATEWAY, "Bad Gateway"))
            }
        }
    }

    async fn forward(
        req: Request<Incoming>,
        client: &reqwest::Client,
        target: &Url,
    ) -> Result<Response<ProxyBody>> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let backend_url = backend_url(target, &path_and_query);

        debug!("{} {} -> {}", req.method(), path_and_query, backend_url);

        let (parts, body) = req.into_parts();
        let body_bytes = body.collect().await.context("Failed to read request body")?.to_bytes();

        let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
            .context("Unsupported method")?;

        let mut builder = client.request(method, &backend_url);
        for (name, value) in parts.headers.iter() {
            if *name == HOST || is_hop_header(name.as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_bytes());
        }

        let upstream = builder.body(body_bytes).send().await.context("Backend request failed")?;

        let status =
            StatusCode::from_u16(upstream.status().as_u16()).context("Invalid backend status")?;
        let mut response = Response::builder().status(status);
        for (name, value) in upstream.headers().iter() {
            if is_hop_header(name.as_str()) {
                continue;
            }
            response = response.header(name.as_str(), value.as_bytes());
        }

        let bytes = upstream.bytes().await.context("Failed to read backend body")?;
        response
            .body(full_body(bytes))
            .context("Failed to build response")
    }
}

fn is_hop_header(name: &str) -> bool {
    HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Join the target base with the incoming path and query.
fn backend_url(target: &Url, path_and_query: &str) -> String {
    let base = target.as_str().trim_end_matches('/');
    if path_and_query.starts_with('/') {
        format!("{}{}", base, path_and_query)
    } else {
        format!("{}/{}", base, path_and_query)
    }
}

pub(crate) fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    response_with(status, "text/plain", Bytes::from(body.to_string()))
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    text_response(status, message)
}

pub(crate) fn json_response(status: StatusCode, body: Vec<u8>) -> Response<ProxyBody> {
    response_with(status, "application/json", Bytes::from(body))
}

fn response_with(status: StatusCode, content_type: &str, body: Bytes) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

pub(crate) fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}
