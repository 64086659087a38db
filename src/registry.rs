//! Live listener registry
//!
//! Owns the `port -> listener` map. At most one listener exists per port at
//! any instant, and a port is only recorded once its socket is bound.

use crate::error::{FleetError, FleetResult};
use crate::transport::Transport;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use url::Url;

/// A bound socket forwarding to `target`.
struct LiveListener {
    target: String,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ProxyRegistry {
    listeners: BTreeMap<u16, LiveListener>,
    transport: Arc<Transport>,
    listen_host: IpAddr,
}

impl ProxyRegistry {
    pub fn new(transport: Arc<Transport>, listen_host: IpAddr) -> Self {
        Self {
            listeners: BTreeMap::new(),
            transport,
            listen_host,
        }
    }

    /// Bind `port` and forward it to `target`. A listener already on the
    /// port is closed first. On bind failure nothing is recorded.
    pub async fn start(&mut self, port: u16, target: &str) -> FleetResult<()> {
        let target_url = Url::parse(target)
            .map_err(|e| FleetError::Validation(format!("invalid target url {}: {}", target, e)))?;

        if self.stop(port).await {
            debug!("Replaced existing listener on port {}", port);
        }

        let addr = SocketAddr::new(self.listen_host, port);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                error!("Fail Create Proxy, port {} is unavailable: {}", port, source);
                return Err(FleetError::Bind { port, source });
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(self.transport.clone().serve(listener, target_url, shutdown_rx));

        self.listeners.insert(
            port,
            LiveListener {
                target: target.to_string(),
                shutdown_tx,
                handle,
            },
        );

        info!("Create Proxy {}, Proxy Port : {}", target, port);
        Ok(())
    }

    /// Close the listener on `port`, waiting for the socket to be released.
    /// Returns whether one was running.
    pub async fn stop(&mut self, port: u16) -> bool {
        let Some(listener) = self.listeners.remove(&port) else {
            return false;
        };

        let _ = listener.shutdown_tx.send(true);
        if let Err(e) = listener.handle.await {
            debug!("Listener task on port {} ended abnormally: {}", port, e);
        }
        true
    }

    pub async fn stop_all(&mut self) -> usize {
        let ports: Vec<u16> = self.listeners.keys().copied().collect();
        for port in &ports {
            self.stop(*port).await;
        }
        ports.len()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.listeners.contains_key(&port)
    }

    pub fn target(&self, port: u16) -> Option<&str> {
        self.listeners.get(&port).map(|l| l.target.as_str())
    }

    /// Live ports in ascending order
    pub fn ports(&self) -> Vec<u16> {
        self.listeners.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
