//! Backend reachability probe

use anyhow::{Context, Result};
use tracing::debug;

/// Issues a fixed GET against a backend. Certificates are not validated and
/// connections are pooled across probes.
pub struct HealthProbe {
    client: reqwest::Client,
    path: String,
}

impl HealthProbe {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .tcp_keepalive(std::time::Duration::from_secs(60))
            .build()
            .context("Failed to build health check client")?;

        Ok(Self {
            client,
            path: path.into(),
        })
    }

    /// Whether `url` answered the probe with a success status. Network
    /// errors count as unreachable.
    pub async fn check(&self, url: &str) -> bool {
        let probe_url = format!("{}{}", url.trim_end_matches('/'), self.path);

        match self.client.get(&probe_url).send().await {
            Ok(response) => {
                debug!("Health check {} -> {}", probe_url, response.status());
                response.status().is_success()
            }
            Err(e) => {
                debug!("Health check {} failed: {}", probe_url, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_reachable_backend() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/activex/login/sniper_info.js"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let probe = HealthProbe::new("/activex/login/sniper_info.js").unwrap();
        assert!(probe.check(&server.uri()).await);
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let probe = HealthProbe::new("/health").unwrap();
        assert!(!probe.check(&format!("http://127.0.0.1:{}", port)).await);
        assert!(!probe.check("not a url").await);
    }

    #[tokio::test]
    async fn test_error_status_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let probe = HealthProbe::new("/health").unwrap();
        assert!(!probe.check(&server.uri()).await);
    }
}
