//! Asset directory reached over the HTTP SQL RPC endpoint

use super::AssetDirectory;
use crate::error::{FleetError, FleetResult};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Client for the SQL RPC endpoint of the asset database.
///
/// Requests are form-encoded `action`, `query`, `dbname`. Select replies
/// carry their rows in a `datas` list; error replies do not.
pub struct HttpAssetDirectory {
    client: reqwest::Client,
    endpoint: String,
    database: String,
}

impl HttpAssetDirectory {
    pub fn new(endpoint: impl Into<String>, database: impl Into<String>) -> FleetResult<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| FleetError::DirectoryUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            database: database.into(),
        })
    }

    async fn call(&self, action: &str, query: &str) -> FleetResult<Value> {
        let form = [("action", action), ("query", query), ("dbname", self.database.as_str())];

        let response = self
            .client
            .post(&self.endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                FleetError::DirectoryUnavailable(format!("{} request failed: {}", action, e))
            })?;

        if !response.status().is_success() {
            return Err(FleetError::DirectoryUnavailable(format!(
                "{} returned HTTP {}",
                action,
                response.status()
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| {
                FleetError::DirectoryUnavailable(format!("{} reply is not JSON: {}", action, e))
            })
    }
}

/// Error replies look like `{"DATA": {"level": "err"}}`.
fn is_error_reply(reply: &Value) -> bool {
    reply
        .pointer("/DATA/level")
        .and_then(Value::as_str)
        .map(|level| level.eq_ignore_ascii_case("err"))
        .unwrap_or(false)
}

#[async_trait]
impl AssetDirectory for HttpAssetDirectory {
    async fn query(&self, sql: &str) -> FleetResult<Vec<Value>> {
        let reply = self.call("select", sql).await?;

        match reply.get("datas") {
            Some(Value::Array(rows)) => {
                debug!("Asset query returned {} rows", rows.len());
                Ok(rows.clone())
            }
            _ => Err(FleetError::DirectoryUnavailable(
                "select reply carried no row list".to_string(),
            )),
        }
    }

    async fn execute(&self, statements: &[String]) -> FleetResult<()> {
        let batch = serde_json::to_string(statements)
            .map_err(|e| FleetError::DirectoryUnavailable(e.to_string()))?;

        let reply = self.call("execute", &batch).await?;
        if is_error_reply(&reply) {
            return Err(FleetError::DirectoryUnavailable("execute was rejected".to_string()));
        }
        Ok(())
    }
}
