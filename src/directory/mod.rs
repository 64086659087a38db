//! Asset directory: the external database holding the device inventory and
//! this application's `PROXY_ASSETS` mirror table.
//!
//! The orchestrator never assumes a call here succeeds. Reads fall back to
//! the config file; writes are fire-and-log.

mod http;
mod record;
mod sqlite;

pub use http::HttpAssetDirectory;
pub use record::AssetRecord;
pub use sqlite::SqliteAssetDirectory;

use crate::entry::ProxyEntry;
use crate::error::{FleetError, FleetResult};
use async_trait::async_trait;
use serde_json::Value;
use url::Url;

/// Inventory this application mirrors its own proxies into.
pub const PROXY_ASSETS_QUERY: &str =
    "SELECT NPROXY_CODE, SIP, NMANAGE_PORT, NPROXY_PORT, SNAME, NUSE_FLAG, SDESC FROM PROXY_ASSETS";

/// Source asset table used for bulk creation.
pub const ASSETS_DEVICE_QUERY: &str =
    "SELECT NDEVICECODE, SIP, NMANAGEPORT, SNAME FROM ASSETS_DEVICE";

/// Generic query/execute RPC against the asset database.
#[async_trait]
pub trait AssetDirectory: Send + Sync {
    /// Run a select and return its rows as JSON objects keyed by column.
    async fn query(&self, sql: &str) -> FleetResult<Vec<Value>>;

    /// Run write statements in order.
    async fn execute(&self, statements: &[String]) -> FleetResult<()>;
}

/// Directory used when no asset database is configured. Every call fails,
/// which sends the orchestrator down its config-file paths.
pub struct DisabledDirectory;

#[async_trait]
impl AssetDirectory for DisabledDirectory {
    async fn query(&self, _sql: &str) -> FleetResult<Vec<Value>> {
        Err(FleetError::DirectoryUnavailable("no asset database configured".to_string()))
    }

    async fn execute(&self, _statements: &[String]) -> FleetResult<()> {
        Err(FleetError::DirectoryUnavailable("no asset database configured".to_string()))
    }
}

/// One `PROXY_ASSETS` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRow {
    pub device_code: String,
    pub ip: String,
    pub manage_port: u16,
    pub proxy_port: u16,
    pub device_name: String,
    pub use_flag: bool,
    pub description: String,
}

impl MirrorRow {
    /// Split the entry's target url back into ip and manage port.
    pub fn from_entry(entry: &ProxyEntry) -> Option<Self> {
        let url = Url::parse(&entry.url).ok()?;
        Some(Self {
            device_code: entry.device_code.clone(),
            ip: url.host_str()?.to_string(),
            manage_port: url.port_or_known_default()?,
            proxy_port: entry.proxy_port,
            device_name: entry.device_name.clone(),
            use_flag: entry.use_flag,
            description: entry.description.clone(),
        })
    }
}

/// `INSERT OR REPLACE` for all rows, or `None` when there is nothing to write.
pub fn upsert_statement(rows: &[MirrorRow]) -> Option<String> {
    if rows.is_empty() {
        return None;
    }

    let values: Vec<String> = rows
        .iter()
        .map(|r| {
            format!(
                "({}, {}, {}, {}, {}, {}, {})",
                quote(&r.device_code),
                quote(&r.ip),
                quote(&r.manage_port.to_string()),
                quote(&r.proxy_port.to_string()),
                quote(&r.device_name),
                u8::from(r.use_flag),
                quote(&r.description),
            )
        })
        .collect();

    Some(format!(
        "INSERT OR REPLACE INTO PROXY_ASSETS \
         (NPROXY_CODE, SIP, NMANAGE_PORT, NPROXY_PORT, SNAME, NUSE_FLAG, SDESC) VALUES {}",
        values.join(", ")
    ))
}

pub fn delete_statement(port: u16) -> String {
    format!("DELETE FROM PROXY_ASSETS WHERE NPROXY_PORT = '{}'", port)
}

pub fn disable_statement(port: u16) -> String {
    format!("UPDATE PROXY_ASSETS SET NUSE_FLAG = 0 WHERE NPROXY_PORT = '{}'", port)
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
