//! Persisted proxy entries and the config document that holds them

use crate::lenient;
use serde::{Deserialize, Serialize};

/// One managed port → backend mapping, as stored in the config document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEntry {
    #[serde(rename = "URL", deserialize_with = "lenient::de_string")]
    pub url: String,

    #[serde(rename = "IP", default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    #[serde(rename = "NPROXY_PORT", deserialize_with = "lenient::de_port")]
    pub proxy_port: u16,

    #[serde(rename = "DEVICE_NAME", default, deserialize_with = "lenient::de_string")]
    pub device_name: String,

    #[serde(rename = "DEVICE_TYPE", default, deserialize_with = "lenient::de_string")]
    pub device_type: String,

    #[serde(rename = "DEVICE_CODE", default, deserialize_with = "lenient::de_string")]
    pub device_code: String,

    #[serde(
        rename = "NUSE_FLAG",
        default,
        deserialize_with = "lenient::de_flag",
        serialize_with = "lenient::ser_flag"
    )]
    pub use_flag: bool,

    #[serde(rename = "SDESC", default, deserialize_with = "lenient::de_string")]
    pub description: String,
}

impl ProxyEntry {
    /// Minimal entry with only a target and a port; the rest is filled by
    /// the caller.
    pub fn new(url: impl Into<String>, proxy_port: u16) -> Self {
        Self {
            url: url.into(),
            ip: None,
            proxy_port,
            device_name: String::new(),
            device_type: "default".to_string(),
            device_code: String::new(),
            use_flag: true,
            description: String::new(),
        }
    }
}

/// Identity block of this process, written once when the document is
/// initialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    #[serde(rename = "IP", default, deserialize_with = "lenient::de_string")]
    pub ip: String,

    #[serde(rename = "URL", default, deserialize_with = "lenient::de_string")]
    pub url: String,

    #[serde(rename = "PORT", default, deserialize_with = "lenient::de_opt_port")]
    pub port: Option<u16>,
}

impl ServerIdentity {
    pub fn local(management_port: u16) -> Self {
        Self {
            ip: "localhost".to_string(),
            url: "https://localhost".to_string(),
            port: Some(management_port),
        }
    }
}

/// The whole config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyDocument {
    #[serde(rename = "SERVER")]
    pub server: ServerIdentity,

    #[serde(rename = "PROXY_SERVER", default)]
    pub entries: Vec<ProxyEntry>,
}

impl ProxyDocument {
    pub fn empty(management_port: u16) -> Self {
        Self {
            server: ServerIdentity::local(management_port),
            entries: Vec::new(),
        }
    }
}
