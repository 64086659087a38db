//! Normalization of loosely keyed device rows

use crate::lenient::{as_flag, as_port, as_string};
use serde_json::{Map, Value};
use std::collections::HashMap;

const URL_KEYS: &[&str] = &["url", "URL"];
const IP_KEYS: &[&str] = &["ip", "SIP"];
const MANAGE_PORT_KEYS: &[&str] = &["port", "NMANAGE_PORT", "NMANAGEPORT"];
const PROXY_PORT_KEYS: &[&str] = &["proxy_port", "proxyPort", "NPROXY_PORT"];
const DEVICE_NAME_KEYS: &[&str] = &["deviceName", "SNAME", "DEVICE_NAME"];
const DEVICE_CODE_KEYS: &[&str] = &["deviceCode", "NPROXY_CODE", "NDEVICECODE", "DEVICE_CODE"];
const DEVICE_TYPE_KEYS: &[&str] = &["deviceType", "DEVICE_TYPE"];
const USE_FLAG_KEYS: &[&str] = &["NUSE_FLAG", "useFlag"];
const DESC_KEYS: &[&str] = &["desc", "SDESC"];

/// A device row in canonical form.
///
/// Asset tables, the mirror table and HTTP callers all name the same fields
/// differently (`SIP` vs `ip`, `NMANAGEPORT` vs `NMANAGE_PORT` vs `port`).
/// Rows are normalized here before they reach orchestration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetRecord {
    pub url: Option<String>,
    pub ip: Option<String>,
    pub manage_port: Option<u16>,
    pub proxy_port: Option<u16>,
    pub device_name: Option<String>,
    pub device_code: Option<String>,
    pub device_type: Option<String>,
    pub use_flag: Option<bool>,
    pub description: Option<String>,
}

impl AssetRecord {
    pub fn from_value(value: &Value) -> Self {
        match value.as_object() {
            Some(map) => Self::from_map(map),
            None => Self::default(),
        }
    }

    pub fn from_map(map: &Map<String, Value>) -> Self {
        Self {
            url: pick(map, URL_KEYS).and_then(as_string),
            ip: pick(map, IP_KEYS).and_then(as_string),
            manage_port: pick(map, MANAGE_PORT_KEYS).and_then(as_port),
            proxy_port: pick(map, PROXY_PORT_KEYS).and_then(as_port),
            device_name: pick(map, DEVICE_NAME_KEYS).and_then(as_string),
            device_code: pick(map, DEVICE_CODE_KEYS).and_then(as_string),
            device_type: pick(map, DEVICE_TYPE_KEYS).and_then(as_string),
            use_flag: pick(map, USE_FLAG_KEYS).and_then(as_flag),
            description: pick(map, DESC_KEYS).and_then(as_string),
        }
    }

    /// Query-string parameters, all values arriving as strings.
    pub fn from_params(params: &HashMap<String, String>) -> Self {
        let map: Map<String, Value> = params
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        Self::from_map(&map)
    }

    /// Explicit url, or `https://ip:port` built from the parts.
    pub fn target_url(&self) -> Option<String> {
        if let Some(url) = &self.url {
            return Some(url.clone());
        }
        match (&self.ip, self.manage_port) {
            (Some(ip), Some(port)) => Some(format!("https://{}:{}", ip, port)),
            _ => None,
        }
    }
}

/// First alias holding a non-blank value.
fn pick<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().filter_map(|k| map.get(*k)).find(|v| !is_blank(v))
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_both_naming_schemes_normalize_alike() {
        let camel = AssetRecord::from_value(&json!({
            "ip": "10.0.0.1",
            "port": 8443,
            "deviceName": "sensor-a",
            "deviceCode": 1,
            "useFlag": true,
            "desc": "lobby"
        }));
        let snake = AssetRecord::from_value(&json!({
            "SIP": "10.0.0.1",
            "NMANAGEPORT": "8443",
            "SNAME": "sensor-a",
            "NDEVICECODE": "1",
            "NUSE_FLAG": 1,
            "SDESC": "lobby"
        }));

        assert_eq!(camel, snake);
        assert_eq!(camel.target_url().as_deref(), Some("https://10.0.0.1:8443"));
    }

    #[test]
    fn test_mirror_table_row() {
        let record = AssetRecord::from_value(&json!({
            "NPROXY_CODE": 4,
            "SIP": "10.0.0.4",
            "NMANAGE_PORT": 443,
            "NPROXY_PORT": 60004,
            "SNAME": "gate",
            "NUSE_FLAG": 0
        }));

        assert_eq!(record.device_code.as_deref(), Some("4"));
        assert_eq!(record.proxy_port, Some(60004));
        assert_eq!(record.use_flag, Some(false));
    }

    #[test]
    fn test_blank_values_fall_through_to_next_alias() {
        let record = AssetRecord::from_value(&json!({
            "ip": "",
            "SIP": "10.0.0.9",
            "NUSE_FLAG": null,
            "useFlag": 1,
        }));
        assert_eq!(record.ip.as_deref(), Some("10.0.0.9"));
        assert_eq!(record.use_flag, Some(true));
    }

    #[test]
    fn test_query_params_and_non_objects() {
        let params: HashMap<String, String> =
            [("ip", "10.0.0.2"), ("port", "443"), ("deviceCode", "2")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
        let record = AssetRecord::from_params(&params);
        assert_eq!(record.manage_port, Some(443));
        assert_eq!(record.device_code.as_deref(), Some("2"));

        assert_eq!(AssetRecord::from_value(&json!([1, 2])), AssetRecord::default());
    }
}
