//! Result shapes returned by orchestration operations

use crate::error::FleetError;
use serde::{Deserialize, Serialize};

/// Per-item outcome of a create request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub port: u16,
    pub url: String,
    pub device_code: String,
    pub result: bool,
    pub created_time: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommend_port: Option<u16>,
}

impl ItemResult {
    pub fn pending(port: u16, url: impl Into<String>, device_code: impl Into<String>) -> Self {
        Self {
            port,
            url: url.into(),
            device_code: device_code.into(),
            result: false,
            created_time: created_time(),
            message: String::new(),
            recommend_port: None,
        }
    }

    pub fn succeed(mut self, message: impl Into<String>) -> Self {
        self.result = true;
        self.message = message.into();
        self
    }

    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.result = false;
        self.message = message.into();
        self
    }
}

/// Local time as `yyyymmddhhmmss`.
pub fn created_time() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S").to_string()
}

/// Outcome of a best-effort write to the asset database.
///
/// Kept apart from the primary result so a database failure can never be
/// mistaken for an operation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MirrorStatus {
    Synced,
    Skipped,
    Failed { reason: String },
}

impl MirrorStatus {
    pub fn is_synced(&self) -> bool {
        matches!(self, MirrorStatus::Synced)
    }
}

/// A primary outcome together with what happened on the database mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mirrored<T> {
    pub value: T,
    pub mirror: MirrorStatus,
}

impl<T> Mirrored<T> {
    pub fn new(value: T, mirror: MirrorStatus) -> Self {
        Self { value, mirror }
    }
}

/// Per-port outcome of a delete or close request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortOutcome {
    pub port: u16,
    pub result: bool,
    pub message: String,
    pub mirror: MirrorStatus,
}

/// Which source drove the most recent startup reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationSource {
    Database,
    ConfigFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub source: ReconciliationSource,
    pub results: Vec<ItemResult>,
}

/// Uniform response body: `{status: success, data}` or `{status: fail, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Envelope<T> {
    Success { data: T },
    Fail { message: String },
}

impl<T> Envelope<T> {
    pub fn success(data: T) -> Self {
        Envelope::Success { data }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Envelope::Fail {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Envelope::Success { .. })
    }
}

impl<T> From<Result<T, FleetError>> for Envelope<T> {
    fn from(result: Result<T, FleetError>) -> Self {
        match result {
            Ok(data) => Envelope::success(data),
            Err(e) => Envelope::fail(e.to_string()),
        }
    }
}
