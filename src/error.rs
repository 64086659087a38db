//! Error taxonomy for fleet orchestration

use std::path::PathBuf;
use thiserror::Error;

/// Everything an orchestration step can fail with.
///
/// Only [`FleetError::Persistence`] aborts a batch; every other kind is
/// folded into the failing item's result.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Required request fields are missing or malformed.
    #[error("Information is insufficient. - {0}")]
    Validation(String),

    /// A different target already owns the port.
    #[error("The proxy port ({port}) is already allocated to {existing}")]
    PortConflict { port: u16, existing: String },

    /// The management port was requested as a proxy port.
    #[error("Port {0} is for management")]
    ReservedPort(u16),

    /// Close was asked for a port without a live listener.
    #[error("Port {0} is not in use")]
    NotInUse(u16),

    /// The OS refused to bind the listening socket.
    #[error("Failed to listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The config document could not be read or written.
    #[error("Config persistence failed for {}: {reason}", path.display())]
    Persistence { path: PathBuf, reason: String },

    /// The asset database RPC failed or replied with something unusable.
    #[error("Asset directory unavailable: {0}")]
    DirectoryUnavailable(String),
}

impl FleetError {
    pub fn persistence(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        FleetError::Persistence {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// True for failures of the config document, which must abort the
    /// enclosing operation.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, FleetError::Persistence { .. })
    }
}

pub type FleetResult<T> = Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_persistence_is_store_failure() {
        assert!(FleetError::persistence("/tmp/x.json", "disk full").is_store_failure());
        assert!(!FleetError::NotInUse(60001).is_store_failure());
        assert!(!FleetError::DirectoryUnavailable("timeout".into()).is_store_failure());
    }

    #[test]
    fn test_messages_name_the_port() {
        let err = FleetError::Bind {
            port: 60005,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
        };
        assert!(err.to_string().contains("60005"));
        assert!(FleetError::ReservedPort(60000).to_string().contains("management"));
    }
}
