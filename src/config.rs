//! Runtime settings shared by the orchestrator and its collaborators

use std::net::{IpAddr, Ipv4Addr};

pub const DEFAULT_MANAGEMENT_PORT: u16 = 60000;
pub const DEFAULT_USABLE_PORT_START: u16 = 60000;
pub const DEFAULT_HEALTH_CHECK_PATH: &str = "/activex/login/sniper_info.js";

/// Device types a proxy may be created for.
pub const SUPPORTED_DEVICE_TYPES: &[&str] = &["default"];

/// Orchestration settings
#[derive(Debug, Clone)]
pub struct FleetSettings {
    /// Port of the management surface; never handed out to a proxy.
    pub management_port: u16,
    /// First port probed when a conflict needs a replacement.
    pub usable_port_start: u16,
    /// Address proxy listeners bind to.
    pub listen_host: IpAddr,
    /// Path appended to a target URL by the health probe.
    pub health_check_path: String,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            management_port: DEFAULT_MANAGEMENT_PORT,
            usable_port_start: DEFAULT_USABLE_PORT_START,
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            health_check_path: DEFAULT_HEALTH_CHECK_PATH.to_string(),
        }
    }
}

impl FleetSettings {
    /// Port requested for a device when the caller does not name one.
    pub fn device_port(&self, device_code: &str) -> Option<u16> {
        let code: u16 = device_code.trim().parse().ok()?;
        self.management_port.checked_add(code)
    }
}

pub fn is_supported_device_type(device_type: &str) -> bool {
    let lowered = device_type.to_ascii_lowercase();
    SUPPORTED_DEVICE_TYPES.contains(&lowered.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_port_offsets_management_port() {
        let settings = FleetSettings::default();
        assert_eq!(settings.device_port("2"), Some(60002));
        assert_eq!(settings.device_port("abc"), None);
        assert_eq!(settings.device_port("9999"), None);
    }

    #[test]
    fn test_device_type_is_case_insensitive() {
        assert!(is_supported_device_type("DEFAULT"));
        assert!(!is_supported_device_type("camera"));
    }
}
