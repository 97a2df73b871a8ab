//! Guided device provisioning.
//!
//! An unconfigured device opens a temporary access point, accepts exactly one
//! configuration client on the provisioning listener, exchanges a small
//! line-delimited JSON protocol with it, and reports the received network
//! credentials and vendor settings to a [`ProvisioningListener`].
//!
//! # Components
//!
//! - [`protocol`] - Message shapes and command dispatch
//! - [`orchestrator`] - The [`Provisioner`] state machine
//!
//! # Flow
//!
//! ```text
//! Inactive --start_configuration--> Starting --AP started, services up--> Pending
//!    ^                                  |                                  |  ^
//!    |                                  | setup failure                    |  | client disconnect
//!    +----------------------------------+                   client connect v  |
//!    +------------------------------ setconfig / cancel ---------------- Running
//! ```

pub mod orchestrator;
pub mod protocol;

pub use orchestrator::Provisioner;
pub use protocol::{ConfigValue, ProtocolError, Request, Response, SetConfig};

use crate::radio::{RadioError, WifiEventListener};
use crate::transport::{DNS_PORT, PROVISIONING_PORT};
use crate::wifi::ConfigError;
use std::collections::BTreeMap;
use std::fmt;

/// Longest protocol line accepted before the buffer is discarded.
pub const DEFAULT_MAX_LINE_LEN: usize = 2048;

/// Lifecycle of a provisioning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProvisioningState {
    /// No provisioning in progress.
    #[default]
    Inactive,
    /// Access point requested, waiting for it to come up.
    Starting,
    /// Services up, waiting for a client.
    Pending,
    /// A client is connected.
    Running,
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inactive => "inactive",
            Self::Starting => "starting",
            Self::Pending => "pending",
            Self::Running => "running",
        };
        f.write_str(name)
    }
}

/// Ports and limits of the provisioning services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningConfig {
    /// Port of the provisioning listener.
    pub port: u16,
    /// Port of the captive-portal DNS responder.
    pub dns_port: u16,
    /// Longest accepted protocol line in bytes.
    pub max_line_len: usize,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            port: PROVISIONING_PORT,
            dns_port: DNS_PORT,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

/// Certificate and private key for the provisioning listener.
///
/// Both are PEM and null-terminated. They are handed to the listener by
/// reference and never copied or inspected.
#[derive(Clone, Copy, Default)]
pub struct IdentityMaterial {
    pub certificate: Option<&'static [u8]>,
    pub private_key: Option<&'static [u8]>,
}

impl IdentityMaterial {
    pub fn is_complete(&self) -> bool {
        self.certificate.is_some() && self.private_key.is_some()
    }
}

impl fmt::Debug for IdentityMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityMaterial")
            .field("certificate", &self.certificate.map(<[u8]>::len))
            .field("private_key", &self.private_key.map(|_| "****"))
            .finish()
    }
}

/// Vendor key/value pairs advertised in the welcome message.
pub type DeviceParameters = BTreeMap<String, String>;

/// Notifications from the provisioning flow.
///
/// Radio events the flow does not consume arrive through the
/// [`WifiEventListener`] supertrait. Every method has an empty default.
pub trait ProvisioningListener: WifiEventListener {
    /// Services are up and the device waits for a client.
    fn configuration_started(&mut self) {}

    /// A client delivered a configuration and the flow shut down.
    fn configuration_finished(&mut self) {}

    /// The services could not be started, or the flow was cancelled.
    fn configuration_failed(&mut self) {}

    /// The client sent network credentials.
    fn received_wifi_configuration(&mut self, _ssid: &str, _password: &str) {}

    /// The client sent an extra string setting.
    fn received_text_parameter(&mut self, _name: &str, _value: &str) {}

    /// The client sent an extra numeric setting.
    fn received_number_parameter(&mut self, _name: &str, _value: f64) {}

    /// The client sent an extra boolean setting.
    fn received_flag_parameter(&mut self, _name: &str, _value: bool) {}
}

/// Errors returned by [`Provisioner`] operations.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisioningError {
    /// A provisioning flow is already in progress.
    AlreadyActive,
    /// No provisioning flow is in progress.
    NotActive,
    /// Certificate or private key was not set.
    MissingIdentity,
    /// Another device already broadcasts the provisioning SSID.
    NetworkNameCollision { ssid: String, count: u16 },
    /// The pre-flight scan failed.
    ScanFailed(RadioError),
    /// The access point parameters are invalid.
    InvalidAccessPoint(ConfigError),
    /// The radio refused to host the access point.
    Radio(RadioError),
}

impl fmt::Display for ProvisioningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyActive => write!(f, "configuration already active"),
            Self::NotActive => write!(f, "no configuration active"),
            Self::MissingIdentity => write!(f, "certificate or private key not set"),
            Self::NetworkNameCollision { ssid, count } => write!(
                f,
                "{} network(s) named '{}' already broadcasting",
                count, ssid
            ),
            Self::ScanFailed(e) => write!(f, "pre-flight scan failed: {}", e),
            Self::InvalidAccessPoint(e) => write!(f, "invalid access point: {}", e),
            Self::Radio(e) => write!(f, "radio error: {}", e),
        }
    }
}

impl std::error::Error for ProvisioningError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ScanFailed(e) | Self::Radio(e) => Some(e),
            Self::InvalidAccessPoint(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for ProvisioningError {
    fn from(e: ConfigError) -> Self {
        Self::InvalidAccessPoint(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProvisioningConfig::default();
        assert_eq!(config.port, 8443);
        assert_eq!(config.dns_port, 53);
    }

    #[test]
    fn test_identity_debug_hides_key() {
        static KEY: &[u8] = b"secret-key\0";
        let identity = IdentityMaterial {
            certificate: None,
            private_key: Some(KEY),
        };
        assert!(!identity.is_complete());
        assert!(!format!("{:?}", identity).contains("secret"));
    }

    #[test]
    fn test_collision_display() {
        let e = ProvisioningError::NetworkNameCollision {
            ssid: "Setup".into(),
            count: 2,
        };
        assert_eq!(e.to_string(), "2 network(s) named 'Setup' already broadcasting");
    }
}
