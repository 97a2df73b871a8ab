//! WiFi configuration data structures.
//!
//! This module contains platform-independent types for WiFi configuration
//! that can be tested on the host machine.
//!
//! # Example
//!
//! ```
//! use wifi_provision_esp32::wifi::{AccessPointConfig, WifiConfig};
//!
//! let config = WifiConfig::new("MyNetwork", "MyPassword").unwrap();
//! assert!(config.validate().is_ok());
//!
//! let ap = AccessPointConfig::new("Device-Setup", "").unwrap();
//! assert!(ap.is_open());
//! ```

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Maximum SSID length per IEEE 802.11 standard.
pub const MAX_SSID_LEN: usize = 32;

/// Maximum password length for WPA2.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Minimum password length for WPA2.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Channel used for the provisioning access point.
pub const DEFAULT_AP_CHANNEL: u8 = 1;

/// Beacon interval of the access point in time units (1.024 ms).
pub const DEFAULT_BEACON_INTERVAL: u16 = 100;

/// The provisioning protocol accepts a single client at a time.
pub const DEFAULT_AP_MAX_CONNECTIONS: u8 = 1;

/// WiFi credentials for connecting to an access point.
///
/// The password is zeroed when the value is dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct WifiConfig {
    /// Network SSID (1-32 bytes).
    pub ssid: String,
    /// Network password (8-64 bytes for WPA2, empty for open networks).
    pub password: String,
}

impl WifiConfig {
    /// Create a new WiFi configuration.
    ///
    /// Returns an error if SSID or password are invalid.
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Result<Self, ConfigError> {
        let config = Self {
            ssid: ssid.into(),
            password: password.into(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Create a configuration for an open network (no password).
    pub fn open(ssid: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(ssid, String::new())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_ssid(&self.ssid)?;
        validate_password(&self.password)
    }

    /// Check if this is an open network (no password).
    pub fn is_open(&self) -> bool {
        self.password.is_empty()
    }

    /// Serialize to bytes for NVS storage.
    ///
    /// Format: `[ssid_len:1][ssid:N][password_len:1][password:M]`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + self.ssid.len() + self.password.len());
        bytes.push(self.ssid.len() as u8);
        bytes.extend_from_slice(self.ssid.as_bytes());
        bytes.push(self.password.len() as u8);
        bytes.extend_from_slice(self.password.as_bytes());
        bytes
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        if bytes.is_empty() {
            return Err(ConfigError::InvalidFormat("empty data".into()));
        }

        let ssid_len = bytes[0] as usize;
        if bytes.len() < 1 + ssid_len + 1 {
            return Err(ConfigError::InvalidFormat("truncated SSID".into()));
        }

        let ssid = String::from_utf8(bytes[1..1 + ssid_len].to_vec())
            .map_err(|_| ConfigError::InvalidFormat("invalid SSID UTF-8".into()))?;

        let password_len = bytes[1 + ssid_len] as usize;
        let password_start = 2 + ssid_len;
        if bytes.len() < password_start + password_len {
            return Err(ConfigError::InvalidFormat("truncated password".into()));
        }

        let password =
            String::from_utf8(bytes[password_start..password_start + password_len].to_vec())
                .map_err(|_| ConfigError::InvalidFormat("invalid password UTF-8".into()))?;

        Self::new(ssid, password)
    }
}

impl fmt::Debug for WifiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiConfig")
            .field("ssid", &self.ssid)
            .field("password", &mask(&self.password))
            .finish()
    }
}

/// Parameters of the access point the device hosts.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AccessPointConfig {
    /// Broadcast SSID (1-32 bytes).
    pub ssid: String,
    /// WPA/WPA2 passphrase, empty for an open network.
    pub password: String,
    pub channel: u8,
    pub beacon_interval: u16,
    pub max_connections: u8,
}

impl AccessPointConfig {
    /// Create an access point configuration with the provisioning defaults.
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Result<Self, ConfigError> {
        let config = Self {
            ssid: ssid.into(),
            password: password.into(),
            channel: DEFAULT_AP_CHANNEL,
            beacon_interval: DEFAULT_BEACON_INTERVAL,
            max_connections: DEFAULT_AP_MAX_CONNECTIONS,
        };
        validate_ssid(&config.ssid)?;
        validate_password(&config.password)?;
        Ok(config)
    }

    /// Open networks need no passphrase; everything else uses WPA/WPA2-PSK.
    pub fn is_open(&self) -> bool {
        self.password.is_empty()
    }
}

impl fmt::Debug for AccessPointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessPointConfig")
            .field("ssid", &self.ssid)
            .field("password", &mask(&self.password))
            .field("channel", &self.channel)
            .field("beacon_interval", &self.beacon_interval)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Render a secret for logs.
pub fn mask(secret: &str) -> &'static str {
    if secret.is_empty() {
        "(none)"
    } else {
        "****"
    }
}

fn validate_ssid(ssid: &str) -> Result<(), ConfigError> {
    if ssid.is_empty() {
        return Err(ConfigError::SsidEmpty);
    }
    if ssid.len() > MAX_SSID_LEN {
        return Err(ConfigError::SsidTooLong {
            len: ssid.len(),
            max: MAX_SSID_LEN,
        });
    }
    Ok(())
}

// Empty is OK for open networks
fn validate_password(password: &str) -> Result<(), ConfigError> {
    if !password.is_empty() && password.len() < MIN_PASSWORD_LEN {
        return Err(ConfigError::PasswordTooShort {
            len: password.len(),
            min: MIN_PASSWORD_LEN,
        });
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(ConfigError::PasswordTooLong {
            len: password.len(),
            max: MAX_PASSWORD_LEN,
        });
    }
    Ok(())
}

/// Errors that can occur during configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// SSID is empty.
    SsidEmpty,
    /// SSID exceeds maximum length.
    SsidTooLong { len: usize, max: usize },
    /// Password is too short for WPA2.
    PasswordTooShort { len: usize, min: usize },
    /// Password exceeds maximum length.
    PasswordTooLong { len: usize, max: usize },
    /// Invalid data format during deserialization.
    InvalidFormat(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SsidEmpty => write!(f, "SSID cannot be empty"),
            Self::SsidTooLong { len, max } => {
                write!(f, "SSID too long: {} bytes (max {})", len, max)
            }
            Self::PasswordTooShort { len, min } => {
                write!(f, "password too short: {} bytes (min {})", len, min)
            }
            Self::PasswordTooLong { len, max } => {
                write!(f, "password too long: {} bytes (max {})", len, max)
            }
            Self::InvalidFormat(msg) => write!(f, "invalid format: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== WifiConfig Tests ====================

    #[test]
    fn test_valid_config() {
        let config = WifiConfig::new("TestNetwork", "password123").unwrap();
        assert_eq!(config.ssid, "TestNetwork");
        assert_eq!(config.password, "password123");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_open_network() {
        let config = WifiConfig::open("OpenNetwork").unwrap();
        assert!(config.is_open());
    }

    #[test]
    fn test_empty_ssid() {
        let result = WifiConfig::new("", "password123");
        assert_eq!(result, Err(ConfigError::SsidEmpty));
    }

    #[test]
    fn test_ssid_too_long() {
        let result = WifiConfig::new("a".repeat(33), "password123");
        assert!(matches!(result, Err(ConfigError::SsidTooLong { .. })));
    }

    #[test]
    fn test_password_bounds() {
        assert!(matches!(
            WifiConfig::new("TestNetwork", "short"),
            Err(ConfigError::PasswordTooShort { .. })
        ));
        assert!(WifiConfig::new("TestNetwork", "12345678").is_ok());
        assert!(WifiConfig::new("TestNetwork", "a".repeat(64)).is_ok());
        assert!(matches!(
            WifiConfig::new("TestNetwork", "a".repeat(65)),
            Err(ConfigError::PasswordTooLong { .. })
        ));
    }

    #[test]
    fn test_debug_masks_password() {
        let config = WifiConfig::new("TestNetwork", "password123").unwrap();
        let debug = format!("{:?}", config);
        assert!(debug.contains("TestNetwork"));
        assert!(!debug.contains("password123"));
    }

    // ==================== Serialization Tests ====================

    #[test]
    fn test_serialize_deserialize() {
        let config = WifiConfig::new("MyNetwork", "MyPassword").unwrap();
        let restored = WifiConfig::from_bytes(&config.to_bytes()).unwrap();
        assert_eq!(config, restored);
    }

    #[test]
    fn test_deserialize_empty() {
        let result = WifiConfig::from_bytes(&[]);
        assert!(matches!(result, Err(ConfigError::InvalidFormat(_))));
    }

    #[test]
    fn test_deserialize_truncated() {
        let result = WifiConfig::from_bytes(&[5, b'h', b'e', b'l', b'l']);
        assert!(matches!(result, Err(ConfigError::InvalidFormat(_))));
    }

    // ==================== AccessPointConfig Tests ====================

    #[test]
    fn test_access_point_defaults() {
        let ap = AccessPointConfig::new("Device-Setup", "setup-pass").unwrap();
        assert_eq!(ap.channel, DEFAULT_AP_CHANNEL);
        assert_eq!(ap.beacon_interval, DEFAULT_BEACON_INTERVAL);
        assert_eq!(ap.max_connections, 1);
        assert!(!ap.is_open());
    }

    #[test]
    fn test_access_point_open() {
        let ap = AccessPointConfig::new("Device-Setup", "").unwrap();
        assert!(ap.is_open());
    }

    #[test]
    fn test_access_point_invalid() {
        assert_eq!(
            AccessPointConfig::new("", "").unwrap_err(),
            ConfigError::SsidEmpty
        );
        assert!(matches!(
            AccessPointConfig::new("Device-Setup", "abc"),
            Err(ConfigError::PasswordTooShort { .. })
        ));
    }
}
