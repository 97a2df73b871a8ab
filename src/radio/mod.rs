//! Radio mode control and event translation.
//!
//! This module owns everything between the provisioning logic and the
//! underlying WiFi driver.
//!
//! # Components
//!
//! - [`mode`] - Mode controller, the single source of truth for [`RadioMode`]
//! - [`events`] - Event bridge from raw driver notifications to [`WifiEvent`]s
//! - [`sim`] - Simulated driver for host builds and tests
//! - `esp` - ESP-IDF driver (ESP32 only)

pub mod events;
pub mod mode;
pub mod sim;

#[cfg(feature = "esp32")]
pub mod esp;

pub use events::{
    ip_event_name, wifi_event_name, EventBase, EventBridge, RawEvent, WifiEvent,
    WifiEventListener,
};
pub use mode::{ModeController, ScanContext};
pub use sim::SimulatedRadio;

use crate::wifi::{AccessPointConfig, WifiConfig};
use std::fmt;
use std::net::Ipv4Addr;

/// Minimum active scan dwell time per channel.
pub const SCAN_ACTIVE_MIN_MS: u32 = 100;

/// Maximum active scan dwell time per channel.
pub const SCAN_ACTIVE_MAX_MS: u32 = 300;

/// Operating mode of the radio.
///
/// Client and access point are additive: requesting one while the other is
/// active yields [`RadioMode::ClientAndAccessPoint`]. The combined mode is
/// never entered directly from [`RadioMode::Off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RadioMode {
    /// Radio powered down.
    #[default]
    Off,
    /// Station (client) only.
    Client,
    /// Access point only.
    AccessPoint,
    /// Station and access point at the same time.
    ClientAndAccessPoint,
}

impl RadioMode {
    /// All modes, for exhaustive checks.
    pub const ALL: [RadioMode; 4] = [
        RadioMode::Off,
        RadioMode::Client,
        RadioMode::AccessPoint,
        RadioMode::ClientAndAccessPoint,
    ];

    /// Mode after adding the station interface.
    pub fn with_client(self) -> Self {
        match self {
            Self::AccessPoint | Self::ClientAndAccessPoint => Self::ClientAndAccessPoint,
            Self::Off | Self::Client => Self::Client,
        }
    }

    /// Mode after adding the access point interface.
    pub fn with_access_point(self) -> Self {
        match self {
            Self::Client | Self::ClientAndAccessPoint => Self::ClientAndAccessPoint,
            Self::Off | Self::AccessPoint => Self::AccessPoint,
        }
    }

    /// Mode after removing the access point, or `None` if no AP is active.
    pub fn without_access_point(self) -> Option<Self> {
        match self {
            Self::AccessPoint => Some(Self::Off),
            Self::ClientAndAccessPoint => Some(Self::Client),
            Self::Off | Self::Client => None,
        }
    }

    /// Mode the radio needs while scanning.
    ///
    /// Scanning requires the station interface, so `Off` temporarily becomes
    /// `Client` and `AccessPoint` becomes `ClientAndAccessPoint`.
    pub fn scan_mode(self) -> Self {
        self.with_client()
    }

    /// Returns true if the station interface is active.
    pub fn has_client(self) -> bool {
        matches!(self, Self::Client | Self::ClientAndAccessPoint)
    }

    /// Returns true if an access point is being hosted.
    pub fn has_access_point(self) -> bool {
        matches!(self, Self::AccessPoint | Self::ClientAndAccessPoint)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Client => "client",
            Self::AccessPoint => "access-point",
            Self::ClientAndAccessPoint => "client+access-point",
        }
    }
}

impl fmt::Display for RadioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IPv4 configuration of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpInfo {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl IpInfo {
    pub fn new(ip: Ipv4Addr, netmask: Ipv4Addr, gateway: Ipv4Addr) -> Self {
        Self {
            ip,
            netmask,
            gateway,
        }
    }

    /// All-zero address info, what the driver reports for an unconfigured interface.
    pub fn unspecified() -> Self {
        Self::new(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
        )
    }
}

impl fmt::Display for IpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ip={} netmask={} gateway={}",
            self.ip, self.netmask, self.gateway
        )
    }
}

/// Hardware address of the station interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

/// Parameters of a single scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    /// Only count networks with this SSID.
    pub ssid: Option<String>,
    /// Also report networks that hide their SSID.
    pub show_hidden: bool,
    /// Minimum active dwell time per channel.
    pub active_min_ms: u32,
    /// Maximum active dwell time per channel.
    pub active_max_ms: u32,
}

impl ScanRequest {
    pub fn new(ssid: Option<&str>, show_hidden: bool) -> Self {
        Self {
            ssid: ssid.filter(|s| !s.is_empty()).map(str::to_string),
            show_hidden,
            active_min_ms: SCAN_ACTIVE_MIN_MS,
            active_max_ms: SCAN_ACTIVE_MAX_MS,
        }
    }

    /// Returns true if a network with this SSID should be counted.
    pub fn matches(&self, ssid: &str) -> bool {
        if ssid.is_empty() && !self.show_hidden {
            return false;
        }
        match &self.ssid {
            Some(wanted) => wanted == ssid,
            None => true,
        }
    }
}

/// Low-level radio driver.
///
/// Implementations are thin pass-throughs to the platform WiFi stack. They do
/// not track the mode themselves; [`ModeController`] decides which mode to
/// apply and in which order.
pub trait RadioDriver {
    /// One-time driver initialisation.
    fn init(&mut self) -> Result<(), DriverError>;

    /// Apply an operating mode.
    fn set_mode(&mut self, mode: RadioMode) -> Result<(), DriverError>;

    /// Power up the radio in the current mode.
    fn start(&mut self) -> Result<(), DriverError>;

    /// Power down the radio.
    fn stop(&mut self) -> Result<(), DriverError>;

    /// Set station credentials.
    fn configure_client(&mut self, config: &WifiConfig) -> Result<(), DriverError>;

    /// Set access point parameters.
    fn configure_access_point(&mut self, config: &AccessPointConfig) -> Result<(), DriverError>;

    /// Request association with the configured network.
    fn connect(&mut self) -> Result<(), DriverError>;

    /// Run a blocking scan and return the number of matching networks.
    fn scan(&mut self, request: &ScanRequest) -> Result<u16, DriverError>;

    fn station_ip_info(&self) -> Result<IpInfo, DriverError>;

    fn station_mac(&self) -> Result<MacAddress, DriverError>;

    fn rssi(&self) -> Result<i8, DriverError>;
}

/// A radio driver call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    /// Name of the failed driver operation.
    pub operation: &'static str,
    /// Platform error code.
    pub code: i32,
}

impl DriverError {
    pub fn new(operation: &'static str, code: i32) -> Self {
        Self { operation, code }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: error {}", self.operation, self.code)
    }
}

impl std::error::Error for DriverError {}

#[cfg(feature = "esp32")]
impl DriverError {
    /// Wrap an ESP-IDF error for the given operation.
    pub fn esp(operation: &'static str, e: esp_idf_sys::EspError) -> Self {
        Self::new(operation, e.code())
    }
}

/// Errors reported by the mode controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// `init` has not been called yet.
    NotInitialized,
    /// `init` was already called.
    AlreadyInitialized,
    /// An access point is already being hosted.
    AccessPointActive,
    /// No access point is active.
    NoAccessPoint,
    /// The driver rejected a call.
    Driver(DriverError),
}

impl From<DriverError> for RadioError {
    fn from(e: DriverError) -> Self {
        Self::Driver(e)
    }
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "radio not initialized"),
            Self::AlreadyInitialized => write!(f, "radio already initialized"),
            Self::AccessPointActive => write!(f, "access point already active"),
            Self::NoAccessPoint => write!(f, "no access point active"),
            Self::Driver(e) => write!(f, "driver error: {}", e),
        }
    }
}

impl std::error::Error for RadioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Driver(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== RadioMode Tests ====================

    #[test]
    fn test_client_is_additive() {
        assert_eq!(RadioMode::Off.with_client(), RadioMode::Client);
        assert_eq!(RadioMode::Client.with_client(), RadioMode::Client);
        assert_eq!(
            RadioMode::AccessPoint.with_client(),
            RadioMode::ClientAndAccessPoint
        );
        assert_eq!(
            RadioMode::ClientAndAccessPoint.with_client(),
            RadioMode::ClientAndAccessPoint
        );
    }

    #[test]
    fn test_access_point_is_additive() {
        assert_eq!(RadioMode::Off.with_access_point(), RadioMode::AccessPoint);
        assert_eq!(
            RadioMode::Client.with_access_point(),
            RadioMode::ClientAndAccessPoint
        );
        assert_eq!(
            RadioMode::AccessPoint.with_access_point(),
            RadioMode::AccessPoint
        );
    }

    #[test]
    fn test_off_never_jumps_to_combined() {
        assert_ne!(RadioMode::Off.with_client(), RadioMode::ClientAndAccessPoint);
        assert_ne!(
            RadioMode::Off.with_access_point(),
            RadioMode::ClientAndAccessPoint
        );
    }

    #[test]
    fn test_without_access_point() {
        assert_eq!(
            RadioMode::AccessPoint.without_access_point(),
            Some(RadioMode::Off)
        );
        assert_eq!(
            RadioMode::ClientAndAccessPoint.without_access_point(),
            Some(RadioMode::Client)
        );
        assert_eq!(RadioMode::Client.without_access_point(), None);
        assert_eq!(RadioMode::Off.without_access_point(), None);
    }

    #[test]
    fn test_scan_mode_has_client() {
        for mode in RadioMode::ALL {
            assert!(mode.scan_mode().has_client());
            assert_eq!(mode.scan_mode().has_access_point(), mode.has_access_point());
        }
    }

    // ==================== Display Tests ====================

    #[test]
    fn test_mac_display() {
        let mac = MacAddress([0x00, 0x11, 0x22, 0xaa, 0xbb, 0xcc]);
        assert_eq!(mac.to_string(), "00:11:22:AA:BB:CC");
    }

    #[test]
    fn test_driver_error_display() {
        let e = RadioError::from(DriverError::new("esp_wifi_start", 12290));
        assert_eq!(e.to_string(), "driver error: esp_wifi_start failed: error 12290");
    }

    // ==================== ScanRequest Tests ====================

    #[test]
    fn test_scan_request_filter() {
        let request = ScanRequest::new(Some("Setup"), true);
        assert!(request.matches("Setup"));
        assert!(!request.matches("Other"));
    }

    #[test]
    fn test_scan_request_empty_filter_matches_all() {
        let request = ScanRequest::new(Some(""), true);
        assert_eq!(request.ssid, None);
        assert!(request.matches("Anything"));
        assert!(request.matches(""));
    }

    #[test]
    fn test_scan_request_hidden() {
        let request = ScanRequest::new(None, false);
        assert!(!request.matches(""));
        assert!(request.matches("Visible"));
    }
}
