//! WiFi provisioning firmware library.
//!
//! Radio mode control, radio event translation and the guided provisioning
//! flow. Everything except the ESP-IDF driver and NVS storage is
//! platform-independent and tested on the host.

pub mod provisioning;
pub mod radio;
pub mod transport;
pub mod wifi;

// Re-export commonly used items
pub use provisioning::{
    ConfigValue, DeviceParameters, IdentityMaterial, ProtocolError, ProvisioningConfig,
    ProvisioningError, ProvisioningListener, ProvisioningState, Provisioner,
};
pub use radio::{
    DriverError, EventBridge, IpInfo, ModeController, RadioDriver, RadioError, RadioMode,
    RawEvent, SimulatedRadio, WifiEvent, WifiEventListener,
};
pub use transport::{
    CaptiveDnsResponder, DnsResponder, SessionEvent, SessionHandle, TcpSessionServer, TlsListener,
};
pub use wifi::{AccessPointConfig, ConfigError, WifiConfig};
