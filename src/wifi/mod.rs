//! WiFi credentials and storage.
//!
//! # Components
//!
//! - [`config`] - Credential and access point parameter types (host-testable)
//! - `storage` - NVS persistence for credentials (ESP32 only)

pub mod config;
#[cfg(feature = "esp32")]
mod storage;

pub use config::{
    mask, AccessPointConfig, ConfigError, WifiConfig, MAX_PASSWORD_LEN, MAX_SSID_LEN,
    MIN_PASSWORD_LEN,
};
#[cfg(feature = "esp32")]
pub use storage::{
    clear_wifi_config, init_nvs, load_wifi_config, save_parameter, save_wifi_config,
};
