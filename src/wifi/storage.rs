//! NVS persistence for WiFi credentials and provisioned parameters.
//!
//! This module stores what a configuration client sent in ESP32's
//! Non-Volatile Storage (NVS) so it persists across reboots.

use super::config::{WifiConfig, MAX_PASSWORD_LEN, MAX_SSID_LEN};
use crate::provisioning::ConfigValue;
use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
use esp_idf_sys::EspError;
use log::warn;

/// NVS namespace for WiFi configuration.
const NVS_NAMESPACE: &str = "wifi_config";

/// NVS key for stored credentials.
const NVS_KEY: &str = "credentials";

/// NVS keys are limited to 15 characters.
const MAX_NVS_KEY_LEN: usize = 15;

/// Format: [ssid_len:1][ssid:32][password_len:1][password:64] = 98 bytes.
const MAX_CONFIG_BUFFER_SIZE: usize = 1 + MAX_SSID_LEN + 1 + MAX_PASSWORD_LEN + 4;

/// Load WiFi configuration from NVS.
///
/// Returns `None` if no configuration is stored or if it's corrupted.
pub fn load_wifi_config(nvs: &EspNvs<NvsDefault>) -> Option<WifiConfig> {
    let mut buf = [0u8; MAX_CONFIG_BUFFER_SIZE];
    let bytes = nvs.get_raw(NVS_KEY, &mut buf).ok()??;
    WifiConfig::from_bytes(bytes).ok()
}

/// Save WiFi configuration to NVS.
pub fn save_wifi_config(nvs: &mut EspNvs<NvsDefault>, config: &WifiConfig) -> Result<(), EspError> {
    let bytes = zeroize::Zeroizing::new(config.to_bytes());
    nvs.set_raw(NVS_KEY, &bytes)?;
    Ok(())
}

/// Clear stored WiFi configuration from NVS.
pub fn clear_wifi_config(nvs: &mut EspNvs<NvsDefault>) -> Result<(), EspError> {
    nvs.remove(NVS_KEY)?;
    Ok(())
}

/// Store one provisioned parameter under its own key.
///
/// Returns `Ok(false)` if the name cannot be used as an NVS key.
pub fn save_parameter(
    nvs: &mut EspNvs<NvsDefault>,
    name: &str,
    value: &ConfigValue,
) -> Result<bool, EspError> {
    if name.is_empty() || name.len() > MAX_NVS_KEY_LEN || name == NVS_KEY {
        warn!("Skipping parameter '{}': not a valid NVS key", name);
        return Ok(false);
    }

    match value {
        ConfigValue::Text(s) => nvs.set_str(name, s)?,
        ConfigValue::Number(n) => nvs.set_u64(name, n.to_bits())?,
        ConfigValue::Flag(b) => nvs.set_u8(name, u8::from(*b))?,
    }
    Ok(true)
}

/// Open the WiFi configuration namespace on an already taken partition.
///
/// The radio driver needs the same partition, so it is taken once by the
/// caller and cloned.
pub fn init_nvs(partition: EspNvsPartition<NvsDefault>) -> Result<EspNvs<NvsDefault>, EspError> {
    EspNvs::new(partition, NVS_NAMESPACE, true)
}
