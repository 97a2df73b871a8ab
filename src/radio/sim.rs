//! Simulated radio driver.
//!
//! Behaves like the ESP-IDF WiFi stack closely enough to run the whole
//! provisioning flow on a host: mode changes while started bring interfaces
//! up and down, and every such change queues the [`RawEvent`] the real stack
//! would post. Drain them with [`SimulatedRadio::take_events`] and feed them
//! to an [`EventBridge`](super::EventBridge).
//!
//! Any driver operation can be made to fail with [`SimulatedRadio::fail_on`].

use super::events::{ip_event_id, wifi_event_id, RawEvent};
use super::{DriverError, IpInfo, MacAddress, RadioDriver, RadioMode, ScanRequest};
use crate::wifi::{AccessPointConfig, WifiConfig};
use log::debug;
use std::collections::VecDeque;
use std::net::Ipv4Addr;

/// Error code reported by injected failures (`ESP_FAIL`).
pub const SIMULATED_FAILURE: i32 = -1;

/// Default address of the simulated access point.
pub const SIMULATED_AP_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);

/// Address leased to the simulated station.
pub const SIMULATED_STATION_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);

/// Host-side stand-in for the WiFi driver.
#[derive(Debug, Default)]
pub struct SimulatedRadio {
    mode: RadioMode,
    started: bool,
    station_up: bool,
    access_point_up: bool,
    associated: bool,
    client: Option<WifiConfig>,
    access_point: Option<AccessPointConfig>,
    networks: Vec<String>,
    failing: Vec<&'static str>,
    calls: Vec<&'static str>,
    events: VecDeque<RawEvent>,
    last_scan_mode: Option<RadioMode>,
}

impl SimulatedRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a network visible to scans. An empty SSID is a hidden network.
    pub fn add_network(&mut self, ssid: &str) {
        self.networks.push(ssid.to_string());
    }

    /// Make every later call of `operation` fail.
    pub fn fail_on(&mut self, operation: &'static str) {
        self.failing.push(operation);
    }

    /// Undo [`Self::fail_on`].
    pub fn recover(&mut self, operation: &'static str) {
        self.failing.retain(|op| *op != operation);
    }

    /// Mode the driver is actually in.
    pub fn mode(&self) -> RadioMode {
        self.mode
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Mode the driver was in during the most recent scan.
    pub fn last_scan_mode(&self) -> Option<RadioMode> {
        self.last_scan_mode
    }

    /// Driver operations in call order.
    pub fn calls(&self) -> &[&'static str] {
        &self.calls
    }

    pub fn client_config(&self) -> Option<&WifiConfig> {
        self.client.as_ref()
    }

    pub fn access_point_config(&self) -> Option<&AccessPointConfig> {
        self.access_point.as_ref()
    }

    /// Drain the queued notifications.
    pub fn take_events(&mut self) -> Vec<RawEvent> {
        self.events.drain(..).collect()
    }

    pub fn access_point_info() -> IpInfo {
        IpInfo::new(
            SIMULATED_AP_ADDRESS,
            Ipv4Addr::new(255, 255, 255, 0),
            SIMULATED_AP_ADDRESS,
        )
    }

    fn station_info() -> IpInfo {
        IpInfo::new(
            SIMULATED_STATION_ADDRESS,
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(192, 168, 1, 1),
        )
    }

    fn call(&mut self, operation: &'static str) -> Result<(), DriverError> {
        self.calls.push(operation);
        if self.failing.contains(&operation) {
            debug!("simulated {} failure", operation);
            return Err(DriverError::new(operation, SIMULATED_FAILURE));
        }
        Ok(())
    }

    /// Bring interfaces in line with the mode, posting events for changes.
    fn sync_interfaces(&mut self) {
        let want_station = self.started && self.mode.has_client();
        let want_access_point = self.started && self.mode.has_access_point();

        if want_station != self.station_up {
            self.station_up = want_station;
            if want_station {
                self.events.push_back(RawEvent::wifi(wifi_event_id::STA_START));
            } else {
                if self.associated {
                    self.associated = false;
                    self.events
                        .push_back(RawEvent::wifi(wifi_event_id::STA_DISCONNECTED));
                }
                self.events.push_back(RawEvent::wifi(wifi_event_id::STA_STOP));
            }
        }

        if want_access_point != self.access_point_up {
            self.access_point_up = want_access_point;
            if want_access_point {
                self.events.push_back(
                    RawEvent::wifi(wifi_event_id::AP_START).with_ip_info(Self::access_point_info()),
                );
            } else {
                self.events.push_back(RawEvent::wifi(wifi_event_id::AP_STOP));
            }
        }
    }
}

impl RadioDriver for SimulatedRadio {
    fn init(&mut self) -> Result<(), DriverError> {
        self.call("init")
    }

    fn set_mode(&mut self, mode: RadioMode) -> Result<(), DriverError> {
        self.call("set_mode")?;
        self.mode = mode;
        self.sync_interfaces();
        Ok(())
    }

    fn start(&mut self) -> Result<(), DriverError> {
        self.call("start")?;
        self.started = true;
        self.sync_interfaces();
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.call("stop")?;
        self.started = false;
        self.sync_interfaces();
        Ok(())
    }

    fn configure_client(&mut self, config: &WifiConfig) -> Result<(), DriverError> {
        self.call("configure_client")?;
        self.client = Some(config.clone());
        Ok(())
    }

    fn configure_access_point(&mut self, config: &AccessPointConfig) -> Result<(), DriverError> {
        self.call("configure_access_point")?;
        self.access_point = Some(config.clone());
        Ok(())
    }

    fn connect(&mut self) -> Result<(), DriverError> {
        self.call("connect")?;

        let reachable = self
            .client
            .as_ref()
            .map(|c| self.networks.iter().any(|n| *n == c.ssid))
            .unwrap_or(false);

        if self.station_up && reachable {
            self.associated = true;
            self.events.push_back(
                RawEvent::ip(ip_event_id::STA_GOT_IP).with_ip_info(Self::station_info()),
            );
        } else {
            self.events
                .push_back(RawEvent::wifi(wifi_event_id::STA_DISCONNECTED));
        }
        Ok(())
    }

    fn scan(&mut self, request: &ScanRequest) -> Result<u16, DriverError> {
        self.last_scan_mode = Some(self.mode);
        self.call("scan")?;
        if !self.station_up {
            return Err(DriverError::new("scan", SIMULATED_FAILURE));
        }
        let count = self.networks.iter().filter(|n| request.matches(n)).count();
        Ok(count.min(u16::MAX as usize) as u16)
    }

    fn station_ip_info(&self) -> Result<IpInfo, DriverError> {
        if self.associated {
            Ok(Self::station_info())
        } else {
            Ok(IpInfo::unspecified())
        }
    }

    fn station_mac(&self) -> Result<MacAddress, DriverError> {
        Ok(MacAddress([0x24, 0x0A, 0xC4, 0x12, 0x34, 0x56]))
    }

    fn rssi(&self) -> Result<i8, DriverError> {
        if self.associated {
            Ok(-52)
        } else {
            Err(DriverError::new("rssi", SIMULATED_FAILURE))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_access_point_posts_event() {
        let mut radio = SimulatedRadio::new();
        radio.set_mode(RadioMode::AccessPoint).unwrap();
        assert!(radio.take_events().is_empty());

        radio.start().unwrap();
        let events = radio.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, wifi_event_id::AP_START);
        assert_eq!(events[0].ip_info, Some(SimulatedRadio::access_point_info()));
    }

    #[test]
    fn test_mode_change_while_started() {
        let mut radio = SimulatedRadio::new();
        radio.set_mode(RadioMode::AccessPoint).unwrap();
        radio.start().unwrap();
        radio.take_events();

        radio.set_mode(RadioMode::ClientAndAccessPoint).unwrap();
        radio.set_mode(RadioMode::AccessPoint).unwrap();
        let ids: Vec<i32> = radio.take_events().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![wifi_event_id::STA_START, wifi_event_id::STA_STOP]);
    }

    #[test]
    fn test_connect_known_network() {
        let mut radio = SimulatedRadio::new();
        radio.add_network("HomeNet");
        radio
            .configure_client(&WifiConfig::new("HomeNet", "password123").unwrap())
            .unwrap();
        radio.set_mode(RadioMode::Client).unwrap();
        radio.start().unwrap();
        radio.connect().unwrap();

        let events = radio.take_events();
        assert_eq!(events.last().map(|e| e.id), Some(ip_event_id::STA_GOT_IP));
        assert_eq!(radio.station_ip_info().unwrap().ip, SIMULATED_STATION_ADDRESS);
        assert!(radio.rssi().is_ok());
    }

    #[test]
    fn test_connect_unknown_network() {
        let mut radio = SimulatedRadio::new();
        radio
            .configure_client(&WifiConfig::open("Nowhere").unwrap())
            .unwrap();
        radio.set_mode(RadioMode::Client).unwrap();
        radio.start().unwrap();
        radio.connect().unwrap();

        let events = radio.take_events();
        assert_eq!(
            events.last().map(|e| e.id),
            Some(wifi_event_id::STA_DISCONNECTED)
        );
    }

    #[test]
    fn test_injected_failure() {
        let mut radio = SimulatedRadio::new();
        radio.fail_on("start");
        assert_eq!(
            radio.start(),
            Err(DriverError::new("start", SIMULATED_FAILURE))
        );
        radio.recover("start");
        assert!(radio.start().is_ok());
        assert_eq!(radio.calls(), &["start", "start"]);
    }
}
