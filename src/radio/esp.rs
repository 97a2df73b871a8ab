//! ESP-IDF radio driver.
//!
//! [`EspRadio`] implements [`RadioDriver`] on top of `esp-idf-svc`'s
//! [`EspWifi`]. `set_mode` only switches the ESP-IDF WiFi mode; interface
//! settings are written by `configure_client` and `configure_access_point`
//! once the mode that carries them is active. Scans go straight to
//! `esp_wifi_scan_start` so the SSID filter, hidden networks and dwell times
//! of the [`ScanRequest`] reach the radio.
//!
//! [`EventSubscription`] registers a handler for `WIFI_EVENT` and `IP_EVENT`
//! on the default event loop. The handler receives a boxed channel sender as
//! its context argument and forwards every notification as a [`RawEvent`];
//! the main loop drains the receiving end and hands the events to an
//! [`EventBridge`](super::EventBridge). No global state is involved.

use super::events::{ip_event_id, wifi_event_id, RawEvent};
use super::{DriverError, IpInfo, MacAddress, RadioDriver, RadioMode, ScanRequest};
use crate::wifi::{AccessPointConfig, WifiConfig};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{
    AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, EspWifi,
};
use esp_idf_sys::{self as sys, esp, EspError};
use log::{debug, error, info, warn};
use std::ffi::{c_void, CString};
use std::net::Ipv4Addr;
use std::sync::mpsc::{self, Receiver, Sender};

/// netif key of the default access point interface.
const AP_NETIF_KEY: &[u8] = b"WIFI_AP_DEF\0";

/// WiFi driver backed by ESP-IDF.
pub struct EspRadio<'d> {
    wifi: EspWifi<'d>,
    mode: RadioMode,
    client: ClientConfiguration,
    access_point: AccessPointConfiguration,
}

impl<'d> EspRadio<'d> {
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: Option<EspDefaultNvsPartition>,
    ) -> Result<Self, EspError> {
        let wifi = EspWifi::new(modem, sysloop, nvs)?;
        Ok(Self {
            wifi,
            mode: RadioMode::Off,
            client: ClientConfiguration::default(),
            access_point: AccessPointConfiguration::default(),
        })
    }

    fn configuration(&self) -> Configuration {
        match self.mode {
            RadioMode::Off => Configuration::None,
            RadioMode::Client => Configuration::Client(self.client.clone()),
            RadioMode::AccessPoint => Configuration::AccessPoint(self.access_point.clone()),
            RadioMode::ClientAndAccessPoint => {
                Configuration::Mixed(self.client.clone(), self.access_point.clone())
            }
        }
    }

    fn apply(&mut self, operation: &'static str) -> Result<(), DriverError> {
        let configuration = self.configuration();
        self.wifi
            .set_configuration(&configuration)
            .map_err(|e| DriverError::esp(operation, e))
    }
}

fn wifi_mode(mode: RadioMode) -> sys::wifi_mode_t {
    match mode {
        RadioMode::Off => sys::wifi_mode_t_WIFI_MODE_NULL,
        RadioMode::Client => sys::wifi_mode_t_WIFI_MODE_STA,
        RadioMode::AccessPoint => sys::wifi_mode_t_WIFI_MODE_AP,
        RadioMode::ClientAndAccessPoint => sys::wifi_mode_t_WIFI_MODE_APSTA,
    }
}

/// `EspWifi` has no beacon setting, patch it into the stored AP config.
fn set_beacon_interval(interval: u16) -> Result<(), EspError> {
    unsafe {
        let mut config: sys::wifi_config_t = std::mem::zeroed();
        esp!(sys::esp_wifi_get_config(
            sys::wifi_interface_t_WIFI_IF_AP,
            &mut config
        ))?;
        config.ap.beacon_interval = interval;
        esp!(sys::esp_wifi_set_config(
            sys::wifi_interface_t_WIFI_IF_AP,
            &mut config
        ))
    }
}

fn record_ssid(record: &sys::wifi_ap_record_t) -> String {
    let len = record
        .ssid
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(record.ssid.len());
    String::from_utf8_lossy(&record.ssid[..len]).into_owned()
}

fn auth_method(open: bool) -> AuthMethod {
    if open {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    }
}

/// `esp_ip4_addr_t` stores the address in network byte order.
fn ipv4(addr: u32) -> Ipv4Addr {
    Ipv4Addr::from(addr.to_le_bytes())
}

fn ip_info_from_sys(info: &sys::esp_netif_ip_info_t) -> IpInfo {
    IpInfo::new(ipv4(info.ip.addr), ipv4(info.netmask.addr), ipv4(info.gw.addr))
}

impl RadioDriver for EspRadio<'_> {
    fn init(&mut self) -> Result<(), DriverError> {
        // The driver is initialized by EspWifi::new
        Ok(())
    }

    fn set_mode(&mut self, mode: RadioMode) -> Result<(), DriverError> {
        esp!(unsafe { sys::esp_wifi_set_mode(wifi_mode(mode)) })
            .map_err(|e| DriverError::esp("set_mode", e))?;
        self.mode = mode;
        Ok(())
    }

    fn start(&mut self) -> Result<(), DriverError> {
        if self.mode == RadioMode::Off {
            return Ok(());
        }
        self.wifi.start().map_err(|e| DriverError::esp("start", e))
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.wifi.stop().map_err(|e| DriverError::esp("stop", e))
    }

    fn configure_client(&mut self, config: &WifiConfig) -> Result<(), DriverError> {
        let invalid = || DriverError::new("configure_client", sys::ESP_ERR_INVALID_ARG);
        self.client = ClientConfiguration {
            ssid: config.ssid.as_str().try_into().map_err(|_| invalid())?,
            password: config.password.as_str().try_into().map_err(|_| invalid())?,
            auth_method: auth_method(config.is_open()),
            ..Default::default()
        };
        self.apply("configure_client")
    }

    fn configure_access_point(&mut self, config: &AccessPointConfig) -> Result<(), DriverError> {
        let invalid = || DriverError::new("configure_access_point", sys::ESP_ERR_INVALID_ARG);
        self.access_point = AccessPointConfiguration {
            ssid: config.ssid.as_str().try_into().map_err(|_| invalid())?,
            password: config.password.as_str().try_into().map_err(|_| invalid())?,
            auth_method: if config.is_open() {
                AuthMethod::None
            } else {
                AuthMethod::WPAWPA2Personal
            },
            channel: config.channel,
            max_connections: config.max_connections as u16,
            ..Default::default()
        };
        self.apply("configure_access_point")?;
        set_beacon_interval(config.beacon_interval)
            .map_err(|e| DriverError::esp("configure_access_point", e))
    }

    fn connect(&mut self) -> Result<(), DriverError> {
        self.wifi.connect().map_err(|e| DriverError::esp("connect", e))
    }

    fn scan(&mut self, request: &ScanRequest) -> Result<u16, DriverError> {
        let ssid = request
            .ssid
            .as_deref()
            .map(CString::new)
            .transpose()
            .map_err(|_| DriverError::new("scan", sys::ESP_ERR_INVALID_ARG))?;

        let config = sys::wifi_scan_config_t {
            ssid: ssid
                .as_ref()
                .map_or(std::ptr::null_mut(), |s| s.as_ptr() as *mut u8),
            bssid: std::ptr::null_mut(),
            channel: 0,
            show_hidden: request.show_hidden,
            scan_type: sys::wifi_scan_type_t_WIFI_SCAN_TYPE_ACTIVE,
            scan_time: sys::wifi_scan_time_t {
                active: sys::wifi_active_scan_time_t {
                    min: request.active_min_ms,
                    max: request.active_max_ms,
                },
                passive: 0,
            },
            ..Default::default()
        };

        let mut found: u16 = 0;
        let mut records: Vec<sys::wifi_ap_record_t> = Vec::new();
        unsafe {
            esp!(sys::esp_wifi_scan_start(&config, true))
                .map_err(|e| DriverError::esp("scan", e))?;
            esp!(sys::esp_wifi_scan_get_ap_num(&mut found))
                .map_err(|e| DriverError::esp("scan", e))?;

            if found > 0 {
                records.resize_with(found as usize, Default::default);
                let mut fetched = found;
                esp!(sys::esp_wifi_scan_get_ap_records(
                    &mut fetched,
                    records.as_mut_ptr()
                ))
                .map_err(|e| DriverError::esp("scan", e))?;
                records.truncate(fetched as usize);
            }
        }

        // The driver already filtered; this also drops hidden entries it kept
        let count = records
            .iter()
            .filter(|record| request.matches(&record_ssid(record)))
            .count();
        debug!("Scan saw {} network(s), {} matched", found, count);
        Ok(count.min(u16::MAX as usize) as u16)
    }

    fn station_ip_info(&self) -> Result<IpInfo, DriverError> {
        let info = self
            .wifi
            .sta_netif()
            .get_ip_info()
            .map_err(|e| DriverError::esp("station_ip_info", e))?;
        Ok(IpInfo::new(
            info.ip,
            Ipv4Addr::from(info.subnet.mask),
            info.subnet.gateway,
        ))
    }

    fn station_mac(&self) -> Result<MacAddress, DriverError> {
        self.wifi
            .sta_netif()
            .get_mac()
            .map(MacAddress)
            .map_err(|e| DriverError::esp("station_mac", e))
    }

    fn rssi(&self) -> Result<i8, DriverError> {
        let mut record = sys::wifi_ap_record_t::default();
        esp!(unsafe { sys::esp_wifi_sta_get_ap_info(&mut record) })
            .map_err(|e| DriverError::esp("rssi", e))?;
        Ok(record.rssi)
    }
}

/// Address of the access point interface, read from its netif.
unsafe fn access_point_ip_info() -> Option<IpInfo> {
    let netif = sys::esp_netif_get_handle_from_ifkey(AP_NETIF_KEY.as_ptr() as *const _);
    if netif.is_null() {
        return None;
    }
    let mut info = sys::esp_netif_ip_info_t::default();
    if sys::esp_netif_get_ip_info(netif, &mut info) != sys::ESP_OK {
        return None;
    }
    Some(ip_info_from_sys(&info))
}

unsafe extern "C" fn forward_event(
    arg: *mut c_void,
    event_base: sys::esp_event_base_t,
    event_id: i32,
    event_data: *mut c_void,
) {
    if arg.is_null() {
        return;
    }
    let sender = &*(arg as *const Sender<RawEvent>);

    let event = if event_base == sys::WIFI_EVENT {
        let event = RawEvent::wifi(event_id);
        if event_id == wifi_event_id::AP_START {
            match access_point_ip_info() {
                Some(info) => event.with_ip_info(info),
                None => event,
            }
        } else {
            event
        }
    } else if event_base == sys::IP_EVENT {
        let event = RawEvent::ip(event_id);
        if event_id == ip_event_id::STA_GOT_IP && !event_data.is_null() {
            let got_ip = &*(event_data as *const sys::ip_event_got_ip_t);
            event.with_ip_info(ip_info_from_sys(&got_ip.ip_info))
        } else {
            event
        }
    } else {
        return;
    };

    if sender.send(event).is_err() {
        warn!("Radio event dropped, receiver gone");
    }
}

/// Registration of [`forward_event`] on the default event loop.
///
/// Unregisters on drop.
pub struct EventSubscription {
    context: *mut Sender<RawEvent>,
}

impl EventSubscription {
    /// Register for WiFi and IP events. Events arrive on the returned receiver.
    pub fn register() -> Result<(Self, Receiver<RawEvent>), EspError> {
        let (sender, receiver) = mpsc::channel();
        let context = Box::into_raw(Box::new(sender));
        let subscription = Self { context };

        unsafe {
            esp!(sys::esp_event_handler_register(
                sys::WIFI_EVENT,
                sys::ESP_EVENT_ANY_ID,
                Some(forward_event),
                context as *mut c_void,
            ))?;
            esp!(sys::esp_event_handler_register(
                sys::IP_EVENT,
                sys::ESP_EVENT_ANY_ID,
                Some(forward_event),
                context as *mut c_void,
            ))?;
        }

        info!("Radio event handler registered");
        Ok((subscription, receiver))
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        unsafe {
            for base in [sys::WIFI_EVENT, sys::IP_EVENT] {
                if let Err(e) = esp!(sys::esp_event_handler_unregister(
                    base,
                    sys::ESP_EVENT_ANY_ID,
                    Some(forward_event),
                )) {
                    error!("Unregistering radio event handler: {}", e);
                }
            }
            drop(Box::from_raw(self.context));
        }
    }
}
