//! Event bridge.
//!
//! The radio stack reports what happens through numeric event ids grouped by
//! an event base (WiFi or IP). [`EventBridge`] turns those into the closed
//! set of [`WifiEvent`]s and hands each one to its single registered
//! listener, synchronously, on the thread that delivered the raw event.
//! Event ids it does not know are logged and dropped.

use super::IpInfo;
use log::{debug, info, warn};

/// ESP-IDF `wifi_event_t` ids.
pub mod wifi_event_id {
    pub const WIFI_READY: i32 = 0;
    pub const SCAN_DONE: i32 = 1;
    pub const STA_START: i32 = 2;
    pub const STA_STOP: i32 = 3;
    pub const STA_CONNECTED: i32 = 4;
    pub const STA_DISCONNECTED: i32 = 5;
    pub const STA_AUTHMODE_CHANGE: i32 = 6;
    pub const STA_WPS_ER_SUCCESS: i32 = 7;
    pub const STA_WPS_ER_FAILED: i32 = 8;
    pub const STA_WPS_ER_TIMEOUT: i32 = 9;
    pub const STA_WPS_ER_PIN: i32 = 10;
    pub const STA_WPS_ER_PBC_OVERLAP: i32 = 11;
    pub const AP_START: i32 = 12;
    pub const AP_STOP: i32 = 13;
    pub const AP_STACONNECTED: i32 = 14;
    pub const AP_STADISCONNECTED: i32 = 15;
    pub const AP_PROBEREQRECVED: i32 = 16;
}

/// ESP-IDF `ip_event_t` ids.
pub mod ip_event_id {
    pub const STA_GOT_IP: i32 = 0;
    pub const STA_LOST_IP: i32 = 1;
    pub const AP_STAIPASSIGNED: i32 = 2;
    pub const GOT_IP6: i32 = 3;
    pub const ETH_GOT_IP: i32 = 4;
    pub const ETH_LOST_IP: i32 = 5;
}

/// Name of a WiFi event id, for logs.
pub fn wifi_event_name(id: i32) -> &'static str {
    use wifi_event_id::*;
    match id {
        WIFI_READY => "WIFI_EVENT_WIFI_READY",
        SCAN_DONE => "WIFI_EVENT_SCAN_DONE",
        STA_START => "WIFI_EVENT_STA_START",
        STA_STOP => "WIFI_EVENT_STA_STOP",
        STA_CONNECTED => "WIFI_EVENT_STA_CONNECTED",
        STA_DISCONNECTED => "WIFI_EVENT_STA_DISCONNECTED",
        STA_AUTHMODE_CHANGE => "WIFI_EVENT_STA_AUTHMODE_CHANGE",
        STA_WPS_ER_SUCCESS => "WIFI_EVENT_STA_WPS_ER_SUCCESS",
        STA_WPS_ER_FAILED => "WIFI_EVENT_STA_WPS_ER_FAILED",
        STA_WPS_ER_TIMEOUT => "WIFI_EVENT_STA_WPS_ER_TIMEOUT",
        STA_WPS_ER_PIN => "WIFI_EVENT_STA_WPS_ER_PIN",
        STA_WPS_ER_PBC_OVERLAP => "WIFI_EVENT_STA_WPS_ER_PBC_OVERLAP",
        AP_START => "WIFI_EVENT_AP_START",
        AP_STOP => "WIFI_EVENT_AP_STOP",
        AP_STACONNECTED => "WIFI_EVENT_AP_STACONNECTED",
        AP_STADISCONNECTED => "WIFI_EVENT_AP_STADISCONNECTED",
        AP_PROBEREQRECVED => "WIFI_EVENT_AP_PROBEREQRECVED",
        _ => "UNKNOWN",
    }
}

/// Name of an IP event id, for logs.
pub fn ip_event_name(id: i32) -> &'static str {
    use ip_event_id::*;
    match id {
        STA_GOT_IP => "IP_EVENT_STA_GOT_IP",
        STA_LOST_IP => "IP_EVENT_STA_LOST_IP",
        AP_STAIPASSIGNED => "IP_EVENT_AP_STAIPASSIGNED",
        GOT_IP6 => "IP_EVENT_GOT_IP6",
        ETH_GOT_IP => "IP_EVENT_ETH_GOT_IP",
        ETH_LOST_IP => "IP_EVENT_ETH_LOST_IP",
        _ => "UNKNOWN",
    }
}

/// Which event family a raw id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventBase {
    Wifi,
    Ip,
}

/// A notification exactly as the radio stack delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub base: EventBase,
    pub id: i32,
    /// Address info attached by the driver: the AP address for
    /// `AP_START`, the leased address for `STA_GOT_IP`.
    pub ip_info: Option<IpInfo>,
}

impl RawEvent {
    pub fn wifi(id: i32) -> Self {
        Self {
            base: EventBase::Wifi,
            id,
            ip_info: None,
        }
    }

    pub fn ip(id: i32) -> Self {
        Self {
            base: EventBase::Ip,
            id,
            ip_info: None,
        }
    }

    pub fn with_ip_info(mut self, ip_info: IpInfo) -> Self {
        self.ip_info = Some(ip_info);
        self
    }

    pub fn name(&self) -> &'static str {
        match self.base {
            EventBase::Wifi => wifi_event_name(self.id),
            EventBase::Ip => ip_event_name(self.id),
        }
    }
}

/// Radio events the rest of the system reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiEvent {
    /// The station interface is up.
    StationStarted,
    /// The access point is beaconing with the given address.
    AccessPointStarted(IpInfo),
    /// The access point is gone.
    AccessPointStopped,
    /// The station joined a network and got an address.
    NetworkConnected(IpInfo),
    /// The station could not join, or lost, its network.
    NetworkDisconnected,
}

/// Receiver of [`WifiEvent`]s.
pub trait WifiEventListener {
    fn handle_wifi_event(&mut self, event: WifiEvent);
}

/// Translates [`RawEvent`]s for exactly one listener.
///
/// The bridge owns its listener; registering another one hands the previous
/// listener back. It also remembers the address info of the last
/// connect / AP start until the matching disconnect / AP stop.
pub struct EventBridge<L: WifiEventListener> {
    listener: L,
    station_started: bool,
    station_address: Option<IpInfo>,
    access_point_address: Option<IpInfo>,
}

impl<L: WifiEventListener> EventBridge<L> {
    pub fn new(listener: L) -> Self {
        Self {
            listener,
            station_started: false,
            station_address: None,
            access_point_address: None,
        }
    }

    /// Register a new listener, returning the old one.
    pub fn register(&mut self, listener: L) -> L {
        std::mem::replace(&mut self.listener, listener)
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    pub fn into_listener(self) -> L {
        self.listener
    }

    pub fn station_started(&self) -> bool {
        self.station_started
    }

    /// Address of the station while connected.
    pub fn station_address(&self) -> Option<IpInfo> {
        self.station_address
    }

    /// Address of the access point while it runs.
    pub fn access_point_address(&self) -> Option<IpInfo> {
        self.access_point_address
    }

    /// Translate `raw` and deliver it. Returns the delivered event, if any.
    pub fn deliver(&mut self, raw: &RawEvent) -> Option<WifiEvent> {
        info!("{}", raw.name());

        let event = match self.translate(raw) {
            Some(event) => event,
            None => return None,
        };

        match event {
            WifiEvent::StationStarted => self.station_started = true,
            WifiEvent::AccessPointStarted(info) => self.access_point_address = Some(info),
            WifiEvent::AccessPointStopped => self.access_point_address = None,
            WifiEvent::NetworkConnected(info) => {
                info!("got ip: {}", info.ip);
                self.station_address = Some(info);
            }
            WifiEvent::NetworkDisconnected => self.station_address = None,
        }

        self.listener.handle_wifi_event(event);
        Some(event)
    }

    fn translate(&self, raw: &RawEvent) -> Option<WifiEvent> {
        match raw.base {
            EventBase::Wifi => match raw.id {
                wifi_event_id::STA_START => Some(WifiEvent::StationStarted),
                wifi_event_id::AP_START => Some(WifiEvent::AccessPointStarted(
                    raw.ip_info.unwrap_or_else(IpInfo::unspecified),
                )),
                wifi_event_id::AP_STOP => Some(WifiEvent::AccessPointStopped),
                wifi_event_id::STA_DISCONNECTED => Some(WifiEvent::NetworkDisconnected),
                // A station joined our AP; the TLS listener sees the client itself
                wifi_event_id::AP_STACONNECTED => {
                    debug!("Station associated with access point");
                    None
                }
                id => {
                    warn!("WIFI_EVENT not handled: {}", wifi_event_name(id));
                    None
                }
            },
            EventBase::Ip => match raw.id {
                ip_event_id::STA_GOT_IP => match raw.ip_info {
                    Some(info) => Some(WifiEvent::NetworkConnected(info)),
                    None => {
                        warn!("IP_EVENT_STA_GOT_IP without address info");
                        None
                    }
                },
                ip_event_id::STA_LOST_IP => Some(WifiEvent::NetworkDisconnected),
                id => {
                    warn!("IP_EVENT not handled: {}", ip_event_name(id));
                    None
                }
            },
        }
    }
}
