//! Radio mode controller.
//!
//! [`ModeController`] is the only place that decides which [`RadioMode`] the
//! driver is in. Every transition is computed from the recorded mode, applied
//! to the driver, and recorded only once the driver accepted it.
//!
//! Scanning is the one excursion: the radio temporarily gains a station
//! interface and is always put back afterwards, whether the scan worked or
//! not.
//!
//! # Example
//!
//! ```
//! use wifi_provision_esp32::radio::{ModeController, RadioMode, SimulatedRadio};
//! use wifi_provision_esp32::wifi::AccessPointConfig;
//!
//! let mut radio = ModeController::new(SimulatedRadio::new());
//! radio.init().unwrap();
//!
//! let ap = AccessPointConfig::new("Device-Setup", "").unwrap();
//! radio.enter_access_point_mode(&ap).unwrap();
//! assert_eq!(radio.mode(), RadioMode::AccessPoint);
//!
//! // The scan borrows the station interface and gives it back.
//! let found = radio.scan(Some("Device-Setup"), true).unwrap();
//! assert_eq!(found, 0);
//! assert_eq!(radio.mode(), RadioMode::AccessPoint);
//! ```

use super::{DriverError, IpInfo, MacAddress, RadioDriver, RadioError, RadioMode, ScanRequest};
use crate::wifi::{mask, AccessPointConfig, WifiConfig};
use log::{debug, error, info, warn};

/// Mode to restore once a scan is over.
///
/// Lives only for the duration of one [`ModeController::scan`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanContext {
    pub prior_mode: RadioMode,
}

/// Owns the radio driver and the recorded operating mode.
pub struct ModeController<D: RadioDriver> {
    driver: D,
    mode: RadioMode,
    initialized: bool,
}

impl<D: RadioDriver> ModeController<D> {
    /// Wrap a driver. The radio starts out [`RadioMode::Off`].
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            mode: RadioMode::Off,
            initialized: false,
        }
    }

    /// Initialize the driver and power the radio down.
    pub fn init(&mut self) -> Result<(), RadioError> {
        if self.initialized {
            return Err(RadioError::AlreadyInitialized);
        }

        self.driver.init().map_err(|e| log_driver_error("init", e))?;

        // A failure here leaves the driver in its power-on mode, which is off
        if let Err(e) = self.driver.set_mode(RadioMode::Off) {
            warn!("init: {}", e);
        }

        self.mode = RadioMode::Off;
        self.initialized = true;
        info!("Radio initialized");
        Ok(())
    }

    /// Current recorded mode.
    pub fn mode(&self) -> RadioMode {
        self.mode
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Join a network as a client.
    ///
    /// Adds the station interface to the current mode. Association itself
    /// completes asynchronously and is reported through the event bridge, so
    /// a rejected association request is logged but not returned.
    pub fn enter_client_mode(&mut self, config: &WifiConfig) -> Result<(), RadioError> {
        self.ensure_initialized()?;

        let target = self.mode.with_client();
        info!(
            "Connecting to '{}' (password {}), mode {} -> {}",
            config.ssid,
            mask(&config.password),
            self.mode,
            target
        );

        self.transition(target, |driver| {
            driver.configure_client(config)?;
            driver.start()
        })?;

        if let Err(e) = self.driver.connect() {
            error!("enter_client_mode: {}", e);
        }

        Ok(())
    }

    /// Host an access point.
    ///
    /// Adds the access point interface to the current mode. Fails if an
    /// access point is already active.
    pub fn enter_access_point_mode(&mut self, config: &AccessPointConfig) -> Result<(), RadioError> {
        self.ensure_initialized()?;

        if self.mode.has_access_point() {
            return Err(RadioError::AccessPointActive);
        }

        let target = self.mode.with_access_point();
        info!(
            "Starting access point '{}' ({}), mode {} -> {}",
            config.ssid,
            if config.is_open() { "open" } else { "WPA/WPA2" },
            self.mode,
            target
        );

        self.transition(target, |driver| {
            driver.configure_access_point(config)?;
            driver.start()
        })
    }

    /// Stop hosting the access point.
    ///
    /// `AccessPoint` powers the radio down completely, `ClientAndAccessPoint`
    /// keeps the station running.
    pub fn leave_access_point_mode(&mut self) -> Result<(), RadioError> {
        self.ensure_initialized()?;

        let target = self
            .mode
            .without_access_point()
            .ok_or(RadioError::NoAccessPoint)?;

        info!("Stopping access point, mode {} -> {}", self.mode, target);

        self.driver
            .set_mode(target)
            .map_err(|e| log_driver_error("leave_access_point_mode", e))?;
        self.mode = target;

        if target == RadioMode::Off {
            if let Err(e) = self.driver.stop() {
                error!("leave_access_point_mode: {}", e);
            }
        }

        Ok(())
    }

    /// Scan for networks and return how many matched.
    ///
    /// An empty or absent `ssid` counts every network. The mode recorded
    /// before the call is restored afterwards even if the scan failed.
    pub fn scan(&mut self, ssid: Option<&str>, show_hidden: bool) -> Result<u16, RadioError> {
        self.ensure_initialized()?;

        let request = ScanRequest::new(ssid, show_hidden);
        if let Some(ssid) = &request.ssid {
            info!("Scanning for ssid: {}", ssid);
        }

        let context = self.prepare_for_scan()?;
        let result = self.driver.scan(&request);
        if !self.recover_from_scan(context) {
            warn!("Driver may not be back in {} after scan", self.mode);
        }

        match result {
            Ok(count) => {
                debug!("Scan found {} network(s)", count);
                Ok(count)
            }
            Err(e) => Err(log_driver_error("scan", e)),
        }
    }

    /// IPv4 configuration of the station interface.
    pub fn station_ip_info(&self) -> Result<IpInfo, RadioError> {
        self.ensure_initialized()?;
        Ok(self.driver.station_ip_info()?)
    }

    /// Hardware address of the station interface.
    pub fn station_mac(&self) -> Result<MacAddress, RadioError> {
        Ok(self.driver.station_mac()?)
    }

    /// Signal strength of the associated network.
    pub fn rssi(&self) -> Result<i8, RadioError> {
        self.ensure_initialized()?;
        Ok(self.driver.rssi()?)
    }

    fn ensure_initialized(&self) -> Result<(), RadioError> {
        if self.initialized {
            Ok(())
        } else {
            error!("Radio is not initialized");
            Err(RadioError::NotInitialized)
        }
    }

    /// Apply `target`, run `configure`, and record the mode on success.
    ///
    /// On failure the driver is put back into the recorded mode.
    fn transition<F>(&mut self, target: RadioMode, configure: F) -> Result<(), RadioError>
    where
        F: FnOnce(&mut D) -> Result<(), DriverError>,
    {
        let previous = self.mode;

        self.driver
            .set_mode(target)
            .map_err(|e| log_driver_error("transition", e))?;

        if let Err(e) = configure(&mut self.driver) {
            if let Err(revert) = self.driver.set_mode(previous) {
                error!("Failed to revert radio to {}: {}", previous, revert);
            }
            return Err(log_driver_error("transition", e));
        }

        self.mode = target;
        Ok(())
    }

    fn prepare_for_scan(&mut self) -> Result<ScanContext, RadioError> {
        let context = ScanContext {
            prior_mode: self.mode,
        };

        match self.mode {
            RadioMode::Off => {
                self.driver
                    .set_mode(RadioMode::Client)
                    .map_err(|e| log_driver_error("prepare_for_scan", e))?;

                // Coming from off, the radio was not started yet
                if let Err(e) = self.driver.start() {
                    error!("prepare_for_scan: {}", e);
                }
            }
            RadioMode::AccessPoint => {
                self.driver
                    .set_mode(RadioMode::ClientAndAccessPoint)
                    .map_err(|e| log_driver_error("prepare_for_scan", e))?;
            }
            RadioMode::Client | RadioMode::ClientAndAccessPoint => {}
        }

        Ok(context)
    }

    /// Put the driver back into the mode held before the scan.
    ///
    /// Only `Off` and `AccessPoint` were changed by [`Self::prepare_for_scan`].
    fn recover_from_scan(&mut self, context: ScanContext) -> bool {
        let target = context.prior_mode;
        if !matches!(target, RadioMode::Off | RadioMode::AccessPoint) {
            return true;
        }

        let mut recovered = true;

        if let Err(e) = self.driver.set_mode(target) {
            error!("recover_from_scan: {}", e);
            recovered = false;
        }

        if target == RadioMode::Off {
            if let Err(e) = self.driver.stop() {
                error!("recover_from_scan: {}", e);
                recovered = false;
            }
        }

        recovered
    }
}

fn log_driver_error(context: &str, e: DriverError) -> RadioError {
    error!("{}: {}", context, e);
    RadioError::Driver(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::sim::SimulatedRadio;

    fn controller() -> ModeController<SimulatedRadio> {
        let mut radio = ModeController::new(SimulatedRadio::new());
        radio.init().unwrap();
        radio
    }

    fn client_config() -> WifiConfig {
        WifiConfig::new("HomeNet", "password123").unwrap()
    }

    fn ap_config() -> AccessPointConfig {
        AccessPointConfig::new("Device-Setup", "").unwrap()
    }

    /// Bring a controller into `mode` through the public API.
    fn controller_in(mode: RadioMode) -> ModeController<SimulatedRadio> {
        let mut radio = controller();
        match mode {
            RadioMode::Off => {}
            RadioMode::Client => radio.enter_client_mode(&client_config()).unwrap(),
            RadioMode::AccessPoint => radio.enter_access_point_mode(&ap_config()).unwrap(),
            RadioMode::ClientAndAccessPoint => {
                radio.enter_client_mode(&client_config()).unwrap();
                radio.enter_access_point_mode(&ap_config()).unwrap();
            }
        }
        assert_eq!(radio.mode(), mode);
        radio
    }

    // ==================== Initialization Tests ====================

    #[test]
    fn test_starts_off() {
        let radio = ModeController::new(SimulatedRadio::new());
        assert_eq!(radio.mode(), RadioMode::Off);
        assert!(!radio.is_initialized());
    }

    #[test]
    fn test_init_twice() {
        let mut radio = controller();
        assert_eq!(radio.init(), Err(RadioError::AlreadyInitialized));
    }

    #[test]
    fn test_init_failure() {
        let mut radio = ModeController::new(SimulatedRadio::new());
        radio.driver_mut().fail_on("init");
        assert!(matches!(radio.init(), Err(RadioError::Driver(_))));
        assert!(!radio.is_initialized());
    }

    #[test]
    fn test_operations_require_init() {
        let mut radio = ModeController::new(SimulatedRadio::new());
        assert_eq!(radio.scan(None, true), Err(RadioError::NotInitialized));
        assert_eq!(
            radio.enter_client_mode(&client_config()),
            Err(RadioError::NotInitialized)
        );
        assert_eq!(
            radio.enter_access_point_mode(&ap_config()),
            Err(RadioError::NotInitialized)
        );
        assert_eq!(
            radio.leave_access_point_mode(),
            Err(RadioError::NotInitialized)
        );
    }

    // ==================== Transition Tests ====================

    #[test]
    fn test_client_then_access_point() {
        let mut radio = controller_in(RadioMode::Client);
        radio.enter_access_point_mode(&ap_config()).unwrap();
        assert_eq!(radio.mode(), RadioMode::ClientAndAccessPoint);
        assert_eq!(radio.driver().mode(), RadioMode::ClientAndAccessPoint);
    }

    #[test]
    fn test_access_point_then_client() {
        let mut radio = controller_in(RadioMode::AccessPoint);
        radio.enter_client_mode(&client_config()).unwrap();
        assert_eq!(radio.mode(), RadioMode::ClientAndAccessPoint);
    }

    #[test]
    fn test_second_access_point_rejected() {
        let mut radio = controller_in(RadioMode::AccessPoint);
        assert_eq!(
            radio.enter_access_point_mode(&ap_config()),
            Err(RadioError::AccessPointActive)
        );
        assert_eq!(radio.mode(), RadioMode::AccessPoint);
    }

    #[test]
    fn test_failed_set_mode_leaves_mode_unchanged() {
        let mut radio = controller_in(RadioMode::Client);
        radio.driver_mut().fail_on("set_mode");
        assert!(radio.enter_access_point_mode(&ap_config()).is_err());
        assert_eq!(radio.mode(), RadioMode::Client);
    }

    #[test]
    fn test_failed_start_reverts_driver() {
        let mut radio = controller();
        radio.driver_mut().fail_on("start");
        assert!(radio.enter_access_point_mode(&ap_config()).is_err());
        assert_eq!(radio.mode(), RadioMode::Off);
        assert_eq!(radio.driver().mode(), RadioMode::Off);
    }

    #[test]
    fn test_failed_connect_is_not_fatal() {
        let mut radio = controller();
        radio.driver_mut().fail_on("connect");
        assert!(radio.enter_client_mode(&client_config()).is_ok());
        assert_eq!(radio.mode(), RadioMode::Client);
    }

    #[test]
    fn test_leave_access_point_powers_down() {
        let mut radio = controller_in(RadioMode::AccessPoint);
        radio.leave_access_point_mode().unwrap();
        assert_eq!(radio.mode(), RadioMode::Off);
        assert!(!radio.driver().is_started());
    }

    #[test]
    fn test_leave_access_point_keeps_client() {
        let mut radio = controller_in(RadioMode::ClientAndAccessPoint);
        radio.leave_access_point_mode().unwrap();
        assert_eq!(radio.mode(), RadioMode::Client);
        assert!(radio.driver().is_started());
    }

    #[test]
    fn test_leave_without_access_point() {
        let mut radio = controller_in(RadioMode::Client);
        assert_eq!(
            radio.leave_access_point_mode(),
            Err(RadioError::NoAccessPoint)
        );
        assert_eq!(radio.mode(), RadioMode::Client);
    }

    // ==================== Scan Tests ====================

    #[test]
    fn test_scan_restores_every_mode() {
        for mode in RadioMode::ALL {
            let mut radio = controller_in(mode);
            radio.driver_mut().add_network("Neighbour");
            let started = radio.driver().is_started();

            assert_eq!(radio.scan(None, true), Ok(1));
            assert_eq!(radio.mode(), mode);
            assert_eq!(radio.driver().mode(), mode);
            assert_eq!(radio.driver().is_started(), started);
        }
    }

    #[test]
    fn test_failed_scan_restores_every_mode() {
        for mode in RadioMode::ALL {
            let mut radio = controller_in(mode);
            radio.driver_mut().fail_on("scan");
            let started = radio.driver().is_started();

            assert!(matches!(radio.scan(None, true), Err(RadioError::Driver(_))));
            assert_eq!(radio.mode(), mode);
            assert_eq!(radio.driver().mode(), mode);
            assert_eq!(radio.driver().is_started(), started);
        }
    }

    #[test]
    fn test_scan_from_off_uses_client() {
        let mut radio = controller();
        radio.scan(None, true).unwrap();
        assert_eq!(radio.driver().last_scan_mode(), Some(RadioMode::Client));
        assert!(!radio.driver().is_started());
    }

    #[test]
    fn test_scan_from_access_point_keeps_ap() {
        let mut radio = controller_in(RadioMode::AccessPoint);
        radio.scan(None, true).unwrap();
        assert_eq!(
            radio.driver().last_scan_mode(),
            Some(RadioMode::ClientAndAccessPoint)
        );
        assert!(radio.driver().is_started());
    }

    #[test]
    fn test_scan_filters_ssid() {
        let mut radio = controller();
        radio.driver_mut().add_network("Device-Setup");
        radio.driver_mut().add_network("HomeNet");
        radio.driver_mut().add_network("");

        assert_eq!(radio.scan(Some("Device-Setup"), true), Ok(1));
        assert_eq!(radio.scan(None, true), Ok(3));
        assert_eq!(radio.scan(None, false), Ok(2));
    }

    #[test]
    fn test_failed_recovery_keeps_scan_result() {
        let mut radio = controller();
        radio.driver_mut().add_network("HomeNet");
        radio.driver_mut().fail_on("stop");

        assert_eq!(radio.scan(None, true), Ok(1));
        assert_eq!(radio.mode(), RadioMode::Off);
        assert_eq!(radio.driver().mode(), RadioMode::Off);
        // The power-down was refused, so the driver is still running
        assert!(radio.driver().is_started());
    }

    #[test]
    fn test_failed_prepare_changes_nothing() {
        let mut radio = controller();
        radio.driver_mut().fail_on("set_mode");
        assert!(radio.scan(None, true).is_err());
        assert_eq!(radio.mode(), RadioMode::Off);
        assert_eq!(radio.driver().mode(), RadioMode::Off);
    }

    // ==================== Station Info Tests ====================

    #[test]
    fn test_station_mac() {
        let radio = controller();
        assert_eq!(radio.station_mac().unwrap().to_string().len(), 17);
    }
}
