//! WiFi provisioning firmware.
//!
//! With stored credentials the device joins its network. Without them it opens
//! the provisioning access point with a TLS listener on port 8443 and a
//! captive DNS responder on port 53, waits for a configuration client, stores
//! what it receives in NVS and restarts.
//!
//! The certificate and key in `certs/` are a development identity. Replace
//! them before shipping devices.
//!
//! Access point parameters are set at compile time:
//!
//! ```bash
//! PROVISIONING_SSID="Lamp-Setup" PROVISIONING_PASSWORD="" cargo build --release --features esp32
//! ```

/// SSID of the provisioning access point.
#[cfg(feature = "esp32")]
const PROVISIONING_SSID: Option<&str> = option_env!("PROVISIONING_SSID");

/// Password of the provisioning access point. Empty for an open network.
#[cfg(feature = "esp32")]
const PROVISIONING_PASSWORD: Option<&str> = option_env!("PROVISIONING_PASSWORD");

#[cfg(feature = "esp32")]
const DEFAULT_PROVISIONING_SSID: &str = "Device-Setup";

#[cfg(feature = "esp32")]
static CERTIFICATE: &[u8] = include_bytes!("../certs/dev-cert.pem");

#[cfg(feature = "esp32")]
static PRIVATE_KEY: &[u8] = include_bytes!("../certs/dev-key.pem");

#[cfg(feature = "esp32")]
mod firmware {
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
    use log::{error, info, warn};
    use std::error::Error;
    use std::sync::mpsc::{Receiver, RecvTimeoutError};
    use std::time::Duration;
    use wifi_provision_esp32::provisioning::{ConfigValue, ProvisioningListener};
    use wifi_provision_esp32::radio::esp::{EspRadio, EventSubscription};
    use wifi_provision_esp32::radio::{EventBridge, ModeController, RawEvent};
    use wifi_provision_esp32::transport::{CaptiveDnsResponder, EspTlsServer};
    use wifi_provision_esp32::wifi::{
        init_nvs, load_wifi_config, mask, save_parameter, save_wifi_config, WifiConfig,
    };
    use wifi_provision_esp32::{Provisioner, WifiEvent, WifiEventListener};

    /// Main loop tick while provisioning.
    const POLL_INTERVAL: Duration = Duration::from_millis(20);

    /// Wait before retrying a failed provisioning start.
    const RETRY_DELAY: Duration = Duration::from_secs(5);

    /// Persists what the configuration client sends.
    struct StoringListener {
        nvs: EspNvs<NvsDefault>,
        finished: bool,
        failed: bool,
    }

    impl StoringListener {
        fn store_parameter(&mut self, name: &str, value: ConfigValue) {
            match save_parameter(&mut self.nvs, name, &value) {
                Ok(true) => info!("Stored parameter {} = {}", name, value),
                Ok(false) => {}
                Err(e) => error!("Storing parameter {}: {:?}", name, e),
            }
        }
    }

    impl WifiEventListener for StoringListener {
        fn handle_wifi_event(&mut self, event: WifiEvent) {
            info!("Radio event: {:?}", event);
        }
    }

    impl ProvisioningListener for StoringListener {
        fn configuration_started(&mut self) {
            info!("Waiting for a configuration client");
        }

        fn configuration_finished(&mut self) {
            self.finished = true;
        }

        fn configuration_failed(&mut self) {
            self.failed = true;
        }

        fn received_wifi_configuration(&mut self, ssid: &str, password: &str) {
            info!("Received network '{}' (password {})", ssid, mask(password));
            let config = match WifiConfig::new(ssid, password) {
                Ok(config) => config,
                Err(e) => {
                    error!("Rejecting received credentials: {}", e);
                    return;
                }
            };
            if let Err(e) = save_wifi_config(&mut self.nvs, &config) {
                error!("Saving credentials: {:?}", e);
            }
        }

        fn received_text_parameter(&mut self, name: &str, value: &str) {
            self.store_parameter(name, ConfigValue::Text(value.to_string()));
        }

        fn received_number_parameter(&mut self, name: &str, value: f64) {
            self.store_parameter(name, ConfigValue::Number(value));
        }

        fn received_flag_parameter(&mut self, name: &str, value: bool) {
            self.store_parameter(name, ConfigValue::Flag(value));
        }
    }

    /// Logs station events.
    struct StationMonitor;

    impl WifiEventListener for StationMonitor {
        fn handle_wifi_event(&mut self, event: WifiEvent) {
            match event {
                WifiEvent::NetworkConnected(info) => info!("Connected: {}", info),
                WifiEvent::NetworkDisconnected => warn!("Disconnected from network"),
                other => info!("Radio event: {:?}", other),
            }
        }
    }

    pub fn run() -> Result<(), Box<dyn Error>> {
        let peripherals = Peripherals::take()?;
        let sysloop = EspSystemEventLoop::take()?;
        let partition = EspDefaultNvsPartition::take()?;
        let nvs = init_nvs(partition.clone())?;

        let (_subscription, events) = EventSubscription::register()?;
        let radio = EspRadio::new(peripherals.modem, sysloop, Some(partition))?;
        let mut radio = ModeController::new(radio);
        radio.init()?;

        if let Some(config) = load_wifi_config(&nvs) {
            info!("Stored credentials found for '{}'", config.ssid);
            radio.enter_client_mode(&config)?;
            let mut bridge = EventBridge::new(StationMonitor);
            loop {
                match events.recv() {
                    Ok(event) => {
                        bridge.deliver(&event);
                    }
                    Err(_) => return Err("radio event channel closed".into()),
                }
            }
        }

        provision(radio, nvs, &events)
    }

    fn provision(
        radio: ModeController<EspRadio<'static>>,
        nvs: EspNvs<NvsDefault>,
        events: &Receiver<RawEvent>,
    ) -> Result<(), Box<dyn Error>> {
        let ssid = match super::PROVISIONING_SSID {
            Some(s) if !s.is_empty() => s,
            _ => super::DEFAULT_PROVISIONING_SSID,
        };
        let password = super::PROVISIONING_PASSWORD.unwrap_or("");

        let mac = radio.station_mac()?;
        let listener = StoringListener {
            nvs,
            finished: false,
            failed: false,
        };
        let mut provisioner = Provisioner::new(
            radio,
            EspTlsServer::new(),
            CaptiveDnsResponder::new(),
            listener,
        );
        provisioner.set_certificate(super::CERTIFICATE);
        provisioner.set_private_key(super::PRIVATE_KEY);
        provisioner.add_device_parameter("model", env!("CARGO_PKG_NAME"))?;
        provisioner.add_device_parameter("version", env!("CARGO_PKG_VERSION"))?;
        provisioner.add_device_parameter("mac", mac.to_string())?;

        let mut bridge = EventBridge::new(provisioner);

        loop {
            if let Err(e) = bridge.listener_mut().start_configuration(ssid, password) {
                error!("Provisioning did not start: {}", e);
                std::thread::sleep(RETRY_DELAY);
                continue;
            }

            loop {
                match events.recv_timeout(POLL_INTERVAL) {
                    Ok(event) => {
                        bridge.deliver(&event);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err("radio event channel closed".into());
                    }
                }

                let provisioner = bridge.listener_mut();
                provisioner.dns_mut().poll();
                for event in provisioner.tls_mut().poll() {
                    provisioner.handle_session_event(event);
                }

                let listener = provisioner.listener_mut();
                if listener.finished {
                    info!("Provisioning complete, restarting");
                    return Ok(());
                }
                if listener.failed {
                    listener.failed = false;
                    warn!("Provisioning failed, retrying");
                    std::thread::sleep(RETRY_DELAY);
                    break;
                }
            }
        }
    }
}

#[cfg(feature = "esp32")]
fn main() {
    // Link ESP-IDF patches (must be first!)
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    log::info!("=== WiFi provisioning firmware starting ===");

    if let Err(e) = firmware::run() {
        log::error!("Fatal: {}", e);
    }

    // Brief pause so the log reaches the serial console
    std::thread::sleep(std::time::Duration::from_secs(2));
    esp_idf_hal::reset::restart();
}

#[cfg(not(feature = "esp32"))]
fn main() {
    println!("This binary requires the 'esp32' feature.");
    println!("Use the host-provision binary to run provisioning on the host.");
}
