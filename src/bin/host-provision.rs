//! Host-side provisioning simulation.
//!
//! Runs the complete provisioning flow on the host: a simulated radio hosts
//! the access point, the provisioning listener accepts a cleartext TCP
//! client on port 8443 and the captive DNS responder answers on port 5353.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin host-provision -- Device-Setup [password]
//! ```
//!
//! Then, from another terminal:
//!
//! ```bash
//! printf '{"cmd":"hi"}\n{"cmd":"setconfig","ssid":"HomeNet","pass":"password123"}\n' | nc localhost 8443
//! dig @127.0.0.1 -p 5353 anything.example
//! ```

use log::{error, info, warn};
use std::time::Duration;
use wifi_provision_esp32::provisioning::{ProvisioningConfig, ProvisioningListener};
use wifi_provision_esp32::wifi::{mask, WifiConfig};
use wifi_provision_esp32::{
    CaptiveDnsResponder, EventBridge, ModeController, Provisioner, SimulatedRadio,
    TcpSessionServer, WifiEvent, WifiEventListener,
};

static CERTIFICATE: &[u8] = include_bytes!("../../certs/dev-cert.pem");
static PRIVATE_KEY: &[u8] = include_bytes!("../../certs/dev-key.pem");

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Port 53 needs privileges on most hosts.
const HOST_DNS_PORT: u16 = 5353;

/// Prints what the client sends and remembers the credentials.
#[derive(Default)]
struct ConsoleListener {
    credentials: Option<WifiConfig>,
    done: bool,
}

impl WifiEventListener for ConsoleListener {
    fn handle_wifi_event(&mut self, event: WifiEvent) {
        info!("Radio event: {:?}", event);
    }
}

impl ProvisioningListener for ConsoleListener {
    fn configuration_started(&mut self) {
        info!("Provisioning ready, connect to port 8443");
    }

    fn configuration_finished(&mut self) {
        info!("Configuration finished");
        self.done = true;
    }

    fn configuration_failed(&mut self) {
        error!("Configuration failed");
        self.done = true;
    }

    fn received_wifi_configuration(&mut self, ssid: &str, password: &str) {
        info!("Network: '{}' (password {})", ssid, mask(password));
        match WifiConfig::new(ssid, password) {
            Ok(config) => self.credentials = Some(config),
            Err(e) => warn!("Received credentials are invalid: {}", e),
        }
    }

    fn received_text_parameter(&mut self, name: &str, value: &str) {
        info!("Parameter {} = {:?}", name, value);
    }

    fn received_number_parameter(&mut self, name: &str, value: f64) {
        info!("Parameter {} = {}", name, value);
    }

    fn received_flag_parameter(&mut self, name: &str, value: bool) {
        info!("Parameter {} = {}", name, value);
    }
}

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let ssid = args.next().unwrap_or_else(|| "Device-Setup".to_string());
    let password = args.next().unwrap_or_default();

    info!("=== Host provisioning starting ===");

    let mut radio = ModeController::new(SimulatedRadio::new());
    if let Err(e) = radio.init() {
        error!("Radio initialization failed: {}", e);
        std::process::exit(1);
    }

    let config = ProvisioningConfig {
        dns_port: HOST_DNS_PORT,
        ..ProvisioningConfig::default()
    };
    let mut provisioner = Provisioner::with_config(
        radio,
        TcpSessionServer::new(),
        CaptiveDnsResponder::new(),
        ConsoleListener::default(),
        config,
    );
    provisioner.set_certificate(CERTIFICATE);
    provisioner.set_private_key(PRIVATE_KEY);
    for (name, value) in [
        ("model", env!("CARGO_PKG_NAME")),
        ("version", env!("CARGO_PKG_VERSION")),
        ("platform", "host"),
    ] {
        if let Err(e) = provisioner.add_device_parameter(name, value) {
            warn!("Device parameter {}: {}", name, e);
        }
    }

    let mut bridge = EventBridge::new(provisioner);
    if let Err(e) = bridge.listener_mut().start_configuration(&ssid, &password) {
        error!("Provisioning did not start: {}", e);
        std::process::exit(1);
    }

    loop {
        let provisioner = bridge.listener_mut();
        let radio_events = provisioner.radio_mut().driver_mut().take_events();
        for event in &radio_events {
            bridge.deliver(event);
        }

        let provisioner = bridge.listener_mut();
        provisioner.dns_mut().poll();
        for event in provisioner.tls_mut().poll() {
            provisioner.handle_session_event(event);
        }

        if provisioner.listener().done && radio_events.is_empty() {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    let listener = bridge.into_listener();
    match &listener.listener().credentials {
        Some(config) => {
            // Show the simulated radio joining the new network
            let mut radio = ModeController::new(SimulatedRadio::new());
            radio.driver_mut().add_network(&config.ssid);
            if radio.init().is_ok() && radio.enter_client_mode(config).is_ok() {
                let mut station = EventBridge::new(ConsoleListener::default());
                for event in radio.driver_mut().take_events() {
                    station.deliver(&event);
                }
                if let Some(address) = station.station_address() {
                    info!("Joined '{}' as {}", config.ssid, address.ip);
                }
            }
        }
        None => warn!("No usable credentials received"),
    }

    info!("=== Host provisioning done ===");
}
