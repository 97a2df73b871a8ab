//! Provisioning orchestrator.
//!
//! [`Provisioner`] drives one provisioning flow. It owns the
//! [`ModeController`], the TLS listener, the DNS responder and the
//! [`ProvisioningListener`], and is itself a [`WifiEventListener`] so it can
//! be registered with an [`EventBridge`](crate::radio::EventBridge).
//!
//! Session events come from the listener's owner (see
//! [`TcpSessionServer::poll`](crate::transport::TcpSessionServer::poll)) and
//! are fed in with [`Provisioner::handle_session_event`]. Everything runs on
//! the caller's thread.

use super::protocol::{
    parse_request, LineFramer, Request, Response, SetConfig, BUSY_MESSAGE, LINE_TERMINATOR,
};
use super::{
    ConfigValue, DeviceParameters, IdentityMaterial, ProtocolError, ProvisioningConfig,
    ProvisioningError, ProvisioningListener, ProvisioningState,
};
use crate::radio::{IpInfo, ModeController, RadioDriver, WifiEvent, WifiEventListener};
use crate::transport::{
    DnsResponder, ServiceError, SessionError, SessionEvent, SessionHandle, TlsListener,
};
use crate::wifi::AccessPointConfig;
use log::{debug, error, info, warn};

/// The provisioning state machine.
pub struct Provisioner<D, T, N, L>
where
    D: RadioDriver,
    T: TlsListener,
    N: DnsResponder,
    L: ProvisioningListener,
{
    radio: ModeController<D>,
    tls: T,
    dns: N,
    listener: L,
    config: ProvisioningConfig,
    identity: IdentityMaterial,
    device: DeviceParameters,
    state: ProvisioningState,
    session: Option<SessionHandle>,
    framer: LineFramer,
    tls_active: bool,
    dns_active: bool,
}

impl<D, T, N, L> Provisioner<D, T, N, L>
where
    D: RadioDriver,
    T: TlsListener,
    N: DnsResponder,
    L: ProvisioningListener,
{
    /// Create an inactive provisioner with default ports.
    ///
    /// `radio` should already be initialized.
    pub fn new(radio: ModeController<D>, tls: T, dns: N, listener: L) -> Self {
        Self::with_config(radio, tls, dns, listener, ProvisioningConfig::default())
    }

    pub fn with_config(
        radio: ModeController<D>,
        tls: T,
        dns: N,
        listener: L,
        config: ProvisioningConfig,
    ) -> Self {
        let framer = LineFramer::new(config.max_line_len);
        Self {
            radio,
            tls,
            dns,
            listener,
            config,
            identity: IdentityMaterial::default(),
            device: DeviceParameters::new(),
            state: ProvisioningState::Inactive,
            session: None,
            framer,
            tls_active: false,
            dns_active: false,
        }
    }

    /// PEM certificate for the listener, null-terminated.
    pub fn set_certificate(&mut self, certificate: &'static [u8]) {
        self.identity.certificate = Some(certificate);
    }

    /// PEM private key for the listener, null-terminated.
    pub fn set_private_key(&mut self, private_key: &'static [u8]) {
        self.identity.private_key = Some(private_key);
    }

    /// Advertise `name = value` in the welcome message.
    ///
    /// Only allowed while inactive. An existing entry is replaced.
    pub fn add_device_parameter(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ProvisioningError> {
        if self.state != ProvisioningState::Inactive {
            return Err(ProvisioningError::AlreadyActive);
        }
        self.device.insert(name.into(), value.into());
        Ok(())
    }

    /// Open the provisioning access point `ssid`.
    ///
    /// An empty `password` makes an open network. Fails without side effects
    /// if a flow is already running, the identity is incomplete, or another
    /// device already broadcasts `ssid`. Services start once the access point
    /// reports that it is up.
    pub fn start_configuration(
        &mut self,
        ssid: &str,
        password: &str,
    ) -> Result<(), ProvisioningError> {
        if self.state != ProvisioningState::Inactive {
            warn!("Configuration already active ({})", self.state);
            return Err(ProvisioningError::AlreadyActive);
        }

        if !self.identity.is_complete() {
            error!("Certificate and private key must be set before provisioning");
            return Err(ProvisioningError::MissingIdentity);
        }

        let access_point = AccessPointConfig::new(ssid, password)?;

        let count = self
            .radio
            .scan(Some(ssid), true)
            .map_err(ProvisioningError::ScanFailed)?;
        if count > 0 {
            warn!("'{}' is already broadcast by {} network(s)", ssid, count);
            return Err(ProvisioningError::NetworkNameCollision {
                ssid: ssid.to_string(),
                count,
            });
        }

        self.state = ProvisioningState::Starting;
        if let Err(e) = self.radio.enter_access_point_mode(&access_point) {
            error!("Could not start provisioning access point: {}", e);
            self.state = ProvisioningState::Inactive;
            return Err(ProvisioningError::Radio(e));
        }

        info!("Provisioning access point '{}' requested", ssid);
        Ok(())
    }

    /// Complete the flow after a configuration was delivered.
    ///
    /// Closes the session, stops both services and leaves access point mode.
    /// Teardown failures are logged and do not stop the remaining steps.
    pub fn finish_configuration(&mut self) -> Result<(), ProvisioningError> {
        if self.state == ProvisioningState::Inactive {
            return Err(ProvisioningError::NotActive);
        }

        info!("Configuration finished");
        self.state = ProvisioningState::Inactive;
        self.close_session();
        self.listener.configuration_finished();
        self.release_radio_and_services();
        Ok(())
    }

    /// Abort the flow from any active state.
    ///
    /// Tears down like [`Self::finish_configuration`] but reports
    /// `configuration_failed`.
    pub fn cancel_configuration(&mut self) -> Result<(), ProvisioningError> {
        if self.state == ProvisioningState::Inactive {
            return Err(ProvisioningError::NotActive);
        }

        warn!("Configuration cancelled in state {}", self.state);
        self.state = ProvisioningState::Inactive;
        self.close_session();
        self.listener.configuration_failed();
        self.release_radio_and_services();
        Ok(())
    }

    /// Feed one event from the session listener.
    pub fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Opened(handle) => self.session_opened(handle),
            SessionEvent::Received(handle, bytes) => self.session_received(handle, &bytes),
            SessionEvent::Closed(handle) => self.session_closed(handle),
        }
    }

    /// A client connected to the listener.
    pub fn session_opened(&mut self, handle: SessionHandle) {
        if self.state != ProvisioningState::Pending {
            warn!("Rejecting {}: configuration is {}", handle, self.state);
            let mut message = BUSY_MESSAGE.to_vec();
            message.extend_from_slice(LINE_TERMINATOR);
            if let Err(e) = self.tls.write(handle, &message) {
                debug!("{}: {}", handle, e);
            }
            if let Err(e) = self.tls.close(handle) {
                debug!("{}: {}", handle, e);
            }
            return;
        }

        info!("Provisioning client connected on {}", handle);
        self.session = Some(handle);
        self.framer.reset();
        self.state = ProvisioningState::Running;
    }

    /// A client sent bytes.
    pub fn session_received(&mut self, handle: SessionHandle, bytes: &[u8]) {
        if self.session != Some(handle) {
            warn!("Ignoring {} bytes from unbound {}", bytes.len(), handle);
            return;
        }

        for line in self.framer.push(bytes) {
            // An earlier line may have finished the flow or lost the session
            if self.session != Some(handle) {
                break;
            }

            match line.and_then(|line| parse_request(&line)) {
                Ok(Request::Hello) => {
                    debug!("{}: hi", handle);
                    let welcome = Response::Welcome(&self.device).encode();
                    self.send_encoded(handle, welcome);
                }
                Ok(Request::SetConfig(config)) => self.apply_configuration(handle, config),
                Err(e) => {
                    warn!("{}: {}", handle, e);
                    self.send(handle, Response::Error(e));
                }
            }
        }
    }

    /// A client went away.
    pub fn session_closed(&mut self, handle: SessionHandle) {
        if self.session != Some(handle) {
            debug!("{} closed (not the provisioning session)", handle);
            return;
        }
        info!("Provisioning client on {} disconnected", handle);
        self.drop_session();
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    /// Handle of the bound client, if any.
    pub fn session(&self) -> Option<SessionHandle> {
        self.session
    }

    pub fn device_parameters(&self) -> &DeviceParameters {
        &self.device
    }

    pub fn config(&self) -> &ProvisioningConfig {
        &self.config
    }

    pub fn radio(&self) -> &ModeController<D> {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut ModeController<D> {
        &mut self.radio
    }

    pub fn tls(&self) -> &T {
        &self.tls
    }

    pub fn tls_mut(&mut self) -> &mut T {
        &mut self.tls
    }

    pub fn dns(&self) -> &N {
        &self.dns
    }

    pub fn dns_mut(&mut self) -> &mut N {
        &mut self.dns
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    fn apply_configuration(&mut self, handle: SessionHandle, config: SetConfig) {
        info!("{}: received configuration for '{}'", handle, config.ssid);

        self.listener
            .received_wifi_configuration(&config.ssid, &config.password);

        for (name, value) in &config.extconfig {
            debug!("extconfig {} = {}", name, value);
            match value {
                ConfigValue::Text(text) => self.listener.received_text_parameter(name, text),
                ConfigValue::Number(number) => {
                    self.listener.received_number_parameter(name, *number)
                }
                ConfigValue::Flag(flag) => self.listener.received_flag_parameter(name, *flag),
            }
        }

        self.send(handle, Response::SetConfigAck);

        // The configuration was delivered even if the ack could not be sent
        if let Err(e) = self.finish_configuration() {
            debug!("finish_configuration: {}", e);
        }
    }

    fn send(&mut self, handle: SessionHandle, response: Response<'_>) {
        let encoded = response.encode();
        self.send_encoded(handle, encoded);
    }

    fn send_encoded(&mut self, handle: SessionHandle, encoded: Result<Vec<u8>, serde_json::Error>) {
        let line = match encoded {
            Ok(line) => line,
            Err(e) => {
                error!("Could not encode response: {}", e);
                self.send_fallback_error(handle);
                return;
            }
        };

        match self.tls.write(handle, &line) {
            Ok(()) => {}
            Err(SessionError::Gone) => {
                warn!("{} is gone", handle);
                self.drop_session();
            }
            Err(e) => {
                warn!("{} write failed: {}", handle, e);
                if let Err(e) = self.tls.close(handle) {
                    debug!("{}: {}", handle, e);
                }
                self.drop_session();
            }
        }
    }

    fn send_fallback_error(&mut self, handle: SessionHandle) {
        let mut line = format!("{{\"error\":\"{}\"}}", ProtocolError::InvalidMessage).into_bytes();
        line.extend_from_slice(LINE_TERMINATOR);
        if let Err(e) = self.tls.write(handle, &line) {
            debug!("{}: {}", handle, e);
        }
    }

    /// Forget the bound session; a running flow waits for the next client.
    fn drop_session(&mut self) {
        self.session = None;
        self.framer.reset();
        if self.state == ProvisioningState::Running {
            self.state = ProvisioningState::Pending;
            info!("Waiting for another provisioning client");
        }
    }

    fn close_session(&mut self) {
        self.framer.reset();
        let Some(handle) = self.session.take() else {
            return;
        };
        match self.tls.close(handle) {
            Ok(()) | Err(SessionError::Gone) => {}
            Err(e) => warn!("Closing {}: {}", handle, e),
        }
    }

    fn start_services(&mut self, access_point: IpInfo) -> Result<(), ServiceError> {
        let (Some(certificate), Some(private_key)) =
            (self.identity.certificate, self.identity.private_key)
        else {
            return Err(ServiceError::new("tls", "set_certificate", "identity not set"));
        };

        self.tls.init()?;
        self.tls_active = true;
        self.tls.set_certificate(certificate)?;
        self.tls.set_private_key(private_key)?;
        self.tls.listen(self.config.port)?;
        info!("Provisioning listener on port {}", self.config.port);

        self.dns.start(access_point.ip, self.config.dns_port)?;
        self.dns_active = true;
        info!(
            "Captive DNS on port {} answering {}",
            self.config.dns_port, access_point.ip
        );

        Ok(())
    }

    fn stop_services(&mut self) {
        if self.tls_active {
            self.tls_active = false;
            if let Err(e) = self.tls.shutdown() {
                error!("{}", e);
            }
        }
        if self.dns_active {
            self.dns_active = false;
            if let Err(e) = self.dns.stop() {
                error!("{}", e);
            }
        }
    }

    fn release_radio_and_services(&mut self) {
        self.stop_services();
        if self.radio.mode().has_access_point() {
            if let Err(e) = self.radio.leave_access_point_mode() {
                error!("Leaving access point mode: {}", e);
            }
        }
    }

    fn access_point_started(&mut self, info: IpInfo) {
        match self.start_services(info) {
            Ok(()) => {
                self.state = ProvisioningState::Pending;
                info!("Provisioning ready at {}", info.ip);
                self.listener.configuration_started();
            }
            Err(e) => {
                error!("Provisioning setup failed: {}", e);
                self.state = ProvisioningState::Inactive;
                self.release_radio_and_services();
                self.listener.configuration_failed();
            }
        }
    }
}

impl<D, T, N, L> WifiEventListener for Provisioner<D, T, N, L>
where
    D: RadioDriver,
    T: TlsListener,
    N: DnsResponder,
    L: ProvisioningListener,
{
    fn handle_wifi_event(&mut self, event: WifiEvent) {
        match event {
            WifiEvent::AccessPointStarted(info) if self.state == ProvisioningState::Starting => {
                self.access_point_started(info)
            }
            other => self.listener.handle_wifi_event(other),
        }
    }
}
