//! TLS session server on ESP-IDF.
//!
//! Clients are accepted with `std::net`, then the server side of the
//! handshake runs through `esp-tls` with the certificate and key handed in
//! by the provisioning side. The handshake uses a blocking socket bounded by
//! [`HANDSHAKE_TIMEOUT`]; afterwards the socket is non-blocking and
//! [`EspTlsServer::poll`] reads whatever records arrived.
//!
//! Needs `CONFIG_ESP_TLS_SERVER=y`, set in `sdkconfig.defaults`.

use super::{ServiceError, SessionError, SessionEvent, SessionHandle, SessionSlots, TlsListener};
use esp_idf_sys as sys;
use log::{debug, error, info, warn};
use std::ffi::c_void;
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, Shutdown, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

/// Read buffer size per poll and session.
const READ_CHUNK: usize = 512;

/// Longest a client may take to complete the handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a write may wait for the peer to drain its receive window.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

const WRITE_RETRY_DELAY: Duration = Duration::from_millis(1);

/// mbedTLS: no record available yet.
const SSL_WANT_READ: isize = -0x6900;

/// mbedTLS: output buffer still full.
const SSL_WANT_WRITE: isize = -0x6880;

/// An accepted client with its TLS context.
struct TlsSession {
    tls: *mut sys::esp_tls_t,
    // Closed after the TLS context is deleted
    stream: TcpStream,
}

impl TlsSession {
    fn read(&mut self, buf: &mut [u8]) -> isize {
        unsafe {
            sys::esp_tls_conn_read(self.tls, buf.as_mut_ptr() as *mut c_void, buf.len()) as isize
        }
    }

    fn write(&mut self, bytes: &[u8]) -> isize {
        unsafe {
            sys::esp_tls_conn_write(self.tls, bytes.as_ptr() as *const c_void, bytes.len()) as isize
        }
    }
}

impl Drop for TlsSession {
    fn drop(&mut self) {
        unsafe { sys::esp_tls_server_session_delete(self.tls) };
    }
}

fn tls_error(operation: &str, code: isize) -> io::Error {
    io::Error::new(
        ErrorKind::Other,
        format!("{} failed: -0x{:04X}", operation, code.unsigned_abs()),
    )
}

/// Provisioning listener speaking TLS through `esp-tls`.
pub struct EspTlsServer {
    bind_addr: Ipv4Addr,
    listener: Option<TcpListener>,
    sessions: SessionSlots<TlsSession>,
    certificate: Option<&'static [u8]>,
    private_key: Option<&'static [u8]>,
    initialized: bool,
}

impl EspTlsServer {
    /// Create a server that will bind to all interfaces.
    pub fn new() -> Self {
        Self {
            bind_addr: Ipv4Addr::UNSPECIFIED,
            listener: None,
            sessions: SessionSlots::new(),
            certificate: None,
            private_key: None,
            initialized: false,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Accept new clients and read from connected ones.
    pub fn poll(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        self.accept(&mut events);

        let mut buf = [0u8; READ_CHUNK];
        for handle in self.sessions.handles() {
            let Some(session) = self.sessions.get_mut(handle) else {
                continue;
            };

            match session.read(&mut buf) {
                0 => {
                    debug!("{} closed by peer", handle);
                    self.sessions.remove(handle);
                    events.push(SessionEvent::Closed(handle));
                }
                n if n > 0 => {
                    events.push(SessionEvent::Received(handle, buf[..n as usize].to_vec()))
                }
                SSL_WANT_READ | SSL_WANT_WRITE => {}
                code => {
                    warn!("{} read failed: -0x{:04X}", handle, code.unsigned_abs());
                    self.sessions.remove(handle);
                    events.push(SessionEvent::Closed(handle));
                }
            }
        }

        events
    }

    fn accept(&mut self, events: &mut Vec<SessionEvent>) {
        loop {
            let Some(listener) = &self.listener else {
                return;
            };

            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            };

            match self.handshake(stream) {
                Ok(session) => {
                    let handle = self.sessions.insert(session);
                    info!("Client {} connected as {}", peer, handle);
                    events.push(SessionEvent::Opened(handle));
                }
                Err(e) => warn!("Handshake with {} failed: {}", peer, e),
            }
        }
    }

    fn handshake(&self, stream: TcpStream) -> io::Result<TlsSession> {
        let (Some(certificate), Some(private_key)) = (self.certificate, self.private_key) else {
            return Err(io::Error::new(ErrorKind::Other, "no server identity"));
        };

        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

        let tls = unsafe { sys::esp_tls_init() };
        if tls.is_null() {
            return Err(io::Error::new(ErrorKind::OutOfMemory, "esp_tls_init"));
        }
        let session = TlsSession { tls, stream };

        let mut config = sys::esp_tls_cfg_server_t::default();
        config.__bindgen_anon_3.servercert_buf = certificate.as_ptr();
        config.__bindgen_anon_4.servercert_bytes = certificate.len() as u32;
        config.__bindgen_anon_5.serverkey_buf = private_key.as_ptr();
        config.__bindgen_anon_6.serverkey_bytes = private_key.len() as u32;

        let ret = unsafe {
            sys::esp_tls_server_session_create(&mut config, session.stream.as_raw_fd(), session.tls)
        };
        if ret != 0 {
            return Err(tls_error("esp_tls_server_session_create", ret as isize));
        }

        session.stream.set_read_timeout(None)?;
        session.stream.set_write_timeout(None)?;
        session.stream.set_nonblocking(true)?;
        Ok(session)
    }
}

impl Default for EspTlsServer {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsListener for EspTlsServer {
    fn init(&mut self) -> Result<(), ServiceError> {
        self.initialized = true;
        Ok(())
    }

    fn set_certificate(&mut self, certificate: &'static [u8]) -> Result<(), ServiceError> {
        if certificate.last() != Some(&0) {
            return Err(ServiceError::new(
                "tls",
                "set_certificate",
                "PEM must be null-terminated",
            ));
        }
        self.certificate = Some(certificate);
        Ok(())
    }

    fn set_private_key(&mut self, private_key: &'static [u8]) -> Result<(), ServiceError> {
        if private_key.last() != Some(&0) {
            return Err(ServiceError::new(
                "tls",
                "set_private_key",
                "PEM must be null-terminated",
            ));
        }
        self.private_key = Some(private_key);
        Ok(())
    }

    fn listen(&mut self, port: u16) -> Result<(), ServiceError> {
        if !self.initialized {
            return Err(ServiceError::new("tls", "listen", "not initialized"));
        }
        if self.certificate.is_none() || self.private_key.is_none() {
            return Err(ServiceError::new("tls", "listen", "no server identity"));
        }

        let listener = TcpListener::bind((self.bind_addr, port))
            .map_err(|e| ServiceError::new("tls", "listen", e.to_string()))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| ServiceError::new("tls", "listen", e.to_string()))?;

        info!("TLS listener on port {}", port);
        self.listener = Some(listener);
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), ServiceError> {
        self.listener = None;
        for session in self.sessions.drain() {
            if let Err(e) = session.stream.shutdown(Shutdown::Both) {
                debug!("Session shutdown: {}", e);
            }
        }
        self.initialized = false;
        info!("TLS listener shut down");
        Ok(())
    }

    fn write(&mut self, session: SessionHandle, bytes: &[u8]) -> Result<(), SessionError> {
        let tls = self.sessions.get_mut(session).ok_or(SessionError::Gone)?;

        let deadline = Instant::now() + WRITE_TIMEOUT;
        let mut written = 0;
        while written < bytes.len() {
            match tls.write(&bytes[written..]) {
                0 => return Err(SessionError::Gone),
                n if n > 0 => written += n as usize,
                SSL_WANT_READ | SSL_WANT_WRITE => {
                    if Instant::now() >= deadline {
                        warn!(
                            "{} not reading, {} of {} bytes written",
                            session,
                            written,
                            bytes.len()
                        );
                        return Err(SessionError::Io(ErrorKind::TimedOut.into()));
                    }
                    std::thread::sleep(WRITE_RETRY_DELAY);
                }
                code => {
                    error!("{} write failed: -0x{:04X}", session, code.unsigned_abs());
                    return Err(SessionError::Io(tls_error("esp_tls_conn_write", code)));
                }
            }
        }
        Ok(())
    }

    fn close(&mut self, session: SessionHandle) -> Result<(), SessionError> {
        let tls = self.sessions.remove(session).ok_or(SessionError::Gone)?;
        tls.stream.shutdown(Shutdown::Both)?;
        debug!("{} closed", session);
        Ok(())
    }
}
