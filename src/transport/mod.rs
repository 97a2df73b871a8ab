//! Provisioning transport collaborators.
//!
//! The provisioning flow drives two services it does not implement itself:
//! a TLS listener that accepts the configuration client, and a DNS responder
//! that redirects every lookup to the access point (captive portal). This
//! module defines their contracts.
//!
//! Sessions are owned by the listener. The provisioning side only keeps a
//! [`SessionHandle`], an index plus generation into the listener's
//! [`SessionSlots`]. A handle whose session is gone simply fails to resolve.
//!
//! # Components
//!
//! - [`dns`] - Captive-portal DNS responder on UDP
//! - [`tcp`] - Cleartext TCP listener for development and host simulation
//! - `tls` - TLS listener on `esp-tls` (ESP32 only)

pub mod dns;
pub mod tcp;

#[cfg(feature = "esp32")]
pub mod tls;

pub use dns::CaptiveDnsResponder;
pub use tcp::TcpSessionServer;

#[cfg(feature = "esp32")]
pub use tls::EspTlsServer;

use std::fmt;
use std::net::Ipv4Addr;

/// Port the configuration client connects to.
pub const PROVISIONING_PORT: u16 = 8443;

/// Port of the captive-portal DNS responder.
pub const DNS_PORT: u16 = 53;

/// Reference to a session owned by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    index: u32,
    generation: u32,
}

impl SessionHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}.{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot table handing out generation-checked [`SessionHandle`]s.
///
/// A freed slot is reused with a bumped generation, so handles to the old
/// occupant no longer resolve.
pub struct SessionSlots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> SessionSlots<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, value: T) -> SessionHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return SessionHandle {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        SessionHandle {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, handle: SessionHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn remove(&mut self, handle: SessionHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(value)
    }

    /// Handles of all live sessions.
    pub fn handles(&self) -> Vec<SessionHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(index, slot)| SessionHandle {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every session.
    pub fn drain(&mut self) -> Vec<T> {
        self.handles()
            .into_iter()
            .filter_map(|handle| self.remove(handle))
            .collect()
    }
}

impl<T> Default for SessionSlots<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Something happened on the listener side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A client connected.
    Opened(SessionHandle),
    /// A client sent bytes.
    Received(SessionHandle, Vec<u8>),
    /// A client went away.
    Closed(SessionHandle),
}

/// TLS listener the configuration client connects to.
pub trait TlsListener {
    fn init(&mut self) -> Result<(), ServiceError>;

    /// PEM certificate, null-terminated.
    fn set_certificate(&mut self, certificate: &'static [u8]) -> Result<(), ServiceError>;

    /// PEM private key, null-terminated.
    fn set_private_key(&mut self, private_key: &'static [u8]) -> Result<(), ServiceError>;

    fn listen(&mut self, port: u16) -> Result<(), ServiceError>;

    /// Stop listening and drop all sessions.
    fn shutdown(&mut self) -> Result<(), ServiceError>;

    fn write(&mut self, session: SessionHandle, bytes: &[u8]) -> Result<(), SessionError>;

    fn close(&mut self, session: SessionHandle) -> Result<(), SessionError>;
}

/// DNS responder answering every query with one address.
pub trait DnsResponder {
    fn start(&mut self, address: Ipv4Addr, port: u16) -> Result<(), ServiceError>;

    fn stop(&mut self) -> Result<(), ServiceError>;
}

/// A provisioning service failed to start or stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    /// "tls" or "dns".
    pub service: &'static str,
    pub operation: &'static str,
    pub reason: String,
}

impl ServiceError {
    pub fn new(service: &'static str, operation: &'static str, reason: impl Into<String>) -> Self {
        Self {
            service,
            operation,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} failed: {}", self.service, self.operation, self.reason)
    }
}

impl std::error::Error for ServiceError {}

/// Errors writing to or closing a session.
#[derive(Debug)]
pub enum SessionError {
    /// The handle no longer refers to a live session.
    Gone,
    /// I/O error on the underlying socket.
    Io(std::io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gone => write!(f, "session gone"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Gone => None,
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== SessionSlots Tests ====================

    #[test]
    fn test_insert_and_get() {
        let mut slots = SessionSlots::new();
        let a = slots.insert("a");
        let b = slots.insert("b");
        assert_eq!(slots.get(a), Some(&"a"));
        assert_eq!(slots.get(b), Some(&"b"));
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn test_removed_handle_is_gone() {
        let mut slots = SessionSlots::new();
        let a = slots.insert("a");
        assert_eq!(slots.remove(a), Some("a"));
        assert!(!slots.contains(a));
        assert_eq!(slots.remove(a), None);
        assert!(slots.is_empty());
    }

    #[test]
    fn test_reused_slot_rejects_stale_handle() {
        let mut slots = SessionSlots::new();
        let old = slots.insert("old");
        slots.remove(old);

        let new = slots.insert("new");
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());
        assert_eq!(slots.get(old), None);
        assert_eq!(slots.get(new), Some(&"new"));
    }

    #[test]
    fn test_drain() {
        let mut slots = SessionSlots::new();
        let a = slots.insert(1);
        slots.insert(2);
        let mut drained = slots.drain();
        drained.sort();
        assert_eq!(drained, vec![1, 2]);
        assert!(slots.is_empty());
        assert!(!slots.contains(a));
    }

    #[test]
    fn test_handle_display() {
        let mut slots = SessionSlots::new();
        let a = slots.insert(());
        assert_eq!(a.to_string(), "session#0.0");
    }
}
