//! Captive-portal DNS responder.
//!
//! Answers every A query with one address so a client joining the
//! provisioning access point resolves any name to the device. Other query
//! types get an empty answer. Runs on a non-blocking `std::net::UdpSocket`;
//! call [`CaptiveDnsResponder::poll`] from the main loop.

use super::{DnsResponder, ServiceError};
use log::{debug, info, warn};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

const HEADER_LEN: usize = 12;

/// Largest datagram answered; plain DNS over UDP stays within 512 bytes.
const MAX_PACKET: usize = 512;

const TYPE_A: u16 = 1;
const TYPE_ANY: u16 = 255;
const CLASS_IN: u16 = 1;

/// TTL of redirect answers, in seconds.
const ANSWER_TTL: u32 = 60;

/// Flags: response, authoritative.
const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const OPCODE_MASK: u16 = 0x7800;
const FLAG_RD: u16 = 0x0100;

/// Build the reply to `query` pointing every A lookup at `address`.
///
/// Returns `None` for packets that are not a standard query with at least
/// one well-formed question.
pub fn build_response(query: &[u8], address: Ipv4Addr) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }

    let flags = u16::from_be_bytes([query[2], query[3]]);
    let questions = u16::from_be_bytes([query[4], query[5]]);
    if flags & FLAG_QR != 0 || flags & OPCODE_MASK != 0 || questions == 0 {
        return None;
    }

    // Only the first question is answered
    let name_end = question_name_end(query)?;
    let question_end = name_end + 4;
    if question_end > query.len() {
        return None;
    }
    let qtype = u16::from_be_bytes([query[name_end], query[name_end + 1]]);
    let qclass = u16::from_be_bytes([query[name_end + 2], query[name_end + 3]]);
    let answer = (qtype == TYPE_A || qtype == TYPE_ANY) && qclass == CLASS_IN;

    let mut reply = Vec::with_capacity(question_end + 16);
    reply.extend_from_slice(&query[..2]);
    reply.extend_from_slice(&(FLAG_QR | FLAG_AA | (flags & FLAG_RD)).to_be_bytes());
    reply.extend_from_slice(&1u16.to_be_bytes());
    reply.extend_from_slice(&u16::from(answer).to_be_bytes());
    reply.extend_from_slice(&[0, 0, 0, 0]);
    reply.extend_from_slice(&query[HEADER_LEN..question_end]);

    if answer {
        // Name is a pointer back to the question
        reply.extend_from_slice(&[0xC0, HEADER_LEN as u8]);
        reply.extend_from_slice(&TYPE_A.to_be_bytes());
        reply.extend_from_slice(&CLASS_IN.to_be_bytes());
        reply.extend_from_slice(&ANSWER_TTL.to_be_bytes());
        reply.extend_from_slice(&4u16.to_be_bytes());
        reply.extend_from_slice(&address.octets());
    }

    Some(reply)
}

/// Offset just past the first question's name.
fn question_name_end(packet: &[u8]) -> Option<usize> {
    let mut pos = HEADER_LEN;
    loop {
        let len = *packet.get(pos)? as usize;
        if len == 0 {
            return Some(pos + 1);
        }
        // Compressed or extended labels never appear in a plain query
        if len & 0xC0 != 0 {
            return None;
        }
        pos += 1 + len;
    }
}

/// DNS responder redirecting every lookup to the access point.
pub struct CaptiveDnsResponder {
    bind_addr: Ipv4Addr,
    socket: Option<UdpSocket>,
    address: Ipv4Addr,
}

impl CaptiveDnsResponder {
    /// Create a responder that will bind to all interfaces.
    pub fn new() -> Self {
        Self::bind_to(Ipv4Addr::UNSPECIFIED)
    }

    /// Create a responder that will bind to `bind_addr`.
    pub fn bind_to(bind_addr: Ipv4Addr) -> Self {
        Self {
            bind_addr,
            socket: None,
            address: Ipv4Addr::UNSPECIFIED,
        }
    }

    pub fn is_running(&self) -> bool {
        self.socket.is_some()
    }

    /// Address actually bound, useful when started on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Answer every pending query. Returns how many were answered.
    pub fn poll(&mut self) -> usize {
        let Some(socket) = &self.socket else {
            return 0;
        };

        let mut buf = [0u8; MAX_PACKET];
        let mut answered = 0;
        loop {
            let (len, peer) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("DNS receive failed: {}", e);
                    break;
                }
            };

            let Some(reply) = build_response(&buf[..len], self.address) else {
                debug!("Ignoring {} byte packet from {}", len, peer);
                continue;
            };

            match socket.send_to(&reply, peer) {
                Ok(_) => answered += 1,
                Err(e) => warn!("DNS reply to {} failed: {}", peer, e),
            }
        }
        answered
    }
}

impl Default for CaptiveDnsResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsResponder for CaptiveDnsResponder {
    fn start(&mut self, address: Ipv4Addr, port: u16) -> Result<(), ServiceError> {
        let socket = UdpSocket::bind((self.bind_addr, port))
            .map_err(|e| ServiceError::new("dns", "start", e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServiceError::new("dns", "start", e.to_string()))?;

        info!("Captive DNS on port {} answering {}", port, address);
        self.address = address;
        self.socket = Some(socket);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ServiceError> {
        if self.socket.take().is_some() {
            info!("Captive DNS stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    const DEVICE: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);

    /// Standard query for `name` with recursion desired.
    fn query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&id.to_be_bytes());
        packet.extend_from_slice(&FLAG_RD.to_be_bytes());
        packet.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
        for label in name.split('.') {
            packet.push(label.len() as u8);
            packet.extend_from_slice(label.as_bytes());
        }
        packet.push(0);
        packet.extend_from_slice(&qtype.to_be_bytes());
        packet.extend_from_slice(&CLASS_IN.to_be_bytes());
        packet
    }

    fn answer_count(reply: &[u8]) -> u16 {
        u16::from_be_bytes([reply[6], reply[7]])
    }

    // ==================== Packet Tests ====================

    #[test]
    fn test_a_query_answered_with_device() {
        let q = query(0x1234, "connectivitycheck.gstatic.com", TYPE_A);
        let reply = build_response(&q, DEVICE).unwrap();

        assert_eq!(&reply[..2], &[0x12, 0x34]);
        let flags = u16::from_be_bytes([reply[2], reply[3]]);
        assert_ne!(flags & FLAG_QR, 0);
        assert_ne!(flags & FLAG_RD, 0);
        assert_eq!(answer_count(&reply), 1);
        // Question echoed, address last
        assert_eq!(&reply[HEADER_LEN..q.len()], &q[HEADER_LEN..]);
        assert_eq!(&reply[reply.len() - 4..], &DEVICE.octets());
    }

    #[test]
    fn test_aaaa_query_gets_empty_answer() {
        let q = query(7, "example.com", 28);
        let reply = build_response(&q, DEVICE).unwrap();
        assert_eq!(answer_count(&reply), 0);
        assert_eq!(reply.len(), q.len());
    }

    #[test]
    fn test_malformed_packets_ignored() {
        assert!(build_response(&[0u8; 5], DEVICE).is_none());

        // A response is never answered
        let mut q = query(1, "example.com", TYPE_A);
        q[2] |= 0x80;
        assert!(build_response(&q, DEVICE).is_none());

        // Name runs past the end
        let q = query(1, "example.com", TYPE_A);
        assert!(build_response(&q[..HEADER_LEN + 4], DEVICE).is_none());

        // No question
        let mut q = query(1, "example.com", TYPE_A);
        q[5] = 0;
        assert!(build_response(&q, DEVICE).is_none());
    }

    // ==================== Responder Tests ====================

    #[test]
    fn test_responder_answers_over_udp() {
        let mut dns = CaptiveDnsResponder::bind_to(Ipv4Addr::LOCALHOST);
        dns.start(DEVICE, 0).unwrap();
        assert!(dns.is_running());
        let server = dns.local_addr().unwrap();

        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        client.send_to(&query(42, "setup.local", TYPE_A), server).unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        let mut buf = [0u8; MAX_PACKET];
        let reply = loop {
            dns.poll();
            if let Ok((len, _)) = client.recv_from(&mut buf) {
                break buf[..len].to_vec();
            }
            assert!(Instant::now() < deadline, "no DNS reply");
        };

        assert_eq!(&reply[..2], &42u16.to_be_bytes());
        assert_eq!(&reply[reply.len() - 4..], &DEVICE.octets());

        dns.stop().unwrap();
        assert!(!dns.is_running());
        assert_eq!(dns.poll(), 0);
    }
}
