/**
 * p2p/stun.rs
 *
 * Minimal STUN client: binding requests only, plus the two-server
 * NAT classification heuristic
 */

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::types::{NatType, P2pError, StunResult};

/// STUN message types
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;

/// STUN magic cookie
const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN attribute types
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Address family tag inside mapped-address attributes
const FAMILY_IPV4: u8 = 0x01;

/// STUN client
pub struct StunClient {
    timeout: Duration,
}

impl StunClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Query a single reflection server for our mapped public endpoint.
    ///
    /// Never propagates an error: timeouts and socket failures come back as
    /// `{ success: false, nat_type: UdpBlocked }`, malformed responses with
    /// an explanatory error string.
    pub async fn characterize(&self, server: &str) -> StunResult {
        match self.query(server).await {
            Ok((ip, port)) => {
                debug!("STUN {} mapped us to {}:{}", server, ip, port);
                StunResult {
                    success: true,
                    nat_type: NatType::Unknown,
                    public_ip: Some(ip),
                    public_port: port,
                    error: None,
                }
            }
            Err(err @ (P2pError::Timeout(_) | P2pError::NetworkUnreachable(_))) => {
                warn!("STUN query to {} got no answer: {}", server, err);
                StunResult::failure(NatType::UdpBlocked, err.to_string())
            }
            Err(err) => {
                warn!("STUN query to {} failed: {}", server, err);
                StunResult::failure(NatType::Unknown, err.to_string())
            }
        }
    }

    /// Classify NAT behavior by comparing mappings reported by two
    /// independent servers. Deliberately coarser than RFC 3489/5389: it only
    /// distinguishes the cases that decide whether hole punching is tried.
    pub async fn detect_nat_type(&self, primary: &str, secondary: &str) -> StunResult {
        let first = self.characterize(primary).await;
        if !first.success {
            return first;
        }

        let second = self.characterize(secondary).await;
        let nat_type = classify(&first, &second);
        debug!("NAT classified as {:?}", nat_type);

        StunResult { nat_type, ..first }
    }

    async fn query(&self, server: &str) -> Result<(IpAddr, u16), P2pError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| P2pError::NetworkUnreachable(e.to_string()))?;

        let transaction_id: [u8; 12] = rand::random();
        let request = build_binding_request(&transaction_id);

        socket
            .send_to(&request, server)
            .await
            .map_err(|e| P2pError::NetworkUnreachable(e.to_string()))?;

        let mut buffer = [0u8; 576];
        let (len, _) = timeout(self.timeout, socket.recv_from(&mut buffer))
            .await
            .map_err(|_| P2pError::Timeout(self.timeout))?
            .map_err(|e| P2pError::NetworkUnreachable(e.to_string()))?;

        parse_binding_response(&buffer[..len])
    }
}

/// Pure comparison of the two probe results.
fn classify(first: &StunResult, second: &StunResult) -> NatType {
    if !second.success {
        // Single data point; assume the conservative cone class
        return NatType::RestrictedCone;
    }

    match (first.public_ip, second.public_ip) {
        (Some(a), Some(b)) if a == b => {
            if first.public_port == second.public_port {
                NatType::FullCone
            } else {
                // Port varies per destination
                NatType::Symmetric
            }
        }
        // Different public IPs per server: load balancer or VPN
        _ => NatType::Unknown,
    }
}

/// 20-byte binding request: type, zero length, magic cookie, transaction id.
fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut request = Vec::with_capacity(20);
    request.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
    request.extend_from_slice(&0u16.to_be_bytes());
    request.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    request.extend_from_slice(transaction_id);
    request
}

/// Walk the attribute list for the first usable mapped address.
fn parse_binding_response(data: &[u8]) -> Result<(IpAddr, u16), P2pError> {
    if data.len() < 20 {
        return Err(P2pError::ProtocolError(format!(
            "STUN response too short: {} bytes",
            data.len()
        )));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != STUN_BINDING_RESPONSE {
        return Err(P2pError::ProtocolError(format!(
            "unexpected STUN message type: 0x{:04x}",
            msg_type
        )));
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let end = (20 + msg_len).min(data.len());

    let mut offset = 20;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;

        if offset + attr_len > data.len() {
            break;
        }

        let value = &data[offset..offset + attr_len];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(endpoint) = decode_mapped_address(value, true) {
                    return Ok(endpoint);
                }
            }
            ATTR_MAPPED_ADDRESS => {
                if let Some(endpoint) = decode_mapped_address(value, false) {
                    return Ok(endpoint);
                }
            }
            _ => {}
        }

        // Attribute values are padded to 4-byte alignment
        offset += (attr_len + 3) & !3;
    }

    Err(P2pError::ProtocolError(
        "no mapped address attribute in STUN response".into(),
    ))
}

/// Decode a (XOR-)MAPPED-ADDRESS value. IPv4 only; anything else is skipped.
fn decode_mapped_address(value: &[u8], xored: bool) -> Option<(IpAddr, u16)> {
    if value.len() < 8 || value[1] != FAMILY_IPV4 {
        return None;
    }

    let mut port = u16::from_be_bytes([value[2], value[3]]);
    let mut octets = [value[4], value[5], value[6], value[7]];

    if xored {
        port ^= (STUN_MAGIC_COOKIE >> 16) as u16;
        let cookie = STUN_MAGIC_COOKIE.to_be_bytes();
        for (octet, key) in octets.iter_mut().zip(cookie.iter()) {
            *octet ^= key;
        }
    }

    Some((IpAddr::V4(Ipv4Addr::from(octets)), port))
}
