/**
 * p2p/types.rs
 *
 * Core types for the connectivity subsystem
 */

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;

/// NAT classification as derived from two-server STUN comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    /// No NAT, public IP
    Open,
    /// Same mapping for every destination
    FullCone,
    /// Inbound allowed only from previously contacted IPs
    RestrictedCone,
    /// Inbound allowed only from previously contacted IP:port pairs
    PortRestrictedCone,
    /// Different mapping per destination; hole punching will not work
    Symmetric,
    /// No STUN response at all; UDP likely filtered
    UdpBlocked,
    /// Could not classify (e.g. different public IPs per server)
    Unknown,
}

impl NatType {
    /// Direct peer-to-peer connectivity is plausible behind this NAT class.
    pub fn supports_peer_to_peer(&self) -> bool {
        matches!(
            self,
            NatType::Open
                | NatType::FullCone
                | NatType::RestrictedCone
                | NatType::PortRestrictedCone
        )
    }

    /// Hole punching is expected to succeed behind this NAT class.
    pub fn supports_hole_punching(&self) -> bool {
        matches!(
            self,
            NatType::Open | NatType::FullCone | NatType::RestrictedCone
        )
    }
}

/// Outcome of one NAT characterization call. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct StunResult {
    pub success: bool,
    pub nat_type: NatType,
    pub public_ip: Option<IpAddr>,
    pub public_port: u16,
    pub error: Option<String>,
}

impl StunResult {
    pub fn failure(nat_type: NatType, error: impl Into<String>) -> Self {
        Self {
            success: false,
            nat_type,
            public_ip: None,
            public_port: 0,
            error: Some(error.into()),
        }
    }

    pub fn supports_peer_to_peer(&self) -> bool {
        self.nat_type.supports_peer_to_peer()
    }

    pub fn supports_hole_punching(&self) -> bool {
        self.nat_type.supports_hole_punching()
    }

    /// Public endpoint as a socket address, when the query produced one.
    pub fn public_endpoint(&self) -> Option<SocketAddr> {
        self.public_ip.map(|ip| SocketAddr::new(ip, self.public_port))
    }
}

/// Which strategy produced (or failed to produce) a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMethod {
    Direct,
    HolePunch,
    /// Reserved; no TURN-style relay exists yet
    Relay,
    Failed,
}

/// Result of one orchestrated connection attempt. On success the connected
/// socket is handed to the caller; this subsystem keeps no reference to it.
#[derive(Debug)]
pub struct PeerConnectionResult {
    pub success: bool,
    pub error: Option<String>,
    pub remote_endpoint: Option<SocketAddr>,
    pub stream: Option<TcpStream>,
    pub method: ConnectionMethod,
}

impl PeerConnectionResult {
    pub fn connected(stream: TcpStream, remote: SocketAddr, method: ConnectionMethod) -> Self {
        Self {
            success: true,
            error: None,
            remote_endpoint: Some(remote),
            stream: Some(stream),
            method,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            remote_endpoint: None,
            stream: None,
            method: ConnectionMethod::Failed,
        }
    }
}

/// How this instance identifies itself on the discovery channel
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub peer_id: String,
    pub host_name: String,
    pub lan_ip: IpAddr,
    pub transfer_port: u16,
}

/// Tunables for STUN, direct connects and hole punching
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Two independent reflection servers (host:port)
    pub stun_servers: [String; 2],

    /// Receive budget for a single STUN exchange
    pub stun_timeout: Duration,

    /// How long a cached STUN classification stays fresh
    pub stun_cache_ttl: Duration,

    /// Budget for one TCP connect attempt (direct or post-punch)
    pub connect_timeout: Duration,

    /// Total budget for a hole-punch session
    pub hole_punch_timeout: Duration,

    /// Lead time between sending the go signal and the connect attempts
    pub sync_delay: Duration,

    /// Probe burst shape: count, spacing, and settle time before the connect
    pub probe_count: u32,
    pub probe_interval: Duration,
    pub mapping_settle: Duration,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            stun_servers: [
                "stun.l.google.com:19302".to_string(),
                "stun1.l.google.com:19302".to_string(),
            ],
            stun_timeout: Duration::from_millis(3000),
            stun_cache_ttl: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_millis(3000),
            hole_punch_timeout: Duration::from_millis(10_000),
            sync_delay: Duration::from_millis(100),
            probe_count: 5,
            probe_interval: Duration::from_millis(100),
            mapping_settle: Duration::from_millis(500),
        }
    }
}

/// Expected-failure taxonomy. Public operations with a graceful degradation
/// path return result values instead; these surface where a typed cause is
/// worth keeping.
#[derive(Debug, Error)]
pub enum P2pError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("NAT types incompatible: both peers behind symmetric NAT")]
    NatIncompatible,

    #[error("hole punch session expired")]
    SessionExpired,
}
