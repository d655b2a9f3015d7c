/**
 * p2p/mod.rs
 *
 * Peer-to-peer connectivity: NAT characterization over STUN, the
 * discovery message protocol, hole-punch coordination and the
 * connection orchestrator that ties them together.
 */

pub mod hole_punch;
pub mod protocol;
pub mod registry;
pub mod stun;
pub mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

pub use hole_punch::{can_hole_punch, HolePunchCoordinator, IncomingPeer};
pub use protocol::{DiscoveryMessage, MessagePayload, MessageType, DISCOVERY_MAGIC};
pub use registry::{PeerEndpointRegistry, ReflexiveCache};
pub use stun::StunClient;
pub use types::{
    ConnectionMethod, LocalIdentity, NatType, P2pConfig, P2pError, PeerConnectionResult,
    StunResult,
};

/// Orders connection strategies for a peer: direct TCP first, hole punch
/// when the peer's NAT allows it. Relay is reported as unavailable rather
/// than attempted.
pub struct PeerConnector {
    config: P2pConfig,
    registry: PeerEndpointRegistry,
    reflexive: Arc<ReflexiveCache>,
    coordinator: Arc<HolePunchCoordinator>,
}

impl PeerConnector {
    /// Build a connector plus the receiver for connections where the
    /// remote peer initiated the hole punch.
    pub fn new(
        config: P2pConfig,
        identity: LocalIdentity,
        outbound: mpsc::Sender<(String, DiscoveryMessage)>,
    ) -> (Self, mpsc::Receiver<IncomingPeer>) {
        let reflexive = Arc::new(ReflexiveCache::new(&config));
        let (coordinator, incoming) = HolePunchCoordinator::new(
            config.clone(),
            identity,
            Arc::clone(&reflexive),
            outbound,
        );
        (
            Self {
                config,
                registry: PeerEndpointRegistry::default(),
                reflexive,
                coordinator: Arc::new(coordinator),
            },
            incoming,
        )
    }

    /// The coordinator, for routing inbound discovery envelopes into it.
    pub fn coordinator(&self) -> Arc<HolePunchCoordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn registry(&self) -> &PeerEndpointRegistry {
        &self.registry
    }

    /// Our NAT characterization, cached between calls.
    pub async fn public_endpoint(&self) -> StunResult {
        self.reflexive.public_endpoint().await
    }

    /// Whether a hole punch is worth attempting for this NAT pairing.
    pub fn can_hole_punch(&self, ours: NatType, theirs: NatType) -> bool {
        can_hole_punch(ours, theirs)
    }

    /// Connect to a peer, trying strategies in order of cost. `lan` is the
    /// peer's private endpoint, `public` its reflexive endpoint if known.
    pub async fn connect(
        &self,
        peer_id: &str,
        lan: SocketAddr,
        public: Option<SocketAddr>,
    ) -> PeerConnectionResult {
        self.registry.observe(peer_id, public, Some(lan)).await;

        // Same-LAN peers answer on their private endpoint directly
        if let Some(stream) = self.try_direct(lan).await {
            info!(peer = peer_id, %lan, "connected directly");
            return PeerConnectionResult::connected(stream, lan, ConnectionMethod::Direct);
        }

        let Some(peer_public) = public else {
            return PeerConnectionResult::failed(format!(
                "direct connect to {} failed and no public endpoint is known for {}",
                lan, peer_id
            ));
        };

        let ours = self.reflexive.public_endpoint().await;
        if !ours.success {
            return PeerConnectionResult::failed(format!(
                "cannot hole punch: NAT characterization failed: {}",
                ours.error.as_deref().unwrap_or("unknown error")
            ));
        }

        match self.coordinator.punch(peer_id, peer_public, &ours).await {
            Ok((stream, remote)) => {
                info!(peer = peer_id, %remote, "connected via hole punch");
                PeerConnectionResult::connected(stream, remote, ConnectionMethod::HolePunch)
            }
            Err(err) => PeerConnectionResult::failed(format!(
                "hole punch to {} failed: {} (our NAT: {:?})",
                peer_id, err, ours.nat_type
            )),
        }
    }

    async fn try_direct(&self, addr: SocketAddr) -> Option<TcpStream> {
        match timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Some(stream),
            Ok(Err(err)) => {
                debug!(%addr, "direct connect failed: {}", err);
                None
            }
            Err(_) => {
                debug!(%addr, "direct connect timed out");
                None
            }
        }
    }
}
