#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod p2p;

pub use p2p::{
    can_hole_punch, ConnectionMethod, DiscoveryMessage, HolePunchCoordinator, IncomingPeer,
    LocalIdentity, MessagePayload, MessageType, NatType, P2pConfig, P2pError, PeerConnectionResult,
    PeerConnector, PeerEndpointRegistry, StunClient, StunResult, DISCOVERY_MAGIC,
};
