/**
 * p2p/registry.rs
 *
 * Shared caches: peers' advertised endpoints and our own reflexive
 * (public) endpoint. Updates replace whole values so readers never
 * observe a half-written entry.
 */

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

use super::stun::StunClient;
use super::types::{P2pConfig, StunResult};

/// A peer's last known endpoints
#[derive(Debug, Clone)]
pub struct PeerEndpointInfo {
    pub peer_id: String,
    pub public_endpoint: Option<SocketAddr>,
    pub private_endpoint: Option<SocketAddr>,
    pub last_seen: Instant,
}

/// Registry of peers' endpoints, pruned by age
#[derive(Default)]
pub struct PeerEndpointRegistry {
    peers: RwLock<HashMap<String, PeerEndpointInfo>>,
}

impl PeerEndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or refresh) a peer's endpoints. Replaces the whole entry.
    pub async fn observe(
        &self,
        peer_id: &str,
        public: Option<SocketAddr>,
        private: Option<SocketAddr>,
    ) {
        let info = PeerEndpointInfo {
            peer_id: peer_id.to_string(),
            public_endpoint: public,
            private_endpoint: private,
            last_seen: Instant::now(),
        };
        self.peers.write().await.insert(peer_id.to_string(), info);
    }

    pub async fn get(&self, peer_id: &str) -> Option<PeerEndpointInfo> {
        self.peers.read().await.get(peer_id).cloned()
    }

    /// Drop every entry not seen within `max_age`.
    pub async fn prune(&self, max_age: Duration) {
        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|_, info| info.last_seen.elapsed() <= max_age);
        let dropped = before - peers.len();
        if dropped > 0 {
            debug!("pruned {} stale peer endpoint entries", dropped);
        }
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}

struct CachedStun {
    result: StunResult,
    fetched: Instant,
}

/// Our own public-endpoint classification, refreshed through STUN at most
/// once per TTL window. Failed characterizations are not cached, so the
/// next caller retries.
pub struct ReflexiveCache {
    client: StunClient,
    servers: [String; 2],
    ttl: Duration,
    slot: RwLock<Option<CachedStun>>,
}

impl ReflexiveCache {
    pub fn new(config: &P2pConfig) -> Self {
        Self {
            client: StunClient::new(config.stun_timeout),
            servers: config.stun_servers.clone(),
            ttl: config.stun_cache_ttl,
            slot: RwLock::new(None),
        }
    }

    /// Cached classification when fresh; otherwise a fresh two-server run.
    pub async fn public_endpoint(&self) -> StunResult {
        {
            let slot = self.slot.read().await;
            if let Some(cached) = slot.as_ref() {
                if cached.fetched.elapsed() < self.ttl {
                    return cached.result.clone();
                }
            }
        }

        let result = self
            .client
            .detect_nat_type(&self.servers[0], &self.servers[1])
            .await;
        if result.success {
            self.seed(result.clone()).await;
        }
        result
    }

    /// Replace the cached classification wholesale.
    pub async fn seed(&self, result: StunResult) {
        let mut slot = self.slot.write().await;
        *slot = Some(CachedStun {
            result,
            fetched: Instant::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::types::NatType;

    fn endpoint(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn observe_then_get() {
        tokio_test::block_on(async {
            let registry = PeerEndpointRegistry::new();
            registry
                .observe(
                    "peer-a",
                    Some(endpoint("203.0.113.5:47999")),
                    Some(endpoint("192.168.1.20:47999")),
                )
                .await;

            let info = registry.get("peer-a").await.unwrap();
            assert_eq!(info.public_endpoint, Some(endpoint("203.0.113.5:47999")));
            assert_eq!(info.private_endpoint, Some(endpoint("192.168.1.20:47999")));
            assert!(registry.get("peer-b").await.is_none());
        });
    }

    #[test]
    fn observe_replaces_the_whole_entry() {
        tokio_test::block_on(async {
            let registry = PeerEndpointRegistry::new();
            registry
                .observe("peer-a", Some(endpoint("203.0.113.5:1")), None)
                .await;
            registry
                .observe("peer-a", None, Some(endpoint("192.168.1.20:2")))
                .await;

            let info = registry.get("peer-a").await.unwrap();
            assert!(info.public_endpoint.is_none());
            assert_eq!(info.private_endpoint, Some(endpoint("192.168.1.20:2")));
            assert_eq!(registry.len().await, 1);
        });
    }

    #[test]
    fn prune_drops_only_stale_entries() {
        tokio_test::block_on(async {
            let registry = PeerEndpointRegistry::new();
            registry.observe("peer-a", None, None).await;

            registry.prune(Duration::from_secs(3600)).await;
            assert_eq!(registry.len().await, 1);

            // A zero max-age makes everything stale
            registry.prune(Duration::ZERO).await;
            assert!(registry.is_empty().await);
        });
    }

    #[test]
    fn seeded_cache_is_served_within_ttl() {
        tokio_test::block_on(async {
            let cache = ReflexiveCache::new(&P2pConfig::default());
            let seeded = StunResult {
                success: true,
                nat_type: NatType::FullCone,
                public_ip: Some("198.51.100.9".parse().unwrap()),
                public_port: 40000,
                error: None,
            };
            cache.seed(seeded).await;

            let result = cache.public_endpoint().await;
            assert!(result.success);
            assert_eq!(result.nat_type, NatType::FullCone);
            assert_eq!(result.public_port, 40000);
        });
    }

    #[test]
    fn expired_cache_entry_is_not_served() {
        tokio_test::block_on(async {
            let config = P2pConfig {
                stun_cache_ttl: Duration::ZERO,
                stun_timeout: Duration::from_millis(20),
                stun_servers: ["127.0.0.1:9".to_string(), "127.0.0.1:9".to_string()],
                ..P2pConfig::default()
            };
            let cache = ReflexiveCache::new(&config);
            let seeded = StunResult {
                success: true,
                nat_type: NatType::FullCone,
                public_ip: Some("198.51.100.9".parse().unwrap()),
                public_port: 40000,
                error: None,
            };
            cache.seed(seeded).await;

            // TTL of zero forces a refresh; the dead STUN servers make it fail
            let result = cache.public_endpoint().await;
            assert!(!result.success);
        });
    }
}
