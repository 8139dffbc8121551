//! Round-robin pool of Solana RPC clients.
//!
//! Endpoints are health-probed once at startup; unhealthy ones are dropped.
//! Callers that observe an RPC failure may park an endpoint for a cooldown
//! period of their choosing, after which it rejoins the rotation.

use crate::config::NodeConfig;
use solana_client::nonblocking::rpc_client::RpcClient;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

/// Well-known public endpoint used for default queries when present.
pub const MAINNET_RPC: &str = "https://api.mainnet-beta.solana.com";

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const ALL_COOLING_RESCAN_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no healthy rpc endpoints available")]
    NoHealthyEndpoints,
}

/// A healthy endpoint retained by the pool.
pub struct PooledEndpoint {
    pub name: String,
    pub config: NodeConfig,
    client: Arc<RpcClient>,
}

impl PooledEndpoint {
    pub fn new(name: impl Into<String>, config: NodeConfig, client: Arc<RpcClient>) -> Self {
        Self {
            name: name.into(),
            config,
            client,
        }
    }
}

/// A borrowed client plus the endpoint name it is pinned to, so callers can
/// report failures back to the pool.
#[derive(Clone)]
pub struct ClientHandle {
    pub name: String,
    pub client: Arc<RpcClient>,
}

struct PoolState {
    current_idx: usize,
    cooldown_until: Vec<Instant>,
}

pub struct RpcPool {
    endpoints: Vec<PooledEndpoint>,
    state: Mutex<PoolState>,
}

impl RpcPool {
    /// Probe every configured endpoint and build a pool from the healthy
    /// ones. Fails if none answer the health check in time.
    pub async fn connect(nodes: HashMap<String, NodeConfig>) -> Result<Self, PoolError> {
        let initial = nodes.len();
        let mut endpoints = Vec::new();

        for (name, config) in nodes {
            let client = Arc::new(RpcClient::new_with_timeout(
                config.rpc.clone(),
                HEALTH_PROBE_TIMEOUT,
            ));

            match client.get_health().await {
                Ok(()) => {
                    info!(endpoint = %name, "endpoint is healthy");
                    endpoints.push(PooledEndpoint { name, config, client });
                }
                Err(e) => {
                    warn!(endpoint = %name, error = %e, "removing unhealthy endpoint");
                }
            }
        }

        if endpoints.is_empty() {
            return Err(PoolError::NoHealthyEndpoints);
        }

        let names: Vec<&str> = endpoints.iter().map(|e| e.name.as_str()).collect();
        info!(healthy = endpoints.len(), configured = initial, endpoints = ?names, "rpc pool ready");

        Ok(Self::from_endpoints(endpoints))
    }

    /// Build a pool from already-constructed endpoints, skipping the health
    /// probe. All endpoints start outside cooldown.
    pub fn from_endpoints(endpoints: Vec<PooledEndpoint>) -> Self {
        let now = Instant::now();
        let cooldown_until = vec![now; endpoints.len()];
        Self {
            endpoints,
            state: Mutex::new(PoolState { current_idx: 0, cooldown_until }),
        }
    }

    pub fn size(&self) -> usize {
        self.endpoints.len()
    }

    /// Endpoints flagged to run a log observer.
    pub fn observer_endpoints(&self) -> impl Iterator<Item = &PooledEndpoint> {
        self.endpoints.iter().filter(|e| e.config.observer)
    }

    /// The next endpoint in round-robin order that is not cooling down.
    /// When every endpoint is cooling, sleeps briefly and rescans until one
    /// becomes available again.
    pub async fn next_client(&self) -> ClientHandle {
        loop {
            let now = Instant::now();
            {
                let mut state = self.state.lock().expect("pool state lock poisoned");
                let n = self.endpoints.len();
                for step in 0..n {
                    let idx = (state.current_idx + step) % n;
                    if state.cooldown_until[idx] <= now {
                        state.current_idx = (idx + 1) % n;
                        return self.handle(idx);
                    }
                }
            }

            warn!("all rpc endpoints are cooling down; waiting for one to recover");
            tokio::time::sleep(ALL_COOLING_RESCAN_DELAY).await;
        }
    }

    /// The client pinned to a specific endpoint name.
    pub fn named(&self, name: &str) -> Option<ClientHandle> {
        self.endpoints
            .iter()
            .position(|e| e.name == name)
            .map(|idx| self.handle(idx))
    }

    /// The client of the well-known public endpoint, if configured.
    pub fn base(&self) -> Option<ClientHandle> {
        self.endpoints
            .iter()
            .position(|e| e.config.rpc == MAINNET_RPC)
            .map(|idx| self.handle(idx))
    }

    /// Park an endpoint until now + `duration`. The duration is chosen by
    /// the caller; provider policies differ too much to fix one here.
    pub fn mark_cooldown(&self, name: &str, duration: Duration) {
        let Some(idx) = self.endpoints.iter().position(|e| e.name == name) else {
            return;
        };

        let mut state = self.state.lock().expect("pool state lock poisoned");
        state.cooldown_until[idx] = Instant::now() + duration;
    }

    /// Release all clients.
    pub fn close(self) {
        drop(self.endpoints);
    }

    fn handle(&self, idx: usize) -> ClientHandle {
        let endpoint = &self.endpoints[idx];
        ClientHandle {
            name: endpoint.name.clone(),
            client: Arc::clone(&endpoint.client),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_endpoint(name: &str, rpc: &str) -> PooledEndpoint {
        PooledEndpoint::new(
            name,
            NodeConfig {
                rpc: rpc.to_string(),
                ws: rpc.replace("http", "ws"),
                observer: false,
            },
            Arc::new(RpcClient::new(rpc.to_string())),
        )
    }

    fn test_pool(names: &[&str]) -> RpcPool {
        let endpoints = names
            .iter()
            .map(|n| test_endpoint(n, &format!("https://{n}.example.com")))
            .collect();
        RpcPool::from_endpoints(endpoints)
    }

    #[tokio::test]
    async fn test_connect_with_no_nodes_fails() {
        let result = RpcPool::connect(HashMap::new()).await;
        assert!(matches!(result, Err(PoolError::NoHealthyEndpoints)));
    }

    #[tokio::test]
    async fn test_round_robin_rotation() {
        let pool = test_pool(&["a", "b", "c"]);

        assert_eq!(pool.next_client().await.name, "a");
        assert_eq!(pool.next_client().await.name, "b");
        assert_eq!(pool.next_client().await.name, "c");
        assert_eq!(pool.next_client().await.name, "a");
    }

    #[tokio::test]
    async fn test_cooldown_skips_endpoint() {
        let pool = test_pool(&["a", "b"]);
        pool.mark_cooldown("a", Duration::from_secs(60));

        assert_eq!(pool.next_client().await.name, "b");
        assert_eq!(pool.next_client().await.name, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_cooling_waits_for_first_to_elapse() {
        let pool = test_pool(&["a", "b"]);
        pool.mark_cooldown("a", Duration::from_millis(200));
        pool.mark_cooldown("b", Duration::from_secs(60));

        // Never hands out an endpoint still in cooldown: the call parks
        // until "a" elapses, then returns it.
        let handle = pool.next_client().await;
        assert_eq!(handle.name, "a");
    }

    #[tokio::test]
    async fn test_named_and_base_lookup() {
        let mut endpoints = vec![test_endpoint("primary", "https://primary.example.com")];
        endpoints.push(test_endpoint("public", MAINNET_RPC));
        let pool = RpcPool::from_endpoints(endpoints);

        assert!(pool.named("primary").is_some());
        assert!(pool.named("unknown").is_none());
        assert_eq!(pool.base().map(|h| h.name).as_deref(), Some("public"));
    }

    #[tokio::test]
    async fn test_observer_endpoints_filter() {
        let mut observer = test_endpoint("obs", "https://obs.example.com");
        observer.config.observer = true;
        let plain = test_endpoint("plain", "https://plain.example.com");

        let pool = RpcPool::from_endpoints(vec![observer, plain]);
        let names: Vec<&str> = pool.observer_endpoints().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["obs"]);
    }
}
