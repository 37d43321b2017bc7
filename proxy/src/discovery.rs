//! Backend discovery
//!
//! The proxy never hardcodes backend addresses. Both the initial connection
//! and every hand-off ask a [`Discovery`] implementation to map a service
//! class to an address.

use crate::error::DiscoveryError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Maps a service class to the address of a backend serving it
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn resolve(&self, service_class: &str) -> Result<SocketAddr, DiscoveryError>;
}

/// Discovery backed by a fixed table, usually filled from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    backends: HashMap<String, SocketAddr>,
}

impl StaticDiscovery {
    pub fn new(backends: HashMap<String, SocketAddr>) -> Self {
        Self { backends }
    }

    pub fn with_backend(mut self, service_class: &str, address: SocketAddr) -> Self {
        self.backends.insert(service_class.to_string(), address);
        self
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn resolve(&self, service_class: &str) -> Result<SocketAddr, DiscoveryError> {
        self.backends
            .get(service_class)
            .copied()
            .ok_or_else(|| DiscoveryError::UnknownServiceClass(service_class.to_string()))
    }
}

/// Resolves `service_class`, failing with [`DiscoveryError::Timeout`] after `limit`
pub async fn resolve_within(
    discovery: Arc<dyn Discovery>,
    service_class: &str,
    limit: Duration,
) -> Result<SocketAddr, DiscoveryError> {
    match tokio::time::timeout(limit, discovery.resolve(service_class)).await {
        Ok(result) => result,
        Err(_) => Err(DiscoveryError::Timeout(service_class.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StalledDiscovery;

    #[async_trait]
    impl Discovery for StalledDiscovery {
        async fn resolve(&self, _service_class: &str) -> Result<SocketAddr, DiscoveryError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(DiscoveryError::Backend("unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_static_lookup() {
        let addr: SocketAddr = "10.0.0.1:19132".parse().unwrap();
        let discovery = StaticDiscovery::default().with_backend("lobby", addr);

        assert_eq!(discovery.resolve("lobby").await, Ok(addr));
        assert_eq!(
            discovery.resolve("pvp").await,
            Err(DiscoveryError::UnknownServiceClass("pvp".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_times_out() {
        let result = resolve_within(Arc::new(StalledDiscovery), "lobby", Duration::from_secs(2)).await;
        assert_eq!(result, Err(DiscoveryError::Timeout("lobby".to_string())));
    }

    #[tokio::test]
    async fn test_resolution_within_limit() {
        let addr: SocketAddr = "10.0.0.1:19132".parse().unwrap();
        let discovery: Arc<dyn Discovery> = Arc::new(StaticDiscovery::default().with_backend("lobby", addr));
        assert_eq!(
            resolve_within(discovery, "lobby", Duration::from_secs(1)).await,
            Ok(addr)
        );
    }

    #[test]
    fn test_backend_table_from_config() {
        let mut backends = HashMap::new();
        backends.insert("lobby".to_string(), "10.0.0.1:19132".parse().unwrap());
        backends.insert("survival".to_string(), "10.0.0.2:19132".parse().unwrap());
        let discovery = StaticDiscovery::new(backends);

        let survival = tokio_test::assert_ok!(tokio_test::block_on(discovery.resolve("survival")));
        assert_eq!(survival.port(), 19132);
        tokio_test::assert_err!(tokio_test::block_on(discovery.resolve("creative")));
    }
}
