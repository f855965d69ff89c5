//! Cluster registry: name to materialized cluster descriptor.

use crate::error::ConfigError;
use crate::mesh::ClusterConfig;
use crate::retry::RetryPolicy;
use crate::transport::LoadBalancer;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Connection tuning derived from a cluster's `ConnectionSettings`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Requests one upstream connection may serve before it is retired.
    pub max_requests_per_connection: Option<u32>,
}

/// A cluster ready for request-time use.
///
/// Bundles the endpoint balancer, the precomputed retry table and the
/// connection options. Descriptors are shared by every request of a
/// generation; only the balancer counters mutate.
#[derive(Debug)]
pub struct ClusterDescriptor {
    name: String,
    endpoints: BTreeMap<String, u32>,
    balancer: LoadBalancer,
    retry: RetryPolicy,
    connection: ConnectionOptions,
}

impl ClusterDescriptor {
    /// Materializes a descriptor from configuration and a validated policy.
    pub fn new(name: impl Into<String>, config: &ClusterConfig, retry: RetryPolicy) -> Self {
        let endpoints: BTreeMap<String, u32> = config
            .endpoint_weights()
            .map(|(addr, weight)| (addr.to_string(), weight))
            .collect();
        let balancer = LoadBalancer::new(endpoints.iter().map(|(a, w)| (a.clone(), *w)));
        let connection = ConnectionOptions {
            max_requests_per_connection: config
                .connection_settings
                .as_ref()
                .and_then(|s| s.http.as_ref())
                .and_then(|h| h.max_requests_per_connection)
                .filter(|max| *max > 0),
        };

        Self {
            name: name.into(),
            endpoints,
            balancer,
            retry,
            connection,
        }
    }

    /// Materializes a descriptor, validating the retry policy.
    pub fn from_config(name: &str, config: &ClusterConfig) -> Result<Self, ConfigError> {
        let retry = RetryPolicy::from_config(name, config.retry_policy.as_ref())?;
        Ok(Self::new(name, config, retry))
    }

    /// Returns the cluster name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns endpoint addresses and weights.
    pub fn endpoints(&self) -> &BTreeMap<String, u32> {
        &self.endpoints
    }

    /// Draws the next endpoint from the cluster's balancer.
    pub fn next_endpoint(&self) -> Option<&str> {
        self.balancer.next()
    }

    /// Returns the retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Returns the connection options.
    pub fn connection_options(&self) -> ConnectionOptions {
        self.connection
    }
}

/// Memoizing lookup from cluster name to descriptor.
///
/// Retry policies are validated when the registry is built so that lookups
/// cannot fail; descriptors themselves are materialized on first access and
/// reused for the rest of the generation.
pub struct ClusterRegistry {
    configs: HashMap<String, (ClusterConfig, RetryPolicy)>,
    cache: DashMap<String, Arc<ClusterDescriptor>>,
}

impl ClusterRegistry {
    /// Creates a registry, validating every cluster's retry policy.
    pub fn new(configs: &BTreeMap<String, ClusterConfig>) -> Result<Self, ConfigError> {
        let configs = configs
            .iter()
            .map(|(name, config)| {
                let retry = RetryPolicy::from_config(name, config.retry_policy.as_ref())?;
                Ok((name.clone(), (config.clone(), retry)))
            })
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;

        Ok(Self {
            configs,
            cache: DashMap::new(),
        })
    }

    /// Creates a registry with no clusters.
    pub fn empty() -> Self {
        Self {
            configs: HashMap::new(),
            cache: DashMap::new(),
        }
    }

    /// Returns the descriptor for `name`, or `None` if it is not configured.
    pub fn get(&self, name: &str) -> Option<Arc<ClusterDescriptor>> {
        if let Some(descriptor) = self.cache.get(name) {
            return Some(Arc::clone(descriptor.value()));
        }

        let (config, retry) = self.configs.get(name)?;
        let descriptor = self
            .cache
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(cluster = %name, "materializing cluster descriptor");
                Arc::new(ClusterDescriptor::new(name, config, retry.clone()))
            })
            .clone();
        Some(descriptor)
    }

    /// Returns true if `name` is a configured cluster.
    pub fn contains(&self, name: &str) -> bool {
        self.configs.contains_key(name)
    }

    /// Returns the number of configured clusters.
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// Returns true if no cluster is configured.
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{
        ConnectionSettings, EndpointConfig, HttpConnectionSettings, RetryPolicyConfig,
    };
    use std::time::Duration;

    fn registry() -> ClusterRegistry {
        let mut configs = BTreeMap::new();
        configs.insert(
            "c1".to_string(),
            ClusterConfig::with_endpoints(["10.0.0.1:80", "10.0.0.2:80"]).with_retry_policy(
                RetryPolicyConfig {
                    num_retries: Some(2),
                    retry_on: Some("503,5xx".to_string()),
                    retry_backoff_base_interval: Some(0.5),
                },
            ),
        );
        ClusterRegistry::new(&configs).unwrap()
    }

    #[test]
    fn test_get_is_memoized() {
        let registry = registry();
        let first = registry.get("c1").unwrap();
        let second = registry.get("c1").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "c1");
    }

    #[test]
    fn test_unknown_cluster_is_none() {
        let registry = registry();
        assert!(registry.get("missing").is_none());
        assert!(!registry.contains("missing"));
        assert!(ClusterRegistry::empty().get("c1").is_none());
    }

    #[test]
    fn test_descriptor_retry_table() {
        let descriptor = registry().get("c1").unwrap();
        let policy = descriptor.retry_policy();
        assert!(policy.is_enabled());
        assert_eq!(policy.num_retries(), 2);
        assert_eq!(policy.backoff_base(), Duration::from_millis(500));
        assert!(policy.is_retryable(503));
        assert!(policy.is_retryable(599));
        assert!(!policy.is_retryable(404));
    }

    #[test]
    fn test_descriptor_endpoint_rotation() {
        let descriptor = registry().get("c1").unwrap();
        let a = descriptor.next_endpoint().unwrap().to_string();
        let b = descriptor.next_endpoint().unwrap().to_string();
        assert_ne!(a, b);
        assert_eq!(descriptor.endpoints().len(), 2);
    }

    #[test]
    fn test_endpoint_weights_default_to_100() {
        let mut config = ClusterConfig::default();
        config
            .endpoints
            .insert("a:80".to_string(), EndpointConfig { weight: None });
        config
            .endpoints
            .insert("b:80".to_string(), EndpointConfig { weight: Some(300) });
        let descriptor = ClusterDescriptor::from_config("c", &config).unwrap();
        assert_eq!(descriptor.endpoints()["a:80"], 100);
        assert_eq!(descriptor.endpoints()["b:80"], 300);
    }

    #[test]
    fn test_connection_options() {
        let config = ClusterConfig {
            connection_settings: Some(ConnectionSettings {
                http: Some(HttpConnectionSettings {
                    max_requests_per_connection: Some(8),
                }),
            }),
            ..ClusterConfig::with_endpoints(["a:80"])
        };
        let descriptor = ClusterDescriptor::from_config("c", &config).unwrap();
        assert_eq!(
            descriptor.connection_options().max_requests_per_connection,
            Some(8)
        );
    }

    #[test]
    fn test_invalid_retry_on_rejected_at_build() {
        let mut configs = BTreeMap::new();
        configs.insert(
            "bad".to_string(),
            ClusterConfig::default().with_retry_policy(RetryPolicyConfig {
                num_retries: Some(1),
                retry_on: Some("5xx,oops".to_string()),
                retry_backoff_base_interval: None,
            }),
        );
        assert!(matches!(
            ClusterRegistry::new(&configs),
            Err(ConfigError::InvalidRetryOn { .. })
        ));
    }
}
