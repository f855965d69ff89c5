//! Mesh configuration snapshot consumed by the decision core.
//!
//! A [`MeshConfig`] is supplied whole by the configuration loader and is
//! immutable for the lifetime of one generation. Field names follow the
//! PascalCase shape the control plane emits.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Weight applied to endpoints and targets that do not specify one.
pub const DEFAULT_WEIGHT: u32 = 100;

/// Root of a configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MeshConfig {
    /// Identity of the workload this sidecar fronts.
    #[serde(default)]
    pub service_identity: String,
    /// Sidecar-wide client certificate used for mTLS.
    #[serde(default)]
    pub certificate: Option<CertificateSpec>,
    /// Policy for traffic arriving at the workload.
    #[serde(default)]
    pub inbound: Option<TrafficPolicy>,
    /// Policy for traffic leaving the workload.
    #[serde(default)]
    pub outbound: Option<TrafficPolicy>,
    /// Egress gateway forwarding policy.
    #[serde(default)]
    pub forward: Option<ForwardPolicy>,
}

impl MeshConfig {
    /// Parses a snapshot from a JSON string.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parses a snapshot from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reads a snapshot from disk, choosing the format by file extension.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml(&content),
            _ => Self::from_json(&content),
        }
    }
}

/// Per-direction traffic policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TrafficPolicy {
    /// Listening port (as a string key) to port configuration.
    #[serde(default)]
    pub traffic_matches: BTreeMap<String, PortConfig>,
    /// Cluster name to cluster configuration.
    #[serde(default)]
    pub clusters_configs: BTreeMap<String, ClusterConfig>,
}

/// Per-listening-port configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortConfig {
    /// Service name to its ordered route rules.
    #[serde(default)]
    pub http_service_route_rules: BTreeMap<String, Vec<RouteRule>>,
    /// Virtual host (as seen in the `Host` header) to service name.
    #[serde(default, rename = "HttpHostPort2Service")]
    pub http_host_port_to_service: BTreeMap<String, String>,
    /// Source CIDRs whose callers bypass identity enforcement (inbound).
    #[serde(default, rename = "SourceIPRanges")]
    pub source_ip_ranges: Vec<String>,
    /// Destination CIDRs carrying their own client certificate (outbound).
    #[serde(default, rename = "DestinationIPRanges")]
    pub destination_ip_ranges: BTreeMap<String, DestinationSpec>,
    /// Forward-match group used to pick an egress gateway.
    #[serde(default)]
    pub egress_forward_gateway: Option<String>,
    /// Whether connections leaving the mesh from this port use egress bypass.
    #[serde(default)]
    pub allowed_egress_traffic: bool,
    /// Identity stamped on outbound requests; falls back to the sidecar's.
    #[serde(default)]
    pub service_identity: Option<String>,
}

/// Path matching strategy for a route rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathMatchType {
    Exact,
    Prefix,
    Regex,
}

/// A single HTTP route rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RouteRule {
    /// How `path` is compared against the request path.
    #[serde(rename = "Type")]
    pub match_type: PathMatchType,
    /// Path literal, prefix or regex.
    pub path: String,
    /// Header name to regex; every entry must match.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Allowed methods; `None` means every standard method.
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    /// Target cluster name to weight. `null` means the default weight,
    /// `0` marks a standby (failover) target.
    #[serde(default)]
    pub target_clusters: BTreeMap<String, Option<u32>>,
    /// Caller identities allowed to use this rule (inbound only).
    #[serde(default)]
    pub allowed_services: Option<Vec<String>>,
}

impl RouteRule {
    /// Creates a rule with no headers, default methods and no targets.
    pub fn new(match_type: PathMatchType, path: impl Into<String>) -> Self {
        Self {
            match_type,
            path: path.into(),
            headers: BTreeMap::new(),
            methods: None,
            target_clusters: BTreeMap::new(),
            allowed_services: None,
        }
    }

    /// Adds a header regex condition.
    pub fn with_header(mut self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.headers.insert(name.into(), pattern.into());
        self
    }

    /// Restricts the rule to the given methods.
    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = Some(methods.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a weighted target cluster.
    pub fn with_target(mut self, cluster: impl Into<String>, weight: u32) -> Self {
        self.target_clusters.insert(cluster.into(), Some(weight));
        self
    }

    /// Restricts the rule to the given caller identities.
    pub fn with_allowed_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_services = Some(services.into_iter().map(Into::into).collect());
        self
    }

    /// Returns the primary-selection weights, with unspecified weights
    /// defaulted.
    pub fn primary_weights(&self) -> impl Iterator<Item = (&str, u32)> {
        self.target_clusters
            .iter()
            .map(|(name, weight)| (name.as_str(), weight.unwrap_or(DEFAULT_WEIGHT)))
    }
}

/// Upstream cluster configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterConfig {
    /// Endpoint address to endpoint settings.
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointConfig>,
    /// Retry behaviour for requests sent to this cluster.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicyConfig>,
    /// Connection tuning.
    #[serde(default)]
    pub connection_settings: Option<ConnectionSettings>,
}

impl ClusterConfig {
    /// Creates a cluster from endpoint addresses with the default weight.
    pub fn with_endpoints<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints
                .into_iter()
                .map(|addr| (addr.into(), EndpointConfig::default()))
                .collect(),
            ..Default::default()
        }
    }

    /// Sets the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicyConfig) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Returns endpoint weights; a missing or zero weight counts as the
    /// default weight.
    pub fn endpoint_weights(&self) -> impl Iterator<Item = (&str, u32)> {
        self.endpoints.iter().map(|(addr, endpoint)| {
            let weight = match endpoint.weight {
                Some(w) if w > 0 => w,
                _ => DEFAULT_WEIGHT,
            };
            (addr.as_str(), weight)
        })
    }
}

/// Per-endpoint settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointConfig {
    #[serde(default)]
    pub weight: Option<u32>,
}

/// Retry policy as configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RetryPolicyConfig {
    /// Maximum retries after the initial attempt.
    #[serde(default)]
    pub num_retries: Option<u32>,
    /// Comma separated status codes or classes such as `5xx`.
    #[serde(default)]
    pub retry_on: Option<String>,
    /// Backoff base interval in seconds.
    #[serde(default)]
    pub retry_backoff_base_interval: Option<f64>,
}

/// Connection tuning options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectionSettings {
    #[serde(default)]
    pub http: Option<HttpConnectionSettings>,
}

/// HTTP connection tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HttpConnectionSettings {
    /// Requests served by one upstream connection before it is retired.
    #[serde(default)]
    pub max_requests_per_connection: Option<u32>,
}

/// Certificate material in PEM form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CertificateSpec {
    pub cert_chain: String,
    pub private_key: String,
    #[serde(default, rename = "IssuingCA")]
    pub issuing_ca: Option<String>,
}

/// Security settings for an outbound destination range.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DestinationSpec {
    #[serde(default)]
    pub source_cert: Option<CertificateSpec>,
}

/// Egress gateway forwarding policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ForwardPolicy {
    /// Forward-match group to gateway name and weight (`0` = default).
    #[serde(default)]
    pub forward_matches: BTreeMap<String, BTreeMap<String, u32>>,
    /// Gateway name to its endpoint pool.
    #[serde(default)]
    pub egress_gateways: BTreeMap<String, ClusterConfig>,
}
