//! Process settings for the sidecar.

use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Settings validation errors.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// Invalid listen address format.
    #[error("invalid {listener} address '{addr}': {reason}")]
    InvalidListenAddr {
        listener: &'static str,
        addr: String,
        reason: String,
    },

    /// Two listeners share an address.
    #[error("{first} and {second} listeners cannot share address {addr}")]
    DuplicateAddrs {
        first: &'static str,
        second: &'static str,
        addr: String,
    },

    /// Invalid timeout value.
    #[error("invalid timeout value: {reason}")]
    InvalidTimeout { reason: String },

    /// Unknown no-route policy name.
    #[error("invalid no-route policy '{0}', expected 'reject' or 'passthrough'")]
    InvalidNoRoutePolicy(String),
}

/// What to do with a request that matches no route or no cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoRoutePolicy {
    /// Answer 404 (no route) or 503 (no cluster).
    #[default]
    Reject,
    /// Forward the request unchanged to its own authority.
    PassThrough,
}

impl FromStr for NoRoutePolicy {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(NoRoutePolicy::Reject),
            "passthrough" | "pass-through" => Ok(NoRoutePolicy::PassThrough),
            other => Err(SettingsError::InvalidNoRoutePolicy(other.to_string())),
        }
    }
}

/// Sidecar settings loaded at startup.
///
/// # Environment Variables
///
/// * `SIDECAR_INBOUND_ADDR` - Inbound listener address (default: "0.0.0.0:15003")
/// * `SIDECAR_OUTBOUND_ADDR` - Outbound listener address (default: "127.0.0.1:15001")
/// * `SIDECAR_ADMIN_ADDR` - Health and metrics address (default: "127.0.0.1:15000")
/// * `SIDECAR_MESH_CONFIG` - Path of the mesh snapshot, JSON or TOML (default: "mesh.json")
/// * `SIDECAR_REQUEST_TIMEOUT_MS` - Upstream request timeout in milliseconds (default: 30000)
/// * `SIDECAR_NO_ROUTE_POLICY` - `reject` or `passthrough` (default: "reject")
///
/// # Example
///
/// ```
/// use mesh_sidecar::config::ProxyConfig;
///
/// let config = ProxyConfig::from_env().unwrap();
/// assert!(!config.outbound_addr.is_empty());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address receiving traffic destined for the workload.
    pub inbound_addr: String,

    /// Address receiving traffic the workload sends into the mesh.
    pub outbound_addr: String,

    /// Address serving health and metrics.
    pub admin_addr: String,

    /// Location of the mesh configuration snapshot.
    pub mesh_config_path: PathBuf,

    /// Upper bound on connecting to and hearing back from an upstream.
    pub request_timeout: Duration,

    /// Handling of unroutable requests.
    #[serde(default)]
    pub no_route_policy: NoRoutePolicy,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            inbound_addr: "0.0.0.0:15003".to_string(),
            outbound_addr: "127.0.0.1:15001".to_string(),
            admin_addr: "127.0.0.1:15000".to_string(),
            mesh_config_path: PathBuf::from("mesh.json"),
            request_timeout: Duration::from_secs(30),
            no_route_policy: NoRoutePolicy::Reject,
        }
    }
}

impl ProxyConfig {
    /// Loads settings from environment variables with fallback to defaults.
    pub fn from_env() -> Result<Self, SettingsError> {
        let defaults = Self::default();

        let inbound_addr = env::var("SIDECAR_INBOUND_ADDR").unwrap_or(defaults.inbound_addr);
        let outbound_addr = env::var("SIDECAR_OUTBOUND_ADDR").unwrap_or(defaults.outbound_addr);
        let admin_addr = env::var("SIDECAR_ADMIN_ADDR").unwrap_or(defaults.admin_addr);

        let mesh_config_path = env::var("SIDECAR_MESH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or(defaults.mesh_config_path);

        let request_timeout = env::var("SIDECAR_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.request_timeout);

        let no_route_policy = match env::var("SIDECAR_NO_ROUTE_POLICY") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.no_route_policy,
        };

        Ok(Self {
            inbound_addr,
            outbound_addr,
            admin_addr,
            mesh_config_path,
            request_timeout,
            no_route_policy,
        })
    }

    /// Loads settings from environment variables and validates them.
    pub fn from_env_validated() -> Result<Self, SettingsError> {
        let config = Self::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A listener address is not a valid socket address
    /// - Two listeners share an address
    /// - Timeout is zero or too large
    pub fn validate(&self) -> Result<(), SettingsError> {
        let listeners = [
            ("inbound", &self.inbound_addr),
            ("outbound", &self.outbound_addr),
            ("admin", &self.admin_addr),
        ];

        for (listener, addr) in listeners {
            addr.parse::<SocketAddr>()
                .map_err(|e| SettingsError::InvalidListenAddr {
                    listener,
                    addr: addr.clone(),
                    reason: e.to_string(),
                })?;
        }

        for (i, (first, addr)) in listeners.iter().enumerate() {
            if let Some((second, _)) = listeners[i + 1..].iter().find(|(_, other)| other == addr) {
                return Err(SettingsError::DuplicateAddrs {
                    first: *first,
                    second: *second,
                    addr: addr.to_string(),
                });
            }
        }

        if self.request_timeout.is_zero() {
            return Err(SettingsError::InvalidTimeout {
                reason: "timeout must be greater than zero".to_string(),
            });
        }

        if self.request_timeout > Duration::from_secs(3600) {
            return Err(SettingsError::InvalidTimeout {
                reason: "timeout must not exceed 1 hour".to_string(),
            });
        }

        Ok(())
    }

    /// Returns the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.request_timeout
    }
}
