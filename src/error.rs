//! Error types for the sidecar decision core.

use std::io;
use thiserror::Error;

/// Errors raised while building a configuration generation.
///
/// Any of these aborts the build; the previously active generation keeps
/// serving traffic.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A route rule path regex failed to compile.
    #[error("invalid path regex '{pattern}': {source}")]
    InvalidPathRegex {
        pattern: String,
        source: regex::Error,
    },

    /// A route rule header regex failed to compile.
    #[error("invalid regex '{pattern}' for header '{header}': {source}")]
    InvalidHeaderRegex {
        header: String,
        pattern: String,
        source: regex::Error,
    },

    /// Certificate PEM material could not be parsed.
    #[error("invalid certificate material: {reason}")]
    InvalidCertificate { reason: String },

    /// Private key PEM material could not be parsed.
    #[error("invalid private key material: {reason}")]
    InvalidPrivateKey { reason: String },

    /// A CIDR range could not be parsed.
    #[error("invalid CIDR range '{range}': {reason}")]
    InvalidCidr { range: String, reason: String },

    /// A traffic match key is not a port number.
    #[error("invalid port '{port}'")]
    InvalidPort { port: String },

    /// A service identity cannot be carried in a header value.
    #[error("invalid service identity '{identity}'")]
    InvalidServiceIdentity { identity: String },

    /// A `RetryOn` token is neither a status code nor a status class.
    #[error("invalid RetryOn token '{token}' in cluster '{cluster}'")]
    InvalidRetryOn { cluster: String, token: String },

    /// The configuration snapshot could not be deserialized.
    #[error("failed to parse mesh configuration: {0}")]
    Parse(String),

    /// The configuration snapshot could not be read.
    #[error("failed to read mesh configuration: {0}")]
    Read(#[from] io::Error),
}

/// Errors that can occur while handling proxied traffic.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Failed to bind to the listener address.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// Failed to connect to an upstream endpoint.
    #[error("failed to connect to upstream {addr}: {source}")]
    UpstreamConnect { addr: String, source: io::Error },

    /// HTTP protocol error.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// No route matched the request.
    #[error("no route matched {method} {path}")]
    NoRouteMatch { method: String, path: String },

    /// The matched route selected a cluster that is not configured.
    #[error("no viable upstream cluster for route")]
    NoCluster,

    /// The selected cluster has no selectable endpoint.
    #[error("cluster '{cluster}' has no selectable endpoint")]
    NoEndpoint { cluster: String },

    /// TLS handshake with an upstream failed.
    #[error("TLS handshake with {addr} failed: {reason}")]
    TlsHandshake { addr: String, reason: String },

    /// SOCKS handshake with an egress gateway failed.
    #[error("tunnel through gateway {gateway} failed: {reason}")]
    TunnelHandshake { gateway: String, reason: String },

    /// Upstream attempt timed out.
    #[error("request timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Request body could not be buffered for replay.
    #[error("failed to buffer request body: {0}")]
    BodyBuffer(String),

    /// Configuration generation could not be built.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ProxyError {
    /// Returns true when the error came from establishing or using an
    /// upstream connection, as opposed to a routing decision.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamConnect { .. }
                | ProxyError::Http(_)
                | ProxyError::Io(_)
                | ProxyError::TlsHandshake { .. }
                | ProxyError::TunnelHandshake { .. }
                | ProxyError::Timeout { .. }
        )
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_failure_classification() {
        let connect = ProxyError::UpstreamConnect {
            addr: "10.0.0.1:80".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(connect.is_transport_failure());
        assert!(ProxyError::Timeout { duration_ms: 10 }.is_transport_failure());
        assert!(!ProxyError::NoCluster.is_transport_failure());
        assert!(!ProxyError::NoRouteMatch {
            method: "GET".to_string(),
            path: "/".to_string(),
        }
        .is_transport_failure());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidRetryOn {
            cluster: "c1".to_string(),
            token: "abc".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid RetryOn token 'abc' in cluster 'c1'"
        );
    }
}
