//! Admin endpoints for health checks, metrics and generation status.

use crate::generation::GenerationStore;
use crate::metrics::Metrics;
use crate::router::Direction;
use crate::service::{error_response, ProxyBody};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, warn};

/// Admin service.
///
/// Serves:
/// - `/health` - Health check endpoint returning 200 OK
/// - `/metrics` - Prometheus metrics in text format
/// - `/generation` - JSON summary of the active configuration generation
#[derive(Clone)]
pub struct AdminService {
    store: Arc<GenerationStore>,
}

/// Summary of the active generation.
#[derive(Debug, Serialize)]
pub struct GenerationStatus {
    pub id: u64,
    pub service_identity: String,
    pub inbound_ports: usize,
    pub outbound_ports: usize,
    pub pooled_connections: usize,
}

impl AdminService {
    pub fn new(store: Arc<GenerationStore>) -> Self {
        Self { store }
    }

    /// Returns the status of the active generation.
    pub fn generation_status(&self) -> GenerationStatus {
        let generation = self.store.load();
        GenerationStatus {
            id: generation.id(),
            service_identity: generation.service_identity().to_string(),
            inbound_ports: generation.router(Direction::Inbound).len(),
            outbound_ports: generation.router(Direction::Outbound).len(),
            pooled_connections: generation.pool().stats().idle_connections,
        }
    }

    fn handle_request(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        match req.uri().path() {
            "/health" => {
                debug!("health check requested");
                text_response("text/plain", "healthy".to_string())
            }
            "/metrics" => {
                debug!("metrics requested");
                match Metrics::encode() {
                    Ok(metrics) => text_response("text/plain; version=0.0.4", metrics),
                    Err(e) => {
                        warn!("failed to encode metrics: {}", e);
                        error_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Failed to encode metrics",
                        )
                    }
                }
            }
            "/generation" => match serde_json::to_string(&self.generation_status()) {
                Ok(body) => text_response("application/json", body),
                Err(e) => {
                    warn!("failed to encode generation status: {}", e);
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode status")
                }
            },
            _ => error_response(StatusCode::NOT_FOUND, "Not Found"),
        }
    }
}

fn text_response(content_type: &str, body: String) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", content_type)
        .body(
            Full::new(Bytes::from(body))
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, ""))
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let response = self.handle_request(req);
        Box::pin(async move { Ok(response) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{ClusterConfig, MeshConfig, PortConfig, TrafficPolicy};

    #[test]
    fn test_text_response() {
        let response = text_response("text/plain; version=0.0.4", "test_metric 1.0".to_string());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/plain; version=0.0.4"
        );
    }

    #[test]
    fn test_generation_status() {
        let mut outbound = TrafficPolicy::default();
        outbound
            .traffic_matches
            .insert("14001".to_string(), PortConfig::default());
        outbound
            .clusters_configs
            .insert("c1".to_string(), ClusterConfig::with_endpoints(["10.0.0.1:14001"]));
        let config = MeshConfig {
            service_identity: "bookbuyer".to_string(),
            outbound: Some(outbound),
            ..Default::default()
        };

        let store = Arc::new(GenerationStore::new(&config).unwrap());
        let admin = AdminService::new(Arc::clone(&store));
        let status = admin.generation_status();
        assert_eq!(status.id, 1);
        assert_eq!(status.service_identity, "bookbuyer");
        assert_eq!(status.outbound_ports, 1);
        assert_eq!(status.inbound_ports, 0);

        store.reload(&config).unwrap();
        assert_eq!(admin.generation_status().id, 2);

        let json = serde_json::to_value(admin.generation_status()).unwrap();
        assert_eq!(json["service_identity"], "bookbuyer");
    }
}
