//! Tower service binding the decision core to hyper.
//!
//! One [`SidecarService`] exists per accepted connection. Every request
//! pins the active generation, routes through it and is then delivered:
//! inbound requests go once to an endpoint of the local cluster, outbound
//! requests go through the retry controller with optional failover.

use crate::config::{NoRoutePolicy, ProxyConfig};
use crate::egress::{self, TransportDirective};
use crate::error::{ProxyError, Result};
use crate::generation::{Generation, GenerationStore};
use crate::metrics::{Metrics, MetricsObserver};
use crate::retry::{self, RetryObserver};
use crate::router::{Direction, RequestContext, RoutingDecision, IDENTITY_HEADER};
use crate::socket::ConnectionAddrs;
use crate::transport::{BoxError, PoolKey, UpstreamBody};
use http::request::Parts;
use http::{Request, Response, StatusCode, Uri, Version};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tower::Service;
use tracing::{debug, info, instrument, warn};

/// Response body returned to downstream callers.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Per-service settings taken from the process configuration.
#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    /// Bound on connecting to and hearing back from an upstream.
    pub request_timeout: Duration,
    /// Handling of unroutable requests.
    pub no_route_policy: NoRoutePolicy,
}

impl From<&ProxyConfig> for ServiceSettings {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            request_timeout: config.request_timeout,
            no_route_policy: config.no_route_policy,
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from(&ProxyConfig::default())
    }
}

/// Request body that can be replayed when the request is buffered.
enum ReplayBody {
    Buffered(Bytes),
    Streaming(Option<Incoming>),
}

impl ReplayBody {
    fn next(&mut self) -> Result<UpstreamBody> {
        match self {
            ReplayBody::Buffered(bytes) => Ok(Full::new(bytes.clone())
                .map_err(|never| match never {})
                .boxed()),
            ReplayBody::Streaming(body) => body
                .take()
                .map(|body| body.map_err(|e| Box::new(e) as BoxError).boxed())
                .ok_or_else(|| ProxyError::BodyBuffer("request body already consumed".to_string())),
        }
    }
}

/// Sidecar service for one direction.
#[derive(Clone)]
pub struct SidecarService {
    direction: Direction,
    store: Arc<GenerationStore>,
    settings: ServiceSettings,
    observer: Arc<dyn RetryObserver>,
    connection: Option<ConnectionAddrs>,
}

impl SidecarService {
    /// Creates a service reporting retries to the metrics registry.
    pub fn new(direction: Direction, store: Arc<GenerationStore>, settings: ServiceSettings) -> Self {
        Self {
            direction,
            store,
            settings,
            observer: Arc::new(MetricsObserver),
            connection: None,
        }
    }

    /// Replaces the retry observer.
    pub fn with_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Binds the service to the addresses of a downstream connection.
    pub fn with_connection(mut self, connection: ConnectionAddrs) -> Self {
        self.connection = Some(connection);
        self
    }

    #[instrument(level = "debug", skip(self, req), fields(direction = %self.direction, method = %req.method(), uri = %req.uri()))]
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let start = Instant::now();
        let generation = self.store.load();
        let method = req.method().to_string();

        let (decision, port, host) = {
            let ctx = RequestContext::from_request(
                &req,
                self.connection.map(|c| c.peer.ip()),
                self.connection
                    .and_then(|c| c.destination_port(self.direction)),
            );
            let decision = generation.router(self.direction).route(&ctx);
            (decision, ctx.port(), ctx.host.to_string())
        };

        let (cluster_label, result) = match decision {
            Some(decision) if decision.cluster.is_some() => {
                let label = decision
                    .cluster
                    .as_ref()
                    .map(|c| c.name().to_string())
                    .unwrap_or_default();
                let result = match self.direction {
                    Direction::Inbound => self.forward_inbound(&generation, port, decision, req).await,
                    Direction::Outbound => {
                        self.forward_outbound(&generation, port, decision, req).await
                    }
                };
                (label, result)
            }
            Some(decision) => {
                debug!(service = %decision.service.name, "matched route has no viable cluster");
                let result = match self.settings.no_route_policy {
                    NoRoutePolicy::Reject => Err(ProxyError::NoCluster),
                    NoRoutePolicy::PassThrough => {
                        self.pass_through(&generation, port, &host, false, req).await
                    }
                };
                ("-".to_string(), result)
            }
            None => {
                let egress = self.direction == Direction::Outbound
                    && generation.egress().allows_egress(port);
                let result = if egress {
                    self.pass_through(&generation, port, &host, true, req).await
                } else {
                    match self.settings.no_route_policy {
                        NoRoutePolicy::Reject => Err(ProxyError::NoRouteMatch {
                            method: method.clone(),
                            path: req.uri().path().to_string(),
                        }),
                        NoRoutePolicy::PassThrough => {
                            self.pass_through(&generation, port, &host, false, req).await
                        }
                    }
                };
                ("-".to_string(), result)
            }
        };

        let response = match result {
            Ok(response) => response.map(|body| body.boxed()),
            Err(e) => {
                let status = status_for(&e);
                warn!(direction = %self.direction, status = status.as_u16(), error = %e, "request failed");
                error_response(status, &e.to_string())
            }
        };

        let duration = start.elapsed().as_secs_f64();
        info!(
            direction = %self.direction,
            method = %method,
            status = response.status().as_u16(),
            cluster = %cluster_label,
            generation = generation.id(),
            duration_ms = duration * 1000.0,
            "request completed"
        );
        Metrics::record_request(
            &self.direction.to_string(),
            &method,
            response.status().as_u16(),
            &cluster_label,
            duration,
        );

        response
    }

    /// Forwards an inbound request once to an endpoint of the matched
    /// cluster. The mesh identity header is not passed to the workload.
    async fn forward_inbound(
        &self,
        generation: &Generation,
        port: u16,
        decision: RoutingDecision,
        req: Request<Incoming>,
    ) -> Result<Response<Incoming>> {
        let cluster = decision.cluster.ok_or(ProxyError::NoCluster)?;
        let endpoint = cluster
            .next_endpoint()
            .ok_or_else(|| ProxyError::NoEndpoint {
                cluster: cluster.name().to_string(),
            })?
            .to_string();

        let (mut parts, body) = req.into_parts();
        parts.headers.remove(IDENTITY_HEADER);
        let mut replay = ReplayBody::Streaming(Some(body));
        let req = rebuild(&parts, replay.next()?);

        debug!(cluster = %cluster.name(), endpoint = %endpoint, ingress = decision.ingress_bypass, "forwarding inbound");
        self.send_upstream(
            generation,
            port,
            &endpoint,
            false,
            cluster.connection_options().max_requests_per_connection,
            req,
        )
        .await
    }

    /// Delivers an outbound request through the retry controller.
    async fn forward_outbound(
        &self,
        generation: &Generation,
        port: u16,
        decision: RoutingDecision,
        req: Request<Incoming>,
    ) -> Result<Response<Incoming>> {
        let cluster = decision.cluster.clone().ok_or(ProxyError::NoCluster)?;
        let (mut parts, body) = req.into_parts();
        decision.apply_identity(&mut parts.headers);

        let buffered = cluster.retry_policy().is_enabled() || decision.failover_cluster.is_some();
        let mut replay = if buffered {
            let bytes = body
                .collect()
                .await
                .map_err(|e| ProxyError::BodyBuffer(e.to_string()))?
                .to_bytes();
            ReplayBody::Buffered(bytes)
        } else {
            ReplayBody::Streaming(Some(body))
        };

        let parts = &parts;
        retry::deliver(
            cluster,
            decision.failover_cluster,
            Arc::clone(&self.observer),
            move |cluster, endpoint| {
                let body = replay.next();
                async move {
                    let req = rebuild(parts, body?);
                    debug!(cluster = %cluster.name(), endpoint = %endpoint, "sending outbound attempt");
                    self.send_upstream(
                        generation,
                        port,
                        &endpoint,
                        false,
                        cluster.connection_options().max_requests_per_connection,
                        req,
                    )
                    .await
                }
            },
        )
        .await
    }

    /// Forwards a request unchanged to its own authority.
    async fn pass_through(
        &self,
        generation: &Generation,
        port: u16,
        host: &str,
        egress_enabled: bool,
        req: Request<Incoming>,
    ) -> Result<Response<Incoming>> {
        if host.is_empty() {
            return Err(ProxyError::NoRouteMatch {
                method: req.method().to_string(),
                path: req.uri().path().to_string(),
            });
        }
        let address = if crate::router::host_port(host).is_some() {
            host.to_string()
        } else {
            format!("{host}:{port}")
        };

        debug!(address = %address, egress = egress_enabled, "passing request through");
        let (parts, body) = req.into_parts();
        let mut replay = ReplayBody::Streaming(Some(body));
        let req = rebuild(&parts, replay.next()?);
        self.send_upstream(generation, port, &address, egress_enabled, None, req)
            .await
    }

    /// Sends one request to `address` over a pooled or new connection. New
    /// outbound connections consult the egress selector.
    async fn send_upstream(
        &self,
        generation: &Generation,
        port: u16,
        address: &str,
        egress_enabled: bool,
        max_requests: Option<u32>,
        req: Request<UpstreamBody>,
    ) -> Result<Response<Incoming>> {
        let timeout = self.settings.request_timeout;
        let direction = self.direction;
        let key = PoolKey::new(direction, port, address, egress_enabled);

        let send = generation.pool().send(key, max_requests, req, || async move {
            let directive = match direction {
                Direction::Outbound => generation.egress().select(port, address, egress_enabled),
                Direction::Inbound => TransportDirective::Direct {
                    address: address.to_string(),
                },
            };
            Metrics::record_egress(directive.mode());
            egress::connect(&directive, timeout).await
        });

        tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| ProxyError::Timeout {
                duration_ms: timeout.as_millis() as u64,
            })?
    }
}

/// Builds an upstream request from downstream parts, using an origin-form
/// URI over HTTP/1.1.
fn rebuild(parts: &Parts, body: UpstreamBody) -> Request<UpstreamBody> {
    let mut req = Request::new(body);
    *req.method_mut() = parts.method.clone();
    *req.uri_mut() = parts
        .uri
        .path_and_query()
        .map(|pq| Uri::from(pq.clone()))
        .unwrap_or_else(|| Uri::from_static("/"));
    *req.version_mut() = Version::HTTP_11;
    *req.headers_mut() = parts.headers.clone();
    req
}

/// Maps a request failure to the status returned downstream.
pub fn status_for(error: &ProxyError) -> StatusCode {
    match error {
        ProxyError::NoRouteMatch { .. } => StatusCode::NOT_FOUND,
        ProxyError::NoCluster | ProxyError::NoEndpoint { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ProxyError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ProxyError::BodyBuffer(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// Creates an HTTP error response.
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(message.to_string()))
        .map_err(|never| match never {})
        .boxed();
    Response::builder()
        .status(status)
        .body(body)
        .unwrap_or_else(|_| Response::new(Empty::new().map_err(|never| match never {}).boxed()))
}

impl Service<Request<Incoming>> for SidecarService {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.handle(req).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&ProxyError::NoRouteMatch {
                method: "GET".to_string(),
                path: "/".to_string()
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status_for(&ProxyError::NoCluster), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_for(&ProxyError::Timeout { duration_ms: 5 }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&ProxyError::UpstreamConnect {
                addr: "10.0.0.1:80".to_string(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            }),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_response() {
        let response = error_response(StatusCode::SERVICE_UNAVAILABLE, "no viable upstream");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_rebuild_uses_origin_form() {
        let (parts, _) = Request::builder()
            .method("POST")
            .uri("http://bookstore:14001/books?id=1")
            .header("x-env", "prod")
            .body(())
            .unwrap()
            .into_parts();
        let body = Full::new(Bytes::new())
            .map_err(|never| match never {})
            .boxed();
        let req = rebuild(&parts, body);
        assert_eq!(req.uri(), "/books?id=1");
        assert_eq!(req.method(), "POST");
        assert_eq!(req.version(), Version::HTTP_11);
        assert_eq!(req.headers().get("x-env").unwrap(), "prod");
    }

    #[test]
    fn test_settings_from_config() {
        let config = ProxyConfig {
            no_route_policy: NoRoutePolicy::PassThrough,
            ..Default::default()
        };
        let settings = ServiceSettings::from(&config);
        assert_eq!(settings.no_route_policy, NoRoutePolicy::PassThrough);
        assert_eq!(settings.request_timeout, config.request_timeout);
    }
}
