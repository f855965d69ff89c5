//! L7 routing with path and header-based matching.
//!
//! Route rules are compiled once per generation into a tree keyed by caller
//! identity and HTTP method. Each leaf is the ordered list of rules that
//! apply to that pair; the first rule whose path and header predicates all
//! succeed wins. Matching is a pure function of the request and returns an
//! explicit [`RoutingDecision`].

use crate::cluster::{ClusterDescriptor, ClusterRegistry};
use crate::error::ConfigError;
use crate::mesh::{PathMatchType, PortConfig, RouteRule, TrafficPolicy};
use crate::transport::LoadBalancer;
use http::header::{HeaderValue, HOST};
use http::{HeaderMap, Method, Request};
use ipnet::IpNet;
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, trace};

/// Header carrying the caller's mesh identity between sidecars.
pub const IDENTITY_HEADER: &str = "serviceidentity";

/// Host bucket used for callers inside an ingress source range.
pub const WILDCARD_HOST: &str = "*";

/// Methods a rule applies to when it does not list any.
pub const STANDARD_METHODS: [&str; 9] = [
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];

/// Traffic direction relative to the fronted workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Requests arriving for the workload.
    Inbound,
    /// Requests the workload sends into the mesh.
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// Compiled path predicate.
#[derive(Debug)]
pub enum PathMatch {
    /// Path must equal this value.
    Exact(String),
    /// Path must start with this prefix.
    Prefix(String),
    /// Path must match this regex.
    Regex(Regex),
}

impl PathMatch {
    /// Compiles a path predicate.
    pub fn compile(match_type: PathMatchType, path: &str) -> Result<Self, ConfigError> {
        Ok(match match_type {
            PathMatchType::Exact => PathMatch::Exact(path.to_string()),
            PathMatchType::Prefix => PathMatch::Prefix(path.to_string()),
            PathMatchType::Regex => {
                PathMatch::Regex(Regex::new(path).map_err(|source| {
                    ConfigError::InvalidPathRegex {
                        pattern: path.to_string(),
                        source,
                    }
                })?)
            }
        })
    }

    /// Checks if the path matches.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatch::Exact(expected) => path == expected,
            PathMatch::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathMatch::Regex(regex) => regex.is_match(path),
        }
    }
}

/// Compiled header predicate. A missing header matches as the empty string.
#[derive(Debug)]
pub struct HeaderMatch {
    name: String,
    regex: Regex,
}

impl HeaderMatch {
    /// Compiles a header predicate.
    pub fn compile(name: &str, pattern: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern).map_err(|source| ConfigError::InvalidHeaderRegex {
            header: name.to_string(),
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            name: name.to_ascii_lowercase(),
            regex,
        })
    }

    /// Checks if the header matches.
    pub fn matches(&self, headers: &HeaderMap) -> bool {
        let value = headers
            .get(self.name.as_str())
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        self.regex.is_match(value)
    }
}

/// A route rule with its predicates and balancers compiled.
#[derive(Debug)]
pub struct CompiledRule {
    route: Arc<RouteRule>,
    path: PathMatch,
    headers: Vec<HeaderMatch>,
    balancer: LoadBalancer,
    failover: Option<LoadBalancer>,
}

impl CompiledRule {
    /// Compiles a rule. Failover balancers are only built for outbound rules.
    pub fn compile(rule: &RouteRule, direction: Direction) -> Result<Self, ConfigError> {
        let path = PathMatch::compile(rule.match_type, &rule.path)?;
        let headers = rule
            .headers
            .iter()
            .map(|(name, pattern)| HeaderMatch::compile(name, pattern))
            .collect::<Result<Vec<_>, _>>()?;
        let balancer = LoadBalancer::new(rule.primary_weights());
        let failover = match direction {
            Direction::Outbound => LoadBalancer::failover(rule.primary_weights()),
            Direction::Inbound => None,
        };

        Ok(Self {
            route: Arc::new(rule.clone()),
            path,
            headers,
            balancer,
            failover,
        })
    }

    /// Returns true if the path and every header predicate match.
    pub fn matches(&self, path: &str, headers: &HeaderMap) -> bool {
        self.path.matches(path) && self.headers.iter().all(|h| h.matches(headers))
    }

    /// Returns the configured rule.
    pub fn route(&self) -> &Arc<RouteRule> {
        &self.route
    }

    /// Draws the primary target cluster name.
    pub fn next_cluster(&self) -> Option<&str> {
        self.balancer.next()
    }

    /// Draws the failover target cluster name, if the rule has standby targets.
    pub fn next_failover(&self) -> Option<&str> {
        self.failover.as_ref().and_then(LoadBalancer::next)
    }
}

/// Descriptor of the service a request was routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Service name as configured.
    pub name: String,
}

/// Compiled rule tree of one service: identity to method to ordered rules.
#[derive(Debug)]
pub struct ServiceMatcher {
    service: Arc<ServiceDescriptor>,
    tree: HashMap<String, HashMap<String, Vec<Arc<CompiledRule>>>>,
}

impl ServiceMatcher {
    /// Compiles a service's rules, preserving configuration order.
    ///
    /// Inbound rules are indexed under each of their allowed identities
    /// (the anonymous identity `""` when none are listed); outbound rules
    /// all live under `""`.
    pub fn compile(
        name: &str,
        rules: &[RouteRule],
        direction: Direction,
    ) -> Result<Self, ConfigError> {
        let mut tree: HashMap<String, HashMap<String, Vec<Arc<CompiledRule>>>> = HashMap::new();

        for rule in rules {
            let compiled = Arc::new(CompiledRule::compile(rule, direction)?);

            let identities: Vec<&str> = match (direction, &rule.allowed_services) {
                (Direction::Inbound, Some(services)) if !services.is_empty() => {
                    services.iter().map(String::as_str).collect()
                }
                _ => vec![""],
            };
            let methods: Vec<String> = match &rule.methods {
                Some(methods) if !methods.is_empty() => {
                    methods.iter().map(|m| m.to_ascii_uppercase()).collect()
                }
                _ => STANDARD_METHODS.iter().map(|m| m.to_string()).collect(),
            };

            for identity in identities {
                let by_method = tree.entry(identity.to_string()).or_default();
                for method in &methods {
                    by_method
                        .entry(method.clone())
                        .or_default()
                        .push(Arc::clone(&compiled));
                }
            }
        }

        Ok(Self {
            service: Arc::new(ServiceDescriptor {
                name: name.to_string(),
            }),
            tree,
        })
    }

    /// Returns the service descriptor.
    pub fn service(&self) -> &Arc<ServiceDescriptor> {
        &self.service
    }

    /// Finds the first rule matching the request in its identity and method
    /// bucket.
    pub fn find(
        &self,
        identity: &str,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
    ) -> Option<&Arc<CompiledRule>> {
        self.tree
            .get(identity)?
            .get(method.as_str())?
            .iter()
            .find(|rule| rule.matches(path, headers))
    }
}

/// Request attributes routing depends on.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub host: &'a str,
    pub headers: &'a HeaderMap,
    /// Address of the downstream peer, if known.
    pub source: Option<IpAddr>,
    /// Destination port of the downstream connection, if known.
    pub destination_port: Option<u16>,
}

impl<'a> RequestContext<'a> {
    /// Builds a context from a request. The host comes from the `Host`
    /// header, falling back to the URI authority. Path predicates see the
    /// path together with its query string.
    pub fn from_request<B>(
        req: &'a Request<B>,
        source: Option<IpAddr>,
        destination_port: Option<u16>,
    ) -> Self {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| req.uri().authority().map(|a| a.as_str()))
            .unwrap_or("");

        Self {
            method: req.method(),
            path: req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/"),
            host,
            headers: req.headers(),
            source,
            destination_port,
        }
    }

    /// Returns the port the request is routed on: the connection's
    /// destination port, else the port carried by the host, else 80.
    pub fn port(&self) -> u16 {
        self.destination_port
            .or_else(|| host_port(self.host))
            .unwrap_or(80)
    }
}

/// Extracts the port of a `host[:port]` authority.
pub fn host_port(host: &str) -> Option<u16> {
    let (_, port) = host.rsplit_once(':')?;
    if port.contains(']') {
        return None;
    }
    port.parse().ok()
}

/// Outcome of a successful route match.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// The matched rule.
    pub route: Arc<RouteRule>,
    /// The service owning the matched rule.
    pub service: Arc<ServiceDescriptor>,
    /// Selected cluster; `None` if the drawn name is not configured.
    pub cluster: Option<Arc<ClusterDescriptor>>,
    /// Selected failover cluster (outbound only).
    pub failover_cluster: Option<Arc<ClusterDescriptor>>,
    /// Identity to stamp on the forwarded request (outbound only).
    pub identity_stamp: Option<HeaderValue>,
    /// Whether the caller was routed through the ingress wildcard host.
    pub ingress_bypass: bool,
}

impl RoutingDecision {
    /// Stamps the mesh identity header, if the decision carries one.
    pub fn apply_identity(&self, headers: &mut HeaderMap) {
        if let Some(identity) = &self.identity_stamp {
            headers.insert(IDENTITY_HEADER, identity.clone());
        }
    }
}

/// Router for one listening port.
pub struct PortRouter {
    direction: Direction,
    port: u16,
    hosts: HashMap<String, Arc<ServiceMatcher>>,
    services: HashMap<String, Arc<ServiceMatcher>>,
    ingress_ranges: Vec<IpNet>,
    identity: HeaderValue,
    clusters: Arc<ClusterRegistry>,
}

impl PortRouter {
    /// Compiles every service and host mapping of a port.
    pub fn build(
        direction: Direction,
        port: u16,
        config: &PortConfig,
        sidecar_identity: &str,
        clusters: Arc<ClusterRegistry>,
    ) -> Result<Self, ConfigError> {
        let mut services = HashMap::new();
        for (name, rules) in &config.http_service_route_rules {
            let matcher = ServiceMatcher::compile(name, rules, direction)?;
            services.insert(name.clone(), Arc::new(matcher));
        }

        let mut hosts = HashMap::new();
        for (host, service) in &config.http_host_port_to_service {
            let matcher = match services.get(service) {
                Some(matcher) => Arc::clone(matcher),
                None => {
                    let empty = Arc::new(ServiceMatcher::compile(service, &[], direction)?);
                    services.insert(service.clone(), Arc::clone(&empty));
                    empty
                }
            };
            hosts.insert(host.clone(), matcher);
        }

        let ingress_ranges = config
            .source_ip_ranges
            .iter()
            .map(|range| parse_cidr(range))
            .collect::<Result<Vec<_>, _>>()?;

        let identity = config
            .service_identity
            .as_deref()
            .unwrap_or(sidecar_identity);
        let identity = HeaderValue::from_str(identity).map_err(|_| {
            ConfigError::InvalidServiceIdentity {
                identity: identity.to_string(),
            }
        })?;

        Ok(Self {
            direction,
            port,
            hosts,
            services,
            ingress_ranges,
            identity,
            clusters,
        })
    }

    /// Returns the listening port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the traffic direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns the compiled matcher of a service.
    pub fn service(&self, name: &str) -> Option<&Arc<ServiceMatcher>> {
        self.services.get(name)
    }

    /// Returns true if `source` lies in one of the port's ingress ranges.
    pub fn is_ingress_source(&self, source: Option<IpAddr>) -> bool {
        source.is_some_and(|ip| self.ingress_ranges.iter().any(|range| range.contains(&ip)))
    }

    /// Matches a request, drawing clusters for the matched rule.
    pub fn route(&self, ctx: &RequestContext<'_>) -> Option<RoutingDecision> {
        let ingress_bypass =
            self.direction == Direction::Inbound && self.is_ingress_source(ctx.source);
        let host = if ingress_bypass { WILDCARD_HOST } else { ctx.host };

        let Some(matcher) = self.hosts.get(host) else {
            debug!(direction = %self.direction, port = self.port, host = %host, "no service for host");
            return None;
        };

        let identity = match self.direction {
            Direction::Inbound => ctx
                .headers
                .get(IDENTITY_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or(""),
            Direction::Outbound => "",
        };

        let Some(rule) = matcher.find(identity, ctx.method, ctx.path, ctx.headers) else {
            debug!(
                direction = %self.direction,
                service = %matcher.service().name,
                identity = %identity,
                method = %ctx.method,
                path = %ctx.path,
                "no matching route found"
            );
            return None;
        };

        let cluster = rule.next_cluster().and_then(|name| {
            let cluster = self.clusters.get(name);
            if cluster.is_none() {
                debug!(cluster = %name, "route target cluster is not configured");
            }
            cluster
        });
        let failover_cluster = rule.next_failover().and_then(|name| self.clusters.get(name));

        let identity_stamp = match (self.direction, &cluster) {
            (Direction::Outbound, Some(_)) => Some(self.identity.clone()),
            _ => None,
        };

        debug!(
            direction = %self.direction,
            service = %matcher.service().name,
            path = %rule.route().path,
            cluster = cluster.as_ref().map(|c| c.name()).unwrap_or("-"),
            failover = failover_cluster.as_ref().map(|c| c.name()).unwrap_or("-"),
            ingress_bypass,
            "matched route"
        );

        Some(RoutingDecision {
            route: Arc::clone(rule.route()),
            service: Arc::clone(matcher.service()),
            cluster,
            failover_cluster,
            identity_stamp,
            ingress_bypass,
        })
    }
}

/// Parses a CIDR, accepting a bare address as a host route.
pub fn parse_cidr(range: &str) -> Result<IpNet, ConfigError> {
    range
        .parse::<IpNet>()
        .or_else(|e| range.parse::<IpAddr>().map(IpNet::from).map_err(|_| e))
        .map_err(|e| ConfigError::InvalidCidr {
            range: range.to_string(),
            reason: e.to_string(),
        })
}

/// Parses a traffic-match key into a port.
pub fn parse_port(key: &str) -> Result<u16, ConfigError> {
    key.trim().parse().map_err(|_| ConfigError::InvalidPort {
        port: key.to_string(),
    })
}

/// Routers for every port of one direction, sharing a cluster registry.
pub struct Router {
    direction: Direction,
    ports: HashMap<u16, PortRouter>,
    clusters: Arc<ClusterRegistry>,
}

impl Router {
    /// Compiles a direction's traffic policy.
    pub fn build(
        direction: Direction,
        policy: Option<&TrafficPolicy>,
        sidecar_identity: &str,
    ) -> Result<Self, ConfigError> {
        let Some(policy) = policy else {
            return Ok(Self {
                direction,
                ports: HashMap::new(),
                clusters: Arc::new(ClusterRegistry::empty()),
            });
        };

        let clusters = Arc::new(ClusterRegistry::new(&policy.clusters_configs)?);
        let mut ports = HashMap::new();
        for (key, port_config) in &policy.traffic_matches {
            let port = parse_port(key)?;
            let router = PortRouter::build(
                direction,
                port,
                port_config,
                sidecar_identity,
                Arc::clone(&clusters),
            )?;
            trace!(direction = %direction, port, services = router.services.len(), "compiled port");
            ports.insert(port, router);
        }

        Ok(Self {
            direction,
            ports,
            clusters,
        })
    }

    /// Returns the traffic direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns the router of a port.
    pub fn port(&self, port: u16) -> Option<&PortRouter> {
        self.ports.get(&port)
    }

    /// Returns the shared cluster registry.
    pub fn clusters(&self) -> &Arc<ClusterRegistry> {
        &self.clusters
    }

    /// Routes a request on the port given by [`RequestContext::port`].
    pub fn route(&self, ctx: &RequestContext<'_>) -> Option<RoutingDecision> {
        let port = ctx.port();
        match self.ports.get(&port) {
            Some(router) => router.route(ctx),
            None => {
                debug!(direction = %self.direction, port, "no traffic match for port");
                None
            }
        }
    }

    /// Returns the number of configured ports.
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Returns true if no port is configured.
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}
