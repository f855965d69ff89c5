//! Weighted load balancing and upstream connection pooling.
//!
//! [`LoadBalancer`] implements smooth weighted round-robin selection over a
//! fixed set of named targets. [`UpstreamPool`] keeps idle HTTP/1.1
//! connections to upstream endpoints so that transport selection happens
//! once per connection rather than once per request.

use crate::error::Result;
use crate::router::Direction;
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Boxed error carried by upstream request bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request body type sent to upstream endpoints.
pub type UpstreamBody = BoxBody<Bytes, BoxError>;

/// Smooth weighted round-robin selector.
///
/// Every call adds each target's weight to its running counter, picks the
/// target with the highest counter and subtracts the total weight from it.
/// Selection frequency converges to `weight / total` without long bursts to
/// a single heavy target. Zero-weight targets are never selected.
///
/// Counters always sum to zero after a pick, so each stays within
/// `±total * targets` and cannot overflow an `i64` for `u32` weights.
#[derive(Debug)]
pub struct LoadBalancer {
    targets: Vec<(String, i64)>,
    total_weight: i64,
    current: Mutex<Vec<i64>>,
}

impl LoadBalancer {
    /// Creates a balancer from `(target, weight)` pairs.
    pub fn new<I, S>(weights: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let targets: Vec<(String, i64)> = weights
            .into_iter()
            .filter(|(_, weight)| *weight > 0)
            .map(|(id, weight)| (id.into(), i64::from(weight)))
            .collect();
        let total_weight = targets.iter().map(|(_, w)| w).sum();
        let current = Mutex::new(vec![0; targets.len()]);

        Self {
            targets,
            total_weight,
            current,
        }
    }

    /// Builds the failover balancer for a target map.
    ///
    /// Targets configured with weight `0` are standby targets: the primary
    /// balancer never selects them, and the failover balancer selects among
    /// exactly those, evenly. Returns `None` when no standby target exists.
    pub fn failover<'a, I>(weights: I) -> Option<Self>
    where
        I: IntoIterator<Item = (&'a str, u32)>,
    {
        let standby: Vec<(&str, u32)> = weights
            .into_iter()
            .filter(|(_, weight)| *weight == 0)
            .map(|(id, _)| (id, 1))
            .collect();

        if standby.is_empty() {
            None
        } else {
            Some(Self::new(standby))
        }
    }

    /// Selects the next target, or `None` if no target is selectable.
    pub fn next(&self) -> Option<&str> {
        if self.targets.is_empty() {
            return None;
        }

        let mut current = self.current.lock();
        let mut best = 0;
        for (idx, (_, weight)) in self.targets.iter().enumerate() {
            current[idx] += weight;
            if current[idx] > current[best] {
                best = idx;
            }
        }
        current[best] -= self.total_weight;

        Some(self.targets[best].0.as_str())
    }

    /// Returns the selectable targets and their weights.
    pub fn targets(&self) -> impl Iterator<Item = (&str, u32)> {
        self.targets
            .iter()
            .map(|(id, w)| (id.as_str(), u32::try_from(*w).unwrap_or(u32::MAX)))
    }

    /// Returns the number of selectable targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Returns true if no target is selectable.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Identifies a class of interchangeable upstream connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    /// Direction the connection serves.
    pub direction: Direction,
    /// Port the request was routed on. Egress decisions are per port.
    pub port: u16,
    /// Endpoint address the connection reaches.
    pub address: String,
    /// Whether the connection was established with egress bypass.
    pub egress_enabled: bool,
}

impl PoolKey {
    /// Creates a pool key.
    pub fn new(
        direction: Direction,
        port: u16,
        address: impl Into<String>,
        egress_enabled: bool,
    ) -> Self {
        Self {
            direction,
            port,
            address: address.into(),
            egress_enabled,
        }
    }
}

struct PooledConnection {
    sender: http1::SendRequest<UpstreamBody>,
    served: u32,
}

/// Connection pool statistics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Total number of connections created.
    pub connections_created: u64,
    /// Total number of connections retired by the pool.
    pub connections_closed: u64,
    /// Current number of idle connections.
    pub idle_connections: usize,
}

/// Pool of idle HTTP/1.1 upstream connections.
#[derive(Default)]
pub struct UpstreamPool {
    idle: DashMap<PoolKey, Vec<PooledConnection>>,
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
}

impl UpstreamPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends a request over a pooled connection, or over a new connection
    /// produced by `connect` when none is idle.
    ///
    /// A connection is returned to the pool after use unless it has served
    /// `max_requests` requests.
    pub async fn send<F, Fut, S>(
        &self,
        key: PoolKey,
        max_requests: Option<u32>,
        req: Request<UpstreamBody>,
        connect: F,
    ) -> Result<Response<Incoming>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S>>,
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut conn = match self.checkout(&key) {
            Some(conn) => {
                debug!(address = %key.address, "reusing upstream connection");
                conn
            }
            None => {
                let stream = connect().await?;
                let (sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
                let address = key.address.clone();
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!(address = %address, error = %e, "upstream connection closed");
                    }
                });
                self.connections_created.fetch_add(1, Ordering::Relaxed);
                PooledConnection { sender, served: 0 }
            }
        };

        let response = conn.sender.send_request(req).await?;
        conn.served += 1;

        if max_requests.map_or(true, |max| conn.served < max) {
            self.idle.entry(key).or_default().push(conn);
        } else {
            self.connections_closed.fetch_add(1, Ordering::Relaxed);
        }

        Ok(response)
    }

    fn checkout(&self, key: &PoolKey) -> Option<PooledConnection> {
        let mut idle = self.idle.get_mut(key)?;
        let before = idle.len();
        idle.retain(|conn| !conn.sender.is_closed());
        let dropped = (before - idle.len()) as u64;
        if dropped > 0 {
            self.connections_closed.fetch_add(dropped, Ordering::Relaxed);
        }
        let pos = idle.iter().position(|conn| conn.sender.is_ready())?;
        Some(idle.swap_remove(pos))
    }

    /// Returns pool statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            idle_connections: self.idle.iter().map(|entry| entry.value().len()).sum(),
        }
    }
}
