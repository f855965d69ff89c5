//! TCP listeners for the inbound and outbound traffic directions.
//!
//! Each accepted connection is served over HTTP/1.1 by a [`SidecarService`]
//! bound to the connection's peer and destination addresses.

use crate::error::{ProxyError, Result};
use crate::generation::GenerationStore;
use crate::router::Direction;
use crate::service::{ServiceSettings, SidecarService};
use crate::socket::ConnectionAddrs;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tower::Service;
use tracing::{debug, error, info, instrument, warn};

/// HTTP listener for one traffic direction.
///
/// # Example
///
/// ```no_run
/// use mesh_sidecar::generation::GenerationStore;
/// use mesh_sidecar::listener::Listener;
/// use mesh_sidecar::mesh::MeshConfig;
/// use mesh_sidecar::router::Direction;
/// use mesh_sidecar::service::ServiceSettings;
/// use std::sync::Arc;
/// use tokio::sync::broadcast;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (shutdown_tx, _) = broadcast::channel(1);
///     let store = Arc::new(GenerationStore::new(&MeshConfig::default())?);
///     let listener = Listener::bind(
///         "127.0.0.1:15001",
///         Direction::Outbound,
///         store,
///         ServiceSettings::default(),
///     )
///     .await?;
///     listener.serve(shutdown_tx.subscribe()).await?;
///     Ok(())
/// }
/// ```
pub struct Listener {
    tcp_listener: TcpListener,
    service: SidecarService,
    direction: Direction,
    addr: SocketAddr,
}

impl Listener {
    /// Binds to the specified address.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::ListenerBind` if binding fails.
    #[instrument(level = "info", skip(store, settings))]
    pub async fn bind(
        addr: &str,
        direction: Direction,
        store: Arc<GenerationStore>,
        settings: ServiceSettings,
    ) -> Result<Self> {
        Self::with_service(addr, SidecarService::new(direction, store, settings)).await
    }

    /// Binds to the specified address, serving connections with a
    /// preconfigured service.
    pub async fn with_service(addr: &str, service: SidecarService) -> Result<Self> {
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        let local_addr = tcp_listener
            .local_addr()
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        let direction = service.direction();
        info!(direction = %direction, "bound to {}", local_addr);

        Ok(Self {
            tcp_listener,
            service,
            direction,
            addr: local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the traffic direction served by this listener.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Serves incoming connections until a shutdown signal is received.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(addr = %self.addr, direction = %self.direction))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving connections");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let connection = ConnectionAddrs::accepted(&stream, peer_addr, self.addr);
                            debug!(
                                original_dst = ?connection.redirected_dst(),
                                "accepted connection from {}",
                                peer_addr
                            );
                            let service = self.service.clone().with_connection(connection);
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, service).await {
                                    error!("connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping listener");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Serves HTTP/1.1 on one accepted connection.
    #[instrument(level = "debug", skip_all)]
    async fn handle_connection(stream: TcpStream, service: SidecarService) -> Result<()> {
        let service = service_fn(move |req: Request<Incoming>| {
            let mut svc = service.clone();
            async move { svc.call(req).await }
        });

        http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await
            .map_err(ProxyError::Http)
    }
}
