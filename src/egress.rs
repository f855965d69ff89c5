//! Upstream transport selection and connection establishment.
//!
//! [`EgressSelector`] decides, once per new upstream connection, whether to
//! connect directly, over mTLS, or through an egress gateway. The resulting
//! [`TransportDirective`] is then carried out by [`connect`].

use crate::error::{ConfigError, ProxyError, Result};
use crate::mesh::{MeshConfig, DEFAULT_WEIGHT};
use crate::router::{parse_cidr, parse_port};
use crate::tls;
use crate::transport::LoadBalancer;
use ipnet::IpNet;
use rustls::ClientConfig;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

/// Forward-match group used when a port names none.
pub const DEFAULT_FORWARD_GROUP: &str = "*";

/// Transport kind of a directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportMode {
    Direct,
    Tls,
    Tunnel,
}

impl TransportMode {
    /// Returns the mode name used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Direct => "direct",
            TransportMode::Tls => "tls",
            TransportMode::Tunnel => "tunnel",
        }
    }
}

/// How to reach an upstream address.
#[derive(Clone)]
pub enum TransportDirective {
    /// Plain TCP to the address.
    Direct { address: String },
    /// TLS to the address presenting the configured client certificate.
    Tls {
        address: String,
        config: Arc<ClientConfig>,
    },
    /// TCP to the gateway, then a SOCKS5 CONNECT to the destination.
    Tunnel { gateway: String, destination: String },
}

impl TransportDirective {
    /// Returns the transport kind.
    pub fn mode(&self) -> TransportMode {
        match self {
            TransportDirective::Direct { .. } => TransportMode::Direct,
            TransportDirective::Tls { .. } => TransportMode::Tls,
            TransportDirective::Tunnel { .. } => TransportMode::Tunnel,
        }
    }

    /// Returns the address the request is ultimately destined for.
    pub fn destination(&self) -> &str {
        match self {
            TransportDirective::Direct { address } | TransportDirective::Tls { address, .. } => {
                address
            }
            TransportDirective::Tunnel { destination, .. } => destination,
        }
    }
}

impl std::fmt::Debug for TransportDirective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportDirective::Direct { address } => {
                f.debug_struct("Direct").field("address", address).finish()
            }
            TransportDirective::Tls { address, .. } => {
                f.debug_struct("Tls").field("address", address).finish()
            }
            TransportDirective::Tunnel {
                gateway,
                destination,
            } => f
                .debug_struct("Tunnel")
                .field("gateway", gateway)
                .field("destination", destination)
                .finish(),
        }
    }
}

struct DestinationTls {
    range: IpNet,
    config: Arc<ClientConfig>,
}

#[derive(Default)]
struct PortEgress {
    destinations: Vec<DestinationTls>,
    forward_group: Option<String>,
    allowed_egress: bool,
}

/// Per-connection transport decision for outbound traffic.
#[derive(Default)]
pub struct EgressSelector {
    ports: HashMap<u16, PortEgress>,
    sidecar_tls: Option<Arc<ClientConfig>>,
    forward_matches: HashMap<String, LoadBalancer>,
    gateways: HashMap<String, LoadBalancer>,
}

impl EgressSelector {
    /// Builds the selector, parsing all certificate material and CIDRs.
    pub fn build(config: &MeshConfig) -> std::result::Result<Self, ConfigError> {
        let outbound_ports = config
            .outbound
            .as_ref()
            .map(|policy| &policy.traffic_matches);

        // Destination certificates trust every configured issuing CA.
        let destination_specs = outbound_ports
            .into_iter()
            .flat_map(|ports| ports.values())
            .flat_map(|port| port.destination_ip_ranges.values())
            .filter_map(|dest| dest.source_cert.as_ref());
        let global_trust = tls::issuing_cas(config.certificate.as_ref())?;
        let mut destination_trust = global_trust.clone();
        destination_trust.extend(tls::issuing_cas(destination_specs)?);

        let mut ports = HashMap::new();
        for (key, port_config) in outbound_ports.into_iter().flatten() {
            let port = parse_port(key)?;
            let mut destinations = Vec::new();
            for (range, dest) in &port_config.destination_ip_ranges {
                let range = parse_cidr(range)?;
                if let Some(cert) = &dest.source_cert {
                    destinations.push(DestinationTls {
                        range,
                        config: tls::client_config(cert, &destination_trust)?,
                    });
                }
            }
            ports.insert(
                port,
                PortEgress {
                    destinations,
                    forward_group: port_config.egress_forward_gateway.clone(),
                    allowed_egress: port_config.allowed_egress_traffic,
                },
            );
        }

        let sidecar_tls = config
            .certificate
            .as_ref()
            .map(|cert| tls::client_config(cert, &global_trust))
            .transpose()?;

        let forward = config.forward.as_ref();
        let forward_matches = forward
            .into_iter()
            .flat_map(|f| f.forward_matches.iter())
            .map(|(group, gateways)| {
                let weights = gateways.iter().map(|(name, weight)| {
                    let weight = if *weight == 0 { DEFAULT_WEIGHT } else { *weight };
                    (name.as_str(), weight)
                });
                (group.clone(), LoadBalancer::new(weights))
            })
            .collect();
        let gateways = forward
            .into_iter()
            .flat_map(|f| f.egress_gateways.iter())
            .map(|(name, cluster)| (name.clone(), LoadBalancer::new(cluster.endpoint_weights())))
            .collect();

        Ok(Self {
            ports,
            sidecar_tls,
            forward_matches,
            gateways,
        })
    }

    /// Returns true if connections leaving the mesh from `port` may bypass
    /// the mesh through egress.
    pub fn allows_egress(&self, port: u16) -> bool {
        self.ports.get(&port).is_some_and(|p| p.allowed_egress)
    }

    /// Chooses the transport for a new connection to `address`.
    pub fn select(&self, port: u16, address: &str, egress_enabled: bool) -> TransportDirective {
        let port_egress = self.ports.get(&port);

        if let Some(config) = port_egress.and_then(|p| p.destination_tls(address)) {
            debug!(address = %address, "using destination certificate");
            return TransportDirective::Tls {
                address: address.to_string(),
                config,
            };
        }

        if !egress_enabled {
            if let Some(config) = &self.sidecar_tls {
                return TransportDirective::Tls {
                    address: address.to_string(),
                    config: Arc::clone(config),
                };
            }
        }

        if egress_enabled {
            let group = port_egress
                .and_then(|p| p.forward_group.as_deref())
                .unwrap_or(DEFAULT_FORWARD_GROUP);
            if let Some(gateway) = self.next_gateway_endpoint(group) {
                debug!(group = %group, gateway = %gateway, destination = %address, "tunneling through egress gateway");
                return TransportDirective::Tunnel {
                    gateway,
                    destination: address.to_string(),
                };
            }
        }

        TransportDirective::Direct {
            address: address.to_string(),
        }
    }

    fn next_gateway_endpoint(&self, group: &str) -> Option<String> {
        let gateway = self.forward_matches.get(group)?.next()?;
        self.gateways.get(gateway)?.next().map(str::to_string)
    }
}

impl PortEgress {
    fn destination_tls(&self, address: &str) -> Option<Arc<ClientConfig>> {
        let ip = address
            .parse::<SocketAddr>()
            .map(|addr| addr.ip())
            .or_else(|_| address.parse::<IpAddr>())
            .ok()?;
        self.destinations
            .iter()
            .find(|dest| dest.range.contains(&ip))
            .map(|dest| Arc::clone(&dest.config))
    }
}

/// An established upstream byte stream.
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Establishes the connection a directive describes, bounded by `timeout`.
#[instrument(skip(directive), fields(mode = directive.mode().as_str(), destination = %directive.destination()))]
pub async fn connect(directive: &TransportDirective, timeout: Duration) -> Result<UpstreamStream> {
    let duration_ms = timeout.as_millis() as u64;
    tokio::time::timeout(timeout, establish(directive))
        .await
        .map_err(|_| ProxyError::Timeout { duration_ms })?
}

async fn establish(directive: &TransportDirective) -> Result<UpstreamStream> {
    match directive {
        TransportDirective::Direct { address } => Ok(UpstreamStream::Plain(tcp(address).await?)),
        TransportDirective::Tls { address, config } => {
            let stream = tcp(address).await?;
            let name = tls::server_name(address)?;
            let stream = TlsConnector::from(Arc::clone(config))
                .connect(name, stream)
                .await
                .map_err(|e| ProxyError::TlsHandshake {
                    addr: address.clone(),
                    reason: e.to_string(),
                })?;
            Ok(UpstreamStream::Tls(Box::new(stream)))
        }
        TransportDirective::Tunnel {
            gateway,
            destination,
        } => {
            let mut stream = tcp(gateway).await?;
            socks5_connect(&mut stream, destination)
                .await
                .map_err(|e| ProxyError::TunnelHandshake {
                    gateway: gateway.clone(),
                    reason: e.to_string(),
                })?;
            Ok(UpstreamStream::Plain(stream))
        }
    }
}

async fn tcp(address: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|source| ProxyError::UpstreamConnect {
            addr: address.to_string(),
            source,
        })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_NO_AUTH: u8 = 0x00;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_ATYP_IPV4: u8 = 0x01;
const SOCKS_ATYP_DOMAIN: u8 = 0x03;
const SOCKS_ATYP_IPV6: u8 = 0x04;

fn protocol_error(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Performs a SOCKS5 no-auth CONNECT to `destination` (`host:port`).
pub async fn socks5_connect<S>(stream: &mut S, destination: &str) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, 1, SOCKS_NO_AUTH])
        .await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [SOCKS_VERSION, SOCKS_NO_AUTH] {
        return Err(protocol_error(format!(
            "gateway refused no-auth method: {choice:?}"
        )));
    }

    let mut request = vec![SOCKS_VERSION, SOCKS_CMD_CONNECT, 0x00];
    match destination.parse::<SocketAddr>() {
        Ok(SocketAddr::V4(addr)) => {
            request.push(SOCKS_ATYP_IPV4);
            request.extend_from_slice(&addr.ip().octets());
            request.extend_from_slice(&addr.port().to_be_bytes());
        }
        Ok(SocketAddr::V6(addr)) => {
            request.push(SOCKS_ATYP_IPV6);
            request.extend_from_slice(&addr.ip().octets());
            request.extend_from_slice(&addr.port().to_be_bytes());
        }
        Err(_) => {
            let (host, port) = destination
                .rsplit_once(':')
                .ok_or_else(|| protocol_error(format!("destination without port: {destination}")))?;
            let port: u16 = port
                .parse()
                .map_err(|_| protocol_error(format!("invalid destination port: {destination}")))?;
            let len = u8::try_from(host.len())
                .map_err(|_| protocol_error("destination host too long"))?;
            request.push(SOCKS_ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
            request.extend_from_slice(&port.to_be_bytes());
        }
    }
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(protocol_error(format!("unexpected version {}", reply[0])));
    }
    if reply[1] != 0x00 {
        return Err(protocol_error(format!("connect rejected with code {}", reply[1])));
    }

    let bound_len = match reply[3] {
        SOCKS_ATYP_IPV4 => 4,
        SOCKS_ATYP_IPV6 => 16,
        SOCKS_ATYP_DOMAIN => usize::from(stream.read_u8().await?),
        other => return Err(protocol_error(format!("unknown address type {other}"))),
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{
        ClusterConfig, DestinationSpec, ForwardPolicy, PortConfig, TrafficPolicy,
    };
    use crate::tls::tests::self_signed;
    use std::collections::BTreeMap;
    use tokio::net::TcpListener;

    fn mesh(sidecar_cert: bool, allowed_egress: bool) -> MeshConfig {
        let mut port = PortConfig {
            allowed_egress_traffic: allowed_egress,
            ..Default::default()
        };
        port.destination_ip_ranges.insert(
            "10.10.0.0/16".to_string(),
            DestinationSpec {
                source_cert: Some(self_signed("external.mesh", true)),
            },
        );

        let mut outbound = TrafficPolicy::default();
        outbound.traffic_matches.insert("14001".to_string(), port);

        let mut forward = ForwardPolicy::default();
        forward
            .forward_matches
            .insert("*".to_string(), BTreeMap::from([("gw".to_string(), 0)]));
        forward.egress_gateways.insert(
            "gw".to_string(),
            ClusterConfig::with_endpoints(["192.168.1.1:1080", "192.168.1.2:1080"]),
        );

        MeshConfig {
            service_identity: "bookbuyer".to_string(),
            certificate: sidecar_cert.then(|| self_signed("bookbuyer.mesh", true)),
            outbound: Some(outbound),
            forward: Some(forward),
            ..Default::default()
        }
    }

    #[test]
    fn test_destination_certificate_wins() {
        let selector = EgressSelector::build(&mesh(true, true)).unwrap();
        for egress in [false, true] {
            let directive = selector.select(14001, "10.10.3.4:14001", egress);
            assert_eq!(directive.mode(), TransportMode::Tls);
        }
    }

    #[test]
    fn test_sidecar_certificate_without_egress() {
        let selector = EgressSelector::build(&mesh(true, true)).unwrap();
        let directive = selector.select(14001, "10.20.0.1:14001", false);
        assert_eq!(directive.mode(), TransportMode::Tls);
        assert_eq!(directive.destination(), "10.20.0.1:14001");
    }

    #[test]
    fn test_egress_tunnels_through_gateway() {
        let selector = EgressSelector::build(&mesh(true, true)).unwrap();
        assert!(selector.allows_egress(14001));

        let mut gateways = Vec::new();
        for _ in 0..4 {
            match selector.select(14001, "93.184.216.34:443", true) {
                TransportDirective::Tunnel {
                    gateway,
                    destination,
                } => {
                    assert_eq!(destination, "93.184.216.34:443");
                    gateways.push(gateway);
                }
                other => panic!("expected tunnel, got {other:?}"),
            }
        }
        assert_eq!(
            gateways,
            vec![
                "192.168.1.1:1080",
                "192.168.1.2:1080",
                "192.168.1.1:1080",
                "192.168.1.2:1080"
            ]
        );
    }

    #[test]
    fn test_direct_fallbacks() {
        let selector = EgressSelector::build(&mesh(false, false)).unwrap();
        assert!(!selector.allows_egress(14001));
        assert_eq!(
            selector.select(14001, "10.20.0.1:14001", false).mode(),
            TransportMode::Direct
        );

        let empty = EgressSelector::build(&MeshConfig::default()).unwrap();
        assert_eq!(
            empty.select(80, "example.com:80", true).mode(),
            TransportMode::Direct
        );
    }

    #[test]
    fn test_bad_destination_range_fails_build() {
        let mut config = mesh(false, false);
        let port = config
            .outbound
            .as_mut()
            .unwrap()
            .traffic_matches
            .get_mut("14001")
            .unwrap();
        port.destination_ip_ranges
            .insert("not-a-cidr".to_string(), DestinationSpec::default());
        assert!(matches!(
            EgressSelector::build(&config),
            Err(ConfigError::InvalidCidr { .. })
        ));
    }

    async fn echo_once(listener: TcpListener) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await.unwrap();
        socket.write_all(&buf).await.unwrap();
    }

    #[tokio::test]
    async fn test_direct_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(echo_once(listener));

        let directive = TransportDirective::Direct { address };
        let mut stream = connect(&directive, Duration::from_secs(5)).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_connect_refused_is_upstream_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = connect(&TransportDirective::Direct { address }, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ProxyError::UpstreamConnect { .. })));
    }

    #[tokio::test]
    async fn test_socks5_tunnel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            socket.write_all(&[5, 0]).await.unwrap();

            let mut head = [0u8; 4];
            socket.read_exact(&mut head).await.unwrap();
            assert_eq!(head, [5, 1, 0, SOCKS_ATYP_DOMAIN]);
            let len = socket.read_u8().await.unwrap() as usize;
            let mut host = vec![0u8; len];
            socket.read_exact(&mut host).await.unwrap();
            let port = socket.read_u16().await.unwrap();
            socket
                .write_all(&[5, 0, 0, SOCKS_ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
            (String::from_utf8(host).unwrap(), port)
        });

        let directive = TransportDirective::Tunnel {
            gateway,
            destination: "example.com:443".to_string(),
        };
        let mut stream = connect(&directive, Duration::from_secs(5)).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let (host, port) = server.await.unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[tokio::test]
    async fn test_socks5_rejection() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[5, 0]).await.unwrap();
            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            server
                .write_all(&[5, 5, 0, SOCKS_ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let err = socks5_connect(&mut client, "10.0.0.1:80").await.unwrap_err();
        assert!(err.to_string().contains("code 5"));
    }

    #[tokio::test]
    async fn test_tls_connect_with_client_certificate() {
        let server_spec = self_signed("localhost", true);
        let client_spec = self_signed("bookbuyer.mesh", false);

        let server_config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            tls::parse_certificates(&server_spec.cert_chain).unwrap(),
            tls::parse_private_key(&server_spec.private_key).unwrap(),
        )
        .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = acceptor.accept(socket).await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
        });

        let trusted = tls::issuing_cas([&server_spec]).unwrap();
        let directive = TransportDirective::Tls {
            address: format!("localhost:{port}"),
            config: tls::client_config(&client_spec, &trusted).unwrap(),
        };
        let mut stream = connect(&directive, Duration::from_secs(5)).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
