//! Addresses of accepted downstream connections.

use crate::router::Direction;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Peer and destination addresses of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionAddrs {
    /// Downstream peer.
    pub peer: SocketAddr,
    /// Address the connection was accepted on.
    pub local: SocketAddr,
    /// Destination before a transparent redirect, if the kernel recorded one.
    pub original_dst: Option<SocketAddr>,
}

impl ConnectionAddrs {
    /// Reads the addresses of an accepted stream. `listener` stands in for
    /// the local address if the socket cannot report it.
    pub fn accepted(stream: &TcpStream, peer: SocketAddr, listener: SocketAddr) -> Self {
        let local = stream.local_addr().unwrap_or(listener);
        Self {
            peer,
            local,
            original_dst: original_dst(stream, local),
        }
    }

    /// Returns the redirected destination, if it differs from the local
    /// address.
    pub fn redirected_dst(&self) -> Option<SocketAddr> {
        self.original_dst.filter(|dst| *dst != self.local)
    }

    /// Returns the port traffic is routed on.
    ///
    /// A redirected connection routes on its original destination port.
    /// Otherwise inbound connections route on the listening port, while
    /// outbound connections leave the choice to the request's host.
    pub fn destination_port(&self, direction: Direction) -> Option<u16> {
        match (self.redirected_dst(), direction) {
            (Some(dst), _) => Some(dst.port()),
            (None, Direction::Inbound) => Some(self.local.port()),
            (None, Direction::Outbound) => None,
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn original_dst(stream: &TcpStream, local: SocketAddr) -> Option<SocketAddr> {
    let sock = socket2::SockRef::from(stream);
    let addr = if local.is_ipv6() {
        sock.original_dst_ipv6()
    } else {
        sock.original_dst()
    };
    addr.ok().and_then(|addr| addr.as_socket())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn original_dst(_stream: &TcpStream, _local: SocketAddr) -> Option<SocketAddr> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn addrs(original_dst: Option<&str>) -> ConnectionAddrs {
        ConnectionAddrs {
            peer: "10.1.2.3:51000".parse().unwrap(),
            local: "10.0.0.5:15003".parse().unwrap(),
            original_dst: original_dst.map(|addr| addr.parse().unwrap()),
        }
    }

    #[test]
    fn test_redirected_connection_uses_original_port() {
        let conn = addrs(Some("10.0.0.5:14001"));
        assert_eq!(conn.destination_port(Direction::Inbound), Some(14001));
        assert_eq!(conn.destination_port(Direction::Outbound), Some(14001));
    }

    #[test]
    fn test_direct_connection_ports() {
        for conn in [addrs(None), addrs(Some("10.0.0.5:15003"))] {
            assert_eq!(conn.redirected_dst(), None);
            assert_eq!(conn.destination_port(Direction::Inbound), Some(15003));
            assert_eq!(conn.destination_port(Direction::Outbound), None);
        }
    }

    #[tokio::test]
    async fn test_accepted_loopback_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (stream, peer) = listener.accept().await.unwrap();
        let _client = client.await.unwrap();

        let conn = ConnectionAddrs::accepted(&stream, peer, addr);
        assert_eq!(conn.local, addr);
        assert_eq!(conn.peer, peer);
        assert_eq!(conn.redirected_dst(), None);
        assert_eq!(conn.destination_port(Direction::Inbound), Some(addr.port()));
    }
}
