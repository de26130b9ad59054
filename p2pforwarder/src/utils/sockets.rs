use std::{
    io,
    net::{IpAddr, SocketAddr},
};

use p2pforwarder_proto::shared::Family;
use rand::Rng;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpSocket, TcpStream, UdpSocket},
};
use tracing::warn;

use crate::{
    error::ForwarderError,
    udp::{DatagramStream, UdpListener},
};

/// The range random fallback ports are picked from when the requested port can't be bound.
pub const FALLBACK_PORT_RANGE: std::ops::Range<u16> = 1024..65535;

/// A connection on the local side of a tunnel, regardless of its family.
pub trait LocalStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> LocalStream for T {}

/// A bound local listener of either family.
pub enum PortListener {
    Tcp(TcpListener),
    Udp(UdpListener),
}

impl PortListener {
    pub async fn bind(family: Family, address: SocketAddr) -> io::Result<Self> {
        match family {
            Family::Tcp => Ok(Self::Tcp(TcpListener::bind(address).await?)),
            Family::Udp => Ok(Self::Udp(UdpListener::bind(address).await?)),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr(),
            Self::Udp(listener) => listener.local_addr(),
        }
    }

    /// Waits for the next incoming connection. Cancel-safe.
    pub async fn accept(&mut self) -> io::Result<(Box<dyn LocalStream>, SocketAddr)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, from) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok((Box::new(stream), from))
            }
            Self::Udp(listener) => {
                let (stream, from) = listener.accept().await?;
                Ok((Box::new(stream), from))
            }
        }
    }
}

/// Binds a listener on `ip:port`. If that fails, up to `retries` random ports from
/// [`FALLBACK_PORT_RANGE`] are tried on the same address. The error of the last attempt is
/// returned if none succeeds.
pub async fn bind_with_fallback(family: Family, ip: IpAddr, port: u16, retries: usize) -> Result<PortListener, ForwarderError> {
    let mut address = SocketAddr::new(ip, port);
    let mut attempt = 0;

    loop {
        let error = match PortListener::bind(family, address).await {
            Ok(listener) => return Ok(listener),
            Err(error) => error,
        };

        if attempt >= retries {
            return Err(ForwarderError::Bind { addr: address, source: error });
        }

        attempt += 1;
        let fallback = rand::thread_rng().gen_range(FALLBACK_PORT_RANGE);
        warn!(%family, %address, "Failed to bind: {error}, retrying on port {fallback}");
        address.set_port(fallback);
    }
}

/// Opens a connection to `target`, bound to `source_ip` when both addresses are of the same IP
/// version.
pub async fn connect_local(family: Family, source_ip: IpAddr, target: SocketAddr) -> io::Result<Box<dyn LocalStream>> {
    let source = match source_ip.is_ipv4() == target.is_ipv4() {
        true => Some(SocketAddr::new(source_ip, 0)),
        false => None,
    };

    match family {
        Family::Tcp => {
            let stream = match source {
                Some(source) => {
                    let socket = match source {
                        SocketAddr::V4(_) => TcpSocket::new_v4()?,
                        SocketAddr::V6(_) => TcpSocket::new_v6()?,
                    };
                    socket.bind(source)?;
                    socket.connect(target).await?
                }
                None => TcpStream::connect(target).await?,
            };

            let _ = stream.set_nodelay(true);
            Ok(Box::new(stream))
        }
        Family::Udp => {
            let bind_address = source.unwrap_or_else(|| match target {
                SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0),
                SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
            });

            let socket = UdpSocket::bind(bind_address).await?;
            socket.connect(target).await?;
            Ok(Box::new(DatagramStream::new(socket)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use p2pforwarder_proto::shared::Family;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::{bind_with_fallback, connect_local};
    use crate::error::ForwarderError;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn bind_falls_back_to_another_port() {
        let taken = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let listener = bind_with_fallback(Family::Tcp, LOCALHOST, taken_port, 4).await.unwrap();
        let bound = listener.local_addr().unwrap();
        assert_eq!(bound.ip(), LOCALHOST);
        assert_ne!(bound.port(), taken_port);
    }

    #[tokio::test]
    async fn bind_without_retries_reports_the_address() {
        let taken = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let taken_addr = taken.local_addr().unwrap();

        match bind_with_fallback(Family::Tcp, LOCALHOST, taken_addr.port(), 0).await {
            Err(ForwarderError::Bind { addr, .. }) => assert_eq!(addr, taken_addr),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("bind should fail"),
        }
    }

    #[tokio::test]
    async fn connect_local_tcp_uses_source_ip() {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let target = listener.local_addr().unwrap();

        let mut stream = connect_local(Family::Tcp, LOCALHOST, target).await.unwrap();
        let (mut accepted, from) = listener.accept().await.unwrap();
        assert_eq!(from.ip(), LOCALHOST);

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn connect_local_skips_source_of_other_ip_version() {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let target = listener.local_addr().unwrap();
        let v6_source = IpAddr::V6(std::net::Ipv6Addr::LOCALHOST);

        let _stream = connect_local(Family::Tcp, v6_source, target).await.unwrap();
        let (_, from): (_, SocketAddr) = listener.accept().await.unwrap();
        assert!(from.is_ipv4());
    }
}
