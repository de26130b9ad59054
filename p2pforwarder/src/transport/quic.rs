//! A [`Transport`] over QUIC.
//!
//! Each node runs one endpoint that both accepts and initiates connections. Right after a
//! connection is established, the initiator opens a stream and sends its [`PeerId`], and the
//! acceptor answers with its own. Every later stream starts with its protocol tag as a small
//! string, and is then handed to whatever is listening on that tag.
//!
//! Peers are dialed by id, so their addresses must be known beforehand, either through
//! [`QuicTransport::add_peer`] (typically from a [`PeerCode`]) or because they connected to us.

use std::{
    collections::HashMap,
    io::{self, Error, ErrorKind},
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use p2pforwarder_proto::serialize::{ByteRead, ByteWrite, SmallReadString, SmallWriteString};
use quinn::{ClientConfig, Connection, Endpoint, EndpointConfig, IdleTimeout, RecvStream, SendStream, ServerConfig, TokioRuntime, TransportConfig, VarInt};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc,
};
use tracing::{debug, info, warn};

use super::{IncomingStreams, PeerCode, PeerId, Transport, TunnelStream, INCOMING_QUEUE_CAPACITY};
use crate::utils::lock;

pub const KEEPALIVE_INTERVAL_PERIOD_MILLIS: u64 = 1000;
pub const MAX_IDLE_TIMEOUT_MILLIS: u32 = 10000;
pub const MAX_CONCURRENT_STREAMS: u32 = 1024;

/// How long a new connection or stream may take to identify itself.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const SERVER_NAME: &str = "p2pforwarder";
const RESET_ERROR_CODE: u32 = 1;
const CLOSE_ERROR_CODE: u32 = 0;

pub fn make_endpoint(socket: std::net::UdpSocket) -> io::Result<Endpoint> {
    let runtime = Arc::new(TokioRuntime);
    let server_config = configure_server()?;

    let mut endpoint = Endpoint::new(EndpointConfig::default(), Some(server_config), socket, runtime)?;
    endpoint.set_default_client_config(configure_client());

    Ok(endpoint)
}

fn transport_config() -> TransportConfig {
    let mut transport_config = TransportConfig::default();
    transport_config.max_concurrent_uni_streams(0_u8.into());
    transport_config.max_concurrent_bidi_streams(VarInt::from_u32(MAX_CONCURRENT_STREAMS));
    transport_config.keep_alive_interval(Some(Duration::from_millis(KEEPALIVE_INTERVAL_PERIOD_MILLIS)));
    transport_config.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(MAX_IDLE_TIMEOUT_MILLIS))));
    transport_config
}

pub fn configure_client() -> ClientConfig {
    let crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();

    let mut client_config = ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(Arc::new(transport_config()));
    client_config
}

pub fn configure_server() -> io::Result<ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()]).map_err(Error::other)?;
    let cert_der = cert.serialize_der().map_err(Error::other)?;
    let priv_key = rustls::PrivateKey(cert.serialize_private_key_der());
    let cert_chain = vec![rustls::Certificate(cert_der)];

    let mut server_config = ServerConfig::with_single_cert(cert_chain, priv_key).map_err(Error::other)?;
    server_config.transport = Arc::new(transport_config());
    Ok(server_config)
}

/// Peers authenticate each other by id in the hello exchange, not through certificates.
struct SkipServerVerification;

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

struct QuicInner {
    peer_id: PeerId,
    endpoint: Endpoint,
    addresses: Mutex<HashMap<PeerId, SocketAddr>>,
    connections: Mutex<HashMap<PeerId, Connection>>,
    handlers: Mutex<HashMap<String, mpsc::Sender<(PeerId, QuicStream)>>>,
}

#[derive(Clone)]
pub struct QuicTransport {
    inner: Arc<QuicInner>,
}

impl QuicTransport {
    /// Binds a QUIC endpoint on `address` with a random peer id and starts accepting
    /// connections. Must be called from within a Tokio runtime.
    pub fn bind(address: SocketAddr) -> io::Result<Self> {
        Self::bind_with_id(address, PeerId::random())
    }

    pub fn bind_with_id(address: SocketAddr, peer_id: PeerId) -> io::Result<Self> {
        let socket = std::net::UdpSocket::bind(address)?;
        let endpoint = make_endpoint(socket)?;

        let inner = Arc::new(QuicInner {
            peer_id,
            endpoint,
            addresses: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
        });

        tokio::spawn(accept_connections(Arc::clone(&inner)));
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.endpoint.local_addr()
    }

    /// Returns a code other peers can use to reach this one, advertising `address`.
    pub fn peer_code(&self, address: SocketAddr) -> PeerCode {
        PeerCode::new(self.inner.peer_id, address)
    }

    /// Remembers where to reach a peer.
    pub fn add_peer(&self, code: PeerCode) {
        lock(&self.inner.addresses).insert(code.peer_id, code.address);
    }

    /// Closes every connection and stops accepting new ones.
    pub fn close(&self) {
        self.inner.endpoint.close(VarInt::from_u32(CLOSE_ERROR_CODE), b"closing");
        lock(&self.inner.connections).clear();
    }

    async fn connection_to(&self, peer: PeerId) -> io::Result<Connection> {
        let existing = lock(&self.inner.connections).get(&peer).cloned();
        if let Some(connection) = existing {
            if connection.close_reason().is_none() {
                return Ok(connection);
            }
        }

        let maybe_address = lock(&self.inner.addresses).get(&peer).copied();
        let address = match maybe_address {
            Some(address) => address,
            None => return Err(Error::new(ErrorKind::NotFound, format!("No known address for peer {peer}"))),
        };

        debug!(%peer, %address, "Connecting");
        let connecting = self.inner.endpoint.connect(address, SERVER_NAME).map_err(Error::other)?;
        let connection = connecting.await?;

        let remote = match tokio::time::timeout(HANDSHAKE_TIMEOUT, hello_as_initiator(&connection, self.inner.peer_id)).await {
            Ok(Ok(remote)) => remote,
            Ok(Err(error)) => {
                connection.close(VarInt::from_u32(CLOSE_ERROR_CODE), b"handshake failed");
                return Err(error);
            }
            Err(_) => {
                connection.close(VarInt::from_u32(CLOSE_ERROR_CODE), b"handshake timed out");
                return Err(Error::new(ErrorKind::TimedOut, "Peer handshake timed out"));
            }
        };

        if remote != peer {
            connection.close(VarInt::from_u32(CLOSE_ERROR_CODE), b"unexpected peer");
            let msg = format!("Expected peer {peer} at {address}, found {remote}");
            return Err(Error::new(ErrorKind::InvalidData, msg));
        }

        info!(%peer, %address, "Connected to peer");
        lock(&self.inner.connections).insert(peer, connection.clone());
        tokio::spawn(serve_connection(Arc::clone(&self.inner), connection.clone(), peer));
        Ok(connection)
    }
}

#[async_trait]
impl Transport for QuicTransport {
    type Stream = QuicStream;

    fn local_peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    async fn open_stream(&self, peer: PeerId, protocol: &'static str) -> io::Result<QuicStream> {
        let connection = self.connection_to(peer).await?;
        let (mut send, recv) = connection.open_bi().await?;
        SmallWriteString(protocol).write(&mut send).await?;
        Ok(QuicStream { send, recv })
    }

    fn listen(&self, protocol: &'static str) -> io::Result<IncomingStreams<QuicStream>> {
        let mut handlers = lock(&self.inner.handlers);
        if handlers.get(protocol).is_some_and(|handler| !handler.is_closed()) {
            let msg = format!("Protocol {protocol} is already registered");
            return Err(Error::new(ErrorKind::AddrInUse, msg));
        }

        let (sender, receiver) = mpsc::channel(INCOMING_QUEUE_CAPACITY);
        handlers.insert(String::from(protocol), sender);
        Ok(IncomingStreams::new(receiver))
    }
}

async fn hello_as_initiator(connection: &Connection, local_id: PeerId) -> io::Result<PeerId> {
    let (mut send, mut recv) = connection.open_bi().await?;
    local_id.write(&mut send).await?;
    send.finish().await?;
    PeerId::read(&mut recv).await
}

async fn hello_as_acceptor(connection: &Connection, local_id: PeerId) -> io::Result<PeerId> {
    let (mut send, mut recv) = connection.accept_bi().await?;
    let remote = PeerId::read(&mut recv).await?;
    local_id.write(&mut send).await?;
    send.finish().await?;
    Ok(remote)
}

async fn accept_connections(inner: Arc<QuicInner>) {
    while let Some(connecting) = inner.endpoint.accept().await {
        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let address = connecting.remote_address();
            let connection = match connecting.await {
                Ok(connection) => connection,
                Err(error) => {
                    warn!(%address, "Incoming connection failed: {error}");
                    return;
                }
            };

            let remote = match tokio::time::timeout(HANDSHAKE_TIMEOUT, hello_as_acceptor(&connection, inner.peer_id)).await {
                Ok(Ok(remote)) => remote,
                Ok(Err(error)) => {
                    warn!(%address, "Incoming connection handshake failed: {error}");
                    return;
                }
                Err(_) => {
                    warn!(%address, "Incoming connection handshake timed out");
                    connection.close(VarInt::from_u32(CLOSE_ERROR_CODE), b"handshake timed out");
                    return;
                }
            };

            info!(peer = %remote, %address, "Accepted peer connection");
            lock(&inner.addresses).insert(remote, address);
            lock(&inner.connections).insert(remote, connection.clone());
            serve_connection(inner, connection, remote).await;
        });
    }

    debug!("QUIC endpoint stopped accepting connections");
}

async fn serve_connection(inner: Arc<QuicInner>, connection: Connection, peer: PeerId) {
    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(streams) => streams,
            Err(error) => {
                debug!(%peer, "Connection closed: {error}");
                break;
            }
        };

        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut stream = QuicStream { send, recv };
            let protocol = match tokio::time::timeout(HANDSHAKE_TIMEOUT, SmallReadString::read(&mut stream.recv)).await {
                Ok(Ok(protocol)) => protocol.0,
                Ok(Err(error)) => {
                    debug!(%peer, "Failed to read stream protocol: {error}");
                    stream.reset();
                    return;
                }
                Err(_) => {
                    debug!(%peer, "Timed out reading stream protocol");
                    stream.reset();
                    return;
                }
            };

            let maybe_handler = lock(&inner.handlers).get(&protocol).cloned();
            let handler = match maybe_handler {
                Some(handler) => handler,
                None => {
                    debug!(%peer, %protocol, "No handler for protocol");
                    stream.reset();
                    return;
                }
            };

            if let Err(mpsc::error::SendError((_, stream))) = handler.send((peer, stream)).await {
                stream.reset();
            }
        });
    }

    let mut connections = lock(&inner.connections);
    if connections.get(&peer).is_some_and(|c| c.stable_id() == connection.stable_id()) {
        connections.remove(&peer);
    }
}

/// A QUIC bidirectional stream.
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
}

impl TunnelStream for QuicStream {
    fn reset(mut self) {
        let _ = self.send.reset(VarInt::from_u32(RESET_ERROR_CODE));
        let _ = self.recv.stop(VarInt::from_u32(RESET_ERROR_CODE));
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.send).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}
