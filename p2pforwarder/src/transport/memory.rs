//! An in-process [`Transport`] where every peer lives on the same [`MemoryNetwork`] and streams
//! are in-memory pipes. Useful for running several forwarders in one process.

use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf},
    sync::mpsc,
};

use super::{IncomingStreams, PeerId, Transport, TunnelStream, INCOMING_QUEUE_CAPACITY};
use crate::utils::lock;

/// How many bytes each direction of a memory stream buffers before writes block.
pub const MEMORY_STREAM_BUFFER: usize = 64 * 1024;

type Handlers = HashMap<&'static str, mpsc::Sender<(PeerId, MemoryStream)>>;

/// A set of peers that can reach each other.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    peers: Arc<Mutex<HashMap<PeerId, Handlers>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the network as a new peer with a random id.
    pub fn transport(&self) -> MemoryTransport {
        self.transport_with_id(PeerId::random())
    }

    pub fn transport_with_id(&self, peer_id: PeerId) -> MemoryTransport {
        lock(&self.peers).entry(peer_id).or_default();
        MemoryTransport {
            peer_id,
            network: self.clone(),
        }
    }

    /// Makes `peer` unreachable: its registered protocols are dropped, and opening streams to
    /// it fails from now on.
    pub fn remove(&self, peer: PeerId) {
        lock(&self.peers).remove(&peer);
    }
}

/// One peer's handle on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    peer_id: PeerId,
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    type Stream = MemoryStream;

    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn open_stream(&self, peer: PeerId, protocol: &'static str) -> io::Result<MemoryStream> {
        let maybe_handler = lock(&self.network.peers)
            .get(&peer)
            .and_then(|handlers| handlers.get(protocol))
            .cloned();

        let handler = match maybe_handler {
            Some(handler) => handler,
            None => {
                let msg = format!("Peer {peer} doesn't handle protocol {protocol}");
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, msg));
            }
        };

        let (local, remote) = MemoryStream::pair();
        match handler.send((self.peer_id, remote)).await {
            Ok(()) => Ok(local),
            Err(_) => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "Peer stopped handling the protocol")),
        }
    }

    fn listen(&self, protocol: &'static str) -> io::Result<IncomingStreams<MemoryStream>> {
        let mut peers = lock(&self.network.peers);
        let handlers = peers.entry(self.peer_id).or_default();

        if handlers.get(protocol).is_some_and(|handler| !handler.is_closed()) {
            let msg = format!("Protocol {protocol} is already registered");
            return Err(io::Error::new(io::ErrorKind::AddrInUse, msg));
        }

        let (sender, receiver) = mpsc::channel(INCOMING_QUEUE_CAPACITY);
        handlers.insert(protocol, sender);
        Ok(IncomingStreams::new(receiver))
    }
}

/// One end of an in-memory stream. Dropping it closes the stream cleanly: the other end reads
/// end of stream. Resetting it aborts the stream: the other end gets
/// [`io::ErrorKind::ConnectionReset`] from then on, and data still in flight is discarded.
pub struct MemoryStream {
    inner: DuplexStream,
    reset: Arc<AtomicBool>,
}

impl MemoryStream {
    fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(MEMORY_STREAM_BUFFER);
        let reset = Arc::new(AtomicBool::new(false));
        let a = Self {
            inner: a,
            reset: Arc::clone(&reset),
        };

        (a, Self { inner: b, reset })
    }

    fn check_reset(&self) -> io::Result<()> {
        match self.reset.load(Ordering::Acquire) {
            true => Err(io::Error::new(io::ErrorKind::ConnectionReset, "Stream was reset by the peer")),
            false => Ok(()),
        }
    }
}

impl TunnelStream for MemoryStream {
    fn reset(self) {
        // Dropping the duplex half afterwards wakes whatever the other end is waiting on.
        self.reset.store(true, Ordering::Release);
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.check_reset()?;
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.check_reset()?;
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.check_reset()?;
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.check_reset()?;
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::MemoryNetwork;
    use crate::transport::{Transport, TunnelStream};

    #[tokio::test]
    async fn streams_reach_the_registered_protocol() {
        let network = MemoryNetwork::new();
        let a = network.transport();
        let b = network.transport();
        let mut incoming = b.listen("/echo").unwrap();

        let mut outbound = a.open_stream(b.local_peer_id(), "/echo").await.unwrap();
        let (from, mut inbound) = incoming.next().await.unwrap();
        assert_eq!(from, a.local_peer_id());

        outbound.write_all(b"hi").await.unwrap();
        outbound.shutdown().await.unwrap();

        let mut received = Vec::new();
        inbound.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hi");
    }

    #[tokio::test]
    async fn unknown_protocols_and_peers_are_refused() {
        let network = MemoryNetwork::new();
        let a = network.transport();
        let b = network.transport();

        let error = a.open_stream(b.local_peer_id(), "/nothing").await.err().unwrap();
        assert_eq!(error.kind(), ErrorKind::ConnectionRefused);

        let _incoming = b.listen("/something").unwrap();
        network.remove(b.local_peer_id());
        let error = a.open_stream(b.local_peer_id(), "/something").await.err().unwrap();
        assert_eq!(error.kind(), ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn protocols_register_once() {
        let network = MemoryNetwork::new();
        let a = network.transport();

        let first = a.listen("/proto").unwrap();
        assert_eq!(a.listen("/proto").err().unwrap().kind(), ErrorKind::AddrInUse);

        drop(first);
        assert!(a.listen("/proto").is_ok());
    }

    #[tokio::test]
    async fn reset_is_distinct_from_close() {
        let network = MemoryNetwork::new();
        let a = network.transport();
        let b = network.transport();
        let mut incoming = b.listen("/abort").unwrap();

        let closed = a.open_stream(b.local_peer_id(), "/abort").await.unwrap();
        let (_, mut closed_remote) = incoming.next().await.unwrap();
        drop(closed);
        let mut received = Vec::new();
        closed_remote.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());

        let mut aborted = a.open_stream(b.local_peer_id(), "/abort").await.unwrap();
        let (_, mut aborted_remote) = incoming.next().await.unwrap();
        aborted.write_all(b"partial").await.unwrap();
        aborted.reset();

        let error = aborted_remote.read_to_end(&mut received).await.err().unwrap();
        assert_eq!(error.kind(), ErrorKind::ConnectionReset);
        let error = aborted_remote.write_all(b"late").await.err().unwrap();
        assert_eq!(error.kind(), ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn reset_wakes_a_pending_read() {
        let network = MemoryNetwork::new();
        let a = network.transport();
        let b = network.transport();
        let mut incoming = b.listen("/abort").unwrap();

        let outbound = a.open_stream(b.local_peer_id(), "/abort").await.unwrap();
        let (_, mut inbound) = incoming.next().await.unwrap();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            inbound.read(&mut buf).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        outbound.reset();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert_eq!(result.err().unwrap().kind(), ErrorKind::ConnectionReset);
    }
}
