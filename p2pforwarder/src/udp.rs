//! Connection-oriented UDP.
//!
//! Tunnel streams are byte streams, so datagrams crossing a tunnel are framed: each one is sent
//! as a big-endian [`u16`] length followed by that many payload bytes. A [`DatagramStream`]
//! produces such frames when read from, and turns frames written to it back into datagrams.
//!
//! On the listening side, a [`UdpListener`] demultiplexes a single bound socket by source address
//! into one [`UdpSession`] per remote endpoint, each of which behaves like an accepted connection.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::UdpSocket,
    sync::mpsc::{self, error::TrySendError},
};
use tracing::trace;

/// The largest payload a single frame can carry.
pub const MAX_DATAGRAM_SIZE: usize = u16::MAX as usize;

/// How many datagrams may be waiting on an accepted session before new ones are dropped.
pub const SESSION_QUEUE_CAPACITY: usize = 64;

const FRAME_HEADER_LEN: usize = 2;

/// A source and sink of whole datagrams, as used by [`DatagramStream`].
pub trait DatagramIo {
    /// Receives one datagram into `buf`. Returns `false` once no more datagrams will arrive.
    fn poll_recv_datagram(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<bool>>;

    fn poll_send_datagram(&mut self, cx: &mut Context<'_>, datagram: &[u8]) -> Poll<io::Result<()>>;
}

/// A connected socket, as dialed towards a local UDP service.
impl DatagramIo for UdpSocket {
    fn poll_recv_datagram(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<bool>> {
        ready!(self.poll_recv(cx, buf))?;
        Poll::Ready(Ok(true))
    }

    fn poll_send_datagram(&mut self, cx: &mut Context<'_>, datagram: &[u8]) -> Poll<io::Result<()>> {
        ready!(self.poll_send(cx, datagram))?;
        Poll::Ready(Ok(()))
    }
}

/// Adapts a [`DatagramIo`] into a byte stream of length-prefixed frames.
pub struct DatagramStream<D> {
    io: D,
    recv_buf: Box<[u8]>,
    read_frame: Vec<u8>,
    read_frame_pos: usize,
    read_closed: bool,
    write_buf: Vec<u8>,
}

impl<D: DatagramIo + Unpin> DatagramStream<D> {
    pub fn new(io: D) -> Self {
        Self {
            io,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE].into_boxed_slice(),
            read_frame: Vec::with_capacity(FRAME_HEADER_LEN + 1500),
            read_frame_pos: 0,
            read_closed: false,
            write_buf: Vec::with_capacity(FRAME_HEADER_LEN + 1500),
        }
    }

    pub fn get_ref(&self) -> &D {
        &self.io
    }

    /// Sends every complete frame in the write buffer as a datagram.
    fn poll_send_frames(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            if self.write_buf.len() < FRAME_HEADER_LEN {
                return Poll::Ready(Ok(()));
            }

            let len = u16::from_be_bytes([self.write_buf[0], self.write_buf[1]]) as usize;
            let frame_end = FRAME_HEADER_LEN + len;
            if self.write_buf.len() < frame_end {
                return Poll::Ready(Ok(()));
            }

            ready!(self.io.poll_send_datagram(cx, &self.write_buf[FRAME_HEADER_LEN..frame_end]))?;
            self.write_buf.drain(..frame_end);
        }
    }
}

impl<D: DatagramIo + Unpin> AsyncRead for DatagramStream<D> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.read_frame_pos < this.read_frame.len() {
                let pending = &this.read_frame[this.read_frame_pos..];
                let len = pending.len().min(buf.remaining());
                buf.put_slice(&pending[..len]);
                this.read_frame_pos += len;
                return Poll::Ready(Ok(()));
            }

            if this.read_closed {
                return Poll::Ready(Ok(()));
            }

            let mut datagram = ReadBuf::new(&mut this.recv_buf);
            if !ready!(this.io.poll_recv_datagram(cx, &mut datagram))? {
                this.read_closed = true;
                continue;
            }

            let datagram = datagram.filled();
            this.read_frame.clear();
            this.read_frame.extend_from_slice(&(datagram.len() as u16).to_be_bytes());
            this.read_frame.extend_from_slice(datagram);
            this.read_frame_pos = 0;
        }
    }
}

impl<D: DatagramIo + Unpin> AsyncWrite for DatagramStream<D> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // Once every complete frame is out, the buffer holds at most one partial frame, so there
        // is always room for at least one more byte.
        ready!(this.poll_send_frames(cx))?;
        let space = FRAME_HEADER_LEN + MAX_DATAGRAM_SIZE - this.write_buf.len();
        let len = buf.len().min(space);
        this.write_buf.extend_from_slice(&buf[..len]);

        if let Poll::Ready(Err(error)) = this.poll_send_frames(cx) {
            return Poll::Ready(Err(error));
        }

        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_send_frames(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_send_frames(cx)
    }
}

/// One remote endpoint of a [`UdpListener`].
pub struct UdpSession {
    receiver: mpsc::Receiver<Vec<u8>>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpSession {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl DatagramIo for UdpSession {
    fn poll_recv_datagram(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<bool>> {
        match ready!(self.receiver.poll_recv(cx)) {
            Some(datagram) => {
                let len = datagram.len().min(buf.remaining());
                buf.put_slice(&datagram[..len]);
                Poll::Ready(Ok(true))
            }
            None => Poll::Ready(Ok(false)),
        }
    }

    fn poll_send_datagram(&mut self, cx: &mut Context<'_>, datagram: &[u8]) -> Poll<io::Result<()>> {
        ready!(self.socket.poll_send_to(cx, datagram, self.peer))?;
        Poll::Ready(Ok(()))
    }
}

/// Accepts UDP "connections": the first datagram from a new source address yields a new
/// session, and later datagrams from that address are routed to it.
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    sessions: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>,
    recv_buf: Box<[u8]>,
}

impl UdpListener {
    pub async fn bind(address: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(address).await?;
        Ok(Self {
            socket: Arc::new(socket),
            sessions: HashMap::new(),
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE].into_boxed_slice(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Waits for a datagram from a source address with no live session, routing datagrams of
    /// known sessions along the way. Cancel-safe.
    pub async fn accept(&mut self) -> io::Result<(DatagramStream<UdpSession>, SocketAddr)> {
        loop {
            let (len, from) = self.socket.recv_from(&mut self.recv_buf).await?;
            let mut datagram = self.recv_buf[..len].to_vec();

            if let Some(sender) = self.sessions.get(&from) {
                match sender.try_send(datagram) {
                    Ok(()) => continue,
                    Err(TrySendError::Full(_)) => {
                        trace!(%from, "Session queue full, dropping datagram");
                        continue;
                    }
                    Err(TrySendError::Closed(returned)) => datagram = returned,
                }
            }

            self.sessions.retain(|_, sender| !sender.is_closed());

            let (sender, receiver) = mpsc::channel(SESSION_QUEUE_CAPACITY);
            let _ = sender.try_send(datagram);
            self.sessions.insert(from, sender);

            let session = UdpSession {
                receiver,
                socket: Arc::clone(&self.socket),
                peer: from,
            };

            return Ok((DatagramStream::new(session), from));
        }
    }
}
