//! The peer-to-peer layer the forwarder runs on.
//!
//! A [`Transport`] knows its own [`PeerId`], can open a bidirectional stream to another peer
//! under a protocol tag, and hands out the streams other peers open towards it, one queue per
//! protocol tag.

use std::io;

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};

pub mod memory;
mod peer_code;
mod peer_id;
pub mod quic;

pub use peer_code::*;
pub use peer_id::*;

/// How many inbound streams may be waiting on a protocol's queue before opening more blocks.
pub const INCOMING_QUEUE_CAPACITY: usize = 64;

/// A reliable, ordered, bidirectional byte stream to a remote peer.
///
/// Shutting down the write side signals end of stream to the remote while still allowing reads.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Aborts the stream in both directions, signaling failure to the remote.
    fn reset(self);
}

/// The streams opened towards us on one protocol, along with the peer that opened each.
pub struct IncomingStreams<S> {
    receiver: mpsc::Receiver<(PeerId, S)>,
}

impl<S> IncomingStreams<S> {
    pub fn new(receiver: mpsc::Receiver<(PeerId, S)>) -> Self {
        Self { receiver }
    }

    /// Returns the next inbound stream, or `None` once the transport is gone.
    pub async fn next(&mut self) -> Option<(PeerId, S)> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Stream: TunnelStream;

    fn local_peer_id(&self) -> PeerId;

    /// Opens a new stream to `peer`, to be handled by whatever it registered for `protocol`.
    async fn open_stream(&self, peer: PeerId, protocol: &'static str) -> io::Result<Self::Stream>;

    /// Registers `protocol`, returning the queue of streams other peers open on it. Each
    /// protocol can be registered once.
    fn listen(&self, protocol: &'static str) -> io::Result<IncomingStreams<Self::Stream>>;
}
