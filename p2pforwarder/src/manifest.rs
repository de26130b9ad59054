//! Manifest sync: who receives this node's open ports, and what this node does with the ports
//! other nodes send it.
//!
//! Every stream on [`PORTS_SUB_PROTOCOL`] starts with a [`ManifestMode`] byte. A `Subscribe`
//! stream carries nothing else and registers its sender as a subscriber. A `Manifest` stream
//! carries a full [`PortsManifest`], answered with a single [`ManifestAck`] byte once parsed.
//! Pushes always go over fresh streams, and a push that isn't acknowledged drops the subscriber.

use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use p2pforwarder_proto::{
    serialize::{ByteRead, ByteWrite},
    shared::{ManifestAck, ManifestMode, PortsManifest, PORTS_SUB_PROTOCOL},
};
use tokio::{
    io::AsyncWriteExt,
    sync::{mpsc, watch},
};
use tracing::{debug, error, info, warn};

use crate::{
    cancel::CancelScope,
    error::ForwarderError,
    forwarder::Shared,
    transport::{PeerId, Transport, TunnelStream},
    utils::lock,
};

/// The latest serialized manifest, shared by every subscriber's push worker. `None` until the
/// publisher serialized the registry for the first time.
pub(crate) type ManifestBytes = Option<Arc<[u8]>>;

struct SubscriberEntry {
    id: u64,
    scope: CancelScope,
}

/// The peers that asked to receive this node's manifest, each served by its own push worker.
pub(crate) struct Subscribers {
    peers: Mutex<HashMap<PeerId, SubscriberEntry>>,
    next_id: AtomicU64,
}

impl Subscribers {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers `peer` with the worker scope `scope`, replacing and cancelling any previous
    /// registration. Returns the new registration's id.
    pub fn insert(&self, peer: PeerId, scope: CancelScope) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let previous = lock(&self.peers).insert(peer, SubscriberEntry { id, scope });
        if let Some(previous) = previous {
            previous.scope.cancel();
        }

        id
    }

    /// Removes `peer` if it is still the registration `id`. Returns whether it was removed.
    pub fn remove(&self, peer: PeerId, id: u64) -> bool {
        let mut peers = lock(&self.peers);
        match peers.get(&peer) {
            Some(entry) if entry.id == id => {
                if let Some(entry) = peers.remove(&peer) {
                    entry.scope.cancel();
                }
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        lock(&self.peers).contains_key(&peer)
    }

    pub fn snapshot(&self) -> Vec<PeerId> {
        lock(&self.peers).keys().copied().collect()
    }
}

struct SubscriptionEntry {
    id: u64,
    queue: mpsc::Sender<PortsManifest>,
    scope: CancelScope,
}

/// The peers this node subscribed to, each with the queue its manifests are delivered on.
pub(crate) struct Subscriptions {
    entries: Mutex<HashMap<PeerId, SubscriptionEntry>>,
    next_id: AtomicU64,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a subscription to `peer` that lives until `scope` is cancelled. Returns an id
    /// identifying this registration, and the receiving end of its manifest queue.
    pub fn register(
        &self,
        peer: PeerId,
        capacity: usize,
        scope: CancelScope,
    ) -> Result<(u64, mpsc::Receiver<PortsManifest>), ForwarderError> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(&peer) {
            return Err(ForwarderError::AlreadyConnected(peer));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue, receiver) = mpsc::channel(capacity.max(1));
        entries.insert(peer, SubscriptionEntry { id, queue, scope });
        Ok((id, receiver))
    }

    pub fn queue(&self, peer: PeerId) -> Option<mpsc::Sender<PortsManifest>> {
        lock(&self.entries).get(&peer).map(|entry| entry.queue.clone())
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        lock(&self.entries).contains_key(&peer)
    }

    /// Removes the subscription to `peer`, but only if it is still the registration `id`.
    pub fn remove(&self, peer: PeerId, id: u64) {
        let mut entries = lock(&self.entries);
        if entries.get(&peer).is_some_and(|entry| entry.id == id) {
            entries.remove(&peer);
        }
    }

    /// Removes and cancels the subscription to `peer`. Returns whether there was one.
    pub fn cancel(&self, peer: PeerId) -> bool {
        let maybe_entry = lock(&self.entries).remove(&peer);
        match maybe_entry {
            Some(entry) => {
                entry.scope.cancel();
                true
            }
            None => false,
        }
    }
}

/// Serializes the registry into `shared.manifests` on startup and after every change, until the
/// forwarder shuts down. Changes that arrive while serializing are coalesced into one update.
pub(crate) async fn run_publisher<T: Transport>(shared: Arc<Shared<T>>, mut changes: watch::Receiver<u64>) {
    let root = shared.root.clone();

    loop {
        changes.borrow_and_update();
        let manifest = shared.open_ports.manifest();
        match manifest.to_bytes().await {
            Ok(bytes) => {
                debug!(tcp = ?manifest.tcp, udp = ?manifest.udp, "Publishing ports manifest");
                shared.manifests.send_replace(Some(bytes.into()));
            }
            Err(error) => error!("Failed to serialize ports manifest: {error}"),
        }

        tokio::select! {
            biased;
            _ = root.cancelled() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!("Manifest publisher stopped");
}

/// Registers `peer` as a subscriber and starts its push worker.
fn add_subscriber<T: Transport>(shared: &Arc<Shared<T>>, peer: PeerId) {
    let scope = shared.root.child();
    let id = shared.subscribers.insert(peer, scope.clone());
    let manifests = shared.manifests.subscribe();
    tokio::spawn(run_subscriber(Arc::clone(shared), peer, id, scope, manifests));
}

/// Pushes the current manifest to one subscriber, then the latest one after every change. Only
/// one push to the peer is in flight at a time, so pushes are never reordered, and a slow peer
/// only delays its own updates. A failed push ends the subscription.
async fn run_subscriber<T: Transport>(
    shared: Arc<Shared<T>>,
    peer: PeerId,
    id: u64,
    scope: CancelScope,
    mut manifests: watch::Receiver<ManifestBytes>,
) {
    loop {
        let maybe_bytes = manifests.borrow_and_update().clone();
        if let Some(bytes) = maybe_bytes {
            let push = tokio::time::timeout(shared.config.push_timeout, push_manifest(&shared.transport, peer, &bytes));
            let result = tokio::select! {
                biased;
                _ = scope.cancelled() => break,
                result = push => result,
            };

            let error = match result {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error),
                Err(_) => Some(io::Error::new(ErrorKind::TimedOut, "Manifest push timed out")),
            };

            if let Some(error) = error {
                if shared.subscribers.remove(peer, id) {
                    warn!(%peer, "Dropped subscriber after failed manifest push: {error}");
                }
                break;
            }
        }

        tokio::select! {
            biased;
            _ = scope.cancelled() => break,
            changed = manifests.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!(%peer, "Stopped pushing manifests");
}

/// Sends a serialized manifest to `peer` and waits for its acknowledgement.
pub(crate) async fn push_manifest<T: Transport>(transport: &T, peer: PeerId, manifest: &[u8]) -> io::Result<()> {
    let mut stream = transport.open_stream(peer, PORTS_SUB_PROTOCOL).await?;

    match exchange_manifest(&mut stream, manifest).await {
        Ok(()) => {
            let _ = stream.shutdown().await;
            Ok(())
        }
        Err(error) => {
            stream.reset();
            Err(error)
        }
    }
}

async fn exchange_manifest<S: TunnelStream>(stream: &mut S, manifest: &[u8]) -> io::Result<()> {
    ManifestMode::Manifest.write(stream).await?;
    stream.write_all(manifest).await?;
    stream.flush().await?;
    ManifestAck::read(stream).await?;
    Ok(())
}

/// Asks `peer` to push us its manifest now and whenever it changes.
pub(crate) async fn request_subscription<T: Transport>(transport: &T, peer: PeerId) -> io::Result<()> {
    let mut stream = transport.open_stream(peer, PORTS_SUB_PROTOCOL).await?;

    if let Err(error) = ManifestMode::Subscribe.write(&mut stream).await {
        stream.reset();
        return Err(error);
    }

    stream.shutdown().await
}

/// Serves one inbound stream on [`PORTS_SUB_PROTOCOL`].
pub(crate) async fn handle_ports_sub_stream<T: Transport>(shared: Arc<Shared<T>>, peer: PeerId, mut stream: T::Stream) -> io::Result<()> {
    let mode = match ManifestMode::read(&mut stream).await {
        Ok(mode) => mode,
        Err(error) => {
            stream.reset();
            return Err(error);
        }
    };

    match mode {
        ManifestMode::Subscribe => {
            if shared.root.is_cancelled() {
                debug!(%peer, "Forwarder is shutting down, ignoring subscription");
                stream.reset();
                return Ok(());
            }

            add_subscriber(&shared, peer);
            info!(%peer, "New subscriber");

            let _ = stream.shutdown().await;
            Ok(())
        }
        ManifestMode::Manifest => receive_manifest(&shared, peer, stream).await,
    }
}

async fn receive_manifest<T: Transport>(shared: &Shared<T>, peer: PeerId, mut stream: T::Stream) -> io::Result<()> {
    let queue = match shared.subscriptions.queue(peer) {
        Some(queue) => queue,
        None => {
            debug!(%peer, "Ignoring manifest from a peer we're not subscribed to");
            let _ = stream.shutdown().await;
            return Ok(());
        }
    };

    let manifest = match PortsManifest::read(&mut stream).await {
        Ok(manifest) => manifest,
        Err(error) => {
            stream.reset();
            return Err(error);
        }
    };

    if let Err(error) = ManifestAck.write(&mut stream).await {
        stream.reset();
        return Err(error);
    }

    let _ = stream.flush().await;
    debug!(%peer, tcp = ?manifest.tcp, udp = ?manifest.udp, "Received ports manifest");

    if queue.send(manifest).await.is_err() {
        debug!(%peer, "Subscription ended before the manifest could be applied");
    }

    let _ = stream.shutdown().await;
    Ok(())
}
