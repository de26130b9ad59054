use std::{future::Future, io, net::IpAddr, sync::Arc};

use p2pforwarder_proto::shared::{Family, PortsManifest, DIAL_PROTOCOL, PORTS_SUB_PROTOCOL};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    cancel::CancelScope,
    config::ForwarderConfig,
    connect::{self, Connection},
    dial,
    error::ForwarderError,
    ip_pool::ForwardingIpPool,
    manifest::{self, ManifestBytes, Subscribers, Subscriptions},
    registry::{OpenPortHandle, OpenPorts},
    transport::{IncomingStreams, PeerId, Transport},
};

/// The state shared by every task a [`Forwarder`] spawns. Each collection carries its own lock,
/// and none of them is held across an await point.
pub(crate) struct Shared<T: Transport> {
    pub transport: T,
    pub config: ForwarderConfig,
    pub root: CancelScope,
    pub open_ports: Arc<OpenPorts>,
    pub subscribers: Subscribers,
    pub subscriptions: Arc<Subscriptions>,
    pub ip_pool: ForwardingIpPool,
    pub manifests: watch::Sender<ManifestBytes>,
}

/// A node of the forwarding network.
///
/// It exposes the ports opened with [`Forwarder::open_port`] to every peer that subscribes,
/// and mirrors the ports of the peers it [`Forwarder::connect`]s to as local listeners.
///
/// Dropping the forwarder cancels everything it started: open ports, subscriptions and every
/// tunneled connection.
pub struct Forwarder<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Forwarder<T> {
    /// Creates a forwarder on `transport`, registering its protocol handlers. Must be called
    /// from within a Tokio runtime.
    pub fn new(transport: T, config: ForwarderConfig) -> Result<Self, ForwarderError> {
        let dial_streams = transport.listen(DIAL_PROTOCOL)?;
        let ports_sub_streams = transport.listen(PORTS_SUB_PROTOCOL)?;

        let open_ports = Arc::new(OpenPorts::new());
        let changes = open_ports.subscribe_changes();

        let shared = Arc::new(Shared {
            transport,
            ip_pool: ForwardingIpPool::new(config.forwarding_ip_base),
            config,
            root: CancelScope::new(),
            open_ports,
            subscribers: Subscribers::new(),
            subscriptions: Arc::new(Subscriptions::new()),
            manifests: watch::Sender::new(None),
        });

        spawn_handler_loop(&shared, DIAL_PROTOCOL, dial_streams, dial::handle_dial_stream::<T>);
        spawn_handler_loop(&shared, PORTS_SUB_PROTOCOL, ports_sub_streams, manifest::handle_ports_sub_stream::<T>);
        tokio::spawn(manifest::run_publisher(Arc::clone(&shared), changes));

        info!(peer = %shared.transport.local_peer_id(), "Forwarder started");
        Ok(Self { shared })
    }

    pub fn id(&self) -> PeerId {
        self.shared.transport.local_peer_id()
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.shared.config
    }

    /// Exposes the local `port` to subscribed peers. Fails with [`ForwarderError::AlreadyOpen`]
    /// if it already is. Subscribers learn about the change asynchronously.
    pub fn open_port(&self, family: Family, port: u16) -> Result<OpenPortHandle, ForwarderError> {
        let handle = self.shared.open_ports.open(&self.shared.root, family, port)?;
        info!(%family, port, "Opened port");
        Ok(handle)
    }

    /// Like [`Forwarder::open_port`], with the family given by name ("tcp" or "udp").
    pub fn open_port_named(&self, family: &str, port: u16) -> Result<OpenPortHandle, ForwarderError> {
        self.open_port(family.parse::<Family>()?, port)
    }

    /// The ports currently exposed by this node.
    pub fn open_ports(&self) -> PortsManifest {
        self.shared.open_ports.manifest()
    }

    /// Subscribes to `peer`'s ports and mirrors them as listeners on `listen_ip`, or on an
    /// address taken from the forwarding pool if `None`.
    pub async fn connect(&self, peer: PeerId, listen_ip: Option<IpAddr>) -> Result<Connection, ForwarderError> {
        connect::connect(&self.shared, peer, listen_ip).await
    }

    /// Ends the subscription to `peer`, if any. Returns whether there was one.
    pub fn disconnect(&self, peer: PeerId) -> bool {
        self.shared.subscriptions.cancel(peer)
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.shared.subscriptions.contains(peer)
    }

    /// The peers currently receiving this node's manifest pushes.
    pub fn subscribers(&self) -> Vec<PeerId> {
        self.shared.subscribers.snapshot()
    }

    /// Cancels everything this forwarder started. Also done on drop.
    pub fn shutdown(&self) {
        if !self.shared.root.is_cancelled() {
            debug!(peer = %self.id(), "Shutting down forwarder");
            self.shared.root.cancel();
        }
    }
}

impl<T: Transport> Drop for Forwarder<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Serves the inbound streams of one protocol until the forwarder shuts down, spawning one task
/// per stream so a failing stream never affects the others.
fn spawn_handler_loop<T, F, Fut>(shared: &Arc<Shared<T>>, protocol: &'static str, mut incoming: IncomingStreams<T::Stream>, handler: F)
where
    T: Transport,
    F: Fn(Arc<Shared<T>>, PeerId, T::Stream) -> Fut + Send + 'static,
    Fut: Future<Output = io::Result<()>> + Send + 'static,
{
    let shared = Arc::clone(shared);
    let root = shared.root.clone();

    tokio::spawn(async move {
        loop {
            let (peer, stream) = tokio::select! {
                biased;
                _ = root.cancelled() => break,
                next = incoming.next() => match next {
                    Some(next) => next,
                    None => break,
                },
            };

            let task = handler(Arc::clone(&shared), peer, stream);
            tokio::spawn(async move {
                if let Err(error) = task.await {
                    warn!(%peer, protocol, "Stream handler finished with error: {error}");
                }
            });
        }

        debug!(protocol, "Stopped serving protocol");
    });
}
