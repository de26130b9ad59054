//! Subscribing to a peer's ports.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use p2pforwarder_proto::shared::{Family, PortsManifest};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    cancel::CancelScope,
    error::ForwarderError,
    forwarder::Shared,
    ip_pool::IpLease,
    listener::{run_port_listener, BoundPorts, ListenTarget, ListenerSet},
    manifest::{request_subscription, Subscriptions},
    transport::{PeerId, Transport},
};

/// A remote port mirrored by a local listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardedPort {
    pub family: Family,
    pub remote_port: u16,
    /// Where the listener is bound. Its port matches `remote_port` unless that port was taken.
    pub local_addr: SocketAddr,
}

/// A subscription to a peer's ports, as returned by [`crate::Forwarder::connect`].
///
/// Dropping the handle keeps the subscription running. It ends when [`Connection::cancel`] is
/// called, or when the forwarder shuts down.
pub struct Connection {
    peer: PeerId,
    listen_ip: IpAddr,
    id: u64,
    scope: CancelScope,
    bound: BoundPorts,
    subscriptions: Arc<Subscriptions>,
}

impl Connection {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// The address the peer's ports are mirrored on.
    pub fn listen_ip(&self) -> IpAddr {
        self.listen_ip
    }

    /// The peer's ports currently being listened on, sorted by family and port.
    pub fn bound_ports(&self) -> Vec<ForwardedPort> {
        self.bound
            .snapshot()
            .into_iter()
            .map(|((family, remote_port), local_addr)| ForwardedPort {
                family,
                remote_port,
                local_addr,
            })
            .collect()
    }

    /// The local address mirroring the peer's `remote_port`, if it is being listened on.
    pub fn local_addr(&self, family: Family, remote_port: u16) -> Option<SocketAddr> {
        self.bound.get(family, remote_port)
    }

    /// Ends the subscription. Its listeners close, and every connection tunneled through them
    /// is terminated. The peer may be connected to again right away.
    pub fn cancel(&self) {
        self.subscriptions.remove(self.peer, self.id);
        self.scope.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("listen_ip", &self.listen_ip)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

pub(crate) async fn connect<T: Transport>(shared: &Arc<Shared<T>>, peer: PeerId, listen_ip: Option<IpAddr>) -> Result<Connection, ForwarderError> {
    let (listen_ip, lease) = match listen_ip {
        Some(ip) => (ip, None),
        None => {
            let lease = shared.ip_pool.allocate()?;
            (IpAddr::V4(lease.ip()), Some(lease))
        }
    };

    let scope = shared.root.child();
    let (id, manifests) = shared.subscriptions.register(peer, shared.config.subscription_queue_capacity, scope.clone())?;
    let bound = BoundPorts::default();

    let task = SubscriptionTask {
        peer,
        id,
        listen_ip,
        scope: scope.clone(),
        bound: bound.clone(),
        lease,
    };
    tokio::spawn(run_subscription(Arc::clone(shared), task, manifests));

    let connection = Connection {
        peer,
        listen_ip,
        id,
        scope,
        bound,
        subscriptions: Arc::clone(&shared.subscriptions),
    };

    if let Err(error) = request_subscription(&shared.transport, peer).await {
        connection.cancel();
        return Err(error.into());
    }

    info!(%peer, %listen_ip, "Connections to {peer}'s ports are listened on {listen_ip}");
    Ok(connection)
}

struct SubscriptionTask {
    peer: PeerId,
    id: u64,
    listen_ip: IpAddr,
    scope: CancelScope,
    bound: BoundPorts,
    lease: Option<IpLease>,
}

/// Applies the manifests received from a peer, one at a time, until the subscription is
/// cancelled. Then closes every listener and gives back the forwarding address.
async fn run_subscription<T: Transport>(shared: Arc<Shared<T>>, task: SubscriptionTask, mut manifests: mpsc::Receiver<PortsManifest>) {
    let SubscriptionTask {
        peer,
        id,
        listen_ip,
        scope,
        bound,
        lease,
    } = task;

    let mut tcp = ListenerSet::new(Family::Tcp);
    let mut udp = ListenerSet::new(Family::Udp);

    loop {
        let manifest = tokio::select! {
            biased;
            _ = scope.cancelled() => break,
            maybe_manifest = manifests.recv() => match maybe_manifest {
                Some(manifest) => manifest,
                None => break,
            },
        };

        for listeners in [&mut tcp, &mut udp] {
            let family = listeners.family();
            let diff = listeners.update(manifest.ports(family), |port| {
                let listener_scope = scope.child();
                let target = ListenTarget {
                    peer,
                    listen_ip,
                    family,
                    port,
                };
                tokio::spawn(run_port_listener(Arc::clone(&shared), target, listener_scope.clone(), bound.clone()));
                listener_scope
            });

            if !diff.is_empty() {
                debug!(%peer, %family, opened = ?diff.opened, closed = ?diff.closed, "Applied ports manifest");
            }
        }
    }

    scope.cancel();
    tcp.close_all();
    udp.close_all();
    shared.subscriptions.remove(peer, id);
    drop(lease);

    info!(%peer, %listen_ip, "Disconnected from peer");
}
