//! The mirroring side of a tunnel: local listeners standing in for a peer's open ports.
//!
//! Every manifest received from a peer is diffed against the listeners already running for it
//! by a [`ListenerSet`]. Ports still present keep their listener, ports gone from the manifest
//! have theirs cancelled, and new ports get one spawned with [`run_port_listener`].

use std::{
    collections::{BTreeMap, HashMap},
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
};

use p2pforwarder_proto::shared::{DialHeader, Family};
use tracing::{error, info, warn};

use crate::{
    cancel::CancelScope,
    dial::open_dial_stream,
    forwarder::Shared,
    pipe::pipe_both_and_close,
    transport::{PeerId, Transport},
    utils::{bind_with_fallback, lock, LocalStream},
};

/// What a call to [`ListenerSet::update`] changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ListenerDiff {
    pub opened: Vec<u16>,
    pub closed: Vec<u16>,
}

impl ListenerDiff {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty()
    }
}

/// The listeners of one family running on behalf of one peer, by remote port.
pub struct ListenerSet {
    family: Family,
    active: HashMap<u16, CancelScope>,
}

impl ListenerSet {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            active: HashMap::new(),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.active.contains_key(&port)
    }

    /// Makes the running listeners match `ports`. Listeners for ports in both the old and new
    /// set are left untouched, the ones only in the old set are cancelled, and `open` is called
    /// for each port only in the new set, returning the scope of the listener it started.
    /// Duplicate ports are ignored.
    pub fn update<F>(&mut self, ports: &[u16], mut open: F) -> ListenerDiff
    where
        F: FnMut(u16) -> CancelScope,
    {
        let mut previous = std::mem::take(&mut self.active);
        let mut diff = ListenerDiff::default();

        for &port in ports {
            if self.active.contains_key(&port) {
                continue;
            }

            let scope = match previous.remove(&port) {
                Some(scope) => scope,
                None => {
                    diff.opened.push(port);
                    open(port)
                }
            };

            self.active.insert(port, scope);
        }

        for (port, scope) in previous {
            scope.cancel();
            diff.closed.push(port);
        }

        diff.closed.sort_unstable();
        diff
    }

    /// Cancels every listener.
    pub fn close_all(&mut self) {
        for (_, scope) in self.active.drain() {
            scope.cancel();
        }
    }
}

/// The local addresses mirrored listeners actually bound, by family and remote port. These
/// differ from the remote port when it was taken locally and a fallback port was used.
#[derive(Clone, Default)]
pub(crate) struct BoundPorts {
    inner: Arc<Mutex<BTreeMap<(Family, u16), SocketAddr>>>,
}

impl BoundPorts {
    pub fn insert(&self, family: Family, port: u16, address: SocketAddr) {
        lock(&self.inner).insert((family, port), address);
    }

    /// Removes the entry for `port`, unless another listener has replaced it since.
    pub fn remove(&self, family: Family, port: u16, address: SocketAddr) {
        let mut inner = lock(&self.inner);
        if inner.get(&(family, port)) == Some(&address) {
            inner.remove(&(family, port));
        }
    }

    pub fn get(&self, family: Family, port: u16) -> Option<SocketAddr> {
        lock(&self.inner).get(&(family, port)).copied()
    }

    pub fn snapshot(&self) -> Vec<((Family, u16), SocketAddr)> {
        lock(&self.inner).iter().map(|(key, address)| (*key, *address)).collect()
    }
}

/// Where a mirrored listener binds, and which remote port it stands in for.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ListenTarget {
    pub peer: PeerId,
    pub listen_ip: IpAddr,
    pub family: Family,
    pub port: u16,
}

/// Binds a listener for `target` and tunnels every connection it accepts to the peer, until
/// `scope` is cancelled.
pub(crate) async fn run_port_listener<T: Transport>(shared: Arc<Shared<T>>, target: ListenTarget, scope: CancelScope, bound: BoundPorts) {
    let ListenTarget { peer, listen_ip, family, port } = target;

    let bind = bind_with_fallback(family, listen_ip, port, shared.config.bind_retries);
    let mut listener = tokio::select! {
        biased;
        _ = scope.cancelled() => return,
        result = bind => match result {
            Ok(listener) => listener,
            Err(error) => {
                error!(%peer, %family, port, "Failed to listen for peer's port: {error}");
                return;
            }
        },
    };

    let local_addr = match listener.local_addr() {
        Ok(address) => address,
        Err(error) => {
            error!(%peer, %family, port, "Failed to get listener address: {error}");
            return;
        }
    };

    bound.insert(family, port, local_addr);
    info!(%peer, %family, port, addr = %local_addr, "Listening on {local_addr} for peer's port {port}");

    let header = DialHeader::new(family, port);
    loop {
        let accepted = tokio::select! {
            biased;
            _ = scope.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (connection, from) = match accepted {
            Ok(accepted) => accepted,
            Err(_) if scope.is_cancelled() => break,
            Err(error) => {
                warn!(%peer, %family, addr = %local_addr, "Error accepting new incoming connection: {error}");
                continue;
            }
        };

        info!(%peer, %family, port, "Incoming connection from {from}, tunneling to peer");
        tokio::spawn(tunnel_connection(Arc::clone(&shared), peer, header, connection, from, scope.clone()));
    }

    drop(listener);
    bound.remove(family, port, local_addr);
    info!(%peer, %family, port, addr = %local_addr, "Closed listener");
}

async fn tunnel_connection<T: Transport>(
    shared: Arc<Shared<T>>,
    peer: PeerId,
    header: DialHeader,
    connection: Box<dyn LocalStream>,
    from: SocketAddr,
    scope: CancelScope,
) {
    let open = open_dial_stream(&shared.transport, peer, header);
    let stream = tokio::select! {
        biased;
        _ = scope.cancelled() => return,
        result = open => match result {
            Ok(stream) => stream,
            Err(error) => {
                warn!(%peer, family = %header.family, port = header.port, "Failed to open tunnel for {from}: {error}");
                return;
            }
        },
    };

    let outcome = pipe_both_and_close(&scope, connection, stream).await;
    info!(
        %peer, family = %header.family, port = header.port,
        "Tunnel from {from} ended after {} sent and {} received",
        outcome.a_to_b, outcome.b_to_a,
    );
}
