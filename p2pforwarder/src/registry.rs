//! The set of ports this node exposes to other peers.
//!
//! Each open port owns a [`CancelScope`], a child of the forwarder's root scope, under which
//! every tunneled connection dialed into that port runs. Closing the port cancels the scope,
//! which tears those connections down.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use p2pforwarder_proto::shared::{Family, PortsManifest};
use tokio::sync::watch;

use crate::{cancel::CancelScope, error::ForwarderError, utils::lock};

/// The open ports of both families. Every change bumps a generation counter, observable through
/// [`OpenPorts::subscribe_changes`].
pub(crate) struct OpenPorts {
    tcp: Mutex<HashMap<u16, CancelScope>>,
    udp: Mutex<HashMap<u16, CancelScope>>,
    changes: watch::Sender<u64>,
}

impl OpenPorts {
    pub fn new() -> Self {
        Self {
            tcp: Mutex::new(HashMap::new()),
            udp: Mutex::new(HashMap::new()),
            changes: watch::Sender::new(0),
        }
    }

    fn ports(&self, family: Family) -> &Mutex<HashMap<u16, CancelScope>> {
        match family {
            Family::Tcp => &self.tcp,
            Family::Udp => &self.udp,
        }
    }

    /// Marks `port` as open under a new child of `parent`. Fails if it already is.
    pub fn open(self: &Arc<Self>, parent: &CancelScope, family: Family, port: u16) -> Result<OpenPortHandle, ForwarderError> {
        let scope = {
            let mut ports = lock(self.ports(family));
            if ports.contains_key(&port) {
                return Err(ForwarderError::AlreadyOpen { family, port });
            }

            let scope = parent.child();
            ports.insert(port, scope.clone());
            scope
        };

        self.notify_changed();

        Ok(OpenPortHandle {
            registry: Arc::clone(self),
            family,
            port,
            scope,
        })
    }

    /// Returns the scope of an open port, or `None` if it isn't open.
    pub fn lookup(&self, family: Family, port: u16) -> Option<CancelScope> {
        lock(self.ports(family)).get(&port).cloned()
    }

    /// Takes a snapshot of every open port, sorted.
    pub fn manifest(&self) -> PortsManifest {
        let snapshot = |family| {
            let mut ports: Vec<u16> = lock(self.ports(family)).keys().copied().collect();
            ports.sort_unstable();
            ports
        };

        PortsManifest::new(snapshot(Family::Tcp), snapshot(Family::Udp))
    }

    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn close(&self, family: Family, port: u16, scope: &CancelScope) {
        let removed = {
            let mut ports = lock(self.ports(family));
            match ports.get(&port) {
                Some(current) if current.ptr_eq(scope) => {
                    current.cancel();
                    ports.remove(&port);
                    true
                }
                _ => false,
            }
        };

        if removed {
            self.notify_changed();
        }
    }

    fn notify_changed(&self) {
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

/// A port opened with [`crate::Forwarder::open_port`].
///
/// Dropping the handle leaves the port open. Calling [`OpenPortHandle::cancel`] closes it,
/// terminating every connection tunneled into it.
pub struct OpenPortHandle {
    registry: Arc<OpenPorts>,
    family: Family,
    port: u16,
    scope: CancelScope,
}

impl OpenPortHandle {
    pub fn family(&self) -> Family {
        self.family
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether this handle's port is still open. Turns false once cancelled, even if the same
    /// port was opened again since.
    pub fn is_open(&self) -> bool {
        !self.scope.is_cancelled()
    }

    /// Closes the port and announces the change to subscribers. Does nothing if this handle
    /// was already cancelled, and never touches a later reopening of the same port.
    pub fn cancel(&self) {
        self.registry.close(self.family, self.port, &self.scope);
    }
}

impl fmt::Debug for OpenPortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenPortHandle")
            .field("family", &self.family)
            .field("port", &self.port)
            .field("open", &self.is_open())
            .finish()
    }
}
