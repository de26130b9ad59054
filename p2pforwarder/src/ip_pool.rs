//! Hands out distinct loopback addresses to subscriptions, so mirrored listeners of different
//! peers never collide on the same port.

use std::{
    fmt,
    net::Ipv4Addr,
    sync::{Arc, Mutex},
};

use crate::{error::ForwarderError, utils::lock};

/// How many addresses a pool can hand out at once: `base.0` through `base.254`.
pub const POOL_SIZE: usize = 255;

pub struct ForwardingIpPool {
    base: [u8; 3],
    slots: Arc<Mutex<[bool; POOL_SIZE]>>,
}

impl ForwardingIpPool {
    pub fn new(base: [u8; 3]) -> Self {
        Self {
            base,
            slots: Arc::new(Mutex::new([false; POOL_SIZE])),
        }
    }

    /// Takes the lowest free address. Fails with [`ForwarderError::MaxConnections`] when all
    /// are in use.
    pub fn allocate(&self) -> Result<IpLease, ForwarderError> {
        let mut slots = lock(&self.slots);
        let index = slots.iter().position(|used| !used).ok_or(ForwarderError::MaxConnections)?;
        slots[index] = true;

        let [a, b, c] = self.base;
        Ok(IpLease {
            index,
            ip: Ipv4Addr::new(a, b, c, index as u8),
            slots: Arc::clone(&self.slots),
        })
    }

    pub fn in_use(&self) -> usize {
        lock(&self.slots).iter().filter(|used| **used).count()
    }
}

/// An address taken from a [`ForwardingIpPool`], returned to it when dropped.
pub struct IpLease {
    index: usize,
    ip: Ipv4Addr,
    slots: Arc<Mutex<[bool; POOL_SIZE]>>,
}

impl IpLease {
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }
}

impl Drop for IpLease {
    fn drop(&mut self) {
        lock(&self.slots)[self.index] = false;
    }
}

impl fmt::Debug for IpLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IpLease").field(&self.ip).finish()
    }
}
