use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

/// The first three octets of the addresses handed out for mirrored listeners.
pub const DEFAULT_FORWARDING_IP_BASE: [u8; 3] = [127, 0, 89];

/// The loopback source address dials are made from, so local services can tell tunneled
/// connections apart from regular ones.
pub const DEFAULT_DIAL_SOURCE_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 88, 89));

/// The address dial requests are delivered to.
pub const DEFAULT_DIAL_TARGET_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

pub const DEFAULT_BIND_RETRIES: usize = 4;
pub const DEFAULT_SUBSCRIPTION_QUEUE_CAPACITY: usize = 5;
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunables for a [`crate::Forwarder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderConfig {
    /// Mirrored listeners bind on `base.N` for a slot N in `0..=254`, unless the caller of
    /// `connect` supplies an address.
    pub forwarding_ip_base: [u8; 3],

    /// Source address for loopback dials. Dials fall back to an unbound socket if this address
    /// is of a different IP version than the target.
    pub dial_source_ip: IpAddr,

    /// Target address for loopback dials.
    pub dial_target_ip: IpAddr,

    /// How many random fallback ports to try when the mirrored port can't be bound.
    pub bind_retries: usize,

    /// Capacity of each subscription's incoming manifest queue.
    pub subscription_queue_capacity: usize,

    /// Maximum time a single manifest push to a subscriber may take before the subscriber is
    /// dropped.
    pub push_timeout: Duration,
}

impl ForwarderConfig {
    pub const fn new() -> Self {
        Self {
            forwarding_ip_base: DEFAULT_FORWARDING_IP_BASE,
            dial_source_ip: DEFAULT_DIAL_SOURCE_IP,
            dial_target_ip: DEFAULT_DIAL_TARGET_IP,
            bind_retries: DEFAULT_BIND_RETRIES,
            subscription_queue_capacity: DEFAULT_SUBSCRIPTION_QUEUE_CAPACITY,
            push_timeout: DEFAULT_PUSH_TIMEOUT,
        }
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self::new()
    }
}
