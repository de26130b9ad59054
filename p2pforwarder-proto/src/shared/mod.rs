mod dial;
mod family;
mod manifest;

pub use dial::*;
pub use family::*;
pub use manifest::*;

/// The protocol tag for streams that carry a single forwarded connection.
pub const DIAL_PROTOCOL: &str = "/p2pforwarder/dial/1.0.0";

/// The protocol tag for streams that subscribe to, or push, ports manifests.
pub const PORTS_SUB_PROTOCOL: &str = "/p2pforwarder/portssub/1.0.0";
