//! Wire formats for the p2pforwarder tunneling protocols.
//!
//! Two protocols run over peer-to-peer streams:
//! - The ports subscription protocol ([`shared::PORTS_SUB_PROTOCOL`]), which lets a peer
//!   subscribe to another peer's set of open ports and receive [`shared::PortsManifest`]
//!   pushes whenever that set changes.
//! - The dial protocol ([`shared::DIAL_PROTOCOL`]), which opens a tunnel for a single
//!   forwarded connection, starting with a [`shared::DialHeader`].
//!
//! All the types are serialized through the [`serialize::ByteRead`] and
//! [`serialize::ByteWrite`] traits.

pub mod serialize;
pub mod shared;
