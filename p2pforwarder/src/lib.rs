//! Exposes local TCP and UDP ports to remote peers, and mirrors the ports other peers expose as
//! local listeners. Every connection accepted on a mirrored listener is tunneled over a
//! peer-to-peer stream and piped into a connection dialed on the exposing peer's loopback.
//!
//! The peer-to-peer layer is abstracted behind [`transport::Transport`]. A QUIC implementation is
//! provided in [`transport::quic`], and an in-process one in [`transport::memory`].

pub mod cancel;
pub mod config;
pub mod connect;
pub mod dial;
pub mod error;
pub mod forwarder;
pub mod ip_pool;
pub mod listener;
pub mod logging;
pub mod manifest;
pub mod pipe;
pub mod registry;
pub mod transport;
pub mod udp;
pub mod utils;

pub use cancel::CancelScope;
pub use config::ForwarderConfig;
pub use connect::{Connection, ForwardedPort};
pub use error::ForwarderError;
pub use forwarder::Forwarder;
pub use p2pforwarder_proto::shared::{Family, PortsManifest};
pub use registry::OpenPortHandle;
pub use transport::{PeerId, Transport, TunnelStream};
