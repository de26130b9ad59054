use std::{io, net::SocketAddr};

use p2pforwarder_proto::shared::Family;
use thiserror::Error;

use crate::transport::PeerId;

#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("{family} port {port} is already open")]
    AlreadyOpen { family: Family, port: u16 },

    #[error("Unknown network type: {0}")]
    UnknownFamily(String),

    #[error("Max connections reached: no free forwarding IP address")]
    MaxConnections,

    #[error("Already connected to peer {0}")]
    AlreadyConnected(PeerId),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<p2pforwarder_proto::shared::ParseFamilyError> for ForwarderError {
    fn from(value: p2pforwarder_proto::shared::ParseFamilyError) -> Self {
        Self::UnknownFamily(value.0)
    }
}
