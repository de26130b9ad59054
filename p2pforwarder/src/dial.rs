//! The exposing side of a tunnel: each inbound stream on [`DIAL_PROTOCOL`] names one of our open
//! ports, and gets piped into a fresh connection to the local service on that port.

use std::{io, net::SocketAddr, sync::Arc};

use p2pforwarder_proto::{
    serialize::{ByteRead, ByteWrite},
    shared::{DialHeader, DIAL_PROTOCOL},
};
use tracing::{debug, info, warn};

use crate::{
    forwarder::Shared,
    pipe::pipe_both_and_close,
    transport::{PeerId, Transport, TunnelStream},
    utils::connect_local,
};

/// Serves one inbound stream on [`DIAL_PROTOCOL`].
///
/// A stream for a port that isn't open is reset without an error, as it only means the remote's
/// view of our ports is out of date.
pub(crate) async fn handle_dial_stream<T: Transport>(shared: Arc<Shared<T>>, peer: PeerId, mut stream: T::Stream) -> io::Result<()> {
    let DialHeader { family, port } = match DialHeader::read(&mut stream).await {
        Ok(header) => header,
        Err(error) => {
            stream.reset();
            return Err(error);
        }
    };

    let scope = match shared.open_ports.lookup(family, port) {
        Some(scope) => scope,
        None => {
            debug!(%peer, %family, port, "Dial request for a port that isn't open");
            stream.reset();
            return Ok(());
        }
    };

    let target = SocketAddr::new(shared.config.dial_target_ip, port);
    let local = match connect_local(family, shared.config.dial_source_ip, target).await {
        Ok(local) => local,
        Err(error) => {
            warn!(%peer, %family, addr = %target, "Failed to dial local service: {error}");
            stream.reset();
            return Err(error);
        }
    };

    info!(%peer, %family, port, "Dialed {target} for peer");
    let outcome = pipe_both_and_close(&scope, stream, local).await;
    info!(
        %peer, %family, port,
        "Dial ended after {} received and {} sent",
        outcome.a_to_b, outcome.b_to_a,
    );

    Ok(())
}

/// Opens a tunnel to `peer`'s `port`: a [`DIAL_PROTOCOL`] stream that has already carried the
/// dial header.
pub(crate) async fn open_dial_stream<T: Transport>(transport: &T, peer: PeerId, header: DialHeader) -> io::Result<T::Stream> {
    let mut stream = transport.open_stream(peer, DIAL_PROTOCOL).await?;
    if let Err(error) = header.write(&mut stream).await {
        stream.reset();
        return Err(error);
    }

    Ok(stream)
}
