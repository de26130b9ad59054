use std::{
    env,
    io::Error,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    process::exit,
    time::Duration,
};

use args::{ArgumentsRequest, ConnectConfig, OpenConfig, StartupArguments, StartupMode};
use p2pforwarder::{logging, transport::quic::QuicTransport, Forwarder, ForwarderConfig, ForwarderError, OpenPortHandle};
use tracing::{error, info, warn};

mod args;

const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

fn main() {
    let arguments = match args::parse_arguments(env::args()) {
        Err(err) => {
            eprintln!("{err}\n\nType '{} --help' for a help menu", env!("CARGO_PKG_NAME"));
            exit(1);
        }
        Ok(arguments) => arguments,
    };

    let startup_args = match arguments {
        ArgumentsRequest::Version => {
            println!("{}", args::get_version_string());
            return;
        }
        ArgumentsRequest::Help => {
            println!("{}", args::get_help_string());
            return;
        }
        ArgumentsRequest::Run(startup_args) => startup_args,
    };

    logging::init_logging(startup_args.verbose, startup_args.silent);

    let runtime_result = tokio::runtime::Builder::new_multi_thread().enable_all().build();

    let result = match runtime_result {
        Ok(runtime) => runtime.block_on(async_main(startup_args)),
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    };

    if let Err(error) = result {
        error!("Program finished with error: {error}");
        exit(1);
    }
}

async fn async_main(startup_args: StartupArguments) -> Result<(), Error> {
    let bind_ip = match startup_args.my_ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };

    let transport = QuicTransport::bind(SocketAddr::new(bind_ip, startup_args.listen_port))?;
    let local_addr = transport.local_addr()?;
    let peer_code = transport.peer_code(SocketAddr::new(startup_args.my_ip, local_addr.port()));
    info!(%local_addr, "Peer-to-peer endpoint bound");

    let forwarder = Forwarder::new(transport, ForwarderConfig::default()).map_err(into_io_error)?;
    println!("Your peer code is: {peer_code}");

    let result = match startup_args.startup_mode {
        StartupMode::Open(open_config) => run_open(&forwarder, open_config).await,
        StartupMode::Connect(connect_config) => run_connect(&forwarder, connect_config).await,
    };

    forwarder.shutdown();
    forwarder.transport().close();
    result
}

async fn run_open(forwarder: &Forwarder<QuicTransport>, open_config: OpenConfig) -> Result<(), Error> {
    let mut handles: Vec<OpenPortHandle> = Vec::with_capacity(open_config.ports.len());
    for (family, port) in open_config.ports {
        match forwarder.open_port(family, port) {
            Ok(handle) => {
                info!(%family, port, "Exposing port");
                handles.push(handle);
            }
            Err(error) => warn!(%family, port, "Could not expose port: {error}"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    for handle in handles {
        handle.cancel();
    }

    Ok(())
}

async fn run_connect(forwarder: &Forwarder<QuicTransport>, connect_config: ConnectConfig) -> Result<(), Error> {
    let code = match connect_config.peer {
        Some(code) => code,
        None => return Err(Error::other("No peer to connect to")),
    };

    forwarder.transport().add_peer(code);

    let connection = match forwarder.connect(code.peer_id, connect_config.listen_ip).await {
        Ok(connection) => connection,
        Err(ForwarderError::AlreadyConnected(peer)) => return Err(Error::other(format!("Already connected to {peer}"))),
        Err(error) => {
            warn!(peer = %code.peer_id, "Connecting failed, retrying: {error}");
            tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            forwarder.connect(code.peer_id, connect_config.listen_ip).await.map_err(into_io_error)?
        }
    };

    println!("Connections to {}'s ports are listened on {}", connection.peer(), connection.listen_ip());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    connection.cancel();

    Ok(())
}

fn into_io_error(error: ForwarderError) -> Error {
    match error {
        ForwarderError::Io(error) => error,
        other => Error::other(other),
    }
}
