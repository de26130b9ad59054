use std::net::{IpAddr, Ipv4Addr};

use p2pforwarder::{transport::PeerCode, Family};

mod parser;
mod values;

pub use parser::*;
pub use values::*;

/// The default UDP port the QUIC endpoint binds when exposing ports.
pub const DEFAULT_LISTEN_PORT: u16 = 12000;

/// The default address advertised in our peer code.
pub const DEFAULT_MY_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Gets a small string with this program's name and version.
pub fn get_version_string() -> String {
    format!(
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"), " ({} {})"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Gets a string with this program's help documentation.
pub fn get_help_string() -> &'static str {
    concat!(
        "Usage: ",
        env!("CARGO_PKG_NAME"),
        " [options]\n",
        "\n",
        "Without --id, exposes the ports given with -p and prints a peer code. With --id, connects\n",
        "to the peer with that code and listens locally for each of the ports it exposes.\n",
        "\n",
        "General options:\n",
        "  -h, --help               Display this help menu and exit\n",
        "  -V, --version            Display the version number and exit\n",
        "  -v, --verbose            Display additional information while running\n",
        "  -s, --silent             Only display errors while running\n",
        "  -l, --listen <port>      The UDP port to run the peer-to-peer endpoint on\n",
        "                           (default: 12000 when exposing ports, random when connecting)\n",
        "  --my-ip <ip>             The address to advertise in the printed peer code (default: 127.0.0.1)\n",
        "\n",
        "Exposing ports:\n",
        "  --type <tcp|udp>         The network type of the ports that follow (default: tcp)\n",
        "  -p, --port <port>        A local port to expose, can be specified multiple times\n",
        "\n",
        "Connecting:\n",
        "  --id <peer code>         The peer code of the peer to connect to\n",
        "  --ip <ip>                The address to listen on for the peer's ports\n",
        "                           (default: a free address in 127.0.89.0/24)\n",
    )
}

/// The result of parsing the program's arguments.
#[derive(Debug, PartialEq)]
pub enum ArgumentsRequest {
    /// Print the help menu to stdout and exit.
    Help,

    /// Print this program's version to stdout and exit.
    Version,

    /// Run with the provided arguments.
    Run(StartupArguments),
}

/// Specifies the information on how the program should run.
#[derive(Debug, PartialEq)]
pub struct StartupArguments {
    /// Whether to log additional information.
    pub verbose: bool,

    /// Whether to only log errors.
    pub silent: bool,

    /// The UDP port for the peer-to-peer endpoint. 0 picks a random port.
    pub listen_port: u16,

    /// The address advertised in our peer code.
    pub my_ip: IpAddr,

    /// Whether to expose ports or connect to a peer.
    pub startup_mode: StartupMode,
}

impl StartupArguments {
    pub const fn new(verbose: bool, silent: bool, listen_port: u16, my_ip: IpAddr, startup_mode: StartupMode) -> Self {
        Self {
            verbose,
            silent,
            listen_port,
            my_ip,
            startup_mode,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum StartupMode {
    Open(OpenConfig),
    Connect(ConnectConfig),
}

impl StartupMode {
    pub fn is_open(&self) -> bool {
        matches!(self, StartupMode::Open(_))
    }
}

/// Specifies configuration when exposing ports.
#[derive(Debug, PartialEq)]
pub struct OpenConfig {
    /// The network type applied to ports given from now on.
    pub current_family: Family,

    /// The ports to expose.
    pub ports: Vec<(Family, u16)>,
}

impl OpenConfig {
    pub const fn new() -> Self {
        Self {
            current_family: Family::Tcp,
            ports: Vec::new(),
        }
    }
}

/// Specifies configuration when connecting to a peer.
#[derive(Debug, PartialEq)]
pub struct ConnectConfig {
    /// The peer to connect to. Always `Some` once parsing completes.
    pub peer: Option<PeerCode>,

    /// The address to listen on, or `None` to take one from the forwarding pool.
    pub listen_ip: Option<IpAddr>,
}

impl ConnectConfig {
    pub const fn new() -> Self {
        Self { peer: None, listen_ip: None }
    }
}
