use std::fmt;

use super::{
    parse_family_arg, parse_ip_addr_arg, parse_peer_code_arg, parse_port_number_arg, ArgumentsRequest, ConnectConfig, FamilyErrorType,
    IpAddrErrorType, OpenConfig, PeerCodeErrorType, PortErrorType, StartupArguments, StartupMode, DEFAULT_LISTEN_PORT, DEFAULT_MY_IP,
};

#[derive(Debug, PartialEq, Eq)]
pub enum ArgumentsError {
    UnknownArgument(String),
    ListenPort(PortErrorType),
    MyIpError(IpAddrErrorType),
    Port(PortErrorType),
    Family(FamilyErrorType),
    PeerCode(PeerCodeErrorType),
    ListenIp(IpAddrErrorType),
    OpenFoundConnectArgument(String),
    ConnectFoundOpenArgument(String),
    MissingPorts,
}

impl fmt::Display for ArgumentsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownArgument(arg) => write!(f, "Unknown argument: {arg}"),
            Self::ListenPort(port_error) => port_error.fmt(f),
            Self::MyIpError(ip_error) => ip_error.fmt(f),
            Self::Port(port_error) => port_error.fmt(f),
            Self::Family(family_error) => family_error.fmt(f),
            Self::PeerCode(code_error) => code_error.fmt(f),
            Self::ListenIp(ip_error) => ip_error.fmt(f),
            Self::OpenFoundConnectArgument(arg) => {
                write!(f, "Previous arguments indicated exposing ports, but {arg} is indicating connecting to a peer")
            }
            Self::ConnectFoundOpenArgument(arg) => {
                write!(f, "Previous arguments indicated connecting to a peer, but {arg} is indicating exposing ports")
            }
            Self::MissingPorts => write!(f, "When not connecting to a peer, at least one port to expose must be specified"),
        }
    }
}

struct StartupArgumentsParser {
    verbose: bool,
    silent: bool,
    listen_port: Option<u16>,
    my_ip: Option<std::net::IpAddr>,
    startup_mode: Option<StartupMode>,
}

impl StartupArgumentsParser {
    const fn new() -> Self {
        Self {
            verbose: false,
            silent: false,
            listen_port: None,
            my_ip: None,
            startup_mode: None,
        }
    }

    fn modify_startup_mode_open<F>(&mut self, arg: String, f: F) -> Result<(), ArgumentsError>
    where
        F: FnOnce(String, &mut OpenConfig) -> Result<(), ArgumentsError>,
    {
        match &mut self.startup_mode {
            None => {
                let mut open_config = OpenConfig::new();
                f(arg, &mut open_config)?;
                self.startup_mode = Some(StartupMode::Open(open_config));
            }
            Some(StartupMode::Open(open_config)) => f(arg, open_config)?,
            Some(StartupMode::Connect(_)) => return Err(ArgumentsError::ConnectFoundOpenArgument(arg)),
        }

        Ok(())
    }

    fn modify_startup_mode_connect<F>(&mut self, arg: String, f: F) -> Result<(), ArgumentsError>
    where
        F: FnOnce(String, &mut ConnectConfig) -> Result<(), ArgumentsError>,
    {
        match &mut self.startup_mode {
            None => {
                let mut connect_config = ConnectConfig::new();
                f(arg, &mut connect_config)?;
                self.startup_mode = Some(StartupMode::Connect(connect_config));
            }
            Some(StartupMode::Connect(connect_config)) => f(arg, connect_config)?,
            Some(StartupMode::Open(_)) => return Err(ArgumentsError::OpenFoundConnectArgument(arg)),
        }

        Ok(())
    }

    fn complete(self) -> Result<StartupArguments, ArgumentsError> {
        let startup_mode = self.startup_mode.unwrap_or_else(|| StartupMode::Open(OpenConfig::new()));

        match &startup_mode {
            StartupMode::Open(open_config) if open_config.ports.is_empty() => return Err(ArgumentsError::MissingPorts),
            StartupMode::Connect(connect_config) if connect_config.peer.is_none() => {
                return Err(ArgumentsError::PeerCode(PeerCodeErrorType::UnexpectedEnd(String::from("--id"))))
            }
            _ => {}
        }

        let listen_port = self.listen_port.unwrap_or(match startup_mode.is_open() {
            true => DEFAULT_LISTEN_PORT,
            false => 0,
        });

        let my_ip = self.my_ip.unwrap_or(DEFAULT_MY_IP);
        Ok(StartupArguments::new(self.verbose, self.silent, listen_port, my_ip, startup_mode))
    }
}

fn try_parse_general_argument<F>(result: &mut StartupArgumentsParser, maybe_arg: &mut Option<String>, get_next_arg: F) -> Result<bool, ArgumentsError>
where
    F: FnOnce() -> Option<String>,
{
    let arg = match maybe_arg.take() {
        Some(s) => s,
        None => return Ok(false),
    };

    if arg.eq("-v") || arg.eq_ignore_ascii_case("--verbose") {
        result.verbose = true;
    } else if arg.eq("-s") || arg.eq_ignore_ascii_case("--silent") {
        result.silent = true;
    } else if arg.eq("-l") || arg.eq_ignore_ascii_case("--listen") {
        result.listen_port = Some(parse_port_number_arg(arg, get_next_arg()).map_err(ArgumentsError::ListenPort)?);
    } else if arg.eq_ignore_ascii_case("--my-ip") {
        result.my_ip = Some(parse_ip_addr_arg(arg, get_next_arg()).map_err(ArgumentsError::MyIpError)?);
    } else {
        *maybe_arg = Some(arg);
    }

    Ok(maybe_arg.is_none())
}

fn try_parse_open_argument<F>(result: &mut StartupArgumentsParser, maybe_arg: &mut Option<String>, get_next_arg: F) -> Result<bool, ArgumentsError>
where
    F: FnOnce() -> Option<String>,
{
    let arg = match maybe_arg.take() {
        Some(s) => s,
        None => return Ok(false),
    };

    if arg.eq("-p") || arg.eq_ignore_ascii_case("--port") {
        result.modify_startup_mode_open(arg, |arg, open_config| {
            let port = parse_port_number_arg(arg, get_next_arg()).map_err(ArgumentsError::Port)?;
            let entry = (open_config.current_family, port);
            if !open_config.ports.contains(&entry) {
                open_config.ports.push(entry);
            }
            Ok(())
        })?;
    } else if arg.eq_ignore_ascii_case("--type") {
        result.modify_startup_mode_open(arg, |arg, open_config| {
            open_config.current_family = parse_family_arg(arg, get_next_arg()).map_err(ArgumentsError::Family)?;
            Ok(())
        })?;
    } else {
        *maybe_arg = Some(arg);
    }

    Ok(maybe_arg.is_none())
}

fn try_parse_connect_argument<F>(result: &mut StartupArgumentsParser, maybe_arg: &mut Option<String>, get_next_arg: F) -> Result<bool, ArgumentsError>
where
    F: FnOnce() -> Option<String>,
{
    let arg = match maybe_arg.take() {
        Some(s) => s,
        None => return Ok(false),
    };

    if arg.eq_ignore_ascii_case("--id") {
        result.modify_startup_mode_connect(arg, |arg, connect_config| {
            connect_config.peer = Some(parse_peer_code_arg(arg, get_next_arg()).map_err(ArgumentsError::PeerCode)?);
            Ok(())
        })?;
    } else if arg.eq_ignore_ascii_case("--ip") {
        result.modify_startup_mode_connect(arg, |arg, connect_config| {
            connect_config.listen_ip = Some(parse_ip_addr_arg(arg, get_next_arg()).map_err(ArgumentsError::ListenIp)?);
            Ok(())
        })?;
    } else {
        *maybe_arg = Some(arg);
    }

    Ok(maybe_arg.is_none())
}

pub fn parse_arguments<T>(mut args: T) -> Result<ArgumentsRequest, ArgumentsError>
where
    T: Iterator<Item = String>,
{
    let mut result = StartupArgumentsParser::new();

    // Ignore the first argument, as it's by convention the name of the program
    args.next();

    while let Some(arg) = args.next() {
        if arg.is_empty() {
            continue;
        } else if arg.eq("-h") || arg.eq_ignore_ascii_case("--help") {
            return Ok(ArgumentsRequest::Help);
        } else if arg.eq("-V") || arg.eq_ignore_ascii_case("--version") {
            return Ok(ArgumentsRequest::Version);
        }

        let mut maybe_arg = Some(arg);
        let _ = !try_parse_general_argument(&mut result, &mut maybe_arg, || args.next())?
            && !try_parse_open_argument(&mut result, &mut maybe_arg, || args.next())?
            && !try_parse_connect_argument(&mut result, &mut maybe_arg, || args.next())?;

        if let Some(arg) = maybe_arg {
            return Err(ArgumentsError::UnknownArgument(arg));
        }
    }

    let result = result.complete()?;
    Ok(ArgumentsRequest::Run(result))
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use p2pforwarder::{
        transport::{PeerCode, PeerId},
        Family,
    };

    use super::{parse_arguments, ArgumentsError};
    use crate::args::{ArgumentsRequest, ConnectConfig, OpenConfig, StartupArguments, StartupMode, DEFAULT_LISTEN_PORT, DEFAULT_MY_IP};

    fn parse(args: &[&str]) -> Result<ArgumentsRequest, ArgumentsError> {
        parse_arguments(std::iter::once("p2pforwarder").chain(args.iter().copied()).map(String::from))
    }

    #[test]
    fn open_mode_with_types() {
        let request = parse(&["-p", "8080", "--type", "udp", "-p", "53", "--port", "8080", "-v"]).unwrap();

        let expected = StartupArguments::new(
            true,
            false,
            DEFAULT_LISTEN_PORT,
            DEFAULT_MY_IP,
            StartupMode::Open(OpenConfig {
                current_family: Family::Udp,
                ports: vec![(Family::Tcp, 8080), (Family::Udp, 53), (Family::Udp, 8080)],
            }),
        );
        assert_eq!(request, ArgumentsRequest::Run(expected));
    }

    #[test]
    fn connect_mode() {
        let code = PeerCode::new(PeerId::random(), SocketAddr::from((Ipv4Addr::new(10, 0, 0, 2), 12000)));
        let code_string = code.to_string();
        let request = parse(&["--id", &code_string, "--ip", "127.0.0.5", "-l", "4000"]).unwrap();

        let expected = StartupArguments::new(
            false,
            false,
            4000,
            DEFAULT_MY_IP,
            StartupMode::Connect(ConnectConfig {
                peer: Some(code),
                listen_ip: Some(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 5))),
            }),
        );
        assert_eq!(request, ArgumentsRequest::Run(expected));
    }

    #[test]
    fn connect_mode_defaults_to_random_listen_port() {
        let code = PeerCode::new(PeerId::random(), SocketAddr::from((Ipv4Addr::LOCALHOST, 12000)));
        match parse(&["--id", &code.to_string()]).unwrap() {
            ArgumentsRequest::Run(arguments) => assert_eq!(arguments.listen_port, 0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn help_and_version_win() {
        assert_eq!(parse(&["-p", "1", "--help"]), Ok(ArgumentsRequest::Help));
        assert_eq!(parse(&["-V"]), Ok(ArgumentsRequest::Version));
    }

    #[test]
    fn errors() {
        assert_eq!(parse(&[]), Err(ArgumentsError::MissingPorts));
        assert_eq!(parse(&["--bogus"]), Err(ArgumentsError::UnknownArgument(String::from("--bogus"))));
        assert!(matches!(parse(&["-p", "70000"]), Err(ArgumentsError::Port(_))));
        assert!(matches!(parse(&["--type", "sctp"]), Err(ArgumentsError::Family(_))));
        assert!(matches!(parse(&["--id", "garbage!"]), Err(ArgumentsError::PeerCode(_))));
        assert!(matches!(parse(&["--ip", "127.0.0.1"]), Err(ArgumentsError::PeerCode(_))));
        assert_eq!(
            parse(&["-p", "80", "--ip", "127.0.0.1"]),
            Err(ArgumentsError::OpenFoundConnectArgument(String::from("--ip")))
        );
    }
}
