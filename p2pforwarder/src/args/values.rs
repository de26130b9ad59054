use std::{fmt, net::IpAddr};

use p2pforwarder::{transport::PeerCode, Family};

#[derive(Debug, PartialEq, Eq)]
pub enum IpAddrErrorType {
    UnexpectedEnd(String),
    InvalidValue(String, String),
}

impl fmt::Display for IpAddrErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEnd(arg) => write!(f, "Expected IP address after {arg}"),
            Self::InvalidValue(arg, arg2) => write!(f, "Invalid IP address after {arg}: {arg2}"),
        }
    }
}

/// Parses an IP address argument. Domain names are not accepted, as listeners and peer codes
/// need a single literal address.
pub(super) fn parse_ip_addr_arg(arg: String, maybe_arg2: Option<String>) -> Result<IpAddr, IpAddrErrorType> {
    let arg2 = match maybe_arg2 {
        Some(arg2) => arg2,
        None => return Err(IpAddrErrorType::UnexpectedEnd(arg)),
    };

    arg2.parse::<IpAddr>().map_err(|_| IpAddrErrorType::InvalidValue(arg, arg2))
}

#[derive(Debug, PartialEq, Eq)]
pub enum PortErrorType {
    UnexpectedEnd(String),
    InvalidValue(String, String),
}

impl fmt::Display for PortErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEnd(arg) => write!(f, "Expected port number after {arg}"),
            Self::InvalidValue(arg, arg2) => write!(f, "Invalid port number after {arg}: {arg2}"),
        }
    }
}

pub(super) fn parse_port_number_arg(arg: String, maybe_arg2: Option<String>) -> Result<u16, PortErrorType> {
    let arg2 = match maybe_arg2 {
        Some(arg2) => arg2,
        None => return Err(PortErrorType::UnexpectedEnd(arg)),
    };

    arg2.parse::<u16>().map_err(|_| PortErrorType::InvalidValue(arg, arg2))
}

#[derive(Debug, PartialEq, Eq)]
pub enum FamilyErrorType {
    UnexpectedEnd(String),
    InvalidValue(String, String),
}

impl fmt::Display for FamilyErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEnd(arg) => write!(f, "Expected network type after {arg}"),
            Self::InvalidValue(arg, arg2) => write!(f, "Unknown network type after {arg}: {arg2}, expected tcp or udp"),
        }
    }
}

pub(super) fn parse_family_arg(arg: String, maybe_arg2: Option<String>) -> Result<Family, FamilyErrorType> {
    let arg2 = match maybe_arg2 {
        Some(arg2) => arg2,
        None => return Err(FamilyErrorType::UnexpectedEnd(arg)),
    };

    arg2.parse::<Family>().map_err(|_| FamilyErrorType::InvalidValue(arg, arg2))
}

#[derive(Debug, PartialEq, Eq)]
pub enum PeerCodeErrorType {
    UnexpectedEnd(String),
    InvalidValue(String, String, p2pforwarder::transport::PeerCodeError),
}

impl fmt::Display for PeerCodeErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEnd(arg) => write!(f, "Expected peer code after {arg}"),
            Self::InvalidValue(arg, arg2, error) => write!(f, "Invalid peer code after {arg}: {arg2} ({error})"),
        }
    }
}

pub(super) fn parse_peer_code_arg(arg: String, maybe_arg2: Option<String>) -> Result<PeerCode, PeerCodeErrorType> {
    let arg2 = match maybe_arg2 {
        Some(arg2) => arg2,
        None => return Err(PeerCodeErrorType::UnexpectedEnd(arg)),
    };

    match arg2.parse::<PeerCode>() {
        Ok(code) => Ok(code),
        Err(error) => Err(PeerCodeErrorType::InvalidValue(arg, arg2, error)),
    }
}
