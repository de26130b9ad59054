use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    ops::BitXorAssign,
};

use base64::Engine;

use super::{PeerId, PEER_ID_LEN};

pub const PEER_CODE_MAX_LENGTH_BYTES: usize = PEER_ID_LEN + 17 + 2 + 2;
pub const PEER_CODE_MAX_LENGTH_CHARS: usize = (PEER_CODE_MAX_LENGTH_BYTES * 4 + 2) / 3;

/// Everything needed to reach a peer over QUIC: its id and the address its endpoint listens on.
/// Shared between users as a single base64 string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCode {
    pub peer_id: PeerId,
    pub address: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCodeError {
    InvalidBase64,
    UnexpectedEnd,
    InvalidIpTypeByte,
    BadChecksum,
    TooLong,
}

impl fmt::Display for PeerCodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBase64 => write!(f, "Peer code is not valid base64"),
            Self::UnexpectedEnd => write!(f, "Peer code is too short"),
            Self::InvalidIpTypeByte => write!(f, "Peer code has an invalid address type"),
            Self::BadChecksum => write!(f, "Peer code checksum doesn't match, was it copied correctly?"),
            Self::TooLong => write!(f, "Peer code is too long"),
        }
    }
}

impl std::error::Error for PeerCodeError {}

fn calc_checksum(buf: &[u8]) -> u16 {
    let mut ones_count = 0u8;
    let mut xored = 0x69;

    for ele in buf {
        ones_count = ones_count.wrapping_add(ele.count_ones() as u8);
        xored.bitxor_assign(*ele);
    }

    (xored as u16) | ((ones_count as u16) << 8)
}

impl PeerCode {
    pub const fn new(peer_id: PeerId, address: SocketAddr) -> Self {
        Self { peer_id, address }
    }

    pub fn serialize_to_bytes(&self, buf: &mut [u8]) -> usize {
        buf[..PEER_ID_LEN].copy_from_slice(self.peer_id.as_bytes());
        let mut index = PEER_ID_LEN;

        match self.address.ip() {
            IpAddr::V4(ipv4) => {
                buf[index] = 4;
                buf[(index + 1)..(index + 5)].copy_from_slice(&ipv4.octets());
                index += 5;
            }
            IpAddr::V6(ipv6) => {
                buf[index] = 6;
                buf[(index + 1)..(index + 17)].copy_from_slice(&ipv6.octets());
                index += 17;
            }
        }

        buf[index..(index + 2)].copy_from_slice(&self.address.port().to_le_bytes());
        index += 2;

        let checksum = calc_checksum(&buf[..index]);
        buf[index..(index + 2)].copy_from_slice(&checksum.to_le_bytes());
        index += 2;

        index
    }

    pub fn deserialize_from_bytes(buf: &[u8]) -> Result<PeerCode, PeerCodeError> {
        fn check_buf_len(buf: &[u8], min_len: usize) -> Result<(), PeerCodeError> {
            match buf.len() >= min_len {
                true => Ok(()),
                false => Err(PeerCodeError::UnexpectedEnd),
            }
        }

        check_buf_len(buf, PEER_ID_LEN + 1)?;
        let mut id_bytes = [0u8; PEER_ID_LEN];
        id_bytes.copy_from_slice(&buf[..PEER_ID_LEN]);
        let mut index = PEER_ID_LEN;

        let ip = match buf[index] {
            4 => {
                check_buf_len(buf, index + 5)?;
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&buf[(index + 1)..(index + 5)]);
                index += 5;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            6 => {
                check_buf_len(buf, index + 17)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[(index + 1)..(index + 17)]);
                index += 17;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return Err(PeerCodeError::InvalidIpTypeByte),
        };

        check_buf_len(buf, index + 2)?;
        let port = u16::from_le_bytes([buf[index], buf[index + 1]]);
        index += 2;

        check_buf_len(buf, index + 2)?;
        let checksum = u16::from_le_bytes([buf[index], buf[index + 1]]);
        if checksum != calc_checksum(&buf[..index]) {
            return Err(PeerCodeError::BadChecksum);
        }
        index += 2;

        if buf.len() != index {
            return Err(PeerCodeError::TooLong);
        }

        Ok(Self {
            peer_id: PeerId::from_bytes(id_bytes),
            address: SocketAddr::new(ip, port),
        })
    }

    pub fn deserialize_from_str(string: &str) -> Result<PeerCode, PeerCodeError> {
        let mut buf = [0u8; PEER_CODE_MAX_LENGTH_BYTES + 2];
        let buf_len = match base64::prelude::BASE64_URL_SAFE_NO_PAD.decode_slice(string, &mut buf) {
            Ok(v) => v,
            Err(base64::DecodeSliceError::OutputSliceTooSmall) => return Err(PeerCodeError::TooLong),
            Err(base64::DecodeSliceError::DecodeError(_)) => return Err(PeerCodeError::InvalidBase64),
        };

        Self::deserialize_from_bytes(&buf[..buf_len])
    }
}

impl fmt::Display for PeerCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::with_capacity(PEER_CODE_MAX_LENGTH_CHARS);
        let mut buf = [0u8; PEER_CODE_MAX_LENGTH_BYTES];
        let len = self.serialize_to_bytes(&mut buf);
        base64::prelude::BASE64_URL_SAFE_NO_PAD.encode_string(&buf[..len], &mut s);
        f.write_str(&s)
    }
}

impl std::str::FromStr for PeerCode {
    type Err = PeerCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::deserialize_from_str(s)
    }
}
