use std::{fmt, io, str::FromStr};

use base64::Engine;
use p2pforwarder_proto::serialize::{ByteRead, ByteWrite};
use tokio::io::{AsyncRead, AsyncWrite};

pub const PEER_ID_LEN: usize = 16;

/// Identifies a peer. Displayed as URL-safe base64 without padding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsePeerIdError {
    InvalidBase64,
    InvalidLength,
}

impl fmt::Display for ParsePeerIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBase64 => write!(f, "Peer id is not valid base64"),
            Self::InvalidLength => write!(f, "Peer id must be exactly {PEER_ID_LEN} bytes long"),
        }
    }
}

impl std::error::Error for ParsePeerIdError {}

impl PeerId {
    pub const fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    pub const fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::with_capacity(24);
        base64::prelude::BASE64_URL_SAFE_NO_PAD.encode_string(self.0, &mut s);
        f.write_str(&s)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl FromStr for PeerId {
    type Err = ParsePeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut buf = [0u8; PEER_ID_LEN + 3];
        let len = match base64::prelude::BASE64_URL_SAFE_NO_PAD.decode_slice(s, &mut buf) {
            Ok(len) => len,
            Err(base64::DecodeSliceError::OutputSliceTooSmall) => return Err(ParsePeerIdError::InvalidLength),
            Err(base64::DecodeSliceError::DecodeError(_)) => return Err(ParsePeerIdError::InvalidBase64),
        };

        match <[u8; PEER_ID_LEN]>::try_from(&buf[..len]) {
            Ok(bytes) => Ok(Self(bytes)),
            Err(_) => Err(ParsePeerIdError::InvalidLength),
        }
    }
}

impl ByteWrite for PeerId {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.0.write(writer).await
    }
}

impl ByteRead for PeerId {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        Ok(Self(<[u8; PEER_ID_LEN]>::read(reader).await?))
    }
}
