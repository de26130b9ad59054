use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::serialize::{ByteRead, ByteWrite};

use super::Family;

/// The first bytes of every dial stream, indicating which of the remote's open ports the
/// forwarded connection is for.
///
/// Serialized as one family byte followed by the port as a big-endian [`u16`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DialHeader {
    pub family: Family,
    pub port: u16,
}

impl DialHeader {
    pub const fn new(family: Family, port: u16) -> Self {
        Self { family, port }
    }
}

impl ByteWrite for DialHeader {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        (self.family, self.port).write(writer).await
    }
}

impl ByteRead for DialHeader {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let (family, port) = <(Family, u16)>::read(reader).await?;
        Ok(Self { family, port })
    }
}
