use std::io::{self, Error, ErrorKind};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::serialize::{ByteRead, ByteWrite, U8ReprEnum};

use super::Family;

/// A full snapshot of a peer's open ports.
///
/// Serialized as the TCP port list followed by the UDP port list, each being a big-endian
/// [`u16`] count followed by that many big-endian [`u16`] ports, with no trailing data.
/// Transmission order carries no meaning, and consumers tolerate duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortsManifest {
    pub tcp: Vec<u16>,
    pub udp: Vec<u16>,
}

impl PortsManifest {
    pub const fn new(tcp: Vec<u16>, udp: Vec<u16>) -> Self {
        Self { tcp, udp }
    }

    pub fn ports(&self, family: Family) -> &[u16] {
        match family {
            Family::Tcp => &self.tcp,
            Family::Udp => &self.udp,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tcp.is_empty() && self.udp.is_empty()
    }

    /// Serializes this manifest into a new buffer, so it can be written to many subscribers
    /// without serializing it again.
    pub async fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(4 + (self.tcp.len() + self.udp.len()) * 2);
        self.write(&mut buf).await?;
        Ok(buf)
    }
}

impl ByteWrite for PortsManifest {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        (&self.tcp, &self.udp).write(writer).await
    }
}

impl ByteRead for PortsManifest {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let (tcp, udp) = <(Vec<u16>, Vec<u16>)>::read(reader).await?;
        Ok(Self { tcp, udp })
    }
}

/// The leading byte of every stream on the ports subscription protocol.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestMode {
    /// The stream carries a [`PortsManifest`] push, answered with a [`ManifestAck`].
    Manifest = 0,

    /// The sender asks to receive manifest pushes. No payload follows.
    Subscribe = 1,
}

impl U8ReprEnum for ManifestMode {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Manifest),
            1 => Some(Self::Subscribe),
            _ => None,
        }
    }

    fn into_u8(self) -> u8 {
        self as u8
    }
}

impl ByteWrite for ManifestMode {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.into_u8().write(writer).await
    }
}

impl ByteRead for ManifestMode {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        match Self::from_u8(u8::read(reader).await?) {
            Some(mode) => Ok(mode),
            None => Err(Error::new(ErrorKind::InvalidData, "Invalid ManifestMode type byte")),
        }
    }
}

/// The single byte a subscriber writes back after processing a manifest push. Its value is
/// irrelevant, only its presence matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestAck;

impl ManifestAck {
    const BYTE: u8 = 0x01;
}

impl ByteWrite for ManifestAck {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u8(Self::BYTE).await
    }
}

impl ByteRead for ManifestAck {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        reader.read_u8().await?;
        Ok(ManifestAck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manifest_layout() {
        let manifest = PortsManifest::new(vec![8080, 22], vec![53]);
        let buf = manifest.to_bytes().await.unwrap();
        assert_eq!(buf, [0, 2, 0x1f, 0x90, 0, 22, 0, 1, 0, 53]);
    }

    #[tokio::test]
    async fn manifest_round_trip_preserves_order() {
        let tcp: Vec<u16> = (1000..1100).rev().collect();
        let udp = vec![7, 7, 65535];
        let manifest = PortsManifest::new(tcp.clone(), udp.clone());

        let buf = manifest.to_bytes().await.unwrap();
        let parsed = PortsManifest::read(&mut &buf[..]).await.unwrap();
        assert_eq!(parsed.ports(Family::Tcp), &tcp[..]);
        assert_eq!(parsed.ports(Family::Udp), &udp[..]);
    }

    #[tokio::test]
    async fn empty_manifest() {
        let buf = PortsManifest::default().to_bytes().await.unwrap();
        assert_eq!(buf, [0, 0, 0, 0]);
        assert!(PortsManifest::read(&mut &buf[..]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn truncated_manifest_fails() {
        let buf = [0u8, 1, 0x1f, 0x90, 0];
        let error = PortsManifest::read(&mut &buf[..]).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn unknown_mode_byte() {
        let buf = [7u8];
        let error = ManifestMode::read(&mut &buf[..]).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn missing_ack_is_an_error() {
        let buf: [u8; 0] = [];
        assert!(ManifestAck::read(&mut &buf[..]).await.is_err());
    }
}
