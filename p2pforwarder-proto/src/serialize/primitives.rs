use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ByteRead, ByteWrite};

impl ByteWrite for u8 {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u8(*self).await
    }
}

impl ByteRead for u8 {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        reader.read_u8().await
    }
}

impl ByteWrite for u16 {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u16(*self).await
    }
}

impl ByteRead for u16 {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        reader.read_u16().await
    }
}

impl<const N: usize> ByteWrite for [u8; N] {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(self).await
    }
}

impl<const N: usize> ByteRead for [u8; N] {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; N];
        reader.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

impl<T: ByteWrite + ?Sized> ByteWrite for &T {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        (**self).write(writer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn u16_is_big_endian() {
        let mut buf = Vec::new();
        8080u16.write(&mut buf).await.unwrap();
        assert_eq!(buf, [0x1f, 0x90]);

        let value = u16::read(&mut &buf[..]).await.unwrap();
        assert_eq!(value, 8080);
    }

    #[tokio::test]
    async fn short_read_is_unexpected_eof() {
        let buf = [0x1fu8];
        let error = u16::read(&mut &buf[..]).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
    }
}
