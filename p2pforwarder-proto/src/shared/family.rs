use std::{
    fmt,
    io::{self, Error, ErrorKind},
    str::FromStr,
};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::serialize::{ByteRead, ByteWrite, U8ReprEnum};

/// The transport protocol family that scopes a port number. TCP port 80 and UDP port 80 are
/// distinct resources.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    Tcp = 0,
    Udp = 1,
}

impl Family {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error returned when parsing a [`Family`] from a string that is neither `tcp` nor `udp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFamilyError(pub String);

impl fmt::Display for ParseFamilyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown network type \"{}\", it must be \"tcp\" or \"udp\"", self.0)
    }
}

impl std::error::Error for ParseFamilyError {}

impl FromStr for Family {
    type Err = ParseFamilyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else {
            Err(ParseFamilyError(s.to_string()))
        }
    }
}

impl U8ReprEnum for Family {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Tcp),
            1 => Some(Self::Udp),
            _ => None,
        }
    }

    fn into_u8(self) -> u8 {
        self as u8
    }
}

impl ByteWrite for Family {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.into_u8().write(writer).await
    }
}

impl ByteRead for Family {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        match Self::from_u8(u8::read(reader).await?) {
            Some(family) => Ok(family),
            None => Err(Error::new(ErrorKind::InvalidData, "Invalid Family type byte")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_family() {
        assert_eq!("tcp".parse::<Family>(), Ok(Family::Tcp));
        assert_eq!("UDP".parse::<Family>(), Ok(Family::Udp));
        assert_eq!("sctp".parse::<Family>(), Err(ParseFamilyError("sctp".to_string())));
    }

    #[tokio::test]
    async fn unknown_family_byte() {
        let buf = [2u8];
        let error = Family::read(&mut &buf[..]).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidData);
    }
}
