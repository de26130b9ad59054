//! Defines the [`ByteRead`] and [`ByteWrite`] traits and implements them for the basic types
//! the protocols are built from.
//!
//! This includes [`u8`], [`u16`], `[T]` (write-only), [`Vec<T>`], small strings and pairs. All
//! integers are big-endian.
//!
//! # Serialization of lists
//! [`Vec<T>`] and slices are serialized as chunked lists, starting with an [`u16`] indicating
//! the length, followed by said amount of elements. A list of ports is therefore exactly the
//! `count, port, port, ...` layout used by ports manifests.
//!
//! # Serialization of strings
//! Protocol tags are short, so they are serialized with an [`u8`] length followed by said
//! amount of bytes, through the [`SmallReadString`] and [`SmallWriteString`] types, which wrap
//! a [`String`] and an `&str` respectively.
//!
//! # Serialization of pairs
//! [`ByteRead`] and [`ByteWrite`] are also implemented for pairs, which allows turning this:
//! ```ignore
//! thing1.write(writer).await?;
//! thing2.write(writer).await?;
//! ```
//!
//! into this:
//! ```ignore
//! (thing1, thing2).write(writer).await?;
//! ```

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

pub mod lists;
pub mod primitives;
pub mod string;
pub mod tuples;
pub mod u8_repr_enum;

pub use string::*;
pub use u8_repr_enum::*;

/// Serializes a type into bytes, writing it to an [`AsyncWrite`] asynchronously.
#[allow(async_fn_in_trait)]
pub trait ByteWrite {
    /// Serializes this instance into bytes, writing those bytes into a writer.
    ///
    /// When an error occurs, there's no guarantee on how many bytes were written.
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()>;
}

/// Deserializes a type from raw bytes, reading it from an [`AsyncRead`] asynchronously.
#[allow(async_fn_in_trait)]
pub trait ByteRead: Sized {
    /// Deserializes bytes into an instance of this type by reading bytes from a reader.
    ///
    /// When an error occurs, there's no guarantee on how many bytes were read. A reader that
    /// ends before the value is complete yields an [`io::ErrorKind::UnexpectedEof`] error.
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self>;
}
