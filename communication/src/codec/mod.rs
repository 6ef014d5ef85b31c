//! Wire format for operation messages.
//!
//! A message occupies one or more buffers. The first buffer starts with a [`MessageHeader`]:
//!
//! ```text
//! source(i32) | flags(i32) | destination(i32) | number_of_messages(i32)
//! ```
//!
//! followed by `number_of_messages` items, each laid out as
//!
//! ```text
//! length(i32) [ | key_length(i32) ] | key bytes | value bytes
//! ```
//!
//! The key length is present only for keyed edges whose key type has no fixed width, and the
//! length is absent when the edge's schema fixes it. All integers are big-endian. An item
//! header is never split across buffers; item bodies may span any number of buffers.

pub mod value;
pub mod packer;
pub mod serializer;
pub mod deserializer;

use std::io;

use byteorder::{ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use weft_bytes::buffer::DataBuffer;

pub use self::packer::{BincodeCodec, MessageType, ObjectBuilder, ObjectCodec, PackError};
pub use self::value::Value;

/// The byte order for headers and numeric values.
type ByteOrder = byteorder::BigEndian;

/// Flags carried in the message header.
pub mod flags {
    /// Sent by a source into its local partial stage.
    pub const ORIGIN_SENDER: i32 = 1 << 0;
    /// Sent by a partial stage towards a final receiver.
    pub const ORIGIN_PARTIAL: i32 = 1 << 1;
    /// End of stream from the header's source, with no payload.
    pub const SYNC_EMPTY: i32 = 1 << 2;
    /// End of stream from the header's source, carrying barrier bytes.
    pub const SYNC_BARRIER: i32 = 1 << 3;

    /// True if `flags` marks an end of stream.
    #[inline]
    pub fn is_sync(flags: i32) -> bool {
        flags & (SYNC_EMPTY | SYNC_BARRIER) != 0
    }
}

/// Framing data at the start of each message.
///
/// Serialized as four big-endian `i32`s in field order; `try_read` and `write_to` must agree on it.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct MessageHeader {
    /// task sending the message.
    pub source: i32,
    /// bitwise or of [`flags`].
    pub flags: i32,
    /// task receiving the message.
    pub destination: i32,
    /// number of items following the header.
    pub number_of_messages: i32,
}

impl MessageHeader {

    /// The number of `i32` fields in [MessageHeader].
    const FIELDS: usize = 4;

    /// The number of bytes the header occupies.
    pub const SIZE: usize = std::mem::size_of::<i32>() * Self::FIELDS;

    /// Returns a header when there is enough supporting data.
    #[inline]
    pub fn try_read(bytes: &[u8]) -> Option<MessageHeader> {
        let mut cursor = io::Cursor::new(bytes);
        let mut buffer = [0; Self::FIELDS];
        cursor.read_i32_into::<ByteOrder>(&mut buffer).ok()?;
        Some(MessageHeader {
            source: buffer[0],
            flags: buffer[1],
            destination: buffer[2],
            number_of_messages: buffer[3],
        })
    }

    /// Writes the header as binary data.
    #[inline]
    pub fn write_to<W: ::std::io::Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut buffer = [0u8; Self::SIZE];
        let mut cursor = io::Cursor::new(&mut buffer[..]);
        cursor.write_i32::<ByteOrder>(self.source)?;
        cursor.write_i32::<ByteOrder>(self.flags)?;
        cursor.write_i32::<ByteOrder>(self.destination)?;
        cursor.write_i32::<ByteOrder>(self.number_of_messages)?;
        writer.write_all(&buffer[..])
    }

    /// Appends the header to `buffer`, returning false if it does not fit.
    pub fn write_to_buffer(&self, buffer: &mut DataBuffer) -> bool {
        if buffer.remaining() < Self::SIZE { return false; }
        let mut bytes = [0u8; Self::SIZE];
        // Writes into a fixed array of the right size cannot fail.
        if self.write_to(&mut &mut bytes[..]).is_err() { return false; }
        buffer.extend_from_slice(&bytes) == Self::SIZE
    }
}

/// Hints that let the writer omit length headers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageSchema {
    /// Every item body (key and value) has exactly this many bytes.
    pub fixed_length: Option<usize>,
    /// Every key has exactly this many bytes.
    pub key_length: Option<usize>,
}

impl MessageSchema {
    /// A schema with no hints; every length is written.
    pub fn variable() -> Self { Self::default() }
    /// A schema fixing the length of every item body.
    pub fn fixed(length: usize) -> Self { MessageSchema { fixed_length: Some(length), key_length: None } }
}

/// The item layout used for a message, derived from the edge and the message's flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Layout {
    pub key_type: Option<MessageType>,
    pub data_type: MessageType,
    pub schema: MessageSchema,
}

impl Layout {
    /// Barrier payloads are raw bytes whatever the edge carries.
    pub fn for_flags(&self, flags: i32) -> Layout {
        if flags & flags::SYNC_BARRIER != 0 {
            Layout { key_type: None, data_type: MessageType::ByteArray, schema: MessageSchema::variable() }
        }
        else {
            *self
        }
    }

    pub fn length_present(&self) -> bool {
        self.schema.fixed_length.is_none()
    }

    pub fn key_header_present(&self) -> bool {
        match self.key_type {
            Some(key_type) => key_type.is_header_required() && self.schema.key_length.is_none(),
            None => false,
        }
    }

    /// Bytes of item header before the body.
    pub fn item_header_size(&self) -> usize {
        let mut size = 0;
        if self.length_present() { size += 4; }
        if self.key_header_present() { size += 4; }
        size
    }

    /// The key width a reader can know without a header.
    pub fn implied_key_length(&self) -> Option<usize> {
        self.schema.key_length.or_else(|| self.key_type.and_then(|k| k.fixed_size()))
    }
}
