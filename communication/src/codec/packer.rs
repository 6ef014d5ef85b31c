//! Per-type packing of values into bytes.
//!
//! Each [`MessageType`] knows how to size, write, and rebuild the values of its type. Sizing
//! packs the value into a caller-provided store, so the bytes are produced once and then
//! copied out buffer by buffer.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use weft_bytes::buffer::DataBuffer;

use super::value::Value;

/// Errors from packing or unpacking a single value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PackError {
    /// The value does not have the declared type.
    #[error("expected {expected:?}, found {found}")]
    Mismatch {
        /// The declared type.
        expected: MessageType,
        /// The kind of value supplied.
        found: &'static str,
    },
    /// The bytes do not describe a value of the declared type.
    #[error("malformed {message_type:?}: {message}")]
    Malformed {
        /// The declared type.
        message_type: MessageType,
        /// What was wrong.
        message: String,
    },
}

/// Encodes and decodes values declared as `MessageType::Object`.
pub trait ObjectCodec {
    /// Appends the encoding of `value` to `out`.
    fn encode(&mut self, value: &Value, out: &mut Vec<u8>) -> Result<(), PackError>;
    /// Decodes one value from exactly `bytes`.
    fn decode(&mut self, bytes: &[u8]) -> Result<Value, PackError>;
}

/// The default object codec, using `bincode`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl ObjectCodec for BincodeCodec {
    fn encode(&mut self, value: &Value, out: &mut Vec<u8>) -> Result<(), PackError> {
        bincode::serialize_into(out, value)
            .map_err(|e| PackError::Malformed { message_type: MessageType::Object, message: e.to_string() })
    }
    fn decode(&mut self, bytes: &[u8]) -> Result<Value, PackError> {
        bincode::deserialize(bytes)
            .map_err(|e| PackError::Malformed { message_type: MessageType::Object, message: e.to_string() })
    }
}

/// The type of the values, or keys, carried by an edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// `Value::Integer`, four bytes.
    Integer,
    /// `Value::Long`, eight bytes.
    Long,
    /// `Value::Short`, two bytes.
    Short,
    /// `Value::Double`, eight bytes.
    Double,
    /// `Value::Byte`, one byte.
    Byte,
    /// `Value::String`, UTF-8.
    String,
    /// `Value::Bytes`.
    ByteArray,
    /// `Value::IntegerArray`, four bytes per element.
    IntegerArray,
    /// `Value::LongArray`, eight bytes per element.
    LongArray,
    /// `Value::DoubleArray`, eight bytes per element.
    DoubleArray,
    /// Any value, through an [`ObjectCodec`].
    Object,
}

impl MessageType {

    /// The width of one element, for types made of fixed-width elements.
    pub fn unit_size(&self) -> Option<usize> {
        match self {
            MessageType::Integer | MessageType::IntegerArray => Some(4),
            MessageType::Long | MessageType::LongArray => Some(8),
            MessageType::Double | MessageType::DoubleArray => Some(8),
            MessageType::Short => Some(2),
            MessageType::Byte | MessageType::String | MessageType::ByteArray => Some(1),
            MessageType::Object => None,
        }
    }

    /// The size of every value of the type, for scalar types.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            MessageType::Integer => Some(4),
            MessageType::Long | MessageType::Double => Some(8),
            MessageType::Short => Some(2),
            MessageType::Byte => Some(1),
            _ => None,
        }
    }

    /// True when the reader cannot know a value's length without a length header.
    pub fn is_header_required(&self) -> bool {
        self.fixed_size().is_none()
    }

    /// True when `value` may be carried as this type.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (MessageType::Integer, Value::Integer(_)) |
            (MessageType::Long, Value::Long(_)) |
            (MessageType::Short, Value::Short(_)) |
            (MessageType::Double, Value::Double(_)) |
            (MessageType::Byte, Value::Byte(_)) |
            (MessageType::String, Value::String(_)) |
            (MessageType::ByteArray, Value::Bytes(_)) |
            (MessageType::IntegerArray, Value::IntegerArray(_)) |
            (MessageType::LongArray, Value::LongArray(_)) |
            (MessageType::DoubleArray, Value::DoubleArray(_)) |
            (MessageType::Object, _)
        )
    }

    /// Packs `value` onto the end of `store`, returning the number of bytes it occupies.
    pub fn determine_length(&self, value: &Value, codec: &mut dyn ObjectCodec, store: &mut Vec<u8>) -> Result<usize, PackError> {
        let start = store.len();
        match (self, value) {
            (MessageType::Integer, Value::Integer(x)) => put(store, 4, |b| BigEndian::write_i32(b, *x)),
            (MessageType::Long, Value::Long(x)) => put(store, 8, |b| BigEndian::write_i64(b, *x)),
            (MessageType::Short, Value::Short(x)) => put(store, 2, |b| BigEndian::write_i16(b, *x)),
            (MessageType::Double, Value::Double(x)) => put(store, 8, |b| BigEndian::write_f64(b, *x)),
            (MessageType::Byte, Value::Byte(x)) => store.push(*x),
            (MessageType::String, Value::String(x)) => store.extend_from_slice(x.as_bytes()),
            (MessageType::ByteArray, Value::Bytes(x)) => store.extend_from_slice(x),
            (MessageType::IntegerArray, Value::IntegerArray(x)) => put(store, 4 * x.len(), |b| BigEndian::write_i32_into(x, b)),
            (MessageType::LongArray, Value::LongArray(x)) => put(store, 8 * x.len(), |b| BigEndian::write_i64_into(x, b)),
            (MessageType::DoubleArray, Value::DoubleArray(x)) => put(store, 8 * x.len(), |b| BigEndian::write_f64_into(x, b)),
            (MessageType::Object, value) => codec.encode(value, store)?,
            (expected, found) => return Err(PackError::Mismatch { expected: *expected, found: found.kind() }),
        }
        Ok(store.len() - start)
    }

    /// Copies up to `left_to_copy` packed bytes, starting at `already_copied`, into `buffer`.
    ///
    /// Returns the number of bytes copied, bounded by the buffer's spare capacity.
    pub fn write_data_to_buffer(&self, store: &[u8], already_copied: usize, left_to_copy: usize, buffer: &mut DataBuffer) -> usize {
        let space_left = buffer.remaining();
        let count = std::cmp::min(left_to_copy, space_left);
        buffer.extend_from_slice(&store[already_copied .. already_copied + count])
    }

    /// Feeds bytes from `source` to `builder`, materializing the value once all bytes arrived.
    ///
    /// Returns the number of bytes consumed from `source`.
    pub fn read_data_from_buffer(&self, builder: &mut ObjectBuilder, source: &[u8], codec: &mut dyn ObjectCodec) -> Result<usize, PackError> {
        let consumed = builder.append(source);
        if builder.completed_size == builder.total_size && builder.final_object.is_none() {
            let value = self.unpack_from_buffer(&builder.partial, codec)?;
            builder.partial.clear();
            builder.final_object = Some(value);
        }
        Ok(consumed)
    }

    /// Packs `value` into a fresh byte array.
    pub fn pack_to_byte_array(&self, value: &Value, codec: &mut dyn ObjectCodec) -> Result<Vec<u8>, PackError> {
        let mut bytes = Vec::new();
        self.determine_length(value, codec, &mut bytes)?;
        Ok(bytes)
    }

    /// Rebuilds a value from exactly its packed bytes.
    pub fn unpack_from_buffer(&self, bytes: &[u8], codec: &mut dyn ObjectCodec) -> Result<Value, PackError> {
        if let Some(width) = self.unit_size() {
            if bytes.len() % width != 0 {
                return Err(self.malformed(format!("{} bytes is not a multiple of {}", bytes.len(), width)));
            }
        }
        if let Some(size) = self.fixed_size() {
            if bytes.len() != size {
                return Err(self.malformed(format!("expected {} bytes, found {}", size, bytes.len())));
            }
        }
        let value = match self {
            MessageType::Integer => Value::Integer(BigEndian::read_i32(bytes)),
            MessageType::Long => Value::Long(BigEndian::read_i64(bytes)),
            MessageType::Short => Value::Short(BigEndian::read_i16(bytes)),
            MessageType::Double => Value::Double(BigEndian::read_f64(bytes)),
            MessageType::Byte => Value::Byte(bytes[0]),
            MessageType::String => {
                let text = std::str::from_utf8(bytes).map_err(|e| self.malformed(e.to_string()))?;
                Value::String(text.to_owned())
            },
            MessageType::ByteArray => Value::Bytes(bytes.to_vec()),
            MessageType::IntegerArray => {
                let mut values = vec![0i32; bytes.len() / 4];
                BigEndian::read_i32_into(bytes, &mut values);
                Value::IntegerArray(values)
            },
            MessageType::LongArray => {
                let mut values = vec![0i64; bytes.len() / 8];
                BigEndian::read_i64_into(bytes, &mut values);
                Value::LongArray(values)
            },
            MessageType::DoubleArray => {
                let mut values = vec![0f64; bytes.len() / 8];
                BigEndian::read_f64_into(bytes, &mut values);
                Value::DoubleArray(values)
            },
            MessageType::Object => codec.decode(bytes)?,
        };
        Ok(value)
    }

    fn malformed(&self, message: String) -> PackError {
        PackError::Malformed { message_type: *self, message }
    }
}

/// Appends `width` zeroed bytes to `store` and lets `write` fill them.
fn put<F: FnOnce(&mut [u8])>(store: &mut Vec<u8>, width: usize, write: F) {
    let start = store.len();
    store.resize(start + width, 0);
    write(&mut store[start ..]);
}

/// Largest reservation `ObjectBuilder::init` makes before bytes arrive.
const RESERVE_LIMIT: usize = 1 << 16;

/// Reassembles one value from bytes that may arrive in several pieces.
#[derive(Debug, Default)]
pub struct ObjectBuilder {
    total_size: usize,
    completed_size: usize,
    partial: Vec<u8>,
    final_object: Option<Value>,
}

impl ObjectBuilder {
    /// Prepares to receive a value of `total_size` bytes.
    ///
    /// At most one buffer's worth is reserved up front; the rest grows as bytes arrive.
    pub fn init(&mut self, total_size: usize) {
        self.total_size = total_size;
        self.completed_size = 0;
        self.partial.clear();
        self.partial.reserve(std::cmp::min(total_size, RESERVE_LIMIT));
        self.final_object = None;
    }

    /// Copies up to the bytes still missing from `source`, returning the count copied.
    pub fn append(&mut self, source: &[u8]) -> usize {
        let count = std::cmp::min(source.len(), self.total_size - self.completed_size);
        self.partial.extend_from_slice(&source[.. count]);
        self.completed_size += count;
        count
    }

    /// Bytes expected in total.
    pub fn total_size(&self) -> usize { self.total_size }
    /// Bytes received so far.
    pub fn completed_size(&self) -> usize { self.completed_size }
    /// True once the value has been materialized.
    pub fn is_built(&self) -> bool { self.final_object.is_some() }

    /// Takes the materialized value.
    pub fn take(&mut self) -> Option<Value> {
        self.final_object.take()
    }
}

#[cfg(test)]
mod test {

    use super::{BincodeCodec, MessageType, ObjectBuilder, PackError};
    use crate::codec::value::Value;

    fn samples() -> Vec<(MessageType, Value)> {
        vec![
            (MessageType::Integer, Value::Integer(-17)),
            (MessageType::Long, Value::Long(1 << 40)),
            (MessageType::Short, Value::Short(-3)),
            (MessageType::Double, Value::Double(2.5)),
            (MessageType::Byte, Value::Byte(200)),
            (MessageType::String, Value::from("héllo")),
            (MessageType::ByteArray, Value::Bytes(vec![1, 2, 3])),
            (MessageType::IntegerArray, Value::IntegerArray(vec![1, -2, 3])),
            (MessageType::LongArray, Value::LongArray(vec![i64::MIN, 0])),
            (MessageType::DoubleArray, Value::DoubleArray(vec![0.5, -1.0])),
            (MessageType::Object, Value::List(vec![Value::tuple("k", 3), Value::Empty])),
        ]
    }

    #[test]
    fn pack_then_unpack() {
        let mut codec = BincodeCodec;
        for (message_type, value) in samples() {
            let bytes = message_type.pack_to_byte_array(&value, &mut codec).expect("pack");
            if let Some(size) = message_type.fixed_size() {
                assert_eq!(bytes.len(), size);
            }
            let back = message_type.unpack_from_buffer(&bytes, &mut codec).expect("unpack");
            assert_eq!(back, value, "{:?}", message_type);
        }
    }

    #[test]
    fn integers_are_big_endian() {
        let bytes = MessageType::Integer.pack_to_byte_array(&Value::Integer(0x01020304), &mut BincodeCodec).expect("pack");
        assert_eq!(bytes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn mismatched_values_are_rejected() {
        let result = MessageType::Integer.pack_to_byte_array(&Value::from("text"), &mut BincodeCodec);
        assert_eq!(result, Err(PackError::Mismatch { expected: MessageType::Integer, found: "string" }));
        assert!(MessageType::Long.unpack_from_buffer(&[0; 5], &mut BincodeCodec).is_err());
    }

    #[test]
    fn builder_materializes_once_complete() {
        let mut codec = BincodeCodec;
        let bytes = MessageType::String.pack_to_byte_array(&Value::from("incremental"), &mut codec).expect("pack");
        let mut builder = ObjectBuilder::default();
        builder.init(bytes.len());
        let mut offset = 0;
        for chunk in bytes.chunks(3) {
            assert!(!builder.is_built());
            offset += MessageType::String.read_data_from_buffer(&mut builder, chunk, &mut codec).expect("read");
        }
        assert_eq!(offset, bytes.len());
        assert_eq!(builder.take(), Some(Value::from("incremental")));
    }

    #[test]
    fn builder_ignores_bytes_past_the_value() {
        let mut builder = ObjectBuilder::default();
        builder.init(4);
        let consumed = MessageType::Integer.read_data_from_buffer(&mut builder, &[0, 0, 0, 9, 42, 42], &mut BincodeCodec).expect("read");
        assert_eq!(consumed, 4);
        assert_eq!(builder.take(), Some(Value::Integer(9)));
    }

    #[test]
    fn builder_reserves_a_bounded_amount() {
        let mut builder = ObjectBuilder::default();
        builder.init(1 << 30);
        assert!(builder.partial.capacity() < 1 << 20);
        assert_eq!(builder.total_size(), 1 << 30);
    }
}
