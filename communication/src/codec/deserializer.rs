//! Incremental reassembly of messages from received buffers.

use std::collections::VecDeque;

use crate::error::CommError;

use super::{Layout, MessageHeader, ObjectBuilder, ObjectCodec, PackError, Value};

/// Where an inbound message is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceivedState {
    /// Expecting an item header.
    Header,
    /// Item header read; reading key and value bytes.
    Building,
    /// Every item read.
    Built,
}

/// An inbound message being reassembled.
#[derive(Debug)]
pub struct InMessage {
    /// The message header.
    pub header: MessageHeader,
    /// Items completed so far.
    pub items: Vec<Value>,
    state: ReceivedState,
    key: ObjectBuilder,
    data: ObjectBuilder,
    reading_key: bool,
}

impl InMessage {
    fn new(header: MessageHeader) -> Self {
        let state = if header.number_of_messages == 0 { ReceivedState::Built } else { ReceivedState::Header };
        InMessage {
            header,
            // the count is untrusted until the items arrive.
            items: Vec::with_capacity(std::cmp::min(header.number_of_messages as usize, 1024)),
            state,
            key: ObjectBuilder::default(),
            data: ObjectBuilder::default(),
            reading_key: false,
        }
    }

    /// The message's state.
    pub fn state(&self) -> ReceivedState { self.state }
}

/// Reads the messages of one edge arriving from one peer.
///
/// Buffers must be supplied in the order the peer sent them. Each message begins in a fresh
/// buffer, and item headers never straddle buffers. An item announcing more than `max_item`
/// bytes is a framing error.
pub struct MessageDeserializer {
    edge: u32,
    layout: Layout,
    max_item: usize,
    codec: Box<dyn ObjectCodec>,
    current: Option<InMessage>,
}

impl MessageDeserializer {
    pub(crate) fn new(edge: u32, layout: Layout, max_item: usize, codec: Box<dyn ObjectCodec>) -> Self {
        MessageDeserializer { edge, layout, max_item, codec, current: None }
    }

    /// True if a message has been started and not finished.
    pub fn in_progress(&self) -> bool {
        self.current.is_some()
    }

    /// Abandons any partially read message.
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Consumes the valid bytes of one buffer, appending finished messages to `completed`.
    pub fn add_buffer(&mut self, bytes: &[u8], completed: &mut VecDeque<InMessage>) -> Result<(), CommError> {

        let mut offset = 0;
        if self.current.is_none() {
            let header = MessageHeader::try_read(bytes)
                .ok_or_else(|| CommError::framing(self.edge, format!("{} bytes cannot hold a header", bytes.len())))?;
            if header.number_of_messages < 0 {
                return Err(CommError::framing(self.edge, format!("negative item count {}", header.number_of_messages)));
            }
            offset = MessageHeader::SIZE;
            self.current = Some(InMessage::new(header));
        }

        let edge = self.edge;
        let Some(message) = self.current.as_mut() else { return Ok(()); };
        let layout = self.layout.for_flags(message.header.flags);
        let expected = message.header.number_of_messages as usize;

        while message.state != ReceivedState::Built {

            if message.state == ReceivedState::Header {
                let remaining = bytes.len() - offset;
                let needed = layout.item_header_size();
                if remaining == 0 {
                    break;
                }
                if remaining < needed {
                    return Err(CommError::framing(edge, "item header split across buffers"));
                }
                let length = match layout.schema.fixed_length {
                    Some(length) => length,
                    None => read_length(edge, bytes, &mut offset)?,
                };
                let key_length = if layout.key_type.is_none() {
                    0
                }
                else if layout.key_header_present() {
                    read_length(edge, bytes, &mut offset)?
                }
                else {
                    layout.implied_key_length().unwrap_or(0)
                };
                if length > self.max_item {
                    return Err(CommError::framing(edge, format!("item of {} bytes exceeds the limit of {}", length, self.max_item)));
                }
                if key_length > length {
                    return Err(CommError::framing(edge, format!("key of {} bytes in an item of {}", key_length, length)));
                }
                message.reading_key = layout.key_type.is_some();
                message.key.init(key_length);
                message.data.init(length - key_length);
                message.state = ReceivedState::Building;
            }

            let framing = |e: PackError| CommError::framing(edge, e.to_string());

            if message.reading_key {
                if let Some(key_type) = layout.key_type {
                    offset += key_type.read_data_from_buffer(&mut message.key, &bytes[offset..], &mut *self.codec).map_err(framing)?;
                }
                if !message.key.is_built() { break; }
                message.reading_key = false;
            }

            offset += layout.data_type.read_data_from_buffer(&mut message.data, &bytes[offset..], &mut *self.codec).map_err(framing)?;
            let Some(data) = message.data.take() else { break; };
            let item = match message.key.take() {
                Some(key) => Value::Tuple(Box::new(key), Box::new(data)),
                None => data,
            };
            message.items.push(item);
            message.state = if message.items.len() == expected { ReceivedState::Built } else { ReceivedState::Header };
        }

        if message.state == ReceivedState::Built {
            if offset < bytes.len() {
                return Err(CommError::framing(edge, format!("{} bytes follow a complete message", bytes.len() - offset)));
            }
            if let Some(message) = self.current.take() {
                completed.push_back(message);
            }
        }

        Ok(())
    }
}

fn read_length(edge: u32, bytes: &[u8], offset: &mut usize) -> Result<usize, CommError> {
    use byteorder::ByteOrder;
    let value = byteorder::BigEndian::read_i32(&bytes[*offset .. *offset + 4]);
    *offset += 4;
    usize::try_from(value).map_err(|_| CommError::framing(edge, format!("negative length {}", value)))
}
