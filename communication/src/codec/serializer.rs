//! Incremental serialization of messages into pool buffers.

use weft_bytes::buffer::DataBuffer;
use weft_bytes::pool::BufferPool;

use crate::error::CommError;

use super::{flags, Layout, MessageHeader, ObjectCodec, PackError, Value};

/// Progress through one item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SerializePart {
    /// Nothing written; the item has not been sized.
    Init,
    /// Sized and packed; the item header is not yet written.
    Header,
    /// Item header written; `bytes_copied` of the body are written.
    Body,
    /// Every byte written.
    Done,
}

/// Progress of the item currently being written.
#[derive(Debug)]
pub struct SerializeState {
    part: SerializePart,
    bytes_copied: usize,
    total: usize,
    key_length: usize,
    /// Packed key and value bytes, produced once while sizing the item.
    store: Vec<u8>,
}

impl Default for SerializeState {
    fn default() -> Self {
        SerializeState { part: SerializePart::Init, bytes_copied: 0, total: 0, key_length: 0, store: Vec::new() }
    }
}

impl SerializeState {
    /// The current phase.
    pub fn part(&self) -> SerializePart { self.part }
    /// Body bytes written so far.
    pub fn bytes_copied(&self) -> usize { self.bytes_copied }
    /// Total body bytes of the item.
    pub fn total(&self) -> usize { self.total }

    /// Returns to `Init`, keeping the scratch allocation.
    pub fn reset(&mut self) {
        self.part = SerializePart::Init;
        self.bytes_copied = 0;
        self.total = 0;
        self.key_length = 0;
        self.store.clear();
    }
}

/// Where an outbound message is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendState {
    /// Queued; nothing delivered or written.
    Init,
    /// Every buffer written; waiting to be handed to the transport.
    Serialized,
}

/// An outbound message and the state of its serialization.
#[derive(Debug)]
pub struct OutMessage {
    /// Task that sent the message.
    pub source: i32,
    /// Task the message is for.
    pub target: i32,
    /// Header flags.
    pub flags: i32,
    /// Items carried; a single barrier item for `SYNC_BARRIER`, none for `SYNC_EMPTY`.
    pub payload: Vec<Value>,
    send_state: SendState,
    state: SerializeState,
    header_written: bool,
    item: usize,
    current: Option<DataBuffer>,
    buffers: Vec<DataBuffer>,
}

impl OutMessage {
    /// A new message, not yet serialized.
    pub fn new(source: i32, target: i32, flags: i32, payload: Vec<Value>) -> Self {
        OutMessage {
            source,
            target,
            flags,
            payload,
            send_state: SendState::Init,
            state: SerializeState::default(),
            header_written: false,
            item: 0,
            current: None,
            buffers: Vec::new(),
        }
    }

    /// The message's state.
    pub fn send_state(&self) -> SendState { self.send_state }

    /// The header describing this message.
    pub fn header(&self) -> MessageHeader {
        let count = if self.flags & flags::SYNC_EMPTY != 0 { 0 } else { self.payload.len() };
        MessageHeader {
            source: self.source,
            flags: self.flags,
            destination: self.target,
            number_of_messages: count as i32,
        }
    }

    /// Removes the serialized buffers, once `send_state` is `Serialized`.
    pub fn take_buffers(&mut self) -> Vec<DataBuffer> {
        std::mem::take(&mut self.buffers)
    }

    /// Puts back buffers the transport refused.
    pub fn restore_buffers(&mut self, buffers: Vec<DataBuffer>) {
        self.buffers = buffers;
    }

    /// Returns every held buffer to `pool`, abandoning serialization.
    pub fn release_into(&mut self, pool: &mut BufferPool) {
        for buffer in self.buffers.drain(..).chain(self.current.take()) {
            pool.release(buffer);
        }
        self.state.reset();
        self.item = 0;
        self.header_written = false;
        self.send_state = SendState::Init;
    }
}

/// Writes messages of one edge into buffers.
///
/// Holds the edge's item layout and its object codec; per-message progress lives in the
/// [`OutMessage`], so one serializer serves any number of interleaved messages.
pub struct MessageSerializer {
    edge: u32,
    layout: Layout,
    codec: Box<dyn ObjectCodec>,
}

impl MessageSerializer {
    pub(crate) fn new(edge: u32, layout: Layout, codec: Box<dyn ObjectCodec>) -> Self {
        MessageSerializer { edge, layout, codec }
    }

    /// Continues writing `message`, taking buffers from `pool` as needed.
    ///
    /// Returns `Ok(true)` once every byte is in a buffer, and `Ok(false)` if the pool ran dry
    /// first. In that case the partial buffers go back to the pool and the call can be repeated
    /// once the transport has released buffers; a message needs at most the pool's count.
    pub fn build(&mut self, message: &mut OutMessage, pool: &mut BufferPool) -> Result<bool, CommError> {

        if message.send_state == SendState::Serialized {
            return Ok(true);
        }

        let layout = self.layout.for_flags(message.flags);
        let header = message.header();
        let count = header.number_of_messages as usize;

        loop {

            let fresh = message.current.is_none();
            if fresh {
                let Some(mut buffer) = pool.acquire() else {
                    // Holding some buffers while waiting for more could starve other messages
                    // of the same pool; start over once buffers return.
                    message.release_into(pool);
                    return Ok(false);
                };
                if !message.header_written {
                    if !header.write_to_buffer(&mut buffer) {
                        pool.release(buffer);
                        return Err(CommError::framing(self.edge, "buffer cannot hold a message header"));
                    }
                    message.header_written = true;
                }
                message.current = Some(buffer);
            }

            if message.item == count {
                if let Some(buffer) = message.current.take() {
                    message.buffers.push(buffer);
                }
                message.send_state = SendState::Serialized;
                return Ok(true);
            }

            let Some(buffer) = message.current.as_mut() else { return Ok(false); };
            let before = buffer.size();
            let value = &message.payload[message.item];
            let done = Self::serialize_item(&mut *self.codec, &layout, value, &mut message.state, buffer)
                .map_err(|e| CommError::framing(self.edge, e.to_string()))?;

            if done {
                message.item += 1;
            }
            else {
                if fresh && buffer.size() == before {
                    return Err(CommError::framing(self.edge, "buffer too small for an item header"));
                }
                if let Some(buffer) = message.current.take() {
                    message.buffers.push(buffer);
                }
            }
        }
    }

    /// Writes as much of one item as fits in `buffer`; true once the item is complete.
    fn serialize_item(
        codec: &mut dyn ObjectCodec,
        layout: &Layout,
        value: &Value,
        state: &mut SerializeState,
        buffer: &mut DataBuffer) -> Result<bool, PackError>
    {
        if state.part == SerializePart::Init || state.part == SerializePart::Done {
            state.reset();
            match layout.key_type {
                Some(key_type) => {
                    let (key, data) = value.as_pair()
                        .ok_or(PackError::Mismatch { expected: layout.data_type, found: value.kind() })?;
                    state.key_length = key_type.determine_length(key, codec, &mut state.store)?;
                    layout.data_type.determine_length(data, codec, &mut state.store)?;
                },
                None => {
                    layout.data_type.determine_length(value, codec, &mut state.store)?;
                },
            }
            state.total = state.store.len();
            check_schema(layout, state.total, state.key_length)?;
            state.part = SerializePart::Header;
        }

        if state.part == SerializePart::Header {
            if buffer.remaining() < layout.item_header_size() {
                return Ok(false);
            }
            if layout.length_present() {
                buffer.put_i32(state.total as i32);
            }
            if layout.key_header_present() {
                buffer.put_i32(state.key_length as i32);
            }
            state.part = SerializePart::Body;
        }

        let left_to_copy = state.total - state.bytes_copied;
        let copied = layout.data_type.write_data_to_buffer(&state.store, state.bytes_copied, left_to_copy, buffer);
        state.bytes_copied += copied;
        if state.bytes_copied == state.total {
            state.part = SerializePart::Done;
            Ok(true)
        }
        else {
            Ok(false)
        }
    }
}

/// Confirms that item sizes agree with the lengths the schema promises readers.
fn check_schema(layout: &Layout, total: usize, key_length: usize) -> Result<(), PackError> {
    if let Some(fixed) = layout.schema.fixed_length {
        if fixed != total {
            return Err(PackError::Malformed {
                message_type: layout.data_type,
                message: format!("item of {} bytes on an edge fixed at {}", total, fixed),
            });
        }
    }
    if layout.key_type.is_some() {
        if let Some(implied) = layout.implied_key_length() {
            if implied != key_length {
                return Err(PackError::Malformed {
                    message_type: layout.data_type,
                    message: format!("key of {} bytes where {} are expected", key_length, implied),
                });
            }
        }
    }
    Ok(())
}
