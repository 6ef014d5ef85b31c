//! Non-blocking TCP transport moving buffers between workers.
//!
//! Every byte crossing a socket belongs to a frame:
//!
//! ```text
//! edge(u32) | length(u32) | payload
//! ```
//!
//! Frames of different edges interleave on one socket. An outbound connection first writes a
//! handshake naming its worker, so the accepting side can attribute the socket.

pub mod tcp;
pub mod progress;

use std::io;

use byteorder::{ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use weft_bytes::buffer::DataBuffer;

pub use self::progress::Progress;

/// Leads every handshake; an accepted socket opening with anything else is dropped.
pub(crate) const HANDSHAKE_MAGIC: u64 = 0x7765_6674_0001_0001;

/// Bytes in the handshake: magic, then worker index.
pub(crate) const HANDSHAKE_SIZE: usize = 16;

/// The byte order for frame headers and the handshake.
type ByteOrder = byteorder::BigEndian;

/// Identifies a connection within one [`Progress`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub usize);

/// Identifies a send or receive request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// The life of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No socket, or the socket was closed.
    Disconnected,
    /// Connect in flight, or handshake not yet exchanged.
    Connecting,
    /// Ready for sends and receives.
    Connected,
    /// Failed; the socket is gone.
    Error,
}

/// Why a connection failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// A deliberate connect did not succeed.
    ConnectionError,
    /// Reading or writing failed.
    IoError,
    /// The peer sent bytes that are not a valid frame or handshake.
    FramingError,
}

/// A buffer travelling through a connection.
#[derive(Debug)]
pub struct TcpMessage {
    /// The request that introduced the buffer.
    pub id: RequestId,
    /// Edge of the frame.
    pub edge: u32,
    /// The bytes.
    pub buffer: DataBuffer,
}

/// Receives the outcomes of transport work.
///
/// Callbacks run inside [`Progress::progress`], after the I/O of that call. Buffers of completed
/// or abandoned requests are handed back through them.
pub trait ChannelHandler {
    /// A connection completed its handshake with `peer`.
    fn on_connect(&mut self, connection: ConnectionId, peer: usize);
    /// A connection failed; `abandoned` holds its unfinished requests.
    fn on_error(&mut self, connection: ConnectionId, status: StatusCode, abandoned: Vec<TcpMessage>);
    /// A connection closed; `abandoned` holds its unfinished requests.
    fn on_close(&mut self, connection: ConnectionId, abandoned: Vec<TcpMessage>);
    /// A frame was fully written.
    fn on_send_complete(&mut self, connection: ConnectionId, message: TcpMessage);
    /// A frame was fully read.
    fn on_receive_complete(&mut self, connection: ConnectionId, message: TcpMessage);
}

/// Framing data ahead of each buffer: a big-endian edge id and payload length.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct FrameHeader {
    /// edge of the payload.
    pub edge: u32,
    /// number of payload bytes.
    pub length: u32,
}

impl FrameHeader {

    /// The number of bytes the header occupies.
    pub const SIZE: usize = 8;

    /// Returns a header if `bytes` holds one.
    #[inline]
    pub fn try_read(bytes: &[u8]) -> Option<FrameHeader> {
        let mut cursor = io::Cursor::new(bytes);
        let edge = cursor.read_u32::<ByteOrder>().ok()?;
        let length = cursor.read_u32::<ByteOrder>().ok()?;
        Some(FrameHeader { edge, length })
    }

    /// The header as binary data.
    #[inline]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buffer = [0u8; Self::SIZE];
        let mut cursor = io::Cursor::new(&mut buffer[..]);
        // edge then length, as `try_read` expects; eight bytes always fit.
        let _ = cursor.write_u32::<ByteOrder>(self.edge);
        let _ = cursor.write_u32::<ByteOrder>(self.length);
        buffer
    }
}

/// The handshake identifying `worker`.
pub(crate) fn handshake(worker: usize) -> [u8; HANDSHAKE_SIZE] {
    let mut buffer = [0u8; HANDSHAKE_SIZE];
    let mut cursor = io::Cursor::new(&mut buffer[..]);
    let _ = cursor.write_u64::<ByteOrder>(HANDSHAKE_MAGIC);
    let _ = cursor.write_u64::<ByteOrder>(worker as u64);
    buffer
}

/// The worker named by a handshake, or an error if the magic is wrong.
pub(crate) fn read_handshake(bytes: &[u8; HANDSHAKE_SIZE]) -> io::Result<usize> {
    let mut cursor = io::Cursor::new(&bytes[..]);
    let magic = cursor.read_u64::<ByteOrder>()?;
    if magic != HANDSHAKE_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "received incorrect weft handshake"));
    }
    let identifier = cursor.read_u64::<ByteOrder>()? as usize;
    Ok(identifier)
}
