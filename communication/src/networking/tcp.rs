//! One non-blocking TCP connection and its framing state.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use weft_bytes::buffer::DataBuffer;

use super::{handshake, read_handshake, ConnectionId, ConnectionState, FrameHeader, RequestId, TcpMessage, HANDSHAKE_SIZE};

/// Request id of buffers allocated by the connection itself in dynamic mode.
pub const UNSOLICITED: RequestId = RequestId(0);

/// Which side opened the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// We connected; the handshake is ours to write.
    Outbound,
    /// We accepted; the handshake is ours to read.
    Inbound,
}

/// Things that happened while moving bytes.
#[derive(Debug)]
pub enum Activity {
    /// The connection is usable, with the named worker on the other end.
    Connected(usize),
    /// A frame left the socket.
    Sent(TcpMessage),
    /// A frame arrived.
    Received(TcpMessage),
    /// The peer closed its end.
    Closed,
}

/// A frame being written: its header, then the buffer's valid bytes.
struct PendingWrite {
    header: [u8; FrameHeader::SIZE],
    offset: usize,
    message: TcpMessage,
}

impl PendingWrite {
    fn total(&self) -> usize { FrameHeader::SIZE + self.message.buffer.size() }
}

/// Progress through the inbound byte stream.
enum ReadState {
    /// Accumulating a frame header.
    Header { bytes: [u8; FrameHeader::SIZE], filled: usize },
    /// A header is read but no buffer is posted for its edge.
    Waiting(FrameHeader),
    /// Filling a buffer with the frame's payload.
    Body { length: usize, message: TcpMessage },
}

impl ReadState {
    fn header() -> Self { ReadState::Header { bytes: [0u8; FrameHeader::SIZE], filled: 0 } }
}

/// A connection to one peer.
pub struct Connection {
    id: ConnectionId,
    role: Role,
    address: Option<SocketAddr>,
    stream: Option<TcpStream>,
    state: ConnectionState,
    peer: Option<usize>,
    /// Failures before the connection is first established go unreported.
    best_effort: bool,
    fixed_buffers: bool,
    /// Longest frame accepted from the peer.
    max_frame: usize,
    established: bool,
    handshake_out: Vec<u8>,
    handshake_in: ([u8; HANDSHAKE_SIZE], usize),
    writes: VecDeque<PendingWrite>,
    reads: HashMap<u32, VecDeque<TcpMessage>>,
    read_state: ReadState,
}

impl Connection {

    fn with_role(id: ConnectionId, role: Role, fixed_buffers: bool, max_frame: usize) -> Self {
        Connection {
            id,
            role,
            address: None,
            stream: None,
            state: ConnectionState::Disconnected,
            peer: None,
            best_effort: false,
            fixed_buffers,
            max_frame,
            established: false,
            handshake_out: Vec::new(),
            handshake_in: ([0u8; HANDSHAKE_SIZE], 0),
            writes: VecDeque::new(),
            reads: HashMap::new(),
            read_state: ReadState::header(),
        }
    }

    /// An outbound connection to `address`, expected to reach `peer`; not yet started.
    pub fn outbound(id: ConnectionId, address: SocketAddr, peer: usize, fixed_buffers: bool, max_frame: usize, best_effort: bool) -> Self {
        let mut connection = Self::with_role(id, Role::Outbound, fixed_buffers, max_frame);
        connection.address = Some(address);
        connection.peer = Some(peer);
        connection.best_effort = best_effort;
        connection
    }

    /// A connection accepted by a listener; the peer is unknown until its handshake arrives.
    pub fn inbound(id: ConnectionId, stream: TcpStream, fixed_buffers: bool, max_frame: usize) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let mut connection = Self::with_role(id, Role::Inbound, fixed_buffers, max_frame);
        connection.address = stream.peer_addr().ok();
        connection.stream = Some(stream);
        connection.state = ConnectionState::Connecting;
        Ok(connection)
    }

    /// Begins a non-blocking connect, announcing `worker` once it completes.
    ///
    /// Any previous socket and framing state is discarded.
    pub fn start_connect(&mut self, worker: usize) -> io::Result<()> {
        let address = self.address.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address to connect to"))?;
        self.reset_stream();
        let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        match socket.connect(&SockAddr::from(address)) {
            Ok(()) => { },
            Err(error) if connect_in_progress(&error) => { },
            Err(error) => {
                self.state = ConnectionState::Disconnected;
                return Err(error);
            },
        }
        let stream: TcpStream = socket.into();
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.handshake_out = handshake(worker).to_vec();
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    /// Checks whether an outbound connect has completed.
    ///
    /// Returns the activity to report once the socket is connected.
    pub fn poll_connect(&mut self) -> io::Result<Option<Activity>> {
        if self.role != Role::Outbound || self.state != ConnectionState::Connecting {
            return Ok(None);
        }
        let Some(stream) = self.stream.as_ref() else { return Ok(None); };
        if let Some(error) = stream.take_error()? {
            return Err(error);
        }
        match stream.peer_addr() {
            Ok(_) => {
                self.state = ConnectionState::Connected;
                self.established = true;
                Ok(self.peer.map(Activity::Connected))
            },
            Err(error) if error.kind() == io::ErrorKind::NotConnected => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// The connection's identifier.
    pub fn id(&self) -> ConnectionId { self.id }
    /// Who opened the connection.
    pub fn role(&self) -> Role { self.role }
    /// The connection's state.
    pub fn state(&self) -> ConnectionState { self.state }
    /// Sets the connection's state.
    pub fn set_state(&mut self, state: ConnectionState) { self.state = state; }
    /// The worker on the other end, once known.
    pub fn peer(&self) -> Option<usize> { self.peer }
    /// True if failures before establishment are swallowed.
    pub fn is_best_effort(&self) -> bool { self.best_effort && !self.established }
    /// True if frames are queued or partly written.
    pub fn has_pending_writes(&self) -> bool { !self.writes.is_empty() || !self.handshake_out.is_empty() }

    /// Queues `message` to be written as one frame.
    pub fn enqueue_write(&mut self, message: TcpMessage) {
        let header = FrameHeader { edge: message.edge, length: message.buffer.size() as u32 }.to_bytes();
        self.writes.push_back(PendingWrite { header, offset: 0, message });
    }

    /// Posts a buffer to be filled by the next frame of its edge.
    pub fn post_read(&mut self, mut message: TcpMessage) {
        message.buffer.clear();
        message.buffer.set_connection(Some(self.id.0));
        self.reads.entry(message.edge).or_default().push_back(message);
    }

    /// Writes as much as the socket accepts. Returns true if any byte was written.
    pub fn write(&mut self, activity: &mut Vec<Activity>) -> io::Result<bool> {
        if self.state != ConnectionState::Connected { return Ok(false); }
        let Some(stream) = self.stream.as_mut() else { return Ok(false); };
        let mut wrote = false;

        while !self.handshake_out.is_empty() {
            match stream.write(&self.handshake_out) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => { self.handshake_out.drain(.. count); wrote = true; },
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(wrote),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => { },
                Err(error) => return Err(error),
            }
        }

        while let Some(pending) = self.writes.front_mut() {
            let result = if pending.offset < FrameHeader::SIZE {
                stream.write(&pending.header[pending.offset ..])
            }
            else {
                let start = pending.offset - FrameHeader::SIZE;
                stream.write(&pending.message.buffer.valid()[start ..])
            };
            match result {
                Ok(0) if pending.offset < pending.total() => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    pending.offset += count;
                    wrote = true;
                    if pending.offset == pending.total() {
                        if let Some(done) = self.writes.pop_front() {
                            activity.push(Activity::Sent(done.message));
                        }
                    }
                },
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(wrote),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => { },
                Err(error) => return Err(error),
            }
        }

        if let Err(error) = stream.flush() {
            if error.kind() != io::ErrorKind::WouldBlock { return Err(error); }
        }
        Ok(wrote)
    }

    /// Reads what the socket holds. Returns true if any byte was read.
    ///
    /// Malformed input is reported as an error of kind `InvalidData`.
    pub fn read(&mut self, activity: &mut Vec<Activity>) -> io::Result<bool> {
        let readable = match (self.role, self.state) {
            (_, ConnectionState::Connected) => true,
            (Role::Inbound, ConnectionState::Connecting) => true,
            _ => false,
        };
        if !readable { return Ok(false); }
        let Some(stream) = self.stream.as_mut() else { return Ok(false); };
        let mut read_any = false;

        // The accepting side learns its peer before any frame.
        while self.role == Role::Inbound && self.peer.is_none() {
            let (bytes, filled) = &mut self.handshake_in;
            match stream.read(&mut bytes[*filled ..]) {
                Ok(0) => { activity.push(Activity::Closed); return Ok(read_any); },
                Ok(count) => {
                    *filled += count;
                    read_any = true;
                    if *filled == HANDSHAKE_SIZE {
                        let worker = read_handshake(bytes)?;
                        self.peer = Some(worker);
                        self.state = ConnectionState::Connected;
                        self.established = true;
                        activity.push(Activity::Connected(worker));
                    }
                },
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(read_any),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => { },
                Err(error) => return Err(error),
            }
        }

        loop {
            match &mut self.read_state {
                ReadState::Header { bytes, filled } => {
                    match stream.read(&mut bytes[*filled ..]) {
                        Ok(0) => { activity.push(Activity::Closed); return Ok(read_any); },
                        Ok(count) => {
                            *filled += count;
                            read_any = true;
                            if *filled == FrameHeader::SIZE {
                                let header = FrameHeader::try_read(&bytes[..])
                                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "short frame header"))?;
                                self.read_state = ReadState::Waiting(header);
                            }
                        },
                        Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(read_any),
                        Err(error) if error.kind() == io::ErrorKind::Interrupted => { },
                        Err(error) => return Err(error),
                    }
                },
                ReadState::Waiting(header) => {
                    let header = *header;
                    let length = header.length as usize;
                    if length > self.max_frame {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("frame of {} bytes exceeds the limit of {} on edge {}", length, self.max_frame, header.edge),
                        ));
                    }
                    let posted = self.reads.get_mut(&header.edge).and_then(|queue| queue.pop_front());
                    let message = match posted {
                        Some(message) => {
                            if message.buffer.capacity() < length {
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!("frame of {} bytes for a buffer of {} on edge {}", length, message.buffer.capacity(), header.edge),
                                ));
                            }
                            message
                        },
                        None if self.fixed_buffers => return Ok(read_any),
                        None => {
                            let mut buffer = DataBuffer::new(length);
                            buffer.set_connection(Some(self.id.0));
                            TcpMessage { id: UNSOLICITED, edge: header.edge, buffer }
                        },
                    };
                    self.read_state = ReadState::Body { length, message };
                },
                ReadState::Body { length, message } => {
                    let needed = *length - message.buffer.size();
                    if needed == 0 {
                        if let ReadState::Body { message, .. } = std::mem::replace(&mut self.read_state, ReadState::header()) {
                            activity.push(Activity::Received(message));
                        }
                        continue;
                    }
                    match stream.read(&mut message.buffer.spare()[.. needed]) {
                        Ok(0) => { activity.push(Activity::Closed); return Ok(read_any); },
                        Ok(count) => { message.buffer.make_valid(count); read_any = true; },
                        Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(read_any),
                        Err(error) if error.kind() == io::ErrorKind::Interrupted => { },
                        Err(error) => return Err(error),
                    }
                },
            }
        }
    }

    /// Shuts the socket down in both directions and drops it.
    pub fn shutdown(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Drops the socket, returning every unfinished request.
    pub fn abandon(&mut self) -> Vec<TcpMessage> {
        self.shutdown();
        let mut abandoned: Vec<TcpMessage> = self.writes.drain(..).map(|pending| pending.message).collect();
        if let ReadState::Body { message, .. } = std::mem::replace(&mut self.read_state, ReadState::header()) {
            if message.id != UNSOLICITED {
                abandoned.push(message);
            }
        }
        let mut edges: Vec<u32> = self.reads.keys().copied().collect();
        edges.sort();
        for edge in edges {
            if let Some(queue) = self.reads.remove(&edge) {
                abandoned.extend(queue);
            }
        }
        self.handshake_out.clear();
        abandoned
    }

    fn reset_stream(&mut self) {
        self.shutdown();
        self.read_state = ReadState::header();
        self.handshake_in = ([0u8; HANDSHAKE_SIZE], 0);
        self.handshake_out.clear();
    }
}

#[cfg(unix)]
fn connect_in_progress(error: &io::Error) -> bool {
    error.raw_os_error() == Some(libc::EINPROGRESS) || error.kind() == io::ErrorKind::WouldBlock
}

#[cfg(not(unix))]
fn connect_in_progress(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock
}
