//! Drives every connection of one worker.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::time::{Duration, Instant};

use weft_bytes::buffer::DataBuffer;

use crate::logging::{CommunicationLogger, ConnectionEvent, MessageEvent, StateEvent};

use super::tcp::{Activity, Connection};
use super::{ChannelHandler, ConnectionId, ConnectionState, RequestId, StatusCode, TcpMessage};

/// Outcomes waiting to be handed to a [`ChannelHandler`].
enum Event {
    Connect(ConnectionId, usize),
    Error(ConnectionId, StatusCode, Vec<TcpMessage>),
    Close(ConnectionId, Vec<TcpMessage>),
    SendComplete(ConnectionId, TcpMessage),
    ReceiveComplete(ConnectionId, TcpMessage),
}

/// The transport of one worker: a listener and its connections.
///
/// Nothing blocks. Each call to [`progress`](Progress::progress) accepts pending connections,
/// completes pending connects, and moves whatever bytes the sockets accept, then reports the
/// outcomes to the supplied handler.
pub struct Progress {
    worker: usize,
    fixed_buffers: bool,
    max_frame: usize,
    listener: Option<TcpListener>,
    connections: BTreeMap<ConnectionId, Connection>,
    next_connection: usize,
    next_request: u64,
    pending: HashSet<RequestId>,
    events: VecDeque<Event>,
    logger: Option<CommunicationLogger>,
}

impl Progress {

    /// A transport for `worker`.
    ///
    /// With `fixed_buffers`, frames are only read into posted buffers; otherwise a frame
    /// without a posted buffer is read into a freshly allocated one. Frames longer than
    /// `max_frame` bytes are framing errors in either mode.
    pub fn new(worker: usize, fixed_buffers: bool, max_frame: usize) -> Self {
        Progress {
            worker,
            fixed_buffers,
            max_frame,
            listener: None,
            connections: BTreeMap::new(),
            next_connection: 0,
            next_request: 1,
            pending: HashSet::new(),
            events: VecDeque::new(),
            logger: None,
        }
    }

    /// Installs a logger for transport events.
    pub fn set_logger(&mut self, logger: Option<CommunicationLogger>) {
        self.logger = logger;
    }

    /// The worker this transport announces in its handshakes.
    pub fn worker(&self) -> usize { self.worker }

    /// Starts accepting connections on `address`, returning the bound address.
    pub fn listen<A: ToSocketAddrs>(&mut self, address: A) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(local)
    }

    /// Connects to `peer` at `address`; a failure is reported through `on_error`.
    pub fn connect(&mut self, address: SocketAddr, peer: usize) -> ConnectionId {
        self.open(address, peer, false)
    }

    /// Connects to `peer` at `address`, swallowing failures until the connection is established.
    ///
    /// A failed attempt leaves the connection `Disconnected`; retry it with
    /// [`try_connecting`](Progress::try_connecting).
    pub fn try_connect(&mut self, address: SocketAddr, peer: usize) -> ConnectionId {
        self.open(address, peer, true)
    }

    /// Restarts a connect that failed or never started. Returns false if the attempt failed at once.
    pub fn try_connecting(&mut self, id: ConnectionId) -> bool {
        let worker = self.worker;
        let Some(connection) = self.connections.get_mut(&id) else { return false; };
        if connection.state() == ConnectionState::Connecting || connection.state() == ConnectionState::Connected {
            return true;
        }
        let started = connection.start_connect(worker).is_ok();
        if !started {
            connection.set_state(ConnectionState::Disconnected);
        }
        self.log_state(id);
        started
    }

    fn open(&mut self, address: SocketAddr, peer: usize, best_effort: bool) -> ConnectionId {
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        let mut connection = Connection::outbound(id, address, peer, self.fixed_buffers, self.max_frame, best_effort);
        if connection.start_connect(self.worker).is_err() {
            if best_effort {
                connection.set_state(ConnectionState::Disconnected);
            }
            else {
                connection.set_state(ConnectionState::Error);
                self.events.push_back(Event::Error(id, StatusCode::ConnectionError, Vec::new()));
            }
        }
        self.connections.insert(id, connection);
        self.log_state(id);
        id
    }

    /// Queues `buffer` for writing to `id` as a frame of `edge`.
    ///
    /// The buffer is handed back if the connection is not `Connected`.
    pub fn send(&mut self, id: ConnectionId, mut buffer: DataBuffer, edge: u32) -> Result<RequestId, DataBuffer> {
        let Some(connection) = self.connections.get_mut(&id) else { return Err(buffer); };
        if connection.state() != ConnectionState::Connected {
            return Err(buffer);
        }
        let request = RequestId(self.next_request);
        self.next_request += 1;
        buffer.set_connection(Some(id.0));
        connection.enqueue_write(TcpMessage { id: request, edge, buffer });
        self.pending.insert(request);
        Ok(request)
    }

    /// Posts `buffer` to receive the next frame of `edge` arriving on `id`.
    pub fn receive(&mut self, id: ConnectionId, buffer: DataBuffer, edge: u32) -> Result<RequestId, DataBuffer> {
        let Some(connection) = self.connections.get_mut(&id) else { return Err(buffer); };
        match connection.state() {
            ConnectionState::Connected | ConnectionState::Connecting => { },
            _ => return Err(buffer),
        }
        let request = RequestId(self.next_request);
        self.next_request += 1;
        connection.post_read(TcpMessage { id: request, edge, buffer });
        self.pending.insert(request);
        Ok(request)
    }

    /// True once `request` has completed or been abandoned.
    pub fn is_complete(&self, request: RequestId) -> bool {
        !self.pending.contains(&request)
    }

    /// True if `id` still has bytes to write.
    pub fn is_pending(&self, id: ConnectionId) -> bool {
        self.connections.get(&id).map(|connection| connection.has_pending_writes()).unwrap_or(false)
    }

    /// The state of `id`; unknown connections are `Disconnected`.
    pub fn state(&self, id: ConnectionId) -> ConnectionState {
        self.connections.get(&id).map(|connection| connection.state()).unwrap_or(ConnectionState::Disconnected)
    }

    /// The worker on the other end of `id`, once known.
    pub fn peer(&self, id: ConnectionId) -> Option<usize> {
        self.connections.get(&id).and_then(|connection| connection.peer())
    }

    /// Closes `id` at once, reporting unfinished requests through `on_close`.
    pub fn disconnect(&mut self, id: ConnectionId, handler: &mut dyn ChannelHandler) {
        if let Some(connection) = self.connections.get_mut(&id) {
            if connection.state() == ConnectionState::Connected {
                // One last attempt at what the socket accepts without waiting.
                let mut activity = Vec::new();
                let _ = connection.write(&mut activity);
                self.absorb(id, activity);
            }
        }
        self.close(id);
        self.dispatch(handler);
    }

    /// Keeps writing to `id` until its queue drains or `wait` passes, then closes it.
    pub fn disconnect_gracefully(&mut self, id: ConnectionId, wait: Duration, handler: &mut dyn ChannelHandler) {
        let deadline = Instant::now() + wait;
        while self.is_pending(id) && self.state(id) == ConnectionState::Connected && Instant::now() < deadline {
            if !self.progress(handler) {
                std::thread::yield_now();
            }
        }
        self.disconnect(id, handler);
    }

    /// Does whatever I/O is possible without blocking, then reports outcomes to `handler`.
    ///
    /// Returns true if anything happened.
    pub fn progress(&mut self, handler: &mut dyn ChannelHandler) -> bool {
        let mut active = self.accept();

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            let mut activity = Vec::new();
            let result = match self.connections.get_mut(&id) {
                Some(connection) => Self::drive(connection, &mut activity),
                None => continue,
            };
            active |= !activity.is_empty();
            let closed = activity.iter().any(|a| matches!(a, Activity::Closed));
            match result {
                Ok(moved) => {
                    active |= moved;
                    self.absorb(id, activity);
                    if closed {
                        self.close(id);
                    }
                },
                Err(error) => {
                    active = true;
                    self.absorb(id, activity);
                    self.fail(id, error);
                },
            }
        }

        active |= !self.events.is_empty();
        self.dispatch(handler);
        active
    }

    fn drive(connection: &mut Connection, activity: &mut Vec<Activity>) -> io::Result<bool> {
        if let Some(connected) = connection.poll_connect()? {
            activity.push(connected);
        }
        let wrote = connection.write(activity)?;
        let read = connection.read(activity)?;
        Ok(wrote || read)
    }

    fn accept(&mut self) -> bool {
        let mut accepted = Vec::new();
        if let Some(listener) = self.listener.as_ref() {
            loop {
                match listener.accept() {
                    Ok((stream, _)) => accepted.push(stream),
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                    Err(error) if error.kind() == io::ErrorKind::Interrupted => { },
                    // Failure to accept one socket does not affect the others.
                    Err(_) => break,
                }
            }
        }
        let active = !accepted.is_empty();
        for stream in accepted {
            let id = ConnectionId(self.next_connection);
            self.next_connection += 1;
            if let Ok(connection) = Connection::inbound(id, stream, self.fixed_buffers, self.max_frame) {
                self.connections.insert(id, connection);
                self.log_state(id);
            }
        }
        active
    }

    /// Turns connection activity into events.
    fn absorb(&mut self, id: ConnectionId, activity: Vec<Activity>) {
        for item in activity {
            match item {
                Activity::Connected(peer) => {
                    self.log_state(id);
                    self.events.push_back(Event::Connect(id, peer));
                },
                Activity::Sent(message) => {
                    self.pending.remove(&message.id);
                    self.log_message(true, id, &message);
                    self.events.push_back(Event::SendComplete(id, message));
                },
                Activity::Received(message) => {
                    self.pending.remove(&message.id);
                    self.log_message(false, id, &message);
                    self.events.push_back(Event::ReceiveComplete(id, message));
                },
                Activity::Closed => { },
            }
        }
    }

    /// Handles an I/O error on `id`.
    fn fail(&mut self, id: ConnectionId, error: io::Error) {
        let Some(connection) = self.connections.get_mut(&id) else { return; };
        let status = match (connection.state(), error.kind()) {
            (_, io::ErrorKind::InvalidData) => StatusCode::FramingError,
            (ConnectionState::Connecting, _) => StatusCode::ConnectionError,
            _ => StatusCode::IoError,
        };
        let silent = connection.is_best_effort() && status == StatusCode::ConnectionError;
        let abandoned = connection.abandon();
        for message in abandoned.iter() {
            self.pending.remove(&message.id);
        }
        if silent {
            connection.set_state(ConnectionState::Disconnected);
            self.log_state(id);
            return;
        }
        connection.set_state(ConnectionState::Error);
        let peer = connection.peer();
        self.log_state(id);
        if let Some(logger) = &self.logger {
            logger.log(ConnectionEvent { connection: id.0, peer, status: Some(status), abandoned: abandoned.len() });
        }
        self.events.push_back(Event::Error(id, status, abandoned));
    }

    /// Closes `id` in an orderly way.
    fn close(&mut self, id: ConnectionId) {
        let Some(connection) = self.connections.get_mut(&id) else { return; };
        if connection.state() == ConnectionState::Disconnected || connection.state() == ConnectionState::Error {
            return;
        }
        let abandoned = connection.abandon();
        for message in abandoned.iter() {
            self.pending.remove(&message.id);
        }
        connection.set_state(ConnectionState::Disconnected);
        let peer = connection.peer();
        self.log_state(id);
        if let Some(logger) = &self.logger {
            logger.log(ConnectionEvent { connection: id.0, peer, status: None, abandoned: abandoned.len() });
        }
        self.events.push_back(Event::Close(id, abandoned));
    }

    fn dispatch(&mut self, handler: &mut dyn ChannelHandler) {
        while let Some(event) = self.events.pop_front() {
            match event {
                Event::Connect(id, peer) => handler.on_connect(id, peer),
                Event::Error(id, status, abandoned) => handler.on_error(id, status, abandoned),
                Event::Close(id, abandoned) => handler.on_close(id, abandoned),
                Event::SendComplete(id, message) => handler.on_send_complete(id, message),
                Event::ReceiveComplete(id, message) => handler.on_receive_complete(id, message),
            }
        }
    }

    fn log_state(&self, id: ConnectionId) {
        if let (Some(logger), Some(connection)) = (&self.logger, self.connections.get(&id)) {
            logger.log(StateEvent { connection: id.0, peer: connection.peer(), state: connection.state() });
        }
    }

    fn log_message(&self, is_send: bool, id: ConnectionId, message: &TcpMessage) {
        if let Some(logger) = &self.logger {
            logger.log(MessageEvent { is_send, connection: id.0, edge: message.edge, length: message.buffer.size() });
        }
    }
}

#[cfg(test)]
mod test {

    use std::net::SocketAddr;
    use std::time::{Duration, Instant};

    use weft_bytes::buffer::DataBuffer;

    use super::Progress;
    use crate::networking::{ChannelHandler, ConnectionId, ConnectionState, StatusCode, TcpMessage};

    #[derive(Default)]
    struct Recorder {
        connected: Vec<(ConnectionId, usize)>,
        errors: Vec<(ConnectionId, StatusCode, usize)>,
        closed: Vec<(ConnectionId, usize)>,
        sent: Vec<TcpMessage>,
        received: Vec<TcpMessage>,
    }

    impl ChannelHandler for Recorder {
        fn on_connect(&mut self, connection: ConnectionId, peer: usize) { self.connected.push((connection, peer)); }
        fn on_error(&mut self, connection: ConnectionId, status: StatusCode, abandoned: Vec<TcpMessage>) {
            self.errors.push((connection, status, abandoned.len()));
        }
        fn on_close(&mut self, connection: ConnectionId, abandoned: Vec<TcpMessage>) { self.closed.push((connection, abandoned.len())); }
        fn on_send_complete(&mut self, _connection: ConnectionId, message: TcpMessage) { self.sent.push(message); }
        fn on_receive_complete(&mut self, _connection: ConnectionId, message: TcpMessage) { self.received.push(message); }
    }

    fn drive_until<F: FnMut(&Recorder, &Recorder) -> bool>(
        a: &mut Progress, ha: &mut Recorder,
        b: &mut Progress, hb: &mut Recorder,
        mut done: F)
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done(ha, hb) {
            assert!(Instant::now() < deadline, "loopback transfer timed out");
            a.progress(ha);
            b.progress(hb);
        }
    }

    fn pair(fixed: bool) -> (Progress, Recorder, Progress, Recorder, ConnectionId) {
        pair_limited(fixed, 1 << 16)
    }

    fn pair_limited(fixed: bool, max_frame: usize) -> (Progress, Recorder, Progress, Recorder, ConnectionId) {
        let mut server = Progress::new(0, fixed, max_frame);
        let address = server.listen("127.0.0.1:0").unwrap();
        let mut client = Progress::new(1, fixed, max_frame);
        let id = client.connect(address, 0);
        let (mut hs, mut hc) = (Recorder::default(), Recorder::default());
        drive_until(&mut server, &mut hs, &mut client, &mut hc, |s, c| !s.connected.is_empty() && !c.connected.is_empty());
        (server, hs, client, hc, id)
    }

    #[test]
    fn handshake_attributes_accepted_socket() {
        let (server, hs, client, hc, id) = pair(true);
        assert_eq!(hs.connected[0].1, 1);
        assert_eq!(hc.connected[0], (id, 0));
        assert_eq!(client.state(id), ConnectionState::Connected);
        assert_eq!(server.peer(hs.connected[0].0), Some(1));
    }

    #[test]
    fn frames_demultiplex_by_edge() {
        let (mut server, mut hs, mut client, mut hc, id) = pair(true);
        let inbound = hs.connected[0].0;
        server.receive(inbound, DataBuffer::new(64), 7).unwrap();
        server.receive(inbound, DataBuffer::new(64), 8).unwrap();

        let r8 = client.send(id, DataBuffer::from(b"eight".to_vec()), 8).unwrap();
        let r7 = client.send(id, DataBuffer::from(b"seven!".to_vec()), 7).unwrap();
        assert!(!client.is_complete(r7));

        drive_until(&mut server, &mut hs, &mut client, &mut hc, |s, _| s.received.len() == 2);
        assert!(client.is_complete(r7) && client.is_complete(r8));
        assert_eq!(hc.sent.len(), 2);
        let mut frames: Vec<(u32, Vec<u8>)> = hs.received.iter().map(|m| (m.edge, m.buffer.valid().to_vec())).collect();
        frames.sort();
        assert_eq!(frames, vec![(7, b"seven!".to_vec()), (8, b"eight".to_vec())]);
        assert!(hs.received.iter().all(|m| m.buffer.connection() == Some(inbound.0)));
    }

    #[test]
    fn dynamic_mode_allocates_frames() {
        let (mut server, mut hs, mut client, mut hc, id) = pair(false);
        client.send(id, DataBuffer::from(vec![3u8; 1000]), 1).unwrap();
        drive_until(&mut server, &mut hs, &mut client, &mut hc, |s, _| s.received.len() == 1);
        assert_eq!(hs.received[0].buffer.size(), 1000);
    }

    #[test]
    fn dynamic_mode_refuses_frames_beyond_the_limit() {
        let (mut server, mut hs, mut client, mut hc, id) = pair_limited(false, 64);
        client.send(id, DataBuffer::from(vec![5u8; 1000]), 3).unwrap();
        drive_until(&mut server, &mut hs, &mut client, &mut hc, |s, _| !s.errors.is_empty());
        assert_eq!(hs.errors[0].1, StatusCode::FramingError);
        assert!(hs.received.is_empty());
    }

    #[test]
    fn oversized_frame_is_a_framing_error() {
        let (mut server, mut hs, mut client, mut hc, id) = pair(true);
        let inbound = hs.connected[0].0;
        server.receive(inbound, DataBuffer::new(4), 1).unwrap();
        client.send(id, DataBuffer::from(vec![1u8; 16]), 1).unwrap();
        drive_until(&mut server, &mut hs, &mut client, &mut hc, |s, _| !s.errors.is_empty());
        assert_eq!(hs.errors[0].1, StatusCode::FramingError);
        assert_eq!(hs.errors[0].2, 1);
        assert_eq!(server.state(inbound), ConnectionState::Error);
    }

    #[test]
    fn sends_require_a_connection() {
        let mut progress = Progress::new(0, true, 1 << 16);
        let buffer = progress.send(ConnectionId(3), DataBuffer::new(8), 0).unwrap_err();
        assert_eq!(buffer.capacity(), 8);
    }

    #[test]
    fn deliberate_connect_failure_is_reported() {
        // Bind and drop a listener to find a port nobody listens on.
        let address: SocketAddr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut progress = Progress::new(0, true, 1 << 16);
        let mut handler = Recorder::default();
        let id = progress.connect(address, 1);
        let deadline = Instant::now() + Duration::from_secs(10);
        while handler.errors.is_empty() {
            assert!(Instant::now() < deadline);
            progress.progress(&mut handler);
        }
        assert_eq!(handler.errors[0].0, id);
        assert_eq!(handler.errors[0].1, StatusCode::ConnectionError);

        let mut quiet = Recorder::default();
        let retry = progress.try_connect(address, 1);
        let deadline = Instant::now() + Duration::from_millis(500);
        while Instant::now() < deadline && progress.state(retry) != ConnectionState::Disconnected {
            progress.progress(&mut quiet);
        }
        assert_eq!(progress.state(retry), ConnectionState::Disconnected);
        assert!(quiet.errors.is_empty());
    }

    #[test]
    fn graceful_disconnect_flushes_then_closes_peer() {
        let (mut server, mut hs, mut client, mut hc, id) = pair(false);
        client.send(id, DataBuffer::from(vec![9u8; 4096]), 2).unwrap();
        client.disconnect_gracefully(id, Duration::from_secs(5), &mut hc);
        assert_eq!(hc.closed, vec![(id, 0)]);
        assert_eq!(client.state(id), ConnectionState::Disconnected);
        drive_until(&mut server, &mut hs, &mut client, &mut hc, |s, _| !s.closed.is_empty());
        assert_eq!(hs.received.len(), 1);
        assert_eq!(hs.received[0].buffer.size(), 4096);
    }
}
