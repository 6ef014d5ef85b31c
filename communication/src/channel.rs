//! The per-worker channel shared by every operation.
//!
//! A [`Channel`] owns the transport, one connection per peer worker, the send pool, and the
//! receive buffers posted for each `(worker, edge)` registration. Operations hand it complete
//! serialized messages and collect received buffers by edge.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::{Duration, Instant};

use weft_bytes::buffer::DataBuffer;
use weft_bytes::pool::BufferPool;

use crate::initialize::Config;
use crate::logging::CommunicationLogger;
use crate::networking::{ChannelHandler, ConnectionId, ConnectionState, Progress, RequestId, StatusCode, TcpMessage};

/// A channel shared by the operations of one worker.
pub type SharedChannel = Rc<RefCell<Channel>>;

/// What the channel knows about one peer worker.
struct Peer {
    /// Where to connect, for peers this worker dials.
    address: Option<SocketAddr>,
    connection: Option<ConnectionId>,
    last_attempt: Option<Instant>,
}

/// Channel state touched by transport callbacks.
struct Handler {
    buffer_size: usize,
    send_pool: BufferPool,
    send_requests: HashSet<RequestId>,
    connections: HashMap<ConnectionId, usize>,
    connected: BTreeSet<usize>,
    degraded: BTreeSet<usize>,
    registrations: BTreeSet<(usize, u32)>,
    received: HashMap<u32, VecDeque<(usize, DataBuffer)>>,
    /// Workers that connected since the last post of receive buffers.
    newly_connected: Vec<usize>,
    closing: bool,
}

impl Handler {
    fn recycle(&mut self, message: TcpMessage) {
        if self.send_requests.remove(&message.id) {
            self.send_pool.release(message.buffer);
        }
    }

    fn lost(&mut self, connection: ConnectionId, abandoned: Vec<TcpMessage>, degrade: bool) {
        for message in abandoned {
            self.recycle(message);
        }
        if let Some(worker) = self.connections.remove(&connection) {
            self.connected.remove(&worker);
            if degrade {
                self.degraded.insert(worker);
            }
        }
    }
}

impl ChannelHandler for Handler {
    fn on_connect(&mut self, connection: ConnectionId, peer: usize) {
        self.connections.insert(connection, peer);
        self.connected.insert(peer);
        self.degraded.remove(&peer);
        self.newly_connected.push(peer);
    }

    fn on_error(&mut self, connection: ConnectionId, _status: StatusCode, abandoned: Vec<TcpMessage>) {
        self.lost(connection, abandoned, true);
    }

    fn on_close(&mut self, connection: ConnectionId, abandoned: Vec<TcpMessage>) {
        let degrade = !self.closing;
        self.lost(connection, abandoned, degrade);
    }

    fn on_send_complete(&mut self, _connection: ConnectionId, message: TcpMessage) {
        self.recycle(message);
    }

    fn on_receive_complete(&mut self, connection: ConnectionId, message: TcpMessage) {
        if let Some(worker) = self.connections.get(&connection) {
            self.received.entry(message.edge).or_default().push_back((*worker, message.buffer));
        }
    }
}

/// Connections to every peer worker, with buffer management.
pub struct Channel {
    worker: usize,
    transport: Progress,
    handler: Handler,
    peers: BTreeMap<usize, Peer>,
    receive_buffer_count: usize,
    connect_retry: Duration,
    disconnect_wait: Duration,
}

impl Channel {

    /// A channel for `worker`, sized by `config`.
    pub fn new(worker: usize, config: &Config) -> Self {
        Channel {
            worker,
            transport: Progress::new(worker, config.fixed_buffers, config.buffer_size),
            handler: Handler {
                buffer_size: config.buffer_size,
                send_pool: BufferPool::new(config.buffer_size, config.send_buffer_count),
                send_requests: HashSet::new(),
                connections: HashMap::new(),
                connected: BTreeSet::new(),
                degraded: BTreeSet::new(),
                registrations: BTreeSet::new(),
                received: HashMap::new(),
                newly_connected: Vec::new(),
                closing: false,
            },
            peers: BTreeMap::new(),
            receive_buffer_count: config.receive_buffer_count,
            connect_retry: config.connect_retry,
            disconnect_wait: config.disconnect_wait,
        }
    }

    /// Installs a logger for transport events.
    pub fn set_logger(&mut self, logger: Option<CommunicationLogger>) {
        self.transport.set_logger(logger);
    }

    /// The worker this channel belongs to.
    pub fn worker(&self) -> usize { self.worker }

    /// Capacity of every network buffer.
    pub fn buffer_size(&self) -> usize { self.handler.buffer_size }

    /// Bytes of the largest item a peer can serialize, which is the whole send pool.
    pub fn max_item(&self) -> usize {
        self.handler.buffer_size.saturating_mul(self.handler.send_pool.count())
    }

    /// The pool that serialized messages are written into.
    pub fn send_pool(&mut self) -> &mut BufferPool { &mut self.handler.send_pool }

    /// Accepts connections from peers on `address`.
    pub fn listen<A: ToSocketAddrs>(&mut self, address: A) -> io::Result<SocketAddr> {
        self.transport.listen(address)
    }

    /// Dials `worker` at `address`, retrying until it answers.
    pub fn add_peer(&mut self, worker: usize, address: SocketAddr) {
        let connection = self.transport.try_connect(address, worker);
        self.handler.connections.insert(connection, worker);
        self.peers.insert(worker, Peer { address: Some(address), connection: Some(connection), last_attempt: Some(Instant::now()) });
    }

    /// Expects `worker` to dial this worker.
    pub fn expect_peer(&mut self, worker: usize) {
        self.peers.entry(worker).or_insert(Peer { address: None, connection: None, last_attempt: None });
    }

    /// Every peer worker, in increasing order.
    pub fn peers(&self) -> impl Iterator<Item=usize> + '_ {
        self.peers.keys().copied()
    }

    /// True if the connection to `worker` is up.
    pub fn is_connected(&self, worker: usize) -> bool {
        self.handler.connected.contains(&worker)
    }

    /// True if every known peer is connected.
    pub fn all_connected(&self) -> bool {
        self.peers.keys().all(|worker| self.handler.connected.contains(worker))
    }

    /// True if the connection to `worker` failed.
    pub fn is_degraded(&self, worker: usize) -> bool {
        self.handler.degraded.contains(&worker)
    }

    /// Workers whose connections failed, in increasing order.
    pub fn degraded_workers(&self) -> Vec<usize> {
        self.handler.degraded.iter().copied().collect()
    }

    /// Hands every buffer of one message to the connection to `worker`.
    ///
    /// Either all buffers are queued, in order, or none are and they are handed back.
    pub fn send_all(&mut self, worker: usize, edge: u32, buffers: Vec<DataBuffer>) -> Result<(), Vec<DataBuffer>> {
        let Some(connection) = self.connection_of(worker) else { return Err(buffers); };
        if !self.is_connected(worker) || self.transport.state(connection) != ConnectionState::Connected {
            return Err(buffers);
        }
        for buffer in buffers {
            match self.transport.send(connection, buffer, edge) {
                Ok(request) => { self.handler.send_requests.insert(request); },
                // The state was checked above; a refusal here means the pool takes the buffer back.
                Err(buffer) => { self.handler.send_pool.release(buffer); },
            }
        }
        Ok(())
    }

    /// Posts receive buffers for frames of `edge` from `worker`.
    pub fn register_receive(&mut self, worker: usize, edge: u32) {
        if self.handler.registrations.insert((worker, edge)) && self.is_connected(worker) {
            self.post(worker, edge, self.receive_buffer_count);
        }
    }

    /// Takes the oldest received buffer of `edge`, with the worker it came from.
    pub fn take_received(&mut self, edge: u32) -> Option<(usize, DataBuffer)> {
        self.handler.received.get_mut(&edge).and_then(|queue| queue.pop_front())
    }

    /// Returns a consumed receive buffer, reposting it for the same edge and worker.
    pub fn release_receive_buffer(&mut self, worker: usize, edge: u32, mut buffer: DataBuffer) {
        if buffer.capacity() != self.handler.buffer_size || !self.handler.registrations.contains(&(worker, edge)) {
            return;
        }
        if let Some(connection) = self.connection_of(worker) {
            buffer.clear();
            let _ = self.transport.receive(connection, buffer, edge);
        }
    }

    /// Moves bytes on every connection and retries peers that have not answered.
    ///
    /// Returns true if anything happened.
    pub fn progress(&mut self) -> bool {
        let now = Instant::now();
        if !self.handler.closing {
            for (worker, peer) in self.peers.iter_mut() {
                let (Some(connection), Some(_)) = (peer.connection, peer.address) else { continue; };
                if self.transport.state(connection) != ConnectionState::Disconnected || self.handler.degraded.contains(worker) {
                    continue;
                }
                let due = peer.last_attempt.map(|last| now.duration_since(last) >= self.connect_retry).unwrap_or(true);
                if due {
                    peer.last_attempt = Some(now);
                    self.transport.try_connecting(connection);
                }
            }
        }

        let active = self.transport.progress(&mut self.handler);

        let connected = std::mem::take(&mut self.handler.newly_connected);
        for worker in connected {
            if let Some(peer) = self.peers.get_mut(&worker) {
                if peer.address.is_none() {
                    peer.connection = self.handler.connections.iter()
                        .filter(|(_, w)| **w == worker)
                        .map(|(c, _)| *c)
                        .max();
                }
            }
            let edges: Vec<u32> = self.handler.registrations.iter()
                .filter(|(w, _)| *w == worker)
                .map(|(_, edge)| *edge)
                .collect();
            for edge in edges {
                self.post(worker, edge, self.receive_buffer_count);
            }
        }
        active
    }

    /// Closes every connection, letting queued writes drain first.
    pub fn close(&mut self) {
        self.handler.closing = true;
        let connections: Vec<ConnectionId> = self.peers.values().filter_map(|peer| peer.connection).collect();
        for connection in connections {
            self.transport.disconnect_gracefully(connection, self.disconnect_wait, &mut self.handler);
        }
    }

    fn connection_of(&self, worker: usize) -> Option<ConnectionId> {
        self.peers.get(&worker).and_then(|peer| peer.connection)
    }

    fn post(&mut self, worker: usize, edge: u32, count: usize) {
        let Some(connection) = self.connection_of(worker) else { return; };
        for _ in 0 .. count {
            let buffer = DataBuffer::new(self.handler.buffer_size);
            if self.transport.receive(connection, buffer, edge).is_err() {
                break;
            }
        }
    }
}
