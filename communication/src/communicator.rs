//! The per-worker entry point: connections, edge ids and the shared channel.

use std::cell::RefCell;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::{Duration, Instant};

use weft_logging::Registry;

use crate::channel::{Channel, SharedChannel};
use crate::error::CommError;
use crate::initialize::Config;
use crate::logging::{CommunicationEvent, CommunicationLogger, LOGGER_NAME};

/// Connects one worker to its peers and hands out what operations need.
///
/// Operations are constructed against a communicator, which assigns each one the next edge
/// id. Every worker must construct the same operations in the same order.
///
/// # Examples
///
/// ```
/// use weft_communication::{Communicator, Config};
///
/// let config = Config::local(0, 1);
/// let mut communicator = Communicator::bind(config, 0, "127.0.0.1:0").unwrap();
/// assert!(communicator.all_connected());
/// assert_eq!(communicator.next_edge(), 0);
/// assert_eq!(communicator.next_edge(), 1);
/// communicator.close();
/// ```
pub struct Communicator {
    config: Config,
    worker: usize,
    channel: SharedChannel,
    local_addr: SocketAddr,
    next_edge: u32,
    logger: Option<CommunicationLogger>,
}

impl Communicator {

    /// A communicator for `worker`, accepting peers on `address`.
    pub fn bind<A: ToSocketAddrs>(config: Config, worker: usize, address: A) -> Result<Self, CommError> {
        config.validate()?;
        let mut channel = Channel::new(worker, &config);
        let local_addr = channel.listen(address)?;
        Ok(Communicator {
            config,
            worker,
            channel: Rc::new(RefCell::new(channel)),
            local_addr,
            next_edge: 0,
            logger: None,
        })
    }

    /// The address peers connect to.
    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    /// This worker's index.
    pub fn worker(&self) -> usize { self.worker }

    /// The configuration.
    pub fn config(&self) -> &Config { &self.config }

    /// The channel shared by this worker's operations.
    pub fn channel(&self) -> SharedChannel { Rc::clone(&self.channel) }

    /// Allocates the id of the next operation edge.
    pub fn next_edge(&mut self) -> u32 {
        let edge = self.next_edge;
        self.next_edge += 1;
        edge
    }

    /// Installs `logger` for the transport and for operations constructed from now on.
    pub fn set_logger(&mut self, logger: Option<CommunicationLogger>) {
        self.channel.borrow_mut().set_logger(logger.clone());
        self.logger = logger;
    }

    /// Looks up the communication logger in `registry`, and installs it if present.
    pub fn register_logging(&mut self, registry: &Registry) {
        let logger = registry.get::<CommunicationEvent>(LOGGER_NAME);
        self.set_logger(logger);
    }

    /// The logger handed to new operations.
    pub fn logger(&self) -> Option<CommunicationLogger> { self.logger.clone() }

    /// Records the peers: workers with lower indices are dialed, higher ones are expected.
    ///
    /// `addresses[i]` is the address of worker `i`; this worker's own entry is skipped.
    pub fn connect_peers<S: AsRef<str>>(&mut self, addresses: &[S]) -> Result<(), CommError> {
        let mut channel = self.channel.borrow_mut();
        for (worker, address) in addresses.iter().enumerate() {
            if worker < self.worker {
                let resolved = address.as_ref()
                    .to_socket_addrs()?
                    .next()
                    .ok_or(CommError::UnknownWorker { worker })?;
                channel.add_peer(worker, resolved);
            }
            else if worker > self.worker {
                channel.expect_peer(worker);
            }
        }
        Ok(())
    }

    /// True if every peer is connected.
    pub fn all_connected(&self) -> bool {
        self.channel.borrow().all_connected()
    }

    /// Drives the transport until every peer is connected, or `timeout` elapses.
    pub fn await_connections(&mut self, timeout: Duration) -> Result<(), CommError> {
        let start = Instant::now();
        while !self.all_connected() {
            if start.elapsed() > timeout {
                return Err(CommError::Timeout { what: "peer connections".to_owned(), millis: timeout.as_millis() });
            }
            if !self.progress() {
                std::thread::yield_now();
            }
        }
        Ok(())
    }

    /// Moves bytes on every connection. Returns true if anything happened.
    pub fn progress(&mut self) -> bool {
        self.channel.borrow_mut().progress()
    }

    /// Workers whose connections failed.
    pub fn degraded_workers(&self) -> Vec<usize> {
        self.channel.borrow().degraded_workers()
    }

    /// Closes every connection, letting queued writes drain for up to `disconnect_wait`.
    pub fn close(&mut self) {
        self.channel.borrow_mut().close();
        if let Some(logger) = &self.logger {
            logger.flush();
        }
    }
}

#[cfg(test)]
mod test {

    use std::time::Duration;

    use super::Communicator;
    use crate::error::CommError;
    use crate::initialize::Config;

    #[test]
    fn two_workers_connect() {
        let config = Config::local(0, 2);
        let mut first = Communicator::bind(config.clone(), 0, "127.0.0.1:0").unwrap();
        let mut second = Communicator::bind(Config { process: 1, ..config }, 1, "127.0.0.1:0").unwrap();
        let addresses = vec![first.local_addr().to_string(), second.local_addr().to_string()];
        first.connect_peers(&addresses).unwrap();
        second.connect_peers(&addresses).unwrap();

        let mut rounds = 0;
        while !(first.all_connected() && second.all_connected()) {
            first.progress();
            second.progress();
            rounds += 1;
            assert!(rounds < 100_000, "workers did not connect");
        }
        first.close();
        second.close();
    }

    #[test]
    fn waiting_for_a_missing_peer_times_out() {
        let mut alone = Communicator::bind(Config::local(0, 2), 0, "127.0.0.1:0").unwrap();
        alone.connect_peers(&["127.0.0.1:1", "127.0.0.1:2"]).unwrap();
        let result = alone.await_connections(Duration::from_millis(20));
        assert!(matches!(result, Err(CommError::Timeout { .. })));
    }
}
