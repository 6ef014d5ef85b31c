//! Configuration of a worker and construction of its communicator.

use std::time::Duration;

#[cfg(feature = "getopts")]
use std::io::BufRead;

use serde::{Deserialize, Serialize};

use crate::codec::MessageHeader;
use crate::communicator::Communicator;
use crate::error::CommError;

/// How M-to-N operations move partial-stage output towards final receivers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionAlgorithm {
    /// Forward each partial-stage message as soon as it is produced.
    #[default]
    Simple,
    /// Stage messages per target and drain one destination worker at a time, in ring order.
    Ring,
}

impl std::str::FromStr for PartitionAlgorithm {
    type Err = String;
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.to_ascii_lowercase().as_str() {
            "simple" => Ok(PartitionAlgorithm::Simple),
            "ring" => Ok(PartitionAlgorithm::Ring),
            other => Err(format!("unknown partition algorithm: {}", other)),
        }
    }
}

/// Settings for one worker of a cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Index of this worker.
    pub process: usize,
    /// `host:port` of every worker, indexed by worker.
    pub addresses: Vec<String>,
    /// Print connection progress.
    pub report: bool,
    /// Capacity of every network buffer.
    pub buffer_size: usize,
    /// Buffers in the shared send pool.
    pub send_buffer_count: usize,
    /// Receive buffers posted per peer and edge.
    pub receive_buffer_count: usize,
    /// Messages queued per lane before sends report backpressure.
    pub send_pending_max: usize,
    /// Partition strategy for batch operations.
    pub batch_partition_algorithm: PartitionAlgorithm,
    /// Partition strategy for streaming operations.
    pub stream_partition_algorithm: PartitionAlgorithm,
    /// Values combined into one message by the partial stage.
    pub grouping_size: usize,
    /// Read frames only into posted buffers, rather than allocating.
    pub fixed_buffers: bool,
    /// Pause between attempts to reach a peer that is not yet listening.
    pub connect_retry: Duration,
    /// Time allowed for queued writes to drain when closing.
    pub disconnect_wait: Duration,
    /// Time allowed for the whole cluster to connect.
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            process: 0,
            addresses: vec![default_address(0)],
            report: false,
            buffer_size: 1 << 16,
            send_buffer_count: 64,
            receive_buffer_count: 8,
            send_pending_max: 16,
            batch_partition_algorithm: PartitionAlgorithm::Simple,
            stream_partition_algorithm: PartitionAlgorithm::Simple,
            grouping_size: 100,
            fixed_buffers: true,
            connect_retry: Duration::from_millis(50),
            disconnect_wait: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

fn default_address(index: usize) -> String {
    format!("localhost:{}", 2101 + index)
}

impl Config {

    /// A configuration for `processes` workers on this host, as worker `process`.
    pub fn local(process: usize, processes: usize) -> Self {
        Config {
            process,
            addresses: (0 .. processes).map(default_address).collect(),
            ..Config::default()
        }
    }

    /// The number of workers.
    pub fn processes(&self) -> usize { self.addresses.len() }

    /// Confirms the settings can work together.
    pub fn validate(&self) -> Result<(), CommError> {
        let invalid = |message: String| Err(CommError::Config { message });
        // A message header, one item header and one byte of body.
        let minimum = MessageHeader::SIZE + 8 + 1;
        if self.buffer_size < minimum {
            return invalid(format!("buffer size {} is below the minimum of {}", self.buffer_size, minimum));
        }
        if self.addresses.is_empty() {
            return invalid("no worker addresses".to_owned());
        }
        if self.process >= self.addresses.len() {
            return invalid(format!("process {} out of range for {} workers", self.process, self.addresses.len()));
        }
        if self.send_buffer_count == 0 || self.receive_buffer_count == 0 {
            return invalid("buffer counts must be positive".to_owned());
        }
        if self.send_pending_max == 0 {
            return invalid("send_pending_max must be positive".to_owned());
        }
        if self.grouping_size == 0 {
            return invalid("grouping_size must be positive".to_owned());
        }
        Ok(())
    }

    /// Installs options for configuring a worker.
    #[cfg(feature = "getopts")]
    pub fn install_options(opts: &mut getopts::Options) {
        opts.optopt("p", "process", "identity of this process", "IDX");
        opts.optopt("n", "processes", "number of processes", "NUM");
        opts.optopt("h", "hostfile", "text file whose lines are process addresses", "FILE");
        opts.optflag("r", "report", "reports connection progress");
        opts.optopt("", "buffer-size", "bytes per network buffer", "BYTES");
        opts.optopt("", "send-buffers", "buffers in the send pool", "NUM");
        opts.optopt("", "receive-buffers", "receive buffers per peer and edge", "NUM");
        opts.optopt("", "pending", "queued messages per lane", "NUM");
        opts.optopt("", "partition", "batch partition algorithm (simple or ring)", "ALG");
        opts.optopt("", "stream-partition", "streaming partition algorithm (simple or ring)", "ALG");
        opts.optopt("", "grouping", "values per partial-stage message", "NUM");
        opts.optflag("", "dynamic-buffers", "allocate receive buffers per frame");
    }

    /// Instantiates a configuration based upon the parsed options in `matches`.
    #[cfg(feature = "getopts")]
    pub fn from_matches(matches: &getopts::Matches) -> Result<Config, String> {

        fn parse<T: std::str::FromStr>(matches: &getopts::Matches, name: &str, default: T) -> Result<T, String>
        where T::Err: std::fmt::Display
        {
            match matches.opt_str(name) {
                Some(text) => text.parse().map_err(|e| format!("invalid --{}: {}", name, e)),
                None => Ok(default),
            }
        }

        let defaults = Config::default();
        let process = parse(matches, "process", 0usize)?;
        let processes = parse(matches, "processes", 1usize)?;

        let mut addresses = Vec::new();
        if let Some(hosts) = matches.opt_str("hostfile") {
            let file = ::std::fs::File::open(&hosts).map_err(|e| format!("cannot open {}: {}", hosts, e))?;
            let reader = ::std::io::BufReader::new(file);
            for line in reader.lines().take(processes) {
                addresses.push(line.map_err(|e| e.to_string())?);
            }
            if addresses.len() < processes {
                return Err(format!("could only read {} addresses from {}, but -n: {}", addresses.len(), hosts, processes));
            }
        }
        else {
            addresses.extend((0 .. processes).map(default_address));
        }

        let config = Config {
            process,
            addresses,
            report: matches.opt_present("report"),
            buffer_size: parse(matches, "buffer-size", defaults.buffer_size)?,
            send_buffer_count: parse(matches, "send-buffers", defaults.send_buffer_count)?,
            receive_buffer_count: parse(matches, "receive-buffers", defaults.receive_buffer_count)?,
            send_pending_max: parse(matches, "pending", defaults.send_pending_max)?,
            batch_partition_algorithm: parse(matches, "partition", defaults.batch_partition_algorithm)?,
            stream_partition_algorithm: parse(matches, "stream-partition", defaults.stream_partition_algorithm)?,
            grouping_size: parse(matches, "grouping", defaults.grouping_size)?,
            fixed_buffers: !matches.opt_present("dynamic-buffers"),
            ..defaults
        };
        config.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }

    /// Constructs a new configuration by parsing the supplied text arguments.
    ///
    /// Most commonly, this uses `std::env::args()` as the supplied iterator.
    #[cfg(feature = "getopts")]
    pub fn from_args<I: IntoIterator<Item=String>>(args: I) -> Result<Config, String> {
        let mut opts = getopts::Options::new();
        Config::install_options(&mut opts);
        let matches = opts.parse(args).map_err(|e| e.to_string())?;
        Config::from_matches(&matches)
    }
}

/// Binds this worker's address, connects to the cluster, and waits for every peer.
///
/// # Examples
/// ```
/// use weft_communication::Config;
///
/// // a cluster of one, listening on any free port.
/// let config = Config { addresses: vec!["127.0.0.1:0".to_owned()], ..Config::default() };
/// let communicator = weft_communication::initialize(config).unwrap();
/// assert!(communicator.all_connected());
/// ```
pub fn initialize(config: Config) -> Result<Communicator, CommError> {
    config.validate()?;
    let process = config.process;
    let addresses = config.addresses.clone();
    let listen = addresses[process].clone();
    let timeout = config.connect_timeout;
    let report = config.report;

    let mut communicator = Communicator::bind(config, process, &listen)?;
    communicator.connect_peers(&addresses)?;
    communicator.await_connections(timeout)?;
    if report {
        println!("worker {} connected to {} peers", process, addresses.len() - 1);
    }
    Ok(communicator)
}
