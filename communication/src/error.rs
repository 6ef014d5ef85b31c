//! Errors surfaced by the communication layer.
//!
//! Running out of buffers or queue slots is not an error; those conditions are reported as
//! `false` or `None` results and resolved by calling `progress` and retrying.

/// Errors that abort an operation, or a request to the communicator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommError {
    /// An I/O operation failed.
    #[error("i/o error: {message}")]
    Io {
        /// Description of the underlying error.
        message: String,
    },

    /// A task id is not present in the logical plan.
    #[error("task {task} is not in the logical plan")]
    UnknownTask {
        /// The unresolved task id.
        task: i32,
    },

    /// A worker index has no known address or connection.
    #[error("worker {worker} is unknown")]
    UnknownWorker {
        /// The unknown worker index.
        worker: usize,
    },

    /// Received bytes could not be decoded.
    #[error("framing error on edge {edge}: {message}")]
    Framing {
        /// The edge whose stream was malformed.
        edge: u32,
        /// What was wrong with the bytes.
        message: String,
    },

    /// A value does not match the type declared for the edge.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// The declared type.
        expected: String,
        /// The offending value's kind.
        found: String,
    },

    /// The destination selector cannot route by key.
    #[error("selector {selector} does not support keyed selection")]
    KeyedSelection {
        /// Name of the selector.
        selector: &'static str,
    },

    /// A source or destination is not part of the operation.
    #[error("task {task} does not participate as a {role}")]
    NotParticipant {
        /// The task id.
        task: i32,
        /// "source" or "target".
        role: &'static str,
    },

    /// The connection to a worker failed and will not be retried.
    #[error("connection to worker {worker} is degraded")]
    Degraded {
        /// The unreachable worker.
        worker: usize,
    },

    /// A wait exceeded its deadline.
    #[error("timed out after {millis} ms waiting for {what}")]
    Timeout {
        /// What was being waited for.
        what: String,
        /// The elapsed wait.
        millis: u128,
    },

    /// The operation was closed.
    #[error("operation on edge {edge} is closed")]
    Closed {
        /// The edge of the closed operation.
        edge: u32,
    },

    /// The configuration is inconsistent.
    #[error("invalid configuration: {message}")]
    Config {
        /// Details of the inconsistency.
        message: String,
    },
}

impl CommError {
    /// Builds a framing error for `edge`.
    pub fn framing<S: Into<String>>(edge: u32, message: S) -> Self {
        CommError::Framing { edge, message: message.into() }
    }
}

impl From<std::io::Error> for CommError {
    fn from(err: std::io::Error) -> Self {
        CommError::Io { message: err.to_string() }
    }
}
