//! Events logged by the transport, the channel, and operations.

use serde::{Deserialize, Serialize};

use weft_logging::Logger;

use crate::networking::{ConnectionState, StatusCode};

/// The logger type used throughout the crate.
pub type CommunicationLogger = Logger<CommunicationEvent>;

/// The name under which the communication logger is looked up in a registry.
pub const LOGGER_NAME: &str = "weft/communication";

/// A connection changed state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StateEvent {
    /// Connection identifier.
    pub connection: usize,
    /// Worker on the other end, once known.
    pub peer: Option<usize>,
    /// The new state.
    pub state: ConnectionState,
}

/// A frame was written to, or read from, a connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    /// `true` for writes, `false` for reads.
    pub is_send: bool,
    /// Connection identifier.
    pub connection: usize,
    /// Edge the frame belongs to.
    pub edge: u32,
    /// Payload bytes in the frame.
    pub length: usize,
}

/// A connection failed or was closed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// Connection identifier.
    pub connection: usize,
    /// Worker on the other end, if known.
    pub peer: Option<usize>,
    /// Failure code, or `None` for an orderly close.
    pub status: Option<StatusCode>,
    /// Requests abandoned with the connection.
    pub abandoned: usize,
}

/// An operation changed state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OperationEvent {
    /// Edge identifier.
    pub edge: u32,
    /// What happened.
    pub kind: OperationEventKind,
}

/// Operation milestones.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum OperationEventKind {
    /// Constructed on this worker.
    Created,
    /// A target saw syncs from every source.
    AllSyncs {
        /// The target.
        target: i32,
    },
    /// A target delivered its data and sync downstream.
    Delivered {
        /// The target.
        target: i32,
    },
    /// The operation cannot continue.
    Failed {
        /// Description of the failure.
        message: String,
    },
    /// A worker this operation exchanges with became unreachable.
    Degraded {
        /// The lost worker.
        worker: usize,
    },
    /// State discarded by `reset`.
    Reset,
}

/// Events logged by the communication layer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum CommunicationEvent {
    /// A connection state transition.
    State(StateEvent),
    /// A frame sent or received.
    Message(MessageEvent),
    /// A connection failure or close.
    Connection(ConnectionEvent),
    /// An operation milestone.
    Operation(OperationEvent),
}

impl From<StateEvent> for CommunicationEvent {
    fn from(v: StateEvent) -> CommunicationEvent { CommunicationEvent::State(v) }
}

impl From<MessageEvent> for CommunicationEvent {
    fn from(v: MessageEvent) -> CommunicationEvent { CommunicationEvent::Message(v) }
}

impl From<ConnectionEvent> for CommunicationEvent {
    fn from(v: ConnectionEvent) -> CommunicationEvent { CommunicationEvent::Connection(v) }
}

impl From<OperationEvent> for CommunicationEvent {
    fn from(v: OperationEvent) -> CommunicationEvent { CommunicationEvent::Operation(v) }
}
