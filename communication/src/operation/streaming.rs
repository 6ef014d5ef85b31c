//! Streaming operations: values reach their target as they arrive.
//!
//! Syncs are still tracked, and a target's sync is delivered once every source has synced
//! and everything before it was delivered.

use std::rc::Rc;

use crate::codec::{MessageType, Value};
use crate::communicator::Communicator;
use crate::edge::{Edge, OperationKind};
use crate::error::CommError;
use crate::routing::{HashingSelector, LoadBalanceSelector, LogicalPlan};

use super::direct::{Fixed, Routes};
use super::mton::{MToN, Participants};
use super::partial::PartialKind;
use super::receiver::{Accumulator, Sink};
use super::{ReduceFunction, SingularReceiver};

/// Each source streams to its paired target.
pub struct SDirect {
    inner: Fixed,
}

impl SDirect {
    /// Pairs `sources[i]` with `targets[i]`.
    pub fn new<R: SingularReceiver + 'static>(
        communicator: &mut Communicator,
        plan: Rc<LogicalPlan>,
        sources: Vec<i32>,
        targets: Vec<i32>,
        data_type: MessageType,
        receiver: R) -> Result<Self, CommError>
    {
        let edge = Edge::new(communicator.next_edge(), OperationKind::Direct, data_type);
        let inner = Fixed::new(communicator, plan, edge, Routes::Pairs(sources, targets), Sink::Singular(Box::new(receiver)), true)?;
        Ok(SDirect { inner })
    }
}

implement_operation!(SDirect);

/// Streams values over the targets, round-robin per source.
pub struct SPartition {
    inner: MToN,
}

impl SPartition {
    /// Partitions the values of `sources` over `targets`.
    pub fn new<R: SingularReceiver + 'static>(
        communicator: &mut Communicator,
        plan: Rc<LogicalPlan>,
        sources: Vec<i32>,
        targets: Vec<i32>,
        data_type: MessageType,
        receiver: R) -> Result<Self, CommError>
    {
        let edge = Edge::new(communicator.next_edge(), OperationKind::Partition, data_type);
        let participants = Participants { edge, wire: None, sources, targets, streaming: true };
        let inner = MToN::new(
            communicator, plan, participants,
            PartialKind::PassThrough, Accumulator::Collect,
            Sink::Singular(Box::new(receiver)), Box::new(LoadBalanceSelector::new()))?;
        Ok(SPartition { inner })
    }

    /// Queues `value`, choosing its target.
    pub fn partition(&mut self, source: i32, value: &Value, flags: i32) -> Result<bool, CommError> {
        self.inner.send(source, value, flags)
    }
}

implement_operation!(SPartition);

/// Combines values per key, delivering the running value of a key each time it changes.
pub struct SKeyedReduce {
    inner: MToN,
}

impl SKeyedReduce {
    /// Reduces keyed values of `sources` per key with `function`.
    #[allow(clippy::too_many_arguments)]
    pub fn new<F: ReduceFunction + 'static, R: SingularReceiver + 'static>(
        communicator: &mut Communicator,
        plan: Rc<LogicalPlan>,
        sources: Vec<i32>,
        targets: Vec<i32>,
        key_type: MessageType,
        data_type: MessageType,
        function: F,
        receiver: R) -> Result<Self, CommError>
    {
        let function: Rc<dyn ReduceFunction> = Rc::new(function);
        let edge = Edge::keyed(communicator.next_edge(), OperationKind::KeyedReduce, key_type, data_type);
        let participants = Participants { edge, wire: None, sources, targets, streaming: true };
        let inner = MToN::new(
            communicator, plan, participants,
            PartialKind::KeyedReduce(Rc::clone(&function)), Accumulator::KeyedReduce(function),
            Sink::Singular(Box::new(receiver)), Box::new(HashingSelector::new()))?;
        Ok(SKeyedReduce { inner })
    }

    /// Folds `value` into the running value of `key`.
    pub fn reduce<K: Into<Value>, V: Into<Value>>(&mut self, source: i32, key: K, value: V, flags: i32) -> Result<bool, CommError> {
        self.inner.send(source, &Value::tuple(key, value), flags)
    }
}

implement_operation!(SKeyedReduce);
