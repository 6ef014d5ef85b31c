//! Batch operations: targets receive everything at once, after every source has synced.
//!
//! # Examples
//!
//! A keyed sum over four sources on a single worker.
//!
//! ```
//! use std::cell::RefCell;
//! use std::collections::HashMap;
//! use std::rc::Rc;
//!
//! use weft_communication::{BulkReceiver, Communicator, Config, DataFlowOperation, MessageType, Value};
//! use weft_communication::operation::BKeyedReduce;
//! use weft_communication::routing::LogicalPlanBuilder;
//!
//! struct Totals(Rc<RefCell<HashMap<String, i32>>>);
//!
//! impl BulkReceiver for Totals {
//!     fn receive(&mut self, _target: i32, values: Vec<Value>) -> Result<(), Vec<Value>> {
//!         for (key, value) in values.into_iter().filter_map(Value::into_pair) {
//!             let key = key.as_str().unwrap_or_default().to_owned();
//!             self.0.borrow_mut().insert(key, value.as_integer().unwrap_or_default());
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let mut communicator = Communicator::bind(Config::local(0, 1), 0, "127.0.0.1:0").unwrap();
//! let plan = Rc::new(LogicalPlanBuilder::new(0).blocks(1, 5).build());
//! let totals = Rc::new(RefCell::new(HashMap::new()));
//!
//! let sum = |a: Value, b: Value| Value::Integer(a.as_integer().unwrap_or(0) + b.as_integer().unwrap_or(0));
//! let mut reduce = BKeyedReduce::new(
//!     &mut communicator, plan, vec![0, 1, 2, 3], vec![4],
//!     MessageType::String, MessageType::Integer, sum, Totals(Rc::clone(&totals))).unwrap();
//!
//! for source in 0 .. 4 {
//!     for key in ["a", "b"] {
//!         while !reduce.reduce(source, key, 1, 0).unwrap() {
//!             reduce.progress();
//!         }
//!     }
//!     while !reduce.finish(source).unwrap() {
//!         reduce.progress();
//!     }
//! }
//! while !reduce.is_complete() {
//!     reduce.progress();
//! }
//! assert_eq!(totals.borrow()["a"], 4);
//! ```

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use crate::codec::{MessageSchema, MessageType, Value};
use crate::communicator::Communicator;
use crate::edge::{Edge, OperationKind};
use crate::error::CommError;
use crate::routing::{HashingSelector, LoadBalanceSelector, LogicalPlan};

use super::direct::{Fixed, Routes};
use super::join::{JoinAlgorithm, JoinStage, JoinType, Relation};
use super::mton::{MToN, Participants};
use super::partial::PartialKind;
use super::receiver::{Accumulator, Sink};
use super::{BulkReceiver, DataFlowOperation, KeyOrder, ReduceFunction};

/// Each source sends to its paired target.
pub struct BDirect {
    inner: Fixed,
}

impl BDirect {
    /// Pairs `sources[i]` with `targets[i]`.
    pub fn new<R: BulkReceiver + 'static>(
        communicator: &mut Communicator,
        plan: Rc<LogicalPlan>,
        sources: Vec<i32>,
        targets: Vec<i32>,
        data_type: MessageType,
        receiver: R) -> Result<Self, CommError>
    {
        let edge = Edge::new(communicator.next_edge(), OperationKind::Direct, data_type);
        let inner = Fixed::new(communicator, plan, edge, Routes::Pairs(sources, targets), Sink::Bulk(Box::new(receiver)), false)?;
        Ok(BDirect { inner })
    }
}

implement_operation!(BDirect);

/// One source sends every value to every target.
pub struct BBroadcast {
    inner: Fixed,
}

impl BBroadcast {
    /// Broadcasts from `source` to `targets`.
    pub fn new<R: BulkReceiver + 'static>(
        communicator: &mut Communicator,
        plan: Rc<LogicalPlan>,
        source: i32,
        targets: Vec<i32>,
        data_type: MessageType,
        receiver: R) -> Result<Self, CommError>
    {
        let edge = Edge::new(communicator.next_edge(), OperationKind::Broadcast, data_type);
        let inner = Fixed::new(communicator, plan, edge, Routes::Broadcast(source, targets), Sink::Bulk(Box::new(receiver)), false)?;
        Ok(BBroadcast { inner })
    }

    /// Queues `value` for every target. Returns `Ok(false)` if any queue is full.
    pub fn broadcast(&mut self, source: i32, value: &Value, flags: i32) -> Result<bool, CommError> {
        self.inner.send(source, value, flags)
    }
}

implement_operation!(BBroadcast);

/// Spreads values over the targets, round-robin per source.
pub struct BPartition {
    inner: MToN,
}

impl BPartition {
    /// Partitions the values of `sources` over `targets`.
    pub fn new<R: BulkReceiver + 'static>(
        communicator: &mut Communicator,
        plan: Rc<LogicalPlan>,
        sources: Vec<i32>,
        targets: Vec<i32>,
        data_type: MessageType,
        receiver: R) -> Result<Self, CommError>
    {
        let edge = Edge::new(communicator.next_edge(), OperationKind::Partition, data_type);
        let participants = Participants { edge, wire: None, sources, targets, streaming: false };
        let inner = MToN::new(
            communicator, plan, participants,
            PartialKind::PassThrough, Accumulator::Collect,
            Sink::Bulk(Box::new(receiver)), Box::new(LoadBalanceSelector::new()))?;
        Ok(BPartition { inner })
    }

    /// Queues `value`, choosing its target.
    pub fn partition(&mut self, source: i32, value: &Value, flags: i32) -> Result<bool, CommError> {
        self.inner.send(source, value, flags)
    }

    /// Queues `value` for a chosen `target`.
    pub fn partition_to(&mut self, source: i32, target: i32, value: &Value, flags: i32) -> Result<bool, CommError> {
        self.inner.edge().check(value)?;
        self.inner.send_to(source, target, value.clone(), flags)
    }
}

implement_operation!(BPartition);

/// Routes each `(key, value)` to the target owning its key.
pub struct BKeyedPartition {
    inner: MToN,
}

impl BKeyedPartition {
    /// Partitions keyed values of `sources` over `targets` by key hash.
    pub fn new<R: BulkReceiver + 'static>(
        communicator: &mut Communicator,
        plan: Rc<LogicalPlan>,
        sources: Vec<i32>,
        targets: Vec<i32>,
        key_type: MessageType,
        data_type: MessageType,
        receiver: R) -> Result<Self, CommError>
    {
        let edge = Edge::keyed(communicator.next_edge(), OperationKind::KeyedPartition, key_type, data_type);
        let participants = Participants { edge, wire: None, sources, targets, streaming: false };
        let inner = MToN::new(
            communicator, plan, participants,
            PartialKind::PassThrough, Accumulator::Collect,
            Sink::Bulk(Box::new(receiver)), Box::new(HashingSelector::new()))?;
        Ok(BKeyedPartition { inner })
    }

    /// Queues `(key, value)` for the target of `key`.
    pub fn partition<K: Into<Value>, V: Into<Value>>(&mut self, source: i32, key: K, value: V, flags: i32) -> Result<bool, CommError> {
        self.inner.send(source, &Value::tuple(key, value), flags)
    }
}

implement_operation!(BKeyedPartition);

/// Combines every value into one, at a single target.
pub struct BReduce {
    inner: MToN,
}

impl BReduce {
    /// Reduces the values of `sources` with `function`, delivering the result to `target`.
    pub fn new<F: ReduceFunction + 'static, R: BulkReceiver + 'static>(
        communicator: &mut Communicator,
        plan: Rc<LogicalPlan>,
        sources: Vec<i32>,
        target: i32,
        data_type: MessageType,
        function: F,
        receiver: R) -> Result<Self, CommError>
    {
        let function: Rc<dyn ReduceFunction> = Rc::new(function);
        let edge = Edge::new(communicator.next_edge(), OperationKind::Reduce, data_type);
        let participants = Participants { edge, wire: None, sources, targets: vec![target], streaming: false };
        let inner = MToN::new(
            communicator, plan, participants,
            PartialKind::Reduce(Rc::clone(&function)), Accumulator::Reduce(function),
            Sink::Bulk(Box::new(receiver)), Box::new(LoadBalanceSelector::new()))?;
        Ok(BReduce { inner })
    }

    /// Folds `value` into the reduction.
    pub fn reduce(&mut self, source: i32, value: &Value, flags: i32) -> Result<bool, CommError> {
        self.inner.send(source, value, flags)
    }
}

implement_operation!(BReduce);

/// Collects every value at a single target, tagged as `(source, value)`.
pub struct BGather {
    inner: MToN,
}

impl BGather {
    /// Gathers the values of `sources` at `target`.
    pub fn new<R: BulkReceiver + 'static>(
        communicator: &mut Communicator,
        plan: Rc<LogicalPlan>,
        sources: Vec<i32>,
        target: i32,
        data_type: MessageType,
        receiver: R) -> Result<Self, CommError>
    {
        let id = communicator.next_edge();
        let edge = Edge::new(id, OperationKind::Gather, data_type);
        // tagged values are tuples, carried whole.
        let wire = Edge::new(id, OperationKind::Gather, MessageType::Object);
        let participants = Participants { edge, wire: Some(wire), sources, targets: vec![target], streaming: false };
        let inner = MToN::new(
            communicator, plan, participants,
            PartialKind::Gather, Accumulator::Collect,
            Sink::Bulk(Box::new(receiver)), Box::new(LoadBalanceSelector::new()))?;
        Ok(BGather { inner })
    }

    /// Adds `value` to the gathered set.
    pub fn gather(&mut self, source: i32, value: &Value, flags: i32) -> Result<bool, CommError> {
        self.inner.send(source, value, flags)
    }
}

implement_operation!(BGather);

/// Combines values per key, at the target owning each key.
pub struct BKeyedReduce {
    inner: MToN,
}

impl BKeyedReduce {
    /// Reduces keyed values of `sources` per key with `function`.
    #[allow(clippy::too_many_arguments)]
    pub fn new<F: ReduceFunction + 'static, R: BulkReceiver + 'static>(
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
        let participants = Participants { edge, wire: None, sources, targets, streaming: false };
        let inner = MToN::new(
            communicator, plan, participants,
            PartialKind::KeyedReduce(Rc::clone(&function)), Accumulator::KeyedReduce(function),
            Sink::Bulk(Box::new(receiver)), Box::new(HashingSelector::new()))?;
        Ok(BKeyedReduce { inner })
    }

    /// Folds `value` into the reduction of `key`.
    pub fn reduce<K: Into<Value>, V: Into<Value>>(&mut self, source: i32, key: K, value: V, flags: i32) -> Result<bool, CommError> {
        self.inner.send(source, &Value::tuple(key, value), flags)
    }
}

implement_operation!(BKeyedReduce);

/// Groups values per key, at the target owning each key, as `(key, List(values))`.
///
/// Groups leave in the order their keys first arrived, or in key order for a gather built
/// with [`sorted`](BKeyedGather::sorted).
pub struct BKeyedGather {
    inner: MToN,
}

impl BKeyedGather {
    /// Groups keyed values of `sources` per key.
    pub fn new<R: BulkReceiver + 'static>(
        communicator: &mut Communicator,
        plan: Rc<LogicalPlan>,
        sources: Vec<i32>,
        targets: Vec<i32>,
        key_type: MessageType,
        data_type: MessageType,
        receiver: R) -> Result<Self, CommError>
    {
        Self::build(communicator, plan, sources, targets, key_type, data_type, None, receiver)
    }

    /// Like [`new`](BKeyedGather::new), delivering each target's groups sorted by `order`.
    #[allow(clippy::too_many_arguments)]
    pub fn sorted<R: BulkReceiver + 'static>(
        communicator: &mut Communicator,
        plan: Rc<LogicalPlan>,
        sources: Vec<i32>,
        targets: Vec<i32>,
        key_type: MessageType,
        data_type: MessageType,
        order: KeyOrder,
        receiver: R) -> Result<Self, CommError>
    {
        Self::build(communicator, plan, sources, targets, key_type, data_type, Some(order), receiver)
    }

    #[allow(clippy::too_many_arguments)]
    fn build<R: BulkReceiver + 'static>(
        communicator: &mut Communicator,
        plan: Rc<LogicalPlan>,
        sources: Vec<i32>,
        targets: Vec<i32>,
        key_type: MessageType,
        data_type: MessageType,
        order: Option<KeyOrder>,
        receiver: R) -> Result<Self, CommError>
    {
        let edge = Edge::keyed(communicator.next_edge(), OperationKind::KeyedGather, key_type, data_type);
        let participants = Participants { edge, wire: None, sources, targets, streaming: false };
        let inner = MToN::new(
            communicator, plan, participants,
            PartialKind::PassThrough, Accumulator::KeyedGather(order),
            Sink::Bulk(Box::new(receiver)), Box::new(HashingSelector::new()))?;
        Ok(BKeyedGather { inner })
    }

    /// Adds `value` to the group of `key`.
    pub fn gather<K: Into<Value>, V: Into<Value>>(&mut self, source: i32, key: K, value: V, flags: i32) -> Result<bool, CommError> {
        self.inner.send(source, &Value::tuple(key, value), flags)
    }
}

implement_operation!(BKeyedGather);

/// The sources and value type of one side of a join.
#[derive(Clone, Debug)]
pub struct JoinInput {
    /// Tasks sending on this side.
    pub sources: Vec<i32>,
    /// Type of the values on this side.
    pub data_type: MessageType,
}

/// Joins two keyed inputs per key, at the target owning each key.
///
/// Each side travels on its own edge. A target joins once both sides have synced with it,
/// delivering `(key, (left, right))` tuples, with `Value::Empty` for a side without a match.
/// The [`JoinAlgorithm`] decides whether targets hash or sort-merge the two sides.
pub struct BJoin {
    left: MToN,
    right: MToN,
    stage: Rc<RefCell<JoinStage>>,
}

impl BJoin {
    /// Joins `left` and `right` by keys of `key_type`.
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: BulkReceiver + 'static>(
        communicator: &mut Communicator,
        plan: Rc<LogicalPlan>,
        left: JoinInput,
        right: JoinInput,
        targets: Vec<i32>,
        key_type: MessageType,
        join_type: JoinType,
        algorithm: JoinAlgorithm,
        receiver: R) -> Result<Self, CommError>
    {
        let this = plan.this_worker();
        let local_targets: Vec<i32> = targets.iter().copied().filter(|t| plan.worker_of(*t).ok() == Some(this)).collect();
        let stage = Rc::new(RefCell::new(JoinStage::new(join_type, algorithm, &local_targets, Box::new(receiver))));

        let mut side = |input: JoinInput, relation: Relation| {
            let edge = Edge::keyed(communicator.next_edge(), OperationKind::Join, key_type, input.data_type);
            let participants = Participants { edge, wire: None, sources: input.sources, targets: targets.clone(), streaming: false };
            MToN::new(
                &mut *communicator, Rc::clone(&plan), participants,
                PartialKind::PassThrough, Accumulator::Collect,
                Sink::Join(Rc::clone(&stage), relation), Box::new(HashingSelector::new()))
        };
        let left = side(left, Relation::Left)?;
        let right = side(right, Relation::Right)?;
        Ok(BJoin { left, right, stage })
    }

    /// Sets the wire schema hints of each side; see `with_schema` on the single-edge operations.
    pub fn with_schemas(mut self, left: MessageSchema, right: MessageSchema) -> Result<Self, CommError> {
        self.left.set_schema(left)?;
        self.right.set_schema(right)?;
        Ok(self)
    }

    fn side(&mut self, relation: Relation) -> &mut MToN {
        match relation {
            Relation::Left => &mut self.left,
            Relation::Right => &mut self.right,
        }
    }

    /// Queues `(key, value)` on the `relation` side.
    pub fn join<K: Into<Value>, V: Into<Value>>(&mut self, source: i32, relation: Relation, key: K, value: V, flags: i32) -> Result<bool, CommError> {
        self.side(relation).send(source, &Value::tuple(key, value), flags)
    }

    /// Ends the stream of `source` on the `relation` side.
    pub fn finish_side(&mut self, source: i32, relation: Relation) -> Result<bool, CommError> {
        self.side(relation).finish(source, None)
    }

    fn finish_both(&mut self, source: i32, barrier: Option<&[u8]>) -> Result<bool, CommError> {
        let mut participant = false;
        let mut done = true;
        for side in [&mut self.left, &mut self.right] {
            match side.finish(source, barrier) {
                Ok(finished) => { participant = true; done &= finished; },
                Err(CommError::NotParticipant { .. }) => { },
                Err(error) => return Err(error),
            }
        }
        if !participant {
            return Err(CommError::NotParticipant { task: source, role: "source" });
        }
        Ok(done)
    }
}

impl DataFlowOperation for BJoin {
    fn edge(&self) -> u32 { self.left.edge().id() }

    /// Sends on the left side if `source` feeds it, otherwise on the right.
    fn send(&mut self, source: i32, value: &Value, flags: i32) -> Result<bool, CommError> {
        match self.left.send(source, value, flags) {
            Err(CommError::NotParticipant { .. }) => self.right.send(source, value, flags),
            result => result,
        }
    }

    fn finish(&mut self, source: i32) -> Result<bool, CommError> {
        self.finish_both(source, None)
    }

    fn send_barrier(&mut self, source: i32, barrier: &[u8]) -> Result<bool, CommError> {
        self.finish_both(source, Some(barrier))
    }

    fn progress(&mut self) -> bool {
        let left = self.left.progress();
        let right = self.right.progress();
        let joined = self.stage.borrow_mut().progress();
        left | right | joined
    }

    fn progress_channel(&mut self) -> bool {
        let left = self.left.progress_channel();
        self.progress() | left
    }

    fn is_complete(&self) -> bool {
        self.left.is_complete() && self.right.is_complete() && self.stage.borrow().is_complete()
    }

    fn close(&mut self) {
        self.left.close();
        self.right.close();
        self.stage.borrow_mut().reset();
    }

    fn reset(&mut self) {
        self.left.reset();
        self.right.reset();
        self.stage.borrow_mut().reset();
    }

    fn error(&self) -> Option<&CommError> {
        self.left.error().or_else(|| self.right.error())
    }

    fn degraded_workers(&self) -> Vec<usize> {
        let workers: BTreeSet<usize> = self.left.degraded_workers().into_iter()
            .chain(self.right.degraded_workers())
            .collect();
        workers.into_iter().collect()
    }
}
