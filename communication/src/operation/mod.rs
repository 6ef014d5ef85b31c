//! Collective operations: direct, partition, reduce, gather, join and their keyed variants.
//!
//! Every operation moves values from a set of source tasks to a set of target tasks. Values
//! sent by a source first pass through the *partial stage* of the source's worker, which
//! batches or pre-aggregates them per target, and are then carried to the *final receiver*
//! on the target's worker. Each source ends its stream towards each target with a sync; a
//! target delivers downstream only once every expected source has synced with it.
//!
//! Nothing blocks. A send that cannot be queued returns `Ok(false)`, and the caller retries
//! after calling `progress`.

/// Implements [`DataFlowOperation`] for a type wrapping an exchange in its `inner` field.
macro_rules! implement_operation {
    ($name:ident) => {
        impl $crate::operation::DataFlowOperation for $name {
            fn edge(&self) -> u32 { self.inner.edge().id() }
            fn send(&mut self, source: i32, value: &$crate::codec::Value, flags: i32) -> Result<bool, $crate::error::CommError> {
                self.inner.send(source, value, flags)
            }
            fn finish(&mut self, source: i32) -> Result<bool, $crate::error::CommError> { self.inner.finish(source, None) }
            fn send_barrier(&mut self, source: i32, barrier: &[u8]) -> Result<bool, $crate::error::CommError> {
                self.inner.finish(source, Some(barrier))
            }
            fn progress(&mut self) -> bool { self.inner.progress() }
            fn progress_channel(&mut self) -> bool { self.inner.progress_channel() }
            fn is_complete(&self) -> bool { self.inner.is_complete() }
            fn close(&mut self) { self.inner.close() }
            fn reset(&mut self) { self.inner.reset() }
            fn error(&self) -> Option<&$crate::error::CommError> { self.inner.error() }
            fn degraded_workers(&self) -> Vec<usize> { self.inner.degraded_workers() }
        }

        impl $name {
            /// Sets the schema hints of the edge's wire format, letting fixed-length items
            /// travel without length prefixes. Every worker must set the same schema before
            /// anything is sent.
            pub fn with_schema(mut self, schema: $crate::codec::MessageSchema) -> Result<Self, $crate::error::CommError> {
                self.inner.set_schema(schema)?;
                Ok(self)
            }
        }
    }
}

pub mod delegate;
pub mod partial;
pub mod ring;
pub mod receiver;
pub mod join;
mod mton;
mod direct;
pub mod batch;
pub mod streaming;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::rc::Rc;

use crate::codec::{flags, Value};
use crate::error::CommError;

use self::delegate::{DataFlowChannel, Lane};

pub use self::batch::{BBroadcast, BDirect, BGather, BJoin, BKeyedGather, BKeyedPartition, BKeyedReduce, BPartition, BReduce, JoinInput};
pub use self::join::{JoinAlgorithm, JoinType, Relation};
pub use self::streaming::{SDirect, SKeyedReduce, SPartition};

/// Receives every value for a target at once, after all of its sources have synced.
pub trait BulkReceiver {
    /// Called once, with the targets hosted by this worker.
    fn init(&mut self, _targets: &[i32]) { }

    /// Accepts the values for `target`, or hands them back to be offered again later.
    fn receive(&mut self, target: i32, values: Vec<Value>) -> Result<(), Vec<Value>>;

    /// Reports that `target` has received everything, with the barrier of the last sync if any.
    ///
    /// Returning false asks for the sync to be offered again later.
    fn sync(&mut self, _target: i32, _barrier: Option<&[u8]>) -> bool { true }
}

/// Receives values one at a time, as they arrive.
pub trait SingularReceiver {
    /// Called once, with the targets hosted by this worker.
    fn init(&mut self, _targets: &[i32]) { }

    /// Accepts one value for `target`, or hands it back to be offered again later.
    fn receive(&mut self, target: i32, value: Value) -> Result<(), Value>;

    /// Reports that every source has synced with `target`.
    fn sync(&mut self, _target: i32, _barrier: Option<&[u8]>) -> bool { true }
}

/// Orders keys for sorted delivery and sort-merge joins.
pub type KeyOrder = Rc<dyn Fn(&Value, &Value) -> Ordering>;

/// The natural order of [`Value`] as a [`KeyOrder`].
pub fn natural_order() -> KeyOrder {
    Rc::new(|left: &Value, right: &Value| left.cmp(right))
}

/// Combines two values into one. Must be associative and commutative.
pub trait ReduceFunction {
    /// Combines `left` and `right`.
    fn reduce(&self, left: Value, right: Value) -> Value;
}

impl<F: Fn(Value, Value) -> Value> ReduceFunction for F {
    fn reduce(&self, left: Value, right: Value) -> Value { (self)(left, right) }
}

/// Delivery progress of one target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ReceiverState {
    /// Nothing received.
    #[default]
    Init,
    /// Data or some syncs received.
    Receiving,
    /// A sync has arrived from every expected source.
    AllSyncsReceived,
    /// Data and the target's own sync were delivered downstream.
    SyncsSent,
}

/// Records which sources have synced with which targets.
///
/// A target reaches [`ReceiverState::AllSyncsReceived`] exactly when every expected source has
/// synced, in whatever order the syncs arrived.
///
/// Syncs come in rounds, one per source per round. A sync reaching a target in
/// [`ReceiverState::SyncsSent`] opens the next round. A second sync from a source whose sync
/// already counts towards the current round is held back until that round is delivered.
#[derive(Clone, Debug, Default)]
pub struct SyncTracker {
    expected: BTreeMap<i32, BTreeSet<i32>>,
    synced: BTreeMap<i32, BTreeSet<i32>>,
    barriers: BTreeMap<i32, Vec<u8>>,
    states: BTreeMap<i32, ReceiverState>,
    /// Syncs that belong to a later round, in arrival order.
    deferred: BTreeMap<i32, VecDeque<(i32, Option<Vec<u8>>)>>,
}

impl SyncTracker {
    /// A tracker with no targets.
    pub fn new() -> Self { Self::default() }

    /// Declares that `target` waits for syncs from `sources`.
    pub fn expect<I: IntoIterator<Item=i32>>(&mut self, target: i32, sources: I) {
        self.expected.entry(target).or_default().extend(sources);
        self.states.entry(target).or_default();
    }

    /// The tracked targets, in increasing order.
    pub fn targets(&self) -> impl Iterator<Item=i32> + '_ {
        self.expected.keys().copied()
    }

    /// True if `target` is tracked.
    pub fn contains(&self, target: i32) -> bool { self.expected.contains_key(&target) }

    /// The state of `target`.
    pub fn state(&self, target: i32) -> ReceiverState {
        self.states.get(&target).copied().unwrap_or_default()
    }

    /// Moves `target` to `state`. Moving to `SyncsSent` replays syncs held for the next round.
    pub fn set_state(&mut self, target: i32, state: ReceiverState) {
        if let Some(current) = self.states.get_mut(&target) {
            *current = state;
        }
        if state == ReceiverState::SyncsSent {
            if let Some(deferred) = self.deferred.remove(&target) {
                for (source, barrier) in deferred {
                    self.record_sync(target, source, barrier);
                }
            }
        }
    }

    /// Notes that data arrived for `target`.
    pub fn record_data(&mut self, target: i32) {
        if self.state(target) == ReceiverState::Init {
            self.set_state(target, ReceiverState::Receiving);
        }
    }

    /// Records a sync from `source`; returns true if it was the last one `target` waited for.
    ///
    /// Syncs from sources the target does not expect are ignored.
    pub fn record_sync(&mut self, target: i32, source: i32, barrier: Option<Vec<u8>>) -> bool {
        let expected = match self.expected.get(&target) {
            Some(expected) if expected.contains(&source) => expected.len(),
            _ => return false,
        };
        if self.state(target) == ReceiverState::SyncsSent {
            self.synced.remove(&target);
            self.barriers.remove(&target);
        }
        else if self.synced.get(&target).map(|s| s.contains(&source)).unwrap_or(false) {
            self.deferred.entry(target).or_default().push_back((source, barrier));
            return false;
        }
        let synced = self.synced.entry(target).or_default();
        synced.insert(source);
        let complete = synced.len() == expected;
        if let Some(barrier) = barrier {
            self.barriers.insert(target, barrier);
        }
        let state = if complete { ReceiverState::AllSyncsReceived } else { ReceiverState::Receiving };
        if let Some(current) = self.states.get_mut(&target) {
            *current = state;
        }
        complete
    }

    /// True if every expected source has synced with `target`.
    pub fn all_synced(&self, target: i32) -> bool {
        let synced = self.synced.get(&target).map(|s| s.len()).unwrap_or(0);
        self.expected.get(&target).map(|e| e.len() == synced).unwrap_or(false)
    }

    /// The barrier bytes carried by the latest barrier sync for `target`.
    pub fn barrier(&self, target: i32) -> Option<&[u8]> {
        self.barriers.get(&target).map(|b| &b[..])
    }

    /// Targets whose syncs have all arrived but were not yet delivered.
    pub fn ready(&self) -> Vec<i32> {
        self.states.iter()
            .filter(|(_, state)| **state == ReceiverState::AllSyncsReceived)
            .map(|(target, _)| *target)
            .collect()
    }

    /// True once every tracked target has delivered its sync.
    pub fn all_sent(&self) -> bool {
        self.states.values().all(|state| *state == ReceiverState::SyncsSent)
    }

    /// Forgets every sync and state, keeping the expected sources.
    pub fn reset(&mut self) {
        self.synced.clear();
        self.barriers.clear();
        self.deferred.clear();
        for state in self.states.values_mut() {
            *state = ReceiverState::Init;
        }
    }
}

/// The operations every collective exposes.
pub trait DataFlowOperation {
    /// The id of the operation's edge, or of its first edge.
    fn edge(&self) -> u32;

    /// Sends `value` from `source`. Keyed operations expect `Value::Tuple(key, value)`.
    ///
    /// Returns `Ok(false)` if the value could not be queued; nothing was recorded, and the
    /// send may be retried after `progress`.
    fn send(&mut self, source: i32, value: &Value, flags: i32) -> Result<bool, CommError>;

    /// Ends the stream of `source` towards every target. Returns `Ok(true)` once every sync is
    /// queued; until then, call `progress` and retry.
    fn finish(&mut self, source: i32) -> Result<bool, CommError>;

    /// Like [`finish`](DataFlowOperation::finish), with a barrier delivered alongside the syncs.
    ///
    /// Batch operations sync once per run, and later calls return `Ok(true)` without sending.
    /// Streaming operations send a fresh round of syncs for every call that follows a
    /// completed one, and targets deliver each round's barrier in turn.
    fn send_barrier(&mut self, source: i32, barrier: &[u8]) -> Result<bool, CommError>;

    /// Advances queued work of this operation. Returns true if anything moved.
    fn progress(&mut self) -> bool;

    /// Advances the shared transport, then this operation.
    fn progress_channel(&mut self) -> bool;

    /// True once every target on this worker has delivered its sync, and nothing is queued.
    fn is_complete(&self) -> bool;

    /// Abandons all state and stops the operation.
    fn close(&mut self);

    /// Abandons all state so the operation can run again.
    fn reset(&mut self);

    /// The error that stopped the operation, if any.
    fn error(&self) -> Option<&CommError>;

    /// Workers whose connections failed.
    fn degraded_workers(&self) -> Vec<usize>;
}

/// Accepts messages on behalf of a stage of an operation.
pub trait Delivery {
    /// Offers a message; on `false` the payload is left untouched and offered again later.
    fn deliver(&mut self, source: i32, target: i32, flags: i32, payload: &mut Vec<Value>) -> bool;
}

/// Values combined per key, remembering the order keys first appeared in.
#[derive(Debug, Default)]
pub(crate) struct KeyedCombiner {
    index: HashMap<Value, usize>,
    entries: Vec<(Value, Value)>,
}

impl KeyedCombiner {
    /// Folds `value` into the entry for `key`, returning the combined value.
    pub fn combine(&mut self, key: Value, value: Value, function: &dyn ReduceFunction) -> &Value {
        let position = match self.index.get(&key) {
            Some(position) => {
                let slot = &mut self.entries[*position].1;
                let current = std::mem::replace(slot, Value::Empty);
                *slot = function.reduce(current, value);
                *position
            },
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
                self.entries.len() - 1
            },
        };
        &self.entries[position].1
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Removes up to `count` entries, oldest first, as `(key, value)` tuples.
    pub fn take(&mut self, count: usize) -> Vec<Value> {
        let count = std::cmp::min(count, self.entries.len());
        let taken: Vec<Value> = self.entries.drain(.. count).map(|(k, v)| Value::Tuple(Box::new(k), Box::new(v))).collect();
        self.index = self.entries.iter().enumerate().map(|(i, (k, _))| (k.clone(), i)).collect();
        taken
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.entries.clear();
    }
}

/// The syncs a source still has to queue, one per target.
#[derive(Debug)]
pub(crate) struct Finishing {
    remaining: VecDeque<i32>,
    flags: i32,
    payload: Vec<Value>,
}

impl Finishing {
    /// Syncs towards `targets`, carrying `barrier` if given. `origin` is OR-ed into the flags.
    pub fn new<I: IntoIterator<Item=i32>>(targets: I, origin: i32, barrier: Option<&[u8]>) -> Self {
        let (kind, payload) = match barrier {
            Some(bytes) => (flags::SYNC_BARRIER, vec![Value::Bytes(bytes.to_vec())]),
            None => (flags::SYNC_EMPTY, Vec::new()),
        };
        Finishing { remaining: targets.into_iter().collect(), flags: origin | kind, payload }
    }

    /// Queues as many of the syncs of `source` as fit. Returns true once all are queued.
    pub fn advance(&mut self, delegate: &mut DataFlowChannel, source: i32) -> Result<bool, CommError> {
        while let Some(target) = self.remaining.front() {
            if !delegate.send_message(Lane::Source(source), source, *target, self.flags, self.payload.clone())? {
                return Ok(false);
            }
            self.remaining.pop_front();
        }
        Ok(true)
    }

    pub fn is_done(&self) -> bool { self.remaining.is_empty() }
}

/// Keeps only the application bits of user supplied flags.
pub(crate) fn user_flags(message_flags: i32) -> i32 {
    message_flags & !(flags::ORIGIN_SENDER | flags::ORIGIN_PARTIAL | flags::SYNC_EMPTY | flags::SYNC_BARRIER)
}

/// The barrier bytes of a sync message's payload.
pub(crate) fn barrier_of(message_flags: i32, payload: &[Value]) -> Option<Vec<u8>> {
    if message_flags & flags::SYNC_BARRIER != 0 {
        payload.first().and_then(|value| value.as_bytes()).map(|bytes| bytes.to_vec())
    }
    else {
        None
    }
}
