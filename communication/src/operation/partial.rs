//! The partial stage: per-worker batching and pre-aggregation ahead of the network.

use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use crate::codec::{flags, Value};
use crate::error::CommError;

use super::delegate::{DataFlowChannel, Lane};
use super::{barrier_of, Delivery, KeyedCombiner, ReceiverState, ReduceFunction, SyncTracker};

/// What the partial stage does with the values of a target.
#[derive(Clone)]
pub enum PartialKind {
    /// Batches values unchanged.
    PassThrough,
    /// Batches values tagged with their source, as `(source, value)`.
    Gather,
    /// Combines all values into one.
    Reduce(Rc<dyn ReduceFunction>),
    /// Combines values per key.
    KeyedReduce(Rc<dyn ReduceFunction>),
}

impl std::fmt::Debug for PartialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PartialKind::PassThrough => "PassThrough",
            PartialKind::Gather => "Gather",
            PartialKind::Reduce(_) => "Reduce",
            PartialKind::KeyedReduce(_) => "KeyedReduce",
        };
        f.write_str(name)
    }
}

/// Where the partial stage sends its output.
pub trait PartialSink {
    /// True if a message of `message_flags` for `target` would be accepted now.
    fn has_room(&self, target: i32, message_flags: i32) -> bool;

    /// Offers a message. On `Ok(false)` the payload is left untouched.
    fn offer(&mut self, source: i32, target: i32, message_flags: i32, payload: &mut Vec<Value>) -> Result<bool, CommError>;
}

impl PartialSink for DataFlowChannel {
    fn has_room(&self, target: i32, message_flags: i32) -> bool {
        DataFlowChannel::has_room(self, Lane::Partial, target, message_flags)
    }

    fn offer(&mut self, source: i32, target: i32, message_flags: i32, payload: &mut Vec<Value>) -> Result<bool, CommError> {
        if !DataFlowChannel::has_room(self, Lane::Partial, target, message_flags) {
            return Ok(false);
        }
        self.send_message(Lane::Partial, source, target, message_flags, std::mem::take(payload))
    }
}

/// Values held for one target.
enum Staged {
    Values(VecDeque<Value>),
    Combined(Option<Value>),
    Keyed(KeyedCombiner),
}

impl Staged {
    fn len(&self) -> usize {
        match self {
            Staged::Values(values) => values.len(),
            Staged::Combined(value) => usize::from(value.is_some()),
            Staged::Keyed(keyed) => keyed.len(),
        }
    }
}

/// A message waiting to leave the partial stage.
struct PendingSync {
    source: i32,
    flags: i32,
    payload: Vec<Value>,
}

/// The partial stage of one worker for one operation.
///
/// Accepts the values and syncs of the worker's own sources. Values are staged per target and
/// leave in messages of at most `grouping_size` items. Before forwarding a source's sync for a
/// target, everything staged for that target is flushed, so the sync stays the last thing the
/// target sees from the source.
pub struct PartialReceiver {
    kind: PartialKind,
    grouping_size: usize,
    streaming: bool,
    tracker: SyncTracker,
    staged: BTreeMap<i32, Staged>,
    pending_syncs: BTreeMap<i32, VecDeque<PendingSync>>,
    /// Source stamped on data messages; syncs carry their own source.
    representative: i32,
}

impl PartialReceiver {

    /// A partial stage for `local_sources`, sending to `targets`.
    pub fn new(kind: PartialKind, local_sources: &[i32], targets: &[i32], grouping_size: usize, streaming: bool) -> Self {
        let mut tracker = SyncTracker::new();
        for target in targets {
            tracker.expect(*target, local_sources.iter().copied());
        }
        let mut receiver = PartialReceiver {
            kind,
            grouping_size: std::cmp::max(grouping_size, 1),
            streaming,
            tracker,
            staged: BTreeMap::new(),
            pending_syncs: BTreeMap::new(),
            representative: local_sources.iter().copied().min().unwrap_or(-1),
        };
        for target in targets {
            let staged = receiver.empty_staged();
            receiver.staged.insert(*target, staged);
        }
        receiver
    }

    fn empty_staged(&self) -> Staged {
        match self.kind {
            PartialKind::PassThrough | PartialKind::Gather => Staged::Values(VecDeque::new()),
            PartialKind::Reduce(_) => Staged::Combined(None),
            PartialKind::KeyedReduce(_) => Staged::Keyed(KeyedCombiner::default()),
        }
    }

    fn absorb(&mut self, source: i32, target: i32, value: Value) {
        let kind = self.kind.clone();
        let Some(staged) = self.staged.get_mut(&target) else { return; };
        match (staged, &kind) {
            (Staged::Values(values), PartialKind::Gather) => values.push_back(Value::tuple(source, value)),
            (Staged::Values(values), _) => values.push_back(value),
            (Staged::Combined(current), PartialKind::Reduce(function)) => {
                *current = Some(match current.take() {
                    Some(previous) => function.reduce(previous, value),
                    None => value,
                });
            },
            (Staged::Keyed(keyed), PartialKind::KeyedReduce(function)) => {
                if let Some((key, value)) = value.into_pair() {
                    keyed.combine(key, value, &**function);
                }
            },
            _ => { },
        }
    }

    fn take_chunk(&mut self, target: i32) -> Vec<Value> {
        let count = self.grouping_size;
        match self.staged.get_mut(&target) {
            Some(Staged::Values(values)) => {
                let count = std::cmp::min(count, values.len());
                values.drain(.. count).collect()
            },
            Some(Staged::Combined(value)) => value.take().into_iter().collect(),
            Some(Staged::Keyed(keyed)) => keyed.take(count),
            None => Vec::new(),
        }
    }

    fn restore_chunk(&mut self, source: i32, target: i32, chunk: Vec<Value>) {
        if let Some(Staged::Values(values)) = self.staged.get_mut(&target) {
            for value in chunk.into_iter().rev() {
                values.push_front(value);
            }
            return;
        }
        for value in chunk {
            self.absorb(source, target, value);
        }
    }

    fn staged_len(&self, target: i32) -> usize {
        self.staged.get(&target).map(|s| s.len()).unwrap_or(0)
    }

    fn should_flush(&self, target: i32) -> bool {
        if self.streaming || self.pending_syncs.get(&target).map(|q| !q.is_empty()).unwrap_or(false) {
            return true;
        }
        match self.kind {
            PartialKind::Reduce(_) => false,
            _ => self.staged_len(target) >= self.grouping_size,
        }
    }

    /// Sends staged values and pending syncs to `out`. Returns true if anything moved.
    pub fn progress(&mut self, out: &mut dyn PartialSink) -> Result<bool, CommError> {
        let mut moved = false;
        let targets: Vec<i32> = self.staged.keys().copied().collect();
        'targets: for target in targets {
            if self.should_flush(target) {
                while self.staged_len(target) > 0 {
                    if !out.has_room(target, flags::ORIGIN_PARTIAL) {
                        continue 'targets;
                    }
                    let mut chunk = self.take_chunk(target);
                    if !out.offer(self.representative, target, flags::ORIGIN_PARTIAL, &mut chunk)? {
                        self.restore_chunk(self.representative, target, chunk);
                        continue 'targets;
                    }
                    moved = true;
                }
            }
            if self.staged_len(target) > 0 {
                continue;
            }
            if let Some(queue) = self.pending_syncs.get_mut(&target) {
                while let Some(sync) = queue.front_mut() {
                    let sync_flags = (sync.flags & !flags::ORIGIN_SENDER) | flags::ORIGIN_PARTIAL;
                    if !out.offer(sync.source, target, sync_flags, &mut sync.payload)? {
                        break;
                    }
                    queue.pop_front();
                    moved = true;
                }
                if queue.is_empty() && self.tracker.state(target) == ReceiverState::AllSyncsReceived {
                    self.tracker.set_state(target, ReceiverState::SyncsSent);
                }
            }
        }
        Ok(moved)
    }

    /// True if nothing is staged and no sync waits to be forwarded.
    pub fn is_idle(&self) -> bool {
        self.staged.values().all(|s| s.len() == 0) && self.pending_syncs.values().all(|q| q.is_empty())
    }

    /// True once every local source has synced with every target.
    pub fn all_synced(&self) -> bool {
        let targets: Vec<i32> = self.tracker.targets().collect();
        targets.into_iter().all(|target| self.tracker.all_synced(target))
    }

    /// Drops staged values, pending syncs and sync records.
    pub fn reset(&mut self) {
        let targets: Vec<i32> = self.staged.keys().copied().collect();
        for target in targets {
            let staged = self.empty_staged();
            self.staged.insert(target, staged);
        }
        self.pending_syncs.clear();
        self.tracker.reset();
    }
}

impl Delivery for PartialReceiver {
    fn deliver(&mut self, source: i32, target: i32, message_flags: i32, payload: &mut Vec<Value>) -> bool {
        if flags::is_sync(message_flags) {
            self.tracker.record_sync(target, source, barrier_of(message_flags, payload));
            self.pending_syncs.entry(target).or_default().push_back(PendingSync {
                source,
                flags: message_flags,
                payload: std::mem::take(payload),
            });
            return true;
        }
        // a reduction folds into one staged value, so it never fills up.
        let folds = matches!(self.kind, PartialKind::Reduce(_));
        if !folds && self.staged_len(target) >= self.grouping_size {
            return false;
        }
        self.tracker.record_data(target);
        for value in payload.drain(..) {
            self.absorb(source, target, value);
        }
        true
    }
}
