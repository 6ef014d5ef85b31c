//! The final stage: per-target accumulation, sync tracking and delivery downstream.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use crate::codec::{flags, Value};
use crate::logging::{CommunicationLogger, OperationEvent, OperationEventKind};

use super::join::{JoinStage, Relation};
use super::{barrier_of, BulkReceiver, Delivery, KeyOrder, KeyedCombiner, ReceiverState, ReduceFunction, SingularReceiver, SyncTracker};

/// How arriving values are held for a target.
#[derive(Clone)]
pub enum Accumulator {
    /// Kept as they arrive.
    Collect,
    /// Combined into one value.
    Reduce(Rc<dyn ReduceFunction>),
    /// Combined per key.
    KeyedReduce(Rc<dyn ReduceFunction>),
    /// Grouped per key, delivered as `(key, List(values))`: in key order when an order is
    /// given, otherwise in the order keys first arrived.
    KeyedGather(Option<KeyOrder>),
}

/// Where a target's values go once delivered.
pub enum Sink {
    /// Every value of a target at once.
    Bulk(Box<dyn BulkReceiver>),
    /// Values one at a time, as they arrive.
    Singular(Box<dyn SingularReceiver>),
    /// One side of a join.
    Join(Rc<RefCell<JoinStage>>, Relation),
}

#[derive(Default)]
struct Groups {
    index: HashMap<Value, usize>,
    groups: Vec<(Value, Vec<Value>)>,
    order: Option<KeyOrder>,
}

impl Groups {
    fn add(&mut self, key: Value, value: Value) {
        match self.index.get(&key) {
            Some(position) => self.groups[*position].1.push(value),
            None => {
                self.index.insert(key.clone(), self.groups.len());
                self.groups.push((key, vec![value]));
            },
        }
    }

    fn take(&mut self) -> Vec<Value> {
        self.index.clear();
        if let Some(order) = &self.order {
            self.groups.sort_by(|a, b| order(&a.0, &b.0));
        }
        self.groups.drain(..).map(|(key, values)| Value::tuple(key, Value::List(values))).collect()
    }
}

enum Held {
    Values(Vec<Value>),
    Combined(Option<Value>),
    Keyed(KeyedCombiner),
    Grouped(Groups),
}

impl Held {
    fn new(accumulator: &Accumulator) -> Self {
        match accumulator {
            Accumulator::Collect => Held::Values(Vec::new()),
            Accumulator::Reduce(_) => Held::Combined(None),
            Accumulator::KeyedReduce(_) => Held::Keyed(KeyedCombiner::default()),
            Accumulator::KeyedGather(order) => Held::Grouped(Groups { order: order.clone(), ..Groups::default() }),
        }
    }

    fn take(&mut self) -> Vec<Value> {
        match self {
            Held::Values(values) => std::mem::take(values),
            Held::Combined(value) => value.take().into_iter().collect(),
            Held::Keyed(keyed) => keyed.take(keyed.len()),
            Held::Grouped(groups) => groups.take(),
        }
    }
}

/// The final stage of one operation on one worker.
///
/// Tracks, for each target hosted here, the syncs of every source expected to reach it. In
/// batch mode a target's values are held until its last sync arrives, then delivered with the
/// target's own sync. In streaming mode values go downstream as they arrive and the sync
/// follows once all sources have synced.
pub struct FinalReceiver {
    edge: u32,
    accumulator: Accumulator,
    sink: Sink,
    streaming: bool,
    tracker: SyncTracker,
    held: BTreeMap<i32, Held>,
    /// Batch output taken from `held` but refused by the sink.
    ready: BTreeMap<i32, Vec<Value>>,
    outbox: VecDeque<(i32, Value)>,
    outbox_capacity: usize,
    logger: Option<CommunicationLogger>,
}

impl FinalReceiver {

    /// A final stage for the targets of `expected`, each paired with the sources it waits for.
    pub fn new(
        edge: u32,
        expected: Vec<(i32, Vec<i32>)>,
        accumulator: Accumulator,
        mut sink: Sink,
        streaming: bool,
        outbox_capacity: usize,
        logger: Option<CommunicationLogger>) -> Self
    {
        let mut tracker = SyncTracker::new();
        let mut held = BTreeMap::new();
        for (target, sources) in expected {
            tracker.expect(target, sources);
            held.insert(target, Held::new(&accumulator));
        }
        let targets: Vec<i32> = tracker.targets().collect();
        match &mut sink {
            Sink::Bulk(receiver) => receiver.init(&targets),
            Sink::Singular(receiver) => receiver.init(&targets),
            Sink::Join(..) => { },
        }
        FinalReceiver {
            edge,
            accumulator,
            sink,
            streaming,
            tracker,
            held,
            ready: BTreeMap::new(),
            outbox: VecDeque::new(),
            outbox_capacity: std::cmp::max(outbox_capacity, 1),
            logger,
        }
    }

    /// The sync tracker.
    pub fn tracker(&self) -> &SyncTracker { &self.tracker }

    /// The state of `target`.
    pub fn state(&self, target: i32) -> ReceiverState { self.tracker.state(target) }

    fn log(&self, kind: OperationEventKind) {
        if let Some(logger) = &self.logger {
            logger.log(OperationEvent { edge: self.edge, kind });
        }
    }

    fn absorb(&mut self, target: i32, value: Value) {
        let accumulator = self.accumulator.clone();
        let Some(held) = self.held.get_mut(&target) else { return; };
        match (held, &accumulator) {
            (Held::Values(values), _) => values.push(value),
            (Held::Combined(current), Accumulator::Reduce(function)) => {
                *current = Some(match current.take() {
                    Some(previous) => function.reduce(previous, value),
                    None => value,
                });
            },
            (Held::Keyed(keyed), Accumulator::KeyedReduce(function)) => {
                if let Some((key, value)) = value.into_pair() {
                    let running = keyed.combine(key.clone(), value, &**function).clone();
                    if self.streaming {
                        self.outbox.push_back((target, Value::tuple(key, running)));
                    }
                }
            },
            (Held::Grouped(groups), _) => {
                if let Some((key, value)) = value.into_pair() {
                    groups.add(key, value);
                }
            },
            _ => { },
        }
    }

    /// Delivers what can be delivered. Returns true if anything moved.
    pub fn progress(&mut self) -> bool {
        if self.streaming {
            self.progress_streaming()
        }
        else {
            self.progress_batch()
        }
    }

    fn progress_streaming(&mut self) -> bool {
        let mut moved = false;
        while let Some((target, value)) = self.outbox.pop_front() {
            let refused = match &mut self.sink {
                Sink::Singular(receiver) => receiver.receive(target, value).err(),
                Sink::Bulk(receiver) => receiver.receive(target, vec![value]).err().and_then(|mut v| v.pop()),
                Sink::Join(stage, relation) => {
                    stage.borrow_mut().add(*relation, target, vec![value]);
                    None
                },
            };
            if let Some(value) = refused {
                self.outbox.push_front((target, value));
                break;
            }
            moved = true;
        }
        for target in self.tracker.ready() {
            if self.outbox.iter().any(|(t, _)| *t == target) {
                continue;
            }
            if self.sync_sink(target) {
                moved = true;
            }
        }
        moved
    }

    fn progress_batch(&mut self) -> bool {
        let mut moved = false;
        for target in self.tracker.ready() {
            let values = match self.ready.remove(&target) {
                Some(values) => values,
                None => self.held.get_mut(&target).map(|held| held.take()).unwrap_or_default(),
            };
            if !values.is_empty() {
                let refused = match &mut self.sink {
                    Sink::Bulk(receiver) => receiver.receive(target, values).err(),
                    Sink::Singular(receiver) => {
                        let mut rest = None;
                        let mut pending = values.into_iter();
                        while let Some(value) = pending.next() {
                            if let Err(value) = receiver.receive(target, value) {
                                let mut remaining = vec![value];
                                remaining.extend(pending.by_ref());
                                rest = Some(remaining);
                            }
                        }
                        rest
                    },
                    Sink::Join(stage, relation) => {
                        stage.borrow_mut().add(*relation, target, values);
                        None
                    },
                };
                if let Some(refused) = refused {
                    self.ready.insert(target, refused);
                    continue;
                }
                moved = true;
            }
            if self.sync_sink(target) {
                moved = true;
            }
            else {
                self.ready.insert(target, Vec::new());
            }
        }
        moved
    }

    /// Offers the sync of `target` downstream, moving it to `SyncsSent` if accepted.
    fn sync_sink(&mut self, target: i32) -> bool {
        let barrier = self.tracker.barrier(target).map(|b| b.to_vec());
        let accepted = match &mut self.sink {
            Sink::Bulk(receiver) => receiver.sync(target, barrier.as_deref()),
            Sink::Singular(receiver) => receiver.sync(target, barrier.as_deref()),
            Sink::Join(stage, relation) => {
                stage.borrow_mut().sync(*relation, target, barrier.as_deref());
                true
            },
        };
        if accepted {
            self.tracker.set_state(target, ReceiverState::SyncsSent);
            self.log(OperationEventKind::Delivered { target });
        }
        accepted
    }

    /// True once every target here delivered its sync and nothing waits in the outbox.
    pub fn is_complete(&self) -> bool {
        self.tracker.all_sent() && self.outbox.is_empty()
    }

    /// Forgets every value and sync.
    pub fn reset(&mut self) {
        self.tracker.reset();
        for held in self.held.values_mut() {
            *held = Held::new(&self.accumulator);
        }
        self.ready.clear();
        self.outbox.clear();
    }
}

impl Delivery for FinalReceiver {
    fn deliver(&mut self, source: i32, target: i32, message_flags: i32, payload: &mut Vec<Value>) -> bool {
        if !self.tracker.contains(target) {
            // not hosted here; nothing to do.
            payload.clear();
            return true;
        }
        if flags::is_sync(message_flags) {
            if self.tracker.record_sync(target, source, barrier_of(message_flags, payload)) {
                self.log(OperationEventKind::AllSyncs { target });
            }
            payload.clear();
            return true;
        }
        if self.streaming && self.outbox.len() >= self.outbox_capacity {
            return false;
        }
        self.tracker.record_data(target);
        for value in payload.drain(..) {
            if self.streaming && !matches!(self.accumulator, Accumulator::KeyedReduce(_)) {
                self.outbox.push_back((target, value));
            }
            else {
                self.absorb(target, value);
            }
        }
        true
    }
}
