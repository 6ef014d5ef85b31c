//! Many sources to many targets through a partial and a final stage.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use crate::codec::{flags, Value};
use crate::communicator::Communicator;
use crate::codec::MessageSchema;
use crate::edge::Edge;
use crate::error::CommError;
use crate::initialize::PartitionAlgorithm;
use crate::routing::{DestinationSelector, LogicalPlan};

use super::delegate::{DataFlowChannel, Lane};
use super::partial::{PartialKind, PartialReceiver};
use super::receiver::{Accumulator, FinalReceiver, Sink};
use super::ring::RingStager;
use super::{user_flags, Finishing};

/// The participants and typing of an operation.
pub(crate) struct Participants {
    /// The edge as seen by senders; values are checked against it.
    pub edge: Edge,
    /// The edge as carried on the wire, when the partial stage changes the value shape.
    pub wire: Option<Edge>,
    pub sources: Vec<i32>,
    pub targets: Vec<i32>,
    pub streaming: bool,
}

/// An M-to-N exchange.
///
/// Sources hand values to the partial stage of their worker, which batches or pre-combines
/// them per target. Partial output travels, either at once or in ring order across
/// destination workers, to the final stage of each target's worker.
pub(crate) struct MToN {
    edge: Edge,
    delegate: DataFlowChannel,
    partial: Option<PartialReceiver>,
    ring: Option<RingStager>,
    finals: FinalReceiver,
    selector: Box<dyn DestinationSelector>,
    sources: Vec<i32>,
    targets: Vec<i32>,
    local_sources: BTreeSet<i32>,
    finishing: BTreeMap<i32, Finishing>,
    streaming: bool,
    closed: bool,
}

impl MToN {

    pub fn new(
        communicator: &mut Communicator,
        plan: Rc<LogicalPlan>,
        participants: Participants,
        partial_kind: PartialKind,
        accumulator: Accumulator,
        sink: Sink,
        mut selector: Box<dyn DestinationSelector>) -> Result<Self, CommError>
    {
        let Participants { edge, wire, sources, targets, streaming } = participants;
        plan.check_all(&sources)?;
        plan.check_all(&targets)?;

        let this = plan.this_worker();
        let config = communicator.config().clone();
        let algorithm = if streaming { config.stream_partition_algorithm } else { config.batch_partition_algorithm };

        let local_sources: BTreeSet<i32> = sources.iter().copied().filter(|s| plan.worker_of(*s).ok() == Some(this)).collect();
        let local_targets: Vec<i32> = targets.iter().copied().filter(|t| plan.worker_of(*t).ok() == Some(this)).collect();

        let mut receive_from = BTreeSet::new();
        if !local_targets.is_empty() {
            for source in sources.iter() {
                receive_from.insert(plan.worker_of(*source)?);
            }
        }

        let delegate = DataFlowChannel::new(
            wire.unwrap_or(edge),
            communicator.channel(),
            Rc::clone(&plan),
            config.send_pending_max,
            receive_from,
            communicator.logger(),
        );

        let local: Vec<i32> = local_sources.iter().copied().collect();
        let (partial, ring) = if local.is_empty() {
            (None, None)
        }
        else {
            let ring = match algorithm {
                PartitionAlgorithm::Ring => Some(RingStager::new(&plan, &targets, config.grouping_size)?),
                PartitionAlgorithm::Simple => None,
            };
            (Some(PartialReceiver::new(partial_kind, &local, &targets, config.grouping_size, streaming)), ring)
        };

        let expected = local_targets.iter().map(|target| (*target, sources.clone())).collect();
        let finals = FinalReceiver::new(
            edge.id(),
            expected,
            accumulator,
            sink,
            streaming,
            config.grouping_size * config.send_pending_max,
            communicator.logger(),
        );

        selector.prepare(&sources, &targets, edge.key_type(), edge.data_type());

        Ok(MToN {
            edge,
            delegate,
            partial,
            ring,
            finals,
            selector,
            sources,
            targets,
            local_sources,
            finishing: BTreeMap::new(),
            streaming,
            closed: false,
        })
    }

    pub fn edge(&self) -> &Edge { &self.edge }

    fn check_open(&self) -> Result<(), CommError> {
        if self.closed {
            return Err(CommError::Closed { edge: self.edge.id() });
        }
        match self.delegate.failure() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn check_source(&self, source: i32) -> Result<(), CommError> {
        if self.local_sources.contains(&source) {
            Ok(())
        }
        else {
            Err(CommError::NotParticipant { task: source, role: "source" })
        }
    }

    /// Queues `value` from `source`, as chosen by the selector.
    pub fn send(&mut self, source: i32, value: &Value, message_flags: i32) -> Result<bool, CommError> {
        self.check_open()?;
        self.check_source(source)?;
        self.edge.check(value)?;
        let target = match (self.edge.key_type(), value.as_pair()) {
            (Some(_), Some((key, data))) => self.selector.next_keyed(source, key, data)?,
            _ => self.selector.next(source, value)?,
        };
        self.send_to(source, target, value.clone(), message_flags)
    }

    /// Queues `value` from `source` for `target`, bypassing the selector.
    pub fn send_to(&mut self, source: i32, target: i32, value: Value, message_flags: i32) -> Result<bool, CommError> {
        self.check_open()?;
        self.check_source(source)?;
        let message_flags = user_flags(message_flags) | flags::ORIGIN_SENDER;
        let lane = Lane::Source(source);
        if !self.delegate.has_room(lane, target, message_flags) {
            return Ok(false);
        }
        let accepted = self.delegate.send_message(lane, source, target, message_flags, vec![value])?;
        if accepted {
            self.selector.commit(source, target);
        }
        Ok(accepted)
    }

    /// Queues the syncs of `source` towards every target, with `barrier` if given.
    ///
    /// A batch exchange syncs once per run. A streaming exchange starts a new round of syncs
    /// with every call made after the previous round was queued.
    pub fn finish(&mut self, source: i32, barrier: Option<&[u8]>) -> Result<bool, CommError> {
        self.check_open()?;
        self.check_source(source)?;
        if self.streaming && self.finishing.get(&source).map(|f| f.is_done()).unwrap_or(false) {
            self.finishing.remove(&source);
        }
        let targets = &self.targets;
        let finishing = self.finishing.entry(source)
            .or_insert_with(|| Finishing::new(targets.iter().copied(), flags::ORIGIN_SENDER, barrier));
        finishing.advance(&mut self.delegate, source)
    }

    pub fn progress(&mut self) -> bool {
        if self.closed || self.delegate.failure().is_some() {
            return false;
        }
        match self.progress_stages() {
            Ok(moved) => moved,
            Err(error) => {
                self.delegate.fail(error);
                false
            },
        }
    }

    fn progress_stages(&mut self) -> Result<bool, CommError> {
        let mut moved = false;
        if let Some(partial) = self.partial.as_mut() {
            moved |= self.delegate.progress_lanes(false, partial)?;
            moved |= match self.ring.as_mut() {
                Some(ring) => partial.progress(ring)?,
                None => partial.progress(&mut self.delegate)?,
            };
        }
        if let Some(ring) = self.ring.as_mut() {
            moved |= ring.progress(&mut self.delegate)?;
        }
        moved |= self.delegate.progress_lanes(true, &mut self.finals)?;
        moved |= self.delegate.progress_receive(&mut self.finals)?;
        moved |= self.finals.progress();
        self.delegate.refresh_degraded();
        Ok(moved)
    }

    pub fn progress_channel(&mut self) -> bool {
        let active = self.delegate.channel().borrow_mut().progress();
        self.progress() | active
    }

    /// True once every local source finished, nothing is queued, and every local target
    /// delivered its sync.
    pub fn is_complete(&self) -> bool {
        self.local_sources.iter().all(|s| self.finishing.get(s).map(|f| f.is_done()).unwrap_or(false))
            && self.partial.as_ref().map(|p| p.is_idle()).unwrap_or(true)
            && self.ring.as_ref().map(|r| r.is_idle()).unwrap_or(true)
            && self.delegate.is_idle()
            && self.finals.is_complete()
    }

    pub fn reset(&mut self) {
        self.delegate.reset();
        if let Some(partial) = self.partial.as_mut() { partial.reset(); }
        if let Some(ring) = self.ring.as_mut() { ring.reset(); }
        self.finals.reset();
        self.finishing.clear();
        self.selector.prepare(&self.sources, &self.targets, self.edge.key_type(), self.edge.data_type());
    }

    pub fn close(&mut self) {
        self.reset();
        self.closed = true;
    }

    pub fn error(&self) -> Option<&CommError> { self.delegate.error() }

    /// Sets the schema hints of the edge as carried on the wire.
    pub fn set_schema(&mut self, schema: MessageSchema) -> Result<(), CommError> {
        self.delegate.set_schema(schema)?;
        self.edge = self.edge.with_schema(schema);
        Ok(())
    }

    pub fn degraded_workers(&self) -> Vec<usize> { self.delegate.degraded_workers() }
}
