//! Exchanges with fixed routes: paired sources and targets, and broadcast.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use crate::codec::{flags, MessageSchema, Value};
use crate::communicator::Communicator;
use crate::edge::Edge;
use crate::error::CommError;
use crate::routing::LogicalPlan;

use super::delegate::{DataFlowChannel, Lane};
use super::receiver::{Accumulator, FinalReceiver, Sink};
use super::{user_flags, Finishing};

/// Routes of a fixed exchange.
pub(crate) enum Routes {
    /// `sources[i]` sends to `targets[i]`.
    Pairs(Vec<i32>, Vec<i32>),
    /// One source sends every value to every target.
    Broadcast(i32, Vec<i32>),
}

impl Routes {
    fn targets_of(&self, source: i32) -> Vec<i32> {
        match self {
            Routes::Pairs(sources, targets) => sources.iter().zip(targets.iter())
                .filter(|(s, _)| **s == source)
                .map(|(_, t)| *t)
                .collect(),
            Routes::Broadcast(root, targets) if *root == source => targets.clone(),
            Routes::Broadcast(..) => Vec::new(),
        }
    }

    fn sources_of(&self, target: i32) -> Vec<i32> {
        match self {
            Routes::Pairs(sources, targets) => sources.iter().zip(targets.iter())
                .filter(|(_, t)| **t == target)
                .map(|(s, _)| *s)
                .collect(),
            Routes::Broadcast(root, _) => vec![*root],
        }
    }

    fn sources(&self) -> Vec<i32> {
        match self {
            Routes::Pairs(sources, _) => sources.clone(),
            Routes::Broadcast(root, _) => vec![*root],
        }
    }

    fn targets(&self) -> Vec<i32> {
        match self {
            Routes::Pairs(_, targets) => targets.clone(),
            Routes::Broadcast(_, targets) => targets.clone(),
        }
    }
}

/// Sends straight from source lanes to the final stage of each target, with no partial stage.
pub(crate) struct Fixed {
    edge: Edge,
    routes: Routes,
    delegate: DataFlowChannel,
    finals: FinalReceiver,
    local_sources: BTreeSet<i32>,
    finishing: BTreeMap<i32, Finishing>,
    streaming: bool,
    closed: bool,
}

impl Fixed {

    pub fn new(
        communicator: &mut Communicator,
        plan: Rc<LogicalPlan>,
        edge: Edge,
        routes: Routes,
        sink: Sink,
        streaming: bool) -> Result<Self, CommError>
    {
        if let Routes::Pairs(sources, targets) = &routes {
            if sources.len() != targets.len() {
                return Err(CommError::Config { message: format!("{} sources paired with {} targets", sources.len(), targets.len()) });
            }
        }
        plan.check_all(&routes.sources())?;
        plan.check_all(&routes.targets())?;

        let this = plan.this_worker();
        let local_sources: BTreeSet<i32> = routes.sources().into_iter().filter(|s| plan.worker_of(*s).ok() == Some(this)).collect();
        let local_targets: Vec<i32> = routes.targets().into_iter().filter(|t| plan.worker_of(*t).ok() == Some(this)).collect();

        let mut receive_from = BTreeSet::new();
        for target in local_targets.iter() {
            for source in routes.sources_of(*target) {
                receive_from.insert(plan.worker_of(source)?);
            }
        }

        let config = communicator.config().clone();
        let delegate = DataFlowChannel::new(
            edge,
            communicator.channel(),
            Rc::clone(&plan),
            config.send_pending_max,
            receive_from,
            communicator.logger(),
        );
        let expected = local_targets.iter().map(|target| (*target, routes.sources_of(*target))).collect();
        let finals = FinalReceiver::new(
            edge.id(),
            expected,
            Accumulator::Collect,
            sink,
            streaming,
            config.grouping_size * config.send_pending_max,
            communicator.logger(),
        );

        Ok(Fixed { edge, routes, delegate, finals, local_sources, finishing: BTreeMap::new(), streaming, closed: false })
    }

    pub fn edge(&self) -> &Edge { &self.edge }

    fn check(&self, source: i32) -> Result<(), CommError> {
        if self.closed {
            return Err(CommError::Closed { edge: self.edge.id() });
        }
        if let Some(error) = self.delegate.failure() {
            return Err(error.clone());
        }
        if !self.local_sources.contains(&source) {
            return Err(CommError::NotParticipant { task: source, role: "source" });
        }
        Ok(())
    }

    /// Queues `value` for every target of `source`, or for none of them.
    pub fn send(&mut self, source: i32, value: &Value, message_flags: i32) -> Result<bool, CommError> {
        self.check(source)?;
        self.edge.check(value)?;
        let message_flags = user_flags(message_flags) | flags::ORIGIN_PARTIAL;
        let lane = Lane::Source(source);
        let targets = self.routes.targets_of(source);

        // every queue involved must have room before anything is queued.
        let mut needed: BTreeMap<usize, (i32, usize)> = BTreeMap::new();
        for target in targets.iter() {
            let worker = self.delegate.worker_for(lane, *target, message_flags)?;
            needed.entry(worker).or_insert((*target, 0)).1 += 1;
        }
        for (target, count) in needed.values() {
            if self.delegate.room(lane, *target, message_flags) < *count {
                return Ok(false);
            }
        }
        for target in targets {
            self.delegate.send_message(lane, source, target, message_flags, vec![value.clone()])?;
        }
        Ok(true)
    }

    /// Queues the syncs of `source`; streaming exchanges start a new round once the last was queued.
    pub fn finish(&mut self, source: i32, barrier: Option<&[u8]>) -> Result<bool, CommError> {
        self.check(source)?;
        if self.streaming && self.finishing.get(&source).map(|f| f.is_done()).unwrap_or(false) {
            self.finishing.remove(&source);
        }
        let targets = self.routes.targets_of(source);
        let finishing = self.finishing.entry(source)
            .or_insert_with(|| Finishing::new(targets, flags::ORIGIN_PARTIAL, barrier));
        finishing.advance(&mut self.delegate, source)
    }

    pub fn progress(&mut self) -> bool {
        if self.closed || self.delegate.failure().is_some() {
            return false;
        }
        let result = self.delegate.progress_lanes(false, &mut self.finals)
            .and_then(|sent| self.delegate.progress_receive(&mut self.finals).map(|received| sent | received));
        self.delegate.refresh_degraded();
        match result {
            Ok(moved) => self.finals.progress() | moved,
            Err(error) => {
                self.delegate.fail(error);
                false
            },
        }
    }

    pub fn progress_channel(&mut self) -> bool {
        let active = self.delegate.channel().borrow_mut().progress();
        self.progress() | active
    }

    pub fn is_complete(&self) -> bool {
        self.local_sources.iter().all(|s| self.finishing.get(s).map(|f| f.is_done()).unwrap_or(false))
            && self.delegate.is_idle()
            && self.finals.is_complete()
    }

    pub fn reset(&mut self) {
        self.delegate.reset();
        self.finals.reset();
        self.finishing.clear();
    }

    pub fn close(&mut self) {
        self.reset();
        self.closed = true;
    }

    pub fn error(&self) -> Option<&CommError> { self.delegate.error() }

    pub fn set_schema(&mut self, schema: MessageSchema) -> Result<(), CommError> {
        self.delegate.set_schema(schema)?;
        self.edge = self.edge.with_schema(schema);
        Ok(())
    }

    pub fn degraded_workers(&self) -> Vec<usize> { self.delegate.degraded_workers() }
}

#[cfg(test)]
mod test {

    use super::Routes;

    #[test]
    fn pairs_and_broadcast_routes() {
        let pairs = Routes::Pairs(vec![0, 1, 2], vec![5, 6, 5]);
        assert_eq!(pairs.targets_of(1), vec![6]);
        assert_eq!(pairs.sources_of(5), vec![0, 2]);

        let broadcast = Routes::Broadcast(3, vec![7, 8]);
        assert_eq!(broadcast.targets_of(3), vec![7, 8]);
        assert!(broadcast.targets_of(4).is_empty());
        assert_eq!(broadcast.sources_of(8), vec![3]);
    }
}
