//! Queues, serialization and delivery shared by every operation.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::rc::Rc;

use crate::channel::SharedChannel;
use crate::codec::deserializer::{InMessage, MessageDeserializer};
use crate::codec::serializer::{MessageSerializer, OutMessage};
use crate::codec::{flags, BincodeCodec, MessageSchema, Value};
use crate::edge::Edge;
use crate::error::CommError;
use crate::logging::{CommunicationLogger, OperationEvent, OperationEventKind};
use crate::routing::LogicalPlan;

use super::Delivery;

/// The queue a message waits in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Lane {
    /// Messages from one source task.
    Source(i32),
    /// Messages produced by the worker's partial stage.
    Partial,
}

/// Moves the messages of one edge between stages, locally or over the network.
///
/// Messages are queued per lane and destination worker; each queue is FIFO and holds at
/// most `pending_max` messages. During progress, messages for this worker are offered to a
/// local stage, and the rest are serialized into the channel's send pool and handed to the
/// transport. Buffers received for the edge are reassembled per peer worker and offered to
/// the final stage.
pub struct DataFlowChannel {
    edge: Edge,
    channel: SharedChannel,
    plan: Rc<LogicalPlan>,
    worker: usize,
    pending_max: usize,
    lanes: BTreeMap<(Lane, usize), VecDeque<OutMessage>>,
    serializer: MessageSerializer,
    deserializers: HashMap<usize, MessageDeserializer>,
    decoded: VecDeque<InMessage>,
    receive_from: BTreeSet<usize>,
    failure: Option<CommError>,
    /// Set while a worker this edge exchanges with is degraded.
    degraded: Option<CommError>,
    logger: Option<CommunicationLogger>,
}

impl DataFlowChannel {

    /// A delegate for `edge`, receiving from the workers in `receive_from`.
    pub fn new(
        edge: Edge,
        channel: SharedChannel,
        plan: Rc<LogicalPlan>,
        pending_max: usize,
        receive_from: BTreeSet<usize>,
        logger: Option<CommunicationLogger>) -> Self
    {
        let worker = plan.this_worker();
        let receive_from: BTreeSet<usize> = receive_from.into_iter().filter(|w| *w != worker).collect();
        {
            let mut channel = channel.borrow_mut();
            for peer in receive_from.iter() {
                channel.register_receive(*peer, edge.id());
            }
        }
        if let Some(logger) = &logger {
            logger.log(OperationEvent { edge: edge.id(), kind: OperationEventKind::Created });
        }
        DataFlowChannel {
            serializer: MessageSerializer::new(edge.id(), edge.layout(), Box::new(BincodeCodec)),
            edge,
            channel,
            plan,
            worker,
            pending_max,
            lanes: BTreeMap::new(),
            deserializers: HashMap::new(),
            decoded: VecDeque::new(),
            receive_from,
            failure: None,
            degraded: None,
            logger,
        }
    }

    /// The edge served.
    pub fn edge(&self) -> &Edge { &self.edge }
    /// The logical plan.
    pub fn plan(&self) -> &LogicalPlan { &self.plan }
    /// The worker this delegate runs on.
    pub fn worker(&self) -> usize { self.worker }
    /// The shared channel.
    pub fn channel(&self) -> &SharedChannel { &self.channel }
    /// The logger, if any.
    pub fn logger(&self) -> Option<&CommunicationLogger> { self.logger.as_ref() }

    /// The error that stopped the delegate, if any.
    pub fn failure(&self) -> Option<&CommError> { self.failure.as_ref() }

    /// Stops the delegate with `error`; every later call reports it.
    pub fn fail(&mut self, error: CommError) -> CommError {
        if self.failure.is_none() {
            if let Some(logger) = &self.logger {
                logger.log(OperationEvent { edge: self.edge.id(), kind: OperationEventKind::Failed { message: error.to_string() } });
            }
            self.failure = Some(error.clone());
        }
        error
    }

    /// The failure, or else the degraded peer, that keeps the edge from completing.
    pub fn error(&self) -> Option<&CommError> {
        self.failure.as_ref().or(self.degraded.as_ref())
    }

    /// Notes whether a worker this edge receives from or queues towards is degraded.
    ///
    /// A degraded peer does not stop the edge: traffic with other workers still moves, and
    /// messages for the lost worker stay queued.
    pub fn refresh_degraded(&mut self) {
        let lost = self.degraded_workers().first().copied();
        if self.degraded.is_none() {
            if let (Some(worker), Some(logger)) = (lost, &self.logger) {
                logger.log(OperationEvent { edge: self.edge.id(), kind: OperationEventKind::Degraded { worker } });
            }
        }
        self.degraded = lost.map(|worker| CommError::Degraded { worker });
    }

    /// Replaces the schema hints of the wire format.
    ///
    /// Fails once anything was queued or received, since both ends must agree on the layout.
    pub fn set_schema(&mut self, schema: MessageSchema) -> Result<(), CommError> {
        if !self.lanes.is_empty() || !self.deserializers.is_empty() || !self.decoded.is_empty() {
            return Err(CommError::Config { message: format!("schema of edge {} set after traffic", self.edge.id()) });
        }
        self.edge = self.edge.with_schema(schema);
        self.serializer = MessageSerializer::new(self.edge.id(), self.edge.layout(), Box::new(BincodeCodec));
        Ok(())
    }

    fn check(&self) -> Result<(), CommError> {
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// The worker a lane message for `target` travels to.
    fn destination(&self, lane: Lane, target: i32, message_flags: i32) -> Result<usize, CommError> {
        if lane != Lane::Partial && message_flags & flags::ORIGIN_PARTIAL == 0 {
            // Sender output always goes to this worker's partial stage.
            return Ok(self.worker);
        }
        self.plan.worker_of(target)
    }

    /// True if a message for `target` on `lane` would be queued.
    pub fn has_room(&self, lane: Lane, target: i32, message_flags: i32) -> bool {
        match self.destination(lane, target, message_flags) {
            Ok(worker) => self.lanes.get(&(lane, worker)).map(|q| q.len() < self.pending_max).unwrap_or(true),
            Err(_) => false,
        }
    }

    /// The number of messages for `target` on `lane` that would still be queued.
    pub fn room(&self, lane: Lane, target: i32, message_flags: i32) -> usize {
        match self.destination(lane, target, message_flags) {
            Ok(worker) => self.pending_max.saturating_sub(self.lanes.get(&(lane, worker)).map(|q| q.len()).unwrap_or(0)),
            Err(_) => 0,
        }
    }

    /// The worker a message for `target` on `lane` is queued towards.
    pub fn worker_for(&self, lane: Lane, target: i32, message_flags: i32) -> Result<usize, CommError> {
        self.destination(lane, target, message_flags)
    }

    /// Queues a message. Returns `Ok(false)` if its queue is full.
    pub fn send_message(&mut self, lane: Lane, source: i32, target: i32, message_flags: i32, payload: Vec<Value>) -> Result<bool, CommError> {
        self.check()?;
        let worker = self.destination(lane, target, message_flags)?;
        let queue = self.lanes.entry((lane, worker)).or_default();
        if queue.len() >= self.pending_max {
            return Ok(false);
        }
        queue.push_back(OutMessage::new(source, target, message_flags, payload));
        Ok(true)
    }

    /// True if no message waits in any queue, and no received message is half read.
    pub fn is_idle(&self) -> bool {
        self.lanes.values().all(|q| q.is_empty())
            && self.decoded.is_empty()
            && self.deserializers.values().all(|d| !d.in_progress())
    }

    /// True if no message waits in a queue of `lane`'s kind.
    pub fn lanes_empty(&self, partial: bool) -> bool {
        self.lanes.iter()
            .filter(|((lane, _), _)| (*lane == Lane::Partial) == partial)
            .all(|(_, q)| q.is_empty())
    }

    /// Moves messages out of source lanes (`partial == false`) or partial lanes.
    ///
    /// Messages for this worker are offered to `local`; others go to the transport. A queue
    /// stops at its first message that cannot move, keeping its order.
    pub fn progress_lanes(&mut self, partial: bool, local: &mut dyn Delivery) -> Result<bool, CommError> {
        self.check()?;
        let keys: Vec<(Lane, usize)> = self.lanes.keys()
            .filter(|(lane, _)| (*lane == Lane::Partial) == partial)
            .copied()
            .collect();
        let mut moved = false;
        for key in keys {
            match self.progress_queue(key, local) {
                Ok(progress) => moved |= progress,
                Err(error) => return Err(self.fail(error)),
            }
        }
        Ok(moved)
    }

    fn progress_queue(&mut self, key: (Lane, usize), local: &mut dyn Delivery) -> Result<bool, CommError> {
        let (_, worker) = key;
        let edge = self.edge.id();
        let mut moved = false;
        let Some(queue) = self.lanes.get_mut(&key) else { return Ok(false); };

        if worker == self.worker {
            while let Some(message) = queue.front_mut() {
                if !local.deliver(message.source, message.target, message.flags, &mut message.payload) {
                    break;
                }
                queue.pop_front();
                moved = true;
            }
            return Ok(moved);
        }

        let mut channel = self.channel.borrow_mut();
        if channel.is_degraded(worker) || !channel.is_connected(worker) {
            return Ok(false);
        }
        while let Some(message) = queue.front_mut() {
            if !self.serializer.build(message, channel.send_pool())? {
                break;
            }
            let buffers = message.take_buffers();
            if let Err(buffers) = channel.send_all(worker, edge, buffers) {
                message.restore_buffers(buffers);
                message.release_into(channel.send_pool());
                break;
            }
            queue.pop_front();
            moved = true;
        }
        Ok(moved)
    }

    /// Reads received buffers and offers complete messages to `target_stage`.
    pub fn progress_receive(&mut self, target_stage: &mut dyn Delivery) -> Result<bool, CommError> {
        self.check()?;
        let mut moved = false;

        loop {
            while let Some(message) = self.decoded.front_mut() {
                let header = message.header;
                if !target_stage.deliver(header.source, header.destination, header.flags, &mut message.items) {
                    return Ok(moved);
                }
                self.decoded.pop_front();
                moved = true;
            }

            let received = self.channel.borrow_mut().take_received(self.edge.id());
            let Some((worker, buffer)) = received else { return Ok(moved); };
            moved = true;

            let edge = self.edge;
            let max_item = self.channel.borrow().max_item();
            let deserializer = self.deserializers.entry(worker)
                .or_insert_with(|| MessageDeserializer::new(edge.id(), edge.layout(), max_item, Box::new(BincodeCodec)));
            let result = deserializer.add_buffer(buffer.valid(), &mut self.decoded);
            self.channel.borrow_mut().release_receive_buffer(worker, edge.id(), buffer);
            if let Err(error) = result {
                return Err(self.fail(error));
            }
        }
    }

    /// Drops every queued and half-read message, returning held buffers to the pool.
    pub fn reset(&mut self) {
        let mut channel = self.channel.borrow_mut();
        for queue in self.lanes.values_mut() {
            for mut message in queue.drain(..) {
                message.release_into(channel.send_pool());
            }
        }
        self.lanes.clear();
        for deserializer in self.deserializers.values_mut() {
            deserializer.reset();
        }
        self.decoded.clear();
        self.failure = None;
        self.degraded = None;
        if let Some(logger) = &self.logger {
            logger.log(OperationEvent { edge: self.edge.id(), kind: OperationEventKind::Reset });
        }
    }

    /// Workers this delegate receives from.
    pub fn receive_from(&self) -> &BTreeSet<usize> { &self.receive_from }

    /// Workers this edge receives from or has queued towards whose connections failed.
    pub fn degraded_workers(&self) -> Vec<usize> {
        let channel = self.channel.borrow();
        let peers: BTreeSet<usize> = self.receive_from.iter().copied()
            .chain(self.lanes.keys().map(|(_, worker)| *worker))
            .filter(|worker| *worker != self.worker)
            .collect();
        peers.into_iter().filter(|worker| channel.is_degraded(*worker)).collect()
    }
}
