//! Collective communication for weft dataflows.
//!
//! Each edge of a task graph is realized as an *operation* moving values from a set of source
//! tasks to a set of target tasks, which may live on different worker processes. Workers are
//! connected by a non-blocking TCP transport; messages are framed into fixed-size buffers by
//! the wire codec, routed by a [`LogicalPlan`](routing::LogicalPlan) and a
//! [`DestinationSelector`](routing::DestinationSelector), and delivered to receivers once every
//! source has synchronized with the target.
//!
//! Everything runs on the worker's thread. No call blocks: a send that cannot be queued returns
//! `Ok(false)`, and the caller drives `progress` until it can be retried.
//!
//! # Examples
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use weft_communication::{BulkReceiver, Config, DataFlowOperation, MessageType, Value};
//! use weft_communication::operation::BGather;
//! use weft_communication::routing::LogicalPlanBuilder;
//!
//! struct Collect(Rc<RefCell<Vec<Value>>>);
//!
//! impl BulkReceiver for Collect {
//!     fn receive(&mut self, _target: i32, values: Vec<Value>) -> Result<(), Vec<Value>> {
//!         self.0.borrow_mut().extend(values);
//!         Ok(())
//!     }
//! }
//!
//! // a cluster of one worker, listening on any free port.
//! let config = Config { addresses: vec!["127.0.0.1:0".to_owned()], ..Config::default() };
//! let mut communicator = weft_communication::initialize(config).unwrap();
//! let plan = Rc::new(LogicalPlanBuilder::new(0).blocks(1, 3).build());
//!
//! let gathered = Rc::new(RefCell::new(Vec::new()));
//! let mut gather = BGather::new(&mut communicator, plan, vec![0, 1], 2, MessageType::String, Collect(Rc::clone(&gathered))).unwrap();
//!
//! for source in [0, 1] {
//!     while !gather.gather(source, &Value::from("hello"), 0).unwrap() {
//!         gather.progress();
//!     }
//!     while !gather.finish(source).unwrap() {
//!         gather.progress();
//!     }
//! }
//! while !gather.is_complete() {
//!     gather.progress_channel();
//! }
//!
//! let mut gathered = gathered.borrow().clone();
//! gathered.sort_by_key(|value| value.as_pair().and_then(|(source, _)| source.as_integer()));
//! assert_eq!(gathered, vec![Value::tuple(0, "hello"), Value::tuple(1, "hello")]);
//! communicator.close();
//! ```

#![forbid(missing_docs)]

pub mod channel;
pub mod codec;
pub mod communicator;
pub mod edge;
pub mod error;
pub mod initialize;
pub mod logging;
pub mod networking;
pub mod operation;
pub mod routing;

pub use crate::communicator::Communicator;
pub use crate::edge::{Edge, OperationKind};
pub use crate::error::CommError;
pub use crate::initialize::{initialize, Config, PartitionAlgorithm};
pub use crate::codec::{flags, MessageType, Value};
pub use crate::operation::{BulkReceiver, DataFlowOperation, ReceiverState, ReduceFunction, SingularReceiver};
