//! Descriptions of communication edges.

use serde::{Deserialize, Serialize};

use crate::codec::{Layout, MessageSchema, MessageType, Value};
use crate::error::CommError;

/// The collective pattern an edge implements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Each source to its paired target.
    Direct,
    /// One source to every target.
    Broadcast,
    /// Many sources to many targets, routed by a selector.
    Partition,
    /// Partition routed by key.
    KeyedPartition,
    /// Many sources combined into one target.
    Reduce,
    /// Many sources collected at one target.
    Gather,
    /// Values combined per key at the key's target.
    KeyedReduce,
    /// Values grouped per key at the key's target.
    KeyedGather,
    /// One side of a join.
    Join,
}

/// One communication operation instance.
///
/// Edge ids are allocated by the communicator; every worker must construct its operations
/// in the same order so that ids agree across the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    id: u32,
    kind: OperationKind,
    data_type: MessageType,
    key_type: Option<MessageType>,
    schema: MessageSchema,
}

impl Edge {
    /// An edge carrying values of `data_type`.
    pub fn new(id: u32, kind: OperationKind, data_type: MessageType) -> Self {
        Edge { id, kind, data_type, key_type: None, schema: MessageSchema::default() }
    }

    /// An edge carrying `(key, value)` tuples.
    pub fn keyed(id: u32, kind: OperationKind, key_type: MessageType, data_type: MessageType) -> Self {
        Edge { id, kind, data_type, key_type: Some(key_type), schema: MessageSchema::default() }
    }

    /// Replaces the edge's schema hints.
    pub fn with_schema(mut self, schema: MessageSchema) -> Self {
        self.schema = schema;
        self
    }

    /// The edge id.
    pub fn id(&self) -> u32 { self.id }
    /// The operation pattern.
    pub fn kind(&self) -> OperationKind { self.kind }
    /// The value type.
    pub fn data_type(&self) -> MessageType { self.data_type }
    /// The key type, for keyed edges.
    pub fn key_type(&self) -> Option<MessageType> { self.key_type }
    /// The schema hints.
    pub fn schema(&self) -> MessageSchema { self.schema }

    pub(crate) fn layout(&self) -> Layout {
        Layout { key_type: self.key_type, data_type: self.data_type, schema: self.schema }
    }

    /// Confirms that `value` can be carried by this edge.
    ///
    /// Keyed edges expect `Value::Tuple`.
    pub fn check(&self, value: &Value) -> Result<(), CommError> {
        let mismatch = |expected: String, found: &Value| CommError::TypeMismatch { expected, found: found.kind().to_owned() };
        match self.key_type {
            Some(key_type) => {
                let (key, data) = value.as_pair()
                    .ok_or_else(|| mismatch("tuple".to_owned(), value))?;
                if !key_type.accepts(key) { return Err(mismatch(format!("{:?}", key_type), key)); }
                if !self.data_type.accepts(data) { return Err(mismatch(format!("{:?}", self.data_type), data)); }
            },
            None => {
                if !self.data_type.accepts(value) { return Err(mismatch(format!("{:?}", self.data_type), value)); }
            },
        }
        Ok(())
    }
}
