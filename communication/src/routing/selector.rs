//! Policies choosing the target of each value.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use twox_hash::XxHash64;

use crate::codec::{MessageType, Value};
use crate::error::CommError;

/// Chooses a target for each value sent on an edge.
///
/// `next` may be called several times for the same value, for example when the send is
/// refused for lack of space and retried. Exactly one `commit` follows each value actually
/// accepted, naming the destination it went to.
pub trait DestinationSelector {
    /// Initializes selection state for an operation; called once, before any `next`.
    fn prepare(&mut self, sources: &[i32], destinations: &[i32], key_type: Option<MessageType>, data_type: MessageType);

    /// Chooses the target of an unkeyed value.
    fn next(&mut self, source: i32, data: &Value) -> Result<i32, CommError>;

    /// Chooses the target of a keyed value.
    fn next_keyed(&mut self, _source: i32, _key: &Value, _data: &Value) -> Result<i32, CommError> {
        Err(CommError::KeyedSelection { selector: self.name() })
    }

    /// Records that a value from `source` was accepted for `destination`.
    fn commit(&mut self, _source: i32, _destination: i32) { }

    /// A name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Round-robin over the destinations, independently per source.
///
/// Sources start at staggered positions so that simultaneous first sends spread out. The
/// position of a source only advances on `commit`.
#[derive(Debug, Default)]
pub struct LoadBalanceSelector {
    destinations: Vec<i32>,
    positions: HashMap<i32, usize>,
}

impl LoadBalanceSelector {
    /// A selector that must be prepared before use.
    pub fn new() -> Self { Self::default() }
}

impl DestinationSelector for LoadBalanceSelector {
    fn prepare(&mut self, sources: &[i32], destinations: &[i32], _key_type: Option<MessageType>, _data_type: MessageType) {
        self.destinations = destinations.to_vec();
        self.destinations.sort();
        let mut sources = sources.to_vec();
        sources.sort();
        let count = std::cmp::max(self.destinations.len(), 1);
        self.positions = sources.iter().enumerate().map(|(index, source)| (*source, index % count)).collect();
    }

    fn next(&mut self, source: i32, _data: &Value) -> Result<i32, CommError> {
        let position = self.positions.get(&source).ok_or(CommError::NotParticipant { task: source, role: "source" })?;
        self.destinations.get(*position).copied().ok_or(CommError::Config { message: "no destinations".to_owned() })
    }

    fn commit(&mut self, source: i32, destination: i32) {
        if let Some(position) = self.positions.get_mut(&source) {
            if self.destinations.get(*position) == Some(&destination) {
                *position = (*position + 1) % self.destinations.len();
            }
        }
    }

    fn name(&self) -> &'static str { "load-balance" }
}

/// Chooses by a stable hash of the key (or of the value, for unkeyed sends).
///
/// The hash does not depend on the process, so every worker routes a key identically.
#[derive(Debug, Default)]
pub struct HashingSelector {
    destinations: Vec<i32>,
}

impl HashingSelector {
    /// A selector that must be prepared before use.
    pub fn new() -> Self { Self::default() }

    fn pick(&self, value: &Value) -> Result<i32, CommError> {
        let count = self.destinations.len();
        if count == 0 {
            return Err(CommError::Config { message: "hashing selector has no destinations".to_owned() });
        }
        let hash = hash_value(value);
        let index = if count.is_power_of_two() {
            (hash & (count as u64 - 1)) as usize
        }
        else {
            (hash % count as u64) as usize
        };
        Ok(self.destinations[index])
    }
}

impl DestinationSelector for HashingSelector {
    fn prepare(&mut self, _sources: &[i32], destinations: &[i32], _key_type: Option<MessageType>, _data_type: MessageType) {
        self.destinations = destinations.to_vec();
        self.destinations.sort();
    }

    fn next(&mut self, _source: i32, data: &Value) -> Result<i32, CommError> {
        self.pick(data)
    }

    fn next_keyed(&mut self, _source: i32, key: &Value, _data: &Value) -> Result<i32, CommError> {
        self.pick(key)
    }

    fn name(&self) -> &'static str { "hashing" }
}

/// Hashes a value with a fixed seed.
pub fn hash_value(value: &Value) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod test {

    use super::{DestinationSelector, HashingSelector, LoadBalanceSelector};
    use crate::codec::{MessageType, Value};
    use crate::error::CommError;

    #[test]
    fn speculative_next_does_not_consume() {
        let mut selector = LoadBalanceSelector::new();
        selector.prepare(&[0, 1], &[10, 11, 12], None, MessageType::Integer);
        let value = Value::Integer(0);
        let first = selector.next(0, &value).unwrap();
        assert_eq!(selector.next(0, &value).unwrap(), first);
        selector.commit(0, first);
        let second = selector.next(0, &value).unwrap();
        assert_ne!(first, second);
        // a commit for a destination other than the pending choice changes nothing.
        selector.commit(0, first);
        assert_eq!(selector.next(0, &value).unwrap(), second);
    }

    #[test]
    fn load_balance_cycles_and_staggers() {
        let mut selector = LoadBalanceSelector::new();
        selector.prepare(&[0, 1], &[10, 11, 12], None, MessageType::Integer);
        let value = Value::Integer(0);
        let mut chosen = Vec::new();
        for _ in 0 .. 6 {
            let destination = selector.next(0, &value).unwrap();
            selector.commit(0, destination);
            chosen.push(destination);
        }
        assert_eq!(chosen, vec![10, 11, 12, 10, 11, 12]);
        assert_eq!(selector.next(1, &value).unwrap(), 11);
        assert!(selector.next(5, &value).is_err());
    }

    #[test]
    fn keyed_selection_requires_support() {
        let mut selector = LoadBalanceSelector::new();
        selector.prepare(&[0], &[1], Some(MessageType::String), MessageType::Integer);
        let result = selector.next_keyed(0, &Value::from("a"), &Value::Integer(1));
        assert_eq!(result, Err(CommError::KeyedSelection { selector: "load-balance" }));
    }

    #[test]
    fn hashing_is_stable_and_in_range() {
        let mut selector = HashingSelector::new();
        selector.prepare(&[0, 1], &[4, 5, 6], Some(MessageType::String), MessageType::Integer);
        for word in ["a", "b", "c", "d", "e"] {
            let key = Value::from(word);
            let first = selector.next_keyed(0, &key, &Value::Integer(1)).unwrap();
            let again = selector.next_keyed(1, &key, &Value::Integer(2)).unwrap();
            assert_eq!(first, again);
            assert!((4 ..= 6).contains(&first));
        }
    }
}
