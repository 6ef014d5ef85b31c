//! Joins of two keyed edges, by hashing or by sorting and merging.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::codec::Value;

use super::{natural_order, BulkReceiver, KeyOrder};

/// Which unmatched values a join keeps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum JoinType {
    /// Only keys present on both sides.
    #[default]
    Inner,
    /// Every left value, matched or not.
    LeftOuter,
    /// Every right value, matched or not.
    RightOuter,
    /// Every value of both sides.
    FullOuter,
}

impl JoinType {
    fn keeps_left(&self) -> bool { matches!(self, JoinType::LeftOuter | JoinType::FullOuter) }
    fn keeps_right(&self) -> bool { matches!(self, JoinType::RightOuter | JoinType::FullOuter) }
}

/// How a target pairs up the two sides.
#[derive(Clone, Default)]
pub enum JoinAlgorithm {
    /// Builds a table of the right side and probes it with the left. Output follows the
    /// arrival order of the left side.
    #[default]
    Hash,
    /// Sorts both sides by key and merges them. Output is in key order.
    Sort(KeyOrder),
}

impl JoinAlgorithm {
    /// A sort-merge join in the natural order of keys.
    pub fn sorted() -> Self { JoinAlgorithm::Sort(natural_order()) }
}

impl fmt::Debug for JoinAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinAlgorithm::Hash => f.write_str("Hash"),
            JoinAlgorithm::Sort(_) => f.write_str("Sort"),
        }
    }
}

/// The side of a join an edge feeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Relation {
    /// The first edge.
    Left,
    /// The second edge.
    Right,
}

#[derive(Default)]
struct Sides {
    left: Vec<Value>,
    right: Vec<Value>,
    left_synced: bool,
    right_synced: bool,
    barrier: Option<Vec<u8>>,
    /// Joined output not yet taken by the receiver.
    output: Option<Vec<Value>>,
    delivered: bool,
}

/// Holds both sides of every target until both have synced, then joins them.
pub struct JoinStage {
    join_type: JoinType,
    algorithm: JoinAlgorithm,
    targets: BTreeMap<i32, Sides>,
    receiver: Box<dyn BulkReceiver>,
}

impl JoinStage {
    /// A stage for `targets`, delivering joined tuples to `receiver`.
    pub fn new(join_type: JoinType, algorithm: JoinAlgorithm, targets: &[i32], mut receiver: Box<dyn BulkReceiver>) -> Self {
        receiver.init(targets);
        JoinStage {
            join_type,
            algorithm,
            targets: targets.iter().map(|target| (*target, Sides::default())).collect(),
            receiver,
        }
    }

    /// Adds values of one side for `target`.
    pub fn add(&mut self, relation: Relation, target: i32, values: Vec<Value>) {
        if let Some(sides) = self.targets.get_mut(&target) {
            match relation {
                Relation::Left => sides.left.extend(values),
                Relation::Right => sides.right.extend(values),
            }
        }
    }

    /// Marks one side of `target` as complete.
    pub fn sync(&mut self, relation: Relation, target: i32, barrier: Option<&[u8]>) {
        let join_type = self.join_type;
        let algorithm = self.algorithm.clone();
        let Some(sides) = self.targets.get_mut(&target) else { return; };
        match relation {
            Relation::Left => sides.left_synced = true,
            Relation::Right => sides.right_synced = true,
        }
        if let Some(barrier) = barrier {
            sides.barrier = Some(barrier.to_vec());
        }
        if sides.left_synced && sides.right_synced && sides.output.is_none() && !sides.delivered {
            let left = std::mem::take(&mut sides.left);
            let right = std::mem::take(&mut sides.right);
            sides.output = Some(match algorithm {
                JoinAlgorithm::Hash => hash_join(join_type, left, right),
                JoinAlgorithm::Sort(order) => sort_join(join_type, left, right, &*order),
            });
        }
    }

    /// Hands joined output and syncs to the receiver. Returns true if anything moved.
    pub fn progress(&mut self) -> bool {
        let mut moved = false;
        for (target, sides) in self.targets.iter_mut() {
            if let Some(output) = sides.output.take() {
                if !output.is_empty() {
                    if let Err(output) = self.receiver.receive(*target, output) {
                        sides.output = Some(output);
                        continue;
                    }
                    moved = true;
                }
                sides.output = Some(Vec::new());
            }
            if sides.output.is_some() && !sides.delivered {
                if self.receiver.sync(*target, sides.barrier.as_deref()) {
                    sides.output = None;
                    sides.delivered = true;
                    moved = true;
                }
            }
        }
        moved
    }

    /// True once every target delivered its joined output and sync.
    pub fn is_complete(&self) -> bool {
        self.targets.values().all(|sides| sides.delivered)
    }

    /// Drops both sides of every target.
    pub fn reset(&mut self) {
        for sides in self.targets.values_mut() {
            *sides = Sides::default();
        }
    }
}

/// Joins `(key, value)` tuples, producing `(key, (left, right))` with `Value::Empty` for a
/// missing side. Left values keep their arrival order; unmatched right values follow.
pub fn hash_join(join_type: JoinType, left: Vec<Value>, right: Vec<Value>) -> Vec<Value> {
    let mut table: HashMap<Value, Vec<(Value, bool)>> = HashMap::new();
    let mut key_order = Vec::new();
    for value in right {
        let Some((key, value)) = value.into_pair() else { continue; };
        let entry = table.entry(key.clone()).or_default();
        if entry.is_empty() {
            key_order.push(key);
        }
        entry.push((value, false));
    }

    let mut output = Vec::new();
    for value in left {
        let Some((key, value)) = value.into_pair() else { continue; };
        match table.get_mut(&key) {
            Some(matches) => {
                for (right, matched) in matches.iter_mut() {
                    *matched = true;
                    output.push(Value::tuple(key.clone(), Value::tuple(value.clone(), right.clone())));
                }
            },
            None if join_type.keeps_left() => output.push(Value::tuple(key, Value::tuple(value, Value::Empty))),
            None => { },
        }
    }

    if join_type.keeps_right() {
        for key in key_order {
            let Some(matches) = table.remove(&key) else { continue; };
            for (right, matched) in matches {
                if !matched {
                    output.push(Value::tuple(key.clone(), Value::tuple(Value::Empty, right)));
                }
            }
        }
    }
    output
}

/// Joins `(key, value)` tuples like [`hash_join`], by sorting both sides with `order` and
/// merging them. Output is in key order; values of one key keep their arrival order.
pub fn sort_join(join_type: JoinType, left: Vec<Value>, right: Vec<Value>, order: &dyn Fn(&Value, &Value) -> Ordering) -> Vec<Value> {
    let mut left: Vec<(Value, Value)> = left.into_iter().filter_map(Value::into_pair).collect();
    let mut right: Vec<(Value, Value)> = right.into_iter().filter_map(Value::into_pair).collect();
    // stable, so equal keys keep their arrival order.
    left.sort_by(|a, b| order(&a.0, &b.0));
    right.sort_by(|a, b| order(&a.0, &b.0));

    let group_end = |side: &[(Value, Value)], start: usize| {
        let mut end = start + 1;
        while end < side.len() && order(&side[start].0, &side[end].0) == Ordering::Equal {
            end += 1;
        }
        end
    };

    let mut output = Vec::new();
    let mut left = left.into_iter().peekable();
    let mut right_at = 0;
    let mut pending_left: Vec<(Value, Value)> = Vec::new();
    while let Some((key, value)) = left.next() {
        // right keys below this one have no partner on the left.
        while right_at < right.len() && order(&right[right_at].0, &key) == Ordering::Less {
            if join_type.keeps_right() {
                let (right_key, right_value) = &right[right_at];
                output.push(Value::tuple(right_key.clone(), Value::tuple(Value::Empty, right_value.clone())));
            }
            right_at += 1;
        }
        pending_left.push((key, value));
        while let Some((next, _)) = left.peek() {
            if order(next, &pending_left[0].0) != Ordering::Equal { break; }
            if let Some(entry) = left.next() { pending_left.push(entry); }
        }
        let matched = right_at < right.len() && order(&right[right_at].0, &pending_left[0].0) == Ordering::Equal;
        if matched {
            let end = group_end(&right, right_at);
            for (key, value) in pending_left.drain(..) {
                for (_, right_value) in right[right_at .. end].iter() {
                    output.push(Value::tuple(key.clone(), Value::tuple(value.clone(), right_value.clone())));
                }
            }
            right_at = end;
        }
        else if join_type.keeps_left() {
            for (key, value) in pending_left.drain(..) {
                output.push(Value::tuple(key, Value::tuple(value, Value::Empty)));
            }
        }
        pending_left.clear();
    }
    if join_type.keeps_right() {
        for (key, value) in right.drain(right_at ..) {
            output.push(Value::tuple(key, Value::tuple(Value::Empty, value)));
        }
    }
    output
}

#[cfg(test)]
mod test {

    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::codec::Value;
    use crate::operation::BulkReceiver;

    use super::{hash_join, sort_join, JoinAlgorithm, JoinStage, JoinType, Relation};

    fn sides() -> (Vec<Value>, Vec<Value>) {
        let left = vec![Value::tuple(1, "l1"), Value::tuple(2, "l2")];
        let right = vec![Value::tuple(2, "r2"), Value::tuple(3, "r3"), Value::tuple(2, "r2b")];
        (left, right)
    }

    #[test]
    fn join_types() {
        let (left, right) = sides();
        let inner = hash_join(JoinType::Inner, left.clone(), right.clone());
        assert_eq!(inner, vec![
            Value::tuple(2, Value::tuple("l2", "r2")),
            Value::tuple(2, Value::tuple("l2", "r2b")),
        ]);

        let left_outer = hash_join(JoinType::LeftOuter, left.clone(), right.clone());
        assert_eq!(left_outer[0], Value::tuple(1, Value::tuple("l1", Value::Empty)));
        assert_eq!(left_outer.len(), 3);

        let right_outer = hash_join(JoinType::RightOuter, left.clone(), right.clone());
        assert_eq!(right_outer.len(), 3);
        assert_eq!(right_outer[2], Value::tuple(3, Value::tuple(Value::Empty, "r3")));

        assert_eq!(hash_join(JoinType::FullOuter, left, right).len(), 4);
    }

    struct Collect(Rc<RefCell<Vec<(i32, Vec<Value>)>>>);

    impl BulkReceiver for Collect {
        fn receive(&mut self, target: i32, values: Vec<Value>) -> Result<(), Vec<Value>> {
            self.0.borrow_mut().push((target, values));
            Ok(())
        }
    }

    #[test]
    fn waits_for_both_sides() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut stage = JoinStage::new(JoinType::Inner, JoinAlgorithm::Hash, &[7], Box::new(Collect(Rc::clone(&seen))));
        let (left, right) = sides();
        stage.add(Relation::Left, 7, left);
        stage.sync(Relation::Left, 7, None);
        assert!(!stage.progress());
        stage.add(Relation::Right, 7, right);
        stage.sync(Relation::Right, 7, None);
        assert!(stage.progress());
        assert!(stage.is_complete());
        assert_eq!(seen.borrow()[0].1.len(), 2);
    }

    #[test]
    fn sorted_joins_emit_in_key_order() {
        let left = vec![Value::tuple(3, "l3"), Value::tuple(1, "l1"), Value::tuple(2, "l2"), Value::tuple(2, "l2b")];
        let right = vec![Value::tuple(4, "r4"), Value::tuple(2, "r2"), Value::tuple(0, "r0")];
        let order = |a: &Value, b: &Value| a.cmp(b);

        let inner = sort_join(JoinType::Inner, left.clone(), right.clone(), &order);
        assert_eq!(inner, vec![
            Value::tuple(2, Value::tuple("l2", "r2")),
            Value::tuple(2, Value::tuple("l2b", "r2")),
        ]);

        let full = sort_join(JoinType::FullOuter, left.clone(), right.clone(), &order);
        let keys: Vec<i32> = full.iter().map(|v| v.as_pair().and_then(|(k, _)| k.as_integer()).unwrap()).collect();
        assert_eq!(keys, vec![0, 1, 2, 2, 3, 4]);
        assert_eq!(full[0], Value::tuple(0, Value::tuple(Value::Empty, "r0")));
        assert_eq!(full[4], Value::tuple(3, Value::tuple("l3", Value::Empty)));

        assert_eq!(sort_join(JoinType::LeftOuter, left.clone(), right.clone(), &order).len(), 4);
        assert_eq!(sort_join(JoinType::RightOuter, left, right, &order).len(), 4);
    }

    #[test]
    fn sorted_and_hashed_joins_agree() {
        let (left, right) = sides();
        let order = |a: &Value, b: &Value| a.cmp(b);
        for join_type in [JoinType::Inner, JoinType::LeftOuter, JoinType::RightOuter, JoinType::FullOuter] {
            let mut hashed = hash_join(join_type, left.clone(), right.clone());
            let mut sorted = sort_join(join_type, left.clone(), right.clone(), &order);
            hashed.sort();
            sorted.sort();
            assert_eq!(hashed, sorted, "{:?}", join_type);
        }
    }

    #[test]
    fn a_reversed_order_reverses_the_output() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let descending = JoinAlgorithm::Sort(Rc::new(|a: &Value, b: &Value| b.cmp(a)));
        let mut stage = JoinStage::new(JoinType::LeftOuter, descending, &[1], Box::new(Collect(Rc::clone(&seen))));
        stage.add(Relation::Left, 1, (0 .. 4).map(|k| Value::tuple(k, "l")).collect());
        stage.sync(Relation::Left, 1, None);
        stage.sync(Relation::Right, 1, None);
        assert!(stage.progress());
        let keys: Vec<i32> = seen.borrow()[0].1.iter().map(|v| v.as_pair().and_then(|(k, _)| k.as_integer()).unwrap()).collect();
        assert_eq!(keys, vec![3, 2, 1, 0]);
    }
}
