//! Ring ordering of partial output across destination workers.

use std::collections::{BTreeMap, VecDeque};

use crate::codec::Value;
use crate::error::CommError;
use crate::routing::LogicalPlan;

use super::partial::PartialSink;

/// Output staged for one target.
#[derive(Default)]
struct Staged {
    source: i32,
    flags: i32,
    values: Vec<Value>,
    syncs: VecDeque<(i32, i32, Vec<Value>)>,
}

/// Stages partial output per target and releases it one destination worker at a time.
///
/// Workers are visited in ring order, starting with the one after this worker, so that at any
/// moment each worker sends to a different peer. Values staged for a target are merged, up to
/// `grouping_size` of them. A target's sync leaves only once nothing is staged for it.
pub struct RingStager {
    grouping_size: usize,
    /// Destination workers in ring order, with their targets.
    workers: Vec<(usize, Vec<i32>)>,
    staged: BTreeMap<i32, Staged>,
    position: usize,
}

impl RingStager {
    /// A stager for `targets`, as seen from the plan's worker.
    pub fn new(plan: &LogicalPlan, targets: &[i32], grouping_size: usize) -> Result<Self, CommError> {
        let mut by_worker: BTreeMap<usize, Vec<i32>> = BTreeMap::new();
        for target in targets {
            by_worker.entry(plan.worker_of(*target)?).or_default().push(*target);
        }
        let this = plan.this_worker();
        let mut workers: Vec<(usize, Vec<i32>)> = by_worker.into_iter().collect();
        // after this worker first, wrapping round to it last.
        workers.sort_by_key(|(worker, _)| (*worker <= this, *worker));
        let staged = targets.iter().map(|target| (*target, Staged::default())).collect();
        Ok(RingStager { grouping_size: std::cmp::max(grouping_size, 1), workers, staged, position: 0 })
    }

    /// Destination workers in the order they are visited.
    pub fn order(&self) -> Vec<usize> {
        self.workers.iter().map(|(worker, _)| *worker).collect()
    }

    fn worker_idle(&self, index: usize) -> bool {
        self.workers[index].1.iter().all(|target| {
            self.staged.get(target).map(|s| s.values.is_empty() && s.syncs.is_empty()).unwrap_or(true)
        })
    }

    /// Releases staged output into `out`, continuing with the worker where the last call stopped.
    pub fn progress(&mut self, out: &mut dyn PartialSink) -> Result<bool, CommError> {
        let mut moved = false;
        for _ in 0 .. self.workers.len() {
            if self.worker_idle(self.position) {
                self.position = (self.position + 1) % self.workers.len();
                continue;
            }
            let targets = self.workers[self.position].1.clone();
            for target in targets {
                let Some(staged) = self.staged.get_mut(&target) else { continue; };
                if !staged.values.is_empty() {
                    let (source, message_flags) = (staged.source, staged.flags);
                    if !out.offer(source, target, message_flags, &mut staged.values)? {
                        return Ok(moved);
                    }
                    moved = true;
                }
                while let Some((source, message_flags, payload)) = staged.syncs.front_mut() {
                    if !out.offer(*source, target, *message_flags, payload)? {
                        return Ok(moved);
                    }
                    staged.syncs.pop_front();
                    moved = true;
                }
            }
            self.position = (self.position + 1) % self.workers.len();
        }
        Ok(moved)
    }

    /// True if nothing is staged.
    pub fn is_idle(&self) -> bool {
        (0 .. self.workers.len()).all(|index| self.worker_idle(index))
    }

    /// Drops everything staged.
    pub fn reset(&mut self) {
        for staged in self.staged.values_mut() {
            *staged = Staged::default();
        }
        self.position = 0;
    }
}

impl PartialSink for RingStager {
    fn has_room(&self, target: i32, message_flags: i32) -> bool {
        if crate::codec::flags::is_sync(message_flags) {
            return self.staged.contains_key(&target);
        }
        self.staged.get(&target).map(|s| s.values.len() < self.grouping_size).unwrap_or(false)
    }

    fn offer(&mut self, source: i32, target: i32, message_flags: i32, payload: &mut Vec<Value>) -> Result<bool, CommError> {
        if !self.has_room(target, message_flags) {
            return Ok(false);
        }
        let Some(staged) = self.staged.get_mut(&target) else { return Ok(false); };
        if crate::codec::flags::is_sync(message_flags) {
            staged.syncs.push_back((source, message_flags, std::mem::take(payload)));
        }
        else {
            if !staged.values.is_empty() && staged.values.len() + payload.len() > self.grouping_size {
                return Ok(false);
            }
            if staged.values.is_empty() {
                staged.source = source;
                staged.flags = message_flags;
            }
            staged.values.append(payload);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod test {

    use crate::codec::{flags, Value};
    use crate::error::CommError;
    use crate::operation::partial::PartialSink;
    use crate::routing::LogicalPlanBuilder;

    use super::RingStager;

    struct Recorder {
        accept: usize,
        sent: Vec<(i32, i32, Vec<Value>)>,
    }

    impl PartialSink for Recorder {
        fn has_room(&self, _target: i32, _flags: i32) -> bool { self.sent.len() < self.accept }
        fn offer(&mut self, _source: i32, target: i32, message_flags: i32, payload: &mut Vec<Value>) -> Result<bool, CommError> {
            if self.sent.len() >= self.accept { return Ok(false); }
            self.sent.push((target, message_flags, std::mem::take(payload)));
            Ok(true)
        }
    }

    fn stager() -> RingStager {
        // worker 1 sends to targets on workers 0, 1 and 2.
        let plan = LogicalPlanBuilder::new(1).task(0, 0).task(1, 1).task(2, 2).build();
        RingStager::new(&plan, &[0, 1, 2], 3).unwrap()
    }

    #[test]
    fn ring_starts_after_this_worker() {
        assert_eq!(stager().order(), vec![2, 0, 1]);
    }

    #[test]
    fn merges_and_bounds_values() {
        let mut ring = stager();
        assert!(ring.offer(1, 0, flags::ORIGIN_PARTIAL, &mut vec![Value::Integer(1), Value::Integer(2)]).unwrap());
        assert!(ring.offer(1, 0, flags::ORIGIN_PARTIAL, &mut vec![Value::Integer(3)]).unwrap());
        let mut refused = vec![Value::Integer(4)];
        assert!(!ring.offer(1, 0, flags::ORIGIN_PARTIAL, &mut refused).unwrap());
        assert_eq!(refused, vec![Value::Integer(4)]);

        let mut out = Recorder { accept: 10, sent: Vec::new() };
        assert!(ring.progress(&mut out).unwrap());
        assert_eq!(out.sent, vec![(0, flags::ORIGIN_PARTIAL, vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)])]);
        assert!(ring.is_idle());
    }

    #[test]
    fn drains_in_ring_order_and_resumes() {
        let mut ring = stager();
        for target in [0, 1, 2] {
            ring.offer(1, target, flags::ORIGIN_PARTIAL, &mut vec![Value::Integer(target)]).unwrap();
            ring.offer(1, target, flags::ORIGIN_PARTIAL | flags::SYNC_EMPTY, &mut Vec::new()).unwrap();
        }
        let mut out = Recorder { accept: 3, sent: Vec::new() };
        ring.progress(&mut out).unwrap();
        let targets: Vec<i32> = out.sent.iter().map(|(target, _, _)| *target).collect();
        assert_eq!(targets, vec![2, 2, 0]);
        assert!(!flags::is_sync(out.sent[2].1));

        out.accept = 6;
        ring.progress(&mut out).unwrap();
        let targets: Vec<i32> = out.sent.iter().map(|(target, _, _)| *target).collect();
        assert_eq!(targets, vec![2, 2, 0, 0, 1, 1]);
        assert!(flags::is_sync(out.sent[3].1));
        assert!(ring.is_idle());
    }
}
