//! The placement of logical tasks on workers.

use std::collections::{BTreeSet, HashMap};

use crate::error::CommError;

/// Where a logical task runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskLocation {
    /// Index of the worker process.
    pub worker: usize,
    /// Index of the task's channel within the worker.
    pub channel: usize,
}

/// An immutable map from logical task ids to their workers.
///
/// # Examples
///
/// ```
/// use weft_communication::routing::LogicalPlanBuilder;
///
/// let plan = LogicalPlanBuilder::new(1)
///     .task(0, 0)
///     .task(1, 0)
///     .task(2, 1)
///     .build();
///
/// assert_eq!(plan.worker_of(2).unwrap(), 1);
/// assert_eq!(plan.tasks_of_worker(0), vec![0, 1]);
/// assert!(plan.worker_of(9).is_err());
/// ```
#[derive(Clone, Debug)]
pub struct LogicalPlan {
    this_worker: usize,
    tasks: HashMap<i32, TaskLocation>,
    workers: BTreeSet<usize>,
}

impl LogicalPlan {
    /// The worker this process runs.
    pub fn this_worker(&self) -> usize { self.this_worker }

    /// The location of `task`.
    pub fn location(&self, task: i32) -> Result<TaskLocation, CommError> {
        self.tasks.get(&task).copied().ok_or(CommError::UnknownTask { task })
    }

    /// The worker running `task`.
    pub fn worker_of(&self, task: i32) -> Result<usize, CommError> {
        self.location(task).map(|location| location.worker)
    }

    /// The channel of `task` within its worker.
    pub fn channel_of(&self, task: i32) -> Result<usize, CommError> {
        self.location(task).map(|location| location.channel)
    }

    /// True if `task` runs on this worker.
    pub fn is_local(&self, task: i32) -> Result<bool, CommError> {
        self.worker_of(task).map(|worker| worker == self.this_worker)
    }

    /// Tasks placed on `worker`, in increasing order.
    pub fn tasks_of_worker(&self, worker: usize) -> Vec<i32> {
        let mut tasks: Vec<i32> = self.tasks.iter()
            .filter(|(_, location)| location.worker == worker)
            .map(|(task, _)| *task)
            .collect();
        tasks.sort();
        tasks
    }

    /// Every worker with at least one task, in increasing order.
    pub fn workers(&self) -> impl Iterator<Item=usize> + '_ {
        self.workers.iter().copied()
    }

    /// Confirms every id in `tasks` is placed.
    pub fn check_all(&self, tasks: &[i32]) -> Result<(), CommError> {
        tasks.iter().try_for_each(|task| self.location(*task).map(|_| ()))
    }
}

/// Assembles a [`LogicalPlan`].
pub struct LogicalPlanBuilder {
    this_worker: usize,
    tasks: HashMap<i32, TaskLocation>,
    channels: HashMap<usize, usize>,
}

impl LogicalPlanBuilder {
    /// Starts a plan as seen from `this_worker`.
    pub fn new(this_worker: usize) -> Self {
        LogicalPlanBuilder { this_worker, tasks: HashMap::new(), channels: HashMap::new() }
    }

    /// Places `task` on `worker`, in the worker's next channel.
    ///
    /// Placing a task twice keeps the later placement.
    pub fn task(mut self, task: i32, worker: usize) -> Self {
        let channel = self.channels.entry(worker).or_insert(0);
        self.tasks.insert(task, TaskLocation { worker, channel: *channel });
        *channel += 1;
        self
    }

    /// Places tasks `0 .. per_worker * workers` on workers in contiguous blocks.
    pub fn blocks(mut self, workers: usize, per_worker: usize) -> Self {
        for worker in 0 .. workers {
            for index in 0 .. per_worker {
                self = self.task((worker * per_worker + index) as i32, worker);
            }
        }
        self
    }

    /// Freezes the plan.
    pub fn build(self) -> LogicalPlan {
        let workers = self.tasks.values().map(|location| location.worker).collect();
        LogicalPlan { this_worker: self.this_worker, tasks: self.tasks, workers }
    }
}

#[cfg(test)]
mod test {

    use super::LogicalPlanBuilder;
    use crate::error::CommError;

    #[test]
    fn blocks_assign_channels() {
        let plan = LogicalPlanBuilder::new(0).blocks(2, 3).build();
        assert_eq!(plan.tasks_of_worker(1), vec![3, 4, 5]);
        assert_eq!(plan.channel_of(4).unwrap(), 1);
        assert_eq!(plan.workers().collect::<Vec<_>>(), vec![0, 1]);
        assert!(plan.is_local(2).unwrap());
        assert!(!plan.is_local(3).unwrap());
    }

    #[test]
    fn unknown_tasks_are_reported() {
        let plan = LogicalPlanBuilder::new(0).task(0, 0).build();
        assert_eq!(plan.check_all(&[0, 5]), Err(CommError::UnknownTask { task: 5 }));
    }
}
