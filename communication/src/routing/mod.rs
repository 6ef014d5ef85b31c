//! Task placement and per-value routing.

pub mod plan;
pub mod selector;

pub use self::plan::{LogicalPlan, LogicalPlanBuilder, TaskLocation};
pub use self::selector::{DestinationSelector, HashingSelector, LoadBalanceSelector};
