//! Interval scheduling under a cluster lease

mod runner;
mod task;

pub use runner::{Scheduler, SchedulerConfig, SchedulerStatus};
pub use task::{CycleOutcome, ScheduledTask, TaskState};
