//! Periodic scheduler for enqueueing work at intervals.

mod builder;
mod job;

pub use builder::SchedulerBuilder;
pub use job::PeriodicScheduler;
