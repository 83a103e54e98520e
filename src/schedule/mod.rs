pub mod report;
pub mod scheduler;
pub mod types;

#[cfg(test)]
mod tests;

pub use report::ReportQueue;
pub use scheduler::{LifecycleController, LifecycleHandle, PollOutcome, TaskPoller, TaskScheduler};
pub use types::{LifecycleState, Task, TaskEvent};
