use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::config::WorkerProfile;
use crate::controller::{ControllerClient, Report, ReserveRequest};
use crate::error::FailureCode;
use crate::schedule::report::ReportQueue;
use super::LifecycleHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Polling is stopped or a task is already in flight.
    Busy,
    NoWork,
    /// The controller handed out a task for another queue.
    Discarded,
    Accepted,
    Failed,
}

pub struct TaskPoller {
    client: Arc<dyn ControllerClient>,
    lifecycle: LifecycleHandle,
    reports: ReportQueue,
    // worker identity sent with every reservation
    profile: WorkerProfile,
    interval: Duration,
}

impl TaskPoller {
    pub fn new(
        client: Arc<dyn ControllerClient>,
        lifecycle: LifecycleHandle,
        reports: ReportQueue,
        profile: WorkerProfile,
    ) -> Self {
        Self {
            client,
            lifecycle,
            reports,
            profile,
            interval: Duration::from_millis(15000),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(&self) {
        info!(
            "Polling {} queue every {:?} as {}",
            self.profile.queue, self.interval, self.profile.name
        );
        loop {
            if !self.lifecycle.is_accepting() {
                info!("Polling stopped");
                return;
            }
            self.poll_once().await;
            sleep(self.interval).await;
        }
    }

    pub async fn poll_once(&self) -> PollOutcome {
        if !self.lifecycle.is_accepting() || !self.lifecycle.is_idle() {
            return PollOutcome::Busy;
        }

        let request = ReserveRequest::from(&self.profile);
        let task = match self.client.reserve(&request).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!("No task available");
                return PollOutcome::NoWork;
            }
            Err(e) => {
                error!("TASK_OBJECT_ERROR: reservation failed: {:#}", e);
                self.reports.push(None, Report::Error(FailureCode::TaskObjectError));
                return PollOutcome::Failed;
            }
        };

        if task.queue.as_deref() != Some(self.profile.queue.as_str()) {
            warn!(
                "Task {:?} belongs to queue {:?}, not {}, discarding",
                task.task_id, task.queue, self.profile.queue
            );
            return PollOutcome::Discarded;
        }

        info!("Task {:?} reserved", task.task_id);
        self.lifecycle.submit_reservation(task);
        PollOutcome::Accepted
    }
}
