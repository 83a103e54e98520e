mod lifecycle;
mod poller;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use lifecycle::{LifecycleController, LifecycleHandle};
pub use poller::{PollOutcome, TaskPoller};

use crate::config::WorkerProfile;
use crate::controller::ControllerClient;
use crate::schedule::report::ReportQueue;
use crate::storage::sink::StorageSink;
use crate::transfer::FileTransfer;
use crate::workdir::Workdir;

/// Wires the report queue, the lifecycle controller and the poller together
/// and keeps their join handles.
pub struct TaskScheduler {
    client: Arc<dyn ControllerClient>,
    lifecycle: LifecycleHandle,
    reports: ReportQueue,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(
        client: Arc<dyn ControllerClient>,
        sink: Arc<dyn StorageSink>,
        workdir: Arc<Workdir>,
        transfer: Arc<FileTransfer>,
        decoder_start_timeout: Duration,
    ) -> Self {
        let (reports, report_worker) = ReportQueue::spawn(client.clone());
        let (controller, lifecycle) =
            LifecycleController::new(workdir, transfer, sink, reports.clone(), decoder_start_timeout);
        let controller_worker = tokio::spawn(controller.run());

        Self {
            client,
            lifecycle,
            reports,
            workers: Mutex::new(vec![report_worker, controller_worker]),
        }
    }

    pub fn handle(&self) -> LifecycleHandle {
        self.lifecycle.clone()
    }

    pub fn reports(&self) -> &ReportQueue {
        &self.reports
    }

    pub async fn spawn_poller(&self, profile: WorkerProfile, interval: Duration) {
        let poller = TaskPoller::new(
            self.client.clone(),
            self.lifecycle.clone(),
            self.reports.clone(),
            profile,
        )
        .with_interval(interval);

        let handle = tokio::spawn(async move {
            poller.run().await;
        });
        self.workers.lock().await.push(handle);
    }

    /// Stops polling, fails the active task and gives queued reports up to
    /// `flush_timeout` to reach the controller.
    pub async fn shutdown(&self, flush_timeout: Duration) {
        info!("Shutting down scheduler");
        self.lifecycle.stop_accepting();
        self.lifecycle.shutdown().await;

        if !self.reports.flush_timeout(flush_timeout).await {
            warn!("OUTGOINGREQUESTQUEUE: reports still pending after {:?}", flush_timeout);
        }

        for worker in self.workers.lock().await.drain(..) {
            worker.abort();
        }
    }
}
