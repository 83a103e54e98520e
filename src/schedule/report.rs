use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::controller::{ControllerClient, Report};

enum Job {
    Send {
        task_id: Option<String>,
        report: Report,
    },
    Flush(oneshot::Sender<()>),
}

/// Funnels every report to the controller through a single worker, so calls
/// are never concurrent and complete in submission order.
#[derive(Clone)]
pub struct ReportQueue {
    sender: mpsc::UnboundedSender<Job>,
}

impl ReportQueue {
    pub fn spawn(client: Arc<dyn ControllerClient>) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(drain(client, receiver));
        (Self { sender }, handle)
    }

    /// Queues `report` for the task that was active when it was produced.
    pub fn push(&self, task_id: Option<String>, report: Report) {
        if self.sender.send(Job::Send { task_id, report }).is_err() {
            error!("OUTGOINGREQUESTQUEUE: queue is closed, report dropped");
        }
    }

    /// Resolves once everything queued before this call has been attempted.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(Job::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    pub async fn flush_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.flush()).await.is_ok()
    }
}

async fn drain(client: Arc<dyn ControllerClient>, mut receiver: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = receiver.recv().await {
        match job {
            Job::Send { task_id: None, report } => {
                warn!(
                    "WARNING_DIRECT_SUBMISSION: No task_id found. Assuming direct submission. {} report {:?} NOT sent to Task Controller.",
                    report.kind(),
                    report
                );
            }
            Job::Send { task_id: Some(task_id), report } => {
                // failures are logged and the queue moves on
                match client.report(&task_id, &report).await {
                    Ok(()) => info!("TASKCONTROLLER: {} report for task {} sent", report.kind(), task_id),
                    Err(e) => error!(
                        "TASKCONTROLLER: Error sending {} report for task {}: {}",
                        report.kind(),
                        task_id,
                        e
                    ),
                }
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    info!("OUTGOINGREQUESTQUEUE: drained and closed");
}
