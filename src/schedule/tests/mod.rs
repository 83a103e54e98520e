use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::{routing::get, Router};
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::sleep;

use super::*;
use crate::config::WorkerProfile;
use crate::controller::{ControllerClient, Report, ReserveRequest, ReservedTask};
use crate::error::FailureCode;
use crate::storage::sink::StorageSink;
use crate::transfer::tests::FixedSpace;
use crate::transfer::FileTransfer;
use crate::workdir::Workdir;

#[derive(Default)]
struct FakeController {
    next: Mutex<Option<ReservedTask>>,
    unreachable: AtomicBool,
    delivered: Mutex<Vec<(String, Report)>>,
}

#[async_trait]
impl ControllerClient for FakeController {
    async fn reserve(&self, _request: &ReserveRequest) -> Result<Option<ReservedTask>> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        Ok(self.next.lock().unwrap().take())
    }

    async fn report(&self, task_id: &str, report: &Report) -> Result<()> {
        self.delivered.lock().unwrap().push((task_id.to_string(), report.clone()));
        Ok(())
    }
}

#[derive(Default)]
struct FakeSink {
    fail: AtomicBool,
    stored: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl StorageSink for FakeSink {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("bucket not found"));
        }
        self.stored.lock().unwrap().push((key.to_string(), bytes));
        Ok(format!("memory://{}", key))
    }
}

struct Harness {
    _dir: TempDir,
    workdir: Arc<Workdir>,
    client: Arc<FakeController>,
    sink: Arc<FakeSink>,
    reports: ReportQueue,
    handle: LifecycleHandle,
}

impl Harness {
    async fn start(space: u64, start_timeout: Duration, preload: Option<(Task, LifecycleState)>) -> Self {
        let dir = TempDir::new().unwrap();
        let workdir = Arc::new(Workdir::new(
            dir.path().join("input"),
            dir.path().join("output"),
            dir.path().join("details"),
        ));
        workdir.ensure().await.unwrap();

        let client = Arc::new(FakeController::default());
        let sink = Arc::new(FakeSink::default());
        let (reports, _) = ReportQueue::spawn(client.clone());
        let transfer = Arc::new(FileTransfer::new(Arc::new(FixedSpace(space))));

        let (mut controller, handle) =
            LifecycleController::new(workdir.clone(), transfer, sink.clone(), reports.clone(), start_timeout);
        if let Some((task, state)) = preload {
            controller.preload(task, state);
        }
        tokio::spawn(controller.run());

        Self { _dir: dir, workdir, client, sink, reports, handle }
    }

    async fn delivered(&self) -> Vec<(String, Report)> {
        self.reports.flush().await;
        self.client.delivered.lock().unwrap().clone()
    }

    async fn wait_state(&self, state: LifecycleState) {
        eventually(&format!("state {}", state), || self.handle.state() == state).await;
    }

    async fn wait_reports(&self, count: usize) -> Vec<(String, Report)> {
        eventually("reports", || self.client.delivered.lock().unwrap().len() >= count).await;
        self.delivered().await
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn serve_payload(size: usize) -> String {
    let app = Router::new().route("/call.wav", get(move || async move { vec![1u8; size] }));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/call.wav", addr)
}

fn reserved(task_id: &str, queue: &str, filename: &str, link: &str) -> ReservedTask {
    serde_json::from_value(json!({
        "task_id": task_id,
        "queue": queue,
        "data": {
            "filename": filename,
            "cloud-link": link,
            "formats": [".txt", ".json"],
            "numChn": 2,
        }
    }))
    .unwrap()
}

fn labels(delivered: &[(String, Report)]) -> Vec<Report> {
    delivered.iter().map(|(_, report)| report.clone()).collect()
}

fn profile() -> WorkerProfile {
    WorkerProfile {
        name: "10.0.0.1-host".to_string(),
        queue: "normal".to_string(),
        language: "en".to_string(),
        sampling_rate: "16khz".to_string(),
    }
}

#[tokio::test]
async fn test_task_completes_and_uploads_archive() {
    let link = serve_payload(4096).await;
    let h = Harness::start(10_000_000, Duration::from_secs(30), None).await;

    h.handle.submit_reservation(reserved("t-1", "normal", "call.wav", &link));
    h.wait_state(LifecycleState::AwaitingDecoderStart).await;

    let input = h.workdir.input_path("call.wav");
    assert_eq!(std::fs::read(&input).unwrap().len(), 4096);
    assert!(h.workdir.sidecar_path("call.wav").exists());
    assert!(h.workdir.output_path("call.wav").exists());

    h.handle.decoder_status("call.wav".into(), "STARTING".into());
    h.wait_state(LifecycleState::Processing).await;

    std::fs::write(h.workdir.output_path("call.txt"), "hello").unwrap();
    std::fs::write(h.workdir.output_path("call.json"), "{}").unwrap();
    h.handle.decoder_status("call.wav".into(), "DONE".into());
    h.handle.wait_idle().await;

    let delivered = h.delivered().await;
    assert!(delivered.iter().all(|(id, _)| id == "t-1"));
    assert_eq!(
        labels(&delivered),
        vec![
            Report::Progress("STARTING".into()),
            Report::Progress("DONE".into()),
            Report::Success { locator: "memory://call.zip".into() },
        ]
    );

    let stored = h.sink.stored.lock().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].0, "call.zip");
    let archive = zip::ZipArchive::new(Cursor::new(stored[0].1.clone())).unwrap();
    let mut names: Vec<_> = archive.file_names().map(str::to_string).collect();
    names.sort();
    assert_eq!(names, vec!["call.json", "call.txt"]);

    assert!(!input.exists());
    assert!(!h.workdir.sidecar_path("call.wav").exists());
}

#[tokio::test]
async fn test_disk_full_fails_without_writing() {
    let link = serve_payload(200_000).await;
    let h = Harness::start(50_000, Duration::from_secs(30), None).await;

    h.handle.submit_reservation(reserved("t-2", "normal", "call.wav", &link));
    let delivered = h.wait_reports(1).await;

    assert_eq!(labels(&delivered), vec![Report::Error(FailureCode::LocaldiskFull)]);
    assert_eq!(delivered[0].0, "t-2");
    h.handle.wait_idle().await;
    assert!(!h.workdir.input_path("call.wav").exists());
    assert!(!h.workdir.output_path("call.wav").exists());
}

#[tokio::test]
async fn test_missing_payload_reports_download_error() {
    let link = serve_payload(10).await.replace("call.wav", "missing.wav");
    let h = Harness::start(10_000_000, Duration::from_secs(30), None).await;

    h.handle.submit_reservation(reserved("t-3", "normal", "call.wav", &link));
    let delivered = h.wait_reports(1).await;

    assert_eq!(labels(&delivered), vec![Report::Error(FailureCode::DownloadError)]);
}

#[tokio::test]
async fn test_decoder_never_starts() {
    let link = serve_payload(1024).await;
    let h = Harness::start(10_000_000, Duration::from_millis(300), None).await;

    h.handle.submit_reservation(reserved("t-4", "normal", "call.wav", &link));
    h.wait_state(LifecycleState::AwaitingDecoderStart).await;
    assert!(h.workdir.input_path("call.wav").exists());

    let delivered = h.wait_reports(1).await;
    assert_eq!(labels(&delivered), vec![Report::Error(FailureCode::DecoderDidNotStart)]);
    h.handle.wait_idle().await;
    assert!(!h.workdir.input_path("call.wav").exists());
    assert!(!h.workdir.sidecar_path("call.wav").exists());
}

#[tokio::test]
async fn test_unsupported_extension_is_rejected() {
    let h = Harness::start(10_000_000, Duration::from_secs(30), None).await;

    h.handle.submit_reservation(reserved("t-5", "normal", "notes.xyz", "http://127.0.0.1:1/notes.xyz"));
    let delivered = h.wait_reports(1).await;

    assert_eq!(labels(&delivered), vec![Report::Error(FailureCode::FileExtensionNotSupported)]);
    h.handle.wait_idle().await;
    assert!(!h.workdir.sidecar_path("notes.xyz").exists());
}

#[tokio::test(start_paused = true)]
async fn test_starting_just_before_expiry_disarms_timeout() {
    let task = Task::from(reserved("t-6", "normal", "call.wav", "http://x/call.wav"));
    let h = Harness::start(0, Duration::from_millis(30_000), Some((task, LifecycleState::AwaitingDecoderStart))).await;

    sleep(Duration::from_millis(29_999)).await;
    h.handle.decoder_status("call.wav".into(), "STARTING".into());
    sleep(Duration::from_millis(60_000)).await;

    assert_eq!(h.handle.state(), LifecycleState::Processing);
    assert_eq!(labels(&h.delivered().await), vec![Report::Progress("STARTING".into())]);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fires_without_starting() {
    let task = Task::from(reserved("t-7", "normal", "call.wav", "http://x/call.wav"));
    let h = Harness::start(0, Duration::from_millis(30_000), Some((task, LifecycleState::AwaitingDecoderStart))).await;

    sleep(Duration::from_millis(30_001)).await;
    h.handle.wait_idle().await;

    assert_eq!(labels(&h.delivered().await), vec![Report::Error(FailureCode::DecoderDidNotStart)]);
}

#[tokio::test]
async fn test_decoder_error_is_passed_through() {
    let task = Task::from(reserved("t-8", "normal", "call.wav", "http://x/call.wav"));
    let h = Harness::start(0, Duration::from_secs(30), Some((task, LifecycleState::Processing))).await;
    std::fs::write(h.workdir.output_path("call.txt"), "partial").unwrap();

    h.handle.decoder_error("ERROR unsupported codec".into());
    h.handle.wait_idle().await;

    assert_eq!(
        labels(&h.delivered().await),
        vec![Report::Error(FailureCode::Decoder("ERROR unsupported codec".into()))]
    );
    assert!(!h.workdir.output_path("call.txt").exists());
}

#[tokio::test]
async fn test_done_without_artifacts() {
    let task = Task::from(reserved("t-9", "normal", "call.wav", "http://x/call.wav"));
    let h = Harness::start(0, Duration::from_secs(30), Some((task, LifecycleState::Processing))).await;

    h.handle.decoder_status("call.wav".into(), "DONE".into());
    let delivered = h.wait_reports(2).await;

    assert_eq!(
        labels(&delivered),
        vec![
            Report::Progress("DONE".into()),
            Report::Error(FailureCode::TranscriptionsNotFound),
        ]
    );
}

#[tokio::test]
async fn test_upload_failure() {
    let task = Task::from(reserved("t-10", "normal", "call.wav", "http://x/call.wav"));
    let h = Harness::start(0, Duration::from_secs(30), Some((task, LifecycleState::Processing))).await;
    h.sink.fail.store(true, Ordering::SeqCst);
    std::fs::write(h.workdir.output_path("call.txt"), "hello").unwrap();

    h.handle.decoder_status("call.wav".into(), "DONE".into());
    let delivered = h.wait_reports(2).await;

    assert_eq!(delivered[1].1, Report::Error(FailureCode::UploadError));
    h.handle.wait_idle().await;
    assert!(!h.workdir.output_path("call.txt").exists());
}

#[tokio::test]
async fn test_retry_abandons_task() {
    let task = Task::from(reserved("t-11", "normal", "call.wav", "http://x/call.wav"));
    let h = Harness::start(0, Duration::from_secs(30), Some((task, LifecycleState::Processing))).await;
    std::fs::write(h.workdir.input_path("call.wav"), "audio").unwrap();
    std::fs::write(h.workdir.output_path("call.txt"), "partial").unwrap();

    h.handle.request_retry();
    h.handle.wait_idle().await;

    assert_eq!(labels(&h.delivered().await), vec![Report::Retry]);
    assert!(!h.workdir.input_path("call.wav").exists());
    assert!(!h.workdir.output_path("call.txt").exists());
}

#[tokio::test]
async fn test_shutdown_fails_active_task() {
    let task = Task::from(reserved("t-12", "normal", "call.wav", "http://x/call.wav"));
    let h = Harness::start(0, Duration::from_secs(30), Some((task, LifecycleState::Processing))).await;

    h.handle.shutdown().await;

    assert!(h.handle.is_idle());
    assert_eq!(labels(&h.delivered().await), vec![Report::Error(FailureCode::ContainerShutdown)]);
}

#[tokio::test]
async fn test_reservation_ignored_while_busy() {
    let task = Task::from(reserved("t-13", "normal", "call.wav", "http://x/call.wav"));
    let h = Harness::start(0, Duration::from_secs(30), Some((task, LifecycleState::Processing))).await;

    h.handle.submit_reservation(reserved("t-14", "normal", "other.wav", "http://x/other.wav"));
    h.handle.decoder_status("call.wav".into(), "DECODING 50%".into());
    let delivered = h.wait_reports(1).await;

    assert_eq!(delivered, vec![("t-13".to_string(), Report::Progress("DECODING 50%".into()))]);
    assert_eq!(h.handle.state(), LifecycleState::Processing);
}

#[tokio::test]
async fn test_direct_submission_is_archived_without_reports() {
    let h = Harness::start(0, Duration::from_secs(30), None).await;
    std::fs::write(h.workdir.input_path("manual.wav"), "audio").unwrap();

    h.handle.decoder_status("manual.wav".into(), "DECODING 10%".into());
    h.handle.decoder_status("manual.wav".into(), "STARTING".into());
    h.wait_state(LifecycleState::Processing).await;

    std::fs::write(h.workdir.output_path("manual.txt"), "hello").unwrap();
    h.handle.decoder_status("manual.wav".into(), "DONE".into());
    eventually("upload", || !h.sink.stored.lock().unwrap().is_empty()).await;
    h.handle.wait_idle().await;

    assert_eq!(h.sink.stored.lock().unwrap()[0].0, "manual.zip");
    assert!(h.delivered().await.is_empty());
}

#[tokio::test]
async fn test_late_callbacks_for_abandoned_task_are_ignored() {
    let task = Task::from(reserved("t-18", "normal", "call.wav", "http://x/call.wav"));
    let h = Harness::start(0, Duration::from_secs(30), Some((task, LifecycleState::Processing))).await;
    std::fs::write(h.workdir.input_path("call.wav"), "audio").unwrap();

    h.handle.request_retry();
    h.handle.wait_idle().await;
    std::fs::write(h.workdir.output_path("call.txt"), "late").unwrap();

    h.handle.decoder_status("call.wav".into(), "STARTING".into());
    h.handle.decoder_status("call.wav".into(), "DONE".into());
    sleep(Duration::from_millis(100)).await;

    assert!(h.handle.is_idle());
    assert!(h.sink.stored.lock().unwrap().is_empty());
    assert_eq!(labels(&h.delivered().await), vec![Report::Retry]);

    let poller = TaskPoller::new(h.client.clone(), h.handle.clone(), h.reports.clone(), profile());
    assert_eq!(poller.poll_once().await, PollOutcome::NoWork);
}

#[tokio::test]
async fn test_decoder_paths_outside_work_areas_are_ignored() {
    let h = Harness::start(0, Duration::from_secs(30), None).await;
    let outside = h._dir.path().join("precious.wav");
    std::fs::write(&outside, "keep").unwrap();

    h.handle.decoder_status(outside.to_str().unwrap().into(), "DONE".into());
    h.handle.decoder_status("../precious.wav".into(), "STARTING".into());
    sleep(Duration::from_millis(100)).await;

    assert!(h.handle.is_idle());
    assert!(outside.exists());
}

#[tokio::test]
async fn test_reservation_with_path_filename_is_rejected() {
    let h = Harness::start(10_000_000, Duration::from_secs(30), None).await;
    let outside = h._dir.path().join("precious.wav");
    std::fs::write(&outside, "keep").unwrap();

    h.handle.submit_reservation(reserved("t-19", "normal", outside.to_str().unwrap(), "http://127.0.0.1:1/x.wav"));
    let delivered = h.wait_reports(1).await;

    assert_eq!(delivered, vec![("t-19".to_string(), Report::Error(FailureCode::TaskObjectError))]);
    h.handle.wait_idle().await;
    assert!(outside.exists());
}

#[tokio::test]
async fn test_unsupported_extension_leaves_earlier_results() {
    let h = Harness::start(10_000_000, Duration::from_secs(30), None).await;
    std::fs::write(h.workdir.output_path("notes.txt"), "earlier transcript").unwrap();

    h.handle.submit_reservation(reserved("t-20", "normal", "notes.xyz", "http://127.0.0.1:1/notes.xyz"));
    h.wait_reports(1).await;
    h.handle.wait_idle().await;

    assert!(h.workdir.output_path("notes.txt").exists());
}

#[tokio::test]
async fn test_poller_discards_foreign_queue() {
    let h = Harness::start(0, Duration::from_secs(30), None).await;
    *h.client.next.lock().unwrap() = Some(reserved("t-15", "priority", "call.wav", "http://x/call.wav"));

    let poller = TaskPoller::new(h.client.clone(), h.handle.clone(), h.reports.clone(), profile());
    assert_eq!(poller.poll_once().await, PollOutcome::Discarded);
    assert_eq!(poller.poll_once().await, PollOutcome::NoWork);

    sleep(Duration::from_millis(50)).await;
    assert!(h.handle.is_idle());
    assert_eq!(std::fs::read_dir(h.workdir.input_dir()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_poller_hands_task_to_lifecycle() {
    let h = Harness::start(0, Duration::from_secs(30), None).await;
    *h.client.next.lock().unwrap() = Some(reserved("t-16", "normal", "notes.xyz", "http://x/notes.xyz"));

    let poller = TaskPoller::new(h.client.clone(), h.handle.clone(), h.reports.clone(), profile());
    assert_eq!(poller.poll_once().await, PollOutcome::Accepted);

    let delivered = h.wait_reports(1).await;
    assert_eq!(delivered[0].0, "t-16");
}

#[tokio::test]
async fn test_poller_stops_on_request_and_survives_errors() {
    let h = Harness::start(0, Duration::from_secs(30), None).await;
    let poller = TaskPoller::new(h.client.clone(), h.handle.clone(), h.reports.clone(), profile());

    h.client.unreachable.store(true, Ordering::SeqCst);
    assert_eq!(poller.poll_once().await, PollOutcome::Failed);
    // no task id to report against
    assert!(h.delivered().await.is_empty());

    h.handle.stop_accepting();
    assert_eq!(poller.poll_once().await, PollOutcome::Busy);
    tokio::time::timeout(Duration::from_secs(1), poller.run()).await.unwrap();
}

#[tokio::test]
async fn test_scheduler_shutdown_flushes_reports() {
    let dir = TempDir::new().unwrap();
    let workdir = Arc::new(Workdir::new(
        dir.path().join("input"),
        dir.path().join("output"),
        dir.path().join("details"),
    ));
    workdir.ensure().await.unwrap();
    let client = Arc::new(FakeController::default());
    *client.next.lock().unwrap() = Some(reserved("t-17", "normal", "notes.xyz", "http://x/notes.xyz"));

    let scheduler = TaskScheduler::new(
        client.clone(),
        Arc::new(FakeSink::default()),
        workdir,
        Arc::new(FileTransfer::new(Arc::new(FixedSpace(0)))),
        Duration::from_secs(30),
    );
    scheduler.spawn_poller(profile(), Duration::from_millis(20)).await;
    eventually("rejection", || !client.delivered.lock().unwrap().is_empty()).await;

    scheduler.shutdown(Duration::from_secs(1)).await;
    assert!(!scheduler.handle().is_accepting());
    assert_eq!(
        labels(&client.delivered.lock().unwrap()),
        vec![Report::Error(FailureCode::FileExtensionNotSupported)]
    );
}
