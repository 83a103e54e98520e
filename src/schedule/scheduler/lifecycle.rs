use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::controller::{Report, ReservedTask};
use crate::error::FailureCode;
use crate::schedule::report::ReportQueue;
use crate::schedule::types::{
    is_supported_extension, DecoderSignal, LifecycleState, StagedPayload, Task, TaskEvent,
};
use crate::storage::sink::StorageSink;
use crate::transfer::FileTransfer;
use crate::workdir::{archive, is_safe_filename, Workdir};

/// Cloneable entry point used by the poller and the HTTP surface. Every
/// method only enqueues an event or reads published state.
#[derive(Clone)]
pub struct LifecycleHandle {
    events: mpsc::UnboundedSender<TaskEvent>,
    state: watch::Receiver<LifecycleState>,
    accepting: Arc<AtomicBool>,
}

impl LifecycleHandle {
    fn send(&self, event: TaskEvent) {
        if self.events.send(event).is_err() {
            error!("Lifecycle controller is gone, event dropped");
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn is_idle(&self) -> bool {
        self.state().is_idle()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn submit_reservation(&self, task: ReservedTask) {
        self.send(TaskEvent::Reserved(task));
    }

    pub fn decoder_status(&self, filename: String, status: String) {
        self.send(TaskEvent::DecoderStatus { filename, status });
    }

    pub fn decoder_error(&self, message: String) {
        self.send(TaskEvent::DecoderError { message });
    }

    pub fn request_retry(&self) {
        self.send(TaskEvent::Retry);
    }

    /// Resolves once the controller reports `Idle`.
    pub async fn wait_idle(&self) {
        let mut state = self.state.clone();
        loop {
            if state.borrow_and_update().is_idle() {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Fails the active task, if any, and stops the controller loop.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.events.send(TaskEvent::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

/// Owns the active task and drives it from reservation to cleanup.
pub struct LifecycleController {
    workdir: Arc<Workdir>,
    transfer: Arc<FileTransfer>,
    sink: Arc<dyn StorageSink>,
    reports: ReportQueue,
    start_timeout: Duration,
    events: mpsc::UnboundedReceiver<TaskEvent>,
    // results of spawned steps come back through here
    loopback: mpsc::UnboundedSender<TaskEvent>,
    state: watch::Sender<LifecycleState>,
    active: Option<Task>,
    attempt: u64,
    start_deadline: Option<Instant>,
    step: Option<JoinHandle<()>>,
}

impl LifecycleController {
    pub fn new(
        workdir: Arc<Workdir>,
        transfer: Arc<FileTransfer>,
        sink: Arc<dyn StorageSink>,
        reports: ReportQueue,
        start_timeout: Duration,
    ) -> (Self, LifecycleHandle) {
        let (sender, events) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(LifecycleState::Idle);

        let handle = LifecycleHandle {
            events: sender.clone(),
            state: state_rx,
            accepting: Arc::new(AtomicBool::new(true)),
        };

        let controller = Self {
            workdir,
            transfer,
            sink,
            reports,
            start_timeout,
            events,
            loopback: sender,
            state,
            active: None,
            attempt: 0,
            start_deadline: None,
            step: None,
        };
        (controller, handle)
    }

    pub async fn run(mut self) {
        info!("Lifecycle controller started");
        loop {
            let deadline = self.start_deadline;
            tokio::select! {
                biased;
                event = self.events.recv() => {
                    match event {
                        Some(event) => {
                            if !self.handle(event).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_start_timeout().await;
                }
            }
        }
        info!("Lifecycle controller stopped");
    }

    /// Returns false once the controller should stop.
    async fn handle(&mut self, event: TaskEvent) -> bool {
        match event {
            TaskEvent::Reserved(reserved) => self.on_reserved(reserved).await,
            TaskEvent::Downloaded { attempt, result } => self.on_downloaded(attempt, result).await,
            TaskEvent::DecoderStatus { filename, status } => self.on_decoder_status(filename, status).await,
            TaskEvent::DecoderError { message } => self.on_decoder_error(message).await,
            TaskEvent::Finalized { attempt, result } => self.on_finalized(attempt, result).await,
            TaskEvent::Retry => self.on_retry().await,
            TaskEvent::Shutdown(ack) => {
                self.on_shutdown().await;
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    fn current(&self) -> LifecycleState {
        *self.state.borrow()
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Lifecycle state {} -> {}", previous, state);
        }
    }

    fn task_id(&self) -> Option<String> {
        self.active.as_ref().and_then(|task| task.task_id.clone())
    }

    fn arm_start_timeout(&mut self) {
        self.start_deadline = Some(Instant::now() + self.start_timeout);
    }

    fn disarm_start_timeout(&mut self) {
        self.start_deadline = None;
    }

    async fn abort_step(&mut self) {
        if let Some(step) = self.step.take() {
            step.abort();
            let _ = step.await;
        }
    }

    async fn on_reserved(&mut self, reserved: ReservedTask) {
        if let Some(active) = &self.active {
            warn!(
                "Reservation {:?} received while task {} is active, ignoring",
                reserved.task_id,
                active.id()
            );
            return;
        }

        let task = Task::from(reserved);
        info!(task_id = task.id(), filename = %task.original_filename, "Task received");
        self.attempt += 1;
        let safe = is_safe_filename(&task.original_filename);
        let supported = is_supported_extension(&task.original_filename);
        self.active = Some(task);

        // nothing has been written yet, so neither path cleans up
        if !safe {
            error!("TASK_OBJECT_ERROR: file name is not a plain base name");
            return self.reject(FailureCode::TaskObjectError);
        }
        if !supported {
            return self.reject(FailureCode::FileExtensionNotSupported);
        }

        self.set_state(LifecycleState::Downloading);
        self.spawn_download();
    }

    fn spawn_download(&mut self) {
        let Some(task) = self.active.clone() else { return };
        let attempt = self.attempt;
        let workdir = self.workdir.clone();
        let transfer = self.transfer.clone();
        let loopback = self.loopback.clone();

        self.step = Some(tokio::spawn(async move {
            let result = download(&workdir, &transfer, &task).await;
            let _ = loopback.send(TaskEvent::Downloaded { attempt, result });
        }));
    }

    async fn on_downloaded(&mut self, attempt: u64, result: Result<StagedPayload, FailureCode>) {
        if attempt != self.attempt || self.current() != LifecycleState::Downloading {
            debug!("Ignoring download result of attempt {}", attempt);
            return;
        }
        self.step = None;

        let staged = match result {
            Ok(staged) => staged,
            Err(code) => return self.fail(code).await,
        };
        let Some(dest) = self.active.as_ref().map(|t| self.workdir.input_path(&t.original_filename)) else {
            return;
        };

        // the decoder may react as soon as the file appears, so the timer
        // has to exist before the move
        self.arm_start_timeout();
        if let Err(e) = fs::rename(&staged.path, &dest).await {
            error!("SAVING_AUDIOFILE_ERROR: failed to move payload into {}: {}", dest.display(), e);
            return self.fail(FailureCode::SavingAudiofileError).await;
        }

        info!("FILE: {} ({} bytes) handed to decoder", dest.display(), staged.bytes);
        self.set_state(LifecycleState::AwaitingDecoderStart);
    }

    async fn on_decoder_status(&mut self, filename: String, status: String) {
        let signal = DecoderSignal::parse(&status);
        if !is_safe_filename(&filename) {
            warn!("DECODER: status {:?} for unsafe file name {:?}, ignoring", status, filename);
            return;
        }
        info!("DECODER: {} is {}", filename, status);

        if self.active.is_none() {
            if signal == DecoderSignal::Progress {
                warn!("DECODER: progress for {} with no active task, ignoring", filename);
                return;
            }
            // abandoned tasks have had their input removed; only a file
            // still waiting in the input area is a direct submission
            let input = self.workdir.input_path(&filename);
            if !fs::try_exists(&input).await.unwrap_or(false) {
                warn!("DECODER: {} for {} with no active task and no input file, ignoring", status, filename);
                return;
            }
            info!("DECODER: {} has no reservation, assuming direct submission", filename);
            self.attempt += 1;
            self.active = Some(Task::direct(&filename));
            self.set_state(LifecycleState::Processing);
        }

        if let Some(task) = self.active.as_mut() {
            task.converted_filename = filename.clone();
            if task.task_id.is_none() {
                task.original_filename = filename;
            }
        }
        self.reports.push(self.task_id(), Report::Progress(status));

        let state = self.current();
        match (signal, state) {
            (DecoderSignal::Starting, LifecycleState::AwaitingDecoderStart) => {
                self.disarm_start_timeout();
                self.set_state(LifecycleState::Processing);
            }
            (DecoderSignal::Starting, LifecycleState::Processing) => {}
            (DecoderSignal::Done, LifecycleState::AwaitingDecoderStart | LifecycleState::Processing) => {
                self.disarm_start_timeout();
                self.set_state(LifecycleState::Finalizing);
                self.spawn_finalize();
            }
            (DecoderSignal::Progress, _) => {}
            (signal, state) => warn!("DECODER: {:?} ignored while {}", signal, state),
        }
    }

    async fn on_decoder_error(&mut self, message: String) {
        if self.active.is_none() {
            warn!("DECODER: error {:?} received with no active task", message);
            return;
        }
        self.fail(FailureCode::Decoder(message)).await;
    }

    fn spawn_finalize(&mut self) {
        let Some(task) = self.active.clone() else { return };
        let attempt = self.attempt;
        let workdir = self.workdir.clone();
        let sink = self.sink.clone();
        let loopback = self.loopback.clone();

        self.step = Some(tokio::spawn(async move {
            let result = finalize(&workdir, sink, &task).await;
            let _ = loopback.send(TaskEvent::Finalized { attempt, result });
        }));
    }

    async fn on_finalized(&mut self, attempt: u64, result: Result<String, FailureCode>) {
        if attempt != self.attempt || self.current() != LifecycleState::Finalizing {
            debug!("Ignoring finalize result of attempt {}", attempt);
            return;
        }
        self.step = None;

        match result {
            Ok(locator) => {
                info!(task_id = ?self.task_id(), "Task finished, results at {}", locator);
                self.reports.push(self.task_id(), Report::Success { locator });
                self.cleanup(false).await;
                self.reset();
            }
            Err(code) => self.fail(code).await,
        }
    }

    async fn on_retry(&mut self) {
        let Some(task) = &self.active else {
            info!("Retry requested with no active task");
            return;
        };
        info!(task_id = task.id(), "Abandoning task, retry requested");

        self.abort_step().await;
        self.disarm_start_timeout();
        self.reports.push(self.task_id(), Report::Retry);
        self.cleanup(true).await;
        self.reset();
    }

    async fn on_shutdown(&mut self) {
        if self.active.is_some() {
            self.fail(FailureCode::ContainerShutdown).await;
        }
    }

    async fn on_start_timeout(&mut self) {
        self.disarm_start_timeout();
        if self.current() == LifecycleState::AwaitingDecoderStart {
            self.fail(FailureCode::DecoderDidNotStart).await;
        }
    }

    /// Terminal failure: one error report, destructive cleanup, back to idle.
    async fn fail(&mut self, code: FailureCode) {
        self.abort_step().await;
        self.disarm_start_timeout();

        let task_id = self.task_id();
        error!(task_id = ?task_id, code = %code, "Task failed");
        self.reports.push(task_id, Report::Error(code));
        self.cleanup(true).await;
        self.reset();
    }

    /// Refuses the task before any file was written: one error report, no cleanup.
    fn reject(&mut self, code: FailureCode) {
        let task_id = self.task_id();
        error!(task_id = ?task_id, code = %code, "Task rejected");
        self.reports.push(task_id, Report::Error(code));
        self.reset();
    }

    async fn cleanup(&self, destructive: bool) {
        if let Some(task) = &self.active {
            self.workdir.cleanup(&task.filenames(), destructive).await;
        }
    }

    fn reset(&mut self) {
        self.active = None;
        self.set_state(LifecycleState::Idle);
    }

    #[cfg(test)]
    pub(crate) fn preload(&mut self, task: Task, state: LifecycleState) {
        self.attempt += 1;
        self.active = Some(task);
        if state == LifecycleState::AwaitingDecoderStart {
            self.arm_start_timeout();
        }
        self.set_state(state);
    }
}

async fn download(workdir: &Workdir, transfer: &FileTransfer, task: &Task) -> Result<StagedPayload, FailureCode> {
    if let Err(e) = workdir.write_sidecar(task).await {
        error!("FILE: Error creating metadata file: {:#}", e);
    }

    let staging = workdir.staging_path(&task.original_filename).await.map_err(|e| {
        error!("SAVING_AUDIOFILE_ERROR: cannot prepare staging area: {:#}", e);
        FailureCode::SavingAudiofileError
    })?;

    let bytes = transfer
        .fetch(&task.source_locator, &staging, workdir.input_dir())
        .await
        .map_err(|e| {
            let code = e.failure_code();
            error!("{}: {}", code, e);
            code
        })?;

    let mirror = workdir.output_path(&task.original_filename);
    if let Err(e) = fs::copy(&staging, &mirror).await {
        warn!("FILE: Error copying audio file to output: {}", e);
    }

    Ok(StagedPayload { path: staging, bytes })
}

async fn finalize(workdir: &Workdir, sink: Arc<dyn StorageSink>, task: &Task) -> Result<String, FailureCode> {
    let artifacts = match workdir.collect_artifacts(&task.converted_filename, &task.filenames()).await {
        Ok(artifacts) if !artifacts.is_empty() => artifacts,
        Ok(_) => {
            error!("TRANSCRIPTIONS_NOT_FOUND: no output for {}", task.converted_filename);
            return Err(FailureCode::TranscriptionsNotFound);
        }
        Err(e) => {
            error!("TRANSCRIPTIONS_NOT_FOUND: cannot read output area: {:#}", e);
            return Err(FailureCode::TranscriptionsNotFound);
        }
    };
    info!("Archiving {} artifacts for {}", artifacts.len(), task.converted_filename);

    let bytes = match tokio::task::spawn_blocking(move || archive::build_archive(&artifacts)).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            error!("ARCHIVE_ERROR: {:#}", e);
            return Err(FailureCode::ArchiveError);
        }
        Err(e) => {
            error!("ARCHIVE_ERROR: archiver panicked: {}", e);
            return Err(FailureCode::ArchiveError);
        }
    };

    let key = archive::archive_name(&task.original_filename);
    sink.put(&key, bytes).await.map_err(|e| {
        error!("UPLOAD_ERROR: {:#}", e);
        FailureCode::UploadError
    })
}
