use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::{Message, PipelineError, StatsCollector, StatsSnapshot, Task, TaskSource, TaskState};
use crate::accel::{AccelError, Accelerator};
use crate::config::PipelineConfig;

const UPLOADER: &str = "uploader";
const LAUNCHER: &str = "launcher";
const DOWNLOADER: &str = "downloader";

/// State every stage thread shares.
#[derive(Clone)]
struct StageContext {
    backend: Arc<dyn Accelerator>,
    stats: Arc<StatsCollector>,
    /// First fatal failure. Once set, stages discard instead of processing.
    fatal: Arc<Mutex<Option<String>>>,
}

impl StageContext {
    fn aborted(&self) -> bool {
        self.fatal.lock().is_some()
    }

    fn report(&self, err: PipelineError) {
        if err.is_fatal() {
            error!(error = %err, "fatal backend failure, draining pipeline");
            self.fatal.lock().get_or_insert_with(|| err.to_string());
        } else {
            error!(error = %err, "task dropped");
        }
    }

    /// Drop a task that will not complete and give back its buffer set.
    fn discard(&self, stage: &'static str, mut task: Box<Task>) {
        if let Some(idx) = task.buffer_idx.take() {
            self.backend.release_buffer_set(idx);
        }
        self.stats.record_failure();
        debug!(stage, task_id = task.id, state = ?task.state(), "task discarded");
    }
}

fn stage_err(stage: &'static str, task_id: u64) -> impl FnOnce(AccelError) -> PipelineError {
    move |source| PipelineError::Stage {
        stage,
        task_id,
        source,
    }
}

fn upload(ctx: &StageContext, task: &mut Task) -> Result<(), PipelineError> {
    let idx = ctx
        .backend
        .acquire_buffer_set()
        .map_err(stage_err(UPLOADER, task.id))?;
    task.buffer_idx = Some(idx);
    task.advance(TaskState::BufferAcquired)?;

    ctx.backend
        .send_data_async(task)
        .map_err(stage_err(UPLOADER, task.id))?;
    task.advance(TaskState::UploadSubmitted)
}

fn launch(ctx: &StageContext, task: &mut Task) -> Result<(), PipelineError> {
    ctx.backend
        .execute_async(task)
        .map_err(stage_err(LAUNCHER, task.id))?;
    task.advance(TaskState::ExecutionSubmitted)
}

/// Blocking read-back up to retirement. Returns the backend's compute time.
fn download(ctx: &StageContext, task: &mut Task) -> Result<Duration, PipelineError> {
    let computed = ctx
        .backend
        .read_results_blocking(task)
        .map_err(stage_err(DOWNLOADER, task.id))?;
    task.advance(TaskState::ResultsReady)?;

    if let Some(idx) = task.buffer_idx.take() {
        ctx.backend.release_buffer_set(idx);
    }
    task.advance(TaskState::Retired)?;
    Ok(computed)
}

/// Runs `step` on each task and forwards it. Used by the uploader and launcher.
fn run_forwarding_stage(
    stage: &'static str,
    ctx: StageContext,
    rx: Receiver<Message>,
    tx: Sender<Message>,
    step: fn(&StageContext, &mut Task) -> Result<(), PipelineError>,
) {
    // A disconnected input is treated like a stream end.
    for message in rx.iter() {
        let mut task = match message {
            Message::StreamEnd => break,
            Message::Task(task) => task,
        };
        if ctx.aborted() {
            ctx.discard(stage, task);
            continue;
        }
        match step(&ctx, &mut task) {
            Ok(()) => {
                if let Err(e) = tx.send(Message::Task(task)) {
                    warn!(stage, "next stage is gone, stopping");
                    if let Message::Task(task) = e.into_inner() {
                        ctx.discard(stage, task);
                    }
                    break;
                }
            }
            Err(e) => {
                ctx.report(e);
                ctx.discard(stage, task);
            }
        }
    }
    let _ = tx.send(Message::StreamEnd);
    debug!(stage, "stage exiting");
}

fn run_downloader(
    ctx: StageContext,
    rx: Receiver<Message>,
    results: Sender<Box<Task>>,
    done: oneshot::Sender<u64>,
) {
    let mut last_completion: Option<Instant> = None;

    for message in rx.iter() {
        let mut task = match message {
            Message::StreamEnd => break,
            Message::Task(task) => task,
        };
        if ctx.aborted() {
            ctx.discard(DOWNLOADER, task);
            continue;
        }
        match download(&ctx, &mut task) {
            Ok(computed) => {
                let now = Instant::now();
                let in_node = task
                    .arrival_time
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or_default();
                let gap = last_completion.map(|t| now.saturating_duration_since(t));
                last_completion = Some(now);

                ctx.stats.record(computed, in_node, gap);
                debug!(
                    task_id = task.id,
                    computed_us = computed.as_micros() as u64,
                    in_node_us = in_node.as_micros() as u64,
                    "task retired"
                );
                // Nobody listening is fine: the task is simply dropped here.
                let _ = results.send(task);
            }
            Err(e) => {
                ctx.report(e);
                ctx.discard(DOWNLOADER, task);
            }
        }
    }

    let processed = ctx.stats.tasks_processed();
    if done.send(processed).is_err() {
        debug!("completion handle dropped before count was published");
    }
    debug!(processed, "downloader exiting");
}

/// Resolves to the processed-task count once the downloader has seen the end
/// of the stream.
#[derive(Debug)]
pub struct CompletionHandle {
    rx: oneshot::Receiver<u64>,
}

impl CompletionHandle {
    /// Block the calling thread. Must not be used from inside an async
    /// runtime; use [`wait`](Self::wait) there.
    pub fn blocking_wait(self) -> Result<u64, PipelineError> {
        self.rx
            .blocking_recv()
            .map_err(|_| PipelineError::CompletionDropped)
    }

    pub async fn wait(self) -> Result<u64, PipelineError> {
        self.rx.await.map_err(|_| PipelineError::CompletionDropped)
    }

    /// The count, if it has been published already.
    pub fn try_get(&mut self) -> Option<u64> {
        self.rx.try_recv().ok()
    }
}

/// Runs tasks through an accelerator on three stage threads.
pub struct PipelineNode {
    backend_name: String,
    intake: Option<Sender<Message>>,
    results: Option<Receiver<Box<Task>>>,
    completion: Option<CompletionHandle>,
    stats: Arc<StatsCollector>,
    fatal: Arc<Mutex<Option<String>>>,
    stages: Vec<(&'static str, JoinHandle<()>)>,
    stream_ended: bool,
    submitted: u64,
}

impl PipelineNode {
    /// Initialize `backend` and start the stage threads.
    pub fn start(mut backend: Box<dyn Accelerator>, config: &PipelineConfig) -> Result<Self, PipelineError> {
        backend.initialize().map_err(PipelineError::Init)?;
        let backend_name = backend.name().to_string();

        let ctx = StageContext {
            backend: Arc::from(backend),
            stats: Arc::new(StatsCollector::new()),
            fatal: Arc::new(Mutex::new(None)),
        };

        let capacity = config.queue_capacity.max(1);
        let (intake_tx, intake_rx) = crossbeam_channel::bounded(capacity);
        let (upload_tx, upload_rx) = crossbeam_channel::bounded(capacity);
        let (launch_tx, launch_rx) = crossbeam_channel::bounded(capacity);
        let (results_tx, results_rx) = crossbeam_channel::unbounded();
        let (done_tx, done_rx) = oneshot::channel();

        let mut node = Self {
            backend_name,
            intake: Some(intake_tx),
            results: Some(results_rx),
            completion: Some(CompletionHandle { rx: done_rx }),
            stats: Arc::clone(&ctx.stats),
            fatal: Arc::clone(&ctx.fatal),
            stages: Vec::with_capacity(3),
            stream_ended: false,
            submitted: 0,
        };

        // On a spawn failure the closures not yet started are dropped with
        // their channel ends, and dropping `node` stops the started ones.
        let uploader_ctx = ctx.clone();
        node.spawn(UPLOADER, move || {
            run_forwarding_stage(UPLOADER, uploader_ctx, intake_rx, upload_tx, upload)
        })?;
        let launcher_ctx = ctx.clone();
        node.spawn(LAUNCHER, move || {
            run_forwarding_stage(LAUNCHER, launcher_ctx, upload_rx, launch_tx, launch)
        })?;
        node.spawn(DOWNLOADER, move || run_downloader(ctx, launch_rx, results_tx, done_tx))?;

        info!(
            backend = %node.backend_name,
            queue_capacity = capacity,
            "pipeline node started"
        );
        Ok(node)
    }

    fn spawn<F>(&mut self, stage: &'static str, body: F) -> Result<(), PipelineError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("accelpipe-{}", stage))
            .spawn(body)
            .map_err(|source| PipelineError::Spawn { stage, source })?;
        self.stages.push((stage, handle));
        Ok(())
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    /// Hand a task to the uploader. Blocks while the intake queue is full.
    pub fn submit(&mut self, mut task: Task) -> Result<(), PipelineError> {
        if self.stream_ended {
            return Err(PipelineError::Closed);
        }
        let intake = self.intake.as_ref().ok_or(PipelineError::Closed)?;

        task.arrival_time = Some(Instant::now());
        let task_id = task.id;
        intake
            .send(Message::Task(Box::new(task)))
            .map_err(|_| PipelineError::Closed)?;
        self.submitted += 1;
        debug!(task_id, "task accepted");
        Ok(())
    }

    /// Signal that no more tasks follow. Further calls are no-ops.
    pub fn end_stream(&mut self) {
        if self.stream_ended {
            return;
        }
        self.stream_ended = true;
        if let Some(intake) = &self.intake {
            let _ = intake.send(Message::StreamEnd);
        }
        debug!(submitted = self.submitted, "stream ended");
    }

    /// Submit everything `source` yields, then end the stream. Returns the
    /// number of tasks submitted so far.
    pub fn feed<S: TaskSource + ?Sized>(&mut self, source: &mut S) -> Result<u64, PipelineError> {
        while let Some(task) = source.next_task() {
            self.submit(task)?;
        }
        self.end_stream();
        Ok(self.submitted)
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Retired tasks, in submission order. Can be taken once; if it is never
    /// taken (or is dropped) retired tasks are discarded.
    pub fn take_results(&mut self) -> Option<Receiver<Box<Task>>> {
        self.results.take()
    }

    /// The one-shot processed count. Can be taken once.
    pub fn take_completion(&mut self) -> Option<CompletionHandle> {
        self.completion.take()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the node: push a final stream end in case none was sent, then
    /// join the uploader, launcher and downloader in that order.
    pub fn shutdown(mut self) -> Result<StatsSnapshot, PipelineError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<StatsSnapshot, PipelineError> {
        // Unread results must not keep the downloader from finishing.
        self.results = None;
        if let Some(intake) = self.intake.take() {
            let _ = intake.send(Message::StreamEnd);
        }

        let mut panicked = None;
        for (stage, handle) in self.stages.drain(..) {
            if handle.join().is_err() {
                error!(stage, "stage thread panicked");
                panicked.get_or_insert(stage);
            }
        }
        if let Some(stage) = panicked {
            return Err(PipelineError::StagePanicked { stage });
        }
        if let Some(reason) = self.fatal.lock().take() {
            return Err(PipelineError::Fatal(reason));
        }

        let stats = self.stats.snapshot();
        info!(
            backend = %self.backend_name,
            submitted = self.submitted,
            processed = stats.tasks_processed,
            failed = stats.tasks_failed,
            "pipeline node stopped"
        );
        Ok(stats)
    }
}

impl Drop for PipelineNode {
    fn drop(&mut self) {
        if self.stages.is_empty() && self.intake.is_none() {
            return;
        }
        if let Err(e) = self.stop() {
            warn!(error = %e, "pipeline node stopped with an error");
        }
    }
}

impl std::fmt::Debug for PipelineNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineNode")
            .field("backend", &self.backend_name)
            .field("submitted", &self.submitted)
            .field("stream_ended", &self.stream_ended)
            .field("running_stages", &self.stages.len())
            .finish()
    }
}
