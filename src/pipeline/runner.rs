//! Job runner: validates a job, wires the pipeline tasks together and
//! finalizes the output.
//!
//! ```text
//! created -> validated -> running -> completed | errored | cancelled
//! ```
//!
//! Validation failures move a job from `created` straight to `errored`. A
//! failed or cancelled run still finalizes its output: chunks released in
//! order before the stop are kept and `pipeline:complete` is false.

use super::backpressure::BackpressureGate;
use super::collector::{CollectorSummary, OrderedCollector};
use super::control::{task_failed, PipelineContext, RunControl};
use super::extraction::run_extraction_worker;
use super::segmentation::{run_segmentation_worker, Dispatcher};
use super::worker::{spawn_pool, WorkerInit, WorkerRole};
use super::{Metrics, MetricsReporter, MetricsSnapshot};
use crate::config::JobConfig;
use crate::error::{ErrorDetail, PipelineError, Result};
use crate::io::basin::BasinRecord;
use crate::io::dataset::{
    parse_index_mapping, DirectoryDataset, FrameSource, MappedSource, EVENT_COUNT_ATTR, PIXEL_SIZE_ATTR,
};
use crate::io::image_cache::ImageCache;
use crate::io::store::{DirectoryStore, OutputStore};
use crate::io::writer::{run_writer, EventWriter, BASIN_MAPPING};
use crate::ppid::{compute_ppid, PPID_GENERATION};
use crate::stages::segmenter::{self, DatasetInfo};
use crate::stages::{background, BackgroundEstimator, FeatureExtractor, Gate, HardwareProcessor, StageSet};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Image column processed by the pipeline.
pub const IMAGE_FEATURE: &str = "image";
/// Column holding a precomputed background.
pub const BACKGROUND_FEATURE: &str = "image_bg";

/// Crates whose behavior affects the output, recorded with every job.
const DEPENDENCIES: &[(&str, &str)] = &[
    ("ndarray", "0.16"),
    ("image", "0.25"),
    ("imageproc", "0.25"),
    ("rayon", "1.10"),
    ("zstd", "0.13"),
    ("bincode", "1.3"),
];

/// How long workers may take to wind down after a fatal error before their
/// tasks are aborted.
const WORKER_GRACE: Duration = Duration::from_secs(5);

/// Progress weight per stage: background, segmentation, extraction, writing.
const STAGE_WEIGHTS: [f64; 4] = [0.10, 0.40, 0.35, 0.15];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Created,
    Validated,
    Running,
    Completed,
    Errored,
    Cancelled,
}

impl JobState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Validated => "validated",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Read-only view of a job, safe to poll from any thread.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: JobState,
    /// Overall progress in `[0, 1]`, never decreasing
    pub progress: f64,
    pub stage: String,
    /// Seconds spent per stage, summed across workers
    pub stage_timings: BTreeMap<String, f64>,
    pub elapsed_secs: f64,
    pub error: Option<ErrorDetail>,
    /// Live counters of the run
    pub metrics: MetricsSnapshot,
}

#[derive(Default)]
struct StatusInner {
    state: Option<JobState>,
    progress: f64,
    error: Option<ErrorDetail>,
    started: Option<Instant>,
    finished: Option<Duration>,
    metrics: Option<Arc<Metrics>>,
    estimator: Option<Arc<dyn BackgroundEstimator>>,
    total_frames: usize,
}

/// Shared status of one job.
#[derive(Clone, Default)]
pub struct StatusHandle {
    inner: Arc<Mutex<StatusInner>>,
}

impl std::fmt::Debug for StatusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusHandle").field("state", &self.state()).finish()
    }
}

impl StatusHandle {
    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> JobState {
        self.lock().state.unwrap_or(JobState::Created)
    }

    fn set_state(&self, state: JobState) {
        let mut inner = self.lock();
        if state.is_terminal() {
            inner.finished = inner.started.map(|s| s.elapsed());
            if state == JobState::Completed {
                inner.progress = 1.0;
            }
        }
        inner.state = Some(state);
    }

    fn set_error(&self, detail: ErrorDetail) {
        self.lock().error = Some(detail);
    }

    fn start(&self, metrics: Arc<Metrics>, estimator: Arc<dyn BackgroundEstimator>, total_frames: usize) {
        let mut inner = self.lock();
        inner.started = Some(Instant::now());
        inner.metrics = Some(metrics);
        inner.estimator = Some(estimator);
        inner.total_frames = total_frames;
        inner.state = Some(JobState::Running);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let mut inner = self.lock();
        let state = inner.state.unwrap_or(JobState::Created);
        let snapshot = inner.metrics.as_ref().map(|m| m.snapshot()).unwrap_or_default();

        let mut stage = state.name().to_string();
        if let (Some(estimator), JobState::Running) = (&inner.estimator, state) {
            let total = inner.total_frames.max(1) as f64;
            let lost = snapshot.discarded_frames;
            let fraction = |frames: u64| ((frames + lost) as f64 / total).min(1.0);
            let background = if estimator.computes() { estimator.progress() } else { 1.0 };
            let parts = [
                background,
                fraction(snapshot.frames_segmented),
                fraction(snapshot.frames_extracted),
                (snapshot.frames_written as f64 / total).min(1.0),
            ];
            let (mut sum, mut weights) = (0.0, 0.0);
            for (i, (part, weight)) in parts.iter().zip(STAGE_WEIGHTS).enumerate() {
                if i == 0 && !estimator.computes() {
                    continue;
                }
                sum += part * weight;
                weights += weight;
            }
            inner.progress = inner.progress.max(sum / weights);

            let names = ["background", "segmentation", "extraction", "writing"];
            stage = names
                .iter()
                .zip(parts)
                .find(|(_, part)| *part < 1.0)
                .map_or("writing", |(name, _)| *name)
                .to_string();
        }

        let elapsed = inner
            .finished
            .or_else(|| inner.started.map(|s| s.elapsed()))
            .unwrap_or_default();
        StatusSnapshot {
            state,
            progress: inner.progress,
            stage,
            stage_timings: snapshot
                .stage_timings()
                .iter()
                .map(|(name, secs)| (name.to_string(), *secs))
                .collect(),
            elapsed_secs: elapsed.as_secs_f64(),
            error: inner.error.clone(),
            metrics: snapshot,
        }
    }
}

/// Timestamped run log mirrored to `tracing` and stored with the output.
#[derive(Debug, Clone)]
pub struct RunLog {
    started: Instant,
    lines: Arc<Mutex<Vec<String>>>,
}

impl Default for RunLog {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            lines: Arc::default(),
        }
    }
}

impl RunLog {
    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{message}");
        self.push("INFO", message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.push("WARN", message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("{message}");
        self.push("ERROR", message);
    }

    fn push(&self, level: &str, message: String) {
        let line = format!("[{:>10.3}s] {level:<5} {message}", self.started.elapsed().as_secs_f64());
        self.lines.lock().unwrap_or_else(|p| p.into_inner()).push(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub ppid: String,
    pub state: JobState,
    /// Frames in the processed view
    pub frames: usize,
    pub events: u64,
    pub chunks: usize,
    pub failed_chunks: usize,
    pub discarded_frames: usize,
    /// Whether every frame was processed
    pub complete: bool,
    pub metrics: MetricsSnapshot,
    pub output: Option<PathBuf>,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} events from {} frames in {} chunks ({} failed, {} frames discarded), {:.1}s",
            self.state,
            self.events,
            self.frames,
            self.chunks,
            self.failed_chunks,
            self.discarded_frames,
            self.metrics.elapsed.as_secs_f64()
        )
    }
}

/// Everything resolved during validation.
struct Prepared {
    source: Arc<dyn FrameSource>,
    stages: StageSet,
    ppid: String,
    estimator: Arc<dyn BackgroundEstimator>,
    gate: Gate,
    seg_workers: usize,
    ext_workers: usize,
}

pub struct JobRunner {
    config: JobConfig,
    input: Option<Arc<dyn FrameSource>>,
    store: Option<Box<dyn OutputStore>>,
    prepared: Option<Prepared>,
    status: StatusHandle,
    cancel: Arc<AtomicBool>,
    log: RunLog,
}

impl JobRunner {
    /// Runner reading and writing the directories named in `config`.
    pub fn new(config: JobConfig) -> Self {
        Self {
            config,
            input: None,
            store: None,
            prepared: None,
            status: StatusHandle::default(),
            cancel: Arc::new(AtomicBool::new(false)),
            log: RunLog::default(),
        }
    }

    /// Runner over an already opened input and output.
    pub fn from_parts(config: JobConfig, input: Arc<dyn FrameSource>, store: Box<dyn OutputStore>) -> Self {
        let mut runner = Self::new(config);
        runner.input = Some(input);
        runner.store = Some(store);
        runner
    }

    pub fn state(&self) -> JobState {
        self.status.state()
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    /// The PPID, once validated.
    pub fn ppid(&self) -> Option<&str> {
        self.prepared.as_ref().map(|p| p.ppid.as_str())
    }

    /// Flag that cancels the run when set.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Resolve stages, compute the PPID and check that the job can run.
    pub fn validate(&mut self) -> Result<()> {
        match self.state() {
            JobState::Created => {}
            JobState::Validated => return Ok(()),
            other => return Err(PipelineError::config(format!("job is {other} and cannot be validated"))),
        }
        match self.prepare() {
            Ok(prepared) => {
                self.log.info(format!("Validated job, PPID {}", prepared.ppid));
                self.prepared = Some(prepared);
                self.status.set_state(JobState::Validated);
                Ok(())
            }
            Err(e) => {
                self.log.error(format!("Validation failed: {e}"));
                self.status.set_error(ErrorDetail::from_error(&e, vec!["validation".to_string()]));
                self.status.set_state(JobState::Errored);
                Err(e)
            }
        }
    }

    fn prepare(&mut self) -> Result<Prepared> {
        let config = &self.config;
        config.validate()?;

        let input = match &self.input {
            Some(input) => input.clone(),
            None => {
                let dataset = DirectoryDataset::open(&config.input.path).map_err(|e| {
                    PipelineError::config(format!("cannot open input {}: {e}", config.input.path.display()))
                })?;
                Arc::new(dataset) as Arc<dyn FrameSource>
            }
        };
        let source: Arc<dyn FrameSource> = match parse_index_mapping(&config.input.index_mapping, input.len())? {
            Some(indices) => Arc::new(MappedSource::new(input.clone(), indices)?),
            None => input.clone(),
        };
        if !source.has_feature(IMAGE_FEATURE) {
            return Err(PipelineError::config(format!("input has no '{IMAGE_FEATURE}' column")));
        }

        let pixel_size = source
            .attrs()
            .get(PIXEL_SIZE_ATTR)
            .and_then(|v| v.trim().parse::<f64>().ok());
        let stages = config.stage_set(pixel_size)?;
        let ppid = compute_ppid(PPID_GENERATION, &stages);
        if let Some(expected) = &config.stages.expected_ppid {
            if *expected != ppid {
                return Err(PipelineError::PpidMismatch {
                    expected: expected.clone(),
                    computed: ppid,
                });
            }
        }

        let estimator: Arc<dyn BackgroundEstimator> = Arc::from(background::from_spec(&stages.background)?);
        estimator.validate(source.as_ref())?;

        let segmenter = segmenter::from_spec(&stages.segmenter)?;
        if !source.is_empty() {
            let first = source.read_rows(IMAGE_FEATURE, 0, 1)?;
            let frame_shape = match first.item_shape() {
                [h, w] => (*h, *w),
                other => return Err(PipelineError::config(format!("frames have shape {other:?}, expected 2-D"))),
            };
            let info = DatasetInfo {
                frame_shape,
                len: source.len(),
                has_background: source.has_feature(BACKGROUND_FEATURE),
            };
            segmenter.validate_applicability(&info).map_err(|reason| {
                PipelineError::config(format!("segmenter '{}' cannot process this input: {reason}", segmenter.code()))
            })?;
        }
        FeatureExtractor::from_spec(&stages.features, stages.pixel_size())?;
        let gate = Gate::from_spec(&stages.gate, source.attrs())?;

        let accelerator = segmenter.hardware_processor() == HardwareProcessor::Accelerator;
        let (seg_workers, ext_workers) = config.processing.worker_counts(accelerator);
        if seg_workers == 0 || ext_workers == 0 {
            return Err(PipelineError::config("at least one worker per pool is required"));
        }

        if self.store.is_none() {
            let input_root = std::path::absolute(&config.input.path).unwrap_or_else(|_| config.input.path.clone());
            let output_root = std::path::absolute(&config.output.path).unwrap_or_else(|_| config.output.path.clone());
            if input_root == output_root {
                return Err(PipelineError::config("output path must differ from the input path"));
            }
            // Existing output is only replaced once the run starts
            if output_root.is_file() {
                return Err(PipelineError::config(format!("output path {} is a file", output_root.display())));
            }
            std::fs::create_dir_all(&output_root).map_err(|e| {
                PipelineError::config(format!("output {} is not writable: {e}", output_root.display()))
            })?;
        }

        Ok(Prepared {
            source,
            stages,
            ppid,
            estimator,
            gate,
            seg_workers,
            ext_workers,
        })
    }

    /// Run the job to a terminal state. Validates first if needed.
    ///
    /// A cancelled run returns `Ok` with state [`JobState::Cancelled`]; a
    /// failed run returns the first fatal error after finalizing the output.
    pub async fn run(&mut self) -> Result<RunSummary> {
        if self.state() == JobState::Created {
            self.validate()?;
        }
        let prepared = match (self.state(), self.prepared.take()) {
            (JobState::Validated, Some(p)) => p,
            (state, _) => return Err(PipelineError::config(format!("job is {state} and cannot run"))),
        };
        let store: Box<dyn OutputStore> = match self.store.take() {
            Some(store) => store,
            None => match DirectoryStore::create(&self.config.output.path) {
                Ok(store) => Box::new(store),
                Err(e) => return Err(self.fail(e, &prepared.ppid)),
            },
        };

        let metrics = Metrics::new();
        let total = prepared.source.len();
        self.status
            .start(metrics.clone(), prepared.estimator.clone(), total);
        self.log.info(format!(
            "Processing {total} frames with {} segmentation and {} extraction workers",
            prepared.seg_workers, prepared.ext_workers
        ));

        let control = Arc::new(RunControl::new(self.cancel.clone()));
        let outcome = self.execute(&prepared, store, metrics.clone(), control.clone()).await;

        let (mut store, collected, events, writer_columns) = match outcome {
            Ok(parts) => parts,
            Err(e) => {
                // Nothing was written
                return Err(self.fail(e, &prepared.ppid));
            }
        };

        let error = control.take_error();
        let cancelled = control.is_cancelled();
        let complete = error.is_none() && !cancelled && metrics.snapshot().frames_written as usize == total;

        let finalized = self.finalize(store.as_mut(), &prepared, &metrics, events, complete, &writer_columns, error.as_ref());
        let error = match (error, finalized) {
            (Some(e), _) => Some(e),
            (None, Err(e)) => Some(e),
            (None, Ok(())) => None,
        };

        let snapshot = metrics.snapshot();
        if let Some(path) = &self.config.processing.metrics_output_path {
            if let Err(e) = snapshot.save_to_file(path) {
                warn!("Cannot save metrics: {e}");
            }
        }

        if let Some(e) = error {
            return Err(self.fail(e, &prepared.ppid));
        }

        let state = if cancelled { JobState::Cancelled } else { JobState::Completed };
        self.status.set_state(state);
        let summary = RunSummary {
            ppid: prepared.ppid.clone(),
            state,
            frames: total,
            events,
            chunks: collected.released_chunks,
            failed_chunks: collected.failed_chunks,
            discarded_frames: collected.discarded_frames,
            complete,
            metrics: snapshot,
            output: self.input.is_none().then(|| self.config.output.path.clone()),
        };
        info!("{summary}");
        Ok(summary)
    }

    fn fail(&self, error: PipelineError, ppid: &str) -> PipelineError {
        let context = vec![
            format!("ppid {ppid}"),
            format!("input {}", self.config.input.path.display()),
        ];
        self.status.set_error(ErrorDetail::from_error(&error, context));
        self.status.set_state(JobState::Errored);
        error
    }

    /// Start every pipeline task and wait for all of them.
    async fn execute(
        &self,
        prepared: &Prepared,
        store: Box<dyn OutputStore>,
        metrics: Arc<Metrics>,
        control: Arc<RunControl>,
    ) -> Result<(Box<dyn OutputStore>, CollectorSummary, u64, Vec<String>)> {
        let p = &self.config.processing;
        let total = prepared.source.len();

        let cache = Arc::new(ImageCache::new(
            prepared.source.clone(),
            IMAGE_FEATURE,
            p.chunk_size,
            p.cache_slots,
            Some(metrics.clone()),
        )?);
        let threshold = p.stall_threshold(prepared.seg_workers, prepared.ext_workers);
        let gate = Arc::new(BackpressureGate::new(threshold, &p.stall, metrics.clone()));
        self.log.info(format!(
            "{} chunks of {} frames, dispatch stalls at {threshold} outstanding chunks",
            cache.num_chunks(),
            cache.chunk_size()
        ));

        let executable = p.worker_executable.as_deref();
        let seg_init = WorkerInit::new(WorkerRole::Segmentation, &prepared.stages, &prepared.gate)?;
        let ext_init = WorkerInit::new(WorkerRole::Extraction, &prepared.stages, &prepared.gate)?;
        let seg_pool = spawn_pool(&seg_init, prepared.seg_workers, p.worker_mode, executable).await?;
        let ext_pool = spawn_pool(&ext_init, prepared.ext_workers, p.worker_mode, executable).await?;

        let reporter_shutdown = if p.enable_metrics {
            let (tx, rx) = mpsc::channel::<()>(1);
            let reporter = MetricsReporter::new(metrics.clone(), p.metrics_interval_secs, total as u64);
            tokio::spawn(reporter.run(rx));
            Some(tx)
        } else {
            None
        };

        let (ctx, completions) = PipelineContext::new(control.clone(), metrics.clone());
        let (seg_tx, seg_rx) = async_channel::bounded(p.queue_depth);
        let (ext_tx, ext_rx) = async_channel::bounded(p.queue_depth);
        let (release_tx, release_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher::new(cache.clone(), prepared.estimator.clone(), gate.clone(), ctx.clone());
        let dispatch = spawn_stage(&control, dispatcher.run(seg_tx));

        let mut workers = Vec::new();
        for worker in seg_pool {
            workers.push(spawn_stage(
                &control,
                run_segmentation_worker(worker, seg_rx.clone(), ext_tx.clone(), ctx.clone()),
            ));
        }
        for worker in ext_pool {
            workers.push(spawn_stage(&control, run_extraction_worker(worker, ext_rx.clone(), ctx.clone())));
        }
        drop((seg_rx, ext_tx, ext_rx, ctx));

        let collector = OrderedCollector::new(
            cache.chunk_size(),
            total,
            p.max_discard_fraction,
            Duration::from_secs(p.chunk_timeout_secs),
            gate.clone(),
            metrics.clone(),
            control.clone(),
        );
        let collect = spawn_stage(&control, collector.run(completions, release_tx));

        let writer = Arc::new(Mutex::new(EventWriter::new(store, prepared.source.clone(), p.write_flush_bytes)));
        let write = spawn_stage(&control, run_writer(writer.clone(), release_rx, gate.clone(), metrics.clone()));

        let dispatched = join_stage(&control, "segmentation", dispatch).await.unwrap_or(0);
        for handle in workers {
            join_worker(&control, handle).await;
        }
        let collected = join_stage(&control, "collector", collect).await.unwrap_or_default();
        let events = join_stage(&control, "writer", write).await.unwrap_or(0);

        if let Some(tx) = reporter_shutdown {
            let _ = tx.send(()).await;
        }
        info!(
            dispatched,
            released = collected.released_chunks,
            peak_write_queue = gate.peak_write_queue_size(),
            "Pipeline tasks finished"
        );

        let writer = Arc::try_unwrap(writer)
            .map_err(|_| PipelineError::integrity("writer", None, "writer still in use after the run"))?
            .into_inner()
            .unwrap_or_else(|p| p.into_inner());
        let columns = writer.column_names();
        let store = writer.finish()?;
        Ok((store, collected, events, columns))
    }

    /// Attributes, logs and basins of the output.
    #[allow(clippy::too_many_arguments)]
    fn finalize(
        &self,
        store: &mut dyn OutputStore,
        prepared: &Prepared,
        metrics: &Metrics,
        events: u64,
        complete: bool,
        columns: &[String],
        error: Option<&PipelineError>,
    ) -> Result<()> {
        let source = &prepared.source;
        for (key, value) in source.attrs() {
            store.set_attr(key, serde_json::Value::String(value.clone()))?;
        }
        if prepared.stages.pixel_size() > 0.0 {
            store.set_attr(PIXEL_SIZE_ATTR, serde_json::json!(prepared.stages.pixel_size()))?;
        }
        store.set_attr("pipeline:ppid", serde_json::json!(prepared.ppid))?;
        store.set_attr("pipeline:ppid generation", serde_json::json!(PPID_GENERATION))?;
        for spec in prepared.stages.iter() {
            store.set_attr(&format!("pipeline:dcnum {}", spec.kind.name()), serde_json::json!(spec.fragment()))?;
        }
        store.set_attr("pipeline:yield", serde_json::json!(events))?;
        store.set_attr("pipeline:complete", serde_json::json!(complete))?;
        store.set_attr(EVENT_COUNT_ATTR, serde_json::json!(events))?;

        if self.config.output.basin_to_input && events > 0 {
            if let Some(location) = source.location() {
                let features: Vec<String> = source
                    .features()
                    .into_iter()
                    .filter(|f| !columns.contains(f))
                    .collect();
                let basin = BasinRecord::file("input", "input dataset", location, &self.config.output.path, features)
                    .with_mapping(BASIN_MAPPING);
                let key = store.store_basin(&basin)?;
                self.log.info(format!("Referenced input through basin {key}"));
            }
        }

        let snapshot = metrics.snapshot();
        if let Some(e) = error {
            self.log.error(format!("Run failed: {e}"));
            let detail = ErrorDetail::from_error(e, vec![format!("ppid {}", prepared.ppid)]);
            let lines = serde_json::to_string_pretty(&detail)?.lines().map(str::to_string).collect::<Vec<_>>();
            store.store_log("error", &lines)?;
        } else if self.cancel.load(Ordering::SeqCst) {
            self.log.warn(format!("Run cancelled after {} frames", snapshot.frames_written));
        } else {
            self.log.info(format!("Wrote {events} events from {} frames", snapshot.frames_written));
        }

        store.store_log("run", &self.log.lines())?;
        store.store_log("job", &self.job_log(prepared)?)?;
        let mut timing: Vec<String> = snapshot
            .stage_timings()
            .iter()
            .map(|(name, secs)| format!("{name}: {secs:.3} s"))
            .collect();
        timing.push(format!("stalls: {} ({:.3} s)", snapshot.stalls, snapshot.stall_secs));
        timing.push(format!("total: {:.3} s", snapshot.elapsed.as_secs_f64()));
        store.store_log("timing", &timing)?;
        store.flush()
    }

    fn job_log(&self, prepared: &Prepared) -> Result<Vec<String>> {
        let job = serde_json::json!({
            "config": self.config,
            "ppid": prepared.ppid,
            "ppid_generation": PPID_GENERATION,
            "stages": prepared.stages,
            "version": env!("CARGO_PKG_VERSION"),
            "dependencies": DEPENDENCIES.iter().copied().collect::<BTreeMap<_, _>>(),
        });
        Ok(serde_json::to_string_pretty(&job)?.lines().map(str::to_string).collect())
    }
}

/// Spawn a pipeline task. A fatal error stops the whole run.
fn spawn_stage<T, F>(control: &Arc<RunControl>, task: F) -> JoinHandle<Option<T>>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let control = control.clone();
    tokio::spawn(async move {
        match task.await {
            Ok(value) => Some(value),
            Err(e) => {
                control.fail(e);
                None
            }
        }
    })
}

/// Join a worker task. Once the run has failed the worker gets a grace
/// period, after which the task is aborted and its process killed on drop.
async fn join_worker(control: &RunControl, mut handle: JoinHandle<Option<()>>) {
    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = control.stopped() => match tokio::time::timeout(WORKER_GRACE, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!("Worker did not stop within {WORKER_GRACE:?}, aborting it");
                handle.abort();
                return;
            }
        },
    };
    if let Err(e) = joined {
        control.fail(task_failed("worker", e));
    }
}

async fn join_stage<T>(control: &RunControl, stage: &str, handle: JoinHandle<Option<T>>) -> Option<T> {
    match handle.await {
        Ok(value) => value,
        Err(e) => {
            control.fail(task_failed(stage, e));
            None
        }
    }
}
