//! Segmentation and feature extraction workers.
//!
//! A worker is either a blocking task in this process or a child process
//! started from this executable with the hidden `worker` command. Both run
//! the same [`WorkerRuntime`]; the process backend exchanges
//! length-prefixed bincode messages with the child over its stdin and
//! stdout. Each worker computes on a single thread.

use crate::config::WorkerMode;
use crate::error::{PipelineError, Result};
use crate::events::FrameEvents;
use crate::stages::features::{correct_frame, FeatureExtractor, FrameInput};
use crate::stages::segmenter::{self, SegmenterInput};
use crate::stages::{Gate, Segmenter, StageSet};
use ndarray::{Array3, Axis};
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

/// How long a new worker process may take to report ready.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a worker process may take to exit after shutdown.
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames of one chunk with their background, ready for segmentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationTask {
    pub chunk_index: usize,
    pub start: usize,
    pub images: Array3<u8>,
    pub background: Option<Array3<u8>>,
    pub bg_off: Option<Vec<f64>>,
}

impl SegmentationTask {
    pub fn len(&self) -> usize {
        self.images.dim().0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A segmented chunk, ready for feature extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentedChunk {
    pub chunk_index: usize,
    pub start: usize,
    pub images: Array3<u8>,
    /// Background-corrected frames, when a background was subtracted
    pub corrected: Option<Array3<i16>>,
    pub labels: Array3<u16>,
    pub bg_off: Option<Vec<f64>>,
}

impl SegmentedChunk {
    pub fn len(&self) -> usize {
        self.images.dim().0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Events of every frame of a chunk, in frame order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedChunk {
    pub chunk_index: usize,
    pub start: usize,
    pub frames: Vec<FrameEvents>,
    /// Events removed by the gate
    pub masks_dropped: u64,
}

impl ExtractedChunk {
    /// A chunk whose frames carry no events.
    pub fn empty(chunk_index: usize, frames: std::ops::Range<usize>) -> Self {
        Self {
            chunk_index,
            start: frames.start,
            frames: frames.map(FrameEvents::empty).collect(),
            masks_dropped: 0,
        }
    }

    pub fn event_count(&self) -> usize {
        self.frames.iter().map(|f| f.events.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerRole {
    Segmentation,
    Extraction,
}

impl WorkerRole {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Segmentation => "segmentation",
            Self::Extraction => "extraction",
        }
    }
}

/// Everything a worker needs to build its stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInit {
    pub role: WorkerRole,
    /// The run's [`StageSet`] as JSON
    pub stages_json: String,
    /// Resolved gate threshold
    pub size_thresh_mask: u64,
}

impl WorkerInit {
    pub fn new(role: WorkerRole, stages: &StageSet, gate: &Gate) -> Result<Self> {
        Ok(Self {
            role,
            stages_json: serde_json::to_string(stages)?,
            size_thresh_mask: gate.size_thresh_mask,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    Init(WorkerInit),
    Segment(SegmentationTask),
    Extract(SegmentedChunk),
    Shutdown,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Ready,
    Segmented(SegmentedChunk),
    Extracted(ExtractedChunk),
    Failed(String),
}

/// Stage instances of one worker.
pub struct WorkerRuntime {
    role: WorkerRole,
    segmenter: Option<Box<dyn Segmenter>>,
    extractor: Option<(FeatureExtractor, Gate)>,
}

impl WorkerRuntime {
    pub fn new(init: &WorkerInit) -> Result<Self> {
        let stages: StageSet = serde_json::from_str(&init.stages_json)?;
        let mut runtime = Self {
            role: init.role,
            segmenter: None,
            extractor: None,
        };
        match init.role {
            WorkerRole::Segmentation => runtime.segmenter = Some(segmenter::from_spec(&stages.segmenter)?),
            WorkerRole::Extraction => {
                let extractor = FeatureExtractor::from_spec(&stages.features, stages.pixel_size())?;
                let gate = Gate {
                    size_thresh_mask: init.size_thresh_mask,
                };
                runtime.extractor = Some((extractor, gate));
            }
        }
        Ok(runtime)
    }

    /// Answer one request. Failures become [`Response::Failed`].
    pub fn handle(&self, request: Request) -> Response {
        let result = match (request, &self.segmenter, &self.extractor) {
            (Request::Segment(task), Some(seg), _) => segment_chunk(seg.as_ref(), task).map(Response::Segmented),
            (Request::Extract(chunk), _, Some((extractor, gate))) => {
                extract_chunk(extractor, gate, chunk).map(Response::Extracted)
            }
            (Request::Init(_), _, _) | (Request::Shutdown, _, _) => Ok(Response::Ready),
            (_, _, _) => Err(PipelineError::config(format!(
                "{} worker cannot handle this request",
                self.role.name()
            ))),
        };
        result.unwrap_or_else(|e| Response::Failed(e.to_string()))
    }
}

fn segment_chunk(segmenter: &dyn Segmenter, task: SegmentationTask) -> Result<SegmentedChunk> {
    let (n, h, w) = task.images.dim();
    let needs_correction = segmenter.requires_background_correction();

    let corrected = (needs_correction || task.background.is_some()).then(|| {
        let mut out = Array3::<i16>::zeros((n, h, w));
        for (i, mut frame) in out.outer_iter_mut().enumerate() {
            let background = task.background.as_ref().map(|b| b.index_axis(Axis(0), i));
            let offset = task.bg_off.as_ref().and_then(|o| o.get(i)).copied().unwrap_or(0.0);
            frame.assign(&correct_frame(task.images.index_axis(Axis(0), i), background, offset));
        }
        out
    });

    let masks = (0..n)
        .into_par_iter()
        .map(|i| {
            let input = match (&corrected, needs_correction) {
                (Some(c), true) => SegmenterInput::Corrected(c.index_axis(Axis(0), i)),
                _ => SegmenterInput::Raw(task.images.index_axis(Axis(0), i)),
            };
            segmenter.segment(input)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut labels = Array3::<u16>::zeros((n, h, w));
    for (i, mask) in masks.into_iter().enumerate() {
        if mask.dim() != (h, w) {
            return Err(PipelineError::integrity(
                "segmentation",
                Some(task.chunk_index),
                format!("mask shape {:?} differs from frame shape {:?}", mask.dim(), (h, w)),
            ));
        }
        labels.index_axis_mut(Axis(0), i).assign(&mask);
    }

    Ok(SegmentedChunk {
        chunk_index: task.chunk_index,
        start: task.start,
        images: task.images,
        corrected,
        labels,
        bg_off: task.bg_off,
    })
}

fn extract_chunk(extractor: &FeatureExtractor, gate: &Gate, chunk: SegmentedChunk) -> Result<ExtractedChunk> {
    let results: Vec<(FrameEvents, usize)> = (0..chunk.len())
        .into_par_iter()
        .map(|i| {
            let frame_index = chunk.start + i;
            let input = FrameInput {
                frame_index,
                image: chunk.images.index_axis(Axis(0), i),
                corrected: chunk.corrected.as_ref().map(|c| c.index_axis(Axis(0), i)),
                labels: chunk.labels.index_axis(Axis(0), i),
            };
            let mut events = extractor.extract(&input);
            let dropped = gate.apply(&mut events);
            let frame = FrameEvents {
                frame_index,
                bg_off: chunk.bg_off.as_ref().and_then(|o| o.get(i)).copied(),
                events,
            };
            (frame, dropped)
        })
        .collect();

    let masks_dropped = results.iter().map(|(_, d)| *d as u64).sum();
    Ok(ExtractedChunk {
        chunk_index: chunk.chunk_index,
        start: chunk.start,
        frames: results.into_iter().map(|(f, _)| f).collect(),
        masks_dropped,
    })
}

/// In-process backend: blocking tasks inside a one-thread rayon pool.
struct ThreadWorker {
    runtime: Arc<WorkerRuntime>,
    pool: Arc<rayon::ThreadPool>,
}

impl ThreadWorker {
    fn new(init: &WorkerInit) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .map_err(|e| PipelineError::config(format!("cannot build worker thread pool: {e}")))?;
        Ok(Self {
            runtime: Arc::new(WorkerRuntime::new(init)?),
            pool: Arc::new(pool),
        })
    }

    async fn call(&self, request: Request) -> Result<Response> {
        let runtime = self.runtime.clone();
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || pool.install(|| runtime.handle(request)))
            .await
            .map_err(|e| PipelineError::integrity("worker", None, format!("worker task panicked: {e}")))
    }
}

/// Child process backend.
struct ProcessWorker {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl ProcessWorker {
    async fn spawn(executable: &Path, id: usize, init: &WorkerInit) -> Result<Self> {
        let mut child = Command::new(executable)
            .arg("worker")
            .arg("--id")
            .arg(id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PipelineError::integrity("worker", None, "child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::integrity("worker", None, "child stdout unavailable"))?;
        let mut worker = Self {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
        };

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, worker.call(&Request::Init(init.clone()))).await {
            Ok(Ok(Response::Ready)) => Ok(worker),
            Ok(Ok(Response::Failed(message))) => Err(PipelineError::config(message)),
            Ok(Ok(_)) => Err(PipelineError::integrity("worker", None, "unexpected handshake reply")),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PipelineError::integrity("worker", None, "worker process did not report ready")),
        }
    }

    async fn call(&mut self, request: &Request) -> Result<Response> {
        write_message(&mut self.stdin, request).await?;
        read_message(&mut self.stdout).await
    }

    async fn shutdown(mut self) {
        let _ = write_message(&mut self.stdin, &Request::Shutdown).await;
        match tokio::time::timeout(EXIT_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) if !status.success() => warn!("Worker process exited with {status}"),
            Ok(_) => {}
            Err(_) => {
                warn!("Worker process did not exit, killing it");
                let _ = self.child.kill().await;
            }
        }
    }

    async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Cannot kill worker process: {e}");
        }
    }
}

async fn write_message<W: AsyncWrite + Unpin, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let bytes = bincode::serialize(message)?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| PipelineError::integrity("worker", None, format!("message of {} bytes too large", bytes.len())))?;
    writer.write_u32_le(len).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_message<R: AsyncRead + Unpin, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let len = reader.read_u32_le().await? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

enum Backend {
    Thread(ThreadWorker),
    Process(ProcessWorker),
}

/// One worker of a pool.
pub struct WorkerHandle {
    id: usize,
    init: WorkerInit,
    executable: Option<PathBuf>,
    backend: Backend,
}

impl WorkerHandle {
    /// Start a worker. In process mode a worker that cannot be started
    /// falls back to a thread.
    pub async fn spawn(id: usize, init: WorkerInit, mode: WorkerMode, executable: Option<&Path>) -> Result<Self> {
        let executable = match (mode, executable) {
            (WorkerMode::Thread, _) => None,
            (WorkerMode::Process, Some(path)) => Some(path.to_path_buf()),
            (WorkerMode::Process, None) => std::env::current_exe().ok(),
        };
        let backend = match &executable {
            None => Backend::Thread(ThreadWorker::new(&init)?),
            Some(exe) => match ProcessWorker::spawn(exe, id, &init).await {
                Ok(process) => {
                    debug!(role = init.role.name(), id, "Started worker process");
                    Backend::Process(process)
                }
                Err(e) => {
                    warn!(role = init.role.name(), id, "Cannot start worker process ({e}), using a thread");
                    Backend::Thread(ThreadWorker::new(&init)?)
                }
            },
        };
        Ok(Self {
            id,
            init,
            executable,
            backend,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_process(&self) -> bool {
        matches!(self.backend, Backend::Process(_))
    }

    pub async fn segment(&mut self, task: SegmentationTask) -> Result<SegmentedChunk> {
        let chunk = task.chunk_index;
        match self.call(chunk, Request::Segment(task)).await? {
            Response::Segmented(seg) => Ok(seg),
            other => Err(self.unexpected(chunk, &other)),
        }
    }

    pub async fn extract(&mut self, segmented: SegmentedChunk) -> Result<ExtractedChunk> {
        let chunk = segmented.chunk_index;
        match self.call(chunk, Request::Extract(segmented)).await? {
            Response::Extracted(extracted) => Ok(extracted),
            other => Err(self.unexpected(chunk, &other)),
        }
    }

    async fn call(&mut self, chunk: usize, request: Request) -> Result<Response> {
        let response = match &mut self.backend {
            Backend::Thread(worker) => worker.call(request).await,
            Backend::Process(worker) => {
                let response = worker.call(&request).await;
                if let Err(e) = &response {
                    warn!(role = self.init.role.name(), id = self.id, chunk, "Worker process failed: {e}");
                    self.respawn().await?;
                }
                response
            }
        };
        match response {
            Ok(Response::Failed(message)) => Err(self.transient(chunk, message)),
            Ok(r) => Ok(r),
            Err(e) => Err(self.transient(chunk, e.to_string())),
        }
    }

    /// Replace a crashed worker process, falling back to a thread.
    async fn respawn(&mut self) -> Result<()> {
        let process = match &self.executable {
            Some(exe) => ProcessWorker::spawn(exe, self.id, &self.init).await,
            None => Err(PipelineError::config("no worker executable")),
        };
        self.backend = match process {
            Ok(p) => {
                info!(role = self.init.role.name(), id = self.id, "Restarted worker process");
                Backend::Process(p)
            }
            Err(e) => {
                warn!(role = self.init.role.name(), id = self.id, "Cannot restart worker process ({e}), using a thread");
                Backend::Thread(ThreadWorker::new(&self.init)?)
            }
        };
        Ok(())
    }

    fn transient(&self, chunk: usize, message: String) -> PipelineError {
        PipelineError::TransientWorker {
            stage: self.init.role.name().to_string(),
            chunk,
            worker: self.id,
            message,
        }
    }

    fn unexpected(&self, chunk: usize, response: &Response) -> PipelineError {
        let kind = match response {
            Response::Ready => "ready",
            Response::Segmented(_) => "segmented",
            Response::Extracted(_) => "extracted",
            Response::Failed(_) => "failed",
        };
        self.transient(chunk, format!("unexpected '{kind}' response"))
    }

    pub async fn shutdown(self) {
        if let Backend::Process(process) = self.backend {
            process.shutdown().await;
        }
    }

    /// Stop a worker whose call was abandoned mid-request. A thread worker
    /// finishes its current task in the background.
    pub async fn kill(self) {
        if let Backend::Process(process) = self.backend {
            warn!(role = self.init.role.name(), id = self.id, "Killing worker process");
            process.kill().await;
        }
    }
}

/// Start `count` workers concurrently.
pub async fn spawn_pool(
    init: &WorkerInit,
    count: usize,
    mode: WorkerMode,
    executable: Option<&Path>,
) -> Result<Vec<WorkerHandle>> {
    let spawns = (0..count).map(|id| WorkerHandle::spawn(id, init.clone(), mode, executable));
    let workers = futures::future::try_join_all(spawns).await?;
    let processes = workers.iter().filter(|w| w.is_process()).count();
    info!(
        role = init.role.name(),
        workers = count,
        processes,
        "Worker pool ready"
    );
    Ok(workers)
}

/// Serve requests on stdin/stdout until shutdown. Entry point of the
/// `worker` command.
pub fn serve_stdio() -> Result<()> {
    let mut input = std::io::BufReader::new(std::io::stdin().lock());
    let mut output = std::io::BufWriter::new(std::io::stdout().lock());
    let mut runtime: Option<WorkerRuntime> = None;

    loop {
        let request: Request = match read_message_blocking(&mut input) {
            Ok(r) => r,
            Err(PipelineError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Parent closed the pipe");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let response = match request {
            Request::Shutdown => return Ok(()),
            Request::Init(init) => match WorkerRuntime::new(&init) {
                Ok(r) => {
                    debug!(role = init.role.name(), "Worker initialized");
                    runtime = Some(r);
                    Response::Ready
                }
                Err(e) => Response::Failed(e.to_string()),
            },
            other => match &runtime {
                Some(r) => r.handle(other),
                None => Response::Failed("worker not initialized".to_string()),
            },
        };
        write_message_blocking(&mut output, &response)?;
    }
}

fn read_message_blocking<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let mut buf = vec![0u8; u32::from_le_bytes(len) as usize];
    reader.read_exact(&mut buf)?;
    Ok(bincode::deserialize(&buf)?)
}

fn write_message_blocking<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let bytes = bincode::serialize(message)?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| PipelineError::integrity("worker", None, format!("message of {} bytes too large", bytes.len())))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{KwargValue, Kwargs, StageKind, StageSpec};
    use ndarray::s;

    fn stages() -> StageSet {
        let mut data = Kwargs::new();
        data.insert("pixel_size".into(), KwargValue::Float(0.5));
        let empty = Kwargs::new();
        StageSet {
            data: StageSpec::resolve(StageKind::Data, "store", &data, None).unwrap(),
            background: StageSpec::resolve(StageKind::Background, "none", &empty, None).unwrap(),
            segmenter: StageSpec::resolve(StageKind::Segmenter, "thresh", &empty, None).unwrap(),
            features: StageSpec::resolve(StageKind::Features, "legacy", &empty, None).unwrap(),
            gate: StageSpec::resolve(StageKind::Gate, "norm", &empty, None).unwrap(),
        }
    }

    fn task() -> SegmentationTask {
        // Dark 4x4 square on a bright background in frames 0 and 2
        let mut images = Array3::from_elem((3, 16, 16), 100u8);
        images.slice_mut(s![0, 5..9, 5..9]).fill(60);
        images.slice_mut(s![2, 3..7, 8..12]).fill(60);
        SegmentationTask {
            chunk_index: 4,
            start: 40,
            background: Some(Array3::from_elem((3, 16, 16), 100u8)),
            images,
            bg_off: None,
        }
    }

    fn init(role: WorkerRole, size_thresh_mask: u64) -> WorkerInit {
        WorkerInit {
            role,
            stages_json: serde_json::to_string(&stages()).unwrap(),
            size_thresh_mask,
        }
    }

    #[test]
    fn test_runtime_segments_and_extracts() {
        let seg = WorkerRuntime::new(&init(WorkerRole::Segmentation, 0)).unwrap();
        let segmented = match seg.handle(Request::Segment(task())) {
            Response::Segmented(s) => s,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(segmented.labels.dim(), (3, 16, 16));
        assert!(segmented.corrected.is_some());

        let ext = WorkerRuntime::new(&init(WorkerRole::Extraction, 0)).unwrap();
        let extracted = match ext.handle(Request::Extract(segmented)) {
            Response::Extracted(e) => e,
            other => panic!("unexpected {other:?}"),
        };
        let counts: Vec<usize> = extracted.frames.iter().map(|f| f.events.len()).collect();
        assert_eq!(counts, vec![1, 0, 1]);
        assert_eq!(extracted.frames[2].frame_index, 42);
        assert_eq!(extracted.event_count(), 2);
    }

    #[test]
    fn test_gate_threshold_reaches_worker() {
        let seg = WorkerRuntime::new(&init(WorkerRole::Segmentation, 0)).unwrap();
        let Response::Segmented(segmented) = seg.handle(Request::Segment(task())) else {
            panic!("segmentation failed");
        };
        let ext = WorkerRuntime::new(&init(WorkerRole::Extraction, 1000)).unwrap();
        let Response::Extracted(extracted) = ext.handle(Request::Extract(segmented)) else {
            panic!("extraction failed");
        };
        assert_eq!(extracted.event_count(), 0);
        assert_eq!(extracted.masks_dropped, 2);
    }

    #[test]
    fn test_wrong_role_fails() {
        let ext = WorkerRuntime::new(&init(WorkerRole::Extraction, 0)).unwrap();
        assert!(matches!(ext.handle(Request::Segment(task())), Response::Failed(_)));
    }

    #[test]
    fn test_blocking_framing() {
        let mut buf = Vec::new();
        write_message_blocking(&mut buf, &Request::Shutdown).unwrap();
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);
        let back: Request = read_message_blocking(&mut buf.as_slice()).unwrap();
        assert!(matches!(back, Request::Shutdown));
    }

    #[tokio::test]
    async fn test_thread_worker() {
        let mut worker = WorkerHandle::spawn(0, init(WorkerRole::Segmentation, 0), WorkerMode::Thread, None)
            .await
            .unwrap();
        assert!(!worker.is_process());
        let segmented = worker.segment(task()).await.unwrap();
        assert_eq!(segmented.chunk_index, 4);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_executable_falls_back_to_thread() {
        let missing = Path::new("/nonexistent/cytostream-worker");
        let mut worker = WorkerHandle::spawn(1, init(WorkerRole::Segmentation, 0), WorkerMode::Process, Some(missing))
            .await
            .unwrap();
        assert!(!worker.is_process());
        assert!(worker.segment(task()).await.is_ok());
    }
}
