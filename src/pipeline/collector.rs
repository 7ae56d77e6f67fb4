//! Reassembly of out-of-order worker results into the ordered event stream.

use super::backpressure::BackpressureGate;
use super::control::RunControl;
use super::worker::ExtractedChunk;
use super::Metrics;
use crate::error::{PipelineError, Result};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Progress reports sent to the collector by the managers.
#[derive(Debug)]
pub enum Completion {
    /// The chunk was handed to the segmentation queue
    Dispatched { chunk_index: usize },
    Segmented { chunk_index: usize, worker: usize },
    Extracted { chunk: ExtractedChunk, worker: usize },
    /// A worker failed on the chunk; its frames are discarded
    Failed {
        chunk_index: usize,
        stage: String,
        worker: usize,
        message: String,
    },
}

#[derive(Debug)]
struct Pending {
    last_progress: Instant,
    segmented: bool,
    payload: Option<ExtractedChunk>,
}

impl Pending {
    fn new() -> Self {
        Self {
            last_progress: Instant::now(),
            segmented: false,
            payload: None,
        }
    }
}

/// Outcome of a collector run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectorSummary {
    pub released_chunks: usize,
    pub failed_chunks: usize,
    pub discarded_frames: usize,
}

/// Buffers completions keyed by chunk index and releases chunk `i` only once
/// every chunk before it has been released.
pub struct OrderedCollector {
    chunk_size: usize,
    total_frames: usize,
    num_chunks: usize,
    next_release: usize,
    pending: BTreeMap<usize, Pending>,
    summary: CollectorSummary,
    max_discard_fraction: f64,
    chunk_timeout: Duration,
    gate: Arc<BackpressureGate>,
    metrics: Arc<Metrics>,
    control: Arc<RunControl>,
}

impl OrderedCollector {
    pub fn new(
        chunk_size: usize,
        total_frames: usize,
        max_discard_fraction: f64,
        chunk_timeout: Duration,
        gate: Arc<BackpressureGate>,
        metrics: Arc<Metrics>,
        control: Arc<RunControl>,
    ) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            total_frames,
            num_chunks: total_frames.div_ceil(chunk_size),
            next_release: 0,
            pending: BTreeMap::new(),
            summary: CollectorSummary::default(),
            max_discard_fraction,
            chunk_timeout,
            gate,
            metrics,
            control,
        }
    }

    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    pub fn released(&self) -> usize {
        self.next_release
    }

    pub fn is_done(&self) -> bool {
        self.next_release >= self.num_chunks
    }

    fn frames(&self, chunk_index: usize) -> Range<usize> {
        let start = chunk_index * self.chunk_size;
        start..(start + self.chunk_size).min(self.total_frames)
    }

    fn check_index(&self, chunk_index: usize) -> Result<()> {
        if chunk_index >= self.num_chunks {
            return Err(PipelineError::integrity(
                "collector",
                Some(chunk_index),
                format!("chunk index out of range ({} chunks)", self.num_chunks),
            ));
        }
        Ok(())
    }

    /// Record a completion and return the chunks that became releasable,
    /// in order.
    pub fn accept(&mut self, completion: Completion) -> Result<Vec<ExtractedChunk>> {
        match completion {
            Completion::Dispatched { chunk_index } => {
                self.check_index(chunk_index)?;
                if chunk_index < self.next_release || self.pending.contains_key(&chunk_index) {
                    return Err(PipelineError::integrity(
                        "collector",
                        Some(chunk_index),
                        "chunk dispatched twice",
                    ));
                }
                self.pending.insert(chunk_index, Pending::new());
            }
            Completion::Segmented { chunk_index, worker } => {
                if let Some(entry) = self.pending.get_mut(&chunk_index) {
                    entry.segmented = true;
                    entry.last_progress = Instant::now();
                }
                debug!(chunk = chunk_index, worker, "Chunk segmented");
            }
            Completion::Extracted { chunk, worker } => {
                let index = chunk.chunk_index;
                self.check_index(index)?;
                self.check_frames(&chunk)?;
                debug!(chunk = index, worker, events = chunk.event_count(), "Chunk extracted");
                self.store(chunk)?;
            }
            Completion::Failed {
                chunk_index,
                stage,
                worker,
                message,
            } => {
                self.check_index(chunk_index)?;
                let frames = self.frames(chunk_index);
                let lost = frames.len();
                self.summary.failed_chunks += 1;
                self.summary.discarded_frames += lost;
                self.metrics.add_worker_failure(lost as u64);
                warn!(
                    stage = %stage,
                    chunk = chunk_index,
                    worker,
                    "Discarding {lost} frames: {message}"
                );

                let fraction = self.summary.discarded_frames as f64 / self.total_frames.max(1) as f64;
                if fraction > self.max_discard_fraction {
                    return Err(PipelineError::integrity(
                        stage,
                        Some(chunk_index),
                        format!(
                            "{} of {} frames discarded after worker failures, above the limit of {:.1}% (last: {message})",
                            self.summary.discarded_frames,
                            self.total_frames,
                            self.max_discard_fraction * 100.0
                        ),
                    ));
                }
                self.store(ExtractedChunk::empty(chunk_index, frames))?;
            }
        }
        Ok(self.release_ready())
    }

    fn check_frames(&self, chunk: &ExtractedChunk) -> Result<()> {
        let expected = self.frames(chunk.chunk_index);
        let consecutive = chunk
            .frames
            .iter()
            .enumerate()
            .all(|(i, f)| f.frame_index == expected.start + i);
        if chunk.start != expected.start || chunk.frames.len() != expected.len() || !consecutive {
            return Err(PipelineError::integrity(
                "collector",
                Some(chunk.chunk_index),
                format!(
                    "expected frames {}..{}, got {} frames from {}",
                    expected.start,
                    expected.end,
                    chunk.frames.len(),
                    chunk.start
                ),
            ));
        }
        Ok(())
    }

    fn store(&mut self, chunk: ExtractedChunk) -> Result<()> {
        let index = chunk.chunk_index;
        if index < self.next_release {
            return Err(PipelineError::integrity("collector", Some(index), "result for a released chunk"));
        }
        let entry = self.pending.entry(index).or_insert_with(Pending::new);
        if entry.payload.is_some() {
            return Err(PipelineError::integrity("collector", Some(index), "duplicate result"));
        }
        entry.payload = Some(chunk);
        entry.last_progress = Instant::now();
        Ok(())
    }

    fn release_ready(&mut self) -> Vec<ExtractedChunk> {
        let mut ready = Vec::new();
        while let Some(entry) = self.pending.get(&self.next_release) {
            if entry.payload.is_none() {
                break;
            }
            let payload = self
                .pending
                .remove(&self.next_release)
                .and_then(|e| e.payload);
            if let Some(chunk) = payload {
                self.gate.released();
                self.metrics.add_chunk_released();
                ready.push(chunk);
            }
            self.next_release += 1;
        }
        ready
    }

    /// Fail if the oldest dispatched chunk made no progress for too long.
    pub fn check_timeout(&self) -> Result<()> {
        if let Some(entry) = self.pending.get(&self.next_release) {
            if entry.payload.is_none() && entry.last_progress.elapsed() > self.chunk_timeout {
                let stage = if entry.segmented { "extraction" } else { "segmentation" };
                return Err(PipelineError::integrity(
                    stage,
                    Some(self.next_release),
                    format!("no result within {}s", self.chunk_timeout.as_secs_f64()),
                ));
            }
        }
        Ok(())
    }

    /// Consume completions until every chunk is released or all managers
    /// are gone, sending released chunks to the writer.
    pub async fn run(
        mut self,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        release: mpsc::UnboundedSender<ExtractedChunk>,
    ) -> Result<CollectorSummary> {
        let tick = self
            .chunk_timeout
            .min(Duration::from_secs(1))
            .max(Duration::from_millis(10));

        while !self.is_done() {
            match tokio::time::timeout(tick, completions.recv()).await {
                Ok(Some(completion)) => {
                    for chunk in self.accept(completion)? {
                        if release.send(chunk).is_err() {
                            return Err(PipelineError::integrity("collector", None, "writer stopped early"));
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {}
            }
            if !self.control.should_stop() {
                self.check_timeout()?;
            }
        }

        self.summary.released_chunks = self.next_release;
        if !self.is_done() && !self.control.should_stop() {
            return Err(PipelineError::integrity(
                "collector",
                Some(self.next_release),
                format!("only {} of {} chunks completed", self.next_release, self.num_chunks),
            ));
        }
        info!(
            "Collector released {} of {} chunks ({} failed)",
            self.next_release, self.num_chunks, self.summary.failed_chunks
        );
        Ok(self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StallConfig;
    use rand::seq::SliceRandom;

    fn collector(total_frames: usize, chunk_size: usize, max_discard: f64) -> OrderedCollector {
        let metrics = Metrics::new();
        let gate = Arc::new(BackpressureGate::new(100, &StallConfig::default(), metrics.clone()));
        OrderedCollector::new(
            chunk_size,
            total_frames,
            max_discard,
            Duration::from_secs(60),
            gate,
            metrics,
            Arc::new(RunControl::default()),
        )
    }

    fn extracted(c: &OrderedCollector, index: usize) -> Completion {
        Completion::Extracted {
            chunk: ExtractedChunk::empty(index, c.frames(index)),
            worker: 0,
        }
    }

    #[test]
    fn test_releases_in_order() {
        let mut c = collector(25, 10, 0.0);
        for i in 0..3 {
            c.accept(Completion::Dispatched { chunk_index: i }).unwrap();
        }
        assert!(c.accept(extracted(&c, 2)).unwrap().is_empty());
        assert!(c.accept(extracted(&c, 1)).unwrap().is_empty());
        let released = c.accept(extracted(&c, 0)).unwrap();
        let order: Vec<usize> = released.iter().map(|r| r.chunk_index).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(released[2].frames.len(), 5);
        assert!(c.is_done());
        assert_eq!(c.gate.write_queue_size(), 3);
    }

    #[test]
    fn test_random_interleavings_release_gap_free() {
        let mut rng = rand::rng();
        for _ in 0..50 {
            let mut c = collector(1000, 37, 0.0);
            let n = c.num_chunks();
            let mut order: Vec<usize> = (0..n).collect();
            order.shuffle(&mut rng);
            for i in 0..n {
                c.accept(Completion::Dispatched { chunk_index: i }).unwrap();
            }
            let mut released = Vec::new();
            for i in order {
                released.extend(c.accept(extracted(&c, i)).unwrap().into_iter().map(|r| r.chunk_index));
            }
            assert_eq!(released, (0..n).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_duplicate_result_is_integrity_error() {
        let mut c = collector(20, 10, 0.0);
        c.accept(Completion::Dispatched { chunk_index: 1 }).unwrap();
        c.accept(extracted(&c, 1)).unwrap();
        let err = c.accept(extracted(&c, 1)).unwrap_err();
        assert!(matches!(err, PipelineError::DataIntegrity { chunk: Some(1), .. }));
    }

    #[test]
    fn test_frame_count_mismatch() {
        let mut c = collector(20, 10, 0.0);
        let chunk = ExtractedChunk::empty(0, 0..9);
        let err = c.accept(Completion::Extracted { chunk, worker: 3 }).unwrap_err();
        assert!(matches!(err, PipelineError::DataIntegrity { .. }));
    }

    #[test]
    fn test_failure_below_threshold_yields_empty_frames() {
        let mut c = collector(1000, 10, 0.05);
        c.accept(Completion::Dispatched { chunk_index: 0 }).unwrap();
        let released = c
            .accept(Completion::Failed {
                chunk_index: 0,
                stage: "segmentation".into(),
                worker: 1,
                message: "boom".into(),
            })
            .unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].frames.len(), 10);
        assert_eq!(released[0].event_count(), 0);
        assert_eq!(c.metrics.snapshot().discarded_frames, 10);
    }

    #[test]
    fn test_failure_above_threshold_escalates() {
        let mut c = collector(100, 10, 0.05);
        let err = c
            .accept(Completion::Failed {
                chunk_index: 3,
                stage: "extraction".into(),
                worker: 0,
                message: "boom".into(),
            })
            .unwrap_err();
        assert!(matches!(err, PipelineError::DataIntegrity { chunk: Some(3), .. }));
    }

    #[test]
    fn test_timeout_on_oldest_chunk() {
        let metrics = Metrics::new();
        let gate = Arc::new(BackpressureGate::new(10, &StallConfig::default(), metrics.clone()));
        let mut c = OrderedCollector::new(
            10,
            20,
            0.0,
            Duration::from_millis(1),
            gate,
            metrics,
            Arc::new(RunControl::default()),
        );
        c.accept(Completion::Dispatched { chunk_index: 0 }).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(matches!(
            c.check_timeout(),
            Err(PipelineError::DataIntegrity { chunk: Some(0), .. })
        ));
    }

    #[tokio::test]
    async fn test_run_reports_missing_chunks() {
        let c = collector(30, 10, 0.0);
        let (tx, rx) = mpsc::unbounded_channel();
        let (release_tx, mut release_rx) = mpsc::unbounded_channel();
        tx.send(Completion::Dispatched { chunk_index: 0 }).unwrap();
        tx.send(Completion::Extracted {
            chunk: ExtractedChunk::empty(0, 0..10),
            worker: 0,
        })
        .unwrap();
        drop(tx);

        let err = c.run(rx, release_tx).await.unwrap_err();
        assert!(matches!(err, PipelineError::DataIntegrity { .. }));
        assert_eq!(release_rx.recv().await.map(|r| r.chunk_index), Some(0));
    }
}
