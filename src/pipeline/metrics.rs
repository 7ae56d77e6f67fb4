//! Throughput monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for the pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Frames read from the input by the image cache
    pub frames_read: AtomicU64,

    /// Chunks handed to the segmentation queue
    pub chunks_dispatched: AtomicU64,

    /// Chunks finished by segmentation workers
    pub chunks_segmented: AtomicU64,

    /// Chunks finished by extraction workers
    pub chunks_extracted: AtomicU64,

    /// Chunks released in order by the collector
    pub chunks_released: AtomicU64,

    /// Chunks persisted by the writer
    pub chunks_written: AtomicU64,

    pub frames_segmented: AtomicU64,
    pub frames_extracted: AtomicU64,
    pub frames_written: AtomicU64,

    /// Events persisted by the writer
    pub events_written: AtomicU64,

    /// Events removed by the gate
    pub masks_dropped: AtomicU64,

    /// Chunks a worker failed to process
    pub worker_failures: AtomicU64,

    /// Frames of failed chunks, written without events
    pub discarded_frames: AtomicU64,

    /// Number of times the dispatcher stalled on a full write queue
    pub stalls: AtomicU64,

    /// Time spent stalled (microseconds)
    pub stall_us: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-stage timing (in microseconds, summed across workers)
    /// Time spent computing backgrounds (microseconds)
    pub background_us: AtomicU64,

    /// Time spent segmenting (microseconds)
    pub segmentation_us: AtomicU64,

    /// Time spent extracting features (microseconds)
    pub extraction_us: AtomicU64,

    /// Time spent writing (microseconds)
    pub write_us: AtomicU64,

    // Cache metrics
    /// Image cache hits
    pub cache_hits: AtomicU64,

    /// Image cache misses
    pub cache_misses: AtomicU64,

    /// Image cache evictions
    pub cache_evictions: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_frames_read(&self, frames: u64) {
        self.frames_read.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn add_chunk_dispatched(&self) {
        self.chunks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunk_segmented(&self, frames: u64) {
        self.chunks_segmented.fetch_add(1, Ordering::Relaxed);
        self.frames_segmented.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn add_chunk_extracted(&self, frames: u64) {
        self.chunks_extracted.fetch_add(1, Ordering::Relaxed);
        self.frames_extracted.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn add_chunk_released(&self) {
        self.chunks_released.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a chunk persisted by the writer.
    pub fn add_chunk_written(&self, frames: u64, events: u64) {
        self.chunks_written.fetch_add(1, Ordering::Relaxed);
        self.frames_written.fetch_add(frames, Ordering::Relaxed);
        self.events_written.fetch_add(events, Ordering::Relaxed);
    }

    pub fn add_masks_dropped(&self, count: u64) {
        self.masks_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a chunk lost to a worker failure.
    pub fn add_worker_failure(&self, frames: u64) {
        self.worker_failures.fetch_add(1, Ordering::Relaxed);
        self.discarded_frames.fetch_add(frames, Ordering::Relaxed);
    }

    /// Record one stall of the given length.
    pub fn add_stall(&self, duration: Duration) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
        self.stall_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent computing backgrounds (in microseconds).
    pub fn add_background_time(&self, duration: Duration) {
        self.background_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent segmenting (in microseconds).
    pub fn add_segmentation_time(&self, duration: Duration) {
        self.segmentation_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent extracting features (in microseconds).
    pub fn add_extraction_time(&self, duration: Duration) {
        self.extraction_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent writing (in microseconds).
    pub fn add_write_time(&self, duration: Duration) {
        self.write_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_cache_eviction(&self) {
        self.cache_evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get frames written per second.
    pub fn frames_per_second(&self) -> f64 {
        let frames = self.frames_written.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let secs = |us: &AtomicU64| us.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        MetricsSnapshot {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            chunks_dispatched: self.chunks_dispatched.load(Ordering::Relaxed),
            chunks_segmented: self.chunks_segmented.load(Ordering::Relaxed),
            chunks_extracted: self.chunks_extracted.load(Ordering::Relaxed),
            chunks_released: self.chunks_released.load(Ordering::Relaxed),
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            frames_segmented: self.frames_segmented.load(Ordering::Relaxed),
            frames_extracted: self.frames_extracted.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            events_written: self.events_written.load(Ordering::Relaxed),
            masks_dropped: self.masks_dropped.load(Ordering::Relaxed),
            worker_failures: self.worker_failures.load(Ordering::Relaxed),
            discarded_frames: self.discarded_frames.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            stall_secs: secs(&self.stall_us),
            elapsed: self.elapsed(),
            frames_per_second: self.frames_per_second(),
            background_secs: secs(&self.background_us),
            segmentation_secs: secs(&self.segmentation_us),
            extraction_secs: secs(&self.extraction_us),
            write_secs: secs(&self.write_us),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub frames_read: u64,
    pub chunks_dispatched: u64,
    pub chunks_segmented: u64,
    pub chunks_extracted: u64,
    pub chunks_released: u64,
    pub chunks_written: u64,
    pub frames_segmented: u64,
    pub frames_extracted: u64,
    pub frames_written: u64,
    pub events_written: u64,
    pub masks_dropped: u64,
    pub worker_failures: u64,
    pub discarded_frames: u64,
    pub stalls: u64,
    pub stall_secs: f64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub frames_per_second: f64,
    /// Total time spent computing backgrounds (seconds, summed across workers)
    pub background_secs: f64,
    /// Total time spent segmenting (seconds, summed across workers)
    pub segmentation_secs: f64,
    /// Total time spent extracting features (seconds, summed across workers)
    pub extraction_secs: f64,
    pub write_secs: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path.display());
        Ok(())
    }

    /// Per-stage timings as `(stage, seconds)` pairs.
    pub fn stage_timings(&self) -> [(&'static str, f64); 4] {
        [
            ("background", self.background_secs),
            ("segmentation", self.segmentation_secs),
            ("extraction", self.extraction_secs),
            ("writing", self.write_secs),
        ]
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total_stage_time = self.background_secs + self.segmentation_secs + self.extraction_secs + self.write_secs;
        let pct = |secs: f64| {
            if total_stage_time > 0.0 {
                secs / total_stage_time * 100.0
            } else {
                0.0
            }
        };

        let cache_total = self.cache_hits + self.cache_misses;
        let cache_hit_rate = if cache_total > 0 {
            self.cache_hits as f64 / cache_total as f64 * 100.0
        } else {
            0.0
        };

        write!(
            f,
            "Chunks: {} dispatched, {} segmented, {} extracted, {} written | \
             Frames: {} read, {} written @ {:.1}/s | Events: {} ({} gated) | \
             Failures: {} ({} frames discarded) | Stalls: {} ({:.1}s) | Elapsed: {:.1}s | \
             Time: Bg {:.0}% | Seg {:.0}% | Feat {:.0}% | Write {:.0}% | \
             Cache: {:.0}% hit, {} evicted",
            self.chunks_dispatched,
            self.chunks_segmented,
            self.chunks_extracted,
            self.chunks_written,
            self.frames_read,
            self.frames_written,
            self.frames_per_second,
            self.events_written,
            self.masks_dropped,
            self.worker_failures,
            self.discarded_frames,
            self.stalls,
            self.stall_secs,
            self.elapsed.as_secs_f64(),
            pct(self.background_secs),
            pct(self.segmentation_secs),
            pct(self.extraction_secs),
            pct(self.write_secs),
            cache_hit_rate,
            self.cache_evictions,
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_frames: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_frames: u64) -> Self {
        Self {
            metrics,
            interval_secs: interval_secs.max(1),
            total_frames,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_frames > 0 {
                        snapshot.frames_written as f64 / self.total_frames as f64 * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!(
                        "[{:.1}%] {}",
                        progress,
                        snapshot
                    );
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_counters() {
        let metrics = Metrics::new();

        metrics.add_chunk_dispatched();
        metrics.add_chunk_segmented(100);
        metrics.add_chunk_extracted(100);
        metrics.add_chunk_written(100, 42);
        metrics.add_worker_failure(50);

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.chunks_dispatched, 1);
        assert_eq!(snapshot.frames_segmented, 100);
        assert_eq!(snapshot.frames_written, 100);
        assert_eq!(snapshot.events_written, 42);
        assert_eq!(snapshot.worker_failures, 1);
        assert_eq!(snapshot.discarded_frames, 50);
    }

    #[test]
    fn test_timing_metrics() {
        let metrics = Metrics::new();

        metrics.add_background_time(Duration::from_millis(100));
        metrics.add_segmentation_time(Duration::from_millis(50));
        metrics.add_extraction_time(Duration::from_millis(25));
        metrics.add_write_time(Duration::from_millis(75));
        metrics.add_stall(Duration::from_millis(10));

        let snapshot = metrics.snapshot();

        assert!((snapshot.background_secs - 0.1).abs() < 0.001);
        assert!((snapshot.segmentation_secs - 0.05).abs() < 0.001);
        assert!((snapshot.extraction_secs - 0.025).abs() < 0.001);
        assert!((snapshot.write_secs - 0.075).abs() < 0.001);
        assert_eq!(snapshot.stalls, 1);
        assert!(snapshot.stage_timings().iter().all(|(_, secs)| *secs >= 0.0));
    }

    #[test]
    fn test_cache_hit_rate_in_display() {
        let snapshot = MetricsSnapshot {
            cache_hits: 80,
            cache_misses: 20,
            cache_evictions: 3,
            elapsed: Duration::from_secs(1),
            ..Default::default()
        };

        let display = format!("{}", snapshot);

        assert!(display.contains("Cache: 80% hit, 3 evicted"));
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        let metrics = Metrics {
            start_time: None,
            ..Default::default()
        };

        metrics.add_chunk_written(10, 1);

        assert_eq!(metrics.frames_per_second(), 0.0);
    }
}
