//! Writer backpressure.
//!
//! The gate counts chunks that were dispatched but not yet persisted by the
//! writer. Chunks released by the collector and waiting for the writer are
//! a subset of those, so keeping the outstanding count under the threshold
//! also bounds the writer's backlog.

use super::control::RunControl;
use super::Metrics;
use crate::config::StallConfig;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct BackpressureGate {
    outstanding: AtomicUsize,
    write_queue: AtomicUsize,
    peak_write_queue: AtomicUsize,
    threshold: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
    jitter: f64,
    metrics: Arc<Metrics>,
}

impl BackpressureGate {
    pub fn new(threshold: usize, stall: &StallConfig, metrics: Arc<Metrics>) -> Self {
        let initial_backoff = Duration::from_millis(stall.initial_backoff_ms.max(1));
        Self {
            outstanding: AtomicUsize::new(0),
            write_queue: AtomicUsize::new(0),
            peak_write_queue: AtomicUsize::new(0),
            threshold: threshold.max(1),
            initial_backoff,
            max_backoff: Duration::from_millis(stall.max_backoff_ms).max(initial_backoff),
            jitter: stall.jitter.clamp(0.0, 1.0),
            metrics,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn dispatched(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    /// A chunk left the collector for the writer.
    pub fn released(&self) {
        let depth = self.write_queue.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_write_queue.fetch_max(depth, Ordering::SeqCst);
    }

    /// The writer persisted a chunk.
    pub fn written(&self) {
        let _ = self
            .write_queue
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
    }

    /// Chunks released by the collector and not yet persisted.
    pub fn write_queue_size(&self) -> usize {
        self.write_queue.load(Ordering::SeqCst)
    }

    pub fn peak_write_queue_size(&self) -> usize {
        self.peak_write_queue.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until another chunk may be dispatched. Returns `false` if the run
    /// was stopped while waiting.
    pub async fn wait(&self, control: &RunControl) -> bool {
        let mut backoff = self.initial_backoff;
        let mut stalled_since: Option<Instant> = None;

        while self.outstanding() >= self.threshold {
            if control.should_stop() {
                break;
            }
            if stalled_since.is_none() {
                tracing::debug!(
                    outstanding = self.outstanding(),
                    write_queue = self.write_queue_size(),
                    "Writer behind, stalling dispatch"
                );
                stalled_since = Some(Instant::now());
            }
            let extra = rand::rng().random_range(0.0..=self.jitter);
            tokio::time::sleep(backoff.mul_f64(1.0 + extra)).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }

        if let Some(since) = stalled_since {
            self.metrics.add_stall(since.elapsed());
        }
        !control.should_stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn gate(threshold: usize) -> Arc<BackpressureGate> {
        let stall = StallConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            jitter: 0.5,
        };
        Arc::new(BackpressureGate::new(threshold, &stall, Metrics::new()))
    }

    #[tokio::test]
    async fn test_wait_passes_below_threshold() {
        let gate = gate(2);
        let control = RunControl::default();
        gate.dispatched();
        assert!(gate.wait(&control).await);
        assert_eq!(gate.metrics.snapshot().stalls, 0);
    }

    #[tokio::test]
    async fn test_wait_resumes_after_write() {
        let gate = gate(1);
        let control = Arc::new(RunControl::default());
        gate.dispatched();
        gate.released();

        let waiter = {
            let gate = gate.clone();
            let control = control.clone();
            tokio::spawn(async move { gate.wait(&control).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.written();
        assert!(waiter.await.unwrap());
        assert_eq!(gate.metrics.snapshot().stalls, 1);
        assert_eq!(gate.write_queue_size(), 0);
        assert_eq!(gate.peak_write_queue_size(), 1);
    }

    #[tokio::test]
    async fn test_wait_ends_on_cancel() {
        let gate = gate(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let control = Arc::new(RunControl::new(cancel.clone()));
        gate.dispatched();

        let waiter = {
            let gate = gate.clone();
            let control = control.clone();
            tokio::spawn(async move { gate.wait(&control).await })
        };
        cancel.store(true, Ordering::SeqCst);
        assert!(!waiter.await.unwrap());
    }

    #[test]
    fn test_written_never_underflows() {
        let gate = gate(1);
        gate.written();
        assert_eq!(gate.outstanding(), 0);
        assert_eq!(gate.write_queue_size(), 0);
    }
}
