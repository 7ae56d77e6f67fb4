//! Shared run state checked by every pipeline task at chunk boundaries.

use super::collector::Completion;
use super::Metrics;
use crate::error::PipelineError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

/// Cooperative stop flags.
///
/// Cancellation comes from outside the run; a stop is raised by the first
/// fatal error. Either ends dispatch of new chunks. After a cancel, work
/// already handed to a worker is allowed to finish; after a fatal error,
/// calls in flight are abandoned through [`RunControl::stopped`].
#[derive(Debug, Default)]
pub struct RunControl {
    cancel: Arc<AtomicBool>,
    stop: AtomicBool,
    stopped: Notify,
    first_error: Mutex<Option<PipelineError>>,
}

impl RunControl {
    pub fn new(cancel: Arc<AtomicBool>) -> Self {
        Self {
            cancel,
            ..Default::default()
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn is_failed(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Whether new work must not be started.
    pub fn should_stop(&self) -> bool {
        self.is_cancelled() || self.is_failed()
    }

    /// Record a fatal error and stop the run. Only the first error is kept.
    pub fn fail(&self, error: PipelineError) {
        tracing::error!("{error}");
        let mut slot = self.first_error.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(error);
        }
        self.stop.store(true, Ordering::SeqCst);
        self.stopped.notify_waiters();
    }

    /// Resolves once a fatal error stopped the run.
    pub async fn stopped(&self) {
        loop {
            let notified = self.stopped.notified();
            if self.is_failed() {
                return;
            }
            notified.await;
        }
    }

    pub fn take_error(&self) -> Option<PipelineError> {
        self.first_error.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

/// Handles every manager task carries.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub control: Arc<RunControl>,
    pub metrics: Arc<Metrics>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl PipelineContext {
    pub fn new(control: Arc<RunControl>, metrics: Arc<Metrics>) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                control,
                metrics,
                completions: tx,
            },
            rx,
        )
    }

    /// Report to the collector. A collector that already stopped is ignored.
    pub fn complete(&self, completion: Completion) {
        if self.completions.send(completion).is_err() {
            tracing::debug!("Collector gone, dropping completion");
        }
    }
}

/// Error for a pipeline task that panicked or was aborted.
pub(crate) fn task_failed(stage: &str, err: tokio::task::JoinError) -> PipelineError {
    PipelineError::integrity(stage, None, format!("task failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stopped_resolves_after_fail() {
        let control = Arc::new(RunControl::default());
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.stopped().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        control.fail(PipelineError::config("boom"));
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        // Later waiters return at once
        tokio::time::timeout(Duration::from_millis(50), control.stopped()).await.unwrap();
        assert!(matches!(control.take_error(), Some(PipelineError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_cancel_does_not_resolve_stopped() {
        let cancel = Arc::new(AtomicBool::new(true));
        let control = RunControl::new(cancel);
        assert!(control.should_stop());
        assert!(tokio::time::timeout(Duration::from_millis(20), control.stopped()).await.is_err());
    }
}
