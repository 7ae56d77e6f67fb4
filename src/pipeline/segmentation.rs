//! Segmentation manager: claims chunks from the image cache, attaches their
//! background and feeds the segmentation workers.

use super::backpressure::BackpressureGate;
use super::collector::Completion;
use super::control::{task_failed, PipelineContext};
use super::worker::{SegmentationTask, SegmentedChunk, WorkerHandle};
use crate::error::{PipelineError, Result};
use crate::io::ImageCache;
use crate::stages::BackgroundEstimator;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Produces [`SegmentationTask`]s in chunk order.
pub struct Dispatcher {
    cache: Arc<ImageCache>,
    estimator: Arc<dyn BackgroundEstimator>,
    gate: Arc<BackpressureGate>,
    ctx: PipelineContext,
}

impl Dispatcher {
    pub fn new(
        cache: Arc<ImageCache>,
        estimator: Arc<dyn BackgroundEstimator>,
        gate: Arc<BackpressureGate>,
        ctx: PipelineContext,
    ) -> Self {
        Self {
            cache,
            estimator,
            gate,
            ctx,
        }
    }

    /// Dispatch every chunk unless the run stops first. Returns the number
    /// of chunks dispatched. Dropping `queue` at the end lets the workers
    /// finish.
    pub async fn run(self, queue: async_channel::Sender<SegmentationTask>) -> Result<usize> {
        let Self {
            cache,
            estimator,
            gate,
            ctx,
        } = self;

        if estimator.computes() {
            let started = Instant::now();
            let (est, c) = (estimator.clone(), cache.clone());
            tokio::task::spawn_blocking(move || est.prepare(&c))
                .await
                .map_err(|e| task_failed("background", e))??;
            ctx.metrics.add_background_time(started.elapsed());
            debug!("Background '{}' prepared in {:?}", estimator.code(), started.elapsed());
        }

        let mut chunks = cache.iter_chunks();
        let mut dispatched = 0;

        loop {
            if ctx.control.should_stop() || !gate.wait(&ctx.control).await {
                info!("Dispatch stopped after {dispatched} chunks");
                break;
            }

            // Reading and background computation block
            let (est, c) = (estimator.clone(), cache.clone());
            let (next, rest) = tokio::task::spawn_blocking(move || {
                let next = chunks.next().map(|item| {
                    item.and_then(|(_, chunk)| {
                        let started = Instant::now();
                        let background = est.compute(&chunk, &c)?;
                        Ok((chunk, background, started.elapsed()))
                    })
                });
                (next, chunks)
            })
            .await
            .map_err(|e| task_failed("segmentation", e))?;
            chunks = rest;

            let Some(item) = next else { break };
            let (chunk, background, bg_time) = item?;
            if estimator.computes() {
                ctx.metrics.add_background_time(bg_time);
            }

            let task = SegmentationTask {
                chunk_index: chunk.index,
                start: chunk.start,
                images: chunk.images.clone(),
                background: background.images,
                bg_off: background.bg_off,
            };
            gate.dispatched();
            ctx.metrics.add_chunk_dispatched();
            ctx.complete(Completion::Dispatched {
                chunk_index: chunk.index,
            });
            debug!(chunk = chunk.index, frames = chunk.len(), "Dispatched chunk");

            let sent = tokio::select! {
                sent = queue.send(task) => sent.is_ok(),
                _ = ctx.control.stopped() => false,
            };
            if !sent {
                if ctx.control.should_stop() {
                    info!("Dispatch stopped after {dispatched} chunks");
                    break;
                }
                return Err(PipelineError::integrity(
                    "segmentation",
                    Some(chunk.index),
                    "segmentation workers stopped before the end of the input",
                ));
            }
            dispatched += 1;
        }
        Ok(dispatched)
    }
}

/// Serve one segmentation worker until the task queue closes.
///
/// Transient worker failures are reported to the collector and the loop
/// continues. After a stop, queued tasks are drained without running them,
/// and a fatal error abandons the call in flight and kills the worker.
pub async fn run_segmentation_worker(
    mut worker: WorkerHandle,
    tasks: async_channel::Receiver<SegmentationTask>,
    segmented: async_channel::Sender<SegmentedChunk>,
    ctx: PipelineContext,
) -> Result<()> {
    let mut abandoned = false;
    let result = async {
        while let Ok(task) = tasks.recv().await {
            let chunk_index = task.chunk_index;
            if ctx.control.should_stop() {
                debug!(chunk = chunk_index, "Dropping queued chunk after stop");
                continue;
            }
            let frames = task.len() as u64;
            let started = Instant::now();
            let outcome = tokio::select! {
                outcome = worker.segment(task) => outcome,
                _ = ctx.control.stopped() => {
                    debug!(chunk = chunk_index, "Abandoning segmentation after stop");
                    abandoned = true;
                    break;
                }
            };
            match outcome {
                Ok(chunk) => {
                    ctx.metrics.add_segmentation_time(started.elapsed());
                    ctx.metrics.add_chunk_segmented(frames);
                    ctx.complete(Completion::Segmented {
                        chunk_index,
                        worker: worker.id(),
                    });
                    if segmented.send(chunk).await.is_err() {
                        debug!(chunk = chunk_index, "Extraction queue closed");
                        break;
                    }
                }
                Err(e) if !e.is_fatal() => {
                    warn!("{e}");
                    ctx.complete(Completion::Failed {
                        chunk_index,
                        stage: "segmentation".to_string(),
                        worker: worker.id(),
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
    .await;
    if abandoned || ctx.control.is_failed() {
        worker.kill().await;
    } else {
        worker.shutdown().await;
    }
    result
}
