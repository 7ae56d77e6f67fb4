//! Extraction manager: feeds segmented chunks to the feature extraction
//! workers and reports their events to the collector.

use super::collector::Completion;
use super::control::PipelineContext;
use super::worker::{SegmentedChunk, WorkerHandle};
use crate::error::Result;
use std::time::Instant;
use tracing::{debug, warn};

/// Serve one extraction worker until the segmented queue closes.
pub async fn run_extraction_worker(
    mut worker: WorkerHandle,
    segmented: async_channel::Receiver<SegmentedChunk>,
    ctx: PipelineContext,
) -> Result<()> {
    let mut abandoned = false;
    let result = async {
        while let Ok(chunk) = segmented.recv().await {
            let chunk_index = chunk.chunk_index;
            if ctx.control.should_stop() {
                debug!(chunk = chunk_index, "Dropping segmented chunk after stop");
                continue;
            }
            let frames = chunk.len() as u64;
            let started = Instant::now();
            let outcome = tokio::select! {
                outcome = worker.extract(chunk) => outcome,
                _ = ctx.control.stopped() => {
                    debug!(chunk = chunk_index, "Abandoning extraction after stop");
                    abandoned = true;
                    break;
                }
            };
            match outcome {
                Ok(extracted) => {
                    ctx.metrics.add_extraction_time(started.elapsed());
                    ctx.metrics.add_chunk_extracted(frames);
                    ctx.metrics.add_masks_dropped(extracted.masks_dropped);
                    ctx.complete(Completion::Extracted {
                        chunk: extracted,
                        worker: worker.id(),
                    });
                }
                Err(e) if !e.is_fatal() => {
                    warn!("{e}");
                    ctx.complete(Completion::Failed {
                        chunk_index,
                        stage: "extraction".to_string(),
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
