//! Cytostream
//!
//! Streaming event detection for imaging flow cytometry datasets. Frames
//! are read in chunks, background corrected, segmented into labeled masks
//! and reduced to per-event features, then written in frame order to a new
//! dataset that references its input through a basin.
//!
//! # Architecture
//!
//! - **Stages**: background estimators, segmenters, feature extraction and
//!   gating, each identified by a code and kwargs that make up the PPID
//! - **I/O**: chunked image cache, directory datasets and the event writer
//! - **Pipeline**: worker pools, ordered collection, backpressure and the
//!   job state machine
//!
//! # Usage
//!
//! ```no_run
//! use cytostream::{run_job, JobConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = JobConfig::from_file("job.yaml".as_ref())?;
//!     let summary = run_job(config).await?;
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod io;
pub mod pipeline;
pub mod ppid;
pub mod stages;

pub use config::{JobConfig, ProcessingConfig, WorkerMode};
pub use error::{PipelineError, Result};
pub use events::{Event, FeatureValue, FrameEvents};
pub use io::{DirectoryDataset, DirectoryStore, FrameSource, ImageCache};
pub use pipeline::{JobRunner, JobState, Metrics, RunSummary, StatusSnapshot};
pub use stages::{StageKind, StageSet, StageSpec};

use anyhow::Context;

/// Validate and run one job with the given configuration.
pub async fn run_job(config: JobConfig) -> anyhow::Result<RunSummary> {
    tracing::info!(
        "Starting job {} -> {}",
        config.input.path.display(),
        config.output.path.display()
    );

    let mut runner = JobRunner::new(config);
    runner.validate().context("job validation failed")?;
    let summary = runner.run().await.context("job failed")?;

    if !summary.complete {
        tracing::warn!("Output is incomplete: {}", summary);
    }
    Ok(summary)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

/// Initialize the Rayon thread pool.
pub fn init_rayon(threads: Option<usize>) -> anyhow::Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}
