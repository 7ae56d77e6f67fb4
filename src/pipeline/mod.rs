//! Pipeline orchestration: worker pools, managers, ordered collection,
//! writer backpressure and the job runner.

pub mod backpressure;
pub mod collector;
pub mod control;
pub mod extraction;
mod metrics;
pub mod runner;
pub mod segmentation;
pub mod worker;


pub use backpressure::BackpressureGate;
pub use collector::{Completion, OrderedCollector};
pub use control::{PipelineContext, RunControl};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use runner::{JobRunner, JobState, RunSummary, StatusHandle, StatusSnapshot};
pub use worker::{ExtractedChunk, SegmentationTask, SegmentedChunk, WorkerHandle};
