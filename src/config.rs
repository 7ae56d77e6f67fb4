//! Configuration for a cytostream job.

use crate::error::{PipelineError, Result};
use crate::io::dataset::canonical_index_mapping;
use crate::stages::{KwargValue, Kwargs, StageKind, StageSet, StageSpec};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Input configuration
    pub input: InputConfig,

    /// Output configuration
    pub output: OutputConfig,

    /// Processing stages
    #[serde(default)]
    pub stages: StagesConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Input dataset configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Directory of the input dataset
    pub path: PathBuf,

    /// Pixel size in µm, overriding the input's `imaging:pixel size`
    #[serde(default)]
    pub pixel_size: Option<f64>,

    /// Subset of input frames to process: `0` for all, `n` for the first
    /// n, or `start,stop[,step]`
    #[serde(default = "default_index_mapping")]
    pub index_mapping: String,
}

/// Output dataset configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory of the output dataset. Existing output there is replaced.
    pub path: PathBuf,

    /// Reference the input dataset from the output through a basin
    #[serde(default = "default_true")]
    pub basin_to_input: bool,
}

/// One stage variant and its keyword arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub code: String,

    #[serde(default)]
    pub kwargs: Kwargs,

    /// Mask post-processing kwargs (segmenters only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_kwargs: Option<Kwargs>,
}

impl StageConfig {
    fn named(code: &str) -> Self {
        Self {
            code: code.to_string(),
            kwargs: Kwargs::new(),
            mask_kwargs: None,
        }
    }
}

/// Stage selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    #[serde(default = "default_background")]
    pub background: StageConfig,

    #[serde(default = "default_segmenter")]
    pub segmenter: StageConfig,

    #[serde(default = "default_features")]
    pub features: StageConfig,

    #[serde(default = "default_gate")]
    pub gate: StageConfig,

    /// Refuse to run unless the computed pipeline identifier equals this one
    #[serde(default)]
    pub expected_ppid: Option<String>,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            background: default_background(),
            segmenter: default_segmenter(),
            features: default_features(),
            gate: default_gate(),
            expected_ppid: None,
        }
    }
}

/// How workers are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// Separate OS processes, falling back to threads if they cannot be spawned
    #[default]
    Process,
    /// Blocking tasks inside this process
    Thread,
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Segmentation workers (default: derived from the CPU count)
    #[serde(default)]
    pub segmentation_workers: Option<usize>,

    /// Feature extraction workers (default: derived from the CPU count)
    #[serde(default)]
    pub extraction_workers: Option<usize>,

    #[serde(default)]
    pub worker_mode: WorkerMode,

    /// Executable started for process workers (default: this executable)
    #[serde(default)]
    pub worker_executable: Option<PathBuf>,

    /// Frames per chunk, rounded to the input's storage chunking
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Chunks held by the image cache
    #[serde(default = "default_cache_slots")]
    pub cache_slots: usize,

    /// Capacity of each work queue, in chunks
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Chunks dispatched but not yet written at which dispatch stalls
    /// (default: enough to keep every worker and queue busy)
    #[serde(default)]
    pub stall_threshold: Option<usize>,

    #[serde(default)]
    pub stall: StallConfig,

    /// Seconds without progress on the oldest pending chunk before the run fails
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,

    /// Fraction of frames that may be lost to worker failures before the run fails
    #[serde(default = "default_max_discard_fraction")]
    pub max_discard_fraction: f64,

    /// Bytes buffered per feature before a write
    #[serde(default = "default_write_flush_bytes")]
    pub write_flush_bytes: usize,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Rayon thread pool size for CPU-bound work
    #[serde(default)]
    pub rayon_threads: Option<usize>,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    #[serde(default)]
    pub metrics_output_path: Option<PathBuf>,
}

/// Backoff while the writer is behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallConfig {
    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Random extra wait as a fraction of the backoff
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: default_jitter(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            segmentation_workers: None,
            extraction_workers: None,
            worker_mode: WorkerMode::default(),
            worker_executable: None,
            chunk_size: default_chunk_size(),
            cache_slots: default_cache_slots(),
            queue_depth: default_queue_depth(),
            stall_threshold: None,
            stall: StallConfig::default(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            max_discard_fraction: default_max_discard_fraction(),
            write_flush_bytes: default_write_flush_bytes(),
            worker_threads: None,
            rayon_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

impl ProcessingConfig {
    /// Segmentation and extraction worker counts. Unset counts split the
    /// CPUs left after reserving one for collection and writing.
    pub fn worker_counts(&self, accelerator: bool) -> (usize, usize) {
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
        let budget = cpus.saturating_sub(1).max(2);
        let seg = self.segmentation_workers.unwrap_or((budget / 2).max(1));
        let ext = self
            .extraction_workers
            .unwrap_or_else(|| budget.saturating_sub(seg).max(1));
        // One device, one worker
        let seg = if accelerator { 1 } else { seg };
        (seg, ext)
    }

    /// Outstanding chunk count at which dispatch stalls.
    pub fn stall_threshold(&self, seg_workers: usize, ext_workers: usize) -> usize {
        self.stall_threshold
            .unwrap_or(seg_workers + ext_workers + 2 * self.queue_depth + 2)
    }
}

impl JobConfig {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: JobConfig = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // Try YAML first (it's a superset of JSON)
                serde_yaml::from_str(&contents)?
            }
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check settings that do not depend on the input.
    pub fn validate(&self) -> Result<()> {
        let p = &self.processing;
        if p.chunk_size == 0 {
            return Err(PipelineError::config("chunk_size must be > 0"));
        }
        if p.cache_slots == 0 {
            return Err(PipelineError::config("cache_slots must be > 0"));
        }
        if p.queue_depth == 0 {
            return Err(PipelineError::config("queue_depth must be > 0"));
        }
        if p.stall_threshold == Some(0) {
            return Err(PipelineError::config("stall_threshold must be > 0"));
        }
        if p.segmentation_workers == Some(0) || p.extraction_workers == Some(0) {
            return Err(PipelineError::config("at least one worker per pool is required"));
        }
        if p.stall.initial_backoff_ms == 0 || p.stall.initial_backoff_ms > p.stall.max_backoff_ms {
            return Err(PipelineError::config("stall backoff must satisfy 0 < initial_backoff_ms <= max_backoff_ms"));
        }
        if !(0.0..=1.0).contains(&p.stall.jitter) {
            return Err(PipelineError::config("stall jitter must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&p.max_discard_fraction) {
            return Err(PipelineError::config("max_discard_fraction must be within [0, 1]"));
        }
        if p.chunk_timeout_secs == 0 {
            return Err(PipelineError::config("chunk_timeout_secs must be > 0"));
        }
        if p.write_flush_bytes == 0 {
            return Err(PipelineError::config("write_flush_bytes must be > 0"));
        }
        if let Some(size) = self.input.pixel_size {
            if !(size > 0.0) {
                return Err(PipelineError::config(format!("pixel_size must be positive, got {size}")));
            }
        }
        Ok(())
    }

    /// Resolve all stages. `input_pixel_size` is the input's own pixel size,
    /// used unless the configuration overrides it.
    pub fn stage_set(&self, input_pixel_size: Option<f64>) -> Result<StageSet> {
        let mut data = Kwargs::new();
        data.insert(
            "pixel_size".into(),
            KwargValue::Float(self.input.pixel_size.or(input_pixel_size).unwrap_or(0.0)),
        );
        data.insert(
            "index_mapping".into(),
            KwargValue::Text(canonical_index_mapping(&self.input.index_mapping)?),
        );

        let resolve = |kind: StageKind, stage: &StageConfig| {
            StageSpec::resolve(kind, &stage.code, &stage.kwargs, stage.mask_kwargs.as_ref())
        };
        Ok(StageSet {
            data: StageSpec::resolve(StageKind::Data, "store", &data, None)?,
            background: resolve(StageKind::Background, &self.stages.background)?,
            segmenter: resolve(StageKind::Segmenter, &self.stages.segmenter)?,
            features: resolve(StageKind::Features, &self.stages.features)?,
            gate: resolve(StageKind::Gate, &self.stages.gate)?,
        })
    }
}

/// Commented configuration written by `generate-config`.
pub const TEMPLATE: &str = r#"# cytostream job configuration
input:
  # Input dataset directory
  path: input.cyto
  # Pixel size in µm (default: read from the input)
  # pixel_size: 0.2645
  # Frames to process: 0 = all, n = first n, or start,stop[,step]
  index_mapping: "0"

output:
  # Output dataset directory; existing output is replaced
  path: output.cyto
  basin_to_input: true

stages:
  background:
    code: sparsemed          # none | copy | rollmed | sparsemed
    kwargs:
      kernel_size: 200
      split_time: 1.0
      thresh_cleansing: 0.0
      frac_cleansing: 0.8
      offset_correction: true
  segmenter:
    code: thresh             # thresh | rawthresh
    kwargs:
      thresh: -6
    mask_kwargs:
      clear_border: true
      fill_holes: true
      closing_disk: 2
  features:
    code: legacy
    kwargs:
      brightness: true
      moments: true
  gate:
    code: norm
    kwargs:
      online_gates: false
      size_thresh_mask: 0
  # expected_ppid: "1|..."

processing:
  # Worker counts (default: split the CPUs minus one)
  # segmentation_workers: 4
  # extraction_workers: 4
  worker_mode: process       # process | thread
  chunk_size: 1000
  cache_slots: 2
  queue_depth: 2
  # Chunks in flight before dispatch waits for the writer
  # (default: workers + both queues + 2)
  # stall_threshold: 12
  stall:
    initial_backoff_ms: 50
    max_backoff_ms: 2000
    jitter: 0.2
  chunk_timeout_secs: 600
  max_discard_fraction: 0.01
  write_flush_bytes: 1048576
  enable_metrics: true
  metrics_interval_secs: 10
"#;

// Default value functions for serde
fn default_index_mapping() -> String { "0".to_string() }
fn default_background() -> StageConfig { StageConfig::named("sparsemed") }
fn default_segmenter() -> StageConfig { StageConfig::named("thresh") }
fn default_features() -> StageConfig { StageConfig::named("legacy") }
fn default_gate() -> StageConfig { StageConfig::named("norm") }
fn default_chunk_size() -> usize { 1000 }
fn default_cache_slots() -> usize { 2 }
fn default_queue_depth() -> usize { 2 }
fn default_chunk_timeout_secs() -> u64 { 600 }
fn default_max_discard_fraction() -> f64 { 0.01 }
fn default_write_flush_bytes() -> usize { 1 << 20 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
fn default_initial_backoff_ms() -> u64 { 50 }
fn default_max_backoff_ms() -> u64 { 2000 }
fn default_jitter() -> f64 { 0.2 }

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> JobConfig {
        JobConfig::from_yaml("input:\n  path: in.cyto\noutput:\n  path: out.cyto\n").unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = minimal();
        assert_eq!(config.input.index_mapping, "0");
        assert_eq!(config.stages.background.code, "sparsemed");
        assert_eq!(config.processing.worker_mode, WorkerMode::Process);
        assert_eq!(config.processing.write_flush_bytes, 1 << 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_template_parses() {
        let config = JobConfig::from_yaml(TEMPLATE).unwrap();
        config.validate().unwrap();
        let stages = config.stage_set(Some(0.2645)).unwrap();
        assert_eq!(stages.segmenter.code, "thresh");
        assert_eq!(stages.pixel_size(), 0.2645);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = minimal();
        config.processing.segmentation_workers = Some(0);
        assert!(matches!(config.validate(), Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn test_unknown_kwarg_rejected() {
        let config = JobConfig::from_yaml(
            "input:\n  path: a\noutput:\n  path: b\nstages:\n  segmenter:\n    code: thresh\n    kwargs:\n      threshold: 3\n",
        )
        .unwrap();
        assert!(config.stage_set(None).is_err());
    }

    #[test]
    fn test_pixel_size_override() {
        let mut config = minimal();
        config.input.pixel_size = Some(0.34);
        let stages = config.stage_set(Some(0.2645)).unwrap();
        assert_eq!(stages.pixel_size(), 0.34);
    }

    #[test]
    fn test_index_mapping_spellings_share_identifier() {
        let mut a = minimal();
        a.input.index_mapping = "20,60,2".to_string();
        let mut b = minimal();
        b.input.index_mapping = "20, 60, 2".to_string();
        let a = a.stage_set(Some(0.5)).unwrap();
        let b = b.stage_set(Some(0.5)).unwrap();
        assert_eq!(a.data, b.data);
        assert_eq!(a.data.text("index_mapping"), "20,60,2");

        let mut first = minimal();
        first.input.index_mapping = "100".to_string();
        let mut range = minimal();
        range.input.index_mapping = "0,100".to_string();
        assert_eq!(
            first.stage_set(None).unwrap().data.fragment(),
            range.stage_set(None).unwrap().data.fragment()
        );

        let mut bad = minimal();
        bad.input.index_mapping = "a,b".to_string();
        assert!(bad.stage_set(None).is_err());
    }

    #[test]
    fn test_worker_counts() {
        let mut config = minimal();
        config.processing.segmentation_workers = Some(3);
        config.processing.extraction_workers = Some(2);
        assert_eq!(config.processing.worker_counts(false), (3, 2));
        assert_eq!(config.processing.worker_counts(true), (1, 2));

        let auto = ProcessingConfig::default().worker_counts(false);
        assert!(auto.0 >= 1 && auto.1 >= 1);
    }

    #[test]
    fn test_stall_threshold() {
        let mut processing = ProcessingConfig::default();
        assert_eq!(processing.stall_threshold(3, 2), 3 + 2 + 4 + 2);
        processing.stall_threshold = Some(4);
        assert_eq!(processing.stall_threshold(3, 2), 4);
    }
}
