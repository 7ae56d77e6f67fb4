//! Background estimation.
//!
//! An estimator turns a chunk of raw frames into one background image per
//! frame. The segmenter subtracts it (plus an optional per-frame offset
//! that compensates illumination flicker) before thresholding.

use super::{registry, StageKind, StageSpec};
use crate::error::{PipelineError, Result};
use crate::events::FeatureColumn;
use crate::io::dataset::{FrameSource, FRAME_RATE_ATTR};
use crate::io::image_cache::{FrameSlice, ImageCache, ImageChunk};
use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Columns on each side of a frame used for offset correction.
const OFFSET_BORDER: usize = 20;

/// Frame rate assumed when the input does not record one.
const DEFAULT_FRAME_RATE: f64 = 2000.0;

/// Background for the frames of one chunk.
#[derive(Debug, Clone, Default)]
pub struct BackgroundChunk {
    /// One background per frame, `None` for a zero background
    pub images: Option<Array3<u8>>,
    /// Per-frame brightness offset between frame and background
    pub bg_off: Option<Vec<f64>>,
}

/// Monotonic progress counter.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    done: AtomicU64,
    total: AtomicU64,
}

impl ProgressCounter {
    /// Set the total once. Later calls are ignored.
    pub fn set_total(&self, total: u64) {
        let _ = self
            .total
            .compare_exchange(0, total, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn advance(&self, n: u64) {
        self.done.fetch_add(n, Ordering::Relaxed);
    }

    /// Fraction done in `[0, 1]`; 0 while the total is unknown.
    pub fn fraction(&self) -> f64 {
        let total = self.total.load(Ordering::SeqCst);
        if total == 0 {
            return 0.0;
        }
        let done = self.done.load(Ordering::Relaxed).min(total);
        done as f64 / total as f64
    }
}

pub trait BackgroundEstimator: Send + Sync {
    fn code(&self) -> &'static str;

    /// Whether this estimator produces a non-zero background.
    fn computes(&self) -> bool {
        true
    }

    /// Check the input provides what the estimator needs.
    fn validate(&self, _source: &dyn FrameSource) -> Result<()> {
        Ok(())
    }

    /// One-off work over the whole input before the first `compute`.
    fn prepare(&self, _cache: &ImageCache) -> Result<()> {
        Ok(())
    }

    /// Background for the frames of `chunk`.
    fn compute(&self, chunk: &ImageChunk, cache: &ImageCache) -> Result<BackgroundChunk>;

    /// Fraction of the input processed so far, monotonic in `[0, 1]`.
    fn progress(&self) -> f64;
}

/// Build the estimator selected by `spec`.
pub fn from_spec(spec: &StageSpec) -> Result<Box<dyn BackgroundEstimator>> {
    let offset_correction = || spec.bool("offset_correction");
    let kernel_size = || -> Result<usize> {
        let k = spec.int("kernel_size");
        if k < 1 {
            return Err(PipelineError::config(format!("kernel_size must be at least 1, got {k}")));
        }
        Ok(k as usize)
    };
    Ok(match spec.code.as_str() {
        "none" => Box::new(NoBackground),
        "copy" => Box::new(CopyBackground),
        "rollmed" => Box::new(RollingMedian {
            kernel_size: kernel_size()?,
            offset_correction: offset_correction(),
            progress: ProgressCounter::default(),
        }),
        "sparsemed" => {
            let split_time = spec.float("split_time");
            if !(split_time > 0.0) {
                return Err(PipelineError::config(format!("split_time must be positive, got {split_time}")));
            }
            let frac_cleansing = spec.float("frac_cleansing");
            if !(frac_cleansing > 0.0 && frac_cleansing <= 1.0) {
                return Err(PipelineError::config(format!(
                    "frac_cleansing must be in (0, 1], got {frac_cleansing}"
                )));
            }
            Box::new(SparseMedian {
                kernel_size: kernel_size()?,
                split_time,
                thresh_cleansing: spec.float("thresh_cleansing"),
                frac_cleansing,
                offset_correction: offset_correction(),
                medians: OnceLock::new(),
                progress: ProgressCounter::default(),
            })
        }
        other => {
            return Err(PipelineError::config(format!(
                "unknown background '{other}' (known: {:?})",
                registry::codes(StageKind::Background)
            )))
        }
    })
}

/// Zero background.
pub struct NoBackground;

impl BackgroundEstimator for NoBackground {
    fn code(&self) -> &'static str {
        "none"
    }

    fn computes(&self) -> bool {
        false
    }

    fn compute(&self, _chunk: &ImageChunk, _cache: &ImageCache) -> Result<BackgroundChunk> {
        Ok(BackgroundChunk::default())
    }

    fn progress(&self) -> f64 {
        1.0
    }
}

/// Background read from the input's `image_bg` column.
pub struct CopyBackground;

impl BackgroundEstimator for CopyBackground {
    fn code(&self) -> &'static str {
        "copy"
    }

    fn computes(&self) -> bool {
        false
    }

    fn validate(&self, source: &dyn FrameSource) -> Result<()> {
        if !source.has_feature("image_bg") {
            return Err(PipelineError::config("background 'copy' needs an 'image_bg' column in the input"));
        }
        Ok(())
    }

    fn compute(&self, chunk: &ImageChunk, cache: &ImageCache) -> Result<BackgroundChunk> {
        let source = cache.source();
        let images = source.read_rows("image_bg", chunk.start, chunk.stop())?.into_images()?;
        if images.dim() != chunk.images.dim() {
            return Err(PipelineError::integrity(
                "background",
                Some(chunk.index),
                format!("image_bg shape {:?} differs from image shape {:?}", images.dim(), chunk.images.dim()),
            ));
        }
        let bg_off = if source.has_feature("bg_off") {
            match source.read_rows("bg_off", chunk.start, chunk.stop())? {
                FeatureColumn::Float64 { values, .. } => Some(values),
                other => {
                    return Err(PipelineError::integrity(
                        "background",
                        Some(chunk.index),
                        format!("bg_off has dtype {:?}, expected float64", other.dtype()),
                    ))
                }
            }
        } else {
            None
        };
        Ok(BackgroundChunk {
            images: Some(images),
            bg_off,
        })
    }

    fn progress(&self) -> f64 {
        1.0
    }
}

/// Median of a centered window of `kernel_size` frames, recomputed per frame.
pub struct RollingMedian {
    kernel_size: usize,
    offset_correction: bool,
    progress: ProgressCounter,
}

impl BackgroundEstimator for RollingMedian {
    fn code(&self) -> &'static str {
        "rollmed"
    }

    fn prepare(&self, cache: &ImageCache) -> Result<()> {
        self.progress.set_total(cache.len() as u64);
        Ok(())
    }

    fn compute(&self, chunk: &ImageChunk, cache: &ImageCache) -> Result<BackgroundChunk> {
        let len = cache.len();
        if chunk.is_empty() {
            return Ok(BackgroundChunk::default());
        }
        let first = window(chunk.start, self.kernel_size, len);
        let last = window(chunk.stop() - 1, self.kernel_size, len);
        let stack = cache.select(FrameSlice::range(first.start as i64, last.end as i64))?;

        let (n, h, w) = chunk.images.dim();
        let mut images = Array3::zeros((n, h, w));
        for i in 0..n {
            let win = window(chunk.start + i, self.kernel_size, len);
            let local = stack.slice(s![win.start - first.start..win.end - first.start, .., ..]);
            images.index_axis_mut(Axis(0), i).assign(&median_image(local));
        }
        let bg_off = self
            .offset_correction
            .then(|| frame_offsets(chunk.images.view(), images.view()));
        self.progress.advance(n as u64);
        Ok(BackgroundChunk {
            images: Some(images),
            bg_off,
        })
    }

    fn progress(&self) -> f64 {
        self.progress.fraction()
    }
}

/// Medians computed at sparse steps through the input, every `split_time`
/// seconds, from `kernel_size` frames each. Every frame uses the median of
/// the nearest step.
pub struct SparseMedian {
    kernel_size: usize,
    split_time: f64,
    thresh_cleansing: f64,
    frac_cleansing: f64,
    offset_correction: bool,
    medians: OnceLock<SparseMedians>,
    progress: ProgressCounter,
}

#[derive(Debug)]
struct SparseMedians {
    step: usize,
    images: Vec<Array2<u8>>,
}

impl SparseMedian {
    fn step(&self, source: &dyn FrameSource) -> usize {
        let rate = match source.attrs().get(FRAME_RATE_ATTR).map(|v| v.trim().parse::<f64>()) {
            Some(Ok(rate)) if rate > 0.0 => rate,
            _ => {
                warn!(attr = FRAME_RATE_ATTR, default = DEFAULT_FRAME_RATE, "Frame rate missing, using default");
                DEFAULT_FRAME_RATE
            }
        };
        ((self.split_time * rate).round() as usize).max(1)
    }

    fn build(&self, cache: &ImageCache) -> Result<SparseMedians> {
        let len = cache.len();
        let step = self.step(cache.source().as_ref());
        let centres: Vec<usize> = (0..len).step_by(step).collect();
        self.progress.set_total(centres.len().max(1) as u64);

        let mut images = Vec::with_capacity(centres.len());
        for &centre in &centres {
            let win = window(centre, self.kernel_size, len);
            let stack = cache.select(FrameSlice::range(win.start as i64, win.end as i64))?;
            images.push(median_image(stack.view()));
            self.progress.advance(1);
        }
        let replaced = cleanse(&mut images, self.thresh_cleansing, self.frac_cleansing);
        debug!(step, medians = images.len(), replaced, "Sparse median backgrounds computed");
        Ok(SparseMedians { step, images })
    }

    fn medians(&self, cache: &ImageCache) -> Result<&SparseMedians> {
        if let Some(m) = self.medians.get() {
            return Ok(m);
        }
        let built = self.build(cache)?;
        Ok(self.medians.get_or_init(|| built))
    }
}

impl BackgroundEstimator for SparseMedian {
    fn code(&self) -> &'static str {
        "sparsemed"
    }

    fn prepare(&self, cache: &ImageCache) -> Result<()> {
        self.medians(cache).map(|_| ())
    }

    fn compute(&self, chunk: &ImageChunk, cache: &ImageCache) -> Result<BackgroundChunk> {
        let medians = self.medians(cache)?;
        let (n, h, w) = chunk.images.dim();
        let mut images = Array3::zeros((n, h, w));
        if medians.images.is_empty() {
            return Ok(BackgroundChunk {
                images: Some(images),
                bg_off: None,
            });
        }
        for i in 0..n {
            let frame = chunk.start + i;
            let nearest = ((frame as f64 / medians.step as f64).round() as usize).min(medians.images.len() - 1);
            images.index_axis_mut(Axis(0), i).assign(&medians.images[nearest]);
        }
        let bg_off = self
            .offset_correction
            .then(|| frame_offsets(chunk.images.view(), images.view()));
        Ok(BackgroundChunk {
            images: Some(images),
            bg_off,
        })
    }

    fn progress(&self) -> f64 {
        self.progress.fraction()
    }
}

/// `kernel` consecutive frames centred on `index`, shifted to stay inside `[0, len)`.
fn window(index: usize, kernel: usize, len: usize) -> std::ops::Range<usize> {
    let kernel = kernel.min(len).max(1);
    let start = index.saturating_sub(kernel / 2).min(len.saturating_sub(kernel));
    start..start + kernel
}

/// Per-pixel median of a frame stack.
pub fn median_image(stack: ArrayView3<'_, u8>) -> Array2<u8> {
    let (n, h, w) = stack.dim();
    Array2::from_shape_fn((h, w), |(y, x)| {
        let mut hist = [0u32; 256];
        for k in 0..n {
            hist[stack[[k, y, x]] as usize] += 1;
        }
        hist_median(&hist, n)
    })
}

/// Median from a histogram, averaging the two middle values for even counts.
fn hist_median(hist: &[u32; 256], n: usize) -> u8 {
    if n == 0 {
        return 0;
    }
    let (lo_rank, hi_rank) = ((n - 1) / 2, n / 2);
    let mut seen = 0usize;
    let mut lo = None;
    for (value, &count) in hist.iter().enumerate() {
        seen += count as usize;
        if lo.is_none() && seen > lo_rank {
            lo = Some(value);
        }
        if seen > hi_rank {
            let lo = lo.unwrap_or(value);
            return ((lo + value + 1) / 2) as u8;
        }
    }
    u8::MAX
}

fn median_f64(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Replace outlier medians by their nearest kept neighbour. With a positive
/// threshold, medians whose mean brightness deviates from the median of all
/// means by more than it are outliers; otherwise the `frac` closest are kept.
fn cleanse(images: &mut [Array2<u8>], thresh: f64, frac: f64) -> usize {
    if images.len() < 2 {
        return 0;
    }
    let means: Vec<f64> = images
        .iter()
        .map(|im| im.iter().map(|&v| v as f64).sum::<f64>() / im.len().max(1) as f64)
        .collect();
    let centre = median_f64(&mut means.clone());
    let deviation: Vec<f64> = means.iter().map(|m| (m - centre).abs()).collect();

    let keep: Vec<bool> = if thresh > 0.0 {
        deviation.iter().map(|&d| d <= thresh).collect()
    } else {
        let n_keep = ((frac * images.len() as f64).ceil() as usize).clamp(1, images.len());
        let mut order: Vec<usize> = (0..images.len()).collect();
        order.sort_by(|&a, &b| deviation[a].total_cmp(&deviation[b]).then(a.cmp(&b)));
        let mut keep = vec![false; images.len()];
        for &i in &order[..n_keep] {
            keep[i] = true;
        }
        keep
    };
    if !keep.iter().any(|&k| k) {
        return 0;
    }

    let mut replaced = 0;
    for i in 0..images.len() {
        if keep[i] {
            continue;
        }
        let nearest = (0..images.len())
            .filter(|&j| keep[j])
            .min_by_key(|&j| (i.abs_diff(j), j))
            .unwrap_or(i);
        images[i] = images[nearest].clone();
        replaced += 1;
    }
    replaced
}

/// Median difference between frame and background over the left and right
/// border columns of each frame.
pub fn frame_offsets(images: ArrayView3<'_, u8>, background: ArrayView3<'_, u8>) -> Vec<f64> {
    images
        .outer_iter()
        .zip(background.outer_iter())
        .map(|(image, bg)| border_offset(image, bg))
        .collect()
}

fn border_offset(image: ArrayView2<'_, u8>, bg: ArrayView2<'_, u8>) -> f64 {
    let (_, w) = image.dim();
    let border = OFFSET_BORDER.min(w.div_ceil(2));
    let mut diffs: Vec<f64> = image
        .indexed_iter()
        .filter(|((_, x), _)| *x < border || *x >= w - border)
        .map(|((y, x), &v)| v as f64 - bg[[y, x]] as f64)
        .collect();
    median_f64(&mut diffs)
}
