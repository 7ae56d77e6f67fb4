//! Per-event feature extraction.
//!
//! Extraction is a pure function of (frame, corrected frame, labels). Sums
//! are accumulated sequentially in raster order so results do not depend on
//! thread scheduling.

use super::{registry, StageKind, StageSpec};
use crate::error::{PipelineError, Result};
use crate::events::{Event, FeatureValue};
use ndarray::{Array2, ArrayView2};
use std::collections::BTreeMap;

/// Features copied from the input for every event, whatever the selection.
pub const PROTECTED_FEATURES: &[&str] = &["frame", "time", "temp"];

/// Feature set of the `legacy` extractor.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    brightness: bool,
    moments: bool,
    pixel_size: f64,
}

/// Everything the extractor sees of one frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameInput<'a> {
    pub frame_index: usize,
    pub image: ArrayView2<'a, u8>,
    pub corrected: Option<ArrayView2<'a, i16>>,
    pub labels: ArrayView2<'a, u16>,
}

struct Region {
    pixels: Vec<(usize, usize)>,
}

impl FeatureExtractor {
    pub fn from_spec(spec: &StageSpec, pixel_size: f64) -> Result<Self> {
        if spec.code != "legacy" {
            return Err(PipelineError::config(format!(
                "unknown feature extractor '{}' (known: {:?})",
                spec.code,
                registry::codes(StageKind::Features)
            )));
        }
        Ok(Self {
            brightness: spec.bool("brightness"),
            moments: spec.bool("moments"),
            // Without calibration positions stay in pixels
            pixel_size: if pixel_size > 0.0 { pixel_size } else { 1.0 },
        })
    }

    /// Names of the features every event carries.
    pub fn feature_names(&self) -> Vec<&'static str> {
        let mut names = vec!["mask", "area_px", "area_um", "pos_x", "pos_y"];
        if self.moments {
            names.extend(["size_x", "size_y", "aspect", "inert_ratio"]);
        }
        if self.brightness {
            names.extend(["bright_avg", "bright_sd", "bright_bc_avg", "bright_perc_10", "bright_perc_90"]);
        }
        names
    }

    /// Extract the events of one frame in label order. A frame without
    /// labels yields no events.
    pub fn extract(&self, input: &FrameInput<'_>) -> Vec<Event> {
        let regions = collect_regions(input.labels);
        regions
            .into_iter()
            .enumerate()
            .filter(|(_, r)| !r.pixels.is_empty())
            .map(|(i, region)| {
                let label = (i + 1) as u16;
                Event {
                    frame_index: input.frame_index,
                    label,
                    features: self.region_features(input, label, &region),
                }
            })
            .collect()
    }

    fn region_features(&self, input: &FrameInput<'_>, label: u16, region: &Region) -> BTreeMap<String, FeatureValue> {
        let ps = self.pixel_size;
        let n = region.pixels.len() as f64;
        let mut f = BTreeMap::new();

        let mask = input.labels.mapv(|l| if l == label { 255u8 } else { 0 });
        f.insert("mask".to_string(), FeatureValue::Mask(mask));

        let (sum_y, sum_x) = region
            .pixels
            .iter()
            .fold((0.0, 0.0), |(sy, sx), &(y, x)| (sy + y as f64, sx + x as f64));
        let (cy, cx) = (sum_y / n, sum_x / n);
        f.insert("area_px".to_string(), FeatureValue::Scalar(n));
        f.insert("area_um".to_string(), FeatureValue::Scalar(n * ps * ps));
        f.insert("pos_x".to_string(), FeatureValue::Scalar(cx * ps));
        f.insert("pos_y".to_string(), FeatureValue::Scalar(cy * ps));

        if self.moments {
            let (mut y0, mut y1, mut x0, mut x1) = (usize::MAX, 0, usize::MAX, 0);
            let (mut mu20, mut mu02) = (0.0, 0.0);
            for &(y, x) in &region.pixels {
                y0 = y0.min(y);
                y1 = y1.max(y);
                x0 = x0.min(x);
                x1 = x1.max(x);
                mu20 += (x as f64 - cx).powi(2);
                mu02 += (y as f64 - cy).powi(2);
            }
            let size_x = (x1 - x0 + 1) as f64 * ps;
            let size_y = (y1 - y0 + 1) as f64 * ps;
            f.insert("size_x".to_string(), FeatureValue::Scalar(size_x));
            f.insert("size_y".to_string(), FeatureValue::Scalar(size_y));
            f.insert("aspect".to_string(), FeatureValue::Scalar(size_x / size_y));
            let inert = if mu02 > 0.0 { (mu20 / mu02).sqrt() } else { f64::NAN };
            f.insert("inert_ratio".to_string(), FeatureValue::Scalar(inert));
        }

        if self.brightness {
            let raw: Vec<f64> = region.pixels.iter().map(|&p| input.image[p] as f64).collect();
            let (avg, sd) = mean_sd(&raw);
            f.insert("bright_avg".to_string(), FeatureValue::Scalar(avg));
            f.insert("bright_sd".to_string(), FeatureValue::Scalar(sd));

            let mut corrected: Vec<f64> = match input.corrected {
                Some(c) => region.pixels.iter().map(|&p| c[p] as f64).collect(),
                None => raw,
            };
            let (bc_avg, _) = mean_sd(&corrected);
            f.insert("bright_bc_avg".to_string(), FeatureValue::Scalar(bc_avg));
            corrected.sort_by(|a, b| a.total_cmp(b));
            f.insert("bright_perc_10".to_string(), FeatureValue::Scalar(percentile(&corrected, 10.0)));
            f.insert("bright_perc_90".to_string(), FeatureValue::Scalar(percentile(&corrected, 90.0)));
        }

        f
    }
}

fn collect_regions(labels: ArrayView2<'_, u16>) -> Vec<Region> {
    let max = labels.iter().copied().max().unwrap_or(0) as usize;
    let mut regions: Vec<Region> = (0..max).map(|_| Region { pixels: Vec::new() }).collect();
    for ((y, x), &l) in labels.indexed_iter() {
        if l > 0 {
            regions[l as usize - 1].pixels.push((y, x));
        }
    }
    regions
}

fn mean_sd(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Linear-interpolated percentile of sorted values.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        len => {
            let pos = q / 100.0 * (len - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
        }
    }
}

/// Corrected frame `image - background - offset`, saturating to i16.
pub fn correct_frame(image: ArrayView2<'_, u8>, background: Option<ArrayView2<'_, u8>>, offset: f64) -> Array2<i16> {
    let offset = offset.round();
    match background {
        Some(bg) => ndarray::Zip::from(image)
            .and(bg)
            .map_collect(|&v, &b| (v as f64 - b as f64 - offset) as i16),
        None => image.mapv(|v| (v as f64 - offset) as i16),
    }
}
