//! Segmenters turn a frame into a label image.

use super::morphology::{self, MaskOptions};
use super::{registry, StageSpec};
use crate::error::{PipelineError, Result};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Where a segmenter runs its computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareProcessor {
    Cpu,
    Accelerator,
}

/// Raw segmenter output before post-processing.
#[derive(Debug, Clone, PartialEq)]
pub enum RawMask {
    Binary(Array2<bool>),
    Labels(Array2<u16>),
}

impl RawMask {
    pub fn to_binary(&self) -> Array2<bool> {
        match self {
            Self::Binary(b) => b.clone(),
            Self::Labels(l) => l.mapv(|v| v != 0),
        }
    }
}

/// Input routed to a segmenter.
#[derive(Debug, Clone, Copy)]
pub enum SegmenterInput<'a> {
    Raw(ArrayView2<'a, u8>),
    Corrected(ArrayView2<'a, i16>),
}

/// What a segmenter may check before a run starts.
#[derive(Debug, Clone)]
pub struct DatasetInfo {
    pub frame_shape: (usize, usize),
    pub len: usize,
    pub has_background: bool,
}

pub trait Segmenter: Send + Sync {
    fn code(&self) -> &'static str;

    /// Produce the raw mask of one frame.
    fn segment_raw(&self, input: SegmenterInput<'_>) -> Result<RawMask>;

    /// Whether the segmenter needs the background-corrected frame.
    fn requires_background_correction(&self) -> bool;

    fn hardware_processor(&self) -> HardwareProcessor {
        HardwareProcessor::Cpu
    }

    /// Mask post-processing options, `None` when post-processing is disabled.
    fn mask_options(&self) -> Option<MaskOptions>;

    fn validate_applicability(&self, info: &DatasetInfo) -> std::result::Result<(), String> {
        if info.frame_shape.0 == 0 || info.frame_shape.1 == 0 {
            return Err(format!("frames have an empty shape {:?}", info.frame_shape));
        }
        Ok(())
    }

    /// Segment one frame into labels 1..=n (0 is background).
    fn segment(&self, input: SegmenterInput<'_>) -> Result<Array2<u16>> {
        let raw = self.segment_raw(input)?;
        Ok(match (self.mask_options(), raw) {
            (Some(options), raw) => morphology::postprocess(&raw.to_binary(), &options),
            (None, RawMask::Labels(labels)) => labels,
            (None, RawMask::Binary(binary)) => morphology::label(&binary),
        })
    }
}

/// Thresholding of the background-corrected frame. A negative threshold
/// selects pixels darker than the background, a positive one brighter pixels.
#[derive(Debug, Clone)]
pub struct ThresholdSegmenter {
    thresh: i16,
    mask: MaskOptions,
}

impl Segmenter for ThresholdSegmenter {
    fn code(&self) -> &'static str {
        "thresh"
    }

    fn segment_raw(&self, input: SegmenterInput<'_>) -> Result<RawMask> {
        let SegmenterInput::Corrected(image) = input else {
            return Err(PipelineError::integrity("segmentation", None, "thresh needs the background-corrected frame"));
        };
        let t = self.thresh;
        Ok(RawMask::Binary(if t < 0 {
            image.mapv(|v| v < t)
        } else {
            image.mapv(|v| v > t)
        }))
    }

    fn requires_background_correction(&self) -> bool {
        true
    }

    fn mask_options(&self) -> Option<MaskOptions> {
        Some(self.mask)
    }

    fn validate_applicability(&self, info: &DatasetInfo) -> std::result::Result<(), String> {
        if info.frame_shape.0 == 0 || info.frame_shape.1 == 0 {
            return Err(format!("frames have an empty shape {:?}", info.frame_shape));
        }
        if self.thresh == 0 {
            return Err("a threshold of 0 selects every pixel".to_string());
        }
        Ok(())
    }
}

/// Thresholding of the raw frame without mask post-processing.
#[derive(Debug, Clone)]
pub struct RawThresholdSegmenter {
    thresh: u8,
    invert: bool,
}

impl Segmenter for RawThresholdSegmenter {
    fn code(&self) -> &'static str {
        "rawthresh"
    }

    fn segment_raw(&self, input: SegmenterInput<'_>) -> Result<RawMask> {
        let SegmenterInput::Raw(image) = input else {
            return Err(PipelineError::integrity("segmentation", None, "rawthresh needs the raw frame"));
        };
        let t = self.thresh;
        Ok(RawMask::Binary(if self.invert {
            image.mapv(|v| v > t)
        } else {
            image.mapv(|v| v < t)
        }))
    }

    fn requires_background_correction(&self) -> bool {
        false
    }

    fn mask_options(&self) -> Option<MaskOptions> {
        None
    }
}

/// Instantiate the segmenter described by a resolved spec.
pub fn from_spec(spec: &StageSpec) -> Result<Box<dyn Segmenter>> {
    match spec.code.as_str() {
        "thresh" => {
            let mask = spec.mask_kwargs.as_ref().map(mask_options).unwrap_or_default();
            Ok(Box::new(ThresholdSegmenter {
                thresh: threshold(spec, -255, 255)? as i16,
                mask,
            }))
        }
        "rawthresh" => Ok(Box::new(RawThresholdSegmenter {
            thresh: threshold(spec, 0, 255)? as u8,
            invert: spec.bool("invert"),
        })),
        other => Err(PipelineError::config(format!(
            "unknown segmenter '{other}' (known: {:?})",
            registry::codes(super::StageKind::Segmenter)
        ))),
    }
}

fn mask_options(kwargs: &super::Kwargs) -> MaskOptions {
    let get_bool = |k: &str, d: bool| kwargs.get(k).and_then(|v| v.as_bool()).unwrap_or(d);
    MaskOptions {
        clear_border: get_bool("clear_border", true),
        fill_holes: get_bool("fill_holes", true),
        closing_disk: kwargs
            .get("closing_disk")
            .and_then(|v| v.as_i64())
            .unwrap_or(2)
            .clamp(0, u8::MAX as i64) as u8,
    }
}

/// The `thresh` kwarg, which must lie within `[min, max]`.
fn threshold(spec: &StageSpec, min: i64, max: i64) -> Result<i64> {
    let t = spec.int("thresh");
    if !(min..=max).contains(&t) {
        return Err(PipelineError::config(format!(
            "{} threshold {t} is outside [{min}, {max}]",
            spec.code
        )));
    }
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{KwargValue, Kwargs, StageKind};

    fn thresh_spec(t: i64) -> StageSpec {
        let mut kw = Kwargs::new();
        kw.insert("thresh".into(), KwargValue::Int(t));
        StageSpec::resolve(StageKind::Segmenter, "thresh", &kw, None).unwrap()
    }

    #[test]
    fn test_threshold_selects_dark_objects() {
        let seg = from_spec(&thresh_spec(-6)).unwrap();
        assert!(seg.requires_background_correction());

        let mut corrected = Array2::<i16>::zeros((16, 16));
        for y in 5..10 {
            for x in 5..10 {
                corrected[[y, x]] = -20;
            }
        }
        let labels = seg.segment(SegmenterInput::Corrected(corrected.view())).unwrap();
        assert_eq!(morphology::count_labels(&labels), 1);
        assert_eq!(labels[[7, 7]], 1);
    }

    #[test]
    fn test_wrong_input_is_rejected() {
        let seg = from_spec(&thresh_spec(-6)).unwrap();
        let raw = Array2::<u8>::zeros((4, 4));
        assert!(seg.segment(SegmenterInput::Raw(raw.view())).is_err());
    }

    #[test]
    fn test_rawthresh_labels_without_postprocessing() {
        let spec = StageSpec::resolve(StageKind::Segmenter, "rawthresh", &Kwargs::new(), None).unwrap();
        let seg = from_spec(&spec).unwrap();
        assert!(!seg.requires_background_correction());
        assert!(seg.mask_options().is_none());

        let mut image = Array2::<u8>::from_elem((10, 10), 200);
        // Touches the border, would be removed by post-processing
        image[[0, 0]] = 10;
        image[[5, 5]] = 10;
        let labels = seg.segment(SegmenterInput::Raw(image.view())).unwrap();
        assert_eq!(morphology::count_labels(&labels), 2);
    }

    #[test]
    fn test_out_of_range_thresholds_rejected() {
        let raw = |t: i64| {
            let mut kw = Kwargs::new();
            kw.insert("thresh".into(), KwargValue::Int(t));
            StageSpec::resolve(StageKind::Segmenter, "rawthresh", &kw, None).unwrap()
        };
        assert!(matches!(from_spec(&raw(300)), Err(PipelineError::Configuration(_))));
        assert!(from_spec(&raw(-1)).is_err());
        assert!(from_spec(&raw(255)).is_ok());

        assert!(from_spec(&thresh_spec(-300)).is_err());
        assert!(from_spec(&thresh_spec(256)).is_err());
        assert!(from_spec(&thresh_spec(-255)).is_ok());
    }

    #[test]
    fn test_applicability() {
        let seg = from_spec(&thresh_spec(-6)).unwrap();
        let info = DatasetInfo { frame_shape: (0, 10), len: 3, has_background: false };
        assert!(seg.validate_applicability(&info).is_err());
        let info = DatasetInfo { frame_shape: (10, 10), len: 3, has_background: false };
        assert!(seg.validate_applicability(&info).is_ok());
    }
}
