//! Pluggable processing stages.
//!
//! Each stage kind (data, background, segmenter, features, gate) has a closed
//! set of variants selected by a short code. Variants declare their keyword
//! arguments in [`registry`]; a [`StageSpec`] is a variant code plus its
//! fully resolved kwargs, and a [`StageSet`] is the ordered set of all five
//! stages that defines a run.

pub mod background;
pub mod features;
pub mod gate;
pub mod kwargs;
pub mod morphology;
pub mod segmenter;

pub use background::{BackgroundChunk, BackgroundEstimator, ProgressCounter};
pub use features::FeatureExtractor;
pub use gate::Gate;
pub use kwargs::{KwargDefault, KwargSpec, KwargValue, Kwargs};
pub use segmenter::{HardwareProcessor, RawMask, Segmenter};

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The stage kinds, in identifier order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Data,
    Background,
    Segmenter,
    Features,
    Gate,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Data,
        StageKind::Background,
        StageKind::Segmenter,
        StageKind::Features,
        StageKind::Gate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Background => "background",
            Self::Segmenter => "segmenter",
            Self::Features => "feature",
            Self::Gate => "gate",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Declared keyword arguments per stage variant.
pub mod registry {
    use super::kwargs::{KwargDefault as D, KwargSpec as K};
    use super::StageKind;

    pub const DATA_STORE: &[K] = &[
        K::new("pixel_size", D::Float(0.0)),
        K::new("index_mapping", D::Text("0")),
    ];

    pub const BG_NONE: &[K] = &[];
    pub const BG_COPY: &[K] = &[];
    pub const BG_ROLLMED: &[K] = &[
        K::new("kernel_size", D::Int(100)),
        K::new("offset_correction", D::Bool(false)),
    ];
    pub const BG_SPARSEMED: &[K] = &[
        K::new("kernel_size", D::Int(200)),
        K::new("split_time", D::Float(1.0)),
        K::new("thresh_cleansing", D::Float(0.0)),
        K::new("frac_cleansing", D::Float(0.8)),
        K::new("offset_correction", D::Bool(true)),
    ];

    pub const SEG_THRESH: &[K] = &[K::new("thresh", D::Int(-6))];
    pub const SEG_RAWTHRESH: &[K] = &[
        K::new("thresh", D::Int(100)),
        K::new("invert", D::Bool(false)),
    ];

    /// Mask post-processing kwargs shared by segmenters that post-process.
    pub const MASK: &[K] = &[
        K::new("clear_border", D::Bool(true)),
        K::new("fill_holes", D::Bool(true)),
        K::new("closing_disk", D::Int(2)),
    ];

    pub const FEAT_LEGACY: &[K] = &[
        K::new("brightness", D::Bool(true)),
        K::new("moments", D::Bool(true)),
    ];

    pub const GATE_NORM: &[K] = &[
        K::new("online_gates", D::Bool(false)),
        K::new("size_thresh_mask", D::Int(0)),
    ];

    /// Keyword declarations for `code` of `kind`, or `None` for an unknown variant.
    pub fn lookup(kind: StageKind, code: &str) -> Option<&'static [K]> {
        Some(match (kind, code) {
            (StageKind::Data, "store") => DATA_STORE,
            (StageKind::Background, "none") => BG_NONE,
            (StageKind::Background, "copy") => BG_COPY,
            (StageKind::Background, "rollmed") => BG_ROLLMED,
            (StageKind::Background, "sparsemed") => BG_SPARSEMED,
            (StageKind::Segmenter, "thresh") => SEG_THRESH,
            (StageKind::Segmenter, "rawthresh") => SEG_RAWTHRESH,
            (StageKind::Features, "legacy") => FEAT_LEGACY,
            (StageKind::Gate, "norm") => GATE_NORM,
            _ => return None,
        })
    }

    /// Whether a segmenter variant runs mask post-processing.
    pub fn segmenter_postprocesses(code: &str) -> bool {
        code == "thresh"
    }

    pub fn codes(kind: StageKind) -> &'static [&'static str] {
        match kind {
            StageKind::Data => &["store"],
            StageKind::Background => &["none", "copy", "rollmed", "sparsemed"],
            StageKind::Segmenter => &["thresh", "rawthresh"],
            StageKind::Features => &["legacy"],
            StageKind::Gate => &["norm"],
        }
    }
}

/// A stage variant with fully resolved keyword arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub kind: StageKind,
    pub code: String,
    pub kwargs: Kwargs,
    /// Mask post-processing kwargs (segmenters only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_kwargs: Option<Kwargs>,
}

impl StageSpec {
    /// Resolve user kwargs against the declaration of `code`.
    pub fn resolve(kind: StageKind, code: &str, given: &Kwargs, given_mask: Option<&Kwargs>) -> Result<Self> {
        let specs = registry::lookup(kind, code).ok_or_else(|| {
            PipelineError::config(format!(
                "unknown {kind} variant '{code}' (known: {:?})",
                registry::codes(kind)
            ))
        })?;
        let group = format!("{kind} '{code}'");
        let kwargs = kwargs::resolve(&group, specs, given)?;

        let mask_kwargs = if kind == StageKind::Segmenter {
            if registry::segmenter_postprocesses(code) {
                let empty = Kwargs::new();
                Some(kwargs::resolve(&format!("{group} mask"), registry::MASK, given_mask.unwrap_or(&empty))?)
            } else {
                if given_mask.is_some_and(|m| !m.is_empty()) {
                    return Err(PipelineError::config(format!(
                        "segmenter '{code}' does not post-process masks and accepts no mask kwargs"
                    )));
                }
                None
            }
        } else {
            None
        };

        Ok(Self {
            kind,
            code: code.to_string(),
            kwargs,
            mask_kwargs,
        })
    }

    /// Identifier fragment, e.g. `thresh:t=-6:cle=1^clo=2^f=1`.
    pub fn fragment(&self) -> String {
        let specs = registry::lookup(self.kind, &self.code).unwrap_or(&[]);
        let mut out = format!("{}:{}", self.code, kwargs::encode(&self.kwargs, specs));
        if let Some(mask) = &self.mask_kwargs {
            out.push(':');
            out.push_str(&kwargs::encode(mask, registry::MASK));
        }
        out
    }

    /// Parse an identifier fragment back into a resolved spec.
    pub fn from_fragment(kind: StageKind, fragment: &str) -> Result<Self> {
        let mut parts = fragment.split(':');
        let code = parts.next().unwrap_or_default();
        let specs = registry::lookup(kind, code)
            .ok_or_else(|| PipelineError::config(format!("unknown {kind} variant '{code}'")))?;
        let group = format!("{kind} '{code}'");
        let kwargs = kwargs::decode(&group, parts.next().unwrap_or_default(), specs)?;
        let mask = parts
            .next()
            .map(|m| kwargs::decode(&format!("{group} mask"), m, registry::MASK))
            .transpose()?;
        if parts.next().is_some() {
            return Err(PipelineError::config(format!("malformed {kind} fragment '{fragment}'")));
        }
        Self::resolve(kind, code, &kwargs, mask.as_ref())
    }

    pub fn bool(&self, name: &str) -> bool {
        self.kwargs.get(name).and_then(KwargValue::as_bool).unwrap_or(false)
    }

    pub fn int(&self, name: &str) -> i64 {
        self.kwargs.get(name).and_then(KwargValue::as_i64).unwrap_or(0)
    }

    pub fn float(&self, name: &str) -> f64 {
        self.kwargs.get(name).and_then(KwargValue::as_f64).unwrap_or(0.0)
    }

    pub fn text(&self, name: &str) -> &str {
        self.kwargs.get(name).and_then(KwargValue::as_str).unwrap_or_default()
    }
}

/// The full, ordered stage configuration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSet {
    pub data: StageSpec,
    pub background: StageSpec,
    pub segmenter: StageSpec,
    pub features: StageSpec,
    pub gate: StageSpec,
}

impl StageSet {
    pub fn iter(&self) -> impl Iterator<Item = &StageSpec> {
        [&self.data, &self.background, &self.segmenter, &self.features, &self.gate].into_iter()
    }

    /// Pixel size in micrometers from the data stage.
    pub fn pixel_size(&self) -> f64 {
        self.data.float("pixel_size")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_fills_mask_defaults() {
        let spec = StageSpec::resolve(StageKind::Segmenter, "thresh", &Kwargs::new(), None).unwrap();
        assert_eq!(spec.fragment(), "thresh:t=-6:cle=1^clo=2^f=1");
    }

    #[test]
    fn test_non_postprocessing_segmenter_rejects_mask_kwargs() {
        let mut mask = Kwargs::new();
        mask.insert("fill_holes".into(), KwargValue::Bool(false));
        let err = StageSpec::resolve(StageKind::Segmenter, "rawthresh", &Kwargs::new(), Some(&mask));
        assert!(matches!(err, Err(PipelineError::Configuration(_))));
        // An empty group is fine
        assert!(StageSpec::resolve(StageKind::Segmenter, "rawthresh", &Kwargs::new(), Some(&Kwargs::new())).is_ok());
    }

    #[test]
    fn test_unknown_variant() {
        assert!(StageSpec::resolve(StageKind::Background, "magic", &Kwargs::new(), None).is_err());
    }

    #[test]
    fn test_fragment_parses_back() {
        let mut given = Kwargs::new();
        given.insert("kernel_size".into(), KwargValue::Int(150));
        given.insert("split_time".into(), KwargValue::Float(0.5));
        let spec = StageSpec::resolve(StageKind::Background, "sparsemed", &given, None).unwrap();
        assert_eq!(spec.fragment(), "sparsemed:f=0.8^k=150^o=1^s=0.5^t=0");
        let parsed = StageSpec::from_fragment(StageKind::Background, &spec.fragment()).unwrap();
        assert_eq!(parsed, spec);
    }
}
