//! Event gating.

use super::{registry, StageKind, StageSpec};
use crate::error::{PipelineError, Result};
use crate::events::{Event, FeatureValue};
use std::collections::BTreeMap;

/// Input attribute holding the online size threshold.
pub const ONLINE_SIZE_ATTR: &str = "online_contour:bin area min";

/// Drops events whose mask area is below a size threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Gate {
    /// Minimum mask area in pixels, 0 keeps everything
    pub size_thresh_mask: u64,
}

impl Gate {
    /// Resolve the gate for a dataset. With online gates enabled and no user
    /// threshold, the threshold comes from the dataset attributes.
    pub fn from_spec(spec: &StageSpec, attrs: &BTreeMap<String, String>) -> Result<Self> {
        if spec.code != "norm" {
            return Err(PipelineError::config(format!(
                "unknown gate '{}' (known: {:?})",
                spec.code,
                registry::codes(StageKind::Gate)
            )));
        }
        let user = spec.int("size_thresh_mask");
        if user < 0 {
            return Err(PipelineError::config("size_thresh_mask must not be negative"));
        }
        let mut size = user as u64;
        if spec.bool("online_gates") && size == 0 {
            if let Some(raw) = attrs.get(ONLINE_SIZE_ATTR) {
                size = raw.trim().parse::<f64>().map(|v| v.max(0.0) as u64).map_err(|_| {
                    PipelineError::config(format!("attribute '{ONLINE_SIZE_ATTR}' is not numeric: '{raw}'"))
                })?;
            }
        }
        Ok(Self { size_thresh_mask: size })
    }

    pub fn keeps(&self, event: &Event) -> bool {
        if self.size_thresh_mask == 0 {
            return true;
        }
        match event.features.get("area_px") {
            Some(FeatureValue::Scalar(area)) => *area >= self.size_thresh_mask as f64,
            _ => true,
        }
    }

    /// Filter events in place, returning how many were dropped.
    pub fn apply(&self, events: &mut Vec<Event>) -> usize {
        let before = events.len();
        events.retain(|e| self.keeps(e));
        before - events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{KwargValue, Kwargs};

    fn event(area: f64) -> Event {
        let mut features = BTreeMap::new();
        features.insert("area_px".to_string(), FeatureValue::Scalar(area));
        Event { frame_index: 0, label: 1, features }
    }

    #[test]
    fn test_online_threshold_from_attrs() {
        let mut kw = Kwargs::new();
        kw.insert("online_gates".into(), KwargValue::Bool(true));
        let spec = StageSpec::resolve(StageKind::Gate, "norm", &kw, None).unwrap();
        let mut attrs = BTreeMap::new();
        attrs.insert(ONLINE_SIZE_ATTR.to_string(), "10".to_string());

        let gate = Gate::from_spec(&spec, &attrs).unwrap();
        assert_eq!(gate.size_thresh_mask, 10);

        let mut events = vec![event(4.0), event(10.0), event(25.0)];
        assert_eq!(gate.apply(&mut events), 1);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_user_threshold_wins() {
        let mut kw = Kwargs::new();
        kw.insert("online_gates".into(), KwargValue::Bool(true));
        kw.insert("size_thresh_mask".into(), KwargValue::Int(3));
        let spec = StageSpec::resolve(StageKind::Gate, "norm", &kw, None).unwrap();
        let mut attrs = BTreeMap::new();
        attrs.insert(ONLINE_SIZE_ATTR.to_string(), "10".to_string());
        assert_eq!(Gate::from_spec(&spec, &attrs).unwrap().size_thresh_mask, 3);
    }

    #[test]
    fn test_default_keeps_everything() {
        let spec = StageSpec::resolve(StageKind::Gate, "norm", &Kwargs::new(), None).unwrap();
        let gate = Gate::from_spec(&spec, &BTreeMap::new()).unwrap();
        assert!(gate.keeps(&event(0.0)));
    }
}
