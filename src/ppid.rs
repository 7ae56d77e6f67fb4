//! Pipeline identifiers.
//!
//! A pipeline identifier (PPID) is the generation number followed by one
//! fragment per stage, joined by `|`:
//!
//! ```text
//! 1|store:i=0^p=0.2645|sparsemed:f=0.8^k=200^o=1^s=1^t=0|thresh:t=-6:cle=1^clo=2^f=1|legacy:b=1^m=1|norm:o=0^s=0
//! ```
//!
//! Two runs with the same identifier produce identical feature output. The
//! generation number is bumped by hand whenever the behavior of an existing
//! stage changes, even when its keyword arguments do not.

use crate::error::{PipelineError, Result};
use crate::stages::{StageKind, StageSet, StageSpec};

/// Current pipeline generation.
pub const PPID_GENERATION: u32 = 1;

/// Build the identifier for `stages` at `generation`.
pub fn compute_ppid(generation: u32, stages: &StageSet) -> String {
    let mut parts = vec![generation.to_string()];
    parts.extend(stages.iter().map(StageSpec::fragment));
    parts.join("|")
}

/// Check that `ppid` is what `stages` computes to at the identifier's own
/// generation.
pub fn validate(ppid: &str, stages: &StageSet) -> Result<()> {
    let generation = parse_generation(ppid)?;
    let computed = compute_ppid(generation, stages);
    if computed != ppid {
        return Err(PipelineError::PpidMismatch {
            expected: ppid.to_string(),
            computed,
        });
    }
    Ok(())
}

fn parse_generation(ppid: &str) -> Result<u32> {
    let head = ppid.split('|').next().unwrap_or_default();
    head.parse()
        .map_err(|_| PipelineError::config(format!("pipeline identifier '{ppid}' has no generation number")))
}

/// Split an identifier into its generation and per-stage fragments.
pub fn split(ppid: &str) -> Result<(u32, Vec<(StageKind, &str)>)> {
    let generation = parse_generation(ppid)?;
    let fragments: Vec<&str> = ppid.split('|').skip(1).collect();
    if fragments.len() != StageKind::ALL.len() {
        return Err(PipelineError::config(format!(
            "pipeline identifier '{ppid}' has {} stage fragments, expected {}",
            fragments.len(),
            StageKind::ALL.len()
        )));
    }
    Ok((generation, StageKind::ALL.iter().copied().zip(fragments).collect()))
}

/// Reconstruct the stage set an identifier was computed from.
pub fn parse(ppid: &str) -> Result<(u32, StageSet)> {
    let (generation, fragments) = split(ppid)?;
    let mut specs = fragments
        .into_iter()
        .map(|(kind, frag)| StageSpec::from_fragment(kind, frag));
    let mut next = || {
        specs
            .next()
            .unwrap_or_else(|| Err(PipelineError::config("missing stage fragment")))
    };
    let stages = StageSet {
        data: next()?,
        background: next()?,
        segmenter: next()?,
        features: next()?,
        gate: next()?,
    };
    Ok((generation, stages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{KwargValue, Kwargs};

    fn stage_set(bg_kernel: i64, thresh: i64) -> StageSet {
        let mut data = Kwargs::new();
        data.insert("pixel_size".into(), KwargValue::Float(0.2645));
        let mut bg = Kwargs::new();
        bg.insert("kernel_size".into(), KwargValue::Int(bg_kernel));
        let mut seg = Kwargs::new();
        seg.insert("thresh".into(), KwargValue::Int(thresh));
        StageSet {
            data: StageSpec::resolve(StageKind::Data, "store", &data, None).unwrap(),
            background: StageSpec::resolve(StageKind::Background, "sparsemed", &bg, None).unwrap(),
            segmenter: StageSpec::resolve(StageKind::Segmenter, "thresh", &seg, None).unwrap(),
            features: StageSpec::resolve(StageKind::Features, "legacy", &Kwargs::new(), None).unwrap(),
            gate: StageSpec::resolve(StageKind::Gate, "norm", &Kwargs::new(), None).unwrap(),
        }
    }

    #[test]
    fn test_compute_layout() {
        let ppid = compute_ppid(PPID_GENERATION, &stage_set(200, -6));
        assert_eq!(
            ppid,
            "1|store:i=0^p=0.2645|sparsemed:f=0.8^k=200^o=1^s=1^t=0|thresh:t=-6:cle=1^clo=2^f=1|legacy:b=1^m=1|norm:o=0^s=0"
        );
    }

    #[test]
    fn test_validate_roundtrip_and_mismatch() {
        let stages = stage_set(200, -6);
        let ppid = compute_ppid(PPID_GENERATION, &stages);
        validate(&ppid, &stages).unwrap();

        let other = stage_set(200, -5);
        assert_ne!(compute_ppid(PPID_GENERATION, &other), ppid);
        assert!(matches!(validate(&ppid, &other), Err(PipelineError::PpidMismatch { .. })));
    }

    #[test]
    fn test_generation_changes_identifier() {
        let stages = stage_set(200, -6);
        assert_ne!(compute_ppid(1, &stages), compute_ppid(2, &stages));
        assert!(validate(&compute_ppid(7, &stages), &stages).is_ok());
    }

    #[test]
    fn test_kwarg_order_does_not_matter() {
        let mut a = Kwargs::new();
        a.insert("kernel_size".into(), KwargValue::Int(50));
        a.insert("split_time".into(), KwargValue::Float(2.0));
        // BTreeMap orders keys regardless of insertion order
        let mut b = Kwargs::new();
        b.insert("split_time".into(), KwargValue::Float(2.0));
        b.insert("kernel_size".into(), KwargValue::Int(50));
        let sa = StageSpec::resolve(StageKind::Background, "sparsemed", &a, None).unwrap();
        let sb = StageSpec::resolve(StageKind::Background, "sparsemed", &b, None).unwrap();
        assert_eq!(sa.fragment(), sb.fragment());
    }

    #[test]
    fn test_parse_rebuilds_stage_set() {
        let stages = stage_set(120, -4);
        let ppid = compute_ppid(PPID_GENERATION, &stages);
        let (generation, parsed) = parse(&ppid).unwrap();
        assert_eq!(generation, PPID_GENERATION);
        assert_eq!(parsed, stages);
        assert!(parse("1|store:i=0^p=1").is_err());
        assert!(parse("x|a|b|c|d|e").is_err());
    }
}
