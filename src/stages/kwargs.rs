//! Keyword arguments of pipeline stages and their canonical text encoding.
//!
//! Every stage variant declares its keyword arguments up front. User supplied
//! kwargs are checked against that declaration (unknown keys and type
//! mismatches are configuration errors) and completed with defaults, so a
//! resolved stage always carries its full argument set.
//!
//! The encoding used in pipeline identifiers is `key=value` pairs joined by
//! `^`, sorted by full argument name, where `key` is the shortest prefix that
//! is unique among the declared names of the same group.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Characters with structural meaning in the identifier encoding.
const RESERVED: &[char] = &['|', ':', '^', '='];

/// A keyword argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KwargValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Declared type of a keyword argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KwargKind {
    Bool,
    Int,
    Float,
    Text,
}

/// Declared default of a keyword argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KwargDefault {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(&'static str),
}

impl KwargDefault {
    fn kind(&self) -> KwargKind {
        match self {
            Self::Bool(_) => KwargKind::Bool,
            Self::Int(_) => KwargKind::Int,
            Self::Float(_) => KwargKind::Float,
            Self::Text(_) => KwargKind::Text,
        }
    }

    fn value(&self) -> KwargValue {
        match *self {
            Self::Bool(b) => KwargValue::Bool(b),
            Self::Int(i) => KwargValue::Int(i),
            Self::Float(f) => KwargValue::Float(f),
            Self::Text(t) => KwargValue::Text(t.to_string()),
        }
    }
}

/// Declaration of one keyword argument.
#[derive(Debug, Clone, Copy)]
pub struct KwargSpec {
    pub name: &'static str,
    pub default: KwargDefault,
}

impl KwargSpec {
    pub const fn new(name: &'static str, default: KwargDefault) -> Self {
        Self { name, default }
    }
}

/// Resolved keyword arguments, ordered by name.
pub type Kwargs = BTreeMap<String, KwargValue>;

impl KwargValue {
    /// Coerce a user value to the declared kind. Integers are accepted where
    /// floats are declared and 0/1 where booleans are.
    fn coerce(self, kind: KwargKind) -> Option<KwargValue> {
        match (kind, self) {
            (KwargKind::Bool, v @ KwargValue::Bool(_)) => Some(v),
            (KwargKind::Bool, KwargValue::Int(i)) if i == 0 || i == 1 => Some(KwargValue::Bool(i == 1)),
            (KwargKind::Int, v @ KwargValue::Int(_)) => Some(v),
            (KwargKind::Int, KwargValue::Float(f)) if f.fract() == 0.0 => Some(KwargValue::Int(f as i64)),
            (KwargKind::Float, v @ KwargValue::Float(_)) => Some(v),
            (KwargKind::Float, KwargValue::Int(i)) => Some(KwargValue::Float(i as f64)),
            (KwargKind::Text, v @ KwargValue::Text(_)) => Some(v),
            (KwargKind::Text, KwargValue::Int(i)) => Some(KwargValue::Text(i.to_string())),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Canonical text form. Floats are rounded to 8 decimals with trailing
    /// zeros removed, booleans become 0/1.
    pub fn encode(&self) -> String {
        match self {
            Self::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => format_float(*f),
            Self::Text(s) => s.clone(),
        }
    }

    fn decode(text: &str, kind: KwargKind) -> Option<KwargValue> {
        match kind {
            KwargKind::Bool => match text {
                "1" | "true" | "True" => Some(Self::Bool(true)),
                "0" | "false" | "False" => Some(Self::Bool(false)),
                _ => None,
            },
            KwargKind::Int => text.parse().ok().map(Self::Int),
            KwargKind::Float => text.parse().ok().map(Self::Float),
            KwargKind::Text => Some(Self::Text(text.to_string())),
        }
    }
}

impl fmt::Display for KwargValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

pub fn format_float(value: f64) -> String {
    let mut s = format!("{:.8}", value);
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    if s == "-0" {
        s = "0".to_string();
    }
    s
}

/// Check user kwargs against the declared specs and fill in defaults.
pub fn resolve(group: &str, specs: &[KwargSpec], given: &Kwargs) -> Result<Kwargs> {
    for key in given.keys() {
        if !specs.iter().any(|s| s.name == key) {
            let known: Vec<_> = specs.iter().map(|s| s.name).collect();
            return Err(PipelineError::config(format!(
                "unknown keyword argument '{key}' for {group} (known: {known:?})"
            )));
        }
    }

    let mut resolved = Kwargs::new();
    for spec in specs {
        let kind = spec.default.kind();
        let value = match given.get(spec.name) {
            Some(v) => v.clone().coerce(kind).ok_or_else(|| {
                PipelineError::config(format!(
                    "keyword argument '{}' for {group} expects {kind:?}, got {v:?}",
                    spec.name
                ))
            })?,
            None => spec.default.value(),
        };
        // Floats compute with exactly the value the identifier records
        let value = match value {
            KwargValue::Float(f) if !f.is_finite() => {
                return Err(PipelineError::config(format!(
                    "keyword argument '{}' for {group} must be finite, got {f}",
                    spec.name
                )));
            }
            KwargValue::Float(f) => KwargValue::Float(format_float(f).parse().unwrap_or(f)),
            other => other,
        };
        if let KwargValue::Text(s) = &value {
            if s.contains(RESERVED) {
                return Err(PipelineError::config(format!(
                    "keyword argument '{}' for {group} contains one of {RESERVED:?}",
                    spec.name
                )));
            }
        }
        resolved.insert(spec.name.to_string(), value);
    }
    Ok(resolved)
}

/// Shortest prefix of `name` that no other declared name starts with.
pub fn abbreviation<'a>(name: &'a str, specs: &[KwargSpec]) -> &'a str {
    for end in 1..=name.len() {
        if !name.is_char_boundary(end) {
            continue;
        }
        let prefix = &name[..end];
        let clash = specs
            .iter()
            .any(|s| s.name != name && s.name.starts_with(prefix));
        if !clash {
            return prefix;
        }
    }
    name
}

/// Encode resolved kwargs as `k=v^k=v`, sorted by full name.
pub fn encode(kwargs: &Kwargs, specs: &[KwargSpec]) -> String {
    kwargs
        .iter()
        .map(|(name, value)| format!("{}={}", abbreviation(name, specs), value.encode()))
        .collect::<Vec<_>>()
        .join("^")
}

/// Decode an encoded kwargs fragment. Keys may be abbreviations or full names.
pub fn decode(group: &str, text: &str, specs: &[KwargSpec]) -> Result<Kwargs> {
    let mut given = Kwargs::new();
    for pair in text.split('^').filter(|p| !p.is_empty()) {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| PipelineError::config(format!("malformed keyword argument '{pair}' for {group}")))?;
        let spec = specs
            .iter()
            .find(|s| s.name == key || abbreviation(s.name, specs) == key)
            .ok_or_else(|| PipelineError::config(format!("unknown keyword argument '{key}' for {group}")))?;
        let value = KwargValue::decode(raw, spec.default.kind()).ok_or_else(|| {
            PipelineError::config(format!("cannot parse '{raw}' for keyword argument '{}' of {group}", spec.name))
        })?;
        given.insert(spec.name.to_string(), value);
    }
    resolve(group, specs, &given)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: &[KwargSpec] = &[
        KwargSpec::new("clear_border", KwargDefault::Bool(true)),
        KwargSpec::new("fill_holes", KwargDefault::Bool(true)),
        KwargSpec::new("closing_disk", KwargDefault::Int(2)),
    ];

    #[test]
    fn test_abbreviations_are_shortest_unique_prefix() {
        assert_eq!(abbreviation("clear_border", MASK), "cle");
        assert_eq!(abbreviation("closing_disk", MASK), "clo");
        assert_eq!(abbreviation("fill_holes", MASK), "f");
    }

    #[test]
    fn test_encode_sorted_with_defaults() {
        let resolved = resolve("mask", MASK, &Kwargs::new()).unwrap();
        assert_eq!(encode(&resolved, MASK), "cle=1^clo=2^f=1");
    }

    #[test]
    fn test_resolve_rejects_unknown_and_bad_types() {
        let mut given = Kwargs::new();
        given.insert("dilate".into(), KwargValue::Int(1));
        assert!(resolve("mask", MASK, &given).is_err());

        let mut given = Kwargs::new();
        given.insert("closing_disk".into(), KwargValue::Text("big".into()));
        assert!(resolve("mask", MASK, &given).is_err());
    }

    #[test]
    fn test_decode_accepts_abbreviations_and_full_names() {
        let a = decode("mask", "cle=0^clo=5^f=1", MASK).unwrap();
        let b = decode("mask", "closing_disk=5^clear_border=0", MASK).unwrap();
        assert_eq!(a, b);
        assert_eq!(a["closing_disk"], KwargValue::Int(5));
    }

    #[test]
    fn test_resolved_floats_are_rounded() {
        const DATA: &[KwargSpec] = &[KwargSpec::new("pixel_size", KwargDefault::Float(0.0))];
        let mut a = Kwargs::new();
        a.insert("pixel_size".into(), KwargValue::Float(0.2645));
        let mut b = Kwargs::new();
        b.insert("pixel_size".into(), KwargValue::Float(0.264500004));
        let a = resolve("data", DATA, &a).unwrap();
        let b = resolve("data", DATA, &b).unwrap();
        assert_eq!(a, b);
        assert_eq!(b["pixel_size"], KwargValue::Float(0.2645));

        let mut bad = Kwargs::new();
        bad.insert("pixel_size".into(), KwargValue::Float(f64::NAN));
        assert!(resolve("data", DATA, &bad).is_err());
    }

    #[test]
    fn test_float_normalization() {
        assert_eq!(format_float(0.2645), "0.2645");
        assert_eq!(format_float(1.0), "1");
        assert_eq!(format_float(0.123456789), "0.12345679");
        assert_eq!(format_float(-0.000000001), "0");
    }
}
