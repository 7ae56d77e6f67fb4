//! Basins: references to data kept in another dataset.
//!
//! A file basin points at another dataset on disk by one or more candidate
//! paths (absolute and relative to the referencing dataset). An internal
//! basin refers to the referencing dataset itself. Either kind may carry a
//! mapping column whose rows are indices into the basin's rows, which is how
//! an event table references per-frame data.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const BASIN_FORMAT: &str = "cytostream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BasinType {
    File,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasinRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub format: String,
    #[serde(rename = "type")]
    pub kind: BasinType,
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    pub features: Vec<String>,
    /// Column of the referencing dataset that maps its rows to basin rows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<String>,
}

impl BasinRecord {
    /// File basin pointing at the dataset at `target`, seen from `from`.
    pub fn file(name: &str, description: &str, target: &Path, from: &Path, features: Vec<String>) -> Self {
        let absolute = std::path::absolute(target).unwrap_or_else(|_| target.to_path_buf());
        let mut paths = Vec::new();
        if let Some(relative) = relative_path(&absolute, &std::path::absolute(from).unwrap_or_else(|_| from.to_path_buf())) {
            paths.push(relative);
        }
        paths.push(absolute);
        Self {
            name: name.to_string(),
            description: description.to_string(),
            format: BASIN_FORMAT.to_string(),
            kind: BasinType::File,
            paths,
            features,
            mapping: None,
        }
    }

    pub fn with_mapping(mut self, mapping: &str) -> Self {
        self.mapping = Some(mapping.to_string());
        self
    }

    /// Content key: md5 of the record's canonical JSON.
    pub fn key(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or_default();
        format!("{:x}", md5::compute(value.to_string().as_bytes()))
    }

    /// First candidate path that exists. Absolute paths are tried as given,
    /// relative ones against the directory containing `dataset_root`.
    pub fn resolve(&self, dataset_root: &Path) -> Option<PathBuf> {
        let base = dataset_root.parent().unwrap_or_else(|| Path::new("."));
        self.paths.iter().find_map(|p| {
            let candidate = if p.is_absolute() { p.clone() } else { base.join(p) };
            candidate.exists().then_some(candidate)
        })
    }
}

/// Path of `target` relative to the directory containing `from`, when both
/// share a prefix.
fn relative_path(target: &Path, from: &Path) -> Option<PathBuf> {
    let base = from.parent()?;
    let common = target
        .components()
        .zip(base.components())
        .take_while(|(a, b)| a == b)
        .count();
    if common == 0 {
        return None;
    }
    let mut rel = PathBuf::new();
    for _ in base.components().skip(common) {
        rel.push("..");
    }
    for c in target.components().skip(common) {
        rel.push(c);
    }
    Some(rel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_and_absolute_paths() {
        let record = BasinRecord::file(
            "input",
            "raw frames",
            Path::new("/data/run1/input.cyto"),
            Path::new("/data/run1/out/result.cyto"),
            vec!["image".into()],
        );
        assert_eq!(record.paths[0], PathBuf::from("../input.cyto"));
        assert_eq!(record.paths[1], PathBuf::from("/data/run1/input.cyto"));
    }

    #[test]
    fn test_key_changes_with_content() {
        let a = BasinRecord::file("a", "", Path::new("/x/a"), Path::new("/x/b"), vec!["image".into()]);
        let b = a.clone().with_mapping("basinmap0");
        assert_eq!(a.key(), a.clone().key());
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key().len(), 32);
    }

    #[test]
    fn test_resolve_relative_to_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("input.cyto");
        std::fs::create_dir_all(&target).unwrap();
        let record = BasinRecord {
            name: "in".into(),
            description: String::new(),
            format: BASIN_FORMAT.into(),
            kind: BasinType::File,
            paths: vec![PathBuf::from("/does/not/exist"), PathBuf::from("input.cyto")],
            features: vec![],
            mapping: None,
        };
        assert_eq!(record.resolve(&dir.path().join("output.cyto")), Some(target));
    }
}
