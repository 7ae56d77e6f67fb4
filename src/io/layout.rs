//! On-disk layout shared by the output store and the input reader.
//!
//! ```text
//! <root>/meta.json                  attributes, column metadata, basins
//! <root>/data/<feature>/<k>.zst     zstd-compressed little-endian rows of chunk k
//! <root>/logs/<name>.txt            free-form logs
//! ```
//!
//! Every chunk file of a column holds `chunk_rows` rows except the last.

use super::basin::BasinRecord;
use crate::error::{PipelineError, Result};
use crate::events::{Dtype, FeatureColumn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const META_FILE: &str = "meta.json";
pub const DATA_DIR: &str = "data";
pub const LOGS_DIR: &str = "logs";

/// zstd level for chunk files.
pub const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub dtype: Dtype,
    pub item_shape: Vec<usize>,
    pub len: usize,
    pub chunk_rows: usize,
}

impl ColumnMeta {
    pub fn chunk_count(&self) -> usize {
        self.len.div_ceil(self.chunk_rows.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreMeta {
    #[serde(default)]
    pub attrs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnMeta>,
    #[serde(default)]
    pub basins: Vec<BasinRecord>,
}

impl StoreMeta {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(META_FILE);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            PipelineError::integrity("dataset", None, format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let tmp = root.join(format!("{META_FILE}.tmp"));
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, root.join(META_FILE))?;
        Ok(())
    }
}

/// Column names become directory names, so path separators are escaped.
pub fn column_dir(root: &Path, name: &str) -> PathBuf {
    root.join(DATA_DIR).join(name.replace(['/', '\\'], "%2F"))
}

pub fn chunk_path(root: &Path, name: &str, chunk: usize) -> PathBuf {
    column_dir(root, name).join(format!("{chunk}.zst"))
}

pub fn write_chunk(root: &Path, name: &str, chunk: usize, column: &FeatureColumn) -> Result<()> {
    let dir = column_dir(root, name);
    std::fs::create_dir_all(&dir)?;
    let compressed = zstd::encode_all(column.to_le_bytes().as_slice(), COMPRESSION_LEVEL)?;
    std::fs::write(chunk_path(root, name, chunk), compressed)?;
    Ok(())
}

pub fn read_chunk(root: &Path, name: &str, chunk: usize, meta: &ColumnMeta) -> Result<FeatureColumn> {
    let path = chunk_path(root, name, chunk);
    let compressed = std::fs::read(&path).map_err(|e| {
        PipelineError::integrity("dataset", Some(chunk), format!("cannot read {}: {e}", path.display()))
    })?;
    let bytes = zstd::decode_all(compressed.as_slice())
        .map_err(|e| PipelineError::integrity("dataset", Some(chunk), format!("corrupt chunk {}: {e}", path.display())))?;
    FeatureColumn::from_le_bytes(meta.dtype, meta.item_shape.clone(), &bytes)
}

/// Read rows `[start, stop)` of a column, touching only the chunks involved.
pub fn read_rows(root: &Path, name: &str, meta: &ColumnMeta, start: usize, stop: usize) -> Result<FeatureColumn> {
    let mut out = FeatureColumn::empty(meta.dtype, meta.item_shape.clone());
    if start >= stop {
        return Ok(out);
    }
    let rows = meta.chunk_rows.max(1);
    for chunk in start / rows..stop.div_ceil(rows) {
        let data = read_chunk(root, name, chunk, meta)?;
        let base = chunk * rows;
        let lo = start.max(base) - base;
        let hi = stop.min(base + data.len()) - base;
        out.extend(&data.slice_rows(lo, hi))?;
    }
    if out.len() != stop - start {
        return Err(PipelineError::integrity(
            "dataset",
            None,
            format!("column '{name}' returned {} rows for [{start}, {stop})", out.len()),
        ));
    }
    Ok(out)
}
