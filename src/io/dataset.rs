//! Input datasets.
//!
//! A [`FrameSource`] is a random-access table of per-frame columns (images
//! and scalar features) with string attributes. Columns a dataset does not
//! hold itself may be supplied by basins.

use super::basin::{BasinRecord, BasinType, BASIN_FORMAT};
use super::layout::{self, ColumnMeta, StoreMeta};
use crate::error::{PipelineError, Result};
use crate::events::FeatureColumn;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Attribute that defines the number of frames of a dataset.
pub const EVENT_COUNT_ATTR: &str = "experiment:event count";
pub const PIXEL_SIZE_ATTR: &str = "imaging:pixel size";
pub const FRAME_RATE_ATTR: &str = "imaging:frame rate";

/// Nested basins deeper than this are ignored.
const MAX_BASIN_DEPTH: usize = 3;

pub type Attributes = BTreeMap<String, String>;

pub trait FrameSource: Send + Sync + fmt::Debug {
    /// Number of frames.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn attrs(&self) -> &Attributes;

    /// Columns available locally or through basins.
    fn features(&self) -> Vec<String>;

    fn has_feature(&self, name: &str) -> bool {
        self.features().iter().any(|f| f == name)
    }

    /// Rows per backing chunk of a column, `None` when the column is not
    /// chunked (or not chunk-aligned with this view).
    fn chunk_rows(&self, name: &str) -> Option<usize>;

    /// Rows `[start, stop)` of a column.
    fn read_rows(&self, name: &str, start: usize, stop: usize) -> Result<FeatureColumn>;

    /// Arbitrary rows of a column, in the given order.
    fn read_indices(&self, name: &str, indices: &[usize]) -> Result<FeatureColumn> {
        let mut out = self.read_rows(name, 0, 0)?;
        let mut i = 0;
        while i < indices.len() {
            // Read consecutive runs in one go
            let mut j = i + 1;
            while j < indices.len() && indices[j] == indices[j - 1] + 1 {
                j += 1;
            }
            out.extend(&self.read_rows(name, indices[i], indices[j - 1] + 1)?)?;
            i = j;
        }
        Ok(out)
    }

    /// Frame index in the underlying dataset for a frame of this view.
    fn original_index(&self, index: usize) -> usize {
        index
    }

    /// Location on disk, if any.
    fn location(&self) -> Option<&Path> {
        None
    }
}

fn check_range(start: usize, stop: usize, len: usize) -> Result<()> {
    if start > stop || stop > len {
        return Err(PipelineError::Bounds {
            index: stop.max(start) as i64,
            len,
        });
    }
    Ok(())
}

/// Local column holding the rows of an internal basin's feature.
pub fn internal_basin_column(basin: &str, feature: &str) -> String {
    format!("basin_{basin}/{feature}")
}

/// Normalize raw attribute values to text. Byte strings are stored as
/// `{"bytes": [..]}` and decoded as UTF-8.
pub fn normalize_attrs(raw: &BTreeMap<String, serde_json::Value>) -> Attributes {
    raw.iter()
        .map(|(k, v)| {
            let text = match v {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Object(map) => match map.get("bytes").and_then(|b| b.as_array()) {
                    Some(bytes) => {
                        let bytes: Vec<u8> = bytes.iter().filter_map(|b| b.as_u64()).map(|b| b as u8).collect();
                        String::from_utf8_lossy(&bytes).into_owned()
                    }
                    None => v.to_string(),
                },
                other => other.to_string(),
            };
            (k.clone(), text)
        })
        .collect()
}

/// In-memory dataset.
#[derive(Debug, Clone, Default)]
pub struct MemoryDataset {
    columns: BTreeMap<String, FeatureColumn>,
    attrs: Attributes,
    chunk_rows: Option<usize>,
    len: usize,
}

impl MemoryDataset {
    pub fn new(images: &ndarray::Array3<u8>) -> Self {
        let mut ds = Self::default();
        ds.len = images.dim().0;
        ds.columns.insert("image".to_string(), FeatureColumn::from_images(images));
        ds
    }

    pub fn with_column(mut self, name: &str, column: FeatureColumn) -> Self {
        self.columns.insert(name.to_string(), column);
        self
    }

    pub fn with_attr(mut self, key: &str, value: &str) -> Self {
        self.attrs.insert(key.to_string(), value.to_string());
        self
    }

    /// Pretend the columns are stored in chunks of `rows`.
    pub fn with_chunk_rows(mut self, rows: usize) -> Self {
        self.chunk_rows = Some(rows);
        self
    }
}

impl FrameSource for MemoryDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    fn features(&self) -> Vec<String> {
        self.columns.keys().cloned().collect()
    }

    fn chunk_rows(&self, _name: &str) -> Option<usize> {
        self.chunk_rows
    }

    fn read_rows(&self, name: &str, start: usize, stop: usize) -> Result<FeatureColumn> {
        let column = self
            .columns
            .get(name)
            .ok_or_else(|| PipelineError::integrity("dataset", None, format!("no column '{name}'")))?;
        check_range(start, stop, column.len())?;
        Ok(column.slice_rows(start, stop))
    }
}

struct OpenBasin {
    record: BasinRecord,
    /// `None` for internal basins, which read from the owning dataset
    dataset: Option<Arc<DirectoryDataset>>,
}

/// Dataset stored in the directory layout written by
/// [`DirectoryStore`](super::store::DirectoryStore).
pub struct DirectoryDataset {
    root: PathBuf,
    meta: StoreMeta,
    attrs: Attributes,
    len: usize,
    basins: Vec<OpenBasin>,
}

impl fmt::Debug for DirectoryDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryDataset")
            .field("root", &self.root)
            .field("len", &self.len)
            .field("columns", &self.meta.columns.keys().collect::<Vec<_>>())
            .field("basins", &self.basins.len())
            .finish()
    }
}

impl DirectoryDataset {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::open_nested(root.as_ref(), 0)
    }

    fn open_nested(root: &Path, depth: usize) -> Result<Self> {
        let meta = StoreMeta::load(root)?;
        let attrs = normalize_attrs(&meta.attrs);

        let mut basins = Vec::new();
        for record in &meta.basins {
            if record.format != BASIN_FORMAT {
                return Err(PipelineError::integrity(
                    "dataset",
                    None,
                    format!("basin '{}' has unsupported format '{}'", record.name, record.format),
                ));
            }
            match record.kind {
                BasinType::Internal => {
                    if record.mapping.is_none() {
                        return Err(PipelineError::integrity(
                            "dataset",
                            None,
                            format!("internal basin '{}' has no mapping", record.name),
                        ));
                    }
                    basins.push(OpenBasin { record: record.clone(), dataset: None });
                }
                BasinType::File if depth >= MAX_BASIN_DEPTH => {
                    tracing::warn!("Ignoring basin '{}': nested too deep", record.name);
                }
                BasinType::File => match record.resolve(root) {
                    Some(path) => {
                        let nested = Self::open_nested(&path, depth + 1)?;
                        basins.push(OpenBasin { record: record.clone(), dataset: Some(Arc::new(nested)) });
                    }
                    None => tracing::warn!("Basin '{}' is not available at {:?}", record.name, record.paths),
                },
            }
        }

        let mut ds = Self {
            root: root.to_path_buf(),
            meta,
            attrs,
            len: 0,
            basins,
        };
        ds.len = match ds.attrs.get(EVENT_COUNT_ATTR) {
            Some(count) => count.trim().parse().map_err(|_| {
                PipelineError::integrity("dataset", None, format!("'{EVENT_COUNT_ATTR}' is not an integer: '{count}'"))
            })?,
            None => ds.meta.columns.get("image").map(|c| c.len).unwrap_or(0),
        };
        Ok(ds)
    }

    fn local(&self, name: &str) -> Option<&ColumnMeta> {
        self.meta.columns.get(name)
    }

    fn basin_for(&self, name: &str) -> Option<&OpenBasin> {
        self.basins.iter().find(|b| b.record.features.iter().any(|f| f == name))
    }

    fn mapped_indices(&self, mapping: &str, start: usize, stop: usize) -> Result<Vec<usize>> {
        let meta = self.local(mapping).ok_or_else(|| {
            PipelineError::integrity("dataset", None, format!("basin mapping column '{mapping}' is missing"))
        })?;
        match layout::read_rows(&self.root, mapping, meta, start, stop)? {
            FeatureColumn::UInt64 { values, .. } => Ok(values.into_iter().map(|v| v as usize).collect()),
            other => Err(PipelineError::integrity(
                "dataset",
                None,
                format!("basin mapping column '{mapping}' has type {:?}", other.dtype()),
            )),
        }
    }
}

impl FrameSource for DirectoryDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    fn features(&self) -> Vec<String> {
        let mut names: Vec<String> = self.meta.columns.keys().cloned().collect();
        for basin in &self.basins {
            if basin.dataset.is_some() || basin.record.kind == BasinType::Internal {
                names.extend(basin.record.features.iter().cloned());
            }
        }
        names.sort();
        names.dedup();
        names
    }

    fn chunk_rows(&self, name: &str) -> Option<usize> {
        match self.local(name) {
            Some(meta) => Some(meta.chunk_rows),
            None => match self.basin_for(name) {
                Some(OpenBasin { record, dataset: Some(ds) }) if record.mapping.is_none() => ds.chunk_rows(name),
                _ => None,
            },
        }
    }

    fn read_rows(&self, name: &str, start: usize, stop: usize) -> Result<FeatureColumn> {
        if let Some(meta) = self.local(name) {
            check_range(start, stop, meta.len)?;
            return layout::read_rows(&self.root, name, meta, start, stop);
        }
        let basin = self.basin_for(name).ok_or_else(|| {
            PipelineError::integrity("dataset", None, format!("no column '{name}' in {}", self.root.display()))
        })?;
        match (&basin.record.mapping, &basin.dataset) {
            (None, Some(ds)) => ds.read_rows(name, start, stop),
            (Some(mapping), Some(ds)) => ds.read_indices(name, &self.mapped_indices(mapping, start, stop)?),
            (Some(mapping), None) => {
                let indices = self.mapped_indices(mapping, start, stop)?;
                let column = internal_basin_column(&basin.record.name, name);
                let meta = self.local(&column).ok_or_else(|| {
                    PipelineError::integrity("dataset", None, format!("internal basin column '{column}' is missing"))
                })?;
                let mut out = FeatureColumn::empty(meta.dtype, meta.item_shape.clone());
                for i in indices {
                    check_range(i, i + 1, meta.len)?;
                    out.extend(&layout::read_rows(&self.root, &column, meta, i, i + 1)?)?;
                }
                Ok(out)
            }
            (None, None) => Err(PipelineError::integrity(
                "dataset",
                None,
                format!("basin '{}' cannot serve '{name}'", basin.record.name),
            )),
        }
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.root)
    }
}

/// A subset or reordering of another source's frames.
#[derive(Debug)]
pub struct MappedSource {
    inner: Arc<dyn FrameSource>,
    indices: Vec<usize>,
    attrs: Attributes,
}

impl MappedSource {
    pub fn new(inner: Arc<dyn FrameSource>, indices: Vec<usize>) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= inner.len()) {
            return Err(PipelineError::Bounds { index: bad as i64, len: inner.len() });
        }
        let mut attrs = inner.attrs().clone();
        attrs.insert(EVENT_COUNT_ATTR.to_string(), indices.len().to_string());
        Ok(Self { inner, indices, attrs })
    }
}

impl FrameSource for MappedSource {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    fn features(&self) -> Vec<String> {
        self.inner.features()
    }

    fn chunk_rows(&self, _name: &str) -> Option<usize> {
        None
    }

    fn read_rows(&self, name: &str, start: usize, stop: usize) -> Result<FeatureColumn> {
        check_range(start, stop, self.indices.len())?;
        self.inner.read_indices(name, &self.indices[start..stop])
    }

    fn original_index(&self, index: usize) -> usize {
        self.indices
            .get(index)
            .map(|&i| self.inner.original_index(i))
            .unwrap_or(index)
    }

    fn location(&self) -> Option<&Path> {
        self.inner.location()
    }
}

/// Parse the text of an index mapping into `(start, stop, step)`, `None`
/// for the identity.
fn parse_index_range(text: &str) -> Result<Option<(usize, usize, usize)>> {
    let invalid = || PipelineError::config(format!("invalid index mapping '{text}'"));
    let nums: Vec<usize> = text
        .split(',')
        .map(|p| p.trim().parse::<usize>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| invalid())?;
    let (start, stop, step) = match nums.as_slice() {
        [0] => return Ok(None),
        [n] => (0, *n, 1),
        [a, b] => (*a, *b, 1),
        [a, b, c] => (*a, *b, *c),
        _ => return Err(invalid()),
    };
    if step == 0 || start > stop {
        return Err(invalid());
    }
    Ok(Some((start, stop, step)))
}

/// Parse an index mapping: `0` (identity), `n` (first n frames) or
/// `start,stop[,step]`. Returns `None` for the identity.
pub fn parse_index_mapping(text: &str, len: usize) -> Result<Option<Vec<usize>>> {
    let Some((start, stop, step)) = parse_index_range(text)? else {
        return Ok(None);
    };
    if stop > len {
        return Err(PipelineError::Bounds { index: stop as i64, len });
    }
    Ok(Some((start..stop).step_by(step).collect()))
}

/// Canonical text of an index mapping: `0` for the identity, otherwise
/// `start,stop,step`. Spellings selecting the same frames agree.
pub fn canonical_index_mapping(text: &str) -> Result<String> {
    Ok(match parse_index_range(text)? {
        None => "0".to_string(),
        Some((start, stop, step)) => format!("{start},{stop},{step}"),
    })
}
