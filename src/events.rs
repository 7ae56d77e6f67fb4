//! Events and the columnar buffers they are written through.

use crate::error::{PipelineError, Result};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Value of a single feature for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeatureValue {
    Scalar(f64),
    /// Fixed-length small vector (same length for every event)
    Vector(Vec<f64>),
    /// Binary mask stored as 0/255
    Mask(Array2<u8>),
    Index(u64),
}

impl FeatureValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Index(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// One segmented object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Frame index in the processed view
    pub frame_index: usize,
    /// Label in the frame's mask (1-based)
    pub label: u16,
    pub features: BTreeMap<String, FeatureValue>,
}

/// All events of one frame, in label order. Frames without objects have an
/// empty `events` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameEvents {
    pub frame_index: usize,
    /// Flicker offset subtracted from this frame, if offset correction ran
    pub bg_off: Option<f64>,
    pub events: Vec<Event>,
}

impl FrameEvents {
    pub fn empty(frame_index: usize) -> Self {
        Self {
            frame_index,
            bg_off: None,
            events: Vec::new(),
        }
    }
}

/// Element type of a stored column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Float64,
    UInt8,
    UInt64,
}

impl Dtype {
    pub fn size(&self) -> usize {
        match self {
            Dtype::Float64 | Dtype::UInt64 => 8,
            Dtype::UInt8 => 1,
        }
    }
}

/// A typed column of rows, each row holding `item_shape` elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeatureColumn {
    Float64 { item_shape: Vec<usize>, values: Vec<f64> },
    UInt8 { item_shape: Vec<usize>, values: Vec<u8> },
    UInt64 { item_shape: Vec<usize>, values: Vec<u64> },
}

impl FeatureColumn {
    pub fn empty(dtype: Dtype, item_shape: Vec<usize>) -> Self {
        match dtype {
            Dtype::Float64 => Self::Float64 { item_shape, values: Vec::new() },
            Dtype::UInt8 => Self::UInt8 { item_shape, values: Vec::new() },
            Dtype::UInt64 => Self::UInt64 { item_shape, values: Vec::new() },
        }
    }

    /// Create an empty column able to hold `value`.
    pub fn for_value(value: &FeatureValue) -> Self {
        match value {
            FeatureValue::Scalar(_) => Self::empty(Dtype::Float64, Vec::new()),
            FeatureValue::Vector(v) => Self::empty(Dtype::Float64, vec![v.len()]),
            FeatureValue::Mask(m) => Self::empty(Dtype::UInt8, m.shape().to_vec()),
            FeatureValue::Index(_) => Self::empty(Dtype::UInt64, Vec::new()),
        }
    }

    pub fn from_images(images: &Array3<u8>) -> Self {
        let (_, h, w) = images.dim();
        Self::UInt8 {
            item_shape: vec![h, w],
            values: images.iter().copied().collect(),
        }
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            Self::Float64 { .. } => Dtype::Float64,
            Self::UInt8 { .. } => Dtype::UInt8,
            Self::UInt64 { .. } => Dtype::UInt64,
        }
    }

    pub fn item_shape(&self) -> &[usize] {
        match self {
            Self::Float64 { item_shape, .. }
            | Self::UInt8 { item_shape, .. }
            | Self::UInt64 { item_shape, .. } => item_shape,
        }
    }

    /// Number of elements in one row.
    pub fn item_len(&self) -> usize {
        self.item_shape().iter().product()
    }

    fn element_count(&self) -> usize {
        match self {
            Self::Float64 { values, .. } => values.len(),
            Self::UInt8 { values, .. } => values.len(),
            Self::UInt64 { values, .. } => values.len(),
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        match self.item_len() {
            0 => 0,
            n => self.element_count() / n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype().size()
    }

    /// Bytes occupied by a single row.
    pub fn row_bytes(&self) -> usize {
        self.item_len().max(1) * self.dtype().size()
    }

    /// Append one event's value. The value must match the column type and
    /// item shape.
    pub fn push(&mut self, value: &FeatureValue) -> Result<()> {
        match (self, value) {
            (Self::Float64 { item_shape, values }, FeatureValue::Scalar(v)) if item_shape.is_empty() => {
                values.push(*v);
            }
            (Self::Float64 { item_shape, values }, FeatureValue::Vector(v))
                if item_shape.as_slice() == [v.len()] =>
            {
                values.extend_from_slice(v);
            }
            (Self::UInt8 { item_shape, values }, FeatureValue::Mask(m)) if item_shape.as_slice() == m.shape() => {
                values.extend(m.iter().copied());
            }
            (Self::UInt64 { item_shape, values }, FeatureValue::Index(v)) if item_shape.is_empty() => {
                values.push(*v);
            }
            (column, value) => {
                return Err(PipelineError::integrity(
                    "writer",
                    None,
                    format!(
                        "value {:?} does not fit column of {:?} {:?}",
                        value_kind(value),
                        column.dtype(),
                        column.item_shape()
                    ),
                ))
            }
        }
        Ok(())
    }

    /// Append all rows of `other`.
    pub fn extend(&mut self, other: &FeatureColumn) -> Result<()> {
        if self.dtype() != other.dtype() || self.item_shape() != other.item_shape() {
            return Err(PipelineError::integrity(
                "store",
                None,
                format!(
                    "cannot append {:?} {:?} to {:?} {:?}",
                    other.dtype(),
                    other.item_shape(),
                    self.dtype(),
                    self.item_shape()
                ),
            ));
        }
        match (self, other) {
            (Self::Float64 { values, .. }, Self::Float64 { values: o, .. }) => values.extend_from_slice(o),
            (Self::UInt8 { values, .. }, Self::UInt8 { values: o, .. }) => values.extend_from_slice(o),
            (Self::UInt64 { values, .. }, Self::UInt64 { values: o, .. }) => values.extend_from_slice(o),
            _ => unreachable!("dtype checked above"),
        }
        Ok(())
    }

    /// Copy of rows `[start, stop)`.
    pub fn slice_rows(&self, start: usize, stop: usize) -> FeatureColumn {
        let n = self.item_len().max(1);
        let stop = stop.min(self.len());
        let start = start.min(stop);
        let (a, b) = (start * n, stop * n);
        match self {
            Self::Float64 { item_shape, values } => Self::Float64 { item_shape: item_shape.clone(), values: values[a..b].to_vec() },
            Self::UInt8 { item_shape, values } => Self::UInt8 { item_shape: item_shape.clone(), values: values[a..b].to_vec() },
            Self::UInt64 { item_shape, values } => Self::UInt64 { item_shape: item_shape.clone(), values: values[a..b].to_vec() },
        }
    }

    /// Remove and return the first `rows` rows.
    pub fn drain_front(&mut self, rows: usize) -> FeatureColumn {
        let head = self.slice_rows(0, rows);
        let n = head.len() * self.item_len().max(1);
        match self {
            Self::Float64 { values, .. } => drop(values.drain(..n)),
            Self::UInt8 { values, .. } => drop(values.drain(..n)),
            Self::UInt64 { values, .. } => drop(values.drain(..n)),
        }
        head
    }

    /// Value of row `row` as an event feature.
    pub fn value_at(&self, row: usize) -> Option<FeatureValue> {
        if row >= self.len() {
            return None;
        }
        let n = self.item_len();
        match self {
            Self::Float64 { item_shape, values } if item_shape.is_empty() => Some(FeatureValue::Scalar(values[row])),
            Self::Float64 { values, .. } => Some(FeatureValue::Vector(values[row * n..(row + 1) * n].to_vec())),
            Self::UInt64 { item_shape, values } if item_shape.is_empty() => Some(FeatureValue::Index(values[row])),
            Self::UInt64 { values, .. } => Some(FeatureValue::Vector(
                values[row * n..(row + 1) * n].iter().map(|&v| v as f64).collect(),
            )),
            Self::UInt8 { item_shape, values } if item_shape.len() == 2 => {
                Array2::from_shape_vec((item_shape[0], item_shape[1]), values[row * n..(row + 1) * n].to_vec())
                    .ok()
                    .map(FeatureValue::Mask)
            }
            Self::UInt8 { item_shape, values } if item_shape.is_empty() => Some(FeatureValue::Scalar(values[row] as f64)),
            Self::UInt8 { values, .. } => Some(FeatureValue::Vector(
                values[row * n..(row + 1) * n].iter().map(|&v| v as f64).collect(),
            )),
        }
    }

    /// View a column of 2-D uint8 rows as an image stack.
    pub fn into_images(self) -> Result<Array3<u8>> {
        match self {
            Self::UInt8 { item_shape, values } if item_shape.len() == 2 => {
                let rows = if item_shape[0] * item_shape[1] == 0 { 0 } else { values.len() / (item_shape[0] * item_shape[1]) };
                Array3::from_shape_vec((rows, item_shape[0], item_shape[1]), values)
                    .map_err(|e| PipelineError::integrity("dataset", None, e.to_string()))
            }
            other => Err(PipelineError::integrity(
                "dataset",
                None,
                format!("expected 2-D uint8 image rows, found {:?} {:?}", other.dtype(), other.item_shape()),
            )),
        }
    }

    /// Little-endian bytes of all elements.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Self::Float64 { values, .. } => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Self::UInt8 { values, .. } => values.clone(),
            Self::UInt64 { values, .. } => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    pub fn from_le_bytes(dtype: Dtype, item_shape: Vec<usize>, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % dtype.size() != 0 {
            return Err(PipelineError::integrity(
                "store",
                None,
                format!("{} bytes is not a multiple of {:?}", bytes.len(), dtype),
            ));
        }
        Ok(match dtype {
            Dtype::Float64 => Self::Float64 {
                item_shape,
                values: bytes
                    .chunks_exact(8)
                    .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                    .collect(),
            },
            Dtype::UInt8 => Self::UInt8 { item_shape, values: bytes.to_vec() },
            Dtype::UInt64 => Self::UInt64 {
                item_shape,
                values: bytes
                    .chunks_exact(8)
                    .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                    .collect(),
            },
        })
    }
}

fn value_kind(value: &FeatureValue) -> &'static str {
    match value {
        FeatureValue::Scalar(_) => "scalar",
        FeatureValue::Vector(_) => "vector",
        FeatureValue::Mask(_) => "mask",
        FeatureValue::Index(_) => "index",
    }
}
