//! Output stores for event tables.
//!
//! A store receives columns in appended batches, free-form attributes, named
//! logs and basin records. [`DirectoryStore`] persists them in the layout of
//! [`super::layout`] so the result can be opened again as a
//! [`super::dataset::DirectoryDataset`]; [`MemoryStore`] keeps everything in
//! memory.

use super::basin::BasinRecord;
use super::layout::{self, ColumnMeta, StoreMeta, DATA_DIR, LOGS_DIR, META_FILE};
use crate::error::{PipelineError, Result};
use crate::events::FeatureColumn;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

pub trait OutputStore: Send + Sync {
    /// Append rows to column `name`, creating it with chunks of `chunk_rows`
    /// rows on first use.
    fn append(&mut self, name: &str, column: &FeatureColumn, chunk_rows: usize) -> Result<()>;

    fn set_attr(&mut self, key: &str, value: serde_json::Value) -> Result<()>;

    /// Store log lines under `name`, replacing an earlier log of that name.
    fn store_log(&mut self, name: &str, lines: &[String]) -> Result<()>;

    /// Record a basin, returning its key. Storing the same record twice is a no-op.
    fn store_basin(&mut self, basin: &BasinRecord) -> Result<String>;

    /// Number of rows stored in column `name`.
    fn column_len(&self, name: &str) -> usize;

    /// Persist buffered metadata.
    fn flush(&mut self) -> Result<()>;
}

/// Store writing to a directory.
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    meta: StoreMeta,
}

impl DirectoryStore {
    /// Create a store at `root`, replacing any data a previous run left there.
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if root.is_file() {
            return Err(PipelineError::config(format!("output path {} is a file", root.display())));
        }
        if root.join(META_FILE).exists() {
            info!("Replacing existing output at {}", root.display());
            std::fs::remove_file(root.join(META_FILE))?;
        }
        for dir in [DATA_DIR, LOGS_DIR] {
            let path = root.join(dir);
            if path.exists() {
                std::fs::remove_dir_all(&path)?;
            }
        }
        std::fs::create_dir_all(root.join(DATA_DIR))
            .map_err(|e| PipelineError::config(format!("cannot create output {}: {e}", root.display())))?;

        let store = Self {
            root,
            meta: StoreMeta::default(),
        };
        store
            .meta
            .save(&store.root)
            .map_err(|e| PipelineError::config(format!("output {} is not writable: {e}", store.root.display())))?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl OutputStore for DirectoryStore {
    fn append(&mut self, name: &str, column: &FeatureColumn, chunk_rows: usize) -> Result<()> {
        let meta = self.meta.columns.entry(name.to_string()).or_insert_with(|| ColumnMeta {
            dtype: column.dtype(),
            item_shape: column.item_shape().to_vec(),
            len: 0,
            chunk_rows: chunk_rows.max(1),
        });
        if meta.dtype != column.dtype() || meta.item_shape != column.item_shape() {
            return Err(PipelineError::integrity(
                "writer",
                None,
                format!(
                    "column '{name}' is {:?}{:?}, cannot append {:?}{:?}",
                    meta.dtype,
                    meta.item_shape,
                    column.dtype(),
                    column.item_shape()
                ),
            ));
        }

        let rows = meta.chunk_rows;
        let mut written = 0;
        while written < column.len() {
            let chunk = meta.len / rows;
            let filled = meta.len % rows;
            let take = (rows - filled).min(column.len() - written);
            let part = column.slice_rows(written, written + take);
            let data = if filled > 0 {
                // Complete the partial last chunk
                let mut existing = layout::read_chunk(&self.root, name, chunk, meta)?;
                existing.extend(&part)?;
                existing
            } else {
                part
            };
            layout::write_chunk(&self.root, name, chunk, &data)?;
            meta.len += take;
            written += take;
        }
        debug!(column = name, rows = column.len(), total = meta.len, "Appended");
        Ok(())
    }

    fn set_attr(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        self.meta.attrs.insert(key.to_string(), value);
        Ok(())
    }

    fn store_log(&mut self, name: &str, lines: &[String]) -> Result<()> {
        let dir = self.root.join(LOGS_DIR);
        std::fs::create_dir_all(&dir)?;
        let mut text = lines.join("\n");
        text.push('\n');
        std::fs::write(dir.join(format!("{name}.txt")), text)?;
        Ok(())
    }

    fn store_basin(&mut self, basin: &BasinRecord) -> Result<String> {
        let key = basin.key();
        if !self.meta.basins.iter().any(|b| b.key() == key) {
            self.meta.basins.push(basin.clone());
        }
        Ok(key)
    }

    fn column_len(&self, name: &str) -> usize {
        self.meta.columns.get(name).map(|c| c.len).unwrap_or(0)
    }

    fn flush(&mut self) -> Result<()> {
        self.meta.save(&self.root)
    }
}

#[derive(Debug, Default)]
struct MemoryContents {
    columns: BTreeMap<String, FeatureColumn>,
    attrs: BTreeMap<String, serde_json::Value>,
    logs: BTreeMap<String, Vec<String>>,
    basins: Vec<BasinRecord>,
    appends: usize,
    flushes: usize,
}

/// In-memory store. Clones share the same contents, so a handle kept by the
/// caller sees what the pipeline wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    contents: Arc<Mutex<MemoryContents>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryContents> {
        self.contents.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn column(&self, name: &str) -> Option<FeatureColumn> {
        self.lock().columns.get(name).cloned()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.lock().columns.keys().cloned().collect()
    }

    pub fn attr(&self, key: &str) -> Option<serde_json::Value> {
        self.lock().attrs.get(key).cloned()
    }

    pub fn log(&self, name: &str) -> Option<Vec<String>> {
        self.lock().logs.get(name).cloned()
    }

    pub fn basins(&self) -> Vec<BasinRecord> {
        self.lock().basins.clone()
    }

    /// Number of `append` calls so far.
    pub fn appends(&self) -> usize {
        self.lock().appends
    }

    pub fn flushes(&self) -> usize {
        self.lock().flushes
    }
}

impl OutputStore for MemoryStore {
    fn append(&mut self, name: &str, column: &FeatureColumn, _chunk_rows: usize) -> Result<()> {
        let mut contents = self.lock();
        contents.appends += 1;
        match contents.columns.get_mut(name) {
            Some(existing) => existing.extend(column),
            None => {
                contents.columns.insert(name.to_string(), column.clone());
                Ok(())
            }
        }
    }

    fn set_attr(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        self.lock().attrs.insert(key.to_string(), value);
        Ok(())
    }

    fn store_log(&mut self, name: &str, lines: &[String]) -> Result<()> {
        self.lock().logs.insert(name.to_string(), lines.to_vec());
        Ok(())
    }

    fn store_basin(&mut self, basin: &BasinRecord) -> Result<String> {
        let key = basin.key();
        let mut contents = self.lock();
        if !contents.basins.iter().any(|b| b.key() == key) {
            contents.basins.push(basin.clone());
        }
        Ok(key)
    }

    fn column_len(&self, name: &str) -> usize {
        self.lock().columns.get(name).map(|c| c.len()).unwrap_or(0)
    }

    fn flush(&mut self) -> Result<()> {
        self.lock().flushes += 1;
        Ok(())
    }
}
