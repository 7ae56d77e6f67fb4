//! Event writer: turns released chunks into appended feature columns.
//!
//! Each feature has its own append buffer. A buffer is handed to the store
//! once it holds a full storage chunk, whose row count is derived from the
//! flush size and the feature's row width, so large features like masks are
//! written in fewer rows per chunk than scalars.

use super::dataset::FrameSource;
use super::store::OutputStore;
use crate::error::{PipelineError, Result};
use crate::events::{FeatureColumn, FeatureValue};
use crate::pipeline::backpressure::BackpressureGate;
use crate::pipeline::control::task_failed;
use crate::pipeline::worker::ExtractedChunk;
use crate::pipeline::Metrics;
use crate::stages::features::PROTECTED_FEATURES;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

/// Minimum rows per stored chunk.
const MIN_CHUNK_ROWS: usize = 10;

/// Frame index of the event in the processed view.
pub const INDEX_UNMAPPED: &str = "index_unmapped";
/// Frame index of the event in the input dataset on disk.
pub const BASIN_MAPPING: &str = "basinmap0";
pub const NEVENTS: &str = "nevents";
pub const BG_OFF: &str = "bg_off";

pub struct EventWriter {
    store: Box<dyn OutputStore>,
    source: Arc<dyn FrameSource>,
    protected: Vec<String>,
    flush_bytes: usize,
    buffers: BTreeMap<String, FeatureColumn>,
    chunk_rows: BTreeMap<String, usize>,
    events_written: u64,
    frames_written: usize,
}

impl std::fmt::Debug for EventWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWriter")
            .field("protected", &self.protected)
            .field("flush_bytes", &self.flush_bytes)
            .field("events_written", &self.events_written)
            .field("frames_written", &self.frames_written)
            .finish()
    }
}

impl EventWriter {
    pub fn new(store: Box<dyn OutputStore>, source: Arc<dyn FrameSource>, flush_bytes: usize) -> Self {
        let protected = PROTECTED_FEATURES
            .iter()
            .filter(|name| source.has_feature(name))
            .map(|name| name.to_string())
            .collect();
        Self {
            store,
            source,
            protected,
            flush_bytes: flush_bytes.max(1),
            buffers: BTreeMap::new(),
            chunk_rows: BTreeMap::new(),
            events_written: 0,
            frames_written: 0,
        }
    }

    pub fn events_written(&self) -> u64 {
        self.events_written
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    /// Names of every column written so far.
    pub fn column_names(&self) -> Vec<String> {
        self.buffers.keys().cloned().collect()
    }

    /// Write the events of one chunk, returning how many were written.
    /// Chunks must arrive in frame order.
    pub fn write_chunk(&mut self, chunk: &ExtractedChunk) -> Result<u64> {
        if chunk.start != self.frames_written {
            return Err(PipelineError::integrity(
                "writer",
                Some(chunk.chunk_index),
                format!("chunk starts at frame {}, expected {}", chunk.start, self.frames_written),
            ));
        }
        let stop = chunk.start + chunk.frames.len();
        let inputs = self
            .protected
            .iter()
            .map(|name| Ok((name.clone(), self.source.read_rows(name, chunk.start, stop)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut written = 0;
        for frame in &chunk.frames {
            let row = frame.frame_index - chunk.start;
            let nevents = frame.events.len() as u64;
            let original = self.source.original_index(frame.frame_index) as u64;
            for event in &frame.events {
                for (name, value) in &event.features {
                    self.push(name, value)?;
                }
                self.push(INDEX_UNMAPPED, &FeatureValue::Index(frame.frame_index as u64))?;
                self.push(BASIN_MAPPING, &FeatureValue::Index(original))?;
                self.push(NEVENTS, &FeatureValue::Index(nevents))?;
                if let Some(offset) = frame.bg_off {
                    self.push(BG_OFF, &FeatureValue::Scalar(offset))?;
                }
                for (name, column) in &inputs {
                    let value = column.value_at(row).ok_or_else(|| {
                        PipelineError::integrity(
                            "writer",
                            Some(chunk.chunk_index),
                            format!("input column '{name}' has no value for frame {}", frame.frame_index),
                        )
                    })?;
                    self.push(name, &value)?;
                }
                written += 1;
            }
        }

        self.frames_written = stop;
        self.events_written += written;
        self.flush_full()?;
        Ok(written)
    }

    fn push(&mut self, name: &str, value: &FeatureValue) -> Result<()> {
        if !self.buffers.contains_key(name) {
            let column = FeatureColumn::for_value(value);
            let rows = (self.flush_bytes / column.row_bytes().max(1)).max(MIN_CHUNK_ROWS);
            self.chunk_rows.insert(name.to_string(), rows);
            self.buffers.insert(name.to_string(), column);
        }
        match self.buffers.get_mut(name) {
            Some(buffer) => buffer.push(value),
            None => Ok(()),
        }
    }

    /// Hand every full storage chunk to the store.
    fn flush_full(&mut self) -> Result<()> {
        for (name, buffer) in self.buffers.iter_mut() {
            let rows = self.chunk_rows.get(name).copied().unwrap_or(MIN_CHUNK_ROWS);
            let full = buffer.len() / rows * rows;
            if full > 0 {
                let part = buffer.drain_front(full);
                self.store.append(name, &part, rows)?;
            }
        }
        Ok(())
    }

    /// Write what is left in the buffers.
    pub fn flush(&mut self) -> Result<()> {
        for (name, buffer) in self.buffers.iter_mut() {
            if !buffer.is_empty() {
                let rows = self.chunk_rows.get(name).copied().unwrap_or(MIN_CHUNK_ROWS);
                let part = buffer.drain_front(buffer.len());
                self.store.append(name, &part, rows)?;
            }
        }
        debug!(events = self.events_written, "Flushed write buffers");
        Ok(())
    }

    pub fn store_mut(&mut self) -> &mut dyn OutputStore {
        self.store.as_mut()
    }

    /// Flush remaining rows and return the store.
    pub fn finish(mut self) -> Result<Box<dyn OutputStore>> {
        self.flush()?;
        Ok(self.store)
    }
}

/// Write released chunks until the collector closes the channel.
pub async fn run_writer(
    writer: Arc<Mutex<EventWriter>>,
    mut release: mpsc::UnboundedReceiver<ExtractedChunk>,
    gate: Arc<BackpressureGate>,
    metrics: Arc<Metrics>,
) -> Result<u64> {
    let mut total = 0;
    while let Some(chunk) = release.recv().await {
        let started = Instant::now();
        let frames = chunk.frames.len() as u64;
        let w = writer.clone();
        let events = tokio::task::spawn_blocking(move || {
            let mut writer = w.lock().unwrap_or_else(|p| p.into_inner());
            writer.write_chunk(&chunk)
        })
        .await
        .map_err(|e| task_failed("writer", e))??;

        gate.written();
        metrics.add_write_time(started.elapsed());
        metrics.add_chunk_written(frames, events);
        total += events;
    }
    Ok(total)
}
