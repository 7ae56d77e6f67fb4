//! Writer round trips through a directory store.

use super::basin::BasinRecord;
use super::dataset::{Attributes, DirectoryDataset, FrameSource, MappedSource, EVENT_COUNT_ATTR};
use super::store::{DirectoryStore, MemoryStore, OutputStore};
use super::writer::{EventWriter, BASIN_MAPPING, INDEX_UNMAPPED, NEVENTS};
use crate::error::PipelineError;
use crate::events::{Event, FeatureColumn, FeatureValue, FrameEvents};
use crate::pipeline::worker::ExtractedChunk;
use ndarray::{Array2, Array3};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Input dataset with frames whose first pixel is the frame index.
fn write_input(root: &Path, frames: usize) {
    let images = Array3::from_shape_fn((frames, 4, 4), |(i, _, _)| i as u8);
    let mut store = DirectoryStore::create(root).unwrap();
    store.append("image", &FeatureColumn::from_images(&images), 8).unwrap();
    let frame_numbers = FeatureColumn::UInt64 {
        item_shape: vec![],
        values: (0..frames as u64).map(|f| 1000 + f).collect(),
    };
    store.append("frame", &frame_numbers, 8).unwrap();
    store
        .set_attr(EVENT_COUNT_ATTR, serde_json::json!(frames))
        .unwrap();
    store.flush().unwrap();
}

fn event(frame_index: usize, label: u16, area: f64) -> Event {
    let mut features = BTreeMap::new();
    features.insert("area_px".to_string(), FeatureValue::Scalar(area));
    let mut mask = Array2::<u8>::zeros((4, 4));
    mask[[1, 1]] = 255;
    features.insert("mask".to_string(), FeatureValue::Mask(mask));
    Event {
        frame_index,
        label,
        features,
    }
}

/// Chunk where frame `i` holds `i % 3` events.
fn chunk(chunk_index: usize, start: usize, len: usize) -> ExtractedChunk {
    let frames = (start..start + len)
        .map(|f| FrameEvents {
            frame_index: f,
            bg_off: Some(0.5),
            events: (0..(f % 3) as u16).map(|l| event(f, l + 1, f as f64)).collect(),
        })
        .collect();
    ExtractedChunk {
        chunk_index,
        start,
        frames,
        masks_dropped: 0,
    }
}

fn u64s(column: FeatureColumn) -> Vec<u64> {
    match column {
        FeatureColumn::UInt64 { values, .. } => values,
        other => panic!("unexpected column {other:?}"),
    }
}

#[test]
fn test_events_round_trip_through_directory() {
    let dir = tempfile::tempdir().unwrap();
    let input_root = dir.path().join("input");
    let output_root = dir.path().join("output");
    write_input(&input_root, 20);

    let source: Arc<dyn FrameSource> = Arc::new(DirectoryDataset::open(&input_root).unwrap());
    let store = DirectoryStore::create(&output_root).unwrap();
    // Small flush size forces several stored chunks
    let mut writer = EventWriter::new(Box::new(store), source.clone(), 64);

    let mut expected = 0;
    for (i, start) in [0usize, 10].into_iter().enumerate() {
        expected += writer.write_chunk(&chunk(i, start, 10)).unwrap();
    }
    assert_eq!(writer.events_written(), expected);

    let mut store = writer.finish().unwrap();
    store
        .set_attr(EVENT_COUNT_ATTR, serde_json::json!(expected))
        .unwrap();
    let basin = BasinRecord::file("input", "source frames", &input_root, &output_root, vec!["image".into()])
        .with_mapping(BASIN_MAPPING);
    store.store_basin(&basin).unwrap();
    store.flush().unwrap();

    let output = DirectoryDataset::open(&output_root).unwrap();
    assert_eq!(output.len() as u64, expected);

    let index = u64s(output.read_rows(INDEX_UNMAPPED, 0, output.len()).unwrap());
    assert!(index.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(index.first(), Some(&1));

    let nevents = u64s(output.read_rows(NEVENTS, 0, output.len()).unwrap());
    for (frame, n) in index.iter().zip(&nevents) {
        assert_eq!(*n, frame % 3);
    }

    // Protected input features follow their frame
    let frames = u64s(output.read_rows("frame", 0, output.len()).unwrap());
    for (frame, number) in index.iter().zip(&frames) {
        assert_eq!(*number, 1000 + frame);
    }

    // Images come from the input through the mapped basin
    let images = output
        .read_rows("image", 0, output.len())
        .unwrap()
        .into_images()
        .unwrap();
    for (row, frame) in index.iter().enumerate() {
        assert_eq!(images[[row, 0, 0]] as u64, *frame);
    }
}

#[test]
fn test_mapped_source_writes_original_indices() {
    let dir = tempfile::tempdir().unwrap();
    write_input(dir.path(), 12);
    let inner: Arc<dyn FrameSource> = Arc::new(DirectoryDataset::open(dir.path()).unwrap());
    let mapped: Arc<dyn FrameSource> = Arc::new(MappedSource::new(inner, vec![1, 4, 7, 10]).unwrap());

    let handle = MemoryStore::new();
    let mut writer = EventWriter::new(Box::new(handle.clone()), mapped, 1 << 20);
    writer.write_chunk(&chunk(0, 0, 4)).unwrap();
    writer.finish().unwrap();

    // Frames 1 and 2 of the view hold one and two events
    let unmapped = u64s(handle.column(INDEX_UNMAPPED).unwrap());
    assert_eq!(unmapped, vec![1, 2, 2]);
    let original = u64s(handle.column(BASIN_MAPPING).unwrap());
    assert_eq!(original, vec![4, 7, 7]);
    let frames = u64s(handle.column("frame").unwrap());
    assert_eq!(frames, vec![1004, 1007, 1007]);
}

#[test]
fn test_out_of_order_chunk_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_input(dir.path(), 20);
    let source: Arc<dyn FrameSource> = Arc::new(DirectoryDataset::open(dir.path()).unwrap());
    let mut writer = EventWriter::new(Box::new(MemoryStore::new()), source, 1024);
    assert!(writer.write_chunk(&chunk(1, 10, 10)).is_err());
}

#[test]
fn test_buffers_flush_in_full_chunks() {
    let dir = tempfile::tempdir().unwrap();
    write_input(dir.path(), 20);
    let source: Arc<dyn FrameSource> = Arc::new(DirectoryDataset::open(dir.path()).unwrap());
    let handle = MemoryStore::new();
    let mut writer = EventWriter::new(Box::new(handle.clone()), source, 1 << 20);

    writer.write_chunk(&chunk(0, 0, 10)).unwrap();
    // Far below the flush size, nothing reached the store yet
    assert_eq!(handle.appends(), 0);

    let total = writer.events_written() as usize;
    writer.finish().unwrap();
    assert_eq!(handle.column("area_px").unwrap().len(), total);
    assert_eq!(handle.column("bg_off").unwrap().len(), total);
}

/// Source whose `frame` column lacks the last row of every read.
#[derive(Debug)]
struct TruncatedFrames(Arc<dyn FrameSource>);

impl FrameSource for TruncatedFrames {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn attrs(&self) -> &Attributes {
        self.0.attrs()
    }

    fn features(&self) -> Vec<String> {
        self.0.features()
    }

    fn chunk_rows(&self, name: &str) -> Option<usize> {
        self.0.chunk_rows(name)
    }

    fn read_rows(&self, name: &str, start: usize, stop: usize) -> crate::Result<FeatureColumn> {
        let stop = if name == "frame" && stop > start { stop - 1 } else { stop };
        self.0.read_rows(name, start, stop)
    }
}

#[test]
fn test_missing_protected_value_is_an_integrity_error() {
    let dir = tempfile::tempdir().unwrap();
    write_input(dir.path(), 10);
    let inner: Arc<dyn FrameSource> = Arc::new(DirectoryDataset::open(dir.path()).unwrap());
    let handle = MemoryStore::new();
    let mut writer = EventWriter::new(Box::new(handle.clone()), Arc::new(TruncatedFrames(inner)), 1 << 20);

    // Frame 8 holds two events but has no `frame` value in the short read
    let err = writer.write_chunk(&chunk(0, 0, 9)).unwrap_err();
    assert!(matches!(err, PipelineError::DataIntegrity { chunk: Some(0), .. }), "{err}");
    assert!(err.to_string().contains("'frame'"));
}
