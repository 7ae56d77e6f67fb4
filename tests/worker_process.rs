//! Runs a job with worker processes spawned from the built binary.

use cytostream::events::FeatureColumn;
use cytostream::io::dataset::{EVENT_COUNT_ATTR, PIXEL_SIZE_ATTR};
use cytostream::io::store::OutputStore;
use cytostream::{run_job, DirectoryDataset, DirectoryStore, FrameSource, JobConfig, WorkerMode};
use ndarray::{s, Array3};
use std::path::Path;

fn write_input(root: &Path, frames: usize) {
    let mut images = Array3::from_elem((frames, 16, 16), 100u8);
    for i in (0..frames).step_by(3) {
        images.slice_mut(s![i, 4..8, 6..10]).fill(50);
    }
    let background = Array3::from_elem((frames, 16, 16), 100u8);

    let mut store = DirectoryStore::create(root).unwrap();
    store.append("image", &FeatureColumn::from_images(&images), 30).unwrap();
    store.append("image_bg", &FeatureColumn::from_images(&background), 30).unwrap();
    store.set_attr(EVENT_COUNT_ATTR, serde_json::json!(frames)).unwrap();
    store.set_attr(PIXEL_SIZE_ATTR, serde_json::json!(0.34)).unwrap();
    store.flush().unwrap();
}

fn config(input: &Path, output: &Path) -> JobConfig {
    let yaml = format!(
        r#"
input:
  path: {input}
output:
  path: {output}
stages:
  background:
    code: copy
  segmenter:
    code: thresh
  features:
    code: legacy
  gate:
    code: norm
processing:
  segmentation_workers: 2
  extraction_workers: 1
  worker_mode: process
  worker_executable: {exe}
  chunk_size: 30
  enable_metrics: false
"#,
        input = input.display(),
        output = output.display(),
        exe = env!("CARGO_BIN_EXE_cytostream"),
    );
    JobConfig::from_yaml(&yaml).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_job_with_worker_processes() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    let output = dir.path().join("output");
    write_input(&input, 90);

    let config = config(&input, &output);
    assert_eq!(config.processing.worker_mode, WorkerMode::Process);

    let summary = run_job(config).await.unwrap();
    assert!(summary.complete);
    assert_eq!(summary.events, 30);
    assert_eq!(summary.chunks, 3);

    let dataset = DirectoryDataset::open(&output).unwrap();
    assert_eq!(dataset.len(), 30);
    assert_eq!(dataset.attrs().get("pipeline:complete").map(String::as_str), Some("true"));
    assert!(dataset.has_feature("area_px"));

    // Images resolve through the basin to the input frames
    let images = dataset.read_rows("image", 0, dataset.len()).unwrap().into_images().unwrap();
    assert_eq!(images[[0, 5, 7]], 50);
    assert_eq!(images[[0, 0, 0]], 100);
}

#[tokio::test]
async fn test_validation_leaves_existing_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    let output = dir.path().join("output");
    write_input(&input, 10);
    std::fs::create_dir_all(&output).unwrap();
    std::fs::write(output.join("keep.txt"), "previous run").unwrap();

    let mut runner = cytostream::JobRunner::new(config(&input, &output));
    runner.validate().unwrap();
    assert!(runner.ppid().is_some());
    assert!(output.join("keep.txt").exists());
}
