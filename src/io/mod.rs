//! Input datasets, the chunked image cache and output stores.

pub mod basin;
pub mod dataset;
pub mod image_cache;
pub mod layout;
pub mod store;
pub mod writer;

#[cfg(test)]
mod writer_integration_tests;

pub use basin::BasinRecord;
pub use dataset::{DirectoryDataset, FrameSource, MappedSource, MemoryDataset};
pub use image_cache::{FrameSlice, ImageCache, ImageChunk};
pub use store::{DirectoryStore, MemoryStore, OutputStore};
pub use writer::{run_writer, EventWriter};
