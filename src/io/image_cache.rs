//! Chunked read-through cache over a frame source.
//!
//! Frames are read in chunks of `chunk_size` frames. At most `slots` chunks
//! are held; when the cache is full, the chunk that was added first is
//! evicted before the next one is read, so peak memory stays at `slots`
//! chunks plus any reads in flight.
//!
//! Lookups never promote an entry: the underlying [`LruCache`] is only
//! touched through `peek` and `put`, which makes its eviction order the
//! insertion order.

use super::dataset::FrameSource;
use crate::error::{PipelineError, Result};
use crate::pipeline::Metrics;
use lru::LruCache;
use ndarray::{s, Array2, Array3, Axis};
use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::{Arc, Mutex};

/// A run of consecutive frames.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageChunk {
    pub index: usize,
    /// Index of the first frame
    pub start: usize,
    /// Frames, shape (n, height, width)
    pub images: Array3<u8>,
}

impl ImageChunk {
    pub fn len(&self) -> usize {
        self.images.dim().0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stop(&self) -> usize {
        self.start + self.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.images.len() + std::mem::size_of::<Self>()
    }
}

/// Python-style slice over frame indices. Negative bounds count from the
/// end; after that every bound must lie in `[0, len]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlice {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: i64,
}

impl FrameSlice {
    pub fn new(start: Option<i64>, stop: Option<i64>, step: i64) -> Self {
        Self { start, stop, step }
    }

    pub fn range(start: i64, stop: i64) -> Self {
        Self::new(Some(start), Some(stop), 1)
    }

    /// Frame indices selected from a sequence of `len` frames.
    pub fn resolve(&self, len: usize) -> Result<Vec<usize>> {
        if self.step <= 0 {
            return Err(PipelineError::config(format!("slice step must be positive, got {}", self.step)));
        }
        let bound = |value: i64| -> Result<usize> {
            let resolved = if value < 0 { value + len as i64 } else { value };
            if resolved < 0 || resolved > len as i64 {
                return Err(PipelineError::Bounds { index: value, len });
            }
            Ok(resolved as usize)
        };
        let start = bound(self.start.unwrap_or(0))?;
        let stop = bound(self.stop.unwrap_or(len as i64))?;
        if start >= stop {
            return Ok(Vec::new());
        }
        Ok((start..stop).step_by(self.step as usize).collect())
    }
}

/// Cache chunk size for a request of `requested` frames.
///
/// Chunked backing storage rounds the request down to a whole number of
/// backing chunks (at least one), contiguous storage takes it as is. The
/// result never exceeds the dataset length.
pub fn effective_chunk_size(requested: usize, backing: Option<usize>, len: usize) -> usize {
    let size = match backing {
        Some(b) if b > 0 => {
            if requested <= b {
                b
            } else {
                (requested / b) * b
            }
        }
        _ => requested,
    };
    size.min(len).max(1)
}

pub struct ImageCache {
    source: Arc<dyn FrameSource>,
    feature: String,
    chunk_size: usize,
    len: usize,
    frame_shape: (usize, usize),
    slots: usize,
    chunks: Mutex<LruCache<usize, Arc<ImageChunk>>>,
    metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("feature", &self.feature)
            .field("len", &self.len)
            .field("chunk_size", &self.chunk_size)
            .field("slots", &self.slots)
            .finish()
    }
}

impl ImageCache {
    /// Create a cache over the image column `feature` of `source`.
    ///
    /// # Arguments
    /// * `chunk_size` - Requested frames per chunk, adjusted by [`effective_chunk_size`]
    /// * `slots` - Maximum number of chunks held at once
    pub fn new(
        source: Arc<dyn FrameSource>,
        feature: &str,
        chunk_size: usize,
        slots: usize,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self> {
        if !source.has_feature(feature) {
            return Err(PipelineError::config(format!("input has no '{feature}' column")));
        }
        let len = source.len();
        let frame_shape = if len > 0 {
            match source.read_rows(feature, 0, 1)?.item_shape() {
                [h, w] => (*h, *w),
                other => {
                    return Err(PipelineError::integrity(
                        "cache",
                        None,
                        format!("'{feature}' rows have shape {other:?}, expected 2-D frames"),
                    ))
                }
            }
        } else {
            (0, 0)
        };
        let slots = slots.max(1);
        let chunk_size = effective_chunk_size(chunk_size, source.chunk_rows(feature), len);

        Ok(Self {
            source,
            feature: feature.to_string(),
            chunk_size,
            len,
            frame_shape,
            slots,
            chunks: Mutex::new(LruCache::new(NonZeroUsize::new(slots).unwrap_or(NonZeroUsize::MIN))),
            metrics,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn frame_shape(&self) -> (usize, usize) {
        self.frame_shape
    }

    pub fn source(&self) -> &Arc<dyn FrameSource> {
        &self.source
    }

    pub fn num_chunks(&self) -> usize {
        self.len.div_ceil(self.chunk_size)
    }

    /// Frame range covered by chunk `index`.
    pub fn chunk_range(&self, index: usize) -> Range<usize> {
        let start = (index * self.chunk_size).min(self.len);
        start..(start + self.chunk_size).min(self.len)
    }

    /// Chunk `index`, read from the source on a miss.
    pub fn get_chunk(&self, index: usize) -> Result<Arc<ImageChunk>> {
        if index >= self.num_chunks() {
            return Err(PipelineError::Bounds { index: index as i64, len: self.num_chunks() });
        }

        {
            let mut chunks = self.lock();
            if let Some(chunk) = chunks.peek(&index) {
                if let Some(m) = &self.metrics {
                    m.add_cache_hit();
                }
                return Ok(chunk.clone());
            }
            // Make room before reading
            while chunks.len() >= self.slots {
                if chunks.pop_lru().is_none() {
                    break;
                }
                if let Some(m) = &self.metrics {
                    m.add_cache_eviction();
                }
            }
        }

        let range = self.chunk_range(index);
        let images = self
            .source
            .read_rows(&self.feature, range.start, range.end)?
            .into_images()?;
        let chunk = Arc::new(ImageChunk {
            index,
            start: range.start,
            images,
        });

        if let Some(m) = &self.metrics {
            m.add_cache_miss();
            m.add_frames_read(chunk.len() as u64);
        }

        let mut chunks = self.lock();
        if chunks.len() >= self.slots && !chunks.contains(&index) {
            if chunks.pop_lru().is_some() {
                if let Some(m) = &self.metrics {
                    m.add_cache_eviction();
                }
            }
        }
        chunks.put(index, chunk.clone());
        Ok(chunk)
    }

    /// Frame at `index`. Negative indices are out of range.
    pub fn get(&self, index: i64) -> Result<Array2<u8>> {
        if index < 0 || index >= self.len as i64 {
            return Err(PipelineError::Bounds { index, len: self.len });
        }
        let index = index as usize;
        let chunk = self.get_chunk(index / self.chunk_size)?;
        Ok(chunk.images.index_axis(Axis(0), index - chunk.start).to_owned())
    }

    /// Frames selected by `slice`, in slice order.
    pub fn select(&self, slice: FrameSlice) -> Result<Array3<u8>> {
        let indices = slice.resolve(self.len)?;
        let (h, w) = self.frame_shape;
        let mut out = Array3::zeros((indices.len(), h, w));
        let mut current: Option<Arc<ImageChunk>> = None;
        for (i, &frame) in indices.iter().enumerate() {
            let chunk = match &current {
                Some(c) if c.start <= frame && frame < c.stop() => c.clone(),
                _ => {
                    let c = self.get_chunk(frame / self.chunk_size)?;
                    current = Some(c.clone());
                    c
                }
            };
            out.slice_mut(s![i, .., ..])
                .assign(&chunk.images.index_axis(Axis(0), frame - chunk.start));
        }
        Ok(out)
    }

    /// Lazy iterator over all chunks in ascending order. Each call starts
    /// from the first chunk again.
    pub fn iter_chunks(self: &Arc<Self>) -> ChunkIter {
        ChunkIter {
            cache: self.clone(),
            next: 0,
        }
    }

    /// Indices of the chunks currently held, oldest first.
    pub fn cached_chunks(&self) -> Vec<usize> {
        let mut held: Vec<usize> = self.lock().iter().map(|(k, _)| *k).collect();
        // LruCache iterates most recent first
        held.reverse();
        held
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<usize, Arc<ImageChunk>>> {
        // A panic while holding the lock leaves the map itself consistent
        self.chunks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Iterator returned by [`ImageCache::iter_chunks`].
pub struct ChunkIter {
    cache: Arc<ImageCache>,
    next: usize,
}

impl Iterator for ChunkIter {
    type Item = Result<(usize, Arc<ImageChunk>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.cache.num_chunks() {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(self.cache.get_chunk(index).map(|c| (index, c)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.cache.num_chunks().saturating_sub(self.next);
        (left, Some(left))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::dataset::MemoryDataset;

    fn cache(n: usize, chunk: usize, slots: usize) -> Arc<ImageCache> {
        let frames = Array3::from_shape_fn((n, 3, 4), |(i, y, x)| ((i + y + x) % 256) as u8);
        let source: Arc<dyn FrameSource> = Arc::new(MemoryDataset::new(&frames));
        Arc::new(ImageCache::new(source, "image", chunk, slots, Some(Metrics::new())).unwrap())
    }

    #[test]
    fn test_get_bounds() {
        let cache = cache(25, 10, 2);
        assert!(matches!(cache.get(-1), Err(PipelineError::Bounds { index: -1, len: 25 })));
        assert!(matches!(cache.get(25), Err(PipelineError::Bounds { .. })));
        assert_eq!(cache.get(24).unwrap()[[0, 0]], 24);
        assert_eq!(cache.get(0).unwrap().dim(), (3, 4));
    }

    #[test]
    fn test_slices() {
        let cache = cache(25, 10, 2);
        let sel = cache.select(FrameSlice::new(Some(-5), None, 2)).unwrap();
        assert_eq!(sel.dim().0, 3);
        assert_eq!(sel[[0, 0, 0]], 20);
        assert_eq!(sel[[2, 0, 0]], 24);

        // Empty results still check bounds
        assert_eq!(cache.select(FrameSlice::range(7, 7)).unwrap().dim().0, 0);
        assert!(cache.select(FrameSlice::range(30, 30)).is_err());
        assert!(cache.select(FrameSlice::range(-26, 3)).is_err());
        assert!(cache.select(FrameSlice::new(None, None, 0)).is_err());
    }

    #[test]
    fn test_iter_chunks_covers_once() {
        let cache = cache(25, 10, 1);
        for _ in 0..2 {
            let chunks: Vec<_> = cache.iter_chunks().map(|c| c.unwrap()).collect();
            let indices: Vec<_> = chunks.iter().map(|(i, _)| *i).collect();
            assert_eq!(indices, vec![0, 1, 2]);
            let total: usize = chunks.iter().map(|(_, c)| c.len()).sum();
            assert_eq!(total, 25);
            assert_eq!(chunks[2].1.start, 20);
        }
    }

    #[test]
    fn test_eviction_is_first_in_first_out() {
        let cache = cache(50, 10, 2);
        cache.get_chunk(0).unwrap();
        cache.get_chunk(1).unwrap();
        // A hit does not refresh chunk 0
        cache.get_chunk(0).unwrap();
        cache.get_chunk(2).unwrap();
        assert_eq!(cache.cached_chunks(), vec![1, 2]);

        let snapshot = cache.metrics.as_ref().unwrap().snapshot();
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 3);
        assert_eq!(snapshot.cache_evictions, 1);
    }

    #[test]
    fn test_chunk_size_rounding() {
        assert_eq!(effective_chunk_size(30, Some(32), 1000), 32);
        assert_eq!(effective_chunk_size(81, Some(32), 1000), 64);
        assert_eq!(effective_chunk_size(81, None, 1000), 81);
        assert_eq!(effective_chunk_size(100, Some(32), 40), 40);
        assert_eq!(effective_chunk_size(100, None, 0), 1);

        let frames = Array3::<u8>::zeros((100, 2, 2));
        let source: Arc<dyn FrameSource> = Arc::new(MemoryDataset::new(&frames).with_chunk_rows(32));
        let cache = ImageCache::new(source, "image", 81, 2, None).unwrap();
        assert_eq!(cache.chunk_size(), 64);
        assert_eq!(cache.num_chunks(), 2);
    }

    #[test]
    fn test_missing_column() {
        let frames = Array3::<u8>::zeros((4, 2, 2));
        let source: Arc<dyn FrameSource> = Arc::new(MemoryDataset::new(&frames));
        assert!(ImageCache::new(source, "image_bg", 2, 2, None).is_err());
    }
}
