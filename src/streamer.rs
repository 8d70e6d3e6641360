//! Rendering sparse buffer maps as contiguous byte sequences
//!
//! A streamer covers a fixed bufferable extent. Offsets backed by the
//! `[position, limit)` window of some map entry produce that entry's bytes;
//! every other offset (gaps between entries, and the parts of an entry
//! outside its window) produces the fill byte.

use crate::error::{CacheError, Result};
use crate::extent::{BufferableExtent, HasExtent};
use crate::extent_buffer::ExtentBuffer;
use crate::extent_buffer_map::ExtentBufferMap;
use std::io::{self, Write};

/// Size of the fill run written to a sink in one call
const FILL_BLOCK: usize = 4096;

/// Renders an [`ExtentBufferMap`] over fixed bounds
#[derive(Debug, Clone)]
pub struct ExtentBufferStreamer {
    bounds: BufferableExtent,
    map: ExtentBufferMap,
    fill_byte: u8,
}

impl ExtentBufferStreamer {
    /// Create a streamer over `bounds`
    ///
    /// Every entry of `map` must lie inside `bounds`; otherwise this fails
    /// with [`CacheError::OutOfBounds`].
    pub fn new(bounds: BufferableExtent, map: ExtentBufferMap) -> Result<Self> {
        for entry in map.iter() {
            if !bounds.contains(entry) {
                return Err(CacheError::OutOfBounds {
                    extent: entry.extent().to_string(),
                    bounds: bounds.extent().to_string(),
                });
            }
        }
        Ok(ExtentBufferStreamer {
            bounds,
            map,
            fill_byte: 0,
        })
    }

    /// Create a streamer over `bounds` holding a single buffer
    pub fn with_buffer(bounds: BufferableExtent, buffer: ExtentBuffer) -> Result<Self> {
        let mut map = ExtentBufferMap::new();
        map.put(buffer)?;
        Self::new(bounds, map)
    }

    pub fn with_fill_byte(mut self, fill_byte: u8) -> Self {
        self.fill_byte = fill_byte;
        self
    }

    pub fn set_fill_byte(&mut self, fill_byte: u8) {
        self.fill_byte = fill_byte;
    }

    pub fn fill_byte(&self) -> u8 {
        self.fill_byte
    }

    pub fn bounds(&self) -> BufferableExtent {
        self.bounds
    }

    /// Number of bytes every rendering produces
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    /// Render the bounds into one freshly allocated byte vector
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        let start = self.bounds.start_offset();
        self.render_range(start, start + self.len() as u64, &mut out);
        out
    }

    /// Write the rendered bounds to `sink`, returning the number of bytes
    /// written
    pub fn stream_to<W: Write>(&self, mut sink: W) -> io::Result<usize> {
        let fill = [self.fill_byte; FILL_BLOCK];
        let write_fill = |sink: &mut W, mut count: u64| -> io::Result<()> {
            while count > 0 {
                let n = count.min(FILL_BLOCK as u64) as usize;
                sink.write_all(&fill[..n])?;
                count -= n as u64;
            }
            Ok(())
        };

        let mut cursor = self.bounds.start_offset();
        for entry in self.map.iter() {
            let data_start = entry.position_to_offset(entry.position());
            let data_end = entry.position_to_offset(entry.limit());
            if data_start >= data_end {
                continue;
            }
            write_fill(&mut sink, data_start - cursor)?;
            entry.with_window(|window| sink.write_all(&window[entry.position()..entry.limit()]))?;
            cursor = data_end;
        }
        let end = self.bounds.start_offset() + self.len() as u64;
        write_fill(&mut sink, end - cursor)?;
        sink.flush()?;
        Ok(self.len())
    }

    /// Lazily render the bounds in chunks of `stride` bytes
    ///
    /// The last chunk may be shorter. Each call starts from the beginning.
    pub fn chunks(&self, stride: usize) -> Result<Chunks<'_>> {
        if stride == 0 {
            return Err(CacheError::InvalidStride);
        }
        let next = self.bounds.start_offset();
        Ok(Chunks {
            streamer: self,
            next,
            end: next + self.len() as u64,
            stride: stride as u64,
        })
    }

    /// Lazily render the bounds one byte at a time
    pub fn iter(&self) -> Chunks<'_> {
        let next = self.bounds.start_offset();
        Chunks {
            streamer: self,
            next,
            end: next + self.len() as u64,
            stride: 1,
        }
    }

    /// Append the rendering of absolute offsets `[from, to)` to `out`
    fn render_range(&self, from: u64, to: u64, out: &mut Vec<u8>) {
        let mut cursor = from;
        for entry in self.map.iter() {
            let data_start = entry.position_to_offset(entry.position()).max(from);
            let data_end = entry.position_to_offset(entry.limit()).min(to);
            if data_start >= data_end {
                continue;
            }
            out.resize(out.len() + (data_start - cursor) as usize, self.fill_byte);

            let lo = (data_start - entry.start()) as usize;
            let hi = (data_end - entry.start()) as usize;
            entry.with_window(|window| out.extend_from_slice(&window[lo..hi]));
            cursor = data_end;
        }
        out.resize(out.len() + (to - cursor) as usize, self.fill_byte);
    }
}

/// Iterator over fixed-size rendered chunks of a streamer
#[derive(Debug)]
pub struct Chunks<'a> {
    streamer: &'a ExtentBufferStreamer,
    next: u64,
    end: u64,
    stride: u64,
}

impl Iterator for Chunks<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.next >= self.end {
            return None;
        }
        let to = self.end.min(self.next + self.stride);
        let mut chunk = Vec::with_capacity((to - self.next) as usize);
        self.streamer.render_range(self.next, to, &mut chunk);
        self.next = to;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.end - self.next).div_ceil(self.stride) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Chunks<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::Extent;

    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

    fn sparse_alphabet() -> ExtentBufferStreamer {
        let whole = ExtentBuffer::wrap(0, ALPHABET.to_vec()).unwrap();
        let mut map = ExtentBufferMap::new();
        for (s, e) in [(3, 6), (9, 12), (15, 18)] {
            map.put(whole.intersect(&Extent::bounded(s, e).unwrap()).unwrap())
                .unwrap();
        }
        ExtentBufferStreamer::new(BufferableExtent::new(0, 20).unwrap(), map)
            .unwrap()
            .with_fill_byte(b'_')
    }

    #[test]
    fn test_render_sparse_map() {
        let streamer = sparse_alphabet();
        assert_eq!(streamer.render(), b"___def___jkl___pqr__".to_vec());
    }

    #[test]
    fn test_render_matches_stream() {
        let streamer = sparse_alphabet();
        let mut sink = Vec::new();
        let written = streamer.stream_to(&mut sink).unwrap();
        assert_eq!(written, 20);
        assert_eq!(sink, streamer.render());
    }

    #[test]
    fn test_chunks_reassemble() {
        let streamer = sparse_alphabet();
        let expected = streamer.render();
        for stride in [1, 2, 3, 7, 20, 64] {
            let chunks: Vec<Vec<u8>> = streamer.chunks(stride).unwrap().collect();
            assert_eq!(chunks.len(), 20usize.div_ceil(stride));
            assert!(chunks[..chunks.len() - 1].iter().all(|c| c.len() == stride));
            assert_eq!(chunks.concat(), expected, "stride {}", stride);
        }
    }

    #[test]
    fn test_iter_restarts_each_call() {
        let streamer = sparse_alphabet();
        let first: Vec<u8> = streamer.iter().flatten().collect();
        let second: Vec<u8> = streamer.iter().flatten().collect();
        assert_eq!(first, second);
        assert_eq!(streamer.iter().len(), 20);
    }

    #[test]
    fn test_zero_stride_rejected() {
        let streamer = sparse_alphabet();
        assert!(matches!(streamer.chunks(0), Err(CacheError::InvalidStride)));
    }

    #[test]
    fn test_entry_outside_bounds_rejected() {
        let buffer = ExtentBuffer::wrap(15, b"xyz0123".to_vec()).unwrap();
        let bounds = BufferableExtent::new(0, 20).unwrap();
        let result = ExtentBufferStreamer::with_buffer(bounds, buffer);
        assert!(matches!(result, Err(CacheError::OutOfBounds { .. })));
    }

    #[test]
    fn test_position_and_limit_are_filled() {
        let mut buffer = ExtentBuffer::wrap(2, b"abcdef".to_vec()).unwrap();
        buffer.set_position(2).unwrap();
        buffer.set_limit(5).unwrap();
        let streamer =
            ExtentBufferStreamer::with_buffer(BufferableExtent::new(0, 10).unwrap(), buffer)
                .unwrap()
                .with_fill_byte(b'.');
        assert_eq!(streamer.render(), b"....cde...".to_vec());

        let mut sink = Vec::new();
        streamer.stream_to(&mut sink).unwrap();
        assert_eq!(sink, b"....cde...".to_vec());
    }

    #[test]
    fn test_empty_map_renders_fill() {
        let streamer =
            ExtentBufferStreamer::new(BufferableExtent::new(100, 5).unwrap(), ExtentBufferMap::new())
                .unwrap();
        assert_eq!(streamer.fill_byte(), 0);
        assert_eq!(streamer.render(), vec![0u8; 5]);
    }

    #[test]
    fn test_vacuous_bounds() {
        let streamer =
            ExtentBufferStreamer::new(BufferableExtent::new(7, 0).unwrap(), ExtentBufferMap::new())
                .unwrap();
        assert!(streamer.is_empty());
        assert!(streamer.render().is_empty());
        assert_eq!(streamer.iter().count(), 0);
    }

    #[test]
    fn test_large_fill_streams_in_blocks() {
        let buffer = ExtentBuffer::wrap(9000, b"end".to_vec()).unwrap();
        let streamer =
            ExtentBufferStreamer::with_buffer(BufferableExtent::new(0, 9003).unwrap(), buffer)
                .unwrap();
        let mut sink = Vec::new();
        streamer.stream_to(&mut sink).unwrap();
        assert_eq!(sink.len(), 9003);
        assert_eq!(&sink[9000..], b"end");
        assert_eq!(sink, streamer.render());
    }
}
