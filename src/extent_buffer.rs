//! Offset-addressed views over shared byte storage
//!
//! An [`ExtentBuffer`] pairs an extent with a cursor-bearing window onto a
//! reference-counted byte array. Duplicating, slicing or intersecting a
//! buffer produces another view of the same storage; bytes are never copied
//! by those operations, and a write through one view is visible through every
//! other view whose window covers the written offset.
//!
//! Index `i` of a view corresponds to the absolute offset `start + i`.
//! `position` and `limit` bound the "interesting" part of the window:
//! `0 <= position <= limit <= capacity`.
//!
//! A read-only view refuses every write, and so does every view derived from
//! it. Writable views of the same storage are unaffected.

use crate::error::{CacheError, Result};
use crate::extent::{
    end_after, BufferableExtent, Extent, ExtentEnd, HasExtent, MAX_BUFFER_LEN, MAX_OFFSET,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

type Storage = Arc<RwLock<Box<[u8]>>>;

/// A window onto shared storage, positioned at an absolute offset
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "BufferRepr", into = "BufferRepr")]
pub struct ExtentBuffer {
    /// Absolute offset of index 0
    start: u64,
    /// Cached end of `[start, start + capacity)`
    end: ExtentEnd,
    storage: Storage,
    /// Index into `storage` of this view's index 0
    base: usize,
    capacity: usize,
    position: usize,
    limit: usize,
    read_only: bool,
}

impl ExtentBuffer {
    /// Wrap `bytes` as a buffer whose first byte lives at offset `start`
    ///
    /// Position is 0 and limit equals capacity.
    pub fn wrap(start: u64, bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes: Vec<u8> = bytes.into();
        let end = Self::checked_end(start, bytes.len())?;
        let capacity = bytes.len();
        Ok(ExtentBuffer {
            start,
            end,
            storage: Arc::new(RwLock::new(bytes.into_boxed_slice())),
            base: 0,
            capacity,
            position: 0,
            limit: capacity,
            read_only: false,
        })
    }

    /// A zero-filled buffer of `capacity` bytes at offset `start`
    pub fn allocate(start: u64, capacity: usize) -> Result<Self> {
        Self::checked_end(start, capacity)?;
        Self::wrap(start, vec![0u8; capacity])
    }

    /// A zero-filled buffer exactly covering `extent`
    pub fn allocate_for(extent: &BufferableExtent) -> Result<Self> {
        Self::allocate(extent.start_offset(), extent.len())
    }

    /// A buffer holding no bytes at all, positioned at `start`
    pub fn vacuous(start: u64) -> Result<Self> {
        Self::wrap(start, Vec::new())
    }

    fn checked_end(start: u64, capacity: usize) -> Result<ExtentEnd> {
        if capacity > MAX_BUFFER_LEN {
            return Err(CacheError::NotBufferable(format!("[{} # {})", start, capacity)));
        }
        end_after(start, capacity as u64)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes between position and limit
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    pub fn set_position(&mut self, position: usize) -> Result<()> {
        if position > self.limit {
            return Err(CacheError::IndexOutOfRange {
                index: position,
                limit: self.limit,
            });
        }
        self.position = position;
        Ok(())
    }

    /// Move the limit; a position beyond the new limit is pulled back to it
    pub fn set_limit(&mut self, limit: usize) -> Result<()> {
        if limit > self.capacity {
            return Err(CacheError::IndexOutOfRange {
                index: limit,
                limit: self.capacity,
            });
        }
        self.limit = limit;
        if self.position > limit {
            self.position = limit;
        }
        Ok(())
    }

    /// Limit becomes the current position, position becomes 0
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Position becomes 0, limit becomes capacity
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.capacity;
    }

    /// A new view of the same storage with identical cursor and offsets
    pub fn duplicate(&self) -> ExtentBuffer {
        self.clone()
    }

    /// A duplicate through which the storage cannot be modified
    pub fn as_read_only(&self) -> ExtentBuffer {
        ExtentBuffer {
            read_only: true,
            ..self.clone()
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// A new view covering exactly `[position, limit)` of this one
    ///
    /// The new view starts at offset `start + position`.
    pub fn slice(&self) -> ExtentBuffer {
        self.sub_view(self.position, self.limit)
    }

    /// A view clipped to the positions this buffer shares with `extent`
    ///
    /// Position and limit keep their absolute offsets where those fall inside
    /// the new window and are clamped to its edges otherwise. Fails with
    /// [`CacheError::Disjoint`] when the buffer and `extent` share no
    /// position.
    pub fn intersect(&self, extent: &Extent) -> Result<ExtentBuffer> {
        let overlap = self.intersection(extent)?;
        let from = (overlap.start() - self.start) as usize;
        let to = from + overlap.len() as usize;

        let mut view = self.sub_view(from, to);
        view.position = self.position.clamp(from, to) - from;
        view.limit = self.limit.clamp(from, to) - from;
        Ok(view)
    }

    /// View of indexes `[from, to)`, renumbered from 0
    ///
    /// An empty view past the last offset of an unbounded buffer sits at
    /// `MAX_OFFSET`, the nearest offset that exists.
    fn sub_view(&self, from: usize, to: usize) -> ExtentBuffer {
        let (start, end) = if from == to {
            let start = (self.start + from as u64).min(MAX_OFFSET);
            (start, ExtentEnd::Bounded(start))
        } else if to == self.capacity {
            (self.start + from as u64, self.end)
        } else {
            (self.start + from as u64, ExtentEnd::Bounded(self.start + to as u64))
        };
        ExtentBuffer {
            start,
            end,
            storage: Arc::clone(&self.storage),
            base: self.base + from,
            capacity: to - from,
            position: 0,
            limit: to - from,
            read_only: self.read_only,
        }
    }

    /// Byte at `index`, which must be below the limit
    pub fn get(&self, index: usize) -> Result<u8> {
        self.check_index(index)?;
        Ok(self.storage.read()[self.base + index])
    }

    /// Write `byte` at the position and advance it
    pub fn put(&mut self, byte: u8) -> Result<()> {
        self.check_writable()?;
        self.check_index(self.position)?;
        self.storage.write()[self.base + self.position] = byte;
        self.position += 1;
        Ok(())
    }

    /// Write `byte` at `index` without moving the position
    pub fn put_at(&mut self, index: usize, byte: u8) -> Result<()> {
        self.check_writable()?;
        self.check_index(index)?;
        self.storage.write()[self.base + index] = byte;
        Ok(())
    }

    /// Copy `bytes` in at the position and advance past them
    pub fn put_slice(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_writable()?;
        if bytes.len() > self.remaining() {
            return Err(CacheError::IndexOutOfRange {
                index: self.position + bytes.len(),
                limit: self.limit,
            });
        }
        let at = self.base + self.position;
        self.storage.write()[at..at + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(CacheError::ReadOnly(self.extent().to_string()));
        }
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.limit {
            return Err(CacheError::IndexOutOfRange {
                index,
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// Run `f` over the whole window `[0, capacity)` under a read lock
    pub fn with_window<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.storage.read();
        f(&guard[self.base..self.base + self.capacity])
    }

    /// Run `f` over the whole window `[0, capacity)` under a write lock
    ///
    /// Fails with [`CacheError::ReadOnly`] on a read-only view.
    pub fn with_window_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.check_writable()?;
        let mut guard = self.storage.write();
        Ok(f(&mut guard[self.base..self.base + self.capacity]))
    }

    /// Copy of the bytes in `[position, limit)`
    pub fn to_vec(&self) -> Vec<u8> {
        self.with_window(|window| window[self.position..self.limit].to_vec())
    }

    /// Append the bytes in `[position, limit)` to `out`
    pub fn copy_remaining_into(&self, out: &mut Vec<u8>) {
        self.with_window(|window| out.extend_from_slice(&window[self.position..self.limit]));
    }

    /// Absolute offset of `position`
    pub fn position_to_offset(&self, position: usize) -> u64 {
        self.start + position as u64
    }

    /// Index of absolute `offset` within this view
    pub fn offset_to_position(&self, offset: u64) -> Result<usize> {
        if offset < self.start || (offset - self.start) > self.capacity as u64 {
            return Err(CacheError::OutOfRange(format!(
                "offset {} outside {}",
                offset,
                self.extent()
            )));
        }
        Ok((offset - self.start) as usize)
    }

    /// True if both views alias the same underlying storage
    pub fn shares_storage_with(&self, other: &ExtentBuffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }
}

impl HasExtent for ExtentBuffer {
    fn extent(&self) -> Extent {
        Extent::from_parts(self.start, self.end)
    }
}

impl fmt::Debug for ExtentBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtentBuffer")
            .field("extent", &format_args!("[{}, {})", self.start, self.end))
            .field("capacity", &self.capacity)
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl fmt::Display for ExtentBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}) pos={} lim={}",
            self.start, self.end, self.position, self.limit
        )
    }
}

/// Serialized form: the cursor plus the bytes between position and limit
#[derive(Serialize, Deserialize)]
struct BufferRepr {
    start: u64,
    capacity: usize,
    position: usize,
    limit: usize,
    data: Vec<u8>,
}

impl From<ExtentBuffer> for BufferRepr {
    fn from(buffer: ExtentBuffer) -> Self {
        BufferRepr {
            start: buffer.start,
            capacity: buffer.capacity,
            position: buffer.position,
            limit: buffer.limit,
            data: buffer.to_vec(),
        }
    }
}

impl TryFrom<BufferRepr> for ExtentBuffer {
    type Error = CacheError;

    fn try_from(repr: BufferRepr) -> Result<Self> {
        if repr.position > repr.limit
            || repr.limit > repr.capacity
            || repr.data.len() != repr.limit - repr.position
        {
            return Err(CacheError::OutOfRange(format!(
                "inconsistent buffer cursor: capacity={} position={} limit={} data={}",
                repr.capacity,
                repr.position,
                repr.limit,
                repr.data.len()
            )));
        }
        let mut buffer = ExtentBuffer::allocate(repr.start, repr.capacity)?;
        buffer.set_limit(repr.limit)?;
        buffer.set_position(repr.position)?;
        buffer.with_window_mut(|window| {
            window[repr.position..repr.limit].copy_from_slice(&repr.data);
        })?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent_buffer_map::ExtentBufferMap;

    fn digits_at_20() -> ExtentBuffer {
        ExtentBuffer::wrap(20, b"0123456789".to_vec()).unwrap()
    }

    #[test]
    fn test_wrap() {
        let buffer = digits_at_20();
        assert_eq!(buffer.start_offset(), 20);
        assert_eq!(buffer.end_offset(), ExtentEnd::Bounded(30));
        assert_eq!(buffer.position(), 0);
        assert_eq!(buffer.limit(), 10);
        assert_eq!(buffer.capacity(), 10);
        assert_eq!(buffer.get(4).unwrap(), b'4');
    }

    #[test]
    fn test_wrap_at_end_of_offset_space() {
        let capacity = 10usize;
        let start = MAX_OFFSET - capacity as u64 + 1;
        let buffer = ExtentBuffer::allocate(start, capacity).unwrap();
        assert!(buffer.end_offset().is_unbounded());

        // Four bytes further would wrap past the end of the offset space
        assert!(ExtentBuffer::allocate(start + 4, capacity).is_err());
    }

    #[test]
    fn test_intersect_disjoint_at_boundary() {
        let buffer = digits_at_20();
        let result = buffer.intersect(&Extent::bounded(30, 35).unwrap());
        assert!(matches!(result, Err(CacheError::Disjoint { .. })));
    }

    #[test]
    fn test_intersect_aliases_storage() {
        let original = digits_at_20();
        let mut view = original.intersect(&Extent::bounded(25, 35).unwrap()).unwrap();

        assert_eq!(view.extent(), Extent::bounded(25, 30).unwrap());
        assert_eq!(view.position(), 0);
        assert_eq!(view.limit(), 5);
        assert_eq!(view.capacity(), 5);
        assert!(view.shares_storage_with(&original));

        view.put_at(1, b'X').unwrap();
        assert_eq!(original.get(6).unwrap(), b'X');
    }

    #[test]
    fn test_intersect_clamps_cursor() {
        let mut buffer = digits_at_20();
        buffer.set_position(2).unwrap();
        buffer.set_limit(8).unwrap();

        // Window [21, 29): position 2 -> index 1, limit 8 -> index 7
        let inner = buffer.intersect(&Extent::bounded(21, 29).unwrap()).unwrap();
        assert_eq!((inner.position(), inner.limit()), (1, 7));

        // Window [24, 26): both inside, position 2 clamps to 0
        let narrow = buffer.intersect(&Extent::bounded(24, 26).unwrap()).unwrap();
        assert_eq!((narrow.position(), narrow.limit()), (0, 2));

        // Window [28, 30): limit 8 sits at the lower edge
        let tail = buffer.intersect(&Extent::bounded(28, 40).unwrap()).unwrap();
        assert_eq!((tail.position(), tail.limit()), (0, 0));
    }

    #[test]
    fn test_duplicate_keeps_cursor() {
        let mut buffer = digits_at_20();
        buffer.set_position(3).unwrap();
        let dup = buffer.duplicate();
        assert_eq!(dup.position(), 3);
        assert_eq!(dup.extent(), buffer.extent());
        assert!(dup.shares_storage_with(&buffer));
    }

    #[test]
    fn test_slice_renumbers() {
        let mut buffer = digits_at_20();
        buffer.set_position(2).unwrap();
        buffer.set_limit(6).unwrap();

        let slice = buffer.slice();
        assert_eq!(slice.extent(), Extent::bounded(22, 26).unwrap());
        assert_eq!(slice.position(), 0);
        assert_eq!(slice.limit(), 4);
        assert_eq!(slice.to_vec(), b"2345".to_vec());
        assert!(slice.shares_storage_with(&buffer));
    }

    #[test]
    fn test_slice_keeps_unbounded_end() {
        let start = MAX_OFFSET - 9;
        let mut buffer = ExtentBuffer::allocate(start, 10).unwrap();
        buffer.set_position(4).unwrap();
        let slice = buffer.slice();
        assert_eq!(slice.start_offset(), start + 4);
        assert!(slice.end_offset().is_unbounded());
    }

    #[test]
    fn test_exhausted_slice_at_end_of_offset_space() {
        let mut buffer = ExtentBuffer::allocate(MAX_OFFSET - 9, 10).unwrap();
        buffer.set_position(10).unwrap();

        let empty = buffer.slice();
        assert!(empty.is_vacuous());
        assert_eq!(empty.capacity(), 0);
        assert_eq!(empty.extent(), Extent::vacuous_at(MAX_OFFSET).unwrap());

        let mut map = ExtentBufferMap::new();
        map.put(empty).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_empty_slice_is_vacuous_at_its_offset() {
        let mut buffer = digits_at_20();
        buffer.set_position(4).unwrap();
        buffer.set_limit(4).unwrap();
        let empty = buffer.slice();
        assert_eq!(empty.extent(), Extent::vacuous_at(24).unwrap());

        buffer.clear();
        buffer.set_position(10).unwrap();
        assert_eq!(buffer.slice().extent(), Extent::vacuous_at(30).unwrap());
    }

    #[test]
    fn test_read_only_view_refuses_writes() {
        let mut writable = digits_at_20();
        let mut view = writable.as_read_only();
        assert!(view.is_read_only());
        assert!(view.shares_storage_with(&writable));

        assert!(matches!(view.put(b'X'), Err(CacheError::ReadOnly(_))));
        assert!(matches!(view.put_at(0, b'X'), Err(CacheError::ReadOnly(_))));
        assert!(matches!(view.put_slice(b"XY"), Err(CacheError::ReadOnly(_))));
        assert!(view.with_window_mut(|w| w[0] = b'X').is_err());
        assert_eq!(view.position(), 0);
        assert_eq!(view.to_vec(), b"0123456789".to_vec());

        // Derived views stay read-only
        assert!(view.duplicate().is_read_only());
        assert!(view.slice().is_read_only());
        let mut inner = view.intersect(&Extent::bounded(22, 24).unwrap()).unwrap();
        assert!(inner.put_at(0, b'X').is_err());

        // The writable view still writes, and the read-only view sees it
        writable.put_at(0, b'#').unwrap();
        assert_eq!(view.get(0).unwrap(), b'#');
        assert!(!writable.is_read_only());
    }

    #[test]
    fn test_set_limit_clamps_position() {
        let mut buffer = digits_at_20();
        buffer.set_position(8).unwrap();
        buffer.set_limit(5).unwrap();
        assert_eq!(buffer.position(), 5);
        assert!(buffer.set_limit(11).is_err());
        assert!(buffer.set_position(6).is_err());
    }

    #[test]
    fn test_get_beyond_limit_fails() {
        let mut buffer = digits_at_20();
        buffer.set_limit(4).unwrap();
        assert!(buffer.get(3).is_ok());
        assert!(matches!(buffer.get(4), Err(CacheError::IndexOutOfRange { .. })));
    }

    #[test]
    fn test_relative_puts() {
        let mut buffer = ExtentBuffer::allocate(0, 4).unwrap();
        buffer.put(b'a').unwrap();
        buffer.put_slice(b"bc").unwrap();
        assert_eq!(buffer.position(), 3);
        assert!(buffer.put_slice(b"de").is_err());
        buffer.flip();
        assert_eq!(buffer.to_vec(), b"abc".to_vec());
    }

    #[test]
    fn test_offset_conversion() {
        let buffer = digits_at_20();
        assert_eq!(buffer.position_to_offset(3), 23);
        assert_eq!(buffer.offset_to_position(27).unwrap(), 7);
        assert_eq!(buffer.offset_to_position(30).unwrap(), 10);
        assert!(buffer.offset_to_position(19).is_err());
        assert!(buffer.offset_to_position(31).is_err());
    }

    #[test]
    fn test_copy_remaining_into() {
        let mut buffer = digits_at_20();
        buffer.set_position(7).unwrap();
        let mut out = b">".to_vec();
        buffer.copy_remaining_into(&mut out);
        assert_eq!(out, b">789".to_vec());
    }

    #[test]
    fn test_serde_keeps_window() {
        let mut buffer = digits_at_20();
        buffer.set_position(2).unwrap();
        buffer.set_limit(5).unwrap();

        let json = serde_json::to_string(&buffer).unwrap();
        let restored: ExtentBuffer = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.extent(), buffer.extent());
        assert_eq!(restored.position(), 2);
        assert_eq!(restored.limit(), 5);
        assert_eq!(restored.to_vec(), b"234".to_vec());
        assert!(!restored.shares_storage_with(&buffer));
    }
}
