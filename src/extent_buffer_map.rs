//! Sparse maps of buffer-backed extents
//!
//! [`ExtentBufferMap`] is the unit of cached knowledge about one version of
//! an object: which byte ranges are known and where their bytes live.
//! [`replace_extents`](ExtentMap::replace_extents) is the only way to insert a
//! buffer that overlaps existing entries; the entries it displaces are trimmed
//! to the parts that stick out, as views of their original storage.

use crate::error::Result;
use crate::extent::{Extent, ExtentEnd, HasExtent};
use crate::extent_buffer::ExtentBuffer;
use crate::extent_map::ExtentMap;

/// A sparse map of non-overlapping extent buffers
pub type ExtentBufferMap = ExtentMap<ExtentBuffer>;

impl ExtentMap<ExtentBuffer> {
    /// Insert `buffer`, displacing whatever it overlaps
    ///
    /// Parts of displaced entries that lie below the start or beyond the end
    /// of `buffer` are kept as shared-storage views. Vacuous buffers are
    /// ignored.
    pub fn replace_extents(&mut self, buffer: ExtentBuffer) -> Result<()> {
        if buffer.is_vacuous() {
            return Ok(());
        }

        let extent = buffer.extent();
        let displaced = self.remove_overlaps(&extent);
        self.put(buffer)?;

        if let Some(first) = displaced.first() {
            if first.start_offset() < extent.start() {
                let below = Extent::bounded(first.start_offset(), extent.start())?;
                self.put(first.intersect(&below)?)?;
            }
        }

        // Nothing protrudes past an unbounded end
        if let (Some(last), ExtentEnd::Bounded(end)) = (displaced.last(), extent.end()) {
            if last.end_offset() > ExtentEnd::Bounded(end) {
                let above = Extent::new(end, last.end_offset())?;
                self.put(last.intersect(&above)?)?;
            }
        }

        Ok(())
    }

    /// A new map holding the parts of every entry that fall inside `extent`
    ///
    /// Entries wholly inside `extent` are duplicated; entries straddling a
    /// boundary are trimmed. The new entries alias this map's storage.
    pub fn intersect(&self, extent: &Extent) -> Result<ExtentBufferMap> {
        let mut result = ExtentBufferMap::new();
        for entry in self.get_overlapping(extent) {
            if extent.contains(&entry) {
                result.put(entry)?;
            } else {
                result.put(entry.intersect(extent)?)?;
            }
        }
        Ok(result)
    }

    /// Duplicated views of every entry, in offset order
    pub fn get_buffers(&self) -> Vec<ExtentBuffer> {
        self.iter().map(ExtentBuffer::duplicate).collect()
    }

    /// Sum of the capacities of all entries
    pub fn get_capacities(&self) -> u64 {
        self.iter().map(|buffer| buffer.capacity() as u64).sum()
    }

    /// Sum of the bytes between position and limit of all entries
    pub fn get_remaining(&self) -> u64 {
        self.iter().map(|buffer| buffer.remaining() as u64).sum()
    }
}
