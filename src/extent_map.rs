//! Ordered collection of non-overlapping extents
//!
//! Entries are keyed by start offset in a `BTreeMap`, which keeps them in
//! offset order and gives logarithmic lookup of the entry covering an offset.
//! The map never holds two entries that share a position and never holds a
//! vacuous entry.

use crate::error::{CacheError, Result};
use crate::extent::{Extent, ExtentEnd, HasExtent, MAX_OFFSET};
use std::collections::BTreeMap;

/// A sparse, ordered map of non-overlapping extents
#[derive(Debug, Clone)]
pub struct ExtentMap<T> {
    /// Entries indexed by start offset
    entries: BTreeMap<u64, T>,
}

impl<T> Default for ExtentMap<T> {
    fn default() -> Self {
        ExtentMap {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: HasExtent + Clone> ExtentMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry
    ///
    /// Vacuous entries are dropped without being stored. An entry that shares
    /// a position with an existing one is rejected with
    /// [`CacheError::Overlap`] and the map is left unchanged.
    pub fn put(&mut self, item: T) -> Result<()> {
        let extent = item.extent();
        if extent.is_vacuous() {
            return Ok(());
        }

        if let Some(existing) = self.overlapping(&extent).next() {
            return Err(CacheError::Overlap {
                extent: extent.to_string(),
                existing: existing.extent().to_string(),
            });
        }

        self.entries.insert(extent.start(), item);
        Ok(())
    }

    /// Find the entry covering `offset`
    ///
    /// Returns `Ok(None)` when `offset` falls in a gap. Offsets beyond
    /// `MAX_OFFSET` are not valid positions.
    pub fn get_extent(&self, offset: u64) -> Result<Option<&T>> {
        if offset > MAX_OFFSET {
            return Err(CacheError::InvalidOffset(offset));
        }
        Ok(self
            .entries
            .range(..=offset)
            .next_back()
            .map(|(_, item)| item)
            .filter(|item| item.covers(offset)))
    }

    /// Sub-map of the entries that intersect `extent`
    pub fn get_overlapping(&self, extent: &Extent) -> ExtentMap<T> {
        let mut result = ExtentMap::new();
        for item in self.overlapping(extent) {
            result.entries.insert(item.start_offset(), item.clone());
        }
        result
    }

    /// The maximal run of abutting entries that includes `offset`
    ///
    /// Empty when `offset` is in a gap.
    pub fn get_contiguous_from(&self, offset: u64) -> Result<ExtentMap<T>> {
        let mut result = ExtentMap::new();
        let anchor = match self.get_extent(offset)? {
            Some(item) => item.start_offset(),
            None => return Ok(result),
        };

        // Walk backwards while the preceding entry ends exactly where the
        // current one begins.
        let mut run_start = anchor;
        for (start, item) in self.entries.range(..anchor).rev() {
            if item.end_offset() != ExtentEnd::Bounded(run_start) {
                break;
            }
            run_start = *start;
        }

        let mut expected = ExtentEnd::Bounded(run_start);
        for (start, item) in self.entries.range(run_start..) {
            if expected != ExtentEnd::Bounded(*start) {
                break;
            }
            result.entries.insert(*start, item.clone());
            expected = item.end_offset();
        }

        Ok(result)
    }

    /// True if there is no gap between consecutive entries
    pub fn is_contiguous(&self) -> bool {
        let mut previous: Option<ExtentEnd> = None;
        for (start, item) in &self.entries {
            if let Some(end) = previous {
                if end != ExtentEnd::Bounded(*start) {
                    return false;
                }
            }
            previous = Some(item.end_offset());
        }
        true
    }

    /// Remove and return every entry that intersects `extent`
    pub fn remove_overlaps(&mut self, extent: &Extent) -> ExtentMap<T> {
        let keys: Vec<u64> = self
            .overlapping(extent)
            .map(|item| item.start_offset())
            .collect();

        let mut removed = ExtentMap::new();
        for key in keys {
            if let Some(item) = self.entries.remove(&key) {
                removed.entries.insert(key, item);
            }
        }
        removed
    }

    /// Remove the entry starting exactly at `start`
    pub fn remove(&mut self, start: u64) -> Option<T> {
        self.entries.remove(&start)
    }

    /// `[lowest start, highest end)`, or `None` for an empty map
    pub fn span(&self) -> Option<Extent> {
        let first = self.entries.values().next()?;
        let last = self.entries.values().next_back()?;
        Extent::new(first.start_offset(), last.end_offset()).ok()
    }

    pub fn start_offset(&self) -> Option<u64> {
        self.entries.keys().next().copied()
    }

    pub fn end_offset(&self) -> Option<ExtentEnd> {
        self.entries.values().next_back().map(|item| item.end_offset())
    }

    /// The sub-extents of `bounds` not covered by any entry, in order
    pub fn gaps_within(&self, bounds: &Extent) -> Vec<Extent> {
        let mut gaps = Vec::new();
        if bounds.is_vacuous() {
            return gaps;
        }

        // `None` once the cursor has run off the end of the offset space
        let mut cursor = Some(bounds.start());
        for item in self.overlapping(bounds) {
            let at = match cursor {
                Some(at) => at,
                None => break,
            };
            let item_start = item.start_offset();
            if at < item_start {
                if let Ok(gap) = Extent::bounded(at, item_start) {
                    gaps.push(gap);
                }
            }
            cursor = item.end_offset().bounded();
        }

        if let Some(at) = cursor {
            if bounds.end().is_after(at) {
                if let Ok(gap) = Extent::new(at, bounds.end()) {
                    gaps.push(gap);
                }
            }
        }
        gaps
    }

    pub fn first(&self) -> Option<&T> {
        self.entries.values().next()
    }

    pub fn last(&self) -> Option<&T> {
        self.entries.values().next_back()
    }

    /// Entries in increasing offset order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + '_ {
        self.entries.values()
    }

    /// Owned copies of the entries in increasing offset order
    pub fn values(&self) -> Vec<T> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Entries intersecting `extent`, in offset order
    fn overlapping<'a>(&'a self, extent: &Extent) -> impl Iterator<Item = &'a T> + 'a {
        let extent = *extent;
        // The entry starting at or before `extent` may still reach into it.
        let from = self
            .entries
            .range(..=extent.start())
            .next_back()
            .map(|(start, _)| *start)
            .unwrap_or(extent.start());

        self.entries
            .range(from..)
            .map(|(_, item)| item)
            .take_while(move |item| !extent.is_vacuous() && extent.end().is_after(item.start_offset()))
            .filter(move |item| item.intersects(&extent))
    }
}

impl<T> IntoIterator for ExtentMap<T> {
    type Item = T;
    type IntoIter = std::collections::btree_map::IntoValues<u64, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_values()
    }
}

impl<'a, T> IntoIterator for &'a ExtentMap<T> {
    type Item = &'a T;
    type IntoIter = std::collections::btree_map::Values<'a, u64, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.values()
    }
}
