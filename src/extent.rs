//! Half-open offset intervals ("extents")
//!
//! An extent is the set of offsets `[start, end)` within some sequentially
//! indexable entity. The end may be [`ExtentEnd::Unbounded`], meaning the
//! extent reaches as far as the offset space allows. Offsets are limited to
//! the range of a signed 64-bit file offset, `0..=MAX_OFFSET`.
//!
//! Intersection and containment are defined on the *sets of positions* an
//! extent denotes. Since a vacuous extent (`start == end`) denotes the empty
//! set, it intersects nothing (not even itself) and is contained by every
//! extent.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::{max, min};
use std::fmt;

/// Largest offset that can be part of an extent
pub const MAX_OFFSET: u64 = i64::MAX as u64;

/// Largest length a bufferable extent (and so a single buffer) may have
pub const MAX_BUFFER_LEN: usize = i32::MAX as usize;

/// The end of an extent
///
/// `Bounded(_)` always orders before `Unbounded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExtentEnd {
    /// One past the last offset in the extent
    Bounded(u64),
    /// The extent reaches the end of the offset space
    Unbounded,
}

impl ExtentEnd {
    pub fn is_unbounded(&self) -> bool {
        matches!(self, ExtentEnd::Unbounded)
    }

    /// The finite end offset, if there is one
    pub fn bounded(&self) -> Option<u64> {
        match self {
            ExtentEnd::Bounded(end) => Some(*end),
            ExtentEnd::Unbounded => None,
        }
    }

    /// True if `offset` falls before this end
    pub fn is_after(&self, offset: u64) -> bool {
        match self {
            ExtentEnd::Bounded(end) => offset < *end,
            ExtentEnd::Unbounded => true,
        }
    }

    /// Distance from `start` to this end
    ///
    /// An unbounded end is treated as one past `MAX_OFFSET`.
    pub(crate) fn distance_from(&self, start: u64) -> u64 {
        match self {
            ExtentEnd::Bounded(end) => end.saturating_sub(start),
            ExtentEnd::Unbounded => MAX_OFFSET + 1 - start.min(MAX_OFFSET + 1),
        }
    }
}

impl fmt::Display for ExtentEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtentEnd::Bounded(end) => write!(f, "{}", end),
            ExtentEnd::Unbounded => write!(f, "infinity"),
        }
    }
}

/// Compute the end of an extent of `len` positions starting at `start`
///
/// Lands on `Unbounded` when the extent reaches exactly one past
/// `MAX_OFFSET`; anything further would wrap past the offset space.
pub(crate) fn end_after(start: u64, len: u64) -> Result<ExtentEnd> {
    if start > MAX_OFFSET {
        return Err(CacheError::OutOfRange(format!("start offset {}", start)));
    }
    let end = start as u128 + len as u128;
    let limit = MAX_OFFSET as u128 + 1;
    if end < limit {
        Ok(ExtentEnd::Bounded(end as u64))
    } else if end == limit {
        Ok(ExtentEnd::Unbounded)
    } else {
        Err(CacheError::OutOfRange(format!(
            "[{} # {}) extends past the offset space",
            start, len
        )))
    }
}

/// A plain extent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawExtent", into = "RawExtent")]
pub struct Extent {
    start: u64,
    end: ExtentEnd,
}

#[derive(Serialize, Deserialize)]
struct RawExtent {
    start: u64,
    end: ExtentEnd,
}

impl TryFrom<RawExtent> for Extent {
    type Error = CacheError;

    fn try_from(raw: RawExtent) -> Result<Self> {
        Extent::new(raw.start, raw.end)
    }
}

impl From<Extent> for RawExtent {
    fn from(extent: Extent) -> Self {
        RawExtent {
            start: extent.start,
            end: extent.end,
        }
    }
}

impl Extent {
    pub fn new(start: u64, end: ExtentEnd) -> Result<Self> {
        if start > MAX_OFFSET {
            return Err(CacheError::OutOfRange(format!("start offset {}", start)));
        }
        if let ExtentEnd::Bounded(e) = end {
            if e > MAX_OFFSET {
                return Err(CacheError::OutOfRange(format!("end offset {}", e)));
            }
            if e < start {
                return Err(CacheError::OutOfRange(format!(
                    "end offset {} precedes start offset {}",
                    e, start
                )));
            }
        }
        Ok(Extent { start, end })
    }

    /// `[start, end)`
    pub fn bounded(start: u64, end: u64) -> Result<Self> {
        Extent::new(start, ExtentEnd::Bounded(end))
    }

    /// `[start, infinity)`
    pub fn unbounded(start: u64) -> Result<Self> {
        Extent::new(start, ExtentEnd::Unbounded)
    }

    /// Build an extent from bounds the caller has already validated
    pub(crate) fn from_parts(start: u64, end: ExtentEnd) -> Self {
        debug_assert!(Extent::new(start, end).is_ok());
        Extent { start, end }
    }

    /// The vacuous extent at `offset`
    pub fn vacuous_at(offset: u64) -> Result<Self> {
        Extent::bounded(offset, offset)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> ExtentEnd {
        self.end
    }

    /// Number of positions in the extent
    pub fn len(&self) -> u64 {
        self.end.distance_from(self.start)
    }

    /// Clip the end of this extent so it does not reach past `end`
    pub fn clip_end(&self, end: u64) -> Extent {
        let clipped = min(self.end, ExtentEnd::Bounded(end.max(self.start)));
        Extent {
            start: self.start,
            end: clipped,
        }
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Anything that occupies an extent
///
/// The provided methods implement the extent algebra once for every type that
/// can report its bounds.
pub trait HasExtent {
    fn extent(&self) -> Extent;

    fn start_offset(&self) -> u64 {
        self.extent().start
    }

    fn end_offset(&self) -> ExtentEnd {
        self.extent().end
    }

    fn is_vacuous(&self) -> bool {
        let extent = self.extent();
        extent.end == ExtentEnd::Bounded(extent.start)
    }

    /// True if the two extents have at least one position in common
    fn intersects<O: HasExtent + ?Sized>(&self, other: &O) -> bool {
        let this = self.extent();
        let other = other.extent();
        if this.is_vacuous() || other.is_vacuous() {
            return false;
        }
        other.end.is_after(this.start) && this.end.is_after(other.start)
    }

    /// True if every position of `other` is also a position of this extent
    fn contains<O: HasExtent + ?Sized>(&self, other: &O) -> bool {
        let this = self.extent();
        let other = other.extent();
        if other.is_vacuous() {
            return true;
        }
        this.start <= other.start && this.end >= other.end
    }

    /// True if `offset` is one of this extent's positions
    fn covers(&self, offset: u64) -> bool {
        let this = self.extent();
        this.start <= offset && this.end.is_after(offset)
    }

    /// The positions common to both extents
    ///
    /// Fails with [`CacheError::Disjoint`] if there are none.
    fn intersection<O: HasExtent + ?Sized>(&self, other: &O) -> Result<Extent> {
        let this = self.extent();
        let other = other.extent();
        if !this.intersects(&other) {
            return Err(CacheError::Disjoint {
                left: this.to_string(),
                right: other.to_string(),
            });
        }
        Ok(Extent {
            start: max(this.start, other.start),
            end: min(this.end, other.end),
        })
    }
}

impl HasExtent for Extent {
    fn extent(&self) -> Extent {
        *self
    }
}

/// An extent short enough to be backed by a single buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawBufferable", into = "RawBufferable")]
pub struct BufferableExtent {
    start: u64,
    len: usize,
    end: ExtentEnd,
}

#[derive(Serialize, Deserialize)]
struct RawBufferable {
    start: u64,
    len: usize,
}

impl TryFrom<RawBufferable> for BufferableExtent {
    type Error = CacheError;

    fn try_from(raw: RawBufferable) -> Result<Self> {
        BufferableExtent::new(raw.start, raw.len)
    }
}

impl From<BufferableExtent> for RawBufferable {
    fn from(extent: BufferableExtent) -> Self {
        RawBufferable {
            start: extent.start,
            len: extent.len,
        }
    }
}

impl BufferableExtent {
    pub fn new(start: u64, len: usize) -> Result<Self> {
        if len > MAX_BUFFER_LEN {
            return Err(CacheError::NotBufferable(format!("[{} # {})", start, len)));
        }
        let end = end_after(start, len as u64)?;
        Ok(BufferableExtent { start, len, end })
    }

    /// True if `extent` spans few enough positions to be buffered
    pub fn is_bufferable(extent: &Extent) -> bool {
        extent.len() <= MAX_BUFFER_LEN as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl TryFrom<Extent> for BufferableExtent {
    type Error = CacheError;

    fn try_from(extent: Extent) -> Result<Self> {
        if !BufferableExtent::is_bufferable(&extent) {
            return Err(CacheError::NotBufferable(extent.to_string()));
        }
        Ok(BufferableExtent {
            start: extent.start,
            len: extent.len() as usize,
            end: extent.end,
        })
    }
}

impl HasExtent for BufferableExtent {
    fn extent(&self) -> Extent {
        Extent {
            start: self.start,
            end: self.end,
        }
    }
}

impl From<BufferableExtent> for Extent {
    fn from(extent: BufferableExtent) -> Self {
        extent.extent()
    }
}

impl fmt::Display for BufferableExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} # {})", self.start, self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(start: u64, end: u64) -> Extent {
        Extent::bounded(start, end).unwrap()
    }

    #[test]
    fn test_extent_creation() {
        let extent = ext(10, 20);
        assert_eq!(extent.start(), 10);
        assert_eq!(extent.end(), ExtentEnd::Bounded(20));
        assert_eq!(extent.len(), 10);
        assert!(!extent.is_vacuous());
    }

    #[test]
    fn test_extent_rejects_bad_bounds() {
        assert!(Extent::bounded(20, 10).is_err());
        assert!(Extent::bounded(MAX_OFFSET + 1, MAX_OFFSET + 1).is_err());
        assert!(Extent::bounded(0, MAX_OFFSET + 1).is_err());
        assert!(Extent::unbounded(MAX_OFFSET).is_ok());
    }

    #[test]
    fn test_unbounded_orders_after_everything() {
        assert!(ExtentEnd::Bounded(MAX_OFFSET) < ExtentEnd::Unbounded);
        assert!(ExtentEnd::Bounded(3) < ExtentEnd::Bounded(4));
        assert_eq!(Extent::unbounded(0).unwrap().len(), MAX_OFFSET + 1);
    }

    #[test]
    fn test_vacuous_intersects_nothing() {
        let v = ext(5, 5);
        assert!(v.is_vacuous());
        assert!(!v.intersects(&v));
        assert!(!v.intersects(&ext(0, 10)));
        assert!(!ext(0, 10).intersects(&v));
    }

    #[test]
    fn test_vacuous_containment() {
        let v = ext(50, 50);
        assert!(ext(0, 10).contains(&v));
        assert!(v.contains(&v));
        assert!(!v.contains(&ext(50, 51)));
    }

    #[test]
    fn test_touching_extents_are_disjoint() {
        let a = ext(20, 30);
        let b = ext(30, 35);
        assert!(!a.intersects(&b));
        assert!(matches!(a.intersection(&b), Err(CacheError::Disjoint { .. })));
    }

    #[test]
    fn test_intersection() {
        let i = ext(20, 30).intersection(&ext(25, 35)).unwrap();
        assert_eq!(i, ext(25, 30));
    }

    #[test]
    fn test_intersection_with_unbounded() {
        let inf = Extent::unbounded(25).unwrap();
        assert_eq!(ext(20, 30).intersection(&inf).unwrap(), ext(25, 30));
        assert_eq!(inf.intersection(&ext(20, 30)).unwrap(), ext(25, 30));

        let both = inf.intersection(&Extent::unbounded(40).unwrap()).unwrap();
        assert_eq!(both.start(), 40);
        assert!(both.end().is_unbounded());
    }

    #[test]
    fn test_containment_with_unbounded() {
        let inf = Extent::unbounded(10).unwrap();
        assert!(inf.contains(&ext(10, 1000)));
        assert!(!ext(10, 1000).contains(&inf));
        assert!(inf.contains(&Extent::unbounded(11).unwrap()));
        assert!(!inf.contains(&Extent::unbounded(9).unwrap()));
    }

    #[test]
    fn test_covers() {
        let e = ext(10, 20);
        assert!(!e.covers(9));
        assert!(e.covers(10));
        assert!(e.covers(19));
        assert!(!e.covers(20));
        assert!(Extent::unbounded(10).unwrap().covers(MAX_OFFSET));
    }

    #[test]
    fn test_display() {
        assert_eq!(ext(1, 2).to_string(), "[1, 2)");
        assert_eq!(Extent::unbounded(7).unwrap().to_string(), "[7, infinity)");
    }

    #[test]
    fn test_clip_end() {
        assert_eq!(ext(10, 40).clip_end(36), ext(10, 36));
        assert_eq!(ext(10, 20).clip_end(36), ext(10, 20));
        assert_eq!(ext(40, 50).clip_end(36), ext(40, 40));
        assert_eq!(Extent::unbounded(0).unwrap().clip_end(36), ext(0, 36));
    }

    #[test]
    fn test_bufferable_limits() {
        let last_start = MAX_OFFSET - 10 + 1;
        let b = BufferableExtent::new(last_start, 10).unwrap();
        assert!(b.end_offset().is_unbounded());
        assert!(BufferableExtent::new(last_start + 4, 10).is_err());
        assert!(BufferableExtent::new(0, MAX_BUFFER_LEN + 1).is_err());
    }

    #[test]
    fn test_bufferable_from_extent() {
        let b = BufferableExtent::try_from(ext(5, 15)).unwrap();
        assert_eq!(b.len(), 10);
        assert_eq!(Extent::from(b), ext(5, 15));
        assert!(BufferableExtent::try_from(Extent::unbounded(0).unwrap()).is_err());
    }

    #[test]
    fn test_serde_rejects_inverted_extent() {
        let json = r#"{"start":10,"end":{"Bounded":5}}"#;
        assert!(serde_json::from_str::<Extent>(json).is_err());
        let ok: Extent = serde_json::from_str(r#"{"start":1,"end":"Unbounded"}"#).unwrap();
        assert_eq!(ok, Extent::unbounded(1).unwrap());
    }
}
