//! Per-chunk replacement policy metadata
//!
//! Every buffer held in a version's map has a [`PolicyInfo`] keyed by the
//! buffer's start offset. The cache keeps the two in step; an eviction policy
//! built on top reads them but is not part of this crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Policy metadata keyed by chunk start offset
pub(crate) type PolicyTable = BTreeMap<u64, PolicyInfo>;

/// How a newly inserted chunk's metadata relates to the chunks it displaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMerge {
    /// The new chunk starts with its own reference time
    #[default]
    Fresh,
    /// The new chunk takes the latest reference time among the chunks it
    /// displaced (or a fresh one if it displaced nothing)
    Inherit,
}

/// Where a cached chunk's bytes came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provenance {
    /// Read from the backing store
    Fetched,
    /// Supplied by a predicated write
    Written,
}

/// Replacement metadata for one cached chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyInfo {
    reference_time: DateTime<Utc>,
    provenance: Provenance,
}

impl PolicyInfo {
    pub fn new(provenance: Provenance) -> Self {
        PolicyInfo {
            reference_time: Utc::now(),
            provenance,
        }
    }

    /// When the chunk was last used
    pub fn reference_time(&self) -> DateTime<Utc> {
        self.reference_time
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    /// Record a use of the chunk; the reference time never moves backwards
    pub fn touch(&mut self) {
        self.reference_time = self.reference_time.max(Utc::now());
    }

    /// Metadata for a chunk that replaces this one but keeps its history
    pub(crate) fn inherited(&self, provenance: Provenance) -> Self {
        PolicyInfo {
            reference_time: self.reference_time,
            provenance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_touch_is_monotonic() {
        let mut info = PolicyInfo::new(Provenance::Fetched);
        // Pretend the clock already ran ahead
        let future = Utc::now() + Duration::hours(1);
        info.reference_time = future;
        info.touch();
        assert_eq!(info.reference_time(), future);

        let mut info = PolicyInfo::new(Provenance::Fetched);
        let before = info.reference_time();
        info.touch();
        assert!(info.reference_time() >= before);
    }

    #[test]
    fn test_inherited_keeps_reference_time() {
        let mut info = PolicyInfo::new(Provenance::Fetched);
        info.reference_time = Utc::now() - Duration::minutes(5);
        let derived = info.inherited(Provenance::Written);
        assert_eq!(derived.reference_time(), info.reference_time());
        assert_eq!(derived.provenance(), Provenance::Written);
    }

    #[test]
    fn test_policy_merge_default() {
        assert_eq!(PolicyMerge::default(), PolicyMerge::Fresh);
    }
}
