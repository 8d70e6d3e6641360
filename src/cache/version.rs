//! Cached knowledge about a single object version

use super::policy::{PolicyInfo, PolicyMerge, PolicyTable, Provenance};
use crate::error::Result;
use crate::extent::{Extent, ExtentEnd, HasExtent};
use crate::extent_buffer::ExtentBuffer;
use crate::extent_buffer_map::ExtentBufferMap;

/// Buffers, their policy metadata and what is known of the object's length
///
/// Cloning is cheap in bytes: the cloned map's buffers alias the same
/// storage.
#[derive(Debug, Clone, Default)]
pub(crate) struct VersionState {
    pub(crate) buffers: ExtentBufferMap,
    pub(crate) policy: PolicyTable,
    /// No byte of the object lies at or beyond this offset
    pub(crate) known_len: Option<u64>,
}

impl VersionState {
    /// Merge `buffer` into the map, keeping policy metadata in step
    pub(crate) fn merge(
        &mut self,
        buffer: ExtentBuffer,
        provenance: Provenance,
        merge: PolicyMerge,
    ) -> Result<()> {
        if buffer.is_vacuous() {
            return Ok(());
        }

        let extent = buffer.extent();
        let displaced: Vec<(Extent, Option<PolicyInfo>)> = self
            .buffers
            .get_overlapping(&extent)
            .iter()
            .map(|b| (b.extent(), self.policy.get(&b.start()).copied()))
            .collect();

        self.buffers.replace_extents(buffer)?;
        for (gone, _) in &displaced {
            self.policy.remove(&gone.start());
        }

        let info = match merge {
            PolicyMerge::Fresh => PolicyInfo::new(provenance),
            PolicyMerge::Inherit => displaced
                .iter()
                .filter_map(|(_, info)| *info)
                .max_by_key(|info| info.reference_time())
                .map(|info| info.inherited(provenance))
                .unwrap_or_else(|| PolicyInfo::new(provenance)),
        };
        self.policy.insert(extent.start(), info);

        // Protruding remainders keep the metadata of the chunk they came from
        if let Some((first, Some(info))) = displaced.first() {
            if first.start() < extent.start() {
                self.policy.insert(first.start(), *info);
            }
        }
        if let (Some((last, Some(info))), ExtentEnd::Bounded(end)) = (displaced.last(), extent.end())
        {
            if last.end() > ExtentEnd::Bounded(end) {
                self.policy.insert(end, *info);
            }
        }
        Ok(())
    }

    /// Narrow the known object length
    pub(crate) fn learn_len(&mut self, len: u64) {
        self.known_len = Some(self.known_len.map_or(len, |known| known.min(len)));
    }

    /// `extent` clipped to the known object length
    pub(crate) fn clip(&self, extent: &Extent) -> Extent {
        match self.known_len {
            Some(len) => extent.clip_end(len),
            None => *extent,
        }
    }

    /// State of the object after truncation to `new_len` bytes
    pub(crate) fn truncated(&self, new_len: u64) -> Result<VersionState> {
        let buffers = self.buffers.intersect(&Extent::bounded(0, new_len)?)?;
        let policy = buffers
            .iter()
            .filter_map(|b| self.policy.get(&b.start()).map(|info| (b.start(), *info)))
            .collect();
        Ok(VersionState {
            buffers,
            policy,
            known_len: Some(new_len),
        })
    }

    /// Record a use of every chunk overlapping `extent`
    pub(crate) fn touch(&mut self, extent: &Extent) {
        for buffer in self.buffers.get_overlapping(extent) {
            if let Some(info) = self.policy.get_mut(&buffer.start()) {
                info.touch();
            }
        }
    }

    /// Metadata of the chunk covering `offset`
    pub(crate) fn policy_at(&self, offset: u64) -> Option<PolicyInfo> {
        let buffer = self.buffers.get_extent(offset).ok().flatten()?;
        self.policy.get(&buffer.start()).copied()
    }

    /// First cached chunk that has no metadata
    pub(crate) fn missing_policy(&self) -> Option<Extent> {
        self.buffers
            .iter()
            .find(|b| !self.policy.contains_key(&b.start()))
            .map(|b| b.extent())
    }
}
