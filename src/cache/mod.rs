//! Versioned range cache over a slow backing store
//!
//! A [`BufferCache`] remembers, per object version, which byte ranges it has
//! seen and serves reads from that knowledge, fetching only the missing
//! ranges. Concurrent reads that need overlapping missing bytes of the same
//! version share one fetch: the first reader registers the fetch and calls
//! the backing store (outside every cache lock), later readers wait for its
//! outcome.
//!
//! New versions are derived from old ones with predicated operations. The
//! old version's map is never mutated; the new map shares its buffers. Read
//! results are read-only views, so callers cannot reach cached bytes through
//! them either.
//!
//! [`read_ahead`](BufferCache::read_ahead) starts fetching missing bytes on a
//! background thread and returns at once; reads that arrive later wait on
//! those fetches like on any other.
//!
//! # Example
//!
//! ```
//! use extent_cache::{BufferCache, Extent, ExtentBuffer, Fetched};
//!
//! let object = b"0123456789abcdefghijklmnopqrstuvwxyz";
//! let cache: BufferCache<u32> = BufferCache::new();
//!
//! let read = cache
//!     .read(&1, &Extent::bounded(0, 10)?, |wanted: &Extent| -> anyhow::Result<Fetched<u32>> {
//!         let start = wanted.start() as usize;
//!         let end = wanted.end().bounded().unwrap_or(u64::MAX).min(object.len() as u64) as usize;
//!         let bytes = object.get(start..end.max(start)).unwrap_or_default();
//!         Ok(Fetched {
//!             version: 1,
//!             buffer: ExtentBuffer::wrap(wanted.start(), bytes.to_vec())?,
//!         })
//!     })?;
//! assert_eq!(read.buffer.to_vec(), b"0123456789");
//! # Ok::<(), extent_cache::CacheError>(())
//! ```

mod pending;
mod policy;
mod stats;
mod version;

pub use policy::{PolicyInfo, PolicyMerge, Provenance};
pub use stats::CacheStats;

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::extent::{BufferableExtent, Extent, ExtentEnd, HasExtent};
use crate::extent_buffer::ExtentBuffer;
use crate::extent_buffer_map::ExtentBufferMap;
use crate::streamer::ExtentBufferStreamer;
use anyhow::anyhow;
use parking_lot::{Mutex, RwLock};
use pending::{Claim, FetchOutcome, FetchTicket, PendingTable};
use stats::StatsRecorder;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};
use version::VersionState;

/// What a backing store returns for a requested extent
#[derive(Debug, Clone)]
pub struct Fetched<V> {
    /// The version the bytes belong to, which may differ from the one asked for
    pub version: V,
    /// Bytes starting at the requested start; shorter than requested at the
    /// end of the object
    pub buffer: ExtentBuffer,
}

/// Source of bytes for cache misses
///
/// Any `FnMut(&Extent) -> anyhow::Result<Fetched<V>>` closure is a fetcher.
/// The returned buffer's `[position, limit)` window must start at the
/// requested start and must not reach past the requested end.
pub trait Fetcher<V> {
    fn fetch(&mut self, extent: &Extent) -> anyhow::Result<Fetched<V>>;
}

impl<V, F> Fetcher<V> for F
where
    F: FnMut(&Extent) -> anyhow::Result<Fetched<V>>,
{
    fn fetch(&mut self, extent: &Extent) -> anyhow::Result<Fetched<V>> {
        self(extent)
    }
}

/// The bytes of a read, paired with the version they belong to
#[derive(Debug, Clone)]
pub struct ReadResult<V> {
    pub version: V,
    pub buffer: ExtentBuffer,
}

struct VersionEntry {
    state: Arc<Mutex<VersionState>>,
    /// Creation order, for `flush(true)`
    seq: u64,
}

/// A cache of partially known object versions
pub struct BufferCache<V> {
    config: CacheConfig,
    enabled: AtomicBool,
    versions: RwLock<HashMap<V, VersionEntry>>,
    next_seq: AtomicU64,
    pending: Arc<PendingTable<V>>,
    stats: StatsRecorder,
}

impl<V> fmt::Debug for BufferCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferCache")
            .field("config", &self.config)
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .field("versions", &self.versions.read().len())
            .finish()
    }
}

impl<V: Clone + Eq + Hash + fmt::Debug> Default for BufferCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Eq + Hash + fmt::Debug> BufferCache<V> {
    /// Create a cache with the default configuration
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        BufferCache {
            enabled: AtomicBool::new(config.enabled),
            config,
            versions: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            pending: Arc::new(PendingTable::default()),
            stats: StatsRecorder::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Read `desired` of `version`, fetching whatever is not cached
    ///
    /// The result covers `desired` clipped to the end of the object; a read
    /// entirely past the end, or of zero length, yields a vacuous buffer. When
    /// a single cached buffer covers exactly the clipped extent the result
    /// aliases the cached storage; otherwise it is a fresh buffer. Either way
    /// the result is read-only.
    ///
    /// If the fetcher reports a different version, the read continues
    /// against that version and the result is paired with it. A fetch
    /// failure is returned as [`CacheError::FetchFailed`], carrying the same
    /// error that every reader waiting on that fetch receives.
    pub fn read<F: Fetcher<V>>(
        &self,
        version: &V,
        desired: &Extent,
        mut fetch: F,
    ) -> Result<ReadResult<V>> {
        BufferableExtent::try_from(*desired)?;
        self.stats.record(|s| s.reads += 1);

        if desired.is_vacuous() {
            self.stats.record(|s| s.hits += 1);
            return Ok(ReadResult {
                version: version.clone(),
                buffer: ExtentBuffer::vacuous(desired.start())?.as_read_only(),
            });
        }

        let mut version = version.clone();
        // Everything this read fetched or received, in case the cache drops
        // it (disabled, flushed) before the read finishes
        let mut overlay = ExtentBufferMap::new();
        let mut missed = false;
        let mut acquired = 0u64;

        loop {
            let state = self.state_of(&version);
            let (target, mut view) = {
                let state = state.lock();
                let target = state.clip(desired);
                (target, state.buffers.intersect(&target)?)
            };
            for buffer in overlay.intersect(&target)? {
                view.replace_extents(buffer)?;
            }

            let gap = match view.gaps_within(&target).into_iter().next() {
                Some(gap) => gap,
                None => {
                    let from_cache = target.len().saturating_sub(acquired);
                    let buffer = self.assemble(&target, view)?;
                    state.lock().touch(&target);
                    self.stats.record(|s| {
                        s.hits += u64::from(!missed);
                        s.bytes_read += target.len();
                        s.bytes_cached += from_cache;
                    });
                    debug!(
                        "Read {} of version {:?} ({})",
                        target,
                        version,
                        if missed { "miss" } else { "hit" }
                    );
                    return Ok(ReadResult { version, buffer });
                }
            };

            let claim = self
                .pending
                .claim(&version, &gap, |gap| Self::still_missing(&state, gap));
            let outcome = match claim {
                Claim::Covered => continue,
                Claim::Wait(slot) => {
                    debug!("Waiting on in-flight fetch for {} of version {:?}", gap, version);
                    missed = true;
                    self.stats.record(|s| s.coalesced += 1);
                    slot.wait()
                }
                Claim::Fetch(ticket) => {
                    missed = true;
                    self.fetch_gap(&version, ticket, &mut fetch)
                }
            };

            match outcome {
                FetchOutcome::Completed {
                    version: fetched,
                    buffer,
                } => {
                    if fetched != version {
                        debug!("Read of {:?} continues against version {:?}", version, fetched);
                        version = fetched;
                        overlay.clear();
                    }
                    acquired += buffer.remaining() as u64;
                    overlay.replace_extents(buffer)?;
                }
                FetchOutcome::Failed(error) => return Err(CacheError::FetchFailed(error)),
            }
        }
    }

    /// The first part of `gap` that the version's map still lacks
    fn still_missing(state: &Mutex<VersionState>, gap: &Extent) -> Option<Extent> {
        let state = state.lock();
        let gap = state.clip(gap);
        state.buffers.gaps_within(&gap).into_iter().next()
    }

    /// Call the fetcher for the ticket's extent and resolve the ticket
    fn fetch_gap<F: Fetcher<V>>(
        &self,
        version: &V,
        ticket: FetchTicket<V>,
        fetch: &mut F,
    ) -> FetchOutcome<V> {
        let gap = *ticket.extent();
        debug!("Fetching {} of version {:?}", gap, version);

        let result = fetch.fetch(&gap).and_then(|fetched| {
            let data = if fetched.buffer.has_remaining() {
                fetched.buffer.slice()
            } else {
                ExtentBuffer::vacuous(gap.start())?
            };
            if !data.is_vacuous() && (data.start() != gap.start() || !gap.contains(&data)) {
                return Err(anyhow!(
                    "fetched buffer {} does not lie within requested {}",
                    data.extent(),
                    gap
                ));
            }
            self.absorb(&fetched.version, &gap, &data)?;
            Ok((fetched.version, data))
        });

        match result {
            Ok((fetched, data)) => {
                self.stats.record(|s| {
                    s.fetches += 1;
                    s.bytes_fetched += data.remaining() as u64;
                });
                ticket.complete(fetched.clone(), data.duplicate());
                FetchOutcome::Completed {
                    version: fetched,
                    buffer: data,
                }
            }
            Err(error) => {
                warn!("Fetch of {} for version {:?} failed: {:#}", gap, version, error);
                self.stats.record(|s| {
                    s.fetches += 1;
                    s.fetch_failures += 1;
                });
                let error = Arc::new(error);
                ticket.fail(Arc::clone(&error));
                FetchOutcome::Failed(error)
            }
        }
    }

    /// Record freshly fetched `data` for the requested `gap` of `version`
    fn absorb(&self, version: &V, gap: &Extent, data: &ExtentBuffer) -> Result<()> {
        let state = self.state_of(version);
        let mut state = state.lock();

        let got = data.remaining() as u64;
        if got < gap.len() {
            state.learn_len(gap.start() + got);
        }
        if self.is_enabled() {
            state.merge(data.duplicate(), Provenance::Fetched, self.config.policy_merge)?;
        }
        Ok(())
    }

    /// The result buffer for `target`, given a view that covers it
    fn assemble(&self, target: &Extent, view: ExtentBufferMap) -> Result<ExtentBuffer> {
        if view.len() == 1 {
            if let Some(only) = view.first() {
                if only.extent() == *target && only.position() == 0 && only.limit() == only.capacity()
                {
                    return Ok(only.as_read_only());
                }
            }
        }
        let bounds = BufferableExtent::try_from(*target)?;
        let bytes = ExtentBufferStreamer::new(bounds, view)?
            .with_fill_byte(self.config.fill_byte)
            .render();
        Ok(ExtentBuffer::wrap(target.start(), bytes)?.as_read_only())
    }

    /// Create `new` as `old` with `buffer` written over it
    ///
    /// The `[position, limit)` window of `buffer` is what gets written. Fails
    /// with [`CacheError::VersionExists`] if `new` is already cached. If
    /// nothing of `old` is cached, `new` starts out holding only `buffer`.
    pub fn predicated_write(&self, old: &V, new: &V, buffer: ExtentBuffer) -> Result<()> {
        let data = if buffer.has_remaining() {
            buffer.slice()
        } else {
            ExtentBuffer::vacuous(buffer.start())?
        };
        let mut versions = self.versions.write();
        if versions.contains_key(new) {
            return Err(CacheError::VersionExists(format!("{:?}", new)));
        }

        let mut state = match versions.get(old) {
            Some(entry) => entry.state.lock().clone(),
            None => VersionState::default(),
        };
        state.merge(data.duplicate(), Provenance::Written, self.config.policy_merge)?;
        if let Some(len) = state.known_len {
            state.known_len = match data.end_offset() {
                ExtentEnd::Bounded(end) if !data.is_vacuous() => Some(len.max(end)),
                ExtentEnd::Bounded(_) => Some(len),
                ExtentEnd::Unbounded => None,
            };
        }

        versions.insert(new.clone(), self.entry(state));
        drop(versions);

        info!(
            "Predicated write of {} derived version {:?} from {:?}",
            data.extent(),
            new,
            old
        );
        self.stats.record(|s| {
            s.writes += 1;
            s.bytes_written += data.remaining() as u64;
        });
        Ok(())
    }

    /// Create `new` as `old` truncated (or extended) to `new_len` bytes
    pub fn predicated_truncate(&self, old: &V, new: &V, new_len: u64) -> Result<()> {
        let mut versions = self.versions.write();
        if versions.contains_key(new) {
            return Err(CacheError::VersionExists(format!("{:?}", new)));
        }

        let state = match versions.get(old) {
            Some(entry) => entry.state.lock().truncated(new_len)?,
            None => VersionState::default().truncated(new_len)?,
        };
        versions.insert(new.clone(), self.entry(state));
        drop(versions);

        info!(
            "Predicated truncate to {} derived version {:?} from {:?}",
            new_len, new, old
        );
        self.stats.record(|s| s.truncates += 1);
        Ok(())
    }

    /// Create `new` as a version with the same bytes as `old`
    ///
    /// The two versions share one map from then on, so data fetched for
    /// either serves reads of both.
    pub fn predicated_attribute_change(&self, old: &V, new: &V) -> Result<()> {
        let mut versions = self.versions.write();
        if versions.contains_key(new) {
            return Err(CacheError::VersionExists(format!("{:?}", new)));
        }

        if let Some(state) = versions.get(old).map(|entry| Arc::clone(&entry.state)) {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            versions.insert(new.clone(), VersionEntry { state, seq });
        }
        drop(versions);

        info!("Attribute change derived version {:?} from {:?}", new, old);
        self.stats.record(|s| s.attribute_changes += 1);
        Ok(())
    }

    /// Drop cached versions
    ///
    /// With `retain_latest`, the most recently created version survives.
    /// Reads in progress still complete correctly.
    pub fn flush(&self, retain_latest: bool) {
        let mut versions = self.versions.write();
        let before = versions.len();
        let keep = if retain_latest {
            versions.values().map(|entry| entry.seq).max()
        } else {
            None
        };
        versions.retain(|_, entry| Some(entry.seq) == keep);
        info!("Flushed {} of {} cached versions", before - versions.len(), before);
    }

    /// Drop one version, returning whether it was cached
    pub fn evict(&self, version: &V) -> bool {
        let removed = self.versions.write().remove(version).is_some();
        if removed {
            debug!("Evicted version {:?}", version);
        }
        removed
    }

    /// Whether `extent` of `version` is cached
    ///
    /// With `entire`, every position up to the known end of the object must
    /// be cached; otherwise any cached position suffices.
    pub fn is_cached(&self, version: &V, extent: &Extent, entire: bool) -> bool {
        let state = match self.existing_state(version) {
            Some(state) => state,
            None => return false,
        };
        let state = state.lock();
        let target = state.clip(extent);
        if entire {
            state.buffers.gaps_within(&target).is_empty()
        } else {
            !state.buffers.get_overlapping(&target).is_empty()
        }
    }

    /// Check that every cached chunk of `version` has policy metadata
    pub fn verify_policy_info(&self, version: &V) -> Result<()> {
        let state = match self.existing_state(version) {
            Some(state) => state,
            None => return Ok(()),
        };
        let missing = state.lock().missing_policy();
        match missing {
            Some(extent) => Err(CacheError::MissingPolicyInfo {
                version: format!("{:?}", version),
                extent: extent.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Policy metadata of the chunk of `version` covering `offset`
    pub fn policy_info(&self, version: &V, offset: u64) -> Option<PolicyInfo> {
        self.existing_state(version)?.lock().policy_at(offset)
    }

    /// Extents of the cached chunks of `version`, in offset order
    pub fn cached_extents(&self, version: &V) -> Vec<Extent> {
        match self.existing_state(version) {
            Some(state) => state.lock().buffers.iter().map(|b| b.extent()).collect(),
            None => Vec::new(),
        }
    }

    /// The object length learned for `version`, if any
    pub fn known_length(&self, version: &V) -> Option<u64> {
        self.existing_state(version)?.lock().known_len
    }

    /// Number of versions with cached state
    pub fn version_count(&self) -> usize {
        self.versions.read().len()
    }

    /// Number of fetches currently in flight
    pub fn pending_fetches(&self) -> usize {
        self.pending.in_flight()
    }

    /// Turn retention of fetched data on or off
    ///
    /// While disabled, reads still use data already cached.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        info!("Buffer cache {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    fn entry(&self, state: VersionState) -> VersionEntry {
        VersionEntry {
            state: Arc::new(Mutex::new(state)),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn existing_state(&self, version: &V) -> Option<Arc<Mutex<VersionState>>> {
        self.versions
            .read()
            .get(version)
            .map(|entry| Arc::clone(&entry.state))
    }

    fn state_of(&self, version: &V) -> Arc<Mutex<VersionState>> {
        if let Some(state) = self.existing_state(version) {
            return state;
        }
        let mut versions = self.versions.write();
        if let Some(entry) = versions.get(version) {
            return Arc::clone(&entry.state);
        }
        let entry = self.entry(VersionState::default());
        let state = Arc::clone(&entry.state);
        versions.insert(version.clone(), entry);
        state
    }
}

impl<V> BufferCache<V>
where
    V: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    /// Start fetching the missing parts of `desired` without waiting
    ///
    /// Every missing gap is registered as an in-flight fetch before this
    /// returns, so reads issued afterwards wait on it instead of fetching.
    /// Gaps that overlap a fetch already in flight are left to that fetch.
    /// The fetches run one after another on a spawned thread; a failure is
    /// logged and delivered to whichever reads are waiting on it.
    ///
    /// Returns the thread's handle, or `None` when nothing had to be fetched.
    pub fn read_ahead<F>(
        self: &Arc<Self>,
        version: &V,
        desired: &Extent,
        fetch: F,
    ) -> Result<Option<JoinHandle<()>>>
    where
        F: Fetcher<V> + Send + 'static,
    {
        BufferableExtent::try_from(*desired)?;

        let state = self.state_of(version);
        let gaps = {
            let state = state.lock();
            let target = state.clip(desired);
            state.buffers.gaps_within(&target)
        };

        let cached = gaps.is_empty();
        let tickets: Vec<FetchTicket<V>> = gaps
            .iter()
            .filter_map(|gap| {
                match self
                    .pending
                    .claim(version, gap, |gap| Self::still_missing(&state, gap))
                {
                    Claim::Fetch(ticket) => Some(ticket),
                    Claim::Covered | Claim::Wait(_) => None,
                }
            })
            .collect();

        self.stats.record(|s| {
            s.reads += 1;
            s.async_reads += 1;
            s.hits += u64::from(cached);
        });

        if tickets.is_empty() {
            debug!("Read-ahead of {} for version {:?} needs no fetch", desired, version);
            return Ok(None);
        }

        debug!(
            "Read-ahead of {} for version {:?} starts {} fetch(es)",
            desired,
            version,
            tickets.len()
        );
        let cache = Arc::clone(self);
        let version = version.clone();
        let mut fetch = fetch;
        Ok(Some(thread::spawn(move || {
            for ticket in tickets {
                cache.fetch_gap(&version, ticket, &mut fetch);
            }
        })))
    }
}

/// Builder for [`BufferCache`]
#[derive(Debug, Clone, Default)]
pub struct BufferCacheBuilder {
    config: CacheConfig,
}

impl BufferCacheBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Retain fetched data (the default)
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Byte used for positions no buffer supplies
    pub fn fill_byte(mut self, fill_byte: u8) -> Self {
        self.config.fill_byte = fill_byte;
        self
    }

    pub fn policy_merge(mut self, policy_merge: PolicyMerge) -> Self {
        self.config.policy_merge = policy_merge;
        self
    }

    pub fn build<V: Clone + Eq + Hash + fmt::Debug>(self) -> BufferCache<V> {
        debug!("Building buffer cache with {:?}", self.config);
        BufferCache::with_config(self.config)
    }
}
