//! In-flight fetch coordination
//!
//! Each fetch a cache issues is registered under `(version, extent)` before
//! the backing store is called. A read that finds an overlapping registration
//! for its version waits on it instead of fetching again. Checking for an
//! overlap, re-checking what is still missing from the version's map and
//! registering a new fetch all happen under one lock. A fetch publishes its
//! data before it unregisters, so two readers can never both decide to fetch
//! the same bytes.
//!
//! A fetch moves through Pending to either Completed or Failed exactly once;
//! waiters observe the final state through a condition variable.

use crate::error::SharedError;
use crate::extent::{Extent, HasExtent};
use crate::extent_buffer::ExtentBuffer;
use crate::extent_map::ExtentMap;
use anyhow::anyhow;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Final state of a fetch as seen by waiters
#[derive(Debug, Clone)]
pub(crate) enum FetchOutcome<V> {
    Completed { version: V, buffer: ExtentBuffer },
    Failed(SharedError),
}

/// Rendezvous point between a fetching thread and its waiters
#[derive(Debug)]
pub(crate) struct FetchSlot<V> {
    state: Mutex<Option<FetchOutcome<V>>>,
    resolved: Condvar,
}

impl<V: Clone> FetchSlot<V> {
    fn new() -> Self {
        FetchSlot {
            state: Mutex::new(None),
            resolved: Condvar::new(),
        }
    }

    fn resolve(&self, outcome: FetchOutcome<V>) {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(outcome);
        }
        self.resolved.notify_all();
    }

    /// Block until the fetch completes or fails
    pub(crate) fn wait(&self) -> FetchOutcome<V> {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = state.as_ref() {
                return outcome.clone();
            }
            self.resolved.wait(&mut state);
        }
    }
}

/// A registered fetch, as stored in the pending table
#[derive(Debug)]
struct PendingFetch<V> {
    extent: Extent,
    slot: Arc<FetchSlot<V>>,
}

impl<V> Clone for PendingFetch<V> {
    fn clone(&self) -> Self {
        PendingFetch {
            extent: self.extent,
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<V> HasExtent for PendingFetch<V> {
    fn extent(&self) -> Extent {
        self.extent
    }
}

/// What a reader should do about a gap
pub(crate) enum Claim<V: Clone + Eq + Hash> {
    /// The gap was filled since the reader last looked
    Covered,
    /// Another reader is already fetching overlapping bytes
    Wait(Arc<FetchSlot<V>>),
    /// This reader owns the fetch and must resolve the ticket
    Fetch(FetchTicket<V>),
}

/// All in-flight fetches, per version
#[derive(Debug)]
pub(crate) struct PendingTable<V> {
    inner: Mutex<HashMap<V, ExtentMap<PendingFetch<V>>>>,
}

impl<V> Default for PendingTable<V> {
    fn default() -> Self {
        PendingTable {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone + Eq + Hash> PendingTable<V> {
    /// Join an overlapping fetch of `version`, or register a new one
    ///
    /// `still_missing` is called with `extent` while the table is locked and
    /// returns the part of it that still has to be fetched, if any. Only that
    /// part is registered.
    pub(crate) fn claim(
        self: &Arc<Self>,
        version: &V,
        extent: &Extent,
        still_missing: impl FnOnce(&Extent) -> Option<Extent>,
    ) -> Claim<V> {
        let mut inner = self.inner.lock();

        let joined = inner.get(version).and_then(|fetches| {
            fetches
                .get_overlapping(extent)
                .first()
                .map(|existing| Arc::clone(&existing.slot))
        });
        if let Some(slot) = joined {
            return Claim::Wait(slot);
        }

        let extent = match still_missing(extent) {
            Some(missing) => missing,
            None => return Claim::Covered,
        };

        let slot = Arc::new(FetchSlot::new());
        let registered = inner.entry(version.clone()).or_default().put(PendingFetch {
            extent,
            slot: Arc::clone(&slot),
        });
        debug_assert!(registered.is_ok());

        Claim::Fetch(FetchTicket {
            table: Arc::clone(self),
            version: version.clone(),
            extent,
            slot,
            resolved: false,
        })
    }

    fn release(&self, version: &V, extent: &Extent) {
        let mut inner = self.inner.lock();
        if let Some(fetches) = inner.get_mut(version) {
            fetches.remove(extent.start());
            if fetches.is_empty() {
                inner.remove(version);
            }
        }
    }

    /// Number of fetches currently registered
    pub(crate) fn in_flight(&self) -> usize {
        self.inner.lock().values().map(|fetches| fetches.len()).sum()
    }
}

/// Ownership of one registered fetch
///
/// Resolving the ticket unregisters the fetch and wakes its waiters. A ticket
/// dropped without being resolved (the fetch panicked) fails the fetch so
/// that waiters are not stranded.
pub(crate) struct FetchTicket<V: Clone + Eq + Hash> {
    table: Arc<PendingTable<V>>,
    version: V,
    extent: Extent,
    slot: Arc<FetchSlot<V>>,
    resolved: bool,
}

impl<V: Clone + Eq + Hash> FetchTicket<V> {
    pub(crate) fn extent(&self) -> &Extent {
        &self.extent
    }

    pub(crate) fn complete(mut self, version: V, buffer: ExtentBuffer) {
        self.finish(FetchOutcome::Completed { version, buffer });
    }

    pub(crate) fn fail(mut self, error: SharedError) {
        self.finish(FetchOutcome::Failed(error));
    }

    fn finish(&mut self, outcome: FetchOutcome<V>) {
        self.resolved = true;
        self.table.release(&self.version, &self.extent);
        self.slot.resolve(outcome);
    }
}

impl<V: Clone + Eq + Hash> Drop for FetchTicket<V> {
    fn drop(&mut self) {
        if !self.resolved {
            let error = anyhow!("fetch of {} abandoned", self.extent);
            self.finish(FetchOutcome::Failed(Arc::new(error)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn ext(start: u64, end: u64) -> Extent {
        Extent::bounded(start, end).unwrap()
    }

    fn table() -> Arc<PendingTable<u32>> {
        Arc::new(PendingTable::default())
    }

    /// Claim with nothing cached: the whole extent is missing
    fn claim(table: &Arc<PendingTable<u32>>, version: u32, extent: Extent) -> Claim<u32> {
        table.claim(&version, &extent, |e| Some(*e))
    }

    fn ticket(claim: Claim<u32>) -> FetchTicket<u32> {
        match claim {
            Claim::Fetch(ticket) => ticket,
            _ => panic!("claim must fetch"),
        }
    }

    fn slot(claim: Claim<u32>) -> Arc<FetchSlot<u32>> {
        match claim {
            Claim::Wait(slot) => slot,
            _ => panic!("claim must wait"),
        }
    }

    #[test]
    fn test_overlapping_claim_waits() {
        let table = table();
        let first = ticket(claim(&table, 1, ext(0, 10)));
        assert!(matches!(claim(&table, 1, ext(5, 15)), Claim::Wait(_)));
        assert_eq!(table.in_flight(), 1);

        // Disjoint extents and other versions fetch independently
        let other = claim(&table, 1, ext(10, 20));
        assert!(matches!(other, Claim::Fetch(_)));
        let version2 = claim(&table, 2, ext(0, 10));
        assert!(matches!(version2, Claim::Fetch(_)));
        assert_eq!(table.in_flight(), 3);

        drop(other);
        drop(version2);
        first.complete(1, ExtentBuffer::wrap(0, b"0123456789".to_vec()).unwrap());
        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn test_claim_registers_only_what_is_missing() {
        let table = table();
        let narrowed = ticket(table.claim(&1, &ext(0, 10), |_| Some(ext(6, 10))));
        assert_eq!(*narrowed.extent(), ext(6, 10));

        // The bytes the map already holds are free for another claim
        assert!(matches!(claim(&table, 1, ext(0, 6)), Claim::Fetch(_)));
        drop(narrowed);
    }

    #[test]
    fn test_claim_of_filled_gap_is_covered() {
        let table = table();
        assert!(matches!(table.claim(&1, &ext(0, 10), |_| None), Claim::Covered));
        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn test_waiter_sees_completion() {
        let table = table();
        let fetch = ticket(claim(&table, 1, ext(0, 4)));
        let slot = slot(claim(&table, 1, ext(0, 4)));

        let waiter = thread::spawn(move || slot.wait());
        thread::sleep(Duration::from_millis(20));
        fetch.complete(7, ExtentBuffer::wrap(0, b"abcd".to_vec()).unwrap());

        match waiter.join().unwrap() {
            FetchOutcome::Completed { version, buffer } => {
                assert_eq!(version, 7);
                assert_eq!(buffer.to_vec(), b"abcd".to_vec());
            }
            FetchOutcome::Failed(e) => panic!("unexpected failure: {}", e),
        }
    }

    #[test]
    fn test_ticket_resolves_on_another_thread() {
        let table = table();
        let fetch = ticket(claim(&table, 1, ext(0, 4)));
        let slot = slot(claim(&table, 1, ext(1, 2)));

        thread::spawn(move || fetch.complete(1, ExtentBuffer::wrap(0, b"wxyz".to_vec()).unwrap()))
            .join()
            .unwrap();
        assert!(matches!(slot.wait(), FetchOutcome::Completed { .. }));
        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn test_dropped_ticket_fails_waiters() {
        let table = table();
        let fetch = ticket(claim(&table, 1, ext(0, 4)));
        let slot = slot(claim(&table, 1, ext(2, 3)));
        drop(fetch);
        assert!(matches!(slot.wait(), FetchOutcome::Failed(_)));
        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn test_failure_is_shared() {
        let table = table();
        let fetch = ticket(claim(&table, 1, ext(0, 4)));
        let slot = slot(claim(&table, 1, ext(0, 4)));
        let error: SharedError = Arc::new(anyhow!("backing store unreachable"));
        fetch.fail(Arc::clone(&error));
        match slot.wait() {
            FetchOutcome::Failed(seen) => assert!(Arc::ptr_eq(&seen, &error)),
            FetchOutcome::Completed { .. } => panic!("expected failure"),
        }
    }
}
