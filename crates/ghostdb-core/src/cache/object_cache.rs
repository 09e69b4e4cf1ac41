//! Ghost/active object cache with LRU ghostification.

use super::weak::{EvictionHook, WeakHandle};
use crate::clock::{elapsed_since, DayClock, SystemDayClock};
use crate::error::{Error, Result};
use crate::oid::ObjectId;
use crate::persistent::Persistent;
use crossbeam_channel::{Receiver, Sender};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::debug;

/// Entry counts, derived from the map sizes on every call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    /// Entries in the ghost map.
    pub ghost_count: usize,
    /// Entries in the active map.
    pub active_count: usize,
}

/// Outcome of one [`ObjectCache::shrink`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShrinkReport {
    /// Objects moved to the ghost map.
    pub ghostified: usize,
    /// Objects that refused to deactivate and stay active.
    pub declined: usize,
    /// Entries dropped because their object no longer exists.
    pub evicted: usize,
}

/// Cache of persistent objects keyed by object id.
///
/// Every known id lives in exactly one of two maps: ghosts (placeholders
/// without state) or active (materialized). Entries hold weak handles only.
///
/// The cache does no locking of its own. Mutating methods take `&mut self`,
/// so the owner serializes them behind one coarse lock.
pub struct ObjectCache<T: ?Sized + Persistent = dyn Persistent> {
    ghosts: FxHashMap<ObjectId, WeakHandle<T>>,
    active: FxHashMap<ObjectId, WeakHandle<T>>,
    clock: Arc<dyn DayClock>,
    notices_tx: Sender<ObjectId>,
    notices_rx: Receiver<ObjectId>,
}

impl<T: ?Sized + Persistent> ObjectCache<T> {
    /// Creates an empty cache reading access ages from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn DayClock>) -> Self {
        let (notices_tx, notices_rx) = crossbeam_channel::unbounded();
        Self {
            ghosts: FxHashMap::default(),
            active: FxHashMap::default(),
            clock,
            notices_tx,
            notices_rx,
        }
    }

    /// Creates an empty cache on the wall clock.
    #[must_use]
    pub fn with_system_clock() -> Self {
        Self::new(Arc::new(SystemDayClock))
    }

    /// Looks up an object, ghost map first.
    ///
    /// Returns `None` if the id is unknown or its object has been dropped;
    /// callers that expect possible absence supply their own default.
    #[must_use]
    pub fn get(&self, oid: ObjectId) -> Option<Arc<T>> {
        self.ghosts
            .get(&oid)
            .or_else(|| self.active.get(&oid))
            .and_then(WeakHandle::upgrade)
    }

    /// Like [`get`](Self::get), returning `default` when the lookup misses.
    #[must_use]
    pub fn get_or(&self, oid: ObjectId, default: Arc<T>) -> Arc<T> {
        self.get(oid).unwrap_or(default)
    }

    /// Stores `obj` under `oid`, in the ghost or active map according to its
    /// current state. Replaces any previous entry for `oid`.
    pub fn set(&mut self, oid: ObjectId, obj: &Arc<T>) {
        self.process_evictions();
        self.ghosts.remove(&oid);
        self.active.remove(&oid);

        obj.attach_eviction_hook(EvictionHook::new(oid, self.notices_tx.clone()));
        let handle = WeakHandle::new(obj);
        if obj.is_ghost() {
            self.ghosts.insert(oid, handle);
        } else {
            self.active.insert(oid, handle);
        }
    }

    /// Removes `oid` from whichever map holds it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the id is in neither map.
    pub fn remove(&mut self, oid: ObjectId) -> Result<()> {
        self.process_evictions();
        if self.ghosts.remove(&oid).is_some() || self.active.remove(&oid).is_some() {
            Ok(())
        } else {
            Err(Error::KeyNotFound(oid))
        }
    }

    /// Moves a ghost entry to the active map. No-op if already active.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the id is in neither map.
    pub fn activate(&mut self, oid: ObjectId) -> Result<()> {
        self.process_evictions();
        if self.active.contains_key(&oid) {
            return Ok(());
        }
        match self.ghosts.remove(&oid) {
            Some(handle) => {
                self.active.insert(oid, handle);
                Ok(())
            }
            None => Err(Error::KeyNotFound(oid)),
        }
    }

    /// Ghostifies least-recently-used and long-idle objects.
    ///
    /// If more than `target_size` objects are active, the oldest
    /// `active - target_size` are asked to deactivate. Independently, every
    /// object idle for at least `inactive_secs` is asked too. Objects that
    /// decline stay active.
    pub fn shrink(&mut self, target_size: usize, inactive_secs: u32) -> ShrinkReport {
        let mut report = ShrinkReport {
            evicted: self.process_evictions(),
            ..ShrinkReport::default()
        };
        if self.active.is_empty() {
            return report;
        }

        let now = self.clock.seconds_of_day();
        let mut ages: Vec<(ObjectId, u32)> = Vec::with_capacity(self.active.len());
        let mut dead = Vec::new();
        for (&oid, handle) in &self.active {
            match handle.upgrade() {
                Some(obj) => ages.push((oid, elapsed_since(obj.access_time(), now))),
                None => dead.push(oid),
            }
        }
        for oid in dead {
            self.active.remove(&oid);
            report.evicted += 1;
        }

        // Oldest first; ties broken by id so passes are reproducible.
        ages.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let overflow = ages.len().saturating_sub(target_size);

        for (rank, &(oid, age)) in ages.iter().enumerate() {
            if rank >= overflow && age < inactive_secs {
                continue;
            }
            match self.ghostify(oid, false) {
                Some(true) => report.ghostified += 1,
                Some(false) => report.declined += 1,
                None => report.evicted += 1,
            }
        }

        debug!(
            now,
            target_size,
            inactive_secs,
            ghostified = report.ghostified,
            declined = report.declined,
            evicted = report.evicted,
            active = self.active.len(),
            "cache shrink pass"
        );
        report
    }

    /// Forces an active object into the ghost state. No-op if not active.
    pub fn invalidate(&mut self, oid: ObjectId) {
        self.process_evictions();
        self.ghostify(oid, true);
    }

    /// Invalidates every id in `oids`.
    pub fn invalidate_all<I>(&mut self, oids: I)
    where
        I: IntoIterator<Item = ObjectId>,
    {
        self.process_evictions();
        for oid in oids {
            self.ghostify(oid, true);
        }
    }

    /// Invalidates every active object.
    pub fn clear(&mut self) {
        let oids: Vec<ObjectId> = self.active.keys().copied().collect();
        self.invalidate_all(oids);
    }

    /// Current ghost and active counts.
    #[must_use]
    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            ghost_count: self.ghosts.len(),
            active_count: self.active.len(),
        }
    }

    /// Total number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ghosts.len() + self.active.len()
    }

    /// Returns true if the cache has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ghosts.is_empty() && self.active.is_empty()
    }

    /// Returns true if `oid` is in either map.
    #[must_use]
    pub fn contains(&self, oid: ObjectId) -> bool {
        self.ghosts.contains_key(&oid) || self.active.contains_key(&oid)
    }

    /// Returns true if `oid` is in the active map.
    #[must_use]
    pub fn is_active(&self, oid: ObjectId) -> bool {
        self.active.contains_key(&oid)
    }

    /// Ids currently in the active map.
    #[must_use]
    pub fn active_ids(&self) -> Vec<ObjectId> {
        self.active.keys().copied().collect()
    }

    /// Applies pending eviction notices and returns how many entries were
    /// dropped.
    ///
    /// A notice only removes an entry whose object is really gone: the id may
    /// have been re-populated with a live object since the notice was sent,
    /// or removed already.
    pub fn process_evictions(&mut self) -> usize {
        let mut evicted = 0;
        while let Ok(oid) = self.notices_rx.try_recv() {
            for map in [&mut self.ghosts, &mut self.active] {
                if map.get(&oid).is_some_and(|h| !h.is_live()) {
                    map.remove(&oid);
                    evicted += 1;
                }
            }
        }
        evicted
    }

    /// Asks the object to deactivate and moves it to the ghost map if it did.
    ///
    /// Returns `None` when the id is not active or its object is gone (the
    /// stale entry is dropped), otherwise whether the object is now a ghost.
    fn ghostify(&mut self, oid: ObjectId, force: bool) -> Option<bool> {
        let upgraded = self.active.get(&oid)?.upgrade();
        let obj = match upgraded {
            Some(obj) => obj,
            None => {
                self.active.remove(&oid);
                return None;
            }
        };
        if !obj.deactivate(force) {
            return Some(false);
        }
        if let Some(handle) = self.active.remove(&oid) {
            self.ghosts.insert(oid, handle);
        }
        Some(true)
    }
}

impl<T: ?Sized + Persistent> Default for ObjectCache<T> {
    fn default() -> Self {
        Self::with_system_clock()
    }
}
