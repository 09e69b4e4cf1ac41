//! Database facade tying the log, the object cache and the resolver together.

use crate::cache::{CacheStatistics, ObjectCache, ShrinkReport};
use crate::clock::{DayClock, SystemDayClock};
use crate::codec;
use crate::config::GhostConfig;
use crate::conflict::{ClassMemo, ConflictResolver, MergeRegistry};
use crate::error::{ConflictReason, Error, Result};
use crate::oid::{ObjectId, Serial, Tid};
use crate::persistent::{Persistent, PersistentObject};
use crate::storage::{FileLog, PackStats, RecordWrite, TxnMeta};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Result of a successful store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreOutcome {
    /// Serial of the new revision.
    pub serial: Serial,
    /// Merged state, when the store went through conflict resolution.
    pub resolved: Option<Value>,
}

/// An object database: a transaction log with an object cache in front.
///
/// The log and the cache each sit behind a `parking_lot::Mutex`. Operations
/// needing both take the log lock first.
pub struct Database {
    config: GhostConfig,
    log: Mutex<FileLog>,
    cache: Mutex<ObjectCache<PersistentObject>>,
    resolver: ConflictResolver,
    clock: Arc<dyn DayClock>,
    next_oid: AtomicU64,
}

impl Database {
    /// Opens (or creates) the database described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the log cannot be
    /// opened.
    pub fn open(config: GhostConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemDayClock))
    }

    /// Like [`Self::open`], with the clock used for access times.
    ///
    /// # Errors
    ///
    /// See [`Self::open`].
    pub fn open_with_clock(config: GhostConfig, clock: Arc<dyn DayClock>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage.data_dir)?;
        let path = config.storage.log_path();
        let log =
            FileLog::open_or_create(&path)?.with_sync_on_commit(config.storage.sync_on_commit);

        let next_oid = log
            .object_ids()
            .last()
            .map_or(ObjectId::ROOT.0, |oid| oid.0)
            .saturating_add(1);
        info!(
            path = %path.display(),
            objects = log.object_count(),
            last_tid = %log.last_tid(),
            "database opened"
        );

        let resolver =
            ConflictResolver::new(Arc::new(MergeRegistry::new()), Arc::new(ClassMemo::new()));
        Ok(Self {
            log: Mutex::new(log),
            cache: Mutex::new(ObjectCache::new(Arc::clone(&clock))),
            resolver,
            clock,
            next_oid: AtomicU64::new(next_oid),
            config,
        })
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &GhostConfig {
        &self.config
    }

    /// Registry of merge strategies used on conflicts.
    #[must_use]
    pub fn registry(&self) -> &Arc<MergeRegistry> {
        self.resolver.registry()
    }

    /// Forgets classes memoized as unresolvable.
    pub fn reload_registry(&self) {
        self.resolver.reload_registry();
    }

    /// Allocates a fresh object id.
    pub fn new_oid(&self) -> ObjectId {
        ObjectId(self.next_oid.fetch_add(1, Ordering::Relaxed))
    }

    /// Tid of the last committed transaction.
    #[must_use]
    pub fn last_tid(&self) -> Tid {
        self.log.lock().last_tid()
    }

    /// Creates and commits a new object.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be encoded or written.
    pub fn create(&self, class: &str, state: Value) -> Result<Arc<PersistentObject>> {
        let obj = Arc::new(PersistentObject::new(self.new_oid(), class, state));
        self.commit(&obj)?;
        Ok(obj)
    }

    /// Returns the object for `oid`, loading it from the log if it is not
    /// cached or is a ghost.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectNotFound`] if the object has no live revision.
    pub fn get(&self, oid: ObjectId) -> Result<Arc<PersistentObject>> {
        let log = self.log.lock();
        let mut cache = self.cache.lock();
        let now = self.clock.seconds_of_day();

        if let Some(obj) = cache.get(oid) {
            if obj.is_ghost() {
                let (bytes, serial) = log.load(oid)?;
                let record = codec::decode_state(&bytes)?;
                obj.load(serial, record.state);
                cache.activate(oid)?;
                debug!(%oid, %serial, "unghostified object");
            }
            obj.touch(now);
            return Ok(obj);
        }

        let (bytes, serial) = log.load(oid)?;
        let record = codec::decode_state(&bytes)?;
        let obj = Arc::new(PersistentObject::loaded(oid, record.class, serial, record.state));
        obj.touch(now);
        cache.set(oid, &obj);
        Ok(obj)
    }

    /// Commits `state` for `oid`, expecting `expected_serial` to be the
    /// current revision.
    ///
    /// If another transaction committed first, the class's merge strategy
    /// resolves the conflict and the merged state is committed instead. A
    /// materialized cached copy of the object is refreshed with what was
    /// written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if the conflict cannot be resolved; the log
    /// is then unchanged.
    pub fn store(
        &self,
        oid: ObjectId,
        expected_serial: Option<Serial>,
        class: &str,
        state: &Value,
    ) -> Result<StoreOutcome> {
        let mut log = self.log.lock();
        let mut bytes = codec::encode_state(class, state)?;
        let mut resolved = None;

        let current = log.last_serial(oid)?;
        if current != expected_serial {
            let (Some(committed), Some(old)) = (current, expected_serial) else {
                return Err(Error::conflict(
                    oid,
                    ConflictReason::MergeFailed(format!(
                        "expected revision {expected_serial:?}, found {current:?}"
                    )),
                ));
            };
            let deadline = self
                .config
                .conflict
                .load_timeout()
                .map(|timeout| Instant::now() + timeout);
            bytes = self
                .resolver
                .resolve_with_deadline(&*log, oid, committed, old, &bytes, deadline)?;
            let merged = codec::decode_state(&bytes)?.state;
            debug!(%oid, %committed, %old, "conflict resolved");
            resolved = Some(merged);
        }

        let final_state = resolved.as_ref().unwrap_or(state);
        let refs = codec::references(final_state)?;
        let serial = log.append(&TxnMeta::default(), &[RecordWrite::store(oid, bytes, refs)])?;

        let cache = self.cache.lock();
        if let Some(obj) = cache.get(oid).filter(|obj| !obj.is_ghost()) {
            obj.load(serial, final_state.clone());
        }
        drop(cache);

        Ok(StoreOutcome { serial, resolved })
    }

    /// Commits the current state of `obj` and caches it.
    ///
    /// # Errors
    ///
    /// Returns an error if `obj` is a ghost or the store fails.
    pub fn commit(&self, obj: &Arc<PersistentObject>) -> Result<Serial> {
        let state = obj
            .state_data()
            .ok_or_else(|| Error::Storage(format!("cannot commit ghost {}", obj.oid())))?;
        let outcome = self.store(obj.oid(), obj.serial(), obj.class(), &state)?;
        match outcome.resolved {
            Some(merged) => obj.load(outcome.serial, merged),
            None => obj.mark_saved(outcome.serial),
        }
        obj.touch(self.clock.seconds_of_day());
        let mut cache = self.cache.lock();
        if !cache.get(obj.oid()).is_some_and(|cached| Arc::ptr_eq(&cached, obj)) {
            cache.set(obj.oid(), obj);
        }
        Ok(outcome.serial)
    }

    /// Uncreates `oid` and ghostifies any cached copy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectNotFound`] if the object has no live revision.
    pub fn delete(&self, oid: ObjectId) -> Result<Serial> {
        let mut log = self.log.lock();
        log.load(oid)?;
        let serial = log.append(&TxnMeta::default(), &[RecordWrite::uncreate(oid)])?;
        self.cache.lock().invalidate(oid);
        Ok(serial)
    }

    /// Force-ghostifies cached copies of `oids`, e.g. after another process
    /// committed them.
    pub fn invalidate<I>(&self, oids: I)
    where
        I: IntoIterator<Item = ObjectId>,
    {
        self.cache.lock().invalidate_all(oids);
    }

    /// Ghostifies cached objects using the configured size and idle limits.
    pub fn shrink_cache(&self) -> ShrinkReport {
        let limits = &self.config.cache;
        self.cache
            .lock()
            .shrink(limits.target_size, limits.inactive_seconds)
    }

    /// Ghost and active counts, after dropping entries of collected objects.
    pub fn cache_statistics(&self) -> CacheStatistics {
        let mut cache = self.cache.lock();
        cache.process_evictions();
        cache.statistics()
    }

    /// Packs the log in place at `pack_tid`.
    ///
    /// # Errors
    ///
    /// See [`FileLog::pack_in_place`].
    pub fn pack(&self, pack_tid: Tid) -> Result<PackStats> {
        self.log.lock().pack_in_place(pack_tid)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("log", &*self.log.lock())
            .field("cache", &self.cache.lock().statistics())
            .finish_non_exhaustive()
    }
}
