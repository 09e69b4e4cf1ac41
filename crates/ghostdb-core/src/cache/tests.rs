//! Tests for the object cache.

use super::*;
use crate::clock::ManualDayClock;
use crate::error::Error;
use crate::oid::{ObjectId, Tid};
use crate::persistent::{ObjectState, Persistent, PersistentObject};
use serde_json::json;
use std::sync::Arc;

// -------------------------------------------------------------------------
// Helpers
// -------------------------------------------------------------------------

fn cache_at(now: u32) -> (ObjectCache<PersistentObject>, Arc<ManualDayClock>) {
    let clock = Arc::new(ManualDayClock::new(now));
    (ObjectCache::new(clock.clone()), clock)
}

fn active_obj(oid: u64, atime: u32) -> Arc<PersistentObject> {
    let obj = Arc::new(PersistentObject::loaded(
        ObjectId(oid),
        "Counter",
        Tid(1),
        json!({ "value": oid }),
    ));
    obj.touch(atime);
    obj
}

fn ghost_obj(oid: u64) -> Arc<PersistentObject> {
    Arc::new(PersistentObject::ghost(ObjectId(oid), "Counter"))
}

// ========== set / get ==========

#[test]
fn test_set_classifies_by_state() {
    // Arrange
    let (mut cache, _clock) = cache_at(0);
    let a = active_obj(1, 0);
    let g = ghost_obj(2);

    // Act
    cache.set(ObjectId(1), &a);
    cache.set(ObjectId(2), &g);

    // Assert
    assert!(cache.is_active(ObjectId(1)));
    assert!(!cache.is_active(ObjectId(2)));
    assert_eq!(
        cache.statistics(),
        CacheStatistics {
            ghost_count: 1,
            active_count: 1
        }
    );
}

#[test]
fn test_get_returns_same_object() {
    let (mut cache, _clock) = cache_at(0);
    let a = active_obj(1, 0);
    cache.set(ObjectId(1), &a);

    let got = cache.get(ObjectId(1)).expect("cached");

    assert!(Arc::ptr_eq(&got, &a));
}

#[test]
fn test_get_unknown_returns_none() {
    let (cache, _clock) = cache_at(0);
    assert!(cache.get(ObjectId(42)).is_none());
}

#[test]
fn test_get_or_falls_back_to_default() {
    let (mut cache, _clock) = cache_at(0);
    let known = active_obj(1, 0);
    cache.set(ObjectId(1), &known);
    let fallback = ghost_obj(99);

    assert!(Arc::ptr_eq(&cache.get_or(ObjectId(1), fallback.clone()), &known));
    assert!(Arc::ptr_eq(&cache.get_or(ObjectId(2), fallback.clone()), &fallback));
}

#[test]
fn test_cache_does_not_keep_objects_alive() {
    // Arrange
    let (mut cache, _clock) = cache_at(0);
    let a = active_obj(1, 0);
    cache.set(ObjectId(1), &a);

    // Act
    drop(a);

    // Assert: lookup fails before the notice is applied
    assert!(cache.get(ObjectId(1)).is_none());
    assert_eq!(cache.process_evictions(), 1);
    assert!(!cache.contains(ObjectId(1)));
    assert_eq!(cache.statistics(), CacheStatistics::default());
}

#[test]
fn test_set_overwrites_previous_entry_in_other_map() {
    let (mut cache, _clock) = cache_at(0);
    let a = active_obj(1, 0);
    let g = ghost_obj(1);

    cache.set(ObjectId(1), &a);
    cache.set(ObjectId(1), &g);

    assert_eq!(
        cache.statistics(),
        CacheStatistics {
            ghost_count: 1,
            active_count: 0
        }
    );
    assert!(Arc::ptr_eq(&cache.get(ObjectId(1)).expect("cached"), &g));
}

#[test]
fn test_stale_notice_does_not_evict_replacement() {
    // Arrange: the first object is replaced, then dropped
    let (mut cache, _clock) = cache_at(0);
    let first = active_obj(1, 0);
    let second = active_obj(1, 0);
    cache.set(ObjectId(1), &first);
    cache.set(ObjectId(1), &second);

    // Act
    drop(first);
    let evicted = cache.process_evictions();

    // Assert
    assert_eq!(evicted, 0);
    assert!(cache.is_active(ObjectId(1)));
}

#[test]
fn test_eviction_notice_from_other_thread() {
    let (mut cache, _clock) = cache_at(0);
    let a = active_obj(7, 0);
    cache.set(ObjectId(7), &a);

    std::thread::spawn(move || drop(a))
        .join()
        .expect("thread");

    assert_eq!(cache.process_evictions(), 1);
    assert!(cache.is_empty());
}

// ========== remove / activate ==========

#[test]
fn test_remove_from_either_map() {
    let (mut cache, _clock) = cache_at(0);
    let a = active_obj(1, 0);
    let g = ghost_obj(2);
    cache.set(ObjectId(1), &a);
    cache.set(ObjectId(2), &g);

    cache.remove(ObjectId(1)).expect("remove active");
    cache.remove(ObjectId(2)).expect("remove ghost");

    assert!(cache.is_empty());
}

#[test]
fn test_remove_unknown_is_key_not_found() {
    let (mut cache, _clock) = cache_at(0);

    let err = cache.remove(ObjectId(9)).unwrap_err();

    assert!(matches!(err, Error::KeyNotFound(ObjectId(9))));
    assert_eq!(err.code(), "GHOST-001");
}

#[test]
fn test_remove_twice_fails_second_time() {
    let (mut cache, _clock) = cache_at(0);
    let a = active_obj(1, 0);
    cache.set(ObjectId(1), &a);

    cache.remove(ObjectId(1)).expect("first remove");

    assert!(matches!(
        cache.remove(ObjectId(1)),
        Err(Error::KeyNotFound(_))
    ));
}

#[test]
fn test_activate_moves_ghost_to_active() {
    let (mut cache, _clock) = cache_at(0);
    let g = ghost_obj(3);
    cache.set(ObjectId(3), &g);

    g.load(Tid(5), json!({"value": 3}));
    cache.activate(ObjectId(3)).expect("activate");

    assert!(cache.is_active(ObjectId(3)));
    assert_eq!(cache.statistics().ghost_count, 0);
}

#[test]
fn test_activate_active_is_noop() {
    let (mut cache, _clock) = cache_at(0);
    let a = active_obj(1, 0);
    cache.set(ObjectId(1), &a);

    cache.activate(ObjectId(1)).expect("activate");

    assert_eq!(cache.statistics().active_count, 1);
}

#[test]
fn test_activate_unknown_fails() {
    let (mut cache, _clock) = cache_at(0);
    assert!(matches!(
        cache.activate(ObjectId(1)),
        Err(Error::KeyNotFound(_))
    ));
}

// ========== shrink ==========

#[test]
fn test_shrink_ghostifies_least_recently_used() {
    // Arrange: A, B, C touched at 10, 20, 30; now = 100
    let (mut cache, _clock) = cache_at(100);
    let a = active_obj(1, 10);
    let b = active_obj(2, 20);
    let c = active_obj(3, 30);
    for obj in [&a, &b, &c] {
        cache.set(obj.oid(), obj);
    }

    // Act
    let report = cache.shrink(2, 1000);

    // Assert
    assert_eq!(report.ghostified, 1);
    assert!(a.is_ghost());
    assert!(!b.is_ghost());
    assert!(!c.is_ghost());
    assert_eq!(
        cache.statistics(),
        CacheStatistics {
            ghost_count: 1,
            active_count: 2
        }
    );
}

#[test]
fn test_shrink_ghostifies_idle_objects_below_target() {
    let (mut cache, _clock) = cache_at(1000);
    let idle = active_obj(1, 100);
    let fresh = active_obj(2, 990);
    cache.set(ObjectId(1), &idle);
    cache.set(ObjectId(2), &fresh);

    let report = cache.shrink(10, 500);

    assert_eq!(report.ghostified, 1);
    assert!(idle.is_ghost());
    assert!(cache.is_active(ObjectId(2)));
}

#[test]
fn test_shrink_threshold_is_inclusive() {
    let (mut cache, _clock) = cache_at(600);
    let obj = active_obj(1, 100);
    cache.set(ObjectId(1), &obj);

    cache.shrink(10, 500);

    assert!(obj.is_ghost());
}

#[test]
fn test_shrink_handles_midnight_wrap() {
    // Touched at 86390 "yesterday", now 10: age 20, not negative
    let (mut cache, clock) = cache_at(10);
    let obj = active_obj(1, 86_390);
    cache.set(ObjectId(1), &obj);

    cache.shrink(10, 21);
    assert!(!obj.is_ghost(), "age 20 is below a threshold of 21");

    clock.set(10);
    cache.shrink(10, 20);
    assert!(obj.is_ghost(), "age 20 reaches a threshold of 20");
}

#[test]
fn test_shrink_keeps_dirty_objects_active() {
    // Arrange: oldest object has uncommitted changes
    let (mut cache, _clock) = cache_at(100);
    let dirty = active_obj(1, 0);
    dirty
        .set_state_data(json!({"value": 99}))
        .expect("modify");
    let clean = active_obj(2, 50);
    cache.set(ObjectId(1), &dirty);
    cache.set(ObjectId(2), &clean);

    // Act
    let report = cache.shrink(1, 10_000);

    // Assert
    assert_eq!(report.declined, 1);
    assert_eq!(report.ghostified, 0);
    assert_eq!(dirty.state(), ObjectState::Changed);
    assert_eq!(cache.statistics().active_count, 2);
}

#[test]
fn test_shrink_keeps_sticky_objects_active() {
    let (mut cache, _clock) = cache_at(5000);
    let pinned = active_obj(1, 0);
    pinned.set_sticky().expect("pin");
    cache.set(ObjectId(1), &pinned);

    cache.shrink(0, 1);

    assert!(cache.is_active(ObjectId(1)));
}

#[test]
fn test_shrink_empty_cache_is_noop() {
    let (mut cache, _clock) = cache_at(0);
    let g = ghost_obj(1);
    cache.set(ObjectId(1), &g);

    let report = cache.shrink(0, 1);

    assert_eq!(report, ShrinkReport::default());
    assert_eq!(cache.statistics().ghost_count, 1);
}

#[test]
fn test_shrink_drops_entries_of_dropped_objects() {
    let (mut cache, _clock) = cache_at(100);
    let kept = active_obj(1, 90);
    let gone = active_obj(2, 0);
    cache.set(ObjectId(1), &kept);
    cache.set(ObjectId(2), &gone);
    drop(gone);

    let report = cache.shrink(10, 1000);

    assert_eq!(report.evicted, 1);
    assert_eq!(cache.statistics().active_count, 1);
}

// ========== invalidate / clear ==========

#[test]
fn test_invalidate_forces_dirty_object() {
    let (mut cache, _clock) = cache_at(0);
    let dirty = active_obj(1, 0);
    dirty.set_state_data(json!({"value": 2})).expect("modify");
    cache.set(ObjectId(1), &dirty);

    cache.invalidate(ObjectId(1));

    assert!(dirty.is_ghost());
    assert!(dirty.state_data().is_none());
    assert_eq!(cache.statistics().ghost_count, 1);
}

#[test]
fn test_invalidate_non_active_is_noop() {
    let (mut cache, _clock) = cache_at(0);
    let g = ghost_obj(1);
    cache.set(ObjectId(1), &g);

    cache.invalidate(ObjectId(1));
    cache.invalidate(ObjectId(99));

    assert_eq!(
        cache.statistics(),
        CacheStatistics {
            ghost_count: 1,
            active_count: 0
        }
    );
}

#[test]
fn test_invalidate_all_and_clear() {
    let (mut cache, _clock) = cache_at(0);
    let objs: Vec<_> = (1..=4).map(|i| active_obj(i, 0)).collect();
    for obj in &objs {
        cache.set(obj.oid(), obj);
    }

    cache.invalidate_all([ObjectId(1), ObjectId(2)]);
    assert_eq!(cache.statistics().active_count, 2);

    cache.clear();
    assert_eq!(
        cache.statistics(),
        CacheStatistics {
            ghost_count: 4,
            active_count: 0
        }
    );
    assert!(objs.iter().all(|o| o.is_ghost()));
}

#[test]
fn test_dyn_persistent_cache() {
    let mut cache: ObjectCache = ObjectCache::new(Arc::new(ManualDayClock::new(0)));
    let obj: Arc<dyn Persistent> = active_obj(1, 0);

    cache.set(ObjectId(1), &obj);

    assert!(cache.get(ObjectId(1)).is_some());
}
