//! Non-owning handles and eviction notices.
//!
//! The cache never holds a strong reference to a cached object. Instead it
//! keeps a [`WeakHandle`] and hands the object an [`EvictionHook`]; when the
//! last strong reference goes away the hook is dropped with the object and
//! posts the object id back to the cache.

use crate::oid::ObjectId;
use crossbeam_channel::Sender;
use std::fmt;
use std::sync::{Arc, Weak};

/// Weak reference to a cached object.
pub struct WeakHandle<T: ?Sized> {
    weak: Weak<T>,
}

impl<T: ?Sized> WeakHandle<T> {
    /// Creates a handle without touching the strong count.
    #[must_use]
    pub fn new(obj: &Arc<T>) -> Self {
        Self {
            weak: Arc::downgrade(obj),
        }
    }

    /// Returns the referent if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Arc<T>> {
        self.weak.upgrade()
    }

    /// Returns true while at least one strong reference exists.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.weak.strong_count() > 0
    }

    /// Returns true if both handles point at the same allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.weak, &other.weak)
    }
}

impl<T: ?Sized> Clone for WeakHandle<T> {
    fn clone(&self) -> Self {
        Self {
            weak: self.weak.clone(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for WeakHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakHandle")
            .field("live", &self.is_live())
            .finish()
    }
}

/// Eviction callback carried by a cached object.
///
/// Dropping the hook posts its object id to the owning cache. The send may
/// happen on any thread; the cache processes notices at its next mutation.
#[derive(Debug)]
pub struct EvictionHook {
    oid: ObjectId,
    notices: Sender<ObjectId>,
}

impl EvictionHook {
    pub(crate) fn new(oid: ObjectId, notices: Sender<ObjectId>) -> Self {
        Self { oid, notices }
    }

    /// Object id this hook reports.
    #[must_use]
    pub fn oid(&self) -> ObjectId {
        self.oid
    }
}

impl Drop for EvictionHook {
    fn drop(&mut self) {
        // The cache may already be gone.
        let _ = self.notices.send(self.oid);
    }
}
