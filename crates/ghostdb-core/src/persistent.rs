//! Persistent objects as seen by the cache.
//!
//! [`Persistent`] is the contract the object cache relies on: a
//! materialization-state query, a best-effort deactivation request, an
//! access time maintained by the object, and a slot for the cache's
//! eviction hook. [`PersistentObject`] is the implementation used by
//! [`crate::Database`].
//!
//! # State machine
//!
//! ```text
//!            load                 set_state_data
//!   Ghost ---------> UpToDate -------------------> Changed
//!     ^                |  ^  \                        |
//!     | deactivate     |  |   set_sticky              | mark_saved
//!     +----------------+  |    \                      |
//!                         +-----Sticky  <-------------+
//! ```
//!
//! Only `UpToDate` objects deactivate voluntarily; `Changed` and `Sticky`
//! objects decline unless forced.

use crate::cache::EvictionHook;
use crate::error::{Error, Result};
use crate::oid::{ObjectId, Tid};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Materialization state of a persistent object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectState {
    /// Placeholder without state; must be loaded before use.
    Ghost,
    /// Loaded and identical to the committed state.
    UpToDate,
    /// Modified since it was loaded.
    Changed,
    /// Loaded and pinned in memory.
    Sticky,
}

/// Capabilities the object cache needs from a cached object.
pub trait Persistent: Send + Sync {
    /// Current materialization state.
    fn state(&self) -> ObjectState;

    /// Returns true if the object holds no state right now.
    fn is_ghost(&self) -> bool {
        self.state() == ObjectState::Ghost
    }

    /// Asks the object to drop its state.
    ///
    /// Without `force` the object may decline (e.g. it has uncommitted
    /// changes). Returns true if the object is a ghost afterwards.
    fn deactivate(&self, force: bool) -> bool;

    /// Seconds-of-day of the last access, maintained by the object's owner.
    fn access_time(&self) -> u32;

    /// Stores the cache's eviction hook, replacing any previous one.
    fn attach_eviction_hook(&self, hook: EvictionHook);
}

struct Inner {
    state: ObjectState,
    serial: Option<Tid>,
    data: Option<Value>,
}

/// A persistent object: identity, class, committed serial and JSON state.
pub struct PersistentObject {
    oid: ObjectId,
    class: String,
    inner: RwLock<Inner>,
    atime: AtomicU32,
    hook: Mutex<Option<EvictionHook>>,
}

impl PersistentObject {
    /// Creates a ghost for a committed object.
    #[must_use]
    pub fn ghost(oid: ObjectId, class: impl Into<String>) -> Self {
        Self::with_inner(
            oid,
            class.into(),
            Inner {
                state: ObjectState::Ghost,
                serial: None,
                data: None,
            },
        )
    }

    /// Creates a materialized object holding committed state.
    #[must_use]
    pub fn loaded(oid: ObjectId, class: impl Into<String>, serial: Tid, data: Value) -> Self {
        Self::with_inner(
            oid,
            class.into(),
            Inner {
                state: ObjectState::UpToDate,
                serial: Some(serial),
                data: Some(data),
            },
        )
    }

    /// Creates a new object that has never been committed.
    #[must_use]
    pub fn new(oid: ObjectId, class: impl Into<String>, data: Value) -> Self {
        Self::with_inner(
            oid,
            class.into(),
            Inner {
                state: ObjectState::Changed,
                serial: None,
                data: Some(data),
            },
        )
    }

    fn with_inner(oid: ObjectId, class: String, inner: Inner) -> Self {
        Self {
            oid,
            class,
            inner: RwLock::new(inner),
            atime: AtomicU32::new(0),
            hook: Mutex::new(None),
        }
    }

    /// Object id.
    #[must_use]
    pub fn oid(&self) -> ObjectId {
        self.oid
    }

    /// Class name used to look up merge strategies.
    #[must_use]
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Serial of the committed state this object is based on.
    #[must_use]
    pub fn serial(&self) -> Option<Tid> {
        self.inner.read().serial
    }

    /// Copy of the current state, `None` for a ghost.
    #[must_use]
    pub fn state_data(&self) -> Option<Value> {
        self.inner.read().data.clone()
    }

    /// Replaces the state and marks the object changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the object is a ghost; it must be loaded first.
    pub fn set_state_data(&self, data: Value) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.state == ObjectState::Ghost {
            return Err(Error::Storage(format!(
                "attempt to modify ghost {}; load it first",
                self.oid
            )));
        }
        inner.data = Some(data);
        if inner.state != ObjectState::Sticky {
            inner.state = ObjectState::Changed;
        }
        Ok(())
    }

    /// Installs committed state, turning a ghost (or a stale copy) up to date.
    pub fn load(&self, serial: Tid, data: Value) {
        let mut inner = self.inner.write();
        inner.data = Some(data);
        inner.serial = Some(serial);
        inner.state = ObjectState::UpToDate;
    }

    /// Records that the current state was committed as `serial`.
    pub fn mark_saved(&self, serial: Tid) {
        let mut inner = self.inner.write();
        inner.serial = Some(serial);
        if inner.state == ObjectState::Changed {
            inner.state = ObjectState::UpToDate;
        }
    }

    /// Pins a loaded object so voluntary deactivation declines.
    ///
    /// # Errors
    ///
    /// Returns an error if the object is a ghost.
    pub fn set_sticky(&self) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.state {
            ObjectState::Ghost => Err(Error::Storage(format!(
                "cannot pin ghost {}",
                self.oid
            ))),
            _ => {
                inner.state = ObjectState::Sticky;
                Ok(())
            }
        }
    }

    /// Releases a pin set by [`Self::set_sticky`].
    pub fn unset_sticky(&self) {
        let mut inner = self.inner.write();
        if inner.state == ObjectState::Sticky {
            inner.state = ObjectState::UpToDate;
        }
    }

    /// Records an access at `now` (seconds-of-day).
    pub fn touch(&self, now: u32) {
        self.atime.store(now, Ordering::Relaxed);
    }
}

impl Persistent for PersistentObject {
    fn state(&self) -> ObjectState {
        self.inner.read().state
    }

    fn deactivate(&self, force: bool) -> bool {
        let mut inner = self.inner.write();
        let ghostify = match inner.state {
            ObjectState::Ghost => return true,
            ObjectState::UpToDate => true,
            ObjectState::Changed | ObjectState::Sticky => force,
        };
        if ghostify {
            inner.data = None;
            inner.state = ObjectState::Ghost;
        }
        ghostify
    }

    fn access_time(&self) -> u32 {
        self.atime.load(Ordering::Relaxed)
    }

    fn attach_eviction_hook(&self, hook: EvictionHook) {
        *self.hook.lock() = Some(hook);
    }
}

impl fmt::Debug for PersistentObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("PersistentObject")
            .field("oid", &self.oid)
            .field("class", &self.class)
            .field("state", &inner.state)
            .field("serial", &inner.serial)
            .finish_non_exhaustive()
    }
}
