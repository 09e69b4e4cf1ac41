//! Merge strategies keyed by class name.

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Raised by a merge strategy that cannot reconcile the states.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct MergeError(pub String);

impl MergeError {
    /// Creates a merge error with a message.
    #[must_use]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Three-way merge capability of a class.
pub trait ConflictMergeable: Send + Sync {
    /// Merges the committed and new states, both derived from `old`.
    ///
    /// # Errors
    ///
    /// Returns a [`MergeError`] when the changes cannot be reconciled.
    fn resolve_conflict(
        &self,
        old: Value,
        committed: Value,
        new: Value,
    ) -> Result<Value, MergeError>;
}

impl<F> ConflictMergeable for F
where
    F: Fn(Value, Value, Value) -> Result<Value, MergeError> + Send + Sync,
{
    fn resolve_conflict(
        &self,
        old: Value,
        committed: Value,
        new: Value,
    ) -> Result<Value, MergeError> {
        self(old, committed, new)
    }
}

/// Result of a registry lookup.
#[derive(Clone)]
pub enum MergeStrategy {
    /// The class can merge conflicting states.
    Merge(Arc<dyn ConflictMergeable>),
    /// The class has no merge strategy; conflicts always fail.
    Unresolvable,
}

impl fmt::Debug for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merge(_) => f.write_str("Merge(..)"),
            Self::Unresolvable => f.write_str("Unresolvable"),
        }
    }
}

/// Maps class names to merge strategies.
#[derive(Default)]
pub struct MergeRegistry {
    strategies: RwLock<FxHashMap<String, Arc<dyn ConflictMergeable>>>,
}

impl MergeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the strategy for `class`.
    pub fn register<M>(&self, class: impl Into<String>, strategy: M)
    where
        M: ConflictMergeable + 'static,
    {
        self.strategies
            .write()
            .insert(class.into(), Arc::new(strategy));
    }

    /// Removes the strategy for `class`, returning whether one existed.
    pub fn unregister(&self, class: &str) -> bool {
        self.strategies.write().remove(class).is_some()
    }

    /// Looks up the strategy for `class`.
    #[must_use]
    pub fn lookup(&self, class: &str) -> MergeStrategy {
        self.strategies
            .read()
            .get(class)
            .map_or(MergeStrategy::Unresolvable, |s| MergeStrategy::Merge(Arc::clone(s)))
    }

    /// Number of registered classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strategies.read().len()
    }

    /// Returns true if no class is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strategies.read().is_empty()
    }
}

/// Memo of classes known to have no merge strategy.
///
/// Saves repeated registry lookups for classes that never resolve. Entries
/// stay until [`ClassMemo::clear`] is called, typically when the registry is
/// reloaded; registering a strategy alone does not evict a memoized class.
#[derive(Debug, Default)]
pub struct ClassMemo {
    unresolvable: RwLock<FxHashSet<String>>,
    hits: AtomicU64,
}

impl ClassMemo {
    /// Creates an empty memo.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true (and counts a hit) if `class` is memoized as unresolvable.
    pub fn is_unresolvable(&self, class: &str) -> bool {
        let found = self.unresolvable.read().contains(class);
        if found {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Memoizes `class` as unresolvable.
    pub fn mark_unresolvable(&self, class: &str) {
        self.unresolvable.write().insert(class.to_string());
    }

    /// Forgets every memoized class.
    pub fn clear(&self) {
        self.unresolvable.write().clear();
    }

    /// Number of memoized classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.unresolvable.read().len()
    }

    /// Returns true if nothing is memoized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unresolvable.read().is_empty()
    }

    /// Lookups answered from the memo.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}
