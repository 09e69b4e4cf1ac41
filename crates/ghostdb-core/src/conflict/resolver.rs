//! Write-write conflict resolution.

use super::registry::{ClassMemo, MergeRegistry, MergeStrategy};
use crate::codec::{self, StateRecord};
use crate::error::{ConflictReason, Error, Result};
use crate::oid::{ObjectId, Serial};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Read path used to fetch historical states.
pub trait SerialLoader {
    /// Returns the encoded state of `oid` as written by `serial`.
    ///
    /// # Errors
    ///
    /// Returns an error if the revision cannot be read.
    fn load_serial(&self, oid: ObjectId, serial: Serial) -> Result<Vec<u8>>;
}

/// Resolves conflicts by calling the merge strategy of the object's class.
///
/// Holds no state of its own besides shared references to the registry and
/// the unresolvable-class memo.
#[derive(Clone)]
pub struct ConflictResolver {
    registry: Arc<MergeRegistry>,
    memo: Arc<ClassMemo>,
}

impl ConflictResolver {
    /// Creates a resolver over `registry`, memoizing failed lookups in `memo`.
    #[must_use]
    pub fn new(registry: Arc<MergeRegistry>, memo: Arc<ClassMemo>) -> Self {
        Self { registry, memo }
    }

    /// The registry strategies are looked up in.
    #[must_use]
    pub fn registry(&self) -> &Arc<MergeRegistry> {
        &self.registry
    }

    /// The memo of unresolvable classes.
    #[must_use]
    pub fn memo(&self) -> &Arc<ClassMemo> {
        &self.memo
    }

    /// Forgets memoized lookups so newly registered strategies take effect.
    pub fn reload_registry(&self) {
        self.memo.clear();
    }

    /// Merges `new_state` with the state committed as `committed_serial`,
    /// both derived from the state at `old_serial`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if the class has no merge strategy, a
    /// state cannot be loaded, the merge fails or its result cannot be
    /// encoded.
    pub fn resolve(
        &self,
        loader: &dyn SerialLoader,
        oid: ObjectId,
        committed_serial: Serial,
        old_serial: Serial,
        new_state: &[u8],
    ) -> Result<Vec<u8>> {
        self.resolve_with_deadline(loader, oid, committed_serial, old_serial, new_state, None)
    }

    /// Like [`Self::resolve`], failing with [`ConflictReason::TimedOut`] once
    /// `deadline` has passed before or after the state loads.
    ///
    /// # Errors
    ///
    /// See [`Self::resolve`].
    pub fn resolve_with_deadline(
        &self,
        loader: &dyn SerialLoader,
        oid: ObjectId,
        committed_serial: Serial,
        old_serial: Serial,
        new_state: &[u8],
        deadline: Option<Instant>,
    ) -> Result<Vec<u8>> {
        let fail = |reason: ConflictReason| {
            debug!(%oid, %committed_serial, %old_serial, %reason, "conflict not resolved");
            Error::conflict(oid, reason)
        };

        let StateRecord { class, state: new } = codec::decode_state(new_state)
            .map_err(|e| fail(ConflictReason::LoadFailed(format!("new state: {e}"))))?;

        let strategy = match self.strategy_for(&class) {
            MergeStrategy::Merge(strategy) => strategy,
            MergeStrategy::Unresolvable => return Err(fail(ConflictReason::Unresolvable { class })),
        };

        check_deadline(deadline).map_err(fail)?;
        let old = load_state(loader, oid, old_serial).map_err(fail)?;
        let committed = load_state(loader, oid, committed_serial).map_err(fail)?;
        check_deadline(deadline).map_err(fail)?;

        let merged = strategy.resolve_conflict(old, committed, new).map_err(|e| {
            warn!(%oid, %class, error = %e, "merge strategy rejected conflict");
            fail(ConflictReason::MergeFailed(e.to_string()))
        })?;

        codec::encode_state(&class, &merged)
            .map_err(|e| fail(ConflictReason::EncodeFailed(e.to_string())))
    }

    fn strategy_for(&self, class: &str) -> MergeStrategy {
        if self.memo.is_unresolvable(class) {
            return MergeStrategy::Unresolvable;
        }
        let strategy = self.registry.lookup(class);
        if matches!(strategy, MergeStrategy::Unresolvable) {
            self.memo.mark_unresolvable(class);
        }
        strategy
    }
}

fn check_deadline(deadline: Option<Instant>) -> std::result::Result<(), ConflictReason> {
    match deadline {
        Some(at) if Instant::now() >= at => Err(ConflictReason::TimedOut),
        _ => Ok(()),
    }
}

fn load_state(
    loader: &dyn SerialLoader,
    oid: ObjectId,
    serial: Serial,
) -> std::result::Result<serde_json::Value, ConflictReason> {
    loader
        .load_serial(oid, serial)
        .and_then(|bytes| codec::decode_state(&bytes))
        .map(|record| record.state)
        .map_err(|e| ConflictReason::LoadFailed(format!("serial {serial}: {e}")))
}
