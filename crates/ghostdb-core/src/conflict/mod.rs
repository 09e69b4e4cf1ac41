//! Optimistic conflict resolution.
//!
//! When a transaction commits a state based on a serial that is no longer
//! current, the [`ConflictResolver`] loads the base ("old") and the current
//! ("committed") states, asks the class's merge strategy to combine them with
//! the new state, and re-encodes the result. Anything it cannot verify is
//! reported as a conflict.

mod registry;
mod resolver;
mod strategies;

pub use registry::{ClassMemo, ConflictMergeable, MergeError, MergeRegistry, MergeStrategy};
pub use resolver::{ConflictResolver, SerialLoader};
pub use strategies::{CounterMerge, ThreeWayMerge};
