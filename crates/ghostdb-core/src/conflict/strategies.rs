//! Reusable merge strategies.

use super::registry::{ConflictMergeable, MergeError};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Key-wise three-way merge of object states.
///
/// A key changed on one side only takes that side's value; a key changed
/// identically on both sides is accepted; a key changed differently on both
/// sides is a conflict.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreeWayMerge;

impl ConflictMergeable for ThreeWayMerge {
    fn resolve_conflict(
        &self,
        old: Value,
        committed: Value,
        new: Value,
    ) -> Result<Value, MergeError> {
        merge_objects(&old, &committed, &new, |_, _, _, _| None)
    }
}

/// Additive merge for counter fields, three-way merge for everything else.
///
/// Both sides' increments to a counter field are applied to the old value,
/// so concurrent `+1` and `+2` commit as `+3`.
#[derive(Debug, Clone, Default)]
pub struct CounterMerge {
    counters: BTreeSet<String>,
}

impl CounterMerge {
    /// Creates a strategy treating `fields` as counters.
    #[must_use]
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            counters: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl ConflictMergeable for CounterMerge {
    fn resolve_conflict(
        &self,
        old: Value,
        committed: Value,
        new: Value,
    ) -> Result<Value, MergeError> {
        merge_objects(&old, &committed, &new, |key, o, c, n| {
            if !self.counters.contains(key) {
                return None;
            }
            let (o, c, n) = (o?.as_i64()?, c?.as_i64()?, n?.as_i64()?);
            Some(
                c.checked_sub(o)
                    .and_then(|dc| n.checked_add(dc))
                    .map(Value::from)
                    .ok_or_else(|| MergeError::new(format!("counter '{key}' overflowed"))),
            )
        })
    }
}

fn merge_objects<H>(
    old: &Value,
    committed: &Value,
    new: &Value,
    hook: H,
) -> Result<Value, MergeError>
where
    H: Fn(&str, Option<&Value>, Option<&Value>, Option<&Value>) -> Option<Result<Value, MergeError>>,
{
    let (Some(o), Some(c), Some(n)) = (old.as_object(), committed.as_object(), new.as_object())
    else {
        return pick(old, committed, new)
            .cloned()
            .ok_or_else(|| MergeError::new("non-object states changed on both sides"));
    };

    let keys: BTreeSet<&String> = o.keys().chain(c.keys()).chain(n.keys()).collect();
    let mut merged = Map::new();
    for key in keys {
        let (ov, cv, nv) = (o.get(key), c.get(key), n.get(key));
        let value = match hook(key, ov, cv, nv) {
            Some(result) => Some(result?),
            None => pick_field(ov, cv, nv)
                .map_err(|()| MergeError::new(format!("field '{key}' changed on both sides")))?
                .cloned(),
        };
        if let Some(value) = value {
            merged.insert(key.clone(), value);
        }
    }
    Ok(Value::Object(merged))
}

fn pick<'v>(old: &'v Value, committed: &'v Value, new: &'v Value) -> Option<&'v Value> {
    if committed == new || new == old {
        Some(committed)
    } else if committed == old {
        Some(new)
    } else {
        None
    }
}

fn pick_field<'v>(
    old: Option<&'v Value>,
    committed: Option<&'v Value>,
    new: Option<&'v Value>,
) -> Result<Option<&'v Value>, ()> {
    if committed == new || new == old {
        Ok(committed)
    } else if committed == old {
        Ok(new)
    } else {
        Err(())
    }
}
