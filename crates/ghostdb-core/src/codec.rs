//! Binary state representation.
//!
//! A state record is the class metadata followed by the object state:
//!
//! ```text
//! [class name length: u16 BE][class name: UTF-8][state: JSON]
//! ```
//!
//! References to other persistent objects inside a state are written as
//! persistent-reference tokens, JSON objects of the exact form
//! `{"$ref": <oid>}`. JSON maps serialize with sorted keys, so encoding the
//! same state twice yields the same bytes.

use crate::error::{Error, Result};
use crate::oid::ObjectId;
use bytes::{Buf, BufMut};
use serde_json::{Map, Value};

/// Key of a persistent-reference token.
pub const REF_KEY: &str = "$ref";

/// Decoded state record.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
    /// Class name used to look up merge strategies.
    pub class: String,
    /// Object state.
    pub state: Value,
}

/// Encodes a state record.
///
/// # Errors
///
/// Returns an error if the class name is too long or the state contains a
/// malformed reference token.
pub fn encode_state(class: &str, state: &Value) -> Result<Vec<u8>> {
    validate_references(state)?;
    let class_len = u16::try_from(class.len())
        .map_err(|_| Error::Serialization(format!("class name too long: {} bytes", class.len())))?;
    let body = serde_json::to_vec(state)?;

    let mut buf = Vec::with_capacity(2 + class.len() + body.len());
    buf.put_u16(class_len);
    buf.put_slice(class.as_bytes());
    buf.put_slice(&body);
    Ok(buf)
}

/// Decodes the class name only, without parsing the state.
///
/// # Errors
///
/// Returns an error if the record is truncated or the name is not UTF-8.
pub fn class_of(bytes: &[u8]) -> Result<String> {
    let (class, _) = split_class(bytes)?;
    Ok(class.to_string())
}

/// Decodes a full state record.
///
/// # Errors
///
/// Returns an error if the record is truncated or the state is not JSON.
pub fn decode_state(bytes: &[u8]) -> Result<StateRecord> {
    let (class, body) = split_class(bytes)?;
    let state = serde_json::from_slice(body)?;
    Ok(StateRecord {
        class: class.to_string(),
        state,
    })
}

fn split_class(bytes: &[u8]) -> Result<(&str, &[u8])> {
    let mut cursor = bytes;
    if cursor.remaining() < 2 {
        return Err(Error::Serialization("state record shorter than class header".into()));
    }
    let len = usize::from(cursor.get_u16());
    if cursor.remaining() < len {
        return Err(Error::Serialization(format!(
            "class name of {len} bytes exceeds record"
        )));
    }
    let (name, body) = cursor.split_at(len);
    let name = std::str::from_utf8(name)
        .map_err(|e| Error::Serialization(format!("class name is not UTF-8: {e}")))?;
    Ok((name, body))
}

/// Builds a persistent-reference token for `oid`.
#[must_use]
pub fn persistent_ref(oid: ObjectId) -> Value {
    let mut map = Map::new();
    map.insert(REF_KEY.to_string(), Value::from(oid.0));
    Value::Object(map)
}

/// Collects referenced object ids in first-seen order, without duplicates.
///
/// # Errors
///
/// Returns [`Error::InvalidReference`] on a malformed token.
pub fn references(state: &Value) -> Result<Vec<ObjectId>> {
    let mut out = Vec::new();
    collect_refs(state, &mut out)?;
    Ok(out)
}

fn validate_references(state: &Value) -> Result<()> {
    collect_refs(state, &mut Vec::new())
}

fn collect_refs(value: &Value, out: &mut Vec<ObjectId>) -> Result<()> {
    match value {
        Value::Object(map) => {
            if let Some(target) = map.get(REF_KEY) {
                if map.len() != 1 {
                    return Err(Error::InvalidReference(format!(
                        "reference token has extra keys: {value}"
                    )));
                }
                let oid = target.as_u64().map(ObjectId).ok_or_else(|| {
                    Error::InvalidReference(format!("reference target is not an oid: {target}"))
                })?;
                if !out.contains(&oid) {
                    out.push(oid);
                }
                return Ok(());
            }
            map.values().try_for_each(|v| collect_refs(v, out))
        }
        Value::Array(items) => items.iter().try_for_each(|v| collect_refs(v, out)),
        _ => Ok(()),
    }
}
