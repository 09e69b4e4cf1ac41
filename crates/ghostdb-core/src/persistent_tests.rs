//! Tests for the persistent object state machine.

use crate::error::Error;
use crate::oid::{ObjectId, Tid};
use crate::persistent::{ObjectState, Persistent, PersistentObject};
use serde_json::json;

fn loaded() -> PersistentObject {
    PersistentObject::loaded(ObjectId(7), "Note", Tid(1), json!({ "a": 1 }))
}

// ========== construction ==========

#[test]
fn test_constructors_set_initial_state() {
    let ghost = PersistentObject::ghost(ObjectId(1), "Note");
    let fresh = PersistentObject::new(ObjectId(2), "Note", json!(null));

    assert_eq!(ghost.state(), ObjectState::Ghost);
    assert_eq!(ghost.state_data(), None);
    assert_eq!(fresh.state(), ObjectState::Changed);
    assert_eq!(fresh.serial(), None);
    assert_eq!(loaded().state(), ObjectState::UpToDate);
    assert_eq!(loaded().class(), "Note");
}

// ========== transitions ==========

#[test]
fn test_modify_then_save() {
    // Arrange
    let obj = loaded();

    // Act
    obj.set_state_data(json!({ "a": 2 })).unwrap();
    let changed = obj.state();
    obj.mark_saved(Tid(5));

    // Assert
    assert_eq!(changed, ObjectState::Changed);
    assert_eq!(obj.state(), ObjectState::UpToDate);
    assert_eq!(obj.serial(), Some(Tid(5)));
    assert_eq!(obj.state_data(), Some(json!({ "a": 2 })));
}

#[test]
fn test_ghost_cannot_be_modified_or_pinned() {
    let ghost = PersistentObject::ghost(ObjectId(1), "Note");

    assert!(matches!(
        ghost.set_state_data(json!(1)),
        Err(Error::Storage(_))
    ));
    assert!(ghost.set_sticky().is_err());
}

#[test]
fn test_load_turns_ghost_up_to_date() {
    let obj = PersistentObject::ghost(ObjectId(1), "Note");

    obj.load(Tid(3), json!("x"));

    assert_eq!(obj.state(), ObjectState::UpToDate);
    assert_eq!(obj.serial(), Some(Tid(3)));
}

#[test]
fn test_sticky_survives_modification_and_save() {
    let obj = loaded();
    obj.set_sticky().unwrap();

    obj.set_state_data(json!(9)).unwrap();
    obj.mark_saved(Tid(2));

    assert_eq!(obj.state(), ObjectState::Sticky);
    obj.unset_sticky();
    assert_eq!(obj.state(), ObjectState::UpToDate);
}

// ========== deactivation ==========

#[test]
fn test_deactivate_up_to_date() {
    let obj = loaded();

    assert!(obj.deactivate(false));
    assert!(obj.is_ghost());
    assert_eq!(obj.state_data(), None);
}

#[test]
fn test_changed_and_sticky_decline_unless_forced() {
    let changed = loaded();
    changed.set_state_data(json!(2)).unwrap();
    let sticky = loaded();
    sticky.set_sticky().unwrap();

    assert!(!changed.deactivate(false));
    assert!(!sticky.deactivate(false));
    assert!(changed.deactivate(true));
    assert!(sticky.deactivate(true));
    assert!(changed.is_ghost() && sticky.is_ghost());
}

#[test]
fn test_deactivate_ghost_is_noop() {
    let ghost = PersistentObject::ghost(ObjectId(1), "Note");

    assert!(ghost.deactivate(false));
}

#[test]
fn test_touch_updates_access_time() {
    let obj = loaded();
    assert_eq!(obj.access_time(), 0);

    obj.touch(4_321);

    assert_eq!(obj.access_time(), 4_321);
}
