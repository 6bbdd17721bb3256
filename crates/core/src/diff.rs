//! Field-level differences between two entity snapshots.
//!
//! Values are compared as whole JSON values: a nested object or array that
//! differs anywhere is reported as a single `modified` field.

use std::collections::BTreeSet;

use crate::models::{FieldChange, FieldChangeType, FieldChanges, Record};

/// Compute the field-level differences from `before` to `after`.
///
/// - `None -> Some`: every key in `after` is `added`.
/// - `Some -> None`: every key in `before` is `deleted`.
/// - both present: union of keys, equal values omitted.
pub fn diff(before: Option<&Record>, after: Option<&Record>) -> FieldChanges {
    let mut changes = FieldChanges::new();

    match (before, after) {
        (None, None) => {}
        (None, Some(after)) => {
            for (field, value) in after {
                changes.insert(field.clone(), added(value));
            }
        }
        (Some(before), None) => {
            for (field, value) in before {
                changes.insert(field.clone(), deleted(value));
            }
        }
        (Some(before), Some(after)) => {
            let fields: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
            for field in fields {
                let change = match (before.get(field), after.get(field)) {
                    (None, Some(to)) => added(to),
                    (Some(from), None) => deleted(from),
                    (Some(from), Some(to)) if from != to => FieldChange {
                        kind: FieldChangeType::Modified,
                        from: Some(from.clone()),
                        to: Some(to.clone()),
                    },
                    _ => continue,
                };
                changes.insert(field.clone(), change);
            }
        }
    }

    changes
}

/// Apply field changes on top of `base`, returning the resulting snapshot.
///
/// `added`/`modified` set the field to `to`; `deleted` removes it. Applying
/// `diff(a, b)` to `a` reconstructs `b` for any two flat records.
pub fn apply(base: Option<&Record>, changes: &FieldChanges) -> Record {
    let mut out = base.cloned().unwrap_or_default();
    for (field, change) in changes {
        match change.kind {
            FieldChangeType::Added | FieldChangeType::Modified => {
                if let Some(to) = &change.to {
                    out.insert(field.clone(), to.clone());
                }
            }
            FieldChangeType::Deleted => {
                out.remove(field);
            }
        }
    }
    out
}

/// Names of the fields touched by a change set.
pub fn touched_fields(changes: &FieldChanges) -> BTreeSet<String> {
    changes.keys().cloned().collect()
}

fn added(value: &serde_json::Value) -> FieldChange {
    FieldChange {
        kind: FieldChangeType::Added,
        from: None,
        to: Some(value.clone()),
    }
}

fn deleted(value: &serde_json::Value) -> FieldChange {
    FieldChange {
        kind: FieldChangeType::Deleted,
        from: Some(value.clone()),
        to: None,
    }
}
