//! The normalized record graph's data model (spec §3).

use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value;

/// A string key into the record table. Entities are `"<Typename>:<id>"`
/// (canonicalized through `interfaces`), derived records are parent+path
/// based, and `@` is the query root.
pub type RecordId = Rc<str>;

/// A field key within a record: `fieldName` or `fieldName({args})`.
pub type FieldKey = Rc<str>;

pub fn record_id(s: impl Into<String>) -> RecordId {
    Rc::from(s.into().into_boxed_str())
}

pub fn field_key(s: impl Into<String>) -> FieldKey {
    Rc::from(s.into().into_boxed_str())
}

/// A value stored at a field key within a [`Record`] (spec §3).
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Null,
    /// A scalar: string, number, or boolean.
    Scalar(Value),
    /// An opaque plain object, stored by value (not walked for entities).
    Object(Value),
    /// A reference to another record.
    Ref(RecordId),
    /// An ordered list of scalars, objects, or references.
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Render back to plain JSON, resolving `Ref`s to `{__ref: id}` markers.
    /// Used for snapshots (`getRecord`) and fingerprinting, never for reactive
    /// reads (those resolve refs to proxies, see `documents::materialize`).
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Scalar(v) | FieldValue::Object(v) => v.clone(),
            FieldValue::Ref(id) => serde_json::json!({ "__ref": id.as_ref() }),
            FieldValue::List(items) => Value::Array(items.iter().map(FieldValue::to_json).collect()),
        }
    }
}

/// A mapping from field key to value (spec §3). Insertion order is kept so
/// snapshots and debugging output are deterministic.
pub type Record = IndexMap<FieldKey, FieldValue>;

/// Shallow-merge `patch` into `base` per invariant (G1): a key omitted from
/// `patch` preserves `base`'s prior value (this representation has no
/// separate "undefined" marker — an omitted map key already means that);
/// any key present in `patch`, including one mapped to `FieldValue::Null`,
/// overwrites `base`'s value for it.
pub fn shallow_merge(base: &mut Record, patch: &Record) {
    for (key, value) in patch {
        base.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omitted_key_preserves_prior_value_present_key_overwrites() {
        let mut base = Record::new();
        base.insert(field_key("title"), FieldValue::Scalar(serde_json::json!("old")));
        base.insert(field_key("views"), FieldValue::Scalar(serde_json::json!(1)));

        let mut patch = Record::new();
        patch.insert(field_key("title"), FieldValue::Null);

        shallow_merge(&mut base, &patch);

        assert_eq!(base.get(&field_key("title")), Some(&FieldValue::Null), "a present key overwrites, even with Null");
        assert_eq!(
            base.get(&field_key("views")),
            Some(&FieldValue::Scalar(serde_json::json!(1))),
            "an omitted key is left untouched"
        );
    }
}
