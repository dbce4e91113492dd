//! Content-addressed fingerprinting (spec §4.6 "Fingerprint"): a hash over
//! the reachable record patches used to produce a materialized tree, so a
//! caller can tell whether a new read is identical to the previous one
//! ("hot") and skip downstream work.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};

use crate::keys::stable_json;
use crate::record::{FieldKey, RecordId};

/// Hash a single JSON value to a stable hex digest.
pub fn hash_value(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stable_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// Combine the touched `(id, field) -> value` pairs of one materialization
/// into a single fingerprint. Dependencies are sorted first so fingerprint
/// equality doesn't depend on traversal order.
pub fn fingerprint_deps(deps: &[((RecordId, FieldKey), serde_json::Value)]) -> String {
    let mut sorted: Vec<&((RecordId, FieldKey), serde_json::Value)> = deps.iter().collect();
    sorted.sort_by(|a, b| (a.0 .0.as_ref(), a.0 .1.as_ref()).cmp(&(b.0 .0.as_ref(), b.0 .1.as_ref())));
    let mut hasher = Sha256::new();
    for ((id, field), value) in sorted {
        hasher.update(id.as_bytes());
        hasher.update(b"\0");
        hasher.update(field.as_bytes());
        hasher.update(b"\0");
        hasher.update(stable_json(value).as_bytes());
        hasher.update(b"\x1e"); // record separator
    }
    hex::encode(hasher.finalize())
}

/// Tracks the last fingerprint seen per memoization scope (a document +
/// variables identity), used to compute `hot` for both `normalize` and
/// `materialize` (spec §4.6).
#[derive(Default)]
pub struct HotCache {
    last: RefCell<HashMap<String, String>>,
}

impl HotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `fingerprint` for `scope`, returning whether it matches the
    /// previously recorded fingerprint for that scope.
    pub fn check(&self, scope: &str, fingerprint: &str) -> bool {
        let mut last = self.last.borrow_mut();
        let hot = last.get(scope).map(String::as_str) == Some(fingerprint);
        last.insert(scope.to_string(), fingerprint.to_string());
        hot
    }

    pub fn clear(&self) {
        self.last.borrow_mut().clear();
    }
}

/// Build a stable scope string for a `(document, variables)` pair.
pub fn scope_key(document: &str, variables: &serde_json::Map<String, serde_json::Value>) -> String {
    format!("{document}\0{}", stable_json(&serde_json::Value::Object(variables.clone())))
}

pub type DepVec = Vec<((RecordId, FieldKey), serde_json::Value)>;
pub type DepSet = HashSet<(RecordId, FieldKey)>;
