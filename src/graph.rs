//! The graph store (spec §4.1): keyed records, references, shallow-reactive
//! proxies, change notification. Composes the base record table, the
//! optimistic layer stack (spec §4.4), and canonical connections (spec §4.5)
//! behind one facade so reads uniformly see "base ⊕ live layers ⊕ committed
//! layers" (spec §4.4).

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use serde_json::Value;

use crate::config::IdentityConfig;
use crate::connections::ConnectionStore;
use crate::error::CacheError;
use crate::optimistic::{apply_patch, EntityFold, OptimisticStack};
use crate::record::{FieldKey, FieldValue, Record, RecordId};
use crate::tracker::Tracker;

/// A batch of base-store mutations between flushes, delivered to
/// `onChange` listeners (spec §4.1) — used by the storage bridge.
#[derive(Clone, Debug, Default)]
pub struct ChangeBatch {
    pub puts: Vec<(RecordId, Record)>,
    pub removes: Vec<RecordId>,
}

struct BaseStore {
    records: IndexMap<RecordId, Record>,
    dirty: HashSet<(RecordId, FieldKey)>,
    batch: ChangeBatch,
    applying_remote: bool,
    listeners: Vec<Box<dyn FnMut(&ChangeBatch)>>,
}

impl BaseStore {
    fn new() -> Self {
        Self {
            records: IndexMap::new(),
            dirty: HashSet::new(),
            batch: ChangeBatch::default(),
            applying_remote: false,
            listeners: Vec::new(),
        }
    }
}

/// A reactive view onto one record (spec §4.1 `materializeRecord`, §3 G3/G4).
/// Unique per id, reused across calls; reads track `(id, field)` dependencies
/// and resolve through the same base+overlay fold as every other read.
pub struct RecordProxy {
    id: RecordId,
    graph: Weak<Graph>,
}

impl RecordProxy {
    pub fn id(&self) -> &RecordId {
        &self.id
    }

    /// Read a field, tracking the dependency. Returns `None` once the
    /// record has been removed (G4: "observably empty").
    pub fn get(&self, field: &str) -> Option<Value> {
        let graph = self.graph.upgrade()?;
        graph.tracker.track(self.id.clone(), FieldKey::from(field));
        graph
            .effective_record(&self.id)
            .and_then(|r| r.get(field).map(FieldValue::to_json))
    }
}

/// The graph store facade (spec §4.1).
pub struct Graph {
    base: RefCell<BaseStore>,
    pub optimistic: OptimisticStack,
    pub connections: ConnectionStore,
    pub tracker: Tracker,
    pub identity: IdentityConfig,
    proxies: RefCell<HashMap<RecordId, Rc<RecordProxy>>>,
}

impl Graph {
    pub fn new(identity: IdentityConfig) -> Rc<Self> {
        Rc::new(Self {
            base: RefCell::new(BaseStore::new()),
            optimistic: OptimisticStack::new(),
            connections: ConnectionStore::new(),
            tracker: Tracker::new(),
            identity,
            proxies: RefCell::new(HashMap::new()),
        })
    }

    /// `identify(object) -> RecordId | null` (spec §4.1).
    pub fn identify(&self, obj: &Value) -> Option<RecordId> {
        self.identity.identify(obj).map(crate::record::record_id)
    }

    /// `putRecord(id, patch)`: shallow-merge per G1. Marks fields dirty.
    pub fn put_record(&self, id: RecordId, patch: Record) {
        let mut base = self.base.borrow_mut();
        let entry = base.records.entry(id.clone()).or_insert_with(Record::new);
        crate::record::shallow_merge(entry, &patch);
        let snapshot = entry.clone();
        for key in patch.keys() {
            base.dirty.insert((id.clone(), key.clone()));
        }
        if !base.applying_remote {
            base.batch.puts.push((id, snapshot));
        }
    }

    /// Merge `record` into the base store filling gaps only: a key already
    /// present at `id` is left untouched. Used by storage hydration, which
    /// must never clobber state a live session already built up (spec §6
    /// "merge, never clear").
    pub fn hydrate_record(&self, id: RecordId, record: Record) {
        let mut base = self.base.borrow_mut();
        let entry = base.records.entry(id.clone()).or_insert_with(Record::new);
        for (key, value) in record {
            if !entry.contains_key(&key) {
                entry.insert(key.clone(), value);
                base.dirty.insert((id.clone(), key));
            }
        }
    }

    /// `getRecord(id) -> snapshot | undefined`: plain, untracked, includes
    /// the optimistic overlay fold (base ⊕ live ⊕ committed, spec §4.4).
    pub fn get_record(&self, id: &RecordId) -> Option<Record> {
        self.effective_record(id)
    }

    fn effective_record(&self, id: &RecordId) -> Option<Record> {
        let base_record = self.base.borrow().records.get(id).cloned();

        // A `Reset` means an effective layer deleted the entity: the base is
        // discarded and only patches queued after that delete (if any)
        // apply, onto an empty record — a later-layer patch on top of an
        // earlier-layer delete resurrects the entity (spec §4.4).
        let (base_record, patches) = match self.optimistic.fold_entity(id) {
            EntityFold::Overlay(patches) => (base_record, patches),
            EntityFold::Reset(patches) => (None, patches),
        };
        if base_record.is_none() && patches.is_empty() {
            return None;
        }
        let mut record = base_record.unwrap_or_default();
        for (patch, mode) in patches {
            apply_patch(&mut record, &patch, mode);
        }
        Some(record)
    }

    /// `removeRecord(id)`: empties the proxy, deletes the snapshot, marks all
    /// fields dirty (spec §4.1, G4).
    pub fn remove_record(&self, id: &RecordId) {
        let mut base = self.base.borrow_mut();
        if let Some(removed) = base.records.shift_remove(id) {
            for key in removed.keys() {
                base.dirty.insert((id.clone(), key.clone()));
            }
        }
        if !base.applying_remote {
            base.batch.removes.push(id.clone());
        }
    }

    /// `materializeRecord(id) -> proxy`, reused across calls (spec §4.1, G3).
    pub fn materialize_record(self: &Rc<Self>, id: &RecordId) -> Rc<RecordProxy> {
        let mut proxies = self.proxies.borrow_mut();
        proxies
            .entry(id.clone())
            .or_insert_with(|| {
                Rc::new(RecordProxy {
                    id: id.clone(),
                    graph: Rc::downgrade(self),
                })
            })
            .clone()
    }

    pub fn keys(&self) -> Vec<RecordId> {
        self.base.borrow().records.keys().cloned().collect()
    }

    pub fn clear(&self) {
        let mut base = self.base.borrow_mut();
        let removed: Vec<RecordId> = base.records.keys().cloned().collect();
        base.records.clear();
        base.dirty.clear();
        base.batch = ChangeBatch::default();
        drop(base);
        self.optimistic.clear();
        self.connections.clear();
        let _ = removed;
    }

    /// Force dispatch of pending notifications (spec §4.1). Because every
    /// public mutating entry point in this crate is a synchronous function
    /// that calls `flush()` once at the end, all writes within one such call
    /// are coalesced into a single dispatch — the Rust-native analogue of
    /// the spec's microtask coalescing (see DESIGN.md, Open Question 3).
    pub fn flush(&self) -> HashSet<(RecordId, FieldKey)> {
        let mut base = self.base.borrow_mut();
        if base.dirty.is_empty() {
            return HashSet::new();
        }
        let dirty = std::mem::take(&mut base.dirty);
        let batch = std::mem::take(&mut base.batch);
        tracing::trace!(dirty = dirty.len(), puts = batch.puts.len(), removes = batch.removes.len(), "flush");
        if !batch.puts.is_empty() || !batch.removes.is_empty() {
            if !base.applying_remote {
                for listener in &mut base.listeners {
                    listener(&batch);
                }
            } else {
                tracing::debug!("suppressing storage-bridge listeners for a remote-originated batch");
            }
        }
        dirty
    }

    pub fn on_change(&self, listener: impl FnMut(&ChangeBatch) + 'static) {
        self.base.borrow_mut().listeners.push(Box::new(listener));
    }

    pub fn set_applying_remote(&self, value: bool) {
        self.base.borrow_mut().applying_remote = value;
    }

    pub fn inspect(&self) -> HashMap<RecordId, Record> {
        self.base.borrow().records.clone().into_iter().collect()
    }
}

/// Convert a stored `Record` to plain JSON (for snapshots, not reactive
/// reads).
pub fn record_to_json(record: &Record) -> Value {
    let mut map = serde_json::Map::new();
    for (k, v) in record {
        map.insert(k.to_string(), v.to_json());
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{field_key, record_id};
    use serde_json::json;

    fn scalar_record(pairs: &[(&str, Value)]) -> Record {
        let mut r = Record::new();
        for (k, v) in pairs {
            r.insert(field_key(*k), FieldValue::Scalar(v.clone()));
        }
        r
    }

    /// Reproduces spec §8 scenario 1 exactly.
    #[test]
    fn put_with_undefined_keeps_prior_value() {
        let graph = Graph::new(IdentityConfig::default());
        graph.put_record(
            record_id("User:1"),
            scalar_record(&[
                ("__typename", json!("User")),
                ("id", json!("1")),
                ("name", json!("A")),
                ("email", json!("a@x")),
            ]),
        );
        // A second put that simply omits `name`/`email` leaves them intact —
        // Rust's analogue of "undefined" is "absent from the patch map".
        graph.put_record(record_id("User:1"), Record::new());

        let record = graph.get_record(&record_id("User:1")).unwrap();
        assert_eq!(record.get("name"), Some(&FieldValue::Scalar(json!("A"))));
        assert_eq!(record.get("email"), Some(&FieldValue::Scalar(json!("a@x"))));
    }

    #[test]
    fn proxy_identity_is_stable() {
        let graph = Graph::new(IdentityConfig::default());
        let id = record_id("User:1");
        graph.put_record(id.clone(), scalar_record(&[("name", json!("A"))]));
        let p1 = graph.materialize_record(&id);
        let p2 = graph.materialize_record(&id);
        assert!(Rc::ptr_eq(&p1, &p2));
        assert_eq!(p1.get("name"), Some(json!("A")));
    }

    #[test]
    fn remove_makes_proxy_observably_empty() {
        let graph = Graph::new(IdentityConfig::default());
        let id = record_id("User:1");
        graph.put_record(id.clone(), scalar_record(&[("name", json!("A"))]));
        let proxy = graph.materialize_record(&id);
        graph.remove_record(&id);
        assert_eq!(proxy.get("name"), None);
        assert_eq!(graph.get_record(&id), None);
    }

    #[test]
    fn flush_coalesces_dirty_keys() {
        let graph = Graph::new(IdentityConfig::default());
        graph.put_record(record_id("User:1"), scalar_record(&[("a", json!(1))]));
        graph.put_record(record_id("User:1"), scalar_record(&[("b", json!(2))]));
        let dirty = graph.flush();
        assert_eq!(dirty.len(), 2);
        assert!(graph.flush().is_empty(), "second flush has nothing pending");
    }
}
