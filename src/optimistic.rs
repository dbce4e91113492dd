//! The optimistic layer stack (spec §4.4): an ordered stack of transactional
//! overlays — entity patches, connection edits, deletions.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::Value;

use crate::record::{FieldValue, Record, RecordId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Merge,
    Replace,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Position {
    Start,
    End,
    After,
    Before,
}

#[derive(Clone, Debug)]
pub struct PageInfoPatch {
    pub has_next_page: Option<bool>,
    pub has_previous_page: Option<bool>,
    pub start_cursor: Option<Option<String>>,
    pub end_cursor: Option<Option<String>>,
}

impl PageInfoPatch {
    pub fn empty() -> Self {
        Self {
            has_next_page: None,
            has_previous_page: None,
            start_cursor: None,
            end_cursor: None,
        }
    }
}

/// A single queued edit within a layer (spec §3 "Optimistic layers").
#[derive(Clone, Debug)]
pub enum Operation {
    PatchEntity {
        id: RecordId,
        patch: Record,
        mode: Mode,
    },
    DeleteEntity {
        id: RecordId,
    },
    ConnectionAddNode {
        canonical_key: String,
        node_id: RecordId,
        edge_fields: Record,
        position: Position,
        anchor: Option<RecordId>,
        cursor: Option<String>,
    },
    ConnectionRemoveNode {
        canonical_key: String,
        node_id: RecordId,
    },
    ConnectionPatch {
        canonical_key: String,
        patch: PageInfoPatch,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerState {
    Live,
    Committed,
    Reverted,
}

/// The builder surface handed to a `modifyOptimistic` callback (spec §4.4).
/// `data` is `Some` only during `commit(data)`'s re-invocation, enabling
/// temp→server identifier substitution (spec §9).
pub struct OptimisticTx<'a> {
    ops: RefCell<Vec<Operation>>,
    identify: &'a dyn Fn(&Value) -> Option<RecordId>,
    pub data: Option<&'a Value>,
}

impl<'a> OptimisticTx<'a> {
    pub(crate) fn new(identify: &'a dyn Fn(&Value) -> Option<RecordId>, data: Option<&'a Value>) -> Self {
        Self {
            ops: RefCell::new(Vec::new()),
            identify,
            data,
        }
    }

    pub fn patch(&self, id: impl Into<RecordId>, patch: Record, mode: Mode) {
        self.ops.borrow_mut().push(Operation::PatchEntity {
            id: id.into(),
            patch,
            mode,
        });
    }

    pub fn delete(&self, id: impl Into<RecordId>) {
        self.ops.borrow_mut().push(Operation::DeleteEntity { id: id.into() });
    }

    pub fn connection(&self, parent: RecordId, connection_key: &str, filters: &serde_json::Map<String, Value>) -> ConnectionTx<'_, 'a> {
        let canonical_key = crate::keys::build_connection_canonical_key(&parent, connection_key, filters);
        ConnectionTx { tx: self, canonical_key }
    }

    pub(crate) fn into_ops(self) -> Vec<Operation> {
        self.ops.into_inner()
    }
}

pub struct ConnectionTx<'tx, 'a> {
    tx: &'tx OptimisticTx<'a>,
    canonical_key: String,
}

/// Options for `ConnectionTx::add_node` (spec §4.4).
#[derive(Default)]
pub struct AddNodeOptions {
    pub position: Option<Position>,
    pub anchor: Option<RecordId>,
    pub cursor: Option<String>,
    pub edge_fields: Option<Record>,
}

impl<'tx, 'a> ConnectionTx<'tx, 'a> {
    /// Queue a `ConnectionAddNode`. Invalid nodes (missing `__typename` or
    /// unidentifiable) are silently dropped; other ops in the same builder
    /// still apply (spec §4.5 validity filter, §8 boundary behavior).
    pub fn add_node(&self, node: &Value, opts: AddNodeOptions) {
        let Some(node_id) = (self.tx.identify)(node) else {
            return;
        };
        self.tx.ops.borrow_mut().push(Operation::ConnectionAddNode {
            canonical_key: self.canonical_key.clone(),
            node_id,
            edge_fields: opts.edge_fields.unwrap_or_default(),
            position: opts.position.unwrap_or(Position::End),
            anchor: opts.anchor,
            cursor: opts.cursor,
        });
    }

    pub fn remove_node(&self, node_id: RecordId) {
        self.tx.ops.borrow_mut().push(Operation::ConnectionRemoveNode {
            canonical_key: self.canonical_key.clone(),
            node_id,
        });
    }

    pub fn patch(&self, patch: PageInfoPatch) {
        self.tx.ops.borrow_mut().push(Operation::ConnectionPatch {
            canonical_key: self.canonical_key.clone(),
            patch,
        });
    }
}

type BuilderFn = dyn Fn(&OptimisticTx);

/// One entry in the optimistic stack (spec §3 "Optimistic layers").
pub struct Layer {
    pub id: u64,
    builder: Rc<BuilderFn>,
    ops: RefCell<Vec<Operation>>,
    state: Cell<LayerState>,
}

impl Layer {
    pub fn state(&self) -> LayerState {
        self.state.get()
    }

    pub fn ops(&self) -> std::cell::Ref<'_, Vec<Operation>> {
        self.ops.borrow()
    }

    /// `commit(data)`: re-invoke the builder with a `{data}` context so temp
    /// identifiers can be replaced by server values, then mark committed.
    /// A no-op on an already-committed or already-reverted layer (spec §3,
    /// §8: "`commit()` followed by any number of `revert()` calls is a
    /// no-op").
    pub fn commit(&self, identify: &dyn Fn(&Value) -> Option<RecordId>, data: Option<&Value>) {
        if self.state.get() != LayerState::Live {
            return;
        }
        let tx = OptimisticTx::new(identify, data);
        (self.builder)(&tx);
        *self.ops.borrow_mut() = tx.into_ops();
        self.state.set(LayerState::Committed);
        tracing::debug!(layer = self.id, ops = self.ops.borrow().len(), "optimistic layer committed");
    }

    /// `revert()`: no-op once committed; idempotent once reverted.
    pub fn revert(&self) {
        if self.state.get() == LayerState::Live {
            self.state.set(LayerState::Reverted);
            tracing::debug!(layer = self.id, "optimistic layer reverted");
        }
    }
}

/// Result of folding a single entity's patch/delete ops across effective
/// layers (see [`OptimisticStack::fold_entity`]).
#[derive(Clone, Debug)]
pub enum EntityFold {
    /// No effective layer deleted the entity; `patches` apply on top of
    /// whatever the base graph currently holds for it.
    Overlay(Vec<(Record, Mode)>),
    /// An effective layer deleted the entity; the base record is ignored
    /// and `patches` (those queued after the last effective delete) apply
    /// onto an empty record instead.
    Reset(Vec<(Record, Mode)>),
}

/// The totally ordered stack of layers (spec §3, §4.4).
#[derive(Default)]
pub struct OptimisticStack {
    layers: RefCell<Vec<Rc<Layer>>>,
    next_id: Cell<u64>,
}

impl OptimisticStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a new live layer by running `builder` once immediately to seed
    /// its initial ops.
    pub fn push(&self, identify: &dyn Fn(&Value) -> Option<RecordId>, builder: Rc<BuilderFn>) -> Rc<Layer> {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let tx = OptimisticTx::new(identify, None);
        (builder)(&tx);
        let ops = tx.into_ops();

        let layer = Rc::new(Layer {
            id,
            builder,
            ops: RefCell::new(ops),
            state: Cell::new(LayerState::Live),
        });
        self.layers.borrow_mut().push(layer.clone());
        layer
    }

    /// Live and committed layers, in stack order (spec §4.4: "Live layers
    /// apply in order on top of the base graph view").
    pub fn effective_layers(&self) -> Vec<Rc<Layer>> {
        self.layers
            .borrow()
            .iter()
            .filter(|l| l.state() != LayerState::Reverted)
            .cloned()
            .collect()
    }

    /// Fold the effective entity-patch/delete ops for `id`, in layer order.
    /// A delete does not short-circuit the fold: it resets the accumulated
    /// patches (and, for the caller, the base record) to empty, but patches
    /// from later layers still fold on top of that reset — a delete in an
    /// earlier layer followed by a patch in a later one resurrects the
    /// entity with the patched fields (spec §3 "operations applied in
    /// record order", §4.4 "later layer wins for conflicting fields").
    pub fn fold_entity(&self, id: &RecordId) -> EntityFold {
        let mut patches = Vec::new();
        let mut reset = false;
        for layer in self.effective_layers() {
            for op in layer.ops().iter() {
                match op {
                    Operation::PatchEntity { id: pid, patch, mode } if pid == id => {
                        patches.push((patch.clone(), *mode));
                    }
                    Operation::DeleteEntity { id: did } if did == id => {
                        patches.clear();
                        reset = true;
                    }
                    _ => {}
                }
            }
        }
        if reset {
            EntityFold::Reset(patches)
        } else {
            EntityFold::Overlay(patches)
        }
    }

    /// All connection ops for `canonical_key`, in layer order.
    pub fn connection_ops(&self, canonical_key: &str) -> Vec<Operation> {
        let mut out = Vec::new();
        for layer in self.effective_layers() {
            for op in layer.ops().iter() {
                let matches = match op {
                    Operation::ConnectionAddNode { canonical_key: k, .. }
                    | Operation::ConnectionRemoveNode { canonical_key: k, .. }
                    | Operation::ConnectionPatch { canonical_key: k, .. } => k == canonical_key,
                    _ => false,
                };
                if matches {
                    out.push(op.clone());
                }
            }
        }
        out
    }

    pub fn clear(&self) {
        self.layers.borrow_mut().clear();
    }
}

/// Apply a sequence of `(patch, mode)` pairs onto a snapshot, used both for
/// the optimistic fold and for `putRecord`'s own merge (spec G1).
pub fn apply_patch(base: &mut Record, patch: &Record, mode: Mode) {
    match mode {
        Mode::Replace => {
            base.clear();
            for (k, v) in patch {
                base.insert(k.clone(), v.clone());
            }
        }
        Mode::Merge => {
            for (k, v) in patch {
                // `FieldValue::Null` is an explicit overwrite (G1); there is
                // no "undefined" field value in this representation, so a
                // present key always overwrites here. Callers that want
                // "skip if unset" simply omit the key from the patch.
                base.insert(k.clone(), v.clone());
            }
        }
    }
}
