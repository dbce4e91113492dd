//! Dependency tracking (spec §9): "the core defines a `Tracker` with
//! `track(recordId, fieldKey)` and `notify(dirtySet)` hooks, and bindings
//! adapt." Reads under an active materialization push their `(id, field)`
//! pair onto the current tracking frame; writes don't go through here at all
//! (the graph store computes the dirty set directly).

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use crate::record::{FieldKey, RecordId};

pub type DepSet = HashSet<(RecordId, FieldKey)>;

/// One client owns exactly one `Tracker` (spec §5: "each `createCache` produces
/// an isolated instance; no process-wide mutable singletons").
#[derive(Default)]
pub struct Tracker {
    /// Stack of in-flight materializations; `track` appends to the innermost
    /// frame. A stack (rather than a single slot) lets materializing a nested
    /// entity from within another watcher's read still attribute deps
    /// correctly, and lets fingerprinting run concurrently with ordinary
    /// reads inside the same call.
    frames: RefCell<Vec<Rc<RefCell<DepSet>>>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a new empty dependency frame, returning a handle. Reads performed
    /// while the handle is alive — more precisely, until `pop` is called —
    /// are attributed to this frame.
    pub fn push_frame(&self) -> Rc<RefCell<DepSet>> {
        let frame = Rc::new(RefCell::new(DepSet::new()));
        self.frames.borrow_mut().push(frame.clone());
        frame
    }

    pub fn pop_frame(&self) {
        self.frames.borrow_mut().pop();
    }

    /// Record a read of `(id, field)` against the innermost active frame, if
    /// any. Reads outside of a materialization (e.g. `getRecord`) are
    /// untracked no-ops.
    pub fn track(&self, id: RecordId, field: FieldKey) {
        if let Some(frame) = self.frames.borrow().last() {
            frame.borrow_mut().insert((id, field));
        }
    }
}
