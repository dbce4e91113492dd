//! Canonical connections (spec §4.5): a single ordered, de-duplicated view of
//! a logical connection across pages and optimistic overlays.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::optimistic::{Operation, OptimisticStack, Position};
use crate::record::{Record, RecordId};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Edge {
    pub node_id: RecordId,
    pub cursor: Option<String>,
    pub edge_fields: Record,
}

/// A single normalized page contributing to a canonical connection.
#[derive(Clone, Debug)]
pub struct PageSnapshot {
    pub edges: Vec<Edge>,
    pub page_info: PageInfo,
    pub after: Option<String>,
    pub before: Option<String>,
}

impl PageSnapshot {
    pub fn is_leader(&self) -> bool {
        self.after.is_none() && self.before.is_none()
    }
}

/// Mutable state tracked per canonical key (spec §3 "Canonical connection
/// state"): `base_edges`/`base_page_info` are the pre-overlay union. A fresh
/// leader page (no `after`/`before`) resets the base to exactly that page's
/// edges; earlier continuation pages are not retained once reset — only a
/// later continuation page that's re-sent after the leader refresh folds
/// back in (spec §4.5 "Leader refresh semantics", `DESIGN.md` Open Question
/// decision 1).
struct CanonicalState {
    base_edges: Vec<Edge>,
    base_page_info: PageInfo,
}

impl CanonicalState {
    fn new() -> Self {
        Self {
            base_edges: Vec::new(),
            base_page_info: PageInfo::default(),
        }
    }

    /// Ingest a freshly normalized page (spec §4.5 steps 1-3).
    fn apply_page(&mut self, _page_id: RecordId, snapshot: PageSnapshot) {
        if snapshot.is_leader() {
            // Leader refresh resets the base to exactly this page's edges.
            self.base_edges = dedup_fold(Vec::new(), &snapshot.edges);
            self.base_page_info = snapshot.page_info.clone();
        } else if snapshot.after.is_some() {
            self.base_edges = dedup_fold(std::mem::take(&mut self.base_edges), &snapshot.edges);
            self.base_page_info.has_next_page = snapshot.page_info.has_next_page;
            self.base_page_info.end_cursor = snapshot.page_info.end_cursor.clone();
        } else {
            // `before` cursor: continuation prepends.
            let mut merged = snapshot.edges.clone();
            for existing in &self.base_edges {
                if !merged.iter().any(|e| e.node_id == existing.node_id) {
                    merged.push(existing.clone());
                }
            }
            self.base_edges = merged;
            self.base_page_info.has_previous_page = snapshot.page_info.has_previous_page;
            self.base_page_info.start_cursor = snapshot.page_info.start_cursor.clone();
        }
    }
}

/// Append-or-update fold: keep first occurrence position, update
/// cursor/edge fields in place for repeats (spec §4.5 step 2).
fn dedup_fold(mut base: Vec<Edge>, incoming: &[Edge]) -> Vec<Edge> {
    for edge in incoming {
        if let Some(existing) = base.iter_mut().find(|e| e.node_id == edge.node_id) {
            existing.cursor = edge.cursor.clone();
            existing.edge_fields = edge.edge_fields.clone();
        } else {
            base.push(edge.clone());
        }
    }
    base
}

/// Owns every canonical connection's state for one [`crate::graph::Graph`].
#[derive(Default)]
pub struct ConnectionStore {
    canonical: RefCell<HashMap<String, CanonicalState>>,
}

impl ConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize_page(&self, canonical_key: &str, page_id: RecordId, snapshot: PageSnapshot) {
        self.canonical
            .borrow_mut()
            .entry(canonical_key.to_string())
            .or_insert_with(CanonicalState::new)
            .apply_page(page_id, snapshot);
    }

    /// Build the effective `(edges, pageInfo)` view for `canonical_key`:
    /// base union folded, then optimistic ops applied in layer order, then
    /// the validity filter (spec §4.5 steps 4-5; validity filtering happens
    /// at op-construction time in `optimistic::ConnectionTx::add_node`, so
    /// here we only need to apply ops that survived that filter).
    pub fn view(&self, canonical_key: &str, optimistic: &OptimisticStack) -> (Vec<Edge>, PageInfo) {
        let canonical = self.canonical.borrow();
        let Some(state) = canonical.get(canonical_key) else {
            return (Vec::new(), PageInfo::default());
        };
        let mut edges = state.base_edges.clone();
        let mut page_info = state.base_page_info.clone();

        for op in optimistic.connection_ops(canonical_key) {
            match op {
                Operation::ConnectionAddNode {
                    node_id,
                    edge_fields,
                    position,
                    anchor,
                    cursor,
                    ..
                } => {
                    edges.retain(|e| e.node_id != node_id);
                    let new_edge = Edge {
                        node_id,
                        cursor,
                        edge_fields,
                    };
                    match position {
                        Position::Start => edges.insert(0, new_edge),
                        Position::End => edges.push(new_edge),
                        Position::After => {
                            let idx = anchor
                                .as_ref()
                                .and_then(|a| edges.iter().position(|e| &e.node_id == a))
                                .map(|i| i + 1)
                                .unwrap_or(edges.len());
                            edges.insert(idx, new_edge);
                        }
                        Position::Before => {
                            let idx = anchor
                                .as_ref()
                                .and_then(|a| edges.iter().position(|e| &e.node_id == a))
                                .unwrap_or(0);
                            edges.insert(idx, new_edge);
                        }
                    }
                }
                Operation::ConnectionRemoveNode { node_id, .. } => {
                    edges.retain(|e| e.node_id != node_id);
                }
                Operation::ConnectionPatch { patch, .. } => {
                    if let Some(v) = patch.has_next_page {
                        page_info.has_next_page = v;
                    }
                    if let Some(v) = patch.has_previous_page {
                        page_info.has_previous_page = v;
                    }
                    if let Some(v) = patch.start_cursor {
                        page_info.start_cursor = v;
                    }
                    if let Some(v) = patch.end_cursor {
                        page_info.end_cursor = v;
                    }
                }
                _ => unreachable!("connection_ops only returns connection variants"),
            }
        }

        (edges, page_info)
    }

    pub fn clear(&self) {
        self.canonical.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimistic::{AddNodeOptions, Mode, OptimisticTx};
    use crate::record::record_id;
    use serde_json::json;
    use std::rc::Rc;

    fn edge(id: &str, cursor: &str) -> Edge {
        Edge {
            node_id: record_id(id),
            cursor: Some(cursor.to_string()),
            edge_fields: Record::new(),
        }
    }

    fn identify(obj: &serde_json::Value) -> Option<RecordId> {
        let typename = obj.get("__typename")?.as_str()?;
        let id = obj.get("id")?.as_str()?;
        Some(record_id(format!("{typename}:{id}")))
    }

    /// Reproduces spec §8 scenario 3 exactly.
    #[test]
    fn connection_union_scenario() {
        let conn = ConnectionStore::new();
        let optimistic = OptimisticStack::new();
        let key = "@connection.User:1.posts({})";

        conn.normalize_page(
            key,
            record_id("@.User:1.posts({})"),
            PageSnapshot {
                edges: vec![edge("Post:1", "c1"), edge("Post:2", "c2")],
                page_info: PageInfo {
                    has_next_page: true,
                    has_previous_page: false,
                    start_cursor: Some("c1".into()),
                    end_cursor: Some("c2".into()),
                },
                after: None,
                before: None,
            },
        );

        conn.normalize_page(
            key,
            record_id("@.User:1.posts({after:c2})"),
            PageSnapshot {
                edges: vec![edge("Post:3", "c3"), edge("Post:4", "c4")],
                page_info: PageInfo {
                    has_next_page: false,
                    has_previous_page: true,
                    start_cursor: Some("c3".into()),
                    end_cursor: Some("c4".into()),
                },
                after: Some("c2".into()),
                before: None,
            },
        );

        let layer = optimistic.push(
            &identify,
            Rc::new(|tx: &OptimisticTx| {
                let conn_tx = tx.connection(record_id("User:1"), "posts", &serde_json::Map::new());
                conn_tx.remove_node(record_id("Post:1"));
            }),
        );
        let _ = &layer;

        let (edges, _) = conn.view(key, &optimistic);
        let ids: Vec<&str> = edges.iter().map(|e| e.node_id.as_ref()).collect();
        assert_eq!(ids, vec!["Post:2", "Post:3", "Post:4"]);

        // Leader refresh resets base to [P1, P2, P3]; the removeNode overlay
        // still hides P1.
        conn.normalize_page(
            key,
            record_id("@.User:1.posts({})"),
            PageSnapshot {
                edges: vec![edge("Post:1", "c1"), edge("Post:2", "c2"), edge("Post:3", "c3")],
                page_info: PageInfo {
                    has_next_page: true,
                    has_previous_page: false,
                    start_cursor: Some("c1".into()),
                    end_cursor: Some("c3".into()),
                },
                after: None,
                before: None,
            },
        );

        let (edges, _) = conn.view(key, &optimistic);
        let ids: Vec<&str> = edges.iter().map(|e| e.node_id.as_ref()).collect();
        assert_eq!(ids, vec!["Post:2", "Post:3"]);
    }

    #[test]
    fn invalid_add_is_silently_ignored_and_other_nodes_still_add() {
        let optimistic = OptimisticStack::new();
        optimistic.push(
            &identify,
            Rc::new(|tx: &OptimisticTx| {
                let conn_tx = tx.connection(record_id("User:1"), "posts", &serde_json::Map::new());
                conn_tx.add_node(&json!({"id": "1"}), AddNodeOptions::default());
                conn_tx.add_node(
                    &json!({"__typename": "Post", "id": "5"}),
                    AddNodeOptions {
                        position: Some(Position::End),
                        ..Default::default()
                    },
                );
            }),
        );
        let conn = ConnectionStore::new();
        let key = "@connection.User:1.posts({})";
        conn.normalize_page(
            key,
            record_id("@.User:1.posts({})"),
            PageSnapshot {
                edges: vec![],
                page_info: PageInfo::default(),
                after: None,
                before: None,
            },
        );
        let (edges, _) = conn.view(key, &optimistic);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].node_id.as_ref(), "Post:5");
        let _ = Mode::Merge;
    }
}
