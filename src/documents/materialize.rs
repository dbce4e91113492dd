//! Build reactive result trees from the graph per plan (spec §4.6
//! `materialize`).

use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::connections::PageInfo;
use crate::documents::fingerprint::{fingerprint_deps, scope_key, DepSet, HotCache};
use crate::error::CacheError;
use crate::graph::{Graph, RecordProxy};
use crate::keys::{build_connection_canonical_key, ROOT_ID};
use crate::planner::{FieldSpec, Plan, Variables};
use crate::record::{field_key, record_id, FieldValue, RecordId};

/// One materialized edge of a connection view.
#[derive(Clone)]
pub struct MaterializedEdge {
    pub node: MaterializedValue,
    pub cursor: Option<String>,
    pub edge_fields: IndexMap<String, MaterializedValue>,
}

/// The reactive result tree produced by `materialize` (spec §4.6). Entities
/// carry their stable [`RecordProxy`] (G3); connections carry a freshly
/// folded canonical view (spec §4.5).
#[derive(Clone)]
pub enum MaterializedValue {
    Null,
    /// A scalar or opaque plain object, returned by value.
    Leaf(Value),
    Entity {
        proxy: Rc<RecordProxy>,
        fields: IndexMap<String, MaterializedValue>,
    },
    List(Vec<MaterializedValue>),
    Connection {
        edges: Vec<MaterializedEdge>,
        page_info: PageInfo,
    },
}

impl MaterializedValue {
    /// Render to plain JSON, for snapshot comparisons / tests. Entity
    /// identity is lost in this projection (by design: it's only meaningful
    /// while navigating the live tree through proxies).
    pub fn to_json(&self) -> Value {
        match self {
            MaterializedValue::Null => Value::Null,
            MaterializedValue::Leaf(v) => v.clone(),
            MaterializedValue::Entity { fields, .. } => {
                Value::Object(fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
            MaterializedValue::List(items) => Value::Array(items.iter().map(MaterializedValue::to_json).collect()),
            MaterializedValue::Connection { edges, page_info } => {
                let edges_json: Vec<Value> = edges
                    .iter()
                    .map(|e| {
                        let mut obj: serde_json::Map<String, Value> =
                            e.edge_fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
                        obj.insert("node".to_string(), e.node.to_json());
                        if let Some(c) = &e.cursor {
                            obj.insert("cursor".to_string(), Value::String(c.clone()));
                        }
                        Value::Object(obj)
                    })
                    .collect();
                serde_json::json!({
                    "edges": edges_json,
                    "pageInfo": {
                        "hasNextPage": page_info.has_next_page,
                        "hasPreviousPage": page_info.has_previous_page,
                        "startCursor": page_info.start_cursor,
                        "endCursor": page_info.end_cursor,
                    }
                })
            }
        }
    }
}

/// The result of `materialize(document, variables)` (spec §4.6).
pub struct MaterializeResult {
    pub data: IndexMap<String, MaterializedValue>,
    pub hot: bool,
    pub fingerprint: String,
    /// `(RecordId, FieldKey)` pairs read while materializing, for watcher
    /// dependency tracking (spec §4.7).
    pub deps: DepSet,
}

pub fn materialize(
    graph: &Rc<Graph>,
    hot_cache: &HotCache,
    document: &str,
    plan: &Plan,
    variables: &Variables,
) -> Result<MaterializeResult, CacheError> {
    materialize_at(graph, hot_cache, document, plan, variables, &record_id(ROOT_ID))
}

/// Same as [`materialize`], but rooted at an arbitrary record instead of the
/// query root — used by `watchFragment`/`readFragment`/`writeFragment`
/// (spec §4.7 "same contract against a single entity root").
pub fn materialize_at(
    graph: &Rc<Graph>,
    hot_cache: &HotCache,
    document: &str,
    plan: &Plan,
    variables: &Variables,
    root_id: &RecordId,
) -> Result<MaterializeResult, CacheError> {
    let frame = graph.tracker.push_frame();
    let data = materialize_selection(graph, root_id, &plan.root, variables);
    graph.tracker.pop_frame();

    let deps: DepSet = frame.borrow().clone();
    let dep_values: Vec<_> = deps
        .iter()
        .map(|(id, field)| {
            let value = graph
                .get_record(id)
                .and_then(|r| r.get(field.as_ref()).map(FieldValue::to_json))
                .unwrap_or(Value::Null);
            ((id.clone(), field.clone()), value)
        })
        .collect();
    let fingerprint = fingerprint_deps(&dep_values);

    let scope = scope_key(document, variables);
    let hot = hot_cache.check(&format!("materialize:{scope}"), &fingerprint);

    Ok(MaterializeResult { data, hot, fingerprint, deps })
}

fn materialize_selection(
    graph: &Rc<Graph>,
    parent_id: &RecordId,
    selection: &[FieldSpec],
    variables: &Variables,
) -> IndexMap<String, MaterializedValue> {
    let mut out = IndexMap::new();
    for field in selection {
        if let Some(conn) = &field.connection {
            let (filters, _pagination) = field.connection_args(variables);
            let canonical_key = build_connection_canonical_key(parent_id, &conn.connection_key, &filters);
            // Connections are tracked as a single synthetic dependency on
            // their canonical key, since membership (not a single field) is
            // what a watcher needs to react to.
            graph
                .tracker
                .track(record_id(canonical_key.clone()), field_key("__connection"));
            let (edges, page_info) = graph.connections.view(&canonical_key, &graph.optimistic);

            let node_selection: &[FieldSpec] = field
                .selection
                .iter()
                .find(|f| f.field_name == "edges")
                .and_then(|edges_spec| edges_spec.selection.iter().find(|f| f.field_name == "node"))
                .map(|node_spec| node_spec.selection.as_slice())
                .unwrap_or(&[]);

            let mat_edges = edges
                .into_iter()
                .map(|edge| MaterializedEdge {
                    node: materialize_entity_ref(graph, &edge.node_id, node_selection, variables),
                    cursor: edge.cursor,
                    edge_fields: edge
                        .edge_fields
                        .iter()
                        .map(|(k, v)| (k.to_string(), materialize_stored(graph, v, &[], variables)))
                        .collect(),
                })
                .collect();

            out.insert(field.response_key.clone(), MaterializedValue::Connection { edges: mat_edges, page_info });
            continue;
        }

        let fk = field.field_key(variables);
        graph.tracker.track(parent_id.clone(), field_key(fk.clone()));
        let raw = graph.get_record(parent_id).and_then(|r| r.get(fk.as_str()).cloned());
        match raw {
            None => {}
            Some(value) => {
                out.insert(field.response_key.clone(), materialize_stored(graph, &value, &field.selection, variables));
            }
        }
    }
    out
}

fn materialize_entity_ref(
    graph: &Rc<Graph>,
    id: &RecordId,
    selection: &[FieldSpec],
    variables: &Variables,
) -> MaterializedValue {
    let proxy = graph.materialize_record(id);
    let fields = materialize_selection(graph, id, selection, variables);
    MaterializedValue::Entity { proxy, fields }
}

fn materialize_stored(
    graph: &Rc<Graph>,
    value: &FieldValue,
    selection: &[FieldSpec],
    variables: &Variables,
) -> MaterializedValue {
    match value {
        FieldValue::Null => MaterializedValue::Null,
        FieldValue::Scalar(v) | FieldValue::Object(v) => MaterializedValue::Leaf(v.clone()),
        FieldValue::Ref(id) => materialize_entity_ref(graph, id, selection, variables),
        FieldValue::List(items) => {
            MaterializedValue::List(items.iter().map(|item| materialize_stored(graph, item, selection, variables)).collect())
        }
    }
}
