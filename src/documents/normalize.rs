//! Walk a plan against a response payload, writing records and connection
//! pages into the graph (spec §4.6 `normalize`).

use std::rc::Rc;

use serde_json::Value;

use crate::connections::PageSnapshot;
use crate::documents::fingerprint::{hash_value, scope_key, HotCache};
use crate::error::CacheError;
use crate::graph::Graph;
use crate::keys::{build_connection_canonical_key, build_connection_page_key, ROOT_ID};
use crate::planner::{FieldSpec, Plan, Variables};
use crate::record::{field_key, record_id, FieldValue, Record, RecordId};

/// The result of `normalize(document, variables, data)` (spec §4.6).
pub struct NormalizeReport {
    pub hot: bool,
}

/// Writes records via `graph.put_record`/`put_page` but does not flush —
/// callers that need watchers notified call `graph.flush()` and
/// `WatcherRegistry::notify_flush` themselves once, after `normalize`
/// returns, so a request's writes and its dispatch stay one coalesced step
/// (spec §4.7 "multiple record changes within one task are coalesced").
pub fn normalize(
    graph: &Rc<Graph>,
    hot_cache: &HotCache,
    document: &str,
    plan: &Plan,
    variables: &Variables,
    data: &Value,
) -> Result<NormalizeReport, CacheError> {
    normalize_at(graph, hot_cache, document, plan, variables, data, &record_id(ROOT_ID))
}

/// Same as [`normalize`], but writes into an arbitrary entity root instead
/// of the query root — used by `writeFragment`.
pub fn normalize_at(
    graph: &Rc<Graph>,
    hot_cache: &HotCache,
    document: &str,
    plan: &Plan,
    variables: &Variables,
    data: &Value,
    root_id: &RecordId,
) -> Result<NormalizeReport, CacheError> {
    let root_obj = data
        .as_object()
        .ok_or_else(|| CacheError::InvalidDocument("response data must be a JSON object".to_string()))?;

    walk_selection(graph, root_id, &plan.root, variables, root_obj);

    let fingerprint = hash_value(data);
    let scope = scope_key(document, variables);
    let hot = hot_cache.check(&format!("normalize:{scope}"), &fingerprint);

    Ok(NormalizeReport { hot })
}

/// Write every selected field of `data_obj` as a patch on `parent_id`, then
/// recurse into nested entities and connections. Absent response keys are
/// dropped from the patch entirely (G1: "undefined" preserves the prior
/// value instead of overwriting it).
fn walk_selection(
    graph: &Rc<Graph>,
    parent_id: &RecordId,
    selection: &[FieldSpec],
    variables: &Variables,
    data_obj: &serde_json::Map<String, Value>,
) {
    let mut patch = Record::new();
    for field in selection {
        let Some(raw) = data_obj.get(&field.response_key) else {
            continue;
        };

        if field.connection.is_some() {
            normalize_connection_field(graph, parent_id, field, variables, raw);
            continue;
        }

        let fk = field_key(field.field_key(variables));
        let value = normalize_value(graph, field, variables, raw);
        patch.insert(fk, value);
    }
    graph.put_record(parent_id.clone(), patch);
}

/// Normalize one field value: identifiable typed objects become `Ref`s (and
/// are recursively written), everything else is stored by value.
fn normalize_value(graph: &Rc<Graph>, field: &FieldSpec, variables: &Variables, raw: &Value) -> FieldValue {
    match raw {
        Value::Null => FieldValue::Null,
        Value::Array(items) => FieldValue::List(
            items
                .iter()
                .map(|item| normalize_value(graph, field, variables, item))
                .collect(),
        ),
        Value::Object(obj) => {
            if obj.contains_key("__typename") {
                if let Some(id) = graph.identify(raw) {
                    walk_selection(graph, &id, &field.selection, variables, obj);
                    return FieldValue::Ref(id);
                }
            }
            FieldValue::Object(raw.clone())
        }
        scalar => FieldValue::Scalar(scalar.clone()),
    }
}

/// Normalize a connection-shaped payload (`{ edges, pageInfo }`): fold it
/// into the canonical connection state (spec §4.5) and stash a synthetic
/// page record for `getRecord`/debugging purposes. Nodes are normalized as
/// entities the same way any other selected object would be; cursor and
/// other edge-level fields are kept directly on the canonical `Edge`
/// instead of materializing a separate per-edge graph record, since nothing
/// downstream needs an edge's own stable identity (documented in
/// DESIGN.md).
fn normalize_connection_field(graph: &Rc<Graph>, parent_id: &RecordId, field: &FieldSpec, variables: &Variables, raw: &Value) {
    let Some(conn) = &field.connection else { return };
    let (filters, pagination) = field.connection_args(variables);
    let canonical_key = build_connection_canonical_key(parent_id, &conn.connection_key, &filters);
    let all_args = field.build_args(variables);
    let page_id = record_id(build_connection_page_key(parent_id, &field.field_name, &all_args));

    let edges_spec = field.selection.iter().find(|f| f.field_name == "edges");
    let node_spec = edges_spec.and_then(|e| e.selection.iter().find(|f| f.field_name == "node"));

    let edges_raw = raw.get("edges").and_then(Value::as_array).cloned().unwrap_or_default();
    let mut node_refs = Vec::with_capacity(edges_raw.len());
    let mut edges = Vec::with_capacity(edges_raw.len());

    for edge_raw in &edges_raw {
        let Some(node_raw) = edge_raw.get("node") else { continue };
        if node_raw.is_null() {
            continue;
        }
        let node_obj = match node_raw.as_object() {
            Some(obj) => obj,
            None => continue,
        };
        let Some(node_id) = graph.identify(node_raw) else { continue };
        if let Some(node_selection) = node_spec.map(|s| &s.selection) {
            walk_selection(graph, &node_id, node_selection, variables, node_obj);
        }

        let cursor = edge_raw.get("cursor").and_then(Value::as_str).map(String::from);
        let mut edge_fields = Record::new();
        if let Some(edge_obj) = edge_raw.as_object() {
            for (key, value) in edge_obj {
                if key == "node" || key == "cursor" {
                    continue;
                }
                edge_fields.insert(field_key(key.clone()), FieldValue::Scalar(value.clone()));
            }
        }

        node_refs.push(node_id.clone());
        edges.push(crate::connections::Edge { node_id, cursor, edge_fields });
    }

    let page_info_raw = raw.get("pageInfo").cloned().unwrap_or(Value::Null);
    let page_info = crate::connections::PageInfo {
        has_next_page: page_info_raw.get("hasNextPage").and_then(Value::as_bool).unwrap_or(false),
        has_previous_page: page_info_raw.get("hasPreviousPage").and_then(Value::as_bool).unwrap_or(false),
        start_cursor: page_info_raw.get("startCursor").and_then(Value::as_str).map(String::from),
        end_cursor: page_info_raw.get("endCursor").and_then(Value::as_str).map(String::from),
    };

    let after = pagination.get("after").and_then(Value::as_str).map(String::from);
    let before = pagination.get("before").and_then(Value::as_str).map(String::from);

    let snapshot = PageSnapshot { edges, page_info, after, before };
    graph.connections.normalize_page(&canonical_key, page_id.clone(), snapshot);

    let mut page_record = Record::new();
    page_record.insert(
        field_key("edges"),
        FieldValue::List(node_refs.into_iter().map(FieldValue::Ref).collect()),
    );
    page_record.insert(field_key("pageInfo"), FieldValue::Object(page_info_raw));
    graph.put_record(page_id, page_record);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use crate::documents::materialize::materialize;
    use crate::planner::Planner;
    use serde_json::json;

    #[test]
    fn normalize_then_materialize_round_trips_entity_and_connection() {
        let graph = Graph::new(IdentityConfig::default());
        let hot = HotCache::new();
        let planner = Planner::new();

        let document = r#"
            query Feed {
                viewer {
                    id
                    __typename
                    name
                    posts(first: 2) {
                        edges {
                            cursor
                            node { id __typename title }
                        }
                        pageInfo { hasNextPage hasPreviousPage startCursor endCursor }
                    }
                }
            }
        "#;
        let plan = planner.get_plan(document).unwrap();
        let variables = Variables::new();

        let data = json!({
            "viewer": {
                "id": "1",
                "__typename": "User",
                "name": "Ada",
                "posts": {
                    "edges": [
                        {"cursor": "c1", "node": {"id": "1", "__typename": "Post", "title": "First"}},
                        {"cursor": "c2", "node": {"id": "2", "__typename": "Post", "title": "Second"}},
                    ],
                    "pageInfo": {"hasNextPage": false, "hasPreviousPage": false, "startCursor": "c1", "endCursor": "c2"},
                }
            }
        });

        let report = normalize(&graph, &hot, document, &plan, &variables, &data).unwrap();
        assert!(!report.hot, "first normalization is never hot");

        let viewer = graph.get_record(&record_id("User:1")).unwrap();
        assert_eq!(viewer.get("name"), Some(&FieldValue::Scalar(json!("Ada"))));

        let result = materialize(&graph, &HotCache::new(), document, &plan, &variables).unwrap();
        let root = &result.data;
        let crate::documents::MaterializedValue::Entity { fields, .. } = root.get("viewer").unwrap() else {
            panic!("expected viewer to materialize as an entity");
        };
        assert_eq!(fields.get("name").unwrap().to_json(), json!("Ada"));

        let crate::documents::MaterializedValue::Connection { edges, page_info } = fields.get("posts").unwrap() else {
            panic!("expected posts to materialize as a connection");
        };
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].cursor.as_deref(), Some("c1"));
        assert!(!page_info.has_next_page);

        // Re-normalizing the identical payload is hot.
        let report = normalize(&graph, &hot, document, &plan, &variables, &data).unwrap();
        assert!(report.hot);
    }

    #[test]
    fn rejects_non_object_response_data() {
        let graph = Graph::new(IdentityConfig::default());
        let hot = HotCache::new();
        let plan = Plan {
            root: vec![],
            operation_kind: crate::planner::OperationKind::Query,
            variables: Default::default(),
        };
        let err = normalize(&graph, &hot, "query { x }", &plan, &Variables::new(), &json!([1, 2])).unwrap_err();
        assert!(matches!(err, CacheError::InvalidDocument(_)));
    }
}
