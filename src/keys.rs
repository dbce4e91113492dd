//! Stable identity strings for fields, connection pages, and canonical
//! connections (spec §4.3).
//!
//! Everything here is pure string building: no mutable state, no I/O.

use itertools::Itertools;
use serde_json::{Map, Value};

/// The root record id (spec §3, `ROOT_ID`).
pub const ROOT_ID: &str = "@";

/// Produce a stable JSON string for an arguments map: object keys sorted
/// lexicographically at every level, `null` preserved, array order kept,
/// integral floats rendered as integers. Never emits a key whose value was
/// dropped by the caller (callers drop `undefined` before handing us a map).
pub fn stable_json(value: &Value) -> String {
    let mut out = String::new();
    write_stable(value, &mut out);
    out
}

fn write_stable(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push_str(&i.to_string());
            } else if let Some(u) = n.as_u64() {
                out.push_str(&u.to_string());
            } else {
                out.push_str(&n.to_string());
            }
        }
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s).expect("string serialization never fails"));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, key) in sorted_keys(map).into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serialization never fails"));
                out.push(':');
                write_stable(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn sorted_keys(map: &Map<String, Value>) -> Vec<&String> {
    map.keys().sorted().collect()
}

/// Build the stable JSON suffix for an args map, or `"{}"` when empty.
pub fn args_suffix(args: &Map<String, Value>) -> String {
    if args.is_empty() {
        "{}".to_string()
    } else {
        stable_json(&Value::Object(args.clone()))
    }
}

/// `fieldName` if args are empty, else `fieldName({...})` (spec §4.3).
pub fn build_field_key(field_name: &str, args: &Map<String, Value>) -> String {
    if args.is_empty() {
        field_name.to_string()
    } else {
        format!("{field_name}({})", args_suffix(args))
    }
}

/// `root` selection key: `fieldName({args})`.
pub fn root_key(field_name: &str, args: &Map<String, Value>) -> String {
    build_field_key(field_name, args)
}

/// `nested` selection key: `parentId.fieldName({args})`.
pub fn nested_key(parent_id: &str, field_name: &str, args: &Map<String, Value>) -> String {
    format!("{parent_id}.{}", build_field_key(field_name, args))
}

/// Per-page connection RecordId: `@.parentId.fieldName({all-args})`.
pub fn build_connection_page_key(parent_id: &str, field_name: &str, args: &Map<String, Value>) -> String {
    format!("@.{parent_id}.{field_name}({})", args_suffix(args))
}

/// Canonical-connection RecordId:
/// `@connection.parentId.<connectionKey>({filters-only-args})`.
pub fn build_connection_canonical_key(
    parent_id: &str,
    connection_key: &str,
    filter_args: &Map<String, Value>,
) -> String {
    format!(
        "@connection.{parent_id}.{connection_key}({})",
        args_suffix(filter_args)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stable_json_sorts_keys_and_preserves_null() {
        let v = json!({"b": 1, "a": null, "c": [3, 1, 2]});
        assert_eq!(stable_json(&v), r#"{"a":null,"b":1,"c":[3,1,2]}"#);
    }

    #[test]
    fn field_key_empty_args_has_no_parens() {
        let empty = Map::new();
        assert_eq!(build_field_key("posts", &empty), "posts");
    }

    #[test]
    fn field_key_stable_under_reordering() {
        let mut a = Map::new();
        a.insert("first".into(), json!(10));
        a.insert("after".into(), json!("c1"));

        let mut b = Map::new();
        b.insert("after".into(), json!("c1"));
        b.insert("first".into(), json!(10));

        assert_eq!(build_field_key("posts", &a), build_field_key("posts", &b));
    }

    #[test]
    fn canonical_key_shape() {
        let mut filters = Map::new();
        filters.insert("status".into(), json!("PUBLISHED"));
        let key = build_connection_canonical_key("User:1", "posts", &filters);
        assert_eq!(key, r#"@connection.User:1.posts({"status":"PUBLISHED"})"#);
    }

    #[test]
    fn stable_json_snapshot_for_a_nested_filter_set() {
        let v = json!({"status": "PUBLISHED", "tags": ["rust", "graphql"], "archived": null});
        insta::assert_snapshot!(stable_json(&v), @r#"{"archived":null,"status":"PUBLISHED","tags":["rust","graphql"]}"#);
    }
}
