//! The compiled `Plan` type (spec §3 "Plan", §4.2).

use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::keys::{self, args_suffix};

/// Where an argument's value comes from: a literal in the document, or a
/// reference to an operation variable.
#[derive(Clone, Debug)]
pub enum ArgValue {
    Literal(Value),
    Variable(String),
}

/// The operation variables supplied at read/write time.
pub type Variables = Map<String, Value>;

/// Resolve an `ArgValue` against `variables`, per spec (G5): a variable whose
/// resolved value is `undefined` (i.e. absent from `variables`) is dropped
/// entirely; an explicit `null` is preserved.
fn resolve_arg(value: &ArgValue, variables: &Variables) -> Option<Value> {
    match value {
        ArgValue::Literal(v) => Some(v.clone()),
        ArgValue::Variable(name) => variables.get(name).cloned(),
    }
}

/// Pagination argument names recognized for connection detection (spec §3).
pub const PAGINATION_ARGS: [&str; 4] = ["first", "last", "after", "before"];

/// Connection metadata attached to a field marked as a connection, either by
/// `@connection(key?, filters?)` or structurally (`edges` + `pageInfo`
/// siblings) (spec §3, §4.2).
#[derive(Clone, Debug)]
pub struct ConnectionSpec {
    pub connection_key: String,
    /// Declared or inferred non-pagination arg names.
    pub filters: Vec<String>,
}

/// One field within a selection set (spec §3 "FieldSpec").
#[derive(Clone, Debug)]
pub struct FieldSpec {
    pub response_key: String,
    pub field_name: String,
    pub args: Vec<(String, ArgValue)>,
    pub connection: Option<ConnectionSpec>,
    pub selection: Vec<FieldSpec>,
    /// Operation variables referenced anywhere in this field's subtree,
    /// used for cheap dependency signatures (spec §4.2).
    pub referenced_variables: HashSet<String>,
}

impl FieldSpec {
    /// `buildArgs(variables)`: drop keys whose resolved value is `undefined`.
    pub fn build_args(&self, variables: &Variables) -> Map<String, Value> {
        let mut out = Map::new();
        for (name, value) in &self.args {
            if let Some(resolved) = resolve_arg(value, variables) {
                out.insert(name.clone(), resolved);
            }
        }
        out
    }

    /// `stringifyArgs(variables)`: stable JSON, or `"{}"` when empty.
    pub fn stringify_args(&self, variables: &Variables) -> String {
        args_suffix(&self.build_args(variables))
    }

    /// The field key used to store/read this field on its parent record:
    /// `fieldName` or `fieldName({args})` — note this uses `field_name`,
    /// never the alias, so aliasing a field never fragments its storage
    /// (spec §4.6).
    pub fn field_key(&self, variables: &Variables) -> String {
        keys::build_field_key(&self.field_name, &self.build_args(variables))
    }

    /// Split `build_args` into `(filters, pagination)` for connection
    /// fields, per the connection's declared/inferred `filters` list.
    pub fn connection_args(&self, variables: &Variables) -> (Map<String, Value>, Map<String, Value>) {
        let all = self.build_args(variables);
        let Some(conn) = &self.connection else {
            return (all, Map::new());
        };
        let mut filters = Map::new();
        let mut pagination = Map::new();
        for (k, v) in all {
            if conn.filters.contains(&k) {
                filters.insert(k, v);
            } else {
                pagination.insert(k, v);
            }
        }
        (filters, pagination)
    }
}

/// A compiled, reusable selection plan for one document (spec §3 "Plan").
#[derive(Clone, Debug)]
pub struct Plan {
    pub root: Vec<FieldSpec>,
    /// `query` | `mutation` | `subscription`, or `fragment` for a standalone
    /// fragment document used by `watchFragment`/`readFragment`.
    pub operation_kind: OperationKind,
    pub variables: HashSet<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
    Fragment,
}
