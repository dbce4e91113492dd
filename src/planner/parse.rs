//! Compile a GraphQL document into a [`Plan`] (spec §4.2), using the
//! teacher's own front end, `apollo-parser`.
//!
//! Named fragments and inline fragments are inlined at compile time (this
//! crate performs no schema validation, spec §1 Non-goals, so a fragment's
//! type condition is never checked — its selections are simply spliced in).

use std::collections::{HashMap, HashSet};

use apollo_parser::cst::{self, CstNode};
use apollo_parser::Parser;
use serde_json::Value;

use crate::error::CacheError;
use crate::planner::plan::{ArgValue, ConnectionSpec, FieldSpec, OperationKind, Plan, PAGINATION_ARGS};

fn node_text<N: CstNode>(node: &N) -> String {
    node.syntax().text().to_string()
}

fn name_text(name: Option<cst::Name>) -> Option<String> {
    name.map(|n| node_text(&n))
}

/// Compile `source` into a [`Plan`]. `fragment_name`, when given, selects a
/// standalone fragment document for `watchFragment`/`readFragment` instead
/// of an executable operation.
pub fn compile_document(source: &str, fragment_name: Option<&str>) -> Result<Plan, CacheError> {
    let parser = Parser::new(source);
    let tree = parser.parse();
    let errors: Vec<String> = tree.errors().map(|e| e.to_string()).collect();
    if !errors.is_empty() {
        return Err(CacheError::InvalidDocument(errors.join("; ")));
    }
    let document = tree.document();

    let mut fragments: HashMap<String, cst::SelectionSet> = HashMap::new();
    for definition in document.definitions() {
        if let cst::Definition::FragmentDefinition(frag) = definition {
            if let (Some(name), Some(set)) = (name_text(frag.fragment_name().and_then(|f| f.name())), frag.selection_set()) {
                fragments.insert(name, set);
            }
        }
    }

    if let Some(target) = fragment_name {
        let set = fragments
            .get(target)
            .ok_or_else(|| CacheError::InvalidDocument(format!("fragment `{target}` not found in document")))?;
        let mut referenced = HashSet::new();
        let root = compile_selection_set(set, &fragments, &mut referenced)?;
        return Ok(Plan {
            root,
            operation_kind: OperationKind::Fragment,
            variables: referenced,
        });
    }

    for definition in document.definitions() {
        if let cst::Definition::OperationDefinition(op) = definition {
            let kind = operation_kind(&op);
            let set = op
                .selection_set()
                .ok_or_else(|| CacheError::InvalidDocument("operation has no selection set".into()))?;
            let mut referenced = HashSet::new();
            let root = compile_selection_set(&set, &fragments, &mut referenced)?;
            return Ok(Plan {
                root,
                operation_kind: kind,
                variables: referenced,
            });
        }
    }

    Err(CacheError::InvalidDocument("no executable operation found in document".into()))
}

fn operation_kind(op: &cst::OperationDefinition) -> OperationKind {
    match op.operation_type() {
        Some(t) if t.mutation_token().is_some() => OperationKind::Mutation,
        Some(t) if t.subscription_token().is_some() => OperationKind::Subscription,
        _ => OperationKind::Query,
    }
}

fn compile_selection_set(
    set: &cst::SelectionSet,
    fragments: &HashMap<String, cst::SelectionSet>,
    referenced: &mut HashSet<String>,
) -> Result<Vec<FieldSpec>, CacheError> {
    let mut fields = Vec::new();
    for selection in set.selections() {
        match selection {
            cst::Selection::Field(field) => {
                fields.push(compile_field(&field, fragments, referenced)?);
            }
            cst::Selection::FragmentSpread(spread) => {
                if let Some(name) = name_text(spread.fragment_name().and_then(|f| f.name())) {
                    if let Some(inner) = fragments.get(&name) {
                        fields.extend(compile_selection_set(inner, fragments, referenced)?);
                    }
                }
            }
            cst::Selection::InlineFragment(inline) => {
                if let Some(inner) = inline.selection_set() {
                    fields.extend(compile_selection_set(&inner, fragments, referenced)?);
                }
            }
        }
    }
    Ok(fields)
}

fn compile_field(
    field: &cst::Field,
    fragments: &HashMap<String, cst::SelectionSet>,
    referenced: &mut HashSet<String>,
) -> Result<FieldSpec, CacheError> {
    let field_name = name_text(field.name()).ok_or_else(|| CacheError::InvalidDocument("field with no name".into()))?;
    let response_key = field
        .alias()
        .and_then(|a| name_text(a.name()))
        .unwrap_or_else(|| field_name.clone());

    let mut args = Vec::new();
    if let Some(arguments) = field.arguments() {
        for argument in arguments.arguments() {
            let Some(arg_name) = name_text(argument.name()) else {
                continue;
            };
            let Some(value) = argument.value() else {
                continue;
            };
            let arg_value = compile_value(&value, referenced)?;
            args.push((arg_name, arg_value));
        }
    }

    let mut field_referenced = HashSet::new();
    let selection = match field.selection_set() {
        Some(set) => compile_selection_set(&set, fragments, &mut field_referenced)?,
        None => Vec::new(),
    };
    referenced.extend(field_referenced.iter().cloned());

    let connection = detect_connection(field, &args, &selection);

    let mut subtree_vars = field_referenced;
    for (_, v) in &args {
        if let ArgValue::Variable(name) = v {
            subtree_vars.insert(name.clone());
        }
    }

    Ok(FieldSpec {
        response_key,
        field_name,
        args,
        connection,
        selection,
        referenced_variables: subtree_vars,
    })
}

fn detect_connection(field: &cst::Field, args: &[(String, ArgValue)], selection: &[FieldSpec]) -> Option<ConnectionSpec> {
    if let Some(directives) = field.directives() {
        for directive in directives.directives() {
            if name_text(directive.name()).as_deref() == Some("connection") {
                let mut key = None;
                let mut filters = None;
                if let Some(arguments) = directive.arguments() {
                    for argument in arguments.arguments() {
                        let Some(name) = name_text(argument.name()) else { continue };
                        let Some(value) = argument.value() else { continue };
                        match name.as_str() {
                            "key" => key = string_literal(&value),
                            "filters" => filters = string_list_literal(&value),
                            _ => {}
                        }
                    }
                }
                let connection_key = key.unwrap_or_else(|| field_name_of(field));
                let declared_args: Vec<String> = args.iter().map(|(n, _)| n.clone()).collect();
                let filters = filters.unwrap_or_else(|| infer_filters(&declared_args));
                return Some(ConnectionSpec { connection_key, filters });
            }
        }
    }

    // Structural detection: `edges` + `pageInfo` siblings.
    let has_edges = selection.iter().any(|f| f.field_name == "edges");
    let has_page_info = selection.iter().any(|f| f.field_name == "pageInfo");
    if has_edges && has_page_info {
        let declared_args: Vec<String> = args.iter().map(|(n, _)| n.clone()).collect();
        let connection_key = field_name_of(field);
        let filters = infer_filters(&declared_args);
        return Some(ConnectionSpec { connection_key, filters });
    }
    None
}

fn field_name_of(field: &cst::Field) -> String {
    name_text(field.name()).unwrap_or_default()
}

fn infer_filters(declared_args: &[String]) -> Vec<String> {
    declared_args
        .iter()
        .filter(|a| !PAGINATION_ARGS.contains(&a.as_str()))
        .cloned()
        .collect()
}

fn string_literal(value: &cst::Value) -> Option<String> {
    match value {
        cst::Value::StringValue(s) => Some(unquote(&node_text(s))),
        _ => None,
    }
}

fn string_list_literal(value: &cst::Value) -> Option<Vec<String>> {
    match value {
        cst::Value::ListValue(list) => Some(
            list.values()
                .filter_map(|v| string_literal(&v))
                .collect(),
        ),
        _ => None,
    }
}

fn unquote(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('"').unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix('"').unwrap_or(trimmed);
    trimmed.to_string()
}

fn compile_value(value: &cst::Value, referenced: &mut HashSet<String>) -> Result<ArgValue, CacheError> {
    match value {
        cst::Value::Variable(var) => {
            let raw = node_text(var);
            let name = raw.trim_start_matches('$').to_string();
            referenced.insert(name.clone());
            Ok(ArgValue::Variable(name))
        }
        cst::Value::StringValue(s) => Ok(ArgValue::Literal(Value::String(unquote(&node_text(s))))),
        cst::Value::IntValue(i) => {
            let text = node_text(i);
            let n: i64 = text.trim().parse().map_err(|_| CacheError::InvalidDocument(format!("invalid int literal: {text}")))?;
            Ok(ArgValue::Literal(Value::from(n)))
        }
        cst::Value::FloatValue(f) => {
            let text = node_text(f);
            let n: f64 = text.trim().parse().map_err(|_| CacheError::InvalidDocument(format!("invalid float literal: {text}")))?;
            Ok(ArgValue::Literal(
                serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null),
            ))
        }
        cst::Value::BooleanValue(b) => Ok(ArgValue::Literal(Value::Bool(node_text(b).trim() == "true"))),
        cst::Value::NullValue(_) => Ok(ArgValue::Literal(Value::Null)),
        cst::Value::EnumValue(e) => Ok(ArgValue::Literal(Value::String(node_text(e).trim().to_string()))),
        cst::Value::ListValue(list) => {
            let mut items = Vec::new();
            for item in list.values() {
                match compile_value(&item, referenced)? {
                    ArgValue::Literal(v) => items.push(v),
                    // A variable inside a list literal resolves at `buildArgs`
                    // time; unsupported here for simplicity (no nested-list
                    // variable interpolation), matching this crate's scope.
                    ArgValue::Variable(_) => {}
                }
            }
            Ok(ArgValue::Literal(Value::Array(items)))
        }
        cst::Value::ObjectValue(obj) => {
            let mut map = serde_json::Map::new();
            for field in obj.object_fields() {
                let Some(name) = name_text(field.name()) else { continue };
                let Some(val) = field.value() else { continue };
                if let ArgValue::Literal(v) = compile_value(&val, referenced)? {
                    map.insert(name, v);
                }
            }
            Ok(ArgValue::Literal(Value::Object(map)))
        }
    }
}
