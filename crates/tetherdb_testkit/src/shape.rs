//! Structural rendering of detached object graphs.
//!
//! Two graphs have the same shape when they hold the same classes and
//! scalar values and the same sharing structure: every object is rendered
//! once with a label numbered in visiting order, and later references to
//! it render as `{"ref": label}`. Object addresses never appear, so a
//! graph and its copy compare equal.

use serde_json::{json, Map, Value as Json};
use std::collections::HashMap;
use tetherdb_core::{Field, Object, ObjectId};

/// Renders the graph reachable from `root`.
pub fn graph_shape(root: &Object) -> Json {
    let mut labels = HashMap::new();
    render(root, &mut labels)
}

/// Renders several roots with one label table, so sharing between roots
/// shows up.
pub fn graph_shape_all(roots: &[Object]) -> Json {
    let mut labels = HashMap::new();
    Json::Array(roots.iter().map(|root| render(root, &mut labels)).collect())
}

fn render(object: &Object, labels: &mut HashMap<ObjectId, usize>) -> Json {
    if let Some(label) = labels.get(&object.identity()) {
        return json!({ "ref": label });
    }
    let label = labels.len();
    labels.insert(object.identity(), label);

    let data = object.snapshot();
    let mut fields = Map::new();
    for (name, field) in data.fields() {
        let rendered = match field {
            Field::Value(value) => serde_json::to_value(value).unwrap_or(Json::Null),
            Field::Link(None) => Json::Null,
            Field::Link(Some(target)) => render(target, labels),
            Field::List(items) => {
                Json::Array(items.iter().map(|item| render(item, labels)).collect())
            }
        };
        fields.insert(name.to_string(), rendered);
    }
    json!({ "label": label, "class": data.class_name(), "fields": fields })
}

/// Every object reachable from `roots`, each once.
pub fn reachable(roots: &[Object]) -> Vec<Object> {
    let mut seen = HashMap::new();
    let mut stack: Vec<Object> = roots.to_vec();
    let mut out = Vec::new();
    while let Some(object) = stack.pop() {
        if seen.insert(object.identity(), ()).is_some() {
            continue;
        }
        let data = object.snapshot();
        for (_, field) in data.fields() {
            match field {
                Field::Link(Some(target)) => stack.push(target.clone()),
                Field::List(items) => stack.extend(items.iter().cloned()),
                _ => {}
            }
        }
        out.push(object);
    }
    out
}

/// Clears every reference in the graph so cyclic graphs can be freed.
pub fn release_graph(roots: &[Object]) {
    for object in reachable(roots) {
        object.clear_references();
    }
}
