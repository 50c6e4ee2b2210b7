//! Workflow graph normalization and output-node inspection.

use serde_json::{Map, Value};

use crate::error::TaskError;

/// Node class types that write results somewhere.
pub const OUTPUT_NODE_TYPES: [&str; 3] = ["SaveImage", "PreviewImage", "SaveVideo"];

/// Which output nodes a workflow contains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputNodeReport {
    pub has_save_image: bool,
    pub has_output_node: bool,
}

/// Inspect a workflow for output nodes, accepting either the id-keyed
/// map form or an object carrying a `nodes` array.
pub fn inspect_output_nodes(workflow: &Value) -> OutputNodeReport {
    let mut report = OutputNodeReport::default();
    let nodes: Box<dyn Iterator<Item = &Value>> = match workflow {
        Value::Object(map) => match map.get("nodes") {
            Some(Value::Array(list)) => Box::new(map.values().chain(list.iter())),
            _ => Box::new(map.values()),
        },
        Value::Array(list) => Box::new(list.iter()),
        _ => Box::new(std::iter::empty()),
    };

    for node in nodes {
        let Some(class_type) = node.get("class_type").and_then(Value::as_str) else {
            continue;
        };
        if class_type == "SaveImage" {
            report.has_save_image = true;
        }
        if OUTPUT_NODE_TYPES.contains(&class_type) {
            report.has_output_node = true;
        }
    }
    report
}

/// Convert a node list (bare array or `{"nodes": [...]}`) to the
/// id-keyed map form the worker API accepts. Maps without a `nodes`
/// array pass through unchanged.
///
/// Output-node problems are logged as warnings only. A result that is
/// not a JSON object is a setup error.
pub fn normalize_workflow(workflow: Value) -> Result<Value, TaskError> {
    let report = inspect_output_nodes(&workflow);
    if !report.has_output_node {
        tracing::warn!(
            "No output nodes found in workflow. You need at least one SaveImage, PreviewImage, or SaveVideo node"
        );
    }
    if !report.has_save_image {
        tracing::warn!("No SaveImage node found in workflow. Images may not be saved to disk");
    }

    let normalized = match workflow {
        Value::Array(nodes) => index_nodes(nodes),
        Value::Object(mut map) => match map.remove("nodes") {
            Some(Value::Array(nodes)) => {
                tracing::info!(nodes = nodes.len(), "Converting node list to id-keyed workflow");
                index_nodes(nodes)
            }
            Some(other) => {
                map.insert("nodes".to_string(), other);
                Value::Object(map)
            }
            None => Value::Object(map),
        },
        other => other,
    };

    if !normalized.is_object() {
        return Err(TaskError::Setup(
            "Workflow must be a JSON object keyed by node id".to_string(),
        ));
    }
    Ok(normalized)
}

fn index_nodes(nodes: Vec<Value>) -> Value {
    let mut map = Map::with_capacity(nodes.len());
    for node in nodes {
        let id = match node.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => "0".to_string(),
        };
        map.insert(id, node);
    }
    Value::Object(map)
}
