//! Prompt extraction from node-graph exports
//!
//! Visual editors export a `nodes` array of loosely typed records. Two kinds
//! carry prompt text: primitive text nodes, whose titles may say "positive" or
//! "negative", and text-encode nodes, which carry no such label and are
//! assigned by their order of `id` (positive first).

use serde_json::Value;

/// Primitive value node type
pub const PRIMITIVE_NODE: &str = "PrimitiveNode";
/// Text encoder node type
pub const TEXT_ENCODE_NODE: &str = "CLIPTextEncode";

/// Prompts found in a node graph
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptPair {
    pub positive: Option<String>,
    pub negative: Option<String>,
}

impl PromptPair {
    fn is_complete(&self) -> bool {
        self.positive.is_some() && self.negative.is_some()
    }
}

/// Extract positive/negative prompt text from a list of nodes.
///
/// Titled primitive nodes are matched first. Any slot still empty is then
/// filled from text-encode nodes sorted by `id`: index 0 is positive, index 1
/// is negative.
pub fn extract_prompts(nodes: &[Value]) -> PromptPair {
    let mut found = PromptPair::default();

    for node in nodes {
        if node_type(node) != Some(PRIMITIVE_NODE) {
            continue;
        }
        let Some(text) = first_widget_text(node) else {
            continue;
        };
        let Some(title) = node.get("title").and_then(Value::as_str) else {
            continue;
        };

        let title = title.to_lowercase();
        if found.positive.is_none() && title.contains("positive") {
            found.positive = Some(text.to_string());
        } else if found.negative.is_none() && title.contains("negative") {
            found.negative = Some(text.to_string());
        }
    }

    if found.is_complete() {
        return found;
    }

    let mut encoders: Vec<&Value> = nodes
        .iter()
        .filter(|n| node_type(n) == Some(TEXT_ENCODE_NODE))
        .collect();
    encoders.sort_by(|a, b| node_id(a).total_cmp(&node_id(b)));

    for (index, node) in encoders.iter().enumerate().take(2) {
        let Some(text) = first_widget_text(node) else {
            continue;
        };
        if index == 0 && found.positive.is_none() {
            found.positive = Some(text.to_string());
        } else if index == 1 && found.negative.is_none() {
            found.negative = Some(text.to_string());
        }
    }

    found
}

fn node_type(node: &Value) -> Option<&str> {
    node.get("type").and_then(Value::as_str)
}

/// Sort key; a missing or non-numeric id sorts as 0
fn node_id(node: &Value) -> f64 {
    node.get("id").and_then(Value::as_f64).unwrap_or(0.0)
}

/// First widget value when it is non-blank text
fn first_widget_text(node: &Value) -> Option<&str> {
    node.get("widgets_values")
        .and_then(Value::as_array)
        .and_then(|w| w.first())
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}
