//! Render a parsed tree for display.

use crate::node::{NodeId, Tree};
use crate::value::{hex_string, Value};

const MAX_BYTES_SHOWN: usize = 16;

/// One-line rendering of a value, eliding long byte strings.
fn value_summary(v: &Value) -> String {
    match v {
        Value::Bytes(b) if b.len() > MAX_BYTES_SHOWN => {
            format!(
                "hex({} ... {} bytes total)",
                hex_string(&b[..MAX_BYTES_SHOWN]),
                b.len()
            )
        }
        other => format!("{}", other),
    }
}

/// Multi-line indented rendering of a node and its descendants, with
/// attributes first and metadata after.
pub fn tree_string(tree: &Tree, root: NodeId) -> String {
    let mut lines = Vec::new();
    render(tree, root, 0, &mut lines);
    lines.join("\n")
}

fn render(tree: &Tree, node: NodeId, depth: usize, lines: &mut Vec<String>) {
    let pad = "  ".repeat(depth);
    lines.push(format!("{}{}", pad, tree.display_name(node)));
    let names: Vec<String> = tree.attribute_names(node).map(|s| s.to_string()).collect();
    for name in names {
        if let Some(v) = tree.attribute(node, &name) {
            lines.push(format!("{}  {} = {}", pad, name, value_summary(&v)));
        }
    }
    let names: Vec<String> = tree.metadata_names(node).map(|s| s.to_string()).collect();
    for name in names {
        if let Some(v) = tree.metadata(node, &name) {
            lines.push(format!("{}  ({}) = {}", pad, name, value_summary(&v)));
        }
    }
    for child in tree.children(node).to_vec() {
        render(tree, child, depth + 1, lines);
    }
}
