//! Arena-backed node tree produced by parsing: attributes, metadata,
//! structural traversals, and the attribute-fallback lookup rule.

use crate::validation::Issue;
use crate::value::Value;

/// Index of a node inside a [`Tree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// A stored attribute or metadata entry. Repeated writes to the same key
/// promote the entry to a list rather than overwrite.
#[derive(Debug, Clone)]
enum Slot {
    One(Value),
    Many(Vec<Value>),
}

impl Slot {
    fn push(&mut self, value: Value) {
        match self {
            Slot::One(existing) => {
                let first = existing.clone();
                *self = Slot::Many(vec![first, value]);
            }
            Slot::Many(items) => items.push(value),
        }
    }

    fn as_value(&self) -> Value {
        match self {
            Slot::One(v) => v.clone(),
            Slot::Many(items) => Value::List(items.clone()),
        }
    }
}

#[derive(Debug, Clone)]
struct NodeData {
    name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    // Association lists: insertion order is display order.
    attributes: Vec<(String, Slot)>,
    metadata: Vec<(String, Slot)>,
}

/// Result of the fallback lookup: a plain value, or a same-named child node.
#[derive(Debug, Clone)]
pub enum Looked {
    Value(Value),
    Node(NodeId),
}

/// Predicate over a node, used by the filtered traversals.
pub type Predicate = Box<dyn Fn(&Tree, NodeId) -> bool>;

/// Arena of nodes. Nodes are never freed; detaching a node from its parent
/// makes it unreachable from the root.
#[derive(Debug, Default, Clone)]
pub struct Tree {
    nodes: Vec<NodeData>,
}

impl Tree {
    pub fn new() -> Tree {
        Tree::default()
    }

    /// Create a node and, if a parent is given, append it to the parent's
    /// child list immediately.
    pub fn add_node(&mut self, name: &str, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(NodeData {
            name: name.to_string(),
            parent,
            children: Vec::new(),
            attributes: Vec::new(),
            metadata: Vec::new(),
        });
        if let Some(p) = parent {
            self.nodes[p.0].children.push(id);
        }
        id
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id.0].name
    }

    /// Merge values into the node's attribute or metadata map. A key already
    /// present keeps its earlier values; the new value is appended, promoting
    /// the entry to a list.
    pub fn add_data(&mut self, id: NodeId, values: Vec<(String, Value)>, is_metadata: bool) {
        let data = &mut self.nodes[id.0];
        let map = if is_metadata { &mut data.metadata } else { &mut data.attributes };
        for (key, value) in values {
            match map.iter_mut().find(|(k, _)| *k == key) {
                Some((_, slot)) => slot.push(value),
                None => map.push((key, Slot::One(value))),
            }
        }
    }

    pub fn set_attribute(&mut self, id: NodeId, key: &str, value: Value) {
        self.add_data(id, vec![(key.to_string(), value)], false);
    }

    pub fn set_metadata(&mut self, id: NodeId, key: &str, value: Value) {
        self.add_data(id, vec![(key.to_string(), value)], true);
    }

    pub fn attribute(&self, id: NodeId, key: &str) -> Option<Value> {
        self.nodes[id.0]
            .attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, slot)| slot.as_value())
    }

    pub fn metadata(&self, id: NodeId, key: &str) -> Option<Value> {
        self.nodes[id.0]
            .metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, slot)| slot.as_value())
    }

    pub fn attribute_names(&self, id: NodeId) -> impl Iterator<Item = &str> {
        self.nodes[id.0].attributes.iter().map(|(k, _)| k.as_str())
    }

    pub fn metadata_names(&self, id: NodeId) -> impl Iterator<Item = &str> {
        self.nodes[id.0].metadata.iter().map(|(k, _)| k.as_str())
    }

    /// Record a validation finding in the node's metadata.
    pub fn record_issue(&mut self, id: NodeId, issue: Issue) {
        self.set_metadata(id, "validation", Value::Issue(issue));
    }

    /// All findings recorded on this node.
    pub fn issues(&self, id: NodeId) -> Vec<Issue> {
        match self.metadata(id, "validation") {
            Some(Value::Issue(i)) => vec![i],
            Some(Value::List(items)) => items
                .into_iter()
                .filter_map(|v| match v {
                    Value::Issue(i) => Some(i),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Name lookup with fallback: attributes first, then metadata, then a
    /// same-named child node.
    pub fn lookup(&self, id: NodeId, key: &str) -> Option<Looked> {
        if let Some(v) = self.attribute(id, key) {
            return Some(Looked::Value(v));
        }
        if let Some(v) = self.metadata(id, key) {
            return Some(Looked::Value(v));
        }
        self.children(id)
            .iter()
            .copied()
            .find(|c| self.name(*c) == key)
            .map(Looked::Node)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    /// Children of the parent, including this node. Empty for a root.
    pub fn siblings(&self, id: NodeId) -> &[NodeId] {
        match self.parent(id) {
            Some(p) => self.children(p),
            None => &[],
        }
    }

    pub fn root_of(&self, id: NodeId) -> NodeId {
        let mut cur = id;
        while let Some(p) = self.parent(cur) {
            cur = p;
        }
        cur
    }

    /// Ancestors from the immediate parent up to the root.
    pub fn ancestors(&self, id: NodeId) -> Ancestors<'_> {
        Ancestors { tree: self, next: self.parent(id) }
    }

    /// The node itself, then its ancestors up to the root.
    pub fn self_and_ancestors(&self, id: NodeId) -> Ancestors<'_> {
        Ancestors { tree: self, next: Some(id) }
    }

    /// Descendants in pre-order, not including the node itself.
    pub fn descendants(&self, id: NodeId) -> Descendants<'_> {
        let mut stack: Vec<NodeId> = self.children(id).to_vec();
        stack.reverse();
        Descendants { tree: self, stack }
    }

    /// The node itself, then its descendants in pre-order.
    pub fn self_and_descendants(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::once(id).chain(self.descendants(id))
    }

    pub fn ancestors_matching(&self, id: NodeId, predicates: &[Predicate]) -> Vec<NodeId> {
        self.ancestors(id).filter(|n| self.matches(*n, predicates)).collect()
    }

    pub fn descendants_matching(&self, id: NodeId, predicates: &[Predicate]) -> Vec<NodeId> {
        self.descendants(id).filter(|n| self.matches(*n, predicates)).collect()
    }

    /// Descendants whose name equals `name`, in pre-order.
    pub fn descendants_named(&self, id: NodeId, name: &str) -> Vec<NodeId> {
        self.descendants(id).filter(|n| self.name(*n) == name).collect()
    }

    pub fn matches(&self, id: NodeId, predicates: &[Predicate]) -> bool {
        predicates.iter().all(|p| p(self, id))
    }

    pub fn count_descendants(&self, id: NodeId) -> usize {
        self.descendants(id).count()
    }

    /// Name plus an ordinal when the node shares its name with a sibling,
    /// e.g. `chunk[2]`.
    pub fn display_name(&self, id: NodeId) -> String {
        let name = self.name(id);
        let same_named: Vec<NodeId> = self
            .siblings(id)
            .iter()
            .copied()
            .filter(|s| self.name(*s) == name)
            .collect();
        if same_named.len() > 1 {
            let ordinal = same_named.iter().position(|s| *s == id).unwrap_or(0);
            format!("{}[{}]", name, ordinal)
        } else {
            name.to_string()
        }
    }

    /// Remove the node from its parent's child list. The arena slot remains
    /// but the node is no longer reachable from the root.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(p) = self.parent(id) {
            self.nodes[p.0].children.retain(|c| *c != id);
            self.nodes[id.0].parent = None;
        }
    }
}

pub struct Ancestors<'a> {
    tree: &'a Tree,
    next: Option<NodeId>,
}

impl Iterator for Ancestors<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let cur = self.next?;
        self.next = self.tree.parent(cur);
        Some(cur)
    }
}

pub struct Descendants<'a> {
    tree: &'a Tree,
    stack: Vec<NodeId>,
}

impl Iterator for Descendants<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let cur = self.stack.pop()?;
        for child in self.tree.children(cur).iter().rev() {
            self.stack.push(*child);
        }
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_keys_promote_to_list() {
        let mut tree = Tree::new();
        let n = tree.add_node("n", None);
        tree.set_attribute(n, "x", Value::Str("a".into()));
        tree.set_attribute(n, "x", Value::Str("b".into()));
        tree.set_attribute(n, "x", Value::Str("c".into()));
        let got = tree.attribute(n, "x").expect("attribute present");
        assert_eq!(
            got,
            Value::List(vec!["a".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn lookup_prefers_attributes_then_metadata_then_child() {
        let mut tree = Tree::new();
        let n = tree.add_node("n", None);
        let _child = tree.add_node("x", Some(n));
        tree.set_metadata(n, "x", Value::Int(2));
        match tree.lookup(n, "x") {
            Some(Looked::Value(Value::Int(2))) => {}
            other => panic!("expected metadata hit, got {:?}", other),
        }
        tree.set_attribute(n, "x", Value::Int(1));
        match tree.lookup(n, "x") {
            Some(Looked::Value(Value::Int(1))) => {}
            other => panic!("expected attribute hit, got {:?}", other),
        }
    }

    #[test]
    fn display_name_ordinals() {
        let mut tree = Tree::new();
        let root = tree.add_node("root", None);
        let a = tree.add_node("chunk", Some(root));
        let b = tree.add_node("chunk", Some(root));
        let c = tree.add_node("end", Some(root));
        assert_eq!(tree.display_name(a), "chunk[0]");
        assert_eq!(tree.display_name(b), "chunk[1]");
        assert_eq!(tree.display_name(c), "end");
    }

    #[test]
    fn detach_removes_from_parent() {
        let mut tree = Tree::new();
        let root = tree.add_node("root", None);
        let a = tree.add_node("a", Some(root));
        let b = tree.add_node("b", Some(root));
        tree.detach(a);
        assert_eq!(tree.children(root), &[b]);
        assert_eq!(tree.parent(a), None);
    }
}
