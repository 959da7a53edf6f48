//! Derived attributes: values computed from the tree after a node has been
//! read, recorded under a name on the node.

use crate::definition::ConstructError;
use crate::node::{NodeId, Tree};
use crate::path::{Operand, Path};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Failure of an attribute producer. Downgraded to an Error-level finding by
/// the construct loop; construction continues without the attribute.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct AttributeError(pub String);

pub type AttrFn =
    Arc<dyn Fn(&Tree, NodeId, &[Value]) -> Result<Value, AttributeError> + Send + Sync>;

enum Producer {
    Path(Path),
    Func { f: AttrFn, args: Vec<Operand> },
}

/// A named derived attribute on a definition.
pub struct Attribute {
    name: String,
    producer: Producer,
}

impl Attribute {
    /// Derive from a deferred expression evaluated against the node.
    pub fn path(name: &str, path: Path) -> Attribute {
        Attribute { name: name.to_string(), producer: Producer::Path(path) }
    }

    /// Derive from a native function; arguments are resolved against the node
    /// before the call.
    pub fn func<I>(name: &str, f: AttrFn, args: I) -> Attribute
    where
        I: IntoIterator,
        I::Item: Into<Operand>,
    {
        Attribute {
            name: name.to_string(),
            producer: Producer::Func { f, args: args.into_iter().map(Into::into).collect() },
        }
    }

    /// Test one bit of a byte in an existing string or bytes attribute.
    /// `index` picks the byte (default 0); `bit` counts from the least
    /// significant bit.
    pub fn bit_flag(name: &str, attr: &str, bit: u32, index: Option<usize>) -> Attribute {
        let attr = attr.to_string();
        let idx = index.unwrap_or(0);
        let f: AttrFn = Arc::new(move |tree, node, _args| {
            let value = tree.attribute(node, &attr).ok_or_else(|| {
                AttributeError(format!("no attribute '{}' to read a bit from", attr))
            })?;
            let byte = match &value {
                Value::Bytes(b) => b.get(idx).copied(),
                Value::Str(s) => s.as_bytes().get(idx).copied(),
                _ => None,
            }
            .ok_or_else(|| {
                AttributeError(format!("attribute '{}' has no byte at index {}", attr, idx))
            })?;
            Ok(Value::Bool(byte & (1 << bit) != 0))
        });
        Attribute::func(name, f, Vec::<Operand>::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn produce(&self, tree: &Tree, node: NodeId) -> Result<Value, ConstructError> {
        match &self.producer {
            Producer::Path(p) => Ok(p.evaluate_value(tree, node)?),
            Producer::Func { f, args } => {
                let mut resolved = Vec::with_capacity(args.len());
                for arg in args {
                    let v = match arg {
                        Operand::Lit(v) => v.clone(),
                        Operand::Path(p) => p.evaluate_value(tree, node)?,
                    };
                    resolved.push(v);
                }
                Ok(f(tree, node, &resolved)?)
            }
        }
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.producer {
            Producer::Path(p) => write!(f, "Attribute({} = {})", self.name, p),
            Producer::Func { .. } => write!(f, "Attribute({} = <fn>)", self.name),
        }
    }
}
