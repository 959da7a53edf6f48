//! Deferred expressions over the node tree.
//!
//! A `Path` is a chain of steps built up front and evaluated later against a
//! concrete node. Steps are explicit constructors (`field`, `index`, `call`,
//! arithmetic and comparison combinators) so a grammar definition can describe
//! "the value of my first sibling, minus four" before any node exists.

use crate::node::{Looked, NodeId, Tree};
use crate::value::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("node '{node}' has no attribute, metadata or child named '{name}'")]
    UnknownAttribute { node: String, name: String },
    #[error("node '{0}' has no parent")]
    NoParent(String),
    #[error("cannot index into {0}")]
    NotIndexable(String),
    #[error("index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: i64, len: usize },
    #[error("expected a value but path step produced {0}")]
    ExpectedValue(String),
    #[error("value is not callable")]
    NotCallable,
    #[error("call failed: {0}")]
    Call(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("arithmetic error: {0}")]
    Arithmetic(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    Len,
}

/// An operand of a binary step or a call argument: either a literal value or
/// a nested path evaluated against the same target node.
#[derive(Debug, Clone)]
pub enum Operand {
    Lit(Value),
    Path(Path),
}

impl From<i64> for Operand {
    fn from(x: i64) -> Operand {
        Operand::Lit(Value::Int(x))
    }
}

impl From<&str> for Operand {
    fn from(s: &str) -> Operand {
        Operand::Lit(Value::Str(s.to_string()))
    }
}

impl From<Value> for Operand {
    fn from(v: Value) -> Operand {
        Operand::Lit(v)
    }
}

impl From<Path> for Operand {
    fn from(p: Path) -> Operand {
        Operand::Path(p)
    }
}

#[derive(Debug, Clone)]
enum Step {
    Field(String),
    Index(i64),
    Call(Vec<Operand>),
    DescendantsNamed(String),
    Binary(BinOp, Box<Operand>),
    Unary(UnOp),
}

/// A deferred expression. The empty path evaluates to the target node itself.
#[derive(Debug, Clone, Default)]
pub struct Path {
    steps: Vec<Step>,
}

/// The outcome of evaluating a path step chain.
#[derive(Debug, Clone)]
pub enum Resolved {
    Node(NodeId),
    Nodes(Vec<NodeId>),
    Value(Value),
}

impl Path {
    pub fn new() -> Path {
        Path::default()
    }

    fn step(mut self, step: Step) -> Path {
        self.steps.push(step);
        self
    }

    /// Follow a name: on a node, `parent`, `root`, `children` and `siblings`
    /// are structural, anything else goes through the lookup fallback.
    pub fn field(self, name: &str) -> Path {
        self.step(Step::Field(name.to_string()))
    }

    pub fn index(self, idx: i64) -> Path {
        self.step(Step::Index(idx))
    }

    /// Invoke the function value the chain has produced so far. Arguments are
    /// resolved against the original target node.
    pub fn call<I>(self, args: I) -> Path
    where
        I: IntoIterator,
        I::Item: Into<Operand>,
    {
        self.step(Step::Call(args.into_iter().map(Into::into).collect()))
    }

    pub fn descendants_named(self, name: &str) -> Path {
        self.step(Step::DescendantsNamed(name.to_string()))
    }

    pub fn add(self, rhs: impl Into<Operand>) -> Path {
        self.step(Step::Binary(BinOp::Add, Box::new(rhs.into())))
    }

    pub fn sub(self, rhs: impl Into<Operand>) -> Path {
        self.step(Step::Binary(BinOp::Sub, Box::new(rhs.into())))
    }

    pub fn mul(self, rhs: impl Into<Operand>) -> Path {
        self.step(Step::Binary(BinOp::Mul, Box::new(rhs.into())))
    }

    pub fn div(self, rhs: impl Into<Operand>) -> Path {
        self.step(Step::Binary(BinOp::Div, Box::new(rhs.into())))
    }

    pub fn rem(self, rhs: impl Into<Operand>) -> Path {
        self.step(Step::Binary(BinOp::Rem, Box::new(rhs.into())))
    }

    pub fn eq(self, rhs: impl Into<Operand>) -> Path {
        self.step(Step::Binary(BinOp::Eq, Box::new(rhs.into())))
    }

    pub fn ne(self, rhs: impl Into<Operand>) -> Path {
        self.step(Step::Binary(BinOp::Ne, Box::new(rhs.into())))
    }

    pub fn lt(self, rhs: impl Into<Operand>) -> Path {
        self.step(Step::Binary(BinOp::Lt, Box::new(rhs.into())))
    }

    pub fn le(self, rhs: impl Into<Operand>) -> Path {
        self.step(Step::Binary(BinOp::Le, Box::new(rhs.into())))
    }

    pub fn gt(self, rhs: impl Into<Operand>) -> Path {
        self.step(Step::Binary(BinOp::Gt, Box::new(rhs.into())))
    }

    pub fn ge(self, rhs: impl Into<Operand>) -> Path {
        self.step(Step::Binary(BinOp::Ge, Box::new(rhs.into())))
    }

    pub fn neg(self) -> Path {
        self.step(Step::Unary(UnOp::Neg))
    }

    pub fn not(self) -> Path {
        self.step(Step::Unary(UnOp::Not))
    }

    pub fn len(self) -> Path {
        self.step(Step::Unary(UnOp::Len))
    }

    /// Evaluate the chain against `target`. Nested operand paths are resolved
    /// against the same target, not against intermediate results.
    pub fn evaluate(&self, tree: &Tree, target: NodeId) -> Result<Resolved, PathError> {
        let mut cur = Resolved::Node(target);
        for step in &self.steps {
            cur = apply_step(tree, target, cur, step)?;
        }
        Ok(cur)
    }

    /// Evaluate and require a plain value.
    pub fn evaluate_value(&self, tree: &Tree, target: NodeId) -> Result<Value, PathError> {
        to_value(tree, self.evaluate(tree, target)?)
    }
}

fn apply_step(
    tree: &Tree,
    target: NodeId,
    cur: Resolved,
    step: &Step,
) -> Result<Resolved, PathError> {
    match step {
        Step::Field(name) => apply_field(tree, cur, name),
        Step::Index(idx) => apply_index(tree, cur, *idx),
        Step::Call(args) => apply_call(tree, target, cur, args),
        Step::DescendantsNamed(name) => match cur {
            Resolved::Node(n) => Ok(Resolved::Nodes(tree.descendants_named(n, name))),
            other => Err(PathError::Type(format!(
                "descendants lookup needs a node, found {}",
                describe(tree, &other)
            ))),
        },
        Step::Binary(op, rhs) => {
            let lhs = to_value(tree, cur)?;
            let rhs = resolve_operand(tree, target, rhs)?;
            apply_binary(*op, lhs, rhs).map(Resolved::Value)
        }
        Step::Unary(op) => apply_unary(tree, cur, *op),
    }
}

fn apply_field(tree: &Tree, cur: Resolved, name: &str) -> Result<Resolved, PathError> {
    match cur {
        Resolved::Node(n) => match name {
            "parent" => tree
                .parent(n)
                .map(Resolved::Node)
                .ok_or_else(|| PathError::NoParent(tree.name(n).to_string())),
            "root" => Ok(Resolved::Node(tree.root_of(n))),
            "children" => Ok(Resolved::Nodes(tree.children(n).to_vec())),
            "siblings" => Ok(Resolved::Nodes(tree.siblings(n).to_vec())),
            _ => match tree.lookup(n, name) {
                Some(Looked::Value(v)) => Ok(Resolved::Value(v)),
                Some(Looked::Node(child)) => Ok(Resolved::Node(child)),
                None => Err(PathError::UnknownAttribute {
                    node: tree.display_name(n),
                    name: name.to_string(),
                }),
            },
        },
        other => Err(PathError::Type(format!(
            "field '{}' needs a node, found {}",
            name,
            describe(tree, &other)
        ))),
    }
}

fn apply_index(tree: &Tree, cur: Resolved, idx: i64) -> Result<Resolved, PathError> {
    fn norm(idx: i64, len: usize) -> Result<usize, PathError> {
        let i = if idx < 0 { idx + len as i64 } else { idx };
        if i < 0 || i as usize >= len {
            Err(PathError::IndexOutOfBounds { index: idx, len })
        } else {
            Ok(i as usize)
        }
    }
    match cur {
        Resolved::Nodes(nodes) => {
            let i = norm(idx, nodes.len())?;
            Ok(Resolved::Node(nodes[i]))
        }
        Resolved::Value(Value::List(items)) => {
            let i = norm(idx, items.len())?;
            Ok(Resolved::Value(items[i].clone()))
        }
        Resolved::Value(Value::Bytes(b)) => {
            let i = norm(idx, b.len())?;
            Ok(Resolved::Value(Value::Int(b[i] as i64)))
        }
        Resolved::Value(Value::Str(s)) => {
            let chars: Vec<char> = s.chars().collect();
            let i = norm(idx, chars.len())?;
            Ok(Resolved::Value(Value::Str(chars[i].to_string())))
        }
        other => Err(PathError::NotIndexable(describe(tree, &other))),
    }
}

fn apply_call(
    tree: &Tree,
    target: NodeId,
    cur: Resolved,
    args: &[Operand],
) -> Result<Resolved, PathError> {
    let callee = to_value(tree, cur)?;
    let f = match callee {
        Value::Func(f) => f,
        _ => return Err(PathError::NotCallable),
    };
    let mut resolved_args = Vec::with_capacity(args.len());
    for arg in args {
        resolved_args.push(resolve_operand(tree, target, arg)?);
    }
    f(&resolved_args).map(Resolved::Value).map_err(PathError::Call)
}

fn apply_binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, PathError> {
    use BinOp::*;
    match op {
        Add => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_add(b)
                .map(Value::Int)
                .ok_or_else(|| PathError::Arithmetic("integer overflow in +".to_string())),
            (Value::Str(mut a), Value::Str(b)) => {
                a.push_str(&b);
                Ok(Value::Str(a))
            }
            (Value::Bytes(mut a), Value::Bytes(b)) => {
                a.extend_from_slice(&b);
                Ok(Value::Bytes(a))
            }
            (Value::List(mut a), Value::List(b)) => {
                a.extend(b);
                Ok(Value::List(a))
            }
            (a, b) => Err(PathError::Type(format!("cannot add {} and {}", a, b))),
        },
        Sub | Mul | Div | Rem => {
            let (a, b) = match (lhs, rhs) {
                (Value::Int(a), Value::Int(b)) => (a, b),
                (a, b) => {
                    return Err(PathError::Type(format!(
                        "'{}' needs integers, found {} and {}",
                        op.symbol(),
                        a,
                        b
                    )))
                }
            };
            let result = match op {
                Sub => a.checked_sub(b),
                Mul => a.checked_mul(b),
                Div => {
                    if b == 0 {
                        return Err(PathError::Arithmetic("division by zero".to_string()));
                    }
                    a.checked_div(b)
                }
                Rem => {
                    if b == 0 {
                        return Err(PathError::Arithmetic("remainder by zero".to_string()));
                    }
                    a.checked_rem(b)
                }
                _ => unreachable!(),
            };
            result
                .map(Value::Int)
                .ok_or_else(|| PathError::Arithmetic(format!("integer overflow in {}", op.symbol())))
        }
        Eq => Ok(Value::Bool(lhs == rhs)),
        Ne => Ok(Value::Bool(lhs != rhs)),
        Lt | Le | Gt | Ge => {
            let ord = lhs.compare(&rhs).ok_or_else(|| {
                PathError::Type(format!("cannot order {} against {}", lhs, rhs))
            })?;
            let ok = match op {
                Lt => ord.is_lt(),
                Le => ord.is_le(),
                Gt => ord.is_gt(),
                Ge => ord.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(ok))
        }
    }
}

fn apply_unary(tree: &Tree, cur: Resolved, op: UnOp) -> Result<Resolved, PathError> {
    match op {
        UnOp::Len => match cur {
            Resolved::Nodes(nodes) => Ok(Resolved::Value(Value::Int(nodes.len() as i64))),
            Resolved::Value(Value::List(v)) => Ok(Resolved::Value(Value::Int(v.len() as i64))),
            Resolved::Value(Value::Bytes(b)) => Ok(Resolved::Value(Value::Int(b.len() as i64))),
            Resolved::Value(Value::Str(s)) => {
                Ok(Resolved::Value(Value::Int(s.chars().count() as i64)))
            }
            other => Err(PathError::Type(format!(
                "cannot take length of {}",
                describe(tree, &other)
            ))),
        },
        UnOp::Neg => match to_value(tree, cur)? {
            Value::Int(x) => x
                .checked_neg()
                .map(|n| Resolved::Value(Value::Int(n)))
                .ok_or_else(|| PathError::Arithmetic("integer overflow in negation".to_string())),
            other => Err(PathError::Type(format!("cannot negate {}", other))),
        },
        UnOp::Not => match to_value(tree, cur)? {
            Value::Bool(b) => Ok(Resolved::Value(Value::Bool(!b))),
            other => Err(PathError::Type(format!("cannot logically negate {}", other))),
        },
    }
}

fn resolve_operand(tree: &Tree, target: NodeId, operand: &Operand) -> Result<Value, PathError> {
    match operand {
        Operand::Lit(v) => Ok(v.clone()),
        Operand::Path(p) => p.evaluate_value(tree, target),
    }
}

fn to_value(tree: &Tree, resolved: Resolved) -> Result<Value, PathError> {
    match resolved {
        Resolved::Value(v) => Ok(v),
        other => Err(PathError::ExpectedValue(describe(tree, &other))),
    }
}

fn describe(tree: &Tree, resolved: &Resolved) -> String {
    match resolved {
        Resolved::Node(n) => format!("node '{}'", tree.display_name(*n)),
        Resolved::Nodes(nodes) => format!("{} nodes", nodes.len()),
        Resolved::Value(v) => format!("value {}", v),
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node")?;
        for step in &self.steps {
            match step {
                Step::Field(name) => write!(f, ".{}", name)?,
                Step::Index(idx) => write!(f, "[{}]", idx)?,
                Step::Call(args) => {
                    write!(f, "(")?;
                    for (i, arg) in args.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", arg)?;
                    }
                    write!(f, ")")?;
                }
                Step::DescendantsNamed(name) => write!(f, ".descendants_named({})", name)?,
                Step::Binary(op, rhs) => write!(f, " {} {}", op.symbol(), rhs)?,
                Step::Unary(UnOp::Neg) => write!(f, ".neg()")?,
                Step::Unary(UnOp::Not) => write!(f, ".not()")?,
                Step::Unary(UnOp::Len) => write!(f, ".len()")?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Lit(v) => write!(f, "{}", v),
            Operand::Path(p) => write!(f, "({})", p),
        }
    }
}
