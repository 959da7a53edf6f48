//! Graded validation: severities, recorded findings, comparison checks and
//! the and/or combinator tree run at defined stages of construction.

use crate::definition::ConstructError;
use crate::node::{Looked, NodeId, Tree};
use crate::path::Path;
use crate::value::Value;
use regex::Regex;
use std::fmt;
use thiserror::Error;

/// How bad a finding is. Only `Fatal` aborts construction; everything below
/// is recorded on the node and parsing continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        };
        write!(f, "{}", s)
    }
}

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{severity}: {message}")]
pub struct Issue {
    pub severity: Severity,
    pub message: String,
}

impl Issue {
    pub fn new(severity: Severity, message: impl Into<String>) -> Issue {
        Issue { severity, message: message.into() }
    }

    pub fn info(message: impl Into<String>) -> Issue {
        Issue::new(Severity::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Issue {
        Issue::new(Severity::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Issue {
        Issue::new(Severity::Error, message)
    }

    pub fn fatal(message: impl Into<String>) -> Issue {
        Issue::new(Severity::Fatal, message)
    }
}

/// When during construction a check runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Right after the node is created, before any bytes are read.
    Pre,
    /// After each child of a container is built.
    PerChild,
    /// After all reading, before derived attributes are produced.
    PreDerivation,
    /// After derived attributes and postread metadata.
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
    In,
    NotIn,
    Matches,
}

impl CompareOp {
    fn describe(self) -> &'static str {
        match self {
            CompareOp::Lt => "be less than",
            CompareOp::Le => "be at most",
            CompareOp::Eq => "equal",
            CompareOp::Ne => "differ from",
            CompareOp::Ge => "be at least",
            CompareOp::Gt => "be greater than",
            CompareOp::In => "be one of",
            CompareOp::NotIn => "not be one of",
            CompareOp::Matches => "match",
        }
    }
}

/// One side of a comparison: a literal, a path, a bare attribute name, or a
/// list of sub-expressions (for combined-field checks).
#[derive(Debug, Clone)]
pub enum Expr {
    Lit(Value),
    Path(Path),
    Attr(String),
    List(Vec<Expr>),
}

impl From<Value> for Expr {
    fn from(v: Value) -> Expr {
        Expr::Lit(v)
    }
}

impl From<i64> for Expr {
    fn from(x: i64) -> Expr {
        Expr::Lit(Value::Int(x))
    }
}

impl From<&str> for Expr {
    fn from(s: &str) -> Expr {
        Expr::Attr(s.to_string())
    }
}

impl From<Path> for Expr {
    fn from(p: Path) -> Expr {
        Expr::Path(p)
    }
}

impl Expr {
    /// Resolve against a node. A bare name that misses the lookup falls back
    /// to the name itself as a string literal.
    fn resolve(&self, tree: &Tree, node: NodeId) -> Result<Value, ConstructError> {
        match self {
            Expr::Lit(v) => Ok(v.clone()),
            Expr::Path(p) => Ok(p.evaluate_value(tree, node)?),
            Expr::Attr(name) => match tree.lookup(node, name) {
                Some(Looked::Value(v)) => Ok(v),
                Some(Looked::Node(_)) => Err(ConstructError::Config(format!(
                    "'{}' names a child node, not a value",
                    name
                ))),
                None => Ok(Value::Str(name.clone())),
            },
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.resolve(tree, node)?);
                }
                Ok(Value::List(out))
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Lit(v) => write!(f, "{}", v),
            Expr::Path(p) => write!(f, "{}", p),
            Expr::Attr(name) => write!(f, "{}", name),
            Expr::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// A single comparison check.
#[derive(Debug, Clone)]
pub struct Validation {
    value: Expr,
    op: CompareOp,
    comparison: Expr,
    stage: Stage,
    severity: Severity,
    description: String,
}

impl Validation {
    pub fn new(value: impl Into<Expr>, op: CompareOp, comparison: impl Into<Expr>) -> Validation {
        Validation {
            value: value.into(),
            op,
            comparison: comparison.into(),
            stage: Stage::Post,
            severity: Severity::Warning,
            description: String::new(),
        }
    }

    pub fn stage(mut self, stage: Stage) -> Validation {
        self.stage = stage;
        self
    }

    pub fn severity(mut self, severity: Severity) -> Validation {
        self.severity = severity;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Validation {
        self.description = description.into();
        self
    }

    fn run(&self, tree: &Tree, node: NodeId) -> Result<(), ConstructError> {
        let value = self.value.resolve(tree, node)?;
        let comparison = self.comparison.resolve(tree, node)?;
        if compare(self.op, &value, &comparison)? {
            return Ok(());
        }
        let prefix = if self.description.is_empty() {
            String::new()
        } else {
            format!("{}: ", self.description)
        };
        let message = format!(
            "{}validation failed while checking {} on {}; expected value to {} {} but found {}",
            prefix,
            self.value,
            tree.display_name(node),
            self.op.describe(),
            comparison,
            value,
        );
        Err(ConstructError::Validation(Issue::new(self.severity, message)))
    }
}

fn compare(op: CompareOp, value: &Value, comparison: &Value) -> Result<bool, ConstructError> {
    let result = match op {
        CompareOp::Eq => value == comparison,
        CompareOp::Ne => value != comparison,
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let ord = value.compare(comparison).ok_or_else(|| {
                ConstructError::Config(format!("cannot order {} against {}", value, comparison))
            })?;
            match op {
                CompareOp::Lt => ord.is_lt(),
                CompareOp::Le => ord.is_le(),
                CompareOp::Gt => ord.is_gt(),
                CompareOp::Ge => ord.is_ge(),
                _ => unreachable!(),
            }
        }
        CompareOp::In | CompareOp::NotIn => {
            let found = contains(comparison, value)?;
            if op == CompareOp::In {
                found
            } else {
                !found
            }
        }
        CompareOp::Matches => {
            let text = value.as_str().ok_or_else(|| {
                ConstructError::Config(format!("matches needs a string, found {}", value))
            })?;
            let pattern = comparison.as_str().ok_or_else(|| {
                ConstructError::Config(format!("matches needs a pattern string, found {}", comparison))
            })?;
            // Anchored at the start only, like a prefix match.
            let re = Regex::new(&format!("^(?:{})", pattern))
                .map_err(|e| ConstructError::Config(format!("bad pattern '{}': {}", pattern, e)))?;
            re.is_match(text)
        }
    };
    Ok(result)
}

fn contains(container: &Value, needle: &Value) -> Result<bool, ConstructError> {
    match container {
        Value::List(items) => Ok(items.iter().any(|item| item == needle)),
        Value::Str(s) => {
            let sub = needle.as_str().ok_or_else(|| {
                ConstructError::Config(format!("cannot search {} inside a string", needle))
            })?;
            Ok(s.contains(sub))
        }
        Value::Bytes(b) => match needle.as_int() {
            Some(x) if (0..=255).contains(&x) => Ok(b.contains(&(x as u8))),
            _ => Err(ConstructError::Config(format!(
                "cannot search {} inside bytes",
                needle
            ))),
        },
        other => Err(ConstructError::Config(format!(
            "cannot test membership in {}",
            other
        ))),
    }
}

/// A check tree: single comparisons combined with `and` / `or`. Combinators
/// order their operands so the higher-severity side runs first.
#[derive(Debug, Clone)]
pub enum Check {
    Simple(Validation),
    And(Box<Check>, Box<Check>),
    Or(Box<Check>, Box<Check>),
}

impl From<Validation> for Check {
    fn from(v: Validation) -> Check {
        Check::Simple(v)
    }
}

impl Check {
    pub fn and(a: impl Into<Check>, b: impl Into<Check>) -> Check {
        let (first, second) = order_by_severity(a.into(), b.into());
        Check::And(Box::new(first), Box::new(second))
    }

    pub fn or(a: impl Into<Check>, b: impl Into<Check>) -> Check {
        let (first, second) = order_by_severity(a.into(), b.into());
        Check::Or(Box::new(first), Box::new(second))
    }

    /// The worst severity anywhere in the tree.
    pub fn severity(&self) -> Severity {
        match self {
            Check::Simple(v) => v.severity,
            Check::And(a, b) | Check::Or(a, b) => a.severity().max(b.severity()),
        }
    }

    /// The latest stage anywhere in the tree.
    pub fn stage(&self) -> Stage {
        match self {
            Check::Simple(v) => v.stage,
            Check::And(a, b) | Check::Or(a, b) => a.stage().max(b.stage()),
        }
    }

    /// Description used for de-duplication when checks are merged.
    pub fn name(&self) -> &str {
        match self {
            Check::Simple(v) => &v.description,
            Check::And(a, _) | Check::Or(a, _) => a.name(),
        }
    }

    /// Run the check against `node`. For per-child checks, `descendant` is
    /// the child just built (or `None` when the driver produced nothing).
    pub fn run(
        &self,
        tree: &Tree,
        node: NodeId,
        descendant: Option<NodeId>,
    ) -> Result<(), ConstructError> {
        match self {
            Check::Simple(v) => v.run(tree, descendant.unwrap_or(node)),
            Check::And(a, b) => {
                a.run(tree, node, descendant)?;
                b.run(tree, node, descendant)
            }
            Check::Or(a, b) => match a.run(tree, node, descendant) {
                Ok(()) => Ok(()),
                Err(ConstructError::Validation(held)) => match b.run(tree, node, descendant) {
                    Ok(()) => Ok(()),
                    Err(ConstructError::Validation(_)) => Err(ConstructError::Validation(held)),
                    Err(other) => Err(other),
                },
                Err(other) => Err(other),
            },
        }
    }
}

fn order_by_severity(a: Check, b: Check) -> (Check, Check) {
    if b.severity() > a.severity() {
        (b, a)
    } else {
        (a, b)
    }
}
