//! Declarative grammars for binary container formats.
//!
//! A format is described as a tree of [`Definition`] templates: leaves read
//! bytes (integers, strings, byte runs), containers hold child definitions,
//! and delegating definitions pick a child at parse time through a
//! [`DispatchTable`]. Configuration values may be deferred [`Path`]
//! expressions evaluated against the node under construction, so field
//! lengths and dispatch keys can depend on anything already parsed.
//!
//! Parsing builds a [`Tree`] of nodes carrying attributes, positional
//! metadata and graded validation findings; only [`Severity::Fatal`]
//! findings abort a parse. See the `png` module for a complete grammar
//! built on the engine.

pub mod attribute;
pub mod definition;
pub mod dump;
pub mod node;
pub mod path;
pub mod png;
pub mod source;
pub mod validation;
pub mod value;

pub use attribute::{AttrFn, Attribute, AttributeError};
pub use definition::{
    Children, ChildrenDriver, ConfigError, ConstructError, Definition, DefinitionBuilder,
    DispatchKey, DispatchTable, Encoding, Endianness, IntFormat, KeyFn, KeySpec, PathOr, ReadFn,
    Reader, StopFn,
};
pub use dump::tree_string;
pub use node::{Looked, NodeId, Predicate, Tree};
pub use path::{BinOp, Operand, Path, PathError, Resolved, UnOp};
pub use source::{FileSource, SliceSource, Source, SourceError};
pub use validation::{Check, CompareOp, Expr, Issue, Severity, Stage, Validation};
pub use value::{NativeFn, Value};
