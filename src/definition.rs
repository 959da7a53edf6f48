//! Grammar templates and the construct protocol.
//!
//! A `Definition` is an immutable template: a leaf reader, a container of
//! child definitions, or a delegation through a dispatch table. Constructing
//! a definition against a source builds one node, resolving every deferred
//! configuration value against that node first, so a single template drives
//! any number of independent parses.

use crate::attribute::{Attribute, AttributeError};
use crate::node::{NodeId, Tree};
use crate::path::{Path, PathError};
use crate::source::{Source, SourceError};
use crate::validation::{Check, Issue, Severity, Stage};
use crate::value::Value;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while building a definition (not while parsing).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("definition '{0}' has more than one body (reader, children or delegation)")]
    BothBodies(String),
    #[error("definition '{0}' has no reader, children or delegation")]
    NoBody(String),
    #[error("unrecognized integer format '{0}'")]
    BadIntFormat(String),
}

/// Errors raised during construction. Only `Validation` carries a severity;
/// sub-fatal findings are caught by the stage runner and recorded as data.
#[derive(Debug, Error)]
pub enum ConstructError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Validation(#[from] Issue),
    #[error(transparent)]
    Attribute(#[from] AttributeError),
    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

/// Width, byte order and signedness of an integer field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntFormat {
    endianness: Endianness,
    width: u8,
    signed: bool,
}

impl IntFormat {
    const fn make(endianness: Endianness, width: u8, signed: bool) -> IntFormat {
        IntFormat { endianness, width, signed }
    }

    pub const fn be_u8() -> IntFormat {
        IntFormat::make(Endianness::Big, 1, false)
    }

    pub const fn be_u16() -> IntFormat {
        IntFormat::make(Endianness::Big, 2, false)
    }

    pub const fn be_u32() -> IntFormat {
        IntFormat::make(Endianness::Big, 4, false)
    }

    pub const fn le_u16() -> IntFormat {
        IntFormat::make(Endianness::Little, 2, false)
    }

    pub const fn le_u32() -> IntFormat {
        IntFormat::make(Endianness::Little, 4, false)
    }

    pub fn width(&self) -> usize {
        self.width as usize
    }
}

impl FromStr for IntFormat {
    type Err = ConfigError;

    /// Parses names like `be_u32` or `le_i16`.
    fn from_str(s: &str) -> Result<IntFormat, ConfigError> {
        let bad = || ConfigError::BadIntFormat(s.to_string());
        let (prefix, rest) = s.split_once('_').ok_or_else(bad)?;
        let endianness = match prefix {
            "be" => Endianness::Big,
            "le" => Endianness::Little,
            _ => return Err(bad()),
        };
        let signed = match rest.as_bytes().first() {
            Some(b'u') => false,
            Some(b'i') => true,
            _ => return Err(bad()),
        };
        let bits: u32 = rest[1..].parse().map_err(|_| bad())?;
        let width = match bits {
            8 => 1,
            16 => 2,
            32 => 4,
            64 => 8,
            _ => return Err(bad()),
        };
        Ok(IntFormat { endianness, width, signed })
    }
}

/// Text encodings for string leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Ascii,
    Latin1,
}

impl Encoding {
    fn decode(&self, raw: &[u8]) -> Result<String, String> {
        match self {
            Encoding::Utf8 => std::str::from_utf8(raw)
                .map(|s| s.to_string())
                .map_err(|e| e.to_string()),
            Encoding::Ascii => match raw.iter().position(|b| *b >= 0x80) {
                Some(pos) => Err(format!("non-ascii byte 0x{:02x} at offset {}", raw[pos], pos)),
                None => Ok(raw.iter().map(|b| *b as char).collect()),
            },
            Encoding::Latin1 => Ok(raw.iter().map(|b| *b as char).collect()),
        }
    }

    fn decode_lossy(&self, raw: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(raw).into_owned(),
            Encoding::Ascii => raw
                .iter()
                .map(|b| if *b < 0x80 { *b as char } else { '\u{FFFD}' })
                .collect(),
            Encoding::Latin1 => raw.iter().map(|b| *b as char).collect(),
        }
    }
}

/// A configuration value that is either fixed or deferred: a deferred one is
/// a path resolved against the node under construction.
#[derive(Debug, Clone)]
pub enum PathOr<T> {
    Lit(T),
    Path(Path),
}

impl<T> From<Path> for PathOr<T> {
    fn from(p: Path) -> PathOr<T> {
        PathOr::Path(p)
    }
}

impl From<i64> for PathOr<i64> {
    fn from(x: i64) -> PathOr<i64> {
        PathOr::Lit(x)
    }
}

impl From<IntFormat> for PathOr<IntFormat> {
    fn from(f: IntFormat) -> PathOr<IntFormat> {
        PathOr::Lit(f)
    }
}

trait FromValue: Sized {
    fn from_value(v: Value) -> Result<Self, ConstructError>;
}

impl FromValue for i64 {
    fn from_value(v: Value) -> Result<i64, ConstructError> {
        v.as_int()
            .ok_or_else(|| ConstructError::Config(format!("expected an integer, found {}", v)))
    }
}

impl FromValue for IntFormat {
    fn from_value(v: Value) -> Result<IntFormat, ConstructError> {
        let s = v
            .as_str()
            .ok_or_else(|| ConstructError::Config(format!("expected a format name, found {}", v)))?;
        s.parse().map_err(|e: ConfigError| ConstructError::Config(e.to_string()))
    }
}

impl<T: FromValue + Clone> PathOr<T> {
    fn resolve(&self, tree: &Tree, node: NodeId) -> Result<T, ConstructError> {
        match self {
            PathOr::Lit(t) => Ok(t.clone()),
            PathOr::Path(p) => T::from_value(p.evaluate_value(tree, node)?),
        }
    }
}

/// A custom leaf reader.
pub type ReadFn =
    Arc<dyn Fn(&mut Tree, NodeId, &mut dyn Source) -> Result<Value, ConstructError> + Send + Sync>;

/// How a leaf definition turns bytes into its `value` attribute.
pub enum Reader {
    /// Read exactly the expected bytes; mismatch is caught by the fixed
    /// content check the constructor installs.
    Static { expected: Vec<u8> },
    Integer {
        format: PathOr<IntFormat>,
    },
    /// `items` entries, each a single integer (`group` 1) or a list of
    /// `group` integers.
    IntegerSequence {
        format: PathOr<IntFormat>,
        items: PathOr<i64>,
        group: PathOr<i64>,
    },
    Bytes {
        length: PathOr<i64>,
    },
    Text {
        length: PathOr<i64>,
        encoding: Encoding,
    },
    /// Bytes up to and including a zero terminator; the terminator counts
    /// toward the node's length but not the string.
    NullText {
        encoding: Encoding,
    },
    Custom(ReadFn),
}

impl Reader {
    fn read(
        &self,
        tree: &mut Tree,
        node: NodeId,
        source: &mut dyn Source,
    ) -> Result<Value, ConstructError> {
        match self {
            Reader::Static { expected } => Ok(Value::Bytes(source.read(expected.len())?)),
            Reader::Integer { format } => {
                let fmt = format.resolve(tree, node)?;
                read_integer(source, fmt)
            }
            Reader::IntegerSequence { format, items, group } => {
                let fmt = format.resolve(tree, node)?;
                let items = resolve_count(items, tree, node, "items")?;
                let group = resolve_count(group, tree, node, "group")?;
                if group < 1 {
                    return Err(ConstructError::Validation(Issue::fatal(format!(
                        "group size must be positive, found {}",
                        group
                    ))));
                }
                let mut out = Vec::with_capacity(items as usize);
                for _ in 0..items {
                    if group == 1 {
                        out.push(read_integer(source, fmt)?);
                    } else {
                        let mut entry = Vec::with_capacity(group as usize);
                        for _ in 0..group {
                            entry.push(read_integer(source, fmt)?);
                        }
                        out.push(Value::List(entry));
                    }
                }
                Ok(Value::List(out))
            }
            Reader::Bytes { length } => {
                let n = resolve_count(length, tree, node, "length")?;
                Ok(Value::Bytes(source.read(n as usize)?))
            }
            Reader::Text { length, encoding } => {
                let n = resolve_count(length, tree, node, "length")?;
                let raw = source.read(n as usize)?;
                decode_text(tree, node, *encoding, &raw)
            }
            Reader::NullText { encoding } => {
                let mut raw = Vec::new();
                loop {
                    let b = source.read(1)?;
                    if b[0] == 0 {
                        break;
                    }
                    raw.push(b[0]);
                }
                decode_text(tree, node, *encoding, &raw)
            }
            Reader::Custom(f) => f(tree, node, source),
        }
    }
}

fn resolve_count(
    count: &PathOr<i64>,
    tree: &Tree,
    node: NodeId,
    what: &str,
) -> Result<i64, ConstructError> {
    let n = count.resolve(tree, node)?;
    if n < 0 {
        return Err(ConstructError::Validation(Issue::fatal(format!(
            "{} resolved to a negative count ({}) on {}",
            what,
            n,
            tree.display_name(node)
        ))));
    }
    Ok(n)
}

fn read_integer(source: &mut dyn Source, fmt: IntFormat) -> Result<Value, ConstructError> {
    let buf = source.read(fmt.width as usize)?;
    let value = match (fmt.endianness, fmt.signed) {
        (Endianness::Big, true) => BigEndian::read_int(&buf, buf.len()),
        (Endianness::Little, true) => LittleEndian::read_int(&buf, buf.len()),
        (Endianness::Big, false) => to_i64(BigEndian::read_uint(&buf, buf.len()))?,
        (Endianness::Little, false) => to_i64(LittleEndian::read_uint(&buf, buf.len()))?,
    };
    Ok(Value::Int(value))
}

fn to_i64(u: u64) -> Result<i64, ConstructError> {
    i64::try_from(u).map_err(|_| {
        ConstructError::Config(format!("unsigned value {} exceeds the representable range", u))
    })
}

fn decode_text(
    tree: &mut Tree,
    node: NodeId,
    encoding: Encoding,
    raw: &[u8],
) -> Result<Value, ConstructError> {
    match encoding.decode(raw) {
        Ok(s) => Ok(Value::Str(s)),
        Err(reason) => {
            tree.record_issue(
                node,
                Issue::error(format!("text decode failed ({}), kept a lossy reading", reason)),
            );
            Ok(Value::Str(encoding.decode_lossy(raw)))
        }
    }
}

/// Stop predicate for counted-or-terminated sequences, run on the most
/// recently built child.
pub type StopFn = Arc<dyn Fn(&Tree, NodeId) -> bool + Send + Sync>;

/// Children of a container definition.
pub enum Children {
    /// A fixed ordered list of child definitions.
    Fixed(Vec<Arc<Definition>>),
    /// One child definition repeated: a fixed or deferred count, a stop
    /// predicate, or (neither) until the source runs out.
    Sequence {
        child: Arc<Definition>,
        items: Option<PathOr<i64>>,
        stop: Option<StopFn>,
    },
}

impl Children {
    /// A sequence without an explicit count tolerates a truncated trailing
    /// element.
    fn is_open_ended(&self) -> bool {
        matches!(self, Children::Sequence { items: None, .. })
    }

    fn driver(&self) -> Box<dyn ChildrenDriver> {
        match self {
            Children::Fixed(defs) => Box::new(FixedDriver { defs: defs.clone(), next: 0 }),
            Children::Sequence { child, items, stop } => Box::new(SequenceDriver {
                child: child.clone(),
                items: items.clone(),
                remaining: None,
                stop: stop.clone(),
            }),
        }
    }
}

/// State machine handing out the next child definition to construct.
pub trait ChildrenDriver {
    /// Resolve any deferred counts against the container node and hand out
    /// the first child definition, or `None` for an empty container.
    fn start(
        &mut self,
        tree: &Tree,
        node: NodeId,
    ) -> Result<Option<Arc<Definition>>, ConstructError>;

    /// Given the child just built (`None` when delegation produced nothing),
    /// hand out the next definition or `None` to finish.
    fn next(
        &mut self,
        tree: &Tree,
        last_child: Option<NodeId>,
    ) -> Result<Option<Arc<Definition>>, ConstructError>;
}

struct FixedDriver {
    defs: Vec<Arc<Definition>>,
    next: usize,
}

impl ChildrenDriver for FixedDriver {
    fn start(
        &mut self,
        _tree: &Tree,
        _node: NodeId,
    ) -> Result<Option<Arc<Definition>>, ConstructError> {
        self.next = 0;
        Ok(self.defs.first().cloned())
    }

    fn next(
        &mut self,
        _tree: &Tree,
        _last_child: Option<NodeId>,
    ) -> Result<Option<Arc<Definition>>, ConstructError> {
        self.next += 1;
        Ok(self.defs.get(self.next).cloned())
    }
}

struct SequenceDriver {
    child: Arc<Definition>,
    items: Option<PathOr<i64>>,
    remaining: Option<i64>,
    stop: Option<StopFn>,
}

impl ChildrenDriver for SequenceDriver {
    fn start(
        &mut self,
        tree: &Tree,
        node: NodeId,
    ) -> Result<Option<Arc<Definition>>, ConstructError> {
        if let Some(items) = &self.items {
            let n = resolve_count(items, tree, node, "items")?;
            if n == 0 {
                return Ok(None);
            }
            self.remaining = Some(n);
        }
        Ok(Some(self.child.clone()))
    }

    fn next(
        &mut self,
        tree: &Tree,
        last_child: Option<NodeId>,
    ) -> Result<Option<Arc<Definition>>, ConstructError> {
        if let (Some(stop), Some(child)) = (&self.stop, last_child) {
            if stop(tree, child) {
                return Ok(None);
            }
        }
        if let Some(remaining) = &mut self.remaining {
            *remaining -= 1;
            if *remaining == 0 {
                return Ok(None);
            }
        }
        Ok(Some(self.child.clone()))
    }
}

/// Key a delegation resolves through its dispatch table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchKey {
    Int(i64),
    Str(String),
}

impl From<i64> for DispatchKey {
    fn from(x: i64) -> DispatchKey {
        DispatchKey::Int(x)
    }
}

impl From<&str> for DispatchKey {
    fn from(s: &str) -> DispatchKey {
        DispatchKey::Str(s.to_string())
    }
}

impl TryFrom<Value> for DispatchKey {
    type Error = ConstructError;

    fn try_from(v: Value) -> Result<DispatchKey, ConstructError> {
        match v {
            Value::Int(x) => Ok(DispatchKey::Int(x)),
            Value::Bool(b) => Ok(DispatchKey::Int(b as i64)),
            Value::Str(s) => Ok(DispatchKey::Str(s)),
            other => Err(ConstructError::Config(format!(
                "cannot dispatch on {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchKey::Int(x) => write!(f, "{}", x),
            DispatchKey::Str(s) => write!(f, "'{}'", s),
        }
    }
}

enum DispatchEntry {
    Def(Arc<Definition>),
    Alias(DispatchKey),
}

/// Registry mapping dispatch keys to definitions. A key may alias another
/// key; a miss retries the reserved `default` key.
#[derive(Default)]
pub struct DispatchTable {
    entries: Vec<(DispatchKey, DispatchEntry)>,
}

impl DispatchTable {
    pub fn new() -> DispatchTable {
        DispatchTable::default()
    }

    fn insert(&mut self, key: DispatchKey, entry: DispatchEntry) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = entry,
            None => self.entries.push((key, entry)),
        }
    }

    pub fn register(&mut self, key: impl Into<DispatchKey>, def: Arc<Definition>) {
        self.insert(key.into(), DispatchEntry::Def(def));
    }

    pub fn register_alias(&mut self, key: impl Into<DispatchKey>, target: impl Into<DispatchKey>) {
        self.insert(key.into(), DispatchEntry::Alias(target.into()));
    }

    pub fn register_default(&mut self, def: Arc<Definition>) {
        self.insert(DispatchKey::from("default"), DispatchEntry::Def(def));
    }

    fn get(&self, key: &DispatchKey) -> Option<&DispatchEntry> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, e)| e)
    }

    /// Follow aliases and the `default` fallback. Hop count is bounded by the
    /// table size, so a cyclic alias chain fails instead of spinning.
    pub fn resolve(&self, key: &DispatchKey) -> Result<Option<Arc<Definition>>, ConstructError> {
        let default = DispatchKey::from("default");
        let mut current = key.clone();
        let mut hops = 0;
        loop {
            hops += 1;
            // One hop per entry, plus the initial miss and the default retry.
            if hops > self.entries.len() + 2 {
                return Err(ConstructError::Config(format!(
                    "alias chain starting at {} never reaches a definition",
                    key
                )));
            }
            match self.get(&current) {
                Some(DispatchEntry::Def(def)) => return Ok(Some(def.clone())),
                Some(DispatchEntry::Alias(target)) => current = target.clone(),
                None if current == default => return Ok(None),
                None => current = default.clone(),
            }
        }
    }
}

/// Key derivation for a delegating definition.
pub type KeyFn = Arc<dyn Fn(&Tree, NodeId) -> Result<Value, ConstructError> + Send + Sync>;

pub enum KeySpec {
    Path(Path),
    Func(KeyFn),
}

impl From<Path> for KeySpec {
    fn from(p: Path) -> KeySpec {
        KeySpec::Path(p)
    }
}

impl KeySpec {
    fn resolve(&self, tree: &Tree, node: NodeId) -> Result<DispatchKey, ConstructError> {
        let value = match self {
            KeySpec::Path(p) => p.evaluate_value(tree, node)?,
            KeySpec::Func(f) => f(tree, node)?,
        };
        DispatchKey::try_from(value)
    }
}

enum Body {
    Leaf(Reader),
    Container(Children),
    Delegating { table: Arc<DispatchTable>, key: KeySpec },
}

/// An immutable grammar template. See the module doc for the construct
/// protocol.
pub struct Definition {
    name: String,
    body: Body,
    attributes: Vec<Attribute>,
    validations: Vec<Check>,
}

impl Definition {
    fn with_body(name: &str, body: Body) -> Definition {
        Definition {
            name: name.to_string(),
            body,
            attributes: Vec::new(),
            validations: Vec::new(),
        }
    }

    /// Fixed bytes; content mismatch is a fatal finding.
    pub fn static_bytes(name: &str, expected: &[u8]) -> Definition {
        use crate::validation::{CompareOp, Expr, Validation};
        let check = Validation::new(
            Expr::Attr("value".to_string()),
            CompareOp::Eq,
            Expr::Lit(Value::Bytes(expected.to_vec())),
        )
        .severity(Severity::Fatal)
        .describe("fixed content");
        Definition::with_body(name, Body::Leaf(Reader::Static { expected: expected.to_vec() }))
            .with_validation(check)
    }

    pub fn integer(name: &str, format: impl Into<PathOr<IntFormat>>) -> Definition {
        Definition::with_body(name, Body::Leaf(Reader::Integer { format: format.into() }))
    }

    pub fn integer_sequence(
        name: &str,
        format: impl Into<PathOr<IntFormat>>,
        items: impl Into<PathOr<i64>>,
        group: impl Into<PathOr<i64>>,
    ) -> Definition {
        Definition::with_body(
            name,
            Body::Leaf(Reader::IntegerSequence {
                format: format.into(),
                items: items.into(),
                group: group.into(),
            }),
        )
    }

    pub fn bytestring(name: &str, length: impl Into<PathOr<i64>>) -> Definition {
        Definition::with_body(name, Body::Leaf(Reader::Bytes { length: length.into() }))
    }

    pub fn string(name: &str, length: impl Into<PathOr<i64>>, encoding: Encoding) -> Definition {
        Definition::with_body(
            name,
            Body::Leaf(Reader::Text { length: length.into(), encoding }),
        )
    }

    pub fn null_terminated_string(name: &str, encoding: Encoding) -> Definition {
        Definition::with_body(name, Body::Leaf(Reader::NullText { encoding }))
    }

    pub fn leaf(name: &str, read: ReadFn) -> Definition {
        Definition::with_body(name, Body::Leaf(Reader::Custom(read)))
    }

    pub fn defined_children(name: &str, children: Vec<Arc<Definition>>) -> Definition {
        Definition::with_body(name, Body::Container(Children::Fixed(children)))
    }

    pub fn node_sequence(
        name: &str,
        child: Arc<Definition>,
        items: Option<PathOr<i64>>,
        stop: Option<StopFn>,
    ) -> Definition {
        Definition::with_body(name, Body::Container(Children::Sequence { child, items, stop }))
    }

    pub fn delegating(
        name: &str,
        table: Arc<DispatchTable>,
        key: impl Into<KeySpec>,
    ) -> Definition {
        Definition::with_body(name, Body::Delegating { table, key: key.into() })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a derived attribute; a name already present keeps its earlier
    /// producer.
    pub fn with_attribute(mut self, attribute: Attribute) -> Definition {
        if !self.attributes.iter().any(|a| a.name() == attribute.name()) {
            self.attributes.push(attribute);
        }
        self
    }

    /// Add a check; a described check whose description is already present
    /// keeps the earlier one.
    pub fn with_validation(mut self, check: impl Into<Check>) -> Definition {
        let check = check.into();
        let name = check.name();
        if name.is_empty() || !self.validations.iter().any(|c| c.name() == name) {
            self.validations.push(check);
        }
        self
    }

    /// Build one node from the source. `Ok(None)` occurs only when a
    /// delegation dead-ends (a warning is recorded on the parent).
    pub fn construct(
        &self,
        tree: &mut Tree,
        source: &mut dyn Source,
        parent: Option<NodeId>,
    ) -> Result<Option<NodeId>, ConstructError> {
        match &self.body {
            Body::Delegating { table, key } => self.delegate(tree, source, parent, table, key),
            _ => {
                let node = tree.add_node(&self.name, parent);
                self.construct_into(tree, source, node)?;
                Ok(Some(node))
            }
        }
    }

    /// Resolve the dispatch key against a probe node, then construct the
    /// chosen definition in the probe's place. The probe is detached before
    /// any error propagates.
    fn delegate(
        &self,
        tree: &mut Tree,
        source: &mut dyn Source,
        parent: Option<NodeId>,
        table: &DispatchTable,
        key: &KeySpec,
    ) -> Result<Option<NodeId>, ConstructError> {
        let probe = tree.add_node(&self.name, parent);
        tree.set_metadata(probe, "definition", Value::Str(self.name.clone()));
        let resolved = self
            .run_stage(tree, probe, Stage::Pre, None)
            .and_then(|()| key.resolve(tree, probe))
            .and_then(|k| table.resolve(&k).map(|def| (k, def)));
        tree.detach(probe);
        let (key, delegate) = resolved?;
        match delegate {
            Some(def) => def.construct(tree, source, parent),
            None => {
                if let Some(p) = parent {
                    tree.record_issue(
                        p,
                        Issue::warning(format!(
                            "'{}' has no definition for key {}",
                            self.name, key
                        )),
                    );
                }
                Ok(None)
            }
        }
    }

    fn construct_into(
        &self,
        tree: &mut Tree,
        source: &mut dyn Source,
        node: NodeId,
    ) -> Result<(), ConstructError> {
        tree.set_metadata(node, "definition", Value::Str(self.name.clone()));
        self.run_stage(tree, node, Stage::Pre, None)?;
        let pre = source.preread_metadata(tree, node);
        tree.add_data(node, pre, true);
        match &self.body {
            Body::Leaf(reader) => {
                let value = reader.read(tree, node, source)?;
                tree.set_attribute(node, "value", value);
            }
            Body::Container(children) => self.build_children(tree, source, node, children)?,
            Body::Delegating { .. } => {
                return Err(ConstructError::Config(format!(
                    "delegating definition '{}' cannot be constructed in place",
                    self.name
                )))
            }
        }
        self.run_stage(tree, node, Stage::PreDerivation, None)?;
        for attribute in &self.attributes {
            match attribute.produce(tree, node) {
                Ok(value) => tree.set_attribute(node, attribute.name(), value),
                Err(ConstructError::Attribute(e)) => {
                    tree.record_issue(
                        node,
                        Issue::error(format!("attribute '{}': {}", attribute.name(), e)),
                    );
                }
                Err(ConstructError::Path(e)) => {
                    tree.record_issue(
                        node,
                        Issue::error(format!("attribute '{}': {}", attribute.name(), e)),
                    );
                }
                Err(e) => return Err(e),
            }
        }
        let post = source.postread_metadata(tree, node);
        tree.add_data(node, post, true);
        self.run_stage(tree, node, Stage::Post, None)
    }

    fn build_children(
        &self,
        tree: &mut Tree,
        source: &mut dyn Source,
        node: NodeId,
        children: &Children,
    ) -> Result<(), ConstructError> {
        let mut driver = children.driver();
        let mut next_def = driver.start(tree, node)?;
        while let Some(def) = next_def {
            match def.construct(tree, source, Some(node)) {
                Ok(built) => {
                    self.run_stage(tree, node, Stage::PerChild, built)?;
                    next_def = driver.next(tree, built)?;
                }
                Err(ConstructError::Source(SourceError::EndOfInput { offset, wanted }))
                    if children.is_open_ended() =>
                {
                    if self.discard_truncated_tail(tree, node, source.position()) {
                        break;
                    }
                    return Err(ConstructError::Source(SourceError::EndOfInput {
                        offset,
                        wanted,
                    }));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// An open-ended sequence that hits end of input on the first read of a
    /// new element drops the dangling child and finishes normally.
    fn discard_truncated_tail(&self, tree: &mut Tree, node: NodeId, position: u64) -> bool {
        let kids = tree.children(node);
        if kids.len() < 2 {
            return false;
        }
        let settled = kids[kids.len() - 2];
        let dangling = kids[kids.len() - 1];
        match tree.metadata(settled, "end_offset") {
            Some(Value::Int(end)) if end >= 0 && end as u64 == position => {
                let name = tree.display_name(dangling);
                tree.detach(dangling);
                tree.record_issue(
                    node,
                    Issue::warning(format!("discarded truncated trailing element '{}'", name)),
                );
                true
            }
            _ => false,
        }
    }

    /// Run this definition's checks for one stage. Sub-fatal findings become
    /// metadata on the node; fatal ones (and non-validation errors) propagate.
    fn run_stage(
        &self,
        tree: &mut Tree,
        node: NodeId,
        stage: Stage,
        descendant: Option<NodeId>,
    ) -> Result<(), ConstructError> {
        for check in &self.validations {
            if check.stage() != stage {
                continue;
            }
            match check.run(tree, node, descendant) {
                Ok(()) => {}
                Err(ConstructError::Validation(issue)) if issue.severity < Severity::Fatal => {
                    tree.record_issue(node, issue);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.body {
            Body::Leaf(_) => "leaf",
            Body::Container(_) => "container",
            Body::Delegating { .. } => "delegating",
        };
        write!(f, "Definition({} {})", kind, self.name)
    }
}

/// Builder enforcing that a definition has exactly one body.
pub struct DefinitionBuilder {
    name: String,
    reader: Option<Reader>,
    children: Option<Children>,
    delegation: Option<(Arc<DispatchTable>, KeySpec)>,
    attributes: Vec<Attribute>,
    validations: Vec<Check>,
}

impl DefinitionBuilder {
    pub fn new(name: &str) -> DefinitionBuilder {
        DefinitionBuilder {
            name: name.to_string(),
            reader: None,
            children: None,
            delegation: None,
            attributes: Vec::new(),
            validations: Vec::new(),
        }
    }

    pub fn reader(mut self, reader: Reader) -> DefinitionBuilder {
        self.reader = Some(reader);
        self
    }

    pub fn children(mut self, children: Children) -> DefinitionBuilder {
        self.children = Some(children);
        self
    }

    pub fn delegation(
        mut self,
        table: Arc<DispatchTable>,
        key: impl Into<KeySpec>,
    ) -> DefinitionBuilder {
        self.delegation = Some((table, key.into()));
        self
    }

    pub fn attribute(mut self, attribute: Attribute) -> DefinitionBuilder {
        self.attributes.push(attribute);
        self
    }

    pub fn validation(mut self, check: impl Into<Check>) -> DefinitionBuilder {
        self.validations.push(check.into());
        self
    }

    pub fn build(self) -> Result<Definition, ConfigError> {
        let provided = self.reader.is_some() as u8
            + self.children.is_some() as u8
            + self.delegation.is_some() as u8;
        if provided > 1 {
            return Err(ConfigError::BothBodies(self.name));
        }
        let body = if let Some(reader) = self.reader {
            Body::Leaf(reader)
        } else if let Some(children) = self.children {
            Body::Container(children)
        } else if let Some((table, key)) = self.delegation {
            Body::Delegating { table, key }
        } else {
            return Err(ConfigError::NoBody(self.name));
        };
        let mut def = Definition::with_body(&self.name, body);
        for attribute in self.attributes {
            def = def.with_attribute(attribute);
        }
        for check in self.validations {
            def = def.with_validation(check);
        }
        Ok(def)
    }
}
