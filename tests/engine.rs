//! Engine-level behavior: paths, checks, readers, sequences, delegation.

use binform::{
    Attribute, Check, CompareOp, ConfigError, ConstructError, Definition, DefinitionBuilder,
    DispatchKey, DispatchTable, Encoding, Expr, IntFormat, KeySpec, Path, PathOr, Reader,
    Resolved, Severity, SliceSource, StopFn, Tree, Validation, Value,
};
use std::io::Write;
use std::sync::Arc;

fn parse(def: &Definition, bytes: &[u8]) -> (Tree, binform::NodeId) {
    let mut tree = Tree::new();
    let mut source = SliceSource::new(bytes.to_vec());
    let node = def
        .construct(&mut tree, &mut source, None)
        .expect("construction should succeed")
        .expect("a node should be built");
    (tree, node)
}

#[test]
fn builder_requires_exactly_one_body() {
    match DefinitionBuilder::new("empty").build() {
        Err(ConfigError::NoBody(name)) => assert_eq!(name, "empty"),
        other => panic!("expected NoBody, got {:?}", other.map(|d| d.name().to_string())),
    }
    let both = DefinitionBuilder::new("both")
        .reader(Reader::Bytes { length: PathOr::Lit(1) })
        .children(binform::Children::Fixed(Vec::new()))
        .build();
    match both {
        Err(ConfigError::BothBodies(name)) => assert_eq!(name, "both"),
        other => panic!("expected BothBodies, got {:?}", other.map(|d| d.name().to_string())),
    }
}

#[test]
fn empty_path_resolves_to_target() {
    let mut tree = Tree::new();
    let n = tree.add_node("n", None);
    match Path::new().evaluate(&tree, n).expect("evaluation") {
        Resolved::Node(got) => assert_eq!(got, n),
        other => panic!("expected the target node, got {:?}", other),
    }
}

#[test]
fn path_field_and_call() {
    let mut tree = Tree::new();
    let root = tree.add_node("root", None);
    let a = tree.add_node("a", Some(root));
    let double: binform::NativeFn = Arc::new(|args| match args {
        [Value::Int(x)] => Ok(Value::Int(x * 2)),
        _ => Err("expected one integer".to_string()),
    });
    tree.set_attribute(a, "b", Value::Func(double));
    let got = Path::new()
        .field("a")
        .field("b")
        .call([5i64])
        .evaluate_value(&tree, root)
        .expect("call through the path");
    assert_eq!(got, Value::Int(10));
}

#[test]
fn path_sibling_arithmetic() {
    let container = Definition::defined_children(
        "pair",
        vec![
            Arc::new(Definition::integer("len", IntFormat::be_u8())),
            Arc::new(Definition::bytestring(
                "body",
                Path::new().field("parent").field("len").field("value"),
            )),
        ],
    );
    let (tree, node) = parse(&container, b"\x03abc");
    let body = tree.children(node)[1];
    assert_eq!(tree.attribute(body, "value"), Some(Value::Bytes(b"abc".to_vec())));
}

#[test]
fn big_endian_u32() {
    let def = Definition::integer("n", IntFormat::be_u32());
    let (tree, node) = parse(&def, &[0, 0, 0, 42]);
    assert_eq!(tree.attribute(node, "value"), Some(Value::Int(42)));
    assert_eq!(tree.metadata(node, "length"), Some(Value::Int(4)));
}

#[test]
fn integer_format_names() {
    let fmt: IntFormat = "le_u16".parse().expect("known format");
    let def = Definition::integer("n", fmt);
    let (tree, node) = parse(&def, &[0x2a, 0x00]);
    assert_eq!(tree.attribute(node, "value"), Some(Value::Int(42)));
    assert!("be_q32".parse::<IntFormat>().is_err());
}

#[test]
fn static_mismatch_is_fatal() {
    let def = Definition::static_bytes("sig", b"ABCD");
    let mut tree = Tree::new();
    let mut source = SliceSource::new(b"ABCE".to_vec());
    match def.construct(&mut tree, &mut source, None) {
        Err(ConstructError::Validation(issue)) => {
            assert_eq!(issue.severity, Severity::Fatal);
        }
        other => panic!("expected a fatal finding, got {:?}", other.is_ok()),
    }
}

#[test]
fn integer_sequence_groups() {
    let def = Definition::integer_sequence("pal", IntFormat::be_u8(), 2i64, 3i64);
    let (tree, node) = parse(&def, &[1, 2, 3, 4, 5, 6]);
    let expected = Value::List(vec![
        Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        Value::List(vec![Value::Int(4), Value::Int(5), Value::Int(6)]),
    ]);
    assert_eq!(tree.attribute(node, "value"), Some(expected));
}

#[test]
fn negative_count_is_fatal() {
    let def = Definition::bytestring("b", -1i64);
    let mut tree = Tree::new();
    let mut source = SliceSource::new(b"xyz".to_vec());
    match def.construct(&mut tree, &mut source, None) {
        Err(ConstructError::Validation(issue)) => assert_eq!(issue.severity, Severity::Fatal),
        other => panic!("expected a fatal finding, got {:?}", other.is_ok()),
    }
}

#[test]
fn null_terminated_string_consumes_terminator() {
    let def = Definition::null_terminated_string("name", Encoding::Latin1);
    let (tree, node) = parse(&def, b"abc\0rest");
    assert_eq!(tree.attribute(node, "value"), Some(Value::Str("abc".to_string())));
    assert_eq!(tree.metadata(node, "length"), Some(Value::Int(4)));
}

#[test]
fn invalid_text_is_replaced_and_recorded() {
    let def = Definition::string("s", 4i64, Encoding::Utf8);
    let (tree, node) = parse(&def, &[b'a', 0xff, 0xfe, b'b']);
    let value = tree.attribute(node, "value").expect("value present");
    let s = value.as_str().expect("a string");
    assert!(s.contains('\u{FFFD}'));
    let issues = tree.issues(node);
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].severity, Severity::Error);
}

#[test]
fn open_sequence_recovers_from_truncated_tail() {
    let record = Arc::new(Definition::bytestring("rec", 4i64));
    let seq = Definition::node_sequence("recs", record, None, None);
    let (tree, node) = parse(&seq, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    assert_eq!(tree.children(node).len(), 2);
    let issues = tree.issues(node);
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].severity, Severity::Warning);
    // Recovery still runs the trailing stages.
    assert_eq!(tree.metadata(node, "end_offset"), Some(Value::Int(8)));
}

#[test]
fn recovery_also_applies_with_an_unfired_stop_predicate() {
    let record = Arc::new(Definition::bytestring("rec", 4i64));
    let never: StopFn = Arc::new(|_, _| false);
    let seq = Definition::node_sequence("recs", record, None, Some(never));
    let (tree, node) = parse(&seq, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    assert_eq!(tree.children(node).len(), 2);
}

#[test]
fn counted_sequence_zero_items_builds_nothing() {
    let record = Arc::new(Definition::integer("n", IntFormat::be_u8()));
    let seq = Definition::node_sequence("recs", record, Some(PathOr::Lit(0)), None);
    let (tree, node) = parse(&seq, &[1, 2, 3]);
    assert!(tree.children(node).is_empty());
}

#[test]
fn stop_predicate_ends_sequence() {
    let record = Arc::new(Definition::integer("n", IntFormat::be_u8()));
    let stop: StopFn =
        Arc::new(|tree, node| tree.attribute(node, "value") == Some(Value::Int(0)));
    let seq = Definition::node_sequence("recs", record, None, Some(stop));
    let (tree, node) = parse(&seq, &[1, 2, 0, 9]);
    assert_eq!(tree.children(node).len(), 3);
    assert_eq!(tree.metadata(node, "end_offset"), Some(Value::Int(3)));
}

#[test]
fn delegation_follows_alias_chain() {
    let mut table = DispatchTable::new();
    table.register("Y", Arc::new(Definition::integer("picked", IntFormat::be_u8())));
    table.register_alias("X", "Y");
    let key: KeySpec = KeySpec::Func(Arc::new(|_, _| Ok(Value::Str("X".to_string()))));
    let def = Definition::delegating("chooser", Arc::new(table), key);
    let container = Definition::defined_children("box", vec![Arc::new(def)]);
    let (tree, node) = parse(&container, &[7]);
    let child = tree.children(node)[0];
    assert_eq!(tree.name(child), "picked");
    assert_eq!(tree.attribute(child, "value"), Some(Value::Int(7)));
}

#[test]
fn alias_cycle_is_a_config_error() {
    let mut table = DispatchTable::new();
    table.register_alias("A", "B");
    table.register_alias("B", "A");
    match table.resolve(&DispatchKey::from("A")) {
        Err(ConstructError::Config(_)) => {}
        other => panic!("expected a config error, got {:?}", other.is_ok()),
    }
}

#[test]
fn delegation_dead_end_warns_parent() {
    let table = DispatchTable::new();
    let key: KeySpec = KeySpec::Func(Arc::new(|_, _| Ok(Value::Str("missing".to_string()))));
    let def = Definition::delegating("chooser", Arc::new(table), key);
    let container = Definition::defined_children("box", vec![Arc::new(def)]);
    let (tree, node) = parse(&container, &[]);
    assert!(tree.children(node).is_empty());
    let issues = tree.issues(node);
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].severity, Severity::Warning);
}

#[test]
fn attribute_failure_is_downgraded() {
    let def = Definition::integer("n", IntFormat::be_u8())
        .with_attribute(Attribute::path("broken", Path::new().field("nope")));
    let (tree, node) = parse(&def, &[1]);
    assert_eq!(tree.attribute(node, "broken"), None);
    let issues = tree.issues(node);
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].severity, Severity::Error);
}

#[test]
fn bit_flag_attribute() {
    let def = Definition::string("t", 2i64, Encoding::Ascii)
        .with_attribute(Attribute::bit_flag("lower_first", "value", 5, Some(0)))
        .with_attribute(Attribute::bit_flag("lower_second", "value", 5, Some(1)));
    let (tree, node) = parse(&def, b"aB");
    assert_eq!(tree.attribute(node, "lower_first"), Some(Value::Bool(true)));
    assert_eq!(tree.attribute(node, "lower_second"), Some(Value::Bool(false)));
}

#[test]
fn and_raises_the_higher_severity_first() {
    let mut tree = Tree::new();
    let n = tree.add_node("n", None);
    tree.set_attribute(n, "x", Value::Int(5));
    let warning = Validation::new(Expr::Attr("x".to_string()), CompareOp::Lt, 0i64)
        .severity(Severity::Warning)
        .describe("warns");
    let error = Validation::new(Expr::Attr("x".to_string()), CompareOp::Gt, 10i64)
        .severity(Severity::Error)
        .describe("errors");
    let check = Check::and(warning, error);
    match check.run(&tree, n, None) {
        Err(ConstructError::Validation(issue)) => assert_eq!(issue.severity, Severity::Error),
        other => panic!("expected a finding, got {:?}", other.is_ok()),
    }
}

#[test]
fn or_passes_when_either_side_passes() {
    let mut tree = Tree::new();
    let n = tree.add_node("n", None);
    tree.set_attribute(n, "x", Value::Int(5));
    let fails = Validation::new(Expr::Attr("x".to_string()), CompareOp::Lt, 0i64)
        .severity(Severity::Error)
        .describe("fails");
    let passes = Validation::new(Expr::Attr("x".to_string()), CompareOp::Eq, 5i64)
        .severity(Severity::Warning)
        .describe("passes");
    let check = Check::or(fails, passes);
    check.run(&tree, n, None).expect("one side passes");
}

#[test]
fn sub_fatal_findings_are_recorded_not_raised() {
    let def = Definition::integer("n", IntFormat::be_u8()).with_validation(
        Validation::new(Expr::Attr("value".to_string()), CompareOp::Eq, 99i64)
            .severity(Severity::Warning)
            .describe("expects 99"),
    );
    let (tree, node) = parse(&def, &[1]);
    let issues = tree.issues(node);
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].severity, Severity::Warning);
    assert!(issues[0].message.contains("expects 99"));
}

#[test]
fn template_drives_independent_parses() {
    let def = Arc::new(Definition::integer("n", IntFormat::be_u8()));
    let (tree_a, a) = parse(&def, &[1]);
    let (tree_b, b) = parse(&def, &[2]);
    assert_eq!(tree_a.attribute(a, "value"), Some(Value::Int(1)));
    assert_eq!(tree_b.attribute(b, "value"), Some(Value::Int(2)));
}

#[test]
fn file_source_records_provenance() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(&[0, 0, 0, 42]).expect("write");
    let path = file.path().to_path_buf();
    let mut source = binform::FileSource::open(&path).expect("open");
    let mut tree = Tree::new();
    let def = Definition::integer("n", IntFormat::be_u32());
    let node = def
        .construct(&mut tree, &mut source, None)
        .expect("construction")
        .expect("a node");
    assert_eq!(
        tree.metadata(node, "source"),
        Some(Value::Str(path.display().to_string()))
    );
    assert_eq!(tree.metadata(node, "start_offset"), Some(Value::Int(0)));
    assert_eq!(tree.metadata(node, "end_offset"), Some(Value::Int(4)));
    assert_eq!(tree.metadata(node, "length"), Some(Value::Int(4)));
}
