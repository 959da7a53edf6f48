//! The PNG grammar parsed against hand-built files.

use binform::{png, ConstructError, Severity, SliceSource, Tree, Value};

fn chunk(chunk_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(chunk_type);
    out.extend_from_slice(payload);
    out.extend_from_slice(&[0, 0, 0, 0]); // crc, not checked
    out
}

const SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

fn ihdr_payload(color_type: u8, bit_depth: u8) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&1u32.to_be_bytes()); // width
    p.extend_from_slice(&1u32.to_be_bytes()); // height
    p.push(bit_depth);
    p.push(color_type);
    p.push(0); // compression
    p.push(0); // filter
    p.push(0); // interlace
    p
}

fn minimal_png() -> Vec<u8> {
    let mut data = SIGNATURE.to_vec();
    data.extend(chunk(b"IHDR", &ihdr_payload(0, 8)));
    data.extend(chunk(b"IDAT", &[1, 2, 3]));
    data.extend(chunk(b"IEND", &[]));
    data
}

fn parse(data: &[u8]) -> Result<(Tree, binform::NodeId), ConstructError> {
    let mut tree = Tree::new();
    let mut source = SliceSource::new(data.to_vec());
    let root = png::png()
        .construct(&mut tree, &mut source, None)?
        .expect("the grammar always builds a root");
    Ok((tree, root))
}

#[test]
fn parses_a_minimal_file() {
    let (tree, root) = parse(&minimal_png()).expect("well-formed file");
    let kids = tree.children(root);
    assert_eq!(tree.name(kids[0]), "signature");
    let chunks = kids[1];
    assert_eq!(tree.children(chunks).len(), 3);

    let ihdr = tree.children(chunks)[0];
    assert_eq!(tree.attribute(ihdr, "type"), Some(Value::Str("IHDR".to_string())));
    let payload = tree.children(ihdr)[2];
    assert_eq!(tree.name(payload), "IHDR_payload");
    let width = tree.children(payload)[0];
    assert_eq!(tree.attribute(width, "value"), Some(Value::Int(1)));

    let iend = tree.children(chunks)[2];
    assert_eq!(tree.attribute(iend, "type"), Some(Value::Str("IEND".to_string())));
}

#[test]
fn declared_length_mismatch_is_fatal() {
    let mut data = SIGNATURE.to_vec();
    let mut bad = Vec::new();
    bad.extend_from_slice(&14u32.to_be_bytes()); // payload is actually 13 bytes
    bad.extend_from_slice(b"IHDR");
    bad.extend(ihdr_payload(0, 8));
    bad.extend_from_slice(&[0, 0, 0, 0]);
    data.extend(bad);
    data.extend(chunk(b"IEND", &[]));
    match parse(&data) {
        Err(ConstructError::Validation(issue)) => {
            assert_eq!(issue.severity, Severity::Fatal);
            assert!(issue.message.contains("declared length"));
        }
        other => panic!("expected a fatal finding, got {:?}", other.is_ok()),
    }
}

#[test]
fn unknown_chunk_type_uses_the_default_payload() {
    let mut data = SIGNATURE.to_vec();
    data.extend(chunk(b"teSt", b"hello"));
    data.extend(chunk(b"IEND", &[]));
    let (tree, root) = parse(&data).expect("unknown chunks are opaque, not errors");
    let chunks = tree.children(root)[1];
    let unknown = tree.children(chunks)[0];
    let payload = tree.children(unknown)[2];
    assert_eq!(tree.name(payload), "unknown_payload");
    assert_eq!(
        tree.attribute(payload, "value"),
        Some(Value::Bytes(b"hello".to_vec()))
    );
}

#[test]
fn chunk_type_bit_flags_and_text_fields() {
    let mut data = SIGNATURE.to_vec();
    data.extend(chunk(b"IHDR", &ihdr_payload(0, 8)));
    data.extend(chunk(b"tEXt", b"k\0hi"));
    data.extend(chunk(b"IEND", &[]));
    let (tree, root) = parse(&data).expect("well-formed file");
    let chunks = tree.children(root)[1];
    let text_chunk = tree.children(chunks)[1];

    let chunk_type = tree.children(text_chunk)[1];
    assert_eq!(tree.attribute(chunk_type, "ancillary"), Some(Value::Bool(true)));
    assert_eq!(tree.attribute(chunk_type, "private"), Some(Value::Bool(false)));
    assert_eq!(tree.attribute(chunk_type, "reserved"), Some(Value::Bool(false)));
    assert_eq!(tree.attribute(chunk_type, "safe_to_copy"), Some(Value::Bool(true)));

    let payload = tree.children(text_chunk)[2];
    let keyword = tree.children(payload)[0];
    let text = tree.children(payload)[1];
    assert_eq!(tree.attribute(keyword, "value"), Some(Value::Str("k".to_string())));
    assert_eq!(tree.attribute(text, "value"), Some(Value::Str("hi".to_string())));
}

#[test]
fn transparency_dispatches_on_color_type() {
    let mut data = SIGNATURE.to_vec();
    data.extend(chunk(b"IHDR", &ihdr_payload(0, 8)));
    data.extend(chunk(b"tRNS", &[0, 5]));
    data.extend(chunk(b"IEND", &[]));
    let (tree, root) = parse(&data).expect("well-formed file");
    let chunks = tree.children(root)[1];
    let trns = tree.children(chunks)[1];
    let payload = tree.children(trns)[2];
    assert_eq!(tree.name(payload), "tRNS_payload");
    assert_eq!(tree.attribute(payload, "value"), Some(Value::Int(5)));
}

#[test]
fn transparency_before_the_header_is_fatal() {
    let mut data = SIGNATURE.to_vec();
    data.extend(chunk(b"tRNS", &[0, 5]));
    data.extend(chunk(b"IEND", &[]));
    match parse(&data) {
        Err(ConstructError::Validation(issue)) => {
            assert_eq!(issue.severity, Severity::Fatal);
        }
        other => panic!("expected a fatal finding, got {:?}", other.is_ok()),
    }
}

#[test]
fn bad_signature_is_fatal() {
    let mut data = b"NOTAPNG!".to_vec();
    data.extend(chunk(b"IEND", &[]));
    match parse(&data) {
        Err(ConstructError::Validation(issue)) => assert_eq!(issue.severity, Severity::Fatal),
        other => panic!("expected a fatal finding, got {:?}", other.is_ok()),
    }
}

#[test]
fn invalid_header_values_are_recorded_not_fatal() {
    let mut data = SIGNATURE.to_vec();
    data.extend(chunk(b"IHDR", &ihdr_payload(3, 16))); // indexed color forbids depth 16
    data.extend(chunk(b"IEND", &[]));
    let (tree, root) = parse(&data).expect("sub-fatal findings do not abort");
    let payload = tree
        .descendants_named(root, "IHDR_payload")
        .first()
        .copied()
        .expect("header payload present");
    let issues = tree.issues(payload);
    assert!(issues
        .iter()
        .any(|i| i.message.contains("color type and bit depth combination")));
}
