//! PNG grammar built entirely on the engine: chunk framing, per-type payload
//! dispatch, and the cross-chunk arithmetic PNG needs (payload lengths derived
//! from the chunk length field, color-type dispatch through the IHDR payload).

use crate::attribute::Attribute;
use crate::definition::{
    Definition, DispatchTable, Encoding, IntFormat, PathOr,
};
use crate::path::Path;
use crate::validation::{Check, CompareOp, Expr, Severity, Stage, Validation};
use crate::value::Value;
use std::sync::Arc;

/// From a payload node, the enclosing chunk's declared length.
fn chunk_length() -> Path {
    Path::new().field("parent").field("length").field("value")
}

/// From a field inside a payload, the enclosing chunk's declared length.
fn inner_chunk_length() -> Path {
    Path::new()
        .field("parent")
        .field("parent")
        .field("length")
        .field("value")
}

/// The color type declared by the IHDR chunk, looked up from the root.
fn color_type_key() -> Path {
    Path::new()
        .field("root")
        .descendants_named("IHDR_payload")
        .index(0)
        .field("color_type")
        .field("value")
}

/// Chunks that dispatch on color type cannot appear before IHDR.
fn needs_ihdr() -> Check {
    Validation::new(
        Path::new().field("root").descendants_named("IHDR_payload").len(),
        CompareOp::Ne,
        0i64,
    )
    .severity(Severity::Fatal)
    .stage(Stage::Pre)
    .describe("IHDR must come first")
    .into()
}

fn own_value() -> Expr {
    Expr::Attr("value".to_string())
}

fn value_in(values: &[i64], description: &str) -> Check {
    let list: Vec<Value> = values.iter().map(|x| Value::Int(*x)).collect();
    Validation::new(own_value(), CompareOp::In, Value::List(list))
        .severity(Severity::Error)
        .describe(description)
        .into()
}

fn value_between(lo: i64, hi: i64, description: &str) -> Check {
    Check::and(
        Validation::new(own_value(), CompareOp::Ge, lo)
            .severity(Severity::Error)
            .describe(description),
        Validation::new(own_value(), CompareOp::Le, hi).severity(Severity::Error),
    )
}

fn ihdr_payload() -> Definition {
    let dimension = |name: &str| {
        Definition::integer(name, IntFormat::be_u32()).with_validation(Check::and(
            Validation::new(own_value(), CompareOp::Gt, 0i64)
                .severity(Severity::Error)
                .describe("dimension range"),
            Validation::new(own_value(), CompareOp::Lt, 1i64 << 31).severity(Severity::Error),
        ))
    };
    let allowed_pairs: Vec<Value> = [
        (0, 1),
        (0, 2),
        (0, 4),
        (0, 8),
        (0, 16),
        (2, 8),
        (2, 16),
        (3, 1),
        (3, 2),
        (3, 4),
        (3, 8),
        (4, 8),
        (4, 16),
        (6, 8),
        (6, 16),
    ]
    .iter()
    .map(|(color, depth)| Value::List(vec![Value::Int(*color), Value::Int(*depth)]))
    .collect();
    Definition::defined_children(
        "IHDR_payload",
        vec![
            Arc::new(dimension("width")),
            Arc::new(dimension("height")),
            Arc::new(
                Definition::integer("bit_depth", IntFormat::be_u8())
                    .with_validation(value_in(&[1, 2, 4, 8, 16], "bit depth")),
            ),
            Arc::new(
                Definition::integer("color_type", IntFormat::be_u8())
                    .with_validation(value_in(&[0, 2, 3, 4, 6], "color type")),
            ),
            Arc::new(
                Definition::integer("compression_method", IntFormat::be_u8())
                    .with_validation(value_in(&[0], "compression method")),
            ),
            Arc::new(
                Definition::integer("filter_method", IntFormat::be_u8())
                    .with_validation(value_in(&[0], "filter method")),
            ),
            Arc::new(
                Definition::integer("interlace_method", IntFormat::be_u8())
                    .with_validation(value_in(&[0, 1], "interlace method")),
            ),
        ],
    )
    .with_validation(
        Validation::new(
            Expr::List(vec![
                Expr::Path(Path::new().field("color_type").field("value")),
                Expr::Path(Path::new().field("bit_depth").field("value")),
            ]),
            CompareOp::In,
            Value::List(allowed_pairs),
        )
        .severity(Severity::Error)
        .describe("color type and bit depth combination"),
    )
}

fn plte_payload() -> Definition {
    Definition::integer_sequence(
        "PLTE_payload",
        IntFormat::be_u8(),
        chunk_length().div(3i64),
        3i64,
    )
    .with_validation(
        Validation::new(chunk_length().rem(3i64), CompareOp::Eq, 0i64)
            .severity(Severity::Error)
            .stage(Stage::Pre)
            .describe("palette length divisible by three"),
    )
}

fn trns_payload() -> Arc<Definition> {
    let mut table = DispatchTable::new();
    table.register(
        0i64,
        Arc::new(Definition::integer("tRNS_payload", IntFormat::be_u16())),
    );
    table.register(
        2i64,
        Arc::new(Definition::integer_sequence(
            "tRNS_payload",
            IntFormat::be_u16(),
            3i64,
            1i64,
        )),
    );
    table.register(
        3i64,
        Arc::new(Definition::integer_sequence(
            "tRNS_payload",
            IntFormat::be_u8(),
            chunk_length(),
            1i64,
        )),
    );
    Arc::new(
        Definition::delegating("tRNS_payload", Arc::new(table), color_type_key())
            .with_validation(needs_ihdr()),
    )
}

fn chrm_payload() -> Definition {
    let names = [
        "white_point_x",
        "white_point_y",
        "red_x",
        "red_y",
        "green_x",
        "green_y",
        "blue_x",
        "blue_y",
    ];
    Definition::defined_children(
        "cHRM_payload",
        names
            .iter()
            .map(|n| Arc::new(Definition::integer(n, IntFormat::be_u32())))
            .collect(),
    )
}

fn iccp_payload() -> Definition {
    // Recorded lengths of null-terminated fields include the terminator.
    let compressed_length = inner_chunk_length()
        .sub(Path::new().field("parent").field("profile_name").field("length"))
        .sub(1i64);
    Definition::defined_children(
        "iCCP_payload",
        vec![
            Arc::new(Definition::null_terminated_string(
                "profile_name",
                Encoding::Latin1,
            )),
            Arc::new(
                Definition::integer("compression_method", IntFormat::be_u8())
                    .with_validation(value_in(&[0], "compression method")),
            ),
            Arc::new(Definition::bytestring("compressed_profile", compressed_length)),
        ],
    )
}

fn text_payload() -> Definition {
    let text_length =
        inner_chunk_length().sub(Path::new().field("parent").field("keyword").field("length"));
    Definition::defined_children(
        "tEXt_payload",
        vec![
            Arc::new(Definition::null_terminated_string("keyword", Encoding::Latin1)),
            Arc::new(Definition::string("text", text_length, Encoding::Latin1)),
        ],
    )
}

fn ztxt_payload() -> Definition {
    let compressed_length = inner_chunk_length()
        .sub(Path::new().field("parent").field("keyword").field("length"))
        .sub(1i64);
    Definition::defined_children(
        "zTXt_payload",
        vec![
            Arc::new(Definition::null_terminated_string("keyword", Encoding::Latin1)),
            Arc::new(
                Definition::integer("compression_method", IntFormat::be_u8())
                    .with_validation(value_in(&[0], "compression method")),
            ),
            Arc::new(Definition::bytestring("compressed_text", compressed_length)),
        ],
    )
}

fn itxt_payload() -> Definition {
    // Three null-terminated fields plus the two one-byte flags precede the text.
    let text_length = inner_chunk_length()
        .sub(Path::new().field("parent").field("keyword").field("length"))
        .sub(Path::new().field("parent").field("language_tag").field("length"))
        .sub(
            Path::new()
                .field("parent")
                .field("translated_keyword")
                .field("length"),
        )
        .sub(2i64);
    let mut table = DispatchTable::new();
    table.register(
        0i64,
        Arc::new(Definition::string("text", text_length.clone(), Encoding::Utf8)),
    );
    table.register(1i64, Arc::new(Definition::bytestring("text", text_length)));
    table.register_alias("default", 0i64);
    let text = Definition::delegating(
        "text",
        Arc::new(table),
        Path::new().field("parent").field("compression_flag").field("value"),
    );
    Definition::defined_children(
        "iTXt_payload",
        vec![
            Arc::new(Definition::null_terminated_string("keyword", Encoding::Latin1)),
            Arc::new(
                Definition::integer("compression_flag", IntFormat::be_u8())
                    .with_validation(value_in(&[0, 1], "compression flag")),
            ),
            Arc::new(
                Definition::integer("compression_method", IntFormat::be_u8())
                    .with_validation(value_in(&[0], "compression method")),
            ),
            Arc::new(Definition::null_terminated_string("language_tag", Encoding::Ascii)),
            Arc::new(Definition::null_terminated_string(
                "translated_keyword",
                Encoding::Utf8,
            )),
            Arc::new(text),
        ],
    )
}

fn bkgd_payload() -> Arc<Definition> {
    let mut table = DispatchTable::new();
    table.register(
        0i64,
        Arc::new(Definition::integer("bKGD_payload", IntFormat::be_u16())),
    );
    table.register(
        2i64,
        Arc::new(Definition::integer_sequence(
            "bKGD_payload",
            IntFormat::be_u16(),
            3i64,
            1i64,
        )),
    );
    table.register(
        3i64,
        Arc::new(Definition::integer("bKGD_payload", IntFormat::be_u8())),
    );
    table.register_alias(4i64, 0i64);
    table.register_alias(6i64, 2i64);
    Arc::new(
        Definition::delegating("bKGD_payload", Arc::new(table), color_type_key())
            .with_validation(needs_ihdr()),
    )
}

fn sbit_payload() -> Arc<Definition> {
    let mut table = DispatchTable::new();
    table.register(
        0i64,
        Arc::new(Definition::integer("sBIT_payload", IntFormat::be_u8())),
    );
    table.register(
        2i64,
        Arc::new(Definition::integer_sequence(
            "sBIT_payload",
            IntFormat::be_u8(),
            3i64,
            1i64,
        )),
    );
    table.register(
        4i64,
        Arc::new(Definition::integer_sequence(
            "sBIT_payload",
            IntFormat::be_u8(),
            2i64,
            1i64,
        )),
    );
    table.register(
        6i64,
        Arc::new(Definition::integer_sequence(
            "sBIT_payload",
            IntFormat::be_u8(),
            4i64,
            1i64,
        )),
    );
    table.register_alias(3i64, 2i64);
    Arc::new(
        Definition::delegating("sBIT_payload", Arc::new(table), color_type_key())
            .with_validation(needs_ihdr()),
    )
}

fn hist_payload() -> Definition {
    Definition::integer_sequence(
        "hIST_payload",
        IntFormat::be_u16(),
        chunk_length().div(2i64),
        1i64,
    )
    .with_validation(
        Validation::new(chunk_length().rem(2i64), CompareOp::Eq, 0i64)
            .severity(Severity::Error)
            .stage(Stage::Pre)
            .describe("histogram length divisible by two"),
    )
}

fn phys_payload() -> Definition {
    Definition::defined_children(
        "pHYs_payload",
        vec![
            Arc::new(Definition::integer("pixels_per_unit_x", IntFormat::be_u32())),
            Arc::new(Definition::integer("pixels_per_unit_y", IntFormat::be_u32())),
            Arc::new(
                Definition::integer("unit", IntFormat::be_u8())
                    .with_validation(value_in(&[0, 1], "unit specifier")),
            ),
        ],
    )
}

fn splt_entry(format: IntFormat) -> Arc<Definition> {
    Arc::new(Definition::defined_children(
        "entry",
        vec![
            Arc::new(Definition::integer("red", format)),
            Arc::new(Definition::integer("green", format)),
            Arc::new(Definition::integer("blue", format)),
            Arc::new(Definition::integer("alpha", format)),
            Arc::new(Definition::integer("frequency", IntFormat::be_u16())),
        ],
    ))
}

fn splt_payload() -> Definition {
    let mut table = DispatchTable::new();
    table.register(8i64, splt_entry(IntFormat::be_u8()));
    table.register(16i64, splt_entry(IntFormat::be_u16()));
    let entry = Definition::delegating(
        "entry",
        Arc::new(table),
        Path::new()
            .field("parent")
            .field("parent")
            .field("sample_depth")
            .field("value"),
    );
    // Entry size is four samples plus a two-byte frequency.
    let entry_size = Path::new()
        .field("parent")
        .field("sample_depth")
        .field("value")
        .div(8i64)
        .mul(4i64)
        .add(2i64);
    let items = inner_chunk_length()
        .sub(Path::new().field("parent").field("palette_name").field("length"))
        .sub(1i64)
        .div(entry_size);
    Definition::defined_children(
        "sPLT_payload",
        vec![
            Arc::new(Definition::null_terminated_string(
                "palette_name",
                Encoding::Latin1,
            )),
            Arc::new(
                Definition::integer("sample_depth", IntFormat::be_u8())
                    .with_validation(value_in(&[8, 16], "sample depth")),
            ),
            Arc::new(Definition::node_sequence(
                "entries",
                Arc::new(entry),
                Some(PathOr::from(items)),
                None,
            )),
        ],
    )
}

fn time_payload() -> Definition {
    Definition::defined_children(
        "tIME_payload",
        vec![
            Arc::new(Definition::integer("year", IntFormat::be_u16())),
            Arc::new(
                Definition::integer("month", IntFormat::be_u8())
                    .with_validation(value_between(1, 12, "month range")),
            ),
            Arc::new(
                Definition::integer("day", IntFormat::be_u8())
                    .with_validation(value_between(1, 31, "day range")),
            ),
            Arc::new(
                Definition::integer("hour", IntFormat::be_u8())
                    .with_validation(value_between(0, 23, "hour range")),
            ),
            Arc::new(
                Definition::integer("minute", IntFormat::be_u8())
                    .with_validation(value_between(0, 59, "minute range")),
            ),
            Arc::new(
                Definition::integer("second", IntFormat::be_u8())
                    .with_validation(value_between(0, 60, "second range")),
            ),
        ],
    )
}

/// Dispatch table mapping `<type>_payload` keys to payload definitions, with
/// an opaque default for unrecognized chunk types.
pub fn payloads() -> Arc<DispatchTable> {
    let mut table = DispatchTable::new();
    table.register("IHDR_payload", Arc::new(ihdr_payload()));
    table.register("PLTE_payload", Arc::new(plte_payload()));
    table.register(
        "IDAT_payload",
        Arc::new(Definition::bytestring("IDAT_payload", chunk_length())),
    );
    table.register(
        "IEND_payload",
        Arc::new(Definition::static_bytes("IEND_payload", b"")),
    );
    table.register("tRNS_payload", trns_payload());
    table.register("cHRM_payload", Arc::new(chrm_payload()));
    table.register(
        "gAMA_payload",
        Arc::new(Definition::integer("gAMA_payload", IntFormat::be_u32())),
    );
    table.register("iCCP_payload", Arc::new(iccp_payload()));
    table.register("sBIT_payload", sbit_payload());
    table.register(
        "sRGB_payload",
        Arc::new(
            Definition::integer("sRGB_payload", IntFormat::be_u8())
                .with_validation(value_in(&[0, 1, 2, 3], "rendering intent")),
        ),
    );
    table.register("tEXt_payload", Arc::new(text_payload()));
    table.register("zTXt_payload", Arc::new(ztxt_payload()));
    table.register("iTXt_payload", Arc::new(itxt_payload()));
    table.register("bKGD_payload", bkgd_payload());
    table.register("hIST_payload", Arc::new(hist_payload()));
    table.register("pHYs_payload", Arc::new(phys_payload()));
    table.register("sPLT_payload", Arc::new(splt_payload()));
    table.register("tIME_payload", Arc::new(time_payload()));
    table.register_default(Arc::new(Definition::bytestring(
        "unknown_payload",
        chunk_length(),
    )));
    Arc::new(table)
}

/// One chunk: length, type (with property bit flags), dispatched payload, crc.
pub fn chunk() -> Arc<Definition> {
    let length = Definition::integer("length", IntFormat::be_u32()).with_validation(
        Validation::new(own_value(), CompareOp::Lt, 1i64 << 31)
            .severity(Severity::Error)
            .describe("length range"),
    );
    let chunk_type = Definition::string("chunk_type", 4i64, Encoding::Ascii)
        .with_validation(
            Validation::new(own_value(), CompareOp::Matches, Value::Str("[a-zA-Z]{4}".to_string()))
                .severity(Severity::Fatal)
                .describe("chunk type letters"),
        )
        .with_attribute(Attribute::bit_flag("ancillary", "value", 5, Some(0)))
        .with_attribute(Attribute::bit_flag("private", "value", 5, Some(1)))
        .with_attribute(Attribute::bit_flag("reserved", "value", 5, Some(2)))
        .with_attribute(Attribute::bit_flag("safe_to_copy", "value", 5, Some(3)))
        .with_validation(
            Validation::new(Expr::Attr("reserved".to_string()), CompareOp::Eq, Value::Bool(false))
                .severity(Severity::Warning)
                .describe("reserved bit clear"),
        );
    let payload = Definition::delegating(
        "payload",
        payloads(),
        Path::new()
            .field("parent")
            .field("chunk_type")
            .field("value")
            .add("_payload"),
    );
    let crc = Definition::integer("crc", IntFormat::be_u32());
    Arc::new(
        Definition::defined_children(
            "chunk",
            vec![
                Arc::new(length),
                Arc::new(chunk_type),
                Arc::new(payload),
                Arc::new(crc),
            ],
        )
        .with_validation(
            // By the time this runs the chunk's own postread `length`
            // metadata shadows the length child in name lookup, so both
            // sides go through explicit child indexing.
            Validation::new(
                Path::new().field("children").index(2).field("length"),
                CompareOp::Eq,
                Path::new().field("children").index(0).field("value"),
            )
            .severity(Severity::Fatal)
            .describe("declared length"),
        )
        .with_attribute(Attribute::path(
            "type",
            Path::new().field("chunk_type").field("value"),
        )),
    )
}

/// The whole file: signature, then chunks until the source runs out.
pub fn png() -> Arc<Definition> {
    Arc::new(Definition::defined_children(
        "PNG",
        vec![
            Arc::new(Definition::static_bytes(
                "signature",
                b"\x89PNG\r\n\x1a\n",
            )),
            Arc::new(Definition::node_sequence("chunks", chunk(), None, None)),
        ],
    ))
}
