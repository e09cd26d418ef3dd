//! Static memory layout tests: segments, strings and arrays.

use crate::compiler::ast::*;
use crate::compiler::codegen::{CompilerOptions, Target};
use crate::compiler::program::Program;
use crate::compiler::wir::nodes::{ExprNode, Literal};
use crate::compiler_tests::test_helpers::*;

fn string_return(name: &str, value: &str) -> Statement {
    declaration_statement(function_declaration(
        name,
        Vec::new(),
        Some("usize"),
        vec![ret(Expression::string(value, loc()))],
    ))
}

#[test]
fn equal_string_literals_share_one_segment() {
    let (module, _) = compile(vec![
        string_return("a", "hello"),
        string_return("b", "hello"),
    ]);
    assert_eq!(module.segments.len(), 1, "equal contents canonicalise");
    let a = return_value(&module, body_statements(&module, "test/a")[0]);
    let b = return_value(&module, body_statements(&module, "test/b")[0]);
    assert_eq!(module.node(a), module.node(b));
}

#[test]
fn distinct_string_literals_get_distinct_segments() {
    let (module, _) = compile(vec![
        string_return("a", "hello"),
        string_return("b", "world"),
    ]);
    assert_eq!(module.segments.len(), 2);
}

#[test]
fn string_bytes_are_length_then_utf16_code_units() {
    let (module, _) = compile(vec![string_return("a", "hi")]);
    let segment = &module.segments[0];
    assert_eq!(segment.offset % 8, 0);
    assert!(segment.offset >= 8, "the null sentinel stays reserved");
    let mut expected = Vec::new();
    expected.extend_from_slice(&2i32.to_le_bytes());
    expected.extend_from_slice(&(b'h' as u16).to_le_bytes());
    expected.extend_from_slice(&(b'i' as u16).to_le_bytes());
    assert_eq!(segment.data, expected);
    // The returned pointer targets the segment body.
    let value = return_value(&module, body_statements(&module, "test/a")[0]);
    assert_eq!(
        module.node(value),
        &ExprNode::Const(Literal::I32(segment.offset as i32))
    );
}

#[test]
fn memory_offsets_are_monotonic_and_aligned() {
    let (module, _) = compile(vec![
        string_return("a", "one"),
        string_return("b", "twotwo"),
        string_return("c", "threethree"),
    ]);
    let mut previous_end = 8;
    for segment in &module.segments {
        assert!(segment.offset >= previous_end, "offsets never go backwards");
        assert_eq!(segment.offset % 8, 0);
        // Post-alignment, each segment starts where the previous ended.
        assert_eq!(segment.offset, (previous_end + 7) & !7);
        previous_end = segment.offset + segment.data.len() as u64;
    }
}

#[test]
fn memory_base_moves_the_first_segment_up() {
    let options = CompilerOptions {
        no_tree_shaking: true,
        memory_base: 1024,
        ..CompilerOptions::default()
    };
    let (module, _) = compile_with(vec![string_return("a", "x")], options);
    assert_eq!(module.segments[0].offset, 1024);
}

#[test]
fn a_constant_array_literal_emits_buffer_and_header_segments() {
    // [1, 2, 3]: buffer rounded to the next power of two of 8 + 12.
    let (module, _) = compile(vec![declaration_statement(function_declaration(
        "arr",
        Vec::new(),
        Some("usize"),
        vec![ret(Expression::new(
            ExpressionKind::ArrayLiteral(vec![int(1), int(2), int(3)]),
            loc(),
        ))],
    ))]);
    assert_eq!(module.segments.len(), 2);
    let buffer = &module.segments[0];
    let header = &module.segments[1];
    assert_eq!(buffer.data.len(), 32, "8-byte header + 12 bytes, pow2");
    // Buffer: [byteLength: i32][pad][1, 2, 3]
    assert_eq!(&buffer.data[0..4], &12i32.to_le_bytes());
    assert_eq!(&buffer.data[8..12], &1i32.to_le_bytes());
    assert_eq!(&buffer.data[12..16], &2i32.to_le_bytes());
    assert_eq!(&buffer.data[16..20], &3i32.to_le_bytes());
    // Header: [buffer: usize][length: i32] pointing at the buffer.
    assert_eq!(&header.data[0..4], &(buffer.offset as u32).to_le_bytes());
    assert_eq!(&header.data[4..8], &3i32.to_le_bytes());
    // The expression yields the header pointer.
    let value = return_value(&module, body_statements(&module, "test/arr")[0]);
    assert_eq!(
        module.node(value),
        &ExprNode::Const(Literal::I32(header.offset as i32))
    );
}

#[test]
fn non_constant_array_literals_are_rejected() {
    let (_, program) = compile_expecting_errors(vec![declaration_statement(
        function_declaration(
            "arr",
            vec![parameter("x", "i32")],
            Some("usize"),
            vec![ret(Expression::new(
                ExpressionKind::ArrayLiteral(vec![ident("x")]),
                loc(),
            ))],
        ),
    )]);
    assert!(
        program
            .messages
            .errors
            .iter()
            .any(|e| e.msg.contains("not supported")),
        "expected the runtime-array diagnostic"
    );
}

#[test]
fn initial_pages_cover_the_static_data() {
    let options = CompilerOptions {
        no_tree_shaking: true,
        memory_base: 3 * 65536,
        ..CompilerOptions::default()
    };
    let (module, _) = compile_with(vec![string_return("a", "x")], options);
    assert!(module.initial_pages >= 4, "static data spills into page 4");
    assert!(module.has_export("memory"));
}

#[test]
fn wasm64_uses_eight_byte_pointers() {
    let options = CompilerOptions {
        no_tree_shaking: true,
        target: Target::Wasm64,
        ..CompilerOptions::default()
    };
    // Compile without validating: the encoded module uses memory64.
    let mut program = Program::new(vec![Source::entry(
        "test.tr",
        vec![string_return("a", "x")],
    )]);
    let module = crate::compiler::codegen::Compiler::new(&mut program, options)
        .compile()
        .expect("compilation should succeed");
    assert!(!program.messages.has_errors());
    let heap_base = module
        .globals
        .iter()
        .find(|g| g.name == "HEAP_BASE")
        .unwrap();
    assert!(matches!(heap_base.init, Literal::I64(_)));
    // String pointers are 64-bit constants.
    let value = return_value(&module, body_statements(&module, "test/a")[0]);
    assert!(matches!(module.node(value), ExprNode::Const(Literal::I64(_))));
}
