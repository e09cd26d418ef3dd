//! End-to-end codegen tests: declarations, statements, conversions and
//! flow analysis, asserted against the WIR shapes the compiler emits.

use crate::compiler::ast::*;
use crate::compiler::codegen::{CompilerOptions, Feature};
use crate::compiler::program::ElementFlags;
use crate::compiler::wir::nodes::{BinaryOp, ExprNode, Literal, UnaryOp};
use crate::compiler_tests::test_helpers::*;

// ============================================================================
// Short-integer wrapping
// ============================================================================

fn increment_i8_source() -> Vec<Statement> {
    // export function foo(x: i8): i8 { return x + 1 }
    vec![declaration_statement(exported(function_declaration(
        "foo",
        vec![parameter("x", "i8")],
        Some("i8"),
        vec![ret(Expression::binary(BinaryOperator::Add, ident("x"), int(1)))],
    )))]
}

#[test]
fn short_integer_return_wraps_with_sign_extension() {
    let options = CompilerOptions {
        no_tree_shaking: true,
        features: Feature::NONE.with(Feature::SIGN_EXTENSION),
        ..CompilerOptions::default()
    };
    let (module, _) = compile_with(increment_i8_source(), options);
    let statements = body_statements(&module, "test/foo");
    let value = return_value(&module, statements[0]);
    let ExprNode::Unary {
        op: UnaryOp::ExtendI8ToI32,
        operand,
    } = module.node(value)
    else {
        panic!("expected i32.extend8_s, got {:?}", module.node(value));
    };
    assert!(matches!(
        module.node(*operand),
        ExprNode::Binary {
            op: BinaryOp::AddI32,
            ..
        }
    ));
}

#[test]
fn short_integer_return_wraps_with_shift_pair_without_the_feature() {
    let (module, _) = compile(increment_i8_source());
    let statements = body_statements(&module, "test/foo");
    let value = return_value(&module, statements[0]);
    // shr_s(shl(add(x, 1), 24), 24)
    let ExprNode::Binary {
        op: BinaryOp::ShrSI32,
        left,
        right,
    } = module.node(value)
    else {
        panic!("expected a shift pair, got {:?}", module.node(value));
    };
    assert_eq!(module.node(*right), &ExprNode::Const(Literal::I32(24)));
    let ExprNode::Binary {
        op: BinaryOp::ShlI32,
        left: inner,
        right: inner_shift,
    } = module.node(*left)
    else {
        panic!("expected shl below shr_s");
    };
    assert_eq!(
        module.node(*inner_shift),
        &ExprNode::Const(Literal::I32(24))
    );
    assert!(matches!(
        module.node(*inner),
        ExprNode::Binary {
            op: BinaryOp::AddI32,
            ..
        }
    ));
}

#[test]
fn no_conversion_op_when_types_already_match() {
    let (module, _) = compile(vec![declaration_statement(function_declaration(
        "id",
        vec![parameter("x", "i32")],
        Some("i32"),
        vec![ret(ident("x"))],
    ))]);
    let statements = body_statements(&module, "test/id");
    let value = return_value(&module, statements[0]);
    assert!(matches!(
        module.node(value),
        ExprNode::GetLocal { index: 0, .. }
    ));
}

#[test]
fn explicit_float_to_int_cast_truncates() {
    let (module, _) = compile(vec![declaration_statement(function_declaration(
        "trunc",
        vec![parameter("x", "f64")],
        Some("i32"),
        vec![ret(Expression::new(
            ExpressionKind::As {
                operand: Box::new(ident("x")),
                type_node: type_node("i32"),
            },
            loc(),
        ))],
    ))]);
    let statements = body_statements(&module, "test/trunc");
    let value = return_value(&module, statements[0]);
    assert!(matches!(
        module.node(value),
        ExprNode::Unary {
            op: UnaryOp::TruncSF64ToI32,
            ..
        }
    ));
}

#[test]
fn widening_an_i8_argument_to_i64_rewraps_before_the_extend() {
    // export function wide(x: i8): i64 { return x + 1 }
    // The add may overflow i8, so the extend must see wrapped bits.
    let (module, _) = compile(vec![declaration_statement(function_declaration(
        "wide",
        vec![parameter("x", "i8")],
        Some("i64"),
        vec![ret(Expression::binary(BinaryOperator::Add, ident("x"), int(1)))],
    ))]);
    let statements = body_statements(&module, "test/wide");
    let value = return_value(&module, statements[0]);
    let ExprNode::Unary {
        op: UnaryOp::ExtendSI32,
        operand,
    } = module.node(value)
    else {
        panic!("expected i64.extend_i32_s, got {:?}", module.node(value));
    };
    // Below the extend: the shift-pair wrap of the add.
    assert!(matches!(
        module.node(*operand),
        ExprNode::Binary {
            op: BinaryOp::ShrSI32,
            ..
        }
    ));
}

// ============================================================================
// Statements and flow
// ============================================================================

#[test]
fn terminating_do_while_body_elides_the_condition_check() {
    // function f(x: i32): i32 { do { return 1 } while (x) }
    let body = Statement::block(vec![ret(int(1))], loc());
    let (module, _) = compile(vec![declaration_statement(function_declaration(
        "f",
        vec![parameter("x", "i32")],
        Some("i32"),
        vec![Statement::new(
            StatementKind::DoWhile {
                body: Box::new(body),
                condition: ident("x"),
            },
            loc(),
        )],
    ))]);
    let statements = body_statements(&module, "test/f");
    // block break|0 { loop continue|0 { return 1 } }
    let ExprNode::Block {
        label: Some(break_label),
        children,
        ..
    } = module.node(statements[0])
    else {
        panic!("expected the loop's break block");
    };
    assert!(break_label.starts_with("break|"));
    let ExprNode::Loop { body, .. } = module.node(children[0]) else {
        panic!("expected a loop inside the break block");
    };
    let ExprNode::Block { children, .. } = module.node(*body) else {
        panic!("expected the loop body block");
    };
    assert_eq!(children.len(), 1, "the br_if should be elided");
    assert!(matches!(module.node(children[0]), ExprNode::Return { .. }));
}

#[test]
fn if_with_both_arms_returning_satisfies_the_return_check() {
    let (_, _) = compile(vec![declaration_statement(function_declaration(
        "pick",
        vec![parameter("x", "i32")],
        Some("i32"),
        vec![Statement::new(
            StatementKind::If {
                condition: ident("x"),
                if_true: Box::new(ret(int(1))),
                if_false: Some(Box::new(ret(int(2)))),
            },
            loc(),
        )],
    ))]);
}

#[test]
fn if_with_one_returning_arm_does_not_count_as_returning() {
    let (_, program) = compile_expecting_errors(vec![declaration_statement(
        function_declaration(
            "maybe",
            vec![parameter("x", "i32")],
            Some("i32"),
            vec![Statement::new(
                StatementKind::If {
                    condition: ident("x"),
                    if_true: Box::new(ret(int(1))),
                    if_false: None,
                },
                loc(),
            )],
        ),
    )]);
    assert!(
        program
            .messages
            .errors
            .iter()
            .any(|e| e.msg.contains("must return")),
        "expected a missing-return diagnostic"
    );
}

#[test]
fn constant_if_condition_elides_the_dead_arm() {
    // if (0) { unreachable-arm } else { return 1 }
    let (module, _) = compile(vec![declaration_statement(function_declaration(
        "elide",
        Vec::new(),
        Some("i32"),
        vec![Statement::new(
            StatementKind::If {
                condition: int(0),
                if_true: Box::new(ret(int(7))),
                if_false: Some(Box::new(ret(int(1)))),
            },
            loc(),
        )],
    ))]);
    let statements = body_statements(&module, "test/elide");
    // The live arm compiles directly; no If node remains.
    assert!(matches!(module.node(statements[0]), ExprNode::Return { .. }));
    let value = return_value(&module, statements[0]);
    assert_eq!(module.node(value), &ExprNode::Const(Literal::I32(1)));
}

#[test]
fn break_outside_a_loop_is_a_diagnostic() {
    let (_, program) = compile_expecting_errors(vec![declaration_statement(
        function_declaration(
            "bad",
            Vec::new(),
            None,
            vec![Statement::new(StatementKind::Break(None), loc())],
        ),
    )]);
    assert!(
        program
            .messages
            .errors
            .iter()
            .any(|e| e.msg.contains("'break'")),
        "expected a break-placement diagnostic"
    );
}

#[test]
fn while_true_with_a_return_terminates_the_function() {
    // function spin(): i32 { while (true) { return 3 } }
    let body = Statement::block(vec![ret(int(3))], loc());
    let (_, _) = compile(vec![declaration_statement(function_declaration(
        "spin",
        Vec::new(),
        Some("i32"),
        vec![Statement::new(
            StatementKind::While {
                condition: Expression::new(ExpressionKind::True, loc()),
                body: Box::new(body),
            },
            loc(),
        )],
    ))]);
}

#[test]
fn try_statements_report_operation_not_supported() {
    let (_, program) = compile_expecting_errors(vec![declaration_statement(
        function_declaration(
            "t",
            Vec::new(),
            None,
            vec![Statement::new(
                StatementKind::Try {
                    statements: Vec::new(),
                    catch_variable: None,
                    catch_statements: None,
                    finally_statements: None,
                },
                loc(),
            )],
        ),
    )]);
    assert!(
        program
            .messages
            .errors
            .iter()
            .any(|e| e.msg.contains("not supported")),
        "expected an unsupported-operation diagnostic"
    );
}

// ============================================================================
// Locals and virtual locals
// ============================================================================

#[test]
fn a_const_local_with_a_constant_initializer_becomes_virtual() {
    // function k(): i32 { const K: i32 = 7; return K }
    let (module, _) = compile(vec![declaration_statement(function_declaration(
        "k",
        Vec::new(),
        Some("i32"),
        vec![
            local_variable("K", Some("i32"), Some(int(7)), vec![Modifier::Const]),
            ret(ident("K")),
        ],
    ))]);
    let function = module.get_function("test/k").unwrap();
    assert!(
        function.locals.is_empty(),
        "a virtual local must not allocate a slot"
    );
    let statements = body_statements(&module, "test/k");
    // The declaration compiles to a nop, the read to the literal.
    assert!(matches!(module.node(statements[0]), ExprNode::Nop));
    let value = return_value(&module, statements[1]);
    assert_eq!(module.node(value), &ExprNode::Const(Literal::I32(7)));
}

#[test]
fn a_mutable_local_allocates_a_slot_and_initializes_it() {
    let (module, _) = compile(vec![declaration_statement(function_declaration(
        "m",
        Vec::new(),
        Some("i32"),
        vec![
            local_variable("v", Some("i32"), Some(int(3)), vec![Modifier::Let]),
            ret(ident("v")),
        ],
    ))]);
    let function = module.get_function("test/m").unwrap();
    assert_eq!(function.locals.len(), 1);
    let statements = body_statements(&module, "test/m");
    assert!(matches!(
        module.node(statements[0]),
        ExprNode::SetLocal { index: 0, .. }
    ));
}

// ============================================================================
// Enums
// ============================================================================

fn const_enum_declaration() -> Declaration {
    // const enum E { A, B, C = A + B }
    Declaration {
        name: "E".to_string(),
        kind: DeclarationKind::Enum(EnumDeclaration {
            members: vec![
                EnumValueNode {
                    name: "A".to_string(),
                    initializer: None,
                    location: loc(),
                },
                EnumValueNode {
                    name: "B".to_string(),
                    initializer: None,
                    location: loc(),
                },
                EnumValueNode {
                    name: "C".to_string(),
                    initializer: Some(Expression::binary(
                        BinaryOperator::Add,
                        ident("A"),
                        ident("B"),
                    )),
                    location: loc(),
                },
            ],
        }),
        modifiers: vec![Modifier::Const],
        decorators: Vec::new(),
        location: loc(),
    }
}

#[test]
fn const_enum_members_inline_their_values() {
    let (module, program) = compile(vec![
        declaration_statement(const_enum_declaration()),
        declaration_statement(function_declaration(
            "c",
            Vec::new(),
            Some("i32"),
            vec![ret(Expression::property_access(ident("E"), "C"))],
        )),
    ]);
    // All three members are inlined with 0, 1, 1.
    let enum_id = program.lookup("E").unwrap();
    let members = match &program.element(enum_id).kind {
        crate::compiler::program::ElementKind::Enum(e) => e.members.clone(),
        _ => panic!("E should be an enum"),
    };
    let values: Vec<_> = members
        .iter()
        .map(|&member| {
            assert!(program.element(member).flags.has(ElementFlags::INLINED));
            program.enum_value(member).constant_value
        })
        .collect();
    assert_eq!(
        values,
        vec![
            Some(Literal::I32(0)),
            Some(Literal::I32(1)),
            Some(Literal::I32(1))
        ]
    );
    // A reference to E.C is the constant, not a global read.
    let statements = body_statements(&module, "test/c");
    let value = return_value(&module, statements[0]);
    assert_eq!(module.node(value), &ExprNode::Const(Literal::I32(1)));
    assert!(!module.has_global("test/E.C"));
}

// ============================================================================
// Globals and the start function
// ============================================================================

#[test]
fn a_const_global_with_constant_initializer_inlines() {
    let (module, program) = compile(vec![
        local_variable("G", Some("i32"), Some(int(41)), vec![Modifier::Const]),
        declaration_statement(function_declaration(
            "g",
            Vec::new(),
            Some("i32"),
            vec![ret(ident("G"))],
        )),
    ]);
    let global = program.lookup("G").unwrap();
    assert!(program.element(global).flags.has(ElementFlags::INLINED));
    assert!(!module.has_global("test/G"));
    let statements = body_statements(&module, "test/g");
    let value = return_value(&module, statements[0]);
    assert_eq!(module.node(value), &ExprNode::Const(Literal::I32(41)));
}

#[test]
fn a_non_constant_initializer_runs_in_the_start_function() {
    // declare function seed(): i32; let g: i32 = seed();
    let (module, _) = compile(vec![
        declaration_statement(ambient_function("seed", Vec::new(), Some("i32"))),
        local_variable("g", Some("i32"), Some(Expression::call(ident("seed"), Vec::new())), vec![Modifier::Let]),
    ]);
    assert!(module.has_global("test/g"));
    let start = module.get_function("start").expect("start should exist");
    let ExprNode::Block { children, .. } = module.node(start.body) else {
        panic!("start body should be a block");
    };
    assert!(children
        .iter()
        .any(|&c| matches!(module.node(c), ExprNode::SetGlobal { name, .. } if name == "test/g")));
    assert_eq!(module.start.as_deref(), Some("start"));
}

#[test]
fn a_const_declared_with_non_constant_initializer_degrades_with_a_warning() {
    let (_, program) = compile(vec![
        declaration_statement(ambient_function("seed", Vec::new(), Some("i32"))),
        local_variable(
            "g",
            Some("i32"),
            Some(Expression::call(ident("seed"), Vec::new())),
            vec![Modifier::Const],
        ),
    ]);
    assert!(
        program
            .messages
            .warnings
            .iter()
            .any(|w| w.msg.contains("not a compile-time constant")),
        "expected the degradation warning"
    );
}

#[test]
fn main_boots_the_start_function_exactly_once() {
    let (module, _) = compile(vec![declaration_statement(exported(
        function_declaration("main", Vec::new(), None, vec![]),
    ))]);
    assert!(module.has_global("~started"));
    // With a user main, start exists but is not the module start.
    assert!(module.get_function("start").is_some());
    assert!(module.start.is_none());
    let statements = body_statements(&module, "test/main");
    let ExprNode::If { if_true, .. } = module.node(statements[0]) else {
        panic!("main should begin with the ~started guard");
    };
    let ExprNode::Block { children, .. } = module.node(*if_true) else {
        panic!("guard body should be a block");
    };
    assert!(matches!(
        module.node(children[0]),
        ExprNode::Call { target, .. } if target == "start"
    ));
}

#[test]
fn heap_base_is_exported_and_pointer_aligned() {
    let (module, _) = compile(vec![declaration_statement(function_declaration(
        "noop",
        Vec::new(),
        None,
        vec![],
    ))]);
    assert!(module.has_global("HEAP_BASE"));
    assert!(module.has_export("HEAP_BASE"));
    let heap_base = module
        .globals
        .iter()
        .find(|g| g.name == "HEAP_BASE")
        .unwrap();
    let Literal::I32(offset) = heap_base.init else {
        panic!("HEAP_BASE should be i32 on wasm32");
    };
    assert!(offset >= 8, "the first eight bytes stay reserved");
    assert_eq!(offset % 4, 0);
}

#[test]
fn mutable_global_export_requires_the_feature() {
    let statements = vec![Statement::new(
        StatementKind::Variable(VariableDeclaration {
            declarations: vec![VariableDeclarator {
                name: "counter".to_string(),
                type_node: Some(type_node("i32")),
                initializer: Some(int(0)),
                location: loc(),
            }],
            modifiers: vec![Modifier::Export, Modifier::Let],
        }),
        loc(),
    )];
    let (_, program) = compile_expecting_errors(statements.clone());
    assert!(
        program
            .messages
            .errors
            .iter()
            .any(|e| e.msg.contains("mutable global")),
        "expected the mutable-global diagnostic"
    );

    let options = CompilerOptions {
        no_tree_shaking: true,
        features: Feature::NONE.with(Feature::MUTABLE_GLOBAL),
        ..CompilerOptions::default()
    };
    let (module, _) = compile_with(statements, options);
    assert!(module.has_export("counter"));
}

#[test]
fn exported_functions_appear_under_their_alias() {
    let mut options = CompilerOptions {
        no_tree_shaking: false,
        ..CompilerOptions::default()
    };
    options
        .global_aliases
        .insert("entry".to_string(), "run".to_string());
    let (module, _) = compile_with(
        vec![declaration_statement(exported(function_declaration(
            "entry",
            Vec::new(),
            Some("i32"),
            vec![ret(int(1))],
        )))],
        options,
    );
    assert!(module.has_export("run"));
    assert!(!module.has_export("entry"));
}

#[test]
fn tree_shaking_skips_unexported_declarations() {
    let options = CompilerOptions::default(); // tree shaking on
    let mut program = crate::compiler::program::Program::new(vec![Source::entry(
        "test.tr",
        vec![
            declaration_statement(function_declaration(
                "dead",
                Vec::new(),
                Some("i32"),
                vec![ret(int(1))],
            )),
            declaration_statement(exported(function_declaration(
                "live",
                Vec::new(),
                Some("i32"),
                vec![ret(int(2))],
            ))),
        ],
    )]);
    let module = crate::compiler::codegen::Compiler::new(&mut program, options)
        .compile()
        .unwrap();
    assert!(module.get_function("test/live").is_some());
    assert!(module.get_function("test/dead").is_none());
}

// ============================================================================
// Aborts and idempotence
// ============================================================================

#[test]
fn throw_lowers_to_the_same_sequence_as_abort() {
    let mut abort = ambient_function("abort", Vec::new(), None);
    abort.decorators.push(Decorator {
        name: "builtin".to_string(),
        arguments: Vec::new(),
        location: loc(),
    });
    let (module, _) = compile(vec![
        declaration_statement(abort),
        declaration_statement(function_declaration(
            "thrower",
            Vec::new(),
            None,
            vec![Statement::new(StatementKind::Throw(int(0)), loc())],
        )),
        declaration_statement(function_declaration(
            "aborter",
            Vec::new(),
            None,
            vec![expr_statement(Expression::call(ident("abort"), Vec::new()))],
        )),
    ]);
    let throw_stmt = body_statements(&module, "test/thrower")[0];
    let abort_stmt = body_statements(&module, "test/aborter")[0];
    let shape = |statement| match module.node(statement) {
        ExprNode::Block { children, .. } => (
            matches!(module.node(children[0]), ExprNode::CallImport { target, .. } if target == "test/abort"),
            matches!(module.node(children[1]), ExprNode::Unreachable),
        ),
        other => panic!("expected the abort block, got {:?}", other),
    };
    assert_eq!(shape(throw_stmt), (true, true));
    assert_eq!(shape(abort_stmt), (true, true));
}

#[test]
fn elements_compile_exactly_once_across_references() {
    // Two readers of the same global and enum member produce exactly one
    // definition of each.
    let (module, _) = compile(vec![
        declaration_statement(ambient_function("seed", Vec::new(), Some("i32"))),
        local_variable(
            "g",
            Some("i32"),
            Some(Expression::call(ident("seed"), Vec::new())),
            vec![Modifier::Let],
        ),
        declaration_statement(function_declaration(
            "a",
            Vec::new(),
            Some("i32"),
            vec![ret(ident("g"))],
        )),
        declaration_statement(function_declaration(
            "b",
            Vec::new(),
            Some("i32"),
            vec![ret(ident("g"))],
        )),
    ]);
    let definitions = module
        .globals
        .iter()
        .filter(|global| global.name == "test/g")
        .count();
    assert_eq!(definitions, 1);
    // And the start body initialises it exactly once.
    let start = module.get_function("start").unwrap();
    let ExprNode::Block { children, .. } = module.node(start.body) else {
        panic!("start body should be a block");
    };
    let assignments = children
        .iter()
        .filter(|&&c| matches!(module.node(c), ExprNode::SetGlobal { name, .. } if name == "test/g"))
        .count();
    assert_eq!(assignments, 1);
}
