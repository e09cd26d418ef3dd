//! Operator lowering tests: instruction selection over the type lattice,
//! short-circuit logic, increments and the float Math lowering.

use crate::compiler::ast::*;
use crate::compiler::wir::nodes::{BinaryOp, ExprNode, Literal, NativeType};
use crate::compiler_tests::test_helpers::*;

fn binary_function(name: &str, ty: &str, op: BinaryOperator, result: &str) -> Statement {
    declaration_statement(function_declaration(
        name,
        vec![parameter("x", ty), parameter("y", ty)],
        Some(result),
        vec![ret(Expression::binary(op, ident("x"), ident("y")))],
    ))
}

fn returned_binary_op(module: &crate::compiler::wir::module::WirModule, name: &str) -> BinaryOp {
    let value = return_value(module, body_statements(module, name)[0]);
    match module.node(value) {
        ExprNode::Binary { op, .. } => *op,
        other => panic!("expected a binary op, got {:?}", other),
    }
}

// ============================================================================
// Instruction selection
// ============================================================================

#[test]
fn division_selects_signedness_from_the_operand_type() {
    let (module, _) = compile(vec![
        binary_function("sdiv", "i32", BinaryOperator::Div, "i32"),
        binary_function("udiv", "u32", BinaryOperator::Div, "u32"),
        binary_function("ldiv", "i64", BinaryOperator::Div, "i64"),
        binary_function("fdiv", "f64", BinaryOperator::Div, "f64"),
    ]);
    assert_eq!(returned_binary_op(&module, "test/sdiv"), BinaryOp::DivSI32);
    assert_eq!(returned_binary_op(&module, "test/udiv"), BinaryOp::DivUI32);
    assert_eq!(returned_binary_op(&module, "test/ldiv"), BinaryOp::DivSI64);
    assert_eq!(returned_binary_op(&module, "test/fdiv"), BinaryOp::DivF64);
}

#[test]
fn comparisons_select_signedness_and_produce_bool() {
    let (module, _) = compile(vec![
        binary_function("slt", "i32", BinaryOperator::Lt, "bool"),
        binary_function("ult", "u32", BinaryOperator::Lt, "bool"),
        binary_function("flt", "f32", BinaryOperator::Lt, "bool"),
    ]);
    assert_eq!(returned_binary_op(&module, "test/slt"), BinaryOp::LtSI32);
    assert_eq!(returned_binary_op(&module, "test/ult"), BinaryOp::LtUI32);
    assert_eq!(returned_binary_op(&module, "test/flt"), BinaryOp::LtF32);
}

#[test]
fn mixed_signedness_comparison_at_equal_width_is_an_error() {
    let (_, program) = compile_expecting_errors(vec![declaration_statement(
        function_declaration(
            "bad",
            vec![parameter("x", "i32"), parameter("y", "u32")],
            Some("bool"),
            vec![ret(Expression::binary(BinaryOperator::Lt, ident("x"), ident("y")))],
        ),
    )]);
    assert!(
        program
            .messages
            .errors
            .iter()
            .any(|e| e.msg.contains("cannot be applied")),
        "expected the operand-compatibility diagnostic"
    );
}

#[test]
fn small_integer_comparison_wraps_both_operands() {
    // i8 comparison needs honest sign bits on both sides.
    let (module, _) = compile(vec![binary_function(
        "cmp",
        "i8",
        BinaryOperator::Lt,
        "bool",
    )]);
    let value = return_value(&module, body_statements(&module, "test/cmp")[0]);
    let ExprNode::Binary {
        op: BinaryOp::LtSI32,
        left,
        right,
    } = module.node(value)
    else {
        panic!("expected a signed i32 compare");
    };
    for operand in [left, right] {
        assert!(
            matches!(
                module.node(*operand),
                ExprNode::Binary {
                    op: BinaryOp::ShrSI32,
                    ..
                }
            ),
            "operand should be wrapped via the shift pair"
        );
    }
}

#[test]
fn unsigned_shift_right_emits_shr_u_exactly_once() {
    // i8 >>> : the unsigned shift clears the sign via the unsigned
    // companion, and shr_u appears once.
    let (module, _) = compile(vec![declaration_statement(function_declaration(
        "ushr",
        vec![parameter("x", "i8"), parameter("y", "i8")],
        Some("i8"),
        vec![ret(Expression::binary(
            BinaryOperator::ShrU,
            ident("x"),
            ident("y"),
        ))],
    ))]);
    let value = return_value(&module, body_statements(&module, "test/ushr")[0]);
    let ExprNode::Binary {
        op: BinaryOp::ShrUI32,
        left,
        ..
    } = module.node(value)
    else {
        panic!("expected shr_u at the top");
    };
    // The left operand masks to u8 bits; no second shr_u below.
    let ExprNode::Binary {
        op: BinaryOp::AndI32,
        right: mask,
        ..
    } = module.node(*left)
    else {
        panic!("expected the unsigned-companion mask");
    };
    assert_eq!(module.node(*mask), &ExprNode::Const(Literal::I32(0xff)));
}

#[test]
fn bitwise_ops_on_floats_are_rejected() {
    let (_, program) = compile_expecting_errors(vec![binary_function(
        "bad",
        "f64",
        BinaryOperator::BitAnd,
        "f64",
    )]);
    assert!(!program.messages.errors.is_empty());
}

// ============================================================================
// Float pow and mod route through Math
// ============================================================================

fn math_namespace(name: &str, member: &str) -> Declaration {
    let ty = if name == "Mathf" { "f32" } else { "f64" };
    Declaration {
        name: name.to_string(),
        kind: DeclarationKind::Namespace(vec![declaration_statement(ambient_function(
            member,
            vec![parameter("x", ty), parameter("y", ty)],
            Some(ty),
        ))]),
        modifiers: Vec::new(),
        decorators: Vec::new(),
        location: loc(),
    }
}

#[test]
fn float_pow_lowers_to_a_math_call() {
    let (module, _) = compile(vec![
        declaration_statement(math_namespace("Math", "pow")),
        binary_function("p", "f64", BinaryOperator::Pow, "f64"),
    ]);
    let value = return_value(&module, body_statements(&module, "test/p")[0]);
    let ExprNode::CallImport { target, operands, .. } = module.node(value) else {
        panic!("expected the Math.pow import call, got {:?}", module.node(value));
    };
    assert_eq!(target, "test/Math.pow");
    assert_eq!(operands.len(), 2);
}

#[test]
fn f32_modulo_lowers_to_a_mathf_call() {
    let (module, _) = compile(vec![
        declaration_statement(math_namespace("Mathf", "mod")),
        binary_function("m", "f32", BinaryOperator::Rem, "f32"),
    ]);
    let value = return_value(&module, body_statements(&module, "test/m")[0]);
    assert!(matches!(
        module.node(value),
        ExprNode::CallImport { target, .. } if target == "test/Mathf.mod"
    ));
}

#[test]
fn integer_rem_stays_an_ir_op() {
    let (module, _) = compile(vec![binary_function(
        "m",
        "u32",
        BinaryOperator::Rem,
        "u32",
    )]);
    assert_eq!(returned_binary_op(&module, "test/m"), BinaryOp::RemUI32);
}

// ============================================================================
// Short-circuit logic
// ============================================================================

#[test]
fn logical_and_reuses_a_pure_left_operand() {
    let (module, _) = compile(vec![binary_function(
        "and",
        "i32",
        BinaryOperator::LogicalAnd,
        "i32",
    )]);
    let function = module.get_function("test/and").unwrap();
    assert!(function.locals.is_empty(), "a pure lhs needs no temp");
    let value = return_value(&module, body_statements(&module, "test/and")[0]);
    let ExprNode::If {
        condition,
        if_true,
        if_false: Some(if_false),
        ty,
    } = module.node(value)
    else {
        panic!("expected the short-circuit if");
    };
    assert_eq!(*ty, NativeType::I32);
    // if (x) then y else x
    assert!(matches!(module.node(*condition), ExprNode::GetLocal { index: 0, .. }));
    assert!(matches!(module.node(*if_true), ExprNode::GetLocal { index: 1, .. }));
    assert!(matches!(module.node(*if_false), ExprNode::GetLocal { index: 0, .. }));
}

#[test]
fn logical_or_with_an_impure_left_operand_tees_into_a_temp() {
    // (x + 1) || y: the lhs must evaluate once.
    let (module, _) = compile(vec![declaration_statement(function_declaration(
        "or",
        vec![parameter("x", "i32"), parameter("y", "i32")],
        Some("i32"),
        vec![ret(Expression::binary(
            BinaryOperator::LogicalOr,
            Expression::binary(BinaryOperator::Add, ident("x"), int(1)),
            ident("y"),
        ))],
    ))]);
    let function = module.get_function("test/or").unwrap();
    assert_eq!(function.locals.len(), 1, "the lhs round-trips via a temp");
    let value = return_value(&module, body_statements(&module, "test/or")[0]);
    let ExprNode::If {
        condition, if_true, ..
    } = module.node(value)
    else {
        panic!("expected the short-circuit if");
    };
    assert!(matches!(module.node(*condition), ExprNode::TeeLocal { .. }));
    assert!(matches!(module.node(*if_true), ExprNode::GetLocal { .. }));
}

// ============================================================================
// Unary operators
// ============================================================================

#[test]
fn negated_literals_fold_to_constants() {
    let (module, _) = compile(vec![declaration_statement(function_declaration(
        "neg",
        Vec::new(),
        Some("i32"),
        vec![ret(Expression::new(
            ExpressionKind::Unary {
                op: UnaryOperator::Minus,
                operand: Box::new(int(5)),
            },
            loc(),
        ))],
    ))]);
    let value = return_value(&module, body_statements(&module, "test/neg")[0]);
    assert_eq!(module.node(value), &ExprNode::Const(Literal::I32(-5)));
}

#[test]
fn bitwise_not_lowers_to_xor_minus_one() {
    let (module, _) = compile(vec![declaration_statement(function_declaration(
        "not",
        vec![parameter("x", "i64")],
        Some("i64"),
        vec![ret(Expression::new(
            ExpressionKind::Unary {
                op: UnaryOperator::BitNot,
                operand: Box::new(ident("x")),
            },
            loc(),
        ))],
    ))]);
    let value = return_value(&module, body_statements(&module, "test/not")[0]);
    let ExprNode::Binary {
        op: BinaryOp::XorI64,
        right,
        ..
    } = module.node(value)
    else {
        panic!("expected xor with -1");
    };
    assert_eq!(module.node(*right), &ExprNode::Const(Literal::I64(-1)));
}

#[test]
fn prefix_increment_behaves_like_compound_addition() {
    // function f(x: i32): i32 { return ++x }
    let (module, _) = compile(vec![declaration_statement(function_declaration(
        "f",
        vec![parameter("x", "i32")],
        Some("i32"),
        vec![ret(Expression::new(
            ExpressionKind::Unary {
                op: UnaryOperator::PrefixInc,
                operand: Box::new(ident("x")),
            },
            loc(),
        ))],
    ))]);
    let value = return_value(&module, body_statements(&module, "test/f")[0]);
    let ExprNode::TeeLocal { index: 0, value, .. } = module.node(value) else {
        panic!("expected a tee of the updated value");
    };
    assert!(matches!(
        module.node(*value),
        ExprNode::Binary {
            op: BinaryOp::AddI32,
            ..
        }
    ));
}

#[test]
fn postfix_increment_returns_the_old_value_through_a_temp() {
    let (module, _) = compile(vec![declaration_statement(function_declaration(
        "f",
        vec![parameter("x", "i32")],
        Some("i32"),
        vec![ret(Expression::new(
            ExpressionKind::UnaryPostfix {
                op: PostfixOperator::Inc,
                operand: Box::new(ident("x")),
            },
            loc(),
        ))],
    ))]);
    let function = module.get_function("test/f").unwrap();
    assert_eq!(function.locals.len(), 1);
    let value = return_value(&module, body_statements(&module, "test/f")[0]);
    let ExprNode::Block { children, ty, .. } = module.node(value) else {
        panic!("expected the postfix block");
    };
    assert_eq!(*ty, NativeType::I32);
    assert_eq!(children.len(), 3); // save old, store new, read old
    assert!(matches!(module.node(children[0]), ExprNode::SetLocal { .. }));
    assert!(matches!(module.node(children[1]), ExprNode::SetLocal { index: 0, .. }));
    assert!(matches!(module.node(children[2]), ExprNode::GetLocal { .. }));
}

#[test]
fn postfix_in_statement_position_skips_the_temp() {
    let (module, _) = compile(vec![declaration_statement(function_declaration(
        "f",
        vec![parameter("x", "i32")],
        None,
        vec![expr_statement(Expression::new(
            ExpressionKind::UnaryPostfix {
                op: PostfixOperator::Inc,
                operand: Box::new(ident("x")),
            },
            loc(),
        ))],
    ))]);
    let function = module.get_function("test/f").unwrap();
    assert!(function.locals.is_empty());
    let statements = body_statements(&module, "test/f");
    assert!(matches!(
        module.node(statements[0]),
        ExprNode::SetLocal { index: 0, .. }
    ));
}

// ============================================================================
// Ternary and comma
// ============================================================================

#[test]
fn ternary_arms_meet_at_the_contextual_type() {
    let (module, _) = compile(vec![declaration_statement(function_declaration(
        "pick",
        vec![parameter("c", "bool")],
        Some("f64"),
        vec![ret(Expression::new(
            ExpressionKind::Ternary {
                condition: Box::new(ident("c")),
                if_then: Box::new(int(1)),
                if_else: Box::new(Expression::float(2.5, loc())),
            },
            loc(),
        ))],
    ))]);
    let value = return_value(&module, body_statements(&module, "test/pick")[0]);
    let ExprNode::If { if_true, if_false: Some(if_false), ty, .. } = module.node(value)
    else {
        panic!("expected the ternary if");
    };
    assert_eq!(*ty, NativeType::F64);
    assert_eq!(module.node(*if_true), &ExprNode::Const(Literal::F64(1.0)));
    assert_eq!(module.node(*if_false), &ExprNode::Const(Literal::F64(2.5)));
}

#[test]
fn comma_expressions_drop_all_but_the_last_operand() {
    let (module, _) = compile(vec![declaration_statement(function_declaration(
        "seq",
        vec![parameter("x", "i32")],
        Some("i32"),
        vec![ret(Expression::new(
            ExpressionKind::Comma(vec![
                Expression::new(
                    ExpressionKind::Assignment {
                        op: AssignmentOperator::Assign,
                        target: Box::new(ident("x")),
                        value: Box::new(int(1)),
                    },
                    loc(),
                ),
                ident("x"),
            ]),
            loc(),
        ))],
    ))]);
    let value = return_value(&module, body_statements(&module, "test/seq")[0]);
    let ExprNode::Block { children, ty, .. } = module.node(value) else {
        panic!("expected the comma block");
    };
    assert_eq!(*ty, NativeType::I32);
    assert!(matches!(module.node(children[0]), ExprNode::SetLocal { .. }));
    assert!(matches!(module.node(children[1]), ExprNode::GetLocal { .. }));
}
