//! Call-site tests: optional-argument routing, trampolines, the
//! function table, indirect calls and inlining.

use crate::compiler::ast::*;
use crate::compiler::wir::nodes::{ExprNode, Literal, NativeType};
use crate::compiler_tests::test_helpers::*;

fn call_statement(name: &str, arguments: Vec<Expression>) -> Statement {
    expr_statement(Expression::call(ident(name), arguments))
}

// ============================================================================
// Optional arguments
// ============================================================================

#[test]
fn supplying_all_operands_calls_the_original_directly() {
    // function f(a: i32, b: i32 = 2): i32 { return a } ; f(5, 7)
    let (module, _) = compile(vec![
        declaration_statement(function_declaration(
            "f",
            vec![
                parameter("a", "i32"),
                optional_parameter("b", "i32", int(2)),
            ],
            Some("i32"),
            vec![ret(ident("a"))],
        )),
        declaration_statement(function_declaration(
            "caller",
            Vec::new(),
            None,
            vec![call_statement("f", vec![int(5), int(7)])],
        )),
    ]);
    let statements = body_statements(&module, "test/caller");
    let ExprNode::Drop { value } = module.node(statements[0]) else {
        panic!("a discarded call is dropped");
    };
    let ExprNode::Call { target, operands, .. } = module.node(*value) else {
        panic!("expected a direct call, got {:?}", module.node(*value));
    };
    assert_eq!(target, "test/f");
    assert_eq!(operands.len(), 2);
    assert!(module.get_function("test/f|trampoline").is_none());
}

#[test]
fn literal_initializers_inline_at_the_call_site() {
    // f(5) with b: i32 = 2 becomes call(f, 5, 2); no trampoline.
    let (module, _) = compile(vec![
        declaration_statement(function_declaration(
            "f",
            vec![
                parameter("a", "i32"),
                optional_parameter("b", "i32", int(2)),
            ],
            Some("i32"),
            vec![ret(ident("a"))],
        )),
        declaration_statement(function_declaration(
            "caller",
            Vec::new(),
            None,
            vec![call_statement("f", vec![int(5)])],
        )),
    ]);
    let statements = body_statements(&module, "test/caller");
    let ExprNode::Drop { value } = module.node(statements[0]) else {
        panic!("a discarded call is dropped");
    };
    let ExprNode::Call { target, operands, .. } = module.node(*value) else {
        panic!("expected a direct call, got {:?}", module.node(*value));
    };
    assert_eq!(target, "test/f");
    assert_eq!(module.node(operands[0]), &ExprNode::Const(Literal::I32(5)));
    assert_eq!(module.node(operands[1]), &ExprNode::Const(Literal::I32(2)));
    assert!(module.get_function("test/f|trampoline").is_none());
}

fn trampoline_requiring_source() -> Vec<Statement> {
    // The initializer is a call, so the caller cannot inline it.
    vec![
        declaration_statement(function_declaration(
            "seed",
            Vec::new(),
            Some("i32"),
            vec![ret(int(2))],
        )),
        declaration_statement(function_declaration(
            "f",
            vec![
                parameter("a", "i32"),
                optional_parameter("b", "i32", Expression::call(ident("seed"), Vec::new())),
            ],
            Some("i32"),
            vec![ret(ident("a"))],
        )),
        declaration_statement(function_declaration(
            "caller",
            Vec::new(),
            None,
            vec![call_statement("f", vec![int(5)])],
        )),
    ]
}

#[test]
fn non_constant_initializers_route_through_the_trampoline() {
    let (module, _) = compile(trampoline_requiring_source());
    let statements = body_statements(&module, "test/caller");
    let ExprNode::Drop { value } = module.node(statements[0]) else {
        panic!("a discarded call is dropped");
    };
    // block { ~argc = 1; call(f|trampoline, 5, 0) }
    let ExprNode::Block { children, .. } = module.node(*value) else {
        panic!("expected the ~argc block, got {:?}", module.node(*value));
    };
    let ExprNode::SetGlobal { name, value: count } = module.node(children[0]) else {
        panic!("expected ~argc assignment");
    };
    assert_eq!(name, "~argc");
    assert_eq!(module.node(*count), &ExprNode::Const(Literal::I32(1)));
    let ExprNode::Call { target, operands, .. } = module.node(children[1]) else {
        panic!("expected the trampoline call");
    };
    assert_eq!(target, "test/f|trampoline");
    assert_eq!(module.node(operands[0]), &ExprNode::Const(Literal::I32(5)));
    // The omitted operand pads with zero.
    assert_eq!(module.node(operands[1]), &ExprNode::Const(Literal::I32(0)));
}

#[test]
fn the_trampoline_switches_over_argc_and_forwards() {
    let (module, _) = compile(trampoline_requiring_source());
    let trampoline = module
        .get_function("test/f|trampoline")
        .expect("trampoline should be generated");
    assert_eq!(trampoline.params, vec![NativeType::I32, NativeType::I32]);
    // Outer block: [initializer chain, forwarded call].
    let ExprNode::Block { children, .. } = module.node(trampoline.body) else {
        panic!("trampoline body should be a block");
    };
    let ExprNode::Call { target, operands, .. } = module.node(children[1]) else {
        panic!("trampoline should forward to the original");
    };
    assert_eq!(target, "test/f");
    assert_eq!(operands.len(), 2);
    // The chain bottoms out in a br_table on ~argc - minArgs.
    let mut cursor = children[0];
    let switch = loop {
        match module.node(cursor) {
            ExprNode::Block { children, .. } => cursor = children[0],
            ExprNode::Switch { .. } => break cursor,
            other => panic!("unexpected node in trampoline chain: {:?}", other),
        }
    };
    let ExprNode::Switch {
        labels, condition, ..
    } = module.node(switch)
    else {
        unreachable!()
    };
    assert_eq!(labels.len(), 2); // zero or one optional supplied
    assert!(matches!(
        module.node(*condition),
        ExprNode::Binary { .. } // ~argc - minArgs
    ));
    // The ~setargc helper is exported alongside.
    assert!(module.has_export("~setargc"));
    assert!(module.has_global("~argc"));
}

// ============================================================================
// Function table and indirect calls
// ============================================================================

fn function_reference_source() -> Vec<Statement> {
    vec![
        declaration_statement(function_declaration(
            "inc",
            vec![parameter("x", "i32")],
            Some("i32"),
            vec![ret(Expression::binary(BinaryOperator::Add, ident("x"), int(1)))],
        )),
        declaration_statement(function_declaration(
            "caller",
            vec![parameter("v", "i32")],
            Some("i32"),
            vec![
                local_variable("h", None, Some(ident("inc")), vec![Modifier::Let]),
                ret(Expression::call(ident("h"), vec![ident("v")])),
            ],
        )),
    ]
}

#[test]
fn a_function_reference_is_its_table_index() {
    let (module, _) = compile(function_reference_source());
    assert_eq!(module.table, vec!["test/inc".to_string()]);
    let statements = body_statements(&module, "test/caller");
    // let h = inc  =>  local.set h (i32.const 0)
    let ExprNode::SetLocal { value, .. } = module.node(statements[0]) else {
        panic!("expected the local initialisation");
    };
    assert_eq!(module.node(*value), &ExprNode::Const(Literal::I32(0)));
}

#[test]
fn calling_through_a_local_emits_call_indirect_with_argc() {
    let (module, _) = compile(function_reference_source());
    let statements = body_statements(&module, "test/caller");
    let value = return_value(&module, statements[1]);
    let ExprNode::Block { children, .. } = module.node(value) else {
        panic!("expected the ~argc block");
    };
    assert!(matches!(
        module.node(children[0]),
        ExprNode::SetGlobal { name, .. } if name == "~argc"
    ));
    let ExprNode::CallIndirect { operands, .. } = module.node(children[1]) else {
        panic!("expected call_indirect, got {:?}", module.node(children[1]));
    };
    assert_eq!(operands.len(), 1);
}

#[test]
fn table_indexing_is_idempotent() {
    // Referencing the same function twice yields one table slot.
    let (module, _) = compile(vec![
        declaration_statement(function_declaration(
            "inc",
            vec![parameter("x", "i32")],
            Some("i32"),
            vec![ret(ident("x"))],
        )),
        declaration_statement(function_declaration(
            "refs",
            Vec::new(),
            None,
            vec![
                local_variable("a", None, Some(ident("inc")), vec![Modifier::Let]),
                local_variable("b", None, Some(ident("inc")), vec![Modifier::Let]),
            ],
        )),
    ]);
    assert_eq!(module.table.len(), 1);
}

#[test]
fn a_table_slot_for_a_function_with_optionals_names_the_trampoline() {
    let (module, _) = compile(vec![
        declaration_statement(function_declaration(
            "seed",
            Vec::new(),
            Some("i32"),
            vec![ret(int(2))],
        )),
        declaration_statement(function_declaration(
            "opt",
            vec![optional_parameter(
                "a",
                "i32",
                Expression::call(ident("seed"), Vec::new()),
            )],
            Some("i32"),
            vec![ret(ident("a"))],
        )),
        declaration_statement(function_declaration(
            "refs",
            Vec::new(),
            None,
            vec![local_variable(
                "h",
                None,
                Some(ident("opt")),
                vec![Modifier::Let],
            )],
        )),
    ]);
    assert_eq!(module.table, vec!["test/opt|trampoline".to_string()]);
}

// ============================================================================
// Inlining
// ============================================================================

fn inline_decorator() -> Decorator {
    Decorator {
        name: "inline".to_string(),
        arguments: Vec::new(),
        location: loc(),
    }
}

#[test]
fn an_inline_function_expands_in_place() {
    let mut double = function_declaration(
        "double",
        vec![parameter("x", "i32")],
        Some("i32"),
        vec![ret(Expression::binary(
            BinaryOperator::Add,
            ident("x"),
            ident("x"),
        ))],
    );
    double.decorators.push(inline_decorator());
    let (module, _) = compile(vec![
        declaration_statement(double),
        declaration_statement(function_declaration(
            "use",
            vec![parameter("v", "i32")],
            Some("i32"),
            vec![ret(Expression::call(ident("double"), vec![ident("v")]))],
        )),
    ]);
    let statements = body_statements(&module, "test/use");
    let value = return_value(&module, statements[0]);
    let ExprNode::Block {
        label: Some(label),
        children,
        ty,
    } = module.node(value)
    else {
        panic!("expected the inline block, got {:?}", module.node(value));
    };
    assert!(label.ends_with("|inlined.0"), "label was {}", label);
    assert_eq!(*ty, NativeType::I32);
    // The argument was a plain local read, so the parameter aliases it
    // with no copy; the body is just the break with the result value.
    assert_eq!(children.len(), 1);
    let ExprNode::Break { value: Some(result), .. } = module.node(children[0]) else {
        panic!("an inline return is a break to the return label");
    };
    let ExprNode::Binary { left, right, .. } = module.node(*result) else {
        panic!("expected the inlined add");
    };
    // Zero-copy aliasing: both operands read the caller's own local.
    assert!(matches!(module.node(*left), ExprNode::GetLocal { index: 0, .. }));
    assert!(matches!(module.node(*right), ExprNode::GetLocal { index: 0, .. }));
}

#[test]
fn non_local_inline_arguments_go_through_a_temp() {
    let mut double = function_declaration(
        "double",
        vec![parameter("x", "i32")],
        Some("i32"),
        vec![ret(Expression::binary(
            BinaryOperator::Add,
            ident("x"),
            ident("x"),
        ))],
    );
    double.decorators.push(inline_decorator());
    let (module, _) = compile(vec![
        declaration_statement(double),
        declaration_statement(function_declaration(
            "use",
            vec![parameter("v", "i32")],
            Some("i32"),
            vec![ret(Expression::call(
                ident("double"),
                vec![Expression::binary(BinaryOperator::Add, ident("v"), int(1))],
            ))],
        )),
    ]);
    // The argument has effects/shape that cannot alias, so a temp local
    // is introduced and initialised inside the inline block.
    let function = module.get_function("test/use").unwrap();
    assert_eq!(function.locals.len(), 1, "one temp for the argument");
    let statements = body_statements(&module, "test/use");
    let value = return_value(&module, statements[0]);
    let ExprNode::Block { children, .. } = module.node(value) else {
        panic!("expected the inline block");
    };
    assert!(matches!(module.node(children[0]), ExprNode::SetLocal { .. }));
}

#[test]
fn self_inlining_recursion_degrades_with_a_warning() {
    let mut recursive = function_declaration(
        "spin",
        vec![parameter("x", "i32")],
        Some("i32"),
        vec![ret(Expression::call(ident("spin"), vec![ident("x")]))],
    );
    recursive.decorators.push(inline_decorator());
    let (module, program) = compile(vec![declaration_statement(recursive)]);
    assert!(
        program
            .messages
            .warnings
            .iter()
            .any(|w| w.msg.contains("cannot be inlined")),
        "expected the inline-recursion warning"
    );
    // The inner call compiled as a plain direct call.
    assert!(module.get_function("test/spin").is_some());
}

#[test]
fn generic_calls_infer_type_arguments_from_operands() {
    // function pick<T>(a: T, b: T): T { return b } ; pick(1, 2)
    let pick = Declaration {
        name: "pick".to_string(),
        kind: DeclarationKind::Function(FunctionDeclaration {
            type_parameters: vec!["T".to_string()],
            parameters: vec![parameter("a", "T"), parameter("b", "T")],
            return_type: Some(type_node("T")),
            body: Some(FunctionBody::Statements(vec![ret(ident("b"))])),
        }),
        modifiers: Vec::new(),
        decorators: Vec::new(),
        location: loc(),
    };
    let (module, _) = compile(vec![
        declaration_statement(pick),
        declaration_statement(function_declaration(
            "use",
            Vec::new(),
            Some("i32"),
            vec![ret(Expression::call(ident("pick"), vec![int(1), int(2)]))],
        )),
    ]);
    assert!(
        module.get_function("test/pick<i32>").is_some(),
        "expected the inferred i32 instance"
    );
    let statements = body_statements(&module, "test/use");
    let value = return_value(&module, statements[0]);
    assert!(matches!(
        module.node(value),
        ExprNode::Call { target, .. } if target == "test/pick<i32>"
    ));
}
