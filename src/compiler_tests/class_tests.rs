//! Class lowering tests: field access, operator overloads, accessors,
//! constructors and allocation.

use crate::compiler::ast::*;
use crate::compiler::wir::nodes::{BinaryOp, ExprNode, Literal, UnaryOp};
use crate::compiler_tests::test_helpers::*;

fn field(name: &str, ty: &str) -> ClassMember {
    ClassMember {
        name: name.to_string(),
        kind: ClassMemberKind::Field {
            type_node: Some(type_node(ty)),
            initializer: None,
        },
        modifiers: Vec::new(),
        decorators: Vec::new(),
        location: loc(),
    }
}

fn method(
    name: &str,
    parameters: Vec<ParameterNode>,
    return_type: Option<&str>,
    body: Vec<Statement>,
) -> ClassMember {
    ClassMember {
        name: name.to_string(),
        kind: ClassMemberKind::Method(FunctionDeclaration {
            type_parameters: Vec::new(),
            parameters,
            return_type: return_type.map(type_node),
            body: Some(FunctionBody::Statements(body)),
        }),
        modifiers: Vec::new(),
        decorators: Vec::new(),
        location: loc(),
    }
}

fn constructor(parameters: Vec<ParameterNode>, body: Vec<Statement>) -> ClassMember {
    ClassMember {
        name: "constructor".to_string(),
        kind: ClassMemberKind::Constructor(FunctionDeclaration {
            type_parameters: Vec::new(),
            parameters,
            return_type: None,
            body: Some(FunctionBody::Statements(body)),
        }),
        modifiers: Vec::new(),
        decorators: Vec::new(),
        location: loc(),
    }
}

fn class_declaration(name: &str, members: Vec<ClassMember>) -> Declaration {
    Declaration {
        name: name.to_string(),
        kind: DeclarationKind::Class(ClassDeclaration {
            type_parameters: Vec::new(),
            extends: None,
            members,
        }),
        modifiers: Vec::new(),
        decorators: Vec::new(),
        location: loc(),
    }
}

fn point_class() -> Declaration {
    class_declaration("Point", vec![field("x", "i32"), field("y", "i32")])
}

// ============================================================================
// Fields
// ============================================================================

#[test]
fn field_reads_load_at_their_offsets() {
    let (module, _) = compile(vec![
        declaration_statement(point_class()),
        declaration_statement(function_declaration(
            "gety",
            vec![parameter("p", "Point")],
            Some("i32"),
            vec![ret(Expression::property_access(ident("p"), "y"))],
        )),
    ]);
    let statements = body_statements(&module, "test/gety");
    let value = return_value(&module, statements[0]);
    let ExprNode::Load {
        bytes,
        offset,
        ptr,
        ..
    } = module.node(value)
    else {
        panic!("expected a field load, got {:?}", module.node(value));
    };
    assert_eq!(*bytes, 4);
    assert_eq!(*offset, 4, "y sits after the 4-byte x");
    assert!(matches!(module.node(*ptr), ExprNode::GetLocal { index: 0, .. }));
}

#[test]
fn field_writes_store_at_their_offsets() {
    let (module, _) = compile(vec![
        declaration_statement(point_class()),
        declaration_statement(function_declaration(
            "sety",
            vec![parameter("p", "Point")],
            None,
            vec![expr_statement(Expression::new(
                ExpressionKind::Assignment {
                    op: AssignmentOperator::Assign,
                    target: Box::new(Expression::property_access(ident("p"), "y")),
                    value: Box::new(int(5)),
                },
                loc(),
            ))],
        )),
    ]);
    let statements = body_statements(&module, "test/sety");
    let ExprNode::Store { offset, value, .. } = module.node(statements[0]) else {
        panic!("expected a field store");
    };
    assert_eq!(*offset, 4);
    assert_eq!(module.node(*value), &ExprNode::Const(Literal::I32(5)));
}

#[test]
fn bool_field_stores_rewrap_the_value() {
    let (module, _) = compile(vec![
        declaration_statement(class_declaration("Flag", vec![field("b", "bool")])),
        declaration_statement(function_declaration(
            "set",
            vec![parameter("f", "Flag"), parameter("v", "bool")],
            None,
            vec![expr_statement(Expression::new(
                ExpressionKind::Assignment {
                    op: AssignmentOperator::Assign,
                    target: Box::new(Expression::property_access(ident("f"), "b")),
                    value: Box::new(ident("v")),
                },
                loc(),
            ))],
        )),
    ]);
    let statements = body_statements(&module, "test/set");
    let ExprNode::Store { value, .. } = module.node(statements[0]) else {
        panic!("expected the field store");
    };
    // v may hold garbage bits; the store masks with 1.
    let ExprNode::Binary {
        op: BinaryOp::AndI32,
        right,
        ..
    } = module.node(*value)
    else {
        panic!("expected the bool re-wrap, got {:?}", module.node(*value));
    };
    assert_eq!(module.node(*right), &ExprNode::Const(Literal::I32(1)));
}

#[test]
fn readonly_fields_reject_assignment_outside_their_constructor() {
    let mut class = point_class();
    if let DeclarationKind::Class(declaration) = &mut class.kind {
        declaration.members[0].modifiers.push(Modifier::Readonly);
    }
    let (_, program) = compile_expecting_errors(vec![
        declaration_statement(class),
        declaration_statement(function_declaration(
            "mutate",
            vec![parameter("p", "Point")],
            None,
            vec![expr_statement(Expression::new(
                ExpressionKind::Assignment {
                    op: AssignmentOperator::Assign,
                    target: Box::new(Expression::property_access(ident("p"), "x")),
                    value: Box::new(int(1)),
                },
                loc(),
            ))],
        )),
    ]);
    assert!(
        program
            .messages
            .errors
            .iter()
            .any(|e| e.msg.contains("read-only")),
        "expected the readonly diagnostic"
    );
}

// ============================================================================
// Operator overloads
// ============================================================================

#[test]
fn a_binary_operator_overload_dispatches_to_the_method() {
    // class V { v: i32; @operator("+") add(other: V): V { return other } }
    let mut add = method(
        "add",
        vec![parameter("other", "V")],
        Some("V"),
        vec![ret(ident("other"))],
    );
    add.decorators.push(Decorator {
        name: "operator".to_string(),
        arguments: vec![Expression::string("+", loc())],
        location: loc(),
    });
    let (module, _) = compile(vec![
        declaration_statement(class_declaration("V", vec![field("v", "i32"), add])),
        declaration_statement(function_declaration(
            "combine",
            vec![parameter("x", "V"), parameter("y", "V")],
            Some("V"),
            vec![ret(Expression::binary(
                BinaryOperator::Add,
                ident("x"),
                ident("y"),
            ))],
        )),
    ]);
    let statements = body_statements(&module, "test/combine");
    let value = return_value(&module, statements[0]);
    let ExprNode::Call { target, operands, .. } = module.node(value) else {
        panic!("expected the overload call, got {:?}", module.node(value));
    };
    assert_eq!(target, "test/V#add");
    assert_eq!(operands.len(), 2, "this plus the right operand");
    assert!(matches!(module.node(operands[0]), ExprNode::GetLocal { index: 0, .. }));
    assert!(matches!(module.node(operands[1]), ExprNode::GetLocal { index: 1, .. }));
}

#[test]
fn references_keep_pointer_equality_without_an_overload() {
    let (module, _) = compile(vec![
        declaration_statement(point_class()),
        declaration_statement(function_declaration(
            "same",
            vec![parameter("a", "Point"), parameter("b", "Point")],
            Some("bool"),
            vec![ret(Expression::binary(BinaryOperator::Eq, ident("a"), ident("b")))],
        )),
    ]);
    let statements = body_statements(&module, "test/same");
    let value = return_value(&module, statements[0]);
    assert!(matches!(
        module.node(value),
        ExprNode::Binary {
            op: BinaryOp::EqI32,
            ..
        }
    ));
}

#[test]
fn an_arithmetic_operator_on_references_without_an_overload_is_an_error() {
    let (_, program) = compile_expecting_errors(vec![
        declaration_statement(point_class()),
        declaration_statement(function_declaration(
            "bad",
            vec![parameter("a", "Point"), parameter("b", "Point")],
            Some("Point"),
            vec![ret(Expression::binary(BinaryOperator::Mul, ident("a"), ident("b")))],
        )),
    ]);
    assert!(
        program
            .messages
            .errors
            .iter()
            .any(|e| e.msg.contains("not defined")),
        "expected the missing-overload diagnostic"
    );
}

#[test]
fn indexed_access_dispatches_to_the_index_overload() {
    let mut getter = method(
        "get",
        vec![parameter("i", "i32")],
        Some("i32"),
        vec![ret(ident("i"))],
    );
    getter.decorators.push(Decorator {
        name: "operator".to_string(),
        arguments: vec![Expression::string("[]", loc())],
        location: loc(),
    });
    let (module, _) = compile(vec![
        declaration_statement(class_declaration("Arr", vec![field("n", "i32"), getter])),
        declaration_statement(function_declaration(
            "at",
            vec![parameter("a", "Arr")],
            Some("i32"),
            vec![ret(Expression::new(
                ExpressionKind::ElementAccess {
                    object: Box::new(ident("a")),
                    index: Box::new(int(3)),
                },
                loc(),
            ))],
        )),
    ]);
    let statements = body_statements(&module, "test/at");
    let value = return_value(&module, statements[0]);
    assert!(matches!(
        module.node(value),
        ExprNode::Call { target, .. } if target == "test/Arr#get"
    ));
}

// ============================================================================
// Methods, accessors, instanceof
// ============================================================================

#[test]
fn instance_methods_receive_this_as_the_first_operand() {
    let counter = class_declaration(
        "Cnt",
        vec![
            field("n", "i32"),
            method(
                "value",
                Vec::new(),
                Some("i32"),
                vec![ret(Expression::property_access(
                    Expression::new(ExpressionKind::This, loc()),
                    "n",
                ))],
            ),
        ],
    );
    let (module, _) = compile(vec![
        declaration_statement(counter),
        declaration_statement(function_declaration(
            "read",
            vec![parameter("c", "Cnt")],
            Some("i32"),
            vec![ret(Expression::call(
                Expression::property_access(ident("c"), "value"),
                Vec::new(),
            ))],
        )),
    ]);
    let statements = body_statements(&module, "test/read");
    let value = return_value(&module, statements[0]);
    let ExprNode::Call { target, operands, .. } = module.node(value) else {
        panic!("expected the method call");
    };
    assert_eq!(target, "test/Cnt#value");
    assert_eq!(operands.len(), 1);
    // Inside the method, `this.n` loads through local 0.
    let method_statements = body_statements(&module, "test/Cnt#value");
    let loaded = return_value(&module, method_statements[0]);
    let ExprNode::Load { ptr, .. } = module.node(loaded) else {
        panic!("expected the field load through this");
    };
    assert!(matches!(module.node(*ptr), ExprNode::GetLocal { index: 0, .. }));
}

#[test]
fn property_reads_and_writes_route_through_accessors() {
    let type_box = class_declaration(
        "Box",
        vec![
            ClassMember {
                name: "v".to_string(),
                kind: ClassMemberKind::Getter(FunctionDeclaration {
                    type_parameters: Vec::new(),
                    parameters: Vec::new(),
                    return_type: Some(type_node("i32")),
                    body: Some(FunctionBody::Statements(vec![ret(int(1))])),
                }),
                modifiers: Vec::new(),
                decorators: Vec::new(),
                location: loc(),
            },
            ClassMember {
                name: "v".to_string(),
                kind: ClassMemberKind::Setter(FunctionDeclaration {
                    type_parameters: Vec::new(),
                    parameters: vec![parameter("x", "i32")],
                    return_type: None,
                    body: Some(FunctionBody::Statements(Vec::new())),
                }),
                modifiers: Vec::new(),
                decorators: Vec::new(),
                location: loc(),
            },
        ],
    );
    let (module, _) = compile(vec![
        declaration_statement(type_box),
        declaration_statement(function_declaration(
            "read",
            vec![parameter("b", "Box")],
            Some("i32"),
            vec![ret(Expression::property_access(ident("b"), "v"))],
        )),
        declaration_statement(function_declaration(
            "write",
            vec![parameter("b", "Box")],
            None,
            vec![expr_statement(Expression::new(
                ExpressionKind::Assignment {
                    op: AssignmentOperator::Assign,
                    target: Box::new(Expression::property_access(ident("b"), "v")),
                    value: Box::new(int(2)),
                },
                loc(),
            ))],
        )),
    ]);
    let read = return_value(&module, body_statements(&module, "test/read")[0]);
    assert!(matches!(
        module.node(read),
        ExprNode::Call { target, .. } if target == "test/Box#get:v"
    ));
    let write = body_statements(&module, "test/write")[0];
    assert!(matches!(
        module.node(write),
        ExprNode::Call { target, .. } if target == "test/Box#set:v"
    ));
}

#[test]
fn instanceof_decides_at_compile_time() {
    let (module, _) = compile(vec![
        declaration_statement(point_class()),
        declaration_statement(class_declaration("Other", vec![field("z", "i32")])),
        declaration_statement(function_declaration(
            "yes",
            vec![parameter("p", "Point")],
            Some("bool"),
            vec![ret(Expression::new(
                ExpressionKind::InstanceOf {
                    operand: Box::new(ident("p")),
                    type_node: type_node("Point"),
                },
                loc(),
            ))],
        )),
        declaration_statement(function_declaration(
            "no",
            vec![parameter("p", "Point")],
            Some("bool"),
            vec![ret(Expression::new(
                ExpressionKind::InstanceOf {
                    operand: Box::new(ident("p")),
                    type_node: type_node("Other"),
                },
                loc(),
            ))],
        )),
    ]);
    for (name, expected) in [("test/yes", 1), ("test/no", 0)] {
        let value = return_value(&module, body_statements(&module, name)[0]);
        let ExprNode::Block { children, .. } = module.node(value) else {
            panic!("instanceof keeps the operand's effects in a block");
        };
        assert_eq!(
            module.node(children[1]),
            &ExprNode::Const(Literal::I32(expected))
        );
    }
}

// ============================================================================
// Construction
// ============================================================================

fn allocator() -> Declaration {
    ambient_function("allocate", vec![parameter("size", "usize")], Some("usize"))
}

#[test]
fn new_with_a_constructor_calls_it_with_a_null_this() {
    let class = class_declaration(
        "C",
        vec![
            field("x", "i32"),
            constructor(
                vec![parameter("v", "i32")],
                vec![expr_statement(Expression::new(
                    ExpressionKind::Assignment {
                        op: AssignmentOperator::Assign,
                        target: Box::new(Expression::property_access(
                            Expression::new(ExpressionKind::This, loc()),
                            "x",
                        )),
                        value: Box::new(ident("v")),
                    },
                    loc(),
                ))],
            ),
        ],
    );
    let (module, _) = compile(vec![
        declaration_statement(allocator()),
        declaration_statement(class),
        declaration_statement(function_declaration(
            "make",
            Vec::new(),
            Some("C"),
            vec![ret(Expression::new(
                ExpressionKind::New {
                    callee: Box::new(ident("C")),
                    type_arguments: Vec::new(),
                    arguments: vec![int(5)],
                },
                loc(),
            ))],
        )),
    ]);
    let value = return_value(&module, body_statements(&module, "test/make")[0]);
    let ExprNode::Call { target, operands, .. } = module.node(value) else {
        panic!("expected the constructor call");
    };
    assert_eq!(target, "test/C#constructor");
    assert_eq!(module.node(operands[0]), &ExprNode::Const(Literal::I32(0)));
    assert_eq!(module.node(operands[1]), &ExprNode::Const(Literal::I32(5)));
}

#[test]
fn a_constructor_conditionally_allocates_on_first_this_use() {
    let class = class_declaration(
        "C",
        vec![
            field("x", "i32"),
            constructor(
                vec![parameter("v", "i32")],
                vec![expr_statement(Expression::new(
                    ExpressionKind::Assignment {
                        op: AssignmentOperator::Assign,
                        target: Box::new(Expression::property_access(
                            Expression::new(ExpressionKind::This, loc()),
                            "x",
                        )),
                        value: Box::new(ident("v")),
                    },
                    loc(),
                ))],
            ),
        ],
    );
    let (module, _) = compile(vec![
        declaration_statement(allocator()),
        declaration_statement(class),
        declaration_statement(function_declaration(
            "make",
            Vec::new(),
            Some("C"),
            vec![ret(Expression::new(
                ExpressionKind::New {
                    callee: Box::new(ident("C")),
                    type_arguments: Vec::new(),
                    arguments: vec![int(5)],
                },
                loc(),
            ))],
        )),
    ]);
    let statements = body_statements(&module, "test/C#constructor");
    // The first `this` use tees the conditional allocation into local 0.
    let ExprNode::Store { ptr, .. } = module.node(statements[0]) else {
        panic!("expected the field store");
    };
    let ExprNode::TeeLocal { index: 0, value, .. } = module.node(*ptr) else {
        panic!("expected this to tee the allocation, got {:?}", module.node(*ptr));
    };
    let ExprNode::If {
        condition,
        if_false: Some(if_false),
        ..
    } = module.node(*value)
    else {
        panic!("expected the conditional allocate");
    };
    assert!(matches!(
        module.node(*condition),
        ExprNode::Unary {
            op: UnaryOp::EqzI32,
            ..
        }
    ));
    assert!(matches!(
        module.node(*if_false),
        ExprNode::GetLocal { index: 0, .. }
    ));
    // The fall-through epilogue returns this.
    assert!(matches!(
        module.node(*statements.last().unwrap()),
        ExprNode::GetLocal { index: 0, .. }
    ));
}

#[test]
fn new_without_a_constructor_allocates_and_zeroes_fields() {
    let (module, _) = compile(vec![
        declaration_statement(allocator()),
        declaration_statement(point_class()),
        declaration_statement(function_declaration(
            "make",
            Vec::new(),
            Some("Point"),
            vec![ret(Expression::new(
                ExpressionKind::New {
                    callee: Box::new(ident("Point")),
                    type_arguments: Vec::new(),
                    arguments: Vec::new(),
                },
                loc(),
            ))],
        )),
    ]);
    let value = return_value(&module, body_statements(&module, "test/make")[0]);
    let ExprNode::Block { children, .. } = module.node(value) else {
        panic!("expected the allocation block");
    };
    // set temp = allocate(8); two zero stores; get temp
    let ExprNode::SetLocal { value: alloc, .. } = module.node(children[0]) else {
        panic!("expected the allocation into a temp");
    };
    let ExprNode::CallImport { target, operands, .. } = module.node(*alloc) else {
        panic!("expected the allocate import call, got {:?}", module.node(*alloc));
    };
    assert_eq!(target, "test/allocate");
    assert_eq!(module.node(operands[0]), &ExprNode::Const(Literal::I32(8)));
    assert_eq!(children.len(), 4, "set, two field stores, result read");
    assert!(matches!(module.node(children[1]), ExprNode::Store { .. }));
    assert!(matches!(module.node(children[2]), ExprNode::Store { .. }));
}

#[test]
fn a_derived_constructor_pre_allocates_through_super() {
    let base = class_declaration(
        "A",
        vec![
            field("x", "i32"),
            constructor(
                Vec::new(),
                vec![expr_statement(Expression::new(
                    ExpressionKind::Assignment {
                        op: AssignmentOperator::Assign,
                        target: Box::new(Expression::property_access(
                            Expression::new(ExpressionKind::This, loc()),
                            "x",
                        )),
                        value: Box::new(int(1)),
                    },
                    loc(),
                ))],
            ),
        ],
    );
    let derived = Declaration {
        name: "B".to_string(),
        kind: DeclarationKind::Class(ClassDeclaration {
            type_parameters: Vec::new(),
            extends: Some(type_node("A")),
            members: vec![constructor(
                Vec::new(),
                vec![expr_statement(Expression::call(
                    Expression::new(ExpressionKind::Super, loc()),
                    Vec::new(),
                ))],
            )],
        }),
        modifiers: Vec::new(),
        decorators: Vec::new(),
        location: loc(),
    };
    let (module, _) = compile(vec![
        declaration_statement(allocator()),
        declaration_statement(base),
        declaration_statement(derived),
        declaration_statement(function_declaration(
            "make",
            Vec::new(),
            Some("B"),
            vec![ret(Expression::new(
                ExpressionKind::New {
                    callee: Box::new(ident("B")),
                    type_arguments: Vec::new(),
                    arguments: Vec::new(),
                },
                loc(),
            ))],
        )),
    ]);
    let statements = body_statements(&module, "test/B#constructor");
    // super() stores the base constructor's result back into this.
    let ExprNode::SetLocal { index: 0, value } = module.node(statements[0]) else {
        panic!("expected super() to update this");
    };
    assert!(matches!(
        module.node(*value),
        ExprNode::Call { target, .. } if target == "test/A#constructor"
    ));
    // Having allocated, the epilogue just returns this.
    assert!(matches!(
        module.node(statements[1]),
        ExprNode::GetLocal { index: 0, .. }
    ));
}

#[test]
fn exported_classes_synthesise_field_accessors() {
    let (module, _) = compile(vec![declaration_statement(exported(point_class()))]);
    assert!(module.has_export("Point#get:x"));
    assert!(module.has_export("Point#set:x"));
    assert!(module.has_export("Point#get:y"));
    let getter = module.get_function("Point#get:x").unwrap();
    let ExprNode::Load { offset: 0, .. } = module.node(getter.body) else {
        panic!("the synthesised getter is a direct load");
    };
}
