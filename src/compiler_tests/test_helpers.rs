//! Shared helpers for the codegen tests.
//!
//! Programs are built from AST values directly (there is no parser in
//! this crate) and compiled through the full `Compiler`. The default
//! helper also validates the encoded module with `wasmparser`, so every
//! test doubles as an end-to-end encoding check.

use crate::compiler::ast::*;
use crate::compiler::codegen::{Compiler, CompilerOptions};
use crate::compiler::program::Program;
use crate::compiler::tokens::TextLocation;
use crate::compiler::wir::module::WirModule;
use crate::compiler::wir::nodes::{ExprNode, ExprRef};

pub(crate) fn loc() -> TextLocation {
    TextLocation::new_just_line(1)
}

pub(crate) fn default_options() -> CompilerOptions {
    CompilerOptions {
        no_tree_shaking: true,
        ..CompilerOptions::default()
    }
}

/// Compile a single entry source, assert no errors were reported, and
/// validate the encoded bytes.
pub(crate) fn compile(statements: Vec<Statement>) -> (WirModule, Program) {
    compile_with(statements, default_options())
}

pub(crate) fn compile_with(
    statements: Vec<Statement>,
    options: CompilerOptions,
) -> (WirModule, Program) {
    let mut program = Program::new(vec![Source::entry("test.tr", statements)]);
    let module = Compiler::new(&mut program, options)
        .compile()
        .expect("compilation should not hit internal errors");
    assert!(
        !program.messages.has_errors(),
        "expected a clean compile, got: {:#?}",
        program.messages.errors
    );
    module.validate().expect("encoded module should validate");
    (module, program)
}

/// Compile a program that is expected to produce user-facing errors; no
/// validation is attempted on the (possibly invalid) module.
pub(crate) fn compile_expecting_errors(
    statements: Vec<Statement>,
) -> (WirModule, Program) {
    let mut program = Program::new(vec![Source::entry("test.tr", statements)]);
    let module = Compiler::new(&mut program, default_options())
        .compile()
        .expect("compilation should not hit internal errors");
    assert!(
        program.messages.has_errors(),
        "expected diagnostics, got none"
    );
    (module, program)
}

// ============================================================================
// AST builders
// ============================================================================

pub(crate) fn type_node(name: &str) -> TypeNode {
    TypeNode::plain(name)
}

pub(crate) fn parameter(name: &str, ty: &str) -> ParameterNode {
    ParameterNode {
        name: name.to_string(),
        type_node: type_node(ty),
        initializer: None,
        is_rest: false,
        is_field: false,
        location: loc(),
    }
}

pub(crate) fn optional_parameter(name: &str, ty: &str, initializer: Expression) -> ParameterNode {
    ParameterNode {
        initializer: Some(initializer),
        ..parameter(name, ty)
    }
}

pub(crate) fn function_declaration(
    name: &str,
    parameters: Vec<ParameterNode>,
    return_type: Option<&str>,
    body: Vec<Statement>,
) -> Declaration {
    Declaration {
        name: name.to_string(),
        kind: DeclarationKind::Function(FunctionDeclaration {
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

pub(crate) fn ambient_function(
    name: &str,
    parameters: Vec<ParameterNode>,
    return_type: Option<&str>,
) -> Declaration {
    Declaration {
        name: name.to_string(),
        kind: DeclarationKind::Function(FunctionDeclaration {
            type_parameters: Vec::new(),
            parameters,
            return_type: return_type.map(type_node),
            body: None,
        }),
        modifiers: vec![Modifier::Declare],
        decorators: Vec::new(),
        location: loc(),
    }
}

pub(crate) fn exported(mut declaration: Declaration) -> Declaration {
    declaration.modifiers.push(Modifier::Export);
    declaration
}

pub(crate) fn int(value: i64) -> Expression {
    Expression::integer(value, loc())
}

pub(crate) fn ident(name: &str) -> Expression {
    Expression::identifier(name, loc())
}

pub(crate) fn ret(value: Expression) -> Statement {
    Statement::ret(Some(value), loc())
}

pub(crate) fn expr_statement(expression: Expression) -> Statement {
    Statement::expression(expression)
}

pub(crate) fn declaration_statement(declaration: Declaration) -> Statement {
    Statement::declaration(declaration)
}

pub(crate) fn local_variable(
    name: &str,
    ty: Option<&str>,
    initializer: Option<Expression>,
    modifiers: Vec<Modifier>,
) -> Statement {
    Statement::new(
        StatementKind::Variable(VariableDeclaration {
            declarations: vec![VariableDeclarator {
                name: name.to_string(),
                type_node: ty.map(type_node),
                initializer,
                location: loc(),
            }],
            modifiers,
        }),
        loc(),
    )
}

// ============================================================================
// Module inspection
// ============================================================================

/// The statements of a function's implicit body block.
pub(crate) fn body_statements(module: &WirModule, internal_name: &str) -> Vec<ExprRef> {
    let function = module
        .get_function(internal_name)
        .unwrap_or_else(|| panic!("function '{}' was not compiled", internal_name));
    match module.node(function.body) {
        ExprNode::Block { children, .. } => children.clone(),
        _ => vec![function.body],
    }
}

/// Unwrap a `Return` statement's value.
pub(crate) fn return_value(module: &WirModule, statement: ExprRef) -> ExprRef {
    match module.node(statement) {
        ExprNode::Return { value: Some(value) } => *value,
        other => panic!("expected a return with a value, got {:?}", other),
    }
}
