//! Source-shaped node trees.
//!
//! These are the trees a parser would produce: statements, expressions and
//! declarations with source ranges. The compiler core consumes them after
//! resolution; nothing in this module knows about WASM.
//!
//! There is no parser in this crate, so the types double as the public
//! construction API. The helper constructors at the bottom keep hand-built
//! trees (tests, embedders) readable.

use crate::compiler::tokens::TextLocation;

// ============================================================================
// Type annotations
// ============================================================================

/// A source-level type annotation, e.g. `Map<u32, V> | null`.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeNode {
    pub name: String,
    pub type_arguments: Vec<TypeNode>,
    pub nullable: bool,
    pub location: TextLocation,
}

impl TypeNode {
    pub fn plain(name: impl Into<String>) -> TypeNode {
        TypeNode {
            name: name.into(),
            type_arguments: Vec::new(),
            nullable: false,
            location: TextLocation::default(),
        }
    }

    pub fn with_arguments(name: impl Into<String>, type_arguments: Vec<TypeNode>) -> TypeNode {
        TypeNode {
            name: name.into(),
            type_arguments,
            nullable: false,
            location: TextLocation::default(),
        }
    }
}

// ============================================================================
// Operators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    ShrU,
    LogicalAnd,
    LogicalOr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Plus,
    Minus,
    Not,
    BitNot,
    PrefixInc,
    PrefixDec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostfixOperator {
    Inc,
    Dec,
}

/// `=` and the compound assignment forms. Compound forms lower as the
/// matching binary operator followed by the plain assignment path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentOperator {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    ShrU,
    BitAnd,
    BitOr,
    BitXor,
}

impl AssignmentOperator {
    /// The binary operator a compound assignment applies before storing,
    /// if any.
    pub fn binary_operator(self) -> Option<BinaryOperator> {
        match self {
            AssignmentOperator::Assign => None,
            AssignmentOperator::Add => Some(BinaryOperator::Add),
            AssignmentOperator::Sub => Some(BinaryOperator::Sub),
            AssignmentOperator::Mul => Some(BinaryOperator::Mul),
            AssignmentOperator::Div => Some(BinaryOperator::Div),
            AssignmentOperator::Rem => Some(BinaryOperator::Rem),
            AssignmentOperator::Shl => Some(BinaryOperator::Shl),
            AssignmentOperator::Shr => Some(BinaryOperator::Shr),
            AssignmentOperator::ShrU => Some(BinaryOperator::ShrU),
            AssignmentOperator::BitAnd => Some(BinaryOperator::BitAnd),
            AssignmentOperator::BitOr => Some(BinaryOperator::BitOr),
            AssignmentOperator::BitXor => Some(BinaryOperator::BitXor),
        }
    }
}

// ============================================================================
// Expressions
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub kind: ExpressionKind,
    pub location: TextLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionKind {
    IntegerLiteral(i64),
    FloatLiteral(f64),
    StringLiteral(String),
    ArrayLiteral(Vec<Expression>),
    True,
    False,
    Null,
    This,
    Super,
    Identifier(String),
    Binary {
        op: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Unary {
        op: UnaryOperator,
        operand: Box<Expression>,
    },
    UnaryPostfix {
        op: PostfixOperator,
        operand: Box<Expression>,
    },
    Assignment {
        op: AssignmentOperator,
        target: Box<Expression>,
        value: Box<Expression>,
    },
    Call {
        callee: Box<Expression>,
        type_arguments: Vec<TypeNode>,
        arguments: Vec<Expression>,
    },
    New {
        callee: Box<Expression>,
        type_arguments: Vec<TypeNode>,
        arguments: Vec<Expression>,
    },
    PropertyAccess {
        object: Box<Expression>,
        property: String,
    },
    ElementAccess {
        object: Box<Expression>,
        index: Box<Expression>,
    },
    Ternary {
        condition: Box<Expression>,
        if_then: Box<Expression>,
        if_else: Box<Expression>,
    },
    /// `a, b, c`: all but the last operand are dropped.
    Comma(Vec<Expression>),
    Parenthesized(Box<Expression>),
    /// `expr!`: re-types the operand as non-nullable, emits nothing.
    NonNullAssertion(Box<Expression>),
    /// `expr as T`: explicit conversion.
    As {
        operand: Box<Expression>,
        type_node: TypeNode,
    },
    InstanceOf {
        operand: Box<Expression>,
        type_node: TypeNode,
    },
    /// `void expr`: compile the operand for effect, result is void.
    Void(Box<Expression>),
}

// ============================================================================
// Statements
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub location: TextLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Block(Vec<Statement>),
    Empty,
    Expression(Expression),
    If {
        condition: Expression,
        if_true: Box<Statement>,
        if_false: Option<Box<Statement>>,
    },
    While {
        condition: Expression,
        body: Box<Statement>,
    },
    DoWhile {
        body: Box<Statement>,
        condition: Expression,
    },
    For {
        initializer: Option<Box<Statement>>,
        condition: Option<Expression>,
        incrementor: Option<Expression>,
        body: Box<Statement>,
    },
    Switch {
        condition: Expression,
        cases: Vec<SwitchCase>,
    },
    Return(Option<Expression>),
    Break(Option<String>),
    Continue(Option<String>),
    Throw(Expression),
    Try {
        statements: Vec<Statement>,
        catch_variable: Option<String>,
        catch_statements: Option<Vec<Statement>>,
        finally_statements: Option<Vec<Statement>>,
    },
    Variable(VariableDeclaration),
    Declaration(Declaration),
    /// `import { a, b } from "./path"`: triggers compilation of the
    /// target source before anything that follows.
    Import {
        members: Vec<String>,
        path: String,
    },
}

/// A case inside a `switch`. `label` is `None` for the `default` case.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    pub label: Option<Expression>,
    pub statements: Vec<Statement>,
    pub location: TextLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableDeclaration {
    pub declarations: Vec<VariableDeclarator>,
    pub modifiers: Vec<Modifier>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableDeclarator {
    pub name: String,
    pub type_node: Option<TypeNode>,
    pub initializer: Option<Expression>,
    pub location: TextLocation,
}

// ============================================================================
// Declarations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Export,
    /// `declare`: ambient, implemented by the host.
    Declare,
    Const,
    Let,
    Readonly,
    Private,
    Protected,
    Public,
    Static,
    Abstract,
}

/// A `@name(args)` annotation on a declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct Decorator {
    pub name: String,
    pub arguments: Vec<Expression>,
    pub location: TextLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub name: String,
    pub kind: DeclarationKind,
    pub modifiers: Vec<Modifier>,
    pub decorators: Vec<Decorator>,
    pub location: TextLocation,
}

impl Declaration {
    pub fn has_modifier(&self, modifier: Modifier) -> bool {
        self.modifiers.contains(&modifier)
    }

    pub fn decorator(&self, name: &str) -> Option<&Decorator> {
        self.decorators.iter().find(|d| d.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeclarationKind {
    Function(FunctionDeclaration),
    Class(ClassDeclaration),
    Interface(ClassDeclaration),
    Enum(EnumDeclaration),
    Namespace(Vec<Statement>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FunctionBody {
    /// A braced statement body.
    Statements(Vec<Statement>),
    /// A single-expression arrow body; the expression is the return value.
    Expression(Expression),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterNode {
    pub name: String,
    pub type_node: TypeNode,
    pub initializer: Option<Expression>,
    pub is_rest: bool,
    /// `constructor(public x: i32)`-style parameter that doubles as a
    /// field declaration.
    pub is_field: bool,
    pub location: TextLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDeclaration {
    pub type_parameters: Vec<String>,
    pub parameters: Vec<ParameterNode>,
    pub return_type: Option<TypeNode>,
    pub body: Option<FunctionBody>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumDeclaration {
    pub members: Vec<EnumValueNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumValueNode {
    pub name: String,
    pub initializer: Option<Expression>,
    pub location: TextLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDeclaration {
    pub type_parameters: Vec<String>,
    pub extends: Option<TypeNode>,
    pub members: Vec<ClassMember>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassMember {
    pub name: String,
    pub kind: ClassMemberKind,
    pub modifiers: Vec<Modifier>,
    pub decorators: Vec<Decorator>,
    pub location: TextLocation,
}

impl ClassMember {
    pub fn has_modifier(&self, modifier: Modifier) -> bool {
        self.modifiers.contains(&modifier)
    }

    pub fn decorator(&self, name: &str) -> Option<&Decorator> {
        self.decorators.iter().find(|d| d.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassMemberKind {
    Field {
        type_node: Option<TypeNode>,
        initializer: Option<Expression>,
    },
    Method(FunctionDeclaration),
    Constructor(FunctionDeclaration),
    Getter(FunctionDeclaration),
    Setter(FunctionDeclaration),
}

// ============================================================================
// Sources
// ============================================================================

/// One source file: a path and its top-level statements. Entry sources
/// drive compilation; non-entry sources compile when imported.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub path: String,
    pub statements: Vec<Statement>,
    pub is_entry: bool,
}

impl Source {
    pub fn entry(path: impl Into<String>, statements: Vec<Statement>) -> Source {
        Source {
            path: path.into(),
            statements,
            is_entry: true,
        }
    }

    pub fn library(path: impl Into<String>, statements: Vec<Statement>) -> Source {
        Source {
            path: path.into(),
            statements,
            is_entry: false,
        }
    }

    /// The file name without directories or extension, used as the default
    /// import module name for top-level ambient declarations.
    pub fn simple_path(&self) -> &str {
        let base = self.path.rsplit('/').next().unwrap_or(&self.path);
        base.strip_suffix(".tr").unwrap_or(base)
    }
}

// ============================================================================
// Construction helpers
// ============================================================================

impl Expression {
    pub fn new(kind: ExpressionKind, location: TextLocation) -> Expression {
        Expression { kind, location }
    }

    pub fn integer(value: i64, location: TextLocation) -> Expression {
        Expression::new(ExpressionKind::IntegerLiteral(value), location)
    }

    pub fn float(value: f64, location: TextLocation) -> Expression {
        Expression::new(ExpressionKind::FloatLiteral(value), location)
    }

    pub fn string(value: impl Into<String>, location: TextLocation) -> Expression {
        Expression::new(ExpressionKind::StringLiteral(value.into()), location)
    }

    pub fn identifier(name: impl Into<String>, location: TextLocation) -> Expression {
        Expression::new(ExpressionKind::Identifier(name.into()), location)
    }

    pub fn binary(op: BinaryOperator, left: Expression, right: Expression) -> Expression {
        let location = left.location.merged_with(&right.location);
        Expression::new(
            ExpressionKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            location,
        )
    }

    pub fn call(callee: Expression, arguments: Vec<Expression>) -> Expression {
        let location = callee.location.clone();
        Expression::new(
            ExpressionKind::Call {
                callee: Box::new(callee),
                type_arguments: Vec::new(),
                arguments,
            },
            location,
        )
    }

    pub fn property_access(object: Expression, property: impl Into<String>) -> Expression {
        let location = object.location.clone();
        Expression::new(
            ExpressionKind::PropertyAccess {
                object: Box::new(object),
                property: property.into(),
            },
            location,
        )
    }
}

impl Statement {
    pub fn new(kind: StatementKind, location: TextLocation) -> Statement {
        Statement { kind, location }
    }

    pub fn expression(expression: Expression) -> Statement {
        let location = expression.location.clone();
        Statement::new(StatementKind::Expression(expression), location)
    }

    pub fn block(statements: Vec<Statement>, location: TextLocation) -> Statement {
        Statement::new(StatementKind::Block(statements), location)
    }

    pub fn ret(value: Option<Expression>, location: TextLocation) -> Statement {
        Statement::new(StatementKind::Return(value), location)
    }

    pub fn declaration(declaration: Declaration) -> Statement {
        let location = declaration.location.clone();
        Statement::new(StatementKind::Declaration(declaration), location)
    }
}
