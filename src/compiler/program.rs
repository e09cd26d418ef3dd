//! The resolved program model.
//!
//! Everything the parser produced is resolved into `Element`s living in a
//! single arena on [`Program`]. Elements reference each other exclusively
//! through [`ElementId`] handles: `parent` is a handle, never a pointer
//! so the codegen core can mutate one element while reading others without
//! fighting the borrow checker.
//!
//! Generic prototypes (functions and classes) are instantiated per
//! type-argument combination and memoised; a concrete [`Function`] or
//! [`Class`] is created at most once per combination and compiled at most
//! once (guarded by the `COMPILED` flag).

use crate::compiler::ast;
use crate::compiler::diagnostics::CompilerMessages;
use crate::compiler::types::{Type, TypeKind};
use crate::compiler::wir::nodes::{Literal, NativeType};
use rustc_hash::FxHashMap;

/// A handle into the program's element arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementId(pub(crate) u32);

impl ElementId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ============================================================================
// Flags
// ============================================================================

/// Common element flags. Stored as a plain bitset because flags are set
/// and tested on every codegen step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ElementFlags(u32);

impl ElementFlags {
    pub const NONE: ElementFlags = ElementFlags(0);
    pub const EXPORT: ElementFlags = ElementFlags(1 << 0);
    pub const STATIC: ElementFlags = ElementFlags(1 << 1);
    pub const CONST: ElementFlags = ElementFlags(1 << 2);
    pub const READONLY: ElementFlags = ElementFlags(1 << 3);
    pub const PRIVATE: ElementFlags = ElementFlags(1 << 4);
    pub const INSTANCE: ElementFlags = ElementFlags(1 << 5);
    pub const GENERIC: ElementFlags = ElementFlags(1 << 6);
    pub const AMBIENT: ElementFlags = ElementFlags(1 << 7);
    pub const CONSTRUCTOR: ElementFlags = ElementFlags(1 << 8);
    pub const MAIN: ElementFlags = ElementFlags(1 << 9);
    pub const INLINED: ElementFlags = ElementFlags(1 << 10);
    pub const COMPILED: ElementFlags = ElementFlags(1 << 11);
    pub const MODULE_IMPORT: ElementFlags = ElementFlags(1 << 12);
    pub const TRAMPOLINE: ElementFlags = ElementFlags(1 << 13);
    pub const GETTER: ElementFlags = ElementFlags(1 << 14);
    pub const SETTER: ElementFlags = ElementFlags(1 << 15);
    pub const ARROW: ElementFlags = ElementFlags(1 << 16);
    /// Set while a constructor body has definitely allocated `this`.
    pub const ALLOCATES: ElementFlags = ElementFlags(1 << 17);

    pub fn has(self, flag: ElementFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn set(&mut self, flag: ElementFlags) {
        self.0 |= flag.0;
    }

    pub fn clear(&mut self, flag: ElementFlags) {
        self.0 &= !flag.0;
    }

    pub fn union(self, other: ElementFlags) -> ElementFlags {
        ElementFlags(self.0 | other.0)
    }
}

/// Recognised decorator flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecoratorFlags(u32);

impl DecoratorFlags {
    pub const NONE: DecoratorFlags = DecoratorFlags(0);
    pub const BUILTIN: DecoratorFlags = DecoratorFlags(1 << 0);
    pub const INLINE: DecoratorFlags = DecoratorFlags(1 << 1);
    pub const EXTERNAL: DecoratorFlags = DecoratorFlags(1 << 2);
    pub const OPERATOR: DecoratorFlags = DecoratorFlags(1 << 3);

    pub fn has(self, flag: DecoratorFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn set(&mut self, flag: DecoratorFlags) {
        self.0 |= flag.0;
    }
}

// ============================================================================
// Operator overloads
// ============================================================================

/// The operator a class method overloads via `@operator("…")`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
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
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    BitwiseNot,
    BitwiseShl,
    BitwiseShr,
    BitwiseShrU,
    Plus,
    Minus,
    Not,
    PrefixInc,
    PrefixDec,
    IndexedGet,
    IndexedSet,
}

impl OperatorKind {
    /// Parse the decorator spelling, e.g. `@operator("+")`.
    pub fn from_decorator_string(s: &str) -> Option<OperatorKind> {
        Some(match s {
            "+" => OperatorKind::Add,
            "-" => OperatorKind::Sub,
            "*" => OperatorKind::Mul,
            "/" => OperatorKind::Div,
            "%" => OperatorKind::Rem,
            "**" => OperatorKind::Pow,
            "==" => OperatorKind::Eq,
            "!=" => OperatorKind::Ne,
            "<" => OperatorKind::Lt,
            "<=" => OperatorKind::Le,
            ">" => OperatorKind::Gt,
            ">=" => OperatorKind::Ge,
            "&" => OperatorKind::BitwiseAnd,
            "|" => OperatorKind::BitwiseOr,
            "^" => OperatorKind::BitwiseXor,
            "~" => OperatorKind::BitwiseNot,
            "<<" => OperatorKind::BitwiseShl,
            ">>" => OperatorKind::BitwiseShr,
            ">>>" => OperatorKind::BitwiseShrU,
            "!" => OperatorKind::Not,
            "++" => OperatorKind::PrefixInc,
            "--" => OperatorKind::PrefixDec,
            "[]" => OperatorKind::IndexedGet,
            "[]=" => OperatorKind::IndexedSet,
            _ => return None,
        })
    }

    pub fn from_binary_operator(op: ast::BinaryOperator) -> Option<OperatorKind> {
        use ast::BinaryOperator as B;
        Some(match op {
            B::Add => OperatorKind::Add,
            B::Sub => OperatorKind::Sub,
            B::Mul => OperatorKind::Mul,
            B::Div => OperatorKind::Div,
            B::Rem => OperatorKind::Rem,
            B::Pow => OperatorKind::Pow,
            B::Eq => OperatorKind::Eq,
            B::Ne => OperatorKind::Ne,
            B::Lt => OperatorKind::Lt,
            B::Le => OperatorKind::Le,
            B::Gt => OperatorKind::Gt,
            B::Ge => OperatorKind::Ge,
            B::BitAnd => OperatorKind::BitwiseAnd,
            B::BitOr => OperatorKind::BitwiseOr,
            B::BitXor => OperatorKind::BitwiseXor,
            B::Shl => OperatorKind::BitwiseShl,
            B::Shr => OperatorKind::BitwiseShr,
            B::ShrU => OperatorKind::BitwiseShrU,
            B::LogicalAnd | B::LogicalOr => return None,
        })
    }
}

// ============================================================================
// Signatures and locals
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterType {
    pub name: String,
    pub ty: Type,
    pub has_initializer: bool,
}

/// A resolved function signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub parameter_types: Vec<ParameterType>,
    /// Number of parameters a caller must supply.
    pub required_parameters: usize,
    pub return_type: Type,
    /// Present on instance methods and constructors.
    pub this_type: Option<Type>,
}

impl Signature {
    /// Native parameter types as WASM sees them, `this` first if present.
    pub fn native_params(&self) -> Vec<NativeType> {
        let mut params = Vec::with_capacity(self.parameter_types.len() + 1);
        if let Some(this_type) = &self.this_type {
            params.push(this_type.native_type());
        }
        for parameter in &self.parameter_types {
            params.push(parameter.ty.native_type());
        }
        params
    }

    pub fn native_result(&self) -> NativeType {
        self.return_type.native_type()
    }

    /// Signature identity string used for type-pool dedup and indirect
    /// call checking.
    pub fn to_signature_string(&self) -> String {
        let mut s = String::new();
        s.push(self.native_result().signature_char());
        for param in self.native_params() {
            s.push(param.signature_char());
        }
        s
    }

    pub fn has_this(&self) -> bool {
        self.this_type.is_some()
    }
}

/// One local slot of a function: a named parameter or variable, or an
/// anonymous temporary.
#[derive(Debug, Clone)]
pub struct Local {
    pub name: String,
    pub ty: Type,
    pub index: u32,
}

// ============================================================================
// Element payloads
// ============================================================================

#[derive(Debug, Clone)]
pub struct Global {
    pub declaration: Option<ast::VariableDeclarator>,
    pub ty: Option<Type>,
    /// Set when the global was inlined as a constant.
    pub constant_value: Option<Literal>,
    /// `@external("module", "name")` override for ambient globals.
    pub external_name: Option<(Option<String>, Option<String>)>,
}

#[derive(Debug, Clone)]
pub struct EnumElement {
    pub members: Vec<ElementId>,
}

#[derive(Debug, Clone)]
pub struct EnumValue {
    pub initializer: Option<ast::Expression>,
    /// Set once the member has been evaluated; `INLINED` is set on the
    /// element when the value is constant.
    pub constant_value: Option<Literal>,
}

#[derive(Debug, Clone)]
pub struct FunctionPrototype {
    pub declaration: ast::FunctionDeclaration,
    /// The class prototype this is a method of, if any.
    pub class_prototype: Option<ElementId>,
    /// Resolved instances by type-argument key.
    pub instances: FxHashMap<String, ElementId>,
    pub operator_kind: Option<OperatorKind>,
    /// `@external` override: (module, name).
    pub external_name: Option<(Option<String>, Option<String>)>,
}

/// A resolved instance of a function prototype: one per type-argument
/// combination.
#[derive(Debug, Clone)]
pub struct Function {
    pub prototype: ElementId,
    pub signature: Signature,
    pub type_arguments: Vec<Type>,
    /// Type-parameter bindings in scope inside the body (own + class).
    pub contextual_type_arguments: FxHashMap<String, Type>,
    /// All locals: `this` first for instance methods, then parameters,
    /// then additional locals as codegen introduces them.
    pub locals: Vec<Local>,
    /// Reusable temp locals by native type.
    free_temp_locals: FxHashMap<NativeType, Vec<u32>>,
    /// The synthesised trampoline filling in omitted optional arguments.
    pub trampoline: Option<ElementId>,
    /// Index in the function table, `-1` when not indexed.
    pub function_table_index: i32,
    /// Counter for unique inline return labels.
    pub next_inline_id: u32,
}

impl Function {
    pub fn new(prototype: ElementId, signature: Signature, type_arguments: Vec<Type>) -> Function {
        let mut locals = Vec::new();
        if let Some(this_type) = &signature.this_type {
            locals.push(Local {
                name: "this".to_string(),
                ty: this_type.clone(),
                index: 0,
            });
        }
        for parameter in &signature.parameter_types {
            locals.push(Local {
                name: parameter.name.clone(),
                ty: parameter.ty.clone(),
                index: locals.len() as u32,
            });
        }
        Function {
            prototype,
            signature,
            type_arguments,
            contextual_type_arguments: FxHashMap::default(),
            locals,
            free_temp_locals: FxHashMap::default(),
            trampoline: None,
            function_table_index: -1,
            next_inline_id: 0,
        }
    }

    /// Number of parameter slots including `this`.
    pub fn parameter_slot_count(&self) -> usize {
        self.signature.parameter_types.len() + self.signature.this_type.is_some() as usize
    }

    pub fn local_by_name(&self, name: &str) -> Option<&Local> {
        self.locals.iter().find(|local| local.name == name)
    }

    /// Add a named local of the given type.
    pub fn add_local(&mut self, name: impl Into<String>, ty: Type) -> u32 {
        let index = self.locals.len() as u32;
        self.locals.push(Local {
            name: name.into(),
            ty,
            index,
        });
        index
    }

    /// Acquire a temporary local, reusing a previously freed one of the
    /// same native type when available.
    pub fn get_temp_local(&mut self, ty: Type) -> u32 {
        let native = ty.native_type();
        if let Some(free) = self.free_temp_locals.get_mut(&native) {
            if let Some(index) = free.pop() {
                self.locals[index as usize].ty = ty;
                return index;
            }
        }
        self.add_local(format!("~temp{}", self.locals.len()), ty)
    }

    /// Return a temporary local to the pool.
    pub fn free_temp_local(&mut self, index: u32) {
        let native = self.locals[index as usize].ty.native_type();
        self.free_temp_locals.entry(native).or_default().push(index);
    }

    /// Native types of the additional (non-parameter) locals, for the
    /// module's function declaration.
    pub fn additional_local_types(&self) -> Vec<NativeType> {
        self.locals[self.parameter_slot_count()..]
            .iter()
            .map(|local| local.ty.native_type())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ClassPrototype {
    pub declaration: ast::ClassDeclaration,
    pub instances: FxHashMap<String, ElementId>,
}

/// A resolved instance of a class prototype with a concrete field layout.
#[derive(Debug, Clone)]
pub struct Class {
    pub prototype: ElementId,
    pub type_arguments: Vec<Type>,
    pub contextual_type_arguments: FxHashMap<String, Type>,
    pub base: Option<ElementId>,
    /// Instance members by simple name: fields, method prototypes,
    /// properties.
    pub members: FxHashMap<String, ElementId>,
    /// Static members by simple name: globals, method prototypes,
    /// properties.
    pub statics: FxHashMap<String, ElementId>,
    /// Fields in layout order.
    pub fields: Vec<ElementId>,
    pub constructor: Option<ElementId>,
    /// Operator overloads by kind, pointing at method prototypes.
    pub operators: FxHashMap<OperatorKind, ElementId>,
    /// Instance size in bytes (sum of aligned field sizes).
    pub instance_size: u32,
}

#[derive(Debug, Clone)]
pub struct Field {
    pub ty: Type,
    pub memory_offset: u32,
    pub initializer: Option<ast::Expression>,
    /// Index of the constructor parameter this field mirrors, for
    /// `constructor(public x: i32)`-style declarations.
    pub parameter_index: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Property {
    pub getter: Option<ElementId>,
    pub setter: Option<ElementId>,
}

#[derive(Debug, Clone, Default)]
pub struct Namespace {
    pub members: FxHashMap<String, ElementId>,
    pub statements: Vec<ast::Statement>,
}

// ============================================================================
// Elements
// ============================================================================

#[derive(Debug, Clone)]
pub enum ElementKind {
    Global(Global),
    Enum(EnumElement),
    EnumValue(EnumValue),
    FunctionPrototype(FunctionPrototype),
    Function(Function),
    ClassPrototype(ClassPrototype),
    Class(Class),
    Field(Field),
    Property(Property),
    Namespace(Namespace),
}

/// Payload-free element discriminant, for dispatching without holding a
/// borrow of the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementTag {
    Global,
    Enum,
    EnumValue,
    FunctionPrototype,
    Function,
    ClassPrototype,
    Class,
    Field,
    Property,
    Namespace,
}

impl ElementKind {
    pub fn tag(&self) -> ElementTag {
        match self {
            ElementKind::Global(_) => ElementTag::Global,
            ElementKind::Enum(_) => ElementTag::Enum,
            ElementKind::EnumValue(_) => ElementTag::EnumValue,
            ElementKind::FunctionPrototype(_) => ElementTag::FunctionPrototype,
            ElementKind::Function(_) => ElementTag::Function,
            ElementKind::ClassPrototype(_) => ElementTag::ClassPrototype,
            ElementKind::Class(_) => ElementTag::Class,
            ElementKind::Field(_) => ElementTag::Field,
            ElementKind::Property(_) => ElementTag::Property,
            ElementKind::Namespace(_) => ElementTag::Namespace,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ElementKind::Global(_) => "global",
            ElementKind::Enum(_) => "enum",
            ElementKind::EnumValue(_) => "enum value",
            ElementKind::FunctionPrototype(_) => "function prototype",
            ElementKind::Function(_) => "function",
            ElementKind::ClassPrototype(_) => "class prototype",
            ElementKind::Class(_) => "class",
            ElementKind::Field(_) => "field",
            ElementKind::Property(_) => "property",
            ElementKind::Namespace(_) => "namespace",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ElementData {
    pub kind: ElementKind,
    /// Simple name as written in source.
    pub name: String,
    /// Unique mangled name: `path/name`, `Class#method`, `name<i32>`, …
    pub internal_name: String,
    pub flags: ElementFlags,
    pub decorators: DecoratorFlags,
    pub parent: Option<ElementId>,
    pub location: crate::compiler::tokens::TextLocation,
}

// ============================================================================
// Program
// ============================================================================

/// The whole program: sources, the element arena and the diagnostic bag.
#[derive(Debug)]
pub struct Program {
    pub sources: Vec<ast::Source>,
    pub elements: Vec<ElementData>,
    /// File-level scope: simple name -> element. Trellis uses one flat
    /// module scope; imports make other sources' declarations visible.
    pub scope: FxHashMap<String, ElementId>,
    /// Module-level exports by export name.
    pub module_exports: Vec<(String, ElementId)>,
    pub messages: CompilerMessages,
    /// Pointer size in bytes for the compilation target; set by the
    /// compiler before resolution starts.
    pub pointer_size: u32,
}

impl Program {
    pub fn new(sources: Vec<ast::Source>) -> Program {
        Program {
            sources,
            elements: Vec::new(),
            scope: FxHashMap::default(),
            module_exports: Vec::new(),
            messages: CompilerMessages::new(),
            pointer_size: 4,
        }
    }

    pub fn add_element(&mut self, element: ElementData) -> ElementId {
        let id = ElementId(self.elements.len() as u32);
        self.elements.push(element);
        id
    }

    pub fn element(&self, id: ElementId) -> &ElementData {
        &self.elements[id.index()]
    }

    pub fn element_mut(&mut self, id: ElementId) -> &mut ElementData {
        &mut self.elements[id.index()]
    }

    pub fn lookup(&self, name: &str) -> Option<ElementId> {
        self.scope.get(name).copied()
    }

    // Typed accessors. Handle-kind mismatches are compiler bugs, not user
    // errors, and panic with the element's actual kind.

    pub fn function(&self, id: ElementId) -> &Function {
        match &self.element(id).kind {
            ElementKind::Function(f) => f,
            other => panic!("element is a {}, expected a function", other.kind_name()),
        }
    }

    pub fn function_mut(&mut self, id: ElementId) -> &mut Function {
        match &mut self.element_mut(id).kind {
            ElementKind::Function(f) => f,
            other => panic!("element is a {}, expected a function", other.kind_name()),
        }
    }

    pub fn function_prototype(&self, id: ElementId) -> &FunctionPrototype {
        match &self.element(id).kind {
            ElementKind::FunctionPrototype(p) => p,
            other => panic!(
                "element is a {}, expected a function prototype",
                other.kind_name()
            ),
        }
    }

    pub fn function_prototype_mut(&mut self, id: ElementId) -> &mut FunctionPrototype {
        match &mut self.element_mut(id).kind {
            ElementKind::FunctionPrototype(p) => p,
            other => panic!(
                "element is a {}, expected a function prototype",
                other.kind_name()
            ),
        }
    }

    pub fn class(&self, id: ElementId) -> &Class {
        match &self.element(id).kind {
            ElementKind::Class(c) => c,
            other => panic!("element is a {}, expected a class", other.kind_name()),
        }
    }

    pub fn class_mut(&mut self, id: ElementId) -> &mut Class {
        match &mut self.element_mut(id).kind {
            ElementKind::Class(c) => c,
            other => panic!("element is a {}, expected a class", other.kind_name()),
        }
    }

    pub fn class_prototype(&self, id: ElementId) -> &ClassPrototype {
        match &self.element(id).kind {
            ElementKind::ClassPrototype(p) => p,
            other => panic!(
                "element is a {}, expected a class prototype",
                other.kind_name()
            ),
        }
    }

    pub fn global(&self, id: ElementId) -> &Global {
        match &self.element(id).kind {
            ElementKind::Global(g) => g,
            other => panic!("element is a {}, expected a global", other.kind_name()),
        }
    }

    pub fn global_mut(&mut self, id: ElementId) -> &mut Global {
        match &mut self.element_mut(id).kind {
            ElementKind::Global(g) => g,
            other => panic!("element is a {}, expected a global", other.kind_name()),
        }
    }

    pub fn field(&self, id: ElementId) -> &Field {
        match &self.element(id).kind {
            ElementKind::Field(f) => f,
            other => panic!("element is a {}, expected a field", other.kind_name()),
        }
    }

    pub fn enum_value(&self, id: ElementId) -> &EnumValue {
        match &self.element(id).kind {
            ElementKind::EnumValue(v) => v,
            other => panic!("element is a {}, expected an enum value", other.kind_name()),
        }
    }

    pub fn enum_value_mut(&mut self, id: ElementId) -> &mut EnumValue {
        match &mut self.element_mut(id).kind {
            ElementKind::EnumValue(v) => v,
            other => panic!("element is a {}, expected an enum value", other.kind_name()),
        }
    }

    /// The concrete type of a basic type kind on the current target.
    pub fn type_of(&self, kind: TypeKind) -> Type {
        Type::of(kind, self.pointer_size)
    }

    /// The pointer-sized unsigned integer type.
    pub fn usize_type(&self) -> Type {
        self.type_of(TypeKind::Usize)
    }

    pub fn bool_type(&self) -> Type {
        self.type_of(TypeKind::Bool)
    }

    pub fn i32_type(&self) -> Type {
        self.type_of(TypeKind::I32)
    }

    pub fn void_type(&self) -> Type {
        self.type_of(TypeKind::Void)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_flags_set_and_clear() {
        let mut flags = ElementFlags::NONE;
        flags.set(ElementFlags::EXPORT);
        flags.set(ElementFlags::CONST);
        assert!(flags.has(ElementFlags::EXPORT));
        assert!(flags.has(ElementFlags::CONST));
        assert!(!flags.has(ElementFlags::COMPILED));
        flags.clear(ElementFlags::CONST);
        assert!(!flags.has(ElementFlags::CONST));
    }

    #[test]
    fn operator_kind_parses_decorator_spellings() {
        assert_eq!(
            OperatorKind::from_decorator_string("+"),
            Some(OperatorKind::Add)
        );
        assert_eq!(
            OperatorKind::from_decorator_string("[]"),
            Some(OperatorKind::IndexedGet)
        );
        assert_eq!(
            OperatorKind::from_decorator_string(">>>"),
            Some(OperatorKind::BitwiseShrU)
        );
        assert_eq!(OperatorKind::from_decorator_string("?:"), None);
    }

    #[test]
    fn temp_locals_are_reused_by_native_type() {
        let signature = Signature {
            parameter_types: Vec::new(),
            required_parameters: 0,
            return_type: Type::of(TypeKind::Void, 4),
            this_type: None,
        };
        let mut function = Function::new(ElementId(0), signature, Vec::new());
        let a = function.get_temp_local(Type::of(TypeKind::I32, 4));
        function.free_temp_local(a);
        let b = function.get_temp_local(Type::of(TypeKind::U32, 4));
        assert_eq!(a, b); // same native slot, different source type
        let c = function.get_temp_local(Type::of(TypeKind::I64, 4));
        assert_ne!(b, c);
    }

    #[test]
    fn signature_string_includes_this() {
        let signature = Signature {
            parameter_types: vec![ParameterType {
                name: "x".to_string(),
                ty: Type::of(TypeKind::F64, 4),
                has_initializer: false,
            }],
            required_parameters: 1,
            return_type: Type::of(TypeKind::I32, 4),
            this_type: Some(Type::of(TypeKind::Usize, 4)),
        };
        assert_eq!(signature.to_signature_string(), "iiF");
    }
}
