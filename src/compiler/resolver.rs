//! Resolution of source declarations onto program elements.
//!
//! Two phases live here:
//! - `initialize` walks every source's top-level statements and registers
//!   an element (prototype where generic) for each declaration into the
//!   program scope.
//! - the `resolve_*` family turns type annotations into concrete [`Type`]s
//!   and instantiates generic prototypes, memoised per type-argument
//!   combination.
//!
//! Everything here reports through the program's message bag; resolution
//! failures return `None` and the caller recovers.

use crate::compiler::ast;
use crate::compiler::diagnostics::DiagnosticCode;
use crate::compiler::program::{
    Class, ClassPrototype, DecoratorFlags, ElementData, ElementFlags, ElementId, ElementKind,
    EnumElement, EnumValue, Field, Function, FunctionPrototype, Global, Namespace, OperatorKind,
    ParameterType, Program, Property, Signature,
};
use crate::compiler::tokens::TextLocation;
use crate::compiler::types::{Type, TypeKind};
use rustc_hash::FxHashMap;

/// Decorator information extracted from a declaration.
#[derive(Debug, Default)]
struct DecoratorInfo {
    flags: DecoratorFlags,
    operator_kind: Option<OperatorKind>,
    external_name: Option<(Option<String>, Option<String>)>,
}

fn extract_decorators(decorators: &[ast::Decorator]) -> DecoratorInfo {
    let mut info = DecoratorInfo::default();
    for decorator in decorators {
        match decorator.name.as_str() {
            "builtin" => info.flags.set(DecoratorFlags::BUILTIN),
            "inline" => info.flags.set(DecoratorFlags::INLINE),
            "operator" => {
                info.flags.set(DecoratorFlags::OPERATOR);
                if let Some(ast::Expression {
                    kind: ast::ExpressionKind::StringLiteral(s),
                    ..
                }) = decorator.arguments.first()
                {
                    info.operator_kind = OperatorKind::from_decorator_string(s);
                }
            }
            "external" => {
                info.flags.set(DecoratorFlags::EXTERNAL);
                let mut strings = decorator.arguments.iter().filter_map(|a| match &a.kind {
                    ast::ExpressionKind::StringLiteral(s) => Some(s.clone()),
                    _ => None,
                });
                let first = strings.next();
                let second = strings.next();
                info.external_name = Some(match (first, second) {
                    // One-argument form sets only the element name.
                    (Some(name), None) => (None, Some(name)),
                    (module, name) => (module, name),
                });
            }
            _ => {}
        }
    }
    info
}

fn flags_from_modifiers(modifiers: &[ast::Modifier]) -> ElementFlags {
    let mut flags = ElementFlags::NONE;
    for modifier in modifiers {
        match modifier {
            ast::Modifier::Export => flags.set(ElementFlags::EXPORT),
            ast::Modifier::Declare => flags.set(ElementFlags::AMBIENT),
            ast::Modifier::Const => flags.set(ElementFlags::CONST),
            ast::Modifier::Readonly => flags.set(ElementFlags::READONLY),
            ast::Modifier::Private | ast::Modifier::Protected => {
                flags.set(ElementFlags::PRIVATE)
            }
            ast::Modifier::Static => flags.set(ElementFlags::STATIC),
            ast::Modifier::Let | ast::Modifier::Public | ast::Modifier::Abstract => {}
        }
    }
    flags
}

impl Program {
    // =========================================================================
    // Initialization
    // =========================================================================

    /// Register every top-level declaration of every source. Must run
    /// before compilation starts.
    pub fn initialize(&mut self, pointer_size: u32) {
        self.pointer_size = pointer_size;
        let sources = std::mem::take(&mut self.sources);
        for source in &sources {
            let path = source.simple_path().to_string();
            for statement in &source.statements {
                self.register_statement(statement, &path, None);
            }
        }
        self.sources = sources;
    }

    fn register_statement(
        &mut self,
        statement: &ast::Statement,
        source_path: &str,
        parent: Option<ElementId>,
    ) {
        match &statement.kind {
            ast::StatementKind::Declaration(declaration) => {
                self.register_declaration(declaration, source_path, parent);
            }
            ast::StatementKind::Variable(variable) => {
                self.register_variable_statement(variable, source_path, parent, &statement.location);
            }
            _ => {} // plain statements compile into the start function
        }
    }

    fn enter_scope(&mut self, name: &str, id: ElementId, parent: Option<ElementId>) {
        if let Some(parent) = parent {
            if let ElementKind::Namespace(ns) = &mut self.element_mut(parent).kind {
                if ns.members.insert(name.to_string(), id).is_some() {
                    let location = self.element(id).location.clone();
                    self.messages.error(
                        DiagnosticCode::DuplicateIdentifier,
                        format!("Duplicate identifier '{}'", name),
                        &location,
                    );
                }
                return;
            }
        }
        if self.scope.insert(name.to_string(), id).is_some() {
            let location = self.element(id).location.clone();
            self.messages.error(
                DiagnosticCode::DuplicateIdentifier,
                format!("Duplicate identifier '{}'", name),
                &location,
            );
        }
    }

    fn register_declaration(
        &mut self,
        declaration: &ast::Declaration,
        source_path: &str,
        parent: Option<ElementId>,
    ) -> Option<ElementId> {
        let decorators = extract_decorators(&declaration.decorators);
        let mut flags = flags_from_modifiers(&declaration.modifiers);
        let internal_name = match parent {
            Some(parent) => format!("{}.{}", self.element(parent).internal_name, declaration.name),
            None => format!("{}/{}", source_path, declaration.name),
        };
        let id = match &declaration.kind {
            ast::DeclarationKind::Function(function) => {
                if !function.type_parameters.is_empty() {
                    flags.set(ElementFlags::GENERIC);
                }
                if declaration.name == "main" {
                    flags.set(ElementFlags::MAIN);
                }
                self.add_element(ElementData {
                    kind: ElementKind::FunctionPrototype(FunctionPrototype {
                        declaration: function.clone(),
                        class_prototype: None,
                        instances: FxHashMap::default(),
                        operator_kind: decorators.operator_kind,
                        external_name: decorators.external_name.clone(),
                    }),
                    name: declaration.name.clone(),
                    internal_name,
                    flags,
                    decorators: decorators.flags,
                    parent,
                    location: declaration.location.clone(),
                })
            }
            ast::DeclarationKind::Class(class) => {
                if !class.type_parameters.is_empty() {
                    flags.set(ElementFlags::GENERIC);
                }
                self.add_element(ElementData {
                    kind: ElementKind::ClassPrototype(ClassPrototype {
                        declaration: class.clone(),
                        instances: FxHashMap::default(),
                    }),
                    name: declaration.name.clone(),
                    internal_name,
                    flags,
                    decorators: decorators.flags,
                    parent,
                    location: declaration.location.clone(),
                })
            }
            ast::DeclarationKind::Interface(_) => {
                // Interfaces are not implemented; the declaration itself is
                // registered so references resolve to a clear diagnostic.
                self.messages.error(
                    DiagnosticCode::OperationNotSupported,
                    "Interfaces are not supported",
                    &declaration.location,
                );
                return None;
            }
            ast::DeclarationKind::Enum(enum_declaration) => {
                let enum_id = self.add_element(ElementData {
                    kind: ElementKind::Enum(EnumElement {
                        members: Vec::new(),
                    }),
                    name: declaration.name.clone(),
                    internal_name: internal_name.clone(),
                    flags,
                    decorators: decorators.flags,
                    parent,
                    location: declaration.location.clone(),
                });
                let mut members = Vec::with_capacity(enum_declaration.members.len());
                for member in &enum_declaration.members {
                    let value_id = self.add_element(ElementData {
                        kind: ElementKind::EnumValue(EnumValue {
                            initializer: member.initializer.clone(),
                            constant_value: None,
                        }),
                        name: member.name.clone(),
                        internal_name: format!("{}.{}", internal_name, member.name),
                        flags,
                        decorators: DecoratorFlags::NONE,
                        parent: Some(enum_id),
                        location: member.location.clone(),
                    });
                    members.push(value_id);
                }
                if let ElementKind::Enum(e) = &mut self.element_mut(enum_id).kind {
                    e.members = members;
                }
                enum_id
            }
            ast::DeclarationKind::Namespace(statements) => {
                let namespace_id = self.add_element(ElementData {
                    kind: ElementKind::Namespace(Namespace {
                        members: FxHashMap::default(),
                        statements: statements.clone(),
                    }),
                    name: declaration.name.clone(),
                    internal_name: internal_name.clone(),
                    flags,
                    decorators: decorators.flags,
                    parent,
                    location: declaration.location.clone(),
                });
                for statement in statements.clone() {
                    self.register_statement(&statement, source_path, Some(namespace_id));
                }
                namespace_id
            }
        };
        self.enter_scope(&declaration.name, id, parent);
        Some(id)
    }

    fn register_variable_statement(
        &mut self,
        variable: &ast::VariableDeclaration,
        source_path: &str,
        parent: Option<ElementId>,
        location: &TextLocation,
    ) {
        let flags = flags_from_modifiers(&variable.modifiers);
        for declarator in &variable.declarations {
            let internal_name = match parent {
                Some(parent) => {
                    format!("{}.{}", self.element(parent).internal_name, declarator.name)
                }
                None => format!("{}/{}", source_path, declarator.name),
            };
            let id = self.add_element(ElementData {
                kind: ElementKind::Global(Global {
                    declaration: Some(declarator.clone()),
                    ty: None,
                    constant_value: None,
                    external_name: None,
                }),
                name: declarator.name.clone(),
                internal_name,
                flags,
                decorators: DecoratorFlags::NONE,
                parent,
                location: location.clone(),
            });
            self.enter_scope(&declarator.name, id, parent);
        }
    }

    // =========================================================================
    // Type resolution
    // =========================================================================

    /// Resolve a type annotation to a concrete type, substituting the
    /// given type-parameter bindings. Reports through the message bag
    /// unless `report` is false (used during inference probing).
    pub fn resolve_type(
        &mut self,
        node: &ast::TypeNode,
        contextual_type_arguments: &FxHashMap<String, Type>,
        report: bool,
    ) -> Option<Type> {
        let basic = match node.name.as_str() {
            "i8" => Some(TypeKind::I8),
            "u8" => Some(TypeKind::U8),
            "i16" => Some(TypeKind::I16),
            "u16" => Some(TypeKind::U16),
            "i32" => Some(TypeKind::I32),
            "u32" => Some(TypeKind::U32),
            "i64" => Some(TypeKind::I64),
            "u64" => Some(TypeKind::U64),
            "isize" => Some(TypeKind::Isize),
            "usize" => Some(TypeKind::Usize),
            "f32" => Some(TypeKind::F32),
            "f64" => Some(TypeKind::F64),
            "bool" => Some(TypeKind::Bool),
            "void" => Some(TypeKind::Void),
            _ => None,
        };
        if let Some(kind) = basic {
            if !node.type_arguments.is_empty() && report {
                self.messages.error(
                    DiagnosticCode::UnexpectedTypeArguments,
                    format!("Type '{}' is not generic", node.name),
                    &node.location,
                );
            }
            return Some(self.type_of(kind));
        }
        if let Some(bound) = contextual_type_arguments.get(&node.name) {
            return Some(bound.clone());
        }
        if let Some(element) = self.lookup(&node.name) {
            if matches!(self.element(element).kind, ElementKind::ClassPrototype(_)) {
                let mut type_arguments = Vec::with_capacity(node.type_arguments.len());
                for argument in &node.type_arguments {
                    type_arguments.push(self.resolve_type(
                        argument,
                        contextual_type_arguments,
                        report,
                    )?);
                }
                let class = self.resolve_class(element, &type_arguments)?;
                return Some(Type::reference(class, self.pointer_size, node.nullable));
            }
            // Enums type as i32.
            if matches!(self.element(element).kind, ElementKind::Enum(_)) {
                return Some(self.i32_type());
            }
        }
        if report {
            self.messages.error(
                DiagnosticCode::TypeExpected,
                format!("Cannot find type '{}'", node.name),
                &node.location,
            );
        }
        None
    }

    // =========================================================================
    // Function instantiation
    // =========================================================================

    fn type_arguments_key(type_arguments: &[Type]) -> String {
        if type_arguments.is_empty() {
            return String::new();
        }
        let mut key = String::from("<");
        for (i, ty) in type_arguments.iter().enumerate() {
            if i > 0 {
                key.push(',');
            }
            key.push_str(&ty.to_string());
        }
        key.push('>');
        key
    }

    /// Resolve a function prototype to a concrete instance for the given
    /// type arguments, creating and memoising it on first use.
    ///
    /// `class_instance` carries the concrete class when resolving a
    /// method; its contextual type arguments flow into the signature.
    pub fn resolve_function(
        &mut self,
        prototype_id: ElementId,
        type_arguments: &[Type],
        class_instance: Option<ElementId>,
    ) -> Option<ElementId> {
        let mut key = Self::type_arguments_key(type_arguments);
        if let Some(class) = class_instance {
            key = format!("{}|{}", self.element(class).internal_name, key);
        }
        if let Some(&instance) = self.function_prototype(prototype_id).instances.get(&key) {
            return Some(instance);
        }

        let prototype_data = self.element(prototype_id);
        let declaration = match &prototype_data.kind {
            ElementKind::FunctionPrototype(p) => p.declaration.clone(),
            _ => return None,
        };
        let prototype_flags = prototype_data.flags;
        let prototype_decorators = prototype_data.decorators;
        let prototype_name = prototype_data.name.clone();
        let prototype_internal = prototype_data.internal_name.clone();
        let location = prototype_data.location.clone();

        if declaration.type_parameters.len() != type_arguments.len() {
            self.messages.error(
                DiagnosticCode::UnexpectedTypeArguments,
                format!(
                    "Expected {} type arguments, but got {}",
                    declaration.type_parameters.len(),
                    type_arguments.len()
                ),
                &location,
            );
            return None;
        }

        let mut contextual: FxHashMap<String, Type> = FxHashMap::default();
        if let Some(class) = class_instance {
            contextual.extend(self.class(class).contextual_type_arguments.clone());
        }
        for (parameter, argument) in declaration
            .type_parameters
            .iter()
            .zip(type_arguments.iter())
        {
            contextual.insert(parameter.clone(), argument.clone());
        }

        // Resolve the signature against the bindings.
        let mut parameter_types = Vec::with_capacity(declaration.parameters.len());
        let mut required_parameters = declaration.parameters.len();
        for (index, parameter) in declaration.parameters.iter().enumerate() {
            if parameter.is_rest {
                self.messages.error(
                    DiagnosticCode::OperationNotSupported,
                    "Rest parameters are not supported",
                    &parameter.location,
                );
            }
            let ty = self.resolve_type(&parameter.type_node, &contextual, true)?;
            if parameter.initializer.is_some() && index < required_parameters {
                required_parameters = index;
            }
            parameter_types.push(ParameterType {
                name: parameter.name.clone(),
                ty,
                has_initializer: parameter.initializer.is_some(),
            });
        }
        let is_instance = prototype_flags.has(ElementFlags::INSTANCE);
        let is_constructor = prototype_flags.has(ElementFlags::CONSTRUCTOR);
        let this_type = if is_instance {
            let class = class_instance?;
            Some(Type::reference(class, self.pointer_size, false))
        } else {
            None
        };
        let return_type = if is_constructor {
            this_type.clone()?
        } else {
            match &declaration.return_type {
                Some(node) => self.resolve_type(node, &contextual, true)?,
                None => self.void_type(),
            }
        };

        let signature = Signature {
            parameter_types,
            required_parameters,
            return_type,
            this_type,
        };

        // Method prototypes are created per class instance, so their
        // internal names already carry the class (and its type
        // arguments); the instance only appends its own.
        let internal_name = format!(
            "{}{}",
            prototype_internal,
            Self::type_arguments_key(type_arguments)
        );

        let mut function = Function::new(prototype_id, signature, type_arguments.to_vec());
        function.contextual_type_arguments = contextual;
        let mut flags = prototype_flags;
        flags.clear(ElementFlags::GENERIC);
        let instance = self.add_element(ElementData {
            kind: ElementKind::Function(function),
            name: prototype_name,
            internal_name,
            flags,
            decorators: prototype_decorators,
            parent: class_instance.or(Some(prototype_id)),
            location,
        });
        self.function_prototype_mut(prototype_id)
            .instances
            .insert(key, instance);
        Some(instance)
    }

    // =========================================================================
    // Class instantiation
    // =========================================================================

    /// Resolve a class prototype to a concrete instance with a field
    /// layout, creating and memoising it on first use.
    pub fn resolve_class(
        &mut self,
        prototype_id: ElementId,
        type_arguments: &[Type],
    ) -> Option<ElementId> {
        let key = Self::type_arguments_key(type_arguments);
        if let Some(&instance) = self.class_prototype(prototype_id).instances.get(&key) {
            return Some(instance);
        }

        let prototype_data = self.element(prototype_id);
        let declaration = match &prototype_data.kind {
            ElementKind::ClassPrototype(p) => p.declaration.clone(),
            _ => return None,
        };
        let prototype_flags = prototype_data.flags;
        let prototype_decorators = prototype_data.decorators;
        let prototype_name = prototype_data.name.clone();
        let internal_name = format!("{}{}", prototype_data.internal_name, key);
        let location = prototype_data.location.clone();

        if declaration.type_parameters.len() != type_arguments.len() {
            self.messages.error(
                DiagnosticCode::UnexpectedTypeArguments,
                format!(
                    "Expected {} type arguments, but got {}",
                    declaration.type_parameters.len(),
                    type_arguments.len()
                ),
                &location,
            );
            return None;
        }

        let mut contextual: FxHashMap<String, Type> = FxHashMap::default();
        for (parameter, argument) in declaration
            .type_parameters
            .iter()
            .zip(type_arguments.iter())
        {
            contextual.insert(parameter.clone(), argument.clone());
        }

        let base = match &declaration.extends {
            Some(extends) => {
                let base_type = self.resolve_type(extends, &contextual, true)?;
                match base_type.class_reference {
                    Some(base_class) => Some(base_class),
                    None => {
                        self.messages.error(
                            DiagnosticCode::TypeExpected,
                            format!("'{}' is not a class type", extends.name),
                            &extends.location,
                        );
                        None
                    }
                }
            }
            None => None,
        };

        // Cache the instance before resolving members so members can
        // reference their own class.
        let class_id = self.add_element(ElementData {
            kind: ElementKind::Class(Class {
                prototype: prototype_id,
                type_arguments: type_arguments.to_vec(),
                contextual_type_arguments: contextual.clone(),
                base,
                members: FxHashMap::default(),
                statics: FxHashMap::default(),
                fields: Vec::new(),
                constructor: None,
                operators: FxHashMap::default(),
                instance_size: 0,
            }),
            name: prototype_name,
            internal_name: internal_name.clone(),
            flags: prototype_flags,
            decorators: prototype_decorators,
            parent: Some(prototype_id),
            location,
        });
        if let ElementKind::ClassPrototype(p) = &mut self.element_mut(prototype_id).kind {
            p.instances.insert(key, class_id);
        }

        let mut memory_offset = match base {
            Some(base_class) => self.class(base_class).instance_size,
            None => 0,
        };

        for member in &declaration.members {
            let decorators = extract_decorators(&member.decorators);
            let mut flags = flags_from_modifiers(&member.modifiers);
            let is_static = flags.has(ElementFlags::STATIC);
            if !is_static {
                flags.set(ElementFlags::INSTANCE);
            }
            match &member.kind {
                ast::ClassMemberKind::Field {
                    type_node,
                    initializer,
                } if !is_static => {
                    let Some(type_node) = type_node else {
                        self.messages.error(
                            DiagnosticCode::TypeExpected,
                            format!("Field '{}' requires a type annotation", member.name),
                            &member.location,
                        );
                        continue;
                    };
                    let Some(ty) = self.resolve_type(type_node, &contextual, true) else {
                        continue;
                    };
                    // Natural alignment, capped at pointer size.
                    let align = ty.size.min(self.pointer_size).max(1);
                    memory_offset = (memory_offset + align - 1) & !(align - 1);
                    let field_id = self.add_element(ElementData {
                        kind: ElementKind::Field(Field {
                            ty,
                            memory_offset,
                            initializer: initializer.clone(),
                            parameter_index: None,
                        }),
                        name: member.name.clone(),
                        internal_name: format!("{}#{}", internal_name, member.name),
                        flags,
                        decorators: decorators.flags,
                        parent: Some(class_id),
                        location: member.location.clone(),
                    });
                    let field_size = self.field(field_id).ty.size;
                    memory_offset += field_size;
                    let class = self.class_mut(class_id);
                    class.members.insert(member.name.clone(), field_id);
                    class.fields.push(field_id);
                }
                ast::ClassMemberKind::Field {
                    type_node,
                    initializer,
                } => {
                    // Static field: a global scoped to the class.
                    let ty = match type_node {
                        Some(node) => self.resolve_type(node, &contextual, true),
                        None => None,
                    };
                    let global_id = self.add_element(ElementData {
                        kind: ElementKind::Global(Global {
                            declaration: Some(ast::VariableDeclarator {
                                name: member.name.clone(),
                                type_node: type_node.clone(),
                                initializer: initializer.clone(),
                                location: member.location.clone(),
                            }),
                            ty,
                            constant_value: None,
                            external_name: None,
                        }),
                        name: member.name.clone(),
                        internal_name: format!("{}.{}", internal_name, member.name),
                        flags,
                        decorators: decorators.flags,
                        parent: Some(class_id),
                        location: member.location.clone(),
                    });
                    self.class_mut(class_id)
                        .statics
                        .insert(member.name.clone(), global_id);
                }
                ast::ClassMemberKind::Method(function) => {
                    if !function.type_parameters.is_empty() {
                        flags.set(ElementFlags::GENERIC);
                    }
                    let method_id = self.add_element(ElementData {
                        kind: ElementKind::FunctionPrototype(FunctionPrototype {
                            declaration: function.clone(),
                            class_prototype: Some(class_id),
                            instances: FxHashMap::default(),
                            operator_kind: decorators.operator_kind,
                            external_name: decorators.external_name.clone(),
                        }),
                        name: member.name.clone(),
                        internal_name: format!(
                            "{}{}{}",
                            internal_name,
                            if is_static { "." } else { "#" },
                            member.name
                        ),
                        flags,
                        decorators: decorators.flags,
                        parent: Some(class_id),
                        location: member.location.clone(),
                    });
                    let class = self.class_mut(class_id);
                    if is_static {
                        class.statics.insert(member.name.clone(), method_id);
                    } else {
                        class.members.insert(member.name.clone(), method_id);
                    }
                    if let Some(kind) = decorators.operator_kind {
                        class.operators.insert(kind, method_id);
                    }
                }
                ast::ClassMemberKind::Constructor(function) => {
                    flags.set(ElementFlags::CONSTRUCTOR);
                    flags.set(ElementFlags::INSTANCE);
                    // Parameter-declared fields extend the layout.
                    for (index, parameter) in function.parameters.iter().enumerate() {
                        if !parameter.is_field {
                            continue;
                        }
                        let Some(ty) = self.resolve_type(&parameter.type_node, &contextual, true)
                        else {
                            continue;
                        };
                        let align = ty.size.min(self.pointer_size).max(1);
                        memory_offset = (memory_offset + align - 1) & !(align - 1);
                        let field_id = self.add_element(ElementData {
                            kind: ElementKind::Field(Field {
                                ty,
                                memory_offset,
                                initializer: None,
                                parameter_index: Some(index),
                            }),
                            name: parameter.name.clone(),
                            internal_name: format!("{}#{}", internal_name, parameter.name),
                            flags: {
                                let mut f = ElementFlags::NONE;
                                f.set(ElementFlags::INSTANCE);
                                f
                            },
                            decorators: DecoratorFlags::NONE,
                            parent: Some(class_id),
                            location: parameter.location.clone(),
                        });
                        let field_size = self.field(field_id).ty.size;
                        memory_offset += field_size;
                        let class = self.class_mut(class_id);
                        class.members.insert(parameter.name.clone(), field_id);
                        class.fields.push(field_id);
                    }
                    let ctor_id = self.add_element(ElementData {
                        kind: ElementKind::FunctionPrototype(FunctionPrototype {
                            declaration: function.clone(),
                            class_prototype: Some(class_id),
                            instances: FxHashMap::default(),
                            operator_kind: None,
                            external_name: None,
                        }),
                        name: "constructor".to_string(),
                        internal_name: format!("{}#constructor", internal_name),
                        flags,
                        decorators: decorators.flags,
                        parent: Some(class_id),
                        location: member.location.clone(),
                    });
                    self.class_mut(class_id).constructor = Some(ctor_id);
                }
                ast::ClassMemberKind::Getter(function)
                | ast::ClassMemberKind::Setter(function) => {
                    let is_getter = matches!(member.kind, ast::ClassMemberKind::Getter(_));
                    if is_getter {
                        flags.set(ElementFlags::GETTER);
                    } else {
                        flags.set(ElementFlags::SETTER);
                    }
                    let accessor_id = self.add_element(ElementData {
                        kind: ElementKind::FunctionPrototype(FunctionPrototype {
                            declaration: function.clone(),
                            class_prototype: Some(class_id),
                            instances: FxHashMap::default(),
                            operator_kind: None,
                            external_name: None,
                        }),
                        name: member.name.clone(),
                        internal_name: format!(
                            "{}{}{}{}",
                            internal_name,
                            if is_static { "." } else { "#" },
                            if is_getter { "get:" } else { "set:" },
                            member.name
                        ),
                        flags,
                        decorators: decorators.flags,
                        parent: Some(class_id),
                        location: member.location.clone(),
                    });
                    let class = self.class_mut(class_id);
                    let map = if is_static {
                        &mut class.statics
                    } else {
                        &mut class.members
                    };
                    let property_id = map.get(&member.name).copied();
                    match property_id {
                        Some(existing)
                            if matches!(
                                self.element(existing).kind,
                                ElementKind::Property(_)
                            ) =>
                        {
                            if let ElementKind::Property(p) =
                                &mut self.element_mut(existing).kind
                            {
                                if is_getter {
                                    p.getter = Some(accessor_id);
                                } else {
                                    p.setter = Some(accessor_id);
                                }
                            }
                        }
                        _ => {
                            let property = self.add_element(ElementData {
                                kind: ElementKind::Property(Property {
                                    getter: is_getter.then_some(accessor_id),
                                    setter: (!is_getter).then_some(accessor_id),
                                }),
                                name: member.name.clone(),
                                internal_name: format!("{}#{}", internal_name, member.name),
                                flags,
                                decorators: DecoratorFlags::NONE,
                                parent: Some(class_id),
                                location: member.location.clone(),
                            });
                            let class = self.class_mut(class_id);
                            let map = if is_static {
                                &mut class.statics
                            } else {
                                &mut class.members
                            };
                            map.insert(member.name.clone(), property);
                        }
                    }
                }
            }
        }

        self.class_mut(class_id).instance_size = memory_offset;
        Some(class_id)
    }

    // =========================================================================
    // Member lookup
    // =========================================================================

    /// Look up an instance member by name, walking the base-class chain.
    pub fn class_member(&self, class_id: ElementId, name: &str) -> Option<ElementId> {
        let class = self.class(class_id);
        if let Some(&member) = class.members.get(name) {
            return Some(member);
        }
        class
            .base
            .and_then(|base| self.class_member(base, name))
    }

    /// Look up a static member by name, walking the base-class chain.
    pub fn class_static(&self, class_id: ElementId, name: &str) -> Option<ElementId> {
        let class = self.class(class_id);
        if let Some(&member) = class.statics.get(name) {
            return Some(member);
        }
        class
            .base
            .and_then(|base| self.class_static(base, name))
    }

    /// Look up an operator overload by kind, walking the base-class chain.
    pub fn class_operator(&self, class_id: ElementId, kind: OperatorKind) -> Option<ElementId> {
        let class = self.class(class_id);
        if let Some(&method) = class.operators.get(&kind) {
            return Some(method);
        }
        class
            .base
            .and_then(|base| self.class_operator(base, kind))
    }

    /// Look up a member of a namespace element.
    pub fn namespace_member(&self, namespace_id: ElementId, name: &str) -> Option<ElementId> {
        match &self.element(namespace_id).kind {
            ElementKind::Namespace(ns) => ns.members.get(name).copied(),
            _ => None,
        }
    }

    /// Look up an enum member by name.
    pub fn enum_member(&self, enum_id: ElementId, name: &str) -> Option<ElementId> {
        match &self.element(enum_id).kind {
            ElementKind::Enum(e) => e
                .members
                .iter()
                .copied()
                .find(|&member| self.element(member).name == name),
            _ => None,
        }
    }
}
