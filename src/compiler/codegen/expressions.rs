//! Expression lowering.
//!
//! Every handler follows one pattern: compile the operands toward a
//! contextual type, consult operator overloads when the left side is a
//! reference, promote to the common arithmetic type, emit the IR op
//! dispatched over the concrete type kind, and leave the expression's
//! source type in `current_type`.
//!
//! The public entry is [`Compiler::compile_expression`]; it reconciles
//! the produced type with the contextual type afterwards (implicit or
//! explicit conversion, optional small-integer wrap).

use crate::compiler::ast;
use crate::compiler::codegen::{Compiler, ConversionKind};
use crate::compiler::diagnostics::{CompileError, DiagnosticCode};
use crate::compiler::flow::Flow;
use crate::compiler::flow::FlowFlags;
use crate::compiler::program::{
    ElementFlags, ElementId, ElementKind, ElementTag, OperatorKind,
};
use crate::compiler::tokens::TextLocation;
use crate::compiler::types::{common_compatible, Type, TypeKind};
use crate::compiler::wir::nodes::{
    BinaryOp, ExprNode, ExprRef, Literal, NativeType, UnaryOp,
};

impl<'a> Compiler<'a> {
    // =========================================================================
    // Entry
    // =========================================================================

    /// Compile an expression toward `contextual_type`.
    ///
    /// After this returns, `current_type` equals the contextual type
    /// whenever a conversion was requested (unless an error was emitted);
    /// with `ConversionKind::None` it is the expression's own type and
    /// the contextual type only guided literal inference.
    pub fn compile_expression(
        &mut self,
        expression: &ast::Expression,
        contextual_type: &Type,
        conversion: ConversionKind,
        wrap: bool,
    ) -> Result<ExprRef, CompileError> {
        let mut expr = self.compile_expression_inner(expression, contextual_type)?;
        let from = self.current_type.clone();
        if conversion != ConversionKind::None && from != *contextual_type {
            expr = self.convert(
                expr,
                &from,
                contextual_type,
                conversion,
                wrap,
                &expression.location,
            );
        } else if wrap {
            expr = self.ensure_small_integer_wrap(expr, &from);
        }
        if self.options.source_map {
            self.module.set_debug_location(expr, &expression.location);
        }
        Ok(expr)
    }

    fn compile_expression_inner(
        &mut self,
        expression: &ast::Expression,
        contextual_type: &Type,
    ) -> Result<ExprRef, CompileError> {
        let location = &expression.location;
        match &expression.kind {
            ast::ExpressionKind::IntegerLiteral(value) => {
                Ok(self.compile_integer_literal(*value, contextual_type))
            }
            ast::ExpressionKind::FloatLiteral(value) => {
                Ok(self.compile_float_literal(*value, contextual_type))
            }
            ast::ExpressionKind::StringLiteral(value) => {
                Ok(self.compile_string_literal(value, contextual_type))
            }
            ast::ExpressionKind::ArrayLiteral(elements) => {
                self.compile_array_literal(elements, contextual_type, location)
            }
            ast::ExpressionKind::True => {
                self.current_type = self.bool_type();
                Ok(self.module.i32(1))
            }
            ast::ExpressionKind::False => {
                self.current_type = self.bool_type();
                Ok(self.module.i32(0))
            }
            ast::ExpressionKind::Null => {
                self.current_type = if contextual_type.is_reference() {
                    contextual_type.as_nullable()
                } else {
                    self.usize_type()
                };
                Ok(self.pointer_zero())
            }
            ast::ExpressionKind::This => self.compile_this(location),
            ast::ExpressionKind::Super => self.compile_super(location),
            ast::ExpressionKind::Identifier(name) => {
                self.compile_identifier(name, contextual_type, location)
            }
            ast::ExpressionKind::Binary { op, left, right } => {
                self.compile_binary(*op, left, right, contextual_type, location)
            }
            ast::ExpressionKind::Unary { op, operand } => {
                self.compile_unary(*op, operand, contextual_type, location)
            }
            ast::ExpressionKind::UnaryPostfix { op, operand } => {
                self.compile_unary_postfix(*op, operand, contextual_type, location)
            }
            ast::ExpressionKind::Assignment { op, target, value } => {
                self.compile_assignment(*op, target, value, contextual_type, location)
            }
            ast::ExpressionKind::Call {
                callee,
                type_arguments,
                arguments,
            } => self.compile_call_expression(
                callee,
                type_arguments,
                arguments,
                contextual_type,
                location,
            ),
            ast::ExpressionKind::New {
                callee,
                type_arguments,
                arguments,
            } => self.compile_new(callee, type_arguments, arguments, location),
            ast::ExpressionKind::PropertyAccess { object, property } => {
                self.compile_property_access(object, property, contextual_type, location)
            }
            ast::ExpressionKind::ElementAccess { object, index } => {
                self.compile_element_access(object, index, contextual_type, location)
            }
            ast::ExpressionKind::Ternary {
                condition,
                if_then,
                if_else,
            } => self.compile_ternary(condition, if_then, if_else, contextual_type),
            ast::ExpressionKind::Comma(expressions) => {
                self.compile_comma(expressions, contextual_type)
            }
            ast::ExpressionKind::Parenthesized(inner) => {
                self.compile_expression_inner(inner, contextual_type)
            }
            ast::ExpressionKind::NonNullAssertion(inner) => {
                let expr = self.compile_expression(inner, contextual_type, ConversionKind::None, false)?;
                self.current_type.nullable = false;
                Ok(expr)
            }
            ast::ExpressionKind::As { operand, type_node } => {
                let contextual_args = self.current_flow.contextual_type_arguments.clone();
                match self.program.resolve_type(type_node, &contextual_args, true) {
                    Some(target) => {
                        self.compile_expression(operand, &target, ConversionKind::Explicit, false)
                    }
                    None => Ok(self.unreachable_with_type(contextual_type)),
                }
            }
            ast::ExpressionKind::InstanceOf { operand, type_node } => {
                self.compile_instance_of(operand, type_node)
            }
            ast::ExpressionKind::Void(inner) => {
                let void = self.void_type();
                let dropped =
                    self.compile_expression(inner, &void, ConversionKind::Implicit, false)?;
                self.current_type = void;
                Ok(dropped)
            }
        }
    }

    // =========================================================================
    // Literals
    // =========================================================================

    fn compile_integer_literal(&mut self, value: i64, contextual_type: &Type) -> ExprRef {
        // The contextual type wins when the literal fits it; otherwise
        // the literal decides its own width.
        if contextual_type.is_float() {
            return self.compile_float_literal(value as f64, contextual_type);
        }
        let ty = if contextual_type.is_integer()
            && !contextual_type.is_void()
            && !contextual_type.is_reference()
            && integer_literal_fits(value, contextual_type)
        {
            contextual_type.clone()
        } else if i32::try_from(value).is_ok() {
            self.i32_type()
        } else {
            self.program.type_of(TypeKind::I64)
        };
        self.current_type = ty.clone();
        match ty.native_type() {
            NativeType::I64 => self.module.i64(value),
            _ => self.module.i32(value as i32),
        }
    }

    fn compile_float_literal(&mut self, value: f64, contextual_type: &Type) -> ExprRef {
        if contextual_type.kind == TypeKind::F32 {
            self.current_type = self.program.type_of(TypeKind::F32);
            self.module.f32(value as f32)
        } else {
            self.current_type = self.program.type_of(TypeKind::F64);
            self.module.f64(value)
        }
    }

    fn compile_string_literal(&mut self, value: &str, _contextual_type: &Type) -> ExprRef {
        let pointer = self.ensure_static_string(value);
        // The literal types as `String` when a String class is declared,
        // otherwise as a raw pointer.
        self.current_type = match self.program.lookup("String") {
            Some(prototype)
                if matches!(
                    self.program.element(prototype).kind,
                    ElementKind::ClassPrototype(_)
                ) =>
            {
                match self.program.resolve_class(prototype, &[]) {
                    Some(class) => {
                        Type::reference(class, self.options.pointer_size(), false)
                    }
                    None => self.usize_type(),
                }
            }
            _ => self.usize_type(),
        };
        let literal = self.pointer_literal(pointer);
        self.module.constant(literal)
    }

    fn compile_array_literal(
        &mut self,
        elements: &[ast::Expression],
        contextual_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        // Element type comes from a contextual `Array<T>` when present,
        // else from the first element.
        let contextual_element = contextual_type
            .class_reference
            .map(|class| self.program.class(class).type_arguments.clone())
            .and_then(|args| args.first().cloned());

        let mut values = Vec::with_capacity(elements.len());
        let mut element_type = contextual_element.clone();
        for element in elements {
            let (ctx, conversion) = match &element_type {
                Some(ty) => (ty.clone(), ConversionKind::Implicit),
                None => (self.void_type(), ConversionKind::None),
            };
            let compiled = self.compile_expression(element, &ctx, conversion, false)?;
            if element_type.is_none() {
                element_type = Some(self.current_type.clone());
            }
            match self.module.precompute(compiled) {
                Some(value) => values.push(value),
                None => {
                    // Static data only; runtime-populated arrays need the
                    // runtime's Array implementation.
                    return Ok(self.operation_not_supported(
                        "A non-constant array literal",
                        location,
                        contextual_type,
                    ));
                }
            }
        }
        let element_type = element_type.unwrap_or_else(|| self.i32_type());
        let pointer = self.compile_static_array(&element_type, &values)?;
        self.current_type = if contextual_type.is_reference() {
            contextual_type.clone()
        } else {
            self.usize_type()
        };
        let literal = self.pointer_literal(pointer);
        Ok(self.module.constant(literal))
    }

    // =========================================================================
    // this / super
    // =========================================================================

    fn compile_this(&mut self, location: &TextLocation) -> Result<ExprRef, CompileError> {
        // Inside an inline expansion, `this` is a scoped alias.
        if let Some(scoped) = self.current_flow.scoped_local("this") {
            let ty = scoped.ty.clone();
            let index = scoped.index;
            if let Some(index) = index {
                self.current_type = ty.clone();
                return Ok(self.module.get_local(index, ty.native_type()));
            }
        }
        let data = self.program.element(self.current_function);
        let flags = data.flags;
        let this_type = self
            .program
            .function(self.current_function)
            .signature
            .this_type
            .clone();
        let Some(this_type) = this_type else {
            self.error(
                DiagnosticCode::ThisOutsideInstanceContext,
                "'this' can only be used in an instance context",
                location,
            );
            let usize_type = self.usize_type();
            return Ok(self.unreachable_with_type(&usize_type));
        };
        let pointer = self.pointer_native_type();
        // A constructor's `this` allocates lazily: the first read gives
        // the incoming pointer a value if it was null.
        if flags.has(ElementFlags::CONSTRUCTOR)
            && !self.current_flow.flags.has(FlowFlags::ALLOCATES)
        {
            let class = this_type
                .class_reference
                .ok_or_else(|| CompileError::internal("constructor without a class"))?;
            let allocate = self.make_conditional_allocate(class, location)?;
            self.current_flow.flags.set(FlowFlags::ALLOCATES);
            self.current_type = this_type;
            return Ok(self.module.tee_local(0, allocate, pointer));
        }
        self.current_type = this_type;
        Ok(self.module.get_local(0, pointer))
    }

    fn compile_super(&mut self, location: &TextLocation) -> Result<ExprRef, CompileError> {
        let this_type = self
            .program
            .function(self.current_function)
            .signature
            .this_type
            .clone();
        let base = this_type
            .as_ref()
            .and_then(|ty| ty.class_reference)
            .and_then(|class| self.program.class(class).base);
        let Some(base) = base else {
            self.error(
                DiagnosticCode::SuperOutsideDerivedClass,
                "'super' can only be used in a derived class",
                location,
            );
            let usize_type = self.usize_type();
            return Ok(self.unreachable_with_type(&usize_type));
        };
        // `super` is `this` viewed through the base type, possibly via an
        // inline alias.
        if let Some(scoped) = self.current_flow.scoped_local("this") {
            if let Some(index) = scoped.index {
                self.current_type =
                    Type::reference(base, self.options.pointer_size(), false);
                let pointer = self.pointer_native_type();
                return Ok(self.module.get_local(index, pointer));
            }
        }
        self.current_type = Type::reference(base, self.options.pointer_size(), false);
        let pointer = self.pointer_native_type();
        Ok(self.module.get_local(0, pointer))
    }

    // =========================================================================
    // Identifiers
    // =========================================================================

    fn compile_identifier(
        &mut self,
        name: &str,
        contextual_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        // Innermost first: flow scope, then function locals, then the
        // enclosing enum's members, then file scope.
        if let Some(scoped) = self.current_flow.scoped_local(name) {
            let scoped = scoped.clone();
            if let Some(value) = scoped.constant {
                // Virtual local: substitute the literal.
                self.current_type = scoped.ty;
                return Ok(self.module.constant(value));
            }
            if let Some(index) = scoped.index {
                self.current_type = scoped.ty.clone();
                return Ok(self.module.get_local(index, scoped.ty.native_type()));
            }
        }
        if let Some(local) = self
            .program
            .function(self.current_function)
            .local_by_name(name)
        {
            let index = local.index;
            let ty = local.ty.clone();
            self.current_type = ty.clone();
            return Ok(self.module.get_local(index, ty.native_type()));
        }
        if let Some(enum_id) = self.current_enum {
            if let Some(member) = self.program.enum_member(enum_id, name) {
                return self.compile_enum_value_access(member);
            }
        }
        let Some(element) = self.program.lookup(name) else {
            self.error(
                DiagnosticCode::UnresolvableIdentifier,
                format!("Cannot find name '{}'", name),
                location,
            );
            return Ok(self.unreachable_with_type(contextual_type));
        };
        self.compile_element_value(element, contextual_type, location)
    }

    /// Compile a read of a named element: a global's value, an enum
    /// value, or a function turned into a table index.
    pub(crate) fn compile_element_value(
        &mut self,
        element: ElementId,
        contextual_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        match self.program.element(element).kind.tag() {
            ElementTag::Global => self.compile_global_access(element, contextual_type),
            ElementTag::EnumValue => self.compile_enum_value_access(element),
            ElementTag::FunctionPrototype => {
                let Some(instance) = self.program.resolve_function(element, &[], None) else {
                    return Ok(self.unreachable_with_type(contextual_type));
                };
                self.compile_function_reference(instance)
            }
            ElementTag::Function => self.compile_function_reference(element),
            _ => {
                let kind = self.program.element(element).kind.kind_name();
                self.error(
                    DiagnosticCode::UnresolvableIdentifier,
                    format!("A {} cannot be used as a value", kind),
                    location,
                );
                Ok(self.unreachable_with_type(contextual_type))
            }
        }
    }

    fn compile_global_access(
        &mut self,
        element: ElementId,
        _contextual_type: &Type,
    ) -> Result<ExprRef, CompileError> {
        self.compile_global(element)?;
        let data = self.program.element(element);
        let flags = data.flags;
        let internal_name = data.internal_name.clone();
        let simple_name = data.name.clone();
        let global = self.program.global(element);
        let ty = global.ty.clone().unwrap_or_else(|| self.i32_type());
        let constant_value = global.constant_value;
        if flags.has(ElementFlags::INLINED) {
            // Inlined constant: substitute the value; a wider contextual
            // type extends it via the conversion step.
            self.current_type = ty;
            let value = constant_value.unwrap_or(Literal::I32(0));
            return Ok(self.module.constant(value));
        }
        // Builtin-ambient globals resolve to compiler-provided module
        // globals by their simple name.
        let global_name = if flags.has(ElementFlags::AMBIENT)
            && data
                .decorators
                .has(crate::compiler::program::DecoratorFlags::BUILTIN)
        {
            simple_name
        } else {
            internal_name
        };
        self.current_type = ty.clone();
        Ok(self.module.get_global(global_name, ty.native_type()))
    }

    pub(crate) fn compile_enum_value_access(
        &mut self,
        member: ElementId,
    ) -> Result<ExprRef, CompileError> {
        // Make sure the owning enum evaluated its members.
        if let Some(parent) = self.program.element(member).parent {
            self.compile_enum(parent)?;
        }
        let data = self.program.element(member);
        self.current_type = self.i32_type();
        if data.flags.has(ElementFlags::INLINED) {
            let value = self
                .program
                .enum_value(member)
                .constant_value
                .unwrap_or(Literal::I32(0));
            return Ok(self.module.constant(value));
        }
        let internal_name = data.internal_name.clone();
        Ok(self.module.get_global(internal_name, NativeType::I32))
    }

    /// A function used as a value becomes its table index.
    fn compile_function_reference(
        &mut self,
        instance: ElementId,
    ) -> Result<ExprRef, CompileError> {
        self.compile_function(instance)?;
        let index = self.ensure_function_table_entry(instance)?;
        let signature = self.program.function(instance).signature.clone();
        self.current_type = Type::function(signature, self.options.pointer_size());
        Ok(self.module.i32(index as i32))
    }

    // =========================================================================
    // Property and element access
    // =========================================================================

    /// Resolve a dotted path rooted in a namespace, enum or class
    /// prototype without compiling anything. Returns the named container
    /// element when the path is static.
    pub(crate) fn resolve_static_path(&self, expression: &ast::Expression) -> Option<ElementId> {
        match &expression.kind {
            ast::ExpressionKind::Identifier(name) => {
                if self.current_flow.scoped_local(name).is_some() {
                    return None;
                }
                if self
                    .program
                    .function(self.current_function)
                    .local_by_name(name)
                    .is_some()
                {
                    return None;
                }
                let element = self.program.lookup(name)?;
                match self.program.element(element).kind.tag() {
                    ElementTag::Namespace | ElementTag::Enum | ElementTag::ClassPrototype => {
                        Some(element)
                    }
                    _ => None,
                }
            }
            ast::ExpressionKind::PropertyAccess { object, property } => {
                let container = self.resolve_static_path(object)?;
                let member = self.static_member(container, property)?;
                match self.program.element(member).kind.tag() {
                    ElementTag::Namespace | ElementTag::Enum | ElementTag::ClassPrototype => {
                        Some(member)
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Look up a member of a static container (namespace, enum, or class
    /// prototype's statics).
    pub(crate) fn static_member(&self, container: ElementId, name: &str) -> Option<ElementId> {
        match &self.program.element(container).kind {
            ElementKind::Namespace(_) => self.program.namespace_member(container, name),
            ElementKind::Enum(_) => self.program.enum_member(container, name),
            ElementKind::ClassPrototype(p) => {
                // Statics live on the (sole) resolved instance.
                let instance = p.instances.get("").copied()?;
                self.program.class_static(instance, name)
            }
            ElementKind::Class(_) => self.program.class_static(container, name),
            _ => None,
        }
    }

    fn compile_property_access(
        &mut self,
        object: &ast::Expression,
        property: &str,
        contextual_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        // Static path: Namespace.member, Enum.MEMBER, Class.static.
        if let Some(container) = self.resolve_static_path(object) {
            // Class prototypes need their instance resolved so statics
            // exist.
            if matches!(
                self.program.element(container).kind,
                ElementKind::ClassPrototype(_)
            ) {
                self.program.resolve_class(container, &[]);
            }
            let Some(member) = self.static_member(container, property) else {
                let container_name = self.program.element(container).name.clone();
                self.error(
                    DiagnosticCode::PropertyDoesNotExist,
                    format!(
                        "Property '{}' does not exist on '{}'",
                        property, container_name
                    ),
                    location,
                );
                return Ok(self.unreachable_with_type(contextual_type));
            };
            if self.program.element(member).kind.tag() == ElementTag::Property {
                let (getter, class) = match &self.program.element(member).kind {
                    ElementKind::Property(p) => (p.getter, self.program.element(member).parent),
                    _ => (None, None),
                };
                return self.compile_property_get(member, getter, None, class, location);
            }
            return self.compile_element_value(member, contextual_type, location);
        }

        // Instance path.
        let void = self.void_type();
        let object_expr = self.compile_expression(object, &void, ConversionKind::None, false)?;
        let object_type = self.current_type.clone();
        let Some(class) = object_type.class_reference else {
            self.error(
                DiagnosticCode::PropertyDoesNotExist,
                format!("Property '{}' does not exist on type '{}'", property, object_type),
                location,
            );
            return Ok(self.unreachable_with_type(contextual_type));
        };
        let Some(member) = self.program.class_member(class, property) else {
            self.error(
                DiagnosticCode::PropertyDoesNotExist,
                format!("Property '{}' does not exist on the class", property),
                location,
            );
            return Ok(self.unreachable_with_type(contextual_type));
        };
        match self.program.element(member).kind.tag() {
            ElementTag::Field => {
                let field = self.program.field(member);
                let ty = field.ty.clone();
                let offset = field.memory_offset;
                self.current_type = ty.clone();
                Ok(self.module.load(
                    ty.size as u8,
                    ty.is_signed() && ty.is_integer(),
                    object_expr,
                    ty.native_type(),
                    offset,
                ))
            }
            ElementTag::Property => {
                let getter = match &self.program.element(member).kind {
                    ElementKind::Property(p) => p.getter,
                    _ => None,
                };
                self.compile_property_get(member, getter, Some(object_expr), Some(class), location)
            }
            ElementTag::FunctionPrototype => {
                self.error(
                    DiagnosticCode::NotCallable,
                    format!("Method '{}' can only be called", property),
                    location,
                );
                Ok(self.unreachable_with_type(contextual_type))
            }
            _ => {
                self.error(
                    DiagnosticCode::PropertyDoesNotExist,
                    format!("'{}' is not an instance property", property),
                    location,
                );
                Ok(self.unreachable_with_type(contextual_type))
            }
        }
    }

    fn compile_property_get(
        &mut self,
        property: ElementId,
        getter: Option<ElementId>,
        this_expr: Option<ExprRef>,
        class: Option<ElementId>,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        let Some(getter) = getter else {
            let name = self.program.element(property).name.clone();
            self.error(
                DiagnosticCode::PropertyDoesNotExist,
                format!("Property '{}' has no getter", name),
                location,
            );
            let i32_type = self.i32_type();
            return Ok(self.unreachable_with_type(&i32_type));
        };
        let class_for_resolution = if this_expr.is_some() { class } else { None };
        let Some(instance) = self
            .program
            .resolve_function(getter, &[], class_for_resolution)
        else {
            let i32_type = self.i32_type();
            return Ok(self.unreachable_with_type(&i32_type));
        };
        let operands = match this_expr {
            Some(this_expr) => vec![this_expr],
            None => Vec::new(),
        };
        self.make_call_direct(instance, operands, location)
    }

    fn compile_element_access(
        &mut self,
        object: &ast::Expression,
        index: &ast::Expression,
        contextual_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        let void = self.void_type();
        let object_expr = self.compile_expression(object, &void, ConversionKind::None, false)?;
        let object_type = self.current_type.clone();
        let getter = object_type
            .class_reference
            .and_then(|class| self.program.class_operator(class, OperatorKind::IndexedGet));
        let Some(getter) = getter else {
            self.error(
                DiagnosticCode::NotIndexable,
                format!("Type '{}' does not define an index signature", object_type),
                location,
            );
            return Ok(self.unreachable_with_type(contextual_type));
        };
        let class = object_type.class_reference;
        self.compile_operator_call(getter, class, object_expr, &[index], location)
    }
}

impl<'a> Compiler<'a> {
    // =========================================================================
    // Unary operators
    // =========================================================================

    fn compile_unary(
        &mut self,
        op: ast::UnaryOperator,
        operand: &ast::Expression,
        contextual_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        use ast::UnaryOperator as U;

        // Negated integer literals fold so constants stay constant.
        if op == U::Minus {
            if let ast::ExpressionKind::IntegerLiteral(value) = &operand.kind {
                return Ok(self.compile_integer_literal(-*value, contextual_type));
            }
            if let ast::ExpressionKind::FloatLiteral(value) = &operand.kind {
                return Ok(self.compile_float_literal(-*value, contextual_type));
            }
        }

        let hint = if contextual_type.is_void() {
            self.i32_type()
        } else {
            contextual_type.clone()
        };
        let expr = self.compile_expression(operand, &hint, ConversionKind::None, false)?;
        let ty = self.current_type.clone();

        // Operator overloads on references.
        if let Some(class) = ty.class_reference {
            let overload_kind = match op {
                U::Plus => Some(OperatorKind::Plus),
                U::Minus => Some(OperatorKind::Minus),
                U::Not => Some(OperatorKind::Not),
                U::BitNot => Some(OperatorKind::BitwiseNot),
                U::PrefixInc => Some(OperatorKind::PrefixInc),
                U::PrefixDec => Some(OperatorKind::PrefixDec),
            };
            if let Some(kind) = overload_kind {
                if let Some(method) = self.program.class_operator(class, kind) {
                    return self.compile_operator_call(method, Some(class), expr, &[], location);
                }
            }
            if op != U::Not {
                self.error(
                    DiagnosticCode::OperatorCannotBeApplied,
                    format!("Operator cannot be applied to type '{}'", ty),
                    location,
                );
                return Ok(self.unreachable_with_type(contextual_type));
            }
        }

        match op {
            U::Plus => {
                if !ty.is_integer() && !ty.is_float() {
                    self.error(
                        DiagnosticCode::OperatorCannotBeApplied,
                        format!("Unary '+' cannot be applied to type '{}'", ty),
                        location,
                    );
                }
                Ok(expr)
            }
            U::Minus => {
                if ty.is_float() {
                    let op = if ty.size == 4 {
                        UnaryOp::NegF32
                    } else {
                        UnaryOp::NegF64
                    };
                    return Ok(self.module.unary(op, expr));
                }
                let (zero, sub) = if ty.is_long() {
                    (self.module.i64(0), BinaryOp::SubI64)
                } else {
                    (self.module.i32(0), BinaryOp::SubI32)
                };
                Ok(self.module.binary(sub, zero, expr))
            }
            U::Not => {
                let falseish = self.make_is_falseish(expr, &ty);
                self.current_type = self.bool_type();
                Ok(falseish)
            }
            U::BitNot => {
                let (expr, ty) = if ty.is_float() {
                    // Bitwise work on floats goes through the integer
                    // companion.
                    let companion = ty.signed_companion(self.options.pointer_size());
                    let converted = self.convert(
                        expr,
                        &ty,
                        &companion,
                        ConversionKind::Explicit,
                        false,
                        location,
                    );
                    (converted, companion)
                } else {
                    (expr, ty)
                };
                let (minus_one, xor) = if ty.is_long() {
                    (self.module.i64(-1), BinaryOp::XorI64)
                } else {
                    (self.module.i32(-1), BinaryOp::XorI32)
                };
                self.current_type = ty;
                Ok(self.module.binary(xor, expr, minus_one))
            }
            U::PrefixInc | U::PrefixDec => {
                // `++x` behaves exactly like `x += 1`.
                let assignment_op = if op == U::PrefixInc {
                    ast::AssignmentOperator::Add
                } else {
                    ast::AssignmentOperator::Sub
                };
                let one = ast::Expression::integer(1, location.clone());
                self.compile_assignment(
                    assignment_op,
                    operand,
                    &one,
                    contextual_type,
                    location,
                )
            }
        }
    }

    fn compile_unary_postfix(
        &mut self,
        op: ast::PostfixOperator,
        operand: &ast::Expression,
        contextual_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        // With an unused result, postfix degenerates to prefix.
        if contextual_type.is_void() {
            let prefix = if op == ast::PostfixOperator::Inc {
                ast::UnaryOperator::PrefixInc
            } else {
                ast::UnaryOperator::PrefixDec
            };
            return self.compile_unary(prefix, operand, contextual_type, location);
        }

        // The old value survives in a temp while the slot updates.
        let ast::ExpressionKind::Identifier(name) = &operand.kind else {
            let void = self.void_type();
            return Ok(self.operation_not_supported(
                "A postfix update of this expression",
                location,
                &void,
            ));
        };
        let target = self.lookup_local(name);
        let Some((index, ty)) = target else {
            let void = self.void_type();
            return Ok(self.operation_not_supported(
                "A postfix update of a non-local",
                location,
                &void,
            ));
        };
        let native = ty.native_type();
        let temp = self
            .program
            .function_mut(self.current_function)
            .get_temp_local(ty.clone());
        let old = self.module.get_local(index, native);
        let save_old = self.module.set_local(temp, old);
        let old_again = self.module.get_local(temp, native);
        let delta = self.one_of(&ty);
        let updated = self.apply_delta(op, old_again, delta, &ty);
        let store = self.module.set_local(index, updated);
        self.current_flow.set_local_wrapped(index, false);
        let result = self.module.get_local(temp, native);
        self.program
            .function_mut(self.current_function)
            .free_temp_local(temp);
        self.current_type = ty;
        Ok(self
            .module
            .block(None, vec![save_old, store, result], native))
    }

    fn lookup_local(&self, name: &str) -> Option<(u32, Type)> {
        if let Some(scoped) = self.current_flow.scoped_local(name) {
            let index = scoped.index?;
            return Some((index, scoped.ty.clone()));
        }
        self.program
            .function(self.current_function)
            .local_by_name(name)
            .map(|local| (local.index, local.ty.clone()))
    }

    fn one_of(&mut self, ty: &Type) -> ExprRef {
        match ty.native_type() {
            NativeType::I64 => self.module.i64(1),
            NativeType::F32 => self.module.f32(1.0),
            NativeType::F64 => self.module.f64(1.0),
            _ => self.module.i32(1),
        }
    }

    fn apply_delta(
        &mut self,
        op: ast::PostfixOperator,
        value: ExprRef,
        delta: ExprRef,
        ty: &Type,
    ) -> ExprRef {
        let inc = op == ast::PostfixOperator::Inc;
        let bin_op = match ty.native_type() {
            NativeType::I64 => {
                if inc {
                    BinaryOp::AddI64
                } else {
                    BinaryOp::SubI64
                }
            }
            NativeType::F32 => {
                if inc {
                    BinaryOp::AddF32
                } else {
                    BinaryOp::SubF32
                }
            }
            NativeType::F64 => {
                if inc {
                    BinaryOp::AddF64
                } else {
                    BinaryOp::SubF64
                }
            }
            _ => {
                if inc {
                    BinaryOp::AddI32
                } else {
                    BinaryOp::SubI32
                }
            }
        };
        self.module.binary(bin_op, value, delta)
    }

    // =========================================================================
    // Binary operators
    // =========================================================================

    fn compile_binary(
        &mut self,
        op: ast::BinaryOperator,
        left: &ast::Expression,
        right: &ast::Expression,
        contextual_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        use ast::BinaryOperator as B;
        if op == B::LogicalAnd || op == B::LogicalOr {
            return self.compile_logical(op, left, right, contextual_type);
        }
        let hint = if contextual_type.is_void() {
            self.i32_type()
        } else {
            contextual_type.clone()
        };
        let lhs = self.compile_expression(left, &hint, ConversionKind::None, false)?;
        let lhs_type = self.current_type.clone();
        self.compile_binary_with_lhs(op, lhs, lhs_type, right, location)
    }

    /// The shared back half of binary lowering, entered with the left
    /// operand already compiled (also used by compound assignment).
    pub(crate) fn compile_binary_with_lhs(
        &mut self,
        op: ast::BinaryOperator,
        lhs: ExprRef,
        lhs_type: Type,
        right: &ast::Expression,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        use ast::BinaryOperator as B;

        // Operator overloads: a reference on the left dispatches to the
        // class's method with the right operand as argument.
        if let Some(class) = lhs_type.class_reference {
            if let Some(kind) = OperatorKind::from_binary_operator(op) {
                if let Some(method) = self.program.class_operator(class, kind) {
                    return self.compile_operator_call(
                        method,
                        Some(class),
                        lhs,
                        &[right],
                        location,
                    );
                }
            }
            // References keep pointer equality without an overload.
            if op == B::Eq || op == B::Ne {
                let rhs =
                    self.compile_expression(right, &lhs_type, ConversionKind::Implicit, false)?;
                let eq_op = if self.pointer_native_type() == NativeType::I64 {
                    if op == B::Eq { BinaryOp::EqI64 } else { BinaryOp::NeI64 }
                } else if op == B::Eq {
                    BinaryOp::EqI32
                } else {
                    BinaryOp::NeI32
                };
                self.current_type = self.bool_type();
                return Ok(self.module.binary(eq_op, lhs, rhs));
            }
            self.error(
                DiagnosticCode::OperatorCannotBeApplied,
                format!("Operator is not defined for type '{}'", lhs_type),
                location,
            );
            let bool_type = self.bool_type();
            return Ok(self.unreachable_with_type(&bool_type));
        }

        let rhs = self.compile_expression(right, &lhs_type, ConversionKind::None, false)?;
        let rhs_type = self.current_type.clone();

        let relational = matches!(op, B::Lt | B::Le | B::Gt | B::Ge);
        let comparison = relational || matches!(op, B::Eq | B::Ne);
        let Some(common) = common_compatible(&lhs_type, &rhs_type, relational) else {
            self.error(
                DiagnosticCode::ArithmeticOperandsExpected,
                format!(
                    "Operator cannot be applied to types '{}' and '{}'",
                    lhs_type, rhs_type
                ),
                location,
            );
            let result = if comparison { self.bool_type() } else { lhs_type };
            return Ok(self.unreachable_with_type(&result));
        };

        // Float `**` and `%` lower to Math calls instead of IR ops.
        if common.is_float() {
            if op == B::Pow {
                return self.compile_math_call(
                    "pow", &common, lhs, &lhs_type, rhs, &rhs_type, location,
                );
            }
            if op == B::Rem {
                return self.compile_math_call(
                    "mod", &common, lhs, &lhs_type, rhs, &rhs_type, location,
                );
            }
        } else if op == B::Pow {
            let i32_type = self.i32_type();
            return Ok(self.operation_not_supported(
                "Integer exponentiation",
                location,
                &i32_type,
            ));
        }

        // Width- and sign-sensitive ops need honest operand bits; the
        // unsigned shift clears the sign through the unsigned companion.
        let wrap_operands = comparison || matches!(op, B::Div | B::Rem | B::Shr);
        let operand_type = if op == B::ShrU && common.is_small_integer() {
            common.unsigned_companion(self.options.pointer_size())
        } else {
            common.clone()
        };
        let lhs = self.convert(
            lhs,
            &lhs_type,
            &operand_type,
            ConversionKind::Explicit,
            wrap_operands || op == B::ShrU,
            location,
        );
        let rhs = self.convert(
            rhs,
            &rhs_type,
            &operand_type,
            ConversionKind::Explicit,
            wrap_operands,
            location,
        );

        let Some(bin_op) = select_binary_op(op, &operand_type) else {
            self.error(
                DiagnosticCode::OperatorCannotBeApplied,
                format!("Operator cannot be applied to type '{}'", common),
                location,
            );
            let result = if comparison { self.bool_type() } else { common };
            return Ok(self.unreachable_with_type(&result));
        };
        self.current_type = if comparison { self.bool_type() } else { common };
        Ok(self.module.binary(bin_op, lhs, rhs))
    }

    fn compile_math_call(
        &mut self,
        name: &str,
        common: &Type,
        lhs: ExprRef,
        lhs_type: &Type,
        rhs: ExprRef,
        rhs_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        let (key, namespace) = match (name, common.size) {
            ("pow", 4) => ("pow_f32", "Mathf"),
            ("pow", _) => ("pow_f64", "Math"),
            ("mod", 4) => ("mod_f32", "Mathf"),
            (_, _) => ("mod_f64", "Math"),
        };
        let Some(instance) = self.resolve_math_function(key, namespace, name, location) else {
            self.error(
                DiagnosticCode::OperationNotSupported,
                format!(
                    "'{}.{}' must be declared to use this operator on floats",
                    namespace, name
                ),
                location,
            );
            return Ok(self.unreachable_with_type(common));
        };
        let lhs = self.convert(lhs, lhs_type, common, ConversionKind::Explicit, false, location);
        let rhs = self.convert(rhs, rhs_type, common, ConversionKind::Explicit, false, location);
        self.make_call_direct(instance, vec![lhs, rhs], location)
    }

    /// Short-circuit `&&` / `||`: a side-effect-free left operand is
    /// re-emitted, anything else round-trips through a temp local.
    fn compile_logical(
        &mut self,
        op: ast::BinaryOperator,
        left: &ast::Expression,
        right: &ast::Expression,
        contextual_type: &Type,
    ) -> Result<ExprRef, CompileError> {
        let hint = if contextual_type.is_void() {
            self.bool_type()
        } else {
            contextual_type.clone()
        };
        let lhs = self.compile_expression(left, &hint, ConversionKind::None, false)?;
        let lhs_type = self.current_type.clone();
        let rhs = self.compile_expression(right, &lhs_type, ConversionKind::Implicit, false)?;

        let native = lhs_type.native_type();
        let (condition, lhs_value, used_temp) = match self.try_reemit(lhs) {
            Some(clone) => {
                let condition = self.make_is_trueish(clone, &lhs_type);
                (condition, lhs, None)
            }
            None => {
                let temp = self
                    .program
                    .function_mut(self.current_function)
                    .get_temp_local(lhs_type.clone());
                let teed = self.module.tee_local(temp, lhs, native);
                let condition = self.make_is_trueish(teed, &lhs_type);
                let reread = self.module.get_local(temp, native);
                (condition, reread, Some(temp))
            }
        };
        let result = if op == ast::BinaryOperator::LogicalAnd {
            self.module.if_(condition, rhs, Some(lhs_value), native)
        } else {
            self.module.if_(condition, lhs_value, Some(rhs), native)
        };
        if let Some(temp) = used_temp {
            self.program
                .function_mut(self.current_function)
                .free_temp_local(temp);
        }
        self.current_type = lhs_type;
        Ok(result)
    }

    /// Re-emit a side-effect-free expression (constant, local or global
    /// read); returns `None` when the expression must not be evaluated
    /// twice.
    pub(crate) fn try_reemit(&mut self, expr: ExprRef) -> Option<ExprRef> {
        match self.module.node(expr).clone() {
            ExprNode::Const(value) => Some(self.module.constant(value)),
            ExprNode::GetLocal { index, ty } => Some(self.module.get_local(index, ty)),
            ExprNode::GetGlobal { name, ty } => Some(self.module.get_global(name, ty)),
            _ => None,
        }
    }

    // =========================================================================
    // Ternary, comma, instanceof
    // =========================================================================

    fn compile_ternary(
        &mut self,
        condition: &ast::Expression,
        if_then: &ast::Expression,
        if_else: &ast::Expression,
        contextual_type: &Type,
    ) -> Result<ExprRef, CompileError> {
        let bool_type = self.bool_type();
        let condition_expr =
            self.compile_expression(condition, &bool_type, ConversionKind::None, false)?;
        let condition_type = self.current_type.clone();
        let condition_expr = self.make_is_trueish(condition_expr, &condition_type);

        self.current_flow = Flow::fork(std::mem::take(&mut self.current_flow));
        let (then_expr, then_type) = {
            let (ctx, conversion) = if contextual_type.is_void() {
                (self.void_type(), ConversionKind::None)
            } else {
                (contextual_type.clone(), ConversionKind::Implicit)
            };
            let compiled = self.compile_expression(if_then, &ctx, conversion, false)?;
            (compiled, self.current_type.clone())
        };
        let (parent, then_flow) = std::mem::take(&mut self.current_flow).free();
        self.current_flow = parent;

        self.current_flow = Flow::fork(std::mem::take(&mut self.current_flow));
        let else_expr =
            self.compile_expression(if_else, &then_type, ConversionKind::Implicit, false)?;
        let (mut parent, else_flow) = std::mem::take(&mut self.current_flow).free();
        parent.inherit_mutual(&then_flow, &else_flow);
        self.current_flow = parent;

        self.current_type = then_type.clone();
        Ok(self
            .module
            .if_(condition_expr, then_expr, Some(else_expr), then_type.native_type()))
    }

    fn compile_comma(
        &mut self,
        expressions: &[ast::Expression],
        contextual_type: &Type,
    ) -> Result<ExprRef, CompileError> {
        let Some((last_expression, rest)) = expressions.split_last() else {
            self.current_type = self.void_type();
            return Ok(self.module.nop());
        };
        let mut children = Vec::with_capacity(expressions.len());
        let void = self.void_type();
        for expression in rest {
            children.push(self.compile_expression(
                expression,
                &void,
                ConversionKind::Implicit,
                false,
            )?);
        }
        let last = self.compile_expression(
            last_expression,
            contextual_type,
            ConversionKind::None,
            false,
        )?;
        let ty = self.module.expr_type(last);
        children.push(last);
        Ok(self.module.block(None, children, ty))
    }

    fn compile_instance_of(
        &mut self,
        operand: &ast::Expression,
        type_node: &ast::TypeNode,
    ) -> Result<ExprRef, CompileError> {
        let void = self.void_type();
        let operand_expr = self.compile_expression(operand, &void, ConversionKind::None, false)?;
        let operand_type = self.current_type.clone();
        let contextual_args = self.current_flow.contextual_type_arguments.clone();
        let target = self.program.resolve_type(type_node, &contextual_args, true);
        let bool_type = self.bool_type();
        let Some(target) = target else {
            return Ok(self.unreachable_with_type(&bool_type));
        };

        // Without runtime type information the answer is decided at
        // compile time: same class or a base of it.
        let mut matches = false;
        if let (Some(mut class), Some(target_class)) =
            (operand_type.class_reference, target.class_reference)
        {
            loop {
                if class == target_class {
                    matches = true;
                    break;
                }
                match self.program.class(class).base {
                    Some(base) => class = base,
                    None => break,
                }
            }
        } else {
            matches = operand_type.kind == target.kind;
        }
        let result = self.module.i32(matches as i32);
        let dropped = self.module.drop_(operand_expr);
        self.current_type = bool_type;
        Ok(self
            .module
            .block(None, vec![dropped, result], NativeType::I32))
    }
}

// ============================================================================
// Operator selection
// ============================================================================

fn integer_literal_fits(value: i64, ty: &Type) -> bool {
    match ty.kind {
        TypeKind::Bool => value == 0 || value == 1,
        TypeKind::I8 => i8::try_from(value).is_ok(),
        TypeKind::U8 => u8::try_from(value).is_ok(),
        TypeKind::I16 => i16::try_from(value).is_ok(),
        TypeKind::U16 => u16::try_from(value).is_ok(),
        TypeKind::I32 => i32::try_from(value).is_ok(),
        TypeKind::U32 => u32::try_from(value).is_ok(),
        TypeKind::Isize | TypeKind::Usize => {
            if ty.size == 8 {
                true
            } else {
                u32::try_from(value).is_ok()
            }
        }
        _ => true,
    }
}

fn select_binary_op(op: ast::BinaryOperator, ty: &Type) -> Option<BinaryOp> {
    use ast::BinaryOperator as B;
    use BinaryOp::*;
    let signed = ty.is_signed();
    Some(match ty.native_type() {
        NativeType::I32 => match op {
            B::Add => AddI32,
            B::Sub => SubI32,
            B::Mul => MulI32,
            B::Div => {
                if signed {
                    DivSI32
                } else {
                    DivUI32
                }
            }
            B::Rem => {
                if signed {
                    RemSI32
                } else {
                    RemUI32
                }
            }
            B::BitAnd => AndI32,
            B::BitOr => OrI32,
            B::BitXor => XorI32,
            B::Shl => ShlI32,
            B::Shr => {
                if signed {
                    ShrSI32
                } else {
                    ShrUI32
                }
            }
            B::ShrU => ShrUI32,
            B::Eq => EqI32,
            B::Ne => NeI32,
            B::Lt => {
                if signed {
                    LtSI32
                } else {
                    LtUI32
                }
            }
            B::Le => {
                if signed {
                    LeSI32
                } else {
                    LeUI32
                }
            }
            B::Gt => {
                if signed {
                    GtSI32
                } else {
                    GtUI32
                }
            }
            B::Ge => {
                if signed {
                    GeSI32
                } else {
                    GeUI32
                }
            }
            B::Pow | B::LogicalAnd | B::LogicalOr => return None,
        },
        NativeType::I64 => match op {
            B::Add => AddI64,
            B::Sub => SubI64,
            B::Mul => MulI64,
            B::Div => {
                if signed {
                    DivSI64
                } else {
                    DivUI64
                }
            }
            B::Rem => {
                if signed {
                    RemSI64
                } else {
                    RemUI64
                }
            }
            B::BitAnd => AndI64,
            B::BitOr => OrI64,
            B::BitXor => XorI64,
            B::Shl => ShlI64,
            B::Shr => {
                if signed {
                    ShrSI64
                } else {
                    ShrUI64
                }
            }
            B::ShrU => ShrUI64,
            B::Eq => EqI64,
            B::Ne => NeI64,
            B::Lt => {
                if signed {
                    LtSI64
                } else {
                    LtUI64
                }
            }
            B::Le => {
                if signed {
                    LeSI64
                } else {
                    LeUI64
                }
            }
            B::Gt => {
                if signed {
                    GtSI64
                } else {
                    GtUI64
                }
            }
            B::Ge => {
                if signed {
                    GeSI64
                } else {
                    GeUI64
                }
            }
            B::Pow | B::LogicalAnd | B::LogicalOr => return None,
        },
        NativeType::F32 => match op {
            B::Add => AddF32,
            B::Sub => SubF32,
            B::Mul => MulF32,
            B::Div => DivF32,
            B::Eq => EqF32,
            B::Ne => NeF32,
            B::Lt => LtF32,
            B::Le => LeF32,
            B::Gt => GtF32,
            B::Ge => GeF32,
            _ => return None,
        },
        NativeType::F64 => match op {
            B::Add => AddF64,
            B::Sub => SubF64,
            B::Mul => MulF64,
            B::Div => DivF64,
            B::Eq => EqF64,
            B::Ne => NeF64,
            B::Lt => LtF64,
            B::Le => LeF64,
            B::Gt => GtF64,
            B::Ge => GeF64,
            _ => return None,
        },
        NativeType::None => return None,
    })
}

// ============================================================================
// Assignment
// ============================================================================

impl<'a> Compiler<'a> {
    /// Compile `target op= value`. The target decides the store shape:
    /// locals set or tee, globals emulate tee with a re-read, fields
    /// store at their offset, properties call their setter, indexed
    /// targets dispatch to the `[]=` overload. With a void contextual
    /// type the plain store form is used.
    pub(crate) fn compile_assignment(
        &mut self,
        op: ast::AssignmentOperator,
        target: &ast::Expression,
        value: &ast::Expression,
        contextual_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        match &target.kind {
            ast::ExpressionKind::Identifier(name) => {
                self.compile_name_assignment(op, name, value, contextual_type, location)
            }
            ast::ExpressionKind::PropertyAccess { object, property } => self
                .compile_property_assignment(
                    op,
                    object,
                    property,
                    value,
                    contextual_type,
                    location,
                ),
            ast::ExpressionKind::ElementAccess { object, index } => self
                .compile_indexed_assignment(op, object, index, value, contextual_type, location),
            _ => {
                self.error(
                    DiagnosticCode::NotAssignable,
                    "This expression is not a valid assignment target",
                    location,
                );
                Ok(self.unreachable_with_type(contextual_type))
            }
        }
    }

    fn compile_name_assignment(
        &mut self,
        op: ast::AssignmentOperator,
        name: &str,
        value: &ast::Expression,
        contextual_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        // Local slot (scoped or parameter)?
        if let Some(scoped) = self.current_flow.scoped_local(name) {
            let scoped = scoped.clone();
            if scoped.is_const || scoped.index.is_none() {
                self.error(
                    DiagnosticCode::AssignmentToConstant,
                    format!("Cannot assign to '{}' because it is a constant", name),
                    location,
                );
                return Ok(self.unreachable_with_type(contextual_type));
            }
            let index = scoped.index.unwrap_or_default();
            return self.compile_local_assignment(
                op,
                index,
                scoped.ty,
                value,
                contextual_type,
                location,
            );
        }
        if let Some(local) = self
            .program
            .function(self.current_function)
            .local_by_name(name)
        {
            let index = local.index;
            let ty = local.ty.clone();
            return self.compile_local_assignment(op, index, ty, value, contextual_type, location);
        }

        // Global?
        let Some(element) = self.program.lookup(name) else {
            self.error(
                DiagnosticCode::UnresolvableIdentifier,
                format!("Cannot find name '{}'", name),
                location,
            );
            return Ok(self.unreachable_with_type(contextual_type));
        };
        if !matches!(self.program.element(element).kind, ElementKind::Global(_)) {
            self.error(
                DiagnosticCode::NotAssignable,
                format!("'{}' is not assignable", name),
                location,
            );
            return Ok(self.unreachable_with_type(contextual_type));
        }
        self.compile_global_assignment(op, element, value, contextual_type, location)
    }

    fn compile_local_assignment(
        &mut self,
        op: ast::AssignmentOperator,
        index: u32,
        ty: Type,
        value: &ast::Expression,
        contextual_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        let value_expr = match op.binary_operator() {
            Some(binary) => {
                let lhs = self.module.get_local(index, ty.native_type());
                self.current_type = ty.clone();
                let combined = self.compile_binary_with_lhs(binary, lhs, ty.clone(), value, location)?;
                let combined_type = self.current_type.clone();
                self.convert(
                    combined,
                    &combined_type,
                    &ty,
                    ConversionKind::Implicit,
                    false,
                    location,
                )
            }
            None => self.compile_expression(value, &ty, ConversionKind::Implicit, false)?,
        };
        let wrapped = !self.expr_can_overflow(value_expr, &ty);
        self.current_flow.set_local_wrapped(index, wrapped);
        if contextual_type.is_void() {
            self.current_type = self.void_type();
            return Ok(self.module.set_local(index, value_expr));
        }
        self.current_type = ty.clone();
        Ok(self.module.tee_local(index, value_expr, ty.native_type()))
    }

    fn compile_global_assignment(
        &mut self,
        op: ast::AssignmentOperator,
        element: ElementId,
        value: &ast::Expression,
        contextual_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        self.compile_global(element)?;
        let data = self.program.element(element);
        let name = data.name.clone();
        let internal_name = data.internal_name.clone();
        if data.flags.has(ElementFlags::CONST) || data.flags.has(ElementFlags::INLINED) {
            self.error(
                DiagnosticCode::AssignmentToConstant,
                format!("Cannot assign to '{}' because it is a constant", name),
                location,
            );
            return Ok(self.unreachable_with_type(contextual_type));
        }
        let ty = self
            .program
            .global(element)
            .ty
            .clone()
            .unwrap_or_else(|| self.i32_type());

        let value_expr = match op.binary_operator() {
            Some(binary) => {
                let lhs = self.module.get_global(internal_name.clone(), ty.native_type());
                self.current_type = ty.clone();
                let combined = self.compile_binary_with_lhs(binary, lhs, ty.clone(), value, location)?;
                let combined_type = self.current_type.clone();
                self.convert(
                    combined,
                    &combined_type,
                    &ty,
                    ConversionKind::Implicit,
                    false,
                    location,
                )
            }
            None => self.compile_expression(value, &ty, ConversionKind::Implicit, false)?,
        };
        let assign = self.module.set_global(internal_name.clone(), value_expr);
        if contextual_type.is_void() {
            self.current_type = self.void_type();
            return Ok(assign);
        }
        // Globals have no tee: emulate with a set followed by a get.
        let reread = self.module.get_global(internal_name, ty.native_type());
        self.current_type = ty.clone();
        Ok(self
            .module
            .block(None, vec![assign, reread], ty.native_type()))
    }

    fn compile_property_assignment(
        &mut self,
        op: ast::AssignmentOperator,
        object: &ast::Expression,
        property: &str,
        value: &ast::Expression,
        contextual_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        // Static path assigns to a class static or namespace global.
        if let Some(container) = self.resolve_static_path(object) {
            if matches!(
                self.program.element(container).kind,
                ElementKind::ClassPrototype(_)
            ) {
                self.program.resolve_class(container, &[]);
            }
            let Some(member) = self.static_member(container, property) else {
                self.error(
                    DiagnosticCode::PropertyDoesNotExist,
                    format!("Property '{}' does not exist", property),
                    location,
                );
                return Ok(self.unreachable_with_type(contextual_type));
            };
            return match self.program.element(member).kind.tag() {
                ElementTag::Global => {
                    self.compile_global_assignment(op, member, value, contextual_type, location)
                }
                ElementTag::Property => {
                    let (getter, setter) = match &self.program.element(member).kind {
                        ElementKind::Property(p) => (p.getter, p.setter),
                        _ => (None, None),
                    };
                    self.compile_setter_assignment(
                        op, member, getter, setter, None, None, value, contextual_type, location,
                    )
                }
                _ => {
                    self.error(
                        DiagnosticCode::NotAssignable,
                        format!("'{}' is not assignable", property),
                        location,
                    );
                    Ok(self.unreachable_with_type(contextual_type))
                }
            };
        }

        let void = self.void_type();
        let object_expr = self.compile_expression(object, &void, ConversionKind::None, false)?;
        let object_type = self.current_type.clone();
        let Some(class) = object_type.class_reference else {
            self.error(
                DiagnosticCode::PropertyDoesNotExist,
                format!("Property '{}' does not exist on type '{}'", property, object_type),
                location,
            );
            return Ok(self.unreachable_with_type(contextual_type));
        };
        let Some(member) = self.program.class_member(class, property) else {
            self.error(
                DiagnosticCode::PropertyDoesNotExist,
                format!("Property '{}' does not exist on the class", property),
                location,
            );
            return Ok(self.unreachable_with_type(contextual_type));
        };
        match self.program.element(member).kind.tag() {
            ElementTag::Field => self.compile_field_assignment(
                op,
                member,
                class,
                object_expr,
                value,
                contextual_type,
                location,
            ),
            ElementTag::Property => {
                let (getter, setter) = match &self.program.element(member).kind {
                    ElementKind::Property(p) => (p.getter, p.setter),
                    _ => (None, None),
                };
                self.compile_setter_assignment(
                    op,
                    member,
                    getter,
                    setter,
                    Some(object_expr),
                    Some(class),
                    value,
                    contextual_type,
                    location,
                )
            }
            _ => {
                self.error(
                    DiagnosticCode::NotAssignable,
                    format!("'{}' is not assignable", property),
                    location,
                );
                Ok(self.unreachable_with_type(contextual_type))
            }
        }
    }

    fn compile_field_assignment(
        &mut self,
        op: ast::AssignmentOperator,
        field_element: ElementId,
        class: ElementId,
        object_expr: ExprRef,
        value: &ast::Expression,
        contextual_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        let data = self.program.element(field_element);
        let readonly = data.flags.has(ElementFlags::READONLY);
        let field_name = data.name.clone();
        let field = self.program.field(field_element);
        let ty = field.ty.clone();
        let offset = field.memory_offset;

        // Readonly fields assign only inside their own constructor.
        if readonly {
            let in_own_constructor = {
                let function_data = self.program.element(self.current_function);
                function_data.flags.has(ElementFlags::CONSTRUCTOR)
                    && function_data.parent == Some(class)
            };
            if !in_own_constructor {
                self.error(
                    DiagnosticCode::AssignmentToReadonly,
                    format!(
                        "Cannot assign to '{}' because it is a read-only property",
                        field_name
                    ),
                    location,
                );
                return Ok(self.unreachable_with_type(contextual_type));
            }
        }

        // A compound op reloads through the object; the object itself
        // must round-trip through a temp unless it is re-emittable.
        let (object_expr, object_reuse, object_temp) = match op.binary_operator() {
            None => (object_expr, None, None),
            Some(_) => match self.try_reemit(object_expr) {
                Some(clone) => (object_expr, Some(clone), None),
                None => {
                    let pointer = self.pointer_native_type();
                    let usize_type = self.usize_type();
                    let temp = self
                        .program
                        .function_mut(self.current_function)
                        .get_temp_local(usize_type);
                    let teed = self.module.tee_local(temp, object_expr, pointer);
                    let reread = self.module.get_local(temp, pointer);
                    (teed, Some(reread), Some(temp))
                }
            },
        };

        let value_expr = match op.binary_operator() {
            Some(binary) => {
                let reuse = object_reuse
                    .ok_or_else(|| CompileError::internal("compound field store lost its object"))?;
                let lhs = self.module.load(
                    ty.size as u8,
                    ty.is_signed() && ty.is_integer(),
                    reuse,
                    ty.native_type(),
                    offset,
                );
                self.current_type = ty.clone();
                let combined = self.compile_binary_with_lhs(binary, lhs, ty.clone(), value, location)?;
                let combined_type = self.current_type.clone();
                self.convert(
                    combined,
                    &combined_type,
                    &ty,
                    ConversionKind::Implicit,
                    false,
                    location,
                )
            }
            None => self.compile_expression(value, &ty, ConversionKind::Implicit, false)?,
        };
        // Bool stores re-wrap so a loaded bool is always 0 or 1.
        let value_expr = if ty.kind == TypeKind::Bool {
            self.ensure_small_integer_wrap(value_expr, &ty)
        } else {
            value_expr
        };

        let result = if contextual_type.is_void() {
            self.current_type = self.void_type();
            self.module
                .store(ty.size as u8, object_expr, value_expr, ty.native_type(), offset)
        } else {
            // Tee shape: keep the stored value in a temp for the result.
            let temp = self
                .program
                .function_mut(self.current_function)
                .get_temp_local(ty.clone());
            let teed = self.module.tee_local(temp, value_expr, ty.native_type());
            let store =
                self.module
                    .store(ty.size as u8, object_expr, teed, ty.native_type(), offset);
            let reread = self.module.get_local(temp, ty.native_type());
            self.program
                .function_mut(self.current_function)
                .free_temp_local(temp);
            self.current_type = ty.clone();
            self.module
                .block(None, vec![store, reread], ty.native_type())
        };
        if let Some(temp) = object_temp {
            self.program
                .function_mut(self.current_function)
                .free_temp_local(temp);
        }
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_setter_assignment(
        &mut self,
        op: ast::AssignmentOperator,
        property: ElementId,
        getter: Option<ElementId>,
        setter: Option<ElementId>,
        this_expr: Option<ExprRef>,
        class: Option<ElementId>,
        value: &ast::Expression,
        contextual_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        let property_name = self.program.element(property).name.clone();
        let Some(setter) = setter else {
            self.error(
                DiagnosticCode::AssignmentToReadonly,
                format!(
                    "Cannot assign to '{}' because it has no setter",
                    property_name
                ),
                location,
            );
            return Ok(self.unreachable_with_type(contextual_type));
        };
        let Some(setter_instance) = self.program.resolve_function(setter, &[], class) else {
            return Ok(self.unreachable_with_type(contextual_type));
        };
        let value_type = self
            .program
            .function(setter_instance)
            .signature
            .parameter_types
            .first()
            .map(|parameter| parameter.ty.clone())
            .unwrap_or_else(|| self.i32_type());

        // Tee shape shares one temp for `this` between setter and getter.
        let (setter_this, getter_this, this_temp) = match (this_expr, contextual_type.is_void()) {
            (None, _) => (None, None, None),
            (Some(this_expr), true) => (Some(this_expr), None, None),
            (Some(this_expr), false) => {
                let pointer = self.pointer_native_type();
                let usize_type = self.usize_type();
                let temp = self
                    .program
                    .function_mut(self.current_function)
                    .get_temp_local(usize_type);
                let teed = self.module.tee_local(temp, this_expr, pointer);
                let reread = self.module.get_local(temp, pointer);
                (Some(teed), Some(reread), Some(temp))
            }
        };

        if op.binary_operator().is_some() {
            let void = self.void_type();
            let result =
                self.operation_not_supported("A compound property assignment", location, &void);
            return Ok(result);
        }
        let value_expr =
            self.compile_expression(value, &value_type, ConversionKind::Implicit, false)?;

        let mut operands = Vec::new();
        if let Some(setter_this) = setter_this {
            operands.push(setter_this);
        }
        operands.push(value_expr);
        let set_call = self.make_call_direct(setter_instance, operands, location)?;

        if contextual_type.is_void() {
            self.current_type = self.void_type();
            if let Some(temp) = this_temp {
                self.program
                    .function_mut(self.current_function)
                    .free_temp_local(temp);
            }
            return Ok(set_call);
        }

        // Tee: call the setter, then read back through the getter.
        let Some(getter) = getter else {
            self.error(
                DiagnosticCode::PropertyDoesNotExist,
                format!("Property '{}' has no getter", property_name),
                location,
            );
            if let Some(temp) = this_temp {
                self.program
                    .function_mut(self.current_function)
                    .free_temp_local(temp);
            }
            return Ok(self.unreachable_with_type(contextual_type));
        };
        let Some(getter_instance) = self.program.resolve_function(getter, &[], class) else {
            if let Some(temp) = this_temp {
                self.program
                    .function_mut(self.current_function)
                    .free_temp_local(temp);
            }
            return Ok(self.unreachable_with_type(contextual_type));
        };
        let getter_operands = match getter_this {
            Some(getter_this) => vec![getter_this],
            None => Vec::new(),
        };
        let get_call = self.make_call_direct(getter_instance, getter_operands, location)?;
        let result_type = self.current_type.clone();
        if let Some(temp) = this_temp {
            self.program
                .function_mut(self.current_function)
                .free_temp_local(temp);
        }
        Ok(self
            .module
            .block(None, vec![set_call, get_call], result_type.native_type()))
    }

    fn compile_indexed_assignment(
        &mut self,
        op: ast::AssignmentOperator,
        object: &ast::Expression,
        index: &ast::Expression,
        value: &ast::Expression,
        contextual_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        if op.binary_operator().is_some() {
            let void = self.void_type();
            return Ok(self.operation_not_supported(
                "A compound indexed assignment",
                location,
                &void,
            ));
        }
        let void = self.void_type();
        let object_expr = self.compile_expression(object, &void, ConversionKind::None, false)?;
        let object_type = self.current_type.clone();
        let Some(class) = object_type.class_reference else {
            self.error(
                DiagnosticCode::NotIndexable,
                format!("Type '{}' does not define an index signature", object_type),
                location,
            );
            return Ok(self.unreachable_with_type(contextual_type));
        };
        // Indexed assignment needs both overloads so the tee form can
        // read the value back.
        let getter = self.program.class_operator(class, OperatorKind::IndexedGet);
        let setter = self.program.class_operator(class, OperatorKind::IndexedSet);
        let (Some(getter), Some(setter)) = (getter, setter) else {
            self.error(
                DiagnosticCode::NotIndexable,
                "Indexed assignment requires both '[]' and '[]=' overloads",
                location,
            );
            return Ok(self.unreachable_with_type(contextual_type));
        };
        let Some(setter_instance) = self.program.resolve_function(setter, &[], Some(class)) else {
            return Ok(self.unreachable_with_type(contextual_type));
        };
        let setter_signature = self.program.function(setter_instance).signature.clone();
        let index_type = setter_signature
            .parameter_types
            .first()
            .map(|p| p.ty.clone())
            .unwrap_or_else(|| self.i32_type());
        let value_type = setter_signature
            .parameter_types
            .get(1)
            .map(|p| p.ty.clone())
            .unwrap_or_else(|| self.i32_type());

        if contextual_type.is_void() {
            let index_expr =
                self.compile_expression(index, &index_type, ConversionKind::Implicit, false)?;
            let value_expr =
                self.compile_expression(value, &value_type, ConversionKind::Implicit, false)?;
            self.current_type = self.void_type();
            let call = self.make_call_direct(
                setter_instance,
                vec![object_expr, index_expr, value_expr],
                location,
            )?;
            self.current_type = self.void_type();
            return Ok(call);
        }

        // Tee: this and index round-trip through temps, set then get.
        let pointer = self.pointer_native_type();
        let usize_type = self.usize_type();
        let this_temp = self
            .program
            .function_mut(self.current_function)
            .get_temp_local(usize_type);
        let index_temp = self
            .program
            .function_mut(self.current_function)
            .get_temp_local(index_type.clone());
        let this_teed = self.module.tee_local(this_temp, object_expr, pointer);
        let index_expr =
            self.compile_expression(index, &index_type, ConversionKind::Implicit, false)?;
        let index_teed =
            self.module
                .tee_local(index_temp, index_expr, index_type.native_type());
        let value_expr =
            self.compile_expression(value, &value_type, ConversionKind::Implicit, false)?;
        let set_call = self.make_call_direct(
            setter_instance,
            vec![this_teed, index_teed, value_expr],
            location,
        )?;
        let Some(getter_instance) = self.program.resolve_function(getter, &[], Some(class)) else {
            return Ok(self.unreachable_with_type(contextual_type));
        };
        let this_reread = self.module.get_local(this_temp, pointer);
        let index_reread = self
            .module
            .get_local(index_temp, index_type.native_type());
        let get_call =
            self.make_call_direct(getter_instance, vec![this_reread, index_reread], location)?;
        let result_type = self.current_type.clone();
        self.program
            .function_mut(self.current_function)
            .free_temp_local(index_temp);
        self.program
            .function_mut(self.current_function)
            .free_temp_local(this_temp);
        Ok(self
            .module
            .block(None, vec![set_call, get_call], result_type.native_type()))
    }
}
