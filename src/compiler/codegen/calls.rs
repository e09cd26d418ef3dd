//! Call machinery: call sites, the function table and trampolines.
//!
//! A call site takes one of four shapes (builtin, direct and possibly
//! inlined, trampolined with optional arguments filled in at runtime via
//! the `~argc` protocol, or indirect through the function table) and
//! everything here funnels into [`Compiler::make_call_direct`] and
//! [`Compiler::make_call_indirect`], which own the padding and routing
//! rules.

use crate::compiler::ast;
use crate::compiler::builtins;
use crate::compiler::codegen::{Compiler, ConversionKind, ARGC_GLOBAL};
use crate::compiler::diagnostics::{CompileError, DiagnosticCode};
use crate::compiler::flow::{Flow, FlowFlags};
use crate::compiler::program::{
    DecoratorFlags, ElementData, ElementFlags, ElementId, ElementKind, ElementTag, Function,
    Signature,
};
use crate::compiler::tokens::TextLocation;
use crate::compiler::types::{common_compatible, Type};
use crate::compiler::wir::nodes::{BinaryOp, ExprRef, Literal, NativeType, UnaryOp};
use rustc_hash::FxHashMap;

impl<'a> Compiler<'a> {
    // =========================================================================
    // Signature checking
    // =========================================================================

    /// Validate arity and `this` presence against a signature. Reports
    /// and returns `false` on mismatch.
    pub fn check_call_signature(
        &mut self,
        signature: &Signature,
        num_arguments: usize,
        has_this: bool,
        location: &TextLocation,
    ) -> bool {
        if signature.has_this() != has_this {
            self.error(
                DiagnosticCode::NotCallable,
                if signature.has_this() {
                    "Calling this function requires a 'this' context"
                } else {
                    "This function does not take a 'this' context"
                },
                location,
            );
            return false;
        }
        if num_arguments < signature.required_parameters {
            self.error(
                DiagnosticCode::ExpectedArguments,
                format!(
                    "Expected at least {} arguments, but got {}",
                    signature.required_parameters, num_arguments
                ),
                location,
            );
            return false;
        }
        if num_arguments > signature.parameter_types.len() {
            self.error(
                DiagnosticCode::ExpectedArguments,
                format!(
                    "Expected {} arguments, but got {}",
                    signature.parameter_types.len(),
                    num_arguments
                ),
                location,
            );
            return false;
        }
        true
    }

    // =========================================================================
    // Call expressions
    // =========================================================================

    pub(crate) fn compile_call_expression(
        &mut self,
        callee: &ast::Expression,
        type_arguments: &[ast::TypeNode],
        arguments: &[ast::Expression],
        contextual_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        match &callee.kind {
            ast::ExpressionKind::Identifier(name) => {
                // A local or global holding a function value calls
                // indirectly.
                if let Some(scoped) = self.current_flow.scoped_local(name) {
                    let ty = scoped.ty.clone();
                    if let (Some(signature), Some(index)) =
                        (ty.signature_reference.clone(), scoped.index)
                    {
                        let index_expr = self.module.get_local(index, NativeType::I32);
                        return self.make_indirect_call_from_nodes(
                            *signature, index_expr, arguments, location,
                        );
                    }
                }
                if let Some(local) = self
                    .program
                    .function(self.current_function)
                    .local_by_name(name)
                {
                    let ty = local.ty.clone();
                    let index = local.index;
                    if let Some(signature) = ty.signature_reference.clone() {
                        let index_expr = self.module.get_local(index, NativeType::I32);
                        return self.make_indirect_call_from_nodes(
                            *signature, index_expr, arguments, location,
                        );
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
                match self.program.element(element).kind.tag() {
                    ElementTag::FunctionPrototype => self.compile_function_call(
                        element,
                        None,
                        None,
                        type_arguments,
                        arguments,
                        contextual_type,
                        location,
                    ),
                    ElementTag::Global => {
                        let value = self.compile_global_value_for_call(element)?;
                        match value {
                            Some((signature, index_expr)) => self.make_indirect_call_from_nodes(
                                signature, index_expr, arguments, location,
                            ),
                            None => {
                                self.error(
                                    DiagnosticCode::NotCallable,
                                    format!("'{}' cannot be invoked", name),
                                    location,
                                );
                                Ok(self.unreachable_with_type(contextual_type))
                            }
                        }
                    }
                    _ => {
                        self.error(
                            DiagnosticCode::NotCallable,
                            format!("'{}' cannot be invoked", name),
                            location,
                        );
                        Ok(self.unreachable_with_type(contextual_type))
                    }
                }
            }
            ast::ExpressionKind::PropertyAccess { object, property } => self
                .compile_property_call(
                    object,
                    property,
                    type_arguments,
                    arguments,
                    contextual_type,
                    location,
                ),
            ast::ExpressionKind::Super => self.compile_super_call(arguments, location),
            ast::ExpressionKind::Parenthesized(inner) => self.compile_call_expression(
                inner,
                type_arguments,
                arguments,
                contextual_type,
                location,
            ),
            _ => {
                // Any other callee must evaluate to a function value.
                let void = self.void_type();
                let index_expr =
                    self.compile_expression(callee, &void, ConversionKind::None, false)?;
                let callee_type = self.current_type.clone();
                match callee_type.signature_reference {
                    Some(signature) => self.make_indirect_call_from_nodes(
                        *signature, index_expr, arguments, location,
                    ),
                    None => {
                        self.error(
                            DiagnosticCode::NotCallable,
                            format!("Type '{}' cannot be invoked", callee_type),
                            location,
                        );
                        Ok(self.unreachable_with_type(contextual_type))
                    }
                }
            }
        }
    }

    fn compile_global_value_for_call(
        &mut self,
        element: ElementId,
    ) -> Result<Option<(Signature, ExprRef)>, CompileError> {
        self.compile_global(element)?;
        let ty = self.program.global(element).ty.clone();
        let Some(ty) = ty else { return Ok(None) };
        let Some(signature) = ty.signature_reference.clone() else {
            return Ok(None);
        };
        let internal_name = self.program.element(element).internal_name.clone();
        let index_expr = self.module.get_global(internal_name, NativeType::I32);
        Ok(Some((*signature, index_expr)))
    }

    fn compile_property_call(
        &mut self,
        object: &ast::Expression,
        property: &str,
        type_arguments: &[ast::TypeNode],
        arguments: &[ast::Expression],
        contextual_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        // Static path: Namespace.fn(), Class.staticFn().
        if let Some(container) = self.resolve_static_path(object) {
            let class_instance = if matches!(
                self.program.element(container).kind,
                ElementKind::ClassPrototype(_)
            ) {
                self.program.resolve_class(container, &[])
            } else {
                None
            };
            let Some(member) = self.static_member(container, property) else {
                self.error(
                    DiagnosticCode::PropertyDoesNotExist,
                    format!("Property '{}' does not exist", property),
                    location,
                );
                return Ok(self.unreachable_with_type(contextual_type));
            };
            return match self.program.element(member).kind.tag() {
                ElementTag::FunctionPrototype => self.compile_function_call(
                    member,
                    None,
                    class_instance,
                    type_arguments,
                    arguments,
                    contextual_type,
                    location,
                ),
                ElementTag::Global => {
                    let value = self.compile_global_value_for_call(member)?;
                    match value {
                        Some((signature, index_expr)) => self.make_indirect_call_from_nodes(
                            signature, index_expr, arguments, location,
                        ),
                        None => {
                            self.error(
                                DiagnosticCode::NotCallable,
                                format!("'{}' cannot be invoked", property),
                                location,
                            );
                            Ok(self.unreachable_with_type(contextual_type))
                        }
                    }
                }
                _ => {
                    self.error(
                        DiagnosticCode::NotCallable,
                        format!("'{}' cannot be invoked", property),
                        location,
                    );
                    Ok(self.unreachable_with_type(contextual_type))
                }
            };
        }

        // Instance path: obj.method().
        let void = self.void_type();
        let object_expr = self.compile_expression(object, &void, ConversionKind::None, false)?;
        let object_type = self.current_type.clone();
        let Some(class) = object_type.class_reference else {
            self.error(
                DiagnosticCode::PropertyDoesNotExist,
                format!(
                    "Property '{}' does not exist on type '{}'",
                    property, object_type
                ),
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
            ElementTag::FunctionPrototype => self.compile_function_call(
                member,
                Some(object_expr),
                Some(class),
                type_arguments,
                arguments,
                contextual_type,
                location,
            ),
            ElementTag::Field => {
                let field = self.program.field(member);
                let ty = field.ty.clone();
                let offset = field.memory_offset;
                match ty.signature_reference.clone() {
                    Some(signature) => {
                        let index_expr = self.module.load(
                            ty.size as u8,
                            false,
                            object_expr,
                            NativeType::I32,
                            offset,
                        );
                        self.make_indirect_call_from_nodes(
                            *signature, index_expr, arguments, location,
                        )
                    }
                    None => {
                        self.error(
                            DiagnosticCode::NotCallable,
                            format!("'{}' cannot be invoked", property),
                            location,
                        );
                        Ok(self.unreachable_with_type(contextual_type))
                    }
                }
            }
            _ => {
                self.error(
                    DiagnosticCode::NotCallable,
                    format!("'{}' cannot be invoked", property),
                    location,
                );
                Ok(self.unreachable_with_type(contextual_type))
            }
        }
    }

    /// `super(...)` in a derived constructor: call the base constructor
    /// with the incoming `this`, store the result back and mark the flow
    /// as allocated.
    fn compile_super_call(
        &mut self,
        arguments: &[ast::Expression],
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        let void = self.void_type();
        let function_data = self.program.element(self.current_function);
        if !function_data.flags.has(ElementFlags::CONSTRUCTOR) {
            self.error(
                DiagnosticCode::SuperOutsideDerivedClass,
                "'super' calls are only allowed in constructors",
                location,
            );
            return Ok(self.unreachable_with_type(&void));
        }
        let base = self
            .program
            .function(self.current_function)
            .signature
            .this_type
            .as_ref()
            .and_then(|ty| ty.class_reference)
            .and_then(|class| self.program.class(class).base);
        let Some(base) = base else {
            self.error(
                DiagnosticCode::SuperOutsideDerivedClass,
                "'super' can only be used in a derived class",
                location,
            );
            return Ok(self.unreachable_with_type(&void));
        };
        self.compile_class(base)?;
        let pointer = self.pointer_native_type();
        let base_constructor = self.program.class(base).constructor;
        let result = match base_constructor {
            Some(prototype) => {
                let Some(instance) = self.program.resolve_function(prototype, &[], Some(base))
                else {
                    return Ok(self.unreachable_with_type(&void));
                };
                let signature = self.program.function(instance).signature.clone();
                if !self.check_call_signature(&signature, arguments.len(), true, location) {
                    return Ok(self.unreachable_with_type(&void));
                }
                let mut operands = vec![self.module.get_local(0, pointer)];
                for (argument, parameter) in
                    arguments.iter().zip(signature.parameter_types.iter())
                {
                    operands.push(self.compile_expression(
                        argument,
                        &parameter.ty,
                        ConversionKind::Implicit,
                        false,
                    )?);
                }
                self.make_call_direct(instance, operands, location)?
            }
            None => {
                if !arguments.is_empty() {
                    self.error(
                        DiagnosticCode::ExpectedArguments,
                        format!("Expected 0 arguments, but got {}", arguments.len()),
                        location,
                    );
                }
                self.make_conditional_allocate(base, location)?
            }
        };
        self.current_flow.flags.set(FlowFlags::ALLOCATES);
        self.current_type = void;
        Ok(self.module.set_local(0, result))
    }

    // =========================================================================
    // Direct calls
    // =========================================================================

    /// Compile a call to a function prototype with explicit, inferred or
    /// no type arguments; dispatches builtins and inlining.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn compile_function_call(
        &mut self,
        prototype: ElementId,
        this_expr: Option<ExprRef>,
        class: Option<ElementId>,
        type_arguments: &[ast::TypeNode],
        arguments: &[ast::Expression],
        contextual_type: &Type,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        let contextual_args = self.current_flow.contextual_type_arguments.clone();

        // Builtins interpret their own type arguments and operands.
        if self
            .program
            .element(prototype)
            .decorators
            .has(DecoratorFlags::BUILTIN)
        {
            let mut resolved = Vec::with_capacity(type_arguments.len());
            for node in type_arguments {
                match self.program.resolve_type(node, &contextual_args, true) {
                    Some(ty) => resolved.push(ty),
                    None => return Ok(self.unreachable_with_type(contextual_type)),
                }
            }
            match builtins::compile_builtin_call(
                self,
                prototype,
                &resolved,
                arguments,
                contextual_type,
                location,
            )? {
                Some(expr) => return Ok(expr),
                None => {
                    let name = self.program.element(prototype).name.clone();
                    self.error(
                        DiagnosticCode::OperationNotSupported,
                        format!("The built-in '{}' is not supported here", name),
                        location,
                    );
                    return Ok(self.unreachable_with_type(contextual_type));
                }
            }
        }

        let type_parameters = self
            .program
            .function_prototype(prototype)
            .declaration
            .type_parameters
            .clone();

        // Resolve the concrete instance.
        let (instance, mut precompiled) = if !type_arguments.is_empty() {
            let mut resolved = Vec::with_capacity(type_arguments.len());
            for node in type_arguments {
                match self.program.resolve_type(node, &contextual_args, true) {
                    Some(ty) => resolved.push(ty),
                    None => return Ok(self.unreachable_with_type(contextual_type)),
                }
            }
            (
                self.program.resolve_function(prototype, &resolved, class),
                Vec::new(),
            )
        } else if !type_parameters.is_empty() {
            self.infer_generic_call(prototype, class, &type_parameters, arguments, location)?
        } else {
            (self.program.resolve_function(prototype, &[], class), Vec::new())
        };
        let Some(instance) = instance else {
            return Ok(self.unreachable_with_type(contextual_type));
        };

        let signature = self.program.function(instance).signature.clone();
        if !self.check_call_signature(
            &signature,
            arguments.len(),
            this_expr.is_some(),
            location,
        ) {
            return Ok(self.unreachable_with_type(contextual_type));
        }

        // Inline if decorated, with a recursion guard.
        if self.should_inline(instance, location) {
            return self.compile_call_inline(instance, this_expr, arguments, location);
        }

        precompiled.resize(arguments.len(), None);
        let mut operands = Vec::with_capacity(arguments.len() + 1);
        if let Some(this_expr) = this_expr {
            operands.push(this_expr);
        }
        for (index, argument) in arguments.iter().enumerate() {
            let Some(parameter) = signature.parameter_types.get(index) else {
                break;
            };
            let parameter_type = parameter.ty.clone();
            let operand = match precompiled[index].take() {
                Some((expr, ty)) => self.convert(
                    expr,
                    &ty,
                    &parameter_type,
                    ConversionKind::Implicit,
                    false,
                    &argument.location,
                ),
                None => self.compile_expression(
                    argument,
                    &parameter_type,
                    ConversionKind::Implicit,
                    false,
                )?,
            };
            operands.push(operand);
        }
        self.make_call_direct(instance, operands, location)
    }

    /// Infer type arguments from positional arguments whose declared
    /// parameter type is a bare type-parameter name. Those arguments
    /// compile once here, retaining their natural types, and are reused
    /// as operands afterwards.
    #[allow(clippy::type_complexity)]
    fn infer_generic_call(
        &mut self,
        prototype: ElementId,
        class: Option<ElementId>,
        type_parameters: &[String],
        arguments: &[ast::Expression],
        location: &TextLocation,
    ) -> Result<(Option<ElementId>, Vec<Option<(ExprRef, Type)>>), CompileError> {
        let parameters = self
            .program
            .function_prototype(prototype)
            .declaration
            .parameters
            .clone();
        let mut inferred: FxHashMap<String, Type> = FxHashMap::default();
        let mut precompiled: Vec<Option<(ExprRef, Type)>> = vec![None; arguments.len()];
        let void = self.void_type();

        for (index, argument) in arguments.iter().enumerate() {
            let Some(parameter) = parameters.get(index) else { break };
            let is_bare_type_parameter = parameter.type_node.type_arguments.is_empty()
                && type_parameters.contains(&parameter.type_node.name);
            if !is_bare_type_parameter {
                continue;
            }
            let expr = self.compile_expression(argument, &void, ConversionKind::None, false)?;
            let ty = self.current_type.clone();
            precompiled[index] = Some((expr, ty.clone()));
            let name = parameter.type_node.name.clone();
            match inferred.get(&name) {
                Some(existing) => {
                    if let Some(common) = common_compatible(existing, &ty, false) {
                        inferred.insert(name, common);
                    }
                }
                None => {
                    inferred.insert(name, ty);
                }
            }
        }

        let mut resolved = Vec::with_capacity(type_parameters.len());
        for parameter in type_parameters {
            match inferred.get(parameter) {
                Some(ty) => resolved.push(ty.clone()),
                None => {
                    self.error(
                        DiagnosticCode::UnexpectedTypeArguments,
                        format!("Type argument '{}' could not be inferred", parameter),
                        location,
                    );
                    return Ok((None, precompiled));
                }
            }
        }
        Ok((
            self.program.resolve_function(prototype, &resolved, class),
            precompiled,
        ))
    }

    fn should_inline(&mut self, instance: ElementId, location: &TextLocation) -> bool {
        let data = self.program.element(instance);
        if !data.decorators.has(DecoratorFlags::INLINE)
            || data.flags.has(ElementFlags::AMBIENT)
        {
            return false;
        }
        if self.current_inline_functions.contains(&instance) {
            let name = data.name.clone();
            self.warning(
                DiagnosticCode::InlineRecursion,
                format!("Function '{}' cannot be inlined into itself", name),
                location,
            );
            return false;
        }
        let prototype = self.program.function(instance).prototype;
        self.program
            .function_prototype(prototype)
            .declaration
            .body
            .is_some()
    }

    /// Dispatch an operator overload: a direct call (or inline
    /// expansion) of the class's method with the left operand as `this`.
    pub(crate) fn compile_operator_call(
        &mut self,
        method: ElementId,
        class: Option<ElementId>,
        this_expr: ExprRef,
        arguments: &[&ast::Expression],
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        let void = self.void_type();
        let Some(instance) = self.program.resolve_function(method, &[], class) else {
            return Ok(self.unreachable_with_type(&void));
        };
        let argument_nodes: Vec<ast::Expression> =
            arguments.iter().map(|a| (*a).clone()).collect();
        if self.should_inline(instance, location) {
            return self.compile_call_inline(
                instance,
                Some(this_expr),
                &argument_nodes,
                location,
            );
        }
        let signature = self.program.function(instance).signature.clone();
        if !self.check_call_signature(&signature, argument_nodes.len(), true, location) {
            return Ok(self.unreachable_with_type(&void));
        }
        let mut operands = vec![this_expr];
        for (argument, parameter) in argument_nodes
            .iter()
            .zip(signature.parameter_types.iter())
        {
            operands.push(self.compile_expression(
                argument,
                &parameter.ty,
                ConversionKind::Implicit,
                false,
            )?);
        }
        self.make_call_direct(instance, operands, location)
    }

    /// Emit a direct call with argument filling.
    ///
    /// Missing optional operands either inline their initialisers (when
    /// all of them are literal constants) or route through the
    /// trampoline with `~argc` set to the supplied count and zeroes in
    /// the gaps.
    pub fn make_call_direct(
        &mut self,
        instance: ElementId,
        mut operands: Vec<ExprRef>,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        self.compile_function(instance)?;
        let data = self.program.element(instance);
        let is_import = data.flags.has(ElementFlags::MODULE_IMPORT);
        let internal_name = data.internal_name.clone();
        let function = self.program.function(instance);
        let signature = function.signature.clone();
        let prototype = function.prototype;
        let this_count = signature.this_type.is_some() as usize;
        let total_slots = signature.parameter_types.len() + this_count;
        let supplied_arguments = operands.len() - this_count.min(operands.len());
        let return_type = signature.return_type.clone();
        let native_result = signature.native_result();

        if operands.len() < total_slots {
            let parameters = self
                .program
                .function_prototype(prototype)
                .declaration
                .parameters
                .clone();

            // All-literal initialisers inline at the call site.
            let missing_range = supplied_arguments..signature.parameter_types.len();
            let all_literal = missing_range.clone().all(|index| {
                matches!(
                    parameters.get(index).and_then(|p| p.initializer.as_ref()),
                    Some(ast::Expression {
                        kind: ast::ExpressionKind::IntegerLiteral(_)
                            | ast::ExpressionKind::FloatLiteral(_)
                            | ast::ExpressionKind::True
                            | ast::ExpressionKind::False
                            | ast::ExpressionKind::Null,
                        ..
                    })
                )
            });
            if all_literal {
                for index in missing_range {
                    let initializer = parameters[index]
                        .initializer
                        .clone()
                        .ok_or_else(|| CompileError::internal("missing initializer"))?;
                    let parameter_type = signature.parameter_types[index].ty.clone();
                    operands.push(self.compile_expression(
                        &initializer,
                        &parameter_type,
                        ConversionKind::Implicit,
                        false,
                    )?);
                }
            } else {
                // Trampoline route: zero-pad, set ~argc, call the
                // trampoline instead of the original.
                let trampoline = self.ensure_trampoline(instance)?;
                for index in missing_range {
                    let native = signature.parameter_types[index].ty.native_type();
                    let zero = Literal::zero_of(native).unwrap_or(Literal::I32(0));
                    operands.push(self.module.constant(zero));
                }
                self.ensure_argc_var();
                let count = self.module.i32(supplied_arguments as i32);
                let set_argc = self.module.set_global(ARGC_GLOBAL, count);
                let trampoline_name = self.program.element(trampoline).internal_name.clone();
                let call = self.module.call(trampoline_name, operands, native_result);
                self.current_type = return_type;
                return Ok(self
                    .module
                    .block(None, vec![set_argc, call], native_result));
            }
        }

        self.current_type = return_type;
        Ok(if is_import {
            self.module.call_import(internal_name, operands, native_result)
        } else {
            self.module.call(internal_name, operands, native_result)
        })
    }

    // =========================================================================
    // Indirect calls
    // =========================================================================

    fn make_indirect_call_from_nodes(
        &mut self,
        signature: Signature,
        index_expr: ExprRef,
        arguments: &[ast::Expression],
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        if !self.check_call_signature(&signature, arguments.len(), false, location) {
            let return_type = signature.return_type.clone();
            return Ok(self.unreachable_with_type(&return_type));
        }
        let mut operands = Vec::with_capacity(signature.parameter_types.len());
        for (index, parameter) in signature.parameter_types.iter().enumerate() {
            match arguments.get(index) {
                Some(argument) => {
                    let parameter_type = parameter.ty.clone();
                    operands.push(self.compile_expression(
                        argument,
                        &parameter_type,
                        ConversionKind::Implicit,
                        false,
                    )?);
                }
                None => {
                    let zero =
                        Literal::zero_of(parameter.ty.native_type()).unwrap_or(Literal::I32(0));
                    operands.push(self.module.constant(zero));
                }
            }
        }
        self.make_call_indirect(&signature, index_expr, operands, arguments.len())
    }

    /// Emit an indirect call. `~argc` is always set: the target could be
    /// a trampoline.
    pub fn make_call_indirect(
        &mut self,
        signature: &Signature,
        index_expr: ExprRef,
        operands: Vec<ExprRef>,
        supplied_arguments: usize,
    ) -> Result<ExprRef, CompileError> {
        self.ensure_argc_var();
        let count = self.module.i32(supplied_arguments as i32);
        let set_argc = self.module.set_global(ARGC_GLOBAL, count);
        let native_result = signature.native_result();
        let call = self.module.call_indirect(
            &signature.native_params(),
            native_result,
            index_expr,
            operands,
        );
        self.current_type = signature.return_type.clone();
        Ok(self
            .module
            .block(None, vec![set_argc, call], native_result))
    }

    // =========================================================================
    // Function table
    // =========================================================================

    /// Index a function for indirect calls. Functions with optional
    /// parameters are indexed through their trampoline so `~argc`
    /// dispatch keeps working.
    pub fn ensure_function_table_entry(
        &mut self,
        instance: ElementId,
    ) -> Result<u32, CompileError> {
        let existing = self.program.function(instance).function_table_index;
        if existing >= 0 {
            return Ok(existing as u32);
        }
        let signature = self.program.function(instance).signature.clone();
        let has_optional =
            signature.required_parameters < signature.parameter_types.len();
        let is_trampoline = self
            .program
            .element(instance)
            .flags
            .has(ElementFlags::TRAMPOLINE);
        let target = if has_optional && !is_trampoline {
            self.ensure_trampoline(instance)?
        } else {
            self.compile_function(instance)?;
            instance
        };
        let index = self.function_table.len() as u32;
        self.function_table.push(target);
        self.program.function_mut(instance).function_table_index = index as i32;
        if target != instance {
            self.program.function_mut(target).function_table_index = index as i32;
        }
        Ok(index)
    }

    // =========================================================================
    // Trampolines
    // =========================================================================

    /// Get or build the trampoline for a function with optional
    /// parameters: a wrapper that switches on `~argc` and runs the
    /// omitted initialisers before forwarding to the original.
    pub fn ensure_trampoline(&mut self, instance: ElementId) -> Result<ElementId, CompileError> {
        if let Some(trampoline) = self.program.function(instance).trampoline {
            return Ok(trampoline);
        }
        self.compile_function(instance)?;

        let data = self.program.element(instance);
        let internal_name = format!("{}|trampoline", data.internal_name);
        let name = data.name.clone();
        let mut flags = data.flags;
        flags.set(ElementFlags::TRAMPOLINE);
        flags.set(ElementFlags::COMPILED);
        flags.clear(ElementFlags::MODULE_IMPORT);
        let decorators = data.decorators;
        let parent = data.parent;
        let location = data.location.clone();
        let function = self.program.function(instance);
        let signature = function.signature.clone();
        let type_arguments = function.type_arguments.clone();
        let contextual_type_arguments = function.contextual_type_arguments.clone();
        let prototype = function.prototype;
        let original_is_import = self
            .program
            .element(instance)
            .flags
            .has(ElementFlags::MODULE_IMPORT);
        let original_name = self.program.element(instance).internal_name.clone();
        let parameters = self
            .program
            .function_prototype(prototype)
            .declaration
            .parameters
            .clone();

        let mut trampoline_function =
            Function::new(prototype, signature.clone(), type_arguments);
        trampoline_function.contextual_type_arguments = contextual_type_arguments.clone();
        let trampoline = self.program.add_element(ElementData {
            kind: ElementKind::Function(trampoline_function),
            name,
            internal_name: internal_name.clone(),
            flags,
            decorators,
            parent,
            location: location.clone(),
        });
        self.program.function_mut(instance).trampoline = Some(trampoline);

        // The body compiles in the trampoline's own scope: optional
        // initialisers may introduce locals and reference `this`.
        let saved_function = std::mem::replace(&mut self.current_function, trampoline);
        let saved_flow = std::mem::replace(
            &mut self.current_flow,
            Flow::create(signature.return_type.clone(), contextual_type_arguments),
        );
        let result = self.build_trampoline_body(
            &signature,
            &parameters,
            &internal_name,
            &original_name,
            original_is_import,
        );
        self.current_function = saved_function;
        self.current_flow = saved_flow;
        let body = result?;

        let additional_locals = self
            .program
            .function(trampoline)
            .additional_local_types();
        self.module.add_function(
            internal_name,
            signature.native_params(),
            signature.native_result(),
            additional_locals,
            body,
        );
        Ok(trampoline)
    }

    fn build_trampoline_body(
        &mut self,
        signature: &Signature,
        parameters: &[ast::ParameterNode],
        internal_name: &str,
        original_name: &str,
        original_is_import: bool,
    ) -> Result<ExprRef, CompileError> {
        self.ensure_argc_var();
        let this_count = signature.this_type.is_some() as usize;
        let min_arguments = signature.required_parameters;
        let num_optional = signature.parameter_types.len() - min_arguments;
        debug_assert!(num_optional > 0, "trampoline for a function without optionals");

        // Selector: how many optional arguments were supplied.
        let argc = self.module.get_global(ARGC_GLOBAL, NativeType::I32);
        let min_const = self.module.i32(min_arguments as i32);
        let selector = self.module.binary(BinaryOp::SubI32, argc, min_const);

        let labels: Vec<String> = (0..=num_optional)
            .map(|index| format!("{}|case{}", internal_name, index))
            .collect();
        let out_of_range = format!("{}|outOfRange", internal_name);
        let switch = self
            .module
            .switch(labels.clone(), out_of_range.clone(), selector);
        let switch_block = self
            .module
            .block(Some(out_of_range), vec![switch], NativeType::None);
        let trap = self.module.unreachable();
        let mut body = self.module.block(
            Some(labels[0].clone()),
            vec![switch_block, trap],
            NativeType::None,
        );

        // The switch falls through every initialiser below the selected
        // count.
        for optional_index in 0..num_optional {
            let parameter_index = min_arguments + optional_index;
            let initializer = parameters
                .get(parameter_index)
                .and_then(|p| p.initializer.clone())
                .ok_or_else(|| {
                    CompileError::internal("optional parameter without an initializer")
                })?;
            let parameter_type = signature.parameter_types[parameter_index].ty.clone();
            let value = self.compile_expression(
                &initializer,
                &parameter_type,
                ConversionKind::Implicit,
                false,
            )?;
            let local_index = (this_count + parameter_index) as u32;
            let assign = self.module.set_local(local_index, value);
            body = self.module.block(
                Some(labels[optional_index + 1].clone()),
                vec![body, assign],
                NativeType::None,
            );
        }

        // Forward everything to the original.
        let mut forwarded = Vec::with_capacity(this_count + signature.parameter_types.len());
        let natives = signature.native_params();
        for (index, native) in natives.iter().enumerate() {
            forwarded.push(self.module.get_local(index as u32, *native));
        }
        let native_result = signature.native_result();
        let call = if original_is_import {
            self.module
                .call_import(original_name, forwarded, native_result)
        } else {
            self.module.call(original_name, forwarded, native_result)
        };
        Ok(self.module.block(None, vec![body, call], native_result))
    }

    // =========================================================================
    // Inlining
    // =========================================================================

    /// Expand a call to an `@inline` function in place.
    ///
    /// Arguments that are plain local reads alias the parameter name to
    /// the existing slot (zero copy); anything else initialises a fresh
    /// temp. The body compiles into a block labelled with a unique
    /// return label; `return` inside becomes a break to it.
    pub fn compile_call_inline(
        &mut self,
        instance: ElementId,
        this_expr: Option<ExprRef>,
        arguments: &[ast::Expression],
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        self.current_inline_functions.push(instance);

        let data = self.program.element(instance);
        let internal_name = data.internal_name.clone();
        let function = self.program.function(instance);
        let signature = function.signature.clone();
        let contextual_type_arguments = function.contextual_type_arguments.clone();
        let prototype = function.prototype;
        let declaration = self.program.function_prototype(prototype).declaration.clone();
        let return_type = signature.return_type.clone();

        let inline_id = {
            let function = self.program.function_mut(instance);
            let id = function.next_inline_id;
            function.next_inline_id += 1;
            id
        };
        let return_label = format!("{}|inlined.{}", internal_name, inline_id);

        // Compile the provided arguments in the caller's scope before
        // entering the inline flow.
        let mut compiled_arguments = Vec::with_capacity(arguments.len());
        for (index, argument) in arguments.iter().enumerate() {
            let Some(parameter) = signature.parameter_types.get(index) else {
                break;
            };
            let parameter_type = parameter.ty.clone();
            compiled_arguments.push(self.compile_expression(
                argument,
                &parameter_type,
                ConversionKind::Implicit,
                false,
            )?);
        }

        // Inline flow: same function scope, fresh label space.
        let mut flow = Flow::fork(std::mem::take(&mut self.current_flow));
        flow.flags.set(FlowFlags::INLINE_CONTEXT);
        flow.return_label = Some(return_label.clone());
        flow.return_type = Some(return_type.clone());
        flow.break_label = None;
        flow.continue_label = None;
        flow.contextual_type_arguments = contextual_type_arguments;
        self.current_flow = flow;

        let mut body_statements: Vec<ExprRef> = Vec::new();
        let mut introduced_temps: Vec<u32> = Vec::new();

        if let Some(this_expr) = this_expr {
            let this_type = signature
                .this_type
                .clone()
                .unwrap_or_else(|| self.usize_type());
            self.bind_inline_argument(
                "this",
                this_expr,
                this_type,
                &mut body_statements,
                &mut introduced_temps,
            );
        }
        for (index, parameter) in signature.parameter_types.iter().enumerate() {
            match compiled_arguments.get(index) {
                Some(&argument) => {
                    self.bind_inline_argument(
                        &parameter.name.clone(),
                        argument,
                        parameter.ty.clone(),
                        &mut body_statements,
                        &mut introduced_temps,
                    );
                }
                None => {
                    // Missing optional: its initialiser compiles in the
                    // inline scope.
                    let initializer = declaration
                        .parameters
                        .get(index)
                        .and_then(|p| p.initializer.clone());
                    let Some(initializer) = initializer else {
                        continue; // arity was checked by the caller
                    };
                    let parameter_type = parameter.ty.clone();
                    let value = self.compile_expression(
                        &initializer,
                        &parameter_type,
                        ConversionKind::Implicit,
                        false,
                    )?;
                    let temp = self
                        .program
                        .function_mut(self.current_function)
                        .get_temp_local(parameter_type.clone());
                    introduced_temps.push(temp);
                    self.current_flow.add_scoped_local(
                        parameter.name.clone(),
                        temp,
                        parameter_type,
                    );
                    body_statements.push(self.module.set_local(temp, value));
                }
            }
        }

        // The body itself.
        let body_result = (|| {
            match &declaration.body {
                Some(ast::FunctionBody::Statements(statements)) => {
                    for statement in statements {
                        let compiled = self.compile_statement(statement)?;
                        body_statements.push(compiled);
                    }
                }
                Some(ast::FunctionBody::Expression(expression)) => {
                    let value = self.compile_expression(
                        expression,
                        &return_type,
                        ConversionKind::Implicit,
                        false,
                    )?;
                    self.current_flow.flags.set(FlowFlags::RETURNS);
                    body_statements.push(value);
                }
                None => {
                    return Err(CompileError::internal(
                        "attempted to inline a function without a body",
                    ));
                }
            }
            Ok(())
        })();

        let returns = self.current_flow.flags.has(FlowFlags::RETURNS);
        let (mut parent, child) = std::mem::take(&mut self.current_flow).free();
        // Inline returns are local breaks; only throws and allocations
        // propagate outward.
        let mut propagated = Flow::default();
        propagated.flags = child.flags;
        propagated.flags.clear(FlowFlags::RETURNS);
        propagated.flags.clear(FlowFlags::RETURNS_WRAPPED);
        propagated.flags.clear(FlowFlags::INLINE_CONTEXT);
        parent.inherit(&propagated);
        self.current_flow = parent;
        self.current_inline_functions.pop();
        body_result?;

        let native_result = return_type.native_type();
        if !return_type.is_void() && !returns {
            self.error(
                DiagnosticCode::TypeExpected,
                format!("A function returning '{}' must return a value", return_type),
                location,
            );
            body_statements.push(self.module.unreachable());
        }
        let result =
            self.module
                .block(Some(return_label), body_statements, native_result);

        // Scoped temps go back to the pool; aliased caller locals stay.
        for temp in introduced_temps {
            self.program
                .function_mut(self.current_function)
                .free_temp_local(temp);
        }
        self.current_type = return_type;
        Ok(result)
    }

    fn bind_inline_argument(
        &mut self,
        name: &str,
        argument: ExprRef,
        ty: Type,
        body_statements: &mut Vec<ExprRef>,
        introduced_temps: &mut Vec<u32>,
    ) {
        // A plain local read aliases the existing slot.
        if let crate::compiler::wir::nodes::ExprNode::GetLocal { index, .. } =
            self.module.node(argument)
        {
            let index = *index;
            self.current_flow.add_scoped_local(name, index, ty);
            return;
        }
        let temp = self
            .program
            .function_mut(self.current_function)
            .get_temp_local(ty.clone());
        introduced_temps.push(temp);
        self.current_flow.add_scoped_local(name, temp, ty);
        body_statements.push(self.module.set_local(temp, argument));
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Whether the program opted into GC support (a `gc` namespace is
    /// declared); decides GC header reservation on heap objects.
    pub(crate) fn gc_enabled(&self) -> bool {
        self.program
            .lookup("gc")
            .is_some_and(|id| matches!(self.program.element(id).kind, ElementKind::Namespace(_)))
    }

    /// Allocate and initialise an instance of `class`: acquire a chunk
    /// through the `allocate` builtin, then fill every field from its
    /// declared initialiser, its constructor parameter, or zero.
    pub fn make_allocate(
        &mut self,
        class: ElementId,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        let class_data = self.program.class(class);
        let instance_size = class_data.instance_size as u64;
        let fields = class_data.fields.clone();
        let gc = self.gc_enabled();

        let usize_type = self.usize_type();
        let pointer = self.pointer_native_type();
        let temp = self
            .program
            .function_mut(self.current_function)
            .get_temp_local(usize_type);
        let mut statements = Vec::new();

        if gc {
            // Reserve the GC header and write the class's hook index
            // into its first word, then rebase the pointer past it.
            let hook = builtins::ensure_gc_hook(self, class);
            let total =
                instance_size + crate::compiler::codegen::memory::GC_HEADER_SIZE;
            let chunk = builtins::make_allocate_call(self, total, location)?;
            statements.push(self.module.set_local(temp, chunk));
            let base = self.module.get_local(temp, pointer);
            let hook_const = self.module.i32(hook);
            statements.push(self.module.store(4, base, hook_const, NativeType::I32, 0));
            let base = self.module.get_local(temp, pointer);
            let header = crate::compiler::codegen::memory::GC_HEADER_SIZE as i64;
            let (header_const, add) = if pointer == NativeType::I64 {
                (self.module.i64(header), BinaryOp::AddI64)
            } else {
                (self.module.i32(header as i32), BinaryOp::AddI32)
            };
            let rebased = self.module.binary(add, base, header_const);
            statements.push(self.module.set_local(temp, rebased));
        } else {
            let chunk = builtins::make_allocate_call(self, instance_size, location)?;
            statements.push(self.module.set_local(temp, chunk));
        }

        for field_id in fields {
            let field = self.program.field(field_id);
            let ty = field.ty.clone();
            let offset = field.memory_offset;
            let initializer = field.initializer.clone();
            let parameter_index = field.parameter_index;

            let value = match (initializer, parameter_index) {
                (Some(initializer), _) => {
                    let compiled = self.compile_expression(
                        &initializer,
                        &ty,
                        ConversionKind::Implicit,
                        false,
                    )?;
                    if ty.kind == crate::compiler::types::TypeKind::Bool {
                        self.ensure_small_integer_wrap(compiled, &ty)
                    } else {
                        compiled
                    }
                }
                (None, Some(parameter_index)) => {
                    // `constructor(public x: T)`-style: the field mirrors
                    // the constructor parameter (this is local 0).
                    self.module
                        .get_local(1 + parameter_index as u32, ty.native_type())
                }
                (None, None) => {
                    let zero = Literal::zero_of(ty.native_type()).unwrap_or(Literal::I32(0));
                    self.module.constant(zero)
                }
            };
            let base = self.module.get_local(temp, pointer);
            statements.push(self.module.store(
                ty.size as u8,
                base,
                value,
                ty.native_type(),
                offset,
            ));
        }

        statements.push(self.module.get_local(temp, pointer));
        self.program
            .function_mut(self.current_function)
            .free_temp_local(temp);
        self.current_type = Type::reference(class, self.options.pointer_size(), false);
        Ok(self.module.block(None, statements, pointer))
    }

    /// `this == 0 ? allocate() : this`: lets derived-class `super`
    /// calls pre-allocate while plain `new` starts from null.
    pub fn make_conditional_allocate(
        &mut self,
        class: ElementId,
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        let pointer = self.pointer_native_type();
        let this_read = self.module.get_local(0, pointer);
        let is_null = if pointer == NativeType::I64 {
            self.module.unary(UnaryOp::EqzI64, this_read)
        } else {
            self.module.unary(UnaryOp::EqzI32, this_read)
        };
        let allocate = self.make_allocate(class, location)?;
        let this_again = self.module.get_local(0, pointer);
        self.current_type = Type::reference(class, self.options.pointer_size(), false);
        Ok(self
            .module
            .if_(is_null, allocate, Some(this_again), pointer))
    }

    // =========================================================================
    // new expressions
    // =========================================================================

    pub(crate) fn compile_new(
        &mut self,
        callee: &ast::Expression,
        type_arguments: &[ast::TypeNode],
        arguments: &[ast::Expression],
        location: &TextLocation,
    ) -> Result<ExprRef, CompileError> {
        let usize_type = self.usize_type();
        let prototype = match &callee.kind {
            ast::ExpressionKind::Identifier(name) => self.program.lookup(name),
            _ => self.resolve_static_path(callee),
        };
        let prototype = prototype.filter(|&id| {
            matches!(self.program.element(id).kind, ElementKind::ClassPrototype(_))
        });
        let Some(prototype) = prototype else {
            self.error(
                DiagnosticCode::NotCallable,
                "'new' requires a class type",
                location,
            );
            return Ok(self.unreachable_with_type(&usize_type));
        };

        let contextual_args = self.current_flow.contextual_type_arguments.clone();
        let mut resolved = Vec::with_capacity(type_arguments.len());
        for node in type_arguments {
            match self.program.resolve_type(node, &contextual_args, true) {
                Some(ty) => resolved.push(ty),
                None => return Ok(self.unreachable_with_type(&usize_type)),
            }
        }
        let Some(class) = self.program.resolve_class(prototype, &resolved) else {
            return Ok(self.unreachable_with_type(&usize_type));
        };
        self.compile_class(class)?;

        let constructor = self.program.class(class).constructor;
        let result = match constructor {
            Some(constructor) => {
                let Some(instance) = self.program.resolve_function(constructor, &[], Some(class))
                else {
                    return Ok(self.unreachable_with_type(&usize_type));
                };
                let signature = self.program.function(instance).signature.clone();
                if !self.check_call_signature(&signature, arguments.len(), true, location) {
                    return Ok(self.unreachable_with_type(&usize_type));
                }
                // The constructor receives null and allocates lazily.
                let mut operands = vec![self.pointer_zero()];
                for (argument, parameter) in
                    arguments.iter().zip(signature.parameter_types.iter())
                {
                    let parameter_type = parameter.ty.clone();
                    operands.push(self.compile_expression(
                        argument,
                        &parameter_type,
                        ConversionKind::Implicit,
                        false,
                    )?);
                }
                self.make_call_direct(instance, operands, location)?
            }
            None => {
                if !arguments.is_empty() {
                    self.error(
                        DiagnosticCode::ExpectedArguments,
                        format!("Expected 0 arguments, but got {}", arguments.len()),
                        location,
                    );
                }
                self.make_allocate(class, location)?
            }
        };
        self.current_type = Type::reference(class, self.options.pointer_size(), false);
        Ok(result)
    }
}
