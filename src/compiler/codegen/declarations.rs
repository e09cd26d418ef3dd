//! Declaration lowering.
//!
//! Globals, enums, functions, classes and namespaces each compile at most
//! once, guarded by the `COMPILED` flag which is set on entry so cyclic
//! references terminate. Global and enum initialisers compile inside the
//! start function's scope; anything that fails to precompute degrades to
//! a start-time assignment.

use crate::compiler::ast;
use crate::compiler::codegen::{Compiler, ConversionKind, START_FUNCTION_NAME, STARTED_GLOBAL};
use crate::compiler::diagnostics::{CompileError, DiagnosticCode};
use crate::compiler::flow::{Flow, FlowFlags};
use crate::compiler::program::{ElementFlags, ElementId, ElementKind, ElementTag};
use crate::compiler::wir::nodes::{BinaryOp, ExprRef, Literal, NativeType, UnaryOp};

impl<'a> Compiler<'a> {
    /// Run `f` with the start function as the current scope; global and
    /// enum initialisers may introduce locals there.
    fn in_start_scope<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> T,
    ) -> T {
        let saved_function =
            std::mem::replace(&mut self.current_function, self.start_function);
        let saved_flow = std::mem::replace(
            &mut self.current_flow,
            Flow::create(self.program.void_type(), Default::default()),
        );
        let result = f(self);
        self.current_function = saved_function;
        self.current_flow = saved_flow;
        result
    }

    // =========================================================================
    // Globals
    // =========================================================================

    pub fn compile_global(&mut self, element: ElementId) -> Result<(), CompileError> {
        let data = self.program.element(element);
        if data.flags.has(ElementFlags::COMPILED) {
            return Ok(());
        }
        let flags = data.flags;
        let internal_name = data.internal_name.clone();
        let location = data.location.clone();
        let is_builtin = data
            .decorators
            .has(crate::compiler::program::DecoratorFlags::BUILTIN);
        self.program
            .element_mut(element)
            .flags
            .set(ElementFlags::COMPILED);

        // Builtin-ambient globals like HEAP_BASE are only resolved; the
        // compiler provides them itself.
        if flags.has(ElementFlags::AMBIENT) && is_builtin {
            return Ok(());
        }

        let declaration = self.program.global(element).declaration.clone();
        let declared_type = match &declaration {
            Some(declarator) => match &declarator.type_node {
                Some(node) => self.program.resolve_type(node, &Default::default(), true),
                None => None,
            },
            None => None,
        };

        if flags.has(ElementFlags::AMBIENT) {
            let Some(ty) = declared_type else {
                self.error(
                    DiagnosticCode::TypeExpected,
                    "Ambient globals require a type annotation",
                    &location,
                );
                return Ok(());
            };
            let (module_name, external_name) = self.import_names(element);
            self.module.add_global_import(
                internal_name,
                module_name,
                external_name,
                ty.native_type(),
                !flags.has(ElementFlags::CONST),
            );
            self.program.global_mut(element).ty = Some(ty);
            self.program
                .element_mut(element)
                .flags
                .set(ElementFlags::MODULE_IMPORT);
            return Ok(());
        }

        let initializer = declaration.as_ref().and_then(|d| d.initializer.clone());
        let Some(initializer) = initializer else {
            if flags.has(ElementFlags::CONST) {
                self.error(
                    DiagnosticCode::ConstMissingInitializer,
                    "'const' declarations must be initialized",
                    &location,
                );
                return Ok(());
            }
            let Some(ty) = declared_type else {
                self.error(
                    DiagnosticCode::TypeExpected,
                    "Globals without an initializer require a type annotation",
                    &location,
                );
                return Ok(());
            };
            let zero = Literal::zero_of(ty.native_type()).unwrap_or(Literal::I32(0));
            self.module
                .add_global(internal_name, ty.native_type(), true, zero);
            self.program.global_mut(element).ty = Some(ty);
            return Ok(());
        };

        // Initialisers compile inside the start scope: an untyped global
        // gets a neutral contextual type so literal inference decides.
        let (init, ty) = self.in_start_scope(|compiler| {
            let (contextual, conversion) = match &declared_type {
                Some(ty) => (ty.clone(), ConversionKind::Implicit),
                None => (compiler.void_type(), ConversionKind::None),
            };
            let init =
                compiler.compile_expression(&initializer, &contextual, conversion, false)?;
            let ty = match &declared_type {
                Some(ty) => ty.clone(),
                None => compiler.current_type.clone(),
            };
            Ok::<_, CompileError>((init, ty))
        })?;
        if ty.is_void() {
            self.error(
                DiagnosticCode::VoidNotAllowed,
                "A global cannot be of type 'void'",
                &location,
            );
            return Ok(());
        }
        self.program.global_mut(element).ty = Some(ty.clone());

        match self.module.precompute(init) {
            Some(value) => {
                if flags.has(ElementFlags::CONST) {
                    // Inlined constant: no wasm global unless exported.
                    self.program.element_mut(element).flags.set(ElementFlags::INLINED);
                    self.program.global_mut(element).constant_value = Some(value);
                } else {
                    self.module
                        .add_global(internal_name, ty.native_type(), true, value);
                }
            }
            None => {
                if flags.has(ElementFlags::CONST) {
                    self.warning(
                        DiagnosticCode::NonConstantConstInitializer,
                        "Initializer is not a compile-time constant; compiling as mutable",
                        &location,
                    );
                }
                let zero = Literal::zero_of(ty.native_type()).unwrap_or(Literal::I32(0));
                self.module
                    .add_global(internal_name.clone(), ty.native_type(), true, zero);
                let assign = self.module.set_global(internal_name, init);
                self.start_body.push(assign);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Enums
    // =========================================================================

    pub fn compile_enum(&mut self, element: ElementId) -> Result<(), CompileError> {
        let data = self.program.element(element);
        if data.flags.has(ElementFlags::COMPILED) {
            return Ok(());
        }
        self.program
            .element_mut(element)
            .flags
            .set(ElementFlags::COMPILED);

        let saved_enum = self.current_enum.replace(element);
        let members = match &self.program.element(element).kind {
            ElementKind::Enum(e) => e.members.clone(),
            _ => Vec::new(),
        };
        let is_const_enum = self.program.element(element).flags.has(ElementFlags::CONST);

        let mut previous: Option<ElementId> = None;
        for member in members {
            self.compile_enum_value(member, previous, is_const_enum)?;
            previous = Some(member);
        }
        self.current_enum = saved_enum;
        Ok(())
    }

    fn compile_enum_value(
        &mut self,
        member: ElementId,
        previous: Option<ElementId>,
        is_const_enum: bool,
    ) -> Result<(), CompileError> {
        let data = self.program.element(member);
        let internal_name = data.internal_name.clone();
        let location = data.location.clone();
        let initializer = self.program.enum_value(member).initializer.clone();
        self.program
            .element_mut(member)
            .flags
            .set(ElementFlags::COMPILED);

        if let Some(initializer) = initializer {
            let init = self.in_start_scope(|compiler| {
                let i32_type = compiler.i32_type();
                compiler.compile_expression(&initializer, &i32_type, ConversionKind::Implicit, false)
            })?;
            match self.module.precompute(init) {
                Some(value) => {
                    self.program.enum_value_mut(member).constant_value = Some(value);
                    self.program
                        .element_mut(member)
                        .flags
                        .set(ElementFlags::INLINED);
                }
                None => {
                    if is_const_enum {
                        self.error(
                            DiagnosticCode::ConstEnumNonConstant,
                            "const enum member initializers must be compile-time constants",
                            &location,
                        );
                        return Ok(());
                    }
                    self.module
                        .add_global(internal_name.clone(), NativeType::I32, true, Literal::I32(0));
                    let assign = self.module.set_global(internal_name, init);
                    self.start_body.push(assign);
                }
            }
            return Ok(());
        }

        // No initializer: first member is 0, later members are
        // previous + 1.
        match previous {
            None => {
                self.program.enum_value_mut(member).constant_value = Some(Literal::I32(0));
                self.program
                    .element_mut(member)
                    .flags
                    .set(ElementFlags::INLINED);
            }
            Some(previous) => {
                let previous_value = self.program.enum_value(previous).constant_value;
                match previous_value {
                    Some(Literal::I32(value)) => {
                        self.program.enum_value_mut(member).constant_value =
                            Some(Literal::I32(value.wrapping_add(1)));
                        self.program
                            .element_mut(member)
                            .flags
                            .set(ElementFlags::INLINED);
                    }
                    _ => {
                        // The previous member lives in a mutable global.
                        if is_const_enum {
                            self.error(
                                DiagnosticCode::ConstEnumNonConstant,
                                "const enum members cannot follow a non-constant member",
                                &location,
                            );
                            return Ok(());
                        }
                        let previous_name = self.program.element(previous).internal_name.clone();
                        self.module.add_global(
                            internal_name.clone(),
                            NativeType::I32,
                            true,
                            Literal::I32(0),
                        );
                        let previous_get =
                            self.module.get_global(previous_name, NativeType::I32);
                        let one = self.module.i32(1);
                        let incremented =
                            self.module.binary(BinaryOp::AddI32, previous_get, one);
                        let assign = self.module.set_global(internal_name, incremented);
                        self.start_body.push(assign);
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Functions
    // =========================================================================

    /// Compile a function prototype: non-generic prototypes resolve to
    /// their single instance, generic ones compile whatever instances
    /// resolution has produced so far.
    pub fn compile_function_prototype(&mut self, element: ElementId) -> Result<(), CompileError> {
        let data = self.program.element(element);
        if data
            .decorators
            .has(crate::compiler::program::DecoratorFlags::BUILTIN)
        {
            return Ok(()); // builtins compile at their call sites
        }
        if data.flags.has(ElementFlags::GENERIC) {
            let instances: Vec<ElementId> = self
                .program
                .function_prototype(element)
                .instances
                .values()
                .copied()
                .collect();
            for instance in instances {
                self.compile_function(instance)?;
            }
            return Ok(());
        }
        if let Some(instance) = self.program.resolve_function(element, &[], None) {
            self.compile_function(instance)?;
        }
        Ok(())
    }

    /// Compile one resolved function instance. Ambient functions become
    /// imports; concrete functions get their bodies lowered.
    pub fn compile_function(&mut self, instance: ElementId) -> Result<(), CompileError> {
        let data = self.program.element(instance);
        if data.flags.has(ElementFlags::COMPILED) {
            return Ok(());
        }
        let flags = data.flags;
        let internal_name = data.internal_name.clone();
        let location = data.location.clone();
        self.program
            .element_mut(instance)
            .flags
            .set(ElementFlags::COMPILED);

        let function = self.program.function(instance);
        let signature = function.signature.clone();
        let contextual_type_arguments = function.contextual_type_arguments.clone();
        let prototype = function.prototype;
        let declaration = self.program.function_prototype(prototype).declaration.clone();

        if flags.has(ElementFlags::AMBIENT) {
            if declaration.body.is_some() {
                self.error(
                    DiagnosticCode::AmbientMustNotHaveBody,
                    "An ambient function cannot have a body",
                    &location,
                );
            }
            let (module_name, external_name) = self.import_names(instance);
            self.module.add_function_import(
                internal_name,
                module_name,
                external_name,
                &signature.native_params(),
                signature.native_result(),
            );
            self.program
                .element_mut(instance)
                .flags
                .set(ElementFlags::MODULE_IMPORT);
            return Ok(());
        }

        let Some(body) = declaration.body else {
            self.error(
                DiagnosticCode::ImplementationMissing,
                "Function implementation is missing",
                &location,
            );
            return Ok(());
        };

        let return_type = signature.return_type.clone();
        let saved_function = std::mem::replace(&mut self.current_function, instance);
        let saved_flow = std::mem::replace(
            &mut self.current_flow,
            Flow::create(return_type.clone(), contextual_type_arguments),
        );

        let mut statements: Vec<ExprRef> = Vec::new();

        // `main` boots the start function before its own body so
        // module-level initialisation runs exactly once.
        if flags.has(ElementFlags::MAIN) {
            self.main_function = Some(instance);
            self.ensure_started_var();
            let started = self.module.get_global(STARTED_GLOBAL, NativeType::I32);
            let not_started = self.module.unary(UnaryOp::EqzI32, started);
            let call_start = self.module.call(START_FUNCTION_NAME, Vec::new(), NativeType::None);
            let one = self.module.i32(1);
            let mark_started = self.module.set_global(STARTED_GLOBAL, one);
            let boot = self
                .module
                .block(None, vec![call_start, mark_started], NativeType::None);
            let guard = self.module.if_(not_started, boot, None, NativeType::None);
            statements.push(guard);
        }

        let native_result = return_type.native_type();
        let body = match body {
            ast::FunctionBody::Expression(expression) => {
                // Arrow body: the expression is the return value; exported
                // functions wrap small-integer results.
                let wrap = flags.has(ElementFlags::EXPORT);
                let value = self.compile_expression(
                    &expression,
                    &return_type,
                    ConversionKind::Implicit,
                    wrap,
                )?;
                self.current_flow.flags.set(FlowFlags::RETURNS);
                statements.push(value);
                self.module.block(None, statements, native_result)
            }
            ast::FunctionBody::Statements(list) => {
                for statement in &list {
                    let compiled = self.compile_statement(statement)?;
                    statements.push(compiled);
                }
                if flags.has(ElementFlags::CONSTRUCTOR) {
                    self.append_constructor_epilogue(&mut statements, &signature, &location)?;
                    self.module.block(None, statements, native_result)
                } else if !return_type.is_void() {
                    if !self.current_flow.flags.has(FlowFlags::RETURNS) {
                        self.error(
                            DiagnosticCode::TypeExpected,
                            format!("A function returning '{}' must return a value", return_type),
                            &location,
                        );
                    }
                    // Terminating paths satisfy the result type; the tail
                    // is never reached.
                    let tail = self.module.unreachable();
                    statements.push(tail);
                    self.module.block(None, statements, NativeType::None)
                } else {
                    self.module.block(None, statements, NativeType::None)
                }
            }
        };

        let additional_locals = self
            .program
            .function(instance)
            .additional_local_types();
        self.module.add_function(
            internal_name,
            signature.native_params(),
            native_result,
            additional_locals,
            body,
        );

        self.current_function = saved_function;
        self.current_flow = saved_flow;
        Ok(())
    }

    /// A constructor that falls off its end returns `this`, allocating it
    /// first unless every path already did (derived-class `super` calls
    /// pre-allocate).
    fn append_constructor_epilogue(
        &mut self,
        statements: &mut Vec<ExprRef>,
        signature: &crate::compiler::program::Signature,
        location: &crate::compiler::tokens::TextLocation,
    ) -> Result<(), CompileError> {
        if self.current_flow.flags.has(FlowFlags::RETURNS) {
            // Every path already returned; the tail is never reached.
            let tail = self.module.unreachable();
            statements.push(tail);
            return Ok(());
        }
        let pointer = self.pointer_native_type();
        if self.current_flow.flags.has(FlowFlags::ALLOCATES) {
            let this_ref = self.module.get_local(0, pointer);
            statements.push(this_ref);
        } else {
            let class = signature
                .this_type
                .as_ref()
                .and_then(|ty| ty.class_reference)
                .ok_or_else(|| {
                    CompileError::internal("constructor signature carries no class")
                })?;
            let allocate = self.make_conditional_allocate(class, location)?;
            let tee = self.module.tee_local(0, allocate, pointer);
            statements.push(tee);
        }
        Ok(())
    }

    // =========================================================================
    // Classes and namespaces
    // =========================================================================

    /// Compile a class prototype: non-generic prototypes resolve to their
    /// single instance, generic ones compile resolved instances.
    pub fn compile_class_prototype(&mut self, element: ElementId) -> Result<(), CompileError> {
        let data = self.program.element(element);
        if data.flags.has(ElementFlags::GENERIC) {
            let instances: Vec<ElementId> = self
                .program
                .class_prototype(element)
                .instances
                .values()
                .copied()
                .collect();
            for instance in instances {
                self.compile_class(instance)?;
            }
            return Ok(());
        }
        if let Some(instance) = self.program.resolve_class(element, &[]) {
            self.compile_class(instance)?;
        }
        Ok(())
    }

    /// Compile a class instance: statics first, then the constructor,
    /// then instance members. Field layout was precomputed at resolution;
    /// fields are only marked compiled.
    pub fn compile_class(&mut self, class: ElementId) -> Result<(), CompileError> {
        let data = self.program.element(class);
        if data.flags.has(ElementFlags::COMPILED) {
            return Ok(());
        }
        self.program
            .element_mut(class)
            .flags
            .set(ElementFlags::COMPILED);

        let class_data = self.program.class(class);
        let statics: Vec<ElementId> = class_data.statics.values().copied().collect();
        let constructor = class_data.constructor;
        let members: Vec<ElementId> = class_data.members.values().copied().collect();

        for static_member in statics {
            match self.program.element(static_member).kind.tag() {
                ElementTag::Global => self.compile_global(static_member)?,
                ElementTag::FunctionPrototype => {
                    self.compile_method_prototype(static_member, class)?
                }
                ElementTag::Property => self.compile_property(static_member, class)?,
                _ => {}
            }
        }

        if let Some(constructor) = constructor {
            if let Some(instance) = self.program.resolve_function(constructor, &[], Some(class)) {
                self.compile_function(instance)?;
            }
        }

        for member in members {
            match self.program.element(member).kind.tag() {
                ElementTag::FunctionPrototype => {
                    self.compile_method_prototype(member, class)?
                }
                ElementTag::Property => self.compile_property(member, class)?,
                ElementTag::Field => {
                    self.program
                        .element_mut(member)
                        .flags
                        .set(ElementFlags::COMPILED);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn compile_method_prototype(
        &mut self,
        prototype: ElementId,
        class: ElementId,
    ) -> Result<(), CompileError> {
        if self.program.element(prototype).flags.has(ElementFlags::GENERIC) {
            let instances: Vec<ElementId> = self
                .program
                .function_prototype(prototype)
                .instances
                .values()
                .copied()
                .collect();
            for instance in instances {
                self.compile_function(instance)?;
            }
            return Ok(());
        }
        if let Some(instance) = self.program.resolve_function(prototype, &[], Some(class)) {
            self.compile_function(instance)?;
        }
        Ok(())
    }

    fn compile_property(
        &mut self,
        property: ElementId,
        class: ElementId,
    ) -> Result<(), CompileError> {
        let (getter, setter) = match &self.program.element(property).kind {
            ElementKind::Property(p) => (p.getter, p.setter),
            _ => return Ok(()),
        };
        if let Some(getter) = getter {
            self.compile_method_prototype(getter, class)?;
        }
        if let Some(setter) = setter {
            self.compile_method_prototype(setter, class)?;
        }
        Ok(())
    }

    pub fn compile_namespace(&mut self, namespace: ElementId) -> Result<(), CompileError> {
        let members: Vec<ElementId> = match &self.program.element(namespace).kind {
            ElementKind::Namespace(ns) => ns.members.values().copied().collect(),
            _ => return Ok(()),
        };
        for member in members {
            self.compile_element(member)?;
        }
        Ok(())
    }

    // =========================================================================
    // Import name mangling
    // =========================================================================

    /// The `(module, name)` pair an ambient element imports under.
    /// `@external` overrides either part; the module defaults to the
    /// containing namespace's simple name, or the source's simple path at
    /// top level.
    pub(crate) fn import_names(&self, element: ElementId) -> (String, String) {
        let data = self.program.element(element);
        let override_names = match &data.kind {
            ElementKind::FunctionPrototype(p) => p.external_name.clone(),
            ElementKind::Function(f) => self
                .program
                .function_prototype(f.prototype)
                .external_name
                .clone(),
            ElementKind::Global(g) => g.external_name.clone(),
            _ => None,
        };
        let default_module = match data.parent {
            Some(parent)
                if matches!(self.program.element(parent).kind, ElementKind::Namespace(_)) =>
            {
                self.program.element(parent).name.clone()
            }
            _ => data
                .internal_name
                .split('/')
                .next()
                .unwrap_or("env")
                .to_string(),
        };
        match override_names {
            Some((module, name)) => (
                module.unwrap_or(default_module),
                name.unwrap_or_else(|| data.name.clone()),
            ),
            None => (default_module, data.name.clone()),
        }
    }
}
