//! The compiler core: options, state and the top-level driver.
//!
//! [`Compiler`] walks the resolved program and produces a [`WirModule`].
//! It owns all mutable compilation state (the module under construction,
//! the current function and flow, the static memory cursor, the function
//! table and the inline stack) and threads itself through the recursive
//! lowering in the sibling modules:
//!
//! - `declarations`: globals, enums, functions, classes, namespaces
//! - `statements`: control flow and local declarations
//! - `expressions`: type-directed expression lowering
//! - `calls`: call sites, the function table and trampolines
//! - `conversions`: the numeric lattice operations
//! - `memory`: static segments, strings and arrays
//!
//! Elements compile at most once (the `COMPILED` flag); compilation keeps
//! going across user errors so the diagnostic bag ends up complete.

use crate::compiler::ast;
use crate::compiler::diagnostics::{CompileError, DiagnosticCode};
use crate::compiler::flow::Flow;
use crate::compiler::program::{
    ElementData, ElementFlags, ElementId, ElementKind, ElementTag, Function, FunctionPrototype,
    Program, Signature,
};
use crate::compiler::tokens::TextLocation;
use crate::compiler::types::{Type, TypeKind};
use crate::compiler::wir::module::{ExportItem, WirModule, PAGE_SIZE};
use crate::compiler::wir::nodes::{ExprRef, Literal, NativeType};
use rustc_hash::{FxHashMap, FxHashSet};

/// Compilation target. Decides pointer width and therefore the width of
/// `usize`/`isize` and references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    #[default]
    Wasm32,
    Wasm64,
}

impl Target {
    pub fn pointer_size(self) -> u32 {
        match self {
            Target::Wasm32 => 4,
            Target::Wasm64 => 8,
        }
    }

    /// Upper bound on memory pages for the target.
    pub fn max_pages(self) -> u64 {
        match self {
            Target::Wasm32 => 0x1_0000,       // 4 GiB
            Target::Wasm64 => 0x1_0000_0000,  // 16 EiB address space, capped
        }
    }
}

/// Optional post-MVP WASM features the compiler may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Feature(u32);

impl Feature {
    pub const NONE: Feature = Feature(0);
    /// `i32.extend8_s` / `i32.extend16_s` for small-integer wrapping.
    pub const SIGN_EXTENSION: Feature = Feature(1 << 0);
    /// Mutable globals may be exported.
    pub const MUTABLE_GLOBAL: Feature = Feature(1 << 1);

    pub fn has(self, feature: Feature) -> bool {
        self.0 & feature.0 == feature.0
    }

    pub fn with(self, feature: Feature) -> Feature {
        Feature(self.0 | feature.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompilerOptions {
    pub target: Target,
    /// Compile every declaration regardless of export reachability.
    pub no_tree_shaking: bool,
    /// Replace assertions with nops.
    pub no_assert: bool,
    /// Import memory as `env.memory` instead of defining it.
    pub import_memory: bool,
    /// Import the function table as `env.table`.
    pub import_table: bool,
    /// Record one source location per emitted IR node.
    pub source_map: bool,
    /// Static memory start offset; the effective lower bound is 8.
    pub memory_base: u64,
    /// Export-name overrides applied when generating module exports.
    pub global_aliases: FxHashMap<String, String>,
    pub features: Feature,
}

impl CompilerOptions {
    pub fn pointer_size(&self) -> u32 {
        self.target.pointer_size()
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.has(feature)
    }
}

/// How an expression's type is reconciled with its contextual type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionKind {
    /// No conversion; the contextual type only guides literal inference.
    None,
    /// Implicit conversion; incompatible types are a diagnostic.
    Implicit,
    /// Explicit conversion (`as`); lossy conversions are permitted.
    Explicit,
}

pub const START_FUNCTION_NAME: &str = "start";
pub const ARGC_GLOBAL: &str = "~argc";
pub const SETARGC_EXPORT: &str = "~setargc";
pub const STARTED_GLOBAL: &str = "~started";
pub const HEAP_BASE_GLOBAL: &str = "HEAP_BASE";

/// The code generator. One instance per compilation.
pub struct Compiler<'a> {
    pub program: &'a mut Program,
    pub options: CompilerOptions,
    pub module: WirModule,

    /// The function being compiled into; the synthetic start function
    /// outside of any user function.
    pub current_function: ElementId,
    pub current_flow: Flow,
    /// The source-level type of the last compiled expression.
    pub current_type: Type,
    /// The enum whose members are being evaluated, if any.
    pub current_enum: Option<ElementId>,

    /// Statements accumulated for the start function.
    pub start_body: Vec<ExprRef>,
    pub start_function: ElementId,
    pub main_function: Option<ElementId>,

    /// Next static memory offset; monotonically non-decreasing.
    pub memory_offset: u64,
    /// Canonicalised static strings: content -> pointer.
    pub(crate) string_segments: FxHashMap<String, u64>,

    /// Function-table slots in index order.
    pub function_table: Vec<ElementId>,
    /// Inline expansion stack, for recursion suppression.
    pub current_inline_functions: Vec<ElementId>,

    /// Monotonic break-context counter for loop/switch labels.
    pub(crate) next_break_id: u32,
    pub(crate) break_stack: Vec<u32>,

    pub(crate) argc_var_created: bool,
    pub(crate) started_var_created: bool,

    /// GC hook indices per class, in registration order.
    pub gc_hook_indices: FxHashMap<ElementId, i32>,

    /// Memoised `Math.pow` / `Mathf.pow` / `Math.mod` / `Mathf.mod`.
    pub(crate) math_instances: FxHashMap<&'static str, ElementId>,

    compiled_sources: FxHashSet<String>,
    export_queue: Vec<(String, ElementId)>,
}

impl<'a> Compiler<'a> {
    pub fn new(program: &'a mut Program, options: CompilerOptions) -> Compiler<'a> {
        let pointer_size = options.pointer_size();
        program.initialize(pointer_size);

        // Synthesise the start function element up front so top-level
        // statements always compile inside a function scope.
        let start_prototype = program.add_element(ElementData {
            kind: ElementKind::FunctionPrototype(FunctionPrototype {
                declaration: ast::FunctionDeclaration {
                    type_parameters: Vec::new(),
                    parameters: Vec::new(),
                    return_type: None,
                    body: None,
                },
                class_prototype: None,
                instances: FxHashMap::default(),
                operator_kind: None,
                external_name: None,
            }),
            name: START_FUNCTION_NAME.to_string(),
            internal_name: START_FUNCTION_NAME.to_string(),
            flags: ElementFlags::NONE,
            decorators: Default::default(),
            parent: None,
            location: TextLocation::default(),
        });
        let signature = Signature {
            parameter_types: Vec::new(),
            required_parameters: 0,
            return_type: Type::of(TypeKind::Void, pointer_size),
            this_type: None,
        };
        let start_function = program.add_element(ElementData {
            kind: ElementKind::Function(Function::new(
                start_prototype,
                signature.clone(),
                Vec::new(),
            )),
            name: START_FUNCTION_NAME.to_string(),
            internal_name: START_FUNCTION_NAME.to_string(),
            flags: ElementFlags::NONE,
            decorators: Default::default(),
            parent: None,
            location: TextLocation::default(),
        });

        let void_type = Type::of(TypeKind::Void, pointer_size);
        let mut module = WirModule::new();
        module.memory64 = options.target == Target::Wasm64;
        module.import_memory = options.import_memory;
        module.import_table = options.import_table;

        Compiler {
            program,
            memory_offset: options.memory_base.max(8),
            options,
            module,
            current_function: start_function,
            current_flow: Flow::create(void_type.clone(), FxHashMap::default()),
            current_type: void_type,
            current_enum: None,
            start_body: Vec::new(),
            start_function,
            main_function: None,
            string_segments: FxHashMap::default(),
            function_table: Vec::new(),
            current_inline_functions: Vec::new(),
            next_break_id: 0,
            break_stack: Vec::new(),
            argc_var_created: false,
            started_var_created: false,
            gc_hook_indices: FxHashMap::default(),
            math_instances: FxHashMap::default(),
            compiled_sources: FxHashSet::default(),
            export_queue: Vec::new(),
        }
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    pub fn error(&mut self, code: DiagnosticCode, msg: impl Into<String>, location: &TextLocation) {
        self.program.messages.error(code, msg, location);
    }

    pub fn warning(
        &mut self,
        code: DiagnosticCode,
        msg: impl Into<String>,
        location: &TextLocation,
    ) {
        self.program.messages.warning(code, msg, location);
    }

    /// Emit an `unreachable` stub and pretend the contextual type was
    /// produced, so compilation can continue past the error.
    pub fn unreachable_with_type(&mut self, contextual_type: &Type) -> ExprRef {
        self.current_type = contextual_type.clone();
        self.module.unreachable()
    }

    pub fn operation_not_supported(
        &mut self,
        what: &str,
        location: &TextLocation,
        contextual_type: &Type,
    ) -> ExprRef {
        self.error(
            DiagnosticCode::OperationNotSupported,
            format!("{} is not supported", what),
            location,
        );
        self.unreachable_with_type(contextual_type)
    }

    // =========================================================================
    // Shared type shorthands
    // =========================================================================

    pub fn void_type(&self) -> Type {
        self.program.void_type()
    }

    pub fn bool_type(&self) -> Type {
        self.program.bool_type()
    }

    pub fn i32_type(&self) -> Type {
        self.program.i32_type()
    }

    pub fn usize_type(&self) -> Type {
        self.program.usize_type()
    }

    pub fn pointer_native_type(&self) -> NativeType {
        if self.options.target == Target::Wasm64 {
            NativeType::I64
        } else {
            NativeType::I32
        }
    }

    pub fn pointer_literal(&self, value: u64) -> Literal {
        if self.options.target == Target::Wasm64 {
            Literal::I64(value as i64)
        } else {
            Literal::I32(value as i32)
        }
    }

    // =========================================================================
    // Driver
    // =========================================================================

    /// Compile the whole program: every entry source's top-level
    /// statements, then the synthetic start function, static memory, the
    /// function table and module exports.
    pub fn compile(mut self) -> Result<WirModule, CompileError> {
        let entry_indices: Vec<usize> = self
            .program
            .sources
            .iter()
            .enumerate()
            .filter(|(_, source)| source.is_entry)
            .map(|(index, _)| index)
            .collect();
        for index in entry_indices {
            self.compile_source(index)?;
        }
        self.finalize()?;
        Ok(self.module)
    }

    pub(crate) fn compile_source(&mut self, index: usize) -> Result<(), CompileError> {
        let source = &self.program.sources[index];
        if !self.compiled_sources.insert(source.path.clone()) {
            return Ok(());
        }
        let is_entry = source.is_entry;
        let statements = source.statements.clone();
        for statement in &statements {
            self.compile_top_level_statement(statement, is_entry)?;
        }
        Ok(())
    }

    fn compile_source_by_path(&mut self, path: &str) -> Result<(), CompileError> {
        let index = self
            .program
            .sources
            .iter()
            .position(|source| source.path == path || source.simple_path() == path);
        match index {
            Some(index) => self.compile_source(index),
            None => {
                // Unresolvable import paths were already reported upstream.
                Ok(())
            }
        }
    }

    fn compile_top_level_statement(
        &mut self,
        statement: &ast::Statement,
        is_entry: bool,
    ) -> Result<(), CompileError> {
        match &statement.kind {
            ast::StatementKind::Declaration(declaration) => {
                let exported = is_entry && declaration.has_modifier(ast::Modifier::Export);
                let Some(element) = self.program.lookup(&declaration.name) else {
                    return Ok(()); // e.g. interfaces; already reported
                };
                if exported {
                    self.export_queue.push((declaration.name.clone(), element));
                }
                if self.options.no_tree_shaking || exported {
                    self.compile_element(element)?;
                }
            }
            ast::StatementKind::Variable(variable) => {
                // Top-level variables are globals; they always compile
                // because their initialisers are observable.
                let exported = is_entry && variable.modifiers.contains(&ast::Modifier::Export);
                for declarator in &variable.declarations {
                    let Some(element) = self.program.lookup(&declarator.name) else {
                        continue;
                    };
                    if exported {
                        self.export_queue.push((declarator.name.clone(), element));
                    }
                    self.compile_global(element)?;
                }
            }
            ast::StatementKind::Import { path, .. } => {
                self.compile_source_by_path(path)?;
            }
            _ => {
                let compiled = self.compile_statement(statement)?;
                if !matches!(
                    self.module.node(compiled),
                    crate::compiler::wir::nodes::ExprNode::Nop
                ) {
                    self.start_body.push(compiled);
                }
            }
        }
        Ok(())
    }

    /// Dispatch an element to the matching declaration compiler.
    pub fn compile_element(&mut self, element: ElementId) -> Result<(), CompileError> {
        match self.program.element(element).kind.tag() {
            ElementTag::Global => self.compile_global(element),
            ElementTag::Enum => self.compile_enum(element),
            ElementTag::FunctionPrototype => self.compile_function_prototype(element),
            ElementTag::ClassPrototype => self.compile_class_prototype(element),
            ElementTag::Namespace => self.compile_namespace(element),
            ElementTag::Function => self.compile_function(element),
            ElementTag::Class => self.compile_class(element),
            _ => Ok(()),
        }
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    fn finalize(&mut self) -> Result<(), CompileError> {
        // Module-level exports first: expanding them may compile more
        // code, which can still add static data, start-time
        // initialisation and table entries.
        let queue = std::mem::take(&mut self.export_queue);
        for (name, element) in queue {
            self.make_module_export(&name, element)?;
        }

        // Start function: added when it has a body or a `main` needs it.
        if !self.start_body.is_empty() || self.main_function.is_some() {
            let body = std::mem::take(&mut self.start_body);
            let body = self.module.block(None, body, NativeType::None);
            let locals = self
                .program
                .function(self.start_function)
                .additional_local_types();
            self.module.add_function(
                START_FUNCTION_NAME,
                Vec::new(),
                NativeType::None,
                locals,
                body,
            );
            if self.main_function.is_none() {
                self.module.set_start(START_FUNCTION_NAME);
            }
        }

        // Seal static memory and export the heap base.
        self.memory_offset = align_up(self.memory_offset, 8);
        let pointer_size = self.options.pointer_size() as u64;
        let heap_base = align_up(self.memory_offset, pointer_size);
        self.module.add_global(
            HEAP_BASE_GLOBAL,
            self.pointer_native_type(),
            false,
            self.pointer_literal(heap_base),
        );
        self.module
            .add_export(HEAP_BASE_GLOBAL, ExportItem::Global(HEAP_BASE_GLOBAL.into()));

        self.module.initial_pages = self.memory_offset.div_ceil(PAGE_SIZE).max(1);
        self.module.max_pages = Some(self.options.target.max_pages());
        if !self.options.import_memory {
            self.module.add_export("memory", ExportItem::Memory);
        }

        // Materialise the function table.
        let table: Vec<String> = self
            .function_table
            .iter()
            .map(|&element| self.program.element(element).internal_name.clone())
            .collect();
        self.module.table = table;

        // GC support: only generated when some class registered a hook.
        if !self.gc_hook_indices.is_empty() {
            crate::compiler::builtins::compile_iterate_roots(self)?;
        }

        Ok(())
    }

    fn export_alias(&self, name: &str) -> String {
        self.options
            .global_aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    /// Translate one module-level export into module exports, expanding
    /// prototypes, classes and namespaces.
    fn make_module_export(&mut self, name: &str, element: ElementId) -> Result<(), CompileError> {
        let alias = self.export_alias(name);
        let data = self.program.element(element);
        let tag = data.kind.tag();
        let flags = data.flags;
        let location = data.location.clone();
        match tag {
            ElementTag::Function => {
                let internal = self.program.element(element).internal_name.clone();
                self.compile_function(element)?;
                if !self.module.has_export(&alias) {
                    self.module.add_export(alias, ExportItem::Function(internal));
                }
            }
            ElementTag::FunctionPrototype => {
                if flags.has(ElementFlags::GENERIC) {
                    // One export per concrete instance, type arguments
                    // suffixed to the name.
                    let instances: Vec<ElementId> = self
                        .program
                        .function_prototype(element)
                        .instances
                        .values()
                        .copied()
                        .collect();
                    for instance in instances {
                        let suffix = self
                            .program
                            .element(instance)
                            .internal_name
                            .rsplit_once('<')
                            .map(|(_, args)| format!("<{}", args))
                            .unwrap_or_default();
                        let export_name = format!("{}{}", alias, suffix);
                        self.make_function_export(&export_name, instance)?;
                    }
                } else {
                    let instance = self.program.resolve_function(element, &[], None);
                    if let Some(instance) = instance {
                        self.make_function_export(&alias, instance)?;
                    }
                }
            }
            ElementTag::Global => {
                self.compile_global(element)?;
                self.make_global_export(&alias, element, &location)?;
            }
            ElementTag::Enum => {
                let members = match &self.program.element(element).kind {
                    ElementKind::Enum(e) => e.members.clone(),
                    _ => Vec::new(),
                };
                self.compile_enum(element)?;
                for member in members {
                    let member_name = self.program.element(member).name.clone();
                    let export_name = format!("{}.{}", alias, member_name);
                    self.make_enum_value_export(&export_name, member)?;
                }
            }
            ElementTag::ClassPrototype => {
                if !flags.has(ElementFlags::GENERIC) {
                    self.program.resolve_class(element, &[]);
                }
                let instances: Vec<ElementId> = self
                    .program
                    .class_prototype(element)
                    .instances
                    .values()
                    .copied()
                    .collect();
                for instance in instances {
                    self.make_class_exports(&alias, instance)?;
                }
            }
            ElementTag::Namespace => {
                let members: Vec<(String, ElementId)> = match &self.program.element(element).kind
                {
                    ElementKind::Namespace(ns) => ns
                        .members
                        .iter()
                        .map(|(name, &id)| (name.clone(), id))
                        .collect(),
                    _ => Vec::new(),
                };
                for (member_name, member) in members {
                    if self.program.element(member).flags.has(ElementFlags::PRIVATE) {
                        continue;
                    }
                    let export_name = format!("{}.{}", alias, member_name);
                    self.make_module_export(&export_name, member)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn make_function_export(
        &mut self,
        export_name: &str,
        instance: ElementId,
    ) -> Result<(), CompileError> {
        self.compile_function(instance)?;
        let data = self.program.element(instance);
        if data.flags.has(ElementFlags::COMPILED) && !self.module.has_export(export_name) {
            let internal = data.internal_name.clone();
            self.module
                .add_export(export_name, ExportItem::Function(internal));
        }
        Ok(())
    }

    fn make_global_export(
        &mut self,
        export_name: &str,
        element: ElementId,
        location: &TextLocation,
    ) -> Result<(), CompileError> {
        let data = self.program.element(element);
        let internal = data.internal_name.clone();
        let is_const = data.flags.has(ElementFlags::CONST);
        let inlined = data.flags.has(ElementFlags::INLINED);
        if inlined {
            // Materialise a constant wasm global to carry the export.
            let global = self.program.global(element);
            let ty = global.ty.clone().unwrap_or_else(|| self.i32_type());
            let value = global
                .constant_value
                .unwrap_or(Literal::I32(0));
            if !self.module.has_global(&internal) {
                self.module
                    .add_global(internal.clone(), ty.native_type(), false, value);
            }
        } else if !is_const && !self.options.has_feature(Feature::MUTABLE_GLOBAL) {
            self.error(
                DiagnosticCode::MutableGlobalExportUnavailable,
                format!(
                    "Cannot export mutable global '{}' without the mutable-global feature",
                    export_name
                ),
                location,
            );
            return Ok(());
        }
        if self.module.has_global(&internal) && !self.module.has_export(export_name) {
            self.module
                .add_export(export_name, ExportItem::Global(internal));
        }
        Ok(())
    }

    fn make_enum_value_export(
        &mut self,
        export_name: &str,
        member: ElementId,
    ) -> Result<(), CompileError> {
        let data = self.program.element(member);
        let internal = data.internal_name.clone();
        if data.flags.has(ElementFlags::INLINED) {
            let value = self
                .program
                .enum_value(member)
                .constant_value
                .unwrap_or(Literal::I32(0));
            if !self.module.has_global(&internal) {
                self.module
                    .add_global(internal.clone(), NativeType::I32, false, value);
            }
        }
        if self.module.has_global(&internal) && !self.module.has_export(export_name) {
            self.module
                .add_export(export_name, ExportItem::Global(internal));
        }
        Ok(())
    }

    /// Export a class instance: statics and instance members through
    /// mangled outer names, fields through synthesised accessors. Private
    /// members are skipped.
    fn make_class_exports(&mut self, alias: &str, class: ElementId) -> Result<(), CompileError> {
        self.compile_class(class)?;
        let data = self.program.element(class);
        let suffix = data
            .internal_name
            .rsplit_once('<')
            .map(|(_, args)| format!("<{}", args))
            .unwrap_or_default();
        let prefix = format!("{}{}", alias, suffix);
        let class_data = self.program.class(class);
        let statics: Vec<(String, ElementId)> = class_data
            .statics
            .iter()
            .map(|(name, &id)| (name.clone(), id))
            .collect();
        let members: Vec<(String, ElementId)> = class_data
            .members
            .iter()
            .map(|(name, &id)| (name.clone(), id))
            .collect();

        for (member_name, member) in statics {
            let member_data = self.program.element(member);
            if member_data.flags.has(ElementFlags::PRIVATE) {
                continue;
            }
            let tag = member_data.kind.tag();
            let location = member_data.location.clone();
            let export_name = format!("{}.{}", prefix, member_name);
            match tag {
                ElementTag::Global => {
                    self.compile_global(member)?;
                    self.make_global_export(&export_name, member, &location)?;
                }
                ElementTag::FunctionPrototype => {
                    if let Some(instance) = self.program.resolve_function(member, &[], Some(class))
                    {
                        self.make_function_export(&export_name, instance)?;
                    }
                }
                _ => {}
            }
        }
        for (member_name, member) in members {
            let member_data = self.program.element(member);
            if member_data.flags.has(ElementFlags::PRIVATE) {
                continue;
            }
            let tag = member_data.kind.tag();
            let generic = member_data.flags.has(ElementFlags::GENERIC);
            match tag {
                ElementTag::FunctionPrototype if !generic => {
                    let export_name = format!("{}#{}", prefix, member_name);
                    if let Some(instance) = self.program.resolve_function(member, &[], Some(class))
                    {
                        self.make_function_export(&export_name, instance)?;
                    }
                }
                ElementTag::Field => {
                    self.make_field_accessor_exports(&prefix, &member_name, member)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Synthesise `get:`/`set:` accessor functions doing a direct load and
    /// store at the field's offset, and export them.
    fn make_field_accessor_exports(
        &mut self,
        prefix: &str,
        field_name: &str,
        field: ElementId,
    ) -> Result<(), CompileError> {
        let (ty, offset, readonly) = {
            let data = self.program.element(field);
            let readonly = data.flags.has(ElementFlags::READONLY);
            let field = self.program.field(field);
            (field.ty.clone(), field.memory_offset, readonly)
        };
        let native = ty.native_type();
        let pointer = self.pointer_native_type();
        let internal_get = format!("{}#get:{}", prefix, field_name);
        let this_ref = self.module.get_local(0, pointer);
        let load = self.module.load(
            ty.size as u8,
            ty.is_signed() && ty.is_integer(),
            this_ref,
            native,
            offset,
        );
        self.module.add_function(
            internal_get.clone(),
            vec![pointer],
            native,
            Vec::new(),
            load,
        );
        self.module
            .add_export(internal_get.clone(), ExportItem::Function(internal_get));

        if !readonly {
            let internal_set = format!("{}#set:{}", prefix, field_name);
            let this_ref = self.module.get_local(0, pointer);
            let value = self.module.get_local(1, native);
            let store = self
                .module
                .store(ty.size as u8, this_ref, value, native, offset);
            self.module.add_function(
                internal_set.clone(),
                vec![pointer, native],
                NativeType::None,
                Vec::new(),
                store,
            );
            self.module
                .add_export(internal_set.clone(), ExportItem::Function(internal_set));
        }
        Ok(())
    }

    // =========================================================================
    // Shared helpers
    // =========================================================================

    /// Lazily create the `~argc` global and its `~setargc` export, used
    /// by the optional-argument trampoline protocol.
    pub fn ensure_argc_var(&mut self) {
        if self.argc_var_created {
            return;
        }
        self.argc_var_created = true;
        self.module
            .add_global(ARGC_GLOBAL, NativeType::I32, true, Literal::I32(0));
        let value = self.module.get_local(0, NativeType::I32);
        let body = self.module.set_global(ARGC_GLOBAL, value);
        self.module.add_function(
            SETARGC_EXPORT,
            vec![NativeType::I32],
            NativeType::None,
            Vec::new(),
            body,
        );
        self.module
            .add_export(SETARGC_EXPORT, ExportItem::Function(SETARGC_EXPORT.into()));
    }

    /// Lazily create the `~started` global used by the `main` wrapper.
    pub fn ensure_started_var(&mut self) {
        if self.started_var_created {
            return;
        }
        self.started_var_created = true;
        self.module
            .add_global(STARTED_GLOBAL, NativeType::I32, true, Literal::I32(0));
    }

    /// Resolve and memoise a `Math`/`Mathf` namespace function such as
    /// `pow` or `mod`, used to lower float `**` and `%`.
    pub fn resolve_math_function(
        &mut self,
        key: &'static str,
        namespace: &str,
        name: &str,
        location: &TextLocation,
    ) -> Option<ElementId> {
        if let Some(&instance) = self.math_instances.get(key) {
            return Some(instance);
        }
        let ns = self.program.lookup(namespace)?;
        let prototype = self.program.namespace_member(ns, name)?;
        if !matches!(
            self.program.element(prototype).kind,
            ElementKind::FunctionPrototype(_)
        ) {
            return None;
        }
        let instance = self.program.resolve_function(prototype, &[], None)?;
        if self.compile_function(instance).is_err() {
            self.error(
                DiagnosticCode::OperationNotSupported,
                format!("'{}.{}' could not be compiled", namespace, name),
                location,
            );
            return None;
        }
        self.math_instances.insert(key, instance);
        Some(instance)
    }

    /// The next unique break-context id.
    pub(crate) fn enter_break_context(&mut self) -> u32 {
        let id = self.next_break_id;
        self.next_break_id += 1;
        self.break_stack.push(id);
        id
    }

    pub(crate) fn exit_break_context(&mut self) {
        self.break_stack.pop();
    }
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_bits_compose() {
        let features = Feature::NONE
            .with(Feature::SIGN_EXTENSION)
            .with(Feature::MUTABLE_GLOBAL);
        assert!(features.has(Feature::SIGN_EXTENSION));
        assert!(features.has(Feature::MUTABLE_GLOBAL));
        assert!(!Feature::NONE.has(Feature::SIGN_EXTENSION));
    }

    #[test]
    fn targets_decide_pointer_width() {
        assert_eq!(Target::Wasm32.pointer_size(), 4);
        assert_eq!(Target::Wasm64.pointer_size(), 8);
    }

    #[test]
    fn align_up_is_idempotent_on_aligned_values() {
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(13, 1), 13);
    }
}
