//! WIR module builder and encoder.
//!
//! [`WirModule`] owns the expression-node arena plus everything that
//! becomes a WASM section: the deduplicated function-type pool, imports,
//! functions, globals, memory segments, the function table, exports and
//! the optional start function.
//!
//! The builder keeps WASM's section-ordering rules out of codegen's way:
//! sections are assembled in the required order at [`WirModule::encode`]
//! time, and function index space (imports first, then definitions) is
//! resolved there from internal names, so the core can create call nodes
//! before their targets are finalised.

use crate::compiler::diagnostics::CompileError;
use crate::compiler::tokens::TextLocation;
use crate::compiler::wir::nodes::{
    BinaryOp, ExprNode, ExprRef, Literal, NativeType, UnaryOp,
};
use rustc_hash::FxHashMap;
use wasm_encoder::{
    BlockType, CodeSection, ConstExpr, DataSection, ElementSection, Elements, ExportKind,
    ExportSection, FunctionSection, GlobalSection, ImportSection, Instruction, MemArg,
    MemorySection, MemoryType, Module, RefType, StartSection, TableSection, TableType,
    TypeSection, ValType,
};

pub const PAGE_SIZE: u64 = 0x10000;

/// A fully-defined function awaiting encoding.
#[derive(Debug, Clone)]
pub struct WirFunction {
    pub name: String,
    pub params: Vec<NativeType>,
    pub result: NativeType,
    /// Additional locals beyond the parameters.
    pub locals: Vec<NativeType>,
    pub body: ExprRef,
}

#[derive(Debug, Clone)]
pub struct FunctionImport {
    pub internal_name: String,
    pub module: String,
    pub name: String,
    pub type_index: u32,
}

#[derive(Debug, Clone)]
pub struct WirGlobal {
    pub name: String,
    pub ty: NativeType,
    pub mutable: bool,
    pub init: Literal,
}

#[derive(Debug, Clone)]
pub struct GlobalImport {
    pub internal_name: String,
    pub module: String,
    pub name: String,
    pub ty: NativeType,
    pub mutable: bool,
}

/// An append-only chunk of static memory. Offsets are final once assigned.
#[derive(Debug, Clone)]
pub struct MemorySegment {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// What an export points at, by internal name where applicable.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportItem {
    Function(String),
    Global(String),
    Memory,
    Table,
}

#[derive(Debug, Clone)]
pub struct WirExport {
    pub name: String,
    pub item: ExportItem,
}

/// The WASM IR module under construction.
#[derive(Debug, Default)]
pub struct WirModule {
    nodes: Vec<ExprNode>,

    // Function-type pool, deduplicated by signature string.
    type_signatures: Vec<(Vec<ValType>, Option<ValType>)>,
    type_cache: FxHashMap<String, u32>,

    pub imports: Vec<FunctionImport>,
    pub functions: Vec<WirFunction>,
    function_names: FxHashMap<String, u32>,

    pub globals: Vec<WirGlobal>,
    pub global_imports: Vec<GlobalImport>,
    global_names: FxHashMap<String, u32>,

    pub segments: Vec<MemorySegment>,
    pub initial_pages: u64,
    pub max_pages: Option<u64>,
    pub memory64: bool,
    pub import_memory: bool,
    pub import_table: bool,

    /// Function table entries, by internal name, in slot order.
    pub table: Vec<String>,

    pub exports: Vec<WirExport>,
    pub start: Option<String>,

    /// Debug-info hook: one source location per IR node, recorded only
    /// when the compiler runs with source maps enabled. Nothing in this
    /// crate consumes it beyond tests.
    debug_locations: FxHashMap<u32, TextLocation>,
}

impl WirModule {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Node creation
    // =========================================================================

    fn push(&mut self, node: ExprNode) -> ExprRef {
        let index = self.nodes.len() as u32;
        self.nodes.push(node);
        ExprRef(index)
    }

    pub fn node(&self, expr: ExprRef) -> &ExprNode {
        &self.nodes[expr.index()]
    }

    pub fn i32(&mut self, value: i32) -> ExprRef {
        self.push(ExprNode::Const(Literal::I32(value)))
    }

    pub fn i64(&mut self, value: i64) -> ExprRef {
        self.push(ExprNode::Const(Literal::I64(value)))
    }

    pub fn f32(&mut self, value: f32) -> ExprRef {
        self.push(ExprNode::Const(Literal::F32(value)))
    }

    pub fn f64(&mut self, value: f64) -> ExprRef {
        self.push(ExprNode::Const(Literal::F64(value)))
    }

    pub fn constant(&mut self, literal: Literal) -> ExprRef {
        self.push(ExprNode::Const(literal))
    }

    pub fn unary(&mut self, op: UnaryOp, operand: ExprRef) -> ExprRef {
        self.push(ExprNode::Unary { op, operand })
    }

    pub fn binary(&mut self, op: BinaryOp, left: ExprRef, right: ExprRef) -> ExprRef {
        self.push(ExprNode::Binary { op, left, right })
    }

    pub fn get_local(&mut self, index: u32, ty: NativeType) -> ExprRef {
        self.push(ExprNode::GetLocal { index, ty })
    }

    pub fn set_local(&mut self, index: u32, value: ExprRef) -> ExprRef {
        self.push(ExprNode::SetLocal { index, value })
    }

    pub fn tee_local(&mut self, index: u32, value: ExprRef, ty: NativeType) -> ExprRef {
        self.push(ExprNode::TeeLocal { index, value, ty })
    }

    pub fn get_global(&mut self, name: impl Into<String>, ty: NativeType) -> ExprRef {
        self.push(ExprNode::GetGlobal {
            name: name.into(),
            ty,
        })
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: ExprRef) -> ExprRef {
        self.push(ExprNode::SetGlobal {
            name: name.into(),
            value,
        })
    }

    pub fn load(
        &mut self,
        bytes: u8,
        signed: bool,
        ptr: ExprRef,
        ty: NativeType,
        offset: u32,
    ) -> ExprRef {
        self.push(ExprNode::Load {
            bytes,
            signed,
            offset,
            ptr,
            ty,
        })
    }

    pub fn store(
        &mut self,
        bytes: u8,
        ptr: ExprRef,
        value: ExprRef,
        value_ty: NativeType,
        offset: u32,
    ) -> ExprRef {
        self.push(ExprNode::Store {
            bytes,
            offset,
            ptr,
            value,
            value_ty,
        })
    }

    pub fn call(
        &mut self,
        target: impl Into<String>,
        operands: Vec<ExprRef>,
        ty: NativeType,
    ) -> ExprRef {
        self.push(ExprNode::Call {
            target: target.into(),
            operands,
            ty,
        })
    }

    pub fn call_import(
        &mut self,
        target: impl Into<String>,
        operands: Vec<ExprRef>,
        ty: NativeType,
    ) -> ExprRef {
        self.push(ExprNode::CallImport {
            target: target.into(),
            operands,
            ty,
        })
    }

    pub fn call_indirect(
        &mut self,
        params: &[NativeType],
        result: NativeType,
        index: ExprRef,
        operands: Vec<ExprRef>,
    ) -> ExprRef {
        let type_index = self.ensure_type(params, result);
        self.push(ExprNode::CallIndirect {
            type_index,
            index,
            operands,
            ty: result,
        })
    }

    pub fn block(
        &mut self,
        label: Option<String>,
        children: Vec<ExprRef>,
        ty: NativeType,
    ) -> ExprRef {
        self.push(ExprNode::Block {
            label,
            children,
            ty,
        })
    }

    pub fn if_(
        &mut self,
        condition: ExprRef,
        if_true: ExprRef,
        if_false: Option<ExprRef>,
        ty: NativeType,
    ) -> ExprRef {
        self.push(ExprNode::If {
            condition,
            if_true,
            if_false,
            ty,
        })
    }

    pub fn loop_(&mut self, label: Option<String>, body: ExprRef) -> ExprRef {
        self.push(ExprNode::Loop { label, body })
    }

    pub fn break_(
        &mut self,
        label: impl Into<String>,
        condition: Option<ExprRef>,
        value: Option<ExprRef>,
    ) -> ExprRef {
        self.push(ExprNode::Break {
            label: label.into(),
            condition,
            value,
        })
    }

    pub fn switch(
        &mut self,
        labels: Vec<String>,
        default_label: impl Into<String>,
        condition: ExprRef,
    ) -> ExprRef {
        self.push(ExprNode::Switch {
            labels,
            default_label: default_label.into(),
            condition,
        })
    }

    pub fn ret(&mut self, value: Option<ExprRef>) -> ExprRef {
        self.push(ExprNode::Return { value })
    }

    pub fn drop_(&mut self, value: ExprRef) -> ExprRef {
        self.push(ExprNode::Drop { value })
    }

    pub fn select(
        &mut self,
        if_true: ExprRef,
        if_false: ExprRef,
        condition: ExprRef,
        ty: NativeType,
    ) -> ExprRef {
        self.push(ExprNode::Select {
            if_true,
            if_false,
            condition,
            ty,
        })
    }

    pub fn nop(&mut self) -> ExprRef {
        self.push(ExprNode::Nop)
    }

    pub fn unreachable(&mut self) -> ExprRef {
        self.push(ExprNode::Unreachable)
    }

    /// Record the source range an IR node was produced from. Only called
    /// when the compiler runs with source maps enabled.
    pub fn set_debug_location(&mut self, expr: ExprRef, location: &TextLocation) {
        self.debug_locations.insert(expr.0, location.clone());
    }

    pub fn debug_location(&self, expr: ExprRef) -> Option<&TextLocation> {
        self.debug_locations.get(&expr.0)
    }

    // =========================================================================
    // Type queries and precompute
    // =========================================================================

    /// The native type of the value an expression leaves on the stack.
    pub fn expr_type(&self, expr: ExprRef) -> NativeType {
        match self.node(expr) {
            ExprNode::Const(lit) => lit.native_type(),
            ExprNode::Unary { op, .. } => op.result_type(),
            ExprNode::Binary { op, .. } => op.result_type(),
            ExprNode::GetLocal { ty, .. }
            | ExprNode::TeeLocal { ty, .. }
            | ExprNode::GetGlobal { ty, .. }
            | ExprNode::Load { ty, .. }
            | ExprNode::Call { ty, .. }
            | ExprNode::CallImport { ty, .. }
            | ExprNode::CallIndirect { ty, .. }
            | ExprNode::Block { ty, .. }
            | ExprNode::If { ty, .. }
            | ExprNode::Select { ty, .. } => *ty,
            _ => NativeType::None,
        }
    }

    /// Constant-fold an expression, returning its value if it reduces to a
    /// literal. Used for const globals and enums, dead-branch elision and
    /// inlined constants; deliberately conservative (no global or local
    /// reads, no traps folded away).
    pub fn precompute(&self, expr: ExprRef) -> Option<Literal> {
        match self.node(expr) {
            ExprNode::Const(lit) => Some(*lit),
            ExprNode::Unary { op, operand } => {
                let value = self.precompute(*operand)?;
                eval_unary(*op, value)
            }
            ExprNode::Binary { op, left, right } => {
                let left = self.precompute(*left)?;
                let right = self.precompute(*right)?;
                eval_binary(*op, left, right)
            }
            ExprNode::Block { children, ty, .. } if children.len() == 1 => {
                if *ty == NativeType::None {
                    return None;
                }
                self.precompute(children[0])
            }
            _ => None,
        }
    }

    // =========================================================================
    // Module-level items
    // =========================================================================

    /// Add a function type and return its index, deduplicating by
    /// signature.
    pub fn ensure_type(&mut self, params: &[NativeType], result: NativeType) -> u32 {
        let mut key = String::with_capacity(params.len() + 1);
        key.push(result.signature_char());
        for param in params {
            key.push(param.signature_char());
        }
        if let Some(&index) = self.type_cache.get(&key) {
            return index;
        }
        let index = self.type_signatures.len() as u32;
        self.type_signatures.push((
            params.iter().filter_map(|p| p.val_type()).collect(),
            result.val_type(),
        ));
        self.type_cache.insert(key, index);
        index
    }

    /// Add an imported function. All imports must be added before
    /// `encode` is called; they occupy the low end of the index space.
    pub fn add_function_import(
        &mut self,
        internal_name: impl Into<String>,
        module: impl Into<String>,
        name: impl Into<String>,
        params: &[NativeType],
        result: NativeType,
    ) {
        let type_index = self.ensure_type(params, result);
        self.imports.push(FunctionImport {
            internal_name: internal_name.into(),
            module: module.into(),
            name: name.into(),
            type_index,
        });
    }

    pub fn add_function(
        &mut self,
        name: impl Into<String>,
        params: Vec<NativeType>,
        result: NativeType,
        locals: Vec<NativeType>,
        body: ExprRef,
    ) {
        let name = name.into();
        self.function_names
            .insert(name.clone(), self.functions.len() as u32);
        self.functions.push(WirFunction {
            name,
            params,
            result,
            locals,
            body,
        });
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.function_names.contains_key(name)
            || self.imports.iter().any(|i| i.internal_name == name)
    }

    pub fn get_function(&self, name: &str) -> Option<&WirFunction> {
        self.function_names
            .get(name)
            .map(|&i| &self.functions[i as usize])
    }

    pub fn add_global(
        &mut self,
        name: impl Into<String>,
        ty: NativeType,
        mutable: bool,
        init: Literal,
    ) {
        let name = name.into();
        self.global_names
            .insert(name.clone(), self.globals.len() as u32);
        self.globals.push(WirGlobal {
            name,
            ty,
            mutable,
            init,
        });
    }

    /// Add an imported global. Like function imports, these occupy the
    /// low end of the global index space and must be added before encode.
    pub fn add_global_import(
        &mut self,
        internal_name: impl Into<String>,
        module: impl Into<String>,
        name: impl Into<String>,
        ty: NativeType,
        mutable: bool,
    ) {
        self.global_imports.push(GlobalImport {
            internal_name: internal_name.into(),
            module: module.into(),
            name: name.into(),
            ty,
            mutable,
        });
    }

    pub fn has_global(&self, name: &str) -> bool {
        self.global_names.contains_key(name)
            || self
                .global_imports
                .iter()
                .any(|import| import.internal_name == name)
    }

    pub fn add_memory_segment(&mut self, offset: u64, data: Vec<u8>) {
        self.segments.push(MemorySegment { offset, data });
    }

    pub fn add_export(&mut self, name: impl Into<String>, item: ExportItem) {
        self.exports.push(WirExport {
            name: name.into(),
            item,
        });
    }

    pub fn has_export(&self, name: &str) -> bool {
        self.exports.iter().any(|e| e.name == name)
    }

    pub fn set_start(&mut self, name: impl Into<String>) {
        self.start = Some(name.into());
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    fn function_index(&self, name: &str) -> Result<u32, CompileError> {
        if let Some(position) = self
            .imports
            .iter()
            .position(|import| import.internal_name == name)
        {
            return Ok(position as u32);
        }
        if let Some(&index) = self.function_names.get(name) {
            return Ok(self.imports.len() as u32 + index);
        }
        Err(CompileError::internal(format!(
            "call target '{}' is not a known function",
            name
        )))
    }

    fn global_index(&self, name: &str) -> Result<u32, CompileError> {
        if let Some(position) = self
            .global_imports
            .iter()
            .position(|import| import.internal_name == name)
        {
            return Ok(position as u32);
        }
        if let Some(&index) = self.global_names.get(name) {
            return Ok(self.global_imports.len() as u32 + index);
        }
        Err(CompileError::internal(format!(
            "global '{}' is not defined",
            name
        )))
    }

    fn block_type(ty: NativeType) -> BlockType {
        match ty.val_type() {
            Some(val_type) => BlockType::Result(val_type),
            None => BlockType::Empty,
        }
    }

    /// Serialise the module to WASM bytes with sections in the required
    /// order: Type, Import, Function, Table, Memory, Global, Export,
    /// Start, Element, Code, Data.
    pub fn encode(&self) -> Result<Vec<u8>, CompileError> {
        let mut module = Module::new();

        // 1. Type section
        let mut type_section = TypeSection::new();
        for (params, result) in &self.type_signatures {
            type_section
                .ty()
                .function(params.iter().copied(), result.iter().copied());
        }
        if !self.type_signatures.is_empty() {
            module.section(&type_section);
        }

        // 2. Import section
        let mut import_section = ImportSection::new();
        let mut has_imports = false;
        for import in &self.imports {
            import_section.import(
                &import.module,
                &import.name,
                wasm_encoder::EntityType::Function(import.type_index),
            );
            has_imports = true;
        }
        for import in &self.global_imports {
            import_section.import(
                &import.module,
                &import.name,
                wasm_encoder::EntityType::Global(wasm_encoder::GlobalType {
                    val_type: import.ty.val_type().ok_or_else(|| {
                        CompileError::internal(format!(
                            "imported global '{}' has no value type",
                            import.internal_name
                        ))
                    })?,
                    mutable: import.mutable,
                    shared: false,
                }),
            );
            has_imports = true;
        }
        if self.import_memory {
            import_section.import(
                "env",
                "memory",
                wasm_encoder::EntityType::Memory(self.memory_type()),
            );
            has_imports = true;
        }
        if self.import_table && !self.table.is_empty() {
            import_section.import(
                "env",
                "table",
                wasm_encoder::EntityType::Table(self.table_type()),
            );
            has_imports = true;
        }
        if has_imports {
            module.section(&import_section);
        }

        // 3. Function section
        let mut function_section = FunctionSection::new();
        for function in &self.functions {
            let type_index = {
                let mut key = String::with_capacity(function.params.len() + 1);
                key.push(function.result.signature_char());
                for param in &function.params {
                    key.push(param.signature_char());
                }
                *self.type_cache.get(&key).ok_or_else(|| {
                    CompileError::internal(format!(
                        "function '{}' has no registered type",
                        function.name
                    ))
                })?
            };
            function_section.function(type_index);
        }
        if !self.functions.is_empty() {
            module.section(&function_section);
        }

        // 4. Table section
        if !self.table.is_empty() && !self.import_table {
            let mut table_section = TableSection::new();
            table_section.table(self.table_type());
            module.section(&table_section);
        }

        // 5. Memory section
        if !self.import_memory {
            let mut memory_section = MemorySection::new();
            memory_section.memory(self.memory_type());
            module.section(&memory_section);
        }

        // 6. Global section
        if !self.globals.is_empty() {
            let mut global_section = GlobalSection::new();
            for global in &self.globals {
                let init = match global.init {
                    Literal::I32(v) => ConstExpr::i32_const(v),
                    Literal::I64(v) => ConstExpr::i64_const(v),
                    Literal::F32(v) => ConstExpr::f32_const(v.into()),
                    Literal::F64(v) => ConstExpr::f64_const(v.into()),
                };
                global_section.global(
                    wasm_encoder::GlobalType {
                        val_type: global.ty.val_type().ok_or_else(|| {
                            CompileError::internal(format!(
                                "global '{}' has no value type",
                                global.name
                            ))
                        })?,
                        mutable: global.mutable,
                        shared: false,
                    },
                    &init,
                );
            }
            module.section(&global_section);
        }

        // 7. Export section
        if !self.exports.is_empty() {
            let mut export_section = ExportSection::new();
            for export in &self.exports {
                match &export.item {
                    ExportItem::Function(internal) => {
                        export_section.export(
                            &export.name,
                            ExportKind::Func,
                            self.function_index(internal)?,
                        );
                    }
                    ExportItem::Global(internal) => {
                        export_section.export(
                            &export.name,
                            ExportKind::Global,
                            self.global_index(internal)?,
                        );
                    }
                    ExportItem::Memory => {
                        export_section.export(&export.name, ExportKind::Memory, 0);
                    }
                    ExportItem::Table => {
                        export_section.export(&export.name, ExportKind::Table, 0);
                    }
                }
            }
            module.section(&export_section);
        }

        // 8. Start section
        if let Some(start) = &self.start {
            module.section(&StartSection {
                function_index: self.function_index(start)?,
            });
        }

        // 9. Element section
        if !self.table.is_empty() {
            let mut indices = Vec::with_capacity(self.table.len());
            for name in &self.table {
                indices.push(self.function_index(name)?);
            }
            let mut element_section = ElementSection::new();
            element_section.active(
                None,
                &ConstExpr::i32_const(0),
                Elements::Functions(indices.into()),
            );
            module.section(&element_section);
        }

        // 10. Code section
        if !self.functions.is_empty() {
            let mut code_section = CodeSection::new();
            for function in &self.functions {
                let mut locals: Vec<(u32, ValType)> = Vec::new();
                for local in &function.locals {
                    let val_type = local.val_type().ok_or_else(|| {
                        CompileError::internal(format!(
                            "function '{}' declares a void local",
                            function.name
                        ))
                    })?;
                    match locals.last_mut() {
                        Some((count, ty)) if *ty == val_type => *count += 1,
                        _ => locals.push((1, val_type)),
                    }
                }
                let mut body = wasm_encoder::Function::new(locals);
                let mut frames: Vec<Option<String>> = Vec::new();
                // A label-less block at the top is the implicit function
                // frame: its children emit directly so terminating paths
                // (return, unreachable) satisfy the function's result
                // type without an extra nesting level.
                match self.node(function.body) {
                    ExprNode::Block {
                        label: None,
                        children,
                        ..
                    } => {
                        for child in children {
                            self.emit_expr(*child, &mut body, &mut frames)?;
                        }
                    }
                    _ => {
                        self.emit_expr(function.body, &mut body, &mut frames)?;
                    }
                }
                body.instruction(&Instruction::End);
                code_section.function(&body);
            }
            module.section(&code_section);
        }

        // 11. Data section
        if !self.segments.is_empty() {
            let mut data_section = DataSection::new();
            for segment in &self.segments {
                let offset = if self.memory64 {
                    ConstExpr::i64_const(segment.offset as i64)
                } else {
                    ConstExpr::i32_const(segment.offset as i32)
                };
                data_section.active(0, &offset, segment.data.iter().copied());
            }
            module.section(&data_section);
        }

        Ok(module.finish())
    }

    /// Run `wasmparser` over the encoded bytes. Compiler bugs surface
    /// here rather than in downstream engines.
    pub fn validate(&self) -> Result<Vec<u8>, CompileError> {
        let bytes = self.encode()?;
        wasmparser::validate(&bytes).map_err(|e| {
            CompileError::internal(format!("generated WASM failed validation: {}", e))
        })?;
        Ok(bytes)
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType {
            minimum: self.initial_pages.max(1),
            maximum: self.max_pages,
            memory64: self.memory64,
            shared: false,
            page_size_log2: None,
        }
    }

    fn table_type(&self) -> TableType {
        TableType {
            element_type: RefType::FUNCREF,
            minimum: self.table.len() as u64,
            maximum: Some(self.table.len() as u64),
            table64: false,
            shared: false,
        }
    }

    fn branch_depth(
        &self,
        frames: &[Option<String>],
        label: &str,
    ) -> Result<u32, CompileError> {
        frames
            .iter()
            .rev()
            .position(|frame| frame.as_deref() == Some(label))
            .map(|depth| depth as u32)
            .ok_or_else(|| {
                CompileError::internal(format!("branch target '{}' is not in scope", label))
            })
    }

    fn emit_expr(
        &self,
        expr: ExprRef,
        body: &mut wasm_encoder::Function,
        frames: &mut Vec<Option<String>>,
    ) -> Result<(), CompileError> {
        match self.node(expr) {
            ExprNode::Const(literal) => {
                body.instruction(&match *literal {
                    Literal::I32(v) => Instruction::I32Const(v),
                    Literal::I64(v) => Instruction::I64Const(v),
                    Literal::F32(v) => Instruction::F32Const(v.into()),
                    Literal::F64(v) => Instruction::F64Const(v.into()),
                });
            }
            ExprNode::Unary { op, operand } => {
                self.emit_expr(*operand, body, frames)?;
                body.instruction(&unary_instruction(*op));
            }
            ExprNode::Binary { op, left, right } => {
                self.emit_expr(*left, body, frames)?;
                self.emit_expr(*right, body, frames)?;
                body.instruction(&binary_instruction(*op));
            }
            ExprNode::GetLocal { index, .. } => {
                body.instruction(&Instruction::LocalGet(*index));
            }
            ExprNode::SetLocal { index, value } => {
                self.emit_expr(*value, body, frames)?;
                body.instruction(&Instruction::LocalSet(*index));
            }
            ExprNode::TeeLocal { index, value, .. } => {
                self.emit_expr(*value, body, frames)?;
                body.instruction(&Instruction::LocalTee(*index));
            }
            ExprNode::GetGlobal { name, .. } => {
                body.instruction(&Instruction::GlobalGet(self.global_index(name)?));
            }
            ExprNode::SetGlobal { name, value } => {
                self.emit_expr(*value, body, frames)?;
                body.instruction(&Instruction::GlobalSet(self.global_index(name)?));
            }
            ExprNode::Load {
                bytes,
                signed,
                offset,
                ptr,
                ty,
            } => {
                self.emit_expr(*ptr, body, frames)?;
                let mem_arg = MemArg {
                    offset: *offset as u64,
                    align: bytes.trailing_zeros(),
                    memory_index: 0,
                };
                body.instruction(&load_instruction(*bytes, *signed, *ty, mem_arg)?);
            }
            ExprNode::Store {
                bytes,
                offset,
                ptr,
                value,
                value_ty,
            } => {
                self.emit_expr(*ptr, body, frames)?;
                self.emit_expr(*value, body, frames)?;
                let mem_arg = MemArg {
                    offset: *offset as u64,
                    align: bytes.trailing_zeros(),
                    memory_index: 0,
                };
                body.instruction(&store_instruction(*bytes, *value_ty, mem_arg)?);
            }
            ExprNode::Call { target, operands, .. }
            | ExprNode::CallImport { target, operands, .. } => {
                for operand in operands {
                    self.emit_expr(*operand, body, frames)?;
                }
                body.instruction(&Instruction::Call(self.function_index(target)?));
            }
            ExprNode::CallIndirect {
                type_index,
                index,
                operands,
                ..
            } => {
                for operand in operands {
                    self.emit_expr(*operand, body, frames)?;
                }
                self.emit_expr(*index, body, frames)?;
                body.instruction(&Instruction::CallIndirect {
                    type_index: *type_index,
                    table_index: 0,
                });
            }
            ExprNode::Block {
                label,
                children,
                ty,
            } => {
                body.instruction(&Instruction::Block(Self::block_type(*ty)));
                frames.push(label.clone());
                for child in children {
                    self.emit_expr(*child, body, frames)?;
                }
                frames.pop();
                body.instruction(&Instruction::End);
            }
            ExprNode::If {
                condition,
                if_true,
                if_false,
                ty,
            } => {
                self.emit_expr(*condition, body, frames)?;
                body.instruction(&Instruction::If(Self::block_type(*ty)));
                frames.push(None);
                self.emit_expr(*if_true, body, frames)?;
                if let Some(if_false) = if_false {
                    body.instruction(&Instruction::Else);
                    self.emit_expr(*if_false, body, frames)?;
                }
                frames.pop();
                body.instruction(&Instruction::End);
            }
            ExprNode::Loop { label, body: inner } => {
                body.instruction(&Instruction::Loop(BlockType::Empty));
                frames.push(label.clone());
                self.emit_expr(*inner, body, frames)?;
                frames.pop();
                body.instruction(&Instruction::End);
            }
            ExprNode::Break {
                label,
                condition,
                value,
            } => {
                if let Some(value) = value {
                    self.emit_expr(*value, body, frames)?;
                }
                let depth = self.branch_depth(frames, label)?;
                match condition {
                    Some(condition) => {
                        self.emit_expr(*condition, body, frames)?;
                        body.instruction(&Instruction::BrIf(depth));
                    }
                    None => {
                        body.instruction(&Instruction::Br(depth));
                    }
                }
            }
            ExprNode::Switch {
                labels,
                default_label,
                condition,
            } => {
                self.emit_expr(*condition, body, frames)?;
                let mut depths = Vec::with_capacity(labels.len());
                for label in labels {
                    depths.push(self.branch_depth(frames, label)?);
                }
                let default_depth = self.branch_depth(frames, default_label)?;
                body.instruction(&Instruction::BrTable(depths.into(), default_depth));
            }
            ExprNode::Return { value } => {
                if let Some(value) = value {
                    self.emit_expr(*value, body, frames)?;
                }
                body.instruction(&Instruction::Return);
            }
            ExprNode::Drop { value } => {
                self.emit_expr(*value, body, frames)?;
                body.instruction(&Instruction::Drop);
            }
            ExprNode::Select {
                if_true,
                if_false,
                condition,
                ..
            } => {
                self.emit_expr(*if_true, body, frames)?;
                self.emit_expr(*if_false, body, frames)?;
                self.emit_expr(*condition, body, frames)?;
                body.instruction(&Instruction::Select);
            }
            ExprNode::Nop => {
                body.instruction(&Instruction::Nop);
            }
            ExprNode::Unreachable => {
                body.instruction(&Instruction::Unreachable);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Instruction selection
// ============================================================================

fn unary_instruction(op: UnaryOp) -> Instruction<'static> {
    use UnaryOp::*;
    match op {
        EqzI32 => Instruction::I32Eqz,
        EqzI64 => Instruction::I64Eqz,
        WrapI64 => Instruction::I32WrapI64,
        ExtendSI32 => Instruction::I64ExtendI32S,
        ExtendUI32 => Instruction::I64ExtendI32U,
        ExtendI8ToI32 => Instruction::I32Extend8S,
        ExtendI16ToI32 => Instruction::I32Extend16S,
        TruncSF32ToI32 => Instruction::I32TruncF32S,
        TruncUF32ToI32 => Instruction::I32TruncF32U,
        TruncSF64ToI32 => Instruction::I32TruncF64S,
        TruncUF64ToI32 => Instruction::I32TruncF64U,
        TruncSF32ToI64 => Instruction::I64TruncF32S,
        TruncUF32ToI64 => Instruction::I64TruncF32U,
        TruncSF64ToI64 => Instruction::I64TruncF64S,
        TruncUF64ToI64 => Instruction::I64TruncF64U,
        ConvertSI32ToF32 => Instruction::F32ConvertI32S,
        ConvertUI32ToF32 => Instruction::F32ConvertI32U,
        ConvertSI64ToF32 => Instruction::F32ConvertI64S,
        ConvertUI64ToF32 => Instruction::F32ConvertI64U,
        ConvertSI32ToF64 => Instruction::F64ConvertI32S,
        ConvertUI32ToF64 => Instruction::F64ConvertI32U,
        ConvertSI64ToF64 => Instruction::F64ConvertI64S,
        ConvertUI64ToF64 => Instruction::F64ConvertI64U,
        PromoteF32 => Instruction::F64PromoteF32,
        DemoteF64 => Instruction::F32DemoteF64,
        NegF32 => Instruction::F32Neg,
        NegF64 => Instruction::F64Neg,
    }
}

fn binary_instruction(op: BinaryOp) -> Instruction<'static> {
    use BinaryOp::*;
    match op {
        AddI32 => Instruction::I32Add,
        SubI32 => Instruction::I32Sub,
        MulI32 => Instruction::I32Mul,
        DivSI32 => Instruction::I32DivS,
        DivUI32 => Instruction::I32DivU,
        RemSI32 => Instruction::I32RemS,
        RemUI32 => Instruction::I32RemU,
        AndI32 => Instruction::I32And,
        OrI32 => Instruction::I32Or,
        XorI32 => Instruction::I32Xor,
        ShlI32 => Instruction::I32Shl,
        ShrSI32 => Instruction::I32ShrS,
        ShrUI32 => Instruction::I32ShrU,
        EqI32 => Instruction::I32Eq,
        NeI32 => Instruction::I32Ne,
        LtSI32 => Instruction::I32LtS,
        LtUI32 => Instruction::I32LtU,
        LeSI32 => Instruction::I32LeS,
        LeUI32 => Instruction::I32LeU,
        GtSI32 => Instruction::I32GtS,
        GtUI32 => Instruction::I32GtU,
        GeSI32 => Instruction::I32GeS,
        GeUI32 => Instruction::I32GeU,
        AddI64 => Instruction::I64Add,
        SubI64 => Instruction::I64Sub,
        MulI64 => Instruction::I64Mul,
        DivSI64 => Instruction::I64DivS,
        DivUI64 => Instruction::I64DivU,
        RemSI64 => Instruction::I64RemS,
        RemUI64 => Instruction::I64RemU,
        AndI64 => Instruction::I64And,
        OrI64 => Instruction::I64Or,
        XorI64 => Instruction::I64Xor,
        ShlI64 => Instruction::I64Shl,
        ShrSI64 => Instruction::I64ShrS,
        ShrUI64 => Instruction::I64ShrU,
        EqI64 => Instruction::I64Eq,
        NeI64 => Instruction::I64Ne,
        LtSI64 => Instruction::I64LtS,
        LtUI64 => Instruction::I64LtU,
        LeSI64 => Instruction::I64LeS,
        LeUI64 => Instruction::I64LeU,
        GtSI64 => Instruction::I64GtS,
        GtUI64 => Instruction::I64GtU,
        GeSI64 => Instruction::I64GeS,
        GeUI64 => Instruction::I64GeU,
        AddF32 => Instruction::F32Add,
        SubF32 => Instruction::F32Sub,
        MulF32 => Instruction::F32Mul,
        DivF32 => Instruction::F32Div,
        EqF32 => Instruction::F32Eq,
        NeF32 => Instruction::F32Ne,
        LtF32 => Instruction::F32Lt,
        LeF32 => Instruction::F32Le,
        GtF32 => Instruction::F32Gt,
        GeF32 => Instruction::F32Ge,
        AddF64 => Instruction::F64Add,
        SubF64 => Instruction::F64Sub,
        MulF64 => Instruction::F64Mul,
        DivF64 => Instruction::F64Div,
        EqF64 => Instruction::F64Eq,
        NeF64 => Instruction::F64Ne,
        LtF64 => Instruction::F64Lt,
        LeF64 => Instruction::F64Le,
        GtF64 => Instruction::F64Gt,
        GeF64 => Instruction::F64Ge,
    }
}

fn load_instruction(
    bytes: u8,
    signed: bool,
    ty: NativeType,
    mem_arg: MemArg,
) -> Result<Instruction<'static>, CompileError> {
    let instruction = match (ty, bytes, signed) {
        (NativeType::I32, 1, true) => Instruction::I32Load8S(mem_arg),
        (NativeType::I32, 1, false) => Instruction::I32Load8U(mem_arg),
        (NativeType::I32, 2, true) => Instruction::I32Load16S(mem_arg),
        (NativeType::I32, 2, false) => Instruction::I32Load16U(mem_arg),
        (NativeType::I32, 4, _) => Instruction::I32Load(mem_arg),
        (NativeType::I64, 1, true) => Instruction::I64Load8S(mem_arg),
        (NativeType::I64, 1, false) => Instruction::I64Load8U(mem_arg),
        (NativeType::I64, 2, true) => Instruction::I64Load16S(mem_arg),
        (NativeType::I64, 2, false) => Instruction::I64Load16U(mem_arg),
        (NativeType::I64, 4, true) => Instruction::I64Load32S(mem_arg),
        (NativeType::I64, 4, false) => Instruction::I64Load32U(mem_arg),
        (NativeType::I64, 8, _) => Instruction::I64Load(mem_arg),
        (NativeType::F32, 4, _) => Instruction::F32Load(mem_arg),
        (NativeType::F64, 8, _) => Instruction::F64Load(mem_arg),
        _ => {
            return Err(CompileError::internal(format!(
                "invalid load: {} bytes into {:?}",
                bytes, ty
            )));
        }
    };
    Ok(instruction)
}

fn store_instruction(
    bytes: u8,
    value_ty: NativeType,
    mem_arg: MemArg,
) -> Result<Instruction<'static>, CompileError> {
    let instruction = match (value_ty, bytes) {
        (NativeType::I32, 1) => Instruction::I32Store8(mem_arg),
        (NativeType::I32, 2) => Instruction::I32Store16(mem_arg),
        (NativeType::I32, 4) => Instruction::I32Store(mem_arg),
        (NativeType::I64, 1) => Instruction::I64Store8(mem_arg),
        (NativeType::I64, 2) => Instruction::I64Store16(mem_arg),
        (NativeType::I64, 4) => Instruction::I64Store32(mem_arg),
        (NativeType::I64, 8) => Instruction::I64Store(mem_arg),
        (NativeType::F32, 4) => Instruction::F32Store(mem_arg),
        (NativeType::F64, 8) => Instruction::F64Store(mem_arg),
        _ => {
            return Err(CompileError::internal(format!(
                "invalid store: {} bytes from {:?}",
                bytes, value_ty
            )));
        }
    };
    Ok(instruction)
}

// ============================================================================
// Constant folding
// ============================================================================

fn eval_unary(op: UnaryOp, value: Literal) -> Option<Literal> {
    use Literal::*;
    use UnaryOp::*;
    let result = match (op, value) {
        (EqzI32, I32(v)) => I32((v == 0) as i32),
        (EqzI64, I64(v)) => I32((v == 0) as i32),
        (WrapI64, I64(v)) => I32(v as i32),
        (ExtendSI32, I32(v)) => I64(v as i64),
        (ExtendUI32, I32(v)) => I64(v as u32 as i64),
        (ExtendI8ToI32, I32(v)) => I32(v as i8 as i32),
        (ExtendI16ToI32, I32(v)) => I32(v as i16 as i32),
        (PromoteF32, F32(v)) => F64(v as f64),
        (DemoteF64, F64(v)) => F32(v as f32),
        (NegF32, F32(v)) => F32(-v),
        (NegF64, F64(v)) => F64(-v),
        (ConvertSI32ToF64, I32(v)) => F64(v as f64),
        (ConvertUI32ToF64, I32(v)) => F64(v as u32 as f64),
        (ConvertSI64ToF64, I64(v)) => F64(v as f64),
        (ConvertUI64ToF64, I64(v)) => F64(v as u64 as f64),
        (ConvertSI32ToF32, I32(v)) => F32(v as f32),
        (ConvertUI32ToF32, I32(v)) => F32(v as u32 as f32),
        (ConvertSI64ToF32, I64(v)) => F32(v as f32),
        (ConvertUI64ToF32, I64(v)) => F32(v as u64 as f32),
        // Truncations can trap; leave them to runtime.
        _ => return None,
    };
    Some(result)
}

fn eval_binary(op: BinaryOp, left: Literal, right: Literal) -> Option<Literal> {
    use BinaryOp::*;
    use Literal::*;
    let result = match (op, left, right) {
        (AddI32, I32(a), I32(b)) => I32(a.wrapping_add(b)),
        (SubI32, I32(a), I32(b)) => I32(a.wrapping_sub(b)),
        (MulI32, I32(a), I32(b)) => I32(a.wrapping_mul(b)),
        (AndI32, I32(a), I32(b)) => I32(a & b),
        (OrI32, I32(a), I32(b)) => I32(a | b),
        (XorI32, I32(a), I32(b)) => I32(a ^ b),
        (ShlI32, I32(a), I32(b)) => I32(a.wrapping_shl(b as u32 & 31)),
        (ShrSI32, I32(a), I32(b)) => I32(a.wrapping_shr(b as u32 & 31)),
        (ShrUI32, I32(a), I32(b)) => I32(((a as u32).wrapping_shr(b as u32 & 31)) as i32),
        (DivSI32, I32(a), I32(b)) if b != 0 && !(a == i32::MIN && b == -1) => I32(a / b),
        (DivUI32, I32(a), I32(b)) if b != 0 => I32((a as u32 / b as u32) as i32),
        (RemSI32, I32(a), I32(b)) if b != 0 && !(a == i32::MIN && b == -1) => I32(a % b),
        (RemUI32, I32(a), I32(b)) if b != 0 => I32((a as u32 % b as u32) as i32),
        (EqI32, I32(a), I32(b)) => I32((a == b) as i32),
        (NeI32, I32(a), I32(b)) => I32((a != b) as i32),
        (LtSI32, I32(a), I32(b)) => I32((a < b) as i32),
        (LtUI32, I32(a), I32(b)) => I32(((a as u32) < b as u32) as i32),
        (LeSI32, I32(a), I32(b)) => I32((a <= b) as i32),
        (LeUI32, I32(a), I32(b)) => I32((a as u32 <= b as u32) as i32),
        (GtSI32, I32(a), I32(b)) => I32((a > b) as i32),
        (GtUI32, I32(a), I32(b)) => I32((a as u32 > b as u32) as i32),
        (GeSI32, I32(a), I32(b)) => I32((a >= b) as i32),
        (GeUI32, I32(a), I32(b)) => I32((a as u32 >= b as u32) as i32),
        (AddI64, I64(a), I64(b)) => I64(a.wrapping_add(b)),
        (SubI64, I64(a), I64(b)) => I64(a.wrapping_sub(b)),
        (MulI64, I64(a), I64(b)) => I64(a.wrapping_mul(b)),
        (AndI64, I64(a), I64(b)) => I64(a & b),
        (OrI64, I64(a), I64(b)) => I64(a | b),
        (XorI64, I64(a), I64(b)) => I64(a ^ b),
        (ShlI64, I64(a), I64(b)) => I64(a.wrapping_shl(b as u32 & 63)),
        (ShrSI64, I64(a), I64(b)) => I64(a.wrapping_shr(b as u32 & 63)),
        (ShrUI64, I64(a), I64(b)) => I64(((a as u64).wrapping_shr(b as u32 & 63)) as i64),
        (DivSI64, I64(a), I64(b)) if b != 0 && !(a == i64::MIN && b == -1) => I64(a / b),
        (DivUI64, I64(a), I64(b)) if b != 0 => I64((a as u64 / b as u64) as i64),
        (RemSI64, I64(a), I64(b)) if b != 0 && !(a == i64::MIN && b == -1) => I64(a % b),
        (RemUI64, I64(a), I64(b)) if b != 0 => I64((a as u64 % b as u64) as i64),
        (EqI64, I64(a), I64(b)) => I32((a == b) as i32),
        (NeI64, I64(a), I64(b)) => I32((a != b) as i32),
        (LtSI64, I64(a), I64(b)) => I32((a < b) as i32),
        (LtUI64, I64(a), I64(b)) => I32(((a as u64) < b as u64) as i32),
        (GtSI64, I64(a), I64(b)) => I32((a > b) as i32),
        (AddF32, F32(a), F32(b)) => F32(a + b),
        (SubF32, F32(a), F32(b)) => F32(a - b),
        (MulF32, F32(a), F32(b)) => F32(a * b),
        (DivF32, F32(a), F32(b)) => F32(a / b),
        (AddF64, F64(a), F64(b)) => F64(a + b),
        (SubF64, F64(a), F64(b)) => F64(a - b),
        (MulF64, F64(a), F64(b)) => F64(a * b),
        (DivF64, F64(a), F64(b)) => F64(a / b),
        (EqF64, F64(a), F64(b)) => I32((a == b) as i32),
        (NeF64, F64(a), F64(b)) => I32((a != b) as i32),
        (LtF64, F64(a), F64(b)) => I32((a < b) as i32),
        (GtF64, F64(a), F64(b)) => I32((a > b) as i32),
        _ => return None,
    };
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_pool_deduplicates_by_signature() {
        let mut module = WirModule::new();
        let a = module.ensure_type(&[NativeType::I32, NativeType::I32], NativeType::I32);
        let b = module.ensure_type(&[NativeType::I32, NativeType::I32], NativeType::I32);
        let c = module.ensure_type(&[NativeType::I32], NativeType::I32);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn precompute_folds_constant_arithmetic() {
        let mut module = WirModule::new();
        let two = module.i32(2);
        let three = module.i32(3);
        let sum = module.binary(BinaryOp::AddI32, two, three);
        assert_eq!(module.precompute(sum), Some(Literal::I32(5)));
    }

    #[test]
    fn precompute_refuses_division_by_zero() {
        let mut module = WirModule::new();
        let one = module.i32(1);
        let zero = module.i32(0);
        let div = module.binary(BinaryOp::DivSI32, one, zero);
        assert_eq!(module.precompute(div), None);
    }

    #[test]
    fn precompute_does_not_reach_through_locals() {
        let mut module = WirModule::new();
        let local = module.get_local(0, NativeType::I32);
        let one = module.i32(1);
        let add = module.binary(BinaryOp::AddI32, local, one);
        assert_eq!(module.precompute(add), None);
    }

    #[test]
    fn encoded_module_with_one_function_validates() {
        let mut module = WirModule::new();
        module.ensure_type(&[NativeType::I32], NativeType::I32);
        let p = module.get_local(0, NativeType::I32);
        let one = module.i32(1);
        let body = module.binary(BinaryOp::AddI32, p, one);
        module.add_function(
            "inc",
            vec![NativeType::I32],
            NativeType::I32,
            Vec::new(),
            body,
        );
        module.add_export("inc", ExportItem::Function("inc".to_string()));
        module.initial_pages = 1;
        module.validate().expect("module should validate");
    }

    #[test]
    fn nested_breaks_resolve_to_relative_depths() {
        let mut module = WirModule::new();
        module.ensure_type(&[NativeType::I32], NativeType::None);
        // block $outer { loop $l { br_if $outer (local.get 0); br $l } }
        let cond = module.get_local(0, NativeType::I32);
        let br_out = module.break_("outer", Some(cond), None);
        let br_loop = module.break_("l", None, None);
        let loop_body = module.block(None, vec![br_out, br_loop], NativeType::None);
        let looped = module.loop_(Some("l".to_string()), loop_body);
        let outer = module.block(Some("outer".to_string()), vec![looped], NativeType::None);
        module.add_function(
            "spin",
            vec![NativeType::I32],
            NativeType::None,
            Vec::new(),
            outer,
        );
        module.initial_pages = 1;
        module.validate().expect("loop branches should validate");
    }

    #[test]
    fn segments_encode_at_their_offsets() {
        let mut module = WirModule::new();
        module.add_memory_segment(8, vec![1, 2, 3, 4]);
        module.add_memory_segment(16, vec![5, 6]);
        module.initial_pages = 1;
        let bytes = module.validate().expect("data segments should validate");
        assert!(!bytes.is_empty());
    }
}
