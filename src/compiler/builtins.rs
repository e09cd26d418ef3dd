//! Built-in call compilation.
//!
//! Functions decorated `@builtin` never compile to their own bodies;
//! their call sites lower here instead. A builtin either returns an IR
//! expression with `current_type` set correctly, or `None`, which the
//! caller turns into an operation-not-supported diagnostic.
//!
//! The allocation and abort paths double as the compiler's own hooks:
//! `new` lowers through [`make_allocate_call`] and `throw` through
//! [`make_abort`].

use crate::compiler::ast;
use crate::compiler::codegen::{Compiler, ConversionKind};
use crate::compiler::diagnostics::{CompileError, DiagnosticCode};
use crate::compiler::flow::FlowFlags;
use crate::compiler::program::{ElementId, ElementKind};
use crate::compiler::tokens::TextLocation;
use crate::compiler::types::Type;
use crate::compiler::wir::module::ExportItem;
use crate::compiler::wir::nodes::{ExprRef, NativeType};

/// Compile a call to a `@builtin` function prototype. Type arguments are
/// resolved by the caller; their interpretation is up to the builtin.
pub fn compile_builtin_call(
    compiler: &mut Compiler,
    prototype: ElementId,
    type_arguments: &[Type],
    arguments: &[ast::Expression],
    contextual_type: &Type,
    location: &TextLocation,
) -> Result<Option<ExprRef>, CompileError> {
    let name = compiler.program.element(prototype).name.clone();
    let expr = match name.as_str() {
        "abort" => {
            compiler.current_flow.flags.set(FlowFlags::THROWS);
            Some(make_abort(compiler, arguments.first(), location)?)
        }
        "assert" => Some(compile_assert(compiler, arguments, location)?),
        "unchecked" => {
            let Some(argument) = arguments.first() else {
                return Ok(None);
            };
            let already_unchecked = compiler
                .current_flow
                .flags
                .has(FlowFlags::UNCHECKED_CONTEXT);
            compiler
                .current_flow
                .flags
                .set(FlowFlags::UNCHECKED_CONTEXT);
            let expr = compiler.compile_expression(
                argument,
                contextual_type,
                ConversionKind::None,
                false,
            )?;
            if !already_unchecked {
                compiler
                    .current_flow
                    .flags
                    .clear(FlowFlags::UNCHECKED_CONTEXT);
            }
            Some(expr)
        }
        "sizeof" => {
            let Some(ty) = type_arguments.first() else {
                return Ok(None);
            };
            let size = ty.size as u64;
            compiler.current_type = compiler.usize_type();
            let literal = compiler.pointer_literal(size);
            Some(compiler.module.constant(literal))
        }
        "changetype" => {
            let (Some(target), Some(argument)) = (type_arguments.first(), arguments.first())
            else {
                return Ok(None);
            };
            let void = compiler.void_type();
            let expr =
                compiler.compile_expression(argument, &void, ConversionKind::None, false)?;
            if compiler.current_type.native_type() != target.native_type() {
                compiler.error(
                    DiagnosticCode::NotAssignable,
                    format!(
                        "changetype requires matching native types, got '{}' and '{}'",
                        compiler.current_type, target
                    ),
                    location,
                );
            }
            compiler.current_type = target.clone();
            Some(expr)
        }
        "load" => {
            let (Some(ty), Some(pointer_argument)) = (type_arguments.first(), arguments.first())
            else {
                return Ok(None);
            };
            let usize_type = compiler.usize_type();
            let pointer = compiler.compile_expression(
                pointer_argument,
                &usize_type,
                ConversionKind::Implicit,
                false,
            )?;
            let offset = constant_offset(compiler, arguments.get(1))?;
            compiler.current_type = ty.clone();
            Some(compiler.module.load(
                ty.size as u8,
                ty.is_signed() && ty.is_integer(),
                pointer,
                ty.native_type(),
                offset,
            ))
        }
        "store" => {
            let (Some(ty), Some(pointer_argument), Some(value_argument)) = (
                type_arguments.first(),
                arguments.first(),
                arguments.get(1),
            ) else {
                return Ok(None);
            };
            let usize_type = compiler.usize_type();
            let pointer = compiler.compile_expression(
                pointer_argument,
                &usize_type,
                ConversionKind::Implicit,
                false,
            )?;
            let value =
                compiler.compile_expression(value_argument, ty, ConversionKind::Implicit, false)?;
            let offset = constant_offset(compiler, arguments.get(2))?;
            compiler.current_type = compiler.void_type();
            Some(compiler.module.store(
                ty.size as u8,
                pointer,
                value,
                ty.native_type(),
                offset,
            ))
        }
        "select" => {
            let (Some(ty), Some(if_true), Some(if_false), Some(condition)) = (
                type_arguments.first(),
                arguments.first(),
                arguments.get(1),
                arguments.get(2),
            ) else {
                return Ok(None);
            };
            let if_true =
                compiler.compile_expression(if_true, ty, ConversionKind::Implicit, false)?;
            let if_false =
                compiler.compile_expression(if_false, ty, ConversionKind::Implicit, false)?;
            let bool_type = compiler.bool_type();
            let condition = compiler.compile_expression(
                condition,
                &bool_type,
                ConversionKind::None,
                false,
            )?;
            let condition_type = compiler.current_type.clone();
            let condition = compiler.make_is_trueish(condition, &condition_type);
            compiler.current_type = ty.clone();
            Some(
                compiler
                    .module
                    .select(if_true, if_false, condition, ty.native_type()),
            )
        }
        "unreachable" => {
            compiler.current_type = contextual_type.clone();
            Some(compiler.module.unreachable())
        }
        _ => None,
    };
    Ok(expr)
}

fn constant_offset(
    compiler: &mut Compiler,
    argument: Option<&ast::Expression>,
) -> Result<u32, CompileError> {
    let Some(argument) = argument else { return Ok(0) };
    let usize_type = compiler.usize_type();
    let expr =
        compiler.compile_expression(argument, &usize_type, ConversionKind::Implicit, false)?;
    match compiler.module.precompute(expr).and_then(|v| v.as_i64()) {
        Some(value) if value >= 0 => Ok(value as u32),
        _ => {
            compiler.error(
                DiagnosticCode::NotAssignable,
                "The offset argument must be a compile-time constant",
                &argument.location,
            );
            Ok(0)
        }
    }
}

fn compile_assert(
    compiler: &mut Compiler,
    arguments: &[ast::Expression],
    location: &TextLocation,
) -> Result<ExprRef, CompileError> {
    compiler.current_type = compiler.void_type();
    if compiler.options.no_assert {
        return Ok(compiler.module.nop());
    }
    let Some(condition_argument) = arguments.first() else {
        return Ok(compiler.module.nop());
    };
    let bool_type = compiler.bool_type();
    let condition =
        compiler.compile_expression(condition_argument, &bool_type, ConversionKind::None, false)?;
    let condition_type = compiler.current_type.clone();
    let falseish = compiler.make_is_falseish(condition, &condition_type);
    let abort = make_abort(compiler, arguments.get(1), location)?;
    compiler.current_type = compiler.void_type();
    Ok(compiler
        .module
        .if_(falseish, abort, None, NativeType::None))
}

/// Lower an abort: a call to the declared `abort` function (an ambient
/// import in practice) followed by `unreachable`. Without a declared
/// `abort`, the trap alone remains.
pub fn make_abort(
    compiler: &mut Compiler,
    message: Option<&ast::Expression>,
    location: &TextLocation,
) -> Result<ExprRef, CompileError> {
    let abort_prototype = compiler.program.lookup("abort").filter(|&id| {
        matches!(
            compiler.program.element(id).kind,
            ElementKind::FunctionPrototype(_)
        )
    });
    let Some(abort_prototype) = abort_prototype else {
        compiler.current_type = compiler.void_type();
        return Ok(compiler.module.unreachable());
    };
    let Some(instance) = compiler.program.resolve_function(abort_prototype, &[], None) else {
        compiler.current_type = compiler.void_type();
        return Ok(compiler.module.unreachable());
    };
    let signature = compiler.program.function(instance).signature.clone();
    let mut operands = Vec::new();
    if let (Some(message), Some(parameter)) = (message, signature.parameter_types.first()) {
        let parameter_type = parameter.ty.clone();
        operands.push(compiler.compile_expression(
            message,
            &parameter_type,
            ConversionKind::Implicit,
            false,
        )?);
    }
    let call = compiler.make_call_direct(instance, operands, location)?;
    let trap = compiler.module.unreachable();
    compiler.current_type = compiler.void_type();
    Ok(compiler
        .module
        .block(None, vec![call, trap], NativeType::None))
}

/// Acquire `size` bytes through the program's `allocate` function. The
/// allocator is part of the runtime the program links against; without
/// one declared, allocation sites are diagnosed.
pub fn make_allocate_call(
    compiler: &mut Compiler,
    size: u64,
    location: &TextLocation,
) -> Result<ExprRef, CompileError> {
    let allocate_prototype = compiler.program.lookup("allocate").filter(|&id| {
        matches!(
            compiler.program.element(id).kind,
            ElementKind::FunctionPrototype(_)
        )
    });
    let usize_type = compiler.usize_type();
    let Some(allocate_prototype) = allocate_prototype else {
        compiler.error(
            DiagnosticCode::OperationNotSupported,
            "Allocation requires an 'allocate(size: usize): usize' declaration",
            location,
        );
        return Ok(compiler.unreachable_with_type(&usize_type));
    };
    let Some(instance) = compiler
        .program
        .resolve_function(allocate_prototype, &[], None)
    else {
        return Ok(compiler.unreachable_with_type(&usize_type));
    };
    let literal = compiler.pointer_literal(size);
    let size_const = compiler.module.constant(literal);
    let call = compiler.make_call_direct(instance, vec![size_const], location)?;
    compiler.current_type = usize_type;
    Ok(call)
}

/// Register a GC hook for `class`, returning the index written into the
/// GC header word of its heap objects. Indices are dense and stable per
/// compilation.
pub fn ensure_gc_hook(compiler: &mut Compiler, class: ElementId) -> i32 {
    if let Some(&index) = compiler.gc_hook_indices.get(&class) {
        return index;
    }
    let index = compiler.gc_hook_indices.len() as i32;
    compiler.gc_hook_indices.insert(class, index);
    index
}

/// Generate the `~iterateRoots` helper: calls the given callback once
/// for every mutable reference-typed module global, so a collector can
/// trace the static root set.
pub fn compile_iterate_roots(compiler: &mut Compiler) -> Result<(), CompileError> {
    let mut roots: Vec<(String, NativeType)> = Vec::new();
    for element in &compiler.program.elements {
        let ElementKind::Global(global) = &element.kind else {
            continue;
        };
        let Some(ty) = &global.ty else { continue };
        if !ty.is_reference() {
            continue;
        }
        if !element
            .flags
            .has(crate::compiler::program::ElementFlags::COMPILED)
            || element
                .flags
                .has(crate::compiler::program::ElementFlags::INLINED)
        {
            continue;
        }
        roots.push((element.internal_name.clone(), ty.native_type()));
    }

    compiler.ensure_argc_var();
    let pointer = compiler.pointer_native_type();
    let mut statements = Vec::with_capacity(roots.len());
    for (name, native) in roots {
        let argc = compiler.module.i32(1);
        let set_argc = compiler
            .module
            .set_global(crate::compiler::codegen::ARGC_GLOBAL, argc);
        statements.push(set_argc);
        let root = compiler.module.get_global(name, native);
        let callback = compiler.module.get_local(0, NativeType::I32);
        let call = compiler.module.call_indirect(
            &[pointer],
            NativeType::None,
            callback,
            vec![root],
        );
        statements.push(call);
    }
    let body = compiler.module.block(None, statements, NativeType::None);
    compiler.module.add_function(
        "~iterateRoots",
        vec![NativeType::I32],
        NativeType::None,
        Vec::new(),
        body,
    );
    compiler
        .module
        .add_export("~iterateRoots", ExportItem::Function("~iterateRoots".into()));
    Ok(())
}
