//! Numeric conversions, small-integer wrapping and truthiness.
//!
//! These are the type-lattice operations every expression handler leans
//! on: reconciling a value with its contextual type, clearing garbage
//! bits of short integers living in 32-bit slots, and turning values
//! into branch conditions.

use crate::compiler::codegen::{Compiler, ConversionKind, Feature};
use crate::compiler::diagnostics::DiagnosticCode;
use crate::compiler::tokens::TextLocation;
use crate::compiler::types::{Type, TypeKind};
use crate::compiler::wir::nodes::{BinaryOp, ExprRef, NativeType, UnaryOp};

impl<'a> Compiler<'a> {
    /// Whether `expr` may carry garbage bits beyond `ty`'s logical width,
    /// judged against the current flow's wrapped-local knowledge.
    pub fn expr_can_overflow(&self, expr: ExprRef, ty: &Type) -> bool {
        let function = self.program.function(self.current_function);
        self.current_flow
            .can_overflow(&self.module, expr, ty, &function.locals)
    }

    /// Convert `expr` from `from` to `to`.
    ///
    /// Implicit conversions between non-assignable types are reported and
    /// then performed anyway so the produced IR stays well-typed and
    /// compilation can continue. `wrap` requests a trailing small-integer
    /// wrap when the destination is narrower than its native slot.
    pub fn convert(
        &mut self,
        expr: ExprRef,
        from: &Type,
        to: &Type,
        kind: ConversionKind,
        wrap: bool,
        location: &TextLocation,
    ) -> ExprRef {
        if to.is_void() {
            // Dropping a value is always fine; dropping nothing is a bug
            // in the caller.
            debug_assert!(!from.is_void(), "void-to-void conversion requested");
            self.current_type = self.void_type();
            return self.module.drop_(expr);
        }
        if from.is_void() {
            self.error(
                DiagnosticCode::VoidNotAllowed,
                format!("A void expression cannot convert to '{}'", to),
                location,
            );
            return self.unreachable_with_type(to);
        }
        if kind == ConversionKind::Implicit
            && !from.is_assignable_to(to)
            && !self.reference_upcast_is_legal(from, to)
        {
            self.error(
                DiagnosticCode::NotAssignable,
                format!("Type '{}' is not assignable to type '{}'", from, to),
                location,
            );
            // fall through; the numeric conversion below keeps the IR
            // consistent with the contextual type
        }

        let mut expr = expr;
        match (from.is_float(), to.is_float()) {
            (true, true) => {
                if from.size < to.size {
                    expr = self.module.unary(UnaryOp::PromoteF32, expr);
                } else if from.size > to.size {
                    expr = self.module.unary(UnaryOp::DemoteF64, expr);
                }
            }
            (true, false) => {
                // Float to int: truncate toward zero, signedness of the
                // destination decides the instruction.
                let op = match (from.size, to.is_long(), to.is_signed()) {
                    (4, false, true) => UnaryOp::TruncSF32ToI32,
                    (4, false, false) => UnaryOp::TruncUF32ToI32,
                    (4, true, true) => UnaryOp::TruncSF32ToI64,
                    (4, true, false) => UnaryOp::TruncUF32ToI64,
                    (_, false, true) => UnaryOp::TruncSF64ToI32,
                    (_, false, false) => UnaryOp::TruncUF64ToI32,
                    (_, true, true) => UnaryOp::TruncSF64ToI64,
                    (_, true, false) => UnaryOp::TruncUF64ToI64,
                };
                expr = self.module.unary(op, expr);
            }
            (false, true) => {
                // Int to float: signedness of the source decides. A small
                // integer's garbage bits would become value, so clear
                // them first.
                if from.is_small_integer() && self.expr_can_overflow(expr, from) {
                    expr = self.ensure_small_integer_wrap(expr, from);
                }
                let op = match (from.is_long(), to.size, from.is_signed()) {
                    (false, 4, true) => UnaryOp::ConvertSI32ToF32,
                    (false, 4, false) => UnaryOp::ConvertUI32ToF32,
                    (true, 4, true) => UnaryOp::ConvertSI64ToF32,
                    (true, 4, false) => UnaryOp::ConvertUI64ToF32,
                    (false, _, true) => UnaryOp::ConvertSI32ToF64,
                    (false, _, false) => UnaryOp::ConvertUI32ToF64,
                    (true, _, true) => UnaryOp::ConvertSI64ToF64,
                    (true, _, false) => UnaryOp::ConvertUI64ToF64,
                };
                expr = self.module.unary(op, expr);
            }
            (false, false) => {
                if from.is_long() && !to.is_long() {
                    expr = self.module.unary(UnaryOp::WrapI64, expr);
                } else if !from.is_long() && to.is_long() {
                    // A narrower-to-wider conversion of a small integer
                    // must clear garbage bits before the extend.
                    if from.is_small_integer() && self.expr_can_overflow(expr, from) {
                        expr = self.ensure_small_integer_wrap(expr, from);
                    }
                    let op = if from.is_signed() {
                        UnaryOp::ExtendSI32
                    } else {
                        UnaryOp::ExtendUI32
                    };
                    expr = self.module.unary(op, expr);
                } else if from.is_small_integer()
                    && to.logical_bits() > from.logical_bits()
                    && self.expr_can_overflow(expr, from)
                {
                    // Widening within the 32-bit slot: garbage bits above
                    // the source width would become value bits.
                    expr = self.ensure_small_integer_wrap(expr, from);
                }
            }
        }

        self.current_type = to.clone();
        if wrap && to.is_small_integer() {
            expr = self.ensure_small_integer_wrap(expr, to);
        }
        expr
    }

    /// Whether `from` references a class whose base chain reaches `to`'s
    /// class. The lattice alone cannot see inheritance; the walk needs
    /// the program.
    fn reference_upcast_is_legal(&self, from: &Type, to: &Type) -> bool {
        let (Some(from_class), Some(to_class)) = (from.class_reference, to.class_reference)
        else {
            return false;
        };
        if from.nullable && !to.nullable {
            return false;
        }
        let mut class = from_class;
        loop {
            if class == to_class {
                return true;
            }
            match self.program.class(class).base {
                Some(base) => class = base,
                None => return false,
            }
        }
    }

    /// Clear the garbage bits of a logical 8/16/1-bit value living in a
    /// 32-bit native slot. Skipped when the flow already knows the value
    /// is wrapped.
    pub fn ensure_small_integer_wrap(&mut self, expr: ExprRef, ty: &Type) -> ExprRef {
        if !ty.is_small_integer() {
            return expr;
        }
        if !self.expr_can_overflow(expr, ty) {
            return expr;
        }
        let sign_extension = self.options.has_feature(Feature::SIGN_EXTENSION);
        match ty.kind {
            TypeKind::I8 if sign_extension => self.module.unary(UnaryOp::ExtendI8ToI32, expr),
            TypeKind::I16 if sign_extension => self.module.unary(UnaryOp::ExtendI16ToI32, expr),
            TypeKind::I8 | TypeKind::I16 => {
                let bits = 32 - ty.logical_bits() as i32;
                let shift_left = self.module.i32(bits);
                let shifted = self.module.binary(BinaryOp::ShlI32, expr, shift_left);
                let shift_right = self.module.i32(bits);
                self.module.binary(BinaryOp::ShrSI32, shifted, shift_right)
            }
            TypeKind::U8 => {
                let mask = self.module.i32(0xff);
                self.module.binary(BinaryOp::AndI32, expr, mask)
            }
            TypeKind::U16 => {
                let mask = self.module.i32(0xffff);
                self.module.binary(BinaryOp::AndI32, expr, mask)
            }
            TypeKind::Bool => {
                let mask = self.module.i32(1);
                self.module.binary(BinaryOp::AndI32, expr, mask)
            }
            _ => expr,
        }
    }

    /// An i32 condition that is non-zero iff `expr` is truthy.
    pub fn make_is_trueish(&mut self, expr: ExprRef, ty: &Type) -> ExprRef {
        match ty.native_type() {
            NativeType::I32 => {
                if ty.is_small_integer() {
                    self.ensure_small_integer_wrap(expr, ty)
                } else {
                    expr
                }
            }
            NativeType::I64 => {
                let zero = self.module.i64(0);
                self.module.binary(BinaryOp::NeI64, expr, zero)
            }
            NativeType::F32 => {
                let zero = self.module.f32(0.0);
                self.module.binary(BinaryOp::NeF32, expr, zero)
            }
            NativeType::F64 => {
                let zero = self.module.f64(0.0);
                self.module.binary(BinaryOp::NeF64, expr, zero)
            }
            NativeType::None => expr,
        }
    }

    /// An i32 condition that is non-zero iff `expr` is falsy.
    pub fn make_is_falseish(&mut self, expr: ExprRef, ty: &Type) -> ExprRef {
        match ty.native_type() {
            NativeType::I32 => {
                let wrapped = if ty.is_small_integer() {
                    self.ensure_small_integer_wrap(expr, ty)
                } else {
                    expr
                };
                self.module.unary(UnaryOp::EqzI32, wrapped)
            }
            NativeType::I64 => self.module.unary(UnaryOp::EqzI64, expr),
            NativeType::F32 => {
                let zero = self.module.f32(0.0);
                self.module.binary(BinaryOp::EqF32, expr, zero)
            }
            NativeType::F64 => {
                let zero = self.module.f64(0.0);
                self.module.binary(BinaryOp::EqF64, expr, zero)
            }
            NativeType::None => expr,
        }
    }
}
