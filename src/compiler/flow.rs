//! Per-function control-flow analysis.
//!
//! A [`Flow`] tracks what a region of code is known to do: whether it
//! returns, breaks, continues or throws, whether a constructor has
//! allocated `this`, and which short-integer locals currently hold a
//! provably wrapped value.
//!
//! Flows form a LIFO stack: every `fork` pushes the current flow into the
//! child's `parent` box and every `free` pops it back, so the pairing is
//! structural. Results merge into the parent through one of three
//! operations depending on whether the region executes unconditionally,
//! conditionally, or as one of two mutually exclusive arms.

use crate::compiler::program::Local;
use crate::compiler::types::{Type, TypeKind};
use crate::compiler::wir::module::WirModule;
use crate::compiler::wir::nodes::{BinaryOp, ExprNode, ExprRef, Literal, NativeType, UnaryOp};
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowFlags(u32);

impl FlowFlags {
    pub const NONE: FlowFlags = FlowFlags(0);
    /// Definitely returns on every path.
    pub const RETURNS: FlowFlags = FlowFlags(1 << 0);
    /// Every returned value is provably wrapped.
    pub const RETURNS_WRAPPED: FlowFlags = FlowFlags(1 << 1);
    /// Definitely breaks out of the enclosing break context.
    pub const BREAKS: FlowFlags = FlowFlags(1 << 2);
    pub const CONDITIONALLY_BREAKS: FlowFlags = FlowFlags(1 << 3);
    /// Definitely continues the enclosing loop.
    pub const CONTINUES: FlowFlags = FlowFlags(1 << 4);
    pub const CONDITIONALLY_CONTINUES: FlowFlags = FlowFlags(1 << 5);
    /// Definitely throws (aborts).
    pub const THROWS: FlowFlags = FlowFlags(1 << 6);
    /// A constructor body has definitely allocated `this`.
    pub const ALLOCATES: FlowFlags = FlowFlags(1 << 7);
    /// Compiling into an inline expansion; `return` becomes a break to
    /// the inline return label.
    pub const INLINE_CONTEXT: FlowFlags = FlowFlags(1 << 8);
    /// Inside `unchecked(…)`; bounds checks are elided.
    pub const UNCHECKED_CONTEXT: FlowFlags = FlowFlags(1 << 9);

    /// Flags a child flow inherits from its parent at fork time.
    const INHERITED: FlowFlags =
        FlowFlags(Self::INLINE_CONTEXT.0 | Self::UNCHECKED_CONTEXT.0 | Self::ALLOCATES.0);

    /// Flags that terminate a region on every path.
    pub const ANY_TERMINATING: FlowFlags =
        FlowFlags(Self::RETURNS.0 | Self::BREAKS.0 | Self::CONTINUES.0 | Self::THROWS.0);

    pub fn has(self, flag: FlowFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn has_any(self, flags: FlowFlags) -> bool {
        self.0 & flags.0 != 0
    }

    pub fn set(&mut self, flag: FlowFlags) {
        self.0 |= flag.0;
    }

    pub fn clear(&mut self, flag: FlowFlags) {
        self.0 &= !flag.0;
    }

    pub fn union_with(&mut self, other: FlowFlags) {
        self.0 |= other.0;
    }
}

/// A named binding in a flow's scope: either a real local slot or a
/// virtual local whose constant value substitutes at each read.
#[derive(Debug, Clone)]
pub struct ScopedLocal {
    pub index: Option<u32>,
    pub ty: Type,
    pub constant: Option<Literal>,
    pub is_const: bool,
}

#[derive(Debug, Default)]
pub struct Flow {
    parent: Option<Box<Flow>>,
    pub flags: FlowFlags,
    pub return_type: Option<Type>,
    /// Set while compiling an inlined body; `return` breaks here.
    pub return_label: Option<String>,
    pub break_label: Option<String>,
    pub continue_label: Option<String>,
    pub contextual_type_arguments: FxHashMap<String, Type>,
    /// One bit per local index below 64: set when the local is known to
    /// hold a wrapped value. Locals past 63 are conservatively unwrapped.
    wrapped_locals: u64,
    scoped_locals: FxHashMap<String, ScopedLocal>,
}

impl Flow {
    pub fn create(
        return_type: Type,
        contextual_type_arguments: FxHashMap<String, Type>,
    ) -> Flow {
        Flow {
            parent: None,
            flags: FlowFlags::NONE,
            return_type: Some(return_type),
            return_label: None,
            break_label: None,
            continue_label: None,
            contextual_type_arguments,
            wrapped_locals: 0,
            scoped_locals: FxHashMap::default(),
        }
    }

    /// Fork a child flow, consuming the parent. Contextual state (labels,
    /// return type, inline/unchecked bits, wrapped-local knowledge) is
    /// inherited; result bits start clear.
    pub fn fork(parent: Flow) -> Flow {
        let mut flags = FlowFlags::NONE;
        for inherited in [
            FlowFlags::INLINE_CONTEXT,
            FlowFlags::UNCHECKED_CONTEXT,
            FlowFlags::ALLOCATES,
        ] {
            if parent.flags.has(inherited) {
                flags.set(inherited);
            }
        }
        debug_assert!(FlowFlags::INHERITED.has(flags));
        Flow {
            flags,
            return_type: parent.return_type.clone(),
            return_label: parent.return_label.clone(),
            break_label: parent.break_label.clone(),
            continue_label: parent.continue_label.clone(),
            contextual_type_arguments: parent.contextual_type_arguments.clone(),
            wrapped_locals: parent.wrapped_locals,
            scoped_locals: FxHashMap::default(),
            parent: Some(Box::new(parent)),
        }
    }

    /// Unwind one fork: returns `(parent, child)` with the child's parent
    /// link severed. The caller merges the child into the parent with one
    /// of the `inherit` operations.
    pub fn free(mut self) -> (Flow, Flow) {
        let parent = *self
            .parent
            .take()
            .expect("free() called on a flow without a parent");
        (parent, self)
    }

    pub fn is_inline(&self) -> bool {
        self.flags.has(FlowFlags::INLINE_CONTEXT)
    }

    // =========================================================================
    // Merges
    // =========================================================================

    /// Merge a child that executes unconditionally: all of its result
    /// bits and wrapped-local knowledge become the parent's.
    pub fn inherit(&mut self, child: &Flow) {
        self.flags.0 |= child.flags.0;
        self.wrapped_locals = child.wrapped_locals;
    }

    /// Merge a child that may not execute: terminating bits weaken to
    /// their conditional counterparts, and only locals wrapped on both
    /// paths stay wrapped.
    pub fn inherit_conditional(&mut self, child: &Flow) {
        if child.flags.has(FlowFlags::BREAKS) || child.flags.has(FlowFlags::CONDITIONALLY_BREAKS)
        {
            self.flags.set(FlowFlags::CONDITIONALLY_BREAKS);
        }
        if child.flags.has(FlowFlags::CONTINUES)
            || child.flags.has(FlowFlags::CONDITIONALLY_CONTINUES)
        {
            self.flags.set(FlowFlags::CONDITIONALLY_CONTINUES);
        }
        self.wrapped_locals &= child.wrapped_locals;
    }

    /// Merge two mutually exclusive arms: bits set in both upgrade to
    /// unconditional, bits set in exactly one degrade to conditional.
    pub fn inherit_mutual(&mut self, left: &Flow, right: &Flow) {
        // Bits both arms agree on become definite.
        self.flags.0 |= left.flags.0 & right.flags.0;
        for (definite, conditional) in [
            (FlowFlags::BREAKS, FlowFlags::CONDITIONALLY_BREAKS),
            (FlowFlags::CONTINUES, FlowFlags::CONDITIONALLY_CONTINUES),
        ] {
            let in_left = left.flags.has(definite);
            let in_right = right.flags.has(definite);
            if in_left != in_right {
                self.flags.set(conditional);
            }
        }
        self.flags.0 |=
            (left.flags.0 | right.flags.0)
                & (FlowFlags::CONDITIONALLY_BREAKS.0 | FlowFlags::CONDITIONALLY_CONTINUES.0);
        self.wrapped_locals = left.wrapped_locals & right.wrapped_locals;
    }

    // =========================================================================
    // Wrapped-local tracking
    // =========================================================================

    pub fn set_local_wrapped(&mut self, index: u32, wrapped: bool) {
        if index >= 64 {
            return;
        }
        if wrapped {
            self.wrapped_locals |= 1 << index;
        } else {
            self.wrapped_locals &= !(1 << index);
        }
    }

    pub fn is_local_wrapped(&self, index: u32) -> bool {
        index < 64 && self.wrapped_locals & (1 << index) != 0
    }

    // =========================================================================
    // Scoped locals
    // =========================================================================

    /// Bind a name to a local slot in this flow's scope.
    pub fn add_scoped_local(&mut self, name: impl Into<String>, index: u32, ty: Type) {
        self.scoped_locals.insert(
            name.into(),
            ScopedLocal {
                index: Some(index),
                ty,
                constant: None,
                is_const: false,
            },
        );
    }

    /// Like `add_scoped_local`, but assignment to the name is an error.
    pub fn add_scoped_const_local(&mut self, name: impl Into<String>, index: u32, ty: Type) {
        self.scoped_locals.insert(
            name.into(),
            ScopedLocal {
                index: Some(index),
                ty,
                constant: None,
                is_const: true,
            },
        );
    }

    /// Bind a name to a constant value with no local slot behind it;
    /// reads substitute the literal.
    pub fn add_virtual_local(&mut self, name: impl Into<String>, ty: Type, value: Literal) {
        self.scoped_locals.insert(
            name.into(),
            ScopedLocal {
                index: None,
                ty,
                constant: Some(value),
                is_const: true,
            },
        );
    }

    /// Whether this flow (not an ancestor) already binds `name`;
    /// shadowing an outer scope is fine, redeclaring in the same scope is
    /// not.
    pub fn has_own_scoped_local(&self, name: &str) -> bool {
        self.scoped_locals.contains_key(name)
    }

    /// Look a name up through this flow and its ancestors.
    pub fn scoped_local(&self, name: &str) -> Option<&ScopedLocal> {
        if let Some(local) = self.scoped_locals.get(name) {
            return Some(local);
        }
        self.parent.as_ref().and_then(|p| p.scoped_local(name))
    }

    /// Local indices introduced by this flow alone, for returning temps
    /// to the pool when an inline scope unwinds.
    pub fn own_scoped_local_indices(&self) -> Vec<u32> {
        self.scoped_locals
            .values()
            .filter_map(|local| local.index)
            .collect()
    }

    // =========================================================================
    // Overflow prediction
    // =========================================================================

    /// Whether `expr` may carry garbage bits beyond `ty`'s logical width.
    ///
    /// Deliberately conservative: only shapes that provably fit: in-range
    /// constants, locals tracked as wrapped, sized loads, comparison
    /// results and explicit wrap sequences: report `false`.
    pub fn can_overflow(
        &self,
        module: &WirModule,
        expr: ExprRef,
        ty: &Type,
        locals: &[Local],
    ) -> bool {
        if !ty.is_small_integer() {
            return false;
        }
        match module.node(expr) {
            ExprNode::Const(Literal::I32(value)) => !literal_fits(*value, ty),
            ExprNode::GetLocal { index, .. } => {
                !(self.is_local_wrapped(*index)
                    && locals
                        .get(*index as usize)
                        .is_some_and(|local| local.ty == *ty))
            }
            ExprNode::TeeLocal { value, .. } => self.can_overflow(module, *value, ty, locals),
            ExprNode::Load { bytes, signed, .. } => {
                let bits = *bytes as u32 * 8;
                if ty.kind == TypeKind::Bool {
                    // Bool stores re-wrap, so a 1-byte load is 0 or 1.
                    return !(*bytes == 1 && !*signed);
                }
                !(bits <= ty.logical_bits() && *signed == ty.is_signed())
            }
            ExprNode::Unary { op, .. } => !matches!(
                (op, ty.kind),
                (UnaryOp::EqzI32 | UnaryOp::EqzI64, _)
                    | (UnaryOp::ExtendI8ToI32, TypeKind::I8)
                    | (UnaryOp::ExtendI16ToI32, TypeKind::I16)
            ),
            ExprNode::Binary { op, left, right } => {
                if op.is_comparison() {
                    return false;
                }
                match op {
                    // Masking with an in-range constant wraps.
                    BinaryOp::AndI32 => {
                        !matches!(module.node(*right), ExprNode::Const(Literal::I32(mask))
                            if !ty.is_signed() && (*mask as u32) < (1u32 << ty.logical_bits()))
                    }
                    // shr_s(shl(x, k), k) clears high bits for signed types.
                    BinaryOp::ShrSI32 => {
                        let shift = 32 - ty.logical_bits() as i32;
                        let ExprNode::Const(Literal::I32(outer)) = module.node(*right) else {
                            return true;
                        };
                        if *outer != shift {
                            return true;
                        }
                        let ExprNode::Binary {
                            op: BinaryOp::ShlI32,
                            right: inner_shift,
                            ..
                        } = module.node(*left)
                        else {
                            return true;
                        };
                        !matches!(module.node(*inner_shift), ExprNode::Const(Literal::I32(k)) if *k == shift)
                    }
                    _ => true,
                }
            }
            ExprNode::Select {
                if_true, if_false, ..
            } => {
                self.can_overflow(module, *if_true, ty, locals)
                    || self.can_overflow(module, *if_false, ty, locals)
            }
            ExprNode::If {
                if_true,
                if_false: Some(if_false),
                ty: native,
                ..
            } if *native != NativeType::None => {
                self.can_overflow(module, *if_true, ty, locals)
                    || self.can_overflow(module, *if_false, ty, locals)
            }
            _ => true,
        }
    }
}

fn literal_fits(value: i32, ty: &Type) -> bool {
    match ty.kind {
        TypeKind::Bool => value == 0 || value == 1,
        TypeKind::I8 => (i8::MIN as i32..=i8::MAX as i32).contains(&value),
        TypeKind::U8 => (0..=u8::MAX as i32).contains(&value),
        TypeKind::I16 => (i16::MIN as i32..=i16::MAX as i32).contains(&value),
        TypeKind::U16 => (0..=u16::MAX as i32).contains(&value),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i32_type() -> Type {
        Type::of(TypeKind::I32, 4)
    }

    fn fresh_flow() -> Flow {
        Flow::create(i32_type(), FxHashMap::default())
    }

    #[test]
    fn fork_and_free_restore_the_parent() {
        let mut parent = fresh_flow();
        parent.break_label = Some("break|0".to_string());
        let child = Flow::fork(parent);
        assert_eq!(child.break_label.as_deref(), Some("break|0"));
        let (parent, _child) = child.free();
        assert_eq!(parent.break_label.as_deref(), Some("break|0"));
    }

    #[test]
    #[should_panic(expected = "without a parent")]
    fn free_without_fork_panics() {
        let flow = fresh_flow();
        let _ = flow.free();
    }

    #[test]
    fn mutual_merge_upgrades_agreeing_returns() {
        let mut parent = fresh_flow();
        let mut then_arm = fresh_flow();
        let mut else_arm = fresh_flow();
        then_arm.flags.set(FlowFlags::RETURNS);
        else_arm.flags.set(FlowFlags::RETURNS);
        parent.inherit_mutual(&then_arm, &else_arm);
        assert!(parent.flags.has(FlowFlags::RETURNS));
    }

    #[test]
    fn mutual_merge_never_returns_from_one_arm() {
        let mut parent = fresh_flow();
        let mut then_arm = fresh_flow();
        let else_arm = fresh_flow();
        then_arm.flags.set(FlowFlags::RETURNS);
        parent.inherit_mutual(&then_arm, &else_arm);
        assert!(!parent.flags.has(FlowFlags::RETURNS));
    }

    #[test]
    fn mutual_merge_degrades_one_sided_breaks_to_conditional() {
        let mut parent = fresh_flow();
        let mut then_arm = fresh_flow();
        let else_arm = fresh_flow();
        then_arm.flags.set(FlowFlags::BREAKS);
        parent.inherit_mutual(&then_arm, &else_arm);
        assert!(!parent.flags.has(FlowFlags::BREAKS));
        assert!(parent.flags.has(FlowFlags::CONDITIONALLY_BREAKS));
    }

    #[test]
    fn conditional_merge_intersects_wrapped_locals() {
        let mut parent = fresh_flow();
        parent.set_local_wrapped(0, true);
        parent.set_local_wrapped(1, true);
        let mut child = Flow::fork(parent);
        child.set_local_wrapped(1, false);
        child.set_local_wrapped(2, true);
        let (mut parent, child) = child.free();
        parent.inherit_conditional(&child);
        assert!(parent.is_local_wrapped(0));
        assert!(!parent.is_local_wrapped(1)); // unwrapped in the arm
        assert!(!parent.is_local_wrapped(2)); // only wrapped in the arm
    }

    #[test]
    fn scoped_local_lookup_walks_ancestors() {
        let mut parent = fresh_flow();
        parent.add_scoped_local("x", 3, i32_type());
        let child = Flow::fork(parent);
        assert_eq!(child.scoped_local("x").and_then(|l| l.index), Some(3));
        assert!(child.scoped_local("y").is_none());
    }

    #[test]
    fn virtual_locals_have_no_slot() {
        let mut flow = fresh_flow();
        flow.add_virtual_local("K", i32_type(), Literal::I32(7));
        let local = flow.scoped_local("K").unwrap();
        assert_eq!(local.index, None);
        assert_eq!(local.constant, Some(Literal::I32(7)));
    }

    #[test]
    fn locals_past_the_bitset_are_never_wrapped() {
        let mut flow = fresh_flow();
        flow.set_local_wrapped(70, true);
        assert!(!flow.is_local_wrapped(70));
    }

    #[test]
    fn can_overflow_recognises_in_range_constants() {
        let mut module = WirModule::new();
        let flow = fresh_flow();
        let small = module.i32(100);
        let big = module.i32(300);
        let i8_ty = Type::of(TypeKind::I8, 4);
        assert!(!flow.can_overflow(&module, small, &i8_ty, &[]));
        assert!(flow.can_overflow(&module, big, &i8_ty, &[]));
    }

    #[test]
    fn can_overflow_recognises_comparison_results() {
        let mut module = WirModule::new();
        let flow = fresh_flow();
        let a = module.get_local(0, NativeType::I32);
        let b = module.get_local(1, NativeType::I32);
        let cmp = module.binary(BinaryOp::LtSI32, a, b);
        let bool_ty = Type::of(TypeKind::Bool, 4);
        assert!(!flow.can_overflow(&module, cmp, &bool_ty, &[]));
    }

    #[test]
    fn can_overflow_trusts_wrapped_locals_of_matching_type() {
        let mut module = WirModule::new();
        let mut flow = fresh_flow();
        let i8_ty = Type::of(TypeKind::I8, 4);
        let locals = vec![Local {
            name: "x".to_string(),
            ty: i8_ty.clone(),
            index: 0,
        }];
        let get = module.get_local(0, NativeType::I32);
        assert!(flow.can_overflow(&module, get, &i8_ty, &locals));
        flow.set_local_wrapped(0, true);
        assert!(!flow.can_overflow(&module, get, &i8_ty, &locals));
    }

    #[test]
    fn can_overflow_recognises_shift_wrap_shape() {
        let mut module = WirModule::new();
        let flow = fresh_flow();
        let i8_ty = Type::of(TypeKind::I8, 4);
        let x = module.get_local(0, NativeType::I32);
        let k1 = module.i32(24);
        let k2 = module.i32(24);
        let shl = module.binary(BinaryOp::ShlI32, x, k1);
        let shr = module.binary(BinaryOp::ShrSI32, shl, k2);
        assert!(!flow.can_overflow(&module, shr, &i8_ty, &[]));
    }
}
