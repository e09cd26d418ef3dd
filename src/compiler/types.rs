//! The Trellis type lattice.
//!
//! Every source-level type is either one of the primitive numeric kinds or
//! a reference to a class. References are pointer-sized integers carrying
//! the referenced class, so arithmetic-facing queries (size, native type)
//! work uniformly across the lattice.
//!
//! The two central operations consumed by codegen live here:
//! - assignability, which drives implicit conversion legality
//! - [`common_compatible`], the smallest type two operands are both
//!   assignable to, used at every binary operator

use crate::compiler::program::{ElementId, Signature};
use crate::compiler::wir::nodes::NativeType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Bool,
    I8,
    I16,
    I32,
    I64,
    Isize,
    U8,
    U16,
    U32,
    U64,
    Usize,
    F32,
    F64,
    Void,
}

/// A concrete type. `size` is in bytes and already accounts for the
/// compilation target's pointer width for `isize`/`usize` and references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    pub kind: TypeKind,
    pub size: u32,
    /// Present on reference types. Reference types always have the
    /// target's pointer kind (`Usize`).
    pub class_reference: Option<ElementId>,
    /// Present on first-class function values (table indices); drives
    /// indirect call checking.
    pub signature_reference: Option<Box<Signature>>,
    pub nullable: bool,
}

impl Type {
    /// A primitive type of the given kind for a target with the given
    /// pointer size in bytes.
    pub fn of(kind: TypeKind, pointer_size: u32) -> Type {
        let size = match kind {
            TypeKind::Void => 0,
            TypeKind::Bool | TypeKind::I8 | TypeKind::U8 => 1,
            TypeKind::I16 | TypeKind::U16 => 2,
            TypeKind::I32 | TypeKind::U32 | TypeKind::F32 => 4,
            TypeKind::I64 | TypeKind::U64 | TypeKind::F64 => 8,
            TypeKind::Isize | TypeKind::Usize => pointer_size,
        };
        Type {
            kind,
            size,
            class_reference: None,
            signature_reference: None,
            nullable: false,
        }
    }

    /// A reference to `class`, pointer-sized for the target.
    pub fn reference(class: ElementId, pointer_size: u32, nullable: bool) -> Type {
        Type {
            kind: TypeKind::Usize,
            size: pointer_size,
            class_reference: Some(class),
            signature_reference: None,
            nullable,
        }
    }

    /// A first-class function value: an i32 index into the function
    /// table carrying the target's signature.
    pub fn function(signature: Signature, pointer_size: u32) -> Type {
        let mut ty = Type::of(TypeKind::U32, pointer_size);
        ty.signature_reference = Some(Box::new(signature));
        ty
    }

    pub fn as_nullable(&self) -> Type {
        let mut ty = self.clone();
        ty.nullable = true;
        ty
    }

    pub fn is_void(&self) -> bool {
        self.kind == TypeKind::Void
    }

    pub fn is_reference(&self) -> bool {
        self.class_reference.is_some()
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self.kind, TypeKind::F32 | TypeKind::F64 | TypeKind::Void)
    }

    pub fn is_float(&self) -> bool {
        matches!(self.kind, TypeKind::F32 | TypeKind::F64)
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::I8
                | TypeKind::I16
                | TypeKind::I32
                | TypeKind::I64
                | TypeKind::Isize
                | TypeKind::F32
                | TypeKind::F64
        )
    }

    /// 64-bit integer types.
    pub fn is_long(&self) -> bool {
        self.is_integer() && self.size == 8
    }

    /// Integers narrower than 32 bits, including `bool`. These live in
    /// 32-bit IR slots and need explicit wrapping when observable width
    /// matters.
    pub fn is_small_integer(&self) -> bool {
        self.is_integer() && self.size < 4
    }

    /// The IR-level primitive backing this type.
    pub fn native_type(&self) -> NativeType {
        match self.kind {
            TypeKind::Void => NativeType::None,
            TypeKind::F32 => NativeType::F32,
            TypeKind::F64 => NativeType::F64,
            _ => {
                if self.size == 8 {
                    NativeType::I64
                } else {
                    NativeType::I32
                }
            }
        }
    }

    /// The number of meaningful bits when the value sits in its native
    /// slot: 1 for bool, 8/16 for the short kinds, otherwise the full
    /// slot width.
    pub fn logical_bits(&self) -> u32 {
        match self.kind {
            TypeKind::Bool => 1,
            _ => self.size * 8,
        }
    }

    /// The signed integer type of the same width, used when float bits
    /// are reinterpreted for bitwise work.
    pub fn signed_companion(&self, pointer_size: u32) -> Type {
        let kind = match self.kind {
            TypeKind::Bool | TypeKind::U8 => TypeKind::I8,
            TypeKind::U16 => TypeKind::I16,
            TypeKind::U32 | TypeKind::F32 => TypeKind::I32,
            TypeKind::U64 | TypeKind::F64 => TypeKind::I64,
            TypeKind::Usize => TypeKind::Isize,
            other => other,
        };
        Type::of(kind, pointer_size)
    }

    /// The unsigned integer type of the same width.
    pub fn unsigned_companion(&self, pointer_size: u32) -> Type {
        let kind = match self.kind {
            TypeKind::I8 => TypeKind::U8,
            TypeKind::I16 => TypeKind::U16,
            TypeKind::I32 | TypeKind::F32 => TypeKind::U32,
            TypeKind::I64 | TypeKind::F64 => TypeKind::U64,
            TypeKind::Isize => TypeKind::Usize,
            other => other,
        };
        Type::of(kind, pointer_size)
    }

    /// Whether a value of this type converts to `target` without an
    /// explicit cast.
    ///
    /// Integer widening keeps value semantics: same-signedness widening is
    /// always fine, and unsigned fits into any strictly wider signed type.
    /// Anything that can lose bits or reinterpret them (narrowing, sign
    /// flips at the same width, int<->float) needs an explicit conversion.
    pub fn is_assignable_to(&self, target: &Type) -> bool {
        if self.signature_reference.is_some() || target.signature_reference.is_some() {
            // Function values only convert between identical signatures.
            return self.signature_reference == target.signature_reference;
        }
        if self.kind == target.kind && self.class_reference == target.class_reference {
            // Only gaining nullability is implicit.
            return !self.nullable || target.nullable;
        }
        if self.is_reference() || target.is_reference() {
            // Distinct classes; inheritance is resolved upstream and
            // expressed by the resolver substituting the base type.
            return false;
        }
        match (self.is_integer(), target.is_integer()) {
            (true, true) => {
                target.size > self.size && (target.is_signed() || !self.is_signed())
            }
            (false, false) => self.size < target.size, // f32 -> f64
            _ => false,
        }
    }

    /// Render the type the way source code spells it.
    pub fn to_display_string(&self, class_name: Option<&str>) -> String {
        if let Some(name) = class_name {
            if self.nullable {
                return format!("{} | null", name);
            }
            return name.to_string();
        }
        let base = match self.kind {
            TypeKind::Bool => "bool",
            TypeKind::I8 => "i8",
            TypeKind::I16 => "i16",
            TypeKind::I32 => "i32",
            TypeKind::I64 => "i64",
            TypeKind::Isize => "isize",
            TypeKind::U8 => "u8",
            TypeKind::U16 => "u16",
            TypeKind::U32 => "u32",
            TypeKind::U64 => "u64",
            TypeKind::Usize => "usize",
            TypeKind::F32 => "f32",
            TypeKind::F64 => "f64",
            TypeKind::Void => "void",
        };
        base.to_string()
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(class) = self.class_reference {
            write!(f, "ref#{}", class.index())?;
            if self.nullable {
                write!(f, " | null")?;
            }
            return Ok(());
        }
        if self.signature_reference.is_some() {
            return write!(f, "fn");
        }
        write!(f, "{}", self.to_display_string(None))
    }
}

/// The smallest type both `a` and `b` are assignable to, or `None` if the
/// operands need an explicit cast first.
///
/// With `signedness_is_significant` (relational operators), same-width
/// integers of different signedness are incompatible: the comparison
/// instruction differs. For sign-agnostic arithmetic the left operand's
/// type wins at equal width.
pub fn common_compatible(a: &Type, b: &Type, signedness_is_significant: bool) -> Option<Type> {
    if a.kind == b.kind && a.class_reference == b.class_reference {
        if a.nullable != b.nullable {
            return Some(a.as_nullable());
        }
        return Some(a.clone());
    }
    if a.is_assignable_to(b) {
        return Some(b.clone());
    }
    if b.is_assignable_to(a) {
        return Some(a.clone());
    }
    if !signedness_is_significant
        && a.is_integer()
        && b.is_integer()
        && a.size == b.size
        && !a.is_reference()
        && !b.is_reference()
    {
        return Some(a.clone());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(kind: TypeKind) -> Type {
        Type::of(kind, 4)
    }

    #[test]
    fn integer_widening_is_assignable() {
        assert!(t(TypeKind::I8).is_assignable_to(&t(TypeKind::I16)));
        assert!(t(TypeKind::I8).is_assignable_to(&t(TypeKind::I32)));
        assert!(t(TypeKind::U8).is_assignable_to(&t(TypeKind::U32)));
        assert!(t(TypeKind::U8).is_assignable_to(&t(TypeKind::I16)));
        assert!(t(TypeKind::U32).is_assignable_to(&t(TypeKind::I64)));
    }

    #[test]
    fn narrowing_and_sign_flips_are_not_assignable() {
        assert!(!t(TypeKind::I32).is_assignable_to(&t(TypeKind::I16)));
        assert!(!t(TypeKind::I8).is_assignable_to(&t(TypeKind::U16)));
        assert!(!t(TypeKind::I32).is_assignable_to(&t(TypeKind::U32)));
        assert!(!t(TypeKind::U32).is_assignable_to(&t(TypeKind::I32)));
    }

    #[test]
    fn int_float_conversions_require_explicit_casts() {
        assert!(!t(TypeKind::I32).is_assignable_to(&t(TypeKind::F64)));
        assert!(!t(TypeKind::F32).is_assignable_to(&t(TypeKind::I32)));
        assert!(t(TypeKind::F32).is_assignable_to(&t(TypeKind::F64)));
        assert!(!t(TypeKind::F64).is_assignable_to(&t(TypeKind::F32)));
    }

    #[test]
    fn common_type_picks_the_wider_operand() {
        let c = common_compatible(&t(TypeKind::I8), &t(TypeKind::I32), false).unwrap();
        assert_eq!(c.kind, TypeKind::I32);
        let c = common_compatible(&t(TypeKind::U8), &t(TypeKind::I16), true).unwrap();
        assert_eq!(c.kind, TypeKind::I16);
    }

    #[test]
    fn same_width_sign_mismatch_depends_on_significance() {
        assert!(common_compatible(&t(TypeKind::I32), &t(TypeKind::U32), true).is_none());
        let c = common_compatible(&t(TypeKind::I32), &t(TypeKind::U32), false).unwrap();
        assert_eq!(c.kind, TypeKind::I32);
    }

    #[test]
    fn native_types_match_slot_widths() {
        assert_eq!(t(TypeKind::Bool).native_type(), NativeType::I32);
        assert_eq!(t(TypeKind::I16).native_type(), NativeType::I32);
        assert_eq!(t(TypeKind::I64).native_type(), NativeType::I64);
        assert_eq!(t(TypeKind::F32).native_type(), NativeType::F32);
        assert_eq!(t(TypeKind::Void).native_type(), NativeType::None);
        assert_eq!(Type::of(TypeKind::Usize, 8).native_type(), NativeType::I64);
    }

    #[test]
    fn small_integer_classification() {
        assert!(t(TypeKind::Bool).is_small_integer());
        assert!(t(TypeKind::I8).is_small_integer());
        assert!(t(TypeKind::U16).is_small_integer());
        assert!(!t(TypeKind::I32).is_small_integer());
        assert!(!t(TypeKind::F32).is_small_integer());
    }
}
