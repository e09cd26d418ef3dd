//! WIR node definitions.
//!
//! WIR is the WASM-shaped expression IR the codegen core produces. Nodes
//! live in an arena owned by [`super::module::WirModule`] and reference
//! each other through [`ExprRef`] handles; the tree is serialised to
//! `wasm_encoder` instructions when the module is encoded.
//!
//! The IR has no notion of source-level types: every node is typed by one
//! of the four WASM value types or `None` for statement-position nodes.

/// The IR-level primitive backing a source type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeType {
    None,
    I32,
    I64,
    F32,
    F64,
}

impl NativeType {
    pub fn val_type(self) -> Option<wasm_encoder::ValType> {
        match self {
            NativeType::None => None,
            NativeType::I32 => Some(wasm_encoder::ValType::I32),
            NativeType::I64 => Some(wasm_encoder::ValType::I64),
            NativeType::F32 => Some(wasm_encoder::ValType::F32),
            NativeType::F64 => Some(wasm_encoder::ValType::F64),
        }
    }

    /// One character per native type, used to build signature strings for
    /// the function-type pool.
    pub fn signature_char(self) -> char {
        match self {
            NativeType::None => 'v',
            NativeType::I32 => 'i',
            NativeType::I64 => 'I',
            NativeType::F32 => 'f',
            NativeType::F64 => 'F',
        }
    }
}

/// A handle into the module's node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprRef(pub(crate) u32);

impl ExprRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A constant IR value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Literal {
    pub fn native_type(self) -> NativeType {
        match self {
            Literal::I32(_) => NativeType::I32,
            Literal::I64(_) => NativeType::I64,
            Literal::F32(_) => NativeType::F32,
            Literal::F64(_) => NativeType::F64,
        }
    }

    pub fn is_zero(self) -> bool {
        match self {
            Literal::I32(v) => v == 0,
            Literal::I64(v) => v == 0,
            Literal::F32(v) => v == 0.0,
            Literal::F64(v) => v == 0.0,
        }
    }

    /// The zero value for a native type; `None` slots have no zero.
    pub fn zero_of(ty: NativeType) -> Option<Literal> {
        match ty {
            NativeType::None => None,
            NativeType::I32 => Some(Literal::I32(0)),
            NativeType::I64 => Some(Literal::I64(0)),
            NativeType::F32 => Some(Literal::F32(0.0)),
            NativeType::F64 => Some(Literal::F64(0.0)),
        }
    }

    pub fn as_i64(self) -> Option<i64> {
        match self {
            Literal::I32(v) => Some(v as i64),
            Literal::I64(v) => Some(v),
            _ => None,
        }
    }
}

// ============================================================================
// Operators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    // Tests
    EqzI32,
    EqzI64,
    // Width changes
    WrapI64,
    ExtendSI32,
    ExtendUI32,
    // Sign-extension ops (require the sign_extension feature)
    ExtendI8ToI32,
    ExtendI16ToI32,
    // Float -> int truncation
    TruncSF32ToI32,
    TruncUF32ToI32,
    TruncSF64ToI32,
    TruncUF64ToI32,
    TruncSF32ToI64,
    TruncUF32ToI64,
    TruncSF64ToI64,
    TruncUF64ToI64,
    // Int -> float conversion
    ConvertSI32ToF32,
    ConvertUI32ToF32,
    ConvertSI64ToF32,
    ConvertUI64ToF32,
    ConvertSI32ToF64,
    ConvertUI32ToF64,
    ConvertSI64ToF64,
    ConvertUI64ToF64,
    // Float width changes
    PromoteF32,
    DemoteF64,
    // Float arithmetic
    NegF32,
    NegF64,
}

impl UnaryOp {
    pub fn result_type(self) -> NativeType {
        use UnaryOp::*;
        match self {
            EqzI32 | EqzI64 | WrapI64 | ExtendI8ToI32 | ExtendI16ToI32 | TruncSF32ToI32
            | TruncUF32ToI32 | TruncSF64ToI32 | TruncUF64ToI32 => NativeType::I32,
            ExtendSI32 | ExtendUI32 | TruncSF32ToI64 | TruncUF32ToI64 | TruncSF64ToI64
            | TruncUF64ToI64 => NativeType::I64,
            ConvertSI32ToF32 | ConvertUI32ToF32 | ConvertSI64ToF32 | ConvertUI64ToF32
            | DemoteF64 | NegF32 => NativeType::F32,
            ConvertSI32ToF64 | ConvertUI32ToF64 | ConvertSI64ToF64 | ConvertUI64ToF64
            | PromoteF32 | NegF64 => NativeType::F64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    // i32
    AddI32,
    SubI32,
    MulI32,
    DivSI32,
    DivUI32,
    RemSI32,
    RemUI32,
    AndI32,
    OrI32,
    XorI32,
    ShlI32,
    ShrSI32,
    ShrUI32,
    EqI32,
    NeI32,
    LtSI32,
    LtUI32,
    LeSI32,
    LeUI32,
    GtSI32,
    GtUI32,
    GeSI32,
    GeUI32,
    // i64
    AddI64,
    SubI64,
    MulI64,
    DivSI64,
    DivUI64,
    RemSI64,
    RemUI64,
    AndI64,
    OrI64,
    XorI64,
    ShlI64,
    ShrSI64,
    ShrUI64,
    EqI64,
    NeI64,
    LtSI64,
    LtUI64,
    LeSI64,
    LeUI64,
    GtSI64,
    GtUI64,
    GeSI64,
    GeUI64,
    // f32
    AddF32,
    SubF32,
    MulF32,
    DivF32,
    EqF32,
    NeF32,
    LtF32,
    LeF32,
    GtF32,
    GeF32,
    // f64
    AddF64,
    SubF64,
    MulF64,
    DivF64,
    EqF64,
    NeF64,
    LtF64,
    LeF64,
    GtF64,
    GeF64,
}

impl BinaryOp {
    pub fn result_type(self) -> NativeType {
        use BinaryOp::*;
        match self {
            AddI32 | SubI32 | MulI32 | DivSI32 | DivUI32 | RemSI32 | RemUI32 | AndI32 | OrI32
            | XorI32 | ShlI32 | ShrSI32 | ShrUI32 => NativeType::I32,
            AddI64 | SubI64 | MulI64 | DivSI64 | DivUI64 | RemSI64 | RemUI64 | AndI64 | OrI64
            | XorI64 | ShlI64 | ShrSI64 | ShrUI64 => NativeType::I64,
            AddF32 | SubF32 | MulF32 | DivF32 => NativeType::F32,
            AddF64 | SubF64 | MulF64 | DivF64 => NativeType::F64,
            // All comparisons produce an i32 flag.
            _ => NativeType::I32,
        }
    }

    pub fn is_comparison(self) -> bool {
        use BinaryOp::*;
        matches!(
            self,
            EqI32 | NeI32 | LtSI32 | LtUI32 | LeSI32 | LeUI32 | GtSI32 | GtUI32 | GeSI32
                | GeUI32
                | EqI64
                | NeI64
                | LtSI64
                | LtUI64
                | LeSI64
                | LeUI64
                | GtSI64
                | GtUI64
                | GeSI64
                | GeUI64
                | EqF32
                | NeF32
                | LtF32
                | LeF32
                | GtF32
                | GeF32
                | EqF64
                | NeF64
                | LtF64
                | LeF64
                | GtF64
                | GeF64
        )
    }
}

// ============================================================================
// Nodes
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ExprNode {
    Const(Literal),
    Unary {
        op: UnaryOp,
        operand: ExprRef,
    },
    Binary {
        op: BinaryOp,
        left: ExprRef,
        right: ExprRef,
    },
    GetLocal {
        index: u32,
        ty: NativeType,
    },
    SetLocal {
        index: u32,
        value: ExprRef,
    },
    TeeLocal {
        index: u32,
        value: ExprRef,
        ty: NativeType,
    },
    GetGlobal {
        name: String,
        ty: NativeType,
    },
    SetGlobal {
        name: String,
        value: ExprRef,
    },
    Load {
        bytes: u8,
        signed: bool,
        offset: u32,
        ptr: ExprRef,
        ty: NativeType,
    },
    Store {
        bytes: u8,
        offset: u32,
        ptr: ExprRef,
        value: ExprRef,
        value_ty: NativeType,
    },
    /// Direct call to a function defined in this module.
    Call {
        target: String,
        operands: Vec<ExprRef>,
        ty: NativeType,
    },
    /// Direct call to an imported function.
    CallImport {
        target: String,
        operands: Vec<ExprRef>,
        ty: NativeType,
    },
    CallIndirect {
        type_index: u32,
        index: ExprRef,
        operands: Vec<ExprRef>,
        ty: NativeType,
    },
    Block {
        label: Option<String>,
        children: Vec<ExprRef>,
        ty: NativeType,
    },
    If {
        condition: ExprRef,
        if_true: ExprRef,
        if_false: Option<ExprRef>,
        ty: NativeType,
    },
    Loop {
        label: Option<String>,
        body: ExprRef,
    },
    /// `br` / `br_if`, optionally carrying a value.
    Break {
        label: String,
        condition: Option<ExprRef>,
        value: Option<ExprRef>,
    },
    /// `br_table` over `labels` with a fallback.
    Switch {
        labels: Vec<String>,
        default_label: String,
        condition: ExprRef,
    },
    Return {
        value: Option<ExprRef>,
    },
    Drop {
        value: ExprRef,
    },
    Select {
        if_true: ExprRef,
        if_false: ExprRef,
        condition: ExprRef,
        ty: NativeType,
    },
    Nop,
    Unreachable,
}
