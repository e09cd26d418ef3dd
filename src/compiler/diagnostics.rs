//! Compiler diagnostics.
//!
//! All user-facing problems are reported through a [`CompilerMessages`] bag
//! rather than by returning `Err`: codegen recovers from user mistakes and
//! keeps going so a whole diagnostic set is produced in one run. `Result`
//! is reserved for internal failures (compiler bugs, encoder failures)
//! which abort compilation.
//!
//! Every diagnostic carries a stable [`DiagnosticCode`] and the source
//! range it refers to. The final module may be invalid if any diagnostic
//! above warning severity was emitted; callers must inspect the bag before
//! using it.

use crate::compiler::tokens::TextLocation;
use colour::{e_dark_yellow_ln, e_grey_ln, e_red_ln, e_yellow_ln};

/// Broad category of a compiler error, used for rendering and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Type system violations: bad conversions, operator misuse,
    /// signature mismatches.
    Type,
    /// Semantic rule violations: unresolved names, bad `break` placement,
    /// assignment to constants.
    Rule,
    /// Constructs the compiler does not (yet) support.
    Unsupported,
    /// Internal compiler bugs. Never the user's fault.
    Compiler,
}

/// Stable identifier for each distinct diagnostic condition.
///
/// Codes are append-only: new conditions get new codes, existing codes
/// never change meaning. Tools match on the code, not the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DiagnosticCode {
    OperationNotSupported = 100,
    NotAssignable = 200,
    OperatorCannotBeApplied = 201,
    ExpectedArguments = 202,
    UnexpectedTypeArguments = 203,
    TypeExpected = 204,
    VoidNotAllowed = 205,
    NotCallable = 206,
    NotIndexable = 207,
    ThisOutsideInstanceContext = 220,
    SuperOutsideDerivedClass = 221,
    BreakOutsideLoop = 222,
    ContinueOutsideLoop = 223,
    ConstMissingInitializer = 224,
    AssignmentToConstant = 225,
    AssignmentToReadonly = 226,
    DuplicateIdentifier = 227,
    UnresolvableIdentifier = 228,
    PropertyDoesNotExist = 229,
    AmbientMustNotHaveBody = 230,
    ImplementationMissing = 231,
    ConstEnumNonConstant = 232,
    MutableGlobalExportUnavailable = 233,
    ArithmeticOperandsExpected = 234,
    // Warnings
    NonConstantConstInitializer = 900,
    InlineRecursion = 901,
}

impl DiagnosticCode {
    pub fn error_type(self) -> ErrorType {
        match self {
            DiagnosticCode::OperationNotSupported => ErrorType::Unsupported,
            DiagnosticCode::NotAssignable
            | DiagnosticCode::OperatorCannotBeApplied
            | DiagnosticCode::ExpectedArguments
            | DiagnosticCode::UnexpectedTypeArguments
            | DiagnosticCode::TypeExpected
            | DiagnosticCode::VoidNotAllowed
            | DiagnosticCode::NotCallable
            | DiagnosticCode::NotIndexable
            | DiagnosticCode::ArithmeticOperandsExpected => ErrorType::Type,
            _ => ErrorType::Rule,
        }
    }
}

/// An error produced during compilation.
///
/// Owns all of its data so it can cross stage boundaries without dragging
/// the source or any interning table along with it.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub msg: String,
    pub location: TextLocation,
    pub error_type: ErrorType,
    pub code: DiagnosticCode,
}

impl CompileError {
    pub fn new(
        code: DiagnosticCode,
        msg: impl Into<String>,
        location: TextLocation,
    ) -> CompileError {
        CompileError {
            msg: msg.into(),
            location,
            error_type: code.error_type(),
            code,
        }
    }

    /// An internal compiler bug. These abort compilation instead of being
    /// recorded in the message bag.
    pub fn internal(msg: impl Into<String>) -> CompileError {
        CompileError {
            msg: msg.into(),
            location: TextLocation::default(),
            error_type: ErrorType::Compiler,
            code: DiagnosticCode::OperationNotSupported,
        }
    }
}

/// A non-fatal warning. Compilation continues on the degraded path the
/// message describes.
#[derive(Debug, Clone)]
pub struct CompilerWarning {
    pub msg: String,
    pub location: TextLocation,
    pub code: DiagnosticCode,
}

/// The final set of errors and warnings emitted from the compiler.
#[derive(Debug, Default)]
pub struct CompilerMessages {
    pub errors: Vec<CompileError>,
    pub warnings: Vec<CompilerWarning>,
}

impl CompilerMessages {
    pub fn new() -> Self {
        CompilerMessages {
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn error(
        &mut self,
        code: DiagnosticCode,
        msg: impl Into<String>,
        location: &TextLocation,
    ) {
        self.errors
            .push(CompileError::new(code, msg, location.clone()));
    }

    pub fn warning(
        &mut self,
        code: DiagnosticCode,
        msg: impl Into<String>,
        location: &TextLocation,
    ) {
        self.warnings.push(CompilerWarning {
            msg: msg.into(),
            location: location.clone(),
            code,
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Print everything collected so far to stderr.
    pub fn print_all(&self) {
        for warning in &self.warnings {
            print_formatted_warning(warning);
        }
        for error in &self.errors {
            print_formatted_error(error);
        }
    }
}

/// Internal compiler bug error with a formatted message.
///
/// Usage: `return_compiler_error!("expected {} to be compiled", name);`
#[macro_export]
macro_rules! return_compiler_error {
    ($fmt:expr, $($arg:expr),+ $(,)?) => {{
        return Err($crate::compiler::diagnostics::CompileError::internal(
            format!($fmt, $($arg),+),
        ));
    }};
    ($msg:expr) => {{
        return Err($crate::compiler::diagnostics::CompileError::internal($msg));
    }};
}

pub fn print_formatted_error(error: &CompileError) {
    match error.error_type {
        ErrorType::Compiler => {
            e_red_ln!("Internal compiler error (please report this):");
        }
        ErrorType::Unsupported => {
            e_red_ln!("Unsupported [{:?}]:", error.code);
        }
        ErrorType::Type => {
            e_red_ln!("Type error [{:?}]:", error.code);
        }
        ErrorType::Rule => {
            e_red_ln!("Error [{:?}]:", error.code);
        }
    }
    e_grey_ln!(
        "  {}:{}:{}",
        error.location.scope.display(),
        error.location.start_pos.line_number,
        error.location.start_pos.char_column
    );
    e_red_ln!("  {}", error.msg);
}

pub fn print_formatted_warning(warning: &CompilerWarning) {
    e_yellow_ln!("Warning [{:?}]:", warning.code);
    e_dark_yellow_ln!(
        "  {}:{}:{} {}",
        warning.location.scope.display(),
        warning.location.start_pos.line_number,
        warning.location.start_pos.char_column,
        warning.msg
    );
}
