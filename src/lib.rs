//! Trellis compiler library.
//!
//! Trellis is a statically-typed, class-based language (a TypeScript-like
//! subset with explicit numeric types, generics and operator overloading)
//! compiled ahead of time to WebAssembly.
//!
//! The crate is organised by compilation stage:
//! - `compiler::ast`: source-shaped node trees with text locations
//! - `compiler::program` / `compiler::resolver`: resolved element model
//! - `compiler::wir`: the WASM-shaped expression IR and module builder
//! - `compiler::codegen`: type-directed lowering of the program into WIR
//!
//! The parser is a separate concern and is not part of this crate; programs
//! are constructed through the AST types directly (see `compiler_tests` for
//! the patterns).

pub mod compiler {
    pub mod ast;
    pub mod builtins;
    pub mod dev_logging;
    pub mod diagnostics;
    pub mod flow;
    pub mod program;
    pub mod resolver;
    pub mod tokens;
    pub mod types;

    pub mod wir {
        pub mod module;
        pub mod nodes;
    }

    pub mod codegen {
        pub mod calls;
        pub mod conversions;
        pub mod declarations;
        pub mod expressions;
        pub mod memory;
        pub mod statements;

        mod compiler;
        pub use compiler::*;
    }
}

pub(crate) mod compiler_tests {
    #[cfg(test)]
    pub(crate) mod call_tests;
    #[cfg(test)]
    pub(crate) mod class_tests;
    #[cfg(test)]
    pub(crate) mod codegen_tests;
    #[cfg(test)]
    pub(crate) mod memory_tests;
    #[cfg(test)]
    pub(crate) mod operator_tests;
    #[cfg(test)]
    pub(crate) mod test_helpers;
}

pub use compiler::ast;
pub use compiler::codegen::{Compiler, CompilerOptions, Feature, Target};
pub use compiler::diagnostics::{CompileError, CompilerMessages, DiagnosticCode};
pub use compiler::program::Program;
pub use compiler::wir::module::WirModule;

/// Compile a resolved program into a WASM module.
///
/// Diagnostics are accumulated on the program's message bag; callers must
/// inspect it before using the returned module, which may be invalid if any
/// error-severity diagnostic was emitted.
pub fn compile(
    program: &mut Program,
    options: CompilerOptions,
) -> Result<WirModule, CompileError> {
    Compiler::new(program, options).compile()
}
