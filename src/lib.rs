//! Fernlisp - reader and compiler core for a small embeddable Lisp
//!
//! This crate implements the front half of the Fern language: a streaming
//! reader that turns bytes into structured values, and a compiler that turns
//! those values - after macro expansion - into bytecode for a register-based
//! virtual machine. The interpreter, garbage collector and standard library
//! live elsewhere; this crate only produces the artifacts they consume.
//!
//! ## Reading
//!
//! The reader is a byte-at-a-time state machine. It can be fed input in
//! arbitrarily sized chunks (even one byte at a time from a socket or a
//! terminal) and maintains a queue of fully parsed top-level values:
//!
//! ```
//! use fernlisp::intern::SymbolTable;
//! use fernlisp::parser::{Parser, ParserStatus};
//!
//! let symbols = SymbolTable::shared();
//! let mut p = Parser::new(symbols);
//! p.consume_bytes(b"(+ 1 2) ");
//! assert_eq!(p.status(), ParserStatus::Root);
//! let form = p.produce().unwrap();
//! assert_eq!(format!("{form}"), "(+ 1 2)");
//! ```
//!
//! ## Compiling
//!
//! [`compile::compile`] takes one source value plus an [`env::Environment`]
//! mapping symbols to binding descriptors (immutable `def`s, mutable `var`
//! cells, or macros) and produces an immutable [`bytecode::FuncDef`]: the
//! bytecode, constant pool, nested function definitions, upvalue table and
//! source mappings the virtual machine executes. Macros are ordinary
//! callables invoked through the [`env::CallVm`] interface during
//! compilation, so the compiler never depends on a concrete interpreter.
//!
//! ## Modules
//!
//! - `value`: the tagged value model shared by reader, compiler and runtime
//! - `intern`: hash-consed identifiers (symbol equality is pointer equality)
//! - `number`: number-literal scanning
//! - `parser`: the streaming reader
//! - `env`: environments, binding descriptors and the VM call interface
//! - `bytecode`: the instruction set and function-definition artifact
//! - `compile`: macro expansion, scope analysis and bytecode emission

use std::fmt;

/// Maximum recursion depth while compiling nested forms. Guards against
/// stack overflow from deeply nested (usually machine-generated) source.
pub const MAX_RECURSION_DEPTH: i32 = 1024;

/// Maximum number of times a single form may be macro-expanded before the
/// compiler reports "recursed too deeply in macro expansion".
pub const MAX_MACRO_EXPANSIONS: i32 = 200;

/// Maximum number of constants in one function's constant pool. The
/// load-constant instruction carries a 16-bit index.
pub const MAX_CONSTANTS: usize = 0xFFFF;

/// Errors produced by native functions registered in an environment.
///
/// Native functions run during macro expansion, so these errors surface
/// through the compiler as macro errors with their message preserved.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A value had the wrong kind for an operation
    TypeError(String),
    /// A general evaluation failure
    EvalError(String),
    /// Wrong number of arguments to a native function
    ArityError { expected: String, got: usize },
}

impl Error {
    /// Create an ArityError for an exact expected count
    pub fn arity_error(expected: usize, got: usize) -> Self {
        Error::ArityError {
            expected: expected.to_string(),
            got,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::TypeError(msg) => write!(f, "type error: {msg}"),
            Error::EvalError(msg) => write!(f, "{msg}"),
            Error::ArityError { expected, got } => {
                write!(f, "expected {expected} arguments, got {got}")
            }
        }
    }
}

impl std::error::Error for Error {}

pub mod bytecode;
pub mod compile;
pub mod env;
pub mod intern;
pub mod number;
pub mod parser;
pub mod value;

pub use compile::{CompileError, compile, compile_with};
pub use env::{Binding, Environment, core_env};
pub use intern::{Symbol, SymbolTable};
pub use parser::{Parser, ParserStatus};
pub use value::Value;
