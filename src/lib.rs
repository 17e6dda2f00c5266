//! MCL: a small C-like language targeting a 16-bit virtual machine with a
//! 32×32 bit-plane GPU, plus the machine itself.
//!
//! The two halves share one contract, the assembly ISA:
//! - build time: source → [`parser`] → AST → [`codegen`] → assembly text;
//! - run time: assembly text → [`loader`] → instruction stream →
//!   [`host`]-driven per-tick [`processor`] steps → RAM/GPU side effects.

pub mod ast;
pub mod codegen;
pub mod error;
pub mod fields;
pub mod gpu;
pub mod host;
pub mod instructions;
pub mod loader;
pub mod memory;
pub mod parser;
pub mod processor;
pub mod symbols;

pub use codegen::compile;
pub use error::{CompileError, Fault, FaultKind, LoadError};
pub use host::{Configuration, Host, QueuedKeys, StdinKeys};
pub use loader::{load, Program};
pub use parser::parse;
pub use processor::{KeySource, Outcome, CPU};

/// MCL source text straight to assembly text.
pub fn compile_source(source: &str) -> Result<String, CompileError> {
    let program = parser::parse(source)?;
    codegen::compile(&program)
}
