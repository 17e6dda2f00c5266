//! Error types for the whole toolchain.
//!
//! Three stages, three types: [`CompileError`] from the front end and code
//! generator, [`LoadError`] from the assembly loader (always with a line
//! number), and [`Fault`] from the running machine. Faults double as the
//! machine-level exception representation: the CPU step loop constructs them
//! and the host reports them with a stable kind code for programmatic
//! consumers.

use std::fmt;
use thiserror::Error;

/// Unrecoverable per-instruction errors. Any of these halts the VM.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// DIV with a zero divisor.
    DivByZero,
    /// A register-only slot resolved to something that is not a register.
    InvalidOperand,
    /// GPU coordinate, sprite id, text id or character code out of range.
    OutOfRange,
    /// Program counter outside the loaded instruction stream.
    BadPc,
}

impl FaultKind {
    /// Stable machine-readable code, independent of the Display text.
    pub fn code(&self) -> &'static str {
        match self {
            FaultKind::DivByZero => "DIV_BY_ZERO",
            FaultKind::InvalidOperand => "INVALID_OPERAND",
            FaultKind::OutOfRange => "OUT_OF_RANGE",
            FaultKind::BadPc => "BAD_PC",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::DivByZero => write!(f, "division by zero"),
            FaultKind::InvalidOperand => write!(f, "invalid operand"),
            FaultKind::OutOfRange => write!(f, "operand out of range"),
            FaultKind::BadPc => write!(f, "program counter out of range"),
        }
    }
}

/// A fault frozen at the instruction that raised it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fault [{code}] at pc {pc}: {kind} in `{instruction}`", code = .kind.code())]
pub struct Fault {
    /// Program counter of the faulting instruction.
    pub pc: u16,
    /// Assembly text of the faulting instruction.
    pub instruction: String,
    pub kind: FaultKind,
}

/// Errors raised while turning assembly text into an instruction stream.
/// Every variant names the 1-based source line it came from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("line {line}: unknown opcode `{mnemonic}`")]
    UnknownOpcode { line: u32, mnemonic: String },
    #[error("line {line}: `{mnemonic}` expects {expected} operands, found {found}")]
    WrongOperandCount {
        line: u32,
        mnemonic: String,
        expected: usize,
        found: usize,
    },
    #[error("line {line}: undefined label `{name}`")]
    UndefinedLabel { line: u32, name: String },
    #[error("line {line}: label `{name}` defined twice")]
    DuplicateLabel { line: u32, name: String },
    #[error("line {line}: register index {index} out of range (0..32)")]
    BadRegister { line: u32, index: u32 },
    #[error("line {line}: immediate 0x{value:x} does not fit a 16-bit field")]
    ImmediateTooLarge { line: u32, value: u32 },
    #[error("line {line}: operand `{operand}` is register-only here")]
    RegisterOnly { line: u32, operand: String },
    #[error("line {line}: cannot parse operand `{operand}`")]
    BadOperand { line: u32, operand: String },
    #[error("line {line}: LOAD cannot address the GPU selector; write it with `MVR …, GPU`")]
    LoadToGpu { line: u32 },
}

impl LoadError {
    pub fn line(&self) -> u32 {
        match self {
            LoadError::UnknownOpcode { line, .. }
            | LoadError::WrongOperandCount { line, .. }
            | LoadError::UndefinedLabel { line, .. }
            | LoadError::DuplicateLabel { line, .. }
            | LoadError::BadRegister { line, .. }
            | LoadError::ImmediateTooLarge { line, .. }
            | LoadError::RegisterOnly { line, .. }
            | LoadError::BadOperand { line, .. }
            | LoadError::LoadToGpu { line } => *line,
        }
    }
}

/// Errors raised while compiling MCL source down to assembly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("line {line}:{column}: {message}")]
    Parse {
        line: u32,
        column: u32,
        message: String,
    },
    #[error("unknown name `{0}`")]
    UnknownName(String),
    #[error("`{0}` is not a function")]
    NotAFunction(String),
    #[error("`{name}` takes {expected} arguments, {found} given")]
    BadArity {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("`{0}` redeclared in the same scope")]
    Redeclared(String),
    #[error("{0}")]
    BadTypes(String),
    #[error("cannot assign to `{0}`")]
    NotAssignable(String),
    #[error("{context} must be a constant expression")]
    NotConstant { context: &'static str },
    #[error("`break` outside of a loop or switch")]
    StrayBreak,
    #[error("`continue` outside of a loop")]
    StrayContinue,
    #[error("function `{0}` takes too many parameters (27 registers available)")]
    TooManyParams(String),
    #[error("expression needs more registers than the file provides")]
    OutOfRegisters,
    #[error("no `main` function")]
    NoMain,
}
