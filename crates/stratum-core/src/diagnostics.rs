//! Error types for every stage of the pipeline.
//!
//! Lexical, syntactic, type, and linker errors are fatal and carry a source
//! line/column (spec.md §7). Runtime errors split into recoverable (caught by
//! `try`/`catch`) and fatal (terminate the VM) — see [`RunError`].

use std::fmt;

/// A 1-based source position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub pos: Pos,
    pub message: String,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: lex error: {}", self.pos, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub pos: Pos,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: parse error: {}", self.pos, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeError {
    pub pos: Pos,
    pub message: String,
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: type error: {}", self.pos, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkError {
    pub message: String,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link error: {}", self.message)
    }
}

/// A runtime fault. `Recoverable` variants are converted into the value seen
/// by an enclosing `try`/`catch`; `Fatal` variants always terminate `vm_run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    /// `throw` / divide-by-zero / index-out-of-bounds / key-not-found / bad field index.
    Recoverable(String),
    /// Stack overflow, call-stack overflow, too many nested try-blocks, unknown
    /// opcode, or an exception that escaped every handler.
    Fatal(String),
    /// `exit(code)` was called; unwinds straight out of `Vm::run` with no
    /// handler able to intercept it (spec.md §6).
    Exit(i64),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Recoverable(msg) | RunError::Fatal(msg) => write!(f, "{msg}"),
            RunError::Exit(code) => write!(f, "exit({code})"),
        }
    }
}

impl RunError {
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, RunError::Fatal(_) | RunError::Exit(_))
    }
}

/// Umbrella error returned by the driver-facing entry points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StratumError {
    Lex(LexError),
    Parse(ParseError),
    Type(TypeError),
    Link(LinkError),
    Run(RunError),
}

impl fmt::Display for StratumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StratumError::Lex(e) => write!(f, "{e}"),
            StratumError::Parse(e) => write!(f, "{e}"),
            StratumError::Type(e) => write!(f, "{e}"),
            StratumError::Link(e) => write!(f, "{e}"),
            StratumError::Run(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for StratumError {}

impl From<LexError> for StratumError {
    fn from(e: LexError) -> Self {
        StratumError::Lex(e)
    }
}

impl From<ParseError> for StratumError {
    fn from(e: ParseError) -> Self {
        StratumError::Parse(e)
    }
}

impl From<TypeError> for StratumError {
    fn from(e: TypeError) -> Self {
        StratumError::Type(e)
    }
}

impl From<LinkError> for StratumError {
    fn from(e: LinkError) -> Self {
        StratumError::Link(e)
    }
}

impl From<RunError> for StratumError {
    fn from(e: RunError) -> Self {
        StratumError::Run(e)
    }
}
