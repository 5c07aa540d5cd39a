//! Error types for code generation.
//!
//! Using thiserror for more idiomatic error handling. There are exactly
//! three ways a function can fail to compile: the process runs out of
//! memory, the register allocator cannot find a spillable victim, or a
//! lowering path hits something it cannot represent and records a
//! structured diagnostic. The diagnostic itself lives in a single slot on
//! the generation context; the `CodegenFail` variant is only the marker
//! that the slot has been written.

use std::fmt;

use thiserror::Error;

/// A source location, tracked for diagnostics and debug-line records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrcLoc {
    pub line: u32,
    pub column: u32,
}

impl SrcLoc {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for SrcLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Structured diagnostic with source location.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{src_loc}: {msg}")]
pub struct ErrorMsg {
    pub src_loc: SrcLoc,
    pub msg: String,
}

impl ErrorMsg {
    pub fn new(src_loc: SrcLoc, msg: String) -> Self {
        Self { src_loc, msg }
    }
}

/// Errors that abort code generation for one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodegenError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("ran out of registers")]
    OutOfRegisters,

    /// A lowering failure was recorded; the message lives in the
    /// context's `err_msg` slot.
    #[error("code generation failed")]
    CodegenFail,
}

/// Result type alias for code generation operations.
pub type CodegenResult<T> = Result<T, CodegenError>;
