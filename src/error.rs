//! Error types for the code-generation backend.
//!
//! Using thiserror for more idiomatic error handling.
//!
//! Only the outer façade reports recoverable errors. Invariant violations
//! inside the core (register exhaustion with no legal victim, popping the
//! wrong size, reading a dead value) terminate the compilation with a panic,
//! which is the library rendition of the host `abort`.

use thiserror::Error;

/// Main error type for backend compilation.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("compiler used before init()")]
    NotInitialized,

    #[error("compile() called twice on one compilation")]
    AlreadyCompiled,

    #[error("writeTo() called before compile()")]
    NotCompiled,

    #[error("output buffer too small: need {needed} bytes, got {got}")]
    BufferTooSmall { needed: usize, got: usize },

    #[error("promise is not resolved yet")]
    UnresolvedPromise,

    #[error("local slot {index} out of range (footprint {footprint})")]
    LocalOutOfRange { index: u32, footprint: u32 },
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
