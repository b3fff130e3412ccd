//! jitgen - retargetable code-generation backend for a JIT compiler.
//!
//! A front-end lowers its bytecode or AST into a linear stream of
//! three-address-style requests against [`Compiler`]. The backend keeps an
//! abstract machine state across straight-line code and branches (operand
//! stack, locals, symbolic values with their residency), selects operations
//! as events, and drives a pluggable [`Assembler`] in two passes: the scan
//! pass records events and future reads, the compile pass allocates
//! registers on the fly and emits machine operations, resolving forward
//! references through [`Promise`]s.
//!
//! # Primary usage
//!
//! ```ignore
//! use bumpalo::Bump;
//! use jitgen::{Compiler, RecordingAssembler};
//!
//! let arena = Bump::new();
//! let mut c = Compiler::new(&arena, Box::new(RecordingAssembler::new(8)));
//! c.init(1, 0);
//! c.start_logical_ip(0);
//! let k = c.constant(42);
//! c.return_(4, k);
//! let length = c.compile()?;
//! let mut code = vec![0u8; length + c.pool_size()];
//! c.write_to(&mut code)?;
//! ```
//!
//! # Architecture
//!
//! - [`compiler`] - the public façade and the compile pass
//! - [`assembler`] - the contract a target assembler implements
//! - [`promise`] - deferred integers for forward references
//! - [`recording`] - a text-emitting assembler for tests
//!
//! Internal layers: site and register-file tracking (residency and
//! allocation), reads (future-use constraints), events (selected
//! operations), and the lazily materialized operand stack.

pub mod assembler;
pub mod compiler;
mod context;
pub mod error;
pub mod event;
pub mod promise;
pub mod recording;
mod regfile;
mod site;
mod stack;
mod value;

pub use assembler::{
    Assembler, AssemblerClient, AsmOperand, BinaryOp, NullaryOp, OperandConstraint, OperandKind,
    Plan, UnaryOp, UnaryPlan,
};
pub use compiler::Compiler;
pub use context::Operand;
pub use error::{CompileError, CompileResult};
pub use event::{TraceHandler, CALL_ALIGNED, CALL_INDIRECT, CALL_NO_RETURN};
pub use promise::Promise;
pub use recording::RecordingAssembler;
