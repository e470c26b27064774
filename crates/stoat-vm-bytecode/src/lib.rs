//! # Stoat VM Bytecode
//!
//! This crate defines the bytecode format for the Stoat scripting language.
//!
//! ## Design Principles
//!
//! - **Stack-based**: Instructions operate on an implicit value stack
//! - **Compact**: Single-byte opcodes with variable-length operand bytes
//! - **Self-locating**: Each chunk carries a run-length-encoded line table
//!   so any instruction offset can be mapped back to a source line

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod chunk;
pub mod opcode;
pub mod value;

pub use chunk::{Chunk, LineStart};
pub use opcode::OpCode;
pub use value::{ObjRef, Value};

/// Call frames the VM may nest before reporting a stack overflow.
pub const FRAMES_MAX: usize = 64;

/// Value-stack slots reserved up front (one window of 256 per frame).
pub const STACK_MAX: usize = FRAMES_MAX * 256;
