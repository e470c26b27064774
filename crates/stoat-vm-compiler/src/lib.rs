//! # Stoat VM Compiler
//!
//! Source text in, bytecode out: a hand-written scanner feeding a
//! single-pass Pratt parser that emits instructions directly into chunks,
//! resolving lexical scope, closure captures, classes, and inheritance as
//! it goes. Compiled functions are allocated into the VM's heap; the
//! compiled top-level script is returned as a heap handle ready for
//! execution.

#![warn(clippy::all)]

pub mod compiler;
pub mod error;
pub mod scanner;
pub mod token;

pub use compiler::compile;
pub use error::{CompileErrors, Diagnostic};
