//! VM error types

use thiserror::Error;

/// Errors surfaced by bytecode execution.
///
/// By the time a `VmError` reaches the caller the VM has already written
/// the message and a stack trace to stderr and reset its stacks; the
/// variant carries the message so callers (and tests) can still inspect it.
#[derive(Debug, Error)]
pub enum VmError {
    /// A runtime error: operand type mismatch, undefined variable or
    /// property, bad arity, frame overflow, calling a non-callable.
    #[error("{0}")]
    Runtime(String),
}

impl VmError {
    /// Create a runtime error
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        match self {
            Self::Runtime(msg) => msg,
        }
    }
}
