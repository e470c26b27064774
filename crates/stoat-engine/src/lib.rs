//! # Stoat Engine
//!
//! The public entry point for embedding the Stoat language: an [`Engine`]
//! wraps one VM, and [`Engine::interpret`] runs source text through the
//! compiler and the execution engine. Globals, interned strings, and heap
//! objects persist across calls, which is what makes a REPL work.

#![warn(clippy::all)]

use std::io::Write;

use thiserror::Error;

use stoat_vm_compiler::CompileErrors;
pub use stoat_vm_core::{Vm, VmConfig, VmError};

/// Why a run of [`Engine::interpret`] failed.
#[derive(Debug, Error)]
pub enum InterpretError {
    /// The source did not compile; diagnostics were printed to stderr.
    #[error(transparent)]
    Compile(#[from] CompileErrors),
    /// Execution aborted; the stack trace was printed to stderr.
    #[error(transparent)]
    Runtime(#[from] VmError),
}

impl InterpretError {
    /// Conventional process exit code for this failure (65 compile,
    /// 70 runtime).
    pub fn exit_code(&self) -> i32 {
        match self {
            InterpretError::Compile(_) => 65,
            InterpretError::Runtime(_) => 70,
        }
    }
}

/// One language engine: compiler front end plus a persistent VM.
pub struct Engine {
    vm: Vm,
}

impl Engine {
    /// Create an engine printing to stdout.
    pub fn new(config: VmConfig) -> Self {
        Self {
            vm: Vm::new(config),
        }
    }

    /// Create an engine with a caller-supplied `print` sink.
    pub fn with_output(config: VmConfig, out: Box<dyn Write>) -> Self {
        Self {
            vm: Vm::with_output(config, out),
        }
    }

    /// Compile and execute `source`.
    ///
    /// Compile errors return without executing anything; runtime errors
    /// leave the VM reset and reusable. State established by successful
    /// runs (globals, classes) persists into later calls.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let script = stoat_vm_compiler::compile(source, self.vm.heap_mut())?;
        self.vm.execute(script)?;
        Ok(())
    }

    /// The underlying VM (introspection, tests).
    pub fn vm(&self) -> &Vm {
        &self.vm
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(VmConfig::default())
    }
}
