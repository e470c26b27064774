//! # Stoat VM Core
//!
//! The runtime half of the Stoat scripting language: heap objects and the
//! object arena, string interning, the tri-color mark-sweep garbage
//! collector, the open-addressed hash table used for globals, fields,
//! methods, and interning, and the bytecode execution engine itself.
//!
//! The compiler (in `stoat-vm-compiler`) allocates its products through the
//! same [`heap::Heap`] the VM executes against; the collector walks roots
//! owned by the [`vm::Vm`].

#![warn(clippy::all)]

pub mod debug;
pub mod error;
pub mod gc;
pub mod heap;
pub mod natives;
pub mod object;
pub mod table;
pub mod vm;

pub use error::VmError;
pub use heap::Heap;
pub use object::Object;
pub use table::Table;
pub use vm::{Vm, VmConfig};
