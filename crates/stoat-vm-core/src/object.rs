//! Heap object variants
//!
//! Every heap entity the VM can reference lives in one arena slot as an
//! [`Object`]. References between objects are [`ObjRef`] handles; nothing
//! owns anything else, and reachability alone keeps an object alive.

use stoat_vm_bytecode::{Chunk, ObjRef, Value};

use crate::natives::NativeFn;
use crate::table::Table;

/// An immutable interned string: byte content plus its precomputed
/// 32-bit FNV-1a hash.
#[derive(Debug)]
pub struct StrObj {
    /// String content.
    pub chars: Box<str>,
    /// FNV-1a hash of the content, computed once at intern time.
    pub hash: u32,
}

/// A compiled function: arity, capture count, its chunk, and an optional
/// name for diagnostics. The chunk is owned here and collected with the
/// function.
#[derive(Debug)]
pub struct FunctionObj {
    /// Declared parameter count.
    pub arity: u8,
    /// Number of upvalues a closure over this function captures.
    pub upvalue_count: u16,
    /// Compiled body.
    pub chunk: Chunk,
    /// Function name, `None` for the top-level script.
    pub name: Option<ObjRef>,
}

/// A built-in function implemented in Rust.
#[derive(Debug)]
pub struct NativeObj {
    /// Name the native was registered under.
    pub name: ObjRef,
    /// Implementation entry point.
    pub function: NativeFn,
}

/// A function value bundled with its captured upvalues.
#[derive(Debug)]
pub struct ClosureObj {
    /// Underlying [`FunctionObj`].
    pub function: ObjRef,
    /// Captured upvalues, one per capture in declaration order. Filled
    /// incrementally while the `Closure` instruction executes; the GC
    /// only traces entries already present.
    pub upvalues: Vec<ObjRef>,
}

/// Where an upvalue's variable currently lives.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Still on the VM value stack, at this slot index.
    Open(usize),
    /// Hoisted into the upvalue itself when its stack slot died.
    Closed(Value),
}

/// A captured variable reference.
#[derive(Debug)]
pub struct UpvalueObj {
    /// Open (stack slot) or closed (owned value).
    pub state: UpvalueState,
    /// Next node in the VM's open-upvalue list, ordered by slot
    /// descending. Meaningless once closed.
    pub next: Option<ObjRef>,
}

/// A class: name, method table, and the cached `init` method.
#[derive(Debug)]
pub struct ClassObj {
    /// Class name.
    pub name: ObjRef,
    /// Methods keyed by interned name.
    pub methods: Table,
    /// Cached initializer closure, or `nil` if the class has none.
    /// Kept in sync with `methods` by the `Method` instruction and
    /// copied down at `Inherit`.
    pub initializer: Value,
}

/// An instance of a class with its field table.
#[derive(Debug)]
pub struct InstanceObj {
    /// The instance's class.
    pub class: ObjRef,
    /// Fields keyed by interned name.
    pub fields: Table,
}

/// A method read off an instance: remembers the receiver.
#[derive(Debug)]
pub struct BoundMethodObj {
    /// The instance the method was bound to.
    pub receiver: Value,
    /// The method closure.
    pub method: ObjRef,
}

/// A heap object.
#[derive(Debug)]
pub enum Object {
    /// Interned string.
    Str(StrObj),
    /// Compiled function.
    Function(FunctionObj),
    /// Built-in function.
    Native(NativeObj),
    /// Function plus captures.
    Closure(ClosureObj),
    /// Captured variable cell.
    Upvalue(UpvalueObj),
    /// Class declaration.
    Class(ClassObj),
    /// Class instance.
    Instance(InstanceObj),
    /// Receiver-bound method.
    BoundMethod(BoundMethodObj),
}

impl Object {
    /// Human-readable variant name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Object::Str(_) => "string",
            Object::Function(_) => "function",
            Object::Native(_) => "native",
            Object::Closure(_) => "closure",
            Object::Upvalue(_) => "upvalue",
            Object::Class(_) => "class",
            Object::Instance(_) => "instance",
            Object::BoundMethod(_) => "bound method",
        }
    }

    /// Approximate retained size in bytes, used for GC accounting.
    ///
    /// Charged once at allocation and credited back at sweep, so the
    /// figure must be stable for a given object's lifetime: it reflects
    /// the allocation-time payload, not later growth of tables.
    pub fn approximate_size(&self) -> usize {
        let base = std::mem::size_of::<Object>();
        base + match self {
            Object::Str(s) => s.chars.len(),
            Object::Function(f) => {
                f.chunk.code.len() + f.chunk.constants.len() * std::mem::size_of::<Value>()
            }
            Object::Native(_) => 0,
            Object::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<ObjRef>(),
            Object::Upvalue(_) => 0,
            Object::Class(_) => 0,
            Object::Instance(_) => 0,
            Object::BoundMethod(_) => 0,
        }
    }
}
