//! Object arena and string interning
//!
//! All heap objects live in one heterogeneous arena indexed by [`ObjRef`].
//! A slot holds the object, its mark bit, and the size charged against the
//! allocation accounting; swept slots go on a free list for reuse. The
//! arena's occupancy is the sweep backbone; reachability is never decided
//! by scanning it, only by tracing from roots.
//!
//! The interning table lives here too: it maps string content to the one
//! canonical `Str` object, holding its keys weakly (the GC deletes entries
//! whose strings died before sweeping them).

use stoat_vm_bytecode::{ObjRef, Value};

use crate::object::{
    BoundMethodObj, ClassObj, ClosureObj, FunctionObj, InstanceObj, Object, StrObj, UpvalueObj,
};
use crate::table::Table;

/// Heap growth factor applied to the collection threshold after each cycle.
pub const GC_HEAP_GROW_FACTOR: usize = 2;

/// FNV-1a, 32-bit. Every interned string stores its hash; the hash seeds
/// table probing for all keyed lookups.
pub fn hash_string(chars: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in chars.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[derive(Debug)]
struct Slot {
    marked: bool,
    size: usize,
    object: Object,
}

/// The object arena.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// Interning table: canonical `Str` handles keyed by content hash.
    /// Values are unused (`nil`); the GC treats the keys as weak.
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    stress: bool,
}

impl Heap {
    /// Create an empty heap. `threshold` is the allocation level that
    /// triggers the first collection; `stress` forces a collection at
    /// every allocation point instead.
    pub fn new(threshold: usize, stress: bool) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: threshold,
            stress,
        }
    }

    // ---- Allocation --------------------------------------------------------

    /// Allocate an object into the arena, reusing a swept slot when one is
    /// free. Does not trigger collection; callers at VM allocation points
    /// check [`Heap::should_collect`] first.
    pub fn alloc(&mut self, object: Object) -> ObjRef {
        let size = object.approximate_size();
        self.bytes_allocated += size;

        let slot = Slot {
            marked: false,
            size,
            object,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjRef::new(index)
            }
            None => {
                self.slots.push(Some(slot));
                ObjRef::new((self.slots.len() - 1) as u32)
            }
        }
    }

    /// True when accounting has crossed the collection threshold (or the
    /// heap is in stress mode and collects on every allocation point).
    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    /// Bytes currently charged against the heap.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects in the arena.
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    // ---- Interning ---------------------------------------------------------

    /// Intern borrowed string content.
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        let hash = hash_string(chars);
        if let Some(existing) = self.find_interned(chars, hash) {
            return existing;
        }
        let r = self.alloc(Object::Str(StrObj {
            chars: chars.into(),
            hash,
        }));
        self.strings.set(r, hash, Value::NIL);
        r
    }

    /// Intern an owned buffer (concatenation result). If an identical
    /// string is already interned the buffer is simply dropped and the
    /// canonical handle returned.
    pub fn intern_owned(&mut self, chars: String) -> ObjRef {
        let hash = hash_string(&chars);
        if let Some(existing) = self.find_interned(&chars, hash) {
            return existing;
        }
        let r = self.alloc(Object::Str(StrObj {
            chars: chars.into_boxed_str(),
            hash,
        }));
        self.strings.set(r, hash, Value::NIL);
        r
    }

    fn find_interned(&self, chars: &str, hash: u32) -> Option<ObjRef> {
        let slots = &self.slots;
        self.strings.find_string(chars, hash, move |r| {
            match &slots[r.index()] {
                Some(slot) => match &slot.object {
                    Object::Str(s) => &s.chars,
                    other => unreachable!("interning table key is a {}", other.kind_name()),
                },
                None => unreachable!("interning table key was swept"),
            }
        })
    }

    // ---- Typed accessors ---------------------------------------------------
    //
    // A live handle always points at an occupied slot of the right variant;
    // a mismatch is a VM bug, not a user error.

    /// The object behind a handle.
    pub fn object(&self, r: ObjRef) -> &Object {
        match &self.slots[r.index()] {
            Some(slot) => &slot.object,
            None => unreachable!("stale object handle #{}", r.0),
        }
    }

    /// Mutable access to the object behind a handle.
    pub fn object_mut(&mut self, r: ObjRef) -> &mut Object {
        match &mut self.slots[r.index()] {
            Some(slot) => &mut slot.object,
            None => unreachable!("stale object handle #{}", r.0),
        }
    }

    /// String content of a `Str` handle.
    pub fn str_slice(&self, r: ObjRef) -> &str {
        match self.object(r) {
            Object::Str(s) => &s.chars,
            other => unreachable!("expected string, found {}", other.kind_name()),
        }
    }

    /// Precomputed hash of a `Str` handle.
    pub fn str_hash(&self, r: ObjRef) -> u32 {
        match self.object(r) {
            Object::Str(s) => s.hash,
            other => unreachable!("expected string, found {}", other.kind_name()),
        }
    }

    /// A `Function` payload.
    pub fn function(&self, r: ObjRef) -> &FunctionObj {
        match self.object(r) {
            Object::Function(f) => f,
            other => unreachable!("expected function, found {}", other.kind_name()),
        }
    }

    /// A `Closure` payload.
    pub fn closure(&self, r: ObjRef) -> &ClosureObj {
        match self.object(r) {
            Object::Closure(c) => c,
            other => unreachable!("expected closure, found {}", other.kind_name()),
        }
    }

    /// Mutable `Closure` payload.
    pub fn closure_mut(&mut self, r: ObjRef) -> &mut ClosureObj {
        match self.object_mut(r) {
            Object::Closure(c) => c,
            other => unreachable!("expected closure, found {}", other.kind_name()),
        }
    }

    /// An `Upvalue` payload.
    pub fn upvalue(&self, r: ObjRef) -> &UpvalueObj {
        match self.object(r) {
            Object::Upvalue(u) => u,
            other => unreachable!("expected upvalue, found {}", other.kind_name()),
        }
    }

    /// Mutable `Upvalue` payload.
    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut UpvalueObj {
        match self.object_mut(r) {
            Object::Upvalue(u) => u,
            other => unreachable!("expected upvalue, found {}", other.kind_name()),
        }
    }

    /// A `Class` payload.
    pub fn class(&self, r: ObjRef) -> &ClassObj {
        match self.object(r) {
            Object::Class(c) => c,
            other => unreachable!("expected class, found {}", other.kind_name()),
        }
    }

    /// Mutable `Class` payload.
    pub fn class_mut(&mut self, r: ObjRef) -> &mut ClassObj {
        match self.object_mut(r) {
            Object::Class(c) => c,
            other => unreachable!("expected class, found {}", other.kind_name()),
        }
    }

    /// An `Instance` payload.
    pub fn instance(&self, r: ObjRef) -> &InstanceObj {
        match self.object(r) {
            Object::Instance(i) => i,
            other => unreachable!("expected instance, found {}", other.kind_name()),
        }
    }

    /// Mutable `Instance` payload.
    pub fn instance_mut(&mut self, r: ObjRef) -> &mut InstanceObj {
        match self.object_mut(r) {
            Object::Instance(i) => i,
            other => unreachable!("expected instance, found {}", other.kind_name()),
        }
    }

    /// A `BoundMethod` payload.
    pub fn bound_method(&self, r: ObjRef) -> &BoundMethodObj {
        match self.object(r) {
            Object::BoundMethod(b) => b,
            other => unreachable!("expected bound method, found {}", other.kind_name()),
        }
    }

    // ---- Formatting --------------------------------------------------------

    /// Render a value the way `print` and error messages show it.
    pub fn format_value(&self, value: Value) -> String {
        if value.is_number() {
            return format!("{}", value.as_number());
        }
        if value.is_nil() {
            return "nil".to_string();
        }
        if value.is_bool() {
            return if value.as_bool() { "true" } else { "false" }.to_string();
        }
        self.format_object(value.as_object())
    }

    fn format_function(&self, r: ObjRef) -> String {
        match self.function(r).name {
            Some(name) => format!("<fn {}>", self.str_slice(name)),
            None => "<script>".to_string(),
        }
    }

    fn format_object(&self, r: ObjRef) -> String {
        match self.object(r) {
            Object::Str(s) => s.chars.to_string(),
            Object::Function(_) => self.format_function(r),
            Object::Native(_) => "<native fn>".to_string(),
            Object::Closure(c) => self.format_function(c.function),
            Object::Upvalue(_) => "upvalue".to_string(),
            Object::Class(c) => self.str_slice(c.name).to_string(),
            Object::Instance(i) => {
                format!("{} instance", self.str_slice(self.class(i.class).name))
            }
            Object::BoundMethod(b) => self.format_function(self.closure(b.method).function),
        }
    }

    // ---- GC support --------------------------------------------------------

    pub(crate) fn is_marked(&self, r: ObjRef) -> bool {
        self.slots[r.index()].as_ref().is_some_and(|s| s.marked)
    }

    /// Mark an object; returns `false` if it was already marked (or the
    /// handle is stale), so the caller only grays it once.
    pub(crate) fn mark(&mut self, r: ObjRef) -> bool {
        match &mut self.slots[r.index()] {
            Some(slot) if !slot.marked => {
                slot.marked = true;
                true
            }
            _ => false,
        }
    }

    /// Drop intern-table entries whose key strings are unmarked. Must run
    /// after marking and before [`Heap::sweep`].
    pub(crate) fn remove_white_strings(&mut self) {
        let Heap { slots, strings, .. } = self;
        strings.remove_white(|r| slots[r.index()].as_ref().is_some_and(|s| s.marked));
    }

    /// Free every unmarked slot and clear survivors' marks. Returns
    /// `(objects_freed, bytes_reclaimed)`.
    pub(crate) fn sweep(&mut self) -> (usize, usize) {
        let mut freed = 0;
        let mut reclaimed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(s) if s.marked => s.marked = false,
                Some(s) => {
                    reclaimed += s.size;
                    freed += 1;
                    *slot = None;
                    self.free.push(index as u32);
                }
                None => {}
            }
        }
        self.bytes_allocated -= reclaimed;
        (freed, reclaimed)
    }

    /// Grow the collection threshold after a cycle.
    pub(crate) fn adjust_threshold(&mut self) {
        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedupes() {
        let mut heap = Heap::new(usize::MAX, false);
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.str_slice(a), "hello");
        assert_eq!(heap.object_count(), 2);
    }

    #[test]
    fn test_intern_owned_reuses_existing() {
        let mut heap = Heap::new(usize::MAX, false);
        let a = heap.intern("hi!");
        let b = heap.intern_owned(String::from("hi!"));
        assert_eq!(a, b);
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn test_alloc_reuses_swept_slots() {
        let mut heap = Heap::new(usize::MAX, false);
        let a = heap.intern("ephemeral");
        // Nothing marked: everything is garbage.
        heap.remove_white_strings();
        let (freed, _) = heap.sweep();
        assert_eq!(freed, 1);
        assert_eq!(heap.object_count(), 0);

        let b = heap.intern("replacement");
        assert_eq!(a.index(), b.index());
        assert_eq!(heap.str_slice(b), "replacement");
    }

    #[test]
    fn test_accounting_tracks_sweep() {
        let mut heap = Heap::new(usize::MAX, false);
        heap.intern("some content here");
        let before = heap.bytes_allocated();
        assert!(before > 0);
        heap.remove_white_strings();
        heap.sweep();
        assert_eq!(heap.bytes_allocated(), 0);
    }

    #[test]
    fn test_hash_string_is_fnv1a() {
        // Reference values for the 32-bit FNV-1a parameters.
        assert_eq!(hash_string(""), 2166136261);
        assert_eq!(hash_string("a"), 0xe40c292c);
    }

    #[test]
    fn test_stress_mode_always_requests_collection() {
        let heap = Heap::new(usize::MAX, true);
        assert!(heap.should_collect());
        let heap = Heap::new(usize::MAX, false);
        assert!(!heap.should_collect());
    }
}
