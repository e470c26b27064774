//! Tri-color mark-sweep garbage collector
//!
//! Collection is a stop-the-world cycle over the object arena:
//!
//! 1. **Mark roots**: every root handle is marked and pushed on the gray
//!    worklist.
//! 2. **Trace**: gray objects are popped and blackened by marking their
//!    children until the worklist drains.
//! 3. **Weak sweep**: interning-table entries whose key strings stayed
//!    white are deleted, breaking the last reference.
//! 4. **Sweep**: unmarked arena slots are freed; survivors' marks clear.
//! 5. **Threshold**: the next collection point grows from live bytes.
//!
//! The collector only runs at allocation points, so the mutator may assume
//! no object moves or dies between two consecutive non-allocating
//! operations.

use std::time::Instant;

use stoat_vm_bytecode::{ObjRef, Value};

use crate::heap::Heap;
use crate::object::{Object, UpvalueState};
use crate::table::Table;

/// The root set handed to [`collect`] by the VM.
pub struct Roots<'a> {
    /// Live value-stack slots.
    pub stack: &'a [Value],
    /// Closure of every active call frame.
    pub frame_closures: &'a [ObjRef],
    /// Head of the open-upvalue list; each node is a root.
    pub open_upvalues: Option<ObjRef>,
    /// The globals table.
    pub globals: &'a Table,
    /// The cached `"init"` string.
    pub init_string: Option<ObjRef>,
}

/// Run a full collection cycle. Returns the number of bytes reclaimed.
pub fn collect(heap: &mut Heap, roots: &Roots) -> usize {
    let started = Instant::now();
    tracing::debug!(
        target: "stoat::gc",
        heap_bytes = heap.bytes_allocated(),
        objects = heap.object_count(),
        "GC cycle starting"
    );

    let mut gray: Vec<ObjRef> = Vec::new();
    mark_roots(heap, roots, &mut gray);
    trace_references(heap, &mut gray);
    heap.remove_white_strings();
    let (freed, reclaimed) = heap.sweep();
    heap.adjust_threshold();

    tracing::debug!(
        target: "stoat::gc",
        reclaimed_bytes = reclaimed,
        freed_objects = freed,
        live_bytes = heap.bytes_allocated(),
        live_objects = heap.object_count(),
        pause_us = started.elapsed().as_micros() as u64,
        "GC cycle complete"
    );

    reclaimed
}

fn mark_roots(heap: &mut Heap, roots: &Roots, gray: &mut Vec<ObjRef>) {
    for &value in roots.stack {
        mark_value(heap, value, gray);
    }
    for &closure in roots.frame_closures {
        mark_object(heap, closure, gray);
    }
    let mut open = roots.open_upvalues;
    while let Some(upvalue) = open {
        mark_object(heap, upvalue, gray);
        open = heap.upvalue(upvalue).next;
    }
    mark_table(heap, roots.globals, gray);
    if let Some(init) = roots.init_string {
        mark_object(heap, init, gray);
    }
}

fn trace_references(heap: &mut Heap, gray: &mut Vec<ObjRef>) {
    // Children are gathered with a short immutable borrow, then marked.
    let mut children: Vec<ObjRef> = Vec::new();
    while let Some(object) = gray.pop() {
        children.clear();
        gather_children(heap.object(object), &mut children);
        for &child in &children {
            mark_object(heap, child, gray);
        }
    }
}

fn mark_value(heap: &mut Heap, value: Value, gray: &mut Vec<ObjRef>) {
    if value.is_object() {
        mark_object(heap, value.as_object(), gray);
    }
}

fn mark_object(heap: &mut Heap, r: ObjRef, gray: &mut Vec<ObjRef>) {
    if heap.mark(r) {
        gray.push(r);
    }
}

fn mark_table(heap: &mut Heap, table: &Table, gray: &mut Vec<ObjRef>) {
    for (key, value) in table.iter() {
        mark_object(heap, key, gray);
        mark_value(heap, value, gray);
    }
}

/// Blackening rules: which handles an object keeps alive.
fn gather_children(object: &Object, out: &mut Vec<ObjRef>) {
    let push_value = |value: Value, out: &mut Vec<ObjRef>| {
        if value.is_object() {
            out.push(value.as_object());
        }
    };

    match object {
        Object::Str(_) => {}
        Object::Native(native) => out.push(native.name),
        Object::Function(function) => {
            if let Some(name) = function.name {
                out.push(name);
            }
            for &constant in &function.chunk.constants {
                push_value(constant, out);
            }
        }
        Object::Closure(closure) => {
            out.push(closure.function);
            out.extend_from_slice(&closure.upvalues);
        }
        Object::Upvalue(upvalue) => {
            if let UpvalueState::Closed(value) = upvalue.state {
                push_value(value, out);
            }
        }
        Object::Class(class) => {
            out.push(class.name);
            for (key, value) in class.methods.iter() {
                out.push(key);
                push_value(value, out);
            }
            push_value(class.initializer, out);
        }
        Object::Instance(instance) => {
            out.push(instance.class);
            for (key, value) in instance.fields.iter() {
                out.push(key);
                push_value(value, out);
            }
        }
        Object::BoundMethod(bound) => {
            push_value(bound.receiver, out);
            out.push(bound.method);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ClassObj, ClosureObj, FunctionObj, InstanceObj, UpvalueObj};
    use stoat_vm_bytecode::Chunk;

    fn empty_roots<'a>(globals: &'a Table) -> Roots<'a> {
        Roots {
            stack: &[],
            frame_closures: &[],
            open_upvalues: None,
            globals,
            init_string: None,
        }
    }

    #[test]
    fn test_unreachable_objects_are_freed() {
        let mut heap = Heap::new(usize::MAX, false);
        heap.intern("doomed");
        let globals = Table::new();

        let reclaimed = collect(&mut heap, &empty_roots(&globals));

        assert!(reclaimed > 0);
        assert_eq!(heap.object_count(), 0);
    }

    #[test]
    fn test_stack_roots_survive() {
        let mut heap = Heap::new(usize::MAX, false);
        let keep = heap.intern("keep");
        heap.intern("drop");
        let globals = Table::new();

        let stack = [Value::object(keep)];
        collect(
            &mut heap,
            &Roots {
                stack: &stack,
                ..empty_roots(&globals)
            },
        );

        assert_eq!(heap.object_count(), 1);
        assert_eq!(heap.str_slice(keep), "keep");
    }

    #[test]
    fn test_globals_and_transitive_references_survive() {
        let mut heap = Heap::new(usize::MAX, false);
        let name = heap.intern("f");
        let function = heap.alloc(Object::Function(FunctionObj {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name: Some(name),
        }));
        let closure = heap.alloc(Object::Closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        }));

        let mut globals = Table::new();
        let hash = heap.str_hash(name);
        globals.set(name, hash, Value::object(closure));

        collect(&mut heap, &empty_roots(&globals));

        // closure -> function -> name all survive through the global.
        assert_eq!(heap.object_count(), 3);
    }

    #[test]
    fn test_cycles_are_collected() {
        let mut heap = Heap::new(usize::MAX, false);
        let class_name = heap.intern("Node");
        let other = heap.intern("other");
        let class = heap.alloc(Object::Class(ClassObj {
            name: class_name,
            methods: Table::new(),
            initializer: Value::NIL,
        }));
        let a = heap.alloc(Object::Instance(InstanceObj {
            class,
            fields: Table::new(),
        }));
        let b = heap.alloc(Object::Instance(InstanceObj {
            class,
            fields: Table::new(),
        }));

        // a.other = b; b.other = a
        let hash = heap.str_hash(other);
        match heap.object_mut(a) {
            Object::Instance(i) => i.fields.set(other, hash, Value::object(b)),
            _ => unreachable!(),
        };
        match heap.object_mut(b) {
            Object::Instance(i) => i.fields.set(other, hash, Value::object(a)),
            _ => unreachable!(),
        };

        let globals = Table::new();
        collect(&mut heap, &empty_roots(&globals));
        assert_eq!(heap.object_count(), 0);
    }

    #[test]
    fn test_interned_strings_are_weak() {
        let mut heap = Heap::new(usize::MAX, false);
        heap.intern("transient");
        let globals = Table::new();
        collect(&mut heap, &empty_roots(&globals));

        // The table entry is gone; re-interning builds a fresh object
        // instead of resurrecting a stale handle.
        let fresh = heap.intern("transient");
        assert_eq!(heap.str_slice(fresh), "transient");
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn test_collection_is_idempotent() {
        let mut heap = Heap::new(usize::MAX, false);
        let keep = heap.intern("keep");
        heap.intern("garbage one");
        heap.intern("garbage two");
        let globals = Table::new();
        let stack = [Value::object(keep)];
        let roots = Roots {
            stack: &stack,
            ..empty_roots(&globals)
        };

        let first = collect(&mut heap, &roots);
        assert!(first > 0);
        let second = collect(&mut heap, &roots);
        assert_eq!(second, 0);
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn test_closed_upvalue_keeps_its_value() {
        let mut heap = Heap::new(usize::MAX, false);
        let captured = heap.intern("captured");
        let upvalue = heap.alloc(Object::Upvalue(UpvalueObj {
            state: UpvalueState::Closed(Value::object(captured)),
            next: None,
        }));
        let globals = Table::new();
        let stack = [Value::object(upvalue)];
        collect(
            &mut heap,
            &Roots {
                stack: &stack,
                ..empty_roots(&globals)
            },
        );
        assert_eq!(heap.object_count(), 2);
        assert_eq!(heap.str_slice(captured), "captured");
    }
}
