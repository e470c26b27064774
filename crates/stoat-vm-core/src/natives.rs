//! Built-in native functions
//!
//! Natives receive a [`NativeCtx`] (heap access plus process-start time)
//! and the argument slice; they return a value or an error message that
//! the VM turns into a runtime error with a stack trace.

use std::time::Instant;

use stoat_vm_bytecode::Value;

use crate::heap::Heap;
use crate::object::Object;

/// Context handed to native functions.
pub struct NativeCtx<'a> {
    /// The VM's heap.
    pub heap: &'a mut Heap,
    /// When the hosting VM was created; basis for `clock()`.
    pub start_time: Instant,
}

/// Native entry point: `(ctx, args) -> value`.
pub type NativeFn = fn(&mut NativeCtx<'_>, &[Value]) -> Result<Value, String>;

/// `clock()`: seconds elapsed since the VM started, as a number.
pub fn clock(ctx: &mut NativeCtx<'_>, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::number(ctx.start_time.elapsed().as_secs_f64()))
}

/// `deleteField(instance, name)`: remove a field from an instance.
///
/// Always returns `nil`; anything other than an instance and a string
/// name is a silent no-op, as is deleting a field that does not exist.
pub fn delete_field(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    let [target, name] = args else {
        return Ok(Value::NIL);
    };
    if !target.is_object() || !name.is_object() {
        return Ok(Value::NIL);
    }
    let name = name.as_object();
    if !matches!(ctx.heap.object(name), Object::Str(_)) {
        return Ok(Value::NIL);
    }
    let hash = ctx.heap.str_hash(name);
    let target = target.as_object();
    if let Object::Instance(instance) = ctx.heap.object_mut(target) {
        instance.fields.delete(name, hash);
    }
    Ok(Value::NIL)
}
