//! Bytecode execution engine
//!
//! The [`Vm`] owns the heap, the value stack, and the call-frame stack. It
//! executes chunks through a fetch-decode-dispatch loop, triggers garbage
//! collection at its allocation points, and turns runtime failures into
//! stderr stack traces plus a [`VmError`].
//!
//! ## Allocation discipline
//!
//! Collection may run inside [`Vm::alloc`] and [`Vm::intern_owned`], so any
//! value feeding a new object must still be reachable (in practice, left
//! on the value stack) until the result has been pushed. Concatenation,
//! closure construction, instance creation, and method binding below all
//! follow the pattern: peek inputs, allocate, then pop and push the result.

use std::io::{self, Write};
use std::time::Instant;

use stoat_vm_bytecode::{FRAMES_MAX, ObjRef, OpCode, STACK_MAX, Value};

use crate::debug;
use crate::error::VmError;
use crate::gc::{self, Roots};
use crate::heap::Heap;
use crate::natives::{self, NativeCtx, NativeFn};
use crate::object::{
    BoundMethodObj, ClassObj, ClosureObj, InstanceObj, NativeObj, Object, UpvalueObj, UpvalueState,
};
use crate::table::Table;

/// Tunables carried from the driver into the VM.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Force a collection at every VM allocation point.
    pub gc_stress: bool,
    /// Allocation level that triggers the first collection.
    pub gc_threshold: usize,
    /// Disassemble each instruction to stderr as it executes.
    pub trace_execution: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            gc_stress: false,
            gc_threshold: 1024 * 1024,
            trace_execution: false,
        }
    }
}

/// One active function invocation.
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    /// The closure being executed.
    closure: ObjRef,
    /// Offset of the next instruction byte in the closure's chunk.
    ip: usize,
    /// Stack index of slot 0: the callee (or receiver) itself.
    base: usize,
}

/// The virtual machine.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Head of the open-upvalue list, ordered by stack slot descending.
    open_upvalues: Option<ObjRef>,
    globals: Table,
    /// Canonical `"init"`, interned once.
    init_string: ObjRef,
    start_time: Instant,
    trace_execution: bool,
    out: Box<dyn Write>,
}

impl Vm {
    /// Create a VM printing to stdout.
    pub fn new(config: VmConfig) -> Self {
        Self::with_output(config, Box::new(io::stdout()))
    }

    /// Create a VM with a caller-supplied `print` sink.
    pub fn with_output(config: VmConfig, out: Box<dyn Write>) -> Self {
        let mut heap = Heap::new(config.gc_threshold, config.gc_stress);
        let init_string = heap.intern("init");
        let mut vm = Self {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: None,
            globals: Table::new(),
            init_string,
            start_time: Instant::now(),
            trace_execution: config.trace_execution,
            out,
        };
        vm.define_native("clock", natives::clock);
        vm.define_native("deleteField", natives::delete_field);
        vm
    }

    /// The heap, for the compiler to allocate through.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Read-only heap access.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// True between runs: empty value stack, no frames, no open upvalues.
    pub fn is_settled(&self) -> bool {
        self.stack.is_empty() && self.frames.is_empty() && self.open_upvalues.is_none()
    }

    /// Execute a compiled top-level function.
    pub fn execute(&mut self, function: ObjRef) -> Result<(), VmError> {
        self.push(Value::object(function));
        let closure = self.alloc(Object::Closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::object(closure));
        self.call(closure, 0)?;
        self.run()
    }

    // ---- Stack ------------------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    // ---- Decoding ---------------------------------------------------------

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let (closure, ip) = (frame.closure, frame.ip);
        frame.ip += 1;
        let function = self.heap.closure(closure).function;
        self.heap.function(function).chunk.code[ip]
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn constant_at(&self, index: usize) -> Value {
        let frame = self.frame();
        let function = self.heap.closure(frame.closure).function;
        self.heap.function(function).chunk.constants[index]
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.constant_at(index)
    }

    fn read_constant_long(&mut self) -> Value {
        let hi = self.read_byte() as usize;
        let mid = self.read_byte() as usize;
        let lo = self.read_byte() as usize;
        self.constant_at((hi << 16) | (mid << 8) | lo)
    }

    /// Read a one-byte constant operand naming an interned string.
    fn read_string(&mut self) -> ObjRef {
        self.read_constant().as_object()
    }

    // ---- Errors -----------------------------------------------------------

    /// Report a runtime error: message and stack trace to stderr, stacks
    /// reset, error value returned for the caller to propagate.
    fn runtime_error(&mut self, message: impl Into<String>) -> VmError {
        let message = message.into();
        eprintln!("{message}");
        for frame in self.frames.iter().rev() {
            let function = self.heap.closure(frame.closure).function;
            let function = self.heap.function(function);
            let line = function.chunk.get_line(frame.ip.saturating_sub(1));
            match function.name {
                Some(name) => eprintln!("[line {line}] in {}()", self.heap.str_slice(name)),
                None => eprintln!("[line {line}] in script"),
            }
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        VmError::runtime(message)
    }

    // ---- Allocation & GC --------------------------------------------------

    /// Allocate through the collector's trigger point.
    fn alloc(&mut self, object: Object) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(object)
    }

    /// Intern a concatenation result through the collector's trigger point.
    fn intern_owned(&mut self, chars: String) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern_owned(chars)
    }

    fn collect_garbage(&mut self) {
        let frame_closures: Vec<ObjRef> = self.frames.iter().map(|f| f.closure).collect();
        let roots = Roots {
            stack: &self.stack,
            frame_closures: &frame_closures,
            open_upvalues: self.open_upvalues,
            globals: &self.globals,
            init_string: Some(self.init_string),
        };
        gc::collect(&mut self.heap, &roots);
    }

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.heap.intern(name);
        // Root name and native across the table insert.
        self.push(Value::object(name));
        let native = self.heap.alloc(Object::Native(NativeObj { name, function }));
        self.push(Value::object(native));
        let hash = self.heap.str_hash(name);
        self.globals.set(name, hash, Value::object(native));
        self.pop();
        self.pop();
    }

    // ---- Calls ------------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), VmError> {
        if callee.is_object() {
            let r = callee.as_object();
            enum Dispatch {
                Closure(ObjRef),
                Bound { receiver: Value, method: ObjRef },
                Class(ObjRef),
                Native(NativeFn),
                NotCallable,
            }
            let dispatch = match self.heap.object(r) {
                Object::Closure(_) => Dispatch::Closure(r),
                Object::BoundMethod(bound) => Dispatch::Bound {
                    receiver: bound.receiver,
                    method: bound.method,
                },
                Object::Class(_) => Dispatch::Class(r),
                Object::Native(native) => Dispatch::Native(native.function),
                _ => Dispatch::NotCallable,
            };
            match dispatch {
                Dispatch::Closure(closure) => return self.call(closure, argc),
                Dispatch::Bound { receiver, method } => {
                    let slot = self.stack.len() - argc as usize - 1;
                    self.stack[slot] = receiver;
                    return self.call(method, argc);
                }
                Dispatch::Class(class) => return self.call_class(class, argc),
                Dispatch::Native(function) => return self.call_native(function, argc),
                Dispatch::NotCallable => {}
            }
        }
        Err(self.runtime_error("Can only call functions and classes."))
    }

    /// Push a frame for a closure after arity and depth checks.
    fn call(&mut self, closure: ObjRef, argc: u8) -> Result<(), VmError> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if argc != arity {
            return Err(self.runtime_error(format!(
                "Expected {arity} arguments but got {argc}."
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: self.stack.len() - argc as usize - 1,
        });
        Ok(())
    }

    /// Calling a class creates an instance and runs its initializer.
    fn call_class(&mut self, class: ObjRef, argc: u8) -> Result<(), VmError> {
        let initializer = self.heap.class(class).initializer;
        // The class value in the callee slot roots `class` across this
        // allocation; the instance then replaces it.
        let instance = self.alloc(Object::Instance(InstanceObj {
            class,
            fields: Table::new(),
        }));
        let slot = self.stack.len() - argc as usize - 1;
        self.stack[slot] = Value::object(instance);

        if initializer.is_object() {
            self.call(initializer.as_object(), argc)
        } else if argc != 0 {
            Err(self.runtime_error(format!("Expected 0 arguments but got {argc}.")))
        } else {
            Ok(())
        }
    }

    fn call_native(&mut self, function: NativeFn, argc: u8) -> Result<(), VmError> {
        let first = self.stack.len() - argc as usize;
        let args: Vec<Value> = self.stack[first..].to_vec();
        let mut ctx = NativeCtx {
            heap: &mut self.heap,
            start_time: self.start_time,
        };
        match function(&mut ctx, &args) {
            Ok(result) => {
                self.stack.truncate(first - 1);
                self.push(result);
                Ok(())
            }
            Err(message) => Err(self.runtime_error(message)),
        }
    }

    /// `Invoke` fast path: property lookup fused with the call, skipping
    /// the bound-method allocation. A field with the method's name shadows
    /// the method.
    fn invoke(&mut self, name: ObjRef, argc: u8) -> Result<(), VmError> {
        let receiver = self.peek(argc as usize);
        if !receiver.is_object() {
            return Err(self.runtime_error("Only instances have methods."));
        }
        let hash = self.heap.str_hash(name);
        let (class, field) = match self.heap.object(receiver.as_object()) {
            Object::Instance(instance) => (instance.class, instance.fields.get(name, hash)),
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };
        if let Some(value) = field {
            let slot = self.stack.len() - argc as usize - 1;
            self.stack[slot] = value;
            return self.call_value(value, argc);
        }
        self.invoke_from_class(class, name, hash, argc)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        hash: u32,
        argc: u8,
    ) -> Result<(), VmError> {
        match self.heap.class(class).methods.get(name, hash) {
            Some(method) => self.call(method.as_object(), argc),
            None => {
                let message = format!("Undefined property '{}'.", self.heap.str_slice(name));
                Err(self.runtime_error(message))
            }
        }
    }

    /// Replace the instance on top of the stack with a bound method.
    fn bind_method(&mut self, class: ObjRef, name: ObjRef, hash: u32) -> Result<(), VmError> {
        let Some(method) = self.heap.class(class).methods.get(name, hash) else {
            let message = format!("Undefined property '{}'.", self.heap.str_slice(name));
            return Err(self.runtime_error(message));
        };
        // Receiver stays on the stack while the bound method allocates.
        let bound = self.alloc(Object::BoundMethod(BoundMethodObj {
            receiver: self.peek(0),
            method: method.as_object(),
        }));
        self.pop();
        self.push(Value::object(bound));
        Ok(())
    }

    // ---- Upvalues ---------------------------------------------------------

    /// Find or create the open upvalue for a stack slot. The open list is
    /// kept sorted by slot descending so the scan can stop early, and at
    /// most one upvalue exists per slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut cursor = self.open_upvalues;
        loop {
            let Some(current) = cursor else { break };
            let upvalue = self.heap.upvalue(current);
            let next = upvalue.next;
            let UpvalueState::Open(existing) = upvalue.state else {
                unreachable!("closed upvalue on the open list");
            };
            if existing > slot {
                prev = Some(current);
                cursor = next;
            } else if existing == slot {
                return current;
            } else {
                break;
            }
        }

        let created = self.alloc(Object::Upvalue(UpvalueObj {
            state: UpvalueState::Open(slot),
            next: cursor,
        }));
        match prev {
            None => self.open_upvalues = Some(created),
            Some(prev) => self.heap.upvalue_mut(prev).next = Some(created),
        }
        created
    }

    /// Close every open upvalue at or above `from`: copy the stack value
    /// into the upvalue and unlink it.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(head) = self.open_upvalues {
            let upvalue = self.heap.upvalue(head);
            let next = upvalue.next;
            let UpvalueState::Open(slot) = upvalue.state else {
                unreachable!("closed upvalue on the open list");
            };
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            let upvalue = self.heap.upvalue_mut(head);
            upvalue.state = UpvalueState::Closed(value);
            upvalue.next = None;
            self.open_upvalues = next;
        }
    }

    // ---- Helpers ----------------------------------------------------------

    fn value_is_string(&self, value: Value) -> bool {
        value.is_object() && matches!(self.heap.object(value.as_object()), Object::Str(_))
    }

    /// Pop two numbers, push `f(a, b)`.
    fn numeric_binary(&mut self, f: impl FnOnce(f64, f64) -> Value) -> Result<(), VmError> {
        let (b, a) = (self.peek(0), self.peek(1));
        if !a.is_number() || !b.is_number() {
            return Err(self.runtime_error("Operands must be numbers."));
        }
        self.pop();
        self.pop();
        self.push(f(a.as_number(), b.as_number()));
        Ok(())
    }

    fn trace_instruction(&self) {
        let mut line = String::from("          ");
        for value in &self.stack {
            line.push_str(&format!("[ {} ]", self.heap.format_value(*value)));
        }
        eprintln!("{line}");
        let frame = self.frame();
        let function = self.heap.closure(frame.closure).function;
        let chunk = &self.heap.function(function).chunk;
        eprintln!("{}", debug::render_instruction(&self.heap, chunk, frame.ip));
    }

    // ---- Dispatch ---------------------------------------------------------

    fn run(&mut self) -> Result<(), VmError> {
        loop {
            if self.trace_execution {
                self.trace_instruction();
            }

            let byte = self.read_byte();
            let Some(op) = OpCode::from_byte(byte) else {
                return Err(self.runtime_error(format!("Unknown opcode {byte:#04x}.")));
            };

            match op {
                OpCode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                OpCode::ConstantLong => {
                    let constant = self.read_constant_long();
                    self.push(constant);
                }
                OpCode::Nil => self.push(Value::NIL),
                OpCode::True => self.push(Value::TRUE),
                OpCode::False => self.push(Value::FALSE),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Dup => self.push(self.peek(0)),

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.str_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            let message =
                                format!("Undefined variable '{}'.", self.heap.str_slice(name));
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        // Assignment never defines; undo and report.
                        self.globals.delete(name, hash);
                        let message =
                            format!("Undefined variable '{}'.", self.heap.str_slice(name));
                        return Err(self.runtime_error(message));
                    }
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[index];
                    let value = match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.stack[slot],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let value = self.peek(0);
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[index];
                    match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.stack[slot] = value,
                        UpvalueState::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
                        }
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(0);
                    if !receiver.is_object() {
                        return Err(self.runtime_error("Only instances have properties."));
                    }
                    let hash = self.heap.str_hash(name);
                    let (class, field) = match self.heap.object(receiver.as_object()) {
                        Object::Instance(instance) => {
                            (instance.class, instance.fields.get(name, hash))
                        }
                        _ => return Err(self.runtime_error("Only instances have properties.")),
                    };
                    match field {
                        Some(value) => {
                            self.pop();
                            self.push(value);
                        }
                        None => self.bind_method(class, name, hash)?,
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(1);
                    if !receiver.is_object()
                        || !matches!(self.heap.object(receiver.as_object()), Object::Instance(_))
                    {
                        return Err(self.runtime_error("Only instances have fields."));
                    }
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    self.heap
                        .instance_mut(receiver.as_object())
                        .fields
                        .set(name, hash, value);
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop().as_object();
                    let hash = self.heap.str_hash(name);
                    self.bind_method(superclass, name, hash)?;
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::boolean(a == b));
                }
                OpCode::Greater => self.numeric_binary(|a, b| Value::boolean(a > b))?,
                OpCode::Less => self.numeric_binary(|a, b| Value::boolean(a < b))?,

                OpCode::Add => {
                    let (b, a) = (self.peek(0), self.peek(1));
                    if a.is_number() && b.is_number() {
                        self.pop();
                        self.pop();
                        self.push(Value::number(a.as_number() + b.as_number()));
                    } else if self.value_is_string(a) && self.value_is_string(b) {
                        // Operands stay on the stack until the result is
                        // interned, so a collection here cannot free them.
                        let mut chars = self.heap.str_slice(a.as_object()).to_string();
                        chars.push_str(self.heap.str_slice(b.as_object()));
                        let result = self.intern_owned(chars);
                        self.pop();
                        self.pop();
                        self.push(Value::object(result));
                    } else {
                        return Err(
                            self.runtime_error("Operands must be two numbers or two strings.")
                        );
                    }
                }
                OpCode::Subtract => self.numeric_binary(|a, b| Value::number(a - b))?,
                OpCode::Multiply => self.numeric_binary(|a, b| Value::number(a * b))?,
                OpCode::Divide => {
                    let (b, a) = (self.peek(0), self.peek(1));
                    if !a.is_number() || !b.is_number() {
                        return Err(self.runtime_error("Operands must be numbers."));
                    }
                    if b.as_number() == 0.0 {
                        return Err(self.runtime_error("Division by zero."));
                    }
                    self.pop();
                    self.pop();
                    self.push(Value::number(a.as_number() / b.as_number()));
                }
                OpCode::Modulus => {
                    let (b, a) = (self.peek(0), self.peek(1));
                    if !a.is_number() || !b.is_number() {
                        return Err(self.runtime_error("Operands must be numbers."));
                    }
                    let (a, b) = (a.as_number(), b.as_number());
                    if a.fract() != 0.0 || b.fract() != 0.0 {
                        return Err(self.runtime_error("Operands must be integers."));
                    }
                    if b == 0.0 {
                        return Err(self.runtime_error("Modulo by zero."));
                    }
                    self.pop();
                    self.pop();
                    self.push(Value::number(a % b));
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::boolean(value.is_falsey()));
                }
                OpCode::Negate => {
                    if !self.peek(0).is_number() {
                        return Err(self.runtime_error("Operand must be a number."));
                    }
                    let value = self.pop();
                    self.push(Value::number(-value.as_number()));
                }

                OpCode::Print => {
                    let value = self.pop();
                    let text = self.heap.format_value(value);
                    let _ = writeln!(self.out, "{text}");
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }
                OpCode::Conditional => {
                    let else_branch = self.pop();
                    let then_branch = self.pop();
                    let condition = self.pop();
                    self.push(if condition.is_falsey() {
                        else_branch
                    } else {
                        then_branch
                    });
                }

                OpCode::Call => {
                    let argc = self.read_byte();
                    self.call_value(self.peek(argc as usize), argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    let superclass = self.pop().as_object();
                    let hash = self.heap.str_hash(name);
                    self.invoke_from_class(superclass, name, hash, argc)?;
                }
                OpCode::Closure => {
                    let function = self.read_constant().as_object();
                    let count = self.heap.function(function).upvalue_count as usize;
                    // Push the closure before resolving captures; capture
                    // allocation below can collect.
                    let closure = self.alloc(Object::Closure(ClosureObj {
                        function,
                        upvalues: Vec::with_capacity(count),
                    }));
                    self.push(Value::object(closure));
                    for _ in 0..count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.frame().base;
                            self.capture_upvalue(base + index)
                        } else {
                            let enclosing = self.frame().closure;
                            self.heap.closure(enclosing).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no active call frame");
                    self.close_upvalues(frame.base);
                    if self.frames.is_empty() {
                        // Pop the script closure; execution is complete.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.push(result);
                }

                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.alloc(Object::Class(ClassObj {
                        name,
                        methods: Table::new(),
                        initializer: Value::NIL,
                    }));
                    self.push(Value::object(class));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    if !superclass.is_object()
                        || !matches!(self.heap.object(superclass.as_object()), Object::Class(_))
                    {
                        return Err(self.runtime_error("Superclass must be a class."));
                    }
                    let subclass = self.peek(0).as_object();
                    // Copy-down inheritance: methods added to the parent
                    // after this point are invisible to the subclass.
                    let (methods, initializer) = {
                        let superclass = self.heap.class(superclass.as_object());
                        (superclass.methods.clone(), superclass.initializer)
                    };
                    let subclass = self.heap.class_mut(subclass);
                    subclass.methods.add_all(&methods);
                    subclass.initializer = initializer;
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let class = self.peek(1).as_object();
                    let hash = self.heap.str_hash(name);
                    let is_initializer = name == self.init_string;
                    let class = self.heap.class_mut(class);
                    class.methods.set(name, hash, method);
                    if is_initializer {
                        class.initializer = method;
                    }
                    self.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::FunctionObj;
    use std::sync::{Arc, Mutex};
    use stoat_vm_bytecode::Chunk;

    /// A `Write` sink tests can read back.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn vm_with_buffer() -> (Vm, SharedBuf) {
        let buf = SharedBuf::default();
        let vm = Vm::with_output(VmConfig::default(), Box::new(buf.clone()));
        (vm, buf)
    }

    fn script(vm: &mut Vm, build: impl FnOnce(&mut Heap, &mut Chunk)) -> ObjRef {
        let mut chunk = Chunk::new();
        build(vm.heap_mut(), &mut chunk);
        chunk.write_op(OpCode::Nil, 99);
        chunk.write_op(OpCode::Return, 99);
        vm.heap_mut().alloc(Object::Function(FunctionObj {
            arity: 0,
            upvalue_count: 0,
            chunk,
            name: None,
        }))
    }

    #[test]
    fn test_arithmetic_and_print() {
        let (mut vm, buf) = vm_with_buffer();
        let function = script(&mut vm, |_, chunk| {
            chunk.write_constant(Value::number(1.0), 1);
            chunk.write_constant(Value::number(2.0), 1);
            chunk.write_op(OpCode::Add, 1);
            chunk.write_constant(Value::number(3.0), 1);
            chunk.write_op(OpCode::Multiply, 1);
            chunk.write_op(OpCode::Print, 1);
        });
        vm.execute(function).expect("script runs");
        assert_eq!(buf.contents(), "9\n");
        assert!(vm.is_settled());
    }

    #[test]
    fn test_concatenation_interns_result() {
        let (mut vm, buf) = vm_with_buffer();
        let function = script(&mut vm, |heap, chunk| {
            let hello = heap.intern("con");
            let world = heap.intern("cat");
            chunk.write_constant(Value::object(hello), 1);
            chunk.write_constant(Value::object(world), 1);
            chunk.write_op(OpCode::Add, 1);
            chunk.write_op(OpCode::Print, 1);
        });
        vm.execute(function).expect("script runs");
        assert_eq!(buf.contents(), "concat\n");
    }

    #[test]
    fn test_add_type_mismatch_reports_and_resets() {
        let (mut vm, _buf) = vm_with_buffer();
        let function = script(&mut vm, |heap, chunk| {
            chunk.write_constant(Value::number(1.0), 1);
            let s = heap.intern("a");
            chunk.write_constant(Value::object(s), 1);
            chunk.write_op(OpCode::Add, 1);
        });
        let err = vm.execute(function).expect_err("type error");
        assert!(
            err.message()
                .contains("Operands must be two numbers or two strings.")
        );
        assert!(vm.is_settled());
    }

    #[test]
    fn test_divide_by_zero_errors() {
        let (mut vm, _buf) = vm_with_buffer();
        let function = script(&mut vm, |_, chunk| {
            chunk.write_constant(Value::number(1.0), 1);
            chunk.write_constant(Value::number(0.0), 1);
            chunk.write_op(OpCode::Divide, 1);
        });
        let err = vm.execute(function).expect_err("division by zero");
        assert!(err.message().contains("Division by zero."));
    }

    #[test]
    fn test_modulus_requires_integers() {
        let (mut vm, _buf) = vm_with_buffer();
        let function = script(&mut vm, |_, chunk| {
            chunk.write_constant(Value::number(7.5), 1);
            chunk.write_constant(Value::number(2.0), 1);
            chunk.write_op(OpCode::Modulus, 1);
        });
        let err = vm.execute(function).expect_err("non-integral modulus");
        assert!(err.message().contains("Operands must be integers."));
    }

    #[test]
    fn test_modulus_of_integers() {
        let (mut vm, buf) = vm_with_buffer();
        let function = script(&mut vm, |_, chunk| {
            chunk.write_constant(Value::number(7.0), 1);
            chunk.write_constant(Value::number(3.0), 1);
            chunk.write_op(OpCode::Modulus, 1);
            chunk.write_op(OpCode::Print, 1);
        });
        vm.execute(function).expect("script runs");
        assert_eq!(buf.contents(), "1\n");
    }

    #[test]
    fn test_conditional_fold() {
        let (mut vm, buf) = vm_with_buffer();
        let function = script(&mut vm, |_, chunk| {
            chunk.write_op(OpCode::False, 1);
            chunk.write_constant(Value::number(1.0), 1);
            chunk.write_constant(Value::number(2.0), 1);
            chunk.write_op(OpCode::Conditional, 1);
            chunk.write_op(OpCode::Print, 1);
        });
        vm.execute(function).expect("script runs");
        assert_eq!(buf.contents(), "2\n");
    }

    #[test]
    fn test_calling_nil_is_an_error() {
        let (mut vm, _buf) = vm_with_buffer();
        let function = script(&mut vm, |_, chunk| {
            chunk.write_op(OpCode::Nil, 1);
            chunk.write_op(OpCode::Call, 1);
            chunk.write(0, 1);
        });
        let err = vm.execute(function).expect_err("not callable");
        assert!(err.message().contains("Can only call functions and classes."));
        assert!(vm.is_settled());
    }

    #[test]
    fn test_gc_stress_mode_survives_concatenation() {
        let buf = SharedBuf::default();
        let config = VmConfig {
            gc_stress: true,
            ..VmConfig::default()
        };
        let mut vm = Vm::with_output(config, Box::new(buf.clone()));
        let function = script(&mut vm, |heap, chunk| {
            let a = heap.intern("left-");
            let b = heap.intern("right");
            chunk.write_constant(Value::object(a), 1);
            chunk.write_constant(Value::object(b), 1);
            chunk.write_op(OpCode::Add, 1);
            chunk.write_op(OpCode::Print, 1);
        });
        vm.execute(function).expect("script runs under GC stress");
        assert_eq!(buf.contents(), "left-right\n");
    }
}
