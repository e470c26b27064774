//! Chunk disassembler
//!
//! Renders compiled chunks for `--trace` execution and bytecode dumps.
//! Output format, per instruction: byte offset, source line (`|` when it
//! repeats the previous instruction's), opcode name, and operands with
//! constant values resolved through the heap.

use stoat_vm_bytecode::{Chunk, OpCode, Value};

use crate::heap::Heap;

/// Render a whole chunk with a header line.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (text, next) = instruction_at(heap, chunk, offset);
        out.push_str(&text);
        out.push('\n');
        offset = next;
    }
    out
}

/// Render the single instruction at `offset`.
pub fn render_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> String {
    instruction_at(heap, chunk, offset).0
}

fn instruction_at(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut head = format!("{offset:04} ");
    let line = chunk.get_line(offset);
    if offset > 0 && line == chunk.get_line(offset - 1) {
        head.push_str("   | ");
    } else {
        head.push_str(&format!("{line:4} "));
    }

    let byte = chunk.code[offset];
    let Some(op) = OpCode::from_byte(byte) else {
        return (format!("{head}Unknown opcode {byte:#04x}"), offset + 1);
    };

    let (body, next) = match op {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => constant_instruction(heap, chunk, op, offset),
        OpCode::ConstantLong => constant_long_instruction(heap, chunk, offset),
        OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(chunk, op, offset),
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(chunk, op, 1, offset),
        OpCode::Loop => jump_instruction(chunk, op, -1, offset),
        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(heap, chunk, op, offset),
        OpCode::Closure => closure_instruction(heap, chunk, offset),
        _ => (op.name().to_string(), offset + 1),
    };

    (format!("{head}{body}"), next)
}

fn constant_value(heap: &Heap, chunk: &Chunk, index: usize) -> String {
    let value: Value = chunk.constants[index];
    heap.format_value(value)
}

fn constant_instruction(
    heap: &Heap,
    chunk: &Chunk,
    op: OpCode,
    offset: usize,
) -> (String, usize) {
    let index = chunk.code[offset + 1] as usize;
    (
        format!(
            "{:<16} {index:4} '{}'",
            op.name(),
            constant_value(heap, chunk, index)
        ),
        offset + 2,
    )
}

fn constant_long_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let index = ((chunk.code[offset + 1] as usize) << 16)
        | ((chunk.code[offset + 2] as usize) << 8)
        | chunk.code[offset + 3] as usize;
    (
        format!(
            "{:<16} {index:4} '{}'",
            OpCode::ConstantLong.name(),
            constant_value(heap, chunk, index)
        ),
        offset + 4,
    )
}

fn byte_instruction(chunk: &Chunk, op: OpCode, offset: usize) -> (String, usize) {
    let operand = chunk.code[offset + 1];
    (format!("{:<16} {operand:4}", op.name()), offset + 2)
}

fn jump_instruction(chunk: &Chunk, op: OpCode, sign: i32, offset: usize) -> (String, usize) {
    let jump = ((chunk.code[offset + 1] as i32) << 8) | chunk.code[offset + 2] as i32;
    let target = offset as i32 + 3 + sign * jump;
    (
        format!("{:<16} {offset:4} -> {target}", op.name()),
        offset + 3,
    )
}

fn invoke_instruction(heap: &Heap, chunk: &Chunk, op: OpCode, offset: usize) -> (String, usize) {
    let index = chunk.code[offset + 1] as usize;
    let argc = chunk.code[offset + 2];
    (
        format!(
            "{:<16} ({argc} args) {index:4} '{}'",
            op.name(),
            constant_value(heap, chunk, index)
        ),
        offset + 3,
    )
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let index = chunk.code[offset + 1] as usize;
    let mut text = format!(
        "{:<16} {index:4} {}",
        OpCode::Closure.name(),
        constant_value(heap, chunk, index)
    );

    let function = chunk.constants[index].as_object();
    let upvalue_count = heap.function(function).upvalue_count as usize;
    let mut next = offset + 2;
    for _ in 0..upvalue_count {
        let is_local = chunk.code[next] != 0;
        let capture_index = chunk.code[next + 1];
        text.push_str(&format!(
            "\n{:04}    |                     {} {capture_index}",
            next,
            if is_local { "local" } else { "upvalue" }
        ));
        next += 2;
    }
    (text, next)
}
