//! Human-readable chunk dumps, used by the `debug_print_code` and
//! `debug_trace_execution` features. Output goes to stderr so it never
//! interleaves with script `print` output.

use crate::chunk::{Chunk, OpCode, OpcodeKind};
use crate::heap::Heap;
use crate::value::PrintFlags;

pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) {
    eprintln!("== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code_len() {
        offset = disassemble_instruction(heap, chunk, offset);
    }
}

/// Prints one instruction and returns the offset of the next one.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    eprint!("{:04} ", offset);
    if offset > 0 && chunk.code_line(offset) == chunk.code_line(offset - 1) {
        eprint!("   | ");
    } else {
        eprint!("{:4} ", chunk.code_line(offset));
    }

    let op = match OpCode::from_byte(chunk.code_byte(offset)) {
        Some(op) => op,
        None => {
            eprintln!("unknown opcode {:#04x}", chunk.code_byte(offset));
            return offset + 1;
        }
    };

    match op.kind() {
        OpcodeKind::Simple => {
            eprintln!("{}", op);
            offset + 1
        }
        OpcodeKind::Constant => constant_instruction(heap, chunk, op, offset),
        OpcodeKind::Byte => {
            let operand = chunk.code_byte(offset + 1);
            eprintln!("{:<16} {:4}", op.to_string(), operand);
            offset + 2
        }
        OpcodeKind::Jump => jump_instruction(chunk, op, offset, true),
        OpcodeKind::Loop => jump_instruction(chunk, op, offset, false),
        OpcodeKind::Closure => {
            let count = chunk.code_byte(offset + 1) as usize;
            eprintln!("{:<16} {:4}", op.to_string(), count);
            let mut cursor = offset + 2;
            for _ in 0..count {
                let is_local = chunk.code_byte(cursor) != 0;
                let index = chunk.code_byte(cursor + 1);
                eprintln!(
                    "{:04}      |                  {} {}",
                    cursor,
                    if is_local { "local" } else { "upvalue" },
                    index
                );
                cursor += 2;
            }
            cursor
        }
        OpcodeKind::Invoke => {
            let argc = chunk.code_byte(offset + 1);
            let name_index = chunk.code_byte(offset + 2) as usize;
            let name = heap.format_value(chunk.constant(name_index), PrintFlags::Raw);
            eprintln!("{:<16} ({} args) {:4} '{}'", op.to_string(), argc, name_index, name);
            offset + 3
        }
    }
}

fn constant_instruction(heap: &Heap, chunk: &Chunk, op: OpCode, offset: usize) -> usize {
    let index = chunk.code_byte(offset + 1) as usize;
    let value = heap.format_value(chunk.constant(index), PrintFlags::Raw);
    eprintln!("{:<16} {:4} '{}'", op.to_string(), index, value);
    offset + 2
}

fn jump_instruction(chunk: &Chunk, op: OpCode, offset: usize, forward: bool) -> usize {
    let hi = chunk.code_byte(offset + 1) as usize;
    let lo = chunk.code_byte(offset + 2) as usize;
    let jump = (hi << 8) | lo;
    let target = if forward { offset + 3 + jump } else { (offset + 3).saturating_sub(jump) };
    eprintln!("{:<16} {:4} -> {}", op.to_string(), offset, target);
    offset + 3
}
