//! Constant folding over compiled chunks. The pass walks the bytecode
//! once, shadowing the positions of literal-push instructions; when a
//! pure operator finds enough shadowed literals it evaluates the
//! operation with the interpreter's own semantics and splices the
//! result back in as a single push. A fold therefore raises exactly the
//! runtime error the program would have raised, just earlier.

use crate::chunk::{Chunk, OpCode, OpcodeKind};
use crate::constants::{MAX_PUSH_CONSTANT, STACK_SIZE};
use crate::error::{ErrorKind, RuntimeError};
use crate::heap::ObjRef;
use crate::value::Value;
use crate::vm::Vm;

pub struct ChunkOptimizer<'vm> {
    vm: &'vm mut Vm,
}

/// Optimizes the chunk owned by a heap closure in place. The chunk is
/// taken out of the closure for the duration so the optimizer can hold
/// the VM mutably, then put back even when a fold fails.
pub fn optimize_closure(vm: &mut Vm, closure: ObjRef) -> Result<(), RuntimeError> {
    let mut chunk = std::mem::take(&mut vm.heap_mut().closure_mut(closure).chunk);
    let result = ChunkOptimizer::new(vm).optimize(&mut chunk);
    vm.heap_mut().closure_mut(closure).chunk = chunk;
    result
}

impl<'vm> ChunkOptimizer<'vm> {
    pub fn new(vm: &'vm mut Vm) -> Self {
        Self { vm }
    }

    pub fn optimize(&mut self, chunk: &mut Chunk) -> Result<(), RuntimeError> {
        // Code positions of literal pushes still available for folding.
        let mut shadow: Vec<usize> = Vec::new();
        let mut ip = 0;

        while ip < chunk.code_len() {
            let op = match OpCode::from_byte(chunk.code_byte(ip)) {
                Some(op) => op,
                None => {
                    let byte = chunk.code_byte(ip);
                    return Err(RuntimeError::new(
                        ErrorKind::UnknownInstruction(byte),
                        chunk.code_line(ip),
                    ));
                }
            };
            match op {
                OpCode::PushConstant | OpCode::Nil | OpCode::True | OpCode::False => {
                    if shadow.len() == STACK_SIZE {
                        return Err(RuntimeError::new(
                            ErrorKind::StackOverflow,
                            chunk.code_line(ip),
                        ));
                    }
                    shadow.push(ip);
                    ip += literal_size(op);
                }
                OpCode::Not | OpCode::Negate => {
                    let a_pos = match shadow.pop() {
                        Some(pos) => pos,
                        None => {
                            ip += 1;
                            continue;
                        }
                    };
                    let line = chunk.code_line(ip);
                    let value = self.literal_at(chunk, a_pos);
                    let folded = self
                        .vm
                        .fold_unary(op, value)
                        .map_err(|kind| RuntimeError::new(kind, line))?;
                    ip = self.splice(chunk, a_pos, ip + 1, folded, line)?;
                }
                OpCode::Add
                | OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide
                | OpCode::Greater
                | OpCode::Less
                | OpCode::Equal => {
                    if shadow.len() < 2 {
                        shadow.clear();
                        ip += 1;
                        continue;
                    }
                    let b_pos = shadow.pop().unwrap_or_default();
                    let a_pos = shadow.pop().unwrap_or_default();
                    let line = chunk.code_line(ip);
                    let a = self.literal_at(chunk, a_pos);
                    let b = self.literal_at(chunk, b_pos);
                    let folded = self
                        .vm
                        .fold_binary(op, a, b)
                        .map_err(|kind| RuntimeError::new(kind, line))?;
                    ip = self.splice(chunk, a_pos, ip + 1, folded, line)?;
                }
                _ => {
                    shadow.clear();
                    ip += instruction_size(chunk, op, ip);
                }
            }
        }
        Ok(())
    }

    fn literal_at(&self, chunk: &Chunk, pos: usize) -> Value {
        let op = OpCode::from_byte(chunk.code_byte(pos));
        match op.and_then(OpCode::literal_value) {
            Some(value) => value,
            None => chunk.constant(chunk.code_byte(pos + 1) as usize),
        }
    }

    /// Replaces the code region `[from, to)` with a single push of
    /// `value`, repairing every jump that spans the region. Returns the
    /// position of the new push so the caller re-reads it.
    fn splice(
        &mut self,
        chunk: &mut Chunk,
        from: usize,
        to: usize,
        value: Value,
        line: usize,
    ) -> Result<usize, RuntimeError> {
        let replacement: Vec<u8> = match value {
            Value::Nil => vec![OpCode::Nil.to_byte()],
            Value::Bool(true) => vec![OpCode::True.to_byte()],
            Value::Bool(false) => vec![OpCode::False.to_byte()],
            Value::Double(_) | Value::Obj(_) => {
                let index = chunk.add_constant(value, line);
                if index >= MAX_PUSH_CONSTANT {
                    return Err(RuntimeError::new(
                        ErrorKind::OptimizerFailure("too many constants".to_string()),
                        line,
                    ));
                }
                vec![OpCode::PushConstant.to_byte(), index as u8]
            }
        };

        let delta = replacement.len() as isize - (to - from) as isize;
        adjust_jumps(chunk, from, to, delta);
        for _ in from..to {
            chunk.erase_code(from);
        }
        for (i, &byte) in replacement.iter().enumerate() {
            chunk.insert_code(from + i, byte, line);
        }
        Ok(from)
    }
}

fn literal_size(op: OpCode) -> usize {
    if op == OpCode::PushConstant {
        2
    } else {
        1
    }
}

fn instruction_size(chunk: &Chunk, op: OpCode, ip: usize) -> usize {
    match op.kind() {
        OpcodeKind::Simple => 1,
        OpcodeKind::Constant | OpcodeKind::Byte => 2,
        OpcodeKind::Jump | OpcodeKind::Loop | OpcodeKind::Invoke => 3,
        OpcodeKind::Closure => 2 + chunk.code_byte(ip + 1) as usize * 2,
    }
}

/// Rewrites the offset of every jump whose span crosses the region
/// `[from, to)` that is about to change length by `delta` bytes. The
/// region only ever holds literal pushes and a folding operator, so no
/// jump instruction lies inside it.
fn adjust_jumps(chunk: &mut Chunk, from: usize, to: usize, delta: isize) {
    let mut ip = 0;
    while ip < chunk.code_len() {
        let op = match OpCode::from_byte(chunk.code_byte(ip)) {
            Some(op) => op,
            None => return,
        };
        let size = instruction_size(chunk, op, ip);
        let spans = match op {
            OpCode::Jump | OpCode::JumpIfFalse => {
                let target = ip + 3 + read_offset(chunk, ip);
                ip + 3 <= from && to <= target
            }
            OpCode::Loop => {
                let target = (ip + 3).saturating_sub(read_offset(chunk, ip));
                target <= from && to <= ip
            }
            _ => false,
        };
        if spans {
            let offset = (read_offset(chunk, ip) as isize + delta) as usize;
            chunk.set_code_byte(ip + 1, ((offset >> 8) & 0xFF) as u8);
            chunk.set_code_byte(ip + 2, (offset & 0xFF) as u8);
        }
        ip += size;
    }
}

fn read_offset(chunk: &Chunk, ip: usize) -> usize {
    let high = chunk.code_byte(ip + 1) as usize;
    let low = chunk.code_byte(ip + 2) as usize;
    (high << 8) | low
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::ChunkChecker;
    use crate::object::ObjectType;

    fn optimize(vm: &mut Vm, chunk: &mut Chunk) -> Result<(), RuntimeError> {
        ChunkOptimizer::new(vm).optimize(chunk)
    }

    fn code_bytes(chunk: &Chunk) -> Vec<u8> {
        (0..chunk.code_len()).map(|i| chunk.code_byte(i)).collect()
    }

    #[test]
    fn folds_a_nested_arithmetic_expression() {
        // "1 + 2 * 3;" compiled with the product first.
        let mut chunk = Chunk::new();
        chunk.add_constant(Value::Double(2.0), 1);
        chunk.add_constant(Value::Double(3.0), 1);
        chunk.add_constant(Value::Double(1.0), 1);
        chunk.write_op(OpCode::PushConstant, 1);
        chunk.write_byte(0, 1);
        chunk.write_op(OpCode::PushConstant, 1);
        chunk.write_byte(1, 1);
        chunk.write_op(OpCode::Multiply, 1);
        chunk.write_op(OpCode::PushConstant, 1);
        chunk.write_byte(2, 1);
        chunk.write_op(OpCode::Add, 1);
        chunk.write_op(OpCode::Print, 1);
        chunk.write_op(OpCode::Return, 1);

        let mut vm = Vm::new();
        optimize(&mut vm, &mut chunk).unwrap();

        assert_eq!(
            code_bytes(&chunk),
            vec![
                OpCode::PushConstant.to_byte(),
                4,
                OpCode::Print.to_byte(),
                OpCode::Return.to_byte(),
            ]
        );
        assert_eq!(chunk.constant(4), Value::Double(7.0));
        // Dead intermediate constants stay in the pool.
        assert_eq!(chunk.constant(3), Value::Double(6.0));
    }

    #[test]
    fn folds_literal_keywords() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::True, 1);
        chunk.write_op(OpCode::Not, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Return, 1);

        let mut vm = Vm::new();
        optimize(&mut vm, &mut chunk).unwrap();

        assert_eq!(
            code_bytes(&chunk),
            vec![
                OpCode::False.to_byte(),
                OpCode::Nil.to_byte(),
                OpCode::Return.to_byte(),
            ]
        );
    }

    #[test]
    fn comparison_folds_to_a_keyword_push() {
        let mut chunk = Chunk::new();
        chunk.add_constant(Value::Double(2.0), 1);
        chunk.add_constant(Value::Double(1.0), 1);
        chunk.write_op(OpCode::PushConstant, 1);
        chunk.write_byte(0, 1);
        chunk.write_op(OpCode::PushConstant, 1);
        chunk.write_byte(1, 1);
        chunk.write_op(OpCode::Greater, 1);
        chunk.write_op(OpCode::Pop, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Return, 1);

        let mut vm = Vm::new();
        optimize(&mut vm, &mut chunk).unwrap();

        assert_eq!(
            code_bytes(&chunk),
            vec![
                OpCode::True.to_byte(),
                OpCode::Pop.to_byte(),
                OpCode::Nil.to_byte(),
                OpCode::Return.to_byte(),
            ]
        );
    }

    #[test]
    fn division_by_zero_fails_like_the_interpreter() {
        let mut chunk = Chunk::new();
        chunk.add_constant(Value::Double(6.0), 1);
        chunk.add_constant(Value::Double(0.0), 1);
        chunk.write_op(OpCode::PushConstant, 1);
        chunk.write_byte(0, 1);
        chunk.write_op(OpCode::PushConstant, 1);
        chunk.write_byte(1, 1);
        chunk.write_op(OpCode::Divide, 3);
        chunk.write_op(OpCode::Nil, 3);
        chunk.write_op(OpCode::Return, 3);

        let mut vm = Vm::new();
        let err = optimize(&mut vm, &mut chunk).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ZeroDivision));
        assert_eq!(err.line, 3);
        assert!(err.trace.is_empty());
    }

    #[test]
    fn type_errors_fail_like_the_interpreter() {
        let mut chunk = Chunk::new();
        chunk.add_constant(Value::Double(1.0), 1);
        chunk.write_op(OpCode::PushConstant, 1);
        chunk.write_byte(0, 1);
        chunk.write_op(OpCode::True, 1);
        chunk.write_op(OpCode::Add, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Return, 1);

        let mut vm = Vm::new();
        let err = optimize(&mut vm, &mut chunk).unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::WrongType { expected: crate::value::ValueKind::Double, .. }
        ));
    }

    #[test]
    fn string_concatenation_folds_to_an_interned_string() {
        let mut vm = Vm::new();
        let left = vm.intern_string("foo");
        let right = vm.intern_string("bar");

        let mut chunk = Chunk::new();
        chunk.add_constant(Value::Obj(left), 1);
        chunk.add_constant(Value::Obj(right), 1);
        chunk.write_op(OpCode::PushConstant, 1);
        chunk.write_byte(0, 1);
        chunk.write_op(OpCode::PushConstant, 1);
        chunk.write_byte(1, 1);
        chunk.write_op(OpCode::Add, 1);
        chunk.write_op(OpCode::Print, 1);
        chunk.write_op(OpCode::Return, 1);

        optimize(&mut vm, &mut chunk).unwrap();

        let folded = match chunk.constant(2) {
            Value::Obj(r) => r,
            other => panic!("expected object constant, found {:?}", other),
        };
        assert_eq!(vm.heap().type_tag(folded), ObjectType::String);
        assert_eq!(vm.heap().str_text(folded), "foobar");
        assert_eq!(vm.intern_string("foobar"), folded);
    }

    #[test]
    fn impure_opcodes_clear_the_literal_window() {
        let mut chunk = Chunk::new();
        chunk.add_constant(Value::Double(1.0), 1);
        chunk.add_constant(Value::Double(2.0), 1);
        chunk.write_op(OpCode::PushConstant, 1);
        chunk.write_byte(0, 1);
        chunk.write_op(OpCode::GetGlobal, 1);
        chunk.write_byte(1, 1);
        chunk.write_op(OpCode::Add, 1);
        chunk.write_op(OpCode::Pop, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Return, 1);

        let before = code_bytes(&chunk);
        let mut vm = Vm::new();
        optimize(&mut vm, &mut chunk).unwrap();
        assert_eq!(code_bytes(&chunk), before);
    }

    #[test]
    fn operand_bytes_are_not_misread_as_literals() {
        // SetLocal's slot operand happens to equal the True opcode; a
        // byte-at-a-time walk would shadow it and fold the Not below.
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::SetLocal, 1);
        chunk.write_byte(OpCode::True.to_byte(), 1);
        chunk.write_op(OpCode::Not, 1);
        chunk.write_op(OpCode::Pop, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Return, 1);

        let before = code_bytes(&chunk);
        let mut vm = Vm::new();
        optimize(&mut vm, &mut chunk).unwrap();
        assert_eq!(code_bytes(&chunk), before);
    }

    #[test]
    fn jump_offsets_survive_folding_inside_a_loop() {
        // "while (true) { 1 + 2; }" shape.
        let mut chunk = Chunk::new();
        chunk.add_constant(Value::Double(1.0), 1);
        chunk.add_constant(Value::Double(2.0), 1);
        chunk.write_op(OpCode::True, 1); // 0
        chunk.write_op(OpCode::JumpIfFalse, 1); // 1, to 14
        chunk.write_byte(0, 1);
        chunk.write_byte(10, 1);
        chunk.write_op(OpCode::Pop, 1); // 4
        chunk.write_op(OpCode::PushConstant, 1); // 5
        chunk.write_byte(0, 1);
        chunk.write_op(OpCode::PushConstant, 1); // 7
        chunk.write_byte(1, 1);
        chunk.write_op(OpCode::Add, 1); // 9
        chunk.write_op(OpCode::Pop, 1); // 10
        chunk.write_op(OpCode::Loop, 1); // 11, back to 0
        chunk.write_byte(0, 1);
        chunk.write_byte(14, 1);
        chunk.write_op(OpCode::Pop, 1); // 14
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Return, 1);
        assert!(ChunkChecker::new(&chunk).check());

        let mut vm = Vm::new();
        optimize(&mut vm, &mut chunk).unwrap();

        assert_eq!(
            code_bytes(&chunk),
            vec![
                OpCode::True.to_byte(),
                OpCode::JumpIfFalse.to_byte(),
                0,
                7,
                OpCode::Pop.to_byte(),
                OpCode::PushConstant.to_byte(),
                2,
                OpCode::Pop.to_byte(),
                OpCode::Loop.to_byte(),
                0,
                11,
                OpCode::Pop.to_byte(),
                OpCode::Nil.to_byte(),
                OpCode::Return.to_byte(),
            ]
        );
        assert_eq!(chunk.constant(2), Value::Double(3.0));
        // The rewritten chunk still verifies.
        assert!(ChunkChecker::new(&chunk).check());
    }

    #[test]
    fn pool_overflow_is_an_optimizer_failure() {
        let mut chunk = Chunk::new();
        for i in 0..MAX_PUSH_CONSTANT {
            chunk.add_constant(Value::Double(i as f64), 1);
        }
        chunk.write_op(OpCode::PushConstant, 1);
        chunk.write_byte(0, 1);
        chunk.write_op(OpCode::PushConstant, 1);
        chunk.write_byte(1, 1);
        chunk.write_op(OpCode::Add, 1);
        chunk.write_op(OpCode::Pop, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Return, 1);

        let mut vm = Vm::new();
        let err = optimize(&mut vm, &mut chunk).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::OptimizerFailure(_)));
    }
}
