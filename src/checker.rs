//! Static chunk verification, run once before execution. Two passes: a
//! linear structural pass (every byte decodes, operands are present,
//! constant indexes are in range, the stream ends with Return) and a
//! depth pass that simulates only operand-stack depth along every
//! reachable control-flow path. It is a structural safety check, not a
//! type checker.

use crate::chunk::{Chunk, OpCode, OpcodeKind};
use crate::constants::STACK_SIZE;

pub struct ChunkChecker<'a> {
    chunk: &'a Chunk,
}

impl<'a> ChunkChecker<'a> {
    pub fn new(chunk: &'a Chunk) -> Self {
        Self { chunk }
    }

    /// Accepts the chunk only if no reachable instruction sequence can
    /// under- or overflow the operand stack. `Return` consumes the result
    /// it hands to the caller; the fall-through final Return must leave
    /// the depth at exactly zero, so the canonical tail `[Nil, Return]`
    /// nets to zero and a bare `[Return]` underflows.
    pub fn check(&self) -> bool {
        match self.instruction_starts() {
            Some(starts) => self.check_depths(&starts),
            None => false,
        }
    }

    /// Linear decode: marks every instruction boundary, validating
    /// operand presence and constant-pool indexes. Fails on unknown
    /// opcodes and on streams whose last instruction is not Return.
    fn instruction_starts(&self) -> Option<Vec<bool>> {
        let code_len = self.chunk.code_len();
        let mut starts = vec![false; code_len];
        let mut ip = 0;
        let mut last_op = None;

        while ip < code_len {
            starts[ip] = true;
            let op = OpCode::from_byte(self.chunk.code_byte(ip))?;
            ip = self.next_ip(op, ip)?;
            if matches!(op.kind(), OpcodeKind::Constant) {
                let index = self.chunk.code_byte(ip - 1) as usize;
                if index >= self.chunk.constants_len() {
                    return None;
                }
            }
            if matches!(op.kind(), OpcodeKind::Invoke) {
                let index = self.chunk.code_byte(ip - 1) as usize;
                if index >= self.chunk.constants_len() {
                    return None;
                }
            }
            last_op = Some(op);
        }

        if last_op == Some(OpCode::Return) {
            Some(starts)
        } else {
            None
        }
    }

    /// Offset just past `op`'s operand bytes, or None if they are cut
    /// short by the end of the stream.
    fn next_ip(&self, op: OpCode, ip: usize) -> Option<usize> {
        let code_len = self.chunk.code_len();
        let next = match op.kind() {
            OpcodeKind::Simple => ip + 1,
            OpcodeKind::Constant | OpcodeKind::Byte => ip + 2,
            OpcodeKind::Jump | OpcodeKind::Loop | OpcodeKind::Invoke => ip + 3,
            OpcodeKind::Closure => {
                if ip + 1 >= code_len {
                    return None;
                }
                let count = self.chunk.code_byte(ip + 1) as usize;
                ip + 2 + count * 2
            }
        };
        if next > code_len {
            None
        } else {
            Some(next)
        }
    }

    fn jump_offset(&self, ip: usize) -> usize {
        let high = self.chunk.code_byte(ip + 1) as usize;
        let low = self.chunk.code_byte(ip + 2) as usize;
        (high << 8) | low
    }

    fn check_depths(&self, starts: &[bool]) -> bool {
        let code_len = self.chunk.code_len();
        let mut seen: Vec<Option<i64>> = vec![None; code_len];
        let mut work: Vec<(usize, i64)> = vec![(0, 0)];

        while let Some((entry_ip, entry_depth)) = work.pop() {
            let mut ip = entry_ip;
            let mut depth = entry_depth;
            loop {
                if ip >= code_len || !starts[ip] {
                    return false;
                }
                match seen[ip] {
                    // Paths joining at one instruction must agree on depth.
                    Some(recorded) => {
                        if recorded != depth {
                            return false;
                        }
                        break;
                    }
                    None => seen[ip] = Some(depth),
                }

                let op = match OpCode::from_byte(self.chunk.code_byte(ip)) {
                    Some(op) => op,
                    None => return false,
                };
                let next = match self.next_ip(op, ip) {
                    Some(next) => next,
                    None => return false,
                };

                depth += op.stack_effect() as i64;
                // Call-shaped opcodes also consume their arguments; the
                // count lives in the operand byte, not the effect table.
                match op {
                    OpCode::Call | OpCode::Invoke => {
                        depth -= self.chunk.code_byte(ip + 1) as i64;
                    }
                    OpCode::InvokeSuper => {
                        depth -= self.chunk.code_byte(ip + 1) as i64 + 1;
                    }
                    _ => {}
                }
                if op == OpCode::Return {
                    depth -= 1;
                    if depth < 0 {
                        return false;
                    }
                    if next == code_len && depth != 0 {
                        return false;
                    }
                    break;
                }
                if depth < 0 || depth > STACK_SIZE as i64 {
                    return false;
                }

                match op {
                    OpCode::Jump => ip = next + self.jump_offset(ip),
                    OpCode::JumpIfFalse => {
                        work.push((next + self.jump_offset(ip), depth));
                        ip = next;
                    }
                    OpCode::Loop => {
                        ip = match next.checked_sub(self.jump_offset(ip)) {
                            Some(target) => target,
                            None => return false,
                        };
                    }
                    _ => ip = next,
                }
            }
        }
        true
    }
}
