use strum_macros::{Display, EnumString};

use crate::value::Value;

/// The seven operand shapes an instruction can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeKind {
    /// No operand bytes.
    Simple,
    /// One byte: constant-pool index.
    Constant,
    /// One byte: local slot, upvalue index, or argument count.
    Byte,
    /// Two bytes, big-endian: forward offset added to the ip.
    Jump,
    /// Two bytes, big-endian: backward offset subtracted from the ip.
    Loop,
    /// One count byte, then (is_local, index) pairs.
    Closure,
    /// One argument-count byte, then one method-name pool index.
    Invoke,
}

macro_rules! define_opcodes {
    ($($name:ident => $kind:ident, $effect:expr;)*) => {
        /// Bytecode operations. The discriminant values are the wire
        /// contract between the compiler, serialized chunks, and the VM,
        /// so the order here is fixed.
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
        pub enum OpCode {
            $($name,)*
        }

        impl OpCode {
            pub fn kind(self) -> OpcodeKind {
                match self {
                    $(OpCode::$name => OpcodeKind::$kind,)*
                }
            }

            /// Net operand-stack effect. Static per opcode, independent of
            /// runtime values; the verifier's depth simulation runs on it.
            pub fn stack_effect(self) -> i32 {
                match self {
                    $(OpCode::$name => $effect,)*
                }
            }
        }

        const OPCODE_ARRAY: [Option<OpCode>; 256] = {
            let mut table: [Option<OpCode>; 256] = [None; 256];
            $(table[OpCode::$name as usize] = Some(OpCode::$name);)*
            table
        };
    };
}

define_opcodes! {
    PushConstant => Constant, 1;
    Print => Simple, -1;
    Add => Simple, -1;
    Subtract => Simple, -1;
    Multiply => Simple, -1;
    Divide => Simple, -1;
    Return => Simple, 0;
    Nil => Simple, 1;
    True => Simple, 1;
    False => Simple, 1;
    Greater => Simple, -1;
    Less => Simple, -1;
    Not => Simple, 0;
    Negate => Simple, 0;
    Equal => Simple, -1;
    Pop => Simple, -1;
    DefineGlobal => Constant, -1;
    GetGlobal => Constant, 1;
    SetGlobal => Constant, 0;
    GetLocal => Byte, 1;
    SetLocal => Byte, 0;
    Jump => Jump, 0;
    JumpIfFalse => Jump, 0;
    Loop => Loop, 0;
    Call => Byte, 0;
    GetUpvalue => Byte, 1;
    SetUpvalue => Byte, 0;
    FillUpvalues => Closure, 0;
    CloseUpvalue => Simple, -1;
    Class => Constant, 1;
    GetProperty => Constant, 0;
    SetProperty => Constant, -1;
    Method => Constant, -1;
    Invoke => Invoke, 0;
    Inherit => Simple, -1;
    GetSuper => Constant, -1;
    InvokeSuper => Invoke, 0;
}

impl OpCode {
    #[inline(always)]
    pub fn from_byte(byte: u8) -> Option<OpCode> {
        OPCODE_ARRAY[byte as usize]
    }

    #[inline(always)]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// True for the opcodes that push a literal without a pool operand.
    pub fn is_literal(self) -> bool {
        matches!(self, OpCode::Nil | OpCode::True | OpCode::False)
    }

    pub fn literal_value(self) -> Option<Value> {
        match self {
            OpCode::Nil => Some(Value::Nil),
            OpCode::True => Some(Value::Bool(true)),
            OpCode::False => Some(Value::Bool(false)),
            _ => None,
        }
    }
}

/// A compiled instruction stream with a parallel source-line table, plus
/// the constant pool with its own line table. Mostly append-only; the
/// optimizer additionally erases and splices instructions in place.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Chunk {
    code: Vec<u8>,
    code_lines: Vec<usize>,
    constants: Vec<Value>,
    constant_lines: Vec<usize>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_byte(&mut self, byte: u8, line: usize) {
        self.code.push(byte);
        self.code_lines.push(line);
    }

    pub fn write_op(&mut self, op: OpCode, line: usize) {
        self.write_byte(op.to_byte(), line);
    }

    #[inline(always)]
    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    #[inline(always)]
    pub fn code_byte(&self, index: usize) -> u8 {
        self.code[index]
    }

    pub fn set_code_byte(&mut self, index: usize, byte: u8) {
        self.code[index] = byte;
    }

    pub fn code_line(&self, index: usize) -> usize {
        self.code_lines[index]
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn insert_code(&mut self, index: usize, byte: u8, line: usize) {
        self.code.insert(index, byte);
        self.code_lines.insert(index, line);
    }

    pub fn erase_code(&mut self, index: usize) {
        self.code.remove(index);
        self.code_lines.remove(index);
    }

    pub fn add_constant(&mut self, value: Value, line: usize) -> usize {
        self.constants.push(value);
        self.constant_lines.push(line);
        self.constants.len() - 1
    }

    #[inline(always)]
    pub fn constants_len(&self) -> usize {
        self.constants.len()
    }

    #[inline(always)]
    pub fn constant(&self, index: usize) -> Value {
        self.constants[index]
    }

    pub fn try_constant(&self, index: usize) -> Option<Value> {
        self.constants.get(index).copied()
    }

    pub fn constant_line(&self, index: usize) -> usize {
        self.constant_lines[index]
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_bytes_round_trip() {
        for byte in 0..=u8::MAX {
            if let Some(op) = OpCode::from_byte(byte) {
                assert_eq!(op.to_byte(), byte);
            }
        }
        assert_eq!(OpCode::from_byte(OpCode::PushConstant.to_byte()), Some(OpCode::PushConstant));
        assert_eq!(OpCode::from_byte(OpCode::InvokeSuper.to_byte()), Some(OpCode::InvokeSuper));
        assert_eq!(OpCode::from_byte(0xFF), None);
    }

    #[test]
    fn opcode_discriminants_are_wire_stable() {
        assert_eq!(OpCode::PushConstant.to_byte(), 0);
        assert_eq!(OpCode::Print.to_byte(), 1);
        assert_eq!(OpCode::Return.to_byte(), 6);
        assert_eq!(OpCode::Pop.to_byte(), 15);
        assert_eq!(OpCode::Jump.to_byte(), 21);
        assert_eq!(OpCode::FillUpvalues.to_byte(), 27);
        assert_eq!(OpCode::InvokeSuper.to_byte(), 36);
    }

    #[test]
    fn write_keeps_lines_parallel() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Return, 2);
        assert_eq!(chunk.code_len(), 2);
        assert_eq!(chunk.code_line(0), 1);
        assert_eq!(chunk.code_line(1), 2);
    }

    #[test]
    fn insert_and_erase_maintain_line_table() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Return, 3);
        chunk.insert_code(1, OpCode::Not.to_byte(), 2);
        assert_eq!(chunk.code_byte(1), OpCode::Not.to_byte());
        assert_eq!(chunk.code_line(1), 2);
        chunk.erase_code(0);
        assert_eq!(chunk.code_byte(0), OpCode::Not.to_byte());
        assert_eq!(chunk.code_line(1), 3);
    }

    #[test]
    fn constants_grow_in_order() {
        let mut chunk = Chunk::new();
        assert_eq!(chunk.add_constant(Value::Double(2.0), 1), 0);
        assert_eq!(chunk.add_constant(Value::Double(3.0), 1), 1);
        assert_eq!(chunk.constant(1), Value::Double(3.0));
        assert_eq!(chunk.try_constant(2), None);
    }
}
