use crate::heap::ObjRef;

/// One activation record: the closure being executed, the instruction
/// pointer into its chunk, and the operand-stack index where its callee
/// slot (and then its arguments) begin. Frames live only on the VM's
/// frame stack.
#[derive(Debug, Clone, Copy)]
pub struct CallFrame {
    pub closure: ObjRef,
    pub ip: usize,
    pub slots: usize,
}

impl CallFrame {
    pub fn new(closure: ObjRef, slots: usize) -> Self {
        Self { closure, ip: 0, slots }
    }
}
