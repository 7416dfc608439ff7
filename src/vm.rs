//! The virtual machine: one fetch-decode-execute loop over the topmost
//! call frame. Opcode handlers return `Result<(), ErrorKind>`; the run
//! loop is the single unwind point that turns an `ErrorKind` into a
//! `RuntimeError` with position and stack trace, resetting both stacks.

use std::collections::HashMap;
use std::io::Write;
use std::time::Instant;

use crate::call_frame::CallFrame;
use crate::chunk::OpCode;
use crate::constants::{MAX_FRAMES, STACK_SIZE};
use crate::error::{ErrorKind, RuntimeError, TraceFrame};
use crate::heap::{gc_trace, GcStats, Heap, ObjRef};
use crate::object::{
    hash_str, BoundMethod, Class, Instance, Native, NativeFn, ObjKind, ObjectType, Str,
    UpvalueState,
};
use crate::value::{PrintFlags, Value, ValueKind};

pub struct Vm {
    heap: Heap,
    stack: Box<[Value]>,
    stack_top: usize,
    frames: Vec<CallFrame>,
    globals: HashMap<ObjRef, Value>,
    /// Intern buckets keyed by the string's precomputed hash.
    interns: HashMap<u32, Vec<ObjRef>>,
    /// Open upvalues, sorted by decreasing stack slot.
    open_upvalues: Vec<ObjRef>,
    init_string: ObjRef,
    output: Box<dyn Write>,
    start_time: Instant,
    running: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(std::io::stdout()))
    }

    /// Builds a VM whose `print` statements write to `output`.
    pub fn with_output(output: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let mut interns = HashMap::new();
        let init_string = intern_in(&mut heap, &mut interns, "init");
        let mut vm = Self {
            heap,
            stack: vec![Value::Nil; STACK_SIZE].into_boxed_slice(),
            stack_top: 0,
            frames: Vec::with_capacity(MAX_FRAMES),
            globals: HashMap::new(),
            interns,
            open_upvalues: Vec::new(),
            init_string,
            output,
            start_time: Instant::now(),
            running: false,
        };
        crate::natives::install(&mut vm);
        vm
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn gc_stats(&self) -> GcStats {
        self.heap.stats()
    }

    pub fn set_gc_stress(&mut self, stress: bool) {
        self.heap.set_gc_stress(stress);
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    // Allocation. Collects first when the heap asks for it, so every
    // object a new allocation will reference must already be rooted.

    pub fn allocate(&mut self, kind: ObjKind) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(kind)
    }

    /// Returns the single live `Str` for `text`, allocating it on first
    /// use. Interned strings compare equal exactly when their handles do.
    pub fn intern_string(&mut self, text: &str) -> ObjRef {
        let hash = hash_str(text);
        if let Some(bucket) = self.interns.get(&hash) {
            for &r in bucket {
                if self.heap.str_text(r) == text {
                    return r;
                }
            }
        }
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        let r = self.heap.alloc(ObjKind::Str(Str { text: text.to_string(), hash }));
        self.interns.entry(hash).or_default().push(r);
        r
    }

    /// Registers a host function as a global.
    pub fn define_native(&mut self, name: &str, arity: usize, function: NativeFn) {
        let name_ref = self.intern_string(name);
        let native = self.allocate(ObjKind::Native(Native { name: name_ref, arity, function }));
        self.globals.insert(name_ref, Value::Obj(native));
    }

    // Garbage collection. The VM owns every root: operand stack, frame
    // closures, globals, interned strings, open upvalues, "init".

    pub fn collect_garbage(&mut self) {
        gc_trace!("gc: collecting, {} bytes allocated", self.heap.bytes_allocated());
        for index in 0..self.stack_top {
            self.heap.mark_value(self.stack[index]);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        for (&name, &value) in &self.globals {
            self.heap.mark_object(name);
            self.heap.mark_value(value);
        }
        for bucket in self.interns.values() {
            for &r in bucket {
                self.heap.mark_object(r);
            }
        }
        for &upvalue in &self.open_upvalues {
            self.heap.mark_object(upvalue);
        }
        self.heap.mark_object(self.init_string);
        self.heap.trace_references();
        self.heap.sweep();
    }

    // Execution.

    /// Runs a compiled script closure to completion. The script's own
    /// result is discarded. Collection is enabled only for the duration.
    pub fn run_script(&mut self, script: ObjRef) -> Result<(), RuntimeError> {
        self.heap.set_gc_enabled(true);
        let result = self.run(script);
        self.heap.set_gc_enabled(false);
        result
    }

    fn run(&mut self, script: ObjRef) -> Result<(), RuntimeError> {
        self.stack_top = 0;
        self.frames.clear();
        self.open_upvalues.clear();

        if let Err(kind) = self
            .push(Value::Obj(script))
            .and_then(|_| self.call_closure(script, 0))
        {
            return Err(self.unwind(kind));
        }

        self.running = true;
        while self.running {
            #[cfg(feature = "debug_trace_execution")]
            self.trace_execution();

            if let Err(kind) = self.step() {
                return Err(self.unwind(kind));
            }
        }
        Ok(())
    }

    fn step(&mut self) -> Result<(), ErrorKind> {
        {
            let frame = self.frames.last().ok_or(ErrorKind::StackUnderflow)?;
            let chunk = &self.heap.closure(frame.closure).chunk;
            if frame.ip >= chunk.code_len() {
                self.running = false;
                return Ok(());
            }
        }
        let byte = self.read_byte()?;
        let op = OpCode::from_byte(byte).ok_or(ErrorKind::UnknownInstruction(byte))?;
        self.execute(op)
    }

    fn execute(&mut self, op: OpCode) -> Result<(), ErrorKind> {
        match op {
            OpCode::PushConstant => {
                let constant = self.read_constant()?;
                self.push(constant)
            }
            OpCode::Print => {
                let value = self.pop()?;
                let text = self.heap.format_value(value, PrintFlags::Pretty);
                writeln!(self.output, "{}", text)
                    .map_err(|e| ErrorKind::Runtime(e.to_string()))
            }
            OpCode::Add
            | OpCode::Subtract
            | OpCode::Multiply
            | OpCode::Divide
            | OpCode::Greater
            | OpCode::Less
            | OpCode::Equal => {
                let b = self.pop()?;
                let a = self.pop()?;
                let result = self.fold_binary(op, a, b)?;
                self.push(result)
            }
            OpCode::Return => self.execute_return(),
            OpCode::Nil => self.push(Value::Nil),
            OpCode::True => self.push(Value::Bool(true)),
            OpCode::False => self.push(Value::Bool(false)),
            OpCode::Not | OpCode::Negate => {
                let value = self.pop()?;
                let result = self.fold_unary(op, value)?;
                self.push(result)
            }
            OpCode::Pop => self.pop().map(|_| ()),
            OpCode::DefineGlobal => {
                let value = self.pop()?;
                let name = self.read_string()?;
                self.globals.insert(name, value);
                Ok(())
            }
            OpCode::GetGlobal => {
                let name = self.read_string()?;
                let value = self
                    .globals
                    .get(&name)
                    .copied()
                    .ok_or_else(|| self.undefined_variable(name))?;
                self.push(value)
            }
            OpCode::SetGlobal => {
                let name = self.read_string()?;
                let value = self.peek(0)?;
                match self.globals.get_mut(&name) {
                    Some(slot) => {
                        *slot = value;
                        Ok(())
                    }
                    None => Err(self.undefined_variable(name)),
                }
            }
            OpCode::GetLocal => {
                let offset = self.read_byte()? as usize;
                let base = self.frame()?.slots;
                let value = self.stack_get(base + offset)?;
                self.push(value)
            }
            OpCode::SetLocal => {
                let offset = self.read_byte()? as usize;
                let base = self.frame()?.slots;
                let value = self.peek(0)?;
                self.stack_set(base + offset, value)
            }
            OpCode::Jump => {
                let offset = self.read_short()? as usize;
                self.frame_mut()?.ip += offset;
                Ok(())
            }
            OpCode::JumpIfFalse => {
                let offset = self.read_short()? as usize;
                if self.peek(0)?.is_falsey() {
                    self.frame_mut()?.ip += offset;
                }
                Ok(())
            }
            OpCode::Loop => {
                let offset = self.read_short()? as usize;
                let frame = self.frame_mut()?;
                frame.ip = frame
                    .ip
                    .checked_sub(offset)
                    .ok_or_else(|| ErrorKind::Runtime("bad loop offset".to_string()))?;
                Ok(())
            }
            OpCode::Call => {
                let arg_count = self.read_byte()? as usize;
                let callee = self.peek(arg_count)?;
                self.call_value(callee, arg_count)
            }
            OpCode::GetUpvalue => {
                let index = self.read_byte()? as usize;
                let upvalue = self.current_upvalue(index)?;
                let value = match self.heap.upvalue(upvalue) {
                    UpvalueState::Open(slot) => self.stack_get(slot)?,
                    UpvalueState::Closed(value) => value,
                };
                self.push(value)
            }
            OpCode::SetUpvalue => {
                let index = self.read_byte()? as usize;
                let upvalue = self.current_upvalue(index)?;
                let value = self.peek(0)?;
                match self.heap.upvalue(upvalue) {
                    UpvalueState::Open(slot) => self.stack_set(slot, value),
                    UpvalueState::Closed(_) => {
                        self.heap.set_upvalue(upvalue, UpvalueState::Closed(value));
                        Ok(())
                    }
                }
            }
            OpCode::FillUpvalues => self.execute_fill_upvalues(),
            OpCode::CloseUpvalue => {
                if self.stack_top == 0 {
                    return Err(ErrorKind::StackUnderflow);
                }
                self.close_upvalues(self.stack_top - 1)?;
                self.pop().map(|_| ())
            }
            OpCode::Class => {
                let name = self.read_string()?;
                let class = self.allocate(ObjKind::Class(Class {
                    name,
                    methods: HashMap::new(),
                }));
                self.push(Value::Obj(class))
            }
            OpCode::GetProperty => self.execute_get_property(),
            OpCode::SetProperty => self.execute_set_property(),
            OpCode::Method => {
                let name = self.read_string()?;
                let method_val = self.pop()?;
                let method = self.extract_object(method_val, ObjectType::Closure)?;
                let class_val = self.peek(0)?;
                let class = self.extract_object(class_val, ObjectType::Class)?;
                self.heap.class_mut(class).methods.insert(name, method);
                Ok(())
            }
            OpCode::Invoke => {
                let arg_count = self.read_byte()? as usize;
                let name = self.read_string()?;
                self.invoke(name, arg_count)
            }
            OpCode::Inherit => self.execute_inherit(),
            OpCode::GetSuper => self.execute_get_super(),
            OpCode::InvokeSuper => {
                let arg_count = self.read_byte()? as usize;
                let name = self.read_string()?;
                let super_val = self.pop()?;
                let superclass = self.extract_object(super_val, ObjectType::Class)?;
                self.invoke_from_class(superclass, name, arg_count)
            }
        }
    }

    fn execute_return(&mut self) -> Result<(), ErrorKind> {
        let result = self.pop()?;
        let frame = self.frames.pop().ok_or(ErrorKind::StackUnderflow)?;
        if self.frames.is_empty() {
            // Outermost frame: the script's result is discarded.
            self.stack_top = frame.slots;
            self.running = false;
            Ok(())
        } else {
            self.close_upvalues(frame.slots)?;
            self.stack_top = frame.slots;
            self.push(result)
        }
    }

    fn execute_fill_upvalues(&mut self) -> Result<(), ErrorKind> {
        let closure_val = self.peek(0)?;
        let closure = self.extract_object(closure_val, ObjectType::Closure)?;
        let count = self.read_byte()? as usize;

        // Refill from scratch: re-instantiating the same function literal
        // must not accumulate captures from earlier runs.
        self.heap.closure_mut(closure).upvalues.clear();

        for _ in 0..count {
            let is_local = self.read_byte()? != 0;
            let index = self.read_byte()? as usize;
            let upvalue = if is_local {
                let base = self.frame()?.slots;
                self.capture_upvalue(base + index)?
            } else {
                // Transitive capture through the enclosing closure.
                let enclosing = self.frame()?.closure;
                self.heap
                    .closure(enclosing)
                    .upvalues
                    .get(index)
                    .copied()
                    .ok_or_else(|| ErrorKind::Runtime("invalid upvalue index".to_string()))?
            };
            self.heap.closure_mut(closure).upvalues.push(upvalue);
        }
        Ok(())
    }

    fn execute_get_property(&mut self) -> Result<(), ErrorKind> {
        let name = self.read_string()?;
        let receiver = self.peek(0)?;
        let instance = self.extract_object(receiver, ObjectType::Instance)?;

        if let Some(&field) = self.heap.instance(instance).fields.get(&name) {
            self.pop()?;
            return self.push(field);
        }

        let class = self.heap.instance(instance).class;
        let bound = self.bind_method(class, name, instance)?;
        self.pop()?;
        self.push(Value::Obj(bound))
    }

    fn execute_set_property(&mut self) -> Result<(), ErrorKind> {
        let name = self.read_string()?;
        let receiver = self.peek(1)?;
        let instance = self.extract_object(receiver, ObjectType::Instance)?;
        let value = self.peek(0)?;
        self.heap.instance_mut(instance).fields.insert(name, value);
        self.pop()?;
        self.pop()?;
        self.push(value)
    }

    fn execute_inherit(&mut self) -> Result<(), ErrorKind> {
        let child_val = self.peek(0)?;
        let child = self.extract_object(child_val, ObjectType::Class)?;
        let parent_val = self.peek(1)?;
        let parent = self.extract_object(parent_val, ObjectType::Class)?;

        let inherited: Vec<(ObjRef, ObjRef)> = self
            .heap
            .class(parent)
            .methods
            .iter()
            .map(|(&name, &method)| (name, method))
            .collect();
        let methods = &mut self.heap.class_mut(child).methods;
        for (name, method) in inherited {
            // Methods the child already defines win over inherited ones.
            methods.entry(name).or_insert(method);
        }
        self.pop().map(|_| ())
    }

    fn execute_get_super(&mut self) -> Result<(), ErrorKind> {
        let receiver = self.peek(1)?;
        let instance = self.extract_object(receiver, ObjectType::Instance)?;
        let super_val = self.peek(0)?;
        let superclass = self.extract_object(super_val, ObjectType::Class)?;
        let name = self.read_string()?;

        let bound = self.bind_method(superclass, name, instance)?;
        self.pop()?;
        self.pop()?;
        self.push(Value::Obj(bound))
    }

    // Calls.

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), ErrorKind> {
        let r = match callee {
            Value::Obj(r) => r,
            _ => return Err(self.non_callable(callee)),
        };
        match self.heap.type_tag(r) {
            ObjectType::Closure => self.call_closure(r, arg_count),
            ObjectType::Native => self.call_native(r, arg_count),
            ObjectType::Class => self.call_class(r, arg_count),
            ObjectType::BoundMethod => {
                let bound = self.heap.bound_method(r);
                let receiver = bound.receiver;
                let method = bound.method;
                let callee_slot = self.callee_slot(arg_count)?;
                self.stack[callee_slot] = Value::Obj(receiver);
                self.call_closure(method, arg_count)
            }
            _ => Err(self.non_callable(callee)),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, arg_count: usize) -> Result<(), ErrorKind> {
        let arity = self.heap.closure(closure).arity;
        if arity != arg_count {
            return Err(ErrorKind::WrongArgumentsCount { expected: arity, got: arg_count });
        }
        if self.frames.len() == MAX_FRAMES {
            return Err(ErrorKind::StackOverflow);
        }
        let slots = self.callee_slot(arg_count)?;
        self.frames.push(CallFrame::new(closure, slots));
        Ok(())
    }

    fn call_native(&mut self, native: ObjRef, arg_count: usize) -> Result<(), ErrorKind> {
        let arity = self.heap.native(native).arity;
        if arity != arg_count {
            return Err(ErrorKind::WrongArgumentsCount { expected: arity, got: arg_count });
        }
        let callee_slot = self.callee_slot(arg_count)?;
        let function = self.heap.native(native).function;
        let args: Vec<Value> = self.stack[callee_slot + 1..self.stack_top].to_vec();
        let result = function(self, &args)?;
        // The call window is replaced by the single result value.
        self.stack_top = callee_slot;
        self.push(result)
    }

    fn call_class(&mut self, class: ObjRef, arg_count: usize) -> Result<(), ErrorKind> {
        let instance =
            self.allocate(ObjKind::Instance(Instance { class, fields: HashMap::new() }));
        match self.heap.class(class).methods.get(&self.init_string).copied() {
            Some(init) => self.call_closure(init, arg_count)?,
            None if arg_count != 0 => {
                return Err(ErrorKind::WrongArgumentsCount { expected: 0, got: arg_count })
            }
            None => {}
        }
        // The instance takes the callee slot, which is `init`'s slot zero.
        let callee_slot = self.callee_slot(arg_count)?;
        self.stack[callee_slot] = Value::Obj(instance);
        Ok(())
    }

    fn invoke(&mut self, name: ObjRef, arg_count: usize) -> Result<(), ErrorKind> {
        let receiver = self.peek(arg_count)?;
        let instance = self.extract_object(receiver, ObjectType::Instance)?;
        if let Some(&field) = self.heap.instance(instance).fields.get(&name) {
            return self.call_value(field, arg_count);
        }
        let class = self.heap.instance(instance).class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        arg_count: usize,
    ) -> Result<(), ErrorKind> {
        let method = self
            .heap
            .class(class)
            .methods
            .get(&name)
            .copied()
            .ok_or_else(|| self.undefined_property(name))?;
        self.call_closure(method, arg_count)
    }

    fn bind_method(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        receiver: ObjRef,
    ) -> Result<ObjRef, ErrorKind> {
        let method = self
            .heap
            .class(class)
            .methods
            .get(&name)
            .copied()
            .ok_or_else(|| self.undefined_property(name))?;
        Ok(self.allocate(ObjKind::BoundMethod(BoundMethod { receiver, method })))
    }

    // Upvalues.

    fn capture_upvalue(&mut self, slot: usize) -> Result<ObjRef, ErrorKind> {
        let mut insert_at = self.open_upvalues.len();
        for (index, &r) in self.open_upvalues.iter().enumerate() {
            match self.heap.upvalue(r) {
                UpvalueState::Open(open_slot) if open_slot == slot => return Ok(r),
                UpvalueState::Open(open_slot) if open_slot < slot => {
                    insert_at = index;
                    break;
                }
                _ => {}
            }
        }
        let upvalue = self.allocate(ObjKind::Upvalue(UpvalueState::Open(slot)));
        self.open_upvalues.insert(insert_at, upvalue);
        Ok(upvalue)
    }

    /// Closes every open upvalue whose slot is at or above `from_slot`.
    /// Those are exactly the leading entries of the descending list.
    fn close_upvalues(&mut self, from_slot: usize) -> Result<(), ErrorKind> {
        while let Some(&r) = self.open_upvalues.first() {
            match self.heap.upvalue(r) {
                UpvalueState::Open(slot) if slot >= from_slot => {
                    let value = self.stack_get(slot)?;
                    self.heap.set_upvalue(r, UpvalueState::Closed(value));
                    self.open_upvalues.remove(0);
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn current_upvalue(&self, index: usize) -> Result<ObjRef, ErrorKind> {
        let closure = self.frame()?.closure;
        self.heap
            .closure(closure)
            .upvalues
            .get(index)
            .copied()
            .ok_or_else(|| ErrorKind::Runtime("invalid upvalue index".to_string()))
    }

    // Folding primitives, shared with the constant-fold optimizer so a
    // fold raises exactly the error the runtime would.

    pub(crate) fn fold_binary(
        &mut self,
        op: OpCode,
        a: Value,
        b: Value,
    ) -> Result<Value, ErrorKind> {
        if op == OpCode::Equal {
            return Ok(Value::Bool(a == b));
        }
        if op == OpCode::Add {
            if let (Some(left), Some(right)) = (self.string_ref(a), self.string_ref(b)) {
                let text =
                    format!("{}{}", self.heap.str_text(left), self.heap.str_text(right));
                let result = self.intern_string(&text);
                return Ok(Value::Obj(result));
            }
        }
        let a = self.as_double(a)?;
        let b = self.as_double(b)?;
        match op {
            OpCode::Add => Ok(Value::Double(a + b)),
            OpCode::Subtract => Ok(Value::Double(a - b)),
            OpCode::Multiply => Ok(Value::Double(a * b)),
            OpCode::Divide => {
                if b == 0.0 {
                    Err(ErrorKind::ZeroDivision)
                } else {
                    Ok(Value::Double(a / b))
                }
            }
            OpCode::Greater => Ok(Value::Bool(a > b)),
            OpCode::Less => Ok(Value::Bool(a < b)),
            _ => Err(ErrorKind::Runtime(format!("{} is not a binary operator", op))),
        }
    }

    pub(crate) fn fold_unary(&mut self, op: OpCode, value: Value) -> Result<Value, ErrorKind> {
        match op {
            OpCode::Not => Ok(Value::Bool(value.is_falsey())),
            OpCode::Negate => Ok(Value::Double(-self.as_double(value)?)),
            _ => Err(ErrorKind::Runtime(format!("{} is not a unary operator", op))),
        }
    }

    // Typed extraction; errors instead of asserting.

    fn as_double(&self, value: Value) -> Result<f64, ErrorKind> {
        match value {
            Value::Double(d) => Ok(d),
            _ => Err(ErrorKind::WrongType {
                got: self.heap.format_value(value, PrintFlags::Raw),
                expected: ValueKind::Double,
            }),
        }
    }

    fn string_ref(&self, value: Value) -> Option<ObjRef> {
        match value {
            Value::Obj(r) if self.heap.type_tag(r) == ObjectType::String => Some(r),
            _ => None,
        }
    }

    fn extract_object(&self, value: Value, expected: ObjectType) -> Result<ObjRef, ErrorKind> {
        match value {
            Value::Obj(r) if self.heap.type_tag(r) == expected => Ok(r),
            _ => Err(ErrorKind::WrongObjectType {
                got: self.heap.format_value(value, PrintFlags::Raw),
                expected,
            }),
        }
    }

    fn undefined_variable(&self, name: ObjRef) -> ErrorKind {
        ErrorKind::UndefinedVariable(self.heap.str_text(name).to_string())
    }

    fn undefined_property(&self, name: ObjRef) -> ErrorKind {
        ErrorKind::UndefinedProperty(self.heap.str_text(name).to_string())
    }

    fn non_callable(&self, value: Value) -> ErrorKind {
        ErrorKind::NonCallable(self.heap.format_value(value, PrintFlags::Raw))
    }

    // Stack and frame plumbing.

    fn push(&mut self, value: Value) -> Result<(), ErrorKind> {
        if self.stack_top == STACK_SIZE {
            return Err(ErrorKind::StackOverflow);
        }
        self.stack[self.stack_top] = value;
        self.stack_top += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, ErrorKind> {
        if self.stack_top == 0 {
            return Err(ErrorKind::StackUnderflow);
        }
        self.stack_top -= 1;
        Ok(self.stack[self.stack_top])
    }

    fn peek(&self, distance: usize) -> Result<Value, ErrorKind> {
        if distance >= self.stack_top {
            return Err(ErrorKind::StackUnderflow);
        }
        Ok(self.stack[self.stack_top - 1 - distance])
    }

    fn callee_slot(&self, arg_count: usize) -> Result<usize, ErrorKind> {
        if arg_count >= self.stack_top {
            return Err(ErrorKind::StackUnderflow);
        }
        Ok(self.stack_top - arg_count - 1)
    }

    /// Absolute-slot access for locals. Bounds-checked against the stack
    /// capacity, not the live top; a bad slot byte is InvalidStackAccess.
    fn stack_get(&self, index: usize) -> Result<Value, ErrorKind> {
        if index >= STACK_SIZE {
            return Err(ErrorKind::InvalidStackAccess);
        }
        Ok(self.stack[index])
    }

    fn stack_set(&mut self, index: usize, value: Value) -> Result<(), ErrorKind> {
        if index >= STACK_SIZE {
            return Err(ErrorKind::InvalidStackAccess);
        }
        self.stack[index] = value;
        Ok(())
    }

    fn frame(&self) -> Result<&CallFrame, ErrorKind> {
        self.frames.last().ok_or(ErrorKind::StackUnderflow)
    }

    fn frame_mut(&mut self) -> Result<&mut CallFrame, ErrorKind> {
        self.frames.last_mut().ok_or(ErrorKind::StackUnderflow)
    }

    fn read_byte(&mut self) -> Result<u8, ErrorKind> {
        let frame = self.frames.last_mut().ok_or(ErrorKind::StackUnderflow)?;
        let chunk = &self.heap.closure(frame.closure).chunk;
        if frame.ip >= chunk.code_len() {
            return Err(ErrorKind::Runtime("read past end of chunk".to_string()));
        }
        let byte = chunk.code_byte(frame.ip);
        frame.ip += 1;
        Ok(byte)
    }

    fn read_short(&mut self) -> Result<u16, ErrorKind> {
        let high = self.read_byte()? as u16;
        let low = self.read_byte()? as u16;
        Ok((high << 8) | low)
    }

    fn read_constant(&mut self) -> Result<Value, ErrorKind> {
        let index = self.read_byte()? as usize;
        let frame = self.frame()?;
        self.heap
            .closure(frame.closure)
            .chunk
            .try_constant(index)
            .ok_or_else(|| ErrorKind::Runtime(format!("bad constant index {}", index)))
    }

    fn read_string(&mut self) -> Result<ObjRef, ErrorKind> {
        let value = self.read_constant()?;
        self.extract_object(value, ObjectType::String)
    }

    // Error unwinding.

    fn unwind(&mut self, kind: ErrorKind) -> RuntimeError {
        let line = self.current_line();
        let trace = self.make_stack_trace();
        self.stack_top = 0;
        self.frames.clear();
        self.open_upvalues.clear();
        self.running = false;
        RuntimeError { kind, line, trace }
    }

    fn current_line(&self) -> usize {
        self.frames.last().map_or(0, |frame| self.frame_line(frame))
    }

    fn frame_line(&self, frame: &CallFrame) -> usize {
        let chunk = &self.heap.closure(frame.closure).chunk;
        if chunk.code_len() == 0 {
            return 0;
        }
        let ip = frame.ip.saturating_sub(1).min(chunk.code_len() - 1);
        chunk.code_line(ip)
    }

    fn make_stack_trace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .map(|frame| {
                let closure = self.heap.closure(frame.closure);
                let name = self.heap.str_text(closure.name);
                let function = if name.is_empty() {
                    "<script>".to_string()
                } else {
                    name.to_string()
                };
                TraceFrame { function, line: self.frame_line(frame) }
            })
            .collect()
    }

    #[cfg(feature = "debug_trace_execution")]
    fn trace_execution(&self) {
        let mut line = String::new();
        for index in 0..self.stack_top {
            line.push_str(&format!(
                "[ {} ] ",
                self.heap.format_value(self.stack[index], PrintFlags::Raw)
            ));
        }
        if self.stack_top == 0 {
            line.push_str("# empty-stack #");
        }
        eprintln!("{}", line);
        if let Ok(frame) = self.frame() {
            let chunk = &self.heap.closure(frame.closure).chunk;
            if frame.ip < chunk.code_len() {
                crate::debug::disassemble_instruction(&self.heap, chunk, frame.ip);
            }
        }
    }
}

fn intern_in(heap: &mut Heap, interns: &mut HashMap<u32, Vec<ObjRef>>, text: &str) -> ObjRef {
    let hash = hash_str(text);
    if let Some(bucket) = interns.get(&hash) {
        for &r in bucket {
            if heap.str_text(r) == text {
                return r;
            }
        }
    }
    let r = heap.alloc(ObjKind::Str(Str { text: text.to_string(), hash }));
    interns.entry(hash).or_default().push(r);
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, CollectingReporter};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default, Clone)]
    pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

    impl SharedBuffer {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn run(source: &str) -> (String, Result<(), RuntimeError>) {
        run_with(source, false)
    }

    fn run_with(source: &str, stress_gc: bool) -> (String, Result<(), RuntimeError>) {
        let buffer = SharedBuffer::default();
        let mut vm = Vm::with_output(Box::new(buffer.clone()));
        vm.set_gc_stress(stress_gc);
        let mut reporter = CollectingReporter::default();
        let script = compile(&mut vm, &mut reporter, "test", source)
            .unwrap_or_else(|| panic!("compile errors: {:?}", reporter.errors));
        let result = vm.run_script(script);
        (buffer.contents(), result)
    }

    fn expect_output(source: &str, expected: &str) {
        let (output, result) = run(source);
        assert!(result.is_ok(), "unexpected error: {:?}", result);
        assert_eq!(output, expected);
    }

    fn expect_error(source: &str) -> RuntimeError {
        let (_, result) = run(source);
        result.expect_err("expected a runtime error")
    }

    #[test]
    fn prints_arithmetic() {
        expect_output("print 1 + 2 * 3;", "7\n");
        expect_output("print (1 + 2) * 3;", "9\n");
        expect_output("print 10 / 4;", "2.5\n");
        expect_output("print -5 + 3;", "-2\n");
    }

    #[test]
    fn prints_literals_and_comparisons() {
        expect_output("print nil;", "nil\n");
        expect_output("print 2 > 1;", "true\n");
        expect_output("print 2 < 1;", "false\n");
        expect_output("print 1 == 1;", "true\n");
        expect_output("print 1 == \"1\";", "false\n");
        expect_output("print !nil;", "true\n");
    }

    #[test]
    fn concatenates_strings() {
        expect_output("print \"foo\" + \"bar\";", "foobar\n");
        expect_output("var s = \"a\"; s = s + \"b\"; print s;", "ab\n");
    }

    #[test]
    fn zero_is_truthy() {
        expect_output("if (0) { print \"truthy\"; } else { print \"falsey\"; }", "truthy\n");
    }

    #[test]
    fn globals_and_locals() {
        expect_output("var a = 1; { var b = 2; print a + b; }", "3\n");
        expect_output("var a = 1; a = a + 1; print a;", "2\n");
    }

    #[test]
    fn while_loop_with_break_and_continue() {
        expect_output(
            "var i = 0; var sum = 0; \
             while (i < 10) { i = i + 1; if (i == 3) { continue; } \
             if (i > 5) { break; } sum = sum + i; } print sum;",
            "12\n",
        );
    }

    #[test]
    fn functions_return_values() {
        expect_output(
            "fun add(a, b) { return a + b; } print add(2, 3);",
            "5\n",
        );
        expect_output("fun noReturn() {} print noReturn();", "nil\n");
    }

    #[test]
    fn closures_share_an_open_upvalue() {
        expect_output(
            "fun makeCounter() { var i = 0; \
             fun count() { i = i + 1; print i; } return count; } \
             var c = makeCounter(); c(); c(); c();",
            "1\n2\n3\n",
        );
    }

    #[test]
    fn closed_upvalue_sees_last_write_before_return() {
        expect_output(
            "fun outer() { var x = 1; fun inner() { print x; } \
             x = 2; return inner; } outer()();",
            "2\n",
        );
    }

    #[test]
    fn transitive_capture_through_two_levels() {
        expect_output(
            "fun a() { var x = \"x\"; \
             fun b() { fun c() { print x; } return c; } return b; } \
             a()()();",
            "x\n",
        );
    }

    #[test]
    fn classes_fields_and_methods() {
        expect_output(
            "class Point { init(x, y) { this.x = x; this.y = y; } \
             sum() { return this.x + this.y; } } \
             var p = Point(3, 4); print p.sum();",
            "7\n",
        );
        expect_output(
            "class Box {} var b = Box(); b.value = 42; print b.value;",
            "42\n",
        );
    }

    #[test]
    fn bound_methods_remember_their_receiver() {
        expect_output(
            "class Greeter { init(name) { this.name = name; } \
             greet() { print this.name; } } \
             var m = Greeter(\"hi\").greet; m();",
            "hi\n",
        );
    }

    #[test]
    fn subclass_resolves_inherited_method() {
        expect_output(
            "class A { greet() { print \"hello\"; } } \
             class B < A {} \
             B().greet();",
            "hello\n",
        );
    }

    #[test]
    fn subclass_override_wins() {
        expect_output(
            "class A { m() { print \"A\"; } } \
             class B < A { m() { print \"B\"; } } \
             B().m();",
            "B\n",
        );
    }

    #[test]
    fn super_calls_the_parent_method() {
        expect_output(
            "class A { name() { print \"A\"; } } \
             class B < A { name() { super.name(); print \"B\"; } } \
             B().name();",
            "A\nB\n",
        );
    }

    #[test]
    fn interning_gives_identical_handles() {
        let mut vm = Vm::new();
        let a = vm.intern_string("shared");
        let b = vm.intern_string("shared");
        assert_eq!(a, b);
        let c = vm.intern_string("other");
        assert_ne!(a, c);
    }

    #[test]
    fn concatenation_interns_its_result() {
        let mut vm = Vm::new();
        let whole = vm.intern_string("ab");
        let left = Value::Obj(vm.intern_string("a"));
        let right = Value::Obj(vm.intern_string("b"));
        let folded = vm.fold_binary(OpCode::Add, left, right).unwrap();
        assert_eq!(folded, Value::Obj(whole));
    }

    #[test]
    fn division_by_zero_raises_and_prints_nothing() {
        let (output, result) = run("print 6 / 0;");
        assert_eq!(result.unwrap_err().kind, ErrorKind::ZeroDivision);
        assert_eq!(output, "");
    }

    #[test]
    fn adding_number_and_bool_is_a_type_error() {
        let err = expect_error("print 1 + true;");
        assert!(matches!(err.kind, ErrorKind::WrongType { .. }));
    }

    #[test]
    fn undefined_variable_reports_its_name() {
        let err = expect_error("print missing;");
        assert_eq!(err.kind, ErrorKind::UndefinedVariable("missing".to_string()));
    }

    #[test]
    fn undefined_property_reports_its_name() {
        let err = expect_error("class C {} C().nothing();");
        assert_eq!(err.kind, ErrorKind::UndefinedProperty("nothing".to_string()));
    }

    #[test]
    fn calling_a_number_is_non_callable() {
        let err = expect_error("var x = 1; x();");
        assert!(matches!(err.kind, ErrorKind::NonCallable(_)));
    }

    #[test]
    fn arity_mismatch_is_reported() {
        let err = expect_error("fun f(a) {} f();");
        assert_eq!(err.kind, ErrorKind::WrongArgumentsCount { expected: 1, got: 0 });
    }

    #[test]
    fn class_without_init_rejects_arguments() {
        let err = expect_error("class C {} C(1);");
        assert_eq!(err.kind, ErrorKind::WrongArgumentsCount { expected: 0, got: 1 });
    }

    #[test]
    fn deep_recursion_overflows_the_frame_stack() {
        let err = expect_error("fun f() { f(); } f();");
        assert_eq!(err.kind, ErrorKind::StackOverflow);
    }

    #[test]
    fn errors_carry_a_stack_trace() {
        let err = expect_error("fun inner() { return 1 / 0; } \
             fun outer() { return inner(); } outer();");
        assert_eq!(err.kind, ErrorKind::ZeroDivision);
        let names: Vec<&str> = err.trace.iter().map(|f| f.function.as_str()).collect();
        assert_eq!(names, vec!["<script>", "outer", "inner"]);
    }

    #[test]
    fn clock_native_returns_a_small_double() {
        expect_output("print clock() < 1000000;", "true\n");
    }

    #[test]
    fn stress_gc_keeps_programs_correct() {
        let (output, result) = run_with(
            "fun makeAdder(n) { fun add(x) { return x + n; } return add; } \
             var add2 = makeAdder(2); \
             class Pair { init(a, b) { this.a = a; this.b = b; } } \
             var p = Pair(add2(1), \"tail\"); \
             print p.a; print \"head\" + p.b;",
            true,
        );
        assert!(result.is_ok(), "unexpected error: {:?}", result);
        assert_eq!(output, "3\nheadtail\n");
    }

    #[test]
    fn stress_gc_runs_collection_cycles() {
        let buffer = SharedBuffer::default();
        let mut vm = Vm::with_output(Box::new(buffer));
        vm.set_gc_stress(true);
        let mut reporter = CollectingReporter::default();
        let source = "var i = 0; while (i < 50) { var s = \"x\" + \"y\"; i = i + 1; }";
        let script = compile(&mut vm, &mut reporter, "test", source)
            .unwrap_or_else(|| panic!("compile errors: {:?}", reporter.errors));
        vm.run_script(script).unwrap();
        assert!(vm.gc_stats().cycles > 0);
    }

    #[test]
    fn vm_instances_are_isolated() {
        let (first, _) = run("var a = 1; print a;");
        let (second, _) = run("print 2;");
        assert_eq!(first, "1\n");
        assert_eq!(second, "2\n");
    }
}
