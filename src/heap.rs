//! The object heap: an arena of slots addressed by `ObjRef` handles, and
//! the mark-sweep collector that reclaims them. The VM owns the roots;
//! collection is driven from `Vm::collect_garbage`, which marks roots and
//! then calls [`Heap::trace_references`] and [`Heap::sweep`].

use crate::constants::{GC_FIRST_THRESHOLD, GC_GROW_FACTOR};
use crate::error::ErrorKind;
use crate::object::{
    BoundMethod, Class, Closure, Instance, Native, Obj, ObjKind, ObjectType, Str, UpvalueState,
};
use crate::value::{format_double, PrintFlags, Value};

#[cfg(feature = "gc_debug")]
macro_rules! gc_trace {
    ($($arg:tt)*) => { eprintln!($($arg)*) };
}

#[cfg(not(feature = "gc_debug"))]
macro_rules! gc_trace {
    ($($arg:tt)*) => {};
}

pub(crate) use gc_trace;

/// Non-owning handle to a heap object. Valid only within the `Vm` whose
/// heap allocated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

impl ObjRef {
    #[inline(always)]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Counters for the collector, exposed for tests and `gc_debug` logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    pub cycles: usize,
    pub total_freed_objects: usize,
    pub total_freed_bytes: usize,
    pub last_freed_objects: usize,
    pub last_freed_bytes: usize,
}

pub struct Heap {
    slots: Vec<Option<Obj>>,
    free: Vec<u32>,
    gray: Vec<ObjRef>,
    enabled: bool,
    stress: bool,
    bytes_allocated: usize,
    next_threshold: usize,
    stats: GcStats,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            gray: Vec::new(),
            enabled: false,
            stress: false,
            bytes_allocated: 0,
            next_threshold: GC_FIRST_THRESHOLD,
            stats: GcStats::default(),
        }
    }

    /// Collection stays off during compilation; the VM turns it on around
    /// script execution.
    pub fn set_gc_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Stress mode collects on every allocation instead of waiting for
    /// the byte threshold.
    pub fn set_gc_stress(&mut self, stress: bool) {
        self.stress = stress;
    }

    pub fn should_collect(&self) -> bool {
        self.enabled && (self.stress || self.bytes_allocated > self.next_threshold)
    }

    pub fn alloc(&mut self, kind: ObjKind) -> ObjRef {
        self.bytes_allocated += kind.heap_size();
        let obj = Obj::new(kind);
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(obj);
                ObjRef(index)
            }
            None => {
                self.slots.push(Some(obj));
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        match &self.slots[r.index()] {
            Some(obj) => obj,
            None => panic!("dangling object handle {:?}", r),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        match &mut self.slots[r.index()] {
            Some(obj) => obj,
            None => panic!("dangling object handle {:?}", r),
        }
    }

    #[inline(always)]
    pub fn kind(&self, r: ObjRef) -> &ObjKind {
        &self.get(r).kind
    }

    pub fn type_tag(&self, r: ObjRef) -> ObjectType {
        self.kind(r).type_tag()
    }

    // Typed views. The panicking variants are for handles the VM created
    // with a known kind; the `try_` variants surface WrongObjectType for
    // values that came off the operand stack.

    pub fn str_text(&self, r: ObjRef) -> &str {
        match self.kind(r) {
            ObjKind::Str(s) => &s.text,
            other => panic!("expected string, found {}", other.type_tag()),
        }
    }

    pub fn str_hash(&self, r: ObjRef) -> u32 {
        match self.kind(r) {
            ObjKind::Str(s) => s.hash,
            other => panic!("expected string, found {}", other.type_tag()),
        }
    }

    pub fn try_str(&self, r: ObjRef) -> Result<&Str, ErrorKind> {
        match self.kind(r) {
            ObjKind::Str(s) => Ok(s),
            _ => Err(self.wrong_object_type(r, ObjectType::String)),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &Closure {
        match self.kind(r) {
            ObjKind::Closure(c) => c,
            other => panic!("expected closure, found {}", other.type_tag()),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut Closure {
        match &mut self.get_mut(r).kind {
            ObjKind::Closure(c) => c,
            other => panic!("expected closure, found {}", other.type_tag()),
        }
    }

    pub fn native(&self, r: ObjRef) -> &Native {
        match self.kind(r) {
            ObjKind::Native(n) => n,
            other => panic!("expected native, found {}", other.type_tag()),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> UpvalueState {
        match self.kind(r) {
            ObjKind::Upvalue(state) => *state,
            other => panic!("expected upvalue, found {}", other.type_tag()),
        }
    }

    pub fn set_upvalue(&mut self, r: ObjRef, state: UpvalueState) {
        match &mut self.get_mut(r).kind {
            ObjKind::Upvalue(slot) => *slot = state,
            other => panic!("expected upvalue, found {}", other.type_tag()),
        }
    }

    pub fn class(&self, r: ObjRef) -> &Class {
        match self.kind(r) {
            ObjKind::Class(c) => c,
            other => panic!("expected class, found {}", other.type_tag()),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut Class {
        match &mut self.get_mut(r).kind {
            ObjKind::Class(c) => c,
            other => panic!("expected class, found {}", other.type_tag()),
        }
    }

    pub fn try_class(&self, r: ObjRef) -> Result<&Class, ErrorKind> {
        match self.kind(r) {
            ObjKind::Class(c) => Ok(c),
            _ => Err(self.wrong_object_type(r, ObjectType::Class)),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &Instance {
        match self.kind(r) {
            ObjKind::Instance(i) => i,
            other => panic!("expected instance, found {}", other.type_tag()),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut Instance {
        match &mut self.get_mut(r).kind {
            ObjKind::Instance(i) => i,
            other => panic!("expected instance, found {}", other.type_tag()),
        }
    }

    pub fn try_instance(&self, r: ObjRef) -> Result<&Instance, ErrorKind> {
        match self.kind(r) {
            ObjKind::Instance(i) => Ok(i),
            _ => Err(self.wrong_object_type(r, ObjectType::Instance)),
        }
    }

    pub fn bound_method(&self, r: ObjRef) -> &BoundMethod {
        match self.kind(r) {
            ObjKind::BoundMethod(b) => b,
            other => panic!("expected bound method, found {}", other.type_tag()),
        }
    }

    fn wrong_object_type(&self, r: ObjRef, expected: ObjectType) -> ErrorKind {
        ErrorKind::WrongObjectType {
            got: self.format_object(r, PrintFlags::Raw),
            expected,
        }
    }

    // Marking. Idempotent: a marked object is never grayed again, which
    // is what terminates tracing on cyclic graphs.

    pub fn mark_object(&mut self, r: ObjRef) {
        let obj = self.get_mut(r);
        if obj.marked {
            return;
        }
        obj.marked = true;
        self.gray.push(r);
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    /// Drains the gray worklist, marking each object's children.
    pub fn trace_references(&mut self) {
        let mut children = Vec::new();
        while let Some(r) = self.gray.pop() {
            children.clear();
            self.collect_children(r, &mut children);
            for &child in &children {
                self.mark_object(child);
            }
        }
    }

    fn collect_children(&self, r: ObjRef, out: &mut Vec<ObjRef>) {
        match self.kind(r) {
            ObjKind::Str(_) => {}
            ObjKind::Closure(c) => {
                out.push(c.name);
                out.extend_from_slice(&c.upvalues);
                for value in c.chunk.constants() {
                    if let Value::Obj(child) = value {
                        out.push(*child);
                    }
                }
            }
            ObjKind::Native(n) => out.push(n.name),
            ObjKind::Upvalue(UpvalueState::Closed(value)) => {
                if let Value::Obj(child) = value {
                    out.push(*child);
                }
            }
            // An open upvalue points at a stack slot; the stack is a root.
            ObjKind::Upvalue(UpvalueState::Open(_)) => {}
            ObjKind::Class(c) => {
                out.push(c.name);
                for (&name, &method) in &c.methods {
                    out.push(name);
                    out.push(method);
                }
            }
            ObjKind::Instance(i) => {
                out.push(i.class);
                for (&name, &value) in &i.fields {
                    out.push(name);
                    if let Value::Obj(child) = value {
                        out.push(child);
                    }
                }
            }
            ObjKind::BoundMethod(b) => {
                out.push(b.receiver);
                out.push(b.method);
            }
        }
    }

    /// Frees every unmarked object and clears the marks on survivors.
    /// Dropping a slot never touches other slots; child handles are bare
    /// indices.
    pub fn sweep(&mut self) {
        let mut freed_objects = 0;
        let mut freed_bytes = 0;
        for index in 0..self.slots.len() {
            let keep = match &mut self.slots[index] {
                Some(obj) if obj.marked => {
                    obj.marked = false;
                    true
                }
                Some(_) => false,
                None => true,
            };
            if !keep {
                if let Some(obj) = self.slots[index].take() {
                    freed_bytes += obj.kind.heap_size();
                    freed_objects += 1;
                    gc_trace!("gc: free slot {} ({})", index, obj.kind.type_tag());
                    self.free.push(index as u32);
                }
            }
        }
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed_bytes);
        self.next_threshold =
            (self.bytes_allocated * GC_GROW_FACTOR).max(GC_FIRST_THRESHOLD);
        self.stats.cycles += 1;
        self.stats.last_freed_objects = freed_objects;
        self.stats.last_freed_bytes = freed_bytes;
        self.stats.total_freed_objects += freed_objects;
        self.stats.total_freed_bytes += freed_bytes;
        gc_trace!(
            "gc: cycle {} freed {} objects / {} bytes, {} bytes live",
            self.stats.cycles,
            freed_objects,
            freed_bytes,
            self.bytes_allocated
        );
    }

    pub fn stats(&self) -> GcStats {
        self.stats
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    // Printing lives here because rendering an object means chasing
    // handles back into the heap.

    pub fn format_value(&self, value: Value, flags: PrintFlags) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Double(d) => format_double(d),
            Value::Obj(r) => self.format_object(r, flags),
        }
    }

    pub fn format_object(&self, r: ObjRef, flags: PrintFlags) -> String {
        match self.kind(r) {
            ObjKind::Str(s) => match flags {
                PrintFlags::Raw => format!("\"{}\"", s.text),
                PrintFlags::Pretty => s.text.clone(),
            },
            ObjKind::Closure(c) => {
                let name = self.str_text(c.name);
                if name.is_empty() {
                    "<script>".to_string()
                } else {
                    format!("<fn {}>", name)
                }
            }
            ObjKind::Native(n) => format!("<native fn {}>", self.str_text(n.name)),
            ObjKind::Upvalue(_) => "<upvalue>".to_string(),
            ObjKind::Class(c) => format!("<class {}>", self.str_text(c.name)),
            ObjKind::Instance(i) => {
                format!("<{} instance>", self.str_text(self.class(i.class).name))
            }
            ObjKind::BoundMethod(b) => self.format_object(b.method, flags),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::hash_str;
    use std::collections::HashMap;

    fn alloc_str(heap: &mut Heap, text: &str) -> ObjRef {
        heap.alloc(ObjKind::Str(Str { text: text.to_string(), hash: hash_str(text) }))
    }

    #[test]
    fn sweep_frees_unmarked_objects() {
        let mut heap = Heap::new();
        let kept = alloc_str(&mut heap, "kept");
        let _dropped = alloc_str(&mut heap, "dropped");
        assert_eq!(heap.live_objects(), 2);

        heap.mark_object(kept);
        heap.trace_references();
        heap.sweep();

        assert_eq!(heap.live_objects(), 1);
        assert_eq!(heap.str_text(kept), "kept");
        assert_eq!(heap.stats().last_freed_objects, 1);
    }

    #[test]
    fn tracing_terminates_on_cycles() {
        let mut heap = Heap::new();
        let name = alloc_str(&mut heap, "Node");
        let class = heap.alloc(ObjKind::Class(Class { name, methods: HashMap::new() }));
        let instance =
            heap.alloc(ObjKind::Instance(Instance { class, fields: HashMap::new() }));
        let field = alloc_str(&mut heap, "next");
        // Point the instance at itself.
        heap.instance_mut(instance).fields.insert(field, Value::Obj(instance));

        heap.mark_object(instance);
        heap.trace_references();
        heap.sweep();

        assert_eq!(heap.live_objects(), 4);

        // No roots this time: the whole cycle goes away.
        heap.trace_references();
        heap.sweep();
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn repeated_collection_without_allocations_is_a_noop() {
        let mut heap = Heap::new();
        let root = alloc_str(&mut heap, "root");
        for _ in 0..3 {
            heap.mark_object(root);
            heap.trace_references();
            heap.sweep();
            assert_eq!(heap.live_objects(), 1);
        }
        assert_eq!(heap.stats().total_freed_objects, 0);
    }

    #[test]
    fn freed_slots_are_recycled() {
        let mut heap = Heap::new();
        let first = alloc_str(&mut heap, "a");
        heap.trace_references();
        heap.sweep();
        let second = alloc_str(&mut heap, "b");
        assert_eq!(first, second);
        assert_eq!(heap.str_text(second), "b");
    }

    #[test]
    fn marking_is_idempotent() {
        let mut heap = Heap::new();
        let r = alloc_str(&mut heap, "once");
        heap.mark_object(r);
        heap.mark_object(r);
        assert_eq!(heap.gray.len(), 1);
    }

    #[test]
    fn stress_mode_requests_collection_when_enabled() {
        let mut heap = Heap::new();
        heap.set_gc_stress(true);
        assert!(!heap.should_collect());
        heap.set_gc_enabled(true);
        assert!(heap.should_collect());
    }
}
