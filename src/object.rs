use std::collections::HashMap;

use strum_macros::Display;

use crate::chunk::Chunk;
use crate::error::ErrorKind;
use crate::heap::ObjRef;
use crate::value::Value;
use crate::vm::Vm;

/// Object type tags. The discriminants are part of the serialized chunk
/// format, so the order is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum ObjectType {
    String = 0,
    Closure = 1,
    Native = 2,
    Upvalue = 3,
    Class = 4,
    Instance = 5,
    BoundMethod = 6,
}

impl ObjectType {
    pub fn from_tag(tag: u64) -> Option<ObjectType> {
        match tag {
            0 => Some(ObjectType::String),
            1 => Some(ObjectType::Closure),
            2 => Some(ObjectType::Native),
            3 => Some(ObjectType::Upvalue),
            4 => Some(ObjectType::Class),
            5 => Some(ObjectType::Instance),
            6 => Some(ObjectType::BoundMethod),
            _ => None,
        }
    }
}

/// Host function signature. Receives the VM and the argument window that
/// was on the operand stack; returns the single result value.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, ErrorKind>;

/// An interned string: immutable text plus its FNV-1a hash, computed once
/// at allocation and reused by the intern table.
#[derive(Debug)]
pub struct Str {
    pub text: String,
    pub hash: u32,
}

pub fn hash_str(text: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in text.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[derive(Debug)]
pub struct Closure {
    pub name: ObjRef,
    pub arity: usize,
    pub chunk: Chunk,
    pub upvalues: Vec<ObjRef>,
}

#[derive(Debug)]
pub struct Native {
    pub name: ObjRef,
    pub arity: usize,
    pub function: NativeFn,
}

/// An upvalue is open while its variable still lives on the operand stack
/// and closed once that slot is copied out. The transition is one-way.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct Class {
    pub name: ObjRef,
    pub methods: HashMap<ObjRef, ObjRef>,
}

#[derive(Debug)]
pub struct Instance {
    pub class: ObjRef,
    pub fields: HashMap<ObjRef, Value>,
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: ObjRef,
    pub method: ObjRef,
}

/// The closed sum of every heap object kind.
#[derive(Debug)]
pub enum ObjKind {
    Str(Str),
    Closure(Closure),
    Native(Native),
    Upvalue(UpvalueState),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
}

impl ObjKind {
    pub fn type_tag(&self) -> ObjectType {
        match self {
            ObjKind::Str(_) => ObjectType::String,
            ObjKind::Closure(_) => ObjectType::Closure,
            ObjKind::Native(_) => ObjectType::Native,
            ObjKind::Upvalue(_) => ObjectType::Upvalue,
            ObjKind::Class(_) => ObjectType::Class,
            ObjKind::Instance(_) => ObjectType::Instance,
            ObjKind::BoundMethod(_) => ObjectType::BoundMethod,
        }
    }

    /// Approximate heap footprint, used for the collection threshold.
    pub fn heap_size(&self) -> usize {
        let payload = match self {
            ObjKind::Str(s) => s.text.capacity(),
            ObjKind::Closure(c) => {
                c.chunk.code_len() * 9
                    + c.chunk.constants_len() * std::mem::size_of::<Value>()
                    + c.upvalues.capacity() * std::mem::size_of::<ObjRef>()
            }
            ObjKind::Native(_) => 0,
            ObjKind::Upvalue(_) => 0,
            ObjKind::Class(c) => c.methods.len() * std::mem::size_of::<(ObjRef, ObjRef)>(),
            ObjKind::Instance(i) => i.fields.len() * std::mem::size_of::<(ObjRef, Value)>(),
            ObjKind::BoundMethod(_) => 0,
        };
        std::mem::size_of::<Obj>() + payload
    }
}

/// A heap cell: the collector's mark bit plus the object payload.
#[derive(Debug)]
pub struct Obj {
    pub marked: bool,
    pub kind: ObjKind,
}

impl Obj {
    pub fn new(kind: ObjKind) -> Self {
        Self { marked: false, kind }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_hash_is_stable() {
        assert_eq!(hash_str(""), 2166136261);
        assert_eq!(hash_str("hello"), hash_str("hello"));
        assert_ne!(hash_str("hello"), hash_str("world"));
    }

    #[test]
    fn object_type_tags_round_trip() {
        for tag in 0..7 {
            let ty = ObjectType::from_tag(tag).unwrap();
            assert_eq!(ty as u64, tag);
        }
        assert!(ObjectType::from_tag(7).is_none());
    }
}
