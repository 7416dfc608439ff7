//! Binary chunk serialization. All counts, lines, and type tags are
//! 64-bit little-endian; code bytes carry their line inline so a chunk
//! round-trips with full line information. Only string objects may
//! appear among serialized constants; strings are re-interned through
//! the VM on read so handle identity holds in the new heap.

use std::io::{Read, Write};

use crate::chunk::Chunk;
use crate::error::{ChunkReadError, ChunkWriteError};
use crate::heap::Heap;
use crate::object::ObjectType;
use crate::value::Value;
use crate::vm::Vm;

const TAG_NIL: u64 = 0;
const TAG_BOOL: u64 = 1;
const TAG_DOUBLE: u64 = 2;
const TAG_OBJECT: u64 = 3;

pub struct ChunkWriter<'a> {
    heap: &'a Heap,
    chunk: &'a Chunk,
}

impl<'a> ChunkWriter<'a> {
    pub fn new(heap: &'a Heap, chunk: &'a Chunk) -> Self {
        Self { heap, chunk }
    }

    pub fn write<W: Write>(&self, out: &mut W) -> Result<(), ChunkWriteError> {
        self.write_code(out)?;
        self.write_constants(out)
    }

    fn write_code<W: Write>(&self, out: &mut W) -> Result<(), ChunkWriteError> {
        write_u64(out, self.chunk.code_len() as u64)?;
        for i in 0..self.chunk.code_len() {
            out.write_all(&[self.chunk.code_byte(i)])?;
            write_u64(out, self.chunk.code_line(i) as u64)?;
        }
        Ok(())
    }

    fn write_constants<W: Write>(&self, out: &mut W) -> Result<(), ChunkWriteError> {
        write_u64(out, self.chunk.constants_len() as u64)?;
        for i in 0..self.chunk.constants_len() {
            self.write_value(out, self.chunk.constant(i))?;
            write_u64(out, self.chunk.constant_line(i) as u64)?;
        }
        Ok(())
    }

    fn write_value<W: Write>(&self, out: &mut W, value: Value) -> Result<(), ChunkWriteError> {
        match value {
            Value::Nil => write_u64(out, TAG_NIL)?,
            Value::Bool(b) => {
                write_u64(out, TAG_BOOL)?;
                write_u64(out, b as u64)?;
            }
            Value::Double(d) => {
                write_u64(out, TAG_DOUBLE)?;
                out.write_all(&d.to_le_bytes())?;
            }
            Value::Obj(r) => {
                write_u64(out, TAG_OBJECT)?;
                let tag = self.heap.type_tag(r);
                if tag != ObjectType::String {
                    return Err(ChunkWriteError::UnsupportedConstant(tag));
                }
                write_u64(out, tag as u64)?;
                let text = self.heap.str_text(r);
                write_u64(out, text.len() as u64)?;
                out.write_all(text.as_bytes())?;
            }
        }
        Ok(())
    }
}

/// Decodes one chunk from the stream. A short read, an unknown tag, or
/// a malformed string aborts the whole read; no partial chunk escapes.
pub fn read_chunk<R: Read>(vm: &mut Vm, input: &mut R) -> Result<Chunk, ChunkReadError> {
    let mut chunk = Chunk::new();

    let code_len = read_u64(input)?;
    for _ in 0..code_len {
        let byte = read_byte(input)?;
        let line = read_u64(input)? as usize;
        chunk.write_byte(byte, line);
    }

    let constants_len = read_u64(input)?;
    for _ in 0..constants_len {
        let value = read_value(vm, input)?;
        let line = read_u64(input)? as usize;
        chunk.add_constant(value, line);
    }

    Ok(chunk)
}

fn read_value<R: Read>(vm: &mut Vm, input: &mut R) -> Result<Value, ChunkReadError> {
    match read_u64(input)? {
        TAG_NIL => Ok(Value::Nil),
        TAG_BOOL => Ok(Value::Bool(read_u64(input)? != 0)),
        TAG_DOUBLE => {
            let mut buf = [0u8; 8];
            read_exact(input, &mut buf)?;
            Ok(Value::Double(f64::from_le_bytes(buf)))
        }
        TAG_OBJECT => read_object(vm, input),
        tag => Err(ChunkReadError::UnknownValueTag(tag)),
    }
}

fn read_object<R: Read>(vm: &mut Vm, input: &mut R) -> Result<Value, ChunkReadError> {
    let tag = read_u64(input)?;
    match ObjectType::from_tag(tag) {
        Some(ObjectType::String) => {
            // The declared length is untrusted; never size an
            // allocation from it.
            let len = read_u64(input)?;
            let mut bytes = Vec::new();
            input
                .take(len)
                .read_to_end(&mut bytes)
                .map_err(ChunkReadError::Io)?;
            if (bytes.len() as u64) < len {
                return Err(ChunkReadError::ShortRead);
            }
            let text = String::from_utf8(bytes).map_err(|_| ChunkReadError::BadString)?;
            Ok(Value::Obj(vm.intern_string(&text)))
        }
        _ => Err(ChunkReadError::UnknownObjectTag(tag)),
    }
}

fn write_u64<W: Write>(out: &mut W, value: u64) -> std::io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

fn read_u64<R: Read>(input: &mut R) -> Result<u64, ChunkReadError> {
    let mut buf = [0u8; 8];
    read_exact(input, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_byte<R: Read>(input: &mut R) -> Result<u8, ChunkReadError> {
    let mut buf = [0u8; 1];
    read_exact(input, &mut buf)?;
    Ok(buf[0])
}

fn read_exact<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<(), ChunkReadError> {
    input.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ChunkReadError::ShortRead
        } else {
            ChunkReadError::Io(e)
        }
    })
}
