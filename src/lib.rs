//! A bytecode virtual machine for a small class-based scripting
//! language. Source text is scanned and compiled straight to bytecode
//! chunks, which a stack machine executes over a mark-sweep heap.
//! Chunks can also be verified, constant-folded, and serialized to a
//! binary format for later execution.

pub mod call_frame;
pub mod checker;
pub mod chunk;
pub mod chunk_io;
pub mod compiler;
pub mod constants;
pub mod debug;
pub mod error;
pub mod heap;
pub mod natives;
pub mod object;
pub mod optimizer;
pub mod scanner;
pub mod value;
pub mod vm;

pub use checker::ChunkChecker;
pub use chunk::{Chunk, OpCode};
pub use chunk_io::{read_chunk, ChunkWriter};
pub use compiler::{compile, CollectingReporter, ErrorReporter};
pub use error::{ChunkReadError, ChunkWriteError, ErrorKind, RuntimeError};
pub use heap::{GcStats, Heap, ObjRef};
pub use optimizer::{optimize_closure, ChunkOptimizer};
pub use value::Value;
pub use vm::Vm;
