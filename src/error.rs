use std::fmt;

use thiserror::Error;

use crate::object::ObjectType;
use crate::value::ValueKind;

/// Every way the runtime can fail. Each variant maps to a distinct
/// process exit code in the driver.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    #[error("stack overflow")]
    StackOverflow,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("invalid stack access")]
    InvalidStackAccess,
    #[error("unknown instruction {0:#04x}")]
    UnknownInstruction(u8),
    #[error("division by zero")]
    ZeroDivision,
    #[error("wrong type: {got} is not a {expected}")]
    WrongType { got: String, expected: ValueKind },
    #[error("wrong object type: {got} is not a {expected}")]
    WrongObjectType { got: String, expected: ObjectType },
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),
    #[error("undefined property '{0}'")]
    UndefinedProperty(String),
    #[error("can only call functions and classes, not {0}")]
    NonCallable(String),
    #[error("expected {expected} arguments but got {got}")]
    WrongArgumentsCount { expected: usize, got: usize },
    #[error("optimizer failure: {0}")]
    OptimizerFailure(String),
    #[error("{0}")]
    Runtime(String),
}

/// One call-stack entry captured when an error unwinds the VM.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    pub function: String,
    pub line: usize,
}

/// A runtime failure with the source line it was raised at and the call
/// stack at that moment, innermost frame last.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub line: usize,
    pub trace: Vec<TraceFrame>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime error: {} [line {}]", self.kind, self.line)?;
        for frame in self.trace.iter().rev() {
            write!(f, "\n  at {} (line {})", frame.function, frame.line)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

impl RuntimeError {
    pub fn new(kind: ErrorKind, line: usize) -> Self {
        Self { kind, line, trace: Vec::new() }
    }
}

/// Failures while decoding a serialized chunk. The reader never returns a
/// partial chunk; the first problem aborts the whole read.
#[derive(Debug, Error)]
pub enum ChunkReadError {
    #[error("unexpected end of chunk stream")]
    ShortRead,
    #[error("unknown value type tag {0}")]
    UnknownValueTag(u64),
    #[error("unknown object type tag {0}")]
    UnknownObjectTag(u64),
    #[error("malformed string payload")]
    BadString,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures while serializing a chunk.
#[derive(Debug, Error)]
pub enum ChunkWriteError {
    #[error("constant type {0} is not serializable")]
    UnsupportedConstant(ObjectType),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages() {
        let kind = ErrorKind::WrongType {
            got: "\"abc\"".to_string(),
            expected: ValueKind::Double,
        };
        assert_eq!(kind.to_string(), "wrong type: \"abc\" is not a Double");
        assert_eq!(
            ErrorKind::UnknownInstruction(0xAB).to_string(),
            "unknown instruction 0xab"
        );
    }

    #[test]
    fn runtime_error_display_includes_trace() {
        let mut err = RuntimeError::new(ErrorKind::ZeroDivision, 3);
        err.trace.push(TraceFrame { function: "<script>".to_string(), line: 1 });
        err.trace.push(TraceFrame { function: "divide".to_string(), line: 3 });
        let text = err.to_string();
        assert!(text.starts_with("runtime error: division by zero [line 3]"));
        assert!(text.contains("at divide (line 3)"));
        assert!(text.contains("at <script> (line 1)"));
    }
}
