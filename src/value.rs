use strum_macros::Display;

use crate::heap::ObjRef;

/// The runtime value representation. A `Value` is copied freely and never
/// owns heap memory; `Obj` holds a handle into the [`Heap`](crate::heap::Heap)
/// arena.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Double(f64),
    Obj(ObjRef),
}

/// Value tags, used in diagnostics and in the serialized chunk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ValueKind {
    Nil,
    Bool,
    Double,
    Object,
}

impl Value {
    pub fn kind(self) -> ValueKind {
        match self {
            Value::Nil => ValueKind::Nil,
            Value::Bool(_) => ValueKind::Bool,
            Value::Double(_) => ValueKind::Double,
            Value::Obj(_) => ValueKind::Object,
        }
    }

    /// Only `nil` and `false` are falsey.
    pub fn is_falsey(self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_obj(self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => Some(r),
            _ => None,
        }
    }
}

/// Print mode for values: `Raw` quotes strings (debug output, traces),
/// `Pretty` does not (the `print` statement).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintFlags {
    Raw,
    Pretty,
}

/// Formats a double the way `print` shows it: integral values drop the
/// fractional part entirely.
pub fn format_double(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_variant_equality_is_false() {
        assert_ne!(Value::Nil, Value::Bool(false));
        assert_ne!(Value::Bool(false), Value::Double(0.0));
        assert_ne!(Value::Double(0.0), Value::Nil);
    }

    #[test]
    fn truthiness() {
        assert!(Value::Nil.is_falsey());
        assert!(Value::Bool(false).is_falsey());
        assert!(!Value::Bool(true).is_falsey());
        assert!(!Value::Double(0.0).is_falsey());
    }

    #[test]
    fn double_formatting() {
        assert_eq!(format_double(5.0), "5");
        assert_eq!(format_double(-2.0), "-2");
        assert_eq!(format_double(3.14), "3.14");
        assert_eq!(format_double(0.5), "0.5");
    }
}
