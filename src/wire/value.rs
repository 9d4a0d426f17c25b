//! A closed, tagged-union model of every DBus type.
//!
//! Decoding produces a [`Value`] tree and encoding consumes one; the
//! signature of a value is derived from its runtime shape and always
//! agrees with what [`Signature::single`] accepts.

use crate::error::SigError;
use crate::path::ObjectPathBuf;

use super::signature::Signature;

/// One DBus value of any type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    Path(ObjectPathBuf),
    Sig(Signature),
    /// Homogeneous array. The element signature is stored explicitly so
    /// empty arrays keep their type.
    Array(Signature, Vec<Value>),
    Struct(Vec<Value>),
    /// Array of dict entries in encounter order; keys are unique.
    Dict(Signature, Signature, Vec<(Value, Value)>),
    Variant(Box<Value>),
    /// An opaque resource token carried alongside the message.
    Fd(u32),
}

impl Value {
    fn write_sig(&self, out: &mut String) {
        match self {
            Value::Byte(_) => out.push('y'),
            Value::Bool(_) => out.push('b'),
            Value::Int16(_) => out.push('n'),
            Value::UInt16(_) => out.push('q'),
            Value::Int32(_) => out.push('i'),
            Value::UInt32(_) => out.push('u'),
            Value::Int64(_) => out.push('x'),
            Value::UInt64(_) => out.push('t'),
            Value::Double(_) => out.push('d'),
            Value::Str(_) => out.push('s'),
            Value::Path(_) => out.push('o'),
            Value::Sig(_) => out.push('g'),
            Value::Array(elem, _) => {
                out.push('a');
                out.push_str(elem);
            }
            Value::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_sig(out);
                }
                out.push(')');
            }
            Value::Dict(key, val, _) => {
                out.push_str("a{");
                out.push_str(key);
                out.push_str(val);
                out.push('}');
            }
            Value::Variant(_) => out.push('v'),
            Value::Fd(_) => out.push('h'),
        }
    }
    /// Derives the single-complete-type signature of this value.
    ///
    /// Fails if the derived signature would be too long, too deeply
    /// nested, or otherwise invalid (e.g. an empty struct).
    pub fn signature(&self) -> Result<Signature, SigError> {
        let mut sig = String::new();
        self.write_sig(&mut sig);
        Signature::single(&sig)
    }
    /// Alignment requirement of this value's encoding.
    pub fn alignment(&self) -> usize {
        match self {
            Value::Byte(_) | Value::Sig(_) | Value::Variant(_) => 1,
            Value::Int16(_) | Value::UInt16(_) => 2,
            Value::Bool(_)
            | Value::Int32(_)
            | Value::UInt32(_)
            | Value::Str(_)
            | Value::Path(_)
            | Value::Array(..)
            | Value::Dict(..)
            | Value::Fd(_) => 4,
            Value::Int64(_) | Value::UInt64(_) | Value::Double(_) => 8,
            Value::Struct(_) => 8,
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Path(p) => Some(p.as_str()),
            Value::Sig(s) => Some(s.as_str()),
            _ => None,
        }
    }
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::UInt32(u) => Some(*u),
            _ => None,
        }
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Byte(v)
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int16(v)
    }
}
impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::UInt16(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}
impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt32(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}
impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt64(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}
impl From<ObjectPathBuf> for Value {
    fn from(v: ObjectPathBuf) -> Self {
        Value::Path(v)
    }
}
impl From<Signature> for Value {
    fn from(v: Signature) -> Self {
        Value::Sig(v)
    }
}
