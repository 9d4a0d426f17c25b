//! Validated DBus type signatures.
//!
//! A [`Signature`] is an immutable sequence of type codes. Signatures used
//! for a single value must be a *single complete type*: exactly one
//! top-level type with balanced parentheses and braces. Message bodies use
//! multi-type signatures, one single complete type per argument.
//!
//! The relevant portion of the DBus specification can be found [here].
//!
//! [here]: https://dbus.freedesktop.org/doc/dbus-specification.html#message-protocol-signatures

use std::convert::TryFrom;
use std::fmt::{Display, Formatter};
use std::ops::Deref;

use arrayvec::{ArrayString, ArrayVec};

use super::MAX_SIGNATURE_LEN;
use crate::error::SigError;

const MAX_KIND_NESTING: u8 = 32;

/// Validates a (possibly multi-type) signature string.
pub fn validate_sig_str(sig: &str) -> Result<(), SigError> {
    if sig.len() > MAX_SIGNATURE_LEN {
        return Err(SigError::TooLong);
    }
    enum Nest {
        Array,
        DictEntry(u8), // number of member types seen so far
        Struct(bool),  // true once the struct is non-empty
    }
    // arrays and structs are depth-limited to 32 each, and every open
    // dict entry sits above its own array, so 96 slots suffice
    let mut stack = ArrayVec::<_, 96>::new();
    let mut a_cnt = 0;
    let mut s_cnt = 0;
    for c in sig.bytes() {
        match c {
            b'v' | b'a' | b'{' | b'(' if matches!(stack.last(), Some(&Nest::DictEntry(0))) => {
                return Err(SigError::NonBaseDictKey);
            }
            b'a' if a_cnt >= MAX_KIND_NESTING => return Err(SigError::NestingTooDeep),
            b'a' => {
                stack.push(Nest::Array);
                a_cnt += 1;
                continue;
            }
            b'(' if s_cnt >= MAX_KIND_NESTING => return Err(SigError::NestingTooDeep),
            b'(' => {
                stack.push(Nest::Struct(false));
                s_cnt += 1;
                continue;
            }
            b')' if !matches!(stack.pop(), Some(Nest::Struct(true))) => {
                return Err(SigError::UnexpectedClosingParen)
            }
            b')' => s_cnt -= 1,
            b'{' if !matches!(stack.last(), Some(&Nest::Array)) => {
                return Err(SigError::DictEntryNotInArray)
            }
            b'{' => {
                stack.push(Nest::DictEntry(0));
                continue;
            }
            b'}' if !matches!(stack.pop(), Some(Nest::DictEntry(2))) => {
                return Err(SigError::UnexpectedClosingBrace)
            }
            b'v' | b'}' | b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's'
            | b'o' | b'g' | b'h' => {}
            _ => return Err(SigError::UnknownCode(c)),
        }
        while matches!(stack.last(), Some(&Nest::Array)) {
            stack.pop();
            a_cnt -= 1;
        }
        match stack.last_mut() {
            Some(Nest::DictEntry(cnt)) if *cnt >= 2 => return Err(SigError::BadDictEntryArity),
            Some(Nest::DictEntry(cnt)) => *cnt += 1,
            Some(Nest::Struct(non_empty)) => *non_empty = true,
            _ => {}
        }
    }
    if stack.is_empty() {
        debug_assert_eq!(a_cnt, 0);
        debug_assert_eq!(s_cnt, 0);
        Ok(())
    } else {
        Err(match stack.last().unwrap() {
            Nest::Struct(_) => SigError::UnclosedStruct,
            Nest::DictEntry(_) => SigError::UnclosedDictEntry,
            Nest::Array => SigError::ArrayWithNoType,
        })
    }
}

/// Length in bytes of the first single complete type in a valid signature.
pub fn single_type_len(sig: &str) -> usize {
    let bytes = sig.as_bytes();
    let mut pos = 0;
    // leading array codes apply to whatever follows
    while bytes.get(pos) == Some(&b'a') {
        pos += 1;
    }
    match bytes.get(pos) {
        Some(b'(') => {
            let mut depth = 1;
            while depth > 0 {
                pos += 1;
                match bytes[pos] {
                    b'(' => depth += 1,
                    b')' => depth -= 1,
                    _ => {}
                }
            }
            pos + 1
        }
        Some(b'{') => {
            let mut depth = 1;
            while depth > 0 {
                pos += 1;
                match bytes[pos] {
                    b'{' => depth += 1,
                    b'}' => depth -= 1,
                    _ => {}
                }
            }
            pos + 1
        }
        Some(_) => pos + 1,
        None => pos,
    }
}

/// Alignment requirement of the first type in a valid signature.
pub fn alignment_of(sig: &str) -> usize {
    match sig.as_bytes().first() {
        Some(b'y') | Some(b'g') | Some(b'v') => 1,
        Some(b'n') | Some(b'q') => 2,
        Some(b'i') | Some(b'u') | Some(b'b') | Some(b'h') => 4,
        // strings and arrays align for their u32 length prefix
        Some(b's') | Some(b'o') | Some(b'a') => 4,
        Some(b'x') | Some(b't') | Some(b'd') => 8,
        // structs and dict entries are always 8-aligned
        Some(b'(') | Some(b'{') => 8,
        _ => 1,
    }
}

/// Encoded size of a position-independent type, measured from a correctly
/// aligned start. `None` for variable-size types.
pub fn fixed_size(sig: &str) -> Option<usize> {
    match sig.as_bytes().first()? {
        b'y' => Some(1),
        b'n' | b'q' => Some(2),
        b'i' | b'u' | b'b' | b'h' => Some(4),
        b'x' | b't' | b'd' => Some(8),
        b'(' | b'{' => {
            let mut off = 0;
            for field in iter_types(inner_types(sig)) {
                off = super::align_num(off, alignment_of(field));
                off += fixed_size(field)?;
            }
            Some(off)
        }
        _ => None,
    }
}

/// Whether a type's encoded size is independent of its position and value.
pub fn is_fixed_size(sig: &str) -> bool {
    fixed_size(sig).is_some()
}

/// The element signature of an array type (strips the leading `a`).
pub fn array_element(sig: &str) -> &str {
    debug_assert!(sig.starts_with('a'));
    &sig[1..]
}

/// The member types of a struct or dict-entry signature, unbracketed.
pub fn inner_types(sig: &str) -> &str {
    debug_assert!(sig.starts_with('(') || sig.starts_with('{'));
    &sig[1..sig.len() - 1]
}

/// The key and value signatures of a dict-entry type.
pub fn dict_key_value(entry: &str) -> (&str, &str) {
    let inner = inner_types(entry);
    let key_len = single_type_len(inner);
    (&inner[..key_len], &inner[key_len..])
}

/// Splits a valid multi-type signature into its single complete types.
pub fn iter_types(sig: &str) -> TypeIter {
    TypeIter { rest: sig }
}

pub struct TypeIter<'a> {
    rest: &'a str,
}

impl<'a> Iterator for TypeIter<'a> {
    type Item = &'a str;
    fn next(&mut self) -> Option<&'a str> {
        if self.rest.is_empty() {
            return None;
        }
        let len = single_type_len(self.rest);
        let (head, tail) = self.rest.split_at(len);
        self.rest = tail;
        Some(head)
    }
}

/// An immutable, validated signature with inline storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Signature {
    buf: ArrayString<MAX_SIGNATURE_LEN>,
}

impl Signature {
    /// The empty signature, used by messages without a body.
    pub fn empty() -> Self {
        Signature::default()
    }
    /// Validates a possibly multi-type signature.
    pub fn new(sig: &str) -> Result<Self, SigError> {
        validate_sig_str(sig)?;
        let buf = ArrayString::from(sig).map_err(|_| SigError::TooLong)?;
        Ok(Signature { buf })
    }
    /// Validates a signature that must contain exactly one complete type.
    pub fn single(sig: &str) -> Result<Self, SigError> {
        let ret = Self::new(sig)?;
        if sig.is_empty() {
            return Err(SigError::Empty);
        }
        if single_type_len(sig) != sig.len() {
            return Err(SigError::NotSingleType);
        }
        Ok(ret)
    }
    pub fn as_str(&self) -> &str {
        &self.buf
    }
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
    pub fn len(&self) -> usize {
        self.buf.len()
    }
    /// Iterates over the single complete types making up this signature.
    pub fn iter(&self) -> TypeIter {
        iter_types(&self.buf)
    }
    /// Appends the signature of one more value, used while building bodies.
    pub(crate) fn push(&mut self, sig: &str) -> Result<(), SigError> {
        self.buf.try_push_str(sig).map_err(|_| SigError::TooLong)
    }
    pub(crate) fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }
}

impl Deref for Signature {
    type Target = str;
    fn deref(&self) -> &str {
        &self.buf
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.buf)
    }
}

impl TryFrom<&str> for Signature {
    type Error = SigError;
    fn try_from(sig: &str) -> Result<Self, SigError> {
        Signature::new(sig)
    }
}
