//! Single forward-pass decoding of wire-format buffers.
//!
//! A [`Reader`] is constructed over a byte buffer plus the declared
//! endianness of the message it came from. Every read aligns the cursor
//! first and requires all skipped padding bytes to be zero; a non-zero
//! padding byte is a protocol violation, not a recoverable condition.

use std::convert::TryInto;

use crate::error::{DecodeError, SigError};
use crate::path::ObjectPathBuf;

use super::signature::{
    alignment_of, array_element, dict_key_value, fixed_size, inner_types, iter_types, Signature,
};
use super::value::Value;
use super::{align_num, ByteOrder, MAX_ARRAY_LEN, MAX_NESTING_DEPTH, MAX_SIGNATURE_LEN};

/// Decodes values out of a byte buffer, tracking an aligned cursor.
pub struct Reader<'a> {
    buf: &'a [u8],
    order: ByteOrder,
    pos: usize,
}

macro_rules! read_fixed {
    ($name:ident, $typ:ty) => {
        pub fn $name(&mut self) -> Result<$typ, DecodeError> {
            const SIZE: usize = std::mem::size_of::<$typ>();
            self.align_to(SIZE)?;
            let raw = self.take(SIZE)?;
            let arr = raw.try_into().unwrap();
            Ok(match self.order {
                ByteOrder::LittleEndian => <$typ>::from_le_bytes(arr),
                ByteOrder::BigEndian => <$typ>::from_be_bytes(arr),
            })
        }
    };
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        Reader { buf, order, pos: 0 }
    }
    /// Current cursor offset into the buffer.
    pub fn pos(&self) -> usize {
        self.pos
    }
    /// Bytes left after the cursor.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: len - self.remaining(),
            });
        }
        let ret = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(ret)
    }
    /// Advances the cursor to the next multiple of `alignment`, requiring
    /// every skipped byte to be zero.
    pub fn align_to(&mut self, alignment: usize) -> Result<(), DecodeError> {
        let target = align_num(self.pos, alignment);
        if target > self.buf.len() {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: target - self.buf.len(),
            });
        }
        while self.pos < target {
            let byte = self.buf[self.pos];
            if byte != 0 {
                return Err(DecodeError::Padding {
                    offset: self.pos,
                    byte,
                });
            }
            self.pos += 1;
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }
    read_fixed!(read_u16, u16);
    read_fixed!(read_i16, i16);
    read_fixed!(read_u32, u32);
    read_fixed!(read_i32, i32);
    read_fixed!(read_u64, u64);
    read_fixed!(read_i64, i64);
    read_fixed!(read_f64, f64);

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        match self.read_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidBool(other)),
        }
    }
    /// Reads a length-prefixed, NUL-terminated UTF-8 string.
    pub fn read_string(&mut self) -> Result<&'a str, DecodeError> {
        let len = self.read_u32()? as usize;
        let raw = self.take(len)?;
        let ret = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
        if self.take(1)?[0] != 0 {
            return Err(DecodeError::MissingNul);
        }
        Ok(ret)
    }
    pub fn read_path(&mut self) -> Result<ObjectPathBuf, DecodeError> {
        let raw = self.read_string()?;
        Ok(ObjectPathBuf::new(raw)?)
    }
    /// Reads a signature value: 1-byte length, type codes, NUL.
    pub fn read_signature(&mut self) -> Result<Signature, DecodeError> {
        let len = self.read_u8()? as usize;
        if len > MAX_SIGNATURE_LEN {
            return Err(DecodeError::Sig(SigError::TooLong));
        }
        let raw = self.take(len)?;
        let sig = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
        if self.take(1)?[0] != 0 {
            return Err(DecodeError::MissingNul);
        }
        Ok(Signature::new(sig)?)
    }

    /// Decodes one value of the given single complete type.
    pub fn read_value(&mut self, sig: &str) -> Result<Value, DecodeError> {
        self.read_value_at(sig, 0)
    }
    /// Validated signatures bound array and struct nesting, but every
    /// variant carries a fresh signature in the data, so the decoder must
    /// count its own depth.
    fn read_value_at(&mut self, sig: &str, depth: usize) -> Result<Value, DecodeError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(DecodeError::NestingTooDeep(self.pos));
        }
        match sig.as_bytes().first() {
            Some(b'y') => Ok(Value::Byte(self.read_u8()?)),
            Some(b'b') => Ok(Value::Bool(self.read_bool()?)),
            Some(b'n') => Ok(Value::Int16(self.read_i16()?)),
            Some(b'q') => Ok(Value::UInt16(self.read_u16()?)),
            Some(b'i') => Ok(Value::Int32(self.read_i32()?)),
            Some(b'u') => Ok(Value::UInt32(self.read_u32()?)),
            Some(b'x') => Ok(Value::Int64(self.read_i64()?)),
            Some(b't') => Ok(Value::UInt64(self.read_u64()?)),
            Some(b'd') => Ok(Value::Double(self.read_f64()?)),
            Some(b'h') => Ok(Value::Fd(self.read_u32()?)),
            Some(b's') => Ok(Value::Str(self.read_string()?.to_string())),
            Some(b'o') => Ok(Value::Path(self.read_path()?)),
            Some(b'g') => Ok(Value::Sig(self.read_signature()?)),
            Some(b'v') => {
                let var_sig = self.read_signature()?;
                if var_sig.is_empty() || super::signature::single_type_len(&var_sig) != var_sig.len()
                {
                    return Err(DecodeError::Sig(SigError::NotSingleType));
                }
                let val = self.read_value_at(&var_sig, depth + 1)?;
                Ok(Value::Variant(Box::new(val)))
            }
            Some(b'a') => {
                let elem = array_element(sig);
                if elem.starts_with('{') {
                    self.read_dict(elem, depth)
                } else {
                    self.read_array(elem, depth)
                }
            }
            Some(b'(') => {
                self.align_to(8)?;
                let mut fields = Vec::new();
                for field in iter_types(inner_types(sig)) {
                    fields.push(self.read_value_at(field, depth + 1)?);
                }
                Ok(Value::Struct(fields))
            }
            _ => Err(DecodeError::Sig(SigError::Empty)),
        }
    }
    fn read_array_extent(&mut self, elem: &str) -> Result<usize, DecodeError> {
        let len = self.read_u32()?;
        if len > MAX_ARRAY_LEN {
            return Err(DecodeError::ArrayTooLong(len));
        }
        self.align_to(alignment_of(elem))?;
        let end = self.pos + len as usize;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: end - self.buf.len(),
            });
        }
        Ok(end)
    }
    fn read_array(&mut self, elem: &str, depth: usize) -> Result<Value, DecodeError> {
        let end = self.read_array_extent(elem)?;
        let declared = (end - self.pos) as u32;
        // a fixed-size element must divide the byte length exactly
        if let Some(size) = fixed_size(elem) {
            let stride = align_num(size, alignment_of(elem));
            let len = end - self.pos;
            if len != 0 && (len < size || (len - size) % stride != 0) {
                return Err(DecodeError::ArrayOvershoot {
                    declared,
                    offset: self.pos,
                });
            }
        }
        let mut elems = Vec::new();
        while self.pos < end {
            elems.push(self.read_value_at(elem, depth + 1)?);
            if self.pos > end {
                return Err(DecodeError::ArrayOvershoot {
                    declared,
                    offset: self.pos,
                });
            }
        }
        Ok(Value::Array(
            Signature::single(elem).map_err(DecodeError::Sig)?,
            elems,
        ))
    }
    fn read_dict(&mut self, entry: &str, depth: usize) -> Result<Value, DecodeError> {
        let end = self.read_array_extent(entry)?;
        let declared = (end - self.pos) as u32;
        let (key_sig, val_sig) = dict_key_value(entry);
        let mut entries: Vec<(Value, Value)> = Vec::new();
        while self.pos < end {
            self.align_to(8)?;
            let key = self.read_value_at(key_sig, depth + 1)?;
            let val = self.read_value_at(val_sig, depth + 1)?;
            if self.pos > end {
                return Err(DecodeError::ArrayOvershoot {
                    declared,
                    offset: self.pos,
                });
            }
            // last write wins on a duplicate key
            match entries.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = val,
                None => entries.push((key, val)),
            }
        }
        Ok(Value::Dict(
            Signature::single(key_sig).map_err(DecodeError::Sig)?,
            Signature::single(val_sig).map_err(DecodeError::Sig)?,
            entries,
        ))
    }

    /// Decodes one value per single complete type of a body signature.
    pub fn read_all(&mut self, sig: &Signature) -> Result<Vec<Value>, DecodeError> {
        let mut vals = Vec::new();
        for typ in sig.iter() {
            vals.push(self.read_value(typ)?);
        }
        Ok(vals)
    }

    /// Advances the cursor past one value of the given type without
    /// constructing it. Alignment and length handling match
    /// [`read_value`](Self::read_value) exactly.
    pub fn step_over(&mut self, sig: &str) -> Result<(), DecodeError> {
        self.step_over_at(sig, 0)
    }
    fn step_over_at(&mut self, sig: &str, depth: usize) -> Result<(), DecodeError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(DecodeError::NestingTooDeep(self.pos));
        }
        match sig.as_bytes().first() {
            Some(b'y') => {
                self.take(1)?;
                Ok(())
            }
            Some(b'n') | Some(b'q') => {
                self.align_to(2)?;
                self.take(2).map(drop)
            }
            Some(b'b') | Some(b'i') | Some(b'u') | Some(b'h') => {
                self.align_to(4)?;
                self.take(4).map(drop)
            }
            Some(b'x') | Some(b't') | Some(b'd') => {
                self.align_to(8)?;
                self.take(8).map(drop)
            }
            Some(b's') | Some(b'o') => {
                let len = self.read_u32()? as usize;
                self.take(len)?;
                if self.take(1)?[0] != 0 {
                    return Err(DecodeError::MissingNul);
                }
                Ok(())
            }
            Some(b'g') => {
                let len = self.read_u8()? as usize;
                if len > MAX_SIGNATURE_LEN {
                    return Err(DecodeError::Sig(SigError::TooLong));
                }
                self.take(len)?;
                if self.take(1)?[0] != 0 {
                    return Err(DecodeError::MissingNul);
                }
                Ok(())
            }
            Some(b'v') => {
                let var_sig = self.read_signature()?;
                if var_sig.is_empty() || super::signature::single_type_len(&var_sig) != var_sig.len()
                {
                    return Err(DecodeError::Sig(SigError::NotSingleType));
                }
                self.step_over_at(&var_sig, depth + 1)
            }
            Some(b'a') => {
                let elem = array_element(sig);
                let end = self.read_array_extent(elem)?;
                self.pos = end;
                Ok(())
            }
            Some(b'(') => {
                self.align_to(8)?;
                for field in iter_types(inner_types(sig)) {
                    self.step_over_at(field, depth + 1)?;
                }
                Ok(())
            }
            _ => Err(DecodeError::Sig(SigError::Empty)),
        }
    }

    /// Decodes one value, then restores the cursor.
    pub fn peek_value(&mut self, sig: &str) -> Result<Value, DecodeError> {
        let saved = self.pos;
        let res = self.read_value(sig);
        self.pos = saved;
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le(buf: &[u8]) -> Reader {
        Reader::new(buf, ByteOrder::LittleEndian)
    }

    #[test]
    fn primitives_both_orders() {
        let mut r = Reader::new(&[0x01, 0x02, 0x03, 0x04], ByteOrder::LittleEndian);
        assert_eq!(r.read_u32().unwrap(), 0x0403_0201);
        let mut r = Reader::new(&[0x01, 0x02, 0x03, 0x04], ByteOrder::BigEndian);
        assert_eq!(r.read_u32().unwrap(), 0x0102_0304);
    }

    #[test]
    fn padding_must_be_zero() {
        // u8 then u32: three padding bytes, one poisoned
        let buf = [7u8, 0, 0xFF, 0, 1, 0, 0, 0];
        let mut r = le(&buf);
        r.read_u8().unwrap();
        let err = r.read_u32().unwrap_err();
        assert_eq!(err, DecodeError::Padding { offset: 2, byte: 0xFF });
    }

    #[test]
    fn bool_range() {
        let mut r = le(&[1, 0, 0, 0]);
        assert!(r.read_bool().unwrap());
        let mut r = le(&[2, 0, 0, 0]);
        assert_eq!(r.read_bool().unwrap_err(), DecodeError::InvalidBool(2));
    }

    #[test]
    fn strings() {
        let buf = [3, 0, 0, 0, b'a', b'b', b'c', 0];
        assert_eq!(le(&buf).read_string().unwrap(), "abc");
        let unterminated = [3, 0, 0, 0, b'a', b'b', b'c', 1];
        assert_eq!(le(&unterminated).read_string().unwrap_err(), DecodeError::MissingNul);
        let truncated = [5, 0, 0, 0, b'a'];
        assert!(matches!(
            le(&truncated).read_string().unwrap_err(),
            DecodeError::Truncated { .. }
        ));
    }

    #[test]
    fn array_overshoot() {
        // declared 6 bytes of u32 elements: not an element boundary
        let buf = [6, 0, 0, 0, 1, 0, 0, 0, 2, 0];
        let err = le(&buf).read_value("au").unwrap_err();
        assert!(matches!(err, DecodeError::ArrayOvershoot { declared: 6, .. }));
    }

    #[test]
    fn array_too_long() {
        let len = (MAX_ARRAY_LEN + 1).to_le_bytes();
        let buf = [len[0], len[1], len[2], len[3]];
        assert_eq!(
            le(&buf).read_value("ay").unwrap_err(),
            DecodeError::ArrayTooLong(MAX_ARRAY_LEN + 1)
        );
    }

    #[test]
    fn variant_requires_single_type() {
        // variant carrying signature "ii"
        let buf = [2, b'i', b'i', 0, 1, 0, 0, 0, 2, 0, 0, 0];
        assert_eq!(
            le(&buf).read_value("v").unwrap_err(),
            DecodeError::Sig(SigError::NotSingleType)
        );
    }

    #[test]
    fn variant_nesting_is_bounded() {
        // n variant signatures wrapping one byte
        let nest = |n: usize| {
            let mut buf = Vec::new();
            for _ in 0..n {
                buf.extend_from_slice(&[1, b'v', 0]);
            }
            buf.extend_from_slice(&[1, b'y', 0, 42]);
            buf
        };
        let shallow = nest(10);
        le(&shallow).read_value("v").unwrap();
        le(&shallow).step_over("v").unwrap();
        let deep = nest(200_000);
        assert!(matches!(
            le(&deep).read_value("v").unwrap_err(),
            DecodeError::NestingTooDeep(_)
        ));
        assert!(matches!(
            le(&deep).step_over("v").unwrap_err(),
            DecodeError::NestingTooDeep(_)
        ));
    }

    #[test]
    fn dict_last_write_wins() {
        // a{yy} with entries 1->2 and 1->3
        let buf = [
            10, 0, 0, 0, 0, 0, 0, 0, // byte length + pad to first entry
            1, 2, // entry 1 -> 2
            0, 0, 0, 0, 0, 0, // pad to next entry
            1, 3, // entry 1 -> 3 again
        ];
        let val = le(&buf).read_value("a{yy}").unwrap();
        match val {
            Value::Dict(_, _, entries) => {
                assert_eq!(entries, vec![(Value::Byte(1), Value::Byte(3))]);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn step_over_matches_decode() {
        let buf = [
            3, 0, 0, 0, b'f', b'o', b'o', 0, // "foo"
            42, 0, 0, 0, // u32
        ];
        let mut full = le(&buf);
        full.read_value("s").unwrap();
        full.read_value("u").unwrap();
        let mut skim = le(&buf);
        skim.step_over("s").unwrap();
        skim.step_over("u").unwrap();
        assert_eq!(full.pos(), skim.pos());
    }

    #[test]
    fn peek_restores_cursor() {
        let buf = [9u8];
        let mut r = le(&buf);
        assert_eq!(r.peek_value("y").unwrap(), Value::Byte(9));
        assert_eq!(r.pos(), 0);
        assert_eq!(r.read_value("y").unwrap(), Value::Byte(9));
    }
}
