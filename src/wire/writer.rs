//! Encoding of value trees into correctly padded wire-format buffers.
//!
//! Array and dict lengths are backpatched: a placeholder length is
//! written, elements are serialized, then the real byte length is written
//! over the placeholder. The byte length is unknowable up front because
//! elements may themselves be variable-length.

use crate::error::EncodeError;

use super::value::Value;
use super::{align_num, ByteOrder, MAX_ARRAY_LEN, MAX_SIGNATURE_LEN};

/// Encodes values into a growable byte buffer.
pub struct Writer {
    buf: Vec<u8>,
    order: ByteOrder,
}

macro_rules! write_fixed {
    ($name:ident, $typ:ty) => {
        pub fn $name(&mut self, val: $typ) {
            self.pad_to(std::mem::size_of::<$typ>());
            let bytes = match self.order {
                ByteOrder::LittleEndian => val.to_le_bytes(),
                ByteOrder::BigEndian => val.to_be_bytes(),
            };
            self.buf.extend_from_slice(&bytes);
        }
    };
}

impl Writer {
    pub fn new(order: ByteOrder) -> Self {
        Writer {
            buf: Vec::new(),
            order,
        }
    }
    /// Continues encoding at the end of an existing buffer.
    pub(crate) fn from_vec(buf: Vec<u8>, order: ByteOrder) -> Self {
        Writer { buf, order }
    }
    pub fn order(&self) -> ByteOrder {
        self.order
    }
    pub fn pos(&self) -> usize {
        self.buf.len()
    }
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
    /// Pads with zero bytes to the next multiple of `alignment`.
    pub fn pad_to(&mut self, alignment: usize) {
        let target = align_num(self.buf.len(), alignment);
        self.buf.resize(target, 0);
    }

    pub fn write_u8(&mut self, val: u8) {
        self.buf.push(val);
    }
    write_fixed!(write_u16, u16);
    write_fixed!(write_i16, i16);
    write_fixed!(write_u32, u32);
    write_fixed!(write_i32, i32);
    write_fixed!(write_u64, u64);
    write_fixed!(write_i64, i64);
    write_fixed!(write_f64, f64);

    pub fn write_bool(&mut self, val: bool) {
        self.write_u32(val as u32);
    }
    pub fn write_string(&mut self, val: &str) {
        self.write_u32(val.len() as u32);
        self.buf.extend_from_slice(val.as_bytes());
        self.buf.push(0);
    }
    pub fn write_signature(&mut self, sig: &str) -> Result<(), EncodeError> {
        if sig.len() > MAX_SIGNATURE_LEN {
            return Err(EncodeError::Sig(crate::error::SigError::TooLong));
        }
        self.buf.push(sig.len() as u8);
        self.buf.extend_from_slice(sig.as_bytes());
        self.buf.push(0);
        Ok(())
    }
    /// Writes the placeholder/backpatch frame around an array body.
    ///
    /// `fill` writes the elements; afterwards the measured byte length
    /// replaces the placeholder. An oversized result rolls the buffer
    /// back to where the array began.
    fn write_array_frame<F>(&mut self, elem_align: usize, fill: F) -> Result<(), EncodeError>
    where
        F: FnOnce(&mut Self) -> Result<(), EncodeError>,
    {
        self.pad_to(4);
        let len_pos = self.buf.len();
        self.write_u32(0);
        self.pad_to(elem_align);
        let start = self.buf.len();
        if let Err(e) = fill(self) {
            self.buf.truncate(len_pos);
            return Err(e);
        }
        let len = self.buf.len() - start;
        if len > MAX_ARRAY_LEN as usize {
            self.buf.truncate(len_pos);
            return Err(EncodeError::ArrayTooLong(len));
        }
        let encoded = match self.order {
            ByteOrder::LittleEndian => (len as u32).to_le_bytes(),
            ByteOrder::BigEndian => (len as u32).to_be_bytes(),
        };
        self.buf[len_pos..len_pos + 4].copy_from_slice(&encoded);
        Ok(())
    }

    /// Serializes one value, padding to its alignment first.
    pub fn write_value(&mut self, val: &Value) -> Result<(), EncodeError> {
        match val {
            Value::Byte(v) => self.write_u8(*v),
            Value::Bool(v) => self.write_bool(*v),
            Value::Int16(v) => self.write_i16(*v),
            Value::UInt16(v) => self.write_u16(*v),
            Value::Int32(v) => self.write_i32(*v),
            Value::UInt32(v) => self.write_u32(*v),
            Value::Int64(v) => self.write_i64(*v),
            Value::UInt64(v) => self.write_u64(*v),
            Value::Double(v) => self.write_f64(*v),
            Value::Fd(v) => self.write_u32(*v),
            Value::Str(v) => self.write_string(v),
            Value::Path(v) => self.write_string(v.as_str()),
            Value::Sig(v) => self.write_signature(v)?,
            Value::Array(elem, vals) => {
                for v in vals {
                    if v.signature()?.as_str() != elem.as_str() {
                        return Err(EncodeError::ElementMismatch);
                    }
                }
                let align = super::signature::alignment_of(elem);
                self.write_array_frame(align, |w| {
                    for v in vals {
                        w.write_value(v)?;
                    }
                    Ok(())
                })?;
            }
            Value::Dict(key_sig, val_sig, entries) => {
                for (k, v) in entries {
                    if k.signature()?.as_str() != key_sig.as_str()
                        || v.signature()?.as_str() != val_sig.as_str()
                    {
                        return Err(EncodeError::ElementMismatch);
                    }
                }
                self.write_array_frame(8, |w| {
                    for (k, v) in entries {
                        w.pad_to(8);
                        w.write_value(k)?;
                        w.write_value(v)?;
                    }
                    Ok(())
                })?;
            }
            Value::Struct(fields) => {
                // struct signatures also reject the empty case
                val.signature()?;
                self.pad_to(8);
                for field in fields {
                    self.write_value(field)?;
                }
            }
            Value::Variant(inner) => {
                let sig = inner.signature()?;
                self.write_signature(&sig)?;
                self.write_value(inner)?;
            }
        }
        Ok(())
    }
}
