//! Messages: a fixed header, keyed optional header fields, and a body
//! interpreted against the declared signature.
//!
//! Serials are deliberately absent from outgoing messages; the connection
//! assigns one at send time. Received messages carry the peer's serial.

use std::num::NonZeroU32;

use crate::error::{DecodeError, EncodeError};
use crate::path::{ObjectPath, ObjectPathBuf};
use crate::wire::{
    align_num, ByteOrder, Reader, Signature, Value, Writer, MAX_MESSAGE_LEN,
};

/// Byte length of the fixed portion of a message header.
pub const FIXED_HEADER_LEN: usize = 16;
/// Wire protocol version this crate speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Flag bit: the caller does not want a method reply.
pub const NO_REPLY_EXPECTED: u8 = 0x01;
/// Flag bit: do not auto-start a service to handle this message.
pub const NO_AUTO_START: u8 = 0x02;
/// Flag bit: interactive authorization may be performed.
pub const ALLOW_INTERACTIVE_AUTH: u8 = 0x04;

const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Call,
    Reply,
    Error,
    Signal,
}

impl MessageType {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            MessageType::Call => 1,
            MessageType::Reply => 2,
            MessageType::Error => 3,
            MessageType::Signal => 4,
        }
    }
    pub(crate) fn from_wire(b: u8) -> Result<Self, DecodeError> {
        match b {
            1 => Ok(MessageType::Call),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::Error),
            4 => Ok(MessageType::Signal),
            other => Err(DecodeError::InvalidMessageType(other)),
        }
    }
}

/// The keyed optional header fields of a message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<NonZeroU32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
}

/// An encoded message body plus the signature describing it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Body {
    buf: Vec<u8>,
    sig: Signature,
    order: ByteOrder,
}

impl Body {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_order(order: ByteOrder) -> Self {
        Body {
            buf: Vec::new(),
            sig: Signature::empty(),
            order,
        }
    }
    pub(crate) fn from_parts(buf: Vec<u8>, sig: Signature, order: ByteOrder) -> Self {
        Body { buf, sig, order }
    }
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }
    pub fn sig(&self) -> &Signature {
        &self.sig
    }
    pub fn order(&self) -> ByteOrder {
        self.order
    }
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
    /// Appends one value, extending the body signature to match.
    ///
    /// On failure neither the buffer nor the signature is changed.
    pub fn push(&mut self, val: &Value) -> Result<(), EncodeError> {
        let sig = val.signature()?;
        let buf_len = self.buf.len();
        let sig_len = self.sig.len();
        if let Err(e) = self.sig.push(&sig) {
            return Err(EncodeError::Sig(e));
        }
        let mut w = Writer::from_vec(std::mem::take(&mut self.buf), self.order);
        let res = w.write_value(val);
        self.buf = w.into_inner();
        if res.is_err() {
            self.buf.truncate(buf_len);
            self.sig.truncate(sig_len);
        }
        res
    }
    /// Decodes every value in the body; the declared signature must
    /// account for the entire buffer.
    pub fn values(&self) -> Result<Vec<Value>, DecodeError> {
        let mut r = Reader::new(&self.buf, self.order);
        let vals = r.read_all(&self.sig)?;
        if r.remaining() != 0 {
            return Err(DecodeError::Trailing(r.pos()));
        }
        Ok(vals)
    }
    /// A reader positioned at the start of the body.
    pub fn reader(&self) -> Reader {
        Reader::new(&self.buf, self.order)
    }
}

/// The unit exchanged with the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub typ: MessageType,
    pub flags: u8,
    /// The peer-assigned serial of a received message. Outgoing messages
    /// leave this empty; the connection assigns one at send time.
    pub serial: Option<NonZeroU32>,
    pub header: Header,
    pub body: Body,
}

impl Message {
    fn new(typ: MessageType) -> Self {
        Message {
            typ,
            flags: 0,
            serial: None,
            header: Header::default(),
            body: Body::new(),
        }
    }
    /// Whether the sender of this message wants a reply.
    pub fn expects_reply(&self) -> bool {
        self.typ == MessageType::Call && (self.flags & NO_REPLY_EXPECTED) == 0
    }
    /// Make a correctly addressed reply with the reply serial set.
    pub fn make_reply(&self) -> Message {
        let mut ret = Message::new(MessageType::Reply);
        ret.header.destination = self.header.sender.clone();
        ret.header.reply_serial = self.serial;
        ret
    }
    /// Make a correctly addressed error reply.
    pub fn make_error_reply<S: Into<String>>(&self, name: S, text: Option<String>) -> Message {
        let mut ret = Message::new(MessageType::Error);
        ret.header.destination = self.header.sender.clone();
        ret.header.reply_serial = self.serial;
        ret.header.error_name = Some(name.into());
        if let Some(text) = text {
            ret.body
                .push(&Value::Str(text))
                .expect("a lone string always encodes");
        }
        ret
    }

    fn required_fields(&self) -> Result<(), &'static str> {
        match self.typ {
            MessageType::Call => {
                if self.header.path.is_none() || self.header.member.is_none() {
                    return Err("method call requires path and member");
                }
            }
            MessageType::Signal => {
                if self.header.path.is_none()
                    || self.header.interface.is_none()
                    || self.header.member.is_none()
                {
                    return Err("signal requires path, interface and member");
                }
            }
            MessageType::Reply => {
                if self.header.reply_serial.is_none() {
                    return Err("method reply requires a reply serial");
                }
            }
            MessageType::Error => {
                if self.header.reply_serial.is_none() || self.header.error_name.is_none() {
                    return Err("error reply requires a reply serial and error name");
                }
            }
        }
        Ok(())
    }

    /// Serializes the complete message frame with the given serial.
    pub fn marshal(&self, serial: NonZeroU32) -> Result<Vec<u8>, EncodeError> {
        self.required_fields().map_err(EncodeError::Header)?;
        let order = self.body.order();
        let mut w = Writer::new(order);
        w.write_u8(order.marker());
        w.write_u8(self.typ.to_wire());
        w.write_u8(self.flags);
        w.write_u8(PROTOCOL_VERSION);
        w.write_u32(self.body.buf().len() as u32);
        w.write_u32(serial.get());

        let mut fields: Vec<Value> = Vec::new();
        let mut push = |code: u8, val: Value| {
            fields.push(Value::Struct(vec![
                Value::Byte(code),
                Value::Variant(Box::new(val)),
            ]));
        };
        if let Some(path) = &self.header.path {
            let path = ObjectPathBuf::new(path)
                .map_err(|_| EncodeError::Header("invalid object path"))?;
            push(FIELD_PATH, Value::Path(path));
        }
        if let Some(iface) = &self.header.interface {
            push(FIELD_INTERFACE, Value::Str(iface.clone()));
        }
        if let Some(member) = &self.header.member {
            push(FIELD_MEMBER, Value::Str(member.clone()));
        }
        if let Some(err) = &self.header.error_name {
            push(FIELD_ERROR_NAME, Value::Str(err.clone()));
        }
        if let Some(rs) = self.header.reply_serial {
            push(FIELD_REPLY_SERIAL, Value::UInt32(rs.get()));
        }
        if let Some(dest) = &self.header.destination {
            push(FIELD_DESTINATION, Value::Str(dest.clone()));
        }
        if let Some(sender) = &self.header.sender {
            push(FIELD_SENDER, Value::Str(sender.clone()));
        }
        if !self.body.is_empty() {
            push(FIELD_SIGNATURE, Value::Sig(*self.body.sig()));
        }
        w.write_value(&Value::Array(
            Signature::single("(yv)").expect("static signature"),
            fields,
        ))?;
        w.pad_to(8);
        let mut buf = w.into_inner();
        buf.extend_from_slice(self.body.buf());
        // the same cap the decode side enforces
        if buf.len() as u64 > MAX_MESSAGE_LEN {
            return Err(EncodeError::MessageTooLong(buf.len() as u64));
        }
        Ok(buf)
    }

    /// Parses one complete message frame from the front of `buf`,
    /// returning the message and the frame length.
    pub fn unmarshal(buf: &[u8]) -> Result<(Message, usize), DecodeError> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(DecodeError::Truncated {
                offset: buf.len(),
                needed: FIXED_HEADER_LEN - buf.len(),
            });
        }
        let mut fixed = [0u8; FIXED_HEADER_LEN];
        fixed.copy_from_slice(&buf[..FIXED_HEADER_LEN]);
        let fixed = FixedHeader::parse(&fixed)?;
        let fields_end = FIXED_HEADER_LEN + fixed.fields_len as usize;
        let body_start = align_num(fields_end, 8);
        let total = body_start + fixed.body_len as usize;
        if buf.len() < total {
            return Err(DecodeError::Truncated {
                offset: buf.len(),
                needed: total - buf.len(),
            });
        }
        let msg = Message::from_parts(
            fixed,
            &buf[FIXED_HEADER_LEN..body_start],
            buf[body_start..total].to_vec(),
        )?;
        Ok((msg, total))
    }

    /// Assembles a message from a parsed fixed header, the raw field-array
    /// region (including its trailing padding), and the body bytes.
    pub(crate) fn from_parts(
        fixed: FixedHeader,
        fields_region: &[u8],
        body: Vec<u8>,
    ) -> Result<Message, DecodeError> {
        let mut header = Header::default();
        let mut body_sig = Signature::empty();
        let mut r = Reader::new(fields_region, fixed.order);
        while r.pos() < fixed.fields_len as usize {
            r.align_to(8)?;
            let code = r.read_u8()?;
            let val = match r.read_value("v")? {
                Value::Variant(inner) => *inner,
                _ => unreachable!("variant signature decodes to a variant"),
            };
            match (code, val) {
                (FIELD_PATH, Value::Path(p)) => header.path = Some(p.into_string()),
                (FIELD_INTERFACE, Value::Str(s)) => header.interface = Some(s),
                (FIELD_MEMBER, Value::Str(s)) => header.member = Some(s),
                (FIELD_ERROR_NAME, Value::Str(s)) => header.error_name = Some(s),
                (FIELD_REPLY_SERIAL, Value::UInt32(u)) => {
                    let serial =
                        NonZeroU32::new(u).ok_or(DecodeError::Header("zero reply serial"))?;
                    header.reply_serial = Some(serial);
                }
                (FIELD_DESTINATION, Value::Str(s)) => header.destination = Some(s),
                (FIELD_SENDER, Value::Str(s)) => header.sender = Some(s),
                (FIELD_SIGNATURE, Value::Sig(s)) => body_sig = s,
                (FIELD_PATH..=FIELD_SIGNATURE, _) => {
                    return Err(DecodeError::Header("header field has the wrong type"))
                }
                // unknown field codes are ignored for forward compatibility
                _ => {}
            }
        }
        if r.pos() > fixed.fields_len as usize {
            return Err(DecodeError::Header("field array length mismatch"));
        }
        r.align_to(8)?;
        let msg = Message {
            typ: fixed.typ,
            flags: fixed.flags,
            serial: Some(fixed.serial),
            header,
            body: Body::from_parts(body, body_sig, fixed.order),
        };
        msg.required_fields().map_err(DecodeError::Header)?;
        if let Some(path) = &msg.header.path {
            ObjectPath::new(path)?;
        }
        Ok(msg)
    }
}

/// The fixed sixteen bytes at the front of every message.
#[derive(Debug, Clone, Copy)]
pub struct FixedHeader {
    pub order: ByteOrder,
    pub typ: MessageType,
    pub flags: u8,
    pub body_len: u32,
    pub serial: NonZeroU32,
    pub fields_len: u32,
}

impl FixedHeader {
    pub fn parse(buf: &[u8; FIXED_HEADER_LEN]) -> Result<Self, DecodeError> {
        let order = ByteOrder::from_marker(buf[0])?;
        let typ = MessageType::from_wire(buf[1])?;
        let flags = buf[2];
        if buf[3] != PROTOCOL_VERSION {
            return Err(DecodeError::Header("unsupported protocol version"));
        }
        let mut r = Reader::new(&buf[4..], order);
        let body_len = r.read_u32().expect("12 bytes remain");
        let serial = r.read_u32().expect("8 bytes remain");
        let fields_len = r.read_u32().expect("4 bytes remain");
        let serial = NonZeroU32::new(serial).ok_or(DecodeError::Header("zero serial"))?;
        let total = FIXED_HEADER_LEN as u64
            + align_num(fields_len as u64, 8)
            + body_len as u64;
        if total > MAX_MESSAGE_LEN {
            return Err(DecodeError::MessageTooLong(total));
        }
        Ok(FixedHeader {
            order,
            typ,
            flags,
            body_len,
            serial,
            fields_len,
        })
    }
    /// Offset of the body from the start of the frame.
    pub fn body_offset(&self) -> usize {
        align_num(FIXED_HEADER_LEN + self.fields_len as usize, 8)
    }
}

/// Starting point for new messages. Create either a call or a signal.
#[derive(Default)]
pub struct MessageBuilder {
    msg: Message,
}

/// Created by [`MessageBuilder::call`]; addresses a new method call.
pub struct CallBuilder {
    msg: Message,
}

/// Created by [`MessageBuilder::signal`]; addresses a new signal.
pub struct SignalBuilder {
    msg: Message,
}

impl Default for Message {
    fn default() -> Self {
        Message::new(MessageType::Call)
    }
}

impl MessageBuilder {
    pub fn new() -> MessageBuilder {
        MessageBuilder {
            msg: Message::new(MessageType::Call),
        }
    }
    pub fn with_byteorder(order: ByteOrder) -> MessageBuilder {
        let mut msg = Message::new(MessageType::Call);
        msg.body = Body::with_order(order);
        MessageBuilder { msg }
    }
    pub fn call<S: Into<String>>(mut self, member: S) -> CallBuilder {
        self.msg.typ = MessageType::Call;
        self.msg.header.member = Some(member.into());
        CallBuilder { msg: self.msg }
    }
    pub fn signal<S1, S2, S3>(mut self, interface: S1, member: S2, path: S3) -> SignalBuilder
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        self.msg.typ = MessageType::Signal;
        self.msg.header.interface = Some(interface.into());
        self.msg.header.member = Some(member.into());
        self.msg.header.path = Some(path.into());
        SignalBuilder { msg: self.msg }
    }
}

impl CallBuilder {
    pub fn on<S: Into<String>>(mut self, path: S) -> Self {
        self.msg.header.path = Some(path.into());
        self
    }
    pub fn with_interface<S: Into<String>>(mut self, interface: S) -> Self {
        self.msg.header.interface = Some(interface.into());
        self
    }
    pub fn at<S: Into<String>>(mut self, destination: S) -> Self {
        self.msg.header.destination = Some(destination.into());
        self
    }
    pub fn without_reply(mut self) -> Self {
        self.msg.flags |= NO_REPLY_EXPECTED;
        self
    }
    pub fn build(self) -> Message {
        self.msg
    }
}

impl SignalBuilder {
    pub fn to<S: Into<String>>(mut self, destination: S) -> Self {
        self.msg.header.destination = Some(destination.into());
        self
    }
    pub fn build(self) -> Message {
        self.msg
    }
}
