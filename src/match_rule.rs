//! Match rules: predicates over messages with a canonical textual form.
//!
//! The textual syntax is the bus's `key='value'` list. Rendering a rule
//! always produces the same canonical ordering (type first, then the
//! header fields in field-code order, then argument matches by ascending
//! index), so equal rules render identically and the rendered string is
//! usable as a registry key.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Write};
use std::str::FromStr;

use crate::error::MatchRuleError;
use crate::message::{Message, MessageType};
use crate::wire::{MAX_MATCH_ARG, MAX_MATCH_RULE_LEN};

/// A predicate over messages, matched against headers and leading
/// string-typed body arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MatchRule {
    typ: Option<MessageType>,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    destination: Option<String>,
    sender: Option<String>,
    args: BTreeMap<u32, String>,
    arg_paths: BTreeMap<u32, String>,
}

impl MatchRule {
    pub fn new() -> Self {
        MatchRule::default()
    }
    /// Convenience rule for one signal: sender, path, interface and member.
    pub fn signal(interface: &str, member: &str) -> Self {
        let mut ret = MatchRule::new();
        ret.typ = Some(MessageType::Signal);
        ret.interface = Some(interface.to_string());
        ret.member = Some(member.to_string());
        ret
    }
    pub fn msg_type(mut self, typ: MessageType) -> Self {
        self.typ = Some(typ);
        self
    }
    pub fn path<S: Into<String>>(mut self, path: S) -> Self {
        self.path = Some(path.into());
        self
    }
    pub fn interface<S: Into<String>>(mut self, interface: S) -> Self {
        self.interface = Some(interface.into());
        self
    }
    pub fn member<S: Into<String>>(mut self, member: S) -> Self {
        self.member = Some(member.into());
        self
    }
    pub fn destination<S: Into<String>>(mut self, destination: S) -> Self {
        self.destination = Some(destination.into());
        self
    }
    pub fn sender<S: Into<String>>(mut self, sender: S) -> Self {
        self.sender = Some(sender.into());
        self
    }
    /// Requires body argument `idx` to be a string equal to `value`.
    pub fn arg<S: Into<String>>(mut self, idx: u32, value: S) -> Result<Self, MatchRuleError> {
        if idx > MAX_MATCH_ARG {
            return Err(MatchRuleError::ArgIndex(idx));
        }
        self.args.insert(idx, value.into());
        Ok(self)
    }
    /// Requires body argument `idx` to be a string or object path related
    /// to `value` by path-prefix semantics.
    pub fn arg_path<S: Into<String>>(mut self, idx: u32, value: S) -> Result<Self, MatchRuleError> {
        if idx > MAX_MATCH_ARG {
            return Err(MatchRuleError::ArgIndex(idx));
        }
        self.arg_paths.insert(idx, value.into());
        Ok(self)
    }

    fn type_token(typ: MessageType) -> &'static str {
        match typ {
            MessageType::Call => "method_call",
            MessageType::Reply => "method_return",
            MessageType::Error => "error",
            MessageType::Signal => "signal",
        }
    }

    /// Whether the rule matches the message, testing header fields first
    /// and body arguments last.
    pub fn matches(&self, msg: &Message) -> bool {
        self.matches_header(msg) && self.test_args(msg)
    }

    /// Tests only the type and header-field constraints.
    pub fn matches_header(&self, msg: &Message) -> bool {
        if let Some(typ) = self.typ {
            if typ != msg.typ {
                return false;
            }
        }
        let fields = [
            (&self.path, &msg.header.path),
            (&self.interface, &msg.header.interface),
            (&self.member, &msg.header.member),
            (&self.destination, &msg.header.destination),
            (&self.sender, &msg.header.sender),
        ];
        fields
            .iter()
            .all(|(want, got)| match want {
                Some(want) => got.as_deref() == Some(want.as_str()),
                None => true,
            })
    }

    /// Tests the argument constraints in one forward pass over the body.
    ///
    /// The scan never rewinds: constraints are visited in ascending index
    /// order and an index already passed (both an `argN` and an `argNpath`
    /// on the same position) can never match.
    pub fn test_args(&self, msg: &Message) -> bool {
        if self.args.is_empty() && self.arg_paths.is_empty() {
            return true;
        }
        let sig = msg.body.sig();
        if sig.is_empty() {
            return false;
        }
        let mut r = msg.body.reader();
        let mut types = sig.iter();
        let mut cursor = 0u32;
        for (idx, value, is_path) in merge_args(&self.args, &self.arg_paths) {
            if idx < cursor {
                return false;
            }
            while cursor < idx {
                match types.next() {
                    Some(typ) if r.step_over(typ).is_ok() => cursor += 1,
                    _ => return false,
                }
            }
            let typ = match types.next() {
                Some(typ) => typ,
                None => return false,
            };
            cursor += 1;
            match typ {
                "s" => {}
                "o" if is_path => {}
                _ => return false,
            }
            let got = match r.read_string() {
                Ok(got) => got,
                Err(_) => return false,
            };
            let hit = if is_path {
                got == value
                    || (value.ends_with('/') && got.starts_with(value))
                    || (got.ends_with('/') && value.starts_with(got))
            } else {
                got == value
            };
            if !hit {
                return false;
            }
        }
        true
    }
}

/// Argument constraints in ascending index order, `argN` before `argNpath`.
fn merge_args<'a>(
    args: &'a BTreeMap<u32, String>,
    arg_paths: &'a BTreeMap<u32, String>,
) -> impl Iterator<Item = (u32, &'a str, bool)> {
    let mut merged: Vec<(u32, &str, bool)> = args
        .iter()
        .map(|(&i, v)| (i, v.as_str(), false))
        .chain(arg_paths.iter().map(|(&i, v)| (i, v.as_str(), true)))
        .collect();
    merged.sort_by_key(|&(i, _, is_path)| (i, is_path));
    merged.into_iter()
}

fn write_token(out: &mut String, key: &str, value: &str) {
    if !out.is_empty() {
        out.push(',');
    }
    out.push_str(key);
    out.push_str("='");
    for c in value.chars() {
        if c == '\\' || c == '\'' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
}

impl Display for MatchRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut out = String::new();
        if let Some(typ) = self.typ {
            write_token(&mut out, "type", Self::type_token(typ));
        }
        let fields = [
            ("path", &self.path),
            ("interface", &self.interface),
            ("member", &self.member),
            ("destination", &self.destination),
            ("sender", &self.sender),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                write_token(&mut out, key, value);
            }
        }
        for (idx, value, is_path) in merge_args(&self.args, &self.arg_paths) {
            let mut key = String::new();
            write!(key, "arg{}", idx).expect("writing to a String cannot fail");
            if is_path {
                key.push_str("path");
            }
            write_token(&mut out, &key, value);
        }
        f.write_str(&out)
    }
}

impl FromStr for MatchRule {
    type Err = MatchRuleError;

    fn from_str(text: &str) -> Result<Self, MatchRuleError> {
        if text.len() > MAX_MATCH_RULE_LEN {
            return Err(MatchRuleError::TooLong);
        }
        let mut rule = MatchRule::new();
        let bytes = text.as_bytes();
        let mut pos = 0;
        while pos < bytes.len() {
            let token_start = pos;
            let eq = text[pos..]
                .find('=')
                .map(|i| pos + i)
                .ok_or(MatchRuleError::Syntax(token_start))?;
            let key = &text[pos..eq];
            if key.is_empty() {
                return Err(MatchRuleError::Syntax(token_start));
            }
            pos = eq + 1;
            if bytes.get(pos) != Some(&b'\'') {
                return Err(MatchRuleError::Syntax(token_start));
            }
            pos += 1;
            let mut value = String::new();
            loop {
                match bytes.get(pos) {
                    None => return Err(MatchRuleError::Syntax(token_start)),
                    Some(b'\'') => {
                        pos += 1;
                        break;
                    }
                    Some(b'\\') => {
                        // the escaped character may be multi-byte
                        let escaped = text[pos + 1..]
                            .chars()
                            .next()
                            .ok_or(MatchRuleError::Syntax(token_start))?;
                        value.push(escaped);
                        pos += 1 + escaped.len_utf8();
                    }
                    Some(_) => {
                        // values are validated as UTF-8 by the &str input
                        let c = text[pos..].chars().next().expect("in bounds");
                        value.push(c);
                        pos += c.len_utf8();
                    }
                }
            }
            match bytes.get(pos) {
                None => {}
                Some(b',') => pos += 1,
                Some(_) => return Err(MatchRuleError::Syntax(pos)),
            }
            rule.apply_token(key, value)?;
        }
        Ok(rule)
    }
}

impl MatchRule {
    fn apply_token(&mut self, key: &str, value: String) -> Result<(), MatchRuleError> {
        match key {
            "type" => {
                self.typ = Some(match value.as_str() {
                    "method_call" => MessageType::Call,
                    "method_return" => MessageType::Reply,
                    "error" => MessageType::Error,
                    "signal" => MessageType::Signal,
                    _ => return Err(MatchRuleError::BadType(value)),
                });
            }
            "path" => self.path = Some(value),
            "interface" => self.interface = Some(value),
            "member" => self.member = Some(value),
            "destination" => self.destination = Some(value),
            "sender" => self.sender = Some(value),
            _ if key.starts_with("arg") => {
                let rest = &key[3..];
                let (digits, is_path) = match rest.strip_suffix("path") {
                    Some(digits) => (digits, true),
                    None => (rest, false),
                };
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(MatchRuleError::BadArgKey(key.to_string()));
                }
                let idx: u32 = digits
                    .parse()
                    .map_err(|_| MatchRuleError::BadArgKey(key.to_string()))?;
                if idx > MAX_MATCH_ARG {
                    return Err(MatchRuleError::ArgIndex(idx));
                }
                if is_path {
                    self.arg_paths.insert(idx, value);
                } else {
                    self.args.insert(idx, value);
                }
            }
            // unknown keys are ignored for forward compatibility
            _ => {}
        }
        Ok(())
    }
}
