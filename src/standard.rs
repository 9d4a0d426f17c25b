//! Calls and constants of the standard bus interface.
//!
//! The bus daemon itself owns a well-known name and object; name
//! registration, match-rule management and the initial Hello exchange all
//! go through it.

use std::convert::TryInto;

use crate::message::{Message, MessageBuilder};
use crate::wire::Value;

/// The bus daemon's own well-known name.
pub const BUS_NAME: &str = "org.freedesktop.DBus";
/// The bus daemon's object path.
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
/// The bus daemon's interface.
pub const BUS_IFACE: &str = "org.freedesktop.DBus";

/// Interface of the standard introspection method.
pub const INTROSPECTABLE_IFACE: &str = "org.freedesktop.DBus.Introspectable";
/// Interface of the standard liveness methods.
pub const PEER_IFACE: &str = "org.freedesktop.DBus.Peer";

/// Error returned when no handler matches a call's path or member.
pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
/// Error returned when a registered handler panicked.
pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";

/// Signal emitted to a connection that gained ownership of a name.
pub const NAME_ACQUIRED: &str = "NameAcquired";
/// Signal emitted to a connection that lost ownership of a name.
pub const NAME_LOST: &str = "NameLost";
/// Broadcast signal emitted on every ownership change.
pub const NAME_OWNER_CHANGED: &str = "NameOwnerChanged";

/// Name-request flag: permit another connection to take this name from us.
pub const NAME_ALLOW_REPLACEMENT: u32 = 0x1;
/// Name-request flag: take the name from a replaceable current owner.
pub const NAME_REPLACE_EXISTING: u32 = 0x2;
/// Name-request flag: fail instead of queueing behind the current owner.
pub const NAME_DO_NOT_QUEUE: u32 = 0x4;

/// Outcomes of a RequestName call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
}

impl RequestNameReply {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(RequestNameReply::PrimaryOwner),
            2 => Some(RequestNameReply::InQueue),
            3 => Some(RequestNameReply::Exists),
            4 => Some(RequestNameReply::AlreadyOwner),
            _ => None,
        }
    }
}

/// Outcomes of a ReleaseName call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released,
    NonExistent,
    NotOwner,
}

impl ReleaseNameReply {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(ReleaseNameReply::Released),
            2 => Some(ReleaseNameReply::NonExistent),
            3 => Some(ReleaseNameReply::NotOwner),
            _ => None,
        }
    }
}

fn bus_call(member: &str) -> Message {
    MessageBuilder::new()
        .call(member)
        .on(BUS_PATH)
        .with_interface(BUS_IFACE)
        .at(BUS_NAME)
        .build()
}

fn bus_call_str(member: &str, arg: &str) -> Message {
    let mut msg = bus_call(member);
    msg.body
        .push(&Value::from(arg))
        .expect("a lone string always encodes");
    msg
}

/// The mandatory first call on a new connection; the reply carries the
/// connection's unique name.
pub fn hello() -> Message {
    bus_call("Hello")
}

pub fn request_name(name: &str, flags: u32) -> Message {
    let mut msg = bus_call_str("RequestName", name);
    msg.body
        .push(&Value::UInt32(flags))
        .expect("a u32 always encodes");
    msg
}

pub fn release_name(name: &str) -> Message {
    bus_call_str("ReleaseName", name)
}

pub fn add_match(rule: &str) -> Message {
    bus_call_str("AddMatch", rule)
}

pub fn remove_match(rule: &str) -> Message {
    bus_call_str("RemoveMatch", rule)
}

pub fn get_name_owner(name: &str) -> Message {
    bus_call_str("GetNameOwner", name)
}

/// Extracts the single u32 reply code from a bus reply body.
pub fn reply_code(msg: &Message) -> Option<u32> {
    let mut r = msg.body.reader();
    if msg.body.sig().as_str() != "u" {
        return None;
    }
    r.read_u32().ok()
}

/// Extracts the single string from a bus reply body.
pub fn reply_string(msg: &Message) -> Option<String> {
    if msg.body.sig().as_str() != "s" {
        return None;
    }
    msg.body.reader().read_string().ok().map(str::to_string)
}

/// Splits a NameOwnerChanged signal body into (name, old_owner, new_owner).
pub fn name_owner_changed(msg: &Message) -> Option<(String, String, String)> {
    if msg.body.sig().as_str() != "sss" {
        return None;
    }
    let vals = msg.body.values().ok()?;
    let [name, old, new]: [Value; 3] = vals.try_into().ok()?;
    match (name, old, new) {
        (Value::Str(name), Value::Str(old), Value::Str(new)) => Some((name, old, new)),
        _ => None,
    }
}
