//! An in-process bus daemon for integration tests.
//!
//! Speaks just enough of the bus protocol for the client under test:
//! Hello, name registration with queueing and replacement, match-rule
//! bookkeeping, signal broadcast and call/reply forwarding.

#![allow(dead_code)]

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};

use async_wirebus::standard::{
    BUS_IFACE, BUS_NAME, BUS_PATH, NAME_ACQUIRED, NAME_ALLOW_REPLACEMENT, NAME_DO_NOT_QUEUE,
    NAME_LOST, NAME_OWNER_CHANGED, NAME_REPLACE_EXISTING,
};
use async_wirebus::wire::Value;
use async_wirebus::{transport, MatchRule, Message, MessageBuilder, MessageType};
use tokio::io::DuplexStream;

const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";

pub struct TestBus {
    state: Arc<Mutex<State>>,
}

struct ConnEntry {
    tx: async_channel::Sender<Vec<u8>>,
    rules: Vec<MatchRule>,
}

struct NameOwnership {
    owner: String,
    allow_replacement: bool,
    queue: Vec<(String, u32)>,
}

struct State {
    next_conn: u32,
    serial: u32,
    conns: HashMap<String, ConnEntry>,
    names: HashMap<String, NameOwnership>,
}

impl State {
    fn bus_serial(&mut self) -> NonZeroU32 {
        self.serial += 1;
        NonZeroU32::new(self.serial).expect("bus serial starts at 1")
    }
    fn deliver(&mut self, target: &str, msg: &Message) {
        let serial = match msg.serial {
            Some(serial) => serial,
            None => self.bus_serial(),
        };
        if let Some(conn) = self.conns.get(target) {
            if let Ok(frame) = msg.marshal(serial) {
                let _ = conn.tx.try_send(frame);
            }
        }
    }
    fn bus_signal(&mut self, member: &str, args: &[&str]) -> Message {
        let mut sig = MessageBuilder::new()
            .signal(BUS_IFACE, member, BUS_PATH)
            .build();
        sig.header.sender = Some(BUS_NAME.to_string());
        for arg in args {
            sig.body
                .push(&Value::from(*arg))
                .expect("a lone string always encodes");
        }
        sig
    }
    /// Directed signal straight to one connection, no rule needed.
    fn send_directed(&mut self, target: &str, member: &str, name: &str) {
        let mut sig = self.bus_signal(member, &[name]);
        sig.header.destination = Some(target.to_string());
        self.deliver(target, &sig);
    }
    /// NameOwnerChanged to every connection with a matching rule.
    fn broadcast_owner_changed(&mut self, name: &str, old: &str, new: &str) {
        let sig = self.bus_signal(NAME_OWNER_CHANGED, &[name, old, new]);
        self.broadcast(&sig);
    }
    fn broadcast(&mut self, sig: &Message) {
        let targets: Vec<String> = self
            .conns
            .iter()
            .filter(|(_, conn)| conn.rules.iter().any(|r| r.matches(sig)))
            .map(|(unique, _)| unique.clone())
            .collect();
        for target in targets {
            self.deliver(&target, sig);
        }
    }
    /// Gives `name` to the next queued requester, if any.
    fn promote(&mut self, name: &str) {
        let mut promoted = None;
        let mut orphaned = None;
        if let Some(entry) = self.names.get_mut(name) {
            if entry.queue.is_empty() {
                orphaned = Some(entry.owner.clone());
            } else {
                let (next, flags) = entry.queue.remove(0);
                let old = std::mem::replace(&mut entry.owner, next.clone());
                entry.allow_replacement = flags & NAME_ALLOW_REPLACEMENT != 0;
                promoted = Some((next, old));
            }
        }
        if let Some(old) = orphaned {
            self.names.remove(name);
            self.broadcast_owner_changed(name, &old, "");
        }
        if let Some((next, old)) = promoted {
            self.send_directed(&next, NAME_ACQUIRED, name);
            self.broadcast_owner_changed(name, &old, &next);
        }
    }
    fn release(&mut self, name: &str, unique: &str) -> u32 {
        let released = match self.names.get_mut(name) {
            None => return 2, // NonExistent
            Some(entry) if entry.owner != unique => {
                entry.queue.retain(|(queued, _)| queued != unique);
                false
            }
            Some(_) => true,
        };
        if !released {
            return 3; // NotOwner
        }
        self.send_directed(unique, NAME_LOST, name);
        self.promote(name);
        1 // Released
    }
    fn drop_conn(&mut self, unique: &str) {
        self.conns.remove(unique);
        let owned: Vec<String> = self
            .names
            .iter()
            .filter(|(_, entry)| entry.owner == unique)
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            self.promote(&name);
        }
        for entry in self.names.values_mut() {
            entry.queue.retain(|(queued, _)| queued != unique);
        }
    }
}

impl TestBus {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        TestBus {
            state: Arc::new(Mutex::new(State {
                next_conn: 0,
                serial: 0,
                conns: HashMap::new(),
                names: HashMap::new(),
            })),
        }
    }

    /// Opens a new client connection to the bus.
    pub fn client(&self) -> DuplexStream {
        let (local, remote) = tokio::io::duplex(1 << 16);
        let state = self.state.clone();
        tokio::spawn(serve(state, remote));
        local
    }

    /// Total match rules registered across all connections.
    pub fn total_rules(&self) -> usize {
        self.lock().conns.values().map(|c| c.rules.len()).sum()
    }

    /// The current owner of a well-known name.
    pub fn owner_of(&self, name: &str) -> Option<String> {
        self.lock().names.get(name).map(|e| e.owner.clone())
    }

    fn lock(&self) -> MutexGuard<State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Polls `cond` for up to two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not met within two seconds");
}

async fn serve(state: Arc<Mutex<State>>, stream: DuplexStream) {
    let (mut read, mut write) = tokio::io::split(stream);
    let (tx, rx) = async_channel::unbounded::<Vec<u8>>();
    tokio::spawn(async move {
        while let Ok(frame) = rx.recv().await {
            if transport::write_frame(&mut write, &frame).await.is_err() {
                return;
            }
        }
    });
    let mut unique = None;
    loop {
        let msg = match transport::read_message(&mut read).await {
            Ok(msg) => msg,
            Err(_) => break,
        };
        handle(&state, &tx, &mut unique, msg);
    }
    if let Some(unique) = unique {
        state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drop_conn(&unique);
    }
}

fn handle(
    state: &Arc<Mutex<State>>,
    tx: &async_channel::Sender<Vec<u8>>,
    unique: &mut Option<String>,
    mut msg: Message,
) {
    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
    let sender = match unique {
        Some(sender) => sender.clone(),
        None => {
            // the first message must be Hello
            if msg.typ != MessageType::Call || msg.header.member.as_deref() != Some("Hello") {
                return;
            }
            state.next_conn += 1;
            let assigned = format!(":1.{}", state.next_conn);
            state.conns.insert(
                assigned.clone(),
                ConnEntry {
                    tx: tx.clone(),
                    rules: Vec::new(),
                },
            );
            *unique = Some(assigned.clone());
            msg.header.sender = Some(assigned.clone());
            let mut reply = msg.make_reply();
            reply.header.sender = Some(BUS_NAME.to_string());
            reply
                .body
                .push(&Value::from(assigned.as_str()))
                .expect("a lone string always encodes");
            state.deliver(&assigned, &strip_serial(reply));
            return;
        }
    };
    msg.header.sender = Some(sender.clone());
    match msg.typ {
        MessageType::Call if msg.header.destination.as_deref() == Some(BUS_NAME) => {
            bus_method(&mut state, &sender, &msg);
        }
        MessageType::Signal => match msg.header.destination.clone() {
            Some(dest) => {
                if let Some(target) = resolve(&state, &dest) {
                    state.deliver(&target, &msg);
                }
            }
            None => state.broadcast(&msg),
        },
        _ => {
            let dest = msg.header.destination.clone().unwrap_or_default();
            match resolve(&state, &dest) {
                Some(target) => state.deliver(&target, &msg),
                None => {
                    if msg.expects_reply() {
                        let text = format!("no owner for {}", dest);
                        bus_error(&mut state, &sender, &msg, SERVICE_UNKNOWN, text);
                    }
                }
            }
        }
    }
}

fn resolve(state: &State, dest: &str) -> Option<String> {
    if dest.starts_with(':') {
        state.conns.contains_key(dest).then(|| dest.to_string())
    } else {
        state.names.get(dest).map(|entry| entry.owner.clone())
    }
}

/// Clears the received serial so `deliver` assigns a fresh bus serial.
fn strip_serial(mut msg: Message) -> Message {
    msg.serial = None;
    msg
}

fn bus_reply(state: &mut State, sender: &str, msg: &Message, body: Option<Value>) {
    if !msg.expects_reply() {
        return;
    }
    let mut reply = msg.make_reply();
    reply.header.sender = Some(BUS_NAME.to_string());
    if let Some(value) = body {
        reply.body.push(&value).expect("bus reply bodies encode");
    }
    state.deliver(sender, &strip_serial(reply));
}

fn bus_error(state: &mut State, sender: &str, msg: &Message, name: &str, text: String) {
    if !msg.expects_reply() {
        return;
    }
    let mut reply = msg.make_error_reply(name, Some(text));
    reply.header.sender = Some(BUS_NAME.to_string());
    state.deliver(sender, &strip_serial(reply));
}

fn string_arg(msg: &Message, idx: usize) -> Option<String> {
    let vals = msg.body.values().ok()?;
    vals.get(idx)?.as_str().map(str::to_string)
}

fn bus_method(state: &mut State, sender: &str, msg: &Message) {
    match msg.header.member.as_deref() {
        Some("RequestName") => {
            let (name, flags) = match (string_arg(msg, 0), arg_u32(msg, 1)) {
                (Some(name), Some(flags)) => (name, flags),
                _ => {
                    return bus_error(
                        state,
                        sender,
                        msg,
                        INVALID_ARGS,
                        "expected (su)".to_string(),
                    )
                }
            };
            let code = request_name(state, sender, &name, flags);
            bus_reply(state, sender, msg, Some(Value::UInt32(code)));
        }
        Some("ReleaseName") => {
            let name = match string_arg(msg, 0) {
                Some(name) => name,
                None => {
                    return bus_error(
                        state,
                        sender,
                        msg,
                        INVALID_ARGS,
                        "expected (s)".to_string(),
                    )
                }
            };
            let code = state.release(&name, sender);
            bus_reply(state, sender, msg, Some(Value::UInt32(code)));
        }
        Some("AddMatch") => {
            let rule = string_arg(msg, 0).and_then(|text| text.parse::<MatchRule>().ok());
            match rule {
                Some(rule) => {
                    if let Some(conn) = state.conns.get_mut(sender) {
                        conn.rules.push(rule);
                    }
                    bus_reply(state, sender, msg, None);
                }
                None => bus_error(
                    state,
                    sender,
                    msg,
                    INVALID_ARGS,
                    "unparsable match rule".to_string(),
                ),
            }
        }
        Some("RemoveMatch") => {
            let rule = string_arg(msg, 0).and_then(|text| text.parse::<MatchRule>().ok());
            if let (Some(rule), Some(conn)) = (rule, state.conns.get_mut(sender)) {
                if let Some(pos) = conn.rules.iter().position(|r| *r == rule) {
                    conn.rules.remove(pos);
                }
            }
            bus_reply(state, sender, msg, None);
        }
        Some("GetNameOwner") => match string_arg(msg, 0).and_then(|n| resolve(state, &n)) {
            Some(owner) => bus_reply(state, sender, msg, Some(Value::from(owner))),
            None => bus_error(
                state,
                sender,
                msg,
                SERVICE_UNKNOWN,
                "name has no owner".to_string(),
            ),
        },
        other => bus_error(
            state,
            sender,
            msg,
            UNKNOWN_METHOD,
            format!("bus does not implement {:?}", other),
        ),
    }
}

fn arg_u32(msg: &Message, idx: usize) -> Option<u32> {
    let vals = msg.body.values().ok()?;
    vals.get(idx)?.as_u32()
}

enum NameDecision {
    New,
    AlreadyOwner,
    Replaced(String),
    Exists,
    Queued,
}

fn request_name(state: &mut State, sender: &str, name: &str, flags: u32) -> u32 {
    let decision = match state.names.get_mut(name) {
        None => NameDecision::New,
        Some(entry) if entry.owner == sender => NameDecision::AlreadyOwner,
        Some(entry) => {
            if entry.allow_replacement && flags & NAME_REPLACE_EXISTING != 0 {
                let old = std::mem::replace(&mut entry.owner, sender.to_string());
                entry.allow_replacement = flags & NAME_ALLOW_REPLACEMENT != 0;
                NameDecision::Replaced(old)
            } else if flags & NAME_DO_NOT_QUEUE != 0 {
                NameDecision::Exists
            } else {
                entry.queue.push((sender.to_string(), flags));
                NameDecision::Queued
            }
        }
    };
    match decision {
        NameDecision::New => {
            state.names.insert(
                name.to_string(),
                NameOwnership {
                    owner: sender.to_string(),
                    allow_replacement: flags & NAME_ALLOW_REPLACEMENT != 0,
                    queue: Vec::new(),
                },
            );
            state.send_directed(sender, NAME_ACQUIRED, name);
            state.broadcast_owner_changed(name, "", sender);
            1 // PrimaryOwner
        }
        NameDecision::Replaced(old) => {
            // the displaced owner hears about the loss first
            state.send_directed(&old, NAME_LOST, name);
            state.send_directed(sender, NAME_ACQUIRED, name);
            state.broadcast_owner_changed(name, &old, sender);
            1 // PrimaryOwner
        }
        NameDecision::Queued => 2,       // InQueue
        NameDecision::Exists => 3,       // Exists
        NameDecision::AlreadyOwner => 4, // AlreadyOwner
    }
}
