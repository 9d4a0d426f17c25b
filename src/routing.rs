//! Routing of incoming method calls to registered object handlers.
//!
//! Handlers are registered at exact object paths and stored in a tree
//! keyed by path component, so introspection can enumerate the children
//! of any registered or intermediate node. Removing a handler prunes
//! every intermediate node that no longer leads anywhere.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;

use crate::message::Message;
use crate::path::ObjectPath;
use crate::standard::{FAILED, INTROSPECTABLE_IFACE, PEER_IFACE, UNKNOWN_METHOD};
use crate::wire::Value;

/// A registered method-call handler. Returning `None` means the handler
/// produced no reply of its own; the dispatcher sends an empty reply if
/// the caller expects one.
pub type MethodHandler = Arc<dyn Fn(&Message) -> Option<Message> + Send + Sync>;

struct Node {
    children: HashMap<String, Node>,
    handler: Option<MethodHandler>,
}

impl Node {
    fn new() -> Self {
        Node {
            children: HashMap::new(),
            handler: None,
        }
    }
    fn find<'a>(&self, mut comps: impl Iterator<Item = &'a str>) -> Option<&Node> {
        match comps.next() {
            Some(comp) => self.children.get(comp)?.find(comps),
            None => Some(self),
        }
    }
    fn insert<'a>(&mut self, mut comps: impl Iterator<Item = &'a str>, handler: MethodHandler) {
        match comps.next() {
            Some(comp) => self
                .children
                .entry(comp.to_string())
                .or_insert_with(Node::new)
                .insert(comps, handler),
            None => self.handler = Some(handler),
        }
    }
    /// Returns whether the path was registered; prunes emptied subtrees
    /// on the way back up.
    fn remove<'a>(&mut self, mut comps: impl Iterator<Item = &'a str>) -> bool {
        match comps.next() {
            Some(comp) => match self.children.get_mut(comp) {
                Some(child) => {
                    let removed = child.remove(comps);
                    if child.handler.is_none() && child.children.is_empty() {
                        self.children.remove(comp);
                    }
                    removed
                }
                None => false,
            },
            None => self.handler.take().is_some(),
        }
    }
}

/// The registered objects of one connection.
pub struct ObjectTree {
    root: Node,
    machine_id: String,
}

impl ObjectTree {
    pub fn new(machine_id: String) -> Self {
        ObjectTree {
            root: Node::new(),
            machine_id,
        }
    }
    /// Registers a handler, replacing any previous one at the same path.
    /// Returns whether a handler was replaced.
    pub fn insert(&mut self, path: &ObjectPath, handler: MethodHandler) -> bool {
        let replaced = self
            .root
            .find(path.components())
            .map_or(false, |node| node.handler.is_some());
        self.root.insert(path.components(), handler);
        replaced
    }
    /// Unregisters the handler at `path`, if any.
    pub fn remove(&mut self, path: &ObjectPath) -> bool {
        self.root.remove(path.components())
    }
    /// The handler registered at exactly `path`.
    pub fn handler(&self, path: &ObjectPath) -> Option<MethodHandler> {
        self.root.find(path.components())?.handler.clone()
    }
    /// Whether `path` is a registered object or an ancestor of one.
    pub fn contains(&self, path: &ObjectPath) -> bool {
        self.root.find(path.components()).is_some()
    }

    /// Routes one method call, handling the standard interfaces inline.
    ///
    /// Returns either a ready reply or the user handler to invoke, so the
    /// handler can run outside any lock the caller holds.
    pub fn route(&self, msg: &Message) -> Routed {
        let path = match msg.header.path.as_deref().and_then(|p| ObjectPath::new(p).ok()) {
            Some(path) => path,
            None => return Routed::Reply(unknown_method(msg)),
        };
        match msg.header.interface.as_deref() {
            Some(PEER_IFACE) => return Routed::Reply(self.peer_call(msg)),
            Some(INTROSPECTABLE_IFACE) => return Routed::Reply(self.introspect_call(msg, path)),
            _ => {}
        }
        match self.handler(path) {
            Some(handler) => Routed::Handler(handler),
            None => Routed::Reply(unknown_method(msg)),
        }
    }

    fn peer_call(&self, msg: &Message) -> Option<Message> {
        match msg.header.member.as_deref() {
            Some("Ping") => {
                if msg.expects_reply() {
                    Some(msg.make_reply())
                } else {
                    None
                }
            }
            Some("GetMachineId") => {
                if !msg.expects_reply() {
                    return None;
                }
                let mut reply = msg.make_reply();
                reply
                    .body
                    .push(&Value::from(self.machine_id.as_str()))
                    .expect("a lone string always encodes");
                Some(reply)
            }
            _ => unknown_method(msg),
        }
    }

    fn introspect_call(&self, msg: &Message, path: &ObjectPath) -> Option<Message> {
        if msg.header.member.as_deref() != Some("Introspect") {
            return unknown_method(msg);
        }
        let node = match self.root.find(path.components()) {
            Some(node) => node,
            None => return unknown_method(msg),
        };
        if !msg.expects_reply() {
            return None;
        }
        let mut reply = msg.make_reply();
        reply
            .body
            .push(&Value::from(introspect_doc(node)))
            .expect("a lone string always encodes");
        Some(reply)
    }
}

/// What [`ObjectTree::route`] decided for a call.
pub enum Routed {
    /// A ready reply (or nothing, for fire-and-forget calls).
    Reply(Option<Message>),
    /// A user handler to invoke.
    Handler(MethodHandler),
}

fn unknown_method(msg: &Message) -> Option<Message> {
    if !msg.expects_reply() {
        return None;
    }
    let text = format!(
        "no object or method at {}",
        msg.header.path.as_deref().unwrap_or("<no path>")
    );
    Some(msg.make_error_reply(UNKNOWN_METHOD, Some(text)))
}

/// Error reply for a user handler that panicked.
pub fn handler_failed(msg: &Message) -> Option<Message> {
    if !msg.expects_reply() {
        return None;
    }
    Some(msg.make_error_reply(FAILED, Some("method handler panicked".to_string())))
}

const INTRO_START: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\" \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">
 <node>
\t<interface name=\"org.freedesktop.DBus.Introspectable\">
\t\t<method name=\"Introspect\">
\t\t\t<arg name=\"xml_data\" type=\"s\" direction=\"out\"/>
\t\t</method>
\t</interface>\n";
const INTRO_END: &str = " </node>";

fn introspect_doc(node: &Node) -> String {
    let mut doc = String::from(INTRO_START);
    let mut names: Vec<&str> = node.children.keys().map(String::as_str).collect();
    names.sort_unstable();
    for name in names {
        writeln!(doc, "\t<node name=\"{}\"/>", name).expect("writing to a String cannot fail");
    }
    doc.push_str(INTRO_END);
    doc
}
