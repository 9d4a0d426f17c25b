//! An async client for DBus-style message buses.
//!
//! The crate is built around [`BusConn`], a connection to a bus daemon
//! over any async byte stream. A connection multiplexes three kinds of
//! traffic concurrently:
//! * method calls made with [`BusConn::call`], correlated to their
//!   replies by serial so replies may arrive in any order,
//! * broadcast signals, delivered to [`Subscription`]s by match rule,
//! * incoming method calls, routed to handlers registered with
//!   [`BusConn::publish`].
//!
//! The wire codec lives in [`wire`] and can be used on its own: a
//! [`Signature`](wire::Signature) describes a type, and the
//! [`Reader`](wire::Reader)/[`Writer`](wire::Writer) pair moves
//! [`Value`](wire::Value) trees in and out of byte buffers.
//!
//! # Example
//! ```no_run
//! use async_wirebus::{BusConn, MessageBuilder};
//! use async_wirebus::wire::Value;
//!
//! # async fn example() -> Result<(), async_wirebus::Error> {
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:7272").await?;
//! let conn = BusConn::connect(stream).await?;
//! let mut msg = MessageBuilder::new()
//!     .call("Concat")
//!     .on("/com/example/Strings")
//!     .with_interface("com.example.Strings")
//!     .at("com.example.Svc")
//!     .build();
//! msg.body.push(&Value::from("hello "))?;
//! msg.body.push(&Value::from("world"))?;
//! let reply = conn.call(msg).await?;
//! println!("{:?}", reply.body.values()?);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod match_rule;
pub mod message;
pub mod path;
pub mod routing;
pub mod standard;
pub mod transport;
pub mod wire;

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use async_channel as channel;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

pub use crate::error::{
    ConnectError, DecodeError, DisconnectedError, EncodeError, Error, MatchRuleError,
    ProtocolError, RemoteError, SigError,
};
pub use crate::match_rule::MatchRule;
pub use crate::message::{Message, MessageBuilder, MessageType, NO_REPLY_EXPECTED};
pub use crate::path::{ObjectPath, ObjectPathBuf};
pub use crate::routing::MethodHandler;
pub use crate::standard::{ReleaseNameReply, RequestNameReply};

use crate::routing::{handler_failed, ObjectTree, Routed};
use crate::standard::{
    BUS_IFACE, BUS_NAME, NAME_ACQUIRED, NAME_ALLOW_REPLACEMENT, NAME_LOST, NAME_OWNER_CHANGED,
};

/// Invoked from the receive loop when ownership of a requested name
/// changes; the argument is the name.
pub type NameCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// One ownership change observed by an [`OwnerWatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerChange {
    pub name: String,
    pub old_owner: String,
    pub new_owner: String,
}

#[derive(Debug, Clone, PartialEq)]
enum ConnState {
    Connecting,
    Connected,
    Disconnected(DisconnectedError),
}

struct SubEntry {
    next_id: u64,
    txs: Vec<(u64, channel::Sender<Message>)>,
}

struct NameEntry {
    on_acquired: Option<NameCallback>,
    on_lost: Option<NameCallback>,
}

struct WatchEntry {
    id: u64,
    pattern: String,
    /// The first delivered change reports an empty previous owner.
    fresh: bool,
    tx: channel::Sender<OwnerChange>,
}

struct Tables {
    state: ConnState,
    pending: HashMap<u32, oneshot::Sender<Result<Message, Error>>>,
    subs: HashMap<MatchRule, SubEntry>,
    names: HashMap<String, NameEntry>,
    watches: Vec<WatchEntry>,
    next_watch_id: u64,
    objects: ObjectTree,
}

impl Tables {
    fn new() -> Self {
        Tables {
            state: ConnState::Connecting,
            pending: HashMap::new(),
            subs: HashMap::new(),
            names: HashMap::new(),
            watches: Vec::new(),
            next_watch_id: 0,
            objects: ObjectTree::new(String::new()),
        }
    }
    fn check_connected(&self) -> Result<(), Error> {
        match &self.state {
            ConnState::Disconnected(err) => Err(Error::Disconnected(err.clone())),
            _ => Ok(()),
        }
    }
    fn disconnect_error(&self) -> DisconnectedError {
        match &self.state {
            ConnState::Disconnected(err) => err.clone(),
            _ => DisconnectedError::Disposed,
        }
    }
}

struct Inner {
    serial: AtomicU32,
    tables: Mutex<Tables>,
    outbound: channel::Sender<Vec<u8>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    unique: OnceLock<String>,
    recv_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn lock_tables(&self) -> MutexGuard<Tables> {
        // the tables mutex is never held across a panic
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
    fn allocate_serial(&self) -> NonZeroU32 {
        loop {
            // skips 0 on wraparound
            if let Some(serial) = NonZeroU32::new(self.serial.fetch_add(1, Ordering::Relaxed)) {
                return serial;
            }
        }
    }
    /// Queues a marshalled frame for the send task.
    fn enqueue(&self, frame: Vec<u8>) -> Result<(), Error> {
        if self.outbound.try_send(frame).is_err() {
            let err = self.lock_tables().disconnect_error();
            return Err(Error::Disconnected(err));
        }
        Ok(())
    }
    /// Assigns a serial and queues an internally produced message,
    /// logging instead of failing when the connection is going down.
    fn enqueue_msg(&self, msg: &Message) {
        let serial = self.allocate_serial();
        match msg.marshal(serial) {
            Ok(frame) => {
                if self.enqueue(frame).is_err() {
                    debug!("dropping outgoing message, connection is down");
                }
            }
            Err(e) => warn!("failed to marshal outgoing message: {}", e),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.outbound.close();
        if let Ok(handle) = self.recv_handle.get_mut() {
            if let Some(handle) = handle.take() {
                handle.abort();
            }
        }
    }
}

/// Fails every pending call and closes every delivery channel, exactly
/// once. Later calls observe the original reason.
fn teardown(inner: &Inner, reason: DisconnectedError) {
    let (pending, subs, names, watches) = {
        let mut tables = inner.lock_tables();
        if let ConnState::Disconnected(_) = tables.state {
            return;
        }
        tables.state = ConnState::Disconnected(reason.clone());
        (
            std::mem::take(&mut tables.pending),
            std::mem::take(&mut tables.subs),
            std::mem::take(&mut tables.names),
            std::mem::take(&mut tables.watches),
        )
    };
    debug!("connection tearing down: {}", reason);
    for (_, tx) in pending {
        let _ = tx.send(Err(Error::Disconnected(reason.clone())));
    }
    // dropping the senders wakes subscribers and watches with end-of-stream,
    // and dropping the name entries releases their callbacks
    drop(subs);
    drop(names);
    drop(watches);
    inner.outbound.close();
    let _ = inner.closed_tx.send(true);
}

/// A connection to a message bus.
///
/// Cheap to clone; all clones share one underlying connection. The
/// connection stays alive until [`disconnect`](Self::disconnect) is
/// called, the transport fails, or the last clone is dropped.
#[derive(Clone)]
pub struct BusConn {
    inner: Arc<Inner>,
}

impl BusConn {
    fn spawn<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let (out_tx, out_rx) = channel::unbounded();
        let (closed_tx, closed_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            serial: AtomicU32::new(1),
            tables: Mutex::new(Tables::new()),
            outbound: out_tx,
            closed_tx,
            closed_rx,
            unique: OnceLock::new(),
            recv_handle: Mutex::new(None),
        });
        let recv = tokio::spawn(recv_loop(Arc::downgrade(&inner), read));
        tokio::spawn(send_loop(Arc::downgrade(&inner), write, out_rx));
        if let Ok(mut handle) = inner.recv_handle.lock() {
            *handle = Some(recv);
        }
        BusConn { inner }
    }

    /// Wraps `stream` as a peer-to-peer connection: no bus daemon on the
    /// other side, no Hello exchange, no unique name. Both peers can
    /// publish objects and call each other right away.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = Self::spawn(stream);
        {
            let mut tables = conn.inner.lock_tables();
            tables.objects = ObjectTree::new(machine_id(""));
            tables.state = ConnState::Connected;
        }
        conn
    }

    /// Establishes a connection over `stream`, performing the Hello
    /// exchange that assigns this connection its unique name.
    pub async fn connect<S>(stream: S) -> Result<Self, Error>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = Self::spawn(stream);
        let reply = conn.call(standard::hello()).await.map_err(|e| match e {
            Error::Remote(remote) => Error::Connect(ConnectError::Rejected(remote)),
            Error::Disconnected(DisconnectedError::ConnectionLost(text)) => {
                Error::Connect(ConnectError::Io(text))
            }
            other => other,
        })?;
        let name =
            standard::reply_string(&reply).ok_or(Error::Connect(ConnectError::BadHello))?;
        let _ = conn.inner.unique.set(name.clone());
        {
            let mut tables = conn.inner.lock_tables();
            tables.objects = ObjectTree::new(machine_id(&name));
            if tables.state == ConnState::Connecting {
                tables.state = ConnState::Connected;
            }
        }
        debug!("connected as {}", name);
        Ok(conn)
    }

    /// The unique name the bus assigned to this connection.
    pub fn unique_name(&self) -> &str {
        self.inner.unique.get().map(String::as_str).unwrap_or("")
    }

    /// Sends a method call and awaits its reply.
    ///
    /// An Error reply from the peer resolves to [`Error::Remote`]; the
    /// connection going down resolves every outstanding call to
    /// [`Error::Disconnected`].
    pub async fn call(&self, msg: Message) -> Result<Message, Error> {
        if msg.typ != MessageType::Call {
            return Err(Error::Usage("call() takes a method call; use send() otherwise"));
        }
        if !msg.expects_reply() {
            return Err(Error::Usage(
                "message does not expect a reply; use send() instead",
            ));
        }
        let serial = self.inner.allocate_serial();
        let frame = msg.marshal(serial)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut tables = self.inner.lock_tables();
            tables.check_connected()?;
            tables.pending.insert(serial.get(), tx);
        }
        if let Err(e) = self.inner.enqueue(frame) {
            self.inner.lock_tables().pending.remove(&serial.get());
            return Err(e);
        }
        match rx.await {
            Ok(Ok(reply)) => match reply.typ {
                MessageType::Error => Err(Error::Remote(remote_error(&reply))),
                _ => Ok(reply),
            },
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Disconnected(
                self.inner.lock_tables().disconnect_error(),
            )),
        }
    }

    /// Sends a message without awaiting any reply, returning the serial
    /// it was sent with.
    pub async fn send(&self, msg: Message) -> Result<NonZeroU32, Error> {
        let serial = self.inner.allocate_serial();
        let frame = msg.marshal(serial)?;
        self.inner.lock_tables().check_connected()?;
        self.inner.enqueue(frame)?;
        Ok(serial)
    }

    /// Registers a match rule with the bus and returns the stream of
    /// matching signals.
    ///
    /// The bus-side rule is added when the first subscription for a rule
    /// appears and removed when the last one is dropped.
    pub async fn subscribe(&self, rule: MatchRule) -> Result<Subscription, Error> {
        let (tx, rx) = channel::unbounded();
        let (id, needs_add) = {
            let mut tables = self.inner.lock_tables();
            tables.check_connected()?;
            let entry = tables.subs.entry(rule.clone()).or_insert_with(|| SubEntry {
                next_id: 0,
                txs: Vec::new(),
            });
            let id = entry.next_id;
            entry.next_id += 1;
            let needs_add = entry.txs.is_empty();
            entry.txs.push((id, tx));
            (id, needs_add)
        };
        if needs_add {
            if let Err(e) = self.call(standard::add_match(&rule.to_string())).await {
                let mut tables = self.inner.lock_tables();
                if let Some(entry) = tables.subs.get_mut(&rule) {
                    entry.txs.retain(|(tx_id, _)| *tx_id != id);
                    if entry.txs.is_empty() {
                        tables.subs.remove(&rule);
                    }
                }
                return Err(e);
            }
        }
        Ok(Subscription {
            inner: self.inner.clone(),
            rule,
            id,
            rx,
        })
    }

    /// Requests ownership of a well-known name.
    ///
    /// `on_acquired` fires when the bus signals that this connection
    /// gained the name, including a later grant after queueing.
    /// `on_lost` fires when a replacement takes the name away, and so
    /// requires the allow-replacement flag.
    pub async fn request_name(
        &self,
        name: &str,
        flags: u32,
        on_acquired: Option<NameCallback>,
        on_lost: Option<NameCallback>,
    ) -> Result<RequestNameReply, Error> {
        if on_lost.is_some() && flags & NAME_ALLOW_REPLACEMENT == 0 {
            return Err(Error::Usage(
                "an on_lost callback requires the allow-replacement flag",
            ));
        }
        {
            let mut tables = self.inner.lock_tables();
            tables.check_connected()?;
            // registered before the call so the NameAcquired signal is
            // observed even when it beats the reply
            tables.names.insert(
                name.to_string(),
                NameEntry {
                    on_acquired,
                    on_lost,
                },
            );
        }
        let reply = match self.call(standard::request_name(name, flags)).await {
            Ok(reply) => reply,
            Err(e) => {
                self.inner.lock_tables().names.remove(name);
                return Err(e);
            }
        };
        let code = standard::reply_code(&reply)
            .ok_or(Error::Decode(DecodeError::Header("RequestName reply carried no code")))?;
        let outcome = RequestNameReply::from_code(code)
            .ok_or(Error::Decode(DecodeError::Header("unknown RequestName result code")))?;
        if outcome == RequestNameReply::Exists {
            self.inner.lock_tables().names.remove(name);
        }
        Ok(outcome)
    }

    /// Releases a name, returning whether this connection owned it.
    pub async fn release_name(&self, name: &str) -> Result<bool, Error> {
        let reply = self.call(standard::release_name(name)).await?;
        let code = standard::reply_code(&reply)
            .ok_or(Error::Decode(DecodeError::Header("ReleaseName reply carried no code")))?;
        self.inner.lock_tables().names.remove(name);
        Ok(ReleaseNameReply::from_code(code) == Some(ReleaseNameReply::Released))
    }

    /// Watches ownership changes of a name, or of every name under a
    /// prefix when `pattern` ends in `*` (e.g. `com.example.*`).
    ///
    /// The first change each watch observes reports an empty previous
    /// owner, since the watch has no earlier observation to relate it to.
    pub async fn watch_owner(&self, pattern: &str) -> Result<OwnerWatch, Error> {
        let mut rule = MatchRule::signal(BUS_IFACE, NAME_OWNER_CHANGED).sender(BUS_NAME);
        if !pattern.ends_with('*') {
            rule = rule.arg(0, pattern)?;
        }
        let (tx, rx) = channel::unbounded();
        let id = {
            let mut tables = self.inner.lock_tables();
            tables.check_connected()?;
            let id = tables.next_watch_id;
            tables.next_watch_id += 1;
            tables.watches.push(WatchEntry {
                id,
                pattern: pattern.to_string(),
                fresh: true,
                tx,
            });
            id
        };
        if let Err(e) = self.call(standard::add_match(&rule.to_string())).await {
            self.inner
                .lock_tables()
                .watches
                .retain(|entry| entry.id != id);
            return Err(e);
        }
        Ok(OwnerWatch {
            inner: self.inner.clone(),
            rule,
            id,
            rx,
        })
    }

    /// Registers a method-call handler at an object path, replacing any
    /// previous handler there. Returns whether one was replaced.
    pub fn publish(&self, path: &str, handler: MethodHandler) -> Result<bool, Error> {
        let path = ObjectPath::new(path).map_err(|_| Error::Usage("invalid object path"))?;
        let mut tables = self.inner.lock_tables();
        tables.check_connected()?;
        Ok(tables.objects.insert(path, handler))
    }

    /// Unregisters the handler at `path`, if any.
    pub fn unpublish(&self, path: &str) -> Result<bool, Error> {
        let path = ObjectPath::new(path).map_err(|_| Error::Usage("invalid object path"))?;
        Ok(self.inner.lock_tables().objects.remove(path))
    }

    /// Shuts the connection down. Every outstanding and future call
    /// resolves to [`DisconnectedError::Disposed`]; repeated calls are
    /// no-ops.
    pub fn disconnect(&self) {
        teardown(&self.inner, DisconnectedError::Disposed);
        if let Ok(mut handle) = self.inner.recv_handle.lock() {
            if let Some(handle) = handle.take() {
                handle.abort();
            }
        }
    }

    /// Resolves once the connection has left the connected state.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A stream of signals matching one rule. Dropping it unsubscribes.
pub struct Subscription {
    inner: Arc<Inner>,
    rule: MatchRule,
    id: u64,
    rx: channel::Receiver<Message>,
}

impl Subscription {
    /// The next matching signal, or `None` once the connection is down.
    pub async fn next(&self) -> Option<Message> {
        self.rx.recv().await.ok()
    }
    pub fn rule(&self) -> &MatchRule {
        &self.rule
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut tables = self.inner.lock_tables();
        let last = match tables.subs.get_mut(&self.rule) {
            Some(entry) => {
                entry.txs.retain(|(tx_id, _)| *tx_id != self.id);
                entry.txs.is_empty()
            }
            None => false,
        };
        if !last {
            return;
        }
        tables.subs.remove(&self.rule);
        let connected = matches!(tables.state, ConnState::Connected);
        drop(tables);
        if connected {
            let mut msg = standard::remove_match(&self.rule.to_string());
            msg.flags |= NO_REPLY_EXPECTED;
            self.inner.enqueue_msg(&msg);
        }
    }
}

/// A stream of [`OwnerChange`]s. Dropping it stops the watch.
pub struct OwnerWatch {
    inner: Arc<Inner>,
    rule: MatchRule,
    id: u64,
    rx: channel::Receiver<OwnerChange>,
}

impl OwnerWatch {
    /// The next ownership change, or `None` once the connection is down.
    pub async fn next(&self) -> Option<OwnerChange> {
        self.rx.recv().await.ok()
    }
}

impl Drop for OwnerWatch {
    fn drop(&mut self) {
        let mut tables = self.inner.lock_tables();
        tables.watches.retain(|entry| entry.id != self.id);
        let connected = matches!(tables.state, ConnState::Connected);
        drop(tables);
        if connected {
            let mut msg = standard::remove_match(&self.rule.to_string());
            msg.flags |= NO_REPLY_EXPECTED;
            self.inner.enqueue_msg(&msg);
        }
    }
}

fn machine_id(unique: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut low = DefaultHasher::new();
    (unique, 0u8).hash(&mut low);
    let mut high = DefaultHasher::new();
    (unique, 1u8).hash(&mut high);
    format!("{:016x}{:016x}", high.finish(), low.finish())
}

fn remote_error(reply: &Message) -> RemoteError {
    let name = reply.header.error_name.clone().unwrap_or_default();
    let message = if reply.body.sig().starts_with('s') {
        reply.body.reader().read_string().ok().map(str::to_string)
    } else {
        None
    };
    RemoteError { name, message }
}

/// Whether an owner-watch pattern covers `name`.
fn pattern_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

async fn recv_loop<R>(weak: Weak<Inner>, mut read: R)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        let msg = match transport::read_message(&mut read).await {
            Ok(msg) => msg,
            Err(Error::Disconnected(reason)) => break reason,
            Err(e) => break DisconnectedError::ConnectionLost(e.to_string()),
        };
        let inner = match weak.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        if let Err(e) = dispatch(&inner, msg) {
            teardown(&inner, DisconnectedError::ConnectionLost(e.to_string()));
            return;
        }
    };
    if let Some(inner) = weak.upgrade() {
        teardown(&inner, reason);
    }
}

async fn send_loop<W>(weak: Weak<Inner>, mut write: W, rx: channel::Receiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Ok(frame) = rx.recv().await {
        if let Err(e) = transport::write_frame(&mut write, &frame).await {
            if let Some(inner) = weak.upgrade() {
                teardown(&inner, DisconnectedError::ConnectionLost(e.to_string()));
            }
            return;
        }
    }
}

/// Classifies one received message and hands it to the matching table.
fn dispatch(inner: &Inner, msg: Message) -> Result<(), Error> {
    match msg.typ {
        MessageType::Reply | MessageType::Error => {
            let serial = msg
                .header
                .reply_serial
                .ok_or(Error::Protocol(ProtocolError::MissingReplySerial))?;
            let tx = inner.lock_tables().pending.remove(&serial.get());
            match tx {
                Some(tx) => {
                    // receiver may have given up; that only affects this call
                    let _ = tx.send(Ok(msg));
                    Ok(())
                }
                None => Err(Error::Protocol(ProtocolError::UnexpectedReply(serial.get()))),
            }
        }
        MessageType::Signal => {
            handle_signal(inner, msg);
            Ok(())
        }
        MessageType::Call => {
            handle_call(inner, msg);
            Ok(())
        }
    }
}

fn handle_signal(inner: &Inner, msg: Message) {
    if msg.header.sender.as_deref() == Some(BUS_NAME)
        && msg.header.interface.as_deref() == Some(BUS_IFACE)
        && matches!(
            msg.header.member.as_deref(),
            Some(NAME_ACQUIRED) | Some(NAME_LOST) | Some(NAME_OWNER_CHANGED)
        )
    {
        // reserved lifecycle signals feed the name and watch tables only
        handle_bus_signal(inner, &msg);
        return;
    }
    let mut tables = inner.lock_tables();
    let mut dead_rules = Vec::new();
    for (rule, entry) in tables.subs.iter_mut() {
        if !rule.matches(&msg) {
            continue;
        }
        entry
            .txs
            .retain(|(_, tx)| tx.try_send(msg.clone()).is_ok());
        if entry.txs.is_empty() {
            dead_rules.push(rule.clone());
        }
    }
    for rule in dead_rules {
        tables.subs.remove(&rule);
    }
}

fn handle_bus_signal(inner: &Inner, msg: &Message) {
    match msg.header.member.as_deref() {
        Some(NAME_ACQUIRED) | Some(NAME_LOST) => {
            let name = match standard::reply_string(msg) {
                Some(name) => name,
                None => return,
            };
            let acquired = msg.header.member.as_deref() == Some(NAME_ACQUIRED);
            let callback = {
                let tables = inner.lock_tables();
                match tables.names.get(&name) {
                    Some(entry) if acquired => entry.on_acquired.clone(),
                    Some(entry) => entry.on_lost.clone(),
                    None => None,
                }
            };
            if let Some(callback) = callback {
                if catch_unwind(AssertUnwindSafe(|| callback(&name))).is_err() {
                    warn!("name callback for {} panicked", name);
                }
            }
        }
        Some(NAME_OWNER_CHANGED) => {
            let (name, old, new) = match standard::name_owner_changed(msg) {
                Some(parts) => parts,
                None => return,
            };
            let mut tables = inner.lock_tables();
            let mut changed = false;
            for entry in tables.watches.iter_mut() {
                if !pattern_matches(&entry.pattern, &name) {
                    continue;
                }
                let old_owner = if entry.fresh { String::new() } else { old.clone() };
                entry.fresh = false;
                let change = OwnerChange {
                    name: name.clone(),
                    old_owner,
                    new_owner: new.clone(),
                };
                if entry.tx.try_send(change).is_err() {
                    changed = true;
                }
            }
            if changed {
                tables.watches.retain(|entry| !entry.tx.is_closed());
            }
        }
        _ => {}
    }
}

fn handle_call(inner: &Inner, msg: Message) {
    let routed = inner.lock_tables().objects.route(&msg);
    match routed {
        Routed::Reply(Some(reply)) => inner.enqueue_msg(&reply),
        Routed::Reply(None) => {}
        Routed::Handler(handler) => {
            // user code runs outside every lock; a panic only fails this call
            match catch_unwind(AssertUnwindSafe(|| handler(&msg))) {
                Ok(Some(reply)) => inner.enqueue_msg(&reply),
                Ok(None) => {
                    if msg.expects_reply() {
                        inner.enqueue_msg(&msg.make_reply());
                    }
                }
                Err(_) => {
                    warn!(
                        "handler for {} panicked",
                        msg.header.path.as_deref().unwrap_or("<no path>")
                    );
                    if let Some(reply) = handler_failed(&msg) {
                        inner.enqueue_msg(&reply);
                    }
                }
            }
        }
    }
}
