//! Call dispatch, reply correlation, signal delivery and teardown,
//! exercised against the in-process bus in `common`.

mod common;

use std::num::NonZeroU32;
use std::sync::Arc;

use async_wirebus::error::{DisconnectedError, Error};
use async_wirebus::standard::{self, INTROSPECTABLE_IFACE, PEER_IFACE, UNKNOWN_METHOD};
use async_wirebus::wire::Value;
use async_wirebus::{
    transport, BusConn, MatchRule, Message, MessageBuilder, MessageType, MethodHandler,
};
use common::{wait_until, TestBus};

fn serial(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).unwrap()
}

fn call_to(dest: &str, path: &str, interface: &str, member: &str) -> Message {
    MessageBuilder::new()
        .call(member)
        .on(path)
        .with_interface(interface)
        .at(dest)
        .build()
}

fn concat_handler() -> MethodHandler {
    Arc::new(|msg: &Message| -> Option<Message> {
        let mut out = String::new();
        for val in msg.body.values().ok()? {
            out.push_str(val.as_str()?);
        }
        let mut reply = msg.make_reply();
        reply.body.push(&Value::from(out.as_str())).ok()?;
        Some(reply)
    })
}

#[tokio::test]
async fn call_reaches_published_handler() {
    let bus = TestBus::new();
    let server = BusConn::connect(bus.client()).await.unwrap();
    server
        .publish("/com/example/Strings", concat_handler())
        .unwrap();

    let client = BusConn::connect(bus.client()).await.unwrap();
    let mut msg = call_to(
        server.unique_name(),
        "/com/example/Strings",
        "com.example.Strings",
        "Concat",
    );
    msg.body.push(&Value::from("hello ")).unwrap();
    msg.body.push(&Value::from("world")).unwrap();
    let reply = client.call(msg).await.unwrap();
    assert_eq!(reply.typ, MessageType::Reply);
    assert_eq!(reply.body.values().unwrap(), vec![Value::from("hello world")]);
}

#[tokio::test]
async fn peer_to_peer_call_without_a_bus() {
    let (left, right) = tokio::io::duplex(4096);
    let caller = BusConn::new(left);
    let callee = BusConn::new(right);
    callee.publish("/svc", concat_handler()).unwrap();

    let mut msg = MessageBuilder::new()
        .call("Concat")
        .on("/svc")
        .with_interface("t.i")
        .build();
    msg.body.push(&Value::from("peer ")).unwrap();
    msg.body.push(&Value::from("call")).unwrap();
    let reply = caller.call(msg).await.unwrap();
    assert_eq!(reply.body.values().unwrap(), vec![Value::from("peer call")]);

    // liveness built-in works peer to peer as well
    let ping = MessageBuilder::new()
        .call("Ping")
        .on("/any")
        .with_interface(PEER_IFACE)
        .build();
    let reply = caller.call(ping).await.unwrap();
    assert!(reply.body.is_empty());
}

#[tokio::test]
async fn replies_correlate_out_of_order() {
    let bus = TestBus::new();
    let (mut raw_read, mut raw_write) = tokio::io::split(bus.client());
    transport::write_message(&mut raw_write, &standard::hello(), serial(1))
        .await
        .unwrap();
    let hello_reply = transport::read_message(&mut raw_read).await.unwrap();
    let raw_name = standard::reply_string(&hello_reply).unwrap();

    // answers the two forwarded calls in reverse order
    tokio::spawn(async move {
        let first = transport::read_message(&mut raw_read).await.unwrap();
        let second = transport::read_message(&mut raw_read).await.unwrap();
        let mut next_serial = 2;
        for msg in [second, first] {
            let mut reply = msg.make_reply();
            let member = msg.header.member.clone().unwrap();
            reply.body.push(&Value::from(member.as_str())).unwrap();
            transport::write_message(&mut raw_write, &reply, serial(next_serial))
                .await
                .unwrap();
            next_serial += 1;
        }
    });

    let client = BusConn::connect(bus.client()).await.unwrap();
    let first = client.call(call_to(&raw_name, "/svc", "t.i", "First"));
    let second = client.call(call_to(&raw_name, "/svc", "t.i", "Second"));
    let (first, second) = futures::join!(first, second);
    assert_eq!(
        first.unwrap().body.values().unwrap(),
        vec![Value::from("First")]
    );
    assert_eq!(
        second.unwrap().body.values().unwrap(),
        vec![Value::from("Second")]
    );
}

#[tokio::test]
async fn unknown_method_is_a_remote_error() {
    let bus = TestBus::new();
    let server = BusConn::connect(bus.client()).await.unwrap();
    server.publish("/svc", concat_handler()).unwrap();

    let client = BusConn::connect(bus.client()).await.unwrap();
    let err = client
        .call(call_to(server.unique_name(), "/nowhere", "t.i", "M"))
        .await
        .unwrap_err();
    match err {
        Error::Remote(remote) => assert_eq!(remote.name, UNKNOWN_METHOD),
        other => panic!("expected a remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn builtin_interfaces_answer_through_the_bus() {
    let bus = TestBus::new();
    let server = BusConn::connect(bus.client()).await.unwrap();
    server.publish("/com/example/Strings", concat_handler()).unwrap();

    let client = BusConn::connect(bus.client()).await.unwrap();
    let reply = client
        .call(call_to(server.unique_name(), "/any", PEER_IFACE, "Ping"))
        .await
        .unwrap();
    assert!(reply.body.is_empty());

    let reply = client
        .call(call_to(
            server.unique_name(),
            "/com/example",
            INTROSPECTABLE_IFACE,
            "Introspect",
        ))
        .await
        .unwrap();
    let doc = reply.body.values().unwrap().remove(0);
    assert!(doc.as_str().unwrap().contains("<node name=\"Strings\"/>"));
}

#[tokio::test]
async fn handler_none_becomes_empty_reply_and_panic_becomes_error() {
    let bus = TestBus::new();
    let server = BusConn::connect(bus.client()).await.unwrap();
    server
        .publish("/quiet", Arc::new(|_: &Message| None))
        .unwrap();
    server
        .publish("/boom", Arc::new(|_: &Message| panic!("kaboom")))
        .unwrap();

    let client = BusConn::connect(bus.client()).await.unwrap();
    let reply = client
        .call(call_to(server.unique_name(), "/quiet", "t.i", "M"))
        .await
        .unwrap();
    assert_eq!(reply.typ, MessageType::Reply);
    assert!(reply.body.is_empty());

    let err = client
        .call(call_to(server.unique_name(), "/boom", "t.i", "M"))
        .await
        .unwrap_err();
    match err {
        Error::Remote(remote) => assert_eq!(remote.name, standard::FAILED),
        other => panic!("expected a remote error, got {:?}", other),
    }
    // the panic did not take the server connection down
    let reply = client
        .call(call_to(server.unique_name(), "/any", PEER_IFACE, "Ping"))
        .await
        .unwrap();
    assert_eq!(reply.typ, MessageType::Reply);
}

#[tokio::test]
async fn subscription_filters_and_unsubscribes_on_drop() {
    let bus = TestBus::new();
    let listener = BusConn::connect(bus.client()).await.unwrap();
    let emitter = BusConn::connect(bus.client()).await.unwrap();

    let sub = listener
        .subscribe(MatchRule::signal("com.example.Evt", "Tick"))
        .await
        .unwrap();
    assert_eq!(bus.total_rules(), 1);

    let other = MessageBuilder::new()
        .signal("com.example.Evt", "Tock", "/e")
        .build();
    emitter.send(other).await.unwrap();
    let mut tick = MessageBuilder::new()
        .signal("com.example.Evt", "Tick", "/e")
        .build();
    tick.body.push(&Value::UInt32(7)).unwrap();
    emitter.send(tick).await.unwrap();

    let got = sub.next().await.unwrap();
    assert_eq!(got.header.member.as_deref(), Some("Tick"));
    assert_eq!(got.body.values().unwrap(), vec![Value::UInt32(7)]);

    drop(sub);
    // RemoveMatch is fire-and-forget
    wait_until(|| bus.total_rules() == 0).await;
}

#[tokio::test]
async fn disconnect_fails_pending_and_later_calls() {
    let bus = TestBus::new();
    let (mut raw_read, mut raw_write) = tokio::io::split(bus.client());
    transport::write_message(&mut raw_write, &standard::hello(), serial(1))
        .await
        .unwrap();
    let hello_reply = transport::read_message(&mut raw_read).await.unwrap();
    let mute_name = standard::reply_string(&hello_reply).unwrap();

    let client = BusConn::connect(bus.client()).await.unwrap();
    let pending = tokio::spawn({
        let client = client.clone();
        let msg = call_to(&mute_name, "/svc", "t.i", "Never");
        async move { client.call(msg).await }
    });
    tokio::task::yield_now().await;
    client.disconnect();

    let res = pending.await.unwrap();
    assert!(matches!(
        res,
        Err(Error::Disconnected(DisconnectedError::Disposed))
    ));
    // idempotent, and later calls fail the same way
    client.disconnect();
    let err = client
        .call(call_to(&mute_name, "/svc", "t.i", "M"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Disconnected(DisconnectedError::Disposed)
    ));
    client.closed().await;
}

#[tokio::test]
async fn transport_loss_disconnects_the_client() {
    // the test itself plays the bus: answer Hello, then hang up
    let (client_stream, bus_side) = tokio::io::duplex(4096);
    let bus_task = tokio::spawn(async move {
        let (mut read, mut write) = tokio::io::split(bus_side);
        let hello = transport::read_message(&mut read).await.unwrap();
        let mut reply = hello.make_reply();
        reply.body.push(&Value::from(":1.1")).unwrap();
        transport::write_message(&mut write, &reply, serial(1))
            .await
            .unwrap();
    });

    let client = BusConn::connect(client_stream).await.unwrap();
    assert_eq!(client.unique_name(), ":1.1");
    bus_task.await.unwrap();
    client.closed().await;
    let err = client
        .call(call_to("com.example.Gone", "/svc", "t.i", "M"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Disconnected(DisconnectedError::ConnectionLost(_))
    ));
}

#[tokio::test]
async fn unexpected_reply_serial_tears_the_connection_down() {
    let (client_stream, bus_side) = tokio::io::duplex(4096);
    let bus_task = tokio::spawn(async move {
        let (mut read, mut write) = tokio::io::split(bus_side);
        let hello = transport::read_message(&mut read).await.unwrap();
        let mut reply = hello.make_reply();
        reply.body.push(&Value::from(":1.1")).unwrap();
        transport::write_message(&mut write, &reply, serial(1))
            .await
            .unwrap();
        let mut stray = hello.make_reply();
        stray.header.reply_serial = NonZeroU32::new(999);
        transport::write_message(&mut write, &stray, serial(2))
            .await
            .unwrap();
        // keep the stream open so only the stray reply can cause teardown
        std::future::pending::<()>().await;
    });

    let client = BusConn::connect(client_stream).await.unwrap();
    client.closed().await;
    let err = client
        .call(call_to("com.example.Any", "/svc", "t.i", "M"))
        .await
        .unwrap_err();
    match err {
        Error::Disconnected(DisconnectedError::ConnectionLost(text)) => {
            assert!(text.contains("999"), "unexpected reason: {}", text)
        }
        other => panic!("expected a lost connection, got {:?}", other),
    }
    bus_task.abort();
}
