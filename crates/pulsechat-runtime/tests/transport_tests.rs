//! Transport behaviour against a mock realtime server

mod common;

use std::time::Duration;

use common::*;
use pulsechat_core::frame::{CMD_CONTROL, CMD_DUPLICATE, CMD_MESSAGE_USER};
use pulsechat_core::{ErrorCategory, ErrorKind, RuntimeSettings};
use pulsechat_runtime::transport::TransportContext;
use pulsechat_runtime::{
    ConnectOutcome, ConnectionState, EventBus, EventType, Frame, Registry, SubType, Subscriber,
    Topic, TransportHandle,
};
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

fn spawn_transport(bus: &EventBus) -> TransportHandle {
    let context = TransportContext {
        account: account("acc1"),
        bus: bus.clone(),
        registry: Registry::new(),
        settings: RuntimeSettings::testing().transport,
    };
    TransportHandle::spawn(context).0
}

fn subscribe(bus: &EventBus, events: &[EventType]) -> Subscriber {
    let mut subscriber = bus.subscriber();
    for event in events {
        subscriber.subscribe(Topic::new(account("acc1"), *event));
    }
    subscriber
}

async fn wait_ready(transport: &TransportHandle) {
    eventually("transport ready", || async {
        transport.status().await.unwrap().state == ConnectionState::Ready
    })
    .await;
}

#[tokio::test]
async fn test_connect_becomes_ready_after_cipher_key() {
    init_tracing();
    let server = MockServer::start().await;
    let bus = EventBus::new();
    let mut events = subscribe(
        &bus,
        &[EventType::Connected, EventType::CipherKey, EventType::Ready],
    );
    let transport = spawn_transport(&bus);

    let outcome = assert_ok!(transport.connect(session(&server.url())).await);
    assert_eq!(outcome, ConnectOutcome::Connected);

    recv_event(&mut events, EventType::Connected).await;
    let key = recv_event(&mut events, EventType::CipherKey).await;
    assert_eq!(key.payload["key"], json!(cipher_key()));
    recv_event(&mut events, EventType::Ready).await;

    let status = transport.status().await.unwrap();
    assert_eq!(status.state, ConnectionState::Ready);
    assert_eq!(status.endpoint.as_deref(), Some(server.url().as_str()));

    let again = assert_ok!(transport.connect(session(&server.url())).await);
    assert_eq!(again, ConnectOutcome::AlreadyConnected);
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn test_history_reply_is_correlated_and_stale_reply_dropped() {
    init_tracing();
    let server = MockServer::start_with(ServerBehavior {
        stale_reply_first: true,
        ..ServerBehavior::default()
    })
    .await;
    let bus = EventBus::new();
    let mut history = bus.subscriber();
    history.subscribe(Topic::with_sub(
        account("acc1"),
        EventType::OldMessages,
        SubType::User,
    ));
    let transport = spawn_transport(&bus);
    transport.connect(session(&server.url())).await.unwrap();
    wait_ready(&transport).await;

    let reply = assert_ok!(transport.fetch_old_messages(SubType::User, None).await);
    assert_eq!(reply["data"]["msgs"][0]["content"], "hello");
    assert_eq!(transport.pending_count().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(history.drain().is_empty());
}

#[tokio::test]
async fn test_history_request_times_out() {
    init_tracing();
    let server = MockServer::start_with(ServerBehavior {
        answer_history: false,
        ..ServerBehavior::default()
    })
    .await;
    let bus = EventBus::new();
    let transport = spawn_transport(&bus);
    transport.connect(session(&server.url())).await.unwrap();
    wait_ready(&transport).await;

    let frame = Frame::old_messages(SubType::Group, Some("99"), "history-1");
    let err = assert_err!(
        transport
            .request_with_timeout(frame, Duration::from_millis(100))
            .await
    );
    assert!(err.is_timeout());
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(transport.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_request_before_ready_is_rejected() {
    init_tracing();
    let server = MockServer::start_with(ServerBehavior {
        send_cipher_key: false,
        ..ServerBehavior::default()
    })
    .await;
    let bus = EventBus::new();
    let transport = spawn_transport(&bus);
    transport.connect(session(&server.url())).await.unwrap();

    let err = assert_err!(transport.fetch_old_reactions(SubType::User, None).await);
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    assert_eq!(
        transport.status().await.unwrap().state,
        ConnectionState::Connected
    );
}

#[tokio::test]
async fn test_inbound_events_are_routed() {
    init_tracing();
    let server = MockServer::start().await;
    let bus = EventBus::new();
    let mut events = bus.subscriber();
    events.subscribe(Topic::with_sub(account("acc1"), EventType::Message, SubType::User));
    events.subscribe(Topic::new(account("acc1"), EventType::FriendEvent));
    events.subscribe(Topic::new(account("acc1"), EventType::GroupEvent));
    let transport = spawn_transport(&bus);
    transport.connect(session(&server.url())).await.unwrap();
    wait_ready(&transport).await;

    server.push(plain_frame(
        CMD_MESSAGE_USER,
        0,
        json!({ "msgs": [{ "msgId": "7", "content": "hi" }] }),
    ));
    let message = recv_event(&mut events, EventType::Message).await;
    assert_eq!(message.topic.sub, Some(SubType::User));
    assert_eq!(message.payload["msgs"][0]["msgId"], "7");

    server.push(plain_frame(
        CMD_CONTROL,
        0,
        json!({ "controls": [
            { "content": { "act_type": "fr", "act": "req" } },
            { "content": { "act_type": "unknown" } },
            { "content": { "act_type": "group", "act": "join" } },
        ]}),
    ));
    let friend = recv_event(&mut events, EventType::FriendEvent).await;
    assert_eq!(friend.payload["content"]["act"], "req");
    let group = recv_event(&mut events, EventType::GroupEvent).await;
    assert_eq!(group.payload["content"]["act"], "join");

    // unknown commands are dropped without affecting the connection
    server.push(Frame::new(9999, 0, json!({})));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.status().await.unwrap().state, ConnectionState::Ready);
}

#[tokio::test]
async fn test_retryable_close_rotates_and_counts() {
    init_tracing();
    let server = MockServer::start().await;
    let bus = EventBus::new();
    let mut events = subscribe(&bus, &[EventType::Closed, EventType::Disconnected]);
    let transport = spawn_transport(&bus);
    transport.connect(session(&server.url())).await.unwrap();
    wait_ready(&transport).await;

    server.close_all(4000);
    let closed = recv_event(&mut events, EventType::Closed).await;
    assert_eq!(closed.payload["code"], 4000);
    let disconnected = recv_event(&mut events, EventType::Disconnected).await;
    assert_eq!(disconnected.payload["retryable"], true);
    assert_eq!(disconnected.payload["attempt"], 1);
    assert_eq!(disconnected.payload["endpoint"], json!(server.url()));

    let status = transport.status().await.unwrap();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.attempt, 1);
}

#[tokio::test]
async fn test_duplicate_connection_is_not_retryable() {
    init_tracing();
    let server = MockServer::start().await;
    let bus = EventBus::new();
    let mut events = subscribe(&bus, &[EventType::Disconnected]);
    let transport = spawn_transport(&bus);
    transport.connect(session(&server.url())).await.unwrap();
    wait_ready(&transport).await;

    server.push(Frame::new(CMD_DUPLICATE, 0, json!({})));
    let disconnected = recv_event(&mut events, EventType::Disconnected).await;
    assert_eq!(disconnected.payload["code"], 3000);
    assert_eq!(disconnected.payload["retryable"], false);
    assert_eq!(transport.status().await.unwrap().attempt, 0);
}

#[tokio::test]
async fn test_disconnect_is_normal_closure() {
    init_tracing();
    let server = MockServer::start().await;
    let bus = EventBus::new();
    let mut events = subscribe(&bus, &[EventType::Disconnected]);
    let transport = spawn_transport(&bus);
    transport.connect(session(&server.url())).await.unwrap();
    wait_ready(&transport).await;

    transport.disconnect().await.unwrap();
    let disconnected = recv_event(&mut events, EventType::Disconnected).await;
    assert_eq!(disconnected.payload["code"], 1000);
    assert_eq!(disconnected.payload["retryable"], false);
    assert_eq!(
        transport.status().await.unwrap().state,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn test_connect_failure_publishes_disconnected() {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/", listener.local_addr().unwrap());
    drop(listener);

    let bus = EventBus::new();
    let mut events = subscribe(&bus, &[EventType::Disconnected]);
    let transport = spawn_transport(&bus);

    let err = assert_err!(transport.connect(session(&url)).await);
    assert_eq!(err.category(), ErrorCategory::Network);
    assert!(err.is_retryable());

    let disconnected = recv_event(&mut events, EventType::Disconnected).await;
    assert_eq!(disconnected.payload["retryable"], true);
    assert_eq!(disconnected.payload["attempt"], 1);
    assert_eq!(
        transport.status().await.unwrap().state,
        ConnectionState::Disconnected
    );
}
