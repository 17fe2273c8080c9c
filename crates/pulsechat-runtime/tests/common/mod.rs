//! Shared fixtures for runtime integration tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::{SinkExt, StreamExt};
use pulsechat_core::crypto::payload::{self, PayloadEncoding};
use pulsechat_core::frame::{
    CMD_CIPHER_KEY, CMD_OLD_MESSAGES_GROUP, CMD_OLD_MESSAGES_USER, CMD_OLD_REACTIONS_GROUP,
    CMD_OLD_REACTIONS_USER,
};
use pulsechat_runtime::{
    AccountId, BusMessage, CookieStoreHandle, Credentials, EventType, Frame, LoginProvider,
    PulseError, PulseResult, Session, Subscriber,
};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn cipher_key() -> String {
    STANDARD.encode([7u8; 32])
}

pub fn account(id: &str) -> AccountId {
    AccountId::new(id).unwrap()
}

pub fn credentials() -> Credentials {
    Credentials::builder()
        .device_id("0b6e1c2a-test-device")
        .cookie("zpw_sek=test; zpsid=session")
        .user_agent("pulsechat-tests/1.0")
        .build()
        .unwrap()
}

pub fn session(url: &str) -> Session {
    Session {
        user_id: "1000".into(),
        secret_key: STANDARD.encode([3u8; 16]),
        ws_endpoints: vec![url.to_string()],
        api_type: 30,
        api_version: 665,
        ..Session::default()
    }
}

/// Next message for `event`, skipping anything else; panics after five seconds
pub async fn recv_event(subscriber: &mut Subscriber, event: EventType) -> BusMessage {
    let wait = async {
        loop {
            match subscriber.recv().await {
                Some(message) if message.topic.event == event => return message,
                Some(_) => continue,
                None => panic!("event bus stopped while waiting for {event}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {event}"))
}

/// Poll `check` until it holds; panics after five seconds
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}

// ----------------------------------------------------------------------------
// Mock Server
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ServerBehavior {
    /// Send the cipher key frame right after the handshake
    pub send_cipher_key: bool,
    /// Answer history requests
    pub answer_history: bool,
    /// Send a reply with an unknown request id before each real answer
    pub stale_reply_first: bool,
}

impl Default for ServerBehavior {
    fn default() -> Self {
        Self {
            send_cipher_key: true,
            answer_history: true,
            stale_reply_first: false,
        }
    }
}

#[derive(Debug, Clone)]
enum ServerAction {
    Push(Vec<u8>),
    Close(u16),
}

/// Realtime server stand-in bound to a random local port
pub struct MockServer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    actions: broadcast::Sender<ServerAction>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_with(ServerBehavior::default()).await
    }

    pub async fn start_with(behavior: ServerBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let (actions, _) = broadcast::channel(64);

        let task = tokio::spawn({
            let connections = connections.clone();
            let actions = actions.clone();
            async move {
                while let Ok((stream, _peer)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    let actions = actions.subscribe();
                    tokio::spawn(async move {
                        let _ = handle_connection(stream, behavior, actions).await;
                    });
                }
            }
        });

        Self {
            addr,
            connections,
            actions,
            _task: task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Accepted TCP connections so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Send a frame to every connected client
    pub fn push(&self, frame: Frame) {
        let _ = self.actions.send(ServerAction::Push(frame.encode()));
    }

    /// Close every connected client with `code`
    pub fn close_all(&self, code: u16) {
        let _ = self.actions.send(ServerAction::Close(code));
    }
}

async fn handle_connection(
    stream: TcpStream,
    behavior: ServerBehavior,
    mut actions: broadcast::Receiver<ServerAction>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    if behavior.send_cipher_key {
        let frame = Frame::new(CMD_CIPHER_KEY, 1, json!({ "key": cipher_key() }));
        write.send(Message::Binary(frame.encode())).await?;
    }

    loop {
        tokio::select! {
            message = read.next() => match message {
                Some(Ok(Message::Binary(bytes))) => {
                    let Ok(frame) = Frame::decode(&bytes) else { continue };
                    if !behavior.answer_history || !is_history_request(frame.cmd()) {
                        continue;
                    }
                    let req_id = frame.req_id().unwrap_or_default().to_string();
                    if behavior.stale_reply_first {
                        write.send(Message::Binary(history_reply(frame.cmd(), "stale-request"))).await?;
                    }
                    write.send(Message::Binary(history_reply(frame.cmd(), &req_id))).await?;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Ok(()),
                Some(Ok(_)) => {}
            },
            action = actions.recv() => match action {
                Ok(ServerAction::Push(bytes)) => write.send(Message::Binary(bytes)).await?,
                Ok(ServerAction::Close(code)) => {
                    let close = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "server closing".into(),
                    };
                    write.send(Message::Close(Some(close))).await?;
                    while let Some(Ok(_)) = read.next().await {}
                    return Ok(());
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn is_history_request(cmd: u16) -> bool {
    matches!(
        cmd,
        CMD_OLD_MESSAGES_USER | CMD_OLD_MESSAGES_GROUP | CMD_OLD_REACTIONS_USER | CMD_OLD_REACTIONS_GROUP
    )
}

fn history_reply(cmd: u16, req_id: &str) -> Vec<u8> {
    let value = json!({
        "req_id": req_id,
        "data": { "msgs": [{ "msgId": "1", "content": "hello" }] },
    });
    let encoded =
        payload::encode(&value, PayloadEncoding::EncryptedCompressed, Some(&cipher_key())).unwrap();
    Frame::new(cmd, 1, serde_json::to_value(encoded).unwrap()).encode()
}

/// Frame carrying a plain (mode 0) payload
pub fn plain_frame(cmd: u16, sub_cmd: u8, value: Value) -> Frame {
    let encoded = payload::encode(&value, PayloadEncoding::Plain, None).unwrap();
    Frame::new(cmd, sub_cmd, serde_json::to_value(encoded).unwrap())
}

// ----------------------------------------------------------------------------
// Scripted Login
// ----------------------------------------------------------------------------

/// Login provider answering from a fixed script
pub struct ScriptedLogin {
    script: Mutex<VecDeque<PulseResult<Session>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedLogin {
    pub fn new(script: Vec<PulseResult<Session>>) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                script: Mutex::new(script.into()),
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl LoginProvider for ScriptedLogin {
    async fn login(
        &self,
        _account: &AccountId,
        _credentials: &Credentials,
        _cookies: &CookieStoreHandle,
    ) -> PulseResult<Session> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(PulseError::auth("login script exhausted")))
    }
}
