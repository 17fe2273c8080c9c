//! Connection actor
//!
//! Owns the websocket and the connection state machine:
//! disconnected → connecting → connected → ready (after the cipher key).

use std::time::{SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use pulsechat_core::config::TransportSettings;
use pulsechat_core::crypto::payload;
use pulsechat_core::frame::{self, CLOSE_DUPLICATE, CLOSE_NORMAL};
use pulsechat_core::{
    AccountId, AttemptTracker, ConnectionState, ConnectionStatus, EndpointRotation, EventType,
    Frame, PulseError, PulseResult, Route, Session, SubType, Topic,
};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use super::pending::PendingRequests;
use super::{ConnectOutcome, TransportCommand};
use crate::bus::EventBus;
use crate::registry::Registry;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything a transport task needs from its account
#[derive(Clone)]
pub struct TransportContext {
    pub account: AccountId,
    pub bus: EventBus,
    pub registry: Registry,
    pub settings: TransportSettings,
}

pub(super) struct Connection {
    account: AccountId,
    bus: EventBus,
    registry: Registry,
    settings: TransportSettings,
    commands: mpsc::Receiver<TransportCommand>,

    state: ConnectionState,
    ws: Option<WsStream>,
    endpoint: Option<String>,
    rotation: EndpointRotation,
    tracker: AttemptTracker,
    api_type: u32,
    api_version: u32,
    cipher_key: Option<String>,
    pending: PendingRequests,
    ping: Interval,
    stable_at: Option<Instant>,
}

impl Connection {
    pub(super) fn new(context: TransportContext, commands: mpsc::Receiver<TransportCommand>) -> Self {
        let mut ping = tokio::time::interval(context.settings.ping_interval());
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            tracker: AttemptTracker::new(context.settings.stable_window()),
            account: context.account,
            bus: context.bus,
            registry: context.registry,
            settings: context.settings,
            commands,
            state: ConnectionState::Disconnected,
            ws: None,
            endpoint: None,
            rotation: EndpointRotation::default(),
            api_type: pulsechat_core::types::DEFAULT_API_TYPE,
            api_version: pulsechat_core::types::DEFAULT_API_VERSION,
            cipher_key: None,
            pending: PendingRequests::new(),
            ping,
            stable_at: None,
        }
    }

    pub(super) async fn run(mut self) {
        info!(account = %self.account, "Transport started");
        loop {
            let ready = self.state == ConnectionState::Ready;
            let stable_at = self.stable_at;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                message = next_message(&mut self.ws) => self.handle_message(message).await,
                _ = self.ping.tick(), if ready => self.send_ping().await,
                _ = sleep_until(stable_at), if stable_at.is_some() => self.on_stable(),
            }
        }

        if let Some(mut ws) = self.ws.take() {
            let _ = ws.close(None).await;
        }
        self.pending.fail_all(|| PulseError::closed("transport"));
        debug!(account = %self.account, "Transport stopped");
    }

    // ---- Commands -----------------------------------------------------------

    async fn handle_command(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Connect { session, reply } => {
                let result = self.connect(*session).await;
                let _ = reply.send(result);
            }
            TransportCommand::Disconnect { reply } => {
                if self.ws.is_some() {
                    self.teardown(Some(CLOSE_NORMAL), "client disconnect".into(), true)
                        .await;
                }
                let _ = reply.send(());
            }
            TransportCommand::Send { frame, reply } => {
                let result = self.send_frame(&frame).await;
                let _ = reply.send(result);
            }
            TransportCommand::Request {
                frame,
                req_id,
                reply,
            } => {
                if self.state != ConnectionState::Ready {
                    let _ = reply.send(Err(PulseError::not_connected()));
                    return;
                }
                self.pending.insert(req_id.clone(), reply);
                if let Err(e) = self.send_frame(&frame).await {
                    self.pending.complete(&req_id, Err(e));
                }
            }
            TransportCommand::CancelRequest { req_id } => {
                if self.pending.cancel(&req_id) {
                    debug!(account = %self.account, req_id = %req_id, "Request cancelled");
                }
            }
            TransportCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            TransportCommand::PendingCount { reply } => {
                let _ = reply.send(self.pending.len());
            }
        }
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            endpoint: self.endpoint.clone(),
            attempt: self.tracker.attempt(),
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(account = %self.account, from = %self.state, to = %state, "Transport state changed");
            self.state = state;
        }
    }

    async fn connect(&mut self, session: Session) -> PulseResult<ConnectOutcome> {
        if self.state.is_connected() {
            return Ok(ConnectOutcome::AlreadyConnected);
        }
        if session.ws_endpoints.is_empty() {
            return Err(PulseError::invalid_input(
                "session carries no realtime endpoints",
            ));
        }

        self.rotation.replace(session.ws_endpoints.clone());
        self.api_type = session.api_type;
        self.api_version = session.api_version;
        let endpoint = match self.rotation.current() {
            Some(endpoint) => endpoint.to_string(),
            None => return Err(PulseError::invalid_input("no realtime endpoint")),
        };

        self.set_state(ConnectionState::Connecting);
        let url = self.endpoint_url(&endpoint);
        let request = match self.handshake_request(&url).await {
            Ok(request) => request,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        info!(account = %self.account, endpoint = %endpoint, "Connecting");
        match tokio::time::timeout(self.settings.connect_timeout(), connect_async(request)).await {
            Ok(Ok((ws, _response))) => {
                let now = Instant::now();
                self.ws = Some(ws);
                self.endpoint = Some(endpoint.clone());
                self.cipher_key = None;
                self.tracker.record_connected(now.into_std());
                self.stable_at = Some(now + self.settings.stable_window());
                self.set_state(ConnectionState::Connected);
                info!(account = %self.account, endpoint = %endpoint, "Connected");
                self.publish(EventType::Connected, json!({ "endpoint": endpoint }));
                Ok(ConnectOutcome::Connected)
            }
            Ok(Err(e)) => Err(self.connect_failed(endpoint, e.to_string())),
            Err(_) => Err(self.connect_failed(endpoint, "connect timed out".into())),
        }
    }

    fn connect_failed(&mut self, endpoint: String, reason: String) -> PulseError {
        self.set_state(ConnectionState::Disconnected);
        let attempt = self.tracker.record_failure(Instant::now().into_std());
        let next = self.rotation.advance().map(str::to_string);
        warn!(
            account = %self.account,
            endpoint = %endpoint,
            attempt,
            reason = %reason,
            "Connect failed"
        );

        let error = PulseError::network(format!("failed to connect to {endpoint}: {reason}"))
            .with_detail("endpoint", Value::String(endpoint))
            .with_detail("attempt", json!(attempt));
        self.publish(EventType::Error, error.to_payload());
        self.publish(
            EventType::Disconnected,
            json!({
                "code": Value::Null,
                "reason": reason,
                "retryable": true,
                "attempt": attempt,
                "endpoint": next,
            }),
        );
        error
    }

    fn endpoint_url(&self, endpoint: &str) -> String {
        let separator = if endpoint.contains('?') { '&' } else { '?' };
        format!(
            "{endpoint}{separator}zpw_ver={}&zpw_type={}&t={}",
            self.api_version,
            self.api_type,
            now_millis()
        )
    }

    async fn handshake_request(&self, url: &str) -> PulseResult<Request> {
        let mut request = url
            .into_client_request()
            .map_err(|e| PulseError::invalid_input(format!("invalid realtime endpoint {url}: {e}")))?;

        if let Some(manager) = self.registry.session_manager(&self.account) {
            if let Ok(credentials) = manager.credentials().await {
                if let Ok(value) = HeaderValue::from_str(credentials.user_agent()) {
                    request.headers_mut().insert(header::USER_AGENT, value);
                }
            }
        }
        if let Some(cookies) = self.registry.cookie_store(&self.account) {
            if let Ok(cookie) = cookies.header_for(url).await {
                if !cookie.is_empty() {
                    if let Ok(value) = HeaderValue::from_str(&cookie) {
                        request.headers_mut().insert(header::COOKIE, value);
                    }
                }
            }
        }
        Ok(request)
    }

    async fn send_frame(&mut self, frame: &Frame) -> PulseResult<()> {
        let Some(ws) = self.ws.as_mut() else {
            return Err(PulseError::not_connected());
        };
        if let Err(e) = ws.send(Message::Binary(frame.encode())).await {
            let error = PulseError::websocket(format!("send failed: {e}"));
            self.teardown(None, e.to_string(), false).await;
            return Err(error);
        }
        trace!(account = %self.account, cmd = frame.cmd(), sub_cmd = frame.sub_cmd(), "Frame sent");
        Ok(())
    }

    async fn send_ping(&mut self) {
        if let Err(e) = self.send_frame(&Frame::ping(now_millis())).await {
            warn!(account = %self.account, error = %e, "Keepalive ping failed");
        }
    }

    fn on_stable(&mut self) {
        self.stable_at = None;
        if self.tracker.reset_if_stable(Instant::now().into_std()) {
            debug!(account = %self.account, "Connection stable, attempt counter reset");
        }
    }

    // ---- Inbound ------------------------------------------------------------

    async fn handle_message(&mut self, message: Option<Result<Message, WsError>>) {
        match message {
            Some(Ok(Message::Binary(bytes))) => self.handle_frame(&bytes).await,
            Some(Ok(Message::Text(text))) => self.handle_frame(text.as_bytes()).await,
            Some(Ok(Message::Close(close))) => {
                let code = close.as_ref().map(|c| u16::from(c.code));
                let reason = close.map(|c| c.reason.to_string()).unwrap_or_default();
                self.teardown(code, reason, false).await;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => self.teardown(None, e.to_string(), false).await,
            None => self.teardown(None, "stream ended".into(), false).await,
        }
    }

    async fn handle_frame(&mut self, bytes: &[u8]) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(account = %self.account, error = %e, "Dropping undecodable frame");
                return;
            }
        };

        match frame.route() {
            Route::CipherKey => self.on_cipher_key(&frame),
            Route::Ping => trace!(account = %self.account, "Ping acknowledged"),
            Route::Duplicate => {
                warn!(account = %self.account, "Connection replaced by another session");
                self.teardown(Some(CLOSE_DUPLICATE), "duplicate connection".into(), true)
                    .await;
            }
            Route::Event { event, sub } => self.on_event(event, sub, &frame),
            Route::Control => self.on_control(&frame),
            Route::Unknown => debug!(
                account = %self.account,
                cmd = frame.cmd(),
                sub_cmd = frame.sub_cmd(),
                "Dropping frame with unknown command"
            ),
        }
    }

    fn on_cipher_key(&mut self, frame: &Frame) {
        let Some(key) = frame.body.get("key").and_then(Value::as_str) else {
            warn!(account = %self.account, "Cipher key frame without a key");
            return;
        };
        self.cipher_key = Some(key.to_string());
        self.set_state(ConnectionState::Ready);
        self.ping.reset();
        info!(account = %self.account, "Realtime channel ready");
        self.publish(EventType::CipherKey, json!({ "key": key }));
        self.publish(EventType::Ready, json!({ "endpoint": self.endpoint }));
    }

    fn decode_body(&self, frame: &Frame) -> Option<Value> {
        match payload::decode_value(&frame.body, self.cipher_key.as_deref()) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    account = %self.account,
                    cmd = frame.cmd(),
                    error = %e,
                    "Dropping frame with undecodable payload"
                );
                None
            }
        }
    }

    fn on_event(&mut self, event: EventType, sub: Option<SubType>, frame: &Frame) {
        let Some(data) = self.decode_body(frame) else {
            return;
        };

        let req_id = data
            .get("req_id")
            .and_then(Value::as_str)
            .or_else(|| frame.req_id())
            .map(str::to_string);
        if let Some(req_id) = req_id {
            if !self.pending.complete(&req_id, Ok(data)) {
                debug!(account = %self.account, req_id = %req_id, "Dropping stale reply");
            }
            return;
        }

        let topic = match sub {
            Some(sub) => Topic::with_sub(self.account.clone(), event, sub),
            None => Topic::new(self.account.clone(), event),
        };
        self.bus.broadcast(topic, data);
    }

    fn on_control(&mut self, frame: &Frame) {
        let Some(data) = self.decode_body(frame) else {
            return;
        };
        for (event, control) in frame::split_controls(&data) {
            self.publish(event, control);
        }
    }

    /// Drop the socket and publish the disconnect
    async fn teardown(&mut self, code: Option<u16>, reason: String, send_close: bool) {
        if let Some(mut ws) = self.ws.take() {
            if send_close {
                let close = CloseFrame {
                    code: CloseCode::from(code.unwrap_or(CLOSE_NORMAL)),
                    reason: reason.clone().into(),
                };
                let _ = ws.close(Some(close)).await;
            }
        }
        let endpoint = self.endpoint.take();
        self.cipher_key = None;
        self.stable_at = None;
        self.set_state(ConnectionState::Disconnected);
        self.pending.fail_all(|| PulseError::closed("realtime connection"));

        let retryable = frame::is_retryable_close(code);
        let (attempt, next) = if retryable {
            let attempt = self.tracker.record_failure(Instant::now().into_std());
            (attempt, self.rotation.advance().map(str::to_string))
        } else {
            self.tracker.reset();
            (0, endpoint.clone())
        };

        if retryable {
            warn!(account = %self.account, code = ?code, reason = %reason, attempt, "Connection lost");
        } else {
            info!(account = %self.account, code = ?code, reason = %reason, "Connection closed");
        }

        if code.is_some() {
            self.publish(EventType::Closed, json!({ "code": code, "reason": reason }));
        }
        self.publish(
            EventType::Disconnected,
            json!({
                "code": code,
                "reason": reason,
                "retryable": retryable,
                "attempt": attempt,
                "endpoint": next,
            }),
        );
    }

    fn publish(&self, event: EventType, payload: Value) {
        self.bus.broadcast(Topic::new(self.account.clone(), event), payload);
    }
}

async fn next_message(ws: &mut Option<WsStream>) -> Option<Result<Message, WsError>> {
    match ws.as_mut() {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
