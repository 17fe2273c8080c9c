//! Realtime Transport
//!
//! One task per account owns the websocket. Commands arrive through
//! [`TransportHandle`]; inbound frames are decoded, routed through the closed
//! command table and published on the event bus. Connect attempts are
//! serialized by the task's mailbox.

mod connection;
mod pending;

pub use connection::TransportContext;
pub use pending::PendingRequests;

use std::time::Duration;

use pulsechat_core::{ConnectionStatus, Frame, PulseError, PulseResult, Session, SubType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use pending::ReplySender;

/// Result of a successful connect call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectOutcome {
    /// A new socket was opened
    Connected,
    /// The transport was already connected or ready; nothing changed
    AlreadyConnected,
}

pub(crate) enum TransportCommand {
    Connect {
        session: Box<Session>,
        reply: oneshot::Sender<PulseResult<ConnectOutcome>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Send {
        frame: Frame,
        reply: oneshot::Sender<PulseResult<()>>,
    },
    Request {
        frame: Frame,
        req_id: String,
        reply: ReplySender,
    },
    CancelRequest {
        req_id: String,
    },
    Status {
        reply: oneshot::Sender<ConnectionStatus>,
    },
    PendingCount {
        reply: oneshot::Sender<usize>,
    },
}

// ----------------------------------------------------------------------------
// Transport Handle
// ----------------------------------------------------------------------------

/// Handle to an account's realtime transport task
#[derive(Clone)]
pub struct TransportHandle {
    sender: mpsc::Sender<TransportCommand>,
    request_timeout: Duration,
}

impl TransportHandle {
    /// Spawn a transport task
    pub fn spawn(context: TransportContext) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(context.settings.command_buffer_size.max(1));
        let request_timeout = context.settings.request_timeout();
        let task = tokio::spawn(connection::Connection::new(context, receiver).run());
        (
            Self {
                sender,
                request_timeout,
            },
            task,
        )
    }

    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Connect using the session's candidate endpoints
    ///
    /// Idempotent: an already connected transport answers
    /// [`ConnectOutcome::AlreadyConnected`].
    pub async fn connect(&self, session: Session) -> PulseResult<ConnectOutcome> {
        let (reply, rx) = oneshot::channel();
        self.call(
            TransportCommand::Connect {
                session: Box::new(session),
                reply,
            },
            rx,
        )
        .await?
    }

    /// Close the socket with a normal closure; no reconnect follows
    pub async fn disconnect(&self) -> PulseResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(TransportCommand::Disconnect { reply }, rx).await
    }

    /// Send a frame without waiting for a reply
    pub async fn send(&self, frame: Frame) -> PulseResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(TransportCommand::Send { frame, reply }, rx).await?
    }

    /// Send a frame and wait for the reply carrying the same `req_id`
    pub async fn request(&self, frame: Frame) -> PulseResult<Value> {
        self.request_with_timeout(frame, self.request_timeout).await
    }

    pub async fn request_with_timeout(
        &self,
        mut frame: Frame,
        timeout: Duration,
    ) -> PulseResult<Value> {
        let req_id = ensure_req_id(&mut frame)?;
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(TransportCommand::Request {
                frame,
                req_id: req_id.clone(),
                reply,
            })
            .await
            .map_err(|_| PulseError::closed("transport"))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PulseError::closed("transport")),
            Err(_) => {
                debug!(req_id = %req_id, "Request timed out");
                let _ = self
                    .sender
                    .send(TransportCommand::CancelRequest { req_id })
                    .await;
                Err(PulseError::timeout(
                    "realtime request",
                    timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Request message history before `last_id`
    pub async fn fetch_old_messages(&self, sub: SubType, last_id: Option<&str>) -> PulseResult<Value> {
        let req_id = Uuid::new_v4().to_string();
        self.request(Frame::old_messages(sub, last_id, &req_id)).await
    }

    /// Request reaction history before `last_id`
    pub async fn fetch_old_reactions(
        &self,
        sub: SubType,
        last_id: Option<&str>,
    ) -> PulseResult<Value> {
        let req_id = Uuid::new_v4().to_string();
        self.request(Frame::old_reactions(sub, last_id, &req_id)).await
    }

    pub async fn status(&self) -> PulseResult<ConnectionStatus> {
        let (reply, rx) = oneshot::channel();
        self.call(TransportCommand::Status { reply }, rx).await
    }

    /// Requests still waiting for a reply
    pub async fn pending_count(&self) -> PulseResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.call(TransportCommand::PendingCount { reply }, rx).await
    }

    async fn call<T>(&self, command: TransportCommand, rx: oneshot::Receiver<T>) -> PulseResult<T> {
        self.sender
            .send(command)
            .await
            .map_err(|_| PulseError::closed("transport"))?;
        rx.await.map_err(|_| PulseError::closed("transport"))
    }
}

fn ensure_req_id(frame: &mut Frame) -> PulseResult<String> {
    if let Some(id) = frame.req_id() {
        return Ok(id.to_string());
    }
    let id = Uuid::new_v4().to_string();
    match &mut frame.body {
        Value::Object(map) => {
            map.insert("req_id".into(), Value::String(id.clone()));
        }
        Value::Null => frame.body = serde_json::json!({ "req_id": id }),
        _ => {
            return Err(PulseError::invalid_input(
                "request frames must carry a JSON object body",
            ))
        }
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ensure_req_id() {
        let mut frame = Frame::new(510, 1, json!({"lastId": "1"}));
        let id = ensure_req_id(&mut frame).unwrap();
        assert_eq!(frame.req_id(), Some(id.as_str()));

        let mut frame = Frame::new(510, 1, json!({"req_id": "fixed"}));
        assert_eq!(ensure_req_id(&mut frame).unwrap(), "fixed");

        let mut frame = Frame::new(510, 1, Value::Null);
        assert!(ensure_req_id(&mut frame).is_ok());

        let mut frame = Frame::new(510, 1, json!([1, 2]));
        assert!(ensure_req_id(&mut frame).is_err());
    }
}
