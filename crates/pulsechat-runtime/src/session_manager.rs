//! Session Manager
//!
//! Owns the account's credentials and its current authenticated session.
//! Other components read the session through this task; only the login path
//! and the export/import hooks replace it.

use std::collections::BTreeMap;

use pulsechat_core::{AccountId, Credentials, PulseError, PulseResult, Session};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

enum SessionCommand {
    Get {
        reply: oneshot::Sender<Option<Session>>,
    },
    Credentials {
        reply: oneshot::Sender<Credentials>,
    },
    Set {
        session: Session,
    },
    Clear,
    Export {
        include_secret: bool,
        reply: oneshot::Sender<Option<BTreeMap<String, Value>>>,
    },
    Import {
        map: BTreeMap<String, Value>,
        reply: oneshot::Sender<PulseResult<()>>,
    },
}

/// Handle to an account's session manager task
#[derive(Clone)]
pub struct SessionManagerHandle {
    sender: mpsc::Sender<SessionCommand>,
}

impl SessionManagerHandle {
    /// Spawn a manager for `credentials`, optionally seeded with a session
    pub fn spawn(
        account: AccountId,
        credentials: Credentials,
        session: Option<Session>,
        mailbox_size: usize,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(mailbox_size.max(1));
        let state = SessionState {
            account,
            credentials,
            session,
        };
        let task = tokio::spawn(state.run(receiver));
        (Self { sender }, task)
    }

    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    pub async fn session(&self) -> PulseResult<Option<Session>> {
        let (reply, rx) = oneshot::channel();
        self.call(SessionCommand::Get { reply }, rx).await
    }

    pub async fn credentials(&self) -> PulseResult<Credentials> {
        let (reply, rx) = oneshot::channel();
        self.call(SessionCommand::Credentials { reply }, rx).await
    }

    pub async fn set_session(&self, session: Session) -> PulseResult<()> {
        self.send(SessionCommand::Set { session }).await
    }

    pub async fn clear(&self) -> PulseResult<()> {
        self.send(SessionCommand::Clear).await
    }

    /// Serialize the current session; the secret key is only kept on request
    pub async fn export(&self, include_secret: bool) -> PulseResult<Option<BTreeMap<String, Value>>> {
        let (reply, rx) = oneshot::channel();
        self.call(
            SessionCommand::Export {
                include_secret,
                reply,
            },
            rx,
        )
        .await
    }

    /// Replace the current session from an exported map
    pub async fn import(&self, map: BTreeMap<String, Value>) -> PulseResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(SessionCommand::Import { map, reply }, rx).await?
    }

    async fn send(&self, command: SessionCommand) -> PulseResult<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| PulseError::closed("session manager"))
    }

    async fn call<T>(&self, command: SessionCommand, rx: oneshot::Receiver<T>) -> PulseResult<T> {
        self.send(command).await?;
        rx.await.map_err(|_| PulseError::closed("session manager"))
    }
}

struct SessionState {
    account: AccountId,
    credentials: Credentials,
    session: Option<Session>,
}

impl SessionState {
    async fn run(mut self, mut receiver: mpsc::Receiver<SessionCommand>) {
        info!(
            account = %self.account,
            has_session = self.session.is_some(),
            "Session manager started"
        );
        while let Some(command) = receiver.recv().await {
            self.handle(command);
        }
        debug!(account = %self.account, "Session manager stopped");
    }

    fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Get { reply } => {
                let _ = reply.send(self.session.clone());
            }
            SessionCommand::Credentials { reply } => {
                let _ = reply.send(self.credentials.clone());
            }
            SessionCommand::Set { session } => {
                info!(account = %self.account, user_id = %session.user_id, "Session stored");
                self.session = Some(session);
            }
            SessionCommand::Clear => {
                debug!(account = %self.account, "Session cleared");
                self.session = None;
            }
            SessionCommand::Export {
                include_secret,
                reply,
            } => {
                let _ = reply.send(self.session.as_ref().map(|s| s.to_map(include_secret)));
            }
            SessionCommand::Import { map, reply } => {
                let result = Session::from_map(&map)
                    .map(|session| {
                        info!(account = %self.account, user_id = %session.user_id, "Session imported");
                        self.session = Some(session);
                    })
                    .map_err(PulseError::from);
                let _ = reply.send(result);
            }
        }
    }
}
