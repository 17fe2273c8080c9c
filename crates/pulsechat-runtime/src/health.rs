//! Account health and the ensure-connected orchestration

use std::fmt;

use pulsechat_core::{AccountId, Credentials, ErrorKind, PulseError, PulseResult, Session};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::registry::{Registry, Role};
use crate::runtime::Runtime;
use crate::transport::ConnectOutcome;

/// Liveness of an account's component tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Ok,
    NotFound,
    PartialStart,
    CookieStoreDead,
    ManagerDead,
    TransportDead,
}

impl Health {
    pub fn as_str(self) -> &'static str {
        match self {
            Health::Ok => "ok",
            Health::NotFound => "not_found",
            Health::PartialStart => "partial_start",
            Health::CookieStoreDead => "cookie_store_dead",
            Health::ManagerDead => "manager_dead",
            Health::TransportDead => "transport_dead",
        }
    }

    pub fn is_ok(self) -> bool {
        self == Health::Ok
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Roles checked for health, in the order dead components are reported
const CHECKED: [(Role, Health); 3] = [
    (Role::CookieStore, Health::CookieStoreDead),
    (Role::SessionManager, Health::ManagerDead),
    (Role::Transport, Health::TransportDead),
];

/// Classify the account's cookie store, session manager and transport
pub fn classify(registry: &Registry, account: &AccountId) -> Health {
    let present = CHECKED
        .iter()
        .filter(|(role, _)| registry.contains(account, *role))
        .count();
    if present == 0 {
        return Health::NotFound;
    }

    for (role, dead) in CHECKED {
        if registry.contains(account, role) && !registry.is_alive(account, role) {
            return dead;
        }
    }

    if present < CHECKED.len() {
        Health::PartialStart
    } else {
        Health::Ok
    }
}

impl Runtime {
    pub fn health(&self, account: &AccountId) -> Health {
        classify(self.registry(), account)
    }

    /// Bring the account's tree up if needed and make sure the transport is connected
    ///
    /// A missing tree is started with `session`; a dead or partial one is reset
    /// and started again. A healthy tree keeps the session its manager already
    /// holds and only takes `session` when it has none. Returns the session the
    /// transport was connected with.
    pub async fn ensure_connected(
        &self,
        account: &AccountId,
        credentials: Credentials,
        session: Session,
    ) -> PulseResult<Session> {
        match self.health(account) {
            Health::Ok => {}
            Health::NotFound => {
                info!(account = %account, "Starting account tree");
                self.start_account(account.clone(), credentials, Some(session.clone()))?;
            }
            health => {
                warn!(account = %account, health = %health, "Restarting unhealthy account tree");
                self.reset(account);
                self.start_account(account.clone(), credentials, Some(session.clone()))?;
            }
        }

        let manager = self
            .registry()
            .session_manager(account)
            .ok_or_else(|| PulseError::not_found(format!("session manager for account {account}")))?;
        let current = match manager.session().await? {
            Some(current) => current,
            None => {
                manager.set_session(session.clone()).await?;
                session
            }
        };
        self.ensure_ws_connected(account, current.clone()).await?;
        Ok(current)
    }

    /// Connect the transport unless it is already connected or ready
    pub async fn ensure_ws_connected(
        &self,
        account: &AccountId,
        session: Session,
    ) -> PulseResult<ConnectOutcome> {
        let transport = self
            .registry()
            .transport(account)
            .ok_or_else(|| PulseError::not_found(format!("transport for account {account}")))?;

        if transport.status().await?.state.is_connected() {
            return Ok(ConnectOutcome::AlreadyConnected);
        }
        match transport.connect(session).await {
            Err(e) if e.kind() == ErrorKind::AlreadyConnected => Ok(ConnectOutcome::AlreadyConnected),
            result => result,
        }
    }
}
