//! Handle Registry
//!
//! Process-wide table of live component handles keyed by `(account, role)`.
//! Components never hold each other's handles; they look them up here on
//! every use so a restarted role is picked up transparently.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use pulsechat_core::AccountId;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;

use crate::cookie_store::CookieStoreHandle;
use crate::coordinator::CoordinatorHandle;
use crate::session_manager::SessionManagerHandle;
use crate::transport::TransportHandle;

/// Component kinds making up an account's tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    CookieStore,
    SessionManager,
    Transport,
    Coordinator,
}

impl Role {
    /// Start order; shutdown runs in reverse
    pub const ALL: [Role; 4] = [
        Role::CookieStore,
        Role::SessionManager,
        Role::Transport,
        Role::Coordinator,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::CookieStore => "cookie_store",
            Role::SessionManager => "session_manager",
            Role::Transport => "transport",
            Role::Coordinator => "coordinator",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed handle for one role
#[derive(Clone)]
pub enum RoleHandle {
    CookieStore(CookieStoreHandle),
    SessionManager(SessionManagerHandle),
    Transport(TransportHandle),
    Coordinator(CoordinatorHandle),
}

impl RoleHandle {
    pub fn role(&self) -> Role {
        match self {
            RoleHandle::CookieStore(_) => Role::CookieStore,
            RoleHandle::SessionManager(_) => Role::SessionManager,
            RoleHandle::Transport(_) => Role::Transport,
            RoleHandle::Coordinator(_) => Role::Coordinator,
        }
    }

    /// True while the role's mailbox is still being served
    pub fn is_alive(&self) -> bool {
        match self {
            RoleHandle::CookieStore(h) => h.is_alive(),
            RoleHandle::SessionManager(h) => h.is_alive(),
            RoleHandle::Transport(h) => h.is_alive(),
            RoleHandle::Coordinator(h) => h.is_alive(),
        }
    }
}

struct Entry {
    handle: RoleHandle,
    task: AbortHandle,
}

/// Shared `(account, role)` handle table
#[derive(Clone, Default)]
pub struct Registry {
    entries: Arc<DashMap<(AccountId, Role), Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the handle for the handle's role
    pub fn register(&self, account: AccountId, handle: RoleHandle, task: AbortHandle) {
        let role = handle.role();
        self.entries.insert((account, role), Entry { handle, task });
    }

    pub fn get(&self, account: &AccountId, role: Role) -> Option<RoleHandle> {
        self.entries
            .get(&(account.clone(), role))
            .map(|entry| entry.handle.clone())
    }

    pub fn contains(&self, account: &AccountId, role: Role) -> bool {
        self.entries.contains_key(&(account.clone(), role))
    }

    /// Registered and its task still running
    pub fn is_alive(&self, account: &AccountId, role: Role) -> bool {
        self.entries
            .get(&(account.clone(), role))
            .is_some_and(|entry| !entry.task.is_finished() && entry.handle.is_alive())
    }

    pub fn cookie_store(&self, account: &AccountId) -> Option<CookieStoreHandle> {
        match self.get(account, Role::CookieStore)? {
            RoleHandle::CookieStore(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn session_manager(&self, account: &AccountId) -> Option<SessionManagerHandle> {
        match self.get(account, Role::SessionManager)? {
            RoleHandle::SessionManager(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn transport(&self, account: &AccountId) -> Option<TransportHandle> {
        match self.get(account, Role::Transport)? {
            RoleHandle::Transport(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn coordinator(&self, account: &AccountId) -> Option<CoordinatorHandle> {
        match self.get(account, Role::Coordinator)? {
            RoleHandle::Coordinator(handle) => Some(handle),
            _ => None,
        }
    }

    /// Abort a role's task, leaving its entry in place
    pub fn abort(&self, account: &AccountId, role: Role) -> bool {
        match self.entries.get(&(account.clone(), role)) {
            Some(entry) => {
                entry.task.abort();
                true
            }
            None => false,
        }
    }

    /// Abort and forget every role of an account, coordinator first
    pub fn remove_account(&self, account: &AccountId) -> usize {
        Role::ALL
            .iter()
            .rev()
            .filter_map(|role| self.entries.remove(&(account.clone(), *role)))
            .map(|(_, entry)| entry.task.abort())
            .count()
    }

    /// Accounts with at least one registered role
    pub fn accounts(&self) -> Vec<AccountId> {
        let mut accounts: Vec<AccountId> =
            self.entries.iter().map(|entry| entry.key().0.clone()).collect();
        accounts.sort();
        accounts.dedup();
        accounts
    }
}
