//! PulseChat Runtime
//!
//! Process-level owner of the event bus, the handle registry and one
//! supervised component tree per account.
//!
//! ```rust,no_run
//! use pulsechat_core::{AccountId, Credentials, Session};
//! use pulsechat_runtime::RuntimeBuilder;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = RuntimeBuilder::new().build()?;
//! let account = AccountId::new("primary")?;
//! let credentials = Credentials::builder()
//!     .device_id("device")
//!     .cookie("zpw_sek=...")
//!     .user_agent("Mozilla/5.0")
//!     .build()?;
//! # let session = Session::default();
//! runtime.ensure_connected(&account, credentials, session).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use pulsechat_core::{
    AccountId, Credentials, PulseError, PulseResult, RuntimeConfig, RuntimeSettings, Session,
};
use tracing::info;

use crate::bus::EventBus;
use crate::cookie_store::{CookieJar, CookieStoreHandle};
use crate::coordinator::{CoordinatorContext, CoordinatorHandle};
use crate::login::LoginProvider;
use crate::registry::{Registry, Role, RoleHandle};
use crate::session_manager::SessionManagerHandle;
use crate::supervisor::AccountSupervisor;
use crate::transport::{TransportContext, TransportHandle};

struct RuntimeInner {
    settings: RuntimeSettings,
    bus: EventBus,
    registry: Registry,
    login: Arc<dyn LoginProvider>,
    supervisors: DashMap<AccountId, AccountSupervisor>,
}

/// Shared runtime; cheap to clone
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub(crate) fn new(
        settings: RuntimeSettings,
        bus: EventBus,
        login: Arc<dyn LoginProvider>,
    ) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                settings,
                bus,
                registry: Registry::new(),
                login,
                supervisors: DashMap::new(),
            }),
        }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.inner.settings
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Accounts with a started tree
    pub fn accounts(&self) -> Vec<AccountId> {
        let mut accounts: Vec<AccountId> = self
            .inner
            .supervisors
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        accounts.sort();
        accounts
    }

    // ---- Account lifecycle --------------------------------------------------

    /// Start an account with the default config
    pub fn start_account(
        &self,
        account: AccountId,
        credentials: Credentials,
        session: Option<Session>,
    ) -> PulseResult<()> {
        let config = self.inner.settings.defaults.clone();
        self.start_account_with_config(account, credentials, session, config)
    }

    /// Start cookie store, session manager, transport and coordinator, in that order
    pub fn start_account_with_config(
        &self,
        account: AccountId,
        credentials: Credentials,
        session: Option<Session>,
        config: RuntimeConfig,
    ) -> PulseResult<()> {
        config.validate()?;
        if self.inner.supervisors.contains_key(&account) {
            return Err(PulseError::invalid_input(format!(
                "account {account} is already started"
            )));
        }

        let settings = &self.inner.settings;
        let mailbox = settings.supervisor.mailbox_size;
        let mut supervisor = AccountSupervisor::new(
            account.clone(),
            self.inner.registry.clone(),
            settings.supervisor.max_restarts,
        );

        let jar = CookieJar::from_blob(credentials.cookie());
        let acc = account.clone();
        supervisor.start(
            Role::CookieStore,
            Box::new(move || {
                let (handle, task) = CookieStoreHandle::spawn(acc.clone(), jar.clone(), mailbox);
                (RoleHandle::CookieStore(handle), task)
            }),
        );

        let acc = account.clone();
        supervisor.start(
            Role::SessionManager,
            Box::new(move || {
                let (handle, task) =
                    SessionManagerHandle::spawn(acc.clone(), credentials.clone(), session.clone(), mailbox);
                (RoleHandle::SessionManager(handle), task)
            }),
        );

        let transport = TransportContext {
            account: account.clone(),
            bus: self.inner.bus.clone(),
            registry: self.inner.registry.clone(),
            settings: settings.transport.clone(),
        };
        supervisor.start(
            Role::Transport,
            Box::new(move || {
                let (handle, task) = TransportHandle::spawn(transport.clone());
                (RoleHandle::Transport(handle), task)
            }),
        );

        let coordinator = CoordinatorContext {
            account: account.clone(),
            bus: self.inner.bus.clone(),
            registry: self.inner.registry.clone(),
            login: self.inner.login.clone(),
            config,
            mailbox_size: mailbox,
        };
        supervisor.start(
            Role::Coordinator,
            Box::new(move || {
                let (handle, task) = CoordinatorHandle::spawn(coordinator.clone());
                (RoleHandle::Coordinator(handle), task)
            }),
        );

        info!(account = %account, "Account started");
        self.inner.supervisors.insert(account, supervisor);
        Ok(())
    }

    /// Stop and forget an account's tree; a no-op for unknown accounts
    pub fn reset(&self, account: &AccountId) {
        if let Some((_, mut supervisor)) = self.inner.supervisors.remove(account) {
            supervisor.shutdown();
        }
        self.inner.registry.remove_account(account);
    }

    /// Abort one role without restarting it
    pub fn kill_role(&self, account: &AccountId, role: Role) -> bool {
        self.inner.registry.abort(account, role)
    }

    /// Stop every account
    pub async fn shutdown(&self) {
        for account in self.accounts() {
            if let Some(coordinator) = self.coordinator(&account) {
                let _ = coordinator.stop().await;
            }
            if let Some(transport) = self.transport(&account) {
                let _ = transport.disconnect().await;
            }
            self.reset(&account);
        }
        info!("Runtime shut down");
    }

    // ---- Handles ------------------------------------------------------------

    pub fn cookie_store(&self, account: &AccountId) -> Option<CookieStoreHandle> {
        self.inner.registry.cookie_store(account)
    }

    pub fn session_manager(&self, account: &AccountId) -> Option<SessionManagerHandle> {
        self.inner.registry.session_manager(account)
    }

    pub fn transport(&self, account: &AccountId) -> Option<TransportHandle> {
        self.inner.registry.transport(account)
    }

    pub fn coordinator(&self, account: &AccountId) -> Option<CoordinatorHandle> {
        self.inner.registry.coordinator(account)
    }
}
