//! Account Supervisor
//!
//! Each role of an account runs under a monitor task. A role whose task
//! panicked is rebuilt from its factory and re-registered, up to
//! `max_restarts` times. A role that returns or is aborted stays down.

use pulsechat_core::AccountId;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::registry::{Registry, Role, RoleHandle};

/// Builds a fresh instance of one role and spawns its task
pub type RoleFactory = Box<dyn FnMut() -> (RoleHandle, JoinHandle<()>) + Send>;

// ----------------------------------------------------------------------------
// Account Supervisor
// ----------------------------------------------------------------------------

/// Monitors for one account's roles
pub struct AccountSupervisor {
    account: AccountId,
    registry: Registry,
    max_restarts: u32,
    monitors: Vec<(Role, JoinHandle<()>)>,
}

impl AccountSupervisor {
    pub fn new(account: AccountId, registry: Registry, max_restarts: u32) -> Self {
        Self {
            account,
            registry,
            max_restarts,
            monitors: Vec::new(),
        }
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    /// Start a role now and keep it supervised
    ///
    /// The first instance is registered before this returns.
    pub fn start(&mut self, role: Role, mut factory: RoleFactory) {
        let (handle, task) = factory();
        debug_assert_eq!(handle.role(), role);
        self.registry
            .register(self.account.clone(), handle, task.abort_handle());
        debug!(account = %self.account, role = %role, "Role started");

        let monitor = tokio::spawn(monitor(
            self.registry.clone(),
            self.account.clone(),
            role,
            factory,
            task,
            self.max_restarts,
        ));
        self.monitors.push((role, monitor));
    }

    /// Roles with a running monitor
    pub fn roles(&self) -> Vec<Role> {
        self.monitors
            .iter()
            .filter(|(_, monitor)| !monitor.is_finished())
            .map(|(role, _)| *role)
            .collect()
    }

    /// Abort every monitor, then every role task, and drop the registry entries
    pub fn shutdown(&mut self) {
        for (_, monitor) in self.monitors.drain(..) {
            monitor.abort();
        }
        let removed = self.registry.remove_account(&self.account);
        if removed > 0 {
            info!(account = %self.account, roles = removed, "Account tree stopped");
        }
    }
}

impl Drop for AccountSupervisor {
    fn drop(&mut self) {
        for (_, monitor) in &self.monitors {
            monitor.abort();
        }
    }
}

async fn monitor(
    registry: Registry,
    account: AccountId,
    role: Role,
    mut factory: RoleFactory,
    mut task: JoinHandle<()>,
    max_restarts: u32,
) {
    let mut restarts = 0;
    loop {
        match (&mut task).await {
            Ok(()) => {
                debug!(account = %account, role = %role, "Role exited");
                return;
            }
            Err(e) if e.is_panic() => {
                if restarts >= max_restarts {
                    error!(
                        account = %account,
                        role = %role,
                        restarts,
                        "Role crashed and its restart budget is exhausted"
                    );
                    return;
                }
                restarts += 1;
                warn!(account = %account, role = %role, restart = restarts, "Role crashed, restarting");
                let (handle, next) = factory();
                registry.register(account.clone(), handle, next.abort_handle());
                task = next;
            }
            Err(_) => {
                debug!(account = %account, role = %role, "Role cancelled");
                return;
            }
        }
    }
}
