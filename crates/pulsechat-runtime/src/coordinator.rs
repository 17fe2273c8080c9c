//! Account Runtime Coordinator
//!
//! Owns the account's phase and declarative config and reconciles the two
//! against the session manager and transport. Requests and bus events are
//! handled one at a time from the same task; the login and connect calls run
//! in short-lived helper tasks that report back through the mailbox.
//!
//! `stopped` is terminal: nothing moves the phase away from it and any
//! pending retry timer is aborted on entry.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use pulsechat_core::{
    AccountId, ConnectionState, ErrorKind, EventType, PulseError, PulseResult, RetryPolicy,
    RuntimeConfig, RuntimeConfigPatch, Session, Topic,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{BusMessage, EventBus, Subscriber};
use crate::login::LoginProvider;
use crate::registry::Registry;
use crate::transport::ConnectOutcome;

/// Coordinator lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    LoggingIn,
    Connecting,
    Ready,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::LoggingIn => "logging_in",
            Phase::Connecting => "connecting",
            Phase::Ready => "ready",
            Phase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Snapshot returned by [`CoordinatorHandle::status`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub phase: Phase,
    pub config: RuntimeConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Login,
    Connect,
}

enum CoordinatorCommand {
    Configure {
        patch: RuntimeConfigPatch,
        reply: oneshot::Sender<PulseResult<()>>,
    },
    Reconcile {
        reply: oneshot::Sender<()>,
    },
    Login {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<CoordinatorStatus>,
    },
    // Internal completions, tagged with the generation that started them
    LoginFinished {
        generation: u64,
        result: PulseResult<Session>,
    },
    ConnectFinished {
        generation: u64,
        result: PulseResult<ConnectOutcome>,
    },
    RetryDue {
        generation: u64,
        operation: Operation,
    },
}

/// Everything a coordinator needs from its account
#[derive(Clone)]
pub struct CoordinatorContext {
    pub account: AccountId,
    pub bus: EventBus,
    pub registry: Registry,
    pub login: Arc<dyn LoginProvider>,
    pub config: RuntimeConfig,
    pub mailbox_size: usize,
}

// ----------------------------------------------------------------------------
// Coordinator Handle
// ----------------------------------------------------------------------------

/// Handle to an account's coordinator task
#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::Sender<CoordinatorCommand>,
}

impl CoordinatorHandle {
    /// Spawn a coordinator; it broadcasts `runtime_started` once running
    pub fn spawn(context: CoordinatorContext) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(context.mailbox_size.max(1));
        let coordinator = Coordinator::new(context, receiver, sender.downgrade());
        let task = tokio::spawn(coordinator.run());
        (Self { sender }, task)
    }

    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Deep-merge `patch` into the config, then reconcile
    pub async fn configure(&self, patch: RuntimeConfigPatch) -> PulseResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(CoordinatorCommand::Configure { patch, reply }, rx)
            .await?
    }

    pub async fn reconcile(&self) -> PulseResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(CoordinatorCommand::Reconcile { reply }, rx).await
    }

    /// Log in regardless of `auto_login`
    pub async fn login(&self) -> PulseResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(CoordinatorCommand::Login { reply }, rx).await
    }

    pub async fn stop(&self) -> PulseResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(CoordinatorCommand::Stop { reply }, rx).await
    }

    pub async fn status(&self) -> PulseResult<CoordinatorStatus> {
        let (reply, rx) = oneshot::channel();
        self.call(CoordinatorCommand::Status { reply }, rx).await
    }

    pub async fn phase(&self) -> PulseResult<Phase> {
        Ok(self.status().await?.phase)
    }

    async fn call<T>(
        &self,
        command: CoordinatorCommand,
        rx: oneshot::Receiver<T>,
    ) -> PulseResult<T> {
        self.sender
            .send(command)
            .await
            .map_err(|_| PulseError::closed("coordinator"))?;
        rx.await.map_err(|_| PulseError::closed("coordinator"))
    }
}

// ----------------------------------------------------------------------------
// Coordinator Task
// ----------------------------------------------------------------------------

struct Coordinator {
    account: AccountId,
    bus: EventBus,
    registry: Registry,
    login: Arc<dyn LoginProvider>,
    commands: mpsc::Receiver<CoordinatorCommand>,
    self_sender: mpsc::WeakSender<CoordinatorCommand>,
    events: Subscriber,

    phase: Phase,
    config: RuntimeConfig,
    in_flight: Option<Operation>,
    // A reconnect came due while a connect was still running
    connect_deferred: bool,
    login_attempt: u32,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Coordinator {
    fn new(
        context: CoordinatorContext,
        commands: mpsc::Receiver<CoordinatorCommand>,
        self_sender: mpsc::WeakSender<CoordinatorCommand>,
    ) -> Self {
        let mut events = context.bus.subscriber();
        events.subscribe_all(
            [
                EventType::RuntimeStarted,
                EventType::LoginStart,
                EventType::Ready,
                EventType::Disconnected,
            ]
            .into_iter()
            .map(|event| Topic::new(context.account.clone(), event)),
        );

        Self {
            account: context.account,
            bus: context.bus,
            registry: context.registry,
            login: context.login,
            commands,
            self_sender,
            events,
            phase: Phase::Idle,
            config: context.config,
            in_flight: None,
            connect_deferred: false,
            login_attempt: 0,
            generation: 0,
            timer: None,
        }
    }

    async fn run(mut self) {
        info!(account = %self.account, "Coordinator started");
        self.publish(EventType::RuntimeStarted, json!({ "config": self.config }));

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(message) = self.events.recv() => self.handle_event(message).await,
            }
        }

        self.cancel_timer();
        debug!(account = %self.account, phase = %self.phase, "Coordinator stopped");
    }

    async fn handle_command(&mut self, command: CoordinatorCommand) {
        match command {
            CoordinatorCommand::Configure { patch, reply } => {
                let _ = reply.send(self.configure(patch).await);
            }
            CoordinatorCommand::Reconcile { reply } => {
                self.reconcile().await;
                let _ = reply.send(());
            }
            CoordinatorCommand::Login { reply } => {
                if self.phase != Phase::Stopped && self.in_flight.is_none() {
                    self.set_phase(Phase::LoggingIn);
                    self.publish(EventType::LoginStart, json!({ "explicit": true }));
                }
                let _ = reply.send(());
            }
            CoordinatorCommand::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            CoordinatorCommand::Status { reply } => {
                let _ = reply.send(CoordinatorStatus {
                    phase: self.phase,
                    config: self.config.clone(),
                });
            }
            CoordinatorCommand::LoginFinished { generation, result } => {
                if self.is_current(generation) {
                    self.on_login_finished(result).await;
                }
            }
            CoordinatorCommand::ConnectFinished { generation, result } => {
                if self.is_current(generation) {
                    self.on_connect_finished(result).await;
                }
            }
            CoordinatorCommand::RetryDue {
                generation,
                operation,
            } => {
                if self.is_current(generation) {
                    self.timer = None;
                    self.on_retry_due(operation).await;
                }
            }
        }
    }

    async fn handle_event(&mut self, message: BusMessage) {
        if self.phase == Phase::Stopped {
            return;
        }
        match message.topic.event {
            EventType::RuntimeStarted => self.reconcile().await,
            EventType::LoginStart => self.start_login().await,
            EventType::Ready => {
                self.login_attempt = 0;
                self.set_phase(Phase::Ready);
            }
            EventType::Disconnected => self.on_disconnected(&message.payload),
            _ => {}
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.phase != Phase::Stopped && generation == self.generation
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            info!(account = %self.account, from = %self.phase, to = %phase, "Phase changed");
            self.phase = phase;
        }
    }

    fn publish(&self, event: EventType, payload: Value) {
        self.bus.broadcast(Topic::new(self.account.clone(), event), payload);
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config.login.retry)
    }

    // ---- Reconciliation -----------------------------------------------------

    async fn configure(&mut self, patch: RuntimeConfigPatch) -> PulseResult<()> {
        if self.phase == Phase::Stopped {
            debug!(account = %self.account, "Ignoring configure after stop");
            return Ok(());
        }
        let merged = self.config.merged(&patch);
        merged.validate()?;
        self.config = merged;
        debug!(account = %self.account, config = ?self.config, "Config updated");
        self.reconcile().await;
        Ok(())
    }

    async fn reconcile(&mut self) {
        if self.phase == Phase::Stopped || self.in_flight.is_some() || self.timer_pending() {
            return;
        }

        let session = match self.registry.session_manager(&self.account) {
            Some(manager) => manager.session().await.ok().flatten(),
            None => None,
        };
        let state = match self.registry.transport(&self.account) {
            Some(transport) => transport
                .status()
                .await
                .map(|status| status.state)
                .unwrap_or(ConnectionState::Disconnected),
            None => ConnectionState::Disconnected,
        };

        if state == ConnectionState::Ready {
            self.set_phase(Phase::Ready);
            return;
        }

        match session {
            None if self.phase == Phase::Idle && self.config.auto_login => {
                self.set_phase(Phase::LoggingIn);
                self.publish(EventType::LoginStart, json!({ "explicit": false }));
            }
            Some(session) if self.config.realtime.auto_connect && !state.is_connected() => {
                self.start_connect(session);
            }
            _ => {}
        }
    }

    // ---- Login --------------------------------------------------------------

    async fn start_login(&mut self) {
        if self.in_flight.is_some() {
            debug!(account = %self.account, "Login already in flight");
            return;
        }
        let (Some(manager), Some(cookies)) = (
            self.registry.session_manager(&self.account),
            self.registry.cookie_store(&self.account),
        ) else {
            warn!(account = %self.account, "Cannot log in without session manager and cookie store");
            self.set_phase(Phase::Idle);
            return;
        };

        self.set_phase(Phase::LoggingIn);
        self.in_flight = Some(Operation::Login);
        info!(account = %self.account, attempt = self.login_attempt, "Logging in");

        let generation = self.generation;
        let account = self.account.clone();
        let provider = self.login.clone();
        let self_sender = self.self_sender.clone();
        tokio::spawn(async move {
            let result = match manager.credentials().await {
                Ok(credentials) => provider.login(&account, &credentials, &cookies).await,
                Err(e) => Err(e),
            };
            if let Some(sender) = self_sender.upgrade() {
                let _ = sender
                    .send(CoordinatorCommand::LoginFinished { generation, result })
                    .await;
            }
        });
    }

    async fn on_login_finished(&mut self, result: PulseResult<Session>) {
        self.in_flight = None;
        match result {
            Ok(session) => {
                self.login_attempt = 0;
                info!(account = %self.account, user_id = %session.user_id, "Login succeeded");
                if let Some(manager) = self.registry.session_manager(&self.account) {
                    if let Err(e) = manager.set_session(session).await {
                        warn!(account = %self.account, error = %e, "Failed to store session");
                    }
                }
                self.set_phase(Phase::Idle);
                self.reconcile().await;
            }
            Err(e) => {
                warn!(account = %self.account, error = %e, "Login failed");
                self.publish(EventType::Error, e.to_payload());
                if self.config.login.retry.enabled && e.is_retryable() {
                    let delay = self.delay(self.login_attempt);
                    self.login_attempt = self.login_attempt.saturating_add(1);
                    self.schedule(Operation::Login, delay);
                } else {
                    self.set_phase(Phase::Idle);
                }
            }
        }
    }

    // ---- Connect ------------------------------------------------------------

    fn start_connect(&mut self, session: Session) {
        let Some(transport) = self.registry.transport(&self.account) else {
            warn!(account = %self.account, "Cannot connect without a transport");
            return;
        };
        self.set_phase(Phase::Connecting);
        self.in_flight = Some(Operation::Connect);

        let generation = self.generation;
        let self_sender = self.self_sender.clone();
        tokio::spawn(async move {
            let result = transport.connect(session).await;
            if let Some(sender) = self_sender.upgrade() {
                let _ = sender
                    .send(CoordinatorCommand::ConnectFinished { generation, result })
                    .await;
            }
        });
    }

    async fn on_connect_finished(&mut self, result: PulseResult<ConnectOutcome>) {
        self.in_flight = None;
        let deferred = std::mem::take(&mut self.connect_deferred);
        match result {
            Ok(outcome) => {
                debug!(account = %self.account, outcome = ?outcome, "Connect finished");
                self.reconcile().await;
            }
            Err(e) if e.kind() == ErrorKind::AlreadyConnected => self.reconcile().await,
            Err(e) if deferred => {
                debug!(account = %self.account, error = %e, "Connect failed, running deferred retry");
                self.on_retry_due(Operation::Connect).await;
            }
            Err(e) if !e.is_retryable() && !self.timer_pending() => {
                warn!(account = %self.account, error = %e, "Connect failed");
                self.set_phase(Phase::Idle);
            }
            Err(e) => {
                // A failed dial also publishes `disconnected`, which schedules the retry
                debug!(account = %self.account, error = %e, "Connect failed");
            }
        }
    }

    fn on_disconnected(&mut self, payload: &Value) {
        let retryable = payload
            .get("retryable")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let attempt = payload
            .get("attempt")
            .and_then(Value::as_u64)
            .map_or(1, |attempt| u32::try_from(attempt).unwrap_or(u32::MAX));

        if retryable && self.config.realtime.auto_reconnect {
            let delay = self.delay(attempt.saturating_sub(1));
            self.set_phase(Phase::Connecting);
            self.schedule(Operation::Connect, delay);
        } else {
            self.cancel_timer();
            self.set_phase(Phase::Idle);
        }
    }

    async fn on_retry_due(&mut self, operation: Operation) {
        match operation {
            Operation::Login => self.start_login().await,
            Operation::Connect => {
                match self.in_flight {
                    Some(Operation::Connect) => {
                        debug!(account = %self.account, "Reconnect due while connecting, deferring");
                        self.connect_deferred = true;
                        return;
                    }
                    Some(Operation::Login) => return,
                    None => {}
                }
                let session = match self.registry.session_manager(&self.account) {
                    Some(manager) => manager.session().await.ok().flatten(),
                    None => None,
                };
                match session {
                    Some(session) => self.start_connect(session),
                    None => {
                        self.set_phase(Phase::Idle);
                        self.reconcile().await;
                    }
                }
            }
        }
    }

    // ---- Timers -------------------------------------------------------------

    fn delay(&self, attempt: u32) -> Duration {
        self.policy().delay(attempt, &mut rand::thread_rng())
    }

    fn schedule(&mut self, operation: Operation, delay: Duration) {
        self.cancel_timer();
        info!(
            account = %self.account,
            operation = ?operation,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );
        let generation = self.generation;
        let self_sender = self.self_sender.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(sender) = self_sender.upgrade() {
                let _ = sender
                    .send(CoordinatorCommand::RetryDue {
                        generation,
                        operation,
                    })
                    .await;
            }
        }));
    }

    fn timer_pending(&self) -> bool {
        self.timer.as_ref().is_some_and(|timer| !timer.is_finished())
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn stop(&mut self) {
        if self.phase == Phase::Stopped {
            return;
        }
        self.cancel_timer();
        self.generation = self.generation.wrapping_add(1);
        self.in_flight = None;
        self.connect_deferred = false;
        self.set_phase(Phase::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::login::NoLoginProvider;
    use pulsechat_core::config::RealtimePatch;

    fn context(config: RuntimeConfig) -> CoordinatorContext {
        CoordinatorContext {
            account: AccountId::new("acc1").unwrap(),
            bus: EventBus::new(),
            registry: Registry::new(),
            login: Arc::new(NoLoginProvider),
            config,
            mailbox_size: 8,
        }
    }

    fn manual() -> RuntimeConfig {
        RuntimeConfig {
            auto_login: false,
            ..RuntimeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_fresh_coordinator_is_idle() {
        let (coordinator, _task) = CoordinatorHandle::spawn(context(manual()));
        for _ in 0..3 {
            coordinator.reconcile().await.unwrap();
        }
        assert_eq!(coordinator.phase().await.unwrap(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_configure_merges_deeply() {
        let (coordinator, _task) = CoordinatorHandle::spawn(context(manual()));
        let patch = RuntimeConfigPatch {
            realtime: Some(RealtimePatch {
                auto_connect: Some(false),
                auto_reconnect: None,
            }),
            ..RuntimeConfigPatch::default()
        };
        coordinator.configure(patch).await.unwrap();

        let config = coordinator.status().await.unwrap().config;
        assert!(!config.realtime.auto_connect);
        assert!(config.realtime.auto_reconnect);
        assert!(!config.auto_login);
    }

    #[tokio::test]
    async fn test_stop_is_sticky() {
        let ctx = context(manual());
        let bus = ctx.bus.clone();
        let account = ctx.account.clone();
        let (coordinator, _task) = CoordinatorHandle::spawn(ctx);

        coordinator.stop().await.unwrap();
        bus.broadcast(
            Topic::new(account.clone(), EventType::Disconnected),
            json!({ "retryable": true, "attempt": 1 }),
        );
        bus.broadcast(Topic::new(account, EventType::Ready), json!({}));
        coordinator.configure(RuntimeConfigPatch::default().auto_login(true)).await.unwrap();
        coordinator.login().await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let status = coordinator.status().await.unwrap();
        assert_eq!(status.phase, Phase::Stopped);
        assert!(!status.config.auto_login);
    }

    #[tokio::test]
    async fn test_oversized_attempt_uses_max_delay() {
        let mut config = manual();
        config.login.retry.min_delay_ms = 0;
        config.login.retry.jitter_fraction = 0.0;
        let ctx = context(config);
        let bus = ctx.bus.clone();
        let account = ctx.account.clone();
        let (coordinator, _task) = CoordinatorHandle::spawn(ctx);
        coordinator.reconcile().await.unwrap();

        bus.broadcast(
            Topic::new(account, EventType::Disconnected),
            json!({ "retryable": true, "attempt": u64::from(u32::MAX) + 1 }),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.phase().await.unwrap(), Phase::Connecting);
    }

    #[tokio::test]
    async fn test_invalid_patch_is_rejected() {
        let (coordinator, _task) = CoordinatorHandle::spawn(context(manual()));
        let patch = RuntimeConfigPatch::from_json(&json!({
            "login": { "retry": { "backoff_factor": 0.5 } }
        }))
        .unwrap();
        assert!(coordinator.configure(patch).await.is_err());
        assert_eq!(
            coordinator.status().await.unwrap().config.login.retry.backoff_factor,
            2.0
        );
    }

    #[tokio::test]
    async fn test_login_without_components_returns_to_idle() {
        let (coordinator, _task) = CoordinatorHandle::spawn(context(manual()));
        coordinator.login().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(coordinator.phase().await.unwrap(), Phase::Idle);
    }
}
