//! PulseChat Runtime
//!
//! Per-account client runtime for the PulseChat realtime protocol:
//! - `EventBus`: process-local topic pub/sub
//! - `TransportHandle`: websocket transport with request correlation
//! - `CoordinatorHandle`: phase and config reconciliation per account
//! - `Runtime`: supervised component trees, health and ensure-connected
//!
//! Protocol types, crypto and configuration live in `pulsechat-core`.

pub mod builder;
pub mod bus;
pub mod cookie_store;
pub mod coordinator;
pub mod health;
pub mod login;
pub mod registry;
mod runtime;
pub mod session_manager;
pub mod supervisor;
pub mod transport;

pub use builder::RuntimeBuilder;
pub use bus::{BusMessage, EventBus, Subscriber, SubscriberId};
pub use cookie_store::{CookieJar, CookieStoreHandle};
pub use coordinator::{CoordinatorHandle, CoordinatorStatus, Phase};
pub use health::Health;
pub use login::{LoginProvider, LoginRequest, NoLoginProvider};
pub use registry::{Registry, Role, RoleHandle};
pub use runtime::Runtime;
pub use session_manager::SessionManagerHandle;
pub use transport::{ConnectOutcome, TransportHandle};

// Re-export core types for convenience
pub use pulsechat_core::{
    AccountId, ConnectionState, ConnectionStatus, Credentials, EventType, Frame, PulseError,
    PulseResult, RuntimeConfig, RuntimeConfigPatch, RuntimeSettings, Session, SubType, Topic,
};
