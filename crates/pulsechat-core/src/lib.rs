//! PulseChat Core
//!
//! Protocol building blocks shared by the PulseChat client runtime: the
//! cryptographic envelope, the bus topic model, the realtime frame codec and
//! routing table, the retry policy, account data and configuration.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod crypto;
pub mod errors;
pub mod frame;
pub mod retry;
pub mod topic;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{
    RetryConfig, RuntimeConfig, RuntimeConfigPatch, RuntimeSettings, SupervisorSettings,
    TransportSettings,
};
pub use errors::{
    ConfigError, CredentialsError, EnvelopeError, ErrorCategory, ErrorKind, FrameError,
    PulseError, PulseResult, Result, TopicError,
};
pub use frame::{ControlKind, Frame, FrameHeader, Route};
pub use retry::{AttemptTracker, EndpointRotation, RetryPolicy};
pub use topic::{EventType, SubType, Topic};
pub use types::{AccountId, ConnectionState, ConnectionStatus, Credentials, Session};
