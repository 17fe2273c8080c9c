//! Error types for the PulseChat runtime
//!
//! Leaf errors stay typed so callers can tell corrupt transport data from a bad
//! key from a tampered record. Every component boundary converts them into
//! [`PulseError`], the shape consumers act on: a category, an optional numeric
//! code, a message, the original cause, a retryable flag and free-form details.

use core::fmt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failures of the block-cipher and authenticated envelopes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid key encoding")]
    InvalidKeyEncoding,
    #[error("invalid key size: {len} bytes")]
    InvalidKeySize { len: usize },
    #[error("data too short: {len} bytes (min: {min})")]
    DataTooShort { len: usize, min: usize },
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("invalid ciphertext encoding")]
    InvalidCiphertextEncoding,
    #[error("ciphertext length {len} is not a multiple of the block size")]
    InvalidBlockLength { len: usize },
    #[error("decompression failed")]
    DecompressionFailed,
    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid payload JSON: {reason}")]
    InvalidJson { reason: String },
    #[error("unsupported encryption mode: {mode}")]
    UnsupportedMode { mode: u64 },
    #[error("cipher key not yet received")]
    MissingCipherKey,
    #[error("key derivation failed")]
    KeyDerivationFailed,
}

/// Failures when building or parsing bus topics
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("malformed topic: {topic}")]
    Malformed { topic: String },
    #[error("unknown namespace: {namespace}")]
    UnknownNamespace { namespace: String },
    #[error("unknown event type: {value}")]
    UnknownEventType { value: String },
    #[error("unknown sub-type: {value}")]
    UnknownSubType { value: String },
    #[error("invalid account id: {value:?}")]
    InvalidAccountId { value: String },
}

/// Failures decoding realtime frames
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short: {len} bytes (header is {header} bytes)")]
    TooShort { len: usize, header: usize },
    #[error("frame body is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid frame body: {reason}")]
    InvalidBody { reason: String },
}

/// Failures validating account credentials
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialsError {
    #[error("missing required credential field: {field}")]
    MissingField { field: &'static str },
    #[error("invalid credential field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Failures loading or validating configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
    #[error("failed to parse configuration: {reason}")]
    Parse { reason: String },
}

// ----------------------------------------------------------------------------
// Boundary Error
// ----------------------------------------------------------------------------

/// Broad classification shared by every boundary error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Api,
    Crypto,
    Auth,
    Websocket,
    Unknown,
}

impl ErrorCategory {
    /// Default retryability for the category, optionally refined by a numeric code
    pub fn default_retryable(self, code: Option<i64>) -> bool {
        match self {
            ErrorCategory::Network | ErrorCategory::Websocket => true,
            ErrorCategory::Api => matches!(code, Some(429) | Some(500..=599)),
            ErrorCategory::Crypto | ErrorCategory::Auth | ErrorCategory::Unknown => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Api => "api",
            ErrorCategory::Crypto => "crypto",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Websocket => "websocket",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finer-grained outcome callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    General,
    Timeout,
    AlreadyConnected,
    NotConnected,
    Closed,
    NotFound,
    InvalidInput,
}

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error produced and consumed at every component boundary
pub struct PulseError {
    category: ErrorCategory,
    kind: ErrorKind,
    code: Option<i64>,
    message: String,
    cause: Option<Cause>,
    retryable: bool,
    details: Map<String, Value>,
}

impl PulseError {
    /// Create an error with the category's default retryability
    pub fn new<M: Into<String>>(category: ErrorCategory, message: M) -> Self {
        Self {
            category,
            kind: ErrorKind::General,
            code: None,
            message: message.into(),
            cause: None,
            retryable: category.default_retryable(None),
            details: Map::new(),
        }
    }

    pub fn network<M: Into<String>>(message: M) -> Self {
        Self::new(ErrorCategory::Network, message)
    }

    pub fn websocket<M: Into<String>>(message: M) -> Self {
        Self::new(ErrorCategory::Websocket, message)
    }

    pub fn crypto<M: Into<String>>(message: M) -> Self {
        Self::new(ErrorCategory::Crypto, message)
    }

    pub fn auth<M: Into<String>>(message: M) -> Self {
        Self::new(ErrorCategory::Auth, message)
    }

    pub fn unknown<M: Into<String>>(message: M) -> Self {
        Self::new(ErrorCategory::Unknown, message)
    }

    /// Create an API error; 429 and 5xx are retryable, 401/403 require re-authentication
    pub fn api<M: Into<String>>(code: i64, message: M) -> Self {
        Self::new(ErrorCategory::Api, message).with_code(code)
    }

    /// A bounded wait expired
    pub fn timeout<M: Into<String>>(operation: M, waited_ms: u64) -> Self {
        let operation = operation.into();
        Self::network(format!("{operation} timed out after {waited_ms}ms"))
            .with_kind(ErrorKind::Timeout)
            .with_detail("operation", Value::String(operation))
            .with_detail("timeout_ms", json!(waited_ms))
    }

    pub fn already_connected<M: Into<String>>(endpoint: M) -> Self {
        let endpoint = endpoint.into();
        Self::websocket(format!("already connected to {endpoint}"))
            .with_kind(ErrorKind::AlreadyConnected)
            .with_retryable(false)
            .with_detail("endpoint", Value::String(endpoint))
    }

    pub fn not_connected() -> Self {
        Self::websocket("realtime channel is not connected").with_kind(ErrorKind::NotConnected)
    }

    /// The receiving actor or channel has gone away
    pub fn closed<M: Into<String>>(what: M) -> Self {
        Self::unknown(format!("{} is closed", what.into())).with_kind(ErrorKind::Closed)
    }

    pub fn not_found<M: Into<String>>(what: M) -> Self {
        Self::unknown(format!("{} not found", what.into())).with_kind(ErrorKind::NotFound)
    }

    pub fn invalid_input<M: Into<String>>(message: M) -> Self {
        Self::unknown(message).with_kind(ErrorKind::InvalidInput)
    }

    /// Attach a numeric code and recompute the default retryability
    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self.retryable = self.category.default_retryable(self.code);
        self
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_detail<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> Option<i64> {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &Map<String, Value> {
        &self.details
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    /// Re-login is required before the operation can succeed
    pub fn requires_reauth(&self) -> bool {
        self.category == ErrorCategory::Auth
            || (self.category == ErrorCategory::Api && matches!(self.code, Some(401) | Some(403)))
    }

    /// JSON form published on the event bus under `error` topics
    pub fn to_payload(&self) -> Value {
        json!({
            "category": self.category,
            "code": self.code,
            "message": self.message,
            "retryable": self.retryable,
            "details": Value::Object(self.details.clone()),
        })
    }
}

impl fmt::Debug for PulseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PulseError")
            .field("category", &self.category)
            .field("kind", &self.kind)
            .field("code", &self.code)
            .field("message", &self.message)
            .field("retryable", &self.retryable)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl fmt::Display for PulseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} error ({}): {}", self.category, code, self.message),
            None => write!(f, "{} error: {}", self.category, self.message),
        }
    }
}

impl std::error::Error for PulseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ----------------------------------------------------------------------------
// Conversions
// ----------------------------------------------------------------------------

impl From<EnvelopeError> for PulseError {
    fn from(err: EnvelopeError) -> Self {
        PulseError::crypto(err.to_string()).with_cause(err)
    }
}

impl From<TopicError> for PulseError {
    fn from(err: TopicError) -> Self {
        PulseError::invalid_input(err.to_string()).with_cause(err)
    }
}

impl From<FrameError> for PulseError {
    fn from(err: FrameError) -> Self {
        PulseError::websocket(err.to_string())
            .with_retryable(false)
            .with_cause(err)
    }
}

impl From<CredentialsError> for PulseError {
    fn from(err: CredentialsError) -> Self {
        PulseError::invalid_input(err.to_string()).with_cause(err)
    }
}

impl From<ConfigError> for PulseError {
    fn from(err: ConfigError) -> Self {
        PulseError::invalid_input(err.to_string()).with_cause(err)
    }
}

impl From<serde_json::Error> for PulseError {
    fn from(err: serde_json::Error) -> Self {
        PulseError::unknown(format!("JSON error: {err}")).with_cause(err)
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, PulseError>;
pub type PulseResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retryability_by_category() {
        assert!(PulseError::network("reset").is_retryable());
        assert!(PulseError::websocket("closed").is_retryable());
        assert!(!PulseError::crypto("bad tag").is_retryable());
        assert!(!PulseError::auth("expired").is_retryable());
        assert!(!PulseError::unknown("?").is_retryable());
    }

    #[test]
    fn test_api_retryability_depends_on_code() {
        assert!(PulseError::api(429, "slow down").is_retryable());
        assert!(PulseError::api(503, "unavailable").is_retryable());
        assert!(!PulseError::api(401, "unauthorized").is_retryable());
        assert!(!PulseError::api(403, "forbidden").is_retryable());
        assert!(PulseError::api(401, "unauthorized").requires_reauth());
    }

    #[test]
    fn test_envelope_error_maps_to_crypto() {
        let err: PulseError = EnvelopeError::DecryptionFailed.into();
        assert_eq!(err.category(), ErrorCategory::Crypto);
        assert!(!err.is_retryable());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_timeout_payload() {
        let err = PulseError::timeout("old_messages", 10_000);
        assert!(err.is_timeout());
        let payload = err.to_payload();
        assert_eq!(payload["category"], "network");
        assert_eq!(payload["details"]["timeout_ms"], 10_000);
    }
}
