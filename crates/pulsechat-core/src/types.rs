//! Core types for the PulseChat client runtime
//!
//! Account identifiers, immutable credentials, the authenticated session and
//! the realtime connection status.

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{CredentialsError, TopicError};

// ----------------------------------------------------------------------------
// Account Identifier
// ----------------------------------------------------------------------------

/// Identifier of a registered account
///
/// Non-empty, without `:` or whitespace, so it can sit inside a topic string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    pub fn new<S: Into<String>>(value: S) -> Result<Self, TopicError> {
        let value = value.into();
        if value.is_empty() || value.contains(':') || value.chars().any(char::is_whitespace) {
            return Err(TopicError::InvalidAccountId { value });
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AccountId {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for AccountId {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AccountId> for String {
    fn from(id: AccountId) -> Self {
        id.0
    }
}

impl AsRef<str> for AccountId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Credentials
// ----------------------------------------------------------------------------

pub const DEFAULT_API_TYPE: u32 = 30;
pub const DEFAULT_API_VERSION: u32 = 665;
pub const DEFAULT_LANGUAGE: &str = "vi";

/// Immutable account identity supplied at account-add time
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    device_id: String,
    cookie: String,
    user_agent: String,
    api_type: u32,
    api_version: u32,
    language: String,
}

impl Credentials {
    pub fn builder() -> CredentialsBuilder {
        CredentialsBuilder::default()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn api_type(&self) -> u32 {
        self.api_type
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    pub fn language(&self) -> &str {
        &self.language
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("device_id", &self.device_id)
            .field("cookie", &"<redacted>")
            .field("user_agent", &self.user_agent)
            .field("api_type", &self.api_type)
            .field("api_version", &self.api_version)
            .field("language", &self.language)
            .finish()
    }
}

/// Validating builder for [`Credentials`]
#[derive(Debug, Default, Clone)]
pub struct CredentialsBuilder {
    device_id: Option<String>,
    cookie: Option<String>,
    user_agent: Option<String>,
    api_type: Option<u32>,
    api_version: Option<u32>,
    language: Option<String>,
}

impl CredentialsBuilder {
    pub fn device_id<S: Into<String>>(mut self, value: S) -> Self {
        self.device_id = Some(value.into());
        self
    }

    /// Cookie blob: either a `Cookie` header string or a JSON cookie jar export
    pub fn cookie<S: Into<String>>(mut self, value: S) -> Self {
        self.cookie = Some(value.into());
        self
    }

    pub fn user_agent<S: Into<String>>(mut self, value: S) -> Self {
        self.user_agent = Some(value.into());
        self
    }

    pub fn api_type(mut self, value: u32) -> Self {
        self.api_type = Some(value);
        self
    }

    pub fn api_version(mut self, value: u32) -> Self {
        self.api_version = Some(value);
        self
    }

    pub fn language<S: Into<String>>(mut self, value: S) -> Self {
        self.language = Some(value.into());
        self
    }

    pub fn build(self) -> Result<Credentials, CredentialsError> {
        let device_id = required("device_id", self.device_id)?;
        let cookie = required("cookie", self.cookie)?;
        let user_agent = required("user_agent", self.user_agent)?;

        let language = self.language.unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());
        if language.trim().is_empty() {
            return Err(CredentialsError::InvalidField {
                field: "language",
                reason: "must not be blank".into(),
            });
        }

        Ok(Credentials {
            device_id,
            cookie,
            user_agent,
            api_type: self.api_type.unwrap_or(DEFAULT_API_TYPE),
            api_version: self.api_version.unwrap_or(DEFAULT_API_VERSION),
            language,
        })
    }
}

fn required(field: &'static str, value: Option<String>) -> Result<String, CredentialsError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(CredentialsError::MissingField { field }),
    }
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

/// Authenticated context produced by a successful login
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    /// Base64 key for the HTTP block-cipher envelope
    pub secret_key: String,
    /// Service name to ordered base URLs
    pub service_urls: BTreeMap<String, Vec<String>>,
    /// Candidate realtime endpoints, tried in order
    pub ws_endpoints: Vec<String>,
    pub api_type: u32,
    pub api_version: u32,
    pub settings: Value,
    pub login_info: Value,
    pub extra_ver: Value,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("secret_key", &"<redacted>")
            .field("service_urls", &self.service_urls)
            .field("ws_endpoints", &self.ws_endpoints)
            .field("api_type", &self.api_type)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// First base URL registered for a service
    pub fn service_url(&self, service: &str) -> Option<&str> {
        self.service_urls
            .get(service)
            .and_then(|urls| urls.first())
            .map(String::as_str)
    }

    /// Export as a plain key/value map; the secret key is only kept on request
    pub fn to_map(&self, include_secret: bool) -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        map.insert("user_id".into(), Value::String(self.user_id.clone()));
        if include_secret {
            map.insert("secret_key".into(), Value::String(self.secret_key.clone()));
        }
        let urls: Map<String, Value> = self
            .service_urls
            .iter()
            .map(|(service, urls)| {
                let list = urls.iter().cloned().map(Value::String).collect();
                (service.clone(), Value::Array(list))
            })
            .collect();
        map.insert("service_urls".into(), Value::Object(urls));
        map.insert(
            "ws_endpoints".into(),
            Value::Array(self.ws_endpoints.iter().cloned().map(Value::String).collect()),
        );
        map.insert("api_type".into(), Value::from(self.api_type));
        map.insert("api_version".into(), Value::from(self.api_version));
        map.insert("settings".into(), self.settings.clone());
        map.insert("login_info".into(), self.login_info.clone());
        map.insert("extra_ver".into(), self.extra_ver.clone());
        map
    }

    /// Rebuild a session from [`Session::to_map`] output
    ///
    /// A map without a secret key yields a session whose secret key is empty.
    pub fn from_map(map: &BTreeMap<String, Value>) -> Result<Self, CredentialsError> {
        let user_id = match map.get("user_id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(CredentialsError::MissingField { field: "user_id" }),
        };
        let secret_key = match map.get("secret_key") {
            Some(Value::String(s)) => s.clone(),
            None | Some(Value::Null) => String::new(),
            Some(_) => {
                return Err(CredentialsError::InvalidField {
                    field: "secret_key",
                    reason: "expected a string".into(),
                })
            }
        };

        let service_urls = match map.get("service_urls") {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                CredentialsError::InvalidField {
                    field: "service_urls",
                    reason: e.to_string(),
                }
            })?,
            None => BTreeMap::new(),
        };
        let ws_endpoints = match map.get("ws_endpoints") {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                CredentialsError::InvalidField {
                    field: "ws_endpoints",
                    reason: e.to_string(),
                }
            })?,
            None => Vec::new(),
        };

        Ok(Self {
            user_id,
            secret_key,
            service_urls,
            ws_endpoints,
            api_type: read_u32(map, "api_type", DEFAULT_API_TYPE)?,
            api_version: read_u32(map, "api_version", DEFAULT_API_VERSION)?,
            settings: map.get("settings").cloned().unwrap_or(Value::Null),
            login_info: map.get("login_info").cloned().unwrap_or(Value::Null),
            extra_ver: map.get("extra_ver").cloned().unwrap_or(Value::Null),
        })
    }
}

fn read_u32(
    map: &BTreeMap<String, Value>,
    field: &'static str,
    default: u32,
) -> Result<u32, CredentialsError> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| CredentialsError::InvalidField {
                field,
                reason: format!("expected an unsigned integer, got {value}"),
            }),
    }
}

// ----------------------------------------------------------------------------
// Connection Status
// ----------------------------------------------------------------------------

/// Realtime connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected and holding a cipher key
    Ready,
}

impl ConnectionState {
    /// Connected or ready
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Snapshot of the realtime connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub endpoint: Option<String>,
    pub attempt: u32,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            endpoint: None,
            attempt: 0,
        }
    }
}
