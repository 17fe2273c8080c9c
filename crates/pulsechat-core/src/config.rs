//! Runtime configuration
//!
//! [`RuntimeConfig`] is the per-account declarative configuration the
//! coordinator reconciles against; it only ever changes through a deep merge
//! of a [`RuntimeConfigPatch`]. [`RuntimeSettings`] bundles the process-wide
//! knobs for the transport and supervisor and can be loaded from TOML.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

// ----------------------------------------------------------------------------
// Runtime Config
// ----------------------------------------------------------------------------

/// Declarative per-account configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub auto_login: bool,
    pub realtime: RealtimeConfig,
    pub login: LoginConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            auto_login: true,
            realtime: RealtimeConfig::default(),
            login: LoginConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub auto_connect: bool,
    pub auto_reconnect: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            auto_connect: true,
            auto_reconnect: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    pub retry: RetryConfig,
}

/// Backoff used for re-login and reconnect scheduling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_factor: 2.0,
            jitter_fraction: 0.2,
        }
    }
}

impl RuntimeConfig {
    /// Deep merge: only keys present in the patch change
    pub fn merge(&mut self, patch: &RuntimeConfigPatch) {
        if let Some(auto_login) = patch.auto_login {
            self.auto_login = auto_login;
        }
        if let Some(realtime) = &patch.realtime {
            if let Some(v) = realtime.auto_connect {
                self.realtime.auto_connect = v;
            }
            if let Some(v) = realtime.auto_reconnect {
                self.realtime.auto_reconnect = v;
            }
        }
        if let Some(retry) = patch.login.as_ref().and_then(|l| l.retry.as_ref()) {
            let target = &mut self.login.retry;
            if let Some(v) = retry.enabled {
                target.enabled = v;
            }
            if let Some(v) = retry.min_delay_ms {
                target.min_delay_ms = v;
            }
            if let Some(v) = retry.max_delay_ms {
                target.max_delay_ms = v;
            }
            if let Some(v) = retry.backoff_factor {
                target.backoff_factor = v;
            }
            if let Some(v) = retry.jitter_fraction {
                target.jitter_fraction = v;
            }
        }
    }

    /// Copy with the patch applied
    pub fn merged(&self, patch: &RuntimeConfigPatch) -> Self {
        let mut config = self.clone();
        config.merge(patch);
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let retry = &self.login.retry;
        if retry.min_delay_ms > retry.max_delay_ms {
            return Err(invalid("retry min_delay_ms cannot exceed max_delay_ms"));
        }
        if !retry.backoff_factor.is_finite() || retry.backoff_factor < 1.0 {
            return Err(invalid("retry backoff_factor must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&retry.jitter_fraction) {
            return Err(invalid("retry jitter_fraction must be within 0.0..=1.0"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Patch
// ----------------------------------------------------------------------------

/// Partial [`RuntimeConfig`]; every key is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_login: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime: Option<RealtimePatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<LoginPatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_connect: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_reconnect: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_factor: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_fraction: Option<f64>,
}

impl RuntimeConfigPatch {
    /// Parse a patch from JSON; unknown keys are ignored
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value.clone()).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    pub fn auto_login(mut self, value: bool) -> Self {
        self.auto_login = Some(value);
        self
    }

    pub fn auto_connect(mut self, value: bool) -> Self {
        self.realtime.get_or_insert_with(Default::default).auto_connect = Some(value);
        self
    }

    pub fn auto_reconnect(mut self, value: bool) -> Self {
        self.realtime.get_or_insert_with(Default::default).auto_reconnect = Some(value);
        self
    }

    pub fn retry(mut self, retry: RetryPatch) -> Self {
        self.login.get_or_insert_with(Default::default).retry = Some(retry);
        self
    }
}

// ----------------------------------------------------------------------------
// Process Settings
// ----------------------------------------------------------------------------

/// Realtime transport tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub ping_interval_ms: u64,
    /// A connection that stays up this long resets the attempt counter
    pub stable_window_ms: u64,
    /// Mailbox depth for transport commands
    pub command_buffer_size: usize,
    /// Queued bus messages above which a subscriber backlog is logged
    pub inbox_warn_threshold: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            connect_timeout_ms: 15_000,
            ping_interval_ms: 180_000,
            stable_window_ms: 30_000,
            command_buffer_size: 64,
            inbox_warn_threshold: 1_024,
        }
    }
}

impl TransportSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn stable_window(&self) -> Duration {
        Duration::from_millis(self.stable_window_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_ms == 0 {
            return Err(invalid("request timeout cannot be zero"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(invalid("connect timeout cannot be zero"));
        }
        if self.ping_interval_ms == 0 {
            return Err(invalid("ping interval cannot be zero"));
        }
        if self.command_buffer_size == 0 {
            return Err(invalid("command buffer size cannot be zero"));
        }
        Ok(())
    }
}

/// Per-account supervision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Restarts allowed per role after a crash
    pub max_restarts: u32,
    /// Mailbox depth for coordinator, session manager and cookie store
    pub mailbox_size: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            mailbox_size: 32,
        }
    }
}

/// Process-wide settings bundle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub transport: TransportSettings,
    pub supervisor: SupervisorSettings,
    /// Initial config for every newly added account
    pub defaults: RuntimeConfig,
}

impl RuntimeSettings {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Settings with short timings for tests
    pub fn testing() -> Self {
        Self {
            transport: TransportSettings {
                request_timeout_ms: 500,
                connect_timeout_ms: 2_000,
                ping_interval_ms: 60_000,
                stable_window_ms: 1_000,
                ..TransportSettings::default()
            },
            supervisor: SupervisorSettings::default(),
            defaults: RuntimeConfig {
                login: LoginConfig {
                    retry: RetryConfig {
                        min_delay_ms: 20,
                        max_delay_ms: 200,
                        ..RetryConfig::default()
                    },
                },
                ..RuntimeConfig::default()
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport.validate()?;
        if self.supervisor.mailbox_size == 0 {
            return Err(invalid("supervisor mailbox size cannot be zero"));
        }
        self.defaults.validate()
    }
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.to_string(),
    }
}
