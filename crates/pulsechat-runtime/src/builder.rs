//! Runtime Builder API

use std::sync::Arc;

use pulsechat_core::{PulseResult, RuntimeSettings};
use tracing::info;

use crate::bus::EventBus;
use crate::login::{LoginProvider, NoLoginProvider};
use crate::runtime::Runtime;

// ----------------------------------------------------------------------------
// Runtime Builder
// ----------------------------------------------------------------------------

/// Builder for a [`Runtime`]
pub struct RuntimeBuilder {
    settings: RuntimeSettings,
    login: Arc<dyn LoginProvider>,
    bus: Option<EventBus>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            settings: RuntimeSettings::default(),
            login: Arc::new(NoLoginProvider),
            bus: None,
        }
    }

    pub fn with_settings(mut self, settings: RuntimeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Load settings from TOML text
    pub fn with_settings_toml(mut self, text: &str) -> PulseResult<Self> {
        self.settings = RuntimeSettings::from_toml_str(text)?;
        Ok(self)
    }

    pub fn with_login_provider<P: LoginProvider + 'static>(mut self, provider: P) -> Self {
        self.login = Arc::new(provider);
        self
    }

    /// Share an existing bus instead of creating one
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Validate settings and build; must be called inside a tokio runtime
    pub fn build(self) -> PulseResult<Runtime> {
        self.settings.validate()?;
        let bus = self
            .bus
            .unwrap_or_else(|| EventBus::with_warn_threshold(self.settings.transport.inbox_warn_threshold));
        info!(
            max_restarts = self.settings.supervisor.max_restarts,
            "Runtime built"
        );
        Ok(Runtime::new(self.settings, bus, self.login))
    }
}
