//! Configuration management for voicedesk
//!
//! Every value resolves as env > TOML file > default.

pub mod file;

use std::time::Duration;

use crate::{Error, Result};

/// Default speech model
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";

/// Default prebuilt voice
pub const DEFAULT_VOICE: &str = "Zephyr";

/// Default realtime endpoint
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default recipient for booking and ticket emails
pub const DEFAULT_SUPPORT_EMAIL: &str = "info@riyadah.com.eg";

/// voicedesk configuration
#[derive(Clone)]
pub struct Config {
    /// Remote session settings
    pub live: LiveConfig,

    /// Action notification settings
    pub notifications: NotificationConfig,
}

/// Remote realtime session settings
#[derive(Clone)]
pub struct LiveConfig {
    /// API key (`GEMINI_API_KEY`, falling back to `API_KEY`)
    pub api_key: Option<String>,

    /// Model identifier
    pub model: String,

    /// Prebuilt voice name
    pub voice: String,

    /// WebSocket endpoint
    pub endpoint: String,

    /// Bound on the setup handshake
    pub setup_timeout: Duration,
}

/// Action notification settings
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    /// Recipient of booking and ticket emails
    pub support_email: String,

    /// Spreadsheet webhook; `None` disables posting
    pub webhook_url: Option<String>,

    /// Time between `sending` and `success`
    pub processing_delay: Duration,
}

impl std::fmt::Debug for LiveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("endpoint", &self.endpoint)
            .field("setup_timeout", &self.setup_timeout)
            .finish()
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("live", &self.live)
            .field("notifications", &self.notifications)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_sources(file::VoicedeskConfigFile::default(), |_| None)
    }
}

impl Config {
    /// Load configuration from the environment and the config file
    #[must_use]
    pub fn load() -> Self {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an env lookup
    #[must_use]
    pub fn from_sources(
        fc: file::VoicedeskConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let live = LiveConfig {
            api_key: non_empty("GEMINI_API_KEY")
                .or_else(|| non_empty("API_KEY"))
                .or(fc.live.api_key),
            model: non_empty("VOICEDESK_MODEL")
                .or(fc.live.model)
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            voice: non_empty("VOICEDESK_VOICE")
                .or(fc.live.voice)
                .unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            endpoint: non_empty("VOICEDESK_ENDPOINT")
                .or(fc.live.endpoint)
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            setup_timeout: Duration::from_secs(
                non_empty("VOICEDESK_SETUP_TIMEOUT")
                    .and_then(|s| s.parse().ok())
                    .or(fc.live.setup_timeout_secs)
                    .unwrap_or(15),
            ),
        };

        let notifications = NotificationConfig {
            support_email: non_empty("VOICEDESK_SUPPORT_EMAIL")
                .or(fc.notifications.support_email)
                .unwrap_or_else(|| DEFAULT_SUPPORT_EMAIL.to_string()),
            webhook_url: non_empty("VOICEDESK_WEBHOOK_URL").or(fc.notifications.webhook_url),
            processing_delay: Duration::from_secs(
                non_empty("VOICEDESK_PROCESSING_DELAY")
                    .and_then(|s| s.parse().ok())
                    .or(fc.notifications.processing_delay_secs)
                    .unwrap_or(2),
            ),
        };

        Self {
            live,
            notifications,
        }
    }

    /// API key, or an error naming the variables to set
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no key is configured
    pub fn require_api_key(&self) -> Result<&str> {
        self.live.api_key.as_deref().ok_or_else(|| {
            Error::Config(
                "no API key configured (set GEMINI_API_KEY or live.api_key in config.toml)"
                    .to_string(),
            )
        })
    }
}
