//! TOML configuration file loading
//!
//! Supports `~/.config/voicedesk/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoicedeskConfigFile {
    /// Remote session configuration
    #[serde(default)]
    pub live: LiveFileConfig,

    /// Notification configuration
    #[serde(default)]
    pub notifications: NotificationsFileConfig,
}

/// Remote realtime session configuration
#[derive(Debug, Default, Deserialize)]
pub struct LiveFileConfig {
    /// API key for the speech model
    pub api_key: Option<String>,

    /// Model identifier
    pub model: Option<String>,

    /// Prebuilt voice name (e.g. "Zephyr")
    pub voice: Option<String>,

    /// WebSocket endpoint, without the `key` query parameter
    pub endpoint: Option<String>,

    /// Seconds to wait for `setupComplete`
    pub setup_timeout_secs: Option<u64>,
}

/// Action notification configuration
#[derive(Debug, Default, Deserialize)]
pub struct NotificationsFileConfig {
    /// Recipient of booking and ticket emails
    pub support_email: Option<String>,

    /// Spreadsheet webhook URL
    pub webhook_url: Option<String>,

    /// Seconds before a sending action is marked done
    pub processing_delay_secs: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoicedeskConfigFile::default()` if the file doesn't exist or can't be parsed.
#[must_use]
pub fn load_config_file() -> VoicedeskConfigFile {
    let Some(path) = config_file_path() else {
        return VoicedeskConfigFile::default();
    };

    load_config_file_from(&path)
}

/// Load a config file from an explicit path
#[must_use]
pub fn load_config_file_from(path: &Path) -> VoicedeskConfigFile {
    if !path.exists() {
        return VoicedeskConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoicedeskConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoicedeskConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/voicedesk/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voicedesk").join("config.toml"))
}
