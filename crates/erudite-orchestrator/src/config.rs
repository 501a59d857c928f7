//! Configuration types for the Erudite relay.
//!
//! This module provides the configuration structure that controls the
//! relay: which hosted model to call and how long to wait for it, how much
//! of a document enters a prompt, where learning state is persisted, and
//! which browser origins may call the API.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EruditeError, Result};
use crate::prompt::Difficulty;

/// The default config file name.
const CONFIG_FILE_NAME: &str = "erudite.json";

/// Default TCP port for the relay.
const fn default_port() -> u16 {
    3001
}

/// Default hosted model.
fn default_model() -> String {
    "gemini-flash-lite-latest".to_string()
}

/// Default model API base URL.
fn default_api_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

/// Default environment variable holding the model API key.
fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

/// Default model request timeout in seconds.
const fn default_request_timeout_secs() -> u64 {
    60
}

/// Default document excerpt budget in characters.
const fn default_max_document_chars() -> usize {
    8000
}

/// Default number of recent misconceptions included in a prompt.
const fn default_recent_misconceptions() -> usize {
    5
}

/// Default directory for persisted learning state.
fn default_state_dir() -> String {
    ".erudite".to_string()
}

/// Default CORS origin prefix.
fn default_allowed_origin_prefix() -> String {
    "http://localhost".to_string()
}

/// Main configuration for the Erudite relay.
///
/// Every key is optional in `erudite.json`; missing keys take the
/// defaults above.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// TCP port the relay listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Hosted model identifier.
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL of the model API.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Upper bound on a single model call, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum number of document characters that enter a prompt.
    #[serde(default = "default_max_document_chars")]
    pub max_document_chars: usize,

    /// How many of the most recent misconceptions a prompt carries.
    #[serde(default = "default_recent_misconceptions")]
    pub recent_misconceptions: usize,

    /// Difficulty for sessions created without one.
    #[serde(default)]
    pub default_difficulty: Difficulty,

    /// Directory holding persisted learning state.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Browser origins starting with this prefix may call the API.
    #[serde(default = "default_allowed_origin_prefix")]
    pub allowed_origin_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            model: default_model(),
            api_base_url: default_api_base_url(),
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
            max_document_chars: default_max_document_chars(),
            recent_misconceptions: default_recent_misconceptions(),
            default_difficulty: Difficulty::default(),
            state_dir: default_state_dir(),
            allowed_origin_prefix: default_allowed_origin_prefix(),
        }
    }
}

impl Config {
    /// Loads configuration from the current working directory.
    ///
    /// Looks for `erudite.json` in the current directory. If not found,
    /// returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but is invalid.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            EruditeError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_dir(&current_dir)
    }

    /// Loads configuration from `erudite.json` in a specific directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but is invalid.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from_file(&dir.join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from a specific file path.
    ///
    /// A missing file yields the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `EruditeError::ConfigParseError` for unreadable files or
    /// invalid JSON, and `EruditeError::ConfigValidationError` when values
    /// are out of range.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(EruditeError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| EruditeError::config_parse(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `EruditeError::ConfigValidationError` if any check fails.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(EruditeError::config_validation(
                "model must not be empty",
                "Set model to a hosted model name in your erudite.json",
            ));
        }

        if self.request_timeout_secs == 0 {
            return Err(EruditeError::config_validation(
                "requestTimeoutSecs must be greater than 0",
                "Set requestTimeoutSecs to at least 1 in your erudite.json",
            ));
        }

        if self.max_document_chars == 0 {
            return Err(EruditeError::config_validation(
                "maxDocumentChars must be greater than 0",
                "Set maxDocumentChars to at least 1 in your erudite.json",
            ));
        }

        if self.api_key_env.trim().is_empty() {
            return Err(EruditeError::config_validation(
                "apiKeyEnv must not be empty",
                "Name the environment variable that holds the model API key",
            ));
        }

        if self.state_dir.trim().is_empty() {
            return Err(EruditeError::config_validation(
                "stateDir must not be empty",
                "Provide a directory for learning state in your erudite.json (use '.' for current directory)",
            ));
        }

        Ok(())
    }

    /// The model call timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The learning state directory as a path.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        PathBuf::from(&self.state_dir)
    }

    /// Reads the model API key from the configured environment variable.
    ///
    /// # Errors
    ///
    /// Returns `EruditeError::MissingApiKey` when the variable is unset or
    /// blank.
    pub fn api_key(&self) -> Result<String> {
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(EruditeError::missing_api_key(&self.api_key_env)),
        }
    }
}
