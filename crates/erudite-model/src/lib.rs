//! Erudite Model Client
//!
//! Hosted language-model access for the Erudite relay.
//!
//! This crate defines the [`LanguageModel`] trait consumed by the session
//! orchestrator and the HTTP relay, plus a [`GeminiClient`] implementation
//! that talks to the Gemini `generateContent` REST endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod gemini;

pub use gemini::{GeminiClient, GeminiConfig};

/// Errors returned by a language model call.
#[derive(Debug, Error)]
pub enum ModelError {
    /// HTTP transport failure (connection refused, DNS, TLS, client timeout).
    #[error("model request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The upstream API answered with a non-success status.
    #[error("model API returned status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Sanitized response body.
        body: String,
    },

    /// The upstream API answered 2xx but the body was not usable.
    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    /// The client cannot be built from the given settings.
    #[error("invalid model configuration: {0}")]
    Configuration(String),
}

/// Coarse classification of a [`ModelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelErrorKind {
    /// Invalid or missing credentials.
    Authentication,
    /// Quota or rate limit exceeded.
    RateLimit,
    /// Upstream 5xx.
    Server,
    /// Connectivity problem between the relay and the API.
    Network,
    /// The call did not finish in time.
    Timeout,
    /// Anything else, including unparseable output.
    Other,
}

impl std::fmt::Display for ModelErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Server => write!(f, "server"),
            Self::Network => write!(f, "network"),
            Self::Timeout => write!(f, "timeout"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl ModelErrorKind {
    /// Maps an HTTP status code to an error kind.
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Authentication,
            429 => Self::RateLimit,
            500..=599 => Self::Server,
            _ => Self::Other,
        }
    }

    /// Returns a suggestion message for this error kind.
    #[must_use]
    pub const fn suggestion(&self) -> &'static str {
        match self {
            Self::Authentication => "Check the model API key configured for the relay",
            Self::RateLimit => "Wait a moment and try again",
            Self::Server => "Try again later; the model service may be having issues",
            Self::Network => "Check the relay's network connection",
            Self::Timeout => "Try again; the model took too long to answer",
            Self::Other => "Try again or rephrase the request",
        }
    }
}

impl ModelError {
    /// Classifies this error.
    #[must_use]
    pub fn kind(&self) -> ModelErrorKind {
        match self {
            Self::Transport(e) if e.is_timeout() => ModelErrorKind::Timeout,
            Self::Transport(_) => ModelErrorKind::Network,
            Self::HttpStatus { status, .. } => ModelErrorKind::from_status(*status),
            Self::MalformedResponse(_) | Self::Configuration(_) => ModelErrorKind::Other,
        }
    }
}

/// Speaker of a prior conversation turn replayed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    /// The learner.
    User,
    /// The model itself.
    Model,
}

/// A prior conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Who spoke.
    pub role: TurnRole,
    /// What was said.
    pub text: String,
}

impl Turn {
    /// Creates a learner turn.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
        }
    }

    /// Creates a model turn.
    #[must_use]
    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Model,
            text: text.into(),
        }
    }
}

/// One request to a language model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerateRequest {
    /// System instruction applied to the whole exchange.
    pub system: Option<String>,
    /// Prior turns, oldest first.
    pub history: Vec<Turn>,
    /// The new user prompt.
    pub prompt: String,
}

impl GenerateRequest {
    /// Creates a stateless request with only a prompt.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            history: Vec::new(),
            prompt: prompt.into(),
        }
    }

    /// Sets the system instruction.
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Sets the replayed history.
    #[must_use]
    pub fn with_history(mut self, history: Vec<Turn>) -> Self {
        self.history = history;
        self
    }
}

/// Text produced by a language model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    /// Generated text.
    pub text: String,
    /// Identifier of the model that produced it.
    pub model: String,
}

/// A hosted language model.
///
/// Implementations must be `Send + Sync` so a single client can be shared
/// by every request handler.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generates a reply for the request.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError`] on transport, status, or parse failure.
    async fn generate(&self, request: GenerateRequest) -> Result<Generation, ModelError>;

    /// The model identifier this client is bound to.
    fn model_id(&self) -> &str;
}
