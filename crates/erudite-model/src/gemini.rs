//! Gemini `generateContent` client.
//!
//! Posts a system instruction, replayed history and the new prompt to
//! `{base}/v1beta/models/{model}:generateContent` and returns the text of
//! the first candidate.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{GenerateRequest, Generation, LanguageModel, ModelError, TurnRole};

/// Upstream error bodies longer than this are cut before logging.
const MAX_ERROR_BODY_CHARS: usize = 256;

static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"AIza[0-9A-Za-z_\-]{20,}",
        r"sk-[A-Za-z0-9_\-]{20,}",
        r"ya29\.[0-9A-Za-z_\-]+",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

// ============================================================================
// Wire types
// ============================================================================

/// Request body for `generateContent`.
#[doc(hidden)]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiRequest {
    /// Optional system instruction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiContent>,
    /// History followed by the new prompt.
    pub contents: Vec<GeminiContent>,
}

/// A content block (one turn).
#[doc(hidden)]
#[derive(Debug, Serialize, Deserialize)]
pub struct GeminiContent {
    /// `user` or `model`; absent on system instructions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Text parts.
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

/// A single text part.
#[doc(hidden)]
#[derive(Debug, Serialize, Deserialize)]
pub struct GeminiPart {
    /// Part text; non-text parts deserialize with `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Response body for `generateContent`.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiResponse {
    /// Generated candidates.
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
    /// Concrete model version that served the call.
    #[serde(default)]
    pub model_version: Option<String>,
}

/// One generated candidate.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiCandidate {
    /// Candidate content; missing when generation was blocked.
    #[serde(default)]
    pub content: Option<GeminiContent>,
    /// Why generation stopped.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

fn text_content(role: Option<&str>, text: &str) -> GeminiContent {
    GeminiContent {
        role: role.map(str::to_string),
        parts: vec![GeminiPart {
            text: Some(text.to_string()),
        }],
    }
}

/// Builds the wire request from a [`GenerateRequest`].
#[doc(hidden)]
#[must_use]
pub fn build_request(request: &GenerateRequest) -> GeminiRequest {
    let mut contents: Vec<GeminiContent> = request
        .history
        .iter()
        .map(|turn| {
            let role = match turn.role {
                TurnRole::User => "user",
                TurnRole::Model => "model",
            };
            text_content(Some(role), &turn.text)
        })
        .collect();
    contents.push(text_content(Some("user"), &request.prompt));

    GeminiRequest {
        system_instruction: request
            .system
            .as_deref()
            .map(|system| text_content(None, system)),
        contents,
    }
}

/// Extracts the reply text from a response body.
///
/// # Errors
///
/// Returns [`ModelError::MalformedResponse`] if the body is not valid JSON
/// or contains no text in its first candidate.
#[doc(hidden)]
pub fn parse_response(body: &str) -> Result<(String, Option<String>), ModelError> {
    let response: GeminiResponse =
        serde_json::from_str(body).map_err(|e| ModelError::MalformedResponse(e.to_string()))?;

    let Some(candidate) = response.candidates.into_iter().next() else {
        return Err(ModelError::MalformedResponse(
            "response contained no candidates".to_string(),
        ));
    };

    let text: String = candidate
        .content
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect()
        })
        .unwrap_or_default();

    if text.is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "unknown".into());
        return Err(ModelError::MalformedResponse(format!(
            "candidate contained no text (finish reason: {reason})"
        )));
    }

    Ok((text, response.model_version))
}

/// Collapses whitespace, redacts credentials and caps the length of an
/// upstream error body.
#[doc(hidden)]
#[must_use]
pub fn sanitize_error_body(raw: &str) -> String {
    let mut sanitized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    for pattern in SECRET_PATTERNS.iter() {
        sanitized = pattern.replace_all(&sanitized, "[REDACTED]").into_owned();
    }

    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened: String = sanitized.chars().take(MAX_ERROR_BODY_CHARS).collect();
        return format!("{shortened}...[truncated]");
    }
    sanitized
}

// ============================================================================
// Client
// ============================================================================

/// Settings for a [`GeminiClient`].
#[derive(Clone)]
pub struct GeminiConfig {
    /// Scheme and host of the API, without a trailing path.
    pub api_base_url: String,
    /// Model name, with or without a `models/` prefix.
    pub model: String,
    /// API key sent in the `x-goog-api-key` header.
    pub api_key: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_base_url", &self.api_base_url)
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Gemini REST client.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    config: GeminiConfig,
    model_name: String,
    endpoint: String,
    client: reqwest::Client,
}

impl GeminiClient {
    /// Creates a client from the given settings.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Configuration`] if the model name or API key is
    /// empty, or [`ModelError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: GeminiConfig) -> Result<Self, ModelError> {
        let model_name = config
            .model
            .trim()
            .trim_start_matches("models/")
            .to_string();
        if model_name.is_empty() {
            return Err(ModelError::Configuration(
                "model name must not be empty".to_string(),
            ));
        }
        if config.api_key.trim().is_empty() {
            return Err(ModelError::Configuration(
                "API key must not be empty".to_string(),
            ));
        }

        let endpoint = format!(
            "{}/v1beta/models/{model_name}:generateContent",
            config.api_base_url.trim_end_matches('/')
        );
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            config,
            model_name,
            endpoint,
            client,
        })
    }

    /// The full `generateContent` URL this client posts to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn generate(&self, request: GenerateRequest) -> Result<Generation, ModelError> {
        let body = build_request(&request);
        debug!(
            model = %self.model_name,
            history_len = request.history.len(),
            prompt_len = request.prompt.len(),
            "Calling generateContent"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let payload = response.text().await?;
        if !status.is_success() {
            let body = sanitize_error_body(&payload);
            warn!(status = status.as_u16(), body = %body, "Model API returned an error");
            return Err(ModelError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let (text, model_version) = parse_response(&payload)?;
        Ok(Generation {
            text,
            model: model_version.unwrap_or_else(|| self.model_name.clone()),
        })
    }

    fn model_id(&self) -> &str {
        &self.model_name
    }
}
