//! HTTP API endpoints for the Erudite relay.
//!
//! # Endpoints
//!
//! Stateless relay:
//! - `GET /api/health` - Liveness check
//! - `POST /api/chat` - Single question to the tutor persona
//! - `POST /api/chat/context` - Question grounded in supplied study material
//! - `POST /api/concept-map` - Concept map extracted from a document
//! - `POST /api/study-plan` - Markdown study plan
//! - `POST /api/revision-sheet` - Markdown revision sheet
//!
//! Sessions:
//! - `POST /api/sessions` - Create a session
//! - `GET /api/sessions/:id` - Session status and transcript
//! - `DELETE /api/sessions/:id` - Close a session
//! - `POST /api/sessions/:id/turns` - Send a learner message
//! - `POST /api/sessions/:id/difficulty` - Change difficulty
//! - `POST /api/sessions/:id/document` - Replace the document (text or pages)
//! - `POST /api/sessions/:id/clear` - Drop the transcript
//! - `POST /api/sessions/:id/archive` - Archive the transcript
//!
//! Learning state:
//! - `GET /api/learning/:user_id` - Learning state
//! - `POST /api/learning/:user_id/misconceptions` - Record a misconception
//! - `POST /api/learning/:user_id/mastered` - Mark a concept mastered
//! - `POST /api/learning/:user_id/weak` - Flag a weak concept
//! - `POST /api/learning/:user_id/study-sessions` - Log study time
//! - `GET /api/learning/:user_id/weekly` - Trailing 7-day study minutes
//! - `GET /api/learning/:user_id/chats` - Archived chats, newest first
//!
//! Auth helpers:
//! - `POST /api/auth/validate-registration` - Local registration checks
//! - `POST /api/auth/error-message` - Provider code to learner text
//!
//! Every failure body is `{"error": ..., "details"?: ...}`.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use erudite_model::{GenerateRequest, Generation, LanguageModel};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::auth::{auth_error_message, validate_registration};
use crate::concept_map::{parse_concept_map, ConceptMap, ConceptMapOutcome};
use crate::document::{Document, MAX_DOCUMENT_SIZE};
use crate::error::EruditeError;
use crate::learning::{ChatRecord, DailyStudy, LearningState, LearningStore, Misconception, UserId};
use crate::prompt::{
    concept_map_prompt, context_chat_instruction, revision_sheet_prompt, study_plan_prompt,
    Difficulty, PromptComposer, TUTOR_PERSONA,
};
use crate::session::{
    generate_with_timeout, Message, Session, SessionId, SessionRegistry, SessionStatus,
    SessionView, Tutor,
};
use crate::Config;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Response body for `GET /api/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"`.
    pub status: String,
    /// Human-readable status.
    pub message: String,
    /// Server time.
    pub timestamp: DateTime<Utc>,
}

/// Request body for `POST /api/chat`.
///
/// `message` is validated by hand so that missing and mistyped values get
/// the documented error text.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    /// The learner's question.
    #[serde(default)]
    pub message: Option<Value>,
}

/// Response body for `POST /api/chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Model reply.
    pub reply: String,
    /// Model that produced it.
    pub model: String,
}

/// Request body for `POST /api/chat/context`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContextChatRequest {
    /// The learner's question.
    #[serde(default)]
    pub message: Option<Value>,
    /// Study material to ground the answer in.
    #[serde(default)]
    pub context: Option<String>,
    /// Requested difficulty; unknown values fall back to beginner.
    #[serde(default)]
    pub difficulty: Option<Difficulty>,
}

/// Response body for `POST /api/chat/context`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyResponse {
    /// Model reply.
    pub reply: String,
}

/// Request body for the document-analysis endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRequest {
    /// Extracted document text.
    #[serde(default)]
    pub content: Option<String>,
    /// Concepts the learner struggles with.
    #[serde(default)]
    pub weak_concepts: Vec<String>,
}

/// Response body for `POST /api/study-plan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyPlanResponse {
    /// Markdown study plan.
    pub study_plan: String,
}

/// Response body for `POST /api/revision-sheet`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionSheetResponse {
    /// Markdown revision sheet.
    pub revision_sheet: String,
}

/// Request body for `POST /api/sessions`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Learner to bind the session to.
    #[serde(default)]
    pub user_id: Option<UserId>,
    /// Initial document text.
    #[serde(default)]
    pub document_content: Option<String>,
    /// Initial difficulty.
    #[serde(default)]
    pub difficulty: Option<Difficulty>,
}

/// Request body for `POST /api/sessions/:id/turns`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TurnRequest {
    /// The learner's message.
    #[serde(default)]
    pub message: Option<Value>,
}

/// Response body for `POST /api/sessions/:id/turns`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    /// Assistant reply.
    pub reply: String,
    /// Session status after the turn.
    pub status: SessionStatus,
    /// Full transcript.
    pub messages: Vec<Message>,
}

/// Request body for `POST /api/sessions/:id/difficulty`.
#[derive(Debug, Clone, Deserialize)]
pub struct DifficultyRequest {
    /// New difficulty.
    pub difficulty: Difficulty,
}

/// Body limit for document uploads: the text cap plus room for JSON escaping.
#[allow(clippy::cast_possible_truncation)]
const DOCUMENT_BODY_LIMIT: usize = 2 * MAX_DOCUMENT_SIZE as usize;

/// File name recorded for uploads that don't name one.
const DEFAULT_DOCUMENT_NAME: &str = "document";

/// Request body for `POST /api/sessions/:id/document`.
///
/// Either already-joined `content` or the extractor's `pages`; pages win
/// when both are present.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRequest {
    /// New document text; empty unloads the document.
    #[serde(default)]
    pub content: Option<String>,
    /// Per-page extracted text.
    #[serde(default)]
    pub pages: Option<Vec<String>>,
    /// Original file name.
    #[serde(default)]
    pub file_name: Option<String>,
}

impl DocumentRequest {
    fn into_document(self) -> Result<Document, ApiError> {
        let file_name = self
            .file_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DOCUMENT_NAME.to_string());
        let document = match (self.pages, self.content) {
            (Some(pages), _) => Document::from_pages(&file_name, &pages)?,
            (None, Some(content)) => Document::from_text(&file_name, content)?,
            (None, None) => return Err(ApiError::bad_request("Document content is required")),
        };
        Ok(document)
    }
}

/// Request body for `POST /api/sessions/:id/archive`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRequest {
    /// Title of the studied document.
    #[serde(default)]
    pub document_title: Option<String>,
}

/// Request body for `POST /api/learning/:user_id/misconceptions`.
#[derive(Debug, Clone, Deserialize)]
pub struct MisconceptionRequest {
    /// What the learner believed.
    pub concept: String,
    /// The correct understanding.
    pub correction: String,
}

/// Request body for the mastered/weak concept endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ConceptRequest {
    /// The concept.
    pub concept: String,
}

/// Request body for `POST /api/learning/:user_id/study-sessions`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudySessionRequest {
    /// Minutes studied; must be positive.
    pub duration_minutes: i64,
    /// What was studied.
    #[serde(default)]
    pub topic: Option<String>,
}

/// Request body for `POST /api/auth/validate-registration`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    /// Chosen password.
    pub password: String,
    /// Confirmation.
    pub confirm_password: String,
}

/// Response body for `POST /api/auth/validate-registration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResponse {
    /// Always `true`; failures are 400s.
    pub valid: bool,
}

/// Request body for `POST /api/auth/error-message`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthCodeRequest {
    /// Provider error code, e.g. `auth/wrong-password`.
    pub code: String,
}

/// Response body for `POST /api/auth/error-message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthMessageResponse {
    /// Learner-facing text.
    pub message: String,
}

/// Error response body returned on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Description of the error.
    pub error: String,
    /// Extra detail, when there is any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for the HTTP server.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Relay configuration.
    pub config: Config,
    /// Runs session turns and owns the model client.
    pub tutor: Arc<Tutor>,
    /// Live sessions.
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    /// Creates application state from a config, a model client and a
    /// learning store.
    #[must_use]
    pub fn new(
        config: Config,
        model: Arc<dyn LanguageModel>,
        learning: Arc<LearningStore>,
    ) -> Self {
        let composer = PromptComposer::new(
            crate::prompt::TEACHING_POLICY,
            config.max_document_chars,
        );
        let tutor = Tutor::new(model, composer, learning, config.request_timeout());
        Self {
            config,
            tutor: Arc::new(tutor),
            sessions: Arc::new(SessionRegistry::new()),
        }
    }

    /// The learning store.
    #[must_use]
    pub fn learning(&self) -> &Arc<LearningStore> {
        self.tutor.learning()
    }

    fn max_document_chars(&self) -> usize {
        self.tutor.composer().max_document_chars()
    }

    async fn relay(
        &self,
        request: GenerateRequest,
        failure: &'static str,
    ) -> Result<Generation, ApiError> {
        generate_with_timeout(self.tutor.model().as_ref(), request, self.tutor.timeout())
            .await
            .map_err(|e| {
                warn!(error = %e, failure, "Model call failed");
                ApiError::model_failure(StatusCode::INTERNAL_SERVER_ERROR, failure, &e)
            })
    }
}

// ============================================================================
// API Error Type
// ============================================================================

/// Error type for API handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: String,
    details: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            details: None,
        }
    }

    fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error)
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    fn model_failure(status: StatusCode, error: &str, err: &EruditeError) -> Self {
        let details = match err {
            EruditeError::ModelApiError { message, .. } => message.clone(),
            other => other.user_message(),
        };
        Self::new(status, error).with_details(details)
    }

    /// Maps a failed session turn. The transcript already holds the error
    /// message.
    fn turn_failure(err: EruditeError) -> Self {
        match err {
            EruditeError::ModelTimeout { .. }
            | EruditeError::ModelApiError {
                kind: erudite_model::ModelErrorKind::Timeout,
                ..
            } => Self::new(StatusCode::GATEWAY_TIMEOUT, err.user_message()),
            EruditeError::ModelApiError { .. } => Self::model_failure(
                StatusCode::BAD_GATEWAY,
                crate::error::TURN_FAILED_MESSAGE,
                &err,
            ),
            other => other.into(),
        }
    }

    /// HTTP status of this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<EruditeError> for ApiError {
    fn from(err: EruditeError) -> Self {
        let status = match &err {
            EruditeError::InvalidInput { .. } | EruditeError::DocumentTooLarge { .. } => {
                StatusCode::BAD_REQUEST
            }
            EruditeError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            EruditeError::SessionBusy | EruditeError::InvalidStateTransition { .. } => {
                StatusCode::CONFLICT
            }
            EruditeError::ModelTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            EruditeError::ModelApiError { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        match &err {
            EruditeError::PersistenceFailed { operation, .. } => {
                Self::new(status, err.user_message()).with_details(format!("{operation} failed"))
            }
            EruditeError::SessionNotFound { .. }
            | EruditeError::SessionBusy
            | EruditeError::InvalidStateTransition { .. }
            | EruditeError::InvalidInput { .. } => Self::new(status, err.to_string()),
            _ => Self::new(status, err.user_message()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request("Invalid request body").with_details(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.error,
            details: self.details,
        });
        (self.status, body).into_response()
    }
}

/// Unwraps a JSON body, turning rejections into `{error, details}` 400s.
fn parse_body<T: DeserializeOwned>(
    payload: Result<Json<T>, JsonRejection>,
) -> Result<T, ApiError> {
    payload.map(|Json(body)| body).map_err(ApiError::from)
}

/// Parses a user id path segment.
fn parse_user(raw: &str) -> Result<UserId, ApiError> {
    UserId::parse(raw).map_err(ApiError::from)
}

/// Extracts a string `message`, with distinct texts for missing and mistyped.
fn message_text(
    message: Option<Value>,
    missing: &'static str,
    mistyped: &'static str,
) -> Result<String, ApiError> {
    match message {
        None | Some(Value::Null) => Err(ApiError::bad_request(missing)),
        Some(Value::String(text)) => Ok(text),
        Some(_) => Err(ApiError::bad_request(mistyped)),
    }
}

/// Requires non-blank document content.
fn require_content(content: Option<String>) -> Result<String, ApiError> {
    content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("PDF content is required"))
}

// ============================================================================
// Router Setup
// ============================================================================

/// Creates the HTTP router with all API endpoints.
///
/// The router carries:
/// - All API routes under `/api`
/// - CORS for origins starting with `config.allowed_origin_prefix`
/// - Tracing middleware for request logging
pub fn create_router(state: AppState) -> Router {
    let prefix = state.config.allowed_origin_prefix.clone();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _request| origin.as_bytes().starts_with(prefix.as_bytes()),
        ))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true);

    let api_routes = Router::new()
        .route("/health", get(handle_health))
        .route("/chat", post(handle_chat))
        .route("/chat/context", post(handle_context_chat))
        .route("/concept-map", post(handle_concept_map))
        .route("/study-plan", post(handle_study_plan))
        .route("/revision-sheet", post(handle_revision_sheet))
        .route("/sessions", post(handle_create_session))
        .route(
            "/sessions/:id",
            get(handle_get_session).delete(handle_delete_session),
        )
        .route("/sessions/:id/turns", post(handle_session_turn))
        .route("/sessions/:id/difficulty", post(handle_session_difficulty))
        .route(
            "/sessions/:id/document",
            post(handle_session_document).layer(DefaultBodyLimit::max(DOCUMENT_BODY_LIMIT)),
        )
        .route("/sessions/:id/clear", post(handle_session_clear))
        .route("/sessions/:id/archive", post(handle_session_archive))
        .route("/learning/:user_id", get(handle_learning_state))
        .route(
            "/learning/:user_id/misconceptions",
            post(handle_record_misconception),
        )
        .route("/learning/:user_id/mastered", post(handle_mark_mastered))
        .route("/learning/:user_id/weak", post(handle_add_weak))
        .route(
            "/learning/:user_id/study-sessions",
            post(handle_log_study_session),
        )
        .route("/learning/:user_id/weekly", get(handle_weekly_analytics))
        .route("/learning/:user_id/chats", get(handle_chat_history))
        .route(
            "/auth/validate-registration",
            post(handle_validate_registration),
        )
        .route("/auth/error-message", post(handle_auth_error_message));

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(Arc::new(state))
}

// ============================================================================
// Relay Handlers
// ============================================================================

/// Handler for `GET /api/health`.
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Erudite backend is running".to_string(),
        timestamp: Utc::now(),
    })
}

/// Handler for `POST /api/chat`.
///
/// Stateless: one question, one answer, tutor persona as the system prompt.
async fn handle_chat(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let request = parse_body(payload)?;
    let message = message_text(
        request.message,
        "Message must be a string",
        "Message must be a string",
    )?;
    let message = message.trim();
    if message.is_empty() {
        return Err(ApiError::bad_request("Message is required"));
    }

    info!(message_chars = message.chars().count(), "Chat request");
    let generation = state
        .relay(
            GenerateRequest::new(message).with_system(TUTOR_PERSONA),
            "Failed to generate response",
        )
        .await?;

    Ok(Json(ChatResponse {
        reply: generation.text,
        model: generation.model,
    }))
}

/// Handler for `POST /api/chat/context`.
async fn handle_context_chat(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ContextChatRequest>, JsonRejection>,
) -> Result<Json<ReplyResponse>, ApiError> {
    let request = parse_body(payload)?;
    let message = message_text(
        request.message,
        "Message is required",
        "Message must be a string",
    )?;
    let message = message.trim();
    if message.is_empty() {
        return Err(ApiError::bad_request("Message is required"));
    }

    let difficulty = request.difficulty.unwrap_or_default();
    info!(
        message_chars = message.chars().count(),
        has_context = request.context.is_some(),
        difficulty = %difficulty,
        "Context chat request"
    );

    let system = context_chat_instruction(
        request.context.as_deref(),
        difficulty,
        state.max_document_chars(),
    );
    let generation = state
        .relay(
            GenerateRequest::new(message).with_system(system),
            "Failed to process request",
        )
        .await?;

    Ok(Json(ReplyResponse {
        reply: generation.text,
    }))
}

/// Handler for `POST /api/concept-map`.
///
/// Unparseable model output degrades to an empty map.
async fn handle_concept_map(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ContentRequest>, JsonRejection>,
) -> Result<Json<ConceptMap>, ApiError> {
    let content = require_content(parse_body(payload)?.content)?;

    let generation = state
        .relay(
            GenerateRequest::new(concept_map_prompt(&content, state.max_document_chars())),
            "Failed to generate concept map",
        )
        .await?;

    let outcome = parse_concept_map(&generation.text);
    if let ConceptMapOutcome::Fallback(reason) = &outcome {
        warn!(%reason, "Concept map output unusable, returning empty map");
    }
    let map = outcome.into_map();
    info!(
        nodes = map.nodes.len(),
        links = map.links.len(),
        "Concept map generated"
    );
    Ok(Json(map))
}

/// Handler for `POST /api/study-plan`.
async fn handle_study_plan(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ContentRequest>, JsonRejection>,
) -> Result<Json<StudyPlanResponse>, ApiError> {
    let request = parse_body(payload)?;
    let content = require_content(request.content)?;

    let prompt = study_plan_prompt(
        &content,
        &request.weak_concepts,
        state.max_document_chars(),
    );
    let generation = state
        .relay(GenerateRequest::new(prompt), "Failed to generate study plan")
        .await?;

    Ok(Json(StudyPlanResponse {
        study_plan: generation.text,
    }))
}

/// Handler for `POST /api/revision-sheet`.
async fn handle_revision_sheet(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ContentRequest>, JsonRejection>,
) -> Result<Json<RevisionSheetResponse>, ApiError> {
    let request = parse_body(payload)?;
    let content = require_content(request.content)?;

    let prompt = revision_sheet_prompt(
        &content,
        &request.weak_concepts,
        state.max_document_chars(),
    );
    let generation = state
        .relay(
            GenerateRequest::new(prompt),
            "Failed to generate revision sheet",
        )
        .await?;

    Ok(Json(RevisionSheetResponse {
        revision_sheet: generation.text,
    }))
}

// ============================================================================
// Session Handlers
// ============================================================================

/// Handler for `POST /api/sessions`.
async fn handle_create_session(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SessionView>), ApiError> {
    let request = parse_body(payload)?;
    let difficulty = request
        .difficulty
        .unwrap_or(state.config.default_difficulty);

    let mut session = Session::new(request.user_id);
    session.initialize(request.document_content.unwrap_or_default(), difficulty)?;
    let view = session.view();
    state.sessions.insert(session).await;

    Ok((StatusCode::CREATED, Json(view)))
}

/// Handler for `GET /api/sessions/:id`.
async fn handle_get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
) -> Result<Json<SessionView>, ApiError> {
    let handle = state.sessions.get(id).await?;
    let session = handle.lock().await;
    Ok(Json(session.view()))
}

/// Handler for `DELETE /api/sessions/:id`.
async fn handle_delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
) -> Result<StatusCode, ApiError> {
    state.sessions.remove(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `POST /api/sessions/:id/turns`.
///
/// The session is not locked while the model works; a concurrent turn on
/// the same session gets 409.
async fn handle_session_turn(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    payload: Result<Json<TurnRequest>, JsonRejection>,
) -> Result<Json<TurnResponse>, ApiError> {
    let request = parse_body(payload)?;
    let message = message_text(
        request.message,
        "Message is required",
        "Message must be a string",
    )?;
    let handle = state.sessions.get(id).await?;

    let reply = match state.tutor.send_turn(&handle, &message).await {
        Ok(Some(reply)) => reply,
        Ok(None) => return Err(ApiError::bad_request("Message is required")),
        Err(e) => {
            warn!(session = %id, error = %e, "Session turn failed");
            return Err(ApiError::turn_failure(e));
        }
    };

    let session = handle.lock().await;
    info!(session = %id, messages = session.history().len(), "Session turn completed");
    Ok(Json(TurnResponse {
        reply: reply.content,
        status: session.status(),
        messages: session.history().to_vec(),
    }))
}

/// Handler for `POST /api/sessions/:id/difficulty`.
async fn handle_session_difficulty(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    payload: Result<Json<DifficultyRequest>, JsonRejection>,
) -> Result<Json<SessionView>, ApiError> {
    let request = parse_body(payload)?;
    let handle = state.sessions.get(id).await?;
    let mut session = handle.lock().await;
    session.change_difficulty(request.difficulty);
    Ok(Json(session.view()))
}

/// Handler for `POST /api/sessions/:id/document`.
async fn handle_session_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    payload: Result<Json<DocumentRequest>, JsonRejection>,
) -> Result<Json<SessionView>, ApiError> {
    let document = parse_body(payload)?.into_document()?;
    let handle = state.sessions.get(id).await?;
    let mut session = handle.lock().await;
    session.set_document(document);
    Ok(Json(session.view()))
}

/// Handler for `POST /api/sessions/:id/clear`.
async fn handle_session_clear(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
) -> Result<Json<SessionView>, ApiError> {
    let handle = state.sessions.get(id).await?;
    let mut session = handle.lock().await;
    session.clear()?;
    Ok(Json(session.view()))
}

/// Handler for `POST /api/sessions/:id/archive`.
async fn handle_session_archive(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    payload: Result<Json<ArchiveRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ChatRecord>), ApiError> {
    let request = parse_body(payload)?;
    let handle = state.sessions.get(id).await?;

    let (user, messages) = {
        let session = handle.lock().await;
        let user = session.user_id().cloned().ok_or_else(|| {
            ApiError::bad_request("Session is not bound to a user")
        })?;
        (user, session.history().to_vec())
    };

    let record = state
        .learning()
        .archive_chat(&user, messages, request.document_title)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

// ============================================================================
// Learning Handlers
// ============================================================================

/// Handler for `GET /api/learning/:user_id`.
async fn handle_learning_state(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<LearningState>, ApiError> {
    let user = parse_user(&user_id)?;
    Ok(Json(state.learning().load(&user).await?))
}

/// Handler for `POST /api/learning/:user_id/misconceptions`.
async fn handle_record_misconception(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    payload: Result<Json<MisconceptionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Misconception>), ApiError> {
    let user = parse_user(&user_id)?;
    let request = parse_body(payload)?;
    let misconception = state
        .learning()
        .record_misconception(&user, &request.concept, &request.correction)
        .await?;
    Ok((StatusCode::CREATED, Json(misconception)))
}

/// Handler for `POST /api/learning/:user_id/mastered`.
async fn handle_mark_mastered(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    payload: Result<Json<ConceptRequest>, JsonRejection>,
) -> Result<Json<LearningState>, ApiError> {
    let user = parse_user(&user_id)?;
    let request = parse_body(payload)?;
    Ok(Json(
        state
            .learning()
            .mark_mastered(&user, &request.concept)
            .await?,
    ))
}

/// Handler for `POST /api/learning/:user_id/weak`.
async fn handle_add_weak(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    payload: Result<Json<ConceptRequest>, JsonRejection>,
) -> Result<Json<LearningState>, ApiError> {
    let user = parse_user(&user_id)?;
    let request = parse_body(payload)?;
    Ok(Json(
        state
            .learning()
            .add_weak_concept(&user, &request.concept)
            .await?,
    ))
}

/// Handler for `POST /api/learning/:user_id/study-sessions`.
async fn handle_log_study_session(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    payload: Result<Json<StudySessionRequest>, JsonRejection>,
) -> Result<Json<LearningState>, ApiError> {
    let user = parse_user(&user_id)?;
    let request = parse_body(payload)?;
    Ok(Json(
        state
            .learning()
            .log_study_session(&user, request.duration_minutes, request.topic)
            .await?,
    ))
}

/// Handler for `GET /api/learning/:user_id/weekly`.
async fn handle_weekly_analytics(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<DailyStudy>>, ApiError> {
    let user = parse_user(&user_id)?;
    Ok(Json(state.learning().weekly_analytics(&user).await?))
}

/// Handler for `GET /api/learning/:user_id/chats`.
async fn handle_chat_history(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<ChatRecord>>, ApiError> {
    let user = parse_user(&user_id)?;
    Ok(Json(state.learning().chat_history(&user).await?))
}

// ============================================================================
// Auth Handlers
// ============================================================================

/// Handler for `POST /api/auth/validate-registration`.
async fn handle_validate_registration(
    payload: Result<Json<RegistrationRequest>, JsonRejection>,
) -> Result<Json<RegistrationResponse>, ApiError> {
    let request = parse_body(payload)?;
    validate_registration(&request.password, &request.confirm_password)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(RegistrationResponse { valid: true }))
}

/// Handler for `POST /api/auth/error-message`.
async fn handle_auth_error_message(
    payload: Result<Json<AuthCodeRequest>, JsonRejection>,
) -> Result<Json<AuthMessageResponse>, ApiError> {
    let request = parse_body(payload)?;
    Ok(Json(AuthMessageResponse {
        message: auth_error_message(&request.code).to_string(),
    }))
}

// ============================================================================
// Tests
// ============================================================================
