//! Session Manager.
//!
//! A [`Session`] owns one conversation: the ordered transcript, the active
//! difficulty, and the document the learner is studying. Sessions are
//! explicit values held in a [`SessionRegistry`], never ambient state.
//!
//! The status transitions through these states:
//! - `Uninitialized` -> `Ready` on [`Session::initialize`]
//! - `Ready` -> `AwaitingResponse` -> `Ready` for every turn
//! - `Ready` -> `Uninitialized` -> `Ready` on [`Session::clear`]
//!
//! A turn is split into [`Session::begin_turn`] and
//! [`Session::complete_turn`] so the session lock need not be held while
//! the model is working. A second turn submitted in the meantime sees
//! `AwaitingResponse` and is rejected with [`EruditeError::SessionBusy`].
//!
//! Once a turn has begun it always completes. [`Tutor::send_turn`] runs the
//! model call on its own task, and [`Session::send_turn`] records an error
//! message if it is dropped mid-call, so a session never stays
//! `AwaitingResponse` after its caller goes away.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use erudite_model::{GenerateRequest, Generation, LanguageModel, Turn};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::document::{Document, DocumentMetadata};
use crate::error::{EruditeError, Result};
use crate::learning::{LearningSnapshot, LearningStore, UserId};
use crate::prompt::{Difficulty, PromptComposer};

/// Identifier of a session.
pub type SessionId = Uuid;

// ============================================================================
// Messages
// ============================================================================

/// Who produced a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The learner.
    User,
    /// The model.
    Assistant,
    /// A failed turn, with a learner-safe description.
    Error,
}

/// One immutable transcript entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sequential id, unique within the session.
    pub id: u64,
    /// Who produced it.
    pub role: Role,
    /// The text.
    pub content: String,
    /// When it was appended.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a message stamped with the current time.
    #[must_use]
    pub fn new(id: u64, role: Role, content: impl Into<String>) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// SessionStatus
// ============================================================================

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created but not yet given a context.
    #[default]
    Uninitialized,
    /// Accepting turns.
    Ready,
    /// A model call is in flight.
    AwaitingResponse,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Ready => write!(f, "ready"),
            Self::AwaitingResponse => write!(f, "awaiting_response"),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// A turn that has been accepted and is waiting for the model.
#[derive(Debug, Clone)]
pub struct PendingTurn {
    /// Id of the user message that opened the turn.
    pub user_message_id: u64,
    /// The request to send.
    pub request: GenerateRequest,
}

/// One learner's conversation.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    user_id: Option<UserId>,
    status: SessionStatus,
    document_content: String,
    document: Option<DocumentMetadata>,
    difficulty: Difficulty,
    history: Vec<Message>,
    next_message_id: u64,
    created_at: DateTime<Utc>,
}

impl Session {
    /// Creates an uninitialized session, optionally bound to a learner.
    #[must_use]
    pub fn new(user_id: Option<UserId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            status: SessionStatus::Uninitialized,
            document_content: String::new(),
            document: None,
            difficulty: Difficulty::default(),
            history: Vec::new(),
            next_message_id: 1,
            created_at: Utc::now(),
        }
    }

    /// Session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// The learner this session is bound to, if any.
    #[must_use]
    pub const fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        self.status
    }

    /// Current difficulty.
    #[must_use]
    pub const fn difficulty(&self) -> Difficulty {
        self.difficulty
    }

    /// Current document text.
    #[must_use]
    pub fn document_content(&self) -> &str {
        &self.document_content
    }

    /// Metadata of the uploaded document, if one was set with
    /// [`Session::set_document`].
    #[must_use]
    pub const fn document(&self) -> Option<&DocumentMetadata> {
        self.document.as_ref()
    }

    /// The transcript, oldest first.
    #[must_use]
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// When the session was created.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Sets the document and difficulty and makes the session ready.
    ///
    /// Safe to call repeatedly. An existing transcript is kept; use
    /// [`Session::clear`] to drop it.
    pub fn initialize(
        &mut self,
        document_content: impl Into<String>,
        difficulty: Difficulty,
    ) -> Result<()> {
        if self.status == SessionStatus::AwaitingResponse {
            return Err(EruditeError::SessionBusy);
        }
        self.document_content = document_content.into();
        self.document = None;
        self.difficulty = difficulty;
        self.status = SessionStatus::Ready;
        tracing::debug!(
            session = %self.id,
            difficulty = %difficulty,
            document_chars = self.document_content.chars().count(),
            messages = self.history.len(),
            "Session initialized"
        );
        Ok(())
    }

    /// Changes the difficulty for future turns.
    pub fn change_difficulty(&mut self, difficulty: Difficulty) {
        if self.difficulty != difficulty {
            tracing::debug!(session = %self.id, from = %self.difficulty, to = %difficulty, "Difficulty changed");
        }
        self.difficulty = difficulty;
    }

    /// Replaces the document for future turns. An empty document unloads
    /// the current one.
    pub fn set_document(&mut self, document: Document) {
        let Document { content, metadata } = document;
        self.document = (!content.is_empty()).then_some(metadata);
        self.document_content = content;
        tracing::debug!(
            session = %self.id,
            document_chars = self.document_content.chars().count(),
            pages = self.document.as_ref().map_or(0, |m| m.page_count),
            "Session document replaced"
        );
    }

    /// Drops the transcript. The document and difficulty stay.
    ///
    /// # Errors
    ///
    /// Returns `EruditeError::SessionBusy` while a turn is in flight.
    pub fn clear(&mut self) -> Result<()> {
        if self.status == SessionStatus::AwaitingResponse {
            return Err(EruditeError::SessionBusy);
        }
        let dropped = self.history.len();
        self.history.clear();
        // Clearing passes through Uninitialized; the kept document makes the
        // session ready again straight away.
        self.status = SessionStatus::Uninitialized;
        self.status = SessionStatus::Ready;
        tracing::debug!(session = %self.id, dropped, "Session cleared");
        Ok(())
    }

    /// Accepts a learner message and prepares the model request.
    ///
    /// Blank input is ignored and returns `Ok(None)` without touching the
    /// session.
    ///
    /// # Errors
    ///
    /// Returns `EruditeError::SessionBusy` if a turn is already in flight and
    /// `EruditeError::InvalidStateTransition` if the session was never
    /// initialized.
    pub fn begin_turn(
        &mut self,
        user_text: &str,
        composer: &PromptComposer,
        snapshot: &LearningSnapshot,
    ) -> Result<Option<PendingTurn>> {
        let text = user_text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        match self.status {
            SessionStatus::AwaitingResponse => return Err(EruditeError::SessionBusy),
            SessionStatus::Uninitialized => {
                return Err(EruditeError::invalid_transition(
                    self.status,
                    SessionStatus::AwaitingResponse,
                ));
            }
            SessionStatus::Ready => {}
        }

        let history = self.model_history();
        let system = composer.compose(self.difficulty, &self.document_content, snapshot);
        let user_message_id = self.push(Role::User, text).id;
        self.status = SessionStatus::AwaitingResponse;

        tracing::debug!(
            session = %self.id,
            message_id = user_message_id,
            replayed_turns = history.len(),
            prompt_chars = system.len(),
            "Turn started"
        );

        Ok(Some(PendingTurn {
            user_message_id,
            request: GenerateRequest::new(text)
                .with_system(system)
                .with_history(history),
        }))
    }

    /// Records the outcome of the in-flight turn and returns to `Ready`.
    ///
    /// On success the assistant message is appended and returned. On failure
    /// an error message with a learner-safe description is appended and the
    /// original error is returned.
    ///
    /// # Errors
    ///
    /// Returns the model error, or `EruditeError::InvalidStateTransition` if
    /// no turn is in flight.
    pub fn complete_turn(&mut self, outcome: Result<Generation>) -> Result<Message> {
        if self.status != SessionStatus::AwaitingResponse {
            return Err(EruditeError::invalid_transition(
                self.status,
                SessionStatus::Ready,
            ));
        }
        self.status = SessionStatus::Ready;

        match outcome {
            Ok(generation) => {
                let message = self.push(Role::Assistant, generation.text);
                tracing::debug!(session = %self.id, message_id = message.id, model = %generation.model, "Turn completed");
                Ok(message)
            }
            Err(err) => {
                let message = self.push(Role::Error, err.user_message());
                tracing::warn!(session = %self.id, message_id = message.id, error = %err, "Turn failed");
                Err(err)
            }
        }
    }

    /// Runs a whole turn while holding the session exclusively.
    ///
    /// Returns `Ok(None)` for blank input. If the future is dropped while the
    /// model is working, the turn is recorded as failed.
    pub async fn send_turn(
        &mut self,
        user_text: &str,
        model: &dyn LanguageModel,
        composer: &PromptComposer,
        snapshot: &LearningSnapshot,
        timeout: Duration,
    ) -> Result<Option<Message>> {
        let Some(pending) = self.begin_turn(user_text, composer, snapshot)? else {
            return Ok(None);
        };
        let mut in_flight = InFlightTurn {
            session: self,
            settled: false,
        };
        let outcome = generate_with_timeout(model, pending.request, timeout).await;
        in_flight.settled = true;
        let completed = in_flight.session.complete_turn(outcome);
        completed.map(Some)
    }

    /// Answered user/assistant pairs as model turns, oldest first.
    ///
    /// Failed turns stay in the transcript but are not replayed.
    #[must_use]
    pub fn model_history(&self) -> Vec<Turn> {
        self.history
            .windows(2)
            .filter(|pair| pair[0].role == Role::User && pair[1].role == Role::Assistant)
            .flat_map(|pair| [Turn::user(&pair[0].content), Turn::model(&pair[1].content)])
            .collect()
    }

    /// Serializable view for clients.
    #[must_use]
    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id,
            user_id: self.user_id.clone(),
            status: self.status,
            difficulty: self.difficulty,
            has_document: !self.document_content.trim().is_empty(),
            document_chars: self.document_content.chars().count(),
            document: self.document.clone(),
            messages: self.history.clone(),
            created_at: self.created_at,
        }
    }

    fn push(&mut self, role: Role, content: impl Into<String>) -> Message {
        let message = Message::new(self.next_message_id, role, content);
        self.next_message_id += 1;
        self.history.push(message.clone());
        message
    }
}

/// Settles a turn begun by [`Session::send_turn`] whose future was dropped.
struct InFlightTurn<'a> {
    session: &'a mut Session,
    settled: bool,
}

impl Drop for InFlightTurn<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.session.complete_turn(Err(EruditeError::TurnAbandoned));
        }
    }
}

/// Client-facing view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    /// Session id.
    pub id: SessionId,
    /// Bound learner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// Current status.
    pub status: SessionStatus,
    /// Current difficulty.
    pub difficulty: Difficulty,
    /// Whether a document is loaded.
    pub has_document: bool,
    /// Length of the loaded document in characters.
    pub document_chars: usize,
    /// Metadata of an uploaded document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<DocumentMetadata>,
    /// The transcript.
    pub messages: Vec<Message>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Calls the model, failing with `ModelTimeout` after `timeout`.
pub async fn generate_with_timeout(
    model: &dyn LanguageModel,
    request: GenerateRequest,
    timeout: Duration,
) -> Result<Generation> {
    match tokio::time::timeout(timeout, model.generate(request)).await {
        Ok(result) => result.map_err(EruditeError::from),
        Err(_) => Err(EruditeError::model_timeout(timeout.as_secs())),
    }
}

// ============================================================================
// Tutor
// ============================================================================

/// Runs turns for shared sessions.
///
/// The session lock is released while the model call is in flight, so
/// other requests can read the session and a concurrent turn is rejected
/// as busy instead of queueing. The call and its completion run on a
/// spawned task that outlives the caller.
pub struct Tutor {
    model: Arc<dyn LanguageModel>,
    composer: PromptComposer,
    learning: Arc<LearningStore>,
    timeout: Duration,
}

impl std::fmt::Debug for Tutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tutor")
            .field("model", &self.model.model_id())
            .field("composer", &self.composer)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Tutor {
    /// Creates a tutor.
    #[must_use]
    pub fn new(
        model: Arc<dyn LanguageModel>,
        composer: PromptComposer,
        learning: Arc<LearningStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            model,
            composer,
            learning,
            timeout,
        }
    }

    /// The model client.
    #[must_use]
    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    /// The prompt composer.
    #[must_use]
    pub const fn composer(&self) -> &PromptComposer {
        &self.composer
    }

    /// The learning store.
    #[must_use]
    pub fn learning(&self) -> &Arc<LearningStore> {
        &self.learning
    }

    /// The model call timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends one learner message in `session`.
    ///
    /// Returns `Ok(None)` for blank input. Bound sessions pull the learner's
    /// snapshot first; if it cannot be read the turn goes ahead without it.
    ///
    /// Dropping the returned future after the turn has begun does not cancel
    /// it: the reply or error is still appended to the session.
    pub async fn send_turn(
        &self,
        session: &SessionHandle,
        user_text: &str,
    ) -> Result<Option<Message>> {
        if user_text.trim().is_empty() {
            return Ok(None);
        }

        let user_id = session.lock().await.user_id().cloned();
        let snapshot = match user_id {
            Some(user) => self.learning.snapshot(&user).await.unwrap_or_else(|e| {
                tracing::warn!(user = %user, error = %e, "Learning snapshot unavailable, continuing without it");
                LearningSnapshot::default()
            }),
            None => LearningSnapshot::default(),
        };

        // Spawned under the session lock so no await point separates the
        // start of the turn from the task that will finish it.
        let turn = {
            let mut guard = session.lock().await;
            let Some(pending) = guard.begin_turn(user_text, &self.composer, &snapshot)? else {
                return Ok(None);
            };
            let model = Arc::clone(&self.model);
            let handle = Arc::clone(session);
            let timeout = self.timeout;
            tokio::spawn(async move {
                let outcome = generate_with_timeout(model.as_ref(), pending.request, timeout).await;
                let mut session = handle.lock().await;
                session.complete_turn(outcome)
            })
        };

        match turn.await {
            Ok(result) => result.map(Some),
            Err(e) => {
                tracing::error!(error = %e, "Turn task failed");
                let mut guard = session.lock().await;
                if guard.status() == SessionStatus::AwaitingResponse {
                    guard.complete_turn(Err(EruditeError::TurnAbandoned)).map(Some)
                } else {
                    Err(EruditeError::TurnAbandoned)
                }
            }
        }
    }
}

// ============================================================================
// SessionRegistry
// ============================================================================

/// Shared handle to one session.
pub type SessionHandle = Arc<Mutex<Session>>;

/// All live sessions, keyed by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session and returns its handle.
    pub async fn insert(&self, session: Session) -> SessionHandle {
        let id = session.id();
        let handle = Arc::new(Mutex::new(session));
        self.sessions.write().await.insert(id, Arc::clone(&handle));
        tracing::info!(session = %id, "Session created");
        handle
    }

    /// Looks up a session.
    ///
    /// # Errors
    ///
    /// Returns `EruditeError::SessionNotFound` for unknown ids.
    pub async fn get(&self, id: SessionId) -> Result<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EruditeError::session_not_found(id))
    }

    /// Drops a session.
    ///
    /// # Errors
    ///
    /// Returns `EruditeError::SessionNotFound` for unknown ids.
    pub async fn remove(&self, id: SessionId) -> Result<()> {
        self.sessions
            .write()
            .await
            .remove(&id)
            .map(|_| tracing::info!(session = %id, "Session closed"))
            .ok_or_else(|| EruditeError::session_not_found(id))
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Returns `true` if there are no live sessions.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
