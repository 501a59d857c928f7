//! Erudite Relay Orchestrator
//!
//! Composes teaching prompts, runs tutoring sessions, keeps per-learner
//! learning state and serves the HTTP relay.

pub mod api;
pub mod auth;
pub mod concept_map;
pub mod config;
pub mod document;
pub mod error;
pub mod learning;
pub mod prompt;
pub mod session;

pub use api::{create_router, AppState, ErrorResponse, HealthResponse, TurnResponse};
pub use auth::{auth_error_message, validate_registration, AuthFailure, RegistrationError};
pub use concept_map::{parse_concept_map, ConceptLink, ConceptMap, ConceptMapOutcome, ConceptNode};
pub use config::Config;
pub use document::{format_file_size, Document, DocumentMetadata, MAX_DOCUMENT_SIZE};
pub use error::{EruditeError, Result, TURN_FAILED_MESSAGE};
pub use learning::{
    ChatRecord, DailyStudy, JsonFileBackend, LearningBackend, LearningSnapshot, LearningState,
    LearningStore, MemoryBackend, Misconception, StudySessionLog, UserId,
};
pub use prompt::{Difficulty, PromptComposer, TEACHING_POLICY};
pub use session::{
    Message, Role, Session, SessionHandle, SessionId, SessionRegistry, SessionStatus,
    SessionView, Tutor,
};
