//! Learning State Store.
//!
//! A per-user record of weak concepts, mastered concepts, misconceptions and
//! study-time totals, plus append-only logs of study sessions and archived
//! chats. [`LearningStore`] is a write-through cache over a
//! [`LearningBackend`]: reads are served from the cache, mutations apply to
//! the cache first and are then persisted. A failed write is returned to the
//! caller but does not roll the cache back.
//!
//! Writes for one user are serialized from the cache update through the
//! backend write, so the persisted record never lags behind an older cached
//! one.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::error::{EruditeError, Result};
use crate::session::Message;

/// Default number of misconceptions included in a snapshot.
pub const DEFAULT_RECENT_MISCONCEPTIONS: usize = 5;

/// Number of days covered by weekly analytics.
const WEEK_DAYS: i64 = 7;

/// Longest accepted study session, one day.
pub const MAX_STUDY_SESSION_MINUTES: u64 = 24 * 60;

/// Longest accepted user id.
const MAX_USER_ID_LEN: usize = 128;

// ============================================================================
// Types
// ============================================================================

/// Identity of a learner, as issued by the external auth provider.
///
/// Non-empty, at most 128 characters of `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Validates and wraps a user id.
    ///
    /// # Errors
    ///
    /// Returns `EruditeError::InvalidInput` for empty, overlong or
    /// non-alphanumeric ids.
    pub fn parse(raw: &str) -> Result<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_USER_ID_LEN
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(EruditeError::invalid_input(
                "userId",
                "User id must be 1-128 characters of letters, digits, '_' or '-'",
            ))
        }
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A corrected misunderstanding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Misconception {
    /// What the learner believed.
    pub concept: String,
    /// The correct understanding.
    pub correction: String,
    /// When it was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Durable per-user learning record.
///
/// A concept is never in both `weak_concepts` and `mastered_concepts`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LearningState {
    /// Concepts the learner struggles with.
    pub weak_concepts: BTreeSet<String>,
    /// Concepts the learner has mastered.
    pub mastered_concepts: BTreeSet<String>,
    /// Misconceptions in the order they were recorded.
    pub misconceptions: Vec<Misconception>,
    /// Total logged study time in minutes.
    pub total_study_time: u64,
    /// Number of logged study sessions.
    pub study_sessions: u64,
    /// Last local modification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl LearningState {
    /// Moves `concept` into the mastered set. Idempotent.
    pub fn mark_mastered(&mut self, concept: &str) {
        self.weak_concepts.remove(concept);
        self.mastered_concepts.insert(concept.to_string());
    }

    /// Adds `concept` to the weak set unless it is already mastered.
    ///
    /// Returns `true` if the set changed.
    pub fn add_weak_concept(&mut self, concept: &str) -> bool {
        if self.mastered_concepts.contains(concept) {
            return false;
        }
        self.weak_concepts.insert(concept.to_string())
    }

    /// Appends a misconception and returns it.
    pub fn record_misconception(
        &mut self,
        concept: &str,
        correction: &str,
        at: DateTime<Utc>,
    ) -> Misconception {
        let misconception = Misconception {
            concept: concept.to_string(),
            correction: correction.to_string(),
            timestamp: at,
        };
        self.misconceptions.push(misconception.clone());
        misconception
    }

    /// Adds one study session of `minutes` to the totals.
    pub fn log_study(&mut self, minutes: u64) {
        self.study_sessions = self.study_sessions.saturating_add(1);
        self.total_study_time = self.total_study_time.saturating_add(minutes);
    }

    /// The subset of this record that goes into a prompt.
    #[must_use]
    pub fn snapshot(&self, recent_misconceptions: usize) -> LearningSnapshot {
        let skip = self
            .misconceptions
            .len()
            .saturating_sub(recent_misconceptions);
        LearningSnapshot {
            weak_concepts: self.weak_concepts.iter().cloned().collect(),
            recent_misconceptions: self.misconceptions[skip..].to_vec(),
            mastered_concepts: self.mastered_concepts.iter().cloned().collect(),
        }
    }
}

/// Prompt-facing view of a [`LearningState`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningSnapshot {
    /// Current weak concepts.
    pub weak_concepts: Vec<String>,
    /// The most recent misconceptions, oldest first.
    pub recent_misconceptions: Vec<Misconception>,
    /// Current mastered concepts.
    pub mastered_concepts: Vec<String>,
}

impl LearningSnapshot {
    /// Returns `true` when there is nothing worth telling the model.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.weak_concepts.is_empty()
            && self.recent_misconceptions.is_empty()
            && self.mastered_concepts.is_empty()
    }
}

/// One entry in the study-session log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudySessionLog {
    /// Who studied.
    pub user_id: UserId,
    /// Duration in minutes.
    pub duration_minutes: u64,
    /// What was studied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// When the session was logged.
    pub date: DateTime<Utc>,
}

/// Study minutes for one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStudy {
    /// Short weekday name, e.g. `"Mon"`.
    pub day: String,
    /// The UTC calendar day.
    pub date: NaiveDate,
    /// Minutes studied.
    pub minutes: u64,
}

/// An archived chat transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    /// Archive id.
    pub id: Uuid,
    /// Owner.
    pub user_id: UserId,
    /// Title of the document being studied, if any.
    #[serde(default)]
    pub document_title: Option<String>,
    /// The transcript.
    pub messages: Vec<Message>,
    /// `messages.len()` at archive time.
    pub message_count: usize,
    /// When the transcript was archived.
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Backends
// ============================================================================

/// Durable storage for learning data.
///
/// `store_state` replaces the whole per-user record; the logs are
/// append-only.
#[async_trait]
pub trait LearningBackend: Send + Sync {
    /// Reads a user's record, `None` if it was never written.
    async fn fetch_state(&self, user: &UserId) -> Result<Option<LearningState>>;

    /// Writes a user's record.
    async fn store_state(&self, user: &UserId, state: &LearningState) -> Result<()>;

    /// Appends a study-session log entry.
    async fn append_study_session(&self, entry: &StudySessionLog) -> Result<()>;

    /// Log entries for `user` dated at or after `since`, oldest first.
    async fn study_sessions_since(
        &self,
        user: &UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<StudySessionLog>>;

    /// Appends a chat archive.
    async fn append_chat(&self, record: &ChatRecord) -> Result<()>;

    /// All chat archives for `user`, in insertion order.
    async fn chats(&self, user: &UserId) -> Result<Vec<ChatRecord>>;
}

/// Process-local backend. Data is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    states: RwLock<HashMap<UserId, LearningState>>,
    study_sessions: RwLock<Vec<StudySessionLog>>,
    chats: RwLock<Vec<ChatRecord>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LearningBackend for MemoryBackend {
    async fn fetch_state(&self, user: &UserId) -> Result<Option<LearningState>> {
        Ok(self.states.read().await.get(user).cloned())
    }

    async fn store_state(&self, user: &UserId, state: &LearningState) -> Result<()> {
        self.states
            .write()
            .await
            .insert(user.clone(), state.clone());
        Ok(())
    }

    async fn append_study_session(&self, entry: &StudySessionLog) -> Result<()> {
        self.study_sessions.write().await.push(entry.clone());
        Ok(())
    }

    async fn study_sessions_since(
        &self,
        user: &UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<StudySessionLog>> {
        let mut entries: Vec<_> = self
            .study_sessions
            .read()
            .await
            .iter()
            .filter(|e| &e.user_id == user && e.date >= since)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.date);
        Ok(entries)
    }

    async fn append_chat(&self, record: &ChatRecord) -> Result<()> {
        self.chats.write().await.push(record.clone());
        Ok(())
    }

    async fn chats(&self, user: &UserId) -> Result<Vec<ChatRecord>> {
        Ok(self
            .chats
            .read()
            .await
            .iter()
            .filter(|r| &r.user_id == user)
            .cloned()
            .collect())
    }
}

/// JSON files under a state directory.
///
/// ```text
/// <root>/learning_states/<user>.json
/// <root>/study_sessions/<user>.jsonl
/// <root>/chat_sessions/<user>.jsonl
/// ```
///
/// Records are replaced atomically through a temporary file and rename.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    root: PathBuf,
}

impl JsonFileBackend {
    /// Creates a backend rooted at `root`. Directories are created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The state directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self, user: &UserId) -> PathBuf {
        self.root
            .join("learning_states")
            .join(format!("{user}.json"))
    }

    fn study_log_path(&self, user: &UserId) -> PathBuf {
        self.root
            .join("study_sessions")
            .join(format!("{user}.jsonl"))
    }

    fn chat_log_path(&self, user: &UserId) -> PathBuf {
        self.root
            .join("chat_sessions")
            .join(format!("{user}.jsonl"))
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

async fn append_line<T: Serialize + Sync>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path).await?;
    let mut line = serde_json::to_string(value)?;
    line.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

async fn read_lines<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|e| {
                EruditeError::record_corrupted(path, format!("line {}: {e}", index + 1))
            })
        })
        .collect()
}

#[async_trait]
impl LearningBackend for JsonFileBackend {
    async fn fetch_state(&self, user: &UserId) -> Result<Option<LearningState>> {
        let path = self.state_path(user);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| EruditeError::record_corrupted(&path, e.to_string()))
    }

    async fn store_state(&self, user: &UserId, state: &LearningState) -> Result<()> {
        let path = self.state_path(user);
        ensure_parent(&path).await?;

        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4()));
        let json = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn append_study_session(&self, entry: &StudySessionLog) -> Result<()> {
        append_line(&self.study_log_path(&entry.user_id), entry).await
    }

    async fn study_sessions_since(
        &self,
        user: &UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<StudySessionLog>> {
        let mut entries: Vec<StudySessionLog> = read_lines(&self.study_log_path(user)).await?;
        entries.retain(|e| e.date >= since);
        entries.sort_by_key(|e| e.date);
        Ok(entries)
    }

    async fn append_chat(&self, record: &ChatRecord) -> Result<()> {
        append_line(&self.chat_log_path(&record.user_id), record).await
    }

    async fn chats(&self, user: &UserId) -> Result<Vec<ChatRecord>> {
        read_lines(&self.chat_log_path(user)).await
    }
}

// ============================================================================
// Store
// ============================================================================

/// Write-through cache of learning state over a [`LearningBackend`].
pub struct LearningStore {
    backend: Arc<dyn LearningBackend>,
    cache: Mutex<HashMap<UserId, LearningState>>,
    writers: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
    recent_misconceptions: usize,
}

impl std::fmt::Debug for LearningStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LearningStore")
            .field("recent_misconceptions", &self.recent_misconceptions)
            .finish_non_exhaustive()
    }
}

impl LearningStore {
    /// Creates a store over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn LearningBackend>, recent_misconceptions: usize) -> Self {
        Self {
            backend,
            cache: Mutex::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
            recent_misconceptions,
        }
    }

    /// Creates a store backed by process memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), DEFAULT_RECENT_MISCONCEPTIONS)
    }

    /// Returns the user's learning state.
    ///
    /// Users with no record get the zero state; that is not an error.
    pub async fn load(&self, user: &UserId) -> Result<LearningState> {
        let mut cache = self.cache.lock().await;
        Ok(self.cached(&mut cache, user).await?.clone())
    }

    /// Returns the prompt-facing subset of the user's state.
    pub async fn snapshot(&self, user: &UserId) -> Result<LearningSnapshot> {
        let mut cache = self.cache.lock().await;
        let state = self.cached(&mut cache, user).await?;
        Ok(state.snapshot(self.recent_misconceptions))
    }

    /// Appends a misconception.
    pub async fn record_misconception(
        &self,
        user: &UserId,
        concept: &str,
        correction: &str,
    ) -> Result<Misconception> {
        let concept = require_text("concept", concept)?;
        let correction = require_text("correction", correction)?;

        let (misconception, _) = self
            .mutate(user, "record misconception", |state| {
                state.record_misconception(concept, correction, Utc::now())
            })
            .await?;
        tracing::debug!(user = %user, concept, "Recorded misconception");
        Ok(misconception)
    }

    /// Marks a concept as mastered, removing it from the weak set.
    pub async fn mark_mastered(&self, user: &UserId, concept: &str) -> Result<LearningState> {
        let concept = require_text("concept", concept)?;
        let ((), state) = self
            .mutate(user, "mark mastered", |state| state.mark_mastered(concept))
            .await?;
        tracing::debug!(user = %user, concept, "Marked concept mastered");
        Ok(state)
    }

    /// Adds a concept to the weak set unless mastered or already present.
    pub async fn add_weak_concept(&self, user: &UserId, concept: &str) -> Result<LearningState> {
        let concept = require_text("concept", concept)?;
        let (changed, state) = self
            .mutate(user, "add weak concept", |state| {
                state.add_weak_concept(concept)
            })
            .await?;
        tracing::debug!(user = %user, concept, changed, "Added weak concept");
        Ok(state)
    }

    /// Logs a study session and updates the totals.
    ///
    /// # Errors
    ///
    /// `duration_minutes` must be positive and at most
    /// [`MAX_STUDY_SESSION_MINUTES`]; other values are rejected with
    /// `EruditeError::InvalidInput` and change nothing.
    pub async fn log_study_session(
        &self,
        user: &UserId,
        duration_minutes: i64,
        topic: Option<String>,
    ) -> Result<LearningState> {
        let minutes = u64::try_from(duration_minutes)
            .ok()
            .filter(|m| *m > 0)
            .ok_or_else(|| {
                EruditeError::invalid_input(
                    "durationMinutes",
                    "Duration must be a positive number of minutes",
                )
            })?;
        if minutes > MAX_STUDY_SESSION_MINUTES {
            return Err(EruditeError::invalid_input(
                "durationMinutes",
                format!("Duration cannot exceed {MAX_STUDY_SESSION_MINUTES} minutes"),
            ));
        }

        let entry = StudySessionLog {
            user_id: user.clone(),
            duration_minutes: minutes,
            topic: topic.filter(|t| !t.trim().is_empty()),
            date: Utc::now(),
        };

        let _writer = self.write_lock(user).await;
        let updated = {
            let mut cache = self.cache.lock().await;
            let state = self.cached(&mut cache, user).await?;
            state.log_study(minutes);
            state.updated_at = Some(entry.date);
            state.clone()
        };

        let stored = self.backend.store_state(user, &updated).await;
        let logged = self.backend.append_study_session(&entry).await;
        if let Err(e) = stored.and(logged) {
            tracing::warn!(user = %user, error = %e, "Failed to persist study session");
            return Err(EruditeError::persistence("log study session", e));
        }

        tracing::debug!(user = %user, minutes, "Logged study session");
        Ok(updated)
    }

    /// Minutes studied on each of the trailing 7 UTC days, oldest first.
    pub async fn weekly_analytics(&self, user: &UserId) -> Result<Vec<DailyStudy>> {
        self.weekly_analytics_at(user, Utc::now()).await
    }

    /// [`weekly_analytics`](Self::weekly_analytics) relative to `now`.
    ///
    /// Always returns exactly 7 entries ending with `now`'s day.
    pub async fn weekly_analytics_at(
        &self,
        user: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<DailyStudy>> {
        let today = now.date_naive();
        let first_day = today - Duration::days(WEEK_DAYS - 1);

        let mut week: Vec<DailyStudy> = (0..WEEK_DAYS)
            .map(|offset| {
                let date = first_day + Duration::days(offset);
                DailyStudy {
                    day: date.format("%a").to_string(),
                    date,
                    minutes: 0,
                }
            })
            .collect();

        let entries = self
            .backend
            .study_sessions_since(user, now - Duration::days(WEEK_DAYS))
            .await
            .map_err(|e| EruditeError::persistence("read study sessions", e))?;

        for entry in entries {
            let offset = (entry.date.date_naive() - first_day).num_days();
            if let Some(slot) = usize::try_from(offset).ok().and_then(|i| week.get_mut(i)) {
                slot.minutes = slot.minutes.saturating_add(entry.duration_minutes);
            }
        }

        Ok(week)
    }

    /// Archives a chat transcript for the user.
    pub async fn archive_chat(
        &self,
        user: &UserId,
        messages: Vec<Message>,
        document_title: Option<String>,
    ) -> Result<ChatRecord> {
        let record = ChatRecord {
            id: Uuid::new_v4(),
            user_id: user.clone(),
            document_title,
            message_count: messages.len(),
            messages,
            created_at: Utc::now(),
        };

        let _writer = self.write_lock(user).await;
        self.backend.append_chat(&record).await.map_err(|e| {
            tracing::warn!(user = %user, error = %e, "Failed to archive chat");
            EruditeError::persistence("archive chat", e)
        })?;
        tracing::info!(user = %user, messages = record.message_count, "Archived chat");
        Ok(record)
    }

    /// The user's archived chats, newest first.
    pub async fn chat_history(&self, user: &UserId) -> Result<Vec<ChatRecord>> {
        let mut records = self
            .backend
            .chats(user)
            .await
            .map_err(|e| EruditeError::persistence("read chat history", e))?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Returns the cached state, fetching it on first use.
    async fn cached<'a>(
        &self,
        cache: &'a mut HashMap<UserId, LearningState>,
        user: &UserId,
    ) -> Result<&'a mut LearningState> {
        if !cache.contains_key(user) {
            let fetched = self.backend.fetch_state(user).await.map_err(|e| {
                tracing::warn!(user = %user, error = %e, "Failed to read learning state");
                EruditeError::persistence("read learning state", e)
            })?;
            cache.insert(user.clone(), fetched.unwrap_or_default());
        }
        cache
            .get_mut(user)
            .ok_or_else(|| EruditeError::persistence("read learning state", "cache miss"))
    }

    /// Takes the user's write lock. Held from the cache update until the
    /// backend write finishes.
    async fn write_lock(&self, user: &UserId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.writers.lock().await.entry(user.clone()).or_default());
        lock.lock_owned().await
    }

    /// Applies `op` to the cached state, then persists it.
    ///
    /// Nothing changes if the state cannot be read. If the write fails the
    /// cache keeps the update and `PersistenceFailed` is returned.
    async fn mutate<T, F>(
        &self,
        user: &UserId,
        operation: &str,
        op: F,
    ) -> Result<(T, LearningState)>
    where
        F: FnOnce(&mut LearningState) -> T + Send,
        T: Send,
    {
        let _writer = self.write_lock(user).await;
        let (output, updated) = {
            let mut cache = self.cache.lock().await;
            let state = self.cached(&mut cache, user).await?;
            let output = op(state);
            state.updated_at = Some(Utc::now());
            (output, state.clone())
        };

        if let Err(e) = self.backend.store_state(user, &updated).await {
            tracing::warn!(user = %user, operation, error = %e, "Failed to persist learning state");
            return Err(EruditeError::persistence(operation, e));
        }
        Ok((output, updated))
    }
}

fn require_text<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EruditeError::invalid_input(
            field,
            format!("{field} is required"),
        ));
    }
    Ok(trimmed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::TimeZone;

    use super::*;
    use crate::session::{Message, Role};

    fn user(id: &str) -> UserId {
        UserId::parse(id).unwrap()
    }

    /// Memory backend whose reads and writes can be made to fail.
    #[derive(Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
    }

    impl FlakyBackend {
        fn check_read(&self) -> Result<()> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(EruditeError::Io(std::io::Error::other("read refused")));
            }
            Ok(())
        }

        fn check_write(&self) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(EruditeError::Io(std::io::Error::other("write refused")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LearningBackend for FlakyBackend {
        async fn fetch_state(&self, user: &UserId) -> Result<Option<LearningState>> {
            self.check_read()?;
            self.inner.fetch_state(user).await
        }

        async fn store_state(&self, user: &UserId, state: &LearningState) -> Result<()> {
            self.check_write()?;
            self.inner.store_state(user, state).await
        }

        async fn append_study_session(&self, entry: &StudySessionLog) -> Result<()> {
            self.check_write()?;
            self.inner.append_study_session(entry).await
        }

        async fn study_sessions_since(
            &self,
            user: &UserId,
            since: DateTime<Utc>,
        ) -> Result<Vec<StudySessionLog>> {
            self.check_read()?;
            self.inner.study_sessions_since(user, since).await
        }

        async fn append_chat(&self, record: &ChatRecord) -> Result<()> {
            self.check_write()?;
            self.inner.append_chat(record).await
        }

        async fn chats(&self, user: &UserId) -> Result<Vec<ChatRecord>> {
            self.check_read()?;
            self.inner.chats(user).await
        }
    }

    /// Memory backend whose first state write stalls.
    #[derive(Default)]
    struct SlowFirstWrite {
        inner: MemoryBackend,
        stalled: AtomicBool,
    }

    #[async_trait]
    impl LearningBackend for SlowFirstWrite {
        async fn fetch_state(&self, user: &UserId) -> Result<Option<LearningState>> {
            self.inner.fetch_state(user).await
        }

        async fn store_state(&self, user: &UserId, state: &LearningState) -> Result<()> {
            if !self.stalled.swap(true, Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            self.inner.store_state(user, state).await
        }

        async fn append_study_session(&self, entry: &StudySessionLog) -> Result<()> {
            self.inner.append_study_session(entry).await
        }

        async fn study_sessions_since(
            &self,
            user: &UserId,
            since: DateTime<Utc>,
        ) -> Result<Vec<StudySessionLog>> {
            self.inner.study_sessions_since(user, since).await
        }

        async fn append_chat(&self, record: &ChatRecord) -> Result<()> {
            self.inner.append_chat(record).await
        }

        async fn chats(&self, user: &UserId) -> Result<Vec<ChatRecord>> {
            self.inner.chats(user).await
        }
    }

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("erudite-{name}-{}", Uuid::new_v4()))
    }

    #[test]
    fn test_user_id_validation() {
        assert!(UserId::parse("abc_DEF-123").is_ok());
        assert!(UserId::parse("").is_err());
        assert!(UserId::parse("../etc/passwd").is_err());
        assert!(UserId::parse("has space").is_err());
        assert!(UserId::parse(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_mark_mastered_removes_from_weak() {
        let mut state = LearningState::default();
        assert!(state.add_weak_concept("osmosis"));
        state.mark_mastered("osmosis");
        state.mark_mastered("osmosis");

        assert!(state.mastered_concepts.contains("osmosis"));
        assert!(!state.weak_concepts.contains("osmosis"));
        assert_eq!(state.mastered_concepts.len(), 1);
    }

    #[test]
    fn test_add_weak_concept_skips_mastered_and_duplicates() {
        let mut state = LearningState::default();
        state.mark_mastered("diffusion");
        assert!(!state.add_weak_concept("diffusion"));
        assert!(state.add_weak_concept("osmosis"));
        assert!(!state.add_weak_concept("osmosis"));
        assert_eq!(state.weak_concepts.len(), 1);
    }

    #[test]
    fn test_snapshot_keeps_recent_misconceptions() {
        let mut state = LearningState::default();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for i in 0..8 {
            state.record_misconception(&format!("m{i}"), "fix", at);
        }

        let snapshot = state.snapshot(5);
        let concepts: Vec<_> = snapshot
            .recent_misconceptions
            .iter()
            .map(|m| m.concept.as_str())
            .collect();
        assert_eq!(concepts, vec!["m3", "m4", "m5", "m6", "m7"]);
    }

    #[test]
    fn test_log_study_saturates() {
        let mut state = LearningState {
            study_sessions: u64::MAX,
            total_study_time: u64::MAX - 5,
            ..LearningState::default()
        };
        state.log_study(60);
        assert_eq!(state.study_sessions, u64::MAX);
        assert_eq!(state.total_study_time, u64::MAX);
    }

    #[test]
    fn test_state_deserializes_partial_record() {
        let state: LearningState = serde_json::from_str(r#"{"studySessions": 3}"#).unwrap();
        assert_eq!(state.study_sessions, 3);
        assert!(state.weak_concepts.is_empty());
    }

    #[tokio::test]
    async fn test_load_missing_user_returns_zero_state() {
        let store = LearningStore::in_memory();
        let state = store.load(&user("newcomer")).await.unwrap();
        assert_eq!(state, LearningState::default());
    }

    #[tokio::test]
    async fn test_record_misconception_then_load() {
        let store = LearningStore::in_memory();
        let learner = user("learner1");

        store
            .record_misconception(
                &learner,
                "photosynthesis requires no light",
                "photosynthesis requires light",
            )
            .await
            .unwrap();

        let state = store.load(&learner).await.unwrap();
        let last = state.misconceptions.last().unwrap();
        assert_eq!(last.concept, "photosynthesis requires no light");
        assert_eq!(last.correction, "photosynthesis requires light");
        assert!(!last.timestamp.to_rfc3339().is_empty());
    }

    #[tokio::test]
    async fn test_record_misconception_requires_text() {
        let store = LearningStore::in_memory();
        let err = store
            .record_misconception(&user("learner1"), "  ", "fix")
            .await
            .unwrap_err();
        assert!(matches!(err, EruditeError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_log_study_session_updates_totals() {
        let store = LearningStore::in_memory();
        let learner = user("learner1");

        store
            .log_study_session(&learner, 25, Some("cells".to_string()))
            .await
            .unwrap();
        let state = store.log_study_session(&learner, 35, None).await.unwrap();

        assert_eq!(state.study_sessions, 2);
        assert_eq!(state.total_study_time, 60);
    }

    #[tokio::test]
    async fn test_log_study_session_rejects_non_positive() {
        let store = LearningStore::in_memory();
        let learner = user("learner1");

        for minutes in [0, -5] {
            let err = store
                .log_study_session(&learner, minutes, None)
                .await
                .unwrap_err();
            assert!(matches!(err, EruditeError::InvalidInput { .. }));
        }
        assert_eq!(store.load(&learner).await.unwrap().study_sessions, 0);
    }

    #[tokio::test]
    async fn test_log_study_session_rejects_overlong() {
        let store = LearningStore::in_memory();
        let learner = user("learner1");

        for minutes in [1441, i64::MAX] {
            let err = store
                .log_study_session(&learner, minutes, None)
                .await
                .unwrap_err();
            assert!(matches!(err, EruditeError::InvalidInput { .. }));
        }

        let state = store.log_study_session(&learner, 1440, None).await.unwrap();
        assert_eq!(state.total_study_time, 1440);
        assert_eq!(state.study_sessions, 1);
    }

    #[tokio::test]
    async fn test_weekly_analytics_saturates() {
        let backend = Arc::new(MemoryBackend::new());
        let store = LearningStore::new(backend.clone(), 5);
        let learner = user("learner1");
        let now = Utc.with_ymd_and_hms(2024, 5, 15, 10, 0, 0).unwrap();

        for _ in 0..2 {
            backend
                .append_study_session(&StudySessionLog {
                    user_id: learner.clone(),
                    duration_minutes: u64::MAX,
                    topic: None,
                    date: now,
                })
                .await
                .unwrap();
        }

        let week = store.weekly_analytics_at(&learner, now).await.unwrap();
        assert_eq!(week[6].minutes, u64::MAX);
    }

    #[tokio::test]
    async fn test_weekly_analytics_empty_has_seven_zero_days() {
        let store = LearningStore::in_memory();
        let now = Utc.with_ymd_and_hms(2024, 5, 15, 10, 0, 0).unwrap();
        let week = store
            .weekly_analytics_at(&user("learner1"), now)
            .await
            .unwrap();

        assert_eq!(week.len(), 7);
        assert!(week.iter().all(|d| d.minutes == 0));
        assert_eq!(week[0].date, NaiveDate::from_ymd_opt(2024, 5, 9).unwrap());
        assert_eq!(week[6].date, NaiveDate::from_ymd_opt(2024, 5, 15).unwrap());
        assert_eq!(week[6].day, "Wed");
    }

    #[tokio::test]
    async fn test_weekly_analytics_buckets_by_day() {
        let backend = Arc::new(MemoryBackend::new());
        let store = LearningStore::new(backend.clone(), 5);
        let learner = user("learner1");
        let now = Utc.with_ymd_and_hms(2024, 5, 15, 10, 0, 0).unwrap();

        for (date, minutes) in [
            (Utc.with_ymd_and_hms(2024, 5, 15, 8, 0, 0).unwrap(), 20),
            (Utc.with_ymd_and_hms(2024, 5, 15, 9, 0, 0).unwrap(), 10),
            (Utc.with_ymd_and_hms(2024, 5, 10, 23, 59, 0).unwrap(), 45),
            (Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(), 99),
        ] {
            backend
                .append_study_session(&StudySessionLog {
                    user_id: learner.clone(),
                    duration_minutes: minutes,
                    topic: None,
                    date,
                })
                .await
                .unwrap();
        }

        let week = store.weekly_analytics_at(&learner, now).await.unwrap();
        let minutes: Vec<u64> = week.iter().map(|d| d.minutes).collect();
        assert_eq!(minutes, vec![0, 45, 0, 0, 0, 0, 30]);
    }

    #[tokio::test]
    async fn test_read_failure_leaves_state_untouched() {
        let backend = Arc::new(FlakyBackend::default());
        let store = LearningStore::new(backend.clone(), 5);
        let learner = user("learner1");

        backend.fail_reads.store(true, Ordering::SeqCst);
        let err = store.mark_mastered(&learner, "osmosis").await.unwrap_err();
        assert!(matches!(err, EruditeError::PersistenceFailed { .. }));

        backend.fail_reads.store(false, Ordering::SeqCst);
        let state = store.load(&learner).await.unwrap();
        assert!(state.mastered_concepts.is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_keeps_optimistic_update() {
        let backend = Arc::new(FlakyBackend::default());
        let store = LearningStore::new(backend.clone(), 5);
        let learner = user("learner1");
        store.load(&learner).await.unwrap();

        backend.fail_writes.store(true, Ordering::SeqCst);
        let err = store
            .record_misconception(&learner, "heavier objects fall faster", "they fall equally")
            .await
            .unwrap_err();
        assert!(matches!(err, EruditeError::PersistenceFailed { .. }));

        let cached = store.load(&learner).await.unwrap();
        assert_eq!(cached.misconceptions.len(), 1);
        assert!(backend.inner.fetch_state(&learner).await.unwrap().is_none());

        backend.fail_writes.store(false, Ordering::SeqCst);
        store.add_weak_concept(&learner, "gravity").await.unwrap();
        let persisted = backend.inner.fetch_state(&learner).await.unwrap().unwrap();
        assert_eq!(persisted.misconceptions.len(), 1);
        assert!(persisted.weak_concepts.contains("gravity"));
    }

    #[tokio::test]
    async fn test_overlapping_mutations_persist_latest_state() {
        let backend = Arc::new(SlowFirstWrite::default());
        let store = LearningStore::new(backend.clone(), 5);
        let learner = user("learner1");

        let (weak, mastered, logged) = tokio::join!(
            store.add_weak_concept(&learner, "osmosis"),
            store.mark_mastered(&learner, "diffusion"),
            store.log_study_session(&learner, 20, None),
        );
        weak.unwrap();
        mastered.unwrap();
        logged.unwrap();

        let cached = store.load(&learner).await.unwrap();
        let persisted = backend.inner.fetch_state(&learner).await.unwrap().unwrap();
        assert_eq!(persisted, cached);
        assert!(persisted.weak_concepts.contains("osmosis"));
        assert!(persisted.mastered_concepts.contains("diffusion"));
        assert_eq!(persisted.total_study_time, 20);
    }

    #[tokio::test]
    async fn test_parallel_mutations_on_json_backend() {
        let root = temp_root("parallel");
        let store = Arc::new(LearningStore::new(Arc::new(JsonFileBackend::new(&root)), 5));
        let learner = user("learner1");

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let store = Arc::clone(&store);
                let learner = learner.clone();
                tokio::spawn(async move {
                    store
                        .add_weak_concept(&learner, &format!("concept-{i}"))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let reopened = LearningStore::new(Arc::new(JsonFileBackend::new(&root)), 5);
        let state = reopened.load(&learner).await.unwrap();
        assert_eq!(state.weak_concepts.len(), 50);
        assert_eq!(state, store.load(&learner).await.unwrap());

        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn test_json_backend_concurrent_writers_use_distinct_temp_files() {
        let root = temp_root("writers");
        let backend = Arc::new(JsonFileBackend::new(&root));
        let learner = user("learner1");

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let backend = Arc::clone(&backend);
                let learner = learner.clone();
                tokio::spawn(async move {
                    let mut state = LearningState::default();
                    state.add_weak_concept(&format!("concept-{i}"));
                    backend.store_state(&learner, &state).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stored = backend.fetch_state(&learner).await.unwrap().unwrap();
        assert_eq!(stored.weak_concepts.len(), 1);

        let mut entries = tokio::fs::read_dir(root.join("learning_states")).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["learner1.json".to_string()]);

        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn test_weekly_analytics_surfaces_read_failure() {
        let backend = Arc::new(FlakyBackend::default());
        let store = LearningStore::new(backend.clone(), 5);
        backend.fail_reads.store(true, Ordering::SeqCst);

        let err = store.weekly_analytics(&user("learner1")).await.unwrap_err();
        assert!(matches!(err, EruditeError::PersistenceFailed { .. }));
    }

    #[tokio::test]
    async fn test_chat_history_newest_first() {
        let store = LearningStore::in_memory();
        let learner = user("learner1");
        let messages = vec![
            Message::new(1, Role::User, "hi"),
            Message::new(2, Role::Assistant, "hello"),
        ];

        let first = store
            .archive_chat(&learner, messages.clone(), Some("Biology".to_string()))
            .await
            .unwrap();
        let second = store.archive_chat(&learner, messages, None).await.unwrap();
        assert_eq!(first.message_count, 2);

        let history = store.chat_history(&learner).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].created_at >= history[1].created_at);
        assert!(history.iter().any(|r| r.id == second.id));
        assert!(store.chat_history(&user("other")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_file_backend_round_trip() {
        let root = temp_root("state");
        let backend = JsonFileBackend::new(&root);
        let learner = user("learner1");

        assert!(backend.fetch_state(&learner).await.unwrap().is_none());

        let mut state = LearningState::default();
        state.mark_mastered("osmosis");
        backend.store_state(&learner, &state).await.unwrap();

        let loaded = backend.fetch_state(&learner).await.unwrap().unwrap();
        assert!(loaded.mastered_concepts.contains("osmosis"));
        assert!(root.join("learning_states/learner1.json").exists());
        let mut entries = tokio::fs::read_dir(root.join("learning_states")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            assert!(!entry.file_name().to_string_lossy().ends_with(".tmp"));
        }

        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn test_json_file_backend_logs_append() {
        let root = temp_root("logs");
        let store = LearningStore::new(Arc::new(JsonFileBackend::new(&root)), 5);
        let learner = user("learner1");

        store.log_study_session(&learner, 15, None).await.unwrap();
        store.log_study_session(&learner, 5, None).await.unwrap();

        let week = store.weekly_analytics(&learner).await.unwrap();
        assert_eq!(week[6].minutes, 20);

        let contents = tokio::fs::read_to_string(root.join("study_sessions/learner1.jsonl"))
            .await
            .unwrap();
        assert_eq!(contents.lines().count(), 2);

        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn test_json_file_backend_corrupted_record() {
        let root = temp_root("corrupt");
        let backend = JsonFileBackend::new(&root);
        let learner = user("learner1");

        tokio::fs::create_dir_all(root.join("learning_states"))
            .await
            .unwrap();
        tokio::fs::write(root.join("learning_states/learner1.json"), "{oops")
            .await
            .unwrap();

        let err = backend.fetch_state(&learner).await.unwrap_err();
        assert!(matches!(err, EruditeError::RecordCorrupted { .. }));

        tokio::fs::remove_dir_all(&root).await.ok();
    }
}
