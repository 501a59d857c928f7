//! Integration tests for tutoring sessions and persisted learning state.

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use erudite_model::{GenerateRequest, Generation, LanguageModel, ModelError};
use erudite_orchestrator::{
    create_router, AppState, Config, JsonFileBackend, LearningStore, UserId,
};
use serde_json::{json, Value};

/// Model that numbers its replies and can be slowed down.
#[derive(Default)]
struct CountingModel {
    calls: AtomicUsize,
    delay: Option<Duration>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl CountingModel {
    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    fn last_request(&self) -> GenerateRequest {
        self.requests
            .lock()
            .expect("requests lock")
            .last()
            .cloned()
            .expect("model was never called")
    }
}

#[async_trait]
impl LanguageModel for CountingModel {
    async fn generate(&self, request: GenerateRequest) -> Result<Generation, ModelError> {
        self.requests.lock().expect("requests lock").push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Generation {
            text: format!("answer {n}"),
            model: "counting".to_string(),
        })
    }

    fn model_id(&self) -> &str {
        "counting"
    }
}

/// Helper to find an available port for testing.
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Spawns the relay and returns its base URL.
async fn spawn_test_server(state: AppState) -> (String, tokio::task::JoinHandle<()>) {
    let port = find_available_port();
    let addr = format!("127.0.0.1:{port}");

    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://{addr}"), handle)
}

/// A fresh state directory under the system temp dir.
fn temp_state_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("erudite-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("Failed to create temp dir");
    dir
}

async fn send(method: reqwest::Method, url: String, body: Option<Value>) -> (u16, Value) {
    let mut request = reqwest::Client::new().request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request.send().await.expect("request failed");
    let status = response.status().as_u16();
    let json = if status == 204 {
        Value::Null
    } else {
        response.json().await.expect("response was not JSON")
    };
    (status, json)
}

async fn create_session(base: &str, body: Value) -> String {
    let (status, view) = send(
        reqwest::Method::POST,
        format!("{base}/api/sessions"),
        Some(body),
    )
    .await;
    assert_eq!(status, 201);
    view["id"].as_str().expect("session id").to_string()
}

// ============================================================================
// Session Lifecycle
// ============================================================================

#[tokio::test]
async fn test_multi_turn_session_replays_history() {
    let model = Arc::new(CountingModel::default());
    let state = AppState::new(
        Config::default(),
        model.clone(),
        Arc::new(LearningStore::in_memory()),
    );
    let (base, server) = spawn_test_server(state).await;
    let id = create_session(&base, json!({"documentContent": "Chapter 1: Limits"})).await;

    for question in ["What is a limit?", "Give an example"] {
        let (status, _) = send(
            reqwest::Method::POST,
            format!("{base}/api/sessions/{id}/turns"),
            Some(json!({"message": question})),
        )
        .await;
        assert_eq!(status, 200);
    }

    let request = model.last_request();
    assert_eq!(request.prompt, "Give an example");
    assert_eq!(request.history.len(), 2);
    assert_eq!(request.history[0].text, "What is a limit?");
    assert_eq!(request.history[1].text, "answer 1");

    let (_, view) = send(
        reqwest::Method::GET,
        format!("{base}/api/sessions/{id}"),
        None,
    )
    .await;
    assert_eq!(view["messages"].as_array().map(Vec::len), Some(4));
    assert_eq!(view["status"], "ready");
    assert_eq!(view["difficulty"], "beginner");

    server.abort();
}

#[tokio::test]
async fn test_concurrent_turn_is_rejected_as_busy() {
    let model = CountingModel::with_delay(Duration::from_millis(400));
    let state = AppState::new(
        Config::default(),
        model.clone(),
        Arc::new(LearningStore::in_memory()),
    );
    let (base, server) = spawn_test_server(state).await;
    let id = create_session(&base, json!({})).await;

    let first_url = format!("{base}/api/sessions/{id}/turns");
    let first = tokio::spawn(async move {
        send(
            reqwest::Method::POST,
            first_url,
            Some(json!({"message": "first"})),
        )
        .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (status, body) = send(
        reqwest::Method::POST,
        format!("{base}/api/sessions/{id}/turns"),
        Some(json!({"message": "second"})),
    )
    .await;
    assert_eq!(status, 409);
    assert!(body["error"].as_str().unwrap_or_default().contains("waiting"));

    let (_, view) = send(
        reqwest::Method::GET,
        format!("{base}/api/sessions/{id}"),
        None,
    )
    .await;
    assert_eq!(view["status"], "awaiting_response");

    let (status, body) = first.await.expect("first turn task panicked");
    assert_eq!(status, 200);
    assert_eq!(body["reply"], "answer 1");
    assert_eq!(body["messages"].as_array().map(Vec::len), Some(2));
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);

    server.abort();
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let model = CountingModel::with_delay(Duration::from_millis(100));
    let state = AppState::new(
        Config::default(),
        model.clone(),
        Arc::new(LearningStore::in_memory()),
    );
    let (base, server) = spawn_test_server(state).await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(create_session(&base, json!({})).await);
    }

    let turns = ids.iter().map(|id| {
        send(
            reqwest::Method::POST,
            format!("{base}/api/sessions/{id}/turns"),
            Some(json!({"message": "hello"})),
        )
    });
    let results = futures::future::join_all(turns).await;

    assert!(results.iter().all(|(status, _)| *status == 200));
    assert_eq!(model.calls.load(Ordering::SeqCst), 3);

    server.abort();
}

// ============================================================================
// Learning State Persistence
// ============================================================================

#[tokio::test]
async fn test_learning_state_survives_restart() {
    let dir = temp_state_dir();
    let model = Arc::new(CountingModel::default());

    let store = LearningStore::new(Arc::new(JsonFileBackend::new(dir.clone())), 5);
    let state = AppState::new(Config::default(), model.clone(), Arc::new(store));
    let (base, server) = spawn_test_server(state).await;

    let (status, _) = send(
        reqwest::Method::POST,
        format!("{base}/api/learning/learner-7/weak"),
        Some(json!({"concept": "integration by parts"})),
    )
    .await;
    assert_eq!(status, 200);

    let (status, _) = send(
        reqwest::Method::POST,
        format!("{base}/api/learning/learner-7/study-sessions"),
        Some(json!({"durationMinutes": 45, "topic": "calculus"})),
    )
    .await;
    assert_eq!(status, 200);
    server.abort();

    let reopened = LearningStore::new(Arc::new(JsonFileBackend::new(dir.clone())), 5);
    let learner = UserId::parse("learner-7").expect("valid user id");
    let state = reopened.load(&learner).await.expect("state should load");
    assert!(state.weak_concepts.contains("integration by parts"));
    assert_eq!(state.total_study_time, 45);
    assert_eq!(state.study_sessions, 1);

    let week = reopened
        .weekly_analytics(&learner)
        .await
        .expect("analytics should load");
    assert_eq!(week.iter().map(|d| d.minutes).sum::<u64>(), 45);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_parallel_learning_updates_all_persist() {
    let dir = temp_state_dir();
    let model = Arc::new(CountingModel::default());
    let store = LearningStore::new(Arc::new(JsonFileBackend::new(dir.clone())), 5);
    let state = AppState::new(Config::default(), model, Arc::new(store));
    let (base, server) = spawn_test_server(state).await;

    let updates = (0..30).map(|i| {
        send(
            reqwest::Method::POST,
            format!("{base}/api/learning/learner-9/weak"),
            Some(json!({"concept": format!("topic {i}")})),
        )
    });
    let results = futures::future::join_all(updates).await;
    assert!(results.iter().all(|(status, _)| *status == 200));

    let (status, _) = send(
        reqwest::Method::POST,
        format!("{base}/api/learning/learner-9/mastered"),
        Some(json!({"concept": "topic 0"})),
    )
    .await;
    assert_eq!(status, 200);
    server.abort();

    let reopened = LearningStore::new(Arc::new(JsonFileBackend::new(dir.clone())), 5);
    let learner = UserId::parse("learner-9").expect("valid user id");
    let state = reopened.load(&learner).await.expect("state should load");
    assert_eq!(state.weak_concepts.len(), 29);
    assert!(state.mastered_concepts.contains("topic 0"));
    assert!((1..30).all(|i| state.weak_concepts.contains(&format!("topic {i}"))));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_bound_session_archives_and_uses_history() {
    let dir = temp_state_dir();
    let model = Arc::new(CountingModel::default());
    let store = LearningStore::new(Arc::new(JsonFileBackend::new(dir.clone())), 5);
    let state = AppState::new(Config::default(), model.clone(), Arc::new(store));
    let (base, server) = spawn_test_server(state).await;

    send(
        reqwest::Method::POST,
        format!("{base}/api/learning/learner-8/misconceptions"),
        Some(json!({
            "concept": "heavier objects fall faster",
            "correction": "acceleration is independent of mass"
        })),
    )
    .await;

    let id = create_session(&base, json!({"userId": "learner-8", "difficulty": "exam"})).await;
    let (status, _) = send(
        reqwest::Method::POST,
        format!("{base}/api/sessions/{id}/turns"),
        Some(json!({"message": "Why do things fall?"})),
    )
    .await;
    assert_eq!(status, 200);

    let system = model.last_request().system.expect("system instruction");
    assert!(system.contains("heavier objects fall faster"));
    assert!(system.contains("DIFFICULTY: exam"));

    let (status, record) = send(
        reqwest::Method::POST,
        format!("{base}/api/sessions/{id}/archive"),
        Some(json!({"documentTitle": "Mechanics"})),
    )
    .await;
    assert_eq!(status, 201);
    assert_eq!(record["messageCount"], 2);

    let (status, chats) = send(
        reqwest::Method::GET,
        format!("{base}/api/learning/learner-8/chats"),
        None,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(chats.as_array().map(Vec::len), Some(1));
    assert_eq!(chats[0]["documentTitle"], "Mechanics");

    let (status, _) = send(
        reqwest::Method::DELETE,
        format!("{base}/api/sessions/{id}"),
        None,
    )
    .await;
    assert_eq!(status, 204);

    server.abort();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_uploaded_pages_ground_session_turns() {
    let model = Arc::new(CountingModel::default());
    let state = AppState::new(
        Config::default(),
        model.clone(),
        Arc::new(LearningStore::in_memory()),
    );
    let (base, server) = spawn_test_server(state).await;
    let id = create_session(&base, json!({})).await;

    let (status, view) = send(
        reqwest::Method::POST,
        format!("{base}/api/sessions/{id}/document"),
        Some(json!({"fileName": "optics.pdf", "pages": ["Refraction bends light.", "Lenses focus it."]})),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(view["document"]["pageCount"], 2);
    assert_eq!(view["document"]["fileName"], "optics.pdf");

    let (status, _) = send(
        reqwest::Method::POST,
        format!("{base}/api/sessions/{id}/turns"),
        Some(json!({"message": "Why do lenses work?"})),
    )
    .await;
    assert_eq!(status, 200);

    let system = model.last_request().system.expect("system instruction");
    assert!(system.contains("--- Page 1 ---\nRefraction bends light."));

    server.abort();
}
