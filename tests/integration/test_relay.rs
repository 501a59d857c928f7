//! Integration tests for the stateless relay endpoints.
//!
//! A real server is bound to a local port and driven over HTTP with a
//! scripted model standing in for the hosted one.

use std::collections::VecDeque;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use erudite_model::{GenerateRequest, Generation, LanguageModel, ModelError};
use erudite_orchestrator::{create_router, AppState, Config, LearningStore};
use serde_json::{json, Value};

/// Model that answers from a script and records what it was asked.
#[derive(Default)]
struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, u16>>>,
    requests: Mutex<Vec<GenerateRequest>>,
    delay: Option<Duration>,
}

impl ScriptedModel {
    fn new(replies: Vec<Result<&str, u16>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().map(|r| r.map(String::from)).collect()),
            ..Self::default()
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(&self, request: GenerateRequest) -> Result<Generation, ModelError> {
        self.requests.lock().expect("requests lock").push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.replies.lock().expect("replies lock").pop_front();
        match next {
            Some(Ok(text)) => Ok(Generation {
                text,
                model: "scripted".to_string(),
            }),
            Some(Err(status)) => Err(ModelError::HttpStatus {
                status,
                body: "scripted failure".to_string(),
            }),
            None => Ok(Generation {
                text: "default reply".to_string(),
                model: "scripted".to_string(),
            }),
        }
    }

    fn model_id(&self) -> &str {
        "scripted"
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

fn state_with(model: Arc<ScriptedModel>, config: Config) -> AppState {
    AppState::new(config, model, Arc::new(LearningStore::in_memory()))
}

async fn post(base: &str, path: &str, body: Value) -> (u16, Value) {
    let response = reqwest::Client::new()
        .post(format!("{base}{path}"))
        .json(&body)
        .send()
        .await
        .expect("request failed");
    let status = response.status().as_u16();
    let json = response.json().await.expect("response was not JSON");
    (status, json)
}

// ============================================================================
// Health and Chat
// ============================================================================

#[tokio::test]
async fn test_health_over_http() {
    let (base, server) = spawn_test_server(state_with(ScriptedModel::new(vec![]), Config::default())).await;

    let body: Value = reqwest::get(format!("{base}/api/health"))
        .await
        .expect("request failed")
        .json()
        .await
        .expect("response was not JSON");

    assert_eq!(body["status"], "ok");
    assert_eq!(body["message"], "Erudite backend is running");
    assert!(body["timestamp"].is_string());

    server.abort();
}

#[tokio::test]
async fn test_chat_relays_to_model() {
    let model = ScriptedModel::new(vec![Ok("Mitochondria make ATP.")]);
    let (base, server) = spawn_test_server(state_with(model.clone(), Config::default())).await;

    let (status, body) = post(&base, "/api/chat", json!({"message": "What do mitochondria do?"})).await;

    assert_eq!(status, 200);
    assert_eq!(body["reply"], "Mitochondria make ATP.");
    assert_eq!(body["model"], "scripted");
    assert_eq!(model.requests().len(), 1);

    server.abort();
}

#[tokio::test]
async fn test_chat_validation_never_reaches_model() {
    let model = ScriptedModel::new(vec![]);
    let (base, server) = spawn_test_server(state_with(model.clone(), Config::default())).await;

    let (status, body) = post(&base, "/api/chat", json!({"message": ["not", "a", "string"]})).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Message must be a string");

    let (status, body) = post(&base, "/api/chat/context", json!({"context": "notes"})).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Message is required");

    assert!(model.requests().is_empty());

    server.abort();
}

#[tokio::test]
async fn test_model_failure_is_reported_with_details() {
    let model = ScriptedModel::new(vec![Err(429)]);
    let (base, server) = spawn_test_server(state_with(model, Config::default())).await;

    let (status, body) = post(&base, "/api/chat/context", json!({"message": "hi"})).await;

    assert_eq!(status, 500);
    assert_eq!(body["error"], "Failed to process request");
    assert!(body["details"].as_str().unwrap_or_default().contains("429"));

    server.abort();
}

#[tokio::test]
async fn test_slow_model_times_out() {
    let config = Config {
        request_timeout_secs: 1,
        ..Config::default()
    };
    let model = ScriptedModel::slow(Duration::from_secs(3));
    let (base, server) = spawn_test_server(state_with(model, config)).await;

    let (status, body) = post(&base, "/api/chat", json!({"message": "hello?"})).await;

    assert_eq!(status, 500);
    assert_eq!(
        body["details"],
        "Erudite took too long to respond. Please try again."
    );

    server.abort();
}

// ============================================================================
// Document Analysis
// ============================================================================

#[tokio::test]
async fn test_document_endpoints_excerpt_long_content() {
    let config = Config {
        max_document_chars: 100,
        ..Config::default()
    };
    let model = ScriptedModel::new(vec![Ok("{\"nodes\": [], \"links\": []}"), Ok("# Plan")]);
    let (base, server) = spawn_test_server(state_with(model.clone(), config)).await;

    let content = format!("{}{}", "a".repeat(100), "TAIL-MARKER");
    let (status, body) = post(&base, "/api/concept-map", json!({"content": content})).await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"nodes": [], "links": []}));

    let (status, body) = post(
        &base,
        "/api/study-plan",
        json!({"content": content, "weakConcepts": ["recursion", "pointers"]}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["studyPlan"], "# Plan");

    let requests = model.requests();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert!(!request.prompt.contains("TAIL-MARKER"));
    }
    assert!(requests[1].prompt.contains("recursion, pointers"));

    server.abort();
}

#[tokio::test]
async fn test_parallel_relay_requests() {
    let model = ScriptedModel::slow(Duration::from_millis(100));
    let (base, server) = spawn_test_server(state_with(model.clone(), Config::default())).await;

    let requests = (0..5).map(|i| {
        let base = base.clone();
        async move { post(&base, "/api/chat", json!({"message": format!("question {i}")})).await }
    });
    let results = futures::future::join_all(requests).await;

    assert!(results.iter().all(|(status, _)| *status == 200));
    assert_eq!(model.requests().len(), 5);

    server.abort();
}

#[tokio::test]
async fn test_cors_preflight_over_http() {
    let (base, server) = spawn_test_server(state_with(ScriptedModel::new(vec![]), Config::default())).await;

    let response = reqwest::Client::new()
        .request(reqwest::Method::OPTIONS, format!("{base}/api/chat"))
        .header("Origin", "http://localhost:3000")
        .header("Access-Control-Request-Method", "POST")
        .send()
        .await
        .expect("request failed");

    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("http://localhost:3000")
    );

    server.abort();
}
