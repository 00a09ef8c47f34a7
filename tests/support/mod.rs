// tests/support/mod.rs
//
// Shared helpers for integration tests: a scripted HttpClient keyed by URL
// path, engine builders and JSON page generators.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use column_sync::config::SyncConfig;
use column_sync::sync::error::TransportError;
use column_sync::sync::http::{HttpClient, HttpRequest, HttpResponse, StaticTokens};
use column_sync::sync::persist::StateStore;
use column_sync::SyncEngine;

/// Scripted responses per path. Queued responses are used first, then the
/// sticky one; unknown paths get a 404.
#[derive(Default)]
pub struct FakeHttp {
    queued: Mutex<HashMap<String, VecDeque<Result<HttpResponse, TransportError>>>>,
    sticky: Mutex<HashMap<String, HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeHttp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Response returned for every request to `path` once the queue is empty.
    pub fn respond(&self, path: &str, resp: HttpResponse) {
        self.sticky.lock().unwrap().insert(path.to_string(), resp);
    }

    pub fn enqueue(&self, path: &str, resp: Result<HttpResponse, TransportError>) {
        self.queued
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(resp);
    }

    /// Block requests until permits are added to the returned semaphore.
    pub fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| path_of(&r.url) == path)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for FakeHttp {
    async fn request(&self, req: HttpRequest) -> Result<HttpResponse, TransportError> {
        let path = path_of(&req.url);
        self.requests.lock().unwrap().push(req);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let permit = gate.acquire().await.expect("gate closed");
            permit.forget();
        }

        if let Some(r) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&path)
            .and_then(|q| q.pop_front())
        {
            return r;
        }
        Ok(self
            .sticky
            .lock()
            .unwrap()
            .get(&path)
            .cloned()
            .unwrap_or_else(|| HttpResponse::new(404, r#"{"message":"Not Found"}"#)))
    }
}

/// `https://host/a/b?x=1` → `/a/b`
pub fn path_of(url: &str) -> String {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let path = rest.find('/').map(|i| &rest[i..]).unwrap_or("/");
    path.split('?').next().unwrap_or(path).to_string()
}

pub fn test_config() -> SyncConfig {
    let mut cfg = SyncConfig::default();
    cfg.fetch.api_base = "https://api.test".into();
    cfg.schedule.jitter_ms = 0;
    cfg.schedule.backoff_base_ms = 50;
    cfg.schedule.backoff_cap_secs = 1;
    cfg.registry.grace_secs = 0;
    cfg.persist.state_path = None;
    cfg
}

pub fn engine(http: Arc<FakeHttp>) -> Arc<SyncEngine> {
    engine_with(test_config(), http, None)
}

pub fn engine_with(
    cfg: SyncConfig,
    http: Arc<FakeHttp>,
    store: Option<Arc<dyn StateStore>>,
) -> Arc<SyncEngine> {
    let tokens = StaticTokens::new()
        .with("default", "test-token")
        .with("work", "work-token");
    SyncEngine::new(cfg, http, Arc::new(tokens), store)
}

pub fn ok(body: impl Into<String>) -> HttpResponse {
    HttpResponse::new(200, body)
        .with_header("X-RateLimit-Remaining", "4999")
        .with_header("X-RateLimit-Reset", "4102444800")
}

pub fn notification(id: &str, updated_at: DateTime<Utc>, unread: bool) -> Value {
    json!({
        "id": id,
        "unread": unread,
        "updated_at": updated_at.to_rfc3339(),
        "subject": { "title": format!("notification {id}"), "type": "Issue" },
        "repository": { "full_name": "octo/hello" }
    })
}

pub fn issue(repo: &str, number: u64, updated_at: DateTime<Utc>) -> Value {
    json!({
        "number": number,
        "title": format!("issue {number}"),
        "updated_at": updated_at.to_rfc3339(),
        "repository_url": format!("https://api.github.com/repos/{repo}")
    })
}

pub fn page(records: Vec<Value>) -> String {
    Value::Array(records).to_string()
}

pub fn fixture(name: &str) -> String {
    let path = format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"));
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("read {path}: {e}"))
}
