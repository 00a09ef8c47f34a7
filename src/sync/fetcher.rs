// src/sync/fetcher.rs
//! One paginated request for one subscription.
//!
//! The fetcher is the only writer of cursors and of item sets coming from the
//! network. It never loops over pages itself; the scheduler decides how many
//! pages a cycle fetches and checks for cancellation between them.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::FetchConfig;
use crate::sync::cursor::{CursorStore, PageAdvance};
use crate::sync::error::FetchError;
use crate::sync::http::{HttpClient, HttpRequest, HttpResponse, ResponseMeta, TokenProvider};
use crate::sync::normalize::normalize_page;
use crate::sync::rate_limit::{RateLimiter, Reservation};
use crate::sync::registry::SubscriptionRegistry;
use crate::sync::types::{SubscriptionId, SubscriptionStatus};

const FALLBACK_RESET_SECS: i64 = 60;
const API_VERSION: &str = "2022-11-28";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMode {
    /// Page 1 with the stored ETag; refreshes the newest items.
    Head,
    /// Next older page from the stored page token.
    Next,
}

impl PageMode {
    fn label(self) -> &'static str {
        match self {
            PageMode::Head => "head",
            PageMode::Next => "next",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageReport {
    pub page: u32,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub has_more: bool,
    /// The cursor moved to a deeper page.
    pub advanced: bool,
}

impl PageReport {
    pub fn changed(&self) -> bool {
        self.inserted + self.updated > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Page(PageReport),
    /// Head page unchanged since the stored ETag.
    NotModified,
    /// The account budget is exhausted; nothing was sent.
    RateLimited { reset_at: DateTime<Utc> },
}

pub struct Fetcher {
    api_base: String,
    http: Arc<dyn HttpClient>,
    tokens: Arc<dyn TokenProvider>,
    limiter: Arc<RateLimiter>,
    cursors: Arc<CursorStore>,
    registry: Arc<SubscriptionRegistry>,
}

impl Fetcher {
    pub fn new(
        cfg: &FetchConfig,
        http: Arc<dyn HttpClient>,
        tokens: Arc<dyn TokenProvider>,
        limiter: Arc<RateLimiter>,
        cursors: Arc<CursorStore>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            http,
            tokens,
            limiter,
            cursors,
            registry,
        }
    }

    /// Fetch the next older page (page 1 if the subscription was never fetched).
    pub async fn fetch_next_page(
        &self,
        id: &SubscriptionId,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError> {
        self.fetch(id, PageMode::Next, cancel).await
    }

    /// Poll the head page with `If-None-Match`.
    pub async fn fetch_head(
        &self,
        id: &SubscriptionId,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError> {
        self.fetch(id, PageMode::Head, cancel).await
    }

    /// Once `cancel` fires, nothing from this call reaches the registry or
    /// the cursor store; the subscription may already belong to a new owner.
    pub async fn fetch(
        &self,
        id: &SubscriptionId,
        mode: PageMode,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError> {
        crate::sync::ensure_metrics_described();

        let result = self.fetch_inner(id, mode, cancel).await;
        let outcome = match &result {
            Ok(FetchOutcome::Page(_)) => "ok",
            Ok(FetchOutcome::NotModified) => "not_modified",
            Ok(FetchOutcome::RateLimited { .. }) => "rate_limited",
            Err(e) => e.label(),
        };
        counter!("sync_fetch_total", "mode" => mode.label(), "outcome" => outcome).increment(1);

        if let Err(e) = &result {
            if let (Some(status), false) = (e.subscription_status(), cancel.is_cancelled()) {
                tracing::warn!(target: "sync", subscription = %id, error = %e, "subscription needs attention");
                self.registry.set_status(id, status);
            } else {
                tracing::debug!(target: "sync", subscription = %id, error = %e, "fetch failed");
            }
        }
        result
    }

    async fn fetch_inner(
        &self,
        id: &SubscriptionId,
        mode: PageMode,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError> {
        let cancelled = || FetchError::Cancelled(id.clone());
        let request = self
            .registry
            .request(id)
            .ok_or_else(|| FetchError::Cancelled(id.clone()))?;
        let cursor = self.cursors.get(id);
        let page = match mode {
            PageMode::Head => 1,
            PageMode::Next if cursor.never_fetched() => 1,
            PageMode::Next => cursor.next_page(),
        };

        let now = Utc::now();
        if let Reservation::Denied { reset_at } = self.limiter.reserve(request.account(), now) {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            self.cursors.record_rate_limited(id, reset_at);
            counter!("sync_rate_limited_total", "reason" => "budget").increment(1);
            return Ok(FetchOutcome::RateLimited { reset_at });
        }

        let token = self.tokens.token(request.account()).await?;
        let endpoint = request
            .endpoint()
            .map_err(|e| FetchError::InvalidRequest {
                status: 0,
                message: e.to_string(),
            })?;

        let per_page = request.per_page();
        let mut query = endpoint.query.clone();
        query.push(("per_page".to_string(), per_page.to_string()));
        query.push(("page".to_string(), page.to_string()));
        let url = reqwest::Url::parse_with_params(&format!("{}{}", self.api_base, endpoint.path), &query)
            .map_err(|e| FetchError::InvalidRequest {
                status: 0,
                message: e.to_string(),
            })?;

        let mut req = HttpRequest::get(url.as_str())
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .header("Authorization", format!("Bearer {token}"));
        if page == 1 {
            if let (PageMode::Head, Some(etag)) = (mode, cursor.etag.as_deref()) {
                req = req.header("If-None-Match", etag);
            }
        }

        let started = Instant::now();
        let resp = self.http.request(req).await;
        histogram!("sync_fetch_ms").record(started.elapsed().as_secs_f64() * 1000.0);
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                self.cursors.record_failure(id);
                return Err(e.into());
            }
        };

        let meta = ResponseMeta::from_response(&resp);
        self.limiter
            .record_response(request.account(), meta.rate_remaining, meta.rate_reset_at);
        let now = Utc::now();

        match resp.status {
            304 => {
                self.cursors.record_not_modified(id, now);
                Ok(FetchOutcome::NotModified)
            }
            200..=299 => {
                let body: Value = match serde_json::from_str(&resp.body) {
                    Ok(v) => v,
                    Err(e) => {
                        self.cursors.record_failure(id);
                        return Err(FetchError::Malformed(e.to_string()));
                    }
                };
                let Some(normalized) = normalize_page(&request, &body) else {
                    self.cursors.record_failure(id);
                    return Err(FetchError::Malformed("page body has no record list".into()));
                };

                let has_more = match resp.header("link") {
                    Some(_) => meta.next_page.is_some(),
                    None => normalized.records as u32 >= per_page,
                };
                let next_token = meta
                    .next_page
                    .clone()
                    .or_else(|| has_more.then(|| (page + 1).to_string()));
                let skipped = normalized.malformed;

                let stats = self
                    .registry
                    .upsert_items_if(id, normalized.items, || !cancel.is_cancelled())
                    .ok_or_else(cancelled)?;
                counter!("sync_items_upserted_total").increment((stats.inserted + stats.updated) as u64);

                let advanced = self.cursors.advance(
                    id,
                    PageAdvance {
                        page,
                        next_token,
                        etag: meta.etag.clone(),
                        has_more,
                        poll_interval_secs: meta.poll_interval_secs,
                    },
                    now,
                );
                self.registry.set_status(id, SubscriptionStatus::Ok);

                tracing::debug!(
                    target: "sync",
                    subscription = %id,
                    page,
                    inserted = stats.inserted,
                    updated = stats.updated,
                    skipped,
                    has_more,
                    "page applied"
                );
                Ok(FetchOutcome::Page(PageReport {
                    page,
                    inserted: stats.inserted,
                    updated: stats.updated,
                    skipped,
                    has_more,
                    advanced,
                }))
            }
            401 => Err(FetchError::Auth(error_message(&resp))),
            403 | 429 if resp.status == 429 || meta.budget_exhausted() || meta.retry_after_secs.is_some() => {
                let reset_at = meta
                    .rate_reset_at
                    .filter(|r| *r > now)
                    .or_else(|| meta.retry_after_secs.map(|s| now + Duration::seconds(s as i64)))
                    .unwrap_or_else(|| now + Duration::seconds(FALLBACK_RESET_SECS));
                self.limiter.mark_exhausted(request.account(), reset_at);
                self.cursors.record_rate_limited(id, reset_at);
                counter!("sync_rate_limited_total", "reason" => "response").increment(1);
                Err(FetchError::RateLimited { reset_at })
            }
            403 => Err(FetchError::Auth(error_message(&resp))),
            404 | 410 => Err(FetchError::NotFound(error_message(&resp))),
            status @ 400..=499 => Err(FetchError::InvalidRequest {
                status,
                message: error_message(&resp),
            }),
            status => {
                self.cursors.record_failure(id);
                Err(FetchError::Network(format!(
                    "status {status}: {}",
                    error_message(&resp)
                )))
            }
        }
    }
}

/// `message` field of a JSON error body, else the (truncated) body.
fn error_message(resp: &HttpResponse) -> String {
    serde_json::from_str::<Value>(&resp.body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| resp.body.chars().take(200).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::error::TransportError;
    use crate::sync::http::StaticTokens;
    use crate::sync::types::{ColumnId, RequestKind, RequestModel};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays queued responses and records the requests it saw.
    #[derive(Default)]
    struct Scripted {
        responses: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl Scripted {
        fn push(&self, r: Result<HttpResponse, TransportError>) {
            self.responses.lock().unwrap().push_back(r);
        }
    }

    #[async_trait]
    impl HttpClient for Scripted {
        async fn request(&self, req: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.seen.lock().unwrap().push(req);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError("script exhausted".into())))
        }
    }

    struct Rig {
        http: Arc<Scripted>,
        limiter: Arc<RateLimiter>,
        cursors: Arc<CursorStore>,
        registry: Arc<SubscriptionRegistry>,
        fetcher: Fetcher,
        id: SubscriptionId,
        cancel: CancellationToken,
    }

    fn rig() -> Rig {
        let http = Arc::new(Scripted::default());
        let limiter = Arc::new(RateLimiter::new());
        let cursors = Arc::new(CursorStore::new());
        let registry = Arc::new(SubscriptionRegistry::new(Duration::seconds(30)));
        let id = registry
            .attach(&ColumnId::from("c"), &RequestModel::new(RequestKind::Notifications))
            .id;
        cursors.ensure(&id);
        let fetcher = Fetcher::new(
            &FetchConfig {
                api_base: "https://api.test/".into(),
                ..FetchConfig::default()
            },
            http.clone(),
            Arc::new(StaticTokens::new().with("default", "t0k")),
            limiter.clone(),
            cursors.clone(),
            registry.clone(),
        );
        Rig {
            http,
            limiter,
            cursors,
            registry,
            fetcher,
            id,
            cancel: CancellationToken::new(),
        }
    }

    fn notifications(ids: &[&str]) -> String {
        let v: Vec<Value> = ids
            .iter()
            .map(|id| {
                serde_json::json!({
                    "id": id,
                    "unread": true,
                    "updated_at": "2025-09-06T09:00:00Z",
                    "subject": { "title": format!("n{id}") },
                    "repository": { "full_name": "o/r" }
                })
            })
            .collect();
        serde_json::to_string(&v).unwrap()
    }

    #[tokio::test]
    async fn success_advances_cursor_and_reports_has_more_from_link() {
        let r = rig();
        r.http.push(Ok(HttpResponse::new(200, notifications(&["1", "2"]))
            .with_header("Link", r#"<https://api.test/notifications?page=2>; rel="next""#)
            .with_header("ETag", "\"e1\"")
            .with_header("X-RateLimit-Remaining", "99")
            .with_header("X-RateLimit-Reset", "4000000000")));

        let out = r.fetcher.fetch_next_page(&r.id, &r.cancel).await.unwrap();
        let FetchOutcome::Page(report) = out else { panic!("expected page, got {out:?}") };
        assert_eq!(report.inserted, 2);
        assert!(report.has_more && report.advanced);

        let c = r.cursors.get(&r.id);
        assert_eq!(c.page, 1);
        assert_eq!(c.page_token.as_deref(), Some("2"));
        assert_eq!(c.etag.as_deref(), Some("\"e1\""));
        assert_eq!(r.limiter.remaining("default"), Some(99));

        let seen = r.http.seen.lock().unwrap();
        assert!(seen[0].url.starts_with("https://api.test/notifications?"));
        assert!(seen[0].url.contains("per_page=50"));
        assert_eq!(seen[0].header_value("authorization"), Some("Bearer t0k"));
    }

    #[tokio::test]
    async fn head_poll_sends_etag_and_handles_not_modified() {
        let r = rig();
        r.http.push(Ok(HttpResponse::new(200, notifications(&["1"])).with_header("ETag", "\"e1\"")));
        r.fetcher.fetch_next_page(&r.id, &r.cancel).await.unwrap();

        r.http.push(Ok(HttpResponse::new(304, "")));
        let out = r.fetcher.fetch_head(&r.id, &r.cancel).await.unwrap();
        assert_eq!(out, FetchOutcome::NotModified);
        let seen = r.http.seen.lock().unwrap();
        assert_eq!(seen[1].header_value("if-none-match"), Some("\"e1\""));
    }

    #[tokio::test]
    async fn transient_failures_count_and_do_not_advance() {
        let r = rig();
        r.http.push(Err(TransportError("connection reset".into())));
        r.http.push(Ok(HttpResponse::new(502, "bad gateway")));
        r.http.push(Ok(HttpResponse::new(200, "not json")));

        for _ in 0..3 {
            let err = r.fetcher.fetch_next_page(&r.id, &r.cancel).await.unwrap_err();
            assert!(err.is_retryable(), "{err:?}");
        }
        let c = r.cursors.get(&r.id);
        assert_eq!(c.consecutive_failures, 3);
        assert!(c.never_fetched());
        assert_eq!(r.registry.status(&r.id), Some(SubscriptionStatus::Ok));
    }

    #[tokio::test]
    async fn auth_failure_is_fatal_and_sets_status() {
        let r = rig();
        r.http.push(Ok(HttpResponse::new(401, r#"{"message":"Bad credentials"}"#)));
        let err = r.fetcher.fetch_next_page(&r.id, &r.cancel).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(
            r.registry.status(&r.id),
            Some(SubscriptionStatus::AuthError {
                message: "Bad credentials".into()
            })
        );
    }

    #[tokio::test]
    async fn exhausted_budget_short_circuits_without_network() {
        let r = rig();
        let reset = Utc::now() + Duration::minutes(5);
        r.limiter.mark_exhausted("default", reset);
        let out = r.fetcher.fetch_next_page(&r.id, &r.cancel).await.unwrap();
        assert_eq!(out, FetchOutcome::RateLimited { reset_at: reset });
        assert!(r.http.seen.lock().unwrap().is_empty());
        assert_eq!(r.cursors.get(&r.id).rate_limit_reset_at, Some(reset));
    }

    #[tokio::test]
    async fn server_rate_limit_marks_the_account_exhausted() {
        let r = rig();
        r.http.push(Ok(HttpResponse::new(403, r#"{"message":"API rate limit exceeded"}"#)
            .with_header("X-RateLimit-Remaining", "0")
            .with_header("X-RateLimit-Reset", "4000000000")));
        let err = r.fetcher.fetch_next_page(&r.id, &r.cancel).await.unwrap_err();
        assert!(matches!(err, FetchError::RateLimited { .. }));
        assert_eq!(r.limiter.remaining("default"), Some(0));
        assert_eq!(r.registry.status(&r.id), Some(SubscriptionStatus::Ok));
    }

    #[tokio::test]
    async fn evicted_subscription_is_cancelled() {
        let r = rig();
        r.registry.detach(&ColumnId::from("c"), &r.id, Utc::now() - Duration::hours(1));
        r.registry.evict_expired(Utc::now());
        let err = r.fetcher.fetch_next_page(&r.id, &r.cancel).await.unwrap_err();
        assert!(matches!(err, FetchError::Cancelled(_)));
    }

    #[tokio::test]
    async fn response_arriving_after_cancel_is_discarded() {
        let r = rig();
        r.http.push(Ok(HttpResponse::new(200, notifications(&["1", "2"]))));
        r.cancel.cancel();

        let err = r.fetcher.fetch_next_page(&r.id, &r.cancel).await.unwrap_err();
        assert!(matches!(err, FetchError::Cancelled(_)));
        assert_eq!(r.http.seen.lock().unwrap().len(), 1);
        assert_eq!(r.registry.item_count(&r.id), 0);
        assert!(r.cursors.get(&r.id).never_fetched());
    }

    #[tokio::test]
    async fn cancelled_failure_leaves_status_and_cursor_alone() {
        let r = rig();
        r.http.push(Ok(HttpResponse::new(401, r#"{"message":"Bad credentials"}"#)));
        r.cancel.cancel();

        r.fetcher.fetch_next_page(&r.id, &r.cancel).await.unwrap_err();
        assert_eq!(r.registry.status(&r.id), Some(SubscriptionStatus::Ok));
        assert_eq!(r.cursors.get(&r.id).consecutive_failures, 0);
    }
}
