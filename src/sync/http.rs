// src/sync/http.rs
//! Outbound collaborators: HTTP client, token provider, response metadata.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;

use crate::config::FetchConfig;
use crate::sync::error::{AuthError, TransportError};
use crate::sync::types::DEFAULT_ACCOUNT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are stored lowercase.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn request(&self, req: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Production client backed by `reqwest`.
pub struct ReqwestClient {
    http: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(cfg: &FetchConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.as_str())
            .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("building reqwest client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn request(&self, req: HttpRequest) -> Result<HttpResponse, TransportError> {
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|e| TransportError(e.to_string()))?;
        let mut rb = self.http.request(method, &req.url);
        for (k, v) in &req.headers {
            rb = rb.header(k.as_str(), v.as_str());
        }
        if let Some(body) = req.body {
            rb = rb.body(body);
        }

        let resp = rb
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = resp
            .text()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self, account: &str) -> Result<String, AuthError>;
}

/// Fixed account → token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account names are case-insensitive.
    pub fn with(mut self, account: impl Into<String>, token: impl Into<String>) -> Self {
        self.tokens.insert(account.into().to_ascii_lowercase(), token.into());
        self
    }

    /// `GITHUB_TOKEN` for the default account, `GITHUB_TOKEN_<ACCOUNT>` for named ones.
    pub fn from_env() -> Self {
        let mut tokens = HashMap::new();
        for (k, v) in std::env::vars() {
            if v.trim().is_empty() {
                continue;
            }
            if k == "GITHUB_TOKEN" {
                tokens.insert(DEFAULT_ACCOUNT.to_string(), v);
            } else if let Some(account) = k.strip_prefix("GITHUB_TOKEN_") {
                tokens.insert(account.to_ascii_lowercase(), v);
            }
        }
        Self { tokens }
    }
}

#[async_trait]
impl TokenProvider for StaticTokens {
    async fn token(&self, account: &str) -> Result<String, AuthError> {
        self.tokens
            .get(&account.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| AuthError {
                account: account.to_string(),
            })
    }
}

/* ----------------------------
Response metadata
---------------------------- */

/// Pagination and rate-limit information carried by response headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub rate_remaining: Option<u32>,
    pub rate_reset_at: Option<DateTime<Utc>>,
    pub retry_after_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub etag: Option<String>,
    /// Page token of the `rel="next"` link.
    pub next_page: Option<String>,
}

impl ResponseMeta {
    pub fn from_response(resp: &HttpResponse) -> Self {
        let num = |name: &str| resp.header(name).and_then(|v| v.trim().parse::<u64>().ok());
        Self {
            rate_remaining: num("x-ratelimit-remaining").map(|v| v.min(u32::MAX as u64) as u32),
            rate_reset_at: num("x-ratelimit-reset")
                .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single()),
            retry_after_secs: num("retry-after"),
            poll_interval_secs: num("x-poll-interval"),
            etag: resp.header("etag").map(str::to_string),
            next_page: resp.header("link").and_then(next_page_from_link),
        }
    }

    pub fn budget_exhausted(&self) -> bool {
        self.rate_remaining == Some(0)
    }
}

/// Extract the page number of the `rel="next"` entry of a `Link` header.
pub fn next_page_from_link(link: &str) -> Option<String> {
    static RE_NEXT: OnceCell<Regex> = OnceCell::new();
    static RE_PAGE: OnceCell<Regex> = OnceCell::new();
    let re_next =
        RE_NEXT.get_or_init(|| Regex::new(r#"<([^>]+)>\s*;\s*rel="next""#).expect("link regex"));
    let re_page = RE_PAGE.get_or_init(|| Regex::new(r"[?&]page=(\d+)").expect("page regex"));

    let url = re_next.captures(link)?.get(1)?.as_str();
    re_page
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}
