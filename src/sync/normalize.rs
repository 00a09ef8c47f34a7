// src/sync/normalize.rs
//! Raw source records → canonical [`Item`].
//!
//! Every supported record shape is a closed variant with its own serde
//! struct. A record that does not deserialize into the shape expected for its
//! request is reported as [`MalformedRecord`] and skipped; the rest of the
//! page is still applied.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Deserialize;
use serde_json::Value;

use crate::sync::error::MalformedRecord;
use crate::sync::normalize_title;
use crate::sync::types::{Item, ParamValue, RequestKind, RequestModel, SourceType};

#[derive(Debug, Deserialize)]
struct RepoFullName {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct NotificationSubject {
    title: String,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NotificationRecord {
    id: String,
    #[serde(default)]
    unread: Option<bool>,
    updated_at: DateTime<Utc>,
    subject: NotificationSubject,
    repository: RepoFullName,
}

#[derive(Debug, Deserialize)]
struct IssueRecord {
    number: u64,
    title: String,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    repository_url: Option<String>,
    /// Present when the issues endpoint returns a pull request.
    #[serde(default)]
    pull_request: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PullBase {
    repo: Option<RepoFullName>,
}

#[derive(Debug, Deserialize)]
struct PullRecord {
    number: u64,
    title: String,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    base: Option<PullBase>,
}

#[derive(Debug, Deserialize)]
struct CommitSignature {
    date: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    message: String,
    #[serde(default)]
    committer: Option<CommitSignature>,
    #[serde(default)]
    author: Option<CommitSignature>,
}

#[derive(Debug, Deserialize)]
struct CommitRecord {
    sha: String,
    #[serde(default)]
    html_url: Option<String>,
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct EventRepo {
    name: String,
}

#[derive(Debug, Deserialize)]
struct EventActor {
    login: String,
}

#[derive(Debug, Deserialize)]
struct EventRecord {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    created_at: DateTime<Utc>,
    repo: EventRepo,
    #[serde(default)]
    actor: Option<EventActor>,
}

/// Closed set of supported record shapes.
#[derive(Debug)]
enum SourceRecord {
    Notification(NotificationRecord),
    Issue(IssueRecord),
    PullRequest(PullRecord),
    Commit(CommitRecord),
    Event(EventRecord),
}

impl SourceRecord {
    fn parse(shape: SourceType, raw: &Value) -> Result<Self, serde_json::Error> {
        Ok(match shape {
            SourceType::Notification => SourceRecord::Notification(NotificationRecord::deserialize(raw)?),
            SourceType::Issue => SourceRecord::Issue(IssueRecord::deserialize(raw)?),
            SourceType::PullRequest => SourceRecord::PullRequest(PullRecord::deserialize(raw)?),
            SourceType::Commit => SourceRecord::Commit(CommitRecord::deserialize(raw)?),
            SourceType::Event => SourceRecord::Event(EventRecord::deserialize(raw)?),
        })
    }

    fn into_item(self, ctx_repo: Option<&str>, raw: Arc<Value>) -> Result<Item, String> {
        let mut item = match self {
            SourceRecord::Notification(n) => {
                let mut it = Item::new(
                    format!("{}:{}", SourceType::Notification.prefix(), n.id),
                    SourceType::Notification,
                    n.updated_at,
                );
                it.title = n.subject.title;
                it.url = n.subject.url;
                it.repo = Some(n.repository.full_name);
                it.source_unread = n.unread;
                it
            }
            SourceRecord::Issue(i) => {
                let repo = i
                    .repository_url
                    .as_deref()
                    .and_then(repo_from_api_url)
                    .or_else(|| ctx_repo.map(str::to_string))
                    .ok_or("issue without repository")?;
                let source_type = if i.pull_request.is_some() {
                    SourceType::PullRequest
                } else {
                    SourceType::Issue
                };
                let mut it = Item::new(
                    numbered_id(source_type, &repo, i.number),
                    source_type,
                    i.updated_at,
                );
                it.title = i.title;
                it.url = i.html_url;
                it.repo = Some(repo);
                it
            }
            SourceRecord::PullRequest(p) => {
                let repo = p
                    .base
                    .and_then(|b| b.repo)
                    .map(|r| r.full_name)
                    .or_else(|| ctx_repo.map(str::to_string))
                    .ok_or("pull request without repository")?;
                let mut it = Item::new(
                    numbered_id(SourceType::PullRequest, &repo, p.number),
                    SourceType::PullRequest,
                    p.updated_at,
                );
                it.title = p.title;
                it.url = p.html_url;
                it.repo = Some(repo);
                it
            }
            SourceRecord::Commit(c) => {
                let date = c
                    .commit
                    .committer
                    .or(c.commit.author)
                    .map(|s| s.date)
                    .ok_or("commit without committer or author date")?;
                let mut it = Item::new(
                    format!("{}:{}", SourceType::Commit.prefix(), c.sha),
                    SourceType::Commit,
                    date,
                );
                it.title = c.commit.message.lines().next().unwrap_or_default().to_string();
                it.url = c.html_url;
                it.repo = ctx_repo.map(str::to_string);
                it
            }
            SourceRecord::Event(e) => {
                let mut it = Item::new(
                    format!("{}:{}", SourceType::Event.prefix(), e.id),
                    SourceType::Event,
                    e.created_at,
                );
                it.title = match e.actor {
                    Some(a) => format!("{} {} {}", a.login, e.kind, e.repo.name),
                    None => format!("{} {}", e.kind, e.repo.name),
                };
                it.repo = Some(e.repo.name);
                it
            }
        };
        item.title = normalize_title(&item.title);
        item.payload = raw;
        Ok(item)
    }
}

/// `issue:{owner/repo}#{n}` / `pr:{owner/repo}#{n}`; repo is lowercased so both
/// endpoints agree on the id.
fn numbered_id(source_type: SourceType, repo: &str, number: u64) -> String {
    format!(
        "{}:{}#{}",
        source_type.prefix(),
        repo.to_ascii_lowercase(),
        number
    )
}

/// `https://api.github.com/repos/{owner}/{repo}` → `owner/repo`.
fn repo_from_api_url(url: &str) -> Option<String> {
    let (_, tail) = url.split_once("/repos/")?;
    let mut parts = tail.split('/').filter(|p| !p.is_empty());
    let owner = parts.next()?;
    let repo = parts.next()?;
    Some(format!("{owner}/{repo}"))
}

/// Record shape a request's pages are expected to contain.
pub fn shape_for(request: &RequestModel) -> SourceType {
    match request.kind() {
        RequestKind::Notifications => SourceType::Notification,
        RequestKind::IssueOrPr if request.subtype() == Some("PULLS") => SourceType::PullRequest,
        RequestKind::IssueOrPr => SourceType::Issue,
        RequestKind::Commits => SourceType::Commit,
        RequestKind::Activity => SourceType::Event,
    }
}

/// Normalize one raw record.
pub fn normalize(
    shape: SourceType,
    raw: &Value,
    ctx_repo: Option<&str>,
) -> Result<Item, MalformedRecord> {
    let malformed = |reason: String| MalformedRecord {
        source_type: shape,
        reason,
    };
    let record = SourceRecord::parse(shape, raw).map_err(|e| malformed(e.to_string()))?;
    record
        .into_item(ctx_repo, Arc::new(raw.clone()))
        .map_err(malformed)
}

/// Normalized page plus the number of records that had to be skipped.
#[derive(Debug, Default)]
pub struct NormalizedPage {
    pub items: Vec<Item>,
    pub records: usize,
    pub malformed: usize,
}

/// Normalize a page body. Returns `None` if the body has no record list at all.
///
/// Bodies are either a JSON array or a search envelope `{ "items": [...] }`.
pub fn normalize_page(request: &RequestModel, body: &Value) -> Option<NormalizedPage> {
    let records = match body {
        Value::Array(v) => v,
        Value::Object(map) => map.get("items")?.as_array()?,
        _ => return None,
    };

    let shape = shape_for(request);
    let ctx_repo = context_repo(request);
    let mut page = NormalizedPage {
        items: Vec::with_capacity(records.len()),
        records: records.len(),
        malformed: 0,
    };

    for raw in records {
        match normalize(shape, raw, ctx_repo.as_deref()) {
            Ok(item) => page.items.push(item),
            Err(e) => {
                tracing::warn!(target: "sync", error = %e, "skipping malformed record");
                counter!("sync_malformed_records_total", "source" => shape.prefix()).increment(1);
                page.malformed += 1;
            }
        }
    }
    Some(page)
}

fn context_repo(request: &RequestModel) -> Option<String> {
    let params = request.params();
    match (params.get("owner"), params.get("repo")) {
        (Some(ParamValue::Str(o)), Some(ParamValue::Str(r))) => Some(format!("{o}/{r}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn issues_request() -> RequestModel {
        RequestModel::new(RequestKind::IssueOrPr)
            .with_param("owner", "Rust-Lang")
            .with_param("repo", "Rust")
    }

    #[test]
    fn notification_maps_unread_flag_and_repo() {
        let raw = json!({
            "id": "123",
            "unread": true,
            "updated_at": "2025-09-06T09:00:00Z",
            "subject": { "title": "  Bump\n deps ", "url": "https://api.github.com/x", "type": "PullRequest" },
            "repository": { "full_name": "octo/hello" }
        });
        let it = normalize(SourceType::Notification, &raw, None).unwrap();
        assert_eq!(it.id, "notification:123");
        assert_eq!(it.title, "Bump deps");
        assert_eq!(it.repo.as_deref(), Some("octo/hello"));
        assert_eq!(it.source_unread, Some(true));
        assert!(!it.is_read());
        assert_eq!(it.payload.as_ref(), &raw);
    }

    #[test]
    fn pull_request_ids_agree_across_endpoints() {
        let via_issues = json!({
            "number": 7,
            "title": "Add feature",
            "updated_at": "2025-09-06T09:00:00Z",
            "repository_url": "https://api.github.com/repos/Rust-Lang/Rust",
            "pull_request": { "url": "https://api.github.com/repos/rust-lang/rust/pulls/7" }
        });
        let via_pulls = json!({
            "number": 7,
            "title": "Add feature",
            "updated_at": "2025-09-06T09:00:00Z",
            "base": { "repo": { "full_name": "rust-lang/rust" } }
        });
        let a = normalize(SourceType::Issue, &via_issues, None).unwrap();
        let b = normalize(SourceType::PullRequest, &via_pulls, None).unwrap();
        assert_eq!(a.source_type, SourceType::PullRequest);
        assert_eq!(a.id, "pr:rust-lang/rust#7");
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn commit_uses_first_message_line_and_context_repo() {
        let raw = json!({
            "sha": "abc123",
            "commit": {
                "message": "Fix parser\n\nLong body",
                "committer": { "date": "2025-09-06T10:00:00Z" }
            }
        });
        let it = normalize(SourceType::Commit, &raw, Some("a/b")).unwrap();
        assert_eq!(it.id, "commit:abc123");
        assert_eq!(it.title, "Fix parser");
        assert_eq!(it.repo.as_deref(), Some("a/b"));
    }

    #[test]
    fn event_title_names_actor_type_and_repo() {
        let raw = json!({
            "id": "999",
            "type": "PushEvent",
            "created_at": "2025-09-06T11:00:00Z",
            "repo": { "name": "octo/hello" },
            "actor": { "login": "octocat" }
        });
        let it = normalize(SourceType::Event, &raw, None).unwrap();
        assert_eq!(it.id, "event:999");
        assert_eq!(it.title, "octocat PushEvent octo/hello");
    }

    #[test]
    fn malformed_records_are_skipped_not_fatal() {
        let body = json!([
            { "number": 1, "title": "ok", "updated_at": "2025-09-06T09:00:00Z" },
            { "number": "not-a-number", "title": "bad" },
            { "title": "missing number", "updated_at": "2025-09-06T09:00:00Z" }
        ]);
        let page = normalize_page(&issues_request(), &body).unwrap();
        assert_eq!(page.records, 3);
        assert_eq!(page.malformed, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, "issue:rust-lang/rust#1");
    }

    #[test]
    fn search_envelope_and_non_list_bodies() {
        let body = json!({ "total_count": 1, "items": [
            { "number": 2, "title": "t", "updated_at": "2025-09-06T09:00:00Z" }
        ]});
        let page = normalize_page(&issues_request(), &body).unwrap();
        assert_eq!(page.items.len(), 1);

        assert!(normalize_page(&issues_request(), &json!({ "message": "x" })).is_none());
        assert!(normalize_page(&issues_request(), &json!("nope")).is_none());
    }
}
