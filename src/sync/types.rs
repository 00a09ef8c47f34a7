// src/sync/types.rs
//! Core data model: request models and their fingerprints, canonical items,
//! subscription/column ids and per-subscription status.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::sync::error::RequestError;

/// Account used when a request model does not name one.
pub const DEFAULT_ACCOUNT: &str = "default";

fn default_account() -> String {
    DEFAULT_ACCOUNT.to_string()
}

/* ----------------------------
Ids
---------------------------- */

/// Content-addressed subscription id (`sub_` + 16 hex chars of the fingerprint hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn from_fingerprint(fingerprint: &str) -> Self {
        let digest = Sha256::digest(fingerprint.as_bytes());
        let mut out = String::with_capacity(4 + 16);
        out.push_str("sub_");
        for b in digest.iter().take(8) {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{:02x}", b);
        }
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnId(String);

impl ColumnId {
    pub fn generate() -> Self {
        Self(format!("col_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ColumnId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ColumnId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/* ----------------------------
Request model
---------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Notifications,
    IssueOrPr,
    Commits,
    Activity,
}

impl RequestKind {
    /// Page size used when the request model does not set `per_page`.
    pub fn default_per_page(self) -> u32 {
        match self {
            RequestKind::Notifications | RequestKind::Activity => 50,
            RequestKind::IssueOrPr | RequestKind::Commits => 10,
        }
    }
}

/// Primitive parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

/// Immutable description of one query against the external source.
///
/// Maps are `BTreeMap`s so the serde serialization is canonical (sorted keys);
/// that serialization is the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestModel {
    #[serde(rename = "type")]
    kind: RequestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subtype: Option<String>,
    #[serde(default)]
    params: BTreeMap<String, ParamValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    filters: BTreeMap<String, ParamValue>,
    #[serde(default = "default_account")]
    account: String,
}

/// Resolved REST endpoint of a request model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl RequestModel {
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            subtype: None,
            params: BTreeMap::new(),
            filters: BTreeMap::new(),
            account: default_account(),
        }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = account.into();
        self
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn subtype(&self) -> Option<&str> {
        self.subtype.as_deref()
    }

    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Canonical serialization used as the deduplication key.
    pub fn fingerprint(&self) -> String {
        // Struct fields serialize in declaration order and maps are sorted,
        // so equal models always produce equal strings.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        SubscriptionId::from_fingerprint(&self.fingerprint())
    }

    /// Requested page size, capped at 50.
    pub fn per_page(&self) -> u32 {
        let requested = match self.params.get("per_page") {
            Some(ParamValue::Int(n)) if *n > 0 => *n as u32,
            _ => self.kind.default_per_page(),
        };
        requested.min(50)
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        self.endpoint().map(|_| ())
    }

    /// Resolve the REST path; params not consumed by the path become query params.
    pub fn endpoint(&self) -> Result<Endpoint, RequestError> {
        let mut rest = self.params.clone();
        rest.remove("page");
        rest.remove("per_page");

        let path = match self.kind {
            RequestKind::Notifications => "/notifications".to_string(),
            RequestKind::Commits => {
                let (owner, repo) = take_owner_repo(&mut rest, self.kind)?;
                format!("/repos/{owner}/{repo}/commits")
            }
            RequestKind::IssueOrPr => {
                let (owner, repo) = take_owner_repo(&mut rest, self.kind)?;
                match self.subtype.as_deref() {
                    None | Some("ISSUES") => format!("/repos/{owner}/{repo}/issues"),
                    Some("PULLS") => format!("/repos/{owner}/{repo}/pulls"),
                    Some(other) => return Err(self.unknown_subtype(other)),
                }
            }
            RequestKind::Activity => match self.subtype.as_deref() {
                Some("PUBLIC_EVENTS") | None => "/events".to_string(),
                Some("REPO_EVENTS") => {
                    let (owner, repo) = take_owner_repo(&mut rest, self.kind)?;
                    format!("/repos/{owner}/{repo}/events")
                }
                Some("REPO_NETWORK_EVENTS") => {
                    let (owner, repo) = take_owner_repo(&mut rest, self.kind)?;
                    format!("/networks/{owner}/{repo}/events")
                }
                Some("ORG_PUBLIC_EVENTS") => {
                    let org = take_param(&mut rest, self.kind, "org")?;
                    format!("/orgs/{org}/events")
                }
                Some("USER_RECEIVED_EVENTS") => {
                    let user = take_param(&mut rest, self.kind, "username")?;
                    format!("/users/{user}/received_events")
                }
                Some("USER_RECEIVED_PUBLIC_EVENTS") => {
                    let user = take_param(&mut rest, self.kind, "username")?;
                    format!("/users/{user}/received_events/public")
                }
                Some("USER_EVENTS") => {
                    let user = take_param(&mut rest, self.kind, "username")?;
                    format!("/users/{user}/events")
                }
                Some("USER_PUBLIC_EVENTS") => {
                    let user = take_param(&mut rest, self.kind, "username")?;
                    format!("/users/{user}/events/public")
                }
                Some(other) => return Err(self.unknown_subtype(other)),
            },
        };

        let query = rest
            .into_iter()
            .map(|(k, v)| (k, v.to_string()))
            .collect();

        Ok(Endpoint {
            path: path.to_ascii_lowercase(),
            query,
        })
    }

    fn unknown_subtype(&self, subtype: &str) -> RequestError {
        RequestError::UnknownSubtype {
            kind: self.kind,
            subtype: subtype.to_string(),
        }
    }
}

fn take_param(
    rest: &mut BTreeMap<String, ParamValue>,
    kind: RequestKind,
    key: &str,
) -> Result<String, RequestError> {
    rest.remove(key)
        .map(|v| v.to_string().trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RequestError::MissingParam {
            kind,
            param: key.to_string(),
        })
}

fn take_owner_repo(
    rest: &mut BTreeMap<String, ParamValue>,
    kind: RequestKind,
) -> Result<(String, String), RequestError> {
    let owner = take_param(rest, kind, "owner")?;
    let repo = take_param(rest, kind, "repo")?;
    Ok((owner, repo))
}

/* ----------------------------
Items
---------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Notification,
    Issue,
    PullRequest,
    Commit,
    Event,
}

impl SourceType {
    pub fn prefix(self) -> &'static str {
        match self {
            SourceType::Notification => "notification",
            SourceType::Issue => "issue",
            SourceType::PullRequest => "pr",
            SourceType::Commit => "commit",
            SourceType::Event => "event",
        }
    }
}

/// Local user action applied to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    Read,
    Unread,
    Save,
    Unsave,
}

/// Canonical normalized feed record.
///
/// Read/saved state is derived from last-write timestamps so that the most
/// recent write wins when copies diverge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub source_type: SourceType,
    pub updated_at: DateTime<Utc>,
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    /// Unread flag as reported by the source (notifications only).
    #[serde(default)]
    pub source_unread: Option<bool>,
    #[serde(default)]
    pub last_read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_unread_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_unsaved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: Arc<serde_json::Value>,
}

impl Item {
    pub fn new(id: impl Into<String>, source_type: SourceType, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            source_type,
            updated_at,
            title: String::new(),
            url: None,
            repo: None,
            source_unread: None,
            last_read_at: None,
            last_unread_at: None,
            last_saved_at: None,
            last_unsaved_at: None,
            payload: Arc::new(serde_json::Value::Null),
        }
    }

    pub fn is_read(&self) -> bool {
        let latest = [self.last_read_at, self.last_unread_at, Some(self.updated_at)]
            .into_iter()
            .flatten()
            .max();
        if latest.is_some() && latest == self.last_read_at {
            return true;
        }
        if latest.is_some() && latest == self.last_unread_at {
            return false;
        }
        // The source version is the latest write.
        self.source_unread.map(|unread| !unread).unwrap_or(false)
    }

    pub fn is_saved(&self) -> bool {
        match (self.last_saved_at, self.last_unsaved_at) {
            (Some(saved), Some(unsaved)) => saved >= unsaved,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Apply a local mark. Returns `false` when the observable state already matches.
    pub fn apply_mark(&mut self, mark: Mark, now: DateTime<Utc>) -> bool {
        match mark {
            Mark::Read if !self.is_read() => {
                let stamp = next_stamp(now, [Some(self.updated_at), self.last_unread_at]);
                self.last_read_at = Some(stamp);
                true
            }
            Mark::Unread if self.is_read() => {
                let stamp = next_stamp(now, [Some(self.updated_at), self.last_read_at]);
                self.last_unread_at = Some(stamp);
                true
            }
            Mark::Save if !self.is_saved() => {
                self.last_saved_at = Some(next_stamp(now, [self.last_unsaved_at, None]));
                true
            }
            Mark::Unsave if self.is_saved() => {
                self.last_unsaved_at = Some(next_stamp(now, [self.last_saved_at, None]));
                true
            }
            _ => false,
        }
    }

    /// Take a newer source version. Local marks are kept.
    pub fn refresh_from(&mut self, newer: Item) -> bool {
        if newer.updated_at <= self.updated_at {
            return false;
        }
        self.updated_at = newer.updated_at;
        self.title = newer.title;
        self.url = newer.url;
        self.repo = newer.repo;
        self.source_unread = newer.source_unread;
        self.payload = newer.payload;
        true
    }

    /// Merge local marks from another copy of the same item (latest stamp per field).
    pub fn merge_marks_from(&mut self, other: &Item) {
        self.last_read_at = self.last_read_at.max(other.last_read_at);
        self.last_unread_at = self.last_unread_at.max(other.last_unread_at);
        self.last_saved_at = self.last_saved_at.max(other.last_saved_at);
        self.last_unsaved_at = self.last_unsaved_at.max(other.last_unsaved_at);
    }
}

/// `updated_at` descending, ties by id ascending.
pub fn feed_order(a: &Item, b: &Item) -> Ordering {
    b.updated_at
        .cmp(&a.updated_at)
        .then_with(|| a.id.cmp(&b.id))
}

// A stamp strictly later than every competing stamp, so the new write wins.
fn next_stamp(now: DateTime<Utc>, others: [Option<DateTime<Utc>>; 2]) -> DateTime<Utc> {
    match others.into_iter().flatten().max() {
        Some(latest) if latest >= now => latest + Duration::milliseconds(1),
        _ => now,
    }
}

/* ----------------------------
Subscription status
---------------------------- */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    Ok,
    AuthError {
        message: String,
    },
    NotFound {
        message: String,
    },
    Invalid {
        message: String,
    },
}

impl SubscriptionStatus {
    /// Fatal statuses are not polled automatically until a manual refresh.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SubscriptionStatus::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn fingerprint_ignores_param_insertion_order() {
        let a = RequestModel::new(RequestKind::IssueOrPr)
            .with_param("owner", "rust-lang")
            .with_param("repo", "rust")
            .with_param("state", "open");
        let b = RequestModel::new(RequestKind::IssueOrPr)
            .with_param("state", "open")
            .with_param("repo", "rust")
            .with_param("owner", "rust-lang");
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.subscription_id(), b.subscription_id());
        assert!(a.subscription_id().as_str().starts_with("sub_"));
        assert_eq!(a.subscription_id().as_str().len(), 4 + 16);
    }

    #[test]
    fn account_is_part_of_the_fingerprint() {
        let a = RequestModel::new(RequestKind::Notifications);
        let b = RequestModel::new(RequestKind::Notifications).with_account("work");
        assert_ne!(a.subscription_id(), b.subscription_id());
    }

    #[test]
    fn endpoint_consumes_path_params_and_keeps_the_rest() {
        let r = RequestModel::new(RequestKind::Activity)
            .with_subtype("USER_RECEIVED_EVENTS")
            .with_param("username", "Octocat")
            .with_param("per_page", 20i64);
        let ep = r.endpoint().unwrap();
        assert_eq!(ep.path, "/users/octocat/received_events");
        assert!(ep.query.is_empty());
        assert_eq!(r.per_page(), 20);

        let n = RequestModel::new(RequestKind::Notifications).with_param("all", true);
        let ep = n.endpoint().unwrap();
        assert_eq!(ep.path, "/notifications");
        assert_eq!(ep.query, vec![("all".to_string(), "true".to_string())]);
    }

    #[test]
    fn endpoint_reports_missing_params_and_unknown_subtypes() {
        let r = RequestModel::new(RequestKind::Commits).with_param("owner", "a");
        assert_eq!(
            r.validate(),
            Err(RequestError::MissingParam {
                kind: RequestKind::Commits,
                param: "repo".into()
            })
        );
        let r = RequestModel::new(RequestKind::Activity).with_subtype("NOPE");
        assert!(matches!(
            r.validate(),
            Err(RequestError::UnknownSubtype { .. })
        ));
    }

    #[test]
    fn request_model_round_trips_through_json() {
        let json = r#"{"type":"issue_or_pr","subtype":"PULLS","params":{"owner":"a","repo":"b"}}"#;
        let r: RequestModel = serde_json::from_str(json).unwrap();
        assert_eq!(r.kind(), RequestKind::IssueOrPr);
        assert_eq!(r.account(), DEFAULT_ACCOUNT);
        assert_eq!(r.endpoint().unwrap().path, "/repos/a/b/pulls");
    }

    #[test]
    fn read_state_follows_latest_write() {
        let mut it = Item::new("notification:1", SourceType::Notification, ts(0));
        it.source_unread = Some(true);
        assert!(!it.is_read());

        assert!(it.apply_mark(Mark::Read, ts(10)));
        assert!(it.is_read());
        // idempotent
        assert!(!it.apply_mark(Mark::Read, ts(20)));
        assert_eq!(it.last_read_at, Some(ts(10)));

        // a newer source version reporting unread wins over the older read mark
        let mut newer = Item::new("notification:1", SourceType::Notification, ts(30));
        newer.source_unread = Some(true);
        assert!(it.refresh_from(newer));
        assert!(!it.is_read());
    }

    #[test]
    fn marks_beat_future_dated_items() {
        let mut it = Item::new("event:1", SourceType::Event, ts(100));
        assert!(it.apply_mark(Mark::Read, ts(0)));
        assert!(it.is_read());
        assert!(it.apply_mark(Mark::Unread, ts(1)));
        assert!(!it.is_read());
    }

    #[test]
    fn save_and_unsave() {
        let mut it = Item::new("commit:abc", SourceType::Commit, ts(0));
        assert!(!it.is_saved());
        assert!(it.apply_mark(Mark::Save, ts(1)));
        assert!(it.is_saved());
        assert!(it.apply_mark(Mark::Unsave, ts(2)));
        assert!(!it.is_saved());
    }

    #[test]
    fn refresh_ignores_older_or_equal_versions_and_keeps_marks() {
        let mut it = Item::new("issue:a/b#1", SourceType::Issue, ts(10));
        it.apply_mark(Mark::Save, ts(11));
        let mut older = Item::new("issue:a/b#1", SourceType::Issue, ts(5));
        older.title = "old".into();
        assert!(!it.refresh_from(older));

        let mut newer = Item::new("issue:a/b#1", SourceType::Issue, ts(20));
        newer.title = "new".into();
        assert!(it.refresh_from(newer));
        assert_eq!(it.title, "new");
        assert!(it.is_saved());
    }

    #[test]
    fn feed_order_is_updated_desc_then_id_asc() {
        let a = Item::new("a", SourceType::Event, ts(1));
        let b = Item::new("b", SourceType::Event, ts(2));
        let c = Item::new("c", SourceType::Event, ts(2));
        let mut v = vec![a, c, b];
        v.sort_by(feed_order);
        let ids: Vec<_> = v.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["b", "c", "a"]);
    }
}
