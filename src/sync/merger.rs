// src/sync/merger.rs
//! Column feed: union of the column's subscription item sets, deduplicated by
//! item id (latest `updated_at` wins), filtered, ordered `updated_at` desc
//! with ties by id asc.
//!
//! Each subscription already keeps its items feed-ordered, so the feed is a
//! lazy k-way merge over those snapshots. Taking a prefix only touches as
//! many items as it needs, and the feed can be iterated again from the start.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sync::types::{feed_order, Item, SourceType};

/// `name -> include` switches. A `false` entry hides that name. Any `true`
/// entry makes the record strict: names not marked `true` are hidden, and so
/// are items the name does not apply to. Names compare ASCII
/// case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterRecord(BTreeMap<String, bool>);

impl FilterRecord {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_strict(&self) -> bool {
        self.0.values().any(|v| *v)
    }

    pub fn get(&self, name: &str) -> Option<bool> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }

    pub fn passes(&self, name: Option<&str>) -> bool {
        match name.and_then(|n| self.get(n)) {
            Some(include) => include,
            None => !self.is_strict(),
        }
    }
}

impl<S: Into<String>, const N: usize> From<[(S, bool); N]> for FilterRecord {
    fn from(entries: [(S, bool); N]) -> Self {
        Self(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnFilters {
    /// `Some(true)` unread only, `Some(false)` read only.
    pub unread: Option<bool>,
    pub saved: Option<bool>,
    /// Items not updated after this watermark are hidden unless saved.
    pub cleared_at: Option<DateTime<Utc>>,
    pub source_types: Option<Vec<SourceType>>,
    /// Case-insensitive substring on title or repo.
    pub query: Option<String>,
    /// Keyed by repository owner.
    #[serde(skip_serializing_if = "FilterRecord::is_empty")]
    pub owners: FilterRecord,
    /// Keyed by `owner/repo`. An explicit entry wins over the owner's.
    #[serde(skip_serializing_if = "FilterRecord::is_empty")]
    pub repos: FilterRecord,
    /// `open`, `closed` or `merged`; only issues and pull requests have one.
    #[serde(skip_serializing_if = "FilterRecord::is_empty")]
    pub state: FilterRecord,
    /// Pull requests only. `Some(true)` also hides everything that is not a PR.
    pub draft: Option<bool>,
    /// Unknown visibility counts as public.
    pub private: Option<bool>,
    /// `Issue`, `PullRequest`, `Commit`, `Release`, ... per item.
    #[serde(skip_serializing_if = "FilterRecord::is_empty")]
    pub subject_types: FilterRecord,
    #[serde(skip_serializing_if = "NotificationFilters::is_empty")]
    pub notifications: NotificationFilters,
    #[serde(skip_serializing_if = "ActivityFilters::is_empty")]
    pub activity: ActivityFilters,
}

/// Applied to notification items only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationFilters {
    /// Keyed by notification reason (`mention`, `review_requested`, ...).
    pub reasons: FilterRecord,
    /// Hide `subscribed` and `security_alert` notifications.
    pub participating: bool,
}

impl NotificationFilters {
    pub fn is_empty(&self) -> bool {
        self.reasons.is_empty() && !self.participating
    }
}

/// Applied to activity events only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityFilters {
    /// Keyed by the event's `payload.action` (`opened`, `closed`, ...).
    pub actions: FilterRecord,
}

impl ActivityFilters {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl ColumnFilters {
    pub fn matches(&self, item: &Item) -> bool {
        if let Some(cleared) = self.cleared_at {
            if item.updated_at <= cleared && !item.is_saved() {
                return false;
            }
        }
        if let Some(unread) = self.unread {
            if item.is_read() == unread {
                return false;
            }
        }
        if let Some(saved) = self.saved {
            if item.is_saved() != saved {
                return false;
            }
        }
        if let Some(types) = &self.source_types {
            if !types.is_empty() && !types.contains(&item.source_type) {
                return false;
            }
        }
        if !self.owner_or_repo_passes(item.repo.as_deref()) {
            return false;
        }
        if !self.state.passes(item_state(item)) {
            return false;
        }
        if let Some(draft) = self.draft {
            match item_draft(item) {
                Some(d) if d != draft => return false,
                None if draft => return false,
                _ => {}
            }
        }
        if let Some(private) = self.private {
            if item_private(item) != private {
                return false;
            }
        }
        if !self.subject_types.passes(subject_type(item).as_deref()) {
            return false;
        }
        match item.source_type {
            SourceType::Notification => {
                let reason = item.payload.get("reason").and_then(Value::as_str);
                if !self.notifications.reasons.passes(reason) {
                    return false;
                }
                if self.notifications.participating
                    && matches!(reason, Some("subscribed" | "security_alert"))
                {
                    return false;
                }
            }
            SourceType::Event => {
                let action = item.payload.pointer("/payload/action").and_then(Value::as_str);
                if !self.activity.actions.passes(action) {
                    return false;
                }
            }
            _ => {}
        }
        if let Some(q) = self.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            let q = q.to_lowercase();
            let hit = item.title.to_lowercase().contains(&q)
                || item
                    .repo
                    .as_deref()
                    .is_some_and(|r| r.to_lowercase().contains(&q));
            if !hit {
                return false;
            }
        }
        true
    }

    fn owner_or_repo_passes(&self, repo: Option<&str>) -> bool {
        if self.owners.is_empty() && self.repos.is_empty() {
            return true;
        }
        let Some(full) = repo else {
            return !self.owners.is_strict() && !self.repos.is_strict();
        };
        let owner = full.split_once('/').map_or(full, |(o, _)| o);
        match (self.repos.get(full), self.owners.get(owner)) {
            (Some(include), _) => include,
            (None, Some(include)) => include,
            (None, None) => !self.owners.is_strict() && !self.repos.is_strict(),
        }
    }
}

fn item_state(item: &Item) -> Option<&'static str> {
    if !matches!(item.source_type, SourceType::Issue | SourceType::PullRequest) {
        return None;
    }
    let p = item.payload.as_ref();
    let merged = [p.get("merged_at"), p.pointer("/pull_request/merged_at")]
        .into_iter()
        .flatten()
        .any(|v| !v.is_null());
    if merged {
        return Some("merged");
    }
    match p.get("state").and_then(Value::as_str) {
        Some("open") => Some("open"),
        Some("closed") => Some("closed"),
        _ => None,
    }
}

fn item_draft(item: &Item) -> Option<bool> {
    if item.source_type != SourceType::PullRequest {
        return None;
    }
    Some(item.payload.get("draft").and_then(Value::as_bool).unwrap_or(false))
}

fn item_private(item: &Item) -> bool {
    let p = item.payload.as_ref();
    if let Some(public) = p.get("public").and_then(Value::as_bool) {
        return !public;
    }
    ["/repository/private", "/repo/private"]
        .into_iter()
        .find_map(|ptr| p.pointer(ptr).and_then(Value::as_bool))
        .unwrap_or(false)
}

fn subject_type(item: &Item) -> Option<Cow<'static, str>> {
    let p = item.payload.as_ref();
    let name = match item.source_type {
        SourceType::Notification => {
            return p
                .pointer("/subject/type")
                .and_then(Value::as_str)
                .map(|s| Cow::Owned(s.to_string()));
        }
        SourceType::Issue => "Issue",
        SourceType::PullRequest => "PullRequest",
        SourceType::Commit => "Commit",
        SourceType::Event => match p.get("type").and_then(Value::as_str)? {
            "IssuesEvent" | "IssueCommentEvent" => {
                if p.pointer("/payload/issue/pull_request").is_some() {
                    "PullRequest"
                } else {
                    "Issue"
                }
            }
            "PullRequestEvent"
            | "PullRequestReviewEvent"
            | "PullRequestReviewCommentEvent"
            | "PullRequestReviewThreadEvent" => "PullRequest",
            "PushEvent" | "CommitCommentEvent" => "Commit",
            "ReleaseEvent" => "Release",
            "CreateEvent" | "DeleteEvent" => match p.pointer("/payload/ref_type").and_then(Value::as_str) {
                Some("branch") => "Branch",
                Some("tag") => "Tag",
                _ => "Repository",
            },
            "ForkEvent" | "WatchEvent" | "PublicEvent" => "Repository",
            "MemberEvent" => "User",
            "GollumEvent" => "Wiki",
            _ => return None,
        },
    };
    Some(Cow::Borrowed(name))
}

/// Derived, never stored, view over a column's subscriptions.
#[derive(Debug, Clone, Default)]
pub struct MergedFeed {
    sources: Vec<Arc<Vec<Item>>>,
    filters: ColumnFilters,
}

impl MergedFeed {
    /// `sources` must each be feed-ordered with unique ids.
    pub fn new(sources: Vec<Arc<Vec<Item>>>, filters: ColumnFilters) -> Self {
        Self { sources, filters }
    }

    pub fn iter(&self) -> MergeIter<'_> {
        let mut heap = BinaryHeap::with_capacity(self.sources.len());
        for (src, items) in self.sources.iter().enumerate() {
            if let Some(item) = items.first() {
                heap.push(Head { item, src, pos: 0 });
            }
        }
        MergeIter {
            sources: &self.sources,
            filters: &self.filters,
            heap,
            seen: HashSet::new(),
        }
    }

    pub fn take(&self, n: usize) -> Vec<Item> {
        self.iter().take(n).cloned().collect()
    }

    pub fn to_vec(&self) -> Vec<Item> {
        self.iter().cloned().collect()
    }

    /// Ids of every visible item.
    pub fn ids(&self) -> HashSet<String> {
        self.iter().map(|it| it.id.clone()).collect()
    }
}

struct Head<'a> {
    item: &'a Item,
    src: usize,
    pos: usize,
}

// Max-heap: the item that comes first in feed order is the greatest.
impl Ord for Head<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        feed_order(other.item, self.item).then_with(|| other.src.cmp(&self.src))
    }
}

impl PartialOrd for Head<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Head<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head<'_> {}

pub struct MergeIter<'a> {
    sources: &'a [Arc<Vec<Item>>],
    filters: &'a ColumnFilters,
    heap: BinaryHeap<Head<'a>>,
    seen: HashSet<&'a str>,
}

impl<'a> Iterator for MergeIter<'a> {
    type Item = &'a Item;

    fn next(&mut self) -> Option<&'a Item> {
        while let Some(head) = self.heap.pop() {
            let next = head.pos + 1;
            if let Some(item) = self.sources[head.src].get(next) {
                self.heap.push(Head {
                    item,
                    src: head.src,
                    pos: next,
                });
            }
            // The first copy popped has the latest updated_at.
            if !self.seen.insert(head.item.id.as_str()) {
                continue;
            }
            if self.filters.matches(head.item) {
                return Some(head.item);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::types::Mark;
    use chrono::TimeZone;
    use serde_json::json;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_757_000_000 + secs, 0).unwrap()
    }

    fn item(id: &str, at: i64) -> Item {
        Item::new(id, SourceType::Notification, t(at))
    }

    fn src(mut v: Vec<Item>) -> Arc<Vec<Item>> {
        v.sort_by(feed_order);
        Arc::new(v)
    }

    fn ids(items: &[Item]) -> Vec<&str> {
        items.iter().map(|i| i.id.as_str()).collect()
    }

    #[test]
    fn newer_item_first() {
        let feed = MergedFeed::new(vec![src(vec![item("a", 1), item("b", 2)])], ColumnFilters::default());
        assert_eq!(ids(&feed.to_vec()), ["b", "a"]);
    }

    #[test]
    fn duplicates_keep_the_latest_copy() {
        let mut stale = item("x", 1);
        stale.title = "stale".into();
        let mut fresh = item("x", 9);
        fresh.title = "fresh".into();
        let feed = MergedFeed::new(
            vec![
                src(vec![stale, item("y", 5)]),
                src(vec![fresh, item("z", 5)]),
            ],
            ColumnFilters::default(),
        );
        let out = feed.to_vec();
        assert_eq!(ids(&out), ["x", "y", "z"]);
        assert_eq!(out[0].title, "fresh");
        assert_eq!(out[0].updated_at, t(9));
    }

    #[test]
    fn prefix_and_restart() {
        let feed = MergedFeed::new(
            vec![
                src((0..100).map(|i| item(&format!("a{i:03}"), i * 2)).collect()),
                src((0..100).map(|i| item(&format!("b{i:03}"), i * 2 + 1)).collect()),
            ],
            ColumnFilters::default(),
        );
        assert_eq!(ids(&feed.take(3)), ["b099", "a099", "b098"]);
        // a fresh iterator starts from the top again
        assert_eq!(feed.iter().next().map(|i| i.id.as_str()), Some("b099"));
        assert_eq!(feed.to_vec().len(), 200);
    }

    #[test]
    fn filters_apply_after_dedup() {
        let mut read = item("r", 2);
        read.apply_mark(Mark::Read, t(3));
        let mut saved = item("s", 0);
        saved.apply_mark(Mark::Save, t(1));
        let sources = vec![src(vec![read, saved, item("u", 1)])];

        let unread_only = ColumnFilters {
            unread: Some(true),
            ..ColumnFilters::default()
        };
        let feed = MergedFeed::new(sources.clone(), unread_only);
        assert_eq!(ids(&feed.to_vec()), ["u", "s"]);

        // clear hides everything up to the watermark except saved items
        let cleared = ColumnFilters {
            cleared_at: Some(t(2)),
            ..ColumnFilters::default()
        };
        let feed = MergedFeed::new(sources.clone(), cleared);
        assert_eq!(ids(&feed.to_vec()), ["s"]);

        let query = ColumnFilters {
            query: Some("O/R".into()),
            ..ColumnFilters::default()
        };
        let mut with_repo = item("q", 0);
        with_repo.repo = Some("o/r".into());
        let feed = MergedFeed::new(vec![src(vec![with_repo, item("n", 1)])], query);
        assert_eq!(ids(&feed.to_vec()), ["q"]);
    }

    fn raw(id: &str, source_type: SourceType, repo: &str, payload: Value) -> Item {
        let mut it = Item::new(id, source_type, t(0));
        it.repo = Some(repo.into());
        it.payload = Arc::new(payload);
        it
    }

    fn visible(filters: ColumnFilters, items: &[Item]) -> Vec<String> {
        items
            .iter()
            .filter(|i| filters.matches(i))
            .map(|i| i.id.clone())
            .collect()
    }

    #[test]
    fn filter_record_switches() {
        let off = FilterRecord::from([("bot", false)]);
        assert!(!off.passes(Some("Bot")));
        assert!(off.passes(Some("human")));
        assert!(off.passes(None));

        let strict = FilterRecord::from([("open", true), ("closed", false)]);
        assert!(strict.passes(Some("open")));
        assert!(!strict.passes(Some("merged")));
        assert!(!strict.passes(None));
    }

    #[test]
    fn owner_and_repo_filters() {
        let items = [
            raw("a", SourceType::Issue, "octo/hello", json!({})),
            raw("b", SourceType::Issue, "octo/noise", json!({})),
            raw("c", SourceType::Issue, "other/x", json!({})),
            Item::new("d", SourceType::Issue, t(0)),
        ];

        let exclude_repo = ColumnFilters {
            repos: FilterRecord::from([("octo/noise", false)]),
            ..ColumnFilters::default()
        };
        assert_eq!(visible(exclude_repo, &items), ["a", "c", "d"]);

        let only_owner = ColumnFilters {
            owners: FilterRecord::from([("OCTO", true)]),
            ..ColumnFilters::default()
        };
        assert_eq!(visible(only_owner, &items), ["a", "b"]);

        // a repo entry wins over its owner's
        let owner_minus_repo = ColumnFilters {
            owners: FilterRecord::from([("octo", true)]),
            repos: FilterRecord::from([("octo/noise", false), ("other/x", true)]),
            ..ColumnFilters::default()
        };
        assert_eq!(visible(owner_minus_repo, &items), ["a", "c"]);
    }

    #[test]
    fn state_and_draft_filters() {
        let items = [
            raw("open", SourceType::Issue, "o/r", json!({ "state": "open" })),
            raw("closed", SourceType::Issue, "o/r", json!({ "state": "closed" })),
            raw(
                "merged",
                SourceType::PullRequest,
                "o/r",
                json!({ "state": "closed", "merged_at": "2025-09-06T09:00:00Z" }),
            ),
            raw(
                "listed-merged",
                SourceType::PullRequest,
                "o/r",
                json!({ "state": "closed", "pull_request": { "merged_at": "2025-09-06T09:00:00Z" } }),
            ),
            raw("draft", SourceType::PullRequest, "o/r", json!({ "state": "open", "draft": true })),
            raw("note", SourceType::Notification, "o/r", json!({})),
        ];

        let merged = ColumnFilters {
            state: FilterRecord::from([("merged", true)]),
            ..ColumnFilters::default()
        };
        assert_eq!(visible(merged, &items), ["merged", "listed-merged"]);

        // without a `true` entry items that have no state stay visible
        let not_closed = ColumnFilters {
            state: FilterRecord::from([("closed", false)]),
            ..ColumnFilters::default()
        };
        assert_eq!(
            visible(not_closed, &items),
            ["open", "merged", "listed-merged", "draft", "note"]
        );

        let drafts = ColumnFilters {
            draft: Some(true),
            ..ColumnFilters::default()
        };
        assert_eq!(visible(drafts, &items), ["draft"]);

        let no_drafts = ColumnFilters {
            draft: Some(false),
            ..ColumnFilters::default()
        };
        assert_eq!(visible(no_drafts, &items).len(), 5);
    }

    #[test]
    fn subject_type_and_private_filters() {
        let items = [
            raw(
                "n-release",
                SourceType::Notification,
                "o/r",
                json!({ "subject": { "type": "Release" }, "repository": { "private": true } }),
            ),
            raw("n-issue", SourceType::Notification, "o/r", json!({ "subject": { "type": "Issue" } })),
            raw("e-push", SourceType::Event, "o/r", json!({ "type": "PushEvent", "public": true })),
            raw(
                "e-tag",
                SourceType::Event,
                "o/r",
                json!({ "type": "CreateEvent", "public": false, "payload": { "ref_type": "tag" } }),
            ),
            raw("pr", SourceType::PullRequest, "o/r", json!({})),
        ];

        let subjects = ColumnFilters {
            subject_types: FilterRecord::from([("Release", true), ("Tag", true), ("PullRequest", true)]),
            ..ColumnFilters::default()
        };
        assert_eq!(visible(subjects, &items), ["n-release", "e-tag", "pr"]);

        let no_commits = ColumnFilters {
            subject_types: FilterRecord::from([("commit", false)]),
            ..ColumnFilters::default()
        };
        assert_eq!(visible(no_commits, &items), ["n-release", "n-issue", "e-tag", "pr"]);

        let private = ColumnFilters {
            private: Some(true),
            ..ColumnFilters::default()
        };
        assert_eq!(visible(private, &items), ["n-release", "e-tag"]);
    }

    #[test]
    fn notification_reason_and_activity_action_filters() {
        let items = [
            raw("mention", SourceType::Notification, "o/r", json!({ "reason": "mention" })),
            raw("sub", SourceType::Notification, "o/r", json!({ "reason": "subscribed" })),
            raw("review", SourceType::Notification, "o/r", json!({ "reason": "review_requested" })),
            raw("opened", SourceType::Event, "o/r", json!({ "type": "IssuesEvent", "payload": { "action": "opened" } })),
            raw("closed", SourceType::Event, "o/r", json!({ "type": "IssuesEvent", "payload": { "action": "closed" } })),
        ];

        let reasons = ColumnFilters {
            notifications: NotificationFilters {
                reasons: FilterRecord::from([("mention", true), ("review_requested", true)]),
                participating: false,
            },
            ..ColumnFilters::default()
        };
        // events are not affected by notification filters
        assert_eq!(visible(reasons, &items), ["mention", "review", "opened", "closed"]);

        let participating = ColumnFilters {
            notifications: NotificationFilters {
                participating: true,
                ..NotificationFilters::default()
            },
            ..ColumnFilters::default()
        };
        assert_eq!(visible(participating, &items), ["mention", "review", "opened", "closed"]);

        let actions = ColumnFilters {
            activity: ActivityFilters {
                actions: FilterRecord::from([("closed", false)]),
            },
            ..ColumnFilters::default()
        };
        assert_eq!(visible(actions, &items), ["mention", "sub", "review", "opened"]);
    }

    #[test]
    fn filters_deserialize_from_partial_json() {
        let f: ColumnFilters = serde_json::from_value(json!({
            "unread": true,
            "repos": { "octo/noise": false },
            "notifications": { "reasons": { "mention": true } }
        }))
        .unwrap();
        assert_eq!(f.unread, Some(true));
        assert_eq!(f.repos.get("octo/noise"), Some(false));
        assert!(f.notifications.reasons.is_strict());
        assert!(!f.notifications.participating);
        assert!(f.state.is_empty());

        let out = serde_json::to_value(&ColumnFilters::default()).unwrap();
        assert!(out.get("owners").is_none());
        assert!(out.get("notifications").is_none());
    }

    #[test]
    fn ties_break_by_id() {
        let feed = MergedFeed::new(
            vec![src(vec![item("b", 1)]), src(vec![item("a", 1)])],
            ColumnFilters::default(),
        );
        assert_eq!(ids(&feed.to_vec()), ["a", "b"]);
    }
}
