// src/sync/cursor.rs
//! Per-subscription pagination cursors and fetch metadata.
//!
//! Only the fetcher advances a cursor, and only forward. `reset` is the
//! single rewind path and is reserved for explicit full refreshes.
//!
//! Entries are created by `ensure` when a subscription is registered. Every
//! other write is a no-op for unknown ids, so a fetch finishing after its
//! subscription was evicted cannot bring the cursor back.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::types::SubscriptionId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub subscription_id: SubscriptionId,
    /// Deepest page applied so far (0 = never fetched).
    #[serde(default)]
    pub page: u32,
    /// Token of the next older page.
    #[serde(default)]
    pub page_token: Option<String>,
    /// ETag of the head page.
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_fetched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub has_more: bool,
    /// Server-suggested poll interval (`X-Poll-Interval`), seconds.
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
}

impl Cursor {
    pub fn new(subscription_id: SubscriptionId) -> Self {
        Self {
            subscription_id,
            page: 0,
            page_token: None,
            etag: None,
            last_fetched_at: None,
            rate_limit_reset_at: None,
            consecutive_failures: 0,
            has_more: false,
            poll_interval_secs: None,
        }
    }

    pub fn never_fetched(&self) -> bool {
        self.page == 0
    }

    /// Page number the next `fetch_next_page` should request.
    pub fn next_page(&self) -> u32 {
        self.page_token
            .as_deref()
            .and_then(|t| t.parse::<u32>().ok())
            .unwrap_or(self.page + 1)
    }
}

/// Result of one successfully applied page.
#[derive(Debug, Clone, Default)]
pub struct PageAdvance {
    pub page: u32,
    pub next_token: Option<String>,
    pub etag: Option<String>,
    pub has_more: bool,
    pub poll_interval_secs: Option<u64>,
}

#[derive(Debug, Default)]
pub struct CursorStore {
    inner: Mutex<HashMap<SubscriptionId, Cursor>>,
}

impl CursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cursor; a fresh one if the subscription has none yet.
    pub fn get(&self, id: &SubscriptionId) -> Cursor {
        let map = self.inner.lock().expect("cursor store mutex poisoned");
        map.get(id)
            .cloned()
            .unwrap_or_else(|| Cursor::new(id.clone()))
    }

    /// Create an empty cursor unless one exists.
    pub fn ensure(&self, id: &SubscriptionId) {
        let mut map = self.inner.lock().expect("cursor store mutex poisoned");
        map.entry(id.clone())
            .or_insert_with(|| Cursor::new(id.clone()));
    }

    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.inner
            .lock()
            .expect("cursor store mutex poisoned")
            .contains_key(id)
    }

    /// Apply a successful page. Returns `true` if the page token moved forward.
    pub fn advance(&self, id: &SubscriptionId, adv: PageAdvance, now: DateTime<Utc>) -> bool {
        let mut map = self.inner.lock().expect("cursor store mutex poisoned");
        let Some(c) = map.get_mut(id) else {
            return false;
        };

        c.last_fetched_at = Some(now);
        c.consecutive_failures = 0;
        c.rate_limit_reset_at = None;
        if adv.poll_interval_secs.is_some() {
            c.poll_interval_secs = adv.poll_interval_secs;
        }
        if adv.page == 1 && adv.etag.is_some() {
            c.etag = adv.etag;
        }

        // Replays and head polls never move the token backwards.
        if adv.page > c.page {
            c.page = adv.page;
            c.page_token = adv.next_token;
            c.has_more = adv.has_more;
            true
        } else {
            false
        }
    }

    /// Head page unchanged since the stored ETag.
    pub fn record_not_modified(&self, id: &SubscriptionId, now: DateTime<Utc>) {
        let mut map = self.inner.lock().expect("cursor store mutex poisoned");
        let Some(c) = map.get_mut(id) else {
            return;
        };
        c.last_fetched_at = Some(now);
        c.consecutive_failures = 0;
        c.rate_limit_reset_at = None;
    }

    /// Returns the new failure count (0 for unknown ids).
    pub fn record_failure(&self, id: &SubscriptionId) -> u32 {
        let mut map = self.inner.lock().expect("cursor store mutex poisoned");
        let Some(c) = map.get_mut(id) else {
            return 0;
        };
        c.consecutive_failures = c.consecutive_failures.saturating_add(1);
        c.consecutive_failures
    }

    pub fn record_rate_limited(&self, id: &SubscriptionId, reset_at: DateTime<Utc>) {
        let mut map = self.inner.lock().expect("cursor store mutex poisoned");
        let Some(c) = map.get_mut(id) else {
            return;
        };
        c.rate_limit_reset_at = Some(reset_at);
    }

    /// Explicit full refresh: forget pagination and the ETag.
    pub fn reset(&self, id: &SubscriptionId) {
        let mut map = self.inner.lock().expect("cursor store mutex poisoned");
        if let Some(c) = map.get_mut(id) {
            let mut fresh = Cursor::new(id.clone());
            fresh.poll_interval_secs = c.poll_interval_secs;
            *c = fresh;
        }
    }

    pub fn remove(&self, id: &SubscriptionId) {
        self.inner
            .lock()
            .expect("cursor store mutex poisoned")
            .remove(id);
    }

    pub fn snapshot(&self) -> Vec<Cursor> {
        let map = self.inner.lock().expect("cursor store mutex poisoned");
        let mut out: Vec<Cursor> = map.values().cloned().collect();
        out.sort_by(|a, b| a.subscription_id.cmp(&b.subscription_id));
        out
    }

    pub fn restore(&self, cursors: Vec<Cursor>) {
        let mut map = self.inner.lock().expect("cursor store mutex poisoned");
        for c in cursors {
            map.insert(c.subscription_id.clone(), c);
        }
    }
}
