// src/sync/registry.rs
//! Content-addressed subscription cache shared by columns.
//!
//! A subscription is keyed by the fingerprint of its request model, so two
//! columns asking for the same thing share one entry, one cursor and one
//! fetch. The owner set here and the column store's subscription lists are
//! the two index tables of the column ↔ subscription relation.
//!
//! All item sets live behind one lock so that a mark is applied to every copy
//! of an item at once.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use metrics::gauge;
use serde::{Deserialize, Serialize};

use crate::sync::types::{
    feed_order, ColumnId, Item, Mark, RequestModel, SubscriptionId, SubscriptionStatus,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOutcome {
    pub id: SubscriptionId,
    /// No entry existed; the caller should schedule an initial fetch.
    pub created: bool,
    /// An orphaned entry was picked up again inside its grace period.
    pub readopted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Persistable view of one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub request: RequestModel,
    pub owners: Vec<ColumnId>,
    #[serde(default)]
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub items: Vec<Item>,
}

#[derive(Debug)]
struct Entry {
    request: RequestModel,
    owners: BTreeSet<ColumnId>,
    items: HashMap<String, Item>,
    /// Feed-ordered copy of `items`, handed out to mergers.
    sorted: Arc<Vec<Item>>,
    status: SubscriptionStatus,
    orphaned_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn new(request: RequestModel) -> Self {
        Self {
            request,
            owners: BTreeSet::new(),
            items: HashMap::new(),
            sorted: Arc::new(Vec::new()),
            status: SubscriptionStatus::Ok,
            orphaned_at: None,
        }
    }

    fn rebuild(&mut self) {
        let mut v: Vec<Item> = self.items.values().cloned().collect();
        v.sort_by(feed_order);
        self.sorted = Arc::new(v);
    }
}

#[derive(Debug)]
pub struct SubscriptionRegistry {
    inner: Mutex<HashMap<SubscriptionId, Entry>>,
    grace: Duration,
}

impl SubscriptionRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            grace,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriptionId, Entry>> {
        self.inner.lock().expect("registry mutex poisoned")
    }

    pub fn attach(&self, column: &ColumnId, request: &RequestModel) -> AttachOutcome {
        let id = request.subscription_id();
        let mut map = self.lock();
        let mut created = false;
        let entry = map.entry(id.clone()).or_insert_with(|| {
            created = true;
            Entry::new(request.clone())
        });
        let readopted = entry.orphaned_at.take().is_some();
        entry.owners.insert(column.clone());
        let len = map.len();
        drop(map);

        gauge!("sync_subscriptions").set(len as f64);
        if created {
            tracing::debug!(target: "sync", subscription = %id, "subscription created");
        } else if readopted {
            tracing::debug!(target: "sync", subscription = %id, "orphaned subscription readopted");
        }
        AttachOutcome {
            id,
            created,
            readopted,
        }
    }

    /// Remove an owner. Returns `true` when the subscription became orphaned.
    pub fn detach(&self, column: &ColumnId, id: &SubscriptionId, now: DateTime<Utc>) -> bool {
        let mut map = self.lock();
        let Some(entry) = map.get_mut(id) else {
            return false;
        };
        entry.owners.remove(column);
        if entry.owners.is_empty() && entry.orphaned_at.is_none() {
            entry.orphaned_at = Some(now);
            tracing::debug!(target: "sync", subscription = %id, "subscription orphaned");
            return true;
        }
        false
    }

    /// Drop orphans whose grace period has elapsed.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> Vec<SubscriptionId> {
        let mut map = self.lock();
        let expired: Vec<SubscriptionId> = map
            .iter()
            .filter(|(_, e)| matches!(e.orphaned_at, Some(t) if t + self.grace <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            map.remove(id);
        }
        let len = map.len();
        drop(map);

        if !expired.is_empty() {
            gauge!("sync_subscriptions").set(len as f64);
            tracing::info!(target: "sync", evicted = expired.len(), "evicted orphaned subscriptions");
        }
        expired
    }

    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<SubscriptionId> {
        let mut v: Vec<_> = self.lock().keys().cloned().collect();
        v.sort();
        v
    }

    pub fn request(&self, id: &SubscriptionId) -> Option<RequestModel> {
        self.lock().get(id).map(|e| e.request.clone())
    }

    pub fn owners(&self, id: &SubscriptionId) -> Vec<ColumnId> {
        self.lock()
            .get(id)
            .map(|e| e.owners.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_orphaned(&self, id: &SubscriptionId) -> bool {
        self.lock()
            .get(id)
            .is_some_and(|e| e.orphaned_at.is_some())
    }

    pub fn status(&self, id: &SubscriptionId) -> Option<SubscriptionStatus> {
        self.lock().get(id).map(|e| e.status.clone())
    }

    /// Returns `true` if the status changed.
    pub fn set_status(&self, id: &SubscriptionId, status: SubscriptionStatus) -> bool {
        let mut map = self.lock();
        match map.get_mut(id) {
            Some(e) if e.status != status => {
                e.status = status;
                true
            }
            _ => false,
        }
    }

    pub fn item_count(&self, id: &SubscriptionId) -> usize {
        self.lock().get(id).map(|e| e.items.len()).unwrap_or(0)
    }

    /// Sorted item snapshots of the given subscriptions (missing ones skipped).
    pub fn snapshots(&self, ids: &[SubscriptionId]) -> Vec<Arc<Vec<Item>>> {
        let map = self.lock();
        ids.iter()
            .filter_map(|id| map.get(id).map(|e| e.sorted.clone()))
            .collect()
    }

    /// Insert or refresh items. Idempotent by item id.
    ///
    /// A new copy takes over the local marks of copies already held by other
    /// subscriptions. Returns `None` if the subscription is gone.
    pub fn upsert_items(&self, id: &SubscriptionId, items: Vec<Item>) -> Option<UpsertStats> {
        self.upsert_items_if(id, items, || true)
    }

    /// [`upsert_items`](Self::upsert_items) guarded by `live`, which is
    /// evaluated under the registry lock. Returns `None` without touching
    /// anything when it yields `false`.
    pub fn upsert_items_if(
        &self,
        id: &SubscriptionId,
        items: Vec<Item>,
        live: impl FnOnce() -> bool,
    ) -> Option<UpsertStats> {
        let mut map = self.lock();
        if !map.contains_key(id) || !live() {
            return None;
        }

        let mut stats = UpsertStats::default();
        let mut fresh = Vec::new();
        {
            let entry = map.get_mut(id)?;
            for item in items {
                match entry.items.get_mut(&item.id) {
                    Some(existing) => {
                        if existing.refresh_from(item) {
                            stats.updated += 1;
                        } else {
                            stats.unchanged += 1;
                        }
                    }
                    None => fresh.push(item),
                }
            }
        }

        for mut item in fresh {
            for (other_id, other) in map.iter() {
                if other_id == id {
                    continue;
                }
                if let Some(copy) = other.items.get(&item.id) {
                    item.merge_marks_from(copy);
                }
            }
            if let Some(entry) = map.get_mut(id) {
                entry.items.insert(item.id.clone(), item);
                stats.inserted += 1;
            }
        }

        if stats.inserted + stats.updated > 0 {
            if let Some(entry) = map.get_mut(id) {
                entry.rebuild();
            }
        }
        Some(stats)
    }

    /// Apply a mark to every copy of the given items in every subscription.
    ///
    /// Returns the subscriptions whose item sets changed.
    pub fn apply_mark(
        &self,
        item_ids: &HashSet<String>,
        mark: Mark,
        now: DateTime<Utc>,
    ) -> Vec<SubscriptionId> {
        let mut map = self.lock();
        let mut touched = Vec::new();
        for (sub_id, entry) in map.iter_mut() {
            let mut changed = false;
            for item_id in item_ids {
                if let Some(item) = entry.items.get_mut(item_id) {
                    changed |= item.apply_mark(mark, now);
                }
            }
            if changed {
                entry.rebuild();
                touched.push(sub_id.clone());
            }
        }
        touched.sort();
        touched
    }

    /// Retention: drop unsaved items older than `retention`, then keep at most
    /// `cap` unsaved items per subscription. Saved items are always kept.
    ///
    /// Returns the subscriptions that lost items.
    pub fn prune(&self, now: DateTime<Utc>, retention: Duration, cap: usize) -> Vec<SubscriptionId> {
        let cutoff = now - retention;
        let mut map = self.lock();
        let mut touched = Vec::new();
        for (sub_id, entry) in map.iter_mut() {
            let before = entry.items.len();
            entry
                .items
                .retain(|_, it| it.is_saved() || it.updated_at >= cutoff);

            let mut unsaved: Vec<(DateTime<Utc>, String)> = entry
                .items
                .values()
                .filter(|it| !it.is_saved())
                .map(|it| (it.updated_at, it.id.clone()))
                .collect();
            if unsaved.len() > cap {
                unsaved.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
                for (_, id) in unsaved.into_iter().skip(cap) {
                    entry.items.remove(&id);
                }
            }

            if entry.items.len() != before {
                entry.rebuild();
                touched.push(sub_id.clone());
            }
        }
        touched.sort();
        touched
    }

    /// Snapshot of all live (non-orphaned) subscriptions.
    pub fn export(&self) -> Vec<SubscriptionRecord> {
        let map = self.lock();
        let mut out: Vec<SubscriptionRecord> = map
            .values()
            .filter(|e| e.orphaned_at.is_none())
            .map(|e| SubscriptionRecord {
                request: e.request.clone(),
                owners: e.owners.iter().cloned().collect(),
                status: e.status.clone(),
                items: e.sorted.as_ref().clone(),
            })
            .collect();
        out.sort_by_key(|r| r.request.fingerprint());
        out
    }

    /// Load persisted subscriptions. Existing entries with the same id are replaced.
    pub fn import(&self, records: Vec<SubscriptionRecord>) -> Vec<SubscriptionId> {
        let mut map = self.lock();
        let mut ids = Vec::with_capacity(records.len());
        for rec in records {
            let id = rec.request.subscription_id();
            let mut entry = Entry::new(rec.request);
            entry.owners = rec.owners.into_iter().collect();
            entry.status = rec.status;
            entry.items = rec
                .items
                .into_iter()
                .map(|it| (it.id.clone(), it))
                .collect();
            entry.rebuild();
            map.insert(id.clone(), entry);
            ids.push(id);
        }
        gauge!("sync_subscriptions").set(map.len() as f64);
        ids
    }
}
