// src/sync/columns.rs
//! Column → subscription index and per-column change notification.
//!
//! Each column owns a `watch` channel carrying a version counter. Anything
//! that may change what the column shows bumps it; observers re-read the view.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::sync::error::EngineError;
use crate::sync::merger::ColumnFilters;
use crate::sync::types::{ColumnId, SubscriptionId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub id: ColumnId,
    /// Ordered, no duplicates.
    pub subscription_ids: Vec<SubscriptionId>,
    #[serde(default)]
    pub filters: ColumnFilters,
}

struct Slot {
    column: Column,
    version: watch::Sender<u64>,
}

impl Slot {
    fn new(column: Column) -> Self {
        let (version, _) = watch::channel(0);
        Self { column, version }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

#[derive(Default)]
pub struct ColumnStore {
    inner: RwLock<HashMap<ColumnId, Slot>>,
}

impl ColumnStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, column: Column) {
        let mut map = self.inner.write().expect("column store rwlock poisoned");
        map.insert(column.id.clone(), Slot::new(column));
    }

    pub fn get(&self, id: &ColumnId) -> Option<Column> {
        let map = self.inner.read().expect("column store rwlock poisoned");
        map.get(id).map(|s| s.column.clone())
    }

    pub fn contains(&self, id: &ColumnId) -> bool {
        let map = self.inner.read().expect("column store rwlock poisoned");
        map.contains_key(id)
    }

    /// Removing a column drops its sender; watchers see the channel close.
    pub fn remove(&self, id: &ColumnId) -> Option<Column> {
        let mut map = self.inner.write().expect("column store rwlock poisoned");
        map.remove(id).map(|s| s.column)
    }

    /// Returns `false` if the subscription was already listed.
    pub fn add_subscription(&self, id: &ColumnId, sub: SubscriptionId) -> Result<bool, EngineError> {
        let mut map = self.inner.write().expect("column store rwlock poisoned");
        let slot = map
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownColumn(id.clone()))?;
        if slot.column.subscription_ids.contains(&sub) {
            return Ok(false);
        }
        slot.column.subscription_ids.push(sub);
        slot.bump();
        Ok(true)
    }

    pub fn remove_subscription(&self, id: &ColumnId, sub: &SubscriptionId) -> Result<(), EngineError> {
        let mut map = self.inner.write().expect("column store rwlock poisoned");
        let slot = map
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownColumn(id.clone()))?;
        let before = slot.column.subscription_ids.len();
        slot.column.subscription_ids.retain(|s| s != sub);
        if slot.column.subscription_ids.len() == before {
            return Err(EngineError::UnknownSubscription {
                column: id.clone(),
                subscription: sub.clone(),
            });
        }
        slot.bump();
        Ok(())
    }

    pub fn update_filters<F>(&self, id: &ColumnId, f: F) -> Result<ColumnFilters, EngineError>
    where
        F: FnOnce(&mut ColumnFilters),
    {
        let mut map = self.inner.write().expect("column store rwlock poisoned");
        let slot = map
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownColumn(id.clone()))?;
        f(&mut slot.column.filters);
        slot.bump();
        Ok(slot.column.filters.clone())
    }

    /// Columns listing the subscription.
    pub fn columns_for(&self, sub: &SubscriptionId) -> Vec<ColumnId> {
        let map = self.inner.read().expect("column store rwlock poisoned");
        let mut out: Vec<ColumnId> = map
            .values()
            .filter(|s| s.column.subscription_ids.contains(sub))
            .map(|s| s.column.id.clone())
            .collect();
        out.sort();
        out
    }

    pub fn watch(&self, id: &ColumnId) -> Option<watch::Receiver<u64>> {
        let map = self.inner.read().expect("column store rwlock poisoned");
        map.get(id).map(|s| s.version.subscribe())
    }

    pub fn bump(&self, id: &ColumnId) {
        let map = self.inner.read().expect("column store rwlock poisoned");
        if let Some(slot) = map.get(id) {
            slot.bump();
        }
    }

    /// Bump every column listing one of the subscriptions.
    pub fn bump_for_subscriptions(&self, subs: &[SubscriptionId]) {
        if subs.is_empty() {
            return;
        }
        let map = self.inner.read().expect("column store rwlock poisoned");
        for slot in map.values() {
            if slot
                .column
                .subscription_ids
                .iter()
                .any(|s| subs.contains(s))
            {
                slot.bump();
            }
        }
    }

    pub fn ids(&self) -> Vec<ColumnId> {
        let map = self.inner.read().expect("column store rwlock poisoned");
        let mut v: Vec<_> = map.keys().cloned().collect();
        v.sort();
        v
    }

    pub fn export(&self) -> Vec<Column> {
        let map = self.inner.read().expect("column store rwlock poisoned");
        let mut v: Vec<Column> = map.values().map(|s| s.column.clone()).collect();
        v.sort_by(|a, b| a.id.cmp(&b.id));
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(id: &str, subs: &[&str]) -> Column {
        Column {
            id: ColumnId::from(id),
            subscription_ids: subs.iter().map(|s| SubscriptionId::from(*s)).collect(),
            filters: ColumnFilters::default(),
        }
    }

    #[test]
    fn subscription_list_stays_ordered_and_unique() {
        let store = ColumnStore::new();
        store.insert(column("c", &["s1"]));
        let c = ColumnId::from("c");
        assert!(store.add_subscription(&c, "s2".into()).unwrap());
        assert!(!store.add_subscription(&c, "s1".into()).unwrap());
        assert_eq!(
            store.get(&c).unwrap().subscription_ids,
            vec![SubscriptionId::from("s1"), SubscriptionId::from("s2")]
        );

        store.remove_subscription(&c, &"s1".into()).unwrap();
        assert!(matches!(
            store.remove_subscription(&c, &"s1".into()),
            Err(EngineError::UnknownSubscription { .. })
        ));
        assert!(matches!(
            store.add_subscription(&ColumnId::from("nope"), "s".into()),
            Err(EngineError::UnknownColumn(_))
        ));
    }

    #[test]
    fn bumps_reach_watchers_of_affected_columns_only() {
        let store = ColumnStore::new();
        store.insert(column("a", &["s1"]));
        store.insert(column("b", &["s2"]));
        let mut wa = store.watch(&ColumnId::from("a")).unwrap();
        let mut wb = store.watch(&ColumnId::from("b")).unwrap();

        store.bump_for_subscriptions(&["s1".into()]);
        assert!(wa.has_changed().unwrap());
        assert!(!wb.has_changed().unwrap());
        assert_eq!(*wa.borrow_and_update(), 1);

        store.remove(&ColumnId::from("b"));
        assert!(wb.has_changed().is_err());
    }

    #[test]
    fn columns_for_lists_every_owner() {
        let store = ColumnStore::new();
        store.insert(column("a", &["s1", "s2"]));
        store.insert(column("b", &["s2"]));
        assert_eq!(
            store.columns_for(&"s2".into()),
            vec![ColumnId::from("a"), ColumnId::from("b")]
        );
    }
}
