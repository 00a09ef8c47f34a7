// src/sync/persist.rs
//! Snapshot persistence of subscriptions, cursors, items and columns.
//!
//! Subscriptions are keyed by request fingerprint; a restored entry gets the
//! same id it had before because ids are derived from that fingerprint.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::columns::{Column, ColumnStore};
use crate::sync::cursor::{Cursor, CursorStore};
use crate::sync::registry::{SubscriptionRecord, SubscriptionRegistry};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSubscription {
    #[serde(flatten)]
    pub record: SubscriptionRecord,
    #[serde(default)]
    pub cursor: Option<Cursor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    /// Keyed by request fingerprint.
    #[serde(default)]
    pub subscriptions: BTreeMap<String, PersistedSubscription>,
    #[serde(default)]
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub columns: usize,
    pub subscriptions: usize,
    pub items: usize,
    /// Subscriptions dropped because no restored column lists them.
    pub dropped: usize,
}

impl Snapshot {
    pub fn capture(
        registry: &SubscriptionRegistry,
        cursors: &CursorStore,
        columns: &ColumnStore,
        now: DateTime<Utc>,
    ) -> Self {
        let subscriptions = registry
            .export()
            .into_iter()
            .map(|record| {
                let id = record.request.subscription_id();
                let cursor = Some(cursors.get(&id));
                (record.request.fingerprint(), PersistedSubscription { record, cursor })
            })
            .collect();
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Some(now),
            subscriptions,
            columns: columns.export(),
        }
    }

    /// Load into empty stores, then apply retention.
    ///
    /// Owner sets are rebuilt from the columns so both index tables agree.
    pub fn restore(
        self,
        registry: &SubscriptionRegistry,
        cursors: &CursorStore,
        columns: &ColumnStore,
        now: DateTime<Utc>,
        retention: Duration,
        cap: usize,
    ) -> RestoreStats {
        let mut stats = RestoreStats {
            columns: self.columns.len(),
            ..RestoreStats::default()
        };

        for column in self.columns {
            columns.insert(column);
        }

        let mut records = Vec::with_capacity(self.subscriptions.len());
        let mut restored_cursors = Vec::new();
        for (_, mut sub) in self.subscriptions {
            let id = sub.record.request.subscription_id();
            let owners = columns.columns_for(&id);
            if owners.is_empty() {
                stats.dropped += 1;
                continue;
            }
            sub.record.owners = owners;
            if let Some(mut c) = sub.cursor {
                c.subscription_id = id;
                restored_cursors.push(c);
            }
            stats.items += sub.record.items.len();
            records.push(sub.record);
        }

        let imported = registry.import(records);
        stats.subscriptions = imported.len();
        cursors.restore(restored_cursors);
        for id in &imported {
            cursors.ensure(id);
        }
        registry.prune(now, retention, cap);

        tracing::info!(
            target: "sync",
            columns = stats.columns,
            subscriptions = stats.subscriptions,
            items = stats.items,
            dropped = stats.dropped,
            "state restored"
        );
        stats
    }
}

#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<Option<Snapshot>>;
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;
}

/// JSON file written atomically (tmp file + rename).
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()));
            }
        };
        let snap: Snapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing snapshot {}", self.path.display()))?;
        if snap.version != SNAPSHOT_VERSION {
            anyhow::bail!(
                "unsupported snapshot version {} in {}",
                snap.version,
                self.path.display()
            );
        }
        Ok(Some(snap))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let data = serde_json::to_vec_pretty(snapshot).context("serializing snapshot")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("renaming into {}", self.path.display()))?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Option<Snapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.inner.lock().expect("memory store mutex poisoned").clone())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        *self.inner.lock().expect("memory store mutex poisoned") = Some(snapshot.clone());
        Ok(())
    }
}
