//! # Sync Engine
//! Inbound facade over the sync core: column lifecycle, refresh and paging,
//! read/save marks, view computation and change notification.
//!
//! Column edits and mark propagation go through one writer lock, so a mark
//! never races a topology change and the two index tables (column store and
//! registry owner sets) always agree.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::sync::columns::{Column, ColumnStore};
use crate::sync::cursor::CursorStore;
use crate::sync::error::EngineError;
use crate::sync::fetcher::Fetcher;
use crate::sync::http::{HttpClient, TokenProvider};
use crate::sync::merger::{ColumnFilters, MergedFeed};
use crate::sync::persist::{RestoreStats, Snapshot, StateStore};
use crate::sync::rate_limit::RateLimiter;
use crate::sync::registry::SubscriptionRegistry;
use crate::sync::scheduler::{CycleOutcome, CycleReport, Phase, Scheduler, SyncEvent, Trigger};
use crate::sync::types::{
    ColumnId, Item, Mark, RequestModel, SubscriptionId, SubscriptionStatus,
};

/// Health of one subscription feeding a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionHealth {
    pub id: SubscriptionId,
    pub request: RequestModel,
    pub status: SubscriptionStatus,
    pub phase: Phase,
    pub has_more: bool,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub items: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnView {
    pub column: ColumnId,
    pub filters: ColumnFilters,
    pub items: Vec<Item>,
    pub subscriptions: Vec<SubscriptionHealth>,
    /// At least one subscription has older pages.
    pub can_fetch_more: bool,
}

pub struct SyncEngine {
    cfg: SyncConfig,
    registry: Arc<SubscriptionRegistry>,
    cursors: Arc<CursorStore>,
    columns: Arc<ColumnStore>,
    scheduler: Arc<Scheduler>,
    store: Option<Arc<dyn StateStore>>,
    writer: Mutex<()>,
    shutdown: CancellationToken,
}

impl SyncEngine {
    /// Must be called inside a tokio runtime (spawns the view-update listener).
    pub fn new(
        cfg: SyncConfig,
        http: Arc<dyn HttpClient>,
        tokens: Arc<dyn TokenProvider>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Arc<Self> {
        crate::sync::ensure_metrics_described();

        let registry = Arc::new(SubscriptionRegistry::new(Duration::seconds(
            cfg.registry.grace_secs as i64,
        )));
        let cursors = Arc::new(CursorStore::new());
        let limiter = Arc::new(RateLimiter::new());
        let fetcher = Arc::new(Fetcher::new(
            &cfg.fetch,
            http,
            tokens,
            limiter,
            cursors.clone(),
            registry.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            cfg.schedule.clone(),
            fetcher,
            registry.clone(),
            cursors.clone(),
        ));

        let engine = Arc::new(Self {
            cfg,
            registry,
            cursors,
            columns: Arc::new(ColumnStore::new()),
            scheduler,
            store,
            writer: Mutex::new(()),
            shutdown: CancellationToken::new(),
        });
        engine.spawn_listener();
        engine
    }

    pub fn config(&self) -> &SyncConfig {
        &self.cfg
    }

    fn write_lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.writer.lock().expect("engine writer mutex poisoned")
    }

    fn retention(&self) -> Duration {
        Duration::days(self.cfg.registry.retention_days)
    }

    /* ----------------------------
    Column lifecycle
    ---------------------------- */

    pub fn create_column(
        self: &Arc<Self>,
        requests: Vec<RequestModel>,
        filters: ColumnFilters,
    ) -> Result<ColumnId, EngineError> {
        if requests.is_empty() {
            return Err(EngineError::EmptyColumn);
        }
        for r in &requests {
            r.validate()?;
        }

        let id = ColumnId::generate();
        let mut attached = Vec::with_capacity(requests.len());
        {
            let _w = self.write_lock();
            let mut subscription_ids = Vec::with_capacity(requests.len());
            for r in &requests {
                let out = self.registry.attach(&id, r);
                self.cursors.ensure(&out.id);
                if !subscription_ids.contains(&out.id) {
                    subscription_ids.push(out.id.clone());
                    attached.push(out.id);
                }
            }
            self.columns.insert(Column {
                id: id.clone(),
                subscription_ids,
                filters,
            });
        }

        tracing::info!(target: "sync", column = %id, subscriptions = attached.len(), "column created");
        for sub in &attached {
            let _ = self.scheduler.trigger(sub, Trigger::Attached);
        }
        Ok(id)
    }

    pub fn delete_column(&self, id: &ColumnId) -> Result<(), EngineError> {
        let _w = self.write_lock();
        let column = self
            .columns
            .remove(id)
            .ok_or_else(|| EngineError::UnknownColumn(id.clone()))?;
        let now = Utc::now();
        for sub in &column.subscription_ids {
            self.registry.detach(id, sub, now);
        }
        tracing::info!(target: "sync", column = %id, "column deleted");
        Ok(())
    }

    pub fn add_column_subscription(
        self: &Arc<Self>,
        id: &ColumnId,
        request: RequestModel,
    ) -> Result<SubscriptionId, EngineError> {
        request.validate()?;
        let sub = {
            let _w = self.write_lock();
            if !self.columns.contains(id) {
                return Err(EngineError::UnknownColumn(id.clone()));
            }
            let out = self.registry.attach(id, &request);
            self.cursors.ensure(&out.id);
            self.columns.add_subscription(id, out.id.clone())?;
            out.id
        };
        let _ = self.scheduler.trigger(&sub, Trigger::Attached);
        Ok(sub)
    }

    pub fn delete_column_subscription(
        &self,
        id: &ColumnId,
        sub: &SubscriptionId,
    ) -> Result<(), EngineError> {
        let _w = self.write_lock();
        self.columns.remove_subscription(id, sub)?;
        self.registry.detach(id, sub, Utc::now());
        Ok(())
    }

    pub fn set_column_filters(
        &self,
        id: &ColumnId,
        filters: ColumnFilters,
    ) -> Result<ColumnFilters, EngineError> {
        let _w = self.write_lock();
        self.columns.update_filters(id, |f| {
            let cleared_at = filters.cleared_at.or(f.cleared_at);
            *f = ColumnFilters {
                cleared_at,
                ..filters
            };
        })
    }

    /* ----------------------------
    Fetch triggers
    ---------------------------- */

    fn subscriptions_of(&self, id: &ColumnId) -> Result<Vec<SubscriptionId>, EngineError> {
        self.columns
            .get(id)
            .map(|c| c.subscription_ids)
            .ok_or_else(|| EngineError::UnknownColumn(id.clone()))
    }

    async fn run_triggers(
        self: &Arc<Self>,
        id: &ColumnId,
        trigger: Trigger,
    ) -> Result<Vec<CycleReport>, EngineError> {
        let subs = self.subscriptions_of(id)?;
        let mut pending = Vec::with_capacity(subs.len());
        for sub in subs {
            pending.push((sub.clone(), self.scheduler.trigger(&sub, trigger)));
        }

        let mut reports = Vec::with_capacity(pending.len());
        for (sub, started) in pending {
            let report = match started {
                Ok(handle) => handle.await.unwrap_or_else(|e| {
                    tracing::warn!(target: "sync", subscription = %sub, error = ?e, "fetch task failed");
                    CycleReport {
                        subscription: sub,
                        pages: 0,
                        inserted: 0,
                        updated: 0,
                        outcome: CycleOutcome::Cancelled,
                    }
                }),
                Err(reason) => CycleReport::skipped(sub, reason),
            };
            reports.push(report);
        }
        Ok(reports)
    }

    /// Pull-to-refresh. `force` drops pagination state and starts over from page 1.
    pub async fn refresh_column(
        self: &Arc<Self>,
        id: &ColumnId,
        force: bool,
    ) -> Result<Vec<CycleReport>, EngineError> {
        self.run_triggers(id, Trigger::Manual { force }).await
    }

    /// Fetch the next older page of every subscription that has one.
    pub async fn load_more(self: &Arc<Self>, id: &ColumnId) -> Result<Vec<CycleReport>, EngineError> {
        self.run_triggers(id, Trigger::LoadMore).await
    }

    /// Column came into view. Does not wait for the started cycles.
    pub fn column_visible(self: &Arc<Self>, id: &ColumnId) -> Result<usize, EngineError> {
        let subs = self.subscriptions_of(id)?;
        Ok(subs
            .iter()
            .filter(|s| self.scheduler.trigger(s, Trigger::Visible).is_ok())
            .count())
    }

    /* ----------------------------
    Marks
    ---------------------------- */

    fn mark(&self, id: &ColumnId, item: &str, mark: Mark) -> Result<bool, EngineError> {
        let _w = self.write_lock();
        let subs = self.subscriptions_of(id)?;
        let in_column = self
            .registry
            .snapshots(&subs)
            .iter()
            .any(|items| items.iter().any(|it| it.id == item));
        if !in_column {
            return Err(EngineError::UnknownItem {
                column: id.clone(),
                item: item.to_string(),
            });
        }
        let ids: HashSet<String> = std::iter::once(item.to_string()).collect();
        let touched = self.registry.apply_mark(&ids, mark, Utc::now());
        self.columns.bump_for_subscriptions(&touched);
        Ok(!touched.is_empty())
    }

    /// Returns `false` if the item was already read.
    pub fn mark_read(&self, id: &ColumnId, item: &str) -> Result<bool, EngineError> {
        self.mark(id, item, Mark::Read)
    }

    pub fn mark_unread(&self, id: &ColumnId, item: &str) -> Result<bool, EngineError> {
        self.mark(id, item, Mark::Unread)
    }

    pub fn save_item(&self, id: &ColumnId, item: &str, save: bool) -> Result<bool, EngineError> {
        self.mark(id, item, if save { Mark::Save } else { Mark::Unsave })
    }

    /// Mark every item currently visible in the column as read.
    pub fn mark_all_read(&self, id: &ColumnId) -> Result<usize, EngineError> {
        let _w = self.write_lock();
        let ids = self.column_feed(id)?.ids();
        let touched = self.registry.apply_mark(&ids, Mark::Read, Utc::now());
        self.columns.bump_for_subscriptions(&touched);
        Ok(ids.len())
    }

    /// Hide everything up to now; saved items and later updates stay visible.
    pub fn clear_column(&self, id: &ColumnId) -> Result<DateTime<Utc>, EngineError> {
        let _w = self.write_lock();
        let now = Utc::now();
        self.columns
            .update_filters(id, |f| f.cleared_at = Some(now))?;
        Ok(now)
    }

    /* ----------------------------
    Views
    ---------------------------- */

    /// Lazy merged feed of a column.
    pub fn column_feed(&self, id: &ColumnId) -> Result<MergedFeed, EngineError> {
        let column = self
            .columns
            .get(id)
            .ok_or_else(|| EngineError::UnknownColumn(id.clone()))?;
        let sources = self.registry.snapshots(&column.subscription_ids);
        Ok(MergedFeed::new(sources, column.filters))
    }

    /// Materialized view; `limit` takes a prefix of the feed.
    pub fn get_column_view(&self, id: &ColumnId, limit: Option<usize>) -> Result<ColumnView, EngineError> {
        let column = self
            .columns
            .get(id)
            .ok_or_else(|| EngineError::UnknownColumn(id.clone()))?;
        let feed = MergedFeed::new(
            self.registry.snapshots(&column.subscription_ids),
            column.filters.clone(),
        );
        let items = match limit {
            Some(n) => feed.take(n),
            None => feed.to_vec(),
        };

        let subscriptions: Vec<SubscriptionHealth> = column
            .subscription_ids
            .iter()
            .filter_map(|sub| self.health(sub))
            .collect();
        let can_fetch_more = subscriptions.iter().any(|s| s.has_more);

        Ok(ColumnView {
            column: column.id,
            filters: column.filters,
            items,
            subscriptions,
            can_fetch_more,
        })
    }

    fn health(&self, sub: &SubscriptionId) -> Option<SubscriptionHealth> {
        let request = self.registry.request(sub)?;
        let cursor = self.cursors.get(sub);
        Some(SubscriptionHealth {
            id: sub.clone(),
            request,
            status: self.registry.status(sub).unwrap_or_default(),
            phase: self.scheduler.phase(sub),
            has_more: cursor.has_more,
            last_fetched_at: cursor.last_fetched_at,
            rate_limit_reset_at: cursor.rate_limit_reset_at,
            consecutive_failures: cursor.consecutive_failures,
            items: self.registry.item_count(sub),
        })
    }

    pub fn watch_column(&self, id: &ColumnId) -> Result<watch::Receiver<u64>, EngineError> {
        self.columns
            .watch(id)
            .ok_or_else(|| EngineError::UnknownColumn(id.clone()))
    }

    pub fn column_ids(&self) -> Vec<ColumnId> {
        self.columns.ids()
    }

    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.registry.ids()
    }

    /// Resolves once no fetch cycle is running.
    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await;
    }

    /* ----------------------------
    Background work & persistence
    ---------------------------- */

    fn spawn_listener(&self) {
        let mut rx = self.scheduler.subscribe();
        let columns = self.columns.clone();
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    ev = rx.recv() => match ev {
                        Ok(SyncEvent::ItemsChanged(sub)) | Ok(SyncEvent::CycleFinished(sub)) => {
                            columns.bump_for_subscriptions(&[sub]);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(target: "sync", skipped, "view listener lagged; bumping all columns");
                            for id in columns.ids() {
                                columns.bump(&id);
                            }
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// One maintenance pass: evict expired orphans, drop expired items,
    /// trigger due subscriptions, save a snapshot.
    pub async fn tick(self: &Arc<Self>) {
        let now = Utc::now();
        let evicted = {
            let _w = self.write_lock();
            let evicted = self.registry.evict_expired(now);
            for sub in &evicted {
                self.scheduler.cancel(sub);
                self.cursors.remove(sub);
            }
            evicted
        };

        // The per-subscription cap only applies on restore; load_more may hold more.
        let pruned = self.registry.prune(now, self.retention(), usize::MAX);
        self.columns.bump_for_subscriptions(&pruned);

        let live: Vec<SubscriptionId> = self
            .registry
            .ids()
            .into_iter()
            .filter(|s| !self.registry.is_orphaned(s))
            .collect();
        let started = self.scheduler.tick(&live).len();

        tracing::debug!(target: "sync", evicted = evicted.len(), pruned = pruned.len(), started, "tick");

        if let Err(e) = self.save().await {
            tracing::warn!(target: "sync", error = ?e, "snapshot save failed");
        }
    }

    /// Spawn the periodic maintenance loop. Stops on [`SyncEngine::shutdown`].
    pub fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let token = self.shutdown.clone();
        let period = self.cfg.schedule.tick();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => engine.tick().await,
                }
            }
        })
    }

    pub async fn save(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = Snapshot::capture(&self.registry, &self.cursors, &self.columns, Utc::now());
        store.save(&snapshot).await
    }

    /// Load the persisted snapshot, if any. Call before creating columns.
    pub async fn restore(&self) -> Result<RestoreStats> {
        let Some(store) = &self.store else {
            return Ok(RestoreStats::default());
        };
        let Some(snapshot) = store.load().await? else {
            return Ok(RestoreStats::default());
        };
        let _w = self.write_lock();
        Ok(snapshot.restore(
            &self.registry,
            &self.cursors,
            &self.columns,
            Utc::now(),
            self.retention(),
            self.cfg.registry.max_items_per_subscription,
        ))
    }

    /// Cancel every fetch and stop background tasks.
    pub fn shutdown(&self) {
        self.scheduler.cancel_all();
        self.shutdown.cancel();
    }
}
