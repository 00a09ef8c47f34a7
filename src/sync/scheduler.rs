// src/sync/scheduler.rs
//! When each subscription fetches, and the tasks that do it.
//!
//! Per subscription: `Idle → Fetching → {Idle, Backoff}`. The transition into
//! `Fetching` happens under the slot lock, so a second trigger for the same
//! subscription is rejected while a cycle runs. Pages inside one cycle are
//! fetched sequentially; cycles of different subscriptions run in parallel
//! up to the semaphore's capacity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ScheduleConfig;
use crate::sync::cursor::{Cursor, CursorStore};
use crate::sync::error::FetchError;
use crate::sync::fetcher::{FetchOutcome, Fetcher, PageMode};
use crate::sync::registry::SubscriptionRegistry;
use crate::sync::types::SubscriptionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Fetching,
    Backoff { until: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// User refresh. Bypasses backoff; `force` also rewinds the cursor.
    Manual { force: bool },
    /// User asked for older items.
    LoadMore,
    /// A column showing the subscription became visible.
    Visible,
    /// Periodic tick.
    Interval,
    /// A column attached the subscription.
    Attached,
}

impl Trigger {
    fn user_initiated(self) -> bool {
        matches!(self, Trigger::Manual { .. } | Trigger::LoadMore)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    InFlight,
    BackingOff,
    Fatal,
    NotDue,
    NoMorePages,
    Unregistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Start,
    Skip(SkipReason),
}

/// Pure scheduling rule.
pub fn decide(
    phase: Phase,
    trigger: Trigger,
    fatal: bool,
    cursor: &Cursor,
    poll_interval: Duration,
    now: DateTime<Utc>,
) -> Decision {
    if phase == Phase::Fetching {
        return Decision::Skip(SkipReason::InFlight);
    }
    if trigger == Trigger::LoadMore && !cursor.never_fetched() && !cursor.has_more {
        return Decision::Skip(SkipReason::NoMorePages);
    }
    if trigger.user_initiated() {
        return Decision::Start;
    }
    if fatal {
        return Decision::Skip(SkipReason::Fatal);
    }
    if let Phase::Backoff { until } = phase {
        if now < until {
            return Decision::Skip(SkipReason::BackingOff);
        }
    }
    match trigger {
        Trigger::Interval | Trigger::Attached => {
            let due = match cursor.last_fetched_at {
                None => true,
                Some(last) => {
                    let interval = chrono::Duration::from_std(poll_interval)
                        .unwrap_or_else(|_| chrono::Duration::days(1));
                    now >= last + interval
                }
            };
            if due {
                Decision::Start
            } else {
                Decision::Skip(SkipReason::NotDue)
            }
        }
        _ => Decision::Start,
    }
}

/// `min(cap, base * 2^failures)`; non-decreasing in `failures`.
pub fn backoff_delay(failures: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed,
    NotModified,
    RateLimited { reset_at: DateTime<Utc> },
    Failed { error: String, retryable: bool },
    Cancelled,
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub subscription: SubscriptionId,
    pub pages: u32,
    pub inserted: usize,
    pub updated: usize,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    fn new(subscription: SubscriptionId) -> Self {
        Self {
            subscription,
            pages: 0,
            inserted: 0,
            updated: 0,
            outcome: CycleOutcome::Completed,
        }
    }

    pub fn skipped(subscription: SubscriptionId, reason: SkipReason) -> Self {
        Self {
            outcome: CycleOutcome::Skipped { reason },
            ..Self::new(subscription)
        }
    }
}

/// Published after state a column view depends on has changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    ItemsChanged(SubscriptionId),
    CycleFinished(SubscriptionId),
}

/// Scheduling state of one registration of a subscription. A subscription
/// that is cancelled and attached again gets a new slot with a new generation.
struct Slot {
    phase: Phase,
    cancel: CancellationToken,
    generation: u64,
}

impl Slot {
    fn new(generation: u64) -> Self {
        Self {
            phase: Phase::Idle,
            cancel: CancellationToken::new(),
            generation,
        }
    }
}

pub struct Scheduler {
    cfg: ScheduleConfig,
    fetcher: Arc<Fetcher>,
    registry: Arc<SubscriptionRegistry>,
    cursors: Arc<CursorStore>,
    permits: Arc<Semaphore>,
    slots: Mutex<HashMap<SubscriptionId, Slot>>,
    generations: AtomicU64,
    events: broadcast::Sender<SyncEvent>,
    idle: Notify,
}

impl Scheduler {
    pub fn new(
        cfg: ScheduleConfig,
        fetcher: Arc<Fetcher>,
        registry: Arc<SubscriptionRegistry>,
        cursors: Arc<CursorStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            permits: Arc::new(Semaphore::new(cfg.max_concurrency.max(1))),
            cfg,
            fetcher,
            registry,
            cursors,
            slots: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            events,
            idle: Notify::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self, id: &SubscriptionId) -> Phase {
        let slots = self.slots.lock().expect("scheduler mutex poisoned");
        slots.get(id).map(|s| s.phase).unwrap_or(Phase::Idle)
    }

    /// Start a cycle if the trigger is accepted. The handle resolves when the cycle ends.
    pub fn trigger(
        self: &Arc<Self>,
        id: &SubscriptionId,
        trigger: Trigger,
    ) -> Result<JoinHandle<CycleReport>, SkipReason> {
        if !self.registry.contains(id) {
            return Err(SkipReason::Unregistered);
        }
        let fatal = self
            .registry
            .status(id)
            .is_some_and(|s| s.is_fatal());
        let cursor = self.cursors.get(id);
        let poll = self.cfg.poll_interval(cursor.poll_interval_secs);
        let now = Utc::now();

        let (cancel, generation) = {
            let mut slots = self.slots.lock().expect("scheduler mutex poisoned");
            let slot = slots
                .entry(id.clone())
                .or_insert_with(|| Slot::new(self.generations.fetch_add(1, Ordering::Relaxed)));
            match decide(slot.phase, trigger, fatal, &cursor, poll, now) {
                Decision::Skip(reason) => {
                    tracing::trace!(target: "sync", subscription = %id, ?trigger, ?reason, "trigger skipped");
                    return Err(reason);
                }
                Decision::Start => {
                    slot.phase = Phase::Fetching;
                    (slot.cancel.clone(), slot.generation)
                }
            }
        };

        tracing::debug!(target: "sync", subscription = %id, ?trigger, "cycle started");
        let this = Arc::clone(self);
        let id = id.clone();
        Ok(tokio::spawn(async move {
            let report = this.run_cycle(&id, trigger, &cancel).await;
            this.finish(&id, generation, &report);
            report
        }))
    }

    /// Cancel any in-flight cycle and forget the subscription's state.
    pub fn cancel(&self, id: &SubscriptionId) {
        let removed = {
            let mut slots = self.slots.lock().expect("scheduler mutex poisoned");
            slots.remove(id)
        };
        if let Some(slot) = removed {
            slot.cancel.cancel();
        }
        self.idle.notify_waiters();
    }

    pub fn cancel_all(&self) {
        let drained: Vec<Slot> = {
            let mut slots = self.slots.lock().expect("scheduler mutex poisoned");
            slots.drain().map(|(_, s)| s).collect()
        };
        for slot in drained {
            slot.cancel.cancel();
        }
        self.idle.notify_waiters();
    }

    /// Interval pass over every live subscription. Returns the started cycles.
    pub fn tick(self: &Arc<Self>, ids: &[SubscriptionId]) -> Vec<JoinHandle<CycleReport>> {
        let now = Utc::now();
        {
            let mut slots = self.slots.lock().expect("scheduler mutex poisoned");
            for slot in slots.values_mut() {
                if matches!(slot.phase, Phase::Backoff { until } if until <= now) {
                    slot.phase = Phase::Idle;
                }
            }
        }
        ids.iter()
            .filter_map(|id| self.trigger(id, Trigger::Interval).ok())
            .collect()
    }

    /// Resolves once no cycle is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if !self.any_fetching() {
                return;
            }
            notified.await;
        }
    }

    fn any_fetching(&self) -> bool {
        let slots = self.slots.lock().expect("scheduler mutex poisoned");
        slots.values().any(|s| s.phase == Phase::Fetching)
    }

    async fn run_cycle(
        &self,
        id: &SubscriptionId,
        trigger: Trigger,
        cancel: &CancellationToken,
    ) -> CycleReport {
        let mut report = CycleReport::new(id.clone());

        let _permit = tokio::select! {
            p = Arc::clone(&self.permits).acquire_owned() => match p {
                Ok(p) => p,
                Err(_) => {
                    report.outcome = CycleOutcome::Cancelled;
                    return report;
                }
            },
            _ = cancel.cancelled() => {
                report.outcome = CycleOutcome::Cancelled;
                return report;
            }
        };

        if trigger == (Trigger::Manual { force: true }) && !cancel.is_cancelled() {
            self.cursors.reset(id);
        }
        let cursor = self.cursors.get(id);
        let (mut mode, pages) = match trigger {
            Trigger::LoadMore => (PageMode::Next, 1),
            _ if cursor.never_fetched() => (PageMode::Next, self.cfg.initial_pages.max(1)),
            _ => (PageMode::Head, 1),
        };

        for _ in 0..pages {
            if cancel.is_cancelled() {
                report.outcome = CycleOutcome::Cancelled;
                break;
            }
            match self.fetcher.fetch(id, mode, cancel).await {
                Ok(FetchOutcome::Page(page)) => {
                    report.pages += 1;
                    report.inserted += page.inserted;
                    report.updated += page.updated;
                    if page.changed() {
                        let _ = self.events.send(SyncEvent::ItemsChanged(id.clone()));
                    }
                    if !page.has_more {
                        break;
                    }
                    mode = PageMode::Next;
                }
                Ok(FetchOutcome::NotModified) => {
                    report.outcome = CycleOutcome::NotModified;
                    break;
                }
                Ok(FetchOutcome::RateLimited { reset_at }) => {
                    report.outcome = CycleOutcome::RateLimited { reset_at };
                    break;
                }
                Err(FetchError::Cancelled(_)) => {
                    report.outcome = CycleOutcome::Cancelled;
                    break;
                }
                Err(FetchError::RateLimited { reset_at }) => {
                    report.outcome = CycleOutcome::RateLimited { reset_at };
                    break;
                }
                Err(e) => {
                    report.outcome = CycleOutcome::Failed {
                        error: e.to_string(),
                        retryable: e.is_retryable(),
                    };
                    break;
                }
            }
        }
        report
    }

    fn finish(&self, id: &SubscriptionId, generation: u64, report: &CycleReport) {
        let now = Utc::now();
        let next = match &report.outcome {
            CycleOutcome::RateLimited { reset_at } => Phase::Backoff {
                until: self.backoff_until(id, now).max(*reset_at),
            },
            CycleOutcome::Failed {
                retryable: true, ..
            } => Phase::Backoff {
                until: self.backoff_until(id, now),
            },
            _ => Phase::Idle,
        };

        {
            let mut slots = self.slots.lock().expect("scheduler mutex poisoned");
            // After a cancel the slot is gone or belongs to a newer registration.
            match slots.get_mut(id) {
                Some(slot) if slot.generation == generation => slot.phase = next,
                _ => {}
            }
        }

        match &report.outcome {
            CycleOutcome::Failed { error, retryable } => {
                tracing::warn!(target: "sync", subscription = %id, error = %error, retryable, phase = ?next, "cycle failed");
            }
            outcome => {
                tracing::debug!(target: "sync", subscription = %id, pages = report.pages, inserted = report.inserted, ?outcome, "cycle finished");
            }
        }
        let _ = self.events.send(SyncEvent::CycleFinished(id.clone()));
        self.idle.notify_waiters();
    }

    fn backoff_until(&self, id: &SubscriptionId, now: DateTime<Utc>) -> DateTime<Utc> {
        let failures = self.cursors.get(id).consecutive_failures;
        let delay = backoff_delay(failures, self.cfg.backoff_base(), self.cfg.backoff_cap());
        let jitter = if self.cfg.jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=self.cfg.jitter_ms))
        } else {
            Duration::ZERO
        };
        let total = chrono::Duration::from_std(delay + jitter)
            .unwrap_or_else(|_| chrono::Duration::seconds(self.cfg.backoff_cap_secs as i64));
        now + total
    }
}
