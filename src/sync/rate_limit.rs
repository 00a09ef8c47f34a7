// src/sync/rate_limit.rs
//! Shared request budget per external account.
//!
//! Every subscription of an account goes through the same budget, so the
//! counters live here and not on the subscription. Each account has its own
//! lock; updates for one account are serialized, different accounts never
//! contend beyond the short map lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

/// Used when the source says the budget is gone but gives no reset time.
const FALLBACK_RESET_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Allowed,
    Denied { reset_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Default)]
struct Budget {
    remaining: Option<u32>,
    reset_at: Option<DateTime<Utc>>,
}

impl Budget {
    fn roll_window(&mut self, now: DateTime<Utc>) {
        if matches!(self.reset_at, Some(reset) if reset <= now) {
            self.remaining = None;
            self.reset_at = None;
        }
    }
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    accounts: Mutex<HashMap<String, Arc<Mutex<Budget>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn budget(&self, account: &str) -> Arc<Mutex<Budget>> {
        let mut map = self.accounts.lock().expect("rate limiter mutex poisoned");
        map.entry(account.to_string()).or_default().clone()
    }

    /// Take one request from the account budget.
    pub fn reserve(&self, account: &str, now: DateTime<Utc>) -> Reservation {
        let budget = self.budget(account);
        let mut b = budget.lock().expect("account budget mutex poisoned");
        b.roll_window(now);
        match b.remaining {
            Some(0) => Reservation::Denied {
                reset_at: b
                    .reset_at
                    .unwrap_or_else(|| now + Duration::seconds(FALLBACK_RESET_SECS)),
            },
            Some(n) => {
                b.remaining = Some(n - 1);
                Reservation::Allowed
            }
            // Unknown budget: let the request through and learn from the response.
            None => Reservation::Allowed,
        }
    }

    /// Update from response headers.
    ///
    /// Responses of concurrent fetches may land out of order; within one reset
    /// window the lowest reported remaining count is kept.
    pub fn record_response(
        &self,
        account: &str,
        remaining: Option<u32>,
        reset_at: Option<DateTime<Utc>>,
    ) {
        if remaining.is_none() && reset_at.is_none() {
            return;
        }
        let budget = self.budget(account);
        let mut b = budget.lock().expect("account budget mutex poisoned");
        let same_window = reset_at.is_none() || b.reset_at == reset_at;
        match (same_window, remaining, b.remaining) {
            (true, Some(new), Some(cur)) => b.remaining = Some(new.min(cur)),
            (_, Some(new), _) => b.remaining = Some(new),
            _ => {}
        }
        if reset_at.is_some() {
            b.reset_at = reset_at;
        }
    }

    /// The source rejected a request for budget reasons.
    pub fn mark_exhausted(&self, account: &str, reset_at: DateTime<Utc>) {
        let budget = self.budget(account);
        let mut b = budget.lock().expect("account budget mutex poisoned");
        b.remaining = Some(0);
        b.reset_at = Some(reset_at);
    }

    pub fn remaining(&self, account: &str) -> Option<u32> {
        let budget = self.budget(account);
        let b = budget.lock().expect("account budget mutex poisoned");
        b.remaining
    }
}
