// src/sync/mod.rs
pub mod columns;
pub mod cursor;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod merger;
pub mod normalize;
pub mod persist;
pub mod rate_limit;
pub mod registry;
pub mod scheduler;
pub mod types;

pub use error::{EngineError, FetchError, RequestError};
pub use types::{ColumnId, Item, Mark, RequestKind, RequestModel, SourceType, SubscriptionId};

use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(describe_metrics);
}

/// Register help text with the current recorder.
pub(crate) fn describe_metrics() {
    describe_counter!(
        "sync_fetch_total",
        "Page fetches by mode (next/head) and outcome."
    );
    describe_counter!(
        "sync_items_upserted_total",
        "Items inserted or refreshed in subscription caches."
    );
    describe_counter!(
        "sync_malformed_records_total",
        "Source records skipped by the normalizer."
    );
    describe_counter!(
        "sync_rate_limited_total",
        "Fetches denied or rejected for rate-limit reasons."
    );
    describe_histogram!("sync_fetch_ms", "Page fetch latency in milliseconds.");
    describe_gauge!("sync_subscriptions", "Registered subscriptions.");
}

/// Clean a display title: collapse whitespace, trim, cap at 300 chars.
pub fn normalize_title(s: &str) -> String {
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").expect("whitespace regex"));
    let out = re_ws.replace_all(s, " ");
    let out = out.trim();

    if out.chars().count() > 300 {
        out.chars().take(300).collect()
    } else {
        out.to_string()
    }
}
