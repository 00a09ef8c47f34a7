// src/config.rs
//! Engine configuration: TOML file with serde defaults, then env overrides.
//!
//! Lookup order:
//! 1) $SYNC_CONFIG_PATH
//! 2) config/sync.toml
//! 3) built-in defaults

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/sync.toml";
pub const ENV_CONFIG_PATH: &str = "SYNC_CONFIG_PATH";

const ENV_API_BASE: &str = "GITHUB_API_BASE";
const ENV_MAX_CONCURRENCY: &str = "SYNC_MAX_CONCURRENCY";
const ENV_TICK_SECS: &str = "SYNC_TICK_SECS";
const ENV_STATE_PATH: &str = "SYNC_STATE_PATH";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub fetch: FetchConfig,
    pub schedule: ScheduleConfig,
    pub registry: RegistryConfig,
    pub persist: PersistConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub api_base: String,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            user_agent: "column-sync/0.1".to_string(),
            connect_timeout_secs: 4,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Ticker period driving interval refreshes, eviction and snapshots.
    pub tick_secs: u64,
    /// Bounds applied to the server-suggested poll interval.
    pub min_poll_secs: u64,
    pub max_poll_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_secs: u64,
    pub jitter_ms: u64,
    /// Global cap on concurrently running fetches.
    pub max_concurrency: usize,
    /// Pages fetched by the first cycle of a new subscription.
    pub initial_pages: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_secs: 10,
            min_poll_secs: 60,
            max_poll_secs: 3600,
            backoff_base_ms: 2_000,
            backoff_cap_secs: 900,
            jitter_ms: 1_000,
            max_concurrency: 4,
            initial_pages: 1,
        }
    }
}

impl ScheduleConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }

    /// Server poll interval clamped to `[min_poll_secs, max_poll_secs]`.
    pub fn poll_interval(&self, server_secs: Option<u64>) -> Duration {
        let min = self.min_poll_secs;
        let max = self.max_poll_secs.max(min);
        Duration::from_secs(server_secs.unwrap_or(min).clamp(min, max))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How long an ownerless subscription keeps its cache (undo window).
    pub grace_secs: u64,
    /// Unsaved items older than this are pruned.
    pub retention_days: i64,
    /// Cap on unsaved items kept per subscription.
    pub max_items_per_subscription: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            grace_secs: 30,
            retention_days: 7,
            max_items_per_subscription: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Snapshot file; `None` keeps state in memory only.
    pub state_path: Option<PathBuf>,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            state_path: Some(PathBuf::from("state/sync.json")),
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: SyncConfig = toml::from_str(s).context("parsing sync config toml")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading sync config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Load using env var + fallbacks, then apply env overrides.
    pub fn load_default() -> Result<Self> {
        let mut cfg = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            Self::load_from(&pb)?
        } else {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default.exists() {
                Self::load_from(&default)?
            } else {
                Self::default()
            }
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(base) = std::env::var(ENV_API_BASE) {
            let base = base.trim().trim_end_matches('/');
            if !base.is_empty() {
                self.fetch.api_base = base.to_string();
            }
        }
        if let Some(n) = env_parse::<usize>(ENV_MAX_CONCURRENCY) {
            self.schedule.max_concurrency = n;
        }
        if let Some(n) = env_parse::<u64>(ENV_TICK_SECS) {
            self.schedule.tick_secs = n;
        }
        if let Ok(p) = std::env::var(ENV_STATE_PATH) {
            self.persist.state_path = if p.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(p))
            };
        }
    }

    fn validate(&self) -> Result<()> {
        if self.schedule.max_concurrency == 0 {
            return Err(anyhow!("schedule.max_concurrency must be at least 1"));
        }
        if self.schedule.initial_pages == 0 {
            return Err(anyhow!("schedule.initial_pages must be at least 1"));
        }
        if self.fetch.api_base.trim().is_empty() {
            return Err(anyhow!("fetch.api_base must not be empty"));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
