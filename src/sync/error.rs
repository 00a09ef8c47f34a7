// src/sync/error.rs
use chrono::{DateTime, Utc};

use crate::sync::types::{ColumnId, RequestKind, SourceType, SubscriptionId, SubscriptionStatus};

/// Request model cannot be resolved to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("{kind:?} request requires param `{param}`")]
    MissingParam { kind: RequestKind, param: String },
    #[error("unknown {kind:?} subtype `{subtype}`")]
    UnknownSubtype { kind: RequestKind, subtype: String },
}

/// No usable credentials for an account.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no token available for account `{account}`")]
pub struct AuthError {
    pub account: String,
}

/// One source record could not be normalized. Never fails the page.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed {source_type:?} record: {reason}")]
pub struct MalformedRecord {
    pub source_type: SourceType,
    pub reason: String,
}

/// Transport-level failure of the outbound HTTP client.
#[derive(Debug, Clone, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// Failure of a single page fetch.
///
/// `Network`, `RateLimited` and `Malformed` are transient and recovered by scheduler backoff.
/// Everything else is fatal for the subscription until a manual refresh.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("request rejected with status {status}: {message}")]
    InvalidRequest { status: u16, message: String },
    #[error("rate limited until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },
    #[error("malformed page: {0}")]
    Malformed(String),
    #[error("subscription {0} is no longer registered")]
    Cancelled(SubscriptionId),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_) | FetchError::Malformed(_) | FetchError::RateLimited { .. }
        )
    }

    /// Status to surface on the subscription, for fatal errors.
    pub fn subscription_status(&self) -> Option<SubscriptionStatus> {
        match self {
            FetchError::Auth(m) => Some(SubscriptionStatus::AuthError { message: m.clone() }),
            FetchError::NotFound(m) => Some(SubscriptionStatus::NotFound { message: m.clone() }),
            FetchError::InvalidRequest { message, .. } => Some(SubscriptionStatus::Invalid {
                message: message.clone(),
            }),
            _ => None,
        }
    }

    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FetchError::Network(_) => "network",
            FetchError::Auth(_) => "auth",
            FetchError::NotFound(_) => "not_found",
            FetchError::InvalidRequest { .. } => "invalid",
            FetchError::RateLimited { .. } => "rate_limited",
            FetchError::Malformed(_) => "malformed",
            FetchError::Cancelled(_) => "cancelled",
        }
    }
}

impl From<TransportError> for FetchError {
    fn from(e: TransportError) -> Self {
        FetchError::Network(e.0)
    }
}

impl From<AuthError> for FetchError {
    fn from(e: AuthError) -> Self {
        FetchError::Auth(e.to_string())
    }
}

/// Misuse of the inbound engine API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown column {0}")]
    UnknownColumn(ColumnId),
    #[error("column {column} has no subscription {subscription}")]
    UnknownSubscription {
        column: ColumnId,
        subscription: SubscriptionId,
    },
    #[error("column {column} has no item {item}")]
    UnknownItem { column: ColumnId, item: String },
    #[error("a column needs at least one subscription")]
    EmptyColumn,
    #[error(transparent)]
    InvalidRequest(#[from] RequestError),
}

