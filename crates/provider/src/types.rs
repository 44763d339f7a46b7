use std::{collections::HashMap, time::Duration};
use tokio::time::Instant;

/// Flat configuration snapshot keyed by normalized hierarchical key.
///
/// A `None` value is a key that exists but carries a null value.
pub type ConfigMap = HashMap<String, Option<String>>;

/// Provider error enum
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The remote service could not be reached or rejected the request
    #[error("failed to fetch {name}: {message}")]
    Fetch {
        /// Identifier of the remote resource
        name: String,
        /// Transport level failure description
        message: String,
    },
    /// The remote payload was not in the expected shape
    #[error("failed to parse remote payload: {0}")]
    Parse(String),
    /// The fetch did not finish before the configured deadline
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The streaming client could not establish a session
    #[error("failed to connect: {0}")]
    Connect(String),
    /// The first load produced no usable data and there is nothing to fall back to
    #[error("no configuration available: {0}")]
    NoPriorData(String),
    /// Options failed validation at construction
    #[error("invalid provider options: {0}")]
    InvalidOptions(String),
}

impl ProviderError {
    /// Returns `true` when the error must abort startup instead of being
    /// absorbed by the stale-cache fallback.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::NoPriorData(_) | Self::InvalidOptions(_))
    }
}

/// Why a refresh attempt did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another refresh holds the guard.
    InProgress,
    /// The previous successful refresh is younger than the minimum interval.
    RateLimited,
}

/// Result of a single refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The cache was replaced with a freshly fetched map.
    Refreshed {
        /// Number of keys in the new map
        keys: usize,
    },
    /// The attempt did not fetch.
    Skipped(SkipReason),
    /// The fetch failed and the previous cache is still being served.
    Retained,
}

impl RefreshOutcome {
    /// Returns `true` if the cache was replaced.
    pub const fn is_refreshed(&self) -> bool {
        matches!(self, Self::Refreshed { .. })
    }
}

/// Point-in-time view of a provider's refresh bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshStatus {
    /// Completion time of the last successful refresh
    pub last_refresh: Option<Instant>,
    /// Message of the most recent failure, cleared by the next success
    pub last_error: Option<String>,
    /// Failures since the last success
    pub consecutive_failures: u64,
    /// Successful refreshes over the provider's lifetime
    pub refresh_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_construction_errors_are_fatal() {
        assert!(ProviderError::NoPriorData("x".into()).is_fatal());
        assert!(ProviderError::InvalidOptions("x".into()).is_fatal());
        assert!(!ProviderError::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(!ProviderError::Parse("x".into()).is_fatal());
        assert!(!ProviderError::Connect("x".into()).is_fatal());
        assert!(!ProviderError::Fetch { name: "a".into(), message: "b".into() }.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = ProviderError::Fetch { name: "arn:secret".into(), message: "denied".into() };
        assert_eq!(err.to_string(), "failed to fetch arn:secret: denied");
    }
}
