//! Shared refresh engine: guarded, rate-limited fetches published as
//! immutable cache snapshots.
//!
//! The guard is only ever taken with `try_lock`. A refresh triggered while
//! another is running returns [`SkipReason::InProgress`] straight away; the
//! newer trigger is dropped rather than queued, so timer and change
//! notification tasks never wait on a fetch.

use crate::{
    keys,
    types::{ConfigMap, ProviderError, RefreshOutcome, RefreshStatus, SkipReason},
};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::{fmt, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, trace, warn};

/// Default minimum spacing between two successful refreshes.
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Default deadline for a single fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// The fetch-and-transform half of a provider.
#[async_trait]
pub trait RefreshSource: Send + Sync + 'static {
    /// Per-provider state that only exists while the refresh guard is held,
    /// e.g. a lazily opened client session.
    type Session: Default + Send;

    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Fetches remote data and transforms it into a complete map.
    ///
    /// `current` is the map readers currently see.
    async fn fetch(
        &self,
        session: &mut Self::Session,
        current: &ConfigMap,
    ) -> Result<ConfigMap, ProviderError>;
}

/// Bookkeeping guarded by the refresh lock.
#[derive(Debug, Default)]
struct RefreshState<T> {
    last_refresh: Option<Instant>,
    last_error: Option<String>,
    consecutive_failures: u64,
    refresh_count: u64,
    session: T,
}

impl<T> RefreshState<T> {
    fn status(&self) -> RefreshStatus {
        RefreshStatus {
            last_refresh: self.last_refresh,
            last_error: self.last_error.clone(),
            consecutive_failures: self.consecutive_failures,
            refresh_count: self.refresh_count,
        }
    }
}

/// Cache plus refresh guard around a [`RefreshSource`].
pub struct RefreshableProvider<S: RefreshSource> {
    source: S,
    cache: ArcSwap<ConfigMap>,
    state: Mutex<RefreshState<S::Session>>,
    min_refresh_interval: Duration,
    fetch_timeout: Duration,
}

impl<S: RefreshSource> fmt::Debug for RefreshableProvider<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshableProvider")
            .field("source", &self.source.name())
            .field("keys", &self.cache.load().len())
            .field("min_refresh_interval", &self.min_refresh_interval)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("state", &"<locked>")
            .finish()
    }
}

impl<S: RefreshSource> RefreshableProvider<S> {
    /// Creates a provider with an empty cache that has never refreshed.
    pub fn new(source: S, min_refresh_interval: Duration, fetch_timeout: Duration) -> Self {
        Self {
            source,
            cache: ArcSwap::from_pointee(ConfigMap::new()),
            state: Mutex::new(RefreshState::default()),
            min_refresh_interval,
            fetch_timeout,
        }
    }

    /// The wrapped source.
    pub const fn source(&self) -> &S {
        &self.source
    }

    /// Source name used in logs.
    pub fn name(&self) -> &str {
        self.source.name()
    }

    /// Minimum spacing between successful refreshes.
    pub const fn min_refresh_interval(&self) -> Duration {
        self.min_refresh_interval
    }

    /// Attempts one refresh.
    ///
    /// Transient failures are logged, recorded and reported as
    /// [`RefreshOutcome::Retained`]; the previous cache and refresh time are
    /// left exactly as they were. Only fatal errors are returned as `Err`.
    pub async fn refresh(&self) -> Result<RefreshOutcome, ProviderError> {
        let Ok(mut state) = self.state.try_lock() else {
            trace!(target: "skyconf::refresh", source = self.name(), "refresh already in progress");
            return Ok(RefreshOutcome::Skipped(SkipReason::InProgress));
        };

        if state.last_refresh.is_some_and(|last| last.elapsed() < self.min_refresh_interval) {
            trace!(target: "skyconf::refresh", source = self.name(), "refreshed recently, skipping");
            return Ok(RefreshOutcome::Skipped(SkipReason::RateLimited));
        }

        let current = self.cache.load_full();
        let fetched =
            tokio::time::timeout(self.fetch_timeout, self.source.fetch(&mut state.session, &current))
                .await
                .unwrap_or(Err(ProviderError::Timeout(self.fetch_timeout)));

        match fetched {
            Ok(map) => {
                let keys = map.len();
                self.cache.store(Arc::new(map));
                state.last_refresh = Some(Instant::now());
                state.last_error = None;
                state.consecutive_failures = 0;
                state.refresh_count += 1;
                debug!(target: "skyconf::refresh", source = self.name(), keys, "cache replaced");
                Ok(RefreshOutcome::Refreshed { keys })
            }
            Err(err) => {
                state.last_error = Some(err.to_string());
                state.consecutive_failures += 1;
                if err.is_fatal() {
                    return Err(err);
                }
                report_failure(self.name(), &err);
                Ok(RefreshOutcome::Retained)
            }
        }
    }

    /// Case-insensitive lookup against the current snapshot.
    ///
    /// Returns `None` when the key is absent and `Some(value)` otherwise,
    /// where `value` is `None` for keys carrying a null.
    pub fn try_get(&self, key: &str) -> Option<Option<String>> {
        self.cache.load().get(&keys::lookup_key(key)).cloned()
    }

    /// The map readers currently see.
    pub fn snapshot(&self) -> Arc<ConfigMap> {
        self.cache.load_full()
    }

    /// Refresh bookkeeping, or `None` while a refresh holds the guard.
    pub fn status(&self) -> Option<RefreshStatus> {
        self.state.try_lock().ok().map(|state| state.status())
    }
}

/// Reports a transient refresh failure.
///
/// Providers load before the application has installed a subscriber, so
/// without one the failure goes to standard error instead.
fn report_failure(source: &str, err: &ProviderError) {
    if tracing::dispatcher::has_been_set() {
        warn!(target: "skyconf::refresh", source, %err, "refresh failed, serving previous values");
    } else {
        eprintln!("skyconf: failed to refresh {source}, serving previous values: {err}");
    }
}
