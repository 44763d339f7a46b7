//! Polling provider for secret overrides.
//!
//! The secret payload is a single JSON object of flat `Section__Key` pairs.
//! A repeating timer re-fetches it; the first tick fires after twice the
//! minimum refresh interval, so the bootstrap [`PollingSecretProvider::load`]
//! is what populates the cache initially.

use crate::{
    handler::ConfigChangeHandler,
    keys,
    provider::ConfigurationProvider,
    refresh::{DEFAULT_FETCH_TIMEOUT, DEFAULT_MIN_REFRESH_INTERVAL, RefreshSource, RefreshableProvider},
    types::{ConfigMap, ProviderError, RefreshOutcome, RefreshStatus},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::HashMap, collections::hash_map::Entry, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info};

/// Pulls a secret payload from a remote secret store.
#[async_trait]
pub trait SecretFetcher: Send + Sync + 'static {
    /// Returns the secret's string value, or `None` when the secret holds no
    /// string value. Implementations should bound their own network calls;
    /// the provider additionally enforces its fetch timeout.
    async fn fetch_secret(&self, secret_id: &str) -> Result<Option<String>, ProviderError>;
}

/// Options for [`PollingSecretProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretsOptions {
    /// Identifier (name or ARN) of the secret to poll
    pub secret_id: String,
    /// Timer period and minimum spacing between refreshes
    pub min_refresh_interval: Duration,
    /// Deadline for a single fetch
    pub fetch_timeout: Duration,
}

impl SecretsOptions {
    /// Options for `secret_id` with default intervals.
    pub fn new(secret_id: impl Into<String>) -> Result<Self, ProviderError> {
        let secret_id = secret_id.into();
        if secret_id.trim().is_empty() {
            return Err(ProviderError::InvalidOptions("secret id must not be empty".to_string()));
        }
        Ok(Self {
            secret_id,
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        })
    }

    /// Sets the refresh interval.
    pub const fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Sets the fetch timeout.
    pub const fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

/// Parses a secret payload into a normalized map.
///
/// A missing payload or a JSON `null` yields an empty map. Keys that collide
/// after normalization are rejected.
pub fn parse_secret(raw: Option<&str>) -> Result<ConfigMap, ProviderError> {
    let Some(raw) = raw else { return Ok(ConfigMap::new()) };
    let overrides: Option<HashMap<String, Option<String>>> =
        serde_json::from_str(raw).map_err(|e| ProviderError::Parse(e.to_string()))?;

    let mut map = ConfigMap::new();
    for (key, value) in overrides.unwrap_or_default() {
        match map.entry(keys::secret_key(&key)) {
            Entry::Occupied(entry) => {
                return Err(ProviderError::Parse(format!("duplicate key after normalization: {}", entry.key())));
            }
            Entry::Vacant(entry) => {
                entry.insert(value);
            }
        }
    }
    Ok(map)
}

struct SecretSource {
    fetcher: Arc<dyn SecretFetcher>,
    secret_id: String,
    name: String,
}

#[async_trait]
impl RefreshSource for SecretSource {
    type Session = ();

    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, _: &mut (), _: &ConfigMap) -> Result<ConfigMap, ProviderError> {
        let raw = self.fetcher.fetch_secret(&self.secret_id).await?;
        parse_secret(raw.as_deref())
    }
}

#[derive(Debug, Default)]
struct TimerState {
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

/// Secret overrides refreshed on a repeating timer.
#[derive(Debug)]
pub struct PollingSecretProvider {
    inner: Arc<RefreshableProvider<SecretSource>>,
    timer: Mutex<TimerState>,
}

impl PollingSecretProvider {
    /// Creates the provider and schedules its refresh timer.
    ///
    /// Must be called from within a tokio runtime. The cache starts empty;
    /// call [`Self::load`] before serving configuration.
    pub fn new(
        fetcher: Arc<dyn SecretFetcher>,
        options: SecretsOptions,
        handler: Option<Arc<dyn ConfigChangeHandler>>,
    ) -> Result<Self, ProviderError> {
        let period = options.min_refresh_interval;
        if period.is_zero() {
            return Err(ProviderError::InvalidOptions(
                "refresh interval must be greater than zero".to_string(),
            ));
        }
        let start = Instant::now().checked_add(period.saturating_mul(2)).ok_or_else(|| {
            ProviderError::InvalidOptions(format!("refresh interval too large: {period:?}"))
        })?;

        let source = SecretSource {
            fetcher,
            name: format!("secrets:{}", options.secret_id),
            secret_id: options.secret_id,
        };
        let inner = Arc::new(RefreshableProvider::new(source, period, options.fetch_timeout));

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(Self::timer_task(inner.clone(), handler, start, period, shutdown_rx));
        info!(target: "skyconf::secrets", source = inner.name(), ?period, "scheduled secret refresh");

        Ok(Self {
            inner,
            timer: Mutex::new(TimerState { task: Some(task), shutdown_tx: Some(shutdown_tx) }),
        })
    }

    async fn timer_task(
        inner: Arc<RefreshableProvider<SecretSource>>,
        handler: Option<Arc<dyn ConfigChangeHandler>>,
        start: Instant,
        period: Duration,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(target: "skyconf::secrets", source = inner.name(), "stopping refresh timer");
                    break;
                }
                _ = ticker.tick() => {
                    match inner.refresh().await {
                        Ok(outcome) => {
                            debug!(target: "skyconf::secrets", source = inner.name(), ?outcome, "timer refresh");
                        }
                        Err(err) => {
                            error!(target: "skyconf::secrets", source = inner.name(), %err, "timer refresh failed");
                        }
                    }
                    if let Some(handler) = &handler {
                        handler.on_reload(inner.name(), &inner.snapshot());
                    }
                }
            }
        }
    }

    /// Provider identity, `secrets:<secret id>`.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Attempts a refresh and reports what happened.
    pub async fn refresh(&self) -> Result<RefreshOutcome, ProviderError> {
        self.inner.refresh().await
    }

    /// Attempts a refresh; transient failures are absorbed.
    pub async fn load(&self) -> Result<(), ProviderError> {
        self.inner.refresh().await.map(|_| ())
    }

    /// Case-insensitive lookup.
    pub fn try_get(&self, key: &str) -> Option<Option<String>> {
        self.inner.try_get(key)
    }

    /// The map currently served.
    pub fn snapshot(&self) -> Arc<ConfigMap> {
        self.inner.snapshot()
    }

    /// Refresh bookkeeping, `None` while a refresh is running.
    pub fn status(&self) -> Option<RefreshStatus> {
        self.inner.status()
    }

    /// Stops the refresh timer. Cached values stay readable.
    pub async fn stop(&self) {
        let (shutdown_tx, task) = {
            let mut state = self.timer.lock();
            (state.shutdown_tx.take(), state.task.take())
        };
        if let Some(tx) = shutdown_tx {
            // closed once the timer task has exited; abort below covers it
            let _ = tx.send(()).await;
        }
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for PollingSecretProvider {
    fn drop(&mut self) {
        if let Some(task) = self.timer.get_mut().task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl ConfigurationProvider for PollingSecretProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn load(&self) -> Result<(), ProviderError> {
        Self::load(self).await
    }

    fn try_get(&self, key: &str) -> Option<Option<String>> {
        self.inner.try_get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SkipReason;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        payload: Mutex<Result<Option<String>, ProviderError>>,
        calls: AtomicUsize,
    }

    impl CountingFetcher {
        fn new(payload: &str) -> Arc<Self> {
            Arc::new(Self {
                payload: Mutex::new(Ok(Some(payload.to_string()))),
                calls: AtomicUsize::new(0),
            })
        }

        fn set(&self, payload: Result<Option<String>, ProviderError>) {
            *self.payload.lock() = payload;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SecretFetcher for CountingFetcher {
        async fn fetch_secret(&self, secret_id: &str) -> Result<Option<String>, ProviderError> {
            assert_eq!(secret_id, "arn:test");
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.payload.lock().clone()
        }
    }

    fn options() -> SecretsOptions {
        SecretsOptions::new("arn:test").unwrap()
    }

    #[test]
    fn test_parse_secret_normalizes_keys() {
        let map = parse_secret(Some(r#"{"Foo__Bar": "1", "BAZ": "2"}"#)).unwrap();
        let expected: ConfigMap = [
            ("foo:bar".to_string(), Some("1".to_string())),
            ("baz".to_string(), Some("2".to_string())),
        ]
        .into_iter()
        .collect();
        assert_eq!(map, expected);
    }

    #[test]
    fn test_parse_secret_null_and_missing_are_empty() {
        assert!(parse_secret(None).unwrap().is_empty());
        assert!(parse_secret(Some("null")).unwrap().is_empty());
    }

    #[test]
    fn test_parse_secret_keeps_null_values() {
        let map = parse_secret(Some(r#"{"Section__Key": null}"#)).unwrap();
        assert_eq!(map.get("section:key"), Some(&None));
    }

    #[test]
    fn test_parse_secret_rejects_invalid_payloads() {
        assert!(matches!(parse_secret(Some("not json")), Err(ProviderError::Parse(_))));
        assert!(matches!(parse_secret(Some(r#"{"a": 1}"#)), Err(ProviderError::Parse(_))));
        assert!(matches!(parse_secret(Some(r#"["a"]"#)), Err(ProviderError::Parse(_))));
    }

    #[test]
    fn test_parse_secret_rejects_colliding_keys() {
        let err = parse_secret(Some(r#"{"A__B": "1", "a__b": "2"}"#)).unwrap_err();
        assert!(err.to_string().contains("a:b"));
    }

    #[test]
    fn test_options_reject_empty_secret_id() {
        assert!(SecretsOptions::new("  ").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_rejected() {
        let fetcher = CountingFetcher::new("{}");
        let options = options().with_min_refresh_interval(Duration::ZERO);
        let err = PollingSecretProvider::new(fetcher, options, None).unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_populates_cache() {
        let fetcher = CountingFetcher::new(r#"{"Foo__Bar": "1", "BAZ": "2"}"#);
        let provider = PollingSecretProvider::new(fetcher.clone(), options(), None).unwrap();

        provider.load().await.unwrap();

        assert_eq!(provider.try_get("Foo:Bar"), Some(Some("1".into())));
        assert_eq!(provider.try_get("foo:bar"), Some(Some("1".into())));
        assert_eq!(provider.try_get("baz"), Some(Some("2".into())));
        assert_eq!(provider.name(), "secrets:arn:test");
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_first_fires_after_twice_the_interval() {
        let fetcher = CountingFetcher::new(r#"{"A": "1"}"#);
        let reloads = Arc::new(AtomicUsize::new(0));
        let handler: Arc<dyn ConfigChangeHandler> = Arc::new({
            let reloads = reloads.clone();
            move |source: &str, _: &ConfigMap| {
                assert_eq!(source, "secrets:arn:test");
                reloads.fetch_add(1, Ordering::SeqCst);
            }
        });
        let provider = PollingSecretProvider::new(fetcher.clone(), options(), Some(handler)).unwrap();
        provider.load().await.unwrap();

        tokio::time::sleep(Duration::from_secs(119)).await;
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(reloads.load(Ordering::SeqCst), 0);

        fetcher.set(Ok(Some(r#"{"A": "2"}"#.to_string())));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(reloads.load(Ordering::SeqCst), 1);
        assert_eq!(provider.try_get("a"), Some(Some("2".into())));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fetcher.calls(), 3);
        assert_eq!(reloads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_serves_stale_values() {
        let fetcher = CountingFetcher::new(r#"{"A": "1"}"#);
        let provider = PollingSecretProvider::new(fetcher.clone(), options(), None).unwrap();
        provider.load().await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        fetcher.set(Err(ProviderError::Fetch { name: "arn:test".into(), message: "throttled".into() }));

        assert_eq!(provider.refresh().await.unwrap(), RefreshOutcome::Retained);
        assert_eq!(provider.try_get("A"), Some(Some("1".into())));
        assert_eq!(provider.status().unwrap().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_within_interval_is_rate_limited() {
        let fetcher = CountingFetcher::new(r#"{"A": "1"}"#);
        let provider = PollingSecretProvider::new(fetcher.clone(), options(), None).unwrap();
        provider.load().await.unwrap();

        assert_eq!(provider.refresh().await.unwrap(), RefreshOutcome::Skipped(SkipReason::RateLimited));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timer() {
        let fetcher = CountingFetcher::new("{}");
        let provider = PollingSecretProvider::new(fetcher.clone(), options(), None).unwrap();
        provider.stop().await;

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_twice_keeps_values_readable() {
        let fetcher = CountingFetcher::new(r#"{"A__B": "c"}"#);
        let provider = PollingSecretProvider::new(fetcher.clone(), options(), None).unwrap();
        provider.load().await.unwrap();

        provider.stop().await;
        provider.stop().await;

        assert_eq!(provider.try_get("a:b"), Some(Some("c".into())));
        assert_eq!(provider.refresh().await.unwrap(), RefreshOutcome::Skipped(SkipReason::RateLimited));
    }
}
