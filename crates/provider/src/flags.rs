//! Push provider mirroring remote feature flags.
//!
//! The streaming client is connected lazily on the first load, under the
//! refresh guard, and kept for the provider's lifetime. Change
//! notifications from the client re-run the load, a burst of them at most
//! once more; there is no timer.
//!
//! Flags are evaluated under an anonymous context, filtered to keys that
//! start with the configured prefix, and mapped to configuration keys by
//! stripping the prefix and replacing `-` with `:`.

use crate::{
    handler::ConfigChangeHandler,
    keys,
    provider::ConfigurationProvider,
    refresh::{DEFAULT_FETCH_TIMEOUT, RefreshSource, RefreshableProvider},
    types::{ConfigMap, ProviderError, RefreshOutcome, RefreshStatus},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, error, info};
use url::Url;

/// Prefix selecting the flags that become configuration values.
pub const DEFAULT_FLAG_PREFIX: &str = "configure-backend-";

/// Context flags are evaluated under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationContext {
    /// Context kind
    pub kind: String,
    /// Context key
    pub key: String,
    /// Whether the context represents an anonymous user
    pub anonymous: bool,
}

impl EvaluationContext {
    /// The shared anonymous context. Values are not targeted per user.
    pub fn anonymous() -> Self {
        Self { kind: "user".to_string(), key: "anon".to_string(), anonymous: true }
    }
}

/// Snapshot of every flag value as seen by the client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlagsState {
    /// `false` when the client could not produce a trustworthy snapshot,
    /// e.g. it never connected
    pub valid: bool,
    /// Flag key to evaluated value
    pub values: HashMap<String, JsonValue>,
}

impl FlagsState {
    /// A valid snapshot.
    pub fn valid(values: HashMap<String, JsonValue>) -> Self {
        Self { valid: true, values }
    }

    /// An invalid, empty snapshot.
    pub fn invalid() -> Self {
        Self::default()
    }
}

/// A remote flag mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagChange {
    /// Key of the flag that changed
    pub key: String,
}

/// Callback invoked by the client on every remote flag change.
pub type FlagChangeCallback = Box<dyn Fn(&FlagChange) + Send + Sync>;

/// A live session with the flag service.
#[async_trait]
pub trait FlagHandle: Send + Sync {
    /// Evaluates every flag for `context`.
    async fn all_flags_state(&self, context: &EvaluationContext) -> FlagsState;

    /// Registers a change callback. Callbacks may fire from any thread, at
    /// least once per change, with no ordering across flags.
    fn on_change(&self, callback: FlagChangeCallback);
}

/// Opens sessions with the flag service.
#[async_trait]
pub trait FlagStreamClient: Send + Sync + 'static {
    /// Connects with `sdk_key`.
    async fn connect(
        &self,
        sdk_key: &str,
        options: &FlagClientOptions,
    ) -> Result<Arc<dyn FlagHandle>, ProviderError>;
}

/// Options handed to [`FlagStreamClient::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagClientOptions {
    /// Disable diagnostic telemetry sent to the flag service
    pub diagnostic_opt_out: bool,
    /// Override for the streaming endpoint
    pub stream_uri: Option<Url>,
    /// How long connect waits for the initial flag payload
    pub start_wait: Duration,
}

impl Default for FlagClientOptions {
    fn default() -> Self {
        Self { diagnostic_opt_out: true, stream_uri: None, start_wait: Duration::from_secs(5) }
    }
}

/// Options for [`PushFlagProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagsOptions {
    /// SDK key for the flag service
    pub sdk_key: String,
    /// Only flags starting with this prefix are mirrored
    pub prefix: String,
    /// Minimum spacing between refreshes, zero to apply every change
    pub min_refresh_interval: Duration,
    /// Deadline for connecting plus taking one snapshot
    pub fetch_timeout: Duration,
    /// Client options; telemetry is always opted out
    pub client: FlagClientOptions,
}

impl FlagsOptions {
    /// Options for `sdk_key` with the default prefix.
    pub fn new(sdk_key: impl Into<String>) -> Result<Self, ProviderError> {
        let sdk_key = sdk_key.into();
        if sdk_key.trim().is_empty() {
            return Err(ProviderError::InvalidOptions("sdk key must not be empty".to_string()));
        }
        Ok(Self {
            sdk_key,
            prefix: DEFAULT_FLAG_PREFIX.to_string(),
            min_refresh_interval: Duration::ZERO,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            client: FlagClientOptions::default(),
        })
    }

    /// Sets the flag key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets the minimum refresh interval.
    pub const fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Sets the fetch timeout.
    pub const fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Sets the client options.
    pub fn with_client_options(mut self, client: FlagClientOptions) -> Self {
        self.client = client;
        self
    }
}

/// Lifecycle of a [`PushFlagProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagProviderState {
    /// No load has run yet.
    Uninitialized,
    /// Opening the client session.
    Connecting,
    /// At least one snapshot was applied.
    Ready,
    /// The first load produced no data. Terminal.
    Failed,
}

/// Maps a flag snapshot to configuration values.
///
/// Null flags and flags without `prefix` are dropped. String values are
/// used verbatim, anything else as its JSON text. If two flags normalize to
/// the same key the lexicographically greater flag key wins.
pub fn flags_to_map(values: &HashMap<String, JsonValue>, prefix: &str) -> ConfigMap {
    let mut flags: Vec<_> = values.iter().filter(|(_, value)| !value.is_null()).collect();
    flags.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
    flags
        .into_iter()
        .filter_map(|(key, value)| {
            let value = match value {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            keys::flag_key(key, prefix).map(|key| (key, Some(value)))
        })
        .collect()
}

#[derive(Default)]
struct FlagSession {
    handle: Option<Arc<dyn FlagHandle>>,
    loaded: bool,
}

struct FlagSource {
    client: Arc<dyn FlagStreamClient>,
    sdk_key: String,
    prefix: String,
    client_options: FlagClientOptions,
    name: String,
    phase: Mutex<FlagProviderState>,
    changed: Arc<Notify>,
}

impl FlagSource {
    fn set_phase(&self, phase: FlagProviderState) {
        *self.phase.lock() = phase;
    }

    async fn connect(&self, no_prior_data: bool) -> Result<Arc<dyn FlagHandle>, ProviderError> {
        self.set_phase(FlagProviderState::Connecting);
        let handle = match self.client.connect(&self.sdk_key, &self.client_options).await {
            Ok(handle) => handle,
            Err(err) if no_prior_data => {
                return Err(ProviderError::NoPriorData(format!("could not connect to flag service: {err}")));
            }
            Err(err) => return Err(err),
        };

        let changed = self.changed.clone();
        let name = self.name.clone();
        handle.on_change(Box::new(move |change: &FlagChange| {
            debug!(target: "skyconf::flags", source = %name, flag = %change.key, "flag changed");
            // changes arriving before the listener wakes share one permit
            changed.notify_one();
        }));
        info!(target: "skyconf::flags", source = %self.name, "connected to flag service");
        Ok(handle)
    }
}

#[async_trait]
impl RefreshSource for FlagSource {
    type Session = FlagSession;

    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        session: &mut FlagSession,
        current: &ConfigMap,
    ) -> Result<ConfigMap, ProviderError> {
        let no_prior_data = !session.loaded && current.is_empty();
        let handle = match session.handle.clone() {
            Some(handle) => handle,
            None => {
                let handle = self.connect(no_prior_data).await?;
                session.handle = Some(handle.clone());
                handle
            }
        };

        let state = handle.all_flags_state(&EvaluationContext::anonymous()).await;
        if !state.valid {
            if no_prior_data {
                return Err(ProviderError::NoPriorData("could not load initial flags".to_string()));
            }
            return Err(ProviderError::Connect("flag snapshot reported invalid".to_string()));
        }

        session.loaded = true;
        Ok(flags_to_map(&state.values, &self.prefix))
    }
}

struct FlagShared {
    inner: RefreshableProvider<FlagSource>,
    handler: Option<Arc<dyn ConfigChangeHandler>>,
    /// Set once any snapshot has been applied.
    loaded: AtomicBool,
}

impl FlagShared {
    fn state(&self) -> FlagProviderState {
        *self.inner.source().phase.lock()
    }

    async fn load(&self) -> Result<RefreshOutcome, ProviderError> {
        if self.state() == FlagProviderState::Failed {
            return Err(ProviderError::NoPriorData(format!("{} failed its initial load", self.inner.name())));
        }
        match self.inner.refresh().await {
            // a first load that gave up (e.g. timed out connecting) leaves
            // nothing to serve and no change callback to recover through
            Ok(RefreshOutcome::Retained) if !self.loaded.load(Ordering::Acquire) => {
                self.inner.source().set_phase(FlagProviderState::Failed);
                Err(ProviderError::NoPriorData(format!(
                    "{} did not complete its initial load",
                    self.inner.name()
                )))
            }
            Ok(outcome) => {
                if outcome.is_refreshed() {
                    self.loaded.store(true, Ordering::Release);
                    self.inner.source().set_phase(FlagProviderState::Ready);
                }
                Ok(outcome)
            }
            Err(err) => {
                if matches!(err, ProviderError::NoPriorData(_)) {
                    self.inner.source().set_phase(FlagProviderState::Failed);
                }
                Err(err)
            }
        }
    }
}

/// Feature flag values refreshed on every remote change.
pub struct PushFlagProvider {
    shared: Arc<FlagShared>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for PushFlagProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushFlagProvider")
            .field("inner", &self.shared.inner)
            .field("state", &self.state())
            .field("handler", &self.shared.handler.is_some())
            .finish_non_exhaustive()
    }
}

impl PushFlagProvider {
    /// Creates the provider. Nothing connects until the first [`Self::load`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        client: Arc<dyn FlagStreamClient>,
        options: FlagsOptions,
        handler: Option<Arc<dyn ConfigChangeHandler>>,
    ) -> Self {
        let changed = Arc::new(Notify::new());
        let source = FlagSource {
            client,
            name: format!("flags:{}", options.prefix),
            sdk_key: options.sdk_key,
            prefix: options.prefix,
            client_options: FlagClientOptions { diagnostic_opt_out: true, ..options.client },
            phase: Mutex::new(FlagProviderState::Uninitialized),
            changed: changed.clone(),
        };
        let shared = Arc::new(FlagShared {
            inner: RefreshableProvider::new(source, options.min_refresh_interval, options.fetch_timeout),
            handler,
            loaded: AtomicBool::new(false),
        });
        let listener = tokio::spawn(Self::change_listener(Arc::downgrade(&shared), changed));
        Self { shared, listener: Mutex::new(Some(listener)) }
    }

    /// Reloads after change notifications.
    ///
    /// Notifications coalesce: any number of changes that arrive while a
    /// load runs cause exactly one further load.
    async fn change_listener(shared: Weak<FlagShared>, changed: Arc<Notify>) {
        loop {
            changed.notified().await;
            let Some(shared) = shared.upgrade() else { break };
            match shared.load().await {
                Ok(outcome) if outcome.is_refreshed() => {
                    if let Some(handler) = &shared.handler {
                        handler.on_reload(shared.inner.name(), &shared.inner.snapshot());
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    error!(target: "skyconf::flags", source = shared.inner.name(), %err, "reload after flag change failed");
                }
            }
        }
    }

    /// Provider identity, `flags:<prefix>`.
    pub fn name(&self) -> &str {
        self.shared.inner.name()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FlagProviderState {
        self.shared.state()
    }

    /// Connects if needed and applies a fresh snapshot.
    ///
    /// Fails with [`ProviderError::NoPriorData`] when the very first load
    /// yields no valid snapshot, including when it times out; once failed
    /// the provider stays failed.
    pub async fn load(&self) -> Result<RefreshOutcome, ProviderError> {
        self.shared.load().await
    }

    /// Case-insensitive lookup.
    pub fn try_get(&self, key: &str) -> Option<Option<String>> {
        self.shared.inner.try_get(key)
    }

    /// The map currently served.
    pub fn snapshot(&self) -> Arc<ConfigMap> {
        self.shared.inner.snapshot()
    }

    /// Refresh bookkeeping, `None` while a refresh is running.
    pub fn status(&self) -> Option<RefreshStatus> {
        self.shared.inner.status()
    }
}

impl Drop for PushFlagProvider {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

#[async_trait]
impl ConfigurationProvider for PushFlagProvider {
    fn name(&self) -> &str {
        self.shared.inner.name()
    }

    async fn load(&self) -> Result<(), ProviderError> {
        self.shared.load().await.map(|_| ())
    }

    fn try_get(&self, key: &str) -> Option<Option<String>> {
        self.shared.inner.try_get(key)
    }
}
