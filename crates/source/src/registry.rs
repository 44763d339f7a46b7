//! Process-wide provider instances keyed by source identity.

use async_once_cell::OnceCell;
use parking_lot::Mutex;
use skyconf_provider::{
    ConfigChangeHandler, FlagStreamClient, FlagsOptions, PollingSecretProvider, ProviderError,
    PushFlagProvider, SecretFetcher, SecretsOptions,
};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, LazyLock},
};
use tracing::info;

type Slot<P> = Arc<OnceCell<Arc<P>>>;

static GLOBAL: LazyLock<ProviderRegistry> = LazyLock::new(ProviderRegistry::default);

/// Hands out one provider per source identity.
///
/// A provider is built and loaded at most once per key. When the initial
/// load fails the slot stays empty and the next caller builds a fresh
/// instance.
#[derive(Default)]
pub struct ProviderRegistry {
    secrets: Mutex<HashMap<String, Slot<PollingSecretProvider>>>,
    flags: Mutex<HashMap<String, Slot<PushFlagProvider>>>,
    handler: Option<Arc<dyn ConfigChangeHandler>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("secrets", &self.secrets.lock().keys().collect::<Vec<_>>())
            .field("flags", &self.flags.lock().keys().collect::<Vec<_>>())
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl ProviderRegistry {
    /// Registry whose providers notify `handler` on reload.
    pub fn with_handler(handler: Arc<dyn ConfigChangeHandler>) -> Self {
        Self { handler: Some(handler), ..Default::default() }
    }

    /// The registry shared by the whole process.
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Returns the provider for `options.secret_id`, creating and loading it
    /// on first use.
    pub async fn secrets(
        &self,
        fetcher: Arc<dyn SecretFetcher>,
        options: SecretsOptions,
    ) -> Result<Arc<PollingSecretProvider>, ProviderError> {
        let key = format!("secrets:{}", options.secret_id);
        let slot = Self::slot(&self.secrets, &key);
        let provider = slot
            .get_or_try_init(async {
                let provider = PollingSecretProvider::new(fetcher, options, self.handler.clone())?;
                provider.load().await?;
                info!(target: "skyconf::source", source = %key, "registered secret provider");
                Ok::<_, ProviderError>(Arc::new(provider))
            })
            .await?;
        Ok(provider.clone())
    }

    /// Returns the provider for `options.prefix`, creating and loading it on
    /// first use.
    pub async fn flags(
        &self,
        client: Arc<dyn FlagStreamClient>,
        options: FlagsOptions,
    ) -> Result<Arc<PushFlagProvider>, ProviderError> {
        let key = format!("flags:{}", options.prefix);
        let slot = Self::slot(&self.flags, &key);
        let provider = slot
            .get_or_try_init(async {
                let provider = PushFlagProvider::new(client, options, self.handler.clone());
                provider.load().await?;
                info!(target: "skyconf::source", source = %key, "registered flag provider");
                Ok::<_, ProviderError>(Arc::new(provider))
            })
            .await?;
        Ok(provider.clone())
    }

    /// Number of providers successfully registered.
    pub fn len(&self) -> usize {
        Self::loaded(&self.secrets) + Self::loaded(&self.flags)
    }

    /// Whether no provider has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn loaded<P>(slots: &Mutex<HashMap<String, Slot<P>>>) -> usize {
        slots.lock().values().filter(|slot| slot.get().is_some()).count()
    }

    fn slot<P>(slots: &Mutex<HashMap<String, Slot<P>>>, key: &str) -> Slot<P> {
        slots.lock().entry(key.to_string()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
    }
}
