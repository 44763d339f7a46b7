//! Registration of providers into a configuration tree.

use crate::{
    error::SourceError,
    registry::ProviderRegistry,
    settings::{SecretsSettings, Settings},
};
use skyconf_provider::{
    ConfigurationProvider, FlagStreamClient, FlagsOptions, PollingSecretProvider,
    PushFlagProvider, SecretFetcher, SecretsOptions,
};
use std::sync::Arc;
use tracing::info;

/// A configuration tree that providers can be appended to.
///
/// Later providers take precedence over earlier ones.
pub trait ConfigurationBuilder {
    /// Appends `provider` as the highest precedence source.
    fn add_provider(&mut self, provider: Arc<dyn ConfigurationProvider>);
}

impl ConfigurationBuilder for Vec<Arc<dyn ConfigurationProvider>> {
    fn add_provider(&mut self, provider: Arc<dyn ConfigurationProvider>) {
        self.push(provider);
    }
}

/// Registers secret overrides.
///
/// With `options` the secret is always registered. Without, the secret id
/// is read from [`crate::settings::SECRET_ID_ENV`]; when that is unset the
/// builder is left untouched and `Ok(None)` is returned.
///
/// Fails when the initial load cannot produce any configuration.
pub async fn add_secrets<B: ConfigurationBuilder + ?Sized>(
    builder: &mut B,
    registry: &ProviderRegistry,
    fetcher: Arc<dyn SecretFetcher>,
    options: Option<SecretsOptions>,
) -> Result<Option<Arc<PollingSecretProvider>>, SourceError> {
    let options = match options {
        Some(options) if options.secret_id.trim().is_empty() => {
            return Err(SourceError::MissingField("secret_id"));
        }
        Some(options) => options,
        None => match SecretsSettings::from_env() {
            Some(settings) => settings.to_options()?,
            None => {
                info!(target: "skyconf::source", "no secret id provided, secret overrides disabled");
                return Ok(None);
            }
        },
    };

    let provider = registry.secrets(fetcher, options).await?;
    builder.add_provider(provider.clone());
    Ok(Some(provider))
}

/// Registers feature flags under `prefix`.
pub async fn add_flags<B: ConfigurationBuilder + ?Sized>(
    builder: &mut B,
    registry: &ProviderRegistry,
    client: Arc<dyn FlagStreamClient>,
    sdk_key: &str,
    prefix: &str,
) -> Result<Arc<PushFlagProvider>, SourceError> {
    if sdk_key.trim().is_empty() {
        return Err(SourceError::MissingField("sdk_key"));
    }
    if prefix.is_empty() {
        return Err(SourceError::MissingField("prefix"));
    }
    let options = FlagsOptions::new(sdk_key)?.with_prefix(prefix);
    add_flags_with_options(builder, registry, client, options).await
}

/// Registers feature flags with fully specified options.
pub async fn add_flags_with_options<B: ConfigurationBuilder + ?Sized>(
    builder: &mut B,
    registry: &ProviderRegistry,
    client: Arc<dyn FlagStreamClient>,
    options: FlagsOptions,
) -> Result<Arc<PushFlagProvider>, SourceError> {
    let provider = registry.flags(client, options).await?;
    builder.add_provider(provider.clone());
    Ok(provider)
}

/// Registers every provider enabled in `settings`.
///
/// Secrets are added before flags, so flag values win on conflicting keys.
/// A section that is present but lacks its collaborator is an error.
pub async fn add_from_settings<B: ConfigurationBuilder + ?Sized>(
    builder: &mut B,
    registry: &ProviderRegistry,
    settings: &Settings,
    fetcher: Option<Arc<dyn SecretFetcher>>,
    client: Option<Arc<dyn FlagStreamClient>>,
) -> Result<(), SourceError> {
    if let Some(secrets) = &settings.secrets {
        let options = secrets.to_options()?;
        let fetcher = fetcher.ok_or(SourceError::MissingField("secret fetcher"))?;
        add_secrets(builder, registry, fetcher, Some(options)).await?;
    }
    if let Some(flags) = &settings.flags {
        let options = flags.to_options()?;
        let client = client.ok_or(SourceError::MissingField("flag client"))?;
        add_flags_with_options(builder, registry, client, options).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SECRET_ID_ENV;
    use async_trait::async_trait;
    use skyconf_provider::ProviderError;

    struct NoFetch;

    #[async_trait]
    impl SecretFetcher for NoFetch {
        async fn fetch_secret(&self, _: &str) -> Result<Option<String>, ProviderError> {
            panic!("fetch must not run");
        }
    }

    struct NoConnect;

    #[async_trait]
    impl FlagStreamClient for NoConnect {
        async fn connect(
            &self,
            _: &str,
            _: &skyconf_provider::FlagClientOptions,
        ) -> Result<Arc<dyn skyconf_provider::FlagHandle>, ProviderError> {
            panic!("connect must not run");
        }
    }

    #[tokio::test]
    async fn test_blank_explicit_id_rejected() {
        let mut builder: Vec<Arc<dyn ConfigurationProvider>> = Vec::new();
        let registry = ProviderRegistry::default();
        let mut options = SecretsOptions::new("arn").unwrap();
        options.secret_id = "  ".to_string();

        let err = add_secrets(&mut builder, &registry, Arc::new(NoFetch), Some(options)).await.unwrap_err();

        assert!(matches!(err, SourceError::MissingField("secret_id")));
        assert!(builder.is_empty());
    }

    #[tokio::test]
    async fn test_no_options_and_no_env_disables_secrets() {
        let mut builder: Vec<Arc<dyn ConfigurationProvider>> = Vec::new();
        let registry = ProviderRegistry::default();

        let added = temp_env::async_with_vars([(SECRET_ID_ENV, None::<&str>)], async {
            add_secrets(&mut builder, &registry, Arc::new(NoFetch), None).await
        })
        .await
        .unwrap();

        assert!(added.is_none());
        assert!(builder.is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_flags_require_key_and_prefix() {
        let mut builder: Vec<Arc<dyn ConfigurationProvider>> = Vec::new();
        let registry = ProviderRegistry::default();

        let err = add_flags(&mut builder, &registry, Arc::new(NoConnect), "", "p-").await.unwrap_err();
        assert!(matches!(err, SourceError::MissingField("sdk_key")));

        let err = add_flags(&mut builder, &registry, Arc::new(NoConnect), "sdk", "").await.unwrap_err();
        assert!(matches!(err, SourceError::MissingField("prefix")));

        assert!(builder.is_empty());
    }

    #[tokio::test]
    async fn test_settings_without_collaborator() {
        let mut builder: Vec<Arc<dyn ConfigurationProvider>> = Vec::new();
        let registry = ProviderRegistry::default();
        let settings = Settings::from_yaml_str("flags:\n  sdk_key: sdk\n").unwrap();

        let err = add_from_settings(&mut builder, &registry, &settings, None, None).await.unwrap_err();

        assert!(matches!(err, SourceError::MissingField("flag client")));
    }
}
