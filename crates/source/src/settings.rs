//! Typed provider settings, loadable from YAML or the process environment.
//!
//! ```yaml
//! secrets:
//!   secret_id: arn:aws:secretsmanager:us-east-1:000000000000:secret:app
//!   min_refresh_interval: 60s
//! flags:
//!   sdk_key: sdk-0000
//!   prefix: configure-backend-
//! ```

use crate::error::SourceError;
use serde::{Deserialize, Serialize};
use skyconf_provider::{
    FlagClientOptions, FlagsOptions, SecretsOptions, flags::DEFAULT_FLAG_PREFIX,
    refresh::{DEFAULT_FETCH_TIMEOUT, DEFAULT_MIN_REFRESH_INTERVAL},
};
use std::{path::Path, time::Duration};
use url::Url;

/// Environment variable naming the secret to load overrides from.
pub const SECRET_ID_ENV: &str = "APPSETTINGS_OVERRIDE_SECRET_ARN";

/// Settings for every provider; an absent section disables that provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Secret override settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<SecretsSettings>,
    /// Feature flag settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<FlagsSettings>,
}

impl Settings {
    /// Parses settings from YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, SourceError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| SourceError::Settings(format!("Failed to parse YAML: {e}")))
    }

    /// Reads and parses a YAML settings file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| SourceError::Settings(format!("Failed to read {}: {e}", path.display())))?;
        Self::from_yaml_str(&yaml)
    }
}

/// Settings for the secret override provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecretsSettings {
    /// Secret name or ARN
    pub secret_id: Option<String>,
    /// Timer period and minimum spacing between refreshes
    #[serde(with = "humantime_serde")]
    pub min_refresh_interval: Duration,
    /// Deadline for a single fetch
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
}

impl Default for SecretsSettings {
    fn default() -> Self {
        Self {
            secret_id: None,
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

impl SecretsSettings {
    /// Settings from [`SECRET_ID_ENV`], or `None` when it is unset or empty.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`Self::from_env`] with a custom variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        lookup(SECRET_ID_ENV)
            .filter(|id| !id.trim().is_empty())
            .map(|id| Self { secret_id: Some(id), ..Default::default() })
    }

    /// Validates the settings into provider options.
    pub fn to_options(&self) -> Result<SecretsOptions, SourceError> {
        let secret_id = self
            .secret_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or(SourceError::MissingField("secrets.secret_id"))?;
        Ok(SecretsOptions::new(secret_id)?
            .with_min_refresh_interval(self.min_refresh_interval)
            .with_fetch_timeout(self.fetch_timeout))
    }
}

/// Settings for the feature flag provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlagsSettings {
    /// SDK key for the flag service
    pub sdk_key: Option<String>,
    /// Only flags starting with this prefix become configuration
    pub prefix: String,
    /// Minimum spacing between refreshes; zero applies every change
    #[serde(with = "humantime_serde")]
    pub min_refresh_interval: Duration,
    /// Deadline for connecting plus one snapshot
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// Override for the streaming endpoint
    pub stream_uri: Option<Url>,
    /// How long connecting waits for the initial payload
    #[serde(with = "humantime_serde")]
    pub start_wait: Duration,
}

impl Default for FlagsSettings {
    fn default() -> Self {
        let client = FlagClientOptions::default();
        Self {
            sdk_key: None,
            prefix: DEFAULT_FLAG_PREFIX.to_string(),
            min_refresh_interval: Duration::ZERO,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            stream_uri: client.stream_uri,
            start_wait: client.start_wait,
        }
    }
}

impl FlagsSettings {
    /// Validates the settings into provider options.
    pub fn to_options(&self) -> Result<FlagsOptions, SourceError> {
        let sdk_key = self
            .sdk_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(SourceError::MissingField("flags.sdk_key"))?;
        if self.prefix.is_empty() {
            return Err(SourceError::MissingField("flags.prefix"));
        }
        Ok(FlagsOptions::new(sdk_key)?
            .with_prefix(self.prefix.clone())
            .with_min_refresh_interval(self.min_refresh_interval)
            .with_fetch_timeout(self.fetch_timeout)
            .with_client_options(FlagClientOptions {
                diagnostic_opt_out: true,
                stream_uri: self.stream_uri.clone(),
                start_wait: self.start_wait,
            }))
    }
}
