//! Dynamic configuration providers backed by remote services.
//!
//! Two providers share one refresh engine ([`refresh::RefreshableProvider`]):
//! [`PollingSecretProvider`] polls a secret store on a timer and
//! [`PushFlagProvider`] mirrors feature flags pushed by a streaming client.
//! Both publish a flat, case-insensitive `section:key` map that is swapped
//! atomically on every successful refresh.

pub mod flags;
pub mod handler;
pub mod keys;
pub mod provider;
pub mod refresh;
pub mod secrets;
pub mod types;

/// Reads `$key` from a provider and parses it, falling back to `$default`
/// when the key is missing, null or fails to parse.
///
/// `$provider` is anything that dereferences to a provider: a reference,
/// an `Arc`, or a `Box`.
#[macro_export]
macro_rules! cached_config {
    ($provider:expr, $key:expr, $default:expr) => {{
        $crate::provider::ConfigurationProvider::try_get(&*$provider, $key)
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or($default)
    }};
}

pub use flags::{
    FlagChange, FlagChangeCallback, FlagClientOptions, FlagHandle, FlagProviderState,
    FlagStreamClient, FlagsOptions, FlagsState, PushFlagProvider,
};
pub use handler::ConfigChangeHandler;
pub use provider::ConfigurationProvider;
pub use refresh::{RefreshSource, RefreshableProvider};
pub use secrets::{PollingSecretProvider, SecretFetcher, SecretsOptions};
pub use types::{ConfigMap, ProviderError, RefreshOutcome, RefreshStatus, SkipReason};
