//! Errors raised while registering providers.

use skyconf_provider::ProviderError;

/// Registration error enum
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Options were supplied explicitly but a required field is absent
    #[error("missing required setting `{0}`")]
    MissingField(&'static str),
    /// Settings could not be read or parsed
    #[error("invalid settings: {0}")]
    Settings(String),
    /// The provider failed to construct or to perform its initial load
    #[error(transparent)]
    Provider(#[from] ProviderError),
}
