//! Wiring for skyconf providers: settings, command line arguments, and a
//! process-scoped registry that hands each source out once.
//!
//! ```no_run
//! # async fn run(fetcher: std::sync::Arc<dyn skyconf_provider::SecretFetcher>) -> Result<(), skyconf_source::SourceError> {
//! use skyconf_provider::ConfigurationProvider;
//! use skyconf_source::{ProviderRegistry, add_secrets};
//! use std::sync::Arc;
//!
//! let mut providers: Vec<Arc<dyn ConfigurationProvider>> = Vec::new();
//! add_secrets(&mut providers, ProviderRegistry::global(), fetcher, None).await?;
//! # Ok(())
//! # }
//! ```

pub mod args;
pub mod builder;
pub mod error;
pub mod registry;
pub mod settings;

pub use args::SkyconfArgs;
pub use builder::{
    ConfigurationBuilder, add_flags, add_flags_with_options, add_from_settings, add_secrets,
};
pub use error::SourceError;
pub use registry::ProviderRegistry;
pub use settings::{FlagsSettings, SECRET_ID_ENV, SecretsSettings, Settings};
