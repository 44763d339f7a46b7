//! The read surface a configuration tree sees.

use crate::types::ProviderError;
use async_trait::async_trait;
use std::fmt::Debug;

/// A configuration source the framework can load and query.
#[async_trait]
pub trait ConfigurationProvider: Debug + Send + Sync {
    /// Identity of the source, e.g. `secrets:<id>`.
    fn name(&self) -> &str;

    /// Triggers a refresh attempt.
    ///
    /// Transient failures are absorbed and the previous values keep being
    /// served. An error means startup cannot continue.
    async fn load(&self) -> Result<(), ProviderError>;

    /// Case-insensitive lookup of a `:`-delimited key.
    ///
    /// `None` if the key is unknown, `Some(None)` if it is set to null.
    fn try_get(&self, key: &str) -> Option<Option<String>>;
}
