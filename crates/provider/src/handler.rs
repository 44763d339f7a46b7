//! Change notification interface for the surrounding configuration framework

use crate::types::ConfigMap;

/// Receives reload notifications from providers (the framework's reload token).
pub trait ConfigChangeHandler: Send + Sync {
    /// Called after a trigger fired; `values` is the snapshot now being served.
    fn on_reload(&self, source: &str, values: &ConfigMap);
}

impl<F> ConfigChangeHandler for F
where
    F: Fn(&str, &ConfigMap) + Send + Sync,
{
    fn on_reload(&self, source: &str, values: &ConfigMap) {
        self(source, values)
    }
}
