//! Model configuration.

use offsync_store::{Record, RemoveTarget, Schema};
use std::fmt;
use std::sync::Arc;

/// Host veto hook, consulted before a save reaches any store.
pub type SaveHook = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// Host veto hook, consulted before a remove reaches any store.
pub type RemoveHook = Arc<dyn Fn(&RemoveTarget) -> bool + Send + Sync>;

/// Configuration for a [`Model`](crate::Model).
///
/// Built once and handed to the model at construction; the schema is
/// pushed into both stores during init.
#[derive(Clone)]
pub struct ModelConfig {
    /// Model name, used in log output.
    pub name: String,
    /// Field schema shared by both stores.
    pub schema: Schema,
    /// Freshness window in milliseconds for serving finds from the
    /// local mirror while online. `None` disables the window, so every
    /// online find consults the remote store.
    pub timeout: Option<u64>,
    /// Whether the remote store starts reachable.
    pub start_online: bool,
    /// Whether the engine itself runs asynchronously; resolved against
    /// each store's [`AsyncMode`](offsync_store::AsyncMode).
    pub engine_async: bool,
    /// Veto hook run before every save.
    pub before_save: Option<SaveHook>,
    /// Veto hook run before every remove.
    pub before_remove: Option<RemoveHook>,
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("start_online", &self.start_online)
            .field("engine_async", &self.engine_async)
            .field("before_save", &self.before_save.as_ref().map(|_| "<fn>"))
            .field("before_remove", &self.before_remove.as_ref().map(|_| "<fn>"))
            .finish_non_exhaustive()
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "model".to_owned(),
            schema: Schema::new(),
            timeout: Some(Self::DEFAULT_TIMEOUT_MS),
            start_online: true,
            engine_async: false,
            before_save: None,
            before_remove: None,
        }
    }
}

impl ModelConfig {
    /// Default freshness window for local reads while online.
    pub const DEFAULT_TIMEOUT_MS: u64 = 12_000;

    /// Creates a config with the given name and defaults everywhere else.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the field schema.
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Sets the freshness window, or disables it with `None`.
    pub fn timeout(mut self, millis: Option<u64>) -> Self {
        self.timeout = millis;
        self
    }

    /// Starts the model with the remote store unreachable.
    pub fn offline(mut self) -> Self {
        self.start_online = false;
        self
    }

    /// Marks the engine as asynchronous.
    pub fn asynchronous(mut self) -> Self {
        self.engine_async = true;
        self
    }

    /// Installs a save veto hook.
    pub fn on_before_save(
        mut self,
        hook: impl Fn(&Record) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.before_save = Some(Arc::new(hook));
        self
    }

    /// Installs a remove veto hook.
    pub fn on_before_remove(
        mut self,
        hook: impl Fn(&RemoveTarget) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.before_remove = Some(Arc::new(hook));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let config = ModelConfig::new("players");
        assert_eq!(config.name, "players");
        assert_eq!(config.timeout, Some(ModelConfig::DEFAULT_TIMEOUT_MS));
        assert!(config.start_online);
        assert!(!config.engine_async);
    }

    #[test]
    fn builder_overrides() {
        let config = ModelConfig::new("players")
            .timeout(None)
            .offline()
            .asynchronous()
            .on_before_save(|_| false);
        assert_eq!(config.timeout, None);
        assert!(!config.start_online);
        assert!(config.engine_async);
        assert!(!(config.before_save.unwrap())(&Record::new()));
    }
}
