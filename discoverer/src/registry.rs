use collectbeat_shared::config::{self, Document};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::appender::AppenderConstructor;
use crate::appenders::{auth, log_path};
use crate::builder::BuilderConstructor;
use crate::builders::{
    graphite_annotations, log_annotations, metrics_annotations, metrics_secret,
};
use crate::error::Error;

#[derive(Default)]
struct Inner {
    builders: HashMap<String, BuilderConstructor>,
    appenders: HashMap<String, AppenderConstructor>,
    default_builder_configs: HashMap<String, Document>,
    default_appender_configs: HashMap<String, Document>,
}

/// The process-wide catalog of builder and appender plugins and their default
/// configs. Constructed once in `main`, handed to the discoverer by
/// reference, and never mutated after the start barrier.
#[derive(Default)]
pub struct Register {
    inner: RwLock<Inner>,
}

impl Register {
    pub fn new() -> Self {
        Register::default()
    }

    /// A register with every built-in builder and appender plugin, plus the
    /// default configs that apply regardless of subcommand.
    pub fn with_defaults() -> Result<Self, Error> {
        let register = Register::new();
        register.add_builder(
            log_annotations::LOG_ANNOTATIONS_BUILDER,
            log_annotations::new_builder,
        )?;
        register.add_builder(
            metrics_annotations::METRICS_ANNOTATIONS_BUILDER,
            metrics_annotations::new_builder,
        )?;
        register.add_builder(
            metrics_secret::METRICS_SECRET_BUILDER,
            metrics_secret::new_builder,
        )?;
        register.add_builder(
            graphite_annotations::GRAPHITE_ANNOTATIONS_BUILDER,
            graphite_annotations::new_builder,
        )?;
        register.add_appender(auth::AUTH_APPENDER, auth::new_appender)?;
        register.add_appender(log_path::LOG_PATH_APPENDER, log_path::new_appender)?;
        register.add_default_appender_config(auth::AUTH_APPENDER, config::empty())?;
        Ok(register)
    }

    pub fn add_builder(&self, name: &str, constructor: BuilderConstructor) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        if inner.builders.contains_key(name) {
            return Err(Error::Registration(format!(
                "builder type {} already registered",
                name
            )));
        }
        inner.builders.insert(name.to_string(), constructor);
        Ok(())
    }

    pub fn get_builder(&self, name: &str) -> Option<BuilderConstructor> {
        self.inner.read().unwrap().builders.get(name).copied()
    }

    pub fn add_appender(&self, name: &str, constructor: AppenderConstructor) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        if inner.appenders.contains_key(name) {
            return Err(Error::Registration(format!(
                "appender type {} already registered",
                name
            )));
        }
        inner.appenders.insert(name.to_string(), constructor);
        Ok(())
    }

    pub fn get_appender(&self, name: &str) -> Option<AppenderConstructor> {
        self.inner.read().unwrap().appenders.get(name).copied()
    }

    pub fn add_default_builder_config(&self, name: &str, config: Document) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        if inner.default_builder_configs.contains_key(name) {
            return Err(Error::Registration(format!(
                "default config for builder {} already registered",
                name
            )));
        }
        inner.default_builder_configs.insert(name.to_string(), config);
        Ok(())
    }

    pub fn add_default_appender_config(&self, name: &str, config: Document) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        if inner.default_appender_configs.contains_key(name) {
            return Err(Error::Registration(format!(
                "default config for appender {} already registered",
                name
            )));
        }
        inner
            .default_appender_configs
            .insert(name.to_string(), config);
        Ok(())
    }

    pub fn default_builder_configs(&self) -> HashMap<String, Document> {
        self.inner.read().unwrap().default_builder_configs.clone()
    }

    pub fn default_appender_configs(&self) -> HashMap<String, Document> {
        self.inner.read().unwrap().default_appender_configs.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appender::Appender;
    use crate::builder::{Builder, ClientInfo, MetadataProvider, PollerBuilder};
    use async_trait::async_trait;
    use collectbeat_shared::config::ConfigHolder;
    use k8s_openapi::api::core::v1::Pod;
    use std::sync::Arc;

    struct FakeBuilder;

    #[async_trait]
    impl PollerBuilder for FakeBuilder {
        fn name(&self) -> &'static str {
            "fake_builder"
        }

        async fn build_module_configs(&self, _pod: &Pod) -> Vec<ConfigHolder> {
            Vec::new()
        }
    }

    fn new_fake_builder(
        _config: &Document,
        _client: &ClientInfo,
        _meta: Arc<dyn MetadataProvider>,
    ) -> Result<Builder, Error> {
        Ok(Builder::Poller(Box::new(FakeBuilder)))
    }

    struct FakeAppender;

    #[async_trait]
    impl Appender for FakeAppender {
        async fn append(&self, _holder: &mut ConfigHolder) {}
    }

    fn new_fake_appender(_config: &Document) -> Result<Box<dyn Appender>, Error> {
        Ok(Box::new(FakeAppender))
    }

    #[test]
    fn test_register_and_get() {
        let register = Register::new();
        register.add_builder("foo", new_fake_builder).unwrap();
        register.add_appender("bar", new_fake_appender).unwrap();

        assert!(register.get_builder("foo").is_some());
        assert!(register.get_builder("bar").is_none());
        assert!(register.get_appender("bar").is_some());
        assert!(register.get_appender("foo").is_none());
    }

    #[test]
    fn test_double_registration_fails() {
        let register = Register::new();
        register.add_builder("foo", new_fake_builder).unwrap();
        assert!(matches!(
            register.add_builder("foo", new_fake_builder),
            Err(Error::Registration(_))
        ));

        register.add_appender("bar", new_fake_appender).unwrap();
        assert!(matches!(
            register.add_appender("bar", new_fake_appender),
            Err(Error::Registration(_))
        ));
    }

    #[test]
    fn test_default_configs() {
        let register = Register::new();
        register
            .add_default_builder_config("foo", config::empty())
            .unwrap();
        register
            .add_default_appender_config("bar", config::empty())
            .unwrap();

        assert!(register.default_builder_configs().contains_key("foo"));
        assert!(register.default_appender_configs().contains_key("bar"));
        assert!(register
            .add_default_builder_config("foo", config::empty())
            .is_err());
    }

    #[test]
    fn test_with_defaults_registers_builtin_plugins() {
        let register = Register::with_defaults().unwrap();
        assert!(register.get_builder("log_annotations").is_some());
        assert!(register.get_builder("metrics_annotations").is_some());
        assert!(register.get_builder("metrics_secret").is_some());
        assert!(register.get_builder("graphite_annotations").is_some());
        assert!(register.get_appender("auth").is_some());
        assert!(register.get_appender("log_path").is_some());
        assert!(register.default_appender_configs().contains_key("auth"));
    }
}
