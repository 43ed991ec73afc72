use async_trait::async_trait;
use collectbeat_shared::config::{self, ConfigHolder, Document};
use mockall::automock;
use std::sync::Arc;

use crate::error::Error;

pub mod cfgfile;
pub mod runner;

pub use cfgfile::CfgfileFactory;
pub use runner::InProcessFactory;

/// Reconciles desired collector configs against whatever is currently
/// deployed, keyed by config fingerprint. Both strategies (in-process
/// runners, config-file materialisation) provide the same semantics:
/// `start` is a no-op for an already-deployed fingerprint, `stop` for an
/// unknown one, and `restart` with identical fingerprints touches nothing.
#[async_trait]
pub trait Factory: Send + Sync {
    async fn start(&self, holders: &[ConfigHolder]) -> Result<(), Error>;

    async fn stop(&self, holders: &[ConfigHolder]) -> Result<(), Error>;

    async fn restart(&self, old: &ConfigHolder, new: &ConfigHolder) -> Result<(), Error>;

    /// Tear down every live entry. The shutdown path.
    async fn stop_all(&self);
}

/// A live collector instance owned by the in-process strategy.
#[automock]
pub trait Runner: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

/// Creates collector instances from structured configs. Injected by whoever
/// embeds a collector engine in-process.
#[automock]
pub trait RunnerFactory: Send + Sync {
    fn create(&self, config: &Document) -> Result<Box<dyn Runner>, anyhow::Error>;
}

#[derive(Debug, Deserialize)]
struct FactoryChoice {
    name: String,
}

/// Resolve the configured factory strategy. The `runner` strategy needs an
/// injected runner factory; `cfgfile` configures itself from the same
/// document.
pub async fn init_factory(
    factory_config: &Document,
    runner_factory: Option<Arc<dyn RunnerFactory>>,
) -> Result<Arc<dyn Factory>, Error> {
    let choice: FactoryChoice = config::unpack(factory_config)
        .map_err(|e| Error::Configuration(format!("`factory` config needs a name: {}", e)))?;

    match choice.name.as_str() {
        runner::RUNNER_FACTORY => {
            let runner_factory = runner_factory.ok_or_else(|| {
                Error::Configuration(
                    "`runner` factory requires an injected runner factory".to_string(),
                )
            })?;
            Ok(Arc::new(InProcessFactory::new(runner_factory)))
        }
        cfgfile::CFGFILE_FACTORY => Ok(Arc::new(CfgfileFactory::new(factory_config).await?)),
        other => Err(Error::Registration(format!(
            "factory {} does not exist",
            other
        ))),
    }
}
