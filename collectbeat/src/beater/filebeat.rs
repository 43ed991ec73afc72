use collectbeat_discoverer::builders::log_annotations;
use collectbeat_discoverer::factory::init_factory;
use collectbeat_discoverer::init_discoverers;
use collectbeat_discoverer::registry::Register;
use collectbeat_shared::config::{self, Document};
use log::{info, warn};
use std::collections::HashMap;

use super::engine::EngineConfig;
use crate::cmd::RunArgs;

const DEFAULT_PROSPECTORS_PATH: &str = "./prospectors.d/*.yml";

/// The filebeat subcommand's configuration surface.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub discovery: HashMap<String, Document>,
    pub config: ReloadSection,
    pub engine: Option<EngineConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReloadSection {
    pub prospectors: Option<Document>,
}

/// Run log-collection discovery: derive prospector configs from pod
/// annotations and materialise them where the log shipper's reloader looks.
pub async fn run(args: &RunArgs) -> anyhow::Result<()> {
    let cfg: Config = super::load_config(&args.config)?;

    let registry = Register::with_defaults()?;
    registry.add_default_builder_config(
        log_annotations::LOG_ANNOTATIONS_BUILDER,
        config::empty(),
    )?;

    let discoverers = init_discoverers(&cfg.discovery, &registry).await?;
    if discoverers.is_empty() {
        warn!("run - no discovery plugins configured");
    }

    let factory_config = super::cfgfile_factory_config(
        cfg.config.prospectors.as_ref(),
        DEFAULT_PROSPECTORS_PATH,
    );
    let factory = init_factory(&factory_config, None).await?;

    info!("run - collectbeat filebeat started");
    super::run_until_shutdown(discoverers, factory, cfg.engine).await
}
