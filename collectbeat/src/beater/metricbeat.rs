use collectbeat_discoverer::builders::{metrics_annotations, metrics_secret};
use collectbeat_discoverer::factory::init_factory;
use collectbeat_discoverer::init_discoverers;
use collectbeat_discoverer::registry::Register;
use collectbeat_shared::config::{self, Document};
use log::{info, warn};
use std::collections::HashMap;

use super::engine::EngineConfig;
use crate::cmd::RunArgs;

const DEFAULT_MODULES_PATH: &str = "./modules.d/*.yml";

/// The metricbeat subcommand's configuration surface.
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
    pub modules: Option<Document>,
}

/// Run metrics-scraping discovery: derive module configs from pod
/// annotations and secrets, and materialise them where the metrics scraper's
/// reloader looks.
pub async fn run(args: &RunArgs) -> anyhow::Result<()> {
    let cfg: Config = super::load_config(&args.config)?;

    let registry = Register::with_defaults()?;
    registry.add_default_builder_config(
        metrics_annotations::METRICS_ANNOTATIONS_BUILDER,
        config::empty(),
    )?;
    registry.add_default_builder_config(
        metrics_secret::METRICS_SECRET_BUILDER,
        config::empty(),
    )?;

    let discoverers = init_discoverers(&cfg.discovery, &registry).await?;
    if discoverers.is_empty() {
        warn!("run - no discovery plugins configured");
    }

    let factory_config =
        super::cfgfile_factory_config(cfg.config.modules.as_ref(), DEFAULT_MODULES_PATH);
    let factory = init_factory(&factory_config, None).await?;

    info!("run - collectbeat metricbeat started");
    super::run_until_shutdown(discoverers, factory, cfg.engine).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parses_modules_section() {
        let cfg: Config = serde_yaml::from_str(
            "{discovery: {kubernetes: {host: node-a}}, \
             config: {modules: {path: \"/etc/modules.d/*.yml\"}}}",
        )
        .unwrap();

        assert!(cfg.discovery.contains_key("kubernetes"));
        let modules = cfg.config.modules.unwrap();
        assert_eq!(
            config::get_str(&modules, "path"),
            Some("/etc/modules.d/*.yml")
        );
    }
}
