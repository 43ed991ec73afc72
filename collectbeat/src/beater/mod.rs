use anyhow::Context;
use collectbeat_discoverer::factory::Factory;
use collectbeat_discoverer::kubernetes::KubernetesDiscoverer;
use collectbeat_shared::config::{self, Document};
use log::{error, info};
use serde::de::DeserializeOwned;
use serde_yaml::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

pub mod engine;
pub mod filebeat;
pub mod metricbeat;

/// Read and parse a beater configuration file. An empty file yields the
/// default configuration.
pub(crate) fn load_config<T: DeserializeOwned + Default>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("error reading configuration file {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    serde_yaml::from_str(&raw)
        .with_context(|| format!("error parsing configuration file {}", path.display()))
}

/// Build the cfgfile factory config for a reloader section, falling back to
/// the subcommand's default glob when the operator configured none.
pub(crate) fn cfgfile_factory_config(reloader: Option<&Document>, default_path: &str) -> Document {
    let path = reloader
        .and_then(|section| config::get_str(section, "path"))
        .filter(|path| !path.is_empty())
        .unwrap_or(default_path);

    let mut factory_config = config::empty();
    config::set(
        &mut factory_config,
        "name",
        Value::String("cfgfile".to_string()),
    );
    config::set(&mut factory_config, "path", Value::String(path.to_string()));
    factory_config
}

/// Run discovery until a shutdown signal (or engine exit), then tear down:
/// stop every discoverer and let the factory remove every live collector.
/// Start-up and shutdown are symmetric, both subcommands included.
pub(crate) async fn run_until_shutdown(
    discoverers: Vec<KubernetesDiscoverer>,
    factory: Arc<dyn Factory>,
    engine_config: Option<engine::EngineConfig>,
) -> anyhow::Result<()> {
    for discoverer in &discoverers {
        discoverer.start(factory.clone()).await?;
    }

    let result = match engine_config {
        Some(engine_config) => engine::supervise(&engine_config, shutdown_signal()).await,
        None => {
            shutdown_signal().await;
            Ok(())
        }
    };

    info!("run_until_shutdown - shutting down");
    for discoverer in &discoverers {
        discoverer.stop();
    }
    factory.stop_all().await;
    result
}

/// Resolves when the process receives SIGINT or SIGTERM.
pub(crate) async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("shutdown_signal - unable to listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cfgfile_factory_config_default_path() {
        let factory_config = cfgfile_factory_config(None, "./prospectors.d/*.yml");
        assert_eq!(config::get_str(&factory_config, "name"), Some("cfgfile"));
        assert_eq!(
            config::get_str(&factory_config, "path"),
            Some("./prospectors.d/*.yml")
        );
    }

    #[test]
    fn test_cfgfile_factory_config_reloader_override() {
        let reloader: Document =
            serde_yaml::from_str("{path: /etc/collectbeat/conf.d/*.yml, reload: {period: 5s}}")
                .unwrap();
        let factory_config = cfgfile_factory_config(Some(&reloader), "./prospectors.d/*.yml");
        assert_eq!(
            config::get_str(&factory_config, "path"),
            Some("/etc/collectbeat/conf.d/*.yml")
        );
    }

    #[test]
    fn test_load_config_tolerates_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let cfg: filebeat::Config = load_config(file.path()).unwrap();
        assert!(cfg.discovery.is_empty());
    }

    #[test]
    fn test_load_config_missing_file_is_an_error() {
        let result: anyhow::Result<filebeat::Config> =
            load_config(Path::new("/nonexistent/collectbeat.yml"));
        assert!(result.is_err());
    }
}
