use collectbeat_shared::config::{self, Document, Enabled};
use collectbeat_shared::k8s::{pod, KubeImpl, KubeInterface};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::builder::{Builder, ClientInfo, MetadataProvider};
use crate::error::Error;
use crate::factory::Factory;
use crate::pipeline::Pipeline;
use crate::registry::Register;

pub mod pod_watcher;

pub use pod_watcher::PodWatcher;

pub const KUBERNETES_DISCOVERER: &str = "kubernetes";

const DEFAULT_NAMESPACE: &str = "kube-system";
const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(1);

type PluginConfig = Vec<HashMap<String, Document>>;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct KubeDiscovererConfig {
    pub in_cluster: bool,
    pub kube_config: Option<String>,
    pub host: Option<String>,
    pub namespace: String,
    pub sync_period: Option<String>,
    pub builders: PluginConfig,
    pub default_builders: Enabled,
    pub appenders: PluginConfig,
    pub default_appenders: Enabled,
}

impl Default for KubeDiscovererConfig {
    fn default() -> Self {
        KubeDiscovererConfig {
            in_cluster: true,
            kube_config: None,
            host: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            sync_period: None,
            builders: Vec::new(),
            default_builders: Enabled::new(true),
            appenders: Vec::new(),
            default_appenders: Enabled::new(true),
        }
    }
}

impl KubeDiscovererConfig {
    fn validate(&self) -> Result<(), Error> {
        if !self.in_cluster && self.kube_config.as_deref().unwrap_or_default().is_empty() {
            return Err(Error::Configuration(
                "`kube_config` path can't be empty when `in_cluster` is set to false".to_string(),
            ));
        }
        Ok(())
    }

    fn sync_period(&self) -> Result<Duration, Error> {
        match &self.sync_period {
            Some(raw) => humantime::parse_duration(raw).map_err(|e| {
                Error::Configuration(format!("invalid `sync_period` {:?}: {}", raw, e))
            }),
            None => Ok(DEFAULT_SYNC_PERIOD),
        }
    }
}

/// The top-level wire-up for one node: cluster client, registry-selected
/// builders and appenders, pipeline and pod watcher assembled into a single
/// lifecycle.
pub struct KubernetesDiscoverer {
    pipeline: Arc<Pipeline>,
    watcher: Arc<PodWatcher>,
}

impl KubernetesDiscoverer {
    pub async fn new(discoverer_config: &Document, registry: &Register) -> Result<Self, Error> {
        let cfg: KubeDiscovererConfig = config::unpack(discoverer_config).map_err(|e| {
            Error::Configuration(format!(
                "fail to unpack the kubernetes configuration: {}",
                e
            ))
        })?;
        cfg.validate()?;

        let kube: Arc<dyn KubeInterface> = if cfg.in_cluster {
            Arc::new(KubeImpl::new().await.map_err(|e| {
                Error::Configuration(format!("unable to get in cluster configuration: {}", e))
            })?)
        } else {
            let path = cfg.kube_config.clone().unwrap_or_default();
            Arc::new(KubeImpl::from_kubeconfig(&path).await.map_err(|e| {
                Error::Configuration(format!("unable to load kubeconfig: {}", e))
            })?)
        };

        Self::with_client(cfg, kube, registry).await
    }

    /// Assemble the discoverer around an injected cluster client.
    pub async fn with_client(
        cfg: KubeDiscovererConfig,
        kube: Arc<dyn KubeInterface>,
        registry: &Register,
    ) -> Result<Self, Error> {
        cfg.validate()?;
        let sync_period = cfg.sync_period()?;

        let host = match cfg.host.clone().filter(|host| !host.is_empty()) {
            Some(host) => host,
            None => detect_host(kube.as_ref(), &cfg.namespace).await,
        };
        debug!("with_client - using host {}", host);

        let mut builder_configs = cfg.builders.clone();
        if cfg.default_builders.enabled {
            for (name, default_config) in registry.default_builder_configs() {
                builder_configs.push(HashMap::from([(name, default_config)]));
            }
        }
        let mut appender_configs = cfg.appenders.clone();
        if cfg.default_appenders.enabled {
            for (name, default_config) in registry.default_appender_configs() {
                appender_configs.push(HashMap::from([(name, default_config)]));
            }
        }

        let watcher = Arc::new(PodWatcher::new(kube.clone(), host, sync_period));
        let provider: Arc<dyn MetadataProvider> = watcher.clone();
        let client_info = ClientInfo { kube };

        let mut builders: Vec<Builder> = Vec::new();
        for plugin in builder_configs {
            for (name, plugin_config) in plugin {
                let Some(constructor) = registry.get_builder(&name) else {
                    warn!("with_client - unable to find builder plugin {}", name);
                    continue;
                };
                match constructor(&plugin_config, &client_info, provider.clone()) {
                    Ok(builder) => builders.push(builder),
                    Err(e) => warn!(
                        "with_client - unable to initialize builder plugin {} due to error {}",
                        name, e
                    ),
                }
            }
        }

        let mut appenders = Vec::new();
        for plugin in appender_configs {
            for (name, plugin_config) in plugin {
                let Some(constructor) = registry.get_appender(&name) else {
                    warn!("with_client - unable to find appender plugin {}", name);
                    continue;
                };
                match constructor(&plugin_config) {
                    Ok(appender) => appenders.push(appender),
                    Err(e) => warn!(
                        "with_client - unable to initialize appender plugin {} due to error {}",
                        name, e
                    ),
                }
            }
        }

        if builders.is_empty() {
            return Err(Error::Configuration(
                "can not initialize kubernetes discoverer with zero builder plugins".to_string(),
            ));
        }

        let pipeline = Arc::new(Pipeline::new(builders, appenders));
        watcher.set_pipeline(pipeline.clone());

        Ok(KubernetesDiscoverer { pipeline, watcher })
    }

    /// Attach the factory and boot the watcher. Returns once the initial sync
    /// finished; watching continues in the background.
    pub async fn start(&self, factory: Arc<dyn Factory>) -> Result<(), Error> {
        self.pipeline.set_factory(factory);
        self.watcher.run().await
    }

    pub fn stop(&self) {
        self.watcher.stop();
    }
}

/// The node this process runs on: configured, or derived from the pod whose
/// name matches `HOSTNAME`, with `localhost` as the fallback.
async fn detect_host(kube: &dyn KubeInterface, namespace: &str) -> String {
    let pod_name = std::env::var("HOSTNAME").unwrap_or_default();
    if pod_name.is_empty() || pod_name == "localhost" {
        return "localhost".to_string();
    }

    info!(
        "detect_host - using pod name {} and namespace {}",
        pod_name, namespace
    );
    match kube.find_pod(&pod_name, namespace).await {
        Ok(this_pod) => pod::pod_node_name(&this_pod)
            .unwrap_or("localhost")
            .to_string(),
        Err(e) => {
            error!("detect_host - querying for pod failed with error: {}", e);
            info!("detect_host - unable to find pod, setting host to localhost");
            "localhost".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collectbeat_shared::k8s::MockKubeInterface;

    fn doc(yaml: &str) -> Document {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let cfg: KubeDiscovererConfig = config::unpack(&doc("{}")).unwrap();
        assert!(cfg.in_cluster);
        assert_eq!(cfg.namespace, "kube-system");
        assert!(cfg.default_builders.enabled);
        assert!(cfg.default_appenders.enabled);
        assert_eq!(cfg.sync_period().unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_kube_config_required_outside_cluster() {
        let cfg: KubeDiscovererConfig = config::unpack(&doc("{in_cluster: false}")).unwrap();
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));

        let cfg: KubeDiscovererConfig =
            config::unpack(&doc("{in_cluster: false, kube_config: /tmp/kubeconfig}")).unwrap();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_invalid_sync_period_is_rejected() {
        let cfg: KubeDiscovererConfig =
            config::unpack(&doc("{sync_period: sometimes}")).unwrap();
        assert!(matches!(cfg.sync_period(), Err(Error::Configuration(_))));

        let cfg: KubeDiscovererConfig = config::unpack(&doc("{sync_period: 5s}")).unwrap();
        assert_eq!(cfg.sync_period().unwrap(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_zero_builders_is_a_startup_failure() {
        let registry = Register::new();
        let cfg: KubeDiscovererConfig = config::unpack(&doc("{host: node-a}")).unwrap();
        let kube: Arc<dyn KubeInterface> = Arc::new(MockKubeInterface::new());

        let result = KubernetesDiscoverer::with_client(cfg, kube, &registry).await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_unknown_plugins_are_skipped_not_fatal() {
        let registry = Register::with_defaults().unwrap();
        let cfg: KubeDiscovererConfig = config::unpack(&doc(
            "{host: node-a, builders: [{log_annotations: {}}, {bogus: {}}], appenders: [{bogus: {}}], \
             default_builders: {enabled: false}, default_appenders: {enabled: false}}",
        ))
        .unwrap();
        let kube: Arc<dyn KubeInterface> = Arc::new(MockKubeInterface::new());

        let discoverer = KubernetesDiscoverer::with_client(cfg, kube, &registry).await;
        assert!(discoverer.is_ok());
    }

    #[tokio::test]
    async fn test_default_builder_configs_are_applied() {
        let registry = Register::with_defaults().unwrap();
        registry
            .add_default_builder_config("log_annotations", config::empty())
            .unwrap();
        let cfg: KubeDiscovererConfig = config::unpack(&doc(
            "{host: node-a, default_appenders: {enabled: false}}",
        ))
        .unwrap();
        let kube: Arc<dyn KubeInterface> = Arc::new(MockKubeInterface::new());

        // The default log_annotations config alone satisfies the
        // one-builder minimum.
        let discoverer = KubernetesDiscoverer::with_client(cfg, kube, &registry).await;
        assert!(discoverer.is_ok());
    }
}
