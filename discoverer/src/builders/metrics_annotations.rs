use async_trait::async_trait;
use collectbeat_shared::config::{self, ConfigHolder, Document};
use collectbeat_shared::k8s::pod;
use k8s_openapi::api::core::v1::Pod;
use log::{debug, warn};
use serde_yaml::Value;
use std::sync::Arc;

use crate::builder::{Builder, ClientInfo, MetadataProvider, PollerBuilder};
use crate::error::Error;

pub const METRICS_ANNOTATIONS_BUILDER: &str = "metrics_annotations";

const METRIC_TYPE: &str = "type";
const NAMESPACE: &str = "namespace";
const ENDPOINTS: &str = "endpoints";
const METRICSETS: &str = "metricsets";
const INTERVAL: &str = "interval";
const TIMEOUT: &str = "timeout";
const SCHEME: &str = "scheme";
const INSECURE_SKIP_VERIFY: &str = "insecure_skip_verify";

const DEFAULT_PREFIX: &str = "io.collectbeat.metrics/";
const DEFAULT_INTERVAL: &str = "1m";
const DEFAULT_TIMEOUT: &str = "3s";

/// Modules whose metricsets are namespaced: they refuse to run without one.
const NAMESPACE_REQUIRED_MODULES: [&str; 4] = ["prometheus", "jolokia", "dropwizard", "http"];

/// Emits metricbeat module configs derived from a pod's metrics annotations.
pub struct PodAnnotationBuilder {
    prefix: String,
    meta: Arc<dyn MetadataProvider>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MetricsAnnotationsConfig {
    prefix: String,
}

impl Default for MetricsAnnotationsConfig {
    fn default() -> Self {
        MetricsAnnotationsConfig {
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

pub fn new_builder(
    builder_config: &Document,
    _client: &ClientInfo,
    meta: Arc<dyn MetadataProvider>,
) -> Result<Builder, Error> {
    let mut cfg: MetricsAnnotationsConfig = config::unpack(builder_config).map_err(|e| {
        Error::Configuration(format!(
            "fail to unpack the `metrics_annotations` builder configuration: {}",
            e
        ))
    })?;
    if !cfg.prefix.ends_with('/') {
        cfg.prefix.push('/');
    }

    Ok(Builder::Poller(Box::new(PodAnnotationBuilder {
        prefix: cfg.prefix,
        meta,
    })))
}

#[async_trait]
impl PollerBuilder for PodAnnotationBuilder {
    fn name(&self) -> &'static str {
        "Annotation Builder"
    }

    async fn build_module_configs(&self, pod: &Pod) -> Vec<ConfigHolder> {
        let mut holders = Vec::new();

        debug!(
            "build_module_configs - entering pod {} for annotations builder",
            pod::pod_name(pod)
        );

        let ip = pod::pod_ip(pod).unwrap_or_default();
        if ip.is_empty() {
            return holders;
        }

        let hosts = self.endpoints(pod, ip);
        if hosts.is_empty() {
            return holders;
        }

        let Some(module) = self.annotation(pod, METRIC_TYPE) else {
            return holders;
        };

        let metricsets = self.metricsets(pod, &module);
        if metricsets.is_empty() {
            return holders;
        }

        let namespace = self.annotation(pod, NAMESPACE).unwrap_or_default();
        if namespace_required(&module) && namespace.is_empty() {
            return holders;
        }

        let mut module_config = config::empty();
        config::set(&mut module_config, "module", Value::String(module));
        config::set(
            &mut module_config,
            "metricsets",
            Value::Sequence(metricsets.into_iter().map(Value::String).collect()),
        );
        config::set(
            &mut module_config,
            "hosts",
            Value::Sequence(hosts.iter().cloned().map(Value::String).collect()),
        );
        config::set(
            &mut module_config,
            "timeout",
            Value::String(self.duration(pod, TIMEOUT, DEFAULT_TIMEOUT)),
        );
        config::set(
            &mut module_config,
            "period",
            Value::String(self.duration(pod, INTERVAL, DEFAULT_INTERVAL)),
        );
        config::set(&mut module_config, "enabled", Value::Bool(true));
        if !namespace.is_empty() {
            config::set(&mut module_config, "namespace", Value::String(namespace));
        }

        if self.insecure_skip_verify(pod) {
            let mut ssl = config::empty();
            config::set(
                &mut ssl,
                "verification_mode",
                Value::String("none".to_string()),
            );
            config::set(&mut module_config, "ssl", ssl);
        }

        if let Some(enrichment) = self.meta.get_metadata(&hosts[0]) {
            config::set(&mut module_config, "fields", enrichment);
            config::set(&mut module_config, "fields_under_root", Value::Bool(true));
        }

        debug!(
            "build_module_configs - config for pod {} is {:?}",
            pod::pod_name(pod),
            module_config
        );
        holders.push(ConfigHolder::new(module_config));
        holders
    }
}

impl PodAnnotationBuilder {
    fn annotation(&self, pod: &Pod, key: &str) -> Option<String> {
        pod::get_annotation_with_prefix(pod, &self.prefix, key)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    /// The pod IP, optionally scheme-prefixed, concatenated with every
    /// endpoint suffix listed in the annotations.
    fn endpoints(&self, pod: &Pod, ip: &str) -> Vec<String> {
        let Some(endpoints) = self.annotation(pod, ENDPOINTS) else {
            return Vec::new();
        };
        let host = match self.annotation(pod, SCHEME) {
            Some(scheme) => format!("{}://{}", scheme, ip),
            None => ip.to_string(),
        };
        endpoints
            .split(',')
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
            .map(|endpoint| format!("{}{}", host, endpoint))
            .collect()
    }

    fn metricsets(&self, pod: &Pod, module: &str) -> Vec<String> {
        match self.annotation(pod, METRICSETS) {
            Some(metricsets) => metricsets
                .split(',')
                .map(str::trim)
                .filter(|set| !set.is_empty())
                .map(str::to_string)
                .collect(),
            None if module == "prometheus" => vec!["collector".to_string()],
            None => registered_metricsets(module),
        }
    }

    fn duration(&self, pod: &Pod, key: &str, default: &str) -> String {
        match self.annotation(pod, key) {
            Some(value) => {
                if humantime::parse_duration(&value).is_err() {
                    warn!(
                        "build_module_configs - invalid {} duration {:?} on pod {}, using {}",
                        key,
                        value,
                        pod::pod_name(pod),
                        default
                    );
                    return default.to_string();
                }
                value
            }
            None => default.to_string(),
        }
    }

    fn insecure_skip_verify(&self, pod: &Pod) -> bool {
        self.annotation(pod, INSECURE_SKIP_VERIFY)
            .and_then(|value| value.parse().ok())
            .unwrap_or(false)
    }
}

fn namespace_required(module: &str) -> bool {
    NAMESPACE_REQUIRED_MODULES.contains(&module)
}

/// The stock metricset list per module, used when the annotations don't name
/// any. Modules we don't know about stay empty, which suppresses emission.
fn registered_metricsets(module: &str) -> Vec<String> {
    let sets: &[&str] = match module {
        "prometheus" => &["collector"],
        "jolokia" => &["jmx"],
        "dropwizard" => &["collector"],
        "http" => &["json"],
        "graphite" => &["server"],
        "apache" => &["status"],
        "nginx" => &["stubstatus"],
        "redis" => &["info", "keyspace"],
        "mysql" => &["status"],
        "mongodb" => &["dbstats", "status"],
        "zookeeper" => &["mntr"],
        "kafka" => &["consumergroup", "partition"],
        _ => &[],
    };
    sets.iter().map(|set| set.to_string()).collect()
}
