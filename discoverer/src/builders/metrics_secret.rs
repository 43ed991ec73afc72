use async_trait::async_trait;
use collectbeat_shared::config::{self, ConfigHolder, Document};
use collectbeat_shared::k8s::{pod, KubeInterface};
use k8s_openapi::api::core::v1::Pod;
use log::{debug, error};
use serde_yaml::Value;
use std::sync::Arc;

use crate::builder::{Builder, ClientInfo, MetadataProvider, PollerBuilder};
use crate::error::Error;

pub const METRICS_SECRET_BUILDER: &str = "metrics_secret";

const SECRET_NAME: &str = "config";
const MODULES_KEY: &str = "modules";
const HOST_TOKEN: &str = "$HOST";

const DEFAULT_PREFIX: &str = "io.collectbeat.metrics/";
const DEFAULT_INTERVAL: &str = "1m";
const DEFAULT_TIMEOUT: &str = "3s";

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MetricsSecretConfig {
    prefix: String,
}

impl Default for MetricsSecretConfig {
    fn default() -> Self {
        MetricsSecretConfig {
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

/// Resolves a pod's `config` annotation to a Secret holding full module
/// configs, substitutes the pod IP for the `$HOST` token and emits one holder
/// per module.
pub struct SecretBuilder {
    prefix: String,
    kube: Arc<dyn KubeInterface>,
    meta: Arc<dyn MetadataProvider>,
}

pub fn new_builder(
    builder_config: &Document,
    client: &ClientInfo,
    meta: Arc<dyn MetadataProvider>,
) -> Result<Builder, Error> {
    let mut cfg: MetricsSecretConfig = config::unpack(builder_config).map_err(|e| {
        Error::Configuration(format!(
            "fail to unpack the `metrics_secret` builder configuration: {}",
            e
        ))
    })?;
    if !cfg.prefix.ends_with('/') {
        cfg.prefix.push('/');
    }

    Ok(Builder::Poller(Box::new(SecretBuilder {
        prefix: cfg.prefix,
        kube: client.kube.clone(),
        meta,
    })))
}

#[async_trait]
impl PollerBuilder for SecretBuilder {
    fn name(&self) -> &'static str {
        "Secret Builder"
    }

    async fn build_module_configs(&self, pod: &Pod) -> Vec<ConfigHolder> {
        let mut holders = Vec::new();

        let ip = pod::pod_ip(pod).unwrap_or_default();
        if ip.is_empty() {
            return holders;
        }

        let Some(secret_name) =
            pod::get_annotation_with_prefix(pod, &self.prefix, SECRET_NAME)
                .filter(|name| !name.is_empty())
        else {
            return holders;
        };
        let namespace = pod::pod_namespace(pod);

        let secret = match self.kube.find_secret(secret_name, namespace).await {
            Ok(secret) => secret,
            Err(e) => {
                error!(
                    "build_module_configs - unable to get secret {} from namespace {}: {}",
                    secret_name, namespace, e
                );
                return holders;
            }
        };

        let Some(modules_yaml) = secret
            .data
            .as_ref()
            .and_then(|data| data.get(MODULES_KEY))
        else {
            return holders;
        };

        let modules: Document = match serde_yaml::from_slice(&modules_yaml.0) {
            Ok(modules) => modules,
            Err(e) => {
                error!(
                    "build_module_configs - unable to parse `modules` from secret {}: {}",
                    secret_name, e
                );
                return holders;
            }
        };
        let Some(modules) = modules.as_sequence() else {
            error!(
                "build_module_configs - `modules` in secret {} must be a list",
                secret_name
            );
            return holders;
        };

        for module in modules {
            let mut module_config = module.clone();
            apply_host(&mut module_config, ip);
            apply_default(&mut module_config, "period", DEFAULT_INTERVAL);
            apply_default(&mut module_config, "timeout", DEFAULT_TIMEOUT);

            if let Some(enrichment) = first_host(&module_config)
                .and_then(|host| self.meta.get_metadata(&host))
            {
                config::set(&mut module_config, "fields", enrichment);
                config::set(&mut module_config, "fields_under_root", Value::Bool(true));
            }

            debug!(
                "build_module_configs - secret config for pod {} is {:?}",
                pod::pod_name(pod),
                module_config
            );
            holders.push(ConfigHolder::new(module_config));
        }
        holders
    }
}

/// Substitute the first `$HOST` token of every hosts entry with the pod IP.
fn apply_host(module_config: &mut Document, ip: &str) {
    let Some(hosts) = config::get(module_config, "hosts").cloned() else {
        return;
    };
    let Some(hosts) = hosts.as_sequence() else {
        return;
    };
    let substituted: Vec<Value> = hosts
        .iter()
        .map(|host| match host.as_str() {
            Some(host) => Value::String(host.replacen(HOST_TOKEN, ip, 1)),
            None => host.clone(),
        })
        .collect();
    config::set(module_config, "hosts", Value::Sequence(substituted));
}

fn apply_default(module_config: &mut Document, key: &str, default: &str) {
    if config::get(module_config, key).is_none() {
        config::set(module_config, key, Value::String(default.to_string()));
    }
}

fn first_host(module_config: &Document) -> Option<String> {
    config::get(module_config, "hosts")?
        .as_sequence()?
        .first()?
        .as_str()
        .map(str::to_string)
}
