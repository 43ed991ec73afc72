use async_trait::async_trait;
use collectbeat_shared::config::{self, ConfigHolder, Document, Enabled, Meta};
use collectbeat_shared::k8s::pod;
use k8s_openapi::api::core::v1::Pod;
use log::debug;
use serde_yaml::Value;
use std::sync::Arc;

use crate::builder::{Builder, ClientInfo, MetadataProvider, PollerBuilder};
use crate::error::Error;

pub const LOG_ANNOTATIONS_BUILDER: &str = "log_annotations";

const NAMESPACE: &str = "namespace";
const PATTERN: &str = "pattern";
const NEGATE: &str = "negate";
const MATCH: &str = "after";
const PATHS: &str = "paths";

const DEFAULT_PREFIX: &str = "io.collectbeat.logs";
const DEFAULT_LOGS_PATH: &str = "/var/lib/docker/containers/";
const DEFAULT_MATCH: &str = "after";

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LogAnnotationsConfig {
    prefix: String,
    base_prospector_config: Document,
    logs_path: String,
    default_namespace: String,
    custom_path: Enabled,
}

impl Default for LogAnnotationsConfig {
    fn default() -> Self {
        LogAnnotationsConfig {
            prefix: DEFAULT_PREFIX.to_string(),
            base_prospector_config: default_base_prospector_config(),
            logs_path: DEFAULT_LOGS_PATH.to_string(),
            default_namespace: String::new(),
            custom_path: Enabled::new(false),
        }
    }
}

fn default_base_prospector_config() -> Document {
    let mut base = config::empty();
    config::set(&mut base, "type", Value::String("log".to_string()));
    config::set(&mut base, "enabled", Value::Bool(true));
    base
}

/// Emits one log prospector config per container, derived from the pod's log
/// annotations. Containers without a container id are skipped.
pub struct PodLogAnnotationBuilder {
    prefix: String,
    logs_path: String,
    default_namespace: String,
    enable_custom_log_path: bool,
    base_config: Document,
}

pub fn new_builder(
    builder_config: &Document,
    _client: &ClientInfo,
    _meta: Arc<dyn MetadataProvider>,
) -> Result<Builder, Error> {
    let cfg: LogAnnotationsConfig = config::unpack(builder_config).map_err(|e| {
        Error::Configuration(format!(
            "fail to unpack the `log_annotations` builder configuration: {}",
            e
        ))
    })?;

    Ok(Builder::Poller(Box::new(PodLogAnnotationBuilder {
        prefix: cfg.prefix,
        logs_path: cfg.logs_path,
        default_namespace: cfg.default_namespace,
        enable_custom_log_path: cfg.custom_path.enabled,
        base_config: cfg.base_prospector_config,
    })))
}

#[async_trait]
impl PollerBuilder for PodLogAnnotationBuilder {
    fn name(&self) -> &'static str {
        "Log Annotation Builder"
    }

    async fn build_module_configs(&self, pod: &Pod) -> Vec<ConfigHolder> {
        let mut holders = Vec::new();

        debug!(
            "build_module_configs - entering pod {} for logs annotations builder",
            pod::pod_name(pod)
        );

        // Don't spin up a prospector unless the pod goes into running state.
        if pod::pod_ip(pod).unwrap_or_default().is_empty()
            && pod::pod_phase(pod) != Some("Running")
        {
            return holders;
        }

        let namespace = self.namespace(pod);

        for container in pod::container_statuses(pod) {
            let Some(cid) = pod::container_id(container) else {
                continue;
            };
            let name = container.name.as_str();

            let mut prospector = self.base_config.clone();
            let mut meta = Meta::new();
            let stdout_path = format!("{}{}/*.log", self.logs_path, cid);

            let custom_paths = if self.enable_custom_log_path {
                self.paths(pod, name)
            } else {
                Vec::new()
            };

            if let Some(pattern) = self.annotation(pod, PATTERN, name) {
                set_multiline(
                    &mut prospector,
                    pattern,
                    self.negate(pod, name),
                    self.match_mode(pod, name),
                );
            }

            if custom_paths.is_empty() {
                // Stdout capture: the runtime writes JSON lines.
                set_json_decode(&mut prospector);
                set_paths(&mut prospector, vec![stdout_path]);
            } else {
                set_paths(&mut prospector, custom_paths.clone());
                meta.insert(cid.to_string(), custom_paths);
            }

            if !namespace.is_empty() {
                set_namespace(&mut prospector, &namespace);
            }

            debug!(
                "build_module_configs - config for pod {}, container {} is {:?}",
                pod::pod_name(pod),
                name,
                prospector
            );
            holders.push(ConfigHolder::with_meta(prospector, meta));
        }

        holders
    }
}

impl PodLogAnnotationBuilder {
    /// Container-scoped annotation (`{prefix}.{container}/{key}`) first,
    /// global (`{prefix}/{key}`) second.
    fn annotation(&self, pod: &Pod, key: &str, container: &str) -> Option<String> {
        let scoped = format!("{}.{}/", self.prefix, container);
        pod::get_annotation_with_prefix(pod, &scoped, key)
            .or_else(|| {
                pod::get_annotation_with_prefix(pod, &format!("{}/", self.prefix), key)
            })
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    fn namespace(&self, pod: &Pod) -> String {
        pod::get_annotation_with_prefix(pod, &format!("{}/", self.prefix), NAMESPACE)
            .filter(|value| !value.is_empty())
            .unwrap_or(self.default_namespace.as_str())
            .to_string()
    }

    fn negate(&self, pod: &Pod, container: &str) -> bool {
        self.annotation(pod, NEGATE, container)
            .and_then(|value| value.parse().ok())
            .unwrap_or(false)
    }

    fn match_mode(&self, pod: &Pod, container: &str) -> String {
        self.annotation(pod, MATCH, container)
            .unwrap_or_else(|| DEFAULT_MATCH.to_string())
    }

    fn paths(&self, pod: &Pod, container: &str) -> Vec<String> {
        self.annotation(pod, PATHS, container)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|path| !path.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn set_paths(prospector: &mut Document, paths: Vec<String>) {
    config::set(
        prospector,
        "paths",
        Value::Sequence(paths.into_iter().map(Value::String).collect()),
    );
}

fn set_multiline(prospector: &mut Document, pattern: String, negate: bool, match_mode: String) {
    let mut multiline = config::empty();
    config::set(&mut multiline, "pattern", Value::String(pattern));
    config::set(&mut multiline, "negate", Value::Bool(negate));
    config::set(&mut multiline, "match", Value::String(match_mode));
    config::set(prospector, "multiline", multiline);
}

fn set_json_decode(prospector: &mut Document) {
    let mut json = config::empty();
    config::set(&mut json, "message_key", Value::String("log".to_string()));
    config::set(&mut json, "keys_under_root", Value::Bool(true));
    config::set(prospector, "json", json);
}

fn set_namespace(prospector: &mut Document, namespace: &str) {
    let mut fields = config::empty();
    config::set(
        &mut fields,
        "namespace",
        Value::String(namespace.to_string()),
    );
    config::set(prospector, "fields", fields);
    config::set(prospector, "fields_under_root", Value::Bool(true));
}
