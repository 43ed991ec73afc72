use collectbeat_shared::config::{self, ConfigHolder, Document};
use collectbeat_shared::k8s::pod;
use k8s_openapi::api::core::v1::Pod;
use log::{debug, error};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::builder::{Builder, ClientInfo, MetadataProvider, PushBuilder};
use crate::error::Error;

pub const GRAPHITE_ANNOTATIONS_BUILDER: &str = "graphite_annotations";

const DELIMITER: &str = "delimiter";
const FILTER: &str = "filter";
const NAMESPACE: &str = "namespace";
const TAGS: &str = "tags";
const TEMPLATE: &str = "template";

const DEFAULT_PREFIX: &str = "io.collectbeat.graphite/";
const DEFAULT_DELIMITER: &str = ".";

/// One metric-name template of the graphite server metricset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub namespace: String,
    pub template: String,
    pub filter: String,
    pub delimiter: String,
    pub tags: BTreeMap<String, String>,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        TemplateConfig {
            namespace: String::new(),
            template: String::new(),
            filter: String::new(),
            delimiter: DEFAULT_DELIMITER.to_string(),
            tags: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct GraphiteServerConfig {
    host: String,
    port: u16,
    protocol: String,
    templates: Vec<TemplateConfig>,
}

impl Default for GraphiteServerConfig {
    fn default() -> Self {
        GraphiteServerConfig {
            host: "localhost".to_string(),
            port: 2003,
            protocol: "udp".to_string(),
            templates: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GraphiteAnnotationsConfig {
    prefix: String,
    config: Document,
}

impl Default for GraphiteAnnotationsConfig {
    fn default() -> Self {
        GraphiteAnnotationsConfig {
            prefix: DEFAULT_PREFIX.to_string(),
            config: Value::Null,
        }
    }
}

#[derive(Default)]
struct PodTemplates {
    templates: HashMap<String, TemplateConfig>,
    pods: HashMap<String, Vec<String>>,
}

/// Accumulates graphite metric-name templates across all annotated pods and
/// renders them into one graphite server module config.
pub struct GraphiteAnnotationBuilder {
    prefix: String,
    server_config: GraphiteServerConfig,
    base_templates: HashMap<String, TemplateConfig>,
    state: RwLock<PodTemplates>,
}

pub fn new_builder(
    builder_config: &Document,
    _client: &ClientInfo,
    _meta: Arc<dyn MetadataProvider>,
) -> Result<Builder, Error> {
    let mut cfg: GraphiteAnnotationsConfig = config::unpack(builder_config).map_err(|e| {
        Error::Configuration(format!(
            "failed to unpack the `graphite_annotations` builder configuration: {}",
            e
        ))
    })?;
    if !cfg.prefix.ends_with('/') {
        cfg.prefix.push('/');
    }

    let server_config: GraphiteServerConfig = if cfg.config.is_null() {
        GraphiteServerConfig::default()
    } else {
        config::unpack(&cfg.config).map_err(|e| {
            Error::Configuration(format!(
                "failed to unpack the graphite server configuration: {}",
                e
            ))
        })?
    };
    let base_templates = server_config
        .templates
        .iter()
        .map(|template| (template.filter.clone(), template.clone()))
        .collect();

    Ok(Builder::Push(Box::new(GraphiteAnnotationBuilder {
        prefix: cfg.prefix,
        server_config,
        base_templates,
        state: RwLock::new(PodTemplates::default()),
    })))
}

impl PushBuilder for GraphiteAnnotationBuilder {
    fn name(&self) -> &'static str {
        "Graphite Annotation Builder"
    }

    fn add_module_config(&self, pod: &Pod) -> Option<ConfigHolder> {
        let Some(template) = self.template_from_pod(pod) else {
            return self.module_config();
        };

        if self.base_templates.contains_key(&template.filter) {
            error!(
                "add_module_config - can not register filter that is present in base config {}",
                template.filter
            );
            return self.module_config();
        }

        let pod_ref = pod_ref(pod);
        {
            let mut state = self.state.write().unwrap();
            match state.templates.get(&template.filter) {
                Some(existing) if template_conflicts(existing, &template) => {
                    error!(
                        "add_module_config - can not register a different template for existing filter {}",
                        template.filter
                    );
                }
                _ => {
                    // Covers both the first registration and a pod set left
                    // behind without its template: re-register it.
                    state
                        .templates
                        .insert(template.filter.clone(), template.clone());
                    let pods = state.pods.entry(template.filter.clone()).or_default();
                    if !pods.contains(&pod_ref) {
                        pods.push(pod_ref);
                    }
                }
            }
        }
        self.module_config()
    }

    fn remove_module_config(&self, pod: &Pod) -> Option<ConfigHolder> {
        let Some(template) = self.template_from_pod(pod) else {
            return self.module_config();
        };

        let pod_ref = pod_ref(pod);
        {
            let mut state = self.state.write().unwrap();
            match state.templates.get(&template.filter) {
                Some(existing) if template_conflicts(existing, &template) => {
                    error!(
                        "remove_module_config - can not unregister template as it differs for filter {}",
                        template.filter
                    );
                }
                Some(_) => {
                    if let Some(pods) = state.pods.get_mut(&template.filter) {
                        pods.retain(|existing_ref| existing_ref != &pod_ref);
                        // Drop the template once no pod uses it any more.
                        if pods.is_empty() {
                            state.pods.remove(&template.filter);
                            state.templates.remove(&template.filter);
                        }
                    }
                }
                None => {}
            }
        }
        self.module_config()
    }

    fn module_config(&self) -> Option<ConfigHolder> {
        let mut server_config = self.server_config.clone();
        {
            let state = self.state.read().unwrap();
            let mut registered: Vec<TemplateConfig> =
                state.templates.values().cloned().collect();
            // Deterministic template order keeps the fingerprint stable.
            registered.sort_by(|a, b| a.filter.cmp(&b.filter));
            server_config.templates.extend(registered);
        }

        let mut module_config = match config::pack(&server_config) {
            Ok(doc) => doc,
            Err(e) => {
                error!("module_config - error packing configuration {}", e);
                return None;
            }
        };
        config::set(
            &mut module_config,
            "module",
            Value::String("graphite".to_string()),
        );
        config::set(
            &mut module_config,
            "metricsets",
            Value::Sequence(vec![Value::String("server".to_string())]),
        );
        config::set(&mut module_config, "enabled", Value::Bool(true));
        Some(ConfigHolder::new(module_config))
    }
}

impl GraphiteAnnotationBuilder {
    /// The template a pod's annotations describe. Filter, template and
    /// namespace are all required; pods without an IP are ignored.
    fn template_from_pod(&self, pod: &Pod) -> Option<TemplateConfig> {
        debug!(
            "template_from_pod - entering pod {} for graphite builder",
            pod::pod_name(pod)
        );

        if pod::pod_ip(pod).unwrap_or_default().is_empty() {
            return None;
        }

        let filter = self.annotation(pod, FILTER)?;
        let template = self.annotation(pod, TEMPLATE)?;
        let namespace = self.annotation(pod, NAMESPACE)?;
        let delimiter = self
            .annotation(pod, DELIMITER)
            .unwrap_or_else(|| DEFAULT_DELIMITER.to_string());

        Some(TemplateConfig {
            namespace,
            template,
            filter,
            delimiter,
            tags: self.tags(pod),
        })
    }

    fn annotation(&self, pod: &Pod, key: &str) -> Option<String> {
        pod::get_annotation_with_prefix(pod, &self.prefix, key)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    fn tags(&self, pod: &Pod) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        if let Some(raw) = self.annotation(pod, TAGS) {
            for pair in raw.split(',') {
                if let Some((key, value)) = pair.split_once('=') {
                    tags.insert(key.to_string(), value.to_string());
                }
            }
        }
        tags
    }
}

fn pod_ref(pod: &Pod) -> String {
    format!("{}/{}", pod::pod_namespace(pod), pod::pod_name(pod))
}

fn template_conflicts(existing: &TemplateConfig, incoming: &TemplateConfig) -> bool {
    existing.template != incoming.template
        || existing.namespace != incoming.namespace
        || existing.delimiter != incoming.delimiter
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap as Map;

    fn builder_with_base(yaml: &str) -> GraphiteAnnotationBuilder {
        let cfg: GraphiteAnnotationsConfig =
            config::unpack(&serde_yaml::from_str(yaml).unwrap()).unwrap();
        let server_config: GraphiteServerConfig = if cfg.config.is_null() {
            GraphiteServerConfig::default()
        } else {
            config::unpack(&cfg.config).unwrap()
        };
        let base_templates = server_config
            .templates
            .iter()
            .map(|template| (template.filter.clone(), template.clone()))
            .collect();
        GraphiteAnnotationBuilder {
            prefix: DEFAULT_PREFIX.to_string(),
            server_config,
            base_templates,
            state: RwLock::new(PodTemplates::default()),
        }
    }

    fn builder() -> GraphiteAnnotationBuilder {
        builder_with_base("{}")
    }

    fn make_pod(name: &str, annotations: &[(&str, &str)]) -> Pod {
        let annotations: Map<String, String> = annotations
            .iter()
            .map(|(key, value)| {
                (format!("io.collectbeat.graphite/{}", key), value.to_string())
            })
            .collect();
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            status: Some(PodStatus {
                pod_ip: Some("1.2.3.4".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn graphite_pod(name: &str) -> Pod {
        make_pod(
            name,
            &[
                ("filter", ":foo*"),
                ("template", ".host.shell.metric*"),
                ("namespace", "foo"),
            ],
        )
    }

    fn template_count(holder: &ConfigHolder) -> usize {
        config::get(&holder.config, "templates")
            .and_then(Document::as_sequence)
            .map(Vec::len)
            .unwrap_or_default()
    }

    #[test]
    fn test_add_remove_balance_restores_base_config() {
        let builder = builder();
        let before = builder.module_config().unwrap();
        assert_eq!(template_count(&before), 0);

        let first = graphite_pod("pod-one");
        let second = graphite_pod("pod-two");

        // Two pods sharing one filter with identical templates.
        let after_first = builder.add_module_config(&first).unwrap();
        assert_eq!(template_count(&after_first), 1);
        let after_second = builder.add_module_config(&second).unwrap();
        assert_eq!(template_count(&after_second), 1);

        // Removing one pod keeps the template alive.
        let after_remove = builder.remove_module_config(&first).unwrap();
        assert_eq!(template_count(&after_remove), 1);

        // Removing the last pod drops it and restores the starting config.
        let after_last = builder.remove_module_config(&second).unwrap();
        assert_eq!(template_count(&after_last), 0);
        assert_eq!(after_last.fingerprint(), before.fingerprint());
    }

    #[test]
    fn test_remove_unknown_pod_is_a_noop() {
        let builder = builder();
        let before = builder.module_config().unwrap();
        let after = builder.remove_module_config(&graphite_pod("stranger")).unwrap();
        assert_eq!(after.fingerprint(), before.fingerprint());
    }

    #[test]
    fn test_conflicting_template_is_refused() {
        let builder = builder();
        builder.add_module_config(&graphite_pod("pod-one"));
        let registered = builder.module_config().unwrap();

        let conflicting = make_pod(
            "pod-two",
            &[
                ("filter", ":foo*"),
                ("template", ".different.template*"),
                ("namespace", "foo"),
            ],
        );
        let after = builder.add_module_config(&conflicting).unwrap();
        assert_eq!(after.fingerprint(), registered.fingerprint());

        // The refused pod never joined the set, so the original owner's
        // removal still drops the template.
        let after_remove = builder.remove_module_config(&graphite_pod("pod-one")).unwrap();
        assert_eq!(template_count(&after_remove), 0);
    }

    #[test]
    fn test_base_config_filter_collision_is_refused() {
        let builder = builder_with_base(
            "{config: {templates: [{filter: \":foo*\", template: \".host.metric*\", namespace: base}]}}",
        );
        let before = builder.module_config().unwrap();
        assert_eq!(template_count(&before), 1);

        let after = builder.add_module_config(&graphite_pod("pod-one")).unwrap();
        assert_eq!(after.fingerprint(), before.fingerprint());
    }

    #[test]
    fn test_module_config_shape() {
        let builder = builder();
        builder.add_module_config(&graphite_pod("pod-one"));
        let holder = builder.module_config().unwrap();

        assert_eq!(config::get_str(&holder.config, "module"), Some("graphite"));
        assert_eq!(config::get_str(&holder.config, "protocol"), Some("udp"));
        assert_eq!(
            config::get(&holder.config, "metricsets"),
            Some(&serde_yaml::from_str::<Document>("[server]").unwrap())
        );
        let templates = config::get(&holder.config, "templates").unwrap();
        let template = &templates.as_sequence().unwrap()[0];
        assert_eq!(config::get_str(template, "filter"), Some(":foo*"));
        assert_eq!(config::get_str(template, "delimiter"), Some("."));
    }
}
