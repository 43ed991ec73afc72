use k8s_openapi::api::core::v1::{ContainerStatus, Pod};

/// Look up an annotation by its full key.
pub fn get_annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()?
        .get(key)
        .map(String::as_str)
}

/// Look up an annotation under a builder's annotation prefix.
pub fn get_annotation_with_prefix<'a>(pod: &'a Pod, prefix: &str, key: &str) -> Option<&'a str> {
    get_annotation(pod, &format!("{}{}", prefix, key))
}

pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.pod_ip.as_deref()
}

pub fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

pub fn pod_uid(pod: &Pod) -> Option<&str> {
    pod.metadata.uid.as_deref()
}

pub fn pod_resource_version(pod: &Pod) -> Option<&str> {
    pod.metadata.resource_version.as_deref()
}

pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

pub fn pod_namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or("default")
}

pub fn pod_node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref()?.node_name.as_deref()
}

/// A deletion timestamp marks the pod as terminating.
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

pub fn container_statuses(pod: &Pod) -> &[ContainerStatus] {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_deref())
        .unwrap_or_default()
}

/// The container id without its `<runtime>//` prefix, e.g. `docker://123`
/// becomes `123`. Statuses without a well-formed id yield nothing.
pub fn container_id(status: &ContainerStatus) -> Option<&str> {
    let raw = status.container_id.as_deref()?;
    match raw.split_once("//") {
        Some((_, id)) if !id.is_empty() => Some(id),
        _ => None,
    }
}

/// Declared container ports, used to key the watcher's enrichment table.
pub fn container_ports(pod: &Pod) -> Vec<i32> {
    pod.spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .flat_map(|container| container.ports.as_deref().unwrap_or_default())
                .map(|port| port.container_port)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn make_pod() -> Pod {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "io.collectbeat.metrics/type".to_string(),
            "prometheus".to_string(),
        );
        Pod {
            metadata: ObjectMeta {
                name: Some("metrics-pod".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "metrics".to_string(),
                    ports: Some(vec![ContainerPort {
                        container_port: 8080,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: Some("1.2.3.4".to_string()),
                phase: Some("Running".to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "metrics".to_string(),
                    container_id: Some("docker://1234abcd".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_annotation_lookup() {
        let pod = make_pod();
        assert_eq!(
            get_annotation_with_prefix(&pod, "io.collectbeat.metrics/", "type"),
            Some("prometheus")
        );
        assert_eq!(
            get_annotation_with_prefix(&pod, "io.collectbeat.metrics/", "endpoints"),
            None
        );
    }

    #[test]
    fn test_pod_accessors() {
        let pod = make_pod();
        assert_eq!(pod_ip(&pod), Some("1.2.3.4"));
        assert_eq!(pod_phase(&pod), Some("Running"));
        assert_eq!(pod_name(&pod), "metrics-pod");
        assert_eq!(pod_namespace(&pod), "default");
        assert!(!is_terminating(&pod));
        assert_eq!(container_ports(&pod), vec![8080]);
    }

    #[test]
    fn test_container_id_strips_runtime_prefix() {
        let pod = make_pod();
        let statuses = container_statuses(&pod);
        assert_eq!(statuses.len(), 1);
        assert_eq!(container_id(&statuses[0]), Some("1234abcd"));

        let bare = ContainerStatus {
            container_id: Some("not-prefixed".to_string()),
            ..Default::default()
        };
        assert_eq!(container_id(&bare), None);

        let missing = ContainerStatus::default();
        assert_eq!(container_id(&missing), None);
    }
}
